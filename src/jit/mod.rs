pub mod cache;
pub mod translate;

pub use cache::{Block, BlockCache, PageStamp, MAX_BLOCK_INSNS};
pub use translate::translate;
