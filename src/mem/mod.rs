pub mod map;

pub use map::{Access, Backing, MapHandle, MemHandlers, MemoryMap, SetupError, PAGE_SHIFT, PAGE_SIZE};
