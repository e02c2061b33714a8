pub mod ports;

pub use ports::{PortHandle, PortHandlers, PortMap, PortSetupError};
