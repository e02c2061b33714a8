pub mod decode;
pub mod exec;
pub mod flags;
pub mod interrupt;
pub mod state;

pub use state::{Cpu, Width};

/// Guest-visible processor faults. Delivered through the IVT, never to the
/// host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Divide,
    InvalidOpcode,
}

impl Fault {
    pub fn vector(self) -> u8 {
        match self {
            Fault::Divide => 0,
            Fault::InvalidOpcode => 6,
        }
    }
}
