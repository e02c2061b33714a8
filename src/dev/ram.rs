use std::any::Any;

use crate::dev::{DevId, Device};
use crate::machine::Machine;
use crate::mem::{Backing, MemHandlers, SetupError};

/// Base 640 KiB boundary. RAM above it is left to adapters and the BIOS.
pub const CONVENTIONAL_LIMIT: u32 = 0xa0000;

pub struct Ram {
    size: u32,
}

impl Ram {
    /// Installs system RAM starting at physical 0. The map owns the bytes;
    /// this device owns the mapping.
    pub fn install(m: &mut Machine, size: u32) -> Result<DevId, SetupError> {
        let size = size.min(CONVENTIONAL_LIMIT).min(m.mem.ram().len() as u32);
        let id = m.devices.add(Box::new(Ram { size }));
        m.mem
            .register(0, size, MemHandlers::NONE, Backing::Ram { off: 0 }, id)?;
        log::info!("ram: {} KiB conventional", size / 1024);
        Ok(id)
    }

    pub fn size(&self) -> u32 {
        self.size
    }
}

impl Device for Ram {
    fn name(&self) -> &'static str {
        "ram"
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
