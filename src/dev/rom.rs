use std::any::Any;
use std::sync::Arc;

use thiserror::Error;

use crate::dev::{DevId, Device};
use crate::machine::Machine;
use crate::mem::{Backing, MemHandlers, SetupError};

#[derive(Debug, Error)]
pub enum RomError {
    #[error("bios image is empty")]
    Empty,
    #[error("bios image of {0:#x} bytes does not fit under 1 MiB")]
    TooBig(usize),
    #[error(transparent)]
    Setup(#[from] SetupError),
}

/// BIOS ROM mapped so its last byte sits at the top of the first
/// megabyte, putting the entry point under the FFFF:0000 reset vector.
pub struct Bios {
    base: u32,
    image: Arc<[u8]>,
}

impl Bios {
    pub fn install(m: &mut Machine, image: Vec<u8>) -> Result<DevId, RomError> {
        if image.is_empty() {
            return Err(RomError::Empty);
        }
        if image.len() > 0x100000 {
            return Err(RomError::TooBig(image.len()));
        }
        let base = 0x100000 - image.len() as u32;
        let image: Arc<[u8]> = image.into();
        let id = m.devices.add(Box::new(Bios {
            base,
            image: image.clone(),
        }));
        m.mem.register(
            base,
            image.len() as u32,
            MemHandlers::NONE,
            Backing::Rom(image.clone()),
            id,
        )?;
        log::info!("bios: {} KiB at {base:#x}", image.len() / 1024);
        Ok(id)
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn image(&self) -> &Arc<[u8]> {
        &self.image
    }
}

impl Device for Bios {
    fn name(&self) -> &'static str {
        "bios"
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
