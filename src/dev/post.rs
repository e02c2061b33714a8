use std::any::Any;

use crate::dev::{DevId, Device};
use crate::io::{PortHandlers, PortSetupError};
use crate::machine::Machine;

/// POST diagnostic latch at port 0x80. Writes are logged so BIOS progress
/// is visible without a display adapter.
pub struct Post {
    code: u8,
}

impl Post {
    pub fn install(m: &mut Machine) -> Result<DevId, PortSetupError> {
        let id = m.devices.add(Box::new(Post { code: 0 }));
        let handlers = PortHandlers {
            read_b: Some(post_in),
            write_b: Some(post_out),
            ..PortHandlers::NONE
        };
        m.claim_ports(0x80, 1, 1, handlers, id)?;
        Ok(id)
    }

    pub fn code(&self) -> u8 {
        self.code
    }
}

impl Device for Post {
    fn name(&self) -> &'static str {
        "post"
    }

    fn reset(&mut self) {
        self.code = 0;
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

fn post_in(m: &mut Machine, _port: u16, dev: DevId) -> u8 {
    m.devices.downcast_mut::<Post>(dev).map_or(0xff, |p| p.code)
}

fn post_out(m: &mut Machine, _port: u16, val: u8, dev: DevId) {
    if let Some(p) = m.devices.downcast_mut::<Post>(dev) {
        p.code = val;
    }
    log::debug!("post code {val:#04x}");
}
