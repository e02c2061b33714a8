use thiserror::Error;

use crate::dev::DevId;
use crate::machine::Machine;

pub type PortReadB = fn(&mut Machine, u16, DevId) -> u8;
pub type PortReadW = fn(&mut Machine, u16, DevId) -> u16;
pub type PortReadL = fn(&mut Machine, u16, DevId) -> u32;
pub type PortWriteB = fn(&mut Machine, u16, u8, DevId);
pub type PortWriteW = fn(&mut Machine, u16, u16, DevId);
pub type PortWriteL = fn(&mut Machine, u16, u32, DevId);

#[derive(Debug, Clone, Copy, Default)]
pub struct PortHandlers {
    pub read_b: Option<PortReadB>,
    pub read_w: Option<PortReadW>,
    pub read_l: Option<PortReadL>,
    pub write_b: Option<PortWriteB>,
    pub write_w: Option<PortWriteW>,
    pub write_l: Option<PortWriteL>,
}

impl PortHandlers {
    pub const NONE: PortHandlers = PortHandlers {
        read_b: None,
        read_w: None,
        read_l: None,
        write_b: None,
        write_w: None,
        write_l: None,
    };

    fn any_read(&self) -> bool {
        self.read_b.is_some() || self.read_w.is_some() || self.read_l.is_some()
    }

    fn any_write(&self) -> bool {
        self.write_b.is_some() || self.write_w.is_some() || self.write_l.is_some()
    }
}

#[derive(Debug, Error)]
pub enum PortSetupError {
    #[error("port range length must be nonzero")]
    ZeroLen,
    #[error("port stride must be 1 or 2")]
    BadStride,
    #[error("port range {base:#x} len {len} stride {stride} leaves the 16-bit space")]
    OutOfRange { base: u16, len: u32, stride: u8 },
    #[error("port range has no handlers")]
    NoHandlers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortHandle(u32);

#[derive(Debug, Clone, Copy)]
struct PortEntry {
    base: u16,
    /// Number of decoded ports, not the span in port numbers.
    len: u32,
    /// 1 for contiguous, 2 for odd/even interleave.
    stride: u8,
    enabled: bool,
    dead: bool,
    handlers: PortHandlers,
    dev: DevId,
}

impl PortEntry {
    fn live(&self) -> bool {
        self.enabled && !self.dead
    }

    fn decodes(&self, port: u16) -> bool {
        let off = port.wrapping_sub(self.base) as u32;
        off < self.len * self.stride as u32 && off % self.stride as u32 == 0
    }
}

/// The 16-bit port space. Registration is a flat list scanned in reverse
/// so the latest enabled range claims contested ports; the space is small
/// and sparse enough that no lookup table is kept.
pub struct PortMap {
    entries: Vec<PortEntry>,
}

impl PortMap {
    pub fn new() -> PortMap {
        PortMap {
            entries: Vec::new(),
        }
    }

    pub fn register(
        &mut self,
        base: u16,
        len: u32,
        stride: u8,
        handlers: PortHandlers,
        dev: DevId,
    ) -> Result<PortHandle, PortSetupError> {
        if len == 0 {
            return Err(PortSetupError::ZeroLen);
        }
        if stride != 1 && stride != 2 {
            return Err(PortSetupError::BadStride);
        }
        if base as u64 + (len as u64 - 1) * stride as u64 > 0xffff {
            return Err(PortSetupError::OutOfRange { base, len, stride });
        }
        if !handlers.any_read() && !handlers.any_write() {
            return Err(PortSetupError::NoHandlers);
        }
        self.entries.push(PortEntry {
            base,
            len,
            stride,
            enabled: true,
            dead: false,
            handlers,
            dev,
        });
        Ok(PortHandle((self.entries.len() - 1) as u32))
    }

    pub fn enable(&mut self, h: PortHandle) {
        self.entries[h.0 as usize].enabled = true;
    }

    pub fn disable(&mut self, h: PortHandle) {
        self.entries[h.0 as usize].enabled = false;
    }

    pub fn remove(&mut self, h: PortHandle) {
        let e = &mut self.entries[h.0 as usize];
        e.dead = true;
        e.enabled = false;
    }

    pub fn remove_owned(&mut self, dev: DevId) {
        for e in self.entries.iter_mut() {
            if e.dev == dev && !e.dead {
                e.dead = true;
                e.enabled = false;
            }
        }
    }

    pub fn resolve_read(&self, port: u16) -> Option<(PortHandlers, DevId)> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.live() && e.decodes(port) && e.handlers.any_read())
            .map(|e| (e.handlers, e.dev))
    }

    pub fn resolve_write(&self, port: u16) -> Option<(PortHandlers, DevId)> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.live() && e.decodes(port) && e.handlers.any_write())
            .map(|e| (e.handlers, e.dev))
    }
}

impl Default for PortMap {
    fn default() -> Self {
        PortMap::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_aa(_: &mut Machine, _: u16, _: DevId) -> u8 {
        0xaa
    }

    fn read_bb(_: &mut Machine, _: u16, _: DevId) -> u8 {
        0xbb
    }

    fn sink(_: &mut Machine, _: u16, _: u8, _: DevId) {}

    fn rw(read: PortReadB) -> PortHandlers {
        PortHandlers {
            read_b: Some(read),
            write_b: Some(sink),
            ..PortHandlers::NONE
        }
    }

    #[test]
    fn unclaimed_port_resolves_to_nothing() {
        let m = PortMap::new();
        assert!(m.resolve_read(0x80).is_none());
        assert!(m.resolve_write(0x80).is_none());
    }

    #[test]
    fn latest_registration_wins() {
        let mut m = PortMap::new();
        m.register(0x3f8, 8, 1, rw(read_aa), DevId::NONE).unwrap();
        let h = m.register(0x3f8, 8, 1, rw(read_bb), DevId::NONE).unwrap();

        let (got, _) = m.resolve_read(0x3f8).unwrap();
        assert_eq!(got.read_b.unwrap() as usize, read_bb as usize);

        m.disable(h);
        let (got, _) = m.resolve_read(0x3f8).unwrap();
        assert_eq!(got.read_b.unwrap() as usize, read_aa as usize);
    }

    #[test]
    fn stride_two_decodes_every_other_port() {
        let mut m = PortMap::new();
        m.register(0x1f0, 4, 2, rw(read_aa), DevId::NONE).unwrap();
        assert!(m.resolve_read(0x1f0).is_some());
        assert!(m.resolve_read(0x1f1).is_none());
        assert!(m.resolve_read(0x1f2).is_some());
        assert!(m.resolve_read(0x1f6).is_some());
        assert!(m.resolve_read(0x1f8).is_none());
    }

    #[test]
    fn read_only_range_ignores_writes() {
        let mut m = PortMap::new();
        let handlers = PortHandlers {
            read_b: Some(read_aa),
            ..PortHandlers::NONE
        };
        m.register(0x60, 1, 1, handlers, DevId::NONE).unwrap();
        assert!(m.resolve_read(0x60).is_some());
        assert!(m.resolve_write(0x60).is_none());
    }

    #[test]
    fn remove_owned_sweeps() {
        let mut m = PortMap::new();
        let dev = DevId::new_for_test(3);
        m.register(0x70, 2, 1, rw(read_aa), dev).unwrap();
        m.register(0x80, 1, 1, rw(read_aa), dev).unwrap();
        m.remove_owned(dev);
        assert!(m.resolve_read(0x70).is_none());
        assert!(m.resolve_read(0x80).is_none());
    }

    #[test]
    fn rejects_bad_registrations() {
        let mut m = PortMap::new();
        assert!(matches!(
            m.register(0, 0, 1, rw(read_aa), DevId::NONE),
            Err(PortSetupError::ZeroLen)
        ));
        assert!(matches!(
            m.register(0, 1, 3, rw(read_aa), DevId::NONE),
            Err(PortSetupError::BadStride)
        ));
        assert!(matches!(
            m.register(0xfffe, 4, 1, rw(read_aa), DevId::NONE),
            Err(PortSetupError::OutOfRange { .. })
        ));
        assert!(matches!(
            m.register(0x10, 1, 1, PortHandlers::NONE, DevId::NONE),
            Err(PortSetupError::NoHandlers)
        ));
    }
}
