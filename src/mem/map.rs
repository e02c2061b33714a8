use std::sync::Arc;

use thiserror::Error;

use crate::dev::DevId;
use crate::machine::Machine;

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u32 = 1 << PAGE_SHIFT;

pub type MemReadB = fn(&mut Machine, u32, DevId) -> u8;
pub type MemReadW = fn(&mut Machine, u32, DevId) -> u16;
pub type MemReadL = fn(&mut Machine, u32, DevId) -> u32;
pub type MemWriteB = fn(&mut Machine, u32, u8, DevId);
pub type MemWriteW = fn(&mut Machine, u32, u16, DevId);
pub type MemWriteL = fn(&mut Machine, u32, u32, DevId);

/// Per-width handler set for a mapping. Any subset may be present; missing
/// widths are synthesized from the ones that exist at dispatch time.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemHandlers {
    pub read_b: Option<MemReadB>,
    pub read_w: Option<MemReadW>,
    pub read_l: Option<MemReadL>,
    pub write_b: Option<MemWriteB>,
    pub write_w: Option<MemWriteW>,
    pub write_l: Option<MemWriteL>,
}

impl MemHandlers {
    pub const NONE: MemHandlers = MemHandlers {
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

/// Direct byte storage behind a mapping, bypassing handlers on the fast
/// path. `Ram` offsets index the map-owned allocation so several mappings
/// (shadow windows, remapped banks) can alias the same bytes.
#[derive(Debug, Clone)]
pub enum Backing {
    None,
    Ram { off: u32 },
    Rom(Arc<[u8]>),
}

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("mapping size must be nonzero")]
    ZeroSize,
    #[error("mapping {base:#x}+{size:#x} exceeds the {limit:#x} address space")]
    OutOfRange { base: u32, size: u32, limit: u32 },
    #[error("ram backing {off:#x}+{size:#x} exceeds the {limit:#x} allocation")]
    RamOutOfRange { off: u32, size: u32, limit: u32 },
    #[error("rom backing is empty")]
    EmptyRom,
    #[error("mapping has neither backing nor handlers")]
    NoTarget,
}

/// Opaque ticket for a registered mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapHandle(u32);

#[derive(Debug, Clone)]
struct Mapping {
    base: u32,
    size: u32,
    enabled: bool,
    dead: bool,
    handlers: MemHandlers,
    backing: Backing,
    dev: DevId,
}

impl Mapping {
    fn live(&self) -> bool {
        self.enabled && !self.dead && self.size != 0
    }

    fn contains(&self, addr: u32) -> bool {
        addr.wrapping_sub(self.base) < self.size
    }

    fn covers(&self, addr: u32, n: u32) -> bool {
        let off = addr.wrapping_sub(self.base);
        off < self.size && self.size - off >= n
    }

    fn can_read(&self) -> bool {
        !matches!(self.backing, Backing::None) || self.handlers.any_read()
    }

    fn can_write(&self) -> bool {
        matches!(self.backing, Backing::Ram { .. }) || self.handlers.any_write()
    }
}

/// One resolved access. `Backing` carries the mapping index whose storage
/// the caller reads or writes directly; `Handler` hands back the fn table
/// to dispatch through. `Split` means the range is not serviceable as one
/// unit and must be retried bytewise.
#[derive(Debug, Clone, Copy)]
pub enum Access {
    Backing(usize),
    Handler(MemHandlers, DevId),
    OpenBus,
    Split,
}

enum Deferred {
    SetAddr(MapHandle, u32, u32),
    Enable(MapHandle),
    Disable(MapHandle),
    Remove(MapHandle),
}

/// Physical address space: a registration-ordered mapping list with a
/// page-granular lookup table rebuilt on every topology change. Within a
/// page the latest-registered enabled mapping wins; bytes the table winner
/// does not cover fall back to a reverse scan of the list so overlap
/// boundaries stay byte-exact.
pub struct MemoryMap {
    ram: Vec<u8>,
    mappings: Vec<Mapping>,
    read_map: Vec<u16>,
    write_map: Vec<u16>,

    page_gen: Vec<u32>,
    code_present: Vec<bool>,

    limit: u32,

    defer_depth: u32,
    deferred: Vec<Deferred>,
}

impl MemoryMap {
    pub fn new(ram_size: u32, addr_space: u32) -> MemoryMap {
        let pages = (addr_space >> PAGE_SHIFT) as usize;
        MemoryMap {
            ram: vec![0; ram_size as usize],
            mappings: Vec::new(),
            read_map: vec![0; pages],
            write_map: vec![0; pages],
            page_gen: vec![0; pages],
            code_present: vec![false; pages],
            limit: addr_space,
            defer_depth: 0,
            deferred: Vec::new(),
        }
    }

    pub fn ram(&self) -> &[u8] {
        &self.ram
    }

    pub fn ram_mut(&mut self) -> &mut [u8] {
        &mut self.ram
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Registers a mapping, enabled, with the highest priority so far.
    pub fn register(
        &mut self,
        base: u32,
        size: u32,
        handlers: MemHandlers,
        backing: Backing,
        dev: DevId,
    ) -> Result<MapHandle, SetupError> {
        if size == 0 {
            return Err(SetupError::ZeroSize);
        }
        if base as u64 + size as u64 > self.limit as u64 {
            return Err(SetupError::OutOfRange {
                base,
                size,
                limit: self.limit,
            });
        }
        match &backing {
            Backing::Ram { off } => {
                if *off as u64 + size as u64 > self.ram.len() as u64 {
                    return Err(SetupError::RamOutOfRange {
                        off: *off,
                        size,
                        limit: self.ram.len() as u32,
                    });
                }
            }
            Backing::Rom(rom) => {
                if rom.is_empty() {
                    return Err(SetupError::EmptyRom);
                }
            }
            Backing::None => {
                if !handlers.any_read() && !handlers.any_write() {
                    return Err(SetupError::NoTarget);
                }
            }
        }

        self.mappings.push(Mapping {
            base,
            size,
            enabled: true,
            dead: false,
            handlers,
            backing,
            dev,
        });
        let h = MapHandle((self.mappings.len() - 1) as u32);
        self.recalc();
        Ok(h)
    }

    /// Moves or resizes the window. The new window is checked the same way
    /// `register` checks it, before any deferral, so a rejected move never
    /// reaches the tables.
    pub fn set_addr(&mut self, h: MapHandle, base: u32, size: u32) -> Result<(), SetupError> {
        self.check_window(h, base, size)?;
        if self.defer_depth > 0 {
            self.deferred.push(Deferred::SetAddr(h, base, size));
            return Ok(());
        }
        self.apply_set_addr(h, base, size);
        Ok(())
    }

    fn apply_set_addr(&mut self, h: MapHandle, base: u32, size: u32) {
        let map = &mut self.mappings[h.0 as usize];
        map.base = base;
        map.size = size;
        self.recalc();
    }

    fn check_window(&self, h: MapHandle, base: u32, size: u32) -> Result<(), SetupError> {
        if size == 0 {
            return Err(SetupError::ZeroSize);
        }
        if base as u64 + size as u64 > self.limit as u64 {
            return Err(SetupError::OutOfRange {
                base,
                size,
                limit: self.limit,
            });
        }
        if let Backing::Ram { off } = self.mappings[h.0 as usize].backing {
            if off as u64 + size as u64 > self.ram.len() as u64 {
                return Err(SetupError::RamOutOfRange {
                    off,
                    size,
                    limit: self.ram.len() as u32,
                });
            }
        }
        Ok(())
    }

    pub fn enable(&mut self, h: MapHandle) {
        if self.defer_depth > 0 {
            self.deferred.push(Deferred::Enable(h));
            return;
        }
        let map = &mut self.mappings[h.0 as usize];
        if !map.enabled {
            map.enabled = true;
            self.recalc();
        }
    }

    pub fn disable(&mut self, h: MapHandle) {
        if self.defer_depth > 0 {
            self.deferred.push(Deferred::Disable(h));
            return;
        }
        let map = &mut self.mappings[h.0 as usize];
        if map.enabled {
            map.enabled = false;
            self.recalc();
        }
    }

    /// Tombstones the mapping. Indices of other mappings stay stable.
    pub fn remove(&mut self, h: MapHandle) {
        if self.defer_depth > 0 {
            self.deferred.push(Deferred::Remove(h));
            return;
        }
        let map = &mut self.mappings[h.0 as usize];
        map.dead = true;
        map.enabled = false;
        self.recalc();
    }

    /// Removes every mapping owned by `dev` (device teardown).
    pub fn remove_owned(&mut self, dev: DevId) {
        let mut changed = false;
        for map in self.mappings.iter_mut() {
            if map.dev == dev && !map.dead {
                map.dead = true;
                map.enabled = false;
                changed = true;
            }
        }
        if changed {
            self.recalc();
        }
    }

    /// Marks the start of a dispatch; topology changes requested by the
    /// handler are queued until the matching `defer_end`.
    pub fn defer_begin(&mut self) {
        self.defer_depth += 1;
    }

    pub fn defer_end(&mut self) {
        self.defer_depth -= 1;
        if self.defer_depth > 0 {
            return;
        }
        for op in std::mem::take(&mut self.deferred) {
            match op {
                // checked when queued
                Deferred::SetAddr(h, base, size) => self.apply_set_addr(h, base, size),
                Deferred::Enable(h) => self.enable(h),
                Deferred::Disable(h) => self.disable(h),
                Deferred::Remove(h) => self.remove(h),
            }
        }
    }

    fn recalc(&mut self) {
        for e in self.read_map.iter_mut() {
            *e = 0;
        }
        for e in self.write_map.iter_mut() {
            *e = 0;
        }
        let last_page = (self.limit >> PAGE_SHIFT) as u64;
        for (i, map) in self.mappings.iter().enumerate() {
            if !map.live() {
                continue;
            }
            let first = (map.base >> PAGE_SHIFT) as u64;
            let last = (map.base as u64 + map.size as u64 - 1) >> PAGE_SHIFT;
            for p in first..=last.min(last_page.saturating_sub(1)) {
                if map.can_read() {
                    self.read_map[p as usize] = (i + 1) as u16;
                }
                if map.can_write() {
                    self.write_map[p as usize] = (i + 1) as u16;
                }
            }
        }
    }

    fn access_for(&self, idx: usize, write: bool) -> Access {
        let map = &self.mappings[idx];
        match (&map.backing, write) {
            (Backing::Ram { .. }, _) => Access::Backing(idx),
            (Backing::Rom(_), false) => Access::Backing(idx),
            // ROM writes go through handlers if any (flash), else dropped
            _ => {
                if write && map.handlers.any_write() {
                    Access::Handler(map.handlers, map.dev)
                } else if !write && map.handlers.any_read() {
                    Access::Handler(map.handlers, map.dev)
                } else {
                    Access::OpenBus
                }
            }
        }
    }

    fn scan(&self, addr: u32, write: bool) -> Access {
        for (i, map) in self.mappings.iter().enumerate().rev() {
            if !map.live() || !map.contains(addr) {
                continue;
            }
            if write && !map.can_write() {
                continue;
            }
            if !write && !map.can_read() {
                continue;
            }
            return self.access_for(i, write);
        }
        Access::OpenBus
    }

    /// Resolves an `n`-byte access at `addr`. Returns `Split` when the range
    /// crosses a page or an overlap boundary; the caller then retries one
    /// byte at a time.
    pub fn resolve(&self, addr: u32, n: u32, write: bool) -> Access {
        if addr as u64 + n as u64 > self.limit as u64 {
            return Access::OpenBus;
        }
        if n > 1 && (addr & (PAGE_SIZE - 1)) + n > PAGE_SIZE {
            return Access::Split;
        }

        let page = (addr >> PAGE_SHIFT) as usize;
        let table = if write {
            &self.write_map
        } else {
            &self.read_map
        };
        let e = table[page];
        if e != 0 {
            let idx = (e - 1) as usize;
            if self.mappings[idx].covers(addr, n) {
                return self.access_for(idx, write);
            }
        } else if n == 1 {
            // no live mapping touches this page at all
            return Access::OpenBus;
        }

        if n > 1 {
            return Access::Split;
        }
        self.scan(addr, write)
    }

    pub fn backing_read_b(&self, idx: usize, addr: u32) -> u8 {
        let map = &self.mappings[idx];
        let off = addr.wrapping_sub(map.base);
        match &map.backing {
            Backing::Ram { off: base } => self.ram[(base + off) as usize],
            Backing::Rom(rom) => rom[off as usize % rom.len()],
            Backing::None => 0xff,
        }
    }

    pub fn backing_read_w(&self, idx: usize, addr: u32) -> u16 {
        (self.backing_read_b(idx, addr) as u16)
            | (self.backing_read_b(idx, addr + 1) as u16) << 8
    }

    pub fn backing_read_l(&self, idx: usize, addr: u32) -> u32 {
        (self.backing_read_w(idx, addr) as u32)
            | (self.backing_read_w(idx, addr + 2) as u32) << 16
    }

    pub fn backing_write_b(&mut self, idx: usize, addr: u32, val: u8) {
        let map = &self.mappings[idx];
        let off = addr.wrapping_sub(map.base);
        if let Backing::Ram { off: base } = map.backing {
            self.ram[(base + off) as usize] = val;
        }
    }

    pub fn backing_write_w(&mut self, idx: usize, addr: u32, val: u16) {
        self.backing_write_b(idx, addr, val as u8);
        self.backing_write_b(idx, addr + 1, (val >> 8) as u8);
    }

    pub fn backing_write_l(&mut self, idx: usize, addr: u32, val: u32) {
        self.backing_write_w(idx, addr, val as u16);
        self.backing_write_w(idx, addr + 2, (val >> 16) as u16);
    }

    pub fn page_gen(&self, page: usize) -> u32 {
        self.page_gen[page]
    }

    /// Flags a page as holding translated code so writes to it report back.
    pub fn mark_code(&mut self, page: usize) {
        self.code_present[page] = true;
    }

    /// Bumps the page generation for a store at `addr`. Returns true when
    /// translated code lived there and must be thrown away.
    pub fn note_write(&mut self, addr: u32) -> bool {
        if addr >= self.limit {
            return false;
        }
        let page = (addr >> PAGE_SHIFT) as usize;
        self.page_gen[page] = self.page_gen[page].wrapping_add(1);
        if self.code_present[page] {
            self.code_present[page] = false;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_read(_: &mut Machine, _: u32, _: DevId) -> u8 {
        0xaa
    }

    fn dummy_write(_: &mut Machine, _: u32, _: u8, _: DevId) {}

    fn handlers_rw() -> MemHandlers {
        MemHandlers {
            read_b: Some(dummy_read),
            write_b: Some(dummy_write),
            ..MemHandlers::NONE
        }
    }

    fn map_with_ram() -> (MemoryMap, MapHandle) {
        let mut m = MemoryMap::new(0x10000, 0x100000);
        let h = m
            .register(0, 0x10000, MemHandlers::NONE, Backing::Ram { off: 0 }, DevId::NONE)
            .unwrap();
        (m, h)
    }

    #[test]
    fn unmapped_is_open_bus() {
        let m = MemoryMap::new(0, 0x100000);
        assert!(matches!(m.resolve(0x1234, 1, false), Access::OpenBus));
        assert!(matches!(m.resolve(0x1234, 1, true), Access::OpenBus));
    }

    #[test]
    fn out_of_space_is_open_bus() {
        let (m, _) = map_with_ram();
        assert!(matches!(m.resolve(0x100000, 1, false), Access::OpenBus));
        assert!(matches!(m.resolve(0xfffff, 2, false), Access::OpenBus));
    }

    #[test]
    fn ram_round_trip() {
        let (mut m, _) = map_with_ram();
        match m.resolve(0x1234, 1, true) {
            Access::Backing(idx) => m.backing_write_b(idx, 0x1234, 0x5a),
            other => panic!("{other:?}"),
        }
        match m.resolve(0x1234, 1, false) {
            Access::Backing(idx) => assert_eq!(m.backing_read_b(idx, 0x1234), 0x5a),
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn later_registration_wins() {
        let (mut m, _) = map_with_ram();
        let h = m
            .register(0x1000, 0x1000, handlers_rw(), Backing::None, DevId::NONE)
            .unwrap();
        assert!(matches!(m.resolve(0x1800, 1, false), Access::Handler(..)));
        // below and above the overlay the ram still answers
        assert!(matches!(m.resolve(0x0800, 1, false), Access::Backing(_)));
        assert!(matches!(m.resolve(0x2000, 1, false), Access::Backing(_)));

        m.disable(h);
        assert!(matches!(m.resolve(0x1800, 1, false), Access::Backing(_)));
        m.enable(h);
        assert!(matches!(m.resolve(0x1800, 1, false), Access::Handler(..)));
    }

    #[test]
    fn enable_is_idempotent() {
        let (mut m, _) = map_with_ram();
        let h = m
            .register(0x1000, 0x1000, handlers_rw(), Backing::None, DevId::NONE)
            .unwrap();
        m.enable(h);
        m.enable(h);
        m.disable(h);
        m.disable(h);
        assert!(matches!(m.resolve(0x1800, 1, false), Access::Backing(_)));
    }

    #[test]
    fn overlap_boundary_is_byte_exact() {
        let (mut m, _) = map_with_ram();
        // overlay covering only part of a page
        m.register(0x1100, 0x20, handlers_rw(), Backing::None, DevId::NONE)
            .unwrap();
        assert!(matches!(m.resolve(0x10ff, 1, false), Access::Backing(_)));
        assert!(matches!(m.resolve(0x1100, 1, false), Access::Handler(..)));
        assert!(matches!(m.resolve(0x111f, 1, false), Access::Handler(..)));
        assert!(matches!(m.resolve(0x1120, 1, false), Access::Backing(_)));
    }

    #[test]
    fn straddling_access_splits() {
        let (m, _) = map_with_ram();
        assert!(matches!(m.resolve(0x0fff, 2, false), Access::Split));
        assert!(matches!(m.resolve(0x0ffe, 4, true), Access::Split));
        assert!(matches!(m.resolve(0x0ffe, 2, false), Access::Backing(_)));
    }

    #[test]
    fn rom_reads_but_drops_writes() {
        let mut m = MemoryMap::new(0x10000, 0x100000);
        m.register(0, 0x10000, MemHandlers::NONE, Backing::Ram { off: 0 }, DevId::NONE)
            .unwrap();
        let rom: Arc<[u8]> = vec![0x90; 0x2000].into();
        m.register(0xe000, 0x2000, MemHandlers::NONE, Backing::Rom(rom), DevId::NONE)
            .unwrap();

        assert!(matches!(m.resolve(0xe100, 1, false), Access::Backing(_)));
        // writes bypass the rom overlay and land in the ram underneath
        match m.resolve(0xe100, 1, true) {
            Access::Backing(idx) => {
                m.backing_write_b(idx, 0xe100, 0x77);
            }
            other => panic!("{other:?}"),
        }
        assert_eq!(m.ram()[0xe100], 0x77);
        match m.resolve(0xe100, 1, false) {
            Access::Backing(idx) => assert_eq!(m.backing_read_b(idx, 0xe100), 0x90),
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn shadow_ram_toggles_over_option_rom() {
        // option rom at c0000, shadow ram window over the whole upper area
        let mut m = MemoryMap::new(0x100000, 0x100000);
        let rom: Arc<[u8]> = vec![0x55; 0x4000].into();
        m.register(0xc0000, 0x4000, MemHandlers::NONE, Backing::Rom(rom), DevId::NONE)
            .unwrap();
        let shadow = m
            .register(
                0xc0000,
                0x40000,
                MemHandlers::NONE,
                Backing::Ram { off: 0xc0000 },
                DevId::NONE,
            )
            .unwrap();
        m.disable(shadow);

        let read_at = |m: &MemoryMap, addr: u32| match m.resolve(addr, 1, false) {
            Access::Backing(idx) => m.backing_read_b(idx, addr),
            other => panic!("{other:?}"),
        };

        assert_eq!(read_at(&m, 0xc0000), 0x55);

        m.enable(shadow);
        assert_eq!(read_at(&m, 0xc0000), 0x00);
        match m.resolve(0xc0000, 1, true) {
            Access::Backing(idx) => m.backing_write_b(idx, 0xc0000, 0x12),
            other => panic!("{other:?}"),
        }
        assert_eq!(read_at(&m, 0xc0000), 0x12);

        m.disable(shadow);
        assert_eq!(read_at(&m, 0xc0000), 0x55);
    }

    #[test]
    fn set_addr_moves_the_window() {
        let (mut m, _) = map_with_ram();
        let h = m
            .register(0x4000, 0x1000, handlers_rw(), Backing::None, DevId::NONE)
            .unwrap();
        assert!(matches!(m.resolve(0x4000, 1, false), Access::Handler(..)));
        m.set_addr(h, 0x8000, 0x1000).unwrap();
        assert!(matches!(m.resolve(0x4000, 1, false), Access::Backing(_)));
        assert!(matches!(m.resolve(0x8000, 1, false), Access::Handler(..)));
    }

    #[test]
    fn set_addr_rejects_windows_past_the_backing() {
        let mut m = MemoryMap::new(0x1000, 0x100000);
        let h = m
            .register(0, 0x1000, MemHandlers::NONE, Backing::Ram { off: 0 }, DevId::NONE)
            .unwrap();
        assert!(matches!(
            m.set_addr(h, 0, 0x2000),
            Err(SetupError::RamOutOfRange { .. })
        ));
        assert!(matches!(
            m.set_addr(h, 0xfff00, 0x1000),
            Err(SetupError::OutOfRange { .. })
        ));
        assert!(matches!(m.set_addr(h, 0, 0), Err(SetupError::ZeroSize)));
        // a rejected move leaves the old window untouched
        assert!(matches!(m.resolve(0x800, 1, false), Access::Backing(_)));
        assert!(matches!(m.resolve(0x1800, 1, false), Access::OpenBus));
    }

    #[test]
    fn topology_changes_defer_during_dispatch() {
        let (mut m, _) = map_with_ram();
        let h = m
            .register(0x4000, 0x1000, handlers_rw(), Backing::None, DevId::NONE)
            .unwrap();
        m.defer_begin();
        m.disable(h);
        // still visible while the dispatch is in flight
        assert!(matches!(m.resolve(0x4000, 1, false), Access::Handler(..)));
        m.defer_end();
        assert!(matches!(m.resolve(0x4000, 1, false), Access::Backing(_)));
    }

    #[test]
    fn remove_owned_sweeps_device_mappings() {
        let (mut m, _) = map_with_ram();
        let dev = DevId::new_for_test(7);
        m.register(0x4000, 0x1000, handlers_rw(), Backing::None, dev)
            .unwrap();
        m.register(0x6000, 0x1000, handlers_rw(), Backing::None, dev)
            .unwrap();
        m.remove_owned(dev);
        assert!(matches!(m.resolve(0x4000, 1, false), Access::Backing(_)));
        assert!(matches!(m.resolve(0x6000, 1, false), Access::Backing(_)));
    }

    #[test]
    fn note_write_reports_code_pages_once() {
        let (mut m, _) = map_with_ram();
        let g0 = m.page_gen(1);
        m.mark_code(1);
        assert!(m.note_write(0x1040));
        assert!(!m.note_write(0x1041));
        assert!(m.page_gen(1) > g0);
    }

    #[test]
    fn rejects_bad_registrations() {
        let mut m = MemoryMap::new(0x1000, 0x100000);
        assert!(matches!(
            m.register(0, 0, handlers_rw(), Backing::None, DevId::NONE),
            Err(SetupError::ZeroSize)
        ));
        assert!(matches!(
            m.register(0xfff00, 0x200, handlers_rw(), Backing::None, DevId::NONE),
            Err(SetupError::OutOfRange { .. })
        ));
        assert!(matches!(
            m.register(0, 0x2000, MemHandlers::NONE, Backing::Ram { off: 0 }, DevId::NONE),
            Err(SetupError::RamOutOfRange { .. })
        ));
        assert!(matches!(
            m.register(0, 0x1000, MemHandlers::NONE, Backing::None, DevId::NONE),
            Err(SetupError::NoTarget)
        ));
    }
}
