use hashbrown::HashMap;

use crate::cpu::decode::Insn;
use crate::mem::MemoryMap;

/// Translation stops after this many instructions even without a branch.
pub const MAX_BLOCK_INSNS: usize = 64;

/// Page generation recorded at translation time. The block is stale as
/// soon as the live generation differs.
#[derive(Debug, Clone, Copy)]
pub struct PageStamp {
    pub page: u32,
    pub gen: u32,
}

/// One translated run of straight-line code, keyed by the physical address
/// of its first byte. A block spans at most two pages (the second only when
/// its final instruction straddles the boundary).
pub struct Block {
    pub entry: u32,
    pub byte_len: u32,
    start: u32,
    count: u32,
    pages: [PageStamp; 2],
    npages: u8,
    valid: bool,
    pub cycles: u32,
}

/// Decoded-block cache. Instructions live in one shared arena; eviction is
/// a whole-cache flush when the arena fills, which keeps invalidation
/// bookkeeping trivial at the cost of occasional retranslation.
pub struct BlockCache {
    arena: Vec<Insn>,
    blocks: Vec<Block>,
    index: HashMap<u32, u32>,
    capacity: usize,

    pub translations: u64,
    pub flushes: u64,
    pub invalidations: u64,
}

impl BlockCache {
    pub fn new(capacity_insns: usize) -> BlockCache {
        BlockCache {
            arena: Vec::new(),
            blocks: Vec::new(),
            index: HashMap::new(),
            capacity: capacity_insns.max(MAX_BLOCK_INSNS),
            translations: 0,
            flushes: 0,
            invalidations: 0,
        }
    }

    /// Finds a live block for `phys`, dropping it if any of its pages has
    /// been written since translation.
    pub fn lookup(&mut self, phys: u32, mem: &MemoryMap) -> Option<usize> {
        let bi = *self.index.get(&phys)? as usize;
        let (valid, npages, pages) = {
            let b = &self.blocks[bi];
            (b.valid, b.npages, b.pages)
        };
        if !valid {
            self.index.remove(&phys);
            return None;
        }
        for s in &pages[..npages as usize] {
            if mem.page_gen(s.page as usize) != s.gen {
                self.blocks[bi].valid = false;
                self.index.remove(&phys);
                return None;
            }
        }
        Some(bi)
    }

    pub fn block(&self, bi: usize) -> &Block {
        &self.blocks[bi]
    }

    pub fn ops(&self, bi: usize) -> &[Insn] {
        let b = &self.blocks[bi];
        &self.arena[b.start as usize..(b.start + b.count) as usize]
    }

    pub fn insert(
        &mut self,
        entry: u32,
        byte_len: u32,
        ops: &[Insn],
        stamps: &[PageStamp],
    ) -> usize {
        if self.arena.len() + ops.len() > self.capacity {
            self.flush();
        }
        let start = self.arena.len() as u32;
        self.arena.extend_from_slice(ops);

        let mut pages = [PageStamp { page: 0, gen: 0 }; 2];
        pages[..stamps.len()].copy_from_slice(stamps);

        let cycles = ops.iter().map(|i| i.cycles as u32).sum();
        let bi = self.blocks.len();
        self.blocks.push(Block {
            entry,
            byte_len,
            start,
            count: ops.len() as u32,
            pages,
            npages: stamps.len() as u8,
            valid: true,
            cycles,
        });
        self.index.insert(entry, bi as u32);
        self.translations += 1;
        bi
    }

    /// Kills every block that recorded code on `page`. Called on a store to
    /// a page the map flagged as holding translated code.
    pub fn invalidate_page(&mut self, page: u32) {
        for b in self.blocks.iter_mut() {
            if !b.valid {
                continue;
            }
            if b.pages[..b.npages as usize].iter().any(|s| s.page == page) {
                b.valid = false;
                self.index.remove(&b.entry);
                self.invalidations += 1;
            }
        }
    }

    pub fn flush(&mut self) {
        log::debug!(
            "block cache flush: {} blocks, {} arena entries",
            self.blocks.len(),
            self.arena.len()
        );
        self.arena.clear();
        self.blocks.clear();
        self.index.clear();
        self.flushes += 1;
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::decode::{Op, Operand, Rep};
    use crate::cpu::state::Width;
    use crate::dev::DevId;
    use crate::mem::{Backing, MemHandlers};

    fn nop(len: u8) -> Insn {
        Insn {
            op: Op::Nop,
            dst: Operand::None,
            src: Operand::None,
            aux: 0,
            w: Width::Word,
            seg: 3,
            rep: Rep::None,
            addr32: false,
            len,
            cycles: 3,
        }
    }

    fn mem() -> MemoryMap {
        let mut m = MemoryMap::new(0x10000, 0x100000);
        m.register(0, 0x10000, MemHandlers::NONE, Backing::Ram { off: 0 }, DevId::NONE)
            .unwrap();
        m
    }

    fn stamp(mem: &MemoryMap, page: u32) -> PageStamp {
        PageStamp {
            page,
            gen: mem.page_gen(page as usize),
        }
    }

    #[test]
    fn insert_then_lookup() {
        let mem = mem();
        let mut c = BlockCache::new(1024);
        let ops = [nop(1), nop(2)];
        let bi = c.insert(0x1000, 3, &ops, &[stamp(&mem, 1)]);
        assert_eq!(c.lookup(0x1000, &mem), Some(bi));
        assert_eq!(c.ops(bi).len(), 2);
        assert_eq!(c.block(bi).cycles, 6);
        assert_eq!(c.lookup(0x2000, &mem), None);
    }

    #[test]
    fn stale_generation_drops_the_block() {
        let mut mem = mem();
        let mut c = BlockCache::new(1024);
        c.insert(0x1000, 3, &[nop(3)], &[stamp(&mem, 1)]);
        mem.mark_code(1);
        mem.note_write(0x1001);
        assert_eq!(c.lookup(0x1000, &mem), None);
        // dropped for good, not just filtered once
        assert_eq!(c.lookup(0x1000, &mem), None);
    }

    #[test]
    fn page_invalidation_kills_only_that_page() {
        let mem = mem();
        let mut c = BlockCache::new(1024);
        c.insert(0x1000, 3, &[nop(3)], &[stamp(&mem, 1)]);
        let keep = c.insert(0x2000, 3, &[nop(3)], &[stamp(&mem, 2)]);
        c.invalidate_page(1);
        assert_eq!(c.lookup(0x1000, &mem), None);
        assert_eq!(c.lookup(0x2000, &mem), Some(keep));
    }

    #[test]
    fn arena_overflow_flushes_everything() {
        let mem = mem();
        let mut c = BlockCache::new(MAX_BLOCK_INSNS);
        let ops: Vec<Insn> = (0..MAX_BLOCK_INSNS).map(|_| nop(1)).collect();
        c.insert(0x1000, ops.len() as u32, &ops, &[stamp(&mem, 1)]);
        assert_eq!(c.len(), 1);
        c.insert(0x2000, 1, &[nop(1)], &[stamp(&mem, 2)]);
        assert_eq!(c.flushes, 1);
        assert_eq!(c.lookup(0x1000, &mem), None);
        assert!(c.lookup(0x2000, &mem).is_some());
    }
}
