use crate::cpu::flags::{Flags, LazyFlags, LazyOp};

// General register indices, matching the x86 reg field encoding.
pub mod reg {
    pub const AX: u8 = 0;
    pub const CX: u8 = 1;
    pub const DX: u8 = 2;
    pub const BX: u8 = 3;
    pub const SP: u8 = 4;
    pub const BP: u8 = 5;
    pub const SI: u8 = 6;
    pub const DI: u8 = 7;
}

// Segment register indices, matching the x86 sreg field encoding.
pub mod seg {
    pub const ES: u8 = 0;
    pub const CS: u8 = 1;
    pub const SS: u8 = 2;
    pub const DS: u8 = 3;
    pub const FS: u8 = 4;
    pub const GS: u8 = 5;

    pub const COUNT: usize = 6;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    Byte,
    Word,
    Dword,
}

impl Width {
    pub fn bits(self) -> u32 {
        match self {
            Width::Byte => 8,
            Width::Word => 16,
            Width::Dword => 32,
        }
    }

    pub fn bytes(self) -> u32 {
        self.bits() / 8
    }

    pub fn mask(self) -> u32 {
        match self {
            Width::Byte => 0xff,
            Width::Word => 0xffff,
            Width::Dword => 0xffff_ffff,
        }
    }

    pub fn sign_bit(self) -> u32 {
        1 << (self.bits() - 1)
    }
}

/// Segment register with its cached descriptor base. In real mode the base
/// is always selector << 4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegReg {
    pub sel: u16,
    pub base: u32,
}

impl SegReg {
    pub fn load(&mut self, sel: u16) {
        self.sel = sel;
        self.base = (sel as u32) << 4;
    }
}

#[derive(Clone)]
pub struct Cpu {
    pub gpr: [u32; 8],
    pub sregs: [SegReg; seg::COUNT],
    pub ip: u32,

    pub rflags: Flags,
    pub lazy: LazyFlags,

    pub halted: bool,
}

impl Cpu {
    pub fn new() -> Cpu {
        let mut cpu = Cpu {
            gpr: [0; 8],
            sregs: [SegReg { sel: 0, base: 0 }; seg::COUNT],
            ip: 0,
            rflags: Flags::RESERVED1,
            lazy: LazyFlags::default(),
            halted: false,
        };
        cpu.reset();
        cpu
    }

    /// Power-on / reset state, in place. CS:IP points at the BIOS entry.
    pub fn reset(&mut self) {
        self.gpr = [0; 8];
        for s in self.sregs.iter_mut() {
            s.load(0);
        }
        self.sregs[seg::CS as usize].load(0xf000);
        self.ip = 0xfff0;
        self.rflags = Flags::RESERVED1;
        self.lazy = LazyFlags::default();
        self.halted = false;
    }

    pub fn reg8(&self, r: u8) -> u8 {
        if r < 4 {
            self.gpr[r as usize] as u8
        } else {
            (self.gpr[(r - 4) as usize] >> 8) as u8
        }
    }

    pub fn set_reg8(&mut self, r: u8, val: u8) {
        if r < 4 {
            let g = &mut self.gpr[r as usize];
            *g = (*g & !0xff) | val as u32;
        } else {
            let g = &mut self.gpr[(r - 4) as usize];
            *g = (*g & !0xff00) | ((val as u32) << 8);
        }
    }

    pub fn reg16(&self, r: u8) -> u16 {
        self.gpr[r as usize] as u16
    }

    pub fn set_reg16(&mut self, r: u8, val: u16) {
        let g = &mut self.gpr[r as usize];
        *g = (*g & !0xffff) | val as u32;
    }

    pub fn reg32(&self, r: u8) -> u32 {
        self.gpr[r as usize]
    }

    pub fn set_reg32(&mut self, r: u8, val: u32) {
        self.gpr[r as usize] = val;
    }

    pub fn reg(&self, r: u8, w: Width) -> u32 {
        match w {
            Width::Byte => self.reg8(r) as u32,
            Width::Word => self.reg16(r) as u32,
            Width::Dword => self.reg32(r),
        }
    }

    pub fn set_reg(&mut self, r: u8, w: Width, val: u32) {
        match w {
            Width::Byte => self.set_reg8(r, val as u8),
            Width::Word => self.set_reg16(r, val as u16),
            Width::Dword => self.set_reg32(r, val),
        }
    }

    pub fn seg_base(&self, s: u8) -> u32 {
        self.sregs[s as usize].base
    }

    /// Reconciled EFLAGS image. Folds any pending lazy record first.
    pub fn flags(&mut self) -> Flags {
        self.lazy.fold_into(&mut self.rflags);
        self.rflags
    }

    pub fn get_flag(&mut self, f: Flags) -> bool {
        self.flags().contains(f)
    }

    pub fn set_flag(&mut self, f: Flags, val: bool) {
        self.lazy.fold_into(&mut self.rflags);
        self.rflags.set(f, val);
    }

    /// Replaces the whole EFLAGS image (POPF/IRET/SAHF paths). The reserved
    /// bit stays set and TF-adjacent system bits outside our model are
    /// dropped.
    pub fn set_flags_image(&mut self, bits: u32) {
        self.lazy = LazyFlags::default();
        self.rflags = Flags::from_bits_truncate(bits) | Flags::RESERVED1;
    }

    pub fn set_lazy(&mut self, op: LazyOp, a: u32, b: u32, c: u32, res: u32, w: Width) {
        self.lazy = LazyFlags { op, a, b, c, res, w };
    }

    /// Eagerly sets SF/ZF/PF from a result, for handlers that compute their
    /// own CF/OF (shifts, rotates, multiplies, BCD adjusts).
    pub fn set_szp(&mut self, w: Width, res: u32) {
        self.lazy.fold_into(&mut self.rflags);
        let r = res & w.mask();
        self.rflags.set(Flags::SF, r & w.sign_bit() != 0);
        self.rflags.set(Flags::ZF, r == 0);
        self.rflags
            .set(Flags::PF, crate::cpu::flags::parity_even(r as u8));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reg8_aliases_reg16() {
        let mut cpu = Cpu::new();
        cpu.set_reg16(reg::AX, 0x1234);
        assert_eq!(cpu.reg8(0), 0x34); // AL
        assert_eq!(cpu.reg8(4), 0x12); // AH
        cpu.set_reg8(4, 0xff);
        assert_eq!(cpu.reg16(reg::AX), 0xff34);
        cpu.set_reg32(reg::AX, 0xaabbccdd);
        assert_eq!(cpu.reg16(reg::AX), 0xccdd);
        assert_eq!(cpu.reg8(0), 0xdd);
    }

    #[test]
    fn reset_vector() {
        let cpu = Cpu::new();
        assert_eq!(cpu.sregs[seg::CS as usize].sel, 0xf000);
        assert_eq!(cpu.sregs[seg::CS as usize].base, 0xf0000);
        assert_eq!(cpu.ip, 0xfff0);
        assert_eq!(cpu.seg_base(seg::CS) + (cpu.ip & 0xffff), 0xffff0);
    }
}
