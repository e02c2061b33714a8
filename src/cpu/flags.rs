use bitflags::bitflags;
use lazy_static::lazy_static;

use crate::cpu::state::Width;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Flags: u32 {
        const CF = 1 << 0;
        const RESERVED1 = 1 << 1; // always set
        const PF = 1 << 2;
        const AF = 1 << 4;
        const ZF = 1 << 6;
        const SF = 1 << 7;
        const TF = 1 << 8;
        const IF = 1 << 9;
        const DF = 1 << 10;
        const OF = 1 << 11;
    }
}

lazy_static! {
    static ref PARITY: [bool; 256] = {
        let mut t = [false; 256];
        for (i, p) in t.iter_mut().enumerate() {
            *p = (i as u8).count_ones() % 2 == 0;
        }
        t
    };
}

/// Deferred flag computation. Arithmetic handlers record the operation and
/// its operands; the record is folded into the EFLAGS image the first time
/// anything reads flags. The record and the EFLAGS image must never be
/// observable in a disagreeing state, so every reader goes through
/// `fold_into`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LazyOp {
    /// EFLAGS image is authoritative.
    None,
    Add,
    Adc,
    Sub,
    Sbb,
    /// CF preserved from before the instruction (stashed in `c`).
    Inc,
    Dec,
    /// AND/OR/XOR/TEST: CF = OF = AF = 0.
    Logic,
}

#[derive(Debug, Clone, Copy)]
pub struct LazyFlags {
    pub op: LazyOp,
    pub a: u32,
    pub b: u32,
    /// Carry-in for Adc/Sbb, previous CF for Inc/Dec.
    pub c: u32,
    pub res: u32,
    pub w: Width,
}

impl Default for LazyFlags {
    fn default() -> Self {
        LazyFlags {
            op: LazyOp::None,
            a: 0,
            b: 0,
            c: 0,
            res: 0,
            w: Width::Byte,
        }
    }
}

impl LazyFlags {
    const ARITH: Flags = Flags::CF
        .union(Flags::PF)
        .union(Flags::AF)
        .union(Flags::ZF)
        .union(Flags::SF)
        .union(Flags::OF);

    pub fn fold_into(&mut self, flags: &mut Flags) {
        if self.op == LazyOp::None {
            return;
        }

        let m = self.w.mask();
        let sb = self.w.sign_bit();
        let a = self.a & m;
        let b = self.b & m;
        let r = self.res & m;

        let mut out = Flags::empty();
        out.set(Flags::SF, r & sb != 0);
        out.set(Flags::ZF, r == 0);
        out.set(Flags::PF, PARITY[(r & 0xff) as usize]);

        match self.op {
            LazyOp::Add | LazyOp::Adc => {
                out.set(Flags::CF, r < a || (self.c != 0 && r == a));
                out.set(Flags::OF, (a ^ r) & (b ^ r) & sb != 0);
                out.set(Flags::AF, (a ^ b ^ r) & 0x10 != 0);
            }
            LazyOp::Sub | LazyOp::Sbb => {
                out.set(Flags::CF, (a as u64) < (b as u64) + (self.c as u64));
                out.set(Flags::OF, (a ^ b) & (a ^ r) & sb != 0);
                out.set(Flags::AF, (a ^ b ^ r) & 0x10 != 0);
            }
            LazyOp::Inc => {
                out.set(Flags::CF, self.c != 0);
                out.set(Flags::OF, r == sb);
                out.set(Flags::AF, (a ^ 1 ^ r) & 0x10 != 0);
            }
            LazyOp::Dec => {
                out.set(Flags::CF, self.c != 0);
                out.set(Flags::OF, r == sb - 1);
                out.set(Flags::AF, (a ^ 1 ^ r) & 0x10 != 0);
            }
            LazyOp::Logic => {}
            LazyOp::None => unreachable!(),
        }

        *flags = (*flags - Self::ARITH) | out;
        self.op = LazyOp::None;
    }
}

pub fn parity_even(val: u8) -> bool {
    PARITY[val as usize]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fold(op: LazyOp, a: u32, b: u32, c: u32, res: u32, w: Width) -> Flags {
        let mut lazy = LazyFlags {
            op,
            a,
            b,
            c,
            res,
            w,
        };
        let mut f = Flags::RESERVED1;
        lazy.fold_into(&mut f);
        assert_eq!(lazy.op, LazyOp::None);
        f
    }

    #[test]
    fn add_carry_and_overflow() {
        let f = fold(LazyOp::Add, 0xff, 0x01, 0, 0x00, Width::Byte);
        assert!(f.contains(Flags::CF | Flags::ZF | Flags::AF));
        assert!(!f.contains(Flags::OF));

        let f = fold(LazyOp::Add, 0x7f, 0x01, 0, 0x80, Width::Byte);
        assert!(f.contains(Flags::OF | Flags::SF | Flags::AF));
        assert!(!f.contains(Flags::CF));
    }

    #[test]
    fn adc_wraparound_carry() {
        // 0x05 + 0xff + 1 == 0x05 with carry out
        let f = fold(LazyOp::Adc, 0x05, 0xff, 1, 0x05, Width::Byte);
        assert!(f.contains(Flags::CF));
        assert!(!f.contains(Flags::OF));
    }

    #[test]
    fn sub_borrow() {
        let f = fold(LazyOp::Sub, 0x00, 0x01, 0, 0xff, Width::Byte);
        assert!(f.contains(Flags::CF | Flags::SF | Flags::AF));
        let f = fold(LazyOp::Sub, 0x80, 0x01, 0, 0x7f, Width::Byte);
        assert!(f.contains(Flags::OF));
    }

    #[test]
    fn inc_preserves_carry() {
        let f = fold(LazyOp::Inc, 0x7f, 1, 1, 0x80, Width::Byte);
        assert!(f.contains(Flags::CF)); // stashed carry survives
        assert!(f.contains(Flags::OF));
        let f = fold(LazyOp::Dec, 0x80, 1, 0, 0x7f, Width::Byte);
        assert!(!f.contains(Flags::CF));
        assert!(f.contains(Flags::OF));
    }

    #[test]
    fn logic_clears_cf_of() {
        let f = fold(LazyOp::Logic, 0, 0, 0, 0xf0, Width::Byte);
        assert!(f.contains(Flags::SF));
        assert!(!f.intersects(Flags::CF | Flags::OF | Flags::AF));
    }

    #[test]
    fn parity_of_low_byte_only() {
        let f = fold(LazyOp::Add, 0, 0, 0, 0x0103, Width::Word);
        // 0x03 has two bits set -> even parity
        assert!(f.contains(Flags::PF));
    }
}
