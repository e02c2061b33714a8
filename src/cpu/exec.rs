use crate::cpu::decode::{AluOp, Insn, LoopKind, MemRef, Op, Operand, Rep, ShiftOp, StrOp};
use crate::cpu::flags::{Flags, LazyOp};
use crate::cpu::interrupt;
use crate::cpu::state::{reg, seg, Width};
use crate::cpu::Fault;
use crate::machine::Machine;
use crate::util::sign_extend;

pub const REP_ITER_CYCLES: u32 = 4;
pub const TAKEN_BRANCH_CYCLES: u32 = 4;

fn addr_mask(addr32: bool) -> u32 {
    if addr32 {
        0xffff_ffff
    } else {
        0xffff
    }
}

/// Effective offset of a memory operand, before segmentation.
fn ea_offset(m: &Machine, r: &MemRef) -> u32 {
    let rd = |i: u8| {
        if r.addr32 {
            m.cpu.reg32(i)
        } else {
            m.cpu.reg16(i) as u32
        }
    };
    let mut off = r.disp;
    if let Some(b) = r.base {
        off = off.wrapping_add(rd(b));
    }
    if let Some(i) = r.index {
        off = off.wrapping_add(rd(i).wrapping_mul(r.scale as u32));
    }
    off & addr_mask(r.addr32)
}

fn ea(m: &Machine, insn: &Insn, r: &MemRef) -> u32 {
    m.cpu.seg_base(insn.seg).wrapping_add(ea_offset(m, r))
}

fn read_mem(m: &mut Machine, w: Width, lin: u32) -> u32 {
    match w {
        Width::Byte => m.mem_read_b(lin) as u32,
        Width::Word => m.mem_read_w(lin) as u32,
        Width::Dword => m.mem_read_l(lin),
    }
}

fn write_mem(m: &mut Machine, w: Width, lin: u32, val: u32) {
    match w {
        Width::Byte => m.mem_write_b(lin, val as u8),
        Width::Word => m.mem_write_w(lin, val as u16),
        Width::Dword => m.mem_write_l(lin, val),
    }
}

fn read_op(m: &mut Machine, insn: &Insn, op: &Operand, w: Width) -> u32 {
    match op {
        Operand::Reg(r) => m.cpu.reg(*r, w),
        Operand::Seg(s) => m.cpu.sregs[*s as usize].sel as u32,
        Operand::Mem(r) => {
            let lin = ea(m, insn, r);
            read_mem(m, w, lin)
        }
        Operand::Imm(v) => *v & w.mask(),
        Operand::None => 0,
    }
}

fn write_op(m: &mut Machine, insn: &Insn, op: &Operand, w: Width, val: u32) {
    match op {
        Operand::Reg(r) => m.cpu.set_reg(*r, w, val),
        Operand::Seg(s) => m.cpu.sregs[*s as usize].load(val as u16),
        Operand::Mem(r) => {
            let lin = ea(m, insn, r);
            write_mem(m, w, lin, val);
        }
        Operand::Imm(_) | Operand::None => {}
    }
}

fn push(m: &mut Machine, w: Width, val: u32) {
    let sp = m.cpu.reg16(reg::SP).wrapping_sub(w.bytes() as u16);
    m.cpu.set_reg16(reg::SP, sp);
    let lin = m.cpu.seg_base(seg::SS).wrapping_add(sp as u32);
    write_mem(m, w, lin, val);
}

fn pop(m: &mut Machine, w: Width) -> u32 {
    let sp = m.cpu.reg16(reg::SP);
    let lin = m.cpu.seg_base(seg::SS).wrapping_add(sp as u32);
    let val = read_mem(m, w, lin);
    m.cpu.set_reg16(reg::SP, sp.wrapping_add(w.bytes() as u16));
    val
}

fn jump_near(m: &mut Machine, target: u32) {
    m.cpu.ip = target & 0xffff;
}

fn cond_true(m: &mut Machine, cond: u8) -> bool {
    let f = m.cpu.flags();
    let cf = f.contains(Flags::CF);
    let zf = f.contains(Flags::ZF);
    let sf = f.contains(Flags::SF);
    let of = f.contains(Flags::OF);
    let pf = f.contains(Flags::PF);
    let r = match cond >> 1 {
        0 => of,
        1 => cf,
        2 => zf,
        3 => cf || zf,
        4 => sf,
        5 => pf,
        6 => sf != of,
        _ => (sf != of) || zf,
    };
    r != (cond & 1 != 0)
}

/// Executes one decoded instruction. `m.cpu.ip` must already point past the
/// instruction; relative branches are taken from there. Returns cycles
/// consumed.
pub fn exec_insn(m: &mut Machine, insn: &Insn) -> Result<u32, Fault> {
    let w = insn.w;
    let mut cycles = insn.cycles as u32;

    match insn.op {
        Op::Alu(alu) => {
            let a = read_op(m, insn, &insn.dst, w);
            let b = read_op(m, insn, &insn.src, w);
            let (res, lazy, c) = match alu {
                AluOp::Add => (a.wrapping_add(b), LazyOp::Add, 0),
                AluOp::Adc => {
                    let c = m.cpu.get_flag(Flags::CF) as u32;
                    (a.wrapping_add(b).wrapping_add(c), LazyOp::Adc, c)
                }
                AluOp::Sub | AluOp::Cmp => (a.wrapping_sub(b), LazyOp::Sub, 0),
                AluOp::Sbb => {
                    let c = m.cpu.get_flag(Flags::CF) as u32;
                    (a.wrapping_sub(b).wrapping_sub(c), LazyOp::Sbb, c)
                }
                AluOp::Or => (a | b, LazyOp::Logic, 0),
                AluOp::And => (a & b, LazyOp::Logic, 0),
                AluOp::Xor => (a ^ b, LazyOp::Logic, 0),
            };
            m.cpu.set_lazy(lazy, a, b, c, res, w);
            if alu != AluOp::Cmp {
                write_op(m, insn, &insn.dst, w, res & w.mask());
            }
        }

        Op::Test => {
            let a = read_op(m, insn, &insn.dst, w);
            let b = read_op(m, insn, &insn.src, w);
            m.cpu.set_lazy(LazyOp::Logic, a, b, 0, a & b, w);
        }

        Op::Inc | Op::Dec => {
            let a = read_op(m, insn, &insn.dst, w);
            let cf = m.cpu.get_flag(Flags::CF) as u32;
            let (res, lazy) = if insn.op == Op::Inc {
                (a.wrapping_add(1), LazyOp::Inc)
            } else {
                (a.wrapping_sub(1), LazyOp::Dec)
            };
            m.cpu.set_lazy(lazy, a, 1, cf, res, w);
            write_op(m, insn, &insn.dst, w, res & w.mask());
        }

        Op::Not => {
            let a = read_op(m, insn, &insn.dst, w);
            write_op(m, insn, &insn.dst, w, !a & w.mask());
        }

        Op::Neg => {
            let a = read_op(m, insn, &insn.dst, w);
            let res = 0u32.wrapping_sub(a);
            m.cpu.set_lazy(LazyOp::Sub, 0, a, 0, res, w);
            write_op(m, insn, &insn.dst, w, res & w.mask());
        }

        Op::Mul => {
            let b = read_op(m, insn, &insn.dst, w);
            exec_mul(m, w, b, false);
        }
        Op::Imul => {
            let b = read_op(m, insn, &insn.dst, w);
            exec_mul(m, w, b, true);
        }
        Op::Imul2 | Op::Imul3 => {
            let b = read_op(m, insn, &insn.src, w) as i32;
            let a = if insn.op == Op::Imul3 {
                insn.aux as i32
            } else if let Operand::Reg(r) = insn.dst {
                m.cpu.reg(r, w) as i32
            } else {
                0
            };
            let (a, b) = match w {
                Width::Word => (a as i16 as i64, b as i16 as i64),
                _ => (a as i64, b as i64),
            };
            let full = a * b;
            let res = (full as u64 as u32) & w.mask();
            let trunc = match w {
                Width::Word => full != (res as i16 as i64),
                _ => full != (res as i32 as i64),
            };
            m.cpu.set_szp(w, res);
            m.cpu.set_flag(Flags::CF, trunc);
            m.cpu.set_flag(Flags::OF, trunc);
            write_op(m, insn, &insn.dst, w, res);
        }

        Op::Div => {
            let b = read_op(m, insn, &insn.dst, w);
            exec_div(m, w, b)?;
        }
        Op::Idiv => {
            let b = read_op(m, insn, &insn.dst, w);
            exec_idiv(m, w, b)?;
        }

        Op::Mov => {
            let v = read_op(m, insn, &insn.src, w);
            write_op(m, insn, &insn.dst, w, v);
        }

        Op::Movx { sign, src_w } => {
            let v = read_op(m, insn, &insn.src, src_w);
            let v = if sign {
                sign_extend(v, src_w.bits() as usize) & w.mask()
            } else {
                v
            };
            write_op(m, insn, &insn.dst, w, v);
        }

        Op::Lea => {
            if let Operand::Mem(r) = insn.src {
                let off = ea_offset(m, &r);
                write_op(m, insn, &insn.dst, w, off);
            }
        }

        Op::LoadFar(sg) => {
            if let Operand::Mem(r) = insn.src {
                let lin = ea(m, insn, &r);
                let off = read_mem(m, w, lin);
                let sel = read_mem(m, Width::Word, lin.wrapping_add(w.bytes()));
                write_op(m, insn, &insn.dst, w, off);
                m.cpu.sregs[sg as usize].load(sel as u16);
            }
        }

        Op::Xchg => {
            let a = read_op(m, insn, &insn.dst, w);
            let b = read_op(m, insn, &insn.src, w);
            write_op(m, insn, &insn.dst, w, b);
            write_op(m, insn, &insn.src, w, a);
        }

        Op::Xlat => {
            let bx = if insn.addr32 {
                m.cpu.reg32(reg::BX)
            } else {
                m.cpu.reg16(reg::BX) as u32
            };
            let off = bx.wrapping_add(m.cpu.reg8(0) as u32) & addr_mask(insn.addr32);
            let lin = m.cpu.seg_base(insn.seg).wrapping_add(off);
            let v = m.mem_read_b(lin);
            m.cpu.set_reg8(0, v);
        }

        Op::Push => {
            let v = read_op(m, insn, &insn.dst, w);
            push(m, w, v);
        }
        Op::Pop => {
            let v = pop(m, w);
            write_op(m, insn, &insn.dst, w, v);
        }

        Op::PushA => {
            let sp = m.cpu.reg16(reg::SP) as u32;
            for r in 0..8u8 {
                let v = if r == reg::SP { sp } else { m.cpu.reg(r, w) };
                push(m, w, v);
            }
        }
        Op::PopA => {
            for r in (0..8u8).rev() {
                let v = pop(m, w);
                if r != reg::SP {
                    m.cpu.set_reg(r, w, v);
                }
            }
        }

        Op::PushF => {
            let v = m.cpu.flags().bits();
            push(m, w, v);
        }
        Op::PopF => {
            let v = pop(m, w);
            m.cpu.set_flags_image(v);
        }

        Op::Sahf => {
            let ah = m.cpu.reg8(4) as u32;
            let fl = m.cpu.flags().bits();
            m.cpu.set_flags_image((fl & !0xff) | (ah & 0xd5) | 0x02);
        }
        Op::Lahf => {
            let fl = m.cpu.flags().bits();
            m.cpu.set_reg8(4, ((fl & 0xd5) | 0x02) as u8);
        }

        Op::Shift(op) => {
            cycles += exec_shift(m, insn, op);
        }

        Op::Str(op) => {
            cycles += exec_string(m, insn, op)?;
        }

        Op::Jcc(cond) => {
            if cond_true(m, cond) {
                let rel = read_op(m, insn, &insn.src, Width::Dword);
                jump_near(m, m.cpu.ip.wrapping_add(rel));
                cycles += TAKEN_BRANCH_CYCLES;
            }
        }
        Op::JmpRel => {
            let rel = read_op(m, insn, &insn.src, Width::Dword);
            jump_near(m, m.cpu.ip.wrapping_add(rel));
        }
        Op::CallRel => {
            let rel = read_op(m, insn, &insn.src, Width::Dword);
            push(m, w, m.cpu.ip);
            jump_near(m, m.cpu.ip.wrapping_add(rel));
        }
        Op::JmpAbs => {
            let target = read_op(m, insn, &insn.dst, w);
            jump_near(m, target);
        }
        Op::CallAbs => {
            let target = read_op(m, insn, &insn.dst, w);
            push(m, w, m.cpu.ip);
            jump_near(m, target);
        }
        Op::JmpFar => {
            m.cpu.sregs[seg::CS as usize].load(insn.aux as u16);
            let off = read_op(m, insn, &insn.src, w);
            m.cpu.ip = off & w.mask() & 0xffff;
        }
        Op::CallFar => {
            let cs = m.cpu.sregs[seg::CS as usize].sel as u32;
            push(m, w, cs);
            push(m, w, m.cpu.ip);
            m.cpu.sregs[seg::CS as usize].load(insn.aux as u16);
            let off = read_op(m, insn, &insn.src, w);
            m.cpu.ip = off & w.mask() & 0xffff;
        }
        Op::JmpFarInd | Op::CallFarInd => {
            if let Operand::Mem(r) = insn.dst {
                let lin = ea(m, insn, &r);
                let off = read_mem(m, w, lin);
                let sel = read_mem(m, Width::Word, lin.wrapping_add(w.bytes()));
                if insn.op == Op::CallFarInd {
                    let cs = m.cpu.sregs[seg::CS as usize].sel as u32;
                    push(m, w, cs);
                    push(m, w, m.cpu.ip);
                }
                m.cpu.sregs[seg::CS as usize].load(sel as u16);
                m.cpu.ip = off & 0xffff;
            }
        }
        Op::RetNear(n) => {
            let ip = pop(m, w);
            jump_near(m, ip);
            let sp = m.cpu.reg16(reg::SP).wrapping_add(n);
            m.cpu.set_reg16(reg::SP, sp);
        }
        Op::RetFar(n) => {
            let ip = pop(m, w);
            let cs = pop(m, Width::Word);
            m.cpu.sregs[seg::CS as usize].load(cs as u16);
            jump_near(m, ip);
            let sp = m.cpu.reg16(reg::SP).wrapping_add(n);
            m.cpu.set_reg16(reg::SP, sp);
        }

        Op::Enter => {
            let frame = read_op(m, insn, &insn.src, Width::Word);
            let nesting = insn.aux & 0x1f;
            let bp = m.cpu.reg(reg::BP, w);
            push(m, w, bp);
            let frame_ptr = m.cpu.reg16(reg::SP);
            if nesting > 0 {
                let mut base = bp;
                for _ in 1..nesting {
                    base = base.wrapping_sub(w.bytes());
                    let lin = m.cpu.seg_base(seg::SS).wrapping_add(base & 0xffff);
                    let v = read_mem(m, w, lin);
                    push(m, w, v);
                }
                push(m, w, frame_ptr as u32);
            }
            m.cpu.set_reg(reg::BP, w, frame_ptr as u32);
            let sp = m.cpu.reg16(reg::SP).wrapping_sub(frame as u16);
            m.cpu.set_reg16(reg::SP, sp);
        }
        Op::Leave => {
            let bp = m.cpu.reg16(reg::BP);
            m.cpu.set_reg16(reg::SP, bp);
            let v = pop(m, w);
            m.cpu.set_reg(reg::BP, w, v);
        }

        Op::Loop(kind) => {
            let mask = addr_mask(insn.addr32);
            let cx = m.cpu.reg(reg::CX, if insn.addr32 { Width::Dword } else { Width::Word })
                .wrapping_sub(1)
                & mask;
            m.cpu
                .set_reg(reg::CX, if insn.addr32 { Width::Dword } else { Width::Word }, cx);
            let taken = cx != 0
                && match kind {
                    LoopKind::Loop => true,
                    LoopKind::Loope => m.cpu.get_flag(Flags::ZF),
                    LoopKind::Loopne => !m.cpu.get_flag(Flags::ZF),
                };
            if taken {
                let rel = read_op(m, insn, &insn.src, Width::Dword);
                jump_near(m, m.cpu.ip.wrapping_add(rel));
                cycles += TAKEN_BRANCH_CYCLES;
            }
        }
        Op::Jcxz => {
            let cx = m.cpu.reg(reg::CX, if insn.addr32 { Width::Dword } else { Width::Word });
            if cx == 0 {
                let rel = read_op(m, insn, &insn.src, Width::Dword);
                jump_near(m, m.cpu.ip.wrapping_add(rel));
                cycles += TAKEN_BRANCH_CYCLES;
            }
        }

        Op::Int(vector) => {
            interrupt::enter(m, vector);
        }
        Op::Into => {
            if m.cpu.get_flag(Flags::OF) {
                interrupt::enter(m, 4);
                cycles += 20;
            }
        }
        Op::Iret => {
            let ip = pop(m, Width::Word);
            let cs = pop(m, Width::Word);
            let fl = pop(m, Width::Word);
            m.cpu.sregs[seg::CS as usize].load(cs as u16);
            m.cpu.ip = ip & 0xffff;
            m.cpu.set_flags_image(fl);
        }

        Op::Clc => m.cpu.set_flag(Flags::CF, false),
        Op::Stc => m.cpu.set_flag(Flags::CF, true),
        Op::Cmc => {
            let cf = m.cpu.get_flag(Flags::CF);
            m.cpu.set_flag(Flags::CF, !cf);
        }
        Op::Cli => m.cpu.set_flag(Flags::IF, false),
        Op::Sti => m.cpu.set_flag(Flags::IF, true),
        Op::Cld => m.cpu.set_flag(Flags::DF, false),
        Op::Std => m.cpu.set_flag(Flags::DF, true),

        Op::Salc => {
            let cf = m.cpu.get_flag(Flags::CF);
            m.cpu.set_reg8(0, if cf { 0xff } else { 0x00 });
        }

        Op::Cbw => {
            if w == Width::Word {
                let v = sign_extend(m.cpu.reg8(0) as u32, 8);
                m.cpu.set_reg16(reg::AX, v as u16);
            } else {
                let v = sign_extend(m.cpu.reg16(reg::AX) as u32, 16);
                m.cpu.set_reg32(reg::AX, v);
            }
        }
        Op::Cwd => {
            if w == Width::Word {
                let sign = m.cpu.reg16(reg::AX) & 0x8000 != 0;
                m.cpu.set_reg16(reg::DX, if sign { 0xffff } else { 0 });
            } else {
                let sign = m.cpu.reg32(reg::AX) & 0x8000_0000 != 0;
                m.cpu.set_reg32(reg::DX, if sign { 0xffff_ffff } else { 0 });
            }
        }

        Op::Aaa | Op::Aas => {
            let al = m.cpu.reg8(0);
            let adjust = (al & 0x0f) > 9 || m.cpu.get_flag(Flags::AF);
            if adjust {
                let ax = m.cpu.reg16(reg::AX);
                let ax = if insn.op == Op::Aaa {
                    ax.wrapping_add(0x106)
                } else {
                    ax.wrapping_sub(0x006).wrapping_sub(0x100)
                };
                m.cpu.set_reg16(reg::AX, ax);
            }
            m.cpu.set_flag(Flags::AF, adjust);
            m.cpu.set_flag(Flags::CF, adjust);
            let al = m.cpu.reg8(0) & 0x0f;
            m.cpu.set_reg8(0, al);
        }
        Op::Aam(base) => {
            if base == 0 {
                return Err(Fault::Divide);
            }
            let al = m.cpu.reg8(0);
            m.cpu.set_reg8(4, al / base);
            m.cpu.set_reg8(0, al % base);
            m.cpu.set_szp(Width::Byte, (al % base) as u32);
        }
        Op::Aad(base) => {
            let al = m.cpu.reg8(0) as u32;
            let ah = m.cpu.reg8(4) as u32;
            let res = al.wrapping_add(ah.wrapping_mul(base as u32)) & 0xff;
            m.cpu.set_reg8(0, res as u8);
            m.cpu.set_reg8(4, 0);
            m.cpu.set_szp(Width::Byte, res);
        }
        Op::Daa | Op::Das => {
            let old_al = m.cpu.reg8(0);
            let old_cf = m.cpu.get_flag(Flags::CF);
            let mut al = old_al;
            let mut cf = false;
            let low = (old_al & 0x0f) > 9 || m.cpu.get_flag(Flags::AF);
            if low {
                al = if insn.op == Op::Daa {
                    al.wrapping_add(6)
                } else {
                    al.wrapping_sub(6)
                };
                m.cpu.set_flag(Flags::AF, true);
            } else {
                m.cpu.set_flag(Flags::AF, false);
            }
            if old_al > 0x99 || old_cf {
                al = if insn.op == Op::Daa {
                    al.wrapping_add(0x60)
                } else {
                    al.wrapping_sub(0x60)
                };
                cf = true;
            }
            m.cpu.set_reg8(0, al);
            m.cpu.set_szp(Width::Byte, al as u32);
            m.cpu.set_flag(Flags::CF, cf);
        }

        Op::In => {
            let port = read_op(m, insn, &insn.src, Width::Word) as u16;
            let v = m.io_in(w, port);
            m.cpu.set_reg(reg::AX, w, v);
        }
        Op::Out => {
            let port = read_op(m, insn, &insn.dst, Width::Word) as u16;
            let v = m.cpu.reg(reg::AX, w);
            m.io_out(w, port, v);
        }

        Op::Hlt => {
            m.cpu.halted = true;
        }

        Op::Nop => {}
    }

    Ok(cycles)
}

fn exec_mul(m: &mut Machine, w: Width, b: u32, signed: bool) {
    let (low, high, cfof) = match w {
        Width::Byte => {
            let full = if signed {
                ((m.cpu.reg8(0) as i8 as i32) * (b as i8 as i32)) as u32
            } else {
                (m.cpu.reg8(0) as u32) * b
            };
            let r = full & 0xffff;
            let of = if signed {
                full as i32 != (full as i8 as i32)
            } else {
                r > 0xff
            };
            m.cpu.set_reg16(reg::AX, r as u16);
            (r & 0xff, 0, of)
        }
        Width::Word => {
            let full = if signed {
                ((m.cpu.reg16(reg::AX) as i16 as i64) * (b as i16 as i64)) as u64
            } else {
                (m.cpu.reg16(reg::AX) as u64) * (b as u64)
            };
            let lo = (full & 0xffff) as u32;
            let hi = ((full >> 16) & 0xffff) as u32;
            let of = if signed {
                full as i64 != (lo as i16 as i64)
            } else {
                hi != 0
            };
            m.cpu.set_reg16(reg::AX, lo as u16);
            m.cpu.set_reg16(reg::DX, hi as u16);
            (lo, hi, of)
        }
        Width::Dword => {
            let full = if signed {
                ((m.cpu.reg32(reg::AX) as i32 as i64) * (b as i32 as i64)) as u64
            } else {
                (m.cpu.reg32(reg::AX) as u64) * (b as u64)
            };
            let lo = full as u32;
            let hi = (full >> 32) as u32;
            let of = if signed {
                full as i64 != (lo as i32 as i64)
            } else {
                hi != 0
            };
            m.cpu.set_reg32(reg::AX, lo);
            m.cpu.set_reg32(reg::DX, hi);
            (lo, hi, of)
        }
    };
    let _ = high;
    m.cpu.set_szp(w, low);
    m.cpu.set_flag(Flags::CF, cfof);
    m.cpu.set_flag(Flags::OF, cfof);
}

fn exec_div(m: &mut Machine, w: Width, b: u32) -> Result<(), Fault> {
    if b == 0 {
        return Err(Fault::Divide);
    }
    match w {
        Width::Byte => {
            let num = m.cpu.reg16(reg::AX) as u32;
            let q = num / b;
            if q > 0xff {
                return Err(Fault::Divide);
            }
            m.cpu.set_reg8(0, q as u8);
            m.cpu.set_reg8(4, (num % b) as u8);
        }
        Width::Word => {
            let num = ((m.cpu.reg16(reg::DX) as u32) << 16) | m.cpu.reg16(reg::AX) as u32;
            let q = num / b;
            if q > 0xffff {
                return Err(Fault::Divide);
            }
            m.cpu.set_reg16(reg::AX, q as u16);
            m.cpu.set_reg16(reg::DX, (num % b) as u16);
        }
        Width::Dword => {
            let num = ((m.cpu.reg32(reg::DX) as u64) << 32) | m.cpu.reg32(reg::AX) as u64;
            let q = num / b as u64;
            if q > 0xffff_ffff {
                return Err(Fault::Divide);
            }
            m.cpu.set_reg32(reg::AX, q as u32);
            m.cpu.set_reg32(reg::DX, (num % b as u64) as u32);
        }
    }
    Ok(())
}

fn exec_idiv(m: &mut Machine, w: Width, b: u32) -> Result<(), Fault> {
    match w {
        Width::Byte => {
            let den = b as i8 as i32;
            if den == 0 {
                return Err(Fault::Divide);
            }
            let num = m.cpu.reg16(reg::AX) as i16 as i32;
            let q = num / den;
            if q > 0x7f || q < -0x80 {
                return Err(Fault::Divide);
            }
            m.cpu.set_reg8(0, q as u8);
            m.cpu.set_reg8(4, (num % den) as u8);
        }
        Width::Word => {
            let den = b as i16 as i32;
            if den == 0 {
                return Err(Fault::Divide);
            }
            let num = (((m.cpu.reg16(reg::DX) as u32) << 16) | m.cpu.reg16(reg::AX) as u32) as i32;
            let q = num / den;
            if q > 0x7fff || q < -0x8000 {
                return Err(Fault::Divide);
            }
            m.cpu.set_reg16(reg::AX, q as u16);
            m.cpu.set_reg16(reg::DX, (num % den) as u16);
        }
        Width::Dword => {
            let den = b as i32 as i64;
            if den == 0 {
                return Err(Fault::Divide);
            }
            let num = (((m.cpu.reg32(reg::DX) as u64) << 32) | m.cpu.reg32(reg::AX) as u64) as i64;
            let q = num / den;
            if q > 0x7fff_ffff || q < -0x8000_0000 {
                return Err(Fault::Divide);
            }
            m.cpu.set_reg32(reg::AX, q as u32);
            m.cpu.set_reg32(reg::DX, (num % den) as u32);
        }
    }
    Ok(())
}

/// Shift/rotate group. Count of zero (after the 286+ 0x1f masking) leaves
/// the destination and every flag untouched, which real software depends
/// on.
fn exec_shift(m: &mut Machine, insn: &Insn, op: ShiftOp) -> u32 {
    let w = insn.w;
    let bits = w.bits();
    let count = match insn.src {
        Operand::Imm(v) => v,
        Operand::Reg(_) => m.cpu.reg8(reg::CX) as u32,
        _ => 0,
    } & 0x1f;

    if count == 0 {
        return 0;
    }

    let v = read_op(m, insn, &insn.dst, w);
    let (res, cf, of) = match op {
        ShiftOp::Shl => {
            let wide = (v as u64) << count;
            let res = (wide as u32) & w.mask();
            let cf = (wide >> bits) & 1 != 0;
            (res, cf, (res & w.sign_bit() != 0) != cf)
        }
        ShiftOp::Shr => {
            let res = if count < 32 { v >> count } else { 0 };
            let cf = if count <= 32 {
                (v >> (count - 1)) & 1 != 0
            } else {
                false
            };
            (res, cf, v & w.sign_bit() != 0)
        }
        ShiftOp::Sar => {
            let sv = sign_extend(v, bits as usize) as i64;
            let res = ((sv >> count.min(63)) as u32) & w.mask();
            let cf = (sv >> (count - 1).min(63)) & 1 != 0;
            (res, cf, false)
        }
        ShiftOp::Rol => {
            let n = count % bits;
            let res = if n == 0 {
                v & w.mask()
            } else {
                ((v << n) | (v & w.mask()) >> (bits - n)) & w.mask()
            };
            let cf = res & 1 != 0;
            (res, cf, (res & w.sign_bit() != 0) != cf)
        }
        ShiftOp::Ror => {
            let n = count % bits;
            let res = if n == 0 {
                v & w.mask()
            } else {
                (((v & w.mask()) >> n) | (v << (bits - n))) & w.mask()
            };
            let cf = res & w.sign_bit() != 0;
            let of = ((res >> (bits - 1)) ^ (res >> (bits - 2))) & 1 != 0;
            (res, cf, of)
        }
        ShiftOp::Rcl | ShiftOp::Rcr => {
            let cf_in = m.cpu.get_flag(Flags::CF) as u64;
            let n = count % (bits + 1);
            let wide = (v as u64 & w.mask() as u64) | (cf_in << bits);
            let rotated = if n == 0 {
                wide
            } else if op == ShiftOp::Rcl {
                ((wide << n) | (wide >> (bits + 1 - n))) & ((1u64 << (bits + 1)) - 1)
            } else {
                ((wide >> n) | (wide << (bits + 1 - n))) & ((1u64 << (bits + 1)) - 1)
            };
            let res = (rotated as u32) & w.mask();
            let cf = (rotated >> bits) & 1 != 0;
            let of = if op == ShiftOp::Rcl {
                (res & w.sign_bit() != 0) != cf
            } else {
                ((res >> (bits - 1)) ^ (res >> (bits - 2))) & 1 != 0
            };
            (res, cf, of)
        }
    };

    match op {
        ShiftOp::Shl | ShiftOp::Shr | ShiftOp::Sar => {
            m.cpu.set_szp(w, res);
        }
        _ => {
            // rotates leave SF/ZF/PF alone
            m.cpu.lazy.fold_into(&mut m.cpu.rflags);
        }
    }
    m.cpu.set_flag(Flags::CF, cf);
    m.cpu.set_flag(Flags::OF, of);
    write_op(m, insn, &insn.dst, w, res);

    count - 1
}

fn exec_string(m: &mut Machine, insn: &Insn, op: StrOp) -> Result<u32, Fault> {
    let w = insn.w;
    let aw = if insn.addr32 { Width::Dword } else { Width::Word };
    let amask = addr_mask(insn.addr32);
    let step = if m.cpu.get_flag(Flags::DF) {
        (w.bytes() as i64).wrapping_neg()
    } else {
        w.bytes() as i64
    };

    let mut count = if insn.rep != Rep::None {
        let c = m.cpu.reg(reg::CX, aw);
        if c == 0 {
            // REP with CX=0: nothing happens, flags untouched
            return Ok(0);
        }
        c
    } else {
        1
    };

    let src_base = m.cpu.seg_base(insn.seg);
    let es_base = m.cpu.seg_base(seg::ES);
    let mut extra = 0u32;

    loop {
        let si = m.cpu.reg(reg::SI, aw);
        let di = m.cpu.reg(reg::DI, aw);

        match op {
            StrOp::Movs => {
                let v = read_mem(m, w, src_base.wrapping_add(si & amask));
                write_mem(m, w, es_base.wrapping_add(di & amask), v);
                advance(m, reg::SI, aw, step);
                advance(m, reg::DI, aw, step);
            }
            StrOp::Cmps => {
                let a = read_mem(m, w, src_base.wrapping_add(si & amask));
                let b = read_mem(m, w, es_base.wrapping_add(di & amask));
                m.cpu
                    .set_lazy(LazyOp::Sub, a, b, 0, a.wrapping_sub(b), w);
                advance(m, reg::SI, aw, step);
                advance(m, reg::DI, aw, step);
            }
            StrOp::Stos => {
                let v = m.cpu.reg(reg::AX, w);
                write_mem(m, w, es_base.wrapping_add(di & amask), v);
                advance(m, reg::DI, aw, step);
            }
            StrOp::Lods => {
                let v = read_mem(m, w, src_base.wrapping_add(si & amask));
                m.cpu.set_reg(reg::AX, w, v);
                advance(m, reg::SI, aw, step);
            }
            StrOp::Scas => {
                let a = m.cpu.reg(reg::AX, w);
                let b = read_mem(m, w, es_base.wrapping_add(di & amask));
                m.cpu
                    .set_lazy(LazyOp::Sub, a, b, 0, a.wrapping_sub(b), w);
                advance(m, reg::DI, aw, step);
            }
            StrOp::Ins => {
                let port = m.cpu.reg16(reg::DX);
                let v = m.io_in(w, port);
                write_mem(m, w, es_base.wrapping_add(di & amask), v);
                advance(m, reg::DI, aw, step);
            }
            StrOp::Outs => {
                let port = m.cpu.reg16(reg::DX);
                let v = read_mem(m, w, src_base.wrapping_add(si & amask));
                m.io_out(w, port, v);
                advance(m, reg::SI, aw, step);
            }
        }

        if insn.rep == Rep::None {
            break;
        }

        count -= 1;
        m.cpu.set_reg(reg::CX, aw, count);
        if count == 0 {
            break;
        }

        if matches!(op, StrOp::Cmps | StrOp::Scas) {
            let zf = m.cpu.get_flag(Flags::ZF);
            let stop = match insn.rep {
                Rep::Rep => !zf,
                Rep::Repne => zf,
                Rep::None => true,
            };
            if stop {
                break;
            }
        }

        extra += REP_ITER_CYCLES;
    }

    Ok(extra)
}

fn advance(m: &mut Machine, r: u8, aw: Width, step: i64) {
    let v = m.cpu.reg(r, aw);
    m.cpu.set_reg(r, aw, (v as i64).wrapping_add(step) as u32);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::testing::{load, run_to_halt, test_machine};
    use crate::machine::Machine;

    fn run_prog(code: &[u8]) -> Machine {
        let mut m = test_machine(false);
        load(&mut m, 0x100, code);
        run_to_halt(&mut m);
        m
    }

    #[test]
    fn adc_chains_the_carry() {
        // stc; adc al, 0 with al = 0xff wraps and carries out
        let mut m = run_prog(&[0xf9, 0xb0, 0xff, 0x14, 0x00, 0xf4]);
        assert_eq!(m.cpu.reg8(0), 0x00);
        assert!(m.cpu.get_flag(Flags::CF));
        assert!(m.cpu.get_flag(Flags::ZF));
    }

    #[test]
    fn shift_count_zero_touches_nothing() {
        // stc, then shl al, cl with cl = 0
        let mut m = run_prog(&[0xb1, 0x00, 0xb0, 0x80, 0xf9, 0xd2, 0xe0, 0xf4]);
        assert_eq!(m.cpu.reg8(0), 0x80);
        assert!(m.cpu.get_flag(Flags::CF));
    }

    #[test]
    fn rcl_rotates_through_the_carry() {
        // stc; mov al, 0x80; rcl al, 1
        let mut m = run_prog(&[0xf9, 0xb0, 0x80, 0xd0, 0xd0, 0xf4]);
        assert_eq!(m.cpu.reg8(0), 0x01);
        assert!(m.cpu.get_flag(Flags::CF));
    }

    #[test]
    fn sar_keeps_the_sign() {
        // mov al, 0x82; sar al, 1
        let mut m = run_prog(&[0xb0, 0x82, 0xd0, 0xf8, 0xf4]);
        assert_eq!(m.cpu.reg8(0), 0xc1);
        assert!(!m.cpu.get_flag(Flags::CF));
        assert!(m.cpu.get_flag(Flags::SF));
    }

    #[test]
    fn mul_overflow_sets_cf_of() {
        // mov al, 0x80; mov bl, 2; mul bl
        let mut m = run_prog(&[0xb0, 0x80, 0xb3, 0x02, 0xf6, 0xe3, 0xf4]);
        assert_eq!(m.cpu.reg16(reg::AX), 0x100);
        assert!(m.cpu.get_flag(Flags::CF));
        assert!(m.cpu.get_flag(Flags::OF));
    }

    #[test]
    fn imul_in_range_clears_cf_of() {
        // mov al, -1; mov bl, 2; imul bl
        let mut m = run_prog(&[0xb0, 0xff, 0xb3, 0x02, 0xf6, 0xeb, 0xf4]);
        assert_eq!(m.cpu.reg16(reg::AX), 0xfffe);
        assert!(!m.cpu.get_flag(Flags::CF));
        assert!(!m.cpu.get_flag(Flags::OF));
    }

    #[test]
    fn neg_borrows_unless_zero() {
        let mut m = run_prog(&[0xb0, 0x01, 0xf6, 0xd8, 0xf4]);
        assert_eq!(m.cpu.reg8(0), 0xff);
        assert!(m.cpu.get_flag(Flags::CF));

        let mut m = run_prog(&[0xb0, 0x00, 0xf6, 0xd8, 0xf4]);
        assert!(!m.cpu.get_flag(Flags::CF));
        assert!(m.cpu.get_flag(Flags::ZF));
    }

    #[test]
    fn daa_adjusts_packed_bcd() {
        // 0x3c is not valid bcd; the low nibble adjusts to 0x42
        let mut m = run_prog(&[0xb0, 0x3c, 0x27, 0xf4]);
        assert_eq!(m.cpu.reg8(0), 0x42);
        assert!(m.cpu.get_flag(Flags::AF));
        assert!(!m.cpu.get_flag(Flags::CF));
    }

    #[test]
    fn aam_zero_faults_as_divide() {
        let mut m = test_machine(false);
        m.mem_write_w(0, 0x400);
        m.mem_write_w(2, 0);
        m.mem_write_b(0x400, 0xf4); // hlt
        load(&mut m, 0x100, &[0xd4, 0x00]);
        run_to_halt(&mut m);
        assert_eq!(m.cpu.ip, 0x401);
    }

    #[test]
    fn cwd_replicates_the_sign() {
        let m = run_prog(&[0xb8, 0x00, 0x80, 0x99, 0xf4]);
        assert_eq!(m.cpu.reg16(reg::DX), 0xffff);
        let m = run_prog(&[0xb8, 0x00, 0x70, 0x99, 0xf4]);
        assert_eq!(m.cpu.reg16(reg::DX), 0x0000);
    }

    #[test]
    fn xchg_with_ax_swaps() {
        let m = run_prog(&[0xb8, 0x34, 0x12, 0xbb, 0x78, 0x56, 0x93, 0xf4]);
        assert_eq!(m.cpu.reg16(reg::AX), 0x5678);
        assert_eq!(m.cpu.reg16(reg::BX), 0x1234);
    }

    #[test]
    fn movsb_honors_direction_flag() {
        let mut m = test_machine(false);
        m.mem_write_b(0x200, 0x11);
        #[rustfmt::skip]
        load(&mut m, 0x100, &[
            0xbe, 0x00, 0x02,   // mov si, 0x200
            0xbf, 0x00, 0x03,   // mov di, 0x300
            0xfd,               // std
            0xa4,               // movsb
            0xf4,               // hlt
        ]);
        run_to_halt(&mut m);
        assert_eq!(m.mem_read_b(0x300), 0x11);
        assert_eq!(m.cpu.reg16(reg::SI), 0x1ff);
        assert_eq!(m.cpu.reg16(reg::DI), 0x2ff);
    }

    #[test]
    fn repne_scasb_stops_on_match() {
        let mut m = test_machine(false);
        for (i, b) in [0x10u8, 0x20, 0x30, 0x40].iter().enumerate() {
            m.mem_write_b(0x500 + i as u32, *b);
        }
        #[rustfmt::skip]
        load(&mut m, 0x100, &[
            0xbf, 0x00, 0x05,   // mov di, 0x500
            0xb9, 0x04, 0x00,   // mov cx, 4
            0xb0, 0x30,         // mov al, 0x30
            0xf2, 0xae,         // repne scasb
            0xf4,               // hlt
        ]);
        run_to_halt(&mut m);
        // matched the third byte: di one past it, cx counted three down
        assert_eq!(m.cpu.reg16(reg::DI), 0x503);
        assert_eq!(m.cpu.reg16(reg::CX), 0x0001);
        assert!(m.cpu.get_flag(Flags::ZF));
    }

    #[test]
    fn far_call_and_return_balance_the_stack() {
        let mut m = test_machine(false);
        m.mem_write_b(0x200, 0xcb); // retf
        #[rustfmt::skip]
        load(&mut m, 0x100, &[
            0x9a, 0x00, 0x02, 0x00, 0x00, // call 0000:0200
            0xb0, 0x55,                   // mov al, 0x55
            0xf4,                         // hlt
        ]);
        run_to_halt(&mut m);
        assert_eq!(m.cpu.reg8(0), 0x55);
        assert_eq!(m.cpu.reg16(reg::SP), 0xf000);
    }
}
