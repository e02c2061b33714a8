use crate::cpu::state::{reg, seg, Width};
use crate::cpu::Fault;
use crate::machine::Machine;
use crate::util::sign_extend;

pub const MAX_INSN_LEN: u8 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Or,
    Adc,
    Sbb,
    And,
    Sub,
    Xor,
    Cmp,
}

impl AluOp {
    pub fn from_index(i: u8) -> AluOp {
        match i & 7 {
            0 => AluOp::Add,
            1 => AluOp::Or,
            2 => AluOp::Adc,
            3 => AluOp::Sbb,
            4 => AluOp::And,
            5 => AluOp::Sub,
            6 => AluOp::Xor,
            _ => AluOp::Cmp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftOp {
    Rol,
    Ror,
    Rcl,
    Rcr,
    Shl,
    Shr,
    Sar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrOp {
    Movs,
    Cmps,
    Stos,
    Lods,
    Scas,
    Ins,
    Outs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopKind {
    Loopne,
    Loope,
    Loop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Alu(AluOp),
    Test,
    Inc,
    Dec,
    Not,
    Neg,
    Mul,
    Imul,
    /// Two-operand IMUL (0F AF). Three-operand forms carry the immediate in
    /// `aux`.
    Imul2,
    Imul3,
    Div,
    Idiv,
    Mov,
    Movx { sign: bool, src_w: Width },
    Lea,
    LoadFar(u8),
    Xchg,
    Xlat,
    Push,
    Pop,
    PushA,
    PopA,
    PushF,
    PopF,
    Sahf,
    Lahf,
    Shift(ShiftOp),
    Str(StrOp),
    Jcc(u8),
    JmpRel,
    CallRel,
    JmpAbs,
    CallAbs,
    /// Direct far transfer: src = Imm(offset), aux = selector.
    JmpFar,
    CallFar,
    /// Indirect far transfer through dst memory operand.
    JmpFarInd,
    CallFarInd,
    RetNear(u16),
    RetFar(u16),
    Enter,
    Leave,
    Loop(LoopKind),
    Jcxz,
    Int(u8),
    Into,
    Iret,
    Clc,
    Stc,
    Cmc,
    Cli,
    Sti,
    Cld,
    Std,
    Salc,
    Cbw,
    Cwd,
    Aaa,
    Aas,
    Aam(u8),
    Aad(u8),
    Daa,
    Das,
    In,
    Out,
    Hlt,
    Nop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemRef {
    pub base: Option<u8>,
    pub index: Option<u8>,
    pub scale: u8,
    pub disp: u32,
    pub addr32: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    None,
    Reg(u8),
    Seg(u8),
    Mem(MemRef),
    Imm(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rep {
    None,
    Rep,
    Repne,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Insn {
    pub op: Op,
    pub dst: Operand,
    pub src: Operand,
    pub aux: u32,
    pub w: Width,
    pub seg: u8,
    pub rep: Rep,
    pub addr32: bool,
    pub len: u8,
    pub cycles: u8,
}

impl Insn {
    /// True for instructions that end a translated run: every control
    /// transfer, plus HLT and repeated string ops.
    pub fn ends_block(&self) -> bool {
        if self.rep != Rep::None {
            return true;
        }
        matches!(
            self.op,
            Op::Jcc(_)
                | Op::JmpRel
                | Op::CallRel
                | Op::JmpAbs
                | Op::CallAbs
                | Op::JmpFar
                | Op::CallFar
                | Op::JmpFarInd
                | Op::CallFarInd
                | Op::RetNear(_)
                | Op::RetFar(_)
                | Op::Loop(_)
                | Op::Jcxz
                | Op::Int(_)
                | Op::Into
                | Op::Iret
                | Op::Hlt
        )
    }
}

struct Fetch<'m> {
    m: &'m mut Machine,
    base: u32,
    ip: u32,
    len: u8,
    overflow: bool,
}

impl<'m> Fetch<'m> {
    fn b(&mut self) -> u8 {
        if self.len >= MAX_INSN_LEN {
            self.overflow = true;
            return 0;
        }
        let lin = self.base.wrapping_add((self.ip + self.len as u32) & 0xffff);
        self.len += 1;
        self.m.mem_read_b(lin)
    }

    fn w(&mut self) -> u16 {
        let lo = self.b() as u16;
        let hi = self.b() as u16;
        lo | (hi << 8)
    }

    fn l(&mut self) -> u32 {
        let lo = self.w() as u32;
        let hi = self.w() as u32;
        lo | (hi << 16)
    }

    fn imm(&mut self, w: Width) -> u32 {
        match w {
            Width::Byte => self.b() as u32,
            Width::Word => self.w() as u32,
            Width::Dword => self.l(),
        }
    }

    fn rel(&mut self, w: Width) -> u32 {
        match w {
            Width::Byte => sign_extend(self.b() as u32, 8),
            Width::Word => sign_extend(self.w() as u32, 16),
            Width::Dword => self.l(),
        }
    }
}

struct ModRm {
    reg: u8,
    rm: Operand,
    /// Default data segment for the rm operand (SS for BP/ESP-based).
    def_seg: u8,
}

fn modrm16(f: &mut Fetch) -> ModRm {
    let mb = f.b();
    let md = mb >> 6;
    let regf = (mb >> 3) & 7;
    let rm = mb & 7;

    if md == 3 {
        return ModRm {
            reg: regf,
            rm: Operand::Reg(rm),
            def_seg: seg::DS,
        };
    }

    let (base, index) = match rm {
        0 => (Some(reg::BX), Some(reg::SI)),
        1 => (Some(reg::BX), Some(reg::DI)),
        2 => (Some(reg::BP), Some(reg::SI)),
        3 => (Some(reg::BP), Some(reg::DI)),
        4 => (Some(reg::SI), None),
        5 => (Some(reg::DI), None),
        6 => (Some(reg::BP), None),
        _ => (Some(reg::BX), None),
    };

    let (base, disp) = match md {
        0 => {
            if rm == 6 {
                (None, f.w() as u32)
            } else {
                (base, 0)
            }
        }
        1 => (base, sign_extend(f.b() as u32, 8)),
        _ => (base, f.w() as u32),
    };

    let def_seg = match base {
        Some(b) if b == reg::BP => seg::SS,
        _ => seg::DS,
    };

    ModRm {
        reg: regf,
        rm: Operand::Mem(MemRef {
            base,
            index,
            scale: 1,
            disp,
            addr32: false,
        }),
        def_seg,
    }
}

fn modrm32(f: &mut Fetch) -> ModRm {
    let mb = f.b();
    let md = mb >> 6;
    let regf = (mb >> 3) & 7;
    let rm = mb & 7;

    if md == 3 {
        return ModRm {
            reg: regf,
            rm: Operand::Reg(rm),
            def_seg: seg::DS,
        };
    }

    let mut base = Some(rm);
    let mut index = None;
    let mut scale = 1u8;

    if rm == 4 {
        let sib = f.b();
        scale = 1 << (sib >> 6);
        let idx = (sib >> 3) & 7;
        index = if idx == reg::SP { None } else { Some(idx) };
        base = Some(sib & 7);
    }

    let mut disp = 0u32;
    match md {
        0 => {
            if base == Some(reg::BP) {
                base = None;
                disp = f.l();
            }
        }
        1 => disp = sign_extend(f.b() as u32, 8),
        _ => disp = f.l(),
    }

    let def_seg = match base {
        Some(b) if b == reg::BP || b == reg::SP => seg::SS,
        _ => seg::DS,
    };

    ModRm {
        reg: regf,
        rm: Operand::Mem(MemRef {
            base,
            index,
            scale,
            disp,
            addr32: true,
        }),
        def_seg,
    }
}

fn has_mem(op: &Operand) -> bool {
    matches!(op, Operand::Mem(_))
}

/// Decodes one instruction at cs_base:ip. Never touches CPU state; all
/// fetches go through the memory map.
pub fn decode_one(m: &mut Machine, cs_base: u32, ip: u32) -> Result<Insn, Fault> {
    let mut f = Fetch {
        m,
        base: cs_base,
        ip,
        len: 0,
        overflow: false,
    };

    let mut seg_ovr: Option<u8> = None;
    let mut op32 = false;
    let mut addr32 = false;
    let mut rep = Rep::None;

    let opcode = loop {
        if f.overflow {
            return Err(Fault::InvalidOpcode);
        }
        match f.b() {
            0x26 => seg_ovr = Some(seg::ES),
            0x2e => seg_ovr = Some(seg::CS),
            0x36 => seg_ovr = Some(seg::SS),
            0x3e => seg_ovr = Some(seg::DS),
            0x64 => seg_ovr = Some(seg::FS),
            0x65 => seg_ovr = Some(seg::GS),
            0x66 => op32 = true,
            0x67 => addr32 = true,
            0xf0 => {} // LOCK: accepted, no bus to lock
            0xf2 => rep = Rep::Repne,
            0xf3 => rep = Rep::Rep,
            op => break op,
        }
    };

    let wv = if op32 { Width::Dword } else { Width::Word };
    let modrm = |f: &mut Fetch| if addr32 { modrm32(f) } else { modrm16(f) };

    let mut insn = Insn {
        op: Op::Nop,
        dst: Operand::None,
        src: Operand::None,
        aux: 0,
        w: wv,
        seg: seg::DS,
        rep,
        addr32,
        len: 0,
        cycles: 2,
    };

    let set_seg = |insn: &mut Insn, def: u8| {
        insn.seg = seg_ovr.unwrap_or(def);
    };

    match opcode {
        // ALU matrix: 00-3f, columns 0-5 of each row of 8.
        op if op < 0x40 && (op & 7) < 6 => {
            insn.op = Op::Alu(AluOp::from_index(op >> 3));
            insn.w = if op & 1 == 0 { Width::Byte } else { wv };
            match op & 7 {
                0 | 1 => {
                    let mr = modrm(&mut f);
                    set_seg(&mut insn, mr.def_seg);
                    insn.dst = mr.rm;
                    insn.src = Operand::Reg(mr.reg);
                }
                2 | 3 => {
                    let mr = modrm(&mut f);
                    set_seg(&mut insn, mr.def_seg);
                    insn.dst = Operand::Reg(mr.reg);
                    insn.src = mr.rm;
                }
                _ => {
                    insn.dst = Operand::Reg(reg::AX);
                    insn.src = Operand::Imm(f.imm(insn.w));
                }
            }
            insn.cycles = if has_mem(&insn.dst) { 7 } else { 3 };
        }

        0x06 | 0x0e | 0x16 | 0x1e => {
            insn.op = Op::Push;
            insn.dst = Operand::Seg(opcode >> 3);
            insn.w = wv;
            insn.cycles = 3;
        }
        0x07 | 0x17 | 0x1f => {
            insn.op = Op::Pop;
            insn.dst = Operand::Seg(opcode >> 3);
            insn.w = wv;
            insn.cycles = 3;
        }

        0x27 => insn.op = Op::Daa,
        0x2f => insn.op = Op::Das,
        0x37 => insn.op = Op::Aaa,
        0x3f => insn.op = Op::Aas,

        0x0f => return decode_0f(&mut f, insn, seg_ovr, wv, addr32),

        0x40..=0x47 => {
            insn.op = Op::Inc;
            insn.dst = Operand::Reg(opcode & 7);
            insn.cycles = 2;
        }
        0x48..=0x4f => {
            insn.op = Op::Dec;
            insn.dst = Operand::Reg(opcode & 7);
            insn.cycles = 2;
        }
        0x50..=0x57 => {
            insn.op = Op::Push;
            insn.dst = Operand::Reg(opcode & 7);
            insn.cycles = 3;
        }
        0x58..=0x5f => {
            insn.op = Op::Pop;
            insn.dst = Operand::Reg(opcode & 7);
            insn.cycles = 3;
        }
        0x60 => {
            insn.op = Op::PushA;
            insn.cycles = 17;
        }
        0x61 => {
            insn.op = Op::PopA;
            insn.cycles = 17;
        }
        0x68 => {
            insn.op = Op::Push;
            insn.dst = Operand::Imm(f.imm(wv));
            insn.cycles = 3;
        }
        0x6a => {
            insn.op = Op::Push;
            insn.dst = Operand::Imm(sign_extend(f.b() as u32, 8));
            insn.cycles = 3;
        }
        0x69 | 0x6b => {
            let mr = modrm(&mut f);
            set_seg(&mut insn, mr.def_seg);
            insn.op = Op::Imul3;
            insn.dst = Operand::Reg(mr.reg);
            insn.src = mr.rm;
            insn.aux = if opcode == 0x69 {
                f.imm(wv)
            } else {
                sign_extend(f.b() as u32, 8)
            };
            insn.cycles = 14;
        }
        0x6c | 0x6d => {
            insn.op = Op::Str(StrOp::Ins);
            insn.w = if opcode & 1 == 0 { Width::Byte } else { wv };
            insn.seg = seg::ES; // destination is always ES:DI
            insn.cycles = 9;
        }
        0x6e | 0x6f => {
            insn.op = Op::Str(StrOp::Outs);
            insn.w = if opcode & 1 == 0 { Width::Byte } else { wv };
            set_seg(&mut insn, seg::DS);
            insn.cycles = 9;
        }

        0x70..=0x7f => {
            insn.op = Op::Jcc(opcode & 0x0f);
            insn.src = Operand::Imm(f.rel(Width::Byte));
            insn.cycles = 4;
        }

        0x80..=0x83 => {
            let mr = modrm(&mut f);
            set_seg(&mut insn, mr.def_seg);
            insn.op = Op::Alu(AluOp::from_index(mr.reg));
            insn.w = if opcode & 1 == 0 { Width::Byte } else { wv };
            insn.dst = mr.rm;
            insn.src = Operand::Imm(match opcode {
                0x81 => f.imm(insn.w),
                0x83 => sign_extend(f.b() as u32, 8),
                _ => f.b() as u32,
            });
            insn.cycles = if has_mem(&insn.dst) { 7 } else { 4 };
        }

        0x84 | 0x85 => {
            let mr = modrm(&mut f);
            set_seg(&mut insn, mr.def_seg);
            insn.op = Op::Test;
            insn.w = if opcode & 1 == 0 { Width::Byte } else { wv };
            insn.dst = mr.rm;
            insn.src = Operand::Reg(mr.reg);
            insn.cycles = if has_mem(&insn.dst) { 6 } else { 3 };
        }
        0x86 | 0x87 => {
            let mr = modrm(&mut f);
            set_seg(&mut insn, mr.def_seg);
            insn.op = Op::Xchg;
            insn.w = if opcode & 1 == 0 { Width::Byte } else { wv };
            insn.dst = mr.rm;
            insn.src = Operand::Reg(mr.reg);
            insn.cycles = if has_mem(&insn.dst) { 9 } else { 4 };
        }
        0x88..=0x8b => {
            let mr = modrm(&mut f);
            set_seg(&mut insn, mr.def_seg);
            insn.op = Op::Mov;
            insn.w = if opcode & 1 == 0 { Width::Byte } else { wv };
            if opcode & 2 == 0 {
                insn.dst = mr.rm;
                insn.src = Operand::Reg(mr.reg);
            } else {
                insn.dst = Operand::Reg(mr.reg);
                insn.src = mr.rm;
            }
            insn.cycles = if has_mem(&insn.dst) || has_mem(&insn.src) { 5 } else { 2 };
        }
        0x8c | 0x8e => {
            let mr = modrm(&mut f);
            set_seg(&mut insn, mr.def_seg);
            if mr.reg as usize >= seg::COUNT {
                return Err(Fault::InvalidOpcode);
            }
            insn.op = Op::Mov;
            insn.w = Width::Word;
            if opcode == 0x8c {
                insn.dst = mr.rm;
                insn.src = Operand::Seg(mr.reg);
            } else {
                if mr.reg == seg::CS {
                    return Err(Fault::InvalidOpcode);
                }
                insn.dst = Operand::Seg(mr.reg);
                insn.src = mr.rm;
            }
            insn.cycles = 3;
        }
        0x8d => {
            let mr = modrm(&mut f);
            if !has_mem(&mr.rm) {
                return Err(Fault::InvalidOpcode);
            }
            insn.op = Op::Lea;
            insn.dst = Operand::Reg(mr.reg);
            insn.src = mr.rm;
            insn.cycles = 2;
        }
        0x8f => {
            let mr = modrm(&mut f);
            set_seg(&mut insn, mr.def_seg);
            insn.op = Op::Pop;
            insn.dst = mr.rm;
            insn.cycles = 5;
        }

        0x90 => insn.op = Op::Nop,
        0x91..=0x97 => {
            insn.op = Op::Xchg;
            insn.dst = Operand::Reg(opcode & 7);
            insn.src = Operand::Reg(reg::AX);
            insn.cycles = 3;
        }
        0x98 => insn.op = Op::Cbw,
        0x99 => insn.op = Op::Cwd,
        0x9a => {
            insn.op = Op::CallFar;
            insn.src = Operand::Imm(f.imm(wv));
            insn.aux = f.w() as u32;
            insn.cycles = 18;
        }
        0x9b => insn.op = Op::Nop, // WAIT: no coprocessor to wait on
        0x9c => {
            insn.op = Op::PushF;
            insn.cycles = 3;
        }
        0x9d => {
            insn.op = Op::PopF;
            insn.cycles = 4;
        }
        0x9e => insn.op = Op::Sahf,
        0x9f => insn.op = Op::Lahf,

        0xa0..=0xa3 => {
            let disp = if addr32 { f.l() } else { f.w() as u32 };
            let mem = Operand::Mem(MemRef {
                base: None,
                index: None,
                scale: 1,
                disp,
                addr32,
            });
            set_seg(&mut insn, seg::DS);
            insn.op = Op::Mov;
            insn.w = if opcode & 1 == 0 { Width::Byte } else { wv };
            if opcode < 0xa2 {
                insn.dst = Operand::Reg(reg::AX);
                insn.src = mem;
            } else {
                insn.dst = mem;
                insn.src = Operand::Reg(reg::AX);
            }
            insn.cycles = 4;
        }
        0xa4 | 0xa5 => {
            insn.op = Op::Str(StrOp::Movs);
            insn.w = if opcode & 1 == 0 { Width::Byte } else { wv };
            set_seg(&mut insn, seg::DS);
            insn.cycles = 8;
        }
        0xa6 | 0xa7 => {
            insn.op = Op::Str(StrOp::Cmps);
            insn.w = if opcode & 1 == 0 { Width::Byte } else { wv };
            set_seg(&mut insn, seg::DS);
            insn.cycles = 10;
        }
        0xa8 | 0xa9 => {
            insn.op = Op::Test;
            insn.w = if opcode & 1 == 0 { Width::Byte } else { wv };
            insn.dst = Operand::Reg(reg::AX);
            insn.src = Operand::Imm(f.imm(insn.w));
            insn.cycles = 3;
        }
        0xaa | 0xab => {
            insn.op = Op::Str(StrOp::Stos);
            insn.w = if opcode & 1 == 0 { Width::Byte } else { wv };
            insn.seg = seg::ES;
            insn.cycles = 6;
        }
        0xac | 0xad => {
            insn.op = Op::Str(StrOp::Lods);
            insn.w = if opcode & 1 == 0 { Width::Byte } else { wv };
            set_seg(&mut insn, seg::DS);
            insn.cycles = 6;
        }
        0xae | 0xaf => {
            insn.op = Op::Str(StrOp::Scas);
            insn.w = if opcode & 1 == 0 { Width::Byte } else { wv };
            insn.seg = seg::ES;
            insn.cycles = 8;
        }

        0xb0..=0xb7 => {
            insn.op = Op::Mov;
            insn.w = Width::Byte;
            insn.dst = Operand::Reg(opcode & 7);
            insn.src = Operand::Imm(f.b() as u32);
            insn.cycles = 2;
        }
        0xb8..=0xbf => {
            insn.op = Op::Mov;
            insn.dst = Operand::Reg(opcode & 7);
            insn.src = Operand::Imm(f.imm(wv));
            insn.cycles = 2;
        }

        0xc0 | 0xc1 | 0xd0..=0xd3 => {
            let mr = modrm(&mut f);
            set_seg(&mut insn, mr.def_seg);
            let shift = match mr.reg {
                0 => ShiftOp::Rol,
                1 => ShiftOp::Ror,
                2 => ShiftOp::Rcl,
                3 => ShiftOp::Rcr,
                4 | 6 => ShiftOp::Shl,
                5 => ShiftOp::Shr,
                _ => ShiftOp::Sar,
            };
            insn.op = Op::Shift(shift);
            insn.w = if opcode & 1 == 0 { Width::Byte } else { wv };
            insn.dst = mr.rm;
            insn.src = match opcode {
                0xc0 | 0xc1 => Operand::Imm(f.b() as u32),
                0xd0 | 0xd1 => Operand::Imm(1),
                _ => Operand::Reg(reg::CX), // count in CL
            };
            insn.cycles = if has_mem(&insn.dst) { 7 } else { 3 };
        }

        0xc2 => {
            insn.op = Op::RetNear(f.w());
            insn.cycles = 11;
        }
        0xc3 => {
            insn.op = Op::RetNear(0);
            insn.cycles = 10;
        }
        0xc4 | 0xc5 => {
            let mr = modrm(&mut f);
            if !has_mem(&mr.rm) {
                return Err(Fault::InvalidOpcode);
            }
            set_seg(&mut insn, mr.def_seg);
            insn.op = Op::LoadFar(if opcode == 0xc4 { seg::ES } else { seg::DS });
            insn.dst = Operand::Reg(mr.reg);
            insn.src = mr.rm;
            insn.cycles = 7;
        }
        0xc6 | 0xc7 => {
            let mr = modrm(&mut f);
            set_seg(&mut insn, mr.def_seg);
            insn.op = Op::Mov;
            insn.w = if opcode & 1 == 0 { Width::Byte } else { wv };
            insn.dst = mr.rm;
            insn.src = Operand::Imm(f.imm(insn.w));
            insn.cycles = if has_mem(&insn.dst) { 6 } else { 3 };
        }
        0xc8 => {
            insn.op = Op::Enter;
            insn.src = Operand::Imm(f.w() as u32);
            insn.aux = f.b() as u32;
            insn.cycles = 11;
        }
        0xc9 => {
            insn.op = Op::Leave;
            insn.cycles = 5;
        }
        0xca => {
            insn.op = Op::RetFar(f.w());
            insn.cycles = 17;
        }
        0xcb => {
            insn.op = Op::RetFar(0);
            insn.cycles = 16;
        }
        0xcc => {
            insn.op = Op::Int(3);
            insn.cycles = 23;
        }
        0xcd => {
            insn.op = Op::Int(f.b());
            insn.cycles = 23;
        }
        0xce => {
            insn.op = Op::Into;
            insn.cycles = 4;
        }
        0xcf => {
            insn.op = Op::Iret;
            insn.cycles = 22;
        }

        0xd4 => insn.op = Op::Aam(f.b()),
        0xd5 => insn.op = Op::Aad(f.b()),
        0xd6 => insn.op = Op::Salc,
        0xd7 => {
            insn.op = Op::Xlat;
            set_seg(&mut insn, seg::DS);
            insn.cycles = 4;
        }

        // x87 escapes: consume the modrm, no coprocessor fitted.
        0xd8..=0xdf => {
            let _ = modrm(&mut f);
            insn.op = Op::Nop;
        }

        0xe0..=0xe2 => {
            insn.op = Op::Loop(match opcode {
                0xe0 => LoopKind::Loopne,
                0xe1 => LoopKind::Loope,
                _ => LoopKind::Loop,
            });
            insn.src = Operand::Imm(f.rel(Width::Byte));
            insn.cycles = 6;
        }
        0xe3 => {
            insn.op = Op::Jcxz;
            insn.src = Operand::Imm(f.rel(Width::Byte));
            insn.cycles = 5;
        }
        0xe4 | 0xe5 => {
            insn.op = Op::In;
            insn.w = if opcode & 1 == 0 { Width::Byte } else { wv };
            insn.src = Operand::Imm(f.b() as u32);
            insn.cycles = 8;
        }
        0xe6 | 0xe7 => {
            insn.op = Op::Out;
            insn.w = if opcode & 1 == 0 { Width::Byte } else { wv };
            insn.dst = Operand::Imm(f.b() as u32);
            insn.cycles = 8;
        }
        0xe8 => {
            insn.op = Op::CallRel;
            insn.src = Operand::Imm(f.rel(wv));
            insn.cycles = 12;
        }
        0xe9 => {
            insn.op = Op::JmpRel;
            insn.src = Operand::Imm(f.rel(wv));
            insn.cycles = 8;
        }
        0xea => {
            insn.op = Op::JmpFar;
            insn.src = Operand::Imm(f.imm(wv));
            insn.aux = f.w() as u32;
            insn.cycles = 12;
        }
        0xeb => {
            insn.op = Op::JmpRel;
            insn.src = Operand::Imm(f.rel(Width::Byte));
            insn.cycles = 8;
        }
        0xec | 0xed => {
            insn.op = Op::In;
            insn.w = if opcode & 1 == 0 { Width::Byte } else { wv };
            insn.src = Operand::Reg(reg::DX);
            insn.cycles = 8;
        }
        0xee | 0xef => {
            insn.op = Op::Out;
            insn.w = if opcode & 1 == 0 { Width::Byte } else { wv };
            insn.dst = Operand::Reg(reg::DX);
            insn.cycles = 8;
        }

        0xf4 => {
            insn.op = Op::Hlt;
            insn.cycles = 2;
        }
        0xf5 => insn.op = Op::Cmc,

        0xf6 | 0xf7 => {
            let mr = modrm(&mut f);
            set_seg(&mut insn, mr.def_seg);
            insn.w = if opcode & 1 == 0 { Width::Byte } else { wv };
            insn.dst = mr.rm;
            match mr.reg {
                0 | 1 => {
                    insn.op = Op::Test;
                    insn.src = Operand::Imm(f.imm(insn.w));
                    insn.cycles = 4;
                }
                2 => {
                    insn.op = Op::Not;
                    insn.cycles = 3;
                }
                3 => {
                    insn.op = Op::Neg;
                    insn.cycles = 3;
                }
                4 => {
                    insn.op = Op::Mul;
                    insn.cycles = 13;
                }
                5 => {
                    insn.op = Op::Imul;
                    insn.cycles = 14;
                }
                6 => {
                    insn.op = Op::Div;
                    insn.cycles = 17;
                }
                _ => {
                    insn.op = Op::Idiv;
                    insn.cycles = 22;
                }
            }
        }

        0xf8 => insn.op = Op::Clc,
        0xf9 => insn.op = Op::Stc,
        0xfa => insn.op = Op::Cli,
        0xfb => insn.op = Op::Sti,
        0xfc => insn.op = Op::Cld,
        0xfd => insn.op = Op::Std,

        0xfe => {
            let mr = modrm(&mut f);
            set_seg(&mut insn, mr.def_seg);
            insn.w = Width::Byte;
            insn.dst = mr.rm;
            insn.op = match mr.reg {
                0 => Op::Inc,
                1 => Op::Dec,
                _ => return Err(Fault::InvalidOpcode),
            };
            insn.cycles = if has_mem(&insn.dst) { 7 } else { 3 };
        }
        0xff => {
            let mr = modrm(&mut f);
            set_seg(&mut insn, mr.def_seg);
            insn.dst = mr.rm;
            match mr.reg {
                0 => {
                    insn.op = Op::Inc;
                    insn.cycles = if has_mem(&insn.dst) { 7 } else { 3 };
                }
                1 => {
                    insn.op = Op::Dec;
                    insn.cycles = if has_mem(&insn.dst) { 7 } else { 3 };
                }
                2 => {
                    insn.op = Op::CallAbs;
                    insn.cycles = 13;
                }
                3 => {
                    if !has_mem(&insn.dst) {
                        return Err(Fault::InvalidOpcode);
                    }
                    insn.op = Op::CallFarInd;
                    insn.cycles = 22;
                }
                4 => {
                    insn.op = Op::JmpAbs;
                    insn.cycles = 9;
                }
                5 => {
                    if !has_mem(&insn.dst) {
                        return Err(Fault::InvalidOpcode);
                    }
                    insn.op = Op::JmpFarInd;
                    insn.cycles = 14;
                }
                6 => {
                    insn.op = Op::Push;
                    insn.cycles = 5;
                }
                _ => return Err(Fault::InvalidOpcode),
            }
        }

        _ => return Err(Fault::InvalidOpcode),
    }

    if f.overflow {
        return Err(Fault::InvalidOpcode);
    }

    insn.len = f.len;
    Ok(insn)
}


fn decode_0f(
    f: &mut Fetch,
    mut insn: Insn,
    seg_ovr: Option<u8>,
    wv: Width,
    addr32: bool,
) -> Result<Insn, Fault> {
    let op2 = f.b();
    let modrm = |f: &mut Fetch| if addr32 { modrm32(f) } else { modrm16(f) };

    match op2 {
        0x80..=0x8f => {
            insn.op = Op::Jcc(op2 & 0x0f);
            insn.src = Operand::Imm(f.rel(wv));
            insn.w = wv;
            insn.cycles = 4;
        }
        0xaf => {
            let mr = modrm(f);
            insn.seg = seg_ovr.unwrap_or(mr.def_seg);
            insn.op = Op::Imul2;
            insn.dst = Operand::Reg(mr.reg);
            insn.src = mr.rm;
            insn.w = wv;
            insn.cycles = 14;
        }
        0xb6 | 0xb7 | 0xbe | 0xbf => {
            let mr = modrm(f);
            insn.seg = seg_ovr.unwrap_or(mr.def_seg);
            insn.op = Op::Movx {
                sign: op2 >= 0xbe,
                src_w: if op2 & 1 == 0 { Width::Byte } else { Width::Word },
            };
            insn.dst = Operand::Reg(mr.reg);
            insn.src = mr.rm;
            insn.w = wv;
            insn.cycles = 3;
        }
        _ => return Err(Fault::InvalidOpcode),
    }

    if f.overflow {
        return Err(Fault::InvalidOpcode);
    }

    insn.len = f.len;
    Ok(insn)
}
