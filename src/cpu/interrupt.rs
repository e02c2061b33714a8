use crate::cpu::flags::Flags;
use crate::cpu::state::{reg, seg};
use crate::machine::Machine;

fn push16(m: &mut Machine, val: u16) {
    let sp = m.cpu.reg16(reg::SP).wrapping_sub(2);
    m.cpu.set_reg16(reg::SP, sp);
    let lin = m.cpu.seg_base(seg::SS).wrapping_add(sp as u32);
    m.mem_write_w(lin, val);
}

/// Real-mode interrupt entry, shared by INT n, INTO, hardware IRQs and
/// fault delivery. Pushes FLAGS, CS and IP, clears IF and TF, then vectors
/// through the IVT at physical 0.
pub fn enter(m: &mut Machine, vector: u8) {
    let fl = m.cpu.flags().bits() as u16;
    let cs = m.cpu.sregs[seg::CS as usize].sel;
    push16(m, fl);
    push16(m, cs);
    push16(m, m.cpu.ip as u16);

    m.cpu.set_flag(Flags::IF, false);
    m.cpu.set_flag(Flags::TF, false);

    let ivt = (vector as u32) * 4;
    let ip = m.mem_read_w(ivt);
    let sel = m.mem_read_w(ivt.wrapping_add(2));
    m.cpu.sregs[seg::CS as usize].load(sel);
    m.cpu.ip = ip as u32;
    m.cpu.halted = false;
}
