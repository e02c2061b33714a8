use crate::cpu::decode::decode_one;
use crate::cpu::exec::exec_insn;
use crate::cpu::flags::Flags;
use crate::cpu::interrupt;
use crate::cpu::state::seg;
use crate::cpu::{Cpu, Fault, Width};
use crate::dev::{DevId, DeviceTable};
use crate::io::{PortHandlers, PortMap};
use crate::jit::{translate, BlockCache};
use crate::mem::{Access, MemHandlers, MemoryMap, PAGE_SHIFT, PAGE_SIZE};
use crate::timing::Timing;

/// Cycles charged for a fault that never reached execution.
const FAULT_CYCLES: u32 = 20;

pub struct MachineConfig {
    /// Conventional RAM in bytes.
    pub ram_size: u32,
    /// Physical address span covered by the page tables.
    pub addr_space: u32,
    /// Emulated CPU clock in Hz.
    pub hz: u64,
    pub jit: bool,
    /// Decoded-instruction arena size before a whole-cache flush.
    pub jit_capacity: usize,
}

impl Default for MachineConfig {
    fn default() -> Self {
        MachineConfig {
            ram_size: 640 * 1024,
            addr_space: 16 << 20,
            hz: 4_772_727,
            jit: true,
            jit_capacity: 1 << 16,
        }
    }
}

/// The whole emulated PC. Every bus handler and timer callback receives
/// `&mut Machine`, so all shared state lives here and nothing is global.
pub struct Machine {
    pub cpu: Cpu,
    pub mem: MemoryMap,
    pub ports: PortMap,
    pub timing: Timing,
    pub devices: DeviceTable,
    pub jit: BlockCache,

    jit_enabled: bool,
    irq_lines: u16,
    cycle_budget: i64,
}

impl Machine {
    pub fn new(cfg: MachineConfig) -> Machine {
        Machine {
            cpu: Cpu::new(),
            mem: MemoryMap::new(cfg.ram_size, cfg.addr_space),
            ports: PortMap::new(),
            timing: Timing::new(cfg.hz),
            devices: DeviceTable::new(),
            jit: BlockCache::new(cfg.jit_capacity),
            jit_enabled: cfg.jit,
            irq_lines: 0,
            cycle_budget: 0,
        }
    }

    pub fn jit_enabled(&self) -> bool {
        self.jit_enabled
    }

    pub fn set_jit_enabled(&mut self, on: bool) {
        if self.jit_enabled && !on {
            self.jit.flush();
        }
        self.jit_enabled = on;
    }

    // ---- memory bus ----

    pub fn mem_read_b(&mut self, addr: u32) -> u8 {
        match self.mem.resolve(addr, 1, false) {
            Access::Backing(idx) => self.mem.backing_read_b(idx, addr),
            Access::Handler(h, dev) => self.handler_read(h, dev, addr, Width::Byte) as u8,
            Access::OpenBus | Access::Split => 0xff,
        }
    }

    pub fn mem_read_w(&mut self, addr: u32) -> u16 {
        match self.mem.resolve(addr, 2, false) {
            Access::Backing(idx) => self.mem.backing_read_w(idx, addr),
            Access::Handler(h, dev) => self.handler_read(h, dev, addr, Width::Word) as u16,
            Access::Split => {
                (self.mem_read_b(addr) as u16)
                    | (self.mem_read_b(addr.wrapping_add(1)) as u16) << 8
            }
            Access::OpenBus => 0xffff,
        }
    }

    pub fn mem_read_l(&mut self, addr: u32) -> u32 {
        match self.mem.resolve(addr, 4, false) {
            Access::Backing(idx) => self.mem.backing_read_l(idx, addr),
            Access::Handler(h, dev) => self.handler_read(h, dev, addr, Width::Dword),
            Access::Split => {
                (self.mem_read_w(addr) as u32)
                    | (self.mem_read_w(addr.wrapping_add(2)) as u32) << 16
            }
            Access::OpenBus => 0xffff_ffff,
        }
    }

    pub fn mem_write_b(&mut self, addr: u32, val: u8) {
        self.note_store(addr, 1);
        match self.mem.resolve(addr, 1, true) {
            Access::Backing(idx) => self.mem.backing_write_b(idx, addr, val),
            Access::Handler(h, dev) => self.handler_write(h, dev, addr, Width::Byte, val as u32),
            Access::OpenBus | Access::Split => {}
        }
    }

    pub fn mem_write_w(&mut self, addr: u32, val: u16) {
        self.note_store(addr, 2);
        match self.mem.resolve(addr, 2, true) {
            Access::Backing(idx) => self.mem.backing_write_w(idx, addr, val),
            Access::Handler(h, dev) => self.handler_write(h, dev, addr, Width::Word, val as u32),
            Access::Split => {
                self.mem_write_b(addr, val as u8);
                self.mem_write_b(addr.wrapping_add(1), (val >> 8) as u8);
            }
            Access::OpenBus => {}
        }
    }

    pub fn mem_write_l(&mut self, addr: u32, val: u32) {
        self.note_store(addr, 4);
        match self.mem.resolve(addr, 4, true) {
            Access::Backing(idx) => self.mem.backing_write_l(idx, addr, val),
            Access::Handler(h, dev) => self.handler_write(h, dev, addr, Width::Dword, val),
            Access::Split => {
                self.mem_write_w(addr, val as u16);
                self.mem_write_w(addr.wrapping_add(2), (val >> 16) as u16);
            }
            Access::OpenBus => {}
        }
    }

    fn note_store(&mut self, addr: u32, n: u32) {
        if self.mem.note_write(addr) {
            self.jit.invalidate_page(addr >> PAGE_SHIFT);
        }
        let last = addr.wrapping_add(n - 1);
        if (addr & (PAGE_SIZE - 1)) + n > PAGE_SIZE && self.mem.note_write(last) {
            self.jit.invalidate_page(last >> PAGE_SHIFT);
        }
    }

    fn handler_read(&mut self, h: MemHandlers, dev: DevId, addr: u32, w: Width) -> u32 {
        self.mem.defer_begin();
        let v = match w {
            Width::Byte => {
                if let Some(f) = h.read_b {
                    f(self, addr, dev) as u32
                } else if let Some(f) = h.read_w {
                    (f(self, addr & !1, dev) as u32 >> ((addr & 1) * 8)) & 0xff
                } else if let Some(f) = h.read_l {
                    (f(self, addr & !3, dev) >> ((addr & 3) * 8)) & 0xff
                } else {
                    0xff
                }
            }
            Width::Word => {
                if let Some(f) = h.read_w {
                    f(self, addr, dev) as u32
                } else if let Some(f) = h.read_b {
                    f(self, addr, dev) as u32
                        | (f(self, addr.wrapping_add(1), dev) as u32) << 8
                } else if let Some(f) = h.read_l {
                    (f(self, addr & !3, dev) >> ((addr & 3) * 8)) & 0xffff
                } else {
                    0xffff
                }
            }
            Width::Dword => {
                if let Some(f) = h.read_l {
                    f(self, addr, dev)
                } else if let Some(f) = h.read_w {
                    f(self, addr, dev) as u32
                        | (f(self, addr.wrapping_add(2), dev) as u32) << 16
                } else if let Some(f) = h.read_b {
                    f(self, addr, dev) as u32
                        | (f(self, addr.wrapping_add(1), dev) as u32) << 8
                        | (f(self, addr.wrapping_add(2), dev) as u32) << 16
                        | (f(self, addr.wrapping_add(3), dev) as u32) << 24
                } else {
                    0xffff_ffff
                }
            }
        };
        self.mem.defer_end();
        v
    }

    fn handler_write(&mut self, h: MemHandlers, dev: DevId, addr: u32, w: Width, val: u32) {
        self.mem.defer_begin();
        match w {
            Width::Byte => {
                if let Some(f) = h.write_b {
                    f(self, addr, val as u8, dev);
                }
            }
            Width::Word => {
                if let Some(f) = h.write_w {
                    f(self, addr, val as u16, dev);
                } else if let Some(f) = h.write_b {
                    f(self, addr, val as u8, dev);
                    f(self, addr.wrapping_add(1), (val >> 8) as u8, dev);
                }
            }
            Width::Dword => {
                if let Some(f) = h.write_l {
                    f(self, addr, val, dev);
                } else if let Some(f) = h.write_w {
                    f(self, addr, val as u16, dev);
                    f(self, addr.wrapping_add(2), (val >> 16) as u16, dev);
                } else if let Some(f) = h.write_b {
                    f(self, addr, val as u8, dev);
                    f(self, addr.wrapping_add(1), (val >> 8) as u8, dev);
                    f(self, addr.wrapping_add(2), (val >> 16) as u8, dev);
                    f(self, addr.wrapping_add(3), (val >> 24) as u8, dev);
                }
            }
        }
        self.mem.defer_end();
    }

    // ---- port bus ----

    pub fn io_in(&mut self, w: Width, port: u16) -> u32 {
        match w {
            Width::Byte => self.io_in_b(port) as u32,
            Width::Word => self.io_in_w(port) as u32,
            Width::Dword => self.io_in_l(port),
        }
    }

    pub fn io_out(&mut self, w: Width, port: u16, val: u32) {
        match w {
            Width::Byte => self.io_out_b(port, val as u8),
            Width::Word => self.io_out_w(port, val as u16),
            Width::Dword => self.io_out_l(port, val),
        }
    }

    pub fn io_in_b(&mut self, port: u16) -> u8 {
        let Some((h, dev)) = self.ports.resolve_read(port) else {
            return 0xff;
        };
        if let Some(f) = h.read_b {
            f(self, port, dev)
        } else if let Some(f) = h.read_w {
            (f(self, port & !1, dev) >> ((port & 1) * 8)) as u8
        } else if let Some(f) = h.read_l {
            (f(self, port & !3, dev) >> ((port & 3) * 8)) as u8
        } else {
            0xff
        }
    }

    pub fn io_in_w(&mut self, port: u16) -> u16 {
        if let Some((h, dev)) = self.ports.resolve_read(port) {
            if let Some(f) = h.read_w {
                return f(self, port, dev);
            }
        }
        (self.io_in_b(port) as u16) | (self.io_in_b(port.wrapping_add(1)) as u16) << 8
    }

    pub fn io_in_l(&mut self, port: u16) -> u32 {
        if let Some((h, dev)) = self.ports.resolve_read(port) {
            if let Some(f) = h.read_l {
                return f(self, port, dev);
            }
        }
        (self.io_in_w(port) as u32) | (self.io_in_w(port.wrapping_add(2)) as u32) << 16
    }

    pub fn io_out_b(&mut self, port: u16, val: u8) {
        let Some((h, dev)) = self.ports.resolve_write(port) else {
            return;
        };
        if let Some(f) = h.write_b {
            f(self, port, val, dev);
        }
    }

    pub fn io_out_w(&mut self, port: u16, val: u16) {
        if let Some((h, dev)) = self.ports.resolve_write(port) {
            if let Some(f) = h.write_w {
                f(self, port, val, dev);
                return;
            }
        }
        self.io_out_b(port, val as u8);
        self.io_out_b(port.wrapping_add(1), (val >> 8) as u8);
    }

    pub fn io_out_l(&mut self, port: u16, val: u32) {
        if let Some((h, dev)) = self.ports.resolve_write(port) {
            if let Some(f) = h.write_l {
                f(self, port, val, dev);
                return;
            }
        }
        self.io_out_w(port, val as u16);
        self.io_out_w(port.wrapping_add(2), (val >> 16) as u16);
    }

    // ---- interrupts ----

    pub fn raise_irq(&mut self, line: u8) {
        self.irq_lines |= 1 << line;
    }

    pub fn lower_irq(&mut self, line: u8) {
        self.irq_lines &= !(1 << line);
    }

    fn irq_vector(line: u8) -> u8 {
        if line < 8 {
            8 + line
        } else {
            0x70 + (line - 8)
        }
    }

    /// Delivers the lowest pending line if the CPU will take it. Edgeless
    /// level semantics: the line stays up until the device drops it, so the
    /// handler must ack at the device before STI/IRET.
    fn sample_irq(&mut self) {
        if self.irq_lines == 0 || !self.cpu.get_flag(Flags::IF) {
            return;
        }
        let line = self.irq_lines.trailing_zeros() as u8;
        interrupt::enter(self, Self::irq_vector(line));
    }

    // ---- execution ----

    fn deliver_fault(&mut self, f: Fault, insn_ip: u32) {
        self.cpu.ip = insn_ip & 0xffff;
        interrupt::enter(self, f.vector());
    }

    /// Decode-dispatch one instruction.
    pub fn interp_step(&mut self) -> u32 {
        let cs_base = self.cpu.seg_base(seg::CS);
        let start_ip = self.cpu.ip & 0xffff;
        let insn = match decode_one(self, cs_base, start_ip) {
            Ok(i) => i,
            Err(f) => {
                self.deliver_fault(f, start_ip);
                return FAULT_CYCLES;
            }
        };
        self.cpu.ip = start_ip.wrapping_add(insn.len as u32) & 0xffff;
        match exec_insn(self, &insn) {
            Ok(c) => c,
            Err(f) => {
                self.deliver_fault(f, start_ip);
                FAULT_CYCLES
            }
        }
    }

    /// Run one translated block, translating on miss. Replays the same
    /// decoded form the stepping path executes, so the two modes cannot
    /// drift except in where interrupts are sampled.
    fn block_step(&mut self) -> u32 {
        let cs_base = self.cpu.seg_base(seg::CS);
        let ip = self.cpu.ip & 0xffff;
        let phys = cs_base.wrapping_add(ip);

        let bi = match self.jit.lookup(phys, &self.mem) {
            Some(bi) => bi,
            None => match translate(self, cs_base, ip) {
                Ok(bi) => bi,
                Err(f) => {
                    self.deliver_fault(f, ip);
                    return FAULT_CYCLES;
                }
            },
        };

        let count = self.jit.ops(bi).len();
        let mut spent = 0u32;
        for i in 0..count {
            let insn = self.jit.ops(bi)[i];
            let start_ip = self.cpu.ip & 0xffff;
            self.cpu.ip = start_ip.wrapping_add(insn.len as u32) & 0xffff;
            match exec_insn(self, &insn) {
                Ok(c) => spent += c,
                Err(f) => {
                    self.deliver_fault(f, start_ip);
                    spent += FAULT_CYCLES;
                    break;
                }
            }
        }
        spent
    }

    /// Runs for (at least) `cycles` emulated cycles. Timers are serviced
    /// and interrupt lines sampled between instructions in stepping mode
    /// and between blocks in translated mode. A halted CPU fast-forwards
    /// to the next timer deadline instead of spinning.
    pub fn run(&mut self, cycles: i64) {
        self.cycle_budget += cycles;
        while self.cycle_budget > 0 {
            while let Some((id, cb, dev)) = self.timing.pop_due() {
                cb(self, id, dev);
            }
            self.sample_irq();

            if self.cpu.halted {
                match self.timing.next_due_in() {
                    Some(d) => {
                        self.timing.consume(d);
                        self.cycle_budget -= d as i64;
                    }
                    None => {
                        self.cycle_budget = 0;
                    }
                }
                continue;
            }

            let spent = if self.jit_enabled {
                self.block_step()
            } else {
                self.interp_step()
            };
            let spent = spent.max(1);
            self.timing.consume(spent as u64);
            self.cycle_budget -= spent as i64;
        }
    }

    // ---- lifecycle ----

    pub fn reset(&mut self) {
        self.cpu.reset();
        self.devices.for_each_mut(|d| d.reset());
        self.jit.flush();
        self.irq_lines = 0;
    }

    pub fn set_speed(&mut self, hz: u64) {
        self.timing.set_speed(hz);
        self.devices.for_each_mut(|d| d.speed_changed(hz));
    }

    /// Tears a device down: its mappings, port ranges and timers all go
    /// with it.
    pub fn remove_device(&mut self, id: DevId) {
        self.mem.remove_owned(id);
        self.ports.remove_owned(id);
        self.timing.remove_owned(id);
        if let Some(d) = self.devices.take(id) {
            log::info!("removed device {}", d.name());
        }
    }

    /// Claim a port range for a device already in the table.
    pub fn claim_ports(
        &mut self,
        base: u16,
        len: u32,
        stride: u8,
        handlers: PortHandlers,
        dev: DevId,
    ) -> Result<crate::io::PortHandle, crate::io::PortSetupError> {
        self.ports.register(base, len, stride, handlers, dev)
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use crate::mem::Backing;

    /// Bare machine with 64 KiB of RAM at 0 and no devices.
    pub fn test_machine(jit: bool) -> Machine {
        let mut m = Machine::new(MachineConfig {
            ram_size: 0x10000,
            addr_space: 1 << 20,
            hz: 1_000_000,
            jit,
            jit_capacity: 1 << 14,
        });
        m.mem
            .register(0, 0x10000, MemHandlers::NONE, Backing::Ram { off: 0 }, DevId::NONE)
            .expect("ram mapping");
        m
    }

    /// Loads `code` at CS:IP = 0:`ip` with a stack at 0:0xf000.
    pub fn load(m: &mut Machine, ip: u32, code: &[u8]) {
        for (i, b) in code.iter().enumerate() {
            m.mem_write_b(ip + i as u32, *b);
        }
        m.cpu.sregs[seg::CS as usize].load(0);
        m.cpu.sregs[seg::DS as usize].load(0);
        m.cpu.sregs[seg::ES as usize].load(0);
        m.cpu.sregs[seg::SS as usize].load(0);
        m.cpu.ip = ip;
        m.cpu.set_reg16(crate::cpu::state::reg::SP, 0xf000);
    }

    pub fn run_to_halt(m: &mut Machine) {
        for _ in 0..10_000 {
            if m.cpu.halted {
                return;
            }
            m.run(100);
        }
        panic!("machine did not halt");
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{load, run_to_halt, test_machine};
    use super::*;
    use crate::cpu::state::reg;
    use crate::mem::Backing;
    use crate::timing::TimerId;

    #[test]
    fn runs_a_small_program() {
        let mut m = test_machine(false);
        #[rustfmt::skip]
        load(&mut m, 0x100, &[
            0xb8, 0x34, 0x12,       // mov ax, 0x1234
            0x05, 0x01, 0x00,       // add ax, 1
            0x50,                   // push ax
            0x58,                   // pop ax
            0xf4,                   // hlt
        ]);
        run_to_halt(&mut m);
        assert_eq!(m.cpu.reg16(reg::AX), 0x1235);
        assert_eq!(m.cpu.reg16(reg::SP), 0xf000);
    }

    #[test]
    fn stepping_and_translated_runs_agree() {
        #[rustfmt::skip]
        let prog: &[u8] = &[
            0xb9, 0x05, 0x00,       // mov cx, 5
            0xb8, 0x00, 0x00,       // mov ax, 0
            // L:
            0x03, 0xc1,             // add ax, cx
            0xe2, 0xfc,             // loop L
            0xf7, 0xd8,             // neg ax
            0x1d, 0x01, 0x00,       // sbb ax, 1
            0xf4,                   // hlt
        ];
        let mut a = test_machine(false);
        let mut b = test_machine(true);
        load(&mut a, 0x100, prog);
        load(&mut b, 0x100, prog);
        run_to_halt(&mut a);
        run_to_halt(&mut b);
        assert_eq!(a.cpu.gpr, b.cpu.gpr);
        assert_eq!(a.cpu.ip, b.cpu.ip);
        assert_eq!(a.cpu.flags(), b.cpu.flags());
    }

    #[test]
    fn self_modifying_code_retranslates() {
        // call a leaf twice, patching its immediate in between
        #[rustfmt::skip]
        let prog: &[u8] = &[
            // 0x200
            0xe8, 0x0b, 0x01,             // call 0x30e
            // 0x203
            0xc6, 0x06, 0x0f, 0x03, 0x42, // mov byte [0x30f], 0x42
            // 0x208
            0xe8, 0x03, 0x01,             // call 0x30e
            // 0x20b
            0xf4,                         // hlt
        ];
        let leaf: &[u8] = &[
            0xb0, 0x00, // mov al, 0
            0xc3,       // ret
        ];
        for jit in [false, true] {
            let mut m = test_machine(jit);
            load(&mut m, 0x200, prog);
            for (i, b) in leaf.iter().enumerate() {
                m.mem_write_b(0x30e + i as u32, *b);
            }
            run_to_halt(&mut m);
            assert_eq!(m.cpu.reg8(0), 0x42, "jit={jit}");
        }
    }

    #[test]
    fn write_to_wrapped_fetch_page_invalidates_block() {
        let mut m = test_machine(true);
        // mov ax, imm16 at 0:0xfffe wraps, fetching its high immediate
        // byte from 0:0x0000
        load(&mut m, 0xfffe, &[0xb8, 0x78]);
        m.mem_write_b(0x0000, 0x12);
        m.mem_write_b(0x0001, 0xf4); // hlt
        run_to_halt(&mut m);
        assert_eq!(m.cpu.reg16(reg::AX), 0x1278);

        m.mem_write_b(0x0000, 0x99);
        m.cpu.halted = false;
        m.cpu.ip = 0xfffe;
        run_to_halt(&mut m);
        assert_eq!(m.cpu.reg16(reg::AX), 0x9978);
    }

    #[test]
    fn store_to_code_page_drops_blocks() {
        let mut m = test_machine(true);
        load(&mut m, 0x100, &[0xf4]); // hlt
        run_to_halt(&mut m);
        assert!(m.jit.lookup(0x100, &m.mem).is_some());
        m.mem_write_b(0x105, 0x90);
        assert!(m.jit.lookup(0x100, &m.mem).is_none());
    }

    #[test]
    fn open_bus_reads_all_ones() {
        let mut m = test_machine(false);
        assert_eq!(m.mem_read_b(0x80000), 0xff);
        assert_eq!(m.mem_read_w(0x80000), 0xffff);
        assert_eq!(m.io_in_b(0x1234), 0xff);
        assert_eq!(m.io_in_w(0x1234), 0xffff);
        // writes to nothing are dropped, not faults
        m.mem_write_w(0x80000, 0x1234);
        m.io_out_b(0x1234, 0x56);
    }

    #[test]
    fn straddling_word_write_splits_per_byte() {
        let mut m = test_machine(false);
        m.mem_write_w(0x0fff, 0xbbaa);
        assert_eq!(m.mem_read_b(0x0fff), 0xaa);
        assert_eq!(m.mem_read_b(0x1000), 0xbb);
        assert_eq!(m.mem_read_w(0x0fff), 0xbbaa);
    }

    #[test]
    fn divide_fault_vectors_through_ivt() {
        let mut m = test_machine(false);
        // IVT vector 0 -> 0:0x400
        m.mem_write_w(0, 0x400);
        m.mem_write_w(2, 0);
        m.mem_write_b(0x400, 0xf4); // hlt
        #[rustfmt::skip]
        load(&mut m, 0x100, &[
            0xb3, 0x00,             // mov bl, 0
            0xf6, 0xf3,             // div bl
        ]);
        run_to_halt(&mut m);
        assert_eq!(m.cpu.ip, 0x401);
        // pushed return ip is the faulting instruction, not past it
        let ret_ip = m.mem_read_w(0xf000 - 6);
        assert_eq!(ret_ip, 0x102);
    }

    #[test]
    fn irq_delivered_only_with_if_set() {
        let mut m = test_machine(false);
        // IRQ0 -> vector 8 -> 0:0x500
        m.mem_write_w(8 * 4, 0x500);
        m.mem_write_w(8 * 4 + 2, 0);
        m.mem_write_b(0x500, 0xf4); // hlt
        #[rustfmt::skip]
        load(&mut m, 0x100, &[
            0xfa,       // cli
            0x90,       // nop
            0xfb,       // sti
            0x90,       // nop
            0xeb, 0xfc, // jmp back to sti
        ]);
        m.raise_irq(0);
        run_to_halt(&mut m);
        assert_eq!(m.cpu.ip, 0x501);
        m.lower_irq(0);
    }

    fn poke_timer(m: &mut Machine, _id: TimerId, _dev: DevId) {
        m.mem_write_b(0x900, 0x5a);
    }

    #[test]
    fn timers_fire_from_consumed_cycles() {
        let mut m = test_machine(false);
        load(&mut m, 0x100, &[0xeb, 0xfe]); // jmp $
        let id = m.timing.add(poke_timer, DevId::NONE);
        m.timing.arm(id, 500);
        m.run(1000);
        assert_eq!(m.mem_read_b(0x900), 0x5a);
    }

    #[test]
    fn halted_cpu_skips_to_deadline() {
        let mut m = test_machine(false);
        load(&mut m, 0x100, &[0xf4]); // hlt
        let id = m.timing.add(poke_timer, DevId::NONE);
        m.timing.arm(id, 100_000);
        m.run(200_000);
        assert_eq!(m.mem_read_b(0x900), 0x5a);
        // tsc jumped, it did not burn cycles one at a time
        assert!(m.timing.tsc() >= 100_000);
    }

    #[test]
    fn halted_fast_forward_reaches_distant_deadlines() {
        let mut m = test_machine(false);
        load(&mut m, 0x100, &[0xf4]); // hlt
        let id = m.timing.add(poke_timer, DevId::NONE);
        let far = u32::MAX as u64 + 5_000;
        m.timing.arm(id, far);
        m.run(far as i64 + 100);
        assert_eq!(m.mem_read_b(0x900), 0x5a);
        // the tsc landed exactly on the deadline, no truncated skip
        assert_eq!(m.timing.tsc(), far);
    }

    struct Clocked {
        hz_seen: u64,
    }

    impl crate::dev::Device for Clocked {
        fn name(&self) -> &'static str {
            "clocked"
        }

        fn speed_changed(&mut self, hz: u64) {
            self.hz_seen = hz;
        }

        fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
            self
        }
    }

    #[test]
    fn speed_change_fans_out_to_devices() {
        let mut m = test_machine(false);
        let id = m.devices.add(Box::new(Clocked { hz_seen: 0 }));
        m.set_speed(8_000_000);
        assert_eq!(m.timing.hz(), 8_000_000);
        assert_eq!(m.devices.downcast_mut::<Clocked>(id).unwrap().hz_seen, 8_000_000);
    }

    #[test]
    fn rep_with_zero_count_does_nothing() {
        let mut m = test_machine(false);
        m.mem_write_b(0x800, 0x77);
        #[rustfmt::skip]
        load(&mut m, 0x100, &[
            0xb9, 0x00, 0x00,       // mov cx, 0
            0xbf, 0x00, 0x08,       // mov di, 0x800
            0xb0, 0x11,             // mov al, 0x11
            0xf3, 0xaa,             // rep stosb
            0xf4,                   // hlt
        ]);
        run_to_halt(&mut m);
        assert_eq!(m.mem_read_b(0x800), 0x77);
        assert_eq!(m.cpu.reg16(reg::DI), 0x800);
    }

    #[test]
    fn device_teardown_releases_everything() {
        let mut m = test_machine(false);
        let id = crate::dev::post::Post::install(&mut m).unwrap();
        m.io_out_b(0x80, 0x33);
        assert_eq!(m.io_in_b(0x80), 0x33);
        m.remove_device(id);
        assert_eq!(m.io_in_b(0x80), 0xff);
        assert!(m.devices.get_mut(id).is_none());
    }

    #[test]
    fn rom_shadows_ram_for_reads_only() {
        let mut m = test_machine(false);
        let rom: std::sync::Arc<[u8]> = vec![0xc3; 0x1000].into();
        m.mem
            .register(0x8000, 0x1000, MemHandlers::NONE, Backing::Rom(rom), DevId::NONE)
            .unwrap();
        assert_eq!(m.mem_read_b(0x8010), 0xc3);
        m.mem_write_b(0x8010, 0x42);
        // the write landed in the ram underneath
        assert_eq!(m.mem_read_b(0x8010), 0xc3);
        assert_eq!(m.mem.ram()[0x8010], 0x42);
    }
}
