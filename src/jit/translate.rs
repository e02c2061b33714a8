use crate::cpu::decode::{decode_one, Insn};
use crate::cpu::Fault;
use crate::jit::cache::{PageStamp, MAX_BLOCK_INSNS};
use crate::machine::Machine;
use crate::mem::PAGE_SHIFT;

/// Decodes a straight-line run starting at CS:IP and installs it as a
/// block. Translation stops at the first branch, at the block length cap,
/// or before the next instruction would start in a different page. A fault
/// decoding the first instruction is the caller's to deliver; a fault
/// further in just ends the block early so the stepping path hits it at
/// the architecturally right IP.
pub fn translate(m: &mut Machine, cs_base: u32, ip: u32) -> Result<usize, Fault> {
    let entry = cs_base.wrapping_add(ip & 0xffff);
    let entry_page = entry >> PAGE_SHIFT;

    let mut ops: Vec<Insn> = Vec::with_capacity(16);
    let mut cur_ip = ip & 0xffff;
    let mut byte_len = 0u32;

    loop {
        let insn = match decode_one(m, cs_base, cur_ip) {
            Ok(i) => i,
            Err(f) => {
                if ops.is_empty() {
                    return Err(f);
                }
                break;
            }
        };
        byte_len += insn.len as u32;
        cur_ip = cur_ip.wrapping_add(insn.len as u32) & 0xffff;
        let ends = insn.ends_block();
        ops.push(insn);

        if ends || ops.len() >= MAX_BLOCK_INSNS {
            break;
        }
        if cs_base.wrapping_add(cur_ip) >> PAGE_SHIFT != entry_page {
            break;
        }
    }

    // IP wraps at the segment boundary, so the last fetched byte can sit
    // in a page below the entry page. Stamp the page it physically landed
    // in, not entry + byte_len.
    let last_byte = cs_base.wrapping_add(ip.wrapping_add(byte_len - 1) & 0xffff);
    let pages = [entry_page, last_byte >> PAGE_SHIFT];
    let npages = if pages[0] == pages[1] { 1 } else { 2 };
    let page_count = m.mem.limit() >> PAGE_SHIFT;
    let mut stamps = [PageStamp { page: 0, gen: 0 }; 2];
    let mut n = 0;
    for &p in &pages[..npages] {
        if p >= page_count {
            continue;
        }
        m.mem.mark_code(p as usize);
        stamps[n] = PageStamp {
            page: p,
            gen: m.mem.page_gen(p as usize),
        };
        n += 1;
    }

    Ok(m.jit.insert(entry, byte_len, &ops, &stamps[..n]))
}
