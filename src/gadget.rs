//! Microgadget mining, classification, and filtering.
//!
//! Scans executable sections for single instructions immediately
//! preceding a RET. These microgadgets are the atomic building blocks
//! of ROP chains: each is tagged with the semantic operation it
//! performs, and gadgets the chain builder cannot control (stack-pointer
//! operands, indexed or segment-relative memory) are dropped.

use std::collections::HashSet;

use iced_x86::{Mnemonic, Register};

use crate::disasm::{self, Operand};
use crate::elf::Section;
use crate::types::VirtAddr;

/// The single-byte near-RET opcode anchoring every microgadget.
pub const RET_OPCODE: u8 = 0xC3;

/// Upper bound on the retrograde decode window in bytes, RET included.
pub const MAX_DEPTH: usize = 4;

/// Semantic class of a microgadget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GadgetClass {
    /// `pop reg` — initialise a register from the stack.
    RegInit,
    /// `xor reg, reg` — zero a register.
    RegReset,
    /// `mov reg, [reg]` — load a register through a plain pointer.
    RegLoad,
    /// `mov [reg], reg` — store a register through a plain pointer.
    RegStore,
    /// `xchg reg1, reg2` — swap two distinct registers.
    RegXchg,
    /// Everything else. Kept in the table, addressable by key only.
    Undefined,
}

/// A single instruction observed immediately before a RET.
///
/// Owns all of its data; nothing borrows from the decoder once mining
/// completes. The trailing RET is implied and never stored.
#[derive(Debug, Clone)]
pub struct Microgadget {
    /// Virtual address of the instruction.
    pub addr: VirtAddr,
    /// Architectural opcode of the instruction.
    pub mnemonic: Mnemonic,
    /// Canonical text `"<mnemonic> <op_str>;"`, unique across the table.
    pub key: String,
    /// The first two operands, in decode order.
    pub operands: Vec<Operand>,
    /// Semantic class, assigned by [`classify`].
    pub class: GadgetClass,
}

impl Microgadget {
    /// The i-th operand, if the instruction has one.
    pub fn op(&self, index: usize) -> Option<&Operand> {
        self.operands.get(index)
    }
}

/// Scan every executable section of `buf` for microgadgets.
///
/// At each RET byte, retrograde windows of `MAX_DEPTH` down to zero
/// bytes (ending just past the RET) are probed, enumerating the
/// possible lengths of the preceding instruction. A window is accepted
/// when it decodes to exactly two instructions that consume it fully,
/// the second being the RET. The first unique key wins; later sightings
/// of the same text at other addresses are dropped.
pub fn mine(buf: &[u8], sections: &[Section]) -> Vec<Microgadget> {
    let mut gadgets = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    for section in sections {
        let start = section.file_offset as usize;
        let end = match start.checked_add(section.size as usize) {
            Some(end) if end <= buf.len() => end,
            _ => {
                log::warn!("section {} lies outside the file image", section.name);
                continue;
            }
        };
        let code = &buf[start..end];
        let mut found = 0usize;

        for i in 0..code.len() {
            if code[i] != RET_OPCODE {
                continue;
            }
            for depth in (0..=MAX_DEPTH).rev() {
                if depth > i + 1 {
                    continue;
                }
                let window_start = i + 1 - depth;
                let vaddr = section.vaddr + window_start as u64;
                if let Some(gadget) = try_decode_pair(&code[window_start..i + 1], vaddr) {
                    if seen.insert(gadget.key.clone()) {
                        gadgets.push(gadget);
                        found += 1;
                    }
                }
            }
        }
        log::debug!("section {}: {} gadgets found", section.name, found);
    }

    log::debug!("found {} unique microgadgets", gadgets.len());
    gadgets
}

/// Try to read `window` as a (non-RET instruction, RET) pair.
fn try_decode_pair(window: &[u8], vaddr: VirtAddr) -> Option<Microgadget> {
    if window.is_empty() {
        return None;
    }
    let insns = disasm::decode(window, vaddr, 3);
    if insns.len() != 2 {
        return None;
    }
    // Both instructions must land exactly on the anchoring RET byte.
    let total: usize = insns.iter().map(|insn| insn.len()).sum();
    if total != window.len() {
        return None;
    }
    if insns[1].mnemonic() != Mnemonic::Ret || insns[0].mnemonic() == Mnemonic::Ret {
        return None;
    }

    let first = &insns[0];
    let operands = disasm::operands_of(first).ok()?;
    Some(Microgadget {
        addr: vaddr,
        mnemonic: first.mnemonic(),
        key: disasm::render_key(first),
        operands,
        class: GadgetClass::Undefined,
    })
}

/// Assign a semantic class to every gadget.
pub fn classify(gadgets: &mut [Microgadget]) {
    for gadget in gadgets.iter_mut() {
        gadget.class = classify_one(gadget);
        log::trace!("{} {:?}", gadget.key, gadget.class);
    }
}

fn classify_one(gadget: &Microgadget) -> GadgetClass {
    match gadget.mnemonic {
        Mnemonic::Pop => match gadget.op(0) {
            Some(Operand::Register(_)) => GadgetClass::RegInit,
            _ => GadgetClass::Undefined,
        },
        Mnemonic::Xor => match (gadget.op(0), gadget.op(1)) {
            (Some(Operand::Register(a)), Some(Operand::Register(b))) if a == b => {
                GadgetClass::RegReset
            }
            _ => GadgetClass::Undefined,
        },
        Mnemonic::Mov => match (gadget.op(0), gadget.op(1)) {
            (Some(Operand::Register(_)), Some(mem @ Operand::Memory { .. }))
                if mem.is_plain_deref() =>
            {
                GadgetClass::RegLoad
            }
            (Some(mem @ Operand::Memory { .. }), Some(Operand::Register(_)))
                if mem.is_plain_deref() =>
            {
                GadgetClass::RegStore
            }
            _ => GadgetClass::Undefined,
        },
        Mnemonic::Xchg => match (gadget.op(0), gadget.op(1)) {
            (Some(Operand::Register(a)), Some(Operand::Register(b))) if a != b => {
                GadgetClass::RegXchg
            }
            _ => GadgetClass::Undefined,
        },
        _ => GadgetClass::Undefined,
    }
}

/// Drop gadgets the chain builder cannot use.
///
/// A gadget is excluded when any operand touches ESP (directly or as a
/// memory base), or when a memory operand has no base register, an index
/// register, or a segment override. Runs once, after classification.
pub fn apply_filters(gadgets: &mut Vec<Microgadget>) {
    let before = gadgets.len();
    gadgets.retain(|gadget| {
        let keep = !is_excluded(gadget);
        if !keep {
            log::debug!("filter excluded: {}", gadget.key);
        }
        keep
    });
    log::debug!("{} gadgets excluded by filtering", before - gadgets.len());
}

fn is_excluded(gadget: &Microgadget) -> bool {
    gadget.operands.iter().any(|op| match *op {
        Operand::Register(reg) => reg == Register::ESP,
        Operand::Memory {
            base,
            index,
            segment,
            ..
        } => {
            base == Register::ESP
                || base == Register::None
                || index != Register::None
                || segment != Register::None
        }
        Operand::Immediate(_) => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_section(len: usize) -> Vec<Section> {
        vec![Section {
            name: ".text".to_string(),
            vaddr: VirtAddr(0x1000),
            size: len as u64,
            file_offset: 0,
        }]
    }

    fn mined(code: &[u8]) -> Vec<Microgadget> {
        let mut gadgets = mine(code, &text_section(code.len()));
        classify(&mut gadgets);
        gadgets
    }

    #[test]
    fn mine_pop_ret() {
        // pop eax; ret
        let code = [0x58, 0xC3];
        let gadgets = mined(&code);
        assert_eq!(gadgets.len(), 1);
        assert_eq!(gadgets[0].key, "pop eax;");
        assert_eq!(gadgets[0].addr, VirtAddr(0x1000));
        assert_eq!(gadgets[0].mnemonic, Mnemonic::Pop);
        assert_eq!(gadgets[0].class, GadgetClass::RegInit);
    }

    #[test]
    fn dedup_keeps_first_address() {
        // pop eax; ret -- twice
        let code = [0x58, 0xC3, 0x58, 0xC3];
        let gadgets = mined(&code);
        assert_eq!(gadgets.len(), 1);
        assert_eq!(gadgets[0].addr, VirtAddr(0x1000));
    }

    #[test]
    fn dedup_across_sections_keeps_first() {
        let code = [0x58, 0xC3, 0x58, 0xC3];
        let sections = vec![
            Section {
                name: ".text".to_string(),
                vaddr: VirtAddr(0x1000),
                size: 2,
                file_offset: 0,
            },
            Section {
                name: ".plt".to_string(),
                vaddr: VirtAddr(0x2000),
                size: 2,
                file_offset: 2,
            },
        ];
        let gadgets = mine(&code, &sections);
        assert_eq!(gadgets.len(), 1);
        assert_eq!(gadgets[0].addr, VirtAddr(0x1000));
    }

    #[test]
    fn gadget_at_interior_offset() {
        // nop; pop eax; ret
        let code = [0x90, 0x58, 0xC3];
        let gadgets = mined(&code);
        assert_eq!(gadgets.len(), 1);
        assert_eq!(gadgets[0].addr, VirtAddr(0x1001));
    }

    #[test]
    fn lone_ret_is_not_a_gadget() {
        let code = [0xC3];
        assert!(mined(&code).is_empty());
    }

    #[test]
    fn ret_ret_is_not_a_gadget() {
        let code = [0xC3, 0xC3];
        assert!(mined(&code).is_empty());
    }

    #[test]
    fn three_byte_instruction_is_reached() {
        // mov eax, ecx; ret (89 c8 c3) -- needs depth 3
        let code = [0x89, 0xC8, 0xC3];
        let gadgets = mined(&code);
        assert_eq!(gadgets.len(), 1);
        assert_eq!(gadgets[0].mnemonic, Mnemonic::Mov);
        assert_eq!(gadgets[0].class, GadgetClass::Undefined);
    }

    #[test]
    fn classify_reg_reset() {
        // xor eax, eax; ret
        let code = [0x31, 0xC0, 0xC3];
        let gadgets = mined(&code);
        assert_eq!(gadgets.len(), 1);
        assert_eq!(gadgets[0].class, GadgetClass::RegReset);
    }

    #[test]
    fn xor_of_distinct_registers_is_undefined() {
        // xor eax, ecx; ret
        let code = [0x31, 0xC8, 0xC3];
        let gadgets = mined(&code);
        assert_eq!(gadgets.len(), 1);
        assert_eq!(gadgets[0].class, GadgetClass::Undefined);
    }

    #[test]
    fn classify_reg_load() {
        // mov eax, [ecx]; ret
        let code = [0x8B, 0x01, 0xC3];
        let gadgets = mined(&code);
        assert_eq!(gadgets.len(), 1);
        assert_eq!(gadgets[0].class, GadgetClass::RegLoad);
    }

    #[test]
    fn classify_reg_store() {
        // mov [ecx], eax; ret
        let code = [0x89, 0x01, 0xC3];
        let gadgets = mined(&code);
        assert_eq!(gadgets.len(), 1);
        assert_eq!(gadgets[0].class, GadgetClass::RegStore);
    }

    #[test]
    fn displaced_load_is_undefined() {
        // mov eax, [ecx+4]; ret
        let code = [0x8B, 0x41, 0x04, 0xC3];
        let gadgets = mined(&code);
        assert_eq!(gadgets.len(), 1);
        assert_eq!(gadgets[0].class, GadgetClass::Undefined);
    }

    #[test]
    fn classify_reg_xchg() {
        // xchg between eax and ecx; ret
        let code = [0x87, 0xC1, 0xC3];
        let gadgets = mined(&code);
        assert_eq!(gadgets.len(), 1);
        assert_eq!(gadgets[0].class, GadgetClass::RegXchg);
        let regs: Vec<_> = gadgets[0]
            .operands
            .iter()
            .filter_map(Operand::register)
            .collect();
        assert!(regs.contains(&Register::EAX));
        assert!(regs.contains(&Register::ECX));
    }

    #[test]
    fn filter_drops_esp_register_operand() {
        // push esp; ret -- then pop eax; ret
        let code = [0x54, 0xC3, 0x58, 0xC3];
        let mut gadgets = mined(&code);
        assert_eq!(gadgets.len(), 2);
        apply_filters(&mut gadgets);
        assert_eq!(gadgets.len(), 1);
        assert_eq!(gadgets[0].key, "pop eax;");
    }

    #[test]
    fn filter_drops_pop_esp() {
        // pop esp; ret
        let code = [0x5C, 0xC3];
        let mut gadgets = mined(&code);
        assert_eq!(gadgets.len(), 1);
        apply_filters(&mut gadgets);
        assert!(gadgets.is_empty());
    }

    #[test]
    fn filter_drops_esp_memory_base() {
        // mov eax, [esp]; ret
        let code = [0x8B, 0x04, 0x24, 0xC3];
        let mut gadgets = mined(&code);
        assert_eq!(gadgets.len(), 1);
        apply_filters(&mut gadgets);
        assert!(gadgets.is_empty());
    }

    #[test]
    fn filter_drops_indexed_memory() {
        // mov eax, [ecx+edx*2]; ret
        let code = [0x8B, 0x04, 0x51, 0xC3];
        let mut gadgets = mined(&code);
        assert_eq!(gadgets.len(), 1);
        apply_filters(&mut gadgets);
        assert!(gadgets.is_empty());
    }

    #[test]
    fn filter_drops_segment_override() {
        // mov eax, fs:[ecx]; ret
        let code = [0x64, 0x8B, 0x01, 0xC3];
        let mut gadgets = mined(&code);
        assert_eq!(gadgets.len(), 1);
        apply_filters(&mut gadgets);
        assert!(gadgets.is_empty());
    }

    #[test]
    fn filter_keeps_clean_undefined_gadgets() {
        // push eax; ret -- undefined class but no excluded operand
        let code = [0x50, 0xC3];
        let mut gadgets = mined(&code);
        assert_eq!(gadgets.len(), 1);
        assert_eq!(gadgets[0].class, GadgetClass::Undefined);
        apply_filters(&mut gadgets);
        assert_eq!(gadgets.len(), 1);
    }

    #[test]
    fn filter_keeps_displaced_memory_with_valid_base() {
        // mov eax, [ecx+4]; ret -- disp disqualifies the class, not the gadget
        let code = [0x8B, 0x41, 0x04, 0xC3];
        let mut gadgets = mined(&code);
        apply_filters(&mut gadgets);
        assert_eq!(gadgets.len(), 1);
    }

    #[test]
    fn truncated_section_is_skipped() {
        let code = [0x58, 0xC3];
        let sections = vec![Section {
            name: ".bogus".to_string(),
            vaddr: VirtAddr(0x1000),
            size: 100,
            file_offset: 0,
        }];
        assert!(mine(&code, &sections).is_empty());
    }

    #[test]
    fn keys_are_unique() {
        // A mix with several duplicate encodings.
        let code = [
            0x58, 0xC3, // pop eax; ret
            0x59, 0xC3, // pop ecx; ret
            0x58, 0xC3, // pop eax; ret (duplicate)
            0x31, 0xC0, 0xC3, // xor eax, eax; ret
        ];
        let gadgets = mined(&code);
        let keys: HashSet<_> = gadgets.iter().map(|g| g.key.as_str()).collect();
        assert_eq!(keys.len(), gadgets.len());
        assert_eq!(gadgets.len(), 3);
    }
}
