//! x86-32 instruction decoding using iced-x86.
//!
//! The adapter is a thin, pure layer over the decoder: it turns byte
//! slices into instruction lists, converts decoder operands into owned
//! [`Operand`] descriptors, and renders the canonical mnemonic key used
//! to deduplicate gadgets.

use iced_x86::{
    Decoder, DecoderOptions, Formatter, FormatterOutput, FormatterTextKind, Instruction,
    IntelFormatter, MemorySizeOptions, OpKind, Register,
};

use crate::error::{Error, Result};
use crate::types::VirtAddr;

/// Owned operand descriptor.
///
/// Carries everything the classifier, filter, and lookup queries need,
/// decoupled from the decoder's storage. `Register::None` stands for an
/// absent base/index/segment register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    /// A register operand.
    Register(Register),
    /// An immediate (branch targets included, modelled as immediates).
    Immediate(u64),
    /// A memory operand: `segment:[base + index*scale + displacement]`.
    Memory {
        base: Register,
        index: Register,
        scale: u32,
        displacement: i64,
        segment: Register,
    },
}

/// Operand kind tag, used by shape-based gadget lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperandKind {
    Register,
    Immediate,
    Memory,
}

impl Operand {
    /// The kind tag of this operand.
    pub fn kind(&self) -> OperandKind {
        match self {
            Operand::Register(_) => OperandKind::Register,
            Operand::Immediate(_) => OperandKind::Immediate,
            Operand::Memory { .. } => OperandKind::Memory,
        }
    }

    /// The register of a register operand, if it is one.
    pub fn register(&self) -> Option<Register> {
        match self {
            Operand::Register(reg) => Some(*reg),
            _ => None,
        }
    }

    /// True for a bare `[base]` dereference: no segment override, no
    /// index, scale 1, zero displacement.
    pub fn is_plain_deref(&self) -> bool {
        matches!(
            self,
            Operand::Memory {
                base: _,
                index: Register::None,
                scale: 1,
                displacement: 0,
                segment: Register::None,
            }
        )
    }
}

/// Decode up to `max_insns` instructions from `code`.
///
/// Decoding stops at the first invalid byte sequence. The slice length
/// bounds how many bytes are examined; `base_addr` seeds the instruction
/// pointer so every decoded instruction carries its virtual address.
pub fn decode(code: &[u8], base_addr: VirtAddr, max_insns: usize) -> Vec<Instruction> {
    let mut decoder = Decoder::with_ip(32, code, base_addr.addr(), DecoderOptions::NONE);
    let mut results = Vec::new();

    while decoder.can_decode() && results.len() < max_insns {
        let mut insn = Instruction::default();
        decoder.decode_out(&mut insn);
        if insn.is_invalid() {
            break;
        }
        results.push(insn);
    }

    results
}

/// Convert the first two operands of `insn` into owned descriptors.
///
/// Only register, immediate, and memory operands are representable;
/// anything else (far branches, implicit string-op memory) is a
/// programmer-error kind surfaced as [`Error::UnsupportedOperand`].
/// Near-branch targets become immediates.
pub fn operands_of(insn: &Instruction) -> Result<Vec<Operand>> {
    let count = insn.op_count().min(2);
    let mut operands = Vec::with_capacity(count as usize);
    for i in 0..count {
        operands.push(operand_of(insn, i)?);
    }
    Ok(operands)
}

fn operand_of(insn: &Instruction, index: u32) -> Result<Operand> {
    let kind = insn.op_kind(index);
    match kind {
        OpKind::Register => Ok(Operand::Register(insn.op_register(index))),
        OpKind::Immediate8
        | OpKind::Immediate8_2nd
        | OpKind::Immediate16
        | OpKind::Immediate32
        | OpKind::Immediate64
        | OpKind::Immediate8to16
        | OpKind::Immediate8to32
        | OpKind::Immediate8to64
        | OpKind::Immediate32to64 => Ok(Operand::Immediate(insn.immediate(index))),
        OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => {
            Ok(Operand::Immediate(insn.near_branch_target()))
        }
        OpKind::Memory => Ok(Operand::Memory {
            base: insn.memory_base(),
            index: insn.memory_index(),
            scale: insn.memory_index_scale(),
            displacement: insn.memory_displacement64() as i64,
            segment: insn.segment_prefix(),
        }),
        other => Err(Error::UnsupportedOperand(other)),
    }
}

/// Render the canonical mnemonic key of an instruction:
/// `"<mnemonic> <op_str>;"`.
///
/// The operand text follows capstone conventions (lowercase, `0x` hex,
/// a space after the operand comma, explicit memory size keywords), so
/// keys line up with the familiar `"pop eax;"` shape.
pub fn render_key(insn: &Instruction) -> String {
    let mut formatter = IntelFormatter::new();
    let options = formatter.options_mut();
    options.set_space_after_operand_separator(true);
    options.set_uppercase_hex(false);
    options.set_hex_prefix("0x");
    options.set_hex_suffix("");
    options.set_memory_size_options(MemorySizeOptions::Always);

    let mut mnemonic = FormatterOutputBuffer::new();
    formatter.format_mnemonic(insn, &mut mnemonic);
    let mut op_str = FormatterOutputBuffer::new();
    formatter.format_all_operands(insn, &mut op_str);

    format!("{} {};", mnemonic.text(), op_str.text())
}

/// Internal buffer for iced-x86 formatter output.
struct FormatterOutputBuffer {
    text: String,
}

impl FormatterOutputBuffer {
    fn new() -> Self {
        Self { text: String::new() }
    }

    fn text(&self) -> &str {
        &self.text
    }
}

impl FormatterOutput for FormatterOutputBuffer {
    fn write(&mut self, text: &str, _kind: FormatterTextKind) {
        self.text.push_str(text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iced_x86::Mnemonic;

    #[test]
    fn decode_pop_ret() {
        // pop eax; ret = 58 c3
        let code = [0x58, 0xC3];
        let insns = decode(&code, VirtAddr(0x1000), 10);
        assert_eq!(insns.len(), 2);
        assert_eq!(insns[0].mnemonic(), Mnemonic::Pop);
        assert_eq!(insns[1].mnemonic(), Mnemonic::Ret);
        assert_eq!(insns[0].ip(), 0x1000);
        assert_eq!(insns[1].ip(), 0x1001);
    }

    #[test]
    fn decode_count_limit() {
        let code = [0x90; 16]; // nops
        let insns = decode(&code, VirtAddr(0), 5);
        assert_eq!(insns.len(), 5);
    }

    #[test]
    fn key_of_pop() {
        let code = [0x58]; // pop eax
        let insns = decode(&code, VirtAddr(0), 1);
        assert_eq!(render_key(&insns[0]), "pop eax;");
    }

    #[test]
    fn key_of_xor() {
        let code = [0x31, 0xC0]; // xor eax, eax
        let insns = decode(&code, VirtAddr(0), 1);
        assert_eq!(render_key(&insns[0]), "xor eax, eax;");
    }

    #[test]
    fn key_of_mov_load() {
        let code = [0x8B, 0x01]; // mov eax, dword ptr [ecx]
        let insns = decode(&code, VirtAddr(0), 1);
        assert_eq!(render_key(&insns[0]), "mov eax, dword ptr [ecx];");
    }

    #[test]
    fn register_operands() {
        let code = [0x87, 0xC1]; // xchg between eax and ecx
        let insns = decode(&code, VirtAddr(0), 1);
        let ops = operands_of(&insns[0]).unwrap();
        assert_eq!(ops.len(), 2);
        let regs: Vec<_> = ops.iter().filter_map(Operand::register).collect();
        assert!(regs.contains(&Register::EAX));
        assert!(regs.contains(&Register::ECX));
    }

    #[test]
    fn memory_operand_plain_deref() {
        let code = [0x8B, 0x01]; // mov eax, [ecx]
        let insns = decode(&code, VirtAddr(0), 1);
        let ops = operands_of(&insns[0]).unwrap();
        assert_eq!(ops[0], Operand::Register(Register::EAX));
        assert_eq!(
            ops[1],
            Operand::Memory {
                base: Register::ECX,
                index: Register::None,
                scale: 1,
                displacement: 0,
                segment: Register::None,
            }
        );
        assert!(ops[1].is_plain_deref());
        assert_eq!(ops[1].kind(), OperandKind::Memory);
    }

    #[test]
    fn memory_operand_with_displacement() {
        let code = [0x8B, 0x41, 0x04]; // mov eax, [ecx+4]
        let insns = decode(&code, VirtAddr(0), 1);
        let ops = operands_of(&insns[0]).unwrap();
        match ops[1] {
            Operand::Memory { base, displacement, .. } => {
                assert_eq!(base, Register::ECX);
                assert_eq!(displacement, 4);
            }
            ref other => panic!("expected memory operand, got {:?}", other),
        }
        assert!(!ops[1].is_plain_deref());
    }

    #[test]
    fn immediate_operand() {
        let code = [0x6A, 0x10]; // push 0x10
        let insns = decode(&code, VirtAddr(0), 1);
        let ops = operands_of(&insns[0]).unwrap();
        assert_eq!(ops[0], Operand::Immediate(0x10));
        assert_eq!(ops[0].kind(), OperandKind::Immediate);
    }

    #[test]
    fn far_branch_is_unsupported() {
        // jmp 0x08:0x00000000 (far) = ea 00 00 00 00 08 00
        let code = [0xEA, 0x00, 0x00, 0x00, 0x00, 0x08, 0x00];
        let insns = decode(&code, VirtAddr(0), 1);
        assert_eq!(insns.len(), 1);
        assert!(matches!(
            operands_of(&insns[0]),
            Err(Error::UnsupportedOperand(_))
        ));
    }

    #[test]
    fn segment_prefix_is_captured() {
        // mov eax, fs:[ecx] = 64 8b 01
        let code = [0x64, 0x8B, 0x01];
        let insns = decode(&code, VirtAddr(0), 1);
        let ops = operands_of(&insns[0]).unwrap();
        match ops[1] {
            Operand::Memory { segment, .. } => assert_eq!(segment, Register::FS),
            ref other => panic!("expected memory operand, got {:?}", other),
        }
        assert!(!ops[1].is_plain_deref());
    }
}
