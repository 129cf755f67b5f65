//! x86-32 register universe.
//!
//! Uses a table-driven design: one row per general-purpose register with
//! its textual name and DWARF number per the System V i386 ABI. The table
//! backs the ABI-to-architectural translation used when a consumer names
//! registers by number or by string, and [`GP32`] fixes the vertex set of
//! the exchange graph.

use iced_x86::Register;

use crate::error::{Error, Result};

/// General-purpose 32-bit registers admitted as exchange-graph vertices.
///
/// ESP is deliberately absent: gadgets touching the stack pointer are
/// filtered out before the graph is built.
pub const GP32: [Register; 7] = [
    Register::EAX,
    Register::ECX,
    Register::EDX,
    Register::EBX,
    Register::ESI,
    Register::EDI,
    Register::EBP,
];

/// Returns true iff `reg` is one of the [`GP32`] vertex registers.
pub fn is_gp32(reg: Register) -> bool {
    GP32.contains(&reg)
}

/// Metadata for a single register.
#[derive(Debug, Clone, Copy)]
pub struct RegisterInfo {
    pub name: &'static str,
    pub dwarf_id: u16,
    pub reg: Register,
}

/// x86-32 register table.
///
/// DWARF register numbers follow the System V i386 ABI.
pub const REGISTERS: &[RegisterInfo] = &[
    RegisterInfo { name: "eax", dwarf_id: 0, reg: Register::EAX },
    RegisterInfo { name: "ecx", dwarf_id: 1, reg: Register::ECX },
    RegisterInfo { name: "edx", dwarf_id: 2, reg: Register::EDX },
    RegisterInfo { name: "ebx", dwarf_id: 3, reg: Register::EBX },
    RegisterInfo { name: "esp", dwarf_id: 4, reg: Register::ESP },
    RegisterInfo { name: "ebp", dwarf_id: 5, reg: Register::EBP },
    RegisterInfo { name: "esi", dwarf_id: 6, reg: Register::ESI },
    RegisterInfo { name: "edi", dwarf_id: 7, reg: Register::EDI },
];

/// Translate a register name to its architectural register.
pub fn register_by_name(name: &str) -> Result<Register> {
    REGISTERS
        .iter()
        .find(|info| info.name == name)
        .map(|info| info.reg)
        .ok_or_else(|| Error::UnknownRegister(name.to_string()))
}

/// Translate a DWARF register number to its architectural register.
pub fn register_by_dwarf(dwarf_id: u16) -> Result<Register> {
    REGISTERS
        .iter()
        .find(|info| info.dwarf_id == dwarf_id)
        .map(|info| info.reg)
        .ok_or_else(|| Error::UnknownRegister(format!("dwarf:{}", dwarf_id)))
}
