//! ELF dissection: executable sections and dynamic symbols.
//!
//! Parses the target binary with goblin and extracts the two tables the
//! autopsy is built from: every section flagged executable, and every
//! dynamic symbol that is a global function. Symbol versions come from
//! the GNU version sections when the binary carries them; the version
//! feeds the `.symver` directive used to pin a reference to one concrete
//! symbol version at static-link time.

use goblin::elf::header::EM_386;
use goblin::elf::section_header::SHF_EXECINSTR;
use goblin::elf::sym::STB_GLOBAL;
use goblin::elf::symver::VER_NDX_GLOBAL;
use goblin::elf::Elf;

use crate::error::{Error, Result};
use crate::types::VirtAddr;

/// Symbols never used as gadget anchors.
pub const EXCLUDED_SYMBOLS: [&str; 2] = ["_init", "_fini"];

/// An entry of the dynamic symbol table, used as a base address when
/// referencing gadgets.
#[derive(Debug, Clone)]
pub struct Symbol {
    /// Symbol name.
    pub label: String,
    /// Symbol version, empty when the binary carries none. Glibc exports
    /// many same-named symbols distinguished only by version.
    pub version: String,
    /// Virtual address of the symbol.
    pub address: VirtAddr,
}

impl Symbol {
    /// The assembler directive binding an unversioned reference to this
    /// symbol's version: `.symver LABEL,LABEL@VERSION`.
    pub fn symver_directive(&self) -> String {
        format!(".symver {},{}@{}", self.label, self.label, self.version)
    }
}

/// An executable code region of the binary.
#[derive(Debug, Clone)]
pub struct Section {
    /// Section name, `"<unnamed>"` when absent.
    pub name: String,
    /// Virtual address of the section.
    pub vaddr: VirtAddr,
    /// Size of the section in bytes.
    pub size: u64,
    /// Offset of the section contents within the file image.
    pub file_offset: u64,
}

/// Parse and validate the binary: must be a 32-bit x86 ELF object.
pub fn parse(data: &[u8]) -> Result<Elf<'_>> {
    let elf = Elf::parse(data).map_err(|e| Error::InvalidBinary(e.to_string()))?;
    if elf.is_64 {
        return Err(Error::InvalidBinary("not a 32-bit object".to_string()));
    }
    if elf.header.e_machine != EM_386 {
        return Err(Error::InvalidBinary(format!(
            "unsupported machine type {:#x}",
            elf.header.e_machine
        )));
    }
    Ok(elf)
}

/// Every section flagged executable, in header order.
pub fn executable_sections(elf: &Elf) -> Vec<Section> {
    let mut sections = Vec::new();
    for sh in &elf.section_headers {
        if sh.sh_flags & u64::from(SHF_EXECINSTR) == 0 {
            continue;
        }
        let name = elf.shdr_strtab.get_at(sh.sh_name).unwrap_or("<unnamed>");
        sections.push(Section {
            name: name.to_string(),
            vaddr: VirtAddr(sh.sh_addr),
            size: sh.sh_size,
            file_offset: sh.sh_offset,
        });
    }
    log::debug!("found {} executable sections", sections.len());
    sections
}

/// Every dynamic symbol that is a global function, excluding
/// `_init`/`_fini`.
///
/// With `skip_base_versions`, symbols whose resolved version is `"Base"`
/// are dropped as well. Zero eligible symbols is fatal: every ROP chain
/// references a symbol as its base address.
pub fn dynamic_symbols(elf: &Elf, skip_base_versions: bool) -> Result<Vec<Symbol>> {
    let mut symbols = Vec::new();
    for (index, sym) in elf.dynsyms.iter().enumerate() {
        if !sym.is_function() || sym.st_bind() != STB_GLOBAL {
            continue;
        }
        let name = match elf.dynstrtab.get_at(sym.st_name) {
            Some(name) if !name.is_empty() => name,
            _ => continue,
        };
        if EXCLUDED_SYMBOLS.contains(&name) {
            continue;
        }
        let version = symbol_version(elf, index);
        if skip_base_versions && version == "Base" {
            continue;
        }
        symbols.push(Symbol {
            label: name.to_string(),
            version,
            address: VirtAddr(sym.st_value),
        });
    }

    log::debug!("found {} eligible dynamic symbols", symbols.len());
    if symbols.is_empty() {
        return Err(Error::NoSymbols);
    }
    Ok(symbols)
}

/// Resolve the version string of the dynamic symbol at `index`.
///
/// Unversioned, local, and global-unversioned symbols yield the empty
/// string. Versioned indices are resolved through the verneed section
/// first (imported versions), then verdef (versions this object defines).
fn symbol_version(elf: &Elf, index: usize) -> String {
    let versym = match &elf.versym {
        Some(versym) => versym,
        None => return String::new(),
    };
    let ndx = match versym.get_at(index) {
        Some(v) => v.version(),
        None => return String::new(),
    };
    if ndx <= VER_NDX_GLOBAL {
        return String::new();
    }

    if let Some(verneed) = &elf.verneed {
        for need in verneed.iter() {
            for aux in need.iter() {
                if aux.vna_other as usize == ndx as usize {
                    return elf
                        .dynstrtab
                        .get_at(aux.vna_name as usize)
                        .unwrap_or("")
                        .to_string();
                }
            }
        }
    }
    if let Some(verdef) = &elf.verdef {
        for def in verdef.iter() {
            if def.vd_ndx as usize == ndx as usize {
                if let Some(aux) = def.iter().next() {
                    return elf
                        .dynstrtab
                        .get_at(aux.vda_name as usize)
                        .unwrap_or("")
                        .to_string();
                }
            }
        }
    }
    String::new()
}
