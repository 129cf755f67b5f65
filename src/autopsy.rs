//! The binary autopsy: analysis pipeline and query surface.
//!
//! [`BinaryAutopsy::analyze`] dissects a 32-bit x86 ELF binary once,
//! eagerly: executable sections and dynamic symbols are extracted,
//! microgadgets are mined, classified, and filtered, and the register
//! exchange graph is built. The file mapping and decoder live only for
//! the duration of the pipeline; the resulting value owns plain data
//! and answers all queries read-only.

use std::cell::Cell;
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use iced_x86::{Mnemonic, Register};
use memmap2::Mmap;

use crate::disasm::OperandKind;
use crate::elf::{self, Section, Symbol};
use crate::error::Result;
use crate::gadget::{self, GadgetClass, Microgadget};
use crate::xchg_graph::XchgGraph;

/// Analysis options.
#[derive(Debug, Clone, Default)]
pub struct AutopsyOptions {
    /// Drop symbols whose version resolves to `"Base"`. Off by default:
    /// such symbols are perfectly usable as gadget anchors.
    pub skip_base_versions: bool,
    /// Fixed seed for [`BinaryAutopsy::random_symbol`]. When unset the
    /// generator is seeded from the wall clock.
    pub seed: Option<u64>,
}

/// The dissected binary: symbol, section, and microgadget tables plus
/// the register exchange graph.
///
/// Immutable after construction. The only interior state is the PRNG
/// behind [`random_symbol`](Self::random_symbol), held in a [`Cell`] —
/// which makes the value `!Sync`, so concurrent readers must either
/// clone per thread or serialise access externally.
pub struct BinaryAutopsy {
    binary_path: PathBuf,
    symbols: Vec<Symbol>,
    sections: Vec<Section>,
    gadgets: Vec<Microgadget>,
    xchg_graph: XchgGraph,
    rng: Cell<u64>,
}

impl BinaryAutopsy {
    /// Analyze the binary at `path` with default options.
    pub fn analyze(path: &Path) -> Result<Self> {
        Self::analyze_with(path, AutopsyOptions::default())
    }

    /// Analyze the binary at `path`.
    ///
    /// Runs the full pipeline to completion; fails with
    /// [`InvalidBinary`](crate::Error::InvalidBinary) when the file is
    /// not a 32-bit x86 ELF object and with
    /// [`NoSymbols`](crate::Error::NoSymbols) when no eligible dynamic
    /// symbol exists. An empty gadget table is not an error.
    pub fn analyze_with(path: &Path, options: AutopsyOptions) -> Result<Self> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file) }?;
        log::debug!("dissecting {} ({} bytes)", path.display(), mmap.len());

        let elf = elf::parse(&mmap)?;
        let sections = elf::executable_sections(&elf);
        let symbols = elf::dynamic_symbols(&elf, options.skip_base_versions)?;

        let mut gadgets = gadget::mine(&mmap, &sections);
        gadget::classify(&mut gadgets);
        gadget::apply_filters(&mut gadgets);
        let xchg_graph = build_xchg_graph(&gadgets);

        let seed = options.seed.unwrap_or_else(wall_clock_seed);
        Ok(Self {
            binary_path: path.to_path_buf(),
            symbols,
            sections,
            gadgets,
            xchg_graph,
            // xorshift state must be nonzero
            rng: Cell::new(if seed == 0 { 0x9E3779B97F4A7C15 } else { seed }),
        })
    }

    /// Path of the analysed binary.
    pub fn binary_path(&self) -> &Path {
        &self.binary_path
    }

    /// The eligible dynamic symbols. Never empty.
    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    /// The executable sections.
    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    /// The surviving microgadgets.
    pub fn gadgets(&self) -> &[Microgadget] {
        &self.gadgets
    }

    /// The register exchange graph.
    pub fn xchg_graph(&self) -> &XchgGraph {
        &self.xchg_graph
    }

    /// A symbol chosen uniformly from the symbol table.
    ///
    /// Chains reference each gadget as a random symbol address plus the
    /// gadget's offset from it, so consecutive calls spread references
    /// across the table. Construction guarantees the table is nonempty.
    pub fn random_symbol(&self) -> &Symbol {
        let index = (self.next_rand() % self.symbols.len() as u64) as usize;
        &self.symbols[index]
    }

    /// Look a gadget up by its canonical key, e.g. `"pop eax;"`.
    pub fn gadget_by_key(&self, key: &str) -> Option<&Microgadget> {
        self.gadgets.iter().find(|g| g.key == key)
    }

    /// All gadgets with the given opcode and first-operand kind.
    ///
    /// `op1` of `None` leaves the second operand unconstrained, which
    /// admits single-operand forms.
    pub fn gadgets_by_shape(
        &self,
        mnemonic: Mnemonic,
        op0: OperandKind,
        op1: Option<OperandKind>,
    ) -> Vec<&Microgadget> {
        self.gadgets
            .iter()
            .filter(|g| {
                g.mnemonic == mnemonic
                    && g.op(0).map(|op| op.kind()) == Some(op0)
                    && op1.map_or(true, |kind| g.op(1).map(|op| op.kind()) == Some(kind))
            })
            .collect()
    }

    /// All gadgets with the given opcode whose first operand is the
    /// register `reg0` (and whose second is `reg1`, when constrained).
    pub fn gadgets_by_regs(
        &self,
        mnemonic: Mnemonic,
        reg0: Register,
        reg1: Option<Register>,
    ) -> Vec<&Microgadget> {
        self.gadgets
            .iter()
            .filter(|g| {
                g.mnemonic == mnemonic
                    && g.op(0).and_then(|op| op.register()) == Some(reg0)
                    && reg1.map_or(true, |r| g.op(1).and_then(|op| op.register()) == Some(r))
            })
            .collect()
    }

    /// All gadgets tagged with the given semantic class.
    pub fn gadgets_by_class(&self, class: GadgetClass) -> Vec<&Microgadget> {
        self.gadgets.iter().filter(|g| g.class == class).collect()
    }

    /// True iff some `pop` gadget initialises `reg` from the stack.
    pub fn can_init_reg(&self, reg: Register) -> bool {
        self.gadgets.iter().any(|g| {
            g.class == GadgetClass::RegInit && g.op(0).and_then(|op| op.register()) == Some(reg)
        })
    }

    /// The registers for which [`can_init_reg`](Self::can_init_reg)
    /// holds.
    pub fn initialisable_regs(&self) -> HashSet<Register> {
        self.gadgets_by_class(GadgetClass::RegInit)
            .iter()
            .filter_map(|g| g.op(0).and_then(|op| op.register()))
            .collect()
    }

    /// Exchange-graph connectivity between `a` and `b`; with `via`,
    /// both `(a, via)` and `(via, b)` must be connected.
    pub fn check_xchg_path(&self, a: Register, b: Register, via: Option<Register>) -> bool {
        match via {
            None => self.xchg_graph.check_path(a, b),
            Some(via) => self.xchg_graph.check_path(a, via) && self.xchg_graph.check_path(via, b),
        }
    }

    /// The XCHG gadgets realising a shortest exchange path from `a` to
    /// `b`, in application order.
    ///
    /// XCHG commutes, but the decoder fixes one canonical operand order
    /// per instance, so each edge is looked up in both orders.
    pub fn xchg_path(&self, a: Register, b: Register) -> Vec<&Microgadget> {
        let mut gadgets = Vec::new();
        for (u, v) in self.xchg_graph.path(a, b) {
            let found = self
                .gadgets_by_regs(Mnemonic::Xchg, u, Some(v))
                .into_iter()
                .next()
                .or_else(|| {
                    self.gadgets_by_regs(Mnemonic::Xchg, v, Some(u))
                        .into_iter()
                        .next()
                });
            match found {
                Some(gadget) => gadgets.push(gadget),
                None => {
                    // Edges only exist for surviving XCHG gadgets.
                    log::warn!("no xchg gadget backs edge {:?} <-> {:?}", u, v);
                    return Vec::new();
                }
            }
        }
        gadgets
    }

    /// xorshift64* step.
    fn next_rand(&self) -> u64 {
        let mut x = self.rng.get();
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.rng.set(x);
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }
}

/// Add an edge for every surviving register-exchange gadget.
fn build_xchg_graph(gadgets: &[Microgadget]) -> XchgGraph {
    let mut graph = XchgGraph::new();
    for gadget in gadgets.iter().filter(|g| g.class == GadgetClass::RegXchg) {
        if let (Some(a), Some(b)) = (
            gadget.op(0).and_then(|op| op.register()),
            gadget.op(1).and_then(|op| op.register()),
        ) {
            graph.add_edge(a, b);
        }
    }
    log::debug!("xchg graph built with {} edges", graph.edge_count());
    graph
}

fn wall_clock_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0x9E37_79B9_7F4A_7C15)
}

/// Lazily-populated analysis table keyed by binary path.
///
/// Replaces a process-global accessor: callers that analyse several
/// binaries in one run hold one cache and get each path dissected
/// exactly once.
#[derive(Default)]
pub struct AutopsyCache {
    entries: HashMap<PathBuf, BinaryAutopsy>,
}

impl AutopsyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The autopsy for `path`, analysing it on first request.
    pub fn get_or_analyze(&mut self, path: &Path) -> Result<&BinaryAutopsy> {
        if !self.entries.contains_key(path) {
            let autopsy = BinaryAutopsy::analyze(path)?;
            self.entries.insert(path.to_path_buf(), autopsy);
        }
        Ok(&self.entries[path])
    }

    /// The already-analysed autopsy for `path`, if any.
    pub fn get(&self, path: &Path) -> Option<&BinaryAutopsy> {
        self.entries.get(path)
    }
}
