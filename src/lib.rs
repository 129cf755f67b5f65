//! binautopsy — dissects a 32-bit x86 ELF binary into the raw materials
//! for ROP-chain construction.
//!
//! The analysis runs once per binary and produces three immutable
//! tables plus one queryable graph: the eligible dynamic symbols (base
//! addresses for gadget references), the microgadgets (single
//! instructions immediately preceding a RET, classified by semantic
//! effect), and the register exchange graph (which register pairs an
//! `xchg` gadget can swap, with shortest-path queries used to rename
//! registers during chain synthesis).
//!
//! # Module overview
//!
//! - [`error`] — Error types used throughout the crate.
//! - [`types`] — Core types: `VirtAddr`.
//! - [`reg`] — The x86-32 register universe and ABI translation table.
//! - [`elf`] — Executable sections and dynamic symbols, via goblin.
//! - [`disasm`] — Decoder adapter: owned operands, mnemonic keys.
//! - [`gadget`] — Microgadget mining, classification, and filtering.
//! - [`xchg_graph`] — Register exchange graph with BFS path queries.
//! - [`autopsy`] — The `BinaryAutopsy` facade tying it all together.
//!
//! # Example
//!
//! ```no_run
//! use binautopsy::BinaryAutopsy;
//! use std::path::Path;
//!
//! let autopsy = BinaryAutopsy::analyze(Path::new("/lib/libc.so.6"))?;
//! if let Some(gadget) = autopsy.gadget_by_key("pop eax;") {
//!     let base = autopsy.random_symbol();
//!     println!("{} + {}", base.symver_directive(), gadget.addr);
//! }
//! # Ok::<(), binautopsy::Error>(())
//! ```

pub mod autopsy;
pub mod disasm;
pub mod elf;
pub mod error;
pub mod gadget;
pub mod reg;
pub mod types;
pub mod xchg_graph;

pub use autopsy::{AutopsyCache, AutopsyOptions, BinaryAutopsy};
pub use disasm::{Operand, OperandKind};
pub use elf::{Section, Symbol};
pub use error::{Error, Result};
pub use gadget::{GadgetClass, Microgadget};
pub use types::VirtAddr;
pub use xchg_graph::XchgGraph;
