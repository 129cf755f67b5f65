//! Error types used throughout the crate.
//!
//! Provides a unified [`Error`] enum covering binary validation, symbol
//! extraction, operand handling, register translation, and I/O. All
//! fallible functions return [`Result<T>`].

use thiserror::Error;

/// Unified error type for all binautopsy operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The input file is not a 32-bit x86 ELF object.
    #[error("invalid binary: {0}")]
    InvalidBinary(String),

    /// The dynamic symbol table yielded no eligible symbols. Fatal:
    /// every ROP chain references a symbol as its base address.
    #[error("no eligible dynamic symbols in the target binary")]
    NoSymbols,

    /// The decoder produced an operand kind the analysis cannot
    /// represent (far branches, implicit string-op memory, ...).
    #[error("unsupported operand kind: {0:?}")]
    UnsupportedOperand(iced_x86::OpKind),

    /// The ABI-register translation was asked about an unmapped register.
    #[error("unknown register mapping: {0}")]
    UnknownRegister(String),

    /// Standard I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias for `std::result::Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;
