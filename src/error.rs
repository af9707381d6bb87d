//! The error type shared by every arena variant.
use thiserror::Error as ThisError;

/// Everything that can go wrong when driving an arena.
///
/// `OsMemory` wraps a failed `reserve`/`commit`/`decommit`/`release`/`protect`
/// call; `InvalidParams` is a precondition violation caught before any
/// syscall was attempted.
#[derive(Debug, ThisError)]
pub enum Error {
    #[error("virtual memory operation failed: {0}")]
    OsMemory(#[from] std::io::Error),
    #[error("invalid parameters: {0}")]
    InvalidParams(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
