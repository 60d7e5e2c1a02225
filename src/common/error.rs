//! Fatal error taxonomy for the hardening passes.
//!
//! Only conditions that leave the module unusable are errors; recoverable
//! structural mismatches (unexpected vtable shape, missing duplicate) are
//! logged and the affected entity is skipped, so the pass hardens as much of
//! the module as it can.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum HardeningError {
    #[error("malformed IR in function {function}: {reason}")]
    MalformedIr { function: String, reason: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, HardeningError>;
