//! Compiler hardening against transient bit flips (single-event upsets).
//!
//! The crate transforms a whole-program procedural IR so the compiled
//! program detects data corruption at runtime: selected computations and
//! data are duplicated into a second stream, and consistency checks at
//! synchronization points (stores, branches, calls) divert execution to a
//! runtime fault handler when the streams disagree.
//!
//! The entry point is [`passes::run`], driven by a [`HardeningConfig`]:
//!
//! ```no_run
//! use flipshield::{passes, HardeningConfig};
//! # let mut module = flipshield::ir::module::Module::new();
//! let report = passes::run(&mut module, &HardeningConfig::default())?;
//! report.write_csv(std::path::Path::new("duplicated_functions.csv"))?;
//! # Ok::<(), flipshield::HardeningError>(())
//! ```
//!
//! Control-flow checking by block signatures (CFCSS / RASM) is a separate
//! downstream pass; this crate carries its configuration and the CSV
//! hand-off listing the functions it must skip.

pub mod common;
pub mod ir;
pub mod passes;

pub use common::config::{CfcMode, DuplicationMode, HardeningConfig};
pub use common::error::{HardeningError, Result};
pub use passes::{run, HardeningReport};
