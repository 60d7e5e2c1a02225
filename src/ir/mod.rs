//! The procedural IR the hardening passes transform.

pub mod analysis;
pub mod constants;
pub mod instruction;
pub mod module;
pub mod ops;
