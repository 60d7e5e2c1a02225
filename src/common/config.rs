//! Configuration for the hardening pipeline.
//!
//! The pipeline is configured as plain data: the host embedding these passes
//! decides where the values come from (flags, environment, build scripts).

/// Where consistency checks are placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicationMode {
    /// Check at every store and at every branch point.
    Eddi,
    /// Selective: check only at branches and calls.
    Seddi,
    /// Full duplication with selective checking: store/branch checks, but
    /// only in blocks with more than one predecessor.
    Fdsc,
}

impl DuplicationMode {
    pub fn check_at_stores(self) -> bool {
        matches!(self, DuplicationMode::Eddi | DuplicationMode::Fdsc)
    }

    pub fn check_at_calls(self) -> bool {
        matches!(self, DuplicationMode::Seddi)
    }

    pub fn check_at_branches(self) -> bool {
        true
    }

    /// FDSC restricts check insertion to join blocks.
    pub fn multi_predecessor_only(self) -> bool {
        matches!(self, DuplicationMode::Fdsc)
    }
}

/// Which control-flow-checking pass runs downstream of data duplication.
/// The signature pass itself lives outside this crate; the variant is carried
/// here so one configuration object describes the whole hardening pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CfcMode {
    None,
    Cfcss,
    Rasm,
    InterRasm,
}

/// Initial block signature used by the inter-procedural RASM variant.
pub const INTER_RASM_DEFAULT_SIG: i32 = -0xDEAD;

/// Runtime handler invoked when a data consistency check fails. Supplied by
/// the runtime, never defined here; the passes only declare and call it.
pub const DATA_CORRUPTION_HANDLER: &str = "DataCorruption_Handler";

/// Runtime handler invoked by the (external) control-flow-checking pass when
/// a block signature mismatches.
pub const SIGNATURE_MISMATCH_HANDLER: &str = "SignatureMismatch_Handler";

#[derive(Debug, Clone)]
pub struct HardeningConfig {
    pub mode: DuplicationMode,
    /// Interleaved placement of originals and duplicates (argument lists,
    /// global layout, alloca placement). Off means segregated placement.
    pub alternate_memmap: bool,
    /// Section for duplicated globals that have neither a section of their
    /// own nor an initializer, so linkers can co-locate or separate copies.
    pub duplicate_section: String,
    /// Whether duplicates inherit the source locations of their originals.
    pub debug_info: bool,
    pub cfc: CfcMode,
}

impl Default for HardeningConfig {
    fn default() -> Self {
        Self {
            mode: DuplicationMode::Eddi,
            alternate_memmap: false,
            duplicate_section: ".dup".to_string(),
            debug_info: true,
            cfc: CfcMode::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_placement() {
        assert!(DuplicationMode::Eddi.check_at_stores());
        assert!(!DuplicationMode::Eddi.check_at_calls());
        assert!(DuplicationMode::Seddi.check_at_calls());
        assert!(!DuplicationMode::Seddi.check_at_stores());
        assert!(DuplicationMode::Fdsc.multi_predecessor_only());
    }
}
