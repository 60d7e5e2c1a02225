//! Global duplication (C4).
//!
//! Every qualifying global `g` gets a sibling `g_dup` with identical type,
//! linkage, initializer, alignment, locality, thread-local mode and address
//! space. The pairing enters the duplicate map so operand rewriting inside
//! hardened bodies can resolve the second stream's storage.
//!
//! Excluded: constants, reserved `llvm.` names, annotated `exclude`
//! globals, the CFC signature globals (`runtime_sig`/`run_adj_sig`), and
//! names already ending in `_dup`.

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::common::config::HardeningConfig;
use crate::ir::module::{Global, GlobalInit, Module};

use super::annotations::AnnotationKind;
use super::duplicate::NameDups;

pub fn run(
    module: &mut Module,
    annotations: &FxHashMap<String, AnnotationKind>,
    config: &HardeningConfig,
    dups: &mut NameDups,
) {
    let qualifies = |g: &Global| {
        if g.is_constant || g.has_reserved_name() || g.name.ends_with("_dup") {
            return false;
        }
        !matches!(
            annotations.get(&g.name),
            Some(AnnotationKind::Exclude)
                | Some(AnnotationKind::RuntimeSig)
                | Some(AnnotationKind::RunAdjSig)
        )
    };

    let make_dup = |g: &Global| {
        let mut dup = g.clone();
        dup.name = format!("{}_dup", g.name);
        // Sectionless, zero-initialized duplicates get their own section so
        // the linker can co-locate or separate the two copies.
        if g.section.is_none() && g.init == GlobalInit::Zero {
            dup.section = Some(config.duplicate_section.clone());
        }
        dup
    };

    if config.alternate_memmap {
        // Interleaved placement: g, g_dup, g, g_dup, ...
        let mut placed = Vec::with_capacity(module.globals.len() * 2);
        for g in module.globals.drain(..) {
            let dup = qualifies(&g).then(|| make_dup(&g));
            if let Some(dup) = &dup {
                debug!(global = %g.name, dup = %dup.name, "duplicated global");
                dups.insert_pair(&g.name, &dup.name);
            }
            placed.push(g);
            placed.extend(dup);
        }
        module.globals = placed;
    } else {
        // Segregated placement: all originals, then all duplicates.
        let mut dup_tail = Vec::new();
        for g in &module.globals {
            if qualifies(g) {
                let dup = make_dup(g);
                debug!(global = %g.name, dup = %dup.name, "duplicated global");
                dups.insert_pair(&g.name, &dup.name);
                dup_tail.push(dup);
            }
        }
        module.globals.extend(dup_tail);
    }
}
