//! Annotation collection (C1).
//!
//! The front-end records user annotations in a reserved appending global,
//! each entry pairing a value with a string literal. This pass resolves
//! symbol aliases to their aliasees, decodes the annotation array, and
//! forcibly excludes globals the duplicator must never touch (volatile
//! storage, metadata sections).

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::ir::instruction::{Instruction, InvokeCallee, Terminator};
use crate::ir::module::{GlobalInit, Module, GLOBAL_ANNOTATIONS, METADATA_SECTION};

/// The annotation attached to a function or global.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnotationKind {
    ToHarden,
    ToDuplicate,
    Exclude,
    RuntimeSig,
    RunAdjSig,
}

impl AnnotationKind {
    /// Annotation strings may carry trailing payload, so match by prefix.
    fn parse(text: &str) -> Option<Self> {
        if text.starts_with("to_harden") {
            Some(AnnotationKind::ToHarden)
        } else if text.starts_with("to_duplicate") {
            Some(AnnotationKind::ToDuplicate)
        } else if text.starts_with("exclude") {
            Some(AnnotationKind::Exclude)
        } else if text.starts_with("runtime_sig") {
            Some(AnnotationKind::RuntimeSig)
        } else if text.starts_with("run_adj_sig") {
            Some(AnnotationKind::RunAdjSig)
        } else {
            None
        }
    }
}

/// Collect annotations for the module, resolving aliases first.
/// At most one annotation per value is kept; extras are discarded.
pub fn collect(module: &mut Module) -> FxHashMap<String, AnnotationKind> {
    resolve_aliases(module);

    let mut annotations: FxHashMap<String, AnnotationKind> = FxHashMap::default();

    // Entries have the shape [target, annotation-string, file, line]; only
    // the first two fields matter here.
    let mut pairs: Vec<(String, String)> = Vec::new();
    if let Some(g) = module.global(GLOBAL_ANNOTATIONS) {
        if let GlobalInit::Compound(entries) = &g.init {
            for entry in entries {
                let GlobalInit::Compound(fields) = entry else { continue };
                let mut refs = fields.iter().filter_map(|f| match f {
                    GlobalInit::GlobalAddr(n) | GlobalInit::GlobalAddrOffset(n, _) => Some(n),
                    _ => None,
                });
                if let (Some(target), Some(label)) = (refs.next(), refs.next()) {
                    pairs.push((target.clone(), label.clone()));
                }
            }
        }
    }

    for (target, label) in pairs {
        let Some(text) = module.string_literal(&label) else {
            debug!(symbol = %target, label = %label, "annotation string not found");
            continue;
        };
        let Some(kind) = AnnotationKind::parse(text) else {
            debug!(symbol = %target, text = %text, "unrecognized annotation");
            continue;
        };
        if annotations.contains_key(&target) {
            debug!(symbol = %target, "multiple annotations, keeping the first");
            continue;
        }
        annotations.insert(target, kind);
    }

    // Volatile globals and metadata-section globals must never be duplicated.
    for g in &module.globals {
        let metadata = g.section.as_deref() == Some(METADATA_SECTION);
        if g.is_volatile || metadata {
            annotations.insert(g.name.clone(), AnnotationKind::Exclude);
        }
    }

    annotations
}

/// Replace every use of an alias with its aliasee and drop the alias.
fn resolve_aliases(module: &mut Module) {
    if module.aliases.is_empty() {
        return;
    }
    let map: FxHashMap<String, String> = module.aliases.drain(..).collect();
    let rewrite = |name: &mut String| {
        if let Some(aliasee) = map.get(name.as_str()) {
            debug!(alias = %name, aliasee = %aliasee, "replacing alias");
            *name = aliasee.clone();
        }
    };

    for func in &mut module.functions {
        for block in &mut func.blocks {
            for inst in &mut block.instructions {
                match inst {
                    Instruction::Call { func, .. } => rewrite(func),
                    Instruction::GlobalAddr { name, .. } => rewrite(name),
                    _ => {}
                }
            }
            if let Terminator::Invoke { callee: InvokeCallee::Direct(name), .. } =
                &mut block.terminator
            {
                rewrite(name);
            }
        }
    }
    for g in &mut module.globals {
        g.init.rewrite_refs(&mut |name| rewrite(name));
    }
}
