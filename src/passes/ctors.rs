//! Global-constructor fixup (C9).
//!
//! The reserved `llvm.global_ctors` array holds `{priority, ctor, data}`
//! entries. Each constructor with a duplicated variant is replaced by that
//! variant, so hardened initialization runs on the duplicated convention
//! from program start. The array is rebuilt entrywise; name, section,
//! constantness and appending linkage are preserved.

use tracing::{debug, warn};

use crate::ir::module::{GlobalInit, Module, GLOBAL_CTORS};

use super::duplicate::NameDups;

pub fn run(module: &mut Module, dups: &NameDups) {
    let Some(ctors) = module.global_mut(GLOBAL_CTORS) else {
        warn!("{GLOBAL_CTORS} not found in the module");
        return;
    };
    let GlobalInit::Compound(entries) = &ctors.init else {
        warn!("{GLOBAL_CTORS} has an unexpected initializer shape");
        return;
    };

    let rebuilt: Vec<GlobalInit> = entries
        .iter()
        .map(|entry| {
            let GlobalInit::Compound(fields) = entry else { return entry.clone() };
            let mut fields = fields.clone();
            if let Some(GlobalInit::GlobalAddr(ctor)) = fields.get_mut(1) {
                if let Some(dup) = dups.get(ctor) {
                    debug!(ctor = %ctor, dup = %dup, "redirecting global constructor");
                    *ctor = dup.to_string();
                }
            }
            GlobalInit::Compound(fields)
        })
        .collect();

    ctors.init = GlobalInit::Compound(rebuilt);
}
