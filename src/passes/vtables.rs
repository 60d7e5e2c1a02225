//! Vtable duplication (C8).
//!
//! A hardened constructor stores its class vtable into the object under
//! construction. The duplicated constructor must install a duplicated
//! vtable instead, one whose slots dispatch to the `_dup` variants of the
//! virtual methods, so that virtual calls made from hardened code stay on
//! the duplicated calling convention.
//!
//! The rewrite is a pure data transform over the vtable initializer: the
//! expected shape is a singleton struct wrapping one constant array of
//! function pointers. Anything else is skipped with a warning and the
//! constructor keeps the original table.

use tracing::{debug, warn};

use rustc_hash::FxHashMap;

use crate::common::demangle;
use crate::ir::instruction::{Instruction, Operand, Value};
use crate::ir::module::{Function, GlobalInit, Module};

use super::closure::CtorRecord;
use super::duplicate::NameDups;

/// Locate the store that installs a vtable in `func`, following the value
/// chain from the stored operand back to the address of a vtable global.
/// Returns (block index, instruction index, vtable global name).
pub(crate) fn find_vtable_store(func: &Function) -> Option<(usize, usize, String)> {
    let defs = def_map(func);
    for (bi, block) in func.blocks.iter().enumerate() {
        for (ii, inst) in block.instructions.iter().enumerate() {
            if let Instruction::Store { val: Operand::Value(v), .. } = inst {
                if let Some(name) = trace_vtable_base(&defs, *v) {
                    return Some((bi, ii, name));
                }
            }
        }
    }
    None
}

/// The functions referenced by the slots of a vtable global's initializer.
pub(crate) fn vtable_slot_functions(module: &Module, vtable: &str) -> Vec<String> {
    let Some(global) = module.global(vtable) else { return Vec::new() };
    let Some(slots) = vtable_slots(&global.init) else { return Vec::new() };
    slots
        .iter()
        .filter_map(|slot| match slot {
            GlobalInit::GlobalAddr(name) if module.function(name).is_some() => {
                Some(name.clone())
            }
            _ => None,
        })
        .collect()
}

/// The slot array of a well-formed vtable initializer: a singleton struct
/// wrapping one constant array.
fn vtable_slots(init: &GlobalInit) -> Option<&Vec<GlobalInit>> {
    let GlobalInit::Compound(outer) = init else { return None };
    if outer.len() != 1 {
        return None;
    }
    let GlobalInit::Compound(slots) = &outer[0] else { return None };
    Some(slots)
}

fn def_map(func: &Function) -> FxHashMap<Value, Instruction> {
    let mut defs = FxHashMap::default();
    for block in &func.blocks {
        for inst in &block.instructions {
            if let Some(dest) = inst.dest() {
                defs.insert(dest, inst.clone());
            }
        }
    }
    defs
}

fn trace_vtable_base(defs: &FxHashMap<Value, Instruction>, v: Value) -> Option<String> {
    let mut cur = v;
    for _ in 0..16 {
        match defs.get(&cur) {
            Some(Instruction::GlobalAddr { name, .. }) => {
                return demangle::is_vtable_symbol(name).then(|| name.clone());
            }
            Some(Instruction::GetElementPtr { base, .. }) => cur = *base,
            Some(Instruction::Cast { src: Operand::Value(s), .. }) => cur = *s,
            Some(Instruction::Copy { src: Operand::Value(s), .. }) => cur = *s,
            _ => return None,
        }
    }
    None
}

/// Duplicate the vtable of every registered constructor and retarget the
/// vtable store inside the duplicated constructor body.
pub fn run(module: &mut Module, ctors: &[CtorRecord], dups: &mut NameDups) {
    for ctor in ctors {
        let Some(dup_fn_name) = dups.get(&ctor.function).map(str::to_string) else {
            warn!(constructor = %ctor.function, "no duplicated constructor variant");
            continue;
        };
        let Some(vtable_name) = ctor.vtable.clone() else { continue };
        let dup_vtable_name = format!("{vtable_name}_dup");

        if module.global(&dup_vtable_name).is_none() {
            let Some(vtable) = module.global(&vtable_name) else {
                warn!(vtable = %vtable_name, "vtable global not found");
                continue;
            };
            let Some(slots) = vtable_slots(&vtable.init) else {
                warn!(vtable = %vtable_name, "unexpected vtable initializer shape");
                continue;
            };

            let new_slots: Vec<GlobalInit> = slots
                .iter()
                .map(|slot| match slot {
                    GlobalInit::GlobalAddr(name) if module.function(name).is_some() => {
                        match dups.get(name) {
                            Some(dup) => GlobalInit::GlobalAddr(dup.to_string()),
                            None => {
                                warn!(function = %name, "missing duplicated virtual method, keeping original slot");
                                slot.clone()
                            }
                        }
                    }
                    other => other.clone(),
                })
                .collect();

            let mut dup_vtable = vtable.clone();
            dup_vtable.name = dup_vtable_name.clone();
            dup_vtable.init = GlobalInit::Compound(vec![GlobalInit::Compound(new_slots)]);
            debug!(vtable = %vtable_name, dup = %dup_vtable_name, "duplicated vtable");
            module.globals.push(dup_vtable);
            dups.insert_pair(&vtable_name, &dup_vtable_name);
        }

        // In the duplicated constructor, the stored value chain must point
        // into the duplicated table at the same indices: only the base
        // global-address changes.
        let Some(dup_fn) = module.function_mut(&dup_fn_name) else { continue };
        retarget_vtable_stores(dup_fn, &vtable_name, &dup_vtable_name);
    }
}

fn retarget_vtable_stores(func: &mut Function, vtable: &str, dup_vtable: &str) {
    let defs = def_map(func);
    let mut bases: Vec<Value> = Vec::new();
    for block in &func.blocks {
        for inst in &block.instructions {
            if let Instruction::Store { val: Operand::Value(v), .. } = inst {
                if trace_vtable_base(&defs, *v).as_deref() == Some(vtable) {
                    bases.push(base_of(&defs, *v));
                }
            }
        }
    }
    if bases.is_empty() {
        warn!(function = %func.name, vtable = %vtable, "no vtable store to retarget");
        return;
    }
    for block in &mut func.blocks {
        for inst in &mut block.instructions {
            if let Instruction::GlobalAddr { dest, name } = inst {
                if bases.contains(dest) && name == vtable {
                    *name = dup_vtable.to_string();
                }
            }
        }
    }
}

/// The GlobalAddr value at the bottom of a GEP/cast chain.
fn base_of(defs: &FxHashMap<Value, Instruction>, v: Value) -> Value {
    let mut cur = v;
    for _ in 0..16 {
        match defs.get(&cur) {
            Some(Instruction::GlobalAddr { dest, .. }) => return *dest,
            Some(Instruction::GetElementPtr { base, .. }) => cur = *base,
            Some(Instruction::Cast { src: Operand::Value(s), .. }) => cur = *s,
            Some(Instruction::Copy { src: Operand::Value(s), .. }) => cur = *s,
            _ => break,
        }
    }
    cur
}
