//! Protection closure (C2).
//!
//! Starting from the annotated seeds, computes the transitive set of
//! functions whose bodies must be duplicated and of values whose uses must
//! be tracked in duplicate. Two explicit worklists drive the fixed point
//! (the call graph may be cyclic, so nothing here recurses):
//!
//! 1. value propagation: a store into protected memory protects the stored
//!    value, a load from it protects the loaded result, passing it to a call
//!    protects the callee;
//! 2. call-graph propagation: every direct callee of a protected function is
//!    protected unless annotated `exclude` or `to_duplicate`; constructors
//!    additionally pull in every function referenced by their vtable.

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, trace};

use crate::common::demangle;
use crate::ir::instruction::{Instruction, InvokeCallee, Terminator, Value};
use crate::ir::module::{Function, Module};

use super::annotations::AnnotationKind;
use super::vtables;

/// A function recognized as a C++ constructor, with the vtable it stores.
#[derive(Debug, Clone)]
pub struct CtorRecord {
    pub function: String,
    pub vtable: Option<String>,
}

/// The protection sets the later passes consume.
#[derive(Debug, Default)]
pub struct ProtectionSets {
    /// Functions whose bodies are duplicated and whose signatures acquire
    /// duplicated parameters.
    pub harden_fns: FxHashSet<String>,
    /// Globals explicitly pulled into the sphere of replication.
    pub harden_globals: FxHashSet<String>,
    /// Registered constructors among the hardened functions.
    pub ctors: Vec<CtorRecord>,
}

pub fn compute(
    module: &Module,
    annotations: &FxHashMap<String, AnnotationKind>,
) -> ProtectionSets {
    let mut sets = ProtectionSets::default();

    // Seeds.
    for func in &module.functions {
        if annotations.get(&func.name) == Some(&AnnotationKind::ToHarden) {
            debug!(function = %func.name, "hardening seed");
            sets.harden_fns.insert(func.name.clone());
        }
    }
    for global in &module.globals {
        if annotations.get(&global.name) == Some(&AnnotationKind::ToHarden) {
            debug!(global = %global.name, "hardening seed");
            sets.harden_globals.insert(global.name.clone());
        }
    }

    propagate_values(module, &mut sets);
    propagate_calls(module, annotations, &mut sets);

    sets
}

/// Positions of every use of every value inside one function.
fn value_users(func: &Function) -> FxHashMap<Value, Vec<(usize, usize)>> {
    let mut users: FxHashMap<Value, Vec<(usize, usize)>> = FxHashMap::default();
    for (bi, block) in func.blocks.iter().enumerate() {
        for (ii, inst) in block.instructions.iter().enumerate() {
            inst.for_each_used_value(|v| users.entry(v).or_default().push((bi, ii)));
        }
        block
            .terminator
            .for_each_used_value(|v| users.entry(v).or_default().push((bi, usize::MAX)));
    }
    users
}

/// Fixed point over value uses, seeded by the address of each protected
/// global wherever it is materialized.
fn propagate_values(module: &Module, sets: &mut ProtectionSets) {
    for func in &module.functions {
        if func.is_declaration {
            continue;
        }
        let users = value_users(func);
        let mut protected: FxHashSet<Value> = FxHashSet::default();
        let mut worklist: Vec<Value> = Vec::new();

        for block in &func.blocks {
            for inst in &block.instructions {
                if let Instruction::GlobalAddr { dest, name } = inst {
                    if sets.harden_globals.contains(name) {
                        worklist.push(*dest);
                    }
                }
            }
        }

        while let Some(v) = worklist.pop() {
            if !protected.insert(v) {
                continue;
            }
            let Some(positions) = users.get(&v) else { continue };
            for &(bi, ii) in positions {
                if ii == usize::MAX {
                    if let Terminator::Invoke {
                        callee: InvokeCallee::Direct(callee), ..
                    } = &func.blocks[bi].terminator
                    {
                        trace!(function = %func.name, callee = %callee, "protected value reaches invoke");
                        sets.harden_fns.insert(callee.clone());
                    }
                    continue;
                }
                match &func.blocks[bi].instructions[ii] {
                    // Whatever flows into protected memory is itself tracked.
                    Instruction::Store { val, .. } => {
                        if let Some(x) = val.value() {
                            if x != v {
                                worklist.push(x);
                            }
                        }
                    }
                    Instruction::Load { dest, .. } => worklist.push(*dest),
                    Instruction::Call { func: callee, .. } => {
                        trace!(function = %func.name, callee = %callee, "protected value reaches call");
                        sets.harden_fns.insert(callee.clone());
                    }
                    Instruction::CallIndirect { .. } => {
                        debug!(function = %func.name, "protected value reaches indirect call");
                    }
                    _ => {}
                }
            }
        }
    }
}

/// Fixed point over the call graph, registering constructors on the way.
fn propagate_calls(
    module: &Module,
    annotations: &FxHashMap<String, AnnotationKind>,
    sets: &mut ProtectionSets,
) {
    // Deterministic order: seed the worklist in module order.
    let mut worklist: Vec<String> = module
        .functions
        .iter()
        .filter(|f| sets.harden_fns.contains(&f.name))
        .map(|f| f.name.clone())
        .collect();
    let mut visited: FxHashSet<String> = worklist.iter().cloned().collect();

    while let Some(name) = worklist.pop() {
        let Some(func) = module.function(&name) else { continue };
        if func.is_declaration {
            continue;
        }

        if demangle::is_constructor(&name) {
            let vtable = vtables::find_vtable_store(func).map(|(_, _, g)| g);
            debug!(function = %name, vtable = ?vtable, "registered constructor");
            for virtual_fn in vtable
                .as_deref()
                .map(|vt| vtables::vtable_slot_functions(module, vt))
                .unwrap_or_default()
            {
                if visited.insert(virtual_fn.clone()) {
                    debug!(function = %virtual_fn, "hardening virtual method");
                    sets.harden_fns.insert(virtual_fn.clone());
                    worklist.push(virtual_fn);
                }
            }
            sets.ctors.push(CtorRecord { function: name.clone(), vtable });
        }

        let mut visit_callee = |callee: &str| {
            match annotations.get(callee) {
                Some(AnnotationKind::Exclude) | Some(AnnotationKind::ToDuplicate) => return,
                _ => {}
            }
            if visited.insert(callee.to_string()) {
                trace!(caller = %name, callee = %callee, "hardening callee");
                sets.harden_fns.insert(callee.to_string());
                worklist.push(callee.to_string());
            }
        };
        for block in &func.blocks {
            for inst in &block.instructions {
                match inst {
                    Instruction::Call { func: callee, .. } => visit_callee(callee),
                    Instruction::CallIndirect { .. } => {
                        debug!(function = %name, "indirect call left to the call rewriter");
                    }
                    _ => {}
                }
            }
            if let Terminator::Invoke { callee: InvokeCallee::Direct(callee), .. } =
                &block.terminator
            {
                visit_callee(callee);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::IrType;
    use crate::ir::instruction::{BasicBlock, BlockId, CallInfo, Operand};
    use crate::ir::module::{Global, GlobalInit};

    fn call(callee: &str) -> Instruction {
        Instruction::Call {
            func: callee.to_string(),
            info: CallInfo::new(None, vec![], vec![], IrType::Void),
        }
    }

    fn fn_with_body(name: &str, insts: Vec<Instruction>) -> Function {
        let mut f = Function::new(name, IrType::Void, vec![]);
        f.blocks.push(BasicBlock::new(BlockId(0), insts, Terminator::Return(None)));
        f
    }

    #[test]
    fn direct_callees_enter_closure() {
        let mut m = Module::new();
        m.functions.push(fn_with_body("root", vec![call("mid")]));
        m.functions.push(fn_with_body("mid", vec![call("leaf"), call("skipped")]));
        m.functions.push(fn_with_body("leaf", vec![]));
        m.functions.push(fn_with_body("skipped", vec![]));

        let mut ann = FxHashMap::default();
        ann.insert("root".to_string(), AnnotationKind::ToHarden);
        ann.insert("skipped".to_string(), AnnotationKind::Exclude);

        let sets = compute(&m, &ann);
        assert!(sets.harden_fns.contains("root"));
        assert!(sets.harden_fns.contains("mid"));
        assert!(sets.harden_fns.contains("leaf"));
        assert!(!sets.harden_fns.contains("skipped"));
    }

    #[test]
    fn recursion_terminates() {
        let mut m = Module::new();
        m.functions.push(fn_with_body("a", vec![call("b")]));
        m.functions.push(fn_with_body("b", vec![call("a")]));
        let mut ann = FxHashMap::default();
        ann.insert("a".to_string(), AnnotationKind::ToHarden);
        let sets = compute(&m, &ann);
        assert!(sets.harden_fns.contains("a") && sets.harden_fns.contains("b"));
    }

    #[test]
    fn protected_global_pulls_in_callee() {
        // g is to_harden; its address is loaded and the loaded value is
        // passed to `consume`, which must therefore be hardened.
        let mut m = Module::new();
        m.globals.push(Global::new("g", IrType::I32, GlobalInit::Zero));
        let mut f = Function::new("user", IrType::Void, vec![]);
        f.blocks.push(BasicBlock::new(
            BlockId(0),
            vec![
                Instruction::GlobalAddr { dest: Value(0), name: "g".to_string() },
                Instruction::Load { dest: Value(1), ptr: Value(0), ty: IrType::I32 },
                Instruction::Call {
                    func: "consume".to_string(),
                    info: CallInfo::new(
                        None,
                        vec![Operand::Value(Value(1))],
                        vec![IrType::I32],
                        IrType::Void,
                    ),
                },
            ],
            Terminator::Return(None),
        ));
        f.next_value_id = 2;
        m.functions.push(f);
        m.functions.push(fn_with_body("consume", vec![]));

        let mut ann = FxHashMap::default();
        ann.insert("g".to_string(), AnnotationKind::ToHarden);
        let sets = compute(&m, &ann);
        assert!(sets.harden_globals.contains("g"));
        assert!(sets.harden_fns.contains("consume"));
        assert!(!sets.harden_fns.contains("user"));
    }

    #[test]
    fn constructor_pulls_in_vtable_slots() {
        let mut m = Module::new();
        // vtable { [ null, &A::m ] }
        let mut vt = Global::new(
            "_ZTV1A",
            IrType::Ptr,
            GlobalInit::Compound(vec![GlobalInit::Compound(vec![
                GlobalInit::Scalar(crate::ir::constants::IrConst::Zero),
                GlobalInit::GlobalAddr("_ZN1A1mEv".to_string()),
            ])]),
        );
        vt.is_constant = true;
        m.globals.push(vt);

        let mut ctor = Function::new("_ZN1AC1Ev", IrType::Void, vec![]);
        ctor.blocks.push(BasicBlock::new(
            BlockId(0),
            vec![
                Instruction::GlobalAddr { dest: Value(0), name: "_ZTV1A".to_string() },
                Instruction::GetElementPtr {
                    dest: Value(1),
                    base: Value(0),
                    offset: Operand::Const(crate::ir::constants::IrConst::I64(16)),
                    ty: IrType::Ptr,
                },
                Instruction::Store { val: Operand::Value(Value(1)), ptr: Value(2), ty: IrType::Ptr },
            ],
            Terminator::Return(None),
        ));
        ctor.next_value_id = 3;
        m.functions.push(ctor);
        m.functions.push(fn_with_body("_ZN1A1mEv", vec![]));

        let mut ann = FxHashMap::default();
        ann.insert("_ZN1AC1Ev".to_string(), AnnotationKind::ToHarden);
        let sets = compute(&m, &ann);
        assert!(sets.harden_fns.contains("_ZN1A1mEv"));
        assert_eq!(sets.ctors.len(), 1);
        assert_eq!(sets.ctors[0].vtable.as_deref(), Some("_ZTV1A"));
    }
}
