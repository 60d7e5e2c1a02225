//! Call-site rewriting (C7).
//!
//! Four cases, decided per call site inside a duplicated body:
//!
//! 1. callee annotated `to_duplicate` or a duplication-worthy intrinsic:
//!    the call itself is cloned onto the duplicated stream;
//! 2. callee has a duplicated variant: the call is redirected to it with a
//!    doubled argument list (and, for rewritten non-void callees, two stack
//!    slots that carry the return pair back);
//! 3. indirect callee: the synthesized function type is doubled and the call
//!    goes through the same pointer with the doubled argument list;
//! 4. anything else (external, excluded, grey without a duplicate): the call
//!    is left alone, but each pointer argument's duplicate is refreshed from
//!    the original afterwards, since the callee may have written through it.

use tracing::{debug, trace};

use crate::common::types::IrType;
use crate::ir::instruction::{CallInfo, Instruction, Operand, Value};

use super::duplicate::{DupMap, ParamLayout, ValueAlloc};
use super::Cx;

/// Decision for one call site.
pub(crate) enum CallAction {
    /// Clone the call right after the original.
    Duplicate,
    /// Replace the call with a call to the duplicated variant.
    Redirect(CallPlan),
    /// Indirect call: double the synthesized signature in place.
    IndirectDouble,
    /// Keep the call; re-synchronize pointer-argument duplicates after it.
    Refresh,
}

pub(crate) struct CallPlan {
    pub dup_name: String,
    pub callee_layout: ParamLayout,
    pub ret: Option<RetCallPlan>,
}

/// Slots and loads wired around a call to a return-rewritten callee.
pub(crate) struct RetCallPlan {
    pub slot1: Value,
    pub slot2: Value,
    /// Duplicate-stream load destination, paired with the original result.
    /// None when the caller ignored the result.
    pub load2: Option<Value>,
    pub ret_ty: IrType,
}

/// Memcpy-family intrinsics are duplicated rather than refreshed: running
/// them twice with rewired operands keeps both memory images in step. Plain
/// libc calls (`memcpy` et al.) stay external and take the refresh path.
pub(crate) fn is_duplicable_intrinsic(name: &str) -> bool {
    name.starts_with("llvm.memcpy")
        || name.starts_with("llvm.memmove")
        || name.starts_with("llvm.memset")
}

/// Decide what to do with a direct call to `callee`.
pub(crate) fn classify_call(
    callee: &str,
    info: &CallInfo,
    cx: &Cx,
    alloc: &mut ValueAlloc,
    dups: &mut DupMap,
) -> CallAction {
    use super::annotations::AnnotationKind;

    if cx.annotations.get(callee) == Some(&AnnotationKind::ToDuplicate)
        || is_duplicable_intrinsic(callee)
    {
        trace!(callee = %callee, "duplicating call");
        if let Some(dest) = info.dest {
            dups.insert_pair(dest, alloc.fresh());
        }
        return CallAction::Duplicate;
    }

    if let Some(dup_name) = cx.name_dups.get(callee) {
        let callee_layout = match cx.layouts.get(dup_name) {
            Some(l) => *l,
            None => {
                // The name pairing points at a global, not a function.
                return CallAction::Refresh;
            }
        };
        let ret = cx.ret_variants.get(callee).map(|rv| {
            let slot1 = alloc.fresh();
            let slot2 = alloc.fresh();
            let load2 = info.dest.map(|dest| {
                let load2 = alloc.fresh();
                dups.insert_pair(dest, load2);
                load2
            });
            RetCallPlan { slot1, slot2, load2, ret_ty: rv.ret_ty }
        });
        trace!(callee = %callee, dup = %dup_name, "redirecting call");
        return CallAction::Redirect(CallPlan {
            dup_name: dup_name.to_string(),
            callee_layout,
            ret,
        });
    }

    debug!(callee = %callee, "no duplicate; will refresh pointer arguments");
    CallAction::Refresh
}

/// Double an argument list into `layout`'s slot order: each original keeps
/// its primary slot and the rewired copy fills the duplicate slot. Arguments
/// without a registered duplicate are passed twice unchanged. Per-parameter
/// attributes follow the argument into both slots.
pub(crate) fn double_args(info: &CallInfo, layout: ParamLayout, dups: &DupMap) -> CallInfo {
    let n = info.args.len();
    // Variadic tails make the call wider than the callee prototype; lay the
    // doubled list out by the call's own width in that case.
    let layout = if n == layout.n_data {
        layout
    } else {
        ParamLayout { n_data: n, has_ret_slots: false, alternate: layout.alternate }
    };

    let total = 2 * n;
    let mut args = vec![Operand::Const(crate::ir::constants::IrConst::Zero); total];
    let mut arg_types = vec![IrType::Void; total];
    let mut param_attrs = vec![Vec::new(); total];

    for i in 0..n {
        let original = info.args[i];
        let mut copy = original;
        if let Operand::Value(v) = &mut copy {
            if let Some(d) = dups.get(*v) {
                *v = d;
            }
        }
        let ty = info.arg_types.get(i).copied().unwrap_or(IrType::Void);
        let attrs = info.param_attrs.get(i).cloned().unwrap_or_default();

        args[layout.primary(i)] = original;
        args[layout.dup(i)] = copy;
        arg_types[layout.primary(i)] = ty;
        arg_types[layout.dup(i)] = ty;
        param_attrs[layout.primary(i)] = attrs.clone();
        param_attrs[layout.dup(i)] = attrs;
    }

    CallInfo {
        dest: info.dest,
        args,
        arg_types,
        return_type: info.return_type,
        is_variadic: info.is_variadic,
        num_fixed_args: 2 * info.num_fixed_args,
        param_attrs,
    }
}

/// Build the redirected call payload: the doubled `CallInfo` (plus return
/// slots when the callee was return-rewritten), the trailing loads that
/// repopulate the caller's result pair, and the slot allocas to hoist into
/// the entry block.
pub(crate) fn redirect_call_info(
    info: &CallInfo,
    plan: &CallPlan,
    dups: &DupMap,
) -> (CallInfo, Vec<Instruction>, Vec<Instruction>) {
    let mut doubled = double_args(info, plan.callee_layout, dups);
    let mut loads = Vec::new();
    let mut slot_allocas = Vec::new();

    if let Some(ret) = &plan.ret {
        for slot in [ret.slot1, ret.slot2] {
            slot_allocas.push(Instruction::Alloca {
                dest: slot,
                ty: ret.ret_ty,
                size: ret.ret_ty.size(),
                align: 0,
                volatile: false,
            });
            doubled.args.push(Operand::Value(slot));
            doubled.arg_types.push(IrType::Ptr);
            doubled.param_attrs.push(Vec::new());
        }
        doubled.num_fixed_args = doubled.args.len();
        doubled.return_type = IrType::Void;
        if let Some(dest) = doubled.dest.take() {
            loads.push(Instruction::Load { dest, ptr: ret.slot1, ty: ret.ret_ty });
            if let Some(load2) = ret.load2 {
                loads.push(Instruction::Load { dest: load2, ptr: ret.slot2, ty: ret.ret_ty });
            }
        }
    }

    (doubled, loads, slot_allocas)
}

/// Load/store pairs that copy the current contents of each pointer argument
/// over its duplicate after an unduplicated callee returns.
pub(crate) fn refresh_sequence(
    info: &CallInfo,
    dups: &DupMap,
    pointee: impl Fn(Value) -> Option<IrType>,
    alloc: &mut ValueAlloc,
) -> Vec<Instruction> {
    let mut seq = Vec::new();
    for (i, arg) in info.args.iter().enumerate() {
        if info.arg_types.get(i).copied() != Some(IrType::Ptr) {
            continue;
        }
        let Some(v) = arg.value() else { continue };
        let Some(dup) = dups.get(v) else { continue };
        // Pointer-sized refresh when the pointee cannot be resolved.
        let ty = pointee(v).unwrap_or(IrType::Ptr);
        let tmp = alloc.fresh();
        seq.push(Instruction::Load { dest: tmp, ptr: v, ty });
        seq.push(Instruction::Store { val: Operand::Value(tmp), ptr: dup, ty });
    }
    seq
}
