//! Return-by-reference rewrite (C3).
//!
//! A scalar return can only carry one value, so a protected function that
//! returns one cannot feed both computational streams. For every hardened
//! non-void function `f`, this pass materializes `f_ret`: return type void,
//! original parameters plus two trailing out-pointers. Each `return e`
//! becomes a store of `e` through both pointers followed by a void return;
//! the instruction duplicator later reroutes the second store to the
//! duplicated stream and the call rewriter gives call sites their stack
//! slots. The original `f` is left untouched for unhardened callers.

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::common::types::{IrType, Span};
use crate::ir::instruction::{Instruction, Operand, Terminator};
use crate::ir::module::{Module, Param};

use super::closure::ProtectionSets;

/// The void-return variant created for a hardened non-void function.
#[derive(Debug, Clone)]
pub struct RetVariant {
    pub ret_name: String,
    pub ret_ty: IrType,
}

/// Rewrite every hardened non-void function; returns original name -> variant.
pub fn run(module: &mut Module, protection: &ProtectionSets) -> FxHashMap<String, RetVariant> {
    let mut variants = FxHashMap::default();

    for idx in 0..module.functions.len() {
        let func = &module.functions[idx];
        if func.is_declaration
            || func.return_type == IrType::Void
            || !protection.harden_fns.contains(&func.name)
        {
            continue;
        }

        let ret_ty = func.return_type;
        let ret_name = format!("{}_ret", func.name);
        debug!(function = %func.name, variant = %ret_name, "rewriting return to out-parameters");

        let mut variant = func.clone();
        let n_params = variant.params.len();
        variant.name = ret_name.clone();
        variant.return_type = IrType::Void;
        variant.params.push(Param::new("ret_slot", IrType::Ptr));
        variant.params.push(Param::new("ret_slot_dup", IrType::Ptr));

        for bi in 0..variant.blocks.len() {
            let Terminator::Return(Some(value)) = variant.blocks[bi].terminator.clone() else {
                continue;
            };
            let p1 = variant.fresh_value();
            let p2 = variant.fresh_value();
            let tail = [
                Instruction::ParamRef { dest: p1, param_idx: n_params, ty: IrType::Ptr },
                Instruction::ParamRef { dest: p2, param_idx: n_params + 1, ty: IrType::Ptr },
                Instruction::Store { val: value, ptr: p1, ty: ret_ty },
                Instruction::Store { val: value, ptr: p2, ty: ret_ty },
            ];
            let block = &mut variant.blocks[bi];
            if !block.source_spans.is_empty() {
                let span = block.source_spans.last().copied().unwrap_or(Span::default());
                block.source_spans.extend([span; 4]);
            }
            block.instructions.extend(tail);
            block.terminator = Terminator::Return(None);
        }

        let orig_name = module.functions[idx].name.clone();
        module.functions.push(variant);
        variants.insert(orig_name, RetVariant { ret_name, ret_ty });
    }

    variants
}
