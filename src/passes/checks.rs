//! Consistency-check insertion (C6) and error-block synthesis.
//!
//! At each synchronization point the containing block is split: the leading
//! instructions move into a fresh predecessor, an empty verification block
//! goes in between, and the original block keeps its label (so successor
//! phis keep naming the right predecessor). The verification block compares
//! every operand pair the duplicate map knows about, ANDs the results and
//! conditionally branches: onward on agreement, to the error path on
//! mismatch.
//!
//! The error path is a per-edge clone of `call DataCorruption_Handler();
//! unreachable`, so each failing edge carries its own source location. The
//! canonical error label the checks branch to is never materialized as a
//! block; synthesis replaces each use with its clone, which leaves the
//! module exactly as if a template block had been cloned and deleted.

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, trace};

use crate::common::config::DATA_CORRUPTION_HANDLER;
use crate::common::types::{IrType, Span};
use crate::ir::analysis::{build_cfg, build_label_map, reachable_from};
use crate::ir::instruction::{
    BasicBlock, BlockId, CallInfo, Instruction, Operand, Terminator, Value,
};
use crate::ir::module::Function;
use crate::ir::ops::{IrBinOp, IrCmpOp};

use super::duplicate::{pointee_type, DupMap, ValueAlloc};
use super::Cx;

/// One planned synchronization point. `pos == instructions.len()` denotes
/// the block terminator.
struct SyncCheck {
    label: BlockId,
    pos: usize,
    insts: Vec<Instruction>,
    cond: Option<Value>,
    span: Span,
}

/// Insert consistency checks into a fully duplicated function. `exempt`
/// lists (block, index) positions that belong to the duplicated stream or
/// to refresh code and must not be treated as synchronization points.
/// Returns the canonical error label and the number of checks inserted.
pub fn insert_checks(
    f: &mut Function,
    dups: &mut DupMap,
    cx: &Cx,
    exempt: &[(BlockId, usize)],
) -> (BlockId, usize) {
    let mut next_block = f.fresh_block_id().0;
    let err_label = BlockId(next_block);
    next_block += 1;

    let exempt: FxHashSet<(BlockId, usize)> = exempt.iter().copied().collect();
    let mode = cx.config.mode;

    // Pre-split facts: predecessor counts, forward reachability, value types,
    // defining instructions, and which blocks store through which values.
    let label_map = build_label_map(f);
    let (preds, succs) = build_cfg(f, &label_map);
    let num_blocks = f.blocks.len();

    let mut vtypes: FxHashMap<Value, IrType> = FxHashMap::default();
    let mut def_insts: FxHashMap<Value, Instruction> = FxHashMap::default();
    let mut store_users: FxHashMap<Value, Vec<(usize, usize)>> = FxHashMap::default();
    for (bi, block) in f.blocks.iter().enumerate() {
        for (ii, inst) in block.instructions.iter().enumerate() {
            if let Some(dest) = inst.dest() {
                if let Some(ty) = inst.result_type() {
                    vtypes.insert(dest, ty);
                }
                def_insts.insert(dest, inst.clone());
            }
            if matches!(inst, Instruction::Store { .. } | Instruction::AtomicStore { .. }) {
                inst.for_each_used_value(|v| store_users.entry(v).or_default().push((bi, ii)));
            }
        }
        if let Terminator::Invoke { info, .. } = &block.terminator {
            if let Some(dest) = info.dest {
                vtypes.insert(dest, info.return_type);
            }
        }
    }

    let mut reach_memo: FxHashMap<usize, Vec<bool>> = FxHashMap::default();
    let mut alloc = ValueAlloc::new(f);
    let mut syncs: Vec<SyncCheck> = Vec::new();

    for (bi, block) in f.blocks.iter().enumerate() {
        if mode.multi_predecessor_only() && preds.len(bi) <= 1 {
            continue;
        }
        for (ii, inst) in block.instructions.iter().enumerate() {
            if exempt.contains(&(block.label, ii)) {
                continue;
            }
            let selected = match inst {
                Instruction::Store { .. }
                | Instruction::AtomicStore { .. }
                | Instruction::AtomicRmw { .. }
                | Instruction::AtomicCmpxchg { .. } => mode.check_at_stores(),
                Instruction::Call { .. }
                | Instruction::CallIndirect { .. }
                | Instruction::Memcpy { .. } => mode.check_at_calls(),
                _ => false,
            };
            if !selected {
                continue;
            }
            let mut operands = Vec::new();
            inst.for_each_used_value(|v| operands.push(v));
            let (insts, cond) = build_comparisons(
                &operands,
                (bi, ii),
                dups,
                cx,
                &vtypes,
                &def_insts,
                &store_users,
                &succs,
                num_blocks,
                &mut reach_memo,
                &mut alloc,
            );
            syncs.push(SyncCheck {
                label: block.label,
                pos: ii,
                insts,
                cond,
                span: block.span_of(ii).unwrap_or_default(),
            });
        }

        let branch_sync = match &block.terminator {
            Terminator::CondBranch { .. } => mode.check_at_branches(),
            Terminator::Switch { .. } => mode.check_at_branches(),
            Terminator::IndirectBranch { possible_targets, .. } => {
                mode.check_at_branches() && possible_targets.len() > 1
            }
            Terminator::Invoke { .. } => mode.check_at_calls(),
            _ => false,
        };
        if branch_sync {
            let mut operands = Vec::new();
            block.terminator.for_each_used_value(|v| operands.push(v));
            let (insts, cond) = build_comparisons(
                &operands,
                (bi, usize::MAX),
                dups,
                cx,
                &vtypes,
                &def_insts,
                &store_users,
                &succs,
                num_blocks,
                &mut reach_memo,
                &mut alloc,
            );
            syncs.push(SyncCheck {
                label: block.label,
                pos: block.instructions.len(),
                insts,
                cond,
                span: block.source_spans.last().copied().unwrap_or_default(),
            });
        }
    }

    let inserted = syncs.len();

    // Apply the splits. Within one original block, later positions first:
    // each split leaves the head in a fresh predecessor, which becomes the
    // container for the earlier positions (indices unchanged).
    let mut by_block: FxHashMap<BlockId, Vec<SyncCheck>> = FxHashMap::default();
    for s in syncs {
        by_block.entry(s.label).or_default().push(s);
    }
    // Deterministic block order.
    let labels: Vec<BlockId> = f.blocks.iter().map(|b| b.label).collect();
    for label in labels {
        let Some(mut list) = by_block.remove(&label) else { continue };
        list.sort_by(|a, b| b.pos.cmp(&a.pos));
        let mut container = label;
        for sync in list {
            container = split_and_verify(f, container, sync, err_label, &mut next_block, cx);
        }
    }

    f.next_value_id = alloc.finish();
    debug!(function = %f.name, checks = inserted, "inserted consistency checks");
    (err_label, inserted)
}

/// Split `container` before `sync.pos`, wire the verification block in
/// between, and return the label of the new predecessor (which now holds
/// the instructions before the split point).
fn split_and_verify(
    f: &mut Function,
    container: BlockId,
    sync: SyncCheck,
    err_label: BlockId,
    next_block: &mut u32,
    cx: &Cx,
) -> BlockId {
    let ci = f.block_index(container).expect("container exists");
    let pos = sync.pos.min(f.blocks[ci].instructions.len());

    let p_label = BlockId(*next_block);
    let v_label = BlockId(*next_block + 1);
    *next_block += 2;

    // Incoming edges now enter through the new predecessor; phis in
    // successor blocks keep naming `container`, whose terminator they
    // still receive control from.
    f.retarget_edges(container, p_label);

    let tracked = !f.blocks[ci].source_spans.is_empty();
    let head: Vec<Instruction> = f.blocks[ci].instructions.drain(..pos).collect();
    let head_spans: Vec<Span> = if tracked {
        f.blocks[ci].source_spans.drain(..pos).collect()
    } else {
        Vec::new()
    };

    let mut pred = BasicBlock::new(p_label, head, Terminator::Branch(v_label));
    pred.source_spans = head_spans;

    let terminator = match sync.cond {
        Some(cond) => Terminator::CondBranch {
            cond: Operand::Value(cond),
            true_label: container,
            false_label: err_label,
        },
        None => Terminator::Branch(container),
    };
    let mut verify = BasicBlock::new(v_label, sync.insts, terminator);
    if tracked && cx.config.debug_info {
        verify.source_spans = vec![sync.span; verify.instructions.len()];
    }

    trace!(%container, verification = %v_label, "split synchronization point");
    f.blocks.insert(ci, verify);
    f.blocks.insert(ci, pred);
    p_label
}

/// Build the comparison sequence for the operands of one synchronization
/// instruction. Returns the instructions and the final ANDed condition
/// (None when nothing was comparable).
#[allow(clippy::too_many_arguments)]
fn build_comparisons(
    operands: &[Value],
    at: (usize, usize),
    dups: &mut DupMap,
    cx: &Cx,
    vtypes: &FxHashMap<Value, IrType>,
    def_insts: &FxHashMap<Value, Instruction>,
    store_users: &FxHashMap<Value, Vec<(usize, usize)>>,
    succs: &crate::ir::analysis::FlatAdj,
    num_blocks: usize,
    reach_memo: &mut FxHashMap<usize, Vec<bool>>,
    alloc: &mut ValueAlloc,
) -> (Vec<Instruction>, Option<Value>) {
    let mut insts = Vec::new();
    let mut cmps: Vec<Value> = Vec::new();
    let mut seen: FxHashSet<Value> = FxHashSet::default();

    for &v in operands {
        if !seen.insert(v) {
            continue;
        }
        let Some(dup) = dups.get(v) else { continue };
        let Some(ty) = vtypes.get(&v).copied() else { continue };

        match ty {
            IrType::Ptr => {
                // Pointees are compared only when a store through the
                // pointer is forward-reachable; otherwise the two copies
                // hold the same provably-equal address.
                let written = store_users.get(&v).is_some_and(|positions| {
                    positions.iter().any(|&(b, i)| {
                        if (b, i) == at {
                            return false;
                        }
                        let reach = reach_memo
                            .entry(at.0)
                            .or_insert_with(|| reachable_from(num_blocks, succs, at.0));
                        reach[b]
                    })
                });
                if !written {
                    continue;
                }
                let Some(pt) = pointee_type(def_insts, cx, v) else { continue };
                if pt.is_array() || pt == IrType::Void {
                    continue;
                }
                let l1 = alloc.fresh();
                let l2 = alloc.fresh();
                insts.push(Instruction::Load { dest: l1, ptr: v, ty: pt });
                insts.push(Instruction::Load { dest: l2, ptr: dup, ty: pt });
                cmps.push(push_cmp(&mut insts, alloc, l1, l2, pt));
            }
            IrType::Array { elem, len } => {
                for index in 0..len {
                    let e1 = alloc.fresh();
                    let e2 = alloc.fresh();
                    insts.push(Instruction::ExtractValue { dest: e1, agg: v, index, elem });
                    insts.push(Instruction::ExtractValue { dest: e2, agg: dup, index, elem });
                    dups.insert_pair(e1, e2);
                    // Pointer elements have no loadable pointee here; their
                    // addresses legitimately differ between the streams.
                    if elem != crate::common::types::Scalar::Ptr {
                        cmps.push(push_cmp(&mut insts, alloc, e1, e2, elem.ty()));
                    }
                }
            }
            IrType::Void => {}
            _ => cmps.push(push_cmp(&mut insts, alloc, v, dup, ty)),
        }
    }

    let cond = cmps.split_first().map(|(first, rest)| {
        let mut acc = *first;
        for &c in rest {
            let next = alloc.fresh();
            insts.push(Instruction::BinOp {
                dest: next,
                op: IrBinOp::And,
                lhs: Operand::Value(acc),
                rhs: Operand::Value(c),
                ty: IrType::I8,
            });
            acc = next;
        }
        acc
    });

    (insts, cond)
}

fn push_cmp(
    insts: &mut Vec<Instruction>,
    alloc: &mut ValueAlloc,
    a: Value,
    b: Value,
    ty: IrType,
) -> Value {
    let dest = alloc.fresh();
    let op = if ty.is_float() { IrCmpOp::Fueq } else { IrCmpOp::Eq };
    insts.push(Instruction::Cmp {
        dest,
        op,
        lhs: Operand::Value(a),
        rhs: Operand::Value(b),
        ty,
    });
    dest
}

/// Clone the error path once per failing edge and retarget the edges; the
/// canonical label disappears with its last use. Declares nothing: the
/// handler declaration is the pipeline driver's job.
pub fn synthesize_error_blocks(f: &mut Function, err_label: BlockId) -> usize {
    let mut clones = 0;
    let n = f.blocks.len();
    for bi in 0..n {
        if !f.blocks[bi].terminator.successors().contains(&err_label) {
            continue;
        }
        let clone_label = f.fresh_block_id();
        let span = f.blocks[bi].source_spans.last().copied();
        let mut err_block = BasicBlock::new(
            clone_label,
            vec![Instruction::Call {
                func: DATA_CORRUPTION_HANDLER.to_string(),
                info: CallInfo::new(None, vec![], vec![], IrType::Void),
            }],
            Terminator::Unreachable,
        );
        if let Some(span) = span {
            err_block.source_spans.push(span);
        }
        f.blocks[bi].terminator.for_each_target_mut(|t| {
            if *t == err_label {
                *t = clone_label;
            }
        });
        f.blocks.push(err_block);
        clones += 1;
    }
    clones
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::config::{DuplicationMode, HardeningConfig};
    use crate::ir::constants::IrConst;
    use rustc_hash::FxHashMap as Map;

    fn test_cx(config: &HardeningConfig) -> Cx<'_> {
        // Leaked maps keep the borrows simple in tests.
        Cx {
            config,
            annotations: Box::leak(Box::new(Map::default())),
            name_dups: Box::leak(Box::new(Default::default())),
            ret_variants: Box::leak(Box::new(Map::default())),
            layouts: Box::leak(Box::new(Map::default())),
            global_types: Box::leak(Box::new(Map::default())),
        }
    }

    /// v1/v11 is a duplicated pair feeding a store through an unpaired
    /// pointer: the check must compare the pair and branch to an error
    /// clone.
    fn store_function() -> (Function, DupMap) {
        let mut f = Function::new("f_dup", IrType::Void, vec![]);
        f.blocks.push(BasicBlock::new(
            BlockId(0),
            vec![
                Instruction::Alloca { dest: Value(0), ty: IrType::I32, size: 4, align: 0, volatile: false },
                Instruction::BinOp {
                    dest: Value(1),
                    op: IrBinOp::Add,
                    lhs: Operand::Const(IrConst::I32(1)),
                    rhs: Operand::Const(IrConst::I32(2)),
                    ty: IrType::I32,
                },
                Instruction::BinOp {
                    dest: Value(11),
                    op: IrBinOp::Add,
                    lhs: Operand::Const(IrConst::I32(1)),
                    rhs: Operand::Const(IrConst::I32(2)),
                    ty: IrType::I32,
                },
                Instruction::Store { val: Operand::Value(Value(1)), ptr: Value(0), ty: IrType::I32 },
            ],
            Terminator::Return(None),
        ));
        f.next_value_id = 12;
        let mut dups = DupMap::default();
        dups.insert_pair(Value(1), Value(11));
        (f, dups)
    }

    #[test]
    fn store_check_splits_and_branches_to_error() {
        let (mut f, mut dups) = store_function();
        let config = HardeningConfig::default();
        let cx = test_cx(&config);
        let (err_label, inserted) = insert_checks(&mut f, &mut dups, &cx, &[]);
        assert_eq!(inserted, 1);
        let clones = synthesize_error_blocks(&mut f, err_label);
        assert_eq!(clones, 1);

        // pred, verification, original, error clone
        assert_eq!(f.blocks.len(), 4);
        let verify = &f.blocks[1];
        assert!(matches!(verify.instructions[0], Instruction::Cmp { op: IrCmpOp::Eq, .. }));
        let Terminator::CondBranch { true_label, false_label, .. } = verify.terminator else {
            panic!("verification block must end in a conditional branch");
        };
        assert_eq!(true_label, BlockId(0));
        // The error edge targets the per-edge clone, not the template.
        assert_ne!(false_label, err_label);
        let err_block = f.blocks.iter().find(|b| b.label == false_label).unwrap();
        match &err_block.instructions[0] {
            Instruction::Call { func, .. } => assert_eq!(func, DATA_CORRUPTION_HANDLER),
            other => panic!("unexpected error block contents {other:?}"),
        }
        assert!(matches!(err_block.terminator, Terminator::Unreachable));

        // The original block kept its label and the store.
        let orig = f.blocks.iter().find(|b| b.label == BlockId(0)).unwrap();
        assert!(matches!(orig.instructions[0], Instruction::Store { .. }));
        assert!(dups.is_symmetric());
    }

    #[test]
    fn unpaired_store_gets_unconditional_verification() {
        let (mut f, _) = store_function();
        let mut dups = DupMap::default(); // nothing paired
        let config = HardeningConfig::default();
        let cx = test_cx(&config);
        let (err_label, inserted) = insert_checks(&mut f, &mut dups, &cx, &[]);
        assert_eq!(inserted, 1);
        assert_eq!(synthesize_error_blocks(&mut f, err_label), 0);
        let verify = &f.blocks[1];
        assert!(verify.instructions.is_empty());
        assert!(matches!(verify.terminator, Terminator::Branch(BlockId(0))));
    }

    #[test]
    fn fdsc_skips_single_predecessor_blocks() {
        let (mut f, mut dups) = store_function();
        let mut config = HardeningConfig::default();
        config.mode = DuplicationMode::Fdsc;
        let cx = test_cx(&config);
        let (_, inserted) = insert_checks(&mut f, &mut dups, &cx, &[]);
        assert_eq!(inserted, 0);
        assert_eq!(f.blocks.len(), 1);
    }

    #[test]
    fn seddi_checks_branches_not_stores() {
        let (mut f, mut dups) = store_function();
        // Turn the return into a conditional branch over the pair.
        f.blocks[0].terminator = Terminator::CondBranch {
            cond: Operand::Value(Value(1)),
            true_label: BlockId(1),
            false_label: BlockId(2),
        };
        f.blocks.push(BasicBlock::new(BlockId(1), vec![], Terminator::Return(None)));
        f.blocks.push(BasicBlock::new(BlockId(2), vec![], Terminator::Return(None)));
        let mut config = HardeningConfig::default();
        config.mode = DuplicationMode::Seddi;
        let cx = test_cx(&config);
        let (err_label, inserted) = insert_checks(&mut f, &mut dups, &cx, &[]);
        // Only the branch point is selected.
        assert_eq!(inserted, 1);
        assert_eq!(synthesize_error_blocks(&mut f, err_label), 1);
        // The verification block compares the branch condition pair.
        let verify = f
            .blocks
            .iter()
            .find(|b| matches!(b.terminator, Terminator::CondBranch { false_label, .. } if false_label != BlockId(1) && false_label != BlockId(2)))
            .expect("verification block");
        assert!(matches!(verify.instructions[0], Instruction::Cmp { .. }));
    }

    #[test]
    fn exempt_positions_are_skipped() {
        let (mut f, mut dups) = store_function();
        let config = HardeningConfig::default();
        let cx = test_cx(&config);
        let (_, inserted) = insert_checks(&mut f, &mut dups, &cx, &[(BlockId(0), 3)]);
        assert_eq!(inserted, 0);
    }
}
