//! IR instruction definitions: the core instruction set.
//!
//! Key types:
//! - `BlockId`: basic block identifier (u32 index)
//! - `Value`: SSA value reference (u32 index)
//! - `Operand`: either a `Value` or an `IrConst`
//! - `Instruction`: the main instruction enum
//! - `CallInfo`: shared metadata for direct and indirect calls
//! - `Terminator`: block terminators (return, branch, switch, invoke)
//! - `BasicBlock`: a labeled sequence of instructions ending in a terminator

use crate::common::types::{IrType, Scalar, Span};
use super::constants::IrConst;
use super::ops::{AtomicOrdering, AtomicRmwOp, IrBinOp, IrCmpOp, IrUnaryOp};

/// A basic block identifier. Uses a u32 index for zero-cost copies
/// instead of heap-allocated String labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, ".LBB{}", self.0)
    }
}

/// An SSA value reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Value(pub u32);

/// An operand (either a value reference or a constant).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Operand {
    Value(Value),
    Const(IrConst),
}

impl Operand {
    pub fn value(&self) -> Option<Value> {
        match self {
            Operand::Value(v) => Some(*v),
            Operand::Const(_) => None,
        }
    }
}

/// A basic block in the CFG.
#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub label: BlockId,
    pub instructions: Vec<Instruction>,
    pub terminator: Terminator,
    /// Source spans parallel to `instructions`. Empty when locations are not
    /// being tracked.
    pub source_spans: Vec<Span>,
}

impl BasicBlock {
    pub fn new(label: BlockId, instructions: Vec<Instruction>, terminator: Terminator) -> Self {
        Self { label, instructions, terminator, source_spans: Vec::new() }
    }

    /// Span for instruction `idx`, if locations are tracked.
    pub fn span_of(&self, idx: usize) -> Option<Span> {
        self.source_spans.get(idx).copied()
    }
}

/// Per-parameter attributes, propagated through signature rewrites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamAttr {
    ZExt,
    SExt,
    NoAlias,
    NonNull,
    ReadOnly,
    StructRet,
}

/// Shared call metadata for both direct and indirect function calls.
#[derive(Debug, Clone)]
pub struct CallInfo {
    /// Destination value for the return, or None for void calls.
    pub dest: Option<Value>,
    /// Argument operands.
    pub args: Vec<Operand>,
    /// Type of each argument (parallel to `args`).
    pub arg_types: Vec<IrType>,
    /// Return type of the callee.
    pub return_type: IrType,
    /// Whether the callee is variadic.
    pub is_variadic: bool,
    /// Number of named (non-variadic) parameters in the callee's prototype.
    pub num_fixed_args: usize,
    /// Per-argument attributes (parallel to `args`).
    pub param_attrs: Vec<Vec<ParamAttr>>,
}

impl CallInfo {
    pub fn new(dest: Option<Value>, args: Vec<Operand>, arg_types: Vec<IrType>, return_type: IrType) -> Self {
        let n = args.len();
        Self {
            dest,
            args,
            arg_types,
            return_type,
            is_variadic: false,
            num_fixed_args: n,
            param_attrs: vec![Vec::new(); n],
        }
    }
}

/// An IR instruction.
#[derive(Debug, Clone)]
pub enum Instruction {
    /// Allocate stack space: %dest = alloca ty
    /// `align` is the alignment override (0 means use the type's alignment).
    /// `volatile` pins the slot in memory (must survive setjmp/longjmp).
    Alloca { dest: Value, ty: IrType, size: usize, align: usize, volatile: bool },

    /// Store to memory: store val, ptr (type indicates width of the store)
    Store { val: Operand, ptr: Value, ty: IrType },

    /// Load from memory: %dest = load ptr
    Load { dest: Value, ptr: Value, ty: IrType },

    /// Binary operation: %dest = op lhs, rhs
    BinOp { dest: Value, op: IrBinOp, lhs: Operand, rhs: Operand, ty: IrType },

    /// Unary operation: %dest = op src
    UnaryOp { dest: Value, op: IrUnaryOp, src: Operand, ty: IrType },

    /// Comparison: %dest = cmp op lhs, rhs (produces I8)
    Cmp { dest: Value, op: IrCmpOp, lhs: Operand, rhs: Operand, ty: IrType },

    /// Direct function call: %dest = call func(args...)
    Call { func: String, info: CallInfo },

    /// Indirect function call through a pointer: %dest = call_indirect ptr(args...)
    CallIndirect { func_ptr: Operand, info: CallInfo },

    /// Get element pointer: %dest = base + offset (byte offset)
    /// `ty` is the element type addressed through the result.
    GetElementPtr { dest: Value, base: Value, offset: Operand, ty: IrType },

    /// Type cast/conversion
    Cast { dest: Value, src: Operand, from_ty: IrType, to_ty: IrType },

    /// Copy a value
    Copy { dest: Value, src: Operand },

    /// Get address of a global
    GlobalAddr { dest: Value, name: String },

    /// Memory copy: memcpy(dest, src, size)
    Memcpy { dest: Value, src: Value, size: usize },

    /// SSA Phi node: merges values from predecessor blocks.
    Phi { dest: Value, ty: IrType, incoming: Vec<(Operand, BlockId)> },

    /// Conditional select: %dest = cond != 0 ? true_val : false_val
    Select { dest: Value, cond: Operand, true_val: Operand, false_val: Operand, ty: IrType },

    /// Extract element `index` from an array-typed SSA value.
    ExtractValue { dest: Value, agg: Value, index: u32, elem: Scalar },

    /// Replace element `index` of an array-typed SSA value.
    InsertValue { dest: Value, agg: Value, index: u32, val: Operand, elem: Scalar },

    /// Atomic read-modify-write: %dest = atomicrmw op ptr, val
    AtomicRmw { dest: Value, op: AtomicRmwOp, ptr: Operand, val: Operand, ty: IrType, ordering: AtomicOrdering },

    /// Atomic compare-exchange: %dest = cmpxchg ptr, expected, desired
    AtomicCmpxchg {
        dest: Value,
        ptr: Operand,
        expected: Operand,
        desired: Operand,
        ty: IrType,
        success_ordering: AtomicOrdering,
        failure_ordering: AtomicOrdering,
        /// If true, dest gets the success boolean; otherwise the old value.
        returns_bool: bool,
    },

    /// Atomic load: %dest = atomic_load ptr
    AtomicLoad { dest: Value, ptr: Operand, ty: IrType, ordering: AtomicOrdering },

    /// Atomic store: atomic_store ptr, val
    AtomicStore { ptr: Operand, val: Operand, ty: IrType, ordering: AtomicOrdering },

    /// Memory fence
    Fence { ordering: AtomicOrdering },

    /// Reference to a function parameter value: %dest = paramref param_idx
    ParamRef { dest: Value, param_idx: usize, ty: IrType },
}

/// Callee of an invoke terminator.
#[derive(Debug, Clone)]
pub enum InvokeCallee {
    Direct(String),
    Indirect(Operand),
}

/// Block terminator.
#[derive(Debug, Clone)]
pub enum Terminator {
    /// Return from function
    Return(Option<Operand>),

    /// Unconditional branch
    Branch(BlockId),

    /// Conditional branch
    CondBranch { cond: Operand, true_label: BlockId, false_label: BlockId },

    /// Switch dispatch: `val` against `cases`, falling back to `default`.
    Switch { val: Operand, cases: Vec<(i64, BlockId)>, default: BlockId },

    /// Indirect branch (computed goto): goto *addr
    IndirectBranch { target: Operand, possible_targets: Vec<BlockId> },

    /// Call that may unwind: control continues at `normal` on return and at
    /// `unwind` on an exception. The result value (if any) is available in
    /// the normal destination.
    Invoke { callee: InvokeCallee, info: CallInfo, normal: BlockId, unwind: BlockId },

    /// Unreachable (e.g., after a noreturn call)
    Unreachable,
}

// === Instruction impl: dest, result_type, value visitors ===

impl Instruction {
    /// Get the destination value defined by this instruction, if any.
    pub fn dest(&self) -> Option<Value> {
        match self {
            Instruction::Alloca { dest, .. }
            | Instruction::Load { dest, .. }
            | Instruction::BinOp { dest, .. }
            | Instruction::UnaryOp { dest, .. }
            | Instruction::Cmp { dest, .. }
            | Instruction::GetElementPtr { dest, .. }
            | Instruction::Cast { dest, .. }
            | Instruction::Copy { dest, .. }
            | Instruction::GlobalAddr { dest, .. }
            | Instruction::Phi { dest, .. }
            | Instruction::Select { dest, .. }
            | Instruction::ExtractValue { dest, .. }
            | Instruction::InsertValue { dest, .. }
            | Instruction::AtomicRmw { dest, .. }
            | Instruction::AtomicCmpxchg { dest, .. }
            | Instruction::AtomicLoad { dest, .. }
            | Instruction::ParamRef { dest, .. } => Some(*dest),
            Instruction::Call { info, .. }
            | Instruction::CallIndirect { info, .. } => info.dest,
            Instruction::Store { .. }
            | Instruction::Memcpy { .. }
            | Instruction::AtomicStore { .. }
            | Instruction::Fence { .. } => None,
        }
    }

    /// Returns the result IR type of this instruction, if any.
    pub fn result_type(&self) -> Option<IrType> {
        match self {
            Instruction::Load { ty, .. } => Some(*ty),
            Instruction::BinOp { ty, .. } => Some(*ty),
            Instruction::UnaryOp { ty, .. } => Some(*ty),
            Instruction::Cmp { .. } => Some(IrType::I8),
            Instruction::Cast { to_ty, .. } => Some(*to_ty),
            Instruction::Call { info, .. }
            | Instruction::CallIndirect { info, .. } => Some(info.return_type),
            Instruction::AtomicRmw { ty, .. } => Some(*ty),
            Instruction::AtomicCmpxchg { ty, returns_bool, .. } => {
                if *returns_bool { Some(IrType::I8) } else { Some(*ty) }
            }
            Instruction::AtomicLoad { ty, .. } => Some(*ty),
            Instruction::Alloca { .. }
            | Instruction::GetElementPtr { .. }
            | Instruction::GlobalAddr { .. } => Some(IrType::Ptr),
            Instruction::Copy { .. } => None, // unknown without tracking
            Instruction::Phi { ty, .. } => Some(*ty),
            Instruction::Select { ty, .. } => Some(*ty),
            Instruction::ExtractValue { elem, .. } => Some(elem.ty()),
            Instruction::InsertValue { .. } => None, // array type of agg
            Instruction::ParamRef { ty, .. } => Some(*ty),
            Instruction::Store { .. }
            | Instruction::Memcpy { .. }
            | Instruction::AtomicStore { .. }
            | Instruction::Fence { .. } => None,
        }
    }

    /// Call `f(value)` for every Value used as an operand in this instruction.
    ///
    /// This is the canonical read-only value visitor. All passes that need to
    /// enumerate instruction operands should use this method to avoid
    /// duplicating the match block.
    #[inline]
    pub fn for_each_used_value(&self, mut f: impl FnMut(Value)) {
        #[inline(always)]
        fn visit_op(op: &Operand, f: &mut impl FnMut(Value)) {
            if let Operand::Value(v) = op {
                f(*v);
            }
        }
        match self {
            Instruction::Alloca { .. }
            | Instruction::GlobalAddr { .. }
            | Instruction::Fence { .. }
            | Instruction::ParamRef { .. } => {}
            Instruction::Load { ptr, .. } => f(*ptr),
            Instruction::Store { val, ptr, .. } => {
                visit_op(val, &mut f);
                f(*ptr);
            }
            Instruction::BinOp { lhs, rhs, .. } | Instruction::Cmp { lhs, rhs, .. } => {
                visit_op(lhs, &mut f);
                visit_op(rhs, &mut f);
            }
            Instruction::UnaryOp { src, .. }
            | Instruction::Cast { src, .. }
            | Instruction::Copy { src, .. } => visit_op(src, &mut f),
            Instruction::Call { info, .. } => {
                for arg in &info.args {
                    visit_op(arg, &mut f);
                }
            }
            Instruction::CallIndirect { func_ptr, info } => {
                visit_op(func_ptr, &mut f);
                for arg in &info.args {
                    visit_op(arg, &mut f);
                }
            }
            Instruction::GetElementPtr { base, offset, .. } => {
                f(*base);
                visit_op(offset, &mut f);
            }
            Instruction::Memcpy { dest, src, .. } => {
                f(*dest);
                f(*src);
            }
            Instruction::Phi { incoming, .. } => {
                for (op, _) in incoming {
                    visit_op(op, &mut f);
                }
            }
            Instruction::Select { cond, true_val, false_val, .. } => {
                visit_op(cond, &mut f);
                visit_op(true_val, &mut f);
                visit_op(false_val, &mut f);
            }
            Instruction::ExtractValue { agg, .. } => f(*agg),
            Instruction::InsertValue { agg, val, .. } => {
                f(*agg);
                visit_op(val, &mut f);
            }
            Instruction::AtomicRmw { ptr, val, .. } => {
                visit_op(ptr, &mut f);
                visit_op(val, &mut f);
            }
            Instruction::AtomicCmpxchg { ptr, expected, desired, .. } => {
                visit_op(ptr, &mut f);
                visit_op(expected, &mut f);
                visit_op(desired, &mut f);
            }
            Instruction::AtomicLoad { ptr, .. } => visit_op(ptr, &mut f),
            Instruction::AtomicStore { ptr, val, .. } => {
                visit_op(ptr, &mut f);
                visit_op(val, &mut f);
            }
        }
    }

    /// Mutable visitor over every Value operand slot (excluding the dest).
    /// Used for rewiring operands to their duplicates.
    pub fn for_each_used_value_mut(&mut self, mut f: impl FnMut(&mut Value)) {
        #[inline(always)]
        fn visit_op(op: &mut Operand, f: &mut impl FnMut(&mut Value)) {
            if let Operand::Value(v) = op {
                f(v);
            }
        }
        match self {
            Instruction::Alloca { .. }
            | Instruction::GlobalAddr { .. }
            | Instruction::Fence { .. }
            | Instruction::ParamRef { .. } => {}
            Instruction::Load { ptr, .. } => f(ptr),
            Instruction::Store { val, ptr, .. } => {
                visit_op(val, &mut f);
                f(ptr);
            }
            Instruction::BinOp { lhs, rhs, .. } | Instruction::Cmp { lhs, rhs, .. } => {
                visit_op(lhs, &mut f);
                visit_op(rhs, &mut f);
            }
            Instruction::UnaryOp { src, .. }
            | Instruction::Cast { src, .. }
            | Instruction::Copy { src, .. } => visit_op(src, &mut f),
            Instruction::Call { info, .. } => {
                for arg in &mut info.args {
                    visit_op(arg, &mut f);
                }
            }
            Instruction::CallIndirect { func_ptr, info } => {
                visit_op(func_ptr, &mut f);
                for arg in &mut info.args {
                    visit_op(arg, &mut f);
                }
            }
            Instruction::GetElementPtr { base, offset, .. } => {
                f(base);
                visit_op(offset, &mut f);
            }
            Instruction::Memcpy { dest, src, .. } => {
                f(dest);
                f(src);
            }
            Instruction::Phi { incoming, .. } => {
                for (op, _) in incoming {
                    visit_op(op, &mut f);
                }
            }
            Instruction::Select { cond, true_val, false_val, .. } => {
                visit_op(cond, &mut f);
                visit_op(true_val, &mut f);
                visit_op(false_val, &mut f);
            }
            Instruction::ExtractValue { agg, .. } => f(agg),
            Instruction::InsertValue { agg, val, .. } => {
                f(agg);
                visit_op(val, &mut f);
            }
            Instruction::AtomicRmw { ptr, val, .. } => {
                visit_op(ptr, &mut f);
                visit_op(val, &mut f);
            }
            Instruction::AtomicCmpxchg { ptr, expected, desired, .. } => {
                visit_op(ptr, &mut f);
                visit_op(expected, &mut f);
                visit_op(desired, &mut f);
            }
            Instruction::AtomicLoad { ptr, .. } => visit_op(ptr, &mut f),
            Instruction::AtomicStore { ptr, val, .. } => {
                visit_op(ptr, &mut f);
                visit_op(val, &mut f);
            }
        }
    }

    /// Collect all Values used (as operands, not defined) by this instruction.
    pub fn used_values(&self) -> Vec<Value> {
        let mut used = Vec::new();
        self.for_each_used_value(|v| used.push(v));
        used
    }
}

impl Terminator {
    /// Value defined by this terminator, if any (invoke results).
    pub fn dest(&self) -> Option<Value> {
        match self {
            Terminator::Invoke { info, .. } => info.dest,
            _ => None,
        }
    }

    /// Call `f(value)` for every Value used as an operand in this terminator.
    #[inline]
    pub fn for_each_used_value(&self, mut f: impl FnMut(Value)) {
        match self {
            Terminator::Return(Some(Operand::Value(v)))
            | Terminator::CondBranch { cond: Operand::Value(v), .. }
            | Terminator::IndirectBranch { target: Operand::Value(v), .. }
            | Terminator::Switch { val: Operand::Value(v), .. } => f(*v),
            Terminator::Invoke { callee, info, .. } => {
                if let InvokeCallee::Indirect(Operand::Value(v)) = callee {
                    f(*v);
                }
                for arg in &info.args {
                    if let Operand::Value(v) = arg {
                        f(*v);
                    }
                }
            }
            _ => {}
        }
    }

    /// Mutable visitor over every Value operand slot.
    pub fn for_each_used_value_mut(&mut self, mut f: impl FnMut(&mut Value)) {
        match self {
            Terminator::Return(Some(Operand::Value(v)))
            | Terminator::CondBranch { cond: Operand::Value(v), .. }
            | Terminator::IndirectBranch { target: Operand::Value(v), .. }
            | Terminator::Switch { val: Operand::Value(v), .. } => f(v),
            Terminator::Invoke { callee, info, .. } => {
                if let InvokeCallee::Indirect(Operand::Value(v)) = callee {
                    f(v);
                }
                for arg in &mut info.args {
                    if let Operand::Value(v) = arg {
                        f(v);
                    }
                }
            }
            _ => {}
        }
    }

    /// Mutable visitor over every block target of this terminator.
    pub fn for_each_target_mut(&mut self, mut f: impl FnMut(&mut BlockId)) {
        match self {
            Terminator::Return(_) | Terminator::Unreachable => {}
            Terminator::Branch(t) => f(t),
            Terminator::CondBranch { true_label, false_label, .. } => {
                f(true_label);
                f(false_label);
            }
            Terminator::Switch { cases, default, .. } => {
                f(default);
                for (_, t) in cases {
                    f(t);
                }
            }
            Terminator::IndirectBranch { possible_targets, .. } => {
                for t in possible_targets {
                    f(t);
                }
            }
            Terminator::Invoke { normal, unwind, .. } => {
                f(normal);
                f(unwind);
            }
        }
    }

    /// Successor blocks of this terminator.
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            Terminator::Return(_) | Terminator::Unreachable => Vec::new(),
            Terminator::Branch(t) => vec![*t],
            Terminator::CondBranch { true_label, false_label, .. } => {
                vec![*true_label, *false_label]
            }
            Terminator::Switch { cases, default, .. } => {
                let mut succs = vec![*default];
                succs.extend(cases.iter().map(|(_, t)| *t));
                succs
            }
            Terminator::IndirectBranch { possible_targets, .. } => possible_targets.clone(),
            Terminator::Invoke { normal, unwind, .. } => vec![*normal, *unwind],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_visits_both_operands() {
        let inst = Instruction::Store {
            val: Operand::Value(Value(1)),
            ptr: Value(2),
            ty: IrType::I32,
        };
        assert_eq!(inst.used_values(), vec![Value(1), Value(2)]);
        assert_eq!(inst.dest(), None);
    }

    #[test]
    fn rewrite_operands_leaves_dest_alone() {
        let mut inst = Instruction::BinOp {
            dest: Value(5),
            op: IrBinOp::Add,
            lhs: Operand::Value(Value(1)),
            rhs: Operand::Const(IrConst::I32(1)),
            ty: IrType::I32,
        };
        inst.for_each_used_value_mut(|v| *v = Value(v.0 + 100));
        assert_eq!(inst.dest(), Some(Value(5)));
        assert_eq!(inst.used_values(), vec![Value(101)]);
    }

    #[test]
    fn invoke_targets() {
        let t = Terminator::Invoke {
            callee: InvokeCallee::Direct("f".into()),
            info: CallInfo::new(None, vec![], vec![], IrType::Void),
            normal: BlockId(1),
            unwind: BlockId(2),
        };
        assert_eq!(t.successors(), vec![BlockId(1), BlockId(2)]);
    }
}
