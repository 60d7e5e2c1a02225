//! Instruction duplication (C5) and the duplicate map.
//!
//! For every hardened function a `_dup` variant with a doubled parameter
//! list is created first (so recursive and mutually-recursive calls can be
//! redirected by name), then each body is duplicated in two phases:
//!
//! - phase A walks the body once, decides per instruction how it duplicates
//!   (see `Action`), and assigns the clone's SSA id, entering the pair into
//!   the duplicate map. Having the complete map before any code moves means
//!   operand rewiring never has to recurse.
//! - phase B rebuilds each block, emitting clones next to their originals
//!   with operands rewired through the map, and applying the call rewrites.
//!
//! A store whose clone would be identical to the original (no operand has a
//! duplicate) is not emitted; for read-modify-write clones the stale pair is
//! removed from the map in the same pass.

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, trace};

use crate::common::config::HardeningConfig;
use crate::common::types::{IrType, Span};
use crate::ir::instruction::{
    BasicBlock, BlockId, Instruction, InvokeCallee, Operand, ParamAttr, Terminator, Value,
};
use crate::ir::module::{Module, Param};

use super::calls::{self, CallAction};
use super::closure::ProtectionSets;
use super::ret_to_ref::RetVariant;
use super::Cx;

/// Runtime function whose result lands in an exception-handling slot; the
/// alloca holding it must not be duplicated.
const CXA_BEGIN_CATCH: &str = "__cxa_begin_catch";

/// The symmetric value-pair relation: `(v, v')` and `(v', v)` are always
/// inserted and removed together. One map per function body.
#[derive(Debug, Default)]
pub struct DupMap {
    map: FxHashMap<Value, Value>,
}

impl DupMap {
    pub fn insert_pair(&mut self, a: Value, b: Value) {
        self.map.insert(a, b);
        self.map.insert(b, a);
    }

    pub fn get(&self, v: Value) -> Option<Value> {
        self.map.get(&v).copied()
    }

    pub fn contains(&self, v: Value) -> bool {
        self.map.contains_key(&v)
    }

    pub fn remove_pair(&mut self, v: Value) {
        if let Some(d) = self.map.remove(&v) {
            self.map.remove(&d);
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Every entry has its mirror.
    pub fn is_symmetric(&self) -> bool {
        self.map.iter().all(|(a, b)| self.map.get(b) == Some(a))
    }
}

/// The symmetric name-pair relation for module-level symbols: duplicated
/// globals and the `_dup` function variants.
#[derive(Debug, Default)]
pub struct NameDups {
    map: FxHashMap<String, String>,
}

impl NameDups {
    pub fn insert_pair(&mut self, a: &str, b: &str) {
        self.map.insert(a.to_string(), b.to_string());
        self.map.insert(b.to_string(), a.to_string());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.map.get(name).map(|s| s.as_str())
    }

    pub fn is_symmetric(&self) -> bool {
        self.map.iter().all(|(a, b)| self.map.get(b) == Some(a))
    }
}

/// Slot arithmetic for a doubled parameter list. Data parameters occupy
/// either interleaved slots (orig at 2i, duplicate at 2i+1) or segregated
/// halves (originals first); the two return out-pointers of a rewritten
/// non-void function trail the doubled data parameters and are not doubled
/// themselves (they already are a pair).
#[derive(Debug, Clone, Copy)]
pub struct ParamLayout {
    pub n_data: usize,
    pub has_ret_slots: bool,
    pub alternate: bool,
}

impl ParamLayout {
    pub fn primary(&self, i: usize) -> usize {
        if self.alternate { 2 * i } else { i }
    }

    pub fn dup(&self, i: usize) -> usize {
        if self.alternate { 2 * i + 1 } else { self.n_data + i }
    }

    /// Inverse of `primary`.
    pub fn data_index(&self, primary_slot: usize) -> usize {
        if self.alternate { primary_slot / 2 } else { primary_slot }
    }

    pub fn ret_primary(&self) -> usize {
        2 * self.n_data
    }

    pub fn ret_dup(&self) -> usize {
        2 * self.n_data + 1
    }

    pub fn total(&self) -> usize {
        2 * self.n_data + if self.has_ret_slots { 2 } else { 0 }
    }

    pub fn is_ret_slot(&self, idx: usize) -> bool {
        self.has_ret_slots && idx >= 2 * self.n_data
    }
}

/// Fresh SSA ids handed out while a function is being rebuilt. Kept outside
/// the function so phase A can allocate while the body is borrowed.
pub struct ValueAlloc {
    next: u32,
}

impl ValueAlloc {
    pub fn new(f: &crate::ir::module::Function) -> Self {
        Self { next: f.max_value_id() + 1 }
    }

    #[cfg(test)]
    pub fn starting_at(next: u32) -> Self {
        Self { next }
    }

    pub fn fresh(&mut self) -> Value {
        let v = Value(self.next);
        self.next += 1;
        v
    }

    pub fn finish(self) -> u32 {
        self.next
    }
}

/// How one instruction participates in the duplication.
enum Action {
    /// Not duplicated: terminatorless shared resources (fences), allocas for
    /// exception slots, address materialization of unduplicated symbols,
    /// the ret-slot parameter references.
    Keep,
    /// Pure computation: clone right after the original.
    Clone,
    /// Alloca under segregated placement: clone joins the block's alloca
    /// prefix instead of sitting next to the original.
    CloneAllocaPrefix,
    /// Store-class: clone only if an operand actually rewires.
    StoreClone,
    /// Read-modify-write: clone unless elided (pair already dropped).
    RmwClone,
    /// Memory intrinsic instruction: clone with rewired operands.
    MemcpyClone,
    /// Store through the primary return out-pointer: kept as is.
    RetPrimaryStore,
    /// Store through the duplicate return out-pointer: value operand is
    /// rerouted onto the duplicated stream instead of cloning.
    RetDupStore,
    Call(CallAction),
}

/// How the block terminator participates (invokes are calls in terminator
/// position).
enum TermAction {
    Keep,
    /// `to_duplicate` invoke: a plain duplicated call precedes the invoke.
    DuplicateBefore,
    Redirect(calls::CallPlan),
    IndirectDouble,
    Refresh,
}

/// Create the `_dup` signature (doubled parameters, cloned body) for every
/// hardened defined function, before any body is rewritten. Returns the
/// per-variant layouts and the list of created variants.
pub fn create_dup_signatures(
    module: &mut Module,
    protection: &ProtectionSets,
    ret_variants: &FxHashMap<String, RetVariant>,
    config: &HardeningConfig,
    dups: &mut NameDups,
) -> (FxHashMap<String, ParamLayout>, Vec<String>) {
    let mut layouts = FxHashMap::default();
    let mut created = Vec::new();

    let original_count = module.functions.len();
    for idx in 0..original_count {
        let name = module.functions[idx].name.clone();
        if !protection.harden_fns.contains(&name) || module.functions[idx].is_declaration {
            continue;
        }

        let source_name = ret_variants
            .get(&name)
            .map(|rv| rv.ret_name.clone())
            .unwrap_or_else(|| name.clone());
        let Some(source) = module.function(&source_name) else { continue };

        let has_ret_slots = ret_variants.contains_key(&name);
        let n_data = source.params.len() - if has_ret_slots { 2 } else { 0 };
        let layout = ParamLayout { n_data, has_ret_slots, alternate: config.alternate_memmap };

        let mut params: Vec<Option<Param>> = vec![None; layout.total()];
        for i in 0..n_data {
            let mut p = source.params[i].clone();
            p.attrs.retain(|a| *a != ParamAttr::StructRet);
            let mut pd = p.clone();
            pd.name = format!("{}_dup", p.name);
            params[layout.primary(i)] = Some(p);
            params[layout.dup(i)] = Some(pd);
        }
        if has_ret_slots {
            params[layout.ret_primary()] = Some(source.params[n_data].clone());
            params[layout.ret_dup()] = Some(source.params[n_data + 1].clone());
        }

        let mut blocks = source.blocks.clone();
        for block in &mut blocks {
            for inst in &mut block.instructions {
                if let Instruction::ParamRef { param_idx, .. } = inst {
                    *param_idx = if *param_idx < n_data {
                        layout.primary(*param_idx)
                    } else if *param_idx == n_data {
                        layout.ret_primary()
                    } else {
                        layout.ret_dup()
                    };
                }
            }
        }

        let dup_name = format!("{source_name}_dup");
        debug!(function = %name, dup = %dup_name, "created duplicated signature");
        let mut dup_fn = crate::ir::module::Function::new(
            dup_name.clone(),
            source.return_type,
            params.into_iter().map(|p| p.expect("every slot filled")).collect(),
        );
        dup_fn.blocks = blocks;
        dup_fn.linkage = source.linkage;
        dup_fn.section = source.section.clone();
        dup_fn.is_variadic = source.is_variadic;
        dup_fn.next_value_id = source.next_value_id;
        module.functions.push(dup_fn);

        dups.insert_pair(&name, &dup_name);
        layouts.insert(dup_name.clone(), layout);
        created.push(dup_name);
    }

    (layouts, created)
}

/// Duplicate the body of one `_dup` function. Returns the function's value
/// pair map and the positions of check-exempt stores/calls (clones and
/// refresh code must not become synchronization points themselves).
pub fn harden_function(
    f: &mut crate::ir::module::Function,
    layout: ParamLayout,
    cx: &Cx,
) -> (DupMap, Vec<(BlockId, usize)>) {
    let mut alloc = ValueAlloc::new(f);
    let mut dups = DupMap::default();

    // Defining instruction per value, for pointee resolution and the
    // exception-slot scan.
    let mut def_insts: FxHashMap<Value, Instruction> = FxHashMap::default();
    for block in &f.blocks {
        for inst in &block.instructions {
            if let Some(d) = inst.dest() {
                def_insts.insert(d, inst.clone());
            }
        }
    }

    let eh_allocas = find_eh_allocas(f);

    // Phase A: classify everything and assign clone ids.
    let mut actions: Vec<Vec<Action>> = Vec::with_capacity(f.blocks.len());
    let mut term_actions: Vec<TermAction> = Vec::with_capacity(f.blocks.len());
    for block in &f.blocks {
        let mut block_actions = Vec::with_capacity(block.instructions.len());
        for inst in &block.instructions {
            block_actions.push(classify(inst, layout, &eh_allocas, &def_insts, cx, &mut alloc, &mut dups));
        }
        actions.push(block_actions);
        term_actions.push(classify_terminator(&block.terminator, cx, &mut alloc, &mut dups));
    }

    // Trivial-duplication elision: a read-modify-write whose operands have no
    // duplicates would clone identically; drop the clone and its pair
    // together before anything rewires against it.
    for (bi, block) in f.blocks.iter().enumerate() {
        for (ii, inst) in block.instructions.iter().enumerate() {
            if !matches!(actions[bi][ii], Action::RmwClone) {
                continue;
            }
            let changed = inst.used_values().iter().any(|v| dups.contains(*v));
            if !changed {
                if let Some(dest) = inst.dest() {
                    trace!(?dest, "elided trivial read-modify-write clone");
                    dups.remove_pair(dest);
                }
                actions[bi][ii] = Action::Keep;
            }
        }
    }

    // Phase B: rebuild every block.
    let pointee = |v: Value| pointee_type(&def_insts, cx, v);
    let mut new_blocks: Vec<(BasicBlock, Vec<bool>)> = Vec::with_capacity(f.blocks.len());
    let mut entry_allocas: Vec<Instruction> = Vec::new();
    let mut prepends: Vec<(BlockId, Vec<Instruction>, bool)> = Vec::new();

    for (bi, block) in f.blocks.iter().enumerate() {
        let tracked = !block.source_spans.is_empty();
        // (instruction, span, check-exempt)
        let mut items: Vec<(Instruction, Span, bool)> = Vec::new();
        let mut prefix: Vec<(Instruction, Span, bool)> = Vec::new();

        for (ii, inst) in block.instructions.iter().enumerate() {
            let span = block.span_of(ii).unwrap_or_default();
            let clone_span = if cx.config.debug_info { span } else { Span::default() };
            match &actions[bi][ii] {
                Action::Keep => items.push((inst.clone(), span, false)),
                Action::Clone => {
                    items.push((inst.clone(), span, false));
                    items.push((build_clone(inst, &dups, cx, layout), clone_span, true));
                }
                Action::CloneAllocaPrefix => {
                    items.push((inst.clone(), span, false));
                    prefix.push((build_clone(inst, &dups, cx, layout), clone_span, true));
                }
                Action::StoreClone => {
                    items.push((inst.clone(), span, false));
                    let mut clone = inst.clone();
                    let mut changed = false;
                    clone.for_each_used_value_mut(|v| {
                        if let Some(d) = dups.get(*v) {
                            *v = d;
                            changed = true;
                        }
                    });
                    if changed {
                        items.push((clone, clone_span, true));
                    }
                }
                Action::RmwClone | Action::MemcpyClone => {
                    items.push((inst.clone(), span, false));
                    items.push((build_clone(inst, &dups, cx, layout), clone_span, true));
                }
                Action::RetPrimaryStore => items.push((inst.clone(), span, false)),
                Action::RetDupStore => {
                    let mut rerouted = inst.clone();
                    if let Instruction::Store { val: Operand::Value(v), .. } = &mut rerouted {
                        if let Some(d) = dups.get(*v) {
                            *v = d;
                        }
                    }
                    items.push((rerouted, span, false));
                }
                Action::Call(action) => {
                    let Instruction::Call { func: _, info } = inst else {
                        // CallIndirect carries its action through the same arm.
                        emit_indirect(inst, &dups, &mut items, span, layout);
                        continue;
                    };
                    match action {
                        CallAction::Duplicate => {
                            items.push((inst.clone(), span, false));
                            items.push((build_clone(inst, &dups, cx, layout), clone_span, true));
                        }
                        CallAction::Redirect(plan) => {
                            let (doubled, loads, slots) = calls::redirect_call_info(info, plan, &dups);
                            entry_allocas.extend(slots);
                            items.push((
                                Instruction::Call { func: plan.dup_name.clone(), info: doubled },
                                span,
                                false,
                            ));
                            for load in loads {
                                items.push((load, clone_span, false));
                            }
                        }
                        CallAction::IndirectDouble => {
                            emit_indirect(inst, &dups, &mut items, span, layout);
                        }
                        CallAction::Refresh => {
                            items.push((inst.clone(), span, false));
                            for refresh in calls::refresh_sequence(info, &dups, pointee, &mut alloc) {
                                items.push((refresh, clone_span, true));
                            }
                        }
                    }
                }
            }
        }

        // Alloca clones join the end of the leading phi/alloca run.
        if !prefix.is_empty() {
            let pos = items
                .iter()
                .position(|(i, _, _)| !matches!(i, Instruction::Phi { .. } | Instruction::Alloca { .. }))
                .unwrap_or(items.len());
            items.splice(pos..pos, prefix);
        }

        // Terminator rewrite.
        let mut terminator = block.terminator.clone();
        match &term_actions[bi] {
            TermAction::Keep => {}
            TermAction::DuplicateBefore => {
                if let Terminator::Invoke { callee, info, .. } = &block.terminator {
                    let mut clone_info = info.clone();
                    if let Some(dest) = clone_info.dest {
                        clone_info.dest = dups.get(dest);
                    }
                    for arg in &mut clone_info.args {
                        if let Operand::Value(v) = arg {
                            if let Some(d) = dups.get(*v) {
                                *v = d;
                            }
                        }
                    }
                    let call = match callee {
                        InvokeCallee::Direct(name) => {
                            Instruction::Call { func: name.clone(), info: clone_info }
                        }
                        InvokeCallee::Indirect(ptr) => {
                            Instruction::CallIndirect { func_ptr: *ptr, info: clone_info }
                        }
                    };
                    items.push((call, Span::default(), true));
                }
            }
            TermAction::Redirect(plan) => {
                if let Terminator::Invoke { info, normal, unwind, .. } = &block.terminator {
                    let (doubled, loads, slots) = calls::redirect_call_info(info, plan, &dups);
                    entry_allocas.extend(slots);
                    terminator = Terminator::Invoke {
                        callee: InvokeCallee::Direct(plan.dup_name.clone()),
                        info: doubled,
                        normal: *normal,
                        unwind: *unwind,
                    };
                    if !loads.is_empty() {
                        prepends.push((*normal, loads, false));
                    }
                }
            }
            TermAction::IndirectDouble => {
                if let Terminator::Invoke { callee, info, normal, unwind } = &block.terminator {
                    let doubled = calls::double_args(
                        info,
                        ParamLayout {
                            n_data: info.args.len(),
                            has_ret_slots: false,
                            alternate: cx.config.alternate_memmap,
                        },
                        &dups,
                    );
                    terminator = Terminator::Invoke {
                        callee: callee.clone(),
                        info: doubled,
                        normal: *normal,
                        unwind: *unwind,
                    };
                }
            }
            TermAction::Refresh => {
                if let Terminator::Invoke { info, normal, .. } = &block.terminator {
                    let seq = calls::refresh_sequence(info, &dups, pointee, &mut alloc);
                    if !seq.is_empty() {
                        prepends.push((*normal, seq, true));
                    }
                }
            }
        }

        let mut rebuilt = BasicBlock::new(block.label, Vec::new(), terminator);
        let mut flags = Vec::with_capacity(items.len());
        for (inst, span, exempt) in items {
            rebuilt.instructions.push(inst);
            if tracked {
                rebuilt.source_spans.push(span);
            }
            flags.push(exempt);
        }
        new_blocks.push((rebuilt, flags));
    }

    // Return-slot allocas are hoisted into the entry block's alloca prefix.
    if !entry_allocas.is_empty() {
        let (entry, flags) = &mut new_blocks[0];
        let pos = entry
            .instructions
            .iter()
            .position(|i| !matches!(i, Instruction::Phi { .. } | Instruction::Alloca { .. }))
            .unwrap_or(entry.instructions.len());
        let n = entry_allocas.len();
        let tracked = !entry.source_spans.is_empty();
        entry.instructions.splice(pos..pos, entry_allocas);
        if tracked {
            entry.source_spans.splice(pos..pos, std::iter::repeat(Span::default()).take(n));
        }
        flags.splice(pos..pos, std::iter::repeat(false).take(n));
    }

    // Loads and refreshes for invoked callees land at the top of the normal
    // destination, after any phis.
    for (label, seq, exempt) in prepends {
        let Some((block, flags)) = new_blocks.iter_mut().find(|(b, _)| b.label == label) else {
            continue;
        };
        let pos = block
            .instructions
            .iter()
            .position(|i| !matches!(i, Instruction::Phi { .. }))
            .unwrap_or(block.instructions.len());
        let n = seq.len();
        let tracked = !block.source_spans.is_empty();
        block.instructions.splice(pos..pos, seq);
        if tracked {
            block.source_spans.splice(pos..pos, std::iter::repeat(Span::default()).take(n));
        }
        flags.splice(pos..pos, std::iter::repeat(exempt).take(n));
    }

    let mut exempt = Vec::new();
    let mut blocks = Vec::with_capacity(new_blocks.len());
    for (block, flags) in new_blocks {
        for (idx, is_exempt) in flags.iter().enumerate() {
            if *is_exempt {
                exempt.push((block.label, idx));
            }
        }
        blocks.push(block);
    }
    f.blocks = blocks;
    f.next_value_id = alloc.finish();

    (dups, exempt)
}

/// Allocas that hold `__cxa_begin_catch` results are exception bookkeeping,
/// not program data, and stay outside the sphere of replication.
fn find_eh_allocas(f: &crate::ir::module::Function) -> FxHashSet<Value> {
    let mut catch_results: FxHashSet<Value> = FxHashSet::default();
    for block in &f.blocks {
        for inst in &block.instructions {
            if let Instruction::Call { func, info } = inst {
                if func == CXA_BEGIN_CATCH {
                    if let Some(dest) = info.dest {
                        catch_results.insert(dest);
                    }
                }
            }
        }
    }
    let mut eh_allocas = FxHashSet::default();
    if catch_results.is_empty() {
        return eh_allocas;
    }
    for block in &f.blocks {
        for inst in &block.instructions {
            if let Instruction::Store { val: Operand::Value(v), ptr, .. } = inst {
                if catch_results.contains(v) {
                    eh_allocas.insert(*ptr);
                }
            }
        }
    }
    eh_allocas
}

fn classify(
    inst: &Instruction,
    layout: ParamLayout,
    eh_allocas: &FxHashSet<Value>,
    def_insts: &FxHashMap<Value, Instruction>,
    cx: &Cx,
    alloc: &mut ValueAlloc,
    dups: &mut DupMap,
) -> Action {
    let pair = |dest: Value, alloc: &mut ValueAlloc, dups: &mut DupMap| {
        dups.insert_pair(dest, alloc.fresh());
    };
    match inst {
        Instruction::Alloca { dest, .. } => {
            if eh_allocas.contains(dest) {
                return Action::Keep;
            }
            pair(*dest, alloc, dups);
            if cx.config.alternate_memmap {
                Action::Clone
            } else {
                Action::CloneAllocaPrefix
            }
        }
        Instruction::GlobalAddr { dest, name } => {
            // An address of a symbol without a duplicate has no second
            // stream to point at.
            if cx.name_dups.get(name).is_some() {
                pair(*dest, alloc, dups);
                Action::Clone
            } else {
                Action::Keep
            }
        }
        Instruction::ParamRef { dest, param_idx, .. } => {
            if layout.is_ret_slot(*param_idx) {
                Action::Keep
            } else {
                pair(*dest, alloc, dups);
                Action::Clone
            }
        }
        Instruction::Load { dest, .. }
        | Instruction::BinOp { dest, .. }
        | Instruction::UnaryOp { dest, .. }
        | Instruction::Cmp { dest, .. }
        | Instruction::GetElementPtr { dest, .. }
        | Instruction::Cast { dest, .. }
        | Instruction::Copy { dest, .. }
        | Instruction::Phi { dest, .. }
        | Instruction::Select { dest, .. }
        | Instruction::ExtractValue { dest, .. }
        | Instruction::InsertValue { dest, .. }
        | Instruction::AtomicLoad { dest, .. } => {
            pair(*dest, alloc, dups);
            Action::Clone
        }
        Instruction::Store { ptr, .. } => {
            if let Some(Instruction::ParamRef { param_idx, .. }) = def_insts.get(ptr) {
                if layout.has_ret_slots {
                    if *param_idx == layout.ret_primary() {
                        return Action::RetPrimaryStore;
                    }
                    if *param_idx == layout.ret_dup() {
                        return Action::RetDupStore;
                    }
                }
            }
            Action::StoreClone
        }
        Instruction::AtomicStore { .. } => Action::StoreClone,
        Instruction::Memcpy { .. } => Action::MemcpyClone,
        Instruction::AtomicRmw { dest, .. } | Instruction::AtomicCmpxchg { dest, .. } => {
            pair(*dest, alloc, dups);
            Action::RmwClone
        }
        Instruction::Fence { .. } => Action::Keep,
        Instruction::Call { func, info } => {
            Action::Call(calls::classify_call(func, info, cx, alloc, dups))
        }
        Instruction::CallIndirect { .. } => Action::Call(CallAction::IndirectDouble),
    }
}

fn classify_terminator(
    term: &Terminator,
    cx: &Cx,
    alloc: &mut ValueAlloc,
    dups: &mut DupMap,
) -> TermAction {
    let Terminator::Invoke { callee, info, .. } = term else {
        return TermAction::Keep;
    };
    match callee {
        InvokeCallee::Indirect(_) => TermAction::IndirectDouble,
        InvokeCallee::Direct(name) => match calls::classify_call(name, info, cx, alloc, dups) {
            CallAction::Duplicate => TermAction::DuplicateBefore,
            CallAction::Redirect(plan) => TermAction::Redirect(plan),
            CallAction::IndirectDouble => TermAction::IndirectDouble,
            CallAction::Refresh => TermAction::Refresh,
        },
    }
}

/// Clone `inst` onto the duplicated stream: fresh destination from the pair
/// map, every operand rewired to its duplicate where one exists, global
/// addresses retargeted to the `_dup` symbol, parameter references moved to
/// the duplicate slot. Phi incoming blocks keep their original predecessor
/// identity.
fn build_clone(inst: &Instruction, dups: &DupMap, cx: &Cx, layout: ParamLayout) -> Instruction {
    let mut clone = inst.clone();
    if let Some(dest) = inst.dest() {
        if let Some(dup_dest) = dups.get(dest) {
            set_dest(&mut clone, dup_dest);
        }
    }
    clone.for_each_used_value_mut(|v| {
        if let Some(d) = dups.get(*v) {
            *v = d;
        }
    });
    match &mut clone {
        Instruction::GlobalAddr { name, .. } => {
            if let Some(dup) = cx.name_dups.get(name) {
                *name = dup.to_string();
            }
        }
        Instruction::ParamRef { param_idx, .. } => {
            let i = layout.data_index(*param_idx);
            *param_idx = layout.dup(i);
        }
        _ => {}
    }
    clone
}

fn emit_indirect(
    inst: &Instruction,
    dups: &DupMap,
    items: &mut Vec<(Instruction, Span, bool)>,
    span: Span,
    layout: ParamLayout,
) {
    if let Instruction::CallIndirect { func_ptr, info } = inst {
        let doubled = calls::double_args(
            info,
            ParamLayout { n_data: info.args.len(), has_ret_slots: false, alternate: layout.alternate },
            dups,
        );
        items.push((
            Instruction::CallIndirect { func_ptr: *func_ptr, info: doubled },
            span,
            false,
        ));
    } else {
        items.push((inst.clone(), span, false));
    }
}

/// Replace the destination slot of an instruction.
fn set_dest(inst: &mut Instruction, new_dest: Value) {
    match inst {
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
        | Instruction::ParamRef { dest, .. } => *dest = new_dest,
        Instruction::Call { info, .. } | Instruction::CallIndirect { info, .. } => {
            info.dest = Some(new_dest);
        }
        Instruction::Store { .. }
        | Instruction::Memcpy { .. }
        | Instruction::AtomicStore { .. }
        | Instruction::Fence { .. } => {}
    }
}

/// Resolve the element type behind a pointer value by following its
/// defining instruction. Used to type the refresh loads after external
/// calls and the pointer comparisons in the check inserter.
pub(crate) fn pointee_type(
    def_insts: &FxHashMap<Value, Instruction>,
    cx: &Cx,
    v: Value,
) -> Option<IrType> {
    let mut cur = v;
    for _ in 0..16 {
        match def_insts.get(&cur) {
            Some(Instruction::Alloca { ty, .. }) => return Some(*ty),
            Some(Instruction::GetElementPtr { ty, .. }) => return Some(*ty),
            Some(Instruction::GlobalAddr { name, .. }) => {
                return cx.global_types.get(name).copied();
            }
            Some(Instruction::Copy { src: Operand::Value(s), .. }) => cur = *s,
            Some(Instruction::Cast { src: Operand::Value(s), .. }) => cur = *s,
            _ => return None,
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dup_map_is_cyclic() {
        let mut d = DupMap::default();
        d.insert_pair(Value(1), Value(2));
        assert_eq!(d.get(Value(1)), Some(Value(2)));
        assert_eq!(d.get(Value(2)), Some(Value(1)));
        assert!(d.is_symmetric());
        d.remove_pair(Value(2));
        assert!(d.is_empty());
    }

    #[test]
    fn name_dups_is_cyclic() {
        let mut d = NameDups::default();
        d.insert_pair("g", "g_dup");
        assert_eq!(d.get("g"), Some("g_dup"));
        assert_eq!(d.get("g_dup"), Some("g"));
        assert!(d.is_symmetric());
    }

    #[test]
    fn segregated_layout_slots() {
        let l = ParamLayout { n_data: 3, has_ret_slots: true, alternate: false };
        assert_eq!(l.primary(1), 1);
        assert_eq!(l.dup(1), 4);
        assert_eq!(l.ret_primary(), 6);
        assert_eq!(l.ret_dup(), 7);
        assert_eq!(l.total(), 8);
        assert!(l.is_ret_slot(6) && l.is_ret_slot(7));
        assert!(!l.is_ret_slot(5));
    }

    #[test]
    fn interleaved_layout_slots() {
        let l = ParamLayout { n_data: 2, has_ret_slots: false, alternate: true };
        assert_eq!(l.primary(0), 0);
        assert_eq!(l.dup(0), 1);
        assert_eq!(l.primary(1), 2);
        assert_eq!(l.dup(1), 3);
        assert_eq!(l.data_index(2), 1);
        assert_eq!(l.total(), 4);
    }
}
