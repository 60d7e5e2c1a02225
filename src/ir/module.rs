//! IR module, function, and global variable definitions.
//!
//! `Module` is the top-level unit: the whole linked program, containing
//! globals and functions. `Function` is a graph of basic blocks. `Global`
//! carries storage attributes and an initializer.

use crate::common::types::IrType;
use super::constants::IrConst;
use super::instruction::{BasicBlock, BlockId, ParamAttr, Terminator, Value};

/// Reserved name of the global constructor array.
pub const GLOBAL_CTORS: &str = "llvm.global_ctors";
/// Reserved name of the annotation array produced by the front-end.
pub const GLOBAL_ANNOTATIONS: &str = "llvm.global.annotations";
/// Section marking metadata-only globals.
pub const METADATA_SECTION: &str = "llvm.metadata";

/// Symbol linkage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Linkage {
    Private,
    Internal,
    External,
    Weak,
    /// Arrays merged across translation units (ctor lists, annotations).
    Appending,
}

/// A global variable.
#[derive(Debug, Clone)]
pub struct Global {
    pub name: String,
    pub ty: IrType,
    /// Alignment in bytes (0 means the type's natural alignment).
    pub align: usize,
    pub linkage: Linkage,
    pub section: Option<String>,
    pub init: GlobalInit,
    pub is_constant: bool,
    pub is_volatile: bool,
    pub dso_local: bool,
    pub is_thread_local: bool,
    pub address_space: u32,
    pub is_externally_initialized: bool,
}

impl Global {
    /// A plain internal global with an initializer; attributes default off.
    pub fn new(name: impl Into<String>, ty: IrType, init: GlobalInit) -> Self {
        Self {
            name: name.into(),
            ty,
            align: 0,
            linkage: Linkage::Internal,
            section: None,
            init,
            is_constant: false,
            is_volatile: false,
            dso_local: false,
            is_thread_local: false,
            address_space: 0,
            is_externally_initialized: false,
        }
    }

    pub fn has_reserved_name(&self) -> bool {
        self.name.starts_with("llvm.")
    }
}

/// Initializer for a global variable.
#[derive(Debug, Clone, PartialEq)]
pub enum GlobalInit {
    /// No initializer (zero-initialized storage).
    Zero,
    /// Single scalar constant.
    Scalar(IrConst),
    /// Array of scalar constants.
    Array(Vec<IrConst>),
    /// String literal bytes.
    String(String),
    /// Address of another global or function.
    GlobalAddr(String),
    /// Address of a global plus a byte offset.
    GlobalAddrOffset(String, i64),
    /// Compound initializer: a struct or array of initializer elements.
    Compound(Vec<GlobalInit>),
}

impl GlobalInit {
    /// Visit every symbol name referenced by this initializer.
    pub fn for_each_ref<F: FnMut(&str)>(&self, f: &mut F) {
        match self {
            GlobalInit::GlobalAddr(name) | GlobalInit::GlobalAddrOffset(name, _) => f(name),
            GlobalInit::Compound(fields) => {
                for field in fields {
                    field.for_each_ref(f);
                }
            }
            _ => {}
        }
    }

    /// Rewrite every symbol name referenced by this initializer.
    pub fn rewrite_refs<F: FnMut(&mut String)>(&mut self, f: &mut F) {
        match self {
            GlobalInit::GlobalAddr(name) | GlobalInit::GlobalAddrOffset(name, _) => f(name),
            GlobalInit::Compound(fields) => {
                for field in fields {
                    field.rewrite_refs(f);
                }
            }
            _ => {}
        }
    }
}

/// A function parameter.
#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub ty: IrType,
    pub attrs: Vec<ParamAttr>,
}

impl Param {
    pub fn new(name: impl Into<String>, ty: IrType) -> Self {
        Self { name: name.into(), ty, attrs: Vec::new() }
    }
}

/// An IR function.
#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub return_type: IrType,
    pub params: Vec<Param>,
    pub blocks: Vec<BasicBlock>,
    /// True if the function has no body (external).
    pub is_declaration: bool,
    pub linkage: Linkage,
    pub section: Option<String>,
    pub is_variadic: bool,
    /// Cached upper bound on Value IDs: all Value IDs in this function are
    /// < next_value_id. 0 means "not yet computed" (falls back to scanning).
    pub next_value_id: u32,
}

impl Function {
    pub fn new(name: impl Into<String>, return_type: IrType, params: Vec<Param>) -> Self {
        Self {
            name: name.into(),
            return_type,
            params,
            blocks: Vec::new(),
            is_declaration: false,
            linkage: Linkage::External,
            section: None,
            is_variadic: false,
            next_value_id: 0,
        }
    }

    /// An external declaration (no body).
    pub fn declaration(name: impl Into<String>, return_type: IrType, params: Vec<Param>) -> Self {
        let mut f = Self::new(name, return_type, params);
        f.is_declaration = true;
        f
    }

    /// Return the highest Value ID defined in this function, or 0 if empty.
    /// Uses the cached `next_value_id` if available, otherwise scans.
    pub fn max_value_id(&self) -> u32 {
        if self.next_value_id > 0 {
            return self.next_value_id - 1;
        }
        let mut max_id: u32 = 0;
        for block in &self.blocks {
            for inst in &block.instructions {
                if let Some(v) = inst.dest() {
                    max_id = max_id.max(v.0);
                }
            }
            if let Some(v) = block.terminator.dest() {
                max_id = max_id.max(v.0);
            }
        }
        max_id
    }

    /// Allocate a fresh SSA value id.
    pub fn fresh_value(&mut self) -> Value {
        if self.next_value_id == 0 {
            self.next_value_id = self.max_value_id() + 1;
        }
        let v = Value(self.next_value_id);
        self.next_value_id += 1;
        v
    }

    /// Allocate a fresh block label.
    pub fn fresh_block_id(&self) -> BlockId {
        BlockId(self.blocks.iter().map(|b| b.label.0).max().map_or(0, |m| m + 1))
    }

    pub fn block_index(&self, label: BlockId) -> Option<usize> {
        self.blocks.iter().position(|b| b.label == label)
    }

    /// Retarget every terminator edge `from -> to`. PHI incoming labels are
    /// left untouched: a PHI names the block the edge originates from, and
    /// that block keeps its identity across splits.
    pub fn retarget_edges(&mut self, from: BlockId, to: BlockId) {
        for block in &mut self.blocks {
            block.terminator.for_each_target_mut(|t| {
                if *t == from {
                    *t = to;
                }
            });
        }
    }
}

/// A compilation unit: the whole linked program in IR form.
#[derive(Debug, Default)]
pub struct Module {
    pub globals: Vec<Global>,
    pub functions: Vec<Function>,
    /// String literal pool: (label, contents).
    pub string_literals: Vec<(String, String)>,
    /// Symbol aliases: (alias_name, aliasee_name).
    pub aliases: Vec<(String, String)>,
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn function_mut(&mut self, name: &str) -> Option<&mut Function> {
        self.functions.iter_mut().find(|f| f.name == name)
    }

    pub fn global(&self, name: &str) -> Option<&Global> {
        self.globals.iter().find(|g| g.name == name)
    }

    pub fn global_mut(&mut self, name: &str) -> Option<&mut Global> {
        self.globals.iter_mut().find(|g| g.name == name)
    }

    /// Look up a string literal by pool label, falling back to a global with
    /// a string initializer of that name.
    pub fn string_literal(&self, label: &str) -> Option<&str> {
        if let Some((_, s)) = self.string_literals.iter().find(|(l, _)| l == label) {
            return Some(s);
        }
        match self.global(label) {
            Some(Global { init: GlobalInit::String(s), .. }) => Some(s),
            _ => None,
        }
    }

    /// Run `f` on each defined (non-declaration) function, returning the
    /// total count of changes made.
    pub fn for_each_function<F>(&mut self, mut f: F) -> usize
    where
        F: FnMut(&mut Function) -> usize,
    {
        let mut total = 0;
        for func in &mut self.functions {
            if !func.is_declaration {
                total += f(func);
            }
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::instruction::{Instruction, Operand};

    #[test]
    fn fresh_values_do_not_collide() {
        let mut f = Function::new("f", IrType::Void, vec![]);
        f.blocks.push(BasicBlock::new(
            BlockId(0),
            vec![Instruction::Alloca { dest: Value(3), ty: IrType::I32, size: 4, align: 0, volatile: false }],
            Terminator::Return(None),
        ));
        let v = f.fresh_value();
        assert!(v.0 > 3);
        assert!(f.fresh_value().0 > v.0);
    }

    #[test]
    fn retarget_skips_phi_incoming() {
        let mut f = Function::new("f", IrType::Void, vec![]);
        f.blocks.push(BasicBlock::new(BlockId(0), vec![], Terminator::Branch(BlockId(1))));
        f.blocks.push(BasicBlock::new(
            BlockId(1),
            vec![Instruction::Phi {
                dest: Value(1),
                ty: IrType::I32,
                incoming: vec![(Operand::Value(Value(0)), BlockId(0))],
            }],
            Terminator::Return(None),
        ));
        f.retarget_edges(BlockId(1), BlockId(7));
        assert!(matches!(f.blocks[0].terminator, Terminator::Branch(BlockId(7))));
        // PHI still names its original predecessor.
        match &f.blocks[1].instructions[0] {
            Instruction::Phi { incoming, .. } => assert_eq!(incoming[0].1, BlockId(0)),
            other => panic!("unexpected instruction {other:?}"),
        }
    }
}
