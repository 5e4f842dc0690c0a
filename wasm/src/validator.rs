//! WASM module validator.
//!
//! Module-level checks (index spaces, limits, constant expressions, exports,
//! segments) plus per-function stack-effect checking. Function bodies are
//! checked against an operand-type stack and a control-frame stack; after an
//! unconditional exit the current frame turns polymorphic and pops yield
//! [`MaybeType::Unknown`] until the frame's `else`/`end`.
//!
//! Errors are collected into [`Diagnostics`] rather than returned at the
//! first failure. Within one function body checking stops at the first error
//! (later stack states would be meaningless); the remaining functions and
//! module sections are still checked.
//!
//! Reference: <https://webassembly.github.io/spec/core/appendix/algorithm.html>

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use hashbrown::HashSet;
use thiserror::Error;

use crate::module::{
    ConstExpr, DataMode, ElementItems, ElementMode, ExportKind, FunctionBody, ImportKind, Module,
};
use crate::opcodes::{Instruction, MemArg};
use crate::types::{
    BlockType, CompositeType, FuncType, GlobalType, HeapType, Limits, MaybeType,
    MemoryType, RefType, StorageType, TableType, TypeSpace, ValType,
};
use crate::Features;

/// Largest memory in 64 KiB pages (4 GiB).
pub const MAX_MEMORY_PAGES: u64 = 65536;

// ============================================================================
// Errors
// ============================================================================

/// Where a validation error was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorContext {
    Type(u32),
    Import(u32),
    Function(u32),
    Table(u32),
    Memory(u32),
    Global(u32),
    Export(u32),
    Start,
    Element(u32),
    Data(u32),
    /// Function index (full index space) and instruction index in its body.
    Code { func: u32, instr: usize },
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorContext::Type(i) => write!(f, "type {}", i),
            ErrorContext::Import(i) => write!(f, "import {}", i),
            ErrorContext::Function(i) => write!(f, "function {}", i),
            ErrorContext::Table(i) => write!(f, "table {}", i),
            ErrorContext::Memory(i) => write!(f, "memory {}", i),
            ErrorContext::Global(i) => write!(f, "global {}", i),
            ErrorContext::Export(i) => write!(f, "export {}", i),
            ErrorContext::Start => f.write_str("start function"),
            ErrorContext::Element(i) => write!(f, "element segment {}", i),
            ErrorContext::Data(i) => write!(f, "data segment {}", i),
            ErrorContext::Code { func, instr } => {
                write!(f, "function {} instruction {}", func, instr)
            }
        }
    }
}

/// A single static error.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{context}: {kind}")]
pub struct ValidationError {
    pub context: ErrorContext,
    pub kind: ValidationErrorKind,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationErrorKind {
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: MaybeType, found: MaybeType },
    #[error("type mismatch: operand stack underflow")]
    StackUnderflow,
    #[error("type mismatch: block leaves {found} values, expected {expected}")]
    ValuesRemaining { expected: usize, found: usize },
    #[error("type mismatch: {0}")]
    InvalidOperands(&'static str),
    #[error("unknown type {0}")]
    UnknownType(u32),
    #[error("unknown function {0}")]
    UnknownFunction(u32),
    #[error("unknown table {0}")]
    UnknownTable(u32),
    #[error("unknown memory {0}")]
    UnknownMemory(u32),
    #[error("unknown global {0}")]
    UnknownGlobal(u32),
    #[error("unknown local {0}")]
    UnknownLocal(u32),
    #[error("unknown label {0}")]
    UnknownLabel(u32),
    #[error("unknown elem segment {0}")]
    UnknownElem(u32),
    #[error("unknown data segment {0}")]
    UnknownData(u32),
    #[error("type {0} is not a function type")]
    NotAFunctionType(u32),
    #[error("sub type {0} does not match its supertype")]
    InvalidSubtype(u32),
    #[error("global is immutable")]
    ImmutableGlobal(u32),
    #[error("uninitialized local {0}")]
    UninitializedLocal(u32),
    #[error("constant expression required")]
    ConstantExpressionRequired,
    #[error("undeclared function reference {0}")]
    UndeclaredFunctionReference(u32),
    #[error("duplicate export name {0:?}")]
    DuplicateExport(String),
    #[error("start function must have type [] -> []")]
    InvalidStartFunction,
    #[error("size minimum must not be greater than maximum")]
    InvalidLimits,
    #[error("memory size must be at most 65536 pages (4GiB)")]
    MemoryTooLarge,
    #[error("shared memory must have maximum")]
    SharedMemoryWithoutMax,
    #[error("multiple memories")]
    MultipleMemories,
    #[error("alignment must not be larger than natural")]
    AlignmentTooLarge,
    #[error("offset out of range")]
    OffsetTooLarge,
    #[error("else without matching if")]
    ElseWithoutIf,
    #[error("instruction after function end")]
    UnexpectedInstruction,
    #[error("data count section required")]
    DataCountRequired,
    #[error("table of non-nullable type requires an initializer")]
    TableNeedsInit,
    #[error("{0} requires a disabled feature")]
    FeatureDisabled(&'static str),
}

/// All errors found in a module. Empty means the module is valid.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Diagnostics {
    pub errors: Vec<ValidationError>,
}

impl Diagnostics {
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ValidationError> {
        self.errors.iter()
    }
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.errors.as_slice() {
            [] => f.write_str("no validation errors"),
            [only] => write!(f, "{}", only),
            [first, rest @ ..] => write!(f, "{} (and {} more)", first, rest.len()),
        }
    }
}

impl core::error::Error for Diagnostics {}

// ============================================================================
// Results
// ============================================================================

/// Per-function facts recorded during validation, consumed by the linker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FunctionInfo {
    /// Operand stack height (above the frame's locals) before each
    /// instruction; `None` where the validator's stack was polymorphic.
    pub heights: Vec<Option<u32>>,
    /// Largest height reached.
    pub max_height: u32,
}

/// Facts about a module that passed validation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationInfo {
    /// One entry per module-defined function.
    pub functions: Vec<FunctionInfo>,
}

/// Validate a module with every supported proposal enabled.
pub fn validate(module: &Module) -> Result<ValidationInfo, Diagnostics> {
    validate_with_features(module, Features::default())
}

/// Validate a module against an explicit feature set.
pub fn validate_with_features(
    module: &Module,
    features: Features,
) -> Result<ValidationInfo, Diagnostics> {
    let mut validator = Validator::new(module, features);
    let info = validator.run();
    if validator.errors.is_empty() {
        Ok(info)
    } else {
        log::debug!("module failed validation with {} error(s)", validator.errors.len());
        Err(Diagnostics {
            errors: validator.errors,
        })
    }
}

/// Validate a module, returning only the diagnostics.
pub fn validate_module(module: &Module) -> Diagnostics {
    validate(module).err().unwrap_or_default()
}

// ============================================================================
// Module Validator
// ============================================================================

type Check<T = ()> = Result<T, ValidationErrorKind>;

/// WASM module validator.
pub struct Validator<'m> {
    module: &'m Module,
    features: Features,
    types: TypeSpace<'m>,
    /// Type index per function, imports first.
    funcs: Vec<u32>,
    tables: Vec<TableType>,
    memories: Vec<MemoryType>,
    globals: Vec<GlobalType>,
    /// Functions that may be referenced by `ref.func` in code.
    declared: HashSet<u32>,
    errors: Vec<ValidationError>,
}

impl<'m> Validator<'m> {
    pub fn new(module: &'m Module, features: Features) -> Self {
        let mut funcs = Vec::new();
        let mut tables = Vec::new();
        let mut memories = Vec::new();
        let mut globals = Vec::new();
        for import in &module.imports {
            match import.kind {
                ImportKind::Function(idx) => funcs.push(idx),
                ImportKind::Table(t) => tables.push(t),
                ImportKind::Memory(m) => memories.push(m),
                ImportKind::Global(g) => globals.push(g),
            }
        }
        funcs.extend_from_slice(&module.functions);
        tables.extend(module.tables.iter().map(|t| t.ty));
        memories.extend_from_slice(&module.memories);
        globals.extend(module.globals.iter().map(|g| g.ty));

        Validator {
            module,
            features,
            types: module.type_space(),
            funcs,
            tables,
            memories,
            globals,
            declared: HashSet::new(),
            errors: Vec::new(),
        }
    }

    fn report(&mut self, context: ErrorContext, result: Check) {
        if let Err(kind) = result {
            self.errors.push(ValidationError { context, kind });
        }
    }

    fn require(&self, feature: Features, what: &'static str) -> Check {
        if self.features.contains(feature) {
            Ok(())
        } else {
            Err(ValidationErrorKind::FeatureDisabled(what))
        }
    }

    /// Check every section, then every function body.
    pub fn run(&mut self) -> ValidationInfo {
        let module = self.module;

        for idx in 0..module.types.len() {
            let result = self.check_type(idx as u32);
            self.report(ErrorContext::Type(idx as u32), result);
        }
        for (idx, import) in module.imports.iter().enumerate() {
            let result = self.check_import(&import.kind);
            self.report(ErrorContext::Import(idx as u32), result);
        }
        let import_funcs = module.import_function_count();
        for (idx, &type_idx) in module.functions.iter().enumerate() {
            let result = self.func_type(type_idx).map(|_| ());
            self.report(ErrorContext::Function((import_funcs + idx) as u32), result);
        }

        self.collect_declared_functions();

        if self.memories.len() > 1 && !self.features.contains(Features::MULTI_MEMORY) {
            self.report(ErrorContext::Memory(1), Err(ValidationErrorKind::MultipleMemories));
        }
        let import_mems = module.import_memory_count();
        for (idx, mem) in module.memories.iter().enumerate() {
            let result = self.check_memory_type(mem);
            self.report(ErrorContext::Memory((import_mems + idx) as u32), result);
        }

        let import_globals = module.import_global_count();
        for (idx, global) in module.globals.iter().enumerate() {
            let result = self
                .check_val_type(global.ty.content)
                .and_then(|_| self.check_const_expr(&global.init, global.ty.content, import_globals + idx));
            self.report(ErrorContext::Global((import_globals + idx) as u32), result);
        }

        let import_tables = module.import_table_count();
        for (idx, table) in module.tables.iter().enumerate() {
            let result = self.check_table_type(&table.ty).and_then(|_| match &table.init {
                Some(init) => {
                    self.check_const_expr(init, ValType::Ref(table.ty.element), self.globals.len())
                }
                None if !table.ty.element.nullable => Err(ValidationErrorKind::TableNeedsInit),
                None => Ok(()),
            });
            self.report(ErrorContext::Table((import_tables + idx) as u32), result);
        }

        self.check_exports();

        if let Some(start) = module.start {
            let result = self.check_start(start);
            self.report(ErrorContext::Start, result);
        }

        for idx in 0..module.elements.len() {
            let result = self.check_element(idx);
            self.report(ErrorContext::Element(idx as u32), result);
        }
        for idx in 0..module.data.len() {
            let result = self.check_data(idx);
            self.report(ErrorContext::Data(idx as u32), result);
        }

        let mut functions = Vec::with_capacity(module.code.len());
        for (idx, body) in module.code.iter().enumerate() {
            let func_idx = (import_funcs + idx) as u32;
            let type_idx = module.functions.get(idx).copied().unwrap_or(u32::MAX);
            let Ok(ty) = self.func_type(type_idx) else {
                // Already reported against the function section.
                functions.push(FunctionInfo::default());
                continue;
            };
            let mut checker = FuncValidator::new(self, ty, body);
            match checker.run() {
                Ok(info) => functions.push(info),
                Err((instr, kind)) => {
                    functions.push(FunctionInfo::default());
                    self.errors.push(ValidationError {
                        context: ErrorContext::Code {
                            func: func_idx,
                            instr,
                        },
                        kind,
                    });
                }
            }
        }

        ValidationInfo { functions }
    }

    // ========================================================================
    // Index Lookups
    // ========================================================================

    fn func_type(&self, type_idx: u32) -> Check<&'m FuncType> {
        let sub = self
            .types
            .get(type_idx)
            .ok_or(ValidationErrorKind::UnknownType(type_idx))?;
        sub.as_func()
            .ok_or(ValidationErrorKind::NotAFunctionType(type_idx))
    }

    fn func_type_of(&self, func_idx: u32) -> Check<(u32, &'m FuncType)> {
        let type_idx = *self
            .funcs
            .get(func_idx as usize)
            .ok_or(ValidationErrorKind::UnknownFunction(func_idx))?;
        Ok((type_idx, self.func_type(type_idx)?))
    }

    fn table(&self, idx: u32) -> Check<TableType> {
        self.tables
            .get(idx as usize)
            .copied()
            .ok_or(ValidationErrorKind::UnknownTable(idx))
    }

    fn memory(&self, idx: u32) -> Check<MemoryType> {
        self.memories
            .get(idx as usize)
            .copied()
            .ok_or(ValidationErrorKind::UnknownMemory(idx))
    }

    fn global(&self, idx: u32) -> Check<GlobalType> {
        self.globals
            .get(idx as usize)
            .copied()
            .ok_or(ValidationErrorKind::UnknownGlobal(idx))
    }

    fn elem_type(&self, idx: u32) -> Check<RefType> {
        self.module
            .elements
            .get(idx as usize)
            .map(|e| e.ty)
            .ok_or(ValidationErrorKind::UnknownElem(idx))
    }

    fn check_data_index(&self, idx: u32) -> Check {
        let count = self
            .module
            .data_count
            .ok_or(ValidationErrorKind::DataCountRequired)?;
        if idx < count {
            Ok(())
        } else {
            Err(ValidationErrorKind::UnknownData(idx))
        }
    }

    /// Type of `ref.func f`: a non-null reference to the function's type.
    fn func_ref_type(&self, type_idx: u32) -> ValType {
        if self.features.contains(Features::FUNCTION_REFERENCES) {
            ValType::Ref(RefType::new(false, HeapType::Concrete(type_idx)))
        } else {
            ValType::FUNCREF
        }
    }

    // ========================================================================
    // Types
    // ========================================================================

    fn check_heap_type(&self, heap: HeapType) -> Check {
        match heap {
            HeapType::Concrete(idx) if self.types.get(idx).is_none() => {
                Err(ValidationErrorKind::UnknownType(idx))
            }
            _ => Ok(()),
        }
    }

    fn check_val_type(&self, ty: ValType) -> Check {
        match ty {
            ValType::Ref(rt) => self.check_heap_type(rt.heap),
            _ => Ok(()),
        }
    }

    fn check_type(&self, idx: u32) -> Check {
        let Some(sub) = self.types.get(idx) else {
            return Err(ValidationErrorKind::UnknownType(idx));
        };
        match &sub.composite {
            CompositeType::Func(ft) => {
                for ty in ft.params.iter().chain(&ft.results) {
                    self.check_val_type(*ty)?;
                }
                if ft.results.len() > 1 {
                    self.require(Features::MULTI_VALUE, "multiple results")?;
                }
            }
            CompositeType::Struct(st) => {
                for field in &st.fields {
                    if let StorageType::Val(ty) = field.storage {
                        self.check_val_type(ty)?;
                    }
                }
            }
            CompositeType::Array(at) => {
                if let StorageType::Val(ty) = at.field.storage {
                    self.check_val_type(ty)?;
                }
            }
        }
        if let Some(sup_idx) = sub.supertype {
            // Supertypes precede their subtypes.
            if sup_idx >= idx {
                return Err(ValidationErrorKind::UnknownType(sup_idx));
            }
            let sup = self
                .types
                .get(sup_idx)
                .ok_or(ValidationErrorKind::UnknownType(sup_idx))?;
            if sup.is_final || !self.types.composite_matches(&sub.composite, &sup.composite) {
                return Err(ValidationErrorKind::InvalidSubtype(idx));
            }
        }
        Ok(())
    }

    fn check_limits(&self, limits: &Limits, bound: u64) -> Check {
        if let Some(max) = limits.max {
            if limits.min > max {
                return Err(ValidationErrorKind::InvalidLimits);
            }
        }
        if !limits.is_valid(bound) {
            return Err(ValidationErrorKind::MemoryTooLarge);
        }
        Ok(())
    }

    fn check_memory_type(&self, mem: &MemoryType) -> Check {
        self.check_limits(&mem.limits, MAX_MEMORY_PAGES)?;
        if mem.shared && mem.limits.max.is_none() {
            return Err(ValidationErrorKind::SharedMemoryWithoutMax);
        }
        Ok(())
    }

    fn check_table_type(&self, table: &TableType) -> Check {
        self.check_heap_type(table.element.heap)?;
        self.check_limits(&table.limits, u64::from(u32::MAX))
    }

    fn check_import(&self, kind: &ImportKind) -> Check {
        match kind {
            ImportKind::Function(type_idx) => self.func_type(*type_idx).map(|_| ()),
            ImportKind::Table(t) => self.check_table_type(t),
            ImportKind::Memory(m) => self.check_memory_type(m),
            ImportKind::Global(g) => self.check_val_type(g.content),
        }
    }

    // ========================================================================
    // Constant Expressions
    // ========================================================================

    /// Check a constant expression producing `expected`. Only globals below
    /// `visible_globals` may be read.
    fn check_const_expr(&self, expr: &ConstExpr, expected: ValType, visible_globals: usize) -> Check {
        let mut stack: Vec<ValType> = Vec::new();
        for instr in expr.instructions() {
            match instr {
                Instruction::I32Const(_) => stack.push(ValType::I32),
                Instruction::I64Const(_) => stack.push(ValType::I64),
                Instruction::F32Const(_) => stack.push(ValType::F32),
                Instruction::F64Const(_) => stack.push(ValType::F64),
                Instruction::RefNull(heap) => {
                    self.check_heap_type(*heap)?;
                    stack.push(ValType::Ref(RefType::new(true, *heap)));
                }
                Instruction::RefFunc(idx) => {
                    let (type_idx, _) = self.func_type_of(*idx)?;
                    stack.push(self.func_ref_type(type_idx));
                }
                Instruction::GlobalGet(idx) => {
                    if *idx as usize >= visible_globals {
                        return Err(ValidationErrorKind::UnknownGlobal(*idx));
                    }
                    let global = self.global(*idx)?;
                    if global.mutable {
                        return Err(ValidationErrorKind::ConstantExpressionRequired);
                    }
                    stack.push(global.content);
                }
                Instruction::RefI31 => {
                    Self::pop_const(&mut stack, ValType::I32)?;
                    stack.push(ValType::Ref(RefType::new(false, HeapType::I31)));
                }
                Instruction::I32Add | Instruction::I32Sub | Instruction::I32Mul => {
                    self.require(Features::EXTENDED_CONST, "extended constant expression")?;
                    Self::pop_const(&mut stack, ValType::I32)?;
                    Self::pop_const(&mut stack, ValType::I32)?;
                    stack.push(ValType::I32);
                }
                Instruction::I64Add | Instruction::I64Sub | Instruction::I64Mul => {
                    self.require(Features::EXTENDED_CONST, "extended constant expression")?;
                    Self::pop_const(&mut stack, ValType::I64)?;
                    Self::pop_const(&mut stack, ValType::I64)?;
                    stack.push(ValType::I64);
                }
                _ => return Err(ValidationErrorKind::ConstantExpressionRequired),
            }
        }
        match stack.as_slice() {
            [ty] if self.types.is_subtype(*ty, expected) => Ok(()),
            [ty] => Err(ValidationErrorKind::TypeMismatch {
                expected: expected.into(),
                found: (*ty).into(),
            }),
            [] => Err(ValidationErrorKind::StackUnderflow),
            _ => Err(ValidationErrorKind::ValuesRemaining {
                expected: 1,
                found: stack.len(),
            }),
        }
    }

    fn pop_const(stack: &mut Vec<ValType>, expected: ValType) -> Check {
        match stack.pop() {
            Some(ty) if ty == expected => Ok(()),
            Some(ty) => Err(ValidationErrorKind::TypeMismatch {
                expected: expected.into(),
                found: ty.into(),
            }),
            None => Err(ValidationErrorKind::StackUnderflow),
        }
    }

    // ========================================================================
    // Exports, Start, Segments
    // ========================================================================

    /// Functions referenced outside function bodies may be used by `ref.func`.
    fn collect_declared_functions(&mut self) {
        let module = self.module;
        let mut declared = HashSet::new();
        for global in &module.globals {
            scan_ref_funcs(&global.init, &mut declared);
        }
        for table in &module.tables {
            if let Some(init) = &table.init {
                scan_ref_funcs(init, &mut declared);
            }
        }
        for elem in &module.elements {
            match &elem.items {
                ElementItems::Functions(funcs) => declared.extend(funcs.iter().copied()),
                ElementItems::Expressions(exprs) => {
                    for expr in exprs {
                        scan_ref_funcs(expr, &mut declared);
                    }
                }
            }
        }
        declared.extend(
            module
                .exports
                .iter()
                .filter(|e| e.kind == ExportKind::Function)
                .map(|e| e.index),
        );
        declared.extend(module.start);
        self.declared = declared;
    }

    fn check_exports(&mut self) {
        let module = self.module;
        let mut names: HashSet<&str> = HashSet::new();
        for (idx, export) in module.exports.iter().enumerate() {
            let result = if !names.insert(export.name.as_str()) {
                Err(ValidationErrorKind::DuplicateExport(export.name.clone()))
            } else {
                match export.kind {
                    ExportKind::Function => self.func_type_of(export.index).map(|_| ()),
                    ExportKind::Table => self.table(export.index).map(|_| ()),
                    ExportKind::Memory => self.memory(export.index).map(|_| ()),
                    ExportKind::Global => self.global(export.index).map(|_| ()),
                }
            };
            self.report(ErrorContext::Export(idx as u32), result);
        }
    }

    fn check_start(&self, start: u32) -> Check {
        let (_, ty) = self.func_type_of(start)?;
        if ty.params.is_empty() && ty.results.is_empty() {
            Ok(())
        } else {
            Err(ValidationErrorKind::InvalidStartFunction)
        }
    }

    fn check_element(&self, idx: usize) -> Check {
        let elem = &self.module.elements[idx];
        self.check_heap_type(elem.ty.heap)?;
        match &elem.items {
            ElementItems::Functions(funcs) => {
                for f in funcs {
                    self.func_type_of(*f)?;
                }
            }
            ElementItems::Expressions(exprs) => {
                for expr in exprs {
                    self.check_const_expr(expr, ValType::Ref(elem.ty), self.globals.len())?;
                }
            }
        }
        if let ElementMode::Active { table, offset } = &elem.mode {
            let table = self.table(*table)?;
            self.check_const_expr(offset, ValType::I32, self.globals.len())?;
            if !self.types.is_ref_subtype(elem.ty, table.element) {
                return Err(ValidationErrorKind::TypeMismatch {
                    expected: ValType::Ref(table.element).into(),
                    found: ValType::Ref(elem.ty).into(),
                });
            }
        }
        Ok(())
    }

    fn check_data(&self, idx: usize) -> Check {
        if let DataMode::Active { memory, offset } = &self.module.data[idx].mode {
            self.memory(*memory)?;
            self.check_const_expr(offset, ValType::I32, self.globals.len())?;
        }
        Ok(())
    }
}

// ============================================================================
// Function Body Validator
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    Function,
    Block,
    Loop,
    If,
    Else,
}

/// An open block while checking a function body.
#[derive(Debug, Clone)]
struct CtrlFrame {
    kind: FrameKind,
    ty: FuncType,
    /// Operand stack height at entry ("the line").
    height: usize,
    unreachable: bool,
    /// Length of the local-initialisation log at entry.
    init_height: usize,
}

impl CtrlFrame {
    /// Types a branch to this frame must supply.
    fn label_types(&self) -> &[ValType] {
        if self.kind == FrameKind::Loop {
            &self.ty.params
        } else {
            &self.ty.results
        }
    }
}

/// Operand and control stacks for one function body.
struct FuncValidator<'v, 'm> {
    module: &'v Validator<'m>,
    ty: &'m FuncType,
    body: &'m FunctionBody,
    locals: Vec<ValType>,
    initialized: Vec<bool>,
    /// Locals set since function entry, for resetting at block ends.
    init_log: Vec<u32>,
    vals: Vec<MaybeType>,
    ctrls: Vec<CtrlFrame>,
    max_height: usize,
}

impl<'v, 'm> FuncValidator<'v, 'm> {
    fn new(module: &'v Validator<'m>, ty: &'m FuncType, body: &'m FunctionBody) -> Self {
        let mut locals = ty.params.clone();
        locals.extend(body.expanded_locals());
        let initialized = locals
            .iter()
            .enumerate()
            .map(|(i, l)| i < ty.params.len() || l.is_defaultable())
            .collect();
        FuncValidator {
            module,
            ty,
            body,
            locals,
            initialized,
            init_log: Vec::new(),
            vals: Vec::new(),
            ctrls: Vec::new(),
            max_height: 0,
        }
    }

    fn types(&self) -> TypeSpace<'m> {
        self.module.types
    }

    fn run(&mut self) -> Result<FunctionInfo, (usize, ValidationErrorKind)> {
        for local in &self.locals {
            self.module.check_val_type(*local).map_err(|e| (0, e))?;
        }

        self.ctrls.push(CtrlFrame {
            kind: FrameKind::Function,
            ty: self.ty.clone(),
            height: 0,
            unreachable: false,
            init_height: 0,
        });

        let mut heights = Vec::with_capacity(self.body.instructions.len());
        for (pc, instr) in self.body.instructions.iter().enumerate() {
            let frame = self.ctrls.last().ok_or((pc, ValidationErrorKind::UnexpectedInstruction))?;
            heights.push(if frame.unreachable {
                None
            } else {
                Some(self.vals.len() as u32)
            });
            self.step(instr).map_err(|e| (pc, e))?;
            self.max_height = self.max_height.max(self.vals.len());
        }

        if !self.ctrls.is_empty() {
            return Err((
                self.body.instructions.len(),
                ValidationErrorKind::ValuesRemaining {
                    expected: 0,
                    found: self.ctrls.len(),
                },
            ));
        }

        Ok(FunctionInfo {
            heights,
            max_height: self.max_height as u32,
        })
    }

    // ========================================================================
    // Operand Stack
    // ========================================================================

    fn push(&mut self, ty: impl Into<MaybeType>) {
        self.vals.push(ty.into());
    }

    fn push_all(&mut self, types: &[ValType]) {
        self.vals.extend(types.iter().map(|t| MaybeType::Known(*t)));
    }

    fn pop(&mut self) -> Check<MaybeType> {
        let frame = self
            .ctrls
            .last()
            .ok_or(ValidationErrorKind::UnexpectedInstruction)?;
        if self.vals.len() == frame.height {
            return if frame.unreachable {
                Ok(MaybeType::Unknown)
            } else {
                Err(ValidationErrorKind::StackUnderflow)
            };
        }
        self.vals.pop().ok_or(ValidationErrorKind::StackUnderflow)
    }

    fn pop_expect(&mut self, expected: ValType) -> Check<MaybeType> {
        let actual = self.pop()?;
        if self.types().is_maybe_subtype(actual, expected.into()) {
            Ok(actual)
        } else {
            Err(ValidationErrorKind::TypeMismatch {
                expected: expected.into(),
                found: actual,
            })
        }
    }

    fn pop_all(&mut self, types: &[ValType]) -> Check<Vec<MaybeType>> {
        let mut popped = vec![MaybeType::Unknown; types.len()];
        for (slot, ty) in popped.iter_mut().zip(types).rev() {
            *slot = self.pop_expect(*ty)?;
        }
        Ok(popped)
    }

    /// Pop a reference; `Unknown` in unreachable code.
    fn pop_ref(&mut self) -> Check<Option<RefType>> {
        match self.pop()? {
            MaybeType::Known(ValType::Ref(rt)) => Ok(Some(rt)),
            MaybeType::Unknown => Ok(None),
            found => Err(ValidationErrorKind::TypeMismatch {
                expected: ValType::Ref(RefType::new(true, HeapType::Any)).into(),
                found,
            }),
        }
    }

    // ========================================================================
    // Control Stack
    // ========================================================================

    fn push_ctrl(&mut self, kind: FrameKind, ty: FuncType) {
        let height = self.vals.len();
        self.push_all(&ty.params);
        self.ctrls.push(CtrlFrame {
            kind,
            ty,
            height,
            unreachable: false,
            init_height: self.init_log.len(),
        });
    }

    fn pop_ctrl(&mut self) -> Check<CtrlFrame> {
        let frame = self
            .ctrls
            .last()
            .ok_or(ValidationErrorKind::UnexpectedInstruction)?
            .clone();
        self.pop_all(&frame.ty.results)?;
        if self.vals.len() != frame.height {
            return Err(ValidationErrorKind::ValuesRemaining {
                expected: frame.ty.results.len(),
                found: self.vals.len() - frame.height + frame.ty.results.len(),
            });
        }
        self.ctrls.pop();
        // Initialisations inside the block do not outlive it.
        for local in self.init_log.drain(frame.init_height..) {
            self.initialized[local as usize] = false;
        }
        Ok(frame)
    }

    fn set_unreachable(&mut self) -> Check {
        let frame = self
            .ctrls
            .last_mut()
            .ok_or(ValidationErrorKind::UnexpectedInstruction)?;
        self.vals.truncate(frame.height);
        frame.unreachable = true;
        Ok(())
    }

    fn label(&self, depth: u32) -> Check<&CtrlFrame> {
        let len = self.ctrls.len();
        (depth as usize)
            .checked_add(1)
            .and_then(|d| len.checked_sub(d))
            .and_then(|i| self.ctrls.get(i))
            .ok_or(ValidationErrorKind::UnknownLabel(depth))
    }

    fn label_types(&self, depth: u32) -> Check<Vec<ValType>> {
        Ok(self.label(depth)?.label_types().to_vec())
    }

    fn block_type(&self, bt: &BlockType) -> Check<FuncType> {
        match bt {
            BlockType::Empty => Ok(FuncType::default()),
            BlockType::Value(ty) => {
                self.module.check_val_type(*ty)?;
                Ok(FuncType::new(Vec::new(), vec![*ty]))
            }
            BlockType::TypeIndex(idx) => {
                self.module.require(Features::MULTI_VALUE, "block type index")?;
                self.module.func_type(*idx).cloned()
            }
        }
    }

    // ========================================================================
    // Locals
    // ========================================================================

    fn local(&self, idx: u32) -> Check<ValType> {
        self.locals
            .get(idx as usize)
            .copied()
            .ok_or(ValidationErrorKind::UnknownLocal(idx))
    }

    fn mark_initialized(&mut self, idx: u32) {
        if let Some(slot) = self.initialized.get_mut(idx as usize) {
            if !*slot {
                *slot = true;
                self.init_log.push(idx);
            }
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn unary(&mut self, input: ValType, output: ValType) -> Check {
        self.pop_expect(input)?;
        self.push(output);
        Ok(())
    }

    fn binary(&mut self, input: ValType, output: ValType) -> Check {
        self.pop_expect(input)?;
        self.pop_expect(input)?;
        self.push(output);
        Ok(())
    }

    fn mem_access(&self, arg: &MemArg, natural_log2: u32) -> Check {
        self.module.memory(arg.memory)?;
        if arg.align > natural_log2 {
            return Err(ValidationErrorKind::AlignmentTooLarge);
        }
        if arg.offset > u64::from(u32::MAX) {
            return Err(ValidationErrorKind::OffsetTooLarge);
        }
        Ok(())
    }

    fn load(&mut self, arg: &MemArg, natural_log2: u32, ty: ValType) -> Check {
        self.mem_access(arg, natural_log2)?;
        self.pop_expect(ValType::I32)?;
        self.push(ty);
        Ok(())
    }

    fn store(&mut self, arg: &MemArg, natural_log2: u32, ty: ValType) -> Check {
        self.mem_access(arg, natural_log2)?;
        self.pop_expect(ty)?;
        self.pop_expect(ValType::I32)?;
        Ok(())
    }

    fn call(&mut self, ty: &FuncType) -> Check {
        self.pop_all(&ty.params)?;
        self.push_all(&ty.results);
        Ok(())
    }

    /// Tail calls: the callee's results must fit the caller's.
    fn tail_call(&mut self, ty: &FuncType) -> Check {
        self.pop_all(&ty.params)?;
        if !self.types().matches(&ty.results, &self.ty.results) {
            return Err(ValidationErrorKind::InvalidOperands(
                "tail call results do not match the caller's",
            ));
        }
        self.set_unreachable()
    }

    fn indirect_table(&self, table: u32) -> Check {
        let table = self.module.table(table)?;
        if !self.types().is_ref_subtype(table.element, RefType::FUNCREF) {
            return Err(ValidationErrorKind::TypeMismatch {
                expected: ValType::FUNCREF.into(),
                found: ValType::Ref(table.element).into(),
            });
        }
        Ok(())
    }

    // ========================================================================
    // Instructions
    // ========================================================================

    fn step(&mut self, instr: &Instruction) -> Check {
        use Instruction::*;
        use ValType::{F32, F64, I32, I64};

        match instr {
            // ====== Control Flow ======
            Unreachable => self.set_unreachable()?,
            Nop => {}
            Block(bt) | Loop(bt) => {
                let ty = self.block_type(bt)?;
                self.pop_all(&ty.params)?;
                let kind = if matches!(instr, Loop(_)) {
                    FrameKind::Loop
                } else {
                    FrameKind::Block
                };
                self.push_ctrl(kind, ty);
            }
            If(bt) => {
                let ty = self.block_type(bt)?;
                self.pop_expect(I32)?;
                self.pop_all(&ty.params)?;
                self.push_ctrl(FrameKind::If, ty);
            }
            Else => {
                if self.ctrls.last().map(|f| f.kind) != Some(FrameKind::If) {
                    return Err(ValidationErrorKind::ElseWithoutIf);
                }
                let frame = self.pop_ctrl()?;
                self.push_ctrl(FrameKind::Else, frame.ty);
            }
            End => {
                let frame = self.pop_ctrl()?;
                if frame.kind == FrameKind::If
                    && !self.types().matches(&frame.ty.params, &frame.ty.results)
                {
                    return Err(ValidationErrorKind::InvalidOperands(
                        "if without else must not change the stack type",
                    ));
                }
                self.push_all(&frame.ty.results);
            }
            Br(depth) => {
                let types = self.label_types(*depth)?;
                self.pop_all(&types)?;
                self.set_unreachable()?;
            }
            BrIf(depth) => {
                self.pop_expect(I32)?;
                let types = self.label_types(*depth)?;
                self.pop_all(&types)?;
                self.push_all(&types);
            }
            BrTable(targets, default) => {
                self.pop_expect(I32)?;
                let default_types = self.label_types(*default)?;
                for target in targets {
                    let types = self.label_types(*target)?;
                    if types.len() != default_types.len() {
                        return Err(ValidationErrorKind::InvalidOperands(
                            "br_table targets have different arities",
                        ));
                    }
                    let popped = self.pop_all(&types)?;
                    self.vals.extend(popped);
                }
                self.pop_all(&default_types)?;
                self.set_unreachable()?;
            }
            Return => {
                let ty = self.ty;
                self.pop_all(&ty.results)?;
                self.set_unreachable()?;
            }
            Call(f) => {
                let (_, ty) = self.module.func_type_of(*f)?;
                self.call(ty)?;
            }
            CallIndirect(type_idx, table) => {
                self.indirect_table(*table)?;
                let ty = self.module.func_type(*type_idx)?;
                self.pop_expect(I32)?;
                self.call(ty)?;
            }
            ReturnCall(f) => {
                let (_, ty) = self.module.func_type_of(*f)?;
                self.tail_call(ty)?;
            }
            ReturnCallIndirect(type_idx, table) => {
                self.indirect_table(*table)?;
                let ty = self.module.func_type(*type_idx)?;
                self.pop_expect(I32)?;
                self.tail_call(ty)?;
            }
            CallRef(type_idx) => {
                let ty = self.module.func_type(*type_idx)?;
                self.pop_expect(ValType::Ref(RefType::new(true, HeapType::Concrete(*type_idx))))?;
                self.call(ty)?;
            }
            ReturnCallRef(type_idx) => {
                let ty = self.module.func_type(*type_idx)?;
                self.pop_expect(ValType::Ref(RefType::new(true, HeapType::Concrete(*type_idx))))?;
                self.tail_call(ty)?;
            }

            // ====== Parametric ======
            Drop => {
                self.pop()?;
            }
            Select => {
                self.pop_expect(I32)?;
                let t1 = self.pop()?;
                let t2 = self.pop()?;
                let is_num = |t: MaybeType| match t {
                    MaybeType::Known(ty) => ty.is_num(),
                    MaybeType::Unknown => true,
                };
                if !is_num(t1) || !is_num(t2) {
                    return Err(ValidationErrorKind::InvalidOperands(
                        "untyped select requires numeric operands",
                    ));
                }
                match (t1, t2) {
                    (MaybeType::Known(a), MaybeType::Known(b)) if a != b => {
                        return Err(ValidationErrorKind::TypeMismatch {
                            expected: t1,
                            found: t2,
                        })
                    }
                    (MaybeType::Unknown, other) => self.push(other),
                    (known, _) => self.push(known),
                }
            }
            SelectTyped(types) => {
                let [ty] = types.as_slice() else {
                    return Err(ValidationErrorKind::InvalidOperands(
                        "select must have exactly one result type",
                    ));
                };
                self.module.check_val_type(*ty)?;
                self.pop_expect(I32)?;
                self.pop_expect(*ty)?;
                self.pop_expect(*ty)?;
                self.push(*ty);
            }

            // ====== Variable Access ======
            LocalGet(idx) => {
                let ty = self.local(*idx)?;
                if !self.initialized[*idx as usize] {
                    return Err(ValidationErrorKind::UninitializedLocal(*idx));
                }
                self.push(ty);
            }
            LocalSet(idx) => {
                let ty = self.local(*idx)?;
                self.pop_expect(ty)?;
                self.mark_initialized(*idx);
            }
            LocalTee(idx) => {
                let ty = self.local(*idx)?;
                self.pop_expect(ty)?;
                self.mark_initialized(*idx);
                self.push(ty);
            }
            GlobalGet(idx) => {
                let global = self.module.global(*idx)?;
                self.push(global.content);
            }
            GlobalSet(idx) => {
                let global = self.module.global(*idx)?;
                if !global.mutable {
                    return Err(ValidationErrorKind::ImmutableGlobal(*idx));
                }
                self.pop_expect(global.content)?;
            }

            // ====== Table Operations ======
            TableGet(t) => {
                let table = self.module.table(*t)?;
                self.pop_expect(I32)?;
                self.push(ValType::Ref(table.element));
            }
            TableSet(t) => {
                let table = self.module.table(*t)?;
                self.pop_expect(ValType::Ref(table.element))?;
                self.pop_expect(I32)?;
            }
            TableInit(elem, t) => {
                let table = self.module.table(*t)?;
                let elem_ty = self.module.elem_type(*elem)?;
                if !self.types().is_ref_subtype(elem_ty, table.element) {
                    return Err(ValidationErrorKind::TypeMismatch {
                        expected: ValType::Ref(table.element).into(),
                        found: ValType::Ref(elem_ty).into(),
                    });
                }
                self.pop_all(&[I32, I32, I32])?;
            }
            ElemDrop(elem) => {
                self.module.elem_type(*elem)?;
            }
            TableCopy(dst, src) => {
                let dst = self.module.table(*dst)?;
                let src = self.module.table(*src)?;
                if !self.types().is_ref_subtype(src.element, dst.element) {
                    return Err(ValidationErrorKind::TypeMismatch {
                        expected: ValType::Ref(dst.element).into(),
                        found: ValType::Ref(src.element).into(),
                    });
                }
                self.pop_all(&[I32, I32, I32])?;
            }
            TableGrow(t) => {
                let table = self.module.table(*t)?;
                self.pop_expect(I32)?;
                self.pop_expect(ValType::Ref(table.element))?;
                self.push(I32);
            }
            TableSize(t) => {
                self.module.table(*t)?;
                self.push(I32);
            }
            TableFill(t) => {
                let table = self.module.table(*t)?;
                self.pop_expect(I32)?;
                self.pop_expect(ValType::Ref(table.element))?;
                self.pop_expect(I32)?;
            }

            // ====== Memory ======
            I32Load(m) => self.load(m, 2, I32)?,
            I64Load(m) => self.load(m, 3, I64)?,
            F32Load(m) => self.load(m, 2, F32)?,
            F64Load(m) => self.load(m, 3, F64)?,
            I32Load8S(m) | I32Load8U(m) => self.load(m, 0, I32)?,
            I32Load16S(m) | I32Load16U(m) => self.load(m, 1, I32)?,
            I64Load8S(m) | I64Load8U(m) => self.load(m, 0, I64)?,
            I64Load16S(m) | I64Load16U(m) => self.load(m, 1, I64)?,
            I64Load32S(m) | I64Load32U(m) => self.load(m, 2, I64)?,
            I32Store(m) => self.store(m, 2, I32)?,
            I64Store(m) => self.store(m, 3, I64)?,
            F32Store(m) => self.store(m, 2, F32)?,
            F64Store(m) => self.store(m, 3, F64)?,
            I32Store8(m) => self.store(m, 0, I32)?,
            I32Store16(m) => self.store(m, 1, I32)?,
            I64Store8(m) => self.store(m, 0, I64)?,
            I64Store16(m) => self.store(m, 1, I64)?,
            I64Store32(m) => self.store(m, 2, I64)?,
            MemorySize(mem) => {
                self.module.memory(*mem)?;
                self.push(I32);
            }
            MemoryGrow(mem) => {
                self.module.memory(*mem)?;
                self.unary(I32, I32)?;
            }
            MemoryInit(data, mem) => {
                self.module.memory(*mem)?;
                self.module.check_data_index(*data)?;
                self.pop_all(&[I32, I32, I32])?;
            }
            DataDrop(data) => self.module.check_data_index(*data)?,
            MemoryCopy(dst, src) => {
                self.module.memory(*dst)?;
                self.module.memory(*src)?;
                self.pop_all(&[I32, I32, I32])?;
            }
            MemoryFill(mem) => {
                self.module.memory(*mem)?;
                self.pop_all(&[I32, I32, I32])?;
            }

            // ====== Constants ======
            I32Const(_) => self.push(I32),
            I64Const(_) => self.push(I64),
            F32Const(_) => self.push(F32),
            F64Const(_) => self.push(F64),

            // ====== Reference Types ======
            RefNull(heap) => {
                self.module.check_heap_type(*heap)?;
                self.push(ValType::Ref(RefType::new(true, *heap)));
            }
            RefIsNull => {
                self.pop_ref()?;
                self.push(I32);
            }
            RefFunc(f) => {
                let (type_idx, _) = self.module.func_type_of(*f)?;
                if !self.module.declared.contains(f) {
                    return Err(ValidationErrorKind::UndeclaredFunctionReference(*f));
                }
                let ty = self.module.func_ref_type(type_idx);
                self.push(ty);
            }
            RefEq => {
                let eqref = ValType::Ref(RefType::new(true, HeapType::Eq));
                self.binary(eqref, I32)?;
            }
            RefAsNonNull => match self.pop_ref()? {
                Some(rt) => self.push(ValType::Ref(rt.as_non_null())),
                None => self.push(MaybeType::Unknown),
            },
            BrOnNull(depth) => {
                let rt = self.pop_ref()?;
                let types = self.label_types(*depth)?;
                self.pop_all(&types)?;
                self.push_all(&types);
                match rt {
                    Some(rt) => self.push(ValType::Ref(rt.as_non_null())),
                    None => self.push(MaybeType::Unknown),
                }
            }
            BrOnNonNull(depth) => {
                let rt = self.pop_ref()?;
                let types = self.label_types(*depth)?;
                let Some((last, rest)) = types.split_last() else {
                    return Err(ValidationErrorKind::InvalidOperands(
                        "br_on_non_null target must accept a reference",
                    ));
                };
                if let Some(rt) = rt {
                    let non_null = ValType::Ref(rt.as_non_null());
                    if !self.types().is_subtype(non_null, *last) {
                        return Err(ValidationErrorKind::TypeMismatch {
                            expected: (*last).into(),
                            found: non_null.into(),
                        });
                    }
                } else if !last.is_ref() {
                    return Err(ValidationErrorKind::InvalidOperands(
                        "br_on_non_null target must accept a reference",
                    ));
                }
                self.pop_all(rest)?;
                self.push_all(rest);
            }
            RefI31 => self.unary(I32, ValType::Ref(RefType::new(false, HeapType::I31)))?,
            I31GetS | I31GetU => {
                self.unary(ValType::Ref(RefType::new(true, HeapType::I31)), I32)?
            }

            // ====== Numeric ======
            other => {
                let (params, result) = numeric_signature(other).ok_or(
                    ValidationErrorKind::InvalidOperands("instruction not supported"),
                )?;
                self.pop_all(params)?;
                self.push(result);
            }
        }
        Ok(())
    }
}

fn scan_ref_funcs(expr: &ConstExpr, declared: &mut HashSet<u32>) {
    for instr in expr.instructions() {
        if let Instruction::RefFunc(idx) = instr {
            declared.insert(*idx);
        }
    }
}

const I32_1: &[ValType] = &[ValType::I32];
const I32_2: &[ValType] = &[ValType::I32, ValType::I32];
const I64_1: &[ValType] = &[ValType::I64];
const I64_2: &[ValType] = &[ValType::I64, ValType::I64];
const F32_1: &[ValType] = &[ValType::F32];
const F32_2: &[ValType] = &[ValType::F32, ValType::F32];
const F64_1: &[ValType] = &[ValType::F64];
const F64_2: &[ValType] = &[ValType::F64, ValType::F64];

/// Operand and result types of numeric instructions.
pub fn numeric_signature(instr: &Instruction) -> Option<(&'static [ValType], ValType)> {
    use Instruction::*;
    use ValType::{F32, F64, I32, I64};

    Some(match instr {
        I32Eqz => (I32_1, I32),
        I32Eq | I32Ne | I32LtS | I32LtU | I32GtS | I32GtU | I32LeS | I32LeU | I32GeS | I32GeU => {
            (I32_2, I32)
        }
        I64Eqz => (I64_1, I32),
        I64Eq | I64Ne | I64LtS | I64LtU | I64GtS | I64GtU | I64LeS | I64LeU | I64GeS | I64GeU => {
            (I64_2, I32)
        }
        F32Eq | F32Ne | F32Lt | F32Gt | F32Le | F32Ge => (F32_2, I32),
        F64Eq | F64Ne | F64Lt | F64Gt | F64Le | F64Ge => (F64_2, I32),

        I32Clz | I32Ctz | I32Popcnt | I32Extend8S | I32Extend16S => (I32_1, I32),
        I32Add | I32Sub | I32Mul | I32DivS | I32DivU | I32RemS | I32RemU | I32And | I32Or
        | I32Xor | I32Shl | I32ShrS | I32ShrU | I32Rotl | I32Rotr => (I32_2, I32),
        I64Clz | I64Ctz | I64Popcnt | I64Extend8S | I64Extend16S | I64Extend32S => (I64_1, I64),
        I64Add | I64Sub | I64Mul | I64DivS | I64DivU | I64RemS | I64RemU | I64And | I64Or
        | I64Xor | I64Shl | I64ShrS | I64ShrU | I64Rotl | I64Rotr => (I64_2, I64),

        F32Abs | F32Neg | F32Ceil | F32Floor | F32Trunc | F32Nearest | F32Sqrt => (F32_1, F32),
        F32Add | F32Sub | F32Mul | F32Div | F32Min | F32Max | F32Copysign => (F32_2, F32),
        F64Abs | F64Neg | F64Ceil | F64Floor | F64Trunc | F64Nearest | F64Sqrt => (F64_1, F64),
        F64Add | F64Sub | F64Mul | F64Div | F64Min | F64Max | F64Copysign => (F64_2, F64),

        I32WrapI64 => (I64_1, I32),
        I32TruncF32S | I32TruncF32U | I32TruncSatF32S | I32TruncSatF32U => (F32_1, I32),
        I32TruncF64S | I32TruncF64U | I32TruncSatF64S | I32TruncSatF64U => (F64_1, I32),
        I64ExtendI32S | I64ExtendI32U => (I32_1, I64),
        I64TruncF32S | I64TruncF32U | I64TruncSatF32S | I64TruncSatF32U => (F32_1, I64),
        I64TruncF64S | I64TruncF64U | I64TruncSatF64S | I64TruncSatF64U => (F64_1, I64),
        F32ConvertI32S | F32ConvertI32U => (I32_1, F32),
        F32ConvertI64S | F32ConvertI64U => (I64_1, F32),
        F32DemoteF64 => (F64_1, F32),
        F64ConvertI32S | F64ConvertI32U => (I32_1, F64),
        F64ConvertI64S | F64ConvertI64U => (I64_1, F64),
        F64PromoteF32 => (F32_1, F64),
        I32ReinterpretF32 => (F32_1, I32),
        I64ReinterpretF64 => (F64_1, I64),
        F32ReinterpretI32 => (I32_1, F32),
        F64ReinterpretI64 => (I64_1, F64),
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{DataSegment, Element, Export, Global, Import};
    use crate::types::SubType;
    use alloc::string::ToString;

    fn func_module(ty: FuncType, locals: Vec<(u32, ValType)>, code: Vec<Instruction>) -> Module {
        let mut module = Module::empty();
        module.types.push(SubType::func(ty));
        module.functions.push(0);
        module.code.push(FunctionBody {
            locals,
            instructions: code,
        });
        module
    }

    fn first_error(module: &Module) -> ValidationErrorKind {
        let diags = validate_module(module);
        assert!(!diags.is_empty(), "expected a validation error");
        diags.errors[0].kind.clone()
    }

    #[test]
    fn test_valid_add() {
        let module = func_module(
            FuncType::new(vec![], vec![ValType::I32]),
            vec![],
            vec![
                Instruction::I32Const(1),
                Instruction::I32Const(1),
                Instruction::I32Add,
                Instruction::End,
            ],
        );
        let info = validate(&module).unwrap();
        assert_eq!(
            info.functions[0].heights,
            vec![Some(0), Some(1), Some(2), Some(1)]
        );
        assert_eq!(info.functions[0].max_height, 2);
    }

    #[test]
    fn test_type_mismatch() {
        let module = func_module(
            FuncType::new(vec![], vec![ValType::I32]),
            vec![],
            vec![
                Instruction::I32Const(1),
                Instruction::F32Const(1.0),
                Instruction::I32Add,
                Instruction::End,
            ],
        );
        let diags = validate_module(&module);
        assert_eq!(diags.len(), 1);
        assert_eq!(
            diags.errors[0].context,
            ErrorContext::Code { func: 0, instr: 2 }
        );
        assert_eq!(
            diags.errors[0].kind,
            ValidationErrorKind::TypeMismatch {
                expected: ValType::I32.into(),
                found: ValType::F32.into(),
            }
        );
    }

    #[test]
    fn test_values_remaining_at_end() {
        let module = func_module(
            FuncType::default(),
            vec![],
            vec![Instruction::I32Const(1), Instruction::End],
        );
        assert!(matches!(
            first_error(&module),
            ValidationErrorKind::ValuesRemaining { expected: 0, found: 1 }
        ));
    }

    #[test]
    fn test_unreachable_makes_stack_polymorphic() {
        let module = func_module(
            FuncType::new(vec![], vec![ValType::I32]),
            vec![],
            vec![
                Instruction::Unreachable,
                Instruction::I64Add,
                Instruction::Drop,
                Instruction::End,
            ],
        );
        let info = validate(&module).unwrap();
        assert_eq!(info.functions[0].heights, vec![Some(0), None, None, None]);
    }

    #[test]
    fn test_unreachable_still_checks_known_types() {
        let module = func_module(
            FuncType::new(vec![], vec![ValType::I32]),
            vec![],
            vec![
                Instruction::Unreachable,
                Instruction::F32Const(0.0),
                Instruction::I32Eqz,
                Instruction::End,
            ],
        );
        assert!(matches!(
            first_error(&module),
            ValidationErrorKind::TypeMismatch { .. }
        ));
    }

    #[test]
    fn test_branch_to_loop_uses_params() {
        // (loop $l (br_if $l (i32.const 1)))
        let module = func_module(
            FuncType::default(),
            vec![],
            vec![
                Instruction::Loop(BlockType::Empty),
                Instruction::I32Const(1),
                Instruction::BrIf(0),
                Instruction::End,
                Instruction::End,
            ],
        );
        assert!(validate_module(&module).is_empty());
    }

    #[test]
    fn test_br_arity() {
        let module = func_module(
            FuncType::new(vec![], vec![ValType::I32]),
            vec![],
            vec![
                Instruction::Block(BlockType::Value(ValType::I32)),
                Instruction::I64Const(3),
                Instruction::Br(0),
                Instruction::End,
                Instruction::End,
            ],
        );
        assert!(matches!(
            first_error(&module),
            ValidationErrorKind::TypeMismatch { .. }
        ));
    }

    #[test]
    fn test_unknown_label() {
        let module = func_module(
            FuncType::default(),
            vec![],
            vec![Instruction::Br(1), Instruction::End],
        );
        assert_eq!(first_error(&module), ValidationErrorKind::UnknownLabel(1));
    }

    #[test]
    fn test_immutable_global_set_rejected() {
        let mut module = func_module(
            FuncType::default(),
            vec![],
            vec![
                Instruction::I32Const(1),
                Instruction::GlobalSet(0),
                Instruction::End,
            ],
        );
        module.globals.push(Global {
            ty: GlobalType {
                content: ValType::I32,
                mutable: false,
            },
            init: ConstExpr::i32(0),
        });
        assert_eq!(first_error(&module), ValidationErrorKind::ImmutableGlobal(0));
    }

    #[test]
    fn test_if_without_else_must_preserve_type() {
        let module = func_module(
            FuncType::new(vec![], vec![ValType::I32]),
            vec![],
            vec![
                Instruction::I32Const(1),
                Instruction::If(BlockType::Value(ValType::I32)),
                Instruction::I32Const(2),
                Instruction::End,
                Instruction::End,
            ],
        );
        assert!(matches!(
            first_error(&module),
            ValidationErrorKind::InvalidOperands(_)
        ));
    }

    #[test]
    fn test_if_else_valid() {
        let module = func_module(
            FuncType::new(vec![ValType::I32], vec![ValType::I32]),
            vec![],
            vec![
                Instruction::LocalGet(0),
                Instruction::If(BlockType::Value(ValType::I32)),
                Instruction::I32Const(2),
                Instruction::Else,
                Instruction::I32Const(3),
                Instruction::End,
                Instruction::End,
            ],
        );
        assert!(validate_module(&module).is_empty());
    }

    #[test]
    fn test_else_without_if() {
        let module = func_module(
            FuncType::default(),
            vec![],
            vec![
                Instruction::Block(BlockType::Empty),
                Instruction::Else,
                Instruction::End,
                Instruction::End,
            ],
        );
        assert_eq!(first_error(&module), ValidationErrorKind::ElseWithoutIf);
    }

    #[test]
    fn test_ref_func_requires_declaration() {
        let mut module = func_module(
            FuncType::default(),
            vec![],
            vec![Instruction::RefFunc(0), Instruction::Drop, Instruction::End],
        );
        assert_eq!(
            first_error(&module),
            ValidationErrorKind::UndeclaredFunctionReference(0)
        );
        module.elements.push(Element {
            ty: RefType::FUNCREF,
            items: ElementItems::Functions(vec![0]),
            mode: ElementMode::Declarative,
        });
        assert!(validate_module(&module).is_empty());
    }

    #[test]
    fn test_ref_func_declared_by_element_expression() {
        let mut module = func_module(
            FuncType::default(),
            vec![],
            vec![Instruction::RefFunc(0), Instruction::Drop, Instruction::End],
        );
        module.elements.push(Element {
            ty: RefType::FUNCREF,
            items: ElementItems::Expressions(vec![
                ConstExpr::new(vec![Instruction::RefNull(HeapType::Func)]),
                ConstExpr::new(vec![Instruction::RefFunc(0)]),
            ]),
            mode: ElementMode::Passive,
        });
        assert!(validate_module(&module).is_empty());
    }

    #[test]
    fn test_non_nullable_local_needs_init() {
        let non_null = ValType::Ref(RefType::new(false, HeapType::Concrete(0)));
        let mut module = func_module(
            FuncType::default(),
            vec![(1, non_null)],
            vec![Instruction::LocalGet(0), Instruction::Drop, Instruction::End],
        );
        assert_eq!(first_error(&module), ValidationErrorKind::UninitializedLocal(0));

        module.exports.push(Export {
            name: "f".to_string(),
            kind: ExportKind::Function,
            index: 0,
        });
        module.code[0].instructions = vec![
            Instruction::Block(BlockType::Empty),
            Instruction::RefFunc(0),
            Instruction::LocalSet(0),
            Instruction::End,
            // The initialisation does not outlive the block.
            Instruction::LocalGet(0),
            Instruction::Drop,
            Instruction::End,
        ];
        assert_eq!(first_error(&module), ValidationErrorKind::UninitializedLocal(0));
    }

    #[test]
    fn test_data_count_required() {
        let mut module = func_module(
            FuncType::default(),
            vec![],
            vec![Instruction::DataDrop(0), Instruction::End],
        );
        module.data.push(DataSegment {
            mode: DataMode::Passive,
            data: vec![1],
        });
        assert_eq!(first_error(&module), ValidationErrorKind::DataCountRequired);
        module.data_count = Some(1);
        assert!(validate_module(&module).is_empty());
    }

    #[test]
    fn test_memory_limits() {
        let mut module = Module::empty();
        module.memories.push(MemoryType {
            limits: Limits::new(65537, None),
            shared: false,
        });
        assert_eq!(first_error(&module), ValidationErrorKind::MemoryTooLarge);

        module.memories[0].limits = Limits::new(2, Some(1));
        assert_eq!(first_error(&module), ValidationErrorKind::InvalidLimits);
    }

    #[test]
    fn test_multiple_memories_gated() {
        let mut module = Module::empty();
        let mem = MemoryType {
            limits: Limits::new(1, None),
            shared: false,
        };
        module.memories.push(mem);
        module.memories.push(mem);
        assert!(validate(&module).is_ok());
        let diags = validate_with_features(&module, Features::default() - Features::MULTI_MEMORY)
            .unwrap_err();
        assert_eq!(diags.errors[0].kind, ValidationErrorKind::MultipleMemories);
    }

    #[test]
    fn test_alignment_checked() {
        let mut module = func_module(
            FuncType::default(),
            vec![],
            vec![
                Instruction::I32Const(0),
                Instruction::I32Load8U(MemArg::new(1, 0)),
                Instruction::Drop,
                Instruction::End,
            ],
        );
        module.memories.push(MemoryType {
            limits: Limits::new(1, None),
            shared: false,
        });
        assert_eq!(first_error(&module), ValidationErrorKind::AlignmentTooLarge);
    }

    #[test]
    fn test_global_init_sees_only_earlier_immutable_globals() {
        let mut module = Module::empty();
        module.imports.push(Import {
            module: "env".to_string(),
            name: "g".to_string(),
            kind: ImportKind::Global(GlobalType {
                content: ValType::I32,
                mutable: false,
            }),
        });
        module.globals.push(Global {
            ty: GlobalType {
                content: ValType::I32,
                mutable: false,
            },
            init: ConstExpr::new(vec![
                Instruction::GlobalGet(0),
                Instruction::I32Const(1),
                Instruction::I32Add,
            ]),
        });
        assert!(validate_module(&module).is_empty());

        module.globals.push(Global {
            ty: GlobalType {
                content: ValType::I32,
                mutable: false,
            },
            init: ConstExpr::new(vec![Instruction::GlobalGet(2)]),
        });
        assert_eq!(first_error(&module), ValidationErrorKind::UnknownGlobal(2));
    }

    #[test]
    fn test_const_expr_rejects_non_constant() {
        let mut module = Module::empty();
        module.globals.push(Global {
            ty: GlobalType {
                content: ValType::I32,
                mutable: false,
            },
            init: ConstExpr::new(vec![Instruction::I32Const(1), Instruction::I32Eqz]),
        });
        assert_eq!(
            first_error(&module),
            ValidationErrorKind::ConstantExpressionRequired
        );
    }

    #[test]
    fn test_duplicate_exports_and_start_type() {
        let mut module = func_module(
            FuncType::new(vec![ValType::I32], vec![]),
            vec![],
            vec![Instruction::End],
        );
        for _ in 0..2 {
            module.exports.push(Export {
                name: "f".to_string(),
                kind: ExportKind::Function,
                index: 0,
            });
        }
        module.start = Some(0);
        let diags = validate_module(&module);
        assert_eq!(diags.len(), 2);
        assert_eq!(
            diags.errors[0].kind,
            ValidationErrorKind::DuplicateExport("f".to_string())
        );
        assert_eq!(diags.errors[1].kind, ValidationErrorKind::InvalidStartFunction);
    }

    #[test]
    fn test_errors_collected_across_functions() {
        let mut module = func_module(
            FuncType::default(),
            vec![],
            vec![Instruction::I32Add, Instruction::End],
        );
        module.functions.push(0);
        module.code.push(FunctionBody {
            locals: vec![],
            instructions: vec![Instruction::LocalGet(3), Instruction::End],
        });
        let diags = validate_module(&module);
        assert_eq!(diags.len(), 2);
        assert_eq!(diags.errors[0].kind, ValidationErrorKind::StackUnderflow);
        assert_eq!(diags.errors[1].kind, ValidationErrorKind::UnknownLocal(3));
    }

    #[test]
    fn test_br_table_arity_mismatch() {
        let module = func_module(
            FuncType::default(),
            vec![],
            vec![
                Instruction::Block(BlockType::Value(ValType::I32)),
                Instruction::I32Const(0),
                Instruction::I32Const(0),
                Instruction::BrTable(vec![1], 0),
                Instruction::End,
                Instruction::Drop,
                Instruction::End,
            ],
        );
        assert!(matches!(
            first_error(&module),
            ValidationErrorKind::InvalidOperands(_)
        ));
    }

    #[test]
    fn test_tail_call_result_check() {
        let mut module = func_module(
            FuncType::new(vec![], vec![ValType::I32]),
            vec![],
            vec![Instruction::ReturnCall(1), Instruction::End],
        );
        module.types.push(SubType::func(FuncType::new(vec![], vec![ValType::I64])));
        module.functions.push(1);
        module.code.push(FunctionBody {
            locals: vec![],
            instructions: vec![Instruction::I64Const(0), Instruction::End],
        });
        assert!(matches!(
            first_error(&module),
            ValidationErrorKind::InvalidOperands(_)
        ));
    }
}
