//! WebAssembly type system.
//!
//! Value and heap type lattice, subtyping, and result type matching.
//! Concrete (indexed) heap types are resolved through a module's type space,
//! which is the module's list of [`SubType`]s in type-index order.
//!
//! Reference: <https://webassembly.github.io/spec/core/valid/matching.html>

use alloc::vec::Vec;
use core::fmt;

// ============================================================================
// Value Types
// ============================================================================

/// Heap types: the abstract lattice plus concrete type indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapType {
    Func,
    Extern,
    Any,
    Eq,
    I31,
    Struct,
    Array,
    /// Bottom of the `any` hierarchy.
    None,
    /// Bottom of the `func` hierarchy.
    NoFunc,
    /// Bottom of the `extern` hierarchy.
    NoExtern,
    /// A type defined in the module's type section.
    Concrete(u32),
}

/// A reference type: nullability plus heap type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RefType {
    pub nullable: bool,
    pub heap: HeapType,
}

impl RefType {
    /// `funcref`, i.e. `(ref null func)`.
    pub const FUNCREF: RefType = RefType::new(true, HeapType::Func);
    /// `externref`, i.e. `(ref null extern)`.
    pub const EXTERNREF: RefType = RefType::new(true, HeapType::Extern);

    pub const fn new(nullable: bool, heap: HeapType) -> Self {
        RefType { nullable, heap }
    }

    /// The same heap type without the null value.
    pub const fn as_non_null(self) -> Self {
        RefType::new(false, self.heap)
    }
}

impl fmt::Display for RefType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.nullable, self.heap) {
            (true, HeapType::Func) => f.write_str("funcref"),
            (true, HeapType::Extern) => f.write_str("externref"),
            (true, HeapType::Any) => f.write_str("anyref"),
            (true, HeapType::Eq) => f.write_str("eqref"),
            (true, HeapType::I31) => f.write_str("i31ref"),
            (true, HeapType::Struct) => f.write_str("structref"),
            (true, HeapType::Array) => f.write_str("arrayref"),
            (true, HeapType::None) => f.write_str("nullref"),
            (true, HeapType::NoFunc) => f.write_str("nullfuncref"),
            (true, HeapType::NoExtern) => f.write_str("nullexternref"),
            (nullable, heap) => {
                f.write_str(if nullable { "(ref null " } else { "(ref " })?;
                write!(f, "{})", heap)
            }
        }
    }
}

impl fmt::Display for HeapType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeapType::Func => f.write_str("func"),
            HeapType::Extern => f.write_str("extern"),
            HeapType::Any => f.write_str("any"),
            HeapType::Eq => f.write_str("eq"),
            HeapType::I31 => f.write_str("i31"),
            HeapType::Struct => f.write_str("struct"),
            HeapType::Array => f.write_str("array"),
            HeapType::None => f.write_str("none"),
            HeapType::NoFunc => f.write_str("nofunc"),
            HeapType::NoExtern => f.write_str("noextern"),
            HeapType::Concrete(idx) => write!(f, "{}", idx),
        }
    }
}

/// Value types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValType {
    I32,
    I64,
    F32,
    F64,
    V128,
    Ref(RefType),
}

impl ValType {
    pub const FUNCREF: ValType = ValType::Ref(RefType::FUNCREF);
    pub const EXTERNREF: ValType = ValType::Ref(RefType::EXTERNREF);

    /// Numeric or vector type.
    pub fn is_num(&self) -> bool {
        !self.is_ref()
    }

    pub fn is_ref(&self) -> bool {
        matches!(self, ValType::Ref(_))
    }

    /// Whether locals of this type have a default (zero or null) value.
    pub fn is_defaultable(&self) -> bool {
        match self {
            ValType::Ref(rt) => rt.nullable,
            _ => true,
        }
    }
}

impl fmt::Display for ValType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValType::I32 => f.write_str("i32"),
            ValType::I64 => f.write_str("i64"),
            ValType::F32 => f.write_str("f32"),
            ValType::F64 => f.write_str("f64"),
            ValType::V128 => f.write_str("v128"),
            ValType::Ref(rt) => write!(f, "{}", rt),
        }
    }
}

/// Formats a result type as `[i32 i64]`.
pub struct DisplayResult<'a>(pub &'a [ValType]);

impl fmt::Display for DisplayResult<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, ty) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}", ty)?;
        }
        f.write_str("]")
    }
}

/// Operand type tracked by the validator.
///
/// `Unknown` only appears on the polymorphic stack of unreachable code and
/// matches every type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaybeType {
    Known(ValType),
    Unknown,
}

impl From<ValType> for MaybeType {
    fn from(ty: ValType) -> Self {
        MaybeType::Known(ty)
    }
}

impl fmt::Display for MaybeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaybeType::Known(ty) => write!(f, "{}", ty),
            MaybeType::Unknown => f.write_str("_"),
        }
    }
}

// ============================================================================
// Composite and Defined Types
// ============================================================================

/// Function type (signature).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct FuncType {
    /// Parameter types.
    pub params: Vec<ValType>,
    /// Return types.
    pub results: Vec<ValType>,
}

impl FuncType {
    pub fn new(
        params: impl IntoIterator<Item = ValType>,
        results: impl IntoIterator<Item = ValType>,
    ) -> Self {
        FuncType {
            params: params.into_iter().collect(),
            results: results.into_iter().collect(),
        }
    }
}

impl fmt::Display for FuncType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {}",
            DisplayResult(&self.params),
            DisplayResult(&self.results)
        )
    }
}

/// Storage type of a struct or array field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageType {
    I8,
    I16,
    Val(ValType),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldType {
    pub storage: StorageType,
    pub mutable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct StructType {
    pub fields: Vec<FieldType>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArrayType {
    pub field: FieldType,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CompositeType {
    Func(FuncType),
    Struct(StructType),
    Array(ArrayType),
}

/// An entry of the type section.
///
/// Recursion groups are flattened into consecutive entries; each entry keeps
/// at most one declared supertype.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubType {
    pub is_final: bool,
    pub supertype: Option<u32>,
    pub composite: CompositeType,
}

impl SubType {
    /// A final function type without supertype (the MVP `functype`).
    pub fn func(ty: FuncType) -> Self {
        SubType {
            is_final: true,
            supertype: None,
            composite: CompositeType::Func(ty),
        }
    }

    pub fn as_func(&self) -> Option<&FuncType> {
        match &self.composite {
            CompositeType::Func(ft) => Some(ft),
            _ => None,
        }
    }
}

// ============================================================================
// Entity Types
// ============================================================================

/// Size limits of a table or memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Limits {
    pub min: u32,
    pub max: Option<u32>,
}

impl Limits {
    pub const fn new(min: u32, max: Option<u32>) -> Self {
        Limits { min, max }
    }

    /// `min <= max <= bound`.
    pub fn is_valid(&self, bound: u64) -> bool {
        let within = |v: u32| u64::from(v) <= bound;
        match self.max {
            Some(max) => self.min <= max && within(max) && within(self.min),
            None => within(self.min),
        }
    }

    /// Import matching: `self` (the provided limits) is a subrange of `expected`.
    pub fn matches(&self, expected: &Limits) -> bool {
        if self.min < expected.min {
            return false;
        }
        match (self.max, expected.max) {
            (_, None) => true,
            (Some(actual), Some(expected)) => actual <= expected,
            (None, Some(_)) => false,
        }
    }
}

/// Table type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TableType {
    /// Element type.
    pub element: RefType,
    pub limits: Limits,
}

/// Memory type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryType {
    /// Limits in 64 KiB pages.
    pub limits: Limits,
    /// Is shared memory (for threads).
    pub shared: bool,
}

/// Global type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GlobalType {
    pub content: ValType,
    pub mutable: bool,
}

/// Type of an importable or exportable entity.
#[derive(Debug, Clone, PartialEq)]
pub enum ExternType {
    Func(FuncType),
    Table(TableType),
    Memory(MemoryType),
    Global(GlobalType),
}

/// Block type for structured control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockType {
    /// No value (void).
    Empty,
    /// Single value type.
    Value(ValType),
    /// Type index for multi-value.
    TypeIndex(u32),
}

// ============================================================================
// Type Space
// ============================================================================

/// A module's type space: resolves concrete heap types and decides subtyping.
#[derive(Debug, Clone, Copy)]
pub struct TypeSpace<'a> {
    types: &'a [SubType],
}

impl<'a> TypeSpace<'a> {
    pub fn new(types: &'a [SubType]) -> Self {
        TypeSpace { types }
    }

    /// The empty type space used for host-defined types.
    pub fn empty() -> TypeSpace<'static> {
        TypeSpace { types: &[] }
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn get(&self, idx: u32) -> Option<&'a SubType> {
        self.types.get(idx as usize)
    }

    pub fn func_type(&self, idx: u32) -> Option<&'a FuncType> {
        self.get(idx)?.as_func()
    }

    /// Expand a block type into its function type.
    pub fn resolve_block_type(&self, bt: &BlockType) -> Option<FuncType> {
        match bt {
            BlockType::Empty => Some(FuncType::default()),
            BlockType::Value(ty) => Some(FuncType::new(Vec::new(), alloc::vec![*ty])),
            BlockType::TypeIndex(idx) => self.func_type(*idx).cloned(),
        }
    }

    /// `a <: b` for value types.
    pub fn is_subtype(&self, a: ValType, b: ValType) -> bool {
        match (a, b) {
            (ValType::Ref(a), ValType::Ref(b)) => self.is_ref_subtype(a, b),
            (a, b) => a == b,
        }
    }

    /// `a <: b` for operand types; `Unknown` matches everything.
    pub fn is_maybe_subtype(&self, a: MaybeType, b: MaybeType) -> bool {
        match (a, b) {
            (MaybeType::Known(a), MaybeType::Known(b)) => self.is_subtype(a, b),
            _ => true,
        }
    }

    pub fn is_ref_subtype(&self, a: RefType, b: RefType) -> bool {
        (!a.nullable || b.nullable) && self.is_heap_subtype(a.heap, b.heap)
    }

    pub fn is_heap_subtype(&self, a: HeapType, b: HeapType) -> bool {
        use HeapType::*;
        if a == b {
            return true;
        }
        match (a, b) {
            (None, b) => self.top_of(b) == Any,
            (NoFunc, b) => self.top_of(b) == Func,
            (NoExtern, b) => self.top_of(b) == Extern,
            (I31 | Struct | Array, Eq | Any) => true,
            (Eq, Any) => true,
            (Concrete(i), Concrete(j)) => self.concrete_subtype(i, j),
            (Concrete(i), b) => match self.get(i).map(|t| &t.composite) {
                Some(CompositeType::Func(_)) => b == Func,
                Some(CompositeType::Struct(_)) => matches!(b, Struct | Eq | Any),
                Some(CompositeType::Array(_)) => matches!(b, Array | Eq | Any),
                Option::None => false,
            },
            _ => false,
        }
    }

    /// Pointwise subtyping of two result types of equal arity.
    pub fn matches(&self, a: &[ValType], b: &[ValType]) -> bool {
        a.len() == b.len() && a.iter().zip(b).all(|(a, b)| self.is_subtype(*a, *b))
    }

    /// Top of the hierarchy a heap type belongs to (`any`, `func` or `extern`).
    pub fn top_of(&self, heap: HeapType) -> HeapType {
        use HeapType::*;
        match heap {
            Func | NoFunc => Func,
            Extern | NoExtern => Extern,
            Any | Eq | I31 | Struct | Array | None => Any,
            Concrete(idx) => match self.get(idx).map(|t| &t.composite) {
                Some(CompositeType::Func(_)) => Func,
                _ => Any,
            },
        }
    }

    /// Declared-supertype chain walk, with structural equivalence at each step.
    fn concrete_subtype(&self, sub: u32, sup: u32) -> bool {
        let mut current = Some(sub);
        let mut steps = 0;
        while let Some(idx) = current {
            if equivalent_types(*self, idx, *self, sup) {
                return true;
            }
            steps += 1;
            if steps > self.types.len() {
                return false;
            }
            current = self.get(idx).and_then(|t| t.supertype);
        }
        false
    }

    /// Whether `sub` is a valid declared subtype of `sup` (structurally).
    pub fn composite_matches(&self, sub: &CompositeType, sup: &CompositeType) -> bool {
        match (sub, sup) {
            (CompositeType::Func(a), CompositeType::Func(b)) => {
                self.matches(&b.params, &a.params) && self.matches(&a.results, &b.results)
            }
            (CompositeType::Struct(a), CompositeType::Struct(b)) => {
                a.fields.len() >= b.fields.len()
                    && a.fields.iter().zip(&b.fields).all(|(a, b)| self.field_matches(a, b))
            }
            (CompositeType::Array(a), CompositeType::Array(b)) => {
                self.field_matches(&a.field, &b.field)
            }
            _ => false,
        }
    }

    fn field_matches(&self, sub: &FieldType, sup: &FieldType) -> bool {
        if sub.mutable != sup.mutable {
            return false;
        }
        match (sub.storage, sup.storage) {
            (StorageType::Val(a), StorageType::Val(b)) => {
                if sub.mutable {
                    self.is_subtype(a, b) && self.is_subtype(b, a)
                } else {
                    self.is_subtype(a, b)
                }
            }
            (a, b) => a == b,
        }
    }
}

// ============================================================================
// Structural Equivalence
// ============================================================================

/// Structural equivalence of two defined types, possibly from different type
/// spaces (used when matching imports and checking indirect calls across
/// module instances).
pub fn equivalent_types(a: TypeSpace<'_>, a_idx: u32, b: TypeSpace<'_>, b_idx: u32) -> bool {
    Equivalence {
        a,
        b,
        assumed: Vec::new(),
    }
    .defined(a_idx, b_idx)
}

/// Structural equivalence of two function types from (possibly) different
/// type spaces.
pub fn equivalent_func_types(
    a: &FuncType,
    a_space: TypeSpace<'_>,
    b: &FuncType,
    b_space: TypeSpace<'_>,
) -> bool {
    Equivalence {
        a: a_space,
        b: b_space,
        assumed: Vec::new(),
    }
    .func(a, b)
}

/// Structural equivalence of two value types from (possibly) different type spaces.
pub fn equivalent_val_types(
    a: ValType,
    a_space: TypeSpace<'_>,
    b: ValType,
    b_space: TypeSpace<'_>,
) -> bool {
    Equivalence {
        a: a_space,
        b: b_space,
        assumed: Vec::new(),
    }
    .val(a, b)
}

/// Coinductive equivalence check; `assumed` holds the index pairs currently
/// being compared so recursive types terminate.
struct Equivalence<'a> {
    a: TypeSpace<'a>,
    b: TypeSpace<'a>,
    assumed: Vec<(u32, u32)>,
}

impl Equivalence<'_> {
    fn defined(&mut self, i: u32, j: u32) -> bool {
        if self.assumed.contains(&(i, j)) {
            return true;
        }
        let (Some(ta), Some(tb)) = (self.a.get(i), self.b.get(j)) else {
            return false;
        };
        if ta.is_final != tb.is_final {
            return false;
        }
        self.assumed.push((i, j));
        let supers = match (ta.supertype, tb.supertype) {
            (None, None) => true,
            (Some(si), Some(sj)) => self.defined(si, sj),
            _ => false,
        };
        let result = supers && self.composite(&ta.composite, &tb.composite);
        self.assumed.pop();
        result
    }

    fn composite(&mut self, a: &CompositeType, b: &CompositeType) -> bool {
        match (a, b) {
            (CompositeType::Func(a), CompositeType::Func(b)) => self.func(a, b),
            (CompositeType::Struct(a), CompositeType::Struct(b)) => {
                a.fields.len() == b.fields.len()
                    && a.fields.iter().zip(&b.fields).all(|(x, y)| self.field(x, y))
            }
            (CompositeType::Array(a), CompositeType::Array(b)) => self.field(&a.field, &b.field),
            _ => false,
        }
    }

    fn func(&mut self, a: &FuncType, b: &FuncType) -> bool {
        a.params.len() == b.params.len()
            && a.results.len() == b.results.len()
            && a.params.iter().zip(&b.params).all(|(x, y)| self.val(*x, *y))
            && a.results.iter().zip(&b.results).all(|(x, y)| self.val(*x, *y))
    }

    fn field(&mut self, a: &FieldType, b: &FieldType) -> bool {
        a.mutable == b.mutable
            && match (a.storage, b.storage) {
                (StorageType::Val(x), StorageType::Val(y)) => self.val(x, y),
                (x, y) => x == y,
            }
    }

    fn val(&mut self, a: ValType, b: ValType) -> bool {
        match (a, b) {
            (ValType::Ref(x), ValType::Ref(y)) => {
                x.nullable == y.nullable
                    && match (x.heap, y.heap) {
                        (HeapType::Concrete(i), HeapType::Concrete(j)) => self.defined(i, j),
                        (x, y) => x == y,
                    }
            }
            (a, b) => a == b,
        }
    }
}
