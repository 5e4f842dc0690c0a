//! Decoded WASM module.
//!
//! The [`Module`] AST produced by the parser and consumed by the validator
//! and linker. A module is immutable once decoded.

use alloc::string::String;
use alloc::vec::Vec;

use crate::opcodes::Instruction;
use crate::types::{FuncType, GlobalType, MemoryType, RefType, SubType, TableType, TypeSpace, ValType};

/// A parsed WASM module containing all sections.
#[derive(Debug, Clone, Default)]
pub struct Module {
    /// Type section, recursion groups flattened.
    pub types: Vec<SubType>,
    /// Import section: external imports.
    pub imports: Vec<Import>,
    /// Function section: type index per function body.
    pub functions: Vec<u32>,
    /// Table section: table definitions.
    pub tables: Vec<Table>,
    /// Memory section: memory definitions.
    pub memories: Vec<MemoryType>,
    /// Global section: global variable definitions.
    pub globals: Vec<Global>,
    /// Export section: exported items.
    pub exports: Vec<Export>,
    /// Start section: optional start function index.
    pub start: Option<u32>,
    /// Element section: table initialization segments.
    pub elements: Vec<Element>,
    /// Code section: function bodies.
    pub code: Vec<FunctionBody>,
    /// Data section: memory initialization segments.
    pub data: Vec<DataSegment>,
    /// Module name (from custom "name" section).
    pub name: Option<String>,
    /// Data count section (for validation).
    pub data_count: Option<u32>,
    /// Custom sections, kept only when the parser is asked to.
    pub custom_sections: Vec<CustomSection>,
}

impl Module {
    /// Create an empty module (useful for testing).
    pub fn empty() -> Self {
        Self::default()
    }

    /// Get the module name.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn type_space(&self) -> TypeSpace<'_> {
        TypeSpace::new(&self.types)
    }

    /// Type index of a function (imports first, then module-defined).
    pub fn func_type_index(&self, func_idx: u32) -> Option<u32> {
        let imported = self.imported_funcs().nth(func_idx as usize);
        match imported {
            Some(type_idx) => Some(type_idx),
            None => {
                let local_idx = (func_idx as usize).checked_sub(self.import_function_count())?;
                self.functions.get(local_idx).copied()
            }
        }
    }

    pub fn table_type(&self, idx: u32) -> Option<TableType> {
        self.imports
            .iter()
            .filter_map(|i| match i.kind {
                ImportKind::Table(t) => Some(t),
                _ => None,
            })
            .chain(self.tables.iter().map(|t| t.ty))
            .nth(idx as usize)
    }

    pub fn memory_type(&self, idx: u32) -> Option<MemoryType> {
        self.imports
            .iter()
            .filter_map(|i| match i.kind {
                ImportKind::Memory(m) => Some(m),
                _ => None,
            })
            .chain(self.memories.iter().copied())
            .nth(idx as usize)
    }

    pub fn global_type(&self, idx: u32) -> Option<GlobalType> {
        self.imports
            .iter()
            .filter_map(|i| match i.kind {
                ImportKind::Global(g) => Some(g),
                _ => None,
            })
            .chain(self.globals.iter().map(|g| g.ty))
            .nth(idx as usize)
    }

    fn imported_funcs(&self) -> impl Iterator<Item = u32> + '_ {
        self.imports.iter().filter_map(|i| match i.kind {
            ImportKind::Function(type_idx) => Some(type_idx),
            _ => None,
        })
    }

    /// Count the number of imported functions.
    pub fn import_function_count(&self) -> usize {
        self.imported_funcs().count()
    }

    pub fn import_table_count(&self) -> usize {
        self.imports
            .iter()
            .filter(|i| matches!(i.kind, ImportKind::Table(_)))
            .count()
    }

    pub fn import_memory_count(&self) -> usize {
        self.imports
            .iter()
            .filter(|i| matches!(i.kind, ImportKind::Memory(_)))
            .count()
    }

    pub fn import_global_count(&self) -> usize {
        self.imports
            .iter()
            .filter(|i| matches!(i.kind, ImportKind::Global(_)))
            .count()
    }

    /// Count total functions (imports + local).
    pub fn total_function_count(&self) -> usize {
        self.import_function_count() + self.functions.len()
    }

    pub fn total_table_count(&self) -> usize {
        self.import_table_count() + self.tables.len()
    }

    pub fn total_memory_count(&self) -> usize {
        self.import_memory_count() + self.memories.len()
    }

    pub fn total_global_count(&self) -> usize {
        self.import_global_count() + self.globals.len()
    }
}

/// An exported function or value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Export {
    /// Export name.
    pub name: String,
    /// Export kind.
    pub kind: ExportKind,
    /// Index in the respective index space.
    pub index: u32,
}

/// Export kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExportKind {
    Function,
    Table,
    Memory,
    Global,
}

/// An imported function or value.
#[derive(Debug, Clone, PartialEq)]
pub struct Import {
    /// Module name.
    pub module: String,
    /// Import name.
    pub name: String,
    /// Import kind.
    pub kind: ImportKind,
}

/// Import kinds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ImportKind {
    /// Imported function (type index).
    Function(u32),
    Table(TableType),
    Memory(MemoryType),
    Global(GlobalType),
}

/// A constant expression (global/table initialisers, segment offsets).
///
/// The terminating `end` is not stored.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConstExpr(pub Vec<Instruction>);

impl ConstExpr {
    pub fn new(instructions: Vec<Instruction>) -> Self {
        ConstExpr(instructions)
    }

    pub fn i32(value: i32) -> Self {
        ConstExpr(alloc::vec![Instruction::I32Const(value)])
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.0
    }
}

/// Table definition with an optional initialiser for every slot.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    pub ty: TableType,
    /// Initial element value; `ref.null` of the element type when absent.
    pub init: Option<ConstExpr>,
}

/// Global variable definition (type + init expression).
#[derive(Debug, Clone, PartialEq)]
pub struct Global {
    pub ty: GlobalType,
    pub init: ConstExpr,
}

/// Element segment for table initialization.
#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    /// Reference type of the items.
    pub ty: RefType,
    pub items: ElementItems,
    pub mode: ElementMode,
}

impl Element {
    pub fn len(&self) -> usize {
        match &self.items {
            ElementItems::Functions(funcs) => funcs.len(),
            ElementItems::Expressions(exprs) => exprs.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ElementItems {
    /// Function indices (`funcref` shorthand encodings).
    Functions(Vec<u32>),
    /// One constant expression per item.
    Expressions(Vec<ConstExpr>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ElementMode {
    /// Written into `table` at `offset` during instantiation.
    Active { table: u32, offset: ConstExpr },
    /// Kept for `table.init`.
    Passive,
    /// Only forward-declares function references.
    Declarative,
}

/// Function body (locals + instructions).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FunctionBody {
    /// Local variable declarations: (count, type).
    pub locals: Vec<(u32, ValType)>,
    /// Decoded instructions, including the final `end`.
    pub instructions: Vec<Instruction>,
}

impl FunctionBody {
    /// Get the total number of declared local variables (excluding params).
    pub fn local_count(&self) -> u64 {
        self.locals.iter().map(|(count, _)| u64::from(*count)).sum()
    }

    /// Get the type of a declared local variable by index (excluding params).
    pub fn local_type(&self, idx: u32) -> Option<ValType> {
        let mut offset = 0u64;
        for &(count, vtype) in &self.locals {
            if u64::from(idx) < offset + u64::from(count) {
                return Some(vtype);
            }
            offset += u64::from(count);
        }
        None
    }

    /// Expanded declared locals, one entry per local.
    pub fn expanded_locals(&self) -> impl Iterator<Item = ValType> + '_ {
        self.locals
            .iter()
            .flat_map(|&(count, ty)| core::iter::repeat(ty).take(count as usize))
    }
}

/// Data segment for memory initialization.
#[derive(Debug, Clone, PartialEq)]
pub struct DataSegment {
    pub mode: DataMode,
    /// Segment data bytes.
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DataMode {
    Active { memory: u32, offset: ConstExpr },
    Passive,
}

/// A custom section retained verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomSection {
    pub name: String,
    pub data: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Limits;
    use alloc::string::ToString;
    use alloc::vec;

    fn sample() -> Module {
        let mut module = Module::empty();
        module.types.push(SubType::func(FuncType::new(vec![], vec![ValType::I32])));
        module.types.push(SubType::func(FuncType::new(vec![ValType::I64], vec![])));
        module.imports.push(Import {
            module: "env".to_string(),
            name: "log".to_string(),
            kind: ImportKind::Function(1),
        });
        module.imports.push(Import {
            module: "env".to_string(),
            name: "g".to_string(),
            kind: ImportKind::Global(GlobalType {
                content: ValType::I32,
                mutable: false,
            }),
        });
        module.functions.push(0);
        module.globals.push(Global {
            ty: GlobalType {
                content: ValType::F64,
                mutable: true,
            },
            init: ConstExpr::new(vec![Instruction::F64Const(0.0)]),
        });
        module.memories.push(MemoryType {
            limits: Limits::new(1, None),
            shared: false,
        });
        module
    }

    #[test]
    fn test_index_spaces_put_imports_first() {
        let module = sample();
        assert_eq!(module.total_function_count(), 2);
        assert_eq!(module.func_type_index(0), Some(1));
        assert_eq!(module.func_type_index(1), Some(0));
        assert_eq!(module.func_type_index(2), None);
        assert_eq!(module.global_type(0).map(|g| g.content), Some(ValType::I32));
        assert_eq!(module.global_type(1).map(|g| g.content), Some(ValType::F64));
        assert_eq!(module.memory_type(0).map(|m| m.limits.min), Some(1));
        assert_eq!(module.table_type(0), None);
    }

    #[test]
    fn test_local_types() {
        let body = FunctionBody {
            locals: vec![(2, ValType::I32), (1, ValType::F32)],
            instructions: vec![Instruction::End],
        };
        assert_eq!(body.local_count(), 3);
        assert_eq!(body.local_type(1), Some(ValType::I32));
        assert_eq!(body.local_type(2), Some(ValType::F32));
        assert_eq!(body.local_type(3), None);
        assert_eq!(body.expanded_locals().count(), 3);
    }
}
