//! Import resolution and module instantiation.
//!
//! A [`Linker`] is the import object: a table of external values keyed by
//! `(module, name)`. [`Linker::instantiate`] validates a module, resolves its
//! imports against that table, allocates its definitions in a [`Store`],
//! applies active segments and runs the start function.

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

use futures_util::future::BoxFuture;
use hashbrown::HashMap;
use thiserror::Error;

use crate::code::{self, CompileError};
use crate::const_eval::{self, ConstContext};
use crate::executor;
use crate::fusion;
use crate::host::{Caller, HostFunc};
use crate::interpreter::{Ref, Trap, Value};
use crate::memory::LinearMemory;
use crate::module::{DataMode, ElementItems, ElementMode, ExportKind, ImportKind, Module};
use crate::store::{
    DataInstance, ElemInstance, ExternVal, FuncAddr, FuncInstance, GlobalAddr, GlobalInstance,
    InstanceAddr, MemAddr, ModuleInstance, Store, TableAddr, TableInstance,
};
use crate::types::{
    equivalent_func_types, equivalent_val_types, ExternType, FuncType, GlobalType, TypeSpace,
    ValType,
};
use crate::validator;
use crate::{Error, RuntimeConfig};

// ============================================================================
// Errors
// ============================================================================

/// The module cannot be linked; nothing has run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("unknown import {module}.{name}")]
    UnknownImport { module: String, name: String },
    #[error("incompatible import type for {module}.{name}: expected {expected}, found {found}")]
    IncompatibleImportType {
        module: String,
        name: String,
        expected: String,
        found: String,
    },
    #[error("unknown instance {0}")]
    UnknownInstance(u32),
}

/// Instantiation failed after the store was modified.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InstantiationError {
    #[error("out of bounds table access in element segment {0}")]
    ElementOutOfBounds(u32),
    #[error("out of bounds memory access in data segment {0}")]
    DataOutOfBounds(u32),
    #[error("start function: {0}")]
    StartTrap(Trap),
    #[error("{0} exceeds the configured limit")]
    ResourceLimit(&'static str),
    #[error("initializer: {0}")]
    Initializer(Trap),
    #[error(transparent)]
    Compile(#[from] CompileError),
}

// ============================================================================
// Linker
// ============================================================================

/// Import object: external values by `(module, name)`.
#[derive(Debug, Clone, Default)]
pub struct Linker {
    defs: HashMap<(String, String), ExternVal>,
}

impl Linker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an existing external value. Replaces any earlier definition.
    pub fn define(&mut self, module: &str, name: &str, val: ExternVal) {
        self.defs
            .insert((module.to_string(), name.to_string()), val);
    }

    pub fn get(&self, module: &str, name: &str) -> Option<ExternVal> {
        self.defs
            .get(&(module.to_string(), name.to_string()))
            .copied()
    }

    /// Allocate a synchronous host function and register it.
    pub fn define_func<F>(
        &mut self,
        store: &mut Store,
        module: &str,
        name: &str,
        ty: FuncType,
        func: F,
    ) -> FuncAddr
    where
        F: Fn(Caller<'_>, &[Value]) -> Result<Vec<Value>, Trap> + Send + Sync + 'static,
    {
        self.define_host(store, module, name, ty, HostFunc::from_fn(func))
    }

    /// Allocate an asynchronous host function and register it. Only
    /// [`executor::invoke_async`] can call it.
    pub fn define_async_func<F>(
        &mut self,
        store: &mut Store,
        module: &str,
        name: &str,
        ty: FuncType,
        func: F,
    ) -> FuncAddr
    where
        F: for<'a> Fn(Caller<'a>, Vec<Value>) -> BoxFuture<'a, Result<Vec<Value>, Trap>>
            + Send
            + Sync
            + 'static,
    {
        self.define_host(store, module, name, ty, HostFunc::from_async(func))
    }

    fn define_host(
        &mut self,
        store: &mut Store,
        module: &str,
        name: &str,
        ty: FuncType,
        func: HostFunc,
    ) -> FuncAddr {
        let addr = store.alloc_func(FuncInstance::Host { ty, func });
        self.define(module, name, ExternVal::Func(addr));
        addr
    }

    /// Allocate a host global. The value must have the global's type.
    pub fn define_global(
        &mut self,
        store: &mut Store,
        module: &str,
        name: &str,
        ty: GlobalType,
        value: Value,
    ) -> Result<GlobalAddr, LinkError> {
        if !store.value_matches(&value, ty.content, TypeSpace::empty()) {
            return Err(LinkError::IncompatibleImportType {
                module: module.to_string(),
                name: name.to_string(),
                expected: ty.content.to_string(),
                found: value.to_string(),
            });
        }
        let addr = store.alloc_global(GlobalInstance { ty, value });
        self.define(module, name, ExternVal::Global(addr));
        Ok(addr)
    }

    pub fn define_table(
        &mut self,
        store: &mut Store,
        module: &str,
        name: &str,
        table: TableInstance,
    ) -> TableAddr {
        let addr = store.alloc_table(table);
        self.define(module, name, ExternVal::Table(addr));
        addr
    }

    pub fn define_memory(
        &mut self,
        store: &mut Store,
        module: &str,
        name: &str,
        memory: LinearMemory,
    ) -> MemAddr {
        let addr = store.alloc_memory(memory);
        self.define(module, name, ExternVal::Memory(addr));
        addr
    }

    /// Register every export of `instance` under `module`.
    pub fn define_instance(
        &mut self,
        store: &Store,
        module: &str,
        instance: InstanceAddr,
    ) -> Result<(), LinkError> {
        let instance = store
            .instance(instance)
            .ok_or(LinkError::UnknownInstance(instance.0))?;
        for (name, val) in &instance.exports {
            self.define(module, name, *val);
        }
        Ok(())
    }

    // ========================================================================
    // Instantiation
    // ========================================================================

    /// Validate, link and instantiate `module`.
    ///
    /// Order: imports, functions, memories, globals, tables, segment
    /// instances, active element segments, active data segments, start.
    /// A failure after the instance is registered leaves earlier segment
    /// writes in place.
    pub fn instantiate(
        &self,
        store: &mut Store,
        module: Arc<Module>,
        config: &RuntimeConfig,
    ) -> Result<InstanceAddr, Error> {
        let info = validator::validate_with_features(&module, config.features)?;
        let types = module.type_space();

        // Imports
        let mut funcs = Vec::with_capacity(module.total_function_count());
        let mut tables = Vec::with_capacity(module.total_table_count());
        let mut memories = Vec::with_capacity(module.total_memory_count());
        let mut globals = Vec::with_capacity(module.total_global_count());
        for import in &module.imports {
            let val = self
                .get(&import.module, &import.name)
                .ok_or_else(|| LinkError::UnknownImport {
                    module: import.module.clone(),
                    name: import.name.clone(),
                })?;
            if !import_matches(store, types, &import.kind, val) {
                return Err(LinkError::IncompatibleImportType {
                    module: import.module.clone(),
                    name: import.name.clone(),
                    expected: describe_import(types, &import.kind),
                    found: store
                        .extern_type(val)
                        .map_or_else(|| "nothing".to_string(), |ty| describe_extern(&ty)),
                }
                .into());
            }
            match val {
                ExternVal::Func(a) => funcs.push(a),
                ExternVal::Table(a) => tables.push(a),
                ExternVal::Memory(a) => memories.push(a),
                ExternVal::Global(a) => globals.push(a),
            }
        }
        log::debug!(
            "resolved {} imports for module {}",
            module.imports.len(),
            module.name().unwrap_or("<anonymous>")
        );

        // Functions
        let instance_addr = store.next_instance_addr();
        for (i, func_info) in info.functions.iter().enumerate() {
            let compiled = code::compile(&module, i as u32, func_info)
                .map_err(InstantiationError::from)?;
            let compiled = if config.fusion {
                fusion::fuse(compiled)
            } else {
                compiled
            };
            funcs.push(store.alloc_func(FuncInstance::Wasm {
                instance: instance_addr,
                code: Arc::new(compiled),
            }));
        }
        log::debug!("allocated {} functions", module.functions.len());

        // Memories
        for ty in &module.memories {
            let memory = LinearMemory::new(*ty, config.max_memory_pages)
                .ok_or(InstantiationError::ResourceLimit("memory"))?;
            memories.push(store.alloc_memory(memory));
        }

        // Globals see imported and earlier globals only.
        for global in &module.globals {
            let value = {
                let ctx = ConstContext {
                    store,
                    funcs: &funcs,
                    globals: &globals,
                };
                const_eval::eval(&global.init, &ctx).map_err(InstantiationError::Initializer)?
            };
            globals.push(store.alloc_global(GlobalInstance {
                ty: global.ty,
                value,
            }));
        }
        log::debug!("initialised {} globals", module.globals.len());

        // Tables
        for table in &module.tables {
            let init = match &table.init {
                Some(expr) => {
                    let ctx = ConstContext {
                        store,
                        funcs: &funcs,
                        globals: &globals,
                    };
                    expect_ref(const_eval::eval(expr, &ctx))?
                }
                None => Ref::Null,
            };
            let instance = TableInstance::new(table.ty, init, config.max_table_elements)
                .ok_or(InstantiationError::ResourceLimit("table"))?;
            tables.push(store.alloc_table(instance));
        }

        // Segment instances
        let mut elems = Vec::with_capacity(module.elements.len());
        for seg in &module.elements {
            let items = match &seg.items {
                ElementItems::Functions(indices) => indices
                    .iter()
                    .map(|idx| {
                        funcs.get(*idx as usize).map(|a| Ref::Func(*a)).ok_or_else(|| {
                            InstantiationError::Initializer(Trap::internal(alloc::format!(
                                "element refers to function {}",
                                idx
                            )))
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?,
                ElementItems::Expressions(exprs) => {
                    let ctx = ConstContext {
                        store,
                        funcs: &funcs,
                        globals: &globals,
                    };
                    exprs
                        .iter()
                        .map(|expr| expect_ref(const_eval::eval(expr, &ctx)))
                        .collect::<Result<Vec<_>, _>>()?
                }
            };
            elems.push(store.alloc_elem(ElemInstance { items }));
        }
        let datas: Vec<_> = module
            .data
            .iter()
            .map(|seg| {
                store.alloc_data(DataInstance {
                    bytes: seg.data.clone(),
                })
            })
            .collect();

        let exports = module
            .exports
            .iter()
            .map(|export| {
                let idx = export.index as usize;
                let val = match export.kind {
                    ExportKind::Function => funcs.get(idx).copied().map(ExternVal::Func),
                    ExportKind::Table => tables.get(idx).copied().map(ExternVal::Table),
                    ExportKind::Memory => memories.get(idx).copied().map(ExternVal::Memory),
                    ExportKind::Global => globals.get(idx).copied().map(ExternVal::Global),
                };
                val.map(|val| (export.name.clone(), val)).ok_or_else(|| {
                    InstantiationError::Initializer(Trap::internal(alloc::format!(
                        "export {} refers to a missing index",
                        export.name
                    )))
                })
            })
            .collect::<Result<HashMap<_, _>, _>>()?;

        let instance = ModuleInstance {
            module: Arc::clone(&module),
            funcs,
            tables,
            memories,
            globals,
            elems,
            datas,
            exports,
        };
        let addr = store.push_instance(instance);
        if addr != instance_addr {
            return Err(Trap::internal("instance address moved during instantiation").into());
        }
        let instance = Arc::clone(store.instance_ref(addr)?);

        // Active element segments, in order.
        for (i, (seg, &elem)) in module.elements.iter().zip(&instance.elems).enumerate() {
            if let ElementMode::Active { table, offset } = &seg.mode {
                let offset = {
                    let ctx = ConstContext {
                        store,
                        funcs: &instance.funcs,
                        globals: &instance.globals,
                    };
                    const_eval::eval_offset(offset, &ctx).map_err(InstantiationError::Initializer)?
                };
                let table = instance.table(*table)?;
                store
                    .table_init(table, elem, offset, 0, seg.len() as u32)
                    .map_err(|_| InstantiationError::ElementOutOfBounds(i as u32))?;
            }
            if !matches!(seg.mode, ElementMode::Passive) {
                if let Some(elem) = store.elem_mut(elem) {
                    elem.items = Vec::new();
                }
            }
        }
        log::debug!("applied {} element segments", module.elements.len());

        // Active data segments, in order.
        for (i, (seg, &data)) in module.data.iter().zip(&instance.datas).enumerate() {
            if let DataMode::Active { memory, offset } = &seg.mode {
                let offset = {
                    let ctx = ConstContext {
                        store,
                        funcs: &instance.funcs,
                        globals: &instance.globals,
                    };
                    const_eval::eval_offset(offset, &ctx).map_err(InstantiationError::Initializer)?
                };
                let memory = instance.memory(*memory)?;
                store
                    .memory_init(memory, data, offset as u64, 0, seg.data.len() as u64)
                    .map_err(|_| InstantiationError::DataOutOfBounds(i as u32))?;
                if let Some(data) = store.data_mut(data) {
                    data.bytes = Vec::new();
                }
            }
        }
        log::debug!("applied {} data segments", module.data.len());

        if let Some(start) = module.start {
            let func = instance.func(start)?;
            log::debug!("invoking start function {}", start);
            executor::invoke(store, config, func, &[]).map_err(InstantiationError::StartTrap)?;
        }

        Ok(addr)
    }
}

fn expect_ref(value: Result<Value, Trap>) -> Result<Ref, InstantiationError> {
    match value.map_err(InstantiationError::Initializer)? {
        Value::Ref(r) => Ok(r),
        other => Err(InstantiationError::Initializer(Trap::internal(
            alloc::format!("{} is not a reference", other),
        ))),
    }
}

// ============================================================================
// Import matching
// ============================================================================

/// Does `val` satisfy the import declaration `kind`?
///
/// Functions and globals must have equivalent types; tables and memories
/// must have compatible limits and the same element type or sharing.
fn import_matches(store: &Store, types: TypeSpace<'_>, kind: &ImportKind, val: ExternVal) -> bool {
    match (kind, val) {
        (ImportKind::Function(type_idx), ExternVal::Func(addr)) => {
            let Some(expected) = types.func_type(*type_idx) else {
                return false;
            };
            store
                .func_signature(addr)
                .is_some_and(|(actual, space)| equivalent_func_types(expected, types, actual, space))
        }
        (ImportKind::Table(expected), ExternVal::Table(addr)) => {
            store.table(addr).is_some_and(|table| {
                let actual = table.current_type();
                actual.limits.matches(&expected.limits)
                    && equivalent_val_types(
                        ValType::Ref(expected.element),
                        types,
                        ValType::Ref(actual.element),
                        types,
                    )
            })
        }
        (ImportKind::Memory(expected), ExternVal::Memory(addr)) => {
            store.memory(addr).is_some_and(|memory| {
                let actual = memory.ty();
                actual.shared == expected.shared && actual.limits.matches(&expected.limits)
            })
        }
        (ImportKind::Global(expected), ExternVal::Global(addr)) => {
            store.global(addr).is_some_and(|global| {
                global.ty.mutable == expected.mutable
                    && equivalent_val_types(expected.content, types, global.ty.content, types)
            })
        }
        _ => false,
    }
}

fn describe_import(types: TypeSpace<'_>, kind: &ImportKind) -> String {
    match kind {
        ImportKind::Function(idx) => match types.func_type(*idx) {
            Some(ty) => alloc::format!("function {}", ty),
            None => alloc::format!("function type {}", idx),
        },
        ImportKind::Table(ty) => alloc::format!("table of {} {:?}", ty.element, ty.limits),
        ImportKind::Memory(ty) => alloc::format!("memory {:?}", ty.limits),
        ImportKind::Global(ty) => describe_global(ty),
    }
}

fn describe_extern(ty: &ExternType) -> String {
    match ty {
        ExternType::Func(ty) => alloc::format!("function {}", ty),
        ExternType::Table(ty) => alloc::format!("table of {} {:?}", ty.element, ty.limits),
        ExternType::Memory(ty) => alloc::format!("memory {:?}", ty.limits),
        ExternType::Global(ty) => describe_global(ty),
    }
}

fn describe_global(ty: &GlobalType) -> String {
    if ty.mutable {
        alloc::format!("global (mut {})", ty.content)
    } else {
        alloc::format!("global {}", ty.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::TrapKind;
    use crate::module::{
        ConstExpr, DataSegment, Element, Export, FunctionBody, Global, Import, Table,
    };
    use crate::opcodes::Instruction;
    use crate::types::{Limits, MemoryType, RefType, SubType, TableType};
    use alloc::vec;

    fn nullary_i32() -> FuncType {
        FuncType::new(vec![], vec![ValType::I32])
    }

    fn import(module: &str, name: &str, kind: ImportKind) -> Import {
        Import {
            module: module.to_string(),
            name: name.to_string(),
            kind,
        }
    }

    fn export(name: &str, kind: ExportKind, index: u32) -> Export {
        Export {
            name: name.to_string(),
            kind,
            index,
        }
    }

    fn one_page() -> MemoryType {
        MemoryType {
            limits: Limits::new(1, None),
            shared: false,
        }
    }

    #[test]
    fn test_unknown_import() {
        let mut module = Module::empty();
        module.types.push(SubType::func(nullary_i32()));
        module.imports.push(import("env", "missing", ImportKind::Function(0)));

        let mut store = Store::new();
        let err = Linker::new()
            .instantiate(&mut store, Arc::new(module), &RuntimeConfig::default())
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Link(LinkError::UnknownImport { ref module, ref name })
                if module == "env" && name == "missing"
        ));
    }

    #[test]
    fn test_incompatible_function_import() {
        let mut module = Module::empty();
        module.types.push(SubType::func(nullary_i32()));
        module.imports.push(import("env", "f", ImportKind::Function(0)));

        let mut store = Store::new();
        let mut linker = Linker::new();
        linker.define_func(
            &mut store,
            "env",
            "f",
            FuncType::new(vec![], vec![ValType::I64]),
            |_, _| Ok(vec![Value::I64(0)]),
        );
        let err = linker
            .instantiate(&mut store, Arc::new(module), &RuntimeConfig::default())
            .unwrap_err();
        assert!(matches!(err, Error::Link(LinkError::IncompatibleImportType { .. })));
    }

    #[test]
    fn test_import_kind_mismatch() {
        let mut module = Module::empty();
        module.imports.push(import("env", "mem", ImportKind::Memory(one_page())));

        let mut store = Store::new();
        let mut linker = Linker::new();
        linker
            .define_global(
                &mut store,
                "env",
                "mem",
                GlobalType {
                    content: ValType::I32,
                    mutable: false,
                },
                Value::I32(0),
            )
            .unwrap();
        let err = linker
            .instantiate(&mut store, Arc::new(module), &RuntimeConfig::default())
            .unwrap_err();
        assert!(matches!(err, Error::Link(LinkError::IncompatibleImportType { .. })));
    }

    #[test]
    fn test_memory_limits_must_cover_import() {
        let mut module = Module::empty();
        module.imports.push(import(
            "env",
            "mem",
            ImportKind::Memory(MemoryType {
                limits: Limits::new(2, None),
                shared: false,
            }),
        ));

        let mut store = Store::new();
        let mut linker = Linker::new();
        let memory = LinearMemory::new(one_page(), 16).unwrap();
        linker.define_memory(&mut store, "env", "mem", memory);
        let err = linker
            .instantiate(&mut store, Arc::new(module), &RuntimeConfig::default())
            .unwrap_err();
        assert!(matches!(err, Error::Link(_)));
    }

    #[test]
    fn test_define_global_checks_value() {
        let mut store = Store::new();
        let mut linker = Linker::new();
        let ty = GlobalType {
            content: ValType::F64,
            mutable: true,
        };
        assert!(linker
            .define_global(&mut store, "env", "g", ty, Value::I32(1))
            .is_err());
        assert!(linker.get("env", "g").is_none());
        let addr = linker
            .define_global(&mut store, "env", "g", ty, Value::F64(1.5))
            .unwrap();
        assert_eq!(linker.get("env", "g"), Some(ExternVal::Global(addr)));
    }

    #[test]
    fn test_globals_and_data_segments() {
        let mut module = Module::empty();
        module.imports.push(import(
            "env",
            "base",
            ImportKind::Global(GlobalType {
                content: ValType::I32,
                mutable: false,
            }),
        ));
        module.globals.push(Global {
            ty: GlobalType {
                content: ValType::I32,
                mutable: false,
            },
            init: ConstExpr::new(vec![
                Instruction::GlobalGet(0),
                Instruction::I32Const(4),
                Instruction::I32Add,
            ]),
        });
        module.memories.push(one_page());
        module.data.push(DataSegment {
            mode: DataMode::Active {
                memory: 0,
                offset: ConstExpr::new(vec![Instruction::GlobalGet(1)]),
            },
            data: b"wasm".to_vec(),
        });
        module.exports.push(export("memory", ExportKind::Memory, 0));
        module.exports.push(export("g", ExportKind::Global, 1));

        let mut store = Store::new();
        let mut linker = Linker::new();
        linker
            .define_global(
                &mut store,
                "env",
                "base",
                GlobalType {
                    content: ValType::I32,
                    mutable: false,
                },
                Value::I32(12),
            )
            .unwrap();
        let addr = linker
            .instantiate(&mut store, Arc::new(module), &RuntimeConfig::default())
            .unwrap();

        let instance = Arc::clone(store.instance(addr).unwrap());
        let Some(ExternVal::Global(g)) = instance.export("g") else {
            panic!("missing global export");
        };
        assert_eq!(store.global(g).unwrap().value, Value::I32(16));
        let Some(ExternVal::Memory(m)) = instance.export("memory") else {
            panic!("missing memory export");
        };
        assert_eq!(store.memory(m).unwrap().read_bytes(16, 4).unwrap(), b"wasm");
        // Active segments are dropped.
        assert!(store.data(instance.datas[0]).unwrap().bytes.is_empty());
    }

    #[test]
    fn test_data_segment_out_of_bounds() {
        let mut module = Module::empty();
        module.memories.push(one_page());
        module.data.push(DataSegment {
            mode: DataMode::Active {
                memory: 0,
                offset: ConstExpr::i32(65535),
            },
            data: vec![1, 2],
        });

        let mut store = Store::new();
        let err = Linker::new()
            .instantiate(&mut store, Arc::new(module), &RuntimeConfig::default())
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "uninstantiable: out of bounds memory access in data segment 0"
        );
    }

    #[test]
    fn test_element_segment_writes_survive_later_failure() {
        // Two active segments into an imported table; the second is out of
        // bounds, the first must stay applied.
        let mut module = Module::empty();
        module.types.push(SubType::func(nullary_i32()));
        module.imports.push(import(
            "env",
            "table",
            ImportKind::Table(TableType {
                element: RefType::FUNCREF,
                limits: Limits::new(2, None),
            }),
        ));
        module.functions.push(0);
        module.code.push(FunctionBody {
            locals: vec![],
            instructions: vec![Instruction::I32Const(7), Instruction::End],
        });
        for offset in [0, 2] {
            module.elements.push(Element {
                ty: RefType::FUNCREF,
                items: ElementItems::Functions(vec![0]),
                mode: ElementMode::Active {
                    table: 0,
                    offset: ConstExpr::i32(offset),
                },
            });
        }

        let mut store = Store::new();
        let mut linker = Linker::new();
        let table = TableInstance::new(
            TableType {
                element: RefType::FUNCREF,
                limits: Limits::new(2, None),
            },
            Ref::Null,
            100,
        )
        .unwrap();
        let table = linker.define_table(&mut store, "env", "table", table);
        let err = linker
            .instantiate(&mut store, Arc::new(module), &RuntimeConfig::default())
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Instantiation(InstantiationError::ElementOutOfBounds(1))
        ));

        let Ref::Func(func) = store.table(table).unwrap().get(0).unwrap() else {
            panic!("first segment was not applied");
        };
        let results = executor::invoke(&mut store, &RuntimeConfig::default(), func, &[]).unwrap();
        assert_eq!(results, vec![Value::I32(7)]);
    }

    #[test]
    fn test_start_function_trap() {
        let mut module = Module::empty();
        module.types.push(SubType::func(FuncType::default()));
        module.functions.push(0);
        module.code.push(FunctionBody {
            locals: vec![],
            instructions: vec![Instruction::Unreachable, Instruction::End],
        });
        module.start = Some(0);

        let mut store = Store::new();
        let err = Linker::new()
            .instantiate(&mut store, Arc::new(module), &RuntimeConfig::default())
            .unwrap_err();
        let Error::Instantiation(InstantiationError::StartTrap(trap)) = err else {
            panic!("expected a start trap, got {:?}", err);
        };
        assert_eq!(trap.kind, TrapKind::Unreachable);
    }

    #[test]
    fn test_table_initializer_and_passive_segment() {
        let mut module = Module::empty();
        module.types.push(SubType::func(nullary_i32()));
        module.functions.push(0);
        module.code.push(FunctionBody {
            locals: vec![],
            instructions: vec![Instruction::I32Const(1), Instruction::End],
        });
        module.tables.push(Table {
            ty: TableType {
                element: RefType::FUNCREF,
                limits: Limits::new(3, None),
            },
            init: Some(ConstExpr::new(vec![Instruction::RefFunc(0)])),
        });
        module.elements.push(Element {
            ty: RefType::FUNCREF,
            items: ElementItems::Functions(vec![0, 0]),
            mode: ElementMode::Passive,
        });
        module.exports.push(export("t", ExportKind::Table, 0));

        let mut store = Store::new();
        let addr = Linker::new()
            .instantiate(&mut store, Arc::new(module), &RuntimeConfig::default())
            .unwrap();
        let instance = Arc::clone(store.instance(addr).unwrap());
        let Some(ExternVal::Table(t)) = instance.export("t") else {
            panic!("missing table export");
        };
        let func = instance.funcs[0];
        assert_eq!(store.table(t).unwrap().get(2).unwrap(), Ref::Func(func));
        assert_eq!(store.elem(instance.elems[0]).unwrap().items.len(), 2);
    }

    #[test]
    fn test_define_instance_links_modules() {
        let mut producer = Module::empty();
        producer.types.push(SubType::func(nullary_i32()));
        producer.functions.push(0);
        producer.code.push(FunctionBody {
            locals: vec![],
            instructions: vec![Instruction::I32Const(41), Instruction::End],
        });
        producer.exports.push(export("answer", ExportKind::Function, 0));

        let mut consumer = Module::empty();
        consumer.types.push(SubType::func(nullary_i32()));
        consumer.imports.push(import("producer", "answer", ImportKind::Function(0)));
        consumer.functions.push(0);
        consumer.code.push(FunctionBody {
            locals: vec![],
            instructions: vec![
                Instruction::Call(0),
                Instruction::I32Const(1),
                Instruction::I32Add,
                Instruction::End,
            ],
        });
        consumer.exports.push(export("main", ExportKind::Function, 1));

        let config = RuntimeConfig::default();
        let mut store = Store::new();
        let mut linker = Linker::new();
        let producer = linker
            .instantiate(&mut store, Arc::new(producer), &config)
            .unwrap();
        linker.define_instance(&store, "producer", producer).unwrap();
        let consumer = linker
            .instantiate(&mut store, Arc::new(consumer), &config)
            .unwrap();

        let Some(ExternVal::Func(main)) = store.instance(consumer).unwrap().export("main") else {
            panic!("missing main export");
        };
        assert_eq!(
            executor::invoke(&mut store, &config, main, &[]).unwrap(),
            vec![Value::I32(42)]
        );
    }

    #[test]
    fn test_invalid_module_is_not_instantiated() {
        let mut module = Module::empty();
        module.types.push(SubType::func(nullary_i32()));
        module.functions.push(0);
        module.code.push(FunctionBody {
            locals: vec![],
            instructions: vec![Instruction::I64Const(1), Instruction::End],
        });

        let mut store = Store::new();
        let err = Linker::new()
            .instantiate(&mut store, Arc::new(module), &RuntimeConfig::default())
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(store.instance(InstanceAddr(0)).is_none());
    }
}
