//! The store: owner of every runtime instance.
//!
//! Functions, tables, memories, globals, element and data segments and
//! module instances live in grow-only arenas addressed by stable integer
//! handles. Nothing is freed while the store lives, so an address handed out
//! once stays valid for every instance that captured it.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use hashbrown::HashMap;

use crate::code::CompiledFunc;
use crate::host::HostFunc;
use crate::interpreter::{Ref, Trap, TrapKind, Value};
use crate::memory::LinearMemory;
use crate::module::Module;
use crate::types::{
    equivalent_func_types, ExternType, FuncType, GlobalType, HeapType, Limits, RefType, TableType,
    TypeSpace, ValType,
};

macro_rules! addresses {
    ($($(#[$doc:meta])* $name:ident;)*) => {$(
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u32);

        impl $name {
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }
    )*};
}

addresses! {
    /// Address of a function instance.
    FuncAddr;
    /// Address of a table instance.
    TableAddr;
    /// Address of a memory instance.
    MemAddr;
    /// Address of a global instance.
    GlobalAddr;
    /// Address of a passive element segment.
    ElemAddr;
    /// Address of a passive data segment.
    DataAddr;
    /// Address of a module instance.
    InstanceAddr;
}

// ============================================================================
// Instances
// ============================================================================

/// A function: Wasm code closed over its defining instance, or a host closure.
#[derive(Clone)]
pub enum FuncInstance {
    Wasm {
        instance: InstanceAddr,
        code: Arc<CompiledFunc>,
    },
    Host {
        ty: FuncType,
        func: HostFunc,
    },
}

impl core::fmt::Debug for FuncInstance {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            FuncInstance::Wasm { instance, code } => f
                .debug_struct("Wasm")
                .field("instance", instance)
                .field("func", &code.func_index)
                .finish(),
            FuncInstance::Host { ty, func } => f
                .debug_struct("Host")
                .field("ty", ty)
                .field("async", &func.is_async())
                .finish(),
        }
    }
}

/// Table of references.
#[derive(Debug, Clone)]
pub struct TableInstance {
    pub ty: TableType,
    pub elements: Vec<Ref>,
    /// Host-imposed ceiling on the element count.
    limit: u32,
}

fn table_oob() -> Trap {
    Trap::new(TrapKind::OutOfBoundsTableAccess)
}

impl TableInstance {
    pub fn new(ty: TableType, init: Ref, limit: u32) -> Option<Self> {
        if ty.limits.min > limit {
            return None;
        }
        let mut elements = Vec::new();
        elements.try_reserve_exact(ty.limits.min as usize).ok()?;
        elements.resize(ty.limits.min as usize, init);
        Some(TableInstance {
            ty,
            elements,
            limit,
        })
    }

    /// Current type: the current size as minimum.
    pub fn current_type(&self) -> TableType {
        TableType {
            element: self.ty.element,
            limits: Limits::new(self.size(), self.ty.limits.max),
        }
    }

    pub fn size(&self) -> u32 {
        self.elements.len() as u32
    }

    pub fn get(&self, index: u32) -> Result<Ref, Trap> {
        self.elements
            .get(index as usize)
            .copied()
            .ok_or_else(table_oob)
    }

    pub fn set(&mut self, index: u32, value: Ref) -> Result<(), Trap> {
        let slot = self.elements.get_mut(index as usize).ok_or_else(table_oob)?;
        *slot = value;
        Ok(())
    }

    /// Returns the previous size, or `None` if the table cannot grow.
    pub fn grow(&mut self, delta: u32, init: Ref) -> Option<u32> {
        let old = self.size();
        let new = old.checked_add(delta)?;
        if new > self.ty.limits.max.unwrap_or(u32::MAX).min(self.limit) {
            return None;
        }
        self.elements.try_reserve_exact(delta as usize).ok()?;
        self.elements.resize(new as usize, init);
        Some(old)
    }

    fn range(&self, start: u32, len: u32) -> Result<core::ops::Range<usize>, Trap> {
        let end = u64::from(start) + u64::from(len);
        if end > u64::from(self.size()) {
            return Err(table_oob());
        }
        Ok(start as usize..end as usize)
    }

    pub fn fill(&mut self, start: u32, value: Ref, len: u32) -> Result<(), Trap> {
        let range = self.range(start, len)?;
        self.elements[range].fill(value);
        Ok(())
    }

    pub fn copy_within(&mut self, dst: u32, src: u32, len: u32) -> Result<(), Trap> {
        let src = self.range(src, len)?;
        let dst = self.range(dst, len)?;
        self.elements.copy_within(src, dst.start);
        Ok(())
    }

    /// Write `items[src..src + len]` at `dst`.
    pub fn init(&mut self, dst: u32, items: &[Ref], src: u32, len: u32) -> Result<(), Trap> {
        let src_end = u64::from(src) + u64::from(len);
        if src_end > items.len() as u64 {
            return Err(table_oob());
        }
        let dst = self.range(dst, len)?;
        self.elements[dst].copy_from_slice(&items[src as usize..src_end as usize]);
        Ok(())
    }
}

/// A global variable.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalInstance {
    pub ty: GlobalType,
    pub value: Value,
}

/// A passive element segment; empty once dropped.
#[derive(Debug, Clone, Default)]
pub struct ElemInstance {
    pub items: Vec<Ref>,
}

/// A passive data segment; empty once dropped.
#[derive(Debug, Clone, Default)]
pub struct DataInstance {
    pub bytes: Vec<u8>,
}

/// An entity that can be imported or exported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExternVal {
    Func(FuncAddr),
    Table(TableAddr),
    Memory(MemAddr),
    Global(GlobalAddr),
}

/// A module linked into a store: every index space resolved to addresses.
#[derive(Debug, Clone)]
pub struct ModuleInstance {
    pub module: Arc<Module>,
    pub funcs: Vec<FuncAddr>,
    pub tables: Vec<TableAddr>,
    pub memories: Vec<MemAddr>,
    pub globals: Vec<GlobalAddr>,
    /// One per element segment; active and declarative ones are empty
    /// once instantiation finishes.
    pub elems: Vec<ElemAddr>,
    /// One per data segment; active ones are empty once instantiation
    /// finishes.
    pub datas: Vec<DataAddr>,
    pub exports: HashMap<String, ExternVal>,
}

impl ModuleInstance {
    pub fn types(&self) -> TypeSpace<'_> {
        self.module.type_space()
    }

    pub fn export(&self, name: &str) -> Option<ExternVal> {
        self.exports.get(name).copied()
    }

    pub fn func(&self, idx: u32) -> Result<FuncAddr, Trap> {
        index(&self.funcs, idx, "function")
    }

    pub fn table(&self, idx: u32) -> Result<TableAddr, Trap> {
        index(&self.tables, idx, "table")
    }

    pub fn memory(&self, idx: u32) -> Result<MemAddr, Trap> {
        index(&self.memories, idx, "memory")
    }

    pub fn global(&self, idx: u32) -> Result<GlobalAddr, Trap> {
        index(&self.globals, idx, "global")
    }

    pub fn elem(&self, idx: u32) -> Result<ElemAddr, Trap> {
        index(&self.elems, idx, "element segment")
    }

    pub fn data(&self, idx: u32) -> Result<DataAddr, Trap> {
        index(&self.datas, idx, "data segment")
    }
}

fn index<T: Copy>(addrs: &[T], idx: u32, what: &str) -> Result<T, Trap> {
    addrs
        .get(idx as usize)
        .copied()
        .ok_or_else(|| Trap::internal(alloc::format!("{} {} not in instance", what, idx)))
}

// ============================================================================
// Store
// ============================================================================

/// Owner of all runtime instances.
#[derive(Debug, Default)]
pub struct Store {
    funcs: Vec<FuncInstance>,
    tables: Vec<TableInstance>,
    memories: Vec<LinearMemory>,
    globals: Vec<GlobalInstance>,
    elems: Vec<ElemInstance>,
    datas: Vec<DataInstance>,
    instances: Vec<Arc<ModuleInstance>>,
}

macro_rules! arena {
    ($field:ident, $addr:ident, $ty:ty, $alloc:ident, $get:ident, $get_mut:ident) => {
        pub fn $alloc(&mut self, item: $ty) -> $addr {
            self.$field.push(item);
            $addr(self.$field.len() as u32 - 1)
        }

        pub fn $get(&self, addr: $addr) -> Option<&$ty> {
            self.$field.get(addr.index())
        }

        pub fn $get_mut(&mut self, addr: $addr) -> Option<&mut $ty> {
            self.$field.get_mut(addr.index())
        }
    };
}

fn dangling(what: &str) -> Trap {
    Trap::internal(alloc::format!("dangling {} address", what))
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    arena!(funcs, FuncAddr, FuncInstance, alloc_func, func, func_mut);
    arena!(tables, TableAddr, TableInstance, alloc_table, table, table_mut);
    arena!(memories, MemAddr, LinearMemory, alloc_memory, memory, memory_mut);
    arena!(globals, GlobalAddr, GlobalInstance, alloc_global, global, global_mut);
    arena!(elems, ElemAddr, ElemInstance, alloc_elem, elem, elem_mut);
    arena!(datas, DataAddr, DataInstance, alloc_data, data, data_mut);

    /// Address the next module instance will get.
    pub fn next_instance_addr(&self) -> InstanceAddr {
        InstanceAddr(self.instances.len() as u32)
    }

    pub fn push_instance(&mut self, instance: ModuleInstance) -> InstanceAddr {
        self.instances.push(Arc::new(instance));
        InstanceAddr(self.instances.len() as u32 - 1)
    }

    pub fn instance(&self, addr: InstanceAddr) -> Option<&Arc<ModuleInstance>> {
        self.instances.get(addr.index())
    }

    // ========================================================================
    // Trap-returning accessors for the executor
    // ========================================================================

    pub fn table_ref(&self, addr: TableAddr) -> Result<&TableInstance, Trap> {
        self.table(addr).ok_or_else(|| dangling("table"))
    }

    pub fn table_ref_mut(&mut self, addr: TableAddr) -> Result<&mut TableInstance, Trap> {
        self.table_mut(addr).ok_or_else(|| dangling("table"))
    }

    pub fn memory_ref(&self, addr: MemAddr) -> Result<&LinearMemory, Trap> {
        self.memory(addr).ok_or_else(|| dangling("memory"))
    }

    pub fn memory_ref_mut(&mut self, addr: MemAddr) -> Result<&mut LinearMemory, Trap> {
        self.memory_mut(addr).ok_or_else(|| dangling("memory"))
    }

    /// Two distinct memories, for `memory.copy` across memories.
    pub fn memory_pair_mut(
        &mut self,
        dst: MemAddr,
        src: MemAddr,
    ) -> Result<(&mut LinearMemory, &LinearMemory), Trap> {
        let (d, s) = (dst.index(), src.index());
        if d == s || d >= self.memories.len() || s >= self.memories.len() {
            return Err(dangling("memory"));
        }
        if d < s {
            let (lo, hi) = self.memories.split_at_mut(s);
            Ok((&mut lo[d], &hi[0]))
        } else {
            let (lo, hi) = self.memories.split_at_mut(d);
            Ok((&mut hi[0], &lo[s]))
        }
    }

    /// Two distinct tables, for `table.copy` across tables.
    pub fn table_pair_mut(
        &mut self,
        dst: TableAddr,
        src: TableAddr,
    ) -> Result<(&mut TableInstance, &TableInstance), Trap> {
        let (d, s) = (dst.index(), src.index());
        if d == s || d >= self.tables.len() || s >= self.tables.len() {
            return Err(dangling("table"));
        }
        if d < s {
            let (lo, hi) = self.tables.split_at_mut(s);
            Ok((&mut lo[d], &hi[0]))
        } else {
            let (lo, hi) = self.tables.split_at_mut(d);
            Ok((&mut hi[0], &lo[s]))
        }
    }

    /// `table.init`: copy from a passive element segment into a table.
    pub fn table_init(
        &mut self,
        table: TableAddr,
        elem: ElemAddr,
        dst: u32,
        src: u32,
        len: u32,
    ) -> Result<(), Trap> {
        let items = &self
            .elems
            .get(elem.index())
            .ok_or_else(|| dangling("element segment"))?
            .items;
        let table = self
            .tables
            .get_mut(table.index())
            .ok_or_else(|| dangling("table"))?;
        table.init(dst, items, src, len)
    }

    /// `memory.init`: copy from a passive data segment into a memory.
    pub fn memory_init(
        &mut self,
        mem: MemAddr,
        data: DataAddr,
        dst: u64,
        src: u64,
        len: u64,
    ) -> Result<(), Trap> {
        let bytes = &self
            .datas
            .get(data.index())
            .ok_or_else(|| dangling("data segment"))?
            .bytes;
        let memory = self
            .memories
            .get_mut(mem.index())
            .ok_or_else(|| dangling("memory"))?;
        memory.init(dst, bytes, src, len)
    }

    pub fn global_ref(&self, addr: GlobalAddr) -> Result<&GlobalInstance, Trap> {
        self.global(addr).ok_or_else(|| dangling("global"))
    }

    pub fn global_ref_mut(&mut self, addr: GlobalAddr) -> Result<&mut GlobalInstance, Trap> {
        self.global_mut(addr).ok_or_else(|| dangling("global"))
    }

    pub fn func_ref(&self, addr: FuncAddr) -> Result<&FuncInstance, Trap> {
        self.func(addr).ok_or_else(|| dangling("function"))
    }

    pub fn instance_ref(&self, addr: InstanceAddr) -> Result<&Arc<ModuleInstance>, Trap> {
        self.instance(addr).ok_or_else(|| dangling("instance"))
    }

    // ========================================================================
    // Types
    // ========================================================================

    /// A function's signature and the type space its indices resolve in.
    pub fn func_signature(&self, addr: FuncAddr) -> Option<(&FuncType, TypeSpace<'_>)> {
        match self.func(addr)? {
            FuncInstance::Host { ty, .. } => Some((ty, TypeSpace::empty())),
            FuncInstance::Wasm { instance, code } => {
                let instance = self.instance(*instance)?;
                Some((&code.ty, instance.types()))
            }
        }
    }

    /// Whether `value` has type `ty`, reading concrete type indices in
    /// `space`. A function reference matches a concrete type only when its
    /// signature is structurally equivalent to it.
    pub fn value_matches(&self, value: &Value, ty: ValType, space: TypeSpace<'_>) -> bool {
        match (value, ty) {
            (Value::Ref(Ref::Func(addr)), ValType::Ref(rt)) => match rt.heap {
                HeapType::Concrete(idx) => {
                    let (Some(expected), Some((actual, actual_space))) =
                        (space.func_type(idx), self.func_signature(*addr))
                    else {
                        return false;
                    };
                    equivalent_func_types(expected, space, actual, actual_space)
                }
                _ => value.has_type(ty),
            },
            _ => value.has_type(ty),
        }
    }

    /// Current type of an external value.
    pub fn extern_type(&self, val: ExternVal) -> Option<ExternType> {
        Some(match val {
            ExternVal::Func(a) => ExternType::Func(self.func_signature(a)?.0.clone()),
            ExternVal::Table(a) => ExternType::Table(self.table(a)?.current_type()),
            ExternVal::Memory(a) => ExternType::Memory(self.memory(a)?.ty()),
            ExternVal::Global(a) => ExternType::Global(self.global(a)?.ty),
        })
    }
}
