//! Host function bindings.
//!
//! Host functions are closures the embedder registers with the linker. A
//! synchronous host function runs to completion inside the interpreter loop;
//! an asynchronous one returns a future that is awaited at the call boundary
//! by [`crate::executor::invoke_async`]. Wasm bytecode itself never suspends.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use futures_util::future::BoxFuture;

use crate::interpreter::{Trap, Value};
use crate::memory::LinearMemory;
use crate::store::{ExternVal, ModuleInstance, Store};
use crate::types::{FuncType, TypeSpace};

/// What a host function sees of the machine: the store, and the instance of
/// the calling Wasm function (absent when the host function is invoked
/// directly by the embedder).
pub struct Caller<'a> {
    store: &'a mut Store,
    instance: Option<Arc<ModuleInstance>>,
}

impl<'a> Caller<'a> {
    pub fn new(store: &'a mut Store, instance: Option<Arc<ModuleInstance>>) -> Self {
        Caller { store, instance }
    }

    pub fn store(&mut self) -> &mut Store {
        &mut *self.store
    }

    pub fn instance(&self) -> Option<&Arc<ModuleInstance>> {
        self.instance.as_ref()
    }

    /// The caller's memory by index.
    pub fn memory(&mut self, idx: u32) -> Option<&mut LinearMemory> {
        let addr = *self.instance.as_ref()?.memories.get(idx as usize)?;
        self.store.memory_mut(addr)
    }

    /// A memory the caller exports under `name`.
    pub fn exported_memory(&mut self, name: &str) -> Option<&mut LinearMemory> {
        match self.instance.as_ref()?.export(name)? {
            ExternVal::Memory(addr) => self.store.memory_mut(addr),
            _ => None,
        }
    }
}

pub type SyncHostFn = dyn Fn(Caller<'_>, &[Value]) -> Result<Vec<Value>, Trap> + Send + Sync;

pub type AsyncHostFn =
    dyn for<'a> Fn(Caller<'a>, Vec<Value>) -> BoxFuture<'a, Result<Vec<Value>, Trap>> + Send + Sync;

/// A host-provided function body.
#[derive(Clone)]
pub enum HostFunc {
    Sync(Arc<SyncHostFn>),
    Async(Arc<AsyncHostFn>),
}

impl HostFunc {
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(Caller<'_>, &[Value]) -> Result<Vec<Value>, Trap> + Send + Sync + 'static,
    {
        HostFunc::Sync(Arc::new(f))
    }

    pub fn from_async<F>(f: F) -> Self
    where
        F: for<'a> Fn(Caller<'a>, Vec<Value>) -> BoxFuture<'a, Result<Vec<Value>, Trap>>
            + Send
            + Sync
            + 'static,
    {
        HostFunc::Async(Arc::new(f))
    }

    pub fn is_async(&self) -> bool {
        matches!(self, HostFunc::Async(_))
    }

    /// Call from a synchronous invocation. Asynchronous host functions trap.
    pub fn call(&self, caller: Caller<'_>, args: &[Value]) -> Result<Vec<Value>, Trap> {
        match self {
            HostFunc::Sync(f) => f(caller, args),
            HostFunc::Async(_) => Err(Trap::host(
                "asynchronous host function called from a synchronous invocation",
            )),
        }
    }

    /// Call from an asynchronous invocation.
    pub async fn call_async(&self, caller: Caller<'_>, args: Vec<Value>) -> Result<Vec<Value>, Trap> {
        match self {
            HostFunc::Sync(f) => f(caller, &args),
            HostFunc::Async(f) => f(caller, args).await,
        }
    }
}

/// Check the values a host function returned against its signature.
pub fn check_results(store: &Store, ty: &FuncType, results: &[Value]) -> Result<(), Trap> {
    let space = TypeSpace::empty();
    if results.len() != ty.results.len()
        || !results
            .iter()
            .zip(&ty.results)
            .all(|(v, t)| store.value_matches(v, *t, space))
    {
        return Err(Trap::host(alloc::format!(
            "host function returned values that do not match {}",
            ty
        )));
    }
    Ok(())
}

/// Boxed future helper for async host functions written as `async` blocks.
pub fn boxed<'a, F>(future: F) -> BoxFuture<'a, Result<Vec<Value>, Trap>>
where
    F: core::future::Future<Output = Result<Vec<Value>, Trap>> + Send + 'a,
{
    Box::pin(future)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::TrapKind;
    use crate::types::ValType;
    use alloc::vec;

    #[test]
    fn test_sync_call() {
        let mut store = Store::new();
        let double = HostFunc::from_fn(|_, args| match args {
            [Value::I32(v)] => Ok(vec![Value::I32(v * 2)]),
            _ => Err(Trap::host("bad args")),
        });
        let results = double
            .call(Caller::new(&mut store, None), &[Value::I32(21)])
            .unwrap();
        assert_eq!(results, vec![Value::I32(42)]);
    }

    #[test]
    fn test_async_func_traps_in_sync_call() {
        let mut store = Store::new();
        let f = HostFunc::from_async(|_, _| boxed(async { Ok(Vec::new()) }));
        assert!(f.is_async());
        let trap = f.call(Caller::new(&mut store, None), &[]).unwrap_err();
        assert!(matches!(trap.kind, TrapKind::Host(_)));
    }

    #[test]
    fn test_async_call() {
        let mut store = Store::new();
        let f = HostFunc::from_async(|_, args| {
            boxed(async move { Ok(vec![Value::I64(args.len() as i64)]) })
        });
        let results = futures::executor::block_on(
            f.call_async(Caller::new(&mut store, None), vec![Value::I32(1), Value::I32(2)]),
        )
        .unwrap();
        assert_eq!(results, vec![Value::I64(2)]);
    }

    #[test]
    fn test_check_results() {
        let store = Store::new();
        let ty = FuncType::new(vec![], vec![ValType::I32]);
        assert!(check_results(&store, &ty, &[Value::I32(0)]).is_ok());
        assert!(check_results(&store, &ty, &[Value::I64(0)]).is_err());
        assert!(check_results(&store, &ty, &[]).is_err());
    }

    #[test]
    fn test_caller_without_instance_has_no_memory() {
        let mut store = Store::new();
        let mut caller = Caller::new(&mut store, None);
        assert!(caller.memory(0).is_none());
        assert!(caller.exported_memory("memory").is_none());
    }
}
