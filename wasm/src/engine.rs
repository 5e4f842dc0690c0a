//! The embedder-facing runtime.
//!
//! [`WasmRuntime`] bundles a configuration, a [`Store`] and a [`Linker`] so a
//! host can bind imports, load and instantiate modules, and call their
//! exports by name.

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

use futures_util::future::BoxFuture;

use crate::executor;
use crate::host::Caller;
use crate::interpreter::{Trap, Value};
use crate::linker::Linker;
use crate::memory::LinearMemory;
use crate::module::Module;
use crate::parser;
use crate::store::{ExternVal, FuncAddr, GlobalAddr, InstanceAddr, Store};
use crate::types::{FuncType, GlobalType};
use crate::{Error, RuntimeConfig};

/// A store, its import object and the configuration they run under.
///
/// Not thread-safe; wrap it in a lock to share between threads.
pub struct WasmRuntime {
    config: RuntimeConfig,
    store: Store,
    linker: Linker,
}

impl Default for WasmRuntime {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

impl WasmRuntime {
    pub fn new(config: RuntimeConfig) -> Self {
        WasmRuntime {
            config,
            store: Store::new(),
            linker: Linker::new(),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Change fuel, fusion or limits for later calls. Code already
    /// instantiated keeps the fusion setting it was linked with.
    pub fn config_mut(&mut self) -> &mut RuntimeConfig {
        &mut self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn linker(&self) -> &Linker {
        &self.linker
    }

    // ========================================================================
    // Host bindings
    // ========================================================================

    /// Bind a synchronous host function as `module.name`.
    pub fn bind_host_function<F>(&mut self, module: &str, name: &str, ty: FuncType, func: F) -> FuncAddr
    where
        F: Fn(Caller<'_>, &[Value]) -> Result<Vec<Value>, Trap> + Send + Sync + 'static,
    {
        self.linker
            .define_func(&mut self.store, module, name, ty, func)
    }

    /// Bind an asynchronous host function; callable through
    /// [`WasmRuntime::invoke_async`] only.
    pub fn bind_async_host_function<F>(
        &mut self,
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
        self.linker
            .define_async_func(&mut self.store, module, name, ty, func)
    }

    pub fn bind_host_global(
        &mut self,
        module: &str,
        name: &str,
        ty: GlobalType,
        value: Value,
    ) -> Result<GlobalAddr, Error> {
        Ok(self
            .linker
            .define_global(&mut self.store, module, name, ty, value)?)
    }

    // ========================================================================
    // Modules
    // ========================================================================

    /// Decode a binary module with this runtime's feature set.
    pub fn load_module(&self, bytes: &[u8]) -> Result<Arc<Module>, Error> {
        let module = parser::decode(bytes, &self.config.parser_config())?;
        log::debug!(
            "decoded module {}: {} functions, {} imports, {} exports",
            module.name().unwrap_or("<anonymous>"),
            module.functions.len(),
            module.imports.len(),
            module.exports.len()
        );
        Ok(Arc::new(module))
    }

    pub fn instantiate_module(&mut self, module: Arc<Module>) -> Result<InstanceAddr, Error> {
        self.linker
            .instantiate(&mut self.store, module, &self.config)
    }

    /// Make every export of `instance` importable as `name.<export>`.
    pub fn register(&mut self, name: &str, instance: InstanceAddr) -> Result<(), Error> {
        Ok(self.linker.define_instance(&self.store, name, instance)?)
    }

    /// Decode, instantiate and register under `name` in one step.
    pub fn load_and_register(&mut self, name: &str, bytes: &[u8]) -> Result<InstanceAddr, Error> {
        let module = self.load_module(bytes)?;
        let instance = self.instantiate_module(module)?;
        self.register(name, instance)?;
        Ok(instance)
    }

    // ========================================================================
    // Exports
    // ========================================================================

    pub fn export(&self, instance: InstanceAddr, name: &str) -> Option<ExternVal> {
        self.store.instance(instance)?.export(name)
    }

    fn exported_func(&self, instance: InstanceAddr, name: &str) -> Result<FuncAddr, Error> {
        match self.export(instance, name) {
            Some(ExternVal::Func(addr)) => Ok(addr),
            _ => Err(Error::UnknownExport(name.to_string())),
        }
    }

    /// Call the function exported as `name`.
    pub fn invoke(&mut self, instance: InstanceAddr, name: &str, args: &[Value]) -> Result<Vec<Value>, Error> {
        let func = self.exported_func(instance, name)?;
        Ok(self.invoke_func(func, args)?)
    }

    pub fn invoke_func(&mut self, func: FuncAddr, args: &[Value]) -> Result<Vec<Value>, Trap> {
        executor::invoke(&mut self.store, &self.config, func, args)
    }

    /// Call the function exported as `name`, awaiting asynchronous host
    /// functions it reaches.
    pub async fn invoke_async(
        &mut self,
        instance: InstanceAddr,
        name: &str,
        args: Vec<Value>,
    ) -> Result<Vec<Value>, Error> {
        let func = self.exported_func(instance, name)?;
        Ok(executor::invoke_async(&mut self.store, &self.config, func, args).await?)
    }

    /// Current value of the global exported as `name`.
    pub fn global_value(&self, instance: InstanceAddr, name: &str) -> Option<Value> {
        match self.export(instance, name)? {
            ExternVal::Global(addr) => self.store.global(addr).map(|g| g.value),
            _ => None,
        }
    }

    /// The memory exported as `name`.
    pub fn memory(&self, instance: InstanceAddr, name: &str) -> Option<&LinearMemory> {
        match self.export(instance, name)? {
            ExternVal::Memory(addr) => self.store.memory(addr),
            _ => None,
        }
    }

    pub fn memory_mut(&mut self, instance: InstanceAddr, name: &str) -> Option<&mut LinearMemory> {
        match self.export(instance, name)? {
            ExternVal::Memory(addr) => self.store.memory_mut(addr),
            _ => None,
        }
    }

    /// Load, instantiate, and call a function in one step.
    pub fn execute(&mut self, bytes: &[u8], entry_point: &str, args: &[Value]) -> Result<Vec<Value>, Error> {
        let module = self.load_module(bytes)?;
        let instance = self.instantiate_module(module)?;
        self.invoke(instance, entry_point, args)
    }
}
