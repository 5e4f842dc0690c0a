//! KPIO WebAssembly abstract machine
//!
//! Decodes a binary module, type-checks it, links it against host-provided
//! imports, and executes it on a stack-machine interpreter with Wasm trap
//! and control-flow semantics.
//!
//! # Architecture
//!
//! - `parser`: WASM binary decoder (sections + instruction decoding)
//! - `module`: decoded module AST
//! - `types`: value/heap type lattice, subtyping, structural equivalence
//! - `validator`: per-function stack-effect checking with a polymorphic stack
//! - `store` / `linker` / `const_eval`: address spaces, import resolution,
//!   instantiation
//! - `code` / `fusion`: flattened, branch-resolved code and the peephole
//!   fusion pass run over it at link time
//! - `executor` / `interpreter` / `numeric` / `memory`: fetch-execute loop,
//!   values, frames, traps, arithmetic and linear memory
//! - `host`: host function bindings (sync and async)
//! - `engine`: the `WasmRuntime` facade embedders drive
//!
//! # Concurrency
//!
//! Execution is synchronous; an [`executor::ExecContext`] must not be driven
//! from two threads at once. A [`store::Store`] may back many module
//! instances, but concurrent invocations touching the same tables or
//! memories must be serialised by the caller.

#![no_std]

extern crate alloc;

pub mod code;
pub mod const_eval;
pub mod engine;
pub mod executor;
pub mod fusion;
pub mod host;
pub mod interpreter;
pub mod linker;
pub mod memory;
pub mod module;
pub mod numeric;
pub mod opcodes;
pub mod parser;
pub mod store;
pub mod types;
pub mod validator;

use bitflags::bitflags;

pub use engine::WasmRuntime;
pub use interpreter::{Ref, Trap, TrapKind, Value};
pub use linker::{InstantiationError, LinkError, Linker};
pub use module::Module;
pub use parser::{FormatError, ParserConfig};
pub use store::Store;
pub use types::{FuncType, ValType};
pub use validator::{Diagnostics, ValidationError};

/// Errors from every phase of the module lifecycle.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Malformed binary.
    #[error("malformed module: {0}")]
    Format(#[from] FormatError),
    /// Module failed validation.
    #[error("invalid module: {0}")]
    Validation(#[from] Diagnostics),
    /// Import resolution failed.
    #[error("unlinkable: {0}")]
    Link(#[from] LinkError),
    /// Segment initialisation or start function failed.
    #[error("uninstantiable: {0}")]
    Instantiation(#[from] InstantiationError),
    /// Runtime fault during invocation.
    #[error("trap: {0}")]
    Trap(#[from] Trap),
    /// No function, global or memory exported under this name.
    #[error("unknown export {0}")]
    UnknownExport(alloc::string::String),
}

bitflags! {
    /// Post-MVP proposals accepted by the parser and validator.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Features: u32 {
        const MULTI_VALUE = 1 << 0;
        const BULK_MEMORY = 1 << 1;
        const REFERENCE_TYPES = 1 << 2;
        const SIGN_EXTENSION = 1 << 3;
        const SATURATING_FLOAT_TO_INT = 1 << 4;
        const TAIL_CALL = 1 << 5;
        const FUNCTION_REFERENCES = 1 << 6;
        const EXTENDED_CONST = 1 << 7;
        const MULTI_MEMORY = 1 << 8;
        /// i31 references and struct/array type definitions.
        const GC_TYPES = 1 << 9;
    }
}

impl Default for Features {
    fn default() -> Self {
        Features::all()
    }
}

/// Runtime configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Maximum memory per instance (in pages, 64KB each).
    pub max_memory_pages: u32,
    /// Maximum table size.
    pub max_table_elements: u32,
    /// Maximum nesting of Wasm calls before `call stack exhausted`.
    pub max_call_depth: usize,
    /// Maximum operand stack entries across all frames.
    pub max_value_stack: usize,
    /// Fuel per invocation; `None` disables metering.
    pub fuel: Option<u64>,
    /// Run the fusion pass when linking function bodies.
    pub fusion: bool,
    /// Compare runtime stack heights with the validator's at every step.
    pub check_stack_heights: bool,
    /// Enabled proposals.
    pub features: Features,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            max_memory_pages: 65536, // 4 GiB
            max_table_elements: 10_000_000,
            max_call_depth: 1024,
            max_value_stack: 1024 * 1024,
            fuel: None,
            fusion: true,
            check_stack_heights: false,
            features: Features::default(),
        }
    }
}

impl RuntimeConfig {
    /// Parser settings derived from this configuration.
    pub fn parser_config(&self) -> ParserConfig {
        ParserConfig {
            features: self.features,
            ..ParserConfig::default()
        }
    }
}
