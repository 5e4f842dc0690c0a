//! WASM instruction executor.
//!
//! Executes compiled function code (see [`crate::code`]) on the stack
//! machine defined in `interpreter.rs`. One [`ExecContext`] drives one
//! invocation: it owns the operand stack and the frame stack and borrows the
//! [`Store`] for the duration of the call.
//!
//! Wasm-to-Wasm calls never recurse on the native stack; they push a
//! [`Frame`] and the fetch loop continues in the callee. Host calls leave the
//! loop, run (or await) the host function, push its results and resume.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use crate::code::{CompiledFunc, Dest, LoadKind, Op, Operand, StoreKind, Target};
use crate::host::{check_results, Caller, HostFunc};
use crate::interpreter::{Frame, Ref, Trap, TrapKind, Value, ValueStack};
use crate::memory;
use crate::numeric;
use crate::opcodes::Opcode;
use crate::store::{FuncAddr, FuncInstance, ModuleInstance, Store};
use crate::types::{equivalent_func_types, FuncType};
use crate::RuntimeConfig;

/// Invoke `addr` with `args` to completion.
pub fn invoke(
    store: &mut Store,
    config: &RuntimeConfig,
    addr: FuncAddr,
    args: &[Value],
) -> Result<Vec<Value>, Trap> {
    ExecContext::new(store, config).invoke(addr, args)
}

/// Invoke `addr`, awaiting asynchronous host functions at call boundaries.
pub async fn invoke_async(
    store: &mut Store,
    config: &RuntimeConfig,
    addr: FuncAddr,
    args: Vec<Value>,
) -> Result<Vec<Value>, Trap> {
    ExecContext::new(store, config).invoke_async(addr, &args).await
}

/// A pending host function call.
struct HostCall {
    func: HostFunc,
    ty: FuncType,
    args: Vec<Value>,
    /// Instance of the calling Wasm function.
    instance: Option<Arc<ModuleInstance>>,
    /// Call instruction, for trap reports.
    site: Option<(Opcode, &'static str)>,
}

impl HostCall {
    fn locate(&self, trap: Trap) -> Trap {
        match self.site {
            Some((opcode, name)) => trap.at(opcode, name),
            None => trap,
        }
    }
}

/// Why the fetch loop stopped.
enum Step {
    /// The outermost frame returned.
    Done,
    Host(HostCall),
}

/// What an op did to control flow.
enum Flow {
    Next,
    /// Frames were pushed or popped; reload the top frame.
    Switch,
    Host(HostCall),
}

/// Immutable view of the running frame, cached across ops.
struct Activation {
    code: Arc<CompiledFunc>,
    instance: Arc<ModuleInstance>,
    base: usize,
}

/// Execution state of one invocation.
pub struct ExecContext<'s> {
    store: &'s mut Store,
    stack: ValueStack,
    frames: Vec<Frame>,
    /// Fuel remaining (None = unlimited).
    fuel: Option<u64>,
    max_call_depth: usize,
    max_value_stack: usize,
    check_heights: bool,
}

impl<'s> ExecContext<'s> {
    pub fn new(store: &'s mut Store, config: &RuntimeConfig) -> Self {
        ExecContext {
            store,
            stack: ValueStack::new(config.max_value_stack),
            frames: Vec::new(),
            fuel: config.fuel,
            max_call_depth: config.max_call_depth,
            max_value_stack: config.max_value_stack,
            check_heights: config.check_stack_heights,
        }
    }

    /// Fuel left after the last invocation, if metering is on.
    pub fn remaining_fuel(&self) -> Option<u64> {
        self.fuel
    }

    pub fn invoke(&mut self, addr: FuncAddr, args: &[Value]) -> Result<Vec<Value>, Trap> {
        let (arity, mut pending) = self.begin(addr, args)?;
        loop {
            if let Some(call) = pending.take() {
                let caller = Caller::new(&mut *self.store, call.instance.clone());
                let results = call
                    .func
                    .call(caller, &call.args)
                    .map_err(|t| call.locate(t))?;
                self.complete(&call, results)?;
            }
            match self.run() {
                Ok(Step::Done) => break,
                Ok(Step::Host(call)) => pending = Some(call),
                Err(trap) => return Err(self.unwind(trap)),
            }
        }
        self.finish(arity)
    }

    pub async fn invoke_async(&mut self, addr: FuncAddr, args: &[Value]) -> Result<Vec<Value>, Trap> {
        let (arity, mut pending) = self.begin(addr, args)?;
        loop {
            if let Some(call) = pending.take() {
                let caller = Caller::new(&mut *self.store, call.instance.clone());
                let results = call
                    .func
                    .call_async(caller, call.args.clone())
                    .await
                    .map_err(|t| call.locate(t))?;
                self.complete(&call, results)?;
            }
            match self.run() {
                Ok(Step::Done) => break,
                Ok(Step::Host(call)) => pending = Some(call),
                Err(trap) => return Err(self.unwind(trap)),
            }
        }
        self.finish(arity)
    }

    // ========================================================================
    // Entry and exit
    // ========================================================================

    /// Check arguments and set up the outermost call. Returns the result
    /// arity and, for a host function, the call to make.
    fn begin(&mut self, addr: FuncAddr, args: &[Value]) -> Result<(usize, Option<HostCall>), Trap> {
        self.stack.truncate(0);
        self.frames.clear();

        let store = &*self.store;
        let (ty, space) = store
            .func_signature(addr)
            .ok_or_else(|| Trap::internal("dangling function address"))?;
        if args.len() != ty.params.len()
            || !args
                .iter()
                .zip(&ty.params)
                .all(|(v, t)| store.value_matches(v, *t, space))
        {
            return Err(Trap::host(alloc::format!(
                "arguments do not match {}",
                ty
            )));
        }

        let arity = ty.results.len();
        match self.store.func_ref(addr)?.clone() {
            FuncInstance::Host { ty, func } => Ok((
                arity,
                Some(HostCall {
                    func,
                    ty,
                    args: args.to_vec(),
                    instance: None,
                    site: None,
                }),
            )),
            FuncInstance::Wasm { instance, code } => {
                let instance = Arc::clone(self.store.instance_ref(instance)?);
                self.push_frame(addr, instance, code, args.to_vec())?;
                Ok((arity, None))
            }
        }
    }

    /// Push a host function's results after checking them.
    fn complete(&mut self, call: &HostCall, results: Vec<Value>) -> Result<(), Trap> {
        check_results(self.store, &call.ty, &results).map_err(|t| call.locate(t))?;
        self.stack.extend(results)
    }

    fn finish(&mut self, arity: usize) -> Result<Vec<Value>, Trap> {
        let results = self.stack.pop_n(arity)?;
        if !self.stack.is_empty() {
            return Err(Trap::internal("operand stack not empty after return"));
        }
        Ok(results)
    }

    /// Drop every frame after a trap.
    fn unwind(&mut self, trap: Trap) -> Trap {
        self.frames.clear();
        self.stack.truncate(0);
        trap
    }

    // ========================================================================
    // Fetch loop
    // ========================================================================

    fn run(&mut self) -> Result<Step, Trap> {
        'frames: loop {
            let Some(frame) = self.frames.last() else {
                return Ok(Step::Done);
            };
            let act = Activation {
                code: Arc::clone(&frame.code),
                instance: Arc::clone(&frame.instance),
                base: frame.base,
            };
            let mut pc = frame.pc;

            loop {
                let at = pc;
                let op = act
                    .code
                    .ops
                    .get(at)
                    .ok_or_else(|| Trap::internal("execution ran past the end of a function"))?;
                match self.step(op, &act, &mut pc) {
                    Ok(Flow::Next) => {}
                    Ok(Flow::Switch) => continue 'frames,
                    Ok(Flow::Host(mut call)) => {
                        call.site = site(&act, at);
                        return Ok(Step::Host(call));
                    }
                    Err(trap) => {
                        return Err(match site(&act, at) {
                            Some((opcode, name)) => trap.at(opcode, name),
                            None => trap,
                        })
                    }
                }
            }
        }
    }

    /// Fuel and height checks that precede every op.
    fn meter(&mut self, op: &Op, act: &Activation, pc: usize) -> Result<(), Trap> {
        if let Some(fuel) = &mut self.fuel {
            let cost = op.cost();
            if *fuel < cost {
                *fuel = 0;
                return Err(Trap::new(TrapKind::OutOfFuel));
            }
            *fuel -= cost;
        }
        if self.check_heights {
            if let Some(Some(expected)) = act.code.heights.get(pc) {
                let actual = self.stack.len() - act.base.min(self.stack.len());
                if actual != *expected as usize {
                    return Err(Trap::internal(alloc::format!(
                        "operand height {} at op {} of function {}, validated height {}",
                        actual,
                        pc,
                        act.code.func_index,
                        expected
                    )));
                }
            }
        }
        Ok(())
    }

    fn step(&mut self, op: &Op, act: &Activation, pc: &mut usize) -> Result<Flow, Trap> {
        self.meter(op, act, *pc)?;
        *pc += 1;

        match op {
            // ====== Control ======
            Op::Unreachable => return Err(Trap::new(TrapKind::Unreachable)),
            Op::Jump(target) => *pc = *target as usize,
            Op::JumpIfZero(target) => {
                if self.stack.pop_i32()? == 0 {
                    *pc = *target as usize;
                }
            }
            Op::Br(target) => self.branch(act, target, pc)?,
            Op::BrIf(target) => {
                if self.stack.pop_i32()? != 0 {
                    self.branch(act, target, pc)?;
                }
            }
            Op::BrTable { targets, default } => {
                let index = self.stack.pop_u32()?;
                let target = targets.get(index as usize).unwrap_or(default);
                self.branch(act, target, pc)?;
            }
            Op::Return => {
                let frame = self
                    .frames
                    .pop()
                    .ok_or_else(|| Trap::internal("return without a frame"))?;
                self.stack.keep_top(frame.base, frame.arity)?;
                return Ok(Flow::Switch);
            }
            Op::Call(idx) => {
                let addr = act.instance.func(*idx)?;
                return self.call(addr, false, *pc);
            }
            Op::ReturnCall(idx) => {
                let addr = act.instance.func(*idx)?;
                return self.call(addr, true, *pc);
            }
            Op::CallIndirect { ty, table } => {
                let addr = self.indirect_target(act, *ty, *table)?;
                return self.call(addr, false, *pc);
            }
            Op::ReturnCallIndirect { ty, table } => {
                let addr = self.indirect_target(act, *ty, *table)?;
                return self.call(addr, true, *pc);
            }
            Op::CallRef => {
                let addr = self.ref_target()?;
                return self.call(addr, false, *pc);
            }
            Op::ReturnCallRef => {
                let addr = self.ref_target()?;
                return self.call(addr, true, *pc);
            }

            // ====== Parametric ======
            Op::Drop => {
                self.stack.pop()?;
            }
            Op::Select => {
                let cond = self.stack.pop_i32()?;
                let b = self.stack.pop()?;
                let a = self.stack.pop()?;
                self.stack.push(if cond != 0 { a } else { b })?;
            }

            // ====== Variables ======
            Op::LocalGet(idx) => {
                let value = *self.local(*idx)?;
                self.stack.push(value)?;
            }
            Op::LocalSet(idx) => {
                let value = self.stack.pop()?;
                *self.local(*idx)? = value;
            }
            Op::LocalTee(idx) => {
                let value = *self.stack.peek()?;
                *self.local(*idx)? = value;
            }
            Op::GlobalGet(idx) => {
                let addr = act.instance.global(*idx)?;
                let value = self.store.global_ref(addr)?.value;
                self.stack.push(value)?;
            }
            Op::GlobalSet(idx) => {
                let value = self.stack.pop()?;
                let addr = act.instance.global(*idx)?;
                self.store.global_ref_mut(addr)?.value = value;
            }

            // ====== Tables ======
            Op::TableGet(t) => {
                let index = self.stack.pop_u32()?;
                let addr = act.instance.table(*t)?;
                let value = self
                    .store
                    .table_ref(addr)?
                    .get(index)
                    .map_err(|e| e.with_operands(vec![Value::I32(index as i32)]))?;
                self.stack.push(value)?;
            }
            Op::TableSet(t) => {
                let value = self.stack.pop_ref()?;
                let index = self.stack.pop_u32()?;
                let addr = act.instance.table(*t)?;
                self.store
                    .table_ref_mut(addr)?
                    .set(index, value)
                    .map_err(|e| e.with_operands(vec![Value::I32(index as i32)]))?;
            }
            Op::TableInit { elem, table } => {
                let (dst, src, len) = self.pop_triple()?;
                let table = act.instance.table(*table)?;
                let elem = act.instance.elem(*elem)?;
                self.store
                    .table_init(table, elem, dst, src, len)
                    .map_err(|e| e.with_operands(triple(dst, src, len)))?;
            }
            Op::ElemDrop(idx) => {
                let addr = act.instance.elem(*idx)?;
                if let Some(seg) = self.store.elem_mut(addr) {
                    seg.items = Vec::new();
                }
            }
            Op::TableCopy { dst, src } => {
                let (d, s, n) = self.pop_triple()?;
                let dst_addr = act.instance.table(*dst)?;
                let src_addr = act.instance.table(*src)?;
                let result = if dst_addr == src_addr {
                    self.store.table_ref_mut(dst_addr)?.copy_within(d, s, n)
                } else {
                    let (dst_table, src_table) = self.store.table_pair_mut(dst_addr, src_addr)?;
                    dst_table.init(d, &src_table.elements, s, n)
                };
                result.map_err(|e| e.with_operands(triple(d, s, n)))?;
            }
            Op::TableGrow(t) => {
                let delta = self.stack.pop_u32()?;
                let init = self.stack.pop_ref()?;
                let addr = act.instance.table(*t)?;
                let old = self.store.table_ref_mut(addr)?.grow(delta, init);
                self.stack.push(old.map_or(-1, |size| size as i32))?;
            }
            Op::TableSize(t) => {
                let addr = act.instance.table(*t)?;
                let size = self.store.table_ref(addr)?.size();
                self.stack.push(size as i32)?;
            }
            Op::TableFill(t) => {
                let len = self.stack.pop_u32()?;
                let value = self.stack.pop_ref()?;
                let start = self.stack.pop_u32()?;
                let addr = act.instance.table(*t)?;
                self.store
                    .table_ref_mut(addr)?
                    .fill(start, value, len)
                    .map_err(|e| e.with_operands(vec![Value::I32(start as i32), Value::I32(len as i32)]))?;
            }

            // ====== Memory ======
            Op::Load { kind, mem, offset } => {
                let base = self.stack.pop_u32()?;
                self.load(act, *kind, *mem, *offset, base)?;
            }
            Op::Store { kind, mem, offset } => self.store_op(act, *kind, *mem, *offset)?,
            Op::MemorySize(m) => {
                let addr = act.instance.memory(*m)?;
                let pages = self.store.memory_ref(addr)?.pages();
                self.stack.push(pages as i32)?;
            }
            Op::MemoryGrow(m) => {
                let delta = self.stack.pop_u32()?;
                let addr = act.instance.memory(*m)?;
                let old = self.store.memory_ref_mut(addr)?.grow(delta);
                self.stack.push(old.map_or(-1, |pages| pages as i32))?;
            }
            Op::MemoryInit { data, mem } => {
                let (dst, src, len) = self.pop_triple()?;
                let mem = act.instance.memory(*mem)?;
                let data = act.instance.data(*data)?;
                self.store
                    .memory_init(mem, data, dst as u64, src as u64, len as u64)
                    .map_err(|e| e.with_operands(triple(dst, src, len)))?;
            }
            Op::DataDrop(idx) => {
                let addr = act.instance.data(*idx)?;
                if let Some(seg) = self.store.data_mut(addr) {
                    seg.bytes = Vec::new();
                }
            }
            Op::MemoryCopy { dst, src } => {
                let (d, s, n) = self.pop_triple()?;
                let dst_addr = act.instance.memory(*dst)?;
                let src_addr = act.instance.memory(*src)?;
                let result = if dst_addr == src_addr {
                    self.store
                        .memory_ref_mut(dst_addr)?
                        .copy_within(s as u64, d as u64, n as u64)
                } else {
                    let (dst_mem, src_mem) = self.store.memory_pair_mut(dst_addr, src_addr)?;
                    memory::copy_between(dst_mem, d as u64, src_mem, s as u64, n as u64)
                };
                result.map_err(|e| e.with_operands(triple(d, s, n)))?;
            }
            Op::MemoryFill(m) => {
                let len = self.stack.pop_u32()?;
                let value = self.stack.pop_i32()?;
                let dst = self.stack.pop_u32()?;
                let addr = act.instance.memory(*m)?;
                self.store
                    .memory_ref_mut(addr)?
                    .fill(dst as u64, len as u64, value as u8)
                    .map_err(|e| e.with_operands(triple(dst, value as u32, len)))?;
            }

            // ====== Numeric ======
            Op::Const(value) => self.stack.push(*value)?,
            Op::Numeric(instr) => numeric::execute(instr, &mut self.stack)?,

            // ====== References ======
            Op::RefIsNull => {
                let value = self.stack.pop_ref()?;
                self.stack.push(value.is_null() as i32)?;
            }
            Op::RefFunc(idx) => {
                let addr = act.instance.func(*idx)?;
                self.stack.push(Ref::Func(addr))?;
            }
            Op::RefEq => {
                let b = self.stack.pop_ref()?;
                let a = self.stack.pop_ref()?;
                self.stack.push((a == b) as i32)?;
            }
            Op::RefAsNonNull => {
                if let Value::Ref(Ref::Null) = self.stack.peek()? {
                    return Err(Trap::new(TrapKind::NullReference));
                }
            }
            Op::BrOnNull(target) => {
                let value = self.stack.pop_ref()?;
                if value.is_null() {
                    self.branch(act, target, pc)?;
                } else {
                    self.stack.push(value)?;
                }
            }
            Op::BrOnNonNull(target) => {
                let value = self.stack.pop_ref()?;
                if !value.is_null() {
                    self.stack.push(value)?;
                    self.branch(act, target, pc)?;
                }
            }
            Op::RefI31 => {
                let value = self.stack.pop_i32()?;
                self.stack.push(Ref::i31(value))?;
            }
            Op::I31GetS | Op::I31GetU => {
                let bits = match self.stack.pop_ref()? {
                    Ref::I31(bits) => bits,
                    Ref::Null => return Err(Trap::new(TrapKind::NullReference)),
                    other => {
                        return Err(Trap::internal(alloc::format!("{} is not an i31", other)))
                    }
                };
                let value = if matches!(op, Op::I31GetS) {
                    ((bits << 1) as i32) >> 1
                } else {
                    bits as i32
                };
                self.stack.push(value)?;
            }

            // ====== Fused ======
            Op::FusedBinary {
                op: bin,
                lhs,
                rhs,
                dest,
            } => {
                let rhs = self.operand(rhs)?;
                let lhs = self.operand(lhs)?;
                let result = bin
                    .apply(lhs, rhs)
                    .ok_or_else(|| Trap::internal("fused operand type confusion"))?;
                match dest {
                    Dest::Stack => self.stack.push(result)?,
                    Dest::Local(idx) => *self.local(*idx)? = result,
                }
            }
            Op::LocalCopy { src, dst } => {
                let value = *self.local(*src)?;
                *self.local(*dst)? = value;
            }
            Op::LocalConstSet { value, dst } => *self.local(*dst)? = *value,
            Op::LocalLoad {
                local,
                kind,
                mem,
                offset,
            } => {
                let base = match self.local(*local)? {
                    Value::I32(v) => *v as u32,
                    _ => return Err(Trap::internal("address local is not an i32")),
                };
                self.load(act, *kind, *mem, *offset, base)?;
            }
        }
        Ok(Flow::Next)
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn local(&mut self, idx: u32) -> Result<&mut Value, Trap> {
        self.frames
            .last_mut()
            .and_then(|f| f.locals.get_mut(idx as usize))
            .ok_or_else(|| Trap::internal(alloc::format!("local {} out of range", idx)))
    }

    fn operand(&mut self, operand: &Operand) -> Result<Value, Trap> {
        match operand {
            Operand::Stack => self.stack.pop(),
            Operand::Local(idx) => Ok(*self.local(*idx)?),
            Operand::Const(value) => Ok(*value),
        }
    }

    /// Pop the `(dst, src, len)` operands of a bulk instruction.
    fn pop_triple(&mut self) -> Result<(u32, u32, u32), Trap> {
        let len = self.stack.pop_u32()?;
        let src = self.stack.pop_u32()?;
        let dst = self.stack.pop_u32()?;
        Ok((dst, src, len))
    }

    fn branch(&mut self, act: &Activation, target: &Target, pc: &mut usize) -> Result<(), Trap> {
        self.stack
            .keep_top(act.base + target.height as usize, target.arity as usize)?;
        *pc = target.pc as usize;
        Ok(())
    }

    fn load(
        &mut self,
        act: &Activation,
        kind: LoadKind,
        mem: u32,
        offset: u64,
        base: u32,
    ) -> Result<(), Trap> {
        let addr = act.instance.memory(mem)?;
        let memory = self.store.memory_ref(addr)?;
        let ea = base as u64 + offset;
        let value = match kind {
            LoadKind::I32 => memory.load(ea).map(|b| Value::I32(i32::from_le_bytes(b))),
            LoadKind::I64 => memory.load(ea).map(|b| Value::I64(i64::from_le_bytes(b))),
            LoadKind::F32 => memory
                .load(ea)
                .map(|b| Value::F32(f32::from_bits(u32::from_le_bytes(b)))),
            LoadKind::F64 => memory
                .load(ea)
                .map(|b| Value::F64(f64::from_bits(u64::from_le_bytes(b)))),
            LoadKind::I32S8 => memory.load(ea).map(|b| Value::I32(i8::from_le_bytes(b) as i32)),
            LoadKind::I32U8 => memory.load(ea).map(|b| Value::I32(u8::from_le_bytes(b) as i32)),
            LoadKind::I32S16 => memory.load(ea).map(|b| Value::I32(i16::from_le_bytes(b) as i32)),
            LoadKind::I32U16 => memory.load(ea).map(|b| Value::I32(u16::from_le_bytes(b) as i32)),
            LoadKind::I64S8 => memory.load(ea).map(|b| Value::I64(i8::from_le_bytes(b) as i64)),
            LoadKind::I64U8 => memory.load(ea).map(|b| Value::I64(u8::from_le_bytes(b) as i64)),
            LoadKind::I64S16 => memory.load(ea).map(|b| Value::I64(i16::from_le_bytes(b) as i64)),
            LoadKind::I64U16 => memory.load(ea).map(|b| Value::I64(u16::from_le_bytes(b) as i64)),
            LoadKind::I64S32 => memory.load(ea).map(|b| Value::I64(i32::from_le_bytes(b) as i64)),
            LoadKind::I64U32 => memory.load(ea).map(|b| Value::I64(u32::from_le_bytes(b) as i64)),
        }
        .map_err(|e| e.with_operands(vec![Value::I32(base as i32)]))?;
        self.stack.push(value)
    }

    fn store_op(&mut self, act: &Activation, kind: StoreKind, mem: u32, offset: u64) -> Result<(), Trap> {
        let value = self.stack.pop()?;
        let base = self.stack.pop_u32()?;
        let addr = act.instance.memory(mem)?;
        let memory = self.store.memory_ref_mut(addr)?;
        let ea = base as u64 + offset;
        match (kind, value) {
            (StoreKind::I32, Value::I32(v)) => memory.store(ea, v.to_le_bytes()),
            (StoreKind::I64, Value::I64(v)) => memory.store(ea, v.to_le_bytes()),
            (StoreKind::F32, Value::F32(v)) => memory.store(ea, v.to_bits().to_le_bytes()),
            (StoreKind::F64, Value::F64(v)) => memory.store(ea, v.to_bits().to_le_bytes()),
            (StoreKind::I32As8, Value::I32(v)) => memory.store(ea, (v as u8).to_le_bytes()),
            (StoreKind::I32As16, Value::I32(v)) => memory.store(ea, (v as u16).to_le_bytes()),
            (StoreKind::I64As8, Value::I64(v)) => memory.store(ea, (v as u8).to_le_bytes()),
            (StoreKind::I64As16, Value::I64(v)) => memory.store(ea, (v as u16).to_le_bytes()),
            (StoreKind::I64As32, Value::I64(v)) => memory.store(ea, (v as u32).to_le_bytes()),
            _ => return Err(Trap::internal("store operand type confusion")),
        }
        .map_err(|e| e.with_operands(vec![Value::I32(base as i32), value]))
    }

    /// Resolve and type-check a `call_indirect` target.
    fn indirect_target(&mut self, act: &Activation, ty: u32, table: u32) -> Result<FuncAddr, Trap> {
        let index = self.stack.pop_u32()?;
        let table = act.instance.table(table)?;
        let slot = self
            .store
            .table_ref(table)?
            .get(index)
            .map_err(|e| e.with_operands(vec![Value::I32(index as i32)]))?;
        let addr = match slot {
            Ref::Func(addr) => addr,
            Ref::Null => {
                return Err(Trap::new(TrapKind::UninitializedElement)
                    .with_operands(vec![Value::I32(index as i32)]))
            }
            other => {
                return Err(Trap::internal(alloc::format!(
                    "table slot holds {}",
                    other
                )))
            }
        };

        let types = act.instance.types();
        let expected = types
            .func_type(ty)
            .ok_or_else(|| Trap::internal(alloc::format!("type {} is not a function type", ty)))?;
        let (actual, actual_space) = self
            .store
            .func_signature(addr)
            .ok_or_else(|| Trap::internal("dangling function address"))?;
        if !equivalent_func_types(expected, types, actual, actual_space) {
            return Err(Trap::new(TrapKind::IndirectCallTypeMismatch)
                .with_operands(vec![Value::I32(index as i32)]));
        }
        Ok(addr)
    }

    fn ref_target(&mut self) -> Result<FuncAddr, Trap> {
        match self.stack.pop_ref()? {
            Ref::Func(addr) => Ok(addr),
            Ref::Null => Err(Trap::new(TrapKind::NullReference)),
            other => Err(Trap::internal(alloc::format!("{} is not callable", other))),
        }
    }

    /// Call (or tail-call) `addr`; `resume` is the caller's next op.
    fn call(&mut self, addr: FuncAddr, tail: bool, resume: usize) -> Result<Flow, Trap> {
        let caller = match self.frames.last_mut() {
            Some(frame) => {
                frame.pc = resume;
                Some(Arc::clone(&frame.instance))
            }
            None => None,
        };

        match self.store.func_ref(addr)?.clone() {
            FuncInstance::Wasm { instance, code } => {
                let instance = Arc::clone(self.store.instance_ref(instance)?);
                let args = self.stack.pop_n(code.ty.params.len())?;
                if tail {
                    self.pop_frame()?;
                } else if self.frames.len() >= self.max_call_depth {
                    return Err(Trap::new(TrapKind::CallStackExhausted));
                }
                self.push_frame(addr, instance, code, args)?;
                Ok(Flow::Switch)
            }
            FuncInstance::Host { ty, func } => {
                let args = self.stack.pop_n(ty.params.len())?;
                if tail {
                    self.pop_frame()?;
                }
                Ok(Flow::Host(HostCall {
                    func,
                    ty,
                    args,
                    instance: caller,
                    site: None,
                }))
            }
        }
    }

    /// Discard the current frame and its operands (tail calls).
    fn pop_frame(&mut self) -> Result<(), Trap> {
        let frame = self
            .frames
            .pop()
            .ok_or_else(|| Trap::internal("tail call without a frame"))?;
        self.stack.truncate(frame.base);
        Ok(())
    }

    fn push_frame(
        &mut self,
        func: FuncAddr,
        instance: Arc<ModuleInstance>,
        code: Arc<CompiledFunc>,
        mut locals: Vec<Value>,
    ) -> Result<(), Trap> {
        let base = self.stack.len();
        if base + code.max_height as usize > self.max_value_stack {
            return Err(Trap::new(TrapKind::ValueStackExhausted));
        }
        locals.reserve(code.locals.len());
        // Non-defaultable locals are set before they are read.
        locals.extend(
            code.locals
                .iter()
                .map(|ty| Value::default_for(*ty).unwrap_or(Value::Ref(Ref::Null))),
        );
        let arity = code.ty.results.len();
        self.frames.push(Frame {
            func,
            instance,
            code,
            locals,
            pc: 0,
            base,
            arity,
        });
        Ok(())
    }
}

fn site(act: &Activation, pc: usize) -> Option<(Opcode, &'static str)> {
    act.code
        .source_instruction(&act.instance.module, pc)
        .map(|instr| (instr.opcode(), instr.name()))
}

fn triple(a: u32, b: u32, c: u32) -> Vec<Value> {
    vec![Value::I32(a as i32), Value::I32(b as i32), Value::I32(c as i32)]
}
