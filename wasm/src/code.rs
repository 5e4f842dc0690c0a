//! Flattened function code.
//!
//! A validated function body is lowered once, at instantiation, into a flat
//! sequence of [`Op`]s. Structured control disappears: `block`, `loop`, `nop`
//! and inner `end`s emit nothing, `if`/`else` become conditional and
//! unconditional jumps, and every branch carries a resolved [`Target`]: the
//! op to continue at, the operand height the label was entered at, and how
//! many values cross the branch. Heights come from the validator, so branches
//! never re-scan the body at run time.

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::interpreter::{Ref, Value};
use crate::module::Module;
use crate::opcodes::Instruction;
use crate::types::{BlockType, FuncType, TypeSpace, ValType};
use crate::validator::FunctionInfo;

/// Resolved branch destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    /// Op index to continue at.
    pub pc: u32,
    /// Operand height, relative to the frame base, at label entry.
    pub height: u32,
    /// Values kept on top of the stack across the branch.
    pub arity: u32,
}

/// Memory load flavours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadKind {
    I32,
    I64,
    F32,
    F64,
    I32S8,
    I32U8,
    I32S16,
    I32U16,
    I64S8,
    I64U8,
    I64S16,
    I64U16,
    I64S32,
    I64U32,
}

impl LoadKind {
    pub fn of(instr: &Instruction) -> Option<LoadKind> {
        use Instruction::*;
        Some(match instr {
            I32Load(_) => LoadKind::I32,
            I64Load(_) => LoadKind::I64,
            F32Load(_) => LoadKind::F32,
            F64Load(_) => LoadKind::F64,
            I32Load8S(_) => LoadKind::I32S8,
            I32Load8U(_) => LoadKind::I32U8,
            I32Load16S(_) => LoadKind::I32S16,
            I32Load16U(_) => LoadKind::I32U16,
            I64Load8S(_) => LoadKind::I64S8,
            I64Load8U(_) => LoadKind::I64U8,
            I64Load16S(_) => LoadKind::I64S16,
            I64Load16U(_) => LoadKind::I64U16,
            I64Load32S(_) => LoadKind::I64S32,
            I64Load32U(_) => LoadKind::I64U32,
            _ => return None,
        })
    }
}

/// Memory store flavours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    I32,
    I64,
    F32,
    F64,
    I32As8,
    I32As16,
    I64As8,
    I64As16,
    I64As32,
}

impl StoreKind {
    pub fn of(instr: &Instruction) -> Option<StoreKind> {
        use Instruction::*;
        Some(match instr {
            I32Store(_) => StoreKind::I32,
            I64Store(_) => StoreKind::I64,
            F32Store(_) => StoreKind::F32,
            F64Store(_) => StoreKind::F64,
            I32Store8(_) => StoreKind::I32As8,
            I32Store16(_) => StoreKind::I32As16,
            I64Store8(_) => StoreKind::I64As8,
            I64Store16(_) => StoreKind::I64As16,
            I64Store32(_) => StoreKind::I64As32,
            _ => return None,
        })
    }
}

// ============================================================================
// Fused Operands
// ============================================================================

/// Where a fused binary op takes an operand from.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// Popped from the operand stack.
    Stack,
    Local(u32),
    Const(Value),
}

impl Operand {
    fn is_stack(&self) -> bool {
        matches!(self, Operand::Stack)
    }
}

/// Where a fused binary op puts its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dest {
    Stack,
    Local(u32),
}

macro_rules! bin_ops {
    ($($name:ident: $ty:ident, |$a:ident, $b:ident| $body:expr;)*) => {
        /// Integer binary operations that cannot trap, the ones fusion may
        /// fold operand producers into.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum BinOp {
            $($name,)*
        }

        impl BinOp {
            pub fn of(instr: &Instruction) -> Option<BinOp> {
                match instr {
                    $( Instruction::$name => Some(BinOp::$name), )*
                    _ => None,
                }
            }

            /// Type of both operands.
            pub fn operand_type(self) -> ValType {
                match self {
                    $( BinOp::$name => ValType::$ty, )*
                }
            }

            /// Apply to two operands of [`Self::operand_type`].
            pub fn apply(self, lhs: Value, rhs: Value) -> Option<Value> {
                match (self, lhs, rhs) {
                    $( (BinOp::$name, Value::$ty($a), Value::$ty($b)) => Some(Value::from($body)), )*
                    _ => None,
                }
            }
        }
    };
}

bin_ops! {
    I32Add: I32, |a, b| a.wrapping_add(b);
    I32Sub: I32, |a, b| a.wrapping_sub(b);
    I32Mul: I32, |a, b| a.wrapping_mul(b);
    I32And: I32, |a, b| a & b;
    I32Or: I32, |a, b| a | b;
    I32Xor: I32, |a, b| a ^ b;
    I32Shl: I32, |a, b| a.wrapping_shl(b as u32);
    I32ShrS: I32, |a, b| a.wrapping_shr(b as u32);
    I32ShrU: I32, |a, b| (a as u32).wrapping_shr(b as u32) as i32;
    I32Rotl: I32, |a, b| a.rotate_left(b as u32);
    I32Rotr: I32, |a, b| a.rotate_right(b as u32);
    I32Eq: I32, |a, b| (a == b) as i32;
    I32Ne: I32, |a, b| (a != b) as i32;
    I32LtS: I32, |a, b| (a < b) as i32;
    I32LtU: I32, |a, b| ((a as u32) < (b as u32)) as i32;
    I32GtS: I32, |a, b| (a > b) as i32;
    I32GtU: I32, |a, b| ((a as u32) > (b as u32)) as i32;
    I32LeS: I32, |a, b| (a <= b) as i32;
    I32LeU: I32, |a, b| ((a as u32) <= (b as u32)) as i32;
    I32GeS: I32, |a, b| (a >= b) as i32;
    I32GeU: I32, |a, b| ((a as u32) >= (b as u32)) as i32;
    I64Add: I64, |a, b| a.wrapping_add(b);
    I64Sub: I64, |a, b| a.wrapping_sub(b);
    I64Mul: I64, |a, b| a.wrapping_mul(b);
    I64And: I64, |a, b| a & b;
    I64Or: I64, |a, b| a | b;
    I64Xor: I64, |a, b| a ^ b;
    I64Shl: I64, |a, b| a.wrapping_shl(b as u32);
    I64ShrS: I64, |a, b| a.wrapping_shr(b as u32);
    I64ShrU: I64, |a, b| (a as u64).wrapping_shr(b as u32) as i64;
    I64Rotl: I64, |a, b| a.rotate_left(b as u32);
    I64Rotr: I64, |a, b| a.rotate_right(b as u32);
    I64Eq: I64, |a, b| (a == b) as i32;
    I64Ne: I64, |a, b| (a != b) as i32;
    I64LtS: I64, |a, b| (a < b) as i32;
    I64LtU: I64, |a, b| ((a as u64) < (b as u64)) as i32;
    I64GtS: I64, |a, b| (a > b) as i32;
    I64GtU: I64, |a, b| ((a as u64) > (b as u64)) as i32;
    I64LeS: I64, |a, b| (a <= b) as i32;
    I64LeU: I64, |a, b| ((a as u64) <= (b as u64)) as i32;
    I64GeS: I64, |a, b| (a >= b) as i32;
    I64GeU: I64, |a, b| ((a as u64) >= (b as u64)) as i32;
}

// ============================================================================
// Ops
// ============================================================================

/// One interpreter step. Function, table, memory, global, element and data
/// indices stay module-relative and are resolved through the frame's
/// instance when executed.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    // ====== control ======
    Unreachable,
    /// Unconditional jump to an op index (`else`).
    Jump(u32),
    /// Pop an i32 and jump when it is zero (`if`).
    JumpIfZero(u32),
    Br(Target),
    BrIf(Target),
    BrTable {
        targets: Box<[Target]>,
        default: Target,
    },
    /// `return`, and the final `end` of the body.
    Return,
    Call(u32),
    CallIndirect {
        ty: u32,
        table: u32,
    },
    ReturnCall(u32),
    ReturnCallIndirect {
        ty: u32,
        table: u32,
    },
    CallRef,
    ReturnCallRef,

    // ====== parametric / variables ======
    Drop,
    Select,
    LocalGet(u32),
    LocalSet(u32),
    LocalTee(u32),
    GlobalGet(u32),
    GlobalSet(u32),

    // ====== tables ======
    TableGet(u32),
    TableSet(u32),
    TableInit {
        elem: u32,
        table: u32,
    },
    ElemDrop(u32),
    TableCopy {
        dst: u32,
        src: u32,
    },
    TableGrow(u32),
    TableSize(u32),
    TableFill(u32),

    // ====== memory ======
    Load {
        kind: LoadKind,
        mem: u32,
        offset: u64,
    },
    Store {
        kind: StoreKind,
        mem: u32,
        offset: u64,
    },
    MemorySize(u32),
    MemoryGrow(u32),
    MemoryInit {
        data: u32,
        mem: u32,
    },
    DataDrop(u32),
    MemoryCopy {
        dst: u32,
        src: u32,
    },
    MemoryFill(u32),

    // ====== numeric ======
    Const(Value),
    /// Any numeric or conversion instruction, evaluated by `numeric::execute`.
    Numeric(Instruction),

    // ====== references ======
    RefIsNull,
    RefFunc(u32),
    RefEq,
    RefAsNonNull,
    BrOnNull(Target),
    BrOnNonNull(Target),
    RefI31,
    I31GetS,
    I31GetU,

    // ====== fused ======
    /// Binary op with its operand producers and result consumer folded in.
    FusedBinary {
        op: BinOp,
        lhs: Operand,
        rhs: Operand,
        dest: Dest,
    },
    /// `local.get src; local.set dst`
    LocalCopy {
        src: u32,
        dst: u32,
    },
    /// `<const>; local.set dst`
    LocalConstSet {
        value: Value,
        dst: u32,
    },
    /// `local.get local; <load>`
    LocalLoad {
        local: u32,
        kind: LoadKind,
        mem: u32,
        offset: u64,
    },
}

impl Op {
    /// Visit every op index this op may jump to.
    pub fn for_each_pc(&mut self, mut f: impl FnMut(&mut u32)) {
        match self {
            Op::Jump(pc) | Op::JumpIfZero(pc) => f(pc),
            Op::Br(t) | Op::BrIf(t) | Op::BrOnNull(t) | Op::BrOnNonNull(t) => f(&mut t.pc),
            Op::BrTable { targets, default } => {
                for t in targets.iter_mut() {
                    f(&mut t.pc);
                }
                f(&mut default.pc);
            }
            _ => {}
        }
    }

    pub fn is_branch(&self) -> bool {
        matches!(
            self,
            Op::Jump(_)
                | Op::JumpIfZero(_)
                | Op::Br(_)
                | Op::BrIf(_)
                | Op::BrTable { .. }
                | Op::BrOnNull(_)
                | Op::BrOnNonNull(_)
        )
    }

    pub fn is_fused(&self) -> bool {
        matches!(
            self,
            Op::FusedBinary { .. }
                | Op::LocalCopy { .. }
                | Op::LocalConstSet { .. }
                | Op::LocalLoad { .. }
        )
    }

    /// Number of source instructions this op executes, the fuel it costs.
    pub fn cost(&self) -> u64 {
        match self {
            Op::FusedBinary { lhs, rhs, dest, .. } => {
                1 + !lhs.is_stack() as u64
                    + !rhs.is_stack() as u64
                    + matches!(dest, Dest::Local(_)) as u64
            }
            Op::LocalCopy { .. } | Op::LocalConstSet { .. } | Op::LocalLoad { .. } => 2,
            _ => 1,
        }
    }
}

// ============================================================================
// Compiled Function
// ============================================================================

/// Executable form of one module-defined function.
#[derive(Debug, Clone)]
pub struct CompiledFunc {
    /// Index among the module's defined functions (imports excluded).
    pub func_index: u32,
    pub type_idx: u32,
    pub ty: FuncType,
    /// Declared locals, parameters excluded.
    pub locals: Vec<ValType>,
    pub ops: Vec<Op>,
    /// Static operand height before each op; `None` in unreachable code.
    pub heights: Vec<Option<u32>>,
    /// Index into the body's instructions each op was lowered from.
    pub sources: Vec<u32>,
    /// Highest operand height the body reaches.
    pub max_height: u32,
}

impl CompiledFunc {
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Instruction an op was lowered from, for trap reports.
    pub fn source_instruction<'m>(&self, module: &'m Module, pc: usize) -> Option<&'m Instruction> {
        let at = *self.sources.get(pc)?;
        module
            .code
            .get(self.func_index as usize)?
            .instructions
            .get(at as usize)
    }
}

/// Failure to lower a body that validation accepted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompileError {
    #[error("function {0} has no body")]
    MissingBody(u32),
    #[error("function {0} has no function type")]
    MissingType(u32),
    #[error("unresolvable block type at instruction {0}")]
    BlockType(usize),
    #[error("unbalanced control structure at instruction {0}")]
    Unbalanced(usize),
    #[error("branch depth {depth} out of range at instruction {at}")]
    LabelDepth { depth: u32, at: usize },
}

/// Lower the defined function `func_index` of `module`.
pub fn compile(
    module: &Module,
    func_index: u32,
    info: &FunctionInfo,
) -> Result<CompiledFunc, CompileError> {
    let type_idx = *module
        .functions
        .get(func_index as usize)
        .ok_or(CompileError::MissingType(func_index))?;
    let types = module.type_space();
    let ty = types
        .func_type(type_idx)
        .ok_or(CompileError::MissingType(func_index))?
        .clone();
    let body = module
        .code
        .get(func_index as usize)
        .ok_or(CompileError::MissingBody(func_index))?;

    let mut lowering = Lowering {
        types,
        heights: &info.heights,
        ops: Vec::with_capacity(body.instructions.len()),
        op_heights: Vec::with_capacity(body.instructions.len()),
        sources: Vec::with_capacity(body.instructions.len()),
        labels: Vec::new(),
        ctrls: Vec::new(),
    };
    let label = lowering.new_label();
    lowering.ctrls.push(Ctrl {
        label,
        else_label: None,
        height: 0,
        arity: ty.results.len() as u32,
        is_loop: false,
    });
    for (at, instr) in body.instructions.iter().enumerate() {
        lowering.lower(at, instr)?;
    }
    if !lowering.ctrls.is_empty() {
        return Err(CompileError::Unbalanced(body.instructions.len()));
    }

    let labels = lowering
        .labels
        .into_iter()
        .collect::<Option<Vec<u32>>>()
        .ok_or(CompileError::Unbalanced(body.instructions.len()))?;
    let mut ops = lowering.ops;
    for op in &mut ops {
        op.for_each_pc(|pc| {
            if let Some(&resolved) = labels.get(*pc as usize) {
                *pc = resolved;
            }
        });
    }

    Ok(CompiledFunc {
        func_index,
        type_idx,
        ty,
        locals: body.expanded_locals().collect(),
        ops,
        heights: lowering.op_heights,
        sources: lowering.sources,
        max_height: info.max_height,
    })
}

/// An open block while lowering. Branch targets hold label ids until the
/// whole body is emitted.
struct Ctrl {
    label: u32,
    else_label: Option<u32>,
    height: u32,
    arity: u32,
    is_loop: bool,
}

struct Lowering<'m> {
    types: TypeSpace<'m>,
    heights: &'m [Option<u32>],
    ops: Vec<Op>,
    op_heights: Vec<Option<u32>>,
    sources: Vec<u32>,
    /// Label id -> op index, bound when the label position is reached.
    labels: Vec<Option<u32>>,
    ctrls: Vec<Ctrl>,
}

impl Lowering<'_> {
    fn new_label(&mut self) -> u32 {
        self.labels.push(None);
        self.labels.len() as u32 - 1
    }

    fn bind(&mut self, label: u32) {
        let pc = self.ops.len() as u32;
        if let Some(slot) = self.labels.get_mut(label as usize) {
            *slot = Some(pc);
        }
    }

    fn emit(&mut self, op: Op, at: usize) {
        self.ops.push(op);
        self.op_heights.push(self.heights.get(at).copied().flatten());
        self.sources.push(at as u32);
    }

    fn height(&self, at: usize) -> u32 {
        self.heights.get(at).copied().flatten().unwrap_or(0)
    }

    fn block_type(&self, bt: &BlockType, at: usize) -> Result<FuncType, CompileError> {
        self.types
            .resolve_block_type(bt)
            .ok_or(CompileError::BlockType(at))
    }

    fn target(&self, depth: u32, at: usize) -> Result<Target, CompileError> {
        let ctrl = self
            .ctrls
            .len()
            .checked_sub(1 + depth as usize)
            .and_then(|i| self.ctrls.get(i))
            .ok_or(CompileError::LabelDepth { depth, at })?;
        Ok(Target {
            pc: ctrl.label,
            height: ctrl.height,
            arity: ctrl.arity,
        })
    }

    fn lower(&mut self, at: usize, instr: &Instruction) -> Result<(), CompileError> {
        use Instruction::*;

        let op = match instr {
            Nop => return Ok(()),
            Block(bt) | Loop(bt) => {
                let ty = self.block_type(bt, at)?;
                let params = ty.params.len() as u32;
                let is_loop = matches!(instr, Loop(_));
                let label = self.new_label();
                if is_loop {
                    self.bind(label);
                }
                self.ctrls.push(Ctrl {
                    label,
                    else_label: None,
                    height: self.height(at).saturating_sub(params),
                    arity: if is_loop {
                        params
                    } else {
                        ty.results.len() as u32
                    },
                    is_loop,
                });
                return Ok(());
            }
            If(bt) => {
                let ty = self.block_type(bt, at)?;
                let label = self.new_label();
                let else_label = self.new_label();
                self.ctrls.push(Ctrl {
                    label,
                    else_label: Some(else_label),
                    height: self.height(at).saturating_sub(1 + ty.params.len() as u32),
                    arity: ty.results.len() as u32,
                    is_loop: false,
                });
                Op::JumpIfZero(else_label)
            }
            Else => {
                let ctrl = self.ctrls.last_mut().ok_or(CompileError::Unbalanced(at))?;
                let else_label = ctrl.else_label.take().ok_or(CompileError::Unbalanced(at))?;
                let end = ctrl.label;
                self.emit(Op::Jump(end), at);
                self.bind(else_label);
                return Ok(());
            }
            End => {
                let ctrl = self.ctrls.pop().ok_or(CompileError::Unbalanced(at))?;
                // An `if` without `else` falls through to its end.
                if let Some(else_label) = ctrl.else_label {
                    self.bind(else_label);
                }
                if !ctrl.is_loop {
                    self.bind(ctrl.label);
                }
                if !self.ctrls.is_empty() {
                    return Ok(());
                }
                Op::Return
            }

            Unreachable => Op::Unreachable,
            Br(depth) => Op::Br(self.target(*depth, at)?),
            BrIf(depth) => Op::BrIf(self.target(*depth, at)?),
            BrTable(depths, default) => Op::BrTable {
                targets: depths
                    .iter()
                    .map(|d| self.target(*d, at))
                    .collect::<Result<Box<[_]>, _>>()?,
                default: self.target(*default, at)?,
            },
            BrOnNull(depth) => Op::BrOnNull(self.target(*depth, at)?),
            BrOnNonNull(depth) => Op::BrOnNonNull(self.target(*depth, at)?),
            Return => Op::Return,
            Call(f) => Op::Call(*f),
            CallIndirect(ty, table) => Op::CallIndirect {
                ty: *ty,
                table: *table,
            },
            ReturnCall(f) => Op::ReturnCall(*f),
            ReturnCallIndirect(ty, table) => Op::ReturnCallIndirect {
                ty: *ty,
                table: *table,
            },
            CallRef(_) => Op::CallRef,
            ReturnCallRef(_) => Op::ReturnCallRef,

            Drop => Op::Drop,
            Select | SelectTyped(_) => Op::Select,
            LocalGet(i) => Op::LocalGet(*i),
            LocalSet(i) => Op::LocalSet(*i),
            LocalTee(i) => Op::LocalTee(*i),
            GlobalGet(i) => Op::GlobalGet(*i),
            GlobalSet(i) => Op::GlobalSet(*i),

            TableGet(t) => Op::TableGet(*t),
            TableSet(t) => Op::TableSet(*t),
            TableInit(elem, table) => Op::TableInit {
                elem: *elem,
                table: *table,
            },
            ElemDrop(e) => Op::ElemDrop(*e),
            TableCopy(dst, src) => Op::TableCopy {
                dst: *dst,
                src: *src,
            },
            TableGrow(t) => Op::TableGrow(*t),
            TableSize(t) => Op::TableSize(*t),
            TableFill(t) => Op::TableFill(*t),

            MemorySize(m) => Op::MemorySize(*m),
            MemoryGrow(m) => Op::MemoryGrow(*m),
            MemoryInit(data, mem) => Op::MemoryInit {
                data: *data,
                mem: *mem,
            },
            DataDrop(d) => Op::DataDrop(*d),
            MemoryCopy(dst, src) => Op::MemoryCopy {
                dst: *dst,
                src: *src,
            },
            MemoryFill(m) => Op::MemoryFill(*m),

            I32Const(v) => Op::Const(Value::I32(*v)),
            I64Const(v) => Op::Const(Value::I64(*v)),
            F32Const(v) => Op::Const(Value::F32(*v)),
            F64Const(v) => Op::Const(Value::F64(*v)),
            RefNull(_) => Op::Const(Value::Ref(Ref::Null)),

            RefIsNull => Op::RefIsNull,
            RefFunc(f) => Op::RefFunc(*f),
            RefEq => Op::RefEq,
            RefAsNonNull => Op::RefAsNonNull,
            RefI31 => Op::RefI31,
            I31GetS => Op::I31GetS,
            I31GetU => Op::I31GetU,

            other => match (other.mem_arg(), LoadKind::of(other), StoreKind::of(other)) {
                (Some(m), Some(kind), _) => Op::Load {
                    kind,
                    mem: m.memory,
                    offset: m.offset,
                },
                (Some(m), _, Some(kind)) => Op::Store {
                    kind,
                    mem: m.memory,
                    offset: m.offset,
                },
                _ => Op::Numeric(other.clone()),
            },
        };
        self.emit(op, at);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::FunctionBody;
    use crate::opcodes::MemArg;
    use crate::types::SubType;
    use crate::validator::validate;
    use alloc::vec;

    fn compiled(ty: FuncType, locals: Vec<(u32, ValType)>, code: Vec<Instruction>) -> CompiledFunc {
        let mut module = Module::empty();
        module.types.push(SubType::func(ty));
        module.functions.push(0);
        module.memories.push(crate::types::MemoryType {
            limits: crate::types::Limits::new(1, None),
            shared: false,
        });
        module.code.push(FunctionBody {
            locals,
            instructions: code,
        });
        let info = validate(&module).unwrap();
        compile(&module, 0, &info.functions[0]).unwrap()
    }

    #[test]
    fn test_straight_line() {
        let func = compiled(
            FuncType::new(vec![], vec![ValType::I32]),
            vec![],
            vec![
                Instruction::I32Const(1),
                Instruction::I32Const(1),
                Instruction::I32Add,
                Instruction::End,
            ],
        );
        assert_eq!(
            func.ops,
            vec![
                Op::Const(Value::I32(1)),
                Op::Const(Value::I32(1)),
                Op::Numeric(Instruction::I32Add),
                Op::Return,
            ]
        );
        assert_eq!(func.heights, vec![Some(0), Some(1), Some(2), Some(1)]);
        assert_eq!(func.sources, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_block_branch_resolves_to_end() {
        // block (result i32) i32.const 7 i32.const 8 br 0 end
        let func = compiled(
            FuncType::new(vec![], vec![ValType::I32]),
            vec![],
            vec![
                Instruction::I32Const(1),
                Instruction::Drop,
                Instruction::Block(BlockType::Value(ValType::I32)),
                Instruction::I32Const(7),
                Instruction::I32Const(8),
                Instruction::Br(0),
                Instruction::End,
                Instruction::End,
            ],
        );
        assert_eq!(
            func.ops[4],
            Op::Br(Target {
                pc: 5,
                height: 0,
                arity: 1
            })
        );
        assert_eq!(func.ops[5], Op::Return);
        assert_eq!(func.sources[5], 7);
    }

    #[test]
    fn test_loop_branch_resolves_to_start() {
        let func = compiled(
            FuncType::new(vec![], vec![]),
            vec![],
            vec![
                Instruction::Loop(BlockType::Empty),
                Instruction::I32Const(1),
                Instruction::BrIf(0),
                Instruction::End,
                Instruction::End,
            ],
        );
        assert_eq!(
            func.ops,
            vec![
                Op::Const(Value::I32(1)),
                Op::BrIf(Target {
                    pc: 0,
                    height: 0,
                    arity: 0
                }),
                Op::Return,
            ]
        );
    }

    #[test]
    fn test_if_else_jumps() {
        // local.get 0 if (result i32) i32.const 1 else i32.const 2 end
        let func = compiled(
            FuncType::new(vec![ValType::I32], vec![ValType::I32]),
            vec![],
            vec![
                Instruction::LocalGet(0),
                Instruction::If(BlockType::Value(ValType::I32)),
                Instruction::I32Const(1),
                Instruction::Else,
                Instruction::I32Const(2),
                Instruction::End,
                Instruction::End,
            ],
        );
        assert_eq!(
            func.ops,
            vec![
                Op::LocalGet(0),
                Op::JumpIfZero(4),
                Op::Const(Value::I32(1)),
                Op::Jump(5),
                Op::Const(Value::I32(2)),
                Op::Return,
            ]
        );
    }

    #[test]
    fn test_if_without_else_skips_to_end() {
        let func = compiled(
            FuncType::new(vec![ValType::I32], vec![]),
            vec![],
            vec![
                Instruction::LocalGet(0),
                Instruction::If(BlockType::Empty),
                Instruction::Nop,
                Instruction::End,
                Instruction::End,
            ],
        );
        assert_eq!(func.ops, vec![Op::LocalGet(0), Op::JumpIfZero(2), Op::Return]);
    }

    #[test]
    fn test_branch_to_function_label() {
        let func = compiled(
            FuncType::new(vec![], vec![ValType::I64]),
            vec![(1, ValType::I32)],
            vec![
                Instruction::Block(BlockType::Empty),
                Instruction::I64Const(5),
                Instruction::Br(1),
                Instruction::End,
                Instruction::I64Const(6),
                Instruction::End,
            ],
        );
        assert_eq!(
            func.ops[1],
            Op::Br(Target {
                pc: 3,
                height: 0,
                arity: 1
            })
        );
        assert_eq!(func.locals, vec![ValType::I32]);
        // The const after the block is reachable by fall-through only.
        assert_eq!(func.heights[2], Some(0));
    }

    #[test]
    fn test_memory_ops_lowered() {
        let func = compiled(
            FuncType::new(vec![], vec![]),
            vec![],
            vec![
                Instruction::I32Const(0),
                Instruction::I32Const(0),
                Instruction::I32Load8U(MemArg::new(0, 4)),
                Instruction::I32Store16(MemArg::new(1, 8)),
                Instruction::End,
            ],
        );
        assert_eq!(
            func.ops[2],
            Op::Load {
                kind: LoadKind::I32U8,
                mem: 0,
                offset: 4
            }
        );
        assert_eq!(
            func.ops[3],
            Op::Store {
                kind: StoreKind::I32As16,
                mem: 0,
                offset: 8
            }
        );
    }

    #[test]
    fn test_bin_op_apply() {
        assert_eq!(
            BinOp::I32Add.apply(Value::I32(i32::MAX), Value::I32(1)),
            Some(Value::I32(i32::MIN))
        );
        assert_eq!(
            BinOp::I32ShrU.apply(Value::I32(-1), Value::I32(33)),
            Some(Value::I32(0x7fff_ffff))
        );
        assert_eq!(
            BinOp::I64LtU.apply(Value::I64(-1), Value::I64(0)),
            Some(Value::I32(0))
        );
        assert_eq!(BinOp::I64Add.apply(Value::I32(1), Value::I32(2)), None);
        assert_eq!(BinOp::of(&Instruction::I32DivS), None);
    }

    #[test]
    fn test_op_cost() {
        let fused = Op::FusedBinary {
            op: BinOp::I32Add,
            lhs: Operand::Local(0),
            rhs: Operand::Const(Value::I32(1)),
            dest: Dest::Local(0),
        };
        assert_eq!(fused.cost(), 4);
        assert_eq!(Op::Drop.cost(), 1);
        assert!(fused.is_fused());
        assert!(!Op::Return.is_branch());
    }
}
