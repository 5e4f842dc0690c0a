//! WASM instruction (opcode) definitions.
//!
//! The WebAssembly MVP instruction set plus the post-MVP extensions the
//! machine implements (sign extension, saturating truncation, bulk memory,
//! reference types, typed function references, tail calls, i31 references).
//!
//! The whole set is declared once through [`instructions!`], which generates
//! the [`Instruction`] enum, its [`Opcode`] and mnemonic, and the decode table
//! for instructions without immediates.
//!
//! Reference: <https://webassembly.github.io/spec/core/binary/instructions.html>

use alloc::vec::Vec;
use core::fmt;

use crate::types::{BlockType, HeapType, ValType};

/// Instruction opcode, including the prefix byte for multi-byte encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Single-byte opcode.
    Core(u8),
    /// `0xFB` prefix (GC).
    Gc(u8),
    /// `0xFC` prefix (saturating truncation, bulk memory, tables).
    Ext(u8),
    /// `0xFD` prefix (SIMD).
    Simd(u32),
    /// `0xFE` prefix (threads/atomics).
    Atomic(u8),
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Opcode::Core(op) => write!(f, "0x{:02x}", op),
            Opcode::Gc(op) => write!(f, "0xfb {}", op),
            Opcode::Ext(op) => write!(f, "0xfc {}", op),
            Opcode::Simd(op) => write!(f, "0xfd {}", op),
            Opcode::Atomic(op) => write!(f, "0xfe {}", op),
        }
    }
}

/// Memory access immediate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MemArg {
    /// Alignment exponent (log2 of the byte alignment).
    pub align: u32,
    /// Static offset added to the dynamic address.
    pub offset: u64,
    /// Memory index (always 0 without multi-memory).
    pub memory: u32,
}

impl MemArg {
    pub const fn new(align: u32, offset: u64) -> Self {
        MemArg {
            align,
            offset,
            memory: 0,
        }
    }
}

macro_rules! instructions {
    (@simple $name:ident) => { Some(Instruction::$name) };
    (@simple $name:ident ($($imm:ty),+)) => { None };
    ($(
        $(#[$doc:meta])*
        $name:ident $( ( $($imm:ty),+ ) )? = $prefix:ident($code:literal), $mnemonic:literal;
    )*) => {
        /// A single WASM instruction.
        #[derive(Debug, Clone, PartialEq)]
        pub enum Instruction {
            $(
                $(#[$doc])*
                $name $( ( $($imm),+ ) )?,
            )*
        }

        impl Instruction {
            /// Binary opcode of this instruction.
            pub fn opcode(&self) -> Opcode {
                match self {
                    $( Instruction::$name { .. } => Opcode::$prefix($code), )*
                }
            }

            /// Text-format mnemonic.
            pub fn name(&self) -> &'static str {
                match self {
                    $( Instruction::$name { .. } => $mnemonic, )*
                }
            }

            /// Instruction for an opcode that carries no immediates.
            ///
            /// Returns `None` for unknown opcodes and for opcodes that need
            /// immediates decoded by the parser.
            pub fn decode_simple(opcode: Opcode) -> Option<Instruction> {
                match opcode {
                    $( Opcode::$prefix($code) => instructions!(@simple $name $( ( $($imm),+ ) )?), )*
                    _ => None,
                }
            }
        }
    };
}

instructions! {
    // ========================================================================
    // Control Flow Instructions
    // ========================================================================
    /// Trap immediately.
    Unreachable = Core(0x00), "unreachable";
    /// No operation.
    Nop = Core(0x01), "nop";
    /// Begin a block.
    Block(BlockType) = Core(0x02), "block";
    /// Begin a loop; branches target its start.
    Loop(BlockType) = Core(0x03), "loop";
    /// Conditional block.
    If(BlockType) = Core(0x04), "if";
    /// Else branch of an if block.
    Else = Core(0x05), "else";
    /// End of block/loop/if/function.
    End = Core(0x0B), "end";
    /// Branch to label. Params: label index (depth).
    Br(u32) = Core(0x0C), "br";
    /// Conditional branch. Params: label index.
    BrIf(u32) = Core(0x0D), "br_if";
    /// Branch table. Params: (targets, default).
    BrTable(Vec<u32>, u32) = Core(0x0E), "br_table";
    /// Return from current function.
    Return = Core(0x0F), "return";
    /// Call function by index.
    Call(u32) = Core(0x10), "call";
    /// Indirect call via table. Params: (type_index, table_index).
    CallIndirect(u32, u32) = Core(0x11), "call_indirect";
    /// Tail call by function index.
    ReturnCall(u32) = Core(0x12), "return_call";
    /// Tail call via table. Params: (type_index, table_index).
    ReturnCallIndirect(u32, u32) = Core(0x13), "return_call_indirect";
    /// Call through a typed function reference. Params: type index.
    CallRef(u32) = Core(0x14), "call_ref";
    /// Tail call through a typed function reference. Params: type index.
    ReturnCallRef(u32) = Core(0x15), "return_call_ref";

    // ========================================================================
    // Parametric Instructions
    // ========================================================================
    /// Drop top of stack.
    Drop = Core(0x1A), "drop";
    /// Select between two numeric values based on condition.
    Select = Core(0x1B), "select";
    /// Select with explicit result type.
    SelectTyped(Vec<ValType>) = Core(0x1C), "select";

    // ========================================================================
    // Variable Instructions
    // ========================================================================
    /// Get local variable. Params: local index.
    LocalGet(u32) = Core(0x20), "local.get";
    /// Set local variable. Params: local index.
    LocalSet(u32) = Core(0x21), "local.set";
    /// Tee local variable (set + keep on stack). Params: local index.
    LocalTee(u32) = Core(0x22), "local.tee";
    /// Get global variable. Params: global index.
    GlobalGet(u32) = Core(0x23), "global.get";
    /// Set global variable. Params: global index.
    GlobalSet(u32) = Core(0x24), "global.set";

    // ========================================================================
    // Table Instructions
    // ========================================================================
    /// Get table element. Params: table index.
    TableGet(u32) = Core(0x25), "table.get";
    /// Set table element. Params: table index.
    TableSet(u32) = Core(0x26), "table.set";
    /// Initialize table from element segment. Params: (elem_idx, table_idx).
    TableInit(u32, u32) = Ext(12), "table.init";
    /// Drop element segment. Params: elem index.
    ElemDrop(u32) = Ext(13), "elem.drop";
    /// Copy table elements. Params: (dst_table, src_table).
    TableCopy(u32, u32) = Ext(14), "table.copy";
    /// Grow table. Params: table index.
    TableGrow(u32) = Ext(15), "table.grow";
    /// Get table size. Params: table index.
    TableSize(u32) = Ext(16), "table.size";
    /// Fill table. Params: table index.
    TableFill(u32) = Ext(17), "table.fill";

    // ========================================================================
    // Memory Instructions: Load
    // ========================================================================
    I32Load(MemArg) = Core(0x28), "i32.load";
    I64Load(MemArg) = Core(0x29), "i64.load";
    F32Load(MemArg) = Core(0x2A), "f32.load";
    F64Load(MemArg) = Core(0x2B), "f64.load";
    I32Load8S(MemArg) = Core(0x2C), "i32.load8_s";
    I32Load8U(MemArg) = Core(0x2D), "i32.load8_u";
    I32Load16S(MemArg) = Core(0x2E), "i32.load16_s";
    I32Load16U(MemArg) = Core(0x2F), "i32.load16_u";
    I64Load8S(MemArg) = Core(0x30), "i64.load8_s";
    I64Load8U(MemArg) = Core(0x31), "i64.load8_u";
    I64Load16S(MemArg) = Core(0x32), "i64.load16_s";
    I64Load16U(MemArg) = Core(0x33), "i64.load16_u";
    I64Load32S(MemArg) = Core(0x34), "i64.load32_s";
    I64Load32U(MemArg) = Core(0x35), "i64.load32_u";

    // ========================================================================
    // Memory Instructions: Store
    // ========================================================================
    I32Store(MemArg) = Core(0x36), "i32.store";
    I64Store(MemArg) = Core(0x37), "i64.store";
    F32Store(MemArg) = Core(0x38), "f32.store";
    F64Store(MemArg) = Core(0x39), "f64.store";
    I32Store8(MemArg) = Core(0x3A), "i32.store8";
    I32Store16(MemArg) = Core(0x3B), "i32.store16";
    I64Store8(MemArg) = Core(0x3C), "i64.store8";
    I64Store16(MemArg) = Core(0x3D), "i64.store16";
    I64Store32(MemArg) = Core(0x3E), "i64.store32";

    // ========================================================================
    // Memory Instructions: Size/Grow and Bulk Memory
    // ========================================================================
    /// Current memory size in pages. Params: memory index.
    MemorySize(u32) = Core(0x3F), "memory.size";
    /// Grow memory by delta pages. Params: memory index.
    MemoryGrow(u32) = Core(0x40), "memory.grow";
    /// Copy a data segment into memory. Params: (data_idx, memory).
    MemoryInit(u32, u32) = Ext(8), "memory.init";
    /// Drop a passive data segment. Params: data index.
    DataDrop(u32) = Ext(9), "data.drop";
    /// Copy memory. Params: (dst_memory, src_memory).
    MemoryCopy(u32, u32) = Ext(10), "memory.copy";
    /// Fill memory with a byte. Params: memory index.
    MemoryFill(u32) = Ext(11), "memory.fill";

    // ========================================================================
    // Numeric Instructions: Constants
    // ========================================================================
    I32Const(i32) = Core(0x41), "i32.const";
    I64Const(i64) = Core(0x42), "i64.const";
    F32Const(f32) = Core(0x43), "f32.const";
    F64Const(f64) = Core(0x44), "f64.const";

    // ========================================================================
    // Numeric Instructions: i32 Comparison
    // ========================================================================
    I32Eqz = Core(0x45), "i32.eqz";
    I32Eq = Core(0x46), "i32.eq";
    I32Ne = Core(0x47), "i32.ne";
    I32LtS = Core(0x48), "i32.lt_s";
    I32LtU = Core(0x49), "i32.lt_u";
    I32GtS = Core(0x4A), "i32.gt_s";
    I32GtU = Core(0x4B), "i32.gt_u";
    I32LeS = Core(0x4C), "i32.le_s";
    I32LeU = Core(0x4D), "i32.le_u";
    I32GeS = Core(0x4E), "i32.ge_s";
    I32GeU = Core(0x4F), "i32.ge_u";

    // ========================================================================
    // Numeric Instructions: i64 Comparison
    // ========================================================================
    I64Eqz = Core(0x50), "i64.eqz";
    I64Eq = Core(0x51), "i64.eq";
    I64Ne = Core(0x52), "i64.ne";
    I64LtS = Core(0x53), "i64.lt_s";
    I64LtU = Core(0x54), "i64.lt_u";
    I64GtS = Core(0x55), "i64.gt_s";
    I64GtU = Core(0x56), "i64.gt_u";
    I64LeS = Core(0x57), "i64.le_s";
    I64LeU = Core(0x58), "i64.le_u";
    I64GeS = Core(0x59), "i64.ge_s";
    I64GeU = Core(0x5A), "i64.ge_u";

    // ========================================================================
    // Numeric Instructions: Float Comparison
    // ========================================================================
    F32Eq = Core(0x5B), "f32.eq";
    F32Ne = Core(0x5C), "f32.ne";
    F32Lt = Core(0x5D), "f32.lt";
    F32Gt = Core(0x5E), "f32.gt";
    F32Le = Core(0x5F), "f32.le";
    F32Ge = Core(0x60), "f32.ge";
    F64Eq = Core(0x61), "f64.eq";
    F64Ne = Core(0x62), "f64.ne";
    F64Lt = Core(0x63), "f64.lt";
    F64Gt = Core(0x64), "f64.gt";
    F64Le = Core(0x65), "f64.le";
    F64Ge = Core(0x66), "f64.ge";

    // ========================================================================
    // Numeric Instructions: i32 Arithmetic
    // ========================================================================
    I32Clz = Core(0x67), "i32.clz";
    I32Ctz = Core(0x68), "i32.ctz";
    I32Popcnt = Core(0x69), "i32.popcnt";
    I32Add = Core(0x6A), "i32.add";
    I32Sub = Core(0x6B), "i32.sub";
    I32Mul = Core(0x6C), "i32.mul";
    I32DivS = Core(0x6D), "i32.div_s";
    I32DivU = Core(0x6E), "i32.div_u";
    I32RemS = Core(0x6F), "i32.rem_s";
    I32RemU = Core(0x70), "i32.rem_u";
    I32And = Core(0x71), "i32.and";
    I32Or = Core(0x72), "i32.or";
    I32Xor = Core(0x73), "i32.xor";
    I32Shl = Core(0x74), "i32.shl";
    I32ShrS = Core(0x75), "i32.shr_s";
    I32ShrU = Core(0x76), "i32.shr_u";
    I32Rotl = Core(0x77), "i32.rotl";
    I32Rotr = Core(0x78), "i32.rotr";

    // ========================================================================
    // Numeric Instructions: i64 Arithmetic
    // ========================================================================
    I64Clz = Core(0x79), "i64.clz";
    I64Ctz = Core(0x7A), "i64.ctz";
    I64Popcnt = Core(0x7B), "i64.popcnt";
    I64Add = Core(0x7C), "i64.add";
    I64Sub = Core(0x7D), "i64.sub";
    I64Mul = Core(0x7E), "i64.mul";
    I64DivS = Core(0x7F), "i64.div_s";
    I64DivU = Core(0x80), "i64.div_u";
    I64RemS = Core(0x81), "i64.rem_s";
    I64RemU = Core(0x82), "i64.rem_u";
    I64And = Core(0x83), "i64.and";
    I64Or = Core(0x84), "i64.or";
    I64Xor = Core(0x85), "i64.xor";
    I64Shl = Core(0x86), "i64.shl";
    I64ShrS = Core(0x87), "i64.shr_s";
    I64ShrU = Core(0x88), "i64.shr_u";
    I64Rotl = Core(0x89), "i64.rotl";
    I64Rotr = Core(0x8A), "i64.rotr";

    // ========================================================================
    // Numeric Instructions: f32 Arithmetic
    // ========================================================================
    F32Abs = Core(0x8B), "f32.abs";
    F32Neg = Core(0x8C), "f32.neg";
    F32Ceil = Core(0x8D), "f32.ceil";
    F32Floor = Core(0x8E), "f32.floor";
    F32Trunc = Core(0x8F), "f32.trunc";
    F32Nearest = Core(0x90), "f32.nearest";
    F32Sqrt = Core(0x91), "f32.sqrt";
    F32Add = Core(0x92), "f32.add";
    F32Sub = Core(0x93), "f32.sub";
    F32Mul = Core(0x94), "f32.mul";
    F32Div = Core(0x95), "f32.div";
    F32Min = Core(0x96), "f32.min";
    F32Max = Core(0x97), "f32.max";
    F32Copysign = Core(0x98), "f32.copysign";

    // ========================================================================
    // Numeric Instructions: f64 Arithmetic
    // ========================================================================
    F64Abs = Core(0x99), "f64.abs";
    F64Neg = Core(0x9A), "f64.neg";
    F64Ceil = Core(0x9B), "f64.ceil";
    F64Floor = Core(0x9C), "f64.floor";
    F64Trunc = Core(0x9D), "f64.trunc";
    F64Nearest = Core(0x9E), "f64.nearest";
    F64Sqrt = Core(0x9F), "f64.sqrt";
    F64Add = Core(0xA0), "f64.add";
    F64Sub = Core(0xA1), "f64.sub";
    F64Mul = Core(0xA2), "f64.mul";
    F64Div = Core(0xA3), "f64.div";
    F64Min = Core(0xA4), "f64.min";
    F64Max = Core(0xA5), "f64.max";
    F64Copysign = Core(0xA6), "f64.copysign";

    // ========================================================================
    // Numeric Instructions: Conversions
    // ========================================================================
    I32WrapI64 = Core(0xA7), "i32.wrap_i64";
    I32TruncF32S = Core(0xA8), "i32.trunc_f32_s";
    I32TruncF32U = Core(0xA9), "i32.trunc_f32_u";
    I32TruncF64S = Core(0xAA), "i32.trunc_f64_s";
    I32TruncF64U = Core(0xAB), "i32.trunc_f64_u";
    I64ExtendI32S = Core(0xAC), "i64.extend_i32_s";
    I64ExtendI32U = Core(0xAD), "i64.extend_i32_u";
    I64TruncF32S = Core(0xAE), "i64.trunc_f32_s";
    I64TruncF32U = Core(0xAF), "i64.trunc_f32_u";
    I64TruncF64S = Core(0xB0), "i64.trunc_f64_s";
    I64TruncF64U = Core(0xB1), "i64.trunc_f64_u";
    F32ConvertI32S = Core(0xB2), "f32.convert_i32_s";
    F32ConvertI32U = Core(0xB3), "f32.convert_i32_u";
    F32ConvertI64S = Core(0xB4), "f32.convert_i64_s";
    F32ConvertI64U = Core(0xB5), "f32.convert_i64_u";
    F32DemoteF64 = Core(0xB6), "f32.demote_f64";
    F64ConvertI32S = Core(0xB7), "f64.convert_i32_s";
    F64ConvertI32U = Core(0xB8), "f64.convert_i32_u";
    F64ConvertI64S = Core(0xB9), "f64.convert_i64_s";
    F64ConvertI64U = Core(0xBA), "f64.convert_i64_u";
    F64PromoteF32 = Core(0xBB), "f64.promote_f32";

    // ========================================================================
    // Numeric Instructions: Reinterpretations
    // ========================================================================
    I32ReinterpretF32 = Core(0xBC), "i32.reinterpret_f32";
    I64ReinterpretF64 = Core(0xBD), "i64.reinterpret_f64";
    F32ReinterpretI32 = Core(0xBE), "f32.reinterpret_i32";
    F64ReinterpretI64 = Core(0xBF), "f64.reinterpret_i64";

    // ========================================================================
    // Sign Extension Instructions
    // ========================================================================
    I32Extend8S = Core(0xC0), "i32.extend8_s";
    I32Extend16S = Core(0xC1), "i32.extend16_s";
    I64Extend8S = Core(0xC2), "i64.extend8_s";
    I64Extend16S = Core(0xC3), "i64.extend16_s";
    I64Extend32S = Core(0xC4), "i64.extend32_s";

    // ========================================================================
    // Reference Instructions
    // ========================================================================
    /// Push null reference of the given heap type.
    RefNull(HeapType) = Core(0xD0), "ref.null";
    /// Test if reference is null.
    RefIsNull = Core(0xD1), "ref.is_null";
    /// Create reference to function. Params: function index.
    RefFunc(u32) = Core(0xD2), "ref.func";
    /// Reference identity.
    RefEq = Core(0xD3), "ref.eq";
    /// Trap on null, otherwise retype as non-nullable.
    RefAsNonNull = Core(0xD4), "ref.as_non_null";
    /// Branch if null. Params: label index.
    BrOnNull(u32) = Core(0xD5), "br_on_null";
    /// Branch with the reference if not null. Params: label index.
    BrOnNonNull(u32) = Core(0xD6), "br_on_non_null";
    /// Box an i32 as an i31 reference.
    RefI31 = Gc(0x1C), "ref.i31";
    I31GetS = Gc(0x1D), "i31.get_s";
    I31GetU = Gc(0x1E), "i31.get_u";

    // ========================================================================
    // Saturating Truncation Instructions (0xFC prefix)
    // ========================================================================
    I32TruncSatF32S = Ext(0), "i32.trunc_sat_f32_s";
    I32TruncSatF32U = Ext(1), "i32.trunc_sat_f32_u";
    I32TruncSatF64S = Ext(2), "i32.trunc_sat_f64_s";
    I32TruncSatF64U = Ext(3), "i32.trunc_sat_f64_u";
    I64TruncSatF32S = Ext(4), "i64.trunc_sat_f32_s";
    I64TruncSatF32U = Ext(5), "i64.trunc_sat_f32_u";
    I64TruncSatF64S = Ext(6), "i64.trunc_sat_f64_s";
    I64TruncSatF64U = Ext(7), "i64.trunc_sat_f64_u";
}

impl Instruction {
    /// Structured control instructions and unconditional exits.
    pub fn is_control(&self) -> bool {
        use Instruction::*;
        matches!(
            self,
            Unreachable
                | Block(_)
                | Loop(_)
                | If(_)
                | Else
                | End
                | Br(_)
                | BrIf(_)
                | BrTable(_, _)
                | BrOnNull(_)
                | BrOnNonNull(_)
                | Return
                | ReturnCall(_)
                | ReturnCallIndirect(_, _)
                | ReturnCallRef(_)
        )
    }

    /// Instructions that transfer control to another function.
    pub fn is_call(&self) -> bool {
        use Instruction::*;
        matches!(
            self,
            Call(_)
                | CallIndirect(_, _)
                | CallRef(_)
                | ReturnCall(_)
                | ReturnCallIndirect(_, _)
                | ReturnCallRef(_)
        )
    }

    /// Memory immediate of a load or store.
    pub fn mem_arg(&self) -> Option<MemArg> {
        use Instruction::*;
        match self {
            I32Load(m) | I64Load(m) | F32Load(m) | F64Load(m) | I32Load8S(m) | I32Load8U(m)
            | I32Load16S(m) | I32Load16U(m) | I64Load8S(m) | I64Load8U(m) | I64Load16S(m)
            | I64Load16U(m) | I64Load32S(m) | I64Load32U(m) | I32Store(m) | I64Store(m)
            | F32Store(m) | F64Store(m) | I32Store8(m) | I32Store16(m) | I64Store8(m)
            | I64Store16(m) | I64Store32(m) => Some(*m),
            _ => None,
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
