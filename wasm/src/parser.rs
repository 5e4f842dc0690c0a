//! WASM binary format parser.
//!
//! Decodes WebAssembly binary format (`.wasm` files) into a [`Module`].
//! Parsing aborts at the first malformation; no partial module is produced.
//!
//! Reference: <https://webassembly.github.io/spec/core/binary/index.html>

use alloc::string::String;
use alloc::vec::Vec;

use thiserror::Error;

use crate::module::{
    ConstExpr, CustomSection, DataMode, DataSegment, Element, ElementItems, ElementMode, Export,
    ExportKind, FunctionBody, Global, Import, ImportKind, Module, Table,
};
use crate::opcodes::{Instruction, MemArg, Opcode};
use crate::types::{
    ArrayType, BlockType, CompositeType, FieldType, FuncType, GlobalType, HeapType, Limits,
    MemoryType, RefType, StorageType, StructType, SubType, TableType, ValType,
};
use crate::Features;

/// WASM magic number: `\0asm`
const WASM_MAGIC: [u8; 4] = [0x00, 0x61, 0x73, 0x6D];

/// WASM version 1
const WASM_VERSION: u32 = 1;

/// Section IDs in the WASM binary format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SectionId {
    Custom = 0,
    Type = 1,
    Import = 2,
    Function = 3,
    Table = 4,
    Memory = 5,
    Global = 6,
    Export = 7,
    Start = 8,
    Element = 9,
    Code = 10,
    Data = 11,
    DataCount = 12,
}

impl SectionId {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(SectionId::Custom),
            1 => Some(SectionId::Type),
            2 => Some(SectionId::Import),
            3 => Some(SectionId::Function),
            4 => Some(SectionId::Table),
            5 => Some(SectionId::Memory),
            6 => Some(SectionId::Global),
            7 => Some(SectionId::Export),
            8 => Some(SectionId::Start),
            9 => Some(SectionId::Element),
            10 => Some(SectionId::Code),
            11 => Some(SectionId::Data),
            12 => Some(SectionId::DataCount),
            _ => None,
        }
    }

    /// Position in the canonical section order (DataCount sits before Code).
    fn rank(self) -> u8 {
        match self {
            SectionId::Custom => 0,
            SectionId::Type => 1,
            SectionId::Import => 2,
            SectionId::Function => 3,
            SectionId::Table => 4,
            SectionId::Memory => 5,
            SectionId::Global => 6,
            SectionId::Export => 7,
            SectionId::Start => 8,
            SectionId::Element => 9,
            SectionId::DataCount => 10,
            SectionId::Code => 11,
            SectionId::Data => 12,
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Malformed binary, with the absolute byte offset it was detected at.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} at offset {offset:#x}")]
pub struct FormatError {
    pub kind: FormatErrorKind,
    pub offset: usize,
}

impl FormatError {
    pub fn new(kind: FormatErrorKind, offset: usize) -> Self {
        FormatError { kind, offset }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatErrorKind {
    #[error("magic header not detected")]
    BadMagic,
    #[error("unknown binary version {0}")]
    UnknownVersion(u32),
    #[error("unexpected end")]
    UnexpectedEnd,
    #[error("integer representation too long")]
    IntegerTooLong,
    #[error("integer too large")]
    IntegerTooLarge,
    #[error("malformed UTF-8 encoding")]
    MalformedUtf8,
    #[error("malformed section id {0}")]
    MalformedSectionId(u8),
    #[error("unexpected content after last section or section out of order ({0:?})")]
    SectionOutOfOrder(SectionId),
    #[error("section size mismatch")]
    SectionSizeMismatch,
    #[error("function and code section have inconsistent lengths")]
    FunctionCodeMismatch,
    #[error("data count and data section have inconsistent lengths")]
    DataCountMismatch,
    #[error("malformed type form {0:#04x}")]
    MalformedTypeForm(u8),
    #[error("malformed value type {0:#04x}")]
    MalformedValType(u8),
    #[error("malformed reference type {0:#04x}")]
    MalformedRefType(u8),
    #[error("malformed heap type")]
    MalformedHeapType,
    #[error("malformed storage type {0:#04x}")]
    MalformedStorageType(u8),
    #[error("malformed mutability {0:#04x}")]
    MalformedMutability(u8),
    #[error("malformed limits flags {0:#04x}")]
    MalformedLimits(u8),
    #[error("malformed import kind {0:#04x}")]
    MalformedImportKind(u8),
    #[error("malformed export kind {0:#04x}")]
    MalformedExportKind(u8),
    #[error("malformed elements segment kind {0}")]
    MalformedElementKind(u32),
    #[error("malformed data segment kind {0}")]
    MalformedDataKind(u32),
    #[error("malformed memop flags {0:#x}")]
    MalformedMemArg(u32),
    #[error("too many supertypes")]
    TooManySupertypes,
    #[error("too many locals")]
    TooManyLocals,
    #[error("END opcode expected")]
    EndExpected,
    #[error("illegal opcode {0}")]
    IllegalOpcode(Opcode),
    #[error("unsupported opcode {0}")]
    UnsupportedOpcode(Opcode),
    #[error("{0} requires a disabled feature")]
    FeatureDisabled(&'static str),
}

// ============================================================================
// Configuration
// ============================================================================

/// Decoder settings, passed explicitly to [`decode`].
#[derive(Debug, Clone)]
pub struct ParserConfig {
    /// Proposals whose encodings are accepted.
    pub features: Features,
    /// Retain custom sections in [`Module::custom_sections`].
    pub keep_custom_sections: bool,
    /// Upper bound on declared locals per function body.
    pub max_locals: u64,
}

impl Default for ParserConfig {
    fn default() -> Self {
        ParserConfig {
            features: Features::default(),
            keep_custom_sections: false,
            max_locals: 50_000,
        }
    }
}

// ============================================================================
// Binary Reader
// ============================================================================

/// Binary reader with position tracking.
pub struct BinaryReader<'a> {
    data: &'a [u8],
    pos: usize,
    /// Absolute offset of `data[0]` in the module, for error reporting.
    base: usize,
}

impl<'a> BinaryReader<'a> {
    /// Create a new binary reader.
    pub fn new(data: &'a [u8]) -> Self {
        BinaryReader {
            data,
            pos: 0,
            base: 0,
        }
    }

    fn error(&self, kind: FormatErrorKind) -> FormatError {
        FormatError::new(kind, self.base + self.pos)
    }

    /// Split off a reader for the next `len` bytes and advance past them.
    pub fn sub_reader(&mut self, len: usize) -> Result<BinaryReader<'a>, FormatError> {
        let start = self.pos;
        let bytes = self.read_bytes(len)?;
        Ok(BinaryReader {
            data: bytes,
            pos: 0,
            base: self.base + start,
        })
    }

    /// Current absolute position.
    pub fn position(&self) -> usize {
        self.base + self.pos
    }

    /// Remaining bytes.
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    /// Check if at end.
    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Read a single byte.
    pub fn read_byte(&mut self) -> Result<u8, FormatError> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or_else(|| self.error(FormatErrorKind::UnexpectedEnd))?;
        self.pos += 1;
        Ok(b)
    }

    /// Peek at the next byte without advancing.
    pub fn peek_byte(&self) -> Result<u8, FormatError> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or_else(|| self.error(FormatErrorKind::UnexpectedEnd))
    }

    /// Read N bytes.
    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], FormatError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| self.error(FormatErrorKind::UnexpectedEnd))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    /// Read a u32 in little-endian.
    pub fn read_u32_le(&mut self) -> Result<u32, FormatError> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Unsigned LEB128 of at most `bits` bits.
    fn read_unsigned(&mut self, bits: u32) -> Result<u64, FormatError> {
        let mut result: u64 = 0;
        let mut shift: u32 = 0;
        loop {
            let byte = self.read_byte()?;
            result |= u64::from(byte & 0x7F) << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                if shift > bits {
                    let used = bits - (shift - 7);
                    if (byte & 0x7F) >> used != 0 {
                        return Err(self.error(FormatErrorKind::IntegerTooLarge));
                    }
                }
                return Ok(result);
            }
            if shift >= bits {
                return Err(self.error(FormatErrorKind::IntegerTooLong));
            }
        }
    }

    /// Signed LEB128 of at most `bits` bits.
    fn read_signed(&mut self, bits: u32) -> Result<i64, FormatError> {
        let mut result: i64 = 0;
        let mut shift: u32 = 0;
        loop {
            let byte = self.read_byte()?;
            result |= i64::from(byte & 0x7F) << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                if shift < 64 && byte & 0x40 != 0 {
                    // Sign extend
                    result |= !0i64 << shift;
                }
                if shift > bits {
                    let used = bits - (shift - 7);
                    let high = (byte & 0x7F) >> (used - 1);
                    if high != 0 && high != 0x7F >> (used - 1) {
                        return Err(self.error(FormatErrorKind::IntegerTooLarge));
                    }
                }
                return Ok(result);
            }
            if shift >= bits {
                return Err(self.error(FormatErrorKind::IntegerTooLong));
            }
        }
    }

    /// Read an unsigned LEB128-encoded u32.
    pub fn read_leb128_u32(&mut self) -> Result<u32, FormatError> {
        Ok(self.read_unsigned(32)? as u32)
    }

    /// Read an unsigned LEB128-encoded u64.
    pub fn read_leb128_u64(&mut self) -> Result<u64, FormatError> {
        self.read_unsigned(64)
    }

    /// Read a signed LEB128-encoded i32.
    pub fn read_leb128_i32(&mut self) -> Result<i32, FormatError> {
        Ok(self.read_signed(32)? as i32)
    }

    /// Read a signed LEB128-encoded i64.
    pub fn read_leb128_i64(&mut self) -> Result<i64, FormatError> {
        self.read_signed(64)
    }

    /// Read a signed 33-bit LEB128 (block types, heap types).
    pub fn read_leb128_s33(&mut self) -> Result<i64, FormatError> {
        self.read_signed(33)
    }

    /// Read f32 (IEEE 754).
    pub fn read_f32(&mut self) -> Result<f32, FormatError> {
        Ok(f32::from_bits(self.read_u32_le()?))
    }

    /// Read f64 (IEEE 754).
    pub fn read_f64(&mut self) -> Result<f64, FormatError> {
        let bytes = self.read_bytes(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(f64::from_bits(u64::from_le_bytes(raw)))
    }

    /// Read a UTF-8 name (length-prefixed).
    pub fn read_name(&mut self) -> Result<String, FormatError> {
        let len = self.read_leb128_u32()? as usize;
        let start = self.position();
        let bytes = self.read_bytes(len)?;
        core::str::from_utf8(bytes)
            .map(String::from)
            .map_err(|_| FormatError::new(FormatErrorKind::MalformedUtf8, start))
    }

    /// Read a length-prefixed vector with `f` decoding each element.
    pub fn read_vec<T>(
        &mut self,
        mut f: impl FnMut(&mut Self) -> Result<T, FormatError>,
    ) -> Result<Vec<T>, FormatError> {
        let count = self.read_leb128_u32()? as usize;
        // Every element takes at least one byte.
        if count > self.remaining() {
            return Err(self.error(FormatErrorKind::UnexpectedEnd));
        }
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(f(self)?);
        }
        Ok(items)
    }

    /// Skip N bytes.
    pub fn skip(&mut self, n: usize) -> Result<(), FormatError> {
        self.read_bytes(n).map(|_| ())
    }
}

// ============================================================================
// Module Parser
// ============================================================================

/// Decode a binary module.
pub fn decode(bytes: &[u8], config: &ParserConfig) -> Result<Module, FormatError> {
    WasmParser { config }.parse(bytes)
}

/// Main WASM parser.
pub struct WasmParser<'c> {
    config: &'c ParserConfig,
}

impl<'c> WasmParser<'c> {
    pub fn new(config: &'c ParserConfig) -> Self {
        WasmParser { config }
    }

    /// Parse a WASM binary into a Module.
    pub fn parse(&self, bytes: &[u8]) -> Result<Module, FormatError> {
        let mut reader = BinaryReader::new(bytes);

        // Validate header
        Self::parse_header(&mut reader)?;

        let mut module = Module::empty();
        let mut last_rank = 0u8;
        let mut code_seen = false;
        let mut data_seen = false;

        while !reader.is_empty() {
            let id_offset = reader.position();
            let id_byte = reader.read_byte()?;
            let id = SectionId::from_byte(id_byte).ok_or_else(|| {
                FormatError::new(FormatErrorKind::MalformedSectionId(id_byte), id_offset)
            })?;
            let size = reader.read_leb128_u32()? as usize;
            let mut sr = reader.sub_reader(size)?;

            if id != SectionId::Custom {
                if id.rank() <= last_rank {
                    return Err(FormatError::new(
                        FormatErrorKind::SectionOutOfOrder(id),
                        id_offset,
                    ));
                }
                last_rank = id.rank();
            }

            match id {
                SectionId::Custom => self.parse_custom_section(&mut sr, &mut module)?,
                SectionId::Type => {
                    module.types = self.parse_type_section(&mut sr)?;
                }
                SectionId::Import => {
                    module.imports = sr.read_vec(|r| self.parse_import(r))?;
                }
                SectionId::Function => {
                    module.functions = sr.read_vec(|r| r.read_leb128_u32())?;
                }
                SectionId::Table => {
                    module.tables = sr.read_vec(|r| self.parse_table(r))?;
                }
                SectionId::Memory => {
                    module.memories = sr.read_vec(|r| self.parse_memory_type(r))?;
                }
                SectionId::Global => {
                    module.globals = sr.read_vec(|r| {
                        let ty = self.parse_global_type(r)?;
                        let init = self.parse_const_expr(r)?;
                        Ok(Global { ty, init })
                    })?;
                }
                SectionId::Export => {
                    module.exports = sr.read_vec(Self::parse_export)?;
                }
                SectionId::Start => {
                    module.start = Some(sr.read_leb128_u32()?);
                }
                SectionId::Element => {
                    module.elements = sr.read_vec(|r| self.parse_element(r))?;
                }
                SectionId::DataCount => {
                    module.data_count = Some(sr.read_leb128_u32()?);
                }
                SectionId::Code => {
                    code_seen = true;
                    let start = sr.position();
                    module.code = sr.read_vec(|r| self.parse_function_body(r))?;
                    if module.code.len() != module.functions.len() {
                        return Err(FormatError::new(
                            FormatErrorKind::FunctionCodeMismatch,
                            start,
                        ));
                    }
                }
                SectionId::Data => {
                    data_seen = true;
                    let start = sr.position();
                    module.data = sr.read_vec(|r| self.parse_data(r))?;
                    if let Some(count) = module.data_count {
                        if count as usize != module.data.len() {
                            return Err(FormatError::new(
                                FormatErrorKind::DataCountMismatch,
                                start,
                            ));
                        }
                    }
                }
            }

            if !sr.is_empty() {
                return Err(sr.error(FormatErrorKind::SectionSizeMismatch));
            }
        }

        if !code_seen && !module.functions.is_empty() {
            return Err(reader.error(FormatErrorKind::FunctionCodeMismatch));
        }
        if !data_seen && module.data_count.is_some_and(|count| count != 0) {
            return Err(reader.error(FormatErrorKind::DataCountMismatch));
        }

        Ok(module)
    }

    /// Parse and validate the WASM header (magic + version).
    fn parse_header(reader: &mut BinaryReader) -> Result<(), FormatError> {
        let magic = reader
            .read_bytes(4)
            .map_err(|e| FormatError::new(FormatErrorKind::BadMagic, e.offset))?;
        if magic != WASM_MAGIC {
            return Err(FormatError::new(FormatErrorKind::BadMagic, 0));
        }

        let version = reader.read_u32_le()?;
        if version != WASM_VERSION {
            return Err(FormatError::new(FormatErrorKind::UnknownVersion(version), 4));
        }

        Ok(())
    }

    fn require(&self, feature: Features, what: &'static str, offset: usize) -> Result<(), FormatError> {
        if self.config.features.contains(feature) {
            Ok(())
        } else {
            Err(FormatError::new(FormatErrorKind::FeatureDisabled(what), offset))
        }
    }

    // ========================================================================
    // Section Parsers
    // ========================================================================

    fn parse_custom_section(
        &self,
        reader: &mut BinaryReader,
        module: &mut Module,
    ) -> Result<(), FormatError> {
        let name = reader.read_name()?;
        let data = reader.read_bytes(reader.remaining())?;
        if name == "name" {
            // A broken name section is not a malformed module.
            if let Some(module_name) = Self::try_parse_module_name(data) {
                module.name = Some(module_name);
            }
        }
        if self.config.keep_custom_sections {
            module.custom_sections.push(CustomSection {
                name,
                data: data.to_vec(),
            });
        }
        Ok(())
    }

    /// Module name subsection (id 0) of the "name" custom section.
    fn try_parse_module_name(data: &[u8]) -> Option<String> {
        let mut reader = BinaryReader::new(data);
        while !reader.is_empty() {
            let subsection_id = reader.read_byte().ok()?;
            let subsection_size = reader.read_leb128_u32().ok()? as usize;
            if subsection_id == 0 {
                return reader.read_name().ok();
            }
            reader.skip(subsection_size).ok()?;
        }
        None
    }

    /// Parse Type Section (1). Recursion groups are flattened.
    fn parse_type_section(&self, reader: &mut BinaryReader) -> Result<Vec<SubType>, FormatError> {
        let count = reader.read_leb128_u32()?;
        let mut types = Vec::new();
        for _ in 0..count {
            let offset = reader.position();
            if reader.peek_byte()? == 0x4E {
                reader.read_byte()?;
                self.require(Features::GC_TYPES, "rec group", offset)?;
                let group = reader.read_vec(|r| self.parse_sub_type(r))?;
                types.extend(group);
            } else {
                types.push(self.parse_sub_type(reader)?);
            }
        }
        Ok(types)
    }

    fn parse_sub_type(&self, reader: &mut BinaryReader) -> Result<SubType, FormatError> {
        let offset = reader.position();
        let is_final = match reader.peek_byte()? {
            0x50 => false,
            0x4F => true,
            _ => {
                let composite = self.parse_composite_type(reader)?;
                return Ok(SubType {
                    is_final: true,
                    supertype: None,
                    composite,
                });
            }
        };
        reader.read_byte()?;
        self.require(Features::GC_TYPES, "sub type", offset)?;
        let supers = reader.read_vec(|r| r.read_leb128_u32())?;
        if supers.len() > 1 {
            return Err(FormatError::new(FormatErrorKind::TooManySupertypes, offset));
        }
        let composite = self.parse_composite_type(reader)?;
        Ok(SubType {
            is_final,
            supertype: supers.first().copied(),
            composite,
        })
    }

    fn parse_composite_type(&self, reader: &mut BinaryReader) -> Result<CompositeType, FormatError> {
        let offset = reader.position();
        let form = reader.read_byte()?;
        match form {
            0x60 => {
                let params = reader.read_vec(|r| self.parse_val_type(r))?;
                let results = reader.read_vec(|r| self.parse_val_type(r))?;
                Ok(CompositeType::Func(FuncType { params, results }))
            }
            0x5F => {
                self.require(Features::GC_TYPES, "struct type", offset)?;
                let fields = reader.read_vec(|r| self.parse_field_type(r))?;
                Ok(CompositeType::Struct(StructType { fields }))
            }
            0x5E => {
                self.require(Features::GC_TYPES, "array type", offset)?;
                let field = self.parse_field_type(reader)?;
                Ok(CompositeType::Array(ArrayType { field }))
            }
            _ => Err(FormatError::new(FormatErrorKind::MalformedTypeForm(form), offset)),
        }
    }

    fn parse_field_type(&self, reader: &mut BinaryReader) -> Result<FieldType, FormatError> {
        let storage = match reader.peek_byte()? {
            0x78 => {
                reader.read_byte()?;
                StorageType::I8
            }
            0x77 => {
                reader.read_byte()?;
                StorageType::I16
            }
            _ => StorageType::Val(self.parse_val_type(reader)?),
        };
        let mutable = Self::parse_mutability(reader)?;
        Ok(FieldType { storage, mutable })
    }

    /// Parse one import entry.
    fn parse_import(&self, reader: &mut BinaryReader) -> Result<Import, FormatError> {
        let module = reader.read_name()?;
        let name = reader.read_name()?;
        let offset = reader.position();
        let kind = match reader.read_byte()? {
            0x00 => ImportKind::Function(reader.read_leb128_u32()?),
            0x01 => ImportKind::Table(self.parse_table_type(reader)?),
            0x02 => ImportKind::Memory(self.parse_memory_type(reader)?),
            0x03 => ImportKind::Global(self.parse_global_type(reader)?),
            other => {
                return Err(FormatError::new(FormatErrorKind::MalformedImportKind(other), offset))
            }
        };
        Ok(Import { module, name, kind })
    }

    /// Table entry, optionally with an initialiser (`0x40 0x00` prefix).
    fn parse_table(&self, reader: &mut BinaryReader) -> Result<Table, FormatError> {
        if reader.peek_byte()? == 0x40 {
            let offset = reader.position();
            reader.read_byte()?;
            if reader.read_byte()? != 0x00 {
                return Err(FormatError::new(FormatErrorKind::MalformedTypeForm(0x40), offset));
            }
            let ty = self.parse_table_type(reader)?;
            let init = self.parse_const_expr(reader)?;
            return Ok(Table {
                ty,
                init: Some(init),
            });
        }
        Ok(Table {
            ty: self.parse_table_type(reader)?,
            init: None,
        })
    }

    fn parse_export(reader: &mut BinaryReader) -> Result<Export, FormatError> {
        let name = reader.read_name()?;
        let offset = reader.position();
        let kind = match reader.read_byte()? {
            0x00 => ExportKind::Function,
            0x01 => ExportKind::Table,
            0x02 => ExportKind::Memory,
            0x03 => ExportKind::Global,
            other => {
                return Err(FormatError::new(FormatErrorKind::MalformedExportKind(other), offset))
            }
        };
        let index = reader.read_leb128_u32()?;
        Ok(Export { name, kind, index })
    }

    /// Element segment, all eight encodings.
    fn parse_element(&self, reader: &mut BinaryReader) -> Result<Element, FormatError> {
        let offset = reader.position();
        let flags = reader.read_leb128_u32()?;
        if flags > 7 {
            return Err(FormatError::new(FormatErrorKind::MalformedElementKind(flags), offset));
        }
        let passive_or_declarative = flags & 0b001 != 0;
        let explicit_table = flags & 0b010 != 0;
        let uses_exprs = flags & 0b100 != 0;

        let mode = if passive_or_declarative {
            if explicit_table {
                ElementMode::Declarative
            } else {
                ElementMode::Passive
            }
        } else {
            let table = if explicit_table {
                reader.read_leb128_u32()?
            } else {
                0
            };
            ElementMode::Active {
                table,
                offset: self.parse_const_expr(reader)?,
            }
        };

        // Forms 0 and 4 carry neither elemkind nor reftype.
        let has_type = passive_or_declarative || explicit_table;
        let (ty, items) = if uses_exprs {
            let ty = if has_type {
                self.parse_ref_type(reader)?
            } else {
                RefType::FUNCREF
            };
            let exprs = reader.read_vec(|r| self.parse_const_expr(r))?;
            (ty, ElementItems::Expressions(exprs))
        } else {
            if has_type {
                let kind_offset = reader.position();
                let elemkind = reader.read_byte()?;
                if elemkind != 0x00 {
                    return Err(FormatError::new(
                        FormatErrorKind::MalformedElementKind(u32::from(elemkind)),
                        kind_offset,
                    ));
                }
            }
            let funcs = reader.read_vec(|r| r.read_leb128_u32())?;
            (RefType::FUNCREF, ElementItems::Functions(funcs))
        };

        Ok(Element { ty, items, mode })
    }

    /// Parse one code entry: locals + instruction sequence.
    fn parse_function_body(&self, reader: &mut BinaryReader) -> Result<FunctionBody, FormatError> {
        let body_size = reader.read_leb128_u32()? as usize;
        let mut body = reader.sub_reader(body_size)?;

        let mut total_locals = 0u64;
        let locals = body.read_vec(|r| {
            let count = r.read_leb128_u32()?;
            total_locals += u64::from(count);
            if total_locals > self.config.max_locals {
                return Err(r.error(FormatErrorKind::TooManyLocals));
            }
            let ty = self.parse_val_type(r)?;
            Ok((count, ty))
        })?;

        let instructions = self.decode_expr(&mut body)?;
        if !body.is_empty() {
            return Err(body.error(FormatErrorKind::SectionSizeMismatch));
        }

        Ok(FunctionBody {
            locals,
            instructions,
        })
    }

    /// Data segment, all three encodings.
    fn parse_data(&self, reader: &mut BinaryReader) -> Result<DataSegment, FormatError> {
        let offset = reader.position();
        let flags = reader.read_leb128_u32()?;
        let mode = match flags {
            0 => DataMode::Active {
                memory: 0,
                offset: self.parse_const_expr(reader)?,
            },
            1 => DataMode::Passive,
            2 => {
                let memory = reader.read_leb128_u32()?;
                DataMode::Active {
                    memory,
                    offset: self.parse_const_expr(reader)?,
                }
            }
            _ => return Err(FormatError::new(FormatErrorKind::MalformedDataKind(flags), offset)),
        };
        let len = reader.read_leb128_u32()? as usize;
        let data = reader.read_bytes(len)?.to_vec();
        Ok(DataSegment { mode, data })
    }

    // ========================================================================
    // Type Parsers
    // ========================================================================

    /// Parse a value type.
    pub fn parse_val_type(&self, reader: &mut BinaryReader) -> Result<ValType, FormatError> {
        let offset = reader.position();
        match reader.peek_byte()? {
            0x7F => {
                reader.read_byte()?;
                Ok(ValType::I32)
            }
            0x7E => {
                reader.read_byte()?;
                Ok(ValType::I64)
            }
            0x7D => {
                reader.read_byte()?;
                Ok(ValType::F32)
            }
            0x7C => {
                reader.read_byte()?;
                Ok(ValType::F64)
            }
            0x7B => {
                reader.read_byte()?;
                Ok(ValType::V128)
            }
            byte if Self::is_ref_type_byte(byte) => Ok(ValType::Ref(self.parse_ref_type(reader)?)),
            byte => Err(FormatError::new(FormatErrorKind::MalformedValType(byte), offset)),
        }
    }

    fn is_ref_type_byte(byte: u8) -> bool {
        matches!(byte, 0x63 | 0x64) || Self::abstract_heap_type(byte).is_some()
    }

    /// Single-byte heap type encodings.
    fn abstract_heap_type(byte: u8) -> Option<HeapType> {
        Some(match byte {
            0x70 => HeapType::Func,
            0x6F => HeapType::Extern,
            0x6E => HeapType::Any,
            0x6D => HeapType::Eq,
            0x6C => HeapType::I31,
            0x6B => HeapType::Struct,
            0x6A => HeapType::Array,
            0x71 => HeapType::None,
            0x73 => HeapType::NoFunc,
            0x72 => HeapType::NoExtern,
            _ => return None,
        })
    }

    /// Parse a reference type (full `0x63`/`0x64` forms or shorthands).
    pub fn parse_ref_type(&self, reader: &mut BinaryReader) -> Result<RefType, FormatError> {
        let offset = reader.position();
        let byte = reader.read_byte()?;
        let rt = match byte {
            0x63 => RefType::new(true, self.parse_heap_type(reader)?),
            0x64 => RefType::new(false, self.parse_heap_type(reader)?),
            _ => match Self::abstract_heap_type(byte) {
                Some(heap) => RefType::new(true, heap),
                None => {
                    return Err(FormatError::new(FormatErrorKind::MalformedRefType(byte), offset))
                }
            },
        };
        if rt != RefType::FUNCREF && rt != RefType::EXTERNREF {
            let needed = match rt.heap {
                HeapType::Func | HeapType::Extern | HeapType::Concrete(_) | HeapType::NoFunc
                | HeapType::NoExtern => Features::FUNCTION_REFERENCES,
                _ => Features::GC_TYPES,
            };
            self.require(needed, "typed reference", offset)?;
        }
        Ok(rt)
    }

    /// Parse a heap type (abstract byte or non-negative s33 type index).
    pub fn parse_heap_type(&self, reader: &mut BinaryReader) -> Result<HeapType, FormatError> {
        if let Some(heap) = Self::abstract_heap_type(reader.peek_byte()?) {
            reader.read_byte()?;
            return Ok(heap);
        }
        let offset = reader.position();
        let idx = reader.read_leb128_s33()?;
        u32::try_from(idx)
            .map(HeapType::Concrete)
            .map_err(|_| FormatError::new(FormatErrorKind::MalformedHeapType, offset))
    }

    /// Parse a table type.
    fn parse_table_type(&self, reader: &mut BinaryReader) -> Result<TableType, FormatError> {
        let element = self.parse_ref_type(reader)?;
        let offset = reader.position();
        let flags = reader.read_byte()?;
        if flags > 0x01 {
            return Err(FormatError::new(FormatErrorKind::MalformedLimits(flags), offset));
        }
        let limits = Self::parse_limits_body(reader, flags)?;
        Ok(TableType { element, limits })
    }

    /// Parse a memory type.
    fn parse_memory_type(&self, reader: &mut BinaryReader) -> Result<MemoryType, FormatError> {
        let offset = reader.position();
        let flags = reader.read_byte()?;
        // 0x04 would be memory64.
        if flags > 0x03 {
            return Err(FormatError::new(FormatErrorKind::MalformedLimits(flags), offset));
        }
        let shared = flags & 0x02 != 0;
        let limits = Self::parse_limits_body(reader, flags)?;
        Ok(MemoryType { limits, shared })
    }

    /// Parse min and (if flagged) max.
    fn parse_limits_body(reader: &mut BinaryReader, flags: u8) -> Result<Limits, FormatError> {
        let min = reader.read_leb128_u32()?;
        let max = if flags & 0x01 != 0 {
            Some(reader.read_leb128_u32()?)
        } else {
            None
        };
        Ok(Limits { min, max })
    }

    /// Parse a global type.
    fn parse_global_type(&self, reader: &mut BinaryReader) -> Result<GlobalType, FormatError> {
        let content = self.parse_val_type(reader)?;
        let mutable = Self::parse_mutability(reader)?;
        Ok(GlobalType { content, mutable })
    }

    fn parse_mutability(reader: &mut BinaryReader) -> Result<bool, FormatError> {
        let offset = reader.position();
        match reader.read_byte()? {
            0x00 => Ok(false),
            0x01 => Ok(true),
            other => Err(FormatError::new(FormatErrorKind::MalformedMutability(other), offset)),
        }
    }

    fn parse_block_type(&self, reader: &mut BinaryReader) -> Result<BlockType, FormatError> {
        let byte = reader.peek_byte()?;
        if byte == 0x40 {
            reader.read_byte()?;
            return Ok(BlockType::Empty);
        }
        if matches!(byte, 0x7B..=0x7F) || Self::is_ref_type_byte(byte) {
            return Ok(BlockType::Value(self.parse_val_type(reader)?));
        }
        let offset = reader.position();
        let idx = reader.read_leb128_s33()?;
        u32::try_from(idx)
            .map(BlockType::TypeIndex)
            .map_err(|_| FormatError::new(FormatErrorKind::MalformedValType(byte), offset))
    }

    // ========================================================================
    // Instruction Decoding
    // ========================================================================

    /// Parse a constant expression; the terminating `end` is dropped.
    fn parse_const_expr(&self, reader: &mut BinaryReader) -> Result<ConstExpr, FormatError> {
        let mut instrs = self.decode_expr(reader)?;
        instrs.pop();
        Ok(ConstExpr(instrs))
    }

    /// Decode instructions up to and including the `end` that closes the
    /// expression.
    pub fn decode_expr(&self, reader: &mut BinaryReader) -> Result<Vec<Instruction>, FormatError> {
        let mut instrs = Vec::new();
        let mut depth = 0usize;
        loop {
            if reader.is_empty() {
                return Err(reader.error(FormatErrorKind::EndExpected));
            }
            let instr = self.decode_instruction(reader)?;
            match instr {
                Instruction::Block(_) | Instruction::Loop(_) | Instruction::If(_) => depth += 1,
                Instruction::End if depth == 0 => {
                    instrs.push(instr);
                    return Ok(instrs);
                }
                Instruction::End => depth -= 1,
                _ => {}
            }
            instrs.push(instr);
        }
    }

    fn read_mem_arg(&self, reader: &mut BinaryReader) -> Result<MemArg, FormatError> {
        let offset = reader.position();
        let flags = reader.read_leb128_u32()?;
        let (align, memory) = if flags & 0x40 != 0 {
            self.require(Features::MULTI_MEMORY, "memory index in memarg", offset)?;
            (flags & !0x40, reader.read_leb128_u32()?)
        } else {
            (flags, 0)
        };
        if align >= 64 {
            return Err(FormatError::new(FormatErrorKind::MalformedMemArg(flags), offset));
        }
        let mem_offset = reader.read_leb128_u64()?;
        Ok(MemArg {
            align,
            offset: mem_offset,
            memory,
        })
    }

    /// Read a prefixed sub-opcode that must fit in a byte.
    fn read_sub_opcode(
        reader: &mut BinaryReader,
        make: fn(u8) -> Opcode,
    ) -> Result<u8, FormatError> {
        let offset = reader.position();
        let sub = reader.read_leb128_u32()?;
        u8::try_from(sub).map_err(|_| {
            FormatError::new(FormatErrorKind::IllegalOpcode(make(u8::MAX)), offset)
        })
    }

    /// Decode a single instruction.
    pub fn decode_instruction(&self, reader: &mut BinaryReader) -> Result<Instruction, FormatError> {
        use Instruction::*;

        let offset = reader.position();
        let byte = reader.read_byte()?;

        let instr = match byte {
            // ====== Prefixed ======
            0xFB => {
                let sub = Self::read_sub_opcode(reader, Opcode::Gc)?;
                Instruction::decode_simple(Opcode::Gc(sub)).ok_or_else(|| {
                    FormatError::new(FormatErrorKind::IllegalOpcode(Opcode::Gc(sub)), offset)
                })?
            }
            0xFC => self.decode_ext(reader, offset)?,
            0xFD => {
                let sub = reader.read_leb128_u32()?;
                return Err(FormatError::new(
                    FormatErrorKind::UnsupportedOpcode(Opcode::Simd(sub)),
                    offset,
                ));
            }
            0xFE => {
                let sub = Self::read_sub_opcode(reader, Opcode::Atomic)?;
                return Err(FormatError::new(
                    FormatErrorKind::UnsupportedOpcode(Opcode::Atomic(sub)),
                    offset,
                ));
            }

            // ====== Control Flow ======
            0x02 => Block(self.parse_block_type(reader)?),
            0x03 => Loop(self.parse_block_type(reader)?),
            0x04 => If(self.parse_block_type(reader)?),
            0x0C => Br(reader.read_leb128_u32()?),
            0x0D => BrIf(reader.read_leb128_u32()?),
            0x0E => {
                let targets = reader.read_vec(|r| r.read_leb128_u32())?;
                let default = reader.read_leb128_u32()?;
                BrTable(targets, default)
            }
            0x10 => Call(reader.read_leb128_u32()?),
            0x11 => {
                let type_idx = reader.read_leb128_u32()?;
                let table_idx = reader.read_leb128_u32()?;
                CallIndirect(type_idx, table_idx)
            }
            0x12 => ReturnCall(reader.read_leb128_u32()?),
            0x13 => {
                let type_idx = reader.read_leb128_u32()?;
                let table_idx = reader.read_leb128_u32()?;
                ReturnCallIndirect(type_idx, table_idx)
            }
            0x14 => CallRef(reader.read_leb128_u32()?),
            0x15 => ReturnCallRef(reader.read_leb128_u32()?),

            // ====== Parametric ======
            0x1C => SelectTyped(reader.read_vec(|r| self.parse_val_type(r))?),

            // ====== Variable Access ======
            0x20 => LocalGet(reader.read_leb128_u32()?),
            0x21 => LocalSet(reader.read_leb128_u32()?),
            0x22 => LocalTee(reader.read_leb128_u32()?),
            0x23 => GlobalGet(reader.read_leb128_u32()?),
            0x24 => GlobalSet(reader.read_leb128_u32()?),

            // ====== Table Operations ======
            0x25 => TableGet(reader.read_leb128_u32()?),
            0x26 => TableSet(reader.read_leb128_u32()?),

            // ====== Memory ======
            0x28 => I32Load(self.read_mem_arg(reader)?),
            0x29 => I64Load(self.read_mem_arg(reader)?),
            0x2A => F32Load(self.read_mem_arg(reader)?),
            0x2B => F64Load(self.read_mem_arg(reader)?),
            0x2C => I32Load8S(self.read_mem_arg(reader)?),
            0x2D => I32Load8U(self.read_mem_arg(reader)?),
            0x2E => I32Load16S(self.read_mem_arg(reader)?),
            0x2F => I32Load16U(self.read_mem_arg(reader)?),
            0x30 => I64Load8S(self.read_mem_arg(reader)?),
            0x31 => I64Load8U(self.read_mem_arg(reader)?),
            0x32 => I64Load16S(self.read_mem_arg(reader)?),
            0x33 => I64Load16U(self.read_mem_arg(reader)?),
            0x34 => I64Load32S(self.read_mem_arg(reader)?),
            0x35 => I64Load32U(self.read_mem_arg(reader)?),
            0x36 => I32Store(self.read_mem_arg(reader)?),
            0x37 => I64Store(self.read_mem_arg(reader)?),
            0x38 => F32Store(self.read_mem_arg(reader)?),
            0x39 => F64Store(self.read_mem_arg(reader)?),
            0x3A => I32Store8(self.read_mem_arg(reader)?),
            0x3B => I32Store16(self.read_mem_arg(reader)?),
            0x3C => I64Store8(self.read_mem_arg(reader)?),
            0x3D => I64Store16(self.read_mem_arg(reader)?),
            0x3E => I64Store32(self.read_mem_arg(reader)?),
            0x3F => MemorySize(reader.read_leb128_u32()?),
            0x40 => MemoryGrow(reader.read_leb128_u32()?),

            // ====== Constants ======
            0x41 => I32Const(reader.read_leb128_i32()?),
            0x42 => I64Const(reader.read_leb128_i64()?),
            0x43 => F32Const(reader.read_f32()?),
            0x44 => F64Const(reader.read_f64()?),

            // ====== Reference Types ======
            0xD0 => RefNull(self.parse_heap_type(reader)?),
            0xD2 => RefFunc(reader.read_leb128_u32()?),
            0xD5 => BrOnNull(reader.read_leb128_u32()?),
            0xD6 => BrOnNonNull(reader.read_leb128_u32()?),

            _ => Instruction::decode_simple(Opcode::Core(byte)).ok_or_else(|| {
                FormatError::new(FormatErrorKind::IllegalOpcode(Opcode::Core(byte)), offset)
            })?,
        };

        if let Some((feature, what)) = required_feature(&instr) {
            self.require(feature, what, offset)?;
        }

        Ok(instr)
    }

    /// `0xFC`-prefixed instructions.
    fn decode_ext(&self, reader: &mut BinaryReader, offset: usize) -> Result<Instruction, FormatError> {
        use Instruction::*;

        let sub = Self::read_sub_opcode(reader, Opcode::Ext)?;
        let instr = match sub {
            8 => {
                let data = reader.read_leb128_u32()?;
                MemoryInit(data, reader.read_leb128_u32()?)
            }
            9 => DataDrop(reader.read_leb128_u32()?),
            10 => {
                let dst = reader.read_leb128_u32()?;
                MemoryCopy(dst, reader.read_leb128_u32()?)
            }
            11 => MemoryFill(reader.read_leb128_u32()?),
            12 => {
                let elem = reader.read_leb128_u32()?;
                TableInit(elem, reader.read_leb128_u32()?)
            }
            13 => ElemDrop(reader.read_leb128_u32()?),
            14 => {
                let dst = reader.read_leb128_u32()?;
                TableCopy(dst, reader.read_leb128_u32()?)
            }
            15 => TableGrow(reader.read_leb128_u32()?),
            16 => TableSize(reader.read_leb128_u32()?),
            17 => TableFill(reader.read_leb128_u32()?),
            _ => Instruction::decode_simple(Opcode::Ext(sub)).ok_or_else(|| {
                FormatError::new(FormatErrorKind::IllegalOpcode(Opcode::Ext(sub)), offset)
            })?,
        };
        Ok(instr)
    }
}

/// Proposal an instruction belongs to, if it is not MVP.
fn required_feature(instr: &Instruction) -> Option<(Features, &'static str)> {
    use Instruction::*;
    let feature = match instr {
        I32Extend8S | I32Extend16S | I64Extend8S | I64Extend16S | I64Extend32S => {
            Features::SIGN_EXTENSION
        }
        I32TruncSatF32S | I32TruncSatF32U | I32TruncSatF64S | I32TruncSatF64U
        | I64TruncSatF32S | I64TruncSatF32U | I64TruncSatF64S | I64TruncSatF64U => {
            Features::SATURATING_FLOAT_TO_INT
        }
        MemoryInit(_, _) | DataDrop(_) | MemoryCopy(_, _) | MemoryFill(_) | TableInit(_, _)
        | ElemDrop(_) | TableCopy(_, _) => Features::BULK_MEMORY,
        RefNull(_) | RefIsNull | RefFunc(_) | SelectTyped(_) | TableGet(_) | TableSet(_)
        | TableGrow(_) | TableSize(_) | TableFill(_) => Features::REFERENCE_TYPES,
        ReturnCall(_) | ReturnCallIndirect(_, _) => Features::TAIL_CALL,
        ReturnCallRef(_) => Features::TAIL_CALL | Features::FUNCTION_REFERENCES,
        CallRef(_) | RefAsNonNull | BrOnNull(_) | BrOnNonNull(_) => Features::FUNCTION_REFERENCES,
        RefEq | RefI31 | I31GetS | I31GetU => Features::GC_TYPES,
        _ => return None,
    };
    Some((feature, instr.name()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    /// Minimal valid WASM module (empty).
    const MINIMAL_WASM: &[u8] = &[
        0x00, 0x61, 0x73, 0x6D, // magic
        0x01, 0x00, 0x00, 0x00, // version 1
    ];

    /// Header followed by `(id, payload)` sections.
    fn module_bytes(sections: &[(u8, &[u8])]) -> Vec<u8> {
        let mut bytes = MINIMAL_WASM.to_vec();
        for (id, payload) in sections {
            bytes.push(*id);
            bytes.push(payload.len() as u8);
            bytes.extend_from_slice(payload);
        }
        bytes
    }

    fn parse(bytes: &[u8]) -> Result<Module, FormatError> {
        decode(bytes, &ParserConfig::default())
    }

    #[test]
    fn test_parse_minimal_module() {
        let module = parse(MINIMAL_WASM).unwrap();
        assert!(module.types.is_empty());
        assert!(module.imports.is_empty());
        assert!(module.functions.is_empty());
        assert!(module.exports.is_empty());
        assert!(module.start.is_none());
    }

    #[test]
    fn test_parse_invalid_magic() {
        let bytes = [0xFF, 0x61, 0x73, 0x6D, 0x01, 0x00, 0x00, 0x00];
        assert_eq!(parse(&bytes).unwrap_err().kind, FormatErrorKind::BadMagic);
        assert_eq!(parse(&[0x00, 0x61]).unwrap_err().kind, FormatErrorKind::BadMagic);
    }

    #[test]
    fn test_parse_invalid_version() {
        let bytes = [0x00, 0x61, 0x73, 0x6D, 0x02, 0x00, 0x00, 0x00];
        assert_eq!(
            parse(&bytes).unwrap_err().kind,
            FormatErrorKind::UnknownVersion(2)
        );
    }

    #[test]
    fn test_leb128_u32() {
        // 624485 = 0xE5 0x8E 0x26
        let bytes = [0xE5, 0x8E, 0x26];
        let mut reader = BinaryReader::new(&bytes);
        assert_eq!(reader.read_leb128_u32().unwrap(), 624485);
    }

    #[test]
    fn test_leb128_u32_too_long_and_too_large() {
        let too_long = [0x80, 0x80, 0x80, 0x80, 0x80, 0x00];
        let mut reader = BinaryReader::new(&too_long);
        assert_eq!(
            reader.read_leb128_u32().unwrap_err().kind,
            FormatErrorKind::IntegerTooLong
        );

        let too_large = [0xFF, 0xFF, 0xFF, 0xFF, 0x1F];
        let mut reader = BinaryReader::new(&too_large);
        assert_eq!(
            reader.read_leb128_u32().unwrap_err().kind,
            FormatErrorKind::IntegerTooLarge
        );

        let max = [0xFF, 0xFF, 0xFF, 0xFF, 0x0F];
        let mut reader = BinaryReader::new(&max);
        assert_eq!(reader.read_leb128_u32().unwrap(), u32::MAX);
    }

    #[test]
    fn test_leb128_i32_positive() {
        let bytes = [0x08];
        let mut reader = BinaryReader::new(&bytes);
        assert_eq!(reader.read_leb128_i32().unwrap(), 8);
    }

    #[test]
    fn test_leb128_i32_negative() {
        // -1 = 0x7F
        let bytes = [0x7F];
        let mut reader = BinaryReader::new(&bytes);
        assert_eq!(reader.read_leb128_i32().unwrap(), -1);

        // i32::MIN = 0x80 0x80 0x80 0x80 0x78
        let bytes = [0x80, 0x80, 0x80, 0x80, 0x78];
        let mut reader = BinaryReader::new(&bytes);
        assert_eq!(reader.read_leb128_i32().unwrap(), i32::MIN);

        // Unused high bits must match the sign.
        let bytes = [0x80, 0x80, 0x80, 0x80, 0x70];
        let mut reader = BinaryReader::new(&bytes);
        assert_eq!(
            reader.read_leb128_i32().unwrap_err().kind,
            FormatErrorKind::IntegerTooLarge
        );
    }

    #[test]
    fn test_leb128_i64_extremes() {
        let bytes = [0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x7F];
        let mut reader = BinaryReader::new(&bytes);
        assert_eq!(reader.read_leb128_i64().unwrap(), i64::MIN);
    }

    #[test]
    fn test_parse_type_section() {
        // Type section with one function type: (i32, i32) -> (i32)
        #[rustfmt::skip]
        let wasm = module_bytes(&[(1, &[
            0x01, // 1 type
            0x60, // func type marker
            0x02, 0x7F, 0x7F, // 2 params: i32, i32
            0x01, 0x7F,       // 1 result: i32
        ])]);
        let module = parse(&wasm).unwrap();
        assert_eq!(module.types.len(), 1);
        let ft = module.types[0].as_func().unwrap();
        assert_eq!(ft.params, vec![ValType::I32, ValType::I32]);
        assert_eq!(ft.results, vec![ValType::I32]);
    }

    #[test]
    fn test_parse_rec_group_and_typed_refs() {
        #[rustfmt::skip]
        let wasm = module_bytes(&[(1, &[
            0x01,             // 1 rec entry
            0x4E, 0x02,       // rec group of 2
            0x50, 0x00,       // sub, no supertypes
            0x5F, 0x01, 0x63, 0x01, 0x00, // struct { (ref null 1) immutable }
            0x4F, 0x01, 0x00, // sub final, supertype 0
            0x5F, 0x01, 0x63, 0x01, 0x00,
        ])]);
        let module = parse(&wasm).unwrap();
        assert_eq!(module.types.len(), 2);
        assert!(!module.types[0].is_final);
        assert_eq!(module.types[1].supertype, Some(0));
        match &module.types[0].composite {
            CompositeType::Struct(s) => assert_eq!(
                s.fields[0].storage,
                StorageType::Val(ValType::Ref(RefType::new(true, HeapType::Concrete(1))))
            ),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_export_section() {
        // Export section with one function export "_start" => func 0
        #[rustfmt::skip]
        let wasm = module_bytes(&[(7, &[
            0x01, // 1 export
            0x06, // name length
            0x5F, 0x73, 0x74, 0x61, 0x72, 0x74, // "_start"
            0x00, // func kind
            0x00, // func index 0
        ])]);
        let module = parse(&wasm).unwrap();
        assert_eq!(module.exports.len(), 1);
        assert_eq!(module.exports[0].name, "_start");
        assert_eq!(module.exports[0].kind, ExportKind::Function);
        assert_eq!(module.exports[0].index, 0);
    }

    #[test]
    fn test_parse_import_section() {
        #[rustfmt::skip]
        let wasm = module_bytes(&[
            (1, &[0x01, 0x60, 0x01, 0x7F, 0x00]), // type 0: (i32) -> ()
            (2, &[
                0x01,
                0x03, b'e', b'n', b'v',
                0x03, b'l', b'o', b'g',
                0x00, 0x00, // func, type 0
            ]),
        ]);
        let module = parse(&wasm).unwrap();
        assert_eq!(module.imports.len(), 1);
        assert_eq!(module.imports[0].module, "env");
        assert_eq!(module.imports[0].name, "log");
        assert_eq!(module.imports[0].kind, ImportKind::Function(0));
    }

    #[test]
    fn test_parse_memory_section() {
        // Memory section: 1 memory with min=1, max=16
        let wasm = module_bytes(&[(5, &[0x01, 0x01, 0x01, 0x10])]);
        let module = parse(&wasm).unwrap();
        assert_eq!(module.memories.len(), 1);
        assert_eq!(module.memories[0].limits, Limits::new(1, Some(16)));
    }

    #[test]
    fn test_section_order_enforced() {
        let wasm = module_bytes(&[(5, &[0x00]), (1, &[0x00])]);
        assert_eq!(
            parse(&wasm).unwrap_err().kind,
            FormatErrorKind::SectionOutOfOrder(SectionId::Type)
        );
        let duplicate = module_bytes(&[(1, &[0x00]), (1, &[0x00])]);
        assert!(parse(&duplicate).is_err());
        // DataCount precedes Code.
        let ok = module_bytes(&[(12, &[0x00]), (10, &[0x00])]);
        assert!(parse(&ok).is_ok());
    }

    #[test]
    fn test_section_size_mismatch() {
        let wasm = module_bytes(&[(3, &[0x01, 0x00, 0x00])]);
        assert_eq!(
            parse(&wasm).unwrap_err().kind,
            FormatErrorKind::SectionSizeMismatch
        );
    }

    #[test]
    fn test_function_code_mismatch() {
        let wasm = module_bytes(&[(1, &[0x01, 0x60, 0x00, 0x00]), (3, &[0x01, 0x00])]);
        assert_eq!(
            parse(&wasm).unwrap_err().kind,
            FormatErrorKind::FunctionCodeMismatch
        );
    }

    #[test]
    fn test_parse_code_section() {
        #[rustfmt::skip]
        let wasm = module_bytes(&[
            (1, &[0x01, 0x60, 0x00, 0x01, 0x7F]),
            (3, &[0x01, 0x00]),
            (10, &[
                0x01,       // 1 body
                0x09,       // body size
                0x01, 0x01, 0x7F, // 1 local i32
                0x41, 0x01, // i32.const 1
                0x41, 0x01, // i32.const 1
                0x6A,       // i32.add
                0x0B,       // end
            ]),
        ]);
        let module = parse(&wasm).unwrap();
        assert_eq!(module.code[0].locals, vec![(1, ValType::I32)]);
        assert_eq!(
            module.code[0].instructions,
            vec![
                Instruction::I32Const(1),
                Instruction::I32Const(1),
                Instruction::I32Add,
                Instruction::End
            ]
        );
    }

    #[test]
    fn test_missing_end_is_malformed() {
        #[rustfmt::skip]
        let wasm = module_bytes(&[
            (1, &[0x01, 0x60, 0x00, 0x00]),
            (3, &[0x01, 0x00]),
            (10, &[0x01, 0x02, 0x00, 0x01]), // nop without end
        ]);
        assert_eq!(parse(&wasm).unwrap_err().kind, FormatErrorKind::EndExpected);
    }

    #[test]
    fn test_element_segment_forms() {
        #[rustfmt::skip]
        let wasm = module_bytes(&[(9, &[
            0x04,
            0x00, 0x41, 0x00, 0x0B, 0x01, 0x00,             // active, table 0, funcs [0]
            0x01, 0x00, 0x01, 0x00,                         // passive funcs [0]
            0x03, 0x00, 0x01, 0x00,                         // declarative funcs [0]
            0x05, 0x70, 0x01, 0xD0, 0x70, 0x0B,             // passive exprs [ref.null func]
        ])]);
        let module = parse(&wasm).unwrap();
        assert_eq!(module.elements.len(), 4);
        assert!(matches!(module.elements[0].mode, ElementMode::Active { table: 0, .. }));
        assert_eq!(module.elements[1].mode, ElementMode::Passive);
        assert_eq!(module.elements[2].mode, ElementMode::Declarative);
        assert_eq!(
            module.elements[3].items,
            ElementItems::Expressions(vec![ConstExpr(vec![Instruction::RefNull(HeapType::Func)])])
        );
    }

    #[test]
    fn test_data_segment_forms_and_count() {
        #[rustfmt::skip]
        let wasm = module_bytes(&[
            (5, &[0x01, 0x00, 0x01]),
            (12, &[0x02]),
            (11, &[
                0x02,
                0x00, 0x41, 0x08, 0x0B, 0x02, 0xAA, 0xBB, // active at 8
                0x01, 0x01, 0xCC,                         // passive
            ]),
        ]);
        let module = parse(&wasm).unwrap();
        assert_eq!(module.data.len(), 2);
        assert_eq!(module.data[0].data, vec![0xAA, 0xBB]);
        assert_eq!(module.data[1].mode, DataMode::Passive);

        let mismatch = module_bytes(&[(12, &[0x03]), (11, &[0x00])]);
        assert_eq!(
            parse(&mismatch).unwrap_err().kind,
            FormatErrorKind::DataCountMismatch
        );
    }

    #[test]
    fn test_simd_prefix_unsupported() {
        #[rustfmt::skip]
        let wasm = module_bytes(&[
            (1, &[0x01, 0x60, 0x00, 0x00]),
            (3, &[0x01, 0x00]),
            (10, &[0x01, 0x04, 0x00, 0xFD, 0x0C, 0x0B]),
        ]);
        assert_eq!(
            parse(&wasm).unwrap_err().kind,
            FormatErrorKind::UnsupportedOpcode(Opcode::Simd(12))
        );
    }

    #[test]
    fn test_disabled_feature_rejected() {
        #[rustfmt::skip]
        let wasm = module_bytes(&[
            (1, &[0x01, 0x60, 0x00, 0x00]),
            (3, &[0x01, 0x00]),
            (10, &[0x01, 0x03, 0x00, 0x12, 0x00]), // return_call 0 (no end needed to fail)
        ]);
        let config = ParserConfig {
            features: Features::default() - Features::TAIL_CALL,
            ..ParserConfig::default()
        };
        assert_eq!(
            decode(&wasm, &config).unwrap_err().kind,
            FormatErrorKind::FeatureDisabled("return_call")
        );
    }

    #[test]
    fn test_name_section_and_custom_sections() {
        #[rustfmt::skip]
        let wasm = module_bytes(&[(0, &[
            0x04, b'n', b'a', b'm', b'e',
            0x00, 0x04, 0x03, b'a', b'b', b'c', // module name "abc"
        ])]);
        let config = ParserConfig {
            keep_custom_sections: true,
            ..ParserConfig::default()
        };
        let module = decode(&wasm, &config).unwrap();
        assert_eq!(module.name(), Some("abc"));
        assert_eq!(module.custom_sections.len(), 1);
        assert_eq!(module.custom_sections[0].name, "name");
    }
}
