//! Code object representation for compiled units.
//!
//! A `CodeObject` contains the bytecode and all metadata needed by the frame
//! evaluator: constant pool, name tables, stack size, flags, and the compact
//! position table. Code objects are immutable once created; nested functions
//! and classes appear as constants inside their parent's pool.
//!
//! This module also owns the binary persistence format: a tagged marshal of
//! constants and code objects, prefixed (for cache files) by a 4-byte magic
//! number and a 4-byte little-endian source mtime.

use std::fmt;
use std::sync::Arc;

use num_bigint::{BigInt, Sign};
use num_complex::Complex64;

use super::opcode::Opcode;

/// A compiled code object for a module, function, class body, lambda, or
/// generator expression.
#[derive(Debug, Clone, PartialEq)]
pub struct CodeObject {
    /// Unit name (`<module>`, `<lambda>`, `<genexpr>`, or the def/class name).
    pub name: Arc<str>,

    /// Dotted name including enclosing functions and classes.
    pub qualname: Arc<str>,

    /// Filename the unit was compiled from.
    pub filename: Arc<str>,

    /// First source line of the unit.
    pub first_lineno: u32,

    /// Raw bytecode.
    pub code: Box<[u8]>,

    /// Constant pool; slot 0 holds the docstring (or `None`).
    pub consts: Box<[Constant]>,

    /// Global and attribute name strings.
    pub names: Box<[Arc<str>]>,

    /// Fast-local names: parameters first, then locals in binding order.
    pub varnames: Box<[Arc<str>]>,

    /// Variables closed over from an enclosing scope.
    pub freevars: Box<[Arc<str>]>,

    /// Locals boxed into cells for nested scopes.
    pub cellvars: Box<[Arc<str>]>,

    /// Number of positional parameters (excluding `*args`/`**kwargs`).
    pub argcount: u16,

    /// Always zero today; kept for evaluator-contract stability.
    pub posonlyargcount: u16,

    /// Always zero today; kept for evaluator-contract stability.
    pub kwonlyargcount: u16,

    /// Total fast-local slot count (`varnames.len()`).
    pub nlocals: u16,

    /// Maximum operand-stack depth, proven by the assembler's dataflow.
    pub stacksize: u32,

    /// Code flags.
    pub flags: CodeFlags,

    /// Encoded source positions, one per bytecode byte. See
    /// [`encode_positions`].
    pub line_table: Box<[u8]>,
}

impl CodeObject {
    /// True if this unit is a generator function body.
    #[inline]
    pub fn is_generator(&self) -> bool {
        self.flags.contains(CodeFlags::GENERATOR)
    }

    /// Docstring of the unit, if one was present.
    pub fn docstring(&self) -> Option<&str> {
        match self.consts.first() {
            Some(Constant::Str(s)) => Some(s),
            _ => None,
        }
    }

    /// Full source position for a bytecode offset.
    pub fn position_for_offset(&self, offset: u32) -> Option<SourcePosition> {
        let positions = decode_positions(&self.line_table, self.first_lineno)?;
        positions.get(offset as usize).copied()
    }

    /// Source line for a bytecode offset.
    pub fn line_for_offset(&self, offset: u32) -> Option<u32> {
        self.position_for_offset(offset).map(|p| p.lineno)
    }

    /// Number of closure slots (cells first, then frees).
    #[inline]
    pub fn closure_size(&self) -> usize {
        self.cellvars.len() + self.freevars.len()
    }
}

// ============================================================================
// Flags
// ============================================================================

/// Code object flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CodeFlags(u32);

impl CodeFlags {
    /// No flags.
    pub const NONE: CodeFlags = CodeFlags(0);
    /// Locals are fast slots; names never fall back to a locals dict.
    pub const OPTIMIZED: CodeFlags = CodeFlags(0x0001);
    /// A fresh locals namespace is created per invocation.
    pub const NEWLOCALS: CodeFlags = CodeFlags(0x0002);
    /// Function takes `*args`.
    pub const VARARGS: CodeFlags = CodeFlags(0x0004);
    /// Function takes `**kwargs`.
    pub const VARKEYWORDS: CodeFlags = CodeFlags(0x0008);
    /// Unit is nested inside another function scope.
    pub const NESTED: CodeFlags = CodeFlags(0x0010);
    /// Unit is a generator body.
    pub const GENERATOR: CodeFlags = CodeFlags(0x0020);
    /// `from __future__ import generators` was in effect.
    pub const GENERATOR_ALLOWED: CodeFlags = CodeFlags(0x1000);
    /// `from __future__ import division` was in effect.
    pub const FUTURE_DIVISION: CodeFlags = CodeFlags(0x2000);

    /// Check if all flags in `other` are set.
    #[inline]
    pub const fn contains(self, other: CodeFlags) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Combine flags.
    #[inline]
    pub const fn union(self, other: CodeFlags) -> CodeFlags {
        CodeFlags(self.0 | other.0)
    }

    /// Raw bit value.
    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Rebuild from a raw bit value.
    #[inline]
    pub const fn from_bits(bits: u32) -> CodeFlags {
        CodeFlags(bits)
    }
}

impl std::ops::BitOr for CodeFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        self.union(rhs)
    }
}

impl std::ops::BitOrAssign for CodeFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

// ============================================================================
// Constants
// ============================================================================

/// A compile-time constant value.
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    None,
    Ellipsis,
    Bool(bool),
    Int(i64),
    Long(BigInt),
    Float(f64),
    Complex(Complex64),
    Str(String),
    Tuple(Vec<Constant>),
    Code(Arc<CodeObject>),
}

impl Constant {
    /// Truth value under the language's truthiness rules.
    pub fn truth(&self) -> bool {
        match self {
            Constant::None => false,
            Constant::Ellipsis => true,
            Constant::Bool(b) => *b,
            Constant::Int(i) => *i != 0,
            Constant::Long(l) => l.sign() != Sign::NoSign,
            Constant::Float(f) => *f != 0.0,
            Constant::Complex(c) => c.re != 0.0 || c.im != 0.0,
            Constant::Str(s) => !s.is_empty(),
            Constant::Tuple(items) => !items.is_empty(),
            Constant::Code(_) => true,
        }
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::None => f.write_str("None"),
            Constant::Ellipsis => f.write_str("Ellipsis"),
            Constant::Bool(true) => f.write_str("True"),
            Constant::Bool(false) => f.write_str("False"),
            Constant::Int(i) => write!(f, "{i}"),
            Constant::Long(l) => write!(f, "{l}L"),
            Constant::Float(x) => write!(f, "{x:?}"),
            Constant::Complex(c) => write!(f, "({}+{}j)", c.re, c.im),
            Constant::Str(s) => write!(f, "{s:?}"),
            Constant::Tuple(items) => {
                f.write_str("(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                if items.len() == 1 {
                    f.write_str(",")?;
                }
                f.write_str(")")
            }
            Constant::Code(code) => write!(f, "<code {}>", code.qualname),
        }
    }
}

// ============================================================================
// Source positions
// ============================================================================

/// Full source position of one bytecode byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourcePosition {
    pub lineno: u32,
    pub end_lineno: u32,
    pub col: u32,
    pub end_col: u32,
}

/// Encode a position list into the compact line-table form.
///
/// Runs of identical positions become one record. A record starts with a
/// VLQ header `(run_len << 1) | full_bit`, then a zigzag line delta against
/// the previous record (initially `first_lineno`). Full records additionally
/// carry the line span and both columns; short records reuse the previous
/// record's span and columns and may only move the starting line.
pub fn encode_positions(positions: &[SourcePosition], first_lineno: u32) -> Vec<u8> {
    let mut out = Vec::new();
    let mut prev_line = first_lineno as i64;
    let mut prev_span = 0u32;
    let mut prev_col = 0u32;
    let mut prev_end_col = 0u32;
    let mut have_prev = false;

    let mut i = 0;
    while i < positions.len() {
        let pos = positions[i];
        let mut run = 1usize;
        while i + run < positions.len() && positions[i + run] == pos {
            run += 1;
        }

        let span = pos.end_lineno - pos.lineno;
        let full = !have_prev
            || span != prev_span
            || pos.col != prev_col
            || pos.end_col != prev_end_col;

        write_uvlq(&mut out, ((run as u64) << 1) | full as u64);
        write_svlq(&mut out, pos.lineno as i64 - prev_line);
        if full {
            write_uvlq(&mut out, span as u64);
            write_uvlq(&mut out, pos.col as u64);
            write_uvlq(&mut out, pos.end_col as u64);
        }

        prev_line = pos.lineno as i64;
        prev_span = span;
        prev_col = pos.col;
        prev_end_col = pos.end_col;
        have_prev = true;
        i += run;
    }
    out
}

/// Decode a line table produced by [`encode_positions`]. Returns `None` on
/// malformed input.
pub fn decode_positions(data: &[u8], first_lineno: u32) -> Option<Vec<SourcePosition>> {
    let mut out = Vec::new();
    let mut pos = 0usize;
    let mut prev_line = first_lineno as i64;
    let mut prev_span = 0u32;
    let mut prev_col = 0u32;
    let mut prev_end_col = 0u32;

    while pos < data.len() {
        let header = read_uvlq(data, &mut pos)?;
        let run = (header >> 1) as usize;
        let full = (header & 1) != 0;
        if run == 0 {
            return None;
        }

        let line = prev_line + read_svlq(data, &mut pos)?;
        if line < 1 {
            return None;
        }
        let (span, col, end_col) = if full {
            (
                read_uvlq(data, &mut pos)? as u32,
                read_uvlq(data, &mut pos)? as u32,
                read_uvlq(data, &mut pos)? as u32,
            )
        } else {
            (prev_span, prev_col, prev_end_col)
        };

        let position = SourcePosition {
            lineno: line as u32,
            end_lineno: line as u32 + span,
            col,
            end_col,
        };
        for _ in 0..run {
            out.push(position);
        }

        prev_line = line;
        prev_span = span;
        prev_col = col;
        prev_end_col = end_col;
    }
    Some(out)
}

fn write_uvlq(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

fn write_svlq(out: &mut Vec<u8>, value: i64) {
    // zigzag: sign bit moves to bit 0
    write_uvlq(out, ((value << 1) ^ (value >> 63)) as u64);
}

fn read_uvlq(data: &[u8], pos: &mut usize) -> Option<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = *data.get(*pos)?;
        *pos += 1;
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Some(value);
        }
        shift += 7;
        if shift > 63 {
            return None;
        }
    }
}

fn read_svlq(data: &[u8], pos: &mut usize) -> Option<i64> {
    let raw = read_uvlq(data, pos)?;
    Some((raw >> 1) as i64 ^ -((raw & 1) as i64))
}

// ============================================================================
// Persistence
// ============================================================================

/// Magic number at the head of cached artifacts.
pub const CACHE_MAGIC: u32 = 0x4C41_504F; // "OPAL"

/// Errors produced while reading a marshalled code object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarshalError {
    UnexpectedEof,
    BadTag(u8),
    BadMagic,
    InvalidUtf8,
}

impl fmt::Display for MarshalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarshalError::UnexpectedEof => f.write_str("unexpected end of data"),
            MarshalError::BadTag(tag) => write!(f, "unknown marshal tag 0x{tag:02x}"),
            MarshalError::BadMagic => f.write_str("bad cache magic number"),
            MarshalError::InvalidUtf8 => f.write_str("invalid utf-8 in string"),
        }
    }
}

impl std::error::Error for MarshalError {}

const TAG_NONE: u8 = b'N';
const TAG_ELLIPSIS: u8 = b'.';
const TAG_TRUE: u8 = b'T';
const TAG_FALSE: u8 = b'F';
const TAG_INT: u8 = b'i';
const TAG_LONG: u8 = b'l';
const TAG_FLOAT: u8 = b'f';
const TAG_COMPLEX: u8 = b'x';
const TAG_STR: u8 = b's';
const TAG_TUPLE: u8 = b'(';
const TAG_CODE: u8 = b'c';

/// Serialize a code object with the cache-file header.
pub fn dump_cache(code: &CodeObject, mtime: u32) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&CACHE_MAGIC.to_le_bytes());
    out.extend_from_slice(&mtime.to_le_bytes());
    write_code(&mut out, code);
    out
}

/// Read a cached artifact back; returns the code object and its mtime.
pub fn load_cache(data: &[u8]) -> Result<(CodeObject, u32), MarshalError> {
    let mut reader = Reader { data, pos: 0 };
    if reader.read_u32()? != CACHE_MAGIC {
        return Err(MarshalError::BadMagic);
    }
    let mtime = reader.read_u32()?;
    let code = reader.read_code()?;
    Ok((code, mtime))
}

fn write_code(out: &mut Vec<u8>, code: &CodeObject) {
    write_str(out, &code.name);
    write_str(out, &code.qualname);
    write_str(out, &code.filename);
    out.extend_from_slice(&code.first_lineno.to_le_bytes());
    write_bytes(out, &code.code);
    out.extend_from_slice(&(code.consts.len() as u32).to_le_bytes());
    for value in code.consts.iter() {
        write_const(out, value);
    }
    write_names(out, &code.names);
    write_names(out, &code.varnames);
    write_names(out, &code.freevars);
    write_names(out, &code.cellvars);
    out.extend_from_slice(&code.argcount.to_le_bytes());
    out.extend_from_slice(&code.posonlyargcount.to_le_bytes());
    out.extend_from_slice(&code.kwonlyargcount.to_le_bytes());
    out.extend_from_slice(&code.nlocals.to_le_bytes());
    out.extend_from_slice(&code.stacksize.to_le_bytes());
    out.extend_from_slice(&code.flags.bits().to_le_bytes());
    write_bytes(out, &code.line_table);
}

fn write_const(out: &mut Vec<u8>, value: &Constant) {
    match value {
        Constant::None => out.push(TAG_NONE),
        Constant::Ellipsis => out.push(TAG_ELLIPSIS),
        Constant::Bool(true) => out.push(TAG_TRUE),
        Constant::Bool(false) => out.push(TAG_FALSE),
        Constant::Int(i) => {
            out.push(TAG_INT);
            out.extend_from_slice(&i.to_le_bytes());
        }
        Constant::Long(l) => {
            out.push(TAG_LONG);
            let (sign, magnitude) = l.to_bytes_le();
            out.push(match sign {
                Sign::Minus => 0xff,
                Sign::NoSign => 0,
                Sign::Plus => 1,
            });
            write_bytes(out, &magnitude);
        }
        Constant::Float(x) => {
            out.push(TAG_FLOAT);
            out.extend_from_slice(&x.to_bits().to_le_bytes());
        }
        Constant::Complex(c) => {
            out.push(TAG_COMPLEX);
            out.extend_from_slice(&c.re.to_bits().to_le_bytes());
            out.extend_from_slice(&c.im.to_bits().to_le_bytes());
        }
        Constant::Str(s) => {
            out.push(TAG_STR);
            write_str(out, s);
        }
        Constant::Tuple(items) => {
            out.push(TAG_TUPLE);
            out.extend_from_slice(&(items.len() as u32).to_le_bytes());
            for item in items {
                write_const(out, item);
            }
        }
        Constant::Code(code) => {
            out.push(TAG_CODE);
            write_code(out, code);
        }
    }
}

fn write_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
}

fn write_str(out: &mut Vec<u8>, s: &str) {
    write_bytes(out, s.as_bytes());
}

fn write_names(out: &mut Vec<u8>, names: &[Arc<str>]) {
    out.extend_from_slice(&(names.len() as u32).to_le_bytes());
    for name in names {
        write_str(out, name);
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], MarshalError> {
        let end = self.pos.checked_add(len).ok_or(MarshalError::UnexpectedEof)?;
        if end > self.data.len() {
            return Err(MarshalError::UnexpectedEof);
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, MarshalError> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16, MarshalError> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn read_u32(&mut self) -> Result<u32, MarshalError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_u64(&mut self) -> Result<u64, MarshalError> {
        let bytes = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(buf))
    }

    fn read_f64(&mut self) -> Result<f64, MarshalError> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    fn read_raw(&mut self) -> Result<&'a [u8], MarshalError> {
        let len = self.read_u32()? as usize;
        self.take(len)
    }

    fn read_str(&mut self) -> Result<&'a str, MarshalError> {
        std::str::from_utf8(self.read_raw()?).map_err(|_| MarshalError::InvalidUtf8)
    }

    fn read_names(&mut self) -> Result<Box<[Arc<str>]>, MarshalError> {
        let count = self.read_u32()? as usize;
        let mut names = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            names.push(Arc::from(self.read_str()?));
        }
        Ok(names.into_boxed_slice())
    }

    fn read_const(&mut self) -> Result<Constant, MarshalError> {
        let tag = self.read_u8()?;
        Ok(match tag {
            TAG_NONE => Constant::None,
            TAG_ELLIPSIS => Constant::Ellipsis,
            TAG_TRUE => Constant::Bool(true),
            TAG_FALSE => Constant::Bool(false),
            TAG_INT => Constant::Int(self.read_u64()? as i64),
            TAG_LONG => {
                let sign = match self.read_u8()? {
                    0xff => Sign::Minus,
                    0 => Sign::NoSign,
                    _ => Sign::Plus,
                };
                let magnitude = self.read_raw()?;
                Constant::Long(BigInt::from_bytes_le(sign, magnitude))
            }
            TAG_FLOAT => Constant::Float(self.read_f64()?),
            TAG_COMPLEX => {
                let re = self.read_f64()?;
                let im = self.read_f64()?;
                Constant::Complex(Complex64::new(re, im))
            }
            TAG_STR => Constant::Str(self.read_str()?.to_owned()),
            TAG_TUPLE => {
                let count = self.read_u32()? as usize;
                let mut items = Vec::with_capacity(count.min(4096));
                for _ in 0..count {
                    items.push(self.read_const()?);
                }
                Constant::Tuple(items)
            }
            TAG_CODE => Constant::Code(Arc::new(self.read_code()?)),
            other => return Err(MarshalError::BadTag(other)),
        })
    }

    fn read_code(&mut self) -> Result<CodeObject, MarshalError> {
        let name: Arc<str> = Arc::from(self.read_str()?);
        let qualname: Arc<str> = Arc::from(self.read_str()?);
        let filename: Arc<str> = Arc::from(self.read_str()?);
        let first_lineno = self.read_u32()?;
        let code = self.read_raw()?.to_vec().into_boxed_slice();
        let const_count = self.read_u32()? as usize;
        let mut consts = Vec::with_capacity(const_count.min(4096));
        for _ in 0..const_count {
            consts.push(self.read_const()?);
        }
        let names = self.read_names()?;
        let varnames = self.read_names()?;
        let freevars = self.read_names()?;
        let cellvars = self.read_names()?;
        let argcount = self.read_u16()?;
        let posonlyargcount = self.read_u16()?;
        let kwonlyargcount = self.read_u16()?;
        let nlocals = self.read_u16()?;
        let stacksize = self.read_u32()?;
        let flags = CodeFlags::from_bits(self.read_u32()?);
        let line_table = self.read_raw()?.to_vec().into_boxed_slice();
        Ok(CodeObject {
            name,
            qualname,
            filename,
            first_lineno,
            code,
            consts: consts.into_boxed_slice(),
            names,
            varnames,
            freevars,
            cellvars,
            argcount,
            posonlyargcount,
            kwonlyargcount,
            nlocals,
            stacksize,
            flags,
            line_table,
        })
    }
}

// ============================================================================
// Disassembly
// ============================================================================

/// Disassemble a code object to a string, for debugging and tests.
pub fn disassemble(code: &CodeObject) -> String {
    use std::fmt::Write;

    let mut output = String::new();
    let _ = writeln!(output, "Code object: {}", code.qualname);
    let _ = writeln!(output, "  File: {}:{}", code.filename, code.first_lineno);
    let _ = writeln!(
        output,
        "  Args: {}  Locals: {}  Stack: {}  Flags: {:#06x}",
        code.argcount,
        code.nlocals,
        code.stacksize,
        code.flags.bits()
    );

    if !code.consts.is_empty() {
        let _ = writeln!(output, "Constants:");
        for (i, value) in code.consts.iter().enumerate() {
            let _ = writeln!(output, "  {i:4}: {value}");
        }
    }
    if !code.names.is_empty() {
        let _ = writeln!(output, "Names: {}", code.names.join(", "));
    }
    if !code.varnames.is_empty() {
        let _ = writeln!(output, "Varnames: {}", code.varnames.join(", "));
    }
    if !code.cellvars.is_empty() {
        let _ = writeln!(output, "Cellvars: {}", code.cellvars.join(", "));
    }
    if !code.freevars.is_empty() {
        let _ = writeln!(output, "Freevars: {}", code.freevars.join(", "));
    }

    let _ = writeln!(output, "Disassembly:");
    let mut offset = 0usize;
    let mut last_line = 0u32;
    while offset < code.code.len() {
        let start = offset;
        let mut extended = 0u32;
        let (op, arg) = loop {
            let Some(op) = Opcode::from_byte(code.code[offset]) else {
                let _ = writeln!(output, "{offset:6}  <bad opcode {:#04x}>", code.code[offset]);
                return output;
            };
            offset += 1;
            if !op.has_arg() {
                break (op, None);
            }
            if offset + 2 > code.code.len() {
                let _ = writeln!(output, "{start:6}  <truncated operand>");
                return output;
            }
            let low = u16::from_le_bytes([code.code[offset], code.code[offset + 1]]) as u32;
            offset += 2;
            if op == Opcode::ExtendedArg {
                extended = low << 16;
                continue;
            }
            break (op, Some(extended | low));
        };

        let line = code.line_for_offset(start as u32).unwrap_or(0);
        let line_str = if line != last_line {
            last_line = line;
            format!("{line:5}")
        } else {
            "     ".to_owned()
        };
        match arg {
            Some(arg) => {
                let hint = operand_hint(code, op, arg);
                let _ = writeln!(output, "{line_str} {start:6}  {:<20} {arg}{hint}", op.name());
            }
            None => {
                let _ = writeln!(output, "{line_str} {start:6}  {}", op.name());
            }
        }
    }
    output
}

fn operand_hint(code: &CodeObject, op: Opcode, arg: u32) -> String {
    use Opcode::*;
    let idx = arg as usize;
    match op {
        LoadConst => code
            .consts
            .get(idx)
            .map(|c| format!(" ({c})"))
            .unwrap_or_default(),
        LoadName | StoreName | DeleteName | LoadGlobal | StoreGlobal | DeleteGlobal
        | LoadAttr | StoreAttr | DeleteAttr | ImportName | ImportFrom => code
            .names
            .get(idx)
            .map(|n| format!(" ({n})"))
            .unwrap_or_default(),
        LoadFast | StoreFast | DeleteFast => code
            .varnames
            .get(idx)
            .map(|n| format!(" ({n})"))
            .unwrap_or_default(),
        LoadClosure | LoadDeref | StoreDeref => {
            let name = if idx < code.cellvars.len() {
                code.cellvars.get(idx)
            } else {
                code.freevars.get(idx - code.cellvars.len())
            };
            name.map(|n| format!(" ({n})")).unwrap_or_default()
        }
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos(lineno: u32, end_lineno: u32, col: u32, end_col: u32) -> SourcePosition {
        SourcePosition {
            lineno,
            end_lineno,
            col,
            end_col,
        }
    }

    #[test]
    fn test_code_flags() {
        let flags = CodeFlags::OPTIMIZED | CodeFlags::NEWLOCALS | CodeFlags::GENERATOR;
        assert!(flags.contains(CodeFlags::OPTIMIZED));
        assert!(flags.contains(CodeFlags::GENERATOR));
        assert!(!flags.contains(CodeFlags::VARARGS));
        assert_eq!(CodeFlags::from_bits(flags.bits()), flags);
    }

    #[test]
    fn test_positions_round_trip() {
        let positions = vec![
            pos(1, 1, 0, 7),
            pos(1, 1, 0, 7),
            pos(1, 1, 0, 7),
            pos(2, 2, 4, 9),
            pos(2, 3, 4, 1),
            pos(700, 700, 0, 80),
            pos(3, 3, 0, 80),
            pos(3, 3, 0, 80),
        ];
        let encoded = encode_positions(&positions, 1);
        assert_eq!(decode_positions(&encoded, 1), Some(positions));
    }

    #[test]
    fn test_positions_round_trip_long_run() {
        let positions = vec![pos(10, 12, 3, 45); 1000];
        let encoded = encode_positions(&positions, 10);
        assert_eq!(decode_positions(&encoded, 10), Some(positions));
    }

    #[test]
    fn test_positions_empty() {
        assert!(encode_positions(&[], 1).is_empty());
        assert_eq!(decode_positions(&[], 1), Some(vec![]));
    }

    #[test]
    fn test_positions_short_records_reuse_columns() {
        // Same span and columns on consecutive lines: records two and three
        // should be the short form, which is strictly smaller.
        let changing = vec![pos(1, 1, 0, 10), pos(2, 2, 4, 10), pos(3, 3, 8, 10)];
        let stable = vec![pos(1, 1, 0, 10), pos(2, 2, 0, 10), pos(3, 3, 0, 10)];
        let a = encode_positions(&changing, 1);
        let b = encode_positions(&stable, 1);
        assert!(b.len() < a.len());
        assert_eq!(decode_positions(&b, 1), Some(stable));
    }

    #[test]
    fn test_marshal_round_trip() {
        let inner = CodeObject {
            name: Arc::from("f"),
            qualname: Arc::from("f"),
            filename: Arc::from("m.opal"),
            first_lineno: 2,
            code: vec![100, 0, 0, 80].into_boxed_slice(),
            consts: vec![Constant::None].into_boxed_slice(),
            names: Box::new([]),
            varnames: vec![Arc::from("a")].into_boxed_slice(),
            freevars: Box::new([]),
            cellvars: Box::new([]),
            argcount: 1,
            posonlyargcount: 0,
            kwonlyargcount: 0,
            nlocals: 1,
            stacksize: 1,
            flags: CodeFlags::OPTIMIZED | CodeFlags::NEWLOCALS,
            line_table: encode_positions(&[pos(2, 2, 0, 4); 4], 2).into_boxed_slice(),
        };
        let module = CodeObject {
            name: Arc::from("<module>"),
            qualname: Arc::from("<module>"),
            filename: Arc::from("m.opal"),
            first_lineno: 1,
            code: vec![100, 1, 0, 80].into_boxed_slice(),
            consts: vec![
                Constant::None,
                Constant::Code(Arc::new(inner)),
                Constant::Int(14),
                Constant::Long(BigInt::from(10).pow(30)),
                Constant::Float(2.5),
                Constant::Complex(Complex64::new(0.0, 1.0)),
                Constant::Str("doc".to_owned()),
                Constant::Tuple(vec![Constant::Int(1), Constant::None]),
                Constant::Ellipsis,
            ]
            .into_boxed_slice(),
            names: vec![Arc::from("f")].into_boxed_slice(),
            varnames: Box::new([]),
            freevars: Box::new([]),
            cellvars: Box::new([]),
            argcount: 0,
            posonlyargcount: 0,
            kwonlyargcount: 0,
            nlocals: 0,
            stacksize: 2,
            flags: CodeFlags::NONE,
            line_table: Box::new([]),
        };

        let blob = dump_cache(&module, 123_456_789);
        let (loaded, mtime) = load_cache(&blob).unwrap();
        assert_eq!(mtime, 123_456_789);
        assert_eq!(loaded, module);
    }

    #[test]
    fn test_marshal_bad_magic() {
        let blob = vec![0u8; 16];
        assert_eq!(load_cache(&blob), Err(MarshalError::BadMagic));
    }

    #[test]
    fn test_constant_truth() {
        assert!(!Constant::None.truth());
        assert!(!Constant::Int(0).truth());
        assert!(Constant::Int(-1).truth());
        assert!(!Constant::Str(String::new()).truth());
        assert!(Constant::Str("x".to_owned()).truth());
        assert!(!Constant::Tuple(vec![]).truth());
        assert!(!Constant::Long(BigInt::from(0)).truth());
    }
}
