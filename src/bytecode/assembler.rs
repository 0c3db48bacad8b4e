//! Flat bytecode assembler.
//!
//! One `Assembler` serves one code generator. It collects instructions,
//! interns constants and names, records a source position per emitted byte,
//! and resolves label fixups when finished. Labels are write-once: placing
//! one twice, or leaving one unplaced at finish time, is an internal error.
//!
//! Finishing also runs a forward stack-depth dataflow over the final
//! instruction stream. Every offset reachable along two paths must agree on
//! its depth; the maximum depth becomes the unit's `stacksize`.

use std::sync::Arc;

use num_bigint::BigInt;
use rustc_hash::FxHashMap;

use crate::ast::Span;
use crate::error::{CompileError, CompileResult};

use super::code_object::{encode_positions, Constant, SourcePosition};
use super::opcode::{JumpKind, Opcode};

/// A forward-declared jump target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(u32);

/// A recorded jump whose operand is patched at finish time.
#[derive(Debug, Clone, Copy)]
struct Fixup {
    /// Offset of the opcode byte.
    offset: u32,
    label: Label,
    absolute: bool,
}

/// Interning key for the constant pool. Values of different types never
/// share a slot, equal values of the same type always do. Values with no
/// key (code objects, tuples containing them) are appended unconditionally.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ConstKey {
    None,
    Ellipsis,
    Bool(bool),
    Int(i64),
    Long(BigInt),
    Float(u64),
    Complex(u64, u64),
    Str(String),
    Tuple(Vec<ConstKey>),
}

impl ConstKey {
    fn from_const(value: &Constant) -> Option<ConstKey> {
        Some(match value {
            Constant::None => ConstKey::None,
            Constant::Ellipsis => ConstKey::Ellipsis,
            Constant::Bool(b) => ConstKey::Bool(*b),
            Constant::Int(i) => ConstKey::Int(*i),
            Constant::Long(l) => ConstKey::Long(l.clone()),
            Constant::Float(f) => ConstKey::Float(f.to_bits()),
            Constant::Complex(c) => ConstKey::Complex(c.re.to_bits(), c.im.to_bits()),
            Constant::Str(s) => ConstKey::Str(s.clone()),
            Constant::Tuple(items) => ConstKey::Tuple(
                items
                    .iter()
                    .map(ConstKey::from_const)
                    .collect::<Option<Vec<_>>>()?,
            ),
            Constant::Code(_) => return None,
        })
    }
}

/// Everything the assembler hands back to the code generator.
#[derive(Debug)]
pub struct AssembledUnit {
    pub code: Box<[u8]>,
    pub consts: Box<[Constant]>,
    pub names: Box<[Arc<str>]>,
    pub varnames: Box<[Arc<str>]>,
    pub stacksize: u32,
    pub line_table: Box<[u8]>,
}

pub struct Assembler {
    code: Vec<u8>,
    positions: Vec<SourcePosition>,
    current_pos: SourcePosition,
    first_lineno: u32,
    labels: Vec<Option<u32>>,
    fixups: Vec<Fixup>,
    consts: Vec<Constant>,
    const_cache: FxHashMap<ConstKey, u32>,
    names: Vec<Arc<str>>,
    name_cache: FxHashMap<Arc<str>, u32>,
    varnames: Vec<Arc<str>>,
    varname_cache: FxHashMap<Arc<str>, u32>,
    /// Closure slots: cellvars first, then freevars.
    deref_cache: FxHashMap<Arc<str>, u32>,
    docstring_set: bool,
}

impl Assembler {
    /// `varnames` must hold the parameters first; `derefs` is the cellvar
    /// list followed by the freevar list, in final slot order.
    pub fn new(first_lineno: u32, varnames: Vec<Arc<str>>, derefs: &[Arc<str>]) -> Assembler {
        let varname_cache = varnames
            .iter()
            .enumerate()
            .map(|(i, name)| (Arc::clone(name), i as u32))
            .collect();
        let deref_cache = derefs
            .iter()
            .enumerate()
            .map(|(i, name)| (Arc::clone(name), i as u32))
            .collect();
        Assembler {
            code: Vec::new(),
            positions: Vec::new(),
            current_pos: SourcePosition {
                lineno: first_lineno,
                end_lineno: first_lineno,
                col: 0,
                end_col: 0,
            },
            first_lineno,
            labels: Vec::new(),
            fixups: Vec::new(),
            consts: Vec::new(),
            const_cache: FxHashMap::default(),
            names: Vec::new(),
            name_cache: FxHashMap::default(),
            varnames,
            varname_cache,
            deref_cache,
            docstring_set: false,
        }
    }

    /// Current bytecode offset.
    #[inline]
    pub fn offset(&self) -> u32 {
        self.code.len() as u32
    }

    /// Update the source position attached to subsequently emitted bytes.
    pub fn set_position(&mut self, span: Span) {
        self.current_pos = SourcePosition {
            lineno: span.lineno,
            end_lineno: span.end_lineno,
            col: span.col,
            end_col: span.end_col,
        };
    }

    // === Constant and name tables ===

    /// Reserve constant slot 0 for the unit's docstring. Must be called
    /// before anything else is interned.
    pub fn set_docstring(&mut self, doc: Constant) -> CompileResult<()> {
        if self.docstring_set || !self.consts.is_empty() {
            return Err(CompileError::internal("docstring must occupy const slot 0"));
        }
        if let Some(key) = ConstKey::from_const(&doc) {
            self.const_cache.insert(key, 0);
        }
        self.consts.push(doc);
        self.docstring_set = true;
        Ok(())
    }

    /// Intern a constant, returning its pool index.
    pub fn add_const(&mut self, value: Constant) -> u32 {
        match ConstKey::from_const(&value) {
            Some(key) => match self.const_cache.get(&key) {
                Some(&index) => index,
                None => {
                    let index = self.consts.len() as u32;
                    self.consts.push(value);
                    self.const_cache.insert(key, index);
                    index
                }
            },
            None => {
                let index = self.consts.len() as u32;
                self.consts.push(value);
                index
            }
        }
    }

    /// Intern a global/attribute name, returning its table index.
    pub fn add_name(&mut self, name: &str) -> u32 {
        if let Some(&index) = self.name_cache.get(name) {
            return index;
        }
        let name: Arc<str> = Arc::from(name);
        let index = self.names.len() as u32;
        self.names.push(Arc::clone(&name));
        self.name_cache.insert(name, index);
        index
    }

    /// Index of a fast local, appending a hidden name if it is new. Hidden
    /// temporaries (comprehension accumulators, with-statement slots) are
    /// allocated here without the resolver's involvement.
    pub fn add_varname(&mut self, name: &str) -> u32 {
        if let Some(&index) = self.varname_cache.get(name) {
            return index;
        }
        let name: Arc<str> = Arc::from(name);
        let index = self.varnames.len() as u32;
        self.varnames.push(Arc::clone(&name));
        self.varname_cache.insert(name, index);
        index
    }

    /// Closure slot of a cell or free variable.
    pub fn deref_index(&self, name: &str) -> CompileResult<u32> {
        self.deref_cache.get(name).copied().ok_or_else(|| {
            CompileError::internal(format!("name '{name}' has no closure slot"))
        })
    }

    // === Emission ===

    fn push_byte(&mut self, byte: u8) {
        self.code.push(byte);
        self.positions.push(self.current_pos);
    }

    /// Emit an operand-free instruction.
    pub fn emit(&mut self, op: Opcode) {
        debug_assert!(!op.has_arg());
        self.push_byte(op as u8);
    }

    /// Emit an instruction with an operand, splitting into an
    /// `EXTENDED_ARG` prefix when the value exceeds 16 bits.
    pub fn emit_arg(&mut self, op: Opcode, arg: u32) {
        debug_assert!(op.has_arg());
        if arg > 0xFFFF {
            self.push_byte(Opcode::ExtendedArg as u8);
            self.push_byte((arg >> 16) as u8);
            self.push_byte((arg >> 24) as u8);
        }
        self.push_byte(op as u8);
        self.push_byte(arg as u8);
        self.push_byte((arg >> 8) as u8);
    }

    /// Intern `value` and emit `op` with its pool index.
    pub fn emit_const(&mut self, op: Opcode, value: Constant) {
        let index = self.add_const(value);
        self.emit_arg(op, index);
    }

    /// Intern `name` in the name table and emit `op` with its index.
    pub fn emit_name(&mut self, op: Opcode, name: &str) {
        let index = self.add_name(name);
        self.emit_arg(op, index);
    }

    /// Emit a fast-local instruction.
    pub fn emit_fast(&mut self, op: Opcode, name: &str) {
        let index = self.add_varname(name);
        self.emit_arg(op, index);
    }

    /// Emit a cell/free-variable instruction.
    pub fn emit_deref(&mut self, op: Opcode, name: &str) -> CompileResult<()> {
        let index = self.deref_index(name)?;
        self.emit_arg(op, index);
        Ok(())
    }

    // === Labels and jumps ===

    /// Create a new, unplaced label.
    pub fn new_label(&mut self) -> Label {
        let label = Label(self.labels.len() as u32);
        self.labels.push(None);
        label
    }

    /// Place a label at the current offset. Labels are write-once.
    pub fn place(&mut self, label: Label) -> CompileResult<()> {
        let slot = &mut self.labels[label.0 as usize];
        if slot.is_some() {
            return Err(CompileError::internal(format!(
                "label {} placed twice",
                label.0
            )));
        }
        *slot = Some(self.code.len() as u32);
        Ok(())
    }

    /// Emit a jump to `label`. Backward jumps (to an already-placed label)
    /// are resolved immediately and must use the absolute family; forward
    /// jumps record a fixup patched at finish time.
    pub fn emit_jump(&mut self, op: Opcode, label: Label) -> CompileResult<()> {
        let kind = op.jump_kind();
        debug_assert!(kind != JumpKind::None);
        match self.labels[label.0 as usize] {
            Some(target) => {
                if kind == JumpKind::Relative {
                    return Err(CompileError::internal(format!(
                        "backward relative jump ({}) to offset {target}",
                        op.name()
                    )));
                }
                if target > 0xFFFF {
                    return Err(CompileError::internal("function too large"));
                }
                self.push_byte(op as u8);
                self.push_byte(target as u8);
                self.push_byte((target >> 8) as u8);
            }
            None => {
                self.fixups.push(Fixup {
                    offset: self.code.len() as u32,
                    label,
                    absolute: kind == JumpKind::Absolute,
                });
                self.push_byte(op as u8);
                self.push_byte(0);
                self.push_byte(0);
            }
        }
        Ok(())
    }

    // === Finalization ===

    /// Patch fixups, verify stack depth, and encode the position table.
    pub fn finish(mut self) -> CompileResult<AssembledUnit> {
        if !self.docstring_set {
            return Err(CompileError::internal("docstring must occupy const slot 0"));
        }
        for fixup in &self.fixups {
            let target = self.labels[fixup.label.0 as usize].ok_or_else(|| {
                CompileError::internal(format!("label {} never placed", fixup.label.0))
            })?;
            let operand = if fixup.absolute {
                target
            } else {
                let after = fixup.offset + 3;
                if target < after {
                    return Err(CompileError::internal(format!(
                        "backward relative jump at offset {}",
                        fixup.offset
                    )));
                }
                target - after
            };
            if operand > 0xFFFF {
                return Err(CompileError::internal("function too large"));
            }
            let at = fixup.offset as usize + 1;
            self.code[at] = operand as u8;
            self.code[at + 1] = (operand >> 8) as u8;
        }

        let stacksize = compute_stacksize(&self.code)?;
        let line_table = encode_positions(&self.positions, self.first_lineno);

        Ok(AssembledUnit {
            code: self.code.into_boxed_slice(),
            consts: self.consts.into_boxed_slice(),
            names: self.names.into_boxed_slice(),
            varnames: self.varnames.into_boxed_slice(),
            stacksize,
            line_table: line_table.into_boxed_slice(),
        })
    }
}

/// Forward dataflow over the finished stream. `depth[0] = 0`; each reached
/// instruction propagates its depth along the fallthrough and jump edges.
/// Two paths reaching the same offset must agree exactly.
fn compute_stacksize(code: &[u8]) -> CompileResult<u32> {
    let mut depths: Vec<Option<i32>> = vec![None; code.len() + 1];
    if code.is_empty() {
        return Ok(0);
    }
    depths[0] = Some(0);
    let mut max_depth = 0i32;

    let mut offset = 0usize;
    while offset < code.len() {
        let start = offset;

        // Decode one logical instruction, folding EXTENDED_ARG prefixes.
        let mut extended = 0u32;
        let (op, arg) = loop {
            let byte = code[offset];
            let op = Opcode::from_byte(byte).ok_or_else(|| {
                CompileError::internal(format!("bad opcode {byte:#04x} at offset {offset}"))
            })?;
            offset += 1;
            if !op.has_arg() {
                break (op, 0u32);
            }
            if offset + 2 > code.len() {
                return Err(CompileError::internal("truncated instruction"));
            }
            let low = u16::from_le_bytes([code[offset], code[offset + 1]]) as u32;
            offset += 2;
            if op == Opcode::ExtendedArg {
                extended = low << 16;
                continue;
            }
            break (op, extended | low);
        };

        // Unreachable instructions (e.g. after an unconditional jump with
        // no inbound label) are skipped but still decoded for their length.
        let Some(depth) = depths[start] else {
            continue;
        };

        let fall_depth = depth + op.stack_effect(arg);
        if fall_depth < 0 {
            return Err(CompileError::internal(format!(
                "stack underflow at offset {start} ({})",
                op.name()
            )));
        }
        max_depth = max_depth.max(fall_depth);

        if op.jump_kind() != JumpKind::None && op != Opcode::ContinueLoop {
            let target = match op.jump_kind() {
                JumpKind::Absolute => arg as usize,
                _ => offset + arg as usize,
            };
            if target > code.len() {
                return Err(CompileError::internal(format!(
                    "jump target {target} out of range"
                )));
            }
            let jump_depth = depth + op.branch_effect(arg);
            if jump_depth < 0 {
                return Err(CompileError::internal(format!(
                    "stack underflow at jump from offset {start}"
                )));
            }
            max_depth = max_depth.max(jump_depth);
            match depths[target] {
                Some(existing) => {
                    if existing != jump_depth {
                        return Err(CompileError::internal(format!(
                            "inconsistent stack depth at offset {target}: {existing} vs {jump_depth}"
                        )));
                    }
                }
                None => {
                    if target < start {
                        // The forward walk already passed this offset, so no
                        // other path ever reached it.
                        return Err(CompileError::internal(format!(
                            "backward jump from {start} into unreachable offset {target}"
                        )));
                    }
                    depths[target] = Some(jump_depth);
                }
            }
        }

        if !op.is_terminator() {
            match depths[offset] {
                Some(existing) => {
                    if existing != fall_depth {
                        return Err(CompileError::internal(format!(
                            "inconsistent stack depth at offset {offset}: {existing} vs {fall_depth}"
                        )));
                    }
                }
                None => depths[offset] = Some(fall_depth),
            }
        }
    }

    Ok(max_depth as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Constant;

    fn assembler() -> Assembler {
        let mut asm = Assembler::new(1, Vec::new(), &[]);
        asm.set_docstring(Constant::None).unwrap();
        asm
    }

    #[test]
    fn test_constant_deduplication() {
        let mut asm = assembler();
        let a = asm.add_const(Constant::Int(5));
        let b = asm.add_const(Constant::Int(5));
        let c = asm.add_const(Constant::Int(6));
        assert_eq!(a, b);
        assert_ne!(a, c);
        // bool and int live in different buckets even when "equal"
        let t = asm.add_const(Constant::Bool(true));
        let one = asm.add_const(Constant::Int(1));
        assert_ne!(t, one);
        // NaN shares a slot with itself via its bit pattern
        let nan1 = asm.add_const(Constant::Float(f64::NAN));
        let nan2 = asm.add_const(Constant::Float(f64::NAN));
        assert_eq!(nan1, nan2);
    }

    #[test]
    fn test_docstring_slot_zero() {
        let mut asm = Assembler::new(1, Vec::new(), &[]);
        asm.set_docstring(Constant::Str("doc".to_owned())).unwrap();
        assert_eq!(asm.add_const(Constant::Str("doc".to_owned())), 0);
        assert!(asm.set_docstring(Constant::None).is_err());
    }

    #[test]
    fn test_forward_jump_fixup() {
        let mut asm = assembler();
        let orelse = asm.new_label();
        asm.emit_const(Opcode::LoadConst, Constant::Bool(true));
        asm.emit_jump(Opcode::JumpIfFalse, orelse).unwrap();
        asm.emit(Opcode::PopTop);
        asm.emit_const(Opcode::LoadConst, Constant::Int(1));
        asm.emit(Opcode::ReturnValue);
        asm.place(orelse).unwrap();
        asm.emit(Opcode::PopTop);
        asm.emit_const(Opcode::LoadConst, Constant::Int(2));
        asm.emit(Opcode::ReturnValue);
        let unit = asm.finish().unwrap();
        // JUMP_IF_FALSE at offset 3; target 11; operand = 11 - 6 = 5
        assert_eq!(unit.code[3], Opcode::JumpIfFalse as u8);
        assert_eq!(unit.code[4], 5);
        assert_eq!(unit.code[5], 0);
        assert_eq!(unit.stacksize, 1);
    }

    #[test]
    fn test_label_placed_twice() {
        let mut asm = assembler();
        let label = asm.new_label();
        asm.place(label).unwrap();
        assert!(asm.place(label).is_err());
    }

    #[test]
    fn test_unplaced_label_fails() {
        let mut asm = assembler();
        let label = asm.new_label();
        asm.emit_jump(Opcode::JumpForward, label).unwrap();
        let err = asm.finish().unwrap_err();
        assert!(err.message().contains("never placed"));
    }

    #[test]
    fn test_backward_relative_jump_rejected() {
        let mut asm = assembler();
        let label = asm.new_label();
        asm.place(label).unwrap();
        asm.emit_const(Opcode::LoadConst, Constant::None);
        asm.emit(Opcode::PopTop);
        assert!(asm.emit_jump(Opcode::JumpForward, label).is_err());
        assert!(asm.emit_jump(Opcode::JumpAbsolute, label).is_ok());
    }

    #[test]
    fn test_extended_arg_emission() {
        let mut asm = assembler();
        asm.emit_arg(Opcode::LoadConst, 0x1_0005);
        let unit_code = asm.code.clone();
        assert_eq!(unit_code[0], Opcode::ExtendedArg as u8);
        assert_eq!(u16::from_le_bytes([unit_code[1], unit_code[2]]), 1);
        assert_eq!(unit_code[3], Opcode::LoadConst as u8);
        assert_eq!(u16::from_le_bytes([unit_code[4], unit_code[5]]), 5);
    }

    #[test]
    fn test_depth_merge_mismatch_detected() {
        // Two paths reach the same offset with different depths.
        let mut asm = assembler();
        let merge = asm.new_label();
        asm.emit_const(Opcode::LoadConst, Constant::Bool(true));
        asm.emit_jump(Opcode::JumpIfFalse, merge).unwrap();
        asm.emit(Opcode::PopTop);
        asm.emit_const(Opcode::LoadConst, Constant::Int(1));
        asm.emit_const(Opcode::LoadConst, Constant::Int(2));
        asm.place(merge).unwrap();
        asm.emit(Opcode::ReturnValue);
        let err = asm.finish().unwrap_err();
        assert!(err.message().contains("inconsistent stack depth"));
    }

    #[test]
    fn test_depth_underflow_detected() {
        let mut asm = assembler();
        asm.emit(Opcode::PopTop);
        let err = asm.finish().unwrap_err();
        assert!(err.message().contains("underflow"));
    }

    #[test]
    fn test_function_too_large() {
        let mut asm = assembler();
        let far = asm.new_label();
        asm.emit_jump(Opcode::JumpForward, far).unwrap();
        for _ in 0..17_000 {
            asm.emit_const(Opcode::LoadConst, Constant::None);
            asm.emit(Opcode::PopTop);
        }
        asm.place(far).unwrap();
        asm.emit_const(Opcode::LoadConst, Constant::None);
        asm.emit(Opcode::ReturnValue);
        let err = asm.finish().unwrap_err();
        assert_eq!(err.message(), "function too large");
    }

    #[test]
    fn test_loop_back_edge_depth() {
        // while-style loop: back edge must agree with the recorded depth.
        let mut asm = assembler();
        let top = asm.new_label();
        let out = asm.new_label();
        asm.place(top).unwrap();
        asm.emit_const(Opcode::LoadConst, Constant::Bool(true));
        asm.emit_jump(Opcode::JumpIfFalse, out).unwrap();
        asm.emit(Opcode::PopTop);
        asm.emit_jump(Opcode::JumpAbsolute, top).unwrap();
        asm.place(out).unwrap();
        asm.emit(Opcode::PopTop);
        asm.emit_const(Opcode::LoadConst, Constant::None);
        asm.emit(Opcode::ReturnValue);
        let unit = asm.finish().unwrap();
        assert_eq!(unit.stacksize, 1);
    }
}
