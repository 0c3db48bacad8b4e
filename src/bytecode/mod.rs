//! Bytecode backend: opcode definitions, the flow-graph assembler, and the
//! finished code objects with their on-disk form.

pub mod assembler;
pub mod code_object;
pub mod opcode;

pub use assembler::{AssembledUnit, Assembler, Label};
pub use code_object::{
    decode_positions, disassemble, dump_cache, encode_positions, load_cache, CodeFlags,
    CodeObject, Constant, MarshalError, SourcePosition, CACHE_MAGIC,
};
pub use opcode::{cmp, JumpKind, Opcode};
