//! # Opal Compiler
//!
//! AST-to-bytecode backend for the Opal language. The parser hands over a
//! [`Module`](ast::Module); [`compile_module`] runs the full pipeline and
//! returns the module's [`CodeObject`](bytecode::CodeObject):
//!
//! 1. future-import scan ([`future::scan`])
//! 2. constant folding ([`fold::fold_module`])
//! 3. two-pass scope resolution ([`scope::resolve`])
//! 4. code generation ([`compiler::compile`])
//!
//! Compilation is deterministic: the same module and filename always produce
//! byte-identical output, including the serialized cache form.

#![deny(unsafe_op_in_unsafe_fn)]

pub mod ast;
pub mod bytecode;
pub mod compiler;
pub mod error;
pub mod fold;
pub mod future;
pub mod scope;

mod exception_compiler;

use std::sync::Arc;

pub use bytecode::{disassemble, dump_cache, load_cache, CodeFlags, CodeObject, Constant};
pub use error::{CompileError, CompileResult};
pub use future::FutureFlags;

/// Compile a parsed module into its code object.
pub fn compile_module(module: ast::Module, filename: &str) -> CompileResult<Arc<CodeObject>> {
    let filename: Arc<str> = Arc::from(filename);
    let futures = future::scan(&module, &filename)?;
    let module = fold::fold_module(module, &futures);
    let table = scope::resolve(&module, &filename)?;
    compiler::compile(&module, &filename, futures, &table)
}
