//! Name resolution.
//!
//! Submodules: [`symbol`] holds the scope arena and classification model,
//! [`visitor`] runs the two-pass resolver over a module.

pub mod symbol;
pub mod visitor;

pub use symbol::{mangle, NameClass, Scope, ScopeId, ScopeKind, SymbolFlags, SymbolTable};
pub use visitor::resolve;
