//! Lexical scope model.
//!
//! One [`Scope`] exists per module, function, lambda, class body, or
//! generator expression. The first resolver pass records raw symbol flags
//! (used, bound, parameter, declared global); the second pass turns them
//! into a [`NameClass`] per name, promotes locals to cells, and threads
//! free variables through intermediate scopes. Scopes live in an arena
//! owned by the [`SymbolTable`] and are addressed by [`ScopeId`].

use std::borrow::Cow;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::ast::NodeId;
use crate::error::{CompileError, CompileResult};

/// Index of a scope in the table's arena.
pub type ScopeId = usize;

/// What kind of construct introduced the scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Module,
    Function,
    Lambda,
    Class,
    GenExpr,
}

impl ScopeKind {
    /// Function-like scopes use fast locals and can own cells.
    #[inline]
    pub fn is_function_like(self) -> bool {
        matches!(
            self,
            ScopeKind::Function | ScopeKind::Lambda | ScopeKind::GenExpr
        )
    }
}

// ============================================================================
// Symbol flags (first-pass facts about one name in one scope)
// ============================================================================

/// Raw per-name facts recorded by the declaration pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SymbolFlags(u16);

impl SymbolFlags {
    pub const NONE: SymbolFlags = SymbolFlags(0);
    /// The name is read somewhere in the scope.
    pub const USED: SymbolFlags = SymbolFlags(1 << 0);
    /// The name is assigned, deleted, or otherwise bound in the scope.
    pub const BOUND: SymbolFlags = SymbolFlags(1 << 1);
    /// The name is a formal parameter.
    pub const PARAM: SymbolFlags = SymbolFlags(1 << 2);
    /// A `global` statement names it in this scope.
    pub const DECLARED_GLOBAL: SymbolFlags = SymbolFlags(1 << 3);

    #[inline]
    pub const fn contains(self, other: SymbolFlags) -> bool {
        (self.0 & other.0) == other.0
    }

    #[inline]
    pub const fn union(self, other: SymbolFlags) -> SymbolFlags {
        SymbolFlags(self.0 | other.0)
    }
}

impl std::ops::BitOr for SymbolFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        self.union(rhs)
    }
}

impl std::ops::BitOrAssign for SymbolFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Final classification of one name in one scope, computed once by the
/// resolver and consulted at every reference site to pick the opcode family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameClass {
    /// Bound in this scope; a fast slot in optimized scopes.
    Local,
    /// Resolved to the module namespace (used, never bound anywhere).
    Global,
    /// Closed over from an enclosing function scope.
    Free,
    /// Local to this scope but boxed because a nested scope closes over it.
    Cell,
    /// Explicitly declared with a `global` statement.
    ReallyGlobal,
    /// No information; falls back to the default lookup chain.
    Unknown,
}

// ============================================================================
// Scope
// ============================================================================

/// One lexical scope.
#[derive(Debug)]
pub struct Scope {
    pub kind: ScopeKind,
    pub name: Arc<str>,
    pub parent: Option<ScopeId>,
    pub children: Vec<ScopeId>,

    /// Raw flags per (mangled) name.
    pub symbols: FxHashMap<Arc<str>, SymbolFlags>,
    /// Names in first-seen order; keeps classification deterministic.
    pub decl_order: Vec<Arc<str>>,
    /// Parameters in declaration order, including hidden tuple-pattern
    /// slots and the trailing `*args`/`**kwargs` names.
    pub params: Vec<Arc<str>>,

    /// Finalized classifications.
    pub classes: FxHashMap<Arc<str>, NameClass>,
    /// Fast-local slot order: parameters first, then bound locals.
    pub varnames: Vec<Arc<str>>,
    /// Locals boxed for nested scopes; parameter cells sort first.
    pub cellvars: Vec<Arc<str>>,
    /// Names closed over from (or threaded through toward) enclosing
    /// function scopes.
    pub freevars: Vec<Arc<str>>,

    /// True when the scope can observe free variables of an enclosing
    /// function. Class scopes only pass them through, never own cells.
    pub nested: bool,
    /// A `yield` appears directly in the scope body.
    pub is_generator: bool,
    /// Class name in effect for private-name mangling.
    pub private_prefix: Option<Arc<str>>,
}

impl Scope {
    pub fn new(kind: ScopeKind, name: &str, parent: Option<ScopeId>) -> Scope {
        Scope {
            kind,
            name: Arc::from(name),
            parent,
            children: Vec::new(),
            symbols: FxHashMap::default(),
            decl_order: Vec::new(),
            params: Vec::new(),
            classes: FxHashMap::default(),
            varnames: Vec::new(),
            cellvars: Vec::new(),
            freevars: Vec::new(),
            nested: false,
            is_generator: false,
            private_prefix: None,
        }
    }

    /// True if locals use fast slots and never fall back to a namespace
    /// dict. Module and class bodies are unoptimized.
    #[inline]
    pub fn is_optimized(&self) -> bool {
        self.kind.is_function_like()
    }

    /// Finalized classification of a (mangled) name.
    pub fn class_of(&self, name: &str) -> NameClass {
        self.classes.get(name).copied().unwrap_or(NameClass::Unknown)
    }

    /// Record flags for a name, keeping first-seen order.
    pub fn note(&mut self, name: Arc<str>, flags: SymbolFlags) {
        match self.symbols.get_mut(&name) {
            Some(existing) => *existing |= flags,
            None => {
                self.decl_order.push(Arc::clone(&name));
                self.symbols.insert(name, flags);
            }
        }
    }

    /// Closure slot order consumed by `LOAD_DEREF`/`LOAD_CLOSURE`:
    /// cellvars first, then freevars.
    pub fn deref_names(&self) -> Vec<Arc<str>> {
        let mut names = self.cellvars.clone();
        names.extend(self.freevars.iter().cloned());
        names
    }
}

// ============================================================================
// Symbol table
// ============================================================================

/// Arena of scopes plus the mapping from scope-introducing AST nodes.
#[derive(Debug)]
pub struct SymbolTable {
    pub(crate) scopes: Vec<Scope>,
    pub(crate) by_node: FxHashMap<NodeId, ScopeId>,
    root: ScopeId,
}

impl SymbolTable {
    pub(crate) fn new() -> SymbolTable {
        SymbolTable {
            scopes: Vec::new(),
            by_node: FxHashMap::default(),
            root: 0,
        }
    }

    /// The module scope.
    #[inline]
    pub fn root(&self) -> ScopeId {
        self.root
    }

    #[inline]
    pub fn scope(&self, id: ScopeId) -> &Scope {
        &self.scopes[id]
    }

    #[inline]
    pub(crate) fn scope_mut(&mut self, id: ScopeId) -> &mut Scope {
        &mut self.scopes[id]
    }

    pub(crate) fn push_scope(&mut self, scope: Scope) -> ScopeId {
        let id = self.scopes.len();
        if let Some(parent) = scope.parent {
            self.scopes[parent].children.push(id);
        }
        self.scopes.push(scope);
        id
    }

    /// Scope introduced by an AST node.
    pub fn scope_for_node(&self, node: NodeId) -> CompileResult<ScopeId> {
        self.by_node.get(&node).copied().ok_or_else(|| {
            CompileError::internal(format!("no scope recorded for node {node}"))
        })
    }
}

// ============================================================================
// Name mangling
// ============================================================================

/// Rewrite `__name` to `_Class__name` when a class prefix is in effect.
///
/// Applies to identifiers with two or more leading underscores and at most
/// one trailing underscore. Leading underscores of the class name are
/// stripped; a class named entirely of underscores disables mangling.
pub fn mangle<'a>(private: Option<&str>, name: &'a str) -> Cow<'a, str> {
    let Some(class_name) = private else {
        return Cow::Borrowed(name);
    };
    if !name.starts_with("__") || name.ends_with("__") || name.contains('.') {
        return Cow::Borrowed(name);
    }
    let stripped = class_name.trim_start_matches('_');
    if stripped.is_empty() {
        return Cow::Borrowed(name);
    }
    Cow::Owned(format!("_{stripped}{name}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_flags() {
        let flags = SymbolFlags::USED | SymbolFlags::BOUND;
        assert!(flags.contains(SymbolFlags::USED));
        assert!(flags.contains(SymbolFlags::BOUND));
        assert!(!flags.contains(SymbolFlags::PARAM));
    }

    #[test]
    fn test_mangle() {
        assert_eq!(mangle(Some("Widget"), "__x"), "_Widget__x");
        assert_eq!(mangle(Some("_Widget"), "__x"), "_Widget__x");
        assert_eq!(mangle(Some("Widget"), "__x_"), "_Widget__x_");
        // dunder names and public names pass through
        assert_eq!(mangle(Some("Widget"), "__init__"), "__init__");
        assert_eq!(mangle(Some("Widget"), "x"), "x");
        assert_eq!(mangle(Some("Widget"), "_x"), "_x");
        // all-underscore class names disable mangling
        assert_eq!(mangle(Some("___"), "__x"), "__x");
        assert_eq!(mangle(None, "__x"), "__x");
    }

    #[test]
    fn test_note_keeps_first_seen_order() {
        let mut scope = Scope::new(ScopeKind::Function, "f", None);
        scope.note(Arc::from("b"), SymbolFlags::BOUND);
        scope.note(Arc::from("a"), SymbolFlags::USED);
        scope.note(Arc::from("b"), SymbolFlags::USED);
        assert_eq!(scope.decl_order.len(), 2);
        assert_eq!(&*scope.decl_order[0], "b");
        let flags = scope.symbols[&Arc::<str>::from("b")];
        assert!(flags.contains(SymbolFlags::BOUND | SymbolFlags::USED));
    }
}
