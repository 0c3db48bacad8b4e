//! Two-phase scope resolution.
//!
//! Phase one walks the AST top-down, recording per-scope symbol flags:
//! assignment targets, `for` targets, imports, `except` targets, and
//! function/class names bind; bare reads use; `global` statements globalize.
//! Phase two runs bottom-up: each finished child scope proposes its
//! unresolved reads to its parent. A proposal resolved against a binding in
//! an enclosing function promotes that binding to a cell and classifies the
//! whole proposing chain as free; one landing on an explicit `global`
//! reclassifies the chain as global; anything surviving to the module is
//! demoted to an implicit global. Class scopes never own cells and are
//! skipped as binding sites, but thread free variables through so class
//! bodies can build closures for their methods.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::ast::{
    Comprehension, Expr, ExprKind, Module, Param, Params, Span, Stmt, StmtKind,
};
use crate::error::{CompileError, CompileResult};

use super::symbol::{mangle, NameClass, Scope, ScopeId, ScopeKind, SymbolFlags, SymbolTable};

/// Resolve every name in the module, returning the finished scope table.
pub fn resolve(module: &Module, filename: &Arc<str>) -> CompileResult<SymbolTable> {
    let mut builder = ScopeBuilder {
        table: SymbolTable::new(),
        stack: Vec::new(),
        filename: Arc::clone(filename),
    };
    let root = builder.enter(ScopeKind::Module, "<module>", Some(module.node));
    builder.visit_stmts(&module.body)?;
    builder.leave();
    builder.finalize(root)?;

    let mut table = builder.table;
    for scope in &mut table.scopes {
        scope.freevars.sort();
    }
    Ok(table)
}

struct ScopeBuilder {
    table: SymbolTable,
    stack: Vec<ScopeId>,
    filename: Arc<str>,
}

impl ScopeBuilder {
    fn current(&self) -> ScopeId {
        *self.stack.last().unwrap_or(&0)
    }

    fn enter(&mut self, kind: ScopeKind, name: &str, node: Option<u32>) -> ScopeId {
        let parent = self.stack.last().copied();
        let mut scope = Scope::new(kind, name, parent);
        if let Some(parent_id) = parent {
            let parent_scope = self.table.scope(parent_id);
            scope.nested = parent_scope.kind.is_function_like() || parent_scope.nested;
            scope.private_prefix = if kind == ScopeKind::Class {
                Some(Arc::clone(&scope.name))
            } else {
                parent_scope.private_prefix.clone()
            };
        }
        if kind == ScopeKind::GenExpr {
            scope.is_generator = true;
        }
        let id = self.table.push_scope(scope);
        if let Some(node) = node {
            self.table.by_node.insert(node, id);
        }
        self.stack.push(id);
        id
    }

    fn leave(&mut self) {
        self.stack.pop();
    }

    fn mangled(&self, name: &str) -> Arc<str> {
        let scope = self.table.scope(self.current());
        Arc::from(mangle(scope.private_prefix.as_deref(), name))
    }

    // === Symbol recording ===

    fn note_use(&mut self, name: &str) {
        let name = self.mangled(name);
        let id = self.current();
        self.table.scope_mut(id).note(name, SymbolFlags::USED);
    }

    fn note_bound(&mut self, name: &str) {
        let name = self.mangled(name);
        let id = self.current();
        self.table.scope_mut(id).note(name, SymbolFlags::BOUND);
    }

    fn note_param(&mut self, name: Arc<str>, span: Span) -> CompileResult<()> {
        let id = self.current();
        let scope = self.table.scope_mut(id);
        if let Some(flags) = scope.symbols.get(&name) {
            if flags.contains(SymbolFlags::PARAM) {
                return Err(CompileError::syntax(
                    format!("duplicate argument '{name}' in function definition"),
                    &self.filename,
                    span,
                ));
            }
        }
        scope.note(Arc::clone(&name), SymbolFlags::PARAM | SymbolFlags::BOUND);
        scope.params.push(name);
        Ok(())
    }

    fn note_global(&mut self, name: &str, span: Span) -> CompileResult<()> {
        let name = self.mangled(name);
        let id = self.current();
        let scope = self.table.scope_mut(id);
        if let Some(flags) = scope.symbols.get(&name) {
            if flags.contains(SymbolFlags::PARAM) {
                return Err(CompileError::syntax(
                    format!("name '{name}' is local and global"),
                    &self.filename,
                    span,
                ));
            }
        }
        // A `global` appearing after the name was already used or bound in
        // this scope is accepted; the declaration wins for the whole scope.
        scope.note(name, SymbolFlags::DECLARED_GLOBAL);
        Ok(())
    }

    // === Phase one: declaration walk ===

    fn visit_stmts(&mut self, stmts: &[Stmt]) -> CompileResult<()> {
        for stmt in stmts {
            self.visit_stmt(stmt)?;
        }
        Ok(())
    }

    fn visit_stmt(&mut self, stmt: &Stmt) -> CompileResult<()> {
        match &stmt.kind {
            StmtKind::FunctionDef {
                name,
                params,
                defaults,
                decorators,
                body,
                node,
            } => {
                self.visit_exprs(decorators)?;
                self.visit_exprs(defaults)?;
                self.note_bound(name);
                self.enter(ScopeKind::Function, name, Some(*node));
                self.define_params(params, stmt.span)?;
                self.visit_stmts(body)?;
                self.leave();
            }
            StmtKind::ClassDef {
                name,
                bases,
                decorators,
                body,
                node,
            } => {
                self.visit_exprs(decorators)?;
                self.visit_exprs(bases)?;
                self.note_bound(name);
                self.enter(ScopeKind::Class, name, Some(*node));
                self.visit_stmts(body)?;
                self.leave();
            }
            StmtKind::Return(value) => {
                if let Some(value) = value {
                    self.visit_expr(value)?;
                }
            }
            StmtKind::Delete(targets) => {
                for target in targets {
                    self.visit_target(target)?;
                }
            }
            StmtKind::Assign { targets, value } => {
                self.visit_expr(value)?;
                for target in targets {
                    self.visit_target(target)?;
                }
            }
            StmtKind::AugAssign { target, value, .. } => {
                if let ExprKind::Name(name) = &target.kind {
                    self.note_use(name);
                    self.note_bound(name);
                } else {
                    self.visit_target(target)?;
                }
                self.visit_expr(value)?;
            }
            StmtKind::For {
                target,
                iter,
                body,
                orelse,
            } => {
                self.visit_expr(iter)?;
                self.visit_target(target)?;
                self.visit_stmts(body)?;
                self.visit_stmts(orelse)?;
            }
            StmtKind::While { test, body, orelse } => {
                self.visit_expr(test)?;
                self.visit_stmts(body)?;
                self.visit_stmts(orelse)?;
            }
            StmtKind::If { test, body, orelse } => {
                self.visit_expr(test)?;
                self.visit_stmts(body)?;
                self.visit_stmts(orelse)?;
            }
            StmtKind::With {
                context,
                target,
                body,
            } => {
                self.visit_expr(context)?;
                if let Some(target) = target {
                    self.visit_target(target)?;
                }
                self.visit_stmts(body)?;
            }
            StmtKind::Raise {
                exc,
                value,
                traceback,
            } => {
                for part in [exc, value, traceback].into_iter().flatten() {
                    self.visit_expr(part)?;
                }
            }
            StmtKind::TryExcept {
                body,
                handlers,
                orelse,
            } => {
                self.visit_stmts(body)?;
                for handler in handlers {
                    if let Some(typ) = &handler.typ {
                        self.visit_expr(typ)?;
                    }
                    if let Some(target) = &handler.target {
                        self.visit_target(target)?;
                    }
                    self.visit_stmts(&handler.body)?;
                }
                self.visit_stmts(orelse)?;
            }
            StmtKind::TryFinally { body, finalbody } => {
                self.visit_stmts(body)?;
                self.visit_stmts(finalbody)?;
            }
            StmtKind::Assert { test, msg } => {
                self.visit_expr(test)?;
                if let Some(msg) = msg {
                    self.visit_expr(msg)?;
                }
            }
            StmtKind::Import(aliases) => {
                for alias in aliases {
                    let binding = match &alias.asname {
                        Some(asname) => asname.as_str(),
                        None => alias.name.split('.').next().unwrap_or(&alias.name),
                    };
                    self.note_bound(binding);
                }
            }
            StmtKind::ImportFrom { names, .. } => {
                for alias in names {
                    if alias.name == "*" {
                        if self.table.scope(self.current()).kind != ScopeKind::Module {
                            return Err(CompileError::syntax(
                                "import * only allowed at module level",
                                &self.filename,
                                stmt.span,
                            ));
                        }
                        continue;
                    }
                    let binding = alias.asname.as_deref().unwrap_or(&alias.name);
                    self.note_bound(binding);
                }
            }
            StmtKind::Global(names) => {
                for name in names {
                    self.note_global(name, stmt.span)?;
                }
            }
            StmtKind::Discard(expr) => self.visit_expr(expr)?,
            StmtKind::Pass | StmtKind::Break | StmtKind::Continue => {}
        }
        Ok(())
    }

    fn visit_exprs(&mut self, exprs: &[Expr]) -> CompileResult<()> {
        for expr in exprs {
            self.visit_expr(expr)?;
        }
        Ok(())
    }

    fn visit_expr(&mut self, expr: &Expr) -> CompileResult<()> {
        match &expr.kind {
            ExprKind::Const(_) => {}
            ExprKind::Name(name) => self.note_use(name),
            ExprKind::Tuple(items) | ExprKind::List(items) => self.visit_exprs(items)?,
            ExprKind::Dict(pairs) => {
                for (key, value) in pairs {
                    self.visit_expr(key)?;
                    self.visit_expr(value)?;
                }
            }
            ExprKind::Binary { left, right, .. } => {
                self.visit_expr(left)?;
                self.visit_expr(right)?;
            }
            ExprKind::Unary { operand, .. } => self.visit_expr(operand)?,
            ExprKind::Bool { values, .. } => self.visit_exprs(values)?,
            ExprKind::Compare {
                left, comparators, ..
            } => {
                self.visit_expr(left)?;
                self.visit_exprs(comparators)?;
            }
            ExprKind::Lambda {
                params,
                defaults,
                body,
                node,
            } => {
                self.visit_exprs(defaults)?;
                self.enter(ScopeKind::Lambda, "<lambda>", Some(*node));
                self.define_params(params, expr.span)?;
                self.visit_expr(body)?;
                self.leave();
            }
            ExprKind::IfExp { test, body, orelse } => {
                self.visit_expr(test)?;
                self.visit_expr(body)?;
                self.visit_expr(orelse)?;
            }
            ExprKind::Call {
                func,
                args,
                keywords,
                star_args,
                kw_args,
            } => {
                self.visit_expr(func)?;
                self.visit_exprs(args)?;
                for (_, value) in keywords {
                    self.visit_expr(value)?;
                }
                if let Some(star) = star_args {
                    self.visit_expr(star)?;
                }
                if let Some(kw) = kw_args {
                    self.visit_expr(kw)?;
                }
            }
            ExprKind::Attribute { value, .. } => self.visit_expr(value)?,
            ExprKind::Subscript { value, index } => {
                self.visit_expr(value)?;
                self.visit_expr(index)?;
            }
            ExprKind::Slice { lower, upper, step } => {
                for part in [lower, upper, step].into_iter().flatten() {
                    self.visit_expr(part)?;
                }
            }
            ExprKind::ListComp {
                element,
                generators,
            } => {
                // list comprehensions bind their targets in the enclosing
                // scope; only generator expressions introduce a new one
                self.visit_comprehensions(generators)?;
                self.visit_expr(element)?;
            }
            ExprKind::GenExp {
                element,
                generators,
                node,
            } => {
                // the outermost iterable is evaluated eagerly by the caller
                self.visit_expr(&generators[0].iter)?;
                self.enter(ScopeKind::GenExpr, "<genexpr>", Some(*node));
                self.note_param(Arc::from(".0"), expr.span)?;
                self.visit_target(&generators[0].target)?;
                self.visit_exprs(&generators[0].ifs)?;
                for gen in &generators[1..] {
                    self.visit_expr(&gen.iter)?;
                    self.visit_target(&gen.target)?;
                    self.visit_exprs(&gen.ifs)?;
                }
                self.visit_expr(element)?;
                self.leave();
            }
            ExprKind::Yield(value) => {
                let id = self.current();
                let scope = self.table.scope_mut(id);
                if scope.kind.is_function_like() {
                    scope.is_generator = true;
                } else {
                    return Err(CompileError::syntax(
                        "'yield' outside function",
                        &self.filename,
                        expr.span,
                    ));
                }
                if let Some(value) = value {
                    self.visit_expr(value)?;
                }
            }
        }
        Ok(())
    }

    fn visit_comprehensions(&mut self, generators: &[Comprehension]) -> CompileResult<()> {
        for gen in generators {
            self.visit_expr(&gen.iter)?;
            self.visit_target(&gen.target)?;
            self.visit_exprs(&gen.ifs)?;
        }
        Ok(())
    }

    /// Record an assignment or deletion target. Invalid target kinds are
    /// reported later by the code generator; here their subexpressions are
    /// still walked as ordinary reads.
    fn visit_target(&mut self, target: &Expr) -> CompileResult<()> {
        match &target.kind {
            ExprKind::Name(name) => self.note_bound(name),
            ExprKind::Tuple(items) | ExprKind::List(items) => {
                for item in items {
                    self.visit_target(item)?;
                }
            }
            ExprKind::Attribute { value, .. } => self.visit_expr(value)?,
            ExprKind::Subscript { value, index } => {
                self.visit_expr(value)?;
                self.visit_expr(index)?;
            }
            _ => self.visit_expr(target)?,
        }
        Ok(())
    }

    fn define_params(&mut self, params: &Params, span: Span) -> CompileResult<()> {
        for (position, param) in params.params.iter().enumerate() {
            match param {
                Param::Name(name) => {
                    let name = self.mangled(name);
                    self.note_param(name, span)?;
                }
                Param::Tuple(inner) => {
                    self.note_param(Arc::from(format!(".{position}")), span)?;
                    self.define_tuple_params(inner, span)?;
                }
            }
        }
        if let Some(vararg) = &params.vararg {
            let name = self.mangled(vararg);
            self.note_param(name, span)?;
        }
        if let Some(kwarg) = &params.kwarg {
            let name = self.mangled(kwarg);
            self.note_param(name, span)?;
        }
        Ok(())
    }

    /// Names inside a tuple pattern are ordinary locals bound at entry, but
    /// still participate in the duplicate-argument check.
    fn define_tuple_params(&mut self, inner: &[Param], span: Span) -> CompileResult<()> {
        for param in inner {
            match param {
                Param::Name(name) => {
                    let name = self.mangled(name);
                    let id = self.current();
                    if let Some(flags) = self.table.scope(id).symbols.get(&name) {
                        if flags.contains(SymbolFlags::PARAM) {
                            return Err(CompileError::syntax(
                                format!("duplicate argument '{name}' in function definition"),
                                &self.filename,
                                span,
                            ));
                        }
                    }
                    self.table
                        .scope_mut(id)
                        .note(name, SymbolFlags::PARAM | SymbolFlags::BOUND);
                }
                Param::Tuple(nested) => self.define_tuple_params(nested, span)?,
            }
        }
        Ok(())
    }

    // === Phase two: bottom-up classification ===

    /// Classify this scope and return the free-variable proposals that must
    /// be resolved by an ancestor. Each proposal carries every scope in the
    /// chain below that guessed "free" for the name.
    fn finalize(&mut self, id: ScopeId) -> CompileResult<FxHashMap<Arc<str>, Vec<ScopeId>>> {
        let children = self.table.scope(id).children.clone();
        let mut proposals: FxHashMap<Arc<str>, Vec<ScopeId>> = FxHashMap::default();
        for child in children {
            for (name, mut chain) in self.finalize(child)? {
                proposals.entry(name).or_default().append(&mut chain);
            }
        }

        // Classify names recorded directly in this scope.
        let decl_order = self.table.scope(id).decl_order.clone();
        for name in &decl_order {
            let flags = self.table.scope(id).symbols[name];
            let class = if flags.contains(SymbolFlags::DECLARED_GLOBAL) {
                NameClass::ReallyGlobal
            } else if flags.contains(SymbolFlags::BOUND) {
                NameClass::Local
            } else if flags.contains(SymbolFlags::USED) {
                let chain = proposals.entry(Arc::clone(name)).or_default();
                if !chain.contains(&id) {
                    chain.push(id);
                }
                continue;
            } else {
                continue;
            };
            self.table
                .scope_mut(id)
                .classes
                .insert(Arc::clone(name), class);
        }

        // Resolve the children's (and our own) proposals.
        let kind = self.table.scope(id).kind;
        let mut entries: Vec<(Arc<str>, Vec<ScopeId>)> = proposals.into_iter().collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let mut forwarded: FxHashMap<Arc<str>, Vec<ScopeId>> = FxHashMap::default();
        for (name, mut chain) in entries {
            let own = self.table.scope(id).classes.get(&name).copied();

            if kind == ScopeKind::Module {
                // Nothing bound the name anywhere: demote to implicit global
                // in every scope that guessed free. The module's own reads
                // stay Unknown and use the default lookup chain.
                for scope_id in chain {
                    if scope_id != id {
                        self.table
                            .scope_mut(scope_id)
                            .classes
                            .entry(Arc::clone(&name))
                            .or_insert(NameClass::Global);
                    }
                }
                continue;
            }

            match own {
                // force_global: an explicit `global` here reclassifies the
                // whole subtree that tentatively guessed free.
                Some(NameClass::ReallyGlobal) => {
                    for scope_id in chain {
                        if scope_id != id {
                            self.table
                                .scope_mut(scope_id)
                                .classes
                                .entry(Arc::clone(&name))
                                .or_insert(NameClass::Global);
                        }
                    }
                }
                // Bound in this function scope: box it into a cell and mark
                // the entire proposing chain free.
                Some(NameClass::Local) | Some(NameClass::Cell) if kind.is_function_like() => {
                    self.table
                        .scope_mut(id)
                        .classes
                        .insert(Arc::clone(&name), NameClass::Cell);
                    for scope_id in chain {
                        if scope_id == id {
                            continue;
                        }
                        let scope = self.table.scope_mut(scope_id);
                        scope.freevars.push(Arc::clone(&name));
                        scope
                            .classes
                            .entry(Arc::clone(&name))
                            .or_insert(NameClass::Free);
                    }
                }
                // Not resolvable here (or a class body, which is skipped as
                // a binding site): thread through and keep climbing.
                _ => {
                    if !chain.contains(&id) {
                        chain.push(id);
                    }
                    forwarded.insert(name, chain);
                }
            }
        }

        self.build_variable_tables(id);
        Ok(forwarded)
    }

    /// Fill `varnames` and `cellvars` once classification is complete.
    fn build_variable_tables(&mut self, id: ScopeId) {
        let scope = self.table.scope(id);

        let varnames = if scope.is_optimized() {
            let mut varnames = scope.params.clone();
            for name in &scope.decl_order {
                if scope.params.contains(name) {
                    continue;
                }
                if scope.class_of(name) == NameClass::Local {
                    varnames.push(Arc::clone(name));
                }
            }
            varnames
        } else {
            Vec::new()
        };

        // Parameter cells keep parameter order; the rest sort by name.
        let mut cellvars: Vec<Arc<str>> = scope
            .params
            .iter()
            .filter(|name| scope.class_of(name) == NameClass::Cell)
            .cloned()
            .collect();
        let mut rest: Vec<Arc<str>> = scope
            .decl_order
            .iter()
            .filter(|name| {
                scope.class_of(name) == NameClass::Cell && !scope.params.contains(*name)
            })
            .cloned()
            .collect();
        rest.sort();
        cellvars.extend(rest);

        let scope = self.table.scope_mut(id);
        scope.varnames = varnames;
        scope.cellvars = cellvars;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::*;

    fn span() -> Span {
        Span::at(1, 0)
    }

    fn name(n: &str) -> Expr {
        Expr {
            kind: ExprKind::Name(n.to_owned()),
            span: span(),
        }
    }

    fn ret(value: Expr) -> Stmt {
        Stmt {
            kind: StmtKind::Return(Some(value)),
            span: span(),
        }
    }

    fn assign(target: &str, value: Expr) -> Stmt {
        Stmt {
            kind: StmtKind::Assign {
                targets: vec![name(target)],
                value,
            },
            span: span(),
        }
    }

    fn func(fname: &str, params: &[&str], body: Vec<Stmt>, node: NodeId) -> Stmt {
        Stmt {
            kind: StmtKind::FunctionDef {
                name: fname.to_owned(),
                params: Params {
                    params: params.iter().map(|p| Param::Name((*p).to_owned())).collect(),
                    vararg: None,
                    kwarg: None,
                },
                defaults: vec![],
                decorators: vec![],
                body,
                node,
            },
            span: span(),
        }
    }

    fn module(body: Vec<Stmt>) -> Module {
        Module { body, node: 0 }
    }

    fn filename() -> Arc<str> {
        Arc::from("test.opal")
    }

    #[test]
    fn test_simple_locals() {
        let m = module(vec![func(
            "f",
            &["a"],
            vec![assign("b", name("a")), ret(name("b"))],
            1,
        )]);
        let table = resolve(&m, &filename()).unwrap();
        let f = table.scope(table.scope_for_node(1).unwrap());
        assert_eq!(f.class_of("a"), NameClass::Local);
        assert_eq!(f.class_of("b"), NameClass::Local);
        assert_eq!(f.varnames.len(), 2);
        assert_eq!(&*f.varnames[0], "a");
        assert!(f.cellvars.is_empty());
    }

    #[test]
    fn test_closure_cell_and_free() {
        // def f(x):
        //     def g(): return x
        let m = module(vec![func(
            "f",
            &["x"],
            vec![func("g", &[], vec![ret(name("x"))], 2)],
            1,
        )]);
        let table = resolve(&m, &filename()).unwrap();
        let f = table.scope(table.scope_for_node(1).unwrap());
        let g = table.scope(table.scope_for_node(2).unwrap());
        assert_eq!(f.class_of("x"), NameClass::Cell);
        assert_eq!(f.cellvars.len(), 1);
        assert_eq!(&*f.cellvars[0], "x");
        assert_eq!(g.class_of("x"), NameClass::Free);
        assert_eq!(&*g.freevars[0], "x");
        // parameter cells stay in varnames too
        assert!(f.varnames.iter().any(|v| &**v == "x"));
    }

    #[test]
    fn test_unbound_use_demotes_to_global() {
        let m = module(vec![func("f", &[], vec![ret(name("len"))], 1)]);
        let table = resolve(&m, &filename()).unwrap();
        let f = table.scope(table.scope_for_node(1).unwrap());
        assert_eq!(f.class_of("len"), NameClass::Global);
        assert!(f.freevars.is_empty());
    }

    #[test]
    fn test_explicit_global() {
        let m = module(vec![func(
            "f",
            &[],
            vec![
                Stmt {
                    kind: StmtKind::Global(vec!["counter".to_owned()]),
                    span: span(),
                },
                assign("counter", name("x")),
            ],
            1,
        )]);
        let table = resolve(&m, &filename()).unwrap();
        let f = table.scope(table.scope_for_node(1).unwrap());
        assert_eq!(f.class_of("counter"), NameClass::ReallyGlobal);
        assert!(!f.varnames.iter().any(|v| &**v == "counter"));
    }

    #[test]
    fn test_global_param_conflict_is_error() {
        let m = module(vec![func(
            "f",
            &["x"],
            vec![Stmt {
                kind: StmtKind::Global(vec!["x".to_owned()]),
                span: span(),
            }],
            1,
        )]);
        let err = resolve(&m, &filename()).unwrap_err();
        assert_eq!(err.message(), "name 'x' is local and global");
    }

    #[test]
    fn test_force_global_reclassifies_subtree() {
        // def f():
        //     global x
        //     x = 1
        //     def g(): return x
        let m = module(vec![func(
            "f",
            &[],
            vec![
                Stmt {
                    kind: StmtKind::Global(vec!["x".to_owned()]),
                    span: span(),
                },
                assign("x", name("one")),
                func("g", &[], vec![ret(name("x"))], 2),
            ],
            1,
        )]);
        let table = resolve(&m, &filename()).unwrap();
        let f = table.scope(table.scope_for_node(1).unwrap());
        let g = table.scope(table.scope_for_node(2).unwrap());
        assert_eq!(f.class_of("x"), NameClass::ReallyGlobal);
        assert_eq!(g.class_of("x"), NameClass::Global);
        assert!(g.freevars.is_empty());
        assert!(f.cellvars.is_empty());
    }

    #[test]
    fn test_class_passes_frees_through() {
        // def f(x):
        //     class C:
        //         def m(self): return x
        let m = module(vec![func(
            "f",
            &["x"],
            vec![Stmt {
                kind: StmtKind::ClassDef {
                    name: "C".to_owned(),
                    bases: vec![],
                    decorators: vec![],
                    body: vec![func("m", &["self"], vec![ret(name("x"))], 3)],
                    node: 2,
                },
                span: span(),
            }],
            1,
        )]);
        let table = resolve(&m, &filename()).unwrap();
        let f = table.scope(table.scope_for_node(1).unwrap());
        let c = table.scope(table.scope_for_node(2).unwrap());
        let m_scope = table.scope(table.scope_for_node(3).unwrap());
        assert_eq!(f.class_of("x"), NameClass::Cell);
        // the class body threads the free variable through for MAKE_CLOSURE
        assert_eq!(c.freevars.len(), 1);
        assert_eq!(&*c.freevars[0], "x");
        assert!(c.cellvars.is_empty());
        assert_eq!(m_scope.class_of("x"), NameClass::Free);
    }

    #[test]
    fn test_duplicate_argument_error() {
        let m = module(vec![func("f", &["a", "a"], vec![], 1)]);
        let err = resolve(&m, &filename()).unwrap_err();
        assert!(err.message().contains("duplicate argument 'a'"));
    }

    #[test]
    fn test_class_private_name_mangling() {
        // class C:
        //     def m(self): self.__x = 1  -- attribute mangling is codegen's
        //     __y = 2
        let m = module(vec![Stmt {
            kind: StmtKind::ClassDef {
                name: "C".to_owned(),
                bases: vec![],
                decorators: vec![],
                body: vec![assign("__y", name("two"))],
                node: 1,
            },
            span: span(),
        }]);
        let table = resolve(&m, &filename()).unwrap();
        let c = table.scope(table.scope_for_node(1).unwrap());
        assert_eq!(c.class_of("_C__y"), NameClass::Local);
        assert_eq!(c.class_of("__y"), NameClass::Unknown);
    }

    #[test]
    fn test_genexpr_scope_is_generator_with_hidden_param() {
        let m = module(vec![Stmt {
            kind: StmtKind::Discard(Expr {
                kind: ExprKind::GenExp {
                    element: Box::new(name("i")),
                    generators: vec![Comprehension {
                        target: name("i"),
                        iter: name("items"),
                        ifs: vec![],
                    }],
                    node: 1,
                },
                span: span(),
            }),
            span: span(),
        }]);
        let table = resolve(&m, &filename()).unwrap();
        let gen = table.scope(table.scope_for_node(1).unwrap());
        assert!(gen.is_generator);
        assert_eq!(gen.kind, ScopeKind::GenExpr);
        assert_eq!(&*gen.params[0], ".0");
        assert_eq!(gen.class_of("i"), NameClass::Local);
    }

    #[test]
    fn test_import_star_in_function_rejected() {
        let m = module(vec![func(
            "f",
            &[],
            vec![Stmt {
                kind: StmtKind::ImportFrom {
                    module: "os".to_owned(),
                    names: vec![ImportAlias {
                        name: "*".to_owned(),
                        asname: None,
                    }],
                    level: 0,
                },
                span: span(),
            }],
            1,
        )]);
        let err = resolve(&m, &filename()).unwrap_err();
        assert_eq!(err.message(), "import * only allowed at module level");
    }

    #[test]
    fn test_yield_marks_generator() {
        let m = module(vec![func(
            "f",
            &[],
            vec![Stmt {
                kind: StmtKind::Discard(Expr {
                    kind: ExprKind::Yield(Some(Box::new(name("x")))),
                    span: span(),
                }),
                span: span(),
            }],
            1,
        )]);
        let table = resolve(&m, &filename()).unwrap();
        let f = table.scope(table.scope_for_node(1).unwrap());
        assert!(f.is_generator);
    }

    #[test]
    fn test_yield_at_module_level_rejected() {
        let m = module(vec![Stmt {
            kind: StmtKind::Discard(Expr {
                kind: ExprKind::Yield(None),
                span: span(),
            }),
            span: span(),
        }]);
        let err = resolve(&m, &filename()).unwrap_err();
        assert_eq!(err.message(), "'yield' outside function");
    }
}
