//! AST to bytecode translation.
//!
//! One [`CodeGenerator`] produces one code object; nested functions, lambdas,
//! class bodies, and generator expressions each get a child generator whose
//! finished code object lands in the parent's constant pool. Exception
//! machinery (`try`, `with`) lives in [`crate::exception_compiler`].
//!
//! The generator tracks the active syntactic blocks in `setups` so that
//! `break` and `continue` can be validated and routed: a `continue` under an
//! exception handler or finally-protected region cannot use a plain jump and
//! becomes `CONTINUE_LOOP`, which unwinds the runtime block stack first.

use std::sync::Arc;

use rustc_hash::FxHashSet;
use smallvec::SmallVec;

use crate::ast::{
    BinOp, CmpOp, Comprehension, Expr, ExprKind, Module, Param, Params, Span, Stmt, StmtKind,
    UnaryOp,
};
use crate::bytecode::{cmp, Assembler, CodeFlags, CodeObject, Constant, Opcode};
use crate::error::{CompileError, CompileResult};
use crate::exception_compiler::ExceptionCompiler;
use crate::future::FutureFlags;
use crate::scope::{mangle, NameClass, Scope, ScopeId, ScopeKind, SymbolTable};

const SLICE: [Opcode; 4] = [
    Opcode::Slice0,
    Opcode::Slice1,
    Opcode::Slice2,
    Opcode::Slice3,
];
const STORE_SLICE: [Opcode; 4] = [
    Opcode::StoreSlice0,
    Opcode::StoreSlice1,
    Opcode::StoreSlice2,
    Opcode::StoreSlice3,
];
const DELETE_SLICE: [Opcode; 4] = [
    Opcode::DeleteSlice0,
    Opcode::DeleteSlice1,
    Opcode::DeleteSlice2,
    Opcode::DeleteSlice3,
];

/// Compile a resolved module into its code object.
pub fn compile(
    module: &Module,
    filename: &Arc<str>,
    futures: FutureFlags,
    table: &SymbolTable,
) -> CompileResult<Arc<CodeObject>> {
    let scope_id = table.scope_for_node(module.node)?;
    let mut gen = CodeGenerator::new(
        table,
        scope_id,
        Arc::clone(filename),
        futures,
        Arc::from("<module>"),
        1,
    );
    let (doc, rest) = split_docstring(&module.body);
    let has_doc = matches!(doc, Constant::Str(_));
    gen.asm.set_docstring(doc.clone())?;
    if has_doc {
        gen.asm.emit_const(Opcode::LoadConst, doc);
        gen.asm.emit_name(Opcode::StoreName, "__doc__");
    }
    gen.compile_stmts(rest)?;
    gen.asm.emit_const(Opcode::LoadConst, Constant::None);
    gen.asm.emit(Opcode::ReturnValue);
    gen.into_code(0, CodeFlags::NONE)
}

/// A syntactic block currently open around the point of emission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Setup {
    /// A `while` or `for` body; `start` is the continue target.
    Loop { start: crate::bytecode::Label },
    /// The protected body of a `try`/`except`.
    Except,
    /// The protected body of a `try`/`finally` (or `with`).
    TryFinally,
    /// A `finally` clause itself.
    EndFinally,
}

/// How a name reference is used, selecting the opcode within a family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NameUsage {
    Load,
    Store,
    Delete,
}

/// The loop body of a comprehension or generator expression.
enum CompBody<'x> {
    /// Append the element to the hidden accumulator list.
    ListAppend {
        accumulator: String,
        element: &'x Expr,
    },
    /// Yield the element (generator expression unit).
    Yield(&'x Expr),
}

pub(crate) struct CodeGenerator<'a> {
    pub(crate) asm: Assembler,
    pub(crate) table: &'a SymbolTable,
    pub(crate) scope_id: ScopeId,
    pub(crate) filename: Arc<str>,
    pub(crate) futures: FutureFlags,
    pub(crate) qualname: Arc<str>,
    pub(crate) first_lineno: u32,
    pub(crate) setups: SmallVec<[Setup; 8]>,
    /// Counter for hidden temporaries (`_[n]`, `$exitn`).
    pub(crate) temp_count: u32,
}

impl<'a> CodeGenerator<'a> {
    fn new(
        table: &'a SymbolTable,
        scope_id: ScopeId,
        filename: Arc<str>,
        futures: FutureFlags,
        qualname: Arc<str>,
        first_lineno: u32,
    ) -> CodeGenerator<'a> {
        let scope = table.scope(scope_id);
        let asm = Assembler::new(first_lineno, scope.varnames.clone(), &scope.deref_names());
        CodeGenerator {
            asm,
            table,
            scope_id,
            filename,
            futures,
            qualname,
            first_lineno,
            setups: SmallVec::new(),
            temp_count: 0,
        }
    }

    #[inline]
    fn scope(&self) -> &'a Scope {
        self.table.scope(self.scope_id)
    }

    fn child(&self, scope_id: ScopeId, name: &str, first_lineno: u32) -> CodeGenerator<'a> {
        let qualname: Arc<str> = if self.scope().kind == ScopeKind::Module {
            Arc::from(name)
        } else {
            Arc::from(format!("{}.{name}", self.qualname))
        };
        CodeGenerator::new(
            self.table,
            scope_id,
            Arc::clone(&self.filename),
            self.futures,
            qualname,
            first_lineno,
        )
    }

    pub(crate) fn err(&self, message: impl Into<String>, span: Span) -> CompileError {
        CompileError::syntax(message, &self.filename, span)
    }

    /// Assemble into a finished code object, consuming the generator.
    fn into_code(self, argcount: u16, extra: CodeFlags) -> CompileResult<Arc<CodeObject>> {
        let scope = self.table.scope(self.scope_id);
        let unit = self.asm.finish()?;
        let mut flags = self.futures.code_flags() | extra;
        match scope.kind {
            ScopeKind::Module => {}
            ScopeKind::Class => flags |= CodeFlags::NEWLOCALS,
            _ => flags |= CodeFlags::OPTIMIZED | CodeFlags::NEWLOCALS,
        }
        if scope.nested {
            flags |= CodeFlags::NESTED;
        }
        if scope.is_generator {
            flags |= CodeFlags::GENERATOR;
        }
        let nlocals = unit.varnames.len() as u16;
        Ok(Arc::new(CodeObject {
            name: Arc::clone(&scope.name),
            qualname: self.qualname,
            filename: self.filename,
            first_lineno: self.first_lineno,
            code: unit.code,
            consts: unit.consts,
            names: unit.names,
            varnames: unit.varnames,
            freevars: scope.freevars.clone().into_boxed_slice(),
            cellvars: scope.cellvars.clone().into_boxed_slice(),
            argcount,
            posonlyargcount: 0,
            kwonlyargcount: 0,
            nlocals,
            stacksize: unit.stacksize,
            flags,
            line_table: unit.line_table,
        }))
    }

    // === Name references ===

    /// Emit the load/store/delete of a source-level name, dispatching on the
    /// resolver's classification.
    pub(crate) fn compile_name(
        &mut self,
        name: &str,
        usage: NameUsage,
        span: Span,
    ) -> CompileResult<()> {
        if name == "None" {
            return match usage {
                NameUsage::Load => {
                    self.asm.emit_const(Opcode::LoadConst, Constant::None);
                    Ok(())
                }
                NameUsage::Store => Err(self.err("cannot assign to None", span)),
                NameUsage::Delete => Err(self.err("cannot delete None", span)),
            };
        }
        let scope = self.scope();
        let mangled = mangle(scope.private_prefix.as_deref(), name);
        let optimized = scope.is_optimized();
        match scope.class_of(&mangled) {
            NameClass::Local => {
                if optimized {
                    let op = match usage {
                        NameUsage::Load => Opcode::LoadFast,
                        NameUsage::Store => Opcode::StoreFast,
                        NameUsage::Delete => Opcode::DeleteFast,
                    };
                    self.asm.emit_fast(op, &mangled);
                } else {
                    let op = match usage {
                        NameUsage::Load => Opcode::LoadName,
                        NameUsage::Store => Opcode::StoreName,
                        NameUsage::Delete => Opcode::DeleteName,
                    };
                    self.asm.emit_name(op, &mangled);
                }
            }
            NameClass::Cell | NameClass::Free => {
                let op = match usage {
                    NameUsage::Load => Opcode::LoadDeref,
                    NameUsage::Store => Opcode::StoreDeref,
                    NameUsage::Delete => {
                        return Err(self.err(
                            format!(
                                "cannot delete variable '{mangled}' referenced in nested scope"
                            ),
                            span,
                        ));
                    }
                };
                self.asm.emit_deref(op, &mangled)?;
            }
            NameClass::Global | NameClass::ReallyGlobal => {
                let op = match usage {
                    NameUsage::Load => Opcode::LoadGlobal,
                    NameUsage::Store => Opcode::StoreGlobal,
                    NameUsage::Delete => Opcode::DeleteGlobal,
                };
                self.asm.emit_name(op, &mangled);
            }
            NameClass::Unknown => {
                // unresolved reads in optimized scopes go straight to the
                // module namespace; elsewhere the default lookup chain applies
                let op = if optimized {
                    match usage {
                        NameUsage::Load => Opcode::LoadGlobal,
                        NameUsage::Store => Opcode::StoreGlobal,
                        NameUsage::Delete => Opcode::DeleteGlobal,
                    }
                } else {
                    match usage {
                        NameUsage::Load => Opcode::LoadName,
                        NameUsage::Store => Opcode::StoreName,
                        NameUsage::Delete => Opcode::DeleteName,
                    }
                };
                self.asm.emit_name(op, &mangled);
            }
        }
        Ok(())
    }

    /// Load/store/delete of a compiler-invented temporary, which the
    /// resolver never saw.
    pub(crate) fn emit_hidden(&mut self, name: &str, usage: NameUsage) {
        if self.scope().is_optimized() {
            let op = match usage {
                NameUsage::Load => Opcode::LoadFast,
                NameUsage::Store => Opcode::StoreFast,
                NameUsage::Delete => Opcode::DeleteFast,
            };
            self.asm.emit_fast(op, name);
        } else {
            let op = match usage {
                NameUsage::Load => Opcode::LoadName,
                NameUsage::Store => Opcode::StoreName,
                NameUsage::Delete => Opcode::DeleteName,
            };
            self.asm.emit_name(op, name);
        }
    }

    fn mangled_attr<'n>(&self, attr: &'n str) -> std::borrow::Cow<'n, str> {
        mangle(self.scope().private_prefix.as_deref(), attr)
    }

    // === Statements ===

    pub(crate) fn compile_stmts(&mut self, stmts: &[Stmt]) -> CompileResult<()> {
        for stmt in stmts {
            self.compile_stmt(stmt)?;
        }
        Ok(())
    }

    fn compile_stmt(&mut self, stmt: &Stmt) -> CompileResult<()> {
        self.asm.set_position(stmt.span);
        match &stmt.kind {
            StmtKind::FunctionDef {
                name,
                params,
                defaults,
                decorators,
                body,
                node,
            } => self.compile_function(
                name, params, defaults, decorators, body, *node, stmt.span,
            )?,
            StmtKind::ClassDef {
                name,
                bases,
                decorators,
                body,
                node,
            } => self.compile_class(name, bases, decorators, body, *node, stmt.span)?,
            StmtKind::Return(value) => {
                let scope = self.scope();
                if !scope.kind.is_function_like() {
                    return Err(self.err("'return' outside function", stmt.span));
                }
                if scope.is_generator && value.is_some() {
                    return Err(
                        self.err("'return' with argument inside generator", stmt.span)
                    );
                }
                match value {
                    Some(value) => self.compile_expr(value)?,
                    None => self.asm.emit_const(Opcode::LoadConst, Constant::None),
                }
                self.asm.emit(Opcode::ReturnValue);
            }
            StmtKind::Delete(targets) => {
                for target in targets {
                    self.compile_delete(target)?;
                }
            }
            StmtKind::Assign { targets, value } => self.compile_assign(targets, value)?,
            StmtKind::AugAssign { target, op, value } => {
                self.compile_aug_assign(target, *op, value)?
            }
            StmtKind::For {
                target,
                iter,
                body,
                orelse,
            } => self.compile_for(target, iter, body, orelse)?,
            StmtKind::While { test, body, orelse } => {
                self.compile_while(test, body, orelse)?
            }
            StmtKind::If { test, body, orelse } => self.compile_if(test, body, orelse)?,
            StmtKind::With {
                context,
                target,
                body,
            } => self.compile_with(context, target.as_ref(), body)?,
            StmtKind::Raise {
                exc,
                value,
                traceback,
            } => {
                let mut count = 0u32;
                for part in [exc, value, traceback].into_iter().flatten() {
                    self.compile_expr(part)?;
                    count += 1;
                }
                self.asm.emit_arg(Opcode::RaiseVarargs, count);
            }
            StmtKind::TryExcept {
                body,
                handlers,
                orelse,
            } => self.compile_try_except(body, handlers, orelse)?,
            StmtKind::TryFinally { body, finalbody } => {
                self.compile_try_finally(body, finalbody)?
            }
            StmtKind::Assert { test, msg } => self.compile_assert(test, msg.as_ref())?,
            StmtKind::Import(aliases) => self.compile_import(aliases, stmt.span)?,
            StmtKind::ImportFrom {
                module,
                names,
                level,
            } => self.compile_import_from(module, names, *level, stmt.span)?,
            StmtKind::Global(_) | StmtKind::Pass => {}
            StmtKind::Discard(expr) => {
                self.compile_expr(expr)?;
                self.asm.emit(Opcode::PopTop);
            }
            StmtKind::Break => self.compile_break(stmt.span)?,
            StmtKind::Continue => self.compile_continue(stmt.span)?,
        }
        Ok(())
    }

    fn compile_if(&mut self, test: &Expr, body: &[Stmt], orelse: &[Stmt]) -> CompileResult<()> {
        // a constant test leaves exactly one arm
        if let Some(constant) = test.as_const() {
            return if constant.truth() {
                self.compile_stmts(body)
            } else {
                self.compile_stmts(orelse)
            };
        }
        let else_label = self.asm.new_label();
        let end = self.asm.new_label();
        self.compile_expr(test)?;
        self.asm.emit_jump(Opcode::JumpIfFalse, else_label)?;
        self.asm.emit(Opcode::PopTop);
        self.compile_stmts(body)?;
        self.asm.emit_jump(Opcode::JumpForward, end)?;
        self.asm.place(else_label)?;
        self.asm.emit(Opcode::PopTop);
        self.compile_stmts(orelse)?;
        self.asm.place(end)?;
        Ok(())
    }

    fn compile_while(
        &mut self,
        test: &Expr,
        body: &[Stmt],
        orelse: &[Stmt],
    ) -> CompileResult<()> {
        if let Some(constant) = test.as_const() {
            if !constant.truth() {
                // the body can never run; `else` always does
                return self.compile_stmts(orelse);
            }
        }
        let end = self.asm.new_label();
        let start = self.asm.new_label();
        self.asm.emit_jump(Opcode::SetupLoop, end)?;
        self.asm.place(start)?;
        let always_true = test.as_const().is_some_and(|c| c.truth());
        let else_label = if always_true {
            None
        } else {
            let label = self.asm.new_label();
            self.compile_expr(test)?;
            self.asm.emit_jump(Opcode::JumpIfFalse, label)?;
            self.asm.emit(Opcode::PopTop);
            Some(label)
        };
        self.setups.push(Setup::Loop { start });
        self.compile_stmts(body)?;
        self.setups.pop();
        self.asm.emit_jump(Opcode::JumpAbsolute, start)?;
        if let Some(label) = else_label {
            self.asm.place(label)?;
            self.asm.emit(Opcode::PopTop);
        }
        self.asm.emit(Opcode::PopBlock);
        self.compile_stmts(orelse)?;
        self.asm.place(end)?;
        Ok(())
    }

    fn compile_for(
        &mut self,
        target: &Expr,
        iter: &Expr,
        body: &[Stmt],
        orelse: &[Stmt],
    ) -> CompileResult<()> {
        let end = self.asm.new_label();
        let start = self.asm.new_label();
        let exhaust = self.asm.new_label();
        self.asm.emit_jump(Opcode::SetupLoop, end)?;
        self.compile_expr(iter)?;
        self.asm.emit(Opcode::GetIter);
        self.asm.place(start)?;
        self.asm.emit_jump(Opcode::ForIter, exhaust)?;
        self.compile_store(target)?;
        self.setups.push(Setup::Loop { start });
        self.compile_stmts(body)?;
        self.setups.pop();
        self.asm.emit_jump(Opcode::JumpAbsolute, start)?;
        self.asm.place(exhaust)?;
        self.asm.emit(Opcode::PopBlock);
        self.compile_stmts(orelse)?;
        self.asm.place(end)?;
        Ok(())
    }

    fn compile_break(&mut self, span: Span) -> CompileResult<()> {
        if !self
            .setups
            .iter()
            .any(|s| matches!(s, Setup::Loop { .. }))
        {
            return Err(self.err("'break' outside loop", span));
        }
        self.asm.emit(Opcode::BreakLoop);
        Ok(())
    }

    fn compile_continue(&mut self, span: Span) -> CompileResult<()> {
        let mut target = None;
        let mut crosses_block = false;
        for setup in self.setups.iter().rev() {
            match setup {
                Setup::Loop { start } => {
                    target = Some(*start);
                    break;
                }
                Setup::Except | Setup::TryFinally => crosses_block = true,
                Setup::EndFinally => {
                    return Err(self.err(
                        "'continue' not supported inside 'finally' clause",
                        span,
                    ));
                }
            }
        }
        let Some(start) = target else {
            return Err(self.err("'continue' not properly in loop", span));
        };
        if crosses_block {
            // unwind the runtime block stack down to the loop first
            self.asm.emit_jump(Opcode::ContinueLoop, start)?;
        } else {
            self.asm.emit_jump(Opcode::JumpAbsolute, start)?;
        }
        Ok(())
    }

    fn compile_assert(&mut self, test: &Expr, msg: Option<&Expr>) -> CompileResult<()> {
        let end = self.asm.new_label();
        self.compile_expr(test)?;
        self.asm.emit_jump(Opcode::JumpIfTrue, end)?;
        self.asm.emit(Opcode::PopTop);
        self.asm.emit_name(Opcode::LoadGlobal, "AssertionError");
        match msg {
            Some(msg) => {
                self.compile_expr(msg)?;
                self.asm.emit_arg(Opcode::RaiseVarargs, 2);
            }
            None => self.asm.emit_arg(Opcode::RaiseVarargs, 1),
        }
        self.asm.place(end)?;
        self.asm.emit(Opcode::PopTop);
        Ok(())
    }

    // === Assignment ===

    fn compile_assign(&mut self, targets: &[Expr], value: &Expr) -> CompileResult<()> {
        // `a, b = x, y` with only plain names on the left avoids building
        // and unpacking a tuple: values are pushed left to right and stored
        // right to left. A name assigned twice keeps its leftmost-last
        // value, so duplicates pop instead of storing again.
        if let [target] = targets {
            if let ExprKind::Tuple(names) = &target.kind {
                if names.iter().all(|n| matches!(n.kind, ExprKind::Name(_))) {
                    match &value.kind {
                        ExprKind::Tuple(values) if values.len() == names.len() => {
                            for value in values {
                                self.compile_expr(value)?;
                            }
                            return self.compile_packed_stores(names);
                        }
                        // the folder may have collapsed the display into one
                        // tuple constant; push its elements individually
                        ExprKind::Const(Constant::Tuple(values))
                            if values.len() == names.len() =>
                        {
                            self.asm.set_position(value.span);
                            for element in values {
                                self.asm.emit_const(Opcode::LoadConst, element.clone());
                            }
                            return self.compile_packed_stores(names);
                        }
                        _ => {}
                    }
                }
            }
        }
        self.compile_expr(value)?;
        for (position, target) in targets.iter().enumerate() {
            if position + 1 != targets.len() {
                self.asm.emit(Opcode::DupTop);
            }
            self.compile_store(target)?;
        }
        Ok(())
    }

    /// Store the values already on the stack (pushed left to right) into
    /// plain-name targets.
    fn compile_packed_stores(&mut self, names: &[Expr]) -> CompileResult<()> {
        // short tuples rotate the stack so the stores run left to right;
        // longer ones store right to left, popping duplicate names so the
        // rightmost value is the one a repeated name keeps
        match names.len() {
            2 | 3 => {
                if names.len() == 3 {
                    self.asm.emit(Opcode::RotThree);
                }
                self.asm.emit(Opcode::RotTwo);
                for target in names {
                    self.compile_store(target)?;
                }
            }
            _ => {
                let mut stored: FxHashSet<&str> = FxHashSet::default();
                for target in names.iter().rev() {
                    let ExprKind::Name(name) = &target.kind else {
                        return Err(CompileError::internal(
                            "packed assignment over non-name",
                        ));
                    };
                    if stored.contains(name.as_str()) {
                        self.asm.emit(Opcode::PopTop);
                    } else {
                        stored.insert(name);
                        self.compile_name(name, NameUsage::Store, target.span)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Store the value on top of the stack into `target`.
    pub(crate) fn compile_store(&mut self, target: &Expr) -> CompileResult<()> {
        match &target.kind {
            ExprKind::Name(name) => self.compile_name(name, NameUsage::Store, target.span)?,
            ExprKind::Tuple(items) | ExprKind::List(items) => {
                self.asm
                    .emit_arg(Opcode::UnpackSequence, items.len() as u32);
                for item in items {
                    self.compile_store(item)?;
                }
            }
            ExprKind::Attribute { value, attr } => {
                self.compile_expr(value)?;
                let attr = self.mangled_attr(attr).into_owned();
                self.asm.emit_name(Opcode::StoreAttr, &attr);
            }
            ExprKind::Subscript { value, index } => match &index.kind {
                ExprKind::Slice {
                    lower,
                    upper,
                    step: None,
                } => {
                    self.compile_expr(value)?;
                    let bits = self.compile_slice_bounds(lower.as_deref(), upper.as_deref())?;
                    self.asm.emit(STORE_SLICE[bits]);
                }
                _ => {
                    self.compile_expr(value)?;
                    self.compile_expr(index)?;
                    self.asm.emit(Opcode::StoreSubscr);
                }
            },
            _ => {
                return Err(self.err(
                    format!("can't assign to {}", target.describe()),
                    target.span,
                ));
            }
        }
        Ok(())
    }

    fn compile_delete(&mut self, target: &Expr) -> CompileResult<()> {
        match &target.kind {
            ExprKind::Name(name) => self.compile_name(name, NameUsage::Delete, target.span)?,
            ExprKind::Tuple(items) | ExprKind::List(items) => {
                for item in items {
                    self.compile_delete(item)?;
                }
            }
            ExprKind::Attribute { value, attr } => {
                self.compile_expr(value)?;
                let attr = self.mangled_attr(attr).into_owned();
                self.asm.emit_name(Opcode::DeleteAttr, &attr);
            }
            ExprKind::Subscript { value, index } => match &index.kind {
                ExprKind::Slice {
                    lower,
                    upper,
                    step: None,
                } => {
                    self.compile_expr(value)?;
                    let bits = self.compile_slice_bounds(lower.as_deref(), upper.as_deref())?;
                    self.asm.emit(DELETE_SLICE[bits]);
                }
                _ => {
                    self.compile_expr(value)?;
                    self.compile_expr(index)?;
                    self.asm.emit(Opcode::DeleteSubscr);
                }
            },
            _ => {
                return Err(self.err(
                    format!("can't delete {}", target.describe()),
                    target.span,
                ));
            }
        }
        Ok(())
    }

    fn compile_aug_assign(
        &mut self,
        target: &Expr,
        op: BinOp,
        value: &Expr,
    ) -> CompileResult<()> {
        let inplace = self.inplace_opcode(op);
        match &target.kind {
            ExprKind::Name(name) => {
                self.compile_name(name, NameUsage::Load, target.span)?;
                self.compile_expr(value)?;
                self.asm.emit(inplace);
                self.compile_name(name, NameUsage::Store, target.span)?;
            }
            ExprKind::Attribute {
                value: object,
                attr,
            } => {
                self.compile_expr(object)?;
                self.asm.emit(Opcode::DupTop);
                let attr = self.mangled_attr(attr).into_owned();
                self.asm.emit_name(Opcode::LoadAttr, &attr);
                self.compile_expr(value)?;
                self.asm.emit(inplace);
                self.asm.emit(Opcode::RotTwo);
                self.asm.emit_name(Opcode::StoreAttr, &attr);
            }
            ExprKind::Subscript {
                value: object,
                index,
            } => match &index.kind {
                ExprKind::Slice {
                    lower,
                    upper,
                    step: None,
                } => {
                    self.compile_expr(object)?;
                    let bits = self.compile_slice_bounds(lower.as_deref(), upper.as_deref())?;
                    let bounds = (bits & 1) + ((bits >> 1) & 1);
                    self.asm.emit_arg(Opcode::DupTopX, bounds as u32 + 1);
                    self.asm.emit(SLICE[bits]);
                    self.compile_expr(value)?;
                    self.asm.emit(inplace);
                    self.asm.emit(match bounds {
                        0 => Opcode::RotTwo,
                        1 => Opcode::RotThree,
                        _ => Opcode::RotFour,
                    });
                    self.asm.emit(STORE_SLICE[bits]);
                }
                _ => {
                    self.compile_expr(object)?;
                    self.compile_expr(index)?;
                    self.asm.emit_arg(Opcode::DupTopX, 2);
                    self.asm.emit(Opcode::BinarySubscr);
                    self.compile_expr(value)?;
                    self.asm.emit(inplace);
                    self.asm.emit(Opcode::RotThree);
                    self.asm.emit(Opcode::StoreSubscr);
                }
            },
            _ => {
                return Err(self.err(
                    "illegal expression for augmented assignment",
                    target.span,
                ));
            }
        }
        Ok(())
    }

    // === Imports ===

    fn import_level(&self, explicit: u32) -> i64 {
        if explicit > 0 {
            explicit as i64
        } else if self.futures.absolute_import {
            0
        } else {
            -1
        }
    }

    fn compile_import(
        &mut self,
        aliases: &[crate::ast::ImportAlias],
        span: Span,
    ) -> CompileResult<()> {
        for alias in aliases {
            self.asm
                .emit_const(Opcode::LoadConst, Constant::Int(self.import_level(0)));
            self.asm.emit_const(Opcode::LoadConst, Constant::None);
            self.asm.emit_name(Opcode::ImportName, &alias.name);
            match &alias.asname {
                Some(asname) => {
                    // walk down to the named submodule before binding
                    for attr in alias.name.split('.').skip(1) {
                        self.asm.emit_name(Opcode::LoadAttr, attr);
                    }
                    self.compile_name(asname, NameUsage::Store, span)?;
                }
                None => {
                    let binding = alias.name.split('.').next().unwrap_or(&alias.name);
                    self.compile_name(binding, NameUsage::Store, span)?;
                }
            }
        }
        Ok(())
    }

    fn compile_import_from(
        &mut self,
        module: &str,
        names: &[crate::ast::ImportAlias],
        level: u32,
        span: Span,
    ) -> CompileResult<()> {
        self.asm
            .emit_const(Opcode::LoadConst, Constant::Int(self.import_level(level)));
        let fromlist = Constant::Tuple(
            names
                .iter()
                .map(|alias| Constant::Str(alias.name.clone()))
                .collect(),
        );
        self.asm.emit_const(Opcode::LoadConst, fromlist);
        self.asm.emit_name(Opcode::ImportName, module);
        if names.len() == 1 && names[0].name == "*" {
            self.asm.emit(Opcode::ImportStar);
            return Ok(());
        }
        for alias in names {
            self.asm.emit_name(Opcode::ImportFrom, &alias.name);
            let binding = alias.asname.as_deref().unwrap_or(&alias.name);
            self.compile_name(binding, NameUsage::Store, span)?;
        }
        self.asm.emit(Opcode::PopTop);
        Ok(())
    }

    // === Functions and classes ===

    #[allow(clippy::too_many_arguments)]
    fn compile_function(
        &mut self,
        name: &str,
        params: &Params,
        defaults: &[Expr],
        decorators: &[Expr],
        body: &[Stmt],
        node: u32,
        span: Span,
    ) -> CompileResult<()> {
        for decorator in decorators {
            self.compile_expr(decorator)?;
        }
        for default in defaults {
            self.compile_expr(default)?;
        }

        let scope_id = self.table.scope_for_node(node)?;
        let mut child = self.child(scope_id, name, span.lineno);
        let (doc, rest) = split_docstring(body);
        child.asm.set_docstring(doc)?;
        child.compile_param_unpack(params, span)?;
        child.compile_stmts(rest)?;
        child.asm.emit_const(Opcode::LoadConst, Constant::None);
        child.asm.emit(Opcode::ReturnValue);

        let mut extra = CodeFlags::NONE;
        if params.vararg.is_some() {
            extra |= CodeFlags::VARARGS;
        }
        if params.kwarg.is_some() {
            extra |= CodeFlags::VARKEYWORDS;
        }
        let code = child.into_code(params.params.len() as u16, extra)?;

        self.emit_make_function(&code, defaults.len() as u32)?;
        for _ in decorators {
            self.asm.emit_arg(Opcode::CallFunction, 1);
        }
        self.compile_name(name, NameUsage::Store, span)
    }

    fn compile_lambda(
        &mut self,
        params: &Params,
        defaults: &[Expr],
        body: &Expr,
        node: u32,
        span: Span,
    ) -> CompileResult<()> {
        for default in defaults {
            self.compile_expr(default)?;
        }
        let scope_id = self.table.scope_for_node(node)?;
        let mut child = self.child(scope_id, "<lambda>", span.lineno);
        child.asm.set_docstring(Constant::None)?;
        child.compile_param_unpack(params, span)?;
        child.compile_expr(body)?;
        child.asm.emit(Opcode::ReturnValue);

        let mut extra = CodeFlags::NONE;
        if params.vararg.is_some() {
            extra |= CodeFlags::VARARGS;
        }
        if params.kwarg.is_some() {
            extra |= CodeFlags::VARKEYWORDS;
        }
        let code = child.into_code(params.params.len() as u16, extra)?;
        self.emit_make_function(&code, defaults.len() as u32)
    }

    fn compile_class(
        &mut self,
        name: &str,
        bases: &[Expr],
        decorators: &[Expr],
        body: &[Stmt],
        node: u32,
        span: Span,
    ) -> CompileResult<()> {
        for decorator in decorators {
            self.compile_expr(decorator)?;
        }
        self.asm
            .emit_const(Opcode::LoadConst, Constant::Str(name.to_owned()));
        for base in bases {
            self.compile_expr(base)?;
        }
        self.asm.emit_arg(Opcode::BuildTuple, bases.len() as u32);

        let scope_id = self.table.scope_for_node(node)?;
        let mut child = self.child(scope_id, name, span.lineno);
        let (doc, rest) = split_docstring(body);
        let has_doc = matches!(doc, Constant::Str(_));
        child.asm.set_docstring(doc.clone())?;
        child.asm.emit_name(Opcode::LoadGlobal, "__name__");
        child.asm.emit_name(Opcode::StoreName, "__module__");
        if has_doc {
            child.asm.emit_const(Opcode::LoadConst, doc);
            child.asm.emit_name(Opcode::StoreName, "__doc__");
        }
        child.compile_stmts(rest)?;
        child.asm.emit(Opcode::LoadLocals);
        child.asm.emit(Opcode::ReturnValue);
        let code = child.into_code(0, CodeFlags::NONE)?;

        self.emit_make_function(&code, 0)?;
        self.asm.emit_arg(Opcode::CallFunction, 0);
        self.asm.emit(Opcode::BuildClass);
        for _ in decorators {
            self.asm.emit_arg(Opcode::CallFunction, 1);
        }
        self.compile_name(name, NameUsage::Store, span)
    }

    /// Push a function object for `code`, building the closure tuple first
    /// when the unit has free variables. Any defaults must already be on
    /// the stack.
    fn emit_make_function(
        &mut self,
        code: &Arc<CodeObject>,
        num_defaults: u32,
    ) -> CompileResult<()> {
        if code.freevars.is_empty() {
            self.asm
                .emit_const(Opcode::LoadConst, Constant::Code(Arc::clone(code)));
            self.asm.emit_arg(Opcode::MakeFunction, num_defaults);
        } else {
            for free in code.freevars.iter() {
                self.asm.emit_deref(Opcode::LoadClosure, free)?;
            }
            self.asm
                .emit_arg(Opcode::BuildTuple, code.freevars.len() as u32);
            self.asm
                .emit_const(Opcode::LoadConst, Constant::Code(Arc::clone(code)));
            self.asm.emit_arg(Opcode::MakeClosure, num_defaults);
        }
        Ok(())
    }

    /// Unpack tuple-pattern parameters out of their hidden `.N` slots.
    fn compile_param_unpack(&mut self, params: &Params, span: Span) -> CompileResult<()> {
        for (position, param) in params.params.iter().enumerate() {
            if let Param::Tuple(inner) = param {
                let slot = format!(".{position}");
                self.asm.emit_fast(Opcode::LoadFast, &slot);
                self.unpack_param_tuple(inner, span)?;
            }
        }
        Ok(())
    }

    fn unpack_param_tuple(&mut self, inner: &[Param], span: Span) -> CompileResult<()> {
        self.asm
            .emit_arg(Opcode::UnpackSequence, inner.len() as u32);
        for param in inner {
            match param {
                Param::Name(name) => self.compile_name(name, NameUsage::Store, span)?,
                Param::Tuple(nested) => self.unpack_param_tuple(nested, span)?,
            }
        }
        Ok(())
    }

    // === Expressions ===

    pub(crate) fn compile_expr(&mut self, expr: &Expr) -> CompileResult<()> {
        self.asm.set_position(expr.span);
        match &expr.kind {
            ExprKind::Const(value) => {
                self.asm.emit_const(Opcode::LoadConst, value.clone());
            }
            ExprKind::Name(name) => self.compile_name(name, NameUsage::Load, expr.span)?,
            ExprKind::Tuple(items) => {
                for item in items {
                    self.compile_expr(item)?;
                }
                self.asm.emit_arg(Opcode::BuildTuple, items.len() as u32);
            }
            ExprKind::List(items) => {
                for item in items {
                    self.compile_expr(item)?;
                }
                self.asm.emit_arg(Opcode::BuildList, items.len() as u32);
            }
            ExprKind::Dict(pairs) => {
                for (key, value) in pairs {
                    self.compile_expr(key)?;
                    self.compile_expr(value)?;
                }
                self.asm.emit_arg(Opcode::BuildMap, pairs.len() as u32);
            }
            ExprKind::Binary { op, left, right } => {
                self.compile_expr(left)?;
                self.compile_expr(right)?;
                let opcode = self.binary_opcode(*op);
                self.asm.emit(opcode);
            }
            ExprKind::Unary { op, operand } => {
                self.compile_expr(operand)?;
                self.asm.emit(match op {
                    UnaryOp::Plus => Opcode::UnaryPositive,
                    UnaryOp::Minus => Opcode::UnaryNegative,
                    UnaryOp::Not => Opcode::UnaryNot,
                    UnaryOp::Invert => Opcode::UnaryInvert,
                });
            }
            ExprKind::Bool { op, values } => {
                // short-circuit: each decided operand jumps to the end with
                // its value intact; undecided ones are popped
                let end = self.asm.new_label();
                let jump = match op {
                    crate::ast::BoolOp::And => Opcode::JumpIfFalse,
                    crate::ast::BoolOp::Or => Opcode::JumpIfTrue,
                };
                for (position, value) in values.iter().enumerate() {
                    self.compile_expr(value)?;
                    if position + 1 != values.len() {
                        self.asm.emit_jump(jump, end)?;
                        self.asm.emit(Opcode::PopTop);
                    }
                }
                self.asm.place(end)?;
            }
            ExprKind::Compare {
                left,
                ops,
                comparators,
            } => self.compile_compare(left, ops, comparators)?,
            ExprKind::Lambda {
                params,
                defaults,
                body,
                node,
            } => self.compile_lambda(params, defaults, body, *node, expr.span)?,
            ExprKind::IfExp { test, body, orelse } => {
                let else_label = self.asm.new_label();
                let end = self.asm.new_label();
                self.compile_expr(test)?;
                self.asm.emit_jump(Opcode::JumpIfFalse, else_label)?;
                self.asm.emit(Opcode::PopTop);
                self.compile_expr(body)?;
                self.asm.emit_jump(Opcode::JumpForward, end)?;
                self.asm.place(else_label)?;
                self.asm.emit(Opcode::PopTop);
                self.compile_expr(orelse)?;
                self.asm.place(end)?;
            }
            ExprKind::Call {
                func,
                args,
                keywords,
                star_args,
                kw_args,
            } => self.compile_call(func, args, keywords, star_args, kw_args)?,
            ExprKind::Attribute { value, attr } => {
                self.compile_expr(value)?;
                let attr = self.mangled_attr(attr).into_owned();
                self.asm.emit_name(Opcode::LoadAttr, &attr);
            }
            ExprKind::Subscript { value, index } => match &index.kind {
                ExprKind::Slice {
                    lower,
                    upper,
                    step: None,
                } => {
                    self.compile_expr(value)?;
                    let bits = self.compile_slice_bounds(lower.as_deref(), upper.as_deref())?;
                    self.asm.emit(SLICE[bits]);
                }
                _ => {
                    self.compile_expr(value)?;
                    self.compile_expr(index)?;
                    self.asm.emit(Opcode::BinarySubscr);
                }
            },
            ExprKind::Slice { lower, upper, step } => {
                // extended slice: build a slice object for BINARY_SUBSCR
                self.compile_expr_or_none(lower.as_deref())?;
                self.compile_expr_or_none(upper.as_deref())?;
                let parts = match step {
                    Some(step) => {
                        self.compile_expr(step)?;
                        3
                    }
                    None => 2,
                };
                self.asm.emit_arg(Opcode::BuildSlice, parts);
            }
            ExprKind::ListComp {
                element,
                generators,
            } => self.compile_listcomp(element, generators)?,
            ExprKind::GenExp {
                element,
                generators,
                node,
            } => self.compile_genexpr(element, generators, *node, expr.span)?,
            ExprKind::Yield(value) => {
                match value {
                    Some(value) => self.compile_expr(value)?,
                    None => self.asm.emit_const(Opcode::LoadConst, Constant::None),
                }
                self.asm.emit(Opcode::YieldValue);
            }
        }
        Ok(())
    }

    fn compile_expr_or_none(&mut self, expr: Option<&Expr>) -> CompileResult<()> {
        match expr {
            Some(expr) => self.compile_expr(expr),
            None => {
                self.asm.emit_const(Opcode::LoadConst, Constant::None);
                Ok(())
            }
        }
    }

    /// Push present slice bounds; the returned bits select the opcode in the
    /// `SLICE` families (1 = lower present, 2 = upper present).
    fn compile_slice_bounds(
        &mut self,
        lower: Option<&Expr>,
        upper: Option<&Expr>,
    ) -> CompileResult<usize> {
        let mut bits = 0usize;
        if let Some(lower) = lower {
            self.compile_expr(lower)?;
            bits |= 1;
        }
        if let Some(upper) = upper {
            self.compile_expr(upper)?;
            bits |= 2;
        }
        Ok(bits)
    }

    fn compile_compare(
        &mut self,
        left: &Expr,
        ops: &[CmpOp],
        comparators: &[Expr],
    ) -> CompileResult<()> {
        self.compile_expr(left)?;
        if ops.len() == 1 {
            self.compile_expr(&comparators[0])?;
            self.asm.emit_arg(Opcode::CompareOp, compare_operand(ops[0]));
            return Ok(());
        }
        // chained comparison: each middle operand is kept under the result
        // so the next test can reuse it; a false result bails out through
        // the cleanup block that drops the saved operand
        let cleanup = self.asm.new_label();
        let end = self.asm.new_label();
        for (position, (op, comparator)) in ops.iter().zip(comparators).enumerate() {
            let last = position + 1 == ops.len();
            if last {
                self.compile_expr(comparator)?;
                self.asm.emit_arg(Opcode::CompareOp, compare_operand(*op));
                self.asm.emit_jump(Opcode::JumpForward, end)?;
            } else {
                self.compile_expr(comparator)?;
                self.asm.emit(Opcode::DupTop);
                self.asm.emit(Opcode::RotThree);
                self.asm.emit_arg(Opcode::CompareOp, compare_operand(*op));
                self.asm.emit_jump(Opcode::JumpIfFalse, cleanup)?;
                self.asm.emit(Opcode::PopTop);
            }
        }
        self.asm.place(cleanup)?;
        self.asm.emit(Opcode::RotTwo);
        self.asm.emit(Opcode::PopTop);
        self.asm.place(end)?;
        Ok(())
    }

    fn compile_call(
        &mut self,
        func: &Expr,
        args: &[Expr],
        keywords: &[(String, Expr)],
        star_args: &Option<Box<Expr>>,
        kw_args: &Option<Box<Expr>>,
    ) -> CompileResult<()> {
        self.compile_expr(func)?;
        for arg in args {
            self.compile_expr(arg)?;
        }
        for (name, value) in keywords {
            self.asm
                .emit_const(Opcode::LoadConst, Constant::Str(name.clone()));
            self.compile_expr(value)?;
        }
        let operand = args.len() as u32 | ((keywords.len() as u32) << 8);
        let opcode = match (star_args, kw_args) {
            (None, None) => Opcode::CallFunction,
            (Some(star), None) => {
                self.compile_expr(star)?;
                Opcode::CallFunctionVar
            }
            (None, Some(kw)) => {
                self.compile_expr(kw)?;
                Opcode::CallFunctionKw
            }
            (Some(star), Some(kw)) => {
                self.compile_expr(star)?;
                self.compile_expr(kw)?;
                Opcode::CallFunctionVarKw
            }
        };
        self.asm.emit_arg(opcode, operand);
        Ok(())
    }

    fn binary_opcode(&self, op: BinOp) -> Opcode {
        match op {
            BinOp::Add => Opcode::BinaryAdd,
            BinOp::Sub => Opcode::BinarySubtract,
            BinOp::Mul => Opcode::BinaryMultiply,
            BinOp::Div => {
                if self.futures.division {
                    Opcode::BinaryTrueDivide
                } else {
                    Opcode::BinaryDivide
                }
            }
            BinOp::FloorDiv => Opcode::BinaryFloorDivide,
            BinOp::Mod => Opcode::BinaryModulo,
            BinOp::Pow => Opcode::BinaryPower,
            BinOp::LShift => Opcode::BinaryLshift,
            BinOp::RShift => Opcode::BinaryRshift,
            BinOp::BitAnd => Opcode::BinaryAnd,
            BinOp::BitOr => Opcode::BinaryOr,
            BinOp::BitXor => Opcode::BinaryXor,
        }
    }

    fn inplace_opcode(&self, op: BinOp) -> Opcode {
        match op {
            BinOp::Add => Opcode::InplaceAdd,
            BinOp::Sub => Opcode::InplaceSubtract,
            BinOp::Mul => Opcode::InplaceMultiply,
            BinOp::Div => {
                if self.futures.division {
                    Opcode::InplaceTrueDivide
                } else {
                    Opcode::InplaceDivide
                }
            }
            BinOp::FloorDiv => Opcode::InplaceFloorDivide,
            BinOp::Mod => Opcode::InplaceModulo,
            BinOp::Pow => Opcode::InplacePower,
            BinOp::LShift => Opcode::InplaceLshift,
            BinOp::RShift => Opcode::InplaceRshift,
            BinOp::BitAnd => Opcode::InplaceAnd,
            BinOp::BitOr => Opcode::InplaceOr,
            BinOp::BitXor => Opcode::InplaceXor,
        }
    }

    // === Comprehensions ===

    fn compile_listcomp(
        &mut self,
        element: &Expr,
        generators: &[Comprehension],
    ) -> CompileResult<()> {
        self.temp_count += 1;
        let accumulator = format!("_[{}]", self.temp_count);
        self.asm.emit_arg(Opcode::BuildList, 0);
        self.asm.emit(Opcode::DupTop);
        self.emit_hidden(&accumulator, NameUsage::Store);
        let body = CompBody::ListAppend {
            accumulator: accumulator.clone(),
            element,
        };
        self.compile_comp_level(generators, 0, false, &body)?;
        self.emit_hidden(&accumulator, NameUsage::Delete);
        self.temp_count -= 1;
        Ok(())
    }

    fn compile_genexpr(
        &mut self,
        element: &Expr,
        generators: &[Comprehension],
        node: u32,
        span: Span,
    ) -> CompileResult<()> {
        let scope_id = self.table.scope_for_node(node)?;
        let mut child = self.child(scope_id, "<genexpr>", span.lineno);
        child.asm.set_docstring(Constant::None)?;
        let body = CompBody::Yield(element);
        child.compile_comp_level(generators, 0, true, &body)?;
        child.asm.emit_const(Opcode::LoadConst, Constant::None);
        child.asm.emit(Opcode::ReturnValue);
        let code = child.into_code(1, CodeFlags::NONE)?;

        self.emit_make_function(&code, 0)?;
        // the outermost iterable is evaluated eagerly in the defining scope
        self.compile_expr(&generators[0].iter)?;
        self.asm.emit(Opcode::GetIter);
        self.asm.emit_arg(Opcode::CallFunction, 1);
        Ok(())
    }

    /// Emit one nested loop level of a comprehension. Level 0 of a generator
    /// expression reads its pre-evaluated iterator from the hidden `.0`
    /// parameter instead of evaluating the iterable.
    fn compile_comp_level(
        &mut self,
        generators: &[Comprehension],
        index: usize,
        first_preloaded: bool,
        body: &CompBody<'_>,
    ) -> CompileResult<()> {
        let gen = &generators[index];
        if index == 0 && first_preloaded {
            self.asm.emit_fast(Opcode::LoadFast, ".0");
        } else {
            self.compile_expr(&gen.iter)?;
            self.asm.emit(Opcode::GetIter);
        }
        let start = self.asm.new_label();
        let exhaust = self.asm.new_label();
        self.asm.place(start)?;
        self.asm.emit_jump(Opcode::ForIter, exhaust)?;
        self.compile_store(&gen.target)?;

        let skip = if gen.ifs.is_empty() {
            None
        } else {
            Some(self.asm.new_label())
        };
        for test in &gen.ifs {
            self.compile_expr(test)?;
            if let Some(skip) = skip {
                self.asm.emit_jump(Opcode::JumpIfFalse, skip)?;
            }
            self.asm.emit(Opcode::PopTop);
        }

        if index + 1 == generators.len() {
            match body {
                CompBody::ListAppend {
                    accumulator,
                    element,
                } => {
                    let accumulator = accumulator.clone();
                    self.emit_hidden(&accumulator, NameUsage::Load);
                    self.compile_expr(element)?;
                    self.asm.emit(Opcode::ListAppend);
                }
                CompBody::Yield(element) => {
                    self.compile_expr(element)?;
                    self.asm.emit(Opcode::YieldValue);
                    self.asm.emit(Opcode::PopTop);
                }
            }
        } else {
            self.compile_comp_level(generators, index + 1, first_preloaded, body)?;
        }
        self.asm.emit_jump(Opcode::JumpAbsolute, start)?;

        if let Some(skip) = skip {
            self.asm.place(skip)?;
            self.asm.emit(Opcode::PopTop);
            self.asm.emit_jump(Opcode::JumpAbsolute, start)?;
        }
        self.asm.place(exhaust)?;
        Ok(())
    }
}

fn compare_operand(op: CmpOp) -> u32 {
    match op {
        CmpOp::Lt => cmp::LT,
        CmpOp::LtE => cmp::LE,
        CmpOp::Eq => cmp::EQ,
        CmpOp::NotEq => cmp::NE,
        CmpOp::Gt => cmp::GT,
        CmpOp::GtE => cmp::GE,
        CmpOp::In => cmp::IN,
        CmpOp::NotIn => cmp::NOT_IN,
        CmpOp::Is => cmp::IS,
        CmpOp::IsNot => cmp::IS_NOT,
    }
}

/// Split off a leading docstring statement. The constant goes to slot 0 of
/// the unit's pool; the statement itself is not compiled.
fn split_docstring(body: &[Stmt]) -> (Constant, &[Stmt]) {
    if let Some(first) = body.first() {
        if let StmtKind::Discard(expr) = &first.kind {
            if let ExprKind::Const(Constant::Str(doc)) = &expr.kind {
                return (Constant::Str(doc.clone()), &body[1..]);
            }
        }
    }
    (Constant::None, body)
}
