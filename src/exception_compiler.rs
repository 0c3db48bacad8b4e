//! Exception-handling statements: `try`/`except`, `try`/`finally`, `with`.
//!
//! Split out of the main generator because these are the only constructs
//! that manipulate the runtime block stack and carry values on the operand
//! stack across a jump: a `SETUP_EXCEPT` target receives the exception
//! triple, a `SETUP_FINALLY` target receives one unwind token. The depth
//! deltas here must line up with the branch effects in
//! [`crate::bytecode::opcode`] or assembly fails the dataflow check.

use crate::ast::{ExceptHandler, Expr, Stmt};
use crate::bytecode::{cmp, Constant, Opcode};
use crate::compiler::{CodeGenerator, NameUsage, Setup};
use crate::error::CompileResult;

pub(crate) trait ExceptionCompiler {
    fn compile_try_except(
        &mut self,
        body: &[Stmt],
        handlers: &[ExceptHandler],
        orelse: &[Stmt],
    ) -> CompileResult<()>;

    fn compile_try_finally(&mut self, body: &[Stmt], finalbody: &[Stmt]) -> CompileResult<()>;

    fn compile_with(
        &mut self,
        context: &Expr,
        target: Option<&Expr>,
        body: &[Stmt],
    ) -> CompileResult<()>;
}

impl ExceptionCompiler for CodeGenerator<'_> {
    fn compile_try_except(
        &mut self,
        body: &[Stmt],
        handlers: &[ExceptHandler],
        orelse: &[Stmt],
    ) -> CompileResult<()> {
        for (position, handler) in handlers.iter().enumerate() {
            if handler.typ.is_none() && position + 1 != handlers.len() {
                return Err(self.err("default 'except:' must be last", handler.span));
            }
        }

        let handler_label = self.asm.new_label();
        let orelse_label = self.asm.new_label();
        let end = self.asm.new_label();

        self.asm.emit_jump(Opcode::SetupExcept, handler_label)?;
        self.setups.push(Setup::Except);
        self.compile_stmts(body)?;
        self.setups.pop();
        self.asm.emit(Opcode::PopBlock);
        self.asm.emit_jump(Opcode::JumpForward, orelse_label)?;

        // handler entry: the triple [traceback, value, type] with the type
        // on top, pushed by the unwinder
        self.asm.place(handler_label)?;
        let mut last_typed = false;
        for handler in handlers {
            self.asm.set_position(handler.span);
            let next = match &handler.typ {
                Some(typ) => {
                    let next = self.asm.new_label();
                    self.asm.emit(Opcode::DupTop);
                    self.compile_expr(typ)?;
                    self.asm.emit_arg(Opcode::CompareOp, cmp::EXC_MATCH);
                    self.asm.emit_jump(Opcode::JumpIfFalse, next)?;
                    self.asm.emit(Opcode::PopTop);
                    last_typed = true;
                    Some(next)
                }
                None => {
                    last_typed = false;
                    None
                }
            };
            self.asm.emit(Opcode::PopTop);
            match &handler.target {
                Some(target) => self.compile_store(target)?,
                None => self.asm.emit(Opcode::PopTop),
            }
            self.asm.emit(Opcode::PopTop);
            self.compile_stmts(&handler.body)?;
            self.asm.emit_jump(Opcode::JumpForward, end)?;
            if let Some(next) = next {
                self.asm.place(next)?;
                self.asm.emit(Opcode::PopTop);
            }
        }
        if last_typed {
            // nothing matched: put the triple back in the unwinder's hands
            self.asm.emit(Opcode::Reraise);
        }

        self.asm.place(orelse_label)?;
        self.compile_stmts(orelse)?;
        self.asm.place(end)?;
        Ok(())
    }

    fn compile_try_finally(&mut self, body: &[Stmt], finalbody: &[Stmt]) -> CompileResult<()> {
        let final_label = self.asm.new_label();
        self.asm.emit_jump(Opcode::SetupFinally, final_label)?;
        self.setups.push(Setup::TryFinally);
        self.compile_stmts(body)?;
        self.setups.pop();
        self.asm.emit(Opcode::PopBlock);
        // normal completion pushes the None token END_FINALLY dispatches on
        self.asm.emit_const(Opcode::LoadConst, Constant::None);
        self.asm.place(final_label)?;
        self.setups.push(Setup::EndFinally);
        self.compile_stmts(finalbody)?;
        self.setups.pop();
        self.asm.emit(Opcode::EndFinally);
        Ok(())
    }

    fn compile_with(
        &mut self,
        context: &Expr,
        target: Option<&Expr>,
        body: &[Stmt],
    ) -> CompileResult<()> {
        self.temp_count += 1;
        let exit_slot = format!("$exit{}", self.temp_count);

        self.compile_expr(context)?;
        self.asm.emit(Opcode::DupTop);
        self.asm.emit_name(Opcode::LoadAttr, "__exit__");
        self.emit_hidden(&exit_slot, NameUsage::Store);
        self.asm.emit_name(Opcode::LoadAttr, "__enter__");
        self.asm.emit_arg(Opcode::CallFunction, 0);
        match target {
            Some(target) => self.compile_store(target)?,
            None => self.asm.emit(Opcode::PopTop),
        }

        let final_label = self.asm.new_label();
        self.asm.emit_jump(Opcode::SetupFinally, final_label)?;
        self.setups.push(Setup::TryFinally);
        self.compile_stmts(body)?;
        self.setups.pop();
        self.asm.emit(Opcode::PopBlock);
        self.asm.emit_const(Opcode::LoadConst, Constant::None);
        self.asm.place(final_label)?;
        self.setups.push(Setup::EndFinally);
        self.emit_hidden(&exit_slot, NameUsage::Load);
        self.asm.emit(Opcode::WithCleanup);
        self.emit_hidden(&exit_slot, NameUsage::Delete);
        self.asm.emit(Opcode::EndFinally);
        self.setups.pop();

        self.temp_count -= 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::ast::{
        ExceptHandler, Expr, ExprKind, Module, Param, Params, Span, Stmt, StmtKind,
    };
    use crate::bytecode::{CodeObject, Constant, Opcode};
    use crate::{fold, future, scope};

    fn compile_ast(module: Module) -> Arc<CodeObject> {
        let filename: Arc<str> = Arc::from("<test>");
        let futures = future::scan(&module, &filename).expect("scan failed");
        let module = fold::fold_module(module, &futures);
        let table = scope::resolve(&module, &filename).expect("resolve failed");
        crate::compiler::compile(&module, &filename, futures, &table).expect("compile failed")
    }

    fn raw_ops(code: &CodeObject) -> Vec<Opcode> {
        let mut out = Vec::new();
        let mut offset = 0;
        while offset < code.code.len() {
            let op = Opcode::from_byte(code.code[offset]).expect("bad opcode");
            out.push(op);
            offset += op.size();
        }
        out
    }

    fn span() -> Span {
        Span::at(1, 0)
    }

    fn expr(kind: ExprKind) -> Expr {
        Expr { kind, span: span() }
    }

    fn stmt(kind: StmtKind) -> Stmt {
        Stmt { kind, span: span() }
    }

    fn name(n: &str) -> Expr {
        expr(ExprKind::Name(n.to_owned()))
    }

    fn pass() -> Stmt {
        stmt(StmtKind::Pass)
    }

    fn module(body: Vec<Stmt>) -> Module {
        Module { body, node: 0 }
    }

    #[test]
    fn test_try_finally_pushes_none_token() {
        let code = compile_ast(module(vec![stmt(StmtKind::TryFinally {
            body: vec![pass()],
            finalbody: vec![pass()],
        })]));
        let ops = raw_ops(&code);
        assert!(ops.contains(&Opcode::SetupFinally));
        assert!(ops.contains(&Opcode::EndFinally));
        // normal exit pushes None so END_FINALLY sees a token either way
        let pop_block = ops.iter().position(|op| *op == Opcode::PopBlock).unwrap();
        assert_eq!(ops[pop_block + 1], Opcode::LoadConst);
        assert!(code.consts.contains(&Constant::None));
    }

    #[test]
    fn test_bare_except_pops_the_triple() {
        let code = compile_ast(module(vec![stmt(StmtKind::TryExcept {
            body: vec![pass()],
            handlers: vec![ExceptHandler {
                typ: None,
                target: None,
                body: vec![pass()],
                span: span(),
            }],
            orelse: vec![],
        })]));
        let ops = raw_ops(&code);
        let pops = ops.iter().filter(|op| **op == Opcode::PopTop).count();
        assert_eq!(pops, 3);
        // a bare handler always matches, so nothing re-raises
        assert!(!ops.contains(&Opcode::Reraise));
    }

    #[test]
    fn test_handler_target_binds_exception_value() {
        let code = compile_ast(module(vec![stmt(StmtKind::TryExcept {
            body: vec![pass()],
            handlers: vec![ExceptHandler {
                typ: Some(name("ValueError")),
                target: Some(name("e")),
                body: vec![pass()],
                span: span(),
            }],
            orelse: vec![],
        })]));
        assert!(code.names.iter().any(|n| &**n == "e"));
        assert!(raw_ops(&code).contains(&Opcode::StoreName));
    }

    #[test]
    fn test_with_uses_fast_temporaries_in_functions() {
        let code = compile_ast(module(vec![stmt(StmtKind::FunctionDef {
            name: "f".to_owned(),
            params: Params {
                params: vec![Param::Name("lock".to_owned())],
                vararg: None,
                kwarg: None,
            },
            defaults: vec![],
            decorators: vec![],
            body: vec![stmt(StmtKind::With {
                context: name("lock"),
                target: None,
                body: vec![pass()],
            })],
            node: 1,
        })]));
        let f = match code.consts.iter().find_map(|c| match c {
            Constant::Code(inner) => Some(Arc::clone(inner)),
            _ => None,
        }) {
            Some(f) => f,
            None => panic!("no function code"),
        };
        assert!(f.varnames.iter().any(|n| &**n == "$exit1"));
        let ops = raw_ops(&f);
        assert!(ops.contains(&Opcode::WithCleanup));
        assert!(ops.contains(&Opcode::DeleteFast));
    }

    #[test]
    fn test_nested_with_statements_get_distinct_slots() {
        let code = compile_ast(module(vec![stmt(StmtKind::With {
            context: name("a"),
            target: None,
            body: vec![stmt(StmtKind::With {
                context: name("b"),
                target: None,
                body: vec![pass()],
            })],
        })]));
        assert!(code.names.iter().any(|n| &**n == "$exit1"));
        assert!(code.names.iter().any(|n| &**n == "$exit2"));
    }
}
