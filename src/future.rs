//! Future-import scanner.
//!
//! Runs before everything else in the pipeline. `from __future__ import ...`
//! statements are only honored in a prefix of the module: an optional
//! docstring followed by a contiguous run of future imports. A second sweep
//! over the whole tree rejects any future import outside that prefix.

use std::sync::Arc;

use crate::ast::{ExprKind, Module, Stmt, StmtKind};
use crate::bytecode::{CodeFlags, Constant};
use crate::error::{CompileError, CompileResult};

/// Feature switches requested by the module's future imports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FutureFlags {
    /// `/` on integers produces true division.
    pub division: bool,
    /// `yield` enables generator functions. Always compilable; the import
    /// is accepted for source compatibility.
    pub generators: bool,
    /// `with` statements.
    pub with_statement: bool,
    /// Imports without an explicit dot prefix are absolute (level 0 instead
    /// of the classic relative-then-absolute -1).
    pub absolute_import: bool,
    /// Lexical closures. Always on; accepted for source compatibility.
    pub nested_scopes: bool,
}

impl FutureFlags {
    /// Code-object flags this module's futures contribute to every unit.
    pub fn code_flags(&self) -> CodeFlags {
        let mut flags = CodeFlags::GENERATOR_ALLOWED;
        if self.division {
            flags |= CodeFlags::FUTURE_DIVISION;
        }
        flags
    }
}

/// Scan the module prefix for future imports and reject misplaced ones.
pub fn scan(module: &Module, filename: &Arc<str>) -> CompileResult<FutureFlags> {
    let mut flags = FutureFlags::default();
    let prefix_end = scan_prefix(module, filename, &mut flags)?;
    check_placement(&module.body[prefix_end..], filename)?;
    Ok(flags)
}

fn is_docstring(stmt: &Stmt) -> bool {
    matches!(
        &stmt.kind,
        StmtKind::Discard(expr) if matches!(&expr.kind, ExprKind::Const(Constant::Str(_)))
    )
}

fn is_future_import(stmt: &Stmt) -> bool {
    matches!(&stmt.kind, StmtKind::ImportFrom { module, .. } if module == "__future__")
}

/// Consume the legal prefix, applying each feature. Returns the index of
/// the first statement past it.
fn scan_prefix(
    module: &Module,
    filename: &Arc<str>,
    flags: &mut FutureFlags,
) -> CompileResult<usize> {
    let mut index = 0;
    if module.body.first().is_some_and(is_docstring) {
        index = 1;
    }
    while let Some(stmt) = module.body.get(index) {
        if !is_future_import(stmt) {
            break;
        }
        let StmtKind::ImportFrom { names, .. } = &stmt.kind else {
            break;
        };
        for alias in names {
            match alias.name.as_str() {
                "*" => {
                    return Err(CompileError::syntax(
                        "future statement does not support import *",
                        filename,
                        stmt.span,
                    ));
                }
                "division" => flags.division = true,
                "generators" => flags.generators = true,
                "with_statement" => flags.with_statement = true,
                "absolute_import" => flags.absolute_import = true,
                "nested_scopes" => flags.nested_scopes = true,
                other => {
                    return Err(CompileError::syntax(
                        format!("future feature {other} is not defined"),
                        filename,
                        stmt.span,
                    ));
                }
            }
        }
        index += 1;
    }
    Ok(index)
}

/// Reject future imports anywhere past the prefix, including nested inside
/// compound statements.
fn check_placement(stmts: &[Stmt], filename: &Arc<str>) -> CompileResult<()> {
    for stmt in stmts {
        if is_future_import(stmt) {
            return Err(CompileError::syntax(
                "from __future__ imports must occur at the beginning of the file",
                filename,
                stmt.span,
            ));
        }
        match &stmt.kind {
            StmtKind::FunctionDef { body, .. } | StmtKind::ClassDef { body, .. } => {
                check_placement(body, filename)?;
            }
            StmtKind::For { body, orelse, .. }
            | StmtKind::While { body, orelse, .. }
            | StmtKind::If { body, orelse, .. } => {
                check_placement(body, filename)?;
                check_placement(orelse, filename)?;
            }
            StmtKind::With { body, .. } => check_placement(body, filename)?,
            StmtKind::TryExcept {
                body,
                handlers,
                orelse,
            } => {
                check_placement(body, filename)?;
                for handler in handlers {
                    check_placement(&handler.body, filename)?;
                }
                check_placement(orelse, filename)?;
            }
            StmtKind::TryFinally { body, finalbody } => {
                check_placement(body, filename)?;
                check_placement(finalbody, filename)?;
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Expr, ImportAlias, Span};

    fn span() -> Span {
        Span::at(1, 0)
    }

    fn future_import(features: &[&str]) -> Stmt {
        Stmt {
            kind: StmtKind::ImportFrom {
                module: "__future__".to_owned(),
                names: features
                    .iter()
                    .map(|f| ImportAlias {
                        name: (*f).to_owned(),
                        asname: None,
                    })
                    .collect(),
                level: 0,
            },
            span: span(),
        }
    }

    fn docstring() -> Stmt {
        Stmt {
            kind: StmtKind::Discard(Expr {
                kind: ExprKind::Const(Constant::Str("doc".to_owned())),
                span: span(),
            }),
            span: span(),
        }
    }

    fn pass_stmt() -> Stmt {
        Stmt {
            kind: StmtKind::Pass,
            span: span(),
        }
    }

    fn filename() -> Arc<str> {
        Arc::from("test.opal")
    }

    #[test]
    fn test_division_after_docstring() {
        let module = Module {
            body: vec![docstring(), future_import(&["division"]), pass_stmt()],
            node: 0,
        };
        let flags = scan(&module, &filename()).unwrap();
        assert!(flags.division);
        assert!(!flags.absolute_import);
        assert!(flags.code_flags().contains(CodeFlags::FUTURE_DIVISION));
    }

    #[test]
    fn test_multiple_contiguous_imports() {
        let module = Module {
            body: vec![
                future_import(&["division", "with_statement"]),
                future_import(&["absolute_import"]),
            ],
            node: 0,
        };
        let flags = scan(&module, &filename()).unwrap();
        assert!(flags.division && flags.with_statement && flags.absolute_import);
    }

    #[test]
    fn test_unknown_feature() {
        let module = Module {
            body: vec![future_import(&["braces"])],
            node: 0,
        };
        let err = scan(&module, &filename()).unwrap_err();
        assert_eq!(err.message(), "future feature braces is not defined");
    }

    #[test]
    fn test_star_import_rejected() {
        let module = Module {
            body: vec![future_import(&["*"])],
            node: 0,
        };
        let err = scan(&module, &filename()).unwrap_err();
        assert_eq!(err.message(), "future statement does not support import *");
    }

    #[test]
    fn test_misplaced_import_rejected() {
        let module = Module {
            body: vec![pass_stmt(), future_import(&["division"])],
            node: 0,
        };
        let err = scan(&module, &filename()).unwrap_err();
        assert_eq!(
            err.message(),
            "from __future__ imports must occur at the beginning of the file"
        );
    }

    #[test]
    fn test_nested_misplaced_import_rejected() {
        let module = Module {
            body: vec![Stmt {
                kind: StmtKind::If {
                    test: Expr {
                        kind: ExprKind::Const(Constant::Bool(true)),
                        span: span(),
                    },
                    body: vec![future_import(&["division"])],
                    orelse: vec![],
                },
                span: span(),
            }],
            node: 0,
        };
        assert!(scan(&module, &filename()).is_err());
    }

    #[test]
    fn test_docstring_only_module() {
        let module = Module {
            body: vec![docstring()],
            node: 0,
        };
        let flags = scan(&module, &filename()).unwrap();
        assert_eq!(flags, FutureFlags::default());
    }
}
