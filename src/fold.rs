//! AST-level constant folding.
//!
//! A functional rebuild pass that runs between the future scan and scope
//! resolution. Folding is strictly best-effort: any operation that would
//! raise at runtime (division by zero, bad operand types, negative shifts)
//! abandons that node and leaves it for the interpreter to evaluate.
//! Integer arithmetic promotes to arbitrary precision on overflow, and
//! results over a small size cap are kept as expressions so folding never
//! bloats the constant pool.

use num_bigint::BigInt;
use num_complex::Complex64;

use crate::ast::{
    BinOp, BoolOp, Expr, ExprKind, Module, Stmt, StmtKind, UnaryOp,
};
use crate::bytecode::Constant;
use crate::future::FutureFlags;

/// Folded results larger than this many tuple elements are abandoned.
const MAX_FOLD_ELEMS: usize = 20;
/// Folded strings longer than this are abandoned.
const MAX_FOLD_CHARS: usize = 64;

/// Fold every constant subexpression in the module.
pub fn fold_module(module: Module, futures: &FutureFlags) -> Module {
    let folder = Folder {
        true_division: futures.division,
    };
    Module {
        body: folder.fold_stmts(module.body),
        node: module.node,
    }
}

struct Folder {
    true_division: bool,
}

impl Folder {
    fn fold_stmts(&self, stmts: Vec<Stmt>) -> Vec<Stmt> {
        stmts.into_iter().map(|s| self.fold_stmt(s)).collect()
    }

    fn fold_stmt(&self, stmt: Stmt) -> Stmt {
        let span = stmt.span;
        let kind = match stmt.kind {
            StmtKind::FunctionDef {
                name,
                params,
                defaults,
                decorators,
                body,
                node,
            } => StmtKind::FunctionDef {
                name,
                params,
                defaults: self.fold_exprs(defaults),
                decorators: self.fold_exprs(decorators),
                body: self.fold_stmts(body),
                node,
            },
            StmtKind::ClassDef {
                name,
                bases,
                decorators,
                body,
                node,
            } => StmtKind::ClassDef {
                name,
                bases: self.fold_exprs(bases),
                decorators: self.fold_exprs(decorators),
                body: self.fold_stmts(body),
                node,
            },
            StmtKind::Return(value) => StmtKind::Return(value.map(|v| self.fold_expr(v))),
            StmtKind::Delete(targets) => StmtKind::Delete(targets),
            StmtKind::Assign { targets, value } => StmtKind::Assign {
                targets,
                value: self.fold_expr(value),
            },
            StmtKind::AugAssign { target, op, value } => StmtKind::AugAssign {
                target,
                op,
                value: self.fold_expr(value),
            },
            StmtKind::For {
                target,
                iter,
                body,
                orelse,
            } => StmtKind::For {
                target,
                iter: self.fold_loop_iterable(self.fold_expr(iter)),
                body: self.fold_stmts(body),
                orelse: self.fold_stmts(orelse),
            },
            StmtKind::While { test, body, orelse } => StmtKind::While {
                test: self.fold_expr(test),
                body: self.fold_stmts(body),
                orelse: self.fold_stmts(orelse),
            },
            StmtKind::If { test, body, orelse } => StmtKind::If {
                test: self.fold_expr(test),
                body: self.fold_stmts(body),
                orelse: self.fold_stmts(orelse),
            },
            StmtKind::With {
                context,
                target,
                body,
            } => StmtKind::With {
                context: self.fold_expr(context),
                target,
                body: self.fold_stmts(body),
            },
            StmtKind::Raise {
                exc,
                value,
                traceback,
            } => StmtKind::Raise {
                exc: exc.map(|e| self.fold_expr(e)),
                value: value.map(|e| self.fold_expr(e)),
                traceback: traceback.map(|e| self.fold_expr(e)),
            },
            StmtKind::TryExcept {
                body,
                handlers,
                orelse,
            } => StmtKind::TryExcept {
                body: self.fold_stmts(body),
                handlers: handlers
                    .into_iter()
                    .map(|mut handler| {
                        handler.typ = handler.typ.map(|t| self.fold_expr(t));
                        handler.body = self.fold_stmts(handler.body);
                        handler
                    })
                    .collect(),
                orelse: self.fold_stmts(orelse),
            },
            StmtKind::TryFinally { body, finalbody } => StmtKind::TryFinally {
                body: self.fold_stmts(body),
                finalbody: self.fold_stmts(finalbody),
            },
            StmtKind::Assert { test, msg } => StmtKind::Assert {
                test: self.fold_expr(test),
                msg: msg.map(|m| self.fold_expr(m)),
            },
            StmtKind::Discard(expr) => StmtKind::Discard(self.fold_expr(expr)),
            other => other,
        };
        Stmt { kind, span }
    }

    fn fold_exprs(&self, exprs: Vec<Expr>) -> Vec<Expr> {
        exprs.into_iter().map(|e| self.fold_expr(e)).collect()
    }

    fn fold_expr(&self, expr: Expr) -> Expr {
        let span = expr.span;
        let kind = match expr.kind {
            ExprKind::Binary { op, left, right } => {
                let left = Box::new(self.fold_expr(*left));
                let right = Box::new(self.fold_expr(*right));
                let folded = match (left.as_const(), right.as_const()) {
                    (Some(l), Some(r)) => self.eval_binary(op, l, r),
                    _ => None,
                };
                match folded {
                    Some(value) => ExprKind::Const(value),
                    None => ExprKind::Binary { op, left, right },
                }
            }
            ExprKind::Unary { op, operand } => {
                let operand = Box::new(self.fold_expr(*operand));
                // not (a is b) => a is not b; not (a in b) => a not in b
                if op == UnaryOp::Not {
                    if let ExprKind::Compare {
                        left,
                        ops,
                        comparators,
                    } = &operand.kind
                    {
                        if ops.len() == 1 {
                            if let Some(negated) = ops[0].negated() {
                                return Expr {
                                    kind: ExprKind::Compare {
                                        left: left.clone(),
                                        ops: vec![negated],
                                        comparators: comparators.clone(),
                                    },
                                    span,
                                };
                            }
                        }
                    }
                }
                let folded = operand.as_const().and_then(|value| eval_unary(op, value));
                match folded {
                    Some(value) => ExprKind::Const(value),
                    None => ExprKind::Unary { op, operand },
                }
            }
            ExprKind::Bool { op, values } => self.fold_bool(op, values),
            ExprKind::Tuple(items) => {
                let items = self.fold_exprs(items);
                if items.len() <= MAX_FOLD_ELEMS && items.iter().all(|i| i.as_const().is_some())
                {
                    let consts = items
                        .iter()
                        .filter_map(|i| i.as_const().cloned())
                        .collect();
                    ExprKind::Const(Constant::Tuple(consts))
                } else {
                    ExprKind::Tuple(items)
                }
            }
            ExprKind::List(items) => ExprKind::List(self.fold_exprs(items)),
            ExprKind::Dict(pairs) => ExprKind::Dict(
                pairs
                    .into_iter()
                    .map(|(k, v)| (self.fold_expr(k), self.fold_expr(v)))
                    .collect(),
            ),
            ExprKind::Compare {
                left,
                ops,
                comparators,
            } => ExprKind::Compare {
                left: Box::new(self.fold_expr(*left)),
                ops,
                comparators: self.fold_exprs(comparators),
            },
            ExprKind::Lambda {
                params,
                defaults,
                body,
                node,
            } => ExprKind::Lambda {
                params,
                defaults: self.fold_exprs(defaults),
                body: Box::new(self.fold_expr(*body)),
                node,
            },
            ExprKind::IfExp { test, body, orelse } => ExprKind::IfExp {
                test: Box::new(self.fold_expr(*test)),
                body: Box::new(self.fold_expr(*body)),
                orelse: Box::new(self.fold_expr(*orelse)),
            },
            ExprKind::Call {
                func,
                args,
                keywords,
                star_args,
                kw_args,
            } => ExprKind::Call {
                func: Box::new(self.fold_expr(*func)),
                args: self.fold_exprs(args),
                keywords: keywords
                    .into_iter()
                    .map(|(name, value)| (name, self.fold_expr(value)))
                    .collect(),
                star_args: star_args.map(|e| Box::new(self.fold_expr(*e))),
                kw_args: kw_args.map(|e| Box::new(self.fold_expr(*e))),
            },
            ExprKind::Attribute { value, attr } => ExprKind::Attribute {
                value: Box::new(self.fold_expr(*value)),
                attr,
            },
            ExprKind::Subscript { value, index } => ExprKind::Subscript {
                value: Box::new(self.fold_expr(*value)),
                index: Box::new(self.fold_expr(*index)),
            },
            ExprKind::Slice { lower, upper, step } => ExprKind::Slice {
                lower: lower.map(|e| Box::new(self.fold_expr(*e))),
                upper: upper.map(|e| Box::new(self.fold_expr(*e))),
                step: step.map(|e| Box::new(self.fold_expr(*e))),
            },
            ExprKind::ListComp {
                element,
                generators,
            } => ExprKind::ListComp {
                element: Box::new(self.fold_expr(*element)),
                generators: generators
                    .into_iter()
                    .map(|mut gen| {
                        gen.iter = self.fold_expr(gen.iter);
                        gen.ifs = self.fold_exprs(gen.ifs);
                        gen
                    })
                    .collect(),
            },
            ExprKind::GenExp {
                element,
                generators,
                node,
            } => ExprKind::GenExp {
                element: Box::new(self.fold_expr(*element)),
                generators: generators
                    .into_iter()
                    .map(|mut gen| {
                        gen.iter = self.fold_expr(gen.iter);
                        gen.ifs = self.fold_exprs(gen.ifs);
                        gen
                    })
                    .collect(),
                node,
            },
            ExprKind::Yield(value) => {
                ExprKind::Yield(value.map(|v| Box::new(self.fold_expr(*v))))
            }
            other @ (ExprKind::Const(_) | ExprKind::Name(_)) => other,
        };
        Expr { kind, span }
    }

    /// `for` iterates a literal list exactly like a tuple, and a tuple
    /// constant avoids rebuilding the list on every execution.
    fn fold_loop_iterable(&self, iter: Expr) -> Expr {
        if let ExprKind::List(items) = &iter.kind {
            if items.len() <= MAX_FOLD_ELEMS && items.iter().all(|i| i.as_const().is_some()) {
                let consts = items
                    .iter()
                    .filter_map(|i| i.as_const().cloned())
                    .collect();
                return Expr {
                    kind: ExprKind::Const(Constant::Tuple(consts)),
                    span: iter.span,
                };
            }
        }
        iter
    }

    /// Drop decisive constant operands of `and`/`or`. An operand whose truth
    /// cannot change the outcome is removed; one that decides the outcome
    /// truncates everything after it.
    fn fold_bool(&self, op: BoolOp, values: Vec<Expr>) -> ExprKind {
        let mut kept: Vec<Expr> = Vec::with_capacity(values.len());
        let total = values.len();
        for (position, value) in values.into_iter().enumerate() {
            let value = self.fold_expr(value);
            let is_last = position + 1 == total;
            if let Some(constant) = value.as_const() {
                let truth = constant.truth();
                let decisive = match op {
                    BoolOp::And => !truth,
                    BoolOp::Or => truth,
                };
                if decisive {
                    kept.push(value);
                    break;
                }
                if !is_last {
                    continue;
                }
            }
            kept.push(value);
        }
        if kept.len() == 1 {
            match kept.pop() {
                Some(only) => only.kind,
                None => ExprKind::Bool { op, values: kept },
            }
        } else {
            ExprKind::Bool { op, values: kept }
        }
    }

    fn eval_binary(&self, op: BinOp, left: &Constant, right: &Constant) -> Option<Constant> {
        match (left, right) {
            (Constant::Int(a), Constant::Int(b)) => self.eval_int(op, *a, *b),
            (Constant::Float(a), Constant::Float(b)) => eval_float(op, *a, *b),
            (Constant::Int(a), Constant::Float(b)) => eval_float(op, *a as f64, *b),
            (Constant::Float(a), Constant::Int(b)) => eval_float(op, *a, *b as f64),
            (Constant::Long(a), Constant::Long(b)) => eval_long(op, a, b),
            (Constant::Long(a), Constant::Int(b)) => eval_long(op, a, &BigInt::from(*b)),
            (Constant::Int(a), Constant::Long(b)) => eval_long(op, &BigInt::from(*a), b),
            (Constant::Complex(a), Constant::Complex(b)) => eval_complex(op, *a, *b),
            (Constant::Int(a), Constant::Complex(b)) => {
                eval_complex(op, Complex64::new(*a as f64, 0.0), *b)
            }
            (Constant::Float(a), Constant::Complex(b)) => {
                eval_complex(op, Complex64::new(*a, 0.0), *b)
            }
            (Constant::Complex(a), Constant::Int(b)) => {
                eval_complex(op, *a, Complex64::new(*b as f64, 0.0))
            }
            (Constant::Complex(a), Constant::Float(b)) => {
                eval_complex(op, *a, Complex64::new(*b, 0.0))
            }
            (Constant::Str(a), Constant::Str(b)) if op == BinOp::Add => {
                if a.len() + b.len() > MAX_FOLD_CHARS {
                    return None;
                }
                let mut joined = String::with_capacity(a.len() + b.len());
                joined.push_str(a);
                joined.push_str(b);
                Some(Constant::Str(joined))
            }
            (Constant::Tuple(a), Constant::Tuple(b)) if op == BinOp::Add => {
                if a.len() + b.len() > MAX_FOLD_ELEMS {
                    return None;
                }
                let mut joined = a.clone();
                joined.extend(b.iter().cloned());
                Some(Constant::Tuple(joined))
            }
            _ => None,
        }
    }

    fn eval_int(&self, op: BinOp, a: i64, b: i64) -> Option<Constant> {
        let promoted = || eval_long(op, &BigInt::from(a), &BigInt::from(b));
        match op {
            BinOp::Add => a.checked_add(b).map(Constant::Int).or_else(promoted),
            BinOp::Sub => a.checked_sub(b).map(Constant::Int).or_else(promoted),
            BinOp::Mul => a.checked_mul(b).map(Constant::Int).or_else(promoted),
            BinOp::Div => {
                if self.true_division {
                    if b == 0 {
                        return None;
                    }
                    Some(Constant::Float(a as f64 / b as f64))
                } else {
                    floor_div(a, b).map(Constant::Int)
                }
            }
            BinOp::FloorDiv => floor_div(a, b).map(Constant::Int),
            BinOp::Mod => floor_mod(a, b).map(Constant::Int),
            BinOp::Pow => {
                if b < 0 {
                    // negative exponents produce floats; left unfolded to
                    // keep classic/true division questions out of it
                    return None;
                }
                let exponent = u32::try_from(b).ok()?;
                match a.checked_pow(exponent) {
                    Some(value) => Some(Constant::Int(value)),
                    None => Some(Constant::Long(BigInt::from(a).pow(exponent))),
                }
            }
            BinOp::LShift => {
                let shift = u32::try_from(b).ok()?;
                match a.checked_shl(shift).filter(|v| (v >> shift) == a) {
                    Some(value) => Some(Constant::Int(value)),
                    None => Some(Constant::Long(BigInt::from(a) << shift as usize)),
                }
            }
            BinOp::RShift => {
                let shift = u32::try_from(b).ok()?;
                if shift >= 64 {
                    Some(Constant::Int(if a < 0 { -1 } else { 0 }))
                } else {
                    Some(Constant::Int(a >> shift))
                }
            }
            BinOp::BitAnd => Some(Constant::Int(a & b)),
            BinOp::BitOr => Some(Constant::Int(a | b)),
            BinOp::BitXor => Some(Constant::Int(a ^ b)),
        }
    }
}

/// Floor division with the sign rules of the source language: the result
/// rounds toward negative infinity.
fn floor_div(a: i64, b: i64) -> Option<i64> {
    if b == 0 {
        return None;
    }
    let quotient = a.checked_div(b)?;
    if (a % b != 0) && ((a < 0) != (b < 0)) {
        quotient.checked_sub(1)
    } else {
        Some(quotient)
    }
}

/// Remainder whose sign follows the divisor.
fn floor_mod(a: i64, b: i64) -> Option<i64> {
    if b == 0 {
        return None;
    }
    let remainder = a.checked_rem(b)?;
    if remainder != 0 && ((remainder < 0) != (b < 0)) {
        remainder.checked_add(b)
    } else {
        Some(remainder)
    }
}

fn eval_long(op: BinOp, a: &BigInt, b: &BigInt) -> Option<Constant> {
    // only the closed operations; division questions stay at runtime
    let value = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::BitAnd => a & b,
        BinOp::BitOr => a | b,
        BinOp::BitXor => a ^ b,
        _ => return None,
    };
    Some(Constant::Long(value))
}

fn eval_float(op: BinOp, a: f64, b: f64) -> Option<Constant> {
    let value = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => {
            if b == 0.0 {
                return None;
            }
            a / b
        }
        BinOp::FloorDiv => {
            if b == 0.0 {
                return None;
            }
            (a / b).floor()
        }
        BinOp::Mod => {
            if b == 0.0 {
                return None;
            }
            let remainder = a % b;
            if remainder != 0.0 && (remainder < 0.0) != (b < 0.0) {
                remainder + b
            } else {
                remainder
            }
        }
        BinOp::Pow => {
            // a complex result or a zero-division error; both belong to
            // the interpreter
            if a < 0.0 && b.fract() != 0.0 {
                return None;
            }
            if a == 0.0 && b < 0.0 {
                return None;
            }
            a.powf(b)
        }
        _ => return None,
    };
    Some(Constant::Float(value))
}

fn eval_complex(op: BinOp, a: Complex64, b: Complex64) -> Option<Constant> {
    let value = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => {
            if b.re == 0.0 && b.im == 0.0 {
                return None;
            }
            a / b
        }
        _ => return None,
    };
    Some(Constant::Complex(value))
}

fn eval_unary(op: UnaryOp, value: &Constant) -> Option<Constant> {
    match op {
        UnaryOp::Not => Some(Constant::Bool(!value.truth())),
        UnaryOp::Minus => match value {
            Constant::Int(i) => match i.checked_neg() {
                Some(negated) => Some(Constant::Int(negated)),
                None => Some(Constant::Long(-BigInt::from(*i))),
            },
            Constant::Long(l) => Some(Constant::Long(-l)),
            Constant::Float(f) => Some(Constant::Float(-f)),
            Constant::Complex(c) => Some(Constant::Complex(-c)),
            _ => None,
        },
        UnaryOp::Plus => match value {
            Constant::Int(_) | Constant::Long(_) | Constant::Float(_) | Constant::Complex(_) => {
                Some(value.clone())
            }
            _ => None,
        },
        UnaryOp::Invert => match value {
            Constant::Int(i) => i.checked_neg()?.checked_sub(1).map(Constant::Int),
            Constant::Long(l) => Some(Constant::Long(-(l + 1u32))),
            _ => None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Span;

    fn folder() -> Folder {
        Folder {
            true_division: false,
        }
    }

    fn span() -> Span {
        Span::at(1, 0)
    }

    fn int(i: i64) -> Expr {
        Expr {
            kind: ExprKind::Const(Constant::Int(i)),
            span: span(),
        }
    }

    fn name(n: &str) -> Expr {
        Expr {
            kind: ExprKind::Name(n.to_owned()),
            span: span(),
        }
    }

    fn binary(op: BinOp, left: Expr, right: Expr) -> Expr {
        Expr {
            kind: ExprKind::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            },
            span: span(),
        }
    }

    #[test]
    fn test_fold_nested_arithmetic() {
        // 2 + 3 * 4 => 14
        let expr = binary(BinOp::Add, int(2), binary(BinOp::Mul, int(3), int(4)));
        let folded = folder().fold_expr(expr);
        assert_eq!(folded.as_const(), Some(&Constant::Int(14)));
    }

    #[test]
    fn test_division_by_zero_left_alone() {
        let expr = binary(BinOp::Div, int(1), int(0));
        let folded = folder().fold_expr(expr);
        assert!(matches!(folded.kind, ExprKind::Binary { .. }));
    }

    #[test]
    fn test_classic_vs_true_division() {
        let classic = folder().fold_expr(binary(BinOp::Div, int(7), int(2)));
        assert_eq!(classic.as_const(), Some(&Constant::Int(3)));

        let truediv = Folder {
            true_division: true,
        }
        .fold_expr(binary(BinOp::Div, int(7), int(2)));
        assert_eq!(truediv.as_const(), Some(&Constant::Float(3.5)));
    }

    #[test]
    fn test_floor_division_rounds_toward_negative() {
        let folded = folder().fold_expr(binary(BinOp::FloorDiv, int(-7), int(2)));
        assert_eq!(folded.as_const(), Some(&Constant::Int(-4)));
        let folded = folder().fold_expr(binary(BinOp::Mod, int(-7), int(2)));
        assert_eq!(folded.as_const(), Some(&Constant::Int(1)));
    }

    #[test]
    fn test_overflow_promotes_to_long() {
        let expr = binary(BinOp::Mul, int(i64::MAX), int(2));
        let folded = folder().fold_expr(expr);
        assert_eq!(
            folded.as_const(),
            Some(&Constant::Long(BigInt::from(i64::MAX) * 2))
        );
    }

    #[test]
    fn test_string_concat_with_cap() {
        let short = binary(
            BinOp::Add,
            Expr {
                kind: ExprKind::Const(Constant::Str("ab".to_owned())),
                span: span(),
            },
            Expr {
                kind: ExprKind::Const(Constant::Str("cd".to_owned())),
                span: span(),
            },
        );
        let folded = folder().fold_expr(short);
        assert_eq!(folded.as_const(), Some(&Constant::Str("abcd".to_owned())));

        let long = binary(
            BinOp::Add,
            Expr {
                kind: ExprKind::Const(Constant::Str("x".repeat(60))),
                span: span(),
            },
            Expr {
                kind: ExprKind::Const(Constant::Str("y".repeat(60))),
                span: span(),
            },
        );
        assert!(matches!(
            folder().fold_expr(long).kind,
            ExprKind::Binary { .. }
        ));
    }

    #[test]
    fn test_const_tuple_display() {
        let expr = Expr {
            kind: ExprKind::Tuple(vec![int(1), int(2), int(3)]),
            span: span(),
        };
        let folded = folder().fold_expr(expr);
        assert_eq!(
            folded.as_const(),
            Some(&Constant::Tuple(vec![
                Constant::Int(1),
                Constant::Int(2),
                Constant::Int(3)
            ]))
        );
    }

    #[test]
    fn test_tuple_with_name_left_alone() {
        let expr = Expr {
            kind: ExprKind::Tuple(vec![int(1), name("x")]),
            span: span(),
        };
        assert!(matches!(
            folder().fold_expr(expr).kind,
            ExprKind::Tuple(_)
        ));
    }

    #[test]
    fn test_not_in_rewrite() {
        // not (a in b) => a not in b
        let expr = Expr {
            kind: ExprKind::Unary {
                op: UnaryOp::Not,
                operand: Box::new(Expr {
                    kind: ExprKind::Compare {
                        left: Box::new(name("a")),
                        ops: vec![crate::ast::CmpOp::In],
                        comparators: vec![name("b")],
                    },
                    span: span(),
                }),
            },
            span: span(),
        };
        let folded = folder().fold_expr(expr);
        match folded.kind {
            ExprKind::Compare { ops, .. } => assert_eq!(ops, vec![crate::ast::CmpOp::NotIn]),
            other => panic!("expected rewritten compare, got {other:?}"),
        }
    }

    #[test]
    fn test_not_equals_not_rewritten() {
        // rich comparisons are not negatable
        let expr = Expr {
            kind: ExprKind::Unary {
                op: UnaryOp::Not,
                operand: Box::new(Expr {
                    kind: ExprKind::Compare {
                        left: Box::new(name("a")),
                        ops: vec![crate::ast::CmpOp::Eq],
                        comparators: vec![name("b")],
                    },
                    span: span(),
                }),
            },
            span: span(),
        };
        assert!(matches!(
            folder().fold_expr(expr).kind,
            ExprKind::Unary { .. }
        ));
    }

    #[test]
    fn test_and_drops_true_operands() {
        // True and x and 0 and y  =>  x and 0
        let expr = Expr {
            kind: ExprKind::Bool {
                op: BoolOp::And,
                values: vec![
                    Expr {
                        kind: ExprKind::Const(Constant::Bool(true)),
                        span: span(),
                    },
                    name("x"),
                    int(0),
                    name("y"),
                ],
            },
            span: span(),
        };
        match folder().fold_expr(expr).kind {
            ExprKind::Bool { values, .. } => {
                assert_eq!(values.len(), 2);
                assert!(matches!(&values[0].kind, ExprKind::Name(n) if n == "x"));
                assert_eq!(values[1].as_const(), Some(&Constant::Int(0)));
            }
            other => panic!("expected bool expr, got {other:?}"),
        }
    }

    #[test]
    fn test_or_collapses_to_single_operand() {
        // 0 or x  =>  x
        let expr = Expr {
            kind: ExprKind::Bool {
                op: BoolOp::Or,
                values: vec![int(0), name("x")],
            },
            span: span(),
        };
        assert!(matches!(
            folder().fold_expr(expr).kind,
            ExprKind::Name(n) if n == "x"
        ));
    }

    #[test]
    fn test_loop_iterable_list_becomes_tuple() {
        let module = Module {
            body: vec![Stmt {
                kind: StmtKind::For {
                    target: name("i"),
                    iter: Expr {
                        kind: ExprKind::List(vec![int(1), int(2)]),
                        span: span(),
                    },
                    body: vec![Stmt {
                        kind: StmtKind::Pass,
                        span: span(),
                    }],
                    orelse: vec![],
                },
                span: span(),
            }],
            node: 0,
        };
        let folded = fold_module(module, &FutureFlags::default());
        match &folded.body[0].kind {
            StmtKind::For { iter, .. } => {
                assert_eq!(
                    iter.as_const(),
                    Some(&Constant::Tuple(vec![Constant::Int(1), Constant::Int(2)]))
                );
            }
            other => panic!("expected for statement, got {other:?}"),
        }
    }

    #[test]
    fn test_unary_minus_and_invert() {
        let folded = folder().fold_expr(Expr {
            kind: ExprKind::Unary {
                op: UnaryOp::Minus,
                operand: Box::new(int(5)),
            },
            span: span(),
        });
        assert_eq!(folded.as_const(), Some(&Constant::Int(-5)));

        let folded = folder().fold_expr(Expr {
            kind: ExprKind::Unary {
                op: UnaryOp::Invert,
                operand: Box::new(int(5)),
            },
            span: span(),
        });
        assert_eq!(folded.as_const(), Some(&Constant::Int(-6)));
    }

    #[test]
    fn test_negative_power_left_alone() {
        let expr = binary(BinOp::Pow, int(2), int(-1));
        assert!(matches!(
            folder().fold_expr(expr).kind,
            ExprKind::Binary { .. }
        ));
    }

    #[test]
    fn test_invert_of_long_constant() {
        let expr = Expr {
            kind: ExprKind::Unary {
                op: UnaryOp::Invert,
                operand: Box::new(Expr {
                    kind: ExprKind::Const(Constant::Long(BigInt::from(5))),
                    span: span(),
                }),
            },
            span: span(),
        };
        let folded = folder().fold_expr(expr);
        assert_eq!(
            folded.as_const(),
            Some(&Constant::Long(BigInt::from(-6)))
        );
    }

    fn float(f: f64) -> Expr {
        Expr {
            kind: ExprKind::Const(Constant::Float(f)),
            span: span(),
        }
    }

    #[test]
    fn test_float_power_with_complex_result_left_alone() {
        // (-2.0) ** 0.5 raises at runtime, so it must not fold to NaN
        let expr = binary(BinOp::Pow, float(-2.0), float(0.5));
        assert!(matches!(
            folder().fold_expr(expr).kind,
            ExprKind::Binary { .. }
        ));
    }

    #[test]
    fn test_zero_to_negative_float_power_left_alone() {
        // 0.0 ** -1.0 divides by zero at runtime
        let expr = binary(BinOp::Pow, float(0.0), float(-1.0));
        assert!(matches!(
            folder().fold_expr(expr).kind,
            ExprKind::Binary { .. }
        ));

        // the happy path still folds
        let folded = folder().fold_expr(binary(BinOp::Pow, float(2.0), float(3.0)));
        assert_eq!(folded.as_const(), Some(&Constant::Float(8.0)));
    }
}
