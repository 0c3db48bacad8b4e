//! Abstract syntax tree consumed by the compiler.
//!
//! The AST is produced by an external parser; this module defines the shape
//! the compiler expects at that boundary. Statements and expressions carry a
//! source [`Span`] used for error reporting and the position table. Nodes
//! that introduce a new lexical scope (functions, lambdas, classes, generator
//! expressions, the module itself) carry a [`NodeId`] that the scope resolver
//! maps to its [`Scope`](crate::scope::Scope).

use crate::bytecode::Constant;

/// Identifier assigned by the parser to every scope-introducing node.
pub type NodeId = u32;

/// A source region: 1-based line numbers, 0-based column offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub lineno: u32,
    pub end_lineno: u32,
    pub col: u32,
    pub end_col: u32,
}

impl Span {
    pub fn new(lineno: u32, end_lineno: u32, col: u32, end_col: u32) -> Span {
        Span {
            lineno,
            end_lineno,
            col,
            end_col,
        }
    }

    /// A zero-width span at a single point.
    pub fn at(lineno: u32, col: u32) -> Span {
        Span {
            lineno,
            end_lineno: lineno,
            col,
            end_col: col,
        }
    }
}

/// A whole compilation unit.
#[derive(Debug, Clone, PartialEq)]
pub struct Module {
    pub body: Vec<Stmt>,
    pub node: NodeId,
}

// ============================================================================
// Statements
// ============================================================================

/// A statement with its source span.
#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub kind: StmtKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    /// `def name(params): body`, possibly decorated.
    FunctionDef {
        name: String,
        params: Params,
        defaults: Vec<Expr>,
        decorators: Vec<Expr>,
        body: Vec<Stmt>,
        node: NodeId,
    },

    /// `class name(bases): body`, possibly decorated.
    ClassDef {
        name: String,
        bases: Vec<Expr>,
        decorators: Vec<Expr>,
        body: Vec<Stmt>,
        node: NodeId,
    },

    /// `return [value]`.
    Return(Option<Expr>),

    /// `del target, ...`.
    Delete(Vec<Expr>),

    /// `target = ... = value`. Multiple targets share one value.
    Assign { targets: Vec<Expr>, value: Expr },

    /// `target op= value`.
    AugAssign {
        target: Expr,
        op: BinOp,
        value: Expr,
    },

    /// `for target in iter: body [else: orelse]`.
    For {
        target: Expr,
        iter: Expr,
        body: Vec<Stmt>,
        orelse: Vec<Stmt>,
    },

    /// `while test: body [else: orelse]`.
    While {
        test: Expr,
        body: Vec<Stmt>,
        orelse: Vec<Stmt>,
    },

    /// `if test: body [else: orelse]`. `elif` chains nest in `orelse`.
    If {
        test: Expr,
        body: Vec<Stmt>,
        orelse: Vec<Stmt>,
    },

    /// `with context [as target]: body`.
    With {
        context: Expr,
        target: Option<Expr>,
        body: Vec<Stmt>,
    },

    /// `raise [exc [, value [, traceback]]]`.
    Raise {
        exc: Option<Expr>,
        value: Option<Expr>,
        traceback: Option<Expr>,
    },

    /// `try: body except ...: ... [else: orelse]`.
    TryExcept {
        body: Vec<Stmt>,
        handlers: Vec<ExceptHandler>,
        orelse: Vec<Stmt>,
    },

    /// `try: body finally: finalbody`.
    TryFinally {
        body: Vec<Stmt>,
        finalbody: Vec<Stmt>,
    },

    /// `assert test [, msg]`.
    Assert { test: Expr, msg: Option<Expr> },

    /// `import a.b as c, d`.
    Import(Vec<ImportAlias>),

    /// `from module import name as alias, ...`. `level` counts leading dots.
    ImportFrom {
        module: String,
        names: Vec<ImportAlias>,
        level: u32,
    },

    /// `global name, ...`.
    Global(Vec<String>),

    /// An expression evaluated for its side effects; the result is discarded.
    Discard(Expr),

    Pass,
    Break,
    Continue,
}

/// One `name [as asname]` clause of an import statement.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportAlias {
    pub name: String,
    pub asname: Option<String>,
}

/// One `except [type [, target]]: body` clause.
#[derive(Debug, Clone, PartialEq)]
pub struct ExceptHandler {
    pub typ: Option<Expr>,
    pub target: Option<Expr>,
    pub body: Vec<Stmt>,
    pub span: Span,
}

/// Formal parameter list of a function or lambda.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Params {
    pub params: Vec<Param>,
    pub vararg: Option<String>,
    pub kwarg: Option<String>,
}

/// A single positional parameter: a plain name, or a nested tuple pattern
/// unpacked at function entry.
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    Name(String),
    Tuple(Vec<Param>),
}

// ============================================================================
// Expressions
// ============================================================================

/// An expression with its source span.
#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    /// A literal or folded constant value.
    Const(Constant),

    /// A bare identifier.
    Name(String),

    Tuple(Vec<Expr>),
    List(Vec<Expr>),
    Dict(Vec<(Expr, Expr)>),

    /// `left op right`.
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },

    /// `op operand`.
    Unary { op: UnaryOp, operand: Box<Expr> },

    /// `a and b and c` / `a or b`; short-circuiting, two or more operands.
    Bool { op: BoolOp, values: Vec<Expr> },

    /// `left op0 c0 op1 c1 ...` comparison chain.
    Compare {
        left: Box<Expr>,
        ops: Vec<CmpOp>,
        comparators: Vec<Expr>,
    },

    /// `lambda params: body`.
    Lambda {
        params: Params,
        defaults: Vec<Expr>,
        body: Box<Expr>,
        node: NodeId,
    },

    /// `body if test else orelse`.
    IfExp {
        test: Box<Expr>,
        body: Box<Expr>,
        orelse: Box<Expr>,
    },

    /// `func(args, kw=..., *star, **dstar)`.
    Call {
        func: Box<Expr>,
        args: Vec<Expr>,
        keywords: Vec<(String, Expr)>,
        star_args: Option<Box<Expr>>,
        kw_args: Option<Box<Expr>>,
    },

    /// `value.attr`.
    Attribute { value: Box<Expr>, attr: String },

    /// `value[index]`.
    Subscript { value: Box<Expr>, index: Box<Expr> },

    /// `lower:upper[:step]` inside a subscript.
    Slice {
        lower: Option<Box<Expr>>,
        upper: Option<Box<Expr>>,
        step: Option<Box<Expr>>,
    },

    /// `[element for target in iter if cond ...]`.
    ListComp {
        element: Box<Expr>,
        generators: Vec<Comprehension>,
    },

    /// `(element for target in iter ...)`; compiles to a nested generator
    /// scope whose single parameter is the pre-evaluated outermost iterable.
    GenExp {
        element: Box<Expr>,
        generators: Vec<Comprehension>,
        node: NodeId,
    },

    /// `yield [value]`.
    Yield(Option<Box<Expr>>),
}

/// One `for target in iter [if cond ...]` clause of a comprehension.
#[derive(Debug, Clone, PartialEq)]
pub struct Comprehension {
    pub target: Expr,
    pub iter: Expr,
    pub ifs: Vec<Expr>,
}

// ============================================================================
// Operators
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
    LShift,
    RShift,
    BitAnd,
    BitOr,
    BitXor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Plus,
    Minus,
    Not,
    Invert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoolOp {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    NotEq,
    Lt,
    LtE,
    Gt,
    GtE,
    Is,
    IsNot,
    In,
    NotIn,
}

impl CmpOp {
    /// The negation of an identity or membership test. Rich comparisons are
    /// not safely negatable (user types may implement them independently).
    pub fn negated(self) -> Option<CmpOp> {
        match self {
            CmpOp::Is => Some(CmpOp::IsNot),
            CmpOp::IsNot => Some(CmpOp::Is),
            CmpOp::In => Some(CmpOp::NotIn),
            CmpOp::NotIn => Some(CmpOp::In),
            _ => None,
        }
    }
}

impl Expr {
    /// The constant value of this expression, if it is one.
    pub fn as_const(&self) -> Option<&Constant> {
        match &self.kind {
            ExprKind::Const(value) => Some(value),
            _ => None,
        }
    }

    /// Short description of the expression kind, used in error messages
    /// about invalid assignment or deletion targets.
    pub fn describe(&self) -> &'static str {
        match &self.kind {
            ExprKind::Const(_) => "literal",
            ExprKind::Name(_) => "name",
            ExprKind::Tuple(_) => "tuple",
            ExprKind::List(_) => "list",
            ExprKind::Dict(_) => "dict display",
            ExprKind::Binary { .. } | ExprKind::Unary { .. } => "operator",
            ExprKind::Bool { .. } => "boolean operation",
            ExprKind::Compare { .. } => "comparison",
            ExprKind::Lambda { .. } => "lambda",
            ExprKind::IfExp { .. } => "conditional expression",
            ExprKind::Call { .. } => "function call",
            ExprKind::Attribute { .. } => "attribute",
            ExprKind::Subscript { .. } => "subscript",
            ExprKind::Slice { .. } => "slice",
            ExprKind::ListComp { .. } => "list comprehension",
            ExprKind::GenExp { .. } => "generator expression",
            ExprKind::Yield(_) => "yield expression",
        }
    }
}

impl Params {
    /// True if the list is completely empty.
    pub fn is_empty(&self) -> bool {
        self.params.is_empty() && self.vararg.is_none() && self.kwarg.is_none()
    }
}
