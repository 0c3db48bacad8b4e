//! Compilation error types.
//!
//! Two failure classes exist: user-facing syntax errors that carry a source
//! position, and internal errors that indicate a bug in the compiler itself
//! (a violated assembler invariant, an impossible stack depth). The constant
//! folder never reports errors at all; a fold that would fail is abandoned.

use std::fmt;
use std::sync::Arc;

use crate::ast::Span;

/// Result type used throughout the compiler.
pub type CompileResult<T> = Result<T, CompileError>;

/// An error produced during compilation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    /// A problem in the user's program. Equivalent to a `SyntaxError` raised
    /// by the host language: carries the filename and source position.
    Syntax {
        message: String,
        filename: Arc<str>,
        lineno: u32,
        offset: u32,
    },

    /// An assembler or resolver invariant was violated. This is a compiler
    /// bug, not a problem with the input program.
    Internal { message: String },
}

impl CompileError {
    /// Create a user-facing syntax error at the given source span.
    pub fn syntax(message: impl Into<String>, filename: &Arc<str>, span: Span) -> CompileError {
        CompileError::Syntax {
            message: message.into(),
            filename: Arc::clone(filename),
            lineno: span.lineno,
            offset: span.col,
        }
    }

    /// Create an internal compiler error.
    pub fn internal(message: impl Into<String>) -> CompileError {
        CompileError::Internal {
            message: message.into(),
        }
    }

    /// True if this is a user-facing syntax error.
    pub fn is_syntax(&self) -> bool {
        matches!(self, CompileError::Syntax { .. })
    }

    /// The error message without position information.
    pub fn message(&self) -> &str {
        match self {
            CompileError::Syntax { message, .. } => message,
            CompileError::Internal { message } => message,
        }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileError::Syntax {
                message,
                filename,
                lineno,
                offset,
            } => write!(f, "{filename}:{lineno}:{offset}: {message}"),
            CompileError::Internal { message } => {
                write!(f, "internal compiler error: {message}")
            }
        }
    }
}

impl std::error::Error for CompileError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_syntax_error_display() {
        let filename: Arc<str> = Arc::from("test.opal");
        let err = CompileError::syntax("'break' outside loop", &filename, Span::at(3, 4));
        assert_eq!(err.to_string(), "test.opal:3:4: 'break' outside loop");
        assert!(err.is_syntax());
    }

    #[test]
    fn test_internal_error_display() {
        let err = CompileError::internal("label 7 never placed");
        assert_eq!(
            err.to_string(),
            "internal compiler error: label 7 never placed"
        );
        assert!(!err.is_syntax());
    }
}
