//! Error types for every pipeline stage, plus rich source reporting.
//!
//! Each stage fails with its own enum so callers can tell a lexing
//! problem from a resolver problem without string matching. The
//! top-level [`Error`] wraps them all; [`SourceError`] renders any of
//! them through miette with the offending source underlined.
//!
//! Machine failures are a separate [`RuntimeError`] and never share a
//! variant with compile-time errors.

use crate::token::Span;
use miette::{Diagnostic, SourceSpan};
use thiserror::Error;

/// Tokenization failure.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LexError {
    #[error("unterminated {kind} literal '{text}' at line {line}, token {index}")]
    Literal {
        kind: &'static str,
        text: String,
        line: usize,
        index: usize,
        span: Span,
    },

    #[error("unterminated string literal at line {line}, token {index}")]
    UnterminatedString { line: usize, index: usize, span: Span },

    #[error("unrecognised character '{ch}' at line {line}, token {index}")]
    UnexpectedChar {
        ch: char,
        line: usize,
        index: usize,
        span: Span,
    },

    #[error("unbalanced '{bracket}' at line {line}")]
    UnbalancedBracket {
        bracket: String,
        line: usize,
        span: Span,
    },
}

impl LexError {
    pub fn span(&self) -> Span {
        match self {
            LexError::Literal { span, .. }
            | LexError::UnterminatedString { span, .. }
            | LexError::UnexpectedChar { span, .. }
            | LexError::UnbalancedBracket { span, .. } => *span,
        }
    }
}

/// Grammar failure. `found` holds the remaining token run.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("expected {expected}, found {found}")]
    Expected {
        expected: String,
        found: String,
        span: Span,
    },

    #[error("invalid primary expression at {found}")]
    InvalidPrimary { found: String, span: Span },

    #[error("invalid tuple field '{field}'")]
    InvalidField { field: String, span: Span },

    #[error("invalid type expression '{tokens}'")]
    InvalidType { tokens: String, span: Span },

    #[error("unexpected tokens after statement: {rest}")]
    Trailing { rest: String, span: Span },
}

impl ParseError {
    pub fn span(&self) -> Span {
        match self {
            ParseError::Expected { span, .. }
            | ParseError::InvalidPrimary { span, .. }
            | ParseError::InvalidField { span, .. }
            | ParseError::InvalidType { span, .. }
            | ParseError::Trailing { span, .. } => *span,
        }
    }
}

/// Failure raised by the resolver, or by the generator when it meets a
/// program the resolver should have rejected.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SemanticError {
    #[error("unknown identifier '{name}'")]
    UnknownIdentifier { name: String, span: Span },

    #[error("unknown type '{name}'")]
    UnknownType { name: String, span: Span },

    #[error("unknown function #{id}")]
    UnknownFunction { id: usize, span: Span },

    #[error("{kind} '{name}' is already declared")]
    Redeclaration {
        kind: &'static str,
        name: String,
        span: Span,
    },

    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: String,
        found: String,
        span: Span,
    },

    #[error("function #{id} takes {input} but declares {labels} parameter label(s)")]
    InvalidArguments {
        id: usize,
        input: String,
        labels: usize,
        span: Span,
    },

    #[error("'?' expects a tuple of two branches")]
    InvalidControl { span: Span },

    #[error("function composition was not desugared")]
    UnresolvedComposition { span: Span },
}

impl SemanticError {
    pub fn span(&self) -> Span {
        match self {
            SemanticError::UnknownIdentifier { span, .. }
            | SemanticError::UnknownType { span, .. }
            | SemanticError::UnknownFunction { span, .. }
            | SemanticError::Redeclaration { span, .. }
            | SemanticError::TypeMismatch { span, .. }
            | SemanticError::InvalidArguments { span, .. }
            | SemanticError::InvalidControl { span }
            | SemanticError::UnresolvedComposition { span } => *span,
        }
    }
}

/// Code generation failure.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompileError {
    #[error(transparent)]
    Semantic(#[from] SemanticError),

    #[error("program has {count} instructions, the limit is 65534")]
    InstructionOverflow { count: usize },

    #[error("string of length {length} does not fit in a char array of {capacity}")]
    LiteralTooLarge {
        length: usize,
        capacity: usize,
        span: Span,
    },

    #[error("register offset {offset} is outside the 64-register window")]
    RegisterOverflow { offset: usize },

    #[error("unsupported expression: {what}")]
    Unsupported { what: String, span: Span },

    #[error("division by zero in constant expression")]
    DivisionByZero { span: Span },

    #[error("index {index} is out of bounds for an array of {count}")]
    IndexOutOfBounds {
        index: i32,
        count: usize,
        span: Span,
    },
}

impl CompileError {
    pub fn span(&self) -> Option<Span> {
        match self {
            CompileError::Semantic(err) => Some(err.span()),
            CompileError::LiteralTooLarge { span, .. }
            | CompileError::Unsupported { span, .. }
            | CompileError::DivisionByZero { span }
            | CompileError::IndexOutOfBounds { span, .. } => Some(*span),
            CompileError::InstructionOverflow { .. }
            | CompileError::RegisterOverflow { .. } => None,
        }
    }
}

/// Non-zero status returned by the machine.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("machine halted with status {status} ({})", self.reason())]
pub struct RuntimeError {
    pub status: i32,
}

impl RuntimeError {
    pub fn reason(&self) -> &'static str {
        match self.status {
            -1 => "empty program or tick limit reached",
            -2 => "invalid opcode",
            -3 => "memory fault",
            -4 => "division by zero",
            s if s > 0 => "halted by trap",
            _ => "unknown failure",
        }
    }
}

/// Any failure of the source-to-program pipeline.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error(transparent)]
    Lex(#[from] LexError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Semantic(#[from] SemanticError),

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

impl Error {
    pub fn span(&self) -> Option<Span> {
        match self {
            Error::Lex(err) => Some(err.span()),
            Error::Parse(err) => Some(err.span()),
            Error::Semantic(err) => Some(err.span()),
            Error::Compile(err) => err.span(),
            Error::Runtime(_) => None,
        }
    }

    /// Attach the source text for rendering.
    pub fn with_source(&self, src: &str) -> SourceError {
        let label = match self {
            Error::Lex(_) => "while tokenizing",
            Error::Parse(_) => "while parsing",
            Error::Semantic(_) => "while resolving",
            Error::Compile(_) => "while generating code",
            Error::Runtime(_) => "while running",
        };
        SourceError::new(self.to_string(), src, self.span().unwrap_or_default(), label)
    }
}

/// An error with source location information, rendered by miette.
#[derive(Error, Debug, Diagnostic)]
#[error("{message}")]
pub struct SourceError {
    pub message: String,

    #[source_code]
    pub src: String,

    #[label("{label}")]
    pub span: SourceSpan,

    pub label: String,
}

impl SourceError {
    pub fn new(
        message: impl Into<String>,
        src: &str,
        span: Span,
        label: impl Into<String>,
    ) -> Self {
        Self {
            message: message.into(),
            src: src.to_string(),
            span: (span.start, span.len()).into(),
            label: label.into(),
        }
    }
}
