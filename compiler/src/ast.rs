//! Abstract Syntax Tree — Expression nodes for the regal language.
//!
//! Every node carries a [`Span`] for error reporting. The language has no
//! separate statement type: declarations are expressions that the
//! resolver and generator treat specially at statement level.
//!
//! A function literal does not own its body directly. The body lives in
//! a [`Scope`](crate::scope::Scope) inside the scope arena, and the
//! literal points at it by [`ScopeId`].

use crate::scope::ScopeId;
use crate::token::Span;
use std::fmt;

// ── Expressions ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
}

impl Expr {
    pub fn new(kind: ExprKind, span: Span) -> Self {
        Self { kind, span }
    }

    pub fn binary(op: Operator, lhs: Expr, rhs: Expr) -> Self {
        let span = lhs.span.merge(rhs.span);
        Self::new(
            ExprKind::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            span,
        )
    }

    /// The identifier name, if this is a bare identifier.
    pub fn as_id(&self) -> Option<&str> {
        match &self.kind {
            ExprKind::Id(name) => Some(name),
            _ => None,
        }
    }

    /// Strip redundant parentheses: a single unlabelled tuple field stands
    /// for the field itself.
    pub fn unwrapped(&self) -> &Expr {
        match &self.kind {
            ExprKind::Tuple(fields) if fields.len() == 1 && fields[0].label.is_none() => {
                fields[0].value.unwrapped()
            }
            _ => self,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    /// Decimal integer literal: `42`
    Int(i32),
    /// Hex literal: `0xff`
    Uint(u32),
    /// Float literal: `1.5`
    Float(f32),
    /// String literal: `"hi"`
    Str(String),
    /// Identifier reference: `x`
    Id(String),
    /// Tuple literal: `(1, y: 2)`
    Tuple(Vec<Field>),
    /// `: name = type`
    TypeDecl { name: String, ty: TypeExpr },
    /// `[ name: type = value`
    VarDecl {
        name: String,
        ty: TypeExpr,
        value: Box<Expr>,
    },
    /// `\a, b > body`
    Function(Lambda),
    Binary {
        op: Operator,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    /// Prefix `-x`, `!x`, `*x`, `&x`
    Unary { op: Operator, operand: Box<Expr> },
}

/// One tuple literal field. Unlabelled fields are positional.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub label: Option<String>,
    pub value: Expr,
}

/// A function literal. `id` is 0 until the resolver numbers it.
#[derive(Debug, Clone, PartialEq)]
pub struct Lambda {
    pub id: usize,
    pub labels: Vec<String>,
    pub scope: ScopeId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Assign,
    /// `f # x`
    RCall,
    /// `f • g`
    Comp,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Or,
    And,
    Not,
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    /// `cond ? (then, else)`
    Ctrl,
    Deref,
    Ref,
    Neg,
    /// `f(x)`
    Call,
    Dot,
    Index,
}

impl Operator {
    pub fn is_arithmetic(self) -> bool {
        matches!(
            self,
            Operator::Add | Operator::Sub | Operator::Mul | Operator::Div | Operator::Mod
        )
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            Operator::Eq
                | Operator::Neq
                | Operator::Gt
                | Operator::Gte
                | Operator::Lt
                | Operator::Lte
        )
    }

    pub fn is_call(self) -> bool {
        matches!(self, Operator::Call | Operator::RCall)
    }
}

// ── Type expressions ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct TypeExpr {
    pub kind: TypeExprKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TypeExprKind {
    /// `int`, `point`
    Named(String),
    /// `char 32`
    Array(Box<TypeExpr>, usize),
    /// `int > int`
    Function(Box<TypeExpr>, Box<TypeExpr>),
    /// `int *`
    Pointer(Box<TypeExpr>),
    /// `(x: int, int)`
    Tuple(Vec<TypeField>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TypeField {
    pub name: Option<String>,
    pub ty: TypeExpr,
}

// ── Display ──────────────────────────────────────────────────────────

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operator::Assign => "=",
            Operator::RCall => "#",
            Operator::Comp => "•",
            Operator::Add => "+",
            Operator::Sub | Operator::Neg => "-",
            Operator::Mul | Operator::Deref => "*",
            Operator::Div => "/",
            Operator::Mod => "%",
            Operator::Or => "|",
            Operator::And | Operator::Ref => "&",
            Operator::Not => "!",
            Operator::Eq => "==",
            Operator::Neq => "!=",
            Operator::Gt => ">",
            Operator::Gte => ">=",
            Operator::Lt => "<",
            Operator::Lte => "<=",
            Operator::Ctrl => "?",
            Operator::Call => "()",
            Operator::Dot => ".",
            Operator::Index => "[]",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ExprKind::Int(n) => write!(f, "{}", n),
            ExprKind::Uint(n) => write!(f, "0x{:x}", n),
            ExprKind::Float(n) => write!(f, "{:?}", n),
            ExprKind::Str(s) => write!(f, "\"{}\"", s),
            ExprKind::Id(name) => write!(f, "{}", name),
            ExprKind::Tuple(fields) => {
                write!(f, "(")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    if let Some(label) = &field.label {
                        write!(f, "{}: ", label)?;
                    }
                    write!(f, "{}", field.value)?;
                }
                write!(f, ")")
            }
            ExprKind::TypeDecl { name, ty } => write!(f, ": {} = {}", name, ty),
            ExprKind::VarDecl { name, ty, value } => write!(f, "[ {}: {} = {}", name, ty, value),
            ExprKind::Function(lambda) => {
                write!(f, "\\{} > {{fn {}}}", lambda.labels.join(", "), lambda.id)
            }
            ExprKind::Binary { op, lhs, rhs } => match op {
                Operator::Call => write!(f, "{}{}", lhs, rhs),
                Operator::Dot => write!(f, "{}.{}", lhs, rhs),
                Operator::Index => write!(f, "{}[{}]", lhs, rhs),
                Operator::Assign => write!(f, "{} = {}", lhs, rhs),
                op => write!(f, "({} {} {})", lhs, op, rhs),
            },
            ExprKind::Unary { op, operand } => write!(f, "{}{}", op, operand),
        }
    }
}

impl fmt::Display for TypeExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            TypeExprKind::Named(name) => write!(f, "{}", name),
            TypeExprKind::Array(elem, count) => write!(f, "{} {}", elem, count),
            TypeExprKind::Function(input, output) => match input.kind {
                TypeExprKind::Function(..) => write!(f, "({}) > {}", input, output),
                _ => write!(f, "{} > {}", input, output),
            },
            TypeExprKind::Pointer(inner) => write!(f, "{} *", inner),
            TypeExprKind::Tuple(fields) => {
                write!(f, "(")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    if let Some(name) = &field.name {
                        write!(f, "{}: ", name)?;
                    }
                    write!(f, "{}", field.ty)?;
                }
                write!(f, ")")
            }
        }
    }
}
