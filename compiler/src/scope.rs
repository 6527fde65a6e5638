//! Scopes — one symbol table per lexical block, stored in an arena.
//!
//! ```text
//! ScopeTree
//!  ├─ s0  program      types, vars, funcs (every function in the program)
//!  │   ├─ s1  \x > ...        vars, closure
//!  │   │   └─ s3  branch      closure
//!  │   └─ s2  f • g           closure
//! ```
//!
//! Function literals refer to their body by [`ScopeId`] and every scope
//! names its parent the same way, so the tree never owns a cycle. The
//! root scope owns the flat list of functions the generator lays out.
//!
//! A scope's register window is `[output][input][locals]`, followed by
//! scratch registers the generator hands out while lowering expressions.

use crate::ast::{Expr, ExprKind, Operator, TypeExpr, TypeExprKind};
use crate::bytecode::{Bank, Reg};
use crate::compiler::BUILTINS;
use crate::errors::{CompileError, SemanticError};
use crate::token::Span;
use crate::types::{Arrow, TypField, Typ};
use std::collections::HashMap;
use std::fmt;
use std::ops::{Index, IndexMut};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(pub usize);

impl ScopeId {
    pub const ROOT: ScopeId = ScopeId(0);
}

/// How a scope came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Program,
    /// `\x > ...` written in source.
    Literal,
    /// Synthesized from `f • g`.
    Composition,
    /// Synthesized from one arm of `cond ? (a, b)`.
    Branch,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Origin::Program => "program",
            Origin::Literal => "literal",
            Origin::Composition => "composition",
            Origin::Branch => "branch",
        };
        write!(f, "{}", s)
    }
}

/// A named register slot.
#[derive(Debug, Clone, PartialEq)]
pub struct Var {
    pub name: String,
    pub ty: Typ,
    pub offset: usize,
    pub bank: Bank,
}

impl Var {
    pub fn register(&self) -> Result<Reg, CompileError> {
        Reg::new(self.bank, self.offset)
    }
}

impl fmt::Display for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.register() {
            Ok(reg) => write!(f, "{}: {} @ {}", self.name, self.ty, reg),
            Err(_) => write!(f, "{}: {} @ {:?}+{}", self.name, self.ty, self.bank, self.offset),
        }
    }
}

/// An addressable function. `name` is empty for anonymous literals.
#[derive(Debug, Clone, PartialEq)]
pub struct Func {
    pub id: usize,
    pub name: String,
    pub scope: ScopeId,
}

#[derive(Debug, Clone)]
pub struct Scope {
    pub parent: Option<ScopeId>,
    pub origin: Origin,
    /// Parameter labels of the literal that owns this scope.
    pub labels: Vec<String>,
    pub arrow: Arrow,
    pub types: HashMap<String, Typ>,
    /// Only populated on the root.
    pub funcs: Vec<Func>,
    pub vars: Vec<Var>,
    pub closure: Vec<Var>,
    pub exprs: Vec<Expr>,
    pub span: Span,
}

impl Scope {
    pub fn new(origin: Origin, labels: Vec<String>, exprs: Vec<Expr>, span: Span) -> Self {
        Self {
            parent: None,
            origin,
            labels,
            arrow: Arrow::default(),
            types: HashMap::new(),
            funcs: Vec::new(),
            vars: Vec::new(),
            closure: Vec::new(),
            exprs,
            span,
        }
    }

    /// Own variables first, then captured ones. Never the parent.
    pub fn local(&self, name: &str) -> Option<&Var> {
        self.vars
            .iter()
            .find(|v| v.name == name)
            .or_else(|| self.closure.iter().find(|v| v.name == name))
    }

    /// Registers used by output, input and locals.
    pub fn size(&self) -> usize {
        self.vars.iter().map(|v| v.ty.size()).sum::<usize>() + self.arrow.output.size()
    }

    /// Type of a parameter label, before or after it is bound to a Var.
    pub fn label_type(&self, name: &str) -> Option<Typ> {
        let position = self.labels.iter().position(|l| l == name)?;
        if self.labels.len() == 1 {
            return Some(self.arrow.input.clone());
        }
        match self.arrow.input.resolved() {
            Typ::Tuple(fields) if fields.len() == self.labels.len() => {
                Some(fields[position].ty.clone())
            }
            _ => None,
        }
    }

    pub(crate) fn next_var_offset(&self) -> usize {
        self.vars.iter().map(|v| v.ty.size()).sum()
    }

    pub(crate) fn next_closure_offset(&self) -> usize {
        self.closure.iter().map(|v| v.ty.size()).sum()
    }
}

/// Traversal order for [`ScopeTree::walk`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    /// Visit a node before its children.
    Pre,
    /// Visit a node after its children; nested functions come first.
    Post,
}

/// The scope arena. Index 0 is the program scope.
#[derive(Debug, Clone)]
pub struct ScopeTree {
    scopes: Vec<Scope>,
}

impl Default for ScopeTree {
    fn default() -> Self {
        Self::new()
    }
}

impl Index<ScopeId> for ScopeTree {
    type Output = Scope;

    fn index(&self, id: ScopeId) -> &Scope {
        &self.scopes[id.0]
    }
}

impl IndexMut<ScopeId> for ScopeTree {
    fn index_mut(&mut self, id: ScopeId) -> &mut Scope {
        &mut self.scopes[id.0]
    }
}

impl ScopeTree {
    /// A tree holding only the program scope, seeded with the built-in types.
    pub fn new() -> Self {
        let mut root = Scope::new(Origin::Program, Vec::new(), Vec::new(), Span::default());
        for (name, ty) in Typ::defaults() {
            root.types.insert(name.to_string(), ty);
        }
        Self { scopes: vec![root] }
    }

    pub fn root(&self) -> &Scope {
        &self[ScopeId::ROOT]
    }

    pub fn root_mut(&mut self) -> &mut Scope {
        &mut self[ScopeId::ROOT]
    }

    pub fn alloc(&mut self, scope: Scope) -> ScopeId {
        self.scopes.push(scope);
        ScopeId(self.scopes.len() - 1)
    }

    /// Drop scopes allocated after the first `len`, undoing a failed
    /// speculative parse.
    pub(crate) fn truncate(&mut self, len: usize) {
        self.scopes.truncate(len.max(1));
    }

    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = ScopeId> {
        (0..self.scopes.len()).map(ScopeId)
    }

    /// `scope` itself, then each enclosing scope up to the root.
    pub fn ancestors(&self, scope: ScopeId) -> impl Iterator<Item = ScopeId> + '_ {
        std::iter::successors(Some(scope), move |id| self[*id].parent)
    }

    /// Static window start: the parent's size plus the grandparent's offset.
    pub fn offset(&self, scope: ScopeId) -> usize {
        match self[scope].parent {
            None => 0,
            Some(parent) => {
                self[parent].size() + self[parent].parent.map_or(0, |gp| self.offset(gp))
            }
        }
    }

    pub fn funcs(&self) -> &[Func] {
        &self.root().funcs
    }

    pub fn func(&self, id: usize) -> Option<&Func> {
        self.funcs().iter().find(|f| f.id == id)
    }

    pub fn func_for_scope(&self, scope: ScopeId) -> Option<&Func> {
        self.funcs().iter().find(|f| f.scope == scope)
    }

    // ── Lookup ──────────────────────────────────────────────────────

    pub fn lookup_type(&self, scope: ScopeId, name: &str) -> Option<&Typ> {
        self.ancestors(scope).find_map(|id| self[id].types.get(name))
    }

    /// The type of a value name as seen from `scope`, searching enclosing
    /// scopes and parameter labels that are not bound yet.
    pub fn lookup(&self, scope: ScopeId, name: &str) -> Option<Typ> {
        self.ancestors(scope).find_map(|id| {
            let s = &self[id];
            s.local(name)
                .map(|v| v.ty.clone())
                .or_else(|| s.label_type(name))
        })
    }

    /// Whether `name` is a value in some scope enclosing `scope`.
    pub fn resolvable(&self, scope: ScopeId, name: &str) -> bool {
        self.ancestors(scope).skip(1).any(|id| {
            let s = &self[id];
            s.local(name).is_some() || s.labels.iter().any(|l| l == name)
        })
    }

    pub fn resolve_type(&self, scope: ScopeId, ty: &TypeExpr) -> Result<Typ, SemanticError> {
        match &ty.kind {
            TypeExprKind::Named(name) => {
                self.lookup_type(scope, name)
                    .cloned()
                    .ok_or_else(|| SemanticError::UnknownType {
                        name: name.clone(),
                        span: ty.span,
                    })
            }
            TypeExprKind::Array(elem, count) => {
                Ok(Typ::Array(Box::new(self.resolve_type(scope, elem)?), *count))
            }
            TypeExprKind::Function(input, output) => Ok(Typ::function(
                self.resolve_type(scope, input)?,
                self.resolve_type(scope, output)?,
            )),
            TypeExprKind::Pointer(inner) => {
                Ok(Typ::Pointer(Box::new(self.resolve_type(scope, inner)?)))
            }
            TypeExprKind::Tuple(fields) => {
                let fields = fields
                    .iter()
                    .map(|f| {
                        Ok(TypField {
                            name: f.name.clone(),
                            ty: self.resolve_type(scope, &f.ty)?,
                        })
                    })
                    .collect::<Result<Vec<_>, SemanticError>>()?;
                Ok(Typ::Tuple(fields))
            }
        }
    }

    // ── Inference ───────────────────────────────────────────────────

    /// The type an expression produces when evaluated in `scope`.
    pub fn infer_type(&self, scope: ScopeId, expr: &Expr) -> Result<Typ, SemanticError> {
        match &expr.kind {
            ExprKind::Int(_) | ExprKind::Uint(_) => Ok(Typ::Int),
            ExprKind::Float(_) => Ok(Typ::Float),
            ExprKind::Str(s) => Ok(Typ::Array(Box::new(Typ::Char), s.len() + 1)),
            ExprKind::Id(name) => {
                self.lookup(scope, name)
                    .ok_or_else(|| SemanticError::UnknownIdentifier {
                        name: name.clone(),
                        span: expr.span,
                    })
            }
            ExprKind::Tuple(fields) => {
                if fields.len() == 1 && fields[0].label.is_none() {
                    return self.infer_type(scope, &fields[0].value);
                }
                let fields = fields
                    .iter()
                    .map(|f| {
                        Ok(TypField {
                            name: f.label.clone(),
                            ty: self.infer_type(scope, &f.value)?,
                        })
                    })
                    .collect::<Result<Vec<_>, SemanticError>>()?;
                Ok(Typ::Tuple(fields))
            }
            ExprKind::Function(lambda) => {
                Ok(Typ::Function(Box::new(self[lambda.scope].arrow.clone())))
            }
            ExprKind::TypeDecl { .. } | ExprKind::VarDecl { .. } => Ok(Typ::Void),
            ExprKind::Unary { op, operand } => match op {
                Operator::Not => Ok(Typ::Bool),
                Operator::Ref => Ok(Typ::Pointer(Box::new(self.infer_type(scope, operand)?))),
                Operator::Deref => match self.infer_type(scope, operand)?.resolved() {
                    Typ::Pointer(inner) => Ok((**inner).clone()),
                    other => Err(mismatch("a pointer", other, operand.span)),
                },
                _ => self.infer_type(scope, operand),
            },
            ExprKind::Binary { op, lhs, rhs } => match op {
                Operator::Add | Operator::Sub | Operator::Mul | Operator::Div | Operator::Mod => {
                    self.infer_type(scope, lhs)
                }
                Operator::Eq
                | Operator::Neq
                | Operator::Gt
                | Operator::Gte
                | Operator::Lt
                | Operator::Lte
                | Operator::And
                | Operator::Or
                | Operator::Not => Ok(Typ::Bool),
                Operator::Assign => Ok(Typ::Void),
                Operator::Call | Operator::RCall => self.call_type(scope, lhs),
                Operator::Comp => {
                    let f = self.arrow_of(scope, lhs)?;
                    let g = self.arrow_of(scope, rhs)?;
                    Ok(Typ::function(g.input, f.output))
                }
                Operator::Ctrl => self.branch_type(scope, rhs),
                Operator::Dot => {
                    let base = self.infer_type(scope, lhs)?;
                    let name = rhs.as_id().unwrap_or_default();
                    base.field(name)
                        .map(|(_, ty)| ty.clone())
                        .ok_or_else(|| SemanticError::UnknownIdentifier {
                            name: format!("{}.{}", lhs, name),
                            span: expr.span,
                        })
                }
                Operator::Index => match self.infer_type(scope, lhs)?.resolved() {
                    Typ::Array(elem, _) => Ok((**elem).clone()),
                    other => Err(mismatch("an array", other, lhs.span)),
                },
                Operator::Neg | Operator::Deref | Operator::Ref => self.infer_type(scope, rhs),
            },
        }
    }

    /// The function type of a callee expression.
    pub fn arrow_of(&self, scope: ScopeId, expr: &Expr) -> Result<Arrow, SemanticError> {
        let ty = self.infer_type(scope, expr)?;
        ty.arrow()
            .cloned()
            .ok_or_else(|| mismatch("a function", &ty, expr.span))
    }

    fn call_type(&self, scope: ScopeId, callee: &Expr) -> Result<Typ, SemanticError> {
        if let Some(name) = callee.as_id() {
            if self.lookup(scope, name).is_none() && BUILTINS.contains(&name) {
                return Ok(Typ::Void);
            }
        }
        Ok(self.arrow_of(scope, callee)?.output)
    }

    /// Result type of `cond ? (then, else)`, taken from the `then` arm.
    pub fn branch_type(&self, scope: ScopeId, branches: &Expr) -> Result<Typ, SemanticError> {
        let ExprKind::Tuple(fields) = &branches.kind else {
            return Err(SemanticError::InvalidControl { span: branches.span });
        };
        let [then, _] = fields.as_slice() else {
            return Err(SemanticError::InvalidControl { span: branches.span });
        };
        match &then.value.kind {
            ExprKind::Function(lambda) if self[lambda.scope].origin == Origin::Branch => {
                let body = &self[lambda.scope];
                if !body.arrow.is_unset() {
                    return Ok(body.arrow.output.clone());
                }
                match body.exprs.last() {
                    Some(last) => self.infer_type(lambda.scope, last),
                    None => Ok(Typ::Void),
                }
            }
            _ => self.infer_type(scope, &then.value),
        }
    }

    // ── Traversal ───────────────────────────────────────────────────

    /// Visit every expression of `scope`, descending into tuple fields,
    /// operands and declaration values. With `nested` set, function
    /// literals are followed into their own scopes.
    ///
    /// The scope's statements are moved out while they are visited so the
    /// visitor can mutate the rest of the tree; they are put back even
    /// when the visitor fails.
    pub fn walk<F>(
        &mut self,
        scope: ScopeId,
        order: Order,
        nested: bool,
        visit: &mut F,
    ) -> Result<(), SemanticError>
    where
        F: FnMut(&mut ScopeTree, ScopeId, &mut Expr) -> Result<(), SemanticError>,
    {
        let mut exprs = std::mem::take(&mut self[scope].exprs);
        let result = exprs
            .iter_mut()
            .try_for_each(|expr| self.walk_expr(scope, expr, order, nested, visit));
        self[scope].exprs = exprs;
        result
    }

    fn walk_expr<F>(
        &mut self,
        scope: ScopeId,
        expr: &mut Expr,
        order: Order,
        nested: bool,
        visit: &mut F,
    ) -> Result<(), SemanticError>
    where
        F: FnMut(&mut ScopeTree, ScopeId, &mut Expr) -> Result<(), SemanticError>,
    {
        if order == Order::Pre {
            visit(self, scope, expr)?;
        }
        match &mut expr.kind {
            ExprKind::Tuple(fields) => {
                for field in fields {
                    self.walk_expr(scope, &mut field.value, order, nested, visit)?;
                }
            }
            ExprKind::VarDecl { value, .. } => {
                self.walk_expr(scope, value, order, nested, visit)?;
            }
            ExprKind::Binary { lhs, rhs, .. } => {
                self.walk_expr(scope, lhs, order, nested, visit)?;
                self.walk_expr(scope, rhs, order, nested, visit)?;
            }
            ExprKind::Unary { operand, .. } => {
                self.walk_expr(scope, operand, order, nested, visit)?;
            }
            ExprKind::Function(lambda) if nested => {
                let body = lambda.scope;
                self.walk(body, order, nested, visit)?;
            }
            _ => {}
        }
        if order == Order::Post {
            visit(self, scope, expr)?;
        }
        Ok(())
    }

    // ── Display ─────────────────────────────────────────────────────

    fn fmt_scope(&self, f: &mut fmt::Formatter<'_>, id: ScopeId, depth: usize) -> fmt::Result {
        let indent = "  ".repeat(depth);
        let scope = &self[id];
        let title = match self.func_for_scope(id) {
            Some(func) if !func.name.is_empty() => format!("fn #{} {}", func.id, func.name),
            Some(func) => format!("fn #{}", func.id),
            None => format!("scope {}", id.0),
        };
        writeln!(
            f,
            "{}{} ({}) {} [window {}+{}]",
            indent,
            title,
            scope.origin,
            scope.arrow,
            self.offset(id),
            scope.size()
        )?;

        let mut types: Vec<_> = scope
            .types
            .iter()
            .filter(|(_, ty)| matches!(ty, Typ::Named(..)))
            .collect();
        types.sort_by(|a, b| a.0.cmp(b.0));
        for (name, ty) in types {
            writeln!(f, "{}  type {} = {}", indent, name, ty.resolved())?;
        }
        for var in &scope.vars {
            writeln!(f, "{}  var {}", indent, var)?;
        }
        for var in &scope.closure {
            writeln!(f, "{}  capture {}", indent, var)?;
        }
        for child in self.ids().filter(|c| self[*c].parent == Some(id)) {
            self.fmt_scope(f, child, depth + 1)?;
        }
        Ok(())
    }
}

impl fmt::Display for ScopeTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_scope(f, ScopeId::ROOT, 0)
    }
}

fn mismatch(expected: &str, found: &Typ, span: Span) -> SemanticError {
    SemanticError::TypeMismatch {
        expected: expected.to_string(),
        found: found.to_string(),
        span,
    }
}
