//! Resolver — the fixed sequence of passes between parsing and codegen.
//!
//! ```text
//!   desugar            f • g       ->  \$x > f # (g # $x)
//!                      c ? (a, b)  ->  c ? (\ > a, \ > b)
//!   index functions    number literals, link scopes to parents
//!   declare types      : name = type
//!   declare variables  [ name : type = value
//!   declare functions  root function list + names
//!   infer types        annotations, expected types, curried tails,
//!                      compositions, branch thunks
//!   resolve input      bind parameter labels, relocate locals
//!   capture context    free names -> closure bank
//! ```
//!
//! Every pass mutates the tree in place and later passes rely on the
//! effects of earlier ones, so they always run in this order and each
//! runs once. The first error aborts.

use crate::ast::{Expr, ExprKind, Lambda, Operator};
use crate::bytecode::Bank;
use crate::errors::SemanticError;
use crate::scope::{Func, Order, Origin, Scope, ScopeId, ScopeTree, Var};
use crate::types::{Arrow, Typ};
use tracing::{debug, trace};

/// Parameter name of composition literals. `$` never lexes, so source
/// code cannot refer to it.
pub const COMPOSITION_PARAM: &str = "$x";

#[tracing::instrument(name = "precompile", skip_all)]
pub fn precompile(tree: &mut ScopeTree) -> Result<(), SemanticError> {
    desugar(tree)?;
    index_functions(tree)?;
    declare_types(tree)?;
    declare_variables(tree)?;
    declare_functions(tree)?;
    infer_types(tree)?;
    resolve_input(tree)?;
    capture_context(tree)?;
    debug!(scopes = tree.len(), funcs = tree.funcs().len(), "resolved");
    Ok(())
}

/// Root first, then every function scope in source order.
fn scopes_preorder(tree: &mut ScopeTree) -> Result<Vec<ScopeId>, SemanticError> {
    let mut order = vec![ScopeId::ROOT];
    tree.walk(ScopeId::ROOT, Order::Pre, true, &mut |_, _, expr| {
        if let ExprKind::Function(lambda) = &expr.kind {
            order.push(lambda.scope);
        }
        Ok(())
    })?;
    Ok(order)
}

fn synthesize(tree: &mut ScopeTree, origin: Origin, labels: Vec<String>, body: Expr) -> Expr {
    let span = body.span;
    let scope = tree.alloc(Scope::new(origin, labels.clone(), vec![body], span));
    Expr::new(
        ExprKind::Function(Lambda {
            id: 0,
            labels,
            scope,
        }),
        span,
    )
}

fn is_branch(tree: &ScopeTree, expr: &Expr) -> bool {
    matches!(&expr.kind, ExprKind::Function(l) if tree[l.scope].origin == Origin::Branch)
}

// ── 1. Desugar ──────────────────────────────────────────────────────

fn desugar(tree: &mut ScopeTree) -> Result<(), SemanticError> {
    tree.walk(ScopeId::ROOT, Order::Pre, true, &mut |tree, _, expr| {
        match &mut expr.kind {
            ExprKind::Binary {
                op: Operator::Comp,
                lhs,
                rhs,
            } => {
                let span = expr.span;
                let f = std::mem::replace(&mut **lhs, Expr::new(ExprKind::Tuple(Vec::new()), span));
                let g = std::mem::replace(&mut **rhs, Expr::new(ExprKind::Tuple(Vec::new()), span));
                let param = Expr::new(ExprKind::Id(COMPOSITION_PARAM.to_string()), span);
                let inner = Expr::binary(Operator::RCall, g, param);
                let mut body = Expr::binary(Operator::RCall, f, inner);
                body.span = span;
                let labels = vec![COMPOSITION_PARAM.to_string()];
                *expr = synthesize(tree, Origin::Composition, labels, body);
                trace!(offset = span.start, "desugared composition");
            }
            ExprKind::Binary {
                op: Operator::Ctrl,
                rhs,
                ..
            } => {
                let span = rhs.span;
                let ExprKind::Tuple(fields) = &mut rhs.kind else {
                    return Err(SemanticError::InvalidControl { span });
                };
                if fields.len() != 2 {
                    return Err(SemanticError::InvalidControl { span });
                }
                for field in fields.iter_mut() {
                    if is_branch(tree, &field.value) {
                        continue;
                    }
                    let value = std::mem::replace(
                        &mut field.value,
                        Expr::new(ExprKind::Tuple(Vec::new()), span),
                    );
                    field.value = synthesize(tree, Origin::Branch, Vec::new(), value);
                }
            }
            _ => {}
        }
        Ok(())
    })
}

// ── 2. Index functions ──────────────────────────────────────────────

fn index_functions(tree: &mut ScopeTree) -> Result<(), SemanticError> {
    let mut next = 0;
    tree.walk(ScopeId::ROOT, Order::Pre, true, &mut |tree, scope, expr| {
        if let ExprKind::Function(lambda) = &mut expr.kind {
            lambda.id = next;
            next += 1;
            tree[lambda.scope].parent = Some(scope);
        }
        Ok(())
    })?;
    debug!(functions = next, "indexed functions");
    Ok(())
}

// ── 3. Declare types ────────────────────────────────────────────────

fn declare_types(tree: &mut ScopeTree) -> Result<(), SemanticError> {
    for scope in scopes_preorder(tree)? {
        let decls: Vec<_> = tree[scope]
            .exprs
            .iter()
            .filter_map(|e| match &e.kind {
                ExprKind::TypeDecl { name, ty } => Some((name.clone(), ty.clone(), e.span)),
                _ => None,
            })
            .collect();
        for (name, ty, span) in decls {
            if tree[scope].types.contains_key(&name) {
                return Err(SemanticError::Redeclaration {
                    kind: "type",
                    name,
                    span,
                });
            }
            let resolved = tree.resolve_type(scope, &ty)?;
            debug!(%name, ty = %resolved, "declared type");
            tree[scope]
                .types
                .insert(name.clone(), Typ::Named(name, Box::new(resolved)));
        }
    }
    Ok(())
}

// ── 4. Declare variables ────────────────────────────────────────────

fn declare_variables(tree: &mut ScopeTree) -> Result<(), SemanticError> {
    for scope in scopes_preorder(tree)? {
        let decls: Vec<_> = tree[scope]
            .exprs
            .iter()
            .filter_map(|e| match &e.kind {
                ExprKind::VarDecl { name, ty, .. } => Some((name.clone(), ty.clone(), e.span)),
                _ => None,
            })
            .collect();
        for (name, ty, span) in decls {
            if tree[scope].vars.iter().any(|v| v.name == name) {
                return Err(SemanticError::Redeclaration {
                    kind: "variable",
                    name,
                    span,
                });
            }
            let ty = tree.resolve_type(scope, &ty)?;
            let offset = tree[scope].next_var_offset();
            debug!(%name, %ty, offset, "declared variable");
            tree[scope].vars.push(Var {
                name,
                ty,
                offset,
                bank: Bank::Local,
            });
        }
    }
    Ok(())
}

// ── 5. Declare functions ────────────────────────────────────────────

fn declare_functions(tree: &mut ScopeTree) -> Result<(), SemanticError> {
    let mut funcs = Vec::new();
    tree.walk(ScopeId::ROOT, Order::Post, true, &mut |_, _, expr| {
        if let ExprKind::Function(lambda) = &expr.kind {
            funcs.push(Func {
                id: lambda.id,
                name: String::new(),
                scope: lambda.scope,
            });
        }
        Ok(())
    })?;
    tree.root_mut().funcs = funcs;

    for scope in scopes_preorder(tree)? {
        let bindings: Vec<_> = tree[scope]
            .exprs
            .iter()
            .filter_map(|e| match &e.kind {
                ExprKind::VarDecl { name, value, .. } => match &value.unwrapped().kind {
                    ExprKind::Function(lambda) => Some((name.clone(), lambda.id, e.span)),
                    _ => None,
                },
                _ => None,
            })
            .collect();

        for (name, id, span) in bindings {
            let taken = tree
                .funcs()
                .iter()
                .any(|f| f.name == name && tree[f.scope].parent == Some(scope));
            if taken {
                return Err(SemanticError::Redeclaration {
                    kind: "function",
                    name,
                    span,
                });
            }
            let func = tree
                .root_mut()
                .funcs
                .iter_mut()
                .find(|f| f.id == id)
                .ok_or(SemanticError::UnknownFunction { id, span })?;
            debug!(id, %name, "named function");
            func.name = name;
        }
    }
    Ok(())
}

// ── 6. Infer types ──────────────────────────────────────────────────

fn infer_types(tree: &mut ScopeTree) -> Result<(), SemanticError> {
    // Expected types flow from the outside in: annotations, call
    // arguments and assignments first, then curried tails.
    tree.walk(ScopeId::ROOT, Order::Pre, true, &mut |tree, scope, expr| {
        match &expr.kind {
            ExprKind::VarDecl { name, value, .. } => {
                let Some(var) = tree[scope].vars.iter().find(|v| v.name == *name) else {
                    return Ok(());
                };
                let ty = var.ty.clone();
                if let ExprKind::Function(_) = &value.unwrapped().kind {
                    if ty.arrow().is_none() {
                        return Err(SemanticError::TypeMismatch {
                            expected: ty.to_string(),
                            found: "a function literal".to_string(),
                            span: value.span,
                        });
                    }
                }
                expect(tree, value, &ty);
            }
            ExprKind::Binary {
                op: Operator::Assign,
                lhs,
                rhs,
            } => {
                if let Some(ty) = lhs.as_id().and_then(|name| tree.lookup(scope, name)) {
                    expect(tree, rhs, &ty);
                }
            }
            ExprKind::Binary { op, lhs, rhs } if op.is_call() => {
                if let Ok(arrow) = tree.arrow_of(scope, lhs) {
                    expect(tree, rhs, &arrow.input);
                }
            }
            ExprKind::Function(lambda) => {
                let body = &tree[lambda.scope];
                let tail = body.arrow.output.arrow().cloned().zip(
                    body.exprs
                        .last()
                        .and_then(|last| literal_scope(last.unwrapped())),
                );
                if let Some((arrow, inner)) = tail {
                    if tree[inner].arrow.is_unset() {
                        trace!(id = lambda.id, %arrow, "curried tail");
                        tree[inner].arrow = arrow;
                    }
                }
            }
            _ => {}
        }
        Ok(())
    })?;

    // Compositions, innermost first.
    tree.walk(ScopeId::ROOT, Order::Post, true, &mut |tree, scope, expr| {
        let ExprKind::Function(lambda) = &expr.kind else {
            return Ok(());
        };
        let body = &tree[lambda.scope];
        if body.origin != Origin::Composition || !body.arrow.is_unset() {
            return Ok(());
        }
        let Some(ExprKind::Binary { lhs: f, rhs: inner, .. }) = body.exprs.first().map(|e| &e.kind)
        else {
            return Err(SemanticError::UnresolvedComposition { span: expr.span });
        };
        let ExprKind::Binary { lhs: g, .. } = &inner.kind else {
            return Err(SemanticError::UnresolvedComposition { span: expr.span });
        };
        let f = tree.arrow_of(scope, f)?;
        let g = tree.arrow_of(scope, g)?;
        let arrow = Arrow::new(g.input, f.output);
        debug!(id = lambda.id, %arrow, "inferred composition");
        tree[lambda.scope].arrow = arrow;
        Ok(())
    })?;

    // Branch thunks, innermost first.
    tree.walk(ScopeId::ROOT, Order::Post, true, &mut |tree, _, expr| {
        let ExprKind::Function(lambda) = &expr.kind else {
            return Ok(());
        };
        let body = &tree[lambda.scope];
        if body.origin != Origin::Branch || !body.arrow.is_unset() {
            return Ok(());
        }
        let output = match body.exprs.last() {
            Some(last) => tree.infer_type(lambda.scope, last)?,
            None => Typ::Void,
        };
        trace!(id = lambda.id, %output, "inferred branch");
        tree[lambda.scope].arrow = Arrow::new(Typ::Void, output);
        Ok(())
    })
}

fn literal_scope(expr: &Expr) -> Option<ScopeId> {
    match &expr.kind {
        ExprKind::Function(lambda) => Some(lambda.scope),
        _ => None,
    }
}

/// Give untyped literals inside `value` the arrow `expected` implies,
/// following tuple fields and array elements.
fn expect(tree: &mut ScopeTree, value: &Expr, expected: &Typ) {
    let value = value.unwrapped();
    match (&value.kind, expected.resolved()) {
        (ExprKind::Function(lambda), ty) => {
            if let Some(arrow) = ty.arrow() {
                if tree[lambda.scope].arrow.is_unset() {
                    trace!(id = lambda.id, %arrow, "expected arrow");
                    tree[lambda.scope].arrow = arrow.clone();
                }
            }
        }
        (ExprKind::Tuple(values), Typ::Tuple(fields)) if values.len() == fields.len() => {
            for (value, field) in values.iter().zip(fields) {
                expect(tree, &value.value, &field.ty);
            }
        }
        (ExprKind::Tuple(values), Typ::Array(elem, count)) if values.len() == *count => {
            for value in values {
                expect(tree, &value.value, elem);
            }
        }
        _ => {}
    }
}

// ── 7. Resolve input ────────────────────────────────────────────────

fn resolve_input(tree: &mut ScopeTree) -> Result<(), SemanticError> {
    tree.walk(ScopeId::ROOT, Order::Pre, true, &mut |tree, _, expr| {
        let ExprKind::Function(lambda) = &expr.kind else {
            return Ok(());
        };
        let body = &mut tree[lambda.scope];
        let arrow = body.arrow.clone();
        let invalid = || SemanticError::InvalidArguments {
            id: lambda.id,
            input: arrow.input.to_string(),
            labels: body.labels.len(),
            span: expr.span,
        };

        let output = arrow.output.size();
        let mut inputs = Vec::new();
        match (arrow.input.resolved(), body.labels.as_slice()) {
            (Typ::Void, []) => {}
            (Typ::Void, _) => return Err(invalid()),
            (_, [label]) => inputs.push(Var {
                name: label.clone(),
                ty: arrow.input.clone(),
                offset: output,
                bank: Bank::Local,
            }),
            (Typ::Tuple(fields), labels) if labels.len() > 1 && fields.len() == labels.len() => {
                let mut offset = output;
                for (label, field) in labels.iter().zip(fields) {
                    inputs.push(Var {
                        name: label.clone(),
                        ty: field.ty.clone(),
                        offset,
                        bank: Bank::Local,
                    });
                    offset += field.ty.size();
                }
            }
            _ => return Err(invalid()),
        }

        if let Some(clash) = body
            .vars
            .iter()
            .find(|v| inputs.iter().any(|i| i.name == v.name))
        {
            return Err(SemanticError::Redeclaration {
                kind: "parameter",
                name: clash.name.clone(),
                span: expr.span,
            });
        }

        let shift = output + arrow.input.size();
        for var in &mut body.vars {
            var.offset += shift;
        }
        trace!(id = lambda.id, inputs = inputs.len(), shift, "bound input");
        inputs.append(&mut body.vars);
        body.vars = inputs;
        Ok(())
    })
}

// ── 8. Capture context ──────────────────────────────────────────────

fn capture_context(tree: &mut ScopeTree) -> Result<(), SemanticError> {
    tree.walk(ScopeId::ROOT, Order::Post, true, &mut |tree, outer, expr| {
        let ExprKind::Function(lambda) = &expr.kind else {
            return Ok(());
        };
        let inner = lambda.scope;
        let mut names = Vec::new();
        for stmt in &tree[inner].exprs {
            free_names(tree, stmt, &mut names);
        }

        for name in names {
            if tree[inner].local(&name).is_some() || !tree.resolvable(inner, &name) {
                continue;
            }
            let Some(ty) = tree.lookup(outer, &name) else {
                continue;
            };
            let offset = tree[inner].next_closure_offset();
            trace!(id = lambda.id, %name, offset, "captured");
            tree[inner].closure.push(Var {
                name,
                ty,
                offset,
                bank: Bank::Closure,
            });
        }
        Ok(())
    })
}

/// Identifiers `expr` reads or assigns, in first-use order. Nested
/// literals contribute the names they captured, not their bodies.
fn free_names(tree: &ScopeTree, expr: &Expr, out: &mut Vec<String>) {
    fn add(name: &str, out: &mut Vec<String>) {
        if !out.iter().any(|n| n == name) {
            out.push(name.to_string());
        }
    }
    match &expr.kind {
        ExprKind::Id(name) => add(name, out),
        ExprKind::Tuple(fields) => {
            for field in fields {
                free_names(tree, &field.value, out);
            }
        }
        ExprKind::VarDecl { value, .. } => free_names(tree, value, out),
        ExprKind::Function(lambda) => {
            for var in &tree[lambda.scope].closure {
                add(&var.name, out);
            }
        }
        ExprKind::Binary {
            op: Operator::Dot,
            lhs,
            ..
        } => free_names(tree, lhs, out),
        ExprKind::Binary { lhs, rhs, .. } => {
            free_names(tree, lhs, out);
            free_names(tree, rhs, out);
        }
        ExprKind::Unary { operand, .. } => free_names(tree, operand, out),
        ExprKind::Int(_)
        | ExprKind::Uint(_)
        | ExprKind::Float(_)
        | ExprKind::Str(_)
        | ExprKind::TypeDecl { .. } => {}
    }
}
