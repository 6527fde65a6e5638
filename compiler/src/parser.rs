//! Parser — Pratt parser (expressions) + recursive descent (statements).
//!
//! The lexer has already folded every `(...)` and `{...}` into a single
//! token, so the parser walks a token *tree*: a tuple literal, a call's
//! argument list and a lambda's block body are each parsed by a
//! sub-parser over the children of one token.
//!
//! **Pratt parsing** handles binary operators. Each infix token has a
//! binding power and an associativity:
//!
//! ```text
//!   1  #                 right    f # g # x   = f # (g # x)
//!   2  |                 left
//!   3  &                 left
//!   4  == !=             left
//!   5  < <= > >=         left
//!   6  + -               left
//!   7  * / %             left
//!   8  •                 right
//!   9  ?                 right
//!      prefix * & ! -
//!      postfix (args) .field [index]
//! ```
//!
//! Assignment sits below all of them and only has the shape
//! `identifier = expression`; anything else starting with an identifier
//! and `=` backtracks and is parsed as an ordinary expression.
//!
//! **Recursive descent** handles statements (`[` variable declaration,
//! `:` type declaration, or an expression) and the small type grammar.
//!
//! There is no error recovery: the first error ends the parse.

use crate::ast::*;
use crate::errors::ParseError;
use crate::scope::{Origin, Scope, ScopeTree};
use crate::token::{describe, Span, Token, TokenKind};

pub struct Parser<'t, 's> {
    tokens: &'t [Token],
    current: usize,
    scopes: &'s mut ScopeTree,
}

impl<'t, 's> Parser<'t, 's> {
    pub fn new(tokens: &'t [Token], scopes: &'s mut ScopeTree) -> Self {
        Self {
            tokens,
            current: 0,
            scopes,
        }
    }

    /// Parse `;`-separated statements until the tokens run out. A trailing
    /// `;` is allowed.
    pub fn statements(&mut self) -> Result<Vec<Expr>, ParseError> {
        let mut stmts = Vec::new();
        while !self.is_at_end() {
            stmts.push(self.statement()?);
            if !self.match_token(&TokenKind::Semicolon) {
                break;
            }
        }
        if !self.is_at_end() {
            return Err(ParseError::Trailing {
                rest: self.rest(),
                span: self.current_span(),
            });
        }
        Ok(stmts)
    }

    // ── Statements ───────────────────────────────────────────────────

    fn statement(&mut self) -> Result<Expr, ParseError> {
        match self.peek_kind() {
            Some(TokenKind::LBracket) => self.var_declaration(),
            Some(TokenKind::Colon) => self.type_declaration(),
            _ => self.expression(),
        }
    }

    /// `[ name : type = value`
    fn var_declaration(&mut self) -> Result<Expr, ParseError> {
        let start = self.expect(&TokenKind::LBracket, "'['")?;
        let (name, _) = self.expect_identifier()?;
        self.expect(&TokenKind::Colon, "':' after variable name")?;
        let ty = type_expr(self.collect_until(&TokenKind::Eq))?;
        self.expect(&TokenKind::Eq, "'=' in variable declaration")?;
        let value = self.expression()?;
        let span = start.merge(value.span);
        Ok(Expr::new(
            ExprKind::VarDecl {
                name,
                ty,
                value: Box::new(value),
            },
            span,
        ))
    }

    /// `: name = type`
    fn type_declaration(&mut self) -> Result<Expr, ParseError> {
        let start = self.expect(&TokenKind::Colon, "':'")?;
        let (name, _) = self.expect_identifier()?;
        self.expect(&TokenKind::Eq, "'=' in type declaration")?;
        let ty = type_expr(self.collect_until(&TokenKind::Semicolon))?;
        let span = start.merge(ty.span);
        Ok(Expr::new(ExprKind::TypeDecl { name, ty }, span))
    }

    // ── Expressions ──────────────────────────────────────────────────

    pub fn expression(&mut self) -> Result<Expr, ParseError> {
        if let (Some(TokenKind::Identifier(name)), Some(TokenKind::Eq)) =
            (self.peek_kind(), self.peek_kind_at(1))
        {
            let saved = self.current;
            let saved_scopes = self.scopes.len();
            let target = Expr::new(ExprKind::Id(name.clone()), self.current_span());
            self.current += 2;
            match self.expression() {
                Ok(value) => return Ok(Expr::binary(Operator::Assign, target, value)),
                Err(_) => {
                    self.current = saved;
                    self.scopes.truncate(saved_scopes);
                }
            }
        }
        self.parse_expr(1)
    }

    /// Pratt loop over the binary operators.
    fn parse_expr(&mut self, min_bp: u8) -> Result<Expr, ParseError> {
        let mut lhs = self.prefix()?;

        loop {
            let Some((op, bp, assoc)) = self.peek_kind().and_then(infix_op) else {
                break;
            };
            if bp < min_bp {
                break;
            }
            self.current += 1;

            // Left-associative: the right side parses at bp + 1 so an equal
            // operator ends it. Right-associative: it parses at bp and
            // absorbs the rest of the chain.
            let next_bp = match assoc {
                Assoc::Left => bp + 1,
                Assoc::Right => bp,
            };
            let rhs = self.parse_expr(next_bp)?;
            lhs = Expr::binary(op, lhs, rhs);
        }

        Ok(lhs)
    }

    fn prefix(&mut self) -> Result<Expr, ParseError> {
        let op = match self.peek_kind() {
            Some(TokenKind::Star) => Operator::Deref,
            Some(TokenKind::Amp) => Operator::Ref,
            Some(TokenKind::Bang) => Operator::Not,
            Some(TokenKind::Minus) => Operator::Neg,
            _ => return self.postfix(),
        };
        let start = self.current_span();
        self.current += 1;
        let operand = self.prefix()?;
        let span = start.merge(operand.span);
        Ok(Expr::new(
            ExprKind::Unary {
                op,
                operand: Box::new(operand),
            },
            span,
        ))
    }

    fn postfix(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.primary()?;

        loop {
            let Some(token) = self.peek() else { break };
            match &token.kind {
                TokenKind::Tuple(children) => {
                    self.current += 1;
                    let args = self.tuple(children, token.span)?;
                    expr = Expr::binary(Operator::Call, expr, args);
                }
                TokenKind::Dot => {
                    self.current += 1;
                    let (field, span) = self.expect_identifier()?;
                    let field = Expr::new(ExprKind::Id(field), span);
                    expr = Expr::binary(Operator::Dot, expr, field);
                }
                TokenKind::LBracket => {
                    self.current += 1;
                    let index = self.expression()?;
                    let end = self.expect(&TokenKind::RBracket, "']' after index")?;
                    let span = expr.span.merge(end);
                    expr = Expr::binary(Operator::Index, expr, index);
                    expr.span = span;
                }
                _ => break,
            }
        }

        Ok(expr)
    }

    fn primary(&mut self) -> Result<Expr, ParseError> {
        let Some(token) = self.peek() else {
            return Err(ParseError::InvalidPrimary {
                found: self.rest(),
                span: self.current_span(),
            });
        };
        let span = token.span;
        let kind = match &token.kind {
            TokenKind::Int(n) => ExprKind::Int(*n),
            TokenKind::Hex(n) => ExprKind::Uint(*n),
            TokenKind::Float(n) => ExprKind::Float(*n),
            TokenKind::Str(s) => ExprKind::Str(s.clone()),
            TokenKind::Identifier(name) => ExprKind::Id(name.clone()),
            TokenKind::Tuple(children) => {
                self.current += 1;
                return self.tuple(children, span);
            }
            TokenKind::Backslash => {
                self.current += 1;
                return self.lambda(span);
            }
            _ => {
                return Err(ParseError::InvalidPrimary {
                    found: self.rest(),
                    span,
                })
            }
        };
        self.current += 1;
        Ok(Expr::new(kind, span))
    }

    /// The children of a tuple token, split on top-level commas.
    fn tuple(&mut self, children: &'t [Token], span: Span) -> Result<Expr, ParseError> {
        let mut fields = Vec::new();
        if !children.is_empty() {
            for part in children.split(|t| t.kind == TokenKind::Comma) {
                fields.push(self.field(part, span)?);
            }
        }
        Ok(Expr::new(ExprKind::Tuple(fields), span))
    }

    fn field(&mut self, tokens: &'t [Token], span: Span) -> Result<Field, ParseError> {
        match tokens {
            [Token {
                kind: TokenKind::Identifier(label),
                ..
            }, Token {
                kind: TokenKind::Colon,
                ..
            }, rest @ ..]
                if !rest.is_empty() && !rest.iter().any(|t| t.kind == TokenKind::Colon) =>
            {
                Ok(Field {
                    label: Some(label.clone()),
                    value: self.sub_expression(rest, span)?,
                })
            }
            _ if tokens.iter().any(|t| t.kind == TokenKind::Colon) => {
                Err(ParseError::InvalidField {
                    field: describe(tokens),
                    span: span_of(tokens).unwrap_or(span),
                })
            }
            _ => Ok(Field {
                label: None,
                value: self.sub_expression(tokens, span)?,
            }),
        }
    }

    /// `\ labels > body` where body is a `{...}` block or one expression.
    fn lambda(&mut self, start: Span) -> Result<Expr, ParseError> {
        let mut labels = Vec::new();
        if let Some(TokenKind::Identifier(_)) = self.peek_kind() {
            labels.push(self.expect_identifier()?.0);
            while self.match_token(&TokenKind::Comma) {
                labels.push(self.expect_identifier()?.0);
            }
        }
        self.expect(&TokenKind::Gt, "'>' after lambda labels")?;

        let (exprs, end) = match self.peek() {
            Some(Token {
                kind: TokenKind::Compound(children),
                span,
                ..
            }) => {
                self.current += 1;
                let mut body = Parser::new(children, &mut *self.scopes);
                (body.statements()?, *span)
            }
            _ => {
                let body = self.expression()?;
                let end = body.span;
                (vec![body], end)
            }
        };

        let span = start.merge(end);
        let scope = self
            .scopes
            .alloc(Scope::new(Origin::Literal, labels.clone(), exprs, span));
        Ok(Expr::new(
            ExprKind::Function(Lambda {
                id: 0,
                labels,
                scope,
            }),
            span,
        ))
    }

    /// Parse one whole expression from a token run, rejecting leftovers.
    fn sub_expression(&mut self, tokens: &'t [Token], span: Span) -> Result<Expr, ParseError> {
        let mut sub = Parser::new(tokens, &mut *self.scopes);
        if sub.is_at_end() {
            return Err(ParseError::InvalidPrimary {
                found: "empty tuple field".to_string(),
                span,
            });
        }
        let expr = sub.expression()?;
        if !sub.is_at_end() {
            return Err(ParseError::Trailing {
                rest: sub.rest(),
                span: sub.current_span(),
            });
        }
        Ok(expr)
    }

    // ── Token helpers ────────────────────────────────────────────────

    fn peek(&self) -> Option<&'t Token> {
        let tokens = self.tokens;
        tokens.get(self.current)
    }

    fn peek_kind(&self) -> Option<&'t TokenKind> {
        self.peek().map(|t| &t.kind)
    }

    fn peek_kind_at(&self, ahead: usize) -> Option<&'t TokenKind> {
        let tokens = self.tokens;
        tokens.get(self.current + ahead).map(|t| &t.kind)
    }

    fn match_token(&mut self, kind: &TokenKind) -> bool {
        if self.peek_kind() == Some(kind) {
            self.current += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind, what: &str) -> Result<Span, ParseError> {
        let span = self.current_span();
        if self.match_token(kind) {
            Ok(span)
        } else {
            Err(ParseError::Expected {
                expected: what.to_string(),
                found: self.rest(),
                span,
            })
        }
    }

    fn expect_identifier(&mut self) -> Result<(String, Span), ParseError> {
        match self.peek() {
            Some(Token {
                kind: TokenKind::Identifier(name),
                span,
                ..
            }) => {
                self.current += 1;
                Ok((name.clone(), *span))
            }
            _ => Err(ParseError::Expected {
                expected: "identifier".to_string(),
                found: self.rest(),
                span: self.current_span(),
            }),
        }
    }

    /// Consume tokens up to (not including) `stop` or the end.
    fn collect_until(&mut self, stop: &TokenKind) -> &'t [Token] {
        let tokens = self.tokens;
        let start = self.current;
        while self.peek_kind().is_some_and(|k| k != stop) {
            self.current += 1;
        }
        &tokens[start..self.current]
    }

    fn rest(&self) -> String {
        if self.is_at_end() {
            "end of input".to_string()
        } else {
            describe(&self.tokens[self.current..])
        }
    }

    fn current_span(&self) -> Span {
        match self.peek() {
            Some(token) => token.span,
            None => {
                let end = self.tokens.last().map_or(0, |t| t.span.end);
                Span::new(end, end)
            }
        }
    }

    fn is_at_end(&self) -> bool {
        self.current >= self.tokens.len()
    }
}

// ── Type expressions ─────────────────────────────────────────────────

/// Parse a type annotation from its token run.
///
/// `>` splits the run into a right-nested function type; otherwise the
/// run is a type name, `name count` (array), `type *` (pointer) or one
/// tuple token of optionally named fields.
pub fn type_expr(tokens: &[Token]) -> Result<TypeExpr, ParseError> {
    let parts: Vec<&[Token]> = tokens.split(|t| t.kind == TokenKind::Gt).collect();
    if parts.len() > 1 {
        let mut types = parts
            .into_iter()
            .map(type_expr)
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .rev();
        if let Some(last) = types.next() {
            return Ok(types.fold(last, |output, input| {
                let span = input.span.merge(output.span);
                TypeExpr {
                    kind: TypeExprKind::Function(Box::new(input), Box::new(output)),
                    span,
                }
            }));
        }
    }

    let invalid = || ParseError::InvalidType {
        tokens: describe(tokens),
        span: span_of(tokens).unwrap_or_default(),
    };
    let span = span_of(tokens).ok_or_else(invalid)?;

    let kind = match tokens {
        [Token {
            kind: TokenKind::Identifier(name),
            ..
        }] => TypeExprKind::Named(name.clone()),
        [Token {
            kind: TokenKind::Identifier(name),
            span: name_span,
            ..
        }, Token {
            kind: TokenKind::Int(count),
            ..
        }] if *count >= 0 => {
            let elem = TypeExpr {
                kind: TypeExprKind::Named(name.clone()),
                span: *name_span,
            };
            TypeExprKind::Array(Box::new(elem), *count as usize)
        }
        [inner @ .., Token {
            kind: TokenKind::Star,
            ..
        }] if !inner.is_empty() => TypeExprKind::Pointer(Box::new(type_expr(inner)?)),
        [Token {
            kind: TokenKind::Tuple(children),
            ..
        }] => TypeExprKind::Tuple(type_fields(children)?),
        _ => return Err(invalid()),
    };
    Ok(TypeExpr { kind, span })
}

fn type_fields(tokens: &[Token]) -> Result<Vec<TypeField>, ParseError> {
    if tokens.is_empty() {
        return Ok(Vec::new());
    }
    tokens
        .split(|t| t.kind == TokenKind::Comma)
        .map(|part| match part {
            [Token {
                kind: TokenKind::Identifier(name),
                ..
            }, Token {
                kind: TokenKind::Colon,
                ..
            }, rest @ ..]
                if !rest.is_empty() =>
            {
                Ok(TypeField {
                    name: Some(name.clone()),
                    ty: type_expr(rest)?,
                })
            }
            _ => Ok(TypeField {
                name: None,
                ty: type_expr(part)?,
            }),
        })
        .collect()
}

fn span_of(tokens: &[Token]) -> Option<Span> {
    Some(tokens.first()?.span.merge(tokens.last()?.span))
}

#[derive(Debug, Clone, Copy)]
enum Assoc {
    Left,
    Right,
}

fn infix_op(kind: &TokenKind) -> Option<(Operator, u8, Assoc)> {
    let entry = match kind {
        TokenKind::Hash => (Operator::RCall, 1, Assoc::Right),
        TokenKind::Pipe => (Operator::Or, 2, Assoc::Left),
        TokenKind::Amp => (Operator::And, 3, Assoc::Left),
        TokenKind::EqEq => (Operator::Eq, 4, Assoc::Left),
        TokenKind::BangEq => (Operator::Neq, 4, Assoc::Left),
        TokenKind::Lt => (Operator::Lt, 5, Assoc::Left),
        TokenKind::LtEq => (Operator::Lte, 5, Assoc::Left),
        TokenKind::Gt => (Operator::Gt, 5, Assoc::Left),
        TokenKind::GtEq => (Operator::Gte, 5, Assoc::Left),
        TokenKind::Plus => (Operator::Add, 6, Assoc::Left),
        TokenKind::Minus => (Operator::Sub, 6, Assoc::Left),
        TokenKind::Star => (Operator::Mul, 7, Assoc::Left),
        TokenKind::Slash => (Operator::Div, 7, Assoc::Left),
        TokenKind::Percent => (Operator::Mod, 7, Assoc::Left),
        TokenKind::Compose => (Operator::Comp, 8, Assoc::Right),
        TokenKind::Question => (Operator::Ctrl, 9, Assoc::Right),
        _ => return None,
    };
    Some(entry)
}

/// Parse a whole token stream into statements, allocating lambda body
/// scopes in `scopes`.
pub fn parse(tokens: &[Token], scopes: &mut ScopeTree) -> Result<Vec<Expr>, ParseError> {
    Parser::new(tokens, scopes).statements()
}

/// Parse a program into a fresh scope tree whose root holds the
/// top-level statements.
pub fn parse_program(tokens: &[Token]) -> Result<ScopeTree, ParseError> {
    let mut tree = ScopeTree::new();
    let exprs = parse(tokens, &mut tree)?;
    let root = tree.root_mut();
    root.span = span_of(tokens).unwrap_or_default();
    root.exprs = exprs;
    Ok(tree)
}
