//! Lexer — Tokenizes regal source code and folds bracket groups.
//!
//! Scanning is a single pass over the characters of the source:
//!
//! - **Symbols** are read as a contiguous run and split into one token
//!   per character. Afterwards the comparison operators `==`, `!=`, `<=`
//!   and `>=` are recomposed from adjacent characters of the same run;
//!   every other pair stays split, so `=\` or `>(` never merge.
//!
//! - **Comments**: `;` starts a line comment only when nothing else has
//!   been scanned on that line. Anywhere else it separates statements.
//!
//! - **Folding**: once the flat stream exists, balanced `{...}` runs
//!   become one [`TokenKind::Compound`] and balanced `(...)` runs become
//!   one [`TokenKind::Tuple`], recursively, so the parser works on a
//!   tree of tokens.
//!
//! The first malformed literal or stray bracket stops the lexer.

use crate::errors::LexError;
use crate::token::{Span, Token, TokenKind};

pub struct Lexer<'src> {
    source: &'src str,
    chars: Vec<(usize, char)>,
    current: usize,
    line: usize,
    tokens: Vec<Token>,
}

impl<'src> Lexer<'src> {
    pub fn new(source: &'src str) -> Self {
        Self {
            source,
            chars: source.char_indices().collect(),
            current: 0,
            line: 1,
            tokens: Vec::new(),
        }
    }

    /// Scan the whole source and fold bracket groups. Comment tokens are
    /// kept; see [`strip_comments`].
    pub fn tokenize(mut self) -> Result<Vec<Token>, LexError> {
        while let Some(c) = self.peek() {
            match c {
                '\n' => {
                    self.advance();
                    self.line += 1;
                }
                c if c.is_whitespace() => {
                    self.advance();
                }
                '"' => self.string()?,
                ';' if self.starts_line() => self.comment(),
                c if c.is_alphabetic() => self.identifier(),
                c if c.is_ascii_digit() => self.number()?,
                c if TokenKind::symbol(c).is_some() => self.symbols(),
                c => {
                    let start = self.byte_pos();
                    return Err(LexError::UnexpectedChar {
                        ch: c,
                        line: self.line,
                        index: self.tokens.len(),
                        span: Span::new(start, start + c.len_utf8()),
                    });
                }
            }
        }
        fold(self.tokens)
    }

    fn starts_line(&self) -> bool {
        self.tokens.last().map_or(true, |t| t.line != self.line)
    }

    fn comment(&mut self) {
        let start = self.byte_pos();
        self.advance(); // consume ;
        let text_start = self.byte_pos();
        while matches!(self.peek(), Some(c) if c != '\n') {
            self.advance();
        }
        let text = self.source[text_start..self.byte_pos()].to_string();
        self.push(TokenKind::Comment(text), start);
    }

    fn string(&mut self) -> Result<(), LexError> {
        let start = self.byte_pos();
        let line = self.line;
        self.advance(); // opening quote
        let text_start = self.byte_pos();
        loop {
            match self.peek() {
                Some('"') => break,
                Some(c) => {
                    if c == '\n' {
                        self.line += 1;
                    }
                    self.advance();
                }
                None => {
                    return Err(LexError::UnterminatedString {
                        line,
                        index: self.tokens.len(),
                        span: Span::new(start, self.byte_pos()),
                    });
                }
            }
        }
        let text = self.source[text_start..self.byte_pos()].to_string();
        self.advance(); // closing quote
        self.tokens.push(Token::new(
            TokenKind::Str(text),
            Span::new(start, self.byte_pos()),
            line,
        ));
        Ok(())
    }

    fn identifier(&mut self) {
        let start = self.byte_pos();
        while matches!(self.peek(), Some(c) if c.is_alphanumeric() || c == '_') {
            self.advance();
        }
        let name = self.source[start..self.byte_pos()].to_string();
        self.push(TokenKind::Identifier(name), start);
    }

    fn number(&mut self) -> Result<(), LexError> {
        let start = self.byte_pos();

        if self.peek() == Some('0') && self.peek_next() == Some('x') {
            self.advance();
            self.advance();
            let digits = self.byte_pos();
            while matches!(self.peek(), Some(c) if c.is_ascii_hexdigit()) {
                self.advance();
            }
            let value = u32::from_str_radix(&self.source[digits..self.byte_pos()], 16)
                .map_err(|_| self.literal_error("hex", start))?;
            self.push(TokenKind::Hex(value), start);
            return Ok(());
        }

        self.digits();
        if self.peek() == Some('.') {
            self.advance();
            self.digits();
            let value = self.source[start..self.byte_pos()]
                .parse::<f32>()
                .map_err(|_| self.literal_error("float", start))?;
            self.push(TokenKind::Float(value), start);
        } else {
            let value = self.source[start..self.byte_pos()]
                .parse::<i32>()
                .map_err(|_| self.literal_error("int", start))?;
            self.push(TokenKind::Int(value), start);
        }
        Ok(())
    }

    fn digits(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.advance();
        }
    }

    fn symbols(&mut self) {
        let mut run: Vec<(TokenKind, Span)> = Vec::new();
        while let Some(kind) = self.peek().and_then(TokenKind::symbol) {
            let start = self.byte_pos();
            self.advance();
            run.push((kind, Span::new(start, self.byte_pos())));
        }

        let mut i = 0;
        while i < run.len() {
            let (kind, span) = &run[i];
            let pair = run
                .get(i + 1)
                .and_then(|(next, next_span)| {
                    TokenKind::compose_pair(kind, next).map(|k| (k, span.merge(*next_span)))
                });
            match pair {
                Some((kind, span)) => {
                    self.tokens.push(Token::new(kind, span, self.line));
                    i += 2;
                }
                None => {
                    self.tokens.push(Token::new(kind.clone(), *span, self.line));
                    i += 1;
                }
            }
        }
    }

    fn literal_error(&self, kind: &'static str, start: usize) -> LexError {
        LexError::Literal {
            kind,
            text: self.source[start..self.byte_pos()].to_string(),
            line: self.line,
            index: self.tokens.len(),
            span: Span::new(start, self.byte_pos()),
        }
    }

    // ── Character access ────────────────────────────────────────────

    fn push(&mut self, kind: TokenKind, start: usize) {
        let span = Span::new(start, self.byte_pos());
        self.tokens.push(Token::new(kind, span, self.line));
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.peek();
        if c.is_some() {
            self.current += 1;
        }
        c
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.current).map(|&(_, c)| c)
    }

    fn peek_next(&self) -> Option<char> {
        self.chars.get(self.current + 1).map(|&(_, c)| c)
    }

    fn byte_pos(&self) -> usize {
        self.chars
            .get(self.current)
            .map_or(self.source.len(), |&(pos, _)| pos)
    }
}

/// Tokenize and fold a whole source text.
pub fn tokenize(source: &str) -> Result<Vec<Token>, LexError> {
    Lexer::new(source).tokenize()
}

/// Drop comment tokens at every nesting level.
pub fn strip_comments(tokens: Vec<Token>) -> Vec<Token> {
    tokens
        .into_iter()
        .filter(|t| !t.is_comment())
        .map(|Token { kind, span, line }| {
            let kind = match kind {
                TokenKind::Compound(children) => TokenKind::Compound(strip_comments(children)),
                TokenKind::Tuple(children) => TokenKind::Tuple(strip_comments(children)),
                other => other,
            };
            Token::new(kind, span, line)
        })
        .collect()
}

// ── Bracket folding ─────────────────────────────────────────────────

fn fold(tokens: Vec<Token>) -> Result<Vec<Token>, LexError> {
    let compounds = group(tokens, &TokenKind::LBrace, &TokenKind::RBrace, TokenKind::Compound)?;
    fold_tuples(compounds)
}

fn fold_tuples(tokens: Vec<Token>) -> Result<Vec<Token>, LexError> {
    let tokens = tokens
        .into_iter()
        .map(|Token { kind, span, line }| -> Result<Token, LexError> {
            let kind = match kind {
                TokenKind::Compound(children) => TokenKind::Compound(fold_tuples(children)?),
                other => other,
            };
            Ok(Token::new(kind, span, line))
        })
        .collect::<Result<Vec<_>, _>>()?;
    group(tokens, &TokenKind::LParen, &TokenKind::RParen, TokenKind::Tuple)
}

/// Replace every balanced `open ... close` run with one token built by
/// `make` from the enclosed tokens.
fn group(
    tokens: Vec<Token>,
    open: &TokenKind,
    close: &TokenKind,
    make: fn(Vec<Token>) -> TokenKind,
) -> Result<Vec<Token>, LexError> {
    let mut stack: Vec<(Token, Vec<Token>)> = Vec::new();
    let mut out = Vec::new();

    for token in tokens {
        if token.kind == *open {
            stack.push((token, Vec::new()));
            continue;
        }
        let token = if token.kind == *close {
            let Some((opener, children)) = stack.pop() else {
                return Err(unbalanced(&token));
            };
            Token::new(make(children), opener.span.merge(token.span), opener.line)
        } else {
            token
        };
        match stack.last_mut() {
            Some((_, children)) => children.push(token),
            None => out.push(token),
        }
    }

    match stack.pop() {
        Some((opener, _)) => Err(unbalanced(&opener)),
        None => Ok(out),
    }
}

fn unbalanced(token: &Token) -> LexError {
    LexError::UnbalancedBracket {
        bracket: token.kind.to_string(),
        line: token.line,
        span: token.span,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(source: &str) -> Vec<TokenKind> {
        tokenize(source)
            .expect("lex errors")
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    fn ident(name: &str) -> TokenKind {
        TokenKind::Identifier(name.to_string())
    }

    #[test]
    fn test_numbers() {
        let tokens = lex("42 0xff 3.5 7.");
        assert_eq!(
            tokens,
            vec![
                TokenKind::Int(42),
                TokenKind::Hex(255),
                TokenKind::Float(3.5),
                TokenKind::Float(7.0),
            ]
        );
    }

    #[test]
    fn test_bad_literals() {
        assert!(matches!(
            tokenize("0x"),
            Err(LexError::Literal { kind: "hex", .. })
        ));
        assert!(matches!(
            tokenize("[ a: int = 99999999999"),
            Err(LexError::Literal { kind: "int", index: 5, .. })
        ));
    }

    #[test]
    fn test_strings() {
        let tokens = lex(r#""hello" """#);
        assert_eq!(
            tokens,
            vec![TokenKind::Str("hello".into()), TokenKind::Str(String::new())]
        );
        assert!(matches!(
            tokenize("print # \"oops"),
            Err(LexError::UnterminatedString { line: 1, index: 2, .. })
        ));
    }

    #[test]
    fn test_identifiers() {
        let tokens = lex("add_to_base x1");
        assert_eq!(tokens, vec![ident("add_to_base"), ident("x1")]);
    }

    #[test]
    fn test_symbol_runs_split() {
        let tokens = lex("=\\x >()");
        assert_eq!(
            tokens[..2],
            [TokenKind::Eq, TokenKind::Backslash],
        );
        // `>(` stays two tokens; the parens fold into an empty tuple.
        assert!(matches!(tokens[3], TokenKind::Gt));
    }

    #[test]
    fn test_comparison_operators_recomposed() {
        let tokens = lex("a == b != c <= d >= e");
        let ops: Vec<_> = tokens.into_iter().skip(1).step_by(2).collect();
        assert_eq!(
            ops,
            vec![TokenKind::EqEq, TokenKind::BangEq, TokenKind::LtEq, TokenKind::GtEq]
        );
        // Only adjacent characters merge.
        assert_eq!(lex("= ="), vec![TokenKind::Eq, TokenKind::Eq]);
        assert_eq!(lex("==="), vec![TokenKind::EqEq, TokenKind::Eq]);
    }

    #[test]
    fn test_compose_symbol() {
        assert_eq!(lex("f • g"), vec![ident("f"), TokenKind::Compose, ident("g")]);
    }

    #[test]
    fn test_comments_only_at_line_start() {
        let tokens = lex("; header\n[ a: int = 1; a\n  ; note");
        assert_eq!(tokens[0], TokenKind::Comment(" header".into()));
        assert!(tokens.contains(&TokenKind::Semicolon));
        assert_eq!(tokens.last(), Some(&TokenKind::Comment(" note".into())));
    }

    #[test]
    fn test_strip_comments() {
        let tokens = tokenize("{\n; inside\n1\n}").expect("lex errors");
        let tokens = strip_comments(tokens);
        assert_eq!(
            tokens[0].kind,
            TokenKind::Compound(vec![Token::new(TokenKind::Int(1), Span::new(11, 12), 3)])
        );
    }

    #[test]
    fn test_line_numbers() {
        let tokens = tokenize("a\nb\n\nc").expect("lex errors");
        let lines: Vec<_> = tokens.iter().map(|t| t.line).collect();
        assert_eq!(lines, vec![1, 2, 4]);
    }

    #[test]
    fn test_bracket_folding() {
        let tokens = lex("f(1, (2)) { (3) }");
        assert_eq!(tokens.len(), 3);
        let TokenKind::Tuple(args) = &tokens[1] else {
            panic!("expected tuple, got {:?}", tokens[1]);
        };
        assert_eq!(args.len(), 3);
        assert!(matches!(args[2].kind, TokenKind::Tuple(ref inner) if inner.len() == 1));
        let TokenKind::Compound(body) = &tokens[2] else {
            panic!("expected compound, got {:?}", tokens[2]);
        };
        assert!(matches!(body[0].kind, TokenKind::Tuple(_)));
    }

    #[test]
    fn test_folded_span_covers_brackets() {
        let tokens = tokenize("(1)").expect("lex errors");
        assert_eq!(tokens[0].span, Span::new(0, 3));
    }

    #[test]
    fn test_unbalanced_brackets() {
        assert!(matches!(
            tokenize("(1, 2"),
            Err(LexError::UnbalancedBracket { ref bracket, .. }) if bracket == "("
        ));
        assert!(matches!(
            tokenize("{ 1 }}"),
            Err(LexError::UnbalancedBracket { ref bracket, .. }) if bracket == "}"
        ));
        assert!(tokenize("( { ) }").is_err());
    }

    #[test]
    fn test_unexpected_character() {
        let err = tokenize("[ a: int = 1;\n@").unwrap_err();
        assert!(matches!(
            err,
            LexError::UnexpectedChar { ch: '@', line: 2, index: 7, .. }
        ));
    }
}
