//! Token types for the regal language.
//!
//! Each token carries its kind, the source line it starts on, and a span
//! of byte offsets into the source. Bracket groups are folded into a
//! single token that owns its children, so the parser never sees a bare
//! `{`, `}`, `(` or `)`.

use std::fmt;

/// Byte offset range in the source string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// Merge two spans into one that covers both.
    pub fn merge(self, other: Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// All token kinds in the regal language.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    // Literals
    Hex(u32),
    Int(i32),
    Float(f32),
    Str(String),

    Identifier(String),

    /// Line comment text, without the leading `;`.
    Comment(String),

    // Bracket groups, produced by the folding pass
    Compound(Vec<Token>),
    Tuple(Vec<Token>),

    // Symbols
    Colon,     // :
    Semicolon, // ;
    Comma,     // ,
    Backslash, // \
    LBrace,    // {
    RBrace,    // }
    LParen,    // (
    RParen,    // )
    LBracket,  // [
    RBracket,  // ]
    Dot,       // .
    Eq,        // =
    EqEq,      // ==
    BangEq,    // !=
    Lt,        // <
    Gt,        // >
    LtEq,      // <=
    GtEq,      // >=
    Plus,      // +
    Minus,     // -
    Star,      // *
    Slash,     // /
    Percent,   // %
    Bang,      // !
    Tilde,     // ~
    Hash,      // #
    Amp,       // &
    Pipe,      // |
    Question,  // ?
    Caret,     // ^
    Quote,     // '
    Compose,   // •
}

impl TokenKind {
    /// Single-character symbol lookup. Anything outside the symbol set is
    /// not a symbol character.
    pub fn symbol(c: char) -> Option<TokenKind> {
        let kind = match c {
            ':' => TokenKind::Colon,
            ';' => TokenKind::Semicolon,
            ',' => TokenKind::Comma,
            '\\' => TokenKind::Backslash,
            '{' => TokenKind::LBrace,
            '}' => TokenKind::RBrace,
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            '[' => TokenKind::LBracket,
            ']' => TokenKind::RBracket,
            '.' => TokenKind::Dot,
            '=' => TokenKind::Eq,
            '<' => TokenKind::Lt,
            '>' => TokenKind::Gt,
            '+' => TokenKind::Plus,
            '-' => TokenKind::Minus,
            '*' => TokenKind::Star,
            '/' => TokenKind::Slash,
            '%' => TokenKind::Percent,
            '!' => TokenKind::Bang,
            '~' => TokenKind::Tilde,
            '#' => TokenKind::Hash,
            '&' => TokenKind::Amp,
            '|' => TokenKind::Pipe,
            '?' => TokenKind::Question,
            '^' => TokenKind::Caret,
            '\'' => TokenKind::Quote,
            '•' => TokenKind::Compose,
            _ => return None,
        };
        Some(kind)
    }

    /// Two adjacent symbols that form one comparison operator.
    pub fn compose_pair(first: &TokenKind, second: &TokenKind) -> Option<TokenKind> {
        match (first, second) {
            (TokenKind::Eq, TokenKind::Eq) => Some(TokenKind::EqEq),
            (TokenKind::Bang, TokenKind::Eq) => Some(TokenKind::BangEq),
            (TokenKind::Lt, TokenKind::Eq) => Some(TokenKind::LtEq),
            (TokenKind::Gt, TokenKind::Eq) => Some(TokenKind::GtEq),
            _ => None,
        }
    }
}

/// A single token with its source location.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
    pub line: usize,
}

impl Token {
    pub fn new(kind: TokenKind, span: Span, line: usize) -> Self {
        Self { kind, span, line }
    }

    pub fn is_comment(&self) -> bool {
        matches!(self.kind, TokenKind::Comment(_))
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Hex(n) => write!(f, "0x{:x}", n),
            TokenKind::Int(n) => write!(f, "{}", n),
            TokenKind::Float(n) => write!(f, "{:?}", n),
            TokenKind::Str(s) => write!(f, "\"{}\"", s),
            TokenKind::Identifier(s) => write!(f, "{}", s),
            TokenKind::Comment(s) => write!(f, ";{}", s),
            TokenKind::Compound(children) => {
                write!(f, "{{")?;
                write_joined(f, children)?;
                write!(f, "}}")
            }
            TokenKind::Tuple(children) => {
                write!(f, "(")?;
                write_joined(f, children)?;
                write!(f, ")")
            }
            TokenKind::Colon => write!(f, ":"),
            TokenKind::Semicolon => write!(f, ";"),
            TokenKind::Comma => write!(f, ","),
            TokenKind::Backslash => write!(f, "\\"),
            TokenKind::LBrace => write!(f, "{{"),
            TokenKind::RBrace => write!(f, "}}"),
            TokenKind::LParen => write!(f, "("),
            TokenKind::RParen => write!(f, ")"),
            TokenKind::LBracket => write!(f, "["),
            TokenKind::RBracket => write!(f, "]"),
            TokenKind::Dot => write!(f, "."),
            TokenKind::Eq => write!(f, "="),
            TokenKind::EqEq => write!(f, "=="),
            TokenKind::BangEq => write!(f, "!="),
            TokenKind::Lt => write!(f, "<"),
            TokenKind::Gt => write!(f, ">"),
            TokenKind::LtEq => write!(f, "<="),
            TokenKind::GtEq => write!(f, ">="),
            TokenKind::Plus => write!(f, "+"),
            TokenKind::Minus => write!(f, "-"),
            TokenKind::Star => write!(f, "*"),
            TokenKind::Slash => write!(f, "/"),
            TokenKind::Percent => write!(f, "%"),
            TokenKind::Bang => write!(f, "!"),
            TokenKind::Tilde => write!(f, "~"),
            TokenKind::Hash => write!(f, "#"),
            TokenKind::Amp => write!(f, "&"),
            TokenKind::Pipe => write!(f, "|"),
            TokenKind::Question => write!(f, "?"),
            TokenKind::Caret => write!(f, "^"),
            TokenKind::Quote => write!(f, "'"),
            TokenKind::Compose => write!(f, "•"),
        }
    }
}

fn write_joined(f: &mut fmt::Formatter<'_>, tokens: &[Token]) -> fmt::Result {
    for (i, token) in tokens.iter().enumerate() {
        if i > 0 {
            write!(f, " ")?;
        }
        write!(f, "{}", token.kind)?;
    }
    Ok(())
}

/// Render a token run the way it would be written, for error messages.
pub fn describe(tokens: &[Token]) -> String {
    tokens
        .iter()
        .map(|t| t.kind.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}
