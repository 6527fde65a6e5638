//! Regal Compiler — Frontend, resolver and backend for the regal closure language.
//!
//! # Compiler Pipeline
//!
//! ```text
//! Source Code (.rg)
//!     │
//!     ▼
//! ┌──────────┐
//! │  Lexer    │  Tokens with spans; brackets nest into tuple/compound tokens
//! └────┬─────┘
//!      │
//!      ▼
//! ┌──────────┐
//! │  Parser   │  Precedence climbing with speculative assignment
//! └────┬─────┘
//!      │
//!      ▼
//! ┌──────────┐
//! │ Resolver  │  Desugaring, declarations, inference, windows, captures
//! └────┬─────┘
//!      │
//!      ▼
//! ┌──────────┐
//! │ Compiler  │  Scope tree → register-machine bytecode
//! └────┬─────┘
//!      │
//!      ▼
//! Bytecode (.rgb)  ──▶  Machine
//! ```

pub mod ast;
pub mod bytecode;
pub mod compiler;
pub mod errors;
pub mod lexer;
pub mod machine;
pub mod parser;
pub mod resolver;
pub mod scope;
pub mod token;
pub mod types;

use bytecode::Program;
use errors::Error;
use machine::{Execution, Machine};
use scope::ScopeTree;

/// Tokenize, parse and resolve `source`.
pub fn frontend(source: &str) -> Result<ScopeTree, Error> {
    let tokens = lexer::strip_comments(lexer::tokenize(source)?);
    let mut tree = parser::parse_program(&tokens)?;
    resolver::precompile(&mut tree)?;
    Ok(tree)
}

/// Compile `source` into a program, keeping the resolved tree for
/// inspecting variables.
pub fn compile(source: &str) -> Result<(ScopeTree, Program), Error> {
    let tree = frontend(source)?;
    let program = compiler::compile(&tree)?;
    Ok((tree, program))
}

/// Compile and run `source`, returning the program's variables.
pub fn run(source: &str) -> Result<(ScopeTree, Execution), Error> {
    let (tree, program) = compile(source)?;
    let execution = Machine::new().execute(&program, tree.root().size())?;
    Ok((tree, execution))
}
