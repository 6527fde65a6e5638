//! Regal compiler CLI entry point.
//!
//! Usage:
//!   regalc lex <input.rg>                       (dump tokens)
//!   regalc parse <input.rg>                     (dump statements)
//!   regalc check <input.rg>                     (dump resolved scopes)
//!   regalc compile <input.rg> [-o out.rgb] [--listing]
//!   regalc run <input.rg | input.rgb> [--trace] [--max-ticks N]

use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Report, Result};
use regal_compiler::bytecode::{self, Program};
use regal_compiler::errors::{Error, RuntimeError};
use regal_compiler::machine::{Machine, TICK_LIMIT};
use regal_compiler::{lexer, parser};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[clap(name = "regalc", version, about = "Compiler for the regal closure language")]
struct Command {
    /// Log compiler passes to stderr
    #[clap(short, long)]
    verbose: bool,

    #[clap(subcommand)]
    command: Action,
}

#[derive(Subcommand)]
enum Action {
    /// Print the token stream
    Lex { input: PathBuf },

    /// Print the parsed statements
    Parse { input: PathBuf },

    /// Resolve the program and print its scopes
    Check { input: PathBuf },

    /// Compile to a bytecode file
    Compile {
        input: PathBuf,

        /// Output path, defaults to the input with an .rgb extension
        #[clap(short, long)]
        output: Option<PathBuf>,

        /// Print the instruction listing
        #[clap(long)]
        listing: bool,
    },

    /// Compile (or load) and run on the reference machine
    Run {
        input: PathBuf,

        /// Print every instruction before it executes
        #[clap(long)]
        trace: bool,

        #[clap(long, default_value_t = TICK_LIMIT)]
        max_ticks: u32,
    },
}

fn main() -> Result<()> {
    let command = Command::parse();

    if command.verbose {
        tracing_subscriber::fmt::Subscriber::builder()
            .without_time()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(std::io::stderr)
            .init();
    }

    match command.command {
        Action::Lex { input } => {
            let source = read(&input)?;
            let tokens = lexer::tokenize(&source).map_err(|e| report(e.into(), &source))?;
            for token in lexer::strip_comments(tokens) {
                let span = format!("{}..{}", token.span.start, token.span.end);
                println!("{:>4}  {:<8}  {}", token.line, span, token.kind);
            }
        }
        Action::Parse { input } => {
            let source = read(&input)?;
            let tokens = lexer::tokenize(&source).map_err(|e| report(e.into(), &source))?;
            let tree = parser::parse_program(&lexer::strip_comments(tokens))
                .map_err(|e| report(e.into(), &source))?;
            for stmt in &tree.root().exprs {
                println!("{}", stmt);
            }
        }
        Action::Check { input } => {
            let source = read(&input)?;
            let tree = regal_compiler::frontend(&source).map_err(|e| report(e, &source))?;
            print!("{}", tree);
        }
        Action::Compile {
            input,
            output,
            listing,
        } => {
            let source = read(&input)?;
            let (_, program) =
                regal_compiler::compile(&source).map_err(|e| report(e, &source))?;
            if listing {
                print!("{}", program.listing());
            }
            let output = output.unwrap_or_else(|| input.with_extension("rgb"));
            bytecode::write_bytecode(&output, &program).into_diagnostic()?;
            eprintln!(
                "Compiled {} instructions to {}",
                program.instructions.len(),
                output.display()
            );
        }
        Action::Run {
            input,
            trace,
            max_ticks,
        } => {
            let (program, registers) = load(&input)?;
            let mut machine = Machine::new().with_tick_limit(max_ticks);
            let status = machine.run(
                &program.instructions,
                |pc, inst| {
                    if trace {
                        eprintln!("{:>5}  {}", pc, inst);
                    }
                    0
                },
                |text| print!("{}", text),
            );
            println!();
            if status != 0 {
                return Err(miette::miette!("{}", RuntimeError { status }));
            }
            for i in 0..registers {
                if let Some(value) = machine.register(bytecode::Bank::Local, i) {
                    println!("r{:<3} {}", i, value);
                }
            }
        }
    }
    Ok(())
}

fn read(path: &Path) -> Result<String> {
    fs::read_to_string(path).into_diagnostic()
}

/// Source programs are compiled first; `.rgb` files are loaded as is and
/// have no known window size.
fn load(path: &Path) -> Result<(Program, usize)> {
    if path.extension().is_some_and(|ext| ext == "rgb") {
        let program = bytecode::read_bytecode(path).into_diagnostic()?;
        return Ok((program, 0));
    }
    let source = read(path)?;
    let (tree, program) = regal_compiler::compile(&source).map_err(|e| report(e, &source))?;
    Ok((program, tree.root().size()))
}

fn report(err: Error, source: &str) -> Report {
    Report::new(err.with_source(source))
}
