//! `steelc` — a single-pass compiler from a small statically-typed C-like
//! language to x86-64 NASM assembly (System V AMD64 ABI, Linux).
//!
//! The pipeline is a direct call chain with no intermediate representation:
//! [`lexer`] produces tokens on demand, [`parser`] consumes them into a typed
//! [`ast`] while populating the [`symtab`], and [`emit`] walks the finished
//! tree to produce NASM source text. [`cli`] and `main` (the `steelc` binary)
//! are the only parts of the crate concerned with argument parsing, file I/O,
//! or invoking `nasm`/`ld`; the library surface below is a single function,
//! [`compile`].

#[macro_use]
extern crate clap;

pub mod ast;
pub mod cli;
pub mod emit;
pub mod error;
pub mod lexer;
pub mod parser;
pub mod symtab;
pub mod token;

use error::Error;
use parser::Parser;
use std::path::Path;

/// Runs the full pipeline — lex, parse/check, emit — against one source
/// file and returns the generated NASM assembly text. The lexer is driven
/// lazily from inside the parser, pulling one token at a time, rather than
/// being run to completion up front.
pub fn compile(path: &Path) -> Result<String, Error> {
    let parser = Parser::from_path(path)?;
    let output = parser.parse()?;
    emit::emit(&output.root, &output.symtab)
}

#[cfg(test)]
mod tests;
