// Luno Scripting Language
// A register-bytecode runtime: lexer, compiler, VM, pattern engine

pub mod binary;
pub mod bridge;
pub mod compiler;
pub mod error;
pub mod lexer;
pub mod pattern;
pub mod stdlib;
pub mod vm;

pub use error::{ErrorKind, LunoError, LunoResult, Span};
pub use vm::value::Value;
pub use vm::Vm;

use std::sync::Arc;

/// Compile a source chunk to a function prototype.
///
/// Compilation is all-or-nothing: the first syntax error aborts the
/// whole chunk.
pub fn compile(source: &str, chunk_name: &str) -> LunoResult<Arc<compiler::Prototype>> {
    compiler::Parser::compile(source, chunk_name)
}

/// Compile and run a source chunk on a fresh VM, returning the chunk's
/// return values.
pub fn run(source: &str, chunk_name: &str) -> LunoResult<Vec<Value>> {
    let proto = compile(source, chunk_name)?;
    let mut vm = Vm::new();
    vm.execute(proto, &[])
}
