// Luno Compiler
// Source text to function prototypes in one pass

pub mod codegen;
pub mod exp;
pub mod opcode;
pub mod parser;
pub mod proto;

pub use parser::Parser;
pub use proto::{Constant, Prototype, UpvalueDesc};
