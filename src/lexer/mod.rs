// Luno Lexer Module

pub mod scanner;
pub mod token;

pub use scanner::Lexer;
pub use token::{Token, TokenKind};
