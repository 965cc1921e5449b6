// Luno Token Definitions

use crate::error::Span;
use std::fmt;
use std::sync::Arc;

/// All token types in Luno
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    // Literals
    Int(i64),
    Float(f64),
    Str(Arc<str>),

    // Identifiers
    Name(Arc<str>),

    // Keywords
    And,
    Break,
    Case,
    Catch,
    Continue,
    Default,
    Defer,
    Do,
    Else,
    Elseif,
    End,
    False,
    Finally,
    For,
    Function,
    Goto,
    If,
    Import,
    In,
    Local,
    Module,
    Nil,
    Not,
    Or,
    Repeat,
    Return,
    Switch,
    Then,
    True,
    Try,
    Until,
    When,
    While,

    // Operators
    Plus,         // +
    Minus,        // -
    Star,         // *
    Slash,        // /
    SlashSlash,   // //
    Percent,      // %
    Caret,        // ^
    Hash,         // #
    Ampersand,    // &
    Tilde,        // ~
    Pipe,         // |
    Shl,          // <<
    Shr,          // >>
    EqualEqual,   // ==
    NotEqual,     // ~=
    LessEqual,    // <=
    GreaterEqual, // >=
    Less,         // <
    Greater,      // >
    Equal,        // =

    // Delimiters
    LeftParen,    // (
    RightParen,   // )
    LeftBrace,    // {
    RightBrace,   // }
    LeftBracket,  // [
    RightBracket, // ]
    DoubleColon,  // ::
    Semicolon,    // ;
    Colon,        // :
    Comma,        // ,
    Dot,          // .
    Concat,       // ..
    Ellipsis,     // ...

    Eof,
}

impl TokenKind {
    /// Map a word to its keyword token, if it is one.
    pub fn keyword(text: &str) -> Option<TokenKind> {
        Some(match text {
            "and" => TokenKind::And,
            "break" => TokenKind::Break,
            "case" => TokenKind::Case,
            "catch" => TokenKind::Catch,
            "continue" => TokenKind::Continue,
            "default" => TokenKind::Default,
            "defer" => TokenKind::Defer,
            "do" => TokenKind::Do,
            "else" => TokenKind::Else,
            "elseif" => TokenKind::Elseif,
            "end" => TokenKind::End,
            "false" => TokenKind::False,
            "finally" => TokenKind::Finally,
            "for" => TokenKind::For,
            "function" => TokenKind::Function,
            "goto" => TokenKind::Goto,
            "if" => TokenKind::If,
            "import" => TokenKind::Import,
            "in" => TokenKind::In,
            "local" => TokenKind::Local,
            "module" => TokenKind::Module,
            "nil" => TokenKind::Nil,
            "not" => TokenKind::Not,
            "or" => TokenKind::Or,
            "repeat" => TokenKind::Repeat,
            "return" => TokenKind::Return,
            "switch" => TokenKind::Switch,
            "then" => TokenKind::Then,
            "true" => TokenKind::True,
            "try" => TokenKind::Try,
            "until" => TokenKind::Until,
            "when" => TokenKind::When,
            "while" => TokenKind::While,
            _ => return None,
        })
    }

    pub fn is_block_follow(&self) -> bool {
        matches!(
            self,
            TokenKind::Else
                | TokenKind::Elseif
                | TokenKind::End
                | TokenKind::Until
                | TokenKind::Case
                | TokenKind::Default
                | TokenKind::Catch
                | TokenKind::Finally
                | TokenKind::Eof
        )
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Int(n) => write!(f, "{}", n),
            TokenKind::Float(n) => write!(f, "{}", n),
            TokenKind::Str(s) => write!(f, "\"{}\"", s),
            TokenKind::Name(s) => write!(f, "{}", s),
            TokenKind::And => write!(f, "and"),
            TokenKind::Break => write!(f, "break"),
            TokenKind::Case => write!(f, "case"),
            TokenKind::Catch => write!(f, "catch"),
            TokenKind::Continue => write!(f, "continue"),
            TokenKind::Default => write!(f, "default"),
            TokenKind::Defer => write!(f, "defer"),
            TokenKind::Do => write!(f, "do"),
            TokenKind::Else => write!(f, "else"),
            TokenKind::Elseif => write!(f, "elseif"),
            TokenKind::End => write!(f, "end"),
            TokenKind::False => write!(f, "false"),
            TokenKind::Finally => write!(f, "finally"),
            TokenKind::For => write!(f, "for"),
            TokenKind::Function => write!(f, "function"),
            TokenKind::Goto => write!(f, "goto"),
            TokenKind::If => write!(f, "if"),
            TokenKind::Import => write!(f, "import"),
            TokenKind::In => write!(f, "in"),
            TokenKind::Local => write!(f, "local"),
            TokenKind::Module => write!(f, "module"),
            TokenKind::Nil => write!(f, "nil"),
            TokenKind::Not => write!(f, "not"),
            TokenKind::Or => write!(f, "or"),
            TokenKind::Repeat => write!(f, "repeat"),
            TokenKind::Return => write!(f, "return"),
            TokenKind::Switch => write!(f, "switch"),
            TokenKind::Then => write!(f, "then"),
            TokenKind::True => write!(f, "true"),
            TokenKind::Try => write!(f, "try"),
            TokenKind::Until => write!(f, "until"),
            TokenKind::When => write!(f, "when"),
            TokenKind::While => write!(f, "while"),
            TokenKind::Plus => write!(f, "+"),
            TokenKind::Minus => write!(f, "-"),
            TokenKind::Star => write!(f, "*"),
            TokenKind::Slash => write!(f, "/"),
            TokenKind::SlashSlash => write!(f, "//"),
            TokenKind::Percent => write!(f, "%"),
            TokenKind::Caret => write!(f, "^"),
            TokenKind::Hash => write!(f, "#"),
            TokenKind::Ampersand => write!(f, "&"),
            TokenKind::Tilde => write!(f, "~"),
            TokenKind::Pipe => write!(f, "|"),
            TokenKind::Shl => write!(f, "<<"),
            TokenKind::Shr => write!(f, ">>"),
            TokenKind::EqualEqual => write!(f, "=="),
            TokenKind::NotEqual => write!(f, "~="),
            TokenKind::LessEqual => write!(f, "<="),
            TokenKind::GreaterEqual => write!(f, ">="),
            TokenKind::Less => write!(f, "<"),
            TokenKind::Greater => write!(f, ">"),
            TokenKind::Equal => write!(f, "="),
            TokenKind::LeftParen => write!(f, "("),
            TokenKind::RightParen => write!(f, ")"),
            TokenKind::LeftBrace => write!(f, "{{"),
            TokenKind::RightBrace => write!(f, "}}"),
            TokenKind::LeftBracket => write!(f, "["),
            TokenKind::RightBracket => write!(f, "]"),
            TokenKind::DoubleColon => write!(f, "::"),
            TokenKind::Semicolon => write!(f, ";"),
            TokenKind::Colon => write!(f, ":"),
            TokenKind::Comma => write!(f, ","),
            TokenKind::Dot => write!(f, "."),
            TokenKind::Concat => write!(f, ".."),
            TokenKind::Ellipsis => write!(f, "..."),
            TokenKind::Eof => write!(f, "EOF"),
        }
    }
}

/// A token with its kind and position information
#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

impl Token {
    pub fn new(kind: TokenKind, span: Span) -> Self {
        Self { kind, span }
    }

    pub fn is_eof(&self) -> bool {
        matches!(self.kind, TokenKind::Eof)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)
    }
}
