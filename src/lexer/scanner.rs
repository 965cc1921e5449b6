// Luno Scanner (Lexer)
// Streams tokens from source with one-token lookahead

use crate::error::{LunoError, LunoResult, Span};
use crate::lexer::token::{Token, TokenKind};
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Streaming lexer over Luno source code.
///
/// Identifiers and string literals are interned in a cache local to this
/// compile unit, so repeated literals share one allocation without
/// growing a process-wide pool.
pub struct Lexer {
    source: Vec<char>,
    current: usize,
    line: usize,
    column: usize,
    start: usize,
    start_line: usize,
    start_column: usize,
    file: String,
    lookahead: Option<Token>,
    interned: FxHashMap<String, Arc<str>>,
}

impl Lexer {
    pub fn new(source: &str, file: impl Into<String>) -> Self {
        Self {
            source: source.chars().collect(),
            current: 0,
            line: 1,
            column: 1,
            start: 0,
            start_line: 1,
            start_column: 1,
            file: file.into(),
            lookahead: None,
            interned: FxHashMap::default(),
        }
    }

    pub fn file(&self) -> &str {
        &self.file
    }

    /// Produce the next token, consuming it.
    pub fn next_token(&mut self) -> LunoResult<Token> {
        if let Some(tok) = self.lookahead.take() {
            return Ok(tok);
        }
        self.scan_token()
    }

    /// Look at the next token without consuming it.
    pub fn peek(&mut self) -> LunoResult<&Token> {
        if self.lookahead.is_none() {
            let tok = self.scan_token()?;
            self.lookahead = Some(tok);
        }
        Ok(self.lookahead.as_ref().unwrap())
    }

    fn scan_token(&mut self) -> LunoResult<Token> {
        self.skip_whitespace_and_comments()?;
        self.start = self.current;
        self.start_line = self.line;
        self.start_column = self.column;

        if self.is_at_end() {
            return Ok(self.make_token(TokenKind::Eof));
        }

        let c = self.advance();
        match c {
            '(' => Ok(self.make_token(TokenKind::LeftParen)),
            ')' => Ok(self.make_token(TokenKind::RightParen)),
            '{' => Ok(self.make_token(TokenKind::LeftBrace)),
            '}' => Ok(self.make_token(TokenKind::RightBrace)),
            ']' => Ok(self.make_token(TokenKind::RightBracket)),
            ',' => Ok(self.make_token(TokenKind::Comma)),
            ';' => Ok(self.make_token(TokenKind::Semicolon)),
            '+' => Ok(self.make_token(TokenKind::Plus)),
            '-' => Ok(self.make_token(TokenKind::Minus)),
            '*' => Ok(self.make_token(TokenKind::Star)),
            '%' => Ok(self.make_token(TokenKind::Percent)),
            '^' => Ok(self.make_token(TokenKind::Caret)),
            '#' => Ok(self.make_token(TokenKind::Hash)),
            '&' => Ok(self.make_token(TokenKind::Ampersand)),
            '|' => Ok(self.make_token(TokenKind::Pipe)),
            '/' => {
                if self.match_char('/') {
                    Ok(self.make_token(TokenKind::SlashSlash))
                } else {
                    Ok(self.make_token(TokenKind::Slash))
                }
            }
            '~' => {
                if self.match_char('=') {
                    Ok(self.make_token(TokenKind::NotEqual))
                } else {
                    Ok(self.make_token(TokenKind::Tilde))
                }
            }
            '<' => {
                if self.match_char('=') {
                    Ok(self.make_token(TokenKind::LessEqual))
                } else if self.match_char('<') {
                    Ok(self.make_token(TokenKind::Shl))
                } else {
                    Ok(self.make_token(TokenKind::Less))
                }
            }
            '>' => {
                if self.match_char('=') {
                    Ok(self.make_token(TokenKind::GreaterEqual))
                } else if self.match_char('>') {
                    Ok(self.make_token(TokenKind::Shr))
                } else {
                    Ok(self.make_token(TokenKind::Greater))
                }
            }
            '=' => {
                if self.match_char('=') {
                    Ok(self.make_token(TokenKind::EqualEqual))
                } else {
                    Ok(self.make_token(TokenKind::Equal))
                }
            }
            ':' => {
                if self.match_char(':') {
                    Ok(self.make_token(TokenKind::DoubleColon))
                } else {
                    Ok(self.make_token(TokenKind::Colon))
                }
            }
            '.' => {
                if self.match_char('.') {
                    if self.match_char('.') {
                        Ok(self.make_token(TokenKind::Ellipsis))
                    } else {
                        Ok(self.make_token(TokenKind::Concat))
                    }
                } else if self.peek_char().is_ascii_digit() {
                    self.number('.')
                } else {
                    Ok(self.make_token(TokenKind::Dot))
                }
            }
            '[' => {
                // [[ or [=[ opens a long string; a bare [ is an index
                if let Some(level) = self.check_long_bracket() {
                    let text = self.long_string(level, false)?;
                    let interned = self.intern(&text);
                    Ok(self.make_token(TokenKind::Str(interned)))
                } else {
                    Ok(self.make_token(TokenKind::LeftBracket))
                }
            }
            '"' | '\'' => self.short_string(c),
            c if c.is_ascii_digit() => self.number(c),
            c if c.is_alphabetic() || c == '_' => {
                while self.peek_char().is_alphanumeric() || self.peek_char() == '_' {
                    self.advance();
                }
                let text: String = self.source[self.start..self.current].iter().collect();
                match TokenKind::keyword(&text) {
                    Some(kind) => Ok(self.make_token(kind)),
                    None => {
                        let name = self.intern(&text);
                        Ok(self.make_token(TokenKind::Name(name)))
                    }
                }
            }
            _ => Err(self.error(&format!("Unexpected character '{}'", c))),
        }
    }

    fn skip_whitespace_and_comments(&mut self) -> LunoResult<()> {
        loop {
            match self.peek_char() {
                ' ' | '\t' | '\r' => {
                    self.advance();
                }
                '\n' => {
                    self.newline();
                }
                '-' if self.peek_next() == '-' => {
                    self.advance();
                    self.advance();
                    // --[[ opens a long comment
                    if self.peek_char() == '[' {
                        let saved = (self.current, self.line, self.column);
                        self.advance();
                        if let Some(level) = self.check_long_bracket() {
                            self.start_line = self.line;
                            self.start_column = self.column;
                            self.long_string(level, true)?;
                            continue;
                        }
                        self.current = saved.0;
                        self.line = saved.1;
                        self.column = saved.2;
                    }
                    while self.peek_char() != '\n' && !self.is_at_end() {
                        self.advance();
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    /// After consuming `[`, detect `=*[` and return the level, restoring
    /// position when this is not a long-bracket opener.
    fn check_long_bracket(&mut self) -> Option<usize> {
        let saved = (self.current, self.line, self.column);
        let mut level = 0;
        while self.peek_char() == '=' {
            self.advance();
            level += 1;
        }
        if self.peek_char() == '[' {
            self.advance();
            Some(level)
        } else {
            self.current = saved.0;
            self.line = saved.1;
            self.column = saved.2;
            None
        }
    }

    /// Body of a long string or long comment; the opening bracket has
    /// already been consumed. A newline immediately after the opener is
    /// skipped, per long-string convention.
    fn long_string(&mut self, level: usize, is_comment: bool) -> LunoResult<String> {
        let mut value = String::new();
        if self.peek_char() == '\r' {
            self.advance();
        }
        if self.peek_char() == '\n' {
            self.newline();
        }
        loop {
            if self.is_at_end() {
                let what = if is_comment {
                    "long comment"
                } else {
                    "long string"
                };
                return Err(self
                    .error(&format!("Unterminated {}", what))
                    .with_help(&format!("Close it with ]{}]", "=".repeat(level))));
            }
            if self.peek_char() == ']' {
                let saved = (self.current, self.line, self.column);
                self.advance();
                let mut close_level = 0;
                while self.peek_char() == '=' {
                    self.advance();
                    close_level += 1;
                }
                if close_level == level && self.peek_char() == ']' {
                    self.advance();
                    return Ok(value);
                }
                self.current = saved.0;
                self.line = saved.1;
                self.column = saved.2;
            }
            if self.peek_char() == '\n' {
                self.newline();
                value.push('\n');
            } else {
                value.push(self.advance());
            }
        }
    }

    fn short_string(&mut self, quote: char) -> LunoResult<Token> {
        let mut value = String::new();
        loop {
            if self.is_at_end() {
                return Err(self
                    .error("Unterminated string")
                    .with_help("Add a closing quote to terminate the string"));
            }
            let c = self.peek_char();
            if c == quote {
                self.advance();
                break;
            }
            if c == '\n' {
                return Err(self
                    .error("Unterminated string")
                    .with_help("Use [[...]] for strings spanning multiple lines"));
            }
            if c == '\\' {
                self.advance();
                self.escape_sequence(&mut value)?;
            } else {
                value.push(self.advance());
            }
        }
        let interned = self.intern(&value);
        Ok(self.make_token(TokenKind::Str(interned)))
    }

    fn escape_sequence(&mut self, out: &mut String) -> LunoResult<()> {
        if self.is_at_end() {
            return Err(self.error("Unexpected end of string after '\\'"));
        }
        let c = self.advance();
        match c {
            'n' => out.push('\n'),
            't' => out.push('\t'),
            'r' => out.push('\r'),
            'a' => out.push('\x07'),
            'b' => out.push('\x08'),
            'f' => out.push('\x0C'),
            'v' => out.push('\x0B'),
            '\\' => out.push('\\'),
            '"' => out.push('"'),
            '\'' => out.push('\''),
            '\n' => {
                self.line += 1;
                self.column = 1;
                out.push('\n');
            }
            'x' => {
                let mut hex = String::new();
                for _ in 0..2 {
                    let h = self.peek_char();
                    if !h.is_ascii_hexdigit() {
                        return Err(self
                            .error("Invalid hex escape")
                            .with_help("Use \\xHH where H is 0-9, a-f, or A-F"));
                    }
                    hex.push(self.advance());
                }
                let code = u8::from_str_radix(&hex, 16)
                    .map_err(|_| self.error(&format!("Invalid hex value: {}", hex)))?;
                out.push(code as char);
            }
            'u' => {
                if self.peek_char() != '{' {
                    return Err(self
                        .error("Invalid unicode escape")
                        .with_help("Use \\u{XXXX} with 1-6 hex digits"));
                }
                self.advance();
                let mut hex = String::new();
                while self.peek_char() != '}' {
                    let h = self.peek_char();
                    if !h.is_ascii_hexdigit() || hex.len() >= 6 {
                        return Err(self.error("Invalid unicode escape"));
                    }
                    hex.push(self.advance());
                }
                self.advance();
                if hex.is_empty() {
                    return Err(self.error("Empty unicode escape"));
                }
                let code = u32::from_str_radix(&hex, 16)
                    .map_err(|_| self.error(&format!("Invalid unicode value: {}", hex)))?;
                let ch = char::from_u32(code)
                    .ok_or_else(|| self.error(&format!("Invalid unicode code point: U+{:X}", code)))?;
                out.push(ch);
            }
            'z' => {
                // Skip following whitespace, including newlines
                loop {
                    match self.peek_char() {
                        ' ' | '\t' | '\r' => {
                            self.advance();
                        }
                        '\n' => {
                            self.newline();
                        }
                        _ => break,
                    }
                }
            }
            c if c.is_ascii_digit() => {
                // Decimal escape \ddd, up to three digits
                let mut code = c.to_digit(10).unwrap();
                for _ in 0..2 {
                    if !self.peek_char().is_ascii_digit() {
                        break;
                    }
                    code = code * 10 + self.advance().to_digit(10).unwrap();
                }
                if code > 255 {
                    return Err(self.error("Decimal escape too large"));
                }
                out.push(code as u8 as char);
            }
            _ => {
                return Err(self
                    .error(&format!("Invalid escape sequence '\\{}'", c))
                    .with_help("Valid escapes: \\n, \\t, \\r, \\\\, \\\", \\', \\xHH, \\u{...}, \\ddd, \\z"));
            }
        }
        Ok(())
    }

    fn number(&mut self, first: char) -> LunoResult<Token> {
        if first == '0' && (self.peek_char() == 'x' || self.peek_char() == 'X') {
            self.advance();
            return self.hex_number();
        }

        let mut is_float = first == '.';
        while self.peek_char().is_ascii_digit() {
            self.advance();
        }
        if !is_float && self.peek_char() == '.' && self.peek_next() != '.' {
            is_float = true;
            self.advance();
            while self.peek_char().is_ascii_digit() {
                self.advance();
            }
        }
        if self.peek_char() == 'e' || self.peek_char() == 'E' {
            let saved = self.current;
            self.advance();
            if self.peek_char() == '+' || self.peek_char() == '-' {
                self.advance();
            }
            if self.peek_char().is_ascii_digit() {
                is_float = true;
                while self.peek_char().is_ascii_digit() {
                    self.advance();
                }
            } else {
                self.current = saved;
            }
        }

        let lexeme: String = self.source[self.start..self.current].iter().collect();
        if is_float {
            let value: f64 = lexeme
                .parse()
                .map_err(|_| self.error(&format!("Invalid number '{}'", lexeme)))?;
            Ok(self.make_token(TokenKind::Float(value)))
        } else {
            match lexeme.parse::<i64>() {
                Ok(n) => Ok(self.make_token(TokenKind::Int(n))),
                // Integer literals beyond i64 range degrade to floats
                Err(_) => {
                    let value: f64 = lexeme
                        .parse()
                        .map_err(|_| self.error(&format!("Invalid number '{}'", lexeme)))?;
                    Ok(self.make_token(TokenKind::Float(value)))
                }
            }
        }
    }

    /// Hex integers (0xFF) and hex floats (0x1.8p3).
    fn hex_number(&mut self) -> LunoResult<Token> {
        let mut int_part: u64 = 0;
        let mut mantissa = 0.0f64;
        let mut digits = 0;
        let mut is_float = false;
        let mut exponent = 0i32;

        while self.peek_char().is_ascii_hexdigit() {
            let d = self.advance().to_digit(16).unwrap() as u64;
            int_part = int_part.wrapping_mul(16).wrapping_add(d);
            mantissa = mantissa * 16.0 + d as f64;
            digits += 1;
        }
        if self.peek_char() == '.' {
            is_float = true;
            self.advance();
            while self.peek_char().is_ascii_hexdigit() {
                let d = self.advance().to_digit(16).unwrap();
                mantissa = mantissa * 16.0 + d as f64;
                exponent -= 4;
                digits += 1;
            }
        }
        if digits == 0 {
            return Err(self.error("Malformed hex number"));
        }
        if self.peek_char() == 'p' || self.peek_char() == 'P' {
            is_float = true;
            self.advance();
            let negative = match self.peek_char() {
                '-' => {
                    self.advance();
                    true
                }
                '+' => {
                    self.advance();
                    false
                }
                _ => false,
            };
            if !self.peek_char().is_ascii_digit() {
                return Err(self.error("Malformed hex float exponent"));
            }
            let mut exp = 0i32;
            while self.peek_char().is_ascii_digit() {
                exp = exp * 10 + self.advance().to_digit(10).unwrap() as i32;
            }
            exponent += if negative { -exp } else { exp };
        }

        if is_float {
            Ok(self.make_token(TokenKind::Float(mantissa * (2.0f64).powi(exponent))))
        } else {
            Ok(self.make_token(TokenKind::Int(int_part as i64)))
        }
    }

    fn intern(&mut self, text: &str) -> Arc<str> {
        if let Some(existing) = self.interned.get(text) {
            return existing.clone();
        }
        let arc: Arc<str> = Arc::from(text);
        self.interned.insert(text.to_string(), arc.clone());
        arc
    }

    // Helper methods
    fn is_at_end(&self) -> bool {
        self.current >= self.source.len()
    }

    fn advance(&mut self) -> char {
        let c = self.source[self.current];
        self.current += 1;
        self.column += 1;
        c
    }

    fn newline(&mut self) {
        self.current += 1;
        self.line += 1;
        self.column = 1;
    }

    fn peek_char(&self) -> char {
        if self.is_at_end() {
            '\0'
        } else {
            self.source[self.current]
        }
    }

    fn peek_next(&self) -> char {
        if self.current + 1 >= self.source.len() {
            '\0'
        } else {
            self.source[self.current + 1]
        }
    }

    fn match_char(&mut self, expected: char) -> bool {
        if self.is_at_end() || self.source[self.current] != expected {
            false
        } else {
            self.current += 1;
            self.column += 1;
            true
        }
    }

    fn make_token(&self, kind: TokenKind) -> Token {
        let span = Span::from_positions(
            self.start_line,
            self.start_column,
            self.line,
            self.column.saturating_sub(1).max(1),
        );
        Token::new(kind, span)
    }

    fn error(&self, message: &str) -> LunoError {
        LunoError::syntax_error(
            message,
            Span::from_positions(self.start_line, self.start_column, self.line, self.column),
            &self.file,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        let mut lexer = Lexer::new(source, "test.luno");
        let mut out = Vec::new();
        loop {
            let tok = lexer.next_token().expect("lex error");
            let eof = tok.is_eof();
            out.push(tok.kind);
            if eof {
                break;
            }
        }
        out
    }

    #[test]
    fn keywords_and_names() {
        let toks = kinds("local x = defer_it");
        assert_eq!(toks[0], TokenKind::Local);
        assert!(matches!(toks[1], TokenKind::Name(ref n) if &**n == "x"));
        assert_eq!(toks[2], TokenKind::Equal);
        assert!(matches!(toks[3], TokenKind::Name(ref n) if &**n == "defer_it"));
    }

    #[test]
    fn extended_keywords() {
        let toks = kinds("try catch finally defer when switch case default import module");
        assert_eq!(
            &toks[..10],
            &[
                TokenKind::Try,
                TokenKind::Catch,
                TokenKind::Finally,
                TokenKind::Defer,
                TokenKind::When,
                TokenKind::Switch,
                TokenKind::Case,
                TokenKind::Default,
                TokenKind::Import,
                TokenKind::Module,
            ]
        );
    }

    #[test]
    fn numbers() {
        let toks = kinds("42 3.5 1e3 0xFF 0x1p4 .5");
        assert_eq!(toks[0], TokenKind::Int(42));
        assert_eq!(toks[1], TokenKind::Float(3.5));
        assert_eq!(toks[2], TokenKind::Float(1000.0));
        assert_eq!(toks[3], TokenKind::Int(255));
        assert_eq!(toks[4], TokenKind::Float(16.0));
        assert_eq!(toks[5], TokenKind::Float(0.5));
    }

    #[test]
    fn strings_and_escapes() {
        let toks = kinds(r#""a\tb" '\65' "\x41""#);
        assert!(matches!(toks[0], TokenKind::Str(ref s) if &**s == "a\tb"));
        assert!(matches!(toks[1], TokenKind::Str(ref s) if &**s == "A"));
        assert!(matches!(toks[2], TokenKind::Str(ref s) if &**s == "A"));
    }

    #[test]
    fn long_strings() {
        let toks = kinds("[[hello\nworld]] [==[a]b]==]");
        assert!(matches!(toks[0], TokenKind::Str(ref s) if &**s == "hello\nworld"));
        assert!(matches!(toks[1], TokenKind::Str(ref s) if &**s == "a]b"));
    }

    #[test]
    fn comments_are_skipped() {
        let toks = kinds("1 -- line comment\n--[[ block\ncomment ]] 2");
        assert_eq!(toks[0], TokenKind::Int(1));
        assert_eq!(toks[1], TokenKind::Int(2));
    }

    #[test]
    fn operators() {
        let toks = kinds("// .. ... == ~= <= >= << >> ::");
        assert_eq!(
            &toks[..10],
            &[
                TokenKind::SlashSlash,
                TokenKind::Concat,
                TokenKind::Ellipsis,
                TokenKind::EqualEqual,
                TokenKind::NotEqual,
                TokenKind::LessEqual,
                TokenKind::GreaterEqual,
                TokenKind::Shl,
                TokenKind::Shr,
                TokenKind::DoubleColon,
            ]
        );
    }

    #[test]
    fn interning_shares_instances() {
        let mut lexer = Lexer::new("foo foo", "t.luno");
        let a = lexer.next_token().unwrap();
        let b = lexer.next_token().unwrap();
        match (a.kind, b.kind) {
            (TokenKind::Name(x), TokenKind::Name(y)) => assert!(Arc::ptr_eq(&x, &y)),
            _ => panic!("expected names"),
        }
    }

    #[test]
    fn peek_does_not_consume() {
        let mut lexer = Lexer::new("return 1", "t.luno");
        assert_eq!(lexer.peek().unwrap().kind, TokenKind::Return);
        assert_eq!(lexer.next_token().unwrap().kind, TokenKind::Return);
        assert_eq!(lexer.next_token().unwrap().kind, TokenKind::Int(1));
    }

    #[test]
    fn unterminated_string_errors() {
        let mut lexer = Lexer::new("\"abc", "t.luno");
        let err = lexer.next_token().unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::SyntaxError);
    }
}
