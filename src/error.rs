// Luno Error Handling Module
// Error reporting with line numbers, spans, and stack traces

use colored::*;
use std::fmt;

/// A position in the source code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub line: usize,
    pub column: usize,
    pub offset: usize,
}

impl Position {
    pub fn new(line: usize, column: usize, offset: usize) -> Self {
        Self {
            line,
            column,
            offset,
        }
    }
}

impl Default for Position {
    fn default() -> Self {
        Self {
            line: 1,
            column: 1,
            offset: 0,
        }
    }
}

/// A span in the source code (start to end position)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start: Position,
    pub end: Position,
}

impl Span {
    pub fn new(start: Position, end: Position) -> Self {
        Self { start, end }
    }

    pub fn from_positions(
        start_line: usize,
        start_col: usize,
        end_line: usize,
        end_col: usize,
    ) -> Self {
        Self {
            start: Position::new(start_line, start_col, 0),
            end: Position::new(end_line, end_col, 0),
        }
    }

    pub fn single(line: usize, column: usize, offset: usize) -> Self {
        let pos = Position::new(line, column, offset);
        Self {
            start: pos,
            end: pos,
        }
    }

    /// A whole-line span, used where only a line number survives
    /// (bytecode line tables carry no columns).
    pub fn line(line: usize) -> Self {
        Self {
            start: Position::new(line, 1, 0),
            end: Position::new(line, 1, 0),
        }
    }
}

/// Error categories
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Compile-time error: malformed grammar, bad token, scope violation
    SyntaxError,
    /// VM error: type errors, bad arithmetic, user-raised values
    RuntimeError,
    /// Malformed pattern or pattern-engine recursion limit
    PatternError,
    /// Foreign-bridge type mismatch
    CoercionError,
    /// Unresolvable import / missing resource
    ImportError,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::SyntaxError => write!(f, "SyntaxError"),
            ErrorKind::RuntimeError => write!(f, "RuntimeError"),
            ErrorKind::PatternError => write!(f, "PatternError"),
            ErrorKind::CoercionError => write!(f, "CoercionError"),
            ErrorKind::ImportError => write!(f, "ImportError"),
        }
    }
}

/// One frame of an error trace
#[derive(Debug, Clone)]
pub struct StackFrame {
    pub function_name: String,
    pub file: String,
    pub line: usize,
}

impl StackFrame {
    pub fn new(function_name: impl Into<String>, file: impl Into<String>, line: usize) -> Self {
        Self {
            function_name: function_name.into(),
            file: file.into(),
            line,
        }
    }
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "  at {} ({}:{})",
            self.function_name, self.file, self.line
        )
    }
}

/// Main error type for Luno
#[derive(Debug, Clone)]
pub struct LunoError {
    pub kind: ErrorKind,
    pub message: String,
    pub span: Span,
    pub file: String,
    pub help: Option<String>,
    pub stack_trace: Vec<StackFrame>,
    source_lines: Vec<String>,
}

impl LunoError {
    pub fn new(
        kind: ErrorKind,
        message: impl Into<String>,
        span: Span,
        file: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            span,
            file: file.into(),
            help: None,
            stack_trace: Vec::new(),
            source_lines: Vec::new(),
        }
    }

    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    pub fn with_source(mut self, source: &str) -> Self {
        self.source_lines = source.lines().map(String::from).collect();
        self
    }

    pub fn with_stack_trace(mut self, trace: Vec<StackFrame>) -> Self {
        self.stack_trace = trace;
        self
    }

    pub fn push_frame(&mut self, frame: StackFrame) {
        self.stack_trace.push(frame);
    }

    /// Format the error for display, with source context and a caret
    /// pointing at the offending span.
    pub fn format(&self) -> String {
        let mut output = String::new();

        let header = format!(
            "{}: {} at {}:{}:{}",
            self.kind.to_string().red().bold(),
            self.message.white().bold(),
            self.file,
            self.span.start.line,
            self.span.start.column
        );
        output.push_str(&header);
        output.push('\n');

        // Source context (one line before and after the error line)
        if !self.source_lines.is_empty() {
            let error_line = self.span.start.line;
            let start_line = if error_line > 1 { error_line - 1 } else { 1 };
            let end_line = (error_line + 1).min(self.source_lines.len());

            output.push('\n');

            for line_num in start_line..=end_line {
                if line_num <= self.source_lines.len() {
                    let line_content = &self.source_lines[line_num - 1];
                    let line_num_str = format!("{:>4} |", line_num);

                    if line_num == error_line {
                        output.push_str(&format!("{} {}\n", line_num_str.red(), line_content));

                        let spaces = " ".repeat(6 + self.span.start.column);
                        let caret_len = if self.span.end.column > self.span.start.column {
                            self.span.end.column - self.span.start.column + 1
                        } else {
                            1
                        };
                        let carets = "^".repeat(caret_len);
                        output.push_str(&format!("{}{}\n", spaces, carets.red().bold()));
                    } else {
                        output.push_str(&format!("{} {}\n", line_num_str.dimmed(), line_content));
                    }
                }
            }
        }

        if let Some(ref help) = self.help {
            output.push_str(&format!("\n      {}: {}\n", "Help".cyan().bold(), help));
        }

        if !self.stack_trace.is_empty() {
            output.push_str(&format!("\n{}:\n", "Stack trace".yellow().bold()));
            for frame in self.stack_trace.iter() {
                output.push_str(&format!("{}\n", frame));
            }
        }

        output
    }
}

impl fmt::Display for LunoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format())
    }
}

impl std::error::Error for LunoError {}

/// Result type for Luno operations
pub type LunoResult<T> = Result<T, LunoError>;

// Convenience constructors
impl LunoError {
    pub fn syntax_error(message: impl Into<String>, span: Span, file: impl Into<String>) -> Self {
        Self::new(ErrorKind::SyntaxError, message, span, file)
    }

    pub fn runtime_error(message: impl Into<String>, span: Span, file: impl Into<String>) -> Self {
        Self::new(ErrorKind::RuntimeError, message, span, file)
    }

    pub fn pattern_error(message: impl Into<String>, span: Span, file: impl Into<String>) -> Self {
        Self::new(ErrorKind::PatternError, message, span, file)
    }

    pub fn coercion_error(message: impl Into<String>, span: Span, file: impl Into<String>) -> Self {
        Self::new(ErrorKind::CoercionError, message, span, file)
    }

    pub fn import_error(message: impl Into<String>, span: Span, file: impl Into<String>) -> Self {
        Self::new(ErrorKind::ImportError, message, span, file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_contains_location() {
        let err = LunoError::syntax_error("unexpected token", Span::line(3), "demo.luno");
        let text = err.format();
        assert!(text.contains("demo.luno:3"));
        assert!(text.contains("unexpected token"));
    }

    #[test]
    fn stack_trace_renders_frames() {
        let err = LunoError::runtime_error("boom", Span::line(1), "t.luno")
            .with_stack_trace(vec![StackFrame::new("inner", "t.luno", 4)]);
        assert!(err.format().contains("at inner (t.luno:4)"));
    }
}
