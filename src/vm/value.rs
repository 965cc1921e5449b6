// Luno Values
// The dynamic value type and its coercion rules

use crate::compiler::proto::Constant;
use crate::error::StackFrame;
use crate::vm::closure::Closure;
use crate::vm::coroutine::Coroutine;
use crate::vm::list::List;
use crate::vm::table::Table;
use crate::vm::Vm;
use crate::bridge::Foreign;
use parking_lot::Mutex;
use rustc_hash::FxHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, OnceLock};

pub type TableRef = Arc<Mutex<Table>>;
pub type ListRef = Arc<Mutex<List>>;

/// A runtime value.
///
/// Cheap to clone: scalars copy, heap values bump a refcount.
#[derive(Clone)]
pub enum Value {
    Nil,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Str(LunoStr),
    Table(TableRef),
    List(ListRef),
    Closure(Arc<Closure>),
    Native(Arc<NativeFunction>),
    Thread(Arc<Coroutine>),
    Foreign(Foreign),
}

/// An immutable string with its hash computed once and its numeric
/// interpretation cached on first use.
#[derive(Clone)]
pub struct LunoStr(Arc<StrInner>);

pub struct StrInner {
    text: Box<str>,
    hash: u64,
    numeric: OnceLock<Option<Number>>,
}

/// Either numeric representation, used during coercion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    pub fn as_float(self) -> f64 {
        match self {
            Number::Int(n) => n as f64,
            Number::Float(n) => n,
        }
    }

    pub fn to_value(self) -> Value {
        match self {
            Number::Int(n) => Value::Integer(n),
            Number::Float(n) => Value::Float(n),
        }
    }
}

impl LunoStr {
    pub fn new(text: impl Into<Box<str>>) -> Self {
        let text = text.into();
        let mut hasher = FxHasher::default();
        text.hash(&mut hasher);
        Self(Arc::new(StrInner {
            hash: hasher.finish(),
            text,
            numeric: OnceLock::new(),
        }))
    }

    pub fn as_str(&self) -> &str {
        &self.0.text
    }

    pub fn len(&self) -> usize {
        self.0.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.text.is_empty()
    }

    pub fn hash_value(&self) -> u64 {
        self.0.hash
    }

    /// The string's numeric reading, computed once. Accepts what the
    /// lexer accepts: decimal and hex integers, floats, exponents,
    /// surrounding whitespace.
    pub fn as_number(&self) -> Option<Number> {
        *self
            .0
            .numeric
            .get_or_init(|| parse_number(self.as_str()))
    }
}

impl fmt::Debug for LunoStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

impl fmt::Display for LunoStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl PartialEq for LunoStr {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
            || (self.0.hash == other.0.hash && self.0.text == other.0.text)
    }
}

impl Eq for LunoStr {}

impl Hash for LunoStr {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.0.hash);
    }
}

impl From<&str> for LunoStr {
    fn from(s: &str) -> Self {
        LunoStr::new(s)
    }
}

impl From<String> for LunoStr {
    fn from(s: String) -> Self {
        LunoStr::new(s.into_boxed_str())
    }
}

impl From<Arc<str>> for LunoStr {
    fn from(s: Arc<str>) -> Self {
        LunoStr::new(&*s)
    }
}

/// Parse a string as a Luno number (used by coercion and `tonumber`).
pub fn parse_number(s: &str) -> Option<Number> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let (neg, body) = match s.strip_prefix('-') {
        Some(rest) => (true, rest.trim_start()),
        None => (false, s.strip_prefix('+').unwrap_or(s).trim_start()),
    };
    let apply = |n: Number| {
        Some(if neg {
            match n {
                Number::Int(v) => match v.checked_neg() {
                    Some(nv) => Number::Int(nv),
                    None => Number::Float(-(v as f64)),
                },
                Number::Float(v) => Number::Float(-v),
            }
        } else {
            n
        })
    };
    if let Some(hex) = body.strip_prefix("0x").or_else(|| body.strip_prefix("0X")) {
        if hex.is_empty() {
            return None;
        }
        if let Ok(v) = i64::from_str_radix(hex, 16) {
            return apply(Number::Int(v));
        }
        // Hex values overflowing i64 wrap like the lexer's reading.
        if hex.chars().all(|c| c.is_ascii_hexdigit()) && hex.len() <= 16 {
            return u64::from_str_radix(hex, 16)
                .ok()
                .and_then(|v| apply(Number::Int(v as i64)));
        }
        return None;
    }
    if !body.contains(['.', 'e', 'E', 'n', 'N', 'i', 'I']) {
        if let Ok(v) = body.parse::<i64>() {
            return apply(Number::Int(v));
        }
    }
    // "inf"/"nan" are not numbers in source, so reject them here too.
    if body.chars().any(|c| c.is_ascii_alphabetic() && !matches!(c, 'e' | 'E')) {
        return None;
    }
    body.parse::<f64>().ok().and_then(|v| apply(Number::Float(v)))
}

/// A host function callable from scripts.
pub struct NativeFunction {
    pub name: String,
    #[allow(clippy::type_complexity)]
    pub call: Box<dyn Fn(&mut Vm, &[Value]) -> Result<Vec<Value>, Fault> + Send + Sync>,
}

impl NativeFunction {
    pub fn new<F>(name: impl Into<String>, call: F) -> Arc<Self>
    where
        F: Fn(&mut Vm, &[Value]) -> Result<Vec<Value>, Fault> + Send + Sync + 'static,
    {
        Arc::new(Self {
            name: name.into(),
            call: Box::new(call),
        })
    }
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<native {}>", self.name)
    }
}

/// Non-local control flow inside the interpreter.
///
/// `Raise` carries an arbitrary script value (what `error` threw or the
/// VM's own runtime error as a string); `Yield` suspends the running
/// coroutine. Both unwind Rust frames via `?`; only `execute` and
/// protected calls turn them into surface results.
#[derive(Debug, Clone)]
pub enum Fault {
    Raise(Raised),
    Yield(Vec<Value>),
}

/// A raised error: the thrown value plus the trace gathered while
/// unwinding.
#[derive(Debug, Clone)]
pub struct Raised {
    pub value: Value,
    pub trace: Vec<StackFrame>,
}

impl Fault {
    pub fn raise(value: Value) -> Self {
        Fault::Raise(Raised {
            value,
            trace: Vec::new(),
        })
    }

    pub fn raise_str(message: impl Into<String>) -> Self {
        Fault::raise(Value::from(message.into()))
    }
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Boolean(_) => "boolean",
            Value::Integer(_) | Value::Float(_) => "number",
            Value::Str(_) => "string",
            Value::Table(_) => "table",
            Value::List(_) => "list",
            Value::Closure(_) | Value::Native(_) => "function",
            Value::Thread(_) => "thread",
            Value::Foreign(_) => "userdata",
        }
    }

    /// Everything except nil and false is truthy.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Boolean(false))
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn from_constant(c: &Constant) -> Value {
        match c {
            Constant::Int(n) => Value::Integer(*n),
            Constant::Float(n) => Value::Float(*n),
            Constant::Str(s) => Value::Str(LunoStr::from(s.clone())),
        }
    }

    /// Numeric reading: numbers as themselves, strings via parsing.
    pub fn as_number(&self) -> Option<Number> {
        match self {
            Value::Integer(n) => Some(Number::Int(*n)),
            Value::Float(n) => Some(Number::Float(*n)),
            Value::Str(s) => s.as_number(),
            _ => None,
        }
    }

    /// Integer reading: integers as-is, floats only when exactly
    /// integral, strings via their numeric reading.
    pub fn as_integer(&self) -> Option<i64> {
        match self.as_number()? {
            Number::Int(n) => Some(n),
            Number::Float(f) => float_to_int_exact(f),
        }
    }

    /// Raw equality (no metamethods). Integers and floats compare
    /// across representations: `1 == 1.0`.
    pub fn raw_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Integer(a), Value::Float(b)) | (Value::Float(b), Value::Integer(a)) => {
                *a as f64 == *b && float_to_int_exact(*b) == Some(*a)
            }
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Table(a), Value::Table(b)) => Arc::ptr_eq(a, b),
            (Value::List(a), Value::List(b)) => Arc::ptr_eq(a, b),
            (Value::Closure(a), Value::Closure(b)) => Arc::ptr_eq(a, b),
            (Value::Native(a), Value::Native(b)) => Arc::ptr_eq(a, b),
            (Value::Thread(a), Value::Thread(b)) => Arc::ptr_eq(a, b),
            (Value::Foreign(a), Value::Foreign(b)) => a.ptr_eq(b),
            _ => false,
        }
    }

    /// Display form, as `print` and `tostring` show it (before any
    /// `__tostring` metamethod).
    pub fn display(&self) -> String {
        match self {
            Value::Nil => "nil".to_string(),
            Value::Boolean(b) => b.to_string(),
            Value::Integer(n) => n.to_string(),
            Value::Float(n) => format_float(*n),
            Value::Str(s) => s.as_str().to_string(),
            Value::Table(t) => format!("table: {:p}", Arc::as_ptr(t)),
            Value::List(l) => format!("list: {:p}", Arc::as_ptr(l)),
            Value::Closure(c) => format!("function: {:p}", Arc::as_ptr(c)),
            Value::Native(n) => format!("function: builtin: {}", n.name),
            Value::Thread(t) => format!("thread: {:p}", Arc::as_ptr(t)),
            Value::Foreign(f) => format!("userdata: {}", f.type_name()),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => write!(f, "{:?}", s.as_str()),
            other => f.write_str(&other.display()),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(n)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Float(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(LunoStr::from(s))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(LunoStr::from(s))
    }
}

/// Floats print with a trailing `.0` when integral, so number types
/// stay distinguishable in output.
pub fn format_float(n: f64) -> String {
    if n.is_infinite() {
        return if n > 0.0 { "inf".into() } else { "-inf".into() };
    }
    if n.is_nan() {
        return "nan".into();
    }
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{:.1}", n)
    } else {
        let s = format!("{}", n);
        if s.contains(['.', 'e', 'E']) {
            s
        } else {
            format!("{}.0", s)
        }
    }
}

/// A float's exact integer value, if it has one.
pub fn float_to_int_exact(f: f64) -> Option<i64> {
    if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 + 1.0 {
        Some(f as i64)
    } else {
        None
    }
}

/// Floor division on integers, result toward negative infinity.
/// `i64::MIN // -1` wraps rather than trapping.
pub fn floor_div_i64(x: i64, y: i64) -> i64 {
    let q = x.wrapping_div(y);
    if (x % y != 0) && ((x < 0) != (y < 0)) {
        q - 1
    } else {
        q
    }
}

/// Modulo on integers, result takes the divisor's sign.
pub fn floor_mod_i64(x: i64, y: i64) -> i64 {
    let r = x.wrapping_rem(y);
    if r != 0 && ((r < 0) != (y < 0)) {
        r + y
    } else {
        r
    }
}

/// Shift with saturating semantics: amounts of 64 or more produce 0,
/// negative amounts shift the other way. Right shifts are logical.
pub fn shift_left(x: i64, n: i64) -> i64 {
    if n <= -64 || n >= 64 {
        0
    } else if n >= 0 {
        ((x as u64) << n) as i64
    } else {
        ((x as u64) >> (-n)) as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthiness() {
        assert!(!Value::Nil.is_truthy());
        assert!(!Value::Boolean(false).is_truthy());
        assert!(Value::Integer(0).is_truthy());
        assert!(Value::from("").is_truthy());
    }

    #[test]
    fn cross_representation_equality() {
        assert!(Value::Integer(1).raw_eq(&Value::Float(1.0)));
        assert!(!Value::Integer(1).raw_eq(&Value::Float(1.5)));
        assert!(!Value::Integer(1).raw_eq(&Value::from("1")));
    }

    #[test]
    fn string_numeric_cache() {
        let s = LunoStr::new("  42  ");
        assert_eq!(s.as_number(), Some(Number::Int(42)));
        assert_eq!(LunoStr::new("0x10").as_number(), Some(Number::Int(16)));
        assert_eq!(LunoStr::new("3.5").as_number(), Some(Number::Float(3.5)));
        assert_eq!(LunoStr::new("nan").as_number(), None);
        assert_eq!(LunoStr::new("12abc").as_number(), None);
    }

    #[test]
    fn float_display_keeps_point() {
        assert_eq!(format_float(1.0), "1.0");
        assert_eq!(format_float(0.5), "0.5");
        assert_eq!(format_float(f64::INFINITY), "inf");
    }

    #[test]
    fn floor_division_signs() {
        assert_eq!(floor_div_i64(7, 2), 3);
        assert_eq!(floor_div_i64(-7, 2), -4);
        assert_eq!(floor_mod_i64(5, -3), -1);
        assert_eq!(floor_mod_i64(-5, 3), 1);
    }

    #[test]
    fn shift_semantics() {
        assert_eq!(shift_left(1, 4), 16);
        assert_eq!(shift_left(1, 64), 0);
        assert_eq!(shift_left(16, -4), 1);
        assert_eq!(shift_left(-1, -1), i64::MAX);
    }
}
