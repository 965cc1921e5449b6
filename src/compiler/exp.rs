// Luno Expression Descriptors
// Deferred expression values threaded through code generation

use crate::error::Span;
use std::sync::Arc;

/// Sentinel for "no pending jump" in a patch chain.
pub const NO_JUMP: i32 = -1;

/// What an expression currently denotes during code generation.
///
/// Expressions stay in the cheapest form possible until the statement
/// around them forces a decision: constants fold without touching a
/// register, locals are used in place, and relocatable instructions
/// get their destination patched once a register is chosen.
#[derive(Debug, Clone, PartialEq)]
pub enum ExpKind {
    /// No value (e.g. empty expression list tail).
    Void,
    Nil,
    True,
    False,
    /// Integer literal, not yet in the constant pool.
    KInt(i64),
    /// Float literal, not yet in the constant pool.
    KFlt(f64),
    /// String literal, not yet in the constant pool.
    KStr(Arc<str>),
    /// Value in local register.
    Local(u8),
    /// Value in upvalue slot.
    Upval(u8),
    /// Global variable; payload is the name's constant index.
    Global(u32),
    /// `obj[key]`; key is an RK operand.
    Indexed { obj: u8, key: u16 },
    /// Instruction at `pc` produces the value; destination unpatched.
    Reloc(usize),
    /// Value already sits in a fixed register.
    NonReloc(u8),
    /// Call instruction at `pc`; result count still open.
    Call(usize),
    /// Vararg instruction at `pc`; result count still open.
    Vararg(usize),
    /// Condition: jump instruction at `pc` taken when the test fails.
    Jump(usize),
}

/// An expression under construction, with its pending short-circuit
/// jump chains. `true_list` collects jumps taken when the expression is
/// truthy, `false_list` when falsy; both are pc chains threaded through
/// jump offsets, terminated by [`NO_JUMP`].
#[derive(Debug, Clone)]
pub struct ExpDesc {
    pub kind: ExpKind,
    pub true_list: i32,
    pub false_list: i32,
    pub span: Span,
}

impl ExpDesc {
    pub fn new(kind: ExpKind, span: Span) -> Self {
        Self {
            kind,
            true_list: NO_JUMP,
            false_list: NO_JUMP,
            span,
        }
    }

    pub fn has_jumps(&self) -> bool {
        self.true_list != NO_JUMP || self.false_list != NO_JUMP
    }

    /// True when the value is a compile-time constant with no pending
    /// jumps, making it foldable.
    pub fn is_constant(&self) -> bool {
        !self.has_jumps()
            && matches!(
                self.kind,
                ExpKind::Nil
                    | ExpKind::True
                    | ExpKind::False
                    | ExpKind::KInt(_)
                    | ExpKind::KFlt(_)
                    | ExpKind::KStr(_)
            )
    }

    /// True when the constant is a number usable in arithmetic folding.
    pub fn as_number(&self) -> Option<NumLit> {
        if self.has_jumps() {
            return None;
        }
        match self.kind {
            ExpKind::KInt(n) => Some(NumLit::Int(n)),
            ExpKind::KFlt(n) => Some(NumLit::Float(n)),
            _ => None,
        }
    }

    /// Truthiness of a constant expression, if decidable.
    pub fn const_truth(&self) -> Option<bool> {
        if self.has_jumps() {
            return None;
        }
        match self.kind {
            ExpKind::Nil | ExpKind::False => Some(false),
            ExpKind::True | ExpKind::KInt(_) | ExpKind::KFlt(_) | ExpKind::KStr(_) => Some(true),
            _ => None,
        }
    }

    /// True when the expression can still produce a variable number of
    /// results (an open call or vararg).
    pub fn is_multi(&self) -> bool {
        matches!(self.kind, ExpKind::Call(_) | ExpKind::Vararg(_))
    }
}

/// A numeric literal during constant folding.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NumLit {
    Int(i64),
    Float(f64),
}

impl NumLit {
    pub fn as_float(self) -> f64 {
        match self {
            NumLit::Int(n) => n as f64,
            NumLit::Float(n) => n,
        }
    }
}
