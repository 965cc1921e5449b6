// Luno Closures
// Function instances binding prototypes to captured variables

use crate::compiler::proto::Prototype;
use crate::vm::value::Value;
use parking_lot::RwLock;
use std::sync::Arc;

/// One captured variable, shared between every closure that captures
/// it. Open upvalues alias a live register in the owning execution
/// state's stack; closing copies the value into the cell.
#[derive(Clone)]
pub struct Upvalue(Arc<RwLock<UpvalueState>>);

pub enum UpvalueState {
    /// Still aliases stack slot `slot` of the execution state `owner`.
    Open { owner: u64, slot: usize },
    /// Detached; the value lives in the cell.
    Closed(Value),
}

impl Upvalue {
    pub fn open(owner: u64, slot: usize) -> Self {
        Self(Arc::new(RwLock::new(UpvalueState::Open { owner, slot })))
    }

    pub fn closed(value: Value) -> Self {
        Self(Arc::new(RwLock::new(UpvalueState::Closed(value))))
    }

    /// The aliased stack slot, while open.
    pub fn open_slot(&self) -> Option<(u64, usize)> {
        match *self.0.read() {
            UpvalueState::Open { owner, slot } => Some((owner, slot)),
            UpvalueState::Closed(_) => None,
        }
    }

    /// Detach from the stack, pinning `value` into the cell.
    pub fn close(&self, value: Value) {
        *self.0.write() = UpvalueState::Closed(value);
    }

    /// Read a closed cell; `None` while still open.
    pub fn get_closed(&self) -> Option<Value> {
        match &*self.0.read() {
            UpvalueState::Closed(v) => Some(v.clone()),
            UpvalueState::Open { .. } => None,
        }
    }

    /// Write a closed cell; `false` while still open.
    pub fn set_closed(&self, value: Value) -> bool {
        let mut state = self.0.write();
        match &mut *state {
            UpvalueState::Closed(v) => {
                *v = value;
                true
            }
            UpvalueState::Open { .. } => false,
        }
    }

    pub fn ptr_eq(&self, other: &Upvalue) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl std::fmt::Debug for Upvalue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &*self.0.read() {
            UpvalueState::Open { owner, slot } => write!(f, "<upvalue open {}:{}>", owner, slot),
            UpvalueState::Closed(v) => write!(f, "<upvalue closed {:?}>", v),
        }
    }
}

/// A function value: immutable prototype plus its captured upvalues.
pub struct Closure {
    pub proto: Arc<Prototype>,
    pub upvalues: Vec<Upvalue>,
}

impl Closure {
    pub fn new(proto: Arc<Prototype>, upvalues: Vec<Upvalue>) -> Self {
        Self { proto, upvalues }
    }
}

impl std::fmt::Debug for Closure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<function {} ({} upvalues)>", self.proto.name, self.upvalues.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closing_detaches_from_stack() {
        let up = Upvalue::open(1, 4);
        assert_eq!(up.open_slot(), Some((1, 4)));
        assert!(!up.set_closed(Value::Integer(9)));
        up.close(Value::Integer(7));
        assert!(up.open_slot().is_none());
        assert!(up.get_closed().unwrap().raw_eq(&Value::Integer(7)));
        assert!(up.set_closed(Value::Integer(9)));
    }

    #[test]
    fn clones_share_the_cell() {
        let a = Upvalue::closed(Value::Integer(1));
        let b = a.clone();
        b.set_closed(Value::Integer(2));
        assert!(a.get_closed().unwrap().raw_eq(&Value::Integer(2)));
        assert!(a.ptr_eq(&b));
    }
}
