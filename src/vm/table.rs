// Luno Tables
// Hybrid array/hash storage with metatables

use crate::vm::value::{float_to_int_exact, LunoStr, TableRef, Value};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Hashable key forms. Integral floats normalize to integer keys so
/// `t[2]` and `t[2.0]` are the same slot; NaN and nil are rejected
/// before a key is built.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HashKey {
    Int(i64),
    Float(u64),
    Str(LunoStr),
    Bool(bool),
}

impl HashKey {
    /// Build a key from a value; `None` for types that cannot key a
    /// table (nil, NaN, functions, tables).
    pub fn from_value(v: &Value) -> Option<HashKey> {
        match v {
            Value::Integer(n) => Some(HashKey::Int(*n)),
            Value::Float(f) => {
                if f.is_nan() {
                    None
                } else if let Some(n) = float_to_int_exact(*f) {
                    Some(HashKey::Int(n))
                } else {
                    Some(HashKey::Float(f.to_bits()))
                }
            }
            Value::Str(s) => Some(HashKey::Str(s.clone())),
            Value::Boolean(b) => Some(HashKey::Bool(*b)),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            HashKey::Int(n) => Value::Integer(*n),
            HashKey::Float(bits) => Value::Float(f64::from_bits(*bits)),
            HashKey::Str(s) => Value::Str(s.clone()),
            HashKey::Bool(b) => Value::Boolean(*b),
        }
    }
}

/// A Luno table: a contiguous array part for keys `1..=n` and a hash
/// part for everything else.
#[derive(Debug, Default)]
pub struct Table {
    array: Vec<Value>,
    hash: FxHashMap<HashKey, Value>,
    metatable: Option<TableRef>,
    readonly: bool,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(array: usize, hash: usize) -> Self {
        Self {
            array: Vec::with_capacity(array),
            hash: FxHashMap::with_capacity_and_hasher(hash, Default::default()),
            metatable: None,
            readonly: false,
        }
    }

    pub fn new_ref() -> TableRef {
        Arc::new(Mutex::new(Table::new()))
    }

    pub fn metatable(&self) -> Option<TableRef> {
        self.metatable.clone()
    }

    pub fn set_metatable(&mut self, mt: Option<TableRef>) {
        self.metatable = mt;
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    pub fn set_readonly(&mut self, ro: bool) {
        self.readonly = ro;
    }

    /// Raw read, no metamethods. Missing keys read nil.
    pub fn raw_get(&self, key: &Value) -> Value {
        if let Value::Integer(n) = key {
            if let Some(v) = self.array_get(*n) {
                return v;
            }
        }
        match HashKey::from_value(key) {
            Some(HashKey::Int(n)) => {
                if let Some(v) = self.array_get(n) {
                    v
                } else {
                    self.hash.get(&HashKey::Int(n)).cloned().unwrap_or(Value::Nil)
                }
            }
            Some(k) => self.hash.get(&k).cloned().unwrap_or(Value::Nil),
            None => Value::Nil,
        }
    }

    fn array_get(&self, n: i64) -> Option<Value> {
        if n >= 1 && (n as usize) <= self.array.len() {
            Some(self.array[n as usize - 1].clone())
        } else {
            None
        }
    }

    /// Raw write, no metamethods. Fails on invalid keys and read-only
    /// tables; the caller turns the message into a runtime error.
    pub fn raw_set(&mut self, key: Value, value: Value) -> Result<(), &'static str> {
        if self.readonly {
            return Err("attempt to modify a read-only table");
        }
        let hk = match &key {
            Value::Nil => return Err("table index is nil"),
            Value::Float(f) if f.is_nan() => return Err("table index is NaN"),
            other => match HashKey::from_value(other) {
                Some(k) => k,
                None => return Err("invalid table key type"),
            },
        };
        if let HashKey::Int(n) = hk {
            let len = self.array.len() as i64;
            if n >= 1 && n <= len {
                self.array[n as usize - 1] = value;
                if n == len && matches!(self.array.last(), Some(Value::Nil)) {
                    while matches!(self.array.last(), Some(Value::Nil)) {
                        self.array.pop();
                    }
                }
                return Ok(());
            }
            if n == len + 1 {
                if value.is_nil() {
                    self.hash.remove(&hk);
                    return Ok(());
                }
                self.array.push(value);
                self.migrate_from_hash();
                return Ok(());
            }
        }
        if value.is_nil() {
            self.hash.remove(&hk);
        } else {
            self.hash.insert(hk, value);
        }
        Ok(())
    }

    /// Pull hash entries that now extend the array sequence.
    fn migrate_from_hash(&mut self) {
        loop {
            let next = self.array.len() as i64 + 1;
            match self.hash.remove(&HashKey::Int(next)) {
                Some(v) => self.array.push(v),
                None => break,
            }
        }
    }

    /// A border: `n` where `t[n]` is non-nil and `t[n+1]` is nil. The
    /// `#` operator's result.
    pub fn length(&self) -> i64 {
        let n = self.array.len() as i64;
        if n > 0 {
            return n;
        }
        // Sequence may live entirely in the hash part.
        if self.hash.contains_key(&HashKey::Int(1)) {
            let mut i: i64 = 1;
            let mut j: i64 = 2;
            while self.hash.contains_key(&HashKey::Int(j)) {
                i = j;
                if j > i64::MAX / 2 {
                    while self.hash.contains_key(&HashKey::Int(i + 1)) {
                        i += 1;
                    }
                    return i;
                }
                j *= 2;
            }
            // Binary search between i (present) and j (absent).
            while j - i > 1 {
                let m = (i + j) / 2;
                if self.hash.contains_key(&HashKey::Int(m)) {
                    i = m;
                } else {
                    j = m;
                }
            }
            return i;
        }
        0
    }

    pub fn array_len(&self) -> usize {
        self.array.len()
    }

    pub fn hash_len(&self) -> usize {
        self.hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.array.is_empty() && self.hash.is_empty()
    }

    /// Stable key snapshot for traversal: array indices first, then the
    /// hash part. `pairs` captures this once so mutation during a loop
    /// cannot skew iteration.
    pub fn snapshot(&self) -> Vec<(Value, Value)> {
        let mut out = Vec::with_capacity(self.array.len() + self.hash.len());
        for (i, v) in self.array.iter().enumerate() {
            if !v.is_nil() {
                out.push((Value::Integer(i as i64 + 1), v.clone()));
            }
        }
        for (k, v) in &self.hash {
            out.push((k.to_value(), v.clone()));
        }
        out
    }

    /// Successor of `key` in traversal order; nil key starts. Returns
    /// `Err(())` for a key not present in the table.
    pub fn next_entry(&self, key: &Value) -> Result<Option<(Value, Value)>, ()> {
        let entries = self.snapshot();
        if key.is_nil() {
            return Ok(entries.into_iter().next());
        }
        match entries.iter().position(|(k, _)| k.raw_eq(key)) {
            Some(pos) => Ok(entries.into_iter().nth(pos + 1)),
            None => Err(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(t: &mut Table, k: Value, v: Value) {
        t.raw_set(k, v).unwrap();
    }

    #[test]
    fn integral_float_keys_normalize() {
        let mut t = Table::new();
        set(&mut t, Value::Float(2.0), Value::from("x"));
        assert_eq!(t.raw_get(&Value::Integer(2)).display(), "x");
    }

    #[test]
    fn sequence_grows_through_array_part() {
        let mut t = Table::new();
        for i in 1..=5 {
            set(&mut t, Value::Integer(i), Value::Integer(i * 10));
        }
        assert_eq!(t.array_len(), 5);
        assert_eq!(t.length(), 5);
    }

    #[test]
    fn hash_entries_migrate_when_sequence_fills() {
        let mut t = Table::new();
        set(&mut t, Value::Integer(2), Value::from("b"));
        set(&mut t, Value::Integer(3), Value::from("c"));
        assert_eq!(t.array_len(), 0);
        set(&mut t, Value::Integer(1), Value::from("a"));
        assert_eq!(t.array_len(), 3);
        assert_eq!(t.length(), 3);
    }

    #[test]
    fn nil_assignment_removes() {
        let mut t = Table::new();
        set(&mut t, Value::from("k"), Value::Integer(1));
        set(&mut t, Value::from("k"), Value::Nil);
        assert!(t.raw_get(&Value::from("k")).is_nil());
        assert!(t.is_empty());
    }

    #[test]
    fn trailing_nil_shrinks_border() {
        let mut t = Table::new();
        for i in 1..=3 {
            set(&mut t, Value::Integer(i), Value::Integer(i));
        }
        set(&mut t, Value::Integer(3), Value::Nil);
        assert_eq!(t.length(), 2);
    }

    #[test]
    fn nil_key_rejected() {
        let mut t = Table::new();
        assert!(t.raw_set(Value::Nil, Value::Integer(1)).is_err());
        assert!(t.raw_set(Value::Float(f64::NAN), Value::Integer(1)).is_err());
    }

    #[test]
    fn readonly_blocks_writes() {
        let mut t = Table::new();
        t.set_readonly(true);
        assert!(t.raw_set(Value::Integer(1), Value::Integer(1)).is_err());
    }

    #[test]
    fn next_entry_walks_all_keys() {
        let mut t = Table::new();
        set(&mut t, Value::Integer(1), Value::from("a"));
        set(&mut t, Value::from("x"), Value::from("b"));
        let mut seen = 0;
        let mut key = Value::Nil;
        while let Ok(Some((k, _))) = t.next_entry(&key) {
            seen += 1;
            key = k;
        }
        assert_eq!(seen, 2);
    }
}
