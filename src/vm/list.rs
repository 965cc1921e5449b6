// Luno Lists
// Dense 1-indexed sequences, distinct from tables

use crate::vm::value::{ListRef, Value};
use parking_lot::Mutex;
use std::sync::Arc;

/// A dense sequence. Unlike a table it has no hash part and no holes:
/// indices run `1..=len` and out-of-range reads are nil.
#[derive(Debug, Default)]
pub struct List {
    items: Vec<Value>,
    readonly: bool,
}

impl List {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(n: usize) -> Self {
        Self {
            items: Vec::with_capacity(n),
            readonly: false,
        }
    }

    pub fn new_ref() -> ListRef {
        Arc::new(Mutex::new(List::new()))
    }

    pub fn from_values(items: Vec<Value>) -> Self {
        Self {
            items,
            readonly: false,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    pub fn set_readonly(&mut self, ro: bool) {
        self.readonly = ro;
    }

    pub fn items(&self) -> &[Value] {
        &self.items
    }

    /// 1-based read; out of range is nil.
    pub fn get(&self, index: i64) -> Value {
        if index >= 1 && (index as usize) <= self.items.len() {
            self.items[index as usize - 1].clone()
        } else {
            Value::Nil
        }
    }

    /// 1-based write. Writing one past the end appends; writing nil to
    /// the last slot pops it. Anything else out of range fails.
    pub fn set(&mut self, index: i64, value: Value) -> Result<(), &'static str> {
        if self.readonly {
            return Err("attempt to modify a read-only list");
        }
        let len = self.items.len() as i64;
        if index >= 1 && index <= len {
            if value.is_nil() && index == len {
                self.items.pop();
            } else {
                self.items[index as usize - 1] = value;
            }
            Ok(())
        } else if index == len + 1 && !value.is_nil() {
            self.items.push(value);
            Ok(())
        } else {
            Err("list index out of range")
        }
    }

    pub fn push(&mut self, value: Value) -> Result<(), &'static str> {
        if self.readonly {
            return Err("attempt to modify a read-only list");
        }
        self.items.push(value);
        Ok(())
    }

    /// Insert at 1-based position, shifting the tail up.
    pub fn insert(&mut self, index: i64, value: Value) -> Result<(), &'static str> {
        if self.readonly {
            return Err("attempt to modify a read-only list");
        }
        if index < 1 || index as usize > self.items.len() + 1 {
            return Err("list index out of range");
        }
        self.items.insert(index as usize - 1, value);
        Ok(())
    }

    /// Remove at 1-based position, returning the removed value.
    pub fn remove(&mut self, index: i64) -> Result<Value, &'static str> {
        if self.readonly {
            return Err("attempt to modify a read-only list");
        }
        if index < 1 || index as usize > self.items.len() {
            return Err("list index out of range");
        }
        Ok(self.items.remove(index as usize - 1))
    }

    /// First 1-based position of a raw-equal value, or 0.
    pub fn index_of(&self, value: &Value) -> i64 {
        self.items
            .iter()
            .position(|v| v.raw_eq(value))
            .map(|p| p as i64 + 1)
            .unwrap_or(0)
    }

    /// Replace the contents wholesale (used by sorting).
    pub fn replace_items(&mut self, items: Vec<Value>) -> Result<(), &'static str> {
        if self.readonly {
            return Err("attempt to modify a read-only list");
        }
        self.items = items;
        Ok(())
    }

    /// Heap-sort the items in place with a fallible less-than.
    /// A comparator error aborts the sort immediately and is returned
    /// unchanged; the items are left in an unspecified permutation.
    pub fn sort_by<E>(
        &mut self,
        less: impl FnMut(&Value, &Value) -> Result<bool, E>,
    ) -> Result<(), E> {
        heap_sort(&mut self.items, less)
    }
}

/// In-place heap sort driven by a user-supplied less-than. The
/// comparator may fault partway through; the sort stops at the first
/// error instead of feeding an inconsistent order onward.
pub fn heap_sort<E>(
    items: &mut [Value],
    mut less: impl FnMut(&Value, &Value) -> Result<bool, E>,
) -> Result<(), E> {
    let n = items.len();
    if n < 2 {
        return Ok(());
    }
    let mut start = n / 2;
    while start > 0 {
        start -= 1;
        sift_down(items, start, n - 1, &mut less)?;
    }
    let mut end = n - 1;
    while end > 0 {
        items.swap(end, 0);
        end -= 1;
        sift_down(items, 0, end, &mut less)?;
    }
    Ok(())
}

fn sift_down<E>(
    items: &mut [Value],
    start: usize,
    end: usize,
    less: &mut impl FnMut(&Value, &Value) -> Result<bool, E>,
) -> Result<(), E> {
    let mut root = start;
    while root * 2 + 1 <= end {
        let mut child = root * 2 + 1;
        if child < end && less(&items[child], &items[child + 1])? {
            child += 1;
        }
        if less(&items[root], &items[child])? {
            items.swap(root, child);
            root = child;
        } else {
            return Ok(());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_read() {
        let mut l = List::new();
        l.set(1, Value::Integer(10)).unwrap();
        l.set(2, Value::Integer(20)).unwrap();
        assert_eq!(l.len(), 2);
        assert!(l.get(3).is_nil());
        assert!(l.set(4, Value::Integer(40)).is_err());
    }

    #[test]
    fn insert_shifts_tail() {
        let mut l = List::from_values(vec![Value::Integer(1), Value::Integer(3)]);
        l.insert(2, Value::Integer(2)).unwrap();
        assert!(l.get(2).raw_eq(&Value::Integer(2)));
        assert_eq!(l.len(), 3);
    }

    #[test]
    fn remove_returns_value() {
        let mut l = List::from_values(vec![Value::Integer(1), Value::Integer(2)]);
        let v = l.remove(1).unwrap();
        assert!(v.raw_eq(&Value::Integer(1)));
        assert_eq!(l.len(), 1);
    }

    #[test]
    fn index_of_uses_raw_equality() {
        let l = List::from_values(vec![Value::Integer(1), Value::Float(2.0)]);
        assert_eq!(l.index_of(&Value::Integer(2)), 2);
        assert_eq!(l.index_of(&Value::from("2")), 0);
    }

    #[test]
    fn sort_orders_with_the_supplied_less() {
        let mut l = List::from_values(
            [5i64, 1, 4, 2, 3, 2].iter().map(|n| Value::Integer(*n)).collect(),
        );
        l.sort_by(|a, b| Ok::<_, ()>(a.as_integer() < b.as_integer()))
            .unwrap();
        let sorted: Vec<i64> = l.items().iter().filter_map(Value::as_integer).collect();
        assert_eq!(sorted, vec![1, 2, 2, 3, 4, 5]);
    }

    #[test]
    fn sort_stops_at_the_first_comparator_error() {
        let mut l = List::from_values((0..16).map(Value::Integer).collect());
        let mut calls = 0;
        let err = l.sort_by(|a, b| {
            calls += 1;
            if calls > 3 {
                Err("cmp failed")
            } else {
                Ok(a.as_integer() < b.as_integer())
            }
        });
        assert_eq!(err, Err("cmp failed"));
        assert_eq!(calls, 4);
    }
}
