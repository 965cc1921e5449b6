// Luno Table Library
// Every entry here accepts lists as well as tables, since both carry
// sequence data.

use super::{bad_arg, check_int, check_str, opt_int, register};
use crate::vm::list::heap_sort;
use crate::vm::table::Table;
use crate::vm::value::{Fault, Value};
use crate::vm::Vm;

pub fn install(vm: &mut Vm) {
    let lib = Table::new_ref();

    register(&lib, "insert", |vm, args| {
        let subject = Vm::arg(args, 0);
        let len = seq_len(vm, "insert", &subject)?;
        let (pos, value) = if args.len() >= 3 {
            let pos = check_int("insert", args, 1)?;
            if pos < 1 || pos > len + 1 {
                return Err(vm.rt("bad argument #2 to 'insert' (position out of bounds)"));
            }
            (pos, Vm::arg(args, 2))
        } else {
            (len + 1, Vm::arg(args, 1))
        };
        match &subject {
            Value::Table(t) => {
                let mut t = t.lock();
                let mut i = len;
                while i >= pos {
                    let v = t.raw_get(&Value::Integer(i));
                    set_or_fault(vm, &mut t, i + 1, v)?;
                    i -= 1;
                }
                set_or_fault(vm, &mut t, pos, value)?;
            }
            Value::List(l) => {
                l.lock().insert(pos, value).map_err(|e| vm.rt(e))?;
            }
            other => return Err(bad_arg("insert", 0, "table", other)),
        }
        Ok(vec![])
    });

    register(&lib, "remove", |vm, args| {
        let subject = Vm::arg(args, 0);
        let len = seq_len(vm, "remove", &subject)?;
        let pos = opt_int("remove", args, 1, len)?;
        if len == 0 && args.get(1).is_none() {
            return Ok(vec![Value::Nil]);
        }
        if pos < 1 || pos > len + 1 {
            return Err(vm.rt("bad argument #2 to 'remove' (position out of bounds)"));
        }
        let removed = match &subject {
            Value::Table(t) => {
                let mut t = t.lock();
                let removed = t.raw_get(&Value::Integer(pos));
                for i in pos..len {
                    let v = t.raw_get(&Value::Integer(i + 1));
                    set_or_fault(vm, &mut t, i, v)?;
                }
                if pos <= len {
                    set_or_fault(vm, &mut t, len, Value::Nil)?;
                }
                removed
            }
            Value::List(l) => {
                if pos > len {
                    Value::Nil
                } else {
                    l.lock().remove(pos).map_err(|e| vm.rt(e))?
                }
            }
            other => return Err(bad_arg("remove", 0, "table", other)),
        };
        Ok(vec![removed])
    });

    register(&lib, "concat", |vm, args| {
        let subject = Vm::arg(args, 0);
        let sep = match args.get(1) {
            None | Some(Value::Nil) => String::new(),
            Some(_) => check_str("concat", args, 1)?.as_str().to_string(),
        };
        let len = seq_len(vm, "concat", &subject)?;
        let i = opt_int("concat", args, 2, 1)?;
        let j = opt_int("concat", args, 3, len)?;
        let mut out = String::new();
        for k in i..=j {
            let v = seq_get(&subject, k);
            match v {
                Value::Str(s) => out.push_str(s.as_str()),
                Value::Integer(_) | Value::Float(_) => out.push_str(&v.display()),
                other => {
                    return Err(vm.rt(format!(
                        "invalid value (at index {}) in table for 'concat' (a {})",
                        k,
                        other.type_name()
                    )))
                }
            }
            if k < j {
                out.push_str(&sep);
            }
        }
        Ok(vec![Value::from(out)])
    });

    register(&lib, "unpack", |vm, args| super::base::unpack(vm, args));

    register(&lib, "sort", |vm, args| {
        let subject = Vm::arg(args, 0);
        let cmp = Vm::arg(args, 1);
        let len = seq_len(vm, "sort", &subject)?;
        // Collect, sort without the lock held, write back. The
        // comparator can run arbitrary code that touches the table.
        let mut items: Vec<Value> = (1..=len).map(|i| seq_get(&subject, i)).collect();
        heap_sort(&mut items, |a, b| sort_less(vm, &cmp, a, b))?;
        match &subject {
            Value::Table(t) => {
                let mut t = t.lock();
                for (k, v) in items.into_iter().enumerate() {
                    set_or_fault(vm, &mut t, k as i64 + 1, v)?;
                }
            }
            Value::List(l) => {
                l.lock().replace_items(items).map_err(|e| vm.rt(e))?;
            }
            other => return Err(bad_arg("sort", 0, "table", other)),
        }
        Ok(vec![])
    });

    vm.globals.set("table", Value::Table(lib));
}

fn seq_len(vm: &Vm, fname: &str, subject: &Value) -> Result<i64, Fault> {
    match subject {
        Value::Table(t) => Ok(t.lock().length()),
        Value::List(l) => Ok(l.lock().len() as i64),
        other => {
            let _ = vm;
            Err(bad_arg(fname, 0, "table", other))
        }
    }
}

fn seq_get(subject: &Value, index: i64) -> Value {
    match subject {
        Value::Table(t) => t.lock().raw_get(&Value::Integer(index)),
        Value::List(l) => l.lock().get(index),
        _ => Value::Nil,
    }
}

fn set_or_fault(vm: &Vm, t: &mut Table, index: i64, value: Value) -> Result<(), Fault> {
    t.raw_set(Value::Integer(index), value).map_err(|e| vm.rt(e))
}

fn sort_less(vm: &mut Vm, cmp: &Value, a: &Value, b: &Value) -> Result<bool, Fault> {
    if cmp.is_nil() {
        vm.less_than(a, b, false)
    } else {
        let out = vm.call_value(cmp.clone(), vec![a.clone(), b.clone()])?;
        Ok(out.first().map(Value::is_truthy).unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use crate::vm::value::Value;
    use crate::vm::Vm;

    fn run(src: &str) -> Vec<Value> {
        Vm::new().run_source(src, "test.luno").expect("runs")
    }

    #[test]
    fn insert_appends_and_shifts() {
        let out = run(
            "local t = {1, 2, 3}\ntable.insert(t, 4)\ntable.insert(t, 1, 0)\nreturn #t, t[1], t[5]",
        );
        assert!(out[0].raw_eq(&Value::Integer(5)));
        assert!(out[1].raw_eq(&Value::Integer(0)));
        assert!(out[2].raw_eq(&Value::Integer(4)));
    }

    #[test]
    fn remove_returns_the_removed_value() {
        let out = run(
            "local t = {'a', 'b', 'c'}\nlocal last = table.remove(t)\nlocal first = table.remove(t, 1)\nreturn last, first, #t, t[1]",
        );
        assert_eq!(out[0].display(), "c");
        assert_eq!(out[1].display(), "a");
        assert!(out[2].raw_eq(&Value::Integer(1)));
        assert_eq!(out[3].display(), "b");
    }

    #[test]
    fn concat_with_separator_and_range() {
        let out = run("return table.concat({'a', 'b', 'c'}, ',')");
        assert_eq!(out[0].display(), "a,b,c");
        let out = run("return table.concat({1, 2, 3, 4}, '-', 2, 3)");
        assert_eq!(out[0].display(), "2-3");
    }

    #[test]
    fn unpack_spreads_a_sequence() {
        let out = run("return table.unpack({10, 20, 30})");
        assert_eq!(out.len(), 3);
        assert!(out[1].raw_eq(&Value::Integer(20)));
    }

    #[test]
    fn sort_default_ordering() {
        let out = run("local t = {3, 1, 2}\ntable.sort(t)\nreturn t[1], t[2], t[3]");
        assert!(out[0].raw_eq(&Value::Integer(1)));
        assert!(out[2].raw_eq(&Value::Integer(3)));
    }

    #[test]
    fn sort_with_comparator() {
        let out = run(
            "local t = {1, 3, 2}\ntable.sort(t, function(a, b) return a > b end)\nreturn t[1], t[3]",
        );
        assert!(out[0].raw_eq(&Value::Integer(3)));
        assert!(out[1].raw_eq(&Value::Integer(1)));
    }

    #[test]
    fn sort_propagates_comparator_errors() {
        let err = Vm::new()
            .run_source(
                "local t = {8, 3, 5, 1, 9, 2, 7, 4, 6}\ntable.sort(t, function() error('bad cmp') end)",
                "test.luno",
            )
            .unwrap_err();
        assert!(err.message.contains("bad cmp"));
    }

    #[test]
    fn library_works_on_lists() {
        let out = run(
            "local l = [3, 1, 2]\ntable.insert(l, 4)\ntable.sort(l)\nreturn #l, l[1], table.concat(l, '')",
        );
        assert!(out[0].raw_eq(&Value::Integer(4)));
        assert!(out[1].raw_eq(&Value::Integer(1)));
        assert_eq!(out[2].display(), "1234");
    }
}
