// Luno Base Library

use super::{bad_arg, check_table, global, native, opt_int};
use crate::vm::closure::Closure;
use crate::vm::value::{Fault, Value};
use crate::vm::Vm;
use std::sync::Arc;

pub fn install(vm: &mut Vm) {
    global(vm, "print", |vm, args| {
        let mut parts = Vec::with_capacity(args.len());
        for arg in args {
            parts.push(vm.coerce_to_string(arg)?.as_str().to_string());
        }
        println!("{}", parts.join("\t"));
        Ok(Vec::new())
    });

    global(vm, "type", |_, args| {
        if args.is_empty() {
            return Err(bad_arg("type", 0, "value", &Value::Nil));
        }
        Ok(vec![Value::from(args[0].type_name())])
    });

    global(vm, "tostring", |vm, args| {
        let s = vm.coerce_to_string(&Vm::arg(args, 0))?;
        Ok(vec![Value::Str(s)])
    });

    global(vm, "tonumber", |_, args| {
        let v = Vm::arg(args, 0);
        let result = match args.get(1) {
            None | Some(Value::Nil) => match &v {
                Value::Integer(_) | Value::Float(_) => v.clone(),
                Value::Str(s) => s
                    .as_number()
                    .map(|n| n.to_value())
                    .unwrap_or(Value::Nil),
                _ => Value::Nil,
            },
            Some(base) => {
                let base = base
                    .as_integer()
                    .filter(|b| (2..=36).contains(b))
                    .ok_or_else(|| {
                        Fault::raise_str("bad argument #2 to 'tonumber' (base out of range)")
                    })?;
                match &v {
                    Value::Str(s) => i64::from_str_radix(s.as_str().trim(), base as u32)
                        .map(Value::Integer)
                        .unwrap_or(Value::Nil),
                    other => return Err(bad_arg("tonumber", 0, "string", other)),
                }
            }
        };
        Ok(vec![result])
    });

    global(vm, "next", |_, args| {
        next_impl(&Vm::arg(args, 0), &Vm::arg(args, 1))
    });

    global(vm, "pairs", |vm, args| {
        let subject = Vm::arg(args, 0);
        if let Some(hook) = vm.get_metamethod(&subject, "__pairs") {
            let mut results = vm.call_value(hook, vec![subject])?;
            results.resize(3, Value::Nil);
            return Ok(results);
        }
        if !matches!(subject, Value::Table(_) | Value::List(_)) {
            return Err(bad_arg("pairs", 0, "table", &subject));
        }
        let iter = native("next", |_, args| {
            next_impl(&Vm::arg(args, 0), &Vm::arg(args, 1))
        });
        Ok(vec![iter, subject, Value::Nil])
    });

    global(vm, "ipairs", |_, args| {
        let subject = Vm::arg(args, 0);
        if !matches!(subject, Value::Table(_) | Value::List(_)) {
            return Err(bad_arg("ipairs", 0, "table", &subject));
        }
        let iter = native("ipairs_iter", |_, args| {
            let i = Vm::arg(args, 1).as_integer().unwrap_or(0) + 1;
            let v = match Vm::arg(args, 0) {
                Value::Table(t) => t.lock().raw_get(&Value::Integer(i)),
                Value::List(l) => l.lock().get(i),
                _ => Value::Nil,
            };
            if v.is_nil() {
                Ok(vec![Value::Nil])
            } else {
                Ok(vec![Value::Integer(i), v])
            }
        });
        Ok(vec![iter, subject, Value::Integer(0)])
    });

    global(vm, "error", |vm, args| {
        let value = Vm::arg(args, 0);
        let level = opt_int("error", args, 1, 1)?;
        let value = match (&value, level) {
            (Value::Str(s), l) if l > 0 => {
                let (source, line) = vm.where_am_i();
                Value::from(format!("{}:{}: {}", source, line, s.as_str()))
            }
            _ => value,
        };
        Err(Fault::raise(value))
    });

    global(vm, "assert", |_, args| {
        if Vm::arg(args, 0).is_truthy() {
            return Ok(args.to_vec());
        }
        match args.get(1) {
            Some(message) => Err(Fault::raise(message.clone())),
            None => Err(Fault::raise_str("assertion failed!")),
        }
    });

    global(vm, "pcall", |vm, args| {
        if args.is_empty() {
            return Err(bad_arg("pcall", 0, "value", &Value::Nil));
        }
        // Script bodies run under a protected frame so a yield inside
        // them suspends instead of tripping the native boundary.
        let outcome = match &args[0] {
            Value::Closure(c) => vm.protected_call(c.clone(), &args[1..]),
            _ => vm
                .call_value(args[0].clone(), args[1..].to_vec())
                .map(|mut results| {
                    results.insert(0, Value::Boolean(true));
                    results
                }),
        };
        match outcome {
            Ok(results) => Ok(results),
            Err(Fault::Raise(raised)) => Ok(vec![Value::Boolean(false), raised.value]),
            Err(other) => Err(other),
        }
    });

    global(vm, "select", |_, args| {
        match Vm::arg(args, 0) {
            Value::Str(s) if s.as_str() == "#" => {
                Ok(vec![Value::Integer(args.len() as i64 - 1)])
            }
            v => {
                let rest = args.len() as i64 - 1;
                let n = v
                    .as_integer()
                    .ok_or_else(|| bad_arg("select", 0, "number", &v))?;
                let start = if n < 0 { rest + n } else { n - 1 };
                if start < 0 {
                    return Err(Fault::raise_str(
                        "bad argument #1 to 'select' (index out of range)",
                    ));
                }
                Ok(args[1..]
                    .iter()
                    .skip(start as usize)
                    .cloned()
                    .collect())
            }
        }
    });

    global(vm, "rawget", |_, args| {
        let t = check_table("rawget", args, 0)?;
        let v = t.lock().raw_get(&Vm::arg(args, 1));
        Ok(vec![v])
    });

    global(vm, "rawset", |vm, args| {
        let t = check_table("rawset", args, 0)?;
        t.lock()
            .raw_set(Vm::arg(args, 1), Vm::arg(args, 2))
            .map_err(|e| vm.rt(e))?;
        Ok(vec![Vm::arg(args, 0)])
    });

    global(vm, "rawequal", |_, args| {
        Ok(vec![Value::Boolean(
            Vm::arg(args, 0).raw_eq(&Vm::arg(args, 1)),
        )])
    });

    global(vm, "rawlen", |_, args| {
        let n = match Vm::arg(args, 0) {
            Value::Table(t) => t.lock().length(),
            Value::List(l) => l.lock().len() as i64,
            Value::Str(s) => s.len() as i64,
            v => return Err(bad_arg("rawlen", 0, "table or string", &v)),
        };
        Ok(vec![Value::Integer(n)])
    });

    global(vm, "setmetatable", |_, args| {
        let t = check_table("setmetatable", args, 0)?;
        let mt = match Vm::arg(args, 1) {
            Value::Nil => None,
            Value::Table(mt) => Some(mt),
            v => return Err(bad_arg("setmetatable", 1, "nil or table", &v)),
        };
        let protected = t
            .lock()
            .metatable()
            .map(|m| !m.lock().raw_get(&Value::from("__metatable")).is_nil())
            .unwrap_or(false);
        if protected {
            return Err(Fault::raise_str("cannot change a protected metatable"));
        }
        t.lock().set_metatable(mt);
        Ok(vec![Vm::arg(args, 0)])
    });

    global(vm, "getmetatable", |_, args| {
        let mt = match Vm::arg(args, 0) {
            Value::Table(t) => t.lock().metatable(),
            _ => None,
        };
        let result = match mt {
            Some(mt) => {
                let shield = mt.lock().raw_get(&Value::from("__metatable"));
                if shield.is_nil() {
                    Value::Table(mt)
                } else {
                    shield
                }
            }
            None => Value::Nil,
        };
        Ok(vec![result])
    });

    global(vm, "unpack", unpack);

    global(vm, "load", |_, args| {
        let chunk = match Vm::arg(args, 0) {
            Value::Str(s) => s,
            v => return Err(bad_arg("load", 0, "string", &v)),
        };
        let name = match args.get(1) {
            Some(Value::Str(s)) => s.as_str().to_string(),
            _ => "=(load)".to_string(),
        };
        match crate::compiler::Parser::compile(chunk.as_str(), &name) {
            Ok(proto) => Ok(vec![Value::Closure(Arc::new(Closure::new(
                proto,
                Vec::new(),
            )))]),
            Err(e) => Ok(vec![Value::Nil, Value::from(e.message)]),
        }
    });
}

/// Shared by `next` and the `pairs` iterator.
fn next_impl(subject: &Value, key: &Value) -> Result<Vec<Value>, Fault> {
    match subject {
        Value::Table(t) => match t.lock().next_entry(key) {
            Ok(Some((k, v))) => Ok(vec![k, v]),
            Ok(None) => Ok(vec![Value::Nil]),
            Err(()) => Err(Fault::raise_str("invalid key to 'next'")),
        },
        Value::List(l) => {
            let list = l.lock();
            let i = match key {
                Value::Nil => 1,
                Value::Integer(i) => i + 1,
                _ => return Err(Fault::raise_str("invalid key to 'next'")),
            };
            let v = list.get(i);
            if v.is_nil() {
                Ok(vec![Value::Nil])
            } else {
                Ok(vec![Value::Integer(i), v])
            }
        }
        other => Err(bad_arg("next", 0, "table", other)),
    }
}

/// `unpack(t [, i [, j]])`, shared with `table.unpack`.
pub(super) fn unpack(vm: &mut Vm, args: &[Value]) -> Result<Vec<Value>, Fault> {
    let subject = Vm::arg(args, 0);
    let len = match &subject {
        Value::Table(t) => t.lock().length(),
        Value::List(l) => l.lock().len() as i64,
        v => return Err(bad_arg("unpack", 0, "table", v)),
    };
    let i = opt_int("unpack", args, 1, 1)?;
    let j = opt_int("unpack", args, 2, len)?;
    if j - i >= 1_000_000 {
        return Err(vm.rt("too many results to unpack"));
    }
    let mut out = Vec::new();
    for n in i..=j {
        let v = match &subject {
            Value::Table(t) => t.lock().raw_get(&Value::Integer(n)),
            Value::List(l) => l.lock().get(n),
            _ => unreachable!(),
        };
        out.push(v);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use crate::vm::value::Value;
    use crate::vm::Vm;

    fn run(src: &str) -> Vec<Value> {
        Vm::new().run_source(src, "test.luno").expect("runs")
    }

    #[test]
    fn type_names() {
        let out = run("return type(nil), type(1), type(1.5), type('s'), type({}), type(print)");
        let names: Vec<_> = out.iter().map(|v| v.display()).collect();
        assert_eq!(names, ["nil", "number", "number", "string", "table", "function"]);
    }

    #[test]
    fn tonumber_conversions() {
        let out = run("return tonumber('42'), tonumber('0x10'), tonumber('no'), tonumber('ff', 16)");
        assert!(out[0].raw_eq(&Value::Integer(42)));
        assert!(out[1].raw_eq(&Value::Integer(16)));
        assert!(out[2].is_nil());
        assert!(out[3].raw_eq(&Value::Integer(255)));
    }

    #[test]
    fn pcall_catches_errors() {
        let out = run("local ok, err = pcall(function() error('boom') end)\nreturn ok, err");
        assert!(out[0].raw_eq(&Value::Boolean(false)));
        assert!(out[1].display().contains("boom"));
    }

    #[test]
    fn select_counts_and_slices() {
        let out = run("return select('#', 'a', 'b', 'c')");
        assert!(out[0].raw_eq(&Value::Integer(3)));
        let out = run("return select(2, 'a', 'b', 'c')");
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].display(), "b");
    }

    #[test]
    fn pairs_visits_every_entry() {
        let out = run(
            "local t = { a = 1, b = 2, c = 3 }\nlocal n = 0\nfor k, v in pairs(t) do n = n + v end\nreturn n",
        );
        assert!(out[0].raw_eq(&Value::Integer(6)));
    }

    #[test]
    fn ipairs_stops_at_first_nil() {
        let out = run(
            "local t = { 10, 20, nil, 40 }\nlocal n = 0\nfor i, v in ipairs(t) do n = n + 1 end\nreturn n",
        );
        assert!(out[0].raw_eq(&Value::Integer(2)));
    }

    #[test]
    fn metatable_index_chain() {
        let out = run(
            "local base = { greeting = 'hi' }\nlocal t = setmetatable({}, { __index = base })\nreturn t.greeting",
        );
        assert_eq!(out[0].display(), "hi");
    }

    #[test]
    fn load_compiles_a_chunk() {
        let out = run("local f = load('return 1 + 2')\nreturn f()");
        assert!(out[0].raw_eq(&Value::Integer(3)));
    }

    #[test]
    fn load_reports_syntax_errors() {
        let out = run("local f, err = load('return +')\nreturn f, err");
        assert!(out[0].is_nil());
        assert!(!out[1].is_nil());
    }
}
