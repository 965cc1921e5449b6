// Luno Coroutine Library

use super::{bad_arg, native, register};
use crate::vm::coroutine::Coroutine;
use crate::vm::table::Table;
use crate::vm::value::{Fault, Value};
use crate::vm::Vm;

pub fn install(vm: &mut Vm) {
    let lib = Table::new_ref();

    register(&lib, "create", |_, args| {
        let body = match Vm::arg(args, 0) {
            Value::Closure(c) => c,
            v => return Err(bad_arg("create", 0, "function", &v)),
        };
        Ok(vec![Value::Thread(Coroutine::new(body))])
    });

    register(&lib, "resume", |vm, args| {
        let co = match Vm::arg(args, 0) {
            Value::Thread(co) => co,
            v => return Err(bad_arg("resume", 0, "coroutine", &v)),
        };
        match vm.resume_coroutine(&co, args[1..].to_vec()) {
            Ok(mut values) => {
                values.insert(0, Value::Boolean(true));
                Ok(values)
            }
            Err(value) => Ok(vec![Value::Boolean(false), value]),
        }
    });

    register(&lib, "yield", |vm, args| {
        if !vm.in_coroutine() {
            return Err(vm.rt("attempt to yield from outside a coroutine"));
        }
        Err(Fault::Yield(args.to_vec()))
    });

    register(&lib, "status", |vm, args| {
        let co = match Vm::arg(args, 0) {
            Value::Thread(co) => co,
            v => return Err(bad_arg("status", 0, "coroutine", &v)),
        };
        // The current coroutine reports "running" even though resume
        // parked its state.
        let name = if vm
            .current_coroutine()
            .is_some_and(|cur| std::sync::Arc::ptr_eq(&cur, &co))
        {
            "running"
        } else {
            co.status().name()
        };
        Ok(vec![Value::from(name)])
    });

    register(&lib, "wrap", |_, args| {
        let body = match Vm::arg(args, 0) {
            Value::Closure(c) => c,
            v => return Err(bad_arg("wrap", 0, "function", &v)),
        };
        let co = Coroutine::new(body);
        let f = native("wrapped_coroutine", move |vm, args| {
            vm.resume_coroutine(&co, args.to_vec()).map_err(Fault::raise)
        });
        Ok(vec![f])
    });

    register(&lib, "isyieldable", |vm, _| {
        Ok(vec![Value::Boolean(vm.in_coroutine())])
    });

    register(&lib, "running", |vm, _| {
        Ok(match vm.current_coroutine() {
            Some(co) => vec![Value::Thread(co), Value::Boolean(false)],
            None => vec![Value::Nil, Value::Boolean(true)],
        })
    });

    vm.globals.set("coroutine", Value::Table(lib));
}

#[cfg(test)]
mod tests {
    use crate::vm::value::Value;
    use crate::vm::Vm;

    fn run(src: &str) -> Vec<Value> {
        Vm::new().run_source(src, "test.luno").expect("runs")
    }

    #[test]
    fn create_resume_and_yield() {
        let out = run(
            "local co = coroutine.create(function(a)\n  local b = coroutine.yield(a + 1)\n  return b * 2\nend)\nlocal ok1, v1 = coroutine.resume(co, 10)\nlocal ok2, v2 = coroutine.resume(co, 3)\nreturn ok1, v1, ok2, v2",
        );
        assert!(out[0].raw_eq(&Value::Boolean(true)));
        assert!(out[1].raw_eq(&Value::Integer(11)));
        assert!(out[2].raw_eq(&Value::Boolean(true)));
        assert!(out[3].raw_eq(&Value::Integer(6)));
    }

    #[test]
    fn status_transitions() {
        let out = run(
            "local co = coroutine.create(function() coroutine.yield() end)\nlocal s1 = coroutine.status(co)\ncoroutine.resume(co)\nlocal s2 = coroutine.status(co)\ncoroutine.resume(co)\nlocal s3 = coroutine.status(co)\nreturn s1, s2, s3",
        );
        assert_eq!(out[0].display(), "suspended");
        assert_eq!(out[1].display(), "suspended");
        assert_eq!(out[2].display(), "dead");
    }

    #[test]
    fn resume_dead_coroutine_fails() {
        let out = run(
            "local co = coroutine.create(function() end)\ncoroutine.resume(co)\nlocal ok, err = coroutine.resume(co)\nreturn ok, err",
        );
        assert!(out[0].raw_eq(&Value::Boolean(false)));
        assert!(out[1].display().contains("dead"));
    }

    #[test]
    fn resume_reports_raised_errors() {
        let out = run(
            "local co = coroutine.create(function() error('boom') end)\nlocal ok, err = coroutine.resume(co)\nreturn ok, err",
        );
        assert!(out[0].raw_eq(&Value::Boolean(false)));
        assert!(out[1].display().contains("boom"));
    }

    #[test]
    fn wrap_returns_values_directly() {
        let out = run(
            "local gen = coroutine.wrap(function()\n  for i = 1, 3 do coroutine.yield(i) end\nend)\nreturn gen(), gen(), gen()",
        );
        assert!(out[0].raw_eq(&Value::Integer(1)));
        assert!(out[2].raw_eq(&Value::Integer(3)));
    }

    #[test]
    fn wrap_rethrows_errors() {
        let err = Vm::new()
            .run_source(
                "local f = coroutine.wrap(function() error('inner') end)\nf()",
                "test.luno",
            )
            .unwrap_err();
        assert!(err.message.contains("inner"));
    }

    #[test]
    fn yield_outside_coroutine_is_an_error() {
        let err = Vm::new()
            .run_source("coroutine.yield(1)", "test.luno")
            .unwrap_err();
        assert!(err.message.contains("outside a coroutine"));
    }

    #[test]
    fn isyieldable_tracks_context() {
        let out = run(
            "local co = coroutine.create(function()\n  coroutine.yield(coroutine.isyieldable())\nend)\nlocal _, inside = coroutine.resume(co)\nreturn coroutine.isyieldable(), inside",
        );
        assert!(out[0].raw_eq(&Value::Boolean(false)));
        assert!(out[1].raw_eq(&Value::Boolean(true)));
    }
}
