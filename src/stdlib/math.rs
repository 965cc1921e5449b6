// Luno Math Library

use super::{bad_arg, register};
use crate::vm::table::Table;
use crate::vm::value::{float_to_int_exact, Fault, Value};
use crate::vm::Vm;

pub fn install(vm: &mut Vm) {
    let lib = Table::new_ref();

    register(&lib, "floor", |_, args| {
        Ok(vec![round_impl("floor", args, f64::floor)?])
    });

    register(&lib, "ceil", |_, args| {
        Ok(vec![round_impl("ceil", args, f64::ceil)?])
    });

    register(&lib, "abs", |_, args| {
        Ok(vec![match Vm::arg(args, 0) {
            Value::Integer(n) => Value::Integer(n.wrapping_abs()),
            Value::Float(x) => Value::Float(x.abs()),
            v => return Err(bad_arg("abs", 0, "number", &v)),
        }])
    });

    register(&lib, "sqrt", |_, args| {
        let x = check_num("sqrt", args, 0)?;
        Ok(vec![Value::Float(x.sqrt())])
    });

    register(&lib, "max", |vm, args| extremum(vm, "max", args, false));
    register(&lib, "min", |vm, args| extremum(vm, "min", args, true));

    register(&lib, "fmod", |vm, args| {
        Ok(vec![match (Vm::arg(args, 0), Vm::arg(args, 1)) {
            (Value::Integer(a), Value::Integer(b)) => {
                if b == 0 {
                    return Err(vm.rt("bad argument #2 to 'fmod' (zero)"));
                }
                Value::Integer(a.wrapping_rem(b))
            }
            (a, b) => {
                let a = a
                    .as_number()
                    .ok_or_else(|| bad_arg("fmod", 0, "number", &a))?
                    .as_float();
                let b = b
                    .as_number()
                    .ok_or_else(|| bad_arg("fmod", 1, "number", &b))?
                    .as_float();
                Value::Float(a % b)
            }
        }])
    });

    register(&lib, "tointeger", |_, args| {
        Ok(vec![match Vm::arg(args, 0).as_integer() {
            Some(n) => Value::Integer(n),
            None => Value::Nil,
        }])
    });

    register(&lib, "type", |_, args| {
        Ok(vec![match Vm::arg(args, 0) {
            Value::Integer(_) => Value::from("integer"),
            Value::Float(_) => Value::from("float"),
            _ => Value::Nil,
        }])
    });

    {
        let mut t = lib.lock();
        let _ = t.raw_set(Value::from("huge"), Value::Float(f64::INFINITY));
        let _ = t.raw_set(Value::from("pi"), Value::Float(std::f64::consts::PI));
        let _ = t.raw_set(Value::from("maxinteger"), Value::Integer(i64::MAX));
        let _ = t.raw_set(Value::from("mininteger"), Value::Integer(i64::MIN));
    }

    vm.globals.set("math", Value::Table(lib));
}

fn check_num(fname: &str, args: &[Value], n: usize) -> Result<f64, Fault> {
    let v = Vm::arg(args, n);
    v.as_number()
        .map(|n| n.as_float())
        .ok_or_else(|| bad_arg(fname, n, "number", &v))
}

/// Integers pass through; floats land back on an integer when exact.
fn round_impl(fname: &str, args: &[Value], f: fn(f64) -> f64) -> Result<Value, Fault> {
    match Vm::arg(args, 0) {
        Value::Integer(n) => Ok(Value::Integer(n)),
        Value::Float(x) => {
            let r = f(x);
            Ok(match float_to_int_exact(r) {
                Some(n) => Value::Integer(n),
                None => Value::Float(r),
            })
        }
        v => Err(bad_arg(fname, 0, "number", &v)),
    }
}

fn extremum(vm: &mut Vm, fname: &str, args: &[Value], want_min: bool) -> Result<Vec<Value>, Fault> {
    if args.is_empty() {
        return Err(bad_arg(fname, 0, "number", &Value::Nil));
    }
    let mut best = args[0].clone();
    if best.as_number().is_none() {
        return Err(bad_arg(fname, 0, "number", &best));
    }
    for (i, v) in args.iter().enumerate().skip(1) {
        if v.as_number().is_none() {
            return Err(bad_arg(fname, i, "number", v));
        }
        let replace = if want_min {
            vm.less_than(v, &best, false)?
        } else {
            vm.less_than(&best, v, false)?
        };
        if replace {
            best = v.clone();
        }
    }
    Ok(vec![best])
}

#[cfg(test)]
mod tests {
    use crate::vm::value::Value;
    use crate::vm::Vm;

    fn run(src: &str) -> Vec<Value> {
        Vm::new().run_source(src, "test.luno").expect("runs")
    }

    #[test]
    fn floor_and_ceil_return_integers_when_exact() {
        let out = run("return math.floor(3.7), math.ceil(3.2), math.floor(4)");
        assert!(out[0].raw_eq(&Value::Integer(3)));
        assert!(out[1].raw_eq(&Value::Integer(4)));
        assert!(out[2].raw_eq(&Value::Integer(4)));
    }

    #[test]
    fn abs_and_sqrt() {
        let out = run("return math.abs(-5), math.abs(-2.5), math.sqrt(9)");
        assert!(out[0].raw_eq(&Value::Integer(5)));
        assert!(out[1].raw_eq(&Value::Float(2.5)));
        assert!(out[2].raw_eq(&Value::Float(3.0)));
    }

    #[test]
    fn max_and_min_over_varargs() {
        let out = run("return math.max(3, 7, 5), math.min(3, 7, 5)");
        assert!(out[0].raw_eq(&Value::Integer(7)));
        assert!(out[1].raw_eq(&Value::Integer(3)));
    }

    #[test]
    fn fmod_keeps_sign_of_dividend() {
        let out = run("return math.fmod(7, 3), math.fmod(-7, 3)");
        assert!(out[0].raw_eq(&Value::Integer(1)));
        assert!(out[1].raw_eq(&Value::Integer(-1)));
    }

    #[test]
    fn fmod_rejects_integer_zero_divisor() {
        let err = Vm::new()
            .run_source("return math.fmod(1, 0)", "test.luno")
            .unwrap_err();
        assert!(err.message.contains("zero"));
    }

    #[test]
    fn tointeger_and_type() {
        let out = run("return math.tointeger(3.0), math.tointeger(3.5), math.type(1), math.type(1.0), math.type('x')");
        assert!(out[0].raw_eq(&Value::Integer(3)));
        assert!(out[1].is_nil());
        assert_eq!(out[2].display(), "integer");
        assert_eq!(out[3].display(), "float");
        assert!(out[4].is_nil());
    }

    #[test]
    fn constants_are_present() {
        let out = run("return math.huge, math.maxinteger, math.mininteger");
        assert!(out[0].raw_eq(&Value::Float(f64::INFINITY)));
        assert!(out[1].raw_eq(&Value::Integer(i64::MAX)));
        assert!(out[2].raw_eq(&Value::Integer(i64::MIN)));
    }
}
