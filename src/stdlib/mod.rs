// Luno Standard Library
// Installed into a VM's globals at construction

pub mod base;
pub mod coroutine;
pub mod math;
pub mod string;
pub mod table;

use crate::vm::value::{Fault, LunoStr, NativeFunction, TableRef, Value};
use crate::vm::Vm;

pub fn install(vm: &mut Vm) {
    base::install(vm);
    string::install(vm);
    table::install(vm);
    math::install(vm);
    coroutine::install(vm);
}

pub(crate) fn native<F>(name: &str, f: F) -> Value
where
    F: Fn(&mut Vm, &[Value]) -> Result<Vec<Value>, Fault> + Send + Sync + 'static,
{
    Value::Native(NativeFunction::new(name, f))
}

/// Register a function in a library table.
pub(crate) fn register<F>(lib: &TableRef, name: &str, f: F)
where
    F: Fn(&mut Vm, &[Value]) -> Result<Vec<Value>, Fault> + Send + Sync + 'static,
{
    let value = native(name, f);
    let _ = lib.lock().raw_set(Value::from(name), value);
}

/// Register a global function.
pub(crate) fn global<F>(vm: &Vm, name: &str, f: F)
where
    F: Fn(&mut Vm, &[Value]) -> Result<Vec<Value>, Fault> + Send + Sync + 'static,
{
    vm.globals.set(name, native(name, f));
}

pub(crate) fn bad_arg(fname: &str, n: usize, expected: &str, got: &Value) -> Fault {
    let got = if got.is_nil() {
        "no value".to_string()
    } else {
        got.type_name().to_string()
    };
    Fault::raise_str(format!(
        "bad argument #{} to '{}' ({} expected, got {})",
        n + 1,
        fname,
        expected,
        got
    ))
}

pub(crate) fn check_int(fname: &str, args: &[Value], n: usize) -> Result<i64, Fault> {
    let v = Vm::arg(args, n);
    v.as_integer().ok_or_else(|| bad_arg(fname, n, "number", &v))
}

pub(crate) fn opt_int(fname: &str, args: &[Value], n: usize, default: i64) -> Result<i64, Fault> {
    match args.get(n) {
        None | Some(Value::Nil) => Ok(default),
        Some(v) => v.as_integer().ok_or_else(|| bad_arg(fname, n, "number", v)),
    }
}

pub(crate) fn check_str(fname: &str, args: &[Value], n: usize) -> Result<LunoStr, Fault> {
    match Vm::arg(args, n) {
        Value::Str(s) => Ok(s),
        // Numbers coerce to strings where a string is expected.
        v @ (Value::Integer(_) | Value::Float(_)) => Ok(LunoStr::new(v.display())),
        v => Err(bad_arg(fname, n, "string", &v)),
    }
}

pub(crate) fn check_table(fname: &str, args: &[Value], n: usize) -> Result<TableRef, Fault> {
    match Vm::arg(args, n) {
        Value::Table(t) => Ok(t),
        v => Err(bad_arg(fname, n, "table", &v)),
    }
}
