// Core language semantics: values, operators, control flow, closures.

use luno::{ErrorKind, Value, Vm};

fn run(src: &str) -> Vec<Value> {
    Vm::new().run_source(src, "test.luno").expect("chunk runs")
}

fn run1(src: &str) -> Value {
    run(src).into_iter().next().unwrap_or(Value::Nil)
}

fn run_err(src: &str) -> luno::LunoError {
    Vm::new().run_source(src, "test.luno").unwrap_err()
}

#[test]
fn arithmetic_round_trip() {
    assert!(run1("return 1 + 2").raw_eq(&Value::Integer(3)));
}

#[test]
fn compilation_is_deterministic() {
    let src = "local function fib(n)\n  if n < 2 then return n end\n  return fib(n - 1) + fib(n - 2)\nend\nreturn fib(10)";
    let a = luno::compile(src, "det.luno").expect("compiles");
    let b = luno::compile(src, "det.luno").expect("compiles");
    assert_eq!(luno::binary::serialize(&a), luno::binary::serialize(&b));
}

#[test]
fn division_always_promotes_to_float() {
    assert!(run1("return 1 / 2").raw_eq(&Value::Float(0.5)));
    assert!(run1("return 4 / 2").raw_eq(&Value::Float(2.0)));
}

#[test]
fn floor_division_stays_integer() {
    assert!(run1("return 7 // 2").raw_eq(&Value::Integer(3)));
    assert!(run1("return -7 // 2").raw_eq(&Value::Integer(-4)));
    assert!(run1("return 7.0 // 2").raw_eq(&Value::Float(3.0)));
}

#[test]
fn mixed_arithmetic_promotes() {
    assert!(run1("return 1 + 0.5").raw_eq(&Value::Float(1.5)));
    assert!(run1("return 2 ^ 10").raw_eq(&Value::Float(1024.0)));
    assert!(run1("return 10 % 3").raw_eq(&Value::Integer(1)));
    assert!(run1("return -5 % 3").raw_eq(&Value::Integer(1)));
}

#[test]
fn bitwise_and_shifts() {
    assert!(run1("return 6 & 3").raw_eq(&Value::Integer(2)));
    assert!(run1("return 6 | 3").raw_eq(&Value::Integer(7)));
    assert!(run1("return 6 ~ 3").raw_eq(&Value::Integer(5)));
    assert!(run1("return 1 << 4").raw_eq(&Value::Integer(16)));
    assert!(run1("return 256 >> 4").raw_eq(&Value::Integer(16)));
}

#[test]
fn comparison_chains_through_jumps() {
    assert!(run1("return 1 < 2").raw_eq(&Value::Boolean(true)));
    assert!(run1("return 2 <= 1").raw_eq(&Value::Boolean(false)));
    assert!(run1("return 'a' < 'b'").raw_eq(&Value::Boolean(true)));
    assert!(run1("local x = 5 return x > 3 and x < 10").raw_eq(&Value::Boolean(true)));
}

#[test]
fn and_or_return_operands() {
    assert!(run1("return nil or 'fallback'").raw_eq(&Value::from("fallback")));
    assert!(run1("return false and error('never')").raw_eq(&Value::Boolean(false)));
    assert!(run1("return 1 and 2").raw_eq(&Value::Integer(2)));
}

#[test]
fn string_concat_is_right_associative() {
    assert!(run1("return 'a' .. 'b' .. 1 .. 2").raw_eq(&Value::from("ab12")));
}

#[test]
fn sequential_table_length() {
    let out = run(
        "local t = {}\nfor i = 1, 100 do t[i] = i * i end\nreturn #t, t[100]",
    );
    assert!(out[0].raw_eq(&Value::Integer(100)));
    assert!(out[1].raw_eq(&Value::Integer(10000)));
}

#[test]
fn table_and_list_constructors() {
    let out = run("local t = {x = 1, [2] = 'two', 'first'}\nreturn t.x, t[2], t[1]");
    assert!(out[0].raw_eq(&Value::Integer(1)));
    assert_eq!(out[1].display(), "two");
    assert_eq!(out[2].display(), "first");
}

#[test]
fn list_literal_is_a_distinct_type() {
    let out = run("local l = [10, 20, 30]\nreturn type(l), #l, l[2]");
    assert_eq!(out[0].display(), "list");
    assert!(out[1].raw_eq(&Value::Integer(3)));
    assert!(out[2].raw_eq(&Value::Integer(20)));
}

#[test]
fn while_and_repeat_loops() {
    assert!(run1("local n = 0\nwhile n < 10 do n = n + 3 end\nreturn n")
        .raw_eq(&Value::Integer(12)));
    assert!(run1("local n = 0\nrepeat n = n + 1 until n >= 5\nreturn n")
        .raw_eq(&Value::Integer(5)));
}

#[test]
fn numeric_for_with_step() {
    assert!(run1("local sum = 0\nfor i = 10, 1, -2 do sum = sum + i end\nreturn sum")
        .raw_eq(&Value::Integer(30)));
    assert!(run1("local sum = 0\nfor i = 1, 0 do sum = sum + i end\nreturn sum")
        .raw_eq(&Value::Integer(0)));
}

#[test]
fn generic_for_over_ipairs() {
    let out = run(
        "local t = {'a', 'b', 'c'}\nlocal keys, last = 0, nil\nfor i, v in ipairs(t) do\n  keys = keys + i\n  last = v\nend\nreturn keys, last",
    );
    assert!(out[0].raw_eq(&Value::Integer(6)));
    assert_eq!(out[1].display(), "c");
}

#[test]
fn break_and_continue() {
    assert!(
        run1("local n = 0\nfor i = 1, 10 do\n  if i > 4 then break end\n  n = n + i\nend\nreturn n")
            .raw_eq(&Value::Integer(10))
    );
    assert!(run1(
        "local n = 0\nfor i = 1, 10 do\n  if i % 2 == 0 then continue end\n  n = n + i\nend\nreturn n"
    )
    .raw_eq(&Value::Integer(25)));
}

#[test]
fn upvalues_are_shared_within_one_call() {
    let out = run(
        "local function pair()\n  local n = 0\n  local function bump() n = n + 1 end\n  local function read() return n end\n  return bump, read\nend\nlocal bump, read = pair()\nbump()\nbump()\nreturn read()",
    );
    assert!(out[0].raw_eq(&Value::Integer(2)));
}

#[test]
fn loop_iterations_capture_fresh_variables() {
    let out = run(
        "local fs = {}\nfor i = 1, 3 do\n  fs[i] = function() return i end\nend\nreturn fs[1](), fs[2](), fs[3]()",
    );
    assert!(out[0].raw_eq(&Value::Integer(1)));
    assert!(out[1].raw_eq(&Value::Integer(2)));
    assert!(out[2].raw_eq(&Value::Integer(3)));
}

#[test]
fn local_initializer_sees_the_outer_binding() {
    let out = run("local x = 'outer'\ndo\n  local x = x .. '!'\n  return x\nend");
    assert_eq!(out[0].display(), "outer!");
}

#[test]
fn multiple_assignment_balances_both_ways() {
    let out = run("local a, b, c = 1, 2\nreturn a, b, c");
    assert!(out[0].raw_eq(&Value::Integer(1)));
    assert!(out[2].is_nil());
    let out = run("local a, b = 1, 2\na, b = b, a\nreturn a, b");
    assert!(out[0].raw_eq(&Value::Integer(2)));
    assert!(out[1].raw_eq(&Value::Integer(1)));
}

#[test]
fn multiple_returns_thread_through_calls() {
    let out = run(
        "local function three() return 1, 2, 3 end\nlocal function sum(a, b, c) return a + b + c end\nreturn sum(three()), (three())",
    );
    assert!(out[0].raw_eq(&Value::Integer(6)));
    assert!(out[1].raw_eq(&Value::Integer(1)));
}

#[test]
fn varargs_and_select() {
    let out = run(
        "local function count(...)\n  return select('#', ...), ...\nend\nreturn count('a', 'b')",
    );
    assert!(out[0].raw_eq(&Value::Integer(2)));
    assert_eq!(out[1].display(), "a");
}

#[test]
fn method_calls_pass_self() {
    let out = run(
        "local account = {balance = 10}\nfunction account:deposit(n)\n  self.balance = self.balance + n\nend\naccount:deposit(5)\nreturn account.balance",
    );
    assert!(out[0].raw_eq(&Value::Integer(15)));
}

#[test]
fn metatable_arithmetic_hook() {
    let out = run(
        "local v = setmetatable({x = 1}, {__add = function(a, b) return a.x + b end})\nreturn v + 41",
    );
    assert!(out[0].raw_eq(&Value::Integer(42)));
}

#[test]
fn metatable_index_and_newindex() {
    let out = run(
        "local log = {}\nlocal proxy = setmetatable({}, {\n  __index = function(_, k) return 'default:' .. k end,\n  __newindex = function(_, k, v) log[k] = v end,\n})\nproxy.a = 1\nreturn proxy.missing, log.a, rawget(proxy, 'a')",
    );
    assert_eq!(out[0].display(), "default:missing");
    assert!(out[1].raw_eq(&Value::Integer(1)));
    assert!(out[2].is_nil());
}

#[test]
fn goto_labels_jump_backward_and_forward() {
    let out = run(
        "local n = 0\n::again::\nn = n + 1\nif n < 3 then goto again end\ngoto done\nn = 100\n::done::\nreturn n",
    );
    assert!(out[0].raw_eq(&Value::Integer(3)));
}

#[test]
fn goto_into_a_local_scope_is_a_syntax_error() {
    let err = luno::compile(
        "do\n  goto skip\n  local x = 1\n  ::skip::\n  x = 2\nend",
        "bad.luno",
    )
    .unwrap_err();
    assert_eq!(err.kind, ErrorKind::SyntaxError);
}

#[test]
fn runtime_errors_carry_location() {
    let err = run_err("local x = nil\nreturn x.field");
    assert_eq!(err.kind, ErrorKind::RuntimeError);
    assert!(!err.message.is_empty());
}

#[test]
fn integer_float_equality() {
    assert!(run1("return 1 == 1.0").raw_eq(&Value::Boolean(true)));
    assert!(run1("return 1 == '1'").raw_eq(&Value::Boolean(false)));
}

#[test]
fn length_operator() {
    assert!(run1("return #'hello'").raw_eq(&Value::Integer(5)));
    assert!(run1("return #{1, 2, 3}").raw_eq(&Value::Integer(3)));
}
