// The extended control forms: defer, try/catch/finally, switch,
// import/module, coroutines.

use luno::bridge::{ForeignBridge, Interceptor, ResourceLoader};
use luno::vm::table::Table;
use luno::{Value, Vm};
use std::sync::Arc;

fn run(src: &str) -> Vec<Value> {
    Vm::new().run_source(src, "test.luno").expect("chunk runs")
}

fn run1(src: &str) -> Value {
    run(src).into_iter().next().unwrap_or(Value::Nil)
}

// ---- defer -------------------------------------------------------------

#[test]
fn defer_runs_in_reverse_order_at_return() {
    let out = run(
        "local order = ''\nlocal function f()\n  defer order = order .. 'f' end\n  defer order = order .. 'g' end\n  order = order .. 'body'\nend\nf()\nreturn order",
    );
    assert_eq!(out[0].display(), "bodygf");
}

#[test]
fn defer_runs_when_the_function_errors() {
    let out = run(
        "local order = ''\nlocal function f()\n  defer order = order .. 'f' end\n  defer order = order .. 'g' end\n  error('boom')\nend\npcall(f)\nreturn order",
    );
    assert_eq!(out[0].display(), "gf");
}

#[test]
fn defer_sees_the_inflight_error() {
    let out = run(
        "local seen\nlocal function f()\n  defer seen = err end\n  error('the-problem')\nend\npcall(f)\nreturn seen",
    );
    assert!(out[0].display().contains("the-problem"));
}

#[test]
fn defer_is_scoped_to_its_function() {
    let out = run(
        "local order = ''\nlocal function inner()\n  defer order = order .. 'i' end\nend\nlocal function outer()\n  defer order = order .. 'o' end\n  inner()\n  order = order .. '-'\nend\nouter()\nreturn order",
    );
    assert_eq!(out[0].display(), "i-o");
}

// ---- try / catch / finally ---------------------------------------------

#[test]
fn try_catch_receives_the_error_value() {
    let out = run(
        "local caught\ntry\n  error('oops')\ncatch (e)\n  caught = e\nend\nreturn caught",
    );
    assert!(out[0].display().contains("oops"));
}

#[test]
fn try_without_error_skips_catch() {
    let out = run(
        "local path = ''\ntry\n  path = path .. 'try'\ncatch (e)\n  path = path .. 'catch'\nfinally\n  path = path .. '+finally'\nend\nreturn path",
    );
    assert_eq!(out[0].display(), "try+finally");
}

#[test]
fn finally_runs_on_error_then_rethrows() {
    let out = run(
        "local ran = false\nlocal ok, err = pcall(function()\n  try\n    error('inner')\n  finally\n    ran = true\n  end\nend)\nreturn ok, ran, err",
    );
    assert!(out[0].raw_eq(&Value::Boolean(false)));
    assert!(out[1].raw_eq(&Value::Boolean(true)));
    assert!(out[2].display().contains("inner"));
}

#[test]
fn return_inside_try_returns_from_enclosing_function() {
    let out = run(
        "local function f()\n  try\n    return 'early'\n  finally\n  end\n  return 'late'\nend\nreturn f()",
    );
    assert_eq!(out[0].display(), "early");
}

#[test]
fn try_in_loop_runs_finally_once_per_invocation() {
    let out = run(
        "local n = 0\nfor i = 1, 3 do\n  try\n    if i == 2 then error('skip') end\n  catch (e)\n  finally\n    n = n + 1\n  end\nend\nreturn n",
    );
    assert!(out[0].raw_eq(&Value::Integer(3)));
}

#[test]
fn return_inside_nested_try_carries_its_value_out() {
    let out = run(
        "local function f()\n  try\n    try\n      return 'early'\n    finally\n    end\n  finally\n  end\n  return 'late'\nend\nreturn f()",
    );
    assert_eq!(out[0].display(), "early");
}

#[test]
fn nested_try_unwinds_in_order() {
    let out = run(
        "local path = ''\ntry\n  try\n    error('x')\n  finally\n    path = path .. 'inner'\n  end\ncatch (e)\n  path = path .. '+outer'\nend\nreturn path",
    );
    assert_eq!(out[0].display(), "inner+outer");
}

// ---- switch ------------------------------------------------------------

#[test]
fn switch_selects_the_matching_case() {
    let src = "local function classify(x)\n  switch x\n  case 1, 2 then return 'small'\n  case 'many' then return 'word'\n  default return 'other'\n  end\nend\nreturn classify(2), classify('many'), classify(99)";
    let out = run(src);
    assert_eq!(out[0].display(), "small");
    assert_eq!(out[1].display(), "word");
    assert_eq!(out[2].display(), "other");
}

#[test]
fn when_is_a_synonym_for_switch() {
    let out = run(
        "local hit = 0\nwhen 3\ncase 1 then hit = 1\ncase 3 then hit = 3\nend\nreturn hit",
    );
    assert!(out[0].raw_eq(&Value::Integer(3)));
}

#[test]
fn switch_without_match_or_default_falls_through() {
    let out = run("local n = 0\nswitch 9\ncase 1 then n = 1\nend\nreturn n");
    assert!(out[0].raw_eq(&Value::Integer(0)));
}

// ---- import / module ---------------------------------------------------

struct TestBridge;

impl ForeignBridge for TestBridge {
    fn load_class(&self, name: &str) -> Option<Value> {
        if name == "host.geo.Point" || name == "Point" {
            let t = Table::new_ref();
            let _ = t.lock().raw_set(Value::from("dims"), Value::Integer(2));
            Some(Value::Table(t))
        } else {
            None
        }
    }
}

#[test]
fn import_binds_the_last_segment() {
    let mut vm = Vm::new();
    vm.set_bridge(Arc::new(TestBridge));
    let out = vm
        .run_source("import \"host.geo.Point\"\nreturn Point.dims", "test.luno")
        .expect("runs");
    assert!(out[0].raw_eq(&Value::Integer(2)));
}

#[test]
fn import_alias_renames_the_binding() {
    let mut vm = Vm::new();
    vm.set_bridge(Arc::new(TestBridge));
    let out = vm
        .run_source("import P \"host.geo.Point\"\nreturn P.dims", "test.luno")
        .expect("runs");
    assert!(out[0].raw_eq(&Value::Integer(2)));
}

#[test]
fn package_import_resolves_unbound_globals() {
    let mut vm = Vm::new();
    vm.set_bridge(Arc::new(TestBridge));
    let out = vm
        .run_source("import \"host.geo.*\"\nreturn Point.dims", "test.luno")
        .expect("runs");
    assert!(out[0].raw_eq(&Value::Integer(2)));
}

#[test]
fn unknown_import_is_an_error() {
    let mut vm = Vm::new();
    vm.set_bridge(Arc::new(TestBridge));
    let err = vm
        .run_source("import \"host.geo.Missing\"", "test.luno")
        .unwrap_err();
    assert!(err.message.contains("Missing"));
}

struct MapLoader;

impl ResourceLoader for MapLoader {
    fn load(&self, name: &str) -> Option<Vec<u8>> {
        match name {
            "app/mathx.luno" => {
                Some(b"local m = {}\nfunction m.double(x) return x * 2 end\nreturn m".to_vec())
            }
            _ => None,
        }
    }
}

#[test]
fn import_falls_back_to_script_modules() {
    let mut vm = Vm::new();
    vm.set_loader(Arc::new(MapLoader));
    let out = vm
        .run_source("import \"app.mathx\"\nreturn mathx.double(21)", "test.luno")
        .expect("runs");
    assert!(out[0].raw_eq(&Value::Integer(42)));
}

#[test]
fn script_modules_run_once_per_vm() {
    let mut vm = Vm::new();
    vm.set_loader(Arc::new(MapLoader));
    let out = vm
        .run_source(
            "import \"app.mathx\"\nimport m \"app.mathx\"\nmathx.marker = true\nreturn m.marker",
            "test.luno",
        )
        .expect("runs");
    assert!(out[0].raw_eq(&Value::Boolean(true)));
}

struct BlockPrint;

impl Interceptor for BlockPrint {
    fn before_call(&self, target: &str, _args: &[Value]) -> Option<Vec<Value>> {
        (target == "print").then(|| vec![Value::from("blocked")])
    }
}

#[test]
fn interceptor_short_circuits_native_calls() {
    let mut vm = Vm::new();
    vm.set_interceptor(Arc::new(BlockPrint));
    let out = vm
        .run_source("return print('never shown'), type(1)", "test.luno")
        .expect("runs");
    assert_eq!(out[0].display(), "blocked");
    assert_eq!(out[1].display(), "number");
}

#[test]
fn module_tables_are_shared_across_chunks() {
    let mut vm = Vm::new();
    vm.run_source(
        "module \"app.text\"\nfunction text.shout(s) return string.upper(s) end",
        "a.luno",
    )
    .expect("first chunk");
    let out = vm
        .run_source("module \"app.text\"\nreturn text.shout('hi')", "b.luno")
        .expect("second chunk");
    assert_eq!(out[0].display(), "HI");
}

// ---- coroutines --------------------------------------------------------

#[test]
fn coroutine_ping_pong() {
    let out = run(
        "local co = coroutine.create(function(a, b)\n  local c = coroutine.yield(a + b)\n  local d = coroutine.yield(c * 2)\n  return a + b + c + d\nend)\nlocal _, s = coroutine.resume(co, 1, 2)\nlocal _, p = coroutine.resume(co, 10)\nlocal _, t = coroutine.resume(co, 100)\nreturn s, p, t",
    );
    assert!(out[0].raw_eq(&Value::Integer(3)));
    assert!(out[1].raw_eq(&Value::Integer(20)));
    assert!(out[2].raw_eq(&Value::Integer(113)));
}

#[test]
fn wrapped_coroutine_drives_a_generic_for() {
    let out = run(
        "local function range(n)\n  return coroutine.wrap(function()\n    for i = 1, n do coroutine.yield(i) end\n  end)\nend\nlocal sum = 0\nfor i in range(5) do sum = sum + i end\nreturn sum",
    );
    assert!(out[0].raw_eq(&Value::Integer(15)));
}

#[test]
fn coroutines_nest() {
    let out = run(
        "local inner = coroutine.create(function()\n  coroutine.yield('from-inner')\nend)\nlocal outer = coroutine.create(function()\n  local _, v = coroutine.resume(inner)\n  coroutine.yield(v .. '/relayed')\nend)\nlocal _, v = coroutine.resume(outer)\nreturn v",
    );
    assert_eq!(out[0].display(), "from-inner/relayed");
}

#[test]
fn defer_runs_inside_coroutines() {
    let out = run(
        "local order = ''\nlocal co = coroutine.create(function()\n  defer order = order .. 'deferred' end\n  order = order .. 'body/'\nend)\ncoroutine.resume(co)\nreturn order",
    );
    assert_eq!(out[0].display(), "body/deferred");
}

#[test]
fn pcall_inside_coroutine_catches() {
    let out = run(
        "local co = coroutine.create(function()\n  local ok, err = pcall(function() error('in-co') end)\n  return ok, err\nend)\nlocal _, ok, err = coroutine.resume(co)\nreturn ok, err",
    );
    assert!(out[0].raw_eq(&Value::Boolean(false)));
    assert!(out[1].display().contains("in-co"));
}

#[test]
fn yield_passes_through_pcall() {
    let out = run(
        "local co = coroutine.create(function()\n  local ok, v = pcall(function()\n    return coroutine.yield('ping')\n  end)\n  return ok, v\nend)\nlocal _, y = coroutine.resume(co)\nlocal _, ok, v = coroutine.resume(co, 'pong')\nreturn y, ok, v",
    );
    assert_eq!(out[0].display(), "ping");
    assert!(out[1].raw_eq(&Value::Boolean(true)));
    assert_eq!(out[2].display(), "pong");
}

#[test]
fn pcall_still_catches_after_a_resume() {
    let out = run(
        "local co = coroutine.create(function()\n  local ok, e = pcall(function()\n    coroutine.yield('first')\n    error('later')\n  end)\n  return ok, e\nend)\nlocal _, y = coroutine.resume(co)\nlocal _, ok, e = coroutine.resume(co)\nreturn y, ok, e",
    );
    assert_eq!(out[0].display(), "first");
    assert!(out[1].raw_eq(&Value::Boolean(false)));
    assert!(out[2].display().contains("later"));
}

#[test]
fn yield_passes_through_try() {
    let out = run(
        "local co = coroutine.create(function()\n  local got\n  try\n    got = coroutine.yield('from-try')\n  catch (e)\n    got = 'caught'\n  end\n  return got\nend)\nlocal _, y = coroutine.resume(co)\nlocal _, g = coroutine.resume(co, 'resumed')\nreturn y, g",
    );
    assert_eq!(out[0].display(), "from-try");
    assert_eq!(out[1].display(), "resumed");
}

#[test]
fn finally_runs_after_a_yield_inside_try() {
    let out = run(
        "local order = ''\nlocal co = coroutine.create(function()\n  try\n    coroutine.yield('mid')\n    order = order .. 'rest'\n  finally\n    order = order .. '+fin'\n  end\nend)\ncoroutine.resume(co)\norder = order .. 'out/'\ncoroutine.resume(co)\nreturn order",
    );
    assert_eq!(out[0].display(), "out/rest+fin");
}

#[test]
fn yield_cannot_cross_a_native_callback() {
    // string.gsub drives its replacement function from native code, so
    // a yield inside it has no frame to suspend.
    let out = run(
        "local co = coroutine.create(function()\n  return string.gsub('x', 'x', function()\n    return coroutine.yield('no')\n  end)\nend)\nlocal ok, err = coroutine.resume(co)\nreturn ok, err",
    );
    assert!(out[0].raw_eq(&Value::Boolean(false)));
    assert!(out[1].display().contains("yield across a native call"));
}

#[test]
fn switch_works_inside_coroutines() {
    let out = run1(
        "local co = coroutine.wrap(function(x)\n  switch x\n  case 'a' then coroutine.yield(1)\n  default coroutine.yield(2)\n  end\nend)\nreturn co('a')",
    );
    assert!(out.raw_eq(&Value::Integer(1)));
}
