// Luno Virtual Machine
// Execution state, global environment, and the public run surface

pub mod closure;
pub mod coroutine;
pub mod interp;
pub mod list;
pub mod table;
pub mod value;

use crate::bridge::{ForeignBridge, Interceptor, ResourceLoader};
use crate::compiler::proto::Prototype;
use crate::error::{ErrorKind, LunoError, LunoResult, Span, StackFrame};
use crate::vm::closure::{Closure, Upvalue};
use crate::vm::table::Table;
use crate::vm::value::{Fault, Raised, TableRef, Value};
use parking_lot::Mutex;
use std::sync::Arc;

/// Frames a script may nest before the VM reports a stack overflow.
pub const MAX_CALL_DEPTH: usize = 200;

/// One activation record.
#[derive(Debug)]
pub struct Frame {
    pub closure: Arc<Closure>,
    pub pc: usize,
    /// Absolute stack index of this frame's register 0.
    pub base: usize,
    /// Extra arguments beyond the declared parameters.
    pub varargs: Vec<Value>,
    /// Closures scheduled by `defer`, run LIFO on exit.
    pub deferred: Vec<Value>,
    /// Absolute stack index where results are placed in the caller.
    pub ret_base: usize,
    /// Wanted result count, encoded count+1; 0 keeps all.
    pub want: u8,
    /// How this frame participates in error and yield handling.
    pub protect: Protect,
}

/// Protection attached to a frame. Because the protection lives on the
/// frame rather than in a native caller's Rust stack, a yield can
/// suspend straight through it and a later resume continues the
/// protected body where it left off.
#[derive(Debug)]
pub enum Protect {
    None,
    /// `pcall` body: a normal return gains a leading `true`; a raise
    /// stops unwinding here and is delivered as `false, error`.
    Catch,
    /// One stage of a `try` statement.
    Try(Box<TryState>),
}

/// Bookkeeping for an in-flight `try` statement. The stage bodies are
/// compiler-generated closures whose explicit `return e...` compiles to
/// `return true, e...`, so a truthy leading flag in the stage results
/// means the enclosing function must return.
#[derive(Debug)]
pub struct TryState {
    pub stage: TryStage,
    /// The `catch` handler, entered when the body raises.
    pub catch: Option<Value>,
    /// The `finally` handler, entered after the body or catch stage.
    pub finally: Option<Value>,
    /// Outcome carried from earlier stages into `finally`.
    pub outcome: TryOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryStage {
    Body,
    Catch,
    Finally,
}

/// What a finished `try` statement does to the enclosing function.
#[derive(Debug)]
pub enum TryOutcome {
    /// Fall through to the statement after the `try`.
    Continue,
    /// A stage wrote an explicit `return`; the enclosing function
    /// returns these values.
    Return(Vec<Value>),
    /// Nothing absorbed the error; re-raise once `finally` has run.
    Rethrow(Raised),
}

/// The register stack and call frames of one thread of execution.
/// The main chunk has one; every coroutine carries its own.
#[derive(Debug)]
pub struct ExecState {
    /// Identity for open-upvalue ownership checks.
    pub id: u64,
    pub stack: Vec<Value>,
    /// Logical top for open (variable-length) value sequences.
    pub top: usize,
    pub frames: Vec<Frame>,
    /// Open upvalues by absolute stack slot, ascending.
    pub open_upvalues: Vec<(usize, Upvalue)>,
    /// Where resume arguments land after a yield: (abs slot, want).
    pub pending_resume: Option<(usize, u8)>,
}

impl ExecState {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            stack: Vec::with_capacity(64),
            top: 0,
            frames: Vec::new(),
            open_upvalues: Vec::new(),
            pending_resume: None,
        }
    }
}

/// The global environment shared by every thread of one VM instance.
pub struct Globals {
    /// The `_G` table.
    pub table: TableRef,
    /// Tables created by `module`, by full dotted name.
    pub modules: TableRef,
    /// Prefixes registered by `import "pkg.*"`, tried on global misses.
    pub package_prefixes: Vec<String>,
    /// Methods for string values (`s:upper()`).
    pub string_lib: Option<TableRef>,
    pub loader: Option<Arc<dyn ResourceLoader>>,
    pub bridge: Option<Arc<dyn ForeignBridge>>,
    /// Observes native calls; may short-circuit them (sandboxing).
    pub interceptor: Option<Arc<dyn Interceptor>>,
}

impl Globals {
    fn new() -> Self {
        Self {
            table: Table::new_ref(),
            modules: Table::new_ref(),
            package_prefixes: Vec::new(),
            string_lib: None,
            loader: None,
            bridge: None,
            interceptor: None,
        }
    }

    pub fn get(&self, name: &str) -> Value {
        self.table.lock().raw_get(&Value::from(name))
    }

    pub fn set(&self, name: &str, value: Value) {
        // The globals table is never read-only.
        let _ = self.table.lock().raw_set(Value::from(name), value);
    }
}

/// A Luno virtual machine. Each instance is fully isolated: globals,
/// modules, and import prefixes are per-VM, never process-wide.
pub struct Vm {
    pub globals: Globals,
    /// The currently executing thread's state.
    pub exec: ExecState,
    /// Suspended outer states, innermost last (the resume chain).
    pub(crate) resume_chain: Vec<ExecState>,
    /// Coroutines owning the states above, parallel to `resume_chain`
    /// minus the main state.
    pub(crate) running_coroutines: Vec<Arc<coroutine::Coroutine>>,
    next_state_id: u64,
    /// Nested native/protected call depth, bounded together with frames.
    pub(crate) native_depth: usize,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    /// A VM with the standard library installed.
    pub fn new() -> Self {
        let mut vm = Self::bare();
        crate::stdlib::install(&mut vm);
        vm
    }

    /// A VM with an empty global table.
    pub fn bare() -> Self {
        Self {
            globals: Globals::new(),
            exec: ExecState::new(0),
            resume_chain: Vec::new(),
            running_coroutines: Vec::new(),
            next_state_id: 1,
            native_depth: 0,
        }
    }

    pub fn set_loader(&mut self, loader: Arc<dyn ResourceLoader>) {
        self.globals.loader = Some(loader);
    }

    pub fn set_bridge(&mut self, bridge: Arc<dyn ForeignBridge>) {
        self.globals.bridge = Some(bridge);
    }

    pub fn set_interceptor(&mut self, interceptor: Arc<dyn Interceptor>) {
        self.globals.interceptor = Some(interceptor);
    }

    pub(crate) fn fresh_state_id(&mut self) -> u64 {
        let id = self.next_state_id;
        self.next_state_id += 1;
        id
    }

    /// Run a compiled chunk to completion on the main thread.
    pub fn execute(&mut self, proto: Arc<Prototype>, args: &[Value]) -> LunoResult<Vec<Value>> {
        let source = proto.source.clone();
        let closure = Arc::new(Closure::new(proto, Vec::new()));
        match self.call_value(Value::Closure(closure), args.to_vec()) {
            Ok(values) => Ok(values),
            Err(Fault::Raise(raised)) => Err(self.fault_to_error(&source, raised)),
            Err(Fault::Yield(_)) => Err(LunoError::new(
                ErrorKind::RuntimeError,
                "attempt to yield from outside a coroutine",
                Span::default(),
                source.to_string(),
            )),
        }
    }

    /// Compile and run a source string.
    pub fn run_source(&mut self, source: &str, chunk_name: &str) -> LunoResult<Vec<Value>> {
        let proto = crate::compiler::Parser::compile(source, chunk_name)?;
        self.execute(proto, &[]).map_err(|e| e.with_source(source))
    }

    fn fault_to_error(&self, source: &str, raised: value::Raised) -> LunoError {
        let message = raised.value.display();
        let line = raised.trace.first().map(|f| f.line).unwrap_or(0);
        LunoError::new(
            ErrorKind::RuntimeError,
            message,
            Span::line(line.max(1)),
            source.to_string(),
        )
        .with_stack_trace(raised.trace)
    }

    /// Helper for building a table value.
    pub fn new_table(&self) -> Value {
        Value::Table(Arc::new(Mutex::new(Table::new())))
    }

    /// The trace of the current call stack, innermost first.
    pub fn stack_trace(&self) -> Vec<StackFrame> {
        self.exec
            .frames
            .iter()
            .rev()
            .map(|f| {
                let proto = &f.closure.proto;
                let pc = f.pc.saturating_sub(1);
                StackFrame::new(
                    proto.name.clone(),
                    proto.source.to_string(),
                    proto.line_at(pc) as usize,
                )
            })
            .collect()
    }
}
