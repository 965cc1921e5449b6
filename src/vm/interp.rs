// Luno Interpreter
// The register-machine dispatch loop and its runtime semantics

use crate::compiler::opcode::{rk_index, rk_is_const, ArithOp, CmpOp, Instr, UnOp, NO_REG, RK};
use crate::compiler::proto::Prototype;
use crate::error::StackFrame;
use crate::vm::closure::{Closure, Upvalue};
use crate::vm::coroutine::{CoStatus, Coroutine};
use crate::vm::list::List;
use crate::vm::table::Table;
use crate::vm::value::{
    floor_div_i64, floor_mod_i64, shift_left, Fault, LunoStr, Number, Value,
};
use crate::vm::{ExecState, Frame, Protect, TryOutcome, TryStage, TryState, Vm, MAX_CALL_DEPTH};
use parking_lot::Mutex;
use std::sync::Arc;

/// Nested native/protected call depth bound.
const MAX_NATIVE_DEPTH: usize = 120;

/// Cap on `__index`/`__newindex` chain walks.
const MAX_META_CHAIN: usize = 100;

impl Vm {
    // ---- public call surface -------------------------------------------

    /// Call any callable value with `args`, running nested bytecode to
    /// completion. Yields cannot cross this boundary.
    pub fn call_value(&mut self, callee: Value, args: Vec<Value>) -> Result<Vec<Value>, Fault> {
        if self.native_depth >= MAX_NATIVE_DEPTH {
            return Err(Fault::raise_str("stack overflow (nested calls too deep)"));
        }
        self.native_depth += 1;
        let result = self.call_value_inner(callee, args);
        self.native_depth -= 1;
        match result {
            Err(Fault::Yield(_)) => {
                // The yield site recorded a resume slot that nothing
                // will ever resume.
                self.exec.pending_resume = None;
                Err(Fault::raise_str(
                    "attempt to yield across a native call boundary",
                ))
            }
            other => other,
        }
    }

    fn call_value_inner(&mut self, callee: Value, args: Vec<Value>) -> Result<Vec<Value>, Fault> {
        match callee {
            Value::Closure(closure) => self.call_closure_root(closure, &args),
            Value::Native(native) => {
                if let Some(results) = self.intercept(&native.name, &args) {
                    return Ok(results);
                }
                (native.call)(self, &args)
            }
            other => {
                // __call receives the original value first.
                match self.get_metamethod(&other, "__call") {
                    Some(handler) => {
                        let mut full = Vec::with_capacity(args.len() + 1);
                        full.push(other);
                        full.extend(args);
                        self.call_value_inner(handler, full)
                    }
                    None => Err(self.rt(format!(
                        "attempt to call a {} value",
                        other.type_name()
                    ))),
                }
            }
        }
    }

    /// Push a root frame for `closure` on the current state and run it
    /// to completion. Yields propagate to the caller.
    pub(crate) fn call_closure_root(
        &mut self,
        closure: Arc<Closure>,
        args: &[Value],
    ) -> Result<Vec<Value>, Fault> {
        let func_slot = self.exec.stack.len();
        self.exec.stack.push(Value::Nil);
        self.exec.stack.extend_from_slice(args);
        let entry = self.exec.frames.len();
        self.setup_frame(closure, func_slot, args.len(), 0)?;
        let result = self.run_to_depth(entry);
        if result.is_ok() {
            self.exec.stack.truncate(func_slot);
        }
        result
    }

    /// Run `closure` under a protected frame on the current thread. The
    /// returned values follow the `pcall` convention: `true` plus the
    /// results, or `false` plus the error value. A yield suspends the
    /// protected frame like any other, and a later resume continues it.
    pub fn protected_call(
        &mut self,
        closure: Arc<Closure>,
        args: &[Value],
    ) -> Result<Vec<Value>, Fault> {
        if self.native_depth >= MAX_NATIVE_DEPTH {
            return Err(Fault::raise_str("stack overflow (nested calls too deep)"));
        }
        let func_slot = self.exec.stack.len();
        self.exec.stack.push(Value::Nil);
        self.exec.stack.extend_from_slice(args);
        let entry = self.exec.frames.len();
        if let Err(fault) = self.setup_frame(closure, func_slot, args.len(), 0) {
            self.exec.stack.truncate(func_slot);
            return Err(fault);
        }
        self.exec.frames.last_mut().unwrap().protect = Protect::Catch;
        self.native_depth += 1;
        let result = self.run_to_depth(entry);
        self.native_depth -= 1;
        if result.is_ok() {
            self.exec.stack.truncate(func_slot);
        }
        result
    }

    // ---- frame management ----------------------------------------------

    /// Install a frame for `closure`. The callee at absolute `func_slot`
    /// with `nargs` arguments following it; results will land back at
    /// `func_slot`, `want`-limited.
    fn setup_frame(
        &mut self,
        closure: Arc<Closure>,
        func_slot: usize,
        nargs: usize,
        want: u8,
    ) -> Result<(), Fault> {
        if self.exec.frames.len() >= MAX_CALL_DEPTH {
            return Err(Fault::raise_str("stack overflow"));
        }
        let proto = closure.proto.clone();
        let base = func_slot + 1;
        let params = proto.param_count as usize;

        let mut varargs = Vec::new();
        if nargs > params {
            if proto.is_vararg {
                varargs = self.exec.stack[base + params..base + nargs].to_vec();
            }
            self.exec.stack.truncate(base + params);
        }
        self.exec
            .stack
            .resize(base + proto.max_stack as usize, Value::Nil);
        self.exec.top = base + proto.max_stack as usize;

        self.exec.frames.push(Frame {
            closure,
            pc: 0,
            base,
            varargs,
            deferred: Vec::new(),
            ret_base: func_slot,
            want,
            protect: Protect::None,
        });
        Ok(())
    }

    /// Pop the top frame, running its deferred closures and placing
    /// `results` in the caller. Returns `Some(results)` once the frame
    /// depth falls back to `entry`.
    fn do_return(
        &mut self,
        results: Vec<Value>,
        entry: usize,
    ) -> Result<Option<Vec<Value>>, Fault> {
        let deferred = {
            let frame = self.exec.frames.last_mut().unwrap();
            std::mem::take(&mut frame.deferred)
        };
        self.run_deferred(deferred, None)?;

        let frame = self.exec.frames.pop().unwrap();
        self.close_upvalues(frame.base);
        self.exec.stack.truncate(frame.ret_base);

        match frame.protect {
            Protect::None => {}
            Protect::Catch => {
                let mut results = results;
                results.insert(0, Value::Boolean(true));
                if self.exec.frames.len() == entry {
                    return Ok(Some(results));
                }
                self.place_call_results(frame.ret_base, frame.want, results);
                return Ok(None);
            }
            Protect::Try(state) => {
                return self.finish_try_stage(*state, Ok(results), entry);
            }
        }

        if self.exec.frames.len() == entry {
            return Ok(Some(results));
        }

        if frame.want == 0 {
            self.exec.stack.extend(results.iter().cloned());
            self.exec.top = frame.ret_base + results.len();
        } else {
            let n = frame.want as usize - 1;
            for i in 0..n {
                self.exec
                    .stack
                    .push(results.get(i).cloned().unwrap_or(Value::Nil));
            }
            self.exec.top = frame.ret_base + n;
        }
        // Registers above the results must stay valid for the caller.
        let caller = self.exec.frames.last().unwrap();
        let window = caller.base + caller.closure.proto.max_stack as usize;
        if self.exec.stack.len() < window {
            self.exec.stack.resize(window, Value::Nil);
        }
        Ok(None)
    }

    /// Run deferred closures LIFO. Each receives the in-flight error, or
    /// nil on a clean return. An error raised by a deferred closure
    /// replaces the in-flight one.
    fn run_deferred(&mut self, mut deferred: Vec<Value>, error: Option<&Value>) -> Result<(), Fault> {
        let mut pending: Option<Fault> = None;
        while let Some(f) = deferred.pop() {
            let arg = match (&pending, error) {
                (Some(Fault::Raise(r)), _) => r.value.clone(),
                (_, Some(e)) => e.clone(),
                _ => Value::Nil,
            };
            if let Err(fault) = self.call_value(f, vec![arg]) {
                pending = Some(fault);
            }
        }
        match pending {
            Some(fault) => Err(fault),
            None => Ok(()),
        }
    }

    /// Unwind frames above `entry` after a raise: run defers with the
    /// error value, close upvalues, record the trace. A protected frame
    /// absorbs the fault and execution continues from it; otherwise the
    /// fault escapes once the depth falls back to `entry`.
    fn unwind_to(
        &mut self,
        entry: usize,
        fault: Fault,
    ) -> Result<Option<Vec<Value>>, Fault> {
        let mut fault = fault;
        while self.exec.frames.len() > entry {
            if let Fault::Raise(raised) = &mut fault {
                let frame = self.exec.frames.last().unwrap();
                let proto = &frame.closure.proto;
                let pc = frame.pc.saturating_sub(1);
                raised.trace.push(StackFrame::new(
                    proto.name.clone(),
                    proto.source.to_string(),
                    proto.line_at(pc) as usize,
                ));
            }
            let deferred = {
                let frame = self.exec.frames.last_mut().unwrap();
                std::mem::take(&mut frame.deferred)
            };
            let error_value = match &fault {
                Fault::Raise(r) => Some(r.value.clone()),
                Fault::Yield(_) => None,
            };
            if let Err(replacement) =
                self.run_deferred(deferred, error_value.as_ref())
            {
                fault = replacement;
            }
            let frame = self.exec.frames.pop().unwrap();
            self.close_upvalues(frame.base);
            self.exec.stack.truncate(frame.ret_base);
            match frame.protect {
                Protect::None => {}
                Protect::Catch => {
                    let raised = match fault {
                        Fault::Raise(raised) => raised,
                        other => return Err(other),
                    };
                    let results = vec![Value::Boolean(false), raised.value];
                    if self.exec.frames.len() == entry {
                        return Ok(Some(results));
                    }
                    self.place_call_results(frame.ret_base, frame.want, results);
                    return Ok(None);
                }
                Protect::Try(state) => {
                    return self.finish_try_stage(*state, Err(fault), entry);
                }
            }
        }
        Err(fault)
    }

    // ---- the dispatch loop ---------------------------------------------

    /// Execute until the frame count returns to `entry`; the returning
    /// frame's results are the value of the run.
    fn run_to_depth(&mut self, entry: usize) -> Result<Vec<Value>, Fault> {
        loop {
            match self.step(entry) {
                Ok(Some(results)) => return Ok(results),
                Ok(None) => {}
                Err(Fault::Yield(vals)) => return Err(Fault::Yield(vals)),
                Err(fault) => match self.unwind_to(entry, fault)? {
                    Some(results) => return Ok(results),
                    None => {}
                },
            }
        }
    }

    fn step(&mut self, entry: usize) -> Result<Option<Vec<Value>>, Fault> {
        let (instr, base, proto) = {
            let frame = self.exec.frames.last_mut().unwrap();
            let proto = frame.closure.proto.clone();
            let instr = proto.code[frame.pc];
            frame.pc += 1;
            (instr, frame.base, proto)
        };

        match instr {
            Instr::Move { dst, src } => {
                self.exec.stack[base + dst as usize] = self.exec.stack[base + src as usize].clone();
            }
            Instr::LoadK { dst, k } => {
                self.exec.stack[base + dst as usize] =
                    Value::from_constant(&proto.constants[k as usize]);
            }
            Instr::LoadNil { dst, count } => {
                for i in 0..count as usize {
                    self.exec.stack[base + dst as usize + i] = Value::Nil;
                }
            }
            Instr::LoadBool { dst, value, skip } => {
                self.exec.stack[base + dst as usize] = Value::Boolean(value);
                if skip {
                    self.exec.frames.last_mut().unwrap().pc += 1;
                }
            }
            Instr::LoadEnv { dst } => {
                self.exec.stack[base + dst as usize] = Value::Table(self.globals.table.clone());
            }
            Instr::GetGlobal { dst, k } => {
                let name = self.constant_str(&proto, k);
                let value = self.global_lookup(name.as_str())?;
                self.exec.stack[base + dst as usize] = value;
            }
            Instr::SetGlobal { src, k } => {
                let name = self.constant_str(&proto, k);
                let value = self.exec.stack[base + src as usize].clone();
                self.globals.set(name.as_str(), value);
            }
            Instr::GetUpval { dst, idx } => {
                let cell = self.exec.frames.last().unwrap().closure.upvalues[idx as usize].clone();
                self.exec.stack[base + dst as usize] = self.read_upvalue(&cell)?;
            }
            Instr::SetUpval { src, idx } => {
                let cell = self.exec.frames.last().unwrap().closure.upvalues[idx as usize].clone();
                let value = self.exec.stack[base + src as usize].clone();
                self.write_upvalue(&cell, value)?;
            }
            Instr::NewTable { dst, hint } => {
                self.exec.stack[base + dst as usize] = Value::Table(Arc::new(Mutex::new(
                    Table::with_capacity(hint as usize, 0),
                )));
            }
            Instr::NewList { dst, hint } => {
                self.exec.stack[base + dst as usize] =
                    Value::List(Arc::new(Mutex::new(List::with_capacity(hint as usize))));
            }
            Instr::GetIndex { dst, obj, key } => {
                let object = self.exec.stack[base + obj as usize].clone();
                let key = self.rk(&proto, base, key);
                let value = self.index_value(&object, &key)?;
                self.exec.stack[base + dst as usize] = value;
            }
            Instr::SetIndex { obj, key, val } => {
                let object = self.exec.stack[base + obj as usize].clone();
                let key = self.rk(&proto, base, key);
                let value = self.rk(&proto, base, val);
                self.set_index_value(&object, key, value)?;
            }
            Instr::SetList { table, start, count } => {
                let table_abs = base + table as usize;
                let n = if count == 0 {
                    self.exec.top - (table_abs + 1)
                } else {
                    count as usize
                };
                let target = self.exec.stack[table_abs].clone();
                for i in 0..n {
                    let value = self.exec.stack[table_abs + 1 + i].clone();
                    let key = Value::Integer(start as i64 + i as i64);
                    self.set_index_raw(&target, key, value)?;
                }
            }
            Instr::SelfGet { dst, obj, key } => {
                let object = self.exec.stack[base + obj as usize].clone();
                let key = self.rk(&proto, base, key);
                let method = self.index_value(&object, &key)?;
                self.exec.stack[base + dst as usize + 1] = object;
                self.exec.stack[base + dst as usize] = method;
            }
            Instr::Arith { op, dst, lhs, rhs } => {
                let a = self.rk(&proto, base, lhs);
                let b = self.rk(&proto, base, rhs);
                let value = self.arith(op, &a, &b)?;
                self.exec.stack[base + dst as usize] = value;
            }
            Instr::Unary { op, dst, src } => {
                let operand = self.exec.stack[base + src as usize].clone();
                let value = self.unary(op, &operand)?;
                self.exec.stack[base + dst as usize] = value;
            }
            Instr::Concat { dst, start, end } => {
                let value = self.concat_range(base + start as usize, base + end as usize)?;
                self.exec.stack[base + dst as usize] = value;
            }
            Instr::Cmp { op, expect, lhs, rhs } => {
                let a = self.rk(&proto, base, lhs);
                let b = self.rk(&proto, base, rhs);
                let outcome = match op {
                    CmpOp::Eq => self.values_equal(&a, &b)?,
                    CmpOp::Lt => self.less_than(&a, &b, false)?,
                    CmpOp::Le => self.less_than(&a, &b, true)?,
                };
                if outcome != expect {
                    self.exec.frames.last_mut().unwrap().pc += 1;
                }
            }
            Instr::Test { src, expect } => {
                if self.exec.stack[base + src as usize].is_truthy() != expect {
                    self.exec.frames.last_mut().unwrap().pc += 1;
                }
            }
            Instr::TestSet { dst, src, expect } => {
                let value = self.exec.stack[base + src as usize].clone();
                if value.is_truthy() == expect {
                    debug_assert_ne!(dst, NO_REG);
                    self.exec.stack[base + dst as usize] = value;
                } else {
                    self.exec.frames.last_mut().unwrap().pc += 1;
                }
            }
            Instr::Jump { offset } => {
                self.adjust_pc(offset);
            }
            Instr::ForPrep { base: a, offset } => {
                self.for_prep(base + a as usize)?;
                self.adjust_pc(offset);
            }
            Instr::ForLoop { base: a, offset } => {
                if self.for_loop(base + a as usize)? {
                    self.adjust_pc(offset);
                }
            }
            Instr::TForCall { base: a, nresults } => {
                let slot = base + a as usize;
                // Copy iterator, state, control above the loop variables
                // so the call cannot clobber them.
                self.exec.stack[slot + 3] = self.exec.stack[slot].clone();
                self.exec.stack[slot + 4] = self.exec.stack[slot + 1].clone();
                self.exec.stack[slot + 5] = self.exec.stack[slot + 2].clone();
                self.exec.top = slot + 6;
                self.begin_call(slot + 3, 3, nresults + 1)?;
            }
            Instr::TForLoop { base: a, offset } => {
                let slot = base + a as usize;
                if !self.exec.stack[slot + 3].is_nil() {
                    self.exec.stack[slot + 2] = self.exec.stack[slot + 3].clone();
                    self.adjust_pc(offset);
                }
            }
            Instr::Call { base: a, nargs, nresults } => {
                let func_slot = base + a as usize;
                self.begin_call(func_slot, nargs, nresults)?;
            }
            Instr::Return { base: a, count } => {
                let from = base + a as usize;
                let n = if count == 0 {
                    self.exec.top.saturating_sub(from)
                } else {
                    count as usize - 1
                };
                let results = self.exec.stack[from..from + n].to_vec();
                if let Some(final_results) = self.do_return(results, entry)? {
                    return Ok(Some(final_results));
                }
            }
            Instr::Vararg { dst, count } => {
                let frame = self.exec.frames.last().unwrap();
                let varargs = frame.varargs.clone();
                let dst_abs = base + dst as usize;
                if count == 0 {
                    self.exec.stack.truncate(dst_abs);
                    self.exec.stack.extend(varargs.iter().cloned());
                    self.exec.top = dst_abs + varargs.len();
                    let window = base + proto.max_stack as usize;
                    if self.exec.stack.len() < window {
                        self.exec.stack.resize(window, Value::Nil);
                    }
                } else {
                    for i in 0..count as usize - 1 {
                        self.exec.stack[dst_abs + i] =
                            varargs.get(i).cloned().unwrap_or(Value::Nil);
                    }
                }
            }
            Instr::Closure { dst, proto: pidx } => {
                let inner = proto.protos[pidx as usize].clone();
                let closure = self.make_closure(inner, base)?;
                self.exec.stack[base + dst as usize] = Value::Closure(closure);
            }
            Instr::CloseUpvals { from } => {
                self.close_upvalues(base + from as usize);
            }
            Instr::Import { dst, k } => {
                let name = self.constant_str(&proto, k);
                let value = self.import_class(name.as_str())?;
                self.exec.stack[base + dst as usize] = value;
            }
            Instr::ImportPkg { k } => {
                let prefix = self.constant_str(&proto, k);
                let prefix = prefix.as_str().trim_end_matches('*').to_string();
                if !self.globals.package_prefixes.contains(&prefix) {
                    self.globals.package_prefixes.push(prefix);
                }
            }
            Instr::Module { dst, k } => {
                let name = self.constant_str(&proto, k);
                let module = self.module_table(name.as_str());
                self.exec.stack[base + dst as usize] = module;
            }
            Instr::Defer { src } => {
                let value = self.exec.stack[base + src as usize].clone();
                if !matches!(value, Value::Closure(_) | Value::Native(_)) {
                    return Err(self.rt(format!(
                        "defer expects a function, got {}",
                        value.type_name()
                    )));
                }
                self.exec.frames.last_mut().unwrap().deferred.push(value);
            }
            Instr::TryCall { try_reg, catch_reg, fin_reg } => {
                let try_fn = self.exec.stack[base + try_reg as usize].clone();
                let catch = (catch_reg != NO_REG)
                    .then(|| self.exec.stack[base + catch_reg as usize].clone());
                let finally = (fin_reg != NO_REG)
                    .then(|| self.exec.stack[base + fin_reg as usize].clone());
                let state = TryState {
                    stage: TryStage::Body,
                    catch,
                    finally,
                    outcome: TryOutcome::Continue,
                };
                self.push_protected_frame(try_fn, &[], Protect::Try(Box::new(state)))?;
            }
        }
        Ok(None)
    }

    fn adjust_pc(&mut self, offset: i32) {
        let frame = self.exec.frames.last_mut().unwrap();
        frame.pc = (frame.pc as i64 + offset as i64) as usize;
    }

    // ---- calls -----------------------------------------------------------

    /// Begin a call at `func_slot`: bytecode callees push a frame for
    /// the main loop; natives run immediately.
    fn begin_call(&mut self, func_slot: usize, nargs: u8, want: u8) -> Result<(), Fault> {
        let nargs = if nargs == 0 {
            self.exec.top - (func_slot + 1)
        } else {
            nargs as usize - 1
        };
        let callee = self.exec.stack[func_slot].clone();
        match callee {
            Value::Closure(closure) => self.setup_frame(closure, func_slot, nargs, want),
            Value::Native(native) => {
                let args = self.exec.stack[func_slot + 1..func_slot + 1 + nargs].to_vec();
                self.exec.stack.truncate(func_slot);
                if let Some(results) = self.intercept(&native.name, &args) {
                    self.place_call_results(func_slot, want, results);
                    return Ok(());
                }
                match (native.call)(self, &args) {
                    Ok(results) => {
                        self.place_call_results(func_slot, want, results);
                        Ok(())
                    }
                    Err(Fault::Yield(vals)) => {
                        // Only the innermost yield records its resume
                        // slot; a yield passing outward through pcall
                        // must keep it.
                        if self.exec.pending_resume.is_none() {
                            self.exec.pending_resume = Some((func_slot, want));
                        }
                        Err(Fault::Yield(vals))
                    }
                    Err(other) => Err(other),
                }
            }
            other => match self.get_metamethod(&other, "__call") {
                Some(handler) => {
                    // Shift arguments up to make room for the receiver.
                    self.exec.stack.insert(func_slot + 1, other);
                    self.exec.stack[func_slot] = handler;
                    self.exec.top += 1;
                    self.begin_call(func_slot, (nargs + 2) as u8, want)
                }
                None => Err(self.rt(format!(
                    "attempt to call a {} value",
                    other.type_name()
                ))),
            },
        }
    }

    /// Place native-call (or resume) results at `slot` per `want`.
    pub(crate) fn place_call_results(&mut self, slot: usize, want: u8, results: Vec<Value>) {
        self.exec.stack.truncate(slot);
        if want == 0 {
            self.exec.stack.extend(results.iter().cloned());
            self.exec.top = slot + results.len();
        } else {
            let n = want as usize - 1;
            for i in 0..n {
                self.exec
                    .stack
                    .push(results.get(i).cloned().unwrap_or(Value::Nil));
            }
            self.exec.top = slot + n;
        }
        if let Some(frame) = self.exec.frames.last() {
            let window = frame.base + frame.closure.proto.max_stack as usize;
            if self.exec.stack.len() < window {
                self.exec.stack.resize(window, Value::Nil);
            }
        }
    }

    /// Push the frame for a protected body (a `try` stage or a `pcall`
    /// target reached through the bytecode machinery).
    fn push_protected_frame(
        &mut self,
        callee: Value,
        args: &[Value],
        protect: Protect,
    ) -> Result<(), Fault> {
        let closure = match callee {
            Value::Closure(c) => c,
            other => {
                return Err(self.rt(format!(
                    "attempt to call a {} value",
                    other.type_name()
                )))
            }
        };
        let func_slot = self.exec.stack.len();
        self.exec.stack.push(Value::Nil);
        self.exec.stack.extend_from_slice(args);
        if let Err(fault) = self.setup_frame(closure, func_slot, args.len(), 0) {
            self.exec.stack.truncate(func_slot);
            return Err(fault);
        }
        self.exec.frames.last_mut().unwrap().protect = protect;
        Ok(())
    }

    /// Advance a `try` statement when one of its stage frames exits,
    /// normally (`Ok`) or by fault. Either pushes the next stage frame
    /// or applies the final outcome to the enclosing function.
    fn finish_try_stage(
        &mut self,
        state: TryState,
        exit: Result<Vec<Value>, Fault>,
        entry: usize,
    ) -> Result<Option<Vec<Value>>, Fault> {
        let TryState {
            stage,
            catch,
            finally,
            outcome,
        } = state;
        match stage {
            TryStage::Body | TryStage::Catch => {
                let outcome = match exit {
                    Ok(results) => flag_outcome(results),
                    Err(Fault::Raise(raised)) => {
                        if stage == TryStage::Body {
                            if let Some(handler) = catch {
                                let arg = raised.value;
                                let next = TryState {
                                    stage: TryStage::Catch,
                                    catch: None,
                                    finally,
                                    outcome: TryOutcome::Continue,
                                };
                                return self.enter_try_stage(handler, vec![arg], next, entry);
                            }
                        }
                        TryOutcome::Rethrow(raised)
                    }
                    Err(other) => return Err(other),
                };
                match finally {
                    Some(handler) => {
                        let next = TryState {
                            stage: TryStage::Finally,
                            catch: None,
                            finally: None,
                            outcome,
                        };
                        self.enter_try_stage(handler, Vec::new(), next, entry)
                    }
                    None => self.apply_try_outcome(outcome, entry),
                }
            }
            TryStage::Finally => {
                let outcome = match exit {
                    // An explicit return in `finally` wins over both the
                    // try result and a pending error.
                    Ok(results) if results.first().map(Value::is_truthy).unwrap_or(false) => {
                        TryOutcome::Return(results[1..].to_vec())
                    }
                    Ok(_) => outcome,
                    Err(Fault::Raise(raised)) => TryOutcome::Rethrow(raised),
                    Err(other) => return Err(other),
                };
                self.apply_try_outcome(outcome, entry)
            }
        }
    }

    /// Push a stage frame; a push failure (stack overflow, handler not
    /// a function) feeds straight back into the unwinder.
    fn enter_try_stage(
        &mut self,
        handler: Value,
        args: Vec<Value>,
        state: TryState,
        entry: usize,
    ) -> Result<Option<Vec<Value>>, Fault> {
        match self.push_protected_frame(handler, &args, Protect::Try(Box::new(state))) {
            Ok(()) => Ok(None),
            Err(fault) => self.unwind_to(entry, fault),
        }
    }

    /// Apply a finished `try` statement to the enclosing frame: fall
    /// through, return from the function, or rethrow.
    fn apply_try_outcome(
        &mut self,
        outcome: TryOutcome,
        entry: usize,
    ) -> Result<Option<Vec<Value>>, Fault> {
        match outcome {
            TryOutcome::Continue => Ok(None),
            TryOutcome::Return(mut values) => {
                // Returning out of a nested `try` pops the outer stage
                // frame; re-flag the results so that stage propagates
                // the return as well.
                if matches!(
                    self.exec.frames.last().map(|f| &f.protect),
                    Some(Protect::Try(_))
                ) {
                    values.insert(0, Value::Boolean(true));
                }
                self.do_return(values, entry)
            }
            TryOutcome::Rethrow(raised) => self.unwind_to(entry, Fault::Raise(raised)),
        }
    }

    // ---- upvalues --------------------------------------------------------

    fn make_closure(&mut self, proto: Arc<Prototype>, base: usize) -> Result<Arc<Closure>, Fault> {
        let descs = proto.upvalues.clone();
        let mut upvalues = Vec::with_capacity(descs.len());
        for desc in &descs {
            if desc.in_stack {
                upvalues.push(self.find_upvalue(base + desc.index as usize));
            } else {
                let parent = self.exec.frames.last().unwrap();
                upvalues.push(parent.closure.upvalues[desc.index as usize].clone());
            }
        }
        Ok(Arc::new(Closure::new(proto, upvalues)))
    }

    /// The open upvalue for absolute `slot`, shared if already open.
    fn find_upvalue(&mut self, slot: usize) -> Upvalue {
        match self
            .exec
            .open_upvalues
            .binary_search_by_key(&slot, |(s, _)| *s)
        {
            Ok(i) => self.exec.open_upvalues[i].1.clone(),
            Err(i) => {
                let up = Upvalue::open(self.exec.id, slot);
                self.exec.open_upvalues.insert(i, (slot, up.clone()));
                up
            }
        }
    }

    /// Close every open upvalue at `from` or above.
    fn close_upvalues(&mut self, from: usize) {
        while let Some((slot, _)) = self.exec.open_upvalues.last() {
            if *slot < from {
                break;
            }
            let (slot, up) = self.exec.open_upvalues.pop().unwrap();
            up.close(self.exec.stack[slot].clone());
        }
    }

    fn read_upvalue(&self, cell: &Upvalue) -> Result<Value, Fault> {
        if let Some(v) = cell.get_closed() {
            return Ok(v);
        }
        match cell.open_slot() {
            Some((owner, slot)) if owner == self.exec.id => Ok(self.exec.stack[slot].clone()),
            Some((owner, slot)) => {
                // A coroutine reads a still-open local of a state in
                // its resume chain (the main chunk, or an outer
                // coroutine awaiting this one).
                match self.resume_chain.iter().find(|s| s.id == owner) {
                    Some(state) => Ok(state.stack[slot].clone()),
                    None => Err(Fault::raise_str(
                        "attempt to access an upvalue of a suspended thread",
                    )),
                }
            }
            None => Ok(cell.get_closed().unwrap_or(Value::Nil)),
        }
    }

    fn write_upvalue(&mut self, cell: &Upvalue, value: Value) -> Result<(), Fault> {
        if cell.set_closed(value.clone()) {
            return Ok(());
        }
        match cell.open_slot() {
            Some((owner, slot)) if owner == self.exec.id => {
                self.exec.stack[slot] = value;
                Ok(())
            }
            Some((owner, slot)) => {
                match self.resume_chain.iter_mut().find(|s| s.id == owner) {
                    Some(state) => {
                        state.stack[slot] = value;
                        Ok(())
                    }
                    None => Err(Fault::raise_str(
                        "attempt to access an upvalue of a suspended thread",
                    )),
                }
            }
            None => {
                cell.set_closed(value);
                Ok(())
            }
        }
    }

    // ---- indexing --------------------------------------------------------

    pub fn index_value(&mut self, object: &Value, key: &Value) -> Result<Value, Fault> {
        let mut current = object.clone();
        for _ in 0..MAX_META_CHAIN {
            match &current {
                Value::Table(t) => {
                    let (raw, meta) = {
                        let table = t.lock();
                        (table.raw_get(key), table.metatable())
                    };
                    if !raw.is_nil() {
                        return Ok(raw);
                    }
                    let handler = meta
                        .map(|mt| mt.lock().raw_get(&Value::from("__index")))
                        .unwrap_or(Value::Nil);
                    match handler {
                        Value::Nil => return Ok(Value::Nil),
                        Value::Closure(_) | Value::Native(_) => {
                            let results =
                                self.call_value(handler, vec![current.clone(), key.clone()])?;
                            return Ok(results.into_iter().next().unwrap_or(Value::Nil));
                        }
                        next => current = next,
                    }
                }
                Value::List(l) => {
                    return match key.as_integer() {
                        Some(i) => Ok(l.lock().get(i)),
                        None => Err(self.rt(format!(
                            "attempt to index a list with a {} key",
                            key.type_name()
                        ))),
                    };
                }
                Value::Str(_) => {
                    let lib = self.globals.string_lib.clone();
                    return Ok(lib
                        .map(|t| t.lock().raw_get(key))
                        .unwrap_or(Value::Nil));
                }
                Value::Foreign(foreign) => {
                    let bridge = self
                        .globals
                        .bridge
                        .clone()
                        .ok_or_else(|| self.rt("no foreign bridge installed"))?;
                    return bridge
                        .get_member(foreign, key)
                        .map_err(|e| self.rt(e));
                }
                other => {
                    // Non-table values may still carry __index via their
                    // metatable in the future; today they cannot.
                    return Err(self.rt(format!(
                        "attempt to index a {} value",
                        other.type_name()
                    )));
                }
            }
        }
        Err(self.rt("'__index' chain too long; possible loop"))
    }

    pub fn set_index_value(&mut self, object: &Value, key: Value, value: Value) -> Result<(), Fault> {
        let mut current = object.clone();
        for _ in 0..MAX_META_CHAIN {
            match &current {
                Value::Table(t) => {
                    let (present, meta, readonly) = {
                        let table = t.lock();
                        (
                            !table.raw_get(&key).is_nil(),
                            table.metatable(),
                            table.is_readonly(),
                        )
                    };
                    let handler = if present || readonly {
                        Value::Nil
                    } else {
                        meta.map(|mt| mt.lock().raw_get(&Value::from("__newindex")))
                            .unwrap_or(Value::Nil)
                    };
                    match handler {
                        Value::Nil => {
                            return t
                                .lock()
                                .raw_set(key, value)
                                .map_err(|e| self.rt(e));
                        }
                        Value::Closure(_) | Value::Native(_) => {
                            self.call_value(handler, vec![current.clone(), key, value])?;
                            return Ok(());
                        }
                        next => current = next,
                    }
                }
                Value::List(l) => {
                    return match key.as_integer() {
                        Some(i) => l.lock().set(i, value).map_err(|e| self.rt(e)),
                        None => Err(self.rt(format!(
                            "attempt to index a list with a {} key",
                            key.type_name()
                        ))),
                    };
                }
                Value::Foreign(foreign) => {
                    let bridge = self
                        .globals
                        .bridge
                        .clone()
                        .ok_or_else(|| self.rt("no foreign bridge installed"))?;
                    return bridge
                        .set_member(foreign, &key, &value)
                        .map_err(|e| self.rt(e));
                }
                other => {
                    return Err(self.rt(format!(
                        "attempt to index a {} value",
                        other.type_name()
                    )));
                }
            }
        }
        Err(self.rt("'__newindex' chain too long; possible loop"))
    }

    /// Raw assignment for constructor fills; no metamethods.
    fn set_index_raw(&mut self, object: &Value, key: Value, value: Value) -> Result<(), Fault> {
        match object {
            Value::Table(t) => t.lock().raw_set(key, value).map_err(|e| self.rt(e)),
            Value::List(l) => match key.as_integer() {
                Some(i) => l.lock().set(i, value).map_err(|e| self.rt(e)),
                None => Err(self.rt("list constructor index must be an integer")),
            },
            other => Err(self.rt(format!(
                "attempt to index a {} value",
                other.type_name()
            ))),
        }
    }

    // ---- operators -------------------------------------------------------

    pub fn arith(&mut self, op: ArithOp, a: &Value, b: &Value) -> Result<Value, Fault> {
        use ArithOp::*;
        if matches!(op, BAnd | BOr | BXor | Shl | Shr) {
            if let (Some(x), Some(y)) = (a.as_integer(), b.as_integer()) {
                return Ok(Value::Integer(match op {
                    BAnd => x & y,
                    BOr => x | y,
                    BXor => x ^ y,
                    Shl => shift_left(x, y),
                    Shr => shift_left(x, -y),
                    _ => unreachable!(),
                }));
            }
        } else if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
            return self.arith_numeric(op, x, y);
        }
        // One operand is not numeric: consult metamethods.
        let event = op.metamethod();
        let handler = self
            .get_metamethod(a, event)
            .or_else(|| self.get_metamethod(b, event));
        match handler {
            Some(h) => {
                let results = self.call_value(h, vec![a.clone(), b.clone()])?;
                Ok(results.into_iter().next().unwrap_or(Value::Nil))
            }
            None => {
                let bad = if a.as_number().is_none() { a } else { b };
                Err(self.rt(format!(
                    "attempt to perform arithmetic on a {} value",
                    bad.type_name()
                )))
            }
        }
    }

    fn arith_numeric(&self, op: ArithOp, a: Number, b: Number) -> Result<Value, Fault> {
        use ArithOp::*;
        if let (Number::Int(x), Number::Int(y)) = (a, b) {
            match op {
                // Overflow promotes to float rather than wrapping.
                Add => {
                    return Ok(x
                        .checked_add(y)
                        .map(Value::Integer)
                        .unwrap_or(Value::Float(x as f64 + y as f64)))
                }
                Sub => {
                    return Ok(x
                        .checked_sub(y)
                        .map(Value::Integer)
                        .unwrap_or(Value::Float(x as f64 - y as f64)))
                }
                Mul => {
                    return Ok(x
                        .checked_mul(y)
                        .map(Value::Integer)
                        .unwrap_or(Value::Float(x as f64 * y as f64)))
                }
                IDiv => {
                    if y == 0 {
                        return Err(self.rt("attempt to perform 'n//0'"));
                    }
                    return Ok(Value::Integer(floor_div_i64(x, y)));
                }
                Mod => {
                    if y == 0 {
                        return Err(self.rt("attempt to perform 'n%%0'"));
                    }
                    return Ok(Value::Integer(floor_mod_i64(x, y)));
                }
                _ => {}
            }
        }
        let (x, y) = (a.as_float(), b.as_float());
        Ok(Value::Float(match op {
            Add => x + y,
            Sub => x - y,
            Mul => x * y,
            Div => x / y,
            Pow => x.powf(y),
            IDiv => (x / y).floor(),
            Mod => x - (x / y).floor() * y,
            _ => unreachable!(),
        }))
    }

    fn unary(&mut self, op: UnOp, v: &Value) -> Result<Value, Fault> {
        match op {
            UnOp::Not => Ok(Value::Boolean(!v.is_truthy())),
            UnOp::Neg => match v.as_number() {
                Some(Number::Int(n)) => Ok(n
                    .checked_neg()
                    .map(Value::Integer)
                    .unwrap_or(Value::Float(-(n as f64)))),
                Some(Number::Float(f)) => Ok(Value::Float(-f)),
                None => match self.get_metamethod(v, "__unm") {
                    Some(h) => {
                        let results = self.call_value(h, vec![v.clone(), v.clone()])?;
                        Ok(results.into_iter().next().unwrap_or(Value::Nil))
                    }
                    None => Err(self.rt(format!(
                        "attempt to perform arithmetic on a {} value",
                        v.type_name()
                    ))),
                },
            },
            UnOp::BNot => match v.as_integer() {
                Some(n) => Ok(Value::Integer(!n)),
                None => Err(self.rt(format!(
                    "attempt to perform bitwise operation on a {} value",
                    v.type_name()
                ))),
            },
            UnOp::Len => self.length_of(v),
        }
    }

    pub fn length_of(&mut self, v: &Value) -> Result<Value, Fault> {
        match v {
            Value::Str(s) => Ok(Value::Integer(s.len() as i64)),
            Value::List(l) => Ok(Value::Integer(l.lock().len() as i64)),
            Value::Table(t) => {
                if let Some(h) = self.get_metamethod(v, "__len") {
                    let results = self.call_value(h, vec![v.clone()])?;
                    return Ok(results.into_iter().next().unwrap_or(Value::Nil));
                }
                Ok(Value::Integer(t.lock().length()))
            }
            other => Err(self.rt(format!(
                "attempt to get length of a {} value",
                other.type_name()
            ))),
        }
    }

    fn concat_range(&mut self, start: usize, end: usize) -> Result<Value, Fault> {
        let mut acc = self.exec.stack[end].clone();
        let mut i = end;
        while i > start {
            i -= 1;
            let lhs = self.exec.stack[i].clone();
            acc = self.concat_values(&lhs, &acc)?;
        }
        Ok(acc)
    }

    pub fn concat_values(&mut self, a: &Value, b: &Value) -> Result<Value, Fault> {
        let stringish = |v: &Value| {
            matches!(
                v,
                Value::Str(_) | Value::Integer(_) | Value::Float(_)
            )
        };
        if stringish(a) && stringish(b) {
            let mut s = a.display();
            s.push_str(&b.display());
            return Ok(Value::from(s));
        }
        let handler = self
            .get_metamethod(a, "__concat")
            .or_else(|| self.get_metamethod(b, "__concat"));
        match handler {
            Some(h) => {
                let results = self.call_value(h, vec![a.clone(), b.clone()])?;
                Ok(results.into_iter().next().unwrap_or(Value::Nil))
            }
            None => {
                let bad = if stringish(a) { b } else { a };
                Err(self.rt(format!(
                    "attempt to concatenate a {} value",
                    bad.type_name()
                )))
            }
        }
    }

    pub fn values_equal(&mut self, a: &Value, b: &Value) -> Result<bool, Fault> {
        if a.raw_eq(b) {
            return Ok(true);
        }
        // __eq only when both operands share a structured type.
        let same_kind = matches!(
            (a, b),
            (Value::Table(_), Value::Table(_)) | (Value::List(_), Value::List(_))
        );
        if !same_kind {
            return Ok(false);
        }
        let handler = self
            .get_metamethod(a, "__eq")
            .or_else(|| self.get_metamethod(b, "__eq"));
        match handler {
            Some(h) => {
                let results = self.call_value(h, vec![a.clone(), b.clone()])?;
                Ok(results.first().map(Value::is_truthy).unwrap_or(false))
            }
            None => Ok(false),
        }
    }

    pub fn less_than(&mut self, a: &Value, b: &Value, or_equal: bool) -> Result<bool, Fault> {
        match (a, b) {
            (Value::Integer(x), Value::Integer(y)) => {
                return Ok(if or_equal { x <= y } else { x < y })
            }
            (Value::Str(x), Value::Str(y)) => {
                return Ok(if or_equal {
                    x.as_str() <= y.as_str()
                } else {
                    x.as_str() < y.as_str()
                })
            }
            _ => {}
        }
        if let (Some(x), Some(y)) = (numeric_only(a), numeric_only(b)) {
            let (x, y) = (x.as_float(), y.as_float());
            return Ok(if or_equal { x <= y } else { x < y });
        }
        let event = if or_equal { "__le" } else { "__lt" };
        let handler = self
            .get_metamethod(a, event)
            .or_else(|| self.get_metamethod(b, event));
        match handler {
            Some(h) => {
                let results = self.call_value(h, vec![a.clone(), b.clone()])?;
                Ok(results.first().map(Value::is_truthy).unwrap_or(false))
            }
            None => Err(self.rt(format!(
                "attempt to compare {} with {}",
                a.type_name(),
                b.type_name()
            ))),
        }
    }

    // ---- numeric for -----------------------------------------------------

    fn for_prep(&mut self, slot: usize) -> Result<(), Fault> {
        let read = |v: &Value, what: &str| -> Result<Number, Fault> {
            v.as_number().ok_or_else(|| {
                Fault::raise_str(format!("'for' {} must be a number", what))
            })
        };
        let init = read(&self.exec.stack[slot], "initial value")?;
        let limit = read(&self.exec.stack[slot + 1], "limit")?;
        let step = read(&self.exec.stack[slot + 2], "step")?;
        match step {
            Number::Int(0) => return Err(self.rt("'for' step is zero")),
            Number::Float(f) if f == 0.0 => return Err(self.rt("'for' step is zero")),
            _ => {}
        }
        // Loops run in a single numeric representation.
        if let (Number::Int(i), Number::Int(_), Number::Int(s)) = (init, limit, step) {
            self.exec.stack[slot] = Value::Integer(i.wrapping_sub(s));
            self.exec.stack[slot + 1] = limit.to_value();
            self.exec.stack[slot + 2] = Value::Integer(s);
        } else {
            let (i, l, s) = (init.as_float(), limit.as_float(), step.as_float());
            self.exec.stack[slot] = Value::Float(i - s);
            self.exec.stack[slot + 1] = Value::Float(l);
            self.exec.stack[slot + 2] = Value::Float(s);
        }
        Ok(())
    }

    fn for_loop(&mut self, slot: usize) -> Result<bool, Fault> {
        match (
            self.exec.stack[slot].clone(),
            self.exec.stack[slot + 1].clone(),
            self.exec.stack[slot + 2].clone(),
        ) {
            (Value::Integer(i), limit, Value::Integer(step)) => {
                let next = match i.checked_add(step) {
                    Some(n) => n,
                    None => return Ok(false),
                };
                let limit = match limit.as_integer() {
                    Some(l) => l,
                    None => {
                        let lf = limit.as_number().map(Number::as_float).unwrap_or(f64::NAN);
                        if step > 0 {
                            lf.floor() as i64
                        } else {
                            lf.ceil() as i64
                        }
                    }
                };
                let cont = if step > 0 { next <= limit } else { next >= limit };
                if cont {
                    self.exec.stack[slot] = Value::Integer(next);
                    self.exec.stack[slot + 3] = Value::Integer(next);
                }
                Ok(cont)
            }
            (Value::Float(i), Value::Float(limit), Value::Float(step)) => {
                let next = i + step;
                let cont = if step > 0.0 { next <= limit } else { next >= limit };
                if cont {
                    self.exec.stack[slot] = Value::Float(next);
                    self.exec.stack[slot + 3] = Value::Float(next);
                }
                Ok(cont)
            }
            _ => Err(self.rt("'for' control variables corrupted")),
        }
    }

    // ---- globals, imports, modules --------------------------------------

    fn global_lookup(&mut self, name: &str) -> Result<Value, Fault> {
        let value = self.globals.get(name);
        if !value.is_nil() {
            return Ok(value);
        }
        // Miss: try registered import prefixes.
        if let Some(bridge) = self.globals.bridge.clone() {
            let prefixes = self.globals.package_prefixes.clone();
            for prefix in prefixes {
                let full = format!("{}{}", prefix, name);
                if let Some(resolved) = bridge.load_class(&full) {
                    self.globals.set(name, resolved.clone());
                    return Ok(resolved);
                }
            }
        }
        Ok(Value::Nil)
    }

    fn intercept(&self, name: &str, args: &[Value]) -> Option<Vec<Value>> {
        self.globals
            .interceptor
            .as_ref()
            .and_then(|i| i.before_call(name, args))
    }

    fn import_class(&mut self, name: &str) -> Result<Value, Fault> {
        if let Some(bridge) = self.globals.bridge.clone() {
            if let Some(value) = bridge.load_class(name) {
                return Ok(value);
            }
        }
        if let Some(value) = self.import_script(name)? {
            return Ok(value);
        }
        Err(self.rt(format!("import '{}' not found", name)))
    }

    /// Script-module fallback for `import`: `a.b.mod` loads `a/b/mod.luno`
    /// through the resource loader and runs it once per VM; the binding is
    /// the chunk's first return value, or its module table when the chunk
    /// returns nothing.
    fn import_script(&mut self, name: &str) -> Result<Option<Value>, Fault> {
        let loader = match self.globals.loader.clone() {
            Some(loader) => loader,
            None => return Ok(None),
        };
        let key = Value::from(name);
        let cached = self.globals.modules.lock().raw_get(&key);
        if !cached.is_nil() {
            return Ok(Some(cached));
        }
        let path = format!("{}.luno", name.replace('.', "/"));
        let bytes = match loader.load(&path) {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        let source = String::from_utf8_lossy(&bytes).into_owned();
        let proto = crate::compiler::Parser::compile(&source, &path)
            .map_err(|e| Fault::raise_str(e.message))?;
        let closure = Arc::new(Closure::new(proto, Vec::new()));
        let results = self.call_value(Value::Closure(closure), Vec::new())?;
        let value = match results.into_iter().next() {
            Some(v) if !v.is_nil() => v,
            _ => self.module_table(name),
        };
        let _ = self.globals.modules.lock().raw_set(key, value.clone());
        Ok(Some(value))
    }

    fn module_table(&mut self, name: &str) -> Value {
        let key = Value::from(name);
        let existing = self.globals.modules.lock().raw_get(&key);
        if !existing.is_nil() {
            return existing;
        }
        let module = Value::Table(Table::new_ref());
        let _ = self.globals.modules.lock().raw_set(key, module.clone());
        module
    }

    // ---- coroutines ------------------------------------------------------

    /// Resume a coroutine with `args`. `Ok` carries the yielded or
    /// returned values; `Err` carries the error value the body raised.
    pub fn resume_coroutine(
        &mut self,
        co: &Arc<Coroutine>,
        args: Vec<Value>,
    ) -> Result<Vec<Value>, Value> {
        match co.status() {
            CoStatus::Suspended => {}
            other => {
                return Err(Value::from(format!(
                    "cannot resume {} coroutine",
                    other.name()
                )))
            }
        }

        let started = co.has_started();
        let inner = if started {
            match co.take_exec() {
                Some(exec) => exec,
                None => return Err(Value::from("cannot resume a coroutine without state")),
            }
        } else {
            let id = self.fresh_state_id();
            ExecState::new(id)
        };

        if let Some(prev) = self.running_coroutines.last() {
            prev.set_status(CoStatus::Normal);
        }
        let outer = std::mem::replace(&mut self.exec, inner);
        self.resume_chain.push(outer);
        self.running_coroutines.push(co.clone());
        co.set_status(CoStatus::Running);

        let run = (|| -> Result<Vec<Value>, Fault> {
            if !started {
                co.mark_started();
                self.exec.stack.push(Value::Nil);
                self.exec.stack.extend(args.iter().cloned());
                self.setup_frame(co.body.clone(), 0, args.len(), 0)?;
            } else {
                let (slot, want) = self
                    .exec
                    .pending_resume
                    .take()
                    .unwrap_or((self.exec.stack.len(), 0));
                self.place_call_results(slot, want, args);
            }
            self.run_to_depth(0)
        })();

        let finished_state = std::mem::replace(
            &mut self.exec,
            self.resume_chain.pop().expect("resume chain underflow"),
        );
        self.running_coroutines.pop();
        if let Some(prev) = self.running_coroutines.last() {
            prev.set_status(CoStatus::Running);
        }

        match run {
            Ok(values) => {
                co.set_status(CoStatus::Dead);
                Ok(values)
            }
            Err(Fault::Yield(values)) => {
                co.park_exec(finished_state);
                co.set_status(CoStatus::Suspended);
                Ok(values)
            }
            Err(Fault::Raise(raised)) => {
                co.set_status(CoStatus::Dead);
                Err(raised.value)
            }
        }
    }

    /// True when a yield would have a resume to return to.
    pub fn in_coroutine(&self) -> bool {
        !self.running_coroutines.is_empty()
    }

    pub fn current_coroutine(&self) -> Option<Arc<Coroutine>> {
        self.running_coroutines.last().cloned()
    }

    // ---- small helpers ---------------------------------------------------

    fn rk(&self, proto: &Prototype, base: usize, rk: RK) -> Value {
        if rk_is_const(rk) {
            Value::from_constant(&proto.constants[rk_index(rk)])
        } else {
            self.exec.stack[base + rk_index(rk)].clone()
        }
    }

    fn constant_str(&self, proto: &Prototype, k: u32) -> LunoStr {
        match Value::from_constant(&proto.constants[k as usize]) {
            Value::Str(s) => s,
            other => LunoStr::new(other.display()),
        }
    }

    pub fn get_metamethod(&self, v: &Value, event: &str) -> Option<Value> {
        let mt = match v {
            Value::Table(t) => t.lock().metatable(),
            _ => None,
        }?;
        let handler = mt.lock().raw_get(&Value::from(event));
        (!handler.is_nil()).then_some(handler)
    }

    /// Current source position, for error message prefixes.
    pub fn where_am_i(&self) -> (String, usize) {
        match self.exec.frames.last() {
            Some(frame) => {
                let proto = &frame.closure.proto;
                let pc = frame.pc.saturating_sub(1);
                (proto.source.to_string(), proto.line_at(pc) as usize)
            }
            None => ("?".to_string(), 0),
        }
    }

    /// A runtime error with a `source:line:` prefix, raised as a fault.
    pub fn rt(&self, message: impl Into<String>) -> Fault {
        let (source, line) = self.where_am_i();
        Fault::raise_str(format!("{}:{}: {}", source, line, message.into()))
    }

    /// The `tostring` coercion, honoring `__tostring`.
    pub fn coerce_to_string(&mut self, v: &Value) -> Result<LunoStr, Fault> {
        if let Some(h) = self.get_metamethod(v, "__tostring") {
            let results = self.call_value(h, vec![v.clone()])?;
            return match results.into_iter().next() {
                Some(Value::Str(s)) => Ok(s),
                Some(other) => Ok(LunoStr::new(other.display())),
                None => Ok(LunoStr::new("nil")),
            };
        }
        Ok(LunoStr::new(v.display()))
    }

    /// Argument helper for natives: `args[i]` or nil.
    pub fn arg(args: &[Value], i: usize) -> Value {
        args.get(i).cloned().unwrap_or(Value::Nil)
    }
}

/// Decode a stage body's flagged results: a truthy leading flag means
/// the enclosing function returns the rest.
fn flag_outcome(results: Vec<Value>) -> TryOutcome {
    if results.first().map(Value::is_truthy).unwrap_or(false) {
        TryOutcome::Return(results[1..].to_vec())
    } else {
        TryOutcome::Continue
    }
}

fn numeric_only(v: &Value) -> Option<Number> {
    match v {
        Value::Integer(n) => Some(Number::Int(*n)),
        Value::Float(f) => Some(Number::Float(*f)),
        _ => None,
    }
}
