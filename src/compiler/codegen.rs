// Luno Code Generation
// Per-function state: instruction emission, register allocation,
// constant pooling, jump patching, expression discharge

use crate::compiler::exp::{ExpDesc, ExpKind, NumLit, NO_JUMP};
use crate::compiler::opcode::{
    rk_const, rk_index, rk_is_const, ArithOp, CmpOp, Instr, UnOp, NO_REG, RK, RK_CONST,
};
use crate::vm::value::{floor_div_i64, floor_mod_i64, shift_left};
use crate::compiler::proto::{Constant, LocalVar, Prototype, UpvalueDesc};
use crate::error::{LunoError, LunoResult, Span};
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Registers per function window.
pub const MAX_REGS: u8 = 200;

/// Constant pool key; floats keyed by bit pattern so 1 and 1.0 stay
/// distinct entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ConstKey {
    Int(i64),
    Float(u64),
    Str(Arc<str>),
}

/// A local variable currently in scope.
#[derive(Debug, Clone)]
pub struct ActiveLocal {
    pub name: Arc<str>,
    pub register: u8,
    /// Index into the debug `locals` table.
    pub debug_index: usize,
}

/// A `::label::` pending resolution.
#[derive(Debug, Clone)]
pub struct LabelDesc {
    pub name: Arc<str>,
    pub pc: usize,
    pub nactive: u8,
    pub block_level: usize,
}

/// A `goto` awaiting its label.
#[derive(Debug, Clone)]
pub struct GotoDesc {
    pub name: Arc<str>,
    pub jump_pc: usize,
    pub span: Span,
    pub nactive: u8,
    pub block_level: usize,
}

/// A lexical block, tracking loop patch lists and captured locals.
#[derive(Debug)]
pub struct BlockCx {
    pub first_local: u8,
    pub is_loop: bool,
    pub has_upval: bool,
    pub break_list: i32,
    pub continue_list: i32,
    pub first_label: usize,
    pub first_goto: usize,
}

/// Code-generation state for one function being compiled.
pub struct FuncState {
    pub code: Vec<Instr>,
    pub lines: Vec<u32>,
    pub constants: Vec<Constant>,
    const_map: FxHashMap<ConstKey, u32>,
    pub protos: Vec<Arc<Prototype>>,
    pub upvalues: Vec<UpvalueDesc>,
    pub param_count: u8,
    pub is_vararg: bool,
    pub max_stack: u8,
    pub free_reg: u8,
    pub active: Vec<ActiveLocal>,
    pub blocks: Vec<BlockCx>,
    pub labels: Vec<LabelDesc>,
    pub gotos: Vec<GotoDesc>,
    pub locals_debug: Vec<LocalVar>,
    pub source: Arc<str>,
    pub name: String,
    pub line_defined: u32,
}

impl FuncState {
    pub fn new(source: Arc<str>, name: String, line_defined: u32) -> Self {
        Self {
            code: Vec::new(),
            lines: Vec::new(),
            constants: Vec::new(),
            const_map: FxHashMap::default(),
            protos: Vec::new(),
            upvalues: Vec::new(),
            param_count: 0,
            is_vararg: false,
            max_stack: 2,
            free_reg: 0,
            active: Vec::new(),
            blocks: Vec::new(),
            labels: Vec::new(),
            gotos: Vec::new(),
            locals_debug: Vec::new(),
            source,
            name,
            line_defined,
        }
    }

    fn err(&self, message: impl Into<String>, span: Span) -> LunoError {
        LunoError::syntax_error(message, span, self.source.to_string())
    }

    pub fn pc(&self) -> usize {
        self.code.len()
    }

    pub fn emit(&mut self, instr: Instr, line: u32) -> usize {
        self.code.push(instr);
        self.lines.push(line);
        self.code.len() - 1
    }

    // ---- registers -----------------------------------------------------

    pub fn reserve_regs(&mut self, n: u8, span: Span) -> LunoResult<()> {
        let new_top = self.free_reg as u16 + n as u16;
        if new_top > MAX_REGS as u16 {
            return Err(self.err("function or expression needs too many registers", span));
        }
        self.free_reg = new_top as u8;
        if self.free_reg > self.max_stack {
            self.max_stack = self.free_reg;
        }
        Ok(())
    }

    pub fn free_register(&mut self, reg: u8) {
        if reg >= self.active.len() as u8 {
            self.free_reg -= 1;
            debug_assert_eq!(reg, self.free_reg);
        }
    }

    fn free_rk(&mut self, rk: RK) {
        if !rk_is_const(rk) {
            self.free_register(rk as u8);
        }
    }

    pub fn free_exp(&mut self, e: &ExpDesc) {
        if let ExpKind::NonReloc(r) = e.kind {
            self.free_register(r);
        }
    }

    // ---- constants -----------------------------------------------------

    fn add_constant(&mut self, key: ConstKey, value: Constant) -> u32 {
        if let Some(&idx) = self.const_map.get(&key) {
            return idx;
        }
        let idx = self.constants.len() as u32;
        self.constants.push(value);
        self.const_map.insert(key, idx);
        idx
    }

    pub fn const_int(&mut self, n: i64) -> u32 {
        self.add_constant(ConstKey::Int(n), Constant::Int(n))
    }

    pub fn const_float(&mut self, n: f64) -> u32 {
        self.add_constant(ConstKey::Float(n.to_bits()), Constant::Float(n))
    }

    pub fn const_str(&mut self, s: Arc<str>) -> u32 {
        self.add_constant(ConstKey::Str(s.clone()), Constant::Str(s))
    }

    // ---- jumps ---------------------------------------------------------

    /// Emit an unconditional jump with an unresolved target; returns its
    /// pc for later patching.
    pub fn jump(&mut self, line: u32) -> usize {
        self.emit(Instr::Jump { offset: NO_JUMP }, line)
    }

    pub fn jump_to(&mut self, target: usize, line: u32) {
        let pc = self.jump(line);
        self.fix_jump(pc, target);
    }

    /// Point the jump (or for-loop) at `pc` to `target`.
    pub fn patch_jump(&mut self, pc: usize, target: usize) {
        self.fix_jump(pc, target);
    }

    fn fix_jump(&mut self, pc: usize, target: usize) {
        let offset = target as i64 - (pc as i64 + 1);
        if let Instr::Jump { offset: o } = &mut self.code[pc] {
            *o = offset as i32;
        } else if let Instr::ForPrep { offset: o, .. } = &mut self.code[pc] {
            *o = offset as i32;
        } else if let Instr::ForLoop { offset: o, .. } = &mut self.code[pc] {
            *o = offset as i32;
        } else if let Instr::TForLoop { offset: o, .. } = &mut self.code[pc] {
            *o = offset as i32;
        } else {
            unreachable!("fix_jump on non-jump instruction");
        }
    }

    /// Next jump in a patch chain, or NO_JUMP at the end.
    fn get_jump(&self, pc: usize) -> i32 {
        if let Instr::Jump { offset } = self.code[pc] {
            if offset == NO_JUMP {
                NO_JUMP
            } else {
                pc as i32 + 1 + offset
            }
        } else {
            NO_JUMP
        }
    }

    /// Append `pc` (a jump) onto chain `list`.
    pub fn concat_jump(&mut self, list: &mut i32, pc: i32) {
        if pc == NO_JUMP {
            return;
        }
        if *list == NO_JUMP {
            *list = pc;
            return;
        }
        let mut node = *list as usize;
        loop {
            let next = self.get_jump(node);
            if next == NO_JUMP {
                break;
            }
            node = next as usize;
        }
        self.fix_jump(node, pc as usize);
    }

    /// Instruction controlling the jump at `pc` (the preceding test, if
    /// there is one).
    fn jump_control(&self, pc: usize) -> usize {
        if pc >= 1
            && matches!(
                self.code[pc - 1],
                Instr::Cmp { .. } | Instr::Test { .. } | Instr::TestSet { .. }
            )
        {
            pc - 1
        } else {
            pc
        }
    }

    /// Whether any jump in `list` needs a materialized boolean (is not
    /// preceded by a value-producing TestSet).
    fn need_value(&self, mut list: i32) -> bool {
        while list != NO_JUMP {
            let ctl = self.jump_control(list as usize);
            if !matches!(self.code[ctl], Instr::TestSet { .. }) {
                return true;
            }
            list = self.get_jump(list as usize);
        }
        false
    }

    /// Redirect a TestSet before the jump at `node` to store into `reg`,
    /// or degrade it to a plain Test. Returns false when the jump has no
    /// TestSet control.
    fn patch_test_reg(&mut self, node: usize, reg: u8) -> bool {
        let ctl = self.jump_control(node);
        let (src, expect) = match self.code[ctl] {
            Instr::TestSet { src, expect, .. } => (src, expect),
            _ => return false,
        };
        if reg != NO_REG && reg != src {
            self.code[ctl] = Instr::TestSet { dst: reg, src, expect };
        } else {
            self.code[ctl] = Instr::Test { src, expect };
        }
        true
    }

    fn patch_list_aux(&mut self, mut list: i32, vtarget: usize, reg: u8, dtarget: usize) {
        while list != NO_JUMP {
            let next = self.get_jump(list as usize);
            if self.patch_test_reg(list as usize, reg) {
                self.fix_jump(list as usize, vtarget);
            } else {
                self.fix_jump(list as usize, dtarget);
            }
            list = next;
        }
    }

    /// Patch every jump in `list` to land at `target`.
    pub fn patch_list(&mut self, list: i32, target: usize) {
        self.patch_list_aux(list, target, NO_REG, target);
    }

    pub fn patch_to_here(&mut self, list: i32) {
        let here = self.pc();
        self.patch_list(list, here);
    }

    /// Flip the sense of the test controlling the jump at `pc`.
    fn negate_condition(&mut self, pc: usize) {
        let ctl = self.jump_control(pc);
        match &mut self.code[ctl] {
            Instr::Cmp { expect, .. } => *expect = !*expect,
            Instr::Test { expect, .. } => *expect = !*expect,
            Instr::TestSet { expect, .. } => *expect = !*expect,
            _ => unreachable!("negating a non-test jump"),
        }
    }

    /// Emit `test` + jump; returns the jump's pc.
    fn cond_jump(&mut self, test: Instr, line: u32) -> usize {
        self.emit(test, line);
        self.jump(line)
    }

    // ---- expression discharge ------------------------------------------

    /// Turn variable references into value-producing forms.
    pub fn discharge_vars(&mut self, e: &mut ExpDesc, line: u32) {
        match e.kind {
            ExpKind::Local(r) => e.kind = ExpKind::NonReloc(r),
            ExpKind::Upval(idx) => {
                let pc = self.emit(Instr::GetUpval { dst: 0, idx }, line);
                e.kind = ExpKind::Reloc(pc);
            }
            ExpKind::Global(k) => {
                let pc = self.emit(Instr::GetGlobal { dst: 0, k }, line);
                e.kind = ExpKind::Reloc(pc);
            }
            ExpKind::Indexed { obj, key } => {
                self.free_rk(key);
                self.free_register(obj);
                let pc = self.emit(Instr::GetIndex { dst: 0, obj, key }, line);
                e.kind = ExpKind::Reloc(pc);
            }
            ExpKind::Call(_) | ExpKind::Vararg(_) => self.set_one_result(e),
            _ => {}
        }
    }

    /// Fix an open call/vararg to produce exactly one value.
    pub fn set_one_result(&mut self, e: &mut ExpDesc) {
        match e.kind {
            ExpKind::Call(pc) => {
                if let Instr::Call { base, .. } = self.code[pc] {
                    e.kind = ExpKind::NonReloc(base);
                }
            }
            ExpKind::Vararg(pc) => {
                if let Instr::Vararg { count, .. } = &mut self.code[pc] {
                    *count = 2;
                }
                e.kind = ExpKind::Reloc(pc);
            }
            _ => {}
        }
    }

    /// Fix an open call/vararg's result count; `wanted` of -1 keeps all.
    pub fn set_returns(&mut self, e: &ExpDesc, wanted: i32, span: Span) -> LunoResult<()> {
        let encoded = (wanted + 1) as u8;
        match e.kind {
            ExpKind::Call(pc) => {
                if let Instr::Call { nresults, .. } = &mut self.code[pc] {
                    *nresults = encoded;
                }
            }
            ExpKind::Vararg(pc) => {
                let dst = self.free_reg;
                self.reserve_regs(1, span)?;
                if let Instr::Vararg { dst: d, count } = &mut self.code[pc] {
                    *d = dst;
                    *count = encoded;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Place the (jump-free) value of `e` into register `reg`.
    fn discharge_to_reg(&mut self, e: &mut ExpDesc, reg: u8, line: u32) {
        self.discharge_vars(e, line);
        match e.kind.clone() {
            ExpKind::Nil => {
                self.emit(Instr::LoadNil { dst: reg, count: 1 }, line);
            }
            ExpKind::True => {
                self.emit(Instr::LoadBool { dst: reg, value: true, skip: false }, line);
            }
            ExpKind::False => {
                self.emit(Instr::LoadBool { dst: reg, value: false, skip: false }, line);
            }
            ExpKind::KInt(n) => {
                let k = self.const_int(n);
                self.emit(Instr::LoadK { dst: reg, k }, line);
            }
            ExpKind::KFlt(n) => {
                let k = self.const_float(n);
                self.emit(Instr::LoadK { dst: reg, k }, line);
            }
            ExpKind::KStr(s) => {
                let k = self.const_str(s);
                self.emit(Instr::LoadK { dst: reg, k }, line);
            }
            ExpKind::Reloc(pc) => {
                self.set_reloc_dst(pc, reg);
            }
            ExpKind::NonReloc(r) => {
                if r != reg {
                    self.emit(Instr::Move { dst: reg, src: r }, line);
                }
            }
            ExpKind::Void | ExpKind::Jump(_) => return,
            _ => unreachable!("undischarged expression"),
        }
        e.kind = ExpKind::NonReloc(reg);
    }

    fn set_reloc_dst(&mut self, pc: usize, reg: u8) {
        match &mut self.code[pc] {
            Instr::LoadK { dst, .. }
            | Instr::LoadEnv { dst }
            | Instr::GetGlobal { dst, .. }
            | Instr::GetUpval { dst, .. }
            | Instr::GetIndex { dst, .. }
            | Instr::Arith { dst, .. }
            | Instr::Unary { dst, .. }
            | Instr::Concat { dst, .. }
            | Instr::NewTable { dst, .. }
            | Instr::NewList { dst, .. }
            | Instr::Closure { dst, .. }
            | Instr::Import { dst, .. }
            | Instr::Module { dst, .. }
            | Instr::Vararg { dst, .. } => *dst = reg,
            other => unreachable!("relocating non-relocatable {:?}", other),
        }
    }

    fn discharge_to_any_reg(&mut self, e: &mut ExpDesc, line: u32) -> LunoResult<()> {
        if !matches!(e.kind, ExpKind::NonReloc(_)) {
            self.reserve_regs(1, e.span)?;
            let reg = self.free_reg - 1;
            self.discharge_to_reg(e, reg, line);
        }
        Ok(())
    }

    fn code_label(&mut self, reg: u8, value: bool, skip: bool, line: u32) -> usize {
        self.emit(Instr::LoadBool { dst: reg, value, skip }, line)
    }

    /// Materialize `e` (including its jump chains) into register `reg`.
    pub fn exp_to_reg(&mut self, e: &mut ExpDesc, reg: u8, line: u32) {
        self.discharge_to_reg(e, reg, line);
        if let ExpKind::Jump(pc) = e.kind {
            let mut t = e.true_list;
            self.concat_jump(&mut t, pc as i32);
            e.true_list = t;
        }
        if e.has_jumps() {
            let mut p_f = NO_JUMP;
            let mut p_t = NO_JUMP;
            if self.need_value(e.true_list) || self.need_value(e.false_list) {
                let fj = if matches!(e.kind, ExpKind::Jump(_)) {
                    NO_JUMP
                } else {
                    self.jump(line) as i32
                };
                p_f = self.code_label(reg, false, true, line) as i32;
                p_t = self.code_label(reg, true, false, line) as i32;
                self.patch_to_here(fj);
            }
            let end = self.pc();
            let dt = if p_t == NO_JUMP { end } else { p_t as usize };
            let df = if p_f == NO_JUMP { end } else { p_f as usize };
            self.patch_list_aux(e.false_list, end, reg, df);
            self.patch_list_aux(e.true_list, end, reg, dt);
        }
        e.true_list = NO_JUMP;
        e.false_list = NO_JUMP;
        e.kind = ExpKind::NonReloc(reg);
    }

    /// Materialize `e` into the next free register.
    pub fn exp_to_next_reg(&mut self, e: &mut ExpDesc, line: u32) -> LunoResult<()> {
        self.discharge_vars(e, line);
        self.free_exp(e);
        self.reserve_regs(1, e.span)?;
        let reg = self.free_reg - 1;
        self.exp_to_reg(e, reg, line);
        Ok(())
    }

    /// Materialize `e` into some register; returns it.
    pub fn exp_to_any_reg(&mut self, e: &mut ExpDesc, line: u32) -> LunoResult<u8> {
        self.discharge_vars(e, line);
        if let ExpKind::NonReloc(r) = e.kind {
            if !e.has_jumps() {
                return Ok(r);
            }
            if r >= self.active.len() as u8 {
                self.exp_to_reg(e, r, line);
                return Ok(r);
            }
        }
        self.exp_to_next_reg(e, line)?;
        match e.kind {
            ExpKind::NonReloc(r) => Ok(r),
            _ => unreachable!(),
        }
    }

    /// Reduce `e` to a value (register or constant) with no pending jumps.
    pub fn exp_to_val(&mut self, e: &mut ExpDesc, line: u32) -> LunoResult<()> {
        if e.has_jumps() {
            self.exp_to_any_reg(e, line)?;
        } else {
            self.discharge_vars(e, line);
        }
        Ok(())
    }

    /// Reduce `e` to an RK operand: constant-pool reference when it fits,
    /// otherwise a register.
    pub fn exp_to_rk(&mut self, e: &mut ExpDesc, line: u32) -> LunoResult<RK> {
        self.exp_to_val(e, line)?;
        match e.kind.clone() {
            ExpKind::KInt(n) => {
                let k = self.const_int(n);
                if k < RK_CONST as u32 {
                    return Ok(rk_const(k));
                }
            }
            ExpKind::KFlt(n) => {
                let k = self.const_float(n);
                if k < RK_CONST as u32 {
                    return Ok(rk_const(k));
                }
            }
            ExpKind::KStr(s) => {
                let k = self.const_str(s);
                if k < RK_CONST as u32 {
                    return Ok(rk_const(k));
                }
            }
            _ => {}
        }
        let reg = self.exp_to_any_reg(e, line)?;
        Ok(reg as RK)
    }

    // ---- variables -----------------------------------------------------

    /// Store `e` into the variable described by `var`.
    pub fn store_var(&mut self, var: &ExpDesc, e: &mut ExpDesc, line: u32) -> LunoResult<()> {
        match var.kind {
            ExpKind::Local(reg) => {
                self.free_exp(e);
                self.exp_to_reg(e, reg, line);
                return Ok(());
            }
            ExpKind::Upval(idx) => {
                let src = self.exp_to_any_reg(e, line)?;
                self.emit(Instr::SetUpval { src, idx }, line);
            }
            ExpKind::Global(k) => {
                let src = self.exp_to_any_reg(e, line)?;
                self.emit(Instr::SetGlobal { src, k }, line);
            }
            ExpKind::Indexed { obj, key } => {
                let val = self.exp_to_rk(e, line)?;
                self.emit(Instr::SetIndex { obj, key, val }, line);
            }
            _ => return Err(self.err("cannot assign to this expression", var.span)),
        }
        self.free_exp(e);
        Ok(())
    }

    /// Method-call receiver setup: `e:key` loads the method into a fresh
    /// register pair (function, receiver).
    pub fn self_exp(&mut self, e: &mut ExpDesc, key: &mut ExpDesc, line: u32) -> LunoResult<()> {
        let obj = self.exp_to_any_reg(e, line)?;
        self.free_exp(e);
        let base = self.free_reg;
        self.reserve_regs(2, e.span)?;
        let k = self.exp_to_rk(key, line)?;
        self.emit(Instr::SelfGet { dst: base, obj, key: k }, line);
        self.free_exp(key);
        e.kind = ExpKind::NonReloc(base);
        Ok(())
    }

    /// Turn `e` into `e[key]`.
    pub fn indexed(&mut self, e: &mut ExpDesc, key: &mut ExpDesc, line: u32) -> LunoResult<()> {
        let obj = self.exp_to_any_reg(e, line)?;
        let k = self.exp_to_rk(key, line)?;
        e.kind = ExpKind::Indexed { obj, key: k };
        Ok(())
    }

    // ---- conditions ----------------------------------------------------

    fn jump_on_cond(&mut self, e: &mut ExpDesc, cond: bool, line: u32) -> LunoResult<usize> {
        if let ExpKind::Reloc(pc) = e.kind {
            if let Instr::Unary { op: UnOp::Not, src, .. } = self.code[pc] {
                // Fold `not x` into the test itself.
                self.code.pop();
                self.lines.pop();
                return Ok(self.cond_jump(Instr::Test { src, expect: !cond }, line));
            }
        }
        self.discharge_to_any_reg(e, line)?;
        self.free_exp(e);
        let src = match e.kind {
            ExpKind::NonReloc(r) => r,
            _ => unreachable!(),
        };
        Ok(self.cond_jump(Instr::TestSet { dst: NO_REG, src, expect: cond }, line))
    }

    /// Prepare `e` as a condition that falls through when true.
    pub fn go_if_true(&mut self, e: &mut ExpDesc, line: u32) -> LunoResult<()> {
        self.discharge_vars(e, line);
        let pc = match e.kind {
            ExpKind::KInt(_) | ExpKind::KFlt(_) | ExpKind::KStr(_) | ExpKind::True => NO_JUMP,
            ExpKind::Nil | ExpKind::False => self.jump(line) as i32,
            ExpKind::Jump(j) => {
                self.negate_condition(j);
                j as i32
            }
            _ => self.jump_on_cond(e, false, line)? as i32,
        };
        let mut f = e.false_list;
        self.concat_jump(&mut f, pc);
        e.false_list = f;
        self.patch_to_here(e.true_list);
        e.true_list = NO_JUMP;
        Ok(())
    }

    /// Prepare `e` as a condition that falls through when false.
    pub fn go_if_false(&mut self, e: &mut ExpDesc, line: u32) -> LunoResult<()> {
        self.discharge_vars(e, line);
        let pc = match e.kind {
            ExpKind::Nil | ExpKind::False => NO_JUMP,
            ExpKind::True | ExpKind::KInt(_) | ExpKind::KFlt(_) | ExpKind::KStr(_) => {
                self.jump(line) as i32
            }
            ExpKind::Jump(j) => j as i32,
            _ => self.jump_on_cond(e, true, line)? as i32,
        };
        let mut t = e.true_list;
        self.concat_jump(&mut t, pc);
        e.true_list = t;
        self.patch_to_here(e.false_list);
        e.false_list = NO_JUMP;
        Ok(())
    }

    /// Strip value stores from a condition-only jump list.
    fn remove_values(&mut self, mut list: i32) {
        while list != NO_JUMP {
            self.patch_test_reg(list as usize, NO_REG);
            list = self.get_jump(list as usize);
        }
    }

    // ---- operators -----------------------------------------------------

    fn fold_arith(op: ArithOp, a: NumLit, b: NumLit) -> Option<ExpKind> {
        use ArithOp::*;
        // Integer-preserving ops stay integral when both operands are.
        if let (NumLit::Int(x), NumLit::Int(y)) = (a, b) {
            let folded = match op {
                Add => x.checked_add(y).map(ExpKind::KInt),
                Sub => x.checked_sub(y).map(ExpKind::KInt),
                Mul => x.checked_mul(y).map(ExpKind::KInt),
                IDiv => {
                    if y == 0 {
                        return None;
                    }
                    Some(ExpKind::KInt(floor_div_i64(x, y)))
                }
                Mod => {
                    if y == 0 {
                        return None;
                    }
                    Some(ExpKind::KInt(floor_mod_i64(x, y)))
                }
                Div => Some(ExpKind::KFlt(x as f64 / y as f64)),
                Pow => Some(ExpKind::KFlt((x as f64).powf(y as f64))),
                BAnd => Some(ExpKind::KInt(x & y)),
                BOr => Some(ExpKind::KInt(x | y)),
                BXor => Some(ExpKind::KInt(x ^ y)),
                Shl => Some(ExpKind::KInt(shift_left(x, y))),
                Shr => Some(ExpKind::KInt(shift_left(x, -y))),
            };
            // Overflow promotes to float.
            return folded.or_else(|| match op {
                Add | Sub | Mul => {
                    Some(ExpKind::KFlt(fold_float(op, x as f64, y as f64)))
                }
                _ => None,
            });
        }
        // Bitwise ops require integers.
        if matches!(op, BAnd | BOr | BXor | Shl | Shr) {
            return None;
        }
        let (x, y) = (a.as_float(), b.as_float());
        match op {
            IDiv | Mod if y == 0.0 => None,
            IDiv => Some(ExpKind::KFlt((x / y).floor())),
            Mod => Some(ExpKind::KFlt(x - (x / y).floor() * y)),
            _ => Some(ExpKind::KFlt(fold_float(op, x, y))),
        }
    }

    fn code_arith(
        &mut self,
        op: ArithOp,
        e1: &mut ExpDesc,
        e2: &mut ExpDesc,
        line: u32,
    ) -> LunoResult<()> {
        if let (Some(a), Some(b)) = (e1.as_number(), e2.as_number()) {
            if let Some(folded) = Self::fold_arith(op, a, b) {
                e1.kind = folded;
                return Ok(());
            }
        }
        let rhs = self.exp_to_rk(e2, line)?;
        let lhs = self.exp_to_rk(e1, line)?;
        if rk_index(lhs) > rk_index(rhs) && !rk_is_const(lhs) {
            self.free_rk(lhs);
            self.free_rk(rhs);
        } else {
            self.free_rk(rhs);
            self.free_rk(lhs);
        }
        let pc = self.emit(Instr::Arith { op, dst: 0, lhs, rhs }, line);
        e1.kind = ExpKind::Reloc(pc);
        Ok(())
    }

    fn code_compare(
        &mut self,
        op: CmpOp,
        expect: bool,
        swap: bool,
        e1: &mut ExpDesc,
        e2: &mut ExpDesc,
        line: u32,
    ) -> LunoResult<()> {
        let rk2 = self.exp_to_rk(e2, line)?;
        let rk1 = self.exp_to_rk(e1, line)?;
        self.free_rk(rk1);
        self.free_rk(rk2);
        let (lhs, rhs) = if swap { (rk2, rk1) } else { (rk1, rk2) };
        let pc = self.cond_jump(Instr::Cmp { op, expect, lhs, rhs }, line);
        e1.kind = ExpKind::Jump(pc);
        Ok(())
    }

    /// Binary operator kinds the parser hands to infix/posfix.
    pub fn infix(&mut self, op: BinOpKind, e: &mut ExpDesc, line: u32) -> LunoResult<()> {
        match op {
            BinOpKind::And => self.go_if_true(e, line)?,
            BinOpKind::Or => self.go_if_false(e, line)?,
            BinOpKind::Concat => self.exp_to_next_reg(e, line)?,
            BinOpKind::Arith(_) => {
                if e.as_number().is_none() {
                    self.exp_to_rk(e, line)?;
                }
            }
            BinOpKind::Cmp(..) => {
                self.exp_to_rk(e, line)?;
            }
        }
        Ok(())
    }

    pub fn posfix(
        &mut self,
        op: BinOpKind,
        e1: &mut ExpDesc,
        e2: &mut ExpDesc,
        line: u32,
    ) -> LunoResult<()> {
        match op {
            BinOpKind::And => {
                debug_assert_eq!(e1.true_list, NO_JUMP);
                self.discharge_vars(e2, line);
                let mut f = e2.false_list;
                self.concat_jump(&mut f, e1.false_list);
                e2.false_list = f;
                *e1 = e2.clone();
            }
            BinOpKind::Or => {
                debug_assert_eq!(e1.false_list, NO_JUMP);
                self.discharge_vars(e2, line);
                let mut t = e2.true_list;
                self.concat_jump(&mut t, e1.true_list);
                e2.true_list = t;
                *e1 = e2.clone();
            }
            BinOpKind::Concat => {
                self.exp_to_val(e2, line)?;
                let e1_reg = match e1.kind {
                    ExpKind::NonReloc(r) => r,
                    _ => unreachable!("concat lhs not in register"),
                };
                if let ExpKind::Reloc(pc) = e2.kind {
                    if let Instr::Concat { start, .. } = self.code[pc] {
                        // Fold chained concats into one instruction.
                        debug_assert_eq!(e1_reg + 1, start);
                        self.free_exp(e1);
                        if let Instr::Concat { start, .. } = &mut self.code[pc] {
                            *start = e1_reg;
                        }
                        e1.kind = ExpKind::Reloc(pc);
                        return Ok(());
                    }
                }
                self.exp_to_next_reg(e2, line)?;
                let end = match e2.kind {
                    ExpKind::NonReloc(r) => r,
                    _ => unreachable!(),
                };
                self.free_exp(e2);
                self.free_exp(e1);
                let pc = self.emit(
                    Instr::Concat { dst: 0, start: e1_reg, end },
                    line,
                );
                e1.kind = ExpKind::Reloc(pc);
            }
            BinOpKind::Arith(a) => self.code_arith(a, e1, e2, line)?,
            BinOpKind::Cmp(c, expect, swap) => {
                self.code_compare(c, expect, swap, e1, e2, line)?
            }
        }
        Ok(())
    }

    pub fn prefix(&mut self, op: UnOp, e: &mut ExpDesc, line: u32) -> LunoResult<()> {
        match op {
            UnOp::Neg => {
                if let Some(n) = e.as_number() {
                    e.kind = match n {
                        NumLit::Int(v) => match v.checked_neg() {
                            Some(neg) => ExpKind::KInt(neg),
                            None => ExpKind::KFlt(-(v as f64)),
                        },
                        NumLit::Float(v) => ExpKind::KFlt(-v),
                    };
                    return Ok(());
                }
                self.code_unary(UnOp::Neg, e, line)?;
            }
            UnOp::BNot => {
                if let Some(NumLit::Int(v)) = e.as_number() {
                    e.kind = ExpKind::KInt(!v);
                    return Ok(());
                }
                self.code_unary(UnOp::BNot, e, line)?;
            }
            UnOp::Len => self.code_unary(UnOp::Len, e, line)?,
            UnOp::Not => self.code_not(e, line)?,
        }
        Ok(())
    }

    fn code_unary(&mut self, op: UnOp, e: &mut ExpDesc, line: u32) -> LunoResult<()> {
        let src = self.exp_to_any_reg(e, line)?;
        self.free_exp(e);
        let pc = self.emit(Instr::Unary { op, dst: 0, src }, line);
        e.kind = ExpKind::Reloc(pc);
        Ok(())
    }

    fn code_not(&mut self, e: &mut ExpDesc, line: u32) -> LunoResult<()> {
        self.discharge_vars(e, line);
        match e.kind {
            ExpKind::Nil | ExpKind::False => e.kind = ExpKind::True,
            ExpKind::True | ExpKind::KInt(_) | ExpKind::KFlt(_) | ExpKind::KStr(_) => {
                e.kind = ExpKind::False
            }
            ExpKind::Jump(pc) => self.negate_condition(pc),
            ExpKind::Reloc(_) | ExpKind::NonReloc(_) => {
                self.discharge_to_any_reg(e, line)?;
                self.free_exp(e);
                let src = match e.kind {
                    ExpKind::NonReloc(r) => r,
                    _ => unreachable!(),
                };
                let pc = self.emit(Instr::Unary { op: UnOp::Not, dst: 0, src }, line);
                e.kind = ExpKind::Reloc(pc);
            }
            _ => unreachable!(),
        }
        std::mem::swap(&mut e.true_list, &mut e.false_list);
        self.remove_values(e.true_list);
        self.remove_values(e.false_list);
        Ok(())
    }

    // ---- scope ---------------------------------------------------------

    pub fn enter_block(&mut self, is_loop: bool) {
        self.blocks.push(BlockCx {
            first_local: self.active.len() as u8,
            is_loop,
            has_upval: false,
            break_list: NO_JUMP,
            continue_list: NO_JUMP,
            first_label: self.labels.len(),
            first_goto: self.gotos.len(),
        });
    }

    /// Close the innermost block: pop its locals, close captured
    /// upvalues, resolve its labels. Returns the block for the parser to
    /// patch break jumps.
    pub fn leave_block(&mut self, line: u32) -> LunoResult<BlockCx> {
        let block = self.blocks.pop().unwrap();
        if block.has_upval {
            self.emit(Instr::CloseUpvals { from: block.first_local }, line);
        }
        self.remove_locals(block.first_local, line);
        self.free_reg = block.first_local;
        // Labels local to this block disappear; gotos bubble outward.
        self.resolve_block_gotos(&block)?;
        self.labels.truncate(block.first_label);
        Ok(block)
    }

    fn resolve_block_gotos(&mut self, block: &BlockCx) -> LunoResult<()> {
        let mut i = block.first_goto;
        while i < self.gotos.len() {
            let label = self
                .labels
                .iter()
                .skip(block.first_label)
                .find(|l| l.name == self.gotos[i].name)
                .cloned();
            match label {
                Some(label) => {
                    let g = self.gotos.remove(i);
                    self.close_goto(&g, &label)?;
                }
                None => {
                    // Escapes this block; visible locals shrink to the
                    // block boundary.
                    if self.gotos[i].nactive > block.first_local {
                        self.gotos[i].nactive = block.first_local;
                    }
                    i += 1;
                }
            }
        }
        Ok(())
    }

    fn close_goto(&mut self, g: &GotoDesc, label: &LabelDesc) -> LunoResult<()> {
        if label.nactive > g.nactive {
            let local = &self.active[g.nactive as usize];
            return Err(self.err(
                format!(
                    "goto '{}' jumps into the scope of local '{}'",
                    g.name, local.name
                ),
                g.span,
            ));
        }
        self.fix_jump(g.jump_pc, label.pc);
        Ok(())
    }

    /// Record a `::label::`; resolves any pending forward gotos in the
    /// current block.
    pub fn define_label(&mut self, name: Arc<str>, span: Span) -> LunoResult<()> {
        let block = self.blocks.last().map(|b| b.first_goto).unwrap_or(0);
        if self
            .labels
            .iter()
            .skip(self.blocks.last().map(|b| b.first_label).unwrap_or(0))
            .any(|l| l.name == name)
        {
            return Err(self.err(format!("label '{}' already defined", name), span));
        }
        let label = LabelDesc {
            name: name.clone(),
            pc: self.pc(),
            nactive: self.active.len() as u8,
            block_level: self.blocks.len(),
        };
        // Forward gotos waiting in the current block.
        let mut i = block;
        while i < self.gotos.len() {
            if self.gotos[i].name == name {
                let g = self.gotos.remove(i);
                self.close_goto(&g, &label)?;
            } else {
                i += 1;
            }
        }
        self.labels.push(label);
        Ok(())
    }

    /// Record a `goto`; matched against enclosing labels immediately,
    /// otherwise pended for later resolution.
    pub fn emit_goto(&mut self, name: Arc<str>, span: Span, line: u32) -> LunoResult<()> {
        let jump_pc = self.jump(line);
        let g = GotoDesc {
            name: name.clone(),
            jump_pc,
            span,
            nactive: self.active.len() as u8,
            block_level: self.blocks.len(),
        };
        if let Some(label) = self.labels.iter().rev().find(|l| l.name == name).cloned() {
            self.close_goto(&g, &label)
        } else {
            self.gotos.push(g);
            Ok(())
        }
    }

    /// Error out on gotos never matched by a label.
    pub fn check_pending_gotos(&self) -> LunoResult<()> {
        if let Some(g) = self.gotos.first() {
            return Err(self.err(format!("no visible label '{}' for goto", g.name), g.span));
        }
        Ok(())
    }

    pub fn new_local(&mut self, name: Arc<str>, span: Span) -> LunoResult<u8> {
        if self.active.len() >= MAX_REGS as usize {
            return Err(self.err("too many local variables", span));
        }
        let register = self.active.len() as u8;
        let debug_index = self.locals_debug.len();
        self.locals_debug.push(LocalVar {
            name: name.clone(),
            register,
            start_pc: self.pc() as u32,
            end_pc: 0,
        });
        self.active.push(ActiveLocal {
            name,
            register,
            debug_index,
        });
        Ok(register)
    }

    fn remove_locals(&mut self, down_to: u8, _line: u32) {
        while self.active.len() as u8 > down_to {
            let local = self.active.pop().unwrap();
            self.locals_debug[local.debug_index].end_pc = self.pc() as u32;
        }
    }

    /// Find a local by name; innermost wins.
    pub fn resolve_local(&self, name: &str) -> Option<u8> {
        self.active
            .iter()
            .rev()
            .find(|l| &*l.name == name)
            .map(|l| l.register)
    }

    /// Mark the block owning register `reg` as having a captured local.
    pub fn mark_upvalue(&mut self, reg: u8) {
        for block in self.blocks.iter_mut().rev() {
            if block.first_local <= reg {
                block.has_upval = true;
                return;
            }
        }
    }

    /// Find or add an upvalue descriptor.
    pub fn add_upvalue(
        &mut self,
        name: Arc<str>,
        in_stack: bool,
        index: u8,
        span: Span,
    ) -> LunoResult<u8> {
        for (i, up) in self.upvalues.iter().enumerate() {
            if up.in_stack == in_stack && up.index == index {
                return Ok(i as u8);
            }
        }
        if self.upvalues.len() >= u8::MAX as usize {
            return Err(self.err("too many upvalues", span));
        }
        self.upvalues.push(UpvalueDesc { name, in_stack, index });
        Ok((self.upvalues.len() - 1) as u8)
    }

    /// Innermost enclosing loop block index, for break/continue.
    pub fn current_loop(&self) -> Option<usize> {
        self.blocks.iter().rposition(|b| b.is_loop)
    }

    // ---- finish --------------------------------------------------------

    pub fn finish(mut self, last_line: u32) -> LunoResult<Prototype> {
        self.check_pending_gotos()?;
        self.emit(Instr::Return { base: 0, count: 1 }, last_line);
        Ok(Prototype {
            code: self.code,
            lines: self.lines,
            constants: self.constants,
            protos: self.protos,
            upvalues: self.upvalues,
            param_count: self.param_count,
            is_vararg: self.is_vararg,
            max_stack: self.max_stack,
            source: self.source,
            name: self.name,
            line_defined: self.line_defined,
            locals: self.locals_debug,
        })
    }
}

fn fold_float(op: ArithOp, x: f64, y: f64) -> f64 {
    match op {
        ArithOp::Add => x + y,
        ArithOp::Sub => x - y,
        ArithOp::Mul => x * y,
        ArithOp::Div => x / y,
        ArithOp::Pow => x.powf(y),
        _ => unreachable!(),
    }
}

/// Binary operators as the parser sees them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BinOpKind {
    And,
    Or,
    Concat,
    Arith(ArithOp),
    /// Comparison with expected truth and operand-swap flag
    /// (Greater reuses Lt with swapped operands).
    Cmp(CmpOp, bool, bool),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fs() -> FuncState {
        FuncState::new(Arc::from("test.luno"), "main".into(), 0)
    }

    #[test]
    fn constants_deduplicate() {
        let mut f = fs();
        let a = f.const_int(7);
        let b = f.const_int(7);
        let c = f.const_float(7.0);
        assert_eq!(a, b);
        assert_ne!(a, c, "int and float constants stay distinct");
    }

    #[test]
    fn arith_folding_promotes_overflow() {
        let folded = FuncState::fold_arith(
            ArithOp::Add,
            NumLit::Int(i64::MAX),
            NumLit::Int(1),
        );
        match folded {
            Some(ExpKind::KFlt(v)) => assert_eq!(v, i64::MAX as f64 + 1.0),
            other => panic!("expected float promotion, got {:?}", other),
        }
    }

    #[test]
    fn division_always_folds_to_float() {
        match FuncState::fold_arith(ArithOp::Div, NumLit::Int(1), NumLit::Int(2)) {
            Some(ExpKind::KFlt(v)) => assert_eq!(v, 0.5),
            other => panic!("expected 0.5, got {:?}", other),
        }
    }

    #[test]
    fn floor_division_stays_integer() {
        match FuncState::fold_arith(ArithOp::IDiv, NumLit::Int(7), NumLit::Int(2)) {
            Some(ExpKind::KInt(3)) => {}
            other => panic!("expected 3, got {:?}", other),
        }
    }

    #[test]
    fn jump_chains_patch_to_target() {
        let mut f = fs();
        let j1 = f.jump(1) as i32;
        let j2 = f.jump(1);
        let mut list = j1;
        f.concat_jump(&mut list, j2 as i32);
        f.emit(Instr::LoadNil { dst: 0, count: 1 }, 2);
        let target = f.pc();
        f.patch_list(list, target);
        for pc in [j1 as usize, j2] {
            if let Instr::Jump { offset } = f.code[pc] {
                assert_eq!(pc as i64 + 1 + offset as i64, target as i64);
            } else {
                panic!("not a jump");
            }
        }
    }

    #[test]
    fn goto_into_local_scope_rejected() {
        let mut f = fs();
        f.enter_block(false);
        f.emit_goto(Arc::from("skip"), Span::line(1), 1).unwrap();
        f.new_local(Arc::from("x"), Span::line(2)).unwrap();
        let err = f.define_label(Arc::from("skip"), Span::line(3)).unwrap_err();
        assert!(err.message.contains("jumps into the scope of local 'x'"));
    }

    #[test]
    fn shift_semantics() {
        assert_eq!(shift_left(1, 4), 16);
        assert_eq!(shift_left(1, 64), 0);
        assert_eq!(shift_left(16, -4), 1);
        assert_eq!(shift_left(-1, -1), i64::MAX); // logical shift
    }
}
