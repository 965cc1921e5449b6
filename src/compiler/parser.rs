// Luno Parser
// Recursive-descent, single pass: statements emit bytecode as they are
// recognized, expressions flow through ExpDesc until a register or
// constant slot is forced

use crate::compiler::codegen::{BinOpKind, FuncState};
use crate::compiler::exp::{ExpDesc, ExpKind, NO_JUMP};
use crate::compiler::opcode::{ArithOp, CmpOp, Instr, UnOp, NO_REG, RK};
use crate::compiler::proto::Prototype;
use crate::error::{LunoError, LunoResult, Span};
use crate::lexer::{Lexer, Token, TokenKind};
use std::mem::discriminant;
use std::sync::Arc;

/// Binding power of unary operators.
const UNARY_PRIORITY: u8 = 12;

/// Array items buffered before a SetList flush.
const FIELDS_PER_FLUSH: u32 = 50;

pub struct Parser {
    lexer: Lexer,
    tok: Token,
    /// Line of the previous token, for end-of-construct diagnostics.
    last_line: u32,
    /// Enclosing functions, innermost last.
    funcs: Vec<FuncState>,
    /// Per-function: whether `return` must prepend the handled-return
    /// flag (bodies of try/catch/finally).
    flags: Vec<bool>,
    source: Arc<str>,
}

impl Parser {
    /// Compile a chunk into its main prototype.
    pub fn compile(source: &str, chunk_name: &str) -> LunoResult<Arc<Prototype>> {
        let mut lexer = Lexer::new(source, chunk_name);
        let tok = lexer.next_token()?;
        let mut parser = Parser {
            lexer,
            tok,
            last_line: 1,
            funcs: Vec::new(),
            flags: Vec::new(),
            source: Arc::from(chunk_name),
        };
        let mut main = FuncState::new(parser.source.clone(), "main".into(), 0);
        main.is_vararg = true;
        parser.funcs.push(main);
        parser.flags.push(false);
        parser.fs().enter_block(false);
        parser.stat_list()?;
        if !parser.tok.is_eof() {
            return Err(parser.error_here(format!("unexpected '{}'", parser.tok)));
        }
        let last = parser.last_line;
        parser.fs().leave_block(last)?;
        let main = parser.funcs.pop().expect("main function state");
        Ok(Arc::new(main.finish(last)?))
    }

    // ---- token plumbing ------------------------------------------------

    fn fs(&mut self) -> &mut FuncState {
        self.funcs.last_mut().expect("function stack")
    }

    fn line(&self) -> u32 {
        self.tok.span.start.line as u32
    }

    fn span(&self) -> Span {
        self.tok.span
    }

    fn advance(&mut self) -> LunoResult<()> {
        self.last_line = self.line();
        self.tok = self.lexer.next_token()?;
        Ok(())
    }

    fn check(&self, kind: &TokenKind) -> bool {
        discriminant(&self.tok.kind) == discriminant(kind)
    }

    fn test_next(&mut self, kind: &TokenKind) -> LunoResult<bool> {
        if self.check(kind) {
            self.advance()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn expect(&mut self, kind: TokenKind) -> LunoResult<()> {
        if self.check(&kind) {
            self.advance()
        } else {
            Err(self.error_here(format!("'{}' expected near '{}'", kind, self.tok)))
        }
    }

    /// Expect a construct terminator, naming its opener on failure.
    fn check_match(&mut self, kind: TokenKind, opener: &str, opener_line: u32) -> LunoResult<()> {
        if self.check(&kind) {
            self.advance()
        } else if opener_line == self.line() {
            Err(self.error_here(format!("'{}' expected near '{}'", kind, self.tok)))
        } else {
            Err(self.error_here(format!(
                "'{}' expected (to close '{}' at line {}) near '{}'",
                kind, opener, opener_line, self.tok
            )))
        }
    }

    fn expect_name(&mut self) -> LunoResult<(Arc<str>, Span)> {
        match self.tok.kind.clone() {
            TokenKind::Name(name) => {
                let span = self.tok.span;
                self.advance()?;
                Ok((name, span))
            }
            _ => Err(self.error_here(format!("name expected near '{}'", self.tok))),
        }
    }

    fn error_here(&self, message: impl Into<String>) -> LunoError {
        LunoError::syntax_error(message, self.tok.span, self.lexer.file().to_string())
    }

    // ---- statements ----------------------------------------------------

    fn stat_list(&mut self) -> LunoResult<()> {
        while !self.tok.kind.is_block_follow() {
            if self.check(&TokenKind::Return) {
                self.ret_stat()?;
                break;
            }
            self.statement()?;
            let fs = self.fs();
            fs.free_reg = fs.active.len() as u8;
        }
        Ok(())
    }

    /// A `do ... end`-style nested block.
    fn block(&mut self) -> LunoResult<()> {
        self.fs().enter_block(false);
        self.stat_list()?;
        let line = self.last_line;
        self.fs().leave_block(line)?;
        Ok(())
    }

    fn statement(&mut self) -> LunoResult<()> {
        match self.tok.kind {
            TokenKind::Semicolon => self.advance(),
            TokenKind::If => self.if_stat(),
            TokenKind::While => self.while_stat(),
            TokenKind::Do => {
                let line = self.line();
                self.advance()?;
                self.block()?;
                self.check_match(TokenKind::End, "do", line)
            }
            TokenKind::For => self.for_stat(),
            TokenKind::Repeat => self.repeat_stat(),
            TokenKind::Function => self.func_stat(),
            TokenKind::Local => self.local_stat(),
            TokenKind::Break => self.break_stat(false),
            TokenKind::Continue => self.break_stat(true),
            TokenKind::Goto => self.goto_stat(),
            TokenKind::DoubleColon => self.label_stat(),
            TokenKind::Defer => self.defer_stat(),
            TokenKind::Try => self.try_stat(),
            TokenKind::Switch | TokenKind::When => self.switch_stat(),
            TokenKind::Import => self.import_stat(),
            TokenKind::Module => self.module_stat(),
            _ => self.expr_stat(),
        }
    }

    fn if_stat(&mut self) -> LunoResult<()> {
        let line = self.line();
        let mut escape = NO_JUMP;
        self.test_then_block(&mut escape)?;
        while self.check(&TokenKind::Elseif) {
            self.test_then_block(&mut escape)?;
        }
        if self.test_next(&TokenKind::Else)? {
            self.block()?;
        }
        self.check_match(TokenKind::End, "if", line)?;
        self.fs().patch_to_here(escape);
        Ok(())
    }

    /// One `if`/`elseif` arm: condition, `then`, body.
    fn test_then_block(&mut self, escape: &mut i32) -> LunoResult<()> {
        let line = self.line();
        self.advance()?;
        let mut cond = self.expr()?;
        self.expect(TokenKind::Then)?;
        self.fs().go_if_true(&mut cond, line)?;
        self.block()?;
        if matches!(self.tok.kind, TokenKind::Elseif | TokenKind::Else) {
            let line = self.line();
            let fs = self.fs();
            let jump = fs.jump(line) as i32;
            fs.concat_jump(escape, jump);
        }
        self.fs().patch_to_here(cond.false_list);
        Ok(())
    }

    fn while_stat(&mut self) -> LunoResult<()> {
        let line = self.line();
        self.advance()?;
        let top = self.fs().pc();
        let mut cond = self.expr()?;
        self.fs().go_if_true(&mut cond, line)?;
        self.expect(TokenKind::Do)?;
        self.fs().enter_block(true);
        self.stat_list()?;
        self.check_match(TokenKind::End, "while", line)?;
        let end_line = self.last_line;
        let fs = self.fs();
        let block = fs.leave_block(end_line)?;
        fs.jump_to(top, end_line);
        fs.patch_to_here(cond.false_list);
        fs.patch_to_here(block.break_list);
        fs.patch_list(block.continue_list, top);
        Ok(())
    }

    fn repeat_stat(&mut self) -> LunoResult<()> {
        let line = self.line();
        self.advance()?;
        let top = self.fs().pc();
        self.fs().enter_block(true);
        // Inner scope: body locals stay visible in the until condition.
        self.fs().enter_block(false);
        self.stat_list()?;
        self.check_match(TokenKind::Until, "repeat", line)?;
        let cond_pc = self.fs().pc();
        let cond_line = self.line();
        let mut cond = self.expr()?;
        // Fall through when false (loop again); jump out when true.
        self.fs().go_if_false(&mut cond, cond_line)?;
        let fs = self.fs();
        let inner_first = fs.blocks.last().map(|b| b.first_local).unwrap_or(0);
        let inner_upval = fs.blocks.last().map(|b| b.has_upval).unwrap_or(false);
        fs.leave_block(cond_line)?;
        fs.jump_to(top, cond_line);
        fs.patch_to_here(cond.true_list);
        if inner_upval {
            // The exit path skipped the close emitted on the back edge.
            fs.emit(Instr::CloseUpvals { from: inner_first }, cond_line);
        }
        let block = fs.leave_block(cond_line)?;
        fs.patch_to_here(block.break_list);
        fs.patch_list(block.continue_list, cond_pc);
        Ok(())
    }

    fn for_stat(&mut self) -> LunoResult<()> {
        let line = self.line();
        self.advance()?;
        let (name, span) = self.expect_name()?;
        match self.tok.kind {
            TokenKind::Equal => self.for_num(name, span, line),
            TokenKind::Comma | TokenKind::In => self.for_in(name, span, line),
            _ => Err(self.error_here("'=' or 'in' expected in 'for'")),
        }
    }

    /// `for v = init, limit [, step] do body end`
    fn for_num(&mut self, name: Arc<str>, span: Span, line: u32) -> LunoResult<()> {
        let base = self.fs().free_reg;
        self.advance()?; // '='
        let mut init = self.expr()?;
        self.fs().exp_to_next_reg(&mut init, line)?;
        self.expect(TokenKind::Comma)?;
        let mut limit = self.expr()?;
        self.fs().exp_to_next_reg(&mut limit, line)?;
        if self.test_next(&TokenKind::Comma)? {
            let mut step = self.expr()?;
            self.fs().exp_to_next_reg(&mut step, line)?;
        } else {
            let mut one = ExpDesc::new(ExpKind::KInt(1), span);
            self.fs().exp_to_next_reg(&mut one, line)?;
        }
        self.expect(TokenKind::Do)?;
        let fs = self.fs();
        fs.enter_block(true);
        fs.new_local(Arc::from("(for init)"), span)?;
        fs.new_local(Arc::from("(for limit)"), span)?;
        fs.new_local(Arc::from("(for step)"), span)?;
        let prep = fs.emit(Instr::ForPrep { base, offset: NO_JUMP }, line);
        let body_start = fs.pc();
        // The control variable lives in a per-iteration scope so each
        // closure made in the body captures a fresh cell.
        fs.enter_block(false);
        fs.new_local(name, span)?;
        fs.reserve_regs(1, span)?;
        self.stat_list()?;
        self.check_match(TokenKind::End, "for", line)?;
        let end_line = self.last_line;
        let fs = self.fs();
        fs.leave_block(end_line)?;
        let loop_pc = fs.emit(Instr::ForLoop { base, offset: NO_JUMP }, end_line);
        fs.patch_jump(loop_pc, body_start);
        fs.patch_jump(prep, loop_pc);
        let block = fs.leave_block(end_line)?;
        fs.patch_to_here(block.break_list);
        fs.patch_list(block.continue_list, loop_pc);
        Ok(())
    }

    /// `for v1, v2, ... in explist do body end`
    fn for_in(&mut self, first: Arc<str>, span: Span, line: u32) -> LunoResult<()> {
        let base = self.fs().free_reg;
        let mut names = vec![(first, span)];
        while self.test_next(&TokenKind::Comma)? {
            names.push(self.expect_name()?);
        }
        self.expect(TokenKind::In)?;
        let nvars = names.len();
        let (nexps, mut last) = self.exp_list()?;
        self.adjust_assign(3, nexps, &mut last, line)?;
        self.expect(TokenKind::Do)?;
        let fs = self.fs();
        fs.enter_block(true);
        fs.new_local(Arc::from("(for generator)"), span)?;
        fs.new_local(Arc::from("(for state)"), span)?;
        fs.new_local(Arc::from("(for control)"), span)?;
        // The iterator call runs in a scratch window above the loop vars.
        let window = base as u16 + 3 + (nvars as u16).max(3) + 3;
        if window > fs.max_stack as u16 {
            fs.max_stack = window.min(u8::MAX as u16) as u8;
        }
        let prep = fs.jump(line);
        let body_start = fs.pc();
        fs.enter_block(false);
        for (name, span) in names {
            let fs = self.fs();
            fs.new_local(name, span)?;
            fs.reserve_regs(1, span)?;
        }
        self.stat_list()?;
        self.check_match(TokenKind::End, "for", line)?;
        let end_line = self.last_line;
        let fs = self.fs();
        fs.leave_block(end_line)?;
        fs.patch_to_here(prep as i32);
        let tfor_pc = fs.pc();
        fs.emit(
            Instr::TForCall { base, nresults: nvars as u8 },
            end_line,
        );
        let loop_pc = fs.emit(Instr::TForLoop { base, offset: NO_JUMP }, end_line);
        fs.patch_jump(loop_pc, body_start);
        let block = fs.leave_block(end_line)?;
        fs.patch_to_here(block.break_list);
        fs.patch_list(block.continue_list, tfor_pc);
        Ok(())
    }

    /// `function Name{.Name}[:Name] body`
    fn func_stat(&mut self) -> LunoResult<()> {
        let line = self.line();
        self.advance()?;
        let (first, span) = self.expect_name()?;
        let mut full_name = first.to_string();
        let mut var = self.single_var(first, span)?;
        let mut is_method = false;
        loop {
            if self.test_next(&TokenKind::Dot)? {
                let (field, fspan) = self.expect_name()?;
                full_name.push('.');
                full_name.push_str(&field);
                let mut key = ExpDesc::new(ExpKind::KStr(field), fspan);
                self.fs().indexed(&mut var, &mut key, line)?;
            } else if self.test_next(&TokenKind::Colon)? {
                let (field, fspan) = self.expect_name()?;
                full_name.push(':');
                full_name.push_str(&field);
                let mut key = ExpDesc::new(ExpKind::KStr(field), fspan);
                self.fs().indexed(&mut var, &mut key, line)?;
                is_method = true;
                break;
            } else {
                break;
            }
        }
        let mut body = self.function_body(is_method, full_name, line)?;
        self.fs().store_var(&var, &mut body, line)?;
        Ok(())
    }

    fn local_stat(&mut self) -> LunoResult<()> {
        let line = self.line();
        self.advance()?;
        if self.test_next(&TokenKind::Function)? {
            // The name is in scope inside the body, so recursion works.
            let (name, span) = self.expect_name()?;
            let fs = self.fs();
            let reg = fs.new_local(name.clone(), span)?;
            fs.reserve_regs(1, span)?;
            let mut body = self.function_body(false, name.to_string(), line)?;
            self.fs().exp_to_reg(&mut body, reg, line);
            return Ok(());
        }
        let mut names = vec![self.expect_name()?];
        while self.test_next(&TokenKind::Comma)? {
            names.push(self.expect_name()?);
        }
        let (nexps, mut last) = if self.test_next(&TokenKind::Equal)? {
            self.exp_list()?
        } else {
            (0, ExpDesc::new(ExpKind::Void, self.span()))
        };
        self.adjust_assign(names.len(), nexps, &mut last, line)?;
        // Activate only now: initializers see the enclosing bindings.
        for (name, span) in names {
            self.fs().new_local(name, span)?;
        }
        Ok(())
    }

    fn ret_stat(&mut self) -> LunoResult<()> {
        let line = self.line();
        self.advance()?;
        let flagged = *self.flags.last().expect("flag stack");
        let first = self.fs().free_reg;
        if flagged {
            // Protected bodies return a leading marker so the caller can
            // tell an explicit return from falling off the end.
            let mut marker = ExpDesc::new(ExpKind::True, self.span());
            self.fs().exp_to_next_reg(&mut marker, line)?;
        }
        let count = if self.tok.kind.is_block_follow() || self.check(&TokenKind::Semicolon) {
            if flagged {
                1
            } else {
                0
            }
        } else {
            let (nexps, mut last) = self.exp_list()?;
            if last.is_multi() {
                self.fs().set_returns(&last, -1, last.span)?;
                -1
            } else {
                self.fs().exp_to_next_reg(&mut last, line)?;
                nexps as i32 + flagged as i32
            }
        };
        let encoded = if count < 0 { 0 } else { count as u8 + 1 };
        self.fs().emit(Instr::Return { base: first, count: encoded }, line);
        self.test_next(&TokenKind::Semicolon)?;
        Ok(())
    }

    fn break_stat(&mut self, is_continue: bool) -> LunoResult<()> {
        let line = self.line();
        self.advance()?;
        let what = if is_continue { "continue" } else { "break" };
        let fs = self.fs();
        let loop_idx = match fs.current_loop() {
            Some(idx) => idx,
            None => return Err(self.error_here(format!("'{}' outside a loop", what))),
        };
        let fs = self.fs();
        let needs_close = fs.blocks[loop_idx..].iter().any(|b| b.has_upval);
        let from = fs.blocks[loop_idx].first_local;
        if needs_close {
            fs.emit(Instr::CloseUpvals { from }, line);
        }
        let jump = fs.jump(line) as i32;
        let mut list = if is_continue {
            fs.blocks[loop_idx].continue_list
        } else {
            fs.blocks[loop_idx].break_list
        };
        fs.concat_jump(&mut list, jump);
        if is_continue {
            fs.blocks[loop_idx].continue_list = list;
        } else {
            fs.blocks[loop_idx].break_list = list;
        }
        Ok(())
    }

    fn goto_stat(&mut self) -> LunoResult<()> {
        let line = self.line();
        self.advance()?;
        let (name, span) = self.expect_name()?;
        self.fs().emit_goto(name, span, line)
    }

    /// `::name::`
    fn label_stat(&mut self) -> LunoResult<()> {
        self.advance()?;
        let (name, span) = self.expect_name()?;
        self.expect(TokenKind::DoubleColon)?;
        self.fs().define_label(name, span)
    }

    /// `defer body end`: the body becomes a closure run when the
    /// enclosing function exits, latest first. It receives the in-flight
    /// error (or nil) as `err`.
    fn defer_stat(&mut self) -> LunoResult<()> {
        let line = self.line();
        self.advance()?;
        let mut body = self.inline_closure("defer", Some(Arc::from("err")), false, line)?;
        self.check_match(TokenKind::End, "defer", line)?;
        self.fs().exp_to_next_reg(&mut body, line)?;
        let src = match body.kind {
            ExpKind::NonReloc(r) => r,
            _ => unreachable!(),
        };
        self.fs().emit(Instr::Defer { src }, line);
        Ok(())
    }

    /// `try body [catch [(]name[)] body] [finally body] end`
    fn try_stat(&mut self) -> LunoResult<()> {
        let line = self.line();
        self.advance()?;
        let base = self.fs().free_reg;
        let mut try_body = self.inline_closure("try", None, true, line)?;
        self.fs().exp_to_next_reg(&mut try_body, line)?;
        let mut catch_reg = NO_REG;
        let mut fin_reg = NO_REG;
        if self.check(&TokenKind::Catch) {
            let catch_line = self.line();
            self.advance()?;
            let parens = self.test_next(&TokenKind::LeftParen)?;
            let param = if matches!(self.tok.kind, TokenKind::Name(_)) {
                Some(self.expect_name()?.0)
            } else {
                None
            };
            if parens {
                self.expect(TokenKind::RightParen)?;
            }
            let param = param.unwrap_or_else(|| Arc::from("(error)"));
            let mut body = self.inline_closure("catch", Some(param), true, catch_line)?;
            self.fs().exp_to_next_reg(&mut body, catch_line)?;
            catch_reg = base + 1;
        }
        if self.check(&TokenKind::Finally) {
            let fin_line = self.line();
            self.advance()?;
            let mut body = self.inline_closure("finally", None, true, fin_line)?;
            self.fs().exp_to_next_reg(&mut body, fin_line)?;
            let fs = self.fs();
            fin_reg = fs.free_reg - 1;
        }
        self.check_match(TokenKind::End, "try", line)?;
        self.fs().emit(
            Instr::TryCall { try_reg: base, catch_reg, fin_reg },
            line,
        );
        Ok(())
    }

    /// `switch exp case e1, e2 then body ... default body end`
    /// (`when` is an accepted synonym for `switch`.)
    fn switch_stat(&mut self) -> LunoResult<()> {
        let line = self.line();
        self.advance()?;
        let mut subject = self.expr()?;
        self.fs().exp_to_next_reg(&mut subject, line)?;
        let sreg = match subject.kind {
            ExpKind::NonReloc(r) => r,
            _ => unreachable!(),
        };
        let mut exits = NO_JUMP;
        if !matches!(self.tok.kind, TokenKind::Case | TokenKind::Default | TokenKind::End) {
            return Err(self.error_here("'case' expected after switch subject"));
        }
        while self.check(&TokenKind::Case) {
            let case_line = self.line();
            self.advance()?;
            let mut body_list = NO_JUMP;
            loop {
                let save = self.fs().free_reg;
                let mut label = self.expr()?;
                let rk = self.fs().exp_to_rk(&mut label, case_line)?;
                let fs = self.fs();
                fs.emit(
                    Instr::Cmp { op: CmpOp::Eq, expect: true, lhs: sreg as RK, rhs: rk },
                    case_line,
                );
                let jump = fs.jump(case_line) as i32;
                fs.concat_jump(&mut body_list, jump);
                fs.free_reg = save;
                if !self.test_next(&TokenKind::Comma)? {
                    break;
                }
            }
            self.expect(TokenKind::Then)?;
            // No label matched: skip this body.
            let miss = self.fs().jump(case_line) as i32;
            self.fs().patch_to_here(body_list);
            self.block()?;
            let fs = self.fs();
            let done = fs.jump(case_line) as i32;
            fs.concat_jump(&mut exits, done);
            fs.patch_to_here(miss);
        }
        if self.test_next(&TokenKind::Default)? {
            self.block()?;
        }
        self.check_match(TokenKind::End, "switch", line)?;
        self.fs().patch_to_here(exits);
        Ok(())
    }

    /// `import "a.b.Class"`, `import Alias "a.b.Class"`, `import "a.b.*"`
    fn import_stat(&mut self) -> LunoResult<()> {
        let line = self.line();
        self.advance()?;
        let alias = if matches!(self.tok.kind, TokenKind::Name(_)) {
            Some(self.expect_name()?.0)
        } else {
            None
        };
        let (path, span) = match self.tok.kind.clone() {
            TokenKind::Str(path) => {
                let span = self.tok.span;
                self.advance()?;
                (path, span)
            }
            _ => return Err(self.error_here("import path string expected")),
        };
        if path.ends_with('*') {
            if alias.is_some() {
                return Err(self.error_here("cannot alias a package import"));
            }
            let fs = self.fs();
            let k = fs.const_str(path);
            fs.emit(Instr::ImportPkg { k }, line);
            return Ok(());
        }
        let bind = alias.unwrap_or_else(|| last_segment(&path));
        let fs = self.fs();
        let k = fs.const_str(path);
        let pc = fs.emit(Instr::Import { dst: 0, k }, line);
        fs.new_local(bind, span)?;
        let mut value = ExpDesc::new(ExpKind::Reloc(pc), span);
        fs.exp_to_next_reg(&mut value, line)?;
        Ok(())
    }

    /// `module Name` or `module "a.b.name"`: binds the module's table
    /// (shared per VM) to a local named by the last path segment.
    fn module_stat(&mut self) -> LunoResult<()> {
        let line = self.line();
        self.advance()?;
        let (path, span) = match self.tok.kind.clone() {
            TokenKind::Str(path) => {
                let span = self.tok.span;
                self.advance()?;
                (path, span)
            }
            TokenKind::Name(name) => {
                let span = self.tok.span;
                self.advance()?;
                (name, span)
            }
            _ => return Err(self.error_here("module name expected")),
        };
        let bind = last_segment(&path);
        let fs = self.fs();
        let k = fs.const_str(path);
        let pc = fs.emit(Instr::Module { dst: 0, k }, line);
        fs.new_local(bind, span)?;
        let mut value = ExpDesc::new(ExpKind::Reloc(pc), span);
        fs.exp_to_next_reg(&mut value, line)?;
        Ok(())
    }

    /// Assignment or a bare call.
    fn expr_stat(&mut self) -> LunoResult<()> {
        let line = self.line();
        let first = self.suffixed_exp()?;
        if matches!(self.tok.kind, TokenKind::Equal | TokenKind::Comma) {
            let mut targets = vec![first];
            while self.test_next(&TokenKind::Comma)? {
                targets.push(self.suffixed_exp()?);
            }
            self.expect(TokenKind::Equal)?;
            for target in &targets {
                if !matches!(
                    target.kind,
                    ExpKind::Local(_)
                        | ExpKind::Upval(_)
                        | ExpKind::Global(_)
                        | ExpKind::Indexed { .. }
                ) {
                    return Err(LunoError::syntax_error(
                        "cannot assign to this expression",
                        target.span,
                        self.lexer.file().to_string(),
                    ));
                }
            }
            let vstart = self.fs().free_reg;
            let (nexps, mut last) = self.exp_list()?;
            self.adjust_assign(targets.len(), nexps, &mut last, line)?;
            for (i, target) in targets.iter().enumerate().rev() {
                let reg = vstart + i as u8;
                let mut value = ExpDesc::new(ExpKind::NonReloc(reg), target.span);
                self.fs().store_var(target, &mut value, line)?;
            }
            Ok(())
        } else {
            match first.kind {
                ExpKind::Call(pc) => {
                    // Statement-level call: discard all results.
                    if let Instr::Call { nresults, .. } = &mut self.fs().code[pc] {
                        *nresults = 1;
                    }
                    Ok(())
                }
                _ => Err(self.error_here("syntax error near unexpected expression")),
            }
        }
    }

    // ---- expressions ---------------------------------------------------

    fn expr(&mut self) -> LunoResult<ExpDesc> {
        self.sub_expr(0)
    }

    fn sub_expr(&mut self, limit: u8) -> LunoResult<ExpDesc> {
        let line = self.line();
        let mut left = if let Some(op) = unary_op(&self.tok.kind) {
            self.advance()?;
            let mut operand = self.sub_expr(UNARY_PRIORITY)?;
            self.fs().prefix(op, &mut operand, line)?;
            operand
        } else {
            self.simple_exp()?
        };
        while let Some((op, lprio, rprio)) = binary_op(&self.tok.kind) {
            if lprio <= limit {
                break;
            }
            let op_line = self.line();
            self.advance()?;
            self.fs().infix(op, &mut left, op_line)?;
            let mut right = self.sub_expr(rprio)?;
            self.fs().posfix(op, &mut left, &mut right, op_line)?;
        }
        Ok(left)
    }

    fn simple_exp(&mut self) -> LunoResult<ExpDesc> {
        let span = self.span();
        let line = self.line();
        let kind = match self.tok.kind.clone() {
            TokenKind::Int(n) => ExpKind::KInt(n),
            TokenKind::Float(n) => ExpKind::KFlt(n),
            TokenKind::Str(s) => ExpKind::KStr(s),
            TokenKind::Nil => ExpKind::Nil,
            TokenKind::True => ExpKind::True,
            TokenKind::False => ExpKind::False,
            TokenKind::Ellipsis => {
                if !self.fs().is_vararg {
                    return Err(self.error_here("cannot use '...' outside a vararg function"));
                }
                self.advance()?;
                let pc = self.fs().emit(Instr::Vararg { dst: 0, count: 0 }, line);
                return Ok(ExpDesc::new(ExpKind::Vararg(pc), span));
            }
            TokenKind::Function => {
                self.advance()?;
                return self.function_body(false, "anonymous".into(), line);
            }
            TokenKind::LeftBrace => return self.table_constructor(),
            TokenKind::LeftBracket => return self.list_constructor(),
            _ => return self.suffixed_exp(),
        };
        self.advance()?;
        Ok(ExpDesc::new(kind, span))
    }

    fn primary_exp(&mut self) -> LunoResult<ExpDesc> {
        match self.tok.kind.clone() {
            TokenKind::LeftParen => {
                let line = self.line();
                self.advance()?;
                let mut inner = self.expr()?;
                self.check_match(TokenKind::RightParen, "(", line)?;
                // Parentheses truncate multiple results to one.
                self.fs().discharge_vars(&mut inner, line);
                Ok(inner)
            }
            TokenKind::Name(name) => {
                let span = self.tok.span;
                self.advance()?;
                self.single_var(name, span)
            }
            _ => Err(self.error_here(format!("unexpected symbol near '{}'", self.tok))),
        }
    }

    fn suffixed_exp(&mut self) -> LunoResult<ExpDesc> {
        let mut exp = self.primary_exp()?;
        loop {
            let line = self.line();
            match self.tok.kind.clone() {
                TokenKind::Dot => {
                    self.advance()?;
                    let (field, fspan) = self.expect_name()?;
                    let mut key = ExpDesc::new(ExpKind::KStr(field), fspan);
                    self.fs().indexed(&mut exp, &mut key, line)?;
                }
                TokenKind::LeftBracket => {
                    self.advance()?;
                    let mut key = self.expr()?;
                    self.fs().exp_to_val(&mut key, line)?;
                    self.check_match(TokenKind::RightBracket, "[", line)?;
                    self.fs().indexed(&mut exp, &mut key, line)?;
                }
                TokenKind::Colon => {
                    self.advance()?;
                    let (method, mspan) = self.expect_name()?;
                    let mut key = ExpDesc::new(ExpKind::KStr(method), mspan);
                    self.fs().self_exp(&mut exp, &mut key, line)?;
                    self.finish_call(&mut exp, line)?;
                }
                TokenKind::LeftParen | TokenKind::Str(_) | TokenKind::LeftBrace => {
                    self.fs().exp_to_next_reg(&mut exp, line)?;
                    self.finish_call(&mut exp, line)?;
                }
                _ => break,
            }
        }
        Ok(exp)
    }

    /// Parse call arguments for a callee already at the top of the
    /// register window; leaves an open Call expression.
    fn finish_call(&mut self, exp: &mut ExpDesc, line: u32) -> LunoResult<()> {
        let base = match exp.kind {
            ExpKind::NonReloc(r) => r,
            _ => unreachable!("callee not in a register"),
        };
        let span = exp.span;
        let mut open = false;
        match self.tok.kind.clone() {
            TokenKind::LeftParen => {
                self.advance()?;
                if self.check(&TokenKind::RightParen) {
                    self.advance()?;
                } else {
                    let (_, mut last) = self.exp_list()?;
                    if last.is_multi() {
                        self.fs().set_returns(&last, -1, last.span)?;
                        open = true;
                    } else {
                        self.fs().exp_to_next_reg(&mut last, line)?;
                    }
                    self.check_match(TokenKind::RightParen, "(", line)?;
                }
            }
            TokenKind::Str(s) => {
                let sspan = self.tok.span;
                self.advance()?;
                let mut arg = ExpDesc::new(ExpKind::KStr(s), sspan);
                self.fs().exp_to_next_reg(&mut arg, line)?;
            }
            TokenKind::LeftBrace => {
                self.table_constructor()?;
            }
            _ => return Err(self.error_here("function arguments expected")),
        }
        let fs = self.fs();
        let nargs = if open { 0 } else { fs.free_reg - (base + 1) + 1 };
        let pc = fs.emit(Instr::Call { base, nargs, nresults: 2 }, line);
        fs.free_reg = base + 1;
        *exp = ExpDesc::new(ExpKind::Call(pc), span);
        Ok(())
    }

    /// Comma-separated expressions; all but the last are pushed to
    /// consecutive registers. Returns the count and the unfinished last.
    fn exp_list(&mut self) -> LunoResult<(usize, ExpDesc)> {
        let mut count = 1;
        let mut exp = self.expr()?;
        while self.test_next(&TokenKind::Comma)? {
            let line = self.last_line;
            self.fs().exp_to_next_reg(&mut exp, line)?;
            exp = self.expr()?;
            count += 1;
        }
        Ok((count, exp))
    }

    /// Balance `nvars` assignment targets against `nexps` values,
    /// spreading or padding the last expression.
    fn adjust_assign(
        &mut self,
        nvars: usize,
        nexps: usize,
        last: &mut ExpDesc,
        line: u32,
    ) -> LunoResult<()> {
        let extra = nvars as i32 - nexps as i32;
        if last.is_multi() {
            let wanted = (extra + 1).max(0);
            self.fs().set_returns(last, wanted, last.span)?;
            if wanted > 1 {
                self.fs().reserve_regs(wanted as u8 - 1, last.span)?;
            }
        } else {
            if !matches!(last.kind, ExpKind::Void) {
                self.fs().exp_to_next_reg(last, line)?;
            }
            if extra > 0 {
                let fs = self.fs();
                let dst = fs.free_reg;
                fs.reserve_regs(extra as u8, last.span)?;
                fs.emit(Instr::LoadNil { dst, count: extra as u8 }, line);
            }
        }
        if nexps > nvars {
            self.fs().free_reg -= (nexps - nvars) as u8;
        }
        Ok(())
    }

    fn single_var(&mut self, name: Arc<str>, span: Span) -> LunoResult<ExpDesc> {
        let top = self.funcs.len() - 1;
        let kind = match self.resolve_var(top, &name, span)? {
            Some(VarPlace::Local(reg)) => ExpKind::Local(reg),
            Some(VarPlace::Upval(idx)) => ExpKind::Upval(idx),
            None => {
                let k = self.fs().const_str(name);
                ExpKind::Global(k)
            }
        };
        Ok(ExpDesc::new(kind, span))
    }

    /// Find `name` in function `level` or any enclosing one, threading
    /// upvalue descriptors down through intermediate functions.
    fn resolve_var(
        &mut self,
        level: usize,
        name: &Arc<str>,
        span: Span,
    ) -> LunoResult<Option<VarPlace>> {
        if let Some(reg) = self.funcs[level].resolve_local(name) {
            return Ok(Some(VarPlace::Local(reg)));
        }
        if level == 0 {
            return Ok(None);
        }
        match self.resolve_var(level - 1, name, span)? {
            None => Ok(None),
            Some(VarPlace::Local(reg)) => {
                self.funcs[level - 1].mark_upvalue(reg);
                let idx = self.funcs[level].add_upvalue(name.clone(), true, reg, span)?;
                Ok(Some(VarPlace::Upval(idx)))
            }
            Some(VarPlace::Upval(outer)) => {
                let idx = self.funcs[level].add_upvalue(name.clone(), false, outer, span)?;
                Ok(Some(VarPlace::Upval(idx)))
            }
        }
    }

    // ---- function bodies -----------------------------------------------

    /// `(params) body end` after the `function` keyword.
    fn function_body(
        &mut self,
        is_method: bool,
        name: String,
        line: u32,
    ) -> LunoResult<ExpDesc> {
        let span = self.span();
        self.funcs
            .push(FuncState::new(self.source.clone(), name, line));
        self.flags.push(false);
        self.fs().enter_block(false);
        if is_method {
            let fs = self.fs();
            fs.new_local(Arc::from("self"), span)?;
            fs.reserve_regs(1, span)?;
            fs.param_count += 1;
        }
        self.expect(TokenKind::LeftParen)?;
        if !self.check(&TokenKind::RightParen) {
            loop {
                match self.tok.kind.clone() {
                    TokenKind::Name(param) => {
                        let pspan = self.tok.span;
                        self.advance()?;
                        let fs = self.fs();
                        fs.new_local(param, pspan)?;
                        fs.reserve_regs(1, pspan)?;
                        fs.param_count += 1;
                    }
                    TokenKind::Ellipsis => {
                        self.advance()?;
                        self.fs().is_vararg = true;
                        break;
                    }
                    _ => return Err(self.error_here("parameter name expected")),
                }
                if !self.test_next(&TokenKind::Comma)? {
                    break;
                }
            }
        }
        self.expect(TokenKind::RightParen)?;
        self.stat_list()?;
        self.check_match(TokenKind::End, "function", line)?;
        self.close_function(span, line)
    }

    /// A statement body compiled as an anonymous closure (try, catch,
    /// finally, defer). The caller consumes the terminator.
    fn inline_closure(
        &mut self,
        name: &str,
        param: Option<Arc<str>>,
        flagged: bool,
        line: u32,
    ) -> LunoResult<ExpDesc> {
        let span = self.span();
        self.funcs
            .push(FuncState::new(self.source.clone(), name.to_string(), line));
        self.flags.push(flagged);
        self.fs().enter_block(false);
        if let Some(param) = param {
            let fs = self.fs();
            fs.new_local(param, span)?;
            fs.reserve_regs(1, span)?;
            fs.param_count += 1;
        }
        self.stat_list()?;
        self.close_function(span, line)
    }

    fn close_function(&mut self, span: Span, line: u32) -> LunoResult<ExpDesc> {
        let end_line = self.last_line;
        self.fs().leave_block(end_line)?;
        let done = self.funcs.pop().expect("function stack");
        self.flags.pop();
        let proto = Arc::new(done.finish(end_line)?);
        let fs = self.fs();
        let index = fs.protos.len() as u16;
        fs.protos.push(proto);
        let pc = fs.emit(Instr::Closure { dst: 0, proto: index }, line);
        Ok(ExpDesc::new(ExpKind::Reloc(pc), span))
    }

    // ---- constructors --------------------------------------------------

    /// `{ [k] = v, name = v, item, ... }`
    fn table_constructor(&mut self) -> LunoResult<ExpDesc> {
        let line = self.line();
        let span = self.span();
        self.expect(TokenKind::LeftBrace)?;
        let pc = self.fs().emit(Instr::NewTable { dst: 0, hint: 0 }, line);
        let mut table = ExpDesc::new(ExpKind::Reloc(pc), span);
        self.fs().exp_to_next_reg(&mut table, line)?;
        let treg = match table.kind {
            ExpKind::NonReloc(r) => r,
            _ => unreachable!(),
        };
        let mut array_count: u32 = 0;
        let mut pending: u32 = 0;
        let mut delayed: Option<ExpDesc> = None;
        while !self.check(&TokenKind::RightBrace) {
            // Materialize the previous item before parsing another field.
            if let Some(mut item) = delayed.take() {
                let item_line = self.last_line;
                self.fs().exp_to_next_reg(&mut item, item_line)?;
                pending += 1;
                if pending == FIELDS_PER_FLUSH {
                    let fs = self.fs();
                    fs.emit(
                        Instr::SetList { table: treg, start: array_count + 1, count: pending as u8 },
                        item_line,
                    );
                    array_count += pending;
                    pending = 0;
                    fs.free_reg = treg + 1;
                }
            }
            let field_line = self.line();
            let keyed = match self.tok.kind.clone() {
                TokenKind::LeftBracket => {
                    self.advance()?;
                    let mut key = self.expr()?;
                    self.check_match(TokenKind::RightBracket, "[", field_line)?;
                    self.expect(TokenKind::Equal)?;
                    Some(self.fs().exp_to_rk(&mut key, field_line)?)
                }
                TokenKind::Name(name) => {
                    if matches!(self.lexer.peek()?.kind, TokenKind::Equal) {
                        let kspan = self.tok.span;
                        self.advance()?; // name
                        self.advance()?; // '='
                        let mut key = ExpDesc::new(ExpKind::KStr(name), kspan);
                        Some(self.fs().exp_to_rk(&mut key, field_line)?)
                    } else {
                        None
                    }
                }
                _ => None,
            };
            match keyed {
                Some(key_rk) => {
                    let mut value = self.expr()?;
                    let val_rk = self.fs().exp_to_rk(&mut value, field_line)?;
                    let fs = self.fs();
                    fs.emit(
                        Instr::SetIndex { obj: treg, key: key_rk, val: val_rk },
                        field_line,
                    );
                    fs.free_reg = treg + 1 + pending as u8;
                }
                None => {
                    delayed = Some(self.expr()?);
                }
            }
            if !self.test_next(&TokenKind::Comma)? && !self.test_next(&TokenKind::Semicolon)? {
                break;
            }
        }
        self.check_match(TokenKind::RightBrace, "{", line)?;
        self.flush_items(treg, &mut array_count, pending, delayed, line)?;
        if let Instr::NewTable { hint, .. } = &mut self.fs().code[pc] {
            *hint = array_count.min(u16::MAX as u32) as u16;
        }
        self.fs().free_reg = treg + 1;
        Ok(ExpDesc::new(ExpKind::NonReloc(treg), span))
    }

    /// `[ item, item, ... ]`
    fn list_constructor(&mut self) -> LunoResult<ExpDesc> {
        let line = self.line();
        let span = self.span();
        self.expect(TokenKind::LeftBracket)?;
        let pc = self.fs().emit(Instr::NewList { dst: 0, hint: 0 }, line);
        let mut list = ExpDesc::new(ExpKind::Reloc(pc), span);
        self.fs().exp_to_next_reg(&mut list, line)?;
        let lreg = match list.kind {
            ExpKind::NonReloc(r) => r,
            _ => unreachable!(),
        };
        let mut array_count: u32 = 0;
        let mut pending: u32 = 0;
        let mut delayed: Option<ExpDesc> = None;
        while !self.check(&TokenKind::RightBracket) {
            if let Some(mut item) = delayed.take() {
                let item_line = self.last_line;
                self.fs().exp_to_next_reg(&mut item, item_line)?;
                pending += 1;
                if pending == FIELDS_PER_FLUSH {
                    let fs = self.fs();
                    fs.emit(
                        Instr::SetList { table: lreg, start: array_count + 1, count: pending as u8 },
                        item_line,
                    );
                    array_count += pending;
                    pending = 0;
                    fs.free_reg = lreg + 1;
                }
            }
            delayed = Some(self.expr()?);
            if !self.test_next(&TokenKind::Comma)? && !self.test_next(&TokenKind::Semicolon)? {
                break;
            }
        }
        self.check_match(TokenKind::RightBracket, "[", line)?;
        self.flush_items(lreg, &mut array_count, pending, delayed, line)?;
        if let Instr::NewList { hint, .. } = &mut self.fs().code[pc] {
            *hint = array_count.min(u16::MAX as u32) as u16;
        }
        self.fs().free_reg = lreg + 1;
        Ok(ExpDesc::new(ExpKind::NonReloc(lreg), span))
    }

    /// Emit the trailing SetList for a constructor, spreading an open
    /// call or vararg in final position.
    fn flush_items(
        &mut self,
        reg: u8,
        array_count: &mut u32,
        mut pending: u32,
        delayed: Option<ExpDesc>,
        line: u32,
    ) -> LunoResult<()> {
        if let Some(mut item) = delayed {
            if item.is_multi() {
                // Open tail: one SetList covers the buffered items plus
                // everything the call or vararg produces.
                self.fs().set_returns(&item, -1, item.span)?;
                self.fs().emit(
                    Instr::SetList { table: reg, start: *array_count + 1, count: 0 },
                    line,
                );
                return Ok(());
            }
            self.fs().exp_to_next_reg(&mut item, line)?;
            pending += 1;
        }
        if pending > 0 {
            self.fs().emit(
                Instr::SetList { table: reg, start: *array_count + 1, count: pending as u8 },
                line,
            );
            *array_count += pending;
        }
        Ok(())
    }
}

/// Where a resolved variable lives relative to the current function.
enum VarPlace {
    Local(u8),
    Upval(u8),
}

fn unary_op(kind: &TokenKind) -> Option<UnOp> {
    match kind {
        TokenKind::Not => Some(UnOp::Not),
        TokenKind::Minus => Some(UnOp::Neg),
        TokenKind::Hash => Some(UnOp::Len),
        TokenKind::Tilde => Some(UnOp::BNot),
        _ => None,
    }
}

/// Operator with its left and right binding powers; right < left makes
/// the operator right-associative.
fn binary_op(kind: &TokenKind) -> Option<(BinOpKind, u8, u8)> {
    use ArithOp::*;
    Some(match kind {
        TokenKind::Or => (BinOpKind::Or, 1, 1),
        TokenKind::And => (BinOpKind::And, 2, 2),
        TokenKind::Less => (BinOpKind::Cmp(CmpOp::Lt, true, false), 3, 3),
        TokenKind::Greater => (BinOpKind::Cmp(CmpOp::Lt, true, true), 3, 3),
        TokenKind::LessEqual => (BinOpKind::Cmp(CmpOp::Le, true, false), 3, 3),
        TokenKind::GreaterEqual => (BinOpKind::Cmp(CmpOp::Le, true, true), 3, 3),
        TokenKind::EqualEqual => (BinOpKind::Cmp(CmpOp::Eq, true, false), 3, 3),
        TokenKind::NotEqual => (BinOpKind::Cmp(CmpOp::Eq, false, false), 3, 3),
        TokenKind::Pipe => (BinOpKind::Arith(BOr), 4, 4),
        TokenKind::Tilde => (BinOpKind::Arith(BXor), 5, 5),
        TokenKind::Ampersand => (BinOpKind::Arith(BAnd), 6, 6),
        TokenKind::Shl => (BinOpKind::Arith(Shl), 7, 7),
        TokenKind::Shr => (BinOpKind::Arith(Shr), 7, 7),
        TokenKind::Concat => (BinOpKind::Concat, 9, 8),
        TokenKind::Plus => (BinOpKind::Arith(Add), 10, 10),
        TokenKind::Minus => (BinOpKind::Arith(Sub), 10, 10),
        TokenKind::Star => (BinOpKind::Arith(Mul), 11, 11),
        TokenKind::Slash => (BinOpKind::Arith(Div), 11, 11),
        TokenKind::SlashSlash => (BinOpKind::Arith(IDiv), 11, 11),
        TokenKind::Percent => (BinOpKind::Arith(Mod), 11, 11),
        TokenKind::Caret => (BinOpKind::Arith(Pow), 14, 13),
        _ => return None,
    })
}

fn last_segment(path: &str) -> Arc<str> {
    Arc::from(path.rsplit('.').next().unwrap_or(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::proto::Constant;

    fn compile(src: &str) -> Arc<Prototype> {
        Parser::compile(src, "test.luno").expect("compiles")
    }

    fn compile_err(src: &str) -> LunoError {
        Parser::compile(src, "test.luno").expect_err("should fail")
    }

    #[test]
    fn empty_chunk_returns() {
        let proto = compile("");
        assert!(matches!(proto.code[0], Instr::Return { base: 0, count: 1 }));
    }

    #[test]
    fn constant_folding_reaches_the_pool() {
        let proto = compile("return 1 + 2 * 3");
        assert!(proto.constants.contains(&Constant::Int(7)));
    }

    #[test]
    fn division_folds_to_float() {
        let proto = compile("return 1 / 2");
        assert!(proto.constants.contains(&Constant::Float(0.5)));
    }

    #[test]
    fn floor_division_folds_to_int() {
        let proto = compile("return 7 // 2");
        assert!(proto.constants.contains(&Constant::Int(3)));
    }

    #[test]
    fn local_initializer_sees_outer_binding() {
        // `local x = x` reads the outer x, so it compiles to a global
        // read rather than reading the uninitialized slot.
        let proto = compile("local x = x");
        assert!(proto
            .code
            .iter()
            .any(|i| matches!(i, Instr::GetGlobal { .. })));
    }

    #[test]
    fn nested_function_captures_upvalue() {
        let proto = compile(
            "local x = 1\nlocal function get() return x end\nreturn get()",
        );
        let inner = &proto.protos[0];
        assert_eq!(inner.upvalues.len(), 1);
        assert!(inner.upvalues[0].in_stack);
        assert_eq!(&*inner.upvalues[0].name, "x");
    }

    #[test]
    fn deeply_nested_capture_threads_through() {
        let proto = compile(
            "local x = 1\nlocal function a()\n  local function b() return x end\n  return b\nend",
        );
        let a = &proto.protos[0];
        let b = &a.protos[0];
        assert!(a.upvalues[0].in_stack);
        assert!(!b.upvalues[0].in_stack, "middle function relays the upvalue");
    }

    #[test]
    fn break_outside_loop_rejected() {
        let err = compile_err("break");
        assert!(err.message.contains("outside a loop"));
    }

    #[test]
    fn vararg_outside_vararg_function_rejected() {
        let err = compile_err("local f = function(a) return ... end");
        assert!(err.message.contains("'...'"));
    }

    #[test]
    fn main_chunk_accepts_vararg() {
        compile("local args = { ... }");
    }

    #[test]
    fn goto_into_scope_rejected() {
        let err = compile_err("goto skip\nlocal x = 1\n::skip::\nreturn x");
        assert!(err.message.contains("jumps into the scope"));
    }

    #[test]
    fn goto_backward_allowed() {
        compile("::top::\nlocal x = 1\ndo goto out end\ngoto top\n::out::");
    }

    #[test]
    fn unmatched_goto_rejected() {
        let err = compile_err("goto nowhere");
        assert!(err.message.contains("no visible label"));
    }

    #[test]
    fn switch_compiles_with_comparison_chain() {
        let proto = compile(
            "switch 2 case 1 then return \"a\" case 2, 3 then return \"b\" default return \"c\" end",
        );
        let cmps = proto
            .code
            .iter()
            .filter(|i| matches!(i, Instr::Cmp { op: CmpOp::Eq, .. }))
            .count();
        assert_eq!(cmps, 3);
    }

    #[test]
    fn try_catch_emits_trycall() {
        let proto = compile("try return 1 catch e return e end");
        let tc = proto
            .code
            .iter()
            .find_map(|i| match i {
                Instr::TryCall { try_reg, catch_reg, fin_reg } => {
                    Some((*try_reg, *catch_reg, *fin_reg))
                }
                _ => None,
            })
            .expect("TryCall emitted");
        assert_eq!(tc.2, NO_REG, "no finally");
        assert_ne!(tc.1, NO_REG, "catch present");
        // Both bodies are child prototypes.
        assert_eq!(proto.protos.len(), 2);
    }

    #[test]
    fn try_bodies_flag_explicit_returns() {
        let proto = compile("try return 7 end");
        let body = &proto.protos[0];
        // Explicit return carries the marker plus the value.
        let ret = body
            .code
            .iter()
            .find(|i| matches!(i, Instr::Return { count: 3, .. }));
        assert!(ret.is_some(), "return true, 7");
    }

    #[test]
    fn defer_emits_closure_and_defer() {
        let proto = compile("defer print(err) end\nreturn 1");
        assert!(proto.code.iter().any(|i| matches!(i, Instr::Defer { .. })));
        assert_eq!(proto.protos[0].param_count, 1, "defer body takes err");
    }

    #[test]
    fn import_binds_last_segment() {
        let proto = compile("import \"java.util.HashMap\"\nreturn HashMap");
        assert!(proto.code.iter().any(|i| matches!(i, Instr::Import { .. })));
        // The binding is a local, so the return reads no global.
        let globals = proto
            .code
            .iter()
            .filter(|i| matches!(i, Instr::GetGlobal { .. }))
            .count();
        assert_eq!(globals, 0);
    }

    #[test]
    fn package_import_cannot_be_aliased() {
        let err = compile_err("import Maps \"java.util.*\"");
        assert!(err.message.contains("alias"));
    }

    #[test]
    fn method_call_uses_selfget() {
        let proto = compile("local s = \"x\"\nreturn s:upper()");
        assert!(proto.code.iter().any(|i| matches!(i, Instr::SelfGet { .. })));
    }

    #[test]
    fn multiple_assignment_balances_values() {
        let proto = compile("local a, b, c = 1");
        // Two missing values are nil-filled in one instruction.
        assert!(proto
            .code
            .iter()
            .any(|i| matches!(i, Instr::LoadNil { count: 2, .. })));
    }

    #[test]
    fn numeric_for_allocates_control_registers() {
        let proto = compile("local sum = 0\nfor i = 1, 10 do sum = sum + i end\nreturn sum");
        assert!(proto.code.iter().any(|i| matches!(i, Instr::ForPrep { .. })));
        assert!(proto.code.iter().any(|i| matches!(i, Instr::ForLoop { .. })));
    }

    #[test]
    fn generic_for_emits_iterator_protocol() {
        let proto = compile("for k, v in pairs(t) do print(k, v) end");
        assert!(proto
            .code
            .iter()
            .any(|i| matches!(i, Instr::TForCall { nresults: 2, .. })));
        assert!(proto.code.iter().any(|i| matches!(i, Instr::TForLoop { .. })));
    }

    #[test]
    fn list_constructor_uses_newlist() {
        let proto = compile("return [1, 2, 3]");
        assert!(proto
            .code
            .iter()
            .any(|i| matches!(i, Instr::NewList { hint: 3, .. })));
    }

    #[test]
    fn table_constructor_mixes_fields() {
        let proto = compile("return { 1, x = 2, [3] = 4, 5 }");
        assert!(proto.code.iter().any(|i| matches!(i, Instr::NewTable { .. })));
        let keyed = proto
            .code
            .iter()
            .filter(|i| matches!(i, Instr::SetIndex { .. }))
            .count();
        assert_eq!(keyed, 2);
        assert!(proto
            .code
            .iter()
            .any(|i| matches!(i, Instr::SetList { count: 2, .. })));
    }

    #[test]
    fn concat_chain_folds_into_one_instruction() {
        let proto = compile("return \"a\" .. \"b\" .. \"c\"");
        let concats = proto
            .code
            .iter()
            .filter(|i| matches!(i, Instr::Concat { .. }))
            .count();
        assert_eq!(concats, 1);
    }

    #[test]
    fn missing_end_names_the_opener() {
        let err = compile_err("if x then\nreturn 1\n");
        assert!(err.message.contains("to close 'if' at line 1"));
    }
}
