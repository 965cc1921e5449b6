// Luno Function Prototypes
// Compiled function bodies: code, constants, nested protos, debug info

use crate::compiler::opcode::{rk_index, rk_is_const, Instr, RK};
use std::fmt::Write as _;
use std::sync::Arc;

/// A compile-time constant in a prototype's pool.
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Int(i64),
    Float(f64),
    Str(Arc<str>),
}

impl Constant {
    pub fn type_name(&self) -> &'static str {
        match self {
            Constant::Int(_) => "int",
            Constant::Float(_) => "float",
            Constant::Str(_) => "string",
        }
    }
}

impl std::fmt::Display for Constant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Constant::Int(n) => write!(f, "{}", n),
            Constant::Float(n) => {
                if n.fract() == 0.0 && n.is_finite() {
                    write!(f, "{:.1}", n)
                } else {
                    write!(f, "{}", n)
                }
            }
            Constant::Str(s) => write!(f, "{:?}", s),
        }
    }
}

/// Where a closure's upvalue is captured from at `Closure` time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpvalueDesc {
    pub name: Arc<str>,
    /// True: capture the enclosing frame's register `index`.
    /// False: share the enclosing closure's upvalue `index`.
    pub in_stack: bool,
    pub index: u8,
}

/// Debug record for a local variable's register and live range.
#[derive(Debug, Clone)]
pub struct LocalVar {
    pub name: Arc<str>,
    pub register: u8,
    pub start_pc: u32,
    pub end_pc: u32,
}

/// A compiled function body.
///
/// Immutable once built; shared between closures via `Arc`.
#[derive(Debug, Clone)]
pub struct Prototype {
    pub code: Vec<Instr>,
    /// Source line for each instruction, parallel to `code`.
    pub lines: Vec<u32>,
    pub constants: Vec<Constant>,
    pub protos: Vec<Arc<Prototype>>,
    pub upvalues: Vec<UpvalueDesc>,
    pub param_count: u8,
    pub is_vararg: bool,
    /// Registers this function needs; the frame window size.
    pub max_stack: u8,
    /// Chunk name, e.g. the script file.
    pub source: Arc<str>,
    /// Function name for stack traces; "main" for the top-level chunk.
    pub name: String,
    pub line_defined: u32,
    pub locals: Vec<LocalVar>,
}

impl Prototype {
    pub fn line_at(&self, pc: usize) -> u32 {
        self.lines.get(pc).copied().unwrap_or(0)
    }

    /// Human-readable listing of this prototype and all nested ones.
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        self.disassemble_into(&mut out, 0);
        out
    }

    fn disassemble_into(&self, out: &mut String, depth: usize) {
        let indent = "  ".repeat(depth);
        let vararg = if self.is_vararg { "+" } else { "" };
        let _ = writeln!(
            out,
            "{}function <{}:{}> {} ({}{} params, {} slots, {} upvalues, {} constants)",
            indent,
            self.source,
            self.line_defined,
            self.name,
            self.param_count,
            vararg,
            self.max_stack,
            self.upvalues.len(),
            self.constants.len()
        );

        let mut last_line = 0u32;
        for (pc, instr) in self.code.iter().enumerate() {
            let line = self.line_at(pc);
            let line_str = if line != last_line {
                format!("{:>4}", line)
            } else {
                "   |".to_string()
            };
            last_line = line;
            let _ = writeln!(
                out,
                "{}  [{:>3}] {} {}",
                indent,
                pc,
                line_str,
                self.format_instr(pc, instr)
            );
        }

        for proto in &self.protos {
            proto.disassemble_into(out, depth + 1);
        }
    }

    fn fmt_rk(&self, rk: RK) -> String {
        if rk_is_const(rk) {
            let idx = rk_index(rk);
            match self.constants.get(idx) {
                Some(k) => format!("{}", k),
                None => format!("K{}", idx),
            }
        } else {
            format!("r{}", rk_index(rk))
        }
    }

    fn fmt_k(&self, k: u32) -> String {
        match self.constants.get(k as usize) {
            Some(c) => format!("{}", c),
            None => format!("K{}", k),
        }
    }

    fn format_instr(&self, pc: usize, instr: &Instr) -> String {
        use Instr::*;
        let target = |offset: i32| (pc as i64 + 1 + offset as i64).to_string();
        match *instr {
            Move { dst, src } => format!("move      r{} r{}", dst, src),
            LoadK { dst, k } => format!("loadk     r{} {}", dst, self.fmt_k(k)),
            LoadNil { dst, count } => format!("loadnil   r{}..r{}", dst, dst + count - 1),
            LoadBool { dst, value, skip } => {
                format!("loadbool  r{} {}{}", dst, value, if skip { " skip" } else { "" })
            }
            LoadEnv { dst } => format!("loadenv   r{}", dst),
            GetGlobal { dst, k } => format!("getglobal r{} {}", dst, self.fmt_k(k)),
            SetGlobal { src, k } => format!("setglobal {} r{}", self.fmt_k(k), src),
            GetUpval { dst, idx } => format!("getupval  r{} u{}", dst, idx),
            SetUpval { src, idx } => format!("setupval  u{} r{}", idx, src),
            NewTable { dst, hint } => format!("newtable  r{} #{}", dst, hint),
            NewList { dst, hint } => format!("newlist   r{} #{}", dst, hint),
            GetIndex { dst, obj, key } => {
                format!("getindex  r{} r{}[{}]", dst, obj, self.fmt_rk(key))
            }
            SetIndex { obj, key, val } => {
                format!("setindex  r{}[{}] {}", obj, self.fmt_rk(key), self.fmt_rk(val))
            }
            SetList { table, start, count } => {
                format!("setlist   r{} from {} x{}", table, start, count)
            }
            SelfGet { dst, obj, key } => {
                format!("self      r{} r{}[{}]", dst, obj, self.fmt_rk(key))
            }
            Arith { op, dst, lhs, rhs } => format!(
                "{:<9} r{} {} {}",
                format!("{:?}", op).to_lowercase(),
                dst,
                self.fmt_rk(lhs),
                self.fmt_rk(rhs)
            ),
            Unary { op, dst, src } => {
                format!("{:<9} r{} r{}", format!("{:?}", op).to_lowercase(), dst, src)
            }
            Concat { dst, start, end } => format!("concat    r{} r{}..r{}", dst, start, end),
            Cmp { op, expect, lhs, rhs } => format!(
                "{:<9} {} {} ?{}",
                format!("{:?}", op).to_lowercase(),
                self.fmt_rk(lhs),
                self.fmt_rk(rhs),
                expect
            ),
            Test { src, expect } => format!("test      r{} ?{}", src, expect),
            TestSet { dst, src, expect } => format!("testset   r{} r{} ?{}", dst, src, expect),
            Jump { offset } => format!("jump      -> {}", target(offset)),
            ForPrep { base, offset } => format!("forprep   r{} -> {}", base, target(offset)),
            ForLoop { base, offset } => format!("forloop   r{} -> {}", base, target(offset)),
            TForCall { base, nresults } => format!("tforcall  r{} x{}", base, nresults),
            TForLoop { base, offset } => format!("tforloop  r{} -> {}", base, target(offset)),
            Call { base, nargs, nresults } => {
                format!("call      r{} args:{} rets:{}", base, nargs, nresults)
            }
            Return { base, count } => format!("return    r{} x{}", base, count),
            Vararg { dst, count } => format!("vararg    r{} x{}", dst, count),
            Closure { dst, proto } => format!("closure   r{} p{}", dst, proto),
            CloseUpvals { from } => format!("closeupv  r{}..", from),
            Import { dst, k } => format!("import    r{} {}", dst, self.fmt_k(k)),
            ImportPkg { k } => format!("importpkg {}", self.fmt_k(k)),
            Module { dst, k } => format!("module    r{} {}", dst, self.fmt_k(k)),
            Defer { src } => format!("defer     r{}", src),
            TryCall { try_reg, catch_reg, fin_reg } => {
                let opt = |r: u8| {
                    if r == crate::compiler::opcode::NO_REG {
                        "-".to_string()
                    } else {
                        format!("r{}", r)
                    }
                };
                format!("trycall   r{} {} {}", try_reg, opt(catch_reg), opt(fin_reg))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::opcode::rk_const;

    fn tiny_proto() -> Prototype {
        Prototype {
            code: vec![
                Instr::LoadK { dst: 0, k: 0 },
                Instr::GetGlobal { dst: 1, k: 1 },
                Instr::Return { base: 0, count: 2 },
            ],
            lines: vec![1, 1, 2],
            constants: vec![Constant::Int(42), Constant::Str(Arc::from("print"))],
            protos: vec![],
            upvalues: vec![],
            param_count: 0,
            is_vararg: true,
            max_stack: 2,
            source: Arc::from("test.luno"),
            name: "main".to_string(),
            line_defined: 0,
            locals: vec![],
        }
    }

    #[test]
    fn disassembly_lists_instructions() {
        let text = tiny_proto().disassemble();
        assert!(text.contains("loadk     r0 42"));
        assert!(text.contains("getglobal r1 \"print\""));
        assert!(text.contains("return    r0 x2"));
    }

    #[test]
    fn rk_formatting_distinguishes_constants() {
        let p = tiny_proto();
        assert_eq!(p.fmt_rk(rk_const(0)), "42");
        assert_eq!(p.fmt_rk(3), "r3");
    }
}
