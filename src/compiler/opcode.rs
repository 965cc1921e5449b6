// Luno Bytecode Instructions
// Register-based ISA; one instruction per dispatch step

/// RK operand: bit 15 set means "constant pool index", clear means
/// "register index".
pub type RK = u16;

/// Bit flag marking an RK operand as a constant-pool index.
pub const RK_CONST: u16 = 1 << 15;

/// Sentinel register meaning "absent" in `TryCall` operands.
pub const NO_REG: u8 = u8::MAX;

/// Build an RK operand referring to register `r`.
pub fn rk_reg(r: u8) -> RK {
    r as u16
}

/// Build an RK operand referring to constant `k`.
pub fn rk_const(k: u32) -> RK {
    debug_assert!(k < RK_CONST as u32);
    k as u16 | RK_CONST
}

pub fn rk_is_const(rk: RK) -> bool {
    rk & RK_CONST != 0
}

pub fn rk_index(rk: RK) -> usize {
    (rk & !RK_CONST) as usize
}

/// Binary arithmetic / bitwise operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    IDiv,
    Mod,
    Pow,
    BAnd,
    BOr,
    BXor,
    Shl,
    Shr,
}

impl ArithOp {
    /// Metamethod name consulted when an operand is not a number.
    pub fn metamethod(self) -> &'static str {
        match self {
            ArithOp::Add => "__add",
            ArithOp::Sub => "__sub",
            ArithOp::Mul => "__mul",
            ArithOp::Div => "__div",
            ArithOp::IDiv => "__idiv",
            ArithOp::Mod => "__mod",
            ArithOp::Pow => "__pow",
            ArithOp::BAnd => "__band",
            ArithOp::BOr => "__bor",
            ArithOp::BXor => "__bxor",
            ArithOp::Shl => "__shl",
            ArithOp::Shr => "__shr",
        }
    }
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
    Len,
    BNot,
}

/// Comparison operators (always paired with a skip-next-jump).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Lt,
    Le,
}

/// One VM instruction.
///
/// Register-based: operands name registers in the current call's
/// register window, constants (via `RK` with the high bit set), nested
/// prototype indices, or jump offsets relative to the next instruction.
///
/// Count encodings follow the usual register-VM convention: for `Call`,
/// `nargs`/`nresults` store count+1, with 0 meaning "up to stack top" /
/// "keep all" (open counts used to thread multiple return values).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Instr {
    /// dst = src
    Move { dst: u8, src: u8 },
    /// dst = constants[k]
    LoadK { dst: u8, k: u32 },
    /// dst..=dst+count-1 = nil
    LoadNil { dst: u8, count: u8 },
    /// dst = value; if skip, skip next instruction
    LoadBool { dst: u8, value: bool, skip: bool },
    /// dst = the globals table itself
    LoadEnv { dst: u8 },

    /// dst = globals[constants[k]] (falls back to the import-prefix
    /// chain on miss)
    GetGlobal { dst: u8, k: u32 },
    /// globals[constants[k]] = src
    SetGlobal { src: u8, k: u32 },
    /// dst = upvalues[idx]
    GetUpval { dst: u8, idx: u8 },
    /// upvalues[idx] = src
    SetUpval { src: u8, idx: u8 },

    /// dst = fresh table with array capacity hint
    NewTable { dst: u8, hint: u16 },
    /// dst = fresh list with capacity hint
    NewList { dst: u8, hint: u16 },
    /// dst = obj[key]
    GetIndex { dst: u8, obj: u8, key: RK },
    /// obj[key] = val
    SetIndex { obj: u8, key: RK, val: RK },
    /// table[start+i] = R[table+1+i] for i in 0..count; count 0 = up to top
    SetList { table: u8, start: u32, count: u8 },
    /// dst+1 = R[obj]; dst = R[obj][key]  (method-call receiver setup)
    SelfGet { dst: u8, obj: u8, key: RK },

    /// dst = lhs op rhs
    Arith { op: ArithOp, dst: u8, lhs: RK, rhs: RK },
    /// dst = op src
    Unary { op: UnOp, dst: u8, src: u8 },
    /// dst = concat(R[start..=end])
    Concat { dst: u8, start: u8, end: u8 },

    /// if (lhs op rhs) != expect then skip next instruction
    Cmp { op: CmpOp, expect: bool, lhs: RK, rhs: RK },
    /// if truthy(src) != expect then skip next instruction
    Test { src: u8, expect: bool },
    /// if truthy(src) == expect then dst = src else skip next instruction
    TestSet { dst: u8, src: u8, expect: bool },
    /// pc += offset
    Jump { offset: i32 },

    /// Numeric for: R[base]-=R[base+2]; pc += offset (to the ForLoop)
    ForPrep { base: u8, offset: i32 },
    /// Numeric for: R[base]+=R[base+2]; if within limit R[base+3]=R[base], pc += offset
    ForLoop { base: u8, offset: i32 },
    /// Generic for: R[base+3..] = R[base](R[base+1], R[base+2])
    TForCall { base: u8, nresults: u8 },
    /// Generic for: if R[base+3] != nil { R[base+2]=R[base+3]; pc += offset }
    TForLoop { base: u8, offset: i32 },

    /// R[base..] = R[base](R[base+1]..R[base+nargs-1])
    Call { base: u8, nargs: u8, nresults: u8 },
    /// return R[base]..R[base+count-2]; count 0 = up to top
    Return { base: u8, count: u8 },
    /// R[dst..] = varargs; count = wanted+1, 0 = all
    Vararg { dst: u8, count: u8 },

    /// dst = closure of protos[proto], binding upvalues per descriptor
    Closure { dst: u8, proto: u16 },
    /// close all open upvalues at register >= from
    CloseUpvals { from: u8 },

    /// dst = resolve foreign class constants[k] through the bridge
    Import { dst: u8, k: u32 },
    /// register constants[k] as an import package prefix
    ImportPkg { k: u32 },
    /// dst = get-or-create module table named constants[k]
    Module { dst: u8, k: u32 },

    /// Schedule R[src] (a closure) to run when this function returns
    Defer { src: u8 },
    /// Structured try: call R[try_reg] protected; on error call
    /// R[catch_reg] with the error (if present); always call R[fin_reg]
    /// (if present); re-raise uncaught errors afterwards.
    TryCall { try_reg: u8, catch_reg: u8, fin_reg: u8 },
}

