// Luno Compiled Chunks
// Serialization of compiled prototypes to .lunoc files

use crate::compiler::opcode::{ArithOp, CmpOp, Instr, UnOp, RK};
use crate::compiler::{Constant, Prototype, UpvalueDesc};
use crate::compiler::proto::LocalVar;
use std::sync::Arc;
use thiserror::Error;

const MAGIC: &[u8; 4] = b"LUNO";
const VERSION: u8 = 1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChunkError {
    #[error("invalid file: not a compiled luno chunk")]
    BadMagic,
    #[error("unsupported chunk version: {0}")]
    BadVersion(u8),
    #[error("invalid file: unexpected end of data")]
    Truncated,
    #[error("invalid file: unknown constant tag {0}")]
    BadConstant(u8),
    #[error("invalid file: unknown instruction tag {0}")]
    BadInstruction(u8),
    #[error("invalid file: malformed string data")]
    BadString,
}

pub fn serialize(proto: &Prototype) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(MAGIC);
    out.push(VERSION);
    write_proto(&mut out, proto);
    out
}

pub fn deserialize(data: &[u8]) -> Result<Arc<Prototype>, ChunkError> {
    if data.len() < 5 {
        return Err(ChunkError::Truncated);
    }
    if &data[0..4] != MAGIC {
        return Err(ChunkError::BadMagic);
    }
    let version = data[4];
    if version != VERSION {
        return Err(ChunkError::BadVersion(version));
    }
    let mut cursor = 5;
    let proto = read_proto(data, &mut cursor)?;
    Ok(Arc::new(proto))
}

fn write_proto(out: &mut Vec<u8>, proto: &Prototype) {
    write_str(out, &proto.source);
    write_str(out, &proto.name);
    write_u32(out, proto.line_defined);
    out.push(proto.param_count);
    out.push(proto.is_vararg as u8);
    out.push(proto.max_stack);

    write_u32(out, proto.constants.len() as u32);
    for constant in &proto.constants {
        match constant {
            Constant::Int(n) => {
                out.push(0);
                out.extend_from_slice(&n.to_le_bytes());
            }
            Constant::Float(x) => {
                out.push(1);
                out.extend_from_slice(&x.to_le_bytes());
            }
            Constant::Str(s) => {
                out.push(2);
                write_str(out, s);
            }
        }
    }

    write_u32(out, proto.code.len() as u32);
    for instr in &proto.code {
        write_instr(out, instr);
    }
    for line in &proto.lines {
        write_u32(out, *line);
    }

    write_u32(out, proto.upvalues.len() as u32);
    for up in &proto.upvalues {
        write_str(out, &up.name);
        out.push(up.in_stack as u8);
        out.push(up.index);
    }

    write_u32(out, proto.locals.len() as u32);
    for local in &proto.locals {
        write_str(out, &local.name);
        out.push(local.register);
        write_u32(out, local.start_pc);
        write_u32(out, local.end_pc);
    }

    write_u32(out, proto.protos.len() as u32);
    for nested in &proto.protos {
        write_proto(out, nested);
    }
}

fn read_proto(data: &[u8], cursor: &mut usize) -> Result<Prototype, ChunkError> {
    let source: Arc<str> = Arc::from(read_str(data, cursor)?);
    let name = read_str(data, cursor)?;
    let line_defined = read_u32(data, cursor)?;
    let param_count = read_u8(data, cursor)?;
    let is_vararg = read_u8(data, cursor)? != 0;
    let max_stack = read_u8(data, cursor)?;

    let constant_count = read_u32(data, cursor)? as usize;
    let mut constants = Vec::with_capacity(constant_count);
    for _ in 0..constant_count {
        constants.push(match read_u8(data, cursor)? {
            0 => Constant::Int(i64::from_le_bytes(read_8(data, cursor)?)),
            1 => Constant::Float(f64::from_le_bytes(read_8(data, cursor)?)),
            2 => Constant::Str(Arc::from(read_str(data, cursor)?)),
            tag => return Err(ChunkError::BadConstant(tag)),
        });
    }

    let code_len = read_u32(data, cursor)? as usize;
    let mut code = Vec::with_capacity(code_len);
    for _ in 0..code_len {
        code.push(read_instr(data, cursor)?);
    }
    let mut lines = Vec::with_capacity(code_len);
    for _ in 0..code_len {
        lines.push(read_u32(data, cursor)?);
    }

    let upvalue_count = read_u32(data, cursor)? as usize;
    let mut upvalues = Vec::with_capacity(upvalue_count);
    for _ in 0..upvalue_count {
        let name: Arc<str> = Arc::from(read_str(data, cursor)?);
        let in_stack = read_u8(data, cursor)? != 0;
        let index = read_u8(data, cursor)?;
        upvalues.push(UpvalueDesc { name, in_stack, index });
    }

    let local_count = read_u32(data, cursor)? as usize;
    let mut locals = Vec::with_capacity(local_count);
    for _ in 0..local_count {
        let name: Arc<str> = Arc::from(read_str(data, cursor)?);
        let register = read_u8(data, cursor)?;
        let start_pc = read_u32(data, cursor)?;
        let end_pc = read_u32(data, cursor)?;
        locals.push(LocalVar { name, register, start_pc, end_pc });
    }

    let proto_count = read_u32(data, cursor)? as usize;
    let mut protos = Vec::with_capacity(proto_count);
    for _ in 0..proto_count {
        protos.push(Arc::new(read_proto(data, cursor)?));
    }

    Ok(Prototype {
        code,
        lines,
        constants,
        protos,
        upvalues,
        param_count,
        is_vararg,
        max_stack,
        source,
        name,
        line_defined,
        locals,
    })
}

// ---- instruction encoding ----------------------------------------------
// One tag byte, then the operands in declaration order. Multi-byte
// operands are little-endian.

fn write_instr(out: &mut Vec<u8>, instr: &Instr) {
    use Instr::*;
    match *instr {
        Move { dst, src } => { out.push(0); out.push(dst); out.push(src); }
        LoadK { dst, k } => { out.push(1); out.push(dst); write_u32(out, k); }
        LoadNil { dst, count } => { out.push(2); out.push(dst); out.push(count); }
        LoadBool { dst, value, skip } => {
            out.push(3); out.push(dst); out.push(value as u8); out.push(skip as u8);
        }
        LoadEnv { dst } => { out.push(4); out.push(dst); }
        GetGlobal { dst, k } => { out.push(5); out.push(dst); write_u32(out, k); }
        SetGlobal { src, k } => { out.push(6); out.push(src); write_u32(out, k); }
        GetUpval { dst, idx } => { out.push(7); out.push(dst); out.push(idx); }
        SetUpval { src, idx } => { out.push(8); out.push(src); out.push(idx); }
        NewTable { dst, hint } => { out.push(9); out.push(dst); write_u16(out, hint); }
        NewList { dst, hint } => { out.push(10); out.push(dst); write_u16(out, hint); }
        GetIndex { dst, obj, key } => {
            out.push(11); out.push(dst); out.push(obj); write_u16(out, key);
        }
        SetIndex { obj, key, val } => {
            out.push(12); out.push(obj); write_u16(out, key); write_u16(out, val);
        }
        SetList { table, start, count } => {
            out.push(13); out.push(table); write_u32(out, start); out.push(count);
        }
        SelfGet { dst, obj, key } => {
            out.push(14); out.push(dst); out.push(obj); write_u16(out, key);
        }
        Arith { op, dst, lhs, rhs } => {
            out.push(15); out.push(op as u8); out.push(dst);
            write_u16(out, lhs); write_u16(out, rhs);
        }
        Unary { op, dst, src } => {
            out.push(16); out.push(op as u8); out.push(dst); out.push(src);
        }
        Concat { dst, start, end } => {
            out.push(17); out.push(dst); out.push(start); out.push(end);
        }
        Cmp { op, expect, lhs, rhs } => {
            out.push(18); out.push(op as u8); out.push(expect as u8);
            write_u16(out, lhs); write_u16(out, rhs);
        }
        Test { src, expect } => { out.push(19); out.push(src); out.push(expect as u8); }
        TestSet { dst, src, expect } => {
            out.push(20); out.push(dst); out.push(src); out.push(expect as u8);
        }
        Jump { offset } => { out.push(21); write_i32(out, offset); }
        ForPrep { base, offset } => { out.push(22); out.push(base); write_i32(out, offset); }
        ForLoop { base, offset } => { out.push(23); out.push(base); write_i32(out, offset); }
        TForCall { base, nresults } => { out.push(24); out.push(base); out.push(nresults); }
        TForLoop { base, offset } => { out.push(25); out.push(base); write_i32(out, offset); }
        Call { base, nargs, nresults } => {
            out.push(26); out.push(base); out.push(nargs); out.push(nresults);
        }
        Return { base, count } => { out.push(27); out.push(base); out.push(count); }
        Vararg { dst, count } => { out.push(28); out.push(dst); out.push(count); }
        Closure { dst, proto } => { out.push(29); out.push(dst); write_u16(out, proto); }
        CloseUpvals { from } => { out.push(30); out.push(from); }
        Import { dst, k } => { out.push(31); out.push(dst); write_u32(out, k); }
        ImportPkg { k } => { out.push(32); write_u32(out, k); }
        Module { dst, k } => { out.push(33); out.push(dst); write_u32(out, k); }
        Defer { src } => { out.push(34); out.push(src); }
        TryCall { try_reg, catch_reg, fin_reg } => {
            out.push(35); out.push(try_reg); out.push(catch_reg); out.push(fin_reg);
        }
    }
}

fn read_instr(data: &[u8], cursor: &mut usize) -> Result<Instr, ChunkError> {
    use Instr::*;
    let tag = read_u8(data, cursor)?;
    Ok(match tag {
        0 => Move { dst: read_u8(data, cursor)?, src: read_u8(data, cursor)? },
        1 => LoadK { dst: read_u8(data, cursor)?, k: read_u32(data, cursor)? },
        2 => LoadNil { dst: read_u8(data, cursor)?, count: read_u8(data, cursor)? },
        3 => LoadBool {
            dst: read_u8(data, cursor)?,
            value: read_u8(data, cursor)? != 0,
            skip: read_u8(data, cursor)? != 0,
        },
        4 => LoadEnv { dst: read_u8(data, cursor)? },
        5 => GetGlobal { dst: read_u8(data, cursor)?, k: read_u32(data, cursor)? },
        6 => SetGlobal { src: read_u8(data, cursor)?, k: read_u32(data, cursor)? },
        7 => GetUpval { dst: read_u8(data, cursor)?, idx: read_u8(data, cursor)? },
        8 => SetUpval { src: read_u8(data, cursor)?, idx: read_u8(data, cursor)? },
        9 => NewTable { dst: read_u8(data, cursor)?, hint: read_u16(data, cursor)? },
        10 => NewList { dst: read_u8(data, cursor)?, hint: read_u16(data, cursor)? },
        11 => GetIndex {
            dst: read_u8(data, cursor)?,
            obj: read_u8(data, cursor)?,
            key: read_rk(data, cursor)?,
        },
        12 => SetIndex {
            obj: read_u8(data, cursor)?,
            key: read_rk(data, cursor)?,
            val: read_rk(data, cursor)?,
        },
        13 => SetList {
            table: read_u8(data, cursor)?,
            start: read_u32(data, cursor)?,
            count: read_u8(data, cursor)?,
        },
        14 => SelfGet {
            dst: read_u8(data, cursor)?,
            obj: read_u8(data, cursor)?,
            key: read_rk(data, cursor)?,
        },
        15 => Arith {
            op: arith_op(read_u8(data, cursor)?, tag)?,
            dst: read_u8(data, cursor)?,
            lhs: read_rk(data, cursor)?,
            rhs: read_rk(data, cursor)?,
        },
        16 => Unary {
            op: un_op(read_u8(data, cursor)?, tag)?,
            dst: read_u8(data, cursor)?,
            src: read_u8(data, cursor)?,
        },
        17 => Concat {
            dst: read_u8(data, cursor)?,
            start: read_u8(data, cursor)?,
            end: read_u8(data, cursor)?,
        },
        18 => Cmp {
            op: cmp_op(read_u8(data, cursor)?, tag)?,
            expect: read_u8(data, cursor)? != 0,
            lhs: read_rk(data, cursor)?,
            rhs: read_rk(data, cursor)?,
        },
        19 => Test { src: read_u8(data, cursor)?, expect: read_u8(data, cursor)? != 0 },
        20 => TestSet {
            dst: read_u8(data, cursor)?,
            src: read_u8(data, cursor)?,
            expect: read_u8(data, cursor)? != 0,
        },
        21 => Jump { offset: read_i32(data, cursor)? },
        22 => ForPrep { base: read_u8(data, cursor)?, offset: read_i32(data, cursor)? },
        23 => ForLoop { base: read_u8(data, cursor)?, offset: read_i32(data, cursor)? },
        24 => TForCall { base: read_u8(data, cursor)?, nresults: read_u8(data, cursor)? },
        25 => TForLoop { base: read_u8(data, cursor)?, offset: read_i32(data, cursor)? },
        26 => Call {
            base: read_u8(data, cursor)?,
            nargs: read_u8(data, cursor)?,
            nresults: read_u8(data, cursor)?,
        },
        27 => Return { base: read_u8(data, cursor)?, count: read_u8(data, cursor)? },
        28 => Vararg { dst: read_u8(data, cursor)?, count: read_u8(data, cursor)? },
        29 => Closure { dst: read_u8(data, cursor)?, proto: read_u16(data, cursor)? },
        30 => CloseUpvals { from: read_u8(data, cursor)? },
        31 => Import { dst: read_u8(data, cursor)?, k: read_u32(data, cursor)? },
        32 => ImportPkg { k: read_u32(data, cursor)? },
        33 => Module { dst: read_u8(data, cursor)?, k: read_u32(data, cursor)? },
        34 => Defer { src: read_u8(data, cursor)? },
        35 => TryCall {
            try_reg: read_u8(data, cursor)?,
            catch_reg: read_u8(data, cursor)?,
            fin_reg: read_u8(data, cursor)?,
        },
        other => return Err(ChunkError::BadInstruction(other)),
    })
}

fn arith_op(code: u8, tag: u8) -> Result<ArithOp, ChunkError> {
    use ArithOp::*;
    const OPS: [ArithOp; 12] = [Add, Sub, Mul, Div, IDiv, Mod, Pow, BAnd, BOr, BXor, Shl, Shr];
    OPS.get(code as usize).copied().ok_or(ChunkError::BadInstruction(tag))
}

fn un_op(code: u8, tag: u8) -> Result<UnOp, ChunkError> {
    use UnOp::*;
    const OPS: [UnOp; 4] = [Neg, Not, Len, BNot];
    OPS.get(code as usize).copied().ok_or(ChunkError::BadInstruction(tag))
}

fn cmp_op(code: u8, tag: u8) -> Result<CmpOp, ChunkError> {
    use CmpOp::*;
    const OPS: [CmpOp; 3] = [Eq, Lt, Le];
    OPS.get(code as usize).copied().ok_or(ChunkError::BadInstruction(tag))
}

// ---- primitive readers and writers -------------------------------------

fn write_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn write_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn write_i32(out: &mut Vec<u8>, value: i32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn write_str(out: &mut Vec<u8>, s: &str) {
    write_u32(out, s.len() as u32);
    out.extend_from_slice(s.as_bytes());
}

fn read_u8(data: &[u8], cursor: &mut usize) -> Result<u8, ChunkError> {
    let b = *data.get(*cursor).ok_or(ChunkError::Truncated)?;
    *cursor += 1;
    Ok(b)
}

fn read_u16(data: &[u8], cursor: &mut usize) -> Result<u16, ChunkError> {
    let bytes: [u8; 2] = read_n(data, cursor)?;
    Ok(u16::from_le_bytes(bytes))
}

fn read_rk(data: &[u8], cursor: &mut usize) -> Result<RK, ChunkError> {
    read_u16(data, cursor)
}

fn read_u32(data: &[u8], cursor: &mut usize) -> Result<u32, ChunkError> {
    let bytes: [u8; 4] = read_n(data, cursor)?;
    Ok(u32::from_le_bytes(bytes))
}

fn read_i32(data: &[u8], cursor: &mut usize) -> Result<i32, ChunkError> {
    let bytes: [u8; 4] = read_n(data, cursor)?;
    Ok(i32::from_le_bytes(bytes))
}

fn read_8(data: &[u8], cursor: &mut usize) -> Result<[u8; 8], ChunkError> {
    read_n(data, cursor)
}

fn read_n<const N: usize>(data: &[u8], cursor: &mut usize) -> Result<[u8; N], ChunkError> {
    let end = cursor.checked_add(N).ok_or(ChunkError::Truncated)?;
    let slice = data.get(*cursor..end).ok_or(ChunkError::Truncated)?;
    *cursor = end;
    let mut bytes = [0u8; N];
    bytes.copy_from_slice(slice);
    Ok(bytes)
}

fn read_str(data: &[u8], cursor: &mut usize) -> Result<String, ChunkError> {
    let len = read_u32(data, cursor)? as usize;
    let end = cursor.checked_add(len).ok_or(ChunkError::Truncated)?;
    let slice = data.get(*cursor..end).ok_or(ChunkError::Truncated)?;
    *cursor = end;
    String::from_utf8(slice.to_vec()).map_err(|_| ChunkError::BadString)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::Parser;

    fn assert_same(a: &Prototype, b: &Prototype) {
        assert_eq!(a.code, b.code);
        assert_eq!(a.lines, b.lines);
        assert_eq!(a.constants, b.constants);
        assert_eq!(a.upvalues, b.upvalues);
        assert_eq!(a.param_count, b.param_count);
        assert_eq!(a.is_vararg, b.is_vararg);
        assert_eq!(a.max_stack, b.max_stack);
        assert_eq!(a.name, b.name);
        assert_eq!(a.protos.len(), b.protos.len());
        for (x, y) in a.protos.iter().zip(&b.protos) {
            assert_same(x, y);
        }
    }

    #[test]
    fn chunk_survives_a_round_trip() {
        let proto = Parser::compile(
            "local function add(a, b) return a + b end\nreturn add(1, 2.5), 'done'",
            "chunk.luno",
        )
        .expect("compiles");
        let bytes = serialize(&proto);
        let back = deserialize(&bytes).expect("deserializes");
        assert_same(&proto, &back);
    }

    #[test]
    fn loaded_chunk_still_runs() {
        let proto =
            Parser::compile("local t = {3, 1, 2}\ntable.sort(t)\nreturn t[1]", "chunk.luno")
                .expect("compiles");
        let back = deserialize(&serialize(&proto)).expect("deserializes");
        let out = crate::vm::Vm::new().execute(back, &[]).expect("runs");
        assert!(out[0].raw_eq(&crate::Value::Integer(1)));
    }

    #[test]
    fn rejects_wrong_magic() {
        assert_eq!(deserialize(b"XXXX\x01").unwrap_err(), ChunkError::BadMagic);
    }

    #[test]
    fn rejects_future_versions() {
        let proto = Parser::compile("return 1", "chunk.luno").expect("compiles");
        let mut bytes = serialize(&proto);
        bytes[4] = 99;
        assert_eq!(deserialize(&bytes).unwrap_err(), ChunkError::BadVersion(99));
    }

    #[test]
    fn rejects_truncated_data() {
        let proto = Parser::compile("return 1 + 2", "chunk.luno").expect("compiles");
        let bytes = serialize(&proto);
        let cut = &bytes[..bytes.len() - 3];
        assert_eq!(deserialize(cut).unwrap_err(), ChunkError::Truncated);
    }
}
