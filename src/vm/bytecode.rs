//! Binary code-unit format.
//!
//! Layout (all integers little-endian):
//! - Magic: "SVMU" (4 bytes)
//! - Version: u32
//! - Unit name: string
//! - Constant pool: u32 count, then per entry a u8 tag (0 int, 1 float,
//!   2 string) and its payload
//! - Functions: u32 count, then per function: name, arity u8, locals u16,
//!   upvalues u16, returns u8, flags u8 (bit 0 = exported), code byte
//!   length u32, code bytes, line entry count u32, (pc u32, line u32)*
//!
//! Strings are a u32 byte length followed by UTF-8 bytes. In the encoded
//! code, jump operands are byte offsets relative to the end of the jump
//! instruction; decoding maps them back to instruction offsets and
//! rejects targets that are not instruction boundaries.

use std::io::{self, Cursor, Read, Write};

use thiserror::Error;

use super::debug::{LineEntry, LineTable};
use super::ops::{Op, jump_target};
use super::verifier::{VerifyError, VerifyErrorKind};
use super::{CodeUnit, Constant, Function};

/// Magic bytes for code unit files
pub const MAGIC: &[u8; 4] = b"SVMU";

/// Current bytecode format version
pub const VERSION: u32 = 1;

const FLAG_EXPORTED: u8 = 0x01;

/// Error type for bytecode operations
#[derive(Debug, Error)]
pub enum BytecodeError {
    #[error("invalid magic number")]
    InvalidMagic,
    #[error("unsupported version: {0}")]
    UnsupportedVersion(u32),
    #[error("unexpected end of file")]
    UnexpectedEof,
    #[error("invalid constant tag: {0}")]
    InvalidConstantTag(u8),
    #[error("invalid opcode: 0x{0:02x}")]
    InvalidOpcode(u8),
    #[error("invalid UTF-8 string")]
    InvalidUtf8,
    #[error("{0} trailing byte(s) after the last function")]
    TrailingBytes(usize),
    /// The code itself is malformed (unknown opcode, misaligned jump).
    #[error(transparent)]
    Verify(#[from] VerifyError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

// Opcode tags.
const OP_NIL: u8 = 0x00;
const OP_TRUE: u8 = 0x01;
const OP_FALSE: u8 = 0x02;
const OP_INT: u8 = 0x03;
const OP_CONST: u8 = 0x04;
const OP_POP: u8 = 0x08;
const OP_DUP: u8 = 0x09;
const OP_SWAP: u8 = 0x0a;
const OP_GET_LOCAL: u8 = 0x10;
const OP_SET_LOCAL: u8 = 0x11;
const OP_GET_GLOBAL: u8 = 0x12;
const OP_SET_GLOBAL: u8 = 0x13;
const OP_GET_UPVALUE: u8 = 0x14;
const OP_SET_UPVALUE: u8 = 0x15;
const OP_ADD: u8 = 0x20;
const OP_SUB: u8 = 0x21;
const OP_MUL: u8 = 0x22;
const OP_DIV: u8 = 0x23;
const OP_MOD: u8 = 0x24;
const OP_NEG: u8 = 0x25;
const OP_EQ: u8 = 0x30;
const OP_NE: u8 = 0x31;
const OP_LT: u8 = 0x32;
const OP_LE: u8 = 0x33;
const OP_GT: u8 = 0x34;
const OP_GE: u8 = 0x35;
const OP_NOT: u8 = 0x36;
const OP_JUMP: u8 = 0x40;
const OP_JUMP_IF_FALSE: u8 = 0x41;
const OP_JUMP_IF_TRUE: u8 = 0x42;
const OP_CALL: u8 = 0x48;
const OP_RETURN: u8 = 0x49;
const OP_CLOSURE: u8 = 0x50;
const OP_NEW_ARRAY: u8 = 0x51;
const OP_NEW_TABLE: u8 = 0x52;
const OP_GET_INDEX: u8 = 0x53;
const OP_SET_INDEX: u8 = 0x54;
const OP_LEN: u8 = 0x55;
const OP_TRY: u8 = 0x60;
const OP_END_TRY: u8 = 0x61;
const OP_THROW: u8 = 0x62;

/// Serialize a code unit to bytes
pub fn serialize(unit: &CodeUnit) -> Vec<u8> {
    let mut buf = Vec::new();
    // Writing into a Vec cannot fail.
    let _ = write_unit(&mut buf, unit);
    buf
}

/// Deserialize a code unit from bytes. The result still has to pass the
/// verifier before it may run.
pub fn deserialize(data: &[u8]) -> Result<CodeUnit, BytecodeError> {
    let mut cursor = Cursor::new(data);
    let unit = read_unit(&mut cursor)?;
    let rest = data.len() - cursor.position() as usize;
    if rest > 0 {
        return Err(BytecodeError::TrailingBytes(rest));
    }
    Ok(unit)
}

/// Whether `data` starts with the code unit magic.
pub fn is_binary(data: &[u8]) -> bool {
    data.starts_with(MAGIC)
}

/// Write a code unit to a writer
pub fn write_unit<W: Write>(w: &mut W, unit: &CodeUnit) -> io::Result<()> {
    w.write_all(MAGIC)?;
    write_u32(w, VERSION)?;
    write_string(w, &unit.name)?;

    write_u32(w, unit.constants.len() as u32)?;
    for constant in &unit.constants {
        match constant {
            Constant::Int(n) => {
                write_u8(w, 0)?;
                write_i64(w, *n)?;
            }
            Constant::Float(f) => {
                write_u8(w, 1)?;
                write_f64(w, *f)?;
            }
            Constant::Str(s) => {
                write_u8(w, 2)?;
                write_string(w, s)?;
            }
        }
    }

    write_u32(w, unit.functions.len() as u32)?;
    for func in &unit.functions {
        write_function(w, func)?;
    }
    Ok(())
}

/// Read a code unit from a reader
pub fn read_unit<R: Read>(r: &mut R) -> Result<CodeUnit, BytecodeError> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic)
        .map_err(|_| BytecodeError::UnexpectedEof)?;
    if &magic != MAGIC {
        return Err(BytecodeError::InvalidMagic);
    }

    let version = read_u32(r)?;
    if version != VERSION {
        return Err(BytecodeError::UnsupportedVersion(version));
    }

    let name = read_string(r)?;

    let constant_count = read_u32(r)? as usize;
    let mut constants = Vec::with_capacity(constant_count.min(1024));
    for _ in 0..constant_count {
        let constant = match read_u8(r)? {
            0 => Constant::Int(read_i64(r)?),
            1 => Constant::Float(read_f64(r)?),
            2 => Constant::Str(read_string(r)?),
            tag => return Err(BytecodeError::InvalidConstantTag(tag)),
        };
        constants.push(constant);
    }

    let func_count = read_u32(r)? as usize;
    let mut functions = Vec::with_capacity(func_count.min(1024));
    for _ in 0..func_count {
        functions.push(read_function(r)?);
    }

    Ok(CodeUnit {
        name,
        constants,
        functions,
    })
}

fn write_function<W: Write>(w: &mut W, func: &Function) -> io::Result<()> {
    write_string(w, &func.name)?;
    write_u8(w, func.arity)?;
    write_u16(w, func.locals)?;
    write_u16(w, func.upvalues)?;
    write_u8(w, func.returns)?;
    write_u8(w, if func.exported { FLAG_EXPORTED } else { 0 })?;

    let code = encode_code(&func.code);
    write_u32(w, code.len() as u32)?;
    w.write_all(&code)?;

    write_u32(w, func.lines.entries.len() as u32)?;
    for entry in &func.lines.entries {
        write_u32(w, entry.pc)?;
        write_u32(w, entry.line)?;
    }
    Ok(())
}

fn read_function<R: Read>(r: &mut R) -> Result<Function, BytecodeError> {
    let name = read_string(r)?;
    let arity = read_u8(r)?;
    let locals = read_u16(r)?;
    let upvalues = read_u16(r)?;
    let returns = read_u8(r)?;
    let flags = read_u8(r)?;

    let code_len = read_u32(r)? as usize;
    let bytes = read_bytes(r, code_len)?;
    let code = decode_code(&name, &bytes)?;

    let line_count = read_u32(r)? as usize;
    let mut lines = LineTable::new();
    for _ in 0..line_count.min(code.len() + 1) {
        let pc = read_u32(r)?;
        let line = read_u32(r)?;
        lines.entries.push(LineEntry { pc, line });
    }
    if line_count > code.len() + 1 {
        // More entries than instructions cannot be well formed.
        return Err(VerifyError::new(name, 0, VerifyErrorKind::MalformedLineTable).into());
    }

    Ok(Function {
        name,
        arity,
        locals,
        upvalues,
        returns,
        exported: flags & FLAG_EXPORTED != 0,
        code,
        lines,
    })
}

fn op_size(op: &Op) -> usize {
    1 + match op {
        Op::Int(_) => 8,
        Op::Const(_) | Op::GetGlobal(_) | Op::SetGlobal(_) => 4,
        Op::Closure(_) | Op::NewArray(_) => 4,
        Op::GetLocal(_) | Op::SetLocal(_) | Op::GetUpvalue(_) | Op::SetUpvalue(_) => 2,
        Op::Jump(_) | Op::JumpIfFalse(_) | Op::JumpIfTrue(_) | Op::Try(_) => 4,
        Op::Call { .. } => 2,
        _ => 0,
    }
}

/// Encode instructions, converting jump offsets to byte offsets.
pub fn encode_code(code: &[Op]) -> Vec<u8> {
    let mut offsets = Vec::with_capacity(code.len() + 1);
    let mut pos = 0usize;
    for op in code {
        offsets.push(pos);
        pos += op_size(op);
    }
    offsets.push(pos);

    let mut buf = Vec::with_capacity(pos);
    for (pc, op) in code.iter().enumerate() {
        let op = match op.jump_offset() {
            Some(off) => {
                let end = offsets[pc + 1] as i64;
                let byte_off = match jump_target(pc, off).and_then(|t| offsets.get(t)) {
                    Some(&target) if target < pos => target as i64 - end,
                    // Keep a bad target bad so the decoder rejects it.
                    _ => i32::MAX as i64,
                };
                op.with_jump_offset(byte_off.clamp(i32::MIN as i64, i32::MAX as i64) as i32)
            }
            None => *op,
        };
        // Writing into a Vec cannot fail.
        let _ = write_op(&mut buf, &op);
    }
    buf
}

/// Decode instructions, converting byte jump offsets back to instruction
/// offsets.
pub fn decode_code(function: &str, bytes: &[u8]) -> Result<Vec<Op>, BytecodeError> {
    let mut cursor = Cursor::new(bytes);
    let mut starts = Vec::new();
    let mut code = Vec::new();

    while (cursor.position() as usize) < bytes.len() {
        let start = cursor.position() as usize;
        starts.push(start);
        let op = read_op(&mut cursor).map_err(|e| match e {
            BytecodeError::InvalidOpcode(tag) => {
                VerifyError::new(function, start, VerifyErrorKind::InvalidOpcode(tag)).into()
            }
            other => other,
        })?;
        code.push(op);
    }

    for pc in 0..code.len() {
        let Some(off) = code[pc].jump_offset() else {
            continue;
        };
        let end = starts.get(pc + 1).copied().unwrap_or(bytes.len()) as i64;
        let target = end + off as i64;
        if target < 0 || target >= bytes.len() as i64 {
            return Err(VerifyError::new(
                function,
                starts[pc],
                VerifyErrorKind::InvalidJumpTarget { target },
            )
            .into());
        }
        let Ok(index) = starts.binary_search(&(target as usize)) else {
            return Err(VerifyError::new(
                function,
                starts[pc],
                VerifyErrorKind::MisalignedJumpTarget,
            )
            .into());
        };
        let relative = index as i64 - (pc as i64 + 1);
        code[pc] = code[pc].with_jump_offset(relative as i32);
    }

    Ok(code)
}

fn write_op<W: Write>(w: &mut W, op: &Op) -> io::Result<()> {
    match op {
        Op::Nil => write_u8(w, OP_NIL)?,
        Op::True => write_u8(w, OP_TRUE)?,
        Op::False => write_u8(w, OP_FALSE)?,
        Op::Int(v) => {
            write_u8(w, OP_INT)?;
            write_i64(w, *v)?;
        }
        Op::Const(idx) => {
            write_u8(w, OP_CONST)?;
            write_u32(w, *idx)?;
        }
        Op::Pop => write_u8(w, OP_POP)?,
        Op::Dup => write_u8(w, OP_DUP)?,
        Op::Swap => write_u8(w, OP_SWAP)?,
        Op::GetLocal(idx) => {
            write_u8(w, OP_GET_LOCAL)?;
            write_u16(w, *idx)?;
        }
        Op::SetLocal(idx) => {
            write_u8(w, OP_SET_LOCAL)?;
            write_u16(w, *idx)?;
        }
        Op::GetGlobal(idx) => {
            write_u8(w, OP_GET_GLOBAL)?;
            write_u32(w, *idx)?;
        }
        Op::SetGlobal(idx) => {
            write_u8(w, OP_SET_GLOBAL)?;
            write_u32(w, *idx)?;
        }
        Op::GetUpvalue(idx) => {
            write_u8(w, OP_GET_UPVALUE)?;
            write_u16(w, *idx)?;
        }
        Op::SetUpvalue(idx) => {
            write_u8(w, OP_SET_UPVALUE)?;
            write_u16(w, *idx)?;
        }
        Op::Add => write_u8(w, OP_ADD)?,
        Op::Sub => write_u8(w, OP_SUB)?,
        Op::Mul => write_u8(w, OP_MUL)?,
        Op::Div => write_u8(w, OP_DIV)?,
        Op::Mod => write_u8(w, OP_MOD)?,
        Op::Neg => write_u8(w, OP_NEG)?,
        Op::Eq => write_u8(w, OP_EQ)?,
        Op::Ne => write_u8(w, OP_NE)?,
        Op::Lt => write_u8(w, OP_LT)?,
        Op::Le => write_u8(w, OP_LE)?,
        Op::Gt => write_u8(w, OP_GT)?,
        Op::Ge => write_u8(w, OP_GE)?,
        Op::Not => write_u8(w, OP_NOT)?,
        Op::Jump(off) => {
            write_u8(w, OP_JUMP)?;
            write_i32(w, *off)?;
        }
        Op::JumpIfFalse(off) => {
            write_u8(w, OP_JUMP_IF_FALSE)?;
            write_i32(w, *off)?;
        }
        Op::JumpIfTrue(off) => {
            write_u8(w, OP_JUMP_IF_TRUE)?;
            write_i32(w, *off)?;
        }
        Op::Call { argc, results } => {
            write_u8(w, OP_CALL)?;
            write_u8(w, *argc)?;
            write_u8(w, *results)?;
        }
        Op::Return => write_u8(w, OP_RETURN)?,
        Op::Closure(idx) => {
            write_u8(w, OP_CLOSURE)?;
            write_u32(w, *idx)?;
        }
        Op::NewArray(n) => {
            write_u8(w, OP_NEW_ARRAY)?;
            write_u32(w, *n)?;
        }
        Op::NewTable => write_u8(w, OP_NEW_TABLE)?,
        Op::GetIndex => write_u8(w, OP_GET_INDEX)?,
        Op::SetIndex => write_u8(w, OP_SET_INDEX)?,
        Op::Len => write_u8(w, OP_LEN)?,
        Op::Try(off) => {
            write_u8(w, OP_TRY)?;
            write_i32(w, *off)?;
        }
        Op::EndTry => write_u8(w, OP_END_TRY)?,
        Op::Throw => write_u8(w, OP_THROW)?,
    }
    Ok(())
}

fn read_op<R: Read>(r: &mut R) -> Result<Op, BytecodeError> {
    let tag = read_u8(r)?;
    let op = match tag {
        OP_NIL => Op::Nil,
        OP_TRUE => Op::True,
        OP_FALSE => Op::False,
        OP_INT => Op::Int(read_i64(r)?),
        OP_CONST => Op::Const(read_u32(r)?),
        OP_POP => Op::Pop,
        OP_DUP => Op::Dup,
        OP_SWAP => Op::Swap,
        OP_GET_LOCAL => Op::GetLocal(read_u16(r)?),
        OP_SET_LOCAL => Op::SetLocal(read_u16(r)?),
        OP_GET_GLOBAL => Op::GetGlobal(read_u32(r)?),
        OP_SET_GLOBAL => Op::SetGlobal(read_u32(r)?),
        OP_GET_UPVALUE => Op::GetUpvalue(read_u16(r)?),
        OP_SET_UPVALUE => Op::SetUpvalue(read_u16(r)?),
        OP_ADD => Op::Add,
        OP_SUB => Op::Sub,
        OP_MUL => Op::Mul,
        OP_DIV => Op::Div,
        OP_MOD => Op::Mod,
        OP_NEG => Op::Neg,
        OP_EQ => Op::Eq,
        OP_NE => Op::Ne,
        OP_LT => Op::Lt,
        OP_LE => Op::Le,
        OP_GT => Op::Gt,
        OP_GE => Op::Ge,
        OP_NOT => Op::Not,
        OP_JUMP => Op::Jump(read_i32(r)?),
        OP_JUMP_IF_FALSE => Op::JumpIfFalse(read_i32(r)?),
        OP_JUMP_IF_TRUE => Op::JumpIfTrue(read_i32(r)?),
        OP_CALL => Op::Call {
            argc: read_u8(r)?,
            results: read_u8(r)?,
        },
        OP_RETURN => Op::Return,
        OP_CLOSURE => Op::Closure(read_u32(r)?),
        OP_NEW_ARRAY => Op::NewArray(read_u32(r)?),
        OP_NEW_TABLE => Op::NewTable,
        OP_GET_INDEX => Op::GetIndex,
        OP_SET_INDEX => Op::SetIndex,
        OP_LEN => Op::Len,
        OP_TRY => Op::Try(read_i32(r)?),
        OP_END_TRY => Op::EndTry,
        OP_THROW => Op::Throw,
        other => return Err(BytecodeError::InvalidOpcode(other)),
    };
    Ok(op)
}

fn write_u8<W: Write>(w: &mut W, v: u8) -> io::Result<()> {
    w.write_all(&[v])
}

fn read_u8<R: Read>(r: &mut R) -> Result<u8, BytecodeError> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)
        .map_err(|_| BytecodeError::UnexpectedEof)?;
    Ok(buf[0])
}

fn write_u16<W: Write>(w: &mut W, v: u16) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn read_u16<R: Read>(r: &mut R) -> Result<u16, BytecodeError> {
    let mut buf = [0u8; 2];
    r.read_exact(&mut buf)
        .map_err(|_| BytecodeError::UnexpectedEof)?;
    Ok(u16::from_le_bytes(buf))
}

fn write_u32<W: Write>(w: &mut W, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32, BytecodeError> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)
        .map_err(|_| BytecodeError::UnexpectedEof)?;
    Ok(u32::from_le_bytes(buf))
}

fn write_i32<W: Write>(w: &mut W, v: i32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn read_i32<R: Read>(r: &mut R) -> Result<i32, BytecodeError> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)
        .map_err(|_| BytecodeError::UnexpectedEof)?;
    Ok(i32::from_le_bytes(buf))
}

fn write_i64<W: Write>(w: &mut W, v: i64) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn read_i64<R: Read>(r: &mut R) -> Result<i64, BytecodeError> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)
        .map_err(|_| BytecodeError::UnexpectedEof)?;
    Ok(i64::from_le_bytes(buf))
}

fn write_f64<W: Write>(w: &mut W, v: f64) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn read_f64<R: Read>(r: &mut R) -> Result<f64, BytecodeError> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)
        .map_err(|_| BytecodeError::UnexpectedEof)?;
    Ok(f64::from_le_bytes(buf))
}

fn write_string<W: Write>(w: &mut W, s: &str) -> io::Result<()> {
    write_u32(w, s.len() as u32)?;
    w.write_all(s.as_bytes())
}

/// Read exactly `len` bytes without trusting `len` for preallocation.
fn read_bytes<R: Read>(r: &mut R, len: usize) -> Result<Vec<u8>, BytecodeError> {
    let mut buf = Vec::new();
    r.take(len as u64).read_to_end(&mut buf)?;
    if buf.len() != len {
        return Err(BytecodeError::UnexpectedEof);
    }
    Ok(buf)
}

fn read_string<R: Read>(r: &mut R) -> Result<String, BytecodeError> {
    let len = read_u32(r)? as usize;
    let buf = read_bytes(r, len)?;
    String::from_utf8(buf).map_err(|_| BytecodeError::InvalidUtf8)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_unit() -> CodeUnit {
        let mut unit = CodeUnit::new("sample");
        let name = unit.add_constant(Constant::Str("counter".into()));
        unit.add_constant(Constant::Float(2.5));
        unit.add_constant(Constant::Int(-9));

        let mut main = Function::new("main", 1, 1);
        main.locals = 2;
        main.code = vec![
            Op::GetLocal(0),
            Op::JumpIfFalse(3),
            Op::Int(i64::MIN),
            Op::SetGlobal(name),
            Op::Jump(1),
            Op::Nil,
            Op::Const(1),
            Op::Return,
        ];
        main.lines.add(0, 1);
        main.lines.add(2, 2);

        let mut inner = Function::new("inner", 0, 1);
        inner.exported = false;
        inner.upvalues = 1;
        inner.code = vec![Op::GetUpvalue(0), Op::Call { argc: 0, results: 1 }, Op::Return];

        unit.functions.push(main);
        unit.functions.push(inner);
        unit
    }

    #[test]
    fn test_roundtrip_unit() {
        let unit = sample_unit();
        let bytes = serialize(&unit);
        assert!(is_binary(&bytes));
        let restored = deserialize(&bytes).unwrap();
        assert_eq!(restored, unit);
    }

    #[test]
    fn test_jumps_become_byte_offsets() {
        // jump over `int` (9 bytes): byte offset 9, instruction offset 1
        let code = vec![Op::Jump(1), Op::Int(5), Op::Return];
        let bytes = encode_code(&code);
        assert_eq!(bytes[0], OP_JUMP);
        assert_eq!(i32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]), 9);
        assert_eq!(decode_code("f", &bytes).unwrap(), code);
    }

    #[test]
    fn test_backward_jump() {
        let code = vec![Op::Nil, Op::Pop, Op::Jump(-3)];
        let bytes = encode_code(&code);
        assert_eq!(decode_code("f", &bytes).unwrap(), code);
    }

    #[test]
    fn test_invalid_magic() {
        let result = deserialize(b"BADM\x01\x00\x00\x00");
        assert!(matches!(result, Err(BytecodeError::InvalidMagic)));
    }

    #[test]
    fn test_unsupported_version() {
        let result = deserialize(b"SVMU\xFF\x00\x00\x00");
        assert!(matches!(result, Err(BytecodeError::UnsupportedVersion(255))));
    }

    #[test]
    fn test_truncated() {
        let bytes = serialize(&sample_unit());
        for cut in [3, 8, 20, bytes.len() - 1] {
            assert!(deserialize(&bytes[..cut]).is_err(), "cut at {}", cut);
        }
    }

    #[test]
    fn test_trailing_bytes() {
        let mut bytes = serialize(&sample_unit());
        bytes.push(0);
        assert!(matches!(deserialize(&bytes), Err(BytecodeError::TrailingBytes(1))));
    }

    #[test]
    fn test_invalid_opcode_is_verify_error() {
        let err = decode_code("f", &[OP_NIL, 0xEE, OP_RETURN]).unwrap_err();
        match err {
            BytecodeError::Verify(e) => {
                assert_eq!(e.kind, VerifyErrorKind::InvalidOpcode(0xEE));
                assert_eq!(e.offset, 1);
                assert_eq!(e.function, "f");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_misaligned_jump() {
        // Jump into the middle of the following `int` operand.
        let mut bytes = vec![OP_JUMP];
        bytes.extend_from_slice(&2i32.to_le_bytes());
        bytes.push(OP_INT);
        bytes.extend_from_slice(&7i64.to_le_bytes());
        bytes.push(OP_RETURN);
        let err = decode_code("f", &bytes).unwrap_err();
        assert!(matches!(
            err,
            BytecodeError::Verify(VerifyError { kind: VerifyErrorKind::MisalignedJumpTarget, .. })
        ));
    }

    #[test]
    fn test_out_of_range_jump() {
        let mut bytes = vec![OP_JUMP];
        bytes.extend_from_slice(&100i32.to_le_bytes());
        let err = decode_code("f", &bytes).unwrap_err();
        assert!(matches!(
            err,
            BytecodeError::Verify(VerifyError { kind: VerifyErrorKind::InvalidJumpTarget { .. }, .. })
        ));
    }

    #[test]
    fn test_invalid_constant_tag() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&VERSION.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes()); // empty name
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.push(9);
        assert!(matches!(deserialize(&bytes), Err(BytecodeError::InvalidConstantTag(9))));
    }
}
