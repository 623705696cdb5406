/// Bytecode operations.
///
/// Jump offsets are relative to the instruction following the jump and
/// are counted in instructions; the binary encoding converts them to and
/// from byte offsets.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Op {
    // ========================================
    // Constants
    // ========================================
    Nil,
    True,
    False,
    Int(i64),
    /// Push constant-pool entry (strings are interned on load).
    Const(u32),

    // ========================================
    // Stack Manipulation
    // ========================================
    Pop,
    Dup,
    Swap,

    // ========================================
    // Variables
    // ========================================
    GetLocal(u16),
    SetLocal(u16),
    /// Operand names a string constant holding the global's name.
    GetGlobal(u32),
    SetGlobal(u32),
    GetUpvalue(u16),
    SetUpvalue(u16),

    // ========================================
    // Arithmetic
    // ========================================
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Neg,

    // ========================================
    // Comparison / Logic
    // ========================================
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Not,

    // ========================================
    // Control Flow
    // ========================================
    Jump(i32),
    JumpIfFalse(i32),
    JumpIfTrue(i32),

    // ========================================
    // Calls
    // ========================================
    /// [callee, arg0..argN] → [result0..resultM]
    Call { argc: u8, results: u8 },
    Return,

    // ========================================
    // Objects
    // ========================================
    /// Pops the function's declared upvalue count as captures.
    Closure(u32),
    NewArray(u32),
    NewTable,
    GetIndex,
    SetIndex,
    Len,

    // ========================================
    // Protected Execution
    // ========================================
    /// Install a handler at the given relative offset.
    Try(i32),
    EndTry,
    Throw,
}

impl Op {
    /// Assembly mnemonic.
    pub fn name(&self) -> &'static str {
        match self {
            Op::Nil => "nil",
            Op::True => "true",
            Op::False => "false",
            Op::Int(_) => "int",
            Op::Const(_) => "const",
            Op::Pop => "pop",
            Op::Dup => "dup",
            Op::Swap => "swap",
            Op::GetLocal(_) => "get_local",
            Op::SetLocal(_) => "set_local",
            Op::GetGlobal(_) => "get_global",
            Op::SetGlobal(_) => "set_global",
            Op::GetUpvalue(_) => "get_upvalue",
            Op::SetUpvalue(_) => "set_upvalue",
            Op::Add => "add",
            Op::Sub => "sub",
            Op::Mul => "mul",
            Op::Div => "div",
            Op::Mod => "mod",
            Op::Neg => "neg",
            Op::Eq => "eq",
            Op::Ne => "ne",
            Op::Lt => "lt",
            Op::Le => "le",
            Op::Gt => "gt",
            Op::Ge => "ge",
            Op::Not => "not",
            Op::Jump(_) => "jump",
            Op::JumpIfFalse(_) => "jump_if_false",
            Op::JumpIfTrue(_) => "jump_if_true",
            Op::Call { .. } => "call",
            Op::Return => "return",
            Op::Closure(_) => "closure",
            Op::NewArray(_) => "new_array",
            Op::NewTable => "new_table",
            Op::GetIndex => "get_index",
            Op::SetIndex => "set_index",
            Op::Len => "len",
            Op::Try(_) => "try",
            Op::EndTry => "end_try",
            Op::Throw => "throw",
        }
    }

    /// Relative offset of a branching instruction.
    pub fn jump_offset(&self) -> Option<i32> {
        match self {
            Op::Jump(off) | Op::JumpIfFalse(off) | Op::JumpIfTrue(off) | Op::Try(off) => {
                Some(*off)
            }
            _ => None,
        }
    }

    /// Same instruction with its relative offset replaced.
    pub fn with_jump_offset(self, off: i32) -> Op {
        match self {
            Op::Jump(_) => Op::Jump(off),
            Op::JumpIfFalse(_) => Op::JumpIfFalse(off),
            Op::JumpIfTrue(_) => Op::JumpIfTrue(off),
            Op::Try(_) => Op::Try(off),
            other => other,
        }
    }

    /// Whether execution never continues to the next instruction.
    pub fn is_terminator(&self) -> bool {
        matches!(self, Op::Jump(_) | Op::Return | Op::Throw)
    }
}

/// Absolute target of a relative jump at instruction `pc`.
pub fn jump_target(pc: usize, offset: i32) -> Option<usize> {
    let target = pc as i64 + 1 + offset as i64;
    usize::try_from(target).ok()
}
