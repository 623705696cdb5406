//! Bytecode verifier.
//!
//! Every function of a unit is checked before anything executes:
//! - Operands: constant, local, upvalue and function indices are in range
//! - Control flow: jump targets land inside the function
//! - Stack heights: each basic block has one entry height, no underflow,
//!   no height above the configured limit, no fall-through past the end
//! - Handlers: each basic block has one set of active `try` handlers, and
//!   protected code never pops below the height its handler restores
//!
//! Verification yields the maximum operand depth of each function, which
//! the stack manager reserves on every call.

#![allow(clippy::collapsible_if)]

use std::collections::{HashMap, HashSet, VecDeque};

use thiserror::Error;

use super::ops::{Op, jump_target};
use super::{CodeUnit, Constant, Function};

/// What a verification failure found.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum VerifyErrorKind {
    #[error("invalid opcode 0x{0:02x}")]
    InvalidOpcode(u8),
    #[error("jump target {target} is out of bounds")]
    InvalidJumpTarget { target: i64 },
    #[error("jump target is not an instruction boundary")]
    MisalignedJumpTarget,
    #[error("stack height mismatch: expected {expected}, got {actual}")]
    StackHeightMismatch { expected: usize, actual: usize },
    #[error("stack underflow: requires {required} values, but only {actual} on stack")]
    StackUnderflow { required: usize, actual: usize },
    #[error("stack height {height} exceeds max_stack {max}")]
    StackOverflow { height: usize, max: usize },
    #[error("empty function")]
    EmptyFunction,
    #[error("control falls off the end of the function")]
    MissingReturn,
    #[error("constant index {0} out of range")]
    ConstantOutOfRange(u32),
    #[error("constant {0} is not a string")]
    ExpectedStringConstant(u32),
    #[error("local {index} out of range ({count} locals)")]
    LocalOutOfRange { index: u16, count: u16 },
    #[error("upvalue {index} out of range ({count} upvalues)")]
    UpvalueOutOfRange { index: u16, count: u16 },
    #[error("function index {0} out of range")]
    FunctionOutOfRange(u32),
    #[error("{locals} locals cannot hold {arity} parameters")]
    LocalsBelowArity { locals: u16, arity: u8 },
    #[error("exported function captures {0} upvalue(s)")]
    ExportedClosure(u16),
    #[error("function is exported twice")]
    DuplicateExport,
    #[error("malformed line table")]
    MalformedLineTable,
    #[error("pops below height {floor} restored by the active handler (height {height})")]
    HandlerUnderflow { floor: usize, height: usize },
    #[error("active handlers differ at merge: expected {expected}, got {actual}")]
    HandlerMismatch { expected: usize, actual: usize },
    #[error("end_try without an active handler")]
    UnmatchedEndTry,
}

/// Verification failure, located by function and instruction offset.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("verification failed in {function} at {offset}: {kind}")]
pub struct VerifyError {
    pub function: String,
    pub offset: usize,
    pub kind: VerifyErrorKind,
}

impl VerifyError {
    pub fn new(function: impl Into<String>, offset: usize, kind: VerifyErrorKind) -> Self {
        Self {
            function: function.into(),
            offset,
            kind,
        }
    }
}

/// How control reaches a successor block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    /// Jump or fall-through; the abstract state carries over unchanged.
    Flow,
    /// Unwind to the handler installed by the block's final `try`.
    Handler,
}

/// A basic block in the control flow graph
#[derive(Debug, Clone)]
pub struct BasicBlock {
    /// Start PC (inclusive)
    pub start: usize,
    /// End PC (exclusive)
    pub end: usize,
    pub successors: Vec<(usize, Edge)>,
}

/// Abstract state at a block boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
struct BlockState {
    height: usize,
    /// Heights restored by the active handlers, innermost last.
    handlers: Vec<usize>,
}

/// Control flow graph
#[derive(Debug)]
#[allow(clippy::upper_case_acronyms)]
pub struct CFG {
    pub blocks: Vec<BasicBlock>,
    pub pc_to_block: HashMap<usize, usize>,
}

/// Bytecode verifier
pub struct Verifier {
    /// Largest operand depth a function may reach.
    pub max_stack: usize,
}

impl Default for Verifier {
    fn default() -> Self {
        Self { max_stack: 256 }
    }
}

impl Verifier {
    pub fn new(max_stack: usize) -> Self {
        Self { max_stack }
    }

    /// Verify every function of a unit, returning each one's maximum
    /// operand depth.
    pub fn verify_unit(&self, unit: &CodeUnit) -> Result<Vec<usize>, VerifyError> {
        let mut exported = HashSet::new();
        for func in unit.functions.iter().filter(|f| f.exported) {
            if !exported.insert(func.name.as_str()) {
                return Err(VerifyError::new(&func.name, 0, VerifyErrorKind::DuplicateExport));
            }
        }
        unit.functions
            .iter()
            .map(|func| self.verify_function(unit, func))
            .collect()
    }

    /// Verify a function
    pub fn verify_function(&self, unit: &CodeUnit, func: &Function) -> Result<usize, VerifyError> {
        let fail = |offset, kind| VerifyError::new(&func.name, offset, kind);

        if func.code.is_empty() {
            return Err(fail(0, VerifyErrorKind::EmptyFunction));
        }
        if func.locals < func.arity as u16 {
            return Err(fail(
                0,
                VerifyErrorKind::LocalsBelowArity {
                    locals: func.locals,
                    arity: func.arity,
                },
            ));
        }
        if func.exported && func.upvalues > 0 {
            return Err(fail(0, VerifyErrorKind::ExportedClosure(func.upvalues)));
        }
        if !func.lines.is_well_formed(func.code.len()) {
            return Err(fail(0, VerifyErrorKind::MalformedLineTable));
        }

        for (pc, op) in func.code.iter().enumerate() {
            self.verify_operands(unit, func, op).map_err(|kind| fail(pc, kind))?;
        }

        let cfg = self.build_cfg(func)?;
        self.verify_stack_heights(unit, func, &cfg)
    }

    fn verify_operands(&self, unit: &CodeUnit, func: &Function, op: &Op) -> Result<(), VerifyErrorKind> {
        match *op {
            Op::Const(k) => {
                if k as usize >= unit.constants.len() {
                    return Err(VerifyErrorKind::ConstantOutOfRange(k));
                }
            }
            Op::GetGlobal(k) | Op::SetGlobal(k) => match unit.constants.get(k as usize) {
                Some(Constant::Str(_)) => {}
                Some(_) => return Err(VerifyErrorKind::ExpectedStringConstant(k)),
                None => return Err(VerifyErrorKind::ConstantOutOfRange(k)),
            },
            Op::GetLocal(index) | Op::SetLocal(index) => {
                if index >= func.locals {
                    return Err(VerifyErrorKind::LocalOutOfRange {
                        index,
                        count: func.locals,
                    });
                }
            }
            Op::GetUpvalue(index) | Op::SetUpvalue(index) => {
                if index >= func.upvalues {
                    return Err(VerifyErrorKind::UpvalueOutOfRange {
                        index,
                        count: func.upvalues,
                    });
                }
            }
            Op::Closure(f) => {
                if f as usize >= unit.functions.len() {
                    return Err(VerifyErrorKind::FunctionOutOfRange(f));
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Build control flow graph from function bytecode
    pub fn build_cfg(&self, func: &Function) -> Result<CFG, VerifyError> {
        let code = &func.code;
        let len = code.len();

        let target_of = |pc: usize, off: i32| -> Result<usize, VerifyError> {
            match jump_target(pc, off) {
                Some(target) if target < len => Ok(target),
                _ => Err(VerifyError::new(
                    &func.name,
                    pc,
                    VerifyErrorKind::InvalidJumpTarget {
                        target: pc as i64 + 1 + off as i64,
                    },
                )),
            }
        };

        // Find all leader PCs (start of basic blocks)
        let mut leaders: HashSet<usize> = HashSet::new();
        leaders.insert(0);

        for (pc, op) in code.iter().enumerate() {
            if let Some(off) = op.jump_offset() {
                leaders.insert(target_of(pc, off)?);
                if pc + 1 < len {
                    leaders.insert(pc + 1);
                }
            } else if op.is_terminator() && pc + 1 < len {
                leaders.insert(pc + 1);
            }
        }

        let mut sorted_leaders: Vec<usize> = leaders.into_iter().collect();
        sorted_leaders.sort_unstable();

        let mut blocks: Vec<BasicBlock> = Vec::new();
        let mut pc_to_block: HashMap<usize, usize> = HashMap::new();

        for (i, &start) in sorted_leaders.iter().enumerate() {
            let end = sorted_leaders.get(i + 1).copied().unwrap_or(len);
            pc_to_block.insert(start, blocks.len());
            blocks.push(BasicBlock {
                start,
                end,
                successors: Vec::new(),
            });
        }

        for block in &mut blocks {
            let last_pc = block.end - 1;
            let last_op = &code[last_pc];
            let fallthrough = pc_to_block.get(&block.end).copied();

            let mut successors = Vec::new();
            match last_op {
                Op::Jump(off) => {
                    successors.push((pc_to_block[&target_of(last_pc, *off)?], Edge::Flow));
                }
                Op::JumpIfTrue(off) | Op::JumpIfFalse(off) => {
                    successors.push((pc_to_block[&target_of(last_pc, *off)?], Edge::Flow));
                    if let Some(next) = fallthrough {
                        successors.push((next, Edge::Flow));
                    }
                }
                Op::Try(off) => {
                    successors.push((pc_to_block[&target_of(last_pc, *off)?], Edge::Handler));
                    if let Some(next) = fallthrough {
                        successors.push((next, Edge::Flow));
                    }
                }
                Op::Return | Op::Throw => {}
                _ => {
                    if let Some(next) = fallthrough {
                        successors.push((next, Edge::Flow));
                    }
                }
            }
            block.successors = successors;
        }

        Ok(CFG { blocks, pc_to_block })
    }

    /// Verify stack heights using abstract interpretation. Returns the
    /// highest operand depth reached.
    pub fn verify_stack_heights(
        &self,
        unit: &CodeUnit,
        func: &Function,
        cfg: &CFG,
    ) -> Result<usize, VerifyError> {
        let code = &func.code;
        let fail = |pc, kind| VerifyError::new(&func.name, pc, kind);

        let mut block_states: Vec<Option<BlockState>> = vec![None; cfg.blocks.len()];
        let mut worklist: VecDeque<usize> = VecDeque::new();
        let mut max_height = 0;

        // Arguments live in locals, so operands start empty.
        block_states[0] = Some(BlockState {
            height: 0,
            handlers: Vec::new(),
        });
        worklist.push_back(0);

        while let Some(block_idx) = worklist.pop_front() {
            let block = &cfg.blocks[block_idx];
            let Some(mut state) = block_states[block_idx].clone() else {
                continue;
            };
            max_height = max_height.max(state.height);

            for (pc, op) in code.iter().enumerate().take(block.end).skip(block.start) {
                let (pops, pushes) = self.stack_effect(unit, func, op);
                let height = state.height;

                if height < pops {
                    return Err(fail(
                        pc,
                        VerifyErrorKind::StackUnderflow {
                            required: pops,
                            actual: height,
                        },
                    ));
                }
                // Unwinding only truncates, so the stack must not shrink
                // below the handler's height. Return leaves the frame.
                let floor = state.handlers.last().copied().unwrap_or(0);
                if !matches!(op, Op::Return) && height - pops < floor {
                    return Err(fail(pc, VerifyErrorKind::HandlerUnderflow { floor, height }));
                }
                state.height = height - pops + pushes;
                max_height = max_height.max(state.height);

                match op {
                    Op::Try(_) => state.handlers.push(state.height),
                    Op::EndTry => {
                        if state.handlers.pop().is_none() {
                            return Err(fail(pc, VerifyErrorKind::UnmatchedEndTry));
                        }
                    }
                    _ => {}
                }
            }

            let last_pc = block.end - 1;
            if block.end == code.len() && !code[last_pc].is_terminator() {
                return Err(fail(last_pc, VerifyErrorKind::MissingReturn));
            }

            for &(succ_idx, edge) in &block.successors {
                let entry = match edge {
                    Edge::Flow => state.clone(),
                    // The handler is consumed and the error value pushed.
                    Edge::Handler => {
                        let mut handlers = state.handlers.clone();
                        handlers.pop();
                        BlockState {
                            height: state.height + 1,
                            handlers,
                        }
                    }
                };
                max_height = max_height.max(entry.height);
                match &block_states[succ_idx] {
                    None => {
                        block_states[succ_idx] = Some(entry);
                        worklist.push_back(succ_idx);
                    }
                    Some(existing) => {
                        let at = cfg.blocks[succ_idx].start;
                        if existing.height != entry.height {
                            return Err(fail(
                                at,
                                VerifyErrorKind::StackHeightMismatch {
                                    expected: existing.height,
                                    actual: entry.height,
                                },
                            ));
                        }
                        if existing.handlers != entry.handlers {
                            return Err(fail(
                                at,
                                VerifyErrorKind::HandlerMismatch {
                                    expected: existing.handlers.len(),
                                    actual: entry.handlers.len(),
                                },
                            ));
                        }
                    }
                }
            }

            if max_height > self.max_stack {
                return Err(fail(
                    block.start,
                    VerifyErrorKind::StackOverflow {
                        height: max_height,
                        max: self.max_stack,
                    },
                ));
            }
        }

        Ok(max_height)
    }

    /// Get the stack effect of an operation: (pops, pushes)
    fn stack_effect(&self, unit: &CodeUnit, func: &Function, op: &Op) -> (usize, usize) {
        match *op {
            Op::Nil | Op::True | Op::False | Op::Int(_) | Op::Const(_) => (0, 1),
            Op::GetLocal(_) | Op::GetGlobal(_) | Op::GetUpvalue(_) | Op::NewTable => (0, 1),
            Op::SetLocal(_) | Op::SetGlobal(_) | Op::SetUpvalue(_) => (1, 0),

            Op::Pop => (1, 0),
            Op::Dup => (1, 2),
            Op::Swap => (2, 2),

            Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Mod => (2, 1),
            Op::Eq | Op::Ne | Op::Lt | Op::Le | Op::Gt | Op::Ge => (2, 1),
            Op::Neg | Op::Not | Op::Len => (1, 1),

            Op::Jump(_) | Op::Try(_) | Op::EndTry => (0, 0),
            Op::JumpIfFalse(_) | Op::JumpIfTrue(_) => (1, 0),

            Op::Call { argc, results } => (argc as usize + 1, results as usize),
            // Extra values above the declared results are discarded.
            Op::Return => (func.returns as usize, 0),
            Op::Throw => (1, 0),

            Op::Closure(f) => {
                let captures = unit
                    .functions
                    .get(f as usize)
                    .map(|callee| callee.upvalues as usize)
                    .unwrap_or(0);
                (captures, 1)
            }
            Op::NewArray(n) => (n as usize, 1),
            Op::GetIndex => (2, 1),
            Op::SetIndex => (3, 0),
        }
    }
}
