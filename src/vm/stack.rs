//! Operand/locals stack and the frame chain.

use super::error::{ErrorKind, RuntimeError, VmError};
use super::heap::GcRef;
use super::value::Value;

/// Activation record of one in-progress script call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub closure: GcRef,
    pub unit: u32,
    pub function: u32,
    /// Next instruction to execute; for a suspended caller, its return pc.
    pub pc: usize,
    /// Slot of the first argument. The callee itself sits at `base - 1`.
    pub base: usize,
    /// Number of local slots, parameters included.
    pub locals: usize,
    /// Number of values the caller expects back.
    pub results: usize,
}

impl Frame {
    /// First operand slot above the locals.
    pub fn floor(&self) -> usize {
        self.base + self.locals
    }
}

/// What `push_frame` needs to know about the function being entered.
#[derive(Debug, Clone, Copy)]
pub struct Callee {
    pub closure: GcRef,
    pub unit: u32,
    pub function: u32,
    pub arity: usize,
    pub locals: usize,
    pub max_stack: usize,
}

/// One contiguous, bounded value stack shared by all frames.
///
/// `push_frame` reserves room for the callee's locals plus its verified
/// maximum operand depth, so instructions inside a frame never need a
/// capacity check of their own.
pub struct CallStack {
    values: Vec<Value>,
    frames: Vec<Frame>,
    capacity: usize,
    max_frames: usize,
}

impl CallStack {
    pub fn new(capacity: usize, max_frames: usize) -> Self {
        Self {
            values: Vec::with_capacity(capacity.min(4096)),
            frames: Vec::with_capacity(max_frames.min(256)),
            capacity,
            max_frames,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn frame(&self) -> Result<&Frame, VmError> {
        self.frames
            .last()
            .ok_or_else(|| VmError::internal("no active frame"))
    }

    pub fn frame_mut(&mut self) -> Result<&mut Frame, VmError> {
        self.frames
            .last_mut()
            .ok_or_else(|| VmError::internal("no active frame"))
    }

    /// Lowest slot the current frame may pop.
    fn floor(&self) -> usize {
        self.frames.last().map(Frame::floor).unwrap_or(0)
    }

    #[inline]
    pub fn push(&mut self, value: Value) {
        debug_assert!(self.values.len() < self.capacity);
        self.values.push(value);
    }

    /// Make room for `n` more values outside any frame reservation
    /// (host arguments, native results).
    pub fn ensure(&self, n: usize) -> Result<(), RuntimeError> {
        if self.values.len() + n > self.capacity {
            return Err(RuntimeError::new(
                ErrorKind::StackOverflow,
                format!("value stack capacity {} exceeded", self.capacity),
            ));
        }
        Ok(())
    }

    #[inline]
    pub fn pop(&mut self) -> Result<Value, VmError> {
        if self.values.len() <= self.floor() {
            return Err(VmError::internal("operand stack underflow"));
        }
        self.values
            .pop()
            .ok_or_else(|| VmError::internal("operand stack underflow"))
    }

    /// Value `n` slots below the top (0 = top) of the current frame.
    #[inline]
    pub fn peek(&self, n: usize) -> Result<Value, VmError> {
        let len = self.values.len();
        if n >= len || len - n - 1 < self.floor() {
            return Err(VmError::internal("operand stack underflow"));
        }
        Ok(self.values[len - n - 1])
    }

    /// The top `n` values of the current frame, bottom first.
    pub fn top(&self, n: usize) -> Result<&[Value], VmError> {
        let len = self.values.len();
        if n > len || len - n < self.floor() {
            return Err(VmError::internal("operand stack underflow"));
        }
        Ok(&self.values[len - n..])
    }

    /// Drop the top `n` values of the current frame.
    pub fn discard(&mut self, n: usize) -> Result<(), VmError> {
        let len = self.values.len();
        if n > len || len - n < self.floor() {
            return Err(VmError::internal("operand stack underflow"));
        }
        self.values.truncate(len - n);
        Ok(())
    }

    pub fn swap(&mut self) -> Result<(), VmError> {
        let len = self.values.len();
        if len < 2 || len - 2 < self.floor() {
            return Err(VmError::internal("operand stack underflow"));
        }
        self.values.swap(len - 1, len - 2);
        Ok(())
    }

    fn local_slot(&self, index: u16) -> Result<usize, VmError> {
        let frame = self.frame()?;
        let index = index as usize;
        if index >= frame.locals {
            return Err(VmError::internal(format!(
                "local {} outside frame of {} locals",
                index, frame.locals
            )));
        }
        Ok(frame.base + index)
    }

    pub fn local(&self, index: u16) -> Result<Value, VmError> {
        let slot = self.local_slot(index)?;
        Ok(self.values[slot])
    }

    pub fn set_local(&mut self, index: u16, value: Value) -> Result<(), VmError> {
        let slot = self.local_slot(index)?;
        self.values[slot] = value;
        Ok(())
    }

    /// Enter a script function whose callee and `argc` arguments are
    /// already on top of the stack.
    pub fn push_frame(&mut self, callee: Callee, argc: usize, results: usize) -> Result<(), RuntimeError> {
        if argc != callee.arity {
            return Err(RuntimeError::new(
                ErrorKind::ArityMismatch,
                format!("function expects {} argument(s), got {}", callee.arity, argc),
            ));
        }
        if self.frames.len() >= self.max_frames {
            return Err(RuntimeError::new(
                ErrorKind::StackOverflow,
                format!("call depth {} exceeded", self.max_frames),
            ));
        }
        let base = self.values.len() - argc;
        if base + callee.locals + callee.max_stack > self.capacity {
            return Err(RuntimeError::new(
                ErrorKind::StackOverflow,
                format!("value stack capacity {} exceeded", self.capacity),
            ));
        }

        self.values.resize(base + callee.locals, Value::Nil);
        self.frames.push(Frame {
            closure: callee.closure,
            unit: callee.unit,
            function: callee.function,
            pc: 0,
            base,
            locals: callee.locals,
            results,
        });
        Ok(())
    }

    /// Leave the current frame, moving its top `count` values into the
    /// callee slot and adjusting them to the count the caller expects.
    pub fn pop_frame(&mut self, count: usize) -> Result<Frame, VmError> {
        let frame = self
            .frames
            .pop()
            .ok_or_else(|| VmError::internal("return without an active frame"))?;
        let len = self.values.len();
        if frame.base == 0 || len < frame.floor() + count {
            return Err(VmError::internal(format!(
                "frame returned {} value(s) with only {} on its stack",
                count,
                len.saturating_sub(frame.floor())
            )));
        }

        let dest = frame.base - 1;
        self.values.copy_within(len - count.., dest);
        self.values.truncate(dest + count);
        self.values.resize(dest + frame.results, Value::Nil);
        Ok(frame)
    }

    /// Unwind to a recorded stack and frame depth.
    pub fn unwind(&mut self, depth: usize, frames: usize) {
        self.frames.truncate(frames);
        self.values.truncate(depth);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn callee(arity: usize, locals: usize, max_stack: usize) -> Callee {
        Callee {
            closure: GcRef { index: 0, generation: 0 },
            unit: 0,
            function: 0,
            arity,
            locals,
            max_stack,
        }
    }

    #[test]
    fn test_push_frame_pads_locals() {
        let mut stack = CallStack::new(64, 8);
        stack.push(Value::Nil); // callee
        stack.push(Value::Int(1));
        stack.push(Value::Int(2));
        stack.push_frame(callee(2, 4, 4), 2, 1).unwrap();

        let frame = *stack.frame().unwrap();
        assert_eq!(frame.base, 1);
        assert_eq!(stack.len(), 5);
        assert_eq!(stack.local(1).unwrap(), Value::Int(2));
        assert_eq!(stack.local(3).unwrap(), Value::Nil);
        assert!(stack.local(4).is_err());
    }

    #[test]
    fn test_arity_mismatch() {
        let mut stack = CallStack::new(64, 8);
        stack.push(Value::Nil);
        stack.push(Value::Int(1));
        let err = stack.push_frame(callee(2, 2, 0), 1, 1).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ArityMismatch);
        assert_eq!(stack.depth(), 0);
    }

    #[test]
    fn test_overflow_by_capacity_and_depth() {
        let mut stack = CallStack::new(8, 8);
        stack.push(Value::Nil);
        let err = stack.push_frame(callee(0, 4, 8), 0, 0).unwrap_err();
        assert_eq!(err.kind, ErrorKind::StackOverflow);

        let mut stack = CallStack::new(64, 1);
        stack.push(Value::Nil);
        stack.push_frame(callee(0, 0, 1), 0, 0).unwrap();
        stack.push(Value::Nil);
        let err = stack.push_frame(callee(0, 0, 1), 0, 0).unwrap_err();
        assert_eq!(err.kind, ErrorKind::StackOverflow);
    }

    #[test]
    fn test_pop_frame_depth_matches_results() {
        let mut stack = CallStack::new(64, 8);
        stack.push(Value::Int(99)); // caller's temporary
        let before = stack.len();
        stack.push(Value::Nil); // callee
        stack.push(Value::Int(5));
        stack.push_frame(callee(1, 2, 4), 1, 2).unwrap();
        stack.push(Value::Int(7));
        stack.push(Value::Int(8));
        stack.push(Value::Int(9));

        stack.pop_frame(2).unwrap();
        assert_eq!(stack.len(), before + 2);
        assert_eq!(stack.values(), &[Value::Int(99), Value::Int(8), Value::Int(9)]);
    }

    #[test]
    fn test_pop_frame_pads_missing_results() {
        let mut stack = CallStack::new(64, 8);
        stack.push(Value::Nil);
        stack.push_frame(callee(0, 0, 2), 0, 3).unwrap();
        stack.push(Value::Int(1));
        stack.pop_frame(1).unwrap();
        assert_eq!(stack.values(), &[Value::Int(1), Value::Nil, Value::Nil]);
    }

    #[test]
    fn test_pop_below_floor_is_internal() {
        let mut stack = CallStack::new(64, 8);
        stack.push(Value::Nil);
        stack.push(Value::Int(1));
        stack.push_frame(callee(1, 1, 2), 1, 0).unwrap();
        assert!(matches!(stack.pop(), Err(VmError::Internal(_))));
        assert!(matches!(stack.peek(0), Err(VmError::Internal(_))));
        stack.push(Value::Int(2));
        assert_eq!(stack.pop().unwrap(), Value::Int(2));
    }

    #[test]
    fn test_ensure() {
        let stack = CallStack::new(2, 8);
        assert!(stack.ensure(2).is_ok());
        assert_eq!(stack.ensure(3).unwrap_err().kind, ErrorKind::StackOverflow);
    }
}
