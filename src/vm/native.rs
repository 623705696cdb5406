//! Host-registered native functions and their call context.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::ops::Range;
use std::rc::Rc;

use super::error::{ErrorKind, RuntimeError, VmError};
use super::heap::{Heap, HeapObject, OBJECT_HEADER, UserData};
use super::value::Value;
use super::vm::Runtime;

/// Native function body. Pushes its results through [`NativeCall::push`]
/// and returns how many of the pushed values are results.
pub type NativeFn = Rc<dyn Fn(&mut NativeCall<'_>) -> Result<usize, RuntimeError>>;

pub struct NativeFunction {
    pub name: Rc<str>,
    /// `None` accepts any argument count.
    pub arity: Option<u8>,
    pub func: NativeFn,
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeFunction")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .finish()
    }
}

/// Context handed to a native function for the duration of one call.
///
/// Arguments are borrowed from the VM stack. Everything allocated through
/// the context stays rooted until the call returns; retaining a handle
/// past that requires `Vm::pin`.
pub struct NativeCall<'a> {
    heap: &'a mut Heap,
    runtime: &'a Runtime,
    args: Range<usize>,
    name: Rc<str>,
    results: Vec<Value>,
    scratch: Vec<Value>,
    fatal: Option<VmError>,
}

impl<'a> NativeCall<'a> {
    pub(crate) fn new(heap: &'a mut Heap, runtime: &'a Runtime, args: Range<usize>, name: Rc<str>) -> Self {
        Self {
            heap,
            runtime,
            args,
            name,
            results: Vec::new(),
            scratch: Vec::new(),
            fatal: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn argc(&self) -> usize {
        self.args.len()
    }

    pub fn args(&self) -> &[Value] {
        &self.runtime.stack.values()[self.args.clone()]
    }

    /// Argument `i`, or `nil` when absent.
    pub fn arg(&self, i: usize) -> Value {
        self.args().get(i).copied().unwrap_or(Value::Nil)
    }

    fn expected(&self, i: usize, what: &str) -> RuntimeError {
        RuntimeError::type_mismatch(format!(
            "{}: argument {} must be {}, got {}",
            self.name,
            i + 1,
            what,
            self.heap.type_name(self.arg(i))
        ))
    }

    pub fn int(&self, i: usize) -> Result<i64, RuntimeError> {
        self.arg(i).as_int().ok_or_else(|| self.expected(i, "an int"))
    }

    pub fn float(&self, i: usize) -> Result<f64, RuntimeError> {
        self.arg(i).as_float().ok_or_else(|| self.expected(i, "a number"))
    }

    pub fn bool(&self, i: usize) -> Result<bool, RuntimeError> {
        self.arg(i).as_bool().ok_or_else(|| self.expected(i, "a bool"))
    }

    pub fn str(&self, i: usize) -> Result<&str, RuntimeError> {
        self.string(self.arg(i))
            .ok_or_else(|| self.expected(i, "a string"))
    }

    pub fn string(&self, value: Value) -> Option<&str> {
        value.as_ref().and_then(|r| self.heap.string(r))
    }

    pub fn heap(&self) -> &Heap {
        self.heap
    }

    /// Render a value the way `print` shows it.
    pub fn display(&self, value: Value) -> String {
        self.runtime.display(self.heap, value)
    }

    /// Append a result value.
    pub fn push(&mut self, value: Value) {
        self.results.push(value);
    }

    pub fn new_string(&mut self, s: &str) -> Result<Value, RuntimeError> {
        // An interned hit may be otherwise unreachable, so root it too.
        if let Some(r) = self.heap.lookup_string(s) {
            self.scratch.push(Value::Ref(r));
            return Ok(Value::Ref(r));
        }
        self.prepare(OBJECT_HEADER + s.len())?;
        let value = Value::Ref(self.heap.alloc_string(s)?);
        self.scratch.push(value);
        Ok(value)
    }

    pub fn new_array(&mut self, items: Vec<Value>) -> Result<Value, RuntimeError> {
        if let Some(stale) = items.iter().find(|v| v.as_ref().is_some_and(|r| !self.heap.is_live(r))) {
            return Err(RuntimeError::type_mismatch(format!(
                "{}: array element {:?} is a stale handle",
                self.name, stale
            )));
        }
        self.alloc(HeapObject::Array(items))
    }

    pub fn new_table(&mut self) -> Result<Value, RuntimeError> {
        self.alloc(HeapObject::Table(HashMap::new()))
    }

    pub fn new_userdata(&mut self, tag: u64, data: Box<dyn Any>) -> Result<Value, RuntimeError> {
        self.alloc(HeapObject::UserData(UserData { tag, data }))
    }

    fn alloc(&mut self, object: HeapObject) -> Result<Value, RuntimeError> {
        self.prepare(object.size())?;
        let value = Value::Ref(self.heap.alloc(object)?);
        self.scratch.push(value);
        Ok(value)
    }

    fn prepare(&mut self, size: usize) -> Result<(), RuntimeError> {
        if self.heap.should_collect(size) {
            let roots = self
                .runtime
                .roots()
                .chain(self.results.iter().copied())
                .chain(self.scratch.iter().copied());
            if let Err(e) = self.heap.collect(roots) {
                self.fatal = Some(e);
                return Err(RuntimeError::new(ErrorKind::Native, "heap corrupted"));
            }
        }
        Ok(())
    }

    /// Consume the context, yielding the declared results or the first
    /// fatal error raised while it was active.
    pub(crate) fn finish(self, outcome: Result<usize, RuntimeError>) -> Result<Vec<Value>, VmError> {
        if let Some(fatal) = self.fatal {
            return Err(fatal);
        }
        let count = outcome?;
        if count > self.results.len() {
            return Err(RuntimeError::native(format!(
                "{} declared {} result(s) but pushed {}",
                self.name,
                count,
                self.results.len()
            ))
            .into());
        }
        if let Some(stale) = self
            .results
            .iter()
            .find(|v| v.as_ref().is_some_and(|r| !self.heap.is_live(r)))
        {
            return Err(RuntimeError::native(format!(
                "{} returned stale handle {:?}",
                self.name, stale
            ))
            .into());
        }
        let mut results = self.results;
        let extra = results.len() - count;
        results.drain(..extra);
        Ok(results)
    }
}
