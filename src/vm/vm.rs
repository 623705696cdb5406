use std::any::Any;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::time::Instant;

use crate::config::RuntimeConfig;

use super::bytecode;
use super::error::{ErrorKind, Location, RuntimeError, VmError};
use super::heap::{Closure, GcRef, GcStats, Heap, HeapConfig, HeapObject, OBJECT_HEADER, UserData, VALUE_SIZE};
use super::native::{NativeCall, NativeFunction};
use super::ops::{Op, jump_target};
use super::stack::{CallStack, Callee};
use super::value::Value;
use super::verifier::Verifier;
use super::{CodeUnit, Constant, Function};

/// Identifies a unit loaded into one VM instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UnitId(pub u32);

/// Cross-thread request to cancel the running call.
///
/// The dispatch loop polls the flag periodically and raises `Cancelled`
/// once it observes it; observing the flag clears it.
#[derive(Debug, Clone, Default)]
pub struct InterruptHandle(Arc<AtomicBool>);

impl InterruptHandle {
    pub fn interrupt(&self) {
        self.0.store(true, AtomicOrdering::SeqCst);
    }

    fn take(&self) -> bool {
        self.0.swap(false, AtomicOrdering::SeqCst)
    }
}

/// A verified unit together with its materialised constant pool.
pub(crate) struct UnitRecord {
    pub unit: Arc<CodeUnit>,
    /// Strings are interned handles; these are GC roots for as long as
    /// the VM lives.
    pub constants: Vec<Value>,
    pub max_stack: Vec<usize>,
}

/// An installed `try` handler.
#[derive(Debug, Clone, Copy)]
struct Handler {
    frame_depth: usize,
    stack_depth: usize,
    pc: usize,
}

/// Everything besides the heap that the collector treats as roots.
pub(crate) struct Runtime {
    pub stack: CallStack,
    pub globals: HashMap<GcRef, Value>,
    pub units: Vec<UnitRecord>,
    handlers: Vec<Handler>,
}

impl Runtime {
    pub fn roots(&self) -> impl Iterator<Item = Value> + '_ {
        let stack = self.stack.values().iter().copied();
        let frames = self.stack.frames().iter().map(|f| Value::Ref(f.closure));
        let globals = self.globals.iter().flat_map(|(k, v)| [Value::Ref(*k), *v]);
        let constants = self.units.iter().flat_map(|u| u.constants.iter().copied());
        stack.chain(frames).chain(globals).chain(constants)
    }

    fn function(&self, unit: u32, function: u32) -> Result<&Function, VmError> {
        self.units
            .get(unit as usize)
            .and_then(|u| u.unit.functions.get(function as usize))
            .ok_or_else(|| {
                VmError::internal(format!("no function {} in unit {}", function, unit))
            })
    }

    pub fn display(&self, heap: &Heap, value: Value) -> String {
        let mut out = String::new();
        self.write_value(heap, value, 0, &mut out);
        out
    }

    fn write_value(&self, heap: &Heap, value: Value, depth: usize, out: &mut String) {
        let Value::Ref(r) = value else {
            out.push_str(&value.to_string());
            return;
        };
        match heap.get(r) {
            None => out.push_str("<dangling>"),
            Some(HeapObject::String(s)) if depth == 0 => out.push_str(s),
            Some(HeapObject::String(s)) => out.push_str(&format!("{:?}", s)),
            Some(HeapObject::Array(_) | HeapObject::Table(_)) if depth >= 8 => out.push_str("..."),
            Some(HeapObject::Array(items)) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    self.write_value(heap, *item, depth + 1, out);
                }
                out.push(']');
            }
            Some(HeapObject::Table(entries)) => {
                let mut rendered: Vec<String> = entries
                    .iter()
                    .map(|(key, value)| {
                        let mut entry = String::new();
                        self.write_value(heap, key.to_value(), depth + 1, &mut entry);
                        entry.push_str(": ");
                        self.write_value(heap, *value, depth + 1, &mut entry);
                        entry
                    })
                    .collect();
                rendered.sort();
                out.push('{');
                out.push_str(&rendered.join(", "));
                out.push('}');
            }
            Some(HeapObject::Closure(c)) => match self.function(c.unit, c.function) {
                Ok(func) => out.push_str(&format!("<function {}>", func.name)),
                Err(_) => out.push_str("<function>"),
            },
            Some(HeapObject::Native(n)) => out.push_str(&format!("<native {}>", n.name)),
            Some(HeapObject::UserData(u)) => out.push_str(&format!("<userdata {}>", u.tag)),
        }
    }
}

/// Per-call execution budget.
#[derive(Debug, Default)]
struct Budget {
    executed: u64,
    limit: Option<u64>,
    deadline: Option<Instant>,
}

impl Budget {
    const POLL_INTERVAL: u64 = 1024;

    fn start(config: &RuntimeConfig) -> Self {
        Self {
            executed: 0,
            limit: config.max_instructions,
            deadline: config.timeout().map(|t| Instant::now() + t),
        }
    }

    #[inline]
    fn tick(&mut self, interrupt: &InterruptHandle) -> Result<(), RuntimeError> {
        self.executed += 1;
        if let Some(limit) = self.limit {
            if self.executed > limit {
                return Err(RuntimeError::new(
                    ErrorKind::Cancelled,
                    format!("instruction budget of {} exhausted", limit),
                ));
            }
        }
        if self.executed % Self::POLL_INTERVAL == 1 {
            if interrupt.take() {
                return Err(RuntimeError::new(ErrorKind::Cancelled, "interrupted by host"));
            }
            if self.deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(RuntimeError::new(ErrorKind::Cancelled, "timed out"));
            }
        }
        Ok(())
    }
}

/// A virtual machine instance.
///
/// Each instance owns its heap, stack and globals; instances share nothing
/// and may coexist freely on one thread. Dropping the VM releases all of
/// its memory.
pub struct Vm {
    heap: Heap,
    rt: Runtime,
    config: RuntimeConfig,
    verifier: Verifier,
    interrupt: InterruptHandle,
    budget: Budget,
    poisoned: bool,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        if self.config.gc_stats {
            eprintln!("[GC] {}", self.heap.stats());
        }
    }
}

impl Vm {
    pub fn new(config: RuntimeConfig) -> Self {
        let heap = Heap::new(HeapConfig {
            gc_enabled: config.gc_enabled,
            threshold_objects: config.gc_threshold_objects,
            threshold_bytes: config.gc_threshold_bytes,
            heap_limit: config.heap_limit,
            max_objects: config.max_objects,
        });
        Self {
            heap,
            rt: Runtime {
                stack: CallStack::new(config.stack_size, config.max_call_depth),
                globals: HashMap::new(),
                units: Vec::new(),
                handlers: Vec::new(),
            },
            verifier: Verifier::new(config.max_stack_per_function),
            config,
            interrupt: InterruptHandle::default(),
            budget: Budget::default(),
            poisoned: false,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn gc_stats(&self) -> &GcStats {
        self.heap.stats()
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Number of values on the value stack.
    pub fn stack_len(&self) -> usize {
        self.rt.stack.len()
    }

    /// Number of active frames.
    pub fn frame_depth(&self) -> usize {
        self.rt.stack.depth()
    }

    fn check_usable(&self) -> Result<(), VmError> {
        if self.poisoned {
            Err(VmError::Poisoned)
        } else {
            Ok(())
        }
    }

    fn poison_on_internal<T>(&mut self, result: Result<T, VmError>) -> Result<T, VmError> {
        if matches!(result, Err(VmError::Internal(_))) {
            self.poisoned = true;
        }
        result
    }

    // ========================================
    // Loading
    // ========================================

    /// Verify a unit, install it, and bind its exported functions as
    /// globals. Nothing executes.
    pub fn load(&mut self, unit: CodeUnit) -> Result<UnitId, VmError> {
        self.check_usable()?;
        let max_stack = self.verifier.verify_unit(&unit)?;
        let id = u32::try_from(self.rt.units.len())
            .map_err(|_| VmError::internal("too many units loaded"))?;

        // Constants and bindings are unrooted until the record is installed,
        // so collect up front and allocate without collecting afterwards.
        let estimate = unit
            .constants
            .iter()
            .map(|c| match c {
                Constant::Str(s) => OBJECT_HEADER + s.len(),
                _ => 0,
            })
            .sum::<usize>()
            + unit.functions.len() * OBJECT_HEADER * 2;
        self.prepare(estimate, &[])?;

        let mut constants = Vec::with_capacity(unit.constants.len());
        for constant in &unit.constants {
            constants.push(match constant {
                Constant::Int(n) => Value::Int(*n),
                Constant::Float(f) => Value::Float(*f),
                Constant::Str(s) => Value::Ref(self.heap.alloc_string(s)?),
            });
        }

        let unit = Arc::new(unit);
        self.rt.units.push(UnitRecord {
            unit: Arc::clone(&unit),
            constants,
            max_stack,
        });

        for (index, func) in unit.functions.iter().enumerate() {
            if !func.exported {
                continue;
            }
            let name = self.heap.alloc_string(&func.name)?;
            let closure = self.heap.alloc(HeapObject::Closure(Closure {
                unit: id,
                function: index as u32,
                captures: Vec::new(),
            }))?;
            self.rt.globals.insert(name, Value::Ref(closure));
        }

        Ok(UnitId(id))
    }

    /// Decode, verify and install a binary unit.
    pub fn load_bytes(&mut self, bytes: &[u8]) -> Result<UnitId, VmError> {
        self.check_usable()?;
        let unit = bytecode::deserialize(bytes)?;
        self.load(unit)
    }

    pub fn unit(&self, id: UnitId) -> Option<&CodeUnit> {
        self.rt.units.get(id.0 as usize).map(|u| u.unit.as_ref())
    }

    // ========================================
    // Globals and natives
    // ========================================

    /// Register a host function under a global name. `arity: None`
    /// accepts any argument count.
    pub fn register_native<F>(&mut self, name: &str, arity: Option<u8>, func: F) -> Result<(), VmError>
    where
        F: Fn(&mut NativeCall<'_>) -> Result<usize, RuntimeError> + 'static,
    {
        self.check_usable()?;
        let native = HeapObject::Native(NativeFunction {
            name: Rc::from(name),
            arity,
            func: Rc::new(func),
        });
        self.prepare(native.size() + OBJECT_HEADER + name.len(), &[])?;
        let key = self.heap.alloc_string(name)?;
        let r = self.heap.alloc(native)?;
        self.rt.globals.insert(key, Value::Ref(r));
        Ok(())
    }

    pub fn get_global(&self, name: &str) -> Option<Value> {
        let key = self.heap.lookup_string(name)?;
        self.rt.globals.get(&key).copied()
    }

    /// Assigning `nil` removes the binding.
    pub fn set_global(&mut self, name: &str, value: Value) -> Result<(), VmError> {
        self.check_usable()?;
        self.check_live(&[value])?;
        self.prepare(OBJECT_HEADER + name.len(), &[value])?;
        let key = self.heap.alloc_string(name)?;
        if value.is_nil() {
            self.rt.globals.remove(&key);
        } else {
            self.rt.globals.insert(key, value);
        }
        Ok(())
    }

    /// All global bindings, sorted by name.
    pub fn globals(&self) -> Vec<(String, Value)> {
        let mut out: Vec<(String, Value)> = self
            .rt
            .globals
            .iter()
            .map(|(k, v)| (self.heap.string(*k).unwrap_or("?").to_string(), *v))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    // ========================================
    // Host-side object access
    // ========================================

    /// Host-created objects are unrooted until they are passed to a call,
    /// stored in a global or an object, or pinned.
    pub fn new_string(&mut self, s: &str) -> Result<Value, VmError> {
        self.check_usable()?;
        Ok(Value::Ref(self.intern(s)?))
    }

    pub fn new_array(&mut self, items: Vec<Value>) -> Result<Value, VmError> {
        self.check_usable()?;
        self.check_live(&items)?;
        let size = OBJECT_HEADER + items.len() * VALUE_SIZE;
        self.prepare(size, &items)?;
        let object = HeapObject::Array(items);
        Ok(Value::Ref(self.heap.alloc(object)?))
    }

    pub fn new_table(&mut self) -> Result<Value, VmError> {
        self.check_usable()?;
        Ok(Value::Ref(self.allocate(HeapObject::Table(HashMap::new()))?))
    }

    pub fn new_userdata<T: Any>(&mut self, tag: u64, data: T) -> Result<Value, VmError> {
        self.check_usable()?;
        let object = HeapObject::UserData(UserData {
            tag,
            data: Box::new(data),
        });
        Ok(Value::Ref(self.allocate(object)?))
    }

    pub fn table_get(&self, table: Value, key: Value) -> Result<Value, VmError> {
        let r = table
            .as_ref()
            .ok_or_else(|| RuntimeError::type_mismatch("expected a table"))?;
        Ok(self.heap.table_get(r, key)?)
    }

    pub fn table_set(&mut self, table: Value, key: Value, value: Value) -> Result<(), VmError> {
        self.check_usable()?;
        self.check_live(&[key, value])?;
        let r = table
            .as_ref()
            .ok_or_else(|| RuntimeError::type_mismatch("expected a table"))?;
        Ok(self.heap.table_set(r, key, value)?)
    }

    pub fn string(&self, value: Value) -> Option<&str> {
        value.as_ref().and_then(|r| self.heap.string(r))
    }

    pub fn array(&self, value: Value) -> Option<&[Value]> {
        value.as_ref().and_then(|r| self.heap.array(r))
    }

    pub fn userdata<T: Any>(&self, value: Value) -> Option<&T> {
        value
            .as_ref()
            .and_then(|r| self.heap.userdata(r))
            .and_then(|u| u.data.downcast_ref::<T>())
    }

    pub fn type_name(&self, value: Value) -> &'static str {
        self.heap.type_name(value)
    }

    /// Render a value the way `print` shows it.
    pub fn display(&self, value: Value) -> String {
        self.rt.display(&self.heap, value)
    }

    /// Keep a heap value alive across collections until unpinned.
    pub fn pin(&mut self, value: Value) -> bool {
        match value {
            Value::Ref(r) => self.heap.pin(r),
            _ => true,
        }
    }

    pub fn unpin(&mut self, value: Value) -> bool {
        match value {
            Value::Ref(r) => self.heap.unpin(r),
            _ => true,
        }
    }

    /// Run a full collection now.
    pub fn collect_garbage(&mut self) -> Result<(), VmError> {
        self.check_usable()?;
        self.collect_with(&[])
    }

    fn collect_with(&mut self, extra: &[Value]) -> Result<(), VmError> {
        let result = self
            .heap
            .collect(self.rt.roots().chain(extra.iter().copied()));
        self.poison_on_internal(result)
    }

    /// Collect first if allocating `size` bytes crosses a threshold.
    /// `keep` lists values that must survive but are not yet rooted.
    fn prepare(&mut self, size: usize, keep: &[Value]) -> Result<(), VmError> {
        if self.heap.should_collect(size) {
            self.collect_with(keep)?;
        }
        Ok(())
    }

    fn allocate(&mut self, object: HeapObject) -> Result<GcRef, VmError> {
        self.prepare(object.size(), &[])?;
        Ok(self.heap.alloc(object)?)
    }

    fn intern(&mut self, s: &str) -> Result<GcRef, VmError> {
        if let Some(r) = self.heap.lookup_string(s) {
            return Ok(r);
        }
        self.prepare(OBJECT_HEADER + s.len(), &[])?;
        Ok(self.heap.alloc_string(s)?)
    }

    fn check_live(&self, values: &[Value]) -> Result<(), VmError> {
        for value in values {
            if let Value::Ref(r) = value {
                if !self.heap.is_live(*r) {
                    return Err(RuntimeError::type_mismatch(format!(
                        "stale handle {:?}",
                        value
                    ))
                    .into());
                }
            }
        }
        Ok(())
    }

    // ========================================
    // Calls
    // ========================================

    /// Call a global function by name and run it to completion.
    ///
    /// On error the stack and frames are unwound to where they were before
    /// the call, so the VM stays usable (except after internal errors).
    pub fn call(&mut self, name: &str, args: &[Value]) -> Result<Vec<Value>, VmError> {
        self.check_usable()?;
        let callee = self
            .get_global(name)
            .ok_or_else(|| VmError::UndefinedEntry(name.to_string()))?;
        self.call_value(callee, args)
    }

    pub fn call_value(&mut self, callee: Value, args: &[Value]) -> Result<Vec<Value>, VmError> {
        self.check_usable()?;
        self.check_live(&[callee])?;
        self.check_live(args)?;

        let entry_depth = self.rt.stack.len();
        let entry_frames = self.rt.stack.depth();
        let entry_handlers = self.rt.handlers.len();
        self.budget = Budget::start(&self.config);

        let result = self.enter(callee, args, entry_frames, entry_handlers);
        let result = result.map(|()| self.rt.stack.values()[entry_depth..].to_vec());

        self.rt.stack.unwind(entry_depth, entry_frames);
        self.rt.handlers.truncate(entry_handlers);
        self.poison_on_internal(result)
    }

    fn enter(
        &mut self,
        callee: Value,
        args: &[Value],
        entry_frames: usize,
        entry_handlers: usize,
    ) -> Result<(), VmError> {
        self.rt.stack.ensure(args.len() + 1)?;
        self.rt.stack.push(callee);
        for arg in args {
            self.rt.stack.push(*arg);
        }
        self.invoke(args.len(), None)?;
        self.run(entry_frames, entry_handlers)
    }

    /// Call the value sitting below the top `argc` stack slots. `want` is
    /// the number of results the caller expects; `None` keeps whatever the
    /// callee produces.
    fn invoke(&mut self, argc: usize, want: Option<usize>) -> Result<(), VmError> {
        let callee_slot = self
            .rt
            .stack
            .len()
            .checked_sub(argc + 1)
            .ok_or_else(|| VmError::internal("call without a callee"))?;
        let callee = self.rt.stack.values()[callee_slot];

        let target = match callee {
            Value::Ref(r) => self.heap.get(r).map(|object| (r, object)),
            _ => None,
        };
        match target {
            Some((r, HeapObject::Closure(c))) => {
                let (unit, function) = (c.unit, c.function);
                let record = self
                    .rt
                    .units
                    .get(unit as usize)
                    .ok_or_else(|| VmError::internal(format!("closure names unit {}", unit)))?;
                let max_stack = record.max_stack.get(function as usize).copied().unwrap_or(0);
                let func = self.rt.function(unit, function)?;
                let (arity, locals, returns) =
                    (func.arity as usize, func.locals as usize, func.returns as usize);
                let name = func.name.clone();
                let callee = Callee {
                    closure: r,
                    unit,
                    function,
                    arity,
                    locals,
                    max_stack,
                };
                let results = want.unwrap_or(returns);
                self.rt
                    .stack
                    .push_frame(callee, argc, results)
                    .map_err(|e| {
                        if e.kind == ErrorKind::ArityMismatch {
                            RuntimeError::arity(&name, arity, argc)
                        } else {
                            e
                        }
                    })?;
                Ok(())
            }
            Some((_, HeapObject::Native(native))) => {
                let name = Rc::clone(&native.name);
                let func = Rc::clone(&native.func);
                if let Some(arity) = native.arity {
                    if arity as usize != argc {
                        return Err(RuntimeError::arity(&name, arity as usize, argc).into());
                    }
                }

                let args = callee_slot + 1..self.rt.stack.len();
                let mut call = NativeCall::new(&mut self.heap, &self.rt, args, name);
                let outcome = func(&mut call);
                let results = call.finish(outcome)?;

                let want = want.unwrap_or(results.len());
                self.rt.stack.discard(argc + 1)?;
                self.rt.stack.ensure(want)?;
                for i in 0..want {
                    self.rt.stack.push(results.get(i).copied().unwrap_or(Value::Nil));
                }
                Ok(())
            }
            _ => Err(RuntimeError::type_mismatch(format!(
                "attempt to call a {} value",
                self.heap.type_name(callee)
            ))
            .into()),
        }
    }

    // ========================================
    // Dispatch loop
    // ========================================

    fn run(&mut self, entry_frames: usize, entry_handlers: usize) -> Result<(), VmError> {
        while self.rt.stack.depth() > entry_frames {
            if self.heap.should_collect(0) {
                self.collect_with(&[])?;
            }

            let frame = self.rt.stack.frame_mut()?;
            let (unit, function, pc) = (frame.unit, frame.function, frame.pc);
            frame.pc += 1;
            let op = *self
                .rt
                .function(unit, function)?
                .code
                .get(pc)
                .ok_or_else(|| VmError::internal(format!("pc {} past end of code", pc)))?;

            if self.config.trace_execution {
                self.trace(unit, function, pc, &op);
            }

            let outcome = match self.budget.tick(&self.interrupt) {
                Ok(()) => self.execute(op),
                Err(e) => Err(e.into()),
            };
            match outcome {
                Ok(()) => {}
                Err(VmError::Runtime(e)) => {
                    let e = e.at(self.location(unit, function, pc));
                    self.handle_error(e, entry_handlers)?;
                }
                Err(other) => return Err(other),
            }
        }
        Ok(())
    }

    fn location(&self, unit: u32, function: u32, pc: usize) -> Location {
        match self.rt.function(unit, function) {
            Ok(func) => Location {
                function: func.name.clone(),
                offset: pc,
                line: func.line_at(pc),
            },
            Err(_) => Location {
                function: "?".to_string(),
                offset: pc,
                line: None,
            },
        }
    }

    fn trace(&self, unit: u32, function: u32, pc: usize, op: &Op) {
        let name = self
            .rt
            .function(unit, function)
            .map(|f| f.name.as_str())
            .unwrap_or("?");
        eprintln!(
            "[TRACE] {}:{:04} {:?} (stack={}, frames={})",
            name,
            pc,
            op,
            self.rt.stack.len(),
            self.rt.stack.depth()
        );
    }

    /// Transfer control to the innermost handler installed during this
    /// call, or give the error back when there is none.
    fn handle_error(&mut self, err: RuntimeError, entry_handlers: usize) -> Result<(), VmError> {
        if !err.kind.is_catchable() || self.rt.handlers.len() <= entry_handlers {
            return Err(err.into());
        }
        let Some(handler) = self.rt.handlers.pop() else {
            return Err(err.into());
        };

        self.rt.stack.unwind(handler.stack_depth, handler.frame_depth);
        let value = match err.value {
            Some(value) => value,
            None => match self.intern(&format!("{}: {}", err.kind, err.message)) {
                Ok(r) => Value::Ref(r),
                Err(VmError::Runtime(_)) => Value::Nil,
                Err(fatal) => return Err(fatal),
            },
        };
        self.rt.stack.push(value);
        self.rt.stack.frame_mut()?.pc = handler.pc;
        Ok(())
    }

    fn execute(&mut self, op: Op) -> Result<(), VmError> {
        match op {
            Op::Nil => self.rt.stack.push(Value::Nil),
            Op::True => self.rt.stack.push(Value::Bool(true)),
            Op::False => self.rt.stack.push(Value::Bool(false)),
            Op::Int(n) => self.rt.stack.push(Value::Int(n)),
            Op::Const(k) => {
                let value = self.constant(k)?;
                self.rt.stack.push(value);
            }

            Op::Pop => {
                self.rt.stack.pop()?;
            }
            Op::Dup => {
                let value = self.rt.stack.peek(0)?;
                self.rt.stack.push(value);
            }
            Op::Swap => self.rt.stack.swap()?,

            Op::GetLocal(n) => {
                let value = self.rt.stack.local(n)?;
                self.rt.stack.push(value);
            }
            Op::SetLocal(n) => {
                let value = self.rt.stack.pop()?;
                self.rt.stack.set_local(n, value)?;
            }
            Op::GetGlobal(k) => {
                let key = self.global_key(k)?;
                let value = self.rt.globals.get(&key).copied().unwrap_or(Value::Nil);
                self.rt.stack.push(value);
            }
            Op::SetGlobal(k) => {
                let key = self.global_key(k)?;
                let value = self.rt.stack.pop()?;
                if value.is_nil() {
                    self.rt.globals.remove(&key);
                } else {
                    self.rt.globals.insert(key, value);
                }
            }
            Op::GetUpvalue(n) => {
                let value = *self.captures_mut()?.get_mut(n as usize).ok_or_else(|| {
                    VmError::internal(format!("upvalue {} missing from closure", n))
                })?;
                self.rt.stack.push(value);
            }
            Op::SetUpvalue(n) => {
                let value = self.rt.stack.pop()?;
                let slot = self.captures_mut()?.get_mut(n as usize).ok_or_else(|| {
                    VmError::internal(format!("upvalue {} missing from closure", n))
                })?;
                *slot = value;
            }

            Op::Add => self.add()?,
            Op::Sub | Op::Mul | Op::Div | Op::Mod => self.arith(op)?,
            Op::Neg => {
                let value = self.rt.stack.pop()?;
                let result = match value {
                    Value::Int(n) => Value::Int(n.wrapping_neg()),
                    Value::Float(f) => Value::Float(-f),
                    other => {
                        return Err(RuntimeError::type_mismatch(format!(
                            "cannot negate a {} value",
                            self.heap.type_name(other)
                        ))
                        .into());
                    }
                };
                self.rt.stack.push(result);
            }

            Op::Eq | Op::Ne => {
                let b = self.rt.stack.pop()?;
                let a = self.rt.stack.pop()?;
                let equal = a.eq(&b);
                self.rt.stack.push(Value::Bool(if op == Op::Eq { equal } else { !equal }));
            }
            Op::Lt | Op::Le | Op::Gt | Op::Ge => self.compare(op)?,
            Op::Not => {
                let value = self.rt.stack.pop()?;
                self.rt.stack.push(Value::Bool(!value.is_truthy()));
            }

            Op::Jump(off) => self.jump(off)?,
            Op::JumpIfFalse(off) => {
                if !self.rt.stack.pop()?.is_truthy() {
                    self.jump(off)?;
                }
            }
            Op::JumpIfTrue(off) => {
                if self.rt.stack.pop()?.is_truthy() {
                    self.jump(off)?;
                }
            }

            Op::Call { argc, results } => self.invoke(argc as usize, Some(results as usize))?,
            Op::Return => {
                let frame = *self.rt.stack.frame()?;
                let returns = self.rt.function(frame.unit, frame.function)?.returns as usize;
                self.rt.stack.pop_frame(returns)?;
                let depth = self.rt.stack.depth();
                while self.rt.handlers.last().is_some_and(|h| h.frame_depth > depth) {
                    self.rt.handlers.pop();
                }
            }

            Op::Closure(f) => {
                let unit = self.rt.stack.frame()?.unit;
                let upvalues = self.rt.function(unit, f)?.upvalues as usize;
                let captures = self.rt.stack.top(upvalues)?.to_vec();
                let r = self.allocate(HeapObject::Closure(Closure {
                    unit,
                    function: f,
                    captures,
                }))?;
                self.rt.stack.discard(upvalues)?;
                self.rt.stack.push(Value::Ref(r));
            }
            Op::NewArray(n) => {
                let items = self.rt.stack.top(n as usize)?.to_vec();
                let r = self.allocate(HeapObject::Array(items))?;
                self.rt.stack.discard(n as usize)?;
                self.rt.stack.push(Value::Ref(r));
            }
            Op::NewTable => {
                let r = self.allocate(HeapObject::Table(HashMap::new()))?;
                self.rt.stack.push(Value::Ref(r));
            }
            Op::GetIndex => {
                let key = self.rt.stack.pop()?;
                let container = self.rt.stack.pop()?;
                let value = self.get_index(container, key)?;
                self.rt.stack.push(value);
            }
            Op::SetIndex => {
                let value = self.rt.stack.pop()?;
                let key = self.rt.stack.pop()?;
                let container = self.rt.stack.pop()?;
                self.set_index(container, key, value)?;
            }
            Op::Len => {
                let value = self.rt.stack.pop()?;
                let len = match value.as_ref().and_then(|r| self.heap.get(r)) {
                    Some(HeapObject::String(s)) => s.len(),
                    Some(HeapObject::Array(items)) => items.len(),
                    Some(HeapObject::Table(entries)) => entries.len(),
                    _ => {
                        return Err(RuntimeError::type_mismatch(format!(
                            "a {} value has no length",
                            self.heap.type_name(value)
                        ))
                        .into());
                    }
                };
                self.rt.stack.push(Value::Int(len as i64));
            }

            Op::Try(off) => {
                let frame = self.rt.stack.frame()?;
                let pc = jump_target(frame.pc - 1, off)
                    .ok_or_else(|| VmError::internal("handler target out of range"))?;
                self.rt.handlers.push(Handler {
                    frame_depth: self.rt.stack.depth(),
                    stack_depth: self.rt.stack.len(),
                    pc,
                });
            }
            Op::EndTry => {
                let depth = self.rt.stack.depth();
                if self.rt.handlers.last().is_some_and(|h| h.frame_depth == depth) {
                    self.rt.handlers.pop();
                }
            }
            Op::Throw => {
                let value = self.rt.stack.pop()?;
                let message = self.display(value);
                return Err(RuntimeError::thrown(value, message).into());
            }
        }
        Ok(())
    }

    fn constant(&self, k: u32) -> Result<Value, VmError> {
        let unit = self.rt.stack.frame()?.unit;
        self.rt
            .units
            .get(unit as usize)
            .and_then(|u| u.constants.get(k as usize))
            .copied()
            .ok_or_else(|| VmError::internal(format!("constant {} out of range", k)))
    }

    fn global_key(&self, k: u32) -> Result<GcRef, VmError> {
        self.constant(k)?
            .as_ref()
            .ok_or_else(|| VmError::internal(format!("constant {} is not a global name", k)))
    }

    fn captures_mut(&mut self) -> Result<&mut Vec<Value>, VmError> {
        let closure = self.rt.stack.frame()?.closure;
        match self.heap.get_mut(closure) {
            Some(HeapObject::Closure(c)) => Ok(&mut c.captures),
            _ => Err(VmError::internal("frame is not running a closure")),
        }
    }

    fn jump(&mut self, off: i32) -> Result<(), VmError> {
        let frame = self.rt.stack.frame_mut()?;
        frame.pc = jump_target(frame.pc - 1, off)
            .ok_or_else(|| VmError::internal("jump target out of range"))?;
        Ok(())
    }

    fn operand_error(&self, op: Op, a: Value, b: Value) -> VmError {
        RuntimeError::type_mismatch(format!(
            "cannot apply {} to {} and {}",
            op.name(),
            self.heap.type_name(a),
            self.heap.type_name(b)
        ))
        .into()
    }

    fn add(&mut self) -> Result<(), VmError> {
        // Operands stay on the stack (rooted) while a concatenation allocates.
        let b = self.rt.stack.peek(0)?;
        let a = self.rt.stack.peek(1)?;
        let result = match (a, b) {
            (Value::Int(x), Value::Int(y)) => Value::Int(x.wrapping_add(y)),
            (Value::Ref(x), Value::Ref(y)) => {
                let joined = match (self.heap.string(x), self.heap.string(y)) {
                    (Some(l), Some(r)) => format!("{}{}", l, r),
                    _ => return Err(self.operand_error(Op::Add, a, b)),
                };
                Value::Ref(self.intern(&joined)?)
            }
            _ => match (a.as_float(), b.as_float()) {
                (Some(x), Some(y)) => Value::Float(x + y),
                _ => return Err(self.operand_error(Op::Add, a, b)),
            },
        };
        self.rt.stack.discard(2)?;
        self.rt.stack.push(result);
        Ok(())
    }

    fn arith(&mut self, op: Op) -> Result<(), VmError> {
        let b = self.rt.stack.pop()?;
        let a = self.rt.stack.pop()?;
        let result = match (a, b) {
            (Value::Int(x), Value::Int(y)) => match op {
                Op::Sub => Value::Int(x.wrapping_sub(y)),
                Op::Mul => Value::Int(x.wrapping_mul(y)),
                Op::Div | Op::Mod if y == 0 => {
                    let what = if op == Op::Div { "division" } else { "modulo" };
                    return Err(RuntimeError::new(
                        ErrorKind::DivideByZero,
                        format!("integer {} by zero", what),
                    )
                    .into());
                }
                Op::Div => Value::Int(x.wrapping_div(y)),
                Op::Mod => Value::Int(x.wrapping_rem(y)),
                _ => return Err(VmError::internal(format!("{} is not arithmetic", op.name()))),
            },
            _ => match (a.as_float(), b.as_float()) {
                (Some(x), Some(y)) => Value::Float(match op {
                    Op::Sub => x - y,
                    Op::Mul => x * y,
                    Op::Div => x / y,
                    Op::Mod => x % y,
                    _ => return Err(VmError::internal(format!("{} is not arithmetic", op.name()))),
                }),
                _ => return Err(self.operand_error(op, a, b)),
            },
        };
        self.rt.stack.push(result);
        Ok(())
    }

    fn compare(&mut self, op: Op) -> Result<(), VmError> {
        let b = self.rt.stack.pop()?;
        let a = self.rt.stack.pop()?;
        let ordering = match (a, b) {
            (Value::Int(x), Value::Int(y)) => Some(x.cmp(&y)),
            (Value::Ref(x), Value::Ref(y)) => match (self.heap.string(x), self.heap.string(y)) {
                (Some(l), Some(r)) => Some(l.cmp(r)),
                _ => return Err(self.operand_error(op, a, b)),
            },
            _ => match (a.as_float(), b.as_float()) {
                // NaN is unordered: every comparison is false.
                (Some(x), Some(y)) => x.partial_cmp(&y),
                _ => return Err(self.operand_error(op, a, b)),
            },
        };
        let result = ordering.is_some_and(|o| match op {
            Op::Lt => o == Ordering::Less,
            Op::Le => o != Ordering::Greater,
            Op::Gt => o == Ordering::Greater,
            _ => o != Ordering::Less,
        });
        self.rt.stack.push(Value::Bool(result));
        Ok(())
    }

    fn array_index(len: usize, key: Value) -> Result<usize, RuntimeError> {
        let index = key
            .as_int()
            .ok_or_else(|| RuntimeError::type_mismatch("array index must be an int"))?;
        if index < 0 || index as usize >= len {
            return Err(RuntimeError::new(
                ErrorKind::IndexOutOfRange,
                format!("index {} out of range for array of length {}", index, len),
            ));
        }
        Ok(index as usize)
    }

    fn get_index(&self, container: Value, key: Value) -> Result<Value, VmError> {
        let r = match container {
            Value::Ref(r) => r,
            other => {
                return Err(RuntimeError::type_mismatch(format!(
                    "cannot index a {} value",
                    other.type_name()
                ))
                .into());
            }
        };
        match self.heap.get(r) {
            Some(HeapObject::Array(items)) => Ok(items[Self::array_index(items.len(), key)?]),
            Some(HeapObject::Table(_)) => Ok(self.heap.table_get(r, key)?),
            _ => Err(RuntimeError::type_mismatch(format!(
                "cannot index a {} value",
                self.heap.type_name(container)
            ))
            .into()),
        }
    }

    fn set_index(&mut self, container: Value, key: Value, value: Value) -> Result<(), VmError> {
        let kind = container.as_ref().and_then(|r| self.heap.get(r)).map(HeapObject::kind);
        match (container, kind) {
            (Value::Ref(r), Some("array")) => {
                let items = self
                    .heap
                    .array_mut(r)
                    .ok_or_else(|| VmError::internal("array vanished during store"))?;
                let index = Self::array_index(items.len(), key)?;
                items[index] = value;
                Ok(())
            }
            (Value::Ref(r), Some("table")) => Ok(self.heap.table_set(r, key, value)?),
            _ => Err(RuntimeError::type_mismatch(format!(
                "cannot index-assign a {} value",
                self.heap.type_name(container)
            ))
            .into()),
        }
    }
}
