use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use super::error::{ErrorKind, RuntimeError, VmError};
use super::native::NativeFunction;
use super::value::Value;

/// Generation-checked handle to a heap object.
///
/// `index` names a slot; `generation` must match the slot's current
/// generation, so a handle to a reclaimed object is detected instead of
/// silently aliasing whatever was allocated into the slot afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GcRef {
    pub index: u32,
    pub generation: u32,
}

/// Key of a table entry.
///
/// Integral floats are normalised to `Int` so that `t[1]` and `t[1.0]`
/// address the same entry. Strings are keyed by their interned handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableKey {
    Bool(bool),
    Int(i64),
    Float(u64),
    Ref(GcRef),
}

impl TableKey {
    pub fn from_value(value: Value) -> Result<Self, RuntimeError> {
        match value {
            Value::Bool(b) => Ok(TableKey::Bool(b)),
            Value::Int(n) => Ok(TableKey::Int(n)),
            Value::Float(f) if f.is_nan() => Err(RuntimeError::type_mismatch(
                "table key cannot be NaN",
            )),
            Value::Float(f) => {
                if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 {
                    Ok(TableKey::Int(f as i64))
                } else {
                    Ok(TableKey::Float(f.to_bits()))
                }
            }
            Value::Ref(r) => Ok(TableKey::Ref(r)),
            Value::Nil => Err(RuntimeError::type_mismatch("table key cannot be nil")),
        }
    }

    pub fn to_value(self) -> Value {
        match self {
            TableKey::Bool(b) => Value::Bool(b),
            TableKey::Int(n) => Value::Int(n),
            TableKey::Float(bits) => Value::Float(f64::from_bits(bits)),
            TableKey::Ref(r) => Value::Ref(r),
        }
    }
}

/// A script function instance: code location plus captured values.
#[derive(Debug, Clone)]
pub struct Closure {
    /// Index of the loaded unit within the owning VM.
    pub unit: u32,
    /// Function index within that unit.
    pub function: u32,
    pub captures: Vec<Value>,
}

/// Opaque host data.
pub struct UserData {
    pub tag: u64,
    pub data: Box<dyn Any>,
}

pub enum HeapObject {
    String(Box<str>),
    /// Fixed-length array; the length is decided at creation.
    Array(Vec<Value>),
    Table(HashMap<TableKey, Value>),
    Closure(Closure),
    Native(NativeFunction),
    UserData(UserData),
}

pub(crate) const OBJECT_HEADER: usize = 24;
pub(crate) const VALUE_SIZE: usize = 16;
const TABLE_ENTRY: usize = 32;

impl HeapObject {
    pub fn kind(&self) -> &'static str {
        match self {
            HeapObject::String(_) => "string",
            HeapObject::Array(_) => "array",
            HeapObject::Table(_) => "table",
            HeapObject::Closure(_) => "function",
            HeapObject::Native(_) => "native",
            HeapObject::UserData(_) => "userdata",
        }
    }

    /// Approximate footprint used for GC triggering and heap limits.
    pub fn size(&self) -> usize {
        OBJECT_HEADER
            + match self {
                HeapObject::String(s) => s.len(),
                HeapObject::Array(items) => items.len() * VALUE_SIZE,
                HeapObject::Table(entries) => entries.len() * TABLE_ENTRY,
                HeapObject::Closure(c) => 8 + c.captures.len() * VALUE_SIZE,
                HeapObject::Native(n) => n.name.len() + 16,
                HeapObject::UserData(u) => 8 + std::mem::size_of_val(&*u.data),
            }
    }

    fn trace(&self, out: &mut Vec<GcRef>) {
        fn refs(values: &[Value], out: &mut Vec<GcRef>) {
            out.extend(values.iter().filter_map(Value::as_ref));
        }
        match self {
            HeapObject::Array(items) => refs(items, out),
            HeapObject::Closure(c) => refs(&c.captures, out),
            HeapObject::Table(entries) => {
                for (key, value) in entries {
                    if let TableKey::Ref(r) = key {
                        out.push(*r);
                    }
                    if let Value::Ref(r) = value {
                        out.push(*r);
                    }
                }
            }
            HeapObject::String(_) | HeapObject::Native(_) | HeapObject::UserData(_) => {}
        }
    }
}

struct Slot {
    generation: u32,
    marked: bool,
    size: usize,
    object: Option<HeapObject>,
}

/// Collector statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcStats {
    pub cycles: u64,
    pub objects_allocated: u64,
    pub objects_freed: u64,
    pub bytes_freed: u64,
    pub total_pause: Duration,
    pub max_pause: Duration,
    pub peak_objects: usize,
}

impl fmt::Display for GcStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Collections: {}, Allocated: {}, Freed: {} objects ({} bytes), Pause: total {:?}, max {:?}, Peak: {} objects",
            self.cycles,
            self.objects_allocated,
            self.objects_freed,
            self.bytes_freed,
            self.total_pause,
            self.max_pause,
            self.peak_objects
        )
    }
}

/// Heap limits and collection thresholds.
#[derive(Debug, Clone)]
pub struct HeapConfig {
    pub gc_enabled: bool,
    pub threshold_objects: usize,
    pub threshold_bytes: usize,
    pub heap_limit: Option<usize>,
    pub max_objects: Option<usize>,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            gc_enabled: true,
            threshold_objects: 1024,
            threshold_bytes: 1024 * 1024,
            heap_limit: None,
            max_objects: None,
        }
    }
}

/// Arena of GC-managed objects with a mark-and-sweep collector.
///
/// The heap does not know its roots; the owning VM passes them to
/// [`Heap::collect`].
pub struct Heap {
    slots: Vec<Slot>,
    free: Vec<u32>,
    interned: HashMap<Box<str>, GcRef>,
    pinned: HashMap<GcRef, u32>,
    live_objects: usize,
    live_bytes: usize,
    next_gc_objects: usize,
    next_gc_bytes: usize,
    config: HeapConfig,
    stats: GcStats,
}

impl Heap {
    pub fn new(config: HeapConfig) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            interned: HashMap::new(),
            pinned: HashMap::new(),
            live_objects: 0,
            live_bytes: 0,
            next_gc_objects: config.threshold_objects.max(1),
            next_gc_bytes: config.threshold_bytes.max(1),
            config,
            stats: GcStats::default(),
        }
    }

    pub fn live_objects(&self) -> usize {
        self.live_objects
    }

    pub fn live_bytes(&self) -> usize {
        self.live_bytes
    }

    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    pub fn gc_enabled(&self) -> bool {
        self.config.gc_enabled
    }

    fn over_limit(&self, size: usize) -> bool {
        self.config
            .max_objects
            .is_some_and(|max| self.live_objects + 1 > max)
            || self
                .config
                .heap_limit
                .is_some_and(|limit| self.live_bytes + size > limit)
    }

    /// Whether allocating `size` more bytes should be preceded by a
    /// collection.
    pub fn should_collect(&self, size: usize) -> bool {
        self.config.gc_enabled
            && (self.live_objects >= self.next_gc_objects
                || self.live_bytes + size >= self.next_gc_bytes
                || self.over_limit(size))
    }

    /// Store a new object. Never collects; fails with `OutOfMemory` when a
    /// configured limit would be exceeded.
    pub fn alloc(&mut self, object: HeapObject) -> Result<GcRef, RuntimeError> {
        let size = object.size();
        if self.over_limit(size) {
            return Err(RuntimeError::new(
                ErrorKind::OutOfMemory,
                format!(
                    "cannot allocate {} ({} bytes): {} objects, {} bytes live",
                    object.kind(),
                    size,
                    self.live_objects,
                    self.live_bytes
                ),
            ));
        }

        let r = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.object = Some(object);
                slot.marked = false;
                slot.size = size;
                GcRef {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = u32::try_from(self.slots.len()).map_err(|_| {
                    RuntimeError::new(ErrorKind::OutOfMemory, "heap slot space exhausted")
                })?;
                self.slots.push(Slot {
                    generation: 0,
                    marked: false,
                    size,
                    object: Some(object),
                });
                GcRef {
                    index,
                    generation: 0,
                }
            }
        };

        self.live_objects += 1;
        self.live_bytes += size;
        self.stats.objects_allocated += 1;
        self.stats.peak_objects = self.stats.peak_objects.max(self.live_objects);
        Ok(r)
    }

    /// Handle of an already-interned string.
    pub fn lookup_string(&self, s: &str) -> Option<GcRef> {
        self.interned.get(s).copied()
    }

    /// Intern a string, allocating only when the content is new.
    pub fn alloc_string(&mut self, s: &str) -> Result<GcRef, RuntimeError> {
        if let Some(r) = self.lookup_string(s) {
            return Ok(r);
        }
        let r = self.alloc(HeapObject::String(s.into()))?;
        self.interned.insert(s.into(), r);
        Ok(r)
    }

    pub fn get(&self, r: GcRef) -> Option<&HeapObject> {
        self.slots
            .get(r.index as usize)
            .filter(|slot| slot.generation == r.generation)
            .and_then(|slot| slot.object.as_ref())
    }

    pub fn get_mut(&mut self, r: GcRef) -> Option<&mut HeapObject> {
        self.slots
            .get_mut(r.index as usize)
            .filter(|slot| slot.generation == r.generation)
            .and_then(|slot| slot.object.as_mut())
    }

    pub fn is_live(&self, r: GcRef) -> bool {
        self.get(r).is_some()
    }

    pub fn string(&self, r: GcRef) -> Option<&str> {
        match self.get(r) {
            Some(HeapObject::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn array(&self, r: GcRef) -> Option<&[Value]> {
        match self.get(r) {
            Some(HeapObject::Array(items)) => Some(items),
            _ => None,
        }
    }

    pub fn array_mut(&mut self, r: GcRef) -> Option<&mut [Value]> {
        match self.get_mut(r) {
            Some(HeapObject::Array(items)) => Some(items),
            _ => None,
        }
    }

    pub fn closure(&self, r: GcRef) -> Option<&Closure> {
        match self.get(r) {
            Some(HeapObject::Closure(c)) => Some(c),
            _ => None,
        }
    }

    pub fn native(&self, r: GcRef) -> Option<&NativeFunction> {
        match self.get(r) {
            Some(HeapObject::Native(n)) => Some(n),
            _ => None,
        }
    }

    pub fn userdata(&self, r: GcRef) -> Option<&UserData> {
        match self.get(r) {
            Some(HeapObject::UserData(u)) => Some(u),
            _ => None,
        }
    }

    pub fn table_get(&self, r: GcRef, key: Value) -> Result<Value, RuntimeError> {
        match self.get(r) {
            Some(HeapObject::Table(entries)) => {
                // Keys that can never be stored are simply absent.
                let Ok(key) = TableKey::from_value(key) else {
                    return Ok(Value::Nil);
                };
                Ok(entries.get(&key).copied().unwrap_or(Value::Nil))
            }
            _ => Err(RuntimeError::type_mismatch("expected a table")),
        }
    }

    /// Insert or overwrite an entry. Assigning `nil` removes the key.
    pub fn table_set(&mut self, r: GcRef, key: Value, value: Value) -> Result<(), RuntimeError> {
        let key = TableKey::from_value(key)?;
        let slot = self
            .slots
            .get_mut(r.index as usize)
            .filter(|slot| slot.generation == r.generation)
            .ok_or_else(|| RuntimeError::type_mismatch("expected a table"))?;
        let Some(HeapObject::Table(entries)) = slot.object.as_mut() else {
            return Err(RuntimeError::type_mismatch("expected a table"));
        };

        let before = entries.len();
        if value.is_nil() {
            entries.remove(&key);
        } else {
            entries.insert(key, value);
        }
        let after = entries.len();
        if after > before {
            slot.size += TABLE_ENTRY;
            self.live_bytes += TABLE_ENTRY;
        } else if after < before {
            slot.size -= TABLE_ENTRY;
            self.live_bytes -= TABLE_ENTRY;
        }
        Ok(())
    }

    /// Type name of a value, resolving heap objects to their kind.
    pub fn type_name(&self, value: Value) -> &'static str {
        match value {
            Value::Ref(r) => self.get(r).map(HeapObject::kind).unwrap_or("dangling"),
            other => other.type_name(),
        }
    }

    /// Keep `r` alive across collections until a matching `unpin`.
    pub fn pin(&mut self, r: GcRef) -> bool {
        if !self.is_live(r) {
            return false;
        }
        *self.pinned.entry(r).or_insert(0) += 1;
        true
    }

    pub fn unpin(&mut self, r: GcRef) -> bool {
        match self.pinned.get_mut(&r) {
            Some(count) if *count > 1 => {
                *count -= 1;
                true
            }
            Some(_) => {
                self.pinned.remove(&r);
                true
            }
            None => false,
        }
    }

    pub fn pinned_count(&self) -> usize {
        self.pinned.len()
    }

    /// Run a full mark-and-sweep cycle.
    ///
    /// A root or field that names a reclaimed slot means the heap is
    /// corrupt; that is reported as an internal error and nothing is swept.
    pub fn collect(&mut self, roots: impl IntoIterator<Item = Value>) -> Result<(), VmError> {
        let start = Instant::now();

        let mut worklist = Vec::new();
        let pinned: Vec<GcRef> = self.pinned.keys().copied().collect();
        for r in pinned {
            self.mark_ref(r, &mut worklist)?;
        }
        for value in roots {
            if let Value::Ref(r) = value {
                self.mark_ref(r, &mut worklist)?;
            }
        }

        let mut children = Vec::new();
        while let Some(r) = worklist.pop() {
            children.clear();
            if let Some(object) = &self.slots[r.index as usize].object {
                object.trace(&mut children);
            }
            for child in children.drain(..) {
                self.mark_ref(child, &mut worklist)?;
            }
        }

        self.sweep();

        self.next_gc_objects = self.config.threshold_objects.max(self.live_objects * 2).max(1);
        self.next_gc_bytes = self.config.threshold_bytes.max(self.live_bytes * 2).max(1);

        let pause = start.elapsed();
        self.stats.cycles += 1;
        self.stats.total_pause += pause;
        self.stats.max_pause = self.stats.max_pause.max(pause);
        Ok(())
    }

    fn mark_ref(&mut self, r: GcRef, worklist: &mut Vec<GcRef>) -> Result<(), VmError> {
        let slot = self
            .slots
            .get_mut(r.index as usize)
            .filter(|slot| slot.generation == r.generation && slot.object.is_some())
            .ok_or_else(|| {
                VmError::internal(format!(
                    "dangling handle {}:{} reached during mark",
                    r.index, r.generation
                ))
            })?;
        if !slot.marked {
            slot.marked = true;
            worklist.push(r);
        }
        Ok(())
    }

    fn sweep(&mut self) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.object.is_none() {
                continue;
            }
            if slot.marked {
                slot.marked = false;
                continue;
            }

            if let Some(HeapObject::String(s)) = slot.object.take() {
                self.interned.remove(&s);
            }
            self.live_objects -= 1;
            self.live_bytes -= slot.size;
            self.stats.objects_freed += 1;
            self.stats.bytes_freed += slot.size as u64;
            slot.size = 0;

            // A slot whose generation would wrap is retired for good.
            if let Some(next) = slot.generation.checked_add(1) {
                slot.generation = next;
                self.free.push(index as u32);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap() -> Heap {
        Heap::new(HeapConfig::default())
    }

    #[test]
    fn test_strings_are_interned() {
        let mut heap = heap();
        let a = heap.alloc_string("hello").unwrap();
        let b = heap.alloc_string("hello").unwrap();
        let c = heap.alloc_string("world").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(heap.live_objects(), 2);
        assert_eq!(heap.string(a), Some("hello"));
    }

    #[test]
    fn test_collect_frees_unreachable() {
        let mut heap = heap();
        let keep = heap.alloc_string("keep").unwrap();
        let drop = heap.alloc_string("drop").unwrap();

        heap.collect([Value::Ref(keep)]).unwrap();

        assert!(heap.is_live(keep));
        assert!(!heap.is_live(drop));
        assert_eq!(heap.live_objects(), 1);
        assert_eq!(heap.stats().cycles, 1);
        assert_eq!(heap.stats().objects_freed, 1);
        // The intern entry went with the object.
        assert_eq!(heap.lookup_string("drop"), None);
    }

    #[test]
    fn test_collect_traces_nested_objects() {
        let mut heap = heap();
        let s = heap.alloc_string("inner").unwrap();
        let inner = heap.alloc(HeapObject::Array(vec![Value::Ref(s)])).unwrap();
        let table = heap.alloc(HeapObject::Table(HashMap::new())).unwrap();
        let key = heap.alloc_string("k").unwrap();
        heap.table_set(table, Value::Ref(key), Value::Ref(inner)).unwrap();
        let closure = heap
            .alloc(HeapObject::Closure(Closure {
                unit: 0,
                function: 0,
                captures: vec![Value::Ref(table)],
            }))
            .unwrap();

        heap.collect([Value::Int(1), Value::Ref(closure)]).unwrap();

        for r in [s, inner, table, key, closure] {
            assert!(heap.is_live(r));
        }
    }

    #[test]
    fn test_cycles_are_collected() {
        let mut heap = heap();
        let a = heap.alloc(HeapObject::Table(HashMap::new())).unwrap();
        let b = heap.alloc(HeapObject::Table(HashMap::new())).unwrap();
        heap.table_set(a, Value::Int(0), Value::Ref(b)).unwrap();
        heap.table_set(b, Value::Int(0), Value::Ref(a)).unwrap();

        heap.collect([]).unwrap();
        assert_eq!(heap.live_objects(), 0);
        assert_eq!(heap.live_bytes(), 0);
    }

    #[test]
    fn test_stale_handle_is_detected() {
        let mut heap = heap();
        let old = heap.alloc_string("old").unwrap();
        heap.collect([]).unwrap();
        let new = heap.alloc_string("new").unwrap();

        assert_eq!(old.index, new.index);
        assert_ne!(old.generation, new.generation);
        assert_eq!(heap.string(old), None);
        assert_eq!(heap.string(new), Some("new"));
    }

    #[test]
    fn test_dangling_root_is_internal_error() {
        let mut heap = heap();
        let old = heap.alloc_string("old").unwrap();
        heap.collect([]).unwrap();
        let err = heap.collect([Value::Ref(old)]).unwrap_err();
        assert!(matches!(err, VmError::Internal(_)));
    }

    #[test]
    fn test_pinned_objects_survive() {
        let mut heap = heap();
        let r = heap.alloc_string("pinned").unwrap();
        assert!(heap.pin(r));
        assert!(heap.pin(r));
        heap.collect([]).unwrap();
        assert!(heap.is_live(r));

        assert!(heap.unpin(r));
        heap.collect([]).unwrap();
        assert!(heap.is_live(r));

        assert!(heap.unpin(r));
        heap.collect([]).unwrap();
        assert!(!heap.is_live(r));
        assert!(!heap.unpin(r));
    }

    #[test]
    fn test_object_limit() {
        let mut heap = Heap::new(HeapConfig {
            max_objects: Some(2),
            ..HeapConfig::default()
        });
        heap.alloc_string("a").unwrap();
        heap.alloc_string("b").unwrap();
        let err = heap.alloc_string("c").unwrap_err();
        assert_eq!(err.kind, ErrorKind::OutOfMemory);
        assert!(heap.should_collect(0));
    }

    #[test]
    fn test_threshold_rearms_after_collect() {
        let mut heap = Heap::new(HeapConfig {
            threshold_objects: 2,
            ..HeapConfig::default()
        });
        let a = heap.alloc_string("a").unwrap();
        let b = heap.alloc_string("b").unwrap();
        assert!(heap.should_collect(0));
        heap.collect([Value::Ref(a), Value::Ref(b)]).unwrap();
        assert!(!heap.should_collect(0));
    }

    #[test]
    fn test_table_keys() {
        let mut heap = heap();
        let t = heap.alloc(HeapObject::Table(HashMap::new())).unwrap();
        heap.table_set(t, Value::Float(1.0), Value::Int(10)).unwrap();
        assert_eq!(heap.table_get(t, Value::Int(1)).unwrap(), Value::Int(10));
        assert_eq!(heap.table_get(t, Value::Int(2)).unwrap(), Value::Nil);
        assert_eq!(heap.table_get(t, Value::Nil).unwrap(), Value::Nil);

        let err = heap.table_set(t, Value::Nil, Value::Int(1)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::TypeMismatch);

        let bytes = heap.live_bytes();
        heap.table_set(t, Value::Int(1), Value::Nil).unwrap();
        assert_eq!(heap.table_get(t, Value::Int(1)).unwrap(), Value::Nil);
        assert!(heap.live_bytes() < bytes);
    }
}
