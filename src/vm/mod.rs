mod value;
mod ops;
mod heap;
mod native;
mod stack;
mod error;
pub mod bytecode;
pub mod debug;
pub mod verifier;
#[allow(clippy::module_inception)]
mod vm;

pub use value::Value;
pub use ops::{Op, jump_target};
pub use heap::{Closure, GcRef, GcStats, Heap, HeapConfig, HeapObject, TableKey, UserData};
pub use native::{NativeCall, NativeFn, NativeFunction};
pub use stack::{CallStack, Frame};
pub use error::{ErrorKind, Location, RuntimeError, VmError};
pub use debug::LineTable;
pub use vm::{InterruptHandle, UnitId, Vm};

/// A compiled function.
#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub name: String,
    /// Number of parameters; they occupy the first local slots.
    pub arity: u8,
    /// Total local slots, parameters included.
    pub locals: u16,
    /// Number of captured values a closure over this function carries.
    pub upvalues: u16,
    /// Number of values `return` hands back.
    pub returns: u8,
    /// Bound as a global of the same name when the unit is loaded.
    pub exported: bool,
    pub code: Vec<Op>,
    pub lines: LineTable,
}

impl Function {
    pub fn new(name: impl Into<String>, arity: u8, returns: u8) -> Self {
        Self {
            name: name.into(),
            arity,
            locals: arity as u16,
            upvalues: 0,
            returns,
            exported: true,
            code: Vec::new(),
            lines: LineTable::new(),
        }
    }

    pub fn line_at(&self, pc: usize) -> Option<u32> {
        self.lines.find_line(pc)
    }
}

/// Constant-pool entry.
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Int(i64),
    Float(f64),
    Str(String),
}

/// A compiled unit: constant pool plus the functions that share it.
///
/// Immutable once verified; the VM shares it behind an `Arc`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CodeUnit {
    pub name: String,
    pub constants: Vec<Constant>,
    pub functions: Vec<Function>,
}

impl CodeUnit {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Index of a constant, adding it if absent.
    pub fn add_constant(&mut self, constant: Constant) -> u32 {
        let existing = self.constants.iter().position(|c| match (c, &constant) {
            (Constant::Float(a), Constant::Float(b)) => a.to_bits() == b.to_bits(),
            (a, b) => a == b,
        });
        match existing {
            Some(idx) => idx as u32,
            None => {
                self.constants.push(constant);
                (self.constants.len() - 1) as u32
            }
        }
    }

    pub fn function_index(&self, name: &str) -> Option<usize> {
        self.functions.iter().position(|f| f.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_constant_dedups() {
        let mut unit = CodeUnit::new("t");
        let a = unit.add_constant(Constant::Str("x".into()));
        let b = unit.add_constant(Constant::Int(1));
        let c = unit.add_constant(Constant::Str("x".into()));
        let nan1 = unit.add_constant(Constant::Float(f64::NAN));
        let nan2 = unit.add_constant(Constant::Float(f64::NAN));
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(nan1, nan2);
        assert_eq!(unit.constants.len(), 3);
    }

    #[test]
    fn test_function_defaults() {
        let f = Function::new("add", 2, 1);
        assert_eq!(f.locals, 2);
        assert!(f.exported);
        assert_eq!(f.line_at(0), None);
    }
}
