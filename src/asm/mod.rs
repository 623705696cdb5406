//! Text assembly for code units.
//!
//! The `.sva` format is line oriented:
//!
//! ```text
//! .unit demo
//! .func add arity=2 returns=1 export
//!     get_local 0
//!     get_local 1
//!     add
//!     return
//! .end
//! ```
//!
//! Branches name labels (`@loop`) defined with `loop:`; string operands
//! are interned into the unit's constant pool.

mod dump;
mod parser;

pub use dump::{disassemble, format_op};
pub use parser::{AsmError, assemble};
