//! Disassembler: renders a code unit as `.sva` text.

use std::collections::BTreeSet;
use std::fmt::Write;

use crate::vm::{CodeUnit, Constant, Function, Op, jump_target};

/// Render a unit in assembler syntax. Instruction offsets appear as
/// trailing comments; the output assembles back to an equivalent unit.
pub fn disassemble(unit: &CodeUnit) -> String {
    let mut out = String::new();
    let _ = writeln!(out, ".unit {}", quote_if_needed(&unit.name));
    for func in &unit.functions {
        out.push('\n');
        dump_function(&mut out, unit, func);
    }
    out
}

fn dump_function(out: &mut String, unit: &CodeUnit, func: &Function) {
    let _ = write!(
        out,
        ".func {} arity={} locals={}",
        quote_if_needed(&func.name),
        func.arity,
        func.locals
    );
    if func.upvalues > 0 {
        let _ = write!(out, " upvalues={}", func.upvalues);
    }
    let _ = write!(out, " returns={}", func.returns);
    if func.exported {
        out.push_str(" export");
    }
    out.push('\n');

    let targets: BTreeSet<usize> = func
        .code
        .iter()
        .enumerate()
        .filter_map(|(pc, op)| op.jump_offset().and_then(|off| jump_target(pc, off)))
        .collect();

    let mut last_line = None;
    for (pc, op) in func.code.iter().enumerate() {
        if targets.contains(&pc) {
            let _ = writeln!(out, "L{}:", pc);
        }
        let text = format_op(unit, func, pc, op);
        let line = func.line_at(pc);
        if line.is_some() && line != last_line {
            let _ = writeln!(out, "    {:<32} ; {:04}  line {}", text, pc, line.unwrap_or(0));
        } else {
            let _ = writeln!(out, "    {:<32} ; {:04}", text, pc);
        }
        last_line = line;
    }
    // Labels may point one past the last instruction.
    if targets.contains(&func.code.len()) {
        let _ = writeln!(out, "L{}:", func.code.len());
    }
    out.push_str(".end\n");
}

/// Format a single instruction with its operands resolved.
pub fn format_op(unit: &CodeUnit, func: &Function, pc: usize, op: &Op) -> String {
    let name = op.name();
    match op {
        Op::Int(n) => format!("{} {}", name, n),
        Op::Const(k) => format!("{} {}", name, constant_operand(unit, *k)),
        Op::GetLocal(n) | Op::SetLocal(n) | Op::GetUpvalue(n) | Op::SetUpvalue(n) => {
            format!("{} {}", name, n)
        }
        Op::GetGlobal(k) | Op::SetGlobal(k) => match unit.constants.get(*k as usize) {
            Some(Constant::Str(s)) => format!("{} {}", name, quote_if_needed(s)),
            _ => format!("{} ?{}", name, k),
        },
        Op::Jump(off) | Op::JumpIfFalse(off) | Op::JumpIfTrue(off) | Op::Try(off) => {
            match jump_target(pc, *off) {
                Some(target) if target <= func.code.len() => format!("{} @L{}", name, target),
                _ => format!("{} {}", name, off),
            }
        }
        Op::Call { argc, results } => format!("{} {} {}", name, argc, results),
        Op::Closure(f) => {
            let idx = *f as usize;
            match unit.functions.get(idx) {
                Some(target) if unit.function_index(&target.name) == Some(idx) => {
                    format!("{} {}", name, quote_if_needed(&target.name))
                }
                _ => format!("{} {}", name, f),
            }
        }
        Op::NewArray(n) => format!("{} {}", name, n),
        _ => name.to_string(),
    }
}

fn constant_operand(unit: &CodeUnit, k: u32) -> String {
    match unit.constants.get(k as usize) {
        Some(Constant::Int(n)) => n.to_string(),
        Some(Constant::Float(f)) => format_float(*f),
        Some(Constant::Str(s)) => quote(s),
        None => format!("?{}", k),
    }
}

/// Floats always carry a decimal point so they reassemble as floats.
fn format_float(f: f64) -> String {
    if f.is_nan() {
        "nan".to_string()
    } else if f.is_infinite() {
        if f > 0.0 { "inf" } else { "-inf" }.to_string()
    } else if f.fract() == 0.0 && f.abs() < 1e16 {
        format!("{:.1}", f)
    } else {
        format!("{:?}", f)
    }
}

fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            '\0' => out.push_str("\\0"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

fn quote_if_needed(s: &str) -> String {
    let plain = s.chars().next().is_some_and(|c| c.is_alphabetic() || c == '_')
        && s.chars().all(|c| c.is_alphanumeric() || c == '_');
    if plain { s.to_string() } else { quote(s) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::assemble;

    #[test]
    fn test_disassemble_labels_and_operands() {
        let source = r#"
.unit demo
.func loop arity=1 returns=1 export
top:
    get_local 0
    jump_if_false @done
    const "tick"
    get_global print
    swap
    call 1 0
    jump @top
done:
    const 1.0
    return
.end
"#;
        let unit = assemble(source).unwrap();
        let text = disassemble(&unit);
        assert!(text.starts_with(".unit demo\n"));
        assert!(text.contains(".func loop arity=1 locals=1 returns=1 export"));
        assert!(text.contains("L0:"));
        assert!(text.contains("jump_if_false @L7"));
        assert!(text.contains("const \"tick\""));
        assert!(text.contains("const 1.0"));
        assert!(text.contains("call 1 0"));

        let again = assemble(&text).unwrap();
        assert_eq!(again.constants, unit.constants);
        assert_eq!(again.functions[0].code, unit.functions[0].code);
    }

    #[test]
    fn test_quoting() {
        assert_eq!(quote("a\"b\n"), "\"a\\\"b\\n\"");
        assert_eq!(quote_if_needed("main"), "main");
        assert_eq!(quote_if_needed("my fn"), "\"my fn\"");
        assert_eq!(format_float(f64::INFINITY), "inf");
        assert_eq!(format_float(3.0), "3.0");
        assert_eq!(format_float(0.1), "0.1");
    }
}
