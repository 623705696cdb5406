//! Assembler for the `.sva` text format.

use std::collections::HashMap;

use thiserror::Error;

use crate::vm::{CodeUnit, Constant, Function, Op};

#[derive(Debug, Clone, PartialEq, Error)]
#[error("line {line}: {message}")]
pub struct AsmError {
    pub line: usize,
    pub message: String,
}

impl AsmError {
    fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

/// Token kinds of one assembly line.
#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Int(i64),
    Float(f64),
    Str(String),
    /// `@name`
    LabelRef(String),
    /// `.name`
    Directive(String),
    /// `name:`
    LabelDef(String),
    /// `key=value`
    Attr(String, String),
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Word(w) => format!("'{}'", w),
            Token::Int(n) => n.to_string(),
            Token::Float(f) => f.to_string(),
            Token::Str(s) => format!("{:?}", s),
            Token::LabelRef(l) => format!("@{}", l),
            Token::Directive(d) => format!(".{}", d),
            Token::LabelDef(l) => format!("{}:", l),
            Token::Attr(k, v) => format!("{}={}", k, v),
        }
    }
}

fn tokenize(text: &str, line: usize) -> Result<Vec<Token>, AsmError> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() || c == ',' {
            chars.next();
            continue;
        }
        if c == ';' || c == '#' {
            break;
        }
        if c == '"' {
            chars.next();
            let mut s = String::new();
            loop {
                match chars.next() {
                    None => return Err(AsmError::new(line, "unterminated string literal")),
                    Some('"') => break,
                    Some('\\') => match chars.next() {
                        Some('n') => s.push('\n'),
                        Some('t') => s.push('\t'),
                        Some('r') => s.push('\r'),
                        Some('0') => s.push('\0'),
                        Some('"') => s.push('"'),
                        Some('\\') => s.push('\\'),
                        Some(other) => {
                            return Err(AsmError::new(
                                line,
                                format!("unknown escape sequence '\\{}'", other),
                            ));
                        }
                        None => return Err(AsmError::new(line, "unterminated string literal")),
                    },
                    Some(ch) => s.push(ch),
                }
            }
            tokens.push(Token::Str(s));
            continue;
        }

        let mut word = String::new();
        while let Some(&ch) = chars.peek() {
            if ch.is_whitespace() || ch == ',' || ch == ';' || ch == '"' {
                break;
            }
            word.push(ch);
            chars.next();
        }
        tokens.push(classify(word, line)?);
    }
    Ok(tokens)
}

fn classify(word: String, line: usize) -> Result<Token, AsmError> {
    if let Some(name) = word.strip_prefix('@') {
        return Ok(Token::LabelRef(name.to_string()));
    }
    if let Some(name) = word.strip_prefix('.') {
        return Ok(Token::Directive(name.to_string()));
    }
    if let Some(name) = word.strip_suffix(':') {
        if !is_ident(name) {
            return Err(AsmError::new(line, format!("invalid label name '{}'", name)));
        }
        return Ok(Token::LabelDef(name.to_string()));
    }
    if let Some((key, value)) = word.split_once('=') {
        return Ok(Token::Attr(key.to_string(), value.to_string()));
    }
    if let Some(n) = parse_int(&word) {
        return Ok(Token::Int(n));
    }
    if let Some(f) = parse_float(&word) {
        return Ok(Token::Float(f));
    }
    Ok(Token::Word(word))
}

fn is_ident(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_alphabetic() || c == '_')
        && chars.all(|c| c.is_alphanumeric() || c == '_' || c == '.')
}

fn parse_int(s: &str) -> Option<i64> {
    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let magnitude = if let Some(hex) = digits.strip_prefix("0x") {
        i128::from_str_radix(hex, 16).ok()?
    } else if digits.chars().all(|c| c.is_ascii_digit()) && !digits.is_empty() {
        digits.parse::<i128>().ok()?
    } else {
        return None;
    };
    let value = if negative { -magnitude } else { magnitude };
    i64::try_from(value).ok()
}

fn parse_float(s: &str) -> Option<f64> {
    match s {
        "inf" => Some(f64::INFINITY),
        "-inf" => Some(f64::NEG_INFINITY),
        "nan" => Some(f64::NAN),
        _ if s.contains(['.', 'e', 'E']) && s.starts_with(|c: char| c.is_ascii_digit() || c == '-') => {
            s.parse().ok()
        }
        _ => None,
    }
}

/// A branch waiting for its label to be defined.
struct PendingJump {
    pc: usize,
    label: String,
    line: usize,
}

/// A `closure` naming a function that may be defined later in the unit.
struct PendingClosure {
    function: usize,
    pc: usize,
    name: String,
    line: usize,
}

struct FunctionBuilder {
    func: Function,
    labels: HashMap<String, usize>,
    jumps: Vec<PendingJump>,
    start_line: usize,
}

/// Assemble `.sva` source text into a code unit.
///
/// The line table of every function records the source line of each
/// instruction.
pub fn assemble(source: &str) -> Result<CodeUnit, AsmError> {
    Assembler::new().assemble(source)
}

struct Assembler {
    unit: CodeUnit,
    current: Option<FunctionBuilder>,
    closures: Vec<PendingClosure>,
    saw_unit: bool,
}

impl Assembler {
    fn new() -> Self {
        Self {
            unit: CodeUnit::new("main"),
            current: None,
            closures: Vec::new(),
            saw_unit: false,
        }
    }

    fn assemble(mut self, source: &str) -> Result<CodeUnit, AsmError> {
        for (idx, text) in source.lines().enumerate() {
            let line = idx + 1;
            let tokens = tokenize(text, line)?;
            self.line(tokens, line)?;
        }

        if let Some(builder) = &self.current {
            return Err(AsmError::new(
                builder.start_line,
                format!("function '{}' is missing .end", builder.func.name),
            ));
        }

        for pending in std::mem::take(&mut self.closures) {
            let target = self.unit.function_index(&pending.name).ok_or_else(|| {
                AsmError::new(pending.line, format!("unknown function '{}'", pending.name))
            })?;
            self.unit.functions[pending.function].code[pending.pc] = Op::Closure(target as u32);
        }
        Ok(self.unit)
    }

    fn line(&mut self, tokens: Vec<Token>, line: usize) -> Result<(), AsmError> {
        let mut tokens = tokens.into_iter();
        let Some(first) = tokens.next() else {
            return Ok(());
        };
        let mut first = first;

        // Labels may share a line with an instruction.
        while let Token::LabelDef(name) = &first {
            self.define_label(name, line)?;
            match tokens.next() {
                Some(next) => first = next,
                None => return Ok(()),
            }
        }

        let rest: Vec<Token> = tokens.collect();
        match first {
            Token::Directive(d) => self.directive(&d, rest, line),
            Token::Word(mnemonic) => self.instruction(&mnemonic, rest, line),
            other => Err(AsmError::new(
                line,
                format!("expected an instruction, found {}", other.describe()),
            )),
        }
    }

    fn builder(&mut self, line: usize) -> Result<&mut FunctionBuilder, AsmError> {
        self.current
            .as_mut()
            .ok_or_else(|| AsmError::new(line, "instruction outside of .func"))
    }

    fn define_label(&mut self, name: &str, line: usize) -> Result<(), AsmError> {
        let builder = self.builder(line)?;
        let pc = builder.func.code.len();
        if builder.labels.insert(name.to_string(), pc).is_some() {
            return Err(AsmError::new(line, format!("label '{}' defined twice", name)));
        }
        Ok(())
    }

    fn directive(&mut self, name: &str, args: Vec<Token>, line: usize) -> Result<(), AsmError> {
        match name {
            "unit" => {
                if self.saw_unit || !self.unit.functions.is_empty() || self.current.is_some() {
                    return Err(AsmError::new(line, ".unit must come first and only once"));
                }
                self.unit.name = match args.as_slice() {
                    [Token::Word(w)] => w.clone(),
                    [Token::Str(s)] => s.clone(),
                    _ => return Err(AsmError::new(line, ".unit expects a name")),
                };
                self.saw_unit = true;
                Ok(())
            }
            "func" => self.begin_function(args, line),
            "end" => self.end_function(line),
            other => Err(AsmError::new(line, format!("unknown directive '.{}'", other))),
        }
    }

    fn begin_function(&mut self, args: Vec<Token>, line: usize) -> Result<(), AsmError> {
        if let Some(open) = &self.current {
            return Err(AsmError::new(
                line,
                format!("function '{}' is still open", open.func.name),
            ));
        }
        let mut args = args.into_iter();
        let name = match args.next() {
            Some(Token::Word(w)) if is_ident(&w) => w,
            Some(Token::Str(s)) => s,
            _ => return Err(AsmError::new(line, ".func expects a function name")),
        };

        let mut func = Function::new(name, 0, 0);
        func.exported = false;
        let mut locals = None;
        for token in args {
            match token {
                Token::Word(w) if w == "export" => func.exported = true,
                Token::Attr(key, value) => {
                    let number: u32 = value.parse().map_err(|_| {
                        AsmError::new(line, format!("{} expects a number, got '{}'", key, value))
                    })?;
                    let narrow = |max: u32| {
                        if number > max {
                            Err(AsmError::new(line, format!("{}={} is too large", key, number)))
                        } else {
                            Ok(number)
                        }
                    };
                    match key.as_str() {
                        "arity" => func.arity = narrow(u8::MAX as u32)? as u8,
                        "returns" => func.returns = narrow(u8::MAX as u32)? as u8,
                        "locals" => locals = Some(narrow(u16::MAX as u32)? as u16),
                        "upvalues" => func.upvalues = narrow(u16::MAX as u32)? as u16,
                        _ => {
                            return Err(AsmError::new(line, format!("unknown attribute '{}'", key)));
                        }
                    }
                }
                other => {
                    return Err(AsmError::new(
                        line,
                        format!("unexpected {} in .func", other.describe()),
                    ));
                }
            }
        }
        func.locals = locals.unwrap_or(func.arity as u16);

        self.current = Some(FunctionBuilder {
            func,
            labels: HashMap::new(),
            jumps: Vec::new(),
            start_line: line,
        });
        Ok(())
    }

    fn end_function(&mut self, line: usize) -> Result<(), AsmError> {
        let Some(mut builder) = self.current.take() else {
            return Err(AsmError::new(line, ".end without .func"));
        };
        for jump in builder.jumps.drain(..) {
            let target = *builder.labels.get(&jump.label).ok_or_else(|| {
                AsmError::new(jump.line, format!("undefined label '{}'", jump.label))
            })?;
            let offset = target as i64 - jump.pc as i64 - 1;
            let offset = i32::try_from(offset)
                .map_err(|_| AsmError::new(jump.line, "jump distance too large"))?;
            let op = &mut builder.func.code[jump.pc];
            *op = op.with_jump_offset(offset);
        }
        self.unit.functions.push(builder.func);
        Ok(())
    }

    fn instruction(&mut self, mnemonic: &str, args: Vec<Token>, line: usize) -> Result<(), AsmError> {
        let arity_error = |expected: &str| {
            AsmError::new(line, format!("'{}' expects {}", mnemonic, expected))
        };

        let op = match (mnemonic, args.as_slice()) {
            ("nil", []) => Op::Nil,
            ("true", []) => Op::True,
            ("false", []) => Op::False,
            ("int", [Token::Int(n)]) => Op::Int(*n),
            ("int", _) => return Err(arity_error("an integer")),
            ("const", [value]) => {
                let constant = match value {
                    Token::Int(n) => Constant::Int(*n),
                    Token::Float(f) => Constant::Float(*f),
                    Token::Str(s) => Constant::Str(s.clone()),
                    _ => return Err(arity_error("an int, float, or string constant")),
                };
                Op::Const(self.unit.add_constant(constant))
            }
            ("pop", []) => Op::Pop,
            ("dup", []) => Op::Dup,
            ("swap", []) => Op::Swap,
            ("get_local", [t]) => Op::GetLocal(self.index16(t, mnemonic, line)?),
            ("set_local", [t]) => Op::SetLocal(self.index16(t, mnemonic, line)?),
            ("get_upvalue", [t]) => Op::GetUpvalue(self.index16(t, mnemonic, line)?),
            ("set_upvalue", [t]) => Op::SetUpvalue(self.index16(t, mnemonic, line)?),
            ("get_global", [t]) => Op::GetGlobal(self.global_name(t, mnemonic, line)?),
            ("set_global", [t]) => Op::SetGlobal(self.global_name(t, mnemonic, line)?),
            ("add", []) => Op::Add,
            ("sub", []) => Op::Sub,
            ("mul", []) => Op::Mul,
            ("div", []) => Op::Div,
            ("mod", []) => Op::Mod,
            ("neg", []) => Op::Neg,
            ("eq", []) => Op::Eq,
            ("ne", []) => Op::Ne,
            ("lt", []) => Op::Lt,
            ("le", []) => Op::Le,
            ("gt", []) => Op::Gt,
            ("ge", []) => Op::Ge,
            ("not", []) => Op::Not,
            ("jump", [t]) => self.branch(Op::Jump(0), t, mnemonic, line)?,
            ("jump_if_false", [t]) => self.branch(Op::JumpIfFalse(0), t, mnemonic, line)?,
            ("jump_if_true", [t]) => self.branch(Op::JumpIfTrue(0), t, mnemonic, line)?,
            ("try", [t]) => self.branch(Op::Try(0), t, mnemonic, line)?,
            ("call", [Token::Int(argc)]) => Op::Call {
                argc: small(*argc, line)?,
                results: 1,
            },
            ("call", [Token::Int(argc), Token::Int(results)]) => Op::Call {
                argc: small(*argc, line)?,
                results: small(*results, line)?,
            },
            ("call", _) => return Err(arity_error("an argument count and optional result count")),
            ("return", []) => Op::Return,
            ("closure", [Token::Int(n)]) => Op::Closure(
                u32::try_from(*n).map_err(|_| AsmError::new(line, "function index out of range"))?,
            ),
            ("closure", [Token::Word(name)]) | ("closure", [Token::Str(name)]) => {
                let function = self.unit.functions.len();
                let pc = self.builder(line)?.func.code.len();
                self.closures.push(PendingClosure {
                    function,
                    pc,
                    name: name.clone(),
                    line,
                });
                Op::Closure(0)
            }
            ("closure", _) => return Err(arity_error("a function name or index")),
            ("new_array", [Token::Int(n)]) => Op::NewArray(
                u32::try_from(*n).map_err(|_| AsmError::new(line, "array size out of range"))?,
            ),
            ("new_array", _) => return Err(arity_error("an element count")),
            ("new_table", []) => Op::NewTable,
            ("get_index", []) => Op::GetIndex,
            ("set_index", []) => Op::SetIndex,
            ("len", []) => Op::Len,
            ("end_try", []) => Op::EndTry,
            ("throw", []) => Op::Throw,
            (
                "nil" | "true" | "false" | "pop" | "dup" | "swap" | "add" | "sub" | "mul" | "div"
                | "mod" | "neg" | "eq" | "ne" | "lt" | "le" | "gt" | "ge" | "not" | "return"
                | "new_table" | "get_index" | "set_index" | "len" | "end_try" | "throw",
                _,
            ) => return Err(arity_error("no operands")),
            (
                "const" | "get_local" | "set_local" | "get_upvalue" | "set_upvalue" | "get_global"
                | "set_global" | "jump" | "jump_if_false" | "jump_if_true" | "try",
                _,
            ) => return Err(arity_error("one operand")),
            _ => {
                return Err(AsmError::new(line, format!("unknown instruction '{}'", mnemonic)));
            }
        };

        let builder = self.builder(line)?;
        let pc = builder.func.code.len();
        builder.func.code.push(op);
        builder.func.lines.add(pc, line as u32);
        Ok(())
    }

    fn index16(&self, token: &Token, mnemonic: &str, line: usize) -> Result<u16, AsmError> {
        match token {
            Token::Int(n) => u16::try_from(*n)
                .map_err(|_| AsmError::new(line, format!("{} index {} out of range", mnemonic, n))),
            other => Err(AsmError::new(
                line,
                format!("{} expects a slot index, found {}", mnemonic, other.describe()),
            )),
        }
    }

    fn global_name(&mut self, token: &Token, mnemonic: &str, line: usize) -> Result<u32, AsmError> {
        match token {
            Token::Word(name) | Token::Str(name) => {
                Ok(self.unit.add_constant(Constant::Str(name.clone())))
            }
            other => Err(AsmError::new(
                line,
                format!("{} expects a global name, found {}", mnemonic, other.describe()),
            )),
        }
    }

    fn branch(&mut self, op: Op, token: &Token, mnemonic: &str, line: usize) -> Result<Op, AsmError> {
        match token {
            Token::LabelRef(label) => {
                let builder = self.builder(line)?;
                builder.jumps.push(PendingJump {
                    pc: builder.func.code.len(),
                    label: label.clone(),
                    line,
                });
                Ok(op)
            }
            Token::Int(n) => {
                let offset = i32::try_from(*n)
                    .map_err(|_| AsmError::new(line, "jump distance too large"))?;
                Ok(op.with_jump_offset(offset))
            }
            other => Err(AsmError::new(
                line,
                format!("{} expects @label or an offset, found {}", mnemonic, other.describe()),
            )),
        }
    }
}

fn small(n: i64, line: usize) -> Result<u8, AsmError> {
    u8::try_from(n).map_err(|_| AsmError::new(line, format!("count {} out of range", n)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assemble_function() {
        let unit = assemble(
            r#"
            .unit demo
            ; adds two numbers
            .func add arity=2 returns=1 export
                get_local 0
                get_local 1
                add
                return
            .end
            "#,
        )
        .unwrap();
        assert_eq!(unit.name, "demo");
        let add = &unit.functions[0];
        assert_eq!(add.arity, 2);
        assert_eq!(add.locals, 2);
        assert!(add.exported);
        assert_eq!(
            add.code,
            vec![Op::GetLocal(0), Op::GetLocal(1), Op::Add, Op::Return]
        );
        assert_eq!(add.line_at(2), Some(7));
    }

    #[test]
    fn test_labels_resolve_both_directions() {
        let unit = assemble(
            ".func f arity=1 returns=1\n\
             top: get_local 0\n\
             jump_if_false @done\n\
             jump @top\n\
             done:\n\
             nil\n\
             return\n\
             .end",
        )
        .unwrap();
        let code = &unit.functions[0].code;
        assert_eq!(code[1], Op::JumpIfFalse(1));
        assert_eq!(code[2], Op::Jump(-3));
    }

    #[test]
    fn test_constants_and_globals() {
        let unit = assemble(
            ".func f returns=1\n\
             const \"hi\\n\"\n\
             const 2.5\n\
             const -7\n\
             get_global print\n\
             set_global \"print\"\n\
             return\n\
             .end",
        )
        .unwrap();
        assert_eq!(
            unit.constants,
            vec![
                Constant::Str("hi\n".into()),
                Constant::Float(2.5),
                Constant::Int(-7),
                Constant::Str("print".into()),
            ]
        );
        assert_eq!(unit.functions[0].code[3], Op::GetGlobal(3));
        assert_eq!(unit.functions[0].code[4], Op::SetGlobal(3));
    }

    #[test]
    fn test_closure_forward_reference() {
        let unit = assemble(
            ".func make returns=1 export\n\
             int 1\n\
             closure inner\n\
             return\n\
             .end\n\
             .func inner upvalues=1 returns=1\n\
             get_upvalue 0\n\
             return\n\
             .end",
        )
        .unwrap();
        assert_eq!(unit.functions[0].code[1], Op::Closure(1));
        assert!(!unit.functions[1].exported);
    }

    #[test]
    fn test_call_operands() {
        let unit = assemble(".func f\ncall 2\ncall 0 3\nreturn\n.end").unwrap();
        assert_eq!(unit.functions[0].code[0], Op::Call { argc: 2, results: 1 });
        assert_eq!(unit.functions[0].code[1], Op::Call { argc: 0, results: 3 });
    }

    #[test]
    fn test_errors_report_line() {
        let err = assemble(".func f\n  bogus\n.end").unwrap_err();
        assert_eq!(err.line, 2);
        assert!(err.message.contains("unknown instruction"));

        let err = assemble(".func f\njump @nowhere\n.end").unwrap_err();
        assert_eq!(err.line, 2);

        let err = assemble("add").unwrap_err();
        assert_eq!(err.message, "instruction outside of .func");

        let err = assemble(".func f\nreturn").unwrap_err();
        assert_eq!(err.line, 1);

        let err = assemble(".func f\nconst \"open\n.end").unwrap_err();
        assert_eq!(err.to_string(), "line 2: unterminated string literal");

        let err = assemble(".func f\nadd 1\n.end").unwrap_err();
        assert_eq!(err.to_string(), "line 2: 'add' expects no operands");
    }
}
