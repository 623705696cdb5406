use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use stackvm::asm;
use stackvm::config::RuntimeConfig;
use stackvm::vm::verifier::Verifier;
use stackvm::vm::{CodeUnit, HeapObject, Value, Vm, bytecode};

#[derive(Parser)]
#[command(name = "stackvm")]
#[command(about = "An embeddable stack-based bytecode VM", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a unit (assembly or binary) and call its entry function
    Run {
        /// The unit to run
        file: PathBuf,

        /// Arguments passed to the entry function (int, float, bool, nil or string)
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,

        /// Exported function to call
        #[arg(long, default_value = "main")]
        entry: String,

        /// Runtime configuration file (TOML)
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Cancel after executing this many instructions
        #[arg(long)]
        max_instructions: Option<u64>,

        /// Cancel after this many milliseconds
        #[arg(long, value_name = "MS")]
        timeout: Option<u64>,

        /// Print GC statistics
        #[arg(long)]
        gc_stats: bool,

        /// Trace every executed instruction to stderr
        #[arg(long)]
        trace: bool,

        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },
    /// Assemble a .sva file into a binary unit
    Asm {
        /// Assembly source
        input: PathBuf,

        /// Output path (defaults to the input with a .svm extension)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Print a unit in assembler syntax
    Disasm {
        /// The unit to disassemble
        file: PathBuf,
    },
    /// Verify a unit without running it
    Verify {
        /// The unit to verify
        file: PathBuf,

        /// Runtime configuration file (TOML)
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run {
            file,
            args,
            entry,
            config,
            max_instructions,
            timeout,
            gc_stats,
            trace,
            json,
        } => load_config(config.as_deref()).and_then(|mut config| {
            config.max_instructions = max_instructions.or(config.max_instructions);
            config.timeout_ms = timeout.or(config.timeout_ms);
            config.gc_stats |= gc_stats;
            config.trace_execution |= trace;
            run_file(&file, &entry, &args, config, json)
        }),
        Commands::Asm { input, output } => assemble_file(&input, output),
        Commands::Disasm { file } => read_unit(&file).map(|unit| {
            print!("{}", asm::disassemble(&unit));
        }),
        Commands::Verify { file, config } => load_config(config.as_deref()).and_then(|config| {
            let unit = read_unit(&file)?;
            let verifier = Verifier::new(config.max_stack_per_function);
            let max_stack = verifier.verify_unit(&unit).map_err(|e| e.to_string())?;
            println!(
                "{}: ok ({} functions, max stack {})",
                file.display(),
                unit.functions.len(),
                max_stack.iter().copied().max().unwrap_or(0)
            );
            Ok(())
        }),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<RuntimeConfig, String> {
    match path {
        Some(path) => RuntimeConfig::load(path),
        None => Ok(RuntimeConfig::default()),
    }
}

/// Read a unit, accepting either the binary format or assembly text.
fn read_unit(path: &Path) -> Result<CodeUnit, String> {
    let data =
        std::fs::read(path).map_err(|e| format!("cannot read '{}': {}", path.display(), e))?;
    if bytecode::is_binary(&data) {
        return bytecode::deserialize(&data).map_err(|e| format!("{}: {}", path.display(), e));
    }
    let text = String::from_utf8(data)
        .map_err(|_| format!("{}: neither a binary unit nor UTF-8 text", path.display()))?;
    asm::assemble(&text).map_err(|e| format!("{}:{}", path.display(), e))
}

fn assemble_file(input: &Path, output: Option<PathBuf>) -> Result<(), String> {
    let source = std::fs::read_to_string(input)
        .map_err(|e| format!("cannot read '{}': {}", input.display(), e))?;
    let unit = asm::assemble(&source).map_err(|e| format!("{}:{}", input.display(), e))?;
    let output = output.unwrap_or_else(|| input.with_extension("svm"));
    std::fs::write(&output, bytecode::serialize(&unit))
        .map_err(|e| format!("cannot write '{}': {}", output.display(), e))
}

fn run_file(
    path: &Path,
    entry: &str,
    args: &[String],
    config: RuntimeConfig,
    json: bool,
) -> Result<(), String> {
    let unit = read_unit(path)?;
    let mut vm = Vm::new(config);

    vm.register_native("print", None, |call| {
        let line: Vec<String> = call.args().iter().map(|v| call.display(*v)).collect();
        println!("{}", line.join(" "));
        Ok(0)
    })
    .map_err(|e| e.to_string())?;

    vm.load(unit).map_err(|e| e.to_string())?;

    let mut values = Vec::with_capacity(args.len());
    for arg in args {
        let value = parse_arg(&mut vm, arg).map_err(|e| e.to_string())?;
        // Earlier arguments must survive allocations for later ones.
        vm.pin(value);
        values.push(value);
    }
    let result = vm.call(entry, &values);
    for value in &values {
        vm.unpin(*value);
    }

    let results = result.map_err(|e| e.to_string())?;
    if json {
        let rendered: Vec<serde_json::Value> = results.iter().map(|v| to_json(&vm, *v, 0)).collect();
        let out = serde_json::json!({ "results": rendered });
        println!("{}", serde_json::to_string_pretty(&out).map_err(|e| e.to_string())?);
    } else {
        for value in results {
            if !value.is_nil() {
                println!("{}", vm.display(value));
            }
        }
    }
    Ok(())
}

fn parse_arg(vm: &mut Vm, arg: &str) -> Result<Value, stackvm::VmError> {
    Ok(match arg {
        "nil" => Value::Nil,
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => {
            if let Ok(n) = arg.parse::<i64>() {
                Value::Int(n)
            } else if let Ok(f) = arg.parse::<f64>() {
                Value::Float(f)
            } else {
                vm.new_string(arg)?
            }
        }
    })
}

fn to_json(vm: &Vm, value: Value, depth: usize) -> serde_json::Value {
    use serde_json::Value as Json;

    match value {
        Value::Nil => Json::Null,
        Value::Bool(b) => Json::Bool(b),
        Value::Int(n) => Json::from(n),
        Value::Float(f) => serde_json::Number::from_f64(f)
            .map(Json::Number)
            .unwrap_or_else(|| Json::String(value.to_string())),
        Value::Ref(r) if depth < 32 => match vm.heap().get(r) {
            Some(HeapObject::String(s)) => Json::String(s.to_string()),
            Some(HeapObject::Array(items)) => {
                Json::Array(items.iter().map(|v| to_json(vm, *v, depth + 1)).collect())
            }
            Some(HeapObject::Table(entries)) => Json::Object(
                entries
                    .iter()
                    .map(|(k, v)| (vm.display(k.to_value()), to_json(vm, *v, depth + 1)))
                    .collect(),
            ),
            _ => Json::String(vm.display(value)),
        },
        Value::Ref(_) => Json::String("...".to_string()),
    }
}
