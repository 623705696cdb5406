//! Embedding scenarios driven through the public Rust API.

use stackvm::vm::bytecode;
use stackvm::{CodeUnit, ErrorKind, Function, Op, RuntimeConfig, RuntimeError, Value, Vm, VmError, asm};

fn load(vm: &mut Vm, source: &str) {
    let unit = asm::assemble(source).unwrap();
    vm.load(unit).unwrap();
}

fn vm_with(source: &str) -> Vm {
    let mut vm = Vm::default();
    load(&mut vm, source);
    vm
}

fn kind_of(result: Result<Vec<Value>, VmError>) -> ErrorKind {
    match result {
        Err(e) => e.runtime_kind().expect("runtime error"),
        Ok(values) => panic!("expected an error, got {:?}", values),
    }
}

#[test]
fn test_native_add() {
    let mut vm = Vm::default();
    vm.register_native("add", Some(2), |call| {
        let sum = call.int(0)? + call.int(1)?;
        call.push(Value::Int(sum));
        Ok(1)
    })
    .unwrap();

    assert_eq!(vm.call("add", &[Value::Int(2), Value::Int(3)]).unwrap(), vec![Value::Int(5)]);
    assert_eq!(kind_of(vm.call("add", &[Value::Int(2)])), ErrorKind::ArityMismatch);
}

#[test]
fn test_script_calls_native_with_wrong_arity() {
    let mut vm = Vm::default();
    vm.register_native("add", Some(2), |call| {
        let sum = call.int(0)? + call.int(1)?;
        call.push(Value::Int(sum));
        Ok(1)
    })
    .unwrap();
    load(
        &mut vm,
        r#"
.func main returns=1 export
    get_global add
    int 2
    call 1
    return
.end
"#,
    );
    let err = vm.call("main", &[]).unwrap_err();
    assert_eq!(err.runtime_kind(), Some(ErrorKind::ArityMismatch));
    let VmError::Runtime(RuntimeError { location: Some(location), .. }) = err else {
        panic!("expected a located runtime error");
    };
    assert_eq!(location.function, "main");
    assert_eq!(location.offset, 2);
}

#[test]
fn test_integer_and_float_division() {
    let mut vm = vm_with(
        r#"
.func int_div returns=1 export
    int 1
    int 0
    div
    return
.end

.func float_div returns=1 export
    const 1.0
    const 0.0
    div
    return
.end
"#,
    );
    assert_eq!(kind_of(vm.call("int_div", &[])), ErrorKind::DivideByZero);
    let result = vm.call("float_div", &[]).unwrap();
    assert_eq!(result, vec![Value::Float(f64::INFINITY)]);
}

#[test]
fn test_index_out_of_range_and_missing_key() {
    let mut vm = vm_with(
        r#"
.func array_at arity=1 returns=1 export
    int 10
    int 20
    int 30
    new_array 3
    get_local 0
    get_index
    return
.end

.func table_at arity=1 returns=1 export
    new_table
    dup
    const "present"
    int 1
    set_index
    get_local 0
    get_index
    return
.end
"#,
    );
    assert_eq!(vm.call("array_at", &[Value::Int(1)]).unwrap(), vec![Value::Int(20)]);
    assert_eq!(kind_of(vm.call("array_at", &[Value::Int(5)])), ErrorKind::IndexOutOfRange);

    let present = vm.new_string("present").unwrap();
    assert_eq!(vm.call("table_at", &[present]).unwrap(), vec![Value::Int(1)]);
    let missing = vm.new_string("missing").unwrap();
    assert_eq!(vm.call("table_at", &[missing]).unwrap(), vec![Value::Nil]);
}

#[test]
fn test_stack_overflow_leaves_vm_usable() {
    let config = RuntimeConfig {
        max_call_depth: 64,
        ..RuntimeConfig::default()
    };
    let mut vm = Vm::new(config);
    load(
        &mut vm,
        r#"
.func down arity=1 returns=1 export
    get_global down
    get_local 0
    int 1
    add
    call 1
    return
.end

.func answer returns=1 export
    int 42
    return
.end
"#,
    );
    assert_eq!(kind_of(vm.call("down", &[Value::Int(0)])), ErrorKind::StackOverflow);
    assert_eq!(vm.stack_len(), 0);
    assert_eq!(vm.frame_depth(), 0);
    assert!(!vm.is_poisoned());
    assert_eq!(vm.call("answer", &[]).unwrap(), vec![Value::Int(42)]);
}

#[test]
fn test_return_leaves_declared_results() {
    let mut vm = vm_with(
        r#"
.func pair arity=1 returns=2
    get_local 0
    get_local 0
    int 1
    add
    return
.end

.func main returns=1 export
    int 7
    closure pair
    int 1
    call 1 2
    new_array 3
    return
.end
"#,
    );
    let result = vm.call("main", &[]).unwrap();
    assert_eq!(vm.array(result[0]).unwrap(), &[Value::Int(7), Value::Int(1), Value::Int(2)]);
    assert_eq!(vm.stack_len(), 0);
}

#[test]
fn test_malformed_bytecode_is_rejected() {
    let mut unit = CodeUnit::new("bad");
    let mut main = Function::new("main", 0, 0);
    main.code = vec![Op::Nil, Op::Pop, Op::Return];
    unit.functions.push(main);

    // The code bytes sit just before the trailing empty line table.
    let mut bytes = bytecode::serialize(&unit);
    let nil_at = bytes.len() - 4 - 3;
    bytes[nil_at] = 0xff;

    let calls = std::rc::Rc::new(std::cell::Cell::new(0));
    let seen = std::rc::Rc::clone(&calls);
    let mut vm = Vm::default();
    vm.register_native("spy", None, move |_| {
        seen.set(seen.get() + 1);
        Ok(0)
    })
    .unwrap();

    let err = vm.load_bytes(&bytes).unwrap_err();
    assert!(matches!(err, VmError::Verify(_)), "{err}");
    assert!(vm.get_global("main").is_none());

    // Unbalanced stack and a jump out of bounds.
    let mut unbalanced = CodeUnit::new("unbalanced");
    let mut f = Function::new("main", 0, 1);
    f.code = vec![Op::GetGlobal(0), Op::Pop, Op::Pop, Op::Return];
    unbalanced.add_constant(stackvm::Constant::Str("spy".into()));
    unbalanced.functions.push(f);
    assert!(matches!(vm.load(unbalanced), Err(VmError::Verify(_))));

    let mut wild = CodeUnit::new("wild");
    let mut f = Function::new("main", 0, 0);
    f.code = vec![Op::Jump(40), Op::Return];
    wild.functions.push(f);
    assert!(matches!(vm.load(wild), Err(VmError::Verify(_))));

    assert_eq!(calls.get(), 0);
    assert!(vm.get_global("main").is_none());
}

#[test]
fn test_reachable_values_survive_collection() {
    let config = RuntimeConfig {
        gc_threshold_objects: 16,
        ..RuntimeConfig::default()
    };
    let mut vm = Vm::new(config);
    load(
        &mut vm,
        r#"
; Builds [1, [2, [3, ... nil]]] while dropping a table per step.
.func build arity=1 locals=2 returns=1 export
    nil
    set_local 1
loop:
    get_local 0
    int 0
    le
    jump_if_true @done
    get_local 0
    get_local 1
    new_array 2
    set_local 1
    new_table
    pop
    get_local 0
    int 1
    sub
    set_local 0
    jump @loop
done:
    get_local 1
    return
.end
"#,
    );
    let head = vm.call("build", &[Value::Int(200)]).unwrap()[0];
    vm.set_global("chain", head).unwrap();
    vm.collect_garbage().unwrap();
    assert!(vm.gc_stats().cycles > 1);

    let mut node = vm.get_global("chain").unwrap();
    for expected in 1..=200 {
        let items = vm.array(node).expect("live array");
        assert_eq!(items[0], Value::Int(expected));
        node = items[1];
    }
    assert_eq!(node, Value::Nil);

    vm.set_global("chain", Value::Nil).unwrap();
    vm.collect_garbage().unwrap();
    assert!(vm.array(head).is_none());
}

const COUNTER: &str = r#"
.func bump arity=1 returns=1 export
    get_global total
    get_local 0
    add
    dup
    set_global total
    get_global log
    dup
    len
    get_local 0
    set_index
    return
.end
"#;

fn run_counter(inputs: &[i64]) -> (Vec<String>, Vec<(String, String)>) {
    let mut vm = vm_with(COUNTER);
    vm.set_global("total", Value::Int(0)).unwrap();
    let log = vm.new_table().unwrap();
    vm.set_global("log", log).unwrap();

    let results = inputs
        .iter()
        .map(|n| {
            let out = vm.call("bump", &[Value::Int(*n)]).unwrap();
            vm.display(out[0])
        })
        .collect();
    let globals = vm
        .globals()
        .into_iter()
        .map(|(name, value)| (name, vm.display(value)))
        .collect();
    (results, globals)
}

#[test]
fn test_independent_vms_are_deterministic() {
    let inputs = [3, -1, 40, 2];
    let first = run_counter(&inputs);
    let second = run_counter(&inputs);
    assert_eq!(first, second);
    assert_eq!(first.0, vec!["3", "2", "42", "44"]);
    assert!(first.1.contains(&("total".to_string(), "44".to_string())));
}

#[test]
fn test_protected_call_recovers() {
    let mut vm = vm_with(
        r#"
.func risky arity=1 returns=1
    int 10
    get_local 0
    div
    return
.end

.func safe arity=1 returns=1 export
    try @caught
    closure risky
    get_local 0
    call 1
    end_try
    return
caught:
    ; the error value replaces everything pushed since `try`
    pop
    int -1
    return
.end
"#,
    );
    assert_eq!(vm.call("safe", &[Value::Int(2)]).unwrap(), vec![Value::Int(5)]);
    assert_eq!(vm.call("safe", &[Value::Int(0)]).unwrap(), vec![Value::Int(-1)]);
    assert_eq!(vm.stack_len(), 0);
}
