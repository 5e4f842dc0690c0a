//! End-to-end scenarios: text-format modules through decode, validation,
//! linking and execution.

use kpio_wasm::store::InstanceAddr;
use kpio_wasm::{Error, LinkError, RuntimeConfig, TrapKind, Value, WasmRuntime};

fn instantiate(runtime: &mut WasmRuntime, wat: &str) -> Result<InstanceAddr, Error> {
    let bytes = wat::parse_str(wat).expect("test module should assemble");
    let module = runtime.load_module(&bytes)?;
    runtime.instantiate_module(module)
}

fn trap_kind(result: Result<Vec<Value>, Error>) -> TrapKind {
    match result {
        Err(Error::Trap(trap)) => trap.kind,
        other => panic!("expected a trap, got {:?}", other),
    }
}

#[test]
fn test_constant_add() {
    let mut runtime = WasmRuntime::default();
    let instance = instantiate(
        &mut runtime,
        r#"(module
            (func (export "main") (result i32)
                i32.const 1
                i32.const 1
                i32.add))"#,
    )
    .unwrap();
    assert_eq!(runtime.invoke(instance, "main", &[]).unwrap(), vec![Value::I32(2)]);
}

#[test]
fn test_divide_by_zero_traps() {
    let mut runtime = WasmRuntime::default();
    let instance = instantiate(
        &mut runtime,
        r#"(module
            (func (export "main") (result i32)
                (i32.div_s (i32.const 1) (i32.const 0))))"#,
    )
    .unwrap();
    let result = runtime.invoke(instance, "main", &[]);
    let Err(Error::Trap(trap)) = result else {
        panic!("expected a trap, got {:?}", result);
    };
    assert_eq!(trap.kind, TrapKind::DivideByZero);
    assert_eq!(trap.mnemonic, Some("i32.div_s"));
    assert_eq!(trap.operands, vec![Value::I32(1), Value::I32(0)]);
}

#[test]
fn test_load_past_single_page_traps() {
    let mut runtime = WasmRuntime::default();
    let instance = instantiate(
        &mut runtime,
        r#"(module
            (memory 1)
            (func (export "main") (result i32)
                (i32.load offset=65536 (i32.const 0))))"#,
    )
    .unwrap();
    assert_eq!(
        trap_kind(runtime.invoke(instance, "main", &[])),
        TrapKind::OutOfBoundsMemoryAccess
    );
}

#[test]
fn test_missing_import_is_unlinkable() {
    let mut runtime = WasmRuntime::default();
    let err = instantiate(
        &mut runtime,
        r#"(module
            (import "env" "missing" (func))
            (func (export "main") call 0))"#,
    )
    .unwrap_err();
    assert!(matches!(
        err,
        Error::Link(LinkError::UnknownImport { ref module, ref name })
            if module == "env" && name == "missing"
    ));
    assert!(err.to_string().starts_with("unlinkable"));
}

#[test]
fn test_infinite_loop_validates_and_runs_until_fuel_is_gone() {
    for fusion in [true, false] {
        let mut runtime = WasmRuntime::new(RuntimeConfig {
            fuel: Some(100_000),
            fusion,
            check_stack_heights: true,
            ..RuntimeConfig::default()
        });
        let instance = instantiate(
            &mut runtime,
            r#"(module
                (func (export "spin")
                    (loop $l (br_if $l (i32.const 1)))))"#,
        )
        .unwrap();
        assert_eq!(
            trap_kind(runtime.invoke(instance, "spin", &[])),
            TrapKind::OutOfFuel
        );
    }
}

#[test]
fn test_set_of_immutable_global_is_a_validation_error() {
    let mut runtime = WasmRuntime::default();
    let err = instantiate(
        &mut runtime,
        r#"(module
            (global $g i32 (i32.const 0))
            (func (export "main")
                (global.set $g (i32.const 1))))"#,
    )
    .unwrap_err();
    let Error::Validation(diagnostics) = err else {
        panic!("expected a validation error, got {:?}", err);
    };
    assert_eq!(diagnostics.len(), 1);
}

#[test]
fn test_branch_keeps_only_label_arity() {
    let mut runtime = WasmRuntime::new(RuntimeConfig {
        check_stack_heights: true,
        ..RuntimeConfig::default()
    });
    let instance = instantiate(
        &mut runtime,
        r#"(module
            (func (export "main") (result i32 i32)
                (block (result i32 i32)
                    i32.const 1
                    i32.const 2
                    i32.const 3
                    i32.const 4
                    br 0)))"#,
    )
    .unwrap();
    assert_eq!(
        runtime.invoke(instance, "main", &[]).unwrap(),
        vec![Value::I32(3), Value::I32(4)]
    );
}

#[test]
fn test_runtime_heights_match_validation() {
    // Every op is checked against the validator's heights; a mismatch would
    // surface as an internal trap.
    let source = r#"(module
        (memory 1)
        (func $fib (export "fib") (param i64) (result i64)
            (local i64 i64)
            (local.set 2 (i64.const 1))
            (block $done
                (loop $next
                    (br_if $done (i64.eqz (local.get 0)))
                    (local.get 1)
                    (local.set 1 (local.get 2))
                    (local.set 2 (i64.add (local.get 2)))
                    (local.set 0 (i64.sub (local.get 0) (i64.const 1)))
                    (br $next)))
            (local.get 1))
        (func (export "switch") (param i32) (result i32)
            (block $c (block $b (block $a
                (br_table $a $b $c (local.get 0)))
                (return (i32.const 10)))
                (return (i32.const 20)))
            (i32.const 30))
        (func (export "store_sum") (param i32) (result i32)
            (local i32)
            (loop $l
                (i32.store (i32.mul (local.get 0) (i32.const 4)) (local.get 0))
                (local.set 1 (i32.add (local.get 1)
                    (i32.load (i32.mul (local.get 0) (i32.const 4)))))
                (local.tee 0 (i32.sub (local.get 0) (i32.const 1)))
                (br_if $l))
            (local.get 1)))"#;

    for fusion in [true, false] {
        let mut runtime = WasmRuntime::new(RuntimeConfig {
            fusion,
            check_stack_heights: true,
            ..RuntimeConfig::default()
        });
        let instance = instantiate(&mut runtime, source).unwrap();
        assert_eq!(
            runtime.invoke(instance, "fib", &[Value::I64(50)]).unwrap(),
            vec![Value::I64(12_586_269_025)]
        );
        for (arg, expected) in [(0, 10), (1, 20), (2, 30), (99, 30)] {
            assert_eq!(
                runtime
                    .invoke(instance, "switch", &[Value::I32(arg)])
                    .unwrap(),
                vec![Value::I32(expected)]
            );
        }
        assert_eq!(
            runtime
                .invoke(instance, "store_sum", &[Value::I32(100)])
                .unwrap(),
            vec![Value::I32(5050)]
        );
    }
}
