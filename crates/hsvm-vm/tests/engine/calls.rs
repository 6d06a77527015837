//! Tests for the call protocol: argument binding, nested calls and host call-ins.

use std::cell::RefCell;
use std::rc::Rc;

use hsvm_core::VariableType;
use hsvm_vm::{
    Builtin, FunctionSpec, LibraryBuilder, Opcode, RunOptions, RunResult, SyncCall, Value, VmConfig, VmError,
    VmGroup,
};

use super::{Fixture, as_int, int};

fn arithmetic() -> LibraryBuilder {
    let mut lib = LibraryBuilder::new("arith");
    let add = lib.function(
        FunctionSpec::new("ADD")
            .param("a", VariableType::Integer)
            .param("b", VariableType::Integer)
            .returns(VariableType::Integer),
        |c| {
            c.load_local(0).load_local(1).op(Opcode::Add).ret();
        },
    );
    let twice = lib.function(
        FunctionSpec::new("TWICE").param("x", VariableType::Integer).returns(VariableType::Integer),
        |c| {
            c.load_local(0).load_local(0).call(add, 2).ret();
        },
    );
    lib.function(
        FunctionSpec::new("QUAD")
            .param("x", VariableType::Integer)
            .locals(&[VariableType::Integer])
            .returns(VariableType::Integer),
        |c| {
            c.load_local(0).call(twice, 1).store_local(1);
            c.load_local(1).call(twice, 1).ret();
        },
    );
    lib
}

// ============================================================================
// Nested calls
// ============================================================================

#[test]
fn nested_calls_return_through_every_frame() {
    let mut fx = Fixture::new(arithmetic());
    assert_eq!(as_int(fx.call("quad", vec![int(3)])), 12);
    fx.assert_balanced();
}

#[test]
fn repeated_host_calls_reuse_the_vm() {
    let mut fx = Fixture::new(arithmetic());
    for i in 0..5 {
        assert_eq!(as_int(fx.call("twice", vec![int(i)])), 2 * i);
    }
    fx.assert_balanced();
}

#[test]
fn arguments_are_cast_to_parameter_types() {
    let mut lib = LibraryBuilder::new("cast");
    lib.function(
        FunctionSpec::new("ID").param("x", VariableType::Float).returns(VariableType::Float),
        |c| {
            c.load_local(0).ret();
        },
    );
    let mut fx = Fixture::new(lib);
    assert_eq!(fx.call("id", vec![int(2)]), Some(Value::Float(2.0)));

    let (name, message) = fx.uncaught("id", vec![Value::string("two")]);
    assert_eq!(name, "EXCEPTION");
    assert_eq!(
        message,
        "Cannot convert a value of type STRING to FLOAT (calling FUNCTION ID(FLOAT x) RETURNS FLOAT)"
    );
    fx.assert_balanced();
}

#[test]
fn too_few_arguments_in_a_nested_call() {
    let mut lib = LibraryBuilder::new("arity");
    let add = lib.function(
        FunctionSpec::new("ADD")
            .param("a", VariableType::Integer)
            .param("b", VariableType::Integer)
            .returns(VariableType::Integer),
        |c| {
            c.load_local(0).load_local(1).op(Opcode::Add).ret();
        },
    );
    lib.function(FunctionSpec::new("MAIN").returns(VariableType::Integer), |c| {
        c.load_int(1).call(add, 1).ret();
    });
    let mut fx = Fixture::new(lib);
    let (_, message) = fx.uncaught("main", Vec::new());
    assert_eq!(
        message,
        "Too few arguments: argument 2 is required (calling FUNCTION ADD(INTEGER a, INTEGER b) RETURNS INTEGER)"
    );
    fx.assert_balanced();
}

#[test]
fn vararg_collects_surplus_arguments() {
    let mut lib = LibraryBuilder::new("vararg");
    lib.function(
        FunctionSpec::new("REST")
            .param("first", VariableType::Integer)
            .vararg("rest", VariableType::FloatArray)
            .returns(VariableType::FloatArray),
        |c| {
            c.load_local(1).ret();
        },
    );
    let mut fx = Fixture::new(lib);
    let rest = fx.call("rest", vec![int(1), int(2), int(3)]);
    assert_eq!(
        rest,
        Some(Value::array(VariableType::Float, vec![Value::Float(2.0), Value::Float(3.0)]))
    );
    let empty = fx.call("rest", vec![int(1)]);
    assert_eq!(empty, Some(Value::array(VariableType::Float, Vec::new())));
}

#[test]
fn unknown_function_is_reported() {
    let mut fx = Fixture::new(arithmetic());
    let err = fx.call_err("missing", Vec::new());
    assert!(matches!(err, VmError::MissingFunction { function, .. } if function == "missing"));
}

#[test]
fn call_depth_limit_from_toml() {
    let mut lib = LibraryBuilder::new("deep");
    let f = lib.declare(FunctionSpec::new("RECURSE"));
    lib.define(f, |c| {
        c.call(f, 0).ret();
    });
    let config = VmConfig::from_toml_str("max_call_depth = 8").unwrap();
    let mut fx = Fixture::with_config(config, lib);
    assert!(matches!(fx.call_err("recurse", Vec::new()), VmError::CallDepthExceeded(8)));
    fx.assert_balanced();
}

// ============================================================================
// Builtins
// ============================================================================

#[test]
fn builtin_calls_back_into_script() {
    let mut lib = LibraryBuilder::new("apply");
    let apply = lib.external(
        FunctionSpec::new("APPLY")
            .param("f", VariableType::FunctionPtr)
            .param("x", VariableType::Variant)
            .returns(VariableType::Variant),
        "APPLY",
    );
    let double = lib.function(
        FunctionSpec::new("DOUBLE").param("x", VariableType::Integer).returns(VariableType::Integer),
        |c| {
            c.load_local(0).load_int(2).op(Opcode::Mul).ret();
        },
    );
    lib.function(FunctionSpec::new("MAIN").returns(VariableType::Integer), |c| {
        c.make_fptr(double).load_int(21).call(apply, 2).ret();
    });
    let mut fx = Fixture::new(lib);
    fx.group.register_builtin(
        "apply",
        Builtin::vm_function(|vm, args| match vm.invoke_sync(&args[0], vec![args[1].clone()]) {
            SyncCall::Returned(Some(value)) => Ok(value),
            _ => Ok(Value::Integer(0)),
        }),
    );
    assert_eq!(as_int(fx.call("main", Vec::new())), 42);
    fx.assert_balanced();
}

#[test]
fn builtin_error_becomes_exception() {
    let mut lib = LibraryBuilder::new("fail");
    lib.external(FunctionSpec::new("FAIL"), "FAIL");
    let mut fx = Fixture::new(lib);
    fx.group.register_builtin(
        "fail",
        Builtin::macro_fn(|_| Err(hsvm_vm::RuntimeError::custom("boom"))),
    );
    let (name, message) = fx.uncaught("fail", Vec::new());
    assert_eq!(name, "EXCEPTION");
    assert_eq!(message, "boom (calling MACRO FAIL())");
}

// ============================================================================
// Deinitializers
// ============================================================================

fn logging_library(name: &str, log: &str) -> LibraryBuilder {
    let mut lib = LibraryBuilder::new(name);
    let write = lib.external(FunctionSpec::new("LOG").param("what", VariableType::String), "LOG");
    let deinit = lib.function(FunctionSpec::new("DEINIT"), |c| {
        c.load_const(Value::string(log)).call(write, 1).ret();
    });
    lib.deinit(deinit);
    lib.function(FunctionSpec::new("MAIN"), |c| {
        c.ret();
    });
    lib
}

#[test]
fn deinitializers_run_once_newest_first() {
    let mut group = VmGroup::new(VmConfig::default());
    let vm = group.create_vm();
    let first = group.load_library(logging_library("first", "one")).unwrap();
    group.load_library(logging_library("second", "two")).unwrap();

    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = seen.clone();
    group.register_builtin(
        "log",
        Builtin::macro_fn(move |args| {
            sink.borrow_mut().push(args[0].as_str().unwrap_or_default().to_string());
            Ok(())
        }),
    );

    let options = RunOptions {
        run_deinit: true,
        ..RunOptions::default()
    };
    for _ in 0..2 {
        let result = group.call_with(vm, &first, "main", Vec::new(), options);
        assert!(matches!(result, RunResult::Finished(None)), "{:?}", result);
    }
    assert_eq!(*seen.borrow(), vec!["two".to_string(), "one".to_string()]);
}
