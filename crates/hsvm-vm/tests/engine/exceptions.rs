//! Tests for exception throwing, unwinding and traces.

use hsvm_core::{SourcePosition, VariableType};
use hsvm_vm::{FunctionSpec, LibraryBuilder, Opcode, Value, VmError};

use super::{Fixture, as_int, int};

/// MAIN -> B -> C, where C divides by its argument.
fn three_levels(skip_c: bool) -> LibraryBuilder {
    let mut lib = LibraryBuilder::new("unwind");
    let mut spec = FunctionSpec::new("C").param("x", VariableType::Integer).returns(VariableType::Integer);
    if skip_c {
        spec = spec.skip_trace();
    }
    let divide = lib.function(spec, |c| {
        c.position(30, 5);
        c.load_int(1).load_local(0).op(Opcode::Div).ret();
    });
    let middle = lib.function(
        FunctionSpec::new("B").param("x", VariableType::Integer).returns(VariableType::Integer),
        |c| {
            c.position(20, 3);
            c.load_int(7).discard();
            c.load_local(0).call(divide, 1).ret();
        },
    );
    // Leaves 40 on the stack, then calls B inside the protected range. The
    // handler adds 2 to whatever survived below the protected range.
    lib.function(
        FunctionSpec::new("MAIN").param("x", VariableType::Integer).returns(VariableType::Integer),
        |c| {
            let (start, end, handler) = (c.label(), c.label(), c.label());
            c.load_int(40);
            c.bind(start);
            c.load_int(5).load_local(0).call(middle, 1).op(Opcode::Add);
            c.bind(end);
            c.ret();
            c.bind(handler);
            c.discard().load_int(2).op(Opcode::Add).ret();
            c.try_catch(start, end, handler, 2);
        },
    );
    lib.function(
        FunctionSpec::new("TRACE").param("x", VariableType::Integer).returns(VariableType::RecordArray),
        |c| {
            let (start, end, handler) = (c.label(), c.label(), c.label());
            c.bind(start);
            c.load_local(0).call(middle, 1);
            c.bind(end);
            c.discard().load_const(Value::array(VariableType::Record, Vec::new())).ret();
            c.bind(handler);
            c.obj_get("trace").ret();
            c.try_catch(start, end, handler, 1);
        },
    );
    lib.function(
        FunctionSpec::new("RETHROW").param("x", VariableType::Integer).returns(VariableType::Integer),
        |c| {
            let (start, end, handler) = (c.label(), c.label(), c.label());
            c.bind(start);
            c.load_local(0).call(divide, 1);
            c.bind(end);
            c.ret();
            c.bind(handler);
            c.rethrow();
            c.try_catch(start, end, handler, 1);
        },
    );
    lib
}

fn trace_functions(fx: &Fixture, trace: &Value) -> Vec<String> {
    let function = fx.name("function");
    trace
        .as_array()
        .unwrap_or_else(|| panic!("trace is not an array: {:?}", trace))
        .iter()
        .map(|entry| entry.cell(function).and_then(Value::as_str).unwrap_or_default().to_string())
        .collect()
}

#[test]
fn normal_path_leaves_handler_unused() {
    let mut fx = Fixture::new(three_levels(false));
    assert_eq!(as_int(fx.call("main", vec![int(1)])), 6);
    fx.assert_balanced();
}

#[test]
fn catch_restores_stack_of_catching_frame() {
    let mut fx = Fixture::new(three_levels(false));
    assert_eq!(as_int(fx.call("main", vec![int(0)])), 42);
    assert!(!fx.vm().is_unwinding());
    fx.assert_balanced();
}

#[test]
fn trace_lists_frames_innermost_first() {
    let mut fx = Fixture::new(three_levels(false));
    let trace = fx.call("trace", vec![int(0)]).unwrap();
    assert_eq!(
        trace_functions(&fx, &trace),
        vec![
            "FUNCTION C(INTEGER x) RETURNS INTEGER",
            "FUNCTION B(INTEGER x) RETURNS INTEGER",
            "FUNCTION TRACE(INTEGER x) RETURNS RECORD ARRAY",
        ]
    );

    let entries = trace.as_array().unwrap();
    let (line, col, filename) = (fx.name("line"), fx.name("col"), fx.name("filename"));
    assert_eq!(entries[0].cell(line), Some(&int(30)));
    assert_eq!(entries[0].cell(col), Some(&int(5)));
    assert_eq!(entries[1].cell(line), Some(&int(20)));
    assert_eq!(entries[0].cell(filename), Some(&Value::string("unwind.whlib")));
}

#[test]
fn skip_trace_functions_are_left_out() {
    let mut fx = Fixture::new(three_levels(true));
    let trace = fx.call("trace", vec![int(0)]).unwrap();
    let functions = trace_functions(&fx, &trace);
    assert_eq!(functions.len(), 2);
    assert_eq!(functions[0], "FUNCTION B(INTEGER x) RETURNS INTEGER");
}

#[test]
fn uncaught_exception_reports_trace() {
    let mut fx = Fixture::new(three_levels(false));
    let VmError::UncaughtException { name, message, trace } = fx.call_err("b", vec![int(0)]) else {
        panic!("expected an uncaught exception");
    };
    assert_eq!(name, "EXCEPTION");
    assert_eq!(message, "Division by zero");
    let functions: Vec<_> = trace.iter().map(|e| e.function.as_str()).collect();
    assert_eq!(
        functions,
        vec![
            "FUNCTION C(INTEGER x) RETURNS INTEGER",
            "FUNCTION B(INTEGER x) RETURNS INTEGER",
        ]
    );
    assert_eq!(trace[0].position, SourcePosition::new(30, 5));
    fx.assert_balanced();
}

#[test]
fn rethrow_keeps_the_original_trace() {
    let mut fx = Fixture::new(three_levels(false));
    let VmError::UncaughtException { trace, .. } = fx.call_err("rethrow", vec![int(0)]) else {
        panic!("expected an uncaught exception");
    };
    let functions: Vec<_> = trace.iter().map(|e| e.function.as_str()).collect();
    assert_eq!(
        functions,
        vec![
            "FUNCTION C(INTEGER x) RETURNS INTEGER",
            "FUNCTION RETHROW(INTEGER x) RETURNS INTEGER",
        ]
    );
}

#[test]
fn thrown_records_are_delivered_unchanged() {
    let mut lib = LibraryBuilder::new("records");
    lib.function(FunctionSpec::new("MAIN").returns(VariableType::Integer), |c| {
        let (start, end, handler) = (c.label(), c.label(), c.label());
        c.bind(start);
        c.record_new().load_int(9).record_set("payload").throw();
        c.bind(end);
        c.load_int(0).ret();
        c.bind(handler);
        c.record_get("payload").ret();
        c.try_catch(start, end, handler, 0);
    });
    let mut fx = Fixture::new(lib);
    assert_eq!(as_int(fx.call("main", Vec::new())), 9);
    fx.assert_balanced();
}
