//! Tests for function pointer invocation and rebinding.

use std::rc::Rc;

use hsvm_core::VariableType;
use hsvm_vm::{FptrParam, FunctionPtr, FunctionSpec, LibraryBuilder, LibraryId, Opcode, RebindRequest, Value, VmId, rebind};
use proptest::prelude::*;

use super::{Fixture, as_int, int};

fn ints(values: &[i64]) -> Value {
    Value::array(VariableType::Integer, values.iter().map(|&v| Value::Integer(v)).collect())
}

fn bools(values: &[bool]) -> Value {
    Value::array(VariableType::Boolean, values.iter().map(|&v| Value::Boolean(v)).collect())
}

/// Emit a rebind of the pointer on top of the stack.
fn emit_rebind(c: &mut hsvm_vm::CodeBuilder<'_>, passthrough: &[i64], mask: &[bool], bound: &[i64]) {
    c.load_const(ints(passthrough))
        .load_const(bools(mask))
        .load_const(Value::array(
            VariableType::Variant,
            bound.iter().map(|&v| Value::Integer(v)).collect(),
        ))
        .load_int(0)
        .load_bool(false)
        .rebind_fptr();
}

fn library() -> (LibraryBuilder, u32, u32) {
    let mut lib = LibraryBuilder::new("fptr");
    let sub = lib.function(
        FunctionSpec::new("SUB")
            .param("a", VariableType::Integer)
            .param("b", VariableType::Integer)
            .returns(VariableType::Integer),
        |c| {
            c.load_local(0).load_local(1).op(Opcode::Sub).ret();
        },
    );
    let rest = lib.function(
        FunctionSpec::new("REST")
            .param("first", VariableType::Integer)
            .vararg("rest", VariableType::IntegerArray)
            .returns(VariableType::IntegerArray),
        |c| {
            c.load_local(1).ret();
        },
    );
    lib.function(FunctionSpec::new("SWAPPED").returns(VariableType::Integer), |c| {
        c.make_fptr(sub);
        emit_rebind(c, &[2, 1], &[], &[]);
        c.load_int(10).load_int(3).invoke_fptr(2).ret();
    });
    lib.function(FunctionSpec::new("BOUND").returns(VariableType::Integer), |c| {
        c.make_fptr(sub);
        emit_rebind(c, &[0, 1], &[true, false], &[100, 0]);
        c.load_int(5).invoke_fptr(1).ret();
    });
    lib.function(FunctionSpec::new("MISORDERED").returns(VariableType::Integer), |c| {
        c.make_fptr(sub);
        emit_rebind(c, &[-1, 2], &[true, false], &[7, 0]);
        c.load_int(1).load_int(2).invoke_fptr(2).ret();
    });
    lib.function(FunctionSpec::new("OVERSIZED").returns(VariableType::Integer), |c| {
        c.make_fptr(sub);
        emit_rebind(c, &[4_294_967_297, 2], &[], &[]);
        c.load_int(1).load_int(2).invoke_fptr(2).ret();
    });
    lib.function(FunctionSpec::new("LARGEST").returns(VariableType::Integer), |c| {
        c.make_fptr(sub);
        emit_rebind(c, &[i64::from(i32::MAX), 2], &[], &[]);
        c.load_int(1).load_int(2).invoke_fptr(2).ret();
    });
    lib.function(
        FunctionSpec::new("DEFAULT_PTR")
            .locals(&[VariableType::FunctionPtr])
            .returns(VariableType::Integer),
        |c| {
            c.load_local(0).invoke_fptr(0).ret();
        },
    );
    lib.function(
        FunctionSpec::new("CALL2")
            .param("f", VariableType::FunctionPtr)
            .param("x", VariableType::Integer)
            .param("y", VariableType::Integer)
            .returns(VariableType::Variant),
        |c| {
            c.load_local(0).load_local(1).load_local(2).invoke_fptr(2).ret();
        },
    );
    (lib, sub, rest)
}

#[test]
fn rebind_swaps_arguments() {
    let (lib, _, _) = library();
    let mut fx = Fixture::new(lib);
    assert_eq!(as_int(fx.call("swapped", Vec::new())), 3 - 10);
    fx.assert_balanced();
}

#[test]
fn rebind_binds_values() {
    let (lib, _, _) = library();
    let mut fx = Fixture::new(lib);
    assert_eq!(as_int(fx.call("bound", Vec::new())), 95);
}

#[test]
fn optional_before_required_is_rejected() {
    let (lib, _, _) = library();
    let mut fx = Fixture::new(lib);
    let (_, message) = fx.uncaught("misordered", Vec::new());
    assert_eq!(
        message,
        "Parameter 2 cannot follow an optional parameter (calling FUNCTION SUB(INTEGER a, INTEGER b) RETURNS INTEGER)"
    );
    fx.assert_balanced();
}

#[test]
fn out_of_range_sources_are_rejected() {
    let (lib, _, _) = library();
    let mut fx = Fixture::new(lib);
    let (_, message) = fx.uncaught("oversized", Vec::new());
    assert_eq!(
        message,
        "Too many arguments: at most 2147483646 expected, got 4294967297 (calling FUNCTION SUB(INTEGER a, INTEGER b) RETURNS INTEGER)"
    );
    let (_, message) = fx.uncaught("largest", Vec::new());
    assert_eq!(
        message,
        "Too many arguments: at most 2147483646 expected, got 2147483647 (calling FUNCTION SUB(INTEGER a, INTEGER b) RETURNS INTEGER)"
    );
    fx.assert_balanced();
}

#[test]
fn default_pointer_cannot_be_called() {
    let (lib, _, _) = library();
    let mut fx = Fixture::new(lib);
    let (_, message) = fx.uncaught("default_ptr", Vec::new());
    assert_eq!(message, "Cannot call a default function pointer");
}

#[test]
fn host_rebind_names_the_target() {
    let (lib, sub, _) = library();
    let fx = Fixture::new(lib);
    let ptr = fx.vm().make_function_ptr(&fx.library, sub).unwrap();
    let request = RebindRequest {
        passthrough: vec![0, 1],
        ..RebindRequest::default()
    };
    let err = fx.vm().rebind(&ptr, &request).unwrap_err();
    assert_eq!(
        err.to_string(),
        "Parameter 1 is neither passed through nor bound (calling FUNCTION SUB(INTEGER a, INTEGER b) RETURNS INTEGER)"
    );
}

#[test]
fn overflow_positions_become_parameters() {
    let (lib, _, rest) = library();
    let mut fx = Fixture::new(lib);
    let ptr = fx.vm().make_function_ptr(&fx.library, rest).unwrap();
    assert_eq!(ptr.vararg, Some(VariableType::Integer));

    let request = RebindRequest {
        passthrough: vec![1, 0, 2],
        bound: vec![None, Some(int(50)), None],
        first_unused_source: None,
        keep_vararg: false,
    };
    let rebound = fx.vm().rebind(&ptr, &request).unwrap();
    assert_eq!(rebound.params.len(), 3);
    assert_eq!(rebound.vararg, None);

    let result = fx.call("call2", vec![Value::FunctionPtr(Some(Rc::new(rebound))), int(1), int(9)]);
    assert_eq!(result, Some(ints(&[50, 9])));
}

#[test]
fn pointer_argument_count_is_checked() {
    let (lib, sub, _) = library();
    let mut fx = Fixture::new(lib);
    let ptr = fx.vm().make_function_ptr(&fx.library, sub).unwrap();
    let request = RebindRequest {
        passthrough: vec![1, 0],
        bound: vec![None, Some(int(1))],
        ..RebindRequest::default()
    };
    let unary = fx.vm().rebind(&ptr, &request).unwrap();
    let (_, message) = fx.uncaught("call2", vec![Value::FunctionPtr(Some(Rc::new(unary))), int(1), int(2)]);
    assert_eq!(
        message,
        "Too many arguments: at most 1 expected, got 2 (calling FUNCTION SUB(INTEGER a, INTEGER b) RETURNS INTEGER)"
    );
}

// ============================================================================
// Rebind laws
// ============================================================================

fn pointer(required: usize, optional: usize) -> FunctionPtr {
    let mut params = Vec::new();
    for i in 0..required {
        params.push(FptrParam::required(VariableType::Integer, i as i32 + 1));
    }
    for i in 0..optional {
        let position = (required + i) as i32 + 1;
        params.push(FptrParam::optional(VariableType::Integer, position, Value::Integer(-1)));
    }
    FunctionPtr {
        library: LibraryId(0),
        function: 0,
        vm: VmId(0),
        return_type: VariableType::Integer,
        vararg: None,
        first_unused_source: (required + optional) as i32 + 1,
        params,
    }
}

proptest! {
    #[test]
    fn identity_rebind_changes_nothing(required in 0usize..5, optional in 0usize..5) {
        let ptr = pointer(required, optional);
        let request = RebindRequest::identity(required + optional, false);
        prop_assert_eq!(rebind(&ptr, &request).unwrap(), ptr);
    }

    #[test]
    fn permutation_reorders_arguments(
        permutation in Just((1..=4).collect::<Vec<i32>>()).prop_shuffle(),
        args in prop::collection::vec(any::<i32>(), 4),
    ) {
        let ptr = pointer(4, 0);
        let request = RebindRequest {
            passthrough: permutation.clone(),
            ..RebindRequest::default()
        };
        let rebound = rebind(&ptr, &request).unwrap();
        let values: Vec<Value> = args.iter().map(|&v| Value::Integer(i64::from(v))).collect();
        let resolved = rebound.resolve_arguments(&values).unwrap();
        for (i, &source) in permutation.iter().enumerate() {
            prop_assert_eq!(&resolved[i], &values[source as usize - 1]);
        }
    }

    #[test]
    fn omitted_optional_arguments_use_fallbacks(given in 0usize..3) {
        let ptr = pointer(0, 2);
        let values: Vec<Value> = (0..given as i64).map(Value::Integer).collect();
        let resolved = ptr.resolve_arguments(&values).unwrap();
        prop_assert_eq!(resolved.len(), 2);
        for (i, value) in resolved.iter().enumerate() {
            let expected = if i < given { Value::Integer(i as i64) } else { Value::Integer(-1) };
            prop_assert_eq!(value, &expected);
        }
    }
}
