//! Tests for object types, member resolution and type extension.

use std::rc::Rc;

use hsvm_core::VariableType;
use hsvm_vm::{
    CodeBuilder, EntryKind, FragmentSpec, FunctionSpec, LibraryBuilder, ObjectData, ObjectTypeDef, Opcode, Value,
    VTableEntry,
};

use super::{Fixture, as_int, int};

/// POINT has members X and Y, a private SECRET, a method SUM, a property
/// TOTAL reading through SUM and a property PX writing through SETX.
fn points() -> LibraryBuilder {
    let mut lib = LibraryBuilder::new("points");
    let sum = lib.function(
        FunctionSpec::new("POINT_SUM").param("this", VariableType::Object).returns(VariableType::Integer),
        |c| {
            c.load_local(0).this_get("x");
            c.load_local(0).this_get("y");
            c.op(Opcode::Add).ret();
        },
    );
    let set_x = lib.function(
        FunctionSpec::new("POINT_SETX")
            .param("this", VariableType::Object)
            .param("value", VariableType::Integer)
            .returns(VariableType::Integer),
        |c| {
            c.load_local(0).load_local(1).this_set("x");
            c.load_int(99).ret();
        },
    );
    let scale = lib.function(
        FunctionSpec::new("POINT_SCALE")
            .param("this", VariableType::Object)
            .param_default("factor", VariableType::Integer, Value::Integer(2))
            .returns(VariableType::Integer),
        |c| {
            c.load_local(0).obj_call("sum", 0).load_local(1).op(Opcode::Mul).ret();
        },
    );
    let reveal = lib.function(
        FunctionSpec::new("POINT_REVEAL").param("this", VariableType::Object).returns(VariableType::Integer),
        |c| {
            c.load_local(0).this_get("secret").ret();
        },
    );
    let point = lib.fragment(
        FragmentSpec::new("POINT")
            .member("x", VariableType::Integer)
            .member("y", VariableType::Integer)
            .member("secret", VariableType::Integer)
            .private()
            .method("sum", sum)
            .method("setx", set_x)
            .method("scale", scale)
            .method("reveal", reveal)
            .property("total", Some("sum"), None)
            .property("px", Some("x"), Some("setx")),
    );

    lib.function(
        FunctionSpec::new("TOTAL").locals(&[VariableType::Object]).returns(VariableType::Integer),
        |c| {
            make(c, point);
            c.load_local(0).obj_get("total").ret();
        },
    );
    lib.function(
        FunctionSpec::new("SETTER").locals(&[VariableType::Object]).returns(VariableType::Integer),
        |c| {
            make(c, point);
            c.load_local(0).load_int(10).obj_set("px");
            c.load_local(0).obj_get("x").ret();
        },
    );
    lib.function(
        FunctionSpec::new("METHOD").locals(&[VariableType::Object]).returns(VariableType::Integer),
        |c| {
            make(c, point);
            c.load_local(0).obj_call("scale", 0);
            c.load_local(0).load_int(10).obj_call("scale", 1);
            c.op(Opcode::Add).ret();
        },
    );
    lib.function(
        FunctionSpec::new("PRIVATE").locals(&[VariableType::Object]).returns(VariableType::Integer),
        |c| {
            make(c, point);
            c.load_local(0).obj_get("secret").ret();
        },
    );
    lib.function(
        FunctionSpec::new("REVEAL").locals(&[VariableType::Object]).returns(VariableType::Integer),
        |c| {
            make(c, point);
            c.load_local(0).obj_call("reveal", 0).ret();
        },
    );
    lib.function(
        FunctionSpec::new("METHOD_AS_VALUE").locals(&[VariableType::Object]).returns(VariableType::Variant),
        |c| {
            make(c, point);
            c.load_local(0).obj_get("sum").ret();
        },
    );
    lib.function(
        FunctionSpec::new("TWO_POINTS").returns(VariableType::Boolean),
        |c| {
            c.obj_new_typed(point).discard();
            c.obj_new_typed(point).discard();
            c.load_bool(true).ret();
        },
    );
    lib
}

/// Builds a point (3, 4) in local 0.
fn make(c: &mut CodeBuilder<'_>, point: i32) {
    c.obj_new_typed(point).store_local(0);
    c.load_local(0).load_int(3).obj_set("x");
    c.load_local(0).load_int(4).obj_set("y");
}

#[test]
fn property_reads_through_getter_method() {
    let mut fx = Fixture::new(points());
    assert_eq!(as_int(fx.call("total", Vec::new())), 7);
    fx.assert_balanced();
}

#[test]
fn setter_result_is_discarded() {
    let mut fx = Fixture::new(points());
    assert_eq!(as_int(fx.call("setter", Vec::new())), 10);
    fx.assert_balanced();
}

#[test]
fn methods_receive_the_object_and_defaults() {
    let mut fx = Fixture::new(points());
    assert_eq!(as_int(fx.call("method", Vec::new())), 7 * 2 + 7 * 10);
    fx.assert_balanced();
}

#[test]
fn private_members_are_hidden_from_outside() {
    let mut fx = Fixture::new(points());
    let (_, message) = fx.uncaught("private", Vec::new());
    assert_eq!(message, "Member SECRET is private");
    assert_eq!(as_int(fx.call("reveal", Vec::new())), 0);
}

#[test]
fn methods_are_not_values() {
    let mut fx = Fixture::new(points());
    let (_, message) = fx.uncaught("method_as_value", Vec::new());
    assert_eq!(message, "Method SUM cannot be used as a value");
}

#[test]
fn type_extension_is_memoized() {
    let mut fx = Fixture::new(points());
    fx.call("two_points", Vec::new());
    fx.call("two_points", Vec::new());
    assert_eq!(fx.group.type_count(), 1);
}

// ============================================================================
// Extension and overrides
// ============================================================================

fn override_library(update_params: usize) -> LibraryBuilder {
    let mut lib = LibraryBuilder::new("override");
    let base_run = lib.function(
        FunctionSpec::new("BASE_RUN")
            .param("this", VariableType::Object)
            .param("a", VariableType::Integer)
            .returns(VariableType::Integer),
        |c| {
            c.load_local(1).ret();
        },
    );
    let mut spec = FunctionSpec::new("DERIVED_RUN").param("this", VariableType::Object);
    if update_params > 1 {
        spec = spec.param("a", VariableType::Integer);
    }
    if update_params > 2 {
        spec = spec.param_default("b", VariableType::Integer, Value::Integer(100));
    }
    let derived_run = lib.function(spec.returns(VariableType::Integer), |c| {
        c.load_local(0).obj_get("base").ret();
    });
    let base = lib.fragment(
        FragmentSpec::new("BASE")
            .member("base", VariableType::Integer)
            .method("run", base_run),
    );
    let derived = lib.fragment(FragmentSpec::new("DERIVED").method("run", derived_run).update());
    lib.function(
        FunctionSpec::new("MAIN").locals(&[VariableType::Object]).returns(VariableType::Integer),
        |c| {
            c.obj_new_typed(base).store_local(0);
            c.load_local(0).load_int(5).obj_set("base");
            c.load_local(0).obj_extend(derived);
            c.load_local(0).load_int(1).obj_call("run", 1).ret();
        },
    );
    lib
}

#[test]
fn compatible_override_replaces_method() {
    let mut fx = Fixture::new(override_library(3));
    assert_eq!(as_int(fx.call("main", Vec::new())), 5);
    assert_eq!(fx.group.type_count(), 2);
    fx.assert_balanced();
}

#[test]
fn override_dropping_parameters_is_rejected() {
    let mut fx = Fixture::new(override_library(1));
    let (_, message) = fx.uncaught("main", Vec::new());
    assert_eq!(message, "Incompatible override of member RUN: parameter count drops from 2 to 1");
}

#[test]
fn update_without_base_member_is_rejected() {
    let mut lib = LibraryBuilder::new("orphan");
    let f = lib.function(
        FunctionSpec::new("F").param("this", VariableType::Object),
        |c| {
            c.ret();
        },
    );
    let orphan = lib.fragment(FragmentSpec::new("ORPHAN").method("run", f).update());
    lib.function(FunctionSpec::new("MAIN"), |c| {
        c.obj_new_typed(orphan).discard().ret();
    });
    let mut fx = Fixture::new(lib);
    let (_, message) = fx.uncaught("main", Vec::new());
    assert_eq!(message, "Member RUN is marked as an update but does not exist");
}

// ============================================================================
// Dynamic members and the catch-all
// ============================================================================

fn dynamic() -> LibraryBuilder {
    let mut lib = LibraryBuilder::new("dynamic");
    let any = lib.function(
        FunctionSpec::new("ANY_GET")
            .param("this", VariableType::Object)
            .param("name", VariableType::String)
            .returns(VariableType::String),
        |c| {
            c.load_local(1).load_const(Value::string("?")).op(Opcode::Concat).ret();
        },
    );
    let proxy = lib.fragment(
        FragmentSpec::new("PROXY")
            .static_type()
            .method("anyget", any)
            .property("^", Some("anyget"), None),
    );
    lib.function(FunctionSpec::new("CATCHALL").returns(VariableType::String), |c| {
        c.obj_new_typed(proxy).obj_get("whatever").ret();
    });
    lib.function(
        FunctionSpec::new("STATIC_INSERT").locals(&[VariableType::Object]),
        |c| {
            c.obj_new_typed(proxy).store_local(0);
            c.load_local(0).load_int(1).obj_insert("extra").ret();
        },
    );
    lib.function(
        FunctionSpec::new("CARET_INSERT").locals(&[VariableType::Object]).returns(VariableType::Integer),
        |c| {
            c.obj_new_typed(proxy).store_local(0);
            c.load_local(0).load_int(8).obj_insert("^extra");
            c.load_local(0).obj_get("^extra");
            c.load_local(0).obj_delete("^extra");
            c.ret();
        },
    );
    lib.function(
        FunctionSpec::new("PLAIN").locals(&[VariableType::Object]).returns(VariableType::Integer),
        |c| {
            c.obj_new().store_local(0);
            c.load_local(0).load_int(4).obj_insert("n");
            c.load_local(0).load_int(6).obj_set("n");
            c.load_local(0).obj_get("n");
            c.load_local(0).obj_delete("n");
            c.ret();
        },
    );
    lib.function(
        FunctionSpec::new("DELETED").locals(&[VariableType::Object]).returns(VariableType::Integer),
        |c| {
            c.obj_new().store_local(0);
            c.load_local(0).load_int(4).obj_insert("n");
            c.load_local(0).obj_delete("n");
            c.load_local(0).obj_get("n").ret();
        },
    );
    lib.function(
        FunctionSpec::new("DEFAULT_OBJECT").locals(&[VariableType::Object]).returns(VariableType::Integer),
        |c| {
            c.load_local(0).obj_get("n").ret();
        },
    );
    lib
}

#[test]
fn catch_all_getter_receives_the_name() {
    let mut fx = Fixture::new(dynamic());
    assert_eq!(fx.call("catchall", Vec::new()), Some(Value::string("WHATEVER?")));
    fx.assert_balanced();
}

#[test]
fn static_objects_reject_inserts() {
    let mut fx = Fixture::new(dynamic());
    let (_, message) = fx.uncaught("static_insert", Vec::new());
    assert_eq!(message, "Cannot insert member EXTRA into a static object");
}

#[test]
fn caret_members_bypass_static_and_catch_all() {
    let mut fx = Fixture::new(dynamic());
    assert_eq!(as_int(fx.call("caret_insert", Vec::new())), 8);
    fx.assert_balanced();
}

#[test]
fn dynamic_members_insert_set_and_delete() {
    let mut fx = Fixture::new(dynamic());
    assert_eq!(fx.call("plain", Vec::new()), Some(int(6)));
    let (_, message) = fx.uncaught("deleted", Vec::new());
    assert_eq!(message, "Object has no member named N");
}

#[test]
fn default_object_has_no_members() {
    let mut fx = Fixture::new(dynamic());
    let (_, message) = fx.uncaught("default_object", Vec::new());
    assert_eq!(message, "Object has no member named N");
}

// ============================================================================
// Host-built types
// ============================================================================

fn accessors() -> LibraryBuilder {
    let mut lib = LibraryBuilder::new("accessors");
    lib.function(
        FunctionSpec::new("READ").param("o", VariableType::Object).returns(VariableType::Integer),
        |c| {
            c.load_local(0).obj_get("prop").ret();
        },
    );
    lib.function(
        FunctionSpec::new("INVOKE").param("o", VariableType::Object).returns(VariableType::Integer),
        |c| {
            c.load_local(0).obj_call("prop", 0).ret();
        },
    );
    lib
}

/// PROP reads through INNER, which is itself a property of X.
fn chained_property(fx: &Fixture) -> Value {
    let x = fx.name("x");
    let inner = fx.name("inner");
    let prop = fx.name("prop");
    let mut def = ObjectTypeDef::with_members("CHAINED", &[(x, VariableType::Integer)], false);
    for (name, target) in [(inner, x), (prop, inner)] {
        let entry = VTableEntry {
            name,
            private: false,
            kind: EntryKind::Property {
                getter: Some(target),
                setter: None,
            },
        };
        def.entries.insert(name, entry);
    }
    Value::object(ObjectData::new(Some(Rc::new(def))))
}

#[test]
fn property_through_property_is_rejected() {
    let mut fx = Fixture::new(accessors());
    let object = chained_property(&fx);
    let (_, message) = fx.uncaught("read", vec![object.clone()]);
    assert_eq!(message, "Property PROP refers to INNER, which is not a member or method");
    let (_, message) = fx.uncaught("invoke", vec![object]);
    assert_eq!(message, "Property PROP refers to INNER, which is not a member or method");
}
