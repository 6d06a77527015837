//! Tests for the generator state machine.

use std::cell::RefCell;
use std::rc::Rc;

use hsvm_core::VariableType;
use hsvm_vm::{Builtin, FunctionSpec, GeneratorState, LibraryBuilder, ResumeKind, Value, VmError};

use super::{Fixture, int};

/// COUNTER yields 1 and 2, then returns 3. Each resume kind gets a driver
/// taking the generator and the value to send.
fn counter() -> LibraryBuilder {
    let mut lib = LibraryBuilder::new("gen");
    lib.function(
        FunctionSpec::new("COUNTER")
            .generator()
            .locals(&[VariableType::Object])
            .returns(VariableType::Object),
        |c| {
            c.gen_init(0);
            c.load_int(1).gen_yield(0).discard();
            c.load_int(2).gen_yield(0).discard();
            c.load_int(3).ret();
        },
    );
    lib.function(
        FunctionSpec::new("ECHO")
            .generator()
            .locals(&[VariableType::Object])
            .returns(VariableType::Object),
        |c| {
            c.gen_init_suspended(0);
            c.ret();
        },
    );
    lib.function(
        FunctionSpec::new("SELFISH")
            .generator()
            .locals(&[VariableType::Object])
            .returns(VariableType::Object),
        |c| {
            c.gen_init(0);
            c.load_local(0).load_int(0).gen_resume(ResumeKind::Next).ret();
        },
    );
    for (name, kind) in [
        ("NEXT", ResumeKind::Next),
        ("THROWIN", ResumeKind::Throw),
        ("FINISH", ResumeKind::Return),
    ] {
        lib.function(
            FunctionSpec::new(name)
                .param("g", VariableType::Object)
                .param_default("v", VariableType::Variant, Value::Integer(0))
                .returns(VariableType::Record),
            |c| {
                c.load_local(0).load_local(1).gen_resume(kind).ret();
            },
        );
    }
    lib
}

/// `(done, value)` of a generator result record.
fn step(fx: &mut Fixture, driver: &str, generator: &Value, sent: Value) -> (bool, Value) {
    let record = fx.call(driver, vec![generator.clone(), sent]).unwrap();
    let done = record.cell(fx.name("done")).and_then(Value::as_bool).unwrap();
    let value = record.cell(fx.name("value")).cloned().unwrap();
    (done, value)
}

#[test]
fn yields_then_completes() {
    let mut fx = Fixture::new(counter());
    let generator = fx.call("counter", Vec::new()).unwrap();
    assert_eq!(fx.vm().generator_state(&generator), GeneratorState::SuspendedStart);

    assert_eq!(step(&mut fx, "next", &generator, int(0)), (false, int(1)));
    assert_eq!(fx.vm().generator_state(&generator), GeneratorState::SuspendedYield);
    assert_eq!(step(&mut fx, "next", &generator, int(0)), (false, int(2)));
    assert_eq!(step(&mut fx, "next", &generator, int(0)), (true, int(3)));
    assert_eq!(fx.vm().generator_state(&generator), GeneratorState::Completed);

    // A completed generator keeps answering with its final result.
    assert_eq!(step(&mut fx, "next", &generator, int(0)), (true, int(3)));
    fx.assert_balanced();
}

/// TIDY yields 1, hands whatever its yield receives to the host, then yields 2.
fn tidy() -> (Fixture, Rc<RefCell<Vec<Value>>>) {
    let mut lib = counter();
    let note = lib.external(
        FunctionSpec::new("NOTE").param("v", VariableType::Variant),
        "note",
    );
    lib.function(
        FunctionSpec::new("TIDY")
            .generator()
            .locals(&[VariableType::Object])
            .returns(VariableType::Object),
        |c| {
            c.gen_init(0);
            c.load_int(1).gen_yield(0).call(note, 1);
            c.load_int(2).gen_yield(0).discard();
            c.load_int(3).ret();
        },
    );
    let fx = Fixture::new(lib);
    let notes = Rc::new(RefCell::new(Vec::new()));
    let sink = notes.clone();
    fx.group.register_builtin(
        "note",
        Builtin::macro_fn(move |args| {
            sink.borrow_mut().extend(args.iter().cloned());
            Ok(())
        }),
    );
    (fx, notes)
}

#[test]
fn return_runs_the_body_before_completing() {
    let (mut fx, notes) = tidy();
    let generator = fx.call("tidy", Vec::new()).unwrap();
    assert_eq!(step(&mut fx, "next", &generator, int(0)), (false, int(1)));

    // The body sees the value at its pending yield, runs on to the next
    // yield and the generator completes with the returned value.
    assert_eq!(step(&mut fx, "finish", &generator, int(99)), (true, int(99)));
    assert_eq!(*notes.borrow(), vec![int(99)]);
    assert_eq!(fx.vm().generator_state(&generator), GeneratorState::Completed);
    assert_eq!(step(&mut fx, "next", &generator, int(0)), (true, int(99)));
    fx.assert_balanced();
}

#[test]
fn next_after_yield_keeps_running() {
    let (mut fx, notes) = tidy();
    let generator = fx.call("tidy", Vec::new()).unwrap();
    step(&mut fx, "next", &generator, int(0));
    assert_eq!(step(&mut fx, "next", &generator, int(7)), (false, int(2)));
    assert_eq!(*notes.borrow(), vec![int(7)]);
    assert_eq!(step(&mut fx, "next", &generator, int(0)), (true, int(3)));
}

#[test]
fn return_on_completed_generator_overwrites_value() {
    let mut fx = Fixture::new(counter());
    let generator = fx.call("counter", Vec::new()).unwrap();
    for _ in 0..3 {
        step(&mut fx, "next", &generator, int(0));
    }
    assert_eq!(step(&mut fx, "finish", &generator, int(5)), (true, int(5)));
}

#[test]
fn throw_or_return_before_start_completes_empty() {
    for driver in ["throwin", "finish"] {
        let mut fx = Fixture::new(counter());
        let generator = fx.call("counter", Vec::new()).unwrap();
        assert_eq!(
            step(&mut fx, driver, &generator, Value::string("ignored")),
            (true, Value::empty_record())
        );
        assert_eq!(fx.vm().generator_state(&generator), GeneratorState::Completed);
        fx.assert_balanced();
    }
}

#[test]
fn throw_into_suspended_generator_propagates_to_resumer() {
    let mut fx = Fixture::new(counter());
    let generator = fx.call("counter", Vec::new()).unwrap();
    step(&mut fx, "next", &generator, int(0));

    let (name, message) = fx.uncaught("throwin", vec![generator.clone(), Value::string("stop")]);
    assert_eq!((name.as_str(), message.as_str()), ("STRING", "stop"));
    assert_eq!(fx.vm().generator_state(&generator), GeneratorState::Completed);
    assert_eq!(step(&mut fx, "next", &generator, int(0)), (true, Value::empty_record()));
    fx.assert_balanced();
}

#[test]
fn throw_into_completed_generator_raises_in_resumer() {
    let mut fx = Fixture::new(counter());
    let generator = fx.call("counter", Vec::new()).unwrap();
    step(&mut fx, "finish", &generator, int(1));
    let (name, _) = fx.uncaught("throwin", vec![generator, Value::string("late")]);
    assert_eq!(name, "STRING");
}

#[test]
fn pre_suspended_generator_receives_first_value() {
    let mut fx = Fixture::new(counter());
    let generator = fx.call("echo", Vec::new()).unwrap();
    assert_eq!(fx.vm().generator_state(&generator), GeneratorState::SuspendedYield);
    assert_eq!(step(&mut fx, "next", &generator, int(17)), (true, int(17)));
}

#[test]
fn resuming_an_executing_generator_is_fatal() {
    let mut fx = Fixture::new(counter());
    let generator = fx.call("selfish", Vec::new()).unwrap();
    let err = fx.call_err("next", vec![generator]);
    assert!(matches!(err, VmError::GeneratorReentered), "{}", err);
    fx.assert_balanced();
}

#[test]
fn resuming_a_plain_object_raises() {
    let mut lib = counter();
    lib.function(FunctionSpec::new("PLAIN").returns(VariableType::Record), |c| {
        c.obj_new().load_int(0).gen_resume(ResumeKind::Next).ret();
    });
    let mut fx = Fixture::new(lib);
    let (_, message) = fx.uncaught("plain", Vec::new());
    assert_eq!(message, "Object is not a generator");
    assert_eq!(fx.vm().generator_state(&int(1)), GeneratorState::NotAGenerator);
}
