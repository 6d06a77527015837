//! Async stack trace chains and their weak links.

use std::rc::Rc;

use hsvm_vm::{AsyncStackTrace, FunctionSpec, LibraryBuilder, VmConfig};

use super::Fixture;

fn library() -> (LibraryBuilder, u32, u32) {
    let mut lib = LibraryBuilder::new("continuations");
    lib.function(FunctionSpec::new("MARKS"), |c| {
        for _ in 0..7 {
            c.async_mark();
        }
        c.ret();
    });
    let inner = lib.function(FunctionSpec::new("INNER"), |c| {
        c.async_mark().ret();
    });
    let outer = lib.function(FunctionSpec::new("OUTER"), |c| {
        c.call(inner, 0).ret();
    });
    (lib, inner, outer)
}

fn with_period(period: u32) -> Fixture {
    let config = VmConfig {
        async_trace_weak_period: period,
        ..VmConfig::default()
    };
    Fixture::with_config(config, library().0)
}

fn context(fx: &Fixture) -> Rc<AsyncStackTrace> {
    fx.vm().async_context().cloned().expect("no async context")
}

#[test]
fn chain_is_fully_walkable_below_the_period() {
    let mut fx = with_period(10);
    fx.call("marks", Vec::new());

    let segments = context(&fx).walk();
    let depths: Vec<u32> = segments.iter().map(|s| s.depth()).collect();
    assert_eq!(depths, vec![7, 6, 5, 4, 3, 2, 1]);
    assert!(segments.iter().all(|s| !s.is_weakly_linked()));
    assert_eq!(fx.vm().async_stack_trace().len(), 7);
}

#[test]
fn weak_links_release_older_segments() {
    let mut fx = with_period(3);
    fx.call("marks", Vec::new());

    let head = context(&fx);
    assert_eq!(head.depth(), 7);
    let segments = head.walk();
    let depths: Vec<u32> = segments.iter().map(|s| s.depth()).collect();
    assert_eq!(depths, vec![7, 6]);
    assert!(segments[1].is_weakly_linked());
    assert!(segments[1].parent().is_none());
}

#[test]
fn chains_continue_across_host_calls() {
    let mut fx = with_period(10);
    fx.call("marks", Vec::new());
    fx.call("marks", Vec::new());

    let head = context(&fx);
    assert_eq!(head.depth(), 14);
    let depths: Vec<u32> = head.walk().iter().map(|s| s.depth()).collect();
    assert_eq!(depths, vec![14, 13, 12, 11, 10]);
}

#[test]
fn segment_captures_every_live_frame() {
    let (lib, inner, outer) = library();
    let mut fx = Fixture::new(lib);
    fx.call("outer", Vec::new());

    let head = context(&fx);
    assert_eq!(head.depth(), 1);
    let functions: Vec<u32> = head.entries().iter().map(|e| e.function).collect();
    assert_eq!(functions, vec![inner, outer]);
    assert!(head.entries().iter().all(|e| e.library == fx.library.id));
}
