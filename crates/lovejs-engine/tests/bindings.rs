use std::cell::RefCell;
use std::rc::Rc;

use lovejs_engine::engine::{CallArg, Engine};
use lovejs_engine::marshal::MAX_SEQUENCE_LEN;

type Log<T> = Rc<RefCell<Vec<T>>>;

fn capture_errors(engine: &mut Engine) -> Log<String> {
    let log: Log<String> = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&log);
    engine.set_error_sink(move |message| sink.borrow_mut().push(message.to_string()));
    log
}

fn joined(log: &Log<String>) -> String {
    log.borrow().join("\n")
}

#[test]
fn imported_native_function_returns_converted_result() {
    let mut engine = Engine::new();
    let errors = capture_errors(&mut engine);
    let seen: Log<i32> = Rc::new(RefCell::new(Vec::new()));
    let add_calls: Log<()> = Rc::new(RefCell::new(Vec::new()));

    let record = Rc::clone(&seen);
    engine
        .globals_mut()
        .expect("globals")
        .func("record", move |v: i32| record.borrow_mut().push(v))
        .expect("register record");
    let counter = Rc::clone(&add_calls);
    engine
        .globals_mut()
        .expect("globals")
        .module("math")
        .expect("math module")
        .func("add", move |a: i32, b: i32| {
            counter.borrow_mut().push(());
            a + b
        })
        .expect("register add");

    engine
        .run_module(
            "main",
            "import { add } from 'math';\nrecord(add(2, 3));",
        )
        .expect("module must evaluate");

    assert_eq!(seen.borrow().as_slice(), &[5]);
    assert_eq!(add_calls.borrow().len(), 1, "native function runs exactly once");
    assert!(errors.borrow().is_empty(), "unexpected errors: {:?}", errors.borrow());
}

#[test]
fn eager_install_exposes_nested_modules_as_objects() {
    let mut engine = Engine::new();
    let errors = capture_errors(&mut engine);
    let seen: Log<Vec<f64>> = Rc::new(RefCell::new(Vec::new()));

    let record = Rc::clone(&seen);
    engine
        .globals_mut()
        .expect("globals")
        .func("record_list", move |v: Vec<f64>| record.borrow_mut().push(v))
        .expect("register record_list");
    engine
        .globals_mut()
        .expect("globals")
        .module("graphics")
        .expect("graphics")
        .module("color")
        .expect("color")
        .value("WHITE", vec![1.0f64, 1.0, 1.0, 1.0])
        .expect("register WHITE");

    // No import: the whole tree is grafted onto the global object at first
    // evaluation.
    engine
        .run_module("main", "record_list(graphics.color.WHITE);")
        .expect("module must evaluate");

    assert_eq!(seen.borrow().as_slice(), &[vec![1.0, 1.0, 1.0, 1.0]]);
    assert!(errors.borrow().is_empty(), "unexpected errors: {:?}", errors.borrow());
}

#[test]
fn module_import_exposes_child_module_constant() {
    let mut engine = Engine::new();
    let seen: Log<Vec<f64>> = Rc::new(RefCell::new(Vec::new()));

    let record = Rc::clone(&seen);
    engine
        .globals_mut()
        .expect("globals")
        .func("record_list", move |v: Vec<f64>| record.borrow_mut().push(v))
        .expect("register record_list");
    engine
        .globals_mut()
        .expect("globals")
        .module("graphics")
        .expect("graphics")
        .module("color")
        .expect("color")
        .value("WHITE", vec![1.0f64, 1.0, 1.0, 1.0])
        .expect("register WHITE");

    engine
        .run_module(
            "main",
            "import { color } from 'graphics';\nrecord_list(color.WHITE);",
        )
        .expect("module must evaluate");

    assert_eq!(seen.borrow().as_slice(), &[vec![1.0, 1.0, 1.0, 1.0]]);
}

#[test]
fn registered_constants_roundtrip_all_scalar_types() {
    let mut engine = Engine::new();
    let ints: Log<i64> = Rc::new(RefCell::new(Vec::new()));
    let texts: Log<String> = Rc::new(RefCell::new(Vec::new()));
    let flags: Log<bool> = Rc::new(RefCell::new(Vec::new()));
    let floats: Log<f64> = Rc::new(RefCell::new(Vec::new()));

    let (ri, rt, rb, rf) = (
        Rc::clone(&ints),
        Rc::clone(&texts),
        Rc::clone(&flags),
        Rc::clone(&floats),
    );
    engine
        .globals_mut()
        .expect("globals")
        .func("record_i64", move |v: i64| ri.borrow_mut().push(v))
        .expect("record_i64")
        .func("record_text", move |v: String| rt.borrow_mut().push(v))
        .expect("record_text")
        .func("record_bool", move |v: bool| rb.borrow_mut().push(v))
        .expect("record_bool")
        .func("record_f64", move |v: f64| rf.borrow_mut().push(v))
        .expect("record_f64")
        .value("BIG", 9007199254740991i64)
        .expect("BIG")
        .value("GREETING", "hello".to_string())
        .expect("GREETING")
        .value("FLAG", true)
        .expect("FLAG")
        .value("HALF", 0.5f64)
        .expect("HALF");

    engine
        .run_module(
            "main",
            "record_i64(BIG);\nrecord_text(GREETING);\nrecord_bool(FLAG);\nrecord_f64(HALF);",
        )
        .expect("module must evaluate");

    assert_eq!(ints.borrow().as_slice(), &[9007199254740991]);
    assert_eq!(texts.borrow().as_slice(), &["hello".to_string()]);
    assert_eq!(flags.borrow().as_slice(), &[true]);
    assert_eq!(floats.borrow().as_slice(), &[0.5]);
}

#[test]
fn arity_mismatch_never_invokes_the_native_function() {
    let mut engine = Engine::new();
    let errors = capture_errors(&mut engine);
    let calls: Log<()> = Rc::new(RefCell::new(Vec::new()));

    let counter = Rc::clone(&calls);
    engine
        .globals_mut()
        .expect("globals")
        .module("math")
        .expect("math")
        .func("add", move |a: i32, b: i32| {
            counter.borrow_mut().push(());
            a + b
        })
        .expect("register add");

    let err = engine
        .run_module("main", "import { add } from 'math';\nadd(2);")
        .expect_err("short call must fail");
    assert_eq!(err.kind, lovejs_engine::error::EngineErrorKind::Script);
    assert!(
        joined(&errors).contains("expected 2 arguments, got 1"),
        "sink text: {}",
        joined(&errors)
    );
    assert!(calls.borrow().is_empty(), "native function must not run");

    // Extra arguments are an arity error too, not a silent truncation. The
    // eager install also makes the function reachable as `math.add`.
    let err = engine
        .run_module("extra", "math.add(1, 2, 3);")
        .expect_err("long call must fail");
    assert_eq!(err.kind, lovejs_engine::error::EngineErrorKind::Script);
    assert!(
        joined(&errors).contains("expected 2 arguments, got 3"),
        "sink text: {}",
        joined(&errors)
    );
    assert!(calls.borrow().is_empty(), "native function must not run");
}

#[test]
fn conversion_failure_stops_before_invocation() {
    let mut engine = Engine::new();
    let errors = capture_errors(&mut engine);
    let calls: Log<()> = Rc::new(RefCell::new(Vec::new()));

    let counter = Rc::clone(&calls);
    engine
        .globals_mut()
        .expect("globals")
        .module("math")
        .expect("math")
        .func("add", move |a: i32, b: i32| {
            counter.borrow_mut().push(());
            a + b
        })
        .expect("register add");

    let err = engine
        .run_module("main", "import { add } from 'math';\nadd('x', 3);")
        .expect_err("mistyped call must fail");
    assert_eq!(err.kind, lovejs_engine::error::EngineErrorKind::Script);
    assert!(
        joined(&errors).contains("expected a number"),
        "sink text: {}",
        joined(&errors)
    );
    assert!(calls.borrow().is_empty(), "native function must not run");
}

#[test]
fn sequences_roundtrip_in_order() {
    let mut engine = Engine::new();
    let seen: Log<Vec<f64>> = Rc::new(RefCell::new(Vec::new()));

    let record = Rc::clone(&seen);
    engine
        .globals_mut()
        .expect("globals")
        .func("record_list", move |v: Vec<f64>| record.borrow_mut().push(v))
        .expect("record_list")
        .func("triple", |v: Vec<f64>| -> Vec<f64> {
            v.into_iter().map(|x| x * 3.0).collect()
        })
        .expect("triple");

    engine
        .run_module("main", "record_list(triple([1.5, 2.0, -4.0]));")
        .expect("module must evaluate");

    assert_eq!(seen.borrow().as_slice(), &[vec![4.5, 6.0, -12.0]]);
}

#[test]
fn oversized_sequences_are_rejected_without_allocation() {
    let mut engine = Engine::new();
    let errors = capture_errors(&mut engine);
    let calls: Log<()> = Rc::new(RefCell::new(Vec::new()));

    let counter = Rc::clone(&calls);
    engine
        .globals_mut()
        .expect("globals")
        .func("record_list", move |_v: Vec<f64>| counter.borrow_mut().push(()))
        .expect("record_list");

    // An array-like object is enough to probe the cap; no element is read
    // before the length check.
    let source = format!("record_list({{length: {}}});", MAX_SEQUENCE_LEN + 1);
    let err = engine
        .run_module("main", &source)
        .expect_err("over-cap sequence must fail");
    assert_eq!(err.kind, lovejs_engine::error::EngineErrorKind::Script);
    assert!(
        joined(&errors).contains("sequence too long"),
        "sink text: {}",
        joined(&errors)
    );
    assert!(calls.borrow().is_empty(), "native function must not run");
}

#[test]
fn failing_element_reports_its_index_and_discards_the_rest() {
    let mut engine = Engine::new();
    let errors = capture_errors(&mut engine);
    let calls: Log<()> = Rc::new(RefCell::new(Vec::new()));

    let counter = Rc::clone(&calls);
    engine
        .globals_mut()
        .expect("globals")
        .func("record_list", move |_v: Vec<f64>| counter.borrow_mut().push(()))
        .expect("record_list");

    let err = engine
        .run_module("main", "record_list([1, 2, 'x', 4]);")
        .expect_err("bad element must fail the whole conversion");
    assert_eq!(err.kind, lovejs_engine::error::EngineErrorKind::Script);
    assert!(
        joined(&errors).contains("sequence element 2"),
        "sink text: {}",
        joined(&errors)
    );
    assert!(calls.borrow().is_empty(), "no partially converted call");
}

#[test]
fn call_global_dispatches_heterogeneous_arguments() {
    let mut engine = Engine::new();
    let errors = capture_errors(&mut engine);
    let seen: Log<String> = Rc::new(RefCell::new(Vec::new()));

    let record = Rc::clone(&seen);
    engine
        .globals_mut()
        .expect("globals")
        .func("record_text", move |v: String| record.borrow_mut().push(v))
        .expect("record_text");

    engine
        .run_script(
            "setup",
            "globalThis.mousepressed = function(x, y, button) {\n\
             record_text(x + ',' + y + ',' + button);\n\
             };\n\
             globalThis.keypressed = function(key) { record_text('key:' + key); };",
        )
        .expect("setup must evaluate");

    assert!(engine.call_global(
        "mousepressed",
        &[CallArg::from(120), CallArg::from(80), CallArg::from(1)],
    ));
    assert!(engine.call_global("keypressed", &[CallArg::from("space")]));

    assert_eq!(
        seen.borrow().as_slice(),
        &["120,80,1".to_string(), "key:space".to_string()]
    );
    assert!(errors.borrow().is_empty(), "unexpected errors: {:?}", errors.borrow());
}

#[test]
fn call_global_misses_and_failures_are_non_fatal() {
    let mut engine = Engine::new();
    let errors = capture_errors(&mut engine);

    engine
        .run_script(
            "setup",
            "globalThis.boom = function() { throw new Error('kaboom'); };\n\
             globalThis.not_callable = 7;",
        )
        .expect("setup must evaluate");

    // Absent or non-callable: failure without an error report.
    assert!(!engine.call_global("missing", &[]));
    assert!(!engine.call_global("not_callable", &[]));
    assert!(errors.borrow().is_empty(), "misses must stay silent");

    // A throwing callback is reported and survivable.
    assert!(!engine.call_global("boom", &[]));
    assert!(joined(&errors).contains("kaboom"), "sink text: {}", joined(&errors));
    // And the next frame can try again without the engine falling over.
    assert!(!engine.call_global("boom", &[]));
}
