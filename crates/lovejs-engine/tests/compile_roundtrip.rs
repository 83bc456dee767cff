use std::cell::RefCell;
use std::rc::Rc;

use lovejs_engine::compile::CompileErrorKind;
use lovejs_engine::engine::{Engine, EngineOptions};

type Log<T> = Rc<RefCell<Vec<T>>>;

/// An engine with the math.add native module plus record/probe callbacks,
/// mirroring a minimal host surface.
fn host_engine() -> (Engine, Log<i32>, Log<String>) {
    let mut engine = Engine::new();
    let seen: Log<i32> = Rc::new(RefCell::new(Vec::new()));
    let errors: Log<String> = Rc::new(RefCell::new(Vec::new()));

    let sink = Rc::clone(&errors);
    engine.set_error_sink(move |message| sink.borrow_mut().push(message.to_string()));

    let record = Rc::clone(&seen);
    engine
        .globals_mut()
        .expect("globals")
        .func("record", move |v: i32| record.borrow_mut().push(v))
        .expect("register record");
    engine
        .globals_mut()
        .expect("globals")
        .module("math")
        .expect("math")
        .func("add", |a: i32, b: i32| a + b)
        .expect("register add");

    (engine, seen, errors)
}

const MAIN_SOURCE: &str = "import { add } from 'math';\nrecord(add(2, 3));";

#[test]
fn compiled_unit_replays_the_same_native_effects_as_source() {
    // Direct evaluation.
    let (mut direct, direct_seen, direct_errors) = host_engine();
    direct
        .run_module("main", MAIN_SOURCE)
        .expect("direct evaluation");

    // Compile on a disposable runtime, execute on a separate live engine.
    let (mut replay, replay_seen, replay_errors) = host_engine();
    let bytes = replay
        .compile(MAIN_SOURCE, "main")
        .expect("compile must succeed without the real bindings running");
    assert!(!bytes.is_empty(), "compiled unit must not be empty");
    replay.run_bytecode(&bytes).expect("bytecode evaluation");

    assert_eq!(direct_seen.borrow().as_slice(), &[5]);
    assert_eq!(replay_seen.borrow().as_slice(), direct_seen.borrow().as_slice());
    assert!(direct_errors.borrow().is_empty());
    assert!(replay_errors.borrow().is_empty());
}

#[test]
fn compile_does_not_execute_anything() {
    let (engine, seen, _errors) = host_engine();
    // record() does not exist in the disposable compile runtime; compilation
    // still succeeds because nothing runs.
    engine
        .compile(MAIN_SOURCE, "main")
        .expect("declaration-only compile");
    assert!(seen.borrow().is_empty(), "compile must have no side effects");
}

#[test]
fn compiler_snapshot_works_off_thread() {
    let (engine, _seen, _errors) = host_engine();
    let compiler = engine.compiler().expect("snapshot");
    let handle = std::thread::spawn(move || compiler.compile(MAIN_SOURCE, "main"));
    let bytes = handle
        .join()
        .expect("compiler thread")
        .expect("compile on another thread");
    assert!(!bytes.is_empty());
}

#[test]
fn compile_reports_parse_errors() {
    let (engine, _seen, _errors) = host_engine();
    let err = engine
        .compile("let let = 1;", "bad")
        .expect_err("syntax error must fail");
    assert_eq!(err.kind, CompileErrorKind::Parse);
    assert!(!err.message.is_empty());
}

#[test]
fn compile_reports_unresolvable_imports() {
    let (engine, _seen, _errors) = host_engine();
    let err = engine
        .compile("import 'nope';", "bad")
        .expect_err("unknown import must fail");
    assert_eq!(err.kind, CompileErrorKind::Resolve);
    assert!(
        err.message.contains("module not found: nope"),
        "message: {}",
        err.message
    );
}

#[test]
fn compile_follows_file_imports_declaration_only() {
    let dir = tempfile::tempdir().expect("temp dir");
    // The helper module calls a host function at its top level: executing it
    // during compilation would throw, so success proves declaration-only.
    std::fs::write(
        dir.path().join("util.js"),
        "export function twice(x) { return x * 2; }\nprobe();\n",
    )
    .expect("write util.js");

    let options = EngineOptions {
        module_roots: vec![dir.path().to_path_buf()],
        ..EngineOptions::default()
    };
    let mut engine = Engine::with_options(options);
    let seen: Log<i32> = Rc::new(RefCell::new(Vec::new()));
    let probes: Log<()> = Rc::new(RefCell::new(Vec::new()));
    let record = Rc::clone(&seen);
    let probe = Rc::clone(&probes);
    engine
        .globals_mut()
        .expect("globals")
        .func("record", move |v: i32| record.borrow_mut().push(v))
        .expect("record")
        .func("probe", move || probe.borrow_mut().push(()))
        .expect("probe");

    let source = "import { twice } from 'util';\nrecord(twice(21));";
    let bytes = engine.compile(source, "main").expect("compile with file import");
    assert!(probes.borrow().is_empty(), "compile must not run module bodies");

    engine.run_bytecode(&bytes).expect("bytecode evaluation");
    assert_eq!(seen.borrow().as_slice(), &[42]);
    assert_eq!(probes.borrow().len(), 1, "helper module ran at execution time");
}

#[test]
fn module_exports_are_grafted_onto_globals_after_bytecode_run() {
    let (mut engine, seen, _errors) = host_engine();
    let bytes = engine
        .compile(
            "export function hello() { record(7); }\nexport const VERSION = 3;",
            "main",
        )
        .expect("compile");
    engine.run_bytecode(&bytes).expect("bytecode evaluation");

    // The exported function is now reachable by plain global name, exactly
    // as the source-loading path arranges.
    assert!(engine.call_global("hello", &[]));
    assert_eq!(seen.borrow().as_slice(), &[7]);

    engine
        .run_script("check", "if (VERSION !== 3) { throw new Error('missing export'); }")
        .expect("grafted constant must be visible");
}

#[test]
fn compiled_units_survive_the_executable_trailer() {
    let (mut engine, seen, _errors) = host_engine();
    let bytes = engine.compile(MAIN_SOURCE, "main").expect("compile");

    let image =
        lovejs_contracts::append_payload(b"host-executable-bytes", &bytes).expect("append");
    let payload = lovejs_contracts::extract_payload(&image).expect("extract");
    assert_eq!(payload, bytes.as_slice());

    engine.run_bytecode(payload).expect("embedded payload runs");
    assert_eq!(seen.borrow().as_slice(), &[5]);
}
