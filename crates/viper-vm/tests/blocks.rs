//! tests/blocks.rs — pile de blocs et moteur d'unwinding : boucles,
//! break/continue, finally, gestionnaires de contexte, variantes 2.7 et
//! PyPy.

use std::cell::RefCell;
use std::rc::Rc;

use ahash::AHashMap;
use indoc::indoc;
use pretty_assertions::assert_eq;
use viper_core::{asm, PyVersion, Variant};
use viper_vm::{gc, Host, Namespace, Native, PyVm, Value, VmResult};

// -----------------------------------------------------------------------------
// Helpers de test
// -----------------------------------------------------------------------------

/// Hôte qui capture la sortie pour inspection.
struct CaptureHost(Rc<RefCell<String>>);

impl Host for CaptureHost {
    fn write(&mut self, s: &str) {
        self.0.borrow_mut().push_str(s);
    }
}

fn run(src: &str, version: PyVersion) -> Value {
    // RUST_LOG=info trace chaque instruction pendant le debug des tests.
    let _ = env_logger::builder().is_test(true).try_init();
    let code = asm::assemble(src, version).expect("assemble ok");
    let mut vm = PyVm::with_stdlib(version).expect("vm ok");
    vm.run_code(&code, None, None, true).expect("run ok")
}

fn empty_ns() -> Namespace {
    gc(AHashMap::new())
}

// -----------------------------------------------------------------------------
// Boucles
// -----------------------------------------------------------------------------

#[test]
fn break_unwinds_only_the_innermost_loop() {
    let src = indoc! {"
        SETUP_LOOP @done_outer
        SETUP_LOOP @done_inner
        BREAK_LOOP
        LOAD_CONST \"unreachable\"
        RETURN_VALUE
    done_inner:
        POP_BLOCK
        LOAD_CONST \"inner\"
        RETURN_VALUE
    done_outer:
        LOAD_CONST \"outer\"
        RETURN_VALUE
    "};
    assert_eq!(run(src, PyVersion::V36).to_string(), "inner");
}

#[test]
fn continue_jumps_back_to_the_loop_head() {
    let src = indoc! {"
        LOAD_CONST 0
        STORE_NAME i
        SETUP_LOOP @done
    start:
        LOAD_NAME i
        LOAD_CONST 1
        BINARY_ADD
        STORE_NAME i
        LOAD_NAME i
        LOAD_CONST 3
        COMPARE_OP <
        POP_JUMP_IF_FALSE @stop
        CONTINUE_LOOP @start
    stop:
        BREAK_LOOP
    done:
        LOAD_NAME i
        RETURN_VALUE
    "};
    assert_eq!(run(src, PyVersion::V37).to_string(), "3");
}

#[test]
fn loop_depth_restored_after_break() {
    // Une valeur vivait sous le bloc de boucle ; break la laisse intacte.
    let src = indoc! {"
        LOAD_CONST \"kept\"
        SETUP_LOOP @done
        LOAD_CONST 1
        LOAD_CONST 2
        BREAK_LOOP
    done:
        RETURN_VALUE
    "};
    assert_eq!(run(src, PyVersion::V36).to_string(), "kept");
}

// -----------------------------------------------------------------------------
// finally
// -----------------------------------------------------------------------------

#[test]
fn finally_runs_on_return_and_preserves_the_value() {
    let src = indoc! {"
        SETUP_FINALLY @fin
        LOAD_CONST 7
        RETURN_VALUE
    fin:
        LOAD_CONST True
        STORE_NAME ran
        END_FINALLY
        LOAD_CONST None
        RETURN_VALUE
    "};
    let code = asm::assemble(src, PyVersion::V36).expect("assemble ok");
    let mut vm = PyVm::with_stdlib(PyVersion::V36).expect("vm ok");
    let globals = empty_ns();
    let val = vm
        .run_code(&code, Some(globals.clone()), None, true)
        .expect("run ok");
    assert_eq!(val.to_string(), "7");
    assert!(globals.borrow().get("ran").is_some_and(Value::truthy));
}

#[test]
fn finally_runs_on_exception_then_reraises() {
    let src = indoc! {"
        SETUP_FINALLY @fin
        LOAD_GLOBAL ValueError
        RAISE_VARARGS 1
        POP_BLOCK
        LOAD_CONST None
    fin:
        LOAD_CONST True
        STORE_NAME ran
        END_FINALLY
        LOAD_CONST None
        RETURN_VALUE
    "};
    let code = asm::assemble(src, PyVersion::V36).expect("assemble ok");
    let mut vm = PyVm::with_stdlib(PyVersion::V36).expect("vm ok");
    let globals = empty_ns();
    let err = vm
        .run_code(&code, Some(globals.clone()), None, true)
        .unwrap_err();
    assert!(globals.borrow().get("ran").is_some_and(Value::truthy));
    match err {
        viper_vm::VmError::Uncaught(rec) => assert_eq!(rec.kind_name(), "ValueError"),
        other => panic!("attendu Uncaught, got {other}"),
    }
}

#[test]
fn call_finally_protocol_38() {
    // try: x = 1 finally-bloc partagé appelé par CALL_FINALLY.
    let src = indoc! {"
        LOAD_CONST 0
        STORE_NAME hits
        CALL_FINALLY @fin
        LOAD_CONST \"after\"
        RETURN_VALUE
    fin:
        LOAD_NAME hits
        LOAD_CONST 1
        BINARY_ADD
        STORE_NAME hits
        END_FINALLY
        LOAD_CONST \"fell-through\"
        RETURN_VALUE
    "};
    let code = asm::assemble(src, PyVersion::V38).expect("assemble ok");
    let mut vm = PyVm::with_stdlib(PyVersion::V38).expect("vm ok");
    let globals = empty_ns();
    let val = vm
        .run_code(&code, Some(globals.clone()), None, true)
        .expect("run ok");
    // END_FINALLY resaute à l'adresse posée par CALL_FINALLY.
    assert_eq!(val.to_string(), "after");
    assert_eq!(globals.borrow()["hits"].to_string(), "1");
}

// -----------------------------------------------------------------------------
// with
// -----------------------------------------------------------------------------

/// Gestionnaire de contexte hôte : un sac d'attributs portant __enter__ et
/// __exit__ natifs, qui journalisent leurs passages.
fn context_manager(log: Rc<RefCell<Vec<String>>>, suppress: bool) -> Value {
    let mut bag = AHashMap::new();
    let enter_log = log.clone();
    bag.insert(
        "__enter__".to_string(),
        Value::Native(Native::new(
            "__enter__",
            Rc::new(move |_vm: &mut PyVm, _args: &[Value]| -> VmResult<Value> {
                enter_log.borrow_mut().push("enter".to_string());
                Ok(Value::str("resource"))
            }),
        )),
    );
    let exit_log = log;
    bag.insert(
        "__exit__".to_string(),
        Value::Native(Native::new(
            "__exit__",
            Rc::new(move |_vm: &mut PyVm, args: &[Value]| -> VmResult<Value> {
                let kind = match args.first() {
                    Some(Value::None) | None => "clean".to_string(),
                    Some(other) => format!("exc:{other}"),
                };
                exit_log.borrow_mut().push(format!("exit:{kind}"));
                Ok(Value::Bool(suppress))
            }),
        )),
    );
    Value::Object(gc(bag))
}

#[test]
fn with_cleanup_runs_on_normal_exit() {
    let src = indoc! {"
        LOAD_NAME cm
        SETUP_WITH @cleanup
        POP_TOP
        LOAD_CONST 5
        STORE_NAME x
        POP_BLOCK
        LOAD_CONST None
    cleanup:
        WITH_CLEANUP_START
        WITH_CLEANUP_FINISH
        END_FINALLY
        LOAD_NAME x
        RETURN_VALUE
    "};
    let log = Rc::new(RefCell::new(Vec::new()));
    let globals = empty_ns();
    globals
        .borrow_mut()
        .insert("cm".to_string(), context_manager(log.clone(), false));

    let code = asm::assemble(src, PyVersion::V36).expect("assemble ok");
    let mut vm = PyVm::with_stdlib(PyVersion::V36).expect("vm ok");
    let val = vm
        .run_code(&code, Some(globals), None, true)
        .expect("run ok");
    assert_eq!(val.to_string(), "5");
    assert_eq!(*log.borrow(), vec!["enter", "exit:clean"]);
}

#[test]
fn with_cleanup_runs_on_exception_and_can_suppress() {
    let src = indoc! {"
        LOAD_NAME cm
        SETUP_WITH @cleanup
        POP_TOP
        LOAD_GLOBAL ValueError
        RAISE_VARARGS 1
        POP_BLOCK
        LOAD_CONST None
    cleanup:
        WITH_CLEANUP_START
        WITH_CLEANUP_FINISH
        END_FINALLY
        LOAD_CONST \"survived\"
        RETURN_VALUE
    "};
    let log = Rc::new(RefCell::new(Vec::new()));
    let globals = empty_ns();
    globals
        .borrow_mut()
        .insert("cm".to_string(), context_manager(log.clone(), true));

    let code = asm::assemble(src, PyVersion::V36).expect("assemble ok");
    let mut vm = PyVm::with_stdlib(PyVersion::V36).expect("vm ok");
    let val = vm
        .run_code(&code, Some(globals), None, true)
        .expect("run ok");
    assert_eq!(val.to_string(), "survived");
    let log = log.borrow();
    assert_eq!(log[0], "enter");
    assert!(log[1].starts_with("exit:exc:"), "exit a vu l'exception : {}", log[1]);
}

// -----------------------------------------------------------------------------
// 2.7
// -----------------------------------------------------------------------------

#[test]
fn v27_try_except_catches_by_class() {
    let src = indoc! {"
        SETUP_EXCEPT @handler
        LOAD_GLOBAL ValueError
        RAISE_VARARGS 1
        POP_BLOCK
        JUMP_FORWARD @end
    handler:
        DUP_TOP
        LOAD_GLOBAL ValueError
        COMPARE_OP exception match
        POP_JUMP_IF_FALSE @rethrow
        POP_TOP
        POP_TOP
        POP_TOP
        LOAD_CONST \"caught\"
        RETURN_VALUE
    rethrow:
        END_FINALLY
    end:
        LOAD_CONST None
        RETURN_VALUE
    "};
    assert_eq!(run(src, PyVersion::V27).to_string(), "caught");
}

#[test]
fn v27_print_statement_writes_to_the_host() {
    let src = indoc! {"
        LOAD_CONST \"hi\"
        PRINT_ITEM
        PRINT_NEWLINE
        LOAD_CONST None
        RETURN_VALUE
    "};
    let out = Rc::new(RefCell::new(String::new()));
    let code = asm::assemble(src, PyVersion::V27).expect("assemble ok");
    let mut vm = PyVm::with_stdlib(PyVersion::V27)
        .expect("vm ok")
        .with_host(Box::new(CaptureHost(out.clone())));
    vm.run_code(&code, None, None, true).expect("run ok");
    assert_eq!(*out.borrow(), "hi \n");
}

#[test]
fn v27_slice_operators() {
    let src = indoc! {"
        LOAD_CONST (10, 20, 30, 40)
        LOAD_CONST 1
        LOAD_CONST 3
        SLICE+3
        RETURN_VALUE
    "};
    assert_eq!(run(src, PyVersion::V27).to_string(), "(20, 30)");
}

// -----------------------------------------------------------------------------
// PyPy
// -----------------------------------------------------------------------------

#[test]
fn pypy_lookup_and_call_method() {
    let src = indoc! {"
        LOAD_NAME obj
        LOOKUP_METHOD bump
        LOAD_CONST 5
        CALL_METHOD 1
        RETURN_VALUE
    "};
    let globals = empty_ns();
    let mut bag = AHashMap::new();
    bag.insert(
        "bump".to_string(),
        Value::Native(Native::new(
            "bump",
            Rc::new(|_vm: &mut PyVm, args: &[Value]| -> VmResult<Value> {
                // args[0] est le receveur, args[1] l'argument explicite.
                match (&args[0], &args[1]) {
                    (Value::Object(_), Value::Int(i)) => Ok(Value::Int(i + 1)),
                    _ => Ok(Value::None),
                }
            }),
        )),
    );
    globals
        .borrow_mut()
        .insert("obj".to_string(), Value::Object(gc(bag)));

    let code = asm::assemble_named(src, PyVersion::V27, Variant::PyPy, "<module>")
        .expect("assemble ok");
    let mut vm = PyVm::with_variant(PyVersion::V27, Variant::PyPy).expect("vm ok");
    let val = vm
        .run_code(&code, Some(globals), None, true)
        .expect("run ok");
    assert_eq!(val.to_string(), "6");
}
