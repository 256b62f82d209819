//! tests/scenarios.rs — batteries de bout en bout pour viper-vm
//!
//! Les programmes passent par l'assembleur texte de viper-core quand ils
//! tiennent dans un listing, et par le CodeBuilder quand il faut des
//! objets code imbriqués (fermetures, générateurs).

use std::rc::Rc;

use ahash::AHashMap;
use indoc::indoc;
use pretty_assertions::assert_eq;
use viper_core::{asm, opcode_table, CodeObject, Const, PyVersion, Variant};
use viper_vm::{gc, FrameStatus, Namespace, PyVm, Value, VmError};

// -----------------------------------------------------------------------------
// Helpers de test
// -----------------------------------------------------------------------------

fn run(src: &str, version: PyVersion) -> Value {
    let code = asm::assemble(src, version).expect("assemble ok");
    let mut vm = PyVm::with_stdlib(version).expect("vm ok");
    vm.run_code(&code, None, None, true).expect("run ok")
}

fn run_with_globals(src: &str, version: PyVersion, globals: Namespace) -> Value {
    let code = asm::assemble(src, version).expect("assemble ok");
    let mut vm = PyVm::with_stdlib(version).expect("vm ok");
    vm.run_code(&code, Some(globals), None, true).expect("run ok")
}

fn ns(pairs: &[(&str, Value)]) -> Namespace {
    let mut map = AHashMap::new();
    for (k, v) in pairs {
        map.insert((*k).to_string(), v.clone());
    }
    gc(map)
}

/// Émet une instruction wordcode dans le builder via la table de la version.
fn emit(
    b: &mut viper_core::CodeBuilder,
    table: &viper_core::OpcodeTable,
    name: &str,
    arg: u8,
) {
    let op = table.opcode(name).unwrap_or_else(|| panic!("opcode {name}"));
    b.emit_raw(&[op, arg]);
}

// -----------------------------------------------------------------------------
// Scénarios
// -----------------------------------------------------------------------------

#[test]
fn returns_constant_literal() {
    for version in [PyVersion::V27, PyVersion::V36, PyVersion::V310, PyVersion::V311] {
        let val = run("LOAD_CONST 5\nRETURN_VALUE\n", version);
        assert_eq!(val.to_string(), "5", "version {version}");
    }
    // La valeur ne dépend pas des espaces de noms fournis.
    let val = run_with_globals(
        "LOAD_CONST 5\nRETURN_VALUE\n",
        PyVersion::V38,
        ns(&[("a", Value::Int(99))]),
    );
    assert_eq!(val.to_string(), "5");
}

#[test]
fn conditional_picks_the_larger_global() {
    let src = indoc! {"
        LOAD_NAME a
        LOAD_NAME b
        COMPARE_OP >
        POP_JUMP_IF_FALSE @orelse
        LOAD_NAME a
        RETURN_VALUE
    orelse:
        LOAD_NAME b
        RETURN_VALUE
    "};
    let val = run_with_globals(
        src,
        PyVersion::V36,
        ns(&[("a", Value::Int(10)), ("b", Value::Int(3))]),
    );
    assert_eq!(val.to_string(), "10");
    let val = run_with_globals(
        src,
        PyVersion::V36,
        ns(&[("a", Value::Int(7)), ("b", Value::Int(20))]),
    );
    assert_eq!(val.to_string(), "20");
}

#[test]
fn raised_then_caught_returns_the_argument() {
    let src = indoc! {"
        SETUP_EXCEPT @handler
        LOAD_GLOBAL ValueError
        LOAD_CONST \"x\"
        CALL_FUNCTION 1
        RAISE_VARARGS 1
        POP_BLOCK
        LOAD_CONST None
        RETURN_VALUE
    handler:
        DUP_TOP
        LOAD_GLOBAL ValueError
        COMPARE_OP exception match
        POP_JUMP_IF_FALSE @rethrow
        POP_TOP
        STORE_FAST e
        POP_TOP
        LOAD_FAST e
        LOAD_ATTR args
        LOAD_CONST 0
        BINARY_SUBSCR
        RETURN_VALUE
    rethrow:
        END_FINALLY
    "};
    let code = asm::assemble(src, PyVersion::V36).expect("assemble ok");
    let mut vm = PyVm::with_stdlib(PyVersion::V36).expect("vm ok");
    let val = vm.run_code(&code, None, None, true).expect("run ok");
    assert_eq!(val.to_string(), "x");
    // L'exception rattrapée n'est plus l'exception courante de la VM.
    match &vm.last_exception {
        None => {}
        Some((_, value, _)) => assert!(!matches!(value, Value::Exception(_))),
    }
}

#[test]
fn uncaught_exception_surfaces_a_record() {
    let src = indoc! {"
        .line 3
        LOAD_GLOBAL KeyError
        LOAD_CONST \"k\"
        CALL_FUNCTION 1
        RAISE_VARARGS 1
    "};
    let code = asm::assemble(src, PyVersion::V39).expect("assemble ok");
    let mut vm = PyVm::with_stdlib(PyVersion::V39).expect("vm ok");
    let err = vm.run_code(&code, None, None, true).unwrap_err();
    match err {
        VmError::Uncaught(rec) => {
            assert_eq!(rec.kind_name(), "KeyError");
            assert_eq!(rec.args().len(), 1);
            assert_eq!(rec.args()[0].to_string(), "k");
            assert_eq!(rec.traceback().len(), 1);
            assert_eq!(rec.traceback()[0].lineno, 3);
            assert_eq!(rec.traceback()[0].name, "<module>");
        }
        other => panic!("attendu Uncaught, got {other}"),
    }
}

#[test]
fn uncaught_exception_in_callee_chains_the_traceback() {
    // def f(): raise KeyError("k") ; f()
    let inner_src = indoc! {"
        .flags NEWLOCALS | OPTIMIZED
        .line 2
        LOAD_GLOBAL KeyError
        LOAD_CONST \"k\"
        CALL_FUNCTION 1
        RAISE_VARARGS 1
    "};
    let inner = asm::assemble_named(inner_src, PyVersion::V36, Variant::CPython, "f");
    let inner = inner.expect("assemble f");

    let table = opcode_table(PyVersion::V36, Variant::CPython).expect("table");
    let mut b = CodeObject::builder("<module>", PyVersion::V36);
    let c_code = b.add_const(Const::Code(inner)) as u8;
    let c_name = b.add_const(Const::Str("f".into())) as u8;
    let n_f = b.add_name("f") as u8;
    b.mark_line(1);
    emit(&mut b, &table, "LOAD_CONST", c_code);
    emit(&mut b, &table, "LOAD_CONST", c_name);
    emit(&mut b, &table, "MAKE_FUNCTION", 0);
    emit(&mut b, &table, "STORE_NAME", n_f);
    b.mark_line(4);
    emit(&mut b, &table, "LOAD_NAME", n_f);
    emit(&mut b, &table, "CALL_FUNCTION", 0);
    emit(&mut b, &table, "RETURN_VALUE", 0);
    let code = b.build();

    let mut vm = PyVm::with_stdlib(PyVersion::V36).expect("vm ok");
    let err = vm.run_code(&code, None, None, true).unwrap_err();
    match err {
        VmError::Uncaught(rec) => {
            assert_eq!(rec.kind_name(), "KeyError");
            let tb = rec.traceback();
            assert_eq!(tb.len(), 2);
            assert_eq!(tb[0].name, "f");
            assert_eq!(tb[0].lineno, 2);
            assert_eq!(tb[1].name, "<module>");
            assert_eq!(tb[1].lineno, 4);
        }
        other => panic!("attendu Uncaught, got {other}"),
    }
}

#[test]
fn closure_cells_share_mutation() {
    // x = 1 (cellule) ; def f(): nonlocal x; x += 1; return x
    // (f(), f(), x) == (2, 3, 3)
    let inner_src = indoc! {"
        .free x
        .flags NEWLOCALS | OPTIMIZED | NESTED
        LOAD_DEREF x
        LOAD_CONST 1
        INPLACE_ADD
        STORE_DEREF x
        LOAD_DEREF x
        RETURN_VALUE
    "};
    let inner = asm::assemble_named(inner_src, PyVersion::V36, Variant::CPython, "f")
        .expect("assemble f");

    let table = opcode_table(PyVersion::V36, Variant::CPython).expect("table");
    let mut b = CodeObject::builder("<module>", PyVersion::V36);
    b.add_cellvar("x");
    let c_one = b.add_const(Const::Int(1)) as u8;
    let c_code = b.add_const(Const::Code(inner)) as u8;
    let c_name = b.add_const(Const::Str("f".into())) as u8;
    let n_f = b.add_name("f") as u8;
    emit(&mut b, &table, "LOAD_CONST", c_one);
    emit(&mut b, &table, "STORE_DEREF", 0);
    emit(&mut b, &table, "LOAD_CLOSURE", 0);
    emit(&mut b, &table, "BUILD_TUPLE", 1);
    emit(&mut b, &table, "LOAD_CONST", c_code);
    emit(&mut b, &table, "LOAD_CONST", c_name);
    emit(&mut b, &table, "MAKE_FUNCTION", 0x08);
    emit(&mut b, &table, "STORE_NAME", n_f);
    emit(&mut b, &table, "LOAD_NAME", n_f);
    emit(&mut b, &table, "CALL_FUNCTION", 0);
    emit(&mut b, &table, "LOAD_NAME", n_f);
    emit(&mut b, &table, "CALL_FUNCTION", 0);
    emit(&mut b, &table, "LOAD_DEREF", 0);
    emit(&mut b, &table, "BUILD_TUPLE", 3);
    emit(&mut b, &table, "RETURN_VALUE", 0);
    let code = b.build();

    let mut vm = PyVm::with_stdlib(PyVersion::V36).expect("vm ok");
    let val = vm.run_code(&code, None, None, true).expect("run ok");
    assert_eq!(val.to_string(), "(2, 3, 3)");
}

#[test]
fn generator_walks_new_running_suspended_finished() {
    let gen_src = indoc! {"
        .flags GENERATOR | NEWLOCALS | OPTIMIZED
        LOAD_CONST 1
        YIELD_VALUE
        POP_TOP
        LOAD_CONST 2
        YIELD_VALUE
        POP_TOP
        LOAD_CONST None
        RETURN_VALUE
    "};
    let gen_code = asm::assemble_named(gen_src, PyVersion::V36, Variant::CPython, "g")
        .expect("assemble g");

    let table = opcode_table(PyVersion::V36, Variant::CPython).expect("table");
    let mut b = CodeObject::builder("<module>", PyVersion::V36);
    let c_code = b.add_const(Const::Code(gen_code)) as u8;
    let c_name = b.add_const(Const::Str("g".into())) as u8;
    emit(&mut b, &table, "LOAD_CONST", c_code);
    emit(&mut b, &table, "LOAD_CONST", c_name);
    emit(&mut b, &table, "MAKE_FUNCTION", 0);
    emit(&mut b, &table, "CALL_FUNCTION", 0);
    emit(&mut b, &table, "RETURN_VALUE", 0);
    let code = b.build();

    let mut vm = PyVm::with_stdlib(PyVersion::V36).expect("vm ok");
    let val = vm.run_code(&code, None, None, true).expect("run ok");
    let genv = match val {
        Value::Generator(g) => g,
        other => panic!("attendu générateur, got {other}"),
    };
    assert_eq!(genv.borrow().status(), FrameStatus::New);

    let v1 = vm.resume_generator(&genv, Value::None).expect("resume 1");
    assert_eq!(v1.map(|v| v.to_string()), Some("1".to_string()));
    assert_eq!(genv.borrow().status(), FrameStatus::Suspended);

    let v2 = vm.resume_generator(&genv, Value::None).expect("resume 2");
    assert_eq!(v2.map(|v| v.to_string()), Some("2".to_string()));
    assert_eq!(genv.borrow().status(), FrameStatus::Suspended);

    let v3 = vm.resume_generator(&genv, Value::None).expect("resume 3");
    assert!(v3.is_none());
    assert_eq!(genv.borrow().status(), FrameStatus::Finished);
    assert!(genv.borrow().finished);

    // Un générateur épuisé le reste.
    assert!(vm.resume_generator(&genv, Value::None).expect("resume 4").is_none());
}

#[test]
fn for_iter_drains_a_native_range() {
    let src = indoc! {"
        BUILD_LIST 0
        LOAD_GLOBAL range
        LOAD_CONST 4
        CALL_FUNCTION 1
        GET_ITER
    loop:
        FOR_ITER @done
        LIST_APPEND 2
        JUMP_ABSOLUTE @loop
    done:
        RETURN_VALUE
    "};
    let val = run(src, PyVersion::V37);
    assert_eq!(val.to_string(), "[0, 1, 2, 3]");
}

#[test]
fn keyword_call_binds_names_and_defaults() {
    // def add3(a, b, c=10): return a + b + c ; add3(1, b=5) == 16
    let inner_src = indoc! {"
        .arg a
        .arg b
        .arg c
        .flags NEWLOCALS | OPTIMIZED
        LOAD_FAST a
        LOAD_FAST b
        BINARY_ADD
        LOAD_FAST c
        BINARY_ADD
        RETURN_VALUE
    "};
    let inner = asm::assemble_named(inner_src, PyVersion::V36, Variant::CPython, "add3")
        .expect("assemble add3");

    let table = opcode_table(PyVersion::V36, Variant::CPython).expect("table");
    let mut b = CodeObject::builder("<module>", PyVersion::V36);
    let c_defaults = b.add_const(Const::Tuple(vec![Const::Int(10)])) as u8;
    let c_code = b.add_const(Const::Code(inner)) as u8;
    let c_name = b.add_const(Const::Str("add3".into())) as u8;
    let c_one = b.add_const(Const::Int(1)) as u8;
    let c_five = b.add_const(Const::Int(5)) as u8;
    let c_kw = b.add_const(Const::Tuple(vec![Const::Str("b".into())])) as u8;
    let n_add3 = b.add_name("add3") as u8;
    emit(&mut b, &table, "LOAD_CONST", c_defaults);
    emit(&mut b, &table, "LOAD_CONST", c_code);
    emit(&mut b, &table, "LOAD_CONST", c_name);
    emit(&mut b, &table, "MAKE_FUNCTION", 0x01);
    emit(&mut b, &table, "STORE_NAME", n_add3);
    emit(&mut b, &table, "LOAD_NAME", n_add3);
    emit(&mut b, &table, "LOAD_CONST", c_one);
    emit(&mut b, &table, "LOAD_CONST", c_five);
    emit(&mut b, &table, "LOAD_CONST", c_kw);
    emit(&mut b, &table, "CALL_FUNCTION_KW", 2);
    emit(&mut b, &table, "RETURN_VALUE", 0);
    let code = b.build();

    let mut vm = PyVm::with_stdlib(PyVersion::V36).expect("vm ok");
    let val = vm.run_code(&code, None, None, true).expect("run ok");
    assert_eq!(val.to_string(), "16");
}

#[test]
fn call_protocol_311_with_kw_names() {
    // Même appel que ci-dessus, convention PUSH_NULL / KW_NAMES / CALL.
    let inner_src = indoc! {"
        .arg a
        .arg b
        .arg c
        .flags NEWLOCALS | OPTIMIZED
        LOAD_FAST a
        LOAD_FAST b
        BINARY_OP 0
        LOAD_FAST c
        BINARY_OP 0
        RETURN_VALUE
    "};
    let inner = asm::assemble_named(inner_src, PyVersion::V311, Variant::CPython, "add3")
        .expect("assemble add3");

    let table = opcode_table(PyVersion::V311, Variant::CPython).expect("table");
    let mut b = CodeObject::builder("<module>", PyVersion::V311);
    let c_defaults = b.add_const(Const::Tuple(vec![Const::Int(10)])) as u8;
    let c_code = b.add_const(Const::Code(inner)) as u8;
    let c_one = b.add_const(Const::Int(1)) as u8;
    let c_five = b.add_const(Const::Int(5)) as u8;
    let c_kw = b.add_const(Const::Tuple(vec![Const::Str("b".into())])) as u8;
    let n_add3 = b.add_name("add3") as u8;
    emit(&mut b, &table, "RESUME", 0);
    emit(&mut b, &table, "LOAD_CONST", c_defaults);
    emit(&mut b, &table, "LOAD_CONST", c_code);
    emit(&mut b, &table, "MAKE_FUNCTION", 0x01);
    emit(&mut b, &table, "STORE_NAME", n_add3);
    emit(&mut b, &table, "PUSH_NULL", 0);
    emit(&mut b, &table, "LOAD_NAME", n_add3);
    emit(&mut b, &table, "LOAD_CONST", c_one);
    emit(&mut b, &table, "LOAD_CONST", c_five);
    emit(&mut b, &table, "KW_NAMES", c_kw);
    emit(&mut b, &table, "PRECALL", 2);
    emit(&mut b, &table, "CALL", 2);
    emit(&mut b, &table, "RETURN_VALUE", 0);
    let code = b.build();

    let mut vm = PyVm::with_stdlib(PyVersion::V311).expect("vm ok");
    let val = vm.run_code(&code, None, None, true).expect("run ok");
    assert_eq!(val.to_string(), "16");
}

#[test]
fn unpack_sequence_preserves_order() {
    let src = indoc! {"
        LOAD_CONST (1, 2, 3)
        UNPACK_SEQUENCE 3
        STORE_NAME a
        STORE_NAME b
        STORE_NAME c
        LOAD_NAME a
        LOAD_NAME b
        LOAD_NAME c
        BUILD_TUPLE 3
        RETURN_VALUE
    "};
    assert_eq!(run(src, PyVersion::V39).to_string(), "(1, 2, 3)");
}

#[test]
fn varargs_function_collects_the_tail() {
    // def spread(a, *rest): return (a, rest) ; spread(1, 2, 3)
    let inner_src = indoc! {"
        .arg a
        .local rest
        .flags NEWLOCALS | OPTIMIZED | VARARGS
        LOAD_FAST a
        LOAD_FAST rest
        BUILD_TUPLE 2
        RETURN_VALUE
    "};
    let inner = asm::assemble_named(inner_src, PyVersion::V38, Variant::CPython, "spread")
        .expect("assemble spread");

    let table = opcode_table(PyVersion::V38, Variant::CPython).expect("table");
    let mut b = CodeObject::builder("<module>", PyVersion::V38);
    let c_code = b.add_const(Const::Code(inner)) as u8;
    let c_name = b.add_const(Const::Str("spread".into())) as u8;
    let consts: Vec<u8> = (1..=3)
        .map(|i| b.add_const(Const::Int(i)) as u8)
        .collect();
    emit(&mut b, &table, "LOAD_CONST", c_code);
    emit(&mut b, &table, "LOAD_CONST", c_name);
    emit(&mut b, &table, "MAKE_FUNCTION", 0);
    for c in consts {
        emit(&mut b, &table, "LOAD_CONST", c);
    }
    emit(&mut b, &table, "CALL_FUNCTION", 3);
    emit(&mut b, &table, "RETURN_VALUE", 0);
    let code = b.build();

    let mut vm = PyVm::with_stdlib(PyVersion::V38).expect("vm ok");
    let val = vm.run_code(&code, None, None, true).expect("run ok");
    assert_eq!(val.to_string(), "(1, (2, 3))");
}

#[test]
fn rejects_unknown_keyword_argument() {
    let inner_src = indoc! {"
        .arg a
        .flags NEWLOCALS | OPTIMIZED
        LOAD_FAST a
        RETURN_VALUE
    "};
    let inner = asm::assemble_named(inner_src, PyVersion::V36, Variant::CPython, "ident")
        .expect("assemble");
    let mut vm = PyVm::with_stdlib(PyVersion::V36).expect("vm ok");
    let func = {
        // Fabrique la fonction à la main et appelle-la hors bytecode.
        let globals = ns(&[]);
        Value::Function(Rc::new(viper_vm::Function {
            name: "ident".into(),
            qualname: "ident".into(),
            code: inner,
            globals,
            defaults: vec![],
            kwdefaults: AHashMap::new(),
            annotations: AHashMap::new(),
            closure: vec![],
            has_dot_zero: false,
        }))
    };
    let mut named = AHashMap::new();
    named.insert("nope".to_string(), Value::Int(1));
    let err = vm
        .call_value(func, vec![Value::Int(1)], named)
        .unwrap_err();
    match err {
        VmError::User(e) => assert_eq!(e.etype.name, "TypeError"),
        other => panic!("attendu TypeError, got {other}"),
    }
}
