//! tests/decode.rs — décodeur et propriétés de pile : EXTENDED_ARG,
//! unités de saut 3.10/3.11, familles de sauts conditionnels, paires
//! idempotentes, invariants de fin d'exécution.

use indoc::indoc;
use pretty_assertions::assert_eq;
use viper_core::{asm, opcode_table, CodeObject, Const, PyVersion, Variant};
use viper_vm::{PyVm, Value, VmError, Why};

fn run(src: &str, version: PyVersion) -> Value {
    let code = asm::assemble(src, version).expect("assemble ok");
    let mut vm = PyVm::with_stdlib(version).expect("vm ok");
    vm.run_code(&code, None, None, true).expect("run ok")
}

#[test]
fn extended_arg_widens_the_next_argument() {
    // 300 constantes ; l'index 300 = EXTENDED_ARG 1 puis LOAD_CONST 44.
    let table = opcode_table(PyVersion::V36, Variant::CPython).expect("table");
    let mut b = CodeObject::builder("<module>", PyVersion::V36);
    for i in 0..=300 {
        b.add_const(Const::Int(i));
    }
    let ext = table.opcode("EXTENDED_ARG").unwrap();
    let load = table.opcode("LOAD_CONST").unwrap();
    let ret = table.opcode("RETURN_VALUE").unwrap();
    b.emit_raw(&[ext, 1, load, 44, ret, 0]);
    let code = b.build();

    let mut vm = PyVm::with_stdlib(PyVersion::V36).expect("vm ok");
    let val = vm.run_code(&code, None, None, true).expect("run ok");
    assert_eq!(val.to_string(), "300");
}

#[test]
fn extended_arg_shifts_16_bits_on_27() {
    // Décodage seul : l'argument de saut accumulé vaut (1 << 16) | 0x1170.
    let table = opcode_table(PyVersion::V27, Variant::CPython).expect("table");
    let mut b = CodeObject::builder("<module>", PyVersion::V27);
    let ext = table.opcode("EXTENDED_ARG").unwrap();
    let jabs = table.opcode("JUMP_ABSOLUTE").unwrap();
    b.emit_raw(&[ext, 1, 0, jabs, 0x70, 0x11]);
    let code = b.build();

    let mut vm = PyVm::with_stdlib(PyVersion::V27).expect("vm ok");
    let frame = vm
        .make_frame(code, Default::default(), None, None, &[])
        .expect("frame");
    vm.push_frame(frame);
    let d = vm.parse_byte_and_args().expect("decode");
    assert_eq!(d.name, "JUMP_ABSOLUTE");
    assert_eq!(d.int_arg, Some(70_000));
    assert_eq!(d.jump_target().unwrap(), 70_000);
    vm.pop_frame();
}

#[test]
fn jump_arguments_are_doubled_from_310() {
    // JUMP_FORWARD 1 saute une instruction entière (2 octets).
    let table = opcode_table(PyVersion::V310, Variant::CPython).expect("table");
    let mut b = CodeObject::builder("<module>", PyVersion::V310);
    let c_bad = b.add_const(Const::Str("bad".into())) as u8;
    let c_good = b.add_const(Const::Str("good".into())) as u8;
    let jf = table.opcode("JUMP_FORWARD").unwrap();
    let load = table.opcode("LOAD_CONST").unwrap();
    let ret = table.opcode("RETURN_VALUE").unwrap();
    b.emit_raw(&[jf, 1, load, c_bad, load, c_good, ret, 0]);
    let code = b.build();

    let mut vm = PyVm::with_stdlib(PyVersion::V310).expect("vm ok");
    let val = vm.run_code(&code, None, None, true).expect("run ok");
    assert_eq!(val.to_string(), "good");
}

#[test]
fn jump_backward_moves_to_end_minus_twice_delta() {
    // 0: JUMP_FORWARD 2   → 6
    // 2: LOAD_CONST good  ← cible du saut arrière (8 - 2*3 = 2)
    // 4: RETURN_VALUE
    // 6: JUMP_BACKWARD 3
    let table = opcode_table(PyVersion::V311, Variant::CPython).expect("table");
    let mut b = CodeObject::builder("<module>", PyVersion::V311);
    let c_good = b.add_const(Const::Str("good".into())) as u8;
    let jf = table.opcode("JUMP_FORWARD").unwrap();
    let jb = table.opcode("JUMP_BACKWARD").unwrap();
    let load = table.opcode("LOAD_CONST").unwrap();
    let ret = table.opcode("RETURN_VALUE").unwrap();
    b.emit_raw(&[jf, 2, load, c_good, ret, 0, jb, 3]);
    let code = b.build();

    let mut vm = PyVm::with_stdlib(PyVersion::V311).expect("vm ok");
    let val = vm.run_code(&code, None, None, true).expect("run ok");
    assert_eq!(val.to_string(), "good");
}

#[test]
fn dup_then_pop_and_double_rot_are_noops() {
    let src = indoc! {"
        LOAD_CONST 1
        LOAD_CONST 2
        DUP_TOP
        POP_TOP
        ROT_TWO
        ROT_TWO
        BUILD_TUPLE 2
        RETURN_VALUE
    "};
    assert_eq!(run(src, PyVersion::V38).to_string(), "(1, 2)");
}

#[test]
fn copy_and_swap_311() {
    let src = indoc! {"
        LOAD_CONST 10
        LOAD_CONST 20
        SWAP 2
        COPY 2
        BUILD_TUPLE 3
        RETURN_VALUE
    "};
    // [10, 20] → SWAP 2 → [20, 10] → COPY 2 → [20, 10, 20]
    assert_eq!(run(src, PyVersion::V311).to_string(), "(20, 10, 20)");
}

#[test]
fn pop_jump_family_311() {
    let src = indoc! {"
        LOAD_CONST None
        POP_JUMP_FORWARD_IF_NONE @was_none
        LOAD_CONST \"bad\"
        RETURN_VALUE
    was_none:
        LOAD_CONST 0
        POP_JUMP_FORWARD_IF_FALSE @was_false
        LOAD_CONST \"bad\"
        RETURN_VALUE
    was_false:
        LOAD_CONST \"good\"
        RETURN_VALUE
    "};
    assert_eq!(run(src, PyVersion::V311).to_string(), "good");
}

#[test]
fn binary_op_indexes_the_sub_operation_table() {
    for (arg, expect) in [(0u8, "10"), (5, "21"), (6, "1"), (10, "4"), (11, "2.3333333333333335")] {
        let table = opcode_table(PyVersion::V311, Variant::CPython).expect("table");
        let mut b = CodeObject::builder("<module>", PyVersion::V311);
        let c7 = b.add_const(Const::Int(7)) as u8;
        let c3 = b.add_const(Const::Int(3)) as u8;
        let load = table.opcode("LOAD_CONST").unwrap();
        let bop = table.opcode("BINARY_OP").unwrap();
        let ret = table.opcode("RETURN_VALUE").unwrap();
        b.emit_raw(&[load, c7, load, c3, bop, arg, ret, 0]);
        let code = b.build();
        let mut vm = PyVm::with_stdlib(PyVersion::V311).expect("vm ok");
        let val = vm.run_code(&code, None, None, true).expect("run ok");
        assert_eq!(val.to_string(), expect, "sous-opération {arg}");
    }
}

#[test]
fn load_global_null_bit_311() {
    let src = indoc! {"
        LOAD_GLOBAL NULL+print
        LOAD_CONST 42
        PRECALL 1
        CALL 1
        POP_TOP
        LOAD_CONST \"done\"
        RETURN_VALUE
    "};
    assert_eq!(run(src, PyVersion::V311).to_string(), "done");
}

#[test]
fn match_family_310() {
    let src = indoc! {"
        LOAD_CONST \"a\"
        LOAD_CONST 1
        LOAD_CONST \"b\"
        LOAD_CONST 2
        BUILD_MAP 2
        MATCH_MAPPING
        POP_JUMP_IF_FALSE @fail
        LOAD_CONST (\"a\",)
        MATCH_KEYS
        POP_JUMP_IF_FALSE @fail
        STORE_NAME vals
        POP_TOP
        POP_TOP
        LOAD_NAME vals
        RETURN_VALUE
    fail:
        LOAD_CONST None
        RETURN_VALUE
    "};
    assert_eq!(run(src, PyVersion::V310).to_string(), "(1,)");
}

#[test]
fn residual_stack_at_toplevel_is_an_internal_error() {
    let src = indoc! {"
        LOAD_CONST 1
        LOAD_CONST 2
        RETURN_VALUE
    "};
    let code = asm::assemble(src, PyVersion::V39).expect("assemble ok");
    let mut vm = PyVm::with_stdlib(PyVersion::V39).expect("vm ok");
    let err = vm.run_code(&code, None, None, true).unwrap_err();
    assert!(matches!(err, VmError::Internal(_)), "got {err}");
}

#[test]
fn missing_handler_is_an_internal_error() {
    // IMPORT_NAME est volontairement sans handler.
    let src = indoc! {"
        LOAD_CONST None
        LOAD_CONST None
        IMPORT_NAME os
        RETURN_VALUE
    "};
    let code = asm::assemble(src, PyVersion::V39).expect("assemble ok");
    let mut vm = PyVm::with_stdlib(PyVersion::V39).expect("vm ok");
    let err = vm.run_code(&code, None, None, true).unwrap_err();
    assert!(matches!(err, VmError::Internal(_)), "got {err}");
}

#[test]
fn fallthrough_flag_follows_control_transfers() {
    let src = indoc! {"
        JUMP_FORWARD @next
    next:
        LOAD_CONST None
        RETURN_VALUE
    "};
    let code = asm::assemble(src, PyVersion::V38).expect("assemble ok");
    let mut vm = PyVm::with_stdlib(PyVersion::V38).expect("vm ok");
    let frame = vm
        .make_frame(code, Default::default(), None, None, &[])
        .expect("frame");
    vm.push_frame(frame.clone());

    let d = vm.parse_byte_and_args().expect("decode jump");
    assert_eq!(d.name, "JUMP_FORWARD");
    let why = vm.dispatch(&d).expect("dispatch jump");
    assert_eq!(why, None);
    assert!(!frame.borrow().fallthrough, "un saut pose fallthrough=false");

    let d = vm.parse_byte_and_args().expect("decode load");
    assert_eq!(d.name, "LOAD_CONST");
    vm.dispatch(&d).expect("dispatch load");
    assert!(frame.borrow().fallthrough, "hors saut, fallthrough reste vrai");

    let d = vm.parse_byte_and_args().expect("decode return");
    let why = vm.dispatch(&d).expect("dispatch return");
    assert_eq!(why, Some(Why::Return));
    vm.pop_frame();
}
