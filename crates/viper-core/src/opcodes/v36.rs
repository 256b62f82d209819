//! v36.rs — Table 3.6, définie de zéro.
//!
//! Passage au wordcode : toute instruction fait 2 octets, EXTENDED_ARG
//! décale de 8 bits. MAKE_FUNCTION passe aux drapeaux, CALL_FUNCTION_EX
//! remplace les variantes VAR/KW de 2.7.

use super::{TableBuilder, TableError};

pub(super) fn install(b: &mut TableBuilder) -> Result<(), TableError> {
    b.def_op("POP_TOP", 1);
    b.def_op("ROT_TWO", 2);
    b.def_op("ROT_THREE", 3);
    b.def_op("DUP_TOP", 4);
    b.def_op("DUP_TOP_TWO", 5);
    b.def_op("NOP", 9);

    b.def_op("UNARY_POSITIVE", 10);
    b.def_op("UNARY_NEGATIVE", 11);
    b.def_op("UNARY_NOT", 12);
    b.def_op("UNARY_INVERT", 15);
    b.def_op("BINARY_MATRIX_MULTIPLY", 16);
    b.def_op("INPLACE_MATRIX_MULTIPLY", 17);

    b.def_op("BINARY_POWER", 19);
    b.def_op("BINARY_MULTIPLY", 20);
    b.def_op("BINARY_MODULO", 22);
    b.def_op("BINARY_ADD", 23);
    b.def_op("BINARY_SUBTRACT", 24);
    b.def_op("BINARY_SUBSCR", 25);
    b.def_op("BINARY_FLOOR_DIVIDE", 26);
    b.def_op("BINARY_TRUE_DIVIDE", 27);
    b.def_op("INPLACE_FLOOR_DIVIDE", 28);
    b.def_op("INPLACE_TRUE_DIVIDE", 29);

    b.def_op("GET_AITER", 50);
    b.def_op("GET_ANEXT", 51);
    b.def_op("BEFORE_ASYNC_WITH", 52);

    b.def_op("INPLACE_ADD", 55);
    b.def_op("INPLACE_SUBTRACT", 56);
    b.def_op("INPLACE_MULTIPLY", 57);
    b.def_op("INPLACE_MODULO", 59);
    b.def_op("STORE_SUBSCR", 60);
    b.def_op("DELETE_SUBSCR", 61);
    b.def_op("BINARY_LSHIFT", 62);
    b.def_op("BINARY_RSHIFT", 63);
    b.def_op("BINARY_AND", 64);
    b.def_op("BINARY_XOR", 65);
    b.def_op("BINARY_OR", 66);
    b.def_op("INPLACE_POWER", 67);
    b.def_op("GET_ITER", 68);
    b.def_op("GET_YIELD_FROM_ITER", 69);

    b.def_op("PRINT_EXPR", 70);
    b.def_op("LOAD_BUILD_CLASS", 71);
    b.def_op("YIELD_FROM", 72);
    b.def_op("GET_AWAITABLE", 73);
    b.def_op("INPLACE_LSHIFT", 75);
    b.def_op("INPLACE_RSHIFT", 76);
    b.def_op("INPLACE_AND", 77);
    b.def_op("INPLACE_XOR", 78);
    b.def_op("INPLACE_OR", 79);
    b.def_op("BREAK_LOOP", 80);
    b.def_op("WITH_CLEANUP_START", 81);
    b.def_op("WITH_CLEANUP_FINISH", 82);
    b.def_op("RETURN_VALUE", 83);
    b.def_op("IMPORT_STAR", 84);
    b.def_op("SETUP_ANNOTATIONS", 85);
    b.def_op("YIELD_VALUE", 86);
    b.def_op("POP_BLOCK", 87);
    b.def_op("END_FINALLY", 88);
    b.def_op("POP_EXCEPT", 89);

    // À partir d'ici, tout porte un argument.
    b.name_op("STORE_NAME", 90);
    b.name_op("DELETE_NAME", 91);
    b.def_op("UNPACK_SEQUENCE", 92);
    b.jrel_op("FOR_ITER", 93);
    b.def_op("UNPACK_EX", 94);
    b.name_op("STORE_ATTR", 95);
    b.name_op("DELETE_ATTR", 96);
    b.name_op("STORE_GLOBAL", 97);
    b.name_op("DELETE_GLOBAL", 98);
    b.const_op("LOAD_CONST", 100);
    b.name_op("LOAD_NAME", 101);
    b.def_op("BUILD_TUPLE", 102);
    b.def_op("BUILD_LIST", 103);
    b.def_op("BUILD_SET", 104);
    b.def_op("BUILD_MAP", 105);
    b.name_op("LOAD_ATTR", 106);
    b.compare_op("COMPARE_OP", 107);
    b.name_op("IMPORT_NAME", 108);
    b.name_op("IMPORT_FROM", 109);
    b.jrel_op("JUMP_FORWARD", 110);
    b.jabs_op("JUMP_IF_FALSE_OR_POP", 111);
    b.jabs_op("JUMP_IF_TRUE_OR_POP", 112);
    b.jabs_op("JUMP_ABSOLUTE", 113);
    b.jabs_op("POP_JUMP_IF_FALSE", 114);
    b.jabs_op("POP_JUMP_IF_TRUE", 115);
    b.name_op("LOAD_GLOBAL", 116);
    b.jabs_op("CONTINUE_LOOP", 119);
    b.jrel_op("SETUP_LOOP", 120);
    b.jrel_op("SETUP_EXCEPT", 121);
    b.jrel_op("SETUP_FINALLY", 122);
    b.local_op("LOAD_FAST", 124);
    b.local_op("STORE_FAST", 125);
    b.local_op("DELETE_FAST", 126);
    b.name_op("STORE_ANNOTATION", 127);
    b.def_op("RAISE_VARARGS", 130);
    b.def_op("CALL_FUNCTION", 131);
    b.def_op("MAKE_FUNCTION", 132);
    b.def_op("BUILD_SLICE", 133);
    b.free_op("LOAD_CLOSURE", 135);
    b.free_op("LOAD_DEREF", 136);
    b.free_op("STORE_DEREF", 137);
    b.free_op("DELETE_DEREF", 138);
    b.def_op("CALL_FUNCTION_KW", 141);
    b.def_op("CALL_FUNCTION_EX", 142);
    b.jrel_op("SETUP_WITH", 143);
    b.def_op("EXTENDED_ARG", 144);
    b.def_op("LIST_APPEND", 145);
    b.def_op("SET_ADD", 146);
    b.def_op("MAP_ADD", 147);
    b.free_op("LOAD_CLASSDEREF", 148);
    b.def_op("BUILD_LIST_UNPACK", 149);
    b.def_op("BUILD_MAP_UNPACK", 150);
    b.def_op("BUILD_MAP_UNPACK_WITH_CALL", 151);
    b.def_op("BUILD_TUPLE_UNPACK", 152);
    b.def_op("BUILD_SET_UNPACK", 153);
    b.jrel_op("SETUP_ASYNC_WITH", 154);
    b.def_op("FORMAT_VALUE", 155);
    b.def_op("BUILD_CONST_KEY_MAP", 156);
    b.def_op("BUILD_STRING", 157);
    b.def_op("BUILD_TUPLE_UNPACK_WITH_CALL", 158);

    b.set_extended_arg(144);
    Ok(())
}
