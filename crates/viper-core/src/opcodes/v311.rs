//! v311.rs — Table 3.11, définie de zéro.
//!
//! Renumérotation massive : arithmétique binaire fusionnée dans BINARY_OP
//! (l'immédiat indexe une table de sous-opérations), protocole d'appel
//! PUSH_NULL / KW_NAMES / PRECALL / CALL, sauts tous relatifs avec une
//! famille arrière distincte, CACHE intercalé par le compilateur.

use super::{TableBuilder, TableError, CMP_OP_SHORT};

/// Table des sous-opérations de BINARY_OP, indexée par l'immédiat.
/// Les noms recoupent ceux des dispatchers d'opérateurs binaires/inplace.
pub const NB_OPS: &[&str] = &[
    "ADD",
    "AND",
    "FLOOR_DIVIDE",
    "LSHIFT",
    "MATRIX_MULTIPLY",
    "MULTIPLY",
    "REMAINDER",
    "OR",
    "POWER",
    "RSHIFT",
    "SUBTRACT",
    "TRUE_DIVIDE",
    "XOR",
    "INPLACE_ADD",
    "INPLACE_AND",
    "INPLACE_FLOOR_DIVIDE",
    "INPLACE_LSHIFT",
    "INPLACE_MATRIX_MULTIPLY",
    "INPLACE_MULTIPLY",
    "INPLACE_REMAINDER",
    "INPLACE_OR",
    "INPLACE_POWER",
    "INPLACE_RSHIFT",
    "INPLACE_SUBTRACT",
    "INPLACE_TRUE_DIVIDE",
    "INPLACE_XOR",
];

pub(super) fn install(b: &mut TableBuilder) -> Result<(), TableError> {
    b.def_op("CACHE", 0);
    b.def_op("POP_TOP", 1);
    b.def_op("PUSH_NULL", 2);
    b.def_op("NOP", 9);
    b.def_op("UNARY_POSITIVE", 10);
    b.def_op("UNARY_NEGATIVE", 11);
    b.def_op("UNARY_NOT", 12);
    b.def_op("UNARY_INVERT", 15);
    b.def_op("BINARY_SUBSCR", 25);

    b.def_op("GET_LEN", 30);
    b.def_op("MATCH_MAPPING", 31);
    b.def_op("MATCH_SEQUENCE", 32);
    b.def_op("MATCH_KEYS", 33);
    b.def_op("PUSH_EXC_INFO", 35);
    b.def_op("CHECK_EXC_MATCH", 36);
    b.def_op("CHECK_EG_MATCH", 37);

    b.def_op("WITH_EXCEPT_START", 49);
    b.def_op("GET_AITER", 50);
    b.def_op("GET_ANEXT", 51);
    b.def_op("BEFORE_ASYNC_WITH", 52);
    b.def_op("BEFORE_WITH", 53);
    b.def_op("END_ASYNC_FOR", 54);

    b.def_op("STORE_SUBSCR", 60);
    b.def_op("DELETE_SUBSCR", 61);
    b.def_op("GET_ITER", 68);
    b.def_op("GET_YIELD_FROM_ITER", 69);
    b.def_op("PRINT_EXPR", 70);
    b.def_op("LOAD_BUILD_CLASS", 71);
    b.def_op("LOAD_ASSERTION_ERROR", 74);
    b.def_op("RETURN_GENERATOR", 75);
    b.def_op("LIST_TO_TUPLE", 82);
    b.def_op("RETURN_VALUE", 83);
    b.def_op("IMPORT_STAR", 84);
    b.def_op("SETUP_ANNOTATIONS", 85);
    b.def_op("YIELD_VALUE", 86);
    b.def_op("ASYNC_GEN_WRAP", 87);
    b.def_op("PREP_RERAISE_STAR", 88);
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
    b.def_op("SWAP", 99);
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
    b.jrel_op("JUMP_IF_FALSE_OR_POP", 111);
    b.jrel_op("JUMP_IF_TRUE_OR_POP", 112);
    b.jrel_op("POP_JUMP_FORWARD_IF_FALSE", 114);
    b.jrel_op("POP_JUMP_FORWARD_IF_TRUE", 115);
    b.name_op("LOAD_GLOBAL", 116);
    b.def_op("IS_OP", 117);
    b.def_op("CONTAINS_OP", 118);
    b.def_op("RERAISE", 119);
    b.def_op("COPY", 120);
    b.def_op("BINARY_OP", 122);
    b.jrel_op("SEND", 123);
    b.local_op("LOAD_FAST", 124);
    b.local_op("STORE_FAST", 125);
    b.local_op("DELETE_FAST", 126);
    b.jrel_op("POP_JUMP_FORWARD_IF_NOT_NONE", 128);
    b.jrel_op("POP_JUMP_FORWARD_IF_NONE", 129);
    b.def_op("RAISE_VARARGS", 130);
    b.def_op("GET_AWAITABLE", 131);
    b.def_op("MAKE_FUNCTION", 132);
    b.def_op("BUILD_SLICE", 133);
    b.jrel_back_op("JUMP_BACKWARD_NO_INTERRUPT", 134);
    b.free_op("MAKE_CELL", 135);
    b.free_op("LOAD_CLOSURE", 136);
    b.free_op("LOAD_DEREF", 137);
    b.free_op("STORE_DEREF", 138);
    b.free_op("DELETE_DEREF", 139);
    b.jrel_back_op("JUMP_BACKWARD", 140);
    b.def_op("CALL_FUNCTION_EX", 142);
    b.def_op("EXTENDED_ARG", 144);
    b.def_op("LIST_APPEND", 145);
    b.def_op("SET_ADD", 146);
    b.def_op("MAP_ADD", 147);
    b.free_op("LOAD_CLASSDEREF", 148);
    b.def_op("COPY_FREE_VARS", 149);
    b.def_op("RESUME", 151);
    b.def_op("MATCH_CLASS", 152);
    b.def_op("FORMAT_VALUE", 155);
    b.def_op("BUILD_CONST_KEY_MAP", 156);
    b.def_op("BUILD_STRING", 157);
    b.name_op("LOAD_METHOD", 160);
    b.def_op("LIST_EXTEND", 162);
    b.def_op("SET_UPDATE", 163);
    b.def_op("DICT_MERGE", 164);
    b.def_op("DICT_UPDATE", 165);
    b.def_op("PRECALL", 166);
    b.def_op("CALL", 171);
    b.const_op("KW_NAMES", 172);
    b.jrel_back_op("POP_JUMP_BACKWARD_IF_NOT_NONE", 173);
    b.jrel_back_op("POP_JUMP_BACKWARD_IF_NONE", 174);
    b.jrel_back_op("POP_JUMP_BACKWARD_IF_FALSE", 175);
    b.jrel_back_op("POP_JUMP_BACKWARD_IF_TRUE", 176);

    b.set_extended_arg(144);
    b.set_cmp_op(CMP_OP_SHORT);
    Ok(())
}
