//! v39.rs — Diff 3.8 → 3.9.
//!
//! Le protocole finally redevient des sauts + RERAISE, les comparaisons
//! d'identité/appartenance/exception quittent COMPARE_OP pour des opcodes
//! dédiés, la famille BUILD_*_UNPACK devient LIST_EXTEND / SET_UPDATE /
//! DICT_MERGE / DICT_UPDATE.

use super::{TableBuilder, TableError, CMP_OP_SHORT};

pub(super) fn install(b: &mut TableBuilder) -> Result<(), TableError> {
    b.rm_op("BEGIN_FINALLY", 53)?;
    b.rm_op("WITH_CLEANUP_START", 81)?;
    b.rm_op("WITH_CLEANUP_FINISH", 82)?;
    b.rm_op("END_FINALLY", 88)?;
    b.rm_op("BUILD_LIST_UNPACK", 149)?;
    b.rm_op("BUILD_MAP_UNPACK", 150)?;
    b.rm_op("BUILD_MAP_UNPACK_WITH_CALL", 151)?;
    b.rm_op("BUILD_TUPLE_UNPACK", 152)?;
    b.rm_op("BUILD_SET_UNPACK", 153)?;
    b.rm_op("BUILD_TUPLE_UNPACK_WITH_CALL", 158)?;
    b.rm_op("CALL_FINALLY", 162)?;
    b.rm_op("POP_FINALLY", 163)?;

    b.def_op("RERAISE", 48);
    b.def_op("WITH_EXCEPT_START", 49);
    b.def_op("LOAD_ASSERTION_ERROR", 74);
    b.def_op("LIST_TO_TUPLE", 82);
    b.def_op("IS_OP", 117);
    b.def_op("CONTAINS_OP", 118);
    b.jabs_op("JUMP_IF_NOT_EXC_MATCH", 121);
    b.def_op("LIST_EXTEND", 162);
    b.def_op("SET_UPDATE", 163);
    b.def_op("DICT_MERGE", 164);
    b.def_op("DICT_UPDATE", 165);

    b.set_cmp_op(CMP_OP_SHORT);
    Ok(())
}
