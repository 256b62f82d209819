//! v310.rs — Diff 3.9 → 3.10 : famille match, sauts en unités de 2 octets.
//!
//! La multiplication des arguments de saut par l'unité est l'affaire du
//! décodeur (une seule fois), pas de la table.

use super::{TableBuilder, TableError};

pub(super) fn install(b: &mut TableBuilder) -> Result<(), TableError> {
    b.rm_op("RERAISE", 48)?;

    b.def_op("GET_LEN", 30);
    b.def_op("MATCH_MAPPING", 31);
    b.def_op("MATCH_SEQUENCE", 32);
    b.def_op("MATCH_KEYS", 33);
    b.def_op("COPY_DICT_WITHOUT_KEYS", 34);
    b.def_op("ROT_N", 99);
    b.def_op("RERAISE", 119);
    b.def_op("GEN_START", 129);
    b.def_op("MATCH_CLASS", 152);
    Ok(())
}
