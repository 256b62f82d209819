//! pypy.rs — Surcouche de la variante PyPy.
//!
//! PyPy garde la numérotation CPython et ajoute quelques opcodes à lui,
//! dont le couple LOOKUP_METHOD / CALL_METHOD qui court-circuite la
//! création de méthodes liées.

use crate::version::PyVersion;

use super::{TableBuilder, TableError};

pub(super) fn install(b: &mut TableBuilder, version: PyVersion) -> Result<(), TableError> {
    if version < PyVersion::V36 {
        b.name_op("LOOKUP_METHOD", 201);
        b.def_op("CALL_METHOD", 202);
        b.def_op("BUILD_LIST_FROM_ARG", 203);
        b.jabs_op("JUMP_IF_NOT_DEBUG", 204);
    } else if version < PyVersion::V311 {
        // 3.7+ définit déjà LOAD_METHOD/CALL_METHOD ; PyPy garde en plus
        // son JUMP_IF_NOT_DEBUG et la construction de liste monoargument.
        b.def_op("BUILD_LIST_FROM_ARG", 200);
        b.jabs_op("JUMP_IF_NOT_DEBUG", 204);
        if version < PyVersion::V37 {
            b.name_op("LOOKUP_METHOD", 201);
            b.def_op("CALL_METHOD", 202);
        }
    }
    Ok(())
}
