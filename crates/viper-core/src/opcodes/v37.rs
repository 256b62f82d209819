//! v37.rs — Diff 3.6 → 3.7 : appels de méthode en deux temps.

use super::{TableBuilder, TableError};

pub(super) fn install(b: &mut TableBuilder) -> Result<(), TableError> {
    b.rm_op("STORE_ANNOTATION", 127)?;
    b.name_op("LOAD_METHOD", 160);
    b.def_op("CALL_METHOD", 161);
    Ok(())
}
