//! v38.rs — Diff 3.7 → 3.8 : disparition des blocs de boucle.
//!
//! Le compilateur n'émet plus SETUP_LOOP / BREAK_LOOP / CONTINUE_LOOP ;
//! break et continue deviennent des sauts ordinaires, et le protocole
//! finally passe par BEGIN_FINALLY / CALL_FINALLY / POP_FINALLY.

use super::{TableBuilder, TableError};

pub(super) fn install(b: &mut TableBuilder) -> Result<(), TableError> {
    b.rm_op("BREAK_LOOP", 80)?;
    b.rm_op("CONTINUE_LOOP", 119)?;
    b.rm_op("SETUP_LOOP", 120)?;
    b.rm_op("SETUP_EXCEPT", 121)?;

    b.def_op("ROT_FOUR", 6);
    b.def_op("BEGIN_FINALLY", 53);
    b.def_op("END_ASYNC_FOR", 54);
    b.jrel_op("CALL_FINALLY", 162);
    b.def_op("POP_FINALLY", 163);
    Ok(())
}
