//! pypy.rs — Surcouche de handlers de la variante PyPy.

use crate::value::Value;

use super::v37::{call_method, load_method};
use super::HandlerTable;

pub(super) fn install(t: &mut HandlerTable) {
    // Même logique d'attribut que LOAD_ATTR, mais deux slots empilés ;
    // on réutilise la paire LOAD_METHOD / CALL_METHOD.
    t.set("LOOKUP_METHOD", load_method);
    t.set("CALL_METHOD", call_method);

    t.set("BUILD_LIST_FROM_ARG", |vm, d| {
        // BUILD_LIST suivi de ROT_TWO : la liste neuve glisse sous TOS.
        let items = vm.popn(d.arg()? as usize)?;
        let under = vm.pop()?;
        vm.push(Value::list(items))?;
        vm.push(under)?;
        Ok(None)
    });

    // Mode debug jamais actif dans cette VM : saut systématique.
    t.set("JUMP_IF_NOT_DEBUG", |vm, d| {
        vm.jump(d.jump_target()?)?;
        Ok(None)
    });
}
