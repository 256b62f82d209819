//! v38.rs — Surcharges 3.8 : les boucles perdent leurs blocs, le
//! protocole finally passe par BEGIN_FINALLY / CALL_FINALLY / POP_FINALLY,
//! END_FINALLY apprend les adresses de retour entières.

use crate::error::{VmError, VmResult};
use crate::frame::{BlockKind, Why};
use crate::value::Value;
use crate::vm::{Decoded, PyVm};

use super::HandlerTable;

pub(super) fn install(t: &mut HandlerTable) {
    t.set("BEGIN_FINALLY", |vm, _| {
        vm.push(Value::None)?;
        Ok(None)
    });
    t.set("CALL_FINALLY", |vm, d| {
        // Adresse de reprise empilée ; END_FINALLY y resautera.
        let frame = vm.current_frame()?;
        let resume = {
            let f = frame.borrow();
            f.lasti as usize + vm.table.instruction_size(d.opcode)
        };
        vm.push(Value::Int(resume as i64))?;
        vm.jump(d.jump_target()?)?;
        Ok(None)
    });
    t.set("POP_FINALLY", pop_finally);
    t.set("END_FINALLY", end_finally_38);

    // 3.8 : la valeur passe au-dessus de la clé.
    t.set("MAP_ADD", |vm, d| {
        let value = vm.pop()?;
        let key = vm.pop()?;
        let target = vm.peek(d.arg()? as usize)?;
        crate::arith::store_subscr(&target, &key, value)?;
        Ok(None)
    });
}

/// END_FINALLY 3.8 : marqueurs hérités, plus l'adresse de retour entière
/// posée par CALL_FINALLY.
fn end_finally_38(vm: &mut PyVm, _d: &Decoded) -> VmResult<Option<Why>> {
    let v = vm.pop()?;
    match v {
        Value::None => Ok(None),
        Value::Int(addr) if addr >= 0 => {
            vm.jump(addr as usize)?;
            Ok(None)
        }
        Value::Why(w) => {
            if matches!(w, Why::Return | Why::Continue) {
                vm.return_value = vm.pop()?;
            }
            Ok(Some(w))
        }
        Value::ExcType(ty) => {
            let val = vm.pop()?;
            let tb = vm.pop()?;
            vm.last_traceback = match &tb {
                Value::Traceback(t) => Some(t.clone()),
                _ => None,
            };
            vm.last_exception = Some((Value::ExcType(ty), val, tb));
            Ok(Some(Why::Reraise))
        }
        other => Err(VmError::Internal(format!(
            "END_FINALLY confus : {other:?}"
        ))),
    }
}

/// POP_FINALLY : purge l'état posé pour le bloc finally ; `preserve_tos`
/// garde la valeur au sommet (résultat d'expression du bloc).
fn pop_finally(vm: &mut PyVm, d: &Decoded) -> VmResult<Option<Why>> {
    let preserve = d.arg()? != 0;
    let saved = if preserve { Some(vm.pop()?) } else { None };
    let v = vm.pop()?;
    match v {
        Value::None | Value::Int(_) => {}
        Value::Why(w) => {
            if matches!(w, Why::Return | Why::Continue) {
                vm.return_value = vm.pop()?;
            }
        }
        Value::ExcType(_) => {
            vm.popn(2)?;
            let block = vm.pop_block()?;
            if block.kind != BlockKind::ExceptHandler {
                return Err(VmError::Internal(
                    "POP_FINALLY sans bloc except-handler".into(),
                ));
            }
            vm.unwind_block(&block)?;
        }
        other => {
            return Err(VmError::Internal(format!(
                "POP_FINALLY confus : {other:?}"
            )))
        }
    }
    if let Some(s) = saved {
        vm.push(s)?;
    }
    Ok(None)
}
