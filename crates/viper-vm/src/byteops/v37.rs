//! v37.rs — Ajouts 3.7 : appels de méthode en deux temps.

use ahash::AHashMap;

use crate::error::VmResult;
use crate::frame::Why;
use crate::value::Value;
use crate::vm::{Decoded, PyVm};

use super::{getattr, HandlerTable};

pub(super) fn install(t: &mut HandlerTable) {
    t.set("LOAD_METHOD", load_method);
    t.set("CALL_METHOD", call_method);
}

/// Empile soit `(méthode, receveur)`, soit `(NULL, attribut)` quand la
/// résolution ne donne pas un appelable à lier.
pub(super) fn load_method(vm: &mut PyVm, d: &Decoded) -> VmResult<Option<Why>> {
    let obj = vm.pop()?;
    let attr = getattr(&obj, d.name_arg()?)?;
    match attr {
        m @ (Value::Function(_) | Value::Native(_)) => {
            vm.push(m)?;
            vm.push(obj)?;
        }
        other => {
            vm.push(Value::Null)?;
            vm.push(other)?;
        }
    }
    Ok(None)
}

/// Pendant de LOAD_METHOD : appelle la méthode liée, receveur en premier
/// argument, ou l'attribut nu si NULL est dessous.
pub(super) fn call_method(vm: &mut PyVm, d: &Decoded) -> VmResult<Option<Why>> {
    let args = vm.popn(d.arg()? as usize)?;
    let b = vm.pop()?;
    let a = vm.pop()?;
    let ret = match a {
        Value::Null => vm.call_value(b, args, AHashMap::new())?,
        method => {
            let mut full = Vec::with_capacity(args.len() + 1);
            full.push(b);
            full.extend(args);
            vm.call_value(method, full, AHashMap::new())?
        }
    };
    vm.push(ret)?;
    Ok(None)
}
