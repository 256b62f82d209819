//! v310.rs — Ajouts 3.10 : famille match structurel, ROT_N, GEN_START.

use ahash::AHashMap;

use crate::error::{VmError, VmResult};
use crate::value::{gc, DictKey, Value};

use super::HandlerTable;

pub(super) fn install(t: &mut HandlerTable) {
    t.set("GET_LEN", |vm, _| {
        let v = vm.top()?;
        let len = v.py_len()?;
        vm.push(Value::Int(len as i64))?;
        Ok(None)
    });
    t.set("MATCH_MAPPING", |vm, _| {
        let is_map = matches!(vm.top()?, Value::Dict(_));
        vm.push(Value::Bool(is_map))?;
        Ok(None)
    });
    t.set("MATCH_SEQUENCE", |vm, _| {
        // Les chaînes ne sont pas des séquences pour match.
        let is_seq = matches!(vm.top()?, Value::List(_) | Value::Tuple(_));
        vm.push(Value::Bool(is_seq))?;
        Ok(None)
    });
    t.set("MATCH_KEYS", |vm, _| {
        let keys = vm.peek(1)?;
        let subject = vm.peek(2)?;
        let keys = match keys {
            Value::Tuple(t) => t,
            other => {
                return Err(VmError::Internal(format!(
                    "MATCH_KEYS : tuple attendu, trouvé {}",
                    other.type_name()
                )))
            }
        };
        let map = match subject {
            Value::Dict(d) => d,
            _ => {
                vm.push(Value::None)?;
                vm.push(Value::Bool(false))?;
                return Ok(None);
            }
        };
        let mut values = Vec::with_capacity(keys.len());
        for k in keys.iter() {
            let dk = DictKey::from_value(k)?;
            match map.borrow().get(&dk) {
                Some(v) => values.push(v.clone()),
                None => {
                    vm.push(Value::None)?;
                    vm.push(Value::Bool(false))?;
                    return Ok(None);
                }
            }
        }
        vm.push(Value::tuple(values))?;
        vm.push(Value::Bool(true))?;
        Ok(None)
    });
    t.set("COPY_DICT_WITHOUT_KEYS", |vm, _| {
        let keys = vm.pop()?;
        let subject = vm.top()?;
        let keys = match keys {
            Value::Tuple(t) => t,
            other => {
                return Err(VmError::Internal(format!(
                    "COPY_DICT_WITHOUT_KEYS : tuple attendu, trouvé {}",
                    other.type_name()
                )))
            }
        };
        let src = match subject {
            Value::Dict(d) => d,
            other => {
                return Err(VmError::Internal(format!(
                    "COPY_DICT_WITHOUT_KEYS sur {}",
                    other.type_name()
                )))
            }
        };
        let mut out = AHashMap::new();
        let excluded: Vec<DictKey> = keys
            .iter()
            .map(DictKey::from_value)
            .collect::<VmResult<_>>()?;
        for (k, v) in src.borrow().iter() {
            if !excluded.contains(k) {
                out.insert(k.clone(), v.clone());
            }
        }
        vm.push(Value::Dict(gc(out)))?;
        Ok(None)
    });
    t.set("ROT_N", |vm, d| {
        let n = d.arg()? as usize;
        let mut items = vm.popn(n)?;
        if let Some(top) = items.pop() {
            items.insert(0, top);
        }
        for v in items {
            vm.push(v)?;
        }
        Ok(None)
    });
    // Le protocole de reprise ne pousse rien au premier démarrage : le
    // marqueur de début de générateur n'a rien à dépiler ici.
    t.set("GEN_START", |_, _| Ok(None));
}

