//! v39.rs — Surcharges 3.9 : RERAISE remplace END_FINALLY, comparaisons
//! d'identité/appartenance dédiées, extensions de conteneurs en place,
//! WITH_EXCEPT_START.

use ahash::AHashMap;

use crate::arith;
use crate::error::{VmError, VmResult};
use crate::frame::Why;
use crate::object::ExcType;
use crate::value::{DictKey, Value};
use crate::vm::{Decoded, PyVm};

use super::{unpack_to_vec, HandlerTable};

pub(super) fn install(t: &mut HandlerTable) {
    t.set("RERAISE", |vm, _| {
        let ty = vm.pop()?;
        let val = vm.pop()?;
        let tb = vm.pop()?;
        vm.last_traceback = match &tb {
            Value::Traceback(t) => Some(t.clone()),
            _ => None,
        };
        vm.last_exception = Some((ty, val, tb));
        Ok(Some(Why::Reraise))
    });
    t.set("WITH_EXCEPT_START", |vm, _| {
        // [exit, tb1, val1, type1, tb2, val2, type2] : l'exit est enfoui
        // sous les deux triples d'exception.
        let ty = vm.peek(1)?;
        let val = vm.peek(2)?;
        let tb = vm.peek(3)?;
        let exit = vm.peek(7)?;
        let res = vm.call_value(exit, vec![ty, val, tb], AHashMap::new())?;
        vm.push(res)?;
        Ok(None)
    });
    t.set("LOAD_ASSERTION_ERROR", |vm, _| {
        vm.push(Value::ExcType(ExcType::builtin("AssertionError")))?;
        Ok(None)
    });
    t.set("LIST_TO_TUPLE", |vm, _| {
        let v = vm.pop()?;
        match v {
            Value::List(l) => {
                let items = l.borrow().clone();
                vm.push(Value::tuple(items))?;
                Ok(None)
            }
            other => Err(VmError::Internal(format!(
                "LIST_TO_TUPLE sur {}",
                other.type_name()
            ))),
        }
    });
    t.set("IS_OP", |vm, d| {
        let invert = d.arg()? != 0;
        let pair = vm.popn(2)?;
        let b = pair[0].py_is(&pair[1]) != invert;
        vm.push(Value::Bool(b))?;
        Ok(None)
    });
    t.set("CONTAINS_OP", |vm, d| {
        let invert = d.arg()? != 0;
        let pair = vm.popn(2)?;
        let b = arith::contains(&pair[1], &pair[0])? != invert;
        vm.push(Value::Bool(b))?;
        Ok(None)
    });
    t.set("JUMP_IF_NOT_EXC_MATCH", |vm, d| {
        let pair = vm.popn(2)?;
        if !arith::exception_match(&pair[0], &pair[1])? {
            vm.jump(d.jump_target()?)?;
        }
        Ok(None)
    });
    t.set("LIST_EXTEND", |vm, d| {
        let seq = vm.pop()?;
        let items = unpack_to_vec(vm, &seq)?;
        let target = vm.peek(d.arg()? as usize)?;
        match target {
            Value::List(l) => {
                l.borrow_mut().extend(items);
                Ok(None)
            }
            other => Err(VmError::Internal(format!(
                "LIST_EXTEND sur {}",
                other.type_name()
            ))),
        }
    });
    t.set("SET_UPDATE", |vm, d| {
        let seq = vm.pop()?;
        let items = unpack_to_vec(vm, &seq)?;
        let target = vm.peek(d.arg()? as usize)?;
        match target {
            Value::Set(s) => {
                let mut s = s.borrow_mut();
                for v in &items {
                    s.insert(DictKey::from_value(v)?);
                }
                Ok(None)
            }
            other => Err(VmError::Internal(format!(
                "SET_UPDATE sur {}",
                other.type_name()
            ))),
        }
    });
    t.set("DICT_UPDATE", dict_update);
    t.set("DICT_MERGE", dict_update);
}

fn dict_update(vm: &mut PyVm, d: &Decoded) -> VmResult<Option<Why>> {
    let src = vm.pop()?;
    let target = vm.peek(d.arg()? as usize)?;
    match (&target, &src) {
        (Value::Dict(dst), Value::Dict(src)) => {
            let src = src.borrow().clone();
            dst.borrow_mut().extend(src);
            Ok(None)
        }
        (Value::Dict(_), other) => Err(VmError::user(
            "TypeError",
            format!("'{}' object is not a mapping", other.type_name()),
        )),
        (other, _) => Err(VmError::Internal(format!(
            "DICT_UPDATE sur {}",
            other.type_name()
        ))),
    }
}
