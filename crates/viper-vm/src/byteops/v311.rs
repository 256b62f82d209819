//! v311.rs — Surcharges et ajouts 3.11 : protocole d'appel PUSH_NULL /
//! KW_NAMES / PRECALL / CALL, COPY / SWAP, sauts arrière avec crochet
//! d'interruption, CHECK_EXC_MATCH et PUSH_EXC_INFO.

use ahash::AHashMap;

use crate::arith;
use crate::error::{VmError, VmResult};
use crate::frame::Why;
use crate::value::Value;
use crate::vm::{Decoded, PyVm};

use super::base::cell_at;
use super::v36::make_function_flags;
use super::{getattr, load_global, name_error, HandlerTable};

pub(super) fn install(t: &mut HandlerTable) {
    // Marqueurs sans effet : emplacement de cache et point de reprise.
    t.set("CACHE", |_, _| Ok(None));
    t.set("RESUME", |_, _| Ok(None));
    t.set("PRECALL", |_, _| Ok(None));

    t.set("PUSH_NULL", |vm, _| {
        vm.push(Value::Null)?;
        Ok(None)
    });
    t.set("COPY", |vm, d| {
        let v = vm.peek(d.arg()? as usize)?;
        vm.push(v)?;
        Ok(None)
    });
    t.set("SWAP", |vm, d| {
        let i = d.arg()? as usize;
        let tos = vm.top()?;
        let other = vm.peek(i)?;
        vm.set(i, tos)?;
        vm.set(1, other)?;
        Ok(None)
    });

    // ----- Protocole d'appel -----
    t.set("KW_NAMES", |vm, d| {
        let names = match d.const_arg()? {
            Value::Tuple(t) => t,
            other => {
                return Err(VmError::Internal(format!(
                    "KW_NAMES : tuple de chaînes attendu, trouvé {}",
                    other.type_name()
                )))
            }
        };
        let mut out = Vec::with_capacity(names.len());
        for n in names.iter() {
            match n {
                Value::Str(s) => out.push(s.to_string()),
                other => {
                    return Err(VmError::Internal(format!(
                        "KW_NAMES : nom non-chaîne {}",
                        other.type_name()
                    )))
                }
            }
        }
        vm.kw_names = out;
        Ok(None)
    });
    t.set("CALL", call_311);

    // ----- Globals avec bit NULL -----
    t.set("LOAD_GLOBAL", |vm, d| {
        if d.arg()? & 1 != 0 {
            vm.push(Value::Null)?;
        }
        let name = d.name_arg()?;
        let frame = vm.current_frame()?;
        match load_global(vm, &frame, name) {
            Some(v) => {
                vm.push(v)?;
                Ok(None)
            }
            None => Err(name_error(name)),
        }
    });

    // ----- Exceptions -----
    t.set("CHECK_EXC_MATCH", |vm, _| {
        let ty = vm.pop()?;
        let exc = vm.top()?;
        vm.push(Value::Bool(arith::exception_match(&exc, &ty)?))?;
        Ok(None)
    });
    t.set("PUSH_EXC_INFO", |vm, _| {
        let v = vm.pop()?;
        let current = match &vm.last_exception {
            Some((_, val, _)) => val.clone(),
            None => Value::None,
        };
        vm.push(current)?;
        vm.push(v)?;
        Ok(None)
    });
    // 3.11 : l'exception occupe un seul slot de pile.
    t.set("POP_EXCEPT", |vm, _| {
        vm.pop()?;
        Ok(None)
    });
    t.set("RERAISE", |vm, _| {
        let v = vm.pop()?;
        match v {
            Value::Exception(e) => {
                vm.last_exception = Some((
                    Value::ExcType(e.etype.clone()),
                    Value::Exception(e),
                    Value::None,
                ));
                Ok(Some(Why::Reraise))
            }
            other => Err(VmError::Internal(format!(
                "RERAISE : exception attendue, trouvé {}",
                other.type_name()
            ))),
        }
    });

    // ----- Sauts -----
    t.set("JUMP_BACKWARD", jump_backward);
    t.set("JUMP_BACKWARD_NO_INTERRUPT", |vm, d| {
        vm.jump(d.jump_target()?)?;
        Ok(None)
    });
    t.set("POP_JUMP_FORWARD_IF_TRUE", pop_jump_if_true);
    t.set("POP_JUMP_BACKWARD_IF_TRUE", pop_jump_if_true);
    t.set("POP_JUMP_FORWARD_IF_FALSE", pop_jump_if_false);
    t.set("POP_JUMP_BACKWARD_IF_FALSE", pop_jump_if_false);
    t.set("POP_JUMP_FORWARD_IF_NONE", pop_jump_if_none);
    t.set("POP_JUMP_BACKWARD_IF_NONE", pop_jump_if_none);
    t.set("POP_JUMP_FORWARD_IF_NOT_NONE", pop_jump_if_not_none);
    t.set("POP_JUMP_BACKWARD_IF_NOT_NONE", pop_jump_if_not_none);

    // ----- Fonctions et cellules -----
    t.set("MAKE_FUNCTION", |vm, d| make_function_flags(vm, d, false));
    // Les cellules sont allouées et la fermeture recopiée à la création
    // de frame ; ces deux marqueurs n'ont plus rien à faire ici.
    t.set("MAKE_CELL", |_, _| Ok(None));
    t.set("COPY_FREE_VARS", |_, _| Ok(None));
    t.set("RETURN_GENERATOR", |vm, _| {
        // Prologue des générateurs ; le POP_TOP qui suit consomme ceci.
        vm.push(Value::None)?;
        Ok(None)
    });
    t.set("LOAD_CLASSDEREF", |vm, d| {
        let cell = cell_at(vm, d)?;
        let v = cell.borrow().clone();
        match v {
            Value::Null => Err(name_error(d.name_arg().unwrap_or("?"))),
            v => {
                vm.push(v)?;
                Ok(None)
            }
        }
    });

    // ----- with -----
    t.set("BEFORE_WITH", |vm, _| {
        let mgr = vm.pop()?;
        let exit = getattr(&mgr, "__exit__")?;
        vm.push(exit)?;
        let enter = getattr(&mgr, "__enter__")?;
        let res = vm.call_value(enter, vec![], AHashMap::new())?;
        vm.push(res)?;
        Ok(None)
    });
}

/// CALL 3.11 : la pile porte soit `NULL | callable | args…`, soit
/// `callable | self | args…`. Les derniers arguments sont nommés d'après
/// le tuple posé par KW_NAMES.
fn call_311(vm: &mut PyVm, d: &Decoded) -> VmResult<Option<Why>> {
    let argc = d.arg()? as usize;
    let kw_names = std::mem::take(&mut vm.kw_names);
    let mut args = vm.popn(argc)?;
    let under = vm.pop()?;
    let second = vm.pop()?;
    let (callable, mut pos) = match second {
        Value::Null => (under, Vec::new()),
        method => {
            // Appel de méthode : le receveur devient premier positionnel.
            (method, vec![under])
        }
    };
    let mut named = AHashMap::new();
    if !kw_names.is_empty() {
        if kw_names.len() > args.len() {
            return Err(VmError::Internal(
                "CALL : plus de noms KW_NAMES que d'arguments".into(),
            ));
        }
        let kw_vals = args.split_off(args.len() - kw_names.len());
        for (k, v) in kw_names.into_iter().zip(kw_vals) {
            named.insert(k, v);
        }
    }
    pos.extend(args);
    let ret = vm.call_value(callable, pos, named)?;
    vm.push(ret)?;
    Ok(None)
}

fn jump_backward(vm: &mut PyVm, d: &Decoded) -> VmResult<Option<Why>> {
    // Crochet d'interruption réservé ; no-op sans handler hôte.
    if let Some(check) = vm.interrupt {
        if check() {
            return Err(VmError::user("KeyboardInterrupt", ""));
        }
    }
    vm.jump(d.jump_target()?)?;
    Ok(None)
}

fn pop_jump_if_true(vm: &mut PyVm, d: &Decoded) -> VmResult<Option<Why>> {
    let v = vm.pop()?;
    if v.truthy() {
        vm.jump(d.jump_target()?)?;
    }
    Ok(None)
}

fn pop_jump_if_false(vm: &mut PyVm, d: &Decoded) -> VmResult<Option<Why>> {
    let v = vm.pop()?;
    if !v.truthy() {
        vm.jump(d.jump_target()?)?;
    }
    Ok(None)
}

fn pop_jump_if_none(vm: &mut PyVm, d: &Decoded) -> VmResult<Option<Why>> {
    let v = vm.pop()?;
    if matches!(v, Value::None) {
        vm.jump(d.jump_target()?)?;
    }
    Ok(None)
}

fn pop_jump_if_not_none(vm: &mut PyVm, d: &Decoded) -> VmResult<Option<Why>> {
    let v = vm.pop()?;
    if !matches!(v, Value::None) {
        vm.jump(d.jump_target()?)?;
    }
    Ok(None)
}
