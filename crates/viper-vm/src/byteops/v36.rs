//! v36.rs — Surcharges et ajouts 3.6 : wordcode, MAKE_FUNCTION à drapeaux,
//! CALL_FUNCTION_EX, f-strings, protocole with en deux temps.

use ahash::AHashMap;
use viper_core::PyVersion;

use crate::arith;
use crate::error::{VmError, VmResult};
use crate::frame::{BlockKind, FrameStatus, Why};
use crate::value::{gc, DictKey, Value};
use crate::vm::{Decoded, PyVm};

use super::base::{build_function, cell_at, pop_closure_tuple, pop_code, raise_varargs_3x};
use super::{getattr, named_args_from_dict, unpack_to_vec, HandlerTable};

pub(super) fn install(t: &mut HandlerTable) {
    t.set("DUP_TOP_TWO", |vm, _| {
        let b = vm.top()?;
        let a = vm.peek(2)?;
        vm.push(a)?;
        vm.push(b)?;
        Ok(None)
    });

    // 3.5+ : BUILD_MAP dépile 2n éléments (clé, valeur).
    t.set("BUILD_MAP", |vm, d| {
        let n = d.arg()? as usize;
        let items = vm.popn(2 * n)?;
        let mut map = AHashMap::new();
        for pair in items.chunks(2) {
            map.insert(DictKey::from_value(&pair[0])?, pair[1].clone());
        }
        vm.push(Value::Dict(gc(map)))?;
        Ok(None)
    });
    t.set("BUILD_CONST_KEY_MAP", |vm, d| {
        let n = d.arg()? as usize;
        let keys = match vm.pop()? {
            Value::Tuple(t) => t,
            other => {
                return Err(VmError::Internal(format!(
                    "BUILD_CONST_KEY_MAP : tuple de clés attendu, trouvé {}",
                    other.type_name()
                )))
            }
        };
        let values = vm.popn(n)?;
        if keys.len() != n {
            return Err(VmError::Internal(
                "BUILD_CONST_KEY_MAP : clés et valeurs dépareillées".into(),
            ));
        }
        let mut map = AHashMap::new();
        for (k, v) in keys.iter().zip(values) {
            map.insert(DictKey::from_value(k)?, v);
        }
        vm.push(Value::Dict(gc(map)))?;
        Ok(None)
    });
    t.set("BUILD_STRING", |vm, d| {
        let parts = vm.popn(d.arg()? as usize)?;
        let mut out = String::new();
        for p in parts {
            match p {
                Value::Str(s) => out.push_str(&s),
                other => {
                    return Err(VmError::Internal(format!(
                        "BUILD_STRING : fragment non-chaîne {}",
                        other.type_name()
                    )))
                }
            }
        }
        vm.push(Value::str(out))?;
        Ok(None)
    });
    t.set("FORMAT_VALUE", |vm, d| {
        let flags = d.arg()?;
        let _spec = if flags & 0x04 != 0 {
            Some(vm.pop()?)
        } else {
            None
        };
        let v = vm.pop()?;
        let s = match flags & 0x03 {
            2 | 3 => v.repr(),
            _ => v.to_string(),
        };
        vm.push(Value::str(s))?;
        Ok(None)
    });

    // Familles *_UNPACK (3.5 à 3.8).
    t.set("BUILD_TUPLE_UNPACK", |vm, d| {
        let items = concat_iterables(vm, d.arg()? as usize)?;
        vm.push(Value::tuple(items))?;
        Ok(None)
    });
    t.set("BUILD_TUPLE_UNPACK_WITH_CALL", |vm, d| {
        let items = concat_iterables(vm, d.arg()? as usize)?;
        vm.push(Value::tuple(items))?;
        Ok(None)
    });
    t.set("BUILD_LIST_UNPACK", |vm, d| {
        let items = concat_iterables(vm, d.arg()? as usize)?;
        vm.push(Value::list(items))?;
        Ok(None)
    });
    t.set("BUILD_SET_UNPACK", |vm, d| {
        let items = concat_iterables(vm, d.arg()? as usize)?;
        let mut set = ahash::AHashSet::new();
        for v in &items {
            set.insert(DictKey::from_value(v)?);
        }
        vm.push(Value::Set(gc(set)))?;
        Ok(None)
    });
    t.set("BUILD_MAP_UNPACK", build_map_unpack);
    t.set("BUILD_MAP_UNPACK_WITH_CALL", build_map_unpack);

    t.set("UNPACK_EX", |vm, d| {
        let arg = d.arg()?;
        let (before, after) = ((arg & 0xFF) as usize, (arg >> 8) as usize);
        let seq = vm.pop()?;
        let items = unpack_to_vec(vm, &seq)?;
        if items.len() < before + after {
            return Err(VmError::user(
                "ValueError",
                format!(
                    "not enough values to unpack (expected at least {}, got {})",
                    before + after,
                    items.len()
                ),
            ));
        }
        let star: Vec<Value> = items[before..items.len() - after].to_vec();
        for v in items[items.len() - after..].iter().rev() {
            vm.push(v.clone())?;
        }
        vm.push(Value::list(star))?;
        for v in items[..before].iter().rev() {
            vm.push(v.clone())?;
        }
        Ok(None)
    });

    // ----- Annotations -----
    t.set("SETUP_ANNOTATIONS", |vm, _| {
        let frame = vm.current_frame()?;
        let locals = frame.borrow().locals.clone();
        let mut ns = locals.borrow_mut();
        if !ns.contains_key("__annotations__") {
            ns.insert(
                "__annotations__".to_string(),
                Value::Dict(gc(AHashMap::new())),
            );
        }
        Ok(None)
    });
    t.set("STORE_ANNOTATION", |vm, d| {
        let name = d.name_arg()?.to_string();
        let v = vm.pop()?;
        let frame = vm.current_frame()?;
        let locals = frame.borrow().locals.clone();
        let ann = locals.borrow().get("__annotations__").cloned();
        match ann {
            Some(dict @ Value::Dict(_)) => {
                arith::store_subscr(&dict, &Value::str(name), v)?;
                Ok(None)
            }
            _ => Err(name_missing_annotations()),
        }
    });

    // ----- Cellules -----
    t.set("DELETE_DEREF", |vm, d| {
        let cell = cell_at(vm, d)?;
        *cell.borrow_mut() = Value::Null;
        Ok(None)
    });

    // ----- raise / except (3.x) -----
    t.set("RAISE_VARARGS", raise_varargs_3x);
    t.set("POP_EXCEPT", |vm, _| {
        let block = vm.pop_block()?;
        if block.kind != BlockKind::ExceptHandler {
            return Err(VmError::Internal(
                "POP_EXCEPT sans bloc except-handler".into(),
            ));
        }
        vm.unwind_block(&block)?;
        Ok(None)
    });

    // ----- yield from -----
    t.set("GET_YIELD_FROM_ITER", |vm, _| {
        let v = vm.pop()?;
        let it = super::make_iterator(v)?;
        vm.push(it)?;
        Ok(None)
    });
    t.set("YIELD_FROM", |vm, _| {
        let sent = vm.pop()?;
        let delegate = vm.top()?;
        let next = match &delegate {
            Value::Generator(g) => vm.resume_generator(g, sent)?,
            Value::Iter(it) => it.borrow_mut().advance(),
            other => {
                return Err(VmError::user(
                    "TypeError",
                    format!("cannot 'yield from' a '{}' object", other.type_name()),
                ))
            }
        };
        match next {
            Some(v) => {
                vm.return_value = v;
                let frame = vm.current_frame()?;
                let mut f = frame.borrow_mut();
                // Rejouer YIELD_FROM à la reprise : on recule d'une
                // instruction, l'avance du fetch nous y ramènera.
                f.lasti -= 2;
                f.status = FrameStatus::Suspended;
                Ok(Some(Why::Yield))
            }
            None => {
                vm.pop()?;
                let ret = match &delegate {
                    Value::Generator(g) => g.borrow().return_value.clone(),
                    _ => Value::None,
                };
                vm.push(ret)?;
                Ok(None)
            }
        }
    });

    // ----- with (3.x) : bloc finally + nettoyage en deux temps -----
    t.set("SETUP_WITH", |vm, d| {
        let mgr = vm.pop()?;
        let exit = getattr(&mgr, "__exit__")?;
        vm.push(exit)?;
        let enter = getattr(&mgr, "__enter__")?;
        let res = vm.call_value(enter, vec![], AHashMap::new())?;
        vm.push_block(BlockKind::Finally, d.jump_target()?)?;
        vm.push(res)?;
        Ok(None)
    });
    t.set("WITH_CLEANUP_START", with_cleanup_start);
    t.set("WITH_CLEANUP_FINISH", |vm, _| {
        let exit_ret = vm.pop()?;
        let u = vm.pop()?;
        if !matches!(u, Value::None) && exit_ret.truthy() {
            vm.push(Value::Why(Why::Silenced))?;
        }
        Ok(None)
    });

    // ----- Appels -----
    t.set("CALL_FUNCTION", |vm, d| {
        let argc = d.arg()? as usize;
        let pos = vm.popn(argc)?;
        let func = vm.pop()?;
        let ret = vm.call_value(func, pos, AHashMap::new())?;
        vm.push(ret)?;
        Ok(None)
    });
    t.set("CALL_FUNCTION_KW", |vm, d| {
        let argc = d.arg()? as usize;
        let names = match vm.pop()? {
            Value::Tuple(t) => t,
            other => {
                return Err(VmError::Internal(format!(
                    "CALL_FUNCTION_KW : tuple de noms attendu, trouvé {}",
                    other.type_name()
                )))
            }
        };
        let mut vals = vm.popn(argc)?;
        let func = vm.pop()?;
        let split = vals.len().checked_sub(names.len()).ok_or_else(|| {
            VmError::Internal("CALL_FUNCTION_KW : plus de noms que de valeurs".into())
        })?;
        let kw_vals = vals.split_off(split);
        let mut named = AHashMap::new();
        for (k, v) in names.iter().zip(kw_vals) {
            match k {
                Value::Str(s) => {
                    named.insert(s.to_string(), v);
                }
                other => {
                    return Err(VmError::Internal(format!(
                        "CALL_FUNCTION_KW : nom non-chaîne {}",
                        other.type_name()
                    )))
                }
            }
        }
        let ret = vm.call_value(func, vals, named)?;
        vm.push(ret)?;
        Ok(None)
    });
    t.set("CALL_FUNCTION_EX", |vm, d| {
        let flags = d.arg()?;
        let named = if flags & 0x01 != 0 {
            let kw = vm.pop()?;
            named_args_from_dict(&kw)?
        } else {
            AHashMap::new()
        };
        let args_val = vm.pop()?;
        let pos = unpack_to_vec(vm, &args_val)?;
        let func = vm.pop()?;
        // 3.11 glisse un NULL sous le callable.
        if vm.version >= PyVersion::V311 {
            if let Ok(Value::Null) = vm.top() {
                vm.pop()?;
            }
        }
        let ret = vm.call_value(func, pos, named)?;
        vm.push(ret)?;
        Ok(None)
    });

    t.set("MAKE_FUNCTION", |vm, d| make_function_flags(vm, d, true));
}

/// MAKE_FUNCTION 3.6+ : drapeaux 0x01 defaults, 0x02 kwdefaults,
/// 0x04 annotations, 0x08 closure, dépilés du plus fort au plus faible.
/// 3.11 n'empile plus le nom qualifié.
pub(super) fn make_function_flags(
    vm: &mut PyVm,
    d: &Decoded,
    pop_qualname: bool,
) -> VmResult<Option<Why>> {
    let flags = d.arg()?;
    let qualname = if pop_qualname {
        match vm.pop()? {
            Value::Str(s) => Some(s.to_string()),
            other => {
                return Err(VmError::Internal(format!(
                    "MAKE_FUNCTION : nom qualifié attendu, trouvé {}",
                    other.type_name()
                )))
            }
        }
    } else {
        None
    };
    let code = pop_code(vm)?;
    let closure = if flags & 0x08 != 0 {
        pop_closure_tuple(vm)?
    } else {
        vec![]
    };
    let annotations = if flags & 0x04 != 0 {
        annotations_map(vm.pop()?)?
    } else {
        AHashMap::new()
    };
    let kwdefaults = if flags & 0x02 != 0 {
        let kw = vm.pop()?;
        named_args_from_dict(&kw)?
    } else {
        AHashMap::new()
    };
    let defaults = if flags & 0x01 != 0 {
        match vm.pop()? {
            Value::Tuple(t) => t.to_vec(),
            other => {
                return Err(VmError::Internal(format!(
                    "MAKE_FUNCTION : tuple de defaults attendu, trouvé {}",
                    other.type_name()
                )))
            }
        }
    } else {
        vec![]
    };
    let f = build_function(vm, code, qualname, defaults, kwdefaults, annotations, closure)?;
    vm.push(f)?;
    Ok(None)
}

/// Annotations : tuple plat (nom, valeur, …) ou dict, selon la version.
fn annotations_map(v: Value) -> VmResult<AHashMap<String, Value>> {
    let mut out = AHashMap::new();
    match v {
        Value::Tuple(items) => {
            for pair in items.chunks(2) {
                if let [Value::Str(k), v] = pair {
                    out.insert(k.to_string(), v.clone());
                }
            }
            Ok(out)
        }
        dict @ Value::Dict(_) => named_args_from_dict(&dict),
        other => Err(VmError::Internal(format!(
            "annotations : tuple ou dict attendu, trouvé {}",
            other.type_name()
        ))),
    }
}

fn concat_iterables(vm: &mut PyVm, n: usize) -> VmResult<Vec<Value>> {
    let parts = vm.popn(n)?;
    let mut out = Vec::new();
    for p in &parts {
        out.extend(unpack_to_vec(vm, p)?);
    }
    Ok(out)
}

fn build_map_unpack(vm: &mut PyVm, d: &Decoded) -> VmResult<Option<Why>> {
    let parts = vm.popn(d.arg()? as usize)?;
    let mut map = AHashMap::new();
    for p in &parts {
        match p {
            Value::Dict(src) => {
                for (k, v) in src.borrow().iter() {
                    map.insert(k.clone(), v.clone());
                }
            }
            other => {
                return Err(VmError::user(
                    "TypeError",
                    format!("'{}' object is not a mapping", other.type_name()),
                ))
            }
        }
    }
    vm.push(Value::Dict(gc(map)))?;
    Ok(None)
}

/// WITH_CLEANUP_START : prépare l'appel d'`__exit__` selon l'état au
/// sommet (sortie normale, marqueur d'unwinding, ou triple d'exception).
fn with_cleanup_start(vm: &mut PyVm, _d: &Decoded) -> VmResult<Option<Why>> {
    let top = vm.top()?;
    let (u, v, w, exit_func) = match top {
        Value::None => {
            let exit = vm.pop_at(2)?;
            (Value::None, Value::None, Value::None, exit)
        }
        Value::Why(why) => {
            let exit = if matches!(why, Why::Return | Why::Continue) {
                vm.pop_at(3)?
            } else {
                vm.pop_at(2)?
            };
            (Value::None, Value::None, Value::None, exit)
        }
        Value::ExcType(_) => {
            // [exit, tb2, val2, type2, tb1, val1, type1] : deux triples
            // empilés par le moteur d'unwinding.
            let newer = vm.popn(3)?;
            let older = vm.popn(3)?;
            let exit = vm.pop()?;
            for x in older {
                vm.push(x)?;
            }
            vm.push(Value::None)?;
            for x in &newer {
                vm.push(x.clone())?;
            }
            let block = vm.pop_block()?;
            if block.kind != BlockKind::ExceptHandler {
                return Err(VmError::Internal(
                    "WITH_CLEANUP_START sans bloc except-handler".into(),
                ));
            }
            vm.push_block_at_level(block.kind, block.handler, block.level.saturating_sub(1))?;
            (
                newer[2].clone(),
                newer[1].clone(),
                newer[0].clone(),
                exit,
            )
        }
        other => {
            return Err(VmError::Internal(format!(
                "WITH_CLEANUP_START confus : {other:?}"
            )))
        }
    };
    let exit_ret = vm.call_value(exit_func, vec![u.clone(), v, w], AHashMap::new())?;
    vm.push(u)?;
    vm.push(exit_ret)?;
    Ok(None)
}

fn name_missing_annotations() -> VmError {
    VmError::user("NameError", "__annotations__ not found")
}
