//! base.rs — Socle de handlers : sémantique 2.7.
//!
//! Les versions suivantes héritent de ce jeu et surchargent ce qui change.
//! Conventions : un handler lit la pile de la frame courante, rend
//! `Ok(None)` en sortie normale, ou un signal `Why`. Les exceptions du
//! programme partent en `Err(VmError::User(..))` et sont capturées par le
//! dispatch.

use std::rc::Rc;

use ahash::AHashMap;
use viper_core::CodeObject;

use crate::error::{VmError, VmResult};
use crate::frame::{BlockKind, FrameStatus, Why};
use crate::object::{ExcInstance, Function, COMPREHENSION_FN_NAMES};
use crate::value::{gc, DictKey, Gc, Value};
use crate::vm::{Decoded, PyVm};
use crate::arith;

use super::{
    delattr, do_raise, getattr, iter_next, load_global, load_name, make_iterator, name_error,
    named_args_from_dict, setattr, unbound_local, unpack_to_vec, HandlerTable,
};

pub(super) fn install(t: &mut HandlerTable) {
    // ----- Pile -----
    t.set("NOP", |_, _| Ok(None));
    t.set("POP_TOP", |vm, _| {
        vm.pop()?;
        Ok(None)
    });
    t.set("DUP_TOP", |vm, _| {
        let v = vm.top()?;
        vm.push(v)?;
        Ok(None)
    });
    t.set("DUP_TOPX", |vm, d| {
        let n = d.arg()? as usize;
        let items = vm.popn(n)?;
        for v in &items {
            vm.push(v.clone())?;
        }
        for v in items {
            vm.push(v)?;
        }
        Ok(None)
    });
    t.set("ROT_TWO", |vm, _| {
        let b = vm.pop()?;
        let a = vm.pop()?;
        vm.push(b)?;
        vm.push(a)?;
        Ok(None)
    });
    t.set("ROT_THREE", |vm, _| {
        let c = vm.pop()?;
        let b = vm.pop()?;
        let a = vm.pop()?;
        vm.push(c)?;
        vm.push(a)?;
        vm.push(b)?;
        Ok(None)
    });
    t.set("ROT_FOUR", |vm, _| {
        let d = vm.pop()?;
        let c = vm.pop()?;
        let b = vm.pop()?;
        let a = vm.pop()?;
        vm.push(d)?;
        vm.push(a)?;
        vm.push(b)?;
        vm.push(c)?;
        Ok(None)
    });

    // ----- Constantes et noms -----
    t.set("LOAD_CONST", |vm, d| {
        let v = d.const_arg()?;
        vm.push(v)?;
        Ok(None)
    });
    t.set("LOAD_NAME", |vm, d| {
        let name = d.name_arg()?;
        let frame = vm.current_frame()?;
        match load_name(vm, &frame, name) {
            Some(v) => {
                vm.push(v)?;
                Ok(None)
            }
            None => Err(name_error(name)),
        }
    });
    t.set("STORE_NAME", |vm, d| {
        let name = d.name_arg()?.to_string();
        let v = vm.pop()?;
        vm.current_frame()?.borrow().locals.borrow_mut().insert(name, v);
        Ok(None)
    });
    t.set("DELETE_NAME", |vm, d| {
        let name = d.name_arg()?;
        let frame = vm.current_frame()?;
        let removed = frame.borrow().locals.borrow_mut().remove(name);
        match removed {
            Some(_) => Ok(None),
            None => Err(name_error(name)),
        }
    });
    t.set("LOAD_GLOBAL", |vm, d| {
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
    t.set("STORE_GLOBAL", |vm, d| {
        let name = d.name_arg()?.to_string();
        let v = vm.pop()?;
        vm.current_frame()?
            .borrow()
            .globals
            .borrow_mut()
            .insert(name, v);
        Ok(None)
    });
    t.set("DELETE_GLOBAL", |vm, d| {
        let name = d.name_arg()?;
        let frame = vm.current_frame()?;
        let removed = frame.borrow().globals.borrow_mut().remove(name);
        match removed {
            Some(_) => Ok(None),
            None => Err(name_error(name)),
        }
    });
    t.set("LOAD_FAST", |vm, d| {
        let name = d.name_arg()?;
        let frame = vm.current_frame()?;
        let v = frame.borrow().locals.borrow().get(name).cloned();
        match v {
            Some(v) => {
                vm.push(v)?;
                Ok(None)
            }
            None => Err(unbound_local(name)),
        }
    });
    t.set("STORE_FAST", |vm, d| {
        let name = d.name_arg()?.to_string();
        let v = vm.pop()?;
        vm.current_frame()?.borrow().locals.borrow_mut().insert(name, v);
        Ok(None)
    });
    t.set("DELETE_FAST", |vm, d| {
        let name = d.name_arg()?;
        let frame = vm.current_frame()?;
        let removed = frame.borrow().locals.borrow_mut().remove(name);
        match removed {
            Some(_) => Ok(None),
            None => Err(unbound_local(name)),
        }
    });

    // ----- Cellules -----
    t.set("LOAD_DEREF", |vm, d| {
        let cell = cell_at(vm, d)?;
        let v = cell.borrow().clone();
        match v {
            Value::Null => Err(VmError::user(
                "NameError",
                format!(
                    "free variable '{}' referenced before assignment",
                    d.name_arg().unwrap_or("?")
                ),
            )),
            v => {
                vm.push(v)?;
                Ok(None)
            }
        }
    });
    t.set("STORE_DEREF", |vm, d| {
        let cell = cell_at(vm, d)?;
        let v = vm.pop()?;
        *cell.borrow_mut() = v;
        Ok(None)
    });
    t.set("LOAD_CLOSURE", |vm, d| {
        let cell = cell_at(vm, d)?;
        vm.push(Value::Cell(cell))?;
        Ok(None)
    });

    // ----- Attributs et indexation -----
    t.set("LOAD_ATTR", |vm, d| {
        let obj = vm.pop()?;
        let v = getattr(&obj, d.name_arg()?)?;
        vm.push(v)?;
        Ok(None)
    });
    t.set("STORE_ATTR", |vm, d| {
        let pair = vm.popn(2)?;
        setattr(&pair[1], d.name_arg()?, pair[0].clone())?;
        Ok(None)
    });
    t.set("DELETE_ATTR", |vm, d| {
        let obj = vm.pop()?;
        delattr(&obj, d.name_arg()?)?;
        Ok(None)
    });
    t.set("STORE_SUBSCR", |vm, _| {
        let three = vm.popn(3)?;
        arith::store_subscr(&three[1], &three[2], three[0].clone())?;
        Ok(None)
    });
    t.set("DELETE_SUBSCR", |vm, _| {
        let two = vm.popn(2)?;
        arith::delete_subscr(&two[0], &two[1])?;
        Ok(None)
    });

    // ----- Construction de conteneurs -----
    t.set("BUILD_TUPLE", |vm, d| {
        let items = vm.popn(d.arg()? as usize)?;
        vm.push(Value::tuple(items))?;
        Ok(None)
    });
    t.set("BUILD_LIST", |vm, d| {
        let items = vm.popn(d.arg()? as usize)?;
        vm.push(Value::list(items))?;
        Ok(None)
    });
    t.set("BUILD_SET", |vm, d| {
        let items = vm.popn(d.arg()? as usize)?;
        let mut set = ahash::AHashSet::new();
        for v in &items {
            set.insert(DictKey::from_value(v)?);
        }
        vm.push(Value::Set(gc(set)))?;
        Ok(None)
    });
    // 2.x : BUILD_MAP pousse un dict vide, STORE_MAP le remplit.
    t.set("BUILD_MAP", |vm, _| {
        vm.push(Value::Dict(gc(AHashMap::new())))?;
        Ok(None)
    });
    t.set("STORE_MAP", |vm, _| {
        let three = vm.popn(3)?;
        arith::store_subscr(&three[0], &three[2], three[1].clone())?;
        vm.push(three[0].clone())?;
        Ok(None)
    });
    t.set("BUILD_SLICE", |vm, d| {
        let n = d.arg()? as usize;
        if n == 2 {
            let two = vm.popn(2)?;
            vm.push(Value::Slice(Rc::new((
                two[0].clone(),
                two[1].clone(),
                Value::None,
            ))))?;
        } else if n == 3 {
            let three = vm.popn(3)?;
            vm.push(Value::Slice(Rc::new((
                three[0].clone(),
                three[1].clone(),
                three[2].clone(),
            ))))?;
        } else {
            return Err(VmError::Internal(format!("BUILD_SLICE {n}")));
        }
        Ok(None)
    });
    t.set("LIST_APPEND", |vm, d| {
        let v = vm.pop()?;
        let target = vm.peek(d.arg()? as usize)?;
        match target {
            Value::List(l) => {
                l.borrow_mut().push(v);
                Ok(None)
            }
            other => Err(VmError::Internal(format!(
                "LIST_APPEND sur {}",
                other.type_name()
            ))),
        }
    });
    t.set("SET_ADD", |vm, d| {
        let v = vm.pop()?;
        let target = vm.peek(d.arg()? as usize)?;
        match target {
            Value::Set(s) => {
                s.borrow_mut().insert(DictKey::from_value(&v)?);
                Ok(None)
            }
            other => Err(VmError::Internal(format!(
                "SET_ADD sur {}",
                other.type_name()
            ))),
        }
    });
    // 2.7 à 3.7 : la clé au sommet, la valeur dessous.
    t.set("MAP_ADD", |vm, d| {
        let key = vm.pop()?;
        let value = vm.pop()?;
        let target = vm.peek(d.arg()? as usize)?;
        arith::store_subscr(&target, &key, value)?;
        Ok(None)
    });
    t.set("UNPACK_SEQUENCE", |vm, d| {
        let n = d.arg()? as usize;
        let seq = vm.pop()?;
        let items = unpack_to_vec(vm, &seq)?;
        if items.len() != n {
            return Err(VmError::user(
                "ValueError",
                format!("expected {n} values to unpack, got {}", items.len()),
            ));
        }
        for v in items.into_iter().rev() {
            vm.push(v)?;
        }
        Ok(None)
    });

    // ----- Comparaisons -----
    t.set("COMPARE_OP", |vm, d| {
        let name = d.compare_arg()?;
        let pair = vm.popn(2)?;
        let out = arith::compare(name, &pair[0], &pair[1])?;
        vm.push(out)?;
        Ok(None)
    });

    // ----- Sauts -----
    t.set("JUMP_FORWARD", jump_to);
    t.set("JUMP_ABSOLUTE", jump_to);
    t.set("POP_JUMP_IF_TRUE", |vm, d| {
        let v = vm.pop()?;
        if v.truthy() {
            vm.jump(d.jump_target()?)?;
        }
        Ok(None)
    });
    t.set("POP_JUMP_IF_FALSE", |vm, d| {
        let v = vm.pop()?;
        if !v.truthy() {
            vm.jump(d.jump_target()?)?;
        }
        Ok(None)
    });
    t.set("JUMP_IF_TRUE_OR_POP", |vm, d| {
        if vm.top()?.truthy() {
            vm.jump(d.jump_target()?)?;
        } else {
            vm.pop()?;
        }
        Ok(None)
    });
    t.set("JUMP_IF_FALSE_OR_POP", |vm, d| {
        if !vm.top()?.truthy() {
            vm.jump(d.jump_target()?)?;
        } else {
            vm.pop()?;
        }
        Ok(None)
    });

    // ----- Blocs -----
    t.set("SETUP_LOOP", |vm, d| {
        vm.push_block(BlockKind::Loop, d.jump_target()?)?;
        Ok(None)
    });
    t.set("SETUP_EXCEPT", |vm, d| {
        vm.push_block(BlockKind::SetupExcept, d.jump_target()?)?;
        Ok(None)
    });
    t.set("SETUP_FINALLY", |vm, d| {
        vm.push_block(BlockKind::Finally, d.jump_target()?)?;
        Ok(None)
    });
    t.set("POP_BLOCK", |vm, _| {
        vm.pop_block()?;
        Ok(None)
    });
    t.set("BREAK_LOOP", |_, _| Ok(Some(Why::Break)));
    t.set("CONTINUE_LOOP", |vm, d| {
        // La cible voyage dans return_value jusqu'au bloc de boucle.
        vm.return_value = Value::Int(d.jump_target()? as i64);
        Ok(Some(Why::Continue))
    });
    t.set("END_FINALLY", end_finally_legacy);
    t.set("RAISE_VARARGS", |vm, d| {
        // 2.7 : raise [type [, value [, traceback]]]
        let argc = d.arg()?;
        let (mut exctype, mut val) = (Value::None, Value::None);
        match argc {
            0 => {
                return match vm.last_exception.clone() {
                    Some(_) => Ok(Some(Why::Reraise)),
                    None => Err(VmError::user("TypeError", "exceptions must be old-style classes or derived from BaseException")),
                }
            }
            1 => exctype = vm.pop()?,
            2 => {
                val = vm.pop()?;
                exctype = vm.pop()?;
            }
            3 => {
                let _tb = vm.pop()?;
                val = vm.pop()?;
                exctype = vm.pop()?;
            }
            n => return Err(VmError::Internal(format!("RAISE_VARARGS {n}"))),
        }
        let value = match (exctype, val) {
            (v @ Value::Exception(_), _) => v,
            (Value::ExcType(ty), Value::None) => Value::Exception(Rc::new(ExcInstance {
                etype: ty,
                args: vec![],
            })),
            (Value::ExcType(ty), v @ Value::Exception(_)) => {
                // raise Type, instance : l'instance gagne.
                let _ = ty;
                v
            }
            (Value::ExcType(ty), v) => Value::Exception(Rc::new(ExcInstance {
                etype: ty,
                args: vec![v],
            })),
            (other, _) => {
                return Err(VmError::user(
                    "TypeError",
                    format!(
                        "exceptions must be old-style classes or derived from BaseException, not {}",
                        other.type_name()
                    ),
                ))
            }
        };
        let etype = match &value {
            Value::Exception(e) => Value::ExcType(e.etype.clone()),
            _ => Value::None,
        };
        vm.last_exception = Some((etype, value, Value::None));
        Ok(Some(Why::Exception))
    });

    // ----- Itération, retour, yield -----
    t.set("GET_ITER", |vm, _| {
        let v = vm.pop()?;
        let it = make_iterator(v)?;
        vm.push(it)?;
        Ok(None)
    });
    t.set("FOR_ITER", |vm, d| {
        let it = vm.top()?;
        match iter_next(vm, &it)? {
            Some(v) => {
                vm.push(v)?;
                Ok(None)
            }
            None => {
                vm.pop()?;
                vm.jump(d.jump_target()?)?;
                Ok(None)
            }
        }
    });
    t.set("RETURN_VALUE", |vm, _| {
        vm.return_value = vm.pop()?;
        Ok(Some(Why::Return))
    });
    t.set("YIELD_VALUE", |vm, _| {
        vm.return_value = vm.pop()?;
        vm.current_frame()?.borrow_mut().status = FrameStatus::Suspended;
        Ok(Some(Why::Yield))
    });

    // ----- print (instruction 2.x) -----
    t.set("PRINT_ITEM", |vm, _| {
        let v = vm.pop()?;
        let text = format!("{v} ");
        vm.host().write(&text);
        Ok(None)
    });
    t.set("PRINT_ITEM_TO", |vm, _| {
        let _stream = vm.pop()?;
        let v = vm.pop()?;
        let text = format!("{v} ");
        vm.host().write(&text);
        Ok(None)
    });
    t.set("PRINT_NEWLINE", |vm, _| {
        vm.host().write("\n");
        Ok(None)
    });
    t.set("PRINT_NEWLINE_TO", |vm, _| {
        let _stream = vm.pop()?;
        vm.host().write("\n");
        Ok(None)
    });
    t.set("PRINT_EXPR", |vm, _| {
        let v = vm.pop()?;
        if !matches!(v, Value::None) {
            let text = format!("{}\n", v.repr());
            vm.host().write(&text);
        }
        Ok(None)
    });

    // ----- with (2.x) -----
    t.set("SETUP_WITH", |vm, d| {
        let mgr = vm.pop()?;
        let exit = getattr(&mgr, "__exit__")?;
        vm.push(exit)?;
        let enter = getattr(&mgr, "__enter__")?;
        let res = vm.call_value(enter, vec![], AHashMap::new())?;
        vm.push_block(BlockKind::With, d.jump_target()?)?;
        vm.push(res)?;
        Ok(None)
    });
    t.set("WITH_CLEANUP", with_cleanup_27);

    // ----- Appels et fabrication de fonctions -----
    t.set("CALL_FUNCTION", |vm, d| {
        let arg = d.arg()?;
        call_function_27(vm, arg & 0xFF, (arg >> 8) & 0xFF, None, None)
    });
    t.set("CALL_FUNCTION_VAR", |vm, d| {
        let arg = d.arg()?;
        let star = vm.pop()?;
        call_function_27(vm, arg & 0xFF, (arg >> 8) & 0xFF, Some(star), None)
    });
    t.set("CALL_FUNCTION_KW", |vm, d| {
        let arg = d.arg()?;
        let starkw = vm.pop()?;
        call_function_27(vm, arg & 0xFF, (arg >> 8) & 0xFF, None, Some(starkw))
    });
    t.set("CALL_FUNCTION_VAR_KW", |vm, d| {
        let arg = d.arg()?;
        let starkw = vm.pop()?;
        let star = vm.pop()?;
        call_function_27(vm, arg & 0xFF, (arg >> 8) & 0xFF, Some(star), Some(starkw))
    });
    t.set("MAKE_FUNCTION", |vm, d| {
        // 2.7 : argc = nombre de defaults, empilés sous le code.
        let code = pop_code(vm)?;
        let defaults = vm.popn(d.arg()? as usize)?;
        let f = build_function(vm, code, None, defaults, AHashMap::new(), AHashMap::new(), vec![])?;
        vm.push(f)?;
        Ok(None)
    });
    t.set("MAKE_CLOSURE", |vm, d| {
        let code = pop_code(vm)?;
        let closure = pop_closure_tuple(vm)?;
        let defaults = vm.popn(d.arg()? as usize)?;
        let f = build_function(vm, code, None, defaults, AHashMap::new(), AHashMap::new(), closure)?;
        vm.push(f)?;
        Ok(None)
    });
}

// ---------------------------------------------------------------------
// Handlers nommés et aides locales
// ---------------------------------------------------------------------

fn jump_to(vm: &mut PyVm, d: &Decoded) -> VmResult<Option<Why>> {
    vm.jump(d.jump_target()?)?;
    Ok(None)
}

pub(super) fn cell_at(vm: &PyVm, d: &Decoded) -> VmResult<Gc<Value>> {
    let ix = d.arg()? as usize;
    let frame = vm.current_frame()?;
    let cell = frame.borrow().cells.get(ix).cloned();
    cell.ok_or_else(|| VmError::Internal(format!("cellule {ix} hors de la frame")))
}

pub(super) fn pop_code(vm: &mut PyVm) -> VmResult<Rc<CodeObject>> {
    match vm.pop()? {
        Value::Code(c) => Ok(c),
        other => Err(VmError::Internal(format!(
            "objet code attendu sur la pile, trouvé {}",
            other.type_name()
        ))),
    }
}

pub(super) fn pop_closure_tuple(vm: &mut PyVm) -> VmResult<Vec<Gc<Value>>> {
    match vm.pop()? {
        Value::Tuple(items) => {
            let mut cells = Vec::with_capacity(items.len());
            for v in items.iter() {
                match v {
                    Value::Cell(c) => cells.push(c.clone()),
                    other => {
                        return Err(VmError::Internal(format!(
                            "cellule attendue dans la fermeture, trouvé {}",
                            other.type_name()
                        )))
                    }
                }
            }
            Ok(cells)
        }
        other => Err(VmError::Internal(format!(
            "tuple de fermeture attendu, trouvé {}",
            other.type_name()
        ))),
    }
}

/// Fabrique une `Value::Function` liée aux globals de la frame courante.
pub(super) fn build_function(
    vm: &PyVm,
    code: Rc<CodeObject>,
    qualname: Option<String>,
    defaults: Vec<Value>,
    kwdefaults: AHashMap<String, Value>,
    annotations: AHashMap<String, Value>,
    closure: Vec<Gc<Value>>,
) -> VmResult<Value> {
    let globals = vm.current_frame()?.borrow().globals.clone();
    let name = code.name.clone();
    let has_dot_zero = COMPREHENSION_FN_NAMES.contains(&code.name.as_str());
    Ok(Value::Function(Rc::new(Function {
        qualname: qualname.unwrap_or_else(|| code.qualname.clone()),
        name,
        code,
        globals,
        defaults,
        kwdefaults,
        annotations,
        closure,
        has_dot_zero,
    })))
}

/// Appel 2.7 : compte positionnel en octet bas, paires (clé, valeur)
/// nommées comptées par l'octet haut, puis `*args` / `**kwargs`.
fn call_function_27(
    vm: &mut PyVm,
    npos: u32,
    nkw: u32,
    star: Option<Value>,
    starkw: Option<Value>,
) -> VmResult<Option<Why>> {
    let mut named = AHashMap::new();
    for _ in 0..nkw {
        let v = vm.pop()?;
        let k = vm.pop()?;
        match k {
            Value::Str(s) => {
                named.insert(s.to_string(), v);
            }
            other => {
                return Err(VmError::user(
                    "TypeError",
                    format!("keywords must be strings, not '{}'", other.type_name()),
                ))
            }
        }
    }
    let mut pos = vm.popn(npos as usize)?;
    let func = vm.pop()?;
    if let Some(star) = star {
        pos.extend(unpack_to_vec(vm, &star)?);
    }
    if let Some(starkw) = starkw {
        for (k, v) in named_args_from_dict(&starkw)? {
            named.insert(k, v);
        }
    }
    let ret = vm.call_value(func, pos, named)?;
    vm.push(ret)?;
    Ok(None)
}

/// END_FINALLY des protocoles à marqueur (2.7 à 3.7) : dépile le marqueur
/// ou le triple d'exception repoussé par l'unwinding et relance le signal.
fn end_finally_legacy(vm: &mut PyVm, _d: &Decoded) -> VmResult<Option<Why>> {
    let v = vm.pop()?;
    match v {
        Value::Why(w) => {
            if matches!(w, Why::Return | Why::Continue) {
                vm.return_value = vm.pop()?;
            }
            if w == Why::Silenced {
                // WITH_CLEANUP a avalé l'exception : on referme le bloc
                // except-handler et on repart normalement.
                let block = vm.pop_block()?;
                if block.kind != BlockKind::ExceptHandler {
                    return Err(VmError::Internal(
                        "END_FINALLY silenced sans bloc except-handler".into(),
                    ));
                }
                vm.unwind_block(&block)?;
                return Ok(None);
            }
            Ok(Some(w))
        }
        Value::None => Ok(None),
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

/// WITH_CLEANUP 2.7 : appelle `__exit__` selon l'état au sommet de pile,
/// et avale l'exception si l'exit rend vrai.
fn with_cleanup_27(vm: &mut PyVm, _d: &Decoded) -> VmResult<Option<Why>> {
    let top = vm.top()?;
    let (u, v, w, exit_func) = match top {
        Value::None => {
            vm.pop()?;
            let exit = vm.pop()?;
            vm.push(Value::None)?;
            (Value::None, Value::None, Value::None, exit)
        }
        Value::Why(why) => {
            if matches!(why, Why::Return | Why::Continue) {
                // [exit, retval, marqueur] : l'exit est sous la valeur.
                let marker = vm.pop()?;
                let retval = vm.pop()?;
                let exit = vm.pop()?;
                vm.push(retval)?;
                vm.push(marker)?;
                (Value::None, Value::None, Value::None, exit)
            } else {
                let marker = vm.pop()?;
                let exit = vm.pop()?;
                vm.push(marker)?;
                (Value::None, Value::None, Value::None, exit)
            }
        }
        Value::ExcType(_) => {
            // [exit, tb, val, type] : triple repoussé par l'unwinding.
            let three = vm.popn(3)?;
            let exit = vm.pop()?;
            vm.push(three[0].clone())?;
            vm.push(three[1].clone())?;
            vm.push(three[2].clone())?;
            (
                three[2].clone(),
                three[1].clone(),
                three[0].clone(),
                exit,
            )
        }
        other => {
            return Err(VmError::Internal(format!(
                "WITH_CLEANUP confus : {other:?}"
            )))
        }
    };
    let exit_ret = vm.call_value(exit_func, vec![u.clone(), v, w], AHashMap::new())?;
    if !matches!(u, Value::None) && exit_ret.truthy() {
        // Exception avalée : remplace le triple par le marqueur silenced.
        vm.popn(3)?;
        vm.push(Value::Why(Why::Silenced))?;
    }
    Ok(None)
}

/// Fabrique une exception à partir des opérandes de RAISE (3.x).
pub(super) fn raise_varargs_3x(vm: &mut PyVm, d: &Decoded) -> VmResult<Option<Why>> {
    let argc = d.arg()?;
    let (mut exc, mut cause) = (None, None);
    match argc {
        0 => {}
        1 => exc = Some(vm.pop()?),
        2 => {
            cause = Some(vm.pop()?);
            exc = Some(vm.pop()?);
        }
        n => return Err(VmError::Internal(format!("RAISE_VARARGS {n}"))),
    }
    do_raise(vm, exc, cause)
}
