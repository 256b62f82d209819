//! byteops/mod.rs — Table de handlers d'opcodes par version.
//!
//! Un handler par nom d'opcode : `fn(&mut PyVm, &Decoded) ->
//! VmResult<Option<Why>>`. La table se construit à la création de la VM :
//! socle 2.7, puis chaque version pose ses ajouts et surcharges, puis la
//! surcouche PyPy. Les jeux de handlers sont des données, pas des types :
//! ajouter une version = écrire un module d'installation.
//!
//! Les familles UNARY_* / BINARY_* / INPLACE_* / SLICE+N ne passent pas
//! par cette table : le dispatch les route directement vers les
//! dispatchers d'opérateurs (`arith`).

use ahash::AHashMap;
use viper_core::opcodes::NB_OPS;
use viper_core::{PyVersion, Variant};

use crate::error::{VmError, VmResult};
use crate::frame::Why;
use crate::value::{Gc, Value, ValueIter};
use crate::vm::{Decoded, PyVm};

mod base;
mod pypy;
mod v310;
mod v311;
mod v36;
mod v37;
mod v38;
mod v39;

/// Handler d'opcode.
pub type Handler = fn(&mut PyVm, &Decoded) -> VmResult<Option<Why>>;

/// Table nom → handler.
pub struct HandlerTable {
    map: AHashMap<&'static str, Handler>,
}

impl HandlerTable {
    fn new() -> Self {
        Self {
            map: AHashMap::new(),
        }
    }

    /// Pose ou remplace le handler de `name`.
    pub(crate) fn set(&mut self, name: &'static str, h: Handler) {
        self.map.insert(name, h);
    }

    pub fn get(&self, name: &str) -> Option<Handler> {
        self.map.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Construit la table de handlers de `(version, variant)`.
pub fn handler_table(version: PyVersion, variant: Variant) -> HandlerTable {
    let mut t = HandlerTable::new();
    base::install(&mut t);
    if version >= PyVersion::V36 {
        v36::install(&mut t);
    }
    if version >= PyVersion::V37 {
        v37::install(&mut t);
    }
    if version >= PyVersion::V38 {
        v38::install(&mut t);
    }
    if version >= PyVersion::V39 {
        v39::install(&mut t);
    }
    if version >= PyVersion::V310 {
        v310::install(&mut t);
    }
    if version >= PyVersion::V311 {
        v311::install(&mut t);
    }
    if variant == Variant::PyPy {
        pypy::install(&mut t);
    }
    t
}

/// Nom de la sous-opération BINARY_OP d'index `arg` (3.11).
pub fn nb_op_name(arg: u32) -> VmResult<&'static str> {
    NB_OPS
        .get(arg as usize)
        .copied()
        .ok_or_else(|| VmError::Internal(format!("sous-opération BINARY_OP inconnue : {arg}")))
}

// ---------------------------------------------------------------------
// Aides partagées par les jeux de handlers
// ---------------------------------------------------------------------

/// Résolution de nom : locals → globals → builtins.
pub(crate) fn load_name(vm: &PyVm, frame: &Gc<crate::frame::Frame>, name: &str) -> Option<Value> {
    let f = frame.borrow();
    if let Some(v) = f.locals.borrow().get(name) {
        return Some(v.clone());
    }
    if let Some(v) = f.globals.borrow().get(name) {
        return Some(v.clone());
    }
    vm.builtins.borrow().get(name).cloned()
}

/// Résolution globale : globals → builtins.
pub(crate) fn load_global(vm: &PyVm, frame: &Gc<crate::frame::Frame>, name: &str) -> Option<Value> {
    if let Some(v) = frame.borrow().globals.borrow().get(name) {
        return Some(v.clone());
    }
    vm.builtins.borrow().get(name).cloned()
}

pub(crate) fn name_error(name: &str) -> VmError {
    VmError::user("NameError", format!("name '{name}' is not defined"))
}

pub(crate) fn unbound_local(name: &str) -> VmError {
    VmError::user(
        "UnboundLocalError",
        format!("local variable '{name}' referenced before assignment"),
    )
}

/// `getattr` hôte : sacs d'attributs, instances d'exception, et rien
/// d'autre (la bibliothèque d'objets complète n'est pas de ce ressort).
pub(crate) fn getattr(obj: &Value, name: &str) -> VmResult<Value> {
    match obj {
        Value::Object(map) => map.borrow().get(name).cloned().ok_or_else(|| {
            VmError::user("AttributeError", format!("object has no attribute '{name}'"))
        }),
        Value::Exception(e) if name == "args" => Ok(Value::tuple(e.args.clone())),
        other => Err(VmError::user(
            "AttributeError",
            format!("'{}' object has no attribute '{name}'", other.type_name()),
        )),
    }
}

pub(crate) fn setattr(obj: &Value, name: &str, v: Value) -> VmResult<()> {
    match obj {
        Value::Object(map) => {
            map.borrow_mut().insert(name.to_string(), v);
            Ok(())
        }
        other => Err(VmError::user(
            "AttributeError",
            format!("'{}' object attributes are read-only", other.type_name()),
        )),
    }
}

pub(crate) fn delattr(obj: &Value, name: &str) -> VmResult<()> {
    match obj {
        Value::Object(map) => {
            if map.borrow_mut().remove(name).is_none() {
                return Err(VmError::user(
                    "AttributeError",
                    format!("object has no attribute '{name}'"),
                ));
            }
            Ok(())
        }
        other => Err(VmError::user(
            "AttributeError",
            format!("'{}' object attributes are read-only", other.type_name()),
        )),
    }
}

/// `iter()` hôte : les itérateurs et générateurs passent tels quels, les
/// séquences sont instantanées.
pub(crate) fn make_iterator(v: Value) -> VmResult<Value> {
    let items: Vec<Value> = match &v {
        Value::Iter(_) | Value::Generator(_) => return Ok(v),
        Value::List(l) => l.borrow().clone(),
        Value::Tuple(t) => t.to_vec(),
        Value::Str(s) => s.chars().map(|c| Value::str(c.to_string())).collect(),
        Value::Dict(d) => d.borrow().keys().map(|k| k.to_value()).collect(),
        Value::Set(s) => s.borrow().iter().map(|k| k.to_value()).collect(),
        other => {
            return Err(VmError::user(
                "TypeError",
                format!("'{}' object is not iterable", other.type_name()),
            ))
        }
    };
    Ok(Value::Iter(crate::value::gc(ValueIter::Seq {
        items,
        ix: 0,
    })))
}

/// Avance un itérateur (concret ou générateur). `None` = épuisé.
pub(crate) fn iter_next(vm: &mut PyVm, itval: &Value) -> VmResult<Option<Value>> {
    match itval {
        Value::Iter(it) => Ok(it.borrow_mut().advance()),
        Value::Generator(g) => vm.resume_generator(g, Value::None),
        other => Err(VmError::user(
            "TypeError",
            format!("'{}' object is not an iterator", other.type_name()),
        )),
    }
}

/// Déplie une valeur itérable en vecteur (UNPACK_SEQUENCE, CALL_*_EX…).
pub(crate) fn unpack_to_vec(vm: &mut PyVm, v: &Value) -> VmResult<Vec<Value>> {
    match v {
        Value::List(l) => Ok(l.borrow().clone()),
        Value::Tuple(t) => Ok(t.to_vec()),
        Value::Str(s) => Ok(s.chars().map(|c| Value::str(c.to_string())).collect()),
        Value::Set(s) => Ok(s.borrow().iter().map(|k| k.to_value()).collect()),
        Value::Dict(d) => Ok(d.borrow().keys().map(|k| k.to_value()).collect()),
        Value::Iter(_) | Value::Generator(_) => {
            let mut out = Vec::new();
            while let Some(x) = iter_next(vm, v)? {
                out.push(x);
            }
            Ok(out)
        }
        other => Err(VmError::user(
            "TypeError",
            format!("cannot unpack non-iterable '{}' object", other.type_name()),
        )),
    }
}

/// Dict VM → mapping nom → valeur (arguments nommés d'un appel).
pub(crate) fn named_args_from_dict(v: &Value) -> VmResult<AHashMap<String, Value>> {
    let mut out = AHashMap::new();
    match v {
        Value::Dict(d) => {
            for (k, val) in d.borrow().iter() {
                match k.to_value() {
                    Value::Str(s) => {
                        out.insert(s.to_string(), val.clone());
                    }
                    _ => {
                        return Err(VmError::user(
                            "TypeError",
                            "keywords must be strings",
                        ))
                    }
                }
            }
            Ok(out)
        }
        other => Err(VmError::user(
            "TypeError",
            format!(
                "argument after ** must be a mapping, not '{}'",
                other.type_name()
            ),
        )),
    }
}

/// RAISE_VARARGS 3.x : `raise`, `raise exc`, `raise exc from cause`.
pub(crate) fn do_raise(
    vm: &mut PyVm,
    exc: Option<Value>,
    _cause: Option<Value>,
) -> VmResult<Option<Why>> {
    let value = match exc {
        None => {
            // raise nu : re-lève l'exception courante.
            return match vm.last_exception.clone() {
                Some(_) => Ok(Some(Why::Reraise)),
                None => Err(VmError::user(
                    "RuntimeError",
                    "No active exception to re-raise",
                )),
            };
        }
        Some(Value::ExcType(t)) => Value::Exception(std::rc::Rc::new(
            crate::object::ExcInstance {
                etype: t,
                args: vec![],
            },
        )),
        Some(v @ Value::Exception(_)) => v,
        Some(other) => {
            return Err(VmError::user(
                "TypeError",
                format!(
                    "exceptions must derive from BaseException (got '{}')",
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
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tables_grow_with_versions() {
        let t27 = handler_table(PyVersion::V27, Variant::CPython);
        let t311 = handler_table(PyVersion::V311, Variant::CPython);
        assert!(t27.get("SETUP_LOOP").is_some());
        assert!(t27.get("PUSH_NULL").is_none());
        assert!(t311.get("PUSH_NULL").is_some());
        assert!(t311.get("KW_NAMES").is_some());
        assert!(!t27.is_empty() && t311.len() > t27.len());
    }

    #[test]
    fn pypy_overlay_installs_method_ops() {
        let t = handler_table(PyVersion::V27, Variant::PyPy);
        assert!(t.get("LOOKUP_METHOD").is_some());
        assert!(t.get("CALL_METHOD").is_some());
    }

    #[test]
    fn nb_ops_cover_inplace_range() {
        assert_eq!(nb_op_name(0).unwrap(), "ADD");
        assert_eq!(nb_op_name(10).unwrap(), "SUBTRACT");
        assert_eq!(nb_op_name(13).unwrap(), "INPLACE_ADD");
        assert!(nb_op_name(26).is_err());
    }
}
