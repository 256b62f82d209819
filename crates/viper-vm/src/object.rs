//! object.rs — Valeurs structurées internes : types d'exception, fonctions,
//! générateurs, tracebacks, et la liaison d'arguments.

use std::rc::Rc;

use ahash::AHashMap;
use once_cell::sync::Lazy;
use viper_core::{CodeFlags, CodeObject};

use crate::error::{VmError, VmResult};
use crate::frame::{Frame, FrameStatus};
use crate::value::{Gc, Namespace, Value};

// ---------------------------------------------------------------------
// Exceptions hôtes
// ---------------------------------------------------------------------

/// Type d'exception hôte. La hiérarchie intégrée couvre ce dont le cœur a
/// besoin (correspondance des handlers) sans rejouer toute la bibliothèque.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExcType {
    pub name: &'static str,
}

/// `fils → parent` ; tout ce qui n'est pas listé descend d'`Exception`.
static EXC_PARENTS: Lazy<AHashMap<&'static str, &'static str>> =
    Lazy::new(|| EXC_PARENT_PAIRS.iter().copied().collect());

const EXC_PARENT_PAIRS: &[(&str, &str)] = &[
    ("Exception", "BaseException"),
    ("SystemExit", "BaseException"),
    ("KeyboardInterrupt", "BaseException"),
    ("GeneratorExit", "BaseException"),
    ("ArithmeticError", "Exception"),
    ("ZeroDivisionError", "ArithmeticError"),
    ("OverflowError", "ArithmeticError"),
    ("LookupError", "Exception"),
    ("KeyError", "LookupError"),
    ("IndexError", "LookupError"),
    ("NameError", "Exception"),
    ("UnboundLocalError", "NameError"),
    ("RuntimeError", "Exception"),
    ("NotImplementedError", "RuntimeError"),
    ("StopIteration", "Exception"),
    ("TypeError", "Exception"),
    ("ValueError", "Exception"),
    ("AttributeError", "Exception"),
    ("AssertionError", "Exception"),
    ("OSError", "Exception"),
    ("ImportError", "Exception"),
];

/// Les types exposés dans les builtins.
pub const BUILTIN_EXC_NAMES: &[&str] = &[
    "BaseException",
    "Exception",
    "SystemExit",
    "KeyboardInterrupt",
    "GeneratorExit",
    "ArithmeticError",
    "ZeroDivisionError",
    "OverflowError",
    "LookupError",
    "KeyError",
    "IndexError",
    "NameError",
    "UnboundLocalError",
    "RuntimeError",
    "NotImplementedError",
    "StopIteration",
    "TypeError",
    "ValueError",
    "AttributeError",
    "AssertionError",
    "OSError",
    "ImportError",
];

impl ExcType {
    /// Type intégré par nom. Les noms hors hiérarchie donnent un type
    /// feuille sous `Exception` (suffisant pour la correspondance).
    pub fn builtin(name: &'static str) -> Rc<ExcType> {
        Rc::new(ExcType { name })
    }

    /// `self` est-il `against` ou un de ses descendants ?
    pub fn matches(&self, against: &str) -> bool {
        let mut cur = self.name;
        loop {
            if cur == against {
                return true;
            }
            match EXC_PARENTS.get(cur) {
                Some(parent) => cur = parent,
                None => {
                    // Feuille inconnue : parent implicite Exception.
                    if cur != "Exception" && cur != "BaseException" {
                        cur = "Exception";
                    } else if cur == "Exception" {
                        cur = "BaseException";
                    } else {
                        return false;
                    }
                }
            }
        }
    }
}

/// Instance d'exception : type + arguments.
#[derive(Debug, Clone)]
pub struct ExcInstance {
    pub etype: Rc<ExcType>,
    pub args: Vec<Value>,
}

impl std::fmt::Display for ExcInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.etype.name)?;
        if !self.args.is_empty() {
            write!(f, ": ")?;
            for (i, a) in self.args.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{a}")?;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------
// Traceback
// ---------------------------------------------------------------------

/// Maillon de traceback, chaîné du plus profond au moins profond.
/// Construit paresseusement ; les frames ne possèdent aucun maillon.
#[derive(Debug, Clone)]
pub struct TraceEntry {
    pub filename: String,
    pub lineno: u32,
    pub name: String,
    pub next: Option<Rc<TraceEntry>>,
}

impl TraceEntry {
    /// Aplatie la chaîne, le plus profond d'abord.
    pub fn flatten(self: &Rc<TraceEntry>) -> Vec<Rc<TraceEntry>> {
        let mut out = Vec::new();
        let mut cur = Some(self.clone());
        while let Some(e) = cur {
            cur = e.next.clone();
            out.push(e);
        }
        out
    }
}

// ---------------------------------------------------------------------
// Fonctions
// ---------------------------------------------------------------------

/// Corps de compréhension : le premier positionnel devient `.0`.
pub const COMPREHENSION_FN_NAMES: &[&str] =
    &["<listcomp>", "<setcomp>", "<dictcomp>", "<genexpr>"];

/// Fonction définie en bytecode : code capturé, defaults, fermeture,
/// globals du site de définition.
pub struct Function {
    pub name: String,
    pub qualname: String,
    pub code: Rc<CodeObject>,
    pub globals: Namespace,
    pub defaults: Vec<Value>,
    pub kwdefaults: AHashMap<String, Value>,
    pub annotations: AHashMap<String, Value>,
    pub closure: Vec<Gc<Value>>,
    /// Convention « point zéro » des corps de compréhension.
    pub has_dot_zero: bool,
}

impl std::fmt::Debug for Function {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<function {} code={}>", self.qualname, self.code.name)
    }
}

/// Lie arguments positionnels et nommés aux slots de paramètres du code,
/// en appliquant defaults, kwdefaults, `*args` et `**kwargs`.
///
/// Renvoie le mapping nom → valeur à verser dans les locals de la frame.
pub fn bind_call_args(
    func: &Function,
    pos: &[Value],
    named: &AHashMap<String, Value>,
) -> VmResult<AHashMap<String, Value>> {
    let code = &func.code;
    let argcount = code.argcount as usize;
    let kwonly = code.kwonlyargcount as usize;
    let params: Vec<&String> = code.varnames.iter().take(argcount).collect();
    let kwonly_params: Vec<&String> =
        code.varnames.iter().skip(argcount).take(kwonly).collect();

    let mut bound: AHashMap<String, Value> = AHashMap::new();

    // Positionnels, puis débordement éventuel dans *args.
    let n_direct = pos.len().min(argcount);
    for (name, val) in params.iter().zip(pos.iter()) {
        bound.insert((*name).clone(), val.clone());
    }
    let star_slot = argcount + kwonly;
    if pos.len() > argcount {
        if code.flags.contains(CodeFlags::VARARGS) {
            let rest: Vec<Value> = pos[n_direct..].to_vec();
            let star_name = code.varnames.get(star_slot).ok_or_else(|| {
                VmError::Internal("slot *args absent de varnames".into())
            })?;
            bound.insert(star_name.clone(), Value::tuple(rest));
        } else {
            return Err(VmError::user(
                "TypeError",
                format!(
                    "{}() takes {} positional arguments but {} were given",
                    func.name,
                    argcount,
                    pos.len()
                ),
            ));
        }
    } else if code.flags.contains(CodeFlags::VARARGS) {
        let star_name = code.varnames.get(star_slot).ok_or_else(|| {
            VmError::Internal("slot *args absent de varnames".into())
        })?;
        bound.insert(star_name.clone(), Value::tuple(vec![]));
    }

    // Nommés : slots connus d'abord, le reste dans **kwargs si permis.
    let mut extra: AHashMap<String, Value> = AHashMap::new();
    for (name, val) in named {
        let is_param = params.iter().any(|p| *p == name)
            || kwonly_params.iter().any(|p| *p == name);
        if is_param {
            if bound.contains_key(name) {
                return Err(VmError::user(
                    "TypeError",
                    format!("{}() got multiple values for argument '{name}'", func.name),
                ));
            }
            bound.insert(name.clone(), val.clone());
        } else if code.flags.contains(CodeFlags::VARKEYWORDS) {
            extra.insert(name.clone(), val.clone());
        } else {
            return Err(VmError::user(
                "TypeError",
                format!(
                    "{}() got an unexpected keyword argument '{name}'",
                    func.name
                ),
            ));
        }
    }
    if code.flags.contains(CodeFlags::VARKEYWORDS) {
        let slot = star_slot + usize::from(code.flags.contains(CodeFlags::VARARGS));
        let kw_name = code.varnames.get(slot).ok_or_else(|| {
            VmError::Internal("slot **kwargs absent de varnames".into())
        })?;
        let mut dict = AHashMap::new();
        for (k, v) in extra {
            dict.insert(crate::value::DictKey::Str(Rc::from(k.as_str())), v);
        }
        bound.insert(kw_name.clone(), Value::Dict(crate::value::gc(dict)));
    }

    // Defaults positionnels : comblent la queue des slots manquants.
    let defaults_start = argcount.saturating_sub(func.defaults.len());
    for (i, name) in params.iter().enumerate() {
        if !bound.contains_key(*name) {
            if i >= defaults_start {
                bound.insert((*name).clone(), func.defaults[i - defaults_start].clone());
            } else {
                return Err(VmError::user(
                    "TypeError",
                    format!(
                        "{}() missing required positional argument: '{name}'",
                        func.name
                    ),
                ));
            }
        }
    }

    // Defaults keyword-only.
    for name in kwonly_params {
        if !bound.contains_key(name) {
            match func.kwdefaults.get(name) {
                Some(v) => {
                    bound.insert(name.clone(), v.clone());
                }
                None => {
                    return Err(VmError::user(
                        "TypeError",
                        format!(
                            "{}() missing required keyword-only argument: '{name}'",
                            func.name
                        ),
                    ))
                }
            }
        }
    }

    Ok(bound)
}

// ---------------------------------------------------------------------
// Générateurs
// ---------------------------------------------------------------------

/// Frame suspendue détenue côté hôte par l'objet itérateur.
pub struct Generator {
    pub frame: Gc<Frame>,
    pub finished: bool,
    /// Valeur du `return` final, consommée par YIELD_FROM.
    pub return_value: Value,
}

impl Generator {
    pub fn new(frame: Gc<Frame>) -> Self {
        Self {
            frame,
            finished: false,
            return_value: Value::None,
        }
    }

    pub fn name(&self) -> String {
        self.frame.borrow().code.name.clone()
    }

    pub fn status(&self) -> FrameStatus {
        self.frame.borrow().status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use viper_core::{CodeObject, PyVersion};

    fn func_with(argcount: u32, varnames: &[&str], flags: u32, defaults: Vec<Value>) -> Function {
        let mut b = CodeObject::builder("f", PyVersion::V36);
        for v in varnames {
            b.add_varname(v);
        }
        b.add_flags(flags);
        b.set_argcount(argcount);
        Function {
            name: "f".into(),
            qualname: "f".into(),
            code: b.build(),
            globals: crate::value::gc(AHashMap::new()),
            defaults,
            kwdefaults: AHashMap::new(),
            annotations: AHashMap::new(),
            closure: vec![],
            has_dot_zero: false,
        }
    }

    #[test]
    fn exception_hierarchy_matches() {
        assert!(ExcType::builtin("KeyError").matches("KeyError"));
        assert!(ExcType::builtin("KeyError").matches("LookupError"));
        assert!(ExcType::builtin("KeyError").matches("Exception"));
        assert!(ExcType::builtin("KeyError").matches("BaseException"));
        assert!(!ExcType::builtin("KeyError").matches("ValueError"));
        assert!(ExcType::builtin("SystemExit").matches("BaseException"));
        assert!(!ExcType::builtin("SystemExit").matches("Exception"));
    }

    #[test]
    fn bind_positional_with_defaults() {
        let f = func_with(2, &["a", "b"], 0, vec![Value::Int(9)]);
        let got = bind_call_args(&f, &[Value::Int(1)], &AHashMap::new()).unwrap();
        assert!(got["a"].py_eq(&Value::Int(1)));
        assert!(got["b"].py_eq(&Value::Int(9)));
    }

    #[test]
    fn bind_rejects_extra_positional_without_varargs() {
        let f = func_with(1, &["a"], 0, vec![]);
        let err = bind_call_args(&f, &[Value::Int(1), Value::Int(2)], &AHashMap::new())
            .unwrap_err();
        assert!(matches!(err, VmError::User(_)));
    }

    #[test]
    fn bind_collects_varargs_and_varkw() {
        let f = func_with(
            1,
            &["a", "args", "kw"],
            CodeFlags::VARARGS | CodeFlags::VARKEYWORDS,
            vec![],
        );
        let mut named = AHashMap::new();
        named.insert("x".to_string(), Value::Int(7));
        let got =
            bind_call_args(&f, &[Value::Int(1), Value::Int(2), Value::Int(3)], &named).unwrap();
        assert!(got["a"].py_eq(&Value::Int(1)));
        match &got["args"] {
            Value::Tuple(t) => assert_eq!(t.len(), 2),
            other => panic!("attendu tuple, got {other:?}"),
        }
        match &got["kw"] {
            Value::Dict(d) => assert_eq!(d.borrow().len(), 1),
            other => panic!("attendu dict, got {other:?}"),
        }
    }

    #[test]
    fn bind_rejects_duplicate_named() {
        let f = func_with(1, &["a"], 0, vec![]);
        let mut named = AHashMap::new();
        named.insert("a".to_string(), Value::Int(2));
        let err = bind_call_args(&f, &[Value::Int(1)], &named).unwrap_err();
        assert!(matches!(err, VmError::User(_)));
    }
}
