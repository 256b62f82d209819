//! stdlib.rs — Petit stdlib hôte : de quoi exercer la plomberie d'appel
//! (print, len, range, str, repr, abs) et les types d'exception intégrés.
//! Ce n'est pas une bibliothèque complète, et ce n'est pas le but.

use std::rc::Rc;

use crate::error::{VmError, VmResult};
use crate::object::{ExcType, BUILTIN_EXC_NAMES};
use crate::value::{gc, Namespace, Native, Value, ValueIter};
use crate::vm::PyVm;

/// Installe les types d'exception intégrés dans `builtins`.
pub fn install_exceptions(builtins: &Namespace) {
    let mut ns = builtins.borrow_mut();
    for name in BUILTIN_EXC_NAMES {
        ns.insert(
            (*name).to_string(),
            Value::ExcType(ExcType::builtin(name)),
        );
    }
}

/// Installe les fonctions natives dans les builtins de la VM.
pub fn install(vm: &mut PyVm) {
    define(vm, "print", |vm, args| {
        let mut out = String::new();
        for (i, a) in args.iter().enumerate() {
            if i > 0 {
                out.push(' ');
            }
            out.push_str(&a.to_string());
        }
        out.push('\n');
        vm.host().write(&out);
        Ok(Value::None)
    });

    define(vm, "len", |_, args| {
        one_arg("len", args)?.py_len().map(|n| Value::Int(n as i64))
    });

    define(vm, "repr", |_, args| {
        Ok(Value::str(one_arg("repr", args)?.repr()))
    });

    define(vm, "str", |_, args| {
        Ok(Value::str(one_arg("str", args)?.to_string()))
    });

    define(vm, "abs", |_, args| match one_arg("abs", args)? {
        Value::Int(i) => Ok(Value::Int(i.abs())),
        Value::Float(x) => Ok(Value::Float(x.abs())),
        Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
        other => Err(VmError::user(
            "TypeError",
            format!("bad operand type for abs(): '{}'", other.type_name()),
        )),
    });

    define(vm, "range", |_, args| {
        let as_int = |v: &Value| -> VmResult<i64> {
            match v {
                Value::Int(i) => Ok(*i),
                Value::Bool(b) => Ok(i64::from(*b)),
                other => Err(VmError::user(
                    "TypeError",
                    format!(
                        "'{}' object cannot be interpreted as an integer",
                        other.type_name()
                    ),
                )),
            }
        };
        let (next, stop, step) = match args {
            [stop] => (0, as_int(stop)?, 1),
            [start, stop] => (as_int(start)?, as_int(stop)?, 1),
            [start, stop, step] => {
                let step = as_int(step)?;
                if step == 0 {
                    return Err(VmError::user(
                        "ValueError",
                        "range() arg 3 must not be zero",
                    ));
                }
                (as_int(start)?, as_int(stop)?, step)
            }
            _ => {
                return Err(VmError::user(
                    "TypeError",
                    format!("range expected 1 to 3 arguments, got {}", args.len()),
                ))
            }
        };
        Ok(Value::Iter(gc(ValueIter::Range { next, stop, step })))
    });
}

fn define(vm: &mut PyVm, name: &'static str, f: fn(&mut PyVm, &[Value]) -> VmResult<Value>) {
    vm.builtins.borrow_mut().insert(
        name.to_string(),
        Value::Native(Native::new(name, Rc::new(f))),
    );
}

fn one_arg<'a>(name: &str, args: &'a [Value]) -> VmResult<&'a Value> {
    match args {
        [v] => Ok(v),
        _ => Err(VmError::user(
            "TypeError",
            format!("{name}() takes exactly one argument ({} given)", args.len()),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use viper_core::PyVersion;

    #[test]
    fn builtins_hold_exceptions_and_functions() {
        let vm = PyVm::with_stdlib(PyVersion::V39).unwrap();
        let ns = vm.builtins.borrow();
        assert!(matches!(ns.get("KeyError"), Some(Value::ExcType(_))));
        assert!(matches!(ns.get("print"), Some(Value::Native(_))));
        assert!(matches!(ns.get("range"), Some(Value::Native(_))));
    }
}
