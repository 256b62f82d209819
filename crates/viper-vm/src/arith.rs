//! arith.rs — Arithmétique hôte déléguée par les handlers.
//!
//! Les dispatchers UNARY_* / BINARY_* / INPLACE_* retombent ici. Les
//! erreurs de type et les divisions par zéro remontent comme exceptions
//! utilisateur typées, jamais comme erreurs internes.

use std::cmp::Ordering;
use std::rc::Rc;

use crate::error::{VmError, VmResult};
use crate::value::{gc, DictKey, Value};

/// Nombre coercé : bool → int, sinon int ou float.
enum Num {
    Int(i64),
    Float(f64),
}

fn as_num(v: &Value) -> Option<Num> {
    match v {
        Value::Bool(b) => Some(Num::Int(i64::from(*b))),
        Value::Int(i) => Some(Num::Int(*i)),
        Value::Float(x) => Some(Num::Float(*x)),
        _ => None,
    }
}

fn type_error(op: &str, x: &Value, y: &Value) -> VmError {
    VmError::user(
        "TypeError",
        format!(
            "unsupported operand type(s) for {op}: '{}' and '{}'",
            x.type_name(),
            y.type_name()
        ),
    )
}

/// Modulo à la Python : le résultat prend le signe du diviseur.
fn py_mod_int(a: i64, b: i64) -> VmResult<i64> {
    if b == 0 {
        return Err(VmError::user(
            "ZeroDivisionError",
            "integer division or modulo by zero",
        ));
    }
    let r = a.rem_euclid(b.abs());
    Ok(if b < 0 && r != 0 { r + b } else { r })
}

/// Division entière planchée à la Python (arrondi vers moins l'infini).
fn py_floordiv_int(a: i64, b: i64) -> VmResult<i64> {
    let m = py_mod_int(a, b)?;
    Ok((a - m) / b)
}

/// Opérateur binaire par nom de suffixe (ADD, SUBTRACT, TRUE_DIVIDE…).
/// `REMAINDER` est l'alias 3.11 de MODULO.
pub fn binary(op: &str, x: Value, y: Value) -> VmResult<Value> {
    match op {
        "ADD" => add(x, y),
        "SUBTRACT" => num_op(op, x, y, |a, b| Ok(a - b), |a, b| Ok(a - b)),
        "MULTIPLY" => multiply(x, y),
        "DIVIDE" => {
            // 2.x : division entière planchée entre entiers.
            match (as_num(&x), as_num(&y)) {
                (Some(Num::Int(a)), Some(Num::Int(b))) => Ok(Value::Int(py_floordiv_int(a, b)?)),
                _ => binary("TRUE_DIVIDE", x, y),
            }
        }
        "TRUE_DIVIDE" => match (as_num(&x), as_num(&y)) {
            (Some(a), Some(b)) => {
                let (a, b) = (to_f64(a), to_f64(b));
                if b == 0.0 {
                    Err(VmError::user("ZeroDivisionError", "division by zero"))
                } else {
                    Ok(Value::Float(a / b))
                }
            }
            _ => Err(type_error("/", &x, &y)),
        },
        "FLOOR_DIVIDE" => num_op(
            op,
            x,
            y,
            py_floordiv_int,
            |a, b| {
                if b == 0.0 {
                    Err(VmError::user("ZeroDivisionError", "float floor division by zero"))
                } else {
                    Ok((a / b).floor())
                }
            },
        ),
        "MODULO" | "REMAINDER" => num_op(
            op,
            x,
            y,
            py_mod_int,
            |a, b| {
                if b == 0.0 {
                    Err(VmError::user("ZeroDivisionError", "float modulo"))
                } else {
                    let r = a % b;
                    Ok(if r != 0.0 && (r < 0.0) != (b < 0.0) { r + b } else { r })
                }
            },
        ),
        "POWER" => match (as_num(&x), as_num(&y)) {
            (Some(Num::Int(a)), Some(Num::Int(b))) if b >= 0 => {
                Ok(Value::Int(a.pow(b.min(u32::MAX as i64) as u32)))
            }
            (Some(a), Some(b)) => Ok(Value::Float(to_f64(a).powf(to_f64(b)))),
            _ => Err(type_error("**", &x, &y)),
        },
        "LSHIFT" => int_op(op, x, y, |a, b| Ok(a << (b.max(0) as u32 % 64))),
        "RSHIFT" => int_op(op, x, y, |a, b| Ok(a >> (b.max(0) as u32 % 64))),
        "AND" => int_op(op, x, y, |a, b| Ok(a & b)),
        "XOR" => int_op(op, x, y, |a, b| Ok(a ^ b)),
        "OR" => int_op(op, x, y, |a, b| Ok(a | b)),
        "SUBSCR" => subscr(&x, &y),
        "MATRIX_MULTIPLY" => Err(type_error("@", &x, &y)),
        other => Err(VmError::Internal(format!(
            "opérateur binaire inconnu : {other}"
        ))),
    }
}

/// Variante en place : les listes mutent, le reste délègue au binaire.
pub fn inplace(op: &str, x: Value, y: Value) -> VmResult<Value> {
    let op = op.strip_prefix("INPLACE_").unwrap_or(op);
    if op == "ADD" {
        if let (Value::List(target), Value::List(src)) = (&x, &y) {
            if Rc::ptr_eq(target, src) {
                let copy = src.borrow().clone();
                target.borrow_mut().extend(copy);
            } else {
                let src = src.borrow().clone();
                target.borrow_mut().extend(src);
            }
            return Ok(x);
        }
    }
    binary(op, x, y)
}

/// Opérateur unaire par suffixe (POSITIVE, NEGATIVE, NOT, INVERT, CONVERT).
pub fn unary(op: &str, v: Value) -> VmResult<Value> {
    match op {
        "POSITIVE" => match as_num(&v) {
            Some(Num::Int(i)) => Ok(Value::Int(i)),
            Some(Num::Float(x)) => Ok(Value::Float(x)),
            None => Err(VmError::user(
                "TypeError",
                format!("bad operand type for unary +: '{}'", v.type_name()),
            )),
        },
        "NEGATIVE" => match as_num(&v) {
            Some(Num::Int(i)) => Ok(Value::Int(-i)),
            Some(Num::Float(x)) => Ok(Value::Float(-x)),
            None => Err(VmError::user(
                "TypeError",
                format!("bad operand type for unary -: '{}'", v.type_name()),
            )),
        },
        "NOT" => Ok(Value::Bool(!v.truthy())),
        "INVERT" => match as_num(&v) {
            Some(Num::Int(i)) => Ok(Value::Int(!i)),
            _ => Err(VmError::user(
                "TypeError",
                format!("bad operand type for unary ~: '{}'", v.type_name()),
            )),
        },
        // 2.x : backquotes, équivalent repr().
        "CONVERT" => Ok(Value::str(v.repr())),
        other => Err(VmError::Internal(format!(
            "opérateur unaire inconnu : {other}"
        ))),
    }
}

/// Prédicat de comparaison par nom (table cmp_op de la version).
pub fn compare(name: &str, x: &Value, y: &Value) -> VmResult<Value> {
    let ordered = |wanted: &[Ordering]| -> VmResult<Value> {
        match x.py_cmp(y) {
            Some(ord) => Ok(Value::Bool(wanted.contains(&ord))),
            None => Err(VmError::user(
                "TypeError",
                format!(
                    "'{name}' not supported between instances of '{}' and '{}'",
                    x.type_name(),
                    y.type_name()
                ),
            )),
        }
    };
    match name {
        "<" => ordered(&[Ordering::Less]),
        "<=" => ordered(&[Ordering::Less, Ordering::Equal]),
        ">" => ordered(&[Ordering::Greater]),
        ">=" => ordered(&[Ordering::Greater, Ordering::Equal]),
        "==" => Ok(Value::Bool(x.py_eq(y))),
        "!=" => Ok(Value::Bool(!x.py_eq(y))),
        "in" => contains(y, x).map(Value::Bool),
        "not in" => contains(y, x).map(|b| Value::Bool(!b)),
        "is" => Ok(Value::Bool(x.py_is(y))),
        "is not" => Ok(Value::Bool(!x.py_is(y))),
        "exception match" => Ok(Value::Bool(exception_match(x, y)?)),
        other => Err(VmError::Internal(format!(
            "prédicat de comparaison inconnu : {other}"
        ))),
    }
}

/// `x` (instance ou type) correspond-il au type (ou tuple de types) `y` ?
pub fn exception_match(x: &Value, y: &Value) -> VmResult<bool> {
    let name_of = |v: &Value| -> VmResult<String> {
        match v {
            Value::Exception(e) => Ok(e.etype.name.to_string()),
            Value::ExcType(t) => Ok(t.name.to_string()),
            other => Err(VmError::user(
                "TypeError",
                format!(
                    "catching classes that do not inherit from BaseException is not allowed (got '{}')",
                    other.type_name()
                ),
            )),
        }
    };
    let subject = match x {
        Value::Exception(e) => e.etype.clone(),
        Value::ExcType(t) => t.clone(),
        other => {
            return Err(VmError::user(
                "TypeError",
                format!("exception expected, got '{}'", other.type_name()),
            ))
        }
    };
    match y {
        Value::Tuple(types) => {
            for t in types.iter() {
                if subject.matches(&name_of(t)?) {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        single => Ok(subject.matches(&name_of(single)?)),
    }
}

/// Appartenance (`in`).
pub fn contains(container: &Value, item: &Value) -> VmResult<bool> {
    match container {
        Value::List(l) => Ok(l.borrow().iter().any(|v| v.py_eq(item))),
        Value::Tuple(t) => Ok(t.iter().any(|v| v.py_eq(item))),
        Value::Str(s) => match item {
            Value::Str(sub) => Ok(s.contains(sub.as_ref())),
            _ => Err(VmError::user(
                "TypeError",
                "'in <string>' requires string as left operand",
            )),
        },
        Value::Dict(d) => {
            let key = DictKey::from_value(item)?;
            Ok(d.borrow().contains_key(&key))
        }
        Value::Set(s) => {
            let key = DictKey::from_value(item)?;
            Ok(s.borrow().contains(&key))
        }
        other => Err(VmError::user(
            "TypeError",
            format!("argument of type '{}' is not iterable", other.type_name()),
        )),
    }
}

/// Indexation (`x[y]`). Les objets slice découpent les séquences.
pub fn subscr(x: &Value, y: &Value) -> VmResult<Value> {
    if let Value::Slice(s) = y {
        return slice_of(x, &s.0, &s.1);
    }
    match (x, y) {
        (Value::List(l), _) => {
            let l = l.borrow();
            let ix = seq_index(y, l.len())?;
            l.get(ix)
                .cloned()
                .ok_or_else(|| VmError::user("IndexError", "list index out of range"))
        }
        (Value::Tuple(t), _) => {
            let ix = seq_index(y, t.len())?;
            t.get(ix)
                .cloned()
                .ok_or_else(|| VmError::user("IndexError", "tuple index out of range"))
        }
        (Value::Str(s), _) => {
            let chars: Vec<char> = s.chars().collect();
            let ix = seq_index(y, chars.len())?;
            chars
                .get(ix)
                .map(|c| Value::str(c.to_string()))
                .ok_or_else(|| VmError::user("IndexError", "string index out of range"))
        }
        (Value::Dict(d), _) => {
            let key = DictKey::from_value(y)?;
            d.borrow()
                .get(&key)
                .cloned()
                .ok_or_else(|| VmError::user_with("KeyError", vec![y.clone()]))
        }
        _ => Err(VmError::user(
            "TypeError",
            format!("'{}' object is not subscriptable", x.type_name()),
        )),
    }
}

/// Affectation indexée (`x[y] = v`).
pub fn store_subscr(x: &Value, y: &Value, v: Value) -> VmResult<()> {
    match x {
        Value::List(l) => {
            let mut l = l.borrow_mut();
            let len = l.len();
            let ix = seq_index(y, len)?;
            if ix < len {
                l[ix] = v;
                Ok(())
            } else {
                Err(VmError::user("IndexError", "list assignment index out of range"))
            }
        }
        Value::Dict(d) => {
            let key = DictKey::from_value(y)?;
            d.borrow_mut().insert(key, v);
            Ok(())
        }
        _ => Err(VmError::user(
            "TypeError",
            format!(
                "'{}' object does not support item assignment",
                x.type_name()
            ),
        )),
    }
}

/// Suppression indexée (`del x[y]`).
pub fn delete_subscr(x: &Value, y: &Value) -> VmResult<()> {
    match x {
        Value::List(l) => {
            let mut l = l.borrow_mut();
            let len = l.len();
            let ix = seq_index(y, len)?;
            if ix < len {
                l.remove(ix);
                Ok(())
            } else {
                Err(VmError::user("IndexError", "list index out of range"))
            }
        }
        Value::Dict(d) => {
            let key = DictKey::from_value(y)?;
            if d.borrow_mut().remove(&key).is_none() {
                return Err(VmError::user_with("KeyError", vec![y.clone()]));
            }
            Ok(())
        }
        _ => Err(VmError::user(
            "TypeError",
            format!("'{}' object doesn't support item deletion", x.type_name()),
        )),
    }
}

/// Découpe `seq[start:stop]` (pas de 1 seulement).
fn slice_of(seq: &Value, start: &Value, stop: &Value) -> VmResult<Value> {
    let len = seq.py_len()?;
    let clamp = |v: &Value, default: usize| -> VmResult<usize> {
        match v {
            Value::None => Ok(default),
            Value::Int(i) => {
                let i = if *i < 0 { *i + len as i64 } else { *i };
                Ok(i.clamp(0, len as i64) as usize)
            }
            other => Err(VmError::user(
                "TypeError",
                format!("slice indices must be integers, not '{}'", other.type_name()),
            )),
        }
    };
    let lo = clamp(start, 0)?;
    let hi = clamp(stop, len)?.max(lo);
    match seq {
        Value::List(l) => Ok(Value::list(l.borrow()[lo..hi].to_vec())),
        Value::Tuple(t) => Ok(Value::tuple(t[lo..hi].to_vec())),
        Value::Str(s) => Ok(Value::str(
            s.chars().skip(lo).take(hi - lo).collect::<String>(),
        )),
        other => Err(VmError::user(
            "TypeError",
            format!("'{}' object is unsliceable", other.type_name()),
        )),
    }
}

/// Index séquentiel à la Python : négatif compte depuis la fin.
fn seq_index(v: &Value, len: usize) -> VmResult<usize> {
    let i = match v {
        Value::Int(i) => *i,
        Value::Bool(b) => i64::from(*b),
        other => {
            return Err(VmError::user(
                "TypeError",
                format!("indices must be integers, not '{}'", other.type_name()),
            ))
        }
    };
    let adjusted = if i < 0 { i + len as i64 } else { i };
    if adjusted < 0 {
        // Laisse le débordement haut au contrôle de l'appelant.
        return Ok(usize::MAX);
    }
    Ok(adjusted as usize)
}

fn add(x: Value, y: Value) -> VmResult<Value> {
    match (&x, &y) {
        (Value::Str(a), Value::Str(b)) => Ok(Value::str(format!("{a}{b}"))),
        (Value::List(a), Value::List(b)) => {
            let mut out = a.borrow().clone();
            out.extend(b.borrow().iter().cloned());
            Ok(Value::List(gc(out)))
        }
        (Value::Tuple(a), Value::Tuple(b)) => {
            let mut out: Vec<Value> = a.to_vec();
            out.extend(b.iter().cloned());
            Ok(Value::tuple(out))
        }
        _ => num_op("+", x, y, |a, b| Ok(a + b), |a, b| Ok(a + b)),
    }
}

fn multiply(x: Value, y: Value) -> VmResult<Value> {
    let repeat = |seq: &Value, n: i64| -> Option<Value> {
        let n = n.max(0) as usize;
        match seq {
            Value::Str(s) => Some(Value::str(s.repeat(n))),
            Value::List(l) => {
                let src = l.borrow();
                let mut out = Vec::with_capacity(src.len() * n);
                for _ in 0..n {
                    out.extend(src.iter().cloned());
                }
                Some(Value::List(gc(out)))
            }
            Value::Tuple(t) => {
                let mut out = Vec::with_capacity(t.len() * n);
                for _ in 0..n {
                    out.extend(t.iter().cloned());
                }
                Some(Value::tuple(out))
            }
            _ => None,
        }
    };
    if let (seq, Value::Int(n)) | (Value::Int(n), seq) = (&x, &y) {
        if let Some(v) = repeat(seq, *n) {
            return Ok(v);
        }
    }
    num_op("*", x, y, |a, b| Ok(a * b), |a, b| Ok(a * b))
}

fn to_f64(n: Num) -> f64 {
    match n {
        Num::Int(i) => i as f64,
        Num::Float(x) => x,
    }
}

fn num_op(
    op: &str,
    x: Value,
    y: Value,
    fi: impl FnOnce(i64, i64) -> VmResult<i64>,
    ff: impl FnOnce(f64, f64) -> VmResult<f64>,
) -> VmResult<Value> {
    match (as_num(&x), as_num(&y)) {
        (Some(Num::Int(a)), Some(Num::Int(b))) => Ok(Value::Int(fi(a, b)?)),
        (Some(a), Some(b)) => Ok(Value::Float(ff(to_f64(a), to_f64(b))?)),
        _ => Err(type_error(op, &x, &y)),
    }
}

fn int_op(
    op: &str,
    x: Value,
    y: Value,
    f: impl FnOnce(i64, i64) -> VmResult<i64>,
) -> VmResult<Value> {
    match (as_num(&x), as_num(&y)) {
        (Some(Num::Int(a)), Some(Num::Int(b))) => Ok(Value::Int(f(a, b)?)),
        _ => Err(type_error(op, &x, &y)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn int(i: i64) -> Value {
        Value::Int(i)
    }

    #[test]
    fn int_arith_and_promotion() {
        assert_eq!(binary("ADD", int(2), int(3)).unwrap().to_string(), "5");
        assert_eq!(
            binary("TRUE_DIVIDE", int(7), int(2)).unwrap().to_string(),
            "3.5"
        );
        assert_eq!(
            binary("ADD", int(1), Value::Float(0.5)).unwrap().to_string(),
            "1.5"
        );
    }

    #[test]
    fn floor_and_modulo_follow_divisor_sign() {
        assert_eq!(binary("FLOOR_DIVIDE", int(7), int(2)).unwrap().to_string(), "3");
        assert_eq!(binary("FLOOR_DIVIDE", int(-7), int(2)).unwrap().to_string(), "-4");
        assert_eq!(binary("MODULO", int(7), int(-3)).unwrap().to_string(), "-2");
        assert_eq!(binary("MODULO", int(-7), int(3)).unwrap().to_string(), "2");
        assert_eq!(binary("MODULO", int(7), int(3)).unwrap().to_string(), "1");
    }

    #[test]
    fn zero_division_is_user_error() {
        let err = binary("TRUE_DIVIDE", int(1), int(0)).unwrap_err();
        match err {
            VmError::User(e) => assert_eq!(e.etype.name, "ZeroDivisionError"),
            other => panic!("attendu User, got {other:?}"),
        }
    }

    #[test]
    fn string_and_sequence_operators() {
        assert_eq!(
            binary("ADD", Value::str("ab"), Value::str("cd")).unwrap().to_string(),
            "abcd"
        );
        assert_eq!(
            binary("MULTIPLY", Value::str("ab"), int(3)).unwrap().to_string(),
            "ababab"
        );
        let l = binary(
            "ADD",
            Value::list(vec![int(1)]),
            Value::list(vec![int(2)]),
        )
        .unwrap();
        assert_eq!(l.to_string(), "[1, 2]");
    }

    #[test]
    fn remainder_is_modulo_alias() {
        assert_eq!(binary("REMAINDER", int(7), int(3)).unwrap().to_string(), "1");
    }

    #[test]
    fn inplace_add_mutates_list_in_place() {
        let l = Value::list(vec![int(1)]);
        let l2 = l.clone();
        let got = inplace("INPLACE_ADD", l, Value::list(vec![int(2)])).unwrap();
        assert!(got.py_is(&l2));
        assert_eq!(l2.to_string(), "[1, 2]");
    }

    #[test]
    fn unary_family() {
        assert_eq!(unary("NEGATIVE", int(5)).unwrap().to_string(), "-5");
        assert_eq!(unary("NOT", int(0)).unwrap().to_string(), "True");
        assert_eq!(unary("INVERT", int(0)).unwrap().to_string(), "-1");
        assert_eq!(unary("CONVERT", Value::str("x")).unwrap().to_string(), "\"x\"");
    }

    #[test]
    fn compare_family() {
        assert_eq!(compare("<", &int(1), &int(2)).unwrap().to_string(), "True");
        assert_eq!(
            compare("in", &int(2), &Value::list(vec![int(1), int(2)]))
                .unwrap()
                .to_string(),
            "True"
        );
        assert_eq!(
            compare("is not", &Value::None, &Value::None).unwrap().to_string(),
            "False"
        );
        assert!(compare("<", &Value::str("a"), &int(1)).is_err());
    }

    #[test]
    fn exception_match_uses_hierarchy() {
        let inst = Value::Exception(Rc::new(crate::object::ExcInstance {
            etype: crate::object::ExcType::builtin("KeyError"),
            args: vec![],
        }));
        let lookup = Value::ExcType(crate::object::ExcType::builtin("LookupError"));
        let value = Value::ExcType(crate::object::ExcType::builtin("ValueError"));
        assert!(exception_match(&inst, &lookup).unwrap());
        assert!(!exception_match(&inst, &value).unwrap());
        let tup = Value::tuple(vec![value, lookup]);
        assert!(exception_match(&inst, &tup).unwrap());
    }

    #[test]
    fn subscr_and_store() {
        let l = Value::list(vec![int(10), int(20)]);
        assert_eq!(subscr(&l, &int(-1)).unwrap().to_string(), "20");
        store_subscr(&l, &int(0), int(99)).unwrap();
        assert_eq!(l.to_string(), "[99, 20]");
        assert!(matches!(
            subscr(&l, &int(5)),
            Err(VmError::User(e)) if e.etype.name == "IndexError"
        ));
        let d = Value::Dict(gc(Default::default()));
        store_subscr(&d, &Value::str("k"), int(1)).unwrap();
        assert_eq!(subscr(&d, &Value::str("k")).unwrap().to_string(), "1");
        assert!(matches!(
            subscr(&d, &Value::str("absent")),
            Err(VmError::User(e)) if e.etype.name == "KeyError"
        ));
    }
}
