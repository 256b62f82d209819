//! error.rs — Taxonomie d'erreurs de la VM.
//!
//! Trois familles étanches :
//! - `Internal` : bytecode malformé, handler manquant, invariant cassé.
//!   Fatal, remonte à l'appelant de la VM, jamais rattrapable côté bytecode.
//! - `User` : exception typée du programme interprété. Capturée par la
//!   couche de dispatch, routée dans le moteur d'unwinding, ne sort de
//!   `run_code` que convertie en `Uncaught`.
//! - `Uncaught` : ce que `run_code` rend quand aucun bloc n'a rattrapé.
//!
//! `Runtime` est la catégorie récupérable réservée, distincte des
//! exceptions utilisateur.

use std::fmt;
use std::rc::Rc;

use thiserror::Error;

use crate::object::{ExcInstance, ExcType};
use crate::value::Value;

pub type VmResult<T> = Result<T, VmError>;

/// Erreurs de la VM.
#[derive(Debug, Error)]
pub enum VmError {
    /// Invariant interne violé (fatal, non rattrapable en bytecode).
    #[error("erreur interne de la vm : {0}")]
    Internal(String),
    /// Condition interne récupérable (catégorie réservée).
    #[error("erreur d'exécution de la vm : {0}")]
    Runtime(String),
    /// Exception du programme interprété, en cours de propagation.
    #[error("exception : {0}")]
    User(Rc<ExcInstance>),
    /// Exception arrivée au fond de la pile de frames sans handler.
    #[error("exception non rattrapée : {0}")]
    Uncaught(UncaughtException),
}

impl VmError {
    /// Exception utilisateur avec un message simple.
    pub fn user(kind: &'static str, msg: impl Into<String>) -> VmError {
        VmError::User(Rc::new(ExcInstance {
            etype: ExcType::builtin(kind),
            args: vec![Value::str(msg.into())],
        }))
    }

    /// Exception utilisateur avec des arguments arbitraires.
    pub fn user_with(kind: &'static str, args: Vec<Value>) -> VmError {
        VmError::User(Rc::new(ExcInstance {
            etype: ExcType::builtin(kind),
            args,
        }))
    }
}

/// Une entrée de traceback : `(fichier, ligne, fonction)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceRecord {
    pub filename: String,
    pub lineno: u32,
    pub name: String,
}

/// Enregistrement d'exception non rattrapée : triple indexable
/// `(nom du type, arguments, chaîne de traceback)`, traceback du plus
/// profond au moins profond.
#[derive(Debug, Clone)]
pub struct UncaughtException {
    pub name: String,
    pub args: Vec<Value>,
    pub traceback: Vec<TraceRecord>,
}

impl UncaughtException {
    /// Nom du type d'exception (indice 0 du triple).
    pub fn kind_name(&self) -> &str {
        &self.name
    }

    /// Arguments (indice 1).
    pub fn args(&self) -> &[Value] {
        &self.args
    }

    /// Chaîne de traceback (indice 2), la plus profonde d'abord.
    pub fn traceback(&self) -> &[TraceRecord] {
        &self.traceback
    }
}

impl fmt::Display for UncaughtException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        for (i, a) in self.args.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            f.write_str(&a.repr())?;
        }
        f.write_str(")")?;
        for t in &self.traceback {
            write!(f, "\n  File \"{}\", line {}, in {}", t.filename, t.lineno, t.name)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_helper_builds_typed_exception() {
        let err = VmError::user("ValueError", "boom");
        match err {
            VmError::User(e) => {
                assert_eq!(e.etype.name, "ValueError");
                assert_eq!(e.args[0].to_string(), "boom");
            }
            other => panic!("attendu User, got {other:?}"),
        }
    }

    #[test]
    fn uncaught_displays_traceback() {
        let exc = UncaughtException {
            name: "KeyError".into(),
            args: vec![Value::str("k")],
            traceback: vec![TraceRecord {
                filename: "<asm>".into(),
                lineno: 3,
                name: "<module>".into(),
            }],
        };
        let text = exc.to_string();
        assert!(text.starts_with("KeyError(\"k\")"));
        assert!(text.contains("line 3"));
    }
}
