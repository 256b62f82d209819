//! frame.rs — Enregistrements d'activation et pile de blocs.
//!
//! Une frame porte sa propre pile d'opérandes et sa pile de blocs ; la VM
//! n'exécute jamais qu'une frame à la fois. Les blocs marquent les portées
//! lexicales (boucles, handlers d'exception, gestionnaires de contexte) et
//! retiennent la hauteur de pile à restaurer lors de l'unwinding.

use std::fmt;
use std::rc::Rc;

use ahash::AHashMap;
use viper_core::CodeObject;

use crate::value::{Gc, Namespace, Value};

/// Signal de terminaison non normale renvoyé par un handler d'opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Why {
    Return,
    Yield,
    Continue,
    Break,
    Exception,
    Reraise,
    Silenced,
}

impl fmt::Display for Why {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Why::Return => "return",
            Why::Yield => "yield",
            Why::Continue => "continue",
            Why::Break => "break",
            Why::Exception => "exception",
            Why::Reraise => "reraise",
            Why::Silenced => "silenced",
        };
        f.write_str(s)
    }
}

/// Nature d'un bloc de la pile de blocs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Loop,
    /// try/except (versions qui l'émettent encore).
    SetupExcept,
    Finally,
    /// Gestionnaire de contexte 2.x.
    With,
    /// Bloc poussé par le moteur d'unwinding quand un handler s'ouvre.
    ExceptHandler,
}

/// Bloc : `(nature, offset du handler, hauteur de pile à l'entrée)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub kind: BlockKind,
    pub handler: usize,
    pub level: usize,
}

/// Cycle de vie d'une frame (les générateurs passent par `Suspended`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FrameStatus {
    #[default]
    New,
    Running,
    Suspended,
    Finished,
}

/// Enregistrement d'activation.
pub struct Frame {
    pub code: Rc<CodeObject>,
    pub globals: Namespace,
    pub locals: Namespace,
    /// Cellules, indexées cellvars puis freevars.
    pub cells: Vec<Gc<Value>>,
    /// Pile d'opérandes ; le sommet est le dernier élément.
    pub stack: Vec<Value>,
    pub block_stack: Vec<Block>,
    /// Offset de l'instruction courante ; `-1` tant que rien n'a tourné.
    pub lasti: isize,
    /// Vrai : le prochain fetch avance d'une instruction. Faux : il relit
    /// `lasti` tel quel (posé par tout saut).
    pub fallthrough: bool,
    pub line_starts: AHashMap<usize, u32>,
    pub lineno: u32,
    pub status: FrameStatus,
}

impl Frame {
    pub fn new(code: Rc<CodeObject>, globals: Namespace, locals: Namespace) -> Self {
        let line_starts = code.line_starts.iter().copied().collect();
        let lineno = code.firstlineno;
        Self {
            code,
            globals,
            locals,
            cells: Vec::new(),
            stack: Vec::new(),
            block_stack: Vec::new(),
            lasti: -1,
            fallthrough: false,
            line_starts,
            lineno,
            status: FrameStatus::New,
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<frame {} at {}:{} lasti={} stack={} blocks={}>",
            self.code.name,
            self.code.filename,
            self.lineno,
            self.lasti,
            self.stack.len(),
            self.block_stack.len(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::gc;
    use viper_core::{CodeObject, PyVersion};

    #[test]
    fn fresh_frame_has_sentinel_ip() {
        let code = CodeObject::builder("m", PyVersion::V36).build();
        let ns = gc(AHashMap::new());
        let f = Frame::new(code, ns.clone(), ns);
        assert_eq!(f.lasti, -1);
        assert!(!f.fallthrough);
        assert_eq!(f.status, FrameStatus::New);
        assert!(f.stack.is_empty() && f.block_stack.is_empty());
    }
}
