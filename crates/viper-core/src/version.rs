//! version.rs — Triplets de version du bytecode et variante d'interpréteur.
//!
//! Le décodeur et le moteur d'unwinding changent de comportement selon la
//! version cible : wordcode à partir de 3.6, sauts en unités de 2 octets à
//! partir de 3.10, protocole d'appel refondu en 3.11.

use std::fmt;

/// Version de bytecode ciblée, `(major, minor)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PyVersion(pub u8, pub u8);

impl PyVersion {
    pub const V27: PyVersion = PyVersion(2, 7);
    pub const V36: PyVersion = PyVersion(3, 6);
    pub const V37: PyVersion = PyVersion(3, 7);
    pub const V38: PyVersion = PyVersion(3, 8);
    pub const V39: PyVersion = PyVersion(3, 9);
    pub const V310: PyVersion = PyVersion(3, 10);
    pub const V311: PyVersion = PyVersion(3, 11);

    /// Toutes les versions supportées, croissantes.
    pub const SUPPORTED: &'static [PyVersion] = &[
        Self::V27,
        Self::V36,
        Self::V37,
        Self::V38,
        Self::V39,
        Self::V310,
        Self::V311,
    ];

    /// Wordcode : chaque instruction fait exactement 2 octets (opcode, arg).
    pub fn is_wordcode(self) -> bool {
        self >= Self::V36
    }

    /// Unité des arguments de saut : 2 octets à partir de 3.10, 1 avant.
    pub fn jump_unit(self) -> u32 {
        if self >= Self::V310 {
            2
        } else {
            1
        }
    }

    /// Décalage du champ argument appliqué par EXTENDED_ARG.
    pub fn extended_arg_shift(self) -> u32 {
        if self.is_wordcode() {
            8
        } else {
            16
        }
    }

    /// Taille en octets d'une instruction, selon qu'elle porte un argument.
    pub fn instruction_size(self, has_arg: bool) -> usize {
        if self.is_wordcode() {
            2
        } else if has_arg {
            3
        } else {
            1
        }
    }

    /// Parse `"3.10"` (pour la CLI et les fixtures de test).
    pub fn parse(s: &str) -> Option<PyVersion> {
        let (maj, min) = s.split_once('.')?;
        let v = PyVersion(maj.parse().ok()?, min.parse().ok()?);
        Self::SUPPORTED.contains(&v).then_some(v)
    }
}

impl fmt::Display for PyVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.0, self.1)
    }
}

/// Variante d'interpréteur ayant produit le bytecode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Variant {
    #[default]
    CPython,
    PyPy,
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Variant::CPython => f.write_str("cpython"),
            Variant::PyPy => f.write_str("pypy"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_follows_tuples() {
        assert!(PyVersion::V27 < PyVersion::V36);
        assert!(PyVersion::V310 < PyVersion::V311);
        assert!(PyVersion(3, 9) >= PyVersion::V39);
    }

    #[test]
    fn wordcode_and_jump_units() {
        assert!(!PyVersion::V27.is_wordcode());
        assert!(PyVersion::V36.is_wordcode());
        assert_eq!(PyVersion::V39.jump_unit(), 1);
        assert_eq!(PyVersion::V310.jump_unit(), 2);
        assert_eq!(PyVersion::V27.instruction_size(true), 3);
        assert_eq!(PyVersion::V27.instruction_size(false), 1);
        assert_eq!(PyVersion::V311.instruction_size(true), 2);
    }

    #[test]
    fn parse_known_versions() {
        assert_eq!(PyVersion::parse("2.7"), Some(PyVersion::V27));
        assert_eq!(PyVersion::parse("3.11"), Some(PyVersion::V311));
        assert_eq!(PyVersion::parse("3.4"), None);
        assert_eq!(PyVersion::parse("nope"), None);
    }
}
