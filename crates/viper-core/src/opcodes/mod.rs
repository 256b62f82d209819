//! opcodes/mod.rs — Tables d'opcodes par version.
//!
//! Chaque version cible fournit : la table `opname` (numéro → nom), la map
//! inverse `opmap`, les ensembles de catégories (sauts relatifs/absolus,
//! opérandes nom/local/libre/constante, comparaisons), le seuil
//! `HAVE_ARGUMENT`, l'opcode `EXTENDED_ARG` et la liste des prédicats de
//! comparaison.
//!
//! Construction par diffs : 2.7 et 3.6 sont définies de zéro (la
//! renumérotation wordcode ne laisse rien à hériter), chaque version
//! suivante applique ses ajouts/retraits sur la précédente, et la variante
//! PyPy pose une petite surcouche. Ajouter une version = écrire un diff.

use std::fmt;

use ahash::AHashMap;
use thiserror::Error;

use crate::version::{PyVersion, Variant};

mod pypy;
mod v27;
mod v310;
mod v311;
mod v36;
mod v37;
mod v38;
mod v39;

pub use v311::NB_OPS;

/// Erreurs de construction ou d'interrogation d'une table.
#[derive(Debug, Error)]
pub enum TableError {
    #[error("version de bytecode non supportée : {0}")]
    UnsupportedVersion(PyVersion),
    #[error("diff d'opcodes incohérent : {0}")]
    BadDiff(String),
}

/// Ensemble d'opcodes, un bit par numéro.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpSet([u64; 4]);

impl OpSet {
    pub fn insert(&mut self, op: u8) {
        self.0[(op >> 6) as usize] |= 1 << (op & 63);
    }

    pub fn remove(&mut self, op: u8) {
        self.0[(op >> 6) as usize] &= !(1 << (op & 63));
    }

    pub fn contains(&self, op: u8) -> bool {
        self.0[(op >> 6) as usize] & (1 << (op & 63)) != 0
    }

    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        (0..=255u8).filter(|op| self.contains(*op))
    }
}

/// Catégorie d'opérande d'un opcode (résolution côté décodeur).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    /// Pas d'argument.
    None,
    /// Entier brut (compteurs, drapeaux).
    Raw,
    /// Index dans le pool de constantes.
    Const,
    /// Index dans `names`.
    Name,
    /// Index dans `varnames`.
    Local,
    /// Index dans `cellvars` puis `freevars`.
    Free,
    /// Saut relatif avant (cible = fin d'instruction + delta).
    JumpRel,
    /// Saut relatif arrière (3.11 : cible = fin d'instruction - delta).
    JumpRelBack,
    /// Saut absolu.
    JumpAbs,
    /// Index dans la liste des prédicats de comparaison.
    Compare,
}

/// Table d'opcodes d'une version donnée.
pub struct OpcodeTable {
    pub version: PyVersion,
    pub variant: Variant,
    opname: [Option<&'static str>; 256],
    opmap: AHashMap<&'static str, u8>,
    jrel: OpSet,
    jrel_back: OpSet,
    jabs: OpSet,
    name_ops: OpSet,
    local_ops: OpSet,
    free_ops: OpSet,
    const_ops: OpSet,
    compare_ops: OpSet,
    have_argument: u8,
    pub extended_arg: u8,
    cmp_op: &'static [&'static str],
}

impl fmt::Debug for OpcodeTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpcodeTable")
            .field("version", &self.version)
            .field("variant", &self.variant)
            .field("defined", &self.opmap.len())
            .finish()
    }
}

/// Prédicats de comparaison, versions < 3.9.
pub const CMP_OP_FULL: &[&str] = &[
    "<", "<=", "==", "!=", ">", ">=", "in", "not in", "is", "is not",
    "exception match", "BAD",
];

/// Prédicats de comparaison à partir de 3.9 (le reste est devenu
/// IS_OP / CONTAINS_OP / JUMP_IF_NOT_EXC_MATCH).
pub const CMP_OP_SHORT: &[&str] = &["<", "<=", "==", "!=", ">", ">="];

impl OpcodeTable {
    /// Nom d'un opcode, s'il est défini pour cette version.
    pub fn opname(&self, op: u8) -> Option<&'static str> {
        self.opname[op as usize]
    }

    /// Numéro d'un opcode par nom.
    pub fn opcode(&self, name: &str) -> Option<u8> {
        self.opmap.get(name).copied()
    }

    /// L'opcode porte-t-il un argument ?
    pub fn has_arg(&self, op: u8) -> bool {
        op >= self.have_argument
    }

    /// Catégorie d'opérande de `op`.
    pub fn arg_kind(&self, op: u8) -> ArgKind {
        if !self.has_arg(op) {
            ArgKind::None
        } else if self.const_ops.contains(op) {
            ArgKind::Const
        } else if self.name_ops.contains(op) {
            ArgKind::Name
        } else if self.local_ops.contains(op) {
            ArgKind::Local
        } else if self.free_ops.contains(op) {
            ArgKind::Free
        } else if self.jrel_back.contains(op) {
            ArgKind::JumpRelBack
        } else if self.jrel.contains(op) {
            ArgKind::JumpRel
        } else if self.jabs.contains(op) {
            ArgKind::JumpAbs
        } else if self.compare_ops.contains(op) {
            ArgKind::Compare
        } else {
            ArgKind::Raw
        }
    }

    /// Nom du prédicat de comparaison d'index `ix`.
    pub fn cmp_name(&self, ix: u32) -> Option<&'static str> {
        self.cmp_op.get(ix as usize).copied()
    }

    /// Taille en octets de l'instruction portant `op`.
    pub fn instruction_size(&self, op: u8) -> usize {
        self.version.instruction_size(self.has_arg(op))
    }

    /// Les noms définis, pour les outils (assembleur, affichage).
    pub fn names(&self) -> impl Iterator<Item = (&'static str, u8)> + '_ {
        self.opmap.iter().map(|(n, c)| (*n, *c))
    }
}

/// Constructeur mutable utilisé par les modules de version.
pub(crate) struct TableBuilder {
    t: OpcodeTable,
}

impl TableBuilder {
    fn new(version: PyVersion, variant: Variant, cmp_op: &'static [&'static str]) -> Self {
        Self {
            t: OpcodeTable {
                version,
                variant,
                opname: [None; 256],
                opmap: AHashMap::new(),
                jrel: OpSet::default(),
                jrel_back: OpSet::default(),
                jabs: OpSet::default(),
                name_ops: OpSet::default(),
                local_ops: OpSet::default(),
                free_ops: OpSet::default(),
                const_ops: OpSet::default(),
                compare_ops: OpSet::default(),
                have_argument: 90,
                extended_arg: 0,
                cmp_op,
            },
        }
    }

    pub(crate) fn def_op(&mut self, name: &'static str, op: u8) {
        debug_assert!(
            self.t.opname[op as usize].is_none(),
            "opcode {op} deja defini ({name})"
        );
        self.t.opname[op as usize] = Some(name);
        self.t.opmap.insert(name, op);
    }

    pub(crate) fn name_op(&mut self, name: &'static str, op: u8) {
        self.def_op(name, op);
        self.t.name_ops.insert(op);
    }

    pub(crate) fn local_op(&mut self, name: &'static str, op: u8) {
        self.def_op(name, op);
        self.t.local_ops.insert(op);
    }

    pub(crate) fn free_op(&mut self, name: &'static str, op: u8) {
        self.def_op(name, op);
        self.t.free_ops.insert(op);
    }

    pub(crate) fn const_op(&mut self, name: &'static str, op: u8) {
        self.def_op(name, op);
        self.t.const_ops.insert(op);
    }

    pub(crate) fn jrel_op(&mut self, name: &'static str, op: u8) {
        self.def_op(name, op);
        self.t.jrel.insert(op);
    }

    pub(crate) fn jrel_back_op(&mut self, name: &'static str, op: u8) {
        self.def_op(name, op);
        self.t.jrel_back.insert(op);
    }

    pub(crate) fn jabs_op(&mut self, name: &'static str, op: u8) {
        self.def_op(name, op);
        self.t.jabs.insert(op);
    }

    pub(crate) fn compare_op(&mut self, name: &'static str, op: u8) {
        self.def_op(name, op);
        self.t.compare_ops.insert(op);
    }

    /// Retire un opcode (diff de version). Le couple (nom, numéro) doit
    /// correspondre à l'existant, sinon le diff est incohérent.
    pub(crate) fn rm_op(&mut self, name: &'static str, op: u8) -> Result<(), TableError> {
        if self.t.opname[op as usize] != Some(name) {
            return Err(TableError::BadDiff(format!(
                "rm_op {name}@{op} : trouvé {:?}",
                self.t.opname[op as usize]
            )));
        }
        self.t.opname[op as usize] = None;
        self.t.opmap.remove(name);
        self.t.jrel.remove(op);
        self.t.jrel_back.remove(op);
        self.t.jabs.remove(op);
        self.t.name_ops.remove(op);
        self.t.local_ops.remove(op);
        self.t.free_ops.remove(op);
        self.t.const_ops.remove(op);
        self.t.compare_ops.remove(op);
        Ok(())
    }

    pub(crate) fn set_extended_arg(&mut self, op: u8) {
        self.t.extended_arg = op;
    }

    pub(crate) fn set_cmp_op(&mut self, list: &'static [&'static str]) {
        self.t.cmp_op = list;
    }

    fn finish(self) -> OpcodeTable {
        debug_assert!(self.t.opname[self.t.extended_arg as usize] == Some("EXTENDED_ARG"));
        self.t
    }
}

/// Construit la table d'opcodes de `(version, variant)`.
pub fn opcode_table(version: PyVersion, variant: Variant) -> Result<OpcodeTable, TableError> {
    if !PyVersion::SUPPORTED.contains(&version) {
        return Err(TableError::UnsupportedVersion(version));
    }
    let mut b = TableBuilder::new(version, variant, CMP_OP_FULL);

    // Chaîne de diffs : chaque module pose sa couche puis rend la main.
    // 2.7, 3.6 et 3.11 repartent de zéro (renumérotations massives).
    if version < PyVersion::V36 {
        v27::install(&mut b)?;
    } else if version >= PyVersion::V311 {
        v311::install(&mut b)?;
    } else {
        v36::install(&mut b)?;
        if version >= PyVersion::V37 {
            v37::install(&mut b)?;
        }
        if version >= PyVersion::V38 {
            v38::install(&mut b)?;
        }
        if version >= PyVersion::V39 {
            v39::install(&mut b)?;
        }
        if version >= PyVersion::V310 {
            v310::install(&mut b)?;
        }
    }

    if variant == Variant::PyPy {
        pypy::install(&mut b, version)?;
    }

    Ok(b.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(v: PyVersion) -> OpcodeTable {
        opcode_table(v, Variant::CPython).expect("table")
    }

    #[test]
    fn opname_opmap_roundtrip_all_versions() {
        for &v in PyVersion::SUPPORTED {
            let t = table(v);
            for (name, op) in t.names() {
                assert_eq!(t.opname(op), Some(name), "{v}: {name}");
                assert_eq!(t.opcode(name), Some(op), "{v}: {name}");
            }
        }
    }

    #[test]
    fn category_members_are_defined() {
        for &v in PyVersion::SUPPORTED {
            let t = table(v);
            for op in 0..=255u8 {
                if t.arg_kind(op) != ArgKind::None && t.opname(op).is_some() {
                    assert!(t.has_arg(op), "{v}: opcode {op} catégorisé sans argument");
                }
            }
        }
    }

    #[test]
    fn v27_is_not_wordcode_and_has_print_ops() {
        let t = table(PyVersion::V27);
        assert_eq!(t.opcode("PRINT_ITEM"), Some(71));
        assert_eq!(t.opcode("SETUP_LOOP"), Some(120));
        assert_eq!(t.extended_arg, 145);
        assert_eq!(t.instruction_size(t.opcode("LOAD_CONST").unwrap()), 3);
        assert_eq!(t.instruction_size(t.opcode("POP_TOP").unwrap()), 1);
    }

    #[test]
    fn v36_wordcode_layout() {
        let t = table(PyVersion::V36);
        assert_eq!(t.opcode("LOAD_CONST"), Some(100));
        assert_eq!(t.extended_arg, 144);
        assert_eq!(t.instruction_size(100), 2);
        assert_eq!(t.instruction_size(1), 2);
        assert_eq!(t.arg_kind(100), ArgKind::Const);
        assert_eq!(t.arg_kind(110), ArgKind::JumpRel);
        assert_eq!(t.arg_kind(113), ArgKind::JumpAbs);
    }

    #[test]
    fn loop_blocks_gone_in_38() {
        let t37 = table(PyVersion::V37);
        let t38 = table(PyVersion::V38);
        assert!(t37.opcode("SETUP_LOOP").is_some());
        assert!(t38.opcode("SETUP_LOOP").is_none());
        assert!(t38.opcode("BEGIN_FINALLY").is_some());
        assert!(t37.opcode("LOAD_METHOD").is_some());
    }

    #[test]
    fn v39_compare_split() {
        let t38 = table(PyVersion::V38);
        let t39 = table(PyVersion::V39);
        assert_eq!(t38.cmp_name(8), Some("is"));
        assert_eq!(t39.cmp_name(8), None);
        assert!(t39.opcode("IS_OP").is_some());
        assert!(t39.opcode("CONTAINS_OP").is_some());
        assert!(t39.opcode("JUMP_IF_NOT_EXC_MATCH").is_some());
        assert!(t39.opcode("END_FINALLY").is_none());
        assert_eq!(t39.opcode("RERAISE"), Some(48));
    }

    #[test]
    fn v310_match_family_and_reraise_move() {
        let t = table(PyVersion::V310);
        assert_eq!(t.opcode("MATCH_MAPPING"), Some(31));
        assert_eq!(t.opcode("COPY_DICT_WITHOUT_KEYS"), Some(34));
        assert_eq!(t.opcode("RERAISE"), Some(119));
        assert_eq!(t.opcode("GEN_START"), Some(129));
    }

    #[test]
    fn v311_call_protocol_and_backward_jumps() {
        let t = table(PyVersion::V311);
        assert_eq!(t.opcode("PUSH_NULL"), Some(2));
        assert_eq!(t.opcode("CACHE"), Some(0));
        assert_eq!(t.opcode("CALL"), Some(171));
        assert_eq!(t.opcode("KW_NAMES"), Some(172));
        assert_eq!(t.arg_kind(172), ArgKind::Const);
        assert_eq!(t.arg_kind(140), ArgKind::JumpRelBack);
        assert_eq!(t.arg_kind(114), ArgKind::JumpRel);
        assert!(t.opcode("JUMP_ABSOLUTE").is_none());
        assert!(t.opcode("BINARY_ADD").is_none());
        assert_eq!(t.opcode("BINARY_OP"), Some(122));
    }

    #[test]
    fn pypy_overlay_adds_method_ops() {
        let t = opcode_table(PyVersion::V27, Variant::PyPy).expect("table");
        assert!(t.opcode("LOOKUP_METHOD").is_some());
        assert!(t.opcode("CALL_METHOD").is_some());
        let cp = table(PyVersion::V27);
        assert!(cp.opcode("LOOKUP_METHOD").is_none());
    }
}
