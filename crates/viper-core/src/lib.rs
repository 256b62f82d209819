//! viper-core — Cœur de l'interpréteur viper
//!
//! Contient tout ce qu'il faut pour décrire du bytecode CPython, sans
//! dépendre de la machine virtuelle complète.
//!
//! ## Modules
//! - `version` : triplets de version (2.7 à 3.11) et variante (CPython/PyPy).
//! - `code`    : objets code immuables (instructions, constantes, tables de noms).
//! - `opcodes` : tables d'opcodes par version, construites par diffs.
//! - `asm`     : assembleur texte → `CodeObject` (tests, CLI).
//!
//! La lecture du format disque (.pyc, marshal) n'est pas de ce ressort :
//! le cœur consomme des objets code déjà décodés.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms, unused_must_use)]

pub mod asm;
pub mod code;
pub mod opcodes;
pub mod version;

// ---------- Reexports de confort ----------
pub use code::{CodeBuilder, CodeFlags, CodeObject, Const};
pub use opcodes::{opcode_table, OpcodeTable, TableError};
pub use version::{PyVersion, Variant};

/// Version du crate (lisible, via Cargo).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
