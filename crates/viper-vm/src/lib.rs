//! viper-vm — Machine virtuelle d'exécution du bytecode CPython
//!
//! Ce crate fournit une **VM à pile** pour exécuter les objets code décrits
//! par `viper-core`. Il expose :
//!
//! - un type [`PyVm`] construit pour une version cible (2.7 à 3.11),
//! - un modèle de valeurs dynamique [`Value`] (avec cellules, fonctions,
//!   générateurs et tracebacks),
//! - un système d'erreurs [`VmError`] qui sépare les fautes internes de la
//!   VM des exceptions du programme interprété,
//! - une table de handlers d'opcodes par version, construite par surcharges
//!   successives sur un socle 2.7,
//! - un petit *stdlib* optionnel (print, len, range…).
//!
//! Le point d'entrée est [`PyVm::run_code`] : on lui donne un objet code et
//! des espaces de noms, il rend la valeur produite ou une exception non
//! rattrapée sous forme de [`UncaughtException`].
//!
//! ### Exemple
//!
//! ```no_run
//! use viper_core::{asm, PyVersion};
//! use viper_vm::PyVm;
//!
//! let code = asm::assemble("LOAD_CONST 5\nRETURN_VALUE\n", PyVersion::V36).unwrap();
//! let mut vm = PyVm::new(PyVersion::V36).unwrap();
//! let val = vm.run_code(&code, None, None, true).unwrap();
//! println!("{val}");
//! ```

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms, unused_must_use)]

pub mod arith;
pub mod byteops;
pub mod error;
pub mod frame;
pub mod object;
pub mod stdlib;
pub mod value;
pub mod vm;

// ---------- Reexports de confort ----------
pub use error::{TraceRecord, UncaughtException, VmError, VmResult};
pub use frame::{Block, BlockKind, Frame, FrameStatus, Why};
pub use object::{ExcInstance, ExcType, Function, Generator, TraceEntry};
pub use value::{gc, DictKey, Gc, Namespace, Native, NativeFn, Value, ValueIter};
pub use vm::{Decoded, DefaultHost, Host, Operand, PyVm};
