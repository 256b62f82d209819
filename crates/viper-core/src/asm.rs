//! asm.rs — Assembleur texte → `CodeObject` (MVP).
//!
//! Format ligne à ligne, pensé pour les tests et la CLI :
//!
//! ```text
//!     ; commentaire
//!     .arg   x              ; déclare un paramètre (varnames + argcount)
//!     .local tmp            ; déclare un local
//!     .cell  c              ; déclare une variable cellule
//!     .free  f              ; déclare une variable libre
//!     .flags GENERATOR      ; pose un drapeau du code object
//!     .line  12             ; l'offset courant ouvre la ligne source 12
//! start:
//!     LOAD_CONST 5
//!     POP_JUMP_IF_FALSE @end
//!     JUMP_ABSOLUTE @start
//! end:
//!     RETURN_VALUE
//! ```
//!
//! Les opérandes sont résolus selon la catégorie de l'opcode dans la table
//! de la version visée : littéral de constante, identifiant de nom/local/
//! cellule, cible `@label` (delta ou absolu, en unités de saut de la
//! version), nom de prédicat de comparaison, ou entier brut. Les arguments
//! numériques trop larges pour une unité émettent EXTENDED_ARG ; les
//! cibles de labels doivent tenir dans une unité (seconde passe à taille
//! fixe).

use std::rc::Rc;

use ahash::AHashMap;
use thiserror::Error;

use crate::code::{CodeBuilder, CodeFlags, CodeObject, Const};
use crate::opcodes::{opcode_table, ArgKind, OpcodeTable, TableError};
use crate::version::{PyVersion, Variant};

/// Erreurs d'assemblage, avec la ligne source fautive.
#[derive(Debug, Error)]
pub enum AsmError {
    #[error("ligne {line}: opcode inconnu {name:?}")]
    UnknownOp { line: usize, name: String },
    #[error("ligne {line}: opérande manquant pour {name}")]
    MissingOperand { line: usize, name: String },
    #[error("ligne {line}: opérande inattendu {operand:?} pour {name}")]
    UnexpectedOperand {
        line: usize,
        name: String,
        operand: String,
    },
    #[error("ligne {line}: opérande invalide {operand:?} : {reason}")]
    BadOperand {
        line: usize,
        operand: String,
        reason: String,
    },
    #[error("ligne {line}: directive inconnue {directive:?}")]
    UnknownDirective { line: usize, directive: String },
    #[error("label {0:?} non défini")]
    UndefinedLabel(String),
    #[error("label {0:?} défini deux fois")]
    DuplicateLabel(String),
    #[error("ligne {line}: cible de saut hors de portée (arg {arg})")]
    JumpOutOfRange { line: usize, arg: i64 },
    #[error(transparent)]
    Table(#[from] TableError),
}

/// Assemble `src` pour `version` (variante CPython, module nommé `<module>`).
pub fn assemble(src: &str, version: PyVersion) -> Result<Rc<CodeObject>, AsmError> {
    assemble_named(src, version, Variant::CPython, "<module>")
}

/// Assemble en fixant variante et nom du code object.
pub fn assemble_named(
    src: &str,
    version: PyVersion,
    variant: Variant,
    name: &str,
) -> Result<Rc<CodeObject>, AsmError> {
    let table = opcode_table(version, variant)?;
    let mut asm = Assembler {
        table,
        version,
        builder: CodeObject::builder(name, version).variant(variant),
        labels: AHashMap::new(),
        fixups: Vec::new(),
    };
    for (ix, raw) in src.lines().enumerate() {
        asm.line(ix + 1, raw)?;
    }
    asm.finish()
}

/// Fixup de label à résoudre en seconde passe.
struct Fixup {
    src_line: usize,
    label: String,
    /// Offset de l'octet d'argument à réécrire.
    patch_at: usize,
    /// Offset juste après l'instruction (base des sauts relatifs).
    insn_end: usize,
    kind: ArgKind,
}

struct Assembler {
    table: OpcodeTable,
    version: PyVersion,
    builder: CodeBuilder,
    labels: AHashMap<String, usize>,
    fixups: Vec<Fixup>,
}

impl Assembler {
    fn line(&mut self, lineno: usize, raw: &str) -> Result<(), AsmError> {
        let text = strip_comment(raw).trim();
        if text.is_empty() {
            return Ok(());
        }

        if let Some(label) = text.strip_suffix(':') {
            let label = label.trim();
            if self
                .labels
                .insert(label.to_string(), self.builder.here())
                .is_some()
            {
                return Err(AsmError::DuplicateLabel(label.to_string()));
            }
            return Ok(());
        }

        if let Some(rest) = text.strip_prefix('.') {
            return self.directive(lineno, rest);
        }

        let (name, operand) = match text.split_once(char::is_whitespace) {
            Some((n, rest)) => (n, Some(rest.trim())),
            None => (text, None),
        };
        self.instruction(lineno, name, operand)
    }

    fn directive(&mut self, lineno: usize, rest: &str) -> Result<(), AsmError> {
        let (word, arg) = match rest.split_once(char::is_whitespace) {
            Some((w, a)) => (w, a.trim()),
            None => (rest, ""),
        };
        match word {
            "arg" => {
                self.builder.add_varname(arg);
                let n = self.builder.cur_argcount() + 1;
                self.builder.set_argcount(n);
                Ok(())
            }
            "local" => {
                self.builder.add_varname(arg);
                Ok(())
            }
            "cell" => {
                self.builder.add_cellvar(arg);
                Ok(())
            }
            "free" => {
                self.builder.add_freevar(arg);
                Ok(())
            }
            "line" => {
                let n: u32 = arg.parse().map_err(|_| AsmError::BadOperand {
                    line: lineno,
                    operand: arg.to_string(),
                    reason: "numéro de ligne attendu".into(),
                })?;
                self.builder.mark_line(n);
                Ok(())
            }
            "flags" => {
                for flag in arg.split('|').map(str::trim) {
                    let bit = match flag {
                        "OPTIMIZED" => CodeFlags::OPTIMIZED,
                        "NEWLOCALS" => CodeFlags::NEWLOCALS,
                        "VARARGS" => CodeFlags::VARARGS,
                        "VARKEYWORDS" => CodeFlags::VARKEYWORDS,
                        "NESTED" => CodeFlags::NESTED,
                        "GENERATOR" => CodeFlags::GENERATOR,
                        other => {
                            return Err(AsmError::BadOperand {
                                line: lineno,
                                operand: other.to_string(),
                                reason: "drapeau inconnu".into(),
                            })
                        }
                    };
                    self.builder.add_flags(bit);
                }
                Ok(())
            }
            other => Err(AsmError::UnknownDirective {
                line: lineno,
                directive: other.to_string(),
            }),
        }
    }

    fn instruction(
        &mut self,
        lineno: usize,
        name: &str,
        operand: Option<&str>,
    ) -> Result<(), AsmError> {
        let op = self
            .table
            .opcode(name)
            .ok_or_else(|| AsmError::UnknownOp {
                line: lineno,
                name: name.to_string(),
            })?;

        let kind = self.table.arg_kind(op);
        if kind == ArgKind::None {
            if let Some(text) = operand {
                return Err(AsmError::UnexpectedOperand {
                    line: lineno,
                    name: name.to_string(),
                    operand: text.to_string(),
                });
            }
            self.emit(op, 0);
            return Ok(());
        }

        let text = operand.ok_or_else(|| AsmError::MissingOperand {
            line: lineno,
            name: name.to_string(),
        })?;

        let arg: u32 = match kind {
            ArgKind::Const => {
                let c = parse_const(lineno, text)?;
                self.builder.add_const(c)
            }
            // 3.11 : le bit bas de LOAD_GLOBAL encode le push de NULL et
            // l'index de nom est décalé d'un bit (`NULL+nom` dans le listing).
            ArgKind::Name if self.version >= PyVersion::V311 && name == "LOAD_GLOBAL" => {
                let (null_bit, ident) = match text.strip_prefix("NULL+") {
                    Some(rest) => (1, rest.trim()),
                    None => (0, text),
                };
                (self.builder.add_name(ident) << 1) | null_bit
            }
            ArgKind::Name => self.builder.add_name(text),
            ArgKind::Local => self.builder.add_varname(text),
            ArgKind::Free => self.free_index(lineno, text)?,
            ArgKind::Compare => self.compare_index(lineno, text)?,
            ArgKind::JumpRel | ArgKind::JumpRelBack | ArgKind::JumpAbs => {
                if let Some(label) = text.strip_prefix('@') {
                    // Réservation à taille fixe, résolution en seconde passe.
                    let patch_at = self.builder.here() + 1;
                    let insn_end = self.builder.here() + self.table.instruction_size(op);
                    self.fixups.push(Fixup {
                        src_line: lineno,
                        label: label.to_string(),
                        patch_at,
                        insn_end,
                        kind,
                    });
                    self.emit(op, 0);
                    return Ok(());
                }
                parse_int(lineno, text)?
            }
            ArgKind::Raw => parse_int(lineno, text)?,
            ArgKind::None => unreachable!(),
        };

        self.emit_wide(op, arg);
        Ok(())
    }

    /// Index d'une variable cellule ou libre : cellvars d'abord, puis
    /// freevars décalées de |cellvars| (convention du décodeur).
    fn free_index(&mut self, lineno: usize, text: &str) -> Result<u32, AsmError> {
        if let Some(i) = self.builder.cellvars().iter().position(|c| c == text) {
            return Ok(i as u32);
        }
        if let Some(i) = self.builder.freevars().iter().position(|c| c == text) {
            return Ok((self.builder.cellvars().len() + i) as u32);
        }
        Err(AsmError::BadOperand {
            line: lineno,
            operand: text.to_string(),
            reason: "variable cellule/libre non déclarée (.cell/.free)".into(),
        })
    }

    fn compare_index(&mut self, lineno: usize, text: &str) -> Result<u32, AsmError> {
        if let Ok(n) = text.parse::<u32>() {
            return Ok(n);
        }
        (0..)
            .map_while(|i| self.table.cmp_name(i).map(|n| (i, n)))
            .find(|(_, n)| *n == text)
            .map(|(i, _)| i)
            .ok_or_else(|| AsmError::BadOperand {
                line: lineno,
                operand: text.to_string(),
                reason: "prédicat de comparaison inconnu".into(),
            })
    }

    /// Émet une instruction dont l'argument tient dans une unité.
    fn emit(&mut self, op: u8, arg: u8) {
        if self.version.is_wordcode() {
            self.builder.emit_raw(&[op, arg]);
        } else if self.table.has_arg(op) {
            self.builder.emit_raw(&[op, arg, 0]);
        } else {
            self.builder.emit_raw(&[op]);
        }
    }

    /// Émet, avec EXTENDED_ARG si l'argument déborde l'unité de la version.
    fn emit_wide(&mut self, op: u8, arg: u32) {
        if self.version.is_wordcode() {
            if arg > 0xFF_FFFF {
                self.builder
                    .emit_raw(&[self.table.extended_arg, (arg >> 24) as u8]);
            }
            if arg > 0xFFFF {
                self.builder
                    .emit_raw(&[self.table.extended_arg, (arg >> 16 & 0xFF) as u8]);
            }
            if arg > 0xFF {
                self.builder
                    .emit_raw(&[self.table.extended_arg, (arg >> 8 & 0xFF) as u8]);
            }
            self.builder.emit_raw(&[op, (arg & 0xFF) as u8]);
        } else {
            if arg > 0xFFFF {
                self.builder.emit_raw(&[
                    self.table.extended_arg,
                    (arg >> 16 & 0xFF) as u8,
                    (arg >> 24) as u8,
                ]);
            }
            if self.table.has_arg(op) {
                self.builder
                    .emit_raw(&[op, (arg & 0xFF) as u8, (arg >> 8 & 0xFF) as u8]);
            } else {
                self.builder.emit_raw(&[op]);
            }
        }
    }

    fn finish(mut self) -> Result<Rc<CodeObject>, AsmError> {
        let unit = self.version.jump_unit() as i64;
        for fixup in std::mem::take(&mut self.fixups) {
            let target = *self
                .labels
                .get(&fixup.label)
                .ok_or_else(|| AsmError::UndefinedLabel(fixup.label.clone()))? as i64;
            let arg = match fixup.kind {
                ArgKind::JumpRel => (target - fixup.insn_end as i64) / unit,
                ArgKind::JumpRelBack => (fixup.insn_end as i64 - target) / unit,
                ArgKind::JumpAbs => target / unit,
                _ => unreachable!(),
            };
            let max = if self.version.is_wordcode() { 0xFF } else { 0xFFFF };
            if arg < 0 || arg > max {
                return Err(AsmError::JumpOutOfRange {
                    line: fixup.src_line,
                    arg,
                });
            }
            self.builder.patch_byte(fixup.patch_at, (arg & 0xFF) as u8);
            if !self.version.is_wordcode() {
                self.builder
                    .patch_byte(fixup.patch_at + 1, (arg >> 8 & 0xFF) as u8);
            }
        }
        Ok(self.builder.build())
    }
}

/// Coupe le commentaire `;` (hors chaînes).
fn strip_comment(line: &str) -> &str {
    let mut in_str = false;
    for (i, ch) in line.char_indices() {
        match ch {
            '"' => in_str = !in_str,
            ';' if !in_str => return &line[..i],
            _ => {}
        }
    }
    line
}

fn parse_int(lineno: usize, text: &str) -> Result<u32, AsmError> {
    text.parse().map_err(|_| AsmError::BadOperand {
        line: lineno,
        operand: text.to_string(),
        reason: "entier attendu".into(),
    })
}

/// Littéral de constante : None/True/False, entier, flottant, chaîne
/// entre guillemets, ou tuple de littéraux `( .. , .. )`.
fn parse_const(lineno: usize, text: &str) -> Result<Const, AsmError> {
    let text = text.trim();
    match text {
        "None" => return Ok(Const::None),
        "True" => return Ok(Const::Bool(true)),
        "False" => return Ok(Const::Bool(false)),
        _ => {}
    }
    if let Some(body) = text.strip_prefix('"').and_then(|t| t.strip_suffix('"')) {
        return Ok(Const::Str(body.replace("\\n", "\n")));
    }
    if let Some(body) = text.strip_prefix('(').and_then(|t| t.strip_suffix(')')) {
        let mut items = Vec::new();
        for part in split_tuple(body) {
            let part = part.trim();
            if !part.is_empty() {
                items.push(parse_const(lineno, part)?);
            }
        }
        return Ok(Const::Tuple(items));
    }
    if let Ok(i) = text.parse::<i64>() {
        return Ok(Const::Int(i));
    }
    if let Ok(x) = text.parse::<f64>() {
        return Ok(Const::Float(x));
    }
    Err(AsmError::BadOperand {
        line: lineno,
        operand: text.to_string(),
        reason: "littéral de constante attendu".into(),
    })
}

/// Découpe les éléments d'un tuple au premier niveau (les chaînes peuvent
/// contenir des virgules).
fn split_tuple(body: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut in_str = false;
    let mut start = 0usize;
    for (i, ch) in body.char_indices() {
        match ch {
            '"' => in_str = !in_str,
            '(' if !in_str => depth += 1,
            ')' if !in_str => depth -= 1,
            ',' if !in_str && depth == 0 => {
                parts.push(&body[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&body[start..]);
    parts
}
