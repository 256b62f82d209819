//! vm.rs — La machine virtuelle : décodeur, boucle de dispatch, moteur
//! d'unwinding, plomberie d'appel.
//!
//! La boucle `eval_frame` est l'analogue de `_PyEval_EvalFrameDefault` :
//! fetch → décode → dispatch → si le handler signale une sortie non
//! normale, la pile de blocs est déroulée (`manage_block_stack`) jusqu'à
//! trouver un handler ou sortir de la frame. Les exceptions utilisateur
//! voyagent dans `last_exception` ; seules les fautes internes remontent
//! en `Err` fatal.

use std::rc::Rc;

use ahash::AHashMap;
use log::{debug, info, log_enabled, Level};
use viper_core::opcodes::ArgKind;
use viper_core::{opcode_table, CodeFlags, CodeObject, Const, OpcodeTable, PyVersion, Variant};

use crate::byteops::{self, HandlerTable};
use crate::error::{TraceRecord, UncaughtException, VmError, VmResult};
use crate::frame::{Block, BlockKind, Frame, FrameStatus, Why};
use crate::object::{ExcInstance, ExcType, Generator, TraceEntry};
use crate::value::{gc, Gc, Namespace, Value};
use crate::{arith, stdlib};

/// Environnement *host* minimal (sortie de `print` et consorts).
pub trait Host {
    /// Écrit `s` tel quel, sans retour à la ligne implicite.
    fn write(&mut self, s: &str);
}

/// Host par défaut : stdout du process.
#[derive(Default)]
pub struct DefaultHost;

impl Host for DefaultHost {
    fn write(&mut self, s: &str) {
        print!("{s}");
    }
}

/// Opérande résolu par le décodeur selon la catégorie de l'opcode.
#[derive(Debug, Clone)]
pub enum Operand {
    None,
    Raw(u32),
    Const(Value),
    Name(String),
    /// Cible de saut absolue, déjà multipliée par l'unité de la version.
    Jump(usize),
    Compare(&'static str),
}

/// Instruction décodée, prête pour le dispatch.
#[derive(Debug, Clone)]
pub struct Decoded {
    pub name: &'static str,
    pub opcode: u8,
    pub int_arg: Option<u32>,
    pub operand: Operand,
    pub offset: usize,
    pub line: Option<u32>,
}

impl Decoded {
    pub fn arg(&self) -> VmResult<u32> {
        self.int_arg
            .ok_or_else(|| VmError::Internal(format!("{} sans argument", self.name)))
    }

    pub fn jump_target(&self) -> VmResult<usize> {
        match self.operand {
            Operand::Jump(t) => Ok(t),
            _ => Err(VmError::Internal(format!(
                "{} : opérande de saut attendu",
                self.name
            ))),
        }
    }

    pub fn name_arg(&self) -> VmResult<&str> {
        match &self.operand {
            Operand::Name(n) => Ok(n),
            _ => Err(VmError::Internal(format!(
                "{} : opérande nom attendu",
                self.name
            ))),
        }
    }

    pub fn const_arg(&self) -> VmResult<Value> {
        match &self.operand {
            Operand::Const(v) => Ok(v.clone()),
            _ => Err(VmError::Internal(format!(
                "{} : opérande constante attendu",
                self.name
            ))),
        }
    }

    pub fn compare_arg(&self) -> VmResult<&'static str> {
        match self.operand {
            Operand::Compare(c) => Ok(c),
            _ => Err(VmError::Internal(format!(
                "{} : opérande de comparaison attendu",
                self.name
            ))),
        }
    }
}

/// Callback de décoration d'affichage par opcode (MAKE_FUNCTION montre le
/// nom de la fonction au sommet de pile, etc.).
pub type StackFmtFn = fn(&PyVm, Option<u32>) -> String;

const LINE_NUMBER_WIDTH: usize = 4;

/// Machine virtuelle pour une version de bytecode donnée.
pub struct PyVm {
    pub version: PyVersion,
    pub variant: Variant,
    /// Pile d'appel, frame la plus externe d'abord.
    frames: Vec<Gc<Frame>>,
    /// Frame courante.
    pub frame: Option<Gc<Frame>>,
    pub return_value: Value,
    /// Triple `(type, valeur, traceback)` de la dernière exception.
    pub last_exception: Option<(Value, Value, Value)>,
    pub last_traceback: Option<Rc<TraceEntry>>,
    /// Verrou anti-réentrance du log d'exception.
    in_exception_processing: bool,
    pub table: OpcodeTable,
    handlers: HandlerTable,
    stack_fmt: AHashMap<&'static str, StackFmtFn>,
    /// Tuple de noms posé par KW_NAMES, consommé par le CALL suivant (3.11).
    pub(crate) kw_names: Vec<String>,
    /// Crochet d'interruption consulté par les sauts arrière (3.11).
    /// Réservé : no-op tant qu'un host n'en fournit pas.
    pub interrupt: Option<fn() -> bool>,
    pub builtins: Namespace,
    host: Box<dyn Host>,
}

impl PyVm {
    /// Construit une VM CPython pour `version`.
    pub fn new(version: PyVersion) -> VmResult<Self> {
        Self::with_variant(version, Variant::CPython)
    }

    pub fn with_variant(version: PyVersion, variant: Variant) -> VmResult<Self> {
        let table = opcode_table(version, variant)
            .map_err(|e| VmError::Internal(e.to_string()))?;
        let mut vm = Self {
            version,
            variant,
            frames: Vec::new(),
            frame: None,
            return_value: Value::None,
            last_exception: None,
            last_traceback: None,
            in_exception_processing: false,
            table,
            handlers: byteops::handler_table(version, variant),
            stack_fmt: AHashMap::new(),
            kw_names: Vec::new(),
            interrupt: None,
            builtins: gc(AHashMap::new()),
            host: Box::<DefaultHost>::default(),
        };
        vm.stack_fmt.insert("MAKE_FUNCTION", fmt_make_function);
        stdlib::install_exceptions(&vm.builtins);
        Ok(vm)
    }

    /// VM avec le petit stdlib (print, len, range…) déjà installé.
    pub fn with_stdlib(version: PyVersion) -> VmResult<Self> {
        let mut vm = Self::new(version)?;
        stdlib::install(&mut vm);
        Ok(vm)
    }

    /// Installe un hôte personnalisé (capture de sortie en test).
    pub fn with_host(mut self, host: Box<dyn Host>) -> Self {
        self.host = host;
        self
    }

    pub fn host(&mut self) -> &mut dyn Host {
        self.host.as_mut()
    }

    /// Enregistre une décoration d'affichage pour un opcode.
    pub fn register_stack_fmt(&mut self, name: &'static str, f: StackFmtFn) {
        self.stack_fmt.insert(name, f);
    }

    // ------------------------------------------------------------------
    // Pile d'opérandes de la frame courante
    // ------------------------------------------------------------------

    fn cur(&self) -> VmResult<Gc<Frame>> {
        self.frame
            .clone()
            .ok_or_else(|| VmError::Internal("pas de frame courante".into()))
    }

    /// Frame courante (les handlers y accèdent pour locals, cells, statut).
    pub fn current_frame(&self) -> VmResult<Gc<Frame>> {
        self.cur()
    }

    pub fn push(&mut self, v: Value) -> VmResult<()> {
        self.cur()?.borrow_mut().stack.push(v);
        Ok(())
    }

    pub fn pop(&mut self) -> VmResult<Value> {
        self.cur()?
            .borrow_mut()
            .stack
            .pop()
            .ok_or_else(|| VmError::Internal("pile d'opérandes vide (pop)".into()))
    }

    /// Dépile `n` valeurs ; la plus profonde d'abord.
    pub fn popn(&mut self, n: usize) -> VmResult<Vec<Value>> {
        let frame = self.cur()?;
        let mut f = frame.borrow_mut();
        let len = f.stack.len();
        if len < n {
            return Err(VmError::Internal(format!(
                "pile d'opérandes trop courte (popn {n}, taille {len})"
            )));
        }
        Ok(f.stack.split_off(len - n))
    }

    /// Sommet de pile, sans dépiler.
    pub fn top(&self) -> VmResult<Value> {
        self.peek(1)
    }

    /// Valeur à la profondeur `n` (1 = sommet), sans dépiler.
    pub fn peek(&self, n: usize) -> VmResult<Value> {
        if n == 0 {
            return Err(VmError::Internal("peek attend n >= 1".into()));
        }
        let frame = self.cur()?;
        let f = frame.borrow();
        f.stack
            .get(f.stack.len().wrapping_sub(n))
            .cloned()
            .ok_or_else(|| VmError::Internal(format!("peek({n}) hors pile")))
    }

    /// Retire et rend la valeur à la profondeur `n` (1 = sommet).
    pub fn pop_at(&mut self, n: usize) -> VmResult<Value> {
        let frame = self.cur()?;
        let mut f = frame.borrow_mut();
        let len = f.stack.len();
        if n == 0 || n > len {
            return Err(VmError::Internal(format!("pop_at({n}) hors pile")));
        }
        Ok(f.stack.remove(len - n))
    }

    /// Écrase la valeur à la profondeur `n` (1 = sommet).
    pub fn set(&mut self, n: usize, v: Value) -> VmResult<()> {
        let frame = self.cur()?;
        let mut f = frame.borrow_mut();
        let len = f.stack.len();
        if n == 0 || n > len {
            return Err(VmError::Internal(format!("set({n}) hors pile")));
        }
        f.stack[len - n] = v;
        Ok(())
    }

    pub fn stack_len(&self) -> VmResult<usize> {
        Ok(self.cur()?.borrow().stack.len())
    }

    // ------------------------------------------------------------------
    // Pile de blocs
    // ------------------------------------------------------------------

    pub fn push_block(&mut self, kind: BlockKind, handler: usize) -> VmResult<()> {
        let frame = self.cur()?;
        let mut f = frame.borrow_mut();
        let level = f.stack.len();
        f.block_stack.push(Block { kind, handler, level });
        Ok(())
    }

    pub fn push_block_at_level(
        &mut self,
        kind: BlockKind,
        handler: usize,
        level: usize,
    ) -> VmResult<()> {
        self.cur()?
            .borrow_mut()
            .block_stack
            .push(Block { kind, handler, level });
        Ok(())
    }

    pub fn pop_block(&mut self) -> VmResult<Block> {
        self.cur()?
            .borrow_mut()
            .block_stack
            .pop()
            .ok_or_else(|| VmError::Internal("pile de blocs vide".into()))
    }

    pub fn top_block(&self) -> VmResult<Option<Block>> {
        Ok(self.cur()?.borrow().block_stack.last().copied())
    }

    /// Pose le pointeur d'instruction sur `target` ; le prochain fetch le
    /// relira tel quel.
    pub fn jump(&mut self, target: usize) -> VmResult<()> {
        let frame = self.cur()?;
        let mut f = frame.borrow_mut();
        f.lasti = target as isize;
        f.fallthrough = false;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Frames
    // ------------------------------------------------------------------

    /// Construit une frame pour `code`. `callargs` est versé dans les
    /// locals ; `closure` fournit les cellules des variables libres.
    pub fn make_frame(
        &mut self,
        code: Rc<CodeObject>,
        callargs: AHashMap<String, Value>,
        globals: Option<Namespace>,
        locals: Option<Namespace>,
        closure: &[Gc<Value>],
    ) -> VmResult<Gc<Frame>> {
        debug!(
            "make_frame: code={}, {} args, globals fournis: {}",
            code.name,
            callargs.len(),
            globals.is_some()
        );
        let (f_globals, mut f_locals) = match globals {
            Some(g) => {
                let l = locals.unwrap_or_else(|| g.clone());
                (g, l)
            }
            None => match &self.frame {
                Some(f) => {
                    let g = f.borrow().globals.clone();
                    let l = locals.unwrap_or_else(|| gc(AHashMap::new()));
                    (g, l)
                }
                None => {
                    let mut ns = AHashMap::new();
                    ns.insert("__name__".to_string(), Value::str("__main__"));
                    ns.insert("__doc__".to_string(), Value::None);
                    ns.insert("__package__".to_string(), Value::None);
                    let g = gc(ns);
                    (g.clone(), locals.unwrap_or(g))
                }
            },
        };

        // Drapeau NEWLOCALS : mapping neuf, clé sentinelle comprise.
        if code.flags.contains(CodeFlags::NEWLOCALS) {
            let mut ns = AHashMap::new();
            ns.insert(
                "__locals__".to_string(),
                Value::Dict(gc(AHashMap::new())),
            );
            f_locals = gc(ns);
        }
        f_locals.borrow_mut().extend(callargs);

        let mut frame = Frame::new(code.clone(), f_globals, f_locals);

        // Cellules : cellvars d'abord (initialisées depuis les locals quand
        // le nom est un paramètre), puis les cellules capturées. `Null`
        // marque la cellule vide, pour distinguer « non lié » de `None`.
        for name in &code.cellvars {
            let seed = frame
                .locals
                .borrow()
                .get(name)
                .cloned()
                .unwrap_or(Value::Null);
            frame.cells.push(gc(seed));
        }
        if !code.freevars.is_empty() {
            if closure.len() != code.freevars.len() {
                return Err(VmError::Internal(format!(
                    "fermeture de taille {} pour {} freevars",
                    closure.len(),
                    code.freevars.len()
                )));
            }
            frame.cells.extend(closure.iter().cloned());
        }

        Ok(gc(frame))
    }

    pub fn push_frame(&mut self, frame: Gc<Frame>) {
        self.frames.push(frame.clone());
        self.frame = Some(frame);
    }

    pub fn pop_frame(&mut self) {
        self.frames.pop();
        self.frame = self.frames.last().cloned();
    }

    pub fn frame_depth(&self) -> usize {
        self.frames.len()
    }

    // ------------------------------------------------------------------
    // Point d'entrée
    // ------------------------------------------------------------------

    /// Exécute `code` dans les espaces de noms fournis et rend la valeur
    /// produite. Au niveau racine (`toplevel`), vérifie qu'il ne reste ni
    /// frame ni donnée résiduelle.
    pub fn run_code(
        &mut self,
        code: &Rc<CodeObject>,
        globals: Option<Namespace>,
        locals: Option<Namespace>,
        toplevel: bool,
    ) -> Result<Value, VmError> {
        self.last_traceback = None;
        self.last_exception = None;
        let frame = self.make_frame(code.clone(), AHashMap::new(), globals, locals, &[])?;
        let val = self.eval_frame(&frame)?;

        if toplevel {
            if !self.frames.is_empty() {
                return Err(VmError::Internal(
                    "frames résiduelles après l'exécution".into(),
                ));
            }
            let residue = frame.borrow().stack.len();
            if residue != 0 {
                return Err(VmError::Internal(format!(
                    "{residue} valeur(s) résiduelle(s) sur la pile d'opérandes"
                )));
            }
        }
        Ok(val)
    }

    // ------------------------------------------------------------------
    // Décodeur
    // ------------------------------------------------------------------

    /// Décode l'instruction suivante de la frame courante, en appliquant
    /// le protocole d'accumulation EXTENDED_ARG.
    pub fn parse_byte_and_args(&mut self) -> VmResult<Decoded> {
        let frame = self.cur()?;
        let code = frame.borrow().code.clone();
        let bytes = &code.code;
        let mut extended: u32 = 0;

        loop {
            let offset;
            let line;
            {
                let mut f = frame.borrow_mut();
                if f.fallthrough {
                    let cur = f.lasti.max(0) as usize;
                    let op = *bytes.get(cur).ok_or_else(|| {
                        VmError::Internal(format!("offset {cur} hors du bytecode"))
                    })?;
                    f.lasti = (cur + self.table.instruction_size(op)) as isize;
                } else {
                    // Les sauts posent fallthrough=false ; un seul fetch
                    // au même offset, puis on ré-avance normalement.
                    f.fallthrough = true;
                    if f.lasti < 0 {
                        f.lasti = 0;
                    }
                }
                offset = f.lasti as usize;
                line = f.line_starts.get(&offset).copied();
                if let Some(l) = line {
                    f.lineno = l;
                }
            }

            let op = *bytes.get(offset).ok_or_else(|| {
                VmError::Internal(format!(
                    "offset {offset} hors du bytecode de {}",
                    code.name
                ))
            })?;
            let name = self.table.opname(op).ok_or_else(|| {
                VmError::Internal(format!(
                    "opcode {op} non défini en {} (offset {offset})",
                    self.version
                ))
            })?;

            if !self.table.has_arg(op) {
                return Ok(Decoded {
                    name,
                    opcode: op,
                    int_arg: None,
                    operand: Operand::None,
                    offset,
                    line,
                });
            }

            let int_arg = if self.version.is_wordcode() {
                let b = *bytes.get(offset + 1).ok_or_else(|| {
                    VmError::Internal("argument tronqué en fin de bytecode".into())
                })?;
                u32::from(b) | extended
            } else {
                let lo = *bytes.get(offset + 1).ok_or_else(|| {
                    VmError::Internal("argument tronqué en fin de bytecode".into())
                })?;
                let hi = *bytes.get(offset + 2).ok_or_else(|| {
                    VmError::Internal("argument tronqué en fin de bytecode".into())
                })?;
                u32::from(lo) | u32::from(hi) << 8 | extended
            };

            if op == self.table.extended_arg {
                extended = int_arg << self.version.extended_arg_shift();
                continue;
            }

            let operand = self.resolve_operand(&code, name, op, int_arg, offset)?;
            return Ok(Decoded {
                name,
                opcode: op,
                int_arg: Some(int_arg),
                operand,
                offset,
                line,
            });
        }
    }

    fn resolve_operand(
        &self,
        code: &CodeObject,
        name: &'static str,
        op: u8,
        int_arg: u32,
        offset: usize,
    ) -> VmResult<Operand> {
        let oob = |table: &str| {
            VmError::Internal(format!(
                "index {int_arg} hors de {table} pour {name} (offset {offset})"
            ))
        };
        let insn_end = offset + self.table.instruction_size(op);
        let unit = self.version.jump_unit();
        Ok(match self.table.arg_kind(op) {
            ArgKind::Const => Operand::Const(const_to_value(
                code.consts.get(int_arg as usize).ok_or_else(|| oob("consts"))?,
            )),
            ArgKind::Name => {
                // 3.11 : le bit bas de LOAD_GLOBAL encode le push de NULL,
                // l'index de nom est décalé d'un bit.
                let ix = if self.version >= PyVersion::V311 && name == "LOAD_GLOBAL" {
                    int_arg >> 1
                } else {
                    int_arg
                };
                Operand::Name(
                    code.names
                        .get(ix as usize)
                        .cloned()
                        .ok_or_else(|| oob("names"))?,
                )
            }
            ArgKind::Local => Operand::Name(
                code.varnames
                    .get(int_arg as usize)
                    .cloned()
                    .ok_or_else(|| oob("varnames"))?,
            ),
            ArgKind::Free => {
                let n_cells = code.cellvars.len();
                let name = if (int_arg as usize) < n_cells {
                    code.cellvars[int_arg as usize].clone()
                } else {
                    code.freevars
                        .get(int_arg as usize - n_cells)
                        .cloned()
                        .ok_or_else(|| oob("cellvars+freevars"))?
                };
                Operand::Name(name)
            }
            ArgKind::JumpRel => Operand::Jump(insn_end + (int_arg * unit) as usize),
            ArgKind::JumpRelBack => Operand::Jump(
                insn_end
                    .checked_sub((int_arg * unit) as usize)
                    .ok_or_else(|| {
                        VmError::Internal(format!(
                            "saut arrière avant l'offset 0 ({name} @{offset})"
                        ))
                    })?,
            ),
            ArgKind::JumpAbs => Operand::Jump((int_arg * unit) as usize),
            ArgKind::Compare => Operand::Compare(
                self.table
                    .cmp_name(int_arg)
                    .ok_or_else(|| oob("cmp_op"))?,
            ),
            ArgKind::Raw | ArgKind::None => Operand::Raw(int_arg),
        })
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Exécute une instruction décodée. Les exceptions utilisateur sont
    /// capturées ici et converties en signal `Exception` ; les fautes
    /// internes remontent.
    pub fn dispatch(&mut self, d: &Decoded) -> VmResult<Option<Why>> {
        self.in_exception_processing = false;
        match self.dispatch_inner(d) {
            Ok(why) => Ok(why),
            Err(VmError::User(exc)) => {
                self.record_exception(exc, d);
                Ok(Some(Why::Exception))
            }
            Err(fatal) => Err(fatal),
        }
    }

    fn dispatch_inner(&mut self, d: &Decoded) -> VmResult<Option<Why>> {
        // Familles à préfixe : opérateurs, puis table de handlers.
        if d.name == "BINARY_OP" {
            let sub = byteops::nb_op_name(d.arg()?)?;
            let pair = self.popn(2)?;
            let [x, y] = <[Value; 2]>::try_from(pair)
                .map_err(|_| VmError::Internal("popn(2) incohérent".into()))?;
            let out = if let Some(stripped) = sub.strip_prefix("INPLACE_") {
                arith::inplace(stripped, x, y)?
            } else {
                arith::binary(sub, x, y)?
            };
            self.push(out)?;
            return Ok(None);
        }
        if let Some(suffix) = d.name.strip_prefix("UNARY_") {
            let v = self.pop()?;
            let out = arith::unary(suffix, v)?;
            self.push(out)?;
            return Ok(None);
        }
        if let Some(suffix) = d.name.strip_prefix("BINARY_") {
            let pair = self.popn(2)?;
            let [x, y] = <[Value; 2]>::try_from(pair)
                .map_err(|_| VmError::Internal("popn(2) incohérent".into()))?;
            let out = arith::binary(suffix, x, y)?;
            self.push(out)?;
            return Ok(None);
        }
        if let Some(suffix) = d.name.strip_prefix("INPLACE_") {
            let pair = self.popn(2)?;
            let [x, y] = <[Value; 2]>::try_from(pair)
                .map_err(|_| VmError::Internal("popn(2) incohérent".into()))?;
            let out = arith::inplace(suffix, x, y)?;
            self.push(out)?;
            return Ok(None);
        }
        if d.name.contains("SLICE+") {
            self.slice_operator(d.name)?;
            return Ok(None);
        }

        match self.handlers.get(d.name) {
            Some(h) => h(self, d),
            None => Err(VmError::Internal(format!(
                "handler manquant pour l'opcode {} :\n\t{}",
                d.name,
                self.format_instruction(d, false)
            ))),
        }
    }

    /// Capture une exception utilisateur dans `last_exception`, en
    /// matérialisant le traceback à la première occasion.
    fn record_exception(&mut self, exc: Rc<ExcInstance>, d: &Decoded) {
        if !self.in_exception_processing {
            if exc.etype.name != "SystemExit" {
                info!(
                    "exception in the execution of instruction:\n\t{}",
                    self.format_instruction(d, false)
                );
            }
            if self.last_traceback.is_none() {
                self.last_traceback = self.traceback_from_frames();
            }
            self.in_exception_processing = true;
        }
        let tb = match &self.last_traceback {
            Some(t) => Value::Traceback(t.clone()),
            None => Value::None,
        };
        self.last_exception = Some((
            Value::ExcType(exc.etype.clone()),
            Value::Exception(exc),
            tb,
        ));
    }

    /// Chaîne de traceback de la pile d'appel courante, la frame la plus
    /// profonde en tête.
    pub fn traceback_from_frames(&self) -> Option<Rc<TraceEntry>> {
        let mut next: Option<Rc<TraceEntry>> = None;
        for f in &self.frames {
            let fb = f.borrow();
            next = Some(Rc::new(TraceEntry {
                filename: fb.code.filename.clone(),
                lineno: fb.lineno,
                name: fb.code.name.clone(),
                next,
            }));
        }
        next
    }

    // ------------------------------------------------------------------
    // Moteur d'unwinding
    // ------------------------------------------------------------------

    /// Tronque la pile d'opérandes à la hauteur du bloc ; un bloc
    /// `ExceptHandler` restaure en plus le triple d'exception.
    pub(crate) fn unwind_block(&mut self, block: &Block) -> VmResult<()> {
        let offset = if block.kind == BlockKind::ExceptHandler {
            3
        } else {
            0
        };
        loop {
            let len = self.stack_len()?;
            if len <= block.level + offset {
                break;
            }
            self.pop()?;
        }
        if block.kind == BlockKind::ExceptHandler {
            let tvt = self.popn(3)?;
            self.last_traceback = match &tvt[0] {
                Value::Traceback(t) => Some(t.clone()),
                _ => None,
            };
            self.last_exception = Some((tvt[2].clone(), tvt[1].clone(), tvt[0].clone()));
        }
        Ok(())
    }

    /// Une étape d'unwinding : applique l'action `(nature du bloc, why)`
    /// du haut de la pile de blocs. Rend le signal restant, ou `None`
    /// quand un handler a pris la main.
    fn manage_block_stack(&mut self, why: Why) -> VmResult<Option<Why>> {
        debug_assert!(why != Why::Yield);
        let block = self
            .top_block()?
            .ok_or_else(|| VmError::Internal("unwinding sans bloc".into()))?;

        if block.kind == BlockKind::Loop && why == Why::Continue {
            let target = match &self.return_value {
                Value::Int(t) if *t >= 0 => *t as usize,
                other => {
                    return Err(VmError::Internal(format!(
                        "cible de continue invalide : {other:?}"
                    )))
                }
            };
            self.jump(target)?;
            return Ok(None);
        }

        if !(block.kind == BlockKind::ExceptHandler && why == Why::Silenced) {
            self.pop_block()?;
            self.unwind_block(&block)?;
        }

        if block.kind == BlockKind::Loop && why == Why::Break {
            self.jump(block.handler)?;
            return Ok(None);
        }

        if self.version < PyVersion(3, 0) {
            let catches = block.kind == BlockKind::Finally
                || (block.kind == BlockKind::SetupExcept && why == Why::Exception)
                || block.kind == BlockKind::With;
            if catches {
                if why == Why::Exception {
                    let (t, v, tb) = self.exception_triple();
                    self.push(tb)?;
                    self.push(v)?;
                    self.push(t)?;
                } else {
                    if matches!(why, Why::Return | Why::Continue) {
                        let rv = self.return_value.clone();
                        self.push(rv)?;
                    }
                    self.push(Value::Why(why))?;
                }
                self.jump(block.handler)?;
                return Ok(None);
            }
        } else {
            if why == Why::Exception
                && matches!(block.kind, BlockKind::SetupExcept | BlockKind::Finally)
            {
                self.push_block(BlockKind::ExceptHandler, 0)?;
                let (t, v, tb) = self.exception_triple();
                self.push(tb.clone())?;
                self.push(v.clone())?;
                self.push(t.clone())?;
                // PyErr_NormalizeException passerait ici.
                self.push(tb)?;
                self.push(v)?;
                self.push(t)?;
                self.jump(block.handler)?;
                return Ok(None);
            }
            if block.kind == BlockKind::Finally {
                if matches!(why, Why::Return | Why::Continue) {
                    let rv = self.return_value.clone();
                    self.push(rv)?;
                }
                self.push(Value::Why(why))?;
                self.jump(block.handler)?;
                return Ok(None);
            }
            if block.kind == BlockKind::ExceptHandler && why == Why::Silenced {
                return Ok(None);
            }
            // why == Return tombe au travers (protocole END_FINALLY 3.8).
        }

        Ok(Some(why))
    }

    fn exception_triple(&self) -> (Value, Value, Value) {
        match &self.last_exception {
            Some((t, v, tb)) => (t.clone(), v.clone(), tb.clone()),
            None => (Value::None, Value::None, Value::None),
        }
    }

    // ------------------------------------------------------------------
    // Boucle principale
    // ------------------------------------------------------------------

    /// Exécute `frame` jusqu'à sa sortie (retour, yield, ou exception qui
    /// la traverse). Analogue de `eval_frame` / `_PyEval_EvalFrameDefault`.
    pub fn eval_frame(&mut self, frame: &Gc<Frame>) -> Result<Value, VmError> {
        {
            let mut f = frame.borrow_mut();
            if f.lasti == -1 {
                // Démarrage à froid : premier fetch sans avance préalable.
                f.lasti = 0;
                f.fallthrough = false;
            }
            f.status = FrameStatus::Running;
        }
        self.push_frame(frame.clone());

        let result = self.eval_loop(frame);
        let why = match result {
            Ok(w) => w,
            Err(fatal) => {
                self.pop_frame();
                return Err(fatal);
            }
        };

        if why != Why::Yield {
            frame.borrow_mut().status = FrameStatus::Finished;
        }
        self.pop_frame();

        if why == Why::Exception {
            let (etype, value, _tb) = self.exception_triple();
            if self.frames.is_empty() {
                return Err(VmError::Uncaught(self.uncaught_record(&etype, &value)));
            }
            // Re-lève vers la frame appelante ; le dispatch parent capture.
            let inst = match value {
                Value::Exception(e) => e,
                other => Rc::new(ExcInstance {
                    etype: match etype {
                        Value::ExcType(t) => t,
                        _ => ExcType::builtin("Exception"),
                    },
                    args: vec![other],
                }),
            };
            return Err(VmError::User(inst));
        }

        if why != Why::Yield {
            self.in_exception_processing = false;
        }
        Ok(self.return_value.clone())
    }

    /// Cœur fetch → dispatch → unwind. Rend le `why` de sortie de frame.
    fn eval_loop(&mut self, frame: &Gc<Frame>) -> VmResult<Why> {
        loop {
            let d = self.parse_byte_and_args()?;
            if log_enabled!(Level::Info) {
                self.log_instruction(&d);
            }

            let mut why = self.dispatch(&d)?;

            if why == Some(Why::Exception) && !self.in_exception_processing {
                // Les handlers qui posent le signal sans lever (RAISE_VARARGS)
                // passent ici : matérialisation paresseuse du traceback.
                if !matches!(
                    &self.last_exception,
                    Some((Value::ExcType(t), _, _)) if t.name == "SystemExit"
                ) {
                    info!(
                        "exception in the execution of instruction:\n\t{}",
                        self.format_instruction(&d, false)
                    );
                }
                if self.last_traceback.is_none() {
                    self.last_traceback = self.traceback_from_frames();
                    if let (Some(tb), Some((t, v, _))) =
                        (self.last_traceback.clone(), self.last_exception.clone())
                    {
                        self.last_exception =
                            Some((t, v, Value::Traceback(tb)));
                    }
                }
                self.in_exception_processing = true;
            }

            if why == Some(Why::Reraise) {
                why = Some(Why::Exception);
            }

            if why != Some(Why::Yield) {
                while let Some(w) = why {
                    if frame.borrow().block_stack.is_empty() {
                        break;
                    }
                    why = self.manage_block_stack(w)?;
                }
            }

            if let Some(w) = why {
                return Ok(w);
            }
        }
    }

    fn uncaught_record(&self, etype: &Value, value: &Value) -> UncaughtException {
        let (name, args) = match value {
            Value::Exception(e) => (e.etype.name.to_string(), e.args.clone()),
            other => {
                let name = match etype {
                    Value::ExcType(t) => t.name.to_string(),
                    _ => "Exception".to_string(),
                };
                (name, vec![other.clone()])
            }
        };
        let traceback = self
            .last_traceback
            .as_ref()
            .map(|t| {
                t.flatten()
                    .iter()
                    .map(|e| TraceRecord {
                        filename: e.filename.clone(),
                        lineno: e.lineno,
                        name: e.name.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        UncaughtException {
            name,
            args,
            traceback,
        }
    }

    // ------------------------------------------------------------------
    // Appels et générateurs
    // ------------------------------------------------------------------

    /// Appelle une valeur : fonction bytecode (frame synchrone ou
    /// générateur), native, ou type d'exception (instanciation).
    pub fn call_value(
        &mut self,
        callable: Value,
        pos: Vec<Value>,
        named: AHashMap<String, Value>,
    ) -> VmResult<Value> {
        match callable {
            Value::Function(func) => {
                let callargs = crate::object::bind_call_args(&func, &pos, &named)?;
                let frame = self.make_frame(
                    func.code.clone(),
                    callargs,
                    Some(func.globals.clone()),
                    None,
                    &func.closure,
                )?;
                if func.code.flags.contains(CodeFlags::GENERATOR) {
                    return Ok(Value::Generator(gc(Generator::new(frame))));
                }
                self.eval_frame(&frame)
            }
            Value::Native(n) => {
                if !named.is_empty() {
                    return Err(VmError::user(
                        "TypeError",
                        format!("{}() takes no keyword arguments", n.name),
                    ));
                }
                (n.func)(self, &pos)
            }
            Value::ExcType(t) => {
                if !named.is_empty() {
                    return Err(VmError::user(
                        "TypeError",
                        format!("{}() takes no keyword arguments", t.name),
                    ));
                }
                Ok(Value::Exception(Rc::new(ExcInstance { etype: t, args: pos })))
            }
            other => Err(VmError::user(
                "TypeError",
                format!("'{}' object is not callable", other.type_name()),
            )),
        }
    }

    /// Reprend un générateur. `Ok(Some(v))` : valeur produite ;
    /// `Ok(None)` : épuisé (la valeur de retour reste sur le générateur).
    pub fn resume_generator(
        &mut self,
        genval: &Gc<Generator>,
        send: Value,
    ) -> VmResult<Option<Value>> {
        if genval.borrow().finished {
            return Ok(None);
        }
        let frame = genval.borrow().frame.clone();
        {
            let mut f = frame.borrow_mut();
            if f.lasti == -1 {
                // Premier démarrage : rien à pousser, on part de l'offset 0.
                f.fallthrough = false;
                f.lasti = 0;
            } else {
                // Reprise après YIELD_VALUE : la valeur envoyée devient le
                // résultat de l'expression yield.
                f.fallthrough = true;
                f.stack.push(send);
            }
        }
        let val = self.eval_frame(&frame)?;
        if frame.borrow().status == FrameStatus::Suspended {
            Ok(Some(val))
        } else {
            let mut g = genval.borrow_mut();
            g.finished = true;
            g.return_value = val;
            Ok(None)
        }
    }

    // ------------------------------------------------------------------
    // Affichage et logs
    // ------------------------------------------------------------------

    /// Formate une instruction exécutée, décorations par opcode comprises.
    pub fn format_instruction(&self, d: &Decoded, extra_debug: bool) -> String {
        let stack_args = self
            .stack_fmt
            .get(d.name)
            .map(|f| f(self, d.int_arg))
            .unwrap_or_default();
        let argrepr = match &d.operand {
            Operand::None => String::new(),
            Operand::Raw(r) => r.to_string(),
            Operand::Const(v) => v.repr(),
            Operand::Name(n) => n.clone(),
            Operand::Jump(t) => t.to_string(),
            Operand::Compare(c) => (*c).to_string(),
        };
        let line_str = match d.line {
            Some(l) => format!("L. {l:<width$}@", width = LINE_NUMBER_WIDTH),
            None => format!("{}@", " ".repeat(LINE_NUMBER_WIDTH + 3)),
        };
        let mut mess = format!(
            "{line_str}{:3}: {}{} {}",
            d.offset, d.name, stack_args, argrepr
        );
        if extra_debug {
            if let Some(f) = &self.frame {
                let f = f.borrow();
                mess.push_str(&format!(
                    " {} in {}:{}",
                    f.code.name, f.code.filename, f.lineno
                ));
            }
        }
        mess
    }

    /// Journalise pile, blocs et instruction, indentés par profondeur.
    fn log_instruction(&self, d: &Decoded) {
        let indent = "    ".repeat(self.frames.len().saturating_sub(1));
        if let Some(f) = &self.frame {
            let f = f.borrow();
            debug!("  {indent}frame.stack: {:?}", f.stack);
            debug!("  {indent}blocks     : {:?}", f.block_stack);
        }
        let op = self.format_instruction(d, log_enabled!(Level::Debug));
        info!("{indent}{op}");
    }

    // ------------------------------------------------------------------
    // SLICE+N (2.x)
    // ------------------------------------------------------------------

    /// Les opcodes SLICE+N / STORE_SLICE+N / DELETE_SLICE+N de 2.x : le
    /// chiffre final indique les bornes présentes sur la pile.
    fn slice_operator(&mut self, name: &str) -> VmResult<()> {
        let count: u32 = name
            .chars()
            .last()
            .and_then(|c| c.to_digit(10))
            .ok_or_else(|| VmError::Internal(format!("opcode slice malformé : {name}")))?;
        let mut start = Value::Int(0);
        let mut end = Value::None;
        match count {
            0 => {}
            1 => start = self.pop()?,
            2 => end = self.pop()?,
            3 => {
                end = self.pop()?;
                start = self.pop()?;
            }
            _ => return Err(VmError::Internal(format!("compte de slice invalide : {count}"))),
        }
        let seq = self.pop()?;
        let len = match &seq {
            Value::List(l) => l.borrow().len(),
            Value::Str(s) => s.chars().count(),
            Value::Tuple(t) => t.len(),
            other => {
                return Err(VmError::user(
                    "TypeError",
                    format!("'{}' object is unsliceable", other.type_name()),
                ))
            }
        };
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
        let lo = clamp(&start, 0)?;
        let hi = clamp(&end, len)?.max(lo);

        if name.starts_with("STORE_") {
            let value = self.pop()?;
            let items: Vec<Value> = match &value {
                Value::List(l) => l.borrow().clone(),
                Value::Tuple(t) => t.to_vec(),
                other => {
                    return Err(VmError::user(
                        "TypeError",
                        format!("can only assign an iterable, not '{}'", other.type_name()),
                    ))
                }
            };
            match &seq {
                Value::List(l) => {
                    l.borrow_mut().splice(lo..hi, items);
                    Ok(())
                }
                other => Err(VmError::user(
                    "TypeError",
                    format!("'{}' object does not support slice assignment", other.type_name()),
                )),
            }
        } else if name.starts_with("DELETE_") {
            match &seq {
                Value::List(l) => {
                    l.borrow_mut().drain(lo..hi);
                    Ok(())
                }
                other => Err(VmError::user(
                    "TypeError",
                    format!("'{}' object does not support slice deletion", other.type_name()),
                )),
            }
        } else {
            let out = match &seq {
                Value::List(l) => Value::list(l.borrow()[lo..hi].to_vec()),
                Value::Tuple(t) => Value::tuple(t[lo..hi].to_vec()),
                Value::Str(s) => {
                    let sub: String = s.chars().skip(lo).take(hi - lo).collect();
                    Value::str(sub)
                }
                _ => unreachable!(),
            };
            self.push(out)
        }
    }
}

/// Convertit une constante du pool en valeur VM.
pub fn const_to_value(c: &Const) -> Value {
    match c {
        Const::None => Value::None,
        Const::Bool(b) => Value::Bool(*b),
        Const::Int(i) => Value::Int(*i),
        Const::Float(x) => Value::Float(*x),
        Const::Str(s) => Value::str(s),
        Const::Tuple(items) => Value::tuple(items.iter().map(const_to_value).collect()),
        Const::Code(code) => Value::Code(code.clone()),
    }
}

/// Décoration MAKE_FUNCTION : nom du code object au sommet de pile.
fn fmt_make_function(vm: &PyVm, _arg: Option<u32>) -> String {
    match vm.top() {
        Ok(Value::Code(c)) => format!(" ({})", c.name),
        Ok(Value::Str(s)) => format!(" ({s})"),
        _ => String::new(),
    }
}
