//! main.rs — CLI viper : assemble un listing texte et l'exécute.
//!
//! ```text
//! viper run examples.vasm --version 3.10 --trace
//! ```
//!
//! La lecture du format .pyc n'est pas de ce ressort : la CLI passe par
//! l'assembleur texte de viper-core.

use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use viper_core::{asm, PyVersion, Variant};
use viper_vm::{PyVm, VmError};

#[derive(Parser)]
#[command(name = "viper", version, about = "Interpréteur de bytecode CPython")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Assemble un listing et l'exécute, en affichant la valeur produite.
    Run {
        /// Fichier listing (.vasm).
        file: PathBuf,
        /// Version de bytecode ciblée (2.7, 3.6 à 3.11).
        #[arg(long, default_value = "3.10")]
        version: String,
        /// Variante d'interpréteur.
        #[arg(long, default_value = "cpython")]
        variant: String,
        /// Trace chaque instruction exécutée (équivaut à RUST_LOG=info).
        #[arg(long)]
        trace: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            file,
            version,
            variant,
            trace,
        } => run(&file, &version, &variant, trace),
    }
}

fn run(file: &PathBuf, version: &str, variant: &str, trace: bool) -> Result<()> {
    let mut logger = env_logger::Builder::from_default_env();
    if trace {
        logger.filter_level(log::LevelFilter::Info);
    }
    logger.init();

    let version = PyVersion::parse(version)
        .with_context(|| format!("version non supportée : {version}"))?;
    let variant = match variant {
        "cpython" => Variant::CPython,
        "pypy" => Variant::PyPy,
        other => bail!("variante inconnue : {other}"),
    };

    let source = fs::read_to_string(file)
        .with_context(|| format!("lecture de {}", file.display()))?;
    let code = asm::assemble_named(&source, version, variant, "<module>")
        .context("assemblage du listing")?;

    let mut vm = PyVm::with_stdlib(version).map_err(|e| anyhow::anyhow!(e.to_string()))?;
    match vm.run_code(&code, None, None, true) {
        Ok(val) => {
            println!("{val}");
            Ok(())
        }
        Err(VmError::Uncaught(exc)) => {
            eprintln!("Traceback (most recent call last):");
            for t in exc.traceback().iter().rev() {
                eprintln!("  File \"{}\", line {}, in {}", t.filename, t.lineno, t.name);
            }
            eprintln!("{}", exc);
            std::process::exit(1);
        }
        Err(other) => bail!("{other}"),
    }
}
