//! Reference driver for the kbc compiler: reads one source
//! file, compiles it, prints diagnostics to stderr, and on success dumps the
//! bytecode disassembly to stdout.

use anyhow::{Context, Result};
use clap::Parser;
use kbc_codegen::{compile, DebugFlags, DiagnosticKind};
use std::path::PathBuf;

/// Compile a single kbc source file to bytecode.
#[derive(Parser)]
#[command(name = "kbc")]
#[command(about = "Compiles a source file to KBC1 bytecode and disassembles it")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Source file to compile.
    path: PathBuf,

    /// Dump the parsed AST before name resolution.
    #[arg(long)]
    dump_ast: bool,

    /// Dump the AST after name resolution.
    #[arg(long)]
    dump_resolved: bool,

    /// Dump the IR after each pass (build, fold, liveness, constant-inline,
    /// register allocation).
    #[arg(long)]
    dump_ir: bool,

    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_default_env()
        .filter_level(if cli.verbose { log::LevelFilter::Debug } else { log::LevelFilter::Warn })
        .format_timestamp(None)
        .format_module_path(false)
        .format_target(false)
        .init();

    let text = std::fs::read_to_string(&cli.path)
        .with_context(|| format!("reading {}", cli.path.display()))?;
    let path = cli.path.to_string_lossy().into_owned();

    let mut flags = DebugFlags::CODE;
    if cli.dump_ast {
        flags |= DebugFlags::PARSED_AST;
    }
    if cli.dump_resolved {
        flags |= DebugFlags::RESOLVED_AST;
    }
    if cli.dump_ir {
        flags |= DebugFlags::IR_BUILD | DebugFlags::IR_FOLD | DebugFlags::IR_LIVE | DebugFlags::IR_FOLDK | DebugFlags::IR_ALLOC;
    }

    let result = compile(&path, &text, flags);

    for diag in &result.diagnostics {
        let kind = match diag.kind {
            DiagnosticKind::Error => "error",
            DiagnosticKind::Warning => "warning",
        };
        eprintln!("{path}:{}:{}: {kind}: {}", diag.line, diag.column, diag.message);
    }

    if result.success {
        Ok(())
    } else {
        std::process::exit(1);
    }
}
