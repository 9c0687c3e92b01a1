//! Whole-compilation entry point: parse → resolve → build
//! IR → fold → liveness → constant-inline → (bail on errors) → register
//! allocation → emit, threading one `Source`/`ErrorSink` pair throughout.

use crate::bytecode::CodeScript;
use crate::disasm::disassemble;
use crate::{alloc, emit, fold, inline, liveness};
use bitflags::bitflags;
use kbc_common::diagnostics::{Diagnostic, ErrorSink, Severity};
use kbc_common::source::Source;
use kbc_ir::{build_program, Module};
use kbc_parser::parser::Parser;
use kbc_resolve::resolve_program;

bitflags! {
    /// Which intermediate stages `compile` prints to stdout.
    /// Each flag dumps the whole module (recursing into nested functions)
    /// after the stage it names has run.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DebugFlags: u32 {
        const PARSED_AST    = 1 << 0;
        const RESOLVED_AST  = 1 << 1;
        const IR_BUILD      = 1 << 2;
        const IR_FOLD       = 1 << 3;
        const IR_LIVE       = 1 << 4;
        const IR_FOLDK      = 1 << 5;
        const IR_ALLOC      = 1 << 6;
        const CODE          = 1 << 7;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticRecord {
    pub kind: DiagnosticKind,
    pub line: u32,
    pub column: u32,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct CompilationResult {
    pub success: bool,
    pub diagnostics: Vec<DiagnosticRecord>,
    pub code: Option<Vec<u8>>,
}

pub fn compile(filename: &str, text: &str, debug_flags: DebugFlags) -> CompilationResult {
    let mut source = Source::new(filename, text);
    let mut diagnostics: Vec<Diagnostic> = Vec::new();

    let parser = Parser::new(&mut source);
    let (mut program, parse_errors) = parser.parse_program();
    diagnostics.extend(parse_errors.into_diagnostics());

    if debug_flags.contains(DebugFlags::PARSED_AST) {
        println!("=== parsed AST ===\n{:#?}", program);
    }

    if !has_fatal_error(&diagnostics) {
        let resolve_errors = resolve_program(&mut program, &mut source);
        diagnostics.extend(resolve_errors.into_diagnostics());
    }

    if debug_flags.contains(DebugFlags::RESOLVED_AST) {
        println!("=== resolved AST ===\n{:#?}", program);
    }

    if has_fatal_error(&diagnostics) {
        return finish(diagnostics, &source, None);
    }

    let mut errors = ErrorSink::new();
    let mut module = build_program(&program, &mut source, &mut errors);
    diagnostics.extend(errors.into_diagnostics());

    if debug_flags.contains(DebugFlags::IR_BUILD) {
        println!("=== IR (build) ===\n{:#?}", module);
    }

    if has_fatal_error(&diagnostics) {
        return finish(diagnostics, &source, None);
    }

    let mut errors = ErrorSink::new();
    fold::fold_function(&mut module.main, &mut source, &mut errors);
    diagnostics.extend(errors.into_diagnostics());

    if debug_flags.contains(DebugFlags::IR_FOLD) {
        println!("=== IR (fold) ===\n{:#?}", module);
    }

    run_liveness(&mut module);
    if debug_flags.contains(DebugFlags::IR_LIVE) {
        println!("=== IR (live) ===\n{:#?}", module);
    }

    let mut errors = ErrorSink::new();
    inline::inline_constants(&mut module.main, &mut errors);
    diagnostics.extend(errors.into_diagnostics());

    if debug_flags.contains(DebugFlags::IR_FOLDK) {
        println!("=== IR (foldk) ===\n{:#?}", module);
    }

    // Liveness must be recomputed after constant inlining retargets operands
    // (the fused K/I forms drop an operand the original liveness pass saw).
    run_liveness(&mut module);

    if has_fatal_error(&diagnostics) {
        return finish(diagnostics, &source, None);
    }

    alloc::allocate_registers(&mut module.main);
    if debug_flags.contains(DebugFlags::IR_ALLOC) {
        println!("=== IR (alloc) ===\n{:#?}", module);
    }

    let script = emit::emit_module(&module, &source);
    let bytes = script.to_bytes();

    if debug_flags.contains(DebugFlags::CODE) {
        println!("=== code ===\n{}", disassemble(&script));
    }

    finish(diagnostics, &source, Some(bytes))
}

fn run_liveness(module: &mut Module) {
    liveness::compute_liveness(&mut module.main);
}

fn has_fatal_error(diagnostics: &[Diagnostic]) -> bool {
    diagnostics.iter().any(|d| d.severity == Severity::Error)
}

fn finish(diagnostics: Vec<Diagnostic>, source: &Source, code: Option<Vec<u8>>) -> CompilationResult {
    let success = !has_fatal_error(&diagnostics) && code.is_some();
    let records = diagnostics
        .into_iter()
        .map(|d| {
            let (line, column) = source.location(d.sloc);
            DiagnosticRecord {
                kind: match d.severity {
                    Severity::Error => DiagnosticKind::Error,
                    Severity::Warning => DiagnosticKind::Warning,
                },
                line,
                column,
                message: d.message,
            }
        })
        .collect();
    CompilationResult { success, diagnostics: records, code: if success { code } else { None } }
}
