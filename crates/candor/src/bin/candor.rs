//! Command-line driver for the Candor compiler.
//!
//! Compiles a source file through the full pipeline and prints the
//! requested intermediate representations. Code is emitted through
//! the recording assembler, so `--print-asm` shows the exact
//! mnemonic stream a platform assembler would receive.

use anyhow::{Context, Result};
use clap::Parser;

use candor::Isolate;
use candorc::masm::RecordingAssembler;
use candorc::CompileOptions;

#[derive(Debug, Parser)]
#[command(name = "candor", about = "Candor language compiler")]
struct Cli {
    /// Source file to compile
    file: String,

    /// Print the SSA HIR
    #[arg(long)]
    print_hir: bool,

    /// Print the allocated LIR
    #[arg(long)]
    print_lir: bool,

    /// Print the emitted mnemonic stream
    #[arg(long)]
    print_asm: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let source = std::fs::read_to_string(&cli.file)
        .with_context(|| format!("failed to read {}", cli.file))?;

    let options = CompileOptions {
        file: Some(cli.file.clone()),
        print_hir: cli.print_hir,
        print_lir: cli.print_lir,
        print_asm: cli.print_asm,
    };

    let mut isolate = Isolate::new();
    let mut asm = RecordingAssembler::new();
    let script = isolate.compile(&source, &mut asm, &options)?;

    if cli.print_asm {
        println!("{}", asm.text());
    }

    if !cli.print_hir && !cli.print_lir && !cli.print_asm {
        println!(
            "compiled {} function(s), {} literal(s)",
            script.module.functions.len(),
            script.module.literals.len()
        );
    }

    Ok(())
}
