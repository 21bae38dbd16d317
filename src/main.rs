// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

mod allocator;
mod assembler;
mod ast;
mod builtin;
mod cli;
mod error;
mod eval;
mod foreign;
mod gfx;
mod layout;
mod link;
mod macrodb;
mod rom;
mod section;
mod token;

use std::process::ExitCode;

use clap::Parser;

use crate::assembler::Assembler;
use crate::cli::Cli;
use crate::error::AssemblerError;

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let mut asm = Assembler::new();
    for dir in &cli.include_path {
        asm.add_include_path(dir.clone());
    }

    if let Err(e) = run(&cli, &mut asm) {
        report_error(&e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn run(cli: &Cli, asm: &mut Assembler) -> error::Result<()> {
    asm.process_file(&cli.input)?;
    link::link(asm, true)?;

    if let Some(output) = &cli.output {
        let bytes = rom::build_rom(asm)?;
        std::fs::write(output, &bytes)
            .map_err(|e| AssemblerError::bare(format!("Failed to write {}: {e}", output.display())))?;
    }
    if let Some(symbols) = &cli.symbols {
        rom::save_symbols(asm, symbols)?;
    }
    if cli.dump {
        asm.dump();
    }
    Ok(())
}

/// Prints an error the way the original tool does: the message, the
/// `file:line` it was anchored to (if any), and a five-line excerpt of
/// the offending source with `>` marking the bad line.
fn report_error(err: &AssemblerError) {
    eprintln!("Error: {}", err.message);
    let Some(token) = &err.token else { return };
    eprintln!(" at: {}:{}", token.file, token.line);

    let Ok(contents) = std::fs::read_to_string(token.file.as_ref()) else { return };
    let lines: Vec<&str> = contents.lines().collect();
    let line_nr = token.line as usize;
    let start = line_nr.saturating_sub(3);
    let end = (line_nr + 2).min(lines.len());

    eprintln!("-----");
    for (idx, line) in lines.iter().enumerate().take(end).skip(start) {
        let marker = if idx + 1 == line_nr { ">" } else { " " };
        eprintln!("{marker}{line}");
    }
    eprintln!("-----");
}
