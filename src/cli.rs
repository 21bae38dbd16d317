// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//!
//! Command-line interface.
//!
use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[command(
    name = "gbhla",
    author = "Oxide Computer Company",
    version,
    about = "Retargetable macro-assembler and linker for Game Boy-class 8-bit targets"
)]
pub struct Cli {
    /// Top-level source file to assemble
    pub input: PathBuf,

    /// Where to write the linked ROM image
    #[clap(short, long)]
    pub output: Option<PathBuf>,

    /// Where to write a symbol file (`bank:address label` per line)
    #[clap(long)]
    pub symbols: Option<PathBuf>,

    /// Additional directory to search for `#INCLUDE`/`#INCBIN`/`#INCGFX` files.
    /// May be given more than once; searched in the order given.
    #[clap(short = 'I', long = "include-path")]
    pub include_path: Vec<PathBuf>,

    /// Print a summary of sections, labels, and free space after linking
    #[clap(long)]
    pub dump: bool,
}
