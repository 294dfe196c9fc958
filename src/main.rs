/*
Copyright 2025 Connor Nolan

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use asm2c::driver::Options;
use asm2c::file_reader::AsmFileReader;
use asm2c::translate;
use clap::Parser;

/// Translate 32bit x86 disassembly listings into compilable C.
#[derive(Parser)]
#[clap(version)]
struct Opts {
    /// Output file (.c, or .h with --hdr)
    output: PathBuf,
    /// Input disassembly listing (.asm)
    input: PathBuf,
    /// C header with prototypes for the functions and data referenced
    header: PathBuf,
    /// Skip lists: names of functions to leave untranslated
    rlist: Vec<PathBuf>,

    #[clap(short, long)]
    verbose: bool,
    /// Tolerate indirect calls whose argument count cannot be recovered
    #[clap(long = "rf")]
    allow_regfunc: bool,
    /// Keep going across segment boundaries
    #[clap(short, long)]
    multi_seg: bool,
    /// Guess prototypes instead of translating bodies
    #[clap(long = "hdr")]
    header_mode: bool,
}

fn run(opts: &Opts) -> Result<()> {
    let options = Options {
        verbose: opts.verbose,
        allow_regfunc: opts.allow_regfunc,
        multi_seg: opts.multi_seg,
        header_mode: opts.header_mode,
    };

    let reader = AsmFileReader;
    let rlist_paths: Vec<&Path> = opts.rlist.iter().map(|p| p.as_path()).collect();

    let output = translate(&opts.input, &opts.header, &rlist_paths, &options, &reader)?;

    fs::write(&opts.output, output)
        .with_context(|| format!("Failed to write output file: {}", opts.output.display()))?;

    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    let opts = Opts::parse();

    match run(&opts) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{:#}", err);
            ExitCode::FAILURE
        }
    }
}
