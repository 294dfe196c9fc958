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

pub mod analysis;
pub mod codegen;
pub mod driver;
pub mod errors;
pub mod file_reader;
pub mod hdrgen;
pub mod header;
pub mod ir;
pub mod parser;

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};

use driver::{Options, Translator, parse_rlist};
use file_reader::FileReader;
use header::ProtoDb;

/// Translate one disassembly listing into C (or, in header mode, into a
/// set of guessed prototypes) using the prototypes declared in `hdr_path`.
pub fn translate<F: FileReader>(
    asm_path: &Path,
    hdr_path: &Path,
    rlist_paths: &[&Path],
    opts: &Options,
    reader: &F,
) -> Result<String> {
    let hdr_text = reader
        .read_to_string(hdr_path)
        .with_context(|| format!("Failed to read header file: {}", hdr_path.display()))?;
    let protos = ProtoDb::from_header(&hdr_text).context("Failed during header parsing")?;

    let mut rlist = HashSet::new();
    for path in rlist_paths {
        let text = reader
            .read_to_string(path)
            .with_context(|| format!("Failed to read skip list: {}", path.display()))?;
        rlist.extend(parse_rlist(&text, opts.allow_regfunc));
    }

    let asm_text = reader
        .read_to_string(asm_path)
        .with_context(|| format!("Failed to read listing: {}", asm_path.display()))?;

    let asm_name = asm_path.to_string_lossy();
    let translator = Translator::new(&asm_name, &protos, rlist, opts.clone());
    let out = translator
        .run(&asm_text)
        .context("Failed during translation")?;

    Ok(out)
}
