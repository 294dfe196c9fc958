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

use std::collections::HashSet;

use log::info;

use crate::analysis::FuncContext;
use crate::codegen::gen_func;
use crate::errors::TranslateError;
use crate::header::ProtoDb;
use crate::hdrgen::HeaderGen;
use crate::ir::{DataItem, DataVal, FuncAttrs, LenMod, MAX_OPS, Op, OprKind, ParsedData};
use crate::parser::{AsmStmt, parse_line, parse_number};

#[derive(Debug, Default, Clone)]
pub struct Options {
    pub verbose: bool,
    pub allow_regfunc: bool,
    pub multi_seg: bool,
    pub header_mode: bool,
}

/// Parse a replacement list: function names to skip, one per line, with
/// `#if 0` blocks and `;` comments.
pub fn parse_rlist(text: &str, allow_regfunc: bool) -> HashSet<String> {
    let mut rlist = HashSet::new();
    let mut skipping = false;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with(';') {
            continue;
        }
        if let Some(rest) = line.strip_prefix('#') {
            let rest = rest.trim();
            if rest.starts_with("if 0") || (allow_regfunc && rest.starts_with("if NO_REGFUNC")) {
                skipping = true;
            } else if rest.starts_with("endif") {
                skipping = false;
            }
            continue;
        }
        if skipping {
            continue;
        }
        if let Some(name) = line.split_whitespace().next() {
            rlist.insert(name.to_string());
        }
    }

    rlist
}

struct Chunk {
    name: String,
    line_idx: usize,
}

pub struct Translator<'a> {
    asm_file: String,
    protos: &'a ProtoDb,
    opts: Options,
    rlist: HashSet<String>,

    out: String,
    hdrgen: HeaderGen,

    cur: Option<FuncContext<'a>>,
    pending: Option<FuncContext<'a>>,
    pending_label: Option<String>,
    cur_attrs: FuncAttrs,
    skip_func: bool,
    skip_warned: bool,
    sct_hint: Option<String>,
    end: bool,

    chunks: Vec<Chunk>,
    chunks_used: bool,
    chunk_i: Option<usize>,
    chunk_ret: Option<usize>,
}

impl<'a> Translator<'a> {
    pub fn new(asm_file: &str, protos: &'a ProtoDb, rlist: HashSet<String>, opts: Options) -> Self {
        let mut rlist = rlist;
        // needs special handling
        rlist.insert("__alloca_probe".to_string());

        Translator {
            asm_file: asm_file.to_string(),
            protos,
            opts,
            rlist,
            out: String::new(),
            hdrgen: HeaderGen::new(),
            cur: None,
            pending: None,
            pending_label: None,
            cur_attrs: FuncAttrs::empty(),
            skip_func: false,
            skip_warned: false,
            sct_hint: None,
            end: false,
            chunks: Vec::new(),
            chunks_used: false,
            chunk_i: None,
            chunk_ret: None,
        }
    }

    /// Translate the whole listing, returning the generated text.
    pub fn run(mut self, source: &str) -> Result<String, TranslateError> {
        let lines: Vec<&str> = source.lines().collect();

        // collect chunk starts up front; the seek dance of a streaming
        // reader is not needed over an in-memory listing
        for (idx, line) in lines.iter().enumerate() {
            let t = line.trim_start();
            if let Some(rest) = t.strip_prefix("; START OF FUNCTION CHUNK FOR ") {
                if let Some(name) = rest.split_whitespace().next() {
                    self.chunks.push(Chunk {
                        name: name.to_string(),
                        line_idx: idx,
                    });
                }
            }
        }
        self.chunks
            .sort_by(|a, b| a.name.cmp(&b.name).then(a.line_idx.cmp(&b.line_idx)));

        let mut ln = 0usize;
        while ln < lines.len() && !self.end {
            let next = self.handle_line(&lines, ln)?;
            ln = next;
        }

        self.flush_pending()?;

        if self.opts.header_mode {
            self.out = self.hdrgen.output();
        }
        Ok(self.out)
    }

    fn perr(&self, lineno: usize, reason: impl Into<String>) -> TranslateError {
        TranslateError::ParseError {
            file: self.asm_file.clone(),
            line: lineno,
            reason: reason.into(),
        }
    }

    fn flush_pending(&mut self) -> Result<(), TranslateError> {
        if let Some(mut ctx) = self.pending.take() {
            if self.opts.header_mode {
                self.hdrgen.collect(&mut ctx)?;
            } else {
                let an = crate::analysis::analyze(&mut ctx)?;
                let text = gen_func(&mut ctx, &an)?;
                self.out.push_str(&text);
            }
        }
        self.cur_attrs = FuncAttrs::empty();
        self.skip_warned = false;
        Ok(())
    }

    // returns the next line index to process
    fn handle_line(&mut self, lines: &[&str], ln: usize) -> Result<usize, TranslateError> {
        let lineno = ln + 1;
        let raw = lines[ln];
        let parsed = parse_line(&self.asm_file, lineno, raw)?;

        // whole-line comments carry the driver directives
        if parsed.stmt == AsmStmt::Empty {
            if let Some(comment) = &parsed.comment {
                let c = comment.trim_start();
                if c.starts_with("=============== S U B") {
                    self.flush_pending()?;
                } else if let Some(attrs) = c.strip_prefix("Attributes:") {
                    self.parse_attributes(lineno, attrs);
                } else if c.starts_with("FUNCTION CHUNK AT") {
                    if self.cur.is_some() {
                        self.chunks_used = true;
                    }
                } else if c.starts_with("END OF FUNCTION CHUNK") {
                    if let Some(next_ln) = self.chunk_end(ln)? {
                        return Ok(next_ln);
                    }
                } else if c.starts_with("sctend") {
                    self.end = true;
                }
                // START OF FUNCTION CHUNK markers were collected up front
            }
            return Ok(ln + 1);
        }

        // an sctproto hint rides in a trailing comment
        if let Some(comment) = &parsed.comment {
            let c = comment.trim_start();
            if let Some(hint) = c.strip_prefix("sctproto:") {
                self.sct_hint = Some(hint.trim().to_string());
            } else if c.starts_with("sctend") {
                // stop here; the run loop flushes whatever is pending
                self.end = true;
                return Ok(lines.len());
            }
        }

        // data directives after endp feed the finished function
        if let AsmStmt::Data { label, lmod, items } = &parsed.stmt {
            let target = if self.pending.is_some() {
                self.pending.as_mut()
            } else {
                self.cur.as_mut()
            };
            if let Some(ctx) = target {
                collect_data(ctx, &self.asm_file, lineno, label, *lmod, items, self.opts.verbose)?;
                return Ok(ln + 1);
            }
            // stray data outside any function
            return Ok(ln + 1);
        }

        // any other statement finishes a pending function first
        if self.pending.is_some() {
            self.flush_pending()?;
            if self.end {
                return Ok(lines.len());
            }
        }

        match parsed.stmt {
            AsmStmt::Proc { name } => {
                if let Some(ctx) = &self.cur {
                    return Err(self.perr(
                        lineno,
                        format!("proc '{}' while in_func '{}'?", name, ctx.name),
                    ));
                }
                self.skip_func = self.rlist.contains(&name);
                let mut ctx = FuncContext::new(
                    &self.asm_file,
                    &name,
                    self.protos,
                    self.opts.allow_regfunc,
                );
                ctx.attrs = self.cur_attrs;
                self.cur = Some(ctx);
                self.pending_label = Some(name);
                self.chunks_used = false;
            }

            AsmStmt::Endp { name } => {
                let ctx = self
                    .cur
                    .as_ref()
                    .ok_or_else(|| self.perr(lineno, format!("endp '{}' while not in_func?", name)))?;
                if ctx.name != name {
                    return Err(self.perr(
                        lineno,
                        format!("endp '{}' while in_func '{}'?", name, ctx.name),
                    ));
                }

                // import jump thunk
                if ctx.attrs.contains(FuncAttrs::THUNK)
                    && ctx.ops.len() == 1
                    && ctx.ops[0].op == Op::Jmp
                    && ctx.ops[0].operands[0].had_ds
                {
                    self.skip_func = true;
                }

                if !self.skip_func && self.chunks_used {
                    // start processing chunks
                    let func = ctx.name.clone();
                    let first = self
                        .chunks
                        .iter()
                        .position(|c| c.name == func)
                        .ok_or_else(|| {
                            self.perr(lineno, format!("'{}' needs chunks, but none found", func))
                        })?;
                    self.chunk_ret = Some(ln + 1);
                    self.chunk_i = Some(first + 1);
                    self.pending_label = None;
                    return Ok(self.chunks[first].line_idx + 1);
                }

                let ctx = self.cur.take();
                if !self.skip_func {
                    self.pending = ctx;
                }
                self.skip_func = false;
                self.pending_label = None;
            }

            AsmStmt::Ends { .. } => {
                if !self.opts.multi_seg {
                    self.flush_pending()?;
                    self.end = true;
                    return Ok(lines.len());
                }
                // scan for the next 32bit code segment
                let mut next = ln + 1;
                while next < lines.len() {
                    if lines[next].contains("segment para public 'CODE' use32") {
                        break;
                    }
                    next += 1;
                }
                return Ok(next + 1);
            }

            AsmStmt::Label { name } => {
                if self.cur.is_none() || self.skip_func {
                    if !self.skip_warned && !self.skip_func {
                        if self.opts.verbose {
                            info!("skipping from '{}'", name);
                        }
                        self.skip_warned = true;
                    }
                    self.pending_label = None;
                    return Ok(ln + 1);
                }
                self.set_label(lineno, &name)?;
            }

            AsmStmt::Equate { name, lmod, offset } => {
                if self.cur.is_none() || self.skip_func {
                    return Ok(ln + 1);
                }
                if let Some(ctx) = self.cur.as_mut() {
                    ctx.equs.push(crate::ir::Equate { name, lmod, offset });
                }
            }

            AsmStmt::Instr {
                prefix,
                mnemonic,
                operands,
            } => {
                if self.cur.is_none() || self.skip_func {
                    return Ok(ln + 1);
                }
                let hint = self.sct_hint.take();
                let label = self.pending_label.take();
                let quiet_pp = self.opts.header_mode;
                let file = self.asm_file.clone();
                let ctx = match self.cur.as_mut() {
                    Some(ctx) => ctx,
                    None => return Ok(ln + 1),
                };

                if ctx.ops.len() >= MAX_OPS {
                    return Err(TranslateError::CapacityError {
                        file,
                        line: lineno,
                        reason: "too many ops".to_string(),
                    });
                }

                let mut po = crate::parser::instructions::parse_op(
                    ctx.protos,
                    &ctx.equs,
                    prefix.as_deref(),
                    &mnemonic,
                    &operands,
                    quiet_pp,
                    lineno,
                )
                .map_err(|reason| TranslateError::ParseError {
                    file,
                    line: lineno,
                    reason,
                })?;

                if let Some(hint) = hint {
                    if po.op == Op::Call || po.op == Op::Jmp {
                        po.proto_hint = Some(hint);
                    }
                }

                ctx.ops.push(po);
                ctx.labels.push(label);
                ctx.label_refs.push(Vec::new());
            }

            AsmStmt::Data { .. } | AsmStmt::Empty => {}
        }

        Ok(ln + 1)
    }

    fn set_label(&mut self, lineno: usize, name: &str) -> Result<(), TranslateError> {
        let name = name.split(':').next().unwrap_or(name);
        if let Some(old) = &self.pending_label {
            if !old.starts_with("algn_") {
                return Err(self.perr(lineno, format!("dupe label '{}' vs '{}'?", name, old)));
            }
        }
        self.pending_label = Some(name.to_string());
        Ok(())
    }

    fn parse_attributes(&mut self, _lineno: usize, text: &str) {
        let mut rest = text.trim();
        let attrs = [
            ("bp-based frame", FuncAttrs::BP_FRAME),
            ("library function", FuncAttrs::LIB_FUNC),
            ("static", FuncAttrs::STATIC),
            ("noreturn", FuncAttrs::NORETURN),
            ("thunk", FuncAttrs::THUNK),
            ("fpd=", FuncAttrs::FPD),
        ];

        'outer: while !rest.is_empty() {
            for (txt, attr) in attrs {
                if let Some(r) = rest.strip_prefix(txt) {
                    self.cur_attrs.insert(attr);
                    rest = r.trim_start();
                    if txt == "fpd=" {
                        // value not used yet
                        rest = rest
                            .split_once(char::is_whitespace)
                            .map(|(_, r)| r)
                            .unwrap_or("")
                            .trim_start();
                    }
                    continue 'outer;
                }
            }
            info!("unparsed IDA attr: {}", rest);
            break;
        }
    }

    // returns Some(next line) when jumping between chunks
    fn chunk_end(&mut self, ln: usize) -> Result<Option<usize>, TranslateError> {
        let chunk_i = match self.chunk_i {
            Some(i) => i,
            None => return Ok(None),
        };

        let func = match &self.cur {
            Some(ctx) => ctx.name.clone(),
            None => return Ok(None),
        };

        if chunk_i < self.chunks.len() && self.chunks[chunk_i].name == func {
            // move on to the next chunk
            let next = self.chunks[chunk_i].line_idx + 1;
            self.chunk_i = Some(chunk_i + 1);
            return Ok(Some(next));
        }

        let ret = self
            .chunk_ret
            .take()
            .ok_or_else(|| self.perr(ln + 1, "no return from chunk?"))?;
        self.chunk_i = None;

        // the endp was consumed before the chunks; finish the function now
        let ctx = self.cur.take();
        if !self.skip_func {
            self.pending = ctx;
        }
        self.skip_func = false;
        Ok(Some(ret))
    }
}

fn collect_data(
    ctx: &mut FuncContext,
    file: &str,
    lineno: usize,
    label: &Option<String>,
    lmod: LenMod,
    items: &[String],
    verbose: bool,
) -> Result<(), TranslateError> {
    let perr = |reason: String| TranslateError::ParseError {
        file: file.to_string(),
        line: lineno,
        reason,
    };

    if let Some(label) = label {
        ctx.func_pd.push(ParsedData {
            label: label.clone(),
            kind: OprKind::Const,
            lmod,
            items: Vec::new(),
        });
    } else {
        match ctx.func_pd.last() {
            Some(pd) => {
                if pd.lmod != lmod {
                    return Err(perr(format!("lmod change? {:?}->{:?}", pd.lmod, lmod)));
                }
            }
            None => {
                if verbose {
                    info!("skipping alignment byte?");
                }
                return Ok(());
            }
        }
    }

    let pd = match ctx.func_pd.last_mut() {
        Some(pd) => pd,
        None => return Ok(()),
    };

    for item in items {
        let item = item.trim();
        let (kind_is_offset, value) = match item.strip_prefix("offset ") {
            Some(rest) => (true, rest.trim()),
            None => (false, item),
        };
        if kind_is_offset {
            pd.kind = OprKind::Offset;
        }

        if pd.kind == OprKind::Offset {
            pd.items.push(DataItem {
                val: DataVal::Label(value.to_string()),
                bt_i: None,
            });
        } else {
            let num = parse_number(value)
                .ok_or_else(|| perr(format!("bad data value: '{}'", value)))?;
            pd.items.push(DataItem {
                val: DataVal::Num(num),
                bt_i: None,
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rlist() {
        let rlist = parse_rlist("; comment\nfunc_a\n#if 0\nfunc_b\n#endif\nfunc_c extra\n", false);
        assert!(rlist.contains("func_a"));
        assert!(!rlist.contains("func_b"));
        assert!(rlist.contains("func_c"));
    }

    #[test]
    fn test_simple_function() {
        let db = ProtoDb::from_header("int f(int a1);").unwrap();
        let tr = Translator::new("t.asm", &db, HashSet::new(), Options::default());
        let out = tr
            .run(
                "f proc near\n\
                 push ebp\n\
                 mov ebp, esp\n\
                 mov eax, [ebp+8]\n\
                 add eax, 1\n\
                 pop ebp\n\
                 retn\n\
                 f endp\n",
            )
            .unwrap();
        assert!(out.contains("int f(int a1)"), "got: {}", out);
        assert!(out.contains("eax = (u32)a1;"), "got: {}", out);
        assert!(out.contains("eax += 1;"), "got: {}", out);
        assert!(out.contains("return eax;"), "got: {}", out);
    }

    #[test]
    fn test_skip_list() {
        let db = ProtoDb::from_header("int f(void);").unwrap();
        let mut rlist = HashSet::new();
        rlist.insert("f".to_string());
        let tr = Translator::new("t.asm", &db, rlist, Options::default());
        let out = tr
            .run("f proc near\nmov eax, 1\nretn\nf endp\n")
            .unwrap();
        assert!(out.is_empty(), "got: {}", out);
    }
}
