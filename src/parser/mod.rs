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

pub mod instructions;
pub mod operands;

use pest::Parser;
use pest_derive::Parser;

use crate::errors::TranslateError;
use crate::ir::LenMod;

#[derive(Parser)]
#[grammar = "./grammar.pest"]
pub struct AsmParser;

/// One classified listing line.
#[derive(Debug, Clone, PartialEq)]
pub enum AsmStmt {
    Empty,
    Equate {
        name: String,
        lmod: LenMod,
        offset: i32,
    },
    Proc {
        name: String,
    },
    Endp {
        name: String,
    },
    Ends {
        name: String,
    },
    Label {
        name: String,
    },
    Data {
        label: Option<String>,
        lmod: LenMod,
        items: Vec<String>,
    },
    Instr {
        prefix: Option<String>,
        mnemonic: String,
        operands: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedLine {
    pub stmt: AsmStmt,
    pub comment: Option<String>,
}

/// Numeric literals: hex with trailing `h` or leading `0x`, decimal
/// otherwise, optional leading `-`.
pub fn parse_number(s: &str) -> Option<u32> {
    let (neg, t) = match s.strip_prefix('-') {
        Some(r) => (true, r),
        None => (false, s),
    };
    let v = if let Some(h) = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        u64::from_str_radix(h, 16).ok()?
    } else if let Some(h) = t.strip_suffix('h').or_else(|| t.strip_suffix('H')) {
        u64::from_str_radix(h, 16).ok()?
    } else {
        t.parse::<u64>().ok()?
    };
    let v = v as u32;
    Some(if neg { v.wrapping_neg() } else { v })
}

/// Numbers re-emitted in C-friendly form.
pub fn printf_number(n: u32) -> String {
    if n < 10 {
        n.to_string()
    } else {
        format!("0x{:02x}", n)
    }
}

pub fn lmod_from_directive(d: &str) -> Option<LenMod> {
    match d {
        "dd" => Some(LenMod::Dword),
        "dw" => Some(LenMod::Word),
        "db" => Some(LenMod::Byte),
        _ => None,
    }
}

fn lmod_from_size_spec(s: &str) -> Option<LenMod> {
    match s {
        "byte" => Some(LenMod::Byte),
        "word" => Some(LenMod::Word),
        "dword" => Some(LenMod::Dword),
        "qword" => Some(LenMod::Qword),
        _ => None,
    }
}

// Assembler furniture the translator has no use for.
fn is_ignorable(text: &str) -> bool {
    let mut words = text.split_whitespace();
    let first = match words.next() {
        Some(w) => w,
        None => return false,
    };
    if first.starts_with('.') {
        return true;
    }
    if matches!(
        first,
        "include" | "assume" | "align" | "public" | "extrn" | "option" | "end"
    ) {
        return true;
    }
    matches!(words.next(), Some("segment"))
}

/// Classify one listing line. `sctpatch:` trailing comments replace the
/// line's own content.
pub fn parse_line(file: &str, lineno: usize, text: &str) -> Result<ParsedLine, TranslateError> {
    let trimmed = text.trim();
    if !trimmed.starts_with(';') && is_ignorable(trimmed) {
        return Ok(ParsedLine {
            stmt: AsmStmt::Empty,
            comment: None,
        });
    }

    // random tabs happen in real listings
    let text = text.replace('\t', " ");

    let mut pairs =
        AsmParser::parse(Rule::line, &text).map_err(|e| TranslateError::ParseError {
            file: file.to_string(),
            line: lineno,
            reason: e.to_string(),
        })?;

    let line = pairs.next().ok_or_else(|| TranslateError::ParseError {
        file: file.to_string(),
        line: lineno,
        reason: "empty parse".to_string(),
    })?;

    let mut stmt = AsmStmt::Empty;
    let mut comment = None;

    for pair in line.into_inner() {
        match pair.as_rule() {
            Rule::stmt => {
                let inner = pair.into_inner().next().ok_or_else(|| {
                    TranslateError::ParseError {
                        file: file.to_string(),
                        line: lineno,
                        reason: "empty stmt".to_string(),
                    }
                })?;
                stmt = build_stmt(file, lineno, inner)?;
            }
            Rule::comment => {
                comment = Some(pair.as_str().trim_start_matches(';').to_string());
            }
            _ => {}
        }
    }

    // an sctpatch comment overrides whatever the line said
    if let Some(c) = &comment {
        if let Some(patch) = c.trim_start().strip_prefix("sctpatch:") {
            let patch = patch.trim();
            if !patch.is_empty() {
                return parse_line(file, lineno, patch);
            }
            return Ok(ParsedLine {
                stmt: AsmStmt::Empty,
                comment: None,
            });
        }
    }

    Ok(ParsedLine { stmt, comment })
}

fn build_stmt(
    file: &str,
    lineno: usize,
    pair: pest::iterators::Pair<Rule>,
) -> Result<AsmStmt, TranslateError> {
    let perr = |reason: String| TranslateError::ParseError {
        file: file.to_string(),
        line: lineno,
        reason,
    };

    match pair.as_rule() {
        Rule::equate => {
            let mut inner = pair.into_inner();
            let name = inner.next().ok_or_else(|| perr("bad equate".into()))?;
            let size = inner.next().ok_or_else(|| perr("bad equate".into()))?;
            let num = inner.next().ok_or_else(|| perr("bad equate".into()))?;
            let lmod = lmod_from_size_spec(size.as_str())
                .ok_or_else(|| perr(format!("bad lmod: '{}'", size.as_str())))?;
            let offset = parse_number(num.as_str())
                .ok_or_else(|| perr(format!("bad equ value: '{}'", num.as_str())))?;
            Ok(AsmStmt::Equate {
                name: name.as_str().to_string(),
                lmod,
                offset: offset as i32,
            })
        }
        Rule::proc_decl => {
            let name = pair
                .into_inner()
                .next()
                .ok_or_else(|| perr("bad proc".into()))?;
            Ok(AsmStmt::Proc {
                name: name.as_str().to_string(),
            })
        }
        Rule::endp_decl => {
            let name = pair
                .into_inner()
                .next()
                .ok_or_else(|| perr("bad endp".into()))?;
            Ok(AsmStmt::Endp {
                name: name.as_str().to_string(),
            })
        }
        Rule::ends_decl => {
            let name = pair
                .into_inner()
                .next()
                .ok_or_else(|| perr("bad ends".into()))?;
            Ok(AsmStmt::Ends {
                name: name.as_str().to_string(),
            })
        }
        Rule::label_def => {
            let name = pair
                .into_inner()
                .next()
                .ok_or_else(|| perr("bad label".into()))?;
            Ok(AsmStmt::Label {
                name: name.as_str().to_string(),
            })
        }
        Rule::data_stmt => {
            let mut label = None;
            let mut lmod = LenMod::Unspec;
            let mut items = Vec::new();
            for p in pair.into_inner() {
                match p.as_rule() {
                    Rule::ident => label = Some(p.as_str().to_string()),
                    Rule::data_dir => {
                        lmod = lmod_from_directive(p.as_str())
                            .ok_or_else(|| perr(format!("unhandled directive: '{}'", p.as_str())))?;
                    }
                    Rule::operand_list => {
                        for op in p.into_inner() {
                            items.push(op.as_str().trim().to_string());
                        }
                    }
                    _ => {}
                }
            }
            Ok(AsmStmt::Data { label, lmod, items })
        }
        Rule::instr => {
            let mut prefix = None;
            let mut mnemonic = String::new();
            let mut operands = Vec::new();
            for p in pair.into_inner() {
                match p.as_rule() {
                    Rule::prefix_kw => prefix = Some(p.as_str().to_string()),
                    Rule::mnemonic => mnemonic = p.as_str().to_string(),
                    Rule::operand_list => {
                        for op in p.into_inner() {
                            operands.push(op.as_str().trim().to_string());
                        }
                    }
                    _ => {}
                }
            }
            Ok(AsmStmt::Instr {
                prefix,
                mnemonic,
                operands,
            })
        }
        other => Err(perr(format!("unhandled line shape: {:?}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(text: &str) -> ParsedLine {
        parse_line("test.asm", 1, text).unwrap()
    }

    #[test]
    fn test_parse_empty_and_comment() {
        assert_eq!(p("").stmt, AsmStmt::Empty);
        assert_eq!(p("   ").stmt, AsmStmt::Empty);
        let c = p("; Attributes: bp-based frame");
        assert_eq!(c.stmt, AsmStmt::Empty);
        assert_eq!(c.comment.as_deref(), Some(" Attributes: bp-based frame"));
    }

    #[test]
    fn test_parse_proc_endp() {
        assert_eq!(
            p("sub_401000 proc near").stmt,
            AsmStmt::Proc {
                name: "sub_401000".to_string()
            }
        );
        assert_eq!(
            p("sub_401000 endp").stmt,
            AsmStmt::Endp {
                name: "sub_401000".to_string()
            }
        );
    }

    #[test]
    fn test_parse_equate() {
        assert_eq!(
            p("var_4 = dword ptr -4").stmt,
            AsmStmt::Equate {
                name: "var_4".to_string(),
                lmod: LenMod::Dword,
                offset: -4,
            }
        );
        assert_eq!(
            p("arg_0 = dword ptr  8").stmt,
            AsmStmt::Equate {
                name: "arg_0".to_string(),
                lmod: LenMod::Dword,
                offset: 8,
            }
        );
    }

    #[test]
    fn test_parse_label() {
        assert_eq!(
            p("loc_401010:").stmt,
            AsmStmt::Label {
                name: "loc_401010".to_string()
            }
        );
    }

    #[test]
    fn test_parse_instr() {
        let l = p("mov eax, dword ptr [ebp+8] ; load arg");
        assert_eq!(
            l.stmt,
            AsmStmt::Instr {
                prefix: None,
                mnemonic: "mov".to_string(),
                operands: vec!["eax".to_string(), "dword ptr [ebp+8]".to_string()],
            }
        );
        assert_eq!(l.comment.as_deref(), Some(" load arg"));
    }

    #[test]
    fn test_parse_rep_prefix() {
        assert_eq!(
            p("rep stosd").stmt,
            AsmStmt::Instr {
                prefix: Some("rep".to_string()),
                mnemonic: "stosd".to_string(),
                operands: vec![],
            }
        );
        // ret must not be eaten by the rep prefix rule
        assert_eq!(
            p("retn").stmt,
            AsmStmt::Instr {
                prefix: None,
                mnemonic: "retn".to_string(),
                operands: vec![],
            }
        );
    }

    #[test]
    fn test_parse_data() {
        assert_eq!(
            p("jpt_40 dd offset loc_1, offset loc_2").stmt,
            AsmStmt::Data {
                label: Some("jpt_40".to_string()),
                lmod: LenMod::Dword,
                items: vec!["offset loc_1".to_string(), "offset loc_2".to_string()],
            }
        );
        assert_eq!(
            p("dd offset loc_3").stmt,
            AsmStmt::Data {
                label: None,
                lmod: LenMod::Dword,
                items: vec!["offset loc_3".to_string()],
            }
        );
    }

    #[test]
    fn test_parse_ignorable() {
        assert_eq!(p(".686p").stmt, AsmStmt::Empty);
        assert_eq!(p("include uni.inc").stmt, AsmStmt::Empty);
        assert_eq!(p("_text segment para public 'CODE' use32").stmt, AsmStmt::Empty);
        assert_eq!(p("align 10h").stmt, AsmStmt::Empty);
    }

    #[test]
    fn test_sctpatch_replaces_line() {
        let l = p("mov eax, 1 ; sctpatch: xor eax, eax");
        assert_eq!(
            l.stmt,
            AsmStmt::Instr {
                prefix: None,
                mnemonic: "xor".to_string(),
                operands: vec!["eax".to_string(), "eax".to_string()],
            }
        );
    }

    #[test]
    fn test_parse_number_forms() {
        assert_eq!(parse_number("10"), Some(10));
        assert_eq!(parse_number("0x1f"), Some(0x1f));
        assert_eq!(parse_number("0FFh"), Some(0xff));
        assert_eq!(parse_number("-4"), Some((-4i32) as u32));
        assert_eq!(parse_number("junk"), None);
    }

    #[test]
    fn test_printf_number() {
        assert_eq!(printf_number(5), "5");
        assert_eq!(printf_number(200), "0xc8");
    }
}
