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

use log::info;

use crate::header::{ProtoDb, guess_lmod_from_c_type};
use crate::ir::{
    Equate, InstFlags, LenMod, Opr, OprKind, REGS_R8H, REGS_R8L, REGS_R16, REGS_R32,
};
use crate::parser::{parse_number, printf_number};

/// Segment prefix code: cs=1 ds=2 ss=3 es=4 fs=5 gs=6.
pub fn check_segment_prefix(s: &str) -> Option<u32> {
    let b = s.as_bytes();
    if b.len() < 3 || b[1] != b's' || b[2] != b':' {
        return None;
    }
    match b[0] {
        b'c' => Some(1),
        b'd' => Some(2),
        b's' => Some(3),
        b'e' => Some(4),
        b'f' => Some(5),
        b'g' => Some(6),
        _ => None,
    }
}

pub fn parse_reg(s: &str) -> Option<(usize, LenMod)> {
    if let Some(i) = REGS_R32.iter().position(|r| *r == s) {
        let lmod = if i >= 8 { LenMod::Qword } else { LenMod::Dword };
        return Some((i, lmod));
    }
    if let Some(i) = REGS_R16.iter().position(|r| *r == s) {
        return Some((i, LenMod::Word));
    }
    if let Some(i) = REGS_R8H.iter().position(|r| *r == s) {
        return Some((i, LenMod::Byte));
    }
    if let Some(i) = REGS_R8L.iter().position(|r| *r == s) {
        return Some((i, LenMod::Byte));
    }
    None
}

fn is_sep(c: char) -> bool {
    matches!(c, '+' | '-' | '*' | '/' | '(' | ')' | '[' | ']')
}

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '@' | '?' | '$')
}

/// Does `s` start with a 3-letter register name followed by a separator?
pub fn is_reg_in_str(s: &str) -> bool {
    if s.len() < 3 {
        return false;
    }
    if let Some(c) = s.chars().nth(3) {
        if !is_sep(c) && c != ' ' {
            return false;
        }
    }
    REGS_R32.iter().any(|r| s.starts_with(r))
}

/// Rescan a memory expression: collect referenced registers into `regmask`
/// and re-emit numeric literals in C-friendly form. Returns the converted
/// expression and the token count.
pub fn parse_indmode(expr: &str, regmask: &mut u32) -> (String, usize) {
    let mut out = String::new();
    let mut count = 0usize;
    let mut rest = expr;

    loop {
        rest = rest.trim_start();
        while let Some(c) = rest.chars().next() {
            if is_sep(c) {
                out.push(c);
                rest = rest[c.len_utf8()..].trim_start();
            } else {
                break;
            }
        }

        // skip '?s:' prefixes
        if check_segment_prefix(rest).is_some() {
            rest = &rest[3..];
        }

        let end = rest
            .char_indices()
            .find(|(_, c)| !is_word_char(*c))
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        if end == 0 {
            break;
        }
        let word = &rest[..end];
        rest = &rest[end..];
        count += 1;

        if let Some((reg, _)) = parse_reg(word) {
            *regmask |= 1 << reg;
            out.push_str(word);
            continue;
        }

        if word.starts_with(|c: char| c.is_ascii_digit()) {
            if let Some(num) = parse_number(word) {
                out.push_str(&printf_number(num));
                continue;
            }
        }

        // some label or identifier, pass through
        out.push_str(word);
    }

    (out, count)
}

/// A decomposed IDA stack expression: the symbolic part and an optional
/// index register.
#[derive(Debug, Clone, PartialEq)]
pub struct StackEl {
    pub name: String,
    pub extra_reg: Option<String>,
}

/// Split `ebp+var`/`esp+N+var` forms into their symbolic equate name,
/// peeling an index register if one rides along.
pub fn parse_stack_el(name: &str, early_try: bool, bp_frame: bool) -> Option<StackEl> {
    let mut extra_reg = None;

    if bp_frame || early_try {
        let mut p = name;
        if is_reg_in_str(p) && p.len() > 4 && p[3..].starts_with("+ebp+") {
            extra_reg = Some(p[..3].to_string());
            p = &p[4..];
        }

        if let Some(mut rest) = p.strip_prefix("ebp+") {
            if let Some(plus) = rest.find('+') {
                if is_reg_in_str(rest) {
                    extra_reg = Some(rest[..plus].to_string());
                    rest = &rest[plus + 1..];
                }
            }
            if rest.starts_with(|c: char| c.is_ascii_digit()) {
                return None;
            }
            return Some(StackEl {
                name: rest.to_string(),
                extra_reg,
            });
        }
    }

    let mut s = name.strip_prefix("esp+")?;

    if let Some(plus) = s.find('+') {
        if is_reg_in_str(s) {
            extra_reg = Some(s[..plus].to_string());
            s = &s[plus + 1..];
        }
        if let Some(p2) = s.find('+') {
            let num = &s[..p2];
            let num = num.strip_prefix("0x").unwrap_or(num);
            if num.is_empty() || i64::from_str_radix(num, 16).is_err() {
                return None;
            }
            s = &s[p2 + 1..];
        }
    }

    if s.starts_with(|c: char| c.is_ascii_digit()) {
        return None;
    }
    Some(StackEl {
        name: s.to_string(),
        extra_reg,
    })
}

/// Look up an equate by name, peeling a trailing `+0x..` extra offset.
pub fn equ_find<'a>(equs: &'a [Equate], name: &str) -> Option<(&'a Equate, i32)> {
    let (base, extra) = match name.find('+') {
        Some(pos) => {
            let tail = &name[pos + 1..];
            let tail = tail.strip_prefix("0x").unwrap_or(tail);
            let extra = i64::from_str_radix(tail, 16).ok()?;
            (&name[..pos], extra as i32)
        }
        None => (name, 0),
    };

    equs.iter().find(|e| e.name == base).map(|e| (e, extra))
}

fn guess_lmod_from_name(opr: &mut Opr) -> bool {
    for (prefix, lmod) in [
        ("dword_", LenMod::Dword),
        ("word_", LenMod::Word),
        ("byte_", LenMod::Byte),
        ("qword_", LenMod::Qword),
    ] {
        if opr.name.starts_with(prefix) {
            opr.lmod = lmod;
            return true;
        }
    }
    false
}

pub fn setup_implicit_reg(opr: &mut Opr, reg: usize, lmod: LenMod, regmask: &mut u32) {
    opr.kind = OprKind::Reg;
    opr.reg = Some(reg);
    opr.lmod = lmod;
    *regmask |= 1 << reg;
}

/// Parse one raw operand string. Returns the operand plus the direct and
/// indirect register masks it references.
pub fn parse_operand(
    db: &ProtoDb,
    equs: &[Equate],
    raw: &str,
    op_flags: InstFlags,
    quiet_pp: bool,
) -> Result<(Opr, u32, u32), String> {
    let mut opr = Opr::default();
    let mut regmask = 0u32;
    let mut regmask_indirect = 0u32;

    let words: Vec<&str> = raw.split_whitespace().collect();
    if words.is_empty() {
        return Err("empty operand".to_string());
    }
    let mut w = 0usize;

    // branch targets first: `near ptr x`, `short x`, bare label
    if op_flags.contains(InstFlags::JMP) && !words[w].starts_with(|c: char| c.is_ascii_digit()) {
        let wordc_in = words.len() - w;
        let label = if wordc_in == 3 && words[w] == "near" && words[w + 1] == "ptr" {
            Some(words[w + 2])
        } else if wordc_in == 2 && words[w] == "short" {
            Some(words[w + 1])
        } else if wordc_in == 1 && !words[w].contains('[') && parse_reg(words[w]).is_none() {
            Some(words[w])
        } else {
            None
        };

        if let Some(mut label) = label {
            opr.kind = OprKind::Label;
            if let Some(seg) = check_segment_prefix(label) {
                if seg >= 5 {
                    return Err("fs/gs used".to_string());
                }
                opr.had_ds = true;
                label = &label[3..];
            }
            opr.name = label.to_string();
            return Ok((opr, regmask, regmask_indirect));
        }
    }

    if words.len() - w >= 3 && words[w + 1] == "ptr" {
        opr.lmod = match words[w] {
            "dword" => LenMod::Dword,
            "word" => LenMod::Word,
            "byte" => LenMod::Byte,
            "qword" => LenMod::Qword,
            other => return Err(format!("type parsing failed: '{}'", other)),
        };
        w += 2;
    }

    let mut pp_lookup: Option<(String, bool)> = None; // (name, quiet)

    if words.len() - w == 2 {
        if words[w] == "offset" {
            opr.kind = OprKind::Offset;
            opr.lmod = LenMod::Dword;
            opr.name = words[w + 1].to_string();
            pp_lookup = Some((opr.name.clone(), true));
        } else if words[w] == "(offset" {
            let inner = words[w + 1]
                .strip_suffix(')')
                .ok_or_else(|| "parse of bracketed offset failed".to_string())?;
            opr.kind = OprKind::Offset;
            opr.name = inner.to_string();
            return Ok((opr, regmask, regmask_indirect));
        } else {
            return Err(format!("one word expected, got '{}'", raw));
        }
    } else if words.len() - w == 1 {
        let mut word = words[w].to_string();
        if let Some(seg) = check_segment_prefix(&word) {
            if seg >= 5 {
                return Err("fs/gs used".to_string());
            }
            opr.had_ds = true;
            word = word[3..].to_string();
        }
        opr.name = word.clone();

        if let Some(stripped) = word.strip_prefix('[') {
            // memory through an addressing expression
            opr.kind = OprKind::RegMem;
            let inner = stripped
                .strip_suffix(']')
                .ok_or_else(|| "[] parse failure".to_string())?;
            let (converted, _) = parse_indmode(inner, &mut regmask_indirect);
            opr.name = converted;
            if opr.lmod == LenMod::Unspec {
                // might be an equ
                if let Some(el) = parse_stack_el(&opr.name, true, false) {
                    if let Some((eq, _)) = equ_find(equs, &el.name) {
                        opr.lmod = eq.lmod;
                    }
                }
            }
            return Ok((opr, regmask, regmask_indirect));
        } else if let Some(bracket) = word.find('[') {
            // label[reg] form
            opr.kind = OprKind::RegMem;
            let (_, _) = parse_indmode(&word[bracket..], &mut regmask_indirect);
            // keep the full label[reg] text as the name
            pp_lookup = Some((word[..bracket].to_string(), true));
        } else if word.starts_with(|c: char| c.is_ascii_digit()) || word.starts_with('-') {
            let number = parse_number(&word)
                .ok_or_else(|| format!("number parse failure: '{}'", word))?;
            opr.kind = OprKind::Const;
            opr.val = number;
            opr.name = printf_number(number);
            return Ok((opr, regmask, regmask_indirect));
        } else if let Some((reg, lmod)) = parse_reg(&word) {
            setup_implicit_reg(&mut opr, reg, lmod, &mut regmask);
            opr.name = word;
            return Ok((opr, regmask, regmask_indirect));
        } else {
            // most likely a var in the data segment
            opr.kind = OprKind::Label;
            pp_lookup = Some((word, quiet_pp));
        }
    } else {
        return Err(format!("one word expected, got '{}'", raw));
    }

    if let Some((lookup_name, quiet)) = pp_lookup {
        let pp = db.lookup(&lookup_name);
        if pp.is_none() && !quiet {
            info!("no prototype for '{}'", lookup_name);
        }
        if let Some(pp) = pp {
            if pp.is_fptr || pp.is_func {
                opr.lmod = LenMod::Dword;
                opr.is_ptr = true;
            } else {
                match guess_lmod_from_c_type(&pp.ret_type) {
                    Some(tmplmod) => {
                        if opr.lmod == LenMod::Unspec {
                            opr.lmod = tmplmod;
                            opr.type_from_var = true;
                        } else if opr.lmod != tmplmod {
                            opr.size_mismatch = true;
                            if tmplmod < opr.lmod {
                                opr.size_lt = true;
                            }
                        }
                    }
                    None => info!(
                        "unhandled C type '{}' for '{}'",
                        pp.ret_type.name, opr.name
                    ),
                }
                opr.is_ptr = pp.ret_type.is_ptr;
            }
            opr.is_array = pp.ret_type.is_array;
            opr.pp = Some(pp.clone());
        }
    }

    if opr.lmod == LenMod::Unspec {
        guess_lmod_from_name(&mut opr);
    }
    Ok((opr, regmask, regmask_indirect))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{XAX, XBP, XCX};

    fn parse(raw: &str) -> (Opr, u32, u32) {
        let db = ProtoDb::default();
        parse_operand(&db, &[], raw, InstFlags::empty(), true).unwrap()
    }

    #[test]
    fn test_reg_operand() {
        let (opr, regmask, _) = parse("ecx");
        assert_eq!(opr.kind, OprKind::Reg);
        assert_eq!(opr.reg, Some(XCX));
        assert_eq!(opr.lmod, LenMod::Dword);
        assert_eq!(regmask, 1 << XCX);

        let (opr, _, _) = parse("al");
        assert_eq!(opr.reg, Some(XAX));
        assert_eq!(opr.lmod, LenMod::Byte);
    }

    #[test]
    fn test_const_operand() {
        let (opr, _, _) = parse("0Ah");
        assert_eq!(opr.kind, OprKind::Const);
        assert_eq!(opr.val, 10);

        let (opr, _, _) = parse("-1");
        assert_eq!(opr.val, u32::MAX);
    }

    #[test]
    fn test_regmem_operand() {
        let (opr, _, ind) = parse("dword ptr [ebp+8]");
        assert_eq!(opr.kind, OprKind::RegMem);
        assert_eq!(opr.lmod, LenMod::Dword);
        assert_eq!(opr.name, "ebp+8");
        assert_eq!(ind, 1 << XBP);
    }

    #[test]
    fn test_regmem_hex_conversion() {
        let (opr, _, _) = parse("[ebp+0Ch]");
        assert_eq!(opr.name, "ebp+0x0c");
    }

    #[test]
    fn test_branch_label() {
        let db = ProtoDb::default();
        let (opr, _, _) =
            parse_operand(&db, &[], "short loc_40", InstFlags::JMP, true).unwrap();
        assert_eq!(opr.kind, OprKind::Label);
        assert_eq!(opr.name, "loc_40");
    }

    #[test]
    fn test_offset_operand() {
        let (opr, _, _) = parse("offset sub_401000");
        assert_eq!(opr.kind, OprKind::Offset);
        assert_eq!(opr.lmod, LenMod::Dword);
        assert_eq!(opr.name, "sub_401000");
    }

    #[test]
    fn test_fs_rejected() {
        let db = ProtoDb::default();
        assert!(parse_operand(&db, &[], "fs:dword_1", InstFlags::empty(), true).is_err());
    }

    #[test]
    fn test_ds_stripped() {
        let (opr, _, _) = parse("ds:dword_4FE930");
        assert!(opr.had_ds);
        assert_eq!(opr.name, "dword_4FE930");
        assert_eq!(opr.lmod, LenMod::Dword);
    }

    #[test]
    fn test_label_width_from_header() {
        let db = ProtoDb::from_header("WORD speed_tab;").unwrap();
        let (opr, _, _) =
            parse_operand(&db, &[], "speed_tab", InstFlags::empty(), true).unwrap();
        assert_eq!(opr.lmod, LenMod::Word);
        assert!(opr.type_from_var);
    }

    #[test]
    fn test_size_mismatch_flags() {
        let db = ProtoDb::from_header("char small_var;").unwrap();
        let (opr, _, _) =
            parse_operand(&db, &[], "dword ptr small_var", InstFlags::empty(), true).unwrap();
        assert!(opr.size_mismatch);
        assert!(opr.size_lt);
        assert_eq!(opr.lmod, LenMod::Dword);
    }

    #[test]
    fn test_parse_stack_el() {
        let el = parse_stack_el("ebp+var_4", false, true).unwrap();
        assert_eq!(el.name, "var_4");
        assert!(el.extra_reg.is_none());

        let el = parse_stack_el("esp+0x14+var_14", false, false).unwrap();
        assert_eq!(el.name, "var_14");

        let el = parse_stack_el("eax+ebp+var_8", false, true).unwrap();
        assert_eq!(el.name, "var_8");
        assert_eq!(el.extra_reg.as_deref(), Some("eax"));

        assert!(parse_stack_el("ebp+8", false, true).is_none());
        assert!(parse_stack_el("ebx+4", false, false).is_none());
    }

    #[test]
    fn test_equ_find() {
        let equs = vec![Equate {
            name: "var_8".to_string(),
            lmod: LenMod::Dword,
            offset: -8,
        }];
        let (eq, extra) = equ_find(&equs, "var_8").unwrap();
        assert_eq!(eq.offset, -8);
        assert_eq!(extra, 0);

        let (_, extra) = equ_find(&equs, "var_8+0x4").unwrap();
        assert_eq!(extra, 4);

        assert!(equ_find(&equs, "var_unknown").is_none());
    }
}
