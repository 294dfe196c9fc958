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

use std::collections::HashMap;
use std::fmt::Write as _;

use crate::errors::TranslateError;
use crate::ir::LenMod;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CType {
    pub name: String,
    pub is_ptr: bool,
    pub is_array: bool,
    pub is_va_list: bool,
    pub is_retreg: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ProtoArg {
    pub name: String,
    // register name for register args, None for stack args
    pub reg: Option<String>,
    pub type_: CType,
    pub fptr: Option<Box<Proto>>,
    // index of the push feeding this slot, filled during arg collection
    pub push_idx: Option<usize>,
}

/// A prototype record from the header database. Consumers clone before
/// mutating; per-call state (push indices, grown arg lists) lives on the
/// clone owned by the call instruction.
#[derive(Debug, Clone, Default)]
pub struct Proto {
    pub name: String,
    pub ret_type: CType,
    pub args: Vec<ProtoArg>,
    pub argc_reg: usize,
    pub argc_stack: usize,
    pub is_func: bool,
    pub is_fptr: bool,
    pub is_stdcall: bool,
    pub is_fastcall: bool,
    pub is_vararg: bool,
    pub is_noreturn: bool,
    pub is_unresolved: bool,
    pub is_oslib: bool,
    pub is_userstack: bool,
    // proto recovered from a function-pointer argument of the host func
    pub is_arg: bool,
    pub has_structarg: bool,
    pub has_retreg: bool,
}

impl Proto {
    pub fn argc(&self) -> usize {
        self.args.len()
    }

    /// Render the prototype for diagnostics.
    pub fn print(&self) -> String {
        let mut out = String::new();
        let _ = write!(out, "{} ", self.ret_type.name);
        if self.is_fastcall {
            out.push_str("__fastcall ");
        } else if self.is_stdcall {
            out.push_str("__stdcall ");
        }
        let _ = write!(out, "{}(", self.name);
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            out.push_str(&arg.type_.name);
            if arg.type_.is_ptr {
                out.push('*');
            }
            if let Some(reg) = &arg.reg {
                let _ = write!(out, "/*<{}>*/", reg);
            }
        }
        if self.is_vararg {
            if !self.args.is_empty() {
                out.push_str(", ");
            }
            out.push_str("...");
        }
        out.push(')');
        out
    }

    /// Structural comparison used when checking fptr assignments.
    pub fn matches_func(&self, other: &Proto) -> bool {
        self.ret_type.name == other.ret_type.name
            && self.is_stdcall == other.is_stdcall
            && self.argc() == other.argc()
            && self.argc_stack == other.argc_stack
            && self
                .args
                .iter()
                .zip(other.args.iter())
                .all(|(a, b)| a.type_.name == b.type_.name)
    }
}

const DWORD_TYPES: [&str; 13] = [
    "int", "_DWORD", "UINT_PTR", "DWORD", "WPARAM", "LPARAM", "UINT", "__int32", "LONG", "HIMC",
    "BOOL", "size_t", "float",
];
const WORD_TYPES: [&str; 6] = [
    "uint16_t",
    "int16_t",
    "_WORD",
    "WORD",
    "unsigned __int16",
    "__int16",
];
const BYTE_TYPES: [&str; 10] = [
    "uint8_t",
    "int8_t",
    "char",
    "unsigned __int8",
    "__int8",
    "BYTE",
    "_BYTE",
    "CHAR",
    "_UNKNOWN",
    // structures get byte granularity, same as _UNKNOWN
    "CRITICAL_SECTION",
];

fn skip_type_mod(name: &str) -> &str {
    let mut n = name;
    loop {
        if let Some(rest) = n.strip_prefix("const ") {
            n = rest;
        } else if let Some(rest) = n.strip_prefix("struct ") {
            n = rest;
        } else {
            return n;
        }
    }
}

pub fn guess_lmod_from_c_type(c_type: &CType) -> Option<LenMod> {
    if c_type.is_ptr {
        return Some(LenMod::Dword);
    }

    let n = skip_type_mod(&c_type.name);

    if DWORD_TYPES.contains(&n) {
        return Some(LenMod::Dword);
    }
    if WORD_TYPES.contains(&n) {
        return Some(LenMod::Word);
    }
    if BYTE_TYPES.contains(&n) {
        return Some(LenMod::Byte);
    }

    None
}

/// The header prototype database. Built once from the seed header; lookups
/// hand out shared records that callers clone before mutating.
#[derive(Debug, Default)]
pub struct ProtoDb {
    protos: HashMap<String, Proto>,
}

impl ProtoDb {
    pub fn from_header(text: &str) -> Result<Self, TranslateError> {
        let mut db = ProtoDb::default();

        let mut oslib = false;
        for chunk in split_decls(text) {
            let decl = chunk.trim();
            if decl.is_empty() {
                continue;
            }
            if decl.contains("/*oslib*/") {
                oslib = true;
            }
            // struct/enum bodies and macros carry no prototype information
            if decl.contains('{') || decl.starts_with('#') || decl.starts_with("typedef") {
                continue;
            }
            let mut pp = parse_proto_decl(decl)?;
            pp.is_oslib = oslib;
            if !pp.name.is_empty() {
                db.protos.insert(pp.name.clone(), pp);
            }
        }

        Ok(db)
    }

    pub fn lookup(&self, name: &str) -> Option<&Proto> {
        self.protos.get(name)
    }
}

// Split the header into `;`-terminated declarations, with `//` comments and
// preprocessor lines dropped. `/* */` comments survive: register bindings
// ride in them.
fn split_decls(text: &str) -> Vec<String> {
    let mut cleaned = String::new();
    for line in text.lines() {
        let line = match line.find("//") {
            Some(pos) => &line[..pos],
            None => line,
        };
        if line.trim_start().starts_with('#') {
            continue;
        }
        cleaned.push_str(line);
        cleaned.push('\n');
    }

    cleaned.split(';').map(|s| s.to_string()).collect()
}

fn is_attr_word(w: &str) -> bool {
    matches!(
        w,
        "__cdecl" | "__stdcall" | "__fastcall" | "noreturn" | "__userstack" | "WINAPI" | "extern"
    )
}

/// Parse one C declaration into a prototype record. Handles plain data
/// declarations, function declarations, and function-pointer variables.
/// Also serves the inline `sctproto:` hints from the listing.
pub fn parse_proto_decl(decl: &str) -> Result<Proto, TranslateError> {
    let mut pp = Proto::default();

    let perr = |reason: String| TranslateError::ProtoError {
        name: decl.trim().to_string(),
        reason,
    };

    let decl = decl.trim();

    // function pointer variable: ret (attrs *name)(args)
    // plain function:            ret attrs name(args)
    let (head, args_part) = match find_arg_parens(decl) {
        Some((head, args)) => (head.trim(), Some(args)),
        None => (decl, None),
    };

    let mut head = head.to_string();
    // `(attrs *name)` head tail for fptr declarations
    if let Some(open) = head.rfind('(') {
        let inner = head[open + 1..].trim_end_matches(')').trim();
        let inner = apply_attr_words(&mut pp, inner);
        let inner = inner.trim();
        if let Some(nm) = inner.strip_prefix('*') {
            pp.is_fptr = true;
            pp.name = nm.trim().to_string();
            head.truncate(open);
        }
    }

    let head = apply_attr_words(&mut pp, &head);
    let mut words: Vec<&str> = head.split_whitespace().collect();

    if args_part.is_some() && !pp.is_fptr {
        pp.is_func = true;
        let name = words.pop().ok_or_else(|| perr("missing name".into()))?;
        pp.name = name.trim_start_matches('*').to_string();
        let stars = name.len() - name.trim_start_matches('*').len();
        pp.ret_type = make_ctype(&words, stars, false);
    } else if pp.is_fptr {
        pp.ret_type = make_ctype(&words, 0, false);
    } else {
        // data declaration: type words + name, optionally an array
        let name = match words.pop() {
            Some(n) => n,
            None => return Ok(pp), // empty decl between semicolons
        };
        let mut name = name.to_string();
        let mut is_array = false;
        if let Some(b) = name.find('[') {
            is_array = true;
            name.truncate(b);
        }
        let stars = name.len() - name.trim_start_matches('*').len();
        pp.name = name.trim_start_matches('*').to_string();
        pp.ret_type = make_ctype(&words, stars, is_array);
        return Ok(pp);
    }

    // argument list
    let args_part = args_part.unwrap_or_default();
    for raw_arg in split_args(&args_part) {
        let raw_arg = raw_arg.trim();
        if raw_arg.is_empty() || raw_arg == "void" {
            continue;
        }
        if raw_arg == "..." {
            pp.is_vararg = true;
            continue;
        }
        let arg = parse_arg(raw_arg).map_err(|e| perr(e))?;
        if arg.reg.is_some() {
            pp.argc_reg += 1;
        } else {
            pp.argc_stack += 1;
        }
        if arg.type_.is_retreg {
            pp.has_retreg = true;
        }
        if guess_lmod_from_c_type(&arg.type_).is_none() && arg.fptr.is_none() {
            // unknown aggregates passed by value
            pp.has_structarg = true;
        }
        pp.args.push(arg);
    }

    if pp.is_fastcall && pp.argc_reg == 0 {
        // __fastcall with no annotations: first two ints ride in ecx/edx
        for (i, reg) in ["ecx", "edx"].iter().enumerate() {
            if let Some(arg) = pp.args.get_mut(i) {
                if arg.reg.is_none() {
                    arg.reg = Some((*reg).to_string());
                    pp.argc_reg += 1;
                    pp.argc_stack -= 1;
                }
            }
        }
    }

    Ok(pp)
}

fn apply_attr_words<'a>(pp: &mut Proto, head: &'a str) -> String {
    let mut kept = Vec::new();
    for w in head.split_whitespace() {
        match w {
            "__stdcall" | "WINAPI" => pp.is_stdcall = true,
            "__fastcall" => {
                pp.is_fastcall = true;
                pp.is_stdcall = true;
            }
            "__cdecl" | "extern" => {}
            "noreturn" => pp.is_noreturn = true,
            "__userstack" => pp.is_userstack = true,
            _ => kept.push(w),
        }
    }
    kept.join(" ")
}

// The stars stay inside the type name: casts are printed straight from it.
fn make_ctype(words: &[&str], extra_stars: usize, is_array: bool) -> CType {
    let mut name = words.join(" ");
    if extra_stars > 0 {
        if !name.is_empty() {
            name.push(' ');
        }
        name.push_str(&"*".repeat(extra_stars));
    }
    if name.is_empty() {
        name = "int".to_string();
    }
    let is_ptr = name.contains('*');
    CType {
        is_va_list: name == "va_list",
        name,
        is_ptr,
        is_array,
        is_retreg: false,
    }
}

// Locate the argument-list parens of a function declaration: the first '('
// not part of a `(*name)` group.
fn find_arg_parens(decl: &str) -> Option<(&str, String)> {
    let bytes = decl.as_bytes();
    let mut depth = 0usize;
    let mut first_open = None;
    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'(' => {
                if depth == 0 && first_open.is_none() {
                    first_open = Some(i);
                }
                depth += 1;
            }
            b')' => {
                depth = depth.saturating_sub(1);
            }
            _ => {}
        }
    }
    let open = first_open?;
    // `(* ...)` first group means a function pointer; its args are in the
    // second top-level group
    let inner = decl[open + 1..].trim_start();
    if inner.starts_with('*') || inner.starts_with("__") {
        // head includes the (*name) group; args are the next group
        let close = matching_paren(decl, open)?;
        let rest = &decl[close + 1..];
        let a_open = rest.find('(')?;
        let a_close = matching_paren(rest, a_open)?;
        return Some((
            &decl[..close + 1],
            rest[a_open + 1..a_close].to_string(),
        ));
    }
    let close = matching_paren(decl, open)?;
    Some((&decl[..open], decl[open + 1..close].to_string()))
}

fn matching_paren(s: &str, open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (i, b) in s.bytes().enumerate().skip(open) {
        match b {
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

// Split an argument list at top-level commas.
fn split_args(args: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut cur = String::new();
    for c in args.chars() {
        match c {
            '(' => {
                depth += 1;
                cur.push(c);
            }
            ')' => {
                depth = depth.saturating_sub(1);
                cur.push(c);
            }
            ',' if depth == 0 => {
                out.push(std::mem::take(&mut cur));
            }
            _ => cur.push(c),
        }
    }
    if !cur.trim().is_empty() {
        out.push(cur);
    }
    out
}

fn parse_arg(raw: &str) -> Result<ProtoArg, String> {
    let mut arg = ProtoArg::default();

    // register binding rides in a trailing comment: /*<ecx>*/ or /*<ecx:ret>*/
    let mut text = raw.to_string();
    if let Some(start) = text.find("/*<") {
        let end = text[start..]
            .find(">*/")
            .ok_or_else(|| format!("bad register annotation in '{}'", raw))?;
        let ann = text[start + 3..start + end].to_string();
        text.replace_range(start..start + end + 3, "");
        let (reg, ret) = match ann.strip_suffix(":ret") {
            Some(r) => (r, true),
            None => (ann.as_str(), false),
        };
        arg.reg = Some(reg.to_string());
        arg.type_.is_retreg = ret;
    }

    // nested function pointer argument
    if text.contains("(*") || text.contains("( *") {
        let fptr_pp = parse_proto_decl(text.trim()).map_err(|e| e.to_string())?;
        arg.name = fptr_pp.name.clone();
        arg.type_ = CType {
            name: "void".to_string(),
            is_ptr: true,
            ..Default::default()
        };
        arg.fptr = Some(Box::new(fptr_pp));
        return Ok(arg);
    }

    let mut words: Vec<&str> = text.split_whitespace().collect();
    words.retain(|w| !is_attr_word(w));
    if words.is_empty() {
        return Err(format!("empty argument in '{}'", raw));
    }
    // a lone type word has no name; multiple words end with the name unless
    // the last word is itself a known type keyword
    let mut name = String::new();
    if words.len() > 1 {
        let last = *words.last().ok_or("empty argument")?;
        let bare = last.trim_start_matches('*');
        let probe = CType {
            name: bare.to_string(),
            ..Default::default()
        };
        if guess_lmod_from_c_type(&probe).is_none() && bare != "void" {
            name = last.to_string();
            words.pop();
        }
    }
    let mut is_array = false;
    if let Some(b) = name.find('[') {
        is_array = true;
        name.truncate(b);
    }
    let stars = name.len() - name.trim_start_matches('*').len();
    arg.name = name.trim_start_matches('*').to_string();
    let mut ty = make_ctype(&words, stars, is_array);
    ty.is_retreg = arg.type_.is_retreg;
    arg.type_ = ty;
    Ok(arg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_func() {
        let pp = parse_proto_decl("int f(int a1, int a2)").unwrap();
        assert_eq!(pp.name, "f");
        assert!(pp.is_func);
        assert_eq!(pp.argc(), 2);
        assert_eq!(pp.argc_stack, 2);
        assert_eq!(pp.ret_type.name, "int");
    }

    #[test]
    fn test_stdcall_void() {
        let pp = parse_proto_decl("void __stdcall g(int x)").unwrap();
        assert!(pp.is_stdcall);
        assert_eq!(pp.ret_type.name, "void");
        assert_eq!(pp.argc_stack, 1);
    }

    #[test]
    fn test_fastcall_regs() {
        let pp = parse_proto_decl("int __fastcall h(int a1, int a2, int a3)").unwrap();
        assert!(pp.is_fastcall);
        assert_eq!(pp.argc_reg, 2);
        assert_eq!(pp.argc_stack, 1);
        assert_eq!(pp.args[0].reg.as_deref(), Some("ecx"));
        assert_eq!(pp.args[1].reg.as_deref(), Some("edx"));
    }

    #[test]
    fn test_reg_annotation() {
        let pp = parse_proto_decl("int usef(int a1/*<ecx>*/, int a2)").unwrap();
        assert_eq!(pp.args[0].reg.as_deref(), Some("ecx"));
        assert_eq!(pp.argc_reg, 1);
        assert_eq!(pp.argc_stack, 1);
    }

    #[test]
    fn test_data_decl() {
        let pp = parse_proto_decl("char name_buf[64]").unwrap();
        assert!(!pp.is_func);
        assert!(pp.ret_type.is_array);
        assert_eq!(pp.ret_type.name, "char");
    }

    #[test]
    fn test_ptr_var() {
        let pp = parse_proto_decl("char *msg_ptr").unwrap();
        assert!(pp.ret_type.is_ptr);
        assert_eq!(pp.ret_type.name, "char *");
    }

    #[test]
    fn test_fptr_var() {
        let pp = parse_proto_decl("int (*handler_fn)(int, int)").unwrap();
        assert!(pp.is_fptr);
        assert_eq!(pp.name, "handler_fn");
        assert_eq!(pp.argc(), 2);
    }

    #[test]
    fn test_vararg() {
        let pp = parse_proto_decl("int my_printf(const char *fmt, ...)").unwrap();
        assert!(pp.is_vararg);
        assert_eq!(pp.argc(), 1);
        assert!(pp.args[0].type_.is_ptr);
    }

    #[test]
    fn test_noreturn() {
        let pp = parse_proto_decl("noreturn void fatal_exit(int code)").unwrap();
        assert!(pp.is_noreturn);
    }

    #[test]
    fn test_db_lookup() {
        let db = ProtoDb::from_header("int f(int a);\nchar tab[16];\n// junk\n#define X 1\n")
            .unwrap();
        assert!(db.lookup("f").is_some());
        assert!(db.lookup("tab").is_some());
        assert!(db.lookup("missing").is_none());
    }

    #[test]
    fn test_width_table() {
        let t = |n: &str| {
            guess_lmod_from_c_type(&CType {
                name: n.to_string(),
                ..Default::default()
            })
        };
        assert_eq!(t("int"), Some(LenMod::Dword));
        assert_eq!(t("WORD"), Some(LenMod::Word));
        assert_eq!(t("char"), Some(LenMod::Byte));
        assert_eq!(t("_UNKNOWN"), Some(LenMod::Byte));
        assert_eq!(t("SOME_STRUCT"), None);
    }
}
