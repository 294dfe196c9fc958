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

use crate::analysis::FuncContext;
use crate::errors::TranslateError;
use crate::header::parse_proto_decl;
use crate::ir::{InstFlags, Op, OprKind, XCX, XDX, XSP, is_last_op};

/// pass2: resolve calls with labels, all branches, and jumptables;
/// reclassify unresolvable jumps as tail calls.
pub fn resolve_branches(ctx: &mut FuncContext) -> Result<(), TranslateError> {
    let opcnt = ctx.opcnt();

    let mut i = 0;
    while i < opcnt {
        ctx.ops[i].bt_i = None;
        ctx.ops[i].btj = None;

        if ctx.ops[i].flags.contains(InstFlags::RMD) {
            i += 1;
            continue;
        }

        if ctx.ops[i].op == Op::Call {
            let mut pp = None;

            if ctx.ops[i].operands[0].kind == OprKind::Label {
                let name = ctx.ops[i].operands[0].name.clone();
                if name.starts_with("loc_") {
                    return Err(ctx.ferr(i, "call to loc_*"));
                }
                let pp_c = ctx
                    .protos
                    .lookup(&name)
                    .ok_or_else(|| ctx.ferr(i, format!("proto_parse failed for call '{}'", name)))?;
                pp = Some(pp_c.clone());
            } else if let Some(hint) = ctx.ops[i].proto_hint.take() {
                let parsed = parse_proto_decl(&hint)
                    .map_err(|_| ctx.ferr(i, format!("bad protostr supplied: {}", hint)))?;
                pp = Some(parsed);
            }

            if let Some(pp) = &pp {
                if pp.is_fptr {
                    calls_check(ctx, i, pp)?;
                }
                if pp.is_noreturn {
                    ctx.ops[i].flags.insert(InstFlags::TAIL);
                }
            }
            ctx.ops[i].pp = pp;
            i += 1;
            continue;
        }

        if !ctx.ops[i].flags.contains(InstFlags::JMP) || ctx.ops[i].op == Op::Ret {
            i += 1;
            continue;
        }

        if ctx.ops[i].operands[0].kind == OprKind::RegMem {
            match try_resolve_jumptab(ctx, i)? {
                Some(pd) => {
                    ctx.ops[i].btj = Some(pd);
                    i += 1;
                    continue;
                }
                None => {
                    make_tailcall(ctx, i);
                    continue; // reprocess as a call
                }
            }
        }

        let target = ctx.ops[i].operands[0].name.clone();
        let mut resolved = false;
        for l in 0..opcnt {
            if ctx.labels[l].as_deref() == Some(target.as_str()) {
                if l == i + 1 && ctx.ops[i].op == Op::Jmp {
                    // yet another alignment type
                    ctx.ops[i].flags.insert(InstFlags::RMD);
                } else {
                    ctx.add_label_ref(l, i);
                    ctx.ops[i].bt_i = Some(l);
                }
                resolved = true;
                break;
            }
        }

        if resolved {
            i += 1;
            continue;
        }

        if ctx.ops[i].operands[0].kind == OprKind::Label {
            // assume tail call
            make_tailcall(ctx, i);
            continue;
        }

        return Err(ctx.ferr(i, "unhandled branch"));
    }

    Ok(())
}

fn make_tailcall(ctx: &mut FuncContext, i: usize) {
    ctx.ops[i].op = Op::Call;
    ctx.ops[i].flags.insert(InstFlags::TAIL);
    if i > 0 && ctx.ops[i - 1].op == Op::Pop {
        ctx.ops[i].flags.insert(InstFlags::ATAIL);
    }
}

fn calls_check(
    ctx: &FuncContext,
    i: usize,
    pp: &crate::header::Proto,
) -> Result<(), TranslateError> {
    crate::analysis::calls::check_func_pp(ctx, i, pp, "fptr var call")
}

/// Jump-table recovery: split the bare label out of `jmp [tab+reg*4]`,
/// find the matching data block, and link every element to its label.
pub fn try_resolve_jumptab(
    ctx: &mut FuncContext,
    i: usize,
) -> Result<Option<usize>, TranslateError> {
    let opcnt = ctx.opcnt();

    let name = ctx.ops[i].operands[0].name.clone();
    let label = match name.find('[') {
        Some(p) => name[..p].to_string(),
        None => return Ok(None),
    };

    let pd_i = match ctx.func_pd.iter().position(|pd| pd.label == label) {
        Some(p) => p,
        None => return Ok(None),
    };

    if ctx.func_pd[pd_i].kind != OprKind::Offset {
        return Err(ctx.ferr(i, format!("label '{}' with non-offset data?", label)));
    }

    // find all the labels, link them
    for j in 0..ctx.func_pd[pd_i].items.len() {
        let target = match &ctx.func_pd[pd_i].items[j].val {
            crate::ir::DataVal::Label(l) => l.clone(),
            crate::ir::DataVal::Num(_) => continue,
        };
        for l in 0..opcnt {
            if ctx.labels[l].as_deref() == Some(target.as_str()) {
                ctx.add_label_ref(l, i);
                ctx.func_pd[pd_i].items[j].bt_i = Some(l);
                break;
            }
        }
    }

    Ok(Some(pd_i))
}

/// Recursive forward scan for the pop matching a register push. Returns 1
/// when every path reaches the pop, -1 on a dead end, 0 otherwise.
pub fn scan_for_pop(
    ctx: &mut FuncContext,
    mut i: usize,
    reg: &str,
    magic: u32,
    mut depth: i32,
    maxdepth: &mut i32,
    do_flags: bool,
) -> Result<i32, TranslateError> {
    let opcnt = ctx.opcnt();
    let mut ret = 0;

    while i < opcnt {
        if ctx.ops[i].cc_scratch == magic {
            break; // already checked
        }
        ctx.ops[i].cc_scratch = magic;

        if ctx.ops[i].flags.contains(InstFlags::TAIL) {
            if ctx.ops[i].op == Op::Call {
                let name = ctx.ops[i].operand_name(0).to_string();
                if let Some(pp) = ctx.protos.lookup(&name) {
                    if pp.is_noreturn {
                        // no stack cleanup for noreturn
                        return Ok(ret);
                    }
                }
            }
            return Ok(-1); // dead end
        }

        if ctx.ops[i].flags.contains(InstFlags::RMD)
            || (ctx.ops[i].op == Op::Push && ctx.ops[i].p_argnum != 0)
        {
            i += 1;
            continue;
        }

        if ctx.ops[i].flags.contains(InstFlags::JMP) && ctx.ops[i].op != Op::Call {
            if let Some(btj) = ctx.ops[i].btj {
                // jumptable
                for j in 0..ctx.func_pd[btj].items.len() {
                    let bt_i = ctx.func_pd[btj].items[j]
                        .bt_i
                        .ok_or_else(|| ctx.ferr(i, "dead branch"))?;
                    ret |= scan_for_pop(ctx, bt_i, reg, magic, depth, maxdepth, do_flags)?;
                    if ret < 0 {
                        return Ok(ret); // dead end
                    }
                }
                return Ok(ret);
            }

            let bt_i = ctx.ops[i]
                .bt_i
                .ok_or_else(|| ctx.ferr(i, "dead branch"))?;

            if ctx.ops[i].flags.contains(InstFlags::CJMP) {
                ret |= scan_for_pop(ctx, bt_i, reg, magic, depth, maxdepth, do_flags)?;
                if ret < 0 {
                    return Ok(ret); // dead end
                }
                i += 1;
            } else {
                i = bt_i;
            }
            continue;
        }

        if (ctx.ops[i].op == Op::Pop || ctx.ops[i].op == Op::Push)
            && ctx.ops[i].operands[0].kind == OprKind::Reg
            && ctx.ops[i].operands[0].name == reg
        {
            if ctx.ops[i].op == Op::Push && !ctx.ops[i].flags.contains(InstFlags::FARG) {
                depth += 1;
                if depth > *maxdepth {
                    *maxdepth = depth;
                }
                if do_flags {
                    ctx.ops[i].flags.insert(InstFlags::RSAVE);
                    ctx.ops[i].flags.remove(InstFlags::RMD);
                }
            } else if ctx.ops[i].op == Op::Pop {
                if depth == 0 {
                    if do_flags {
                        ctx.ops[i].flags.insert(InstFlags::RMD);
                        ctx.ops[i].flags.remove(InstFlags::RSAVE);
                    }
                    return Ok(1);
                }
                depth -= 1;
                if depth < 0 {
                    // should not happen
                    return Err(ctx.ferr(i, "fail with depth"));
                }
                if do_flags {
                    ctx.ops[i].flags.insert(InstFlags::RSAVE);
                    ctx.ops[i].flags.remove(InstFlags::RMD);
                }
            }
        }

        i += 1;
    }

    Ok(ret)
}

/// Scan for a pop of `reg` just before each return. Returns 0 if every
/// return has one, -1 otherwise.
pub fn scan_for_pop_ret(ctx: &mut FuncContext, i: usize, reg: &str, flag_set: InstFlags) -> i32 {
    let opcnt = ctx.opcnt();
    let mut found = false;

    for i in i..opcnt {
        if !ctx.ops[i].flags.contains(InstFlags::TAIL) {
            continue;
        }

        let mut j = i as isize - 1;
        loop {
            if j < 0 {
                return -1;
            }
            let ju = j as usize;
            if ctx.ops[ju].flags.contains(InstFlags::RMD) {
                j -= 1;
                continue;
            }
            if ctx.ops[ju].flags.contains(InstFlags::JMP) {
                return -1;
            }
            if ctx.ops[ju].op == Op::Pop
                && ctx.ops[ju].operands[0].kind == OprKind::Reg
                && ctx.ops[ju].operands[0].name == reg
            {
                found = true;
                ctx.ops[ju].flags.insert(flag_set);
                break;
            }
            if ctx.labels[ju].is_some() {
                return -1;
            }
            j -= 1;
        }
    }

    if found { 0 } else { -1 }
}

/// Forward DF propagation from an `std`, stopping at the clearing `cld`.
pub fn scan_propagate_df(ctx: &mut FuncContext, mut i: usize) -> Result<(), TranslateError> {
    let opcnt = ctx.opcnt();

    while i < opcnt {
        if ctx.ops[i].flags.contains(InstFlags::DF) {
            return Ok(()); // already resolved
        }
        ctx.ops[i].flags.insert(InstFlags::DF);

        if ctx.ops[i].op == Op::Call {
            return Err(ctx.ferr(i, "call with DF set?"));
        }

        if ctx.ops[i].flags.contains(InstFlags::JMP) {
            if let Some(btj) = ctx.ops[i].btj {
                // jumptable
                for j in 0..ctx.func_pd[btj].items.len() {
                    if let Some(bt_i) = ctx.func_pd[btj].items[j].bt_i {
                        scan_propagate_df(ctx, bt_i)?;
                    }
                }
                return Ok(());
            }

            let bt_i = ctx.ops[i]
                .bt_i
                .ok_or_else(|| ctx.ferr(i, "dead branch"))?;
            if ctx.ops[i].flags.contains(InstFlags::CJMP) {
                scan_propagate_df(ctx, bt_i)?;
                i += 1;
            } else {
                i = bt_i;
            }
            continue;
        }

        if ctx.ops[i].flags.contains(InstFlags::TAIL) {
            break;
        }

        if ctx.ops[i].op == Op::Cld {
            ctx.ops[i].flags.insert(InstFlags::RMD);
            return Ok(());
        }

        i += 1;
    }

    Err(ctx.ferr(i.min(opcnt - 1), "missing DF clear?"))
}

/// Forward walk ORing `flags` into every reachable instruction.
pub fn scan_fwd_set_flags(ctx: &mut FuncContext, mut i: usize, magic: u32, flags: InstFlags) {
    let opcnt = ctx.opcnt();

    while i < opcnt {
        if ctx.ops[i].cc_scratch == magic {
            return;
        }
        ctx.ops[i].cc_scratch = magic;
        ctx.ops[i].flags.insert(flags);

        if ctx.ops[i].flags.contains(InstFlags::JMP) && ctx.ops[i].op != Op::Call {
            if let Some(btj) = ctx.ops[i].btj {
                // jumptable
                for j in 0..ctx.func_pd[btj].items.len() {
                    if let Some(bt_i) = ctx.func_pd[btj].items[j].bt_i {
                        scan_fwd_set_flags(ctx, bt_i, magic, flags);
                    }
                }
                return;
            }

            if let Some(bt_i) = ctx.ops[i].bt_i {
                scan_fwd_set_flags(ctx, bt_i, magic, flags);
            }
            if !ctx.ops[i].flags.contains(InstFlags::CJMP) {
                return;
            }
        }
        if ctx.ops[i].flags.contains(InstFlags::TAIL) {
            return;
        }

        i += 1;
    }
}

/// Backward scan locating every flag setter feeding the CC op at `i`.
pub fn scan_for_flag_set(
    ctx: &mut FuncContext,
    mut i: isize,
    magic: u32,
    branched: &mut bool,
    setters: &mut Vec<usize>,
) -> Result<i32, TranslateError> {
    while i >= 0 {
        let iu = i as usize;
        if ctx.ops[iu].cc_scratch == magic {
            return Err(ctx.ferr(iu, "flag setter scan looped"));
        }
        ctx.ops[iu].cc_scratch = magic;

        if ctx.labels[iu].is_some() {
            *branched = true;

            let refs = ctx.label_refs[iu].clone();
            if let Some((&last, rest)) = refs.split_last() {
                for &r in rest {
                    let ret = scan_for_flag_set(ctx, r as isize, magic, branched, setters)?;
                    if ret < 0 {
                        return Ok(ret);
                    }
                }
                if iu > 0 && is_last_op(&ctx.ops[iu - 1]) {
                    i = last as isize;
                    continue;
                }
                let ret = scan_for_flag_set(ctx, last as isize, magic, branched, setters)?;
                if ret < 0 {
                    return Ok(ret);
                }
            }
        }
        i -= 1;
        if i < 0 {
            break;
        }

        let iu = i as usize;
        if ctx.ops[iu].flags.contains(InstFlags::FLAGS) {
            setters.push(iu);
            return Ok(0);
        }

        if ctx.ops[iu].flags & (InstFlags::JMP | InstFlags::CJMP) == InstFlags::JMP {
            return Ok(-1);
        }
    }

    Ok(-1)
}

/// Backward scan for a cdq whose edx value survives to `i`.
pub fn scan_for_cdq_edx(ctx: &FuncContext, i: usize) -> Option<usize> {
    let mut i = i as isize;
    while i >= 0 {
        let iu = i as usize;
        if ctx.labels[iu].is_some() {
            if ctx.label_refs[iu].len() != 1 {
                return None;
            }
            if iu > 0 && is_last_op(&ctx.ops[iu - 1]) {
                i = ctx.label_refs[iu][0] as isize;
                continue;
            }
            return None;
        }
        i -= 1;
        if i < 0 {
            break;
        }

        let iu = i as usize;
        if ctx.ops[iu].op == Op::Cdq {
            return Some(iu);
        }
        if ctx.ops[iu].regmask_dst & (1 << XDX) != 0 {
            return None;
        }
    }
    None
}

/// Backward scan for `xor reg,reg` with no later write to `reg`.
pub fn scan_for_reg_clear(ctx: &FuncContext, i: usize, reg: usize) -> Option<usize> {
    let mut i = i as isize;
    while i >= 0 {
        let iu = i as usize;
        if ctx.labels[iu].is_some() {
            if ctx.label_refs[iu].len() != 1 {
                return None;
            }
            if iu > 0 && is_last_op(&ctx.ops[iu - 1]) {
                i = ctx.label_refs[iu][0] as isize;
                continue;
            }
            return None;
        }
        i -= 1;
        if i < 0 {
            break;
        }

        let iu = i as usize;
        let po = &ctx.ops[iu];
        if po.op == Op::Xor
            && po.operands[0].lmod == crate::ir::LenMod::Dword
            && po.operands[0].reg == po.operands[1].reg
            && po.operands[0].reg == Some(reg)
        {
            return Some(iu);
        }
        if po.regmask_dst & (1 << reg) != 0 {
            return None;
        }
    }
    None
}

/// Forward scan for a positive, constant esp adjust. Returns the adjusting
/// instruction, the byte count, and whether multiple paths join in between.
pub fn scan_for_esp_adjust(
    ctx: &FuncContext,
    mut i: usize,
) -> Result<(Option<usize>, i32, bool), TranslateError> {
    let opcnt = ctx.opcnt();
    let mut adj = 0i32;
    let mut multipath = false;
    let mut first_pop: Option<usize> = None;

    while i < opcnt {
        let po = &ctx.ops[i];

        if ctx.labels[i].is_some() {
            multipath = true;
        }

        if po.op == Op::Add && po.operands[0].reg == Some(XSP) {
            if po.operands[1].kind != OprKind::Const {
                return Err(ctx.ferr(i, "non-const esp adjust?"));
            }
            adj += po.operands[1].val as i32;
            if adj & 3 != 0 {
                return Err(ctx.ferr(i, format!("unaligned esp adjust: {:x}", adj)));
            }
            return Ok((Some(i), adj, multipath));
        } else if po.op == Op::Push && !po.flags.contains(InstFlags::RMD) {
            let bytes = po.operands[0]
                .lmod
                .bytes()
                .ok_or_else(|| ctx.ferr(i, "invalid lmod"))? as i32;
            adj -= bytes;
        } else if po.op == Op::Pop && !po.flags.contains(InstFlags::RMD) {
            // msvc seems to use 'pop ecx' only, for stack realignment
            if po.operands[0].kind != OprKind::Reg || po.operands[0].reg != Some(XCX) {
                break;
            }
            if first_pop.is_none() && adj >= 0 {
                first_pop = Some(i);
            }
            let bytes = po.operands[0]
                .lmod
                .bytes()
                .ok_or_else(|| ctx.ferr(i, "invalid lmod"))? as i32;
            adj += bytes;
        } else if po.flags.intersects(InstFlags::JMP | InstFlags::TAIL) {
            if po.op == Op::Jmp && po.btj.is_none() {
                match po.bt_i {
                    Some(bt) => {
                        i = bt;
                        continue;
                    }
                    None => break,
                }
            }
            if po.op != Op::Call {
                break;
            }
            if po.operands[0].kind != OprKind::Label {
                break;
            }
            if po.pp.as_ref().map(|pp| pp.is_stdcall).unwrap_or(false) {
                break;
            }
        }

        i += 1;
    }

    if let Some(fp) = first_pop {
        // probably 'pop ecx' was used
        return Ok((Some(fp), adj, multipath));
    }

    Ok((None, adj, multipath))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::ProtoDb;
    use crate::parser::instructions::parse_op;

    fn push_op(ctx: &mut FuncContext, db: &ProtoDb, line: &str, label: Option<&str>) {
        let mut parts = line.splitn(2, ' ');
        let mnem = parts.next().unwrap_or("");
        let rest = parts.next().unwrap_or("");
        let operands: Vec<String> = if rest.is_empty() {
            vec![]
        } else {
            rest.split(',').map(|s| s.trim().to_string()).collect()
        };
        let po = parse_op(db, &[], None, mnem, &operands, true, ctx.ops.len() + 1).unwrap();
        ctx.ops.push(po);
        ctx.labels.push(label.map(|s| s.to_string()));
        ctx.label_refs.push(Vec::new());
    }

    #[test]
    fn test_branch_resolution() {
        let db = ProtoDb::default();
        let mut ctx = FuncContext::new("t.asm", "f", &db, false);
        push_op(&mut ctx, &db, "xor eax, eax", None);
        push_op(&mut ctx, &db, "inc eax", Some("loop_top"));
        push_op(&mut ctx, &db, "cmp eax, 5", None);
        push_op(&mut ctx, &db, "jl loop_top", None);
        push_op(&mut ctx, &db, "retn", None);
        resolve_branches(&mut ctx).unwrap();
        assert_eq!(ctx.ops[3].bt_i, Some(1));
        assert_eq!(ctx.label_refs[1], vec![3]);
    }

    #[test]
    fn test_jmp_to_next_removed() {
        let db = ProtoDb::default();
        let mut ctx = FuncContext::new("t.asm", "f", &db, false);
        push_op(&mut ctx, &db, "jmp skip", None);
        push_op(&mut ctx, &db, "mov eax, 1", Some("skip"));
        push_op(&mut ctx, &db, "retn", None);
        resolve_branches(&mut ctx).unwrap();
        assert!(ctx.ops[0].flags.contains(InstFlags::RMD));
        assert!(ctx.label_refs[1].is_empty());
    }

    #[test]
    fn test_unknown_jmp_becomes_tailcall() {
        let db = ProtoDb::from_header("void other_func(void);").unwrap();
        let mut ctx = FuncContext::new("t.asm", "f", &db, false);
        push_op(&mut ctx, &db, "jmp other_func", None);
        resolve_branches(&mut ctx).unwrap();
        assert_eq!(ctx.ops[0].op, Op::Call);
        assert!(ctx.ops[0].flags.contains(InstFlags::TAIL));
        assert!(ctx.ops[0].pp.is_some());
    }

    #[test]
    fn test_scan_for_pop_pair() {
        let db = ProtoDb::default();
        let mut ctx = FuncContext::new("t.asm", "f", &db, false);
        push_op(&mut ctx, &db, "push esi", None);
        push_op(&mut ctx, &db, "mov esi, ecx", None);
        push_op(&mut ctx, &db, "pop esi", None);
        push_op(&mut ctx, &db, "retn", None);
        let mut depth = 0;
        let ret = scan_for_pop(&mut ctx, 1, "esi", 1, 0, &mut depth, false).unwrap();
        assert_eq!(ret, 1);
    }

    #[test]
    fn test_scan_for_esp_adjust() {
        let db = ProtoDb::default();
        let mut ctx = FuncContext::new("t.asm", "f", &db, false);
        push_op(&mut ctx, &db, "add esp, 8", None);
        let (idx, adj, multipath) = scan_for_esp_adjust(&ctx, 0).unwrap();
        assert_eq!(idx, Some(0));
        assert_eq!(adj, 8);
        assert!(!multipath);
    }

    #[test]
    fn test_scan_for_cdq() {
        let db = ProtoDb::default();
        let mut ctx = FuncContext::new("t.asm", "f", &db, false);
        push_op(&mut ctx, &db, "cdq", None);
        push_op(&mut ctx, &db, "idiv ecx", None);
        assert_eq!(scan_for_cdq_edx(&ctx, 1), Some(0));
    }

    #[test]
    fn test_scan_for_reg_clear() {
        let db = ProtoDb::default();
        let mut ctx = FuncContext::new("t.asm", "f", &db, false);
        push_op(&mut ctx, &db, "xor edx, edx", None);
        push_op(&mut ctx, &db, "div ecx", None);
        assert_eq!(scan_for_reg_clear(&ctx, 1, XDX), Some(0));
    }
}
