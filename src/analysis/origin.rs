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
use crate::analysis::calls::check_func_pp;
use crate::errors::TranslateError;
use crate::header::Proto;
use crate::ir::{Inst, InstFlags, Op, Opr, OprKind, XAX, XCX, XDX, is_last_op};

/// Is operand `opr` modified by instruction `po`?
pub fn is_opr_modified(opr: &Opr, po: &Inst) -> bool {
    if po.flags.contains(InstFlags::RMD) || !po.flags.contains(InstFlags::DATA) {
        return false;
    }

    if opr.kind == OprKind::Reg {
        if let Some(reg) = opr.reg {
            if po.op == Op::Call {
                let mask = (1 << XAX) | (1 << XCX) | (1 << XDX);
                return (1 << reg) & mask != 0;
            }
            if po.operands.first().map(|o| o.kind) == Some(OprKind::Reg) {
                return po.regmask_dst & (1 << reg) != 0;
            }
        }
    }

    po.operand_name(0) == opr.name
}

/// Is any operand of `po_test` modified by `po`?
pub fn is_any_opr_modified(po_test: &Inst, po: &Inst, c_mode: bool) -> bool {
    if po.flags.contains(InstFlags::RMD) || !po.flags.contains(InstFlags::DATA) {
        return false;
    }

    if po_test.operands.len() == 1 && po_test.operands[0].kind == OprKind::Const {
        return false;
    }

    if (po_test.regmask_src | po_test.regmask_dst) & po.regmask_dst != 0 {
        return true;
    }

    // in reality a call can wreck any register, but the decompiled C
    // version can only overwrite eax or edx:eax
    let mut mask = (1 << XAX) | (1 << XDX);
    if !c_mode {
        mask |= 1 << XCX;
    }
    if po.op == Op::Call && (po_test.regmask_src | po_test.regmask_dst) & mask != 0 {
        return true;
    }

    po_test
        .operands
        .iter()
        .any(|o| o.name == po.operand_name(0))
}

/// First instruction in [start, end) that modifies any operand of
/// `ops[test_i]`.
pub fn scan_for_mod(
    ctx: &FuncContext,
    test_i: usize,
    start: usize,
    end: usize,
    c_mode: bool,
) -> Option<usize> {
    let po_test = &ctx.ops[test_i];
    if po_test.operands.len() == 1 && po_test.operands[0].kind == OprKind::Const {
        return None;
    }
    (start..end.min(ctx.opcnt())).find(|&i| is_any_opr_modified(po_test, &ctx.ops[i], c_mode))
}

/// First instruction in [start, end) that modifies operand 0 of
/// `ops[test_i]`.
pub fn scan_for_mod_opr0(ctx: &FuncContext, test_i: usize, start: usize, end: usize) -> Option<usize> {
    let opr0 = ctx.ops[test_i].operands.first()?;
    (start..end.min(ctx.opcnt())).find(|&i| is_opr_modified(opr0, &ctx.ops[i]))
}

/// Walk backward for the single instruction that last wrote `opr`.
/// Returns 1 with `op_i` set when exactly one writer is found, -1 when
/// multiple writers or the caller are reachable, 0 on a visited path.
pub fn resolve_origin(
    ctx: &mut FuncContext,
    i: usize,
    opr: &Opr,
    magic: u32,
    op_i: &mut Option<usize>,
    is_caller: &mut bool,
) -> i32 {
    if ctx.ops[i].cc_scratch == magic {
        return 0;
    }
    ctx.ops[i].cc_scratch = magic;

    let mut i = i as isize;
    loop {
        let iu = i as usize;
        if ctx.labels[iu].is_some() {
            let refs = ctx.label_refs[iu].clone();
            let mut ret = 0;
            for r in &refs {
                ret |= resolve_origin(ctx, *r, opr, magic, op_i, is_caller);
            }
            if !refs.is_empty() && iu > 0 && is_last_op(&ctx.ops[iu - 1]) {
                return ret;
            }
        }

        i -= 1;
        if i < 0 {
            *is_caller = true;
            return -1;
        }

        let iu = i as usize;
        if ctx.ops[iu].cc_scratch == magic {
            return 0;
        }
        ctx.ops[iu].cc_scratch = magic;

        if !ctx.ops[iu].flags.contains(InstFlags::DATA) {
            continue;
        }
        if !is_opr_modified(opr, &ctx.ops[iu]) {
            continue;
        }

        if let Some(found) = *op_i {
            if found == iu {
                return 1;
            }
            return -1;
        }

        *op_i = Some(iu);
        return 1;
    }
}

/// Ride on resolve_origin to fetch a compile-time constant.
pub fn try_resolve_const(ctx: &mut FuncContext, i: usize, opr: &Opr, magic: u32) -> Option<u32> {
    let mut op_i = None;
    let mut is_caller = false;
    let ret = resolve_origin(ctx, i, opr, magic, &mut op_i, &mut is_caller);
    if ret != 1 {
        return None;
    }
    let s_i = op_i?;
    let po = &ctx.ops[s_i];
    if po.op != Op::Mov || po.operands[1].kind != OprKind::Const {
        return None;
    }
    Some(po.operands[1].val)
}

/// Recover a prototype for an indirect call operand: a host fptr argument
/// reached through the stack, a `label[index]` table, or a named fptr
/// variable.
pub fn try_recover_pp(
    ctx: &FuncContext,
    po_i: usize,
    opr: &Opr,
    search_instead: Option<&mut bool>,
) -> Result<Option<Proto>, TranslateError> {
    if opr.kind == OprKind::RegMem && ctx.is_stack_access(&ctx.ops[po_i], opr) {
        // maybe an arg of the host function
        let (offset, stack_ra, ofs_reg, _) = ctx.parse_stack_access(po_i, &opr.name, false)?;
        if ofs_reg.is_some() {
            return Err(ctx.ferr(po_i, "offset reg on arg access?"));
        }
        if offset <= stack_ra {
            // search who set the stack var instead
            if let Some(flag) = search_instead {
                *flag = true;
            }
            return Ok(None);
        }

        let arg_i = (offset - stack_ra - 4) / 4;
        let pp = ctx.func_pp()?;
        let (slot, _) = nth_stack_arg(pp, arg_i as usize)
            .ok_or_else(|| ctx.ferr(po_i, format!("stack arg {} not in prototype?", arg_i)))?;
        let fptr = pp.args[slot]
            .fptr
            .as_deref()
            .ok_or_else(|| ctx.ferr(po_i, format!("icall sa: arg{} is not a fptr?", slot + 1)))?;
        check_func_pp(ctx, po_i, fptr, "icall arg")?;
        let mut clone = fptr.clone();
        clone.name = format!("a{}", slot + 1);
        clone.is_arg = true;
        return Ok(Some(clone));
    }

    if opr.kind == OprKind::RegMem {
        // label[index]
        if let Some(b) = opr.name[1..].find('[') {
            let label = &opr.name[..b + 1];
            return Ok(ctx.protos.lookup(label).cloned());
        }
        return Ok(None);
    }

    if opr.kind == OprKind::Offset || opr.kind == OprKind::Label {
        let pp = ctx
            .protos
            .lookup(&opr.name)
            .ok_or_else(|| {
                ctx.ferr(po_i, format!("proto_parse failed for icall from '{}'", opr.name))
            })?;
        check_func_pp(ctx, po_i, pp, "reg-fptr ref")?;
        return Ok(Some(pp.clone()));
    }

    Ok(None)
}

/// The prototype-slot index and stack-slot index of the `arg_i`-th stack
/// argument.
pub fn nth_stack_arg(pp: &Proto, arg_i: usize) -> Option<(usize, usize)> {
    let mut stack_seen = 0usize;
    for (i, arg) in pp.args.iter().enumerate() {
        if arg.reg.is_some() {
            continue;
        }
        if stack_seen == arg_i {
            return Some((i, stack_seen));
        }
        stack_seen += 1;
    }
    None
}

fn protos_equivalent(a: &Proto, b: &Proto) -> bool {
    a.ret_type.name == b.ret_type.name
        && a.is_stdcall == b.is_stdcall
        && a.is_fptr == b.is_fptr
        && a.argc() == b.argc()
        && a.argc_reg == b.argc_reg
        && a.argc_stack == b.argc_stack
}

/// Follow mov/lea chains backward from an indirect call to every possible
/// origin, collecting the prototype they agree on.
pub fn scan_for_call_type(
    ctx: &mut FuncContext,
    i: usize,
    opr: &Opr,
    magic: u32,
    pp_found: &mut Option<Proto>,
    multi: &mut bool,
) -> Result<(), TranslateError> {
    ctx.ops[i].cc_scratch = magic;

    let mut opr = opr.clone();
    let mut i = i as isize;
    let mut reached_top = false;

    loop {
        let iu = i as usize;
        if ctx.labels[iu].is_some() {
            let refs = ctx.label_refs[iu].clone();
            for r in refs.iter() {
                scan_for_call_type(ctx, *r, &opr, magic, pp_found, multi)?;
            }
            if !refs.is_empty() && iu > 0 && is_last_op(&ctx.ops[iu - 1]) {
                return Ok(());
            }
        }

        i -= 1;
        if i < 0 {
            reached_top = true;
            break;
        }

        let iu = i as usize;
        if ctx.ops[iu].cc_scratch == magic {
            return Ok(());
        }
        ctx.ops[iu].cc_scratch = magic;

        if !ctx.ops[iu].flags.contains(InstFlags::DATA) {
            continue;
        }
        if !is_opr_modified(&opr, &ctx.ops[iu]) {
            continue;
        }
        if ctx.ops[iu].op != Op::Mov && ctx.ops[iu].op != Op::Lea {
            // most probably trashed by some processing
            *pp_found = None;
            return Ok(());
        }

        opr = ctx.ops[iu].operands[1].clone();
        if opr.kind != OprKind::Reg {
            break;
        }
    }

    let pp = if reached_top {
        // reached the top, can only be an arg-reg
        if opr.kind != OprKind::Reg {
            return Ok(());
        }
        let pp = ctx.func_pp()?;
        let slot = pp
            .args
            .iter()
            .position(|a| a.reg.as_deref() == Some(opr.name.as_str()));
        let slot = match slot {
            Some(s) => s,
            None => return Ok(()),
        };
        let fptr = pp.args[slot].fptr.as_deref().ok_or_else(|| {
            ctx.ferr(0, format!("icall: arg{} ({}) is not a fptr?", slot + 1, opr.name))
        })?;
        check_func_pp(ctx, 0, fptr, "icall reg-arg")?;
        let mut clone = fptr.clone();
        clone.name = format!("a{}", slot + 1);
        clone.is_arg = true;
        Some(clone)
    } else {
        try_recover_pp(ctx, i as usize, &opr, None)?
    };

    if let (Some(found), Some(new)) = (pp_found.as_ref(), pp.as_ref()) {
        if found.name != new.name || !protos_equivalent(found, new) {
            if !protos_equivalent(found, new) {
                return Err(ctx.ferr(i.max(0) as usize, "icall: parsed_proto mismatch"));
            }
            *multi = true;
        }
    }
    if pp.is_some() {
        *pp_found = pp;
    }

    Ok(())
}

/// Resolve the callee prototype of an indirect call, either directly from
/// the operand or by chasing its origins.
pub fn resolve_icall(
    ctx: &mut FuncContext,
    i: usize,
    multi_src: &mut bool,
) -> Result<Option<Proto>, TranslateError> {
    *multi_src = false;

    let opr = ctx.ops[i].operands[0].clone();
    let opcnt = ctx.opcnt();

    if matches!(opr.kind, OprKind::RegMem | OprKind::Label | OprKind::Offset) {
        let mut search_advice = false;
        let pp = try_recover_pp(ctx, i, &opr, Some(&mut search_advice))?;
        if !search_advice {
            return Ok(pp);
        }
    }

    let mut pp = None;
    scan_for_call_type(ctx, i, &opr, (i + opcnt * 9) as u32, &mut pp, multi_src)?;
    Ok(pp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::ProtoDb;
    use crate::parser::instructions::parse_op;

    fn push_op(ctx: &mut FuncContext, db: &ProtoDb, line: &str) {
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
        ctx.labels.push(None);
        ctx.label_refs.push(Vec::new());
    }

    #[test]
    fn test_resolve_origin_simple() {
        let db = ProtoDb::default();
        let mut ctx = FuncContext::new("t.asm", "f", &db, false);
        push_op(&mut ctx, &db, "mov ecx, 5");
        push_op(&mut ctx, &db, "mov eax, 1");
        push_op(&mut ctx, &db, "stosd");

        let opr = Opr::new_reg(XCX, crate::ir::LenMod::Dword);
        let val = try_resolve_const(&mut ctx, 2, &opr, 100);
        assert_eq!(val, Some(5));
    }

    #[test]
    fn test_resolve_origin_from_caller() {
        let db = ProtoDb::default();
        let mut ctx = FuncContext::new("t.asm", "f", &db, false);
        push_op(&mut ctx, &db, "mov eax, 1");
        push_op(&mut ctx, &db, "retn");

        let opr = Opr::new_reg(XCX, crate::ir::LenMod::Dword);
        let mut op_i = None;
        let mut is_caller = false;
        let ret = resolve_origin(&mut ctx, 1, &opr, 101, &mut op_i, &mut is_caller);
        assert_eq!(ret, -1);
        assert!(is_caller);
    }

    #[test]
    fn test_is_opr_modified_by_call() {
        let db = ProtoDb::from_header("int callee(void);").unwrap();
        let mut ctx = FuncContext::new("t.asm", "f", &db, false);
        push_op(&mut ctx, &db, "call callee");

        let eax = Opr::new_reg(XAX, crate::ir::LenMod::Dword);
        assert!(is_opr_modified(&eax, &ctx.ops[0]));
        let esi = Opr::new_reg(crate::ir::XSI, crate::ir::LenMod::Dword);
        assert!(!is_opr_modified(&esi, &ctx.ops[0]));
    }
}
