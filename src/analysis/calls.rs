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

use crate::analysis::{FuncAnalysis, FuncContext, MAX_ARG_GRP, flow, origin};
use crate::codegen::stack::stack_frame_access;
use crate::errors::TranslateError;
use crate::header::{CType, Proto, ProtoArg, guess_lmod_from_c_type};
use crate::ir::{InstFlags, LenMod, Op, OprKind};

fn int_arg() -> ProtoArg {
    ProtoArg {
        type_: CType {
            name: "int".to_string(),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Sanity-check a prototype reached through an indirect reference.
pub fn check_func_pp(
    ctx: &FuncContext,
    po_i: usize,
    pp: &Proto,
    pfx: &str,
) -> Result<(), TranslateError> {
    if pp.argc_reg != 0 {
        if !pp.is_fastcall {
            return Err(ctx.ferr(
                po_i,
                format!("{}: unexpected reg arg in icall: {}", pfx, pp.print()),
            ));
        }
        if pp.argc_stack > 0 && pp.argc_reg != 2 {
            return Err(ctx.ferr(
                po_i,
                format!(
                    "{}: {} reg arg(s) with {} stack arg(s)",
                    pfx, pp.argc_reg, pp.argc_stack
                ),
            ));
        }
    }

    // fptrs must use 32bit args; a callsite without a cast to a smaller
    // type would pass incorrectly masked args
    if !pp.is_oslib {
        for (i, arg) in pp.args.iter().enumerate() {
            if let Some(lmod) = guess_lmod_from_c_type(&arg.type_) {
                if lmod != LenMod::Dword {
                    return Err(ctx.ferr(
                        po_i,
                        format!("reference to {} with arg{} '{}'", pp.name, i + 1, arg.type_.name),
                    ));
                }
            }
        }
    }

    Ok(())
}

/// Insert a register argument ahead of the stack arguments.
pub fn pp_insert_reg_arg(pp: &mut Proto, reg: &str) {
    let pos = pp
        .args
        .iter()
        .position(|a| a.reg.is_none())
        .unwrap_or(pp.args.len());
    let mut arg = int_arg();
    arg.reg = Some(reg.to_string());
    pp.args.insert(pos, arg);
    pp.argc_reg += 1;
}

/// pass3: drop dead labels, resolve indirect calls, consume esp adjusts,
/// and collect arguments for every resolved call.
pub fn process_calls(ctx: &mut FuncContext, an: &mut FuncAnalysis) -> Result<(), TranslateError> {
    let opcnt = ctx.opcnt();

    for i in 0..opcnt {
        if ctx.labels[i].is_some() && ctx.label_refs[i].is_empty() {
            ctx.labels[i] = None;
        }

        if ctx.ops[i].flags.contains(InstFlags::RMD) {
            continue;
        }
        if ctx.ops[i].op != Op::Call {
            continue;
        }

        let tmpname = ctx.ops[i].operand_name(0).to_string();
        let mut pp = ctx.ops[i].pp.take();

        if pp.is_none() {
            // indirect call
            let mut multi = false;
            if let Some(pp_c) = origin::resolve_icall(ctx, i, &mut multi)? {
                if !pp_c.is_func && !pp_c.is_fptr {
                    return Err(ctx.ferr(i, format!("call to non-func: {}", pp_c.name)));
                }
                let mut clone = pp_c;
                if multi {
                    // not resolved to just a single func
                    clone.is_fptr = true;
                }

                match ctx.ops[i].operands[0].kind {
                    OprKind::Reg => {
                        // the call is resolved so the register is no
                        // longer needed
                        if let Some(r) = ctx.ops[i].operands[0].reg {
                            ctx.ops[i].regmask_src &= !(1 << r);
                        }
                    }
                    OprKind::RegMem => {
                        clone.is_fptr = true;
                    }
                    _ => {}
                }
                pp = Some(clone);
            }

            if pp.is_none() {
                let mut synth = Proto {
                    is_fptr: true,
                    ..Default::default()
                };
                let (adj_i, mut adj, _) = flow::scan_for_esp_adjust(ctx, i + 1)?;
                if adj_i.is_none() {
                    if !ctx.allow_regfunc {
                        return Err(ctx.ferr(i, "non-__cdecl indirect call unhandled yet"));
                    }
                    synth.is_unresolved = true;
                    adj = 0;
                }
                let argc = (adj / 4) as usize;
                if argc > 32 {
                    return Err(ctx.ferr(i, format!("esp adjust too large: {}", argc)));
                }
                synth.ret_type = CType {
                    name: "int".to_string(),
                    ..Default::default()
                };
                for _ in 0..argc {
                    synth.args.push(int_arg());
                }
                synth.argc_stack = argc;
                pp = Some(synth);
            }
        }

        let mut pp = pp.ok_or_else(|| ctx.ferr(i, "NULL pp"))?;

        // look for and make use of the esp adjust
        let mut adjust = None;
        if !pp.is_stdcall && pp.argc_stack > 0 {
            adjust = match flow::scan_for_esp_adjust(ctx, i + 1)? {
                (Some(adj_i), adj, multipath) => Some((adj_i, adj, multipath)),
                (None, _, _) => None,
            };
        }
        match adjust {
            Some((adj_i, adj, multipath)) => {
                if pp.is_vararg {
                    if (adj / 4) < pp.argc_stack as i32 {
                        return Err(ctx.ferr(
                            i,
                            format!("esp adjust is too small: {:x} < {:x}", adj, pp.argc_stack * 4),
                        ));
                    }
                    // make the prototype carry the varargs as normal args
                    let grow = adj as usize / 4 - pp.argc_stack;
                    for _ in 0..grow {
                        pp.args.push(int_arg());
                        pp.argc_stack += 1;
                    }
                    if pp.argc() > 32 {
                        return Err(ctx.ferr(i, format!("too many args for '{}'", tmpname)));
                    }
                }
                if pp.argc_stack != adj as usize / 4 {
                    return Err(ctx.ferr(
                        i,
                        format!(
                            "stack tracking failed for '{}': {:x} {:x}",
                            tmpname,
                            pp.argc_stack * 4,
                            adj
                        ),
                    ));
                }

                ctx.ops[adj_i].flags.insert(InstFlags::RMD);
                if ctx.ops[adj_i].op == Op::Pop && adj > 4 {
                    // multi-pop stack adjust
                    let mut left = pp.argc_stack;
                    let mut k = adj_i;
                    while k < opcnt && ctx.ops[k].op == Op::Pop && left > 0 {
                        ctx.ops[k].flags.insert(InstFlags::RMD);
                        left -= 1;
                        k += 1;
                    }
                } else if !multipath && ctx.ops[adj_i].op == Op::Add {
                    // single adjust shared by multiple calls
                    ctx.ops[adj_i].operands[1].val =
                        ctx.ops[adj_i].operands[1].val.wrapping_sub(adj as u32);
                }
            }
            None => {
                if pp.is_vararg {
                    return Err(
                        ctx.ferr(i, format!("missing esp_adjust for vararg func '{}'", pp.name))
                    );
                }
            }
        }

        let unresolved = pp.is_unresolved;
        if pp.ret_type.name.contains("int64") {
            an.need_tmp64 = true;
        }
        ctx.ops[i].pp = Some(pp);

        if !unresolved && !ctx.ops[i].flags.contains(InstFlags::ATAIL) {
            // the args are known, collect them
            let mut regmask = an.regmask;
            let mut save_arg_vars = an.save_arg_vars;
            collect_call_args(ctx, i, &mut regmask, &mut save_arg_vars, (i + opcnt * 2) as u32)?;
            an.regmask = regmask;
            an.save_arg_vars = save_arg_vars;
        }
    }

    Ok(())
}

/// Collect the stack arguments feeding the call at `i` by walking the
/// instruction stream backward across branches.
pub fn collect_call_args(
    ctx: &mut FuncContext,
    i: usize,
    regmask: &mut u32,
    save_arg_vars: &mut [u32; MAX_ARG_GRP],
    magic: u32,
) -> Result<(), TranslateError> {
    let mut pp = ctx.ops[i].pp.take().ok_or_else(|| ctx.ferr(i, "NULL pp"))?;
    let mut save_arg_vars_current = 0u32;
    let mut arg_grp = 0u8;

    let ret = collect_call_args_r(
        ctx,
        i,
        i,
        &mut pp,
        regmask,
        &mut save_arg_vars_current,
        &mut arg_grp,
        0,
        magic,
        false,
        false,
    );
    if let Err(e) = ret {
        ctx.ops[i].pp = Some(pp);
        return Err(e);
    }

    if arg_grp != 0 {
        // propagate the group to every push of every slot
        for a in 0..pp.argc() {
            if pp.args[a].reg.is_some() {
                continue;
            }
            let mut idx = pp.args[a].push_idx;
            while let Some(pi) = idx {
                ctx.ops[pi].p_arggrp = arg_grp;
                idx = ctx.ops[pi].p_argnext;
            }
        }
    }
    save_arg_vars[arg_grp as usize] |= save_arg_vars_current;

    ctx.ops[i].pp = Some(pp);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn collect_call_args_r(
    ctx: &mut FuncContext,
    po_i: usize,
    i: usize,
    pp: &mut Proto,
    regmask: &mut u32,
    save_arg_vars: &mut u32,
    arg_grp: &mut u8,
    mut arg: usize,
    mut magic: u32,
    mut need_op_saving: bool,
    mut may_reuse: bool,
) -> Result<usize, TranslateError> {
    let mut arg_grp_current = 0u8;
    let mut save_args_seen = 0u32;

    while arg < pp.argc() && pp.args[arg].reg.is_some() {
        arg += 1;
    }
    magic = (magic & 0xffffff) | ((arg as u32) << 24);

    let mut j = i as isize;
    while j >= 0 && (arg < pp.argc() || pp.is_unresolved) {
        let ju = j as usize;

        if (ctx.ops[ju].cc_scratch ^ magic) & 0xffffff == 0 {
            if ctx.ops[ju].cc_scratch != magic {
                return Err(ctx.ferr(
                    ju,
                    format!("arg collect hit same path with diff args for {}", pp.name),
                ));
            }
            // ok: have already been here
            return Ok(arg);
        }
        ctx.ops[ju].cc_scratch = magic;

        if ctx.labels[ju].is_some() && !ctx.label_refs[ju].is_empty() {
            let refs = ctx.label_refs[ju].clone();
            if refs.len() > 1 {
                need_op_saving = true;
            }
            let (last, rest) = match refs.split_last() {
                Some((l, r)) => (*l, r),
                None => unreachable!(),
            };
            for &r in rest {
                if ctx.ops[r].flags & (InstFlags::JMP | InstFlags::CJMP) != InstFlags::JMP {
                    may_reuse = true;
                }
                collect_call_args_r(
                    ctx,
                    po_i,
                    r,
                    pp,
                    regmask,
                    save_arg_vars,
                    arg_grp,
                    arg,
                    magic,
                    need_op_saving,
                    may_reuse,
                )?;
            }

            if ctx.ops[last].flags & (InstFlags::JMP | InstFlags::CJMP) != InstFlags::JMP {
                may_reuse = true;
            }
            if ju > 0 && crate::ir::is_last_op(&ctx.ops[ju - 1]) {
                // follow the last branch in reverse
                j = last as isize;
                continue;
            }
            need_op_saving = true;
            collect_call_args_r(
                ctx,
                po_i,
                last,
                pp,
                regmask,
                save_arg_vars,
                arg_grp,
                arg,
                magic,
                need_op_saving,
                may_reuse,
            )?;
        }
        j -= 1;
        if j < 0 {
            break;
        }
        let ju = j as usize;

        if ctx.ops[ju].op == Op::Call {
            if pp.is_unresolved {
                break;
            }
            let pp_tmp = ctx.ops[ju]
                .pp
                .as_ref()
                .ok_or_else(|| {
                    ctx.ferr(
                        po_i,
                        format!("arg collect hit unparsed call '{}'", ctx.ops[ju].operand_name(0)),
                    )
                })?;
            if may_reuse && pp_tmp.argc_stack > 0 {
                return Err(ctx.ferr(
                    po_i,
                    format!(
                        "arg collect {}/{} hit '{}' with {} stack args",
                        arg,
                        pp.argc(),
                        ctx.ops[ju].operand_name(0),
                        pp_tmp.argc_stack
                    ),
                ));
            }
        } else if ctx.ops[ju].op == Op::Add
            && ctx.ops[ju].operands[0].reg == Some(crate::ir::XSP)
            && (ctx.ops[ju].operands[1].kind != OprKind::Const || ctx.ops[ju].operands[1].val != 0)
        {
            // esp adjust of 0 means it was already collected
            if pp.is_unresolved {
                break;
            }
            return Err(ctx.ferr(
                po_i,
                format!(
                    "arg collect {}/{} hit esp adjust of {}",
                    arg,
                    pp.argc(),
                    ctx.ops[ju].operands[1].val
                ),
            ));
        } else if ctx.ops[ju].op == Op::Pop {
            if pp.is_unresolved {
                break;
            }
            return Err(ctx.ferr(po_i, format!("arg collect {}/{} hit pop", arg, pp.argc())));
        } else if ctx.ops[ju].flags.contains(InstFlags::CJMP) {
            if pp.is_unresolved {
                break;
            }
            may_reuse = true;
        } else if ctx.ops[ju].op == Op::Push && !ctx.ops[ju].flags.contains(InstFlags::FARG) {
            if pp.is_unresolved && ctx.ops[ju].flags.contains(InstFlags::RMD) {
                break;
            }

            if arg >= pp.argc() {
                // unresolved prototypes grow to match the pushes found
                pp.args.push(int_arg());
                pp.argc_stack += 1;
            }

            ctx.ops[ju].p_argnext = pp.args[arg].push_idx;
            pp.args[arg].push_idx = Some(ju);

            let mut need_to_save_current = false;
            let mut save_args = 0u32;
            let mut reg = None;
            if ctx.ops[ju].operands[0].kind == OprKind::Reg {
                reg = ctx.ops[ju].operands[0].reg;
            }

            if !need_op_saving {
                need_to_save_current =
                    origin::scan_for_mod(ctx, ju, ju + 1, i, true).is_some();
            }
            if need_op_saving || need_to_save_current {
                // this push needs its operand saved
                ctx.ops[ju].flags.remove(InstFlags::RMD);
                if ctx.ops[ju].p_argnum == 0 || (ctx.ops[ju].p_argnum as usize) < arg + 1 {
                    ctx.ops[ju].p_argnum = (arg + 1) as u8;
                    save_args |= 1 << arg;
                }

                if save_args_seen & (1 << (ctx.ops[ju].p_argnum - 1)) != 0 {
                    save_args_seen = 0;
                    arg_grp_current += 1;
                    if arg_grp_current as usize >= MAX_ARG_GRP {
                        return Err(ctx.ferr(
                            ju,
                            format!(
                                "out of arg groups (arg{}), f {}",
                                ctx.ops[ju].p_argnum, pp.name
                            ),
                        ));
                    }
                }
            } else if ctx.ops[ju].p_argnum == 0 {
                ctx.ops[ju].flags.insert(InstFlags::RMD);
            }

            // pushes reused by calls on other branches can't occur
            // without branching, so lock this one down (handles nested
            // calls)
            if !may_reuse {
                ctx.ops[ju].flags.insert(InstFlags::FARG);
            }

            ctx.ops[ju].flags.remove(InstFlags::RSAVE);

            // check for __VALIST
            if !pp.is_unresolved && pp.args[arg].type_.is_va_list {
                let opr = ctx.ops[ju].operands[0].clone();
                let mut k = None;
                let mut from_caller = false;
                let ret =
                    origin::resolve_origin(ctx, ju, &opr, magic + 1, &mut k, &mut from_caller);
                if ret == 1 {
                    if let Some(k) = k {
                        if ctx.ops[k].op == Op::Lea {
                            let host = ctx.func_pp()?;
                            let va_name = format!("arg_{:X}", host.argc_stack * 4);
                            let is_vararg = host.is_vararg;
                            if !is_vararg || ctx.ops[k].operands[1].name.contains(&va_name) {
                                ctx.ops[k].flags.insert(InstFlags::RMD);
                                ctx.ops[ju]
                                    .flags
                                    .insert(InstFlags::RMD | InstFlags::VAPUSH);
                                save_args &= !(1 << arg);
                                reg = None;
                            } else {
                                return Err(
                                    ctx.ferr(ju, "lea va_list used, but no vararg?")
                                );
                            }
                        } else if ctx.ops[k].op == Op::Mov
                            && ctx.is_stack_access(&ctx.ops[k], &ctx.ops[k].operands[1])
                        {
                            let opr1 = ctx.ops[k].operands[1].clone();
                            let access = stack_frame_access(ctx, k, &opr1, "", true, false)?;
                            if let Some(arg_idx) = access.arg_idx {
                                ctx.ops[k].flags.insert(InstFlags::RMD);
                                ctx.ops[ju].flags.insert(InstFlags::RMD);
                                ctx.ops[ju].p_argpass = (arg_idx + 1) as u8;
                                save_args &= !(1 << arg);
                                reg = None;
                            }
                        }
                    }
                }
            }

            *save_arg_vars |= save_args;

            // tracking reg usage
            if let Some(r) = reg {
                *regmask |= 1 << r;
            }

            arg += 1;
            if !pp.is_unresolved {
                while arg < pp.argc() && pp.args[arg].reg.is_some() {
                    arg += 1;
                }
            }
            magic = (magic & 0xffffff) | ((arg as u32) << 24);
        }

        if ctx.ops[ju].p_arggrp > arg_grp_current {
            save_args_seen = 0;
            arg_grp_current = ctx.ops[ju].p_arggrp;
        }
        if ctx.ops[ju].p_argnum > 0 {
            save_args_seen |= 1 << (ctx.ops[ju].p_argnum - 1);
        }
    }

    if arg < pp.argc() {
        return Err(ctx.ferr(
            po_i,
            format!("arg collect failed for '{}': {}/{}", pp.name, arg, pp.argc()),
        ));
    }

    if arg_grp_current > *arg_grp {
        *arg_grp = arg_grp_current;
    }

    Ok(arg)
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
    fn test_collect_two_args() {
        let db = ProtoDb::from_header("int callee(int a, int b);\nint f(void);").unwrap();
        let mut ctx = FuncContext::new("t.asm", "f", &db, false);
        ctx.func_pp = db.lookup("f").cloned();
        push_op(&mut ctx, &db, "push 2");
        push_op(&mut ctx, &db, "push 1");
        push_op(&mut ctx, &db, "call callee");
        push_op(&mut ctx, &db, "add esp, 8");
        push_op(&mut ctx, &db, "retn");
        ctx.ops[2].pp = db.lookup("callee").cloned();

        let mut an = FuncAnalysis::default();
        process_calls(&mut ctx, &mut an).unwrap();

        // esp adjust is consumed
        assert!(ctx.ops[3].flags.contains(InstFlags::RMD));
        // both pushes claimed, closest push is arg1
        let pp = ctx.ops[2].pp.as_ref().unwrap();
        assert_eq!(pp.args[0].push_idx, Some(1));
        assert_eq!(pp.args[1].push_idx, Some(0));
        // straight-line args are inlined, not saved
        assert!(ctx.ops[0].flags.contains(InstFlags::RMD));
        assert_eq!(ctx.ops[0].p_argnum, 0);
    }

    #[test]
    fn test_stack_tracking_mismatch() {
        let db = ProtoDb::from_header("int callee(int a);\nint f(void);").unwrap();
        let mut ctx = FuncContext::new("t.asm", "f", &db, false);
        ctx.func_pp = db.lookup("f").cloned();
        push_op(&mut ctx, &db, "push 1");
        push_op(&mut ctx, &db, "call callee");
        push_op(&mut ctx, &db, "add esp, 8");
        push_op(&mut ctx, &db, "retn");
        ctx.ops[1].pp = db.lookup("callee").cloned();

        let mut an = FuncAnalysis::default();
        assert!(process_calls(&mut ctx, &mut an).is_err());
    }

    #[test]
    fn test_pp_insert_reg_arg() {
        let mut pp = Proto::default();
        pp.args.push(int_arg());
        pp.argc_stack = 1;
        pp_insert_reg_arg(&mut pp, "ecx");
        assert_eq!(pp.args[0].reg.as_deref(), Some("ecx"));
        assert_eq!(pp.argc(), 2);
        assert_eq!(pp.argc_reg, 1);
    }
}
