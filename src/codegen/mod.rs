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

pub mod casts;
pub mod stack;

use std::fmt::Write as _;

use crate::analysis::{FuncAnalysis, FuncContext, origin};
use crate::errors::TranslateError;
use crate::header::Proto;
use crate::ir::{
    DataVal, FLAG_CONDS, FlagCond, Inst, InstFlags, LenMod, Op, Opr, OprKind, REGS_R32, XAX, XSP,
};
use casts::{
    default_cast_to, lmod_bytes, lmod_cast, lmod_cast_s, lmod_cast_u, lmod_cast_u_ptr,
    lmod_type_u, op_to_c, out_cmp_for_cc, out_cmp_test, out_dst_opr, out_src_opr,
    out_src_opr_u32, out_test_for_cc,
};

fn saved_arg_name(grp: u8, num: u8) -> String {
    if grp > 0 {
        format!("s{}_a{}", grp, num)
    } else {
        format!("s_a{}", num)
    }
}

fn assert_operand_cnt(ctx: &FuncContext, i: usize, po: &Inst, n: usize) -> Result<(), TranslateError> {
    if po.operands.len() != n {
        return Err(ctx.ferr(i, format!("operand_cnt is {}/{}", po.operands.len(), n)));
    }
    Ok(())
}

fn propagate_lmod(
    ctx: &FuncContext,
    i: usize,
    po: &mut Inst,
    o1: usize,
    o2: usize,
) -> Result<(), TranslateError> {
    let l1 = po.operands[o1].lmod;
    let l2 = po.operands[o2].lmod;

    if l1 == LenMod::Unspec && l2 == LenMod::Unspec {
        return Err(ctx.ferr(i, "missing lmod for both operands"));
    }

    if l1 == LenMod::Unspec {
        po.operands[o1].lmod = l2;
    } else if l2 == LenMod::Unspec {
        po.operands[o2].lmod = l1;
    } else if l1 != l2 {
        if po.operands[o1].type_from_var {
            po.operands[o1].size_mismatch = true;
            if l1 < l2 {
                po.operands[o1].size_lt = true;
            }
            po.operands[o1].lmod = l2;
        } else if po.operands[o2].type_from_var {
            po.operands[o2].size_mismatch = true;
            if l2 < l1 {
                po.operands[o2].size_lt = true;
            }
            po.operands[o2].lmod = l1;
        } else {
            return Err(ctx.ferr(i, format!("conflicting lmods: {:?} vs {:?}", l1, l2)));
        }
    }
    Ok(())
}

fn output_pp_attrs(out: &mut String, pp: &Proto, is_noreturn: bool) {
    if pp.is_fastcall {
        out.push_str("__fastcall ");
    } else if pp.is_stdcall && pp.argc_reg == 0 {
        out.push_str("__stdcall ");
    }
    if pp.is_noreturn || is_noreturn {
        out.push_str("noreturn ");
    }
}

// cond_z / cond_s updates shared by the arithmetic ops
fn output_std_flags(
    ctx: &FuncContext,
    i: usize,
    po: &Inst,
    pfomask: &mut u32,
    dst_text: &str,
) -> Result<String, TranslateError> {
    let mut out = String::new();
    if *pfomask & FlagCond::Z.bit() != 0 {
        let _ = write!(
            out,
            "\n  cond_z = ({}{} == 0);",
            lmod_cast_u(ctx, i, po.operands[0].lmod)?,
            dst_text
        );
        *pfomask &= !FlagCond::Z.bit();
    }
    if *pfomask & FlagCond::S.bit() != 0 {
        let _ = write!(
            out,
            "\n  cond_s = ({}{} < 0);",
            lmod_cast_s(ctx, i, po.operands[0].lmod)?,
            dst_text
        );
        *pfomask &= !FlagCond::S.bit();
    }
    Ok(out)
}

/// Render the analyzed procedure as a C function definition.
pub fn gen_func(ctx: &mut FuncContext, an: &FuncAnalysis) -> Result<String, TranslateError> {
    let opcnt = ctx.opcnt();
    let func_pp = ctx.func_pp()?.clone();
    let noreturn_attr = ctx.attrs.contains(crate::ir::FuncAttrs::NORETURN);

    let mut out = String::new();
    let mut had_decl = false;

    // userstack size knob
    if func_pp.is_userstack {
        let _ = writeln!(out, "#ifndef US_SZ_{}", func_pp.name);
        let _ = writeln!(out, "#define US_SZ_{} USERSTACK_SIZE", func_pp.name);
        let _ = writeln!(out, "#endif");
    }

    // the function itself
    let _ = write!(out, "{} ", func_pp.ret_type.name);
    output_pp_attrs(&mut out, &func_pp, noreturn_attr);
    let _ = write!(out, "{}(", func_pp.name);

    for (i, arg) in func_pp.args.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        if let Some(fpp) = &arg.fptr {
            // func pointer
            let _ = write!(out, "{} (", fpp.ret_type.name);
            output_pp_attrs(&mut out, fpp, false);
            let _ = write!(out, "*a{})(", i + 1);
            for (j, farg) in fpp.args.iter().enumerate() {
                if j > 0 {
                    out.push_str(", ");
                }
                if farg.fptr.is_some() {
                    return Err(ctx.ferr(0, "nested fptr"));
                }
                out.push_str(&farg.type_.name);
            }
            if fpp.is_vararg {
                if !fpp.args.is_empty() {
                    out.push_str(", ");
                }
                out.push_str("...");
            }
            out.push(')');
        } else if arg.type_.is_retreg {
            let reg = arg.reg.as_deref().unwrap_or("");
            let _ = write!(out, "u32 *r_{}", reg);
        } else {
            let _ = write!(out, "{} a{}", arg.type_.name, i + 1);
        }
    }
    if func_pp.is_vararg {
        if !func_pp.args.is_empty() {
            out.push_str(", ");
        }
        out.push_str("...");
    }

    out.push_str(")\n{\n");

    // declare indirect functions
    for i in 0..opcnt {
        if ctx.ops[i].flags.contains(InstFlags::RMD) || ctx.ops[i].op != Op::Call {
            continue;
        }
        let pp = ctx.ops[i]
            .pp
            .clone()
            .ok_or_else(|| ctx.ferr(i, "NULL pp"))?;
        if !pp.is_fptr || (!pp.name.is_empty() && pp.is_arg) {
            continue;
        }

        let new_name = if pp.name.is_empty() {
            format!("icall{}", i)
        } else {
            format!("i_{}", pp.name)
        };
        if let Some(pp_mut) = ctx.ops[i].pp.as_mut() {
            pp_mut.name = new_name.clone();
        }

        if !new_name.starts_with("icall") {
            // might be declared already
            let mut found = false;
            for j in 0..i {
                if ctx.ops[j].op != Op::Call {
                    continue;
                }
                if let Some(pp_tmp) = &ctx.ops[j].pp {
                    if pp_tmp.is_fptr && pp_tmp.name == new_name {
                        found = true;
                        break;
                    }
                }
            }
            if found {
                continue;
            }
        }

        let _ = write!(out, "  {} (", pp.ret_type.name);
        output_pp_attrs(&mut out, &pp, false);
        let _ = write!(out, "*{})(", new_name);
        for (j, arg) in pp.args.iter().enumerate() {
            if j > 0 {
                out.push_str(", ");
            }
            let _ = write!(out, "{} a{}", arg.type_.name, j + 1);
        }
        out.push_str(");\n");
        had_decl = true;
    }

    // LUTs and jumptables
    for pd in &ctx.func_pd {
        out.push_str("  static const ");
        if pd.kind == OprKind::Offset {
            let _ = write!(out, "void *jt_{}[] =\n    {{ ", pd.label);
            for (j, item) in pd.items.iter().enumerate() {
                if j > 0 {
                    out.push_str(", ");
                }
                if let DataVal::Label(l) = &item.val {
                    let _ = write!(out, "&&{}", l);
                }
            }
        } else {
            let _ = write!(
                out,
                "{} {}[] =\n    {{ ",
                lmod_type_u(ctx, 0, pd.lmod)?,
                pd.label
            );
            for (j, item) in pd.items.iter().enumerate() {
                if j > 0 {
                    out.push_str(", ");
                }
                if let DataVal::Num(v) = &item.val {
                    let _ = write!(out, "{}", v);
                }
            }
        }
        out.push_str(" };\n");
        had_decl = true;
    }

    // stack frame, va_list
    if ctx.stack_fsz != 0 {
        let fsz = ctx.stack_fsz;
        let _ = writeln!(
            out,
            "  union {{ u32 d[{}]; u16 w[{}]; u8 b[{}]; }} sf;",
            (fsz + 3) / 4,
            (fsz + 1) / 2,
            fsz
        );
        had_decl = true;
    }

    if func_pp.is_userstack {
        let _ = writeln!(out, "  u32 fake_sf[US_SZ_{} / 4];", func_pp.name);
        let _ = writeln!(out, "  u32 *esp = &fake_sf[sizeof(fake_sf) / 4];");
        had_decl = true;
    }

    if func_pp.is_vararg {
        out.push_str("  va_list ap;\n");
        had_decl = true;
    }

    // arg-registers
    for (i, arg) in func_pp.args.iter().enumerate() {
        let reg_name = match &arg.reg {
            Some(r) => r,
            None => continue,
        };
        let reg = REGS_R32
            .iter()
            .position(|r| r == reg_name)
            .ok_or_else(|| ctx.ferr(0, format!("arg '{}' is not a reg?", reg_name)))?;
        if an.regmask & (1 << reg) != 0 {
            if arg.type_.is_retreg {
                let _ = writeln!(out, "  u32 {} = *r_{};", reg_name, reg_name);
            } else {
                let _ = writeln!(out, "  u32 {} = (u32)a{};", reg_name, i + 1);
            }
        } else {
            if arg.type_.is_retreg {
                return Err(ctx.ferr(0, format!("retreg '{}' is unused?", reg_name)));
            }
            let _ = writeln!(out, "  // {} = a{}; // unused", reg_name, i + 1);
        }
        had_decl = true;
    }

    let mut regmask_now = an.regmask & !an.regmask_arg;
    regmask_now &= !(1 << XSP);
    if regmask_now & 0x00ff != 0 {
        for reg in 0..8 {
            if regmask_now & (1 << reg) != 0 {
                let _ = write!(out, "  u32 {}", REGS_R32[reg]);
                if an.regmask_init & (1 << reg) != 0 {
                    out.push_str(" = 0");
                }
                out.push_str(";\n");
                had_decl = true;
            }
        }
    }
    if regmask_now & 0xff00 != 0 {
        for reg in 8..16 {
            if regmask_now & (1 << reg) != 0 {
                let _ = write!(out, "  mmxr {}", REGS_R32[reg]);
                if an.regmask_init & (1 << reg) != 0 {
                    out.push_str(" = { 0, }");
                }
                out.push_str(";\n");
                had_decl = true;
            }
        }
    }

    if an.regmask_save != 0 {
        for reg in 0..8 {
            if an.regmask_save & (1 << reg) != 0 {
                let _ = writeln!(out, "  u32 s_{};", REGS_R32[reg]);
                had_decl = true;
            }
        }
    }

    for (grp, &vars) in an.save_arg_vars.iter().enumerate() {
        if vars == 0 {
            continue;
        }
        for bit in 0..32 {
            if vars & (1 << bit) != 0 {
                let _ = writeln!(out, "  u32 {};", saved_arg_name(grp as u8, bit + 1));
                had_decl = true;
            }
        }
    }

    if an.cond_vars != 0 {
        for fc in FLAG_CONDS {
            if an.cond_vars & fc.bit() != 0 {
                let _ = writeln!(out, "  u32 cond_{};", fc.name());
                had_decl = true;
            }
        }
    }

    if an.need_tmp_var {
        out.push_str("  u32 tmp;\n");
        had_decl = true;
    }

    if an.need_tmp64 {
        out.push_str("  u64 tmp64;\n");
        had_decl = true;
    }

    if had_decl {
        out.push('\n');
    }

    if func_pp.is_vararg {
        if func_pp.argc_stack == 0 {
            return Err(ctx.ferr(0, "vararg func without stack args?"));
        }
        let _ = writeln!(out, "  va_start(ap, a{});", func_pp.argc());
    }

    emit_body(ctx, an, &func_pp, &mut out)?;

    if ctx.stack_fsz != 0 && !ctx.stack_frame_used.get() {
        out.push_str("  (void)sf;\n");
    }

    out.push_str("}\n\n");

    Ok(out)
}

fn emit_body(
    ctx: &mut FuncContext,
    an: &FuncAnalysis,
    func_pp: &Proto,
    out: &mut String,
) -> Result<(), TranslateError> {
    let opcnt = ctx.opcnt();

    let mut label_pending = false;
    let mut delayed_flag_op: Option<usize> = None;
    let mut last_arith_dst: Option<(usize, Opr)> = None;
    let mut comment = String::new();

    for i in 0..opcnt {
        if let Some(label) = &ctx.labels[i] {
            let _ = write!(out, "\n{}:\n", label);
            label_pending = true;

            delayed_flag_op = None;
            last_arith_dst = None;
        }

        if ctx.ops[i].flags.contains(InstFlags::RMD) {
            continue;
        }

        let mut po = ctx.ops[i].clone();
        let mut no_output = false;
        let mut pfomask = po.pfomask;

        // conditional / flag-using op?
        let mut cc_expr = String::new();
        if po.flags.contains(InstFlags::CC) {
            let pfo = po.pfo.ok_or_else(|| ctx.ferr(i, "CC op without pfo"))?;
            let mut is_delayed = false;

            // all this trouble is to avoid materializing parsed flag ops,
            // which makes the generated code much nicer
            if let Some(dfo) = delayed_flag_op {
                let dpo = ctx.ops[dfo].clone();
                let (expr, cmt) = out_cmp_test(ctx, dfo, &dpo, pfo, po.pfo_inv)?;
                cc_expr = expr;
                if let Some(c) = cmt {
                    comment.push_str(&c);
                }
                is_delayed = true;
            } else if let Some((la_i, la_opr)) = &last_arith_dst {
                let setter_is_andor = po
                    .flag_setter
                    .map(|s| matches!(ctx.ops[s].op, Op::And | Op::Or))
                    .unwrap_or(false);
                if matches!(pfo, FlagCond::Z | FlagCond::S | FlagCond::P) || setter_is_andor {
                    let expr3 = out_src_opr_u32(ctx, *la_i, &po, la_opr)?;
                    cc_expr =
                        out_test_for_cc(ctx, i, pfo, po.pfo_inv, la_opr.lmod, &expr3)?;
                    is_delayed = true;
                }
            }

            if !is_delayed && cc_expr.is_empty() {
                match po.flag_setter {
                    Some(setter) => {
                        // use the precomputed flag
                        if ctx.ops[setter].pfomask & pfo.bit() == 0 {
                            return Err(ctx.ferr(i, format!("not prepared for pfo {:?}", pfo)));
                        }
                        // pfo_inv is not yet applied
                        cc_expr = format!(
                            "({}cond_{})",
                            if po.pfo_inv { "!" } else { "" },
                            pfo.name()
                        );
                    }
                    None => {
                        return Err(
                            ctx.ferr(i, "all methods of finding comparison failed")
                        );
                    }
                }
            }

            if po.flags.contains(InstFlags::JMP) {
                let _ = write!(out, "  if {}", cc_expr);
            } else if matches!(po.op, Op::Rcl | Op::Rcr | Op::Adc | Op::Sbb) {
                if is_delayed {
                    let _ = writeln!(out, "  cond_{} = {};", pfo.name(), cc_expr);
                }
            } else if po.flags.contains(InstFlags::DATA) {
                // SETcc
                let mut o0 = po.operands[0].clone();
                let dst = out_dst_opr(ctx, i, &po, &mut o0)?;
                po.operands[0] = o0;
                let _ = write!(out, "  {} = {};", dst, cc_expr);
            } else {
                return Err(ctx.ferr(i, "unhandled conditional op"));
            }
        }

        if po.flags.intersects(InstFlags::REPZ | InstFlags::REPNZ) {
            let ecx = Opr::new_reg(crate::ir::XCX, LenMod::Dword);
            let val = origin::try_resolve_const(ctx, i, &ecx, (opcnt * 7 + i) as u32);

            if val.is_none() || val == Some(0) {
                // initial flags are needed for the ecx==0 case
                if i > 0
                    && ctx.ops[i - 1].op == Op::Xor
                    && ctx.ops[i - 1].operand_name(0) == ctx.ops[i - 1].operand_name(1)
                {
                    out.push_str("  cond_z = ");
                    if pfomask & FlagCond::C.bit() != 0 {
                        out.push_str("cond_c = ");
                    }
                    out.push_str("0;\n");
                } else if let Some((la_i, la_opr)) = &last_arith_dst {
                    let expr3 = out_src_opr_u32(ctx, *la_i, &po, la_opr)?;
                    let t = out_test_for_cc(ctx, i, FlagCond::Z, false, la_opr.lmod, &expr3)?;
                    let _ = writeln!(out, "  cond_z = {};", t);
                } else {
                    return Err(ctx.ferr(i, "missing initial ZF"));
                }
            }
        }

        match po.op {
            Op::Mov => {
                assert_operand_cnt(ctx, i, &po, 2)?;
                propagate_lmod(ctx, i, &mut po, 0, 1)?;
                let mut o0 = po.operands[0].clone();
                let dst = out_dst_opr(ctx, i, &po, &mut o0)?;
                po.operands[0] = o0;
                let cast = default_cast_to(&po.operands[0]);
                let src = out_src_opr(ctx, i, &po, &po.operands[1], &cast, false)?;
                let _ = write!(out, "  {} = {};", dst, src);
            }

            Op::Lea => {
                assert_operand_cnt(ctx, i, &po, 2)?;
                po.operands[1].lmod = LenMod::Dword; // always
                let mut o0 = po.operands[0].clone();
                let dst = out_dst_opr(ctx, i, &po, &mut o0)?;
                po.operands[0] = o0;
                let src = out_src_opr(ctx, i, &po, &po.operands[1], "", true)?;
                let _ = write!(out, "  {} = {};", dst, src);
            }

            Op::Movzx => {
                assert_operand_cnt(ctx, i, &po, 2)?;
                let mut o0 = po.operands[0].clone();
                let dst = out_dst_opr(ctx, i, &po, &mut o0)?;
                po.operands[0] = o0;
                let src = out_src_opr_u32(ctx, i, &po, &po.operands[1])?;
                let _ = write!(out, "  {} = {};", dst, src);
            }

            Op::Movsx => {
                assert_operand_cnt(ctx, i, &po, 2)?;
                let cast = match po.operands[1].lmod {
                    LenMod::Byte => "(s8)",
                    LenMod::Word => "(s16)",
                    _ => return Err(ctx.ferr(i, "invalid src lmod")),
                };
                let mut o0 = po.operands[0].clone();
                let dst = out_dst_opr(ctx, i, &po, &mut o0)?;
                po.operands[0] = o0;
                let src = out_src_opr(ctx, i, &po, &po.operands[1], cast, false)?;
                let _ = write!(out, "  {} = {};", dst, src);
            }

            Op::Xchg => {
                assert_operand_cnt(ctx, i, &po, 2)?;
                propagate_lmod(ctx, i, &mut po, 0, 1)?;
                let src0 = out_src_opr(ctx, i, &po, &po.operands[0], "", false)?;
                let _ = write!(out, "  tmp = {};", src0);
                let mut o0 = po.operands[0].clone();
                let dst0 = out_dst_opr(ctx, i, &po, &mut o0)?;
                po.operands[0] = o0;
                let cast0 = default_cast_to(&po.operands[0]);
                let src1 = out_src_opr(ctx, i, &po, &po.operands[1], &cast0, false)?;
                let _ = write!(out, " {} = {};", dst0, src1);
                let mut o1 = po.operands[1].clone();
                let dst1 = out_dst_opr(ctx, i, &po, &mut o1)?;
                po.operands[1] = o1;
                let cast1 = default_cast_to(&po.operands[1]);
                let _ = write!(out, " {} = {}tmp;", dst1, cast1);
                comment.push_str("xchg");
            }

            Op::Not => {
                assert_operand_cnt(ctx, i, &po, 1)?;
                let mut o0 = po.operands[0].clone();
                let dst = out_dst_opr(ctx, i, &po, &mut o0)?;
                po.operands[0] = o0;
                let _ = write!(out, "  {} = ~{};", dst, dst);
            }

            Op::Cdq => {
                assert_operand_cnt(ctx, i, &po, 2)?;
                let mut o0 = po.operands[0].clone();
                let dst = out_dst_opr(ctx, i, &po, &mut o0)?;
                po.operands[0] = o0;
                let src = out_src_opr_u32(ctx, i, &po, &po.operands[1])?;
                let _ = write!(out, "  {} = (s32){} >> 31;", dst, src);
                comment.push_str("cdq");
            }

            Op::Lods => {
                assert_operand_cnt(ctx, i, &po, 3)?;
                if po.flags.contains(InstFlags::REP) {
                    return Err(ctx.ferr(i, "rep lods is unhandled"));
                }
                let lmod = po.operands[0].lmod;
                let dst = match lmod {
                    LenMod::Byte => "LOBYTE(eax)",
                    LenMod::Word => "LOWORD(eax)",
                    _ => "eax",
                };
                let _ = write!(
                    out,
                    "  {} = {}esi; esi {}= {};",
                    dst,
                    lmod_cast_u_ptr(ctx, i, lmod)?,
                    if po.flags.contains(InstFlags::DF) { '-' } else { '+' },
                    lmod_bytes(ctx, i, lmod)?
                );
                comment.push_str("lods");
            }

            Op::Stos => {
                assert_operand_cnt(ctx, i, &po, 3)?;
                let lmod = po.operands[0].lmod;
                let dir = if po.flags.contains(InstFlags::DF) { '-' } else { '+' };
                let j = lmod_bytes(ctx, i, lmod)?;
                if po.flags.contains(InstFlags::REP) {
                    let _ = write!(out, "  for (; ecx != 0; ecx--, edi {}= {})\n", dir, j);
                    let _ = write!(out, "    {}edi = eax;", lmod_cast_u_ptr(ctx, i, lmod)?);
                    comment.push_str("rep stos");
                } else {
                    let _ = write!(
                        out,
                        "  {}edi = eax; edi {}= {};",
                        lmod_cast_u_ptr(ctx, i, lmod)?,
                        dir,
                        j
                    );
                    comment.push_str("stos");
                }
            }

            Op::Movs => {
                assert_operand_cnt(ctx, i, &po, 3)?;
                let lmod = po.operands[0].lmod;
                let j = lmod_bytes(ctx, i, lmod)?;
                let cast = lmod_cast_u_ptr(ctx, i, lmod)?;
                let dir = if po.flags.contains(InstFlags::DF) { '-' } else { '+' };
                if po.flags.contains(InstFlags::REP) {
                    let _ = write!(
                        out,
                        "  for (; ecx != 0; ecx--, edi {}= {}, esi {}= {})\n",
                        dir, j, dir, j
                    );
                    let _ = write!(out, "    {}edi = {}esi;", cast, cast);
                    comment.push_str("rep movs");
                } else {
                    let _ = write!(
                        out,
                        "  {}edi = {}esi; edi {}= {}; esi {}= {};",
                        cast, cast, dir, j, dir, j
                    );
                    comment.push_str("movs");
                }
            }

            Op::Cmps => {
                // repe ~ repeat while ZF=1
                assert_operand_cnt(ctx, i, &po, 3)?;
                let lmod = po.operands[0].lmod;
                let j = lmod_bytes(ctx, i, lmod)?;
                let cast = lmod_cast_u_ptr(ctx, i, lmod)?;
                let dir = if po.flags.contains(InstFlags::DF) { '-' } else { '+' };
                if po.flags.contains(InstFlags::REP) {
                    out.push_str("  for (; ecx != 0; ecx--) {\n");
                    if pfomask & FlagCond::C.bit() != 0 {
                        let _ = write!(out, "    cond_c = {}esi < {}edi;\n", cast, cast);
                        pfomask &= !FlagCond::C.bit();
                    }
                    let _ = write!(
                        out,
                        "    cond_z = ({}esi == {}edi); esi {}= {}, edi {}= {};\n",
                        cast, cast, dir, j, dir, j
                    );
                    let _ = write!(
                        out,
                        "    if (cond_z {} 0) break;\n",
                        if po.flags.contains(InstFlags::REPZ) { "==" } else { "!=" }
                    );
                    out.push_str("  }");
                    let _ = write!(
                        comment,
                        "rep{} cmps",
                        if po.flags.contains(InstFlags::REPZ) { "e" } else { "ne" }
                    );
                } else {
                    let _ = write!(
                        out,
                        "  cond_z = ({}esi == {}edi); esi {}= {}; edi {}= {};",
                        cast, cast, dir, j, dir, j
                    );
                    comment.push_str("cmps");
                }
                pfomask &= !FlagCond::Z.bit();
                last_arith_dst = None;
                delayed_flag_op = None;
            }

            Op::Scas => {
                // only ZF, repe ~ repeat while ZF=1
                assert_operand_cnt(ctx, i, &po, 3)?;
                let lmod = po.operands[0].lmod;
                let j = lmod_bytes(ctx, i, lmod)?;
                let cast = lmod_cast_u(ctx, i, lmod)?;
                let cast_ptr = lmod_cast_u_ptr(ctx, i, lmod)?;
                let dir = if po.flags.contains(InstFlags::DF) { '-' } else { '+' };
                if po.flags.contains(InstFlags::REP) {
                    out.push_str("  for (; ecx != 0; ecx--) {\n");
                    let _ = write!(
                        out,
                        "    cond_z = ({}eax == {}edi); edi {}= {};\n",
                        cast, cast_ptr, dir, j
                    );
                    let _ = write!(
                        out,
                        "    if (cond_z {} 0) break;\n",
                        if po.flags.contains(InstFlags::REPZ) { "==" } else { "!=" }
                    );
                    out.push_str("  }");
                    let _ = write!(
                        comment,
                        "rep{} scas",
                        if po.flags.contains(InstFlags::REPZ) { "e" } else { "ne" }
                    );
                } else {
                    let _ = write!(
                        out,
                        "  cond_z = ({}eax == {}edi); edi {}= {};",
                        cast, cast_ptr, dir, j
                    );
                    comment.push_str("scas");
                }
                pfomask &= !FlagCond::Z.bit();
                last_arith_dst = None;
                delayed_flag_op = None;
            }

            Op::Xlat => {
                let _ = write!(out, "  LOBYTE(eax) = *(u8 *)(ebx + LOBYTE(eax));");
                comment.push_str("xlat");
                last_arith_dst = None;
                delayed_flag_op = None;
            }

            // arithmetic w/flags
            Op::And | Op::Or => {
                propagate_lmod(ctx, i, &mut po, 0, 1)?;
                emit_dualop_arith(ctx, an, i, &mut po, &mut pfomask, out)?;
                last_arith_dst = Some((i, po.operands[0].clone()));
                delayed_flag_op = None;
            }

            Op::Shl | Op::Shr => {
                assert_operand_cnt(ctx, i, &po, 2)?;
                let mut o0 = po.operands[0].clone();
                let dst = out_dst_opr(ctx, i, &po, &mut o0)?;
                po.operands[0] = o0;
                if pfomask & FlagCond::C.bit() != 0 {
                    if po.operands[1].kind != OprKind::Const {
                        return Err(ctx.ferr(i, "variable shift with carry use is unhandled"));
                    }
                    let width = lmod_bytes(ctx, i, po.operands[0].lmod)? * 8;
                    let mut sh = po.operands[1].val % width;
                    if sh == 0 {
                        return Err(ctx.ferr(i, "zero shift?"));
                    }
                    if po.op == Op::Shl {
                        sh = width - sh;
                    } else {
                        sh -= 1;
                    }
                    let _ = writeln!(out, "  cond_c = ({} >> {}) & 1;", dst, sh);
                    pfomask &= !FlagCond::C.bit();
                }
                let src = out_src_opr_u32(ctx, i, &po, &po.operands[1])?;
                let _ = write!(out, "  {} {}= {};", dst, op_to_c(ctx, i, &po)?, src);
                let fl = output_std_flags(ctx, i, &po, &mut pfomask, &dst)?;
                out.push_str(&fl);
                last_arith_dst = Some((i, po.operands[0].clone()));
                delayed_flag_op = None;
            }

            Op::Sar => {
                assert_operand_cnt(ctx, i, &po, 2)?;
                let mut o0 = po.operands[0].clone();
                let dst = out_dst_opr(ctx, i, &po, &mut o0)?;
                po.operands[0] = o0;
                let src = out_src_opr_u32(ctx, i, &po, &po.operands[1])?;
                let _ = write!(
                    out,
                    "  {} = {}{} >> {};",
                    dst,
                    lmod_cast_s(ctx, i, po.operands[0].lmod)?,
                    dst,
                    src
                );
                let fl = output_std_flags(ctx, i, &po, &mut pfomask, &dst)?;
                out.push_str(&fl);
                last_arith_dst = Some((i, po.operands[0].clone()));
                delayed_flag_op = None;
            }

            Op::Shrd => {
                assert_operand_cnt(ctx, i, &po, 3)?;
                propagate_lmod(ctx, i, &mut po, 0, 1)?;
                let width = lmod_bytes(ctx, i, po.operands[0].lmod)? * 8;
                let mut o0 = po.operands[0].clone();
                let dst = out_dst_opr(ctx, i, &po, &mut o0)?;
                po.operands[0] = o0;
                let src1 = out_src_opr_u32(ctx, i, &po, &po.operands[1])?;
                let src2 = out_src_opr_u32(ctx, i, &po, &po.operands[2])?;
                let _ = write!(
                    out,
                    "  {} >>= {}; {} |= {} << ({} - {});",
                    dst, src2, dst, src1, width, src2
                );
                comment.push_str("shrd");
                let fl = output_std_flags(ctx, i, &po, &mut pfomask, &dst)?;
                out.push_str(&fl);
                last_arith_dst = Some((i, po.operands[0].clone()));
                delayed_flag_op = None;
            }

            Op::Rol | Op::Ror => {
                assert_operand_cnt(ctx, i, &po, 2)?;
                let mut o0 = po.operands[0].clone();
                let dst = out_dst_opr(ctx, i, &po, &mut o0)?;
                po.operands[0] = o0;
                if po.operands[1].kind != OprKind::Const {
                    return Err(ctx.ferr(i, "variable rotate is unhandled"));
                }
                let width = lmod_bytes(ctx, i, po.operands[0].lmod)? * 8;
                let sh = po.operands[1].val % width;
                if po.op == Op::Rol {
                    let _ = write!(
                        out,
                        "  {} = ({} << {}) | ({} >> {});",
                        dst, dst, sh, dst, width - sh
                    );
                } else {
                    let _ = write!(
                        out,
                        "  {} = ({} >> {}) | ({} << {});",
                        dst, dst, sh, dst, width - sh
                    );
                }
                let fl = output_std_flags(ctx, i, &po, &mut pfomask, &dst)?;
                out.push_str(&fl);
                last_arith_dst = Some((i, po.operands[0].clone()));
                delayed_flag_op = None;
            }

            Op::Rcl | Op::Rcr => {
                assert_operand_cnt(ctx, i, &po, 2)?;
                let mut o0 = po.operands[0].clone();
                let dst = out_dst_opr(ctx, i, &po, &mut o0)?;
                po.operands[0] = o0;
                let width = lmod_bytes(ctx, i, po.operands[0].lmod)? * 8;
                if po.operands[1].kind != OprKind::Const {
                    return Err(ctx.ferr(i, "variable rotate-carry is unhandled"));
                }
                let sh = po.operands[1].val % width;
                if sh == 0 {
                    return Err(ctx.ferr(i, "zero rotate"));
                }
                let tmp_bit = if po.op == Op::Rcl { width - sh } else { sh - 1 };
                let _ = writeln!(out, "  tmp = ({} >> {}) & 1;", dst, tmp_bit);
                if po.op == Op::Rcl {
                    let _ = write!(
                        out,
                        "  {} = ({} << {}) | (cond_c << {})",
                        dst,
                        dst,
                        sh,
                        sh - 1
                    );
                    if sh != 1 {
                        let _ = write!(out, " | ({} >> {})", dst, width + 1 - sh);
                    }
                } else {
                    let _ = write!(
                        out,
                        "  {} = ({} >> {}) | (cond_c << {})",
                        dst,
                        dst,
                        sh,
                        width - sh
                    );
                    if sh != 1 {
                        let _ = write!(out, " | ({} << {})", dst, width + 1 - sh);
                    }
                }
                out.push_str(";\n");
                out.push_str("  cond_c = tmp;");
                comment.push_str(if po.op == Op::Rcl { "rcl" } else { "rcr" });
                let fl = output_std_flags(ctx, i, &po, &mut pfomask, &dst)?;
                out.push_str(&fl);
                last_arith_dst = Some((i, po.operands[0].clone()));
                delayed_flag_op = None;
            }

            Op::Xor => {
                assert_operand_cnt(ctx, i, &po, 2)?;
                propagate_lmod(ctx, i, &mut po, 0, 1)?;
                if po.operand_name(0) == po.operand_name(1) {
                    // special case for xor
                    if pfomask & FlagCond::Be.bit() != 0 {
                        // weird, but it happens
                        out.push_str("  cond_be = 1;\n");
                        pfomask &= !FlagCond::Be.bit();
                    }
                    let mut o0 = po.operands[0].clone();
                    let dst = out_dst_opr(ctx, i, &po, &mut o0)?;
                    po.operands[0] = o0;
                    let _ = write!(out, "  {} = 0;", dst);
                    last_arith_dst = Some((i, po.operands[0].clone()));
                    delayed_flag_op = None;
                } else {
                    emit_dualop_arith(ctx, an, i, &mut po, &mut pfomask, out)?;
                    last_arith_dst = Some((i, po.operands[0].clone()));
                    delayed_flag_op = None;
                }
            }

            Op::Add => {
                assert_operand_cnt(ctx, i, &po, 2)?;
                propagate_lmod(ctx, i, &mut po, 0, 1)?;
                if pfomask & FlagCond::C.bit() != 0 {
                    let src0 = out_src_opr_u32(ctx, i, &po, &po.operands[0])?;
                    let src1 = out_src_opr_u32(ctx, i, &po, &po.operands[1])?;
                    if po.operands[0].lmod == LenMod::Dword {
                        let _ = writeln!(out, "  tmp64 = (u64){} + {};", src0, src1);
                        out.push_str("  cond_c = tmp64 >> 32;\n");
                        let mut o0 = po.operands[0].clone();
                        let dst = out_dst_opr(ctx, i, &po, &mut o0)?;
                        po.operands[0] = o0;
                        let _ = write!(out, "  {} = (u32)tmp64;", dst);
                        comment.push_str("add64");
                    } else {
                        let width = lmod_bytes(ctx, i, po.operands[0].lmod)? * 8;
                        let _ = writeln!(
                            out,
                            "  cond_c = ((u32){} + {}) >> {};",
                            src0, src1, width
                        );
                        let mut o0 = po.operands[0].clone();
                        let dst = out_dst_opr(ctx, i, &po, &mut o0)?;
                        po.operands[0] = o0;
                        let _ = write!(out, "  {} += {};", dst, src1);
                    }
                    pfomask &= !FlagCond::C.bit();
                    let dst0 = out_src_opr_u32(ctx, i, &po, &po.operands[0])?;
                    let fl = output_std_flags(ctx, i, &po, &mut pfomask, &dst0)?;
                    out.push_str(&fl);
                    last_arith_dst = Some((i, po.operands[0].clone()));
                    delayed_flag_op = None;
                } else {
                    emit_dualop_arith(ctx, an, i, &mut po, &mut pfomask, out)?;
                    last_arith_dst = Some((i, po.operands[0].clone()));
                    delayed_flag_op = None;
                }
            }

            Op::Sub => {
                assert_operand_cnt(ctx, i, &po, 2)?;
                propagate_lmod(ctx, i, &mut po, 0, 1)?;
                if pfomask & !(FlagCond::Z.bit() | FlagCond::S.bit()) != 0 {
                    for fc in FLAG_CONDS {
                        if pfomask & fc.bit() == 0 {
                            continue;
                        }
                        if matches!(fc, FlagCond::Z | FlagCond::S) {
                            continue;
                        }
                        let (cond, cmt) = out_cmp_for_cc(ctx, i, &po, fc, false)?;
                        if let Some(c) = cmt {
                            comment.push_str(&c);
                        }
                        let _ = writeln!(out, "  cond_{} = {};", fc.name(), cond);
                        pfomask &= !fc.bit();
                    }
                }
                emit_dualop_arith(ctx, an, i, &mut po, &mut pfomask, out)?;
                last_arith_dst = Some((i, po.operands[0].clone()));
                delayed_flag_op = None;
            }

            Op::Adc | Op::Sbb => {
                assert_operand_cnt(ctx, i, &po, 2)?;
                propagate_lmod(ctx, i, &mut po, 0, 1)?;
                let mut o0 = po.operands[0].clone();
                let dst = out_dst_opr(ctx, i, &po, &mut o0)?;
                po.operands[0] = o0;
                if po.op == Op::Sbb && po.operands[0].name == po.operands[1].name {
                    // avoid use of an uninitialized var
                    let _ = write!(out, "  {} = -cond_c;", dst);
                    // carry remains what it was
                    pfomask &= !FlagCond::C.bit();
                } else {
                    let src = out_src_opr_u32(ctx, i, &po, &po.operands[1])?;
                    let _ = write!(out, "  {} {}= {} + cond_c;", dst, op_to_c(ctx, i, &po)?, src);
                }
                let fl = output_std_flags(ctx, i, &po, &mut pfomask, &dst)?;
                out.push_str(&fl);
                last_arith_dst = Some((i, po.operands[0].clone()));
                delayed_flag_op = None;
            }

            Op::Bsf => {
                assert_operand_cnt(ctx, i, &po, 2)?;
                let src = out_src_opr_u32(ctx, i, &po, &po.operands[1])?;
                let mut o0 = po.operands[0].clone();
                let dst = out_dst_opr(ctx, i, &po, &mut o0)?;
                po.operands[0] = o0;
                let _ = write!(
                    out,
                    "  {} = {} ? __builtin_ffs({}) - 1 : 0;",
                    dst, src, src
                );
                let fl = output_std_flags(ctx, i, &po, &mut pfomask, &dst)?;
                out.push_str(&fl);
                last_arith_dst = Some((i, po.operands[0].clone()));
                delayed_flag_op = None;
                comment.push_str("bsf");
            }

            Op::Dec | Op::Inc => {
                if po.op == Op::Dec
                    && pfomask & !(FlagCond::Z.bit() | FlagCond::S.bit() | FlagCond::C.bit()) != 0
                {
                    for fc in FLAG_CONDS {
                        if pfomask & fc.bit() == 0 {
                            continue;
                        }
                        if matches!(fc, FlagCond::Z | FlagCond::S | FlagCond::C) {
                            continue;
                        }
                        let (cond, cmt) = out_cmp_for_cc(ctx, i, &po, fc, false)?;
                        if let Some(c) = cmt {
                            comment.push_str(&c);
                        }
                        let _ = writeln!(out, "  cond_{} = {};", fc.name(), cond);
                        pfomask &= !fc.bit();
                    }
                }
                if pfomask & FlagCond::C.bit() != 0 {
                    // carry is unaffected by inc/dec.. wtf?
                    return Err(ctx.ferr(i, "carry propagation needed"));
                }

                let mut o0 = po.operands[0].clone();
                let dst = out_dst_opr(ctx, i, &po, &mut o0)?;
                po.operands[0] = o0;
                if po.operands[0].kind == OprKind::Reg {
                    let opstr = if po.op == Op::Inc { "++" } else { "--" };
                    let _ = write!(out, "  {}{};", dst, opstr);
                } else {
                    let opstr = if po.op == Op::Inc { "+" } else { "-" };
                    let _ = write!(out, "  {} {}= 1;", dst, opstr);
                }
                let fl = output_std_flags(ctx, i, &po, &mut pfomask, &dst)?;
                out.push_str(&fl);
                last_arith_dst = Some((i, po.operands[0].clone()));
                delayed_flag_op = None;
            }

            Op::Neg => {
                let mut o0 = po.operands[0].clone();
                let dst = out_dst_opr(ctx, i, &po, &mut o0)?;
                po.operands[0] = o0;
                let src = out_src_opr_u32(ctx, i, &po, &po.operands[0])?;
                let _ = write!(
                    out,
                    "  {} = -{}{};",
                    dst,
                    lmod_cast_s(ctx, i, po.operands[0].lmod)?,
                    src
                );
                last_arith_dst = Some((i, po.operands[0].clone()));
                delayed_flag_op = None;
                if pfomask & FlagCond::C.bit() != 0 {
                    let _ = write!(out, "\n  cond_c = ({} != 0);", dst);
                    pfomask &= !FlagCond::C.bit();
                }
            }

            Op::Imul if po.operands.len() == 2 => {
                propagate_lmod(ctx, i, &mut po, 0, 1)?;
                emit_dualop_arith(ctx, an, i, &mut po, &mut pfomask, out)?;
                last_arith_dst = Some((i, po.operands[0].clone()));
                delayed_flag_op = None;
            }

            Op::Imul if po.operands.len() == 3 => {
                return Err(ctx.ferr(i, "three-operand imul is unhandled"));
            }

            Op::Mul | Op::Imul => {
                assert_operand_cnt(ctx, i, &po, 1)?;
                match po.operands[0].lmod {
                    LenMod::Dword => {
                        let cast = if po.op == Op::Imul { "(s64)(s32)" } else { "(u64)" };
                        let src = out_src_opr_u32(ctx, i, &po, &po.operands[0])?;
                        let _ = writeln!(out, "  tmp64 = {}eax * {}{};", cast, cast, src);
                        out.push_str("  edx = tmp64 >> 32;\n");
                        out.push_str("  eax = tmp64;");
                    }
                    LenMod::Byte => {
                        let cast = if po.op == Op::Imul { "(s16)(s8)" } else { "(u16)(u8)" };
                        let src = out_src_opr(ctx, i, &po, &po.operands[0], cast, false)?;
                        let _ = write!(out, "  LOWORD(eax) = {}eax * {};", cast, src);
                    }
                    _ => return Err(ctx.ferr(i, "unhandled mul type")),
                }
                last_arith_dst = None;
                delayed_flag_op = None;
            }

            Op::Div | Op::Idiv => {
                assert_operand_cnt(ctx, i, &po, 1)?;
                if po.operands[0].lmod != LenMod::Dword {
                    return Err(ctx.ferr(i, "unhandled division width"));
                }

                let src = out_src_opr_u32(ctx, i, &po, &po.operands[0])?;
                let cast = lmod_cast(ctx, i, po.operands[0].lmod, po.op == Op::Idiv)?;
                let full = if po.flags.contains(InstFlags::BIT32) {
                    format!("{}eax", cast)
                } else {
                    out.push_str("  tmp64 = ((u64)edx << 32) | eax;\n");
                    format!("{}tmp64", if po.op == Op::Idiv { "(s64)" } else { "" })
                };

                if po.operands[0].kind == OprKind::Reg && po.operands[0].reg == Some(crate::ir::XDX)
                {
                    let _ = write!(out, "  eax = {} / {}{};", full, cast, src);
                    let _ = write!(out, "  edx = {} % {}{};\n", full, cast, src);
                } else {
                    let _ = write!(out, "  edx = {} % {}{};\n", full, cast, src);
                    let _ = write!(out, "  eax = {} / {}{};", full, cast, src);
                }
                last_arith_dst = None;
                delayed_flag_op = None;
            }

            Op::Test | Op::Cmp => {
                propagate_lmod(ctx, i, &mut po, 0, 1)?;
                if pfomask != 0 {
                    for fc in FLAG_CONDS {
                        if pfomask & fc.bit() != 0 {
                            let (cond, cmt) = out_cmp_test(ctx, i, &po, fc, false)?;
                            if let Some(c) = cmt {
                                comment.push_str(&c);
                            }
                            let _ = write!(out, "  cond_{} = {};", fc.name(), cond);
                        }
                    }
                    pfomask = 0;
                } else {
                    no_output = true;
                }
                last_arith_dst = None;
                delayed_flag_op = Some(i);
            }

            Op::Scc => {
                // SETcc - already handled above
            }

            Op::Jcc => {
                let _ = write!(out, "\n    goto {};", po.operands[0].name);
            }

            Op::Jecxz => {
                out.push_str("  if (ecx == 0)\n");
                let _ = write!(out, "    goto {};", po.operands[0].name);
                comment.push_str("jecxz");
            }

            Op::Loop => {
                out.push_str("  if (--ecx != 0)\n");
                let _ = write!(out, "    goto {};", po.operands[0].name);
                comment.push_str("loop");
            }

            Op::Jmp => {
                assert_operand_cnt(ctx, i, &po, 1)?;
                last_arith_dst = None;
                delayed_flag_op = None;

                if po.operands[0].kind == OprKind::RegMem {
                    let name = &po.operands[0].name;
                    let (tab, idx) = name
                        .find('[')
                        .and_then(|b| {
                            let idx_part = &name[b + 1..];
                            let end = idx_part.find('*')?;
                            Some((&name[..b], &idx_part[..end]))
                        })
                        .ok_or_else(|| {
                            ctx.ferr(i, format!("parse failure for jmp '{}'", name))
                        })?;
                    let _ = write!(out, "  goto *jt_{}[{}];", tab, idx);
                } else if po.operands[0].kind == OprKind::Label {
                    let _ = write!(out, "  goto {};", po.operands[0].name);
                } else {
                    return Err(ctx.ferr(i, "unhandled jmp type"));
                }
            }

            Op::Call => {
                assert_operand_cnt(ctx, i, &po, 1)?;
                emit_call(ctx, an, func_pp, i, &po, &mut comment, out)?;
                delayed_flag_op = None;
                last_arith_dst = None;
            }

            Op::Ret => {
                if func_pp.is_vararg {
                    out.push_str("  va_end(ap);\n");
                }
                if func_pp.has_retreg {
                    for arg in &func_pp.args {
                        if arg.type_.is_retreg {
                            let reg = arg.reg.as_deref().unwrap_or("");
                            let _ = writeln!(out, "  *r_{} = {};", reg, reg);
                        }
                    }
                }

                if func_pp.ret_type.name == "void" {
                    if i != opcnt - 1 || label_pending {
                        out.push_str("  return;");
                    } else {
                        no_output = true;
                    }
                } else if func_pp.ret_type.is_ptr {
                    let _ = write!(out, "  return ({})eax;", func_pp.ret_type.name);
                } else if func_pp.ret_type.name == "__int64" {
                    out.push_str("  return ((u64)edx << 32) | eax;");
                } else {
                    out.push_str("  return eax;");
                }

                last_arith_dst = None;
                delayed_flag_op = None;
            }

            Op::Push => {
                let src = out_src_opr_u32(ctx, i, &po, &po.operands[0])?;
                if po.p_argnum != 0 {
                    // special case: saved func arg
                    let _ = write!(
                        out,
                        "  {} = {};",
                        saved_arg_name(po.p_arggrp, po.p_argnum),
                        src
                    );
                } else if po.flags.contains(InstFlags::RSAVE) {
                    let _ = write!(out, "  s_{} = {};", src, src);
                } else if func_pp.is_userstack {
                    let _ = write!(out, "  *(--esp) = {};", src);
                } else if noreturn_attr_push_ok(ctx) {
                    no_output = true;
                } else {
                    return Err(ctx.ferr(i, "stray push encountered"));
                }
            }

            Op::Pop => {
                if po.flags.contains(InstFlags::RSAVE) {
                    let mut o0 = po.operands[0].clone();
                    let dst = out_dst_opr(ctx, i, &po, &mut o0)?;
                    po.operands[0] = o0;
                    let _ = write!(out, "  {} = s_{};", dst, dst);
                } else if let Some(push_i) = po.pair_push {
                    // push/pop pair
                    let push_op = ctx.ops[push_i].clone();
                    let mut o0 = po.operands[0].clone();
                    let dst = out_dst_opr(ctx, i, &po, &mut o0)?;
                    po.operands[0] = o0;
                    let cast = default_cast_to(&po.operands[0]);
                    let src =
                        out_src_opr(ctx, push_i, &push_op, &push_op.operands[0], &cast, false)?;
                    let _ = write!(out, "  {} = {};", dst, src);
                } else if func_pp.is_userstack {
                    let mut o0 = po.operands[0].clone();
                    let dst = out_dst_opr(ctx, i, &po, &mut o0)?;
                    po.operands[0] = o0;
                    let _ = write!(out, "  {} = *esp++;", dst);
                } else {
                    return Err(ctx.ferr(i, "stray pop encountered"));
                }
            }

            Op::Nop => {
                no_output = true;
            }

            // mmx
            Op::Emms => {
                comment.push_str("(emms)");
            }

            _ => {
                return Err(ctx.ferr(i, "unhandled op type"));
            }
        }

        if !comment.is_empty() {
            let _ = write!(out, "  // {}", comment.trim_start());
            comment.clear();
            no_output = false;
        }
        if !no_output {
            out.push('\n');
        }

        // some sanity checking
        if po.flags.contains(InstFlags::REP)
            && !matches!(po.op, Op::Stos | Op::Movs | Op::Cmps | Op::Scas)
        {
            return Err(ctx.ferr(i, "unexpected rep"));
        }
        if po.flags.contains(InstFlags::REP)
            && !po.flags.intersects(InstFlags::REPZ | InstFlags::REPNZ)
            && matches!(po.op, Op::Cmps | Op::Scas)
        {
            return Err(ctx.ferr(i, "cmps/scas with plain rep"));
        }
        if po.flags.intersects(InstFlags::REPZ | InstFlags::REPNZ)
            && !matches!(po.op, Op::Cmps | Op::Scas)
        {
            return Err(ctx.ferr(i, "unexpected repz/repnz"));
        }

        if pfomask != 0 {
            return Err(ctx.ferr(i, format!("missed flag calc, pfomask={:x}", pfomask)));
        }

        // write the (possibly widened) operands back so later delayed
        // references see them
        ctx.ops[i] = po;
        let po = &ctx.ops[i];

        // check if the delayed flag stuff is still valid
        if let Some(dfo) = delayed_flag_op {
            if dfo != i && origin::is_any_opr_modified(&ctx.ops[dfo], po, false) {
                delayed_flag_op = None;
            }
        }

        if let Some((la_i, la_opr)) = &last_arith_dst {
            if *la_i != i && origin::is_opr_modified(la_opr, po) {
                last_arith_dst = None;
            }
        }

        label_pending = false;
    }

    Ok(())
}

fn noreturn_attr_push_ok(ctx: &FuncContext) -> bool {
    ctx.attrs.contains(crate::ir::FuncAttrs::NORETURN)
}

fn emit_dualop_arith(
    ctx: &FuncContext,
    _an: &FuncAnalysis,
    i: usize,
    po: &mut Inst,
    pfomask: &mut u32,
    out: &mut String,
) -> Result<(), TranslateError> {
    assert_operand_cnt(ctx, i, po, 2)?;
    let mut o0 = po.operands[0].clone();
    let dst = out_dst_opr(ctx, i, po, &mut o0)?;
    po.operands[0] = o0;
    let src = out_src_opr_u32(ctx, i, po, &po.operands[1])?;
    let _ = write!(out, "  {} {}= {};", dst, op_to_c(ctx, i, po)?, src);
    let fl = output_std_flags(ctx, i, po, pfomask, &dst)?;
    out.push_str(&fl);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn emit_call(
    ctx: &FuncContext,
    an: &FuncAnalysis,
    func_pp: &Proto,
    i: usize,
    po: &Inst,
    comment: &mut String,
    out: &mut String,
) -> Result<(), TranslateError> {
    let pp = po.pp.as_ref().ok_or_else(|| ctx.ferr(i, "NULL pp"))?;

    let mut indent = "  ".to_string();
    if po.flags.contains(InstFlags::CC) {
        // a conditional branch to another func is treated as a
        // conditional tailcall
        indent.push_str("  ");
        out.push_str(" {\n");
    }

    if pp.is_fptr && !pp.is_arg {
        let src = out_src_opr(ctx, i, po, &po.operands[0], "(void *)", false)?;
        let _ = writeln!(out, "{}{} = {};", indent, pp.name, src);
        if pp.is_unresolved {
            let _ = writeln!(
                out,
                "{}unresolved_call(\"{}:{}\", {});",
                indent, ctx.asm_file, po.asmln, pp.name
            );
        }
    }

    out.push_str(&indent);
    if pp.ret_type.name.contains("int64") {
        if po.flags.contains(InstFlags::TAIL) {
            return Err(ctx.ferr(i, "int64 and tail?"));
        }
        out.push_str("tmp64 = ");
    } else if pp.ret_type.name != "void" {
        if po.flags.contains(InstFlags::TAIL) {
            if func_pp.ret_type.name != "void" {
                out.push_str("return ");
                if func_pp.ret_type.is_ptr != pp.ret_type.is_ptr {
                    let _ = write!(out, "({})", func_pp.ret_type.name);
                }
            }
        } else if an.regmask & (1 << XAX) != 0 {
            out.push_str("eax = ");
            if pp.ret_type.is_ptr {
                out.push_str("(u32)");
            }
        }
    }

    if pp.name.is_empty() {
        return Err(ctx.ferr(i, "missing pp->name"));
    }
    let _ = write!(
        out,
        "{}{}(",
        pp.name,
        if pp.has_structarg { "_sa" } else { "" }
    );

    if po.flags.contains(InstFlags::ATAIL) {
        // reuse the incoming argument frame
        if pp.argc_stack != func_pp.argc_stack
            || (pp.argc_stack > 0 && pp.is_stdcall != func_pp.is_stdcall)
        {
            return Err(ctx.ferr(i, "incompatible tailcall"));
        }
        if func_pp.has_retreg {
            return Err(ctx.ferr(i, "retreg tailcall is unhandled"));
        }

        let mut host_j = 0usize;
        for (arg, parg) in pp.args.iter().enumerate() {
            if arg > 0 {
                out.push_str(", ");
            }
            let cast = if parg.type_.is_ptr {
                format!("({})", parg.type_.name)
            } else {
                String::new()
            };

            if let Some(reg) = &parg.reg {
                let _ = write!(out, "{}{}", cast, reg);
                continue;
            }
            // stack arg
            while host_j < func_pp.argc() && func_pp.args[host_j].reg.is_some() {
                host_j += 1;
            }
            let _ = write!(out, "{}a{}", cast, host_j + 1);
            host_j += 1;
        }
    } else {
        for (arg, parg) in pp.args.iter().enumerate() {
            if arg > 0 {
                out.push_str(", ");
            }
            let cast = if parg.type_.is_ptr {
                format!("({})", parg.type_.name)
            } else {
                String::new()
            };

            if let Some(reg) = &parg.reg {
                if parg.type_.is_retreg {
                    let _ = write!(out, "&{}", reg);
                } else {
                    let _ = write!(out, "{}{}", cast, reg);
                }
                continue;
            }

            // stack arg
            let push_i = parg
                .push_idx
                .ok_or_else(|| ctx.ferr(i, format!("parsed_op missing for arg{}", arg)))?;
            let push_op = &ctx.ops[push_i];

            if push_op.flags.contains(InstFlags::VAPUSH) {
                out.push_str("ap");
            } else if push_op.p_argpass != 0 {
                let _ = write!(out, "a{}", push_op.p_argpass);
            } else if push_op.p_argnum != 0 {
                let _ = write!(
                    out,
                    "{}{}",
                    cast,
                    saved_arg_name(push_op.p_arggrp, push_op.p_argnum)
                );
            } else {
                let src =
                    out_src_opr(ctx, push_i, push_op, &push_op.operands[0], &cast, false)?;
                out.push_str(&src);
            }
        }
    }
    out.push_str(");");

    if pp.ret_type.name.contains("int64") {
        out.push('\n');
        let _ = writeln!(out, "{}edx = tmp64 >> 32;", indent);
        let _ = write!(out, "{}eax = tmp64;", indent);
    }

    if pp.is_unresolved {
        let _ = write!(comment, " unresolved {}reg", pp.argc_reg);
    }

    if po.flags.contains(InstFlags::TAIL) {
        let mut bare_ret = false;
        if i == ctx.opcnt() - 1 || pp.is_noreturn {
            bare_ret = false;
        } else if pp.ret_type.name == "void" || func_pp.ret_type.name == "void" {
            bare_ret = true;
        }
        // else already handled as 'return f()'

        if bare_ret {
            if func_pp.ret_type.name != "void" {
                return Err(ctx.ferr(i, "int func -> void func tailcall?"));
            }
            let _ = write!(out, "\n{}return;", indent);
            comment.push_str(" ^ tailcall");
        } else {
            comment.push_str(" tailcall");
        }
    }
    if pp.is_noreturn {
        comment.push_str(" noreturn");
    }
    if po.flags.contains(InstFlags::ATAIL) && pp.argc_stack > 0 {
        comment.push_str(" argframe");
    }
    if po.flags.contains(InstFlags::CC) {
        comment.push_str(" cond");
    }

    if po.flags.contains(InstFlags::CC) {
        out.push_str("\n  }");
    }

    Ok(())
}
