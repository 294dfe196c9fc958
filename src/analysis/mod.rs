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

pub mod calls;
pub mod flow;
pub mod frame;
pub mod origin;

use std::cell::Cell;

use crate::errors::TranslateError;
use crate::header::{Proto, ProtoDb};
use crate::ir::{
    Equate, FuncAttrs, Inst, InstFlags, Op, Opr, OprKind, ParsedData, REGS_R32, XAX, XBP, XCX,
    XDX,
};
use crate::parser::operands::{equ_find, parse_stack_el};

pub const MAX_ARG_GRP: usize = 2;

/// All state the passes share for one procedure. Constructed by the driver
/// per `proc..endp` block and dropped after rendering.
pub struct FuncContext<'a> {
    pub asm_file: String,
    pub name: String,
    pub ops: Vec<Inst>,
    pub labels: Vec<Option<String>>,
    pub label_refs: Vec<Vec<usize>>,
    pub equs: Vec<Equate>,
    pub func_pd: Vec<ParsedData>,
    pub func_pp: Option<Proto>,
    pub attrs: FuncAttrs,
    pub bp_frame: bool,
    pub sp_frame: bool,
    pub stack_fsz: i32,
    pub stack_frame_used: Cell<bool>,
    pub allow_regfunc: bool,
    pub protos: &'a ProtoDb,
}

/// Aggregates the analyzer results the renderer needs for declarations.
#[derive(Debug, Default, Clone)]
pub struct FuncAnalysis {
    pub regmask: u32,
    pub regmask_init: u32,
    pub regmask_save: u32,
    pub regmask_arg: u32,
    pub save_arg_vars: [u32; MAX_ARG_GRP],
    pub cond_vars: u32,
    pub need_tmp_var: bool,
    pub need_tmp64: bool,
}

impl<'a> FuncContext<'a> {
    pub fn new(asm_file: &str, name: &str, protos: &'a ProtoDb, allow_regfunc: bool) -> Self {
        FuncContext {
            asm_file: asm_file.to_string(),
            name: name.to_string(),
            ops: Vec::new(),
            labels: Vec::new(),
            label_refs: Vec::new(),
            equs: Vec::new(),
            func_pd: Vec::new(),
            func_pp: None,
            attrs: FuncAttrs::empty(),
            bp_frame: false,
            sp_frame: false,
            stack_fsz: 0,
            stack_frame_used: Cell::new(false),
            allow_regfunc,
            protos,
        }
    }

    pub fn opcnt(&self) -> usize {
        self.ops.len()
    }

    pub fn ferr(&self, i: usize, reason: impl Into<String>) -> TranslateError {
        let (line, op) = match self.ops.get(i) {
            Some(po) => (po.asmln, po.dump()),
            None => (0, "???".to_string()),
        };
        TranslateError::AnalysisError {
            file: self.asm_file.clone(),
            line,
            func: self.name.clone(),
            op,
            reason: reason.into(),
        }
    }

    pub fn func_pp(&self) -> Result<&Proto, TranslateError> {
        self.func_pp
            .as_ref()
            .ok_or_else(|| self.ferr(0, "missing function prototype"))
    }

    pub fn add_label_ref(&mut self, label_i: usize, op_i: usize) {
        self.label_refs[label_i].push(op_i);
    }

    pub fn is_stack_access(&self, po: &Inst, popr: &Opr) -> bool {
        parse_stack_el(&popr.name, false, self.bp_frame).is_some()
            || (self.bp_frame
                && !po.flags.contains(InstFlags::EBP_S)
                && popr.name.starts_with("ebp"))
    }

    /// Decompose a stack access expression into `(offset, stack_ra,
    /// ofs_reg, bp_arg)`. `bp_arg` is the symbolic equate name, kept for
    /// the output comment.
    pub fn parse_stack_access(
        &self,
        po_i: usize,
        name: &str,
        is_lea: bool,
    ) -> Result<(i32, i32, Option<String>, String), TranslateError> {
        let mut ofs_reg = None;
        let mut bp_arg = String::new();
        let offset;

        let direct = name.strip_prefix("ebp-").map(|r| (r, true)).or_else(|| {
            name.strip_prefix("ebp+")
                .filter(|r| r.starts_with(|c: char| c.is_ascii_digit()))
                .map(|r| (r, false))
        });

        if let Some((rest, neg)) = direct {
            let num = rest.strip_prefix("0x").unwrap_or(rest);
            let val = i64::from_str_radix(num, 16)
                .map_err(|_| self.ferr(po_i, format!("ebp- parse of '{}' failed", name)))?;
            offset = if neg { -(val as i32) } else { val as i32 };
        } else {
            let el = parse_stack_el(name, false, self.bp_frame)
                .ok_or_else(|| self.ferr(po_i, format!("stack el parse of '{}' failed", name)))?;
            let (eq, extra) = equ_find(&self.equs, &el.name)
                .ok_or_else(|| self.ferr(po_i, "detected but missing eq"))?;
            bp_arg = el.name.clone();
            ofs_reg = el.extra_reg;
            offset = eq.offset + extra;
        }

        let stack_ra = if name.starts_with("ebp") { 4 } else { 0 };

        // it sometimes LEAs the return address slot for compares
        if !is_lea && ofs_reg.is_none() && stack_ra <= offset && offset < stack_ra + 4 {
            return Err(self.ferr(po_i, format!("reference to ra? {} {}", offset, stack_ra)));
        }

        Ok((offset, stack_ra, ofs_reg, bp_arg))
    }
}

/// Register mask over the host function's register arguments.
fn regmask_for_args(ctx: &FuncContext, pp: &Proto) -> Result<u32, TranslateError> {
    let mut mask = 0u32;
    for arg in &pp.args {
        if let Some(reg) = &arg.reg {
            let i = REGS_R32
                .iter()
                .position(|r| r == reg)
                .ok_or_else(|| ctx.ferr(0, format!("arg '{}' is not a reg?", reg)))?;
            mask |= 1 << i;
        }
    }
    Ok(mask)
}

/// Run the full per-function pass sequence; the returned summary feeds the
/// renderer's declaration block.
pub fn analyze(ctx: &mut FuncContext) -> Result<FuncAnalysis, TranslateError> {
    let mut an = FuncAnalysis::default();

    let pp = ctx
        .protos
        .lookup(&ctx.name)
        .cloned()
        .ok_or_else(|| ctx.ferr(0, format!("proto_parse failed for '{}'", ctx.name)))?;
    an.regmask_arg = regmask_for_args(ctx, &pp)?;
    ctx.func_pp = Some(pp);

    frame::classify_frame(ctx)?;
    flow::resolve_branches(ctx)?;
    calls::process_calls(ctx, &mut an)?;
    analyze_flow(ctx, &mut an)?;
    confirm_reg_saves(ctx, &mut an);

    Ok(an)
}

// pass4:
// - find POPs for PUSHes, rm both
// - scan for STD/CLD, propagate DF
// - scan for all used registers
// - find flag set ops for their users
// - do unresolved calls
fn analyze_flow(ctx: &mut FuncContext, an: &mut FuncAnalysis) -> Result<(), TranslateError> {
    let opcnt = ctx.opcnt();

    for i in 0..opcnt {
        if ctx.ops[i].flags.contains(InstFlags::RMD) {
            continue;
        }

        if ctx.ops[i].op == Op::Push && ctx.ops[i].flags.contains(InstFlags::RSAVE) {
            let reg = ctx.ops[i].operands[0]
                .reg
                .ok_or_else(|| ctx.ferr(i, "reg not set for push?"))?;
            if an.regmask & (1 << reg) == 0 {
                // not a reg save after all, rerun scan_for_pop
                ctx.ops[i].flags.remove(InstFlags::RSAVE);
            } else {
                an.regmask_save |= 1 << reg;
            }
        }

        let userstack = ctx.func_pp()?.is_userstack;
        if ctx.ops[i].op == Op::Push
            && ctx.ops[i].p_argnum == 0
            && !ctx.ops[i].flags.contains(InstFlags::RSAVE)
            && !userstack
        {
            match ctx.ops[i].operands[0].kind {
                OprKind::Reg => {
                    let reg = ctx.ops[i].operands[0]
                        .reg
                        .ok_or_else(|| ctx.ferr(i, "reg not set for push?"))?;
                    let reg_name = ctx.ops[i].operands[0].name.clone();

                    let mut depth = 0;
                    let ret = flow::scan_for_pop(
                        ctx,
                        i + 1,
                        &reg_name,
                        (i + opcnt * 3) as u32,
                        0,
                        &mut depth,
                        false,
                    )?;
                    if ret == 1 {
                        if depth > 1 {
                            return Err(ctx.ferr(i, format!("too much depth: {}", depth)));
                        }
                        ctx.ops[i].flags.insert(InstFlags::RMD);
                        flow::scan_for_pop(
                            ctx,
                            i + 1,
                            &reg_name,
                            (i + opcnt * 4) as u32,
                            0,
                            &mut depth,
                            true,
                        )?;
                        continue;
                    }
                    let ret = flow::scan_for_pop_ret(ctx, i + 1, &reg_name, InstFlags::empty());
                    if ret == 0 {
                        let mut flag = InstFlags::RMD;
                        if an.regmask & (1 << reg) != 0 {
                            if an.regmask_save & (1 << reg) != 0 {
                                return Err(
                                    ctx.ferr(i, format!("{} already saved?", reg_name))
                                );
                            }
                            flag = InstFlags::RSAVE;
                        }
                        ctx.ops[i].flags.insert(flag);
                        flow::scan_for_pop_ret(ctx, i + 1, &reg_name, flag);
                        continue;
                    }
                }
                OprKind::Const => {
                    for j in i + 1..opcnt {
                        if ctx.ops[j]
                            .flags
                            .intersects(InstFlags::JMP | InstFlags::TAIL | InstFlags::RSAVE)
                            || ctx.ops[j].op == Op::Push
                            || ctx.labels[j].is_some()
                        {
                            break;
                        }
                        if !ctx.ops[j].flags.contains(InstFlags::RMD) && ctx.ops[j].op == Op::Pop
                        {
                            ctx.ops[i].flags.insert(InstFlags::RMD);
                            ctx.ops[j].pair_push = Some(i);
                            break;
                        }
                    }
                }
                _ => {}
            }
        }

        if ctx.ops[i].op == Op::Std {
            ctx.ops[i].flags.insert(InstFlags::DF | InstFlags::RMD);
            flow::scan_propagate_df(ctx, i + 1)?;
        }

        let mut regmask_now = ctx.ops[i].regmask_src | ctx.ops[i].regmask_dst;
        if regmask_now & (1 << XBP) != 0 && ctx.bp_frame
            && !ctx.ops[i].flags.contains(InstFlags::EBP_S)
        {
            if ctx.ops[i].regmask_dst & (1 << XBP) != 0 {
                // compiler decided to drop the bp frame and use ebp as
                // scratch from here on
                flow::scan_fwd_set_flags(ctx, i + 1, (i + opcnt * 5) as u32, InstFlags::EBP_S);
            } else {
                regmask_now &= !(1 << XBP);
            }
        }
        an.regmask |= regmask_now;

        if ctx.ops[i].flags.contains(InstFlags::CC) {
            trace_flag_setters(ctx, an, i)?;
        }

        match ctx.ops[i].op {
            Op::Cmps | Op::Scas => {
                an.cond_vars |= crate::ir::FlagCond::Z.bit();
            }
            Op::Mul => {
                if ctx.ops[i].operands[0].lmod == crate::ir::LenMod::Dword {
                    an.need_tmp64 = true;
                }
            }
            Op::Imul if ctx.ops[i].operands.len() == 1 => {
                if ctx.ops[i].operands[0].lmod == crate::ir::LenMod::Dword {
                    an.need_tmp64 = true;
                }
            }
            Op::Call => {
                finish_call(ctx, an, i)?;
            }
            Op::Mov => {
                check_fptr_assign(ctx, i)?;
            }
            Op::Ret => {
                if ctx.func_pp()?.ret_type.name != "void" {
                    an.regmask |= 1 << XAX;
                }
            }
            Op::Div | Op::Idiv => {
                // 32bit division is common, look for it
                let ret = if ctx.ops[i].op == Op::Div {
                    flow::scan_for_reg_clear(ctx, i, XDX)
                } else {
                    flow::scan_for_cdq_edx(ctx, i)
                };
                if ret.is_some() {
                    ctx.ops[i].flags.insert(InstFlags::BIT32);
                } else {
                    an.need_tmp64 = true;
                }
            }
            Op::Cld => {
                ctx.ops[i].flags.insert(InstFlags::RMD);
            }
            _ => {}
        }

        if matches!(ctx.ops[i].op, Op::Rcl | Op::Rcr | Op::Xchg) {
            an.need_tmp_var = true;
        }
    }

    Ok(())
}

fn trace_flag_setters(
    ctx: &mut FuncContext,
    an: &mut FuncAnalysis,
    i: usize,
) -> Result<(), TranslateError> {
    let opcnt = ctx.opcnt();
    let mut branched = false;
    let mut setters = Vec::new();

    let ret = flow::scan_for_flag_set(
        ctx,
        i as isize,
        (i + opcnt * 6) as u32,
        &mut branched,
        &mut setters,
    )?;
    if ret < 0 || setters.is_empty() {
        return Err(ctx.ferr(i, "unable to trace flag setter(s)"));
    }
    if setters.len() > 16 {
        return Err(ctx.ferr(i, "too many flag setters"));
    }

    let pfo = ctx.ops[i]
        .pfo
        .ok_or_else(|| ctx.ferr(i, "CC op without pfo"))?;

    for &setter in &setters {
        let mut pfomask = 0u32;

        // to get nicer code we try to delay test and cmp; when operand
        // modification, an arith op, or a branch join gets in the way the
        // flag is calculated explicitly instead
        let s_op = ctx.ops[setter].op;
        match s_op {
            Op::Test | Op::Cmp => {
                if branched || origin::scan_for_mod(ctx, setter, setter + 1, i, false).is_some() {
                    pfomask = pfo.bit();
                }
            }
            Op::Cmps | Op::Scas => {
                pfomask = pfo.bit();
            }
            _ => {
                // see if it can be handled based on the op result
                use crate::ir::FlagCond as PF;
                if (s_op != Op::And
                    && s_op != Op::Or
                    && pfo != PF::Z
                    && pfo != PF::S
                    && pfo != PF::P)
                    || branched
                    || origin::scan_for_mod_opr0(ctx, setter, setter + 1, i).is_some()
                {
                    pfomask = pfo.bit();
                }

                if s_op == Op::Add && pfo == PF::C {
                    let (l0, l1) = {
                        let po = &ctx.ops[setter];
                        (po.operands[0].lmod, po.operands[1].lmod)
                    };
                    let lmod = propagate_lmod_pair(ctx, setter, l0, l1)?;
                    if lmod == crate::ir::LenMod::Dword {
                        an.need_tmp64 = true;
                    }
                }
            }
        }
        if pfomask != 0 {
            ctx.ops[setter].pfomask |= pfomask;
            an.cond_vars |= pfomask;
        }
        // the last setter wins; currently not a problem
        ctx.ops[i].flag_setter = Some(setter);
    }

    if matches!(ctx.ops[i].op, Op::Rcl | Op::Rcr | Op::Adc | Op::Sbb) {
        an.cond_vars |= crate::ir::FlagCond::C.bit();
    }

    Ok(())
}

// widen both operands of `setter` to a common lmod, in place
fn propagate_lmod_pair(
    ctx: &mut FuncContext,
    i: usize,
    l0: crate::ir::LenMod,
    l1: crate::ir::LenMod,
) -> Result<crate::ir::LenMod, TranslateError> {
    use crate::ir::LenMod;
    if l0 == LenMod::Unspec && l1 == LenMod::Unspec {
        return Err(ctx.ferr(i, "missing lmod for both operands"));
    }
    let lmod = if l0 == LenMod::Unspec { l1 } else { l0 };
    ctx.ops[i].operands[0].lmod = lmod;
    ctx.ops[i].operands[1].lmod = lmod;
    Ok(lmod)
}

// fastcall synthesis plus register-arg bookkeeping for one call site
fn finish_call(ctx: &mut FuncContext, an: &mut FuncAnalysis, i: usize) -> Result<(), TranslateError> {
    let opcnt = ctx.opcnt();

    let is_unresolved = ctx.ops[i]
        .pp
        .as_ref()
        .ok_or_else(|| ctx.ferr(i, "NULL pp"))?
        .is_unresolved;

    if is_unresolved {
        let mut save_arg_vars = an.save_arg_vars;
        let mut regmask = an.regmask;
        calls::collect_call_args(
            ctx,
            i,
            &mut regmask,
            &mut save_arg_vars,
            (i + opcnt * 2) as u32,
        )?;
        an.regmask = regmask;
        an.save_arg_vars = save_arg_vars;

        // rough guess: see if ecx and edx were pushed (and not their saved
        // versions)
        let mut regmask_stack = 0u32;
        {
            let pp = ctx.ops[i].pp.as_ref().ok_or_else(|| ctx.ferr(i, "NULL pp"))?;
            for arg in &pp.args {
                if arg.reg.is_some() {
                    continue;
                }
                let push_i = arg
                    .push_idx
                    .ok_or_else(|| ctx.ferr(i, "parsed_op missing for arg"))?;
                let push = &ctx.ops[push_i];
                if push.p_argnum == 0 && push.operands[0].kind == OprKind::Reg {
                    if let Some(r) = push.operands[0].reg {
                        regmask_stack |= 1 << r;
                    }
                }
            }
        }

        if regmask_stack & ((1 << XCX) | (1 << XDX)) != (1 << XCX) | (1 << XDX) {
            let argc_stack = ctx.ops[i].pp.as_ref().map(|p| p.argc_stack).unwrap_or(0);
            let live = an.regmask | an.regmask_arg;
            if argc_stack != 0 || live & ((1 << XCX) | (1 << XDX)) != 0 {
                if let Some(pp) = ctx.ops[i].pp.as_mut() {
                    calls::pp_insert_reg_arg(pp, "ecx");
                    pp.is_fastcall = true;
                }
                an.regmask_init |= 1 << XCX;
                an.regmask |= 1 << XCX;
            }
            if argc_stack != 0 || live & (1 << XDX) != 0 {
                if let Some(pp) = ctx.ops[i].pp.as_mut() {
                    calls::pp_insert_reg_arg(pp, "edx");
                }
                an.regmask_init |= 1 << XDX;
                an.regmask |= 1 << XDX;
            }
        }

        // __cdecl doesn't fall into the unresolved category
        if let Some(pp) = ctx.ops[i].pp.as_mut() {
            if pp.argc_stack > 0 {
                pp.is_stdcall = true;
            }
        }
    }

    // register args must exist as locals even when nothing else uses them
    let reg_args: Vec<String> = {
        let pp = ctx.ops[i].pp.as_ref().ok_or_else(|| ctx.ferr(i, "NULL pp"))?;
        pp.args.iter().filter_map(|a| a.reg.clone()).collect()
    };
    for reg in reg_args {
        let r = REGS_R32
            .iter()
            .position(|n| *n == reg)
            .ok_or_else(|| ctx.ferr(i, format!("arg '{}' is not a reg?", reg)))?;
        if an.regmask & (1 << r) == 0 {
            an.regmask_init |= 1 << r;
            an.regmask |= 1 << r;
        }
    }

    Ok(())
}

// <var> = offset <something>: declared fptr type must match the function
fn check_fptr_assign(ctx: &FuncContext, i: usize) -> Result<(), TranslateError> {
    let po = &ctx.ops[i];
    if po.operands.len() != 2 {
        return Ok(());
    }
    let (dst_pp, src_pp) = match (&po.operands[0].pp, &po.operands[1].pp) {
        (Some(d), Some(s)) => (d, s),
        _ => return Ok(()),
    };
    if (src_pp.is_func || src_pp.is_fptr) && !po.operands[1].name.starts_with("off_") {
        if !dst_pp.is_fptr {
            return Err(ctx.ferr(
                i,
                format!("{} not declared as fptr when it should be", po.operands[0].name),
            ));
        }
        if !dst_pp.matches_func(src_pp) {
            log::info!("var:  {}", dst_pp.print());
            log::info!("func: {}", src_pp.print());
            return Err(ctx.ferr(i, "fptr prototype mismatch"));
        }
    }
    Ok(())
}

// pass5: confirm the save set, it may have been reduced
fn confirm_reg_saves(ctx: &FuncContext, an: &mut FuncAnalysis) {
    if an.regmask_save == 0 {
        return;
    }
    an.regmask_save = 0;
    for po in &ctx.ops {
        if po.flags.contains(InstFlags::RMD) {
            continue;
        }
        if po.op == Op::Push && po.flags.contains(InstFlags::RSAVE) {
            if let Some(r) = po.operands[0].reg {
                an.regmask_save |= 1 << r;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stack_access_direct() {
        let db = ProtoDb::default();
        let mut ctx = FuncContext::new("t.asm", "f", &db, false);
        ctx.bp_frame = true;
        ctx.ops.push(Inst::default());
        let (offset, stack_ra, ofs_reg, _) = ctx.parse_stack_access(0, "ebp+8", false).unwrap();
        assert_eq!(offset, 8);
        assert_eq!(stack_ra, 4);
        assert!(ofs_reg.is_none());
    }

    #[test]
    fn test_parse_stack_access_equ() {
        let db = ProtoDb::default();
        let mut ctx = FuncContext::new("t.asm", "f", &db, false);
        ctx.bp_frame = true;
        ctx.ops.push(Inst::default());
        ctx.equs.push(Equate {
            name: "var_8".to_string(),
            lmod: crate::ir::LenMod::Dword,
            offset: -8,
        });
        let (offset, stack_ra, _, bp_arg) =
            ctx.parse_stack_access(0, "ebp+var_8", false).unwrap();
        assert_eq!(offset, -8);
        assert_eq!(stack_ra, 4);
        assert_eq!(bp_arg, "var_8");
    }

    #[test]
    fn test_ra_reference_rejected() {
        let db = ProtoDb::default();
        let mut ctx = FuncContext::new("t.asm", "f", &db, false);
        ctx.bp_frame = true;
        ctx.ops.push(Inst::default());
        assert!(ctx.parse_stack_access(0, "ebp+4", false).is_err());
    }
}
