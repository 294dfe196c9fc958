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
use crate::codegen::stack::stack_frame_access;
use crate::errors::TranslateError;
use crate::ir::{FlagCond, Inst, LenMod, Op, Opr, OprKind, REGS_R32};
use crate::parser::printf_number;

pub fn lmod_type_u(ctx: &FuncContext, po_i: usize, lmod: LenMod) -> Result<&'static str, TranslateError> {
    match lmod {
        LenMod::Qword => Ok("u64"),
        LenMod::Dword => Ok("u32"),
        LenMod::Word => Ok("u16"),
        LenMod::Byte => Ok("u8"),
        LenMod::Unspec => Err(ctx.ferr(po_i, "invalid lmod")),
    }
}

pub fn lmod_cast_u(ctx: &FuncContext, po_i: usize, lmod: LenMod) -> Result<&'static str, TranslateError> {
    match lmod {
        LenMod::Qword | LenMod::Dword => Ok(""),
        LenMod::Word => Ok("(u16)"),
        LenMod::Byte => Ok("(u8)"),
        LenMod::Unspec => Err(ctx.ferr(po_i, "invalid lmod")),
    }
}

pub fn lmod_cast_u_ptr(
    ctx: &FuncContext,
    po_i: usize,
    lmod: LenMod,
) -> Result<&'static str, TranslateError> {
    match lmod {
        LenMod::Qword => Ok("*(u64 *)"),
        LenMod::Dword => Ok("*(u32 *)"),
        LenMod::Word => Ok("*(u16 *)"),
        LenMod::Byte => Ok("*(u8 *)"),
        LenMod::Unspec => Err(ctx.ferr(po_i, "invalid lmod")),
    }
}

pub fn lmod_cast_s(ctx: &FuncContext, po_i: usize, lmod: LenMod) -> Result<&'static str, TranslateError> {
    match lmod {
        LenMod::Qword => Ok("(s64)"),
        LenMod::Dword => Ok("(s32)"),
        LenMod::Word => Ok("(s16)"),
        LenMod::Byte => Ok("(s8)"),
        LenMod::Unspec => Err(ctx.ferr(po_i, "invalid lmod")),
    }
}

pub fn lmod_cast(
    ctx: &FuncContext,
    po_i: usize,
    lmod: LenMod,
    is_signed: bool,
) -> Result<&'static str, TranslateError> {
    if is_signed {
        lmod_cast_s(ctx, po_i, lmod)
    } else {
        lmod_cast_u(ctx, po_i, lmod)
    }
}

pub fn lmod_bytes(ctx: &FuncContext, po_i: usize, lmod: LenMod) -> Result<u32, TranslateError> {
    lmod.bytes().ok_or_else(|| ctx.ferr(po_i, "invalid lmod"))
}

/// Collapse redundant cast pairs; `cast1` is the final cast.
pub fn simplify_cast(cast1: &str, cast2: &str) -> String {
    if cast1.is_empty() {
        return cast2.to_string();
    }
    if cast2.is_empty() {
        return cast1.to_string();
    }
    if cast1 == cast2 {
        return cast1.to_string();
    }
    if cast1 == "(s8)" && cast2 == "(u8)" {
        return cast1.to_string();
    }
    if cast1 == "(s16)" && cast2 == "(u16)" {
        return cast1.to_string();
    }
    if cast1 == "(u8)" && cast2.starts_with("*(u8 *)") {
        return cast2.to_string();
    }
    if cast1 == "(u16)" && cast2.starts_with("*(u16 *)") {
        return cast2.to_string();
    }
    if cast1.contains('*') && cast2.starts_with("(u32)") {
        return cast1.to_string();
    }

    format!("{}{}", cast1, cast2)
}

/// Drop the cast when the constant already fits the narrower type.
pub fn simplify_cast_num(cast: &str, val: u32) -> String {
    let fits = match cast {
        "(u8)" => val < 0x100,
        "(s8)" => val < 0x80,
        "(u16)" => val < 0x10000,
        "(s16)" => val < 0x8000,
        "(s32)" => val < 0x8000_0000,
        _ => false,
    };
    if fits {
        String::new()
    } else {
        cast.to_string()
    }
}

/// The cast a pointer-typed destination imposes on its source.
pub fn default_cast_to(opr: &Opr) -> String {
    if !opr.is_ptr {
        return String::new();
    }
    match &opr.pp {
        Some(pp) if !pp.ret_type.name.is_empty() && !pp.is_fptr => {
            format!("({})", pp.ret_type.name)
        }
        _ => "(void *)".to_string(),
    }
}

fn opr_reg_name(
    ctx: &FuncContext,
    po_i: usize,
    popr: &Opr,
) -> Result<&'static str, TranslateError> {
    let reg = popr
        .reg
        .filter(|r| *r < REGS_R32.len())
        .ok_or_else(|| ctx.ferr(po_i, format!("invalid reg: {:?}", popr.reg)))?;
    Ok(REGS_R32[reg])
}

// every label read must resolve against the header
fn check_label_read_ref(
    ctx: &FuncContext,
    po_i: usize,
    name: &str,
) -> Result<String, TranslateError> {
    let pp = ctx
        .protos
        .lookup(name)
        .ok_or_else(|| ctx.ferr(po_i, format!("proto_parse failed for ref '{}'", name)))?;
    if pp.is_func {
        check_func_pp(ctx, po_i, pp, "ref")?;
    }
    Ok(pp.name.clone())
}

/// Render an operand as a C rvalue with the requested cast.
pub fn out_src_opr(
    ctx: &FuncContext,
    po_i: usize,
    po: &Inst,
    popr: &Opr,
    cast: &str,
    is_lea: bool,
) -> Result<String, TranslateError> {
    match popr.kind {
        OprKind::Reg => {
            if is_lea {
                return Err(ctx.ferr(po_i, "lea from reg?"));
            }
            let reg = opr_reg_name(ctx, po_i, popr)?;
            Ok(match popr.lmod {
                LenMod::Qword => format!("{}{}.q", cast, reg),
                LenMod::Dword => format!("{}{}", cast, reg),
                LenMod::Word => format!("{}{}", simplify_cast(cast, "(u16)"), reg),
                LenMod::Byte => {
                    if popr.name.as_bytes().get(1) == Some(&b'h') {
                        format!("{}({} >> 8)", simplify_cast(cast, "(u8)"), reg)
                    } else {
                        format!("{}{}", simplify_cast(cast, "(u8)"), reg)
                    }
                }
                LenMod::Unspec => return Err(ctx.ferr(po_i, "invalid src lmod")),
            })
        }

        OprKind::RegMem => {
            if ctx.is_stack_access(po, popr) {
                let access = stack_frame_access(ctx, po_i, popr, cast, true, is_lea)?;
                return Ok(access.text);
            }

            let mut expr = popr.name.clone();
            if let Some(b) = expr.find('[') {
                // '[' can only be left over from the label[reg] form
                let close = expr
                    .rfind(']')
                    .ok_or_else(|| ctx.ferr(po_i, format!("parse failure for '{}'", expr)))?;
                let mut base = expr[..b].to_string();
                let index = expr[b + 1..close].to_string();
                if base.starts_with('(') {
                    // (off_4FFF50+3)[eax]
                    let inner = base
                        .strip_prefix('(')
                        .and_then(|s| s.strip_suffix(')'))
                        .ok_or_else(|| {
                            ctx.ferr(po_i, format!("parse failure (2) for '{}'", expr))
                        })?;
                    base = inner.to_string();
                }
                expr = format!("(u32)&{} + {}", base, index);
            }

            if is_lea {
                return Ok(expr);
            }

            let ptr_cast = lmod_cast_u_ptr(ctx, po_i, popr.lmod)?;
            Ok(format!("{}({})", simplify_cast(cast, ptr_cast), expr))
        }

        OprKind::Label => {
            let name = check_label_read_ref(ctx, po_i, &popr.name)?;
            let cast = if cast.is_empty() && popr.is_ptr {
                "(u32)"
            } else {
                cast
            };

            if is_lea {
                Ok(format!("(u32)&{}", name))
            } else if popr.size_lt {
                Ok(format!(
                    "{}{}{}{}",
                    cast,
                    lmod_cast_u_ptr(ctx, po_i, popr.lmod)?,
                    if popr.is_array { "" } else { "&" },
                    name
                ))
            } else {
                Ok(format!(
                    "{}{}{}",
                    cast,
                    name,
                    if popr.is_array { "[0]" } else { "" }
                ))
            }
        }

        OprKind::Offset => {
            let name = check_label_read_ref(ctx, po_i, &popr.name)?;
            if is_lea {
                return Err(ctx.ferr(po_i, "lea an offset?"));
            }
            let cast = if cast.is_empty() { "(u32)" } else { cast };
            Ok(format!("{}&{}", cast, name))
        }

        OprKind::Const => {
            if is_lea {
                return Err(ctx.ferr(po_i, "lea from const?"));
            }
            if popr.val == 0 && cast.contains('*') {
                return Ok("NULL".to_string());
            }
            Ok(format!(
                "{}{}",
                simplify_cast_num(cast, popr.val),
                printf_number(popr.val)
            ))
        }

        OprKind::Unspec => Err(ctx.ferr(po_i, "invalid src type")),
    }
}

pub fn out_src_opr_u32(
    ctx: &FuncContext,
    po_i: usize,
    po: &Inst,
    popr: &Opr,
) -> Result<String, TranslateError> {
    out_src_opr(ctx, po_i, po, popr, "", false)
}

/// Render an operand as a C lvalue. May set `is_ptr` (found out late for
/// ebp-frame argument accesses).
pub fn out_dst_opr(
    ctx: &FuncContext,
    po_i: usize,
    po: &Inst,
    popr: &mut Opr,
) -> Result<String, TranslateError> {
    match popr.kind {
        OprKind::Reg => {
            let reg = opr_reg_name(ctx, po_i, popr)?;
            Ok(match popr.lmod {
                LenMod::Qword => format!("{}.q", reg),
                LenMod::Dword => reg.to_string(),
                LenMod::Word => format!("LOWORD({})", reg),
                LenMod::Byte => {
                    if popr.name.as_bytes().get(1) == Some(&b'h') {
                        format!("BYTE1({})", reg)
                    } else {
                        format!("LOBYTE({})", reg)
                    }
                }
                LenMod::Unspec => return Err(ctx.ferr(po_i, "invalid dst lmod")),
            })
        }

        OprKind::RegMem => {
            if ctx.is_stack_access(po, popr) {
                let access = stack_frame_access(ctx, po_i, popr, "", false, false)?;
                if let Some(is_ptr) = access.set_is_ptr {
                    popr.is_ptr = is_ptr;
                }
                return Ok(access.text);
            }
            out_src_opr(ctx, po_i, po, popr, "", false)
        }

        OprKind::Label => {
            if popr.size_mismatch {
                Ok(format!(
                    "{}{}{}",
                    lmod_cast_u_ptr(ctx, po_i, popr.lmod)?,
                    if popr.is_array { "" } else { "&" },
                    popr.name
                ))
            } else {
                Ok(format!(
                    "{}{}",
                    popr.name,
                    if popr.is_array { "[0]" } else { "" }
                ))
            }
        }

        _ => Err(ctx.ferr(po_i, "invalid dst type")),
    }
}

/// Condition expression over the result of a test-like op.
pub fn out_test_for_cc(
    ctx: &FuncContext,
    po_i: usize,
    pfo: FlagCond,
    is_inv: bool,
    lmod: LenMod,
    expr: &str,
) -> Result<String, TranslateError> {
    let cast = lmod_cast_u(ctx, po_i, lmod)?;
    let scast = lmod_cast_s(ctx, po_i, lmod)?;

    match pfo {
        FlagCond::Z | FlagCond::Be => Ok(format!(
            "({}{} {} 0)",
            cast,
            expr,
            if is_inv { "!=" } else { "==" }
        )),
        FlagCond::S | FlagCond::L => Ok(format!(
            "({}{} {} 0)",
            scast,
            expr,
            if is_inv { ">=" } else { "<" }
        )),
        FlagCond::Le => Ok(format!(
            "({}{} {} 0)",
            scast,
            expr,
            if is_inv { ">" } else { "<=" }
        )),
        _ => Err(ctx.ferr(po_i, format!("unhandled parsed_flag_op: {:?}", pfo))),
    }
}

/// Condition expression over a cmp/dec comparison. Returns the rendered
/// condition plus a replacement comment for the known always-false case.
pub fn out_cmp_for_cc(
    ctx: &FuncContext,
    po_i: usize,
    po: &Inst,
    pfo: FlagCond,
    is_inv: bool,
) -> Result<(String, Option<String>), TranslateError> {
    if po.op != Op::Dec && po.operands[0].lmod != po.operands[1].lmod {
        return Err(ctx.ferr(po_i, "cmp lmod mismatch"));
    }
    let lmod = po.operands[0].lmod;

    let cast = lmod_cast_u(ctx, po_i, lmod)?;
    let scast = lmod_cast_s(ctx, po_i, lmod)?;

    let cast_use = match pfo {
        FlagCond::C | FlagCond::Z | FlagCond::Be => cast,
        FlagCond::S | FlagCond::L | FlagCond::Le => scast,
        _ => return Err(ctx.ferr(po_i, format!("unhandled parsed_flag_op: {:?}", pfo))),
    };

    let buf1 = out_src_opr(ctx, po_i, po, &po.operands[0], cast_use, false)?;
    let buf2 = if po.op == Op::Dec {
        "1".to_string()
    } else {
        out_src_opr(ctx, po_i, po, &po.operands[1], cast_use, false)?
    };

    let mut comment = None;
    let text = match pfo {
        // unsigned compare
        FlagCond::C => format!("({} {} {})", buf1, if is_inv { ">=" } else { "<" }, buf2),
        FlagCond::Z => format!("({} {} {})", buf1, if is_inv { "!=" } else { "==" }, buf2),
        // unsigned compare
        FlagCond::Be => {
            let text = format!("({} {} {})", buf1, if is_inv { ">" } else { "<=" }, buf2);
            // the annoying always-false byte case
            if is_inv
                && lmod == LenMod::Byte
                && po.operands.get(1).map(|o| o.kind) == Some(OprKind::Const)
                && po.operands[1].val == 0xff
            {
                comment = Some(format!("if {}", text));
                "(0)".to_string()
            } else {
                text
            }
        }
        // signed compares
        FlagCond::S => format!(
            "({}({} - {}) {} 0)",
            scast,
            buf1,
            buf2,
            if is_inv { ">=" } else { "<" }
        ),
        FlagCond::L => format!("({} {} {})", buf1, if is_inv { ">=" } else { "<" }, buf2),
        FlagCond::Le => format!("({} {} {})", buf1, if is_inv { ">" } else { "<=" }, buf2),
        _ => return Err(ctx.ferr(po_i, format!("unhandled parsed_flag_op: {:?}", pfo))),
    };

    Ok((text, comment))
}

/// Condition expression for a delayed test or cmp setter.
pub fn out_cmp_test(
    ctx: &FuncContext,
    po_i: usize,
    po: &Inst,
    pfo: FlagCond,
    is_inv: bool,
) -> Result<(String, Option<String>), TranslateError> {
    if po.op == Op::Test {
        let expr = if po.operand_name(0) == po.operand_name(1) {
            out_src_opr_u32(ctx, po_i, po, &po.operands[0])?
        } else {
            let buf1 = out_src_opr_u32(ctx, po_i, po, &po.operands[0])?;
            let buf2 = out_src_opr_u32(ctx, po_i, po, &po.operands[1])?;
            format!("({} & {})", buf1, buf2)
        };
        let text = out_test_for_cc(ctx, po_i, pfo, is_inv, po.operands[0].lmod, &expr)?;
        Ok((text, None))
    } else if po.op == Op::Cmp {
        out_cmp_for_cc(ctx, po_i, po, pfo, is_inv)
    } else {
        Err(ctx.ferr(po_i, "out_cmp_test: unhandled op"))
    }
}

/// The C operator for a two-operand arithmetic op.
pub fn op_to_c(ctx: &FuncContext, po_i: usize, po: &Inst) -> Result<&'static str, TranslateError> {
    match po.op {
        Op::Add | Op::Adc => Ok("+"),
        Op::Sub | Op::Sbb => Ok("-"),
        Op::And => Ok("&"),
        Op::Or => Ok("|"),
        Op::Xor => Ok("^"),
        Op::Shl => Ok("<<"),
        Op::Shr => Ok(">>"),
        Op::Mul | Op::Imul => Ok("*"),
        _ => Err(ctx.ferr(po_i, "op_to_c was supplied an unhandled op")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simplify_cast() {
        assert_eq!(simplify_cast("", "(u8)"), "(u8)");
        assert_eq!(simplify_cast("(s8)", "(u8)"), "(s8)");
        assert_eq!(simplify_cast("(u8)", "*(u8 *)"), "*(u8 *)");
        assert_eq!(simplify_cast("(char *)", "(u32)"), "(char *)");
        assert_eq!(simplify_cast("(s16)", "(u8)"), "(s16)(u8)");
    }

    #[test]
    fn test_simplify_cast_num() {
        assert_eq!(simplify_cast_num("(u8)", 0xff), "");
        assert_eq!(simplify_cast_num("(u8)", 0x100), "(u8)");
        assert_eq!(simplify_cast_num("(s8)", 0x7f), "");
        assert_eq!(simplify_cast_num("(s8)", 0x80), "(s8)");
        assert_eq!(simplify_cast_num("(u32)", 1), "(u32)");
    }

    #[test]
    fn test_default_cast_to() {
        let opr = Opr::default();
        assert_eq!(default_cast_to(&opr), "");
        let opr = Opr {
            is_ptr: true,
            ..Default::default()
        };
        assert_eq!(default_cast_to(&opr), "(void *)");
    }
}
