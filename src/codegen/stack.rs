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
use crate::analysis::origin::nth_stack_arg;
use crate::codegen::casts::{lmod_bytes, simplify_cast};
use crate::errors::TranslateError;
use crate::header::guess_lmod_from_c_type;
use crate::ir::{InstFlags, LenMod, Opr};

/// One rendered stack-frame reference.
pub struct StackAccess {
    pub text: String,
    /// prototype index of the incoming argument, when the access maps to
    /// one
    pub arg_idx: Option<usize>,
    /// pointer-ness learned from the prototype, to push back onto the
    /// operand
    pub set_is_ptr: Option<bool>,
    pub comment: Option<String>,
}

/// Classify and render a stack-frame access: incoming argument (`aN` with
/// unaligned variants) or local variable (`sf.b/w/d[...]`).
pub fn stack_frame_access(
    ctx: &FuncContext,
    po_i: usize,
    popr: &Opr,
    cast: &str,
    is_src: bool,
    is_lea: bool,
) -> Result<StackAccess, TranslateError> {
    if ctx.ops[po_i].flags.contains(InstFlags::EBP_S) {
        return Err(ctx.ferr(po_i, "stack_frame_access while ebp is scratch"));
    }

    let name = &popr.name;
    let (offset, stack_ra, ofs_reg, bp_arg) = ctx.parse_stack_access(po_i, name, is_lea)?;

    if offset > stack_ra {
        let arg_i = (offset - stack_ra - 4) / 4;
        let pp = ctx.func_pp()?;

        if arg_i < 0 || arg_i as usize >= pp.argc_stack {
            if pp.is_vararg && arg_i as usize == pp.argc_stack && is_lea {
                // accessing the va_list area
                let cast = if cast.is_empty() { "(u32)" } else { cast };
                return Ok(StackAccess {
                    text: format!("{}ap", cast),
                    arg_idx: None,
                    set_is_ptr: None,
                    comment: None,
                });
            }
            return Err(ctx.ferr(
                po_i,
                format!("offset {} ({},{}) doesn't map to any arg", offset, bp_arg, arg_i),
            ));
        }
        if ofs_reg.is_some() {
            return Err(ctx.ferr(po_i, "offset reg on arg access?"));
        }

        let (slot, _) = nth_stack_arg(pp, arg_i as usize)
            .ok_or_else(|| ctx.ferr(po_i, format!("arg {} not in prototype?", arg_i)))?;
        let set_is_ptr = Some(pp.args[slot].type_.is_ptr);
        let an = slot + 1;

        let mut unaligned = false;
        let text = match popr.lmod {
            LenMod::Byte => {
                if is_lea {
                    return Err(ctx.ferr(po_i, "lea/byte to arg?"));
                }
                if is_src && offset & 3 == 0 {
                    format!("{}a{}", simplify_cast(cast, "(u8)"), an)
                } else {
                    format!("{}BYTE{}(a{})", cast, offset & 3, an)
                }
            }

            LenMod::Word => {
                if is_lea {
                    return Err(ctx.ferr(po_i, "lea/word to arg?"));
                }
                if offset & 1 != 0 {
                    unaligned = true;
                    if !is_src {
                        if offset & 2 != 0 {
                            return Err(ctx.ferr(po_i, "problematic arg store"));
                        }
                        format!("{}((char *)&a{} + 1)", simplify_cast(cast, "*(u16 *)"), an)
                    } else {
                        return Err(ctx.ferr(po_i, "unaligned arg word load"));
                    }
                } else if is_src && offset & 2 == 0 {
                    format!("{}a{}", simplify_cast(cast, "(u16)"), an)
                } else {
                    let half = if offset & 2 != 0 { "HI" } else { "LO" };
                    format!("{}{}WORD(a{})", cast, half, an)
                }
            }

            LenMod::Dword => {
                let prefix = if !cast.is_empty() {
                    cast
                } else if is_src {
                    "(u32)"
                } else {
                    ""
                };

                if offset & 3 != 0 {
                    unaligned = true;
                    if is_lea {
                        format!("(u32)&a{} + {}", an, offset & 3)
                    } else if !is_src {
                        return Err(ctx.ferr(po_i, "unaligned arg store"));
                    } else {
                        // mov edx, [ebp+arg_4+2]; movsx ecx, dx
                        format!("{}(a{} >> {})", prefix, an, (offset & 3) * 8)
                    }
                } else {
                    format!("{}{}a{}", prefix, if is_lea { "&" } else { "" }, an)
                }
            }

            _ => return Err(ctx.ferr(po_i, "bp_arg bad lmod")),
        };

        let comment = if unaligned {
            Some(format!("{} unaligned", bp_arg))
        } else {
            None
        };

        // common problem: the declared type is too small for the access
        if let Some(tmp_lmod) = guess_lmod_from_c_type(&pp.args[slot].type_) {
            if tmp_lmod != LenMod::Dword
                && (unaligned
                    || (!is_src
                        && lmod_bytes(ctx, po_i, tmp_lmod)?
                            < lmod_bytes(ctx, po_i, popr.lmod)? + (offset & 3) as u32))
            {
                return Err(ctx.ferr(
                    po_i,
                    format!(
                        "arg{} offset {} and type '{}' is too small",
                        an, offset, pp.args[slot].type_.name
                    ),
                ));
            }
        }

        Ok(StackAccess {
            text,
            arg_idx: Some(slot),
            set_is_ptr,
            comment,
        })
    } else {
        if ctx.stack_fsz == 0 {
            return Err(ctx.ferr(po_i, "stack var access without stackframe"));
        }
        ctx.stack_frame_used.set(true);

        let sf_ofs = ctx.stack_fsz + offset;
        let lim = if ofs_reg.is_some() { -4 } else { 0 };
        if offset > 0 || sf_ofs < lim {
            return Err(ctx.ferr(
                po_i,
                format!("bp_stack offset {}/{}", offset, ctx.stack_fsz),
            ));
        }

        let prefix = if is_lea { "(u32)&" } else { cast };
        let reg_suffix = match &ofs_reg {
            Some(r) => format!("+{}", r),
            None => String::new(),
        };

        let mut comment = None;
        let text = match popr.lmod {
            LenMod::Byte => format!("{}sf.b[{}{}]", prefix, sf_ofs, reg_suffix),

            LenMod::Word => {
                if sf_ofs & 1 != 0 || ofs_reg.is_some() {
                    // known unaligned or possibly unaligned
                    comment = Some("unaligned".to_string());
                    let prefix = if prefix.is_empty() { "*(u16 *)&" } else { prefix };
                    format!("{}sf.b[{}{}]", prefix, sf_ofs, reg_suffix)
                } else {
                    format!("{}sf.w[{}]", prefix, sf_ofs / 2)
                }
            }

            LenMod::Dword => {
                if sf_ofs & 3 != 0 || ofs_reg.is_some() {
                    // known unaligned or possibly unaligned
                    comment = Some("unaligned".to_string());
                    let prefix = if prefix.is_empty() { "*(u32 *)&" } else { prefix };
                    format!("{}sf.b[{}{}]", prefix, sf_ofs, reg_suffix)
                } else {
                    format!("{}sf.d[{}]", prefix, sf_ofs / 4)
                }
            }

            _ => return Err(ctx.ferr(po_i, "bp_stack bad lmod")),
        };

        Ok(StackAccess {
            text,
            arg_idx: None,
            set_is_ptr: None,
            comment,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::ProtoDb;
    use crate::ir::{Equate, Inst, OprKind};

    fn ctx_with_frame<'a>(db: &'a ProtoDb) -> FuncContext<'a> {
        let mut ctx = FuncContext::new("t.asm", "f", db, false);
        ctx.func_pp = db.lookup("f").cloned();
        ctx.bp_frame = true;
        ctx.stack_fsz = 0x10;
        ctx.ops.push(Inst::default());
        ctx.labels.push(None);
        ctx.label_refs.push(Vec::new());
        ctx.equs.push(Equate {
            name: "var_4".to_string(),
            lmod: LenMod::Dword,
            offset: -4,
        });
        ctx
    }

    fn regmem(name: &str, lmod: LenMod) -> Opr {
        Opr {
            kind: OprKind::RegMem,
            lmod,
            name: name.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_arg_access() {
        let db = ProtoDb::from_header("int f(int a1, int a2);").unwrap();
        let ctx = ctx_with_frame(&db);
        let opr = regmem("ebp+8", LenMod::Dword);
        let access = stack_frame_access(&ctx, 0, &opr, "", true, false).unwrap();
        assert_eq!(access.text, "(u32)a1");
        assert_eq!(access.arg_idx, Some(0));

        let opr = regmem("ebp+0x0c", LenMod::Dword);
        let access = stack_frame_access(&ctx, 0, &opr, "", false, false).unwrap();
        assert_eq!(access.text, "a2");
        assert_eq!(access.arg_idx, Some(1));
    }

    #[test]
    fn test_local_access() {
        let db = ProtoDb::from_header("int f(void);").unwrap();
        let ctx = ctx_with_frame(&db);
        let opr = regmem("ebp+var_4", LenMod::Dword);
        let access = stack_frame_access(&ctx, 0, &opr, "", false, false).unwrap();
        assert_eq!(access.text, "sf.d[3]");
        assert!(ctx.stack_frame_used.get());

        let opr = regmem("ebp+var_4", LenMod::Byte);
        let access = stack_frame_access(&ctx, 0, &opr, "", false, false).unwrap();
        assert_eq!(access.text, "sf.b[12]");
    }

    #[test]
    fn test_lea_local() {
        let db = ProtoDb::from_header("int f(void);").unwrap();
        let ctx = ctx_with_frame(&db);
        let opr = regmem("ebp+var_4", LenMod::Dword);
        let access = stack_frame_access(&ctx, 0, &opr, "", true, true).unwrap();
        assert_eq!(access.text, "(u32)&sf.d[3]");
    }

    #[test]
    fn test_byte_arg_parts() {
        let db = ProtoDb::from_header("int f(int a1);").unwrap();
        let ctx = ctx_with_frame(&db);
        let opr = regmem("ebp+9", LenMod::Byte);
        let access = stack_frame_access(&ctx, 0, &opr, "", true, false).unwrap();
        assert_eq!(access.text, "BYTE1(a1)");
    }
}
