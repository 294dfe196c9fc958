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
use crate::ir::{FuncAttrs, Inst, InstFlags, Op, OprKind, XAX, XSP};

fn is_reg_named(po: &Inst, opr: usize, name: &str) -> bool {
    po.operands.get(opr).map(|o| o.name == name).unwrap_or(false)
}

fn is_esp_sub(po: &Inst) -> bool {
    po.op == Op::Sub
        && po.operands.len() == 2
        && po.operands[0].reg == Some(XSP)
        && po.operands[1].kind == OprKind::Const
}

/// Early check for a tail call or a branch back.
pub fn is_like_tailjmp(po: &Inst) -> bool {
    if !po.flags.contains(InstFlags::JMP) {
        return false;
    }
    // probably a local branch back, or a noreturn call
    (po.op == Op::Jmp && !po.operands[0].had_ds) || po.op == Op::Call
}

/// pass1: classify the stack frame and remove the prologue/epilogue ops.
pub fn classify_frame(ctx: &mut FuncContext) -> Result<(), TranslateError> {
    let opcnt = ctx.opcnt();
    if opcnt == 0 {
        return Ok(());
    }

    let noreturn = ctx.attrs.contains(FuncAttrs::NORETURN);

    let bp_start = opcnt >= 2
        && ctx.ops[0].op == Op::Push
        && is_reg_named(&ctx.ops[0], 0, "ebp")
        && ctx.ops[1].op == Op::Mov
        && is_reg_named(&ctx.ops[1], 0, "ebp")
        && is_reg_named(&ctx.ops[1], 1, "esp");

    if bp_start {
        let mut ecx_push = 0usize;

        ctx.bp_frame = true;
        ctx.ops[0].flags.insert(InstFlags::RMD);
        ctx.ops[1].flags.insert(InstFlags::RMD);
        let mut i = 2;

        if i < opcnt && is_esp_sub(&ctx.ops[i]) {
            ctx.stack_fsz = ctx.ops[i].operands[1].val as i32;
            ctx.ops[i].flags.insert(InstFlags::RMD);
            i += 1;
        } else {
            // another way msvc builds a stack frame
            while i < opcnt && ctx.ops[i].op == Op::Push && is_reg_named(&ctx.ops[i], 0, "ecx") {
                ctx.stack_fsz += 4;
                ctx.ops[i].flags.insert(InstFlags::RMD);
                ecx_push += 1;
                i += 1;
            }
            // and another way
            if i == 2
                && i + 1 < opcnt
                && ctx.ops[i].op == Op::Mov
                && ctx.ops[i].operands[0].reg == Some(XAX)
                && ctx.ops[i].operands[1].kind == OprKind::Const
                && ctx.ops[i + 1].op == Op::Call
                && is_reg_named(&ctx.ops[i + 1], 0, "__alloca_probe")
            {
                ctx.stack_fsz += ctx.ops[i].operands[1].val as i32;
                ctx.ops[i].flags.insert(InstFlags::RMD);
                i += 1;
                ctx.ops[i].flags.insert(InstFlags::RMD);
                i += 1;
            }
        }

        let mut found = false;
        loop {
            while i < opcnt && ctx.ops[i].op != Op::Ret {
                i += 1;
            }
            if i == 0 {
                break;
            }
            let mut j = i - 1;
            if i == opcnt && ctx.ops[j].flags.contains(InstFlags::JMP) {
                if found && is_like_tailjmp(&ctx.ops[j]) {
                    break;
                }
                if j == 0 {
                    break;
                }
                j -= 1;
            }

            if (ctx.ops[j].op == Op::Pop && is_reg_named(&ctx.ops[j], 0, "ebp"))
                || ctx.ops[j].op == Op::Leave
            {
                ctx.ops[j].flags.insert(InstFlags::RMD);
            } else if !noreturn {
                return Err(ctx.ferr(j, "'pop ebp' expected"));
            }

            if ctx.stack_fsz != 0 {
                if j > 0
                    && ctx.ops[j - 1].op == Op::Mov
                    && is_reg_named(&ctx.ops[j - 1], 0, "esp")
                    && is_reg_named(&ctx.ops[j - 1], 1, "ebp")
                {
                    ctx.ops[j - 1].flags.insert(InstFlags::RMD);
                } else if ctx.ops[j].op != Op::Leave && !noreturn {
                    return Err(ctx.ferr(j.saturating_sub(1), "esp restore expected"));
                }

                if ecx_push > 0
                    && j > 1
                    && ctx.ops[j - 2].op == Op::Pop
                    && is_reg_named(&ctx.ops[j - 2], 0, "ecx")
                {
                    return Err(ctx.ferr(j - 2, "unexpected ecx pop"));
                }
            }

            found = true;
            i += 1;
            if i >= opcnt {
                break;
            }
        }
    } else {
        let mut ecx_push = 0usize;
        let mut esp_sub = false;

        let mut i = 0;
        while i < opcnt && ctx.ops[i].op == Op::Push && is_reg_named(&ctx.ops[i], 0, "ecx") {
            ctx.ops[i].flags.insert(InstFlags::RMD);
            ctx.stack_fsz += 4;
            ecx_push += 1;
            i += 1;
        }

        while i < opcnt {
            if ctx.ops[i].op == Op::Push
                || ctx.ops[i]
                    .flags
                    .intersects(InstFlags::JMP | InstFlags::TAIL)
            {
                break;
            }
            if is_esp_sub(&ctx.ops[i]) {
                ctx.stack_fsz = ctx.ops[i].operands[1].val as i32;
                ctx.ops[i].flags.insert(InstFlags::RMD);
                esp_sub = true;
                break;
            }
            i += 1;
        }

        if ecx_push > 0 || esp_sub {
            ctx.sp_frame = true;

            let mut found = false;
            i += 1;
            while i < opcnt {
                while i < opcnt && ctx.ops[i].op != Op::Ret {
                    i += 1;
                }
                if i == 0 {
                    break;
                }
                let mut j = i - 1;
                if i == opcnt && ctx.ops[j].flags.contains(InstFlags::JMP) {
                    if found && is_like_tailjmp(&ctx.ops[j]) {
                        break;
                    }
                    if j == 0 {
                        break;
                    }
                    j -= 1;
                }

                for _ in 0..ecx_push {
                    if ctx.ops[j].op != Op::Pop || !is_reg_named(&ctx.ops[j], 0, "ecx") {
                        return Err(ctx.ferr(j, "'pop ecx' expected"));
                    }
                    ctx.ops[j].flags.insert(InstFlags::RMD);
                    if j == 0 {
                        break;
                    }
                    j -= 1;
                }
                if ecx_push > 0 {
                    found = true;
                }

                if esp_sub {
                    if ctx.ops[j].op != Op::Add
                        || !is_reg_named(&ctx.ops[j], 0, "esp")
                        || ctx.ops[j].operands[1].kind != OprKind::Const
                        || ctx.ops[j].operands[1].val as i32 != ctx.stack_fsz
                    {
                        return Err(ctx.ferr(j, "'add esp' expected"));
                    }
                    ctx.ops[j].flags.insert(InstFlags::RMD);
                    found = true;
                }

                i += 1;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::ProtoDb;
    use crate::parser::instructions::parse_op;

    fn build_ctx<'a>(db: &'a ProtoDb, asm: &[&str]) -> FuncContext<'a> {
        let mut ctx = FuncContext::new("t.asm", "f", db, false);
        for (n, line) in asm.iter().enumerate() {
            let mut parts = line.splitn(2, ' ');
            let mnem = parts.next().unwrap_or("");
            let rest = parts.next().unwrap_or("");
            let operands: Vec<String> = if rest.is_empty() {
                vec![]
            } else {
                rest.split(',').map(|s| s.trim().to_string()).collect()
            };
            let po = parse_op(db, &[], None, mnem, &operands, true, n + 1).unwrap();
            ctx.ops.push(po);
            ctx.labels.push(None);
            ctx.label_refs.push(Vec::new());
        }
        ctx
    }

    #[test]
    fn test_bp_frame_sub_esp() {
        let db = ProtoDb::default();
        let mut ctx = build_ctx(
            &db,
            &[
                "push ebp",
                "mov ebp, esp",
                "sub esp, 10h",
                "mov esp, ebp",
                "pop ebp",
                "retn",
            ],
        );
        classify_frame(&mut ctx).unwrap();
        assert!(ctx.bp_frame);
        assert_eq!(ctx.stack_fsz, 0x10);
        for i in [0usize, 1, 2, 3, 4] {
            assert!(ctx.ops[i].flags.contains(InstFlags::RMD), "op {} not RMD", i);
        }
        assert!(!ctx.ops[5].flags.contains(InstFlags::RMD));
    }

    #[test]
    fn test_bp_frame_ecx_pushes() {
        let db = ProtoDb::default();
        let mut ctx = build_ctx(
            &db,
            &[
                "push ebp",
                "mov ebp, esp",
                "push ecx",
                "push ecx",
                "mov esp, ebp",
                "pop ebp",
                "retn",
            ],
        );
        classify_frame(&mut ctx).unwrap();
        assert!(ctx.bp_frame);
        assert_eq!(ctx.stack_fsz, 8);
    }

    #[test]
    fn test_sp_frame() {
        let db = ProtoDb::default();
        let mut ctx = build_ctx(
            &db,
            &["sub esp, 20h", "mov eax, 1", "add esp, 20h", "retn"],
        );
        classify_frame(&mut ctx).unwrap();
        assert!(ctx.sp_frame);
        assert!(!ctx.bp_frame);
        assert_eq!(ctx.stack_fsz, 0x20);
        assert!(ctx.ops[0].flags.contains(InstFlags::RMD));
        assert!(ctx.ops[2].flags.contains(InstFlags::RMD));
    }

    #[test]
    fn test_no_frame() {
        let db = ProtoDb::default();
        let mut ctx = build_ctx(&db, &["mov eax, 1", "retn"]);
        classify_frame(&mut ctx).unwrap();
        assert!(!ctx.bp_frame);
        assert!(!ctx.sp_frame);
        assert_eq!(ctx.stack_fsz, 0);
    }

    #[test]
    fn test_missing_teardown_rejected() {
        let db = ProtoDb::default();
        let mut ctx = build_ctx(&db, &["push ebp", "mov ebp, esp", "mov eax, 1", "retn"]);
        assert!(classify_frame(&mut ctx).is_err());
    }
}
