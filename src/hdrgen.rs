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

use std::fmt::Write as _;

use crate::analysis::{FuncContext, flow, origin};
use crate::errors::TranslateError;
use crate::ir::{FuncAttrs, InstFlags, Op, Opr, OprKind, REGS_R32, XAX, XSP};

#[derive(Debug, Default, Clone)]
struct FuncDep {
    name: String,
    // registers live at the time of the call
    regmask_live: u32,
    // the return value of this callee is the caller's return
    ret_dep: bool,
}

/// What the header generator learns about one procedure.
#[derive(Debug, Default, Clone)]
struct FuncProto {
    name: String,
    argc_stack: i32,
    regmask_dep: u32,
    // -1 unresolved, 0 no, 1 yes
    has_ret: i32,
    is_stdcall: bool,
    dep_resolved: bool,
    deps: Vec<FuncDep>,
}

/// Accumulates per-function prototypes across the whole listing, then
/// prints them with inter-procedural dependency closure.
#[derive(Debug, Default)]
pub struct HeaderGen {
    fps: Vec<FuncProto>,
}

impl HeaderGen {
    pub fn new() -> Self {
        HeaderGen::default()
    }

    /// The analyzer variant for header mode: branch resolution and
    /// push/pop pairing only, accumulating register dependencies.
    pub fn collect(&mut self, ctx: &mut FuncContext) -> Result<(), TranslateError> {
        let opcnt = ctx.opcnt();

        let mut fp = FuncProto {
            name: ctx.name.clone(),
            has_ret: -1,
            ..Default::default()
        };

        // pass1: collect calls, resolve all branches
        let mut i = 0;
        while i < opcnt {
            ctx.ops[i].bt_i = None;
            ctx.ops[i].btj = None;

            if ctx.ops[i].flags.contains(InstFlags::RMD) {
                i += 1;
                continue;
            }

            if ctx.ops[i].op == Op::Call {
                if ctx.ops[i].operands[0].kind == OprKind::Label {
                    let callee = ctx.ops[i].operands[0].name.clone();
                    if !fp.deps.iter().any(|d| d.name == callee) {
                        fp.deps.push(FuncDep {
                            name: callee,
                            ..Default::default()
                        });
                    }
                }
                i += 1;
                continue;
            }

            if !ctx.ops[i].flags.contains(InstFlags::JMP) || ctx.ops[i].op == Op::Ret {
                i += 1;
                continue;
            }

            if ctx.ops[i].operands[0].kind == OprKind::RegMem {
                match flow::try_resolve_jumptab(ctx, i)? {
                    Some(pd) => {
                        ctx.ops[i].btj = Some(pd);
                        i += 1;
                        continue;
                    }
                    None => {
                        make_tailcall(ctx, i);
                        continue;
                    }
                }
            }

            let target = ctx.ops[i].operands[0].name.clone();
            let mut resolved = false;
            for l in 0..opcnt {
                if ctx.labels[l].as_deref() == Some(target.as_str()) {
                    ctx.add_label_ref(l, i);
                    ctx.ops[i].bt_i = Some(l);
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

        // pass2: remove dead labels
        for i in 0..opcnt {
            if ctx.labels[i].is_some() && ctx.label_refs[i].is_empty() {
                ctx.labels[i] = None;
            }
        }

        // pass3: track saved regs, figure out arg-regs
        let mut regmask_save = 0u32;
        let mut regmask_dst = 0u32;
        let mut regmask_dep = 0u32;
        let mut has_ret = -1i32;

        for i in 0..opcnt {
            if ctx.ops[i].flags.contains(InstFlags::RMD) {
                continue;
            }

            if ctx.ops[i].op == Op::Push && ctx.ops[i].operands[0].kind == OprKind::Reg {
                let reg = ctx.ops[i].operands[0]
                    .reg
                    .ok_or_else(|| ctx.ferr(i, "reg not set for push?"))?;
                let reg_name = ctx.ops[i].operands[0].name.clone();

                let mut depth = 0;
                let ret = flow::scan_for_pop(
                    ctx,
                    i + 1,
                    &reg_name,
                    (i + opcnt) as u32,
                    0,
                    &mut depth,
                    false,
                )?;
                if ret == 1 {
                    regmask_save |= 1 << reg;
                    ctx.ops[i].flags.insert(InstFlags::RMD);
                    flow::scan_for_pop(
                        ctx,
                        i + 1,
                        &reg_name,
                        (i + opcnt * 2) as u32,
                        0,
                        &mut depth,
                        true,
                    )?;
                    continue;
                }
                let ret = flow::scan_for_pop_ret(ctx, i + 1, &reg_name, InstFlags::empty());
                if ret == 0 {
                    regmask_save |= 1 << reg;
                    ctx.ops[i].flags.insert(InstFlags::RMD);
                    flow::scan_for_pop_ret(ctx, i + 1, &reg_name, InstFlags::RMD);
                    continue;
                }
            } else if ctx.ops[i].op == Op::Push && ctx.ops[i].operands[0].kind == OprKind::Const {
                for j in i + 1..opcnt {
                    if ctx.ops[j]
                        .flags
                        .intersects(InstFlags::JMP | InstFlags::TAIL | InstFlags::RSAVE)
                        || ctx.ops[j].op == Op::Push
                        || ctx.labels[j].is_some()
                    {
                        break;
                    }
                    if !ctx.ops[j].flags.contains(InstFlags::RMD) && ctx.ops[j].op == Op::Pop {
                        ctx.ops[i].flags.insert(InstFlags::RMD);
                        ctx.ops[j].pair_push = Some(i);
                        break;
                    }
                }
                continue;
            } else if ctx.ops[i].op == Op::Call {
                ctx.ops[i].regmask_dst |= 1 << XAX;

                let callee = ctx.ops[i].operand_name(0).to_string();
                if let Some(dep) = fp.deps.iter_mut().find(|d| d.name == callee) {
                    dep.regmask_live = regmask_save | regmask_dst;
                }
            } else if ctx.ops[i].op == Op::Ret {
                if !ctx.ops[i].operands.is_empty() {
                    fp.is_stdcall = true;
                }
            }

            if has_ret != 0 && ctx.ops[i].flags.contains(InstFlags::TAIL) {
                let (ret, origin_i, from_caller) = if ctx.ops[i].op == Op::Call {
                    (1, Some(i), false)
                } else {
                    let eax = Opr::new_reg(XAX, crate::ir::LenMod::Dword);
                    let mut j = None;
                    let mut from_caller = false;
                    let ret = origin::resolve_origin(
                        ctx,
                        i,
                        &eax,
                        (i + opcnt * 3) as u32,
                        &mut j,
                        &mut from_caller,
                    );
                    (ret, j, from_caller)
                };

                if ret == -1 && from_caller {
                    // unresolved eax, probably a void func
                    has_ret = 0;
                } else {
                    match origin_i {
                        Some(j) if ctx.ops[j].op == Op::Call => {
                            let callee = ctx.ops[j].operand_name(0).to_string();
                            match fp.deps.iter_mut().find(|d| d.name == callee) {
                                Some(dep) => dep.ret_dep = true,
                                None => has_ret = 1,
                            }
                        }
                        _ => has_ret = 1,
                    }
                }
            }

            let l = ctx.ops[i].regmask_src & !(regmask_save | regmask_dst);
            regmask_dep |= l;
            regmask_dst |= ctx.ops[i].regmask_dst;
        }

        if has_ret == -1 && regmask_dep & (1 << XAX) != 0 {
            has_ret = 1;
        }

        let mut max_bp_offset = 0i32;
        for eq in &ctx.equs {
            if eq.offset > max_bp_offset && eq.offset < 4 * 32 {
                max_bp_offset = eq.offset;
            }
        }

        if max_bp_offset > 0 {
            max_bp_offset = (max_bp_offset + 3) & !3;
            fp.argc_stack = max_bp_offset / 4 - 1;
            if !ctx.attrs.contains(FuncAttrs::BP_FRAME) {
                fp.argc_stack -= 1;
            }
        }

        fp.regmask_dep = regmask_dep & !(1 << XSP);
        fp.has_ret = has_ret;

        self.fps.push(fp);
        Ok(())
    }

    /// Print all the collected prototypes, with callee registers and
    /// return presence propagated up the call graph.
    pub fn output(mut self) -> String {
        self.fps.sort_by(|a, b| a.name.cmp(&b.name));
        for i in 0..self.fps.len() {
            resolve_deps(&mut self.fps, i);
        }

        let mut out = String::new();
        let mut had_usercall = false;

        for fp in &self.fps {
            if fp.has_ret == -1 {
                out.push_str("// ret unresolved\n");
            }

            let mut regmask_dep = fp.regmask_dep;
            let mut argc_stack = fp.argc_stack;

            out.push_str(if fp.has_ret != 0 { "int  " } else { "void " });
            if regmask_dep != 0
                && (fp.is_stdcall || argc_stack == 0)
                && regmask_dep & !((1 << crate::ir::XCX) | (1 << crate::ir::XDX)) == 0
            {
                out.push_str("__fastcall ");
                if had_usercall {
                    out.push_str("     "); // align
                }
                if regmask_dep & (1 << crate::ir::XDX) == 0 && argc_stack == 0 {
                    argc_stack = 1;
                } else {
                    argc_stack += 2;
                }
                regmask_dep = 0;
            } else if regmask_dep != 0 && !fp.is_stdcall {
                out.push_str("/*__usercall*/  ");
                had_usercall = true;
            } else if regmask_dep != 0 {
                out.push_str("/*__userpurge*/ ");
                had_usercall = true;
            } else if fp.is_stdcall {
                out.push_str("__stdcall  ");
            } else {
                out.push_str("__cdecl ");
            }

            let _ = write!(out, "{}(", fp.name);

            let mut arg = 0;
            for j in 0..XSP {
                if regmask_dep & (1 << j) != 0 {
                    arg += 1;
                    if arg != 1 {
                        out.push_str(", ");
                    }
                    let _ = write!(out, "int a{}/*<{}>*/", arg, REGS_R32[j]);
                }
            }

            for _ in 0..argc_stack {
                arg += 1;
                if arg != 1 {
                    out.push_str(", ");
                }
                let _ = write!(out, "int a{}", arg);
            }

            out.push_str(");\n");
        }

        out
    }
}

fn make_tailcall(ctx: &mut FuncContext, i: usize) {
    ctx.ops[i].op = Op::Call;
    ctx.ops[i].flags.insert(InstFlags::TAIL);
    if i > 0 && ctx.ops[i - 1].op == Op::Pop {
        ctx.ops[i].flags.insert(InstFlags::ATAIL);
    }
}

// recursive, so mark first
fn resolve_deps(fps: &mut [FuncProto], i: usize) {
    if fps[i].dep_resolved {
        return;
    }
    fps[i].dep_resolved = true;

    for d in 0..fps[i].deps.len() {
        let dep_name = fps[i].deps[d].name.clone();
        let proto_i = match fps.binary_search_by(|p| p.name.as_str().cmp(dep_name.as_str())) {
            Ok(p) => p,
            Err(_) => continue,
        };
        resolve_deps(fps, proto_i);

        let dep_mask = !fps[i].deps[d].regmask_live & fps[proto_i].regmask_dep;
        fps[i].regmask_dep |= dep_mask;

        if fps[i].has_ret == -1 {
            fps[i].has_ret = fps[proto_i].has_ret;
        }
    }
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
    fn test_stdcall_detection() {
        let db = ProtoDb::default();
        let mut ctx = FuncContext::new("t.asm", "f", &db, false);
        push_op(&mut ctx, &db, "mov eax, 1");
        push_op(&mut ctx, &db, "retn 8");

        let mut hg = HeaderGen::new();
        hg.collect(&mut ctx).unwrap();
        let out = hg.output();
        assert!(out.contains("__stdcall"), "got: {}", out);
        assert!(out.contains("int  "), "got: {}", out);
    }

    #[test]
    fn test_fastcall_reg_deps() {
        let db = ProtoDb::default();
        let mut ctx = FuncContext::new("t.asm", "f", &db, false);
        push_op(&mut ctx, &db, "mov eax, ecx");
        push_op(&mut ctx, &db, "retn");

        let mut hg = HeaderGen::new();
        hg.collect(&mut ctx).unwrap();
        let out = hg.output();
        assert!(out.contains("__fastcall"), "got: {}", out);
        assert!(out.contains("/*<ecx>*/"), "got: {}", out);
    }

    #[test]
    fn test_void_func() {
        let db = ProtoDb::default();
        let mut ctx = FuncContext::new("t.asm", "f", &db, false);
        push_op(&mut ctx, &db, "mov ecx, 1");
        push_op(&mut ctx, &db, "retn");

        let mut hg = HeaderGen::new();
        hg.collect(&mut ctx).unwrap();
        let out = hg.output();
        assert!(out.starts_with("void "), "got: {}", out);
    }

    #[test]
    fn test_ret_dep_propagation() {
        let db = ProtoDb::from_header("int helper(void);").unwrap();
        let mut hg = HeaderGen::new();

        // helper returns eax it computed itself
        let mut ctx = FuncContext::new("t.asm", "helper", &db, false);
        push_op(&mut ctx, &db, "mov eax, 5");
        push_op(&mut ctx, &db, "retn");
        hg.collect(&mut ctx).unwrap();

        // outer forwards helper's return
        let mut ctx = FuncContext::new("t.asm", "outer", &db, false);
        push_op(&mut ctx, &db, "call helper");
        push_op(&mut ctx, &db, "retn");
        hg.collect(&mut ctx).unwrap();

        let out = hg.output();
        let outer_line = out
            .lines()
            .find(|l| l.contains("outer"))
            .expect("outer line");
        assert!(outer_line.starts_with("int"), "got: {}", outer_line);
    }
}
