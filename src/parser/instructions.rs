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

use crate::header::ProtoDb;
use crate::ir::{
    Equate, FlagCond, Inst, InstFlags, LenMod, Op, Opr, OprKind, XAX, XBP, XBX, XCX, XDI, XDX,
    XSI, XSP,
};
use crate::parser::operands::{parse_operand, setup_implicit_reg};

struct OpEnt {
    name: &'static str,
    op: Op,
    minopr: usize,
    maxopr: usize,
    flags: u32,
    pfo: Option<FlagCond>,
    pfo_inv: bool,
}

const fn e(name: &'static str, op: Op, minopr: usize, maxopr: usize, flags: u32) -> OpEnt {
    OpEnt {
        name,
        op,
        minopr,
        maxopr,
        flags,
        pfo: None,
        pfo_inv: false,
    }
}

const fn ec(
    name: &'static str,
    op: Op,
    flags: u32,
    pfo: FlagCond,
    pfo_inv: bool,
) -> OpEnt {
    OpEnt {
        name,
        op,
        minopr: 1,
        maxopr: 1,
        flags,
        pfo: Some(pfo),
        pfo_inv,
    }
}

const DATA: u32 = InstFlags::DATA.bits();
const FLAGS: u32 = InstFlags::FLAGS.bits();
const JMP: u32 = InstFlags::JMP.bits();
const CJMP: u32 = InstFlags::CJMP.bits();
const CC: u32 = InstFlags::CC.bits();
const TAIL: u32 = InstFlags::TAIL.bits();
const CJMP_CC: u32 = JMP | CJMP | CC;
const SCC: u32 = DATA | CC;

#[rustfmt::skip]
static OP_TABLE: &[OpEnt] = &[
    e("nop",   Op::Nop,   0, 0, 0),
    e("push",  Op::Push,  1, 1, 0),
    e("pop",   Op::Pop,   1, 1, DATA),
    e("leave", Op::Leave, 0, 0, DATA),
    e("mov",   Op::Mov,   2, 2, DATA),
    e("lea",   Op::Lea,   2, 2, DATA),
    e("movzx", Op::Movzx, 2, 2, DATA),
    e("movsx", Op::Movsx, 2, 2, DATA),
    e("xchg",  Op::Xchg,  2, 2, DATA),
    e("not",   Op::Not,   1, 1, DATA),
    e("cdq",   Op::Cdq,   0, 0, DATA),
    e("lodsb", Op::Lods,  0, 0, DATA),
    e("lodsw", Op::Lods,  0, 0, DATA),
    e("lodsd", Op::Lods,  0, 0, DATA),
    e("stosb", Op::Stos,  0, 0, DATA),
    e("stosw", Op::Stos,  0, 0, DATA),
    e("stosd", Op::Stos,  0, 0, DATA),
    e("movsb", Op::Movs,  0, 0, DATA),
    e("movsw", Op::Movs,  0, 0, DATA),
    e("movsd", Op::Movs,  0, 0, DATA),
    e("cmpsb", Op::Cmps,  0, 0, DATA | FLAGS),
    e("cmpsw", Op::Cmps,  0, 0, DATA | FLAGS),
    e("cmpsd", Op::Cmps,  0, 0, DATA | FLAGS),
    e("scasb", Op::Scas,  0, 0, DATA | FLAGS),
    e("scasw", Op::Scas,  0, 0, DATA | FLAGS),
    e("scasd", Op::Scas,  0, 0, DATA | FLAGS),
    e("xlat",  Op::Xlat,  0, 0, DATA),
    e("xlatb", Op::Xlat,  0, 0, DATA),
    e("std",   Op::Std,   0, 0, DATA), // special flag
    e("cld",   Op::Cld,   0, 0, DATA),
    e("add",   Op::Add,   2, 2, DATA | FLAGS),
    e("sub",   Op::Sub,   2, 2, DATA | FLAGS),
    e("and",   Op::And,   2, 2, DATA | FLAGS),
    e("or",    Op::Or,    2, 2, DATA | FLAGS),
    e("xor",   Op::Xor,   2, 2, DATA | FLAGS),
    e("shl",   Op::Shl,   2, 2, DATA | FLAGS),
    e("shr",   Op::Shr,   2, 2, DATA | FLAGS),
    e("sal",   Op::Shl,   2, 2, DATA | FLAGS),
    e("sar",   Op::Sar,   2, 2, DATA | FLAGS),
    e("shrd",  Op::Shrd,  3, 3, DATA | FLAGS),
    e("rol",   Op::Rol,   2, 2, DATA | FLAGS),
    e("ror",   Op::Ror,   2, 2, DATA | FLAGS),
    OpEnt { name: "rcl", op: Op::Rcl, minopr: 2, maxopr: 2, flags: DATA | FLAGS | CC, pfo: Some(FlagCond::C), pfo_inv: false },
    OpEnt { name: "rcr", op: Op::Rcr, minopr: 2, maxopr: 2, flags: DATA | FLAGS | CC, pfo: Some(FlagCond::C), pfo_inv: false },
    OpEnt { name: "adc", op: Op::Adc, minopr: 2, maxopr: 2, flags: DATA | FLAGS | CC, pfo: Some(FlagCond::C), pfo_inv: false },
    OpEnt { name: "sbb", op: Op::Sbb, minopr: 2, maxopr: 2, flags: DATA | FLAGS | CC, pfo: Some(FlagCond::C), pfo_inv: false },
    e("bsf",   Op::Bsf,   2, 2, DATA | FLAGS),
    e("inc",   Op::Inc,   1, 1, DATA | FLAGS),
    e("dec",   Op::Dec,   1, 1, DATA | FLAGS),
    e("neg",   Op::Neg,   1, 1, DATA | FLAGS),
    e("mul",   Op::Mul,   1, 1, DATA | FLAGS),
    e("imul",  Op::Imul,  1, 3, DATA | FLAGS),
    e("div",   Op::Div,   1, 1, DATA | FLAGS),
    e("idiv",  Op::Idiv,  1, 1, DATA | FLAGS),
    e("test",  Op::Test,  2, 2, FLAGS),
    e("cmp",   Op::Cmp,   2, 2, FLAGS),
    e("ret",   Op::Ret,   0, 1, TAIL),
    e("retn",  Op::Ret,   0, 1, TAIL),
    e("call",  Op::Call,  1, 1, JMP | DATA | FLAGS),
    e("jmp",   Op::Jmp,   1, 1, JMP),
    e("jecxz", Op::Jecxz, 1, 1, JMP | CJMP),
    e("loop",  Op::Loop,  1, 1, JMP | CJMP),
    ec("jo",   Op::Jcc, CJMP_CC, FlagCond::O,  false), // 70 OF=1
    ec("jno",  Op::Jcc, CJMP_CC, FlagCond::O,  true),  // 71 OF=0
    ec("jc",   Op::Jcc, CJMP_CC, FlagCond::C,  false), // 72 CF=1
    ec("jb",   Op::Jcc, CJMP_CC, FlagCond::C,  false), // 72
    ec("jnc",  Op::Jcc, CJMP_CC, FlagCond::C,  true),  // 73 CF=0
    ec("jnb",  Op::Jcc, CJMP_CC, FlagCond::C,  true),  // 73
    ec("jae",  Op::Jcc, CJMP_CC, FlagCond::C,  true),  // 73
    ec("jz",   Op::Jcc, CJMP_CC, FlagCond::Z,  false), // 74 ZF=1
    ec("je",   Op::Jcc, CJMP_CC, FlagCond::Z,  false), // 74
    ec("jnz",  Op::Jcc, CJMP_CC, FlagCond::Z,  true),  // 75 ZF=0
    ec("jne",  Op::Jcc, CJMP_CC, FlagCond::Z,  true),  // 75
    ec("jbe",  Op::Jcc, CJMP_CC, FlagCond::Be, false), // 76 CF=1||ZF=1
    ec("jna",  Op::Jcc, CJMP_CC, FlagCond::Be, false), // 76
    ec("ja",   Op::Jcc, CJMP_CC, FlagCond::Be, true),  // 77 CF=0&&ZF=0
    ec("jnbe", Op::Jcc, CJMP_CC, FlagCond::Be, true),  // 77
    ec("js",   Op::Jcc, CJMP_CC, FlagCond::S,  false), // 78 SF=1
    ec("jns",  Op::Jcc, CJMP_CC, FlagCond::S,  true),  // 79 SF=0
    ec("jp",   Op::Jcc, CJMP_CC, FlagCond::P,  false), // 7a PF=1
    ec("jpe",  Op::Jcc, CJMP_CC, FlagCond::P,  false), // 7a
    ec("jnp",  Op::Jcc, CJMP_CC, FlagCond::P,  true),  // 7b PF=0
    ec("jpo",  Op::Jcc, CJMP_CC, FlagCond::P,  true),  // 7b
    ec("jl",   Op::Jcc, CJMP_CC, FlagCond::L,  false), // 7c SF!=OF
    ec("jnge", Op::Jcc, CJMP_CC, FlagCond::L,  false), // 7c
    ec("jge",  Op::Jcc, CJMP_CC, FlagCond::L,  true),  // 7d SF=OF
    ec("jnl",  Op::Jcc, CJMP_CC, FlagCond::L,  true),  // 7d
    ec("jle",  Op::Jcc, CJMP_CC, FlagCond::Le, false), // 7e ZF=1||SF!=OF
    ec("jng",  Op::Jcc, CJMP_CC, FlagCond::Le, false), // 7e
    ec("jg",   Op::Jcc, CJMP_CC, FlagCond::Le, true),  // 7f ZF=0&&SF=OF
    ec("jnle", Op::Jcc, CJMP_CC, FlagCond::Le, true),  // 7f
    ec("seto",   Op::Scc, SCC, FlagCond::O,  false),
    ec("setno",  Op::Scc, SCC, FlagCond::O,  true),
    ec("setc",   Op::Scc, SCC, FlagCond::C,  false),
    ec("setb",   Op::Scc, SCC, FlagCond::C,  false),
    ec("setnc",  Op::Scc, SCC, FlagCond::C,  true),
    ec("setae",  Op::Scc, SCC, FlagCond::C,  true),
    ec("setnb",  Op::Scc, SCC, FlagCond::C,  true),
    ec("setz",   Op::Scc, SCC, FlagCond::Z,  false),
    ec("sete",   Op::Scc, SCC, FlagCond::Z,  false),
    ec("setnz",  Op::Scc, SCC, FlagCond::Z,  true),
    ec("setne",  Op::Scc, SCC, FlagCond::Z,  true),
    ec("setbe",  Op::Scc, SCC, FlagCond::Be, false),
    ec("setna",  Op::Scc, SCC, FlagCond::Be, false),
    ec("seta",   Op::Scc, SCC, FlagCond::Be, true),
    ec("setnbe", Op::Scc, SCC, FlagCond::Be, true),
    ec("sets",   Op::Scc, SCC, FlagCond::S,  false),
    ec("setns",  Op::Scc, SCC, FlagCond::S,  true),
    ec("setp",   Op::Scc, SCC, FlagCond::P,  false),
    ec("setpe",  Op::Scc, SCC, FlagCond::P,  false),
    ec("setnp",  Op::Scc, SCC, FlagCond::P,  true),
    ec("setpo",  Op::Scc, SCC, FlagCond::P,  true),
    ec("setl",   Op::Scc, SCC, FlagCond::L,  false),
    ec("setnge", Op::Scc, SCC, FlagCond::L,  false),
    ec("setge",  Op::Scc, SCC, FlagCond::L,  true),
    ec("setnl",  Op::Scc, SCC, FlagCond::L,  true),
    ec("setle",  Op::Scc, SCC, FlagCond::Le, false),
    ec("setng",  Op::Scc, SCC, FlagCond::Le, false),
    ec("setg",   Op::Scc, SCC, FlagCond::Le, true),
    ec("setnle", Op::Scc, SCC, FlagCond::Le, true),
    // mmx
    e("emms",  Op::Emms, 0, 0, DATA),
    e("movq",  Op::Mov,  2, 2, DATA),
];

fn prefix_flags(prefix: &str) -> Option<InstFlags> {
    match prefix {
        "rep" => Some(InstFlags::REP),
        "repe" | "repz" => Some(InstFlags::REP | InstFlags::REPZ),
        "repne" | "repnz" => Some(InstFlags::REP | InstFlags::REPNZ),
        "lock" => Some(InstFlags::LOCK), // ignored for now..
        _ => None,
    }
}

fn same_reg_operands(po: &Inst) -> bool {
    po.operands.len() == 2
        && po.operands[0].kind == OprKind::Reg
        && po.operands[1].kind == OprKind::Reg
        && po.operands[0].lmod == po.operands[1].lmod
        && po.operands[0].reg == po.operands[1].reg
        && po.operands[0].name == po.operands[1].name // ! ah, al..
}

/// Parse one instruction: table lookup, operand parsing, then the per-op
/// fixups (implicit operands, read-modify-write masks, known idioms).
pub fn parse_op(
    db: &ProtoDb,
    equs: &[Equate],
    prefix: Option<&str>,
    mnemonic: &str,
    operand_strs: &[String],
    quiet_pp: bool,
    asmln: usize,
) -> Result<Inst, String> {
    let mut pflags = InstFlags::empty();
    if let Some(p) = prefix {
        pflags = prefix_flags(p).ok_or_else(|| format!("unhandled prefix: '{}'", p))?;
    }

    let ent = OP_TABLE
        .iter()
        .find(|e| e.name == mnemonic)
        .ok_or_else(|| format!("unhandled op: '{}'", mnemonic))?;

    if operand_strs.len() < ent.minopr || operand_strs.len() > ent.maxopr {
        return Err(format!(
            "{}: operand count {} not in {}..{}",
            mnemonic,
            operand_strs.len(),
            ent.minopr,
            ent.maxopr
        ));
    }

    let mut po = Inst {
        op: ent.op,
        flags: InstFlags::from_bits_truncate(ent.flags) | pflags,
        pfo: ent.pfo,
        pfo_inv: ent.pfo_inv,
        asmln,
        ..Default::default()
    };

    for (i, raw) in operand_strs.iter().enumerate() {
        let (opr, regmask, regmask_ind) = parse_operand(db, equs, raw, po.flags, quiet_pp)?;
        if i == 0 && po.flags.contains(InstFlags::DATA) {
            po.regmask_dst = regmask;
        } else {
            po.regmask_src |= regmask;
        }
        po.regmask_src |= regmask_ind;
        po.operands.push(opr);
    }

    // special cases
    if mnemonic.starts_with("set") {
        if let Some(opr) = po.operands.first_mut() {
            opr.lmod = LenMod::Byte;
        }
    }

    match po.op {
        // first operand is not dst
        Op::Cmp | Op::Test => {
            po.regmask_src |= po.regmask_dst;
            po.regmask_dst = 0;
        }

        // first operand is src too
        Op::Not | Op::Add | Op::And | Op::Or | Op::Rcl | Op::Rcr | Op::Adc | Op::Inc
        | Op::Dec | Op::Neg => {
            po.regmask_src |= po.regmask_dst;
        }

        Op::Xchg => {
            po.regmask_src |= po.regmask_dst;
            po.regmask_dst |= po.regmask_src;
            if same_reg_operands(&po) {
                po.flags |= InstFlags::RMD;
                po.regmask_src = 0;
                po.regmask_dst = 0;
            }
        }

        Op::Sub | Op::Sbb | Op::Xor => {
            if same_reg_operands(&po) {
                // known zeroing idiom
                po.regmask_src = 0;
            } else {
                po.regmask_src |= po.regmask_dst;
            }
        }

        // ops with implicit arguments
        Op::Cdq => {
            let mut o0 = Opr::default();
            let mut o1 = Opr::default();
            setup_implicit_reg(&mut o0, XDX, LenMod::Dword, &mut po.regmask_dst);
            setup_implicit_reg(&mut o1, XAX, LenMod::Dword, &mut po.regmask_src);
            po.operands = vec![o0, o1];
        }

        Op::Lods | Op::Stos | Op::Scas => {
            if po.operands.is_empty() {
                let lmod = string_op_lmod(mnemonic)?;
                let mut o0 = Opr::default();
                let mut o1 = Opr::default();
                let mut o2 = Opr::default();
                setup_implicit_reg(
                    &mut o0,
                    if po.op == Op::Lods { XSI } else { XDI },
                    lmod,
                    &mut po.regmask_src,
                );
                setup_implicit_reg(&mut o1, XCX, LenMod::Dword, &mut po.regmask_src);
                po.regmask_dst = po.regmask_src;
                let eax_mask = if po.op == Op::Lods {
                    &mut po.regmask_dst
                } else {
                    &mut po.regmask_src
                };
                setup_implicit_reg(&mut o2, XAX, LenMod::Dword, eax_mask);
                po.operands = vec![o0, o1, o2];
            }
        }

        Op::Movs | Op::Cmps => {
            if po.operands.is_empty() {
                let lmod = string_op_lmod(mnemonic)?;
                let mut o0 = Opr::default();
                let mut o1 = Opr::default();
                let mut o2 = Opr::default();
                setup_implicit_reg(&mut o0, XDI, lmod, &mut po.regmask_src);
                setup_implicit_reg(&mut o1, XSI, LenMod::Dword, &mut po.regmask_src);
                setup_implicit_reg(&mut o2, XCX, LenMod::Dword, &mut po.regmask_src);
                po.regmask_dst = po.regmask_src;
                po.operands = vec![o0, o1, o2];
            }
        }

        Op::Xlat => {
            let mut o0 = Opr::default();
            setup_implicit_reg(&mut o0, XAX, LenMod::Byte, &mut po.regmask_dst);
            po.regmask_src |= (1 << XAX) | (1 << XBX);
            po.operands = vec![o0];
        }

        Op::Jecxz => {
            // the branch label stays in the name; the tested register is
            // implicit
            po.regmask_src = 1 << XCX;
            if let Some(opr) = po.operands.first_mut() {
                opr.kind = OprKind::Reg;
                opr.reg = Some(XCX);
                opr.lmod = LenMod::Dword;
            }
        }

        Op::Loop => {
            po.regmask_src = 1 << XCX;
            po.regmask_dst = 1 << XCX;
            if let Some(opr) = po.operands.first_mut() {
                opr.kind = OprKind::Reg;
                opr.reg = Some(XCX);
                opr.lmod = LenMod::Dword;
            }
        }

        Op::Imul if po.operands.len() != 1 => {
            po.regmask_src |= po.regmask_dst;
        }

        Op::Mul | Op::Imul | Op::Div | Op::Idiv => {
            // single-operand forms write edx:eax
            po.regmask_src |= po.regmask_dst;
            po.regmask_dst = (1 << XDX) | (1 << XAX);
            if let Some(opr) = po.operands.first_mut() {
                if opr.lmod == LenMod::Unspec {
                    opr.lmod = LenMod::Dword;
                }
            }
        }

        Op::Shl | Op::Shr | Op::Sar | Op::Rol | Op::Ror => {
            po.regmask_src |= po.regmask_dst;
            if let Some(opr) = po.operands.get_mut(1) {
                if opr.lmod == LenMod::Unspec {
                    opr.lmod = LenMod::Byte;
                }
            }
        }

        Op::Shrd => {
            po.regmask_src |= po.regmask_dst;
            if let Some(opr) = po.operands.get_mut(2) {
                if opr.lmod == LenMod::Unspec {
                    opr.lmod = LenMod::Byte;
                }
            }
        }

        Op::Push => {
            po.regmask_src |= po.regmask_dst;
            po.regmask_dst = 0;
            if let Some(opr) = po.operands.first_mut() {
                if opr.lmod == LenMod::Unspec
                    && matches!(opr.kind, OprKind::Const | OprKind::Offset | OprKind::Label)
                {
                    opr.lmod = LenMod::Dword;
                }
            }
        }

        // alignment
        Op::Mov => {
            if same_reg_operands(&po) {
                po.flags |= InstFlags::RMD;
                po.regmask_src = 0;
                po.regmask_dst = 0;
            }
        }

        Op::Lea => {
            if po.operands.len() == 2
                && po.operands[0].kind == OprKind::Reg
                && po.operands[1].kind == OprKind::RegMem
                && po.operands[1].name == format!("{}+0", po.operands[0].name)
            {
                po.flags |= InstFlags::RMD;
            }
        }

        Op::Call => {
            // trashed regs must be explicitly detected later
            po.regmask_dst = 0;
        }

        Op::Leave => {
            po.regmask_dst = (1 << XBP) | (1 << XSP);
            po.regmask_src = 1 << XBP;
        }

        _ => {}
    }

    Ok(po)
}

fn string_op_lmod(mnemonic: &str) -> Result<LenMod, String> {
    match mnemonic.as_bytes().get(4) {
        Some(b'b') => Ok(LenMod::Byte),
        Some(b'w') => Ok(LenMod::Word),
        Some(b'd') => Ok(LenMod::Dword),
        _ => Err(format!("bad string op width: '{}'", mnemonic)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(mnemonic: &str, operands: &[&str]) -> Inst {
        let db = ProtoDb::default();
        let strs: Vec<String> = operands.iter().map(|s| s.to_string()).collect();
        parse_op(&db, &[], None, mnemonic, &strs, true, 1).unwrap()
    }

    #[test]
    fn test_mov_parsing() {
        let po = parse("mov", &["eax", "ecx"]);
        assert_eq!(po.op, Op::Mov);
        assert!(po.flags.contains(InstFlags::DATA));
        assert_eq!(po.regmask_dst, 1 << XAX);
        assert_eq!(po.regmask_src, 1 << XCX);
    }

    #[test]
    fn test_mov_self_removed() {
        let po = parse("mov", &["edi", "edi"]);
        assert!(po.flags.contains(InstFlags::RMD));
    }

    #[test]
    fn test_xor_zero_idiom() {
        let po = parse("xor", &["eax", "eax"]);
        assert_eq!(po.regmask_src, 0);
        assert_eq!(po.regmask_dst, 1 << XAX);
    }

    #[test]
    fn test_cdq_implicit() {
        let po = parse("cdq", &[]);
        assert_eq!(po.operands.len(), 2);
        assert_eq!(po.regmask_dst, 1 << XDX);
        assert_eq!(po.regmask_src, 1 << XAX);
    }

    #[test]
    fn test_lods_implicit() {
        let po = parse("lodsb", &[]);
        assert_eq!(po.operands.len(), 3);
        assert_eq!(po.operands[0].lmod, LenMod::Byte);
        assert_eq!(po.operands[0].reg, Some(XSI));
        assert!(po.regmask_dst & (1 << XAX) != 0);
    }

    #[test]
    fn test_jcc_pfo() {
        let db = ProtoDb::default();
        let po = parse_op(&db, &[], None, "jl", &["loc_1".to_string()], true, 1).unwrap();
        assert_eq!(po.op, Op::Jcc);
        assert_eq!(po.pfo, Some(FlagCond::L));
        assert!(!po.pfo_inv);
        assert_eq!(po.operands[0].name, "loc_1");

        let po = parse_op(&db, &[], None, "jge", &["loc_1".to_string()], true, 1).unwrap();
        assert_eq!(po.pfo, Some(FlagCond::L));
        assert!(po.pfo_inv);
    }

    #[test]
    fn test_div_implicit_dst() {
        let po = parse("div", &["ecx"]);
        assert_eq!(po.regmask_dst, (1 << XDX) | (1 << XAX));
        assert!(po.regmask_src & (1 << XCX) != 0);
    }

    #[test]
    fn test_rep_prefix_flag() {
        let db = ProtoDb::default();
        let po = parse_op(&db, &[], Some("rep"), "stosd", &[], true, 1).unwrap();
        assert!(po.flags.contains(InstFlags::REP));
        let po = parse_op(&db, &[], Some("repne"), "scasb", &[], true, 1).unwrap();
        assert!(po.flags.contains(InstFlags::REPNZ));
    }

    #[test]
    fn test_unknown_mnemonic() {
        let db = ProtoDb::default();
        assert!(parse_op(&db, &[], None, "fld", &[], true, 1).is_err());
    }

    #[test]
    fn test_lea_nop_removed() {
        let po = parse("lea", &["esi", "[esi+0]"]);
        assert!(po.flags.contains(InstFlags::RMD));
    }

    #[test]
    fn test_loop_reads_writes_ecx() {
        let db = ProtoDb::default();
        let po = parse_op(&db, &[], None, "loop", &["loc_l".to_string()], true, 1).unwrap();
        assert_eq!(po.regmask_src, 1 << XCX);
        assert_eq!(po.regmask_dst, 1 << XCX);
        assert_eq!(po.operands[0].name, "loc_l");
    }

    #[test]
    fn test_setcc_byte_lmod() {
        let po = parse("setz", &["al"]);
        assert_eq!(po.operands[0].lmod, LenMod::Byte);
        assert_eq!(po.op, Op::Scc);
    }
}
