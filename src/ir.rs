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

use bitflags::bitflags;

use crate::header::Proto;

/// Hard cap on instructions per procedure.
pub const MAX_OPS: usize = 4096;

// 32-bit register names double as the C local names in the output.
// mm0..mm7 are not r32 but live in the same table for parsing and printing.
pub const REGS_R32: [&str; 16] = [
    "eax", "ebx", "ecx", "edx", "esi", "edi", "ebp", "esp", "mm0", "mm1", "mm2", "mm3", "mm4",
    "mm5", "mm6", "mm7",
];
pub const REGS_R16: [&str; 8] = ["ax", "bx", "cx", "dx", "si", "di", "bp", "sp"];
pub const REGS_R8L: [&str; 4] = ["al", "bl", "cl", "dl"];
pub const REGS_R8H: [&str; 4] = ["ah", "bh", "ch", "dh"];

pub const XAX: usize = 0;
pub const XBX: usize = 1;
pub const XCX: usize = 2;
pub const XDX: usize = 3;
pub const XSI: usize = 4;
pub const XDI: usize = 5;
pub const XBP: usize = 6;
pub const XSP: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Op {
    #[default]
    Inval,
    Nop,
    Push,
    Pop,
    Leave,
    Mov,
    Lea,
    Movzx,
    Movsx,
    Xchg,
    Not,
    Cdq,
    Lods,
    Stos,
    Movs,
    Cmps,
    Scas,
    Xlat,
    Std,
    Cld,
    Ret,
    Add,
    Sub,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Sar,
    Shrd,
    Rol,
    Ror,
    Rcl,
    Rcr,
    Adc,
    Sbb,
    Bsf,
    Inc,
    Dec,
    Neg,
    Mul,
    Imul,
    Div,
    Idiv,
    Test,
    Cmp,
    Call,
    Jmp,
    Jecxz,
    Loop,
    Jcc,
    Scc,
    // mmx
    Emms,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OprKind {
    #[default]
    Unspec,
    Reg,
    RegMem,
    Label,
    Offset,
    Const,
}

// Ordered: widening decisions compare these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LenMod {
    #[default]
    Unspec,
    Byte,
    Word,
    Dword,
    Qword,
}

impl LenMod {
    pub fn bytes(self) -> Option<u32> {
        match self {
            LenMod::Byte => Some(1),
            LenMod::Word => Some(2),
            LenMod::Dword => Some(4),
            LenMod::Qword => Some(8),
            LenMod::Unspec => None,
        }
    }
}

// Basic comparison types the condition-code ops depend on, without inversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagCond {
    O,  // OF=1
    C,  // CF=1
    Z,  // ZF=1
    Be, // CF=1 || ZF=1
    S,  // SF=1
    P,  // PF=1
    L,  // SF != OF
    Le, // ZF=1 || SF != OF
}

pub const FLAG_CONDS: [FlagCond; 8] = [
    FlagCond::O,
    FlagCond::C,
    FlagCond::Z,
    FlagCond::Be,
    FlagCond::S,
    FlagCond::P,
    FlagCond::L,
    FlagCond::Le,
];

impl FlagCond {
    pub fn name(self) -> &'static str {
        match self {
            FlagCond::O => "o",
            FlagCond::C => "c",
            FlagCond::Z => "z",
            FlagCond::Be => "be",
            FlagCond::S => "s",
            FlagCond::P => "p",
            FlagCond::L => "l",
            FlagCond::Le => "le",
        }
    }

    pub fn bit(self) -> u32 {
        1 << self as u32
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct InstFlags: u32 {
        const RMD    = 1 << 0;  // removed or optimized out
        const DATA   = 1 << 1;  // data processing, writes operand 0
        const FLAGS  = 1 << 2;  // sets condition flags
        const JMP    = 1 << 3;  // branch or call
        const CJMP   = 1 << 4;  // conditional branch (cc or jecxz/loop)
        const CC     = 1 << 5;  // uses condition flags
        const TAIL   = 1 << 6;  // ret or tail call
        const RSAVE  = 1 << 7;  // push/pop is a local reg save/restore
        const REP    = 1 << 8;
        const REPZ   = 1 << 9;
        const REPNZ  = 1 << 10;
        const FARG   = 1 << 11; // push collected as call arg, no reuse
        const EBP_S  = 1 << 12; // ebp is scratch here, not a frame pointer
        const DF     = 1 << 13; // direction flag set at this op
        const ATAIL  = 1 << 14; // tail call reusing the incoming arg frame
        const BIT32  = 1 << 15; // 32-bit division variant
        const LOCK   = 1 << 16;
        const VAPUSH = 1 << 17; // vararg list push (as call arg)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FuncAttrs: u32 {
        const BP_FRAME = 1 << 0;
        const LIB_FUNC = 1 << 1;
        const STATIC   = 1 << 2;
        const NORETURN = 1 << 3;
        const THUNK    = 1 << 4;
        const FPD      = 1 << 5;
    }
}

#[derive(Debug, Clone, Default)]
pub struct Opr {
    pub kind: OprKind,
    pub lmod: LenMod,
    pub reg: Option<usize>,
    pub val: u32,
    // label name, or the C-converted memory expression for RegMem
    pub name: String,
    // matching prototype record, for Label/Offset
    pub pp: Option<Proto>,
    pub is_ptr: bool,
    pub is_array: bool,
    pub type_from_var: bool,
    pub size_mismatch: bool,
    pub size_lt: bool,
    pub had_ds: bool,
}

impl Opr {
    pub fn new_reg(reg: usize, lmod: LenMod) -> Self {
        Opr {
            kind: OprKind::Reg,
            lmod,
            reg: Some(reg),
            name: REGS_R32[reg].to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Inst {
    pub op: Op,
    pub operands: Vec<Opr>,
    pub flags: InstFlags,
    pub pfo: Option<FlagCond>,
    pub pfo_inv: bool,
    pub regmask_src: u32,
    pub regmask_dst: u32,
    // flag results that must be materialized into cond_* variables
    pub pfomask: u32,
    // per-pass visited-epoch marker
    pub cc_scratch: u32,
    pub bt_i: Option<usize>,
    // index into FuncContext::func_pd for jumptable branches
    pub btj: Option<usize>,
    // cloned prototype, for Call
    pub pp: Option<Proto>,
    // inline prototype hint from the listing (sctproto)
    pub proto_hint: Option<String>,
    // for a CC consumer: the FLAGS setter it reads
    pub flag_setter: Option<usize>,
    // for a Pop: the paired constant Push
    pub pair_push: Option<usize>,
    pub p_argnum: u8,
    pub p_arggrp: u8,
    pub p_argpass: u8,
    // another push of the same logical argument
    pub p_argnext: Option<usize>,
    pub asmln: usize,
}

impl Inst {
    pub fn operand_name(&self, idx: usize) -> &str {
        self.operands.get(idx).map(|o| o.name.as_str()).unwrap_or("")
    }

    /// Mnemonic-ish name for diagnostics.
    pub fn op_name(&self) -> String {
        if self.op == Op::Jcc || self.op == Op::Scc {
            let mut s = String::from(if self.op == Op::Jcc { "j" } else { "set" });
            if self.pfo_inv {
                s.push('n');
            }
            if let Some(pfo) = self.pfo {
                s.push_str(pfo.name());
            }
            return s;
        }
        format!("{:?}", self.op).to_lowercase()
    }

    /// Instruction text for diagnostics, mnemonic plus operands.
    pub fn dump(&self) -> String {
        let mut out = self.op_name();
        for (i, opr) in self.operands.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push(' ');
            if opr.kind == OprKind::RegMem {
                out.push('[');
                out.push_str(&opr.name);
                out.push(']');
            } else {
                out.push_str(&opr.name);
            }
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct Equate {
    pub name: String,
    pub lmod: LenMod,
    pub offset: i32,
}

#[derive(Debug, Clone)]
pub enum DataVal {
    Num(u32),
    Label(String),
}

#[derive(Debug, Clone)]
pub struct DataItem {
    pub val: DataVal,
    pub bt_i: Option<usize>,
}

// A db/dw/dd block inside a procedure; jump tables and constant arrays.
#[derive(Debug, Clone)]
pub struct ParsedData {
    pub label: String,
    pub kind: OprKind, // Const or Offset
    pub lmod: LenMod,
    pub items: Vec<DataItem>,
}

/// Last op in stream: unconditional branch or ret.
pub fn is_last_op(po: &Inst) -> bool {
    po.flags.contains(InstFlags::TAIL)
        || (po.flags & (InstFlags::JMP | InstFlags::CJMP | InstFlags::RMD) == InstFlags::JMP
            && po.op != Op::Call)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lenmod_order() {
        assert!(LenMod::Byte < LenMod::Word);
        assert!(LenMod::Word < LenMod::Dword);
        assert!(LenMod::Dword < LenMod::Qword);
        assert_eq!(LenMod::Dword.bytes(), Some(4));
    }

    #[test]
    fn test_op_name_cc() {
        let po = Inst {
            op: Op::Jcc,
            pfo: Some(FlagCond::Z),
            pfo_inv: true,
            ..Default::default()
        };
        assert_eq!(po.op_name(), "jnz");
    }

    #[test]
    fn test_flag_cond_bits() {
        assert_eq!(FlagCond::O.bit(), 1);
        assert_eq!(FlagCond::Le.bit(), 0x80);
    }
}
