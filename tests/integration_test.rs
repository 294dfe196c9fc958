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

use std::path::Path;

use asm2c::driver::Options;
use asm2c::file_reader::MockFileReader;
use asm2c::translate;

fn run(asm: &str, hdr: &str, opts: Options) -> String {
    let mut reader = MockFileReader::default();
    reader.add_file("test.asm", asm);
    reader.add_file("test.h", hdr);
    translate(
        Path::new("test.asm"),
        Path::new("test.h"),
        &[],
        &opts,
        &reader,
    )
    .unwrap()
}

fn run_c(asm: &str, hdr: &str) -> String {
    run(asm, hdr, Options::default())
}

#[test]
fn test_string_op_fixture() {
    let asm = "\
sub_test proc near
    mov ebx, 10000h
    mov esi, 20000h
    mov edi, 30000h
    mov ecx, 0Ah
loop:
    lodsb
    xlat
    stosb
    lodsw
    neg ax
    stosw
    lodsd
    stosd
    movsb
    cmpsw
    scasb
    loop loop
    std
    stosb
    stosw
    stosd
    cld
    cdq
    bsf eax, ecx
    mov eax, 1
    retn
sub_test endp
";
    let out = run_c(asm, "int sub_test(void);\n");

    assert!(out.contains("int sub_test(void)"), "got:\n{}", out);
    assert!(out.contains("u32 cond_z;"), "got:\n{}", out);
    assert!(out.contains("ebx = 0x10000;"), "got:\n{}", out);
    assert!(
        out.contains("LOBYTE(eax) = *(u8 *)esi; esi += 1;"),
        "got:\n{}",
        out
    );
    assert!(
        out.contains("LOBYTE(eax) = *(u8 *)(ebx + LOBYTE(eax));"),
        "got:\n{}",
        out
    );
    assert!(out.contains("*(u8 *)edi = eax; edi += 1;"), "got:\n{}", out);
    assert!(
        out.contains("LOWORD(eax) = *(u16 *)esi; esi += 2;"),
        "got:\n{}",
        out
    );
    assert!(out.contains("LOWORD(eax) = -(s16)(u16)eax;"), "got:\n{}", out);
    assert!(out.contains("eax = *(u32 *)esi; esi += 4;"), "got:\n{}", out);
    assert!(
        out.contains("*(u8 *)edi = *(u8 *)esi; edi += 1; esi += 1;"),
        "got:\n{}",
        out
    );
    assert!(
        out.contains("cond_z = (*(u16 *)esi == *(u16 *)edi); esi += 2; edi += 2;"),
        "got:\n{}",
        out
    );
    assert!(
        out.contains("cond_z = ((u8)eax == *(u8 *)edi); edi += 1;"),
        "got:\n{}",
        out
    );
    assert!(out.contains("if (--ecx != 0)"), "got:\n{}", out);
    assert!(out.contains("goto loop;"), "got:\n{}", out);
    // std propagates DF: the trailing stores walk backwards
    assert!(out.contains("*(u8 *)edi = eax; edi -= 1;"), "got:\n{}", out);
    assert!(out.contains("*(u16 *)edi = eax; edi -= 2;"), "got:\n{}", out);
    assert!(out.contains("*(u32 *)edi = eax; edi -= 4;"), "got:\n{}", out);
    assert!(out.contains("edx = (s32)eax >> 31;"), "got:\n{}", out);
    assert!(
        out.contains("eax = ecx ? __builtin_ffs(ecx) - 1 : 0;"),
        "got:\n{}",
        out
    );
    assert!(out.contains("eax = 1;"), "got:\n{}", out);
    assert!(out.contains("return eax;"), "got:\n{}", out);
}

#[test]
fn test_bp_frame_one_arg() {
    let asm = "\
f proc near
    push ebp
    mov ebp, esp
    mov eax, [ebp+8]
    add eax, 1
    pop ebp
    retn
f endp
";
    let out = run_c(asm, "int f(int a1);\n");

    assert!(out.contains("int f(int a1)"), "got:\n{}", out);
    assert!(out.contains("eax = (u32)a1;"), "got:\n{}", out);
    assert!(out.contains("eax += 1;"), "got:\n{}", out);
    assert!(out.contains("return eax;"), "got:\n{}", out);
    // the prologue and epilogue leave no trace
    assert!(!out.contains("ebp"), "got:\n{}", out);
}

#[test]
fn test_stdcall_stack_args() {
    let asm = "\
f proc near
    push ebp
    mov ebp, esp
    mov eax, [ebp+8]
    add eax, [ebp+0Ch]
    pop ebp
    retn 8
f endp
";
    let out = run_c(asm, "int __stdcall f(int a1, int a2);\n");

    assert!(out.contains("int __stdcall f(int a1, int a2)"), "got:\n{}", out);
    assert!(out.contains("eax += (u32)a2;"), "got:\n{}", out);
    assert!(!out.contains("esp"), "got:\n{}", out);
}

#[test]
fn test_fastcall_synthesis() {
    let asm = "\
f proc near
    mov ecx, 1
    mov edx, 2
    call eax
    retn
f endp
";
    let opts = Options {
        allow_regfunc: true,
        ..Default::default()
    };
    let out = run(asm, "int f(void);\n", opts);

    assert!(out.contains("__fastcall *icall"), "got:\n{}", out);
    assert!(out.contains("unresolved_call"), "got:\n{}", out);
    assert!(out.contains("(ecx, edx);"), "got:\n{}", out);
    assert!(out.contains("unresolved 2reg"), "got:\n{}", out);
}

#[test]
fn test_jump_table() {
    let asm = "\
f proc near
    jmp ds:jpt_0[eax*4]
loc_1:
    mov eax, 1
    retn
loc_2:
    mov eax, 2
    retn
f endp
jpt_0 dd offset loc_1, offset loc_2
";
    let out = run_c(asm, "int f(void);\n");

    assert!(
        out.contains("static const void *jt_jpt_0[] =\n    { &&loc_1, &&loc_2 };"),
        "got:\n{}",
        out
    );
    assert!(out.contains("goto *jt_jpt_0[eax];"), "got:\n{}", out);
    assert!(out.contains("\nloc_1:\n"), "got:\n{}", out);
    assert!(out.contains("\nloc_2:\n"), "got:\n{}", out);
}

#[test]
fn test_signed_compare_direct() {
    let asm = "\
f proc near
    cmp eax, ebx
    jl loc_less
    mov eax, 0
    retn
loc_less:
    mov eax, 1
    retn
f endp
";
    let out = run_c(asm, "int f(void);\n");

    // direct path: no cond_* detour for the immediately following consumer
    assert!(
        out.contains("if ((s32)eax < (s32)ebx)"),
        "got:\n{}",
        out
    );
    assert!(out.contains("goto loc_less;"), "got:\n{}", out);
    assert!(!out.contains("cond_l"), "got:\n{}", out);
}

#[test]
fn test_unsigned_compare() {
    let asm = "\
f proc near
    cmp eax, ebx
    jb loc_less
    mov eax, 0
    retn
loc_less:
    mov eax, 1
    retn
f endp
";
    let out = run_c(asm, "int f(void);\n");
    assert!(out.contains("if (eax < ebx)"), "got:\n{}", out);
}

#[test]
fn test_reg_save_pair_removed() {
    let asm = "\
f proc near
    push esi
    mov esi, 5
    mov eax, esi
    pop esi
    retn
f endp
";
    let out = run_c(asm, "int f(void);\n");

    // push/pop pair fully optimized out
    assert!(!out.contains("s_esi"), "got:\n{}", out);
    assert!(out.contains("esi = 5;"), "got:\n{}", out);
    assert!(out.contains("eax = esi;"), "got:\n{}", out);
}

#[test]
fn test_call_args_inline() {
    let asm = "\
f proc near
    push 2
    push 1
    call two_args
    add esp, 8
    retn
f endp
";
    let out = run_c(asm, "int f(void);\nint two_args(int a, int b);\n");

    assert!(out.contains("eax = two_args(1, 2);"), "got:\n{}", out);
    assert!(!out.contains("esp"), "got:\n{}", out);
}

#[test]
fn test_stdcall_callee_no_adjust() {
    let asm = "\
f proc near
    push 1
    call one_arg
    retn
f endp
";
    let out = run_c(asm, "int f(void);\nint __stdcall one_arg(int a);\n");
    assert!(out.contains("eax = one_arg(1);"), "got:\n{}", out);
}

#[test]
fn test_cond_var_across_branch() {
    let asm = "\
f proc near
    cmp eax, 1
    jz loc_set
    test ebx, ebx
    jmp loc_join
loc_set:
    cmp ecx, 2
loc_join:
    jz loc_out
    mov eax, 0
    retn
loc_out:
    mov eax, 1
    retn
f endp
";
    let out = run_c(asm, "int f(void);\n");

    // the consumer behind the join sees two different setters, so both
    // materialize the flag
    assert!(out.contains("u32 cond_z;"), "got:\n{}", out);
    assert!(out.contains("cond_z = (ebx == 0);"), "got:\n{}", out);
    assert!(out.contains("cond_z = (ecx == 2);"), "got:\n{}", out);
    assert!(out.contains("if (cond_z)"), "got:\n{}", out);
    // the first consumer still gets the direct form
    assert!(out.contains("if (eax == 1)"), "got:\n{}", out);
}

#[test]
fn test_setcc() {
    let asm = "\
f proc near
    cmp eax, ebx
    setz cl
    retn
f endp
";
    let out = run_c(asm, "int f(void);\n");
    assert!(out.contains("LOBYTE(ecx) = (eax == ebx);"), "got:\n{}", out);
}

#[test]
fn test_noreturn_callee_tail() {
    let asm = "\
f proc near
    push 1
    call die
f endp
";
    let out = run_c(asm, "int f(void);\nnoreturn void die(int code);\n");
    assert!(out.contains("die(1);"), "got:\n{}", out);
    assert!(out.contains("noreturn"), "got:\n{}", out);
}

#[test]
fn test_tailcall_jump() {
    let asm = "\
f proc near
    mov eax, 1
    jmp other
f endp
";
    let out = run_c(asm, "int f(void);\nint other(void);\n");
    assert!(out.contains("return other();"), "got:\n{}", out);
    assert!(out.contains("tailcall"), "got:\n{}", out);
}

#[test]
fn test_stack_local_union() {
    let asm = "\
f proc near
var_4 = dword ptr -4
    push ebp
    mov ebp, esp
    sub esp, 10h
    mov [ebp+var_4], 5
    mov eax, [ebp+var_4]
    mov esp, ebp
    pop ebp
    retn
f endp
";
    let out = run_c(asm, "int f(void);\n");

    assert!(
        out.contains("union { u32 d[4]; u16 w[8]; u8 b[16]; } sf;"),
        "got:\n{}",
        out
    );
    assert!(out.contains("sf.d[3] = 5;"), "got:\n{}", out);
    assert!(out.contains("eax = sf.d[3];"), "got:\n{}", out);
}

#[test]
fn test_unused_stack_frame_voided() {
    let asm = "\
f proc near
    push ebp
    mov ebp, esp
    sub esp, 10h
    mov eax, 1
    mov esp, ebp
    pop ebp
    retn
f endp
";
    let out = run_c(asm, "int f(void);\n");
    assert!(out.contains("(void)sf;"), "got:\n{}", out);
}

#[test]
fn test_global_label_access() {
    let asm = "\
f proc near
    mov eax, dword_4FE930
    retn
f endp
";
    let out = run_c(asm, "int f(void);\nint dword_4FE930;\n");
    assert!(out.contains("eax = dword_4FE930;"), "got:\n{}", out);
}

#[test]
fn test_offset_operand() {
    let asm = "\
f proc near
    mov eax, offset byte_4FE930
    retn
f endp
";
    let out = run_c(asm, "int f(void);\nchar byte_4FE930;\n");
    assert!(out.contains("eax = (u32)&byte_4FE930;"), "got:\n{}", out);
}

#[test]
fn test_rep_stos_loop() {
    let asm = "\
f proc near
    mov edi, dst_buf
    mov ecx, 10h
    xor eax, eax
    rep stosd
    retn
f endp
";
    let out = run_c(asm, "void f(void);\nint dst_buf;\n");

    assert!(
        out.contains("for (; ecx != 0; ecx--, edi += 4)"),
        "got:\n{}",
        out
    );
    assert!(out.contains("*(u32 *)edi = eax;"), "got:\n{}", out);
}

#[test]
fn test_skip_list_file() {
    let mut reader = MockFileReader::default();
    reader.add_file(
        "test.asm",
        "skipme proc near\nmov eax, 1\nretn\nskipme endp\nkeep proc near\nmov eax, 2\nretn\nkeep endp\n",
    );
    reader.add_file("test.h", "int skipme(void);\nint keep(void);\n");
    reader.add_file("skip.txt", "skipme\n");

    let out = translate(
        Path::new("test.asm"),
        Path::new("test.h"),
        &[Path::new("skip.txt")],
        &Options::default(),
        &reader,
    )
    .unwrap();

    assert!(!out.contains("skipme"), "got:\n{}", out);
    assert!(out.contains("int keep(void)"), "got:\n{}", out);
}

#[test]
fn test_unknown_mnemonic_fails() {
    let mut reader = MockFileReader::default();
    reader.add_file("test.asm", "f proc near\nfld st0\nretn\nf endp\n");
    reader.add_file("test.h", "int f(void);\n");
    let err = translate(
        Path::new("test.asm"),
        Path::new("test.h"),
        &[],
        &Options::default(),
        &reader,
    );
    assert!(err.is_err());
}

#[test]
fn test_fs_prefix_fails() {
    let mut reader = MockFileReader::default();
    reader.add_file("test.asm", "f proc near\nmov eax, fs:dword_0\nretn\nf endp\n");
    reader.add_file("test.h", "int f(void);\n");
    let err = translate(
        Path::new("test.asm"),
        Path::new("test.h"),
        &[],
        &Options::default(),
        &reader,
    );
    assert!(err.is_err());
}

#[test]
fn test_header_mode() {
    let asm = "\
stdfunc proc near
    mov eax, 1
    retn 8
stdfunc endp
regfunc proc near
    mov eax, ecx
    retn
regfunc endp
voidfunc proc near
    mov ecx, 3
    retn
voidfunc endp
";
    let opts = Options {
        header_mode: true,
        ..Default::default()
    };
    let out = run(asm, "\n", opts);

    assert!(out.contains("__stdcall"), "got:\n{}", out);
    assert!(out.contains("__fastcall regfunc(int a1/*<ecx>*/"), "got:\n{}", out);
    assert!(out.contains("void "), "got:\n{}", out);
    // output is sorted by name
    let std_pos = out.find("stdfunc").unwrap();
    let reg_pos = out.find("regfunc").unwrap();
    assert!(reg_pos < std_pos, "got:\n{}", out);
}

#[test]
fn test_push_pop_const_pair() {
    let asm = "\
f proc near
    push 5
    pop ecx
    mov eax, ecx
    retn
f endp
";
    let out = run_c(asm, "int f(void);\n");
    assert!(out.contains("ecx = 5;"), "got:\n{}", out);
}

#[test]
fn test_attributes_noreturn() {
    let asm = "\
; Attributes: noreturn
f proc near
    push 1
    call die
f endp
";
    let out = run_c(asm, "void f(void);\nnoreturn void die(int code);\n");
    assert!(out.contains("void noreturn f(void)"), "got:\n{}", out);
}

#[test]
fn test_function_chunks() {
    let asm = "\
f proc near
    mov eax, 1
; FUNCTION CHUNK AT 0
    jmp loc_chunk
loc_back:
    retn
f endp
g proc near
    mov eax, 3
    retn
g endp
; START OF FUNCTION CHUNK FOR f
loc_chunk:
    add eax, 2
    jmp loc_back
; END OF FUNCTION CHUNK
";
    let out = run_c(asm, "int f(void);\nint g(void);\n");

    assert!(out.contains("int f(void)"), "got:\n{}", out);
    assert!(out.contains("int g(void)"), "got:\n{}", out);
    assert!(out.contains("loc_chunk:"), "got:\n{}", out);
    assert!(out.contains("eax += 2;"), "got:\n{}", out);
    assert!(out.contains("goto loc_back;"), "got:\n{}", out);
}

#[test]
fn test_movzx_movsx() {
    let asm = "\
f proc near
    movzx eax, byte_4FE931
    movsx ecx, ax
    retn
f endp
";
    let out = run_c(asm, "int f(void);\nchar byte_4FE931;\n");
    assert!(out.contains("eax = byte_4FE931;"), "got:\n{}", out);
    assert!(out.contains("ecx = (s16)eax;"), "got:\n{}", out);
}

#[test]
fn test_real_files() {
    use asm2c::file_reader::AsmFileReader;

    let dir = tempfile::tempdir().unwrap();
    let asm_path = dir.path().join("in.asm");
    let hdr_path = dir.path().join("in.h");
    std::fs::write(&asm_path, "f proc near\nmov eax, 1\nretn\nf endp\n").unwrap();
    std::fs::write(&hdr_path, "int f(void);\n").unwrap();

    let out = translate(
        &asm_path,
        &hdr_path,
        &[],
        &Options::default(),
        &AsmFileReader,
    )
    .unwrap();
    assert!(out.contains("int f(void)"), "got:\n{}", out);
    assert!(out.contains("eax = 1;"), "got:\n{}", out);
}

#[test]
fn test_div_with_cdq() {
    let asm = "\
f proc near
    cdq
    idiv ecx
    retn
f endp
";
    let out = run_c(asm, "int f(void);\n");

    // cdq followed by idiv becomes plain 32bit division
    assert!(out.contains("eax = (s32)eax / (s32)ecx;"), "got:\n{}", out);
    assert!(out.contains("edx = (s32)eax % (s32)ecx;"), "got:\n{}", out);
    assert!(!out.contains("tmp64"), "got:\n{}", out);
}
