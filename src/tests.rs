//! Whole-pipeline scenario tests: source string in, assembly string out.
//! Assembles a whole program and asserts on the rendered NASM text, the
//! same shape as asserting on an encoded instruction stream, just with
//! text instead of bytes.

use crate::parser::Parser;

/// Parses and emits `src` as a file named `t.sc`, panicking (failing the
/// test) on any compile error — the helper every scenario below builds on.
fn compile_ok(src: &str) -> String {
    let out = Parser::from_source("t.sc", src)
        .and_then(|p| p.parse())
        .unwrap_or_else(|e| panic!("unexpected compile error: {}", e));
    crate::emit::emit(&out.root, &out.symtab).unwrap_or_else(|e| panic!("unexpected emit error: {}", e))
}

fn compile_err(src: &str) -> String {
    let result = Parser::from_source("t.sc", src).and_then(|p| p.parse());
    match result {
        Ok(_) => panic!("expected a compile error, but compilation succeeded"),
        Err(e) => format!("{}", e),
    }
}

/// Asserts that every needle appears in `asm`, in order of appearance
/// (each search resumes after the previous match).
macro_rules! asm_contains_in_order {
    ($asm:expr, $($needle:expr),+ $(,)?) => {{
        let asm: &str = $asm;
        let mut cursor = 0usize;
        $(
            let rest = &asm[cursor..];
            let found = rest.find($needle).unwrap_or_else(|| {
                panic!("expected to find {:?} (after position {}) in:\n{}", $needle, cursor, asm)
            });
            cursor += found + $needle.len();
        )+
    }};
}

#[test]
fn scenario_1_hello_world_equivalent() {
    let asm = compile_ok("void main() { }");
    asm_contains_in_order!(
        &asm,
        "main_:",
        "push rbp",
        "mov rbp, rsp",
        "mov rax, 60",
        "xor rdi, rdi",
        "syscall",
    );
    assert!(!asm.contains("\nret\n"), "main_ must exit via syscall, never ret:\n{}", asm);
}

#[test]
fn scenario_2_constant_folding() {
    let asm = compile_ok("int main_ret() { return 2 + 3 * 4; } void main() { }");
    assert!(asm.contains("mov eax, 14"));
    assert!(!asm.contains("add eax"));
    assert!(!asm.contains("imul"));
}

#[test]
fn scenario_3_power_of_two_strength_reduction() {
    let asm = compile_ok("int f(int x) { return x * 8; } void main() { }");
    assert!(asm.contains("sal eax, 3"));
    assert!(!asm.contains("imul"));
}

#[test]
fn scenario_4_nested_call_preservation() {
    let asm = compile_ok(
        "int add(int a, int b) { return a + b; } \
         int id(int x) { return x; } \
         void main() { add(1, id(2)); }",
    );
    // `1` is staged into `edi` first; since the *next* argument is itself a
    // call, `edi` is spilled to the stack before `id_` runs and restored
    // after, so `id_`'s own argument setup can't clobber it.
    asm_contains_in_order!(
        &asm,
        "mov edi, eax",
        "push rdi",
        "call id_",
        "mov esi, eax",
        "pop rdi",
        "call add_",
    );
}

#[test]
fn scenario_5_mutability_rejection() {
    let msg = compile_err("void main() { int x = 1; x = 2; }");
    assert!(msg.contains("reassigning immutable variable 'x'"), "{}", msg);

    // Replacing `int x` with `mut int x` compiles.
    compile_ok("void main() { mut int x = 1; x = 2; }");
}

#[test]
fn scenario_6_array_bounds_at_declaration() {
    let msg = compile_err("void main() { int a[3] = {1,2,3,4}; }");
    assert!(msg.contains("too large"), "{}", msg);

    let asm = compile_ok("void main() { int a[4] = {1,2,3,4}; }");
    // Four 4-byte elements lay out at [rbp-16] down to [rbp-4].
    assert!(asm.contains("[rbp-16]"));
    assert!(asm.contains("[rbp-4]"));
}

#[test]
fn invariant_main_epilogue_is_exactly_exit_syscall() {
    let asm = compile_ok("void main() { }");
    asm_contains_in_order!(&asm, "pop rbp", "mov rax, 60", "xor rdi, rdi", "syscall");
}

#[test]
fn invariant_repeated_compilation_is_idempotent() {
    let src = "int f(int x, float y) { return x + 1; } \
               void main() { int a[2] = {1, 2}; mut int i = 0; while (i < 2) { i += 1; } }";
    assert_eq!(compile_ok(src), compile_ok(src));
}

#[test]
fn boundary_stack_growth_rounds_to_32_bytes() {
    let asm = compile_ok("void main() { char c = 1; }");
    assert!(asm.contains("sub rsp, 32"));
}

#[test]
fn boundary_seventh_int_param_spills_to_stack_slot() {
    let asm = compile_ok(
        "int sum7(int a, int b, int c, int d, int e, int f, int g) { return a + g; } \
         void main() { sum7(1, 2, 3, 4, 5, 6, 7); }",
    );
    // callee reads its 7th parameter back off the stack...
    assert!(asm.contains("[rbp+16]"), "{}", asm);
    // ...and the caller reserves space and writes it there before `call`.
    assert!(asm.contains("sub rsp, 8"), "{}", asm);
    asm_contains_in_order!(&asm, "sub rsp, 8", "mov [rsp+0], eax", "call sum7_", "add rsp, 8");
}

#[test]
fn boundary_sixteenth_float_param_spills_to_stack_slot() {
    let params = (0..16).map(|i| format!("float f{}", i)).collect::<Vec<_>>().join(", ");
    let sums = (0..16).map(|i| format!("f{}", i)).collect::<Vec<_>>().join(" + ");
    let src = format!(
        "float sum16({}) {{ return {}; }} void main() {{ }}",
        params, sums
    );
    let asm = compile_ok(&src);
    assert!(asm.contains("[rbp+16]"), "{}", asm);
    assert!(asm.contains("xmm15"), "{}", asm);
}

#[test]
fn mixed_int_float_math_converts_before_combining() {
    let asm = compile_ok("float f(int x) { return x + 1.5; } void main() { }");
    assert!(asm.contains("cvtsi2ss") || asm.contains("cvtsi2sd") || asm.contains("cvttss2si") || asm.contains("addss"));
}

#[test]
fn short_circuit_and_binds_tighter_than_or() {
    // `a || b && c` must behave as `a || (b && c)`, i.e. a true `a` alone
    // should skip evaluating `b && c` entirely and take the true branch.
    let asm = compile_ok(
        "void main() { \
            mut int a = 1; mut int b = 0; mut int c = 0; \
            if (a == 1 || b == 1 && c == 1) { a = 2; } \
         }",
    );
    assert!(asm.contains("jmp"));
}

#[test]
fn direct_recursion_is_rejected() {
    let msg = compile_err("void main() { main(); }");
    assert!(msg.contains("infinite recursion"));

    let msg = compile_err("int fact(int n) { return n * fact(n - 1); } void main() { }");
    assert!(msg.contains("infinite recursion"), "{}", msg);
}
