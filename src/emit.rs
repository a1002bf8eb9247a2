//! NASM x86-64 code generation.
//!
//! Per-function prologue/epilogue, flat math reduction, and no general
//! register allocator: left operands accumulate in `eax`/`rax` (int class)
//! or `xmm0` (float class), right operands in `ebx`/`xmm1`, a fixed-role
//! scheme used throughout instead of allocating registers per expression.

use crate::ast::*;
use crate::error::Error;
use crate::symtab::{SymbolKind, SymbolTable, VarLoc};
use std::fmt::Write as _;

type Result<T> = std::result::Result<T, Error>;

pub fn emit(root: &Root, symtab: &SymbolTable) -> Result<String> {
    let mut globals_data = String::new();
    for item in &root.items {
        if let Item::Global(assign) = item {
            emit_global(assign, symtab, &mut globals_data)?;
        }
    }

    let mut text = String::new();
    text.push_str("section .text\nglobal main_\n");
    for item in &root.items {
        if let Item::Func(f) = item {
            text.push_str(&emit_function(f, symtab)?);
        }
    }

    let mut out = String::new();
    out.push_str(&text);
    if !globals_data.is_empty() {
        out.push_str("\nsection .data\n");
        out.push_str(&globals_data);
    }
    Ok(out)
}

fn label_name(name: &str) -> String {
    format!("{}_", name)
}

/// Globals are implemented as true static storage (`section .data`),
/// addressed by a mangled label. Only constant-foldable initializers are
/// supported for globals.
fn emit_global(assign: &Assign, symtab: &SymbolTable, out: &mut String) -> Result<()> {
    let sym = symtab.get(assign.sym);
    sym.loc.set(Some(VarLoc::Static));
    let label = label_name(&assign.name);

    match &assign.value {
        Some(Expr::IntLit(v)) => {
            let directive = match sym.ty.size() {
                1 => "db",
                8 => "dq",
                _ => "dd",
            };
            let _ = writeln!(out, "{}: {} {}", label, directive, v);
        }
        Some(Expr::FloatLit(v)) => {
            let _ = writeln!(out, "{}: dd {}", label, float_bits(*v));
        }
        Some(Expr::ArrayLit(items)) => {
            let cap = sym.arr_cap.unwrap_or(items.len() as u32);
            emit_global_array(&label, &items[..], sym.ty, cap, out)?;
        }
        Some(Expr::StrLit(bytes)) => {
            let cap = sym.arr_cap.unwrap_or(bytes.len() as u32 + 1);
            let _ = write!(out, "{}: db ", label);
            let mut parts: Vec<String> = bytes.iter().map(|b| b.to_string()).collect();
            parts.push("0".to_owned());
            for _ in (bytes.len() as u32 + 1)..cap {
                parts.push("0".to_owned());
            }
            let _ = writeln!(out, "{}", parts.join(", "));
        }
        None => {
            let size = sym
                .arr_cap
                .map(|n| n as u32 * sym.ty.size())
                .unwrap_or_else(|| sym.ty.size());
            let _ = writeln!(out, "{}: resb {}", label, size.max(1));
        }
        _ => {
            return Err(global_const_error(&assign.name, assign.line, assign.col));
        }
    }
    Ok(())
}

fn emit_global_array(
    label: &str,
    items: &[Expr],
    elem_ty: Type,
    cap: u32,
    out: &mut String,
) -> Result<()> {
    let directive = match elem_ty.size() {
        1 => "db",
        8 => "dq",
        _ => "dd",
    };
    let mut values = Vec::new();
    for e in items {
        match e {
            Expr::IntLit(v) => values.push(v.to_string()),
            Expr::FloatLit(v) => values.push(float_bits(*v).to_string()),
            _ => return Err(global_const_error(label, 0, 0)),
        }
    }
    for _ in (items.len() as u32)..cap {
        values.push("0".to_owned());
    }
    let _ = writeln!(out, "{}: {} {}", label, directive, values.join(", "));
    Ok(())
}

fn global_const_error(name: &str, line: u32, col: u32) -> Error {
    crate::error::Diagnostic::new(
        "<global>",
        line,
        col,
        format!("global initializer for '{}' must be a constant", name),
    )
    .into()
}

fn float_bits(v: f64) -> u32 {
    (v as f32).to_bits()
}

struct FuncState<'a> {
    symtab: &'a SymbolTable,
    func_name: String,
    is_main: bool,
    ret_type: Type,
    body: String,
    data: String,
    label_n: u32,
    float_n: u32,
    str_n: u32,
}

impl<'a> FuncState<'a> {
    fn new_label(&mut self) -> String {
        self.label_n += 1;
        format!(".L{}", self.label_n)
    }

    fn emit(&mut self, line: &str) {
        self.body.push_str(line);
        self.body.push('\n');
    }

    fn emitf(&mut self, args: std::fmt::Arguments) {
        self.body.push_str(&args.to_string());
        self.body.push('\n');
    }

    fn frame_operand(&self, sym_idx: usize) -> String {
        let sym = self.symtab.get(sym_idx);
        match sym.loc.get() {
            Some(VarLoc::Frame(off)) => format!("[rbp-{}]", off),
            Some(VarLoc::Static) | None => format!("[rel {}]", label_name(&sym.name)),
        }
    }

    fn new_float_label(&mut self, v: f64) -> String {
        self.float_n += 1;
        let label = format!(".f{}", self.float_n);
        let _ = writeln!(self.data, "{}: dd {}", label, float_bits(v));
        label
    }

    fn new_str_label(&mut self, bytes: &[u8]) -> String {
        self.str_n += 1;
        let label = format!(".s{}", self.str_n);
        let mut parts: Vec<String> = bytes.iter().map(|b| b.to_string()).collect();
        parts.push("0".to_owned());
        let _ = writeln!(self.data, "{}: db {}", label, parts.join(", "));
        label
    }
}

fn round32(n: i64) -> i64 {
    if n <= 0 {
        0
    } else {
        ((n + 31) / 32) * 32
    }
}

/// Pre-pass: assigns a frame slot to every parameter and every locally
/// declared variable (including inside nested `if`/`while`/`for` bodies)
/// before any instruction is emitted, so the prologue's `sub rsp, N` is
/// known up front.
fn layout_function(func: &Func, symtab: &SymbolTable) -> i64 {
    let mut offset = 0i64;
    for p in &func.params {
        offset += p.ty.size() as i64;
        if let Some(idx) = symtab.lookup_idx(SymbolKind::Var, &func.name, &p.name) {
            symtab.get(idx).loc.set(Some(VarLoc::Frame(offset)));
        }
    }
    layout_stmts(&func.body, symtab, offset)
}

fn layout_stmts(stmts: &[Stmt], symtab: &SymbolTable, mut offset: i64) -> i64 {
    for s in stmts {
        match s {
            Stmt::Assign(a) => {
                offset = layout_one_decl(a, symtab, offset);
            }
            Stmt::IfElse {
                body, else_body, ..
            } => {
                offset = layout_stmts(body, symtab, offset);
                if let Some(eb) = else_body {
                    offset = layout_stmts(eb, symtab, offset);
                }
            }
            Stmt::While { body, .. } => {
                offset = layout_stmts(body, symtab, offset);
            }
            Stmt::For {
                init, body, step, ..
            } => {
                offset = layout_one_decl(init, symtab, offset);
                offset = layout_one_decl(step, symtab, offset);
                offset = layout_stmts(body, symtab, offset);
            }
            _ => {}
        }
    }
    offset
}

fn layout_one_decl(a: &Assign, symtab: &SymbolTable, mut offset: i64) -> i64 {
    if let Some(d) = &a.decl {
        let elems = d.arr_cap.unwrap_or(1) as i64;
        let size = d.ty.size() as i64 * elems;
        offset += size;
        symtab.get(a.sym).loc.set(Some(VarLoc::Frame(offset)));
    }
    offset
}

const INT_ARG_REGS: [&str; 6] = ["rdi", "rsi", "rdx", "rcx", "r8", "r9"];
/// `xmm1`..`xmm15` — `xmm0` is reserved for the return value / left
/// accumulator, leaving 15 registers for the float parameter class.
const FLOAT_ARG_REGS: [&str; 15] = [
    "xmm1", "xmm2", "xmm3", "xmm4", "xmm5", "xmm6", "xmm7", "xmm8", "xmm9", "xmm10", "xmm11",
    "xmm12", "xmm13", "xmm14", "xmm15",
];

/// Counts how many of `params` fall past their class's register capacity
/// (the 7th+ integer or 16th+ float parameter) and so arrive caller-pushed
/// at `[rbp+16+8*k]`. Caller and callee both derive `k` by walking
/// parameters in declaration order and sharing one counter across both
/// classes, so the two sides agree on the stack layout without any
/// additional bookkeeping passed between them.
fn count_stack_params(params: &[Type]) -> u32 {
    let mut int_i = 0usize;
    let mut float_i = 0usize;
    let mut stack_n = 0u32;
    for ty in params {
        if ty.is_float() {
            if float_i >= FLOAT_ARG_REGS.len() {
                stack_n += 1;
            }
            float_i += 1;
        } else {
            if int_i >= INT_ARG_REGS.len() {
                stack_n += 1;
            }
            int_i += 1;
        }
    }
    stack_n
}

/// Byte offset of the `k`-th caller-pushed stack parameter, as seen from
/// the callee's `rbp` once its own `push rbp; mov rbp, rsp` prologue has
/// run: `+8` for the return address, `+8` for the saved `rbp`.
fn stack_param_offset(k: u32) -> i64 {
    16 + 8 * k as i64
}

fn emit_function(func: &Func, symtab: &SymbolTable) -> Result<String> {
    let cap = round32(layout_function(func, symtab));
    let mut st = FuncState {
        symtab,
        func_name: func.name.clone(),
        is_main: func.name == "main",
        ret_type: func.ret_type,
        body: String::new(),
        data: String::new(),
        label_n: 0,
        float_n: 0,
        str_n: 0,
    };

    let _ = writeln!(st.body, "{}:", label_name(&func.name));
    st.emit("push rbp");
    st.emit("mov rbp, rsp");
    if cap > 0 {
        st.emitf(format_args!("sub rsp, {}", cap));
    }

    let mut int_i = 0usize;
    let mut float_i = 0usize;
    let mut stack_k = 0u32;
    for p in &func.params {
        let idx = symtab
            .lookup_idx(SymbolKind::Var, &func.name, &p.name)
            .expect("parameter symbol always declared");
        let dst = st.frame_operand(idx);
        if p.ty.is_float() {
            if float_i < FLOAT_ARG_REGS.len() {
                st.emitf(format_args!("movss {}, {}", dst, FLOAT_ARG_REGS[float_i]));
            } else {
                let src = format!("[rbp+{}]", stack_param_offset(stack_k));
                st.emitf(format_args!("movss xmm0, {}", src));
                st.emitf(format_args!("movss {}, xmm0", dst));
                stack_k += 1;
            }
            float_i += 1;
        } else {
            if int_i < INT_ARG_REGS.len() {
                let reg = sized_reg(INT_ARG_REGS[int_i], p.ty.size());
                if p.ty.size() == 1 {
                    st.emitf(format_args!("mov byte {}, {}", dst, reg));
                } else {
                    st.emitf(format_args!("mov {}, {}", dst, reg));
                }
            } else {
                let src = format!("[rbp+{}]", stack_param_offset(stack_k));
                st.emitf(format_args!("mov rax, {}", src));
                if p.ty.size() == 1 {
                    st.emitf(format_args!("mov byte {}, al", dst));
                } else {
                    st.emitf(format_args!("mov {}, {}", dst, reg_source(p.ty)));
                }
                stack_k += 1;
            }
            int_i += 1;
        }
    }

    emit_stmts(&func.body, &mut st)?;

    if !matches!(func.body.last(), Some(Stmt::Ret { .. })) {
        emit_function_exit(&mut st, None)?;
    }

    st.body.push_str(&st.data);
    Ok(st.body)
}

fn sized_reg(reg64: &str, size: u32) -> String {
    if size == 8 {
        return reg64.to_owned();
    }
    if size == 1 {
        return match reg64 {
            "rdi" => "dil",
            "rsi" => "sil",
            "rdx" => "dl",
            "rcx" => "cl",
            "r8" => "r8b",
            "r9" => "r9b",
            other => other,
        }
        .to_owned();
    }
    match reg64 {
        "rdi" => "edi",
        "rsi" => "esi",
        "rdx" => "edx",
        "rcx" => "ecx",
        "r8" => "r8d",
        "r9" => "r9d",
        other => other,
    }
    .to_owned()
}

/// The single function-exit routine: both an explicit `return` and an
/// implicit fallthrough at the end of a `void` function's body route
/// through here. `main`'s exit is always the `exit(0)` syscall sequence,
/// never a `ret` — there is no caller to return to.
fn emit_function_exit(st: &mut FuncState, value: Option<&Expr>) -> Result<()> {
    if let Some(v) = value {
        emit_value_into_accumulator(v, st, st.ret_type)?;
    }
    st.emit("mov rsp, rbp");
    st.emit("pop rbp");
    if st.is_main {
        st.emit("mov rax, 60");
        st.emit("xor rdi, rdi");
        st.emit("syscall");
    } else {
        st.emit("ret");
    }
    Ok(())
}

fn emit_stmts(stmts: &[Stmt], st: &mut FuncState) -> Result<()> {
    for s in stmts {
        emit_stmt(s, st)?;
    }
    Ok(())
}

fn emit_stmt(stmt: &Stmt, st: &mut FuncState) -> Result<()> {
    match stmt {
        Stmt::Assign(a) => emit_assign(a, st),
        Stmt::Call { name, args, .. } => emit_call(name, args, st),
        Stmt::Ret { value, .. } => emit_function_exit(st, value.as_ref()),
        Stmt::IfElse {
            cond,
            body,
            else_body,
        } => emit_if(cond, body, else_body.as_deref(), st),
        Stmt::While {
            cond,
            body,
            do_first,
        } => emit_while(cond, body, *do_first, st),
        Stmt::For {
            init,
            cond,
            step,
            body,
        } => emit_for(init, cond, step, body, st),
        Stmt::SubscrStore {
            sym, index, value, ..
        } => emit_subscr_store(*sym, index, value, st),
        Stmt::DerefStore { sym, value, .. } => emit_deref_store(*sym, value, st),
    }
}

fn emit_assign(a: &Assign, st: &mut FuncState) -> Result<()> {
    let ty = a
        .decl
        .as_ref()
        .map(|d| d.ty)
        .unwrap_or_else(|| st.symtab.get(a.sym).ty);

    let arr_cap = a.decl.as_ref().and_then(|d| d.arr_cap);

    match (&a.value, arr_cap) {
        (Some(Expr::ArrayLit(items)), Some(cap)) => {
            emit_array_init(a.sym, items, ty, cap, st)
        }
        (Some(Expr::StrLit(bytes)), Some(cap)) => {
            emit_str_array_init(a.sym, bytes, cap, st)
        }
        (Some(value), _) => {
            emit_value_into_accumulator(value, st, ty)?;
            let dst = st.frame_operand(a.sym);
            store_accumulator(st, &dst, ty);
            Ok(())
        }
        (None, _) => Ok(()),
    }
}

fn store_accumulator(st: &mut FuncState, dst: &str, ty: Type) {
    if ty.is_float() {
        st.emitf(format_args!("movss {}, xmm0", dst));
    } else if ty.size() == 8 {
        st.emitf(format_args!("mov {}, rax", dst));
    } else if ty.size() == 1 {
        st.emitf(format_args!("mov {}, al", dst));
    } else {
        st.emitf(format_args!("mov {}, eax", dst));
    }
}

fn emit_array_init(
    sym: usize,
    items: &[Expr],
    elem_ty: Type,
    cap: u32,
    st: &mut FuncState,
) -> Result<()> {
    let base = st.symtab.get(sym).loc.get();
    let elem_size = elem_ty.size() as i64;
    for (i, item) in items.iter().enumerate() {
        emit_value_into_accumulator(item, st, elem_ty)?;
        let addr = array_elem_addr(base, i as i64 * elem_size);
        store_accumulator(st, &addr, elem_ty);
    }
    for i in items.len() as u32..cap {
        let addr = array_elem_addr(base, i as i64 * elem_size);
        if elem_ty.is_float() {
            st.emitf(format_args!("mov dword {}, 0", addr));
        } else {
            st.emitf(format_args!("mov {} {}, 0", size_keyword(elem_ty.size()), addr));
        }
    }
    Ok(())
}

fn emit_str_array_init(sym: usize, bytes: &[u8], cap: u32, st: &mut FuncState) -> Result<()> {
    let base = st.symtab.get(sym).loc.get();
    for (i, b) in bytes.iter().enumerate() {
        let addr = array_elem_addr(base, i as i64);
        st.emitf(format_args!("mov byte {}, {}", addr, b));
    }
    for i in bytes.len() as u32..cap {
        let addr = array_elem_addr(base, i as i64);
        st.emitf(format_args!("mov byte {}, 0", addr));
    }
    Ok(())
}

fn array_elem_addr(base: Option<VarLoc>, byte_offset: i64) -> String {
    match base {
        Some(VarLoc::Frame(off)) => {
            let slot = off - byte_offset;
            format!("[rbp-{}]", slot)
        }
        _ => unreachable!("local array initializers always have a frame slot"),
    }
}

fn size_keyword(size: u32) -> &'static str {
    match size {
        1 => "byte",
        8 => "qword",
        _ => "dword",
    }
}

/// Evaluates `expr` and leaves the result in `eax`/`rax` (integer class) or
/// `xmm0` (float class), narrowed/converted to `target`.
///
/// Literal operands are already narrowed by the parser (`narrow_int`), so
/// they load straight into the register class `target` calls for. Every
/// other operand kind carries its own fixed declared type (a variable's,
/// a pointee's, a function's return type), which can legitimately disagree
/// with `target` inside mixed int/float arithmetic — those are loaded in
/// their *natural* class first, then converted with
/// `cvtsi2ss`/`cvttss2si` if `target`'s class differs.
fn emit_value_into_accumulator(expr: &Expr, st: &mut FuncState, target: Type) -> Result<()> {
    match expr {
        Expr::IntLit(v) => {
            if target.is_float() {
                let label = st.new_float_label(*v as f64);
                st.emitf(format_args!("movss xmm0, [rel {}]", label));
            } else {
                st.emitf(format_args!("mov eax, {}", v));
            }
        }
        Expr::FloatLit(v) => {
            let label = st.new_float_label(*v);
            st.emitf(format_args!("movss xmm0, [rel {}]", label));
        }
        Expr::StrLit(bytes) => {
            let label = st.new_str_label(bytes);
            st.emit(&format!("lea rax, [rel {}]", label));
        }
        Expr::Var { sym, .. } => {
            let ty = st.symtab.get(*sym).ty;
            let src = st.frame_operand(*sym);
            load_into_accumulator(st, &src, ty);
            convert_accumulator(st, ty, target);
        }
        Expr::Subscr { sym, index, .. } => {
            let elem_ty = st.symtab.get(*sym).ty.pointee();
            emit_value_into_accumulator(index, st, Type::new(BaseType::Int))?;
            st.emit("mov r10d, eax");
            let src = subscript_addr_emit(*sym, st, elem_ty.size());
            load_into_accumulator(st, &src, elem_ty);
            convert_accumulator(st, elem_ty, target);
        }
        Expr::Deref { sym, .. } => {
            let elem_ty = st.symtab.get(*sym).ty.pointee();
            let ptr = st.frame_operand(*sym);
            st.emitf(format_args!("mov rax, {}", ptr));
            let deref = format!("[rax]");
            load_into_accumulator(st, &deref, elem_ty);
            convert_accumulator(st, elem_ty, target);
        }
        Expr::Ref { sym, .. } => {
            let operand = st.frame_operand(*sym);
            st.emitf(format_args!("lea rax, {}", operand));
        }
        Expr::Call { name, args, .. } => {
            let ret_ty = st
                .symtab
                .lookup_func(name)
                .map(|s| s.ty)
                .unwrap_or_else(|| Type::new(BaseType::Int));
            emit_call(name, args, st)?;
            convert_accumulator(st, ret_ty, target);
        }
        Expr::Math(list) => emit_math(list, st, target)?,
        Expr::MathVar { .. } => unreachable!("MathVar is emitter-internal only"),
        Expr::ArrayLit(_) => unreachable!("array literals only appear as initializers"),
    }
    Ok(())
}

/// Converts the accumulator from `from`'s register class to `target`'s, if
/// they differ — `cvtsi2ss`/`cvttss2si` are the only two conversions the
/// language needs, since every operand narrower than 4 bytes was already
/// sign-/zero-extended by `load_into_accumulator`.
fn convert_accumulator(st: &mut FuncState, from: Type, target: Type) {
    match (from.is_float(), target.is_float()) {
        (false, true) => st.emit("cvtsi2ss xmm0, eax"),
        (true, false) => st.emit("cvttss2si eax, xmm0"),
        _ => {}
    }
}

/// Whether `expr`'s own declared type is the float register class —
/// used to decide which accumulator register class a flat `MATH`/`Cond`
/// list reduces in, independent of any literal-narrowing already baked
/// into its operands.
fn expr_is_float(expr: &Expr, symtab: &SymbolTable) -> bool {
    match expr {
        Expr::IntLit(_) | Expr::StrLit(_) | Expr::Ref { .. } | Expr::ArrayLit(_) => false,
        Expr::FloatLit(_) => true,
        Expr::Var { sym, .. } => symtab.get(*sym).ty.is_float(),
        Expr::Subscr { sym, .. } | Expr::Deref { sym, .. } => symtab.get(*sym).ty.pointee().is_float(),
        Expr::Call { name, .. } => symtab.lookup_func(name).map(|s| s.ty.is_float()).unwrap_or(false),
        Expr::Math(list) => list.iter().any(|e| match e {
            MathElem::Operand(e) => expr_is_float(e, symtab),
            MathElem::Operator(_) => false,
        }),
        Expr::MathVar { is_float, .. } => *is_float,
    }
}

/// Computes the address of `base[r10]`. An array-typed symbol is stored
/// inline in its frame slot or static label, so the index combines directly
/// with the known base offset. A pointer-typed symbol instead holds a
/// runtime address that must be loaded first — into `r11`, never `rax`,
/// since the accumulator may already hold a value the caller still needs
/// (e.g. a store's freshly evaluated right-hand side).
fn subscript_addr_emit(sym: usize, st: &mut FuncState, elem_size: u32) -> String {
    let symtab = st.symtab;
    let sym_data = symtab.get(sym);
    if sym_data.is_array() {
        match sym_data.loc.get() {
            Some(VarLoc::Frame(off)) => format!("[rbp-{}+r10*{}]", off, elem_size),
            _ => format!("[rel {}+r10*{}]", label_name(&sym_data.name), elem_size),
        }
    } else {
        let ptr_operand = st.frame_operand(sym);
        st.emitf(format_args!("mov r11, {}", ptr_operand));
        format!("[r11+r10*{}]", elem_size)
    }
}

fn load_into_accumulator(st: &mut FuncState, src: &str, ty: Type) {
    if ty.is_float() {
        st.emitf(format_args!("movss xmm0, {}", src));
    } else if ty.size() == 8 {
        st.emitf(format_args!("mov rax, {}", src));
    } else if ty.size() == 1 {
        st.emitf(format_args!("movsx eax, byte {}", src));
    } else {
        st.emitf(format_args!("mov eax, {}", src));
    }
}

/// Evaluates a flat `[operand, operator, operand, ...]` list in the same
/// two-pass order the parser's constant folder uses: the list is first
/// split into additive terms, each term is a left-to-right `* / %` run
/// evaluated on its own, then the terms combine left to right with
/// `+ -`. Each step keeps its running result in the accumulator register
/// (`eax`/`rax` or `xmm0`) and stages the next operand in the secondary
/// register (`ebx` or `xmm1`) before combining.
fn emit_math(list: &[MathElem], st: &mut FuncState, target: Type) -> Result<()> {
    let is_float = target.is_float()
        || list.iter().any(|e| match e {
            MathElem::Operand(e) => expr_is_float(e, st.symtab),
            MathElem::Operator(_) => false,
        });

    let terms = split_additive(list);
    emit_term(&terms[0].1, st, is_float)?;
    for (op, term) in &terms[1..] {
        save_accumulator(st, is_float);
        emit_term(term, st, is_float)?;
        move_to_secondary(st, is_float);
        restore_accumulator(st, is_float);
        emit_binop(*op, st, is_float)?;
    }
    Ok(())
}

/// Splits a flat math list on `+`/`-` boundaries, each resulting term
/// holding its own left-to-right `* / %` run. The first term's implicit
/// combining operator is `Add` (i.e. it is simply taken as-is).
fn split_additive(list: &[MathElem]) -> Vec<(OperKind, Vec<&MathElem>)> {
    let mut terms = Vec::new();
    let mut current_op = OperKind::Add;
    let mut current: Vec<&MathElem> = vec![&list[0]];
    let mut i = 1;
    while i < list.len() {
        if let MathElem::Operator(op) = &list[i] {
            if matches!(op, OperKind::Add | OperKind::Sub) {
                terms.push((current_op, std::mem::take(&mut current)));
                current_op = *op;
                current.push(&list[i + 1]);
            } else {
                current.push(&list[i]);
                current.push(&list[i + 1]);
            }
        }
        i += 2;
    }
    terms.push((current_op, current));
    terms
}

/// Evaluates one multiplicative-tier run (`a * b / c ...`) left to right,
/// applying power-of-two strength reduction (`* 2^k -> sal`, `/ 2^k ->
/// sar`, `% 2^k -> and`) when the right operand is a literal power of two.
fn emit_term(term: &[&MathElem], st: &mut FuncState, is_float: bool) -> Result<()> {
    emit_operand(term[0], st, is_float)?;
    let mut i = 1;
    while i < term.len() {
        let op = match term[i] {
            MathElem::Operator(op) => *op,
            _ => unreachable!("term must alternate operand/operator"),
        };
        if !is_float {
            if let MathElem::Operand(Expr::IntLit(v)) = term[i + 1] {
                if let Some(k) = pow2_shift(*v) {
                    match op {
                        OperKind::Mul => {
                            st.emitf(format_args!("sal eax, {}", k));
                            i += 2;
                            continue;
                        }
                        OperKind::Div => {
                            st.emitf(format_args!("sar eax, {}", k));
                            i += 2;
                            continue;
                        }
                        OperKind::Mod => {
                            st.emitf(format_args!("and eax, {}", v - 1));
                            i += 2;
                            continue;
                        }
                        _ => {}
                    }
                }
            }
        }
        save_accumulator(st, is_float);
        emit_operand(term[i + 1], st, is_float)?;
        move_to_secondary(st, is_float);
        restore_accumulator(st, is_float);
        emit_binop(op, st, is_float)?;
        i += 2;
    }
    Ok(())
}

fn pow2_shift(v: i64) -> Option<u32> {
    if v > 0 && (v & (v - 1)) == 0 {
        Some(v.trailing_zeros())
    } else {
        None
    }
}

fn emit_operand(elem: &MathElem, st: &mut FuncState, is_float: bool) -> Result<()> {
    let operand = match elem {
        MathElem::Operand(e) => e,
        MathElem::Operator(_) => unreachable!(),
    };
    let target = if is_float {
        Type::new(BaseType::Float)
    } else {
        Type::new(BaseType::Int)
    };
    emit_value_into_accumulator(operand, st, target)
}

fn save_accumulator(st: &mut FuncState, is_float: bool) {
    if is_float {
        st.emit("sub rsp, 16");
        st.emit("movss [rsp], xmm0");
    } else {
        st.emit("push rax");
    }
}

fn move_to_secondary(st: &mut FuncState, is_float: bool) {
    if is_float {
        st.emit("movss xmm1, xmm0");
    } else {
        st.emit("mov ebx, eax");
    }
}

fn restore_accumulator(st: &mut FuncState, is_float: bool) {
    if is_float {
        st.emit("movss xmm0, [rsp]");
        st.emit("add rsp, 16");
    } else {
        st.emit("pop rax");
    }
}

/// Applies power-of-two strength reduction for `int * 2^k`, `/ 2^k`,
/// `% 2^k`.
fn emit_binop(op: OperKind, st: &mut FuncState, is_float: bool) -> Result<()> {
    if is_float {
        match op {
            OperKind::Add => st.emit("addss xmm0, xmm1"),
            OperKind::Sub => st.emit("subss xmm0, xmm1"),
            OperKind::Mul => st.emit("mulss xmm0, xmm1"),
            OperKind::Div => st.emit("divss xmm0, xmm1"),
            OperKind::Mod => {
                return Err(crate::error::Diagnostic::without_pos(
                    "<expr>",
                    "modulus of a float is not supported",
                )
                .into())
            }
            _ => unreachable!("comparisons are handled in condition lowering"),
        }
        return Ok(());
    }

    match op {
        OperKind::Add => st.emit("add eax, ebx"),
        OperKind::Sub => st.emit("sub eax, ebx"),
        OperKind::Mul => st.emit("imul eax, ebx"),
        OperKind::Div => {
            st.emit("cdq");
            st.emit("idiv ebx");
        }
        OperKind::Mod => {
            st.emit("cdq");
            st.emit("idiv ebx");
            st.emit("mov eax, edx");
        }
        _ => unreachable!("comparisons are handled in condition lowering"),
    }
    Ok(())
}

fn emit_subscr_store(sym: usize, index: &Expr, value: &Expr, st: &mut FuncState) -> Result<()> {
    let elem_ty = st.symtab.get(sym).ty.pointee();
    emit_value_into_accumulator(index, st, Type::new(BaseType::Int))?;
    st.emit("mov r10d, eax");
    st.emit("push r10");
    emit_value_into_accumulator(value, st, elem_ty)?;
    st.emit("pop r10");
    let addr = subscript_addr_emit(sym, st, elem_ty.size());
    store_accumulator(st, &addr, elem_ty);
    Ok(())
}

fn emit_deref_store(sym: usize, value: &Expr, st: &mut FuncState) -> Result<()> {
    let elem_ty = st.symtab.get(sym).ty.pointee();
    let ptr = st.frame_operand(sym);
    st.emitf(format_args!("mov r11, {}", ptr));
    st.emit("push r11");
    emit_value_into_accumulator(value, st, elem_ty)?;
    st.emit("pop r11");
    store_accumulator(st, "[r11]", elem_ty);
    Ok(())
}

// ---- calls ------------------------------------------------------------

fn emit_call(name: &str, args: &[Expr], st: &mut FuncState) -> Result<()> {
    let sig = st
        .symtab
        .lookup_func(name)
        .and_then(|s| s.func.clone())
        .expect("call target resolved at parse time");

    let mut int_i = 0usize;
    let mut float_i = 0usize;
    let mut stack_k = 0u32;
    let mut spilled_int: Vec<&'static str> = Vec::new();
    let mut spilled_float: Vec<&'static str> = Vec::new();

    let stack_n = count_stack_params(&sig.params);
    if stack_n > 0 {
        st.emitf(format_args!("sub rsp, {}", 8 * stack_n));
    }

    for (idx, arg) in args.iter().enumerate() {
        let expected = *sig.params.get(idx).unwrap_or(&Type::new(BaseType::Int));

        if contains_call(arg) {
            for reg in INT_ARG_REGS.iter().take(int_i) {
                st.emitf(format_args!("push {}", reg));
                spilled_int.push(reg);
            }
            for reg in FLOAT_ARG_REGS.iter().take(float_i) {
                st.emit("sub rsp, 16");
                st.emitf(format_args!("movss [rsp], {}", reg));
                spilled_float.push(reg);
            }
        }

        emit_value_into_accumulator(arg, st, expected)?;

        if expected.is_float() {
            if float_i < FLOAT_ARG_REGS.len() {
                st.emitf(format_args!("movss {}, xmm0", FLOAT_ARG_REGS[float_i]));
            } else {
                st.emitf(format_args!("movss [rsp+{}], xmm0", 8 * stack_k));
                stack_k += 1;
            }
            float_i += 1;
        } else {
            if int_i < INT_ARG_REGS.len() {
                let reg = sized_reg(INT_ARG_REGS[int_i], expected.size());
                st.emitf(format_args!("mov {}, {}", reg, reg_source(expected)));
            } else {
                st.emitf(format_args!("mov [rsp+{}], {}", 8 * stack_k, reg_source(expected)));
                stack_k += 1;
            }
            int_i += 1;
        }

        if !spilled_float.is_empty() {
            for reg in spilled_float.drain(..).rev() {
                st.emitf(format_args!("movss {}, [rsp]", reg));
                st.emit("add rsp, 16");
            }
        }
        if !spilled_int.is_empty() {
            for reg in spilled_int.drain(..).rev() {
                st.emitf(format_args!("pop {}", reg));
            }
        }
    }

    st.emitf(format_args!("call {}", label_name(name)));
    if stack_n > 0 {
        st.emitf(format_args!("add rsp, {}", 8 * stack_n));
    }
    Ok(())
}

fn reg_source(ty: Type) -> &'static str {
    if ty.size() == 8 {
        "rax"
    } else if ty.size() == 1 {
        "al"
    } else {
        "eax"
    }
}

fn contains_call(expr: &Expr) -> bool {
    match expr {
        Expr::Call { .. } => true,
        Expr::Math(list) => list.iter().any(|e| match e {
            MathElem::Operand(e) => contains_call(e),
            MathElem::Operator(_) => false,
        }),
        Expr::Subscr { index, .. } => contains_call(index),
        _ => false,
    }
}

// ---- conditions ---------------------------------------------------------

/// Lowers a flat `cond := rel (('&&'|'||') rel)*` list with correct C
/// precedence (`&&` binds tighter than `||`) by grouping on `||` first,
/// then splitting each group on `&&`.
fn emit_cond_jump_if_false(cond: &Cond, false_label: &str, st: &mut FuncState) -> Result<()> {
    let true_label = st.new_label();
    let groups = group_by_or(cond);
    for (gi, group) in groups.iter().enumerate() {
        let is_last_group = gi == groups.len() - 1;
        let group_fail_label = if is_last_group {
            false_label.to_owned()
        } else {
            st.new_label()
        };
        for rel in group.iter().copied() {
            emit_rel_jump(rel, JumpMode::FailTo(&group_fail_label), st)?;
        }
        if !is_last_group {
            st.emitf(format_args!("jmp {}", true_label));
            let _ = writeln!(st.body, "{}:", group_fail_label);
        }
    }
    let _ = writeln!(st.body, "{}:", true_label);
    Ok(())
}

enum JumpMode<'a> {
    FailTo(&'a str),
}

fn group_by_or(cond: &Cond) -> Vec<Vec<&Rel>> {
    let mut groups: Vec<Vec<&Rel>> = vec![vec![&cond.rels[0]]];
    for (rel, sep) in cond.rels[1..].iter().zip(cond.seps.iter()) {
        match sep {
            LogicOp::Or => groups.push(vec![rel]),
            LogicOp::And => groups.last_mut().unwrap().push(rel),
        }
    }
    groups
}

fn emit_rel_jump(rel: &Rel, mode: JumpMode, st: &mut FuncState) -> Result<()> {
    let is_float = expr_is_float(&rel.lhs, st.symtab) || expr_is_float(&rel.rhs, st.symtab);
    let ty = if is_float {
        Type::new(BaseType::Float)
    } else {
        Type::new(BaseType::Int)
    };
    emit_value_into_accumulator(&rel.lhs, st, ty)?;
    save_accumulator(st, is_float);
    emit_value_into_accumulator(&rel.rhs, st, ty)?;
    move_to_secondary(st, is_float);
    restore_accumulator(st, is_float);

    if is_float {
        st.emit("comiss xmm0, xmm1");
    } else {
        st.emit("cmp eax, ebx");
    }

    let JumpMode::FailTo(label) = mode;
    let jump = match rel.op {
        OperKind::EqEq => "jne",
        OperKind::NotEq => "je",
        OperKind::Lt => "jge",
        OperKind::Lte => "jg",
        OperKind::Gt => "jle",
        OperKind::Gte => "jl",
        _ => unreachable!("relational ops only"),
    };
    st.emitf(format_args!("{} {}", jump, label));
    Ok(())
}

fn emit_if(
    cond: &Cond,
    body: &[Stmt],
    else_body: Option<&[Stmt]>,
    st: &mut FuncState,
) -> Result<()> {
    let else_label = st.new_label();
    let end_label = st.new_label();
    emit_cond_jump_if_false(cond, &else_label, st)?;
    emit_stmts(body, st)?;
    if else_body.is_some() {
        st.emitf(format_args!("jmp {}", end_label));
    }
    let _ = writeln!(st.body, "{}:", else_label);
    if let Some(eb) = else_body {
        emit_stmts(eb, st)?;
        let _ = writeln!(st.body, "{}:", end_label);
    }
    Ok(())
}

fn emit_while(cond: &Cond, body: &[Stmt], do_first: bool, st: &mut FuncState) -> Result<()> {
    let top_label = st.new_label();
    let end_label = st.new_label();

    if do_first {
        let _ = writeln!(st.body, "{}:", top_label);
        emit_stmts(body, st)?;
        emit_cond_jump_if_false(cond, &end_label, st)?;
        st.emitf(format_args!("jmp {}", top_label));
        let _ = writeln!(st.body, "{}:", end_label);
    } else {
        let cond_label = st.new_label();
        let _ = writeln!(st.body, "{}:", cond_label);
        emit_cond_jump_if_false(cond, &end_label, st)?;
        emit_stmts(body, st)?;
        st.emitf(format_args!("jmp {}", cond_label));
        let _ = writeln!(st.body, "{}:", end_label);
    }
    Ok(())
}

fn emit_for(init: &Assign, cond: &Cond, step: &Assign, body: &[Stmt], st: &mut FuncState) -> Result<()> {
    emit_assign(init, st)?;
    let cond_label = st.new_label();
    let end_label = st.new_label();
    let _ = writeln!(st.body, "{}:", cond_label);
    emit_cond_jump_if_false(cond, &end_label, st)?;
    emit_stmts(body, st)?;
    emit_assign(step, st)?;
    st.emitf(format_args!("jmp {}", cond_label));
    let _ = writeln!(st.body, "{}:", end_label);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;

    fn compile(src: &str) -> String {
        let out = Parser::from_source("t.sc", src).unwrap().parse().unwrap();
        emit(&out.root, &out.symtab).unwrap()
    }

    #[test]
    fn hello_world_exits_zero() {
        let asm = compile("void main() { return; }");
        assert!(asm.contains("main_:"));
        assert!(asm.contains("mov rax, 60"));
        assert!(asm.contains("xor rdi, rdi"));
        assert!(asm.contains("syscall"));
        assert!(!asm.contains("ret\n"));
    }

    #[test]
    fn constant_folding_emits_single_mov() {
        let asm = compile("int get() { return 2 + 3 * 4; } void main() { return; }");
        assert!(asm.contains("mov eax, 14"));
        assert!(!asm.contains("imul"));
        assert!(!asm.contains("add eax"));
    }

    #[test]
    fn power_of_two_mul_uses_strength_reduction() {
        let asm = compile("int scale(int x) { return x * 8; } void main() { return; }");
        assert!(asm.contains("sal eax, 3"));
        assert!(!asm.contains("imul"));
    }

    #[test]
    fn runtime_multiply_uses_imul() {
        let asm = compile("int scale(int x, int y) { return x * y; } void main() { return; }");
        assert!(asm.contains("imul eax, ebx"));
    }

    #[test]
    fn two_pass_precedence_respects_mul_before_add() {
        // `x` is not foldable at parse time, so the whole list reaches the
        // emitter as `Expr::Math`; the `3 * 4` sub-term must still combine
        // before the outer `+`, and the literal `4` strength-reduces to a
        // shift.
        let asm = compile("int f(int x) { return x + 3 * 4; } void main() { return; }");
        assert!(asm.contains("mov eax, 3"));
        assert!(asm.contains("sal eax, 2"));
        assert!(asm.contains("add eax, ebx"));
    }

    #[test]
    fn nested_call_spills_argument_register() {
        let src = "int id(int x) { return x; } \
                   int add(int a, int b) { return a + b; } \
                   void main() { add(1, id(2)); return; }";
        let asm = compile(src);
        assert!(asm.contains("push rdi"));
        assert!(asm.contains("pop rdi"));
    }

    #[test]
    fn global_is_emitted_as_static_data() {
        let asm = compile("int counter = 5; void main() { return; }");
        assert!(asm.contains("section .data"));
        assert!(asm.contains("counter_: dd 5"));
    }

    #[test]
    fn float_variable_compared_against_int_literal_uses_float_compare() {
        // `x` is declared `float`; the literal `1` on the other side of `<`
        // is parsed against a generic `int` expectation (`parse_rel`'s
        // `generic` type) and so stays an `IntLit`. The comparison must
        // still reduce in the float class because `x` itself is float.
        let asm = compile("void main() { float x = 0.5; if (x < 1) { } }");
        assert!(asm.contains("comiss"), "{}", asm);
        assert!(!asm.contains("cmp eax, ebx"), "{}", asm);
    }

    #[test]
    fn int_variable_added_to_float_variable_converts_with_cvtsi2ss() {
        // Neither operand is a literal and the target (`b`'s declared type)
        // is float, but `a` is an `int` variable — it must be converted at
        // runtime with `cvtsi2ss`, not reinterpreted bit-for-bit.
        let asm = compile(
            "float combine(int a, float b) { return a + b; } void main() { return; }",
        );
        assert!(asm.contains("cvtsi2ss xmm0, eax"), "{}", asm);
    }

    #[test]
    fn call_result_mismatched_with_target_class_converts() {
        // `get_count()` returns `int`; assigning it into a `float` local
        // must convert the returned `eax` value into `xmm0`.
        let asm = compile(
            "int get_count() { return 3; } \
             void main() { float r = 0.0; r = get_count(); }",
        );
        assert!(asm.contains("call get_count_"));
        assert!(asm.contains("cvtsi2ss xmm0, eax"), "{}", asm);
    }
}
