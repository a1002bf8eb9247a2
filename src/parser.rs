//! Predictive recursive-descent parser with one token of lookahead.
//!
//! Owns the current scope chain and enclosing function name as it descends;
//! it is the only component that registers symbols, fusing parsing with
//! scope/type checking and constant folding in a single pass.

use crate::ast::*;
use crate::error::{Diagnostic, Error};
use crate::lexer::Lexer;
use crate::symtab::{FuncSig, Symbol, SymbolKind, SymbolTable};
use crate::token::{TokKind, Token};
use std::cell::Cell;
use std::path::Path;

type Result<T> = std::result::Result<T, Error>;

pub struct Parser {
    path: String,
    lexer: Lexer,
    cur: Token,
    scope_stack: Vec<String>,
    func_name: Option<String>,
    func_ret_type: Option<Type>,
    pub symtab: SymbolTable,
}

pub struct ParseOutput {
    pub root: Root,
    pub symtab: SymbolTable,
}

impl Parser {
    pub fn from_path(path: &Path) -> Result<Parser> {
        let mut lexer = Lexer::from_path(path)?;
        let cur = lexer.next_token()?;
        Ok(Parser {
            path: path.to_string_lossy().into_owned(),
            lexer,
            cur,
            scope_stack: vec!["<global>".to_owned()],
            func_name: None,
            func_ret_type: None,
            symtab: SymbolTable::new(),
        })
    }

    pub fn from_source(path: &str, src: &str) -> Result<Parser> {
        let mut lexer = Lexer::from_bytes(path.to_owned(), src.as_bytes().to_vec());
        let cur = lexer.next_token()?;
        Ok(Parser {
            path: path.to_owned(),
            lexer,
            cur,
            scope_stack: vec!["<global>".to_owned()],
            func_name: None,
            func_ret_type: None,
            symtab: SymbolTable::new(),
        })
    }

    pub fn parse(mut self) -> Result<ParseOutput> {
        let root = self.parse_root()?;
        if self.symtab.lookup_func("main").is_none() {
            return Err(self.fatal_no_pos("'main' is not defined"));
        }
        Ok(ParseOutput {
            root,
            symtab: self.symtab,
        })
    }

    // ---- token stream helpers -------------------------------------------------

    fn advance(&mut self) -> Result<()> {
        self.cur = self.lexer.next_token()?;
        Ok(())
    }

    fn fatal(&self, line: u32, col: u32, msg: impl Into<String>) -> Error {
        Diagnostic::new(&self.path, line, col, msg).into()
    }

    fn fatal_here(&self, msg: impl Into<String>) -> Error {
        self.fatal(self.cur.line, self.cur.col, msg)
    }

    fn fatal_no_pos(&self, msg: impl Into<String>) -> Error {
        Diagnostic::without_pos(&self.path, msg).into()
    }

    fn expect(&mut self, kind: TokKind) -> Result<Token> {
        if self.cur.kind != kind {
            return Err(self.fatal_here(format!(
                "unexpected token '{}', expected {:?}",
                self.cur.lexeme, kind
            )));
        }
        let tok = self.cur.clone();
        self.advance()?;
        Ok(tok)
    }

    fn expect_id_text(&mut self) -> Result<String> {
        Ok(self.expect(TokKind::Id)?.lexeme)
    }

    fn is_keyword(&self, word: &str) -> bool {
        self.cur.is(TokKind::Id) && self.cur.lexeme == word
    }

    fn is_type_keyword(&self) -> bool {
        self.cur.is(TokKind::Id)
            && matches!(self.cur.lexeme.as_str(), "void" | "char" | "int" | "float")
    }

    // ---- scope management -------------------------------------------------

    fn cur_scope(&self) -> String {
        self.scope_stack.last().unwrap().clone()
    }

    fn push_named_scope(&mut self, name: String) {
        self.scope_stack.push(name);
    }

    fn push_nested_scope(&mut self, suffix: &str) {
        let new_scope = format!("{}-{}", self.cur_scope(), suffix);
        self.scope_stack.push(new_scope);
    }

    fn pop_scope(&mut self) {
        self.scope_stack.pop();
    }

    // ---- symbol table helpers ----------------------------------------------

    fn declare_var(
        &mut self,
        name: &str,
        ty: Type,
        mutable: bool,
        arr_cap: Option<u32>,
        global: bool,
        line: u32,
        col: u32,
    ) -> Result<usize> {
        let scope = if global {
            "<global>".to_owned()
        } else {
            self.cur_scope()
        };
        if self
            .symtab
            .is_declared_in_visible_scope(SymbolKind::Var, &scope, name)
        {
            return Err(self.fatal(line, col, format!("redefinition of '{}'", name)));
        }
        Ok(self.symtab.declare(Symbol {
            kind: SymbolKind::Var,
            scope,
            name: name.to_owned(),
            ty,
            mutable,
            arr_cap,
            func: None,
            loc: Cell::new(None),
        }))
    }

    fn lookup_var(&self, name: &str) -> Option<&Symbol> {
        self.symtab
            .lookup(SymbolKind::Var, &self.cur_scope(), name)
    }

    fn lookup_var_idx(&self, name: &str, line: u32, col: u32) -> Result<usize> {
        self.symtab
            .lookup_idx(SymbolKind::Var, &self.cur_scope(), name)
            .ok_or_else(|| self.fatal(line, col, format!("unknown identifier '{}'", name)))
    }

    // ---- top level ----------------------------------------------------------

    fn parse_root(&mut self) -> Result<Root> {
        let mut items = Vec::new();
        while !self.cur.is(TokKind::Eof) {
            items.push(self.parse_item()?);
        }
        Ok(Root { items })
    }

    fn parse_item(&mut self) -> Result<Item> {
        if !self.cur.is(TokKind::Id) {
            return Err(self.fatal_here(format!("unexpected token '{}'", self.cur.lexeme)));
        }

        let mutable = if self.is_keyword("mut") {
            self.advance()?;
            true
        } else {
            false
        };

        if !self.is_type_keyword() {
            return Err(self.fatal_here("expected a type"));
        }

        let (line, col) = (self.cur.line, self.cur.col);
        let ty = self.parse_type()?;
        let name = self.expect_id_text()?;

        if self.cur.is(TokKind::LParen) {
            self.parse_func(ty, name, mutable, line, col)
        } else {
            let assign = self.parse_decl_tail(name, ty, mutable, true, line, col)?;
            self.expect(TokKind::Semi)?;
            Ok(Item::Global(assign))
        }
    }

    fn parse_type(&mut self) -> Result<Type> {
        let base = match self.cur.lexeme.as_str() {
            "void" => BaseType::Void,
            "char" => BaseType::Char,
            "int" => BaseType::Int,
            "float" => BaseType::Float,
            _ => return Err(self.fatal_here("expected a type")),
        };
        self.advance()?;
        let mut ptr_depth = 0;
        while self.cur.is(TokKind::Star) {
            ptr_depth += 1;
            self.advance()?;
        }
        Ok(Type { base, ptr_depth })
    }

    fn parse_func(
        &mut self,
        ret_type: Type,
        name: String,
        mutable: bool,
        line: u32,
        col: u32,
    ) -> Result<Item> {
        if mutable {
            return Err(self.fatal(line, col, "functions cannot be declared 'mut'"));
        }
        if name == "main" && !ret_type.is_void() {
            return Err(self.fatal(line, col, "'main' must be declared 'void'"));
        }
        if self
            .symtab
            .is_declared_in_visible_scope(SymbolKind::Func, "<global>", &name)
        {
            return Err(self.fatal(line, col, format!("redefinition of '{}'", name)));
        }

        self.advance()?; // consume '('
        self.push_named_scope(name.clone());
        let prev_func_name = self.func_name.replace(name.clone());
        let prev_ret_type = self.func_ret_type.replace(ret_type);

        let mut params = Vec::new();
        let mut param_types = Vec::new();
        let mut param_mut = Vec::new();

        if !self.cur.is(TokKind::RParen) {
            loop {
                let pmutable = if self.is_keyword("mut") {
                    self.advance()?;
                    true
                } else {
                    false
                };
                let (pline, pcol) = (self.cur.line, self.cur.col);
                let pty = self.parse_type()?;
                let pname = self.expect_id_text()?;
                if self.cur.is(TokKind::Equal) {
                    return Err(self.fatal_here("parameters may not have a default value"));
                }
                self.declare_var(&pname, pty, pmutable, None, false, pline, pcol)?;
                param_types.push(pty);
                param_mut.push(pmutable);
                params.push(Param {
                    name: pname,
                    ty: pty,
                    mutable: pmutable,
                    line: pline,
                    col: pcol,
                });
                if self.cur.is(TokKind::Comma) {
                    self.advance()?;
                } else {
                    break;
                }
            }
        }
        self.expect(TokKind::RParen)?;

        self.symtab.declare(Symbol {
            kind: SymbolKind::Func,
            scope: "<global>".to_owned(),
            name: name.clone(),
            ty: ret_type,
            mutable: false,
            arr_cap: None,
            func: Some(FuncSig {
                ret_type,
                params: param_types,
                param_mut,
            }),
            loc: Cell::new(None),
        });

        self.expect(TokKind::LBrace)?;
        let mut body = Vec::new();
        while !self.cur.is(TokKind::RBrace) {
            body.push(self.parse_stmt()?);
        }
        self.advance()?; // consume '}'

        let has_return = matches!(body.last(), Some(Stmt::Ret { .. }));
        if !ret_type.is_void() && !has_return {
            return Err(self.fatal(
                line,
                col,
                format!("function '{}' must end with a return statement", name),
            ));
        }

        self.pop_scope();
        self.func_name = prev_func_name;
        self.func_ret_type = prev_ret_type;

        Ok(Item::Func(Func {
            name,
            ret_type,
            params,
            body,
            has_return,
            line,
            col,
        }))
    }

    // ---- declarations / assignment -----------------------------------------

    fn parse_decl_tail(
        &mut self,
        name: String,
        ty: Type,
        mutable: bool,
        global: bool,
        line: u32,
        col: u32,
    ) -> Result<Assign> {
        let mut arr_cap = None;
        if self.cur.is(TokKind::LSquare) {
            self.advance()?;
            let tok = self.expect(TokKind::Int)?;
            let n: i64 = tok
                .lexeme
                .parse()
                .map_err(|_| self.fatal(line, col, "invalid array size"))?;
            if n <= 0 {
                return Err(self.fatal(line, col, "array size must be greater than zero"));
            }
            arr_cap = Some(n as u32);
            self.expect(TokKind::RSquare)?;
        }

        let value = if self.cur.is(TokKind::Equal) {
            self.advance()?;
            Some(self.parse_init_value(&ty, arr_cap, line, col)?)
        } else {
            None
        };

        let sym = self.declare_var(&name, ty, mutable, arr_cap, global, line, col)?;

        Ok(Assign {
            name,
            sym,
            decl: Some(Decl {
                ty,
                mutable,
                arr_cap,
            }),
            value,
            line,
            col,
        })
    }

    fn parse_init_value(
        &mut self,
        ty: &Type,
        arr_cap: Option<u32>,
        line: u32,
        col: u32,
    ) -> Result<Expr> {
        if self.cur.is(TokKind::Str) {
            let cap =
                arr_cap.ok_or_else(|| self.fatal_here("string initializer requires an array"))?;
            let bytes = decode_escapes(&self.cur.lexeme)
                .map_err(|e| self.fatal(self.cur.line, self.cur.col, e))?;
            self.advance()?;
            if (bytes.len() as u32) + 1 >= cap {
                return Err(self.fatal(line, col, "string initializer is too large for array"));
            }
            return Ok(Expr::StrLit(bytes));
        }

        if self.cur.is(TokKind::LBrace) {
            let cap = arr_cap
                .ok_or_else(|| self.fatal_here("array literal requires a declared array size"))?;
            self.advance()?;
            let mut elems = Vec::new();
            if !self.cur.is(TokKind::RBrace) {
                loop {
                    elems.push(self.parse_value(ty)?);
                    if self.cur.is(TokKind::Comma) {
                        self.advance()?;
                    } else {
                        break;
                    }
                }
            }
            self.expect(TokKind::RBrace)?;
            if elems.len() as u32 > cap {
                return Err(self.fatal(line, col, "array initializer is too large for array"));
            }
            return Ok(Expr::ArrayLit(elems));
        }

        self.parse_value(ty)
    }

    /// Parses one statement inside a function body.
    fn parse_stmt(&mut self) -> Result<Stmt> {
        match self.cur.kind {
            TokKind::Star => self.parse_deref_store(),
            TokKind::Id => self.parse_id_stmt(),
            _ => Err(self.fatal_here(format!("unexpected token '{}'", self.cur.lexeme))),
        }
    }

    fn parse_id_stmt(&mut self) -> Result<Stmt> {
        match self.cur.lexeme.as_str() {
            "void" | "char" | "int" | "float" => {
                let (line, col) = (self.cur.line, self.cur.col);
                let ty = self.parse_type()?;
                let name = self.expect_id_text()?;
                self.reject_nested_function()?;
                let assign = self.parse_decl_tail(name, ty, false, false, line, col)?;
                self.expect(TokKind::Semi)?;
                Ok(Stmt::Assign(assign))
            }
            "mut" => {
                self.advance()?;
                if !self.is_type_keyword() {
                    return Err(self.fatal_here("expected a type after 'mut'"));
                }
                let (line, col) = (self.cur.line, self.cur.col);
                let ty = self.parse_type()?;
                let name = self.expect_id_text()?;
                self.reject_nested_function()?;
                let assign = self.parse_decl_tail(name, ty, true, false, line, col)?;
                self.expect(TokKind::Semi)?;
                Ok(Stmt::Assign(assign))
            }
            "return" => self.parse_return(),
            "if" => self.parse_if(),
            "while" => self.parse_while(),
            "do" => self.parse_do_while(),
            "for" => self.parse_for(),
            _ => {
                let name = self.cur.lexeme.clone();
                let (line, col) = (self.cur.line, self.cur.col);
                self.advance()?;
                self.parse_name_led_stmt(name, line, col)
            }
        }
    }

    fn reject_nested_function(&mut self) -> Result<()> {
        if self.cur.is(TokKind::LParen) {
            return Err(self.fatal_here("nested function definitions are not supported"));
        }
        Ok(())
    }

    fn parse_name_led_stmt(&mut self, name: String, line: u32, col: u32) -> Result<Stmt> {
        match self.cur.kind {
            TokKind::Equal => {
                self.advance()?;
                let expected = self.lookup_var_type_or_err(&name, line, col)?;
                self.check_mutable(&name, line, col)?;
                let sym = self.lookup_var_idx(&name, line, col)?;
                let value = self.parse_value(&expected)?;
                self.expect(TokKind::Semi)?;
                Ok(Stmt::Assign(Assign {
                    name,
                    sym,
                    decl: None,
                    value: Some(value),
                    line,
                    col,
                }))
            }
            TokKind::LParen => {
                let (call_name, args) = self.parse_call_args(&name, line, col)?;
                self.expect(TokKind::Semi)?;
                Ok(Stmt::Call {
                    name: call_name,
                    args,
                    line,
                    col,
                })
            }
            TokKind::LSquare => {
                self.advance()?;
                self.check_mutable(&name, line, col)?;
                let sym = self.lookup_var_idx(&name, line, col)?;
                let elem_ty = self.subscript_elem_type(&name, line, col)?;
                let index = self.parse_value(&Type::new(BaseType::Int))?;
                self.expect(TokKind::RSquare)?;
                self.expect(TokKind::Equal)?;
                let value = self.parse_value(&elem_ty)?;
                self.expect(TokKind::Semi)?;
                Ok(Stmt::SubscrStore {
                    name,
                    sym,
                    index,
                    value,
                    line,
                    col,
                })
            }
            TokKind::PlusEq
            | TokKind::MinusEq
            | TokKind::StarEq
            | TokKind::SlashEq
            | TokKind::PercentEq => {
                let op = compound_op(self.cur.kind);
                self.advance()?;
                let expected = self.lookup_var_type_or_err(&name, line, col)?;
                self.check_mutable(&name, line, col)?;
                let sym = self.lookup_var_idx(&name, line, col)?;
                let rhs = self.parse_value(&expected)?;
                self.expect(TokKind::Semi)?;
                let list = vec![
                    MathElem::Operand(Expr::Var {
                        name: name.clone(),
                        sym,
                        line,
                        col,
                    }),
                    MathElem::Operator(op),
                    MathElem::Operand(rhs),
                ];
                let value = fold_math(list, &expected, self, line, col)?;
                Ok(Stmt::Assign(Assign {
                    name,
                    sym,
                    decl: None,
                    value: Some(value),
                    line,
                    col,
                }))
            }
            _ => Err(self.fatal(
                line,
                col,
                "expected an assignment, call, or declaration",
            )),
        }
    }

    fn parse_deref_store(&mut self) -> Result<Stmt> {
        let (line, col) = (self.cur.line, self.cur.col);
        self.advance()?; // consume '*'
        let (name, nline, ncol) = self.expect_id_pos()?;
        self.check_mutable(&name, nline, ncol)?;
        let sym = self.lookup_var_idx(&name, nline, ncol)?;
        let elem_ty = self.deref_elem_type(&name, nline, ncol)?;
        self.expect(TokKind::Equal)?;
        let value = self.parse_value(&elem_ty)?;
        self.expect(TokKind::Semi)?;
        Ok(Stmt::DerefStore {
            name,
            sym,
            value,
            line,
            col,
        })
    }

    fn expect_id_pos(&mut self) -> Result<(String, u32, u32)> {
        let (line, col) = (self.cur.line, self.cur.col);
        let name = self.expect_id_text()?;
        Ok((name, line, col))
    }

    fn check_mutable(&self, name: &str, line: u32, col: u32) -> Result<()> {
        match self.lookup_var(name) {
            Some(sym) if !sym.mutable => {
                Err(self.fatal(line, col, format!("reassigning immutable variable '{}'", name)))
            }
            Some(_) => Ok(()),
            None => Err(self.fatal(line, col, format!("unknown identifier '{}'", name))),
        }
    }

    fn lookup_var_type_or_err(&self, name: &str, line: u32, col: u32) -> Result<Type> {
        self.lookup_var(name)
            .map(|s| s.ty)
            .ok_or_else(|| self.fatal(line, col, format!("unknown identifier '{}'", name)))
    }

    fn subscript_elem_type(&self, name: &str, line: u32, col: u32) -> Result<Type> {
        let sym = self
            .lookup_var(name)
            .ok_or_else(|| self.fatal(line, col, format!("unknown identifier '{}'", name)))?;
        if !sym.ty.is_pointer() {
            return Err(self.fatal(line, col, format!("'{}' is not a pointer or array", name)));
        }
        Ok(sym.ty.pointee())
    }

    fn deref_elem_type(&self, name: &str, line: u32, col: u32) -> Result<Type> {
        self.subscript_elem_type(name, line, col)
    }

    // ---- control flow -------------------------------------------------------

    fn parse_return(&mut self) -> Result<Stmt> {
        let (line, col) = (self.cur.line, self.cur.col);
        self.advance()?; // 'return'
        let ret_ty = self.func_ret_type.unwrap_or(Type::new(BaseType::Void));
        let value = if self.cur.is(TokKind::Semi) {
            None
        } else {
            Some(self.parse_value(&ret_ty)?)
        };
        self.expect(TokKind::Semi)?;
        if ret_ty.is_void() && value.is_some() {
            return Err(self.fatal(line, col, "cannot return a value from a 'void' function"));
        }
        if !ret_ty.is_void() && value.is_none() {
            return Err(self.fatal(line, col, "must return a value from a non-'void' function"));
        }
        Ok(Stmt::Ret { value, line, col })
    }

    fn parse_cond(&mut self) -> Result<Cond> {
        let mut rels = Vec::new();
        let mut seps = Vec::new();
        loop {
            rels.push(self.parse_rel()?);
            if self.cur.is(TokKind::And) {
                seps.push(LogicOp::And);
                self.advance()?;
            } else if self.cur.is(TokKind::Or) {
                seps.push(LogicOp::Or);
                self.advance()?;
            } else {
                break;
            }
        }
        Ok(Cond { rels, seps })
    }

    fn parse_rel(&mut self) -> Result<Rel> {
        let (line, col) = (self.cur.line, self.cur.col);
        let generic = Type::new(BaseType::Int);
        let lhs = self.parse_value(&generic)?;
        let op = match self.cur.kind {
            TokKind::EqEq => OperKind::EqEq,
            TokKind::NotEq => OperKind::NotEq,
            TokKind::Lt => OperKind::Lt,
            TokKind::Lte => OperKind::Lte,
            TokKind::Gt => OperKind::Gt,
            TokKind::Gte => OperKind::Gte,
            _ => return Err(self.fatal_here("expected a comparison operator")),
        };
        self.advance()?;
        let rhs = self.parse_value(&generic)?;
        Ok(Rel {
            lhs,
            op,
            rhs,
            line,
            col,
        })
    }

    fn parse_if(&mut self) -> Result<Stmt> {
        let (line, col) = (self.cur.line, self.cur.col);
        self.advance()?; // 'if'
        self.expect(TokKind::LParen)?;
        let cond = self.parse_cond()?;
        self.expect(TokKind::RParen)?;
        self.push_nested_scope(&format!("if:{}:{}", line, col));
        let body = self.parse_block_or_stmt()?;
        self.pop_scope();

        let else_body = if self.is_keyword("else") {
            let (eline, ecol) = (self.cur.line, self.cur.col);
            self.advance()?;
            self.push_nested_scope(&format!("else:{}:{}", eline, ecol));
            let b = self.parse_block_or_stmt()?;
            self.pop_scope();
            Some(b)
        } else {
            None
        };

        Ok(Stmt::IfElse {
            cond,
            body,
            else_body,
        })
    }

    fn parse_while(&mut self) -> Result<Stmt> {
        let (line, col) = (self.cur.line, self.cur.col);
        self.advance()?; // 'while'
        self.expect(TokKind::LParen)?;
        let cond = self.parse_cond()?;
        self.expect(TokKind::RParen)?;
        self.push_nested_scope(&format!("while:{}:{}", line, col));
        let body = self.parse_block_or_stmt()?;
        self.pop_scope();
        Ok(Stmt::While {
            cond,
            body,
            do_first: false,
        })
    }

    fn parse_do_while(&mut self) -> Result<Stmt> {
        let (line, col) = (self.cur.line, self.cur.col);
        self.advance()?; // 'do'
        self.push_nested_scope(&format!("while:{}:{}", line, col));
        let body = self.parse_block_or_stmt()?;
        self.pop_scope();
        if !self.is_keyword("while") {
            return Err(self.fatal_here("expected 'while' after 'do' block"));
        }
        self.advance()?;
        self.expect(TokKind::LParen)?;
        let cond = self.parse_cond()?;
        self.expect(TokKind::RParen)?;
        self.expect(TokKind::Semi)?;
        Ok(Stmt::While {
            cond,
            body,
            do_first: true,
        })
    }

    fn parse_for(&mut self) -> Result<Stmt> {
        let (line, col) = (self.cur.line, self.cur.col);
        self.advance()?; // 'for'
        self.expect(TokKind::LParen)?;
        self.push_nested_scope(&format!("for:{}:{}", line, col));

        let init = self.parse_for_assign()?;
        self.expect(TokKind::Semi)?;
        let cond = self.parse_cond()?;
        self.expect(TokKind::Semi)?;
        let step = self.parse_for_assign()?;
        self.expect(TokKind::RParen)?;

        let body = self.parse_block_or_stmt()?;
        self.pop_scope();

        Ok(Stmt::For {
            init: Box::new(init),
            cond,
            step: Box::new(step),
            body,
        })
    }

    /// Parses one `assign` (declaration or store) without consuming a
    /// trailing `;` — used for the `for (init; cond; step)` clauses, which
    /// are delimited by `;`/`)` rather than a statement terminator.
    fn parse_for_assign(&mut self) -> Result<Assign> {
        if self.is_type_keyword() || self.is_keyword("mut") {
            let mutable = if self.is_keyword("mut") {
                self.advance()?;
                true
            } else {
                false
            };
            let (line, col) = (self.cur.line, self.cur.col);
            let ty = self.parse_type()?;
            let name = self.expect_id_text()?;
            self.parse_decl_tail(name, ty, mutable, false, line, col)
        } else {
            let (name, line, col) = self.expect_id_pos()?;
            match self.cur.kind {
                TokKind::Equal => {
                    self.advance()?;
                    let expected = self.lookup_var_type_or_err(&name, line, col)?;
                    self.check_mutable(&name, line, col)?;
                    let sym = self.lookup_var_idx(&name, line, col)?;
                    let value = self.parse_value(&expected)?;
                    Ok(Assign {
                        name,
                        sym,
                        decl: None,
                        value: Some(value),
                        line,
                        col,
                    })
                }
                TokKind::PlusEq
                | TokKind::MinusEq
                | TokKind::StarEq
                | TokKind::SlashEq
                | TokKind::PercentEq => {
                    let op = compound_op(self.cur.kind);
                    self.advance()?;
                    let expected = self.lookup_var_type_or_err(&name, line, col)?;
                    self.check_mutable(&name, line, col)?;
                    let sym = self.lookup_var_idx(&name, line, col)?;
                    let rhs = self.parse_value(&expected)?;
                    let list = vec![
                        MathElem::Operand(Expr::Var {
                            name: name.clone(),
                            sym,
                            line,
                            col,
                        }),
                        MathElem::Operator(op),
                        MathElem::Operand(rhs),
                    ];
                    let value = fold_math(list, &expected, self, line, col)?;
                    Ok(Assign {
                        name,
                        sym,
                        decl: None,
                        value: Some(value),
                        line,
                        col,
                    })
                }
                _ => Err(self.fatal(line, col, "expected an assignment in 'for' clause")),
            }
        }
    }

    fn parse_block_or_stmt(&mut self) -> Result<Vec<Stmt>> {
        if self.cur.is(TokKind::LBrace) {
            self.advance()?;
            let mut stmts = Vec::new();
            while !self.cur.is(TokKind::RBrace) {
                stmts.push(self.parse_stmt()?);
            }
            self.advance()?;
            Ok(stmts)
        } else {
            Ok(vec![self.parse_stmt()?])
        }
    }

    // ---- calls ----------------------------------------------------------------

    fn parse_call_args(
        &mut self,
        name: &str,
        line: u32,
        col: u32,
    ) -> Result<(String, Vec<Expr>)> {
        let sig = self
            .symtab
            .lookup_func(name)
            .and_then(|s| s.func.clone())
            .ok_or_else(|| self.fatal(line, col, format!("unknown function '{}'", name)))?;

        self.advance()?; // consume '('
        let mut args = Vec::new();
        if !self.cur.is(TokKind::RParen) {
            loop {
                let idx = args.len();
                let expected = *sig.params.get(idx).unwrap_or(&Type::new(BaseType::Int));
                let arg = self.parse_value(&expected)?;
                if let (Some(true), Expr::Ref { name: ref_name, .. }) =
                    (sig.param_mut.get(idx).copied(), &arg)
                {
                    if let Some(sym) = self.lookup_var(ref_name) {
                        if !sym.mutable {
                            return Err(self.fatal(
                                line,
                                col,
                                format!(
                                    "cannot pass immutable variable '{}' as a mutable reference",
                                    ref_name
                                ),
                            ));
                        }
                    }
                }
                args.push(arg);
                if self.cur.is(TokKind::Comma) {
                    self.advance()?;
                } else {
                    break;
                }
            }
        }
        self.expect(TokKind::RParen)?;

        if args.len() != sig.params.len() {
            return Err(self.fatal(
                line,
                col,
                format!(
                    "'{}' expects {} argument(s), found {}",
                    name,
                    sig.params.len(),
                    args.len()
                ),
            ));
        }

        if self.func_name.as_deref() == Some(name) {
            return Err(self.fatal(line, col, "will result in infinite recursion"));
        }

        Ok((name.to_owned(), args))
    }

    // ---- expressions ------------------------------------------------------

    fn parse_value(&mut self, expected: &Type) -> Result<Expr> {
        let first = self.parse_atom(expected)?;
        if self.cur_is_arith_op() {
            let mut list = vec![MathElem::Operand(first)];
            while self.cur_is_arith_op() {
                let op = arith_op(self.cur.kind);
                self.advance()?;
                let (line, col) = (self.cur.line, self.cur.col);
                let operand = self.parse_atom(expected)?;
                list.push(MathElem::Operator(op));
                list.push(MathElem::Operand(operand));
                let _ = (line, col);
            }
            let (line, col) = (self.cur.line, self.cur.col);
            fold_math(list, expected, self, line, col)
        } else {
            Ok(first)
        }
    }

    fn cur_is_arith_op(&self) -> bool {
        matches!(
            self.cur.kind,
            TokKind::Plus | TokKind::Minus | TokKind::Star | TokKind::Slash | TokKind::Percent
        )
    }

    fn parse_atom(&mut self, expected: &Type) -> Result<Expr> {
        match self.cur.kind {
            TokKind::Int => {
                let line = self.cur.line;
                let col = self.cur.col;
                let raw: i64 = self
                    .cur
                    .lexeme
                    .parse()
                    .map_err(|_| self.fatal(line, col, "invalid integer literal"))?;
                self.advance()?;
                if expected.is_float() {
                    Ok(Expr::FloatLit(raw as f64))
                } else {
                    Ok(Expr::IntLit(narrow_int(raw, expected)))
                }
            }
            TokKind::Float => {
                let line = self.cur.line;
                let col = self.cur.col;
                let raw: f64 = self
                    .cur
                    .lexeme
                    .parse()
                    .map_err(|_| self.fatal(line, col, "invalid float literal"))?;
                self.advance()?;
                if expected.is_float() {
                    Ok(Expr::FloatLit(raw))
                } else {
                    Ok(Expr::IntLit(narrow_int(raw.trunc() as i64, expected)))
                }
            }
            TokKind::Str => {
                let bytes = decode_escapes(&self.cur.lexeme)
                    .map_err(|e| self.fatal(self.cur.line, self.cur.col, e))?;
                self.advance()?;
                Ok(Expr::StrLit(bytes))
            }
            TokKind::LBrace => {
                self.advance()?;
                let mut elems = Vec::new();
                if !self.cur.is(TokKind::RBrace) {
                    loop {
                        elems.push(self.parse_value(expected)?);
                        if self.cur.is(TokKind::Comma) {
                            self.advance()?;
                        } else {
                            break;
                        }
                    }
                }
                self.expect(TokKind::RBrace)?;
                Ok(Expr::ArrayLit(elems))
            }
            TokKind::Star => {
                let (line, col) = (self.cur.line, self.cur.col);
                self.advance()?;
                let name = self.expect_id_text()?;
                self.deref_elem_type(&name, line, col)?;
                let sym = self.lookup_var_idx(&name, line, col)?;
                Ok(Expr::Deref { name, sym, line, col })
            }
            TokKind::Amp => {
                let (line, col) = (self.cur.line, self.cur.col);
                self.advance()?;
                let name = self.expect_id_text()?;
                self.lookup_var_type_or_err(&name, line, col)?;
                let sym = self.lookup_var_idx(&name, line, col)?;
                Ok(Expr::Ref { name, sym, line, col })
            }
            TokKind::Id => {
                let name = self.cur.lexeme.clone();
                let (line, col) = (self.cur.line, self.cur.col);
                self.advance()?;
                if self.cur.is(TokKind::LParen) {
                    let (call_name, args) = self.parse_call_args(&name, line, col)?;
                    let sig = self.symtab.lookup_func(&call_name).unwrap().func.clone();
                    if let Some(sig) = sig {
                        if sig.ret_type.is_void() {
                            return Err(self.fatal(
                                line,
                                col,
                                format!("cannot use void function '{}' in a value position", call_name),
                            ));
                        }
                    }
                    Ok(Expr::Call {
                        name: call_name,
                        args,
                        line,
                        col,
                    })
                } else if self.cur.is(TokKind::LSquare) {
                    self.advance()?;
                    let elem_ty = self.subscript_elem_type(&name, line, col)?;
                    let sym = self.lookup_var_idx(&name, line, col)?;
                    let index = self.parse_value(&Type::new(BaseType::Int))?;
                    self.expect(TokKind::RSquare)?;
                    let _ = elem_ty;
                    Ok(Expr::Subscr {
                        name,
                        sym,
                        index: Box::new(index),
                        line,
                        col,
                    })
                } else {
                    self.lookup_var_type_or_err(&name, line, col)?;
                    let sym = self.lookup_var_idx(&name, line, col)?;
                    Ok(Expr::Var { name, sym, line, col })
                }
            }
            _ => Err(self.fatal_here(format!("unexpected token '{}'", self.cur.lexeme))),
        }
    }
}

fn compound_op(kind: TokKind) -> OperKind {
    match kind {
        TokKind::PlusEq => OperKind::Add,
        TokKind::MinusEq => OperKind::Sub,
        TokKind::StarEq => OperKind::Mul,
        TokKind::SlashEq => OperKind::Div,
        TokKind::PercentEq => OperKind::Mod,
        _ => unreachable!(),
    }
}

fn arith_op(kind: TokKind) -> OperKind {
    match kind {
        TokKind::Plus => OperKind::Add,
        TokKind::Minus => OperKind::Sub,
        TokKind::Star => OperKind::Mul,
        TokKind::Slash => OperKind::Div,
        TokKind::Percent => OperKind::Mod,
        _ => unreachable!(),
    }
}

/// Truncates an integer literal's value to the target type's width, with
/// signed-wraparound narrowing.
fn narrow_int(value: i64, ty: &Type) -> i64 {
    if ty.is_pointer() {
        return value;
    }
    match ty.base {
        BaseType::Char => value as i8 as i64,
        BaseType::Int => value as i32 as i64,
        BaseType::Float | BaseType::Void => value,
    }
}

/// Decodes the `\n \t \r \0 \' \" \\` escape set used by both character and
/// string literals.
pub fn decode_escapes(raw: &str) -> std::result::Result<Vec<u8>, String> {
    let mut out = Vec::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push(b'\n'),
                Some('t') => out.push(b'\t'),
                Some('r') => out.push(b'\r'),
                Some('0') => out.push(0),
                Some('\'') => out.push(b'\''),
                Some('"') => out.push(b'"'),
                Some('\\') => out.push(b'\\'),
                Some(other) => return Err(format!("unsupported escape sequence '\\{}'", other)),
                None => return Err("trailing escape character".to_owned()),
            }
        } else {
            out.push(c as u8);
        }
    }
    Ok(out)
}

/// Folds a flat `[operand, operator, operand, ...]` list at parse time when
/// every operand is a literal, evaluating in the same two-pass
/// `* / %` then `+ -`, left-to-right order the emitter uses.
/// Non-foldable lists are returned as `Expr::Math`.
fn fold_math(
    list: Vec<MathElem>,
    expected: &Type,
    parser: &Parser,
    line: u32,
    col: u32,
) -> Result<Expr> {
    if let Some(folded) = try_fold_literals(&list, parser, line, col)? {
        return Ok(match folded {
            Literal::Int(v) => Expr::IntLit(narrow_int(v, expected)),
            Literal::Float(v) => {
                if expected.is_float() {
                    Expr::FloatLit(v)
                } else {
                    Expr::IntLit(narrow_int(v.trunc() as i64, expected))
                }
            }
        });
    }

    check_no_pointer_operands(&list, parser, line, col)?;
    Ok(Expr::Math(list))
}

enum Literal {
    Int(i64),
    Float(f64),
}

fn check_no_pointer_operands(list: &[MathElem], parser: &Parser, line: u32, col: u32) -> Result<()> {
    for elem in list {
        if let MathElem::Operand(Expr::Var { name, .. }) = elem {
            if let Some(sym) = parser.lookup_var(name) {
                if sym.ty.is_pointer() {
                    return Err(parser.fatal(line, col, "pointer arithmetic is not supported"));
                }
            }
        }
    }
    Ok(())
}

fn try_fold_literals(
    list: &[MathElem],
    parser: &Parser,
    line: u32,
    col: u32,
) -> Result<Option<Literal>> {
    let mut values: Vec<Literal> = Vec::new();
    let mut ops: Vec<OperKind> = Vec::new();

    for elem in list {
        match elem {
            MathElem::Operand(Expr::IntLit(v)) => values.push(Literal::Int(*v)),
            MathElem::Operand(Expr::FloatLit(v)) => values.push(Literal::Float(*v)),
            MathElem::Operand(_) => return Ok(None),
            MathElem::Operator(op) => ops.push(*op),
        }
    }

    // Two-pass reduction: `* / %` first, then `+ -`, left to right within
    // each pass, exactly mirroring the emitter's runtime reduction order.
    reduce_pass(&mut values, &mut ops, parser, line, col, true)?;
    reduce_pass(&mut values, &mut ops, parser, line, col, false)?;

    debug_assert!(ops.is_empty());
    Ok(values.into_iter().next())
}

fn reduce_pass(
    values: &mut Vec<Literal>,
    ops: &mut Vec<OperKind>,
    parser: &Parser,
    line: u32,
    col: u32,
    mul_tier: bool,
) -> Result<()> {
    let mut i = 0;
    while i < ops.len() {
        let is_target = ops[i].is_mul_tier() == mul_tier;
        if is_target {
            let lhs = lit_take(values, i);
            let rhs = lit_take(values, i + 1);
            let result = apply_op(ops[i], lhs, rhs, parser, line, col)?;
            values[i] = result;
            values.remove(i + 1);
            ops.remove(i);
        } else {
            i += 1;
        }
    }
    Ok(())
}

fn lit_take(values: &[Literal], idx: usize) -> Literal {
    match &values[idx] {
        Literal::Int(v) => Literal::Int(*v),
        Literal::Float(v) => Literal::Float(*v),
    }
}

fn apply_op(
    op: OperKind,
    lhs: Literal,
    rhs: Literal,
    parser: &Parser,
    line: u32,
    col: u32,
) -> Result<Literal> {
    let float_result = matches!(lhs, Literal::Float(_)) || matches!(rhs, Literal::Float(_));

    if float_result && op == OperKind::Mod {
        return Err(parser.fatal(line, col, "modulus of a float is not supported"));
    }

    if float_result {
        let l = as_f64(&lhs);
        let r = as_f64(&rhs);
        let v = match op {
            OperKind::Add => l + r,
            OperKind::Sub => l - r,
            OperKind::Mul => l * r,
            OperKind::Div => l / r,
            OperKind::Mod => unreachable!(),
            _ => return Err(parser.fatal(line, col, "unsupported constant comparison")),
        };
        Ok(Literal::Float(v))
    } else {
        let l = as_i64(&lhs);
        let r = as_i64(&rhs);
        let v = match op {
            OperKind::Add => l.wrapping_add(r),
            OperKind::Sub => l.wrapping_sub(r),
            OperKind::Mul => l.wrapping_mul(r),
            OperKind::Div => {
                if r == 0 {
                    return Err(parser.fatal(line, col, "division by zero in constant expression"));
                }
                l.wrapping_div(r)
            }
            OperKind::Mod => {
                if r == 0 {
                    return Err(parser.fatal(line, col, "division by zero in constant expression"));
                }
                l.wrapping_rem(r)
            }
            _ => return Err(parser.fatal(line, col, "unsupported constant comparison")),
        };
        Ok(Literal::Int(v))
    }
}

fn as_f64(lit: &Literal) -> f64 {
    match lit {
        Literal::Int(v) => *v as f64,
        Literal::Float(v) => *v,
    }
}

fn as_i64(lit: &Literal) -> i64 {
    match lit {
        Literal::Int(v) => *v,
        Literal::Float(v) => *v as i64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(src: &str) -> ParseOutput {
        Parser::from_source("t.sc", src).unwrap().parse().unwrap()
    }

    fn parse_err(src: &str) -> String {
        let err = Parser::from_source("t.sc", src)
            .unwrap()
            .parse()
            .unwrap_err();
        format!("{}", err)
    }

    #[test]
    fn constant_folding_two_pass() {
        let out = parse_ok("int main_ret() { return 2 + 3 * 4; } void main() {}");
        let f = match &out.root.items[0] {
            Item::Func(f) => f,
            _ => panic!(),
        };
        match &f.body[0] {
            Stmt::Ret {
                value: Some(Expr::IntLit(14)),
                ..
            } => {}
            other => panic!("expected folded literal 14, got {:?}", other),
        }
    }

    #[test]
    fn reassigning_immutable_is_fatal() {
        let msg = parse_err("void main() { int x = 1; x = 2; }");
        assert!(msg.contains("reassigning immutable variable 'x'"), "{}", msg);
    }

    #[test]
    fn mut_allows_reassignment() {
        parse_ok("void main() { mut int x = 1; x = 2; }");
    }

    #[test]
    fn array_bounds_checked() {
        let msg = parse_err("void main() { int a[3] = {1,2,3,4}; }");
        assert!(msg.contains("too large"), "{}", msg);
        parse_ok("void main() { int a[4] = {1,2,3,4}; }");
    }

    #[test]
    fn direct_recursion_is_fatal() {
        let msg = parse_err("void main() { main(); }");
        assert!(msg.contains("infinite recursion"), "{}", msg);
    }

    #[test]
    fn main_must_be_void() {
        let msg = parse_err("int main() { return 0; }");
        assert!(msg.contains("must be declared"), "{}", msg);
    }

    #[test]
    fn missing_main_is_fatal() {
        let msg = parse_err("void f() {}");
        assert!(msg.contains("'main'"), "{}", msg);
    }
}
