//! The tagged-variant AST: a Rust sum type per node kind instead of a
//! discriminated union with a shared header.

use std::fmt;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BaseType {
    Void,
    Char,
    Int,
    Float,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Type {
    pub base: BaseType,
    pub ptr_depth: u32,
}

impl Type {
    pub fn new(base: BaseType) -> Type {
        Type { base, ptr_depth: 0 }
    }

    pub fn pointer_to(&self) -> Type {
        Type {
            base: self.base,
            ptr_depth: self.ptr_depth + 1,
        }
    }

    pub fn pointee(&self) -> Type {
        Type {
            base: self.base,
            ptr_depth: self.ptr_depth.saturating_sub(1),
        }
    }

    pub fn is_pointer(&self) -> bool {
        self.ptr_depth > 0
    }

    pub fn is_float(&self) -> bool {
        self.base == BaseType::Float && self.ptr_depth == 0
    }

    pub fn is_void(&self) -> bool {
        self.base == BaseType::Void && self.ptr_depth == 0
    }

    /// Size in bytes of one value of this type (8 for any pointer depth > 0).
    pub fn size(&self) -> u32 {
        if self.ptr_depth > 0 {
            return 8;
        }
        match self.base {
            BaseType::Void => 0,
            BaseType::Char => 1,
            BaseType::Int | BaseType::Float => 4,
        }
    }

    /// True if values of this type are classified into the integer
    /// register class (char/int/pointer) rather than the float class.
    pub fn is_int_class(&self) -> bool {
        !self.is_float()
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let base = match self.base {
            BaseType::Void => "void",
            BaseType::Char => "char",
            BaseType::Int => "int",
            BaseType::Float => "float",
        };
        write!(f, "{}{}", base, "*".repeat(self.ptr_depth as usize))
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OperKind {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    EqEq,
    NotEq,
    Lt,
    Lte,
    Gt,
    Gte,
}

impl OperKind {
    pub fn is_arith(&self) -> bool {
        matches!(self, OperKind::Add | OperKind::Sub | OperKind::Mul | OperKind::Div | OperKind::Mod)
    }

    pub fn is_mul_tier(&self) -> bool {
        matches!(self, OperKind::Mul | OperKind::Div | OperKind::Mod)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LogicOp {
    And,
    Or,
}

/// One element of a flat `MATH` expression list: alternating operand,
/// operator, operand, ...
#[derive(Clone, Debug)]
pub enum MathElem {
    Operand(Expr),
    Operator(OperKind),
}

#[derive(Clone, Debug)]
pub enum Expr {
    IntLit(i64),
    FloatLit(f64),
    StrLit(Vec<u8>),
    Var {
        name: String,
        /// Resolved symbol-table index, set by the parser at construction
        /// time so the emitter never re-derives scope-chain visibility.
        sym: usize,
        line: u32,
        col: u32,
    },
    Call {
        name: String,
        args: Vec<Expr>,
        line: u32,
        col: u32,
    },
    /// A flat alternating operand/operator sequence, length odd and >= 3.
    Math(Vec<MathElem>),
    /// Replaces a reduced sub-expression during emission; never produced
    /// by the parser.
    MathVar {
        frame_slot: Option<i64>,
        is_float: bool,
    },
    Subscr {
        name: String,
        sym: usize,
        index: Box<Expr>,
        line: u32,
        col: u32,
    },
    Deref {
        name: String,
        sym: usize,
        line: u32,
        col: u32,
    },
    Ref {
        name: String,
        sym: usize,
        line: u32,
        col: u32,
    },
    /// `{ v0, v1, ... }` — an array literal initializer.
    ArrayLit(Vec<Expr>),
}

/// A single comparison inside a condition, e.g. `a < b`.
#[derive(Clone, Debug)]
pub struct Rel {
    pub lhs: Expr,
    pub op: OperKind,
    pub rhs: Expr,
    pub line: u32,
    pub col: u32,
}

/// `cond := rel (('&&'|'||') rel)*` — `rels.len() == seps.len() + 1`.
#[derive(Clone, Debug)]
pub struct Cond {
    pub rels: Vec<Rel>,
    pub seps: Vec<LogicOp>,
}

#[derive(Clone, Debug)]
pub struct Decl {
    pub ty: Type,
    pub mutable: bool,
    pub arr_cap: Option<u32>,
}

/// A declaration (`decl = Some(..)`) or a store to an existing variable
/// (`decl = None`) — one node serving both roles depending on whether
/// `type` is present.
#[derive(Clone, Debug)]
pub struct Assign {
    pub name: String,
    pub sym: usize,
    pub decl: Option<Decl>,
    pub value: Option<Expr>,
    pub line: u32,
    pub col: u32,
}

#[derive(Clone, Debug)]
pub struct Param {
    pub name: String,
    pub ty: Type,
    pub mutable: bool,
    pub line: u32,
    pub col: u32,
}

#[derive(Clone, Debug)]
pub enum Stmt {
    Assign(Assign),
    Call {
        name: String,
        args: Vec<Expr>,
        line: u32,
        col: u32,
    },
    Ret {
        value: Option<Expr>,
        line: u32,
        col: u32,
    },
    IfElse {
        cond: Cond,
        body: Vec<Stmt>,
        else_body: Option<Vec<Stmt>>,
    },
    While {
        cond: Cond,
        body: Vec<Stmt>,
        do_first: bool,
    },
    For {
        init: Box<Assign>,
        cond: Cond,
        step: Box<Assign>,
        body: Vec<Stmt>,
    },
    SubscrStore {
        name: String,
        sym: usize,
        index: Expr,
        value: Expr,
        line: u32,
        col: u32,
    },
    DerefStore {
        name: String,
        sym: usize,
        value: Expr,
        line: u32,
        col: u32,
    },
}

#[derive(Clone, Debug)]
pub struct Func {
    pub name: String,
    pub ret_type: Type,
    pub params: Vec<Param>,
    pub body: Vec<Stmt>,
    pub has_return: bool,
    pub line: u32,
    pub col: u32,
}

#[derive(Clone, Debug)]
pub enum Item {
    Func(Func),
    Global(Assign),
}

#[derive(Clone, Debug)]
pub struct Root {
    pub items: Vec<Item>,
}
