use std::fmt;

#[derive(Debug, Clone)]
pub struct Program {
    pub main_class: Class,
    pub classes: Vec<Class>,
}

impl Program {
    /// Main class first, then the remaining classes in declaration order.
    pub fn all_classes(&self) -> impl Iterator<Item = &Class> {
        std::iter::once(&self.main_class).chain(self.classes.iter())
    }

    pub fn all_classes_mut(&mut self) -> impl Iterator<Item = &mut Class> {
        std::iter::once(&mut self.main_class).chain(self.classes.iter_mut())
    }
}

#[derive(Debug, Clone)]
pub struct Class {
    pub name: String,
    pub fields: Vec<VarDecl>,
    pub methods: Vec<Method>,
}

#[derive(Debug, Clone)]
pub struct Method {
    pub return_type: Type,
    pub name: String,
    pub formals: Vec<VarDecl>,
    pub body: Block,
}

#[derive(Debug, Clone)]
pub struct Block {
    pub vars: Vec<VarDecl>,
    pub statements: Vec<Statement>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarDecl {
    pub ty: Type,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Type {
    Int,
    Bool,
    String,
    Void,
    // Type of the `null` literal, never written in source
    Null,
    Class(String),
}

impl Type {
    pub fn from_name(name: &str) -> Self {
        match name {
            "Int" => Type::Int,
            "Bool" => Type::Bool,
            "String" => Type::String,
            "Void" => Type::Void,
            other => Type::Class(other.to_string()),
        }
    }

    /// Whether a value of type `other` can be stored where `self` is expected.
    pub fn accepts(&self, other: &Type) -> bool {
        self == other || (*other == Type::Null && matches!(self, Type::String | Type::Class(_)))
    }

    pub fn class_name(&self) -> Option<&str> {
        match self {
            Type::Class(name) => Some(name),
            _ => None,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Int => write!(f, "Int"),
            Type::Bool => write!(f, "Bool"),
            Type::String => write!(f, "String"),
            Type::Void => write!(f, "Void"),
            Type::Null => write!(f, "Null"),
            Type::Class(name) => write!(f, "{}", name),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Statement {
    If { cond: Expr, then_block: Vec<Statement>, else_block: Vec<Statement> },
    While { cond: Expr, body: Vec<Statement> },
    Readln { name: String },
    Println { expr: Expr },
    // `target` is either a Variable or a Field expression
    Assign { target: Expr, value: Expr },
    Call { call: Expr },
    Return { expr: Option<Expr> },
}

/// An expression node. `ty` is filled in by the type checker.
#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub ty: Option<Type>,
}

impl Expr {
    pub fn new(kind: ExprKind) -> Self {
        Self { kind, ty: None }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    IntLit { value: i32 },
    BoolLit { value: bool },
    StrLit { value: String },
    Null,
    This,
    Variable { name: String },
    New { class: String },
    Field { object: Box<Expr>, field: String },
    Call { callee: Callee, args: Vec<Expr>, signature: Option<MethodSig> },
    Binary { op: BinaryOp, left: Box<Expr>, right: Box<Expr> },
    Unary { op: UnaryOp, operand: Box<Expr> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Callee {
    // `foo(..)`, resolved against the enclosing class
    Local { name: String },
    // `obj.foo(..)`
    Member { object: Box<Expr>, name: String },
}

/// A resolved method signature, attached to every call by the type checker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSig {
    pub class: String,
    pub name: String,
    pub params: Vec<Type>,
    pub return_type: Type,
}

impl MethodSig {
    /// `Class_method_T1_T2`, the symbol an overload is compiled to.
    pub fn mangled(&self) -> String {
        mangle(&self.class, &self.name, &self.params)
    }
}

pub fn mangle(class: &str, method: &str, params: &[Type]) -> String {
    let mut name = format!("{}_{}", class, method);
    for param in params {
        name.push('_');
        name.push_str(&param.to_string());
    }
    name
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    And,
    Or,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
        }
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Not,
}

impl fmt::Display for UnaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnaryOp::Neg => write!(f, "-"),
            UnaryOp::Not => write!(f, "!"),
        }
    }
}
