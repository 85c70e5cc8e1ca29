pub mod cfg;
pub mod interp;
pub mod liveness;
pub mod lower;
pub mod optimize;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

pub use crate::frontend::ast::{BinaryOp, Type, UnaryOp};

/// Every field, local and reference occupies one machine word.
pub const WORD_SIZE: u32 = 4;

#[derive(Debug, Clone)]
pub struct Program3 {
    pub classes: Vec<ClassData>,
    pub methods: Vec<Method3>,
    // Insertion order, duplicates kept
    pub strings: Vec<String>,
    // Mangled name of the program entry point
    pub entry: String,
}

impl Program3 {
    pub fn class(&self, name: &str) -> Option<&ClassData> {
        self.classes.iter().find(|c| c.name == name)
    }

    pub fn method(&self, name: &str) -> Option<&Method3> {
        self.methods.iter().find(|m| m.name == name)
    }
}

/// Field layout of one class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassData {
    pub name: String,
    pub fields: Vec<FieldSlot>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSlot {
    pub name: String,
    pub ty: Type,
    pub offset: u32,
}

impl ClassData {
    /// Lays fields out in declaration order, one word each.
    pub fn new(name: impl Into<String>, fields: impl IntoIterator<Item = (Type, String)>) -> Self {
        let fields = fields
            .into_iter()
            .enumerate()
            .map(|(i, (ty, name))| FieldSlot { name, ty, offset: i as u32 * WORD_SIZE })
            .collect();
        Self { name: name.into(), fields }
    }

    pub fn field(&self, name: &str) -> Option<&FieldSlot> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn size(&self) -> u32 {
        self.fields.len() as u32 * WORD_SIZE
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarDecl3 {
    pub ty: Type,
    pub name: String,
}

impl VarDecl3 {
    pub fn new(ty: Type, name: impl Into<String>) -> Self {
        Self { ty, name: name.into() }
    }
}

#[derive(Debug, Clone)]
pub struct Method3 {
    pub return_type: Type,
    pub name: String,
    // `this` first
    pub formals: Vec<VarDecl3>,
    pub body: Block3,
}

#[derive(Debug, Clone, Default)]
pub struct Block3 {
    pub locals: Vec<VarDecl3>,
    pub statements: Vec<Stmt3>,
}

impl Method3 {
    /// Every name the method owns: formals, declared locals, and every
    /// temporary or local that some statement defines.
    ///
    /// An identifier outside this set is an implicit field of `this`.
    pub fn symbols(&self) -> BTreeSet<String> {
        let mut symbols: BTreeSet<String> = self
            .formals
            .iter()
            .chain(self.body.locals.iter())
            .map(|v| v.name.clone())
            .collect();
        for stmt in &self.body.statements {
            if let Some(dest) = stmt.defined() {
                symbols.insert(dest.to_string());
            }
        }
        symbols
    }

    /// Static type of every symbol of the method.
    pub fn var_types(&self) -> BTreeMap<String, Type> {
        let mut types: BTreeMap<String, Type> = self
            .formals
            .iter()
            .chain(self.body.locals.iter())
            .map(|v| (v.name.clone(), v.ty.clone()))
            .collect();
        for stmt in &self.body.statements {
            let (dest, ty) = match stmt {
                Stmt3::TypeAssign { ty, dest, .. }
                | Stmt3::TypeAssignNew { ty, dest, .. }
                | Stmt3::TypeAssignCall { ty, dest, .. }
                | Stmt3::TypeAssignFieldRead { ty, dest, .. }
                | Stmt3::BinaryOp { ty, dest, .. } => (dest, ty.clone()),
                Stmt3::UnaryOp { dest, op, .. } => (
                    dest,
                    match op {
                        UnaryOp::Neg => Type::Int,
                        UnaryOp::Not => Type::Bool,
                    },
                ),
                _ => continue,
            };
            types.entry(dest.clone()).or_insert(ty);
        }
        types
    }
}

/// An IR3 operand. Literal forms are checked before names; a `Var` that is
/// not one of the method's symbols refers to a field of `this`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Operand {
    Int(i32),
    Bool(bool),
    // Raw literal text between the quotes
    Str(String),
    Null,
    Var(String),
}

impl Operand {
    pub fn var(name: impl Into<String>) -> Self {
        Operand::Var(name.into())
    }

    pub fn as_var(&self) -> Option<&str> {
        match self {
            Operand::Var(name) => Some(name),
            _ => None,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Int(value) => write!(f, "{}", value),
            Operand::Bool(value) => write!(f, "{}", value),
            Operand::Str(text) => write!(f, "\"{}\"", text),
            Operand::Null => write!(f, "null"),
            Operand::Var(name) => write!(f, "{}", name),
        }
    }
}

/// Destination of a plain assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Place {
    Var(String),
    Field { object: String, field: String },
}

impl fmt::Display for Place {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Place::Var(name) => write!(f, "{}", name),
            Place::Field { object, field } => write!(f, "{}.{}", object, field),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stmt3 {
    Label(String),
    Goto(String),
    // Branch when `cond` is non-zero, fall through otherwise
    IfGoto { cond: Operand, label: String },
    Readln(String),
    Println(Operand),
    Return(Option<Operand>),
    Assign { dest: Place, src: Operand },
    TypeAssign { ty: Type, dest: String, value: Operand },
    TypeAssignNew { ty: Type, dest: String, class: String },
    TypeAssignCall { ty: Type, dest: String, target: String, args: Vec<Operand> },
    TypeAssignFieldRead { ty: Type, dest: String, object: String, field: String },
    BinaryOp { ty: Type, dest: String, lhs: Operand, op: BinaryOp, rhs: Operand },
    UnaryOp { dest: String, op: UnaryOp, operand: Operand },
}

impl Stmt3 {
    /// Label a Goto or IfGoto may transfer control to.
    pub fn jump_target(&self) -> Option<&str> {
        match self {
            Stmt3::Goto(label) | Stmt3::IfGoto { label, .. } => Some(label),
            _ => None,
        }
    }

    /// Whether control never falls through to the next statement.
    pub fn ends_flow(&self) -> bool {
        matches!(self, Stmt3::Goto(_) | Stmt3::Return(_))
    }

    /// Temporary or local introduced by a typed definition.
    pub fn defined(&self) -> Option<&str> {
        match self {
            Stmt3::TypeAssign { dest, .. }
            | Stmt3::TypeAssignNew { dest, .. }
            | Stmt3::TypeAssignCall { dest, .. }
            | Stmt3::TypeAssignFieldRead { dest, .. }
            | Stmt3::BinaryOp { dest, .. }
            | Stmt3::UnaryOp { dest, .. } => Some(dest),
            _ => None,
        }
    }
}

impl fmt::Display for Stmt3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stmt3::Label(label) => write!(f, "  Label {}:", label),
            Stmt3::Goto(label) => write!(f, "    goto {};", label),
            Stmt3::IfGoto { cond, label } => write!(f, "    if ( {} ) goto {};", cond, label),
            Stmt3::Readln(name) => write!(f, "    readln({});", name),
            Stmt3::Println(value) => write!(f, "    println({});", value),
            Stmt3::Return(None) => write!(f, "    return ;"),
            Stmt3::Return(Some(value)) => write!(f, "    return {};", value),
            Stmt3::Assign { dest, src } => write!(f, "    {} = {};", dest, src),
            Stmt3::TypeAssign { ty, dest, value } => write!(f, "    {} {} = {};", ty, dest, value),
            Stmt3::TypeAssignNew { ty, dest, class } => {
                write!(f, "    {} {} = new {}();", ty, dest, class)
            }
            Stmt3::TypeAssignCall { ty, dest, target, args } => {
                let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
                write!(f, "    {} {} = {}({});", ty, dest, target, args.join(","))
            }
            Stmt3::TypeAssignFieldRead { ty, dest, object, field } => {
                write!(f, "    {} {} = {}.{};", ty, dest, object, field)
            }
            Stmt3::BinaryOp { ty, dest, lhs, op, rhs } => {
                write!(f, "    {} {} = {} {} {};", ty, dest, lhs, op, rhs)
            }
            Stmt3::UnaryOp { dest, op, operand } => write!(f, "    {} = {} {};", dest, op, operand),
        }
    }
}

impl fmt::Display for ClassData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "class {} {{ ", self.name)?;
        for field in &self.fields {
            writeln!(f, "    {} {};", field.ty, field.name)?;
        }
        write!(f, "}}")
    }
}

impl fmt::Display for Method3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let formals: Vec<String> =
            self.formals.iter().map(|v| format!("{} {}", v.ty, v.name)).collect();
        writeln!(f, "{} {} ({}) {{ ", self.return_type, self.name, formals.join(","))?;
        for local in &self.body.locals {
            writeln!(f, "    {} {};", local.ty, local.name)?;
        }
        for stmt in &self.body.statements {
            writeln!(f, "{}", stmt)?;
        }
        write!(f, "}}")
    }
}

impl fmt::Display for Program3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "======= CData3 =======\n")?;
        for class in &self.classes {
            writeln!(f, "{}\n", class)?;
        }
        writeln!(f, "=======  CMtd3 =======\n")?;
        for method in &self.methods {
            writeln!(f, "{}\n", method)?;
        }
        Ok(())
    }
}
