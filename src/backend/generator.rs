use crate::backend::regalloc::{Allocation, Location};
use crate::ir::{BinaryOp, ClassData, Method3, Operand, Place, Program3, Stmt3, Type, UnaryOp, WORD_SIZE};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Write};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EmitError {
    #[error("cannot emit '{detail}' in {method}")]
    Unsupported { method: String, detail: String },

    #[error("class '{0}' has no layout")]
    UnknownClass(String),

    #[error("class '{class}' has no field '{field}'")]
    UnknownField { class: String, field: String },

    #[error("variable '{name}' in {method} has no known type")]
    UnknownVariable { method: String, name: String },

    #[error("entry method '{0}' was not lowered")]
    MissingEntry(String),

    #[error("string literal \"{0}\" is missing from the literal pool")]
    MissingLiteral(String),

    #[error(transparent)]
    Fmt(#[from] fmt::Error),
}

// Bytes pushed by the prologue: v1-v5, fp, lr
const SAVED_BYTES: u32 = 7 * WORD_SIZE;
const ARG_REGISTERS: [&str; 4] = ["a1", "a2", "a3", "a4"];

/// Labels for the builtin formats followed by every distinct pooled string.
pub struct Literals {
    labels: Vec<(String, String)>,
}

pub const PRINT_INT: &str = "LC0";
pub const PRINT_STR: &str = "LC1";
pub const READ_INT: &str = "LC2";
pub const READ_BUFFER: &str = "LC3";

impl Literals {
    pub fn new(pool: &[String]) -> Self {
        let mut labels: Vec<(String, String)> = [
            (r"%d\n", PRINT_INT),
            (r"%s\n", PRINT_STR),
            ("%d", READ_INT),
            (r"\0\0\0\0", READ_BUFFER),
        ]
        .iter()
        .map(|(text, label)| (text.to_string(), label.to_string()))
        .collect();

        let mut seen = BTreeSet::new();
        for text in pool {
            if seen.insert(text.as_str()) {
                labels.push((text.clone(), format!("LC{}", labels.len())));
            }
        }
        Self { labels }
    }

    /// Label of a pooled string. Builtin formats are never looked up by text.
    pub fn label(&self, text: &str) -> Result<&str, EmitError> {
        self.labels
            .iter()
            .skip(4)
            .find(|(t, _)| t == text)
            .map(|(_, label)| label.as_str())
            .ok_or_else(|| EmitError::MissingLiteral(text.to_string()))
    }

    pub fn write_data(&self, output: &mut String) -> fmt::Result {
        writeln!(output, "    .data")?;
        for (text, label) in &self.labels {
            writeln!(output, "{}:", label)?;
            writeln!(output, "    .asciz \"{}\"", text)?;
        }
        Ok(())
    }
}

/// One word per method variable below the frame pointer, formals first.
#[derive(Debug, Clone)]
pub struct FrameLayout {
    offsets: BTreeMap<String, u32>,
}

impl FrameLayout {
    pub fn new(method: &Method3) -> Self {
        let mut order: Vec<String> = Vec::new();
        for decl in method.formals.iter().chain(method.body.locals.iter()) {
            if !order.contains(&decl.name) {
                order.push(decl.name.clone());
            }
        }
        for name in method.symbols() {
            if !order.contains(&name) {
                order.push(name);
            }
        }
        let offsets = order
            .into_iter()
            .enumerate()
            .map(|(k, name)| (name, (k as u32 + 1) * WORD_SIZE))
            .collect();
        Self { offsets }
    }

    /// `n` such that the variable lives at `[fp, #-n]`.
    pub fn offset(&self, name: &str) -> Option<u32> {
        self.offsets.get(name).copied()
    }

    pub fn size(&self) -> u32 {
        self.offsets.len() as u32 * WORD_SIZE
    }
}

/// Emits the `.data` section, the text header and every method.
pub fn generate_program(
    program: &Program3,
    methods: &[(&Method3, Allocation)],
) -> Result<String, EmitError> {
    let mut output = String::new();
    let literals = Literals::new(&program.strings);

    literals.write_data(&mut output)?;
    writeln!(output)?;
    writeln!(output, "    .text")?;
    writeln!(output, "    .global main")?;
    writeln!(output, "    .type main, %function")?;
    write_entry(&mut output, program)?;

    for (method, allocation) in methods {
        writeln!(output)?;
        MethodEmitter::new(program, &literals, method, allocation)?.emit(&mut output)?;
    }

    Ok(output)
}

/// `main` allocates the main object and calls the entry method with it as
/// `this`. Any further formals of the entry method start out zero.
fn write_entry(output: &mut String, program: &Program3) -> Result<(), EmitError> {
    let entry = program.method(&program.entry).ok_or_else(|| EmitError::MissingEntry(program.entry.clone()))?;
    let class_name = entry
        .formals
        .first()
        .and_then(|f| f.ty.class_name())
        .ok_or_else(|| EmitError::UnknownVariable { method: entry.name.clone(), name: "this".into() })?;
    let class = program.class(class_name).ok_or_else(|| EmitError::UnknownClass(class_name.to_string()))?;

    writeln!(output)?;
    writeln!(output, "main:")?;
    writeln!(output, "    stmfd sp!, {{fp, lr}}")?;
    writeln!(output, "    mov fp, sp")?;
    load_immediate(output, "a1", class.size() as i32)?;
    writeln!(output, "    bl malloc")?;

    let stacked = entry.formals.len().saturating_sub(ARG_REGISTERS.len());
    if stacked > 0 {
        writeln!(output, "    mov ip, #0")?;
        for _ in 0..stacked {
            writeln!(output, "    str ip, [sp, #-4]!")?;
        }
    }
    for reg in ARG_REGISTERS.iter().take(entry.formals.len()).skip(1) {
        writeln!(output, "    mov {}, #0", reg)?;
    }

    writeln!(output, "    bl {}", entry.name)?;
    writeln!(output, "    mov a1, #0")?;
    writeln!(output, "    mov sp, fp")?;
    writeln!(output, "    ldmfd sp!, {{fp, pc}}")?;
    Ok(())
}

fn load_immediate(out: &mut String, reg: &str, value: i32) -> Result<(), EmitError> {
    if (0..=255).contains(&value) {
        writeln!(out, "    mov {}, #{}", reg, value)?;
    } else {
        writeln!(out, "    ldr {}, ={}", reg, value)?;
    }
    Ok(())
}

struct MethodEmitter<'a> {
    program: &'a Program3,
    literals: &'a Literals,
    method: &'a Method3,
    allocation: &'a Allocation,
    layout: FrameLayout,
    symbols: BTreeSet<String>,
    types: BTreeMap<String, Type>,
    // Class of `this`
    class: &'a ClassData,
    exit: String,
}

impl<'a> MethodEmitter<'a> {
    fn new(
        program: &'a Program3,
        literals: &'a Literals,
        method: &'a Method3,
        allocation: &'a Allocation,
    ) -> Result<Self, EmitError> {
        let class_name = method
            .formals
            .first()
            .and_then(|f| f.ty.class_name())
            .ok_or_else(|| EmitError::UnknownVariable { method: method.name.clone(), name: "this".into() })?;
        let class = program.class(class_name).ok_or_else(|| EmitError::UnknownClass(class_name.to_string()))?;

        Ok(Self {
            program,
            literals,
            method,
            allocation,
            layout: FrameLayout::new(method),
            symbols: method.symbols(),
            types: method.var_types(),
            class,
            exit: format!("{}_exit", method.name),
        })
    }

    fn unsupported(&self, detail: impl Into<String>) -> EmitError {
        EmitError::Unsupported { method: self.method.name.clone(), detail: detail.into() }
    }

    fn field_offset(&self, class: &ClassData, field: &str) -> Result<u32, EmitError> {
        class.field(field).map(|f| f.offset).ok_or_else(|| EmitError::UnknownField {
            class: class.name.clone(),
            field: field.to_string(),
        })
    }

    fn class_of(&self, object: &str) -> Result<&'a ClassData, EmitError> {
        let name = self
            .types
            .get(object)
            .and_then(|ty| ty.class_name())
            .ok_or_else(|| self.unsupported(format!("field access through non-object '{}'", object)))?;
        self.program.class(name).ok_or_else(|| EmitError::UnknownClass(name.to_string()))
    }

    fn slot(&self, name: &str) -> Result<u32, EmitError> {
        self.layout.offset(name).ok_or_else(|| EmitError::UnknownVariable {
            method: self.method.name.clone(),
            name: name.to_string(),
        })
    }

    fn location(&self, name: &str) -> Location {
        self.allocation.get(name).copied().unwrap_or(Location::Memory)
    }

    /// Static type of an operand; names outside the method are fields of `this`.
    fn operand_type(&self, operand: &Operand) -> Result<Type, EmitError> {
        match operand {
            Operand::Int(_) => Ok(Type::Int),
            Operand::Bool(_) => Ok(Type::Bool),
            Operand::Str(_) => Ok(Type::String),
            Operand::Null => Ok(Type::Null),
            Operand::Var(name) => self.var_type(name),
        }
    }

    fn var_type(&self, name: &str) -> Result<Type, EmitError> {
        if self.symbols.contains(name) {
            self.types.get(name).cloned().ok_or_else(|| EmitError::UnknownVariable {
                method: self.method.name.clone(),
                name: name.to_string(),
            })
        } else {
            self.class.field(name).map(|f| f.ty.clone()).ok_or_else(|| EmitError::UnknownField {
                class: self.class.name.clone(),
                field: name.to_string(),
            })
        }
    }

    /// Loads a variable into `reg`. Implicit fields go through `ip`.
    fn load_var(&self, out: &mut String, reg: &str, name: &str) -> Result<(), EmitError> {
        if self.symbols.contains(name) {
            match self.location(name).register() {
                Some(home) => writeln!(out, "    mov {}, {}", reg, home)?,
                None => writeln!(out, "    ldr {}, [fp, #-{}]", reg, self.slot(name)?)?,
            }
        } else {
            let offset = self.field_offset(self.class, name)?;
            self.load_var(out, "ip", "this")?;
            writeln!(out, "    ldr {}, [ip, #{}]", reg, offset)?;
        }
        Ok(())
    }

    fn store_var(&self, out: &mut String, reg: &str, name: &str) -> Result<(), EmitError> {
        if self.symbols.contains(name) {
            match self.location(name).register() {
                Some(home) => writeln!(out, "    mov {}, {}", home, reg)?,
                None => writeln!(out, "    str {}, [fp, #-{}]", reg, self.slot(name)?)?,
            }
        } else {
            let offset = self.field_offset(self.class, name)?;
            self.load_var(out, "ip", "this")?;
            writeln!(out, "    str {}, [ip, #{}]", reg, offset)?;
        }
        Ok(())
    }

    fn load(&self, out: &mut String, reg: &str, operand: &Operand) -> Result<(), EmitError> {
        match operand {
            Operand::Int(value) => load_immediate(out, reg, *value),
            Operand::Bool(value) => load_immediate(out, reg, *value as i32),
            Operand::Null => load_immediate(out, reg, 0),
            Operand::Str(text) => {
                writeln!(out, "    ldr {}, ={}", reg, self.literals.label(text)?)?;
                Ok(())
            }
            Operand::Var(name) => self.load_var(out, reg, name),
        }
    }

    /// `bl` to a library routine with the scratch pair saved around it.
    fn call_library(&self, out: &mut String, routine: &str) -> Result<(), EmitError> {
        writeln!(out, "    stmfd sp!, {{v6, v7}}")?;
        writeln!(out, "    bl {}", routine)?;
        writeln!(out, "    ldmfd sp!, {{v6, v7}}")?;
        Ok(())
    }

    fn adjust_sp(&self, out: &mut String, op: &str, bytes: u32) -> Result<(), EmitError> {
        if bytes == 0 {
            return Ok(());
        }
        if bytes <= 255 {
            writeln!(out, "    {} sp, sp, #{}", op, bytes)?;
        } else {
            writeln!(out, "    ldr ip, ={}", bytes)?;
            writeln!(out, "    {} sp, sp, ip", op)?;
        }
        Ok(())
    }

    fn emit(&self, out: &mut String) -> Result<(), EmitError> {
        writeln!(out, "{}:", self.method.name)?;
        writeln!(out, "    stmfd sp!, {{fp, lr, v1, v2, v3, v4, v5}}")?;
        writeln!(out, "    mov fp, sp")?;
        self.adjust_sp(out, "sub", self.layout.size())?;

        // Argument registers are free for scratch use once every formal is home
        for (i, formal) in self.method.formals.iter().enumerate() {
            match ARG_REGISTERS.get(i) {
                Some(reg) => self.store_var(out, reg, &formal.name)?,
                None => {
                    let offset = SAVED_BYTES + (i as u32 - 4) * WORD_SIZE;
                    writeln!(out, "    ldr a1, [fp, #{}]", offset)?;
                    self.store_var(out, "a1", &formal.name)?;
                }
            }
        }

        for stmt in &self.method.body.statements {
            self.statement(out, stmt)?;
        }

        writeln!(out, "{}:", self.exit)?;
        writeln!(out, "    mov sp, fp")?;
        writeln!(out, "    ldmfd sp!, {{v1, v2, v3, v4, v5, fp, pc}}")?;
        Ok(())
    }

    fn statement(&self, out: &mut String, stmt: &Stmt3) -> Result<(), EmitError> {
        match stmt {
            Stmt3::Label(label) => writeln!(out, ".{}:", label)?,

            Stmt3::Goto(label) => writeln!(out, "    b .{}", label)?,

            Stmt3::IfGoto { cond, label } => {
                self.load(out, "a1", cond)?;
                writeln!(out, "    cmp a1, #0")?;
                writeln!(out, "    bne .{}", label)?;
            }

            Stmt3::Readln(name) => {
                let ty = self.var_type(name)?;
                if !matches!(ty, Type::Int | Type::Bool) {
                    return Err(self.unsupported(format!("readln into {} '{}'", ty, name)));
                }
                writeln!(out, "    ldr a1, ={}", READ_INT)?;
                writeln!(out, "    ldr a2, ={}", READ_BUFFER)?;
                self.call_library(out, "scanf")?;
                writeln!(out, "    ldr a1, ={}", READ_BUFFER)?;
                writeln!(out, "    ldr a1, [a1]")?;
                if ty == Type::Bool {
                    writeln!(out, "    cmp a1, #0")?;
                    writeln!(out, "    movne a1, #1")?;
                }
                self.store_var(out, "a1", name)?;
            }

            Stmt3::Println(value) => {
                let format = match self.operand_type(value)? {
                    Type::Int | Type::Bool => PRINT_INT,
                    Type::String => PRINT_STR,
                    other => return Err(self.unsupported(format!("println of {} '{}'", other, value))),
                };
                self.load(out, "a2", value)?;
                writeln!(out, "    ldr a1, ={}", format)?;
                self.call_library(out, "printf")?;
            }

            Stmt3::Return(value) => {
                if let Some(value) = value {
                    self.load(out, "a1", value)?;
                }
                writeln!(out, "    b {}", self.exit)?;
            }

            Stmt3::Assign { dest: Place::Var(name), src } => {
                self.load(out, "a1", src)?;
                self.store_var(out, "a1", name)?;
            }

            Stmt3::Assign { dest: Place::Field { object, field }, src } => {
                let offset = self.field_offset(self.class_of(object)?, field)?;
                self.load(out, "a1", src)?;
                self.load_var(out, "a2", object)?;
                writeln!(out, "    str a1, [a2, #{}]", offset)?;
            }

            Stmt3::TypeAssign { dest, value, .. } => {
                self.load(out, "a1", value)?;
                self.store_var(out, "a1", dest)?;
            }

            Stmt3::TypeAssignNew { dest, class, .. } => {
                let layout = self.program.class(class).ok_or_else(|| EmitError::UnknownClass(class.clone()))?;
                load_immediate(out, "a1", layout.size() as i32)?;
                self.call_library(out, "malloc")?;
                self.store_var(out, "a1", dest)?;
            }

            Stmt3::TypeAssignCall { dest, target, args, .. } => self.call(out, dest, target, args)?,

            Stmt3::TypeAssignFieldRead { dest, object, field, .. } => {
                let offset = self.field_offset(self.class_of(object)?, field)?;
                self.load_var(out, "a1", object)?;
                writeln!(out, "    ldr a1, [a1, #{}]", offset)?;
                self.store_var(out, "a1", dest)?;
            }

            Stmt3::BinaryOp { dest, lhs, op, rhs, .. } => self.binary(out, dest, lhs, *op, rhs)?,

            Stmt3::UnaryOp { dest, op, operand } => {
                self.load(out, "a1", operand)?;
                match op {
                    UnaryOp::Neg => writeln!(out, "    rsb a1, a1, #0")?,
                    UnaryOp::Not => writeln!(out, "    eor a1, a1, #1")?,
                }
                self.store_var(out, "a1", dest)?;
            }
        }
        Ok(())
    }

    fn call(&self, out: &mut String, dest: &str, target: &str, args: &[Operand]) -> Result<(), EmitError> {
        writeln!(out, "    stmfd sp!, {{v6, v7}}")?;

        // Arguments past the fourth go on the stack, last one pushed first
        let stacked = args.get(ARG_REGISTERS.len()..).unwrap_or_default();
        for arg in stacked.iter().rev() {
            self.load(out, "ip", arg)?;
            writeln!(out, "    str ip, [sp, #-4]!")?;
        }
        for (reg, arg) in ARG_REGISTERS.iter().zip(args) {
            self.load(out, reg, arg)?;
        }

        writeln!(out, "    bl {}", target)?;
        self.adjust_sp(out, "add", stacked.len() as u32 * WORD_SIZE)?;
        writeln!(out, "    ldmfd sp!, {{v6, v7}}")?;
        self.store_var(out, "a1", dest)
    }

    fn binary(
        &self,
        out: &mut String,
        dest: &str,
        lhs: &Operand,
        op: BinaryOp,
        rhs: &Operand,
    ) -> Result<(), EmitError> {
        let (left, right) = (self.operand_type(lhs)?, self.operand_type(rhs)?);
        if left == Type::String || right == Type::String {
            return Err(self.unsupported(format!("string operation {} {} {}", lhs, op, rhs)));
        }

        self.load(out, "a1", lhs)?;
        self.load(out, "a2", rhs)?;
        match op {
            BinaryOp::Add => writeln!(out, "    add a3, a1, a2")?,
            BinaryOp::Sub => writeln!(out, "    sub a3, a1, a2")?,
            BinaryOp::Mul => writeln!(out, "    mul a3, a1, a2")?,
            BinaryOp::Div => {
                self.call_library(out, "__aeabi_idiv")?;
                writeln!(out, "    mov a3, a1")?;
            }
            BinaryOp::And => writeln!(out, "    and a3, a1, a2")?,
            BinaryOp::Or => writeln!(out, "    orr a3, a1, a2")?,
            BinaryOp::Lt => self.compare(out, "lt", "ge")?,
            BinaryOp::Le => self.compare(out, "le", "gt")?,
            BinaryOp::Gt => self.compare(out, "gt", "le")?,
            BinaryOp::Ge => self.compare(out, "ge", "lt")?,
            BinaryOp::Eq => self.compare(out, "eq", "ne")?,
            BinaryOp::Ne => self.compare(out, "ne", "eq")?,
        }
        self.store_var(out, "a3", dest)
    }

    /// `a3 = a1 <rel> a2`, where `taken` is the condition code for the
    /// relation and `otherwise` its inverse.
    fn compare(&self, out: &mut String, taken: &str, otherwise: &str) -> Result<(), EmitError> {
        writeln!(out, "    subs a4, a1, a2")?;
        writeln!(out, "    mov{} a3, #1", taken)?;
        writeln!(out, "    mov{} a3, #0", otherwise)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::regalloc;
    use crate::ir::{Block3, VarDecl3};

    fn program_with(method: Method3, strings: Vec<String>) -> Program3 {
        Program3 {
            classes: vec![ClassData::new("Main", vec![(Type::Int, "count".to_string())])],
            methods: vec![method],
            strings,
            entry: "Main_main".into(),
        }
    }

    fn main_method(locals: Vec<VarDecl3>, statements: Vec<Stmt3>) -> Method3 {
        Method3 {
            return_type: Type::Void,
            name: "Main_main".into(),
            formals: vec![VarDecl3::new(Type::Class("Main".into()), "this")],
            body: Block3 { locals, statements },
        }
    }

    fn emit(program: &Program3) -> Result<String, EmitError> {
        let methods: Vec<(&Method3, Allocation)> =
            program.methods.iter().map(|m| (m, regalloc::allocate(m))).collect();
        generate_program(program, &methods)
    }

    #[test]
    fn test_data_section_and_header() {
        let method = main_method(
            Vec::new(),
            vec![
                Stmt3::Println(Operand::Str("hi".into())),
                Stmt3::Println(Operand::Str("hi".into())),
                Stmt3::Println(Operand::Str("bye\\n".into())),
            ],
        );
        let program = program_with(method, vec!["hi".into(), "hi".into(), "bye\\n".into()]);
        let asm = emit(&program).expect("emit");

        assert!(asm.starts_with("    .data\nLC0:\n    .asciz \"%d\\n\"\n"));
        assert!(asm.contains("LC4:\n    .asciz \"hi\"\n"));
        assert!(asm.contains("LC5:\n    .asciz \"bye\\n\"\n"));
        assert!(!asm.contains("LC6:"));
        assert!(asm.contains("    .global main\n"));
        assert!(asm.contains("Main_main:\n    stmfd sp!, {fp, lr, v1, v2, v3, v4, v5}\n    mov fp, sp\n"));
        assert!(asm.contains("    ldr a2, =LC4\n    ldr a1, =LC1\n"));
        assert!(asm.ends_with("    ldmfd sp!, {v1, v2, v3, v4, v5, fp, pc}\n"));
    }

    #[test]
    fn test_relational_and_logical_templates() {
        let method = main_method(
            vec![VarDecl3::new(Type::Int, "x")],
            vec![
                Stmt3::Readln("x".into()),
                Stmt3::BinaryOp {
                    ty: Type::Bool,
                    dest: "_v0".into(),
                    lhs: Operand::var("x"),
                    op: BinaryOp::Ge,
                    rhs: Operand::Int(1000),
                },
                Stmt3::UnaryOp { dest: "_v0".into(), op: UnaryOp::Not, operand: Operand::var("_v0") },
                Stmt3::Println(Operand::var("_v0")),
            ],
        );
        let asm = emit(&program_with(method, Vec::new())).expect("emit");

        assert!(asm.contains("    ldr a2, =1000\n"));
        assert!(asm.contains("    subs a4, a1, a2\n    movge a3, #1\n    movlt a3, #0\n"));
        assert!(asm.contains("    eor a1, a1, #1\n"));
        assert!(asm.contains("    bl scanf\n"));
        // Int input is stored as read
        assert!(!asm.contains("movne a1, #1"));
    }

    #[test]
    fn test_every_relation_has_its_own_condition() {
        let cases = [
            (BinaryOp::Lt, "lt", "ge"),
            (BinaryOp::Le, "le", "gt"),
            (BinaryOp::Gt, "gt", "le"),
            (BinaryOp::Ge, "ge", "lt"),
            (BinaryOp::Eq, "eq", "ne"),
            (BinaryOp::Ne, "ne", "eq"),
        ];
        for (op, taken, otherwise) in cases {
            let method = main_method(
                Vec::new(),
                vec![Stmt3::BinaryOp {
                    ty: Type::Bool,
                    dest: "_v0".into(),
                    lhs: Operand::Int(1),
                    op,
                    rhs: Operand::Int(2),
                }],
            );
            let asm = emit(&program_with(method, Vec::new())).expect("emit");
            let expected = format!("    mov{} a3, #1\n    mov{} a3, #0\n", taken, otherwise);
            assert!(asm.contains(&expected), "{}: {}", op, asm);
        }
    }

    #[test]
    fn test_readln_normalises_booleans() {
        let method = main_method(vec![VarDecl3::new(Type::Bool, "b")], vec![Stmt3::Readln("b".into())]);
        let asm = emit(&program_with(method, Vec::new())).expect("emit");
        assert!(asm.contains("    ldr a1, [a1]\n    cmp a1, #0\n    movne a1, #1\n"), "{}", asm);
    }

    #[test]
    fn test_entry_stub_allocates_the_main_object() {
        let mut method = main_method(Vec::new(), vec![Stmt3::Return(None)]);
        method.formals.push(VarDecl3::new(Type::Int, "argc"));
        let asm = emit(&program_with(method, Vec::new())).expect("emit");

        let expected = "main:\n\
                        \x20   stmfd sp!, {fp, lr}\n\
                        \x20   mov fp, sp\n\
                        \x20   mov a1, #4\n\
                        \x20   bl malloc\n\
                        \x20   mov a2, #0\n\
                        \x20   bl Main_main\n\
                        \x20   mov a1, #0\n\
                        \x20   mov sp, fp\n\
                        \x20   ldmfd sp!, {fp, pc}\n";
        assert!(asm.contains(expected), "{}", asm);
        assert_eq!(asm.matches("\nmain:\n").count(), 1);
    }

    #[test]
    fn test_implicit_fields_use_positive_offsets() {
        let method = main_method(
            Vec::new(),
            vec![
                Stmt3::Assign { dest: Place::Var("count".into()), src: Operand::Int(3) },
                Stmt3::TypeAssign { ty: Type::Int, dest: "_v0".into(), value: Operand::var("count") },
                Stmt3::Println(Operand::var("_v0")),
            ],
        );
        let asm = emit(&program_with(method, Vec::new())).expect("emit");
        assert!(asm.contains("    str a1, [ip, #0]\n"));
        assert!(asm.contains("    ldr a1, [ip, #0]\n"));
        assert!(!asm.contains("[ip, #-"));
    }

    #[test]
    fn test_stack_arguments_and_scratch_pair() {
        let args: Vec<Operand> = std::iter::once(Operand::var("this")).chain((1..=5).map(Operand::Int)).collect();
        let method = main_method(
            Vec::new(),
            vec![Stmt3::TypeAssignCall {
                ty: Type::Int,
                dest: "_v0".into(),
                target: "Main_f_Int_Int_Int_Int_Int".into(),
                args,
            }],
        );
        let asm = emit(&program_with(method, Vec::new())).expect("emit");

        // Arguments 5 and 4 are pushed, in that order, before the registers are loaded
        let expected = "    stmfd sp!, {v6, v7}\n\
                        \x20   mov ip, #5\n\
                        \x20   str ip, [sp, #-4]!\n\
                        \x20   mov ip, #4\n\
                        \x20   str ip, [sp, #-4]!\n";
        assert!(asm.contains(expected), "{}", asm);
        assert!(asm.contains("    bl Main_f_Int_Int_Int_Int_Int\n    add sp, sp, #8\n    ldmfd sp!, {v6, v7}\n"));
    }

    #[test]
    fn test_formals_beyond_the_fourth_come_from_the_caller_frame() {
        let mut method = main_method(Vec::new(), vec![Stmt3::Return(Some(Operand::var("e")))]);
        method.name = "Main_f_Int_Int_Int_Int_Int".into();
        for name in ["a", "b", "c", "d", "e"] {
            method.formals.push(VarDecl3::new(Type::Int, name));
        }
        let mut program = program_with(method, Vec::new());
        program.methods.push(main_method(Vec::new(), Vec::new()));

        let asm = emit(&program).expect("emit");
        assert!(asm.contains("    ldr a1, [fp, #28]\n"));
        assert!(asm.contains("    ldr a1, [fp, #32]\n"));
        assert!(asm.contains("Main_f_Int_Int_Int_Int_Int:\n    stmfd"));
    }

    #[test]
    fn test_spill_slots_are_stable_and_distinct() {
        let names: Vec<String> = (0..10).map(|i| format!("x{}", i)).collect();
        let mut statements: Vec<Stmt3> = names
            .iter()
            .enumerate()
            .map(|(i, n)| Stmt3::TypeAssign { ty: Type::Int, dest: n.clone(), value: Operand::Int(i as i32) })
            .collect();
        statements.extend(names.iter().map(|n| Stmt3::Println(Operand::var(n.as_str()))));
        let method = main_method(Vec::new(), statements);

        let allocation = regalloc::allocate(&method);
        let layout = FrameLayout::new(&method);
        let spilled: Vec<&String> =
            allocation.iter().filter(|(_, l)| **l == Location::Memory).map(|(n, _)| n).collect();
        assert!(!spilled.is_empty());

        let offsets: BTreeSet<u32> = names.iter().filter_map(|n| layout.offset(n)).collect();
        assert_eq!(offsets.len(), names.len());
        assert!(offsets.iter().all(|o| o % 4 == 0 && *o > 0 && *o <= layout.size()));

        let program = program_with(method.clone(), Vec::new());
        let asm = emit(&program).expect("emit");
        for name in spilled {
            let slot = format!("[fp, #-{}]", layout.offset(name).expect("slot"));
            // One store for the definition, one load for the print
            assert_eq!(asm.matches(&slot).count(), 2, "{} at {}", name, slot);
        }
    }

    #[test]
    fn test_string_arithmetic_is_rejected() {
        let method = main_method(
            vec![VarDecl3::new(Type::String, "s")],
            vec![Stmt3::BinaryOp {
                ty: Type::String,
                dest: "_v0".into(),
                lhs: Operand::var("s"),
                op: BinaryOp::Add,
                rhs: Operand::Str("x".into()),
            }],
        );
        let err = emit(&program_with(method, vec!["x".into()])).expect_err("should fail");
        assert!(matches!(err, EmitError::Unsupported { .. }));

        let method = main_method(Vec::new(), vec![Stmt3::Println(Operand::Null)]);
        assert!(emit(&program_with(method, Vec::new())).is_err());
    }
}
