use crate::ir::optimize::fold;
use crate::ir::{BinaryOp, Method3, Operand, Place, Program3, Stmt3, Type, UnaryOp, WORD_SIZE};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::rc::Rc;
use std::str::SplitWhitespace;
use thiserror::Error;

const MAX_DEPTH: usize = 4096;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InterpError {
    #[error("call to unknown method '{0}'")]
    UnknownMethod(String),

    #[error("unknown class '{0}'")]
    UnknownClass(String),

    #[error("class '{class}' has no field '{field}'")]
    UnknownField { class: String, field: String },

    #[error("jump to undefined label '{0}'")]
    UnknownLabel(String),

    #[error("null dereference accessing field '{0}'")]
    NullDereference(String),

    #[error("division by zero")]
    DivisionByZero,

    #[error("readln: input exhausted")]
    InputExhausted,

    #[error("readln: '{0}' is not an integer")]
    BadInput(String),

    #[error("cannot apply '{op}' to {operands}")]
    BadOperands { op: String, operands: String },

    #[error("call depth exceeded {0}")]
    StackOverflow(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i32),
    Bool(bool),
    // Raw literal text, escapes still in place
    Str(String),
    Null,
    Object(usize),
}

impl Value {
    fn default_for(ty: Option<&Type>) -> Self {
        match ty {
            Some(Type::Int) => Value::Int(0),
            Some(Type::Bool) => Value::Bool(false),
            _ => Value::Null,
        }
    }

    fn truthy(&self) -> bool {
        match self {
            Value::Int(n) => *n != 0,
            Value::Bool(b) => *b,
            Value::Null => false,
            Value::Str(_) | Value::Object(_) => true,
        }
    }

    fn as_literal(&self) -> Option<Operand> {
        match self {
            Value::Int(n) => Some(Operand::Int(*n)),
            Value::Bool(b) => Some(Operand::Bool(*b)),
            Value::Str(s) => Some(Operand::Str(s.clone())),
            _ => None,
        }
    }

    /// What the compiled program prints for this value: booleans go
    /// through the integer format.
    pub fn render(&self) -> String {
        match self {
            Value::Int(n) => n.to_string(),
            Value::Bool(b) => (*b as i32).to_string(),
            Value::Str(s) => unescape(s),
            Value::Null => "(null)".to_string(),
            Value::Object(id) => format!("<object {}>", id),
        }
    }
}

impl From<&Operand> for Value {
    fn from(literal: &Operand) -> Self {
        match literal {
            Operand::Int(n) => Value::Int(*n),
            Operand::Bool(b) => Value::Bool(*b),
            Operand::Str(s) => Value::Str(s.clone()),
            Operand::Null | Operand::Var(_) => Value::Null,
        }
    }
}

/// Resolves the escape sequences the assembler understands in `.asciz`.
pub fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some('"') => out.push('"'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

struct Object {
    class: String,
    fields: Vec<Value>,
}

/// A method prepared for execution.
struct Routine<'p> {
    method: &'p Method3,
    symbols: BTreeSet<String>,
    types: BTreeMap<String, Type>,
    labels: HashMap<&'p str, usize>,
}

impl<'p> Routine<'p> {
    fn new(method: &'p Method3) -> Self {
        let labels = method
            .body
            .statements
            .iter()
            .enumerate()
            .filter_map(|(i, s)| match s {
                Stmt3::Label(label) => Some((label.as_str(), i)),
                _ => None,
            })
            .collect();
        Self { method, symbols: method.symbols(), types: method.var_types(), labels }
    }

    fn jump(&self, label: &str) -> Result<usize, InterpError> {
        self.labels.get(label).copied().ok_or_else(|| InterpError::UnknownLabel(label.to_string()))
    }
}

type Frame = HashMap<String, Value>;

struct Machine<'p, 'i> {
    program: &'p Program3,
    routines: HashMap<&'p str, Rc<Routine<'p>>>,
    heap: Vec<Object>,
    input: SplitWhitespace<'i>,
    output: Vec<String>,
    depth: usize,
}

/// Executes the program entry point, feeding `readln` from the
/// whitespace-separated integers in `input`. Returns one entry per `println`.
pub fn run(program: &Program3, input: &str) -> Result<Vec<String>, InterpError> {
    let mut machine = Machine {
        program,
        routines: program.methods.iter().map(|m| (m.name.as_str(), Rc::new(Routine::new(m)))).collect(),
        heap: Vec::new(),
        input: input.split_whitespace(),
        output: Vec::new(),
        depth: 0,
    };

    let entry = program
        .method(&program.entry)
        .ok_or_else(|| InterpError::UnknownMethod(program.entry.clone()))?;
    let this = match entry.formals.first().and_then(|f| f.ty.class_name()) {
        Some(class) => machine.allocate(class)?,
        None => Value::Null,
    };
    let mut args = vec![this];
    args.extend(entry.formals.iter().skip(1).map(|f| Value::default_for(Some(&f.ty))));

    machine.call(&program.entry, args)?;
    log::debug!("interpreted {}: {} lines printed", program.entry, machine.output.len());
    Ok(machine.output)
}

impl<'p, 'i> Machine<'p, 'i> {
    fn allocate(&mut self, class: &str) -> Result<Value, InterpError> {
        let layout = self.program.class(class).ok_or_else(|| InterpError::UnknownClass(class.to_string()))?;
        let fields = layout.fields.iter().map(|f| Value::default_for(Some(&f.ty))).collect();
        self.heap.push(Object { class: class.to_string(), fields });
        Ok(Value::Object(self.heap.len() - 1))
    }

    fn slot(&self, object: &Value, field: &str) -> Result<(usize, usize, Type), InterpError> {
        let Value::Object(id) = object else {
            return Err(InterpError::NullDereference(field.to_string()));
        };
        let class = &self.heap[*id].class;
        let slot = self
            .program
            .class(class)
            .and_then(|c| c.field(field))
            .ok_or_else(|| InterpError::UnknownField { class: class.clone(), field: field.to_string() })?;
        Ok((*id, (slot.offset / WORD_SIZE) as usize, slot.ty.clone()))
    }

    fn read_field(&self, object: &Value, field: &str) -> Result<Value, InterpError> {
        let (id, index, _) = self.slot(object, field)?;
        Ok(self.heap[id].fields[index].clone())
    }

    fn write_field(&mut self, object: &Value, field: &str, value: Value) -> Result<(), InterpError> {
        let (id, index, _) = self.slot(object, field)?;
        self.heap[id].fields[index] = value;
        Ok(())
    }

    fn this(frame: &Frame) -> Value {
        frame.get("this").cloned().unwrap_or(Value::Null)
    }

    fn load(&self, routine: &Routine, frame: &Frame, name: &str) -> Result<Value, InterpError> {
        if routine.symbols.contains(name) {
            Ok(frame.get(name).cloned().unwrap_or_else(|| Value::default_for(routine.types.get(name))))
        } else {
            self.read_field(&Self::this(frame), name)
        }
    }

    fn store(
        &mut self,
        routine: &Routine,
        frame: &mut Frame,
        name: &str,
        value: Value,
    ) -> Result<(), InterpError> {
        if routine.symbols.contains(name) {
            frame.insert(name.to_string(), value);
            Ok(())
        } else {
            self.write_field(&Self::this(frame), name, value)
        }
    }

    fn operand(&self, routine: &Routine, frame: &Frame, operand: &Operand) -> Result<Value, InterpError> {
        match operand {
            Operand::Var(name) => self.load(routine, frame, name),
            literal => Ok(Value::from(literal)),
        }
    }

    fn readln(&mut self, ty: &Type) -> Result<Value, InterpError> {
        let word = self.input.next().ok_or(InterpError::InputExhausted)?;
        let n: i32 = word.parse().map_err(|_| InterpError::BadInput(word.to_string()))?;
        Ok(match ty {
            Type::Bool => Value::Bool(n != 0),
            _ => Value::Int(n),
        })
    }

    fn call(&mut self, target: &str, args: Vec<Value>) -> Result<Value, InterpError> {
        if self.depth >= MAX_DEPTH {
            return Err(InterpError::StackOverflow(MAX_DEPTH));
        }
        let routine = self
            .routines
            .get(target)
            .cloned()
            .ok_or_else(|| InterpError::UnknownMethod(target.to_string()))?;

        let mut frame: Frame =
            routine.method.formals.iter().map(|f| f.name.clone()).zip(args).collect();

        self.depth += 1;
        let result = self.execute(&routine, &mut frame);
        self.depth -= 1;
        result
    }

    fn execute(&mut self, routine: &Routine, frame: &mut Frame) -> Result<Value, InterpError> {
        let statements = &routine.method.body.statements;
        let mut pc = 0;

        while let Some(stmt) = statements.get(pc) {
            pc += 1;
            match stmt {
                Stmt3::Label(_) => {}

                Stmt3::Goto(label) => pc = routine.jump(label)?,

                Stmt3::IfGoto { cond, label } => {
                    if self.operand(routine, frame, cond)?.truthy() {
                        pc = routine.jump(label)?;
                    }
                }

                Stmt3::Readln(name) => {
                    let ty = match routine.types.get(name) {
                        Some(ty) if routine.symbols.contains(name) => ty.clone(),
                        _ => self.slot(&Self::this(frame), name)?.2,
                    };
                    let value = self.readln(&ty)?;
                    self.store(routine, frame, name, value)?;
                }

                Stmt3::Println(value) => {
                    let value = self.operand(routine, frame, value)?;
                    self.output.push(value.render());
                }

                Stmt3::Return(None) => return Ok(Value::Null),

                Stmt3::Return(Some(value)) => return self.operand(routine, frame, value),

                Stmt3::Assign { dest: Place::Var(name), src } => {
                    let value = self.operand(routine, frame, src)?;
                    self.store(routine, frame, name, value)?;
                }

                Stmt3::Assign { dest: Place::Field { object, field }, src } => {
                    let object = self.load(routine, frame, object)?;
                    let value = self.operand(routine, frame, src)?;
                    self.write_field(&object, field, value)?;
                }

                Stmt3::TypeAssign { dest, value, .. } => {
                    let value = self.operand(routine, frame, value)?;
                    frame.insert(dest.clone(), value);
                }

                Stmt3::TypeAssignNew { dest, class, .. } => {
                    let value = self.allocate(class)?;
                    frame.insert(dest.clone(), value);
                }

                Stmt3::TypeAssignCall { dest, target, args, .. } => {
                    let args = args
                        .iter()
                        .map(|a| self.operand(routine, frame, a))
                        .collect::<Result<Vec<_>, _>>()?;
                    let value = self.call(target, args)?;
                    frame.insert(dest.clone(), value);
                }

                Stmt3::TypeAssignFieldRead { dest, object, field, .. } => {
                    let object = self.load(routine, frame, object)?;
                    let value = self.read_field(&object, field)?;
                    frame.insert(dest.clone(), value);
                }

                Stmt3::BinaryOp { dest, lhs, op, rhs, .. } => {
                    let lhs = self.operand(routine, frame, lhs)?;
                    let rhs = self.operand(routine, frame, rhs)?;
                    frame.insert(dest.clone(), binary(*op, &lhs, &rhs)?);
                }

                Stmt3::UnaryOp { dest, op, operand } => {
                    let value = match (op, self.operand(routine, frame, operand)?) {
                        (UnaryOp::Neg, Value::Int(n)) => Value::Int(n.wrapping_neg()),
                        (UnaryOp::Not, Value::Bool(b)) => Value::Bool(!b),
                        (op, other) => {
                            return Err(InterpError::BadOperands {
                                op: op.to_string(),
                                operands: format!("{:?}", other),
                            })
                        }
                    };
                    frame.insert(dest.clone(), value);
                }
            }
        }

        Ok(Value::Null)
    }
}

fn binary(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value, InterpError> {
    if op == BinaryOp::Div && *rhs == Value::Int(0) {
        return Err(InterpError::DivisionByZero);
    }
    lhs.as_literal()
        .zip(rhs.as_literal())
        .and_then(|(l, r)| fold(&l, op, &r))
        .map(|v| Value::from(&v))
        .ok_or_else(|| InterpError::BadOperands {
            op: op.to_string(),
            operands: format!("{:?} and {:?}", lhs, rhs),
        })
}
