use crate::frontend::ast::{
    self, BinaryOp, Callee, Expr, ExprKind, MethodSig, Statement, Type, UnaryOp, VarDecl,
};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SemanticError {
    #[error("Duplicate class '{0}'")]
    DuplicateClass(String),

    #[error("Duplicate field '{field}' in class '{class}'")]
    DuplicateField { class: String, field: String },

    #[error("Duplicate method '{signature}' in class '{class}'")]
    DuplicateMethod { class: String, signature: String },

    #[error("Duplicate variable '{name}' in method '{method}'")]
    DuplicateVariable { method: String, name: String },

    #[error("Unknown type '{ty}' in '{context}'")]
    UnknownType { ty: String, context: String },

    #[error("Undefined variable '{name}' in method '{method}'")]
    UndefinedVariable { method: String, name: String },

    #[error("Class '{class}' has no field '{field}'")]
    UndefinedField { class: String, field: String },

    #[error("Class '{class}' has no method '{name}({args})'")]
    UndefinedMethod { class: String, name: String, args: String },

    #[error("Call '{name}({args})' on class '{class}' is ambiguous")]
    AmbiguousCall { class: String, name: String, args: String },

    #[error("Type mismatch in method '{method}': {context} expects {expected}, found {found}")]
    TypeMismatch { method: String, context: String, expected: String, found: Type },

    #[error("Type '{ty}' in method '{method}' is not an object")]
    NotAnObject { method: String, ty: Type },

    #[error("Main class '{0}' must declare 'Void main(...)'")]
    MissingMain(String),
}

struct ClassInfo {
    fields: Vec<VarDecl>,
    methods: Vec<MethodSig>,
}

impl ClassInfo {
    fn field(&self, name: &str) -> Option<&Type> {
        self.fields.iter().find(|f| f.name == name).map(|f| &f.ty)
    }
}

type ClassTable = HashMap<String, ClassInfo>;

/// Type checks `program`, annotating every expression with its type and
/// every call with the overload it resolves to.
pub fn check(program: &mut ast::Program) -> Result<(), Vec<SemanticError>> {
    let mut errors = Vec::new();
    let classes = collect_classes(program, &mut errors);

    let main = &program.main_class;
    if !main.methods.iter().any(|m| m.name == "main" && m.return_type == Type::Void) {
        errors.push(SemanticError::MissingMain(main.name.clone()));
    }

    for class in program.all_classes_mut() {
        for method in class.methods.iter_mut() {
            check_method(&classes, &class.name, method, &mut errors);
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn is_known(classes: &ClassTable, ty: &Type) -> bool {
    match ty {
        Type::Class(name) => classes.contains_key(name),
        Type::Null => false,
        _ => true,
    }
}

fn require_known(
    classes: &ClassTable,
    ty: &Type,
    context: impl FnOnce() -> String,
    errors: &mut Vec<SemanticError>,
) {
    if !is_known(classes, ty) {
        errors.push(SemanticError::UnknownType { ty: ty.to_string(), context: context() });
    }
}

fn collect_classes(program: &ast::Program, errors: &mut Vec<SemanticError>) -> ClassTable {
    let mut classes = ClassTable::new();

    for class in program.all_classes() {
        let mut fields: Vec<VarDecl> = Vec::new();
        for field in &class.fields {
            if fields.iter().any(|f| f.name == field.name) {
                errors.push(SemanticError::DuplicateField {
                    class: class.name.clone(),
                    field: field.name.clone(),
                });
            } else {
                fields.push(field.clone());
            }
        }

        let mut methods: Vec<MethodSig> = Vec::new();
        for method in &class.methods {
            let sig = MethodSig {
                class: class.name.clone(),
                name: method.name.clone(),
                params: method.formals.iter().map(|f| f.ty.clone()).collect(),
                return_type: method.return_type.clone(),
            };
            if methods.iter().any(|m| m.name == sig.name && m.params == sig.params) {
                errors.push(SemanticError::DuplicateMethod {
                    class: class.name.clone(),
                    signature: sig.mangled(),
                });
            } else {
                methods.push(sig);
            }
        }

        if classes.contains_key(&class.name) {
            errors.push(SemanticError::DuplicateClass(class.name.clone()));
        } else {
            classes.insert(class.name.clone(), ClassInfo { fields, methods });
        }
    }

    // Declared types can only be checked once every class name is known
    for class in program.all_classes() {
        for field in &class.fields {
            if field.ty == Type::Void {
                errors.push(SemanticError::UnknownType {
                    ty: field.ty.to_string(),
                    context: format!("{}.{}", class.name, field.name),
                });
            }
            require_known(&classes, &field.ty, || format!("{}.{}", class.name, field.name), errors);
        }
        for method in &class.methods {
            let context = || format!("{}.{}", class.name, method.name);
            require_known(&classes, &method.return_type, context, errors);
            for formal in &method.formals {
                require_known(&classes, &formal.ty, context, errors);
            }
            for var in &method.body.vars {
                require_known(&classes, &var.ty, context, errors);
            }
        }
    }

    classes
}

fn check_method(
    classes: &ClassTable,
    class: &str,
    method: &mut ast::Method,
    errors: &mut Vec<SemanticError>,
) {
    let name = format!("{}.{}", class, method.name);
    let mut scope: HashMap<String, Type> = HashMap::new();
    scope.insert("this".to_string(), Type::Class(class.to_string()));

    for var in method.formals.iter().chain(method.body.vars.iter()) {
        if scope.insert(var.name.clone(), var.ty.clone()).is_some() {
            errors.push(SemanticError::DuplicateVariable { method: name.clone(), name: var.name.clone() });
        }
    }

    let mut checker = MethodChecker {
        classes,
        class: class.to_string(),
        method: name,
        return_type: method.return_type.clone(),
        scope,
        errors,
    };
    for stmt in method.body.statements.iter_mut() {
        checker.statement(stmt);
    }
}

struct MethodChecker<'a> {
    classes: &'a ClassTable,
    class: String,
    method: String,
    return_type: Type,
    scope: HashMap<String, Type>,
    errors: &'a mut Vec<SemanticError>,
}

impl MethodChecker<'_> {
    fn mismatch(&mut self, context: &str, expected: &str, found: Type) {
        self.errors.push(SemanticError::TypeMismatch {
            method: self.method.clone(),
            context: context.to_string(),
            expected: expected.to_string(),
            found,
        });
    }

    fn expect(&mut self, context: &str, expected: &Type, expr: &mut Expr) {
        if let Some(found) = self.expr(expr) {
            if !expected.accepts(&found) {
                self.mismatch(context, &expected.to_string(), found);
            }
        }
    }

    fn variable(&mut self, name: &str) -> Option<Type> {
        if let Some(ty) = self.scope.get(name) {
            return Some(ty.clone());
        }
        // Not a local, so an implicit field of `this`
        let field = self.classes.get(&self.class).and_then(|c| c.field(name)).cloned();
        if field.is_none() {
            self.errors.push(SemanticError::UndefinedVariable {
                method: self.method.clone(),
                name: name.to_string(),
            });
        }
        field
    }

    fn class_of(&mut self, ty: Type) -> Option<String> {
        match ty {
            Type::Class(name) => Some(name),
            other => {
                self.errors.push(SemanticError::NotAnObject { method: self.method.clone(), ty: other });
                None
            }
        }
    }

    fn statement(&mut self, stmt: &mut Statement) {
        match stmt {
            Statement::If { cond, then_block, else_block } => {
                self.expect("if condition", &Type::Bool, cond);
                for s in then_block.iter_mut().chain(else_block.iter_mut()) {
                    self.statement(s);
                }
            }

            Statement::While { cond, body } => {
                self.expect("while condition", &Type::Bool, cond);
                for s in body.iter_mut() {
                    self.statement(s);
                }
            }

            Statement::Readln { name } => {
                if let Some(ty) = self.variable(name) {
                    if !matches!(ty, Type::Int | Type::Bool) {
                        self.mismatch("readln", "Int or Bool", ty);
                    }
                }
            }

            Statement::Println { expr } => {
                if let Some(ty) = self.expr(expr) {
                    if !matches!(ty, Type::Int | Type::Bool | Type::String) {
                        self.mismatch("println", "Int, Bool or String", ty);
                    }
                }
            }

            Statement::Assign { target, value } => {
                if let Some(expected) = self.expr(target) {
                    self.expect("assignment", &expected, value);
                }
            }

            Statement::Call { call } => {
                self.expr(call);
            }

            Statement::Return { expr: None } => {
                if self.return_type != Type::Void {
                    let expected = self.return_type.to_string();
                    self.mismatch("return", &expected, Type::Void);
                }
            }

            Statement::Return { expr: Some(expr) } => {
                let expected = self.return_type.clone();
                if expected == Type::Void {
                    if let Some(found) = self.expr(expr) {
                        self.mismatch("return", "no value", found);
                    }
                } else {
                    self.expect("return", &expected, expr);
                }
            }
        }
    }

    /// Types `expr`, recording the result on the node. `None` means an error
    /// has already been reported for it.
    fn expr(&mut self, expr: &mut Expr) -> Option<Type> {
        let ty = match &mut expr.kind {
            ExprKind::IntLit { .. } => Some(Type::Int),
            ExprKind::BoolLit { .. } => Some(Type::Bool),
            ExprKind::StrLit { .. } => Some(Type::String),
            ExprKind::Null => Some(Type::Null),
            ExprKind::This => Some(Type::Class(self.class.clone())),

            ExprKind::Variable { name } => {
                let name = name.clone();
                self.variable(&name)
            }

            ExprKind::New { class } => {
                let ty = Type::Class(class.clone());
                if is_known(self.classes, &ty) {
                    Some(ty)
                } else {
                    self.errors.push(SemanticError::UnknownType {
                        ty: class.clone(),
                        context: self.method.clone(),
                    });
                    None
                }
            }

            ExprKind::Field { object, field } => {
                let object_ty = self.expr(object)?;
                let class = self.class_of(object_ty)?;
                let ty = self.classes.get(&class).and_then(|c| c.field(field)).cloned();
                if ty.is_none() {
                    self.errors.push(SemanticError::UndefinedField { class, field: field.clone() });
                }
                ty
            }

            ExprKind::Call { callee, args, signature } => {
                let receiver = match callee {
                    Callee::Local { .. } => Some(self.class.clone()),
                    Callee::Member { object, .. } => {
                        self.expr(object).and_then(|ty| self.class_of(ty))
                    }
                };
                let name = match callee {
                    Callee::Local { name } | Callee::Member { name, .. } => name.clone(),
                };

                let arg_types: Vec<Option<Type>> = args.iter_mut().map(|a| self.expr(a)).collect();
                let arg_types: Option<Vec<Type>> = arg_types.into_iter().collect();

                let resolved = match (receiver, arg_types) {
                    (Some(class), Some(arg_types)) => self.resolve(&class, &name, &arg_types),
                    _ => None,
                };
                let ty = resolved.as_ref().map(|sig| sig.return_type.clone());
                *signature = resolved;
                ty
            }

            ExprKind::Binary { op, left, right } => {
                let op = *op;
                let left = self.expr(left);
                let right = self.expr(right);
                self.binary(op, left?, right?)
            }

            ExprKind::Unary { op, operand } => {
                let expected = match op {
                    UnaryOp::Neg => Type::Int,
                    UnaryOp::Not => Type::Bool,
                };
                let found = self.expr(operand)?;
                if found == expected {
                    Some(expected)
                } else {
                    self.mismatch(&format!("unary '{}'", op), &expected.to_string(), found);
                    None
                }
            }
        };

        expr.ty = ty.clone();
        ty
    }

    fn binary(&mut self, op: BinaryOp, left: Type, right: Type) -> Option<Type> {
        let result = match (op, &left, &right) {
            (BinaryOp::Add, Type::String, Type::String) => Some(Type::String),
            (BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div, Type::Int, Type::Int) => {
                Some(Type::Int)
            }
            (BinaryOp::And | BinaryOp::Or, Type::Bool, Type::Bool) => Some(Type::Bool),
            (BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge, Type::Int, Type::Int) => {
                Some(Type::Bool)
            }
            (BinaryOp::Eq | BinaryOp::Ne, Type::Int, Type::Int)
            | (BinaryOp::Eq | BinaryOp::Ne, Type::Bool, Type::Bool) => Some(Type::Bool),
            _ => None,
        };
        if result.is_none() {
            let expected = format!("operands accepted by '{}'", op);
            let context = format!("'{} {} {}'", left, op, right);
            self.mismatch(&context, &expected, right);
        }
        result
    }

    /// Picks the overload of `class.name` applicable to `args`. An exact
    /// match wins over one that relies on `null` conversions.
    fn resolve(&mut self, class: &str, name: &str, args: &[Type]) -> Option<MethodSig> {
        let classes = self.classes;
        let info = classes.get(class)?;
        let applicable: Vec<&MethodSig> = info
            .methods
            .iter()
            .filter(|m| {
                m.name == name
                    && m.params.len() == args.len()
                    && m.params.iter().zip(args).all(|(p, a)| p.accepts(a))
            })
            .collect();
        let exact: Vec<&MethodSig> =
            applicable.iter().copied().filter(|m| m.params.as_slice() == args).collect();

        if let [only] = applicable.as_slice() {
            return Some((*only).clone());
        }
        if let [only] = exact.as_slice() {
            return Some((*only).clone());
        }

        let args = args.iter().map(|a| a.to_string()).collect::<Vec<_>>().join(", ");
        let (class, name) = (class.to_string(), name.to_string());
        self.errors.push(if applicable.is_empty() {
            SemanticError::UndefinedMethod { class, name, args }
        } else {
            SemanticError::AmbiguousCall { class, name, args }
        });
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::parser::parse;

    fn check_source(source: &str) -> Result<ast::Program, Vec<SemanticError>> {
        let mut program = parse(source).expect("parse");
        check(&mut program).map(|_| program)
    }

    #[test]
    fn test_annotates_types_and_signatures() {
        let program = check_source(
            "class Main { Void main() { A a; Int x; a = new A(); x = a.f(1) + a.f(true); } }
             class A { Int f(Int n) { return n; } Int f(Bool b) { return 0; } }",
        )
        .expect("valid program");

        let Statement::Assign { value, .. } = &program.main_class.methods[0].body.statements[1] else {
            panic!("expected assignment");
        };
        assert_eq!(value.ty, Some(Type::Int));
        let ExprKind::Binary { left, right, .. } = &value.kind else { panic!("expected +") };
        let ExprKind::Call { signature: Some(first), .. } = &left.kind else { panic!("unresolved") };
        let ExprKind::Call { signature: Some(second), .. } = &right.kind else { panic!("unresolved") };
        assert_eq!(first.mangled(), "A_f_Int");
        assert_eq!(second.mangled(), "A_f_Bool");
    }

    #[test]
    fn test_implicit_fields_and_null() {
        let result = check_source(
            "class Main { Void main() { } }
             class Node { Int value; Node next; String name;
                 Void reset() { value = 0; next = null; name = null; return; } }",
        );
        assert!(result.is_ok(), "{:?}", result.err());
    }

    #[test]
    fn test_collects_every_error() {
        let errors = check_source(
            "class Main { Void main() { Int x; x = true; y = 1; println(new Main()); } }
             class A { Int f() { return false; } Int f() { return 1; } }",
        )
        .expect_err("invalid program");

        assert!(errors.iter().any(|e| matches!(e, SemanticError::DuplicateMethod { .. })));
        assert!(errors.iter().any(|e| matches!(e, SemanticError::UndefinedVariable { name, .. } if name == "y")));
        let mismatches = errors.iter().filter(|e| matches!(e, SemanticError::TypeMismatch { .. })).count();
        assert_eq!(mismatches, 3);
    }

    #[test]
    fn test_unresolved_and_ambiguous_calls() {
        let errors = check_source(
            "class Main { Void main() { A a; a = new A(); a.g(null); a.h(); } }
             class A { Void g(String s) { return; } Void g(A other) { return; } }",
        )
        .expect_err("invalid program");

        assert!(matches!(errors[0], SemanticError::AmbiguousCall { ref name, .. } if name == "g"));
        assert!(matches!(errors[1], SemanticError::UndefinedMethod { ref name, .. } if name == "h"));
    }

    #[test]
    fn test_main_and_unknown_types() {
        let errors = check_source("class Main { Int start() { return 0; } } class B { Missing m; }")
            .expect_err("invalid program");
        assert!(errors.contains(&SemanticError::MissingMain("Main".into())));
        assert!(errors.iter().any(|e| matches!(e, SemanticError::UnknownType { ty, .. } if ty == "Missing")));
    }
}
