use crate::frontend::ast::{self, Callee, ExprKind};
use crate::ir::{Block3, ClassData, Method3, Operand, Place, Program3, Stmt3, Type, VarDecl3};
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LowerError {
    #[error("expression {0} reached lowering without a resolved type")]
    MissingType(String),

    #[error("call {0} reached lowering without a resolved method signature")]
    UnresolvedCall(String),

    #[error("cannot assign to {0}")]
    InvalidAssignTarget(String),

    #[error("main class '{0}' has no main method")]
    MissingEntry(String),
}

/// Which operand of a binary expression has its statements emitted first.
///
/// Both orders are equivalent for this language since expressions other than
/// calls are pure; right-first matches the listings existing tools expect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OperandOrder {
    #[default]
    RightFirst,
    LeftFirst,
}

/// State shared by the whole compilation unit.
struct Context {
    // Temporaries and labels draw from the same counter
    next_fresh: usize,
    strings: Vec<String>,
    order: OperandOrder,
}

impl Context {
    fn new(order: OperandOrder) -> Self {
        Self { next_fresh: 0, strings: Vec::new(), order }
    }

    fn fresh(&mut self) -> usize {
        let n = self.next_fresh;
        self.next_fresh += 1;
        n
    }

    fn new_label(&mut self) -> String {
        format!("L{}", self.fresh())
    }
}

/// State for the method currently being lowered.
struct MethodScope<'a> {
    ctx: &'a mut Context,
    // Formals, declared locals and temporaries created so far
    locals: HashSet<String>,
    statements: Vec<Stmt3>,
}

impl<'a> MethodScope<'a> {
    fn new_temp(&mut self) -> String {
        let name = format!("_v{}", self.ctx.fresh());
        self.locals.insert(name.clone());
        name
    }

    fn emit(&mut self, stmt: Stmt3) {
        self.statements.push(stmt);
    }

    fn is_local(&self, name: &str) -> bool {
        self.locals.contains(name)
    }
}

pub fn lower(program: &ast::Program, order: OperandOrder) -> Result<Program3, LowerError> {
    let mut ctx = Context::new(order);
    let mut classes = Vec::new();
    let mut methods = Vec::new();

    for class in program.all_classes() {
        classes.push(ClassData::new(
            class.name.clone(),
            class.fields.iter().map(|f| (f.ty.clone(), f.name.clone())),
        ));
        for method in &class.methods {
            methods.push(lower_method(&mut ctx, class, method)?);
        }
    }

    let main_class = &program.main_class;
    let entry = main_class
        .methods
        .iter()
        .find(|m| m.name == "main")
        .map(|m| mangled_name(main_class, m))
        .ok_or_else(|| LowerError::MissingEntry(main_class.name.clone()))?;

    log::debug!(
        "lowered {} classes, {} methods, {} string literals",
        classes.len(),
        methods.len(),
        ctx.strings.len()
    );

    Ok(Program3 { classes, methods, strings: ctx.strings, entry })
}

fn mangled_name(class: &ast::Class, method: &ast::Method) -> String {
    let params: Vec<Type> = method.formals.iter().map(|f| f.ty.clone()).collect();
    ast::mangle(&class.name, &method.name, &params)
}

fn lower_method(
    ctx: &mut Context,
    class: &ast::Class,
    method: &ast::Method,
) -> Result<Method3, LowerError> {
    let mut formals = vec![VarDecl3::new(Type::Class(class.name.clone()), "this")];
    formals.extend(method.formals.iter().map(|f| VarDecl3::new(f.ty.clone(), f.name.clone())));
    let locals: Vec<VarDecl3> =
        method.body.vars.iter().map(|v| VarDecl3::new(v.ty.clone(), v.name.clone())).collect();

    let mut scope = MethodScope {
        ctx,
        locals: formals.iter().chain(locals.iter()).map(|v| v.name.clone()).collect(),
        statements: Vec::new(),
    };

    for stmt in &method.body.statements {
        lower_statement(&mut scope, stmt)?;
    }

    Ok(Method3 {
        return_type: method.return_type.clone(),
        name: mangled_name(class, method),
        formals,
        body: Block3 { locals, statements: scope.statements },
    })
}

fn lower_statement(scope: &mut MethodScope, stmt: &ast::Statement) -> Result<(), LowerError> {
    match stmt {
        ast::Statement::If { cond, then_block, else_block } => {
            let l_true = scope.ctx.new_label();
            let l_false = scope.ctx.new_label();
            let l_next = scope.ctx.new_label();

            let cond = lower_expression(scope, cond)?;
            scope.emit(Stmt3::IfGoto { cond, label: l_true.clone() });
            scope.emit(Stmt3::Goto(l_false.clone()));

            scope.emit(Stmt3::Label(l_true));
            for s in then_block {
                lower_statement(scope, s)?;
            }
            scope.emit(Stmt3::Goto(l_next.clone()));

            scope.emit(Stmt3::Label(l_false));
            for s in else_block {
                lower_statement(scope, s)?;
            }
            scope.emit(Stmt3::Label(l_next));
        }

        ast::Statement::While { cond, body } => {
            let l_begin = scope.ctx.new_label();
            let l_true = scope.ctx.new_label();
            let l_next = scope.ctx.new_label();

            scope.emit(Stmt3::Label(l_begin.clone()));
            let cond = lower_expression(scope, cond)?;
            scope.emit(Stmt3::IfGoto { cond, label: l_true.clone() });
            scope.emit(Stmt3::Goto(l_next.clone()));

            scope.emit(Stmt3::Label(l_true));
            for s in body {
                lower_statement(scope, s)?;
            }
            scope.emit(Stmt3::Goto(l_begin));
            scope.emit(Stmt3::Label(l_next));
        }

        ast::Statement::Readln { name } => {
            scope.emit(Stmt3::Readln(name.clone()));
        }

        ast::Statement::Println { expr } => {
            let value = lower_into_temp(scope, expr)?;
            scope.emit(Stmt3::Println(Operand::Var(value)));
        }

        ast::Statement::Return { expr: None } => {
            scope.emit(Stmt3::Return(None));
        }

        ast::Statement::Return { expr: Some(expr) } => {
            let value = lower_into_temp(scope, expr)?;
            scope.emit(Stmt3::Return(Some(Operand::Var(value))));
        }

        ast::Statement::Assign { target, value } => {
            let src = lower_expression(scope, value)?;
            let dest = match &target.kind {
                ExprKind::Variable { name } => Place::Var(name.clone()),
                ExprKind::Field { object, field } => Place::Field {
                    object: object_name(scope, object)?,
                    field: field.clone(),
                },
                other => return Err(LowerError::InvalidAssignTarget(format!("{:?}", other))),
            };
            scope.emit(Stmt3::Assign { dest, src });
        }

        ast::Statement::Call { call } => {
            lower_expression(scope, call)?;
        }
    }
    Ok(())
}

fn type_of(expr: &ast::Expr) -> Result<Type, LowerError> {
    expr.ty.clone().ok_or_else(|| LowerError::MissingType(format!("{:?}", expr.kind)))
}

/// `T _vN = <expr>;`, returning `_vN`.
fn lower_into_temp(scope: &mut MethodScope, expr: &ast::Expr) -> Result<String, LowerError> {
    let ty = type_of(expr)?;
    let value = lower_expression(scope, expr)?;
    let dest = scope.new_temp();
    scope.emit(Stmt3::TypeAssign { ty, dest: dest.clone(), value });
    Ok(dest)
}

/// Name of a local holding the object `expr` evaluates to. Implicit fields
/// and other non-local values go through a fresh temporary.
fn object_name(scope: &mut MethodScope, expr: &ast::Expr) -> Result<String, LowerError> {
    match &expr.kind {
        ExprKind::This => Ok("this".to_string()),
        ExprKind::Variable { name } if scope.is_local(name) => Ok(name.clone()),
        _ => {
            let ty = type_of(expr)?;
            match lower_expression(scope, expr)? {
                Operand::Var(name) if scope.is_local(&name) => Ok(name),
                value => {
                    let dest = scope.new_temp();
                    scope.emit(Stmt3::TypeAssign { ty, dest: dest.clone(), value });
                    Ok(dest)
                }
            }
        }
    }
}

fn lower_expression(scope: &mut MethodScope, expr: &ast::Expr) -> Result<Operand, LowerError> {
    match &expr.kind {
        ExprKind::IntLit { value } => Ok(Operand::Int(*value)),

        ExprKind::BoolLit { value } => Ok(Operand::Bool(*value)),

        ExprKind::StrLit { value } => {
            scope.ctx.strings.push(value.clone());
            Ok(Operand::Str(value.clone()))
        }

        ExprKind::Null => Ok(Operand::Null),

        ExprKind::This => Ok(Operand::var("this")),

        ExprKind::Variable { name } => Ok(Operand::Var(name.clone())),

        ExprKind::New { class } => {
            let dest = scope.new_temp();
            scope.emit(Stmt3::TypeAssignNew {
                ty: Type::Class(class.clone()),
                dest: dest.clone(),
                class: class.clone(),
            });
            Ok(Operand::Var(dest))
        }

        ExprKind::Field { object, field } => {
            let ty = type_of(expr)?;
            let object = object_name(scope, object)?;
            let dest = scope.new_temp();
            scope.emit(Stmt3::TypeAssignFieldRead {
                ty,
                dest: dest.clone(),
                object,
                field: field.clone(),
            });
            Ok(Operand::Var(dest))
        }

        ExprKind::Call { callee, args, signature } => {
            let signature = signature
                .as_ref()
                .ok_or_else(|| LowerError::UnresolvedCall(format!("{:?}", callee)))?;

            let object = match callee {
                Callee::Local { .. } => "this".to_string(),
                Callee::Member { object, .. } => object_name(scope, object)?,
            };

            let mut operands = vec![Operand::Var(object)];
            for arg in args {
                operands.push(lower_expression(scope, arg)?);
            }

            let dest = scope.new_temp();
            scope.emit(Stmt3::TypeAssignCall {
                ty: signature.return_type.clone(),
                dest: dest.clone(),
                target: signature.mangled(),
                args: operands,
            });
            Ok(Operand::Var(dest))
        }

        ExprKind::Binary { op, left, right } => {
            let ty = type_of(expr)?;
            let (lhs, rhs) = match scope.ctx.order {
                OperandOrder::RightFirst => {
                    let rhs = lower_expression(scope, right)?;
                    let lhs = lower_expression(scope, left)?;
                    (lhs, rhs)
                }
                OperandOrder::LeftFirst => {
                    let lhs = lower_expression(scope, left)?;
                    let rhs = lower_expression(scope, right)?;
                    (lhs, rhs)
                }
            };

            let dest = scope.new_temp();
            scope.emit(Stmt3::BinaryOp { ty, dest: dest.clone(), lhs, op: *op, rhs });
            Ok(Operand::Var(dest))
        }

        ExprKind::Unary { op, operand } => {
            // `--x` becomes one temporary negated twice
            let mut repeat = 1;
            let mut inner = operand.as_ref();
            while let ExprKind::Unary { op: inner_op, operand } = &inner.kind {
                if inner_op != op {
                    break;
                }
                repeat += 1;
                inner = operand.as_ref();
            }

            let ty = type_of(inner)?;
            let value = lower_expression(scope, inner)?;
            let dest = scope.new_temp();
            scope.emit(Stmt3::TypeAssign { ty, dest: dest.clone(), value });
            for _ in 0..repeat {
                scope.emit(Stmt3::UnaryOp {
                    dest: dest.clone(),
                    op: *op,
                    operand: Operand::Var(dest.clone()),
                });
            }
            Ok(Operand::Var(dest))
        }
    }
}
