use crate::ir::cfg::CFG;
use crate::ir::liveness::{self, LocalRules};
use crate::ir::{BinaryOp, Block3, Method3, Operand, Place, Program3, Stmt3};
use std::collections::{BTreeMap, BTreeSet};

/// Constant propagation and folding per basic block, then dead-code
/// elimination. Returns a new program; the input is left untouched.
pub fn optimize(program: &Program3) -> Program3 {
    let mut strings = program.strings.clone();
    let methods = program.methods.iter().map(|m| optimize_method(m, &mut strings)).collect();

    Program3 {
        classes: program.classes.clone(),
        methods,
        strings,
        entry: program.entry.clone(),
    }
}

/// Folded string constants are appended to `strings`.
pub fn optimize_method(method: &Method3, strings: &mut Vec<String>) -> Method3 {
    let symbols = method.symbols();
    let folded = propagate_constants(&method.body.statements, &symbols, strings);
    let statements = eliminate_dead_code(&folded, &symbols);

    log::debug!(
        "optimized {}: {} -> {} statements",
        method.name,
        method.body.statements.len(),
        statements.len()
    );

    Method3 {
        return_type: method.return_type.clone(),
        name: method.name.clone(),
        formals: method.formals.clone(),
        body: Block3 { locals: method.body.locals.clone(), statements },
    }
}

/// Forward pass over each block with a fresh value map; nothing is carried
/// across block boundaries.
pub fn propagate_constants(
    statements: &[Stmt3],
    symbols: &BTreeSet<String>,
    strings: &mut Vec<String>,
) -> Vec<Stmt3> {
    let cfg = CFG::build(statements);
    let mut stream = Vec::with_capacity(cfg.len);
    for block in &cfg.blocks {
        let mut values = Values::new(symbols);
        for stmt in &block.statements {
            stream.push(values.rewrite(stmt, strings));
        }
    }
    cfg.relabel(stream)
}

/// Values known at the current point of one block. A name that is absent
/// is unknown. Entries are either literals or copies of another symbol,
/// already resolved transitively.
struct Values<'a> {
    symbols: &'a BTreeSet<String>,
    known: BTreeMap<String, Operand>,
}

impl<'a> Values<'a> {
    fn new(symbols: &'a BTreeSet<String>) -> Self {
        Self { symbols, known: BTreeMap::new() }
    }

    fn resolve(&self, operand: &Operand) -> Operand {
        match operand {
            Operand::Var(name) => self.known.get(name).cloned().unwrap_or_else(|| operand.clone()),
            literal => literal.clone(),
        }
    }

    /// Forget `name`, and every copy that was taken from it.
    fn kill(&mut self, name: &str) {
        self.known.remove(name);
        self.known.retain(|_, value| value.as_var() != Some(name));
    }

    fn record(&mut self, name: &str, value: &Operand) {
        self.kill(name);
        let propagate = match value {
            Operand::Var(source) => source != name && self.symbols.contains(source),
            _ => true,
        };
        if propagate {
            self.known.insert(name.to_string(), value.clone());
        }
    }

    fn rewrite(&mut self, stmt: &Stmt3, strings: &mut Vec<String>) -> Option<Stmt3> {
        let rewritten = match stmt {
            Stmt3::IfGoto { cond, label } => match self.resolve(cond) {
                Operand::Bool(true) => Stmt3::Goto(label.clone()),
                // Never taken: control falls through either way
                Operand::Bool(false) => return None,
                cond => Stmt3::IfGoto { cond, label: label.clone() },
            },

            Stmt3::Readln(name) => {
                self.kill(name);
                stmt.clone()
            }

            Stmt3::Println(value) => Stmt3::Println(self.resolve(value)),

            Stmt3::Return(Some(value)) => Stmt3::Return(Some(self.resolve(value))),

            Stmt3::Assign { dest, src } => {
                let src = self.resolve(src);
                if let Place::Var(name) = dest {
                    if self.symbols.contains(name) {
                        self.record(name, &src);
                    }
                }
                Stmt3::Assign { dest: dest.clone(), src }
            }

            Stmt3::TypeAssign { ty, dest, value } => {
                let value = self.resolve(value);
                self.record(dest, &value);
                Stmt3::TypeAssign { ty: ty.clone(), dest: dest.clone(), value }
            }

            Stmt3::TypeAssignCall { ty, dest, target, args } => {
                let args = args.iter().map(|a| self.resolve(a)).collect();
                self.kill(dest);
                Stmt3::TypeAssignCall { ty: ty.clone(), dest: dest.clone(), target: target.clone(), args }
            }

            Stmt3::TypeAssignNew { dest, .. } | Stmt3::TypeAssignFieldRead { dest, .. } => {
                self.kill(dest);
                stmt.clone()
            }

            Stmt3::BinaryOp { ty, dest, lhs, op, rhs } => {
                let lhs = self.resolve(lhs);
                let rhs = self.resolve(rhs);
                match fold(&lhs, *op, &rhs) {
                    Some(value) => {
                        if let Operand::Str(text) = &value {
                            strings.push(text.clone());
                        }
                        self.record(dest, &value);
                        Stmt3::TypeAssign { ty: ty.clone(), dest: dest.clone(), value }
                    }
                    None => {
                        self.kill(dest);
                        Stmt3::BinaryOp { ty: ty.clone(), dest: dest.clone(), lhs, op: *op, rhs }
                    }
                }
            }

            // Unary operands are never substituted or folded
            Stmt3::UnaryOp { dest, operand, .. } => {
                if let Operand::Var(name) = operand {
                    self.kill(name);
                }
                self.kill(dest);
                stmt.clone()
            }

            Stmt3::Label(_) | Stmt3::Goto(_) | Stmt3::Return(None) => stmt.clone(),
        };
        Some(rewritten)
    }
}

/// Evaluates `lhs op rhs` when both sides are literals of a foldable kind.
/// Integer arithmetic wraps like the 32-bit target does.
pub fn fold(lhs: &Operand, op: BinaryOp, rhs: &Operand) -> Option<Operand> {
    match (lhs, rhs) {
        (Operand::Int(a), Operand::Int(b)) => {
            let (a, b) = (*a, *b);
            let value = match op {
                BinaryOp::Add => Operand::Int(a.wrapping_add(b)),
                BinaryOp::Sub => Operand::Int(a.wrapping_sub(b)),
                BinaryOp::Mul => Operand::Int(a.wrapping_mul(b)),
                BinaryOp::Div if b != 0 => Operand::Int(a.wrapping_div(b)),
                BinaryOp::Lt => Operand::Bool(a < b),
                BinaryOp::Le => Operand::Bool(a <= b),
                BinaryOp::Gt => Operand::Bool(a > b),
                BinaryOp::Ge => Operand::Bool(a >= b),
                BinaryOp::Eq => Operand::Bool(a == b),
                BinaryOp::Ne => Operand::Bool(a != b),
                _ => return None,
            };
            Some(value)
        }
        (Operand::Bool(a), Operand::Bool(b)) => match op {
            BinaryOp::And => Some(Operand::Bool(*a && *b)),
            BinaryOp::Or => Some(Operand::Bool(*a || *b)),
            BinaryOp::Eq => Some(Operand::Bool(a == b)),
            BinaryOp::Ne => Some(Operand::Bool(a != b)),
            _ => None,
        },
        (Operand::Str(a), Operand::Str(b)) if op == BinaryOp::Add => {
            Some(Operand::Str(format!("{}{}", a, b)))
        }
        _ => None,
    }
}

/// Drops definitions whose destination is dead immediately afterwards.
///
/// Calls always stay. A plain assignment is only a candidate when it writes
/// one of the method's own names; field writes, implicit or explicit, stay.
pub fn eliminate_dead_code(statements: &[Stmt3], symbols: &BTreeSet<String>) -> Vec<Stmt3> {
    let cfg = CFG::build(statements);
    let live = liveness::analyse(&cfg, &LocalRules::new(symbols));

    let mut stream = Vec::with_capacity(cfg.len);
    for block in &cfg.blocks {
        for (index, stmt) in block.indices().zip(&block.statements) {
            let after = live.live_after(&cfg, block.id, index);
            let keep = match stmt {
                Stmt3::TypeAssignCall { .. } => true,
                Stmt3::Assign { dest: Place::Var(name), .. } if symbols.contains(name) => {
                    after.contains(name)
                }
                Stmt3::Assign { .. } => true,
                other => other.defined().map_or(true, |dest| after.contains(dest)),
            };
            if !keep {
                log::trace!("dead: {}", stmt.to_string().trim());
            }
            stream.push(keep.then(|| stmt.clone()));
        }
    }

    cfg.relabel(stream)
}
