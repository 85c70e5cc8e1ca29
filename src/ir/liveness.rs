use crate::ir::cfg::{BlockId, CFG};
use crate::ir::{Operand, Place, Stmt3};
use std::collections::BTreeSet;

pub type VarSet = BTreeSet<String>;

/// Backward effect of one statement:
/// `live_before = (live_after - die) ∪ live`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transfer {
    pub die: VarSet,
    pub live: VarSet,
}

/// Def/use rules the liveness engine is parameterised by.
pub trait DefUse {
    fn transfer(&self, stmt: &Stmt3) -> Transfer;
}

/// Rules for a method whose own names are `symbols`; any other identifier
/// is an implicit field, which keeps `this` alive instead.
pub struct LocalRules<'a> {
    symbols: &'a BTreeSet<String>,
}

impl<'a> LocalRules<'a> {
    pub fn new(symbols: &'a BTreeSet<String>) -> Self {
        Self { symbols }
    }

    fn use_name(&self, name: &str, transfer: &mut Transfer) {
        if self.symbols.contains(name) {
            transfer.live.insert(name.to_string());
        } else {
            transfer.live.insert("this".to_string());
        }
    }

    fn use_operand(&self, operand: &Operand, transfer: &mut Transfer) {
        if let Operand::Var(name) = operand {
            self.use_name(name, transfer);
        }
    }
}

impl DefUse for LocalRules<'_> {
    fn transfer(&self, stmt: &Stmt3) -> Transfer {
        let mut t = Transfer::default();
        match stmt {
            Stmt3::Label(_) | Stmt3::Goto(_) | Stmt3::Return(None) => {}
            Stmt3::IfGoto { cond, .. } => self.use_operand(cond, &mut t),
            // Conservative: the read target stays live across the read
            Stmt3::Readln(name) => self.use_name(name, &mut t),
            Stmt3::Println(value) | Stmt3::Return(Some(value)) => self.use_operand(value, &mut t),
            Stmt3::Assign { dest, src } => {
                match dest {
                    Place::Var(name) if self.symbols.contains(name) => {
                        t.die.insert(name.clone());
                    }
                    // Implicit field write goes through `this`
                    Place::Var(_) => {
                        t.live.insert("this".to_string());
                    }
                    // Field writes never kill anything
                    Place::Field { object, .. } => self.use_name(object, &mut t),
                }
                self.use_operand(src, &mut t);
            }
            Stmt3::TypeAssign { dest, value, .. } => {
                t.die.insert(dest.clone());
                self.use_operand(value, &mut t);
            }
            Stmt3::TypeAssignNew { dest, .. } => {
                t.die.insert(dest.clone());
            }
            Stmt3::TypeAssignCall { dest, args, .. } => {
                t.die.insert(dest.clone());
                for arg in args {
                    self.use_operand(arg, &mut t);
                }
            }
            Stmt3::TypeAssignFieldRead { dest, object, .. } => {
                t.die.insert(dest.clone());
                self.use_name(object, &mut t);
            }
            Stmt3::BinaryOp { dest, lhs, rhs, .. } => {
                t.die.insert(dest.clone());
                self.use_operand(lhs, &mut t);
                self.use_operand(rhs, &mut t);
            }
            Stmt3::UnaryOp { dest, operand, .. } => {
                t.die.insert(dest.clone());
                self.use_operand(operand, &mut t);
            }
        }
        t
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Liveness {
    // Variables live immediately before stream statement i
    pub live_before: Vec<VarSet>,
    // Variables live after the last statement of each block
    pub live_out: Vec<VarSet>,
}

impl Liveness {
    pub fn live_in(&self, cfg: &CFG, block: BlockId) -> &VarSet {
        &self.live_before[cfg.block(block).start]
    }

    /// Variables live immediately after stream statement `index` of `block`.
    pub fn live_after(&self, cfg: &CFG, block: BlockId, index: usize) -> &VarSet {
        if index + 1 < cfg.block(block).indices().end {
            &self.live_before[index + 1]
        } else {
            &self.live_out[block]
        }
    }
}

/// Runs the analysis to its fixed point.
pub fn analyse(cfg: &CFG, rules: &impl DefUse) -> Liveness {
    let transfers: Vec<Transfer> = cfg.statements().map(|s| rules.transfer(s)).collect();
    let mut liveness = Liveness {
        live_before: vec![VarSet::new(); cfg.len],
        live_out: vec![VarSet::new(); cfg.blocks.len()],
    };

    let mut passes = 1;
    while pass(cfg, &transfers, &mut liveness) {
        passes += 1;
    }
    log::trace!("liveness converged after {} passes over {} blocks", passes, cfg.blocks.len());

    liveness
}

/// One backward pass over every block. Returns whether any set changed.
pub fn step(cfg: &CFG, rules: &impl DefUse, liveness: &mut Liveness) -> bool {
    let transfers: Vec<Transfer> = cfg.statements().map(|s| rules.transfer(s)).collect();
    pass(cfg, &transfers, liveness)
}

fn pass(cfg: &CFG, transfers: &[Transfer], liveness: &mut Liveness) -> bool {
    let mut changed = false;

    for block in cfg.blocks.iter().rev() {
        let mut live = VarSet::new();
        for succ in &block.successors {
            live.extend(liveness.live_in(cfg, *succ).iter().cloned());
        }
        if live != liveness.live_out[block.id] {
            changed = true;
            liveness.live_out[block.id] = live.clone();
        }

        for i in block.indices().rev() {
            let transfer = &transfers[i];
            live.retain(|v| !transfer.die.contains(v));
            live.extend(transfer.live.iter().cloned());
            if live != liveness.live_before[i] {
                changed = true;
                liveness.live_before[i] = live.clone();
            }
        }
    }

    changed
}
