use crate::ir::cfg::CFG;
use crate::ir::liveness::{self, LocalRules, VarSet};
use crate::ir::{Method3, Place, Stmt3};
use std::collections::{BTreeMap, BTreeSet};

/// Registers handed out to method variables.
pub const REGISTERS: [&str; 7] = ["v1", "v2", "v3", "v4", "v5", "v6", "v7"];

const K: usize = REGISTERS.len();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    // Index into REGISTERS
    Register(usize),
    // The variable's frame slot
    Memory,
}

impl Location {
    pub fn register(self) -> Option<&'static str> {
        match self {
            Location::Register(color) => REGISTERS.get(color).copied(),
            Location::Memory => None,
        }
    }
}

pub type Allocation = BTreeMap<String, Location>;

#[derive(Debug, Clone, Default)]
pub struct InterferenceGraph {
    edges: BTreeMap<String, BTreeSet<String>>,
}

impl InterferenceGraph {
    pub fn new(vertices: impl IntoIterator<Item = String>) -> Self {
        Self { edges: vertices.into_iter().map(|v| (v, BTreeSet::new())).collect() }
    }

    pub fn add_edge(&mut self, a: &str, b: &str) {
        if a == b {
            return;
        }
        self.edges.entry(a.to_string()).or_default().insert(b.to_string());
        self.edges.entry(b.to_string()).or_default().insert(a.to_string());
    }

    /// Every pair in `live` interferes.
    pub fn add_clique(&mut self, live: &VarSet) {
        for (i, a) in live.iter().enumerate() {
            for b in live.iter().skip(i + 1) {
                self.add_edge(a, b);
            }
        }
    }

    pub fn interferes(&self, a: &str, b: &str) -> bool {
        self.edges.get(a).is_some_and(|n| n.contains(b))
    }

    pub fn vertices(&self) -> impl Iterator<Item = &String> {
        self.edges.keys()
    }

    fn neighbours(&self, v: &str) -> impl Iterator<Item = &String> {
        self.edges.get(v).into_iter().flatten()
    }
}

pub fn build_graph(method: &Method3) -> InterferenceGraph {
    let symbols = method.symbols();
    let cfg = CFG::build(&method.body.statements);
    let live = liveness::analyse(&cfg, &LocalRules::new(&symbols));

    let mut graph = InterferenceGraph::new(symbols.iter().cloned());
    for set in live.live_before.iter().chain(live.live_out.iter()) {
        graph.add_clique(set);
    }

    // A write must not land in a register some live variable occupies,
    // even when the written value itself is dead
    for block in &cfg.blocks {
        for (index, stmt) in block.indices().zip(&block.statements) {
            let written = match stmt {
                Stmt3::Assign { dest: Place::Var(name), .. } | Stmt3::Readln(name) => {
                    Some(name.as_str()).filter(|n| symbols.contains(*n))
                }
                other => other.defined(),
            };
            if let Some(dest) = written {
                for other in live.live_after(&cfg, block.id, index) {
                    graph.add_edge(dest, other);
                }
            }
        }
    }

    // The prologue writes every formal at once
    let entry_live = cfg.blocks.first().map(|b| live.live_in(&cfg, b.id).clone()).unwrap_or_default();
    for (i, formal) in method.formals.iter().enumerate() {
        for other in method.formals.iter().skip(i + 1) {
            graph.add_edge(&formal.name, &other.name);
        }
        for other in &entry_live {
            graph.add_edge(&formal.name, other);
        }
    }

    graph
}

/// Simplify/select colouring with `REGISTERS.len()` colours.
pub fn color(graph: &InterferenceGraph) -> Allocation {
    let mut remaining = graph.edges.clone();
    let mut stack: Vec<(String, bool)> = Vec::with_capacity(remaining.len());

    while !remaining.is_empty() {
        let simplify = remaining.iter().find(|(_, n)| n.len() < K).map(|(v, _)| (v.clone(), false));
        // Nothing trivially colourable: give up on the most constrained vertex
        let spill = || {
            remaining
                .iter()
                .max_by(|a, b| a.1.len().cmp(&b.1.len()).then_with(|| b.0.cmp(a.0)))
                .map(|(v, _)| (v.clone(), true))
        };
        let Some((vertex, spilled)) = simplify.or_else(spill) else {
            break;
        };

        if let Some(neighbours) = remaining.remove(&vertex) {
            for n in neighbours {
                if let Some(set) = remaining.get_mut(&n) {
                    set.remove(&vertex);
                }
            }
        }
        stack.push((vertex, spilled));
    }

    let mut allocation = Allocation::new();
    while let Some((vertex, spilled)) = stack.pop() {
        let location = if spilled {
            Location::Memory
        } else {
            let taken: BTreeSet<usize> = graph
                .neighbours(&vertex)
                .filter_map(|n| match allocation.get(n) {
                    Some(Location::Register(c)) => Some(*c),
                    _ => None,
                })
                .collect();
            (0..K).find(|c| !taken.contains(c)).map_or(Location::Memory, Location::Register)
        };
        allocation.insert(vertex, location);
    }

    allocation
}

pub fn allocate(method: &Method3) -> Allocation {
    let graph = build_graph(method);
    let allocation = color(&graph);

    let spilled: Vec<&str> = allocation
        .iter()
        .filter(|(_, l)| **l == Location::Memory)
        .map(|(v, _)| v.as_str())
        .collect();
    let used: BTreeSet<usize> = allocation
        .values()
        .filter_map(|l| match l {
            Location::Register(c) => Some(*c),
            Location::Memory => None,
        })
        .collect();
    log::debug!(
        "allocated {}: {} variables, {} registers, spilled {:?}",
        method.name,
        allocation.len(),
        used.len(),
        spilled
    );

    allocation
}
