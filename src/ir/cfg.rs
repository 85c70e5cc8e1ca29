use crate::ir::Stmt3;
use std::collections::{BTreeSet, HashMap};
use std::ops::Range;

pub type BlockId = usize;

/// Basic blocks of one method body.
///
/// Labels are stripped out of the executable stream; every remaining
/// statement has an index in `0..len`, and blocks partition that range in
/// order. Block 0 is the entry.
#[derive(Debug, Clone)]
pub struct CFG {
    pub blocks: Vec<BasicBlock>,
    pub entry: BlockId,
    // Label and the stream index of the statement it precedes, in source order
    pub labels: Vec<(String, usize)>,
    pub len: usize,
}

#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub id: BlockId,
    pub start: usize,
    pub statements: Vec<Stmt3>,
    pub successors: Vec<BlockId>,
    pub predecessors: Vec<BlockId>,
}

impl BasicBlock {
    /// Stream indices covered by this block.
    pub fn indices(&self) -> Range<usize> {
        self.start..self.start + self.statements.len()
    }
}

impl CFG {
    pub fn build(statements: &[Stmt3]) -> Self {
        let mut labels = Vec::new();
        let mut stream = Vec::new();
        for stmt in statements {
            match stmt {
                Stmt3::Label(label) => labels.push((label.clone(), stream.len())),
                other => stream.push(other.clone()),
            }
        }
        let len = stream.len();
        let targets: HashMap<&str, usize> =
            labels.iter().map(|(label, index)| (label.as_str(), *index)).collect();

        /*
         * A block starts at:
         * - the first statement
         * - every jump target
         * - every statement following a Goto, IfGoto or Return
         */
        let mut leaders = BTreeSet::new();
        if len > 0 {
            leaders.insert(0);
        }
        for (_, index) in &labels {
            if *index < len {
                leaders.insert(*index);
            }
        }
        for (i, stmt) in stream.iter().enumerate() {
            if (stmt.jump_target().is_some() || stmt.ends_flow()) && i + 1 < len {
                leaders.insert(i + 1);
            }
        }

        let starts: Vec<usize> = leaders.into_iter().collect();
        let block_at: HashMap<usize, BlockId> =
            starts.iter().enumerate().map(|(id, start)| (*start, id)).collect();

        let mut blocks: Vec<BasicBlock> = Vec::with_capacity(starts.len());
        let mut remaining = stream.into_iter();
        for (id, start) in starts.iter().enumerate() {
            let end = starts.get(id + 1).copied().unwrap_or(len);
            blocks.push(BasicBlock {
                id,
                start: *start,
                statements: remaining.by_ref().take(end - start).collect(),
                successors: Vec::new(),
                predecessors: Vec::new(),
            });
        }

        let block_count = blocks.len();
        for block in blocks.iter_mut() {
            let fallthrough = (block.id + 1 < block_count).then_some(block.id + 1);
            let jump = |label: &str| -> Option<BlockId> {
                match targets.get(label) {
                    Some(index) => block_at.get(index).copied(),
                    None => {
                        log::warn!("jump to undefined label {}", label);
                        None
                    }
                }
            };

            let mut successors = Vec::new();
            match block.statements.last() {
                Some(Stmt3::Goto(label)) => successors.extend(jump(label)),
                Some(Stmt3::IfGoto { label, .. }) => {
                    successors.extend(jump(label));
                    successors.extend(fallthrough);
                }
                Some(Stmt3::Return(_)) => {}
                _ => successors.extend(fallthrough),
            }
            successors.dedup();
            block.successors = successors;
        }

        for id in 0..block_count {
            for succ in blocks[id].successors.clone() {
                if !blocks[succ].predecessors.contains(&id) {
                    blocks[succ].predecessors.push(id);
                }
            }
        }

        Self { blocks, entry: 0, labels, len }
    }

    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id]
    }

    /// Label-free statement stream, in order.
    pub fn statements(&self) -> impl Iterator<Item = &Stmt3> {
        self.blocks.iter().flat_map(|b| b.statements.iter())
    }

    /// Flatten back to a labelled statement list.
    pub fn flatten(&self) -> Vec<Stmt3> {
        self.relabel(self.statements().cloned().map(Some).collect())
    }

    /// Rebuild a labelled statement list from a rewritten stream.
    ///
    /// `stream[i]` replaces statement `i` (`None` drops it); every label is
    /// kept in front of whatever now occupies its original position.
    pub fn relabel(&self, stream: Vec<Option<Stmt3>>) -> Vec<Stmt3> {
        let mut statements = Vec::with_capacity(stream.len() + self.labels.len());
        let mut labels = self.labels.iter().peekable();
        for (i, stmt) in stream.into_iter().enumerate() {
            while let Some((label, _)) = labels.next_if(|(_, index)| *index == i) {
                statements.push(Stmt3::Label(label.clone()));
            }
            statements.extend(stmt);
        }
        statements.extend(labels.map(|(label, _)| Stmt3::Label(label.clone())));
        statements
    }
}
