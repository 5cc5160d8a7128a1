//! Basic-block partition and control-flow graph over a decoded
//! instruction sequence.
//!
//! Leaders: the first instruction, every branch/switch target, every
//! instruction following a terminator, every try-range start and every
//! handler entry. Edges are fall-through plus explicit targets.

use std::collections::{BTreeMap, BTreeSet};

use crate::dex::class::CodeItem;
use crate::dex::insns::Instruction;
use crate::error::LiftError;

#[derive(Debug)]
pub struct BasicBlock {
    /// Code-unit offset of the first instruction.
    pub start: usize,
    /// Exclusive code-unit end offset.
    pub end: usize,
    /// Indices into the decoded instruction vector.
    pub insns: Vec<usize>,
    pub succs: Vec<usize>,
    pub preds: Vec<usize>,
}

#[derive(Debug)]
pub struct Cfg {
    pub blocks: Vec<BasicBlock>,
    /// Block index by start offset.
    pub by_offset: BTreeMap<usize, usize>,
    /// Handler-entry block indices (extra traversal roots).
    pub handler_entries: Vec<usize>,
}

impl Cfg {
    pub fn block_at(&self, offset: usize) -> Result<usize, LiftError> {
        self.by_offset
            .get(&offset)
            .copied()
            .ok_or(LiftError::Cfg {
                offset,
                reason: "jump into the middle of an instruction".to_string(),
            })
    }

    /// Reverse post-order from the entry, with handler entries appended as
    /// extra roots (they are unreachable along normal edges).
    pub fn reverse_post_order(&self) -> Vec<usize> {
        let mut visited = vec![false; self.blocks.len()];
        let mut post = Vec::with_capacity(self.blocks.len());
        let mut roots = vec![0usize];
        roots.extend(&self.handler_entries);
        for root in roots {
            if !visited.get(root).copied().unwrap_or(true) {
                self.post_order(root, &mut visited, &mut post);
            }
        }
        post.reverse();
        post
    }

    fn post_order(&self, root: usize, visited: &mut [bool], post: &mut Vec<usize>) {
        // Iterative DFS; methods can have long straight-line chains.
        let mut stack = vec![(root, 0usize)];
        visited[root] = true;
        while let Some((block, child)) = stack.pop() {
            if child < self.blocks[block].succs.len() {
                stack.push((block, child + 1));
                let succ = self.blocks[block].succs[child];
                if !visited[succ] {
                    visited[succ] = true;
                    stack.push((succ, 0));
                }
            } else {
                post.push(block);
            }
        }
    }

    /// Immediate-dominator-free dominance test: `dominators()[b]` is the set
    /// of blocks dominating `b`, computed by the classic iterative data-flow
    /// over reverse post-order. Handler entries are treated as roots that
    /// dominate only themselves onward.
    pub fn dominators(&self) -> Vec<BTreeSet<usize>> {
        let n = self.blocks.len();
        let all: BTreeSet<usize> = (0..n).collect();
        let mut dom: Vec<BTreeSet<usize>> = vec![all; n];
        let mut roots: BTreeSet<usize> = BTreeSet::new();
        roots.insert(0);
        roots.extend(&self.handler_entries);
        for &r in &roots {
            dom[r] = BTreeSet::from([r]);
        }
        let order = self.reverse_post_order();
        let mut changed = true;
        while changed {
            changed = false;
            for &b in &order {
                if roots.contains(&b) {
                    continue;
                }
                let mut new: Option<BTreeSet<usize>> = None;
                for &p in &self.blocks[b].preds {
                    new = Some(match new {
                        None => dom[p].clone(),
                        Some(acc) => acc.intersection(&dom[p]).copied().collect(),
                    });
                }
                let mut new = new.unwrap_or_default();
                new.insert(b);
                if new != dom[b] {
                    dom[b] = new;
                    changed = true;
                }
            }
        }
        dom
    }
}

/// Partitions `insns` into basic blocks, using the code item's try/catch
/// table for the extra leaders.
pub fn partition(insns: &[Instruction], code: &CodeItem) -> Result<Cfg, LiftError> {
    if insns.is_empty() {
        return Ok(Cfg {
            blocks: vec![],
            by_offset: BTreeMap::new(),
            handler_entries: vec![],
        });
    }

    let starts: BTreeSet<usize> = insns.iter().map(|i| i.offset).collect();
    let check = |offset: usize| -> Result<usize, LiftError> {
        if starts.contains(&offset) {
            Ok(offset)
        } else {
            Err(LiftError::Cfg {
                offset,
                reason: "target is not an instruction boundary".to_string(),
            })
        }
    };

    let mut leaders: BTreeSet<usize> = BTreeSet::new();
    leaders.insert(insns[0].offset);
    for insn in insns {
        for target in insn.branch_targets() {
            leaders.insert(check(target)?);
        }
        if insn.is_terminator() {
            let next = insn.offset + insn.units;
            if starts.contains(&next) {
                leaders.insert(next);
            }
        }
    }
    let mut handler_offsets: BTreeSet<usize> = BTreeSet::new();
    for t in &code.tries {
        leaders.insert(check(t.start_addr as usize)?);
        let handler = &code.handlers[t.handler_index];
        for (_, addr) in &handler.catches {
            handler_offsets.insert(check(*addr as usize)?);
        }
        if let Some(addr) = handler.catch_all {
            handler_offsets.insert(check(addr as usize)?);
        }
    }
    leaders.extend(&handler_offsets);

    // Slice instruction runs at leader boundaries.
    let mut blocks: Vec<BasicBlock> = Vec::new();
    let mut by_offset = BTreeMap::new();
    let mut current: Option<BasicBlock> = None;
    for (ix, insn) in insns.iter().enumerate() {
        if leaders.contains(&insn.offset) {
            if let Some(done) = current.take() {
                blocks.push(done);
            }
            by_offset.insert(insn.offset, blocks.len());
            current = Some(BasicBlock {
                start: insn.offset,
                end: insn.offset + insn.units,
                insns: vec![ix],
                succs: vec![],
                preds: vec![],
            });
        } else if let Some(block) = current.as_mut() {
            block.end = insn.offset + insn.units;
            block.insns.push(ix);
        }
    }
    if let Some(done) = current.take() {
        blocks.push(done);
    }

    // Edges.
    let mut edges: Vec<(usize, usize)> = Vec::new();
    for (bix, block) in blocks.iter().enumerate() {
        let last = &insns[*block.insns.last().expect("blocks are non-empty")];
        for target in last.branch_targets() {
            edges.push((bix, by_offset[&target]));
        }
        if last.falls_through() {
            if let Some(&next) = by_offset.get(&(last.offset + last.units)) {
                edges.push((bix, next));
            }
        }
    }
    for (from, to) in edges {
        if !blocks[from].succs.contains(&to) {
            blocks[from].succs.push(to);
        }
        if !blocks[to].preds.contains(&from) {
            blocks[to].preds.push(from);
        }
    }

    let handler_entries = handler_offsets
        .iter()
        .map(|off| by_offset[off])
        .collect();

    Ok(Cfg {
        blocks,
        by_offset,
        handler_entries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dex::class::CodeItem;
    use crate::dex::insns::decode_method;

    fn empty_code(insns: Vec<u16>) -> CodeItem {
        CodeItem {
            registers_size: 4,
            ins_size: 0,
            outs_size: 0,
            debug_info_off: 0,
            insns,
            tries: vec![],
            handlers: vec![],
        }
    }

    #[test]
    fn straight_line_is_one_block() {
        let units = vec![0x0000u16, 0x0000, 0x000e];
        let insns = decode_method(&units).unwrap();
        let cfg = partition(&insns, &empty_code(units)).unwrap();
        assert_eq!(cfg.blocks.len(), 1);
        assert!(cfg.blocks[0].succs.is_empty());
    }

    #[test]
    fn branch_splits_blocks() {
        // 0: if-eqz v0, +2 (-> 2); 2: return-void
        let units = vec![0x0038u16, 0x0002, 0x000e];
        let insns = decode_method(&units).unwrap();
        let cfg = partition(&insns, &empty_code(units)).unwrap();
        assert_eq!(cfg.blocks.len(), 2);
        assert_eq!(cfg.blocks[0].succs, vec![1]);
        assert_eq!(cfg.blocks[1].preds, vec![0]);
    }

    #[test]
    fn loop_back_edge() {
        // 0: nop; 1: goto -1
        let units = vec![0x0000u16, 0xff28];
        let insns = decode_method(&units).unwrap();
        let cfg = partition(&insns, &empty_code(units)).unwrap();
        assert_eq!(cfg.blocks.len(), 1);
        assert_eq!(cfg.blocks[0].succs, vec![0]);
        let dom = cfg.dominators();
        assert!(dom[0].contains(&0));
    }

    #[test]
    fn jump_into_instruction_is_rejected() {
        // goto/32 +1 lands inside itself
        let units = vec![0x002au16, 0x0001, 0x0000];
        let insns = decode_method(&units).unwrap();
        let err = partition(&insns, &empty_code(units));
        assert!(err.is_err());
    }

    #[test]
    fn reverse_post_order_starts_at_entry() {
        let units = vec![0x0038u16, 0x0002, 0x000e, 0x000e];
        let insns = decode_method(&units).unwrap();
        let cfg = partition(&insns, &empty_code(units)).unwrap();
        let rpo = cfg.reverse_post_order();
        assert_eq!(rpo[0], 0);
        assert_eq!(rpo.len(), cfg.blocks.len());
    }
}
