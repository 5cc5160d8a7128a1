//! The register file used during symbolic execution.
//!
//! Registers holding values that never leave their defining basic block are
//! tracked as bare expression nodes and substitute into consumers. A
//! register that crosses a block boundary (read before any write in some
//! block, or written in more than one block) is materialized as a named
//! local instead: every write becomes an assignment statement and every
//! read yields the local. Merge points then agree by construction, which is
//! how the lifter keeps the one-expression-per-live-register invariant.

use std::collections::{BTreeSet, HashMap};

use crate::arena::ExprId;
use crate::dex::insns::Instruction;
use crate::lift::blocks::Cfg;

/// Register index -> current expression node, for one basic block walk.
pub struct RegisterFile {
    slots: Vec<Option<ExprId>>,
}

impl RegisterFile {
    pub fn new(registers_size: u16) -> RegisterFile {
        RegisterFile {
            slots: vec![None; registers_size as usize],
        }
    }

    pub fn get(&self, reg: u16) -> Option<ExprId> {
        self.slots.get(reg as usize).copied().flatten()
    }

    pub fn set(&mut self, reg: u16, id: ExprId) {
        if let Some(slot) = self.slots.get_mut(reg as usize) {
            *slot = Some(id);
        }
    }

    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
    }
}

/// Registers that must become named locals: upward-exposed in some block,
/// or defined in more than one block.
pub fn cross_block_registers(insns: &[Instruction], cfg: &Cfg) -> BTreeSet<u16> {
    let mut shared: BTreeSet<u16> = BTreeSet::new();
    let mut def_blocks: HashMap<u16, BTreeSet<usize>> = HashMap::new();

    for (bix, block) in cfg.blocks.iter().enumerate() {
        let mut defined: BTreeSet<u16> = BTreeSet::new();
        for &iix in &block.insns {
            let op = &insns[iix].op;
            for r in op.src_regs() {
                if !defined.contains(&r) {
                    // Upward-exposed: the value flows in from a predecessor
                    // (or is a parameter in the entry block).
                    shared.insert(r);
                }
            }
            if let Some(d) = op.def_reg() {
                defined.insert(d);
                def_blocks.entry(d).or_default().insert(bix);
            }
        }
    }
    for (r, blocks) in def_blocks {
        if blocks.len() > 1 {
            shared.insert(r);
        }
    }
    shared
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dex::class::CodeItem;
    use crate::dex::insns::decode_method;
    use crate::lift::blocks::partition;

    fn analyse(units: Vec<u16>) -> BTreeSet<u16> {
        let insns = decode_method(&units).unwrap();
        let code = CodeItem {
            registers_size: 8,
            ins_size: 0,
            outs_size: 0,
            debug_info_off: 0,
            insns: units,
            tries: vec![],
            handlers: vec![],
        };
        let cfg = partition(&insns, &code).unwrap();
        cross_block_registers(&insns, &cfg)
    }

    #[test]
    fn single_block_register_is_private() {
        // const/4 v0, #1; return v0 -- one block, def before use
        let shared = analyse(vec![0x1012, 0x000f]);
        assert!(!shared.contains(&0));
    }

    #[test]
    fn branch_read_makes_register_shared() {
        // 0: const/4 v0, #1
        // 1: if-eqz v0, +2 (-> 3)
        // 3: return v0     (v0 read in a different block)
        let shared = analyse(vec![0x1012, 0x0038, 0x0002, 0x000f]);
        assert!(shared.contains(&0));
    }
}
