/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Control-flow analysis: input validation, the dominator tree, and loop
//! preheader detection.

use crate::data_structures::{BlockIx, Func, InstIx, InstKind, Map, Set};
use smallvec::SmallVec;

//=============================================================================
// Errors.  These are malformed-input conditions that the entry points hand
// back to the caller.  Internal invariant failures are debug_asserts, not
// errors.

#[derive(Clone, Debug)]
pub enum AnalysisError {
  /// One or more blocks is not reachable from the entry block.
  UnreachableBlocks,

  /// A phi's incoming list does not match its block's predecessor list.
  PhiIncomingMismatch { inst: InstIx },

  /// The function has no blocks at all.
  EmptyFunction,
}

impl std::fmt::Display for AnalysisError {
  fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
    match self {
      AnalysisError::UnreachableBlocks => {
        write!(f, "<one or more blocks is unreachable>")
      }
      AnalysisError::PhiIncomingMismatch { inst } => {
        write!(f, "<phi {:?}: incoming list does not match predecessors>", inst)
      }
      AnalysisError::EmptyFunction => write!(f, "<function has no blocks>"),
    }
  }
}

impl std::error::Error for AnalysisError {}

/// Structural checks on the input function.  The passes assume these hold.
pub fn validate(func: &Func) -> Result<(), AnalysisError> {
  if func.blocks.len() == 0 {
    return Err(AnalysisError::EmptyFunction);
  }
  // Every block must be reachable from the entry.
  let mut seen = Set::default();
  let mut stack = vec![func.entry];
  seen.insert(func.entry);
  while let Some(b) = stack.pop() {
    for &s in &func.blocks[b].succs {
      if seen.insert(s) {
        stack.push(s);
      }
    }
  }
  if seen.len() as u32 != func.blocks.len() {
    return Err(AnalysisError::UnreachableBlocks);
  }
  // Phi incoming lists must name exactly the predecessors.
  for bix in func.blocks.range() {
    for &iix in &func.blocks[bix].insts {
      if let InstKind::Phi { ref incoming } = func.insts[iix].kind {
        let preds = &func.blocks[bix].preds;
        if incoming.len() != preds.len()
          || incoming.iter().any(|(_, pb)| !preds.contains(pb))
        {
          return Err(AnalysisError::PhiIncomingMismatch { inst: iix });
        }
      }
    }
  }
  Ok(())
}

//=============================================================================
// Dominator tree.  Built either from client-supplied immediate dominators or
// computed here with the Cooper/Harvey/Kennedy iterative scheme.  Dominance
// queries are O(1) via DFS in/out numbering.

pub struct DomTree {
  idom: Vec<BlockIx>, // invalid for the entry block
  children: Vec<SmallVec<[BlockIx; 2]>>,
  preorder: Vec<BlockIx>,
  dfs_in: Vec<u32>,
  dfs_out: Vec<u32>,
}

impl DomTree {
  /// Build the tree from immediate dominators, one per block in block-index
  /// order, with `BlockIx::invalid()` for the entry.
  pub fn from_idoms(func: &Func, idoms: &[BlockIx]) -> DomTree {
    debug_assert!(idoms.len() as u32 == func.blocks.len());
    let nb = idoms.len();
    let mut children: Vec<SmallVec<[BlockIx; 2]>> = vec![SmallVec::new(); nb];
    for bix in func.blocks.range() {
      let idom = idoms[bix.get() as usize];
      if idom.is_valid() {
        children[idom.get() as usize].push(bix);
      } else {
        debug_assert!(bix == func.entry);
      }
    }
    // Children were pushed in block-index order, so the preorder walk is
    // deterministic.
    let mut preorder = Vec::with_capacity(nb);
    let mut dfs_in = vec![0u32; nb];
    let mut dfs_out = vec![0u32; nb];
    let mut counter = 0u32;
    // (block, next-child-to-visit)
    let mut stack: Vec<(BlockIx, usize)> = vec![(func.entry, 0)];
    dfs_in[func.entry.get() as usize] = counter;
    counter += 1;
    preorder.push(func.entry);
    while let Some(&mut (b, ref mut next)) = stack.last_mut() {
      let kids = &children[b.get() as usize];
      if *next < kids.len() {
        let child = kids[*next];
        *next += 1;
        dfs_in[child.get() as usize] = counter;
        counter += 1;
        preorder.push(child);
        stack.push((child, 0));
      } else {
        dfs_out[b.get() as usize] = counter;
        counter += 1;
        stack.pop();
      }
    }
    DomTree { idom: idoms.to_vec(), children, preorder, dfs_in, dfs_out }
  }

  /// Compute immediate dominators from scratch.  Requires a validated
  /// function (all blocks reachable).
  pub fn compute(func: &Func) -> DomTree {
    let nb = func.blocks.len() as usize;
    // Reverse postorder over the successor graph.
    let mut postorder = Vec::with_capacity(nb);
    let mut visited = vec![false; nb];
    let mut stack: Vec<(BlockIx, usize)> = vec![(func.entry, 0)];
    visited[func.entry.get() as usize] = true;
    while let Some(&mut (b, ref mut next)) = stack.last_mut() {
      let succs = &func.blocks[b].succs;
      if *next < succs.len() {
        let s = succs[*next];
        *next += 1;
        if !visited[s.get() as usize] {
          visited[s.get() as usize] = true;
          stack.push((s, 0));
        }
      } else {
        postorder.push(b);
        stack.pop();
      }
    }
    let mut rpo_num = vec![0u32; nb];
    for (i, &b) in postorder.iter().rev().enumerate() {
      rpo_num[b.get() as usize] = i as u32;
    }

    let mut idom = vec![BlockIx::invalid(); nb];
    idom[func.entry.get() as usize] = func.entry;
    let mut changed = true;
    while changed {
      changed = false;
      for &b in postorder.iter().rev() {
        if b == func.entry {
          continue;
        }
        let mut new_idom = BlockIx::invalid();
        for &p in &func.blocks[b].preds {
          if !idom[p.get() as usize].is_valid() {
            continue;
          }
          new_idom = if new_idom.is_valid() {
            Self::intersect(&idom, &rpo_num, p, new_idom)
          } else {
            p
          };
        }
        debug_assert!(new_idom.is_valid());
        if idom[b.get() as usize] != new_idom {
          idom[b.get() as usize] = new_idom;
          changed = true;
        }
      }
    }
    idom[func.entry.get() as usize] = BlockIx::invalid();
    DomTree::from_idoms(func, &idom)
  }

  fn intersect(
    idom: &[BlockIx], rpo_num: &[u32], mut a: BlockIx, mut b: BlockIx,
  ) -> BlockIx {
    while a != b {
      while rpo_num[a.get() as usize] > rpo_num[b.get() as usize] {
        a = idom[a.get() as usize];
      }
      while rpo_num[b.get() as usize] > rpo_num[a.get() as usize] {
        b = idom[b.get() as usize];
      }
    }
    a
  }

  pub fn idom(&self, b: BlockIx) -> Option<BlockIx> {
    let i = self.idom[b.get() as usize];
    if i.is_valid() {
      Some(i)
    } else {
      None
    }
  }

  pub fn children(&self, b: BlockIx) -> &[BlockIx] {
    &self.children[b.get() as usize]
  }

  /// Blocks in dominator-tree preorder.  Both passes walk blocks in this
  /// order.
  pub fn preorder(&self) -> &[BlockIx] {
    &self.preorder
  }

  /// Does |a| dominate |b|?  Inclusive: every block dominates itself.
  pub fn dominates(&self, a: BlockIx, b: BlockIx) -> bool {
    self.dfs_in[a.get() as usize] <= self.dfs_in[b.get() as usize]
      && self.dfs_out[b.get() as usize] <= self.dfs_out[a.get() as usize]
  }

  pub fn strictly_dominates(&self, a: BlockIx, b: BlockIx) -> bool {
    a != b && self.dominates(a, b)
  }
}

//=============================================================================
// Loops.  We only need two facts: which blocks are loop headers, and which
// block (if any) is a header's unique preheader.  A back edge is an edge
// whose target dominates its source.

pub struct LoopInfo {
  headers: Set<BlockIx>,
  // preheader -> header
  preheaders: Map<BlockIx, BlockIx>,
}

impl LoopInfo {
  pub fn compute(func: &Func, domtree: &DomTree) -> LoopInfo {
    let mut headers = Set::default();
    for bix in func.blocks.range() {
      for &s in &func.blocks[bix].succs {
        if domtree.dominates(s, bix) {
          headers.insert(s);
        }
      }
    }
    let mut preheaders = Map::default();
    for &h in &headers {
      // The preheader is the unique predecessor entering from outside the
      // loop.  With more than one outside predecessor there is no
      // preheader.
      let mut outside = None;
      let mut unique = true;
      for &p in &func.blocks[h].preds {
        if domtree.dominates(h, p) {
          continue; // back edge
        }
        if outside.is_some() {
          unique = false;
        }
        outside = Some(p);
      }
      if unique {
        if let Some(p) = outside {
          preheaders.insert(p, h);
        }
      }
    }
    LoopInfo { headers, preheaders }
  }

  pub fn is_header(&self, b: BlockIx) -> bool {
    self.headers.contains(&b)
  }

  pub fn is_preheader(&self, b: BlockIx) -> bool {
    self.preheaders.contains_key(&b)
  }

  /// The unique preheader entering loop header |h|, if there is one.
  pub fn preheader_of(&self, h: BlockIx) -> Option<BlockIx> {
    self
      .preheaders
      .iter()
      .find(|&(_, &hdr)| hdr == h)
      .map(|(&p, _)| p)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::data_structures::Type;

  // Diamond: b0 -> b1, b2; b1, b2 -> b3.
  fn diamond() -> Func {
    let mut f = Func::new();
    let b0 = f.add_block();
    let b1 = f.add_block();
    let b2 = f.add_block();
    let b3 = f.add_block();
    f.add_edge(b0, b1);
    f.add_edge(b0, b2);
    f.add_edge(b1, b3);
    f.add_edge(b2, b3);
    f.finish();
    f
  }

  #[test]
  fn test_diamond_dominators() {
    let f = diamond();
    assert!(validate(&f).is_ok());
    let dt = DomTree::compute(&f);
    let b = |n| BlockIx::new(n);
    assert_eq!(dt.idom(b(0)), None);
    assert_eq!(dt.idom(b(1)), Some(b(0)));
    assert_eq!(dt.idom(b(2)), Some(b(0)));
    assert_eq!(dt.idom(b(3)), Some(b(0)));
    assert!(dt.dominates(b(0), b(3)));
    assert!(dt.dominates(b(1), b(1)));
    assert!(!dt.strictly_dominates(b(1), b(1)));
    assert!(!dt.dominates(b(1), b(3)));
    assert_eq!(dt.preorder()[0], b(0));
    assert_eq!(dt.preorder().len(), 4);
  }

  #[test]
  fn test_unreachable_block_rejected() {
    let mut f = Func::new();
    let _b0 = f.add_block();
    let _b1 = f.add_block(); // no edge to it
    f.finish();
    match validate(&f) {
      Err(AnalysisError::UnreachableBlocks) => {}
      other => panic!("expected UnreachableBlocks, got {:?}", other.err()),
    }
  }

  #[test]
  fn test_phi_mismatch_rejected() {
    let mut f = Func::new();
    let b0 = f.add_block();
    let b1 = f.add_block();
    f.add_edge(b0, b1);
    let x = f.add_arg(Type::scalar(32));
    // Phi in b1 claiming an incoming from b1 itself, which is not a pred.
    f.add_inst(
      b1,
      InstKind::Phi { incoming: smallvec::smallvec![(x, b1)] },
      Some(Type::scalar(32)),
    );
    f.finish();
    match validate(&f) {
      Err(AnalysisError::PhiIncomingMismatch { .. }) => {}
      other => panic!("expected PhiIncomingMismatch, got {:?}", other.err()),
    }
  }

  #[test]
  fn test_loop_preheader() {
    // b0 -> b1 (preheader) -> b2 (header) <-> b3; b2 -> b4.
    let mut f = Func::new();
    let b0 = f.add_block();
    let b1 = f.add_block();
    let b2 = f.add_block();
    let b3 = f.add_block();
    let b4 = f.add_block();
    f.add_edge(b0, b1);
    f.add_edge(b1, b2);
    f.add_edge(b2, b3);
    f.add_edge(b3, b2);
    f.add_edge(b2, b4);
    f.finish();
    let dt = DomTree::compute(&f);
    let li = LoopInfo::compute(&f, &dt);
    assert!(li.is_header(b2));
    assert!(!li.is_header(b1));
    assert!(li.is_preheader(b1));
    assert!(!li.is_preheader(b0));
    assert!(!li.is_preheader(b3));
    assert_eq!(li.preheader_of(b2), Some(b1));
    assert_eq!(li.preheader_of(b3), None);
  }
}
