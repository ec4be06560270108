/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Test-only oracle.  Implements every client-supplied trait with a small
//! reference liveness computation (per-value backward walk, phi uses on the
//! predecessor edge) plus table-driven divergence, selection and payload
//! geometry that tests override per case.

use crate::data_structures::{BlockIx, Func, InstIx, InstKind, Map, Set, ValueIx};
use crate::interface::{
  Dependency, Divergence, Liveness, PayloadLayout, Selection,
};

#[derive(Clone)]
pub struct TestOracle {
  distance: Map<InstIx, u32>,
  // v -> instructions v is live when entering.
  live_in: Map<ValueIx, Set<InstIx>>,
  // v -> blocks v is live out of.
  live_out: Map<ValueIx, Set<BlockIx>>,
  next_inst: Map<InstIx, InstIx>,
  inst_block: Map<InstIx, BlockIx>,
  def_inst: Map<ValueIx, InstIx>,
  args: Set<ValueIx>,
  consts: Set<ValueIx>,
  used: Set<ValueIx>,
  payload: Map<InstIx, Vec<ValueIx>>,
  dep: Map<ValueIx, Dependency>,
  divergent_blocks: Set<BlockIx>,
  dead_insts: Set<InstIx>,
  split_disallowed: Set<InstIx>,
  peel_first: Set<InstIx>,
  non_homogeneous: Set<InstIx>,
}

impl TestOracle {
  pub fn new(func: &Func) -> TestOracle {
    let _ = pretty_env_logger::try_init();
    let mut this = TestOracle {
      distance: Map::default(),
      live_in: Map::default(),
      live_out: Map::default(),
      next_inst: Map::default(),
      inst_block: Map::default(),
      def_inst: Map::default(),
      args: Set::default(),
      consts: Set::default(),
      used: Set::default(),
      payload: Map::default(),
      dep: Map::default(),
      divergent_blocks: Set::default(),
      dead_insts: Set::default(),
      split_disallowed: Set::default(),
      peel_first: Set::default(),
      non_homogeneous: Set::default(),
    };
    let mut counter = 0u32;
    for bix in func.blocks.range() {
      let insts = &func.blocks[bix].insts;
      for (k, &iix) in insts.iter().enumerate() {
        this.distance.insert(iix, counter);
        counter += 1;
        this.inst_block.insert(iix, bix);
        if k + 1 < insts.len() {
          this.next_inst.insert(iix, insts[k + 1]);
        }
        if let InstKind::Send { ref args } = func.insts[iix].kind {
          this.payload.insert(iix, args.iter().copied().collect());
        }
      }
    }
    for v in func.values.range() {
      if let Some(d) = func.def_inst(v) {
        this.def_inst.insert(v, d);
      }
      if func.is_arg(v) {
        this.args.insert(v);
      }
      if func.is_const(v) {
        this.consts.insert(v);
      }
      if !func.uses(v).is_empty() {
        this.used.insert(v);
      }
      this.compute_liveness(func, v);
    }
    this
  }

  fn compute_liveness(&mut self, func: &Func, v: ValueIx) {
    if func.is_const(v) {
      return;
    }
    let def = func.def_inst(v);
    let mut live_in = Set::default();
    let mut live_out = Set::default();
    // Blocks v is live out of, still to be walked backwards.
    let mut stack: Vec<BlockIx> = Vec::new();
    for &u in func.uses(v) {
      if let InstKind::Phi { ref incoming } = func.insts[u].kind {
        // A phi reads its operand on the incoming edge.
        for &(iv, pb) in incoming {
          if iv == v && live_out.insert(pb) {
            stack.push(pb);
          }
        }
      } else {
        let ub = func.insts[u].block;
        let upos = func.insts[u].pos as usize;
        Self::walk_block_back(
          func, v, def, ub, upos, &mut live_in, &mut live_out, &mut stack,
        );
      }
    }
    while let Some(b) = stack.pop() {
      let last = func.blocks[b].insts.len();
      if last == 0 {
        for &p in &func.blocks[b].preds {
          if live_out.insert(p) {
            stack.push(p);
          }
        }
        continue;
      }
      Self::walk_block_back(
        func, v, def, b, last - 1, &mut live_in, &mut live_out, &mut stack,
      );
    }
    self.live_in.insert(v, live_in);
    self.live_out.insert(v, live_out);
  }

  // Mark v live entering every instruction of |b| at positions ..=upto,
  // stopping at the definition; falling off the top propagates to the
  // predecessors.
  fn walk_block_back(
    func: &Func, _v: ValueIx, def: Option<InstIx>, b: BlockIx, upto: usize,
    live_in: &mut Set<InstIx>, live_out: &mut Set<BlockIx>,
    stack: &mut Vec<BlockIx>,
  ) {
    for &i in func.blocks[b].insts[..=upto].iter().rev() {
      if Some(i) == def {
        return;
      }
      live_in.insert(i);
    }
    for &p in &func.blocks[b].preds {
      if live_out.insert(p) {
        stack.push(p);
      }
    }
  }

  // Is x live just after instruction |i|?
  fn live_out_of_inst(&self, x: ValueIx, i: InstIx) -> bool {
    match self.next_inst.get(&i) {
      Some(n) => self
        .live_in
        .get(&x)
        .map(|s| s.contains(n))
        .unwrap_or(false),
      None => self
        .live_out
        .get(&x)
        .map(|s| s.contains(&self.inst_block[&i]))
        .unwrap_or(false),
    }
  }

  // Is y's definition point inside x's live range?
  fn born_within(&self, x: ValueIx, y: ValueIx) -> bool {
    match self.def_inst.get(&y) {
      Some(&iy) => self.live_out_of_inst(x, iy),
      // y is an argument, born at function entry; only another live
      // argument covers that point.
      None => self.args.contains(&x) && self.used.contains(&x),
    }
  }

  pub fn set_dependency(&mut self, v: ValueIx, d: Dependency) {
    self.dep.insert(v, d);
  }
  pub fn set_divergent_block(&mut self, b: BlockIx) {
    self.divergent_blocks.insert(b);
  }
  pub fn set_dead(&mut self, i: InstIx) {
    self.dead_insts.insert(i);
  }
  pub fn disallow_split(&mut self, i: InstIx) {
    self.split_disallowed.insert(i);
  }
  pub fn set_peel_first(&mut self, i: InstIx) {
    self.peel_first.insert(i);
  }
  pub fn set_non_homogeneous(&mut self, i: InstIx) {
    self.non_homogeneous.insert(i);
  }
}

impl Liveness for TestOracle {
  fn distance(&self, i: InstIx) -> u32 {
    self.distance[&i]
  }

  fn is_live_at(&self, v: ValueIx, at: InstIx) -> bool {
    self.live_in.get(&v).map(|s| s.contains(&at)).unwrap_or(false)
  }

  fn is_live_out(&self, v: ValueIx, b: BlockIx) -> bool {
    self.live_out.get(&v).map(|s| s.contains(&b)).unwrap_or(false)
  }

  fn has_interference(&self, a: ValueIx, b: ValueIx) -> bool {
    if a == b || self.consts.contains(&a) || self.consts.contains(&b) {
      return false;
    }
    self.born_within(a, b) || self.born_within(b, a)
  }

  fn merge_use_from(&mut self, into: ValueIx, from: ValueIx) {
    let from_in = self.live_in.get(&from).cloned().unwrap_or_default();
    let from_out = self.live_out.get(&from).cloned().unwrap_or_default();
    self.live_in.entry(into).or_default().extend(from_in);
    self.live_out.entry(into).or_default().extend(from_out);
  }
}

impl Divergence for TestOracle {
  fn which_depend(&self, v: ValueIx) -> Dependency {
    *self.dep.get(&v).unwrap_or(&Dependency::Random)
  }
  fn inside_divergent_cf(&self, b: BlockIx) -> bool {
    self.divergent_blocks.contains(&b)
  }
}

impl Selection for TestOracle {
  fn need_inst(&self, i: InstIx) -> bool {
    !self.dead_insts.contains(&i)
  }
}

impl PayloadLayout for TestOracle {
  fn num_payload_elements(&self, i: InstIx) -> usize {
    self.payload.get(&i).map(|p| p.len()).unwrap_or(0)
  }
  fn payload_element(&self, i: InstIx, slot: usize) -> ValueIx {
    self.payload[&i][slot]
  }
  fn has_non_homogeneous_elements(&self, i: InstIx) -> bool {
    self.non_homogeneous.contains(&i)
  }
  fn allows_split(&self, i: InstIx) -> bool {
    !self.split_disallowed.contains(&i)
  }
  fn peel_first_element(&self, i: InstIx) -> bool {
    self.peel_first.contains(&i)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::data_structures::Type;
  use smallvec::smallvec;

  #[test]
  fn test_straight_line_liveness() {
    let mut f = Func::new();
    let b0 = f.add_block();
    let a = f.add_arg(Type::scalar(32));
    let i0 = f.add_inst(
      b0,
      InstKind::Def { args: smallvec![a] },
      Some(Type::scalar(32)),
    );
    let x = f.dest(i0).unwrap();
    let i1 = f.add_inst(
      b0,
      InstKind::Def { args: smallvec![a] },
      Some(Type::scalar(32)),
    );
    let y = f.dest(i1).unwrap();
    let i2 = f.add_inst(b0, InstKind::Send { args: smallvec![x] }, None);
    f.finish();

    let orc = TestOracle::new(&f);
    // x live across i1 and entering i2.
    assert!(orc.is_live_at(x, i1));
    assert!(orc.is_live_at(x, i2));
    assert!(!orc.is_live_at(x, i0));
    // y is dead.
    assert!(!orc.is_live_at(y, i2));
    // x live when y is born: they interfere.
    assert!(orc.has_interference(x, y));
    assert!(orc.distance(i0) < orc.distance(i1));
  }

  #[test]
  fn test_phi_use_is_on_the_edge() {
    let mut f = Func::new();
    let b0 = f.add_block();
    let b1 = f.add_block();
    let b2 = f.add_block();
    f.add_edge(b0, b1);
    f.add_edge(b0, b2);
    f.add_edge(b1, b2);
    let a = f.add_arg(Type::scalar(32));
    let i0 = f.add_inst(
      b0,
      InstKind::Def { args: smallvec![a] },
      Some(Type::scalar(32)),
    );
    let x = f.dest(i0).unwrap();
    let i1 = f.add_inst(
      b1,
      InstKind::Def { args: smallvec![a] },
      Some(Type::scalar(32)),
    );
    let y = f.dest(i1).unwrap();
    let ip = f.add_inst(
      b2,
      InstKind::Phi { incoming: smallvec![(x, b0), (y, b1)] },
      Some(Type::scalar(32)),
    );
    let p = f.dest(ip).unwrap();
    f.add_inst(b2, InstKind::Send { args: smallvec![p] }, None);
    f.finish();

    let orc = TestOracle::new(&f);
    // x flows to the phi only along b0 -> b2; it is not live in b1.
    assert!(orc.is_live_out(x, b0));
    assert!(!orc.is_live_at(x, i1));
    assert!(!orc.is_live_at(x, ip));
    assert!(orc.is_live_out(y, b1));
    // Disjoint paths: no interference.
    assert!(!orc.has_interference(x, y));
  }

  #[test]
  fn test_loop_liveness_wraps_around() {
    // b0 -> b1 <-> b2, b1 -> b3.  x defined in b0, used in b2: live
    // through b1 and the back edge.
    let mut f = Func::new();
    let b0 = f.add_block();
    let b1 = f.add_block();
    let b2 = f.add_block();
    let b3 = f.add_block();
    f.add_edge(b0, b1);
    f.add_edge(b1, b2);
    f.add_edge(b2, b1);
    f.add_edge(b1, b3);
    let a = f.add_arg(Type::scalar(32));
    let i0 = f.add_inst(
      b0,
      InstKind::Def { args: smallvec![a] },
      Some(Type::scalar(32)),
    );
    let x = f.dest(i0).unwrap();
    let i1 = f.add_inst(
      b1,
      InstKind::Def { args: smallvec![a] },
      Some(Type::scalar(32)),
    );
    let y = f.dest(i1).unwrap();
    let iu = f.add_inst(b2, InstKind::Send { args: smallvec![x, y] }, None);
    f.finish();

    let orc = TestOracle::new(&f);
    assert!(orc.is_live_out(x, b0));
    assert!(orc.is_live_out(x, b1));
    // Live around the back edge too.
    assert!(orc.is_live_out(x, b2));
    assert!(orc.is_live_at(x, i1));
    assert!(orc.is_live_at(x, iu));
    assert!(orc.has_interference(x, y));
  }
}
