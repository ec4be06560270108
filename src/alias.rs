/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Alias coalescing: values that are guaranteed to occupy the same storage
//! without any copy are recorded here, before congruence classes are built.
//! Three families qualify:
//!
//! * insert-element chains growing a vector from undef, one lane at a time;
//! * insert-value chains filling disjoint fields of an aggregate;
//! * no-op casts (bit reinterpretations of the same width).
//!
//! The maps are flat: an aliaser points directly at its root, never at
//! another aliaser.

use crate::analysis::DomTree;
use crate::data_structures::{Func, InstIx, InstKind, Map, Set, ValueIx, ValueKind};
use crate::interface::{Divergence, Liveness, Selection};
use log::debug;

pub struct AliasMaps {
  // aliaser -> root.  Roots are not present as keys.
  alias: Map<ValueIx, ValueIx>,
  // Roots that have at least one aliaser.
  aliasees: Set<ValueIx>,
  // insert-element chain member -> chain head.  Used for values that write
  // lanes of a vector already live in a register.
  inselt: Map<ValueIx, ValueIx>,
  // Aliasers with no materialized code at all (casts).  Their defining
  // instruction disappears entirely once storage is shared.
  noop_aliasers: Set<ValueIx>,
}

impl AliasMaps {
  /// Resolve |v| through the alias map.  Roots (and unaliased values)
  /// resolve to themselves.
  pub fn aliasee(&self, v: ValueIx) -> ValueIx {
    match self.alias.get(&v) {
      Some(&root) => {
        debug_assert!(!self.alias.contains_key(&root));
        root
      }
      None => v,
    }
  }

  pub fn inselt_root(&self, v: ValueIx) -> ValueIx {
    *self.inselt.get(&v).unwrap_or(&v)
  }

  /// Canonical congruence-node value for |v|.
  pub fn node_value(&self, v: ValueIx) -> ValueIx {
    self.inselt_root(self.aliasee(v))
  }

  pub fn is_aliaser(&self, v: ValueIx) -> bool {
    self.alias.contains_key(&v)
  }

  pub fn is_aliasee(&self, v: ValueIx) -> bool {
    self.aliasees.contains(&v)
  }

  pub fn is_noop_aliaser(&self, v: ValueIx) -> bool {
    self.noop_aliasers.contains(&v)
  }

  fn record_alias(
    &mut self, aliaser: ValueIx, root: ValueIx, liveness: &mut dyn Liveness,
  ) {
    debug_assert!(aliaser != root);
    debug_assert!(!self.alias.contains_key(&root));
    debug!("alias: {:?} -> {:?}", aliaser, root);
    self.alias.insert(aliaser, root);
    self.aliasees.insert(root);
    liveness.merge_use_from(root, aliaser);
  }

  pub fn build(
    func: &Func, domtree: &DomTree, liveness: &mut dyn Liveness,
    divergence: &dyn Divergence, selection: &dyn Selection,
  ) -> AliasMaps {
    let mut maps = AliasMaps {
      alias: Map::default(),
      aliasees: Set::default(),
      inselt: Map::default(),
      noop_aliasers: Set::default(),
    };
    // Fields already written per insert-value root, for the disjointness
    // check when merging sibling chains.
    let mut iv_fields: Map<ValueIx, Set<u32>> = Map::default();

    for &bix in domtree.preorder() {
      for &iix in &func.blocks[bix].insts {
        if !selection.need_inst(iix) {
          continue;
        }
        match func.insts[iix].kind {
          InstKind::InsertElement { vec, lane, .. } => {
            let vec_is_undef =
              func.values[vec].kind == ValueKind::Undef;
            if lane.is_none() || !vec_is_undef {
              continue;
            }
            maps.coalesce_undef_chain(func, iix, divergence, selection, liveness);
          }
          InstKind::InsertValue { agg, field, .. } => {
            maps.coalesce_insert_value(
              func, iix, agg, field, &mut iv_fields, liveness,
            );
          }
          InstKind::Cast { src } => {
            maps.coalesce_cast(func, iix, src, divergence, liveness);
          }
          _ => {}
        }
      }
    }

    // Second sweep: insert-elements writing into an already-live vector.
    // These cannot alias (the old vector value may still be read), but when
    // the source dies at the insert, the whole chain can share one node.
    for &bix in domtree.preorder() {
      for &iix in &func.blocks[bix].insts {
        if !selection.need_inst(iix) {
          continue;
        }
        if let InstKind::InsertElement { vec, lane: Some(_), .. } =
          func.insts[iix].kind
        {
          let dest = match func.dest(iix) {
            Some(d) => d,
            None => continue,
          };
          if maps.is_aliaser(dest) || func.is_const(vec) {
            continue;
          }
          let src = maps.aliasee(vec);
          if divergence.which_depend(dest) != divergence.which_depend(src) {
            continue;
          }
          // Safe only if the incoming vector dies right here.
          if liveness.has_interference(dest, src) {
            continue;
          }
          let root = maps.inselt_root(src);
          debug!("inselt chain: {:?} -> {:?}", dest, root);
          maps.inselt.insert(dest, root);
          liveness.merge_use_from(root, dest);
        }
      }
    }
    maps
  }

  /// Starting at an insert-element into undef, follow the single-use chain
  /// of constant-lane inserts and alias every later link to the head.
  fn coalesce_undef_chain(
    &mut self, func: &Func, head: InstIx,
    divergence: &dyn Divergence, selection: &dyn Selection,
    liveness: &mut dyn Liveness,
  ) {
    let root = match func.dest(head) {
      Some(d) => d,
      None => return,
    };
    let dep = divergence.which_depend(root);
    let mut cur = root;
    loop {
      if !func.has_one_use(cur) {
        break;
      }
      let user = func.uses(cur)[0];
      if !selection.need_inst(user) {
        break;
      }
      let next = match func.insts[user].kind {
        InstKind::InsertElement { vec, lane: Some(_), .. } if vec == cur => {
          match func.dest(user) {
            Some(d) => d,
            None => break,
          }
        }
        _ => break,
      };
      if divergence.which_depend(next) != dep {
        break;
      }
      self.record_alias(next, root, liveness);
      cur = next;
    }
  }

  /// Insert-value chains.  Unlike vectors, aggregates only ever grow by
  /// whole-field writes, so we can merge sibling chains too, as long as
  /// their written field sets stay disjoint.
  fn coalesce_insert_value(
    &mut self, func: &Func, iix: InstIx, agg: ValueIx,
    field: u32, iv_fields: &mut Map<ValueIx, Set<u32>>,
    liveness: &mut dyn Liveness,
  ) {
    let dest = match func.dest(iix) {
      Some(d) => d,
      None => return,
    };
    if let ValueKind::Undef = func.values[agg].kind {
      // A fresh chain root.
      let mut fields = Set::default();
      fields.insert(field);
      iv_fields.insert(dest, fields);
      return;
    }
    let root = self.aliasee(agg);
    if let Some(fields) = iv_fields.get_mut(&root) {
      if !fields.contains(&field) {
        fields.insert(field);
        self.record_alias(dest, root, liveness);
        return;
      }
    }
    // Overwriting a field, or building on an unknown aggregate: this
    // insert starts a class of its own.
    let mut fields = Set::default();
    fields.insert(field);
    iv_fields.insert(dest, fields);
  }

  /// A same-width cast produces no code once its result shares storage with
  /// its source.
  fn coalesce_cast(
    &mut self, func: &Func, iix: InstIx, src: ValueIx,
    divergence: &dyn Divergence, liveness: &mut dyn Liveness,
  ) {
    let dest = match func.dest(iix) {
      Some(d) => d,
      None => return,
    };
    if func.is_const(src) {
      return;
    }
    if divergence.which_depend(dest) != divergence.which_depend(src) {
      return;
    }
    let noop = func.ty(dest).total_bits() == func.ty(src).total_bits();
    // Uniform narrowing reads the low part of the source in place; any
    // other width change needs a real mov.
    let uniform_narrow = divergence.is_uniform(dest)
      && func.ty(dest).total_bits() < func.ty(src).total_bits();
    if !noop && !uniform_narrow {
      return;
    }
    let root = self.aliasee(src);
    if root == dest {
      return;
    }
    self.record_alias(dest, root, liveness);
    if noop {
      self.noop_aliasers.insert(dest);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::analysis::DomTree;
  use crate::data_structures::{BlockIx, Func, InstKind, Type};
  use crate::test_framework::TestOracle;
  use smallvec::smallvec;

  fn straight_line() -> (Func, BlockIx) {
    let mut f = Func::new();
    let b0 = f.add_block();
    (f, b0)
  }

  #[test]
  fn test_undef_chain_aliases_to_head() {
    let (mut f, b0) = straight_line();
    let vty = Type::vector(32, 4);
    let undef = f.add_undef(vty);
    let e0 = f.add_arg(Type::scalar(32));
    let e1 = f.add_arg(Type::scalar(32));
    let i0 = f.add_inst(
      b0,
      InstKind::InsertElement { vec: undef, elt: e0, lane: Some(0) },
      Some(vty),
    );
    let v0 = f.dest(i0).unwrap();
    let i1 = f.add_inst(
      b0,
      InstKind::InsertElement { vec: v0, elt: e1, lane: Some(1) },
      Some(vty),
    );
    let v1 = f.dest(i1).unwrap();
    f.add_inst(b0, InstKind::Send { args: smallvec![v1] }, None);
    f.finish();

    let dt = DomTree::compute(&f);
    let orc = TestOracle::new(&f);
    let maps = AliasMaps::build(&f, &dt, &mut orc.clone(), &orc, &orc);
    assert_eq!(maps.aliasee(v1), v0);
    assert_eq!(maps.aliasee(v0), v0);
    assert!(maps.is_aliaser(v1));
    assert!(maps.is_aliasee(v0));
    assert!(!maps.is_noop_aliaser(v1));
    assert_eq!(maps.node_value(v1), v0);
    // No chains: resolving twice changes nothing.
    assert_eq!(maps.aliasee(maps.aliasee(v1)), maps.aliasee(v1));
  }

  #[test]
  fn test_multi_use_link_stops_chain() {
    let (mut f, b0) = straight_line();
    let vty = Type::vector(32, 2);
    let undef = f.add_undef(vty);
    let e = f.add_arg(Type::scalar(32));
    let i0 = f.add_inst(
      b0,
      InstKind::InsertElement { vec: undef, elt: e, lane: Some(0) },
      Some(vty),
    );
    let v0 = f.dest(i0).unwrap();
    let i1 = f.add_inst(
      b0,
      InstKind::InsertElement { vec: v0, elt: e, lane: Some(1) },
      Some(vty),
    );
    let v1 = f.dest(i1).unwrap();
    // Second use of v0 keeps it alive past i1, so v1 must not alias it.
    f.add_inst(b0, InstKind::Send { args: smallvec![v0, v1] }, None);
    f.finish();

    let dt = DomTree::compute(&f);
    let orc = TestOracle::new(&f);
    let maps = AliasMaps::build(&f, &dt, &mut orc.clone(), &orc, &orc);
    assert!(!maps.is_aliaser(v1));
    assert_eq!(maps.aliasee(v1), v1);
  }

  #[test]
  fn test_noop_cast_aliases() {
    let (mut f, b0) = straight_line();
    let x = f.add_arg(Type::scalar(32));
    let i0 = f.add_inst(b0, InstKind::Cast { src: x }, Some(Type::scalar(32)));
    let c = f.dest(i0).unwrap();
    f.add_inst(b0, InstKind::Send { args: smallvec![c] }, None);
    f.finish();

    let dt = DomTree::compute(&f);
    let mut orc = TestOracle::new(&f);
    orc.set_dependency(x, crate::interface::Dependency::Uniform);
    orc.set_dependency(c, crate::interface::Dependency::Uniform);
    let maps = AliasMaps::build(&f, &dt, &mut orc.clone(), &orc, &orc);
    assert!(maps.is_aliaser(c));
    assert!(maps.is_aliasee(x));
    assert!(maps.is_noop_aliaser(c));
    assert_eq!(maps.aliasee(c), x);
  }

  #[test]
  fn test_uniform_narrowing_cast_aliases_without_noop() {
    let (mut f, b0) = straight_line();
    let x = f.add_arg(Type::scalar(64));
    let i0 = f.add_inst(b0, InstKind::Cast { src: x }, Some(Type::scalar(32)));
    let c = f.dest(i0).unwrap();
    f.add_inst(b0, InstKind::Send { args: smallvec![c] }, None);
    f.finish();

    let dt = DomTree::compute(&f);
    let mut orc = TestOracle::new(&f);
    orc.set_dependency(x, crate::interface::Dependency::Uniform);
    orc.set_dependency(c, crate::interface::Dependency::Uniform);
    let maps = AliasMaps::build(&f, &dt, &mut orc.clone(), &orc, &orc);
    assert_eq!(maps.aliasee(c), x);
    // The narrowed result still reads only part of x, so the cast is an
    // alias but not a no-op.
    assert!(!maps.is_noop_aliaser(c));
  }

  #[test]
  fn test_width_changing_cast_does_not_alias() {
    let (mut f, b0) = straight_line();
    let x = f.add_arg(Type::scalar(64));
    let i0 = f.add_inst(b0, InstKind::Cast { src: x }, Some(Type::scalar(32)));
    let c = f.dest(i0).unwrap();
    f.add_inst(b0, InstKind::Send { args: smallvec![c] }, None);
    f.finish();

    let dt = DomTree::compute(&f);
    let orc = TestOracle::new(&f);
    let maps = AliasMaps::build(&f, &dt, &mut orc.clone(), &orc, &orc);
    assert!(!maps.is_aliaser(c));
  }

  #[test]
  fn test_insert_value_disjoint_fields_merge() {
    let (mut f, b0) = straight_line();
    let aty = Type::Aggregate { fields: 3 };
    let undef = f.add_undef(aty);
    let x = f.add_arg(Type::scalar(32));
    let i0 = f.add_inst(
      b0,
      InstKind::InsertValue { agg: undef, elt: x, field: 0 },
      Some(aty),
    );
    let a0 = f.dest(i0).unwrap();
    let i1 = f.add_inst(
      b0,
      InstKind::InsertValue { agg: a0, elt: x, field: 1 },
      Some(aty),
    );
    let a1 = f.dest(i1).unwrap();
    // Sibling building on a0 again, but writing a new field: still merges.
    let i2 = f.add_inst(
      b0,
      InstKind::InsertValue { agg: a0, elt: x, field: 2 },
      Some(aty),
    );
    let a2 = f.dest(i2).unwrap();
    // Overwrites field 1: must start its own class.
    let i3 = f.add_inst(
      b0,
      InstKind::InsertValue { agg: a1, elt: x, field: 1 },
      Some(aty),
    );
    let a3 = f.dest(i3).unwrap();
    f.add_inst(b0, InstKind::Send { args: smallvec![a2, a3] }, None);
    f.finish();

    let dt = DomTree::compute(&f);
    let orc = TestOracle::new(&f);
    let maps = AliasMaps::build(&f, &dt, &mut orc.clone(), &orc, &orc);
    assert_eq!(maps.aliasee(a1), a0);
    assert_eq!(maps.aliasee(a2), a0);
    assert_eq!(maps.aliasee(a3), a3);
  }

  #[test]
  fn test_dying_source_joins_inselt_chain() {
    let (mut f, b0) = straight_line();
    let vty = Type::vector(32, 4);
    let w = f.add_arg(vty);
    let e = f.add_arg(Type::scalar(32));
    // Writes a lane of w; w has no later use, so dest can share w's node.
    let i0 = f.add_inst(
      b0,
      InstKind::InsertElement { vec: w, elt: e, lane: Some(2) },
      Some(vty),
    );
    let v0 = f.dest(i0).unwrap();
    f.add_inst(b0, InstKind::Send { args: smallvec![v0] }, None);
    f.finish();

    let dt = DomTree::compute(&f);
    let orc = TestOracle::new(&f);
    let maps = AliasMaps::build(&f, &dt, &mut orc.clone(), &orc, &orc);
    assert_eq!(maps.inselt_root(v0), w);
    assert_eq!(maps.node_value(v0), w);
  }
}
