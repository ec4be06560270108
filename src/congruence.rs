/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Congruence-class construction for out-of-SSA translation.
//!
//! Phis and their sources are first unioned pessimistically into classes,
//! then a single dominator-tree walk splits out every member whose live
//! range overlaps the member currently dominating it.  What remains are
//! classes whose members can all share one register, so the phis inside
//! them need no copies at all.

use crate::alias::AliasMaps;
use crate::analysis::{validate, AnalysisError, DomTree, LoopInfo};
use crate::data_structures::{BlockIx, Func, InstKind, Map, RegAlign, ValueIx};
use crate::interface::{Divergence, Liveness, Selection, PHI_SRC_USE_THRESHOLD};
use crate::union_find::CongruencePool;
use log::{debug, trace};

pub struct Congruence {
  pool: CongruencePool,
  aliases: AliasMaps,
}

//=============================================================================
// Construction.

impl Congruence {
  pub fn build(
    func: &Func, domtree: &DomTree, loops: &LoopInfo,
    liveness: &mut dyn Liveness, divergence: &dyn Divergence,
    selection: &dyn Selection,
  ) -> Result<Congruence, AnalysisError> {
    validate(func)?;
    debug!("congruence: building for {} blocks", func.blocks.len());

    let aliases = AliasMaps::build(func, domtree, liveness, divergence, selection);
    let mut this = Congruence { pool: CongruencePool::new(), aliases };

    this.union_phis(func, domtree, loops, divergence, selection);
    this.split_interferences(func, domtree, liveness, selection);
    this.split_misaligned(func);
    Ok(this)
  }

  /// Pessimistic pass: union every needed phi with its non-constant
  /// sources.  A source whose SIMD shape disagrees with the phi's is
  /// skipped (not unioned, not punished); a source funnelled over a loop
  /// preheader edge into many header phis is isolated instead.
  fn union_phis(
    &mut self, func: &Func, domtree: &DomTree, loops: &LoopInfo,
    divergence: &dyn Divergence, selection: &dyn Selection,
  ) {
    for &bix in domtree.preorder() {
      let preheader = loops.preheader_of(bix);
      // For loop headers, how many of the header's phis each value feeds
      // over the preheader edge.
      let mut preheader_fanout: Map<ValueIx, usize> = Map::default();
      if let Some(ph) = preheader {
        for &iix in &func.blocks[bix].insts {
          let incoming = match func.insts[iix].kind {
            InstKind::Phi { ref incoming } => incoming,
            _ => continue,
          };
          if !selection.need_inst(iix) {
            continue;
          }
          for &(s, pb) in incoming.iter() {
            if pb == ph && !func.is_const(s) {
              *preheader_fanout.entry(s).or_insert(0) += 1;
            }
          }
        }
      }
      for &iix in &func.blocks[bix].insts {
        let incoming = match func.insts[iix].kind {
          InstKind::Phi { ref incoming } => incoming,
          _ => continue,
        };
        if !selection.need_inst(iix) {
          continue;
        }
        let pd = match func.dest(iix) {
          Some(d) => d,
          None => continue,
        };
        let cd = self.aliases.node_value(pd);
        if self.pool.is_isolated(cd) {
          continue;
        }
        // Aggregates are copied field-by-field by the emitter; giving them
        // a shared register makes no sense.
        if func.ty(pd).is_aggregate() {
          self.pool.isolate(cd);
          continue;
        }
        // A uniform phi sitting at a divergent join may see partial
        // updates from lanes that did not take the edge; if any incoming
        // is a constant or already isolated, the phi mov must stay.
        if divergence.is_uniform(pd)
          && divergence.inside_divergent_cf(bix)
          && incoming.iter().any(|&(s, _)| {
            func.is_const(s) || self.pool.is_isolated(self.aliases.node_value(s))
          })
        {
          debug!("congruence: {:?} at divergent join, isolating", pd);
          self.pool.isolate(cd);
          continue;
        }
        let dep = divergence.which_depend(pd);
        for &(s, pb) in incoming.iter() {
          if func.is_const(s) {
            continue;
          }
          let cs = self.aliases.node_value(s);
          if self.pool.is_isolated(cs) {
            continue;
          }
          // A source feeding many of this loop's header phis from the
          // preheader would drag the whole class's live range across the
          // loop.  Sources that are themselves phis or insert-element
          // chains are exempt; they carry no extra range.
          let guarded = Some(pb) == preheader
            && !is_phi_def(func, s)
            && !is_inselt_def(func, s)
            && preheader_fanout.get(&s).copied().unwrap_or(0)
              >= PHI_SRC_USE_THRESHOLD;
          if divergence.which_depend(cs) == dep && !guarded {
            // No two arguments may ever share a class; each lives in its
            // own ABI location from function entry.
            if self.class_has_arg(func, cs) && self.class_has_arg(func, cd) {
              continue;
            }
            trace!("congruence: union {:?} {:?}", cd, cs);
            self.pool.union(cd, cs);
          }
          if guarded {
            debug!("congruence: preheader source {:?} isolated", cs);
            self.pool.isolate(cs);
          }
        }
      }
    }
  }

  /// The dominator-tree walk of Budimlic et al.: for each class we track
  /// the member whose definition most recently dominated the walk
  /// (CurrentDominatingParent, keyed by class color) together with each
  /// member's ImmediateDominatingParent, and split any member found live
  /// at a later member's definition.
  fn split_interferences(
    &mut self, func: &Func, domtree: &DomTree, liveness: &dyn Liveness,
    selection: &dyn Selection,
  ) {
    let mut cdp: Map<u32, ValueIx> = Map::default();
    let mut idp: Map<ValueIx, ValueIx> = Map::default();

    for &bix in domtree.preorder() {
      for v in self.defs_in_order(func, bix, liveness, selection) {
        let color = self.pool.color_of(v);
        pop_until_dominating(&mut cdp, &idp, color, |cand| {
          !self.pool.is_isolated(cand) && def_dominates(func, domtree, cand, v)
        });
        match cdp.get(&color).copied() {
          None => {
            cdp.insert(color, v);
          }
          Some(parent) => {
            if lives_across_def(func, liveness, parent, v) {
              // The class's parent stays as it was; the overlapping member
              // leaves for good.
              debug!("congruence: isolate {:?} (overlaps {:?})", v, parent);
              self.pool.isolate(v);
            } else {
              idp.insert(v, parent);
              cdp.insert(color, v);
            }
          }
        }
      }
      // Phi uses in successors happen on the edge leaving this block.  Two
      // phis whose destinations share a class but which want different
      // values over the same edge can never both be satisfied without a
      // copy, and a dominating member still live out of this block would
      // be clobbered by the move the phi needs.
      let mut current_phi_for_color: Map<u32, (ValueIx, ValueIx)> =
        Map::default();
      for s in func.blocks[bix].succs.clone() {
        for &iix in &func.blocks[s].insts {
          let incoming = match func.insts[iix].kind {
            InstKind::Phi { ref incoming } => incoming,
            _ => continue,
          };
          if !selection.need_inst(iix) {
            continue;
          }
          let pd = match func.dest(iix) {
            Some(d) => self.aliases.node_value(d),
            None => continue,
          };
          if self.pool.node_of(pd).is_none() || self.pool.is_isolated(pd) {
            continue;
          }
          let pred_value = match incoming.iter().find(|&&(_, pb)| pb == bix) {
            Some(&(v, _)) => self.aliases.node_value(v),
            None => continue,
          };
          let color = self.pool.color_of(pd);
          match current_phi_for_color.get(&color) {
            Some(&(_, pv)) if pv != pred_value => {
              // One storage location cannot hold both values on this edge.
              debug!(
                "congruence: isolate phi {:?} (edge conflict at {:?})",
                pd, bix
              );
              self.pool.isolate(pd);
              continue;
            }
            Some(_) => {}
            None => {
              current_phi_for_color.insert(color, (pd, pred_value));
            }
          }
          pop_until_dominating(&mut cdp, &idp, color, |cand| {
            !self.pool.is_isolated(cand)
              && def_dominates_block_end(func, domtree, cand, bix)
          });
          if let Some(parent) = cdp.get(&color).copied() {
            if parent != pred_value && liveness.is_live_out(parent, bix) {
              // The move the phi needs on this edge would overwrite the
              // member while it is still in use downstream.
              debug!("congruence: isolate {:?} (live out of {:?})", parent, bix);
              self.pool.isolate(parent);
            }
          }
        }
      }
    }
  }

  /// Values defined in |bix| that own a congruence node, in forward
  /// liveness-distance order.  Arguments count as defined at the top of
  /// the entry block.
  fn defs_in_order(
    &mut self, func: &Func, bix: BlockIx, liveness: &dyn Liveness,
    selection: &dyn Selection,
  ) -> Vec<ValueIx> {
    let mut defs: Vec<(u32, ValueIx)> = Vec::new();
    if bix == func.entry {
      for &a in &func.args {
        if self.owns_node(a) {
          defs.push((0, a));
        }
      }
    }
    for &iix in &func.blocks[bix].insts {
      if !selection.need_inst(iix) {
        continue;
      }
      if let Some(d) = func.dest(iix) {
        if self.owns_node(d) {
          defs.push((liveness.distance(iix), d));
        }
      }
    }
    defs.sort_by_key(|&(dist, _)| dist);
    defs.into_iter().map(|(_, v)| v).collect()
  }

  fn class_has_arg(&self, func: &Func, v: ValueIx) -> bool {
    func.is_arg(v)
      || self.pool.class_members(v).iter().any(|&m| func.is_arg(m))
  }

  fn owns_node(&self, v: ValueIx) -> bool {
    self.aliases.node_value(v) == v
      && self.pool.node_of(v).is_some()
      && !self.pool.is_isolated(v)
  }

  /// Classes mixing block-aligned and packed members cannot share one
  /// register start; the packed members leave.
  fn split_misaligned(&mut self, func: &Func) {
    let mut classes: Map<ValueIx, Vec<ValueIx>> = Map::default();
    for v in func.values.range() {
      if self.aliases.node_value(v) != v {
        continue;
      }
      if let Some(root) = self.pool.leader_value(v) {
        classes.entry(root).or_insert_with(Vec::new).push(v);
      }
    }
    for (_, members) in classes {
      if !members.iter().any(|&m| func.align(m) == RegAlign::Block) {
        continue;
      }
      for &m in &members {
        if func.align(m) == RegAlign::Packed {
          debug!("congruence: alignment split {:?}", m);
          self.pool.isolate(m);
        }
      }
    }
  }
}

//=============================================================================
// Queries.  These are what the emitter and the payload allocator consume.

impl Congruence {
  /// The class representative for |v|, or None when |v| is isolated or was
  /// never placed in a class.
  pub fn root_value(&self, v: ValueIx) -> Option<ValueIx> {
    let cv = self.aliases.node_value(v);
    if self.pool.is_isolated(cv) {
      return None;
    }
    self.pool.leader_value(cv)
  }

  pub fn is_isolated(&self, v: ValueIx) -> bool {
    self.pool.is_isolated(self.aliases.node_value(v))
  }

  /// Every canonical value congruent to |v| (including |v|'s canonical
  /// form itself).
  pub fn all_values_in_class(&self, v: ValueIx) -> Vec<ValueIx> {
    self.pool.class_members(self.aliases.node_value(v))
  }

  /// Would giving |a| and |b| the same storage be illegal?  Congruent
  /// values never interfere; everything else defers to liveness.
  pub fn interfere(
    &self, liveness: &dyn Liveness, a: ValueIx, b: ValueIx,
  ) -> bool {
    let ca = self.aliases.node_value(a);
    let cb = self.aliases.node_value(b);
    if ca == cb || self.pool.same_class_const(ca, cb) {
      return false;
    }
    liveness.has_interference(ca, cb)
  }

  /// Like |interfere|, but resolves only through the alias map.  Used when
  /// the caller is deciding whether an aliaser can be re-rooted.
  pub fn alias_interfere(
    &self, liveness: &dyn Liveness, a: ValueIx, b: ValueIx,
  ) -> bool {
    let ca = self.aliases.aliasee(a);
    let cb = self.aliases.aliasee(b);
    if ca == cb {
      return false;
    }
    liveness.has_interference(ca, cb)
  }

  /// True when no other value shares |v|'s storage.
  pub fn is_single_valued(&self, v: ValueIx) -> bool {
    self.aliases.node_value(v) == v
      && !self.aliases.is_aliasee(v)
      && self.pool.is_single_valued(v)
  }

  /// Does this pass consider |v| coalesced with anything at all?
  pub fn is_coalesced(&self, v: ValueIx) -> bool {
    !self.is_single_valued(v) || self.aliases.is_aliaser(v)
  }

  pub fn same_class(&self, a: ValueIx, b: ValueIx) -> bool {
    let ca = self.aliases.node_value(a);
    let cb = self.aliases.node_value(b);
    ca == cb || self.pool.same_class_const(ca, cb)
  }

  /// Alignment preferences that cannot coexist in one class.
  pub fn alignment_interfere(&self, func: &Func, a: ValueIx, b: ValueIx) -> bool {
    let aa = func.align(self.aliases.node_value(a));
    let ab = func.align(self.aliases.node_value(b));
    (aa == RegAlign::Block && ab == RegAlign::Packed)
      || (aa == RegAlign::Packed && ab == RegAlign::Block)
  }

  pub fn aliases(&self) -> &AliasMaps {
    &self.aliases
  }
}

//=============================================================================
// Dominance helpers.

fn is_phi_def(func: &Func, v: ValueIx) -> bool {
  func.def_inst(v).map_or(false, |i| func.insts[i].is_phi())
}

fn is_inselt_def(func: &Func, v: ValueIx) -> bool {
  func.def_inst(v).map_or(false, |i| {
    matches!(func.insts[i].kind, InstKind::InsertElement { .. })
  })
}

/// Does the definition point of |a| dominate the definition point of |b|?
/// Arguments and constants are defined before everything.
fn def_dominates(func: &Func, domtree: &DomTree, a: ValueIx, b: ValueIx) -> bool {
  let ia = match func.def_inst(a) {
    Some(i) => i,
    None => return true,
  };
  let ib = match func.def_inst(b) {
    Some(i) => i,
    None => return false,
  };
  let (ba, bb) = (func.insts[ia].block, func.insts[ib].block);
  if ba == bb {
    func.precedes(ia, ib)
  } else {
    domtree.dominates(ba, bb)
  }
}

/// Does the definition point of |a| dominate the end of block |b|?
fn def_dominates_block_end(
  func: &Func, domtree: &DomTree, a: ValueIx, b: BlockIx,
) -> bool {
  match func.def_block(a) {
    None => true,
    Some(ba) => domtree.dominates(ba, b),
  }
}

/// Pop the dominating-parent chain for |color| until its top passes the
/// dominance test (or the chain empties).
fn pop_until_dominating<F: Fn(ValueIx) -> bool>(
  cdp: &mut Map<u32, ValueIx>, idp: &Map<ValueIx, ValueIx>, color: u32,
  dominates: F,
) {
  while let Some(&top) = cdp.get(&color) {
    if dominates(top) {
      return;
    }
    match idp.get(&top) {
      Some(&up) => {
        cdp.insert(color, up);
      }
      None => {
        cdp.remove(&color);
        return;
      }
    }
  }
}

/// Is |parent| still live when |v| is defined?  That is the overlap the
/// dominator walk splits on.
fn lives_across_def(
  func: &Func, liveness: &dyn Liveness, parent: ValueIx, v: ValueIx,
) -> bool {
  match func.def_inst(v) {
    Some(i) => liveness.is_live_at(parent, i),
    // Two class members both defined at entry.
    None => liveness.has_interference(parent, v),
  }
}
