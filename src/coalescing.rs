/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Payload tuple allocation.  Send-like instructions read their operands
//! from a contiguous run of registers (the payload); if the operands can be
//! made to live in the right slots to begin with, the movs that would
//! otherwise assemble the payload disappear.  A CCTuple is such a run:
//! element nodes pinned at integer offsets, shared by every send that
//! anchors into it.
//!
//! Values sharing a slot form a small union-find class of their own, with
//! a dominating-parent chain (the same bookkeeping the congruence pass
//! uses, but keyed per slot) deciding when a newcomer may join, when the
//! holder must be displaced, and when a later send has to fall back to
//! assembling its payload with movs.
//!
//! Payload instructions are visited per block in reverse program order, so
//! a send seen later anchors into the tuples of the sends below it.

use crate::analysis::DomTree;
use crate::congruence::Congruence;
use crate::data_structures::{Func, InstIx, Map, Set, ValueIx};
use crate::interface::{
  Divergence, Liveness, PayloadLayout, Selection, EVICTION_WEIGHT_CUTOFF,
  MAX_TUPLE_SIZE, MAX_USE_COUNT, MIN_TUPLE_OPERANDS,
};
use log::{debug, trace};
use std::fmt;

//=============================================================================
// Indices.

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CCTupleIx(u32);

impl CCTupleIx {
  fn new(n: usize) -> Self {
    CCTupleIx(n as u32)
  }
  pub fn get(self) -> u32 {
    self.0
  }
}

impl fmt::Debug for CCTupleIx {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "t{}", self.0)
  }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElemIx(u32);

impl ElemIx {
  fn new(n: usize) -> Self {
    ElemIx(n as u32)
  }
  fn ix(self) -> usize {
    self.0 as usize
  }
}

impl fmt::Debug for ElemIx {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "e{}", self.0)
  }
}

/// A value's identity inside the tuple graph: a union-find member whose
/// class is the set of values sharing one slot.  An isolated node has
/// given up its slot; queries treat the value as uncoalesced.
pub struct ElementNode {
  parent: ElemIx,
  rank: u32,
  value: ValueIx,
  isolated: bool,
}

impl ElementNode {
  pub fn value(&self) -> ValueIx {
    self.value
  }
}

//=============================================================================
// CCTuple.

pub struct CCTuple {
  // offset -> the node that founded the slot's class.  Unoccupied offsets
  // inside the bounds are copy slots.
  elements: Map<i32, ElemIx>,
  left_bound: i32,
  right_bound: i32,
  // A non-value region (e.g. a message header) precedes the slots; such a
  // tuple is pinned to its creating instruction's layout and cannot be
  // re-based by later anchors.
  has_non_homogeneous: bool,
  root_inst: InstIx,
}

impl CCTuple {
  pub fn left_bound(&self) -> i32 {
    self.left_bound
  }
  pub fn right_bound(&self) -> i32 {
    self.right_bound
  }
  /// Width of the tuple in slots, bounds inclusive.
  pub fn num_elements(&self) -> usize {
    (self.right_bound - self.left_bound + 1) as usize
  }
  pub fn has_non_homogeneous_elements(&self) -> bool {
    self.has_non_homogeneous
  }
  pub fn root_inst(&self) -> InstIx {
    self.root_inst
  }
  pub fn element_at(&self, offset: i32) -> Option<ElemIx> {
    self.elements.get(&offset).copied()
  }
}

//=============================================================================
// Slot classification.  Each payload slot of an instruction gets exactly
// one of these; the gather pass counts them, the process pass evicts or
// aborts, and the commit pass attaches.

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum SlotOutcome {
  /// A mov is required; nothing about the tuple changes.
  Copy,
  /// Immediate operand; always materialized by a mov.
  Constant,
  /// Function argument; lives in the ABI-fixed location, always copied.
  Argument,
  /// Kept out of tuples by the isolation filter or an earlier eviction.
  Isolated,
  /// Already sitting in this tuple at exactly this offset.
  Anchored,
  /// The slot's class is live here; someone has to give way.
  Interfering { val: ValueIx },
  /// The value may take the slot (empty, or every holder is out of the
  /// way by dominance).
  PackedNonInterfering { val: ValueIx },
}

impl SlotOutcome {
  fn requires_copy(self) -> bool {
    match self {
      SlotOutcome::Copy
      | SlotOutcome::Constant
      | SlotOutcome::Argument
      | SlotOutcome::Isolated => true,
      _ => false,
    }
  }
}

#[derive(Default)]
struct SlotCounts {
  slots_required: usize,
  displacements: usize,
  aligned_anchors: usize,
}

// One processed window of a payload instruction.
struct PartInfo {
  window: (usize, usize),
  tuple: Option<CCTupleIx>,
  base: i32,
}

//=============================================================================
// The engine.

pub struct CoalescingEngine {
  tuples: Vec<CCTuple>,
  elems: Vec<ElementNode>,
  value_node: Map<ValueIx, ElemIx>,
  node_tuple: Map<ElemIx, CCTupleIx>,
  node_offset: Map<ElemIx, i32>,
  // Per-slot dominance chains, keyed by values: for each slot-founding
  // value, the deepest member defined so far; for each member, the one
  // that held the slot above its definition.
  cdp: Map<ValueIx, ValueIx>,
  idp: Map<ValueIx, ValueIx>,
  inst_parts: Map<InstIx, Vec<PartInfo>>,
}

impl CoalescingEngine {
  pub fn build(
    func: &Func, domtree: &DomTree, congruence: &Congruence,
    liveness: &dyn Liveness, divergence: &dyn Divergence,
    selection: &dyn Selection, layout: &dyn PayloadLayout,
  ) -> CoalescingEngine {
    let mut this = CoalescingEngine {
      tuples: Vec::new(),
      elems: Vec::new(),
      value_node: Map::default(),
      node_tuple: Map::default(),
      node_offset: Map::default(),
      cdp: Map::default(),
      idp: Map::default(),
      inst_parts: Map::default(),
    };
    for &bix in domtree.preorder() {
      let mut payload: Vec<(u32, InstIx)> = Vec::new();
      for &iix in &func.blocks[bix].insts {
        if !selection.need_inst(iix) {
          continue;
        }
        if layout.num_payload_elements(iix) >= MIN_TUPLE_OPERANDS {
          payload.push((liveness.distance(iix), iix));
        }
      }
      payload.sort_by_key(|&(d, _)| d);
      // Reverse order: the later send owns its tuple, earlier sends anchor
      // into it from above.
      for &(_, iix) in payload.iter().rev() {
        this.process_payload(
          func, domtree, congruence, liveness, divergence, layout, iix,
        );
      }
    }
    debug!("coalescing: {} tuples built", this.tuples.len());
    this
  }

  fn process_payload(
    &mut self, func: &Func, domtree: &DomTree, congruence: &Congruence,
    liveness: &dyn Liveness, divergence: &dyn Divergence,
    layout: &dyn PayloadLayout, inst: InstIx,
  ) {
    let n = layout.num_payload_elements(inst);
    let values: Vec<ValueIx> =
      (0..n).map(|s| layout.payload_element(inst, s)).collect();
    let windows =
      self.decide_split(func, congruence, divergence, layout, inst, &values);
    if windows.is_empty() {
      return;
    }
    let mut parts = Vec::new();
    for &w in &windows {
      parts.push(self.process_window(
        func, domtree, congruence, liveness, divergence, layout, inst,
        &values, w,
      ));
    }
    if parts.iter().any(|p| p.tuple.is_some()) {
      self.inst_parts.insert(inst, parts);
    }
  }

  /// Oversized payloads are processed as two independent windows when the
  /// instruction permits it.  The boundary prefers a slot that needs a mov
  /// anyway, and a peeled first element stays out of both parts.
  fn decide_split(
    &self, func: &Func, congruence: &Congruence, divergence: &dyn Divergence,
    layout: &dyn PayloadLayout, inst: InstIx, values: &[ValueIx],
  ) -> Vec<(usize, usize)> {
    let n = values.len();
    if n <= MAX_TUPLE_SIZE {
      return vec![(0, n)];
    }
    if !layout.allows_split(inst) {
      debug!("coalescing: {:?} too wide and unsplittable", inst);
      return vec![];
    }
    let start = if layout.peel_first_element(inst) { 1 } else { 0 };
    let mut mid = (start + n) / 2;
    for &cand in &[mid, mid.wrapping_sub(1), mid + 1] {
      if cand > start
        && cand + 1 < n
        && self.always_copied(func, congruence, divergence, values[cand])
      {
        mid = cand;
        break;
      }
    }
    if mid - start > MAX_TUPLE_SIZE || n - mid > MAX_TUPLE_SIZE {
      return vec![];
    }
    vec![(start, mid), (mid, n)]
  }

  fn always_copied(
    &self, func: &Func, congruence: &Congruence, divergence: &dyn Divergence,
    v: ValueIx,
  ) -> bool {
    func.is_const(v)
      || func.is_arg(v)
      // Heavily-used values are live across too much code to pin down.
      || func.uses(v).len() >= MAX_USE_COUNT
      || self.isolation_filter(func, congruence, divergence, v)
  }

  fn process_window(
    &mut self, func: &Func, domtree: &DomTree, congruence: &Congruence,
    liveness: &dyn Liveness, divergence: &dyn Divergence,
    layout: &dyn PayloadLayout, inst: InstIx, values: &[ValueIx],
    window: (usize, usize),
  ) -> PartInfo {
    let (lo, hi) = window;
    let nothing = PartInfo { window, tuple: None, base: 0 };

    // A window that is mostly immediates (or otherwise guaranteed movs) is
    // cheaper to assemble directly than to keep a tuple alive for.  Two
    // operands are always worth a try, and a headered payload benefits
    // from its tuple no matter how constant it is.
    let copied = (lo..hi)
      .filter(|&s| {
        self.always_copied(func, congruence, divergence, values[s])
          || self.engine_root(values[s]).is_none()
      })
      .count();
    if hi - lo > 2
      && copied * 2 > hi - lo
      && !layout.has_non_homogeneous_elements(inst)
    {
      trace!("coalescing: {:?} mostly constants, skipped", inst);
      return nothing;
    }

    // Anchor determination: the window joins the tuple of its first
    // already placed value.  A window touching two tuples at once is left
    // alone.
    let mut anchor: Option<(CCTupleIx, i32)> = None;
    for s in lo..hi {
      let (t, off) = match self.mapping_of(values[s]) {
        Some(m) => m,
        None => continue,
      };
      match anchor {
        None => anchor = Some((t, off - s as i32)),
        Some((t0, _)) if t0 != t => {
          debug!("coalescing: {:?} touches two tuples, skipped", inst);
          return nothing;
        }
        Some(_) => {}
      }
    }
    let (tix, base) = match anchor {
      None => {
        return self.create_tuple(
          func, domtree, congruence, divergence, layout, inst, values, window,
        );
      }
      Some((t, base)) => (t, base),
    };

    // Re-basing a tuple already at the size cap never pays off.
    if base != 0
      && self.tuples[tix.get() as usize].num_elements() >= MAX_TUPLE_SIZE
    {
      debug!("coalescing: {:?} would overgrow {:?}, fresh tuple", inst, tix);
      return self.create_tuple(
        func, domtree, congruence, divergence, layout, inst, values, window,
      );
    }

    // Gather pass: classify every slot and count what the window costs.
    let mut outcomes = Vec::with_capacity(hi - lo);
    let mut counts = SlotCounts::default();
    let mut touched: Set<ValueIx> = Set::default();
    for s in lo..hi {
      let outcome = self.classify_slot(
        func, domtree, congruence, liveness, divergence, tix, base + s as i32,
        values[s], &mut touched,
      );
      trace!("coalescing: {:?} slot {} -> {:?}", inst, s, outcome);
      if outcome.requires_copy() {
        counts.slots_required += 1;
      }
      match outcome {
        SlotOutcome::Interfering { .. } => counts.displacements += 1,
        SlotOutcome::Anchored => counts.aligned_anchors += 1,
        _ => {}
      }
      outcomes.push(outcome);
    }

    // Displacing live occupants only pays off when the rest of the window
    // is settled already.
    let force_eviction =
      counts.slots_required + counts.displacements <= counts.aligned_anchors;

    // Process pass.  Evictions happen as we walk; the first slot we can
    // neither fill nor clear abandons the extension, and the window gets a
    // fresh tuple instead.
    let mut interferes = false;
    let mut values_for_isolation: Set<ValueIx> = Set::default();
    for (k, outcome) in outcomes.iter().enumerate() {
      let offset = base + (lo + k) as i32;
      match *outcome {
        SlotOutcome::Copy
        | SlotOutcome::Constant
        | SlotOutcome::Argument
        | SlotOutcome::Isolated => {
          if !self
            .slot_insertable(func, domtree, liveness, tix, offset, inst, false)
          {
            if force_eviction {
              self
                .prepare_insertion_slot(func, domtree, tix, offset, inst, false);
            } else {
              interferes = true;
            }
          }
        }
        SlotOutcome::Anchored => {}
        SlotOutcome::Interfering { val } => {
          if force_eviction {
            if use_weight(func, val) < EVICTION_WEIGHT_CUTOFF {
              // The value is hardly used; give it the mov and displace
              // only the member holding the slot.
              self
                .prepare_insertion_slot(func, domtree, tix, offset, inst, false);
              values_for_isolation.insert(val);
            } else {
              self
                .prepare_insertion_slot(func, domtree, tix, offset, inst, true);
            }
          } else {
            interferes = true;
          }
        }
        SlotOutcome::PackedNonInterfering { val } => {
          if use_weight(func, val) < EVICTION_WEIGHT_CUTOFF {
            // Not worth binding another instruction's tuple to.
            values_for_isolation.insert(val);
          }
        }
      }
      if interferes {
        break;
      }
    }

    // A pinned layout (message header ahead of slot 0) can only be shared
    // exactly: same base, same width.
    if !interferes {
      let tup = &self.tuples[tix.get() as usize];
      if (tup.has_non_homogeneous || layout.has_non_homogeneous_elements(inst))
        && (base != 0 || hi - lo != tup.num_elements())
      {
        interferes = true;
      }
    }
    if interferes {
      debug!("coalescing: {:?} cannot extend {:?}, fresh tuple", inst, tix);
      return self.create_tuple(
        func, domtree, congruence, divergence, layout, inst, values, window,
      );
    }
    if layout.has_non_homogeneous_elements(inst) {
      self.tuples[tix.get() as usize].has_non_homogeneous = true;
    }

    // Commit pass.
    for (k, outcome) in outcomes.into_iter().enumerate() {
      let offset = base + (lo + k) as i32;
      {
        let tup = &mut self.tuples[tix.get() as usize];
        tup.left_bound = std::cmp::min(tup.left_bound, offset);
        tup.right_bound = std::cmp::max(tup.right_bound, offset);
      }
      let val = match outcome {
        SlotOutcome::PackedNonInterfering { val }
        | SlotOutcome::Interfering { val } => val,
        _ => continue,
      };
      // A value repeated in the payload can only live at one offset; its
      // later slots fall back to copies.
      if values_for_isolation.contains(&val) || self.mapping_of(val).is_some()
      {
        continue;
      }
      self.attach(func, domtree, tix, offset, val);
    }
    // The declined values stay out of tuples for good; their slots are
    // plain copy slots from here on.
    for v in values_for_isolation {
      self.isolate_value(v);
    }
    PartInfo { window, tuple: Some(tix), base }
  }

  /// Build a fresh tuple for the window: every unconstrained value takes
  /// its slot, copy slots merely stretch the bounds, and values pinned
  /// elsewhere keep their place.
  fn create_tuple(
    &mut self, func: &Func, domtree: &DomTree, congruence: &Congruence,
    divergence: &dyn Divergence, layout: &dyn PayloadLayout, inst: InstIx,
    values: &[ValueIx], window: (usize, usize),
  ) -> PartInfo {
    let (lo, hi) = window;
    let any = (lo..hi).any(|s| {
      let v = values[s];
      !self.always_copied(func, congruence, divergence, v)
        && self.engine_root(v).is_some()
        && self.mapping_of(v).is_none()
    });
    if !any {
      trace!("coalescing: {:?} nothing to coalesce", inst);
      return PartInfo { window, tuple: None, base: 0 };
    }
    let tix = CCTupleIx::new(self.tuples.len());
    self.tuples.push(CCTuple {
      elements: Map::default(),
      left_bound: lo as i32,
      right_bound: lo as i32,
      has_non_homogeneous: layout.has_non_homogeneous_elements(inst),
      root_inst: inst,
    });
    debug!("coalescing: {:?} creates {:?}", inst, tix);
    for s in lo..hi {
      let v = values[s];
      let offset = s as i32;
      if self.always_copied(func, congruence, divergence, v)
        || self.engine_root(v).is_none()
      {
        let tup = &mut self.tuples[tix.get() as usize];
        tup.left_bound = std::cmp::min(tup.left_bound, offset);
        tup.right_bound = std::cmp::max(tup.right_bound, offset);
        continue;
      }
      if self.mapping_of(v).is_some() {
        continue;
      }
      self.attach(func, domtree, tix, offset, v);
      let tup = &mut self.tuples[tix.get() as usize];
      tup.left_bound = std::cmp::min(tup.left_bound, offset);
      tup.right_bound = std::cmp::max(tup.right_bound, offset);
    }
    PartInfo { window, tuple: Some(tix), base: 0 }
  }

  fn classify_slot(
    &self, func: &Func, domtree: &DomTree, congruence: &Congruence,
    liveness: &dyn Liveness, divergence: &dyn Divergence, tix: CCTupleIx,
    offset: i32, v: ValueIx, touched: &mut Set<ValueIx>,
  ) -> SlotOutcome {
    if !touched.insert(v) {
      return SlotOutcome::Copy;
    }
    if func.is_const(v) {
      return SlotOutcome::Constant;
    }
    if func.is_arg(v) {
      return SlotOutcome::Argument;
    }
    if self.always_copied(func, congruence, divergence, v)
      || self.engine_root(v).is_none()
    {
      return SlotOutcome::Isolated;
    }
    if let Some((t, off)) = self.mapping_of(v) {
      if t == tix && off == offset {
        return SlotOutcome::Anchored;
      }
      // It cannot be in two places.
      return SlotOutcome::Copy;
    }
    let occ = match self.tuples[tix.get() as usize].element_at(offset) {
      None => return SlotOutcome::PackedNonInterfering { val: v },
      Some(occ) => occ,
    };
    let at = match func.def_inst(v) {
      Some(i) => i,
      None => return SlotOutcome::Isolated,
    };
    let root_v = self.elems[occ.ix()].value;
    let (dominating, dominated) =
      self.symmetric_interference_test(func, domtree, root_v, at);
    if dominated.is_some() {
      // A member defined below us still counts on the slot.
      return SlotOutcome::Interfering { val: v };
    }
    match dominating {
      Some(dom) if liveness.is_live_at(dom, at) => {
        SlotOutcome::Interfering { val: v }
      }
      _ => SlotOutcome::PackedNonInterfering { val: v },
    }
  }

  /// Values the tuple allocator refuses to touch: anything the congruence
  /// pass already coalesced, phis and their sources (their storage is the
  /// class), and uniform values (payload slots are per-lane).
  fn isolation_filter(
    &self, func: &Func, congruence: &Congruence, divergence: &dyn Divergence,
    v: ValueIx,
  ) -> bool {
    if congruence.is_coalesced(v) || congruence.is_isolated(v) {
      return true;
    }
    if let Some(d) = func.def_inst(v) {
      if func.insts[d].is_phi() {
        return true;
      }
    }
    if func.uses(v).iter().any(|&u| func.insts[u].is_phi()) {
      return true;
    }
    divergence.is_uniform(v)
  }
}

//=============================================================================
// The engine-side union-find: one node per value, classes per slot, an
// isolation flag that takes a value out of coalescing for good.

impl CoalescingEngine {
  fn node_for(&mut self, v: ValueIx) -> ElemIx {
    if let Some(&nd) = self.value_node.get(&v) {
      return nd;
    }
    let nd = ElemIx::new(self.elems.len());
    self.elems.push(ElementNode {
      parent: nd,
      rank: 0,
      value: v,
      isolated: false,
    });
    self.value_node.insert(v, nd);
    nd
  }

  fn leader_ix(&self, mut nd: ElemIx) -> ElemIx {
    while self.elems[nd.ix()].parent != nd {
      nd = self.elems[nd.ix()].parent;
    }
    nd
  }

  /// The slot-class leader for |v|, or None once |v| has been squeezed out
  /// of tuple coalescing.  A value without a node is its own leader.
  fn engine_root(&self, v: ValueIx) -> Option<ValueIx> {
    match self.value_node.get(&v) {
      None => Some(v),
      Some(&nd) => {
        if self.elems[nd.ix()].isolated {
          None
        } else {
          Some(self.elems[self.leader_ix(nd).ix()].value)
        }
      }
    }
  }

  fn union_values(&mut self, a: ValueIx, b: ValueIx) {
    let na = self.node_for(a);
    let nb = self.node_for(b);
    let ra = self.leader_ix(na);
    let rb = self.leader_ix(nb);
    if ra == rb {
      return;
    }
    if self.elems[ra.ix()].rank > self.elems[rb.ix()].rank {
      self.elems[rb.ix()].parent = ra;
    } else if self.elems[rb.ix()].rank > self.elems[ra.ix()].rank {
      self.elems[ra.ix()].parent = rb;
    } else {
      self.elems[rb.ix()].parent = ra;
      self.elems[ra.ix()].rank += 1;
    }
  }

  fn isolate_value(&mut self, v: ValueIx) {
    let nd = self.node_for(v);
    trace!("coalescing: isolate {:?}", v);
    self.elems[nd.ix()].isolated = true;
  }

  fn mapping_of(&self, v: ValueIx) -> Option<(CCTupleIx, i32)> {
    let root = self.engine_root(v)?;
    let nd = self.value_node.get(&root)?;
    let t = self.node_tuple.get(nd)?;
    Some((*t, self.node_offset[nd]))
  }
}

//=============================================================================
// Per-slot dominance chains.

impl CoalescingEngine {
  /// The deepest member of |root_v|'s slot class whose definition
  /// dominates |at|, skipping members already displaced.
  fn actual_dominating_parent(
    &self, func: &Func, domtree: &DomTree, root_v: ValueIx, at: InstIx,
  ) -> Option<ValueIx> {
    let mut p = self.cdp.get(&root_v).copied();
    while let Some(v) = p {
      if self.engine_root(v).is_some()
        && (func.is_arg(v) || def_dominates_inst(func, domtree, v, at))
      {
        break;
      }
      p = self.idp.get(&v).copied();
    }
    p
  }

  /// Walk |root_v|'s slot chain relative to the definition point |at|:
  /// returns the nearest member whose definition dominates |at| and
  /// whether any live member is defined below it.  A dominated member
  /// means the slot is spoken for on the path ahead; a dominating member
  /// interferes only if still live at |at|.
  fn symmetric_interference_test(
    &self, func: &Func, domtree: &DomTree, root_v: ValueIx, at: InstIx,
  ) -> (Option<ValueIx>, Option<ValueIx>) {
    let mut dominating = None;
    let mut dominated = None;
    let mut p = self.cdp.get(&root_v).copied();
    while let Some(v) = p {
      if self.engine_root(v).is_some() {
        if func.is_arg(v) || def_dominates_inst(func, domtree, v, at) {
          dominating = Some(v);
          break;
        }
        dominated = Some(v);
      }
      p = self.idp.get(&v).copied();
    }
    (dominating, dominated)
  }

  fn slot_insertable(
    &self, func: &Func, domtree: &DomTree, liveness: &dyn Liveness,
    tix: CCTupleIx, offset: i32, at: InstIx, can_extend: bool,
  ) -> bool {
    let tup = &self.tuples[tix.get() as usize];
    if !can_extend && (offset < tup.left_bound || offset > tup.right_bound) {
      return false;
    }
    if let Some(occ) = tup.element_at(offset) {
      let root_v = self.elems[occ.ix()].value;
      if let Some(dom) =
        self.actual_dominating_parent(func, domtree, root_v, at)
      {
        if liveness.is_live_at(dom, at) {
          return false;
        }
      }
    }
    true
  }

  /// Clear the slot for a newcomer at |at|: displace the member currently
  /// dominating it, or the whole chain from there up when the class is
  /// being broken apart.
  fn prepare_insertion_slot(
    &mut self, func: &Func, domtree: &DomTree, tix: CCTupleIx, offset: i32,
    at: InstIx, evict_full_class: bool,
  ) {
    let occ = match self.tuples[tix.get() as usize].element_at(offset) {
      Some(o) => o,
      None => return,
    };
    let root_v = self.elems[occ.ix()].value;
    debug!(
      "coalescing: clear {:?}[{}] (full class: {})",
      tix, offset, evict_full_class
    );
    if evict_full_class {
      let mut p = self
        .actual_dominating_parent(func, domtree, root_v, at)
        .or_else(|| self.cdp.get(&root_v).copied());
      while let Some(v) = p {
        if self.engine_root(v).is_some() {
          self.isolate_value(v);
        }
        p = self.idp.get(&v).copied();
      }
    } else if let Some(v) =
      self.actual_dominating_parent(func, domtree, root_v, at)
    {
      self.isolate_value(v);
    }
  }

  fn attach(
    &mut self, func: &Func, domtree: &DomTree, tix: CCTupleIx, offset: i32,
    v: ValueIx,
  ) {
    trace!("coalescing: attach {:?} at {:?}[{}]", v, tix, offset);
    match self.tuples[tix.get() as usize].element_at(offset) {
      None => {
        let nd = self.node_for(v);
        self.tuples[tix.get() as usize].elements.insert(offset, nd);
        self.node_tuple.insert(nd, tix);
        self.node_offset.insert(nd, offset);
        self.cdp.insert(v, v);
        self.idp.remove(&v);
      }
      Some(occ) => {
        // The slot's class absorbs |v|; the chain remembers who held the
        // slot above |v|'s definition.
        let at = match func.def_inst(v) {
          Some(i) => i,
          None => return,
        };
        let root_v = self.elems[occ.ix()].value;
        let parent = self.actual_dominating_parent(func, domtree, root_v, at);
        self.union_values(root_v, v);
        match parent {
          Some(p) => {
            self.idp.insert(v, p);
          }
          None => {
            self.idp.remove(&v);
          }
        }
        self.cdp.insert(root_v, v);
      }
    }
  }
}

//=============================================================================
// Queries.

impl CoalescingEngine {
  pub fn get_value_cc_tuple_mapping(&self, v: ValueIx) -> Option<CCTupleIx> {
    self.mapping_of(v).map(|(t, _)| t)
  }

  pub fn get_value_offset_in_cc_tuple(&self, v: ValueIx) -> Option<i32> {
    self.mapping_of(v).map(|(_, o)| o)
  }

  /// May something be moved into |offset| at |at|?  The slot must lie in
  /// bounds (unless |can_extend|) and no member of the slot's class may be
  /// live there.
  pub fn is_insertion_slot_available(
    &self, func: &Func, domtree: &DomTree, liveness: &dyn Liveness,
    tix: CCTupleIx, offset: i32, at: InstIx, can_extend: bool,
  ) -> bool {
    self.slot_insertable(func, domtree, liveness, tix, offset, at, can_extend)
  }

  /// Can |inst|'s payload live entirely in its tuple: every slot either
  /// holds its operand at the right offset, or is free for a mov at this
  /// point?  If not, the emitter assembles a private payload instead.
  pub fn is_payload_covered(
    &self, func: &Func, domtree: &DomTree, liveness: &dyn Liveness,
    layout: &dyn PayloadLayout, inst: InstIx,
  ) -> bool {
    let parts = match self.inst_parts.get(&inst) {
      Some(p) => p,
      None => return false,
    };
    let n = layout.num_payload_elements(inst);
    let mut touched: Set<ValueIx> = Set::default();
    for s in 0..n {
      let part = match parts.iter().find(|p| p.window.0 <= s && s < p.window.1)
      {
        Some(p) => p,
        None => return false,
      };
      let tix = match part.tuple {
        Some(t) => t,
        None => return false,
      };
      let v = layout.payload_element(inst, s);
      let offset = part.base + s as i32;
      let dup = !touched.insert(v);
      let ok = match self.mapping_of(v) {
        Some((t, off)) if !dup => t == tix && off == offset,
        _ => {
          self.slot_insertable(func, domtree, liveness, tix, offset, inst, false)
        }
      };
      if !ok {
        return false;
      }
    }
    true
  }

  /// Did any operand of |inst| land in a tuple slot it can be read from?
  pub fn is_any_value_coalesced(
    &self, layout: &dyn PayloadLayout, inst: InstIx,
  ) -> bool {
    let parts = match self.inst_parts.get(&inst) {
      Some(p) => p,
      None => return false,
    };
    let n = layout.num_payload_elements(inst);
    (0..n).any(|s| {
      let part = match parts.iter().find(|p| p.window.0 <= s && s < p.window.1)
      {
        Some(p) => p,
        None => return false,
      };
      let tix = match part.tuple {
        Some(t) => t,
        None => return false,
      };
      self.mapping_of(layout.payload_element(inst, s))
        == Some((tix, part.base + s as i32))
    })
  }

  /// 0 for instructions that built no tuple, 1 for whole payloads, 2 for
  /// split ones.
  pub fn num_split_parts(&self, inst: InstIx) -> usize {
    self.inst_parts.get(&inst).map(|p| p.len()).unwrap_or(0)
  }

  pub fn part_window(&self, inst: InstIx, part: usize) -> Option<(usize, usize)> {
    self.inst_parts.get(&inst)?.get(part).map(|p| p.window)
  }

  pub fn part_tuple(&self, inst: InstIx, part: usize) -> Option<CCTupleIx> {
    self.inst_parts.get(&inst)?.get(part)?.tuple
  }

  pub fn num_tuples(&self) -> usize {
    self.tuples.len()
  }

  pub fn tuple(&self, tix: CCTupleIx) -> &CCTuple {
    &self.tuples[tix.get() as usize]
  }

  pub fn element_value(&self, e: ElemIx) -> ValueIx {
    self.elems[e.ix()].value
  }
}

//=============================================================================
// Dominance helper.

/// Does |v|'s definition dominate instruction |at|?  Arguments and
/// constants are defined before everything.
fn def_dominates_inst(
  func: &Func, domtree: &DomTree, v: ValueIx, at: InstIx,
) -> bool {
  match func.def_inst(v) {
    None => true,
    Some(i) => {
      let (ba, bb) = (func.insts[i].block, func.insts[at].block);
      if ba == bb {
        func.precedes(i, at)
      } else {
        domtree.dominates(ba, bb)
      }
    }
  }
}

/// How many instructions read |v|: the number of movs its eviction would
/// cost elsewhere.
fn use_weight(func: &Func, v: ValueIx) -> usize {
  func.uses(v).len()
}
