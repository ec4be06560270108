/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! The public interface: the oracle traits the client must implement, the
//! named tunables, and re-exports of the pass entry points.

pub use crate::alias::AliasMaps;
pub use crate::analysis::{AnalysisError, DomTree, LoopInfo};
pub use crate::coalescing::{
  CCTuple, CCTupleIx, CoalescingEngine, ElemIx, ElementNode,
};
pub use crate::congruence::Congruence;
pub use crate::data_structures::{
  BlockData, BlockIx, Func, InstData, InstIx, InstKind, RegAlign, Type,
  TypedIxVec, ValueData, ValueIx, ValueKind,
};

//=============================================================================
// Tunables.  These are deliberate policy constants, not magic numbers; see
// the uses for what each one gates.

/// A value defined in a loop preheader and feeding at least this many phis
/// is kept out of congruence classes entirely (unioning it would stretch a
/// whole class's live range across the loop).
pub const PHI_SRC_USE_THRESHOLD: usize = 3;

/// Hard cap on the number of payload slots a single tuple may cover.
pub const MAX_TUPLE_SIZE: usize = 12;

/// A payload instruction with fewer value operands than this is not worth
/// building a tuple for.
pub const MIN_TUPLE_OPERANDS: usize = 2;

/// Eviction weight below which a previously-anchored value may be displaced
/// from its tuple slot by a later candidate.
pub const EVICTION_WEIGHT_CUTOFF: usize = 2;

/// Values with more distinct uses than this are assumed to be live across
/// too much of the function to be worth anchoring.
pub const MAX_USE_COUNT: usize = 20;

//=============================================================================
// Oracles.  The passes never compute liveness, divergence, instruction
// selection or payload geometry themselves; the client supplies them.
// They are injected by constructor, so tests can substitute table-driven
// fakes.

/// Liveness facts.  `distance` is a global instruction ordering (lower is
/// earlier); `merge_use_from` must fold `from`'s uses into `into`'s live
/// range, since coalescing two values makes them share storage.
pub trait Liveness {
  fn distance(&self, i: InstIx) -> u32;
  fn is_live_at(&self, v: ValueIx, at: InstIx) -> bool;
  fn is_live_out(&self, v: ValueIx, b: BlockIx) -> bool;
  fn has_interference(&self, a: ValueIx, b: ValueIx) -> bool;
  fn merge_use_from(&mut self, into: ValueIx, from: ValueIx);
}

/// SIMD dependency classification of a value.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Dependency {
  /// Same across all lanes.
  Uniform,
  /// Lane-indexed but affine in the lane id.
  Consecutive,
  /// Anything else.
  Random,
}

pub trait Divergence {
  fn which_depend(&self, v: ValueIx) -> Dependency;
  fn inside_divergent_cf(&self, b: BlockIx) -> bool;

  fn is_uniform(&self, v: ValueIx) -> bool {
    self.which_depend(v) == Dependency::Uniform
  }
}

/// Which instructions survive selection.  Dead instructions take no part in
/// either pass.
pub trait Selection {
  fn need_inst(&self, i: InstIx) -> bool;
}

/// Payload geometry for send-like instructions.  Slot indices are
/// zero-based and contiguous.
pub trait PayloadLayout {
  /// Number of payload slots, 0 for instructions with no payload.
  fn num_payload_elements(&self, i: InstIx) -> usize;
  /// The value occupying a slot.  Constants appear here as constant values.
  fn payload_element(&self, i: InstIx, slot: usize) -> ValueIx;
  /// A header or other non-value region precedes the slots, so the tuple
  /// cannot be treated as a pure value sequence.
  fn has_non_homogeneous_elements(&self, i: InstIx) -> bool;
  /// May the payload be materialized as two separate movs (split)?
  fn allows_split(&self, i: InstIx) -> bool;
  /// Must slot 0 stay out of any split part?
  fn peel_first_element(&self, i: InstIx) -> bool;
}
