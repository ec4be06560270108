/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Data structures for the whole crate: typed indices, the typed-index
//! vector, and the SSA function model that the passes consume.

use rustc_hash::FxHashMap;
use rustc_hash::FxHashSet;
use smallvec::SmallVec;
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Index, IndexMut};

//=============================================================================
// Maps and sets.  We use the rustc versions everywhere; they are faster than
// the stdlib ones for small keys, and we do not need DoS resistance.

pub type Map<K, V> = FxHashMap<K, V>;
pub type Set<T> = FxHashSet<T>;

//=============================================================================
// Typed wrappers around u32 indices.  All of the pass-internal state is
// addressed by these, never by references, so there are no lifetime tangles
// between the pools and the things that point into them.

macro_rules! define_ix {
  ($name:ident, $prefix:expr) => {
    #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    #[cfg_attr(
      feature = "enable-serde",
      derive(serde::Serialize, serde::Deserialize)
    )]
    pub struct $name(u32);

    impl $name {
      #[inline(always)]
      pub fn new(n: u32) -> Self {
        debug_assert!(n != u32::MAX);
        $name(n)
      }
      #[inline(always)]
      pub fn get(self) -> u32 {
        self.0
      }
      #[inline(always)]
      pub fn invalid() -> Self {
        $name(u32::MAX)
      }
      #[inline(always)]
      pub fn is_valid(self) -> bool {
        self.0 != u32::MAX
      }
    }

    impl fmt::Debug for $name {
      fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        if self.is_valid() {
          write!(fmt, "{}{}", $prefix, self.0)
        } else {
          write!(fmt, "{}<invalid>", $prefix)
        }
      }
    }
  };
}

define_ix!(ValueIx, "v");
define_ix!(InstIx, "i");
define_ix!(BlockIx, "b");

//=============================================================================
// A vector which is indexed by one of the typed indices only.  This stops us
// from, say, accidentally indexing a vector of blocks with an instruction
// index.  Adapted to the minimum surface this crate needs.

pub struct TypedIxVec<IX, T> {
  vec: Vec<T>,
  ty: PhantomData<IX>,
}

impl<IX: Copy, T> TypedIxVec<IX, T> {
  pub fn new() -> Self {
    Self { vec: Vec::new(), ty: PhantomData }
  }
  pub fn len(&self) -> u32 {
    self.vec.len() as u32
  }
  pub fn iter(&self) -> std::slice::Iter<T> {
    self.vec.iter()
  }
  pub fn iter_mut(&mut self) -> std::slice::IterMut<T> {
    self.vec.iter_mut()
  }
}

macro_rules! impl_typed_ix_vec {
  ($ix:ident) => {
    impl<T> TypedIxVec<$ix, T> {
      pub fn push(&mut self, t: T) -> $ix {
        let ix = $ix::new(self.vec.len() as u32);
        self.vec.push(t);
        ix
      }
      pub fn range(&self) -> impl Iterator<Item = $ix> {
        (0..self.vec.len() as u32).map($ix::new)
      }
    }
    impl<T> Index<$ix> for TypedIxVec<$ix, T> {
      type Output = T;
      fn index(&self, ix: $ix) -> &T {
        &self.vec[ix.get() as usize]
      }
    }
    impl<T> IndexMut<$ix> for TypedIxVec<$ix, T> {
      fn index_mut(&mut self, ix: $ix) -> &mut T {
        &mut self.vec[ix.get() as usize]
      }
    }
  };
}

impl_typed_ix_vec!(ValueIx);
impl_typed_ix_vec!(InstIx);
impl_typed_ix_vec!(BlockIx);

//=============================================================================
// Types.  Just enough structure to answer the questions the passes ask:
// total bit width, lane count, and "is this an aggregate" (struct/array
// results are not coalesced, only isolated).

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Type {
  Scalar { bits: u16 },
  Vector { bits: u16, lanes: u8 },
  Aggregate { fields: u8 },
}

impl Type {
  pub fn scalar(bits: u16) -> Type {
    Type::Scalar { bits }
  }
  pub fn vector(bits: u16, lanes: u8) -> Type {
    debug_assert!(lanes >= 1);
    Type::Vector { bits, lanes }
  }
  pub fn lanes(self) -> u32 {
    match self {
      Type::Scalar { .. } => 1,
      Type::Vector { lanes, .. } => lanes as u32,
      Type::Aggregate { .. } => 1,
    }
  }
  pub fn total_bits(self) -> u32 {
    match self {
      Type::Scalar { bits } => bits as u32,
      Type::Vector { bits, lanes } => bits as u32 * lanes as u32,
      Type::Aggregate { .. } => 0,
    }
  }
  pub fn is_aggregate(self) -> bool {
    match self {
      Type::Aggregate { .. } => true,
      _ => false,
    }
  }
}

//=============================================================================
// Placement preference for a value.  |Block| means the value must start at a
// hardware block boundary (the strict requirement); |Packed| means it must
// explicitly not (it is part of a packed sub-register sequence).  The
// alignment-splitting pass isolates |Packed| members out of classes that
// contain any |Block| member.

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RegAlign {
  Auto,
  Block,
  Packed,
}

//=============================================================================
// Values and instructions.

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ValueKind {
  /// Function argument.  Live from the entry block.
  Arg,
  /// Compile-time constant; never occupies storage of its own.
  Const,
  /// Undefined value (the seed of insert-element chains).
  Undef,
  /// Result of the given instruction.
  Def(InstIx),
}

#[derive(Clone)]
pub struct ValueData {
  pub kind: ValueKind,
  pub ty: Type,
  pub align: RegAlign,
}

#[derive(Clone)]
pub enum InstKind {
  /// Phi node: (incoming value, predecessor block) pairs.
  Phi { incoming: SmallVec<[(ValueIx, BlockIx); 2]> },
  /// Insert |elt| into vector |vec| at |lane|.  A |None| lane is a dynamic
  /// index, which defeats alias detection.
  InsertElement { vec: ValueIx, elt: ValueIx, lane: Option<u32> },
  /// Insert |elt| into aggregate |agg| at |field|.
  InsertValue { agg: ValueIx, elt: ValueIx, field: u32 },
  /// Bit-reinterpretation of |src|.
  Cast { src: ValueIx },
  /// Payload-producing instruction (a hardware send).  The actual payload
  /// slot layout comes from the payload-geometry oracle.
  Send { args: SmallVec<[ValueIx; 8]> },
  /// Any other computation.
  Def { args: SmallVec<[ValueIx; 4]> },
}

#[derive(Clone)]
pub struct InstData {
  pub block: BlockIx,
  /// Position within the block, assigned by |Func::finish|.  Phi nodes come
  /// first and their relative order is not semantically meaningful, but a
  /// total order per block is still required for determinism.
  pub pos: u32,
  pub dest: Option<ValueIx>,
  pub kind: InstKind,
}

impl InstData {
  pub fn is_phi(&self) -> bool {
    match self.kind {
      InstKind::Phi { .. } => true,
      _ => false,
    }
  }
  /// Visit every value operand of this instruction.
  pub fn visit_operands<F: FnMut(ValueIx)>(&self, mut f: F) {
    match &self.kind {
      InstKind::Phi { incoming } => {
        for (v, _) in incoming {
          f(*v);
        }
      }
      InstKind::InsertElement { vec, elt, .. } => {
        f(*vec);
        f(*elt);
      }
      InstKind::InsertValue { agg, elt, .. } => {
        f(*agg);
        f(*elt);
      }
      InstKind::Cast { src } => f(*src),
      InstKind::Send { args } => {
        for v in args {
          f(*v);
        }
      }
      InstKind::Def { args } => {
        for v in args {
          f(*v);
        }
      }
    }
  }
}

#[derive(Clone)]
pub struct BlockData {
  /// Instructions in program order, phis first.
  pub insts: Vec<InstIx>,
  pub succs: SmallVec<[BlockIx; 2]>,
  pub preds: SmallVec<[BlockIx; 2]>,
}

//=============================================================================
// The function itself.  Built incrementally, then frozen with |finish|,
// which assigns instruction positions and computes the use lists.  All
// passes treat a finished Func as read-only.

pub struct Func {
  pub blocks: TypedIxVec<BlockIx, BlockData>,
  pub insts: TypedIxVec<InstIx, InstData>,
  pub values: TypedIxVec<ValueIx, ValueData>,
  pub args: Vec<ValueIx>,
  pub entry: BlockIx,
  /// Distinct instruction users per value, in instruction-index order.
  use_lists: TypedIxVec<ValueIx, SmallVec<[InstIx; 4]>>,
  finished: bool,
}

impl Func {
  pub fn new() -> Self {
    Func {
      blocks: TypedIxVec::new(),
      insts: TypedIxVec::new(),
      values: TypedIxVec::new(),
      args: Vec::new(),
      entry: BlockIx::new(0),
      use_lists: TypedIxVec::new(),
      finished: false,
    }
  }

  pub fn add_block(&mut self) -> BlockIx {
    debug_assert!(!self.finished);
    self.blocks.push(BlockData {
      insts: Vec::new(),
      succs: SmallVec::new(),
      preds: SmallVec::new(),
    })
  }

  pub fn add_edge(&mut self, from: BlockIx, to: BlockIx) {
    debug_assert!(!self.finished);
    self.blocks[from].succs.push(to);
    self.blocks[to].preds.push(from);
  }

  fn add_value(&mut self, kind: ValueKind, ty: Type) -> ValueIx {
    self.values.push(ValueData { kind, ty, align: RegAlign::Auto })
  }

  pub fn add_arg(&mut self, ty: Type) -> ValueIx {
    debug_assert!(!self.finished);
    let v = self.add_value(ValueKind::Arg, ty);
    self.args.push(v);
    v
  }

  pub fn add_const(&mut self, ty: Type) -> ValueIx {
    debug_assert!(!self.finished);
    self.add_value(ValueKind::Const, ty)
  }

  pub fn add_undef(&mut self, ty: Type) -> ValueIx {
    debug_assert!(!self.finished);
    self.add_value(ValueKind::Undef, ty)
  }

  /// Append an instruction to |block|.  If |ty| is given the instruction
  /// defines a new value of that type, which is returned via |dest|.
  pub fn add_inst(
    &mut self, block: BlockIx, kind: InstKind, ty: Option<Type>,
  ) -> InstIx {
    debug_assert!(!self.finished);
    let iix = InstIx::new(self.insts.len());
    let dest = ty.map(|t| self.add_value(ValueKind::Def(iix), t));
    let real = self.insts.push(InstData { block, pos: 0, dest, kind });
    debug_assert!(real == iix);
    self.blocks[block].insts.push(iix);
    iix
  }

  pub fn dest(&self, iix: InstIx) -> Option<ValueIx> {
    self.insts[iix].dest
  }

  /// The defining instruction of |v|, if it is an instruction result.
  pub fn def_inst(&self, v: ValueIx) -> Option<InstIx> {
    match self.values[v].kind {
      ValueKind::Def(iix) => Some(iix),
      _ => None,
    }
  }

  pub fn def_block(&self, v: ValueIx) -> Option<BlockIx> {
    self.def_inst(v).map(|iix| self.insts[iix].block)
  }

  pub fn is_const(&self, v: ValueIx) -> bool {
    match self.values[v].kind {
      ValueKind::Const | ValueKind::Undef => true,
      _ => false,
    }
  }

  pub fn is_arg(&self, v: ValueIx) -> bool {
    self.values[v].kind == ValueKind::Arg
  }

  pub fn set_align(&mut self, v: ValueIx, align: RegAlign) {
    self.values[v].align = align;
  }

  pub fn align(&self, v: ValueIx) -> RegAlign {
    self.values[v].align
  }

  pub fn ty(&self, v: ValueIx) -> Type {
    self.values[v].ty
  }

  /// Distinct instruction users of |v|.  Only valid after |finish|.
  pub fn uses(&self, v: ValueIx) -> &[InstIx] {
    debug_assert!(self.finished);
    &self.use_lists[v]
  }

  pub fn has_one_use(&self, v: ValueIx) -> bool {
    self.uses(v).len() == 1
  }

  /// Is |a| defined strictly before |b| within the same block?  Positions
  /// are only comparable within one block.
  pub fn precedes(&self, a: InstIx, b: InstIx) -> bool {
    debug_assert!(self.insts[a].block == self.insts[b].block);
    self.insts[a].pos < self.insts[b].pos
  }

  /// Freeze the function: assign per-block instruction positions and build
  /// the use lists.  Phis must precede all non-phi instructions in their
  /// block.
  pub fn finish(&mut self) {
    debug_assert!(!self.finished);
    for bix in self.blocks.range() {
      let insts = self.blocks[bix].insts.clone();
      let mut seen_non_phi = false;
      for (pos, &iix) in insts.iter().enumerate() {
        self.insts[iix].pos = pos as u32;
        if self.insts[iix].is_phi() {
          debug_assert!(!seen_non_phi, "phi after non-phi in {:?}", bix);
        } else {
          seen_non_phi = true;
        }
      }
    }

    let mut lists = TypedIxVec::<ValueIx, SmallVec<[InstIx; 4]>>::new();
    for _ in self.values.range() {
      lists.push(SmallVec::new());
    }
    for iix in self.insts.range() {
      // Clone the kind to appease the borrow checker; operand lists are
      // small.
      let kind = self.insts[iix].kind.clone();
      let data = InstData { block: self.insts[iix].block, pos: 0, dest: None, kind };
      data.visit_operands(|v| {
        let list = &mut lists[v];
        if list.last() != Some(&iix) && !list.contains(&iix) {
          list.push(iix);
        }
      });
    }
    self.use_lists = lists;
    self.finished = true;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_use_lists_are_distinct_per_inst() {
    let mut f = Func::new();
    let b0 = f.add_block();
    let x = f.add_arg(Type::scalar(32));
    // x used twice by the same instruction: one use-list entry.
    let i0 = f.add_inst(
      b0,
      InstKind::Def { args: SmallVec::from_slice(&[x, x]) },
      Some(Type::scalar(32)),
    );
    let y = f.dest(i0).unwrap();
    let i1 = f.add_inst(
      b0,
      InstKind::Def { args: SmallVec::from_slice(&[x, y]) },
      Some(Type::scalar(32)),
    );
    f.finish();
    assert_eq!(f.uses(x), &[i0, i1]);
    assert_eq!(f.uses(y), &[i1]);
    assert!(f.has_one_use(y));
    assert!(f.precedes(i0, i1));
  }

  #[test]
  fn test_type_queries() {
    assert_eq!(Type::vector(32, 4).total_bits(), 128);
    assert_eq!(Type::vector(32, 4).lanes(), 4);
    assert_eq!(Type::scalar(64).lanes(), 1);
    assert!(Type::Aggregate { fields: 2 }.is_aggregate());
  }
}
