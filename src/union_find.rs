/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Union-find over values, with each class additionally threaded onto a
//! circular doubly-linked list so that class membership can be enumerated
//! without a full scan.  Nodes live in a pool and refer to each other by
//! u32 index; UF_NULL is the "no node" sentinel.

use crate::data_structures::{Map, Set, ValueIx};

pub const UF_NULL: u32 = 0xFFFF_FFFF;

#[derive(Clone)]
struct NodeData {
  value: ValueIx,
  parent: u32,
  rank: u32,
  // Circular list of every member of the class.
  next: u32,
  prev: u32,
  // Class identity; only meaningful on the root.  Splitting a member off
  // gives the new singleton a fresh color, so color keys remain usable
  // across splits (the dominating-parent maps are keyed by color).
  color: u32,
}

pub struct CongruencePool {
  pool: Vec<NodeData>,
  map: Map<ValueIx, u32>,
  isolated: Set<ValueIx>,
  fresh_color: u32,
}

impl CongruencePool {
  pub fn new() -> Self {
    CongruencePool {
      pool: Vec::new(),
      map: Map::default(),
      isolated: Set::default(),
      fresh_color: 0,
    }
  }

  fn next_color(&mut self) -> u32 {
    let c = self.fresh_color;
    self.fresh_color += 1;
    c
  }

  fn alloc(&mut self, value: ValueIx) -> u32 {
    let ix = self.pool.len() as u32;
    debug_assert!(ix != UF_NULL);
    let color = self.next_color();
    self.pool.push(NodeData {
      value,
      parent: ix,
      rank: 0,
      next: ix,
      prev: ix,
      color,
    });
    ix
  }

  /// The node for |v|, allocating a fresh singleton if |v| has none yet.
  pub fn get_or_alloc(&mut self, v: ValueIx) -> u32 {
    if let Some(&nd) = self.map.get(&v) {
      return nd;
    }
    let nd = self.alloc(v);
    self.map.insert(v, nd);
    nd
  }

  pub fn node_of(&self, v: ValueIx) -> Option<u32> {
    self.map.get(&v).copied()
  }

  /// Find with path halving.
  pub fn leader(&mut self, mut nd: u32) -> u32 {
    loop {
      let parent = self.pool[nd as usize].parent;
      if parent == nd {
        return nd;
      }
      let grandparent = self.pool[parent as usize].parent;
      self.pool[nd as usize].parent = grandparent;
      nd = grandparent;
    }
  }

  /// Non-compressing find, for use behind `&self` queries.
  fn leader_const(&self, mut nd: u32) -> u32 {
    loop {
      let parent = self.pool[nd as usize].parent;
      if parent == nd {
        return nd;
      }
      nd = parent;
    }
  }

  /// The value stored on the root of |v|'s class, or None if |v| has no
  /// node.
  pub fn leader_value(&self, v: ValueIx) -> Option<ValueIx> {
    let nd = self.node_of(v)?;
    Some(self.pool[self.leader_const(nd) as usize].value)
  }

  pub fn same_class_const(&self, a: ValueIx, b: ValueIx) -> bool {
    if a == b {
      return true;
    }
    match (self.node_of(a), self.node_of(b)) {
      (Some(na), Some(nb)) => self.leader_const(na) == self.leader_const(nb),
      _ => false,
    }
  }

  pub fn same_class(&mut self, a: ValueIx, b: ValueIx) -> bool {
    if a == b {
      return true;
    }
    match (self.node_of(a), self.node_of(b)) {
      (Some(na), Some(nb)) => self.leader(na) == self.leader(nb),
      _ => false,
    }
  }

  /// Union the classes of |a| and |b|.  The class identity (color) of |a|'s
  /// leader survives.  Returns false if they were already congruent.
  pub fn union(&mut self, a: ValueIx, b: ValueIx) -> bool {
    let na = self.get_or_alloc(a);
    let nb = self.get_or_alloc(b);
    let ra = self.leader(na);
    let rb = self.leader(nb);
    if ra == rb {
      return false;
    }
    self.pool[rb as usize].parent = ra;
    let new_rank =
      std::cmp::max(self.pool[ra as usize].rank, self.pool[rb as usize].rank + 1);
    self.pool[ra as usize].rank = new_rank;
    // Splice the two circular lists.
    let a_next = self.pool[ra as usize].next;
    let b_next = self.pool[rb as usize].next;
    self.pool[ra as usize].next = b_next;
    self.pool[b_next as usize].prev = ra;
    self.pool[rb as usize].next = a_next;
    self.pool[a_next as usize].prev = rb;
    true
  }

  /// The class color of |v|'s class.  |v| must have a node.
  pub fn color_of(&mut self, v: ValueIx) -> u32 {
    let nd = self.map[&v];
    let root = self.leader(nd);
    self.pool[root as usize].color
  }

  /// Remove |v| from its class, making it a fresh singleton with a fresh
  /// color.  The rest of the class is unaffected.  Does not mark |v|
  /// isolated; see |isolate|.
  pub fn split_node(&mut self, v: ValueIx) {
    let nd = match self.node_of(v) {
      Some(nd) => nd,
      None => return,
    };
    if self.pool[nd as usize].next == nd {
      // Already a singleton; just give it a fresh identity.
      let color = self.next_color();
      self.pool[nd as usize].color = color;
      return;
    }
    let root = self.leader(nd);
    let victim = if root == nd {
      // |v| is the union-find root.  The class identity must survive on
      // the remaining members, so move the next member's value onto the
      // root node and split that member's node instead.
      let nx = self.pool[nd as usize].next;
      let other = self.pool[nx as usize].value;
      self.pool[nd as usize].value = other;
      self.pool[nx as usize].value = v;
      self.map.insert(other, nd);
      self.map.insert(v, nx);
      nx
    } else {
      nd
    };
    // Unlink |victim| from the circular list.  It may still be an interior
    // node of the union-find tree, so leave it behind as a ghost; |v| gets
    // a brand-new singleton node.
    let p = self.pool[victim as usize].prev;
    let n = self.pool[victim as usize].next;
    self.pool[p as usize].next = n;
    self.pool[n as usize].prev = p;
    self.pool[victim as usize].value = ValueIx::invalid();
    let fresh = self.alloc(v);
    self.map.insert(v, fresh);
  }

  /// Split |v| out of its class and mark it isolated.  Isolation is sticky:
  /// an isolated value is never unioned again by the congruence passes.
  pub fn isolate(&mut self, v: ValueIx) {
    self.split_node(v);
    self.isolated.insert(v);
  }

  pub fn is_isolated(&self, v: ValueIx) -> bool {
    self.isolated.contains(&v)
  }

  /// Every member of |v|'s class, starting at |v| and following the list.
  /// A value with no node is its own singleton class.
  pub fn class_members(&self, v: ValueIx) -> Vec<ValueIx> {
    let nd = match self.node_of(v) {
      Some(nd) => nd,
      None => return vec![v],
    };
    let mut members = vec![self.pool[nd as usize].value];
    let mut cur = self.pool[nd as usize].next;
    while cur != nd {
      members.push(self.pool[cur as usize].value);
      cur = self.pool[cur as usize].next;
    }
    members
  }

  /// Does |v|'s class contain |v| alone?
  pub fn is_single_valued(&self, v: ValueIx) -> bool {
    match self.node_of(v) {
      Some(nd) => self.pool[nd as usize].next == nd,
      None => true,
    }
  }
}
