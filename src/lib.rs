/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Main file / top-level module for the dessa library.
//!
//! This crate turns an SSA-form function into congruence classes of values
//! that can share one storage location without copies (the out-of-SSA
//! problem), and packs operands of payload-producing instructions into
//! contiguous tuples that reuse those classes.

mod alias;
mod analysis;
mod coalescing;
mod congruence;
mod data_structures;
mod interface;
mod union_find;

#[cfg(test)]
mod test_framework;

pub use crate::interface::*;
