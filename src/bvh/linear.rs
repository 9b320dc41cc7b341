// Copyright (C) 2024 GLStudios
// SPDX-License-Identifier: LGPL-2.1-only

//! Parallel bottom-up construction over sorted Morton keys.
//!
//! Build stages, each a data-parallel pass with an implicit barrier in
//! between: scene-box reduction, per-box Morton key, sort permutation,
//! leaf initialization, binary radix-tree topology, bottom-up box
//! propagation. The one synchronization hazard is the propagation
//! stage; see [`propagate_bounds`].

use std::{
    cell::UnsafeCell,
    sync::atomic::{
        AtomicU32,
        Ordering,
    },
};

use rayon::prelude::*;
use tracing::debug;

use super::{
    morton,
    Aabb,
    InternalNode,
    LeafNode,
    NodeId,
    Static,
};

/// Accumulates boxes, then builds a [`Static`] tree in one synchronous
/// call.
#[derive(Debug, Default)]
pub struct StaticBuilder {
    boxes: Vec<Aabb>,
}

impl StaticBuilder {
    #[must_use]
    pub const fn new() -> Self {
        Self { boxes: Vec::new() }
    }

    /// # Panics
    /// On a malformed box (`min > max` on some axis); a silently wrong
    /// tree is worse than a loud failure.
    pub fn append(
        &mut self,
        bounds: Aabb,
    ) -> &mut Self {
        assert!(
            bounds.is_valid(),
            "malformed box: min {} exceeds max {}",
            bounds.min,
            bounds.max
        );
        self.boxes.push(bounds);
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }

    #[must_use]
    pub fn build(self) -> Static {
        build_impl(self.boxes)
    }
}

impl Static {
    /// Builds a tree over `boxes`; their positions in the slice are the
    /// indices that queries report back.
    ///
    /// # Panics
    /// On a malformed box (`min > max` on some axis).
    #[must_use]
    pub fn build(boxes: &[Aabb]) -> Self {
        assert!(
            boxes.iter().all(Aabb::is_valid),
            "malformed box in input (min > max)"
        );
        build_impl(boxes.to_vec())
    }
}

#[allow(clippy::cast_possible_truncation)]
fn build_impl(boxes: Vec<Aabb>) -> Static {
    let n = boxes.len();
    if n == 0 {
        return Static {
            leaves:    Vec::new(),
            internals: Vec::new(),
        };
    }
    if n == 1 {
        return Static {
            leaves:    vec![LeafNode {
                bounds: boxes[0],
                index:  0,
                parent: 0,
            }],
            internals: Vec::new(),
        };
    }

    let begin_time = std::time::Instant::now();

    let scene = boxes
        .par_iter()
        .copied()
        .reduce(|| Aabb::EMPTY, Aabb::union);

    let keys = morton::assign_keys(&boxes, &scene);
    let order = morton::sort_permutation(&keys);
    let sorted_keys: Vec<u32> = order.par_iter().map(|&i| keys[i as usize]).collect();

    let mut leaves: Vec<LeafNode> = order
        .par_iter()
        .map(|&i| LeafNode {
            bounds: boxes[i as usize],
            index:  i,
            parent: 0,
        })
        .collect();

    // Topology over the n - 1 internal nodes. Each node writes its own
    // children; parent links are scattered to whichever array the child
    // lives in, every child having exactly one parent.
    let leaf_parents: Vec<AtomicU32> = (0..n).map(|_| AtomicU32::new(0)).collect();
    let internal_parents: Vec<AtomicU32> = (0..n - 1).map(|_| AtomicU32::new(0)).collect();

    let children: Vec<(NodeId, NodeId)> = (0..n - 1)
        .into_par_iter()
        .map(|i| {
            let pair = radix_children(&sorted_keys, i);
            for child in [pair.0, pair.1] {
                match child {
                    NodeId::Leaf(c) => {
                        leaf_parents[c as usize].store(i as u32, Ordering::Relaxed);
                    },
                    NodeId::Internal(c) => {
                        internal_parents[c as usize].store(i as u32, Ordering::Relaxed);
                    },
                }
            }
            pair
        })
        .collect();

    let leaf_parents: Vec<u32> = leaf_parents.into_iter().map(AtomicU32::into_inner).collect();
    let internal_parents: Vec<u32> = internal_parents
        .into_iter()
        .map(AtomicU32::into_inner)
        .collect();

    leaves
        .par_iter_mut()
        .zip(&leaf_parents)
        .for_each(|(leaf, &parent)| leaf.parent = parent);

    let bounds = propagate_bounds(&leaves, &children, &internal_parents);

    let internals: Vec<InternalNode> = children
        .into_par_iter()
        .enumerate()
        .map(|(i, (left, right))| InternalNode {
            bounds: bounds[i],
            left,
            right,
            parent: internal_parents[i],
        })
        .collect();

    debug!(
        leaves = n,
        internals = internals.len(),
        elapsed_us = begin_time.elapsed().as_micros() as u64,
        "static bvh built"
    );

    Static { leaves, internals }
}

/// Shared slot written during propagation. Exactly one thread writes
/// each slot (the second child to arrive at that node), and every read
/// is ordered after that write through the `AcqRel` arrival counter.
struct BoundsSlot(UnsafeCell<Aabb>);

unsafe impl Sync for BoundsSlot {}

impl BoundsSlot {
    const fn new() -> Self {
        Self(UnsafeCell::new(Aabb::EMPTY))
    }
}

/// Bottom-up box propagation: every leaf ascends through parent links;
/// the first child to reach an internal node parks, the second computes
/// the union of both children and continues toward the root. The
/// per-node atomic counter serializes the race without locks.
fn propagate_bounds(
    leaves: &[LeafNode],
    children: &[(NodeId, NodeId)],
    internal_parents: &[u32],
) -> Vec<Aabb> {
    let slots: Vec<BoundsSlot> = (0..children.len()).map(|_| BoundsSlot::new()).collect();
    let arrivals: Vec<AtomicU32> = (0..children.len()).map(|_| AtomicU32::new(0)).collect();

    let child_bounds = |id: NodeId| -> Aabb {
        match id {
            NodeId::Leaf(c) => leaves[c as usize].bounds,
            // SAFETY: an internal child's slot was written before its
            // writer bumped this node's arrival counter, and the
            // counter's AcqRel ordering makes that write visible here.
            NodeId::Internal(c) => unsafe { *slots[c as usize].0.get() },
        }
    };

    leaves.par_iter().for_each(|leaf| {
        let mut node = leaf.parent as usize;
        loop {
            if arrivals[node].fetch_add(1, Ordering::AcqRel) == 0 {
                // First arrival: the sibling subtree is still pending.
                break;
            }

            let (left, right) = children[node];
            let merged = child_bounds(left).union(child_bounds(right));
            // SAFETY: sole writer; only the second arrival reaches this
            // point and the counter admits exactly one second arrival.
            unsafe {
                *slots[node].0.get() = merged;
            }

            if node == 0 {
                break;
            }
            node = internal_parents[node] as usize;
        }
    });

    // All writers joined above, the slots are plain data again.
    slots
        .into_iter()
        .map(|slot| slot.0.into_inner())
        .collect()
}

/// Longest common prefix of the keys at `i` and `j`, in bits; falls
/// back to the index bits on equal keys so the order stays total, and
/// returns -1 outside the key range to bound probe loops.
#[allow(clippy::cast_possible_wrap)]
#[allow(clippy::cast_possible_truncation)]
#[allow(clippy::cast_sign_loss)]
fn delta(
    keys: &[u32],
    i: usize,
    j: isize,
) -> i32 {
    if j < 0 || j as usize >= keys.len() {
        return -1;
    }
    let j = j as usize;
    if keys[i] == keys[j] {
        32 + (i as u32 ^ j as u32).leading_zeros() as i32
    } else {
        (keys[i] ^ keys[j]).leading_zeros() as i32
    }
}

/// Children of internal node `i` of the binary radix tree over the
/// sorted `keys`, following the standard parallel construction: find
/// the direction and extent of the leaf range this node spans by
/// comparing neighbor prefixes, then binary-search the position where
/// the common prefix shortens. Singleton sub-ranges become leaves.
#[allow(clippy::cast_possible_wrap)]
#[allow(clippy::cast_possible_truncation)]
#[allow(clippy::cast_sign_loss)]
fn radix_children(
    keys: &[u32],
    i: usize,
) -> (NodeId, NodeId) {
    let ii = i as isize;
    let direction: isize = if delta(keys, i, ii + 1) > delta(keys, i, ii - 1) {
        1
    } else {
        -1
    };

    // Upper bound on the range length, then exact length by bisection.
    let delta_min = delta(keys, i, ii - direction);
    let mut length_max: isize = 2;
    while delta(keys, i, ii + length_max * direction) > delta_min {
        length_max *= 2;
    }

    let mut length: isize = 0;
    let mut step = length_max / 2;
    while step >= 1 {
        if delta(keys, i, ii + (length + step) * direction) > delta_min {
            length += step;
        }
        step /= 2;
    }
    let other_end = ii + length * direction;

    // Split where the range's common prefix first drops.
    let delta_node = delta(keys, i, other_end);
    let mut split: isize = 0;
    let mut step = length;
    loop {
        step = (step + 1) >> 1;
        if delta(keys, i, ii + (split + step) * direction) > delta_node {
            split += step;
        }
        if step == 1 {
            break;
        }
    }
    let pivot = ii + split * direction + direction.min(0);

    let left = if ii.min(other_end) == pivot {
        NodeId::Leaf(pivot as u32)
    } else {
        NodeId::Internal(pivot as u32)
    };
    let right = if ii.max(other_end) == pivot + 1 {
        NodeId::Leaf((pivot + 1) as u32)
    } else {
        NodeId::Internal((pivot + 1) as u32)
    };
    (left, right)
}
