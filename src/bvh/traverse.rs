// Copyright (C) 2024 GLStudios
// SPDX-License-Identifier: LGPL-2.1-only

//! Stack-based depth-first traversal: spatial predicate queries and
//! bounded k-nearest-neighbor queries against a built tree.
//!
//! Queries only read the shared node arrays; all mutable state (stack,
//! candidate heap, output) is per-call, so any number of queries may
//! run concurrently over one tree.

use std::fmt;

use glam::DVec3;

use super::{
    Aabb,
    NodeId,
    Static,
};

/// Fixed traversal stack capacity. Tree depth is bounded by the longest
/// strictly-lengthening prefix chain (30 key bits plus the index
/// fallback bits), so this never trips on trees the builder produces;
/// if it does trip, the query aborts instead of truncating.
pub const STACK_CAPACITY: usize = 128;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryError {
    /// Traversal stack capacity exhausted; the query was aborted since
    /// silent truncation would be indistinguishable from a complete
    /// result.
    StackOverflow { capacity: usize },
}

impl fmt::Display for QueryError {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            Self::StackOverflow { capacity } => {
                write!(f, "traversal stack overflowed its capacity of {capacity}")
            },
        }
    }
}

impl std::error::Error for QueryError {}

/// How the nearest-neighbor search handles the farther child of an
/// internal node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NearestStrategy {
    /// Always push both children; uniform control flow.
    #[default]
    PushBoth,
    /// Skip the farther child when its bound already exceeds the prune
    /// radius. Fewer pushes, more branches; which wins depends on the
    /// workload.
    SkipFar,
}

struct TraversalStack<T> {
    items: Vec<T>,
}

impl<T> TraversalStack<T> {
    fn new() -> Self {
        Self {
            items: Vec::with_capacity(STACK_CAPACITY),
        }
    }

    fn push(
        &mut self,
        value: T,
    ) -> Result<(), QueryError> {
        if self.items.len() == STACK_CAPACITY {
            return Err(QueryError::StackOverflow {
                capacity: STACK_CAPACITY,
            });
        }
        self.items.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Option<T> {
        self.items.pop()
    }
}

/// Leaf candidate ordered by `(distance, original index)`. The index
/// tiebreak keeps equal-distance results reproducible.
#[derive(Clone, Copy, Debug, PartialEq)]
struct Candidate {
    distance: f64,
    index:    u32,
}

impl Eq for Candidate {}

impl Ord for Candidate {
    fn cmp(
        &self,
        other: &Self,
    ) -> std::cmp::Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then_with(|| self.index.cmp(&other.index))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(
        &self,
        other: &Self,
    ) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Fixed-capacity max-heap over [`Candidate`]s: the worst kept result
/// sits on top and is the one evicted when a better leaf shows up.
/// Memory never grows beyond `capacity` entries.
struct BoundedHeap {
    items:    Vec<Candidate>,
    capacity: usize,
}

impl BoundedHeap {
    fn new(capacity: usize) -> Self {
        Self {
            items: Vec::with_capacity(capacity),
            capacity,
        }
    }

    fn is_full(&self) -> bool {
        self.items.len() == self.capacity
    }

    fn top(&self) -> Option<Candidate> {
        self.items.first().copied()
    }

    fn push(
        &mut self,
        candidate: Candidate,
    ) {
        debug_assert!(!self.is_full(), "push into a full bounded heap");
        self.items.push(candidate);
        let mut child = self.items.len() - 1;
        while child > 0 {
            let parent = (child - 1) / 2;
            if self.items[parent] >= self.items[child] {
                break;
            }
            self.items.swap(parent, child);
            child = parent;
        }
    }

    fn replace_top(
        &mut self,
        candidate: Candidate,
    ) {
        debug_assert!(!self.items.is_empty(), "replace_top on an empty heap");
        self.items[0] = candidate;
        let len = self.items.len();
        let mut parent = 0;
        loop {
            let mut largest = parent;
            for child in [2 * parent + 1, 2 * parent + 2] {
                if child < len && self.items[child] > self.items[largest] {
                    largest = child;
                }
            }
            if largest == parent {
                break;
            }
            self.items.swap(parent, largest);
            parent = largest;
        }
    }

    fn into_sorted(mut self) -> Vec<Candidate> {
        self.items.sort_unstable();
        self.items
    }
}

impl Static {
    /// Reports every leaf whose box satisfies `predicate`, in traversal
    /// order, and returns the match count.
    ///
    /// `predicate` must be monotonic under containment: a box failing
    /// it implies every box inside also fails. That is the caller's
    /// obligation; it is what lets whole subtrees be discarded.
    ///
    /// # Errors
    /// [`QueryError::StackOverflow`] if the traversal stack capacity is
    /// exhausted; no partial result is reported as complete.
    pub fn query<P, F>(
        &self,
        mut predicate: P,
        mut insert: F,
    ) -> Result<usize, QueryError>
    where
        P: FnMut(&Aabb) -> bool,
        F: FnMut(u32),
    {
        let Some(root) = self.root() else {
            return Ok(0);
        };

        // Single-leaf tree: test directly, no stack.
        if let NodeId::Leaf(id) = root {
            let leaf = self.leaf(id);
            if predicate(leaf.bounds()) {
                insert(leaf.index());
                return Ok(1);
            }
            return Ok(0);
        }

        let mut stack = TraversalStack::new();
        stack.push(root)?;
        let mut count = 0;

        while let Some(id) = stack.pop() {
            match id {
                // Children are filtered at push time, so a popped leaf
                // is already known to match.
                NodeId::Leaf(i) => {
                    insert(self.leaf(i).index());
                    count += 1;
                },
                NodeId::Internal(i) => {
                    let node = self.internal(i);
                    for child in [node.left(), node.right()] {
                        if predicate(self.bounds_of(child)) {
                            stack.push(child)?;
                        }
                    }
                },
            }
        }
        Ok(count)
    }

    /// Indices of all boxes intersecting `region`, unordered, appended
    /// to `out` (cleared first).
    ///
    /// # Errors
    /// [`QueryError::StackOverflow`], as for [`Static::query`].
    pub fn query_intersecting(
        &self,
        region: &Aabb,
        out: &mut Vec<u32>,
    ) -> Result<usize, QueryError> {
        out.clear();
        self.query(|bounds| bounds.intersects(region), |index| out.push(index))
    }

    /// k-nearest query with the default [`NearestStrategy::PushBoth`].
    /// See [`Static::nearest_with`].
    ///
    /// # Errors
    /// [`QueryError::StackOverflow`], as for [`Static::query`].
    pub fn nearest<D, F>(
        &self,
        distance: D,
        k: usize,
        insert: F,
    ) -> Result<usize, QueryError>
    where
        D: Fn(&Aabb) -> f64,
        F: FnMut(u32, f64),
    {
        self.nearest_with(NearestStrategy::default(), distance, k, insert)
    }

    /// Reports the `k` leaves nearest under `distance` through
    /// `insert(index, distance)`, ascending by `(distance, index)`, and
    /// returns how many were reported (fewer than `k` only when the
    /// tree holds fewer boxes; `k == 0` reports none).
    ///
    /// `distance` must return a lower bound on the true distance from
    /// the query geometry to anything enclosed by the given box — on a
    /// leaf box that bound is taken as the leaf's true distance. The
    /// branch-and-bound pruning is only sound under that contract.
    ///
    /// # Errors
    /// [`QueryError::StackOverflow`], as for [`Static::query`].
    pub fn nearest_with<D, F>(
        &self,
        strategy: NearestStrategy,
        distance: D,
        k: usize,
        mut insert: F,
    ) -> Result<usize, QueryError>
    where
        D: Fn(&Aabb) -> f64,
        F: FnMut(u32, f64),
    {
        if k == 0 {
            return Ok(0);
        }
        let Some(root) = self.root() else {
            return Ok(0);
        };

        // Single-leaf tree: report the leaf with its true distance,
        // whatever k was asked for.
        if let NodeId::Leaf(id) = root {
            let leaf = self.leaf(id);
            insert(leaf.index(), distance(leaf.bounds()));
            return Ok(1);
        }

        // Subtrees whose bound exceeds this radius cannot hold one of
        // the k nearest. Starts unbounded, tightens to the heap top
        // once k candidates are held. Equal-bound subtrees stay alive
        // so the index tiebreak sees every equal-distance leaf.
        let mut radius = f64::INFINITY;
        let mut heap = BoundedHeap::new(k);

        let mut stack = TraversalStack::new();
        // The root's bound is never consulted, it is popped first.
        stack.push((root, 0.0_f64))?;

        while let Some((id, bound)) = stack.pop() {
            if bound > radius {
                continue;
            }
            match id {
                NodeId::Leaf(i) => {
                    let candidate = Candidate {
                        distance: bound,
                        index:    self.leaf(i).index(),
                    };
                    if heap.is_full() {
                        if heap.top().is_some_and(|top| candidate < top) {
                            heap.replace_top(candidate);
                        }
                    } else {
                        heap.push(candidate);
                    }
                    if heap.is_full() {
                        if let Some(top) = heap.top() {
                            radius = top.distance;
                        }
                    }
                },
                NodeId::Internal(i) => {
                    let node = self.internal(i);
                    let left = (node.left(), distance(self.bounds_of(node.left())));
                    let right = (node.right(), distance(self.bounds_of(node.right())));

                    // Farther child first so the nearer one is explored
                    // first and tightens the radius sooner.
                    let (near, far) = if left.1 < right.1 {
                        (left, right)
                    } else {
                        (right, left)
                    };
                    if strategy == NearestStrategy::PushBoth || far.1 <= radius {
                        stack.push(far)?;
                    }
                    stack.push(near)?;
                },
            }
        }

        let results = heap.into_sorted();
        let count = results.len();
        for candidate in results {
            insert(candidate.index, candidate.distance);
        }
        Ok(count)
    }

    /// The `k` boxes nearest to `point` as `(index, distance)` pairs,
    /// ascending by distance.
    ///
    /// # Errors
    /// [`QueryError::StackOverflow`], as for [`Static::query`].
    pub fn nearest_to_point(
        &self,
        point: DVec3,
        k: usize,
    ) -> Result<Vec<(u32, f64)>, QueryError> {
        let mut out = Vec::with_capacity(k.min(self.len()));
        self.nearest(
            |bounds| bounds.distance(point),
            k,
            |index, dist| out.push((index, dist)),
        )?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use glam::DVec3;

    use super::*;

    #[test]
    fn bounded_heap_keeps_worst_on_top() {
        let mut heap = BoundedHeap::new(3);
        for (distance, index) in [(2.0, 1), (0.5, 2), (1.0, 0)] {
            heap.push(Candidate { distance, index });
        }
        assert!(heap.is_full());
        assert_eq!(heap.top().map(|c| c.index), Some(1));

        // Better candidate evicts the top; worse one would not get in.
        heap.replace_top(Candidate {
            distance: 0.75,
            index:    3,
        });
        assert_eq!(heap.top().map(|c| c.index), Some(0));

        let sorted: Vec<u32> = heap.into_sorted().into_iter().map(|c| c.index).collect();
        assert_eq!(sorted, vec![2, 3, 0]);
    }

    #[test]
    fn candidate_ties_break_on_index() {
        let a = Candidate {
            distance: 1.0,
            index:    4,
        };
        let b = Candidate {
            distance: 1.0,
            index:    7,
        };
        assert!(a < b);
    }

    #[test]
    fn stack_overflow_is_loud() {
        let mut stack = TraversalStack::new();
        for i in 0..STACK_CAPACITY {
            assert!(stack.push(i).is_ok());
        }
        assert_eq!(
            stack.push(usize::MAX),
            Err(QueryError::StackOverflow {
                capacity: STACK_CAPACITY
            })
        );
        let rendered = QueryError::StackOverflow {
            capacity: STACK_CAPACITY,
        }
        .to_string();
        assert!(rendered.contains("128"));
    }

    #[test]
    fn single_leaf_is_tested_directly() {
        let tree = Static::build(&[Aabb::new(DVec3::ZERO, DVec3::ONE)]);

        let mut hits = Vec::new();
        let count = tree
            .query_intersecting(
                &Aabb::new(DVec3::splat(0.5), DVec3::splat(2.0)),
                &mut hits,
            )
            .unwrap();
        assert_eq!((count, hits.as_slice()), (1, &[0_u32][..]));

        let miss = tree
            .query_intersecting(
                &Aabb::new(DVec3::splat(5.0), DVec3::splat(6.0)),
                &mut hits,
            )
            .unwrap();
        assert_eq!(miss, 0);

        // k larger than the tree still returns the one leaf.
        let nearest = tree.nearest_to_point(DVec3::splat(9.0), 5).unwrap();
        assert_eq!(nearest.len(), 1);
        assert_eq!(nearest[0].0, 0);
    }

    #[test]
    fn empty_tree_returns_nothing() {
        let tree = Static::build(&[]);
        let mut hits = Vec::new();
        assert_eq!(
            tree.query_intersecting(&Aabb::new(DVec3::ZERO, DVec3::ONE), &mut hits)
                .unwrap(),
            0
        );
        assert_eq!(tree.nearest_to_point(DVec3::ZERO, 3).unwrap().len(), 0);
    }

    fn scenario_boxes() -> Vec<Aabb> {
        vec![
            Aabb::new(DVec3::ZERO, DVec3::ONE),
            Aabb::new(DVec3::splat(2.0), DVec3::splat(3.0)),
            Aabb::new(DVec3::splat(5.0), DVec3::splat(6.0)),
        ]
    }

    #[test]
    fn nearest_two_from_origin() {
        let tree = Static::build(&scenario_boxes());
        let results = tree.nearest_to_point(DVec3::ZERO, 2).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, 0);
        assert_eq!(results[0].1, 0.0);
        assert_eq!(results[1].0, 1);
        // Nearest point of box 1 is its corner at (2, 2, 2).
        assert!((results[1].1 - 12.0_f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn range_query_hits_middle_box_only() {
        let tree = Static::build(&scenario_boxes());
        let mut hits = Vec::new();
        let count = tree
            .query_intersecting(
                &Aabb::new(DVec3::splat(1.5), DVec3::splat(2.5)),
                &mut hits,
            )
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(hits, vec![1]);
    }

    #[test]
    fn k_zero_is_degenerate_not_fatal() {
        let tree = Static::build(&scenario_boxes());
        let count = tree
            .nearest(|b| b.distance(DVec3::ZERO), 0, |_, _| {
                panic!("no result expected for k = 0")
            })
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn k_exceeding_len_returns_everything() {
        let tree = Static::build(&scenario_boxes());
        let results = tree.nearest_to_point(DVec3::ZERO, 10).unwrap();
        let indices: Vec<u32> = results.iter().map(|&(i, _)| i).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert!(results.windows(2).all(|w| w[0].1 <= w[1].1));
    }

    #[test]
    fn strategies_agree() {
        let boxes: Vec<Aabb> = (0..64)
            .map(|i| {
                let at = DVec3::new(f64::from(i % 8), f64::from(i / 8), 0.0);
                Aabb::new(at, at + DVec3::splat(0.4))
            })
            .collect();
        let tree = Static::build(&boxes);
        let point = DVec3::new(3.3, 4.7, 1.0);

        for k in [1, 5, 64] {
            let mut eager = Vec::new();
            let mut deferred = Vec::new();
            let eager_count = tree
                .nearest_with(
                    NearestStrategy::SkipFar,
                    |b| b.distance(point),
                    k,
                    |i, d| eager.push((i, d)),
                )
                .unwrap();
            let deferred_count = tree
                .nearest_with(
                    NearestStrategy::PushBoth,
                    |b| b.distance(point),
                    k,
                    |i, d| deferred.push((i, d)),
                )
                .unwrap();
            assert_eq!(eager_count, deferred_count);
            assert_eq!(eager, deferred);
        }
    }

    #[test]
    fn equal_distances_resolve_to_lowest_indices() {
        // Eight identical boxes: every distance ties, so the returned
        // set must be the lowest original indices, ascending.
        let boxes = vec![Aabb::new(DVec3::ZERO, DVec3::ONE); 8];
        let tree = Static::build(&boxes);
        let results = tree.nearest_to_point(DVec3::splat(4.0), 3).unwrap();
        let indices: Vec<u32> = results.iter().map(|&(i, _)| i).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn concurrent_queries_share_one_tree() {
        let boxes: Vec<Aabb> = (0..512)
            .map(|i| {
                let at = DVec3::new(f64::from(i % 16), f64::from((i / 16) % 16), f64::from(i / 256));
                Aabb::new(at, at + DVec3::splat(0.5))
            })
            .collect();
        let tree = Static::build(&boxes);

        std::thread::scope(|scope| {
            for worker in 0..8 {
                let tree = &tree;
                let boxes = &boxes;
                scope.spawn(move || {
                    let point = DVec3::splat(f64::from(worker));
                    let nearest = tree.nearest_to_point(point, 4).unwrap();
                    assert_eq!(nearest.len(), 4);

                    let mut hits = Vec::new();
                    let region = Aabb::new(point, point + DVec3::splat(2.0));
                    let count = tree.query_intersecting(&region, &mut hits).unwrap();
                    assert_eq!(count, hits.len());
                    assert!(hits.iter().all(|&i| boxes[i as usize].intersects(&region)));
                });
            }
        });
    }
}
