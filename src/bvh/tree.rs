// Copyright (C) 2024 GLStudios
// SPDX-License-Identifier: LGPL-2.1-only

use super::Aabb;

/// Arena reference to a tree node. Leaves and internal nodes live in
/// separate arrays, so the tag also selects the array.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeId {
    Internal(u32),
    Leaf(u32),
}

impl NodeId {
    #[inline]
    #[must_use]
    pub const fn is_leaf(self) -> bool {
        matches!(self, Self::Leaf(_))
    }
}

/// References exactly one input box, keeping its pre-sort index.
#[derive(Clone, Copy, Debug)]
pub struct LeafNode {
    pub(super) bounds: Aabb,
    pub(super) index:  u32,
    pub(super) parent: u32,
}

impl LeafNode {
    #[must_use]
    pub const fn bounds(&self) -> &Aabb {
        &self.bounds
    }

    /// Index of the referenced box in the original input order.
    #[must_use]
    pub const fn index(&self) -> u32 {
        self.index
    }
}

/// Two children and the union of their boxes.
#[derive(Clone, Copy, Debug)]
pub struct InternalNode {
    pub(super) bounds: Aabb,
    pub(super) left:   NodeId,
    pub(super) right:  NodeId,
    pub(super) parent: u32,
}

impl InternalNode {
    #[must_use]
    pub const fn bounds(&self) -> &Aabb {
        &self.bounds
    }

    #[must_use]
    pub const fn left(&self) -> NodeId {
        self.left
    }

    #[must_use]
    pub const fn right(&self) -> NodeId {
        self.right
    }
}

/// Immutable bounding volume hierarchy: `n` leaves, `max(n - 1, 0)`
/// internal nodes. Built once by [`StaticBuilder`](super::StaticBuilder)
/// and read-only afterwards, so any number of queries may run against
/// it concurrently.
#[derive(Debug)]
pub struct Static {
    pub(super) leaves:    Vec<LeafNode>,
    pub(super) internals: Vec<InternalNode>,
}

impl Static {
    /// Number of indexed boxes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    /// Root node: `None` for an empty tree, the sole leaf for a single
    /// box, internal node 0 otherwise.
    #[must_use]
    pub fn root(&self) -> Option<NodeId> {
        match self.leaves.len() {
            0 => None,
            1 => Some(NodeId::Leaf(0)),
            _ => Some(NodeId::Internal(0)),
        }
    }

    /// Union of all indexed boxes, [`Aabb::EMPTY`] for an empty tree.
    #[must_use]
    pub fn scene_bounds(&self) -> Aabb {
        match self.root() {
            None => Aabb::EMPTY,
            Some(id) => *self.bounds_of(id),
        }
    }

    #[inline]
    #[must_use]
    pub fn leaf(
        &self,
        id: u32,
    ) -> &LeafNode {
        &self.leaves[id as usize]
    }

    #[inline]
    #[must_use]
    pub fn internal(
        &self,
        id: u32,
    ) -> &InternalNode {
        &self.internals[id as usize]
    }

    #[inline]
    #[must_use]
    pub fn bounds_of(
        &self,
        id: NodeId,
    ) -> &Aabb {
        match id {
            NodeId::Leaf(i) => &self.leaves[i as usize].bounds,
            NodeId::Internal(i) => &self.internals[i as usize].bounds,
        }
    }
}

#[cfg(test)]
mod tests {
    use glam::DVec3;

    use super::{
        NodeId,
        Static,
    };
    use crate::Aabb;

    #[test]
    fn root_selection() {
        let empty = Static::build(&[]);
        assert!(empty.is_empty());
        assert_eq!(empty.root(), None);
        assert_eq!(empty.scene_bounds(), Aabb::EMPTY);

        let one = Static::build(&[Aabb::new(DVec3::ZERO, DVec3::ONE)]);
        assert_eq!(one.len(), 1);
        assert_eq!(one.root(), Some(NodeId::Leaf(0)));
        assert!(one.root().is_some_and(NodeId::is_leaf));

        let two = Static::build(&[
            Aabb::new(DVec3::ZERO, DVec3::ONE),
            Aabb::new(DVec3::splat(2.0), DVec3::splat(3.0)),
        ]);
        assert_eq!(two.len(), 2);
        assert_eq!(two.root(), Some(NodeId::Internal(0)));
        assert_eq!(two.scene_bounds().max, DVec3::splat(3.0));
    }
}
