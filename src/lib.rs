// Copyright (C) 2024 GLStudios
// SPDX-License-Identifier: LGPL-2.1-only

//! Linear bounding volume hierarchy over axis-aligned boxes.
//!
//! Construction runs as a fixed sequence of data-parallel stages
//! (scene-box reduction, Morton keying, sort, binary radix-tree
//! topology, bottom-up box propagation). The resulting [`Static`] tree
//! is immutable and can be queried from any number of threads at once,
//! either with a spatial predicate or with a bounded k-nearest search.
//!
//! ```
//! use glam::DVec3;
//! use lbvh::{Aabb, Static};
//!
//! let boxes = [
//!     Aabb::new(DVec3::ZERO, DVec3::ONE),
//!     Aabb::new(DVec3::splat(2.0), DVec3::splat(3.0)),
//! ];
//! let tree = Static::build(&boxes);
//!
//! let nearest = tree.nearest_to_point(DVec3::ZERO, 1).unwrap();
//! assert_eq!(nearest[0].0, 0);
//! ```

pub mod bvh;

pub use bvh::{
    Aabb,
    InternalNode,
    LeafNode,
    NearestStrategy,
    NodeId,
    QueryError,
    Static,
    StaticBuilder,
    STACK_CAPACITY,
};
