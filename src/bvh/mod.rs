// Copyright (C) 2024 GLStudios
// SPDX-License-Identifier: LGPL-2.1-only

mod linear;
mod morton;
mod traverse;
mod tree;


use glam::DVec3;
pub use linear::StaticBuilder;
pub use traverse::{
    NearestStrategy,
    QueryError,
    STACK_CAPACITY,
};
pub use tree::{
    InternalNode,
    LeafNode,
    NodeId,
    Static,
};

/// Axis-aligned bounding box.
///
/// [`Aabb::EMPTY`] is the identity element under [`Aabb::union`]: its
/// bounds are inverted infinities so that any union with it returns the
/// other operand unchanged.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Aabb {
    pub min: DVec3,
    pub max: DVec3,
}

impl Aabb {
    pub const EMPTY: Self = Self {
        min: DVec3::INFINITY,
        max: DVec3::NEG_INFINITY,
    };

    #[must_use]
    pub const fn new(
        min: DVec3,
        max: DVec3,
    ) -> Self {
        Self { min, max }
    }

    /// Degenerate box covering a single point.
    #[must_use]
    pub const fn from_point(point: DVec3) -> Self {
        Self {
            min: point,
            max: point,
        }
    }

    /// `min <= max` on every axis.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.min.cmple(self.max).all()
    }

    #[must_use]
    pub fn union(
        self,
        other: Self,
    ) -> Self {
        Self {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    #[inline]
    pub fn grow_to_include(
        &mut self,
        other: &Self,
    ) {
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    #[must_use]
    pub fn centroid(&self) -> DVec3 {
        (self.min + self.max) * 0.5
    }

    #[inline]
    #[must_use]
    pub fn intersects(
        &self,
        other: &Self,
    ) -> bool {
        self.min.cmple(other.max).all() && other.min.cmple(self.max).all()
    }

    #[inline]
    #[must_use]
    pub fn contains(
        &self,
        point: DVec3,
    ) -> bool {
        self.min.cmple(point).all() && point.cmple(self.max).all()
    }

    /// Squared distance from `point` to the nearest point of the box,
    /// zero when the point lies inside.
    #[inline]
    #[must_use]
    pub fn distance_squared(
        &self,
        point: DVec3,
    ) -> f64 {
        let nearest = point.max(self.min).min(self.max);
        (point - nearest).length_squared()
    }

    #[inline]
    #[must_use]
    pub fn distance(
        &self,
        point: DVec3,
    ) -> f64 {
        self.distance_squared(point).sqrt()
    }
}
