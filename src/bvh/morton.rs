// Copyright (C) 2024 GLStudios
// SPDX-License-Identifier: LGPL-2.1-only

//! Morton encoding (Z-order curve) of box centroids.
//!
//! Centroids are normalized into the unit cube against the scene box,
//! quantized to 10 bits per axis and interleaved x-major into a 30-bit
//! key. Keys only have to be order-preserving, so the lost precision is
//! irrelevant as long as the secondary sort on the original index keeps
//! the permutation total.

use glam::DVec3;
use rayon::prelude::*;

use super::Aabb;

const AXIS_BITS: u32 = 10;
const AXIS_RANGE: f64 = (1 << AXIS_BITS) as f64;

/// Spread the low 10 bits of `x` so two zero bits separate each of
/// them, leaving room for the other two axes.
const fn spread_bits(mut x: u32) -> u32 {
    x &= 0x0000_03ff;
    x = (x | (x << 16)) & 0x0300_00ff;
    x = (x | (x << 8)) & 0x0300_f00f;
    x = (x | (x << 4)) & 0x030c_30c3;
    x = (x | (x << 2)) & 0x0924_9249;
    x
}

/// Interleave three 10-bit coordinates, x occupying the highest bit of
/// each triple.
pub(super) const fn morton3(
    x: u32,
    y: u32,
    z: u32,
) -> u32 {
    (spread_bits(x) << 2) | (spread_bits(y) << 1) | spread_bits(z)
}

#[allow(clippy::cast_possible_truncation)]
#[allow(clippy::cast_sign_loss)]
fn quantize(t: f64) -> u32 {
    (t * AXIS_RANGE).clamp(0.0, AXIS_RANGE - 1.0) as u32
}

/// Morton key of a centroid normalized against the scene box. Axes of
/// zero extent collapse to coordinate 0.
pub(super) fn morton_key(
    centroid: DVec3,
    scene: &Aabb,
) -> u32 {
    let extent = scene.max - scene.min;
    let normalize = |offset: f64, extent: f64| {
        if extent > 0.0 {
            offset / extent
        } else {
            0.0
        }
    };

    let offset = centroid - scene.min;
    morton3(
        quantize(normalize(offset.x, extent.x)),
        quantize(normalize(offset.y, extent.y)),
        quantize(normalize(offset.z, extent.z)),
    )
}

pub(super) fn assign_keys(
    boxes: &[Aabb],
    scene: &Aabb,
) -> Vec<u32> {
    boxes
        .par_iter()
        .map(|bounds| morton_key(bounds.centroid(), scene))
        .collect()
}

/// Permutation sorting indices by `(key, original index)` ascending.
/// The secondary key makes the order total even when keys collide.
#[allow(clippy::cast_possible_truncation)]
pub(super) fn sort_permutation(keys: &[u32]) -> Vec<u32> {
    let mut order: Vec<u32> = (0..keys.len() as u32).collect();
    order.par_sort_unstable_by_key(|&i| (keys[i as usize], i));
    order
}
