//! Uniform subdivision grid for particle neighborhood queries.
//!
//! The grid partitions the simulation plane into `subdivisions_x *
//! subdivisions_y` buckets of particle indices, addressed column-major:
//! `bucket = column * subdivisions_y + row`. Membership is maintained
//! incrementally (particles are reassigned as they cross bucket borders),
//! so removal must be O(1): each particle carries a slot record naming its
//! bucket and its position inside the bucket vector, and removal swap-pops
//! the entry and patches the slot of whichever particle got moved.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound on subdivisions along either axis.
pub const MAX_SUBDIVISIONS: u32 = 16;

/// Errors emitted by the subdivision grid.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Indicates configuration values that cannot be used (e.g., zero-size
    /// dimensions or an out-of-range subdivision count).
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Per-particle membership record: which bucket holds the particle and at
/// which position inside that bucket's vector.
#[derive(Debug, Clone, Copy, Default)]
struct BucketSlot {
    bucket: u32,
    position: u32,
}

/// The guarded neighborhood of a bucket, in candidate order.
#[derive(Debug, Clone, Copy)]
pub struct NeighborBuckets {
    buckets: [usize; 9],
    len: usize,
}

impl NeighborBuckets {
    /// Valid neighbor buckets, in the order they were generated.
    #[must_use]
    pub fn as_slice(&self) -> &[usize] {
        &self.buckets[..self.len]
    }

    /// Number of valid neighbor buckets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true when no candidate survived validation.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Uniform grid of particle buckets over a `width x height` plane.
///
/// Bucket storage is not serialized; a deserialized grid must be seeded with
/// [`SubdivisionGrid::reset`] before use, the same way a fresh one is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubdivisionGrid {
    subdivisions_x: u32,
    subdivisions_y: u32,
    width: f32,
    height: f32,
    #[serde(skip)]
    buckets: Vec<Vec<u32>>,
    #[serde(skip)]
    slots: Vec<BucketSlot>,
}

impl SubdivisionGrid {
    /// Create a grid with the provided subdivision counts and plane size.
    pub fn new(
        subdivisions_x: u32,
        subdivisions_y: u32,
        width: f32,
        height: f32,
    ) -> Result<Self, IndexError> {
        if !(1..=MAX_SUBDIVISIONS).contains(&subdivisions_x)
            || !(1..=MAX_SUBDIVISIONS).contains(&subdivisions_y)
        {
            return Err(IndexError::InvalidConfig(
                "subdivision counts must be between 1 and 16",
            ));
        }
        if !(width > 0.0 && width.is_finite() && height > 0.0 && height.is_finite()) {
            return Err(IndexError::InvalidConfig(
                "grid dimensions must be positive and finite",
            ));
        }
        let mut grid = Self {
            subdivisions_x,
            subdivisions_y,
            width,
            height,
            buckets: Vec::new(),
            slots: Vec::new(),
        };
        grid.reset(0);
        Ok(grid)
    }

    /// Number of buckets, fixed for the grid's lifetime.
    #[must_use]
    pub fn bucket_count(&self) -> usize {
        (self.subdivisions_x * self.subdivisions_y) as usize
    }

    /// Subdivision count along the x axis.
    #[must_use]
    pub const fn subdivisions_x(&self) -> u32 {
        self.subdivisions_x
    }

    /// Subdivision count along the y axis.
    #[must_use]
    pub const fn subdivisions_y(&self) -> u32 {
        self.subdivisions_y
    }

    /// Number of tracked particles.
    #[must_use]
    pub fn particle_count(&self) -> usize {
        self.slots.len()
    }

    /// Drop all membership and place `particle_count` particles in bucket 0.
    ///
    /// Freshly seeded populations start in bucket 0 and get their real
    /// buckets from the first refresh pass.
    pub fn reset(&mut self, particle_count: usize) {
        let bucket_count = self.bucket_count();
        self.buckets.clear();
        self.buckets.resize_with(bucket_count, Vec::new);
        self.slots.clear();
        self.slots.reserve(particle_count);
        let origin = &mut self.buckets[0];
        origin.reserve(particle_count);
        for particle in 0..particle_count {
            origin.push(particle as u32);
            self.slots.push(BucketSlot {
                bucket: 0,
                position: particle as u32,
            });
        }
    }

    /// Bucket index for a position inside the plane.
    ///
    /// Positions outside `[0, width) x [0, height)` indicate a broken
    /// boundary policy upstream and fail fast.
    #[must_use]
    pub fn bucket_for(&self, x: f32, y: f32) -> usize {
        let column = ((x / self.width) * self.subdivisions_x as f32).floor() as i64;
        let row = ((y / self.height) * self.subdivisions_y as f32).floor() as i64;
        let index = column * i64::from(self.subdivisions_y) + row;
        assert!(
            index >= 0 && (index as usize) < self.bucket_count(),
            "position ({x}, {y}) maps outside the grid"
        );
        index as usize
    }

    /// Bucket currently holding `particle`.
    #[must_use]
    pub fn bucket_of(&self, particle: u32) -> usize {
        self.slots[particle as usize].bucket as usize
    }

    /// Particle indices currently in `bucket`.
    #[must_use]
    pub fn bucket(&self, bucket: usize) -> &[u32] {
        &self.buckets[bucket]
    }

    /// Record `particle` as a member of `bucket`.
    pub fn insert(&mut self, bucket: usize, particle: u32) {
        let entries = &mut self.buckets[bucket];
        let slot = &mut self.slots[particle as usize];
        slot.bucket = bucket as u32;
        slot.position = entries.len() as u32;
        entries.push(particle);
    }

    /// Remove `particle` from `bucket` in O(1), preserving every other
    /// particle's membership.
    pub fn remove(&mut self, bucket: usize, particle: u32) {
        let position = self.slots[particle as usize].position as usize;
        let entries = &mut self.buckets[bucket];
        debug_assert_eq!(
            entries.get(position).copied(),
            Some(particle),
            "membership record out of sync"
        );
        entries.swap_remove(position);
        if let Some(&moved) = entries.get(position) {
            self.slots[moved as usize].position = position as u32;
        }
    }

    /// Move `particle` to `new_bucket`; no-op when the bucket is unchanged.
    pub fn reassign(&mut self, particle: u32, new_bucket: usize) {
        let old_bucket = self.slots[particle as usize].bucket as usize;
        if old_bucket == new_bucket {
            return;
        }
        self.remove(old_bucket, particle);
        self.insert(new_bucket, particle);
    }

    /// Raw neighborhood candidates of `center`, possibly out of range:
    /// center, left, right, up, down, down-left, down-right, up-left,
    /// up-right in linear-index arithmetic.
    #[must_use]
    pub fn neighbor_candidates(&self, center: usize) -> [i64; 9] {
        let c = center as i64;
        let sy = i64::from(self.subdivisions_y);
        [
            c,
            c - sy,
            c + sy,
            c - 1,
            c + 1,
            c + 1 - sy,
            c + 1 + sy,
            c - 1 - sy,
            c - 1 + sy,
        ]
    }

    /// Neighborhood candidates that survive validation.
    ///
    /// A candidate is valid when it is in range AND shares the center's grid
    /// column under integer division (`candidate / subdivisions_y ==
    /// center / subdivisions_y`). The column test drops every cross-column
    /// candidate and admits same-column wrap artifacts at column edges;
    /// candidates are not deduplicated (with `subdivisions_y == 1` the
    /// center bucket appears three times). Force results depend on this
    /// exact rule; changing it changes trajectories.
    #[must_use]
    pub fn neighbors_of(&self, center: usize) -> NeighborBuckets {
        let count = self.bucket_count() as i64;
        let sy = i64::from(self.subdivisions_y);
        let column = center as i64 / sy;
        let mut buckets = [0usize; 9];
        let mut len = 0;
        for candidate in self.neighbor_candidates(center) {
            if candidate >= 0 && candidate < count && candidate / sy == column {
                buckets[len] = candidate as usize;
                len += 1;
            }
        }
        NeighborBuckets { buckets, len }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid_3x3() -> SubdivisionGrid {
        SubdivisionGrid::new(3, 3, 300.0, 300.0).expect("grid")
    }

    #[test]
    fn rejects_invalid_configuration() {
        assert!(SubdivisionGrid::new(0, 3, 300.0, 300.0).is_err());
        assert!(SubdivisionGrid::new(3, 17, 300.0, 300.0).is_err());
        assert!(SubdivisionGrid::new(3, 3, 0.0, 300.0).is_err());
        assert!(SubdivisionGrid::new(3, 3, 300.0, f32::NAN).is_err());
    }

    #[test]
    fn bucket_for_is_column_major() {
        let grid = grid_3x3();
        assert_eq!(grid.bucket_for(0.0, 0.0), 0);
        assert_eq!(grid.bucket_for(0.0, 250.0), 2);
        assert_eq!(grid.bucket_for(150.0, 150.0), 4);
        assert_eq!(grid.bucket_for(299.9, 299.9), 8);
        assert_eq!(grid.bucket_for(250.0, 0.0), 6);
    }

    #[test]
    #[should_panic(expected = "maps outside the grid")]
    fn bucket_for_fails_fast_outside_the_plane() {
        let grid = grid_3x3();
        let _ = grid.bucket_for(-1.0, 0.0);
    }

    #[test]
    fn reset_places_every_particle_in_bucket_zero() {
        let mut grid = grid_3x3();
        grid.reset(4);
        assert_eq!(grid.particle_count(), 4);
        assert_eq!(grid.bucket(0), &[0, 1, 2, 3]);
        for particle in 0..4 {
            assert_eq!(grid.bucket_of(particle), 0);
        }
        for bucket in 1..grid.bucket_count() {
            assert!(grid.bucket(bucket).is_empty());
        }
    }

    #[test]
    fn reassign_moves_membership_and_preserves_others() {
        let mut grid = grid_3x3();
        grid.reset(3);
        grid.reassign(1, 4);
        assert_eq!(grid.bucket_of(1), 4);
        assert_eq!(grid.bucket(4), &[1]);
        // The swap-removed tail particle must still be findable.
        assert_eq!(grid.bucket_of(0), 0);
        assert_eq!(grid.bucket_of(2), 0);
        let mut remaining: Vec<u32> = grid.bucket(0).to_vec();
        remaining.sort_unstable();
        assert_eq!(remaining, vec![0, 2]);

        grid.reassign(2, 4);
        grid.reassign(0, 4);
        assert!(grid.bucket(0).is_empty());
        let mut all: Vec<u32> = grid.bucket(4).to_vec();
        all.sort_unstable();
        assert_eq!(all, vec![0, 1, 2]);
    }

    #[test]
    fn reassign_to_same_bucket_is_a_noop() {
        let mut grid = grid_3x3();
        grid.reset(2);
        let before = grid.bucket(0).to_vec();
        grid.reassign(0, 0);
        assert_eq!(grid.bucket(0), before.as_slice());
    }

    #[test]
    fn every_particle_lives_in_exactly_one_bucket() {
        let mut grid = grid_3x3();
        grid.reset(6);
        grid.reassign(0, 4);
        grid.reassign(3, 8);
        grid.reassign(5, 4);
        grid.reassign(0, 7);
        let total: usize = (0..grid.bucket_count())
            .map(|bucket| grid.bucket(bucket).len())
            .sum();
        assert_eq!(total, 6);
        for particle in 0..6 {
            let bucket = grid.bucket_of(particle);
            assert!(grid.bucket(bucket).contains(&particle));
        }
    }

    #[test]
    fn center_bucket_has_nine_distinct_candidates() {
        let grid = grid_3x3();
        let mut candidates = grid.neighbor_candidates(4).to_vec();
        candidates.sort_unstable();
        assert_eq!(candidates, vec![0, 1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn column_guard_drops_cross_column_candidates() {
        // Left/right/diagonal candidates land in neighboring columns and
        // never pass the guard; only the center column survives.
        let grid = grid_3x3();
        assert_eq!(grid.neighbors_of(4).as_slice(), &[4, 3, 5]);
    }

    #[test]
    fn column_edge_bucket_keeps_same_column_wrap_candidates() {
        // Bucket 0 sits at the top of column 0. Its up-right candidate
        // (0 - 1 + 3 = 2) wraps to the bottom of the same column and is
        // accepted by the guard.
        let grid = grid_3x3();
        assert_eq!(grid.neighbors_of(0).as_slice(), &[0, 1, 2]);
        assert_eq!(grid.neighbors_of(2).as_slice(), &[2, 1, 0]);
    }

    #[test]
    fn tall_columns_limit_the_guarded_neighborhood() {
        let grid = SubdivisionGrid::new(3, 4, 300.0, 400.0).expect("grid");
        // Bucket 4 is the top of column 1: up (3) crosses into column 0 and
        // is dropped, down (5) stays, up-right (7) wraps to the column
        // bottom and is kept.
        assert_eq!(grid.neighbors_of(4).as_slice(), &[4, 5, 7]);
        // Mid-column buckets keep their vertical run only.
        assert_eq!(grid.neighbors_of(5).as_slice(), &[5, 4, 6]);
    }

    #[test]
    fn single_row_grid_visits_the_center_bucket_three_times() {
        // With one subdivision along y, the center, down-left, and up-right
        // candidates all collapse onto the center bucket and none is
        // deduplicated.
        let grid = SubdivisionGrid::new(4, 1, 400.0, 100.0).expect("grid");
        assert_eq!(grid.neighbors_of(2).as_slice(), &[2, 2, 2]);
    }
}
