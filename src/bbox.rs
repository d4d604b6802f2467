//! Integer coordinate geometry: points and axis-aligned bounding boxes

use crate::error::{Result, VoxError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Div, Index, Mul, Sub};

/// Integer 3-d point / extent
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: i64,
    pub y: i64,
    pub z: i64,
}

impl Vec3 {
    pub const fn new(x: i64, y: i64, z: i64) -> Self {
        Self { x, y, z }
    }

    pub const fn splat(v: i64) -> Self {
        Self { x: v, y: v, z: v }
    }

    pub const fn zero() -> Self {
        Self::splat(0)
    }

    pub fn from_array(a: [i64; 3]) -> Self {
        Self::new(a[0], a[1], a[2])
    }

    pub fn to_array(self) -> [i64; 3] {
        [self.x, self.y, self.z]
    }

    /// Component-wise minimum
    pub fn min2(self, other: Vec3) -> Vec3 {
        Vec3::new(
            self.x.min(other.x),
            self.y.min(other.y),
            self.z.min(other.z),
        )
    }

    /// Component-wise maximum
    pub fn max2(self, other: Vec3) -> Vec3 {
        Vec3::new(
            self.x.max(other.x),
            self.y.max(other.y),
            self.z.max(other.z),
        )
    }
}

impl Index<usize> for Vec3 {
    type Output = i64;

    fn index(&self, i: usize) -> &i64 {
        match i {
            0 => &self.x,
            1 => &self.y,
            2 => &self.z,
            _ => panic!("Vec3 index out of range: {}", i),
        }
    }
}

impl Add for Vec3 {
    type Output = Vec3;
    fn add(self, o: Vec3) -> Vec3 {
        Vec3::new(self.x + o.x, self.y + o.y, self.z + o.z)
    }
}

impl Sub for Vec3 {
    type Output = Vec3;
    fn sub(self, o: Vec3) -> Vec3 {
        Vec3::new(self.x - o.x, self.y - o.y, self.z - o.z)
    }
}

impl Mul for Vec3 {
    type Output = Vec3;
    fn mul(self, o: Vec3) -> Vec3 {
        Vec3::new(self.x * o.x, self.y * o.y, self.z * o.z)
    }
}

impl Div for Vec3 {
    type Output = Vec3;
    fn div(self, o: Vec3) -> Vec3 {
        Vec3::new(self.x / o.x, self.y / o.y, self.z / o.z)
    }
}

impl fmt::Display for Vec3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{},{})", self.x, self.y, self.z)
    }
}

/// Axis-aligned box with per-dimension [start, stop) bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Bbox {
    pub minpt: Vec3,
    pub maxpt: Vec3,
}

impl Bbox {
    pub fn new(minpt: Vec3, maxpt: Vec3) -> Self {
        Self { minpt, maxpt }
    }

    /// Box at `offset` spanning `size` voxels
    pub fn from_offset_size(offset: Vec3, size: Vec3) -> Self {
        Self::new(offset, offset + size)
    }

    /// Requires stop > start in every dimension
    pub fn validate(&self) -> Result<()> {
        for d in 0..3 {
            if self.maxpt[d] <= self.minpt[d] {
                return Err(VoxError::InvalidDimensions(format!(
                    "degenerate box {}: stop must exceed start",
                    self
                )));
            }
        }
        Ok(())
    }

    pub fn size3(&self) -> Vec3 {
        self.maxpt - self.minpt
    }

    /// Extents as usize, for array shapes
    pub fn shape(&self) -> [usize; 3] {
        let s = self.size3();
        [s.x as usize, s.y as usize, s.z as usize]
    }

    pub fn volume(&self) -> i64 {
        let s = self.size3();
        s.x * s.y * s.z
    }

    pub fn contains(&self, other: &Bbox) -> bool {
        self.minpt.x <= other.minpt.x
            && self.minpt.y <= other.minpt.y
            && self.minpt.z <= other.minpt.z
            && self.maxpt.x >= other.maxpt.x
            && self.maxpt.y >= other.maxpt.y
            && self.maxpt.z >= other.maxpt.z
    }

    /// Intersection, or None when the boxes do not overlap
    pub fn intersection(&self, other: &Bbox) -> Option<Bbox> {
        let minpt = self.minpt.max2(other.minpt);
        let maxpt = self.maxpt.min2(other.maxpt);
        if minpt.x < maxpt.x && minpt.y < maxpt.y && minpt.z < maxpt.z {
            Some(Bbox::new(minpt, maxpt))
        } else {
            None
        }
    }

    /// Translate by `delta`
    pub fn shift(&self, delta: Vec3) -> Bbox {
        Bbox::new(self.minpt + delta, self.maxpt + delta)
    }

    /// Chunk position string, `{x0}-{x1}_{y0}-{y1}_{z0}-{z1}`. This exact
    /// layout is part of the storage key format and must not change.
    pub fn to_chunk_position(&self) -> String {
        format!(
            "{}-{}_{}-{}_{}-{}",
            self.minpt.x, self.maxpt.x, self.minpt.y, self.maxpt.y, self.minpt.z, self.maxpt.z
        )
    }

    /// Parses a chunk position string. Coordinates are unsigned decimal;
    /// anything else is malformed.
    pub fn from_chunk_position(position: &str) -> Result<Bbox> {
        let malformed =
            || VoxError::Serialization(format!("malformed chunk position: {:?}", position));

        let mut coords = [0i64; 6];
        let mut n = 0;
        for axis in position.split('_') {
            for bound in axis.split('-') {
                if n >= 6 {
                    return Err(malformed());
                }
                coords[n] = bound.parse::<i64>().map_err(|_| malformed())?;
                n += 1;
            }
        }
        if n != 6 {
            return Err(malformed());
        }

        let bbox = Bbox::new(
            Vec3::new(coords[0], coords[2], coords[4]),
            Vec3::new(coords[1], coords[3], coords[5]),
        );
        bbox.validate()?;
        Ok(bbox)
    }
}

impl fmt::Display for Bbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}..{})", self.minpt, self.maxpt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_position_roundtrip() {
        let bbox = Bbox::new(Vec3::new(0, 64, 128), Vec3::new(64, 128, 192));
        assert_eq!(bbox.to_chunk_position(), "0-64_64-128_128-192");
        assert_eq!(Bbox::from_chunk_position("0-64_64-128_128-192").unwrap(), bbox);
    }

    #[test]
    fn test_chunk_position_malformed() {
        assert!(Bbox::from_chunk_position("0-64_64-128").is_err());
        assert!(Bbox::from_chunk_position("a-b_c-d_e-f").is_err());
        assert!(Bbox::from_chunk_position("0-64_64-128_128-192_0-1").is_err());
        // degenerate extent
        assert!(Bbox::from_chunk_position("0-0_0-64_0-64").is_err());
    }

    #[test]
    fn test_intersection() {
        let a = Bbox::new(Vec3::zero(), Vec3::splat(64));
        let b = Bbox::new(Vec3::splat(32), Vec3::splat(96));
        let i = a.intersection(&b).unwrap();
        assert_eq!(i, Bbox::new(Vec3::splat(32), Vec3::splat(64)));

        let c = Bbox::new(Vec3::splat(64), Vec3::splat(128));
        assert!(a.intersection(&c).is_none());
    }

    #[test]
    fn test_contains() {
        let outer = Bbox::new(Vec3::zero(), Vec3::splat(128));
        let inner = Bbox::new(Vec3::splat(32), Vec3::splat(64));
        assert!(outer.contains(&inner));
        assert!(!inner.contains(&outer));
    }
}
