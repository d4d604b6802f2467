//! Scale descriptors and chunk addressing: converting request boxes into
//! covering sets of grid-aligned chunk boxes

use crate::bbox::{Bbox, Vec3};
use crate::codec::Encoding;
use crate::error::{Result, VoxError};
use serde::{Deserialize, Serialize};

/// One resolution tier of a multiscale volume. Field names match the JSON
/// scale entries of the volume `info` document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scale {
    /// Storage key prefix for this scale's chunks, e.g. `"4_4_40"`
    pub key: String,
    /// Physical size per voxel
    pub resolution: [u32; 3],
    /// Coordinate of the volume origin corner, in voxels
    pub voxel_offset: [i64; 3],
    /// Chunk sizes; only the first entry is used
    pub chunk_sizes: Vec<[i64; 3]>,
    /// Volume extent in voxels
    pub size: [i64; 3],
    pub encoding: Encoding,
}

/// One chunk of a covering set: the grid-aligned chunk box and the sub-region
/// of the request it supplies. For aligned requests the two are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpan {
    pub chunk: Bbox,
    pub dest: Bbox,
}

impl ChunkSpan {
    /// True when the request fully covers the chunk, so a write can skip the
    /// read-modify-write fetch.
    pub fn is_full(&self) -> bool {
        self.chunk == self.dest
    }
}

impl Scale {
    pub fn offset(&self) -> Vec3 {
        Vec3::from_array(self.voxel_offset)
    }

    pub fn size3(&self) -> Vec3 {
        Vec3::from_array(self.size)
    }

    pub fn chunk_size(&self) -> Vec3 {
        Vec3::from_array(self.chunk_sizes[0])
    }

    /// Full voxel bounds of this scale
    pub fn bounds(&self) -> Bbox {
        Bbox::from_offset_size(self.offset(), self.size3())
    }

    /// Storage key for a chunk box: `{key}/{x0}-{x1}_{y0}-{y1}_{z0}-{z1}`
    pub fn chunk_key(&self, chunk: &Bbox) -> String {
        format!("{}/{}", self.key, chunk.to_chunk_position())
    }

    fn check_in_bounds(&self, request: &Bbox) -> Result<()> {
        request.validate()?;
        let offset = self.offset();
        let size = self.size3();
        for d in 0..3 {
            if request.minpt[d] - offset[d] < 0 {
                return Err(VoxError::NegativeIndex(format!(
                    "{} starts before the volume offset {} in dim {}",
                    request, offset, d
                )));
            }
            if request.maxpt[d] - offset[d] > size[d] {
                return Err(VoxError::OutOfBounds(format!(
                    "{} exceeds the volume bound {} in dim {}",
                    request,
                    offset + size,
                    d
                )));
            }
        }
        Ok(())
    }

    /// Minimal covering set of chunks intersecting `request`, each paired
    /// with its intersection. The intersections tile `request` exactly once.
    /// Alignment is not required; see [`Scale::decompose`] for the strict
    /// variant.
    pub fn covering(&self, request: &Bbox) -> Result<Vec<ChunkSpan>> {
        self.check_in_bounds(request)?;
        let offset = self.offset();
        let size = self.size3();
        let cs = self.chunk_size();

        let mut lo = [0i64; 3];
        let mut hi = [0i64; 3];
        for d in 0..3 {
            lo[d] = (request.minpt[d] - offset[d]) / cs[d];
            hi[d] = (request.maxpt[d] - offset[d] + cs[d] - 1) / cs[d];
        }

        let mut spans = Vec::new();
        for cx in lo[0]..hi[0] {
            for cy in lo[1]..hi[1] {
                for cz in lo[2]..hi[2] {
                    let start = offset + Vec3::new(cx * cs.x, cy * cs.y, cz * cs.z);
                    let stop = (start + cs).min2(offset + size);
                    let chunk = Bbox::new(start, stop);
                    // the chunk range was derived from the request, so the
                    // intersection always exists
                    let dest = match chunk.intersection(request) {
                        Some(dest) => dest,
                        None => continue,
                    };
                    spans.push(ChunkSpan { chunk, dest });
                }
            }
        }
        Ok(spans)
    }

    /// Covering set for a grid-aligned request. Per dimension the start must
    /// lie on the chunk grid and the stop must be on the grid or equal the
    /// volume bound (the ragged last chunk). Raggedness is only ever valid at
    /// the stop edge.
    pub fn decompose(&self, request: &Bbox) -> Result<Vec<ChunkSpan>> {
        self.check_in_bounds(request)?;
        let offset = self.offset();
        let size = self.size3();
        let cs = self.chunk_size();
        for d in 0..3 {
            let start = request.minpt[d] - offset[d];
            let stop = request.maxpt[d] - offset[d];
            if start % cs[d] != 0 {
                return Err(VoxError::Alignment(format!(
                    "{} start is not a multiple of chunk size {} in dim {}",
                    request, cs, d
                )));
            }
            if stop < size[d] && stop % cs[d] != 0 {
                return Err(VoxError::Alignment(format!(
                    "{} stop is neither chunk aligned nor the volume bound in dim {}",
                    request, d
                )));
            }
        }
        self.covering(request)
    }

    /// Smallest grid-aligned superset of `request`, plus the crop box
    /// (relative to the aligned box) that recovers the original request.
    pub fn align(&self, request: &Bbox) -> Result<(Bbox, Bbox)> {
        self.check_in_bounds(request)?;
        let offset = self.offset();
        let size = self.size3();
        let cs = self.chunk_size();

        let mut amin = [0i64; 3];
        let mut amax = [0i64; 3];
        let mut cmin = [0i64; 3];
        let mut cmax = [0i64; 3];
        for d in 0..3 {
            let start = request.minpt[d] - offset[d];
            let stop = request.maxpt[d] - offset[d];
            let aligned_start = start - start % cs[d];
            let aligned_stop = (stop + (cs[d] - stop % cs[d]) % cs[d]).min(size[d]);
            amin[d] = aligned_start + offset[d];
            amax[d] = aligned_stop + offset[d];
            cmin[d] = start - aligned_start;
            cmax[d] = stop - aligned_start;
        }
        let aligned = Bbox::new(Vec3::from_array(amin), Vec3::from_array(amax));
        let crop = Bbox::new(Vec3::from_array(cmin), Vec3::from_array(cmax));
        Ok((aligned, crop))
    }

    /// All chunk boxes of this scale, in x-major order
    pub fn chunk_grid(&self) -> Vec<Bbox> {
        let offset = self.offset();
        let bound = offset + self.size3();
        let cs = self.chunk_size();

        let mut grid = Vec::new();
        let mut x = offset.x;
        while x < bound.x {
            let mut y = offset.y;
            while y < bound.y {
                let mut z = offset.z;
                while z < bound.z {
                    let start = Vec3::new(x, y, z);
                    let stop = (start + cs).min2(bound);
                    grid.push(Bbox::new(start, stop));
                    z += cs.z;
                }
                y += cs.y;
            }
            x += cs.x;
        }
        grid
    }
}

/// Stopping criteria for pyramid planning
#[derive(Debug, Clone, Copy)]
pub struct DownsamplePlan {
    pub max_scales: usize,
    /// Maximum total volume reduction, e.g. 4x4x4 reduces by 64
    pub max_downsampling: i64,
    /// Stop once every dimension fits in this many voxels
    pub max_downsampled_size: i64,
}

impl Default for DownsamplePlan {
    fn default() -> Self {
        Self {
            max_scales: usize::MAX,
            max_downsampling: 64,
            max_downsampled_size: 128,
        }
    }
}

/// Successive cumulative downsampling factors, starting at (1,1,1). Each step
/// doubles the dimension with the smallest physical voxel size, dragging any
/// dimension along whose voxel size would otherwise fall further from the
/// target, which keeps the pyramid near isotropic.
pub fn near_isotropic_scale_factors(
    size: Vec3,
    resolution: [u32; 3],
    plan: &DownsamplePlan,
) -> Vec<[u32; 3]> {
    let mut cur = [1u32; 3];
    let mut factors = vec![cur];

    loop {
        let total: i64 = cur.iter().map(|&f| f as i64).product();
        let widest = (0..3)
            .map(|d| size[d] / cur[d] as i64)
            .max()
            .unwrap_or(0);
        if factors.len() >= plan.max_scales
            || total >= plan.max_downsampling
            || widest <= plan.max_downsampled_size
        {
            break;
        }

        let voxel: Vec<u64> = (0..3)
            .map(|d| cur[d] as u64 * resolution[d] as u64)
            .collect();
        let smallest = (0..3)
            .min_by_key(|&d| voxel[d])
            .unwrap_or(0);
        cur[smallest] *= 2;
        let target = voxel[smallest] * 2;
        for d in 0..3 {
            if d == smallest {
                continue;
            }
            let dist = voxel[d].abs_diff(target);
            let doubled_dist = (voxel[d] * 2).abs_diff(target);
            if dist > doubled_dist {
                cur[d] *= 2;
            }
        }
        factors.push(cur);
    }
    factors
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_scale() -> Scale {
        Scale {
            key: "1_1_1".to_string(),
            resolution: [1, 1, 1],
            voxel_offset: [0, 0, 0],
            chunk_sizes: vec![[64, 64, 64]],
            size: [128, 64, 64],
            encoding: Encoding::Raw,
        }
    }

    fn bbox(min: [i64; 3], max: [i64; 3]) -> Bbox {
        Bbox::new(Vec3::from_array(min), Vec3::from_array(max))
    }

    #[test]
    fn test_decompose_tiles_exactly() {
        let scale = test_scale();
        let request = bbox([0, 0, 0], [128, 64, 64]);
        let spans = scale.decompose(&request).unwrap();
        assert_eq!(spans.len(), 2);
        assert!(spans.iter().all(|s| s.is_full()));

        let tiled: i64 = spans.iter().map(|s| s.dest.volume()).sum();
        assert_eq!(tiled, request.volume());
        for (i, a) in spans.iter().enumerate() {
            for b in spans.iter().skip(i + 1) {
                assert!(a.dest.intersection(&b.dest).is_none());
            }
        }
    }

    #[test]
    fn test_decompose_rejects_unaligned_start() {
        let scale = test_scale();
        let err = scale.decompose(&bbox([31, 0, 0], [64, 64, 64])).unwrap_err();
        assert!(matches!(err, VoxError::Alignment(_)));
    }

    #[test]
    fn test_decompose_ragged_stop_ok() {
        let mut scale = test_scale();
        scale.size = [100, 64, 64];
        // 64..100 is the ragged last chunk
        let spans = scale.decompose(&bbox([64, 0, 0], [100, 64, 64])).unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].chunk, bbox([64, 0, 0], [100, 64, 64]));

        // a stop short of the ragged bound is not aligned
        assert!(scale.decompose(&bbox([64, 0, 0], [90, 64, 64])).is_err());
    }

    #[test]
    fn test_negative_and_out_of_bounds() {
        let mut scale = test_scale();
        scale.voxel_offset = [64, 0, 0];
        scale.size = [64, 64, 64];
        let err = scale.covering(&bbox([0, 0, 0], [64, 64, 64])).unwrap_err();
        assert!(matches!(err, VoxError::NegativeIndex(_)));

        let err = scale
            .covering(&bbox([64, 0, 0], [256, 64, 64]))
            .unwrap_err();
        assert!(matches!(err, VoxError::OutOfBounds(_)));
    }

    #[test]
    fn test_align() {
        let scale = test_scale();
        let (aligned, crop) = scale.align(&bbox([31, 0, 0], [65, 64, 64])).unwrap();
        assert_eq!(aligned, bbox([0, 0, 0], [128, 64, 64]));
        assert_eq!(crop, bbox([31, 0, 0], [65, 64, 64]));
    }

    #[test]
    fn test_align_with_offset() {
        let mut scale = test_scale();
        scale.voxel_offset = [64, 0, 0];
        scale.size = [128, 64, 64];
        let (aligned, crop) = scale.align(&bbox([96, 0, 0], [160, 64, 64])).unwrap();
        assert_eq!(aligned, bbox([64, 0, 0], [192, 64, 64]));
        assert_eq!(crop, bbox([32, 0, 0], [96, 64, 64]));
    }

    #[test]
    fn test_chunk_grid() {
        let mut scale = test_scale();
        scale.size = [128, 100, 64];
        let grid = scale.chunk_grid();
        assert_eq!(grid.len(), 2 * 2 * 1);
        // ragged in y
        assert!(grid.contains(&bbox([0, 64, 0], [64, 100, 64])));
    }

    #[test]
    fn test_chunk_key_format() {
        let scale = test_scale();
        let key = scale.chunk_key(&bbox([0, 64, 0], [64, 128, 64]));
        assert_eq!(key, "1_1_1/0-64_64-128_0-64");
    }

    #[test]
    fn test_near_isotropic_factors() {
        let factors = near_isotropic_scale_factors(
            Vec3::new(2048, 2048, 256),
            [4, 4, 40],
            &DownsamplePlan::default(),
        );
        assert_eq!(factors, vec![[1, 1, 1], [2, 2, 1], [4, 4, 1], [8, 8, 1]]);
    }
}
