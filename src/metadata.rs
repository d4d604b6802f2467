//! Volume metadata documents: the `info` descriptor and layer provenance

use crate::codec::Encoding;
use crate::error::{Result, VoxError};
use crate::layout::Scale;
use crate::types::{DataType, LayerType};
use serde::{Deserialize, Serialize};

/// The `info` JSON document describing a multiscale volume. `scales[0]` is
/// the full-resolution tier; each further entry is a downsampled mip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub data_type: DataType,
    pub num_channels: usize,
    #[serde(rename = "type")]
    pub layer_type: LayerType,
    /// Sub-path of the mesh directory, segmentation layers only
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub mesh: Option<String>,
    pub scales: Vec<Scale>,
}

impl VolumeInfo {
    /// Descriptor with a single full-resolution scale.
    pub fn new(
        data_type: DataType,
        num_channels: usize,
        layer_type: LayerType,
        base: Scale,
    ) -> Self {
        Self {
            data_type,
            num_channels,
            layer_type,
            mesh: None,
            scales: vec![base],
        }
    }

    pub fn with_mesh(mut self, mesh: impl Into<String>) -> Self {
        self.mesh = Some(mesh.into());
        self
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let info: VolumeInfo = serde_json::from_slice(bytes)?;
        info.validate()?;
        Ok(info)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_channels == 0 {
            return Err(VoxError::Metadata("num_channels must be positive".into()));
        }
        if self.scales.is_empty() {
            return Err(VoxError::Metadata("info has no scales".into()));
        }
        for scale in &self.scales {
            if scale.chunk_sizes.is_empty() {
                return Err(VoxError::Metadata(format!(
                    "scale {} has no chunk sizes",
                    scale.key
                )));
            }
            if scale.size.iter().any(|&s| s <= 0)
                || scale.chunk_sizes[0].iter().any(|&s| s <= 0)
            {
                return Err(VoxError::Metadata(format!(
                    "scale {} has a non-positive extent",
                    scale.key
                )));
            }
            if scale.encoding == Encoding::Jpeg && self.data_type != DataType::U8 {
                return Err(VoxError::Metadata(format!(
                    "scale {} uses jpeg encoding with {} data",
                    scale.key, self.data_type
                )));
            }
        }
        Ok(())
    }

    pub fn scale(&self, mip: usize) -> Result<&Scale> {
        self.scales
            .get(mip)
            .ok_or_else(|| VoxError::NotFound(format!("no scale at mip {}", mip)))
    }

    pub fn scale_by_key(&self, key: &str) -> Option<(usize, &Scale)> {
        self.scales
            .iter()
            .enumerate()
            .find(|(_, s)| s.key == key)
    }

    /// Storage key prefix for a resolution, e.g. `[4, 4, 40]` -> `"4_4_40"`
    pub fn scale_key(resolution: [u32; 3]) -> String {
        format!("{}_{}_{}", resolution[0], resolution[1], resolution[2])
    }

    /// Derives a downsampled scale from the full-resolution tier by a
    /// cumulative `factor` and registers it. A scale with the same resolution
    /// is replaced in place, so re-planning a pyramid is idempotent. Returns
    /// the mip index of the scale.
    pub fn add_scale(&mut self, factor: [u32; 3]) -> Result<usize> {
        let base = self.scale(0)?;
        let mut resolution = [0u32; 3];
        let mut voxel_offset = [0i64; 3];
        let mut size = [0i64; 3];
        for d in 0..3 {
            let f = factor[d] as i64;
            resolution[d] = base.resolution[d] * factor[d];
            voxel_offset[d] = (base.voxel_offset[d] + f - 1) / f;
            size[d] = (base.size[d] + f - 1) / f;
        }
        let scale = Scale {
            key: Self::scale_key(resolution),
            resolution,
            voxel_offset,
            chunk_sizes: base.chunk_sizes.clone(),
            size,
            encoding: base.encoding,
        };

        if let Some(mip) = self.scales.iter().position(|s| s.resolution == resolution) {
            self.scales[mip] = scale;
            Ok(mip)
        } else {
            self.scales.push(scale);
            Ok(self.scales.len() - 1)
        }
    }
}

/// One step in a layer's processing history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingEntry {
    pub method: String,
    /// Contact of whoever ran the step, e.g. an email address
    pub by: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub date: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub description: Option<String>,
}

impl ProcessingEntry {
    pub fn now(method: impl Into<String>, by: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            by: by.into(),
            date: Some(chrono::Utc::now()),
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// The `provenance` JSON document stored next to `info`, recording where a
/// layer came from and what has been done to it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataLayerProvenance {
    pub description: String,
    /// Upstream layer paths this one was derived from
    pub sources: Vec<String>,
    pub processing: Vec<ProcessingEntry>,
    pub owners: Vec<String>,
}

impl DataLayerProvenance {
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}
