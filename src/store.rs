//! Box-oriented access to a chunked multiscale volume. Arbitrary request
//! boxes are realigned onto the chunk grid for reads and read-modify-written
//! for partial chunks on writes.

use crate::bbox::{Bbox, Vec3};
use crate::codec;
use crate::error::{Result, VoxError};
use crate::io::BlobStore;
use crate::layout::Scale;
use crate::metadata::{DataLayerProvenance, VolumeInfo};
use crate::pool::FanoutPool;
use crate::types::Voxel;
use bytes::Bytes;
use futures::future::try_join_all;
use ndarray::{s, Array4, ArrayView4};
use parking_lot::RwLock;
use std::sync::Arc;

pub const INFO_KEY: &str = "info";
pub const PROVENANCE_KEY: &str = "provenance";

const DEFAULT_CONCURRENCY: usize = 16;

/// A multiscale chunked volume in blob storage.
///
/// Reads of missing chunks zero-fill by default (`fill_missing`); turning
/// that off makes a missing chunk a hard [`VoxError::EmptyVolume`] error,
/// which the downsampling pipeline relies on to skip never-ingested regions.
pub struct VolumeStore {
    store: Arc<dyn BlobStore>,
    info: RwLock<VolumeInfo>,
    fill_missing: bool,
    concurrency: usize,
}

impl std::fmt::Debug for VolumeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeStore")
            .field("info", &*self.info.read())
            .field("fill_missing", &self.fill_missing)
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}

impl VolumeStore {
    /// Opens an existing volume by reading its `info` document.
    pub async fn open(store: Arc<dyn BlobStore>) -> Result<Self> {
        let bytes = store
            .get(INFO_KEY)
            .await?
            .ok_or_else(|| VoxError::NotFound("volume has no info document".into()))?;
        let info = VolumeInfo::from_json(&bytes)?;
        Ok(Self {
            store,
            info: RwLock::new(info),
            fill_missing: true,
            concurrency: DEFAULT_CONCURRENCY,
        })
    }

    /// Creates a volume, writing the `info` document.
    pub async fn create(store: Arc<dyn BlobStore>, info: VolumeInfo) -> Result<Self> {
        info.validate()?;
        let vol = Self {
            store,
            info: RwLock::new(info),
            fill_missing: true,
            concurrency: DEFAULT_CONCURRENCY,
        };
        vol.commit_info().await?;
        Ok(vol)
    }

    pub fn with_fill_missing(mut self, fill_missing: bool) -> Self {
        self.fill_missing = fill_missing;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn info(&self) -> VolumeInfo {
        self.info.read().clone()
    }

    pub fn scale(&self, mip: usize) -> Result<Scale> {
        Ok(self.info.read().scale(mip)?.clone())
    }

    pub fn mip_bounds(&self, mip: usize) -> Result<Bbox> {
        Ok(self.scale(mip)?.bounds())
    }

    pub fn num_mips(&self) -> usize {
        self.info.read().scales.len()
    }

    pub fn blob_store(&self) -> Arc<dyn BlobStore> {
        Arc::clone(&self.store)
    }

    /// Registers a downsampled scale derived from the base tier. The change
    /// is in-memory until [`VolumeStore::commit_info`].
    pub fn add_scale(&self, factor: [u32; 3]) -> Result<usize> {
        self.info.write().add_scale(factor)
    }

    /// Publishes the current info document in a single put, so readers see
    /// either the old or the new scale list, never a partial one.
    pub async fn commit_info(&self) -> Result<()> {
        let bytes = { self.info.read().to_json()? };
        self.store.put(INFO_KEY, Bytes::from(bytes), false).await
    }

    pub async fn provenance(&self) -> Result<Option<DataLayerProvenance>> {
        match self.store.get(PROVENANCE_KEY).await? {
            Some(bytes) => Ok(Some(DataLayerProvenance::from_json(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn commit_provenance(&self, prov: &DataLayerProvenance) -> Result<()> {
        self.store
            .put(PROVENANCE_KEY, Bytes::from(prov.to_json()?), false)
            .await
    }

    fn check_data_type<T: Voxel>(&self) -> Result<usize> {
        let info = self.info.read();
        if info.data_type != T::DATA_TYPE {
            return Err(VoxError::DataTypeMismatch {
                expected: info.data_type.to_string(),
                actual: T::DATA_TYPE.to_string(),
            });
        }
        Ok(info.num_channels)
    }

    /// Reads an arbitrary box at `mip`. The request is grown to the smallest
    /// chunk-aligned superset, chunks are fetched concurrently and spliced,
    /// then the result is cropped back to the request.
    pub async fn read<T: Voxel>(&self, mip: usize, request: &Bbox) -> Result<Array4<T>> {
        let channels = self.check_data_type::<T>()?;
        let scale = self.scale(mip)?;

        let (aligned, crop) = scale.align(request)?;
        let spans = scale.decompose(&aligned)?;

        let fetches = spans.iter().map(|span| {
            let key = scale.chunk_key(&span.chunk);
            let store = Arc::clone(&self.store);
            async move { store.get(&key).await.map(|bytes| (key, bytes)) }
        });
        let payloads = try_join_all(fetches).await?;

        let shape = aligned.shape();
        let mut buffer = Array4::from_elem((shape[0], shape[1], shape[2], channels), T::zero());
        for (span, (key, bytes)) in spans.iter().zip(payloads) {
            match bytes {
                Some(bytes) => {
                    let chunk =
                        codec::decode::<T>(scale.encoding, &bytes, span.chunk.shape(), channels)?;
                    let rel = span.chunk.shift(Vec3::zero() - aligned.minpt);
                    buffer
                        .slice_mut(s![
                            rel.minpt.x as usize..rel.maxpt.x as usize,
                            rel.minpt.y as usize..rel.maxpt.y as usize,
                            rel.minpt.z as usize..rel.maxpt.z as usize,
                            ..
                        ])
                        .assign(&chunk);
                }
                None if self.fill_missing => {}
                None => return Err(VoxError::EmptyVolume(key)),
            }
        }

        Ok(buffer
            .slice(s![
                crop.minpt.x as usize..crop.maxpt.x as usize,
                crop.minpt.y as usize..crop.maxpt.y as usize,
                crop.minpt.z as usize..crop.maxpt.z as usize,
                ..
            ])
            .to_owned())
    }

    /// Writes a box at `mip`. Fully covered chunks are encoded directly;
    /// partially covered ones are read, spliced and rewritten. A missing
    /// chunk under a partial write starts from zeros.
    pub async fn write<T: Voxel>(
        &self,
        mip: usize,
        request: &Bbox,
        data: ArrayView4<'_, T>,
    ) -> Result<()> {
        let channels = self.check_data_type::<T>()?;
        let scale = self.scale(mip)?;

        let shape = request.shape();
        if data.dim() != (shape[0], shape[1], shape[2], channels) {
            return Err(VoxError::InvalidDimensions(format!(
                "data shape {:?} does not match request {} with {} channels",
                data.dim(),
                request,
                channels
            )));
        }

        let spans = scale.covering(request)?;
        let compress = scale.encoding.wants_storage_compression();
        let pool = FanoutPool::new(self.concurrency, self.concurrency * 2);

        for span in spans {
            // the slice of the caller's data feeding this chunk
            let rel = span.dest.shift(Vec3::zero() - request.minpt);
            let part = data
                .slice(s![
                    rel.minpt.x as usize..rel.maxpt.x as usize,
                    rel.minpt.y as usize..rel.maxpt.y as usize,
                    rel.minpt.z as usize..rel.maxpt.z as usize,
                    ..
                ])
                .to_owned();

            let store = Arc::clone(&self.store);
            let scale = scale.clone();
            pool.put(async move {
                let key = scale.chunk_key(&span.chunk);
                let payload = if span.is_full() {
                    codec::encode::<T>(scale.encoding, part.view())?
                } else {
                    let shape = span.chunk.shape();
                    let mut chunk = match store.get(&key).await? {
                        Some(bytes) => {
                            codec::decode::<T>(scale.encoding, &bytes, shape, channels)?
                        }
                        None => Array4::from_elem(
                            (shape[0], shape[1], shape[2], channels),
                            T::zero(),
                        ),
                    };
                    let dest = span
                        .dest
                        .shift(Vec3::zero() - span.chunk.minpt);
                    chunk
                        .slice_mut(s![
                            dest.minpt.x as usize..dest.maxpt.x as usize,
                            dest.minpt.y as usize..dest.maxpt.y as usize,
                            dest.minpt.z as usize..dest.maxpt.z as usize,
                            ..
                        ])
                        .assign(&part);
                    codec::encode::<T>(scale.encoding, chunk.view())?
                };
                store.put(&key, Bytes::from(payload), compress).await
            })
            .await?;
        }

        pool.wait().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bbox::Vec3;
    use crate::codec::Encoding;
    use crate::io::MemoryStore;
    use crate::types::{DataType, LayerType};

    fn test_info() -> VolumeInfo {
        VolumeInfo::new(
            DataType::U16,
            1,
            LayerType::Image,
            Scale {
                key: "1_1_1".to_string(),
                resolution: [1, 1, 1],
                voxel_offset: [0, 0, 0],
                chunk_sizes: vec![[64, 64, 64]],
                size: [128, 64, 64],
                encoding: Encoding::Raw,
            },
        )
    }

    fn bbox(min: [i64; 3], max: [i64; 3]) -> Bbox {
        Bbox::new(Vec3::from_array(min), Vec3::from_array(max))
    }

    async fn test_volume() -> VolumeStore {
        VolumeStore::create(Arc::new(MemoryStore::new()), test_info())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_write_read_aligned() {
        let vol = test_volume().await;
        let data = Array4::from_shape_fn((128, 64, 64, 1), |(x, y, z, _)| {
            (x + y + z) as u16
        });
        let full = bbox([0, 0, 0], [128, 64, 64]);
        vol.write(0, &full, data.view()).await.unwrap();
        let back = vol.read::<u16>(0, &full).await.unwrap();
        assert_eq!(back, data);
    }

    #[tokio::test]
    async fn test_read_unaligned_crops() {
        let vol = test_volume().await;
        let data = Array4::from_shape_fn((128, 64, 64, 1), |(x, y, z, _)| {
            (x * 3 + y * 5 + z * 7) as u16
        });
        let full = bbox([0, 0, 0], [128, 64, 64]);
        vol.write(0, &full, data.view()).await.unwrap();

        let request = bbox([31, 10, 5], [65, 40, 20]);
        let back = vol.read::<u16>(0, &request).await.unwrap();
        assert_eq!(back.dim(), (34, 30, 15, 1));
        assert_eq!(back[[0, 0, 0, 0]], data[[31, 10, 5, 0]]);
        assert_eq!(back[[33, 29, 14, 0]], data[[64, 39, 19, 0]]);
    }

    #[tokio::test]
    async fn test_partial_write_rmw() {
        let vol = test_volume().await;
        let ones = Array4::from_elem((64, 64, 64, 1), 1u16);
        vol.write(0, &bbox([0, 0, 0], [64, 64, 64]), ones.view())
            .await
            .unwrap();

        let twos = Array4::from_elem((10, 10, 10, 1), 2u16);
        vol.write(0, &bbox([5, 5, 5], [15, 15, 15]), twos.view())
            .await
            .unwrap();

        let back = vol
            .read::<u16>(0, &bbox([0, 0, 0], [64, 64, 64]))
            .await
            .unwrap();
        assert_eq!(back[[4, 5, 5, 0]], 1);
        assert_eq!(back[[5, 5, 5, 0]], 2);
        assert_eq!(back[[14, 14, 14, 0]], 2);
        assert_eq!(back[[15, 15, 15, 0]], 1);
    }

    #[tokio::test]
    async fn test_partial_write_into_missing_chunk() {
        let vol = test_volume().await;
        let twos = Array4::from_elem((8, 8, 8, 1), 2u16);
        vol.write(0, &bbox([0, 0, 0], [8, 8, 8]), twos.view())
            .await
            .unwrap();
        let back = vol
            .read::<u16>(0, &bbox([0, 0, 0], [64, 64, 64]))
            .await
            .unwrap();
        assert_eq!(back[[0, 0, 0, 0]], 2);
        assert_eq!(back[[8, 8, 8, 0]], 0);
    }

    #[tokio::test]
    async fn test_fill_missing_toggle() {
        let vol = test_volume().await;
        let request = bbox([0, 0, 0], [64, 64, 64]);
        let back = vol.read::<u16>(0, &request).await.unwrap();
        assert!(back.iter().all(|&v| v == 0));

        let strict = VolumeStore::open(vol.blob_store())
            .await
            .unwrap()
            .with_fill_missing(false);
        let err = strict.read::<u16>(0, &request).await.unwrap_err();
        assert!(matches!(err, VoxError::EmptyVolume(_)));
    }

    #[tokio::test]
    async fn test_data_type_mismatch() {
        let vol = test_volume().await;
        let err = vol
            .read::<u8>(0, &bbox([0, 0, 0], [64, 64, 64]))
            .await
            .unwrap_err();
        assert!(matches!(err, VoxError::DataTypeMismatch { .. }));
    }

    #[tokio::test]
    async fn test_write_shape_mismatch() {
        let vol = test_volume().await;
        let data = Array4::from_elem((8, 8, 8, 1), 1u16);
        let err = vol
            .write(0, &bbox([0, 0, 0], [16, 8, 8]), data.view())
            .await
            .unwrap_err();
        assert!(matches!(err, VoxError::InvalidDimensions(_)));
    }

    #[tokio::test]
    async fn test_open_missing_info() {
        let err = VolumeStore::open(Arc::new(MemoryStore::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, VoxError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_commit_info_roundtrip() {
        let vol = test_volume().await;
        vol.add_scale([2, 2, 2]).unwrap();
        vol.commit_info().await.unwrap();
        let reopened = VolumeStore::open(vol.blob_store()).await.unwrap();
        assert_eq!(reopened.num_mips(), 2);
        assert_eq!(reopened.scale(1).unwrap().key, "2_2_2");
    }
}
