//! Pipeline task definitions, execution and producers. Tasks are serialized
//! as JSON with a `class` discriminator and are written to be idempotent:
//! re-running a task overwrites the same output chunks.

use crate::bbox::{Bbox, Vec3};
use crate::codec::{self, Encoding};
use crate::downsample::{
    downsample_for_layer, downsample_with_averaging, downsample_with_striding,
};
use crate::error::{Result, VoxError};
use crate::io::{create_store, BlobStore};
use crate::layout::{near_isotropic_scale_factors, DownsamplePlan};
use crate::metadata::VolumeInfo;
use crate::queue::TaskQueue;
use crate::store::VolumeStore;
use crate::types::{DataType, Label, LayerType, Voxel};
use crate::{with_data_type, with_label_type};
use async_trait::async_trait;
use bytes::Bytes;
use ndarray::{s, Array4};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Prefix under which ingest source chunks live
pub const BUILD_PREFIX: &str = "build/";

/// Simplification factor mesh producers request by default
const DEFAULT_SIMPLIFICATION: u32 = 5;

/// A unit of pipeline work, in its wire form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "class")]
pub enum Task {
    /// Ingests one source chunk from the build directory into every scale of
    /// the layer, striding down to each resolution.
    IngestTask {
        /// Storage key of the source chunk, ending in its position string
        chunk_path: String,
        chunk_encoding: Encoding,
        layer_path: String,
    },
    /// Produces one chunk of a downsampled scale from the scale above it.
    DownsampleTask {
        /// `{scale_key}/{position}` of the output chunk
        chunk_path: String,
        layer_path: String,
    },
    /// Meshes the objects of one segmentation chunk and stores one fragment
    /// blob per object id under the layer's mesh directory.
    MeshTask {
        /// `{scale_key}/{position}` of the chunk to mesh
        chunk_path: String,
        layer_path: String,
        lod: u32,
        simplification: u32,
        /// Object ids to mesh; empty meshes everything
        segments: Vec<u64>,
    },
    /// Groups stored mesh fragments by object id and writes the per-id
    /// manifests viewers use to find them.
    MeshManifestTask { layer_path: String, lod: u32 },
    /// Segments a box of an affinity layer and writes the cropped labels
    /// into a segmentation layer.
    WatershedTask {
        chunk_position: String,
        crop_position: String,
        layer_path_affinities: String,
        layer_path_segmentation: String,
        high_threshold: f32,
        low_threshold: f32,
        merge_threshold: f32,
        merge_size: u64,
        dust_size: u64,
    },
}

impl Task {
    /// Queue tag, used to lease only one kind of work
    pub fn tag(&self) -> &'static str {
        match self {
            Task::IngestTask { .. } => "IngestTask",
            Task::DownsampleTask { .. } => "DownsampleTask",
            Task::MeshTask { .. } => "MeshTask",
            Task::MeshManifestTask { .. } => "MeshManifestTask",
            Task::WatershedTask { .. } => "WatershedTask",
        }
    }

    pub async fn execute(&self, ctx: &TaskContext) -> Result<()> {
        tracing::info!(task = self.tag(), "executing task");
        match self {
            Task::IngestTask {
                chunk_path,
                chunk_encoding,
                layer_path,
            } => execute_ingest(chunk_path, *chunk_encoding, layer_path, ctx).await,
            Task::DownsampleTask {
                chunk_path,
                layer_path,
            } => execute_downsample(chunk_path, layer_path, ctx).await,
            Task::MeshTask {
                chunk_path,
                layer_path,
                lod,
                simplification,
                segments,
            } => execute_mesh(chunk_path, layer_path, *lod, *simplification, segments, ctx).await,
            Task::MeshManifestTask { layer_path, lod } => {
                execute_mesh_manifest(layer_path, *lod, ctx).await
            }
            Task::WatershedTask {
                chunk_position,
                crop_position,
                layer_path_affinities,
                layer_path_segmentation,
                high_threshold,
                low_threshold,
                merge_threshold,
                merge_size,
                dust_size,
            } => {
                let params = WatershedParams {
                    high_threshold: *high_threshold,
                    low_threshold: *low_threshold,
                    merge_threshold: *merge_threshold,
                    merge_size: *merge_size,
                    dust_size: *dust_size,
                };
                execute_watershed(
                    chunk_position,
                    crop_position,
                    layer_path_affinities,
                    layer_path_segmentation,
                    &params,
                    ctx,
                )
                .await
            }
        }
    }
}

/// Resolves layer paths to open volumes.
#[async_trait]
pub trait LayerProvider: Send + Sync {
    async fn open(&self, layer_path: &str) -> Result<VolumeStore>;
}

/// Path-keyed registry of blob stores. Registered paths resolve to their
/// stores; anything else falls through to [`create_store`], so `file://`
/// layers work unregistered while in-memory layers can be shared across
/// tasks.
#[derive(Default)]
pub struct LayerRegistry {
    layers: RwLock<HashMap<String, Arc<dyn BlobStore>>>,
}

impl LayerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, layer_path: impl Into<String>, store: Arc<dyn BlobStore>) {
        self.layers.write().insert(layer_path.into(), store);
    }
}

#[async_trait]
impl LayerProvider for LayerRegistry {
    async fn open(&self, layer_path: &str) -> Result<VolumeStore> {
        let registered = self.layers.read().get(layer_path).cloned();
        let store = match registered {
            Some(store) => store,
            None => create_store(layer_path)?,
        };
        VolumeStore::open(store).await
    }
}

/// Thresholds handed to the watershed implementation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WatershedParams {
    pub high_threshold: f32,
    pub low_threshold: f32,
    pub merge_threshold: f32,
    pub merge_size: u64,
    pub dust_size: u64,
}

/// External segmentation algorithm: affinities in, object labels out. The
/// returned array must have the input's spatial shape and a single channel.
pub trait Segmenter: Send + Sync {
    fn segment(&self, affinities: Array4<f32>, params: &WatershedParams) -> Result<Array4<u64>>;
}

/// Mesh geometry for one object id. Vertices are (x, y, z) triples in
/// chunk-local voxel coordinates; faces index into them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeshData {
    pub vertices: Vec<f32>,
    pub faces: Vec<u32>,
}

/// External marching-cubes collaborator: single-channel object labels in,
/// per-id mesh geometry out.
pub trait Mesher: Send + Sync {
    fn mesh(&self, labels: Array4<u64>, simplification: u32) -> Result<BTreeMap<u64, MeshData>>;
}

/// Shared collaborators task execution needs
#[derive(Clone)]
pub struct TaskContext {
    pub layers: Arc<dyn LayerProvider>,
    pub segmenter: Option<Arc<dyn Segmenter>>,
    pub mesher: Option<Arc<dyn Mesher>>,
}

impl TaskContext {
    pub fn new(layers: Arc<dyn LayerProvider>) -> Self {
        Self {
            layers,
            segmenter: None,
            mesher: None,
        }
    }

    pub fn with_segmenter(mut self, segmenter: Arc<dyn Segmenter>) -> Self {
        self.segmenter = Some(segmenter);
        self
    }

    pub fn with_mesher(mut self, mesher: Arc<dyn Mesher>) -> Self {
        self.mesher = Some(mesher);
        self
    }
}

/// Splits `{...}/{key}/{position}` into the key segment and the parsed
/// position box.
fn split_chunk_path(chunk_path: &str) -> Result<(String, Bbox)> {
    let mut parts = chunk_path.rsplitn(3, '/');
    let position = parts
        .next()
        .ok_or_else(|| VoxError::Task(format!("malformed chunk path: {}", chunk_path)))?;
    let key = parts
        .next()
        .ok_or_else(|| VoxError::Task(format!("chunk path has no scale key: {}", chunk_path)))?;
    Ok((key.to_string(), Bbox::from_chunk_position(position)?))
}

fn scale_ratio(dest: [u32; 3], src: [u32; 3]) -> Result<[usize; 3]> {
    let mut ratio = [0usize; 3];
    for d in 0..3 {
        if src[d] == 0 || dest[d] % src[d] != 0 {
            return Err(VoxError::Task(format!(
                "resolution {:?} is not an integer multiple of {:?}",
                dest, src
            )));
        }
        ratio[d] = (dest[d] / src[d]) as usize;
    }
    Ok(ratio)
}

async fn execute_ingest(
    chunk_path: &str,
    chunk_encoding: Encoding,
    layer_path: &str,
    ctx: &TaskContext,
) -> Result<()> {
    let volume = ctx.layers.open(layer_path).await?;
    let info = volume.info();
    let (_, bbox) = split_chunk_path(chunk_path)?;
    let bytes = volume
        .blob_store()
        .get(chunk_path)
        .await?
        .ok_or_else(|| VoxError::NotFound(format!("build chunk {} is missing", chunk_path)))?;

    with_data_type!(info.data_type, T => {
        ingest_chunk::<T>(&volume, &info, chunk_encoding, &bytes, &bbox).await
    })
}

/// Writes one decoded build chunk into every scale, striding the source data
/// down to each resolution. Striding keeps scales self-consistent enough for
/// the ingest pass; the downsample tasks recompute them properly.
async fn ingest_chunk<T: Voxel>(
    volume: &VolumeStore,
    info: &VolumeInfo,
    encoding: Encoding,
    bytes: &[u8],
    bbox: &Bbox,
) -> Result<()> {
    let data = codec::decode::<T>(encoding, bytes, bbox.shape(), info.num_channels)?;
    let base_res = info.scale(0)?.resolution;

    for (mip, scale) in info.scales.iter().enumerate() {
        let ratio = scale_ratio(scale.resolution, base_res)?;
        let shrunk = downsample_with_striding(data.view(), ratio);

        let ratio_v = Vec3::new(ratio[0] as i64, ratio[1] as i64, ratio[2] as i64);
        let dest_min = bbox.minpt / ratio_v;
        let (dx, dy, dz, _) = shrunk.dim();
        let bound = scale.offset() + scale.size3();
        let dest_max = (dest_min + Vec3::new(dx as i64, dy as i64, dz as i64)).min2(bound);
        let dest = Bbox::new(dest_min, dest_max);
        dest.validate()?;

        let shape = dest.shape();
        let view = shrunk.slice(s![..shape[0], ..shape[1], ..shape[2], ..]);
        volume.write(mip, &dest, view).await?;
    }
    Ok(())
}

async fn execute_downsample(chunk_path: &str, layer_path: &str, ctx: &TaskContext) -> Result<()> {
    // missing input must be a hard error here, not a silent zero fill
    let volume = ctx.layers.open(layer_path).await?.with_fill_missing(false);
    let info = volume.info();
    let (key, dest_box) = split_chunk_path(chunk_path)?;

    let (mip, dest_scale) = info
        .scale_by_key(&key)
        .ok_or_else(|| VoxError::NotFound(format!("no scale with key {}", key)))?;
    if mip == 0 {
        return Err(VoxError::Task(format!(
            "cannot downsample into the base scale {}",
            key
        )));
    }
    let src_scale = info.scale(mip - 1)?;
    let ratio = scale_ratio(dest_scale.resolution, src_scale.resolution)?;

    let ratio_v = Vec3::new(ratio[0] as i64, ratio[1] as i64, ratio[2] as i64);
    let src_bound = src_scale.offset() + src_scale.size3();
    let src_box = Bbox::new(
        dest_box.minpt * ratio_v,
        (dest_box.maxpt * ratio_v).min2(src_bound),
    );

    if info.data_type.is_integer() {
        with_label_type!(info.data_type, T => {
            downsample_one_chunk::<T>(&volume, mip, &src_box, &dest_box, ratio, info.layer_type)
                .await
        }, else => Err(VoxError::Task(
            "integer data type did not dispatch".into(),
        )))
    } else if info.layer_type.is_discrete() {
        Err(VoxError::Task("segmentation layer holds float data".into()))
    } else {
        downsample_one_chunk_avg::<f32>(&volume, mip, &src_box, &dest_box, ratio).await
    }
}

async fn read_downsample_input<T: Voxel>(
    volume: &VolumeStore,
    mip: usize,
    src_box: &Bbox,
) -> Result<Option<Array4<T>>> {
    match volume.read::<T>(mip - 1, src_box).await {
        Ok(data) => Ok(Some(data)),
        Err(VoxError::EmptyVolume(key)) => {
            // never-ingested region; the task completes without output
            tracing::warn!(chunk = %key, "downsample input missing, skipping");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

async fn downsample_one_chunk_avg<T: Voxel>(
    volume: &VolumeStore,
    mip: usize,
    src_box: &Bbox,
    dest_box: &Bbox,
    ratio: [usize; 3],
) -> Result<()> {
    let Some(src) = read_downsample_input::<T>(volume, mip, src_box).await? else {
        return Ok(());
    };
    let out = downsample_with_averaging(src.view(), ratio);
    volume.write(mip, dest_box, out.view()).await
}

async fn downsample_one_chunk<T: Label>(
    volume: &VolumeStore,
    mip: usize,
    src_box: &Bbox,
    dest_box: &Bbox,
    ratio: [usize; 3],
    layer_type: LayerType,
) -> Result<()> {
    let Some(src) = read_downsample_input::<T>(volume, mip, src_box).await? else {
        return Ok(());
    };
    let out = downsample_for_layer(layer_type, src.view(), ratio);
    volume.write(mip, dest_box, out.view()).await
}

async fn execute_mesh(
    chunk_path: &str,
    layer_path: &str,
    lod: u32,
    simplification: u32,
    segments: &[u64],
    ctx: &TaskContext,
) -> Result<()> {
    let mesher = ctx
        .mesher
        .clone()
        .ok_or_else(|| VoxError::Configuration("no mesher configured".into()))?;

    let volume = ctx.layers.open(layer_path).await?;
    let info = volume.info();
    let mesh_dir = info
        .mesh
        .clone()
        .ok_or_else(|| VoxError::Metadata("layer info names no mesh directory".into()))?;

    let (key, bbox) = split_chunk_path(chunk_path)?;
    let (mip, scale) = info
        .scale_by_key(&key)
        .ok_or_else(|| VoxError::NotFound(format!("no scale with key {}", key)))?;
    let resolution = scale.resolution;

    with_label_type!(info.data_type, T => {
        mesh_chunk::<T>(
            &volume,
            &mesh_dir,
            mip,
            &bbox,
            resolution,
            lod,
            simplification,
            segments,
            mesher.as_ref(),
        )
        .await
    }, else => Err(VoxError::Task("mesh layer holds float data".into())))
}

/// Meshes one chunk's labels and stores a `{mesh_dir}/{id}:{lod}:{position}`
/// fragment per object. The mesher returns chunk-local voxel coordinates;
/// fragments carry physical positions.
#[allow(clippy::too_many_arguments)]
async fn mesh_chunk<T: Label>(
    volume: &VolumeStore,
    mesh_dir: &str,
    mip: usize,
    bbox: &Bbox,
    resolution: [u32; 3],
    lod: u32,
    simplification: u32,
    segments: &[u64],
    mesher: &dyn Mesher,
) -> Result<()> {
    let labels = volume.read::<T>(mip, bbox).await?.mapv(Label::to_u64);
    let meshes = mesher.mesh(labels, simplification)?;
    let store = volume.blob_store();

    for (id, mut mesh) in meshes {
        // 0 is background, never meshed
        if id == 0 || (!segments.is_empty() && !segments.contains(&id)) {
            continue;
        }
        for (i, v) in mesh.vertices.iter_mut().enumerate() {
            *v = (*v + bbox.minpt[i % 3] as f32) * resolution[i % 3] as f32;
        }
        let key = format!("{}/{}:{}:{}", mesh_dir, id, lod, bbox.to_chunk_position());
        let payload = codec::encode_mesh_fragment(&mesh.vertices, &mesh.faces)?;
        store.put(&key, Bytes::from(payload), false).await?;
    }
    Ok(())
}

/// Rewrites the fragment listing into one `{mesh_dir}/{id}:{lod}` manifest
/// per object id, the index viewers fetch to locate an object's fragments.
async fn execute_mesh_manifest(layer_path: &str, lod: u32, ctx: &TaskContext) -> Result<()> {
    let volume = ctx.layers.open(layer_path).await?;
    let mesh_dir = volume
        .info()
        .mesh
        .ok_or_else(|| VoxError::Metadata("layer info names no mesh directory".into()))?;
    let store = volume.blob_store();

    let prefix = format!("{}/", mesh_dir);
    let mut fragments: BTreeMap<u64, Vec<String>> = BTreeMap::new();
    for key in store.list(&prefix).await? {
        let name = &key[prefix.len()..];
        let mut parts = name.splitn(3, ':');
        // manifests have no position segment and drop out here
        let (Some(id), Some(frag_lod), Some(_position)) =
            (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        let Ok(id) = id.parse::<u64>() else {
            continue;
        };
        if frag_lod.parse::<u32>() != Ok(lod) {
            continue;
        }
        fragments.entry(id).or_default().push(name.to_string());
    }

    let count = fragments.len();
    for (id, frags) in fragments {
        let manifest = serde_json::json!({ "fragments": frags });
        let key = format!("{}{}:{}", prefix, id, lod);
        store
            .put(&key, Bytes::from(serde_json::to_vec(&manifest)?), false)
            .await?;
    }
    tracing::info!(count, layer = layer_path, "wrote mesh manifests");
    Ok(())
}

async fn execute_watershed(
    chunk_position: &str,
    crop_position: &str,
    layer_path_affinities: &str,
    layer_path_segmentation: &str,
    params: &WatershedParams,
    ctx: &TaskContext,
) -> Result<()> {
    let segmenter = ctx
        .segmenter
        .clone()
        .ok_or_else(|| VoxError::Configuration("no segmenter configured".into()))?;

    let chunk = Bbox::from_chunk_position(chunk_position)?;
    let crop = Bbox::from_chunk_position(crop_position)?;
    if !chunk.contains(&crop) {
        return Err(VoxError::Task(format!(
            "crop {} is not inside chunk {}",
            crop, chunk
        )));
    }

    let aff_volume = ctx.layers.open(layer_path_affinities).await?;
    let affinities: Array4<f32> = match aff_volume.info().data_type {
        DataType::F32 => aff_volume.read::<f32>(0, &chunk).await?,
        // uint8 affinities are stored as 0..255
        DataType::U8 => aff_volume
            .read::<u8>(0, &chunk)
            .await?
            .mapv(|v| v as f32 / 255.0),
        other => {
            return Err(VoxError::Task(format!(
                "affinity layer holds {} data",
                other
            )))
        }
    };

    let labels = segmenter.segment(affinities, params)?;
    let shape = chunk.shape();
    if labels.dim() != (shape[0], shape[1], shape[2], 1) {
        return Err(VoxError::Task(format!(
            "segmenter returned shape {:?} for chunk {}",
            labels.dim(),
            chunk
        )));
    }

    let rel = crop.shift(Vec3::zero() - chunk.minpt);
    let cropped = labels
        .slice(s![
            rel.minpt.x as usize..rel.maxpt.x as usize,
            rel.minpt.y as usize..rel.maxpt.y as usize,
            rel.minpt.z as usize..rel.maxpt.z as usize,
            ..
        ])
        .to_owned();

    let seg_volume = ctx.layers.open(layer_path_segmentation).await?;
    seg_volume.write(0, &crop, cropped.view()).await
}

/// Enqueues one [`Task::IngestTask`] per chunk under `build/`.
pub async fn create_ingest_tasks(
    layer_path: &str,
    store: &dyn BlobStore,
    encoding: Encoding,
    queue: &TaskQueue,
) -> Result<usize> {
    let keys = store.list(BUILD_PREFIX).await?;
    let count = keys.len();
    for key in keys {
        queue.insert(Task::IngestTask {
            chunk_path: key,
            chunk_encoding: encoding,
            layer_path: layer_path.to_string(),
        });
    }
    tracing::info!(count, layer = layer_path, "queued ingest tasks");
    Ok(count)
}

/// Plans a near-isotropic pyramid for the volume, publishes the new scales
/// and enqueues one [`Task::DownsampleTask`] per output chunk, scale by
/// scale. Tasks for a scale depend on the scale above having been computed;
/// draining the queue in order satisfies that.
pub async fn create_downsample_tasks(
    layer_path: &str,
    volume: &VolumeStore,
    plan: &DownsamplePlan,
    queue: &TaskQueue,
) -> Result<usize> {
    let base = volume.scale(0)?;
    let factors = near_isotropic_scale_factors(base.size3(), base.resolution, plan);

    let mut mips = Vec::new();
    for factor in &factors[1..] {
        mips.push(volume.add_scale(*factor)?);
    }
    volume.commit_info().await?;

    let info = volume.info();
    let mut count = 0;
    for mip in mips {
        let scale = info.scale(mip)?;
        for chunk in scale.chunk_grid() {
            queue.insert(Task::DownsampleTask {
                chunk_path: scale.chunk_key(&chunk),
                layer_path: layer_path.to_string(),
            });
            count += 1;
        }
    }
    tracing::info!(count, layer = layer_path, "queued downsample tasks");
    Ok(count)
}

/// Enqueues one [`Task::MeshTask`] per chunk of `mip`, then the
/// [`Task::MeshManifestTask`] that finalizes the fragment manifests.
/// Draining the queue in order runs the manifest pass last.
pub fn create_mesh_tasks(
    layer_path: &str,
    volume: &VolumeStore,
    mip: usize,
    lod: u32,
    queue: &TaskQueue,
) -> Result<usize> {
    let scale = volume.scale(mip)?;
    let mut count = 0;
    for chunk in scale.chunk_grid() {
        queue.insert(Task::MeshTask {
            chunk_path: scale.chunk_key(&chunk),
            layer_path: layer_path.to_string(),
            lod,
            simplification: DEFAULT_SIMPLIFICATION,
            segments: Vec::new(),
        });
        count += 1;
    }
    queue.insert(Task::MeshManifestTask {
        layer_path: layer_path.to_string(),
        lod,
    });
    tracing::info!(count, layer = layer_path, "queued mesh tasks");
    Ok(count + 1)
}
