//! voxelpipe - chunked multiscale voxel volumes in blob storage
//!
//! Large volumetric datasets (EM image stacks, segmentations, affinity maps)
//! are stored as grid-aligned chunks under a multiscale `info` descriptor,
//! readable and writable by arbitrary boxes. A queue of idempotent tasks
//! ingests source data and builds near-isotropic downsampling pyramids, so
//! many workers can process a layer without coordinating beyond the queue.
//!
//! # Example
//!
//! ```rust,ignore
//! use voxelpipe::{Bbox, Vec3, VolumeStore};
//!
//! # async fn example() -> voxelpipe::Result<()> {
//! let store = voxelpipe::io::create_store("file:///data/image")?;
//! let volume = VolumeStore::open(store).await?;
//!
//! // any box; realignment onto the chunk grid is handled internally
//! let request = Bbox::new(Vec3::new(31, 0, 0), Vec3::new(65, 64, 64));
//! let data = volume.read::<u8>(0, &request).await?;
//! # Ok(())
//! # }
//! ```

pub mod bbox;
pub mod codec;
pub mod downsample;
pub mod error;
pub mod io;
pub mod layout;
pub mod metadata;
pub mod pool;
pub mod queue;
pub mod scheduler;
pub mod store;
pub mod tasks;
pub mod types;
pub mod worker;

// Re-exports
pub use bbox::{Bbox, Vec3};
pub use codec::Encoding;
pub use error::{Result, VoxError};
pub use io::{create_store, BlobStore, FileSystemStore, MemoryStore};
pub use layout::{ChunkSpan, DownsamplePlan, Scale};
pub use metadata::{DataLayerProvenance, VolumeInfo};
pub use pool::FanoutPool;
pub use queue::{Lease, LeasedTask, TaskQueue};
pub use scheduler::{Acquire, LockTable, SpatialLockScheduler};
pub use store::VolumeStore;
pub use tasks::{
    LayerProvider, LayerRegistry, MeshData, Mesher, Segmenter, Task, TaskContext, WatershedParams,
};
pub use types::{DataType, LayerType};
pub use worker::Worker;

/// Version of the voxelpipe implementation
pub const VOXELPIPE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VOXELPIPE_VERSION.is_empty());
    }
}
