//! Cluster capability traits
//!
//! All calls are synchronous and may block on the network; callers in async
//! code run them on a blocking thread.

use crate::error::ClusterResult;

/// A connection to a storage cluster
///
/// Established once and shared by every request.
pub trait Cluster: Send + Sync {
    /// Open an I/O context scoped to `pool`. Released when dropped.
    fn open_io_context(&self, pool: &str) -> ClusterResult<Box<dyn IoContext>>;
}

/// Operations scoped to a single pool
pub trait IoContext: Send {
    /// Create an image of `size_bytes`
    fn create_image(&self, name: &str, size_bytes: u64) -> ClusterResult<()>;

    /// Open an image read-write, optionally at a snapshot
    fn open_image(&self, name: &str, snapshot: Option<&str>) -> ClusterResult<Box<dyn ImageHandle>>;

    /// Open an image read-only, optionally at a snapshot
    fn open_image_read_only(
        &self,
        name: &str,
        snapshot: Option<&str>,
    ) -> ClusterResult<Box<dyn ImageHandle>>;

    /// Remove an image
    fn remove_image(&self, name: &str) -> ClusterResult<()>;

    /// Names of all images in the pool
    fn image_names(&self) -> ClusterResult<Vec<String>>;

    /// Clone `parent@snapshot` into a new image `child` in this pool.
    /// The snapshot must be protected.
    fn clone_image(&self, parent: &str, snapshot: &str, child: &str) -> ClusterResult<()>;
}

/// An open image. Closed when dropped.
pub trait ImageHandle: Send {
    /// Image name
    fn name(&self) -> &str;

    /// Size in bytes (at the opened snapshot, if any)
    fn size(&self) -> ClusterResult<u64>;

    /// Change the image size
    fn resize(&self, size_bytes: u64) -> ClusterResult<()>;

    /// Read a metadata value
    fn metadata(&self, key: &str) -> ClusterResult<String>;

    /// Write a metadata value
    fn set_metadata(&self, key: &str, value: &str) -> ClusterResult<()>;

    /// Create a snapshot of the image's current state
    fn create_snapshot(&self, name: &str) -> ClusterResult<()>;

    /// Protect a snapshot so it can be cloned
    fn protect_snapshot(&self, name: &str) -> ClusterResult<()>;

    /// Names of the image's snapshots, oldest first
    fn snapshot_names(&self) -> ClusterResult<Vec<String>>;
}
