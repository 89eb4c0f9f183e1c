//! In-process cluster backend
//!
//! Emulates the parts of librbd the API uses: pools, images with metadata,
//! snapshots with protection, and copy-on-write clones (recorded as a parent
//! link). Error kinds match what librbd reports for the same situations.

use crate::client::{Cluster, ImageHandle, IoContext};
use crate::error::{ClusterError, ClusterResult};

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Parent of a cloned image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentSpec {
    pub pool: String,
    pub image: String,
    pub snapshot: String,
}

#[derive(Debug, Clone)]
struct SnapshotRecord {
    name: String,
    size_bytes: u64,
    protected: bool,
}

#[derive(Debug, Clone, Default)]
struct ImageRecord {
    size_bytes: u64,
    metadata: HashMap<String, String>,
    snapshots: Vec<SnapshotRecord>,
    parent: Option<ParentSpec>,
}

impl ImageRecord {
    fn snapshot(&self, name: &str) -> Option<&SnapshotRecord> {
        self.snapshots.iter().find(|s| s.name == name)
    }
}

type Pools = HashMap<String, BTreeMap<String, ImageRecord>>;

#[derive(Default)]
struct Inner {
    pools: RwLock<Pools>,
    opened_contexts: AtomicU64,
}

/// In-memory cluster
#[derive(Clone, Default)]
pub struct MemoryCluster {
    inner: Arc<Inner>,
}

impl MemoryCluster {
    /// Create a cluster with no pools
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a cluster with the given (empty) pools
    pub fn with_pools<I, S>(pools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let cluster = Self::new();
        {
            let mut map = cluster.inner.pools.write();
            for pool in pools {
                map.entry(pool.into()).or_default();
            }
        }
        cluster
    }

    /// Number of I/O contexts opened so far
    pub fn opened_contexts(&self) -> u64 {
        self.inner.opened_contexts.load(Ordering::Relaxed)
    }

    /// Whether `image@snapshot` is protected, `None` if it does not exist
    pub fn is_snapshot_protected(&self, pool: &str, image: &str, snapshot: &str) -> Option<bool> {
        self.inner
            .pools
            .read()
            .get(pool)
            .and_then(|images| images.get(image))
            .and_then(|record| record.snapshot(snapshot))
            .map(|s| s.protected)
    }

    /// Parent of a cloned image, `None` for missing or non-cloned images
    pub fn parent_of(&self, pool: &str, image: &str) -> Option<ParentSpec> {
        self.inner
            .pools
            .read()
            .get(pool)
            .and_then(|images| images.get(image))
            .and_then(|record| record.parent.clone())
    }
}

impl Cluster for MemoryCluster {
    fn open_io_context(&self, pool: &str) -> ClusterResult<Box<dyn IoContext>> {
        self.inner.opened_contexts.fetch_add(1, Ordering::Relaxed);
        if !self.inner.pools.read().contains_key(pool) {
            return Err(ClusterError::NotFound(format!("pool {pool}")));
        }
        Ok(Box::new(MemoryIoContext {
            inner: Arc::clone(&self.inner),
            pool: pool.to_string(),
        }))
    }
}

struct MemoryIoContext {
    inner: Arc<Inner>,
    pool: String,
}

impl MemoryIoContext {
    fn read_images<T>(
        &self,
        f: impl FnOnce(&BTreeMap<String, ImageRecord>) -> ClusterResult<T>,
    ) -> ClusterResult<T> {
        let pools = self.inner.pools.read();
        let images = pools
            .get(&self.pool)
            .ok_or_else(|| ClusterError::NotFound(format!("pool {}", self.pool)))?;
        f(images)
    }

    fn with_images<T>(
        &self,
        f: impl FnOnce(&mut BTreeMap<String, ImageRecord>) -> ClusterResult<T>,
    ) -> ClusterResult<T> {
        let mut pools = self.inner.pools.write();
        let images = pools
            .get_mut(&self.pool)
            .ok_or_else(|| ClusterError::NotFound(format!("pool {}", self.pool)))?;
        f(images)
    }

    fn open(
        &self,
        name: &str,
        snapshot: Option<&str>,
        read_only: bool,
    ) -> ClusterResult<Box<dyn ImageHandle>> {
        self.read_images(|images| {
            let record = images
                .get(name)
                .ok_or_else(|| ClusterError::NotFound(format!("image {name}")))?;
            if let Some(snap) = snapshot {
                if record.snapshot(snap).is_none() {
                    return Err(ClusterError::NotFound(format!("snapshot {name}@{snap}")));
                }
            }
            Ok(())
        })?;

        Ok(Box::new(MemoryImage {
            inner: Arc::clone(&self.inner),
            pool: self.pool.clone(),
            name: name.to_string(),
            snapshot: snapshot.map(str::to_string),
            read_only,
        }))
    }
}

impl IoContext for MemoryIoContext {
    fn create_image(&self, name: &str, size_bytes: u64) -> ClusterResult<()> {
        if name.is_empty() {
            return Err(ClusterError::InvalidArgument("empty image name".to_string()));
        }
        self.with_images(|images| {
            if images.contains_key(name) {
                return Err(ClusterError::AlreadyExists(format!("image {name}")));
            }
            images.insert(
                name.to_string(),
                ImageRecord {
                    size_bytes,
                    ..ImageRecord::default()
                },
            );
            debug!(pool = %self.pool, image = name, size_bytes, "Created image");
            Ok(())
        })
    }

    fn open_image(&self, name: &str, snapshot: Option<&str>) -> ClusterResult<Box<dyn ImageHandle>> {
        self.open(name, snapshot, false)
    }

    fn open_image_read_only(
        &self,
        name: &str,
        snapshot: Option<&str>,
    ) -> ClusterResult<Box<dyn ImageHandle>> {
        self.open(name, snapshot, true)
    }

    fn remove_image(&self, name: &str) -> ClusterResult<()> {
        let mut pools = self.inner.pools.write();
        // Clones may live in any pool
        let children = pools
            .values()
            .flat_map(BTreeMap::values)
            .filter(|record| {
                record
                    .parent
                    .as_ref()
                    .is_some_and(|p| p.pool == self.pool && p.image == name)
            })
            .count();

        let images = pools
            .get_mut(&self.pool)
            .ok_or_else(|| ClusterError::NotFound(format!("pool {}", self.pool)))?;
        let record = images
            .get(name)
            .ok_or_else(|| ClusterError::NotFound(format!("image {name}")))?;
        if !record.snapshots.is_empty() {
            return Err(ClusterError::from_errno(
                libc::ENOTEMPTY,
                format!("remove image {name}: image has snapshots"),
            ));
        }
        if children > 0 {
            return Err(ClusterError::Busy(format!(
                "image {name} has {children} clone(s)"
            )));
        }
        images.remove(name);
        debug!(pool = %self.pool, image = name, "Removed image");
        Ok(())
    }

    fn image_names(&self) -> ClusterResult<Vec<String>> {
        self.read_images(|images| Ok(images.keys().cloned().collect()))
    }

    fn clone_image(&self, parent: &str, snapshot: &str, child: &str) -> ClusterResult<()> {
        if child.is_empty() {
            return Err(ClusterError::InvalidArgument("empty image name".to_string()));
        }
        self.with_images(|images| {
            let snap = images
                .get(parent)
                .ok_or_else(|| ClusterError::NotFound(format!("image {parent}")))?
                .snapshot(snapshot)
                .ok_or_else(|| ClusterError::NotFound(format!("snapshot {parent}@{snapshot}")))?;
            if !snap.protected {
                return Err(ClusterError::InvalidArgument(format!(
                    "snapshot {parent}@{snapshot} is not protected"
                )));
            }
            let size_bytes = snap.size_bytes;
            if images.contains_key(child) {
                return Err(ClusterError::AlreadyExists(format!("image {child}")));
            }
            images.insert(
                child.to_string(),
                ImageRecord {
                    size_bytes,
                    parent: Some(ParentSpec {
                        pool: self.pool.clone(),
                        image: parent.to_string(),
                        snapshot: snapshot.to_string(),
                    }),
                    ..ImageRecord::default()
                },
            );
            debug!(pool = %self.pool, parent, snapshot, child, "Cloned image");
            Ok(())
        })
    }
}

impl Drop for MemoryIoContext {
    fn drop(&mut self) {
        debug!(pool = %self.pool, "Released I/O context");
    }
}

struct MemoryImage {
    inner: Arc<Inner>,
    pool: String,
    name: String,
    snapshot: Option<String>,
    read_only: bool,
}

impl MemoryImage {
    fn read_record<T>(
        &self,
        f: impl FnOnce(&ImageRecord) -> ClusterResult<T>,
    ) -> ClusterResult<T> {
        let pools = self.inner.pools.read();
        let record = pools
            .get(&self.pool)
            .and_then(|images| images.get(&self.name))
            .ok_or_else(|| ClusterError::NotFound(format!("image {}", self.name)))?;
        f(record)
    }

    fn with_record<T>(
        &self,
        f: impl FnOnce(&mut ImageRecord) -> ClusterResult<T>,
    ) -> ClusterResult<T> {
        let mut pools = self.inner.pools.write();
        let record = pools
            .get_mut(&self.pool)
            .and_then(|images| images.get_mut(&self.name))
            .ok_or_else(|| ClusterError::NotFound(format!("image {}", self.name)))?;
        f(record)
    }

    fn check_writable(&self) -> ClusterResult<()> {
        if self.read_only {
            return Err(ClusterError::ReadOnly(format!(
                "image {} opened read-only",
                self.name
            )));
        }
        if let Some(snap) = &self.snapshot {
            return Err(ClusterError::ReadOnly(format!(
                "image {} opened at snapshot {snap}",
                self.name
            )));
        }
        Ok(())
    }
}

impl ImageHandle for MemoryImage {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> ClusterResult<u64> {
        self.read_record(|record| match &self.snapshot {
            Some(snap) => record.snapshot(snap).map(|s| s.size_bytes).ok_or_else(|| {
                ClusterError::NotFound(format!("snapshot {}@{snap}", self.name))
            }),
            None => Ok(record.size_bytes),
        })
    }

    fn resize(&self, size_bytes: u64) -> ClusterResult<()> {
        self.check_writable()?;
        self.with_record(|record| {
            record.size_bytes = size_bytes;
            Ok(())
        })
    }

    fn metadata(&self, key: &str) -> ClusterResult<String> {
        self.read_record(|record| {
            record
                .metadata
                .get(key)
                .cloned()
                .ok_or_else(|| ClusterError::NotFound(format!("metadata key {key}")))
        })
    }

    fn set_metadata(&self, key: &str, value: &str) -> ClusterResult<()> {
        self.check_writable()?;
        self.with_record(|record| {
            record.metadata.insert(key.to_string(), value.to_string());
            Ok(())
        })
    }

    fn create_snapshot(&self, name: &str) -> ClusterResult<()> {
        self.check_writable()?;
        if name.is_empty() {
            return Err(ClusterError::InvalidArgument("empty snapshot name".to_string()));
        }
        self.with_record(|record| {
            if record.snapshot(name).is_some() {
                return Err(ClusterError::AlreadyExists(format!(
                    "snapshot {}@{name}",
                    self.name
                )));
            }
            let size_bytes = record.size_bytes;
            record.snapshots.push(SnapshotRecord {
                name: name.to_string(),
                size_bytes,
                protected: false,
            });
            Ok(())
        })
    }

    fn protect_snapshot(&self, name: &str) -> ClusterResult<()> {
        self.check_writable()?;
        self.with_record(|record| {
            let snap = record
                .snapshots
                .iter_mut()
                .find(|s| s.name == name)
                .ok_or_else(|| ClusterError::NotFound(format!("snapshot {}@{name}", self.name)))?;
            if snap.protected {
                return Err(ClusterError::Busy(format!(
                    "snapshot {}@{name} is already protected",
                    self.name
                )));
            }
            snap.protected = true;
            Ok(())
        })
    }

    fn snapshot_names(&self) -> ClusterResult<Vec<String>> {
        self.read_record(|record| Ok(record.snapshots.iter().map(|s| s.name.clone()).collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn cluster() -> MemoryCluster {
        MemoryCluster::with_pools(["rbd"])
    }

    #[test]
    fn test_missing_pool() {
        let cluster = cluster();
        let result = cluster.open_io_context("nope");
        assert!(matches!(result, Err(ClusterError::NotFound(_))));
        assert_eq!(cluster.opened_contexts(), 1);
    }

    #[test]
    fn test_create_and_open_image() {
        let cluster = cluster();
        let ioctx = cluster.open_io_context("rbd").unwrap();
        ioctx.create_image("vol", 5 * GIB).unwrap();

        let image = ioctx.open_image_read_only("vol", None).unwrap();
        assert_eq!(image.name(), "vol");
        assert_eq!(image.size().unwrap(), 5 * GIB);
        assert_eq!(ioctx.image_names().unwrap(), vec!["vol".to_string()]);
    }

    #[test]
    fn test_duplicate_image_name() {
        let cluster = cluster();
        let ioctx = cluster.open_io_context("rbd").unwrap();
        ioctx.create_image("vol", GIB).unwrap();

        let result = ioctx.create_image("vol", GIB);
        assert!(matches!(result, Err(ClusterError::AlreadyExists(_))));
    }

    #[test]
    fn test_open_missing_image() {
        let cluster = cluster();
        let ioctx = cluster.open_io_context("rbd").unwrap();
        let result = ioctx.open_image("ghost", None);
        assert!(result.err().unwrap().is_not_found());
    }

    #[test]
    fn test_read_only_handle_rejects_writes() {
        let cluster = cluster();
        let ioctx = cluster.open_io_context("rbd").unwrap();
        ioctx.create_image("vol", GIB).unwrap();

        let image = ioctx.open_image_read_only("vol", None).unwrap();
        assert!(matches!(image.resize(2 * GIB), Err(ClusterError::ReadOnly(_))));
        assert!(matches!(
            image.set_metadata("k", "v"),
            Err(ClusterError::ReadOnly(_))
        ));
        assert!(matches!(image.create_snapshot("s"), Err(ClusterError::ReadOnly(_))));
    }

    #[test]
    fn test_resize() {
        let cluster = cluster();
        let ioctx = cluster.open_io_context("rbd").unwrap();
        ioctx.create_image("vol", GIB).unwrap();

        let image = ioctx.open_image("vol", None).unwrap();
        image.resize(3 * GIB).unwrap();
        assert_eq!(image.size().unwrap(), 3 * GIB);
        // Shrinking is allowed, as with librbd's plain resize
        image.resize(GIB).unwrap();
        assert_eq!(image.size().unwrap(), GIB);
    }

    #[test]
    fn test_snapshot_keeps_size_at_creation() {
        let cluster = cluster();
        let ioctx = cluster.open_io_context("rbd").unwrap();
        ioctx.create_image("vol", GIB).unwrap();

        let image = ioctx.open_image("vol", None).unwrap();
        image.create_snapshot("s1").unwrap();
        image.resize(4 * GIB).unwrap();

        let at_snap = ioctx.open_image_read_only("vol", Some("s1")).unwrap();
        assert_eq!(at_snap.size().unwrap(), GIB);
        assert!(matches!(at_snap.resize(GIB), Err(ClusterError::ReadOnly(_))));
        assert_eq!(image.snapshot_names().unwrap(), vec!["s1".to_string()]);
    }

    #[test]
    fn test_open_missing_snapshot() {
        let cluster = cluster();
        let ioctx = cluster.open_io_context("rbd").unwrap();
        ioctx.create_image("vol", GIB).unwrap();

        let result = ioctx.open_image_read_only("vol", Some("nope"));
        assert!(result.err().unwrap().is_not_found());
    }

    #[test]
    fn test_protect_snapshot() {
        let cluster = cluster();
        let ioctx = cluster.open_io_context("rbd").unwrap();
        ioctx.create_image("vol", GIB).unwrap();
        let image = ioctx.open_image("vol", None).unwrap();
        image.create_snapshot("s1").unwrap();

        assert_eq!(cluster.is_snapshot_protected("rbd", "vol", "s1"), Some(false));
        image.protect_snapshot("s1").unwrap();
        assert_eq!(cluster.is_snapshot_protected("rbd", "vol", "s1"), Some(true));
        assert!(matches!(image.protect_snapshot("s1"), Err(ClusterError::Busy(_))));
        assert!(image.protect_snapshot("s2").unwrap_err().is_not_found());
    }

    #[test]
    fn test_clone_requires_protected_snapshot() {
        let cluster = cluster();
        let ioctx = cluster.open_io_context("rbd").unwrap();
        ioctx.create_image("base", 2 * GIB).unwrap();
        let image = ioctx.open_image("base", None).unwrap();
        image.create_snapshot("gold").unwrap();

        let result = ioctx.clone_image("base", "gold", "vm1");
        assert!(matches!(result, Err(ClusterError::InvalidArgument(_))));

        image.protect_snapshot("gold").unwrap();
        ioctx.clone_image("base", "gold", "vm1").unwrap();

        let clone = ioctx.open_image_read_only("vm1", None).unwrap();
        assert_eq!(clone.size().unwrap(), 2 * GIB);
        assert_eq!(
            cluster.parent_of("rbd", "vm1"),
            Some(ParentSpec {
                pool: "rbd".to_string(),
                image: "base".to_string(),
                snapshot: "gold".to_string(),
            })
        );
    }

    #[test]
    fn test_clone_missing_snapshot() {
        let cluster = cluster();
        let ioctx = cluster.open_io_context("rbd").unwrap();
        ioctx.create_image("base", GIB).unwrap();

        let result = ioctx.clone_image("base", "nope", "vm1");
        assert!(result.unwrap_err().is_not_found());
    }

    #[test]
    fn test_remove_image() {
        let cluster = cluster();
        let ioctx = cluster.open_io_context("rbd").unwrap();
        ioctx.create_image("vol", GIB).unwrap();

        ioctx.remove_image("vol").unwrap();
        assert!(ioctx.image_names().unwrap().is_empty());
        assert!(ioctx.remove_image("vol").unwrap_err().is_not_found());
    }

    #[test]
    fn test_remove_image_with_snapshots_fails() {
        let cluster = cluster();
        let ioctx = cluster.open_io_context("rbd").unwrap();
        ioctx.create_image("vol", GIB).unwrap();
        ioctx
            .open_image("vol", None)
            .unwrap()
            .create_snapshot("s1")
            .unwrap();

        let err = ioctx.remove_image("vol").unwrap_err();
        assert!(matches!(err, ClusterError::Errno { errno, .. } if errno == libc::ENOTEMPTY));
    }

    #[test]
    fn test_pool_isolation() {
        let cluster = MemoryCluster::with_pools(["a", "b"]);
        cluster
            .open_io_context("a")
            .unwrap()
            .create_image("vol", GIB)
            .unwrap();

        let b = cluster.open_io_context("b").unwrap();
        assert!(b.image_names().unwrap().is_empty());
        assert!(b.open_image("vol", None).err().unwrap().is_not_found());
    }

    #[test]
    fn test_reads_share_the_lock() {
        let cluster = MemoryCluster::with_pools(["rbd"]);
        let ioctx = cluster.open_io_context("rbd").unwrap();
        ioctx.create_image("vol", GIB).unwrap();
        let image = ioctx.open_image_read_only("vol", None).unwrap();

        // Reads must not need exclusive access
        let _reader = cluster.inner.pools.read();
        assert_eq!(image.size().unwrap(), GIB);
        assert!(image.metadata("missing").err().unwrap().is_not_found());
        assert!(image.snapshot_names().unwrap().is_empty());
        assert_eq!(ioctx.image_names().unwrap(), vec!["vol".to_string()]);
        assert!(ioctx.open_image_read_only("vol", None).is_ok());
        assert!(cluster.inner.pools.try_write().is_none());
    }
}
