//! Ceph backend
//!
//! The cluster connection and pool I/O contexts come from the `ceph` crate;
//! image calls go straight to librbd through [`ffi`]. Handles form a chain of
//! owners: each image keeps its I/O context alive and each I/O context keeps
//! the connection alive, so dropping them in any order releases the C
//! resources in the order the library requires.

#![allow(unsafe_code)]

mod ffi;

use crate::client::{Cluster, ImageHandle, IoContext};
use crate::error::{ClusterError, ClusterResult};

use ceph::ceph::{IoCtx, Rados, connect_to_ceph};
use ceph::rados::rados_ioctx_t;
use libc::{c_char, c_int, size_t};
use std::ffi::{CStr, CString};
use std::path::Path;
use std::ptr;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Initial buffer for name listings and metadata values
const INITIAL_BUFFER: usize = 1024;

/// Initial snapshot slots for `rbd_snap_list`
const INITIAL_SNAP_SLOTS: c_int = 16;

const EMPTY_SNAP: ffi::rbd_snap_info_t = ffi::rbd_snap_info_t {
    id: 0,
    size: 0,
    name: ptr::null(),
};

fn cstring(value: &str) -> ClusterResult<CString> {
    CString::new(value)
        .map_err(|_| ClusterError::InvalidArgument(format!("contains a NUL byte: {value:?}")))
}

fn check(ret: c_int, op: impl FnOnce() -> String) -> ClusterResult<c_int> {
    if ret < 0 {
        Err(ClusterError::from_errno(ret, op()))
    } else {
        Ok(ret)
    }
}

fn spec(name: &str, snapshot: Option<&str>) -> String {
    snapshot.map_or_else(|| name.to_string(), |snap| format!("{name}@{snap}"))
}

/// Split a NUL-separated name list as written by `rbd_list`
fn split_names(buf: &[u8]) -> Vec<String> {
    buf.split(|&b| b == 0)
        .filter(|name| !name.is_empty())
        .map(|name| String::from_utf8_lossy(name).into_owned())
        .collect()
}

fn grow(current: usize, requested: usize) -> usize {
    if requested > current {
        requested
    } else {
        current * 2
    }
}

struct Connection(Rados);

// SAFETY: a librados cluster handle may be used from any thread.
unsafe impl Send for Connection {}
unsafe impl Sync for Connection {}

impl Drop for Connection {
    fn drop(&mut self) {
        info!("Shutting down cluster connection");
    }
}

/// A pool I/O context that keeps its connection alive
struct PoolContext {
    ioctx: IoCtx,
    _cluster: Arc<Connection>,
}

impl PoolContext {
    fn inner(&self) -> rados_ioctx_t {
        *self.ioctx.inner()
    }
}

struct ImageOptions(ffi::rbd_image_options_t);

impl ImageOptions {
    fn new() -> Self {
        let mut raw: ffi::rbd_image_options_t = ptr::null_mut();
        unsafe { ffi::rbd_image_options_create(&raw mut raw) };
        Self(raw)
    }
}

impl Drop for ImageOptions {
    fn drop(&mut self) {
        unsafe { ffi::rbd_image_options_destroy(self.0) };
    }
}

/// Connection to a Ceph cluster
pub struct RadosCluster {
    connection: Arc<Connection>,
}

impl RadosCluster {
    /// Connect as `client.{client_id}` using the configuration in `conf_file`.
    ///
    /// # Errors
    /// Returns `ClusterError::Connection` if the configuration cannot be read
    /// or the monitors cannot be reached.
    pub fn connect(conf_file: &Path, client_id: &str) -> ClusterResult<Self> {
        let conf = conf_file.to_str().ok_or_else(|| {
            ClusterError::InvalidArgument(format!(
                "configuration path is not UTF-8: {}",
                conf_file.display()
            ))
        })?;
        let rados = connect_to_ceph(client_id, conf).map_err(|e| {
            ClusterError::Connection(format!("client.{client_id} with {conf}: {e}"))
        })?;

        info!("Connected to cluster as client.{}", client_id);
        Ok(Self {
            connection: Arc::new(Connection(rados)),
        })
    }
}

impl Cluster for RadosCluster {
    fn open_io_context(&self, pool: &str) -> ClusterResult<Box<dyn IoContext>> {
        let ioctx = self.connection.0.get_rados_ioctx(pool)?;
        Ok(Box::new(RadosIoContext {
            ioctx: Arc::new(PoolContext {
                ioctx,
                _cluster: Arc::clone(&self.connection),
            }),
            pool: pool.to_string(),
        }))
    }
}

struct RadosIoContext {
    ioctx: Arc<PoolContext>,
    pool: String,
}

impl RadosIoContext {
    fn open(
        &self,
        name: &str,
        snapshot: Option<&str>,
        read_only: bool,
    ) -> ClusterResult<Box<dyn ImageHandle>> {
        let name_c = cstring(name)?;
        let snap_c = snapshot.map(cstring).transpose()?;
        let snap_ptr = snap_c.as_ref().map_or(ptr::null(), |s| s.as_ptr());

        let mut raw: ffi::rbd_image_t = ptr::null_mut();
        let ret = unsafe {
            if read_only {
                ffi::rbd_open_read_only(self.ioctx.inner(), name_c.as_ptr(), &raw mut raw, snap_ptr)
            } else {
                ffi::rbd_open(self.ioctx.inner(), name_c.as_ptr(), &raw mut raw, snap_ptr)
            }
        };
        check(ret, || format!("open image {}", spec(name, snapshot)))?;

        Ok(Box::new(RbdImage {
            raw,
            name: name.to_string(),
            _ioctx: Arc::clone(&self.ioctx),
        }))
    }
}

impl IoContext for RadosIoContext {
    fn create_image(&self, name: &str, size_bytes: u64) -> ClusterResult<()> {
        let name_c = cstring(name)?;
        let opts = ImageOptions::new();
        check(
            unsafe { ffi::rbd_create4(self.ioctx.inner(), name_c.as_ptr(), size_bytes, opts.0) },
            || format!("create image {name}"),
        )?;
        Ok(())
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
        let name_c = cstring(name)?;
        check(unsafe { ffi::rbd_remove(self.ioctx.inner(), name_c.as_ptr()) }, || {
            format!("remove image {name}")
        })?;
        Ok(())
    }

    fn image_names(&self) -> ClusterResult<Vec<String>> {
        let mut buf = vec![0u8; INITIAL_BUFFER];
        loop {
            let mut len: size_t = buf.len();
            let ret = unsafe {
                ffi::rbd_list(self.ioctx.inner(), buf.as_mut_ptr().cast::<c_char>(), &raw mut len)
            };
            if ret == -libc::ERANGE {
                let size = grow(buf.len(), len);
                buf.resize(size, 0);
                continue;
            }
            let used = check(ret, || format!("list images in pool {}", self.pool))?;
            let used = usize::try_from(used).unwrap_or_default().min(buf.len());
            return Ok(split_names(&buf[..used]));
        }
    }

    fn clone_image(&self, parent: &str, snapshot: &str, child: &str) -> ClusterResult<()> {
        let parent_c = cstring(parent)?;
        let snap_c = cstring(snapshot)?;
        let child_c = cstring(child)?;
        let opts = ImageOptions::new();
        check(
            unsafe {
                ffi::rbd_clone3(
                    self.ioctx.inner(),
                    parent_c.as_ptr(),
                    snap_c.as_ptr(),
                    self.ioctx.inner(),
                    child_c.as_ptr(),
                    opts.0,
                )
            },
            || format!("clone {parent}@{snapshot} to {child}"),
        )?;
        Ok(())
    }
}

struct RbdImage {
    raw: ffi::rbd_image_t,
    name: String,
    _ioctx: Arc<PoolContext>,
}

// SAFETY: the image handle is only used from one thread at a time.
unsafe impl Send for RbdImage {}

impl Drop for RbdImage {
    fn drop(&mut self) {
        let ret = unsafe { ffi::rbd_close(self.raw) };
        if ret < 0 {
            error!("Failed to close image {}: errno {}", self.name, -ret);
        } else {
            debug!("Closed image {}", self.name);
        }
    }
}

impl ImageHandle for RbdImage {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> ClusterResult<u64> {
        let mut size: u64 = 0;
        check(unsafe { ffi::rbd_get_size(self.raw, &raw mut size) }, || {
            format!("get size of image {}", self.name)
        })?;
        Ok(size)
    }

    fn resize(&self, size_bytes: u64) -> ClusterResult<()> {
        check(unsafe { ffi::rbd_resize(self.raw, size_bytes) }, || {
            format!("resize image {}", self.name)
        })?;
        Ok(())
    }

    fn metadata(&self, key: &str) -> ClusterResult<String> {
        let key_c = cstring(key)?;
        let mut buf = vec![0u8; INITIAL_BUFFER];
        loop {
            let mut len: size_t = buf.len();
            let ret = unsafe {
                ffi::rbd_metadata_get(
                    self.raw,
                    key_c.as_ptr(),
                    buf.as_mut_ptr().cast::<c_char>(),
                    &raw mut len,
                )
            };
            if ret == -libc::ERANGE {
                let size = grow(buf.len(), len);
                buf.resize(size, 0);
                continue;
            }
            check(ret, || format!("get metadata {key} of image {}", self.name))?;
            let value = CStr::from_bytes_until_nul(&buf).map_or_else(
                |_| String::from_utf8_lossy(&buf[..len.min(buf.len())]).into_owned(),
                |value| value.to_string_lossy().into_owned(),
            );
            return Ok(value);
        }
    }

    fn set_metadata(&self, key: &str, value: &str) -> ClusterResult<()> {
        let key_c = cstring(key)?;
        let value_c = cstring(value)?;
        check(
            unsafe { ffi::rbd_metadata_set(self.raw, key_c.as_ptr(), value_c.as_ptr()) },
            || format!("set metadata {key} of image {}", self.name),
        )?;
        Ok(())
    }

    fn create_snapshot(&self, name: &str) -> ClusterResult<()> {
        let name_c = cstring(name)?;
        check(unsafe { ffi::rbd_snap_create(self.raw, name_c.as_ptr()) }, || {
            format!("create snapshot {}@{name}", self.name)
        })?;
        Ok(())
    }

    fn protect_snapshot(&self, name: &str) -> ClusterResult<()> {
        let name_c = cstring(name)?;
        check(unsafe { ffi::rbd_snap_protect(self.raw, name_c.as_ptr()) }, || {
            format!("protect snapshot {}@{name}", self.name)
        })?;
        Ok(())
    }

    fn snapshot_names(&self) -> ClusterResult<Vec<String>> {
        let mut slots = INITIAL_SNAP_SLOTS;
        loop {
            let capacity = slots;
            let mut snaps = vec![EMPTY_SNAP; usize::try_from(capacity).unwrap_or_default()];
            let ret = unsafe { ffi::rbd_snap_list(self.raw, snaps.as_mut_ptr(), &raw mut slots) };
            if ret == -libc::ERANGE {
                if slots <= capacity {
                    slots = capacity.saturating_mul(2);
                }
                continue;
            }
            let count = check(ret, || format!("list snapshots of image {}", self.name))?;
            let count = usize::try_from(count).unwrap_or_default().min(snaps.len());
            let names = snaps[..count]
                .iter()
                .filter(|snap| !snap.name.is_null())
                .map(|snap| {
                    // SAFETY: non-null names point at NUL-terminated strings
                    // owned by the list until rbd_snap_list_end.
                    unsafe { CStr::from_ptr(snap.name) }
                        .to_string_lossy()
                        .into_owned()
                })
                .collect();
            unsafe { ffi::rbd_snap_list_end(snaps.as_mut_ptr()) };
            return Ok(names);
        }
    }
}
