//! Data transfer types for the RBD API
//!
//! Sizes cross the HTTP boundary in gigabytes; the cluster works in bytes.

use serde::{Deserialize, Serialize};

/// Bytes per gigabyte (1024³)
pub const SIZE_GB: u64 = 1024 * 1024 * 1024;

/// Convert a size in GB to bytes, `None` on overflow
#[must_use]
pub const fn gb_to_bytes(gb: u64) -> Option<u64> {
    gb.checked_mul(SIZE_GB)
}

/// Convert a size in bytes to whole GB (rounded down)
#[must_use]
pub const fn bytes_to_gb(bytes: u64) -> u64 {
    bytes / SIZE_GB
}

/// A block image, identified by (pool, name)
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Image {
    /// Pool name
    pub pool: String,
    /// Image name
    pub name: String,
    /// Image size in GB
    pub size: u64,
    /// Bandwidth limit (bytes/sec)
    pub qos_bps: i64,
    /// IOPS limit
    pub qos_iops: i64,
}

impl Image {
    /// An image reference without size or QoS, as returned by listings
    pub fn named(pool: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            pool: pool.into(),
            name: name.into(),
            ..Self::default()
        }
    }
}

/// A snapshot, identified by (pool, image_name, name)
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Snapshot {
    /// Pool name
    pub pool: String,
    /// Image name
    pub image_name: String,
    /// Snapshot name
    pub name: String,
}

impl Snapshot {
    pub fn new(
        pool: impl Into<String>,
        image_name: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            pool: pool.into(),
            image_name: image_name.into(),
            name: name.into(),
        }
    }

    /// `image@snapshot` spec string
    #[must_use]
    pub fn spec(&self) -> String {
        format!("{}@{}", self.image_name, self.name)
    }
}

/// Body of a create or update image request
///
/// The URL path seeds the image identity; `pool` and `name` given in the body
/// replace it. An absent (or `null`) field keeps the path value.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ImageRequest {
    pub pool: Option<String>,
    pub name: Option<String>,
    pub size: u64,
    pub qos_bps: i64,
    pub qos_iops: i64,
}

impl ImageRequest {
    /// Merge the body over the path identity
    #[must_use]
    pub fn into_image(self, pool: String, name: String) -> Image {
        Image {
            pool: self.pool.unwrap_or(pool),
            name: self.name.unwrap_or(name),
            size: self.size,
            qos_bps: self.qos_bps,
            qos_iops: self.qos_iops,
        }
    }
}

/// Body of a create snapshot request
///
/// Same merge rule as [`ImageRequest`] for `pool` and `image_name`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SnapshotRequest {
    pub pool: Option<String>,
    pub image_name: Option<String>,
    pub name: String,
}

impl SnapshotRequest {
    /// Merge the body over the path identity
    #[must_use]
    pub fn into_snapshot(self, pool: String, image_name: String) -> Snapshot {
        Snapshot {
            pool: self.pool.unwrap_or(pool),
            image_name: self.image_name.unwrap_or(image_name),
            name: self.name,
        }
    }
}
