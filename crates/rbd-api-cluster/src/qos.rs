//! Per-image QoS limits
//!
//! Limits live in image metadata as decimal strings under the keys librbd
//! reads for its own throttling. A value of 0 means "unlimited", which is also
//! what a missing or unparsable value reads back as.

use crate::client::ImageHandle;
use crate::error::ClusterResult;
use tracing::warn;

/// Metadata key for the bandwidth limit (bytes/sec)
pub const QOS_BPS_LIMIT_KEY: &str = "conf_rbd_qos_bps_limit";

/// Metadata key for the IOPS limit
pub const QOS_IOPS_LIMIT_KEY: &str = "conf_rbd_qos_iops_limit";

/// QoS limits of one image
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImageQos {
    /// Maximum bandwidth in bytes per second (0 = unlimited)
    pub bps_limit: i64,
    /// Maximum IOPS (0 = unlimited)
    pub iops_limit: i64,
}

impl ImageQos {
    pub const fn new(bps_limit: i64, iops_limit: i64) -> Self {
        Self {
            bps_limit,
            iops_limit,
        }
    }

    /// Check if any limit is configured
    #[must_use]
    pub const fn has_limits(&self) -> bool {
        self.bps_limit != 0 || self.iops_limit != 0
    }

    /// Read the limits from image metadata.
    ///
    /// Never fails: an absent key, a read error or a malformed value all read
    /// as 0. Malformed values and read errors are logged.
    pub fn load(image: &dyn ImageHandle) -> Self {
        Self {
            bps_limit: read_limit(image, QOS_BPS_LIMIT_KEY),
            iops_limit: read_limit(image, QOS_IOPS_LIMIT_KEY),
        }
    }

    /// Write the non-zero limits to image metadata.
    ///
    /// A zero field leaves the stored value untouched, so a limit cannot be
    /// cleared through this call.
    ///
    /// # Errors
    /// Returns the first metadata write error; earlier writes are kept.
    pub fn apply(&self, image: &dyn ImageHandle) -> ClusterResult<()> {
        if self.bps_limit != 0 {
            image.set_metadata(QOS_BPS_LIMIT_KEY, &self.bps_limit.to_string())?;
        }
        if self.iops_limit != 0 {
            image.set_metadata(QOS_IOPS_LIMIT_KEY, &self.iops_limit.to_string())?;
        }
        Ok(())
    }
}

fn read_limit(image: &dyn ImageHandle, key: &str) -> i64 {
    match image.metadata(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|e| {
            warn!(
                image = image.name(),
                key,
                value = %raw,
                "Ignoring malformed QoS metadata: {}",
                e
            );
            0
        }),
        Err(e) if e.is_not_found() => 0,
        Err(e) => {
            warn!(image = image.name(), key, "Failed to read QoS metadata: {}", e);
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Cluster;
    use crate::memory::MemoryCluster;

    fn open(cluster: &MemoryCluster, name: &str) -> Box<dyn ImageHandle> {
        let ioctx = cluster.open_io_context("rbd").unwrap();
        ioctx.create_image(name, 1024).unwrap();
        ioctx.open_image(name, None).unwrap()
    }

    #[test]
    fn test_unset_limits_read_as_zero() {
        let cluster = MemoryCluster::with_pools(["rbd"]);
        let image = open(&cluster, "img");

        let qos = ImageQos::load(image.as_ref());
        assert_eq!(qos, ImageQos::default());
        assert!(!qos.has_limits());
    }

    #[test]
    fn test_apply_and_load() {
        let cluster = MemoryCluster::with_pools(["rbd"]);
        let image = open(&cluster, "img");

        ImageQos::new(10_485_760, 200).apply(image.as_ref()).unwrap();
        assert_eq!(image.metadata(QOS_BPS_LIMIT_KEY).unwrap(), "10485760");
        assert_eq!(image.metadata(QOS_IOPS_LIMIT_KEY).unwrap(), "200");
        assert_eq!(ImageQos::load(image.as_ref()), ImageQos::new(10_485_760, 200));
    }

    #[test]
    fn test_zero_does_not_clear_limit() {
        let cluster = MemoryCluster::with_pools(["rbd"]);
        let image = open(&cluster, "img");

        ImageQos::new(1000, 50).apply(image.as_ref()).unwrap();
        ImageQos::new(0, 75).apply(image.as_ref()).unwrap();
        assert_eq!(ImageQos::load(image.as_ref()), ImageQos::new(1000, 75));
    }

    #[test]
    fn test_malformed_value_reads_as_zero() {
        let cluster = MemoryCluster::with_pools(["rbd"]);
        let image = open(&cluster, "img");

        image.set_metadata(QOS_BPS_LIMIT_KEY, "fast").unwrap();
        image.set_metadata(QOS_IOPS_LIMIT_KEY, "300").unwrap();
        assert_eq!(ImageQos::load(image.as_ref()), ImageQos::new(0, 300));
    }

    #[test]
    fn test_negative_limits_round_trip() {
        let cluster = MemoryCluster::with_pools(["rbd"]);
        let image = open(&cluster, "img");

        ImageQos::new(-1, -1).apply(image.as_ref()).unwrap();
        assert_eq!(ImageQos::load(image.as_ref()), ImageQos::new(-1, -1));
    }
}
