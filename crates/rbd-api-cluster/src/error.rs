//! Cluster client error types

use thiserror::Error;

/// Cluster client error
#[derive(Error, Debug)]
pub enum ClusterError {
    /// Pool, image, snapshot or metadata key does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Image or snapshot already exists
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Write attempted through a read-only handle or a snapshot
    #[error("read-only: {0}")]
    ReadOnly(String),

    /// Resource is in use (protected snapshot, image with children)
    #[error("busy: {0}")]
    Busy(String),

    /// Argument rejected by the cluster
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Any other negative return code from the client library
    #[error("{op} failed: {message} (errno {errno})")]
    Errno {
        op: String,
        errno: i32,
        message: String,
    },

    /// Connecting to the cluster failed
    #[error("connection error: {0}")]
    Connection(String),

    /// Error from the rados layer (cluster and pool handles)
    #[cfg(feature = "librbd")]
    #[error("rados error: {0}")]
    Rados(#[from] ceph::error::RadosError),
}

impl ClusterError {
    /// Classify a negative return code from librados/librbd.
    ///
    /// `ret` may be given as the negative code the library returns or as the
    /// positive errno.
    pub fn from_errno(ret: i32, op: impl Into<String>) -> Self {
        let errno = ret.abs();
        let op = op.into();
        match errno {
            libc::ENOENT => Self::NotFound(op),
            libc::EEXIST => Self::AlreadyExists(op),
            libc::EROFS => Self::ReadOnly(op),
            libc::EBUSY => Self::Busy(op),
            libc::EINVAL => Self::InvalidArgument(op),
            _ => Self::Errno {
                op,
                errno,
                message: std::io::Error::from_raw_os_error(errno).to_string(),
            },
        }
    }

    /// Whether the cluster reported the target as missing
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Result type for cluster operations
pub type ClusterResult<T> = Result<T, ClusterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_errno_classification() {
        assert!(ClusterError::from_errno(-libc::ENOENT, "rbd_open").is_not_found());
        assert!(matches!(
            ClusterError::from_errno(-libc::EEXIST, "rbd_create4"),
            ClusterError::AlreadyExists(_)
        ));
        assert!(matches!(
            ClusterError::from_errno(libc::EROFS, "rbd_resize"),
            ClusterError::ReadOnly(_)
        ));
        assert!(matches!(
            ClusterError::from_errno(-libc::EBUSY, "rbd_remove"),
            ClusterError::Busy(_)
        ));
    }

    #[test]
    fn test_unclassified_errno_keeps_code() {
        let err = ClusterError::from_errno(-libc::EPERM, "rados_connect");
        match &err {
            ClusterError::Errno { op, errno, .. } => {
                assert_eq!(op, "rados_connect");
                assert_eq!(*errno, libc::EPERM);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!err.is_not_found());
        assert!(err.to_string().starts_with("rados_connect failed"));
    }

    #[cfg(feature = "librbd")]
    #[test]
    fn test_rados_errors_are_not_classified() {
        let err: ClusterError = ceph::error::RadosError::new("pool rbd".to_string()).into();
        assert!(matches!(err, ClusterError::Rados(_)));
        // Pool context failures never turn into a 404
        assert!(!err.is_not_found());
        assert!(err.to_string().contains("pool rbd"));
    }
}
