//! Axum handlers for the image and snapshot routes.
//!
//! Every handler opens its own pool I/O context on a blocking thread, makes
//! one cluster call (plus the QoS metadata reads/writes attached to it) and
//! releases the context and image handles before returning.

use crate::error::ApiError;
use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use rbd_api_cluster::{Cluster, ClusterError, ImageQos};
use rbd_api_common::{Image, ImageRequest, Snapshot, SnapshotRequest, bytes_to_gb, gb_to_bytes};
use std::sync::Arc;
use tracing::{debug, info, warn};

type Result<T> = std::result::Result<T, ApiError>;

/// Shared state for the RBD handlers.
pub struct RbdState {
    /// Process-wide cluster connection
    pub cluster: Arc<dyn Cluster>,
}

/// Run cluster work on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::internal(format!("cluster task failed: {e}")))?
}

fn image_lookup(name: &str) -> impl FnOnce(ClusterError) -> ApiError + '_ {
    move |err| {
        if err.is_not_found() {
            ApiError::not_found(format!("image {name} is not found"))
        } else {
            err.into()
        }
    }
}

fn snapshot_lookup(snap: &Snapshot) -> impl FnOnce(ClusterError) -> ApiError + '_ {
    move |err| {
        if err.is_not_found() {
            ApiError::not_found(format!("snapshot {} is not found", snap.spec()))
        } else {
            err.into()
        }
    }
}

fn size_in_bytes(gb: u64) -> Result<u64> {
    gb_to_bytes(gb).ok_or_else(|| ApiError::bad_request(format!("size {gb} GB is too large")))
}

/// GET /health
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// POST /v1/rbd/pools/{pool}/images
///
/// A `pool` in the body replaces the path pool.
///
/// # Errors
/// 400 without a name or size, 500 if the cluster rejects the image.
pub async fn create_image(
    State(state): State<Arc<RbdState>>,
    Path(pool): Path<String>,
    body: std::result::Result<Json<ImageRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Image>)> {
    let Json(body) = body?;
    let image = body.into_image(pool, String::new());
    if image.name.is_empty() || image.size == 0 {
        return Err(ApiError::bad_request("name, size is required"));
    }
    let size_bytes = size_in_bytes(image.size)?;

    let cluster = Arc::clone(&state.cluster);
    blocking(move || {
        let ioctx = cluster.open_io_context(&image.pool)?;
        ioctx.create_image(&image.name, size_bytes)?;
        info!(
            pool = %image.pool,
            image = %image.name,
            size_gb = image.size,
            "Created image"
        );
        Ok((StatusCode::CREATED, Json(image)))
    })
    .await
}

/// GET /v1/rbd/pools/{pool}/images/{imageName}
///
/// # Errors
/// 404 if the image does not exist, 500 on any other cluster error.
pub async fn get_image(
    State(state): State<Arc<RbdState>>,
    Path((pool, name)): Path<(String, String)>,
) -> Result<Json<Image>> {
    let cluster = Arc::clone(&state.cluster);
    blocking(move || {
        let ioctx = cluster.open_io_context(&pool)?;
        let handle = ioctx
            .open_image_read_only(&name, None)
            .map_err(image_lookup(&name))?;
        let size = bytes_to_gb(handle.size()?);
        let qos = ImageQos::load(handle.as_ref());
        debug!(pool = %pool, image = %name, size_gb = size, "Read image");
        Ok(Json(Image {
            pool,
            name,
            size,
            qos_bps: qos.bps_limit,
            qos_iops: qos.iops_limit,
        }))
    })
    .await
}

/// PUT /v1/rbd/pools/{pool}/images/{imageName}
///
/// A zero size or QoS field leaves that property unchanged. `pool` and `name`
/// in the body replace the path values. Responds with the request values.
///
/// # Errors
/// 404 if the image does not exist, 500 if a resize or metadata write fails
/// (earlier changes are kept).
pub async fn update_image(
    State(state): State<Arc<RbdState>>,
    Path((pool, name)): Path<(String, String)>,
    body: std::result::Result<Json<ImageRequest>, JsonRejection>,
) -> Result<Json<Image>> {
    let Json(body) = body?;
    let image = body.into_image(pool, name);
    let size_bytes = match image.size {
        0 => None,
        gb => Some(size_in_bytes(gb)?),
    };

    let cluster = Arc::clone(&state.cluster);
    blocking(move || {
        let ioctx = cluster.open_io_context(&image.pool)?;
        let handle = ioctx
            .open_image(&image.name, None)
            .map_err(image_lookup(&image.name))?;
        if let Some(size_bytes) = size_bytes {
            handle.resize(size_bytes)?;
            info!(pool = %image.pool, image = %image.name, size_gb = image.size, "Resized image");
        }
        let qos = ImageQos::new(image.qos_bps, image.qos_iops);
        if qos.has_limits() {
            qos.apply(handle.as_ref())?;
            info!(
                pool = %image.pool,
                image = %image.name,
                qos_bps = image.qos_bps,
                qos_iops = image.qos_iops,
                "Updated QoS limits"
            );
        }
        Ok(Json(image))
    })
    .await
}

/// DELETE /v1/rbd/pools/{pool}/images/{imageName}
///
/// # Errors
/// 404 if the image does not exist, 500 if the cluster refuses the removal.
pub async fn delete_image(
    State(state): State<Arc<RbdState>>,
    Path((pool, name)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>> {
    let cluster = Arc::clone(&state.cluster);
    blocking(move || {
        let ioctx = cluster.open_io_context(&pool)?;
        ioctx.remove_image(&name).map_err(image_lookup(&name))?;
        info!(pool = %pool, image = %name, "Deleted image");
        Ok(Json(serde_json::json!({})))
    })
    .await
}

/// GET /v1/rbd/pools/{pool}/images/
///
/// # Errors
/// 500 if the pool cannot be opened or listed.
pub async fn list_images(
    State(state): State<Arc<RbdState>>,
    Path(pool): Path<String>,
) -> Result<Json<Vec<Image>>> {
    let cluster = Arc::clone(&state.cluster);
    blocking(move || {
        let ioctx = cluster.open_io_context(&pool)?;
        let images: Vec<Image> = ioctx
            .image_names()?
            .into_iter()
            .map(|name| Image::named(pool.as_str(), name))
            .collect();
        debug!(pool = %pool, count = images.len(), "Listed images");
        Ok(Json(images))
    })
    .await
}

/// POST /v1/rbd/pools/{pool}/images/{imageName}/snapshots
///
/// # Errors
/// 400 without a name, 404 if the image does not exist, 500 if creating or
/// protecting the snapshot fails (a created snapshot is left in place).
pub async fn create_snapshot(
    State(state): State<Arc<RbdState>>,
    Path((pool, image_name)): Path<(String, String)>,
    body: std::result::Result<Json<SnapshotRequest>, JsonRejection>,
) -> Result<Json<Snapshot>> {
    let Json(body) = body?;
    let snap = body.into_snapshot(pool, image_name);
    if snap.name.is_empty() {
        return Err(ApiError::bad_request("name is required"));
    }

    let cluster = Arc::clone(&state.cluster);
    blocking(move || {
        let ioctx = cluster.open_io_context(&snap.pool)?;
        // The image is opened under the snapshot's name; the path image name
        // only appears in the not-found message.
        let handle = ioctx
            .open_image(&snap.name, None)
            .map_err(image_lookup(&snap.image_name))?;
        handle.create_snapshot(&snap.name)?;
        handle.protect_snapshot(&snap.name)?;
        info!(
            pool = %snap.pool,
            image = handle.name(),
            snapshot = %snap.name,
            "Created protected snapshot"
        );
        Ok(Json(snap))
    })
    .await
}

/// GET /v1/rbd/pools/{pool}/images/{imageName}/snapshots/{snapshotName}
///
/// # Errors
/// 404 if the image or snapshot does not exist, 500 on any other cluster error.
pub async fn get_snapshot(
    State(state): State<Arc<RbdState>>,
    Path((pool, image_name, name)): Path<(String, String, String)>,
) -> Result<Json<Snapshot>> {
    let snap = Snapshot::new(pool, image_name, name);
    let cluster = Arc::clone(&state.cluster);
    blocking(move || {
        let ioctx = cluster.open_io_context(&snap.pool)?;
        ioctx
            .open_image_read_only(&snap.image_name, Some(&snap.name))
            .map_err(snapshot_lookup(&snap))?;
        Ok(Json(snap))
    })
    .await
}

/// GET /v1/rbd/pools/{pool}/images/{imageName}/snapshots/
///
/// # Errors
/// 404 if the image does not exist, 500 on any other cluster error.
pub async fn list_snapshots(
    State(state): State<Arc<RbdState>>,
    Path((pool, image_name)): Path<(String, String)>,
) -> Result<Json<Vec<Snapshot>>> {
    let cluster = Arc::clone(&state.cluster);
    blocking(move || {
        let ioctx = cluster.open_io_context(&pool)?;
        let handle = ioctx
            .open_image_read_only(&image_name, None)
            .map_err(image_lookup(&image_name))?;
        let snapshots: Vec<Snapshot> = handle
            .snapshot_names()?
            .into_iter()
            .map(|name| Snapshot::new(pool.as_str(), image_name.as_str(), name))
            .collect();
        Ok(Json(snapshots))
    })
    .await
}

/// POST /v1/rbd/pools/{pool}/images/{imageName}/snapshots/{snapshotName}/clone
///
/// # Errors
/// 400 without a name, 404 if the snapshot does not exist, 500 if the clone
/// fails (for example when the snapshot is not protected).
pub async fn create_clone(
    State(state): State<Arc<RbdState>>,
    Path((pool, image_name, snapshot_name)): Path<(String, String, String)>,
    body: std::result::Result<Json<Image>, JsonRejection>,
) -> Result<Json<Image>> {
    let Json(body) = body?;
    if body.name.is_empty() {
        return Err(ApiError::bad_request("name is required"));
    }

    let source = Snapshot::new(pool, image_name, snapshot_name);
    let cluster = Arc::clone(&state.cluster);
    blocking(move || {
        let ioctx = cluster.open_io_context(&source.pool)?;
        let parent = ioctx
            .open_image_read_only(&source.image_name, Some(&source.name))
            .map_err(snapshot_lookup(&source))?;
        ioctx.clone_image(&source.image_name, &source.name, &body.name)?;
        info!(
            pool = %source.pool,
            parent = %source.spec(),
            image = %body.name,
            "Cloned image"
        );

        let size = parent.size().map(bytes_to_gb).unwrap_or_else(|e| {
            warn!("Failed to read size of {}: {}", source.spec(), e);
            0
        });
        Ok(Json(Image {
            pool: source.pool,
            size,
            ..body
        }))
    })
    .await
}
