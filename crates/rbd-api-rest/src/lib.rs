//! RBD REST API
//!
//! Exposes image and snapshot management for a storage cluster over HTTP:
//!
//! - `/v1/rbd/pools/{pool}/images` create, list, get, update and delete images
//! - `/v1/rbd/pools/{pool}/images/{imageName}/snapshots` create, list and get
//!   snapshots, and clone new images from them
//!
//! The generated API document is served at a configurable path and a static
//! docs UI under `/apidocs/`.

pub mod error;
pub mod handlers;
pub mod openapi;

use axum::Router;
use axum::http::{Method, header};
use axum::routing::{get, post};
use handlers::RbdState;
use rbd_api_cluster::Cluster;
use rbd_api_common::ServerConfig;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

/// Where the API documentation is served from.
#[derive(Clone, Debug)]
pub struct DocsConfig {
    /// Route of the generated API document
    pub api_docs_path: String,
    /// Directory served under `/apidocs/`
    pub docs_dir: PathBuf,
}

impl Default for DocsConfig {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

impl From<&ServerConfig> for DocsConfig {
    fn from(server: &ServerConfig) -> Self {
        Self {
            api_docs_path: server.api_docs_path.clone(),
            docs_dir: server.docs_dir.clone(),
        }
    }
}

/// Create the image and snapshot routes, relative to [`openapi::BASE_PATH`].
fn api_router(cluster: Arc<dyn Cluster>) -> Router {
    let state = Arc::new(RbdState { cluster });

    Router::new()
        // Images
        .route(
            "/pools/{pool}/images",
            get(handlers::list_images).post(handlers::create_image),
        )
        .route("/pools/{pool}/images/", get(handlers::list_images))
        .route(
            "/pools/{pool}/images/{imageName}",
            get(handlers::get_image)
                .put(handlers::update_image)
                .delete(handlers::delete_image),
        )
        // Snapshots
        .route(
            "/pools/{pool}/images/{imageName}/snapshots",
            get(handlers::list_snapshots).post(handlers::create_snapshot),
        )
        .route(
            "/pools/{pool}/images/{imageName}/snapshots/",
            get(handlers::list_snapshots),
        )
        .route(
            "/pools/{pool}/images/{imageName}/snapshots/{snapshotName}",
            get(handlers::get_snapshot),
        )
        .route(
            "/pools/{pool}/images/{imageName}/snapshots/{snapshotName}/clone",
            post(handlers::create_clone),
        )
        .with_state(state)
}

/// Create the full application router.
///
/// Cross-origin requests are allowed from any origin so the docs UI can be
/// hosted elsewhere.
pub fn router(cluster: Arc<dyn Cluster>, docs: &DocsConfig) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
        ])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT]);

    Router::new()
        .nest(openapi::BASE_PATH, api_router(cluster))
        .route(
            &docs.api_docs_path,
            get(|| async { axum::Json(openapi::document()) }),
        )
        .route("/health", get(handlers::health_check))
        .nest_service("/apidocs", ServeDir::new(&docs.docs_dir))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
