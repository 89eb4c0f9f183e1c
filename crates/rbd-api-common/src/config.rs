//! Configuration for the RBD API server
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! `RBD_API__`-prefixed environment variables (`RBD_API__SERVER__LISTEN`,
//! `RBD_API__CLUSTER__BACKEND`, ...).

use crate::error::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "RBD_API";

/// Route prefixes served by the API itself. The docs path may not equal one
/// of them or live below it.
pub const RESERVED_PATHS: &[&str] = &["/health", "/apidocs", "/v1/rbd"];

/// Root configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP server configuration
    pub server: ServerConfig,
    /// Storage cluster configuration
    pub cluster: ClusterConfig,
}

impl Config {
    /// Load configuration from an optional file plus the process environment.
    ///
    /// A file given explicitly must exist.
    ///
    /// # Errors
    /// Returns `ConfigError` if a source cannot be read or the merged values
    /// do not deserialize or validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, Self::environment())
    }

    /// Load configuration with an explicit environment source.
    ///
    /// # Errors
    /// Returns `ConfigError` if a source cannot be read or the merged values
    /// do not deserialize or validate.
    pub fn load_with_env(path: Option<&Path>, env: config::Environment) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }
        let config: Self = builder.add_source(env).build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// The environment source used by [`Config::load`]
    #[must_use]
    pub fn environment() -> config::Environment {
        config::Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("cluster.memory_pools")
    }

    fn validate(&self) -> Result<()> {
        let docs_path = self.server.api_docs_path.as_str();
        if !docs_path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "server.api_docs_path must start with '/': {docs_path}"
            )));
        }
        let shadows = |reserved: &&str| {
            docs_path == *reserved || docs_path.starts_with(&format!("{reserved}/"))
        };
        if RESERVED_PATHS.iter().any(shadows) {
            return Err(ConfigError::Invalid(format!(
                "server.api_docs_path collides with a built-in route: {docs_path}"
            )));
        }
        if self.cluster.client_id.is_empty() {
            return Err(ConfigError::Invalid(
                "cluster.client_id must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// HTTP server configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address for the REST API
    pub listen: SocketAddr,
    /// Path the generated API document is served at
    pub api_docs_path: String,
    /// Directory served under `/apidocs/` (interactive docs UI)
    pub docs_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 80)),
            api_docs_path: "/apidocs.json".to_string(),
            docs_dir: PathBuf::from("/tmp/swagger-ui/dist"),
        }
    }
}

/// Which cluster client backs the API
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterBackend {
    /// librados/librbd via FFI
    #[default]
    Librados,
    /// In-process cluster, for development and tests
    Memory,
}

impl FromStr for ClusterBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "librados" | "rados" => Ok(Self::Librados),
            "memory" => Ok(Self::Memory),
            other => Err(ConfigError::Invalid(format!("unknown cluster backend: {other}"))),
        }
    }
}

impl fmt::Display for ClusterBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Librados => f.write_str("librados"),
            Self::Memory => f.write_str("memory"),
        }
    }
}

/// Storage cluster configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Backend implementation
    pub backend: ClusterBackend,
    /// Ceph configuration file
    pub conf_file: PathBuf,
    /// Client id to connect as (`admin` connects as `client.admin`)
    pub client_id: String,
    /// Pools created up front by the memory backend
    pub memory_pools: Vec<String>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            backend: ClusterBackend::default(),
            conf_file: PathBuf::from("/etc/ceph/ceph.conf"),
            client_id: "admin".to_string(),
            memory_pools: vec!["rbd".to_string()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(vars: &[(&str, &str)]) -> config::Environment {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Config::environment().source(Some(map))
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.listen.port(), 80);
        assert_eq!(config.server.api_docs_path, "/apidocs.json");
        assert_eq!(config.cluster.backend, ClusterBackend::Librados);
        assert_eq!(config.cluster.client_id, "admin");
        assert_eq!(config.cluster.conf_file, Path::new("/etc/ceph/ceph.conf"));
    }

    #[test]
    fn test_load_without_sources_uses_defaults() {
        let config = Config::load_with_env(None, env(&[])).unwrap();
        assert_eq!(config.server.listen.port(), 80);
        assert_eq!(config.cluster.memory_pools, vec!["rbd".to_string()]);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[server]
listen = "127.0.0.1:8080"

[cluster]
backend = "memory"
conf_file = "/opt/ceph/ceph.conf"
memory_pools = ["rbd", "volumes"]
"#
        )
        .unwrap();

        let config = Config::load_with_env(Some(file.path()), env(&[])).unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:8080".parse().unwrap());
        // Unset keys keep their defaults
        assert_eq!(config.server.api_docs_path, "/apidocs.json");
        assert_eq!(config.cluster.backend, ClusterBackend::Memory);
        assert_eq!(config.cluster.conf_file, Path::new("/opt/ceph/ceph.conf"));
        assert_eq!(config.cluster.memory_pools, vec!["rbd", "volumes"]);
    }

    #[test]
    fn test_env_overrides_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[server]\nlisten = \"127.0.0.1:8080\"").unwrap();

        let config = Config::load_with_env(
            Some(file.path()),
            env(&[
                ("RBD_API__SERVER__LISTEN", "127.0.0.1:9090"),
                ("RBD_API__CLUSTER__BACKEND", "memory"),
                ("RBD_API__CLUSTER__MEMORY_POOLS", "a,b"),
            ]),
        )
        .unwrap();
        assert_eq!(config.server.listen.port(), 9090);
        assert_eq!(config.cluster.backend, ClusterBackend::Memory);
        assert_eq!(config.cluster.memory_pools, vec!["a", "b"]);
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        let result = Config::load_with_env(Some(Path::new("/nonexistent/rbd-api.toml")), env(&[]));
        assert!(matches!(result, Err(ConfigError::Load(_))));
    }

    #[test]
    fn test_invalid_docs_path() {
        let result = Config::load_with_env(
            None,
            env(&[("RBD_API__SERVER__API_DOCS_PATH", "apidocs.json")]),
        );
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_docs_path_may_not_shadow_routes() {
        for path in [
            "/health",
            "/apidocs",
            "/apidocs/swagger.json",
            "/v1/rbd",
            "/v1/rbd/pools/{pool}/images",
        ] {
            let result = Config::load_with_env(
                None,
                env(&[("RBD_API__SERVER__API_DOCS_PATH", path)]),
            );
            assert!(
                matches!(result, Err(ConfigError::Invalid(_))),
                "{path} accepted"
            );
        }

        for path in ["/apidocs.json", "/swagger.json", "/v1/docs.json"] {
            let config = Config::load_with_env(
                None,
                env(&[("RBD_API__SERVER__API_DOCS_PATH", path)]),
            )
            .unwrap();
            assert_eq!(config.server.api_docs_path, path);
        }
    }

    #[test]
    fn test_backend_from_str() {
        assert_eq!("memory".parse::<ClusterBackend>().unwrap(), ClusterBackend::Memory);
        assert_eq!("LIBRADOS".parse::<ClusterBackend>().unwrap(), ClusterBackend::Librados);
        assert!("s3".parse::<ClusterBackend>().is_err());
        assert_eq!(ClusterBackend::Memory.to_string(), "memory");
    }
}
