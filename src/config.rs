//! Runtime configuration.
//!
//! Defaults are usable as-is. A TOML file can override any of them:
//!
//! ```toml
//! [sandbox]
//! timeout_ms = 30000
//! max_heap_mb = 64
//! max_concurrent = 8
//! entry_export = "handler"
//!
//! [fetch]
//! allowed_origins = ["https://api.example.com"]
//! timeout_ms = 10000
//! max_redirects = 5
//! max_in_flight = 16
//!
//! [store]
//! deployments_dir = "dist/deployments"
//! ```

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

/// Per-sandbox limits and entry contract.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Wall-clock budget for one invocation, initialization included.
    pub timeout_ms: u64,
    /// V8 heap ceiling in bytes.
    pub max_heap_size: usize,
    /// Maximum number of live sandboxes across the process.
    pub max_concurrent: usize,
    /// Name of the export called with each request.
    pub entry_export: String,
    pub fetch: FetchConfig,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            max_heap_size: 64 * 1024 * 1024,
            max_concurrent: 8,
            entry_export: String::from("handler"),
            fetch: FetchConfig::default(),
        }
    }
}

impl SandboxConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_ms == 0 {
            return Err(ConfigError::Invalid("sandbox.timeout_ms must be positive".into()));
        }
        if self.max_heap_size == 0 {
            return Err(ConfigError::Invalid("sandbox.max_heap_mb must be positive".into()));
        }
        if self.max_concurrent == 0 {
            return Err(ConfigError::Invalid(
                "sandbox.max_concurrent must be positive".into(),
            ));
        }
        if self.entry_export.trim().is_empty() {
            return Err(ConfigError::Invalid("sandbox.entry_export must not be empty".into()));
        }
        self.fetch.validate()
    }
}

/// Host policy for outbound fetches made by deployments.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Origins deployments may reach, e.g. `https://api.example.com`.
    /// Empty disables fetch.
    pub allowed_origins: Vec<String>,
    pub timeout_ms: u64,
    pub max_redirects: usize,
    /// Fetches one sandbox may have outstanding at once. Further calls are
    /// rejected inside the sandbox.
    pub max_in_flight: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec![],
            timeout_ms: 10_000,
            max_redirects: 5,
            max_in_flight: 16,
        }
    }
}

impl FetchConfig {
    pub fn is_origin_allowed(&self, url: &url::Url) -> bool {
        if self.allowed_origins.is_empty() {
            return false;
        }
        let origin = url.origin().ascii_serialization();
        self.allowed_origins.iter().any(|allowed| origin == *allowed)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_ms == 0 {
            return Err(ConfigError::Invalid("fetch.timeout_ms must be positive".into()));
        }
        if self.max_in_flight == 0 {
            return Err(ConfigError::Invalid("fetch.max_in_flight must be positive".into()));
        }
        for origin in &self.allowed_origins {
            let parsed = url::Url::parse(origin).map_err(|e| {
                ConfigError::Invalid(format!("fetch.allowed_origins: '{origin}': {e}"))
            })?;
            if parsed.origin().ascii_serialization() != *origin {
                return Err(ConfigError::Invalid(format!(
                    "fetch.allowed_origins: '{origin}' is not a bare origin (expected '{}')",
                    parsed.origin().ascii_serialization()
                )));
            }
        }
        Ok(())
    }
}

/// Contents of a config file. Missing sections and keys keep their defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EdgeConfig {
    #[serde(default)]
    pub sandbox: SandboxOverrides,
    #[serde(default)]
    pub fetch: FetchOverrides,
    #[serde(default)]
    pub store: StoreOverrides,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SandboxOverrides {
    pub timeout_ms: Option<u64>,
    pub max_heap_mb: Option<usize>,
    pub max_concurrent: Option<usize>,
    pub entry_export: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FetchOverrides {
    pub allowed_origins: Option<Vec<String>>,
    pub timeout_ms: Option<u64>,
    pub max_redirects: Option<usize>,
    pub max_in_flight: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreOverrides {
    pub deployments_dir: Option<PathBuf>,
}

impl EdgeConfig {
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: EdgeConfig = toml::from_str(toml_str)?;
        config.sandbox_config().validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn sandbox_config(&self) -> SandboxConfig {
        let defaults = SandboxConfig::default();
        let fetch_defaults = FetchConfig::default();
        SandboxConfig {
            timeout_ms: self.sandbox.timeout_ms.unwrap_or(defaults.timeout_ms),
            max_heap_size: self
                .sandbox
                .max_heap_mb
                .map(|mb| mb.saturating_mul(1024 * 1024))
                .unwrap_or(defaults.max_heap_size),
            max_concurrent: self.sandbox.max_concurrent.unwrap_or(defaults.max_concurrent),
            entry_export: self
                .sandbox
                .entry_export
                .clone()
                .unwrap_or(defaults.entry_export),
            fetch: FetchConfig {
                allowed_origins: self
                    .fetch
                    .allowed_origins
                    .clone()
                    .unwrap_or(fetch_defaults.allowed_origins),
                timeout_ms: self.fetch.timeout_ms.unwrap_or(fetch_defaults.timeout_ms),
                max_redirects: self.fetch.max_redirects.unwrap_or(fetch_defaults.max_redirects),
                max_in_flight: self.fetch.max_in_flight.unwrap_or(fetch_defaults.max_in_flight),
            },
        }
    }

    pub fn deployments_dir(&self) -> PathBuf {
        self.store
            .deployments_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("dist/deployments"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_matching() {
        let config = FetchConfig {
            allowed_origins: vec![
                "https://api.example.com".to_string(),
                "http://localhost:3000".to_string(),
            ],
            ..Default::default()
        };

        assert!(config.is_origin_allowed(&url::Url::parse("https://api.example.com/users").unwrap()));
        assert!(config.is_origin_allowed(&url::Url::parse("http://localhost:3000/api").unwrap()));

        assert!(!config.is_origin_allowed(&url::Url::parse("https://evil.com/api").unwrap()));
        // scheme and port are part of the origin
        assert!(!config.is_origin_allowed(&url::Url::parse("http://api.example.com/users").unwrap()));
        assert!(!config.is_origin_allowed(&url::Url::parse("https://api.example.com:8080/").unwrap()));
    }

    #[test]
    fn test_empty_allowlist() {
        let config = FetchConfig::default();
        assert!(!config.is_origin_allowed(&url::Url::parse("https://anything.com").unwrap()));
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = EdgeConfig::from_toml("").unwrap();
        let sandbox = config.sandbox_config();
        assert_eq!(sandbox.timeout_ms, 30_000);
        assert_eq!(sandbox.max_heap_size, 64 * 1024 * 1024);
        assert_eq!(sandbox.max_concurrent, 8);
        assert_eq!(sandbox.entry_export, "handler");
        assert!(sandbox.fetch.allowed_origins.is_empty());
        assert_eq!(config.deployments_dir(), PathBuf::from("dist/deployments"));
    }

    #[test]
    fn test_overrides() {
        let config = EdgeConfig::from_toml(
            r#"
            [sandbox]
            timeout_ms = 500
            max_heap_mb = 32
            entry_export = "fetch"

            [fetch]
            allowed_origins = ["https://api.example.com"]
            max_redirects = 0
            max_in_flight = 2

            [store]
            deployments_dir = "/srv/deployments"
            "#,
        )
        .unwrap();
        let sandbox = config.sandbox_config();
        assert_eq!(sandbox.timeout_ms, 500);
        assert_eq!(sandbox.max_heap_size, 32 * 1024 * 1024);
        assert_eq!(sandbox.max_concurrent, 8);
        assert_eq!(sandbox.entry_export, "fetch");
        assert_eq!(sandbox.fetch.allowed_origins, vec!["https://api.example.com"]);
        assert_eq!(sandbox.fetch.max_redirects, 0);
        assert_eq!(sandbox.fetch.max_in_flight, 2);
        assert_eq!(config.deployments_dir(), PathBuf::from("/srv/deployments"));
    }

    #[test]
    fn test_rejects_zero_limits() {
        for toml_str in [
            "[sandbox]\ntimeout_ms = 0",
            "[sandbox]\nmax_heap_mb = 0",
            "[sandbox]\nmax_concurrent = 0",
            "[sandbox]\nentry_export = \" \"",
            "[fetch]\ntimeout_ms = 0",
            "[fetch]\nmax_in_flight = 0",
        ] {
            let err = EdgeConfig::from_toml(toml_str).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid(_)), "{toml_str}: {err}");
        }
    }

    #[test]
    fn test_rejects_bad_origin() {
        let err = EdgeConfig::from_toml("[fetch]\nallowed_origins = [\"not a url\"]").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err =
            EdgeConfig::from_toml("[fetch]\nallowed_origins = [\"https://a.com/path\"]").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_unknown_keys() {
        let err = EdgeConfig::from_toml("[sandbox]\ntimeout = 5").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("edge.toml");
        std::fs::write(&path, "[sandbox]\nmax_concurrent = 2\n").unwrap();
        let config = EdgeConfig::from_file(&path).unwrap();
        assert_eq!(config.sandbox_config().max_concurrent, 2);

        let missing = EdgeConfig::from_file(&dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(missing, ConfigError::Io { .. }));
    }
}
