//! Server configuration.
//!
//! Handles defaults, JSON config files, environment overrides and the
//! runtime `set()` merge of a config map.
//!
//! # Precedence
//!
//! 1. [`ServerConfig::default`]
//! 2. JSON file ([`ServerConfig::load_from_file`])
//! 3. `FORKSERVE_WORKER_NUM` / `FORKSERVE_RUNTIME_DIR` ([`ServerConfig::apply_env_overrides`])
//! 4. Explicit [`ServerConfig::merge`] calls (CLI flags, `Server::set`)

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Configuration for a [`crate::Server`].
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    /// Number of worker processes to spawn.
    pub worker_num: usize,
    /// Directory holding one `{worker_id}.sock` endpoint per worker.
    ///
    /// `None` resolves to [`default_runtime_dir`] for the bound port.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            worker_num: 1,
            runtime_dir: None,
        }
    }
}

impl ServerConfig {
    /// Load configuration from a JSON file, falling back to defaults for
    /// missing keys.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let value: Value = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        let mut config = Self::default();
        config.merge(&value)?;
        Ok(config)
    }

    /// Apply `FORKSERVE_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(raw) = std::env::var("FORKSERVE_WORKER_NUM") {
            self.worker_num = raw
                .trim()
                .parse()
                .with_context(|| format!("FORKSERVE_WORKER_NUM is not a non-negative integer: {raw:?}"))?;
        }
        if let Ok(dir) = std::env::var("FORKSERVE_RUNTIME_DIR") {
            if !dir.is_empty() {
                self.runtime_dir = Some(PathBuf::from(dir));
            }
        }
        Ok(())
    }

    /// Merge a JSON object of options into this configuration.
    ///
    /// Recognized keys are `worker_num` and `runtime_dir`. Unknown keys are
    /// logged and ignored. The merge is all-or-nothing: on a type error no
    /// field is changed.
    pub fn merge(&mut self, value: &Value) -> Result<()> {
        let Some(map) = value.as_object() else {
            bail!("config must be a JSON object, got: {value}");
        };
        let merged = self.merged_with(map)?;
        *self = merged;
        Ok(())
    }

    fn merged_with(&self, map: &Map<String, Value>) -> Result<Self> {
        let mut next = self.clone();
        for (key, value) in map {
            match key.as_str() {
                "worker_num" => {
                    let Some(n) = value.as_u64() else {
                        bail!("worker_num must be a non-negative integer, got: {value}");
                    };
                    next.worker_num = usize::try_from(n)
                        .with_context(|| format!("worker_num out of range: {n}"))?;
                }
                "runtime_dir" => match value {
                    Value::String(s) => next.runtime_dir = Some(PathBuf::from(s)),
                    Value::Null => next.runtime_dir = None,
                    other => bail!("runtime_dir must be a string path, got: {other}"),
                },
                unknown => {
                    log::warn!("[config] ignoring unrecognized option {unknown:?}");
                }
            }
        }
        Ok(next)
    }

    /// Resolve the endpoint directory for a server bound to `port`.
    pub fn resolved_runtime_dir(&self, port: u16) -> PathBuf {
        self.runtime_dir
            .clone()
            .unwrap_or_else(|| default_runtime_dir(port))
    }
}

/// Default endpoint directory: `{runtime}/forkserve-{uid}/{port}`.
///
/// `{runtime}` is `$XDG_RUNTIME_DIR` when set, otherwise the system temp
/// dir. The port component keeps two servers on one host apart.
pub fn default_runtime_dir(port: u16) -> PathBuf {
    // SAFETY: getuid has no preconditions and cannot fail.
    let uid = unsafe { libc::getuid() };
    dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(format!("forkserve-{uid}"))
        .join(port.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_worker_num_is_one() {
        let config = ServerConfig::default();
        assert_eq!(config.worker_num, 1);
        assert!(config.runtime_dir.is_none());
    }

    #[test]
    fn test_merge_recognized_keys() {
        let mut config = ServerConfig::default();
        config
            .merge(&json!({"worker_num": 4, "runtime_dir": "/tmp/fs-test"}))
            .unwrap();
        assert_eq!(config.worker_num, 4);
        assert_eq!(config.runtime_dir, Some(PathBuf::from("/tmp/fs-test")));
    }

    #[test]
    fn test_merge_keeps_unmentioned_keys() {
        let mut config = ServerConfig {
            worker_num: 3,
            runtime_dir: Some(PathBuf::from("/run/x")),
        };
        config.merge(&json!({"worker_num": 0})).unwrap();
        assert_eq!(config.worker_num, 0);
        assert_eq!(config.runtime_dir, Some(PathBuf::from("/run/x")));
    }

    #[test]
    fn test_merge_ignores_unknown_keys() {
        let mut config = ServerConfig::default();
        config.merge(&json!({"daemonize": true})).unwrap();
        assert_eq!(config, ServerConfig::default());
    }

    #[test]
    fn test_merge_type_error_leaves_config_unchanged() {
        let mut config = ServerConfig::default();
        let result = config.merge(&json!({"runtime_dir": "/a", "worker_num": -2}));
        assert!(result.is_err());
        assert_eq!(config, ServerConfig::default());
    }

    #[test]
    fn test_merge_rejects_non_object() {
        let mut config = ServerConfig::default();
        assert!(config.merge(&json!([1, 2])).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("server.json");
        fs::write(&path, r#"{"worker_num": 8}"#).unwrap();

        let config = ServerConfig::load_from_file(&path).unwrap();
        assert_eq!(config.worker_num, 8);
        assert!(config.runtime_dir.is_none());
    }

    #[test]
    fn test_load_from_missing_file_fails() {
        let tmp = tempfile::TempDir::new().unwrap();
        let result = ServerConfig::load_from_file(&tmp.path().join("nope.json"));
        assert!(result.is_err());
    }

    #[test]
    fn test_resolved_runtime_dir_prefers_explicit() {
        let config = ServerConfig {
            worker_num: 1,
            runtime_dir: Some(PathBuf::from("/srv/sockets")),
        };
        assert_eq!(config.resolved_runtime_dir(9000), PathBuf::from("/srv/sockets"));
    }

    #[test]
    fn test_default_runtime_dir_is_keyed_by_port() {
        let a = default_runtime_dir(8080);
        let b = default_runtime_dir(8081);
        assert_ne!(a, b);
        assert!(a.ends_with("8080"));
    }
}
