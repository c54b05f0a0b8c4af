use crate::{
    admission::AdmissionPolicy,
    error::{Error, Result},
    log,
    message::ParticipantId,
    transport::RetryPolicy,
};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fs, path::{Path, PathBuf}, time::Duration};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub timeout_ms: u64,
    pub attempts: u32,
    pub backoff_ms: u64,
    /// Per-attempt timeout for calls that may wait on a chunk lock.
    pub lock_timeout_ms: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5000,
            attempts: 3,
            backoff_ms: 100,
            lock_timeout_ms: 60_000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub collect_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            collect_timeout_ms: 12_000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MutexConfig {
    pub rebroadcast_after_ms: u64,
    pub max_rebroadcasts: u32,
}

impl Default for MutexConfig {
    fn default() -> Self {
        Self {
            rebroadcast_after_ms: 5000,
            max_rebroadcasts: 3,
        }
    }
}

/// Everything a node needs to find the rest of the cluster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub server_address: String,
    pub backup_address: String,
    /// Bare clock participants (besides the students) and where they listen.
    pub clock_participants: BTreeMap<ParticipantId, String>,
    pub rpc: RpcConfig,
    pub sync: SyncConfig,
    pub mutex: MutexConfig,
    pub admission: AdmissionPolicy,
    pub store_path: PathBuf,
    pub metadata_path: PathBuf,
    pub replica_dir: PathBuf,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            server_address: "127.0.0.1:9000".to_string(),
            backup_address: "127.0.0.1:9003".to_string(),
            clock_participants: BTreeMap::from([
                ("teacher".into(), "127.0.0.1:9001".to_string()),
                ("client".into(), "127.0.0.1:9002".to_string()),
            ]),
            rpc: RpcConfig::default(),
            sync: SyncConfig::default(),
            mutex: MutexConfig::default(),
            admission: AdmissionPolicy::default(),
            store_path: PathBuf::from("results.json"),
            metadata_path: PathBuf::from("replication_metadata.json"),
            replica_dir: PathBuf::from("."),
        }
    }
}

impl ClusterConfig {
    /// Reads `path` (defaults if it does not exist) and applies environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let text = fs::read_to_string(path)
                .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
            serde_json::from_str(&text)
                .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display())))?
        } else {
            Self::default()
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Applies `EXAM_SERVER_ADDRESS`, `EXAM_BACKUP_ADDRESS` and `EXAM_RPC_TIMEOUT_MS`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |key: &str| {
            lookup(key)
                .map(|raw| raw.trim().to_string())
                .filter(|raw| !raw.is_empty())
        };

        if let Some(address) = var("EXAM_SERVER_ADDRESS") {
            self.server_address = address;
        }
        if let Some(address) = var("EXAM_BACKUP_ADDRESS") {
            self.backup_address = address;
        }
        if let Some(raw) = var("EXAM_RPC_TIMEOUT_MS") {
            match raw.parse::<u64>() {
                Ok(ms) => self.rpc.timeout_ms = ms,
                Err(e) => log::warn(&format!("invalid EXAM_RPC_TIMEOUT_MS, ignoring: {e}")),
            }
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_millis(self.rpc.timeout_ms),
            attempts: self.rpc.attempts,
            backoff: Duration::from_millis(self.rpc.backoff_ms),
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc.lock_timeout_ms)
    }

    pub fn collect_timeout(&self) -> Duration {
        Duration::from_millis(self.sync.collect_timeout_ms)
    }

    pub fn rebroadcast_after(&self) -> Duration {
        Duration::from_millis(self.mutex.rebroadcast_after_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_means_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ClusterConfig::load(&dir.path().join("cluster.json")).unwrap();
        assert_eq!(config.sync.collect_timeout_ms, 12_000);
        assert_eq!(config.admission, AdmissionPolicy::default());
    }

    #[test]
    fn partial_documents_keep_the_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cluster.json");
        fs::write(
            &path,
            r#"{ "admission": { "policy": "bounded_concurrency", "permits": 4 }, "rpc": { "attempts": 5 } }"#,
        )
        .unwrap();

        let config: ClusterConfig = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(config.admission, AdmissionPolicy::BoundedConcurrency { permits: 4 });
        assert_eq!(config.rpc.attempts, 5);
        assert_eq!(config.rpc.timeout_ms, 5000);
        assert_eq!(config.server_address, "127.0.0.1:9000");
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cluster.json");
        fs::write(&path, "[1, 2").unwrap();
        assert!(matches!(ClusterConfig::load(&path), Err(Error::Config(_))));
    }

    #[test]
    fn overrides_win_and_bad_values_are_ignored() {
        let mut config = ClusterConfig::default();
        config.apply_overrides(|key| match key {
            "EXAM_SERVER_ADDRESS" => Some(" 10.0.0.1:9000 ".to_string()),
            "EXAM_BACKUP_ADDRESS" => Some(String::new()),
            "EXAM_RPC_TIMEOUT_MS" => Some("soon".to_string()),
            _ => None,
        });
        assert_eq!(config.server_address, "10.0.0.1:9000");
        assert_eq!(config.backup_address, "127.0.0.1:9003");
        assert_eq!(config.rpc.timeout_ms, 5000);
    }
}
