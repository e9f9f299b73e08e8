//! Per-subtask configuration.
//!
//! One immutable record passed into each subtask at construction; nothing in
//! the crate reads process-wide state. The recognized string options (the
//! form a job submission carries them in) are parsed by
//! [`SubtaskConfig::from_params`]; a structured parameter map takes
//! precedence over ambient process properties when both are present.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};

/// Which log storage backend to use for the replay log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageType {
    /// Volatile in-memory storage, for tests and local experiments.
    #[default]
    Memory,
    /// One append-only file per log name on the local disk.
    LocalDisk,
    /// A distributed-filesystem mount; the root comes from
    /// [`SubtaskConfig::remote_log_dir`].
    RemoteFs,
}

/// Immutable configuration of one subtask instance.
#[derive(Debug, Clone)]
pub struct SubtaskConfig {
    /// Turn deterministic-replay logging on.
    pub enable_logging: bool,
    /// Backend used for the replay log when logging is enabled.
    pub storage_type: StorageType,
    /// Base directory for [`StorageType::LocalDisk`] logs.
    pub local_log_dir: PathBuf,
    /// Root of the distributed filesystem for [`StorageType::RemoteFs`].
    pub remote_log_dir: Option<PathBuf>,
    /// Truncate any pre-existing log before the subtask starts.
    pub clear_old_log: bool,
    /// Diagnostic verbosity; levels above zero enable per-step trace output.
    pub print_level: u8,
    /// Period of the no-op ping mail used to defeat starvation, if any.
    pub control_delay: Option<Duration>,
    /// Retain uncommitted output bytes in the writer for replay.
    pub enable_output_cache: bool,
}

impl Default for SubtaskConfig {
    fn default() -> Self {
        Self {
            enable_logging: false,
            storage_type: StorageType::Memory,
            local_log_dir: PathBuf::from("./molt-logs"),
            remote_log_dir: None,
            clear_old_log: false,
            print_level: 0,
            control_delay: None,
            enable_output_cache: false,
        }
    }
}

impl SubtaskConfig {
    /// Parse the recognized options from a string key/value map.
    ///
    /// Unrecognized keys are ignored (the map usually carries job-wide
    /// parameters that are none of our business). Recognized keys:
    /// `enable-logging`, `storage-type` (`mem` | `local` | anything else
    /// selects the remote backend), `hdfs-log-storage`, `clear-old-log`,
    /// `print-level`, `control-delay` (milliseconds), `enable-output-cache`.
    pub fn from_params(params: &HashMap<String, String>) -> Result<Self> {
        let mut config = Self::default();
        config.apply_params(params)?;
        Ok(config)
    }

    /// Parse with precedence: `structured` overrides `ambient`.
    pub fn from_params_with_ambient(
        structured: &HashMap<String, String>,
        ambient: &HashMap<String, String>,
    ) -> Result<Self> {
        let mut config = Self::default();
        config.apply_params(ambient)?;
        config.apply_params(structured)?;
        Ok(config)
    }

    fn apply_params(&mut self, params: &HashMap<String, String>) -> Result<()> {
        if let Some(v) = params.get("enable-logging") {
            self.enable_logging = parse_bool("enable-logging", v)?;
        }
        if let Some(v) = params.get("storage-type") {
            self.storage_type = match v.as_str() {
                "mem" => StorageType::Memory,
                "local" => StorageType::LocalDisk,
                _ => StorageType::RemoteFs,
            };
        }
        if let Some(v) = params.get("hdfs-log-storage") {
            self.remote_log_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = params.get("clear-old-log") {
            self.clear_old_log = parse_bool("clear-old-log", v)?;
        }
        if let Some(v) = params.get("print-level") {
            self.print_level = v
                .parse()
                .with_context(|| format!("invalid print-level {v:?}"))?;
        }
        if let Some(v) = params.get("control-delay") {
            let millis: u64 = v
                .parse()
                .with_context(|| format!("invalid control-delay {v:?}"))?;
            self.control_delay = Some(Duration::from_millis(millis));
        }
        if let Some(v) = params.get("enable-output-cache") {
            self.enable_output_cache = parse_bool("enable-output-cache", v)?;
        }
        if self.storage_type == StorageType::RemoteFs && self.remote_log_dir.is_none() {
            bail!("storage-type selects the remote backend but hdfs-log-storage has no path");
        }
        Ok(())
    }

    pub fn with_logging(mut self, storage_type: StorageType) -> Self {
        self.enable_logging = true;
        self.storage_type = storage_type;
        self
    }

    pub fn with_local_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.local_log_dir = dir.into();
        self
    }

    pub fn with_output_cache(mut self) -> Self {
        self.enable_output_cache = true;
        self
    }

    pub fn with_control_delay(mut self, delay: Duration) -> Self {
        self.control_delay = Some(delay);
        self
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    value
        .parse()
        .with_context(|| format!("invalid boolean for {key}: {value:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = SubtaskConfig::default();
        assert!(!config.enable_logging);
        assert_eq!(config.storage_type, StorageType::Memory);
        assert!(!config.enable_output_cache);
        assert!(config.control_delay.is_none());
    }

    #[test]
    fn test_from_params_recognized_options() {
        let config = SubtaskConfig::from_params(&params(&[
            ("enable-logging", "true"),
            ("storage-type", "local"),
            ("clear-old-log", "true"),
            ("print-level", "2"),
            ("control-delay", "50"),
            ("enable-output-cache", "true"),
        ]))
        .unwrap();
        assert!(config.enable_logging);
        assert_eq!(config.storage_type, StorageType::LocalDisk);
        assert!(config.clear_old_log);
        assert_eq!(config.print_level, 2);
        assert_eq!(config.control_delay, Some(Duration::from_millis(50)));
        assert!(config.enable_output_cache);
    }

    #[test]
    fn test_remote_storage_requires_path() {
        let err = SubtaskConfig::from_params(&params(&[("storage-type", "hdfs")]))
            .expect_err("remote without a path must be rejected");
        assert!(err.to_string().contains("hdfs-log-storage"));

        let config = SubtaskConfig::from_params(&params(&[
            ("storage-type", "hdfs"),
            ("hdfs-log-storage", "/mnt/dfs/molt"),
        ]))
        .unwrap();
        assert_eq!(config.storage_type, StorageType::RemoteFs);
        assert_eq!(config.remote_log_dir, Some(PathBuf::from("/mnt/dfs/molt")));
    }

    #[test]
    fn test_structured_overrides_ambient() {
        let ambient = params(&[("enable-logging", "true"), ("storage-type", "mem")]);
        let structured = params(&[("storage-type", "local")]);
        let config = SubtaskConfig::from_params_with_ambient(&structured, &ambient).unwrap();
        assert!(config.enable_logging);
        assert_eq!(config.storage_type, StorageType::LocalDisk);
    }
}
