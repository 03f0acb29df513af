//! Configuration for a [`DocumentStore`](crate::DocumentStore).

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use docstore_core::{DefaultFields, Document};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, StoreError};

/// Store construction parameters.
///
/// Serializes to a flat JSON options file; every field is optional on load
/// and falls back to its default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding one document file per key. Created if absent.
    pub root_dir: PathBuf,
    /// Fields present on every document returned by the store.
    pub default_data: DefaultFields,
    /// Maximum number of cached documents. 0 disables the cache.
    pub cache_size: usize,
    /// How long the idle I/O worker sleeps between checks for work or stop.
    #[serde(rename = "poll_interval_ms", with = "millis")]
    pub poll_interval: Duration,
    /// Upper bound on how long `close()` waits for admitted operations.
    #[serde(rename = "drain_timeout_ms", with = "millis")]
    pub drain_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("data"),
            default_data: DefaultFields::default(),
            cache_size: 128,
            poll_interval: Duration::from_millis(100),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

impl StoreConfig {
    /// Default configuration rooted at `root_dir`.
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            ..Self::default()
        }
    }

    /// Replaces the default-field mapping.
    #[must_use]
    pub fn with_default_data(mut self, default_data: Document) -> Self {
        self.default_data = DefaultFields::new(default_data);
        self
    }

    /// Replaces the cache capacity.
    #[must_use]
    pub fn with_cache_size(mut self, cache_size: usize) -> Self {
        self.cache_size = cache_size;
        self
    }

    /// Replaces the worker poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Checks values that would make the store misbehave.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Config`] for a zero poll interval or an empty root path.
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(StoreError::Config(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.root_dir.as_os_str().is_empty() {
            return Err(StoreError::Config("root_dir must not be empty".to_string()));
        }
        Ok(())
    }

    /// Loads options from a JSON file, writing it back with any missing
    /// fields filled in. A missing file is created as a template holding the
    /// defaults.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Config`] if the file is not valid options JSON,
    /// or [`StoreError::Io`] if it cannot be read or written.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        let config = match fs::read(path) {
            Ok(bytes) => serde_json::from_slice::<Self>(&bytes)
                .map_err(|e| StoreError::Config(format!("{}: {e}", path.display())))?,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!(path = %path.display(), "options file not found, writing template");
                Self::default()
            }
            Err(e) => return Err(e.into()),
        };
        config.validate()?;
        let text = serde_json::to_string_pretty(&config)
            .map_err(|e| StoreError::Config(e.to_string()))?;
        fs::write(path, text)?;
        Ok(config)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::cast_possible_truncation)]
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        // Millisecond intervals never approach u64::MAX.
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn store_config_defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.root_dir, PathBuf::from("data"));
        assert!(config.default_data.fields().is_empty());
        assert_eq!(config.cache_size, 128);
        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert_eq!(config.drain_timeout, Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn builders_override_fields() {
        let defaults = json!({ "prefix": "!" }).as_object().cloned().unwrap();
        let config = StoreConfig::new("/tmp/guilds")
            .with_default_data(defaults)
            .with_cache_size(0)
            .with_poll_interval(Duration::from_millis(5));
        assert_eq!(config.root_dir, PathBuf::from("/tmp/guilds"));
        assert_eq!(config.default_data.get("prefix"), Some(&json!("!")));
        assert_eq!(config.cache_size, 0);
        assert_eq!(config.poll_interval, Duration::from_millis(5));
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let config = StoreConfig::default().with_poll_interval(Duration::ZERO);
        assert!(matches!(config.validate(), Err(StoreError::Config(_))));
        let config = StoreConfig::new("");
        assert!(matches!(config.validate(), Err(StoreError::Config(_))));
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: StoreConfig = serde_json::from_value(json!({
            "root_dir": "guilds",
            "default_data": { "volume": 50 },
            "poll_interval_ms": 10
        }))
        .unwrap();
        assert_eq!(config.root_dir, PathBuf::from("guilds"));
        assert_eq!(config.default_data.get("volume"), Some(&json!(50)));
        assert_eq!(config.cache_size, 128);
        assert_eq!(config.poll_interval, Duration::from_millis(10));
    }

    #[test]
    fn load_or_create_writes_template() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("options.json");

        let config = StoreConfig::load_or_create(&path).unwrap();
        assert_eq!(config, StoreConfig::default());

        let written: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["cache_size"], json!(128));
        assert_eq!(written["poll_interval_ms"], json!(100));
    }

    #[test]
    fn load_or_create_fills_missing_fields_in_place() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("options.json");
        fs::write(&path, r#"{ "cache_size": 4 }"#).unwrap();

        let config = StoreConfig::load_or_create(&path).unwrap();
        assert_eq!(config.cache_size, 4);

        let rewritten: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(rewritten["cache_size"], json!(4));
        assert_eq!(rewritten["root_dir"], json!("data"));
        assert_eq!(rewritten["drain_timeout_ms"], json!(30_000));
    }

    #[test]
    fn load_or_create_rejects_malformed_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("options.json");
        fs::write(&path, "not json").unwrap();
        assert!(matches!(
            StoreConfig::load_or_create(&path),
            Err(StoreError::Config(_))
        ));
    }
}
