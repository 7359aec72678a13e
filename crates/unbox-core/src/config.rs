//! Configuration module
//!
//! [`Config`] is the persisted TOML document; [`SecurityPolicy`] is the
//! immutable snapshot one extraction call runs against. Stores hand out the
//! current document as an `Arc` so a concurrent update never changes what an
//! in-flight call sees.

use crate::{Error, Result};
use dirs::config_dir;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, info};

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Size and count ceilings
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Independently toggleable checks
    #[serde(default)]
    pub checks: ChecksConfig,
    /// Performance settings
    #[serde(default)]
    pub performance: PerformanceConfig,
}

/// Ceilings applied during extraction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Largest single extracted file in bytes
    #[serde(deserialize_with = "deserialize_size")]
    pub max_file_size: u64,
    /// Most non-directory entries per archive
    pub max_file_count: usize,
    /// Largest raw (compressed) input in bytes
    #[serde(deserialize_with = "deserialize_size")]
    pub max_input_size: u64,
    /// Most bytes written across one call, also the bound for a decoded outer layer
    #[serde(deserialize_with = "deserialize_size")]
    pub max_total_size: u64,
    /// Extensions admitted when the extension check is on (no leading dot,
    /// `""` admits files without one)
    pub allowed_extensions: Vec<String>,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_file_size: 100 * 1024 * 1024,
            max_file_count: 10_000,
            max_input_size: 1024 * 1024 * 1024,
            max_total_size: 4 * 1024 * 1024 * 1024,
            allowed_extensions: [
                "txt", "md", "csv", "json", "xml", "toml", "yaml", "yml", "log", "html", "css",
                "js", "png", "jpg", "jpeg", "gif", "pdf",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

/// Check toggles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChecksConfig {
    pub path_traversal: bool,
    pub extension: bool,
    pub file_size: bool,
    pub file_count: bool,
    pub input_size: bool,
    pub total_size: bool,
    /// Record a blake3 digest of every extracted file
    pub checksum: bool,
    /// Run the registered content inspector on every extracted file
    pub virus_scan: bool,
}

impl Default for ChecksConfig {
    fn default() -> Self {
        Self {
            path_traversal: true,
            extension: false,
            file_size: true,
            file_count: true,
            input_size: true,
            total_size: true,
            checksum: false,
            virus_scan: false,
        }
    }
}

/// Performance configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    /// Number of threads to use (0 = auto)
    pub threads: usize,
    /// Wall-clock bound for one concurrent batch, in seconds
    pub timeout_secs: u64,
    /// Buffer size in KB
    pub buffer_size: u32,
    /// Directory for decoder temp files (system default when unset)
    pub temp_dir: Option<PathBuf>,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            threads: 0,
            timeout_secs: 300,
            buffer_size: 64,
            temp_dir: None,
        }
    }
}

/// Size given either as a byte count or a human string
#[derive(Deserialize)]
#[serde(untagged)]
enum SizeValue {
    Bytes(u64),
    Human(String),
}

fn deserialize_size<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    match SizeValue::deserialize(deserializer)? {
        SizeValue::Bytes(bytes) => Ok(bytes),
        SizeValue::Human(text) => parse_size(&text)
            .map_err(|e| D::Error::custom(format!("Failed to parse size: {}", e))),
    }
}

/// Parse size string like "100MiB" to bytes
pub fn parse_size(size_str: &str) -> Result<u64> {
    let size_str = size_str.trim();

    // Try to parse as plain number first
    if let Ok(bytes) = size_str.parse::<u64>() {
        return Ok(bytes);
    }

    // Find where the number ends and unit begins
    let split_pos = size_str
        .chars()
        .position(|c| !c.is_ascii_digit() && c != '.')
        .unwrap_or(size_str.len());

    if split_pos == 0 {
        return Err(Error::Config(format!("Invalid size format: {}", size_str)));
    }

    let (number_part, unit_part) = size_str.split_at(split_pos);
    let number: f64 = number_part
        .parse()
        .map_err(|_| Error::Config(format!("Invalid number in size: {}", number_part)))?;

    let multiplier: u64 = match unit_part.trim().to_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" => 1_000,
        "m" | "mb" => 1_000_000,
        "g" | "gb" => 1_000_000_000,
        "t" | "tb" => 1_000_000_000_000,
        "ki" | "kib" => 1_024,
        "mi" | "mib" => 1_048_576,
        "gi" | "gib" => 1_073_741_824,
        "ti" | "tib" => 1_099_511_627_776,
        _ => return Err(Error::Config(format!("Unknown size unit: {}", unit_part))),
    };

    Ok((number * multiplier as f64) as u64)
}

impl Config {
    /// Get the configuration file path
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = config_dir()
            .ok_or_else(|| Error::Config("Unable to determine config directory".to_string()))?;

        let unbox_dir = config_dir.join("unbox");
        if !unbox_dir.exists() {
            fs::create_dir_all(&unbox_dir)?;
        }

        Ok(unbox_dir.join("config.toml"))
    }

    /// Get default configuration content with examples
    pub fn default_config_content() -> String {
        r#"# unbox configuration file

[limits]
# Largest single extracted file (bytes or "100MiB", "1.5GB", ...)
max_file_size = "100MiB"
# Most files per archive
max_file_count = 10000
# Largest compressed input accepted
max_input_size = "1GiB"
# Most bytes written per extraction
max_total_size = "4GiB"
# Admitted extensions when checks.extension is on; "" admits files without one
allowed_extensions = ["txt", "md", "csv", "json", "xml", "toml", "yaml", "yml", "log", "html", "css", "js", "png", "jpg", "jpeg", "gif", "pdf"]

[checks]
path_traversal = true
extension = false
file_size = true
file_count = true
input_size = true
total_size = true
# Record a blake3 digest for every extracted file
checksum = false
# Run the content inspector, if one is installed
virus_scan = false

[performance]
# Worker threads for concurrent extraction (0 = auto-detect)
threads = 0
# Timeout for one concurrent extraction, in seconds
timeout_secs = 300
# Buffer size in KB
buffer_size = 64
# temp_dir = "/var/tmp/unbox"
"#
        .to_string()
    }

    /// Reject configurations no extraction could run under
    pub fn validate(&self) -> Result<()> {
        let limits = &self.limits;
        if limits.max_file_size == 0 {
            return Err(Error::Config("max_file_size must be positive".to_string()));
        }
        if limits.max_file_count == 0 {
            return Err(Error::Config("max_file_count must be positive".to_string()));
        }
        if limits.max_input_size == 0 {
            return Err(Error::Config("max_input_size must be positive".to_string()));
        }
        if limits.max_total_size == 0 {
            return Err(Error::Config("max_total_size must be positive".to_string()));
        }
        if self.performance.timeout_secs == 0 {
            return Err(Error::Config("timeout_secs must be positive".to_string()));
        }
        if self.performance.buffer_size == 0 {
            return Err(Error::Config("buffer_size must be positive".to_string()));
        }
        Ok(())
    }

    /// Parse and validate a TOML document
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file, writing the default one if absent
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, Self::default_config_content())?;
            info!(path = ?path, "Wrote default configuration");
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Load configuration from file
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Render as a TOML document
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))
    }

    /// Save configuration to a specific file
    pub fn save_to(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    /// Load configuration or use defaults if loading fails
    pub fn load_or_default() -> Self {
        Self::load().unwrap_or_default()
    }
}

/// Immutable per-call policy snapshot
#[derive(Debug, Clone)]
pub struct SecurityPolicy {
    pub max_file_size: u64,
    pub max_file_count: usize,
    pub max_input_size: u64,
    pub max_total_size: u64,
    /// Lower-cased, without leading dots
    pub allowed_extensions: BTreeSet<String>,
    pub checks: ChecksConfig,
    /// Worker threads, 0 for hardware parallelism
    pub threads: usize,
    pub timeout: Duration,
    /// Copy buffer size in bytes
    pub buffer_size: usize,
    pub temp_dir: Option<PathBuf>,
}

impl SecurityPolicy {
    /// Thread count with 0 resolved to the available parallelism
    pub fn effective_threads(&self) -> usize {
        if self.threads > 0 {
            self.threads
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }
}

impl From<&Config> for SecurityPolicy {
    fn from(config: &Config) -> Self {
        Self {
            max_file_size: config.limits.max_file_size,
            max_file_count: config.limits.max_file_count,
            max_input_size: config.limits.max_input_size,
            max_total_size: config.limits.max_total_size,
            allowed_extensions: config
                .limits
                .allowed_extensions
                .iter()
                .map(|ext| ext.trim_start_matches('.').to_lowercase())
                .collect(),
            checks: config.checks,
            threads: config.performance.threads,
            timeout: Duration::from_secs(config.performance.timeout_secs),
            buffer_size: config.performance.buffer_size as usize * 1024,
            temp_dir: config.performance.temp_dir.clone(),
        }
    }
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

/// Callback invoked with the new document after every update
pub type ConfigListener = Box<dyn Fn(&Config) + Send + Sync>;

/// Handle returned by [`ConfigStore::add_listener`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Source of configuration snapshots
pub trait ConfigStore: Send + Sync {
    /// Current document. The returned snapshot never changes.
    fn get_config(&self) -> Arc<Config>;

    /// Replace the document, persist it where applicable, then notify listeners
    fn update_config(&self, config: Config) -> Result<()>;

    fn add_listener(&self, listener: ConfigListener) -> ListenerId;

    /// Returns `false` if the listener was not registered
    fn remove_listener(&self, id: ListenerId) -> bool;

    /// Policy derived from the current document
    fn policy(&self) -> SecurityPolicy {
        SecurityPolicy::from(self.get_config().as_ref())
    }
}

type SharedListener = Arc<dyn Fn(&Config) + Send + Sync>;

/// In-memory store with an atomically swapped snapshot
pub struct SharedConfig {
    current: RwLock<Arc<Config>>,
    listeners: Mutex<Vec<(ListenerId, SharedListener)>>,
    next_id: AtomicU64,
}

impl SharedConfig {
    pub fn new(config: Config) -> Self {
        Self {
            current: RwLock::new(Arc::new(config)),
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    fn notify(&self, config: &Config) {
        // Called outside the lock so listeners may touch the store
        let listeners: Vec<SharedListener> = self
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        debug!(listeners = listeners.len(), "Broadcasting configuration update");
        for listener in listeners {
            listener(config);
        }
    }
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl std::fmt::Debug for SharedConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedConfig")
            .field("current", &self.get_config())
            .finish()
    }
}

impl ConfigStore for SharedConfig {
    fn get_config(&self) -> Arc<Config> {
        Arc::clone(&self.current.read().unwrap_or_else(|e| e.into_inner()))
    }

    fn update_config(&self, config: Config) -> Result<()> {
        config.validate()?;
        let config = Arc::new(config);
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Arc::clone(&config);
        self.notify(&config);
        Ok(())
    }

    fn add_listener(&self, listener: ConfigListener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::from(listener)));
        id
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }
}

/// Store backed by a TOML file
#[derive(Debug)]
pub struct FileConfigStore {
    path: PathBuf,
    shared: SharedConfig,
}

impl FileConfigStore {
    /// Open the store, creating a default file if none exists
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let config = Config::load_from(&path)?;
        Ok(Self {
            path,
            shared: SharedConfig::new(config),
        })
    }

    /// Open the store at [`Config::config_path`]
    pub fn open_default() -> Result<Self> {
        Self::open(Config::config_path()?)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigStore for FileConfigStore {
    fn get_config(&self) -> Arc<Config> {
        self.shared.get_config()
    }

    fn update_config(&self, config: Config) -> Result<()> {
        config.validate()?;
        config.save_to(&self.path)?;
        self.shared.update_config(config)
    }

    fn add_listener(&self, listener: ConfigListener) -> ListenerId {
        self.shared.add_listener(listener)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.shared.remove_listener(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.checks.path_traversal);
        assert!(!config.checks.extension);
        assert_eq!(config.limits.max_file_count, 10_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_content_matches_defaults() {
        let parsed = Config::from_toml(&Config::default_config_content()).unwrap();
        assert_eq!(parsed, Config::default());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let deserialized: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(config, deserialized);
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("100").unwrap(), 100);
        assert_eq!(parse_size("100B").unwrap(), 100);
        assert_eq!(parse_size("1KB").unwrap(), 1_000);
        assert_eq!(parse_size("1KiB").unwrap(), 1_024);
        assert_eq!(parse_size("100MiB").unwrap(), 100 * 1_048_576);
        assert_eq!(parse_size("1.5GB").unwrap(), 1_500_000_000);
        assert_eq!(parse_size("2GiB").unwrap(), 2 * 1_073_741_824);
        assert!(parse_size("invalid").is_err());
    }

    #[test]
    fn test_sizes_accept_numbers_and_strings() {
        let config = Config::from_toml(
            r#"
            [limits]
            max_file_size = "1MiB"
            max_input_size = 2048
            "#,
        )
        .unwrap();
        assert_eq!(config.limits.max_file_size, 1_048_576);
        assert_eq!(config.limits.max_input_size, 2048);
        // Missing fields keep their defaults
        assert_eq!(config.limits.max_file_count, 10_000);
    }

    #[test]
    fn test_validate_rejects_zero_ceilings() {
        let mut config = Config::default();
        config.limits.max_file_count = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_policy_from_config() {
        let mut config = Config::default();
        config.limits.allowed_extensions = vec![".TXT".to_string(), "Md".to_string()];
        config.performance.threads = 3;
        config.performance.buffer_size = 8;

        let policy = SecurityPolicy::from(&config);
        assert!(policy.allowed_extensions.contains("txt"));
        assert!(policy.allowed_extensions.contains("md"));
        assert_eq!(policy.effective_threads(), 3);
        assert_eq!(policy.buffer_size, 8 * 1024);
        assert_eq!(policy.timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_snapshot_survives_update() {
        let store = SharedConfig::default();
        let before = store.get_config();

        let mut next = Config::default();
        next.limits.max_file_count = 5;
        store.update_config(next).unwrap();

        assert_eq!(before.limits.max_file_count, 10_000);
        assert_eq!(store.get_config().limits.max_file_count, 5);
    }

    #[test]
    fn test_listeners() {
        let store = SharedConfig::default();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&calls);
        let id = store.add_listener(Box::new(move |config| {
            assert_eq!(config.performance.threads, 2);
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let mut next = Config::default();
        next.performance.threads = 2;
        store.update_config(next.clone()).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert!(store.remove_listener(id));
        assert!(!store.remove_listener(id));
        store.update_config(next).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_invalid_update_is_rejected() {
        let store = SharedConfig::default();
        let mut bad = Config::default();
        bad.limits.max_file_size = 0;
        assert!(store.update_config(bad).is_err());
        assert_eq!(store.get_config().limits.max_file_size, 100 * 1024 * 1024);
    }

    #[test]
    fn test_file_store_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let store = FileConfigStore::open(&path).unwrap();
        assert!(path.exists());

        let mut next = Config::default();
        next.checks.extension = true;
        store.update_config(next).unwrap();

        let reopened = FileConfigStore::open(&path).unwrap();
        assert!(reopened.get_config().checks.extension);
    }
}
