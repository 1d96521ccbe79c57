use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::time::Duration;

use anyhow::Context as _;
use camino::{Utf8Path, Utf8PathBuf};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tap::prelude::*;

/// Key/value string store the engine reads flags from and persists the permanent allow-list into.
pub trait ConfigStore: Send + Sync {
    fn get_string(&self, key: &str) -> Option<String>;

    fn set_string(&self, key: &str, value: &str) -> anyhow::Result<()>;

    fn remove_key(&self, key: &str) -> anyhow::Result<()>;

    fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get_string(key).as_deref().map(str::trim) {
            Some(value) if value.eq_ignore_ascii_case("true") => true,
            Some(value) if value.eq_ignore_ascii_case("false") => false,
            Some(value) => {
                warn!(key, value, "Invalid boolean value in configuration, using default");
                default
            }
            None => default,
        }
    }
}

/// In-memory [`ConfigStore`], lost when dropped.
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    values: RwLock<HashMap<String, String>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        self.values.read().keys().cloned().collect()
    }
}

impl ConfigStore for MemoryConfigStore {
    fn get_string(&self, key: &str) -> Option<String> {
        self.values.read().get(key).cloned()
    }

    fn set_string(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.values.write().insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove_key(&self, key: &str) -> anyhow::Result<()> {
        self.values.write().remove(key);
        Ok(())
    }
}

/// [`ConfigStore`] persisted as a flat JSON object, rewritten on every change.
///
/// Non-string values found in the file are preserved and exposed through their JSON rendering.
#[derive(Debug)]
pub struct JsonConfigStore {
    path: Utf8PathBuf,
    values: RwLock<serde_json::Map<String, serde_json::Value>>,
}

impl JsonConfigStore {
    /// Loads the store at `path`; a missing file is an empty store.
    pub fn open(path: impl Into<Utf8PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let values = load_json_object(&path)?.unwrap_or_default();

        Ok(Self {
            path,
            values: RwLock::new(values),
        })
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    fn save(&self, values: &serde_json::Map<String, serde_json::Value>) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent().filter(|parent| !parent.as_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| format!("failed to create directory {parent}"))?;
        }

        let json = serde_json::to_string_pretty(values).context("failed JSON serialization of configuration")?;
        std::fs::write(&self.path, json).with_context(|| format!("failed to write file at {}", self.path))?;

        Ok(())
    }
}

impl ConfigStore for JsonConfigStore {
    fn get_string(&self, key: &str) -> Option<String> {
        match self.values.read().get(key)? {
            serde_json::Value::String(value) => Some(value.clone()),
            serde_json::Value::Null => None,
            other => Some(other.to_string()),
        }
    }

    fn set_string(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let mut values = self.values.write();

        // The in-memory map only changes once the file has been written.
        let mut updated = values.clone();
        updated.insert(key.to_owned(), serde_json::Value::String(value.to_owned()));
        self.save(&updated)?;
        *values = updated;

        Ok(())
    }

    fn remove_key(&self, key: &str) -> anyhow::Result<()> {
        let mut values = self.values.write();

        if values.contains_key(key) {
            let mut updated = values.clone();
            updated.remove(key);
            self.save(&updated)?;
            *values = updated;
        }

        Ok(())
    }
}

fn load_json_object(path: &Utf8Path) -> anyhow::Result<Option<serde_json::Map<String, serde_json::Value>>> {
    match File::open(path) {
        Ok(file) => BufReader::new(file)
            .pipe(serde_json::from_reader)
            .map(Some)
            .with_context(|| format!("invalid config file at {path}")),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(anyhow::anyhow!(e).context(format!("couldn't open config file at {path}"))),
    }
}

/// Names of the runtime flags and allow-list entries inside a [`ConfigStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigKeys {
    prefix: String,
}

impl ConfigKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Operator escape hatch: when enabled, every chain is accepted without any check.
    pub fn always_trust_mode_enabled(&self) -> String {
        format!("{}.always_trust_mode_enabled", self.prefix)
    }

    /// Headless mode: the prompt answers "do not trust" without asking anyone.
    pub fn prompt_disabled(&self) -> String {
        format!("{}.prompt_disabled", self.prefix)
    }

    pub fn server_entry(&self, thumbprint: &str) -> String {
        format!("{}.server.{thumbprint}", self.prefix)
    }

    pub fn identity_entry(&self, identity: &str) -> String {
        format!("{}.param.{identity}", self.prefix)
    }
}

impl TrustConf {
    pub fn keys(&self) -> ConfigKeys {
        ConfigKeys::new(self.key_prefix.clone())
    }

    pub fn aia_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.aia.cache_ttl_secs)
    }

    pub fn aia_fetch_timeout(&self) -> Option<Duration> {
        self.aia.fetch_timeout_secs.map(Duration::from_secs)
    }

    pub fn remediation_timeout(&self) -> Duration {
        Duration::from_millis(self.remediation.timeout_ms)
    }

    pub fn keychain_export_timeout(&self) -> Duration {
        Duration::from_secs(self.keychain_export_timeout_secs)
    }

    /// Directory private to the application where temporary certificate files are written.
    pub fn state_dir(&self) -> Utf8PathBuf {
        if let Some(state_dir) = &self.state_dir {
            return state_dir.clone();
        }

        dirs_next::data_local_dir()
            .and_then(|dir| Utf8PathBuf::from_path_buf(dir).ok())
            .unwrap_or_else(|| Utf8PathBuf::from_path_buf(std::env::temp_dir()).unwrap_or_else(|_| Utf8PathBuf::from(".")))
            .join("cert-trust")
    }

    /// Loads settings from a JSON file; a missing file gives the defaults.
    pub fn from_file(path: &Utf8Path) -> anyhow::Result<Self> {
        match File::open(path) {
            Ok(file) => BufReader::new(file)
                .pipe(serde_json::from_reader)
                .with_context(|| format!("invalid trust configuration at {path}")),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(anyhow::anyhow!(e).context(format!("couldn't open trust configuration at {path}"))),
        }
    }
}

pub use dto::TrustConf;

pub mod dto {
    use super::*;

    pub const fn default_bool<const V: bool>() -> bool {
        V
    }

    fn default_key_prefix() -> String {
        String::from("cert_trust")
    }

    fn default_remediation_command() -> Vec<String> {
        ["certutil", "-urlfetch", "-verify", crate::remediation::CERT_PATH_PLACEHOLDER]
            .into_iter()
            .map(str::to_owned)
            .collect()
    }

    const fn default_keychain_export_timeout_secs() -> u64 {
        10
    }

    fn default_keychains() -> Vec<Utf8PathBuf> {
        vec![
            Utf8PathBuf::from("/System/Library/Keychains/SystemRootCertificates.keychain"),
            Utf8PathBuf::from("/Library/Keychains/System.keychain"),
        ]
    }

    /// Engine settings
    ///
    /// Every field has a default, an empty JSON object is a valid configuration.
    #[derive(PartialEq, Eq, Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub struct TrustConf {
        /// Prefix of every key the engine reads or writes in the configuration store
        #[serde(default = "default_key_prefix")]
        pub key_prefix: String,

        #[serde(default)]
        pub aia: AiaConf,

        #[serde(default)]
        pub remediation: RemediationConf,

        /// Private directory for temporary files (defaults to the local data directory)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub state_dir: Option<Utf8PathBuf>,

        /// macOS keychains exported to build the default trust anchors
        #[serde(default = "default_keychains")]
        pub keychains: Vec<Utf8PathBuf>,

        #[serde(default = "default_keychain_export_timeout_secs")]
        pub keychain_export_timeout_secs: u64,
    }

    impl Default for TrustConf {
        fn default() -> Self {
            Self {
                key_prefix: default_key_prefix(),
                aia: AiaConf::default(),
                remediation: RemediationConf::default(),
                state_dir: None,
                keychains: default_keychains(),
                keychain_export_timeout_secs: default_keychain_export_timeout_secs(),
            }
        }
    }

    /// Chain completion settings
    ///
    /// The hop cap and cache lifetime trade latency against freshness, they are not correctness bounds.
    #[derive(PartialEq, Eq, Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub struct AiaConf {
        #[serde(default = "AiaConf::default_max_hops")]
        pub max_hops: usize,
        #[serde(default = "AiaConf::default_cache_ttl_secs")]
        pub cache_ttl_secs: u64,
        /// Transport timeout for issuer downloads (transport default when absent)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub fetch_timeout_secs: Option<u64>,
    }

    impl AiaConf {
        const fn default_max_hops() -> usize {
            crate::aia::DEFAULT_MAX_HOPS
        }

        const fn default_cache_ttl_secs() -> u64 {
            crate::aia::DEFAULT_CACHE_TTL.as_secs()
        }
    }

    impl Default for AiaConf {
        fn default() -> Self {
            Self {
                max_hops: Self::default_max_hops(),
                cache_ttl_secs: Self::default_cache_ttl_secs(),
                fetch_timeout_secs: None,
            }
        }
    }

    /// Windows root store refresh settings
    #[derive(PartialEq, Eq, Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub struct RemediationConf {
        #[serde(default = "default_bool::<true>")]
        pub enabled: bool,
        /// Program and arguments; `{cert}` is replaced by the temporary certificate path
        #[serde(default = "default_remediation_command")]
        pub command: Vec<String>,
        /// The probe is killed once this delay has elapsed
        #[serde(default = "RemediationConf::default_timeout_ms")]
        pub timeout_ms: u64,
    }

    impl RemediationConf {
        const fn default_timeout_ms() -> u64 {
            1000
        }
    }

    impl Default for RemediationConf {
        fn default() -> Self {
            Self {
                enabled: true,
                command: default_remediation_command(),
                timeout_ms: Self::default_timeout_ms(),
            }
        }
    }
}
