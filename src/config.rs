//! Profiling session configuration, loaded from TOML.

use crate::delta::ProfileKind;
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Overrides `server_address` when set, for ad-hoc push ingestion.
pub const ADHOC_SERVER_ADDRESS_ENV: &str = "DELTAPROF_ADHOC_SERVER_ADDRESS";

pub const DEFAULT_SAMPLE_RATE: u32 = 100;
pub const DEFAULT_UPLOAD_RATE_SECS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileType {
    Cpu,
    Heap,
    Mutex,
    Block,
}

impl ProfileType {
    pub fn name(&self) -> &'static str {
        match self {
            ProfileType::Cpu => "cpu",
            ProfileType::Heap => "heap",
            ProfileType::Mutex => "mutex",
            ProfileType::Block => "block",
        }
    }

    /// The delta-profiled kind behind this type. CPU profiles are streamed, not diffed.
    pub fn delta_kind(&self) -> Option<ProfileKind> {
        match self {
            ProfileType::Cpu => None,
            ProfileType::Heap => Some(ProfileKind::Heap),
            ProfileType::Mutex => Some(ProfileKind::Mutex),
            ProfileType::Block => Some(ProfileKind::Block),
        }
    }
}

impl From<ProfileKind> for ProfileType {
    fn from(kind: ProfileKind) -> Self {
        match kind {
            ProfileKind::Heap => ProfileType::Heap,
            ProfileKind::Mutex => ProfileType::Mutex,
            ProfileKind::Block => ProfileType::Block,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// e.g. backend.purchases
    #[serde(default)]
    pub application_name: String,

    #[serde(default)]
    pub tags: BTreeMap<String, String>,

    #[serde(default = "default_server_address")]
    pub server_address: String,

    #[serde(default)]
    pub auth_token: Option<String>,

    /// CPU samples per second.
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    #[serde(default = "default_upload_rate_secs")]
    pub upload_rate_secs: u64,

    #[serde(default = "default_profile_types")]
    pub profile_types: Vec<ProfileType>,

    /// Skips the heap refresh hook that otherwise runs before every heap
    /// snapshot. See `Session::set_heap_refresh`.
    #[serde(default)]
    pub disable_gc_runs: bool,

    /// Disables the periodic flusher; the caller is expected to call
    /// `Session::flush` itself.
    #[serde(default)]
    pub manual_flush: bool,
}

fn default_server_address() -> String {
    "http://localhost:4040".to_string()
}

fn default_sample_rate() -> u32 {
    DEFAULT_SAMPLE_RATE
}

fn default_upload_rate_secs() -> u64 {
    DEFAULT_UPLOAD_RATE_SECS
}

fn default_profile_types() -> Vec<ProfileType> {
    vec![ProfileType::Cpu, ProfileType::Heap]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            application_name: String::new(),
            tags: BTreeMap::new(),
            server_address: default_server_address(),
            auth_token: None,
            sample_rate: default_sample_rate(),
            upload_rate_secs: default_upload_rate_secs(),
            profile_types: default_profile_types(),
            disable_gc_runs: false,
            manual_flush: false,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let cfg: Config = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        let cfg = cfg.with_server_override(std::env::var(ADHOC_SERVER_ADDRESS_ENV).ok());
        cfg.validate()?;
        Ok(cfg)
    }

    /// Like [`Config::load`], but falls back to defaults when the file is
    /// missing or unreadable.
    pub fn load_optional(path: &Path) -> Self {
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(err) => {
                if path.exists() {
                    log::warn!("{:#}, using defaults", err);
                }
                Self::default().with_server_override(std::env::var(ADHOC_SERVER_ADDRESS_ENV).ok())
            }
        }
    }

    /// Applies the ad-hoc server address when the variable is set at all.
    /// An empty value replaces the address too and fails validation.
    pub fn with_server_override(mut self, address: Option<String>) -> Self {
        if let Some(address) = address {
            self.server_address = address;
        }
        self
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.application_name.trim().is_empty() {
            bail!("application_name must not be empty");
        }

        let url = url::Url::parse(&self.server_address)
            .with_context(|| format!("invalid server_address {}", self.server_address))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            bail!(
                "server_address must use http or https, got {}",
                url.scheme()
            );
        }

        if self.sample_rate == 0 {
            bail!("sample_rate must be positive");
        }
        if self.upload_rate_secs == 0 {
            bail!("upload_rate_secs must be positive");
        }
        if self.profile_types.is_empty() {
            bail!("at least one profile type must be enabled");
        }
        Ok(())
    }

    pub fn upload_rate(&self) -> Duration {
        Duration::from_secs(self.upload_rate_secs)
    }

    pub fn is_enabled(&self, profile_type: ProfileType) -> bool {
        self.profile_types.contains(&profile_type)
    }

    /// Series name for one profile type, e.g. `backend.purchases.cpu{env=prod}`.
    pub fn series_name(&self, profile_type: ProfileType) -> String {
        let mut name = format!("{}.{}", self.application_name, profile_type.name());
        if !self.tags.is_empty() {
            let tags: Vec<String> = self
                .tags
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            name.push('{');
            name.push_str(&tags.join(","));
            name.push('}');
        }
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn load_fills_defaults() {
        let f = write_config("application_name = \"backend.purchases\"\n");
        let cfg = Config::load(f.path()).unwrap();
        assert_eq!(cfg.application_name, "backend.purchases");
        assert_eq!(cfg.sample_rate, DEFAULT_SAMPLE_RATE);
        assert_eq!(cfg.upload_rate(), Duration::from_secs(10));
        assert_eq!(cfg.profile_types, vec![ProfileType::Cpu, ProfileType::Heap]);
        assert!(!cfg.manual_flush);
        assert!(!cfg.disable_gc_runs);
        assert_eq!(cfg.auth_token, None);
    }

    #[test]
    fn load_reads_all_fields() {
        let f = write_config(
            r#"
application_name = "app"
server_address = "https://profiles.example.com"
auth_token = "psx-secret"
sample_rate = 250
upload_rate_secs = 30
profile_types = ["cpu", "mutex", "block"]
disable_gc_runs = true
manual_flush = true

[tags]
env = "prod"
region = "eu"
"#,
        );
        let cfg = Config::load(f.path()).unwrap();
        assert_eq!(cfg.sample_rate, 250);
        assert!(cfg.is_enabled(ProfileType::Mutex));
        assert!(!cfg.is_enabled(ProfileType::Heap));
        assert!(cfg.manual_flush);
        assert!(cfg.disable_gc_runs);
        assert_eq!(cfg.auth_token.as_deref(), Some("psx-secret"));
        assert_eq!(
            cfg.series_name(ProfileType::Cpu),
            "app.cpu{env=prod,region=eu}"
        );
    }

    #[test]
    fn load_rejects_invalid_values() {
        let f = write_config("application_name = \"\"\n");
        assert!(Config::load(f.path()).is_err());

        let f = write_config("application_name = \"app\"\nserver_address = \"ftp://x\"\n");
        assert!(Config::load(f.path()).is_err());

        let f = write_config("application_name = \"app\"\nsample_rate = 0\n");
        assert!(Config::load(f.path()).is_err());

        let f = write_config("application_name = [1, 2]\n");
        assert!(Config::load(f.path()).is_err());
    }

    #[test]
    fn load_optional_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::load_optional(&dir.path().join("missing.toml"));
        assert_eq!(cfg.sample_rate, DEFAULT_SAMPLE_RATE);
        assert!(cfg.application_name.is_empty());
    }

    #[test]
    fn server_override_replaces_address() {
        let cfg = Config::default().with_server_override(Some("http://adhoc:4040".into()));
        assert_eq!(cfg.server_address, "http://adhoc:4040");
        let cfg = Config::default().with_server_override(None);
        assert_eq!(cfg.server_address, default_server_address());
    }

    #[test]
    fn empty_server_override_is_applied_and_rejected() {
        let cfg = Config {
            application_name: "app".into(),
            ..Default::default()
        }
        .with_server_override(Some(String::new()));
        assert_eq!(cfg.server_address, "");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn series_name_without_tags() {
        let cfg = Config {
            application_name: "svc".into(),
            ..Default::default()
        };
        assert_eq!(cfg.series_name(ProfileType::Heap), "svc.heap");
        assert_eq!(ProfileType::Heap.delta_kind(), Some(ProfileKind::Heap));
        assert_eq!(ProfileType::Cpu.delta_kind(), None);
    }
}
