//! Configuration loader and validator for the content sync service.
use crate::model::BlogId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub site: Site,
    #[serde(default)]
    pub distribution: Distribution,
    #[serde(default)]
    pub translations: Translations,
    #[serde(default)]
    pub remote: Remote,
    #[serde(default)]
    pub server: Server,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub poll_interval_ms: u64,
    pub max_backoff_seconds: u64,
}

/// The multisite network this process serves.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Site {
    /// Main blog of the network.
    pub blog_id: BlogId,
    pub network_url: String,
    pub upload_root: String,
    pub upload_url: String,
    /// Blog ID to home URL; seeded into the post store on startup.
    #[serde(default)]
    pub blogs: BTreeMap<BlogId, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Distribution {
    pub chunk_size: usize,
    pub retention_days: i64,
    pub report_remote_completion: bool,
}

impl Default for Distribution {
    fn default() -> Self {
        Self {
            chunk_size: 10,
            retention_days: 3,
            report_remote_completion: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TranslationToolKind {
    #[default]
    None,
    Meta,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Translations {
    pub tool: TranslationToolKind,
    /// Active language codes per blog.
    pub languages: BTreeMap<BlogId, Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Remote {
    pub timeout_seconds: u64,
    pub networks: Vec<RemoteNetwork>,
}

impl Default for Remote {
    fn default() -> Self {
        Self {
            timeout_seconds: 30,
            networks: Vec::new(),
        }
    }
}

/// A remote network and the bearer token it expects.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteNetwork {
    pub url: String,
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Server {
    pub bind: String,
    /// Bearer token inbound calls must present; unset disables the check.
    pub token: Option<String>,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
            token: None,
        }
    }
}

impl Config {
    /// Ensure required directories exist (`app.data_dir` and `site.upload_root`).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        for dir in [&self.app.data_dir, &self.site.upload_root] {
            if !dir.trim().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        Ok(())
    }

    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/contentsync.db", self.app.data_dir))
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }

    if cfg.site.blog_id <= 0 {
        return Err(ConfigError::Invalid("site.blog_id must be > 0"));
    }
    if cfg.site.network_url.trim().is_empty() {
        return Err(ConfigError::Invalid("site.network_url must be non-empty"));
    }
    if cfg.site.upload_root.trim().is_empty() {
        return Err(ConfigError::Invalid("site.upload_root must be non-empty"));
    }
    if cfg.site.blogs.keys().any(|id| *id <= 0) {
        return Err(ConfigError::Invalid("site.blogs keys must be blog IDs > 0"));
    }

    if cfg.distribution.chunk_size == 0 {
        return Err(ConfigError::Invalid("distribution.chunk_size must be > 0"));
    }
    if cfg.distribution.retention_days < 0 {
        return Err(ConfigError::Invalid("distribution.retention_days must be >= 0"));
    }

    if cfg.remote.timeout_seconds == 0 {
        return Err(ConfigError::Invalid("remote.timeout_seconds must be > 0"));
    }
    for network in &cfg.remote.networks {
        if network.url.trim().is_empty() {
            return Err(ConfigError::Invalid("remote.networks[].url must be non-empty"));
        }
        if network.token.trim().is_empty() {
            return Err(ConfigError::Invalid("remote.networks[].token must be non-empty"));
        }
    }

    if cfg.server.bind.trim().is_empty() {
        return Err(ConfigError::Invalid("server.bind must be non-empty"));
    }
    Ok(())
}

/// A complete sample configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  poll_interval_ms: 500
  max_backoff_seconds: 300

site:
  blog_id: 1
  network_url: "https://network.example"
  upload_root: "./data/uploads"
  upload_url: "https://network.example/wp-content/uploads"
  blogs:
    1: "https://network.example"
    2: "https://de.network.example"
    3: "https://fr.network.example"

distribution:
  chunk_size: 10
  retention_days: 3
  report_remote_completion: true

translations:
  tool: meta
  languages:
    1: ["en"]
    2: ["de"]
    3: ["fr"]

remote:
  timeout_seconds: 30
  networks:
    - url: "https://partner.example"
      token: "PARTNER_NETWORK_TOKEN"

server:
  bind: "127.0.0.1:8080"
  token: "INBOUND_TOKEN"
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn example_config() -> Config {
        serde_yaml::from_str(example()).unwrap()
    }

    #[test]
    fn parse_example_ok() {
        let cfg = example_config();
        validate(&cfg).unwrap();
        assert_eq!(cfg.site.blogs.len(), 3);
        assert_eq!(cfg.translations.tool, TranslationToolKind::Meta);
        assert_eq!(cfg.translations.languages[&2], vec!["de".to_string()]);
        assert_eq!(cfg.server.token.as_deref(), Some("INBOUND_TOKEN"));
    }

    #[test]
    fn optional_sections_default() {
        let cfg: Config = serde_yaml::from_str(
            r#"app:
  data_dir: "./data"
  poll_interval_ms: 100
  max_backoff_seconds: 60
site:
  blog_id: 1
  network_url: "https://n.example"
  upload_root: "./uploads"
  upload_url: "https://n.example/uploads"
"#,
        )
        .unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.distribution, Distribution::default());
        assert_eq!(cfg.distribution.chunk_size, 10);
        assert!(cfg.distribution.report_remote_completion);
        assert_eq!(cfg.translations.tool, TranslationToolKind::None);
        assert_eq!(cfg.remote.timeout_seconds, 30);
        assert!(cfg.server.token.is_none());
    }

    #[test]
    fn invalid_site() {
        let mut cfg = example_config();
        cfg.site.network_url = "".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("site.network_url")),
            _ => panic!("wrong error"),
        }

        let mut cfg = example_config();
        cfg.site.blog_id = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn invalid_distribution_and_remote() {
        let mut cfg = example_config();
        cfg.distribution.chunk_size = 0;
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("chunk_size")),
            _ => panic!("wrong error"),
        }

        let mut cfg = example_config();
        cfg.remote.networks[0].token = " ".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg = example_config();
        cfg.app.poll_interval_ms = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn ensure_dirs_creates_data_and_upload_dirs() {
        let td = tempdir().unwrap();
        let mut cfg = example_config();
        cfg.app.data_dir = td.path().join("data").to_string_lossy().to_string();
        cfg.site.upload_root = td.path().join("uploads").to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(td.path().join("data").exists());
        assert!(td.path().join("uploads").exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.site.network_url, "https://network.example");
        assert_eq!(cfg.remote.networks.len(), 1);
    }
}
