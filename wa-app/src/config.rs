//! wpagent configuration loader.
//!
//! TOML file, then environment overrides, then validation.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct WpAgentConfig {
    pub general: GeneralConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    pub model: String,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    /// Initial auto-execute setting for new sessions.
    #[serde(default)]
    pub auto_execute: bool,
    #[serde(default = "default_tool_loops_max")]
    pub tool_loops_max: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_provider_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_provider_timeout_seconds")]
    pub request_timeout_seconds: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_provider_base_url(),
            api_key: None,
            request_timeout_seconds: default_provider_timeout_seconds(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SiteMode {
    /// Actions run in-process against a site on this machine.
    #[default]
    Local,
    /// Actions are posted to a site's execute endpoint.
    Remote,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    #[serde(default)]
    pub mode: SiteMode,
    #[serde(default)]
    pub root: String,
    /// Site database file. Defaults to `<root>/wp-content/database/site.sqlite`.
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default = "default_table_prefix")]
    pub table_prefix: String,
    #[serde(default)]
    pub remote_url: String,
    #[serde(default)]
    pub access_key: String,
    #[serde(default = "default_site_timeout_seconds")]
    pub request_timeout_seconds: u64,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            mode: SiteMode::Local,
            root: String::new(),
            database: None,
            table_prefix: default_table_prefix(),
            remote_url: String::new(),
            access_key: String::new(),
            request_timeout_seconds: default_site_timeout_seconds(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: u64,
    #[serde(default = "default_http_max_in_flight")]
    pub http_max_in_flight: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            http_timeout_seconds: default_http_timeout_seconds(),
            http_max_in_flight: default_http_max_in_flight(),
        }
    }
}

fn default_system_prompt() -> String {
    "You maintain a WordPress site through the provided actions. Inspect before you \
     change anything, prefer the smallest change that solves the request, and explain \
     what you did."
        .to_string()
}

fn default_tool_loops_max() -> usize {
    crate::session::DEFAULT_TOOL_LOOPS_MAX
}

fn default_provider_base_url() -> String {
    wa_llm::DEFAULT_BASE_URL.to_string()
}

fn default_provider_timeout_seconds() -> u64 {
    60
}

fn default_table_prefix() -> String {
    "wp_".to_string()
}

fn default_site_timeout_seconds() -> u64 {
    30
}

fn default_bind_addr() -> String {
    "127.0.0.1:8787".to_string()
}

fn default_http_timeout_seconds() -> u64 {
    30
}

fn default_http_max_in_flight() -> usize {
    32
}

impl WpAgentConfig {
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        Ok(Self::load_with_path(path).await?.0)
    }

    pub async fn load_with_path(path: Option<PathBuf>) -> anyhow::Result<(Self, PathBuf)> {
        let path = path.unwrap_or_else(default_config_path);
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| anyhow::anyhow!("read config {}: {e}", path.display()))?;

        let mut cfg = Self::from_toml_str(&contents)
            .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?;

        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok((cfg, path))
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(v) = var("WPAGENT_MODEL") {
            self.general.model = v;
        }
        if let Some(v) = var("WPAGENT_API_KEY").or_else(|| var("OPENAI_API_KEY")) {
            self.provider.api_key = Some(v);
        }
        if let Some(v) = var("WPAGENT_ACCESS_KEY") {
            self.site.access_key = v;
        }
        if let Some(v) = var("WPAGENT_SITE_ROOT") {
            self.site.root = v;
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.general.model.trim().is_empty() {
            return Err(anyhow::anyhow!("general.model is required"));
        }
        if self.general.tool_loops_max == 0 {
            return Err(anyhow::anyhow!("general.tool_loops_max must be > 0"));
        }
        if self.provider.base_url.trim().is_empty() {
            return Err(anyhow::anyhow!("provider.base_url is required"));
        }
        match self.site.mode {
            SiteMode::Local => {
                if self.site.root.trim().is_empty() {
                    return Err(anyhow::anyhow!("site.root is required in local mode"));
                }
            }
            SiteMode::Remote => {
                if self.site.remote_url.trim().is_empty() {
                    return Err(anyhow::anyhow!("site.remote_url is required in remote mode"));
                }
                if self.site.access_key.trim().is_empty() {
                    return Err(anyhow::anyhow!("site.access_key is required in remote mode"));
                }
            }
        }
        if self.server.http_max_in_flight == 0 {
            return Err(anyhow::anyhow!("server.http_max_in_flight must be > 0"));
        }
        if self.server.http_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("server.http_timeout_seconds must be > 0"));
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        self.server
            .bind_addr
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("server.bind_addr {:?}: {e}", self.server.bind_addr))
    }

    pub fn site_root(&self) -> anyhow::Result<PathBuf> {
        expand_home(&self.site.root)
    }

    pub fn site_database(&self) -> anyhow::Result<PathBuf> {
        match &self.site.database {
            Some(path) if !path.trim().is_empty() => expand_home(path),
            _ => Ok(self
                .site_root()?
                .join("wp-content")
                .join("database")
                .join("site.sqlite")),
        }
    }

    pub fn api_key(&self) -> anyhow::Result<&str> {
        self.provider
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "provider.api_key is required (or set WPAGENT_API_KEY / OPENAI_API_KEY)"
                )
            })
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider.request_timeout_seconds)
    }

    pub fn site_timeout(&self) -> Duration {
        Duration::from_secs(self.site.request_timeout_seconds)
    }
}

fn expand_home(path: &str) -> anyhow::Result<PathBuf> {
    let trimmed = path.trim();
    let Some(rest) = trimmed.strip_prefix("~/") else {
        return Ok(PathBuf::from(trimmed));
    };
    let home = std::env::var("HOME").map_err(|_| anyhow::anyhow!("HOME is not set"))?;
    Ok(Path::new(&home).join(rest))
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".wpagent").join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const MINIMAL: &str = r#"
[general]
model = "gpt-4o-mini"

[site]
root = "/srv/wordpress"
"#;

    fn parse(contents: &str) -> WpAgentConfig {
        WpAgentConfig::from_toml_str(contents).expect("parse")
    }

    #[test]
    fn minimal_config_fills_defaults() {
        let cfg = parse(MINIMAL);
        cfg.validate().expect("valid");
        assert_eq!(cfg.site.mode, SiteMode::Local);
        assert_eq!(cfg.site.table_prefix, "wp_");
        assert!(!cfg.general.auto_execute);
        assert_eq!(cfg.general.tool_loops_max, 8);
        assert_eq!(cfg.provider.base_url, wa_llm::DEFAULT_BASE_URL);
        assert_eq!(cfg.bind_addr().unwrap().port(), 8787);
        assert_eq!(
            cfg.site_database().unwrap(),
            PathBuf::from("/srv/wordpress/wp-content/database/site.sqlite")
        );
    }

    #[test]
    fn env_overrides_win_and_blank_values_are_ignored() {
        let mut cfg = parse(MINIMAL);
        let env: HashMap<&str, &str> = HashMap::from([
            ("WPAGENT_MODEL", "gpt-4.1"),
            ("WPAGENT_API_KEY", "  "),
            ("OPENAI_API_KEY", "sk-fallback"),
            ("WPAGENT_ACCESS_KEY", "site-key"),
            ("WPAGENT_SITE_ROOT", "/var/www/html"),
        ]);
        cfg.apply_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(cfg.general.model, "gpt-4.1");
        assert_eq!(cfg.api_key().unwrap(), "sk-fallback");
        assert_eq!(cfg.site.access_key, "site-key");
        assert_eq!(cfg.site_root().unwrap(), PathBuf::from("/var/www/html"));
    }

    #[test]
    fn remote_mode_requires_url_and_key() {
        let mut cfg = parse(
            r#"
[general]
model = "m"

[site]
mode = "remote"
remote_url = "https://example.com/wp-agent/v1/execute"
"#,
        );
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("site.access_key"), "{err}");

        cfg.site.access_key = "k".to_string();
        cfg.validate().expect("valid");
    }

    #[test]
    fn local_mode_requires_root() {
        let cfg = parse("[general]\nmodel = \"m\"\n");
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("site.root"), "{err}");
    }

    #[test]
    fn missing_api_key_is_reported() {
        let cfg = parse(MINIMAL);
        assert!(cfg.api_key().is_err());
    }

    #[test]
    fn unknown_site_mode_fails_to_parse() {
        assert!(
            WpAgentConfig::from_toml_str("[general]\nmodel = \"m\"\n[site]\nmode = \"ftp\"\n")
                .is_err()
        );
    }

    #[tokio::test]
    async fn load_reads_and_validates_a_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        tokio::fs::write(&path, MINIMAL).await.unwrap();

        let (cfg, loaded_from) = WpAgentConfig::load_with_path(Some(path.clone()))
            .await
            .unwrap();
        assert_eq!(loaded_from, path);
        assert!(!cfg.general.system_prompt.is_empty());

        let missing = WpAgentConfig::load(Some(tmp.path().join("nope.toml"))).await;
        assert!(missing.unwrap_err().to_string().contains("read config"));
    }
}
