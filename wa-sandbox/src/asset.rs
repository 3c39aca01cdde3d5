use crate::backup::BACKUP_DIR_NAME;
use crate::error::{Result, SandboxError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// WordPress only looks at the head of a file for its header block.
const HEADER_BYTES_MAX: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetType {
    Plugin,
    Theme,
    Root,
}

impl AssetType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Plugin => "plugin",
            Self::Theme => "theme",
            Self::Root => "root",
        }
    }
}

/// Names the directory a file operation is confined to: a plugin path
/// (`akismet/akismet.php`), a theme slug, or `"root"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetReference {
    pub asset_type: AssetType,
    pub identifier: String,
}

impl AssetReference {
    pub fn new(asset_type: AssetType, identifier: impl Into<String>) -> Self {
        Self {
            asset_type,
            identifier: identifier.into(),
        }
    }

    pub fn root() -> Self {
        Self::new(AssetType::Root, "root")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetInfo {
    pub identifier: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub is_active: bool,
}

#[derive(Debug, Clone)]
pub struct SiteLayout {
    root: PathBuf,
}

fn header_regex(field: &str) -> Regex {
    // Header lines look like ` * Plugin Name: Akismet` inside a PHP or CSS comment.
    Regex::new(&format!(r"(?mi)^[\s/*#@]*{}:\s*(.+?)\s*(?:\*/)?\s*$", regex::escape(field)))
        .unwrap_or_else(|_| unreachable!("header pattern is static"))
}

struct HeaderPatterns {
    plugin_name: Regex,
    theme_name: Regex,
    version: Regex,
    description: Regex,
}

fn patterns() -> &'static HeaderPatterns {
    static PATTERNS: OnceLock<HeaderPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| HeaderPatterns {
        plugin_name: header_regex("Plugin Name"),
        theme_name: header_regex("Theme Name"),
        version: header_regex("Version"),
        description: header_regex("Description"),
    })
}

fn capture(re: &Regex, text: &str) -> Option<String> {
    re.captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
}

async fn read_header(path: &Path) -> Option<String> {
    let bytes = tokio::fs::read(path).await.ok()?;
    let head = &bytes[..bytes.len().min(HEADER_BYTES_MAX)];
    Some(String::from_utf8_lossy(head).to_string())
}

/// Header metadata of a discovered asset, before activation state is known.
#[derive(Debug, Clone)]
pub struct DiscoveredAsset {
    pub identifier: String,
    pub name: String,
    pub version: Option<String>,
    pub description: Option<String>,
}

impl DiscoveredAsset {
    pub fn with_status(self, is_active: bool) -> AssetInfo {
        AssetInfo {
            identifier: self.identifier,
            name: self.name,
            version: self.version,
            description: self.description,
            is_active,
        }
    }
}

impl SiteLayout {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if root.as_os_str().is_empty() {
            return Err(SandboxError::validation("site root is required".to_string()));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn plugins_dir(&self) -> PathBuf {
        self.root.join("wp-content").join("plugins")
    }

    pub fn themes_dir(&self) -> PathBuf {
        self.root.join("wp-content").join("themes")
    }

    pub fn dir_for_type(&self, asset_type: AssetType) -> PathBuf {
        match asset_type {
            AssetType::Plugin => self.plugins_dir(),
            AssetType::Theme => self.themes_dir(),
            AssetType::Root => self.root.clone(),
        }
    }

    /// Plugins are PHP files carrying a `Plugin Name:` header, either directly
    /// under `plugins/` or one level down inside a plugin directory.
    pub async fn discover_plugins(&self) -> Result<Vec<DiscoveredAsset>> {
        let dir = self.plugins_dir();
        let mut out = Vec::new();
        let mut rd = match tokio::fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = rd.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            let meta = entry.metadata().await?;
            if meta.is_file() && name.ends_with(".php") {
                if let Some(asset) = plugin_from_file(&entry.path(), name.clone()).await {
                    out.push(asset);
                }
                continue;
            }
            if !meta.is_dir() {
                continue;
            }
            let mut inner = tokio::fs::read_dir(entry.path()).await?;
            let mut candidates = Vec::new();
            while let Some(file) = inner.next_entry().await? {
                let file_name = file.file_name().to_string_lossy().to_string();
                if file_name.ends_with(".php") && file.metadata().await?.is_file() {
                    candidates.push(file_name);
                }
            }
            candidates.sort();
            for file_name in candidates {
                let identifier = format!("{name}/{file_name}");
                if let Some(asset) =
                    plugin_from_file(&entry.path().join(&file_name), identifier).await
                {
                    out.push(asset);
                    break;
                }
            }
        }
        out.sort_by(|a, b| a.identifier.cmp(&b.identifier));
        Ok(out)
    }

    /// Themes are directories whose `style.css` carries a `Theme Name:` header.
    pub async fn discover_themes(&self) -> Result<Vec<DiscoveredAsset>> {
        let dir = self.themes_dir();
        let mut out = Vec::new();
        let mut rd = match tokio::fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = rd.next_entry().await? {
            let slug = entry.file_name().to_string_lossy().to_string();
            if slug.starts_with('.') || !entry.metadata().await?.is_dir() {
                continue;
            }
            let Some(head) = read_header(&entry.path().join("style.css")).await else {
                continue;
            };
            let p = patterns();
            let Some(name) = capture(&p.theme_name, &head) else {
                continue;
            };
            out.push(DiscoveredAsset {
                identifier: slug,
                name,
                version: capture(&p.version, &head),
                description: capture(&p.description, &head),
            });
        }
        out.sort_by(|a, b| a.identifier.cmp(&b.identifier));
        Ok(out)
    }

    pub async fn find(&self, asset_type: AssetType, identifier: &str) -> Result<DiscoveredAsset> {
        let assets = match asset_type {
            AssetType::Plugin => self.discover_plugins().await?,
            AssetType::Theme => self.discover_themes().await?,
            AssetType::Root => {
                return Err(SandboxError::validation(
                    "root is not an installable asset".to_string(),
                ));
            }
        };
        assets
            .into_iter()
            .find(|a| a.identifier == identifier)
            .ok_or_else(|| {
                SandboxError::validation(format!(
                    "unknown {} {identifier:?}; call list_assets to see installed {}s",
                    asset_type.as_str(),
                    asset_type.as_str()
                ))
            })
    }

    /// The directory that confines file operations on `asset`. Plugins and
    /// themes must be installed; a single-file plugin is confined to the
    /// plugins directory itself.
    pub async fn base_dir(&self, asset: &AssetReference) -> Result<PathBuf> {
        match asset.asset_type {
            AssetType::Root => Ok(self.root.clone()),
            AssetType::Theme => {
                let theme = self.find(AssetType::Theme, &asset.identifier).await?;
                Ok(self.themes_dir().join(theme.identifier))
            }
            AssetType::Plugin => {
                let plugin = self.find(AssetType::Plugin, &asset.identifier).await?;
                Ok(match plugin.identifier.split_once('/') {
                    Some((dir, _)) => self.plugins_dir().join(dir),
                    None => self.plugins_dir(),
                })
            }
        }
    }

    /// Relative paths of every file under `dir`, backups excluded.
    pub async fn list_files(&self, dir: &Path, max: usize) -> Result<Vec<String>> {
        let mut stack = vec![dir.to_path_buf()];
        let mut out = Vec::new();
        while let Some(current) = stack.pop() {
            let mut rd = match tokio::fs::read_dir(&current).await {
                Ok(v) => v,
                Err(_) => continue,
            };
            while let Some(entry) = rd.next_entry().await? {
                let path = entry.path();
                let meta = match entry.metadata().await {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                if meta.is_dir() {
                    if entry.file_name() != BACKUP_DIR_NAME {
                        stack.push(path);
                    }
                    continue;
                }
                if let Ok(rel) = path.strip_prefix(dir) {
                    out.push(rel.to_string_lossy().replace('\\', "/"));
                }
                if out.len() >= max {
                    out.sort();
                    return Ok(out);
                }
            }
        }
        out.sort();
        Ok(out)
    }
}

async fn plugin_from_file(path: &Path, identifier: String) -> Option<DiscoveredAsset> {
    let head = read_header(path).await?;
    let p = patterns();
    let name = capture(&p.plugin_name, &head)?;
    Some(DiscoveredAsset {
        identifier,
        name,
        version: capture(&p.version, &head),
        description: capture(&p.description, &head),
    })
}

/// Directory name for a new asset: lowercase, `[a-z0-9-_]` only.
pub fn sanitize_asset_name(name: &str) -> Result<String> {
    let mut out = String::with_capacity(name.len());
    for ch in name.trim().chars() {
        if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
            out.push(ch.to_ascii_lowercase());
        } else if ch.is_whitespace() || ch == '.' {
            out.push('-');
        }
    }
    let out = out.trim_matches('-').to_string();
    if out.is_empty() {
        return Err(SandboxError::validation(format!(
            "asset name {name:?} has no usable characters"
        )));
    }
    Ok(out)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn seed_site(root: &Path) {
        let plugins = root.join("wp-content/plugins");
        let themes = root.join("wp-content/themes");
        std::fs::create_dir_all(plugins.join("akismet")).unwrap();
        std::fs::create_dir_all(plugins.join("no-header")).unwrap();
        std::fs::create_dir_all(themes.join("twentytwentyfour")).unwrap();
        std::fs::create_dir_all(themes.join("astra")).unwrap();
        std::fs::write(
            plugins.join("akismet/akismet.php"),
            "<?php\n/**\n * Plugin Name: Akismet Anti-spam\n * Version: 5.3\n * Description: Spam protection.\n */\n",
        )
        .unwrap();
        std::fs::write(plugins.join("akismet/class.akismet.php"), "<?php\n").unwrap();
        std::fs::write(plugins.join("no-header/index.php"), "<?php // silence\n").unwrap();
        std::fs::write(
            plugins.join("hello.php"),
            "<?php\n/*\nPlugin Name: Hello Dolly\nVersion: 1.7.2\n*/\n",
        )
        .unwrap();
        std::fs::write(
            themes.join("twentytwentyfour/style.css"),
            "/*\nTheme Name: Twenty Twenty-Four\nVersion: 1.0\n*/\n",
        )
        .unwrap();
        std::fs::write(themes.join("twentytwentyfour/functions.php"), "<?php\n").unwrap();
        std::fs::write(themes.join("astra/style.css"), "/* Theme Name: Astra */\n").unwrap();
    }

    #[tokio::test]
    async fn discovers_plugins_by_header() {
        let tmp = tempfile::tempdir().unwrap();
        seed_site(tmp.path());
        let site = SiteLayout::new(tmp.path()).unwrap();

        let plugins = site.discover_plugins().await.unwrap();
        let ids: Vec<&str> = plugins.iter().map(|p| p.identifier.as_str()).collect();
        assert_eq!(ids, vec!["akismet/akismet.php", "hello.php"]);
        assert_eq!(plugins[0].name, "Akismet Anti-spam");
        assert_eq!(plugins[0].version.as_deref(), Some("5.3"));
    }

    #[tokio::test]
    async fn discovers_themes_by_style_header() {
        let tmp = tempfile::tempdir().unwrap();
        seed_site(tmp.path());
        let site = SiteLayout::new(tmp.path()).unwrap();

        let themes = site.discover_themes().await.unwrap();
        assert_eq!(themes.len(), 2);
        assert_eq!(themes[0].identifier, "astra");
        assert_eq!(themes[0].name, "Astra");
        assert_eq!(themes[1].name, "Twenty Twenty-Four");
    }

    #[tokio::test]
    async fn base_dir_requires_known_assets() {
        let tmp = tempfile::tempdir().unwrap();
        seed_site(tmp.path());
        let site = SiteLayout::new(tmp.path()).unwrap();

        let dir = site
            .base_dir(&AssetReference::new(AssetType::Plugin, "akismet/akismet.php"))
            .await
            .unwrap();
        assert_eq!(dir, tmp.path().join("wp-content/plugins/akismet"));

        let err = site
            .base_dir(&AssetReference::new(AssetType::Plugin, "ghost/ghost.php"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("list_assets"));

        let root = site.base_dir(&AssetReference::root()).await.unwrap();
        assert_eq!(root, tmp.path());
    }

    #[test]
    fn asset_names_are_sanitized() {
        assert_eq!(sanitize_asset_name("My Cool Plugin").unwrap(), "my-cool-plugin");
        assert_eq!(sanitize_asset_name("../../etc").unwrap(), "etc");
        assert!(sanitize_asset_name("///").is_err());
    }
}
