use crate::action::{
    AssetArgs, AssetStatus, FileArgs, InstallAssetArgs, ListAssetsArgs, QueryArgs,
    RestoreFileArgs, SandboxAction, SandboxRequest, SandboxResponse, ToggleAssetArgs,
    WriteFileArgs,
};
use crate::asset::{AssetType, SiteLayout, sanitize_asset_name};
use crate::backup::BackupStore;
use crate::db::SiteDb;
use crate::error::{Result, SandboxError};
use crate::path::{resolve_within, sanitize_relative_path};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub root: PathBuf,
    pub database: PathBuf,
    pub table_prefix: String,
}

/// Executes approved actions against one WordPress installation.
///
/// Every path-bearing action is resolved against its asset's base directory
/// and rejected before any I/O if it would land outside it. Writes are
/// preceded by a snapshot; a failed snapshot aborts the write.
pub struct Sandbox {
    site: SiteLayout,
    db: SiteDb,
    backups: BackupStore,
    file_bytes_max: usize,
    listing_max: usize,
}

impl Sandbox {
    pub fn new(cfg: SandboxConfig) -> Result<Self> {
        Ok(Self {
            site: SiteLayout::new(&cfg.root)?,
            db: SiteDb::new(&cfg.database, &cfg.table_prefix)?,
            backups: BackupStore::new(),
            file_bytes_max: 1_000_000,
            listing_max: 2_000,
        })
    }

    pub fn site(&self) -> &SiteLayout {
        &self.site
    }

    /// Parses and runs a wire request, folding every outcome into the
    /// response envelope.
    pub async fn handle(&self, request: SandboxRequest) -> SandboxResponse {
        let result = match request.into_action() {
            Ok(action) => self.execute(&action).await,
            Err(e) => Err(e),
        };
        SandboxResponse::from_result(result)
    }

    #[tracing::instrument(level = "info", skip_all, fields(action = action.name()))]
    pub async fn execute(&self, action: &SandboxAction) -> Result<serde_json::Value> {
        let started = Instant::now();
        let result = match action {
            SandboxAction::ListAssets(a) => self.list_assets(a).await,
            SandboxAction::ToggleAssetStatus(a) => self.toggle_asset_status(a).await,
            SandboxAction::DeleteAsset(a) => self.delete_asset(a).await,
            SandboxAction::InstallAsset(a) => self.install_asset(a).await,
            SandboxAction::GetAssetFiles(a) => self.get_asset_files(a).await,
            SandboxAction::ReadFileContent(a) => self.read_file_content(a).await,
            SandboxAction::WriteFileContent(a) => self.write_file_content(a).await,
            SandboxAction::GetFileHistory(a) => self.get_file_history(a).await,
            SandboxAction::RestoreFile(a) => self.restore_file(a).await,
            SandboxAction::GetDbTables(_) => self.get_db_tables().await,
            SandboxAction::ExecuteArbitraryDbQuery(a) => self.execute_query(a).await,
        };
        match &result {
            Ok(_) => tracing::info!(
                latency_ms = started.elapsed().as_millis() as u64,
                "sandbox action completed"
            ),
            Err(e) => tracing::warn!(
                latency_ms = started.elapsed().as_millis() as u64,
                error_code = e.code(),
                error = %e,
                "sandbox action failed"
            ),
        }
        result
    }

    async fn resolve_file(&self, args: &FileArgs) -> Result<PathBuf> {
        // Cheap string checks first so traversal attempts never reach the disk.
        sanitize_relative_path(&args.relative_path)?;
        let base = self.site.base_dir(&args.reference()).await?;
        resolve_within(&base, &args.relative_path).await
    }

    async fn list_assets(&self, args: &ListAssetsArgs) -> Result<serde_json::Value> {
        let assets = match args.asset_type {
            AssetType::Plugin => {
                let active = self.db.active_plugins().await?;
                self.site
                    .discover_plugins()
                    .await?
                    .into_iter()
                    .map(|p| {
                        let is_active = active.contains(&p.identifier);
                        p.with_status(is_active)
                    })
                    .collect::<Vec<_>>()
            }
            AssetType::Theme => {
                let active = self.db.active_theme().await?;
                self.site
                    .discover_themes()
                    .await?
                    .into_iter()
                    .map(|t| {
                        let is_active = active.as_deref() == Some(t.identifier.as_str());
                        t.with_status(is_active)
                    })
                    .collect::<Vec<_>>()
            }
            AssetType::Root => {
                return Err(SandboxError::validation(
                    "list_assets expects assetType plugin or theme".to_string(),
                ));
            }
        };
        Ok(json!({ "assetType": args.asset_type, "assets": assets }))
    }

    async fn toggle_asset_status(&self, args: &ToggleAssetArgs) -> Result<serde_json::Value> {
        let asset = self.site.find(args.asset_type, &args.asset_identifier).await?;
        let is_active = match args.asset_type {
            AssetType::Plugin => {
                let mut active = self.db.active_plugins().await?;
                active.retain(|p| p != &asset.identifier);
                if args.new_status == AssetStatus::Active {
                    active.push(asset.identifier.clone());
                    active.sort();
                }
                self.db.set_active_plugins(&active).await?;
                args.new_status == AssetStatus::Active
            }
            AssetType::Theme => {
                if args.new_status == AssetStatus::Inactive {
                    return Err(SandboxError::validation(
                        "a theme cannot be deactivated; activate another theme instead"
                            .to_string(),
                    ));
                }
                self.db.set_active_theme(&asset.identifier).await?;
                true
            }
            AssetType::Root => return Err(root_not_an_asset()),
        };
        tracing::info!(
            asset_type = args.asset_type.as_str(),
            asset = %asset.identifier,
            is_active,
            "asset status changed"
        );
        Ok(json!({
            "assetType": args.asset_type,
            "assetIdentifier": asset.identifier,
            "isActive": is_active,
        }))
    }

    async fn delete_asset(&self, args: &AssetArgs) -> Result<serde_json::Value> {
        let asset = self.site.find(args.asset_type, &args.asset_identifier).await?;
        match args.asset_type {
            AssetType::Plugin => {
                let mut active = self.db.active_plugins().await?;
                if active.iter().any(|p| p == &asset.identifier) {
                    active.retain(|p| p != &asset.identifier);
                    self.db.set_active_plugins(&active).await?;
                }
                match asset.identifier.split_once('/') {
                    Some((dir, _)) => {
                        tokio::fs::remove_dir_all(self.site.plugins_dir().join(dir)).await?
                    }
                    None => {
                        tokio::fs::remove_file(self.site.plugins_dir().join(&asset.identifier))
                            .await?
                    }
                }
            }
            AssetType::Theme => {
                if self.db.active_theme().await?.as_deref() == Some(asset.identifier.as_str()) {
                    return Err(SandboxError::validation(
                        "the active theme cannot be deleted".to_string(),
                    ));
                }
                tokio::fs::remove_dir_all(self.site.themes_dir().join(&asset.identifier)).await?;
            }
            AssetType::Root => return Err(root_not_an_asset()),
        }
        tracing::info!(
            asset_type = args.asset_type.as_str(),
            asset = %asset.identifier,
            "asset deleted"
        );
        Ok(json!({ "status": "deleted", "assetIdentifier": asset.identifier }))
    }

    /// Not transactional: directories for every entry are created up front,
    /// and files already written stay on disk if a later write fails.
    async fn install_asset(&self, args: &InstallAssetArgs) -> Result<serde_json::Value> {
        if args.asset_type == AssetType::Root {
            return Err(SandboxError::validation(
                "install_asset expects assetType plugin or theme".to_string(),
            ));
        }
        if args.files.is_empty() {
            return Err(SandboxError::validation(
                "install_asset requires at least one file".to_string(),
            ));
        }
        let dir_name = sanitize_asset_name(&args.asset_name)?;

        let mut decoded = Vec::with_capacity(args.files.len());
        for entry in &args.files {
            let rel = sanitize_relative_path(&entry.name)?;
            let bytes = BASE64.decode(entry.content.trim()).map_err(|e| {
                SandboxError::validation(format!("file {:?} is not valid base64: {e}", entry.name))
            })?;
            decoded.push((rel, bytes));
        }

        let parent = self.site.dir_for_type(args.asset_type);
        let target = parent.join(&dir_name);
        if tokio::fs::try_exists(&target).await? {
            return Err(SandboxError::validation(format!(
                "{} {dir_name:?} already exists",
                args.asset_type.as_str()
            )));
        }

        for (rel, _) in &decoded {
            let dir = match rel.parent() {
                Some(p) if !p.as_os_str().is_empty() => target.join(p),
                _ => target.clone(),
            };
            tokio::fs::create_dir_all(&dir).await?;
        }
        let mut written = Vec::with_capacity(decoded.len());
        for (rel, bytes) in &decoded {
            tokio::fs::write(target.join(rel), bytes).await.map_err(|e| {
                tracing::warn!(
                    target = %target.display(),
                    written = written.len(),
                    "install aborted mid-way; written files are left in place"
                );
                SandboxError::execution(format!("writing {} failed: {e}", rel.display()))
            })?;
            written.push(rel.to_string_lossy().replace('\\', "/"));
        }

        tracing::info!(
            asset_type = args.asset_type.as_str(),
            target = %target.display(),
            files = written.len(),
            "asset installed"
        );
        Ok(json!({
            "status": "installed",
            "assetType": args.asset_type,
            "path": target,
            "files": written,
        }))
    }

    async fn get_asset_files(&self, args: &AssetArgs) -> Result<serde_json::Value> {
        let base = self.site.base_dir(&args.reference()).await?;
        let files = if args.asset_type == AssetType::Plugin && !args.asset_identifier.contains('/')
        {
            // Single-file plugins own exactly one file.
            vec![args.asset_identifier.clone()]
        } else {
            self.site.list_files(&base, self.listing_max).await?
        };
        Ok(json!({ "assetIdentifier": args.asset_identifier, "files": files }))
    }

    async fn read_file_content(&self, args: &FileArgs) -> Result<serde_json::Value> {
        let path = self.resolve_file(args).await?;
        let bytes = read_capped(&path, self.file_bytes_max).await?;
        Ok(json!({
            "relativePath": args.relative_path,
            "content": String::from_utf8_lossy(&bytes),
        }))
    }

    async fn write_file_content(&self, args: &WriteFileArgs) -> Result<serde_json::Value> {
        if args.content.len() > self.file_bytes_max {
            return Err(SandboxError::validation(format!(
                "content too large: {} bytes (max {})",
                args.content.len(),
                self.file_bytes_max
            )));
        }
        let path = self.resolve_file(&args.file).await?;
        let backup = if tokio::fs::try_exists(&path).await? {
            Some(self.backups.snapshot(&path).await?)
        } else {
            None
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, args.content.as_bytes()).await?;
        tracing::info!(
            path = %path.display(),
            bytes = args.content.len(),
            backed_up = backup.is_some(),
            "file written"
        );
        Ok(json!({
            "status": "written",
            "relativePath": args.file.relative_path,
            "backup": backup,
        }))
    }

    async fn get_file_history(&self, args: &FileArgs) -> Result<serde_json::Value> {
        let path = self.resolve_file(args).await?;
        let history = self.backups.list(&path).await?;
        Ok(json!({ "relativePath": args.relative_path, "backups": history }))
    }

    async fn restore_file(&self, args: &RestoreFileArgs) -> Result<serde_json::Value> {
        let path = self.resolve_file(&args.file).await?;
        let record = self.backups.find(&path, &args.backup_path).await?;
        self.backups.restore(&record).await?;
        Ok(json!({
            "status": "restored",
            "relativePath": args.file.relative_path,
            "restoredFrom": record,
        }))
    }

    async fn get_db_tables(&self) -> Result<serde_json::Value> {
        let tables = self.db.tables().await?;
        Ok(json!({ "tables": tables }))
    }

    async fn execute_query(&self, args: &QueryArgs) -> Result<serde_json::Value> {
        let rows = self.db.select(&args.query).await?;
        Ok(json!({ "rowCount": rows.len(), "rows": rows }))
    }
}

fn root_not_an_asset() -> SandboxError {
    SandboxError::validation("root is not a plugin or theme".to_string())
}

async fn read_capped(path: &Path, max: usize) -> Result<Vec<u8>> {
    let meta = tokio::fs::metadata(path).await.map_err(|e| {
        SandboxError::validation(format!(
            "{} cannot be read: {e}; call get_asset_files to see available files",
            path.display()
        ))
    })?;
    if !meta.is_file() {
        return Err(SandboxError::validation(format!(
            "{} is not a file",
            path.display()
        )));
    }
    if meta.len() as usize > max {
        return Err(SandboxError::execution(format!(
            "file too large: {} bytes (max {max})",
            meta.len()
        )));
    }
    Ok(tokio::fs::read(path).await?)
}
