//! Site-side execution for wpagent.
//!
//! Actions proposed by the model are parsed into [`SandboxAction`] and run by
//! a [`Sandbox`] bound to one WordPress installation. Every file operation is
//! confined to its asset directory and every overwrite is snapshotted first.

mod action;
mod asset;
mod backup;
mod db;
mod error;
mod path;
mod sandbox;

pub use action::{
    ACTION_NAMES, AssetArgs, AssetStatus, FileArgs, FileEntry, InstallAssetArgs, ListAssetsArgs,
    NoArgs, QueryArgs, RestoreFileArgs, SandboxAction, SandboxRequest, SandboxResponse,
    ToggleAssetArgs, WriteFileArgs, action_definitions,
};
pub use asset::{AssetInfo, AssetReference, AssetType, SiteLayout};
pub use backup::{BACKUP_DIR_NAME, BackupRecord, BackupStore};
pub use db::{QUERY_ROWS_MAX, SiteDb, ensure_select};
pub use error::{Result, SandboxError};
pub use path::{resolve_within, sanitize_relative_path};
pub use sandbox::{Sandbox, SandboxConfig};
