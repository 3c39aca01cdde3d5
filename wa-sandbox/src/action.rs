//! The closed set of actions the sandbox will run, and the wire envelope.
//!
//! Payloads arrive as loosely-typed JSON (from the model or over HTTP) and
//! are validated into one variant per action before anything executes.

use crate::asset::{AssetReference, AssetType};
use crate::error::{Result, SandboxError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use wa_llm::ToolDefinition;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetStatus {
    Active,
    Inactive,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListAssetsArgs {
    pub asset_type: AssetType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToggleAssetArgs {
    pub asset_type: AssetType,
    pub asset_identifier: String,
    pub new_status: AssetStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetArgs {
    pub asset_type: AssetType,
    pub asset_identifier: String,
}

impl AssetArgs {
    pub fn reference(&self) -> AssetReference {
        AssetReference::new(self.asset_type, self.asset_identifier.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    /// Base64-encoded bytes.
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallAssetArgs {
    pub asset_type: AssetType,
    pub asset_name: String,
    pub files: Vec<FileEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileArgs {
    pub asset_type: AssetType,
    pub asset_identifier: String,
    pub relative_path: String,
}

impl FileArgs {
    pub fn reference(&self) -> AssetReference {
        AssetReference::new(self.asset_type, self.asset_identifier.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteFileArgs {
    #[serde(flatten)]
    pub file: FileArgs,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreFileArgs {
    #[serde(flatten)]
    pub file: FileArgs,
    pub backup_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryArgs {
    pub query: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct NoArgs {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxAction {
    ListAssets(ListAssetsArgs),
    ToggleAssetStatus(ToggleAssetArgs),
    DeleteAsset(AssetArgs),
    InstallAsset(InstallAssetArgs),
    GetAssetFiles(AssetArgs),
    ReadFileContent(FileArgs),
    WriteFileContent(WriteFileArgs),
    GetFileHistory(FileArgs),
    RestoreFile(RestoreFileArgs),
    GetDbTables(NoArgs),
    ExecuteArbitraryDbQuery(QueryArgs),
}

pub const ACTION_NAMES: &[&str] = &[
    "list_assets",
    "toggle_asset_status",
    "delete_asset",
    "install_asset",
    "get_asset_files",
    "read_file_content",
    "write_file_content",
    "get_file_history",
    "restore_file",
    "get_db_tables",
    "execute_arbitrary_db_query",
];

fn parse_args<T: DeserializeOwned>(
    name: &str,
    args: serde_json::Map<String, serde_json::Value>,
) -> Result<T> {
    serde_json::from_value(serde_json::Value::Object(args))
        .map_err(|e| SandboxError::validation(format!("invalid arguments for {name}: {e}")))
}

impl SandboxAction {
    /// Validates a named, untyped payload into an action.
    pub fn parse(name: &str, args: serde_json::Map<String, serde_json::Value>) -> Result<Self> {
        let action = match name {
            "list_assets" => Self::ListAssets(parse_args(name, args)?),
            "toggle_asset_status" => Self::ToggleAssetStatus(parse_args(name, args)?),
            "delete_asset" => Self::DeleteAsset(parse_args(name, args)?),
            "install_asset" => Self::InstallAsset(parse_args(name, args)?),
            "get_asset_files" => Self::GetAssetFiles(parse_args(name, args)?),
            "read_file_content" => Self::ReadFileContent(parse_args(name, args)?),
            "write_file_content" => Self::WriteFileContent(parse_args(name, args)?),
            "get_file_history" => Self::GetFileHistory(parse_args(name, args)?),
            "restore_file" => Self::RestoreFile(parse_args(name, args)?),
            "get_db_tables" => Self::GetDbTables(NoArgs {}),
            "execute_arbitrary_db_query" => Self::ExecuteArbitraryDbQuery(parse_args(name, args)?),
            other => {
                return Err(SandboxError::validation(format!("unknown action: {other}")));
            }
        };
        Ok(action)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::ListAssets(_) => "list_assets",
            Self::ToggleAssetStatus(_) => "toggle_asset_status",
            Self::DeleteAsset(_) => "delete_asset",
            Self::InstallAsset(_) => "install_asset",
            Self::GetAssetFiles(_) => "get_asset_files",
            Self::ReadFileContent(_) => "read_file_content",
            Self::WriteFileContent(_) => "write_file_content",
            Self::GetFileHistory(_) => "get_file_history",
            Self::RestoreFile(_) => "restore_file",
            Self::GetDbTables(_) => "get_db_tables",
            Self::ExecuteArbitraryDbQuery(_) => "execute_arbitrary_db_query",
        }
    }

    fn payload(&self) -> serde_json::Value {
        let value = match self {
            Self::ListAssets(a) => serde_json::to_value(a),
            Self::ToggleAssetStatus(a) => serde_json::to_value(a),
            Self::DeleteAsset(a) | Self::GetAssetFiles(a) => serde_json::to_value(a),
            Self::InstallAsset(a) => serde_json::to_value(a),
            Self::ReadFileContent(a) | Self::GetFileHistory(a) => serde_json::to_value(a),
            Self::WriteFileContent(a) => serde_json::to_value(a),
            Self::RestoreFile(a) => serde_json::to_value(a),
            Self::GetDbTables(a) => serde_json::to_value(a),
            Self::ExecuteArbitraryDbQuery(a) => serde_json::to_value(a),
        };
        // Plain structs of strings and enums always serialize.
        value.unwrap_or_else(|_| json!({}))
    }

    pub fn to_request(&self) -> SandboxRequest {
        let payload = match self.payload() {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        SandboxRequest {
            action: self.name().to_string(),
            payload,
        }
    }
}

/// `{ action, payload }` as sent to the execution endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxRequest {
    pub action: String,
    #[serde(default)]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

impl SandboxRequest {
    pub fn into_action(self) -> Result<SandboxAction> {
        SandboxAction::parse(&self.action, self.payload)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl SandboxResponse {
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            error_code: None,
        }
    }

    pub fn failure(code: &str, message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            message: Some(message.into()),
            error_code: Some(code.to_string()),
        }
    }

    pub fn from_result(result: Result<serde_json::Value>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(e) => Self::failure(e.code(), e.message()),
        }
    }

    /// Inverse of [`SandboxResponse::from_result`]. Unknown codes count as
    /// execution failures.
    pub fn into_result(self) -> Result<serde_json::Value> {
        if self.success {
            return Ok(self.data.unwrap_or(serde_json::Value::Null));
        }
        let message = self
            .message
            .unwrap_or_else(|| "remote action failed".to_string());
        match self.error_code.as_deref() {
            Some("validation_error") => Err(SandboxError::Validation(message)),
            _ => Err(SandboxError::Execution(message)),
        }
    }
}

fn asset_type_schema(include_root: bool) -> serde_json::Value {
    if include_root {
        json!({ "type": "string", "enum": ["plugin", "theme", "root"] })
    } else {
        json!({ "type": "string", "enum": ["plugin", "theme"] })
    }
}

fn file_properties() -> serde_json::Map<String, serde_json::Value> {
    let mut props = serde_json::Map::new();
    props.insert("assetType".to_string(), asset_type_schema(true));
    props.insert(
        "assetIdentifier".to_string(),
        json!({ "type": "string", "description": "Plugin path (dir/file.php), theme slug, or \"root\"." }),
    );
    props.insert(
        "relativePath".to_string(),
        json!({ "type": "string", "description": "Path relative to the asset directory." }),
    );
    props
}

fn object_schema(
    properties: serde_json::Map<String, serde_json::Value>,
    required: &[&str],
) -> serde_json::Value {
    json!({
        "type": "object",
        "additionalProperties": false,
        "properties": properties,
        "required": required,
    })
}

/// Tool definitions offered to the model, one per action.
pub fn action_definitions() -> Result<Vec<ToolDefinition>> {
    let mut asset_props = serde_json::Map::new();
    asset_props.insert("assetType".to_string(), asset_type_schema(false));
    asset_props.insert("assetIdentifier".to_string(), json!({ "type": "string" }));

    let mut toggle_props = asset_props.clone();
    toggle_props.insert(
        "newStatus".to_string(),
        json!({ "type": "string", "enum": ["active", "inactive"] }),
    );

    let mut list_props = serde_json::Map::new();
    list_props.insert("assetType".to_string(), asset_type_schema(false));

    let mut install_props = serde_json::Map::new();
    install_props.insert("assetType".to_string(), asset_type_schema(false));
    install_props.insert("assetName".to_string(), json!({ "type": "string" }));
    install_props.insert(
        "files".to_string(),
        json!({
            "type": "array",
            "items": {
                "type": "object",
                "properties": {
                    "name": { "type": "string" },
                    "content": { "type": "string", "description": "Base64-encoded file bytes." }
                },
                "required": ["name", "content"]
            }
        }),
    );

    let mut write_props = file_properties();
    write_props.insert("content".to_string(), json!({ "type": "string" }));

    let mut restore_props = file_properties();
    restore_props.insert(
        "backupPath".to_string(),
        json!({ "type": "string", "description": "A backupPath returned by get_file_history." }),
    );

    let mut query_props = serde_json::Map::new();
    query_props.insert("query".to_string(), json!({ "type": "string" }));

    let file_required = ["assetType", "assetIdentifier", "relativePath"];
    let defs = vec![
        (
            "list_assets",
            "List installed plugins or themes with their activation status.",
            object_schema(list_props, &["assetType"]),
        ),
        (
            "toggle_asset_status",
            "Activate or deactivate a plugin, or switch the active theme.",
            object_schema(toggle_props, &["assetType", "assetIdentifier", "newStatus"]),
        ),
        (
            "delete_asset",
            "Permanently delete an installed plugin or inactive theme.",
            object_schema(asset_props.clone(), &["assetType", "assetIdentifier"]),
        ),
        (
            "install_asset",
            "Create a new plugin or theme from a set of files.",
            object_schema(install_props, &["assetType", "assetName", "files"]),
        ),
        (
            "get_asset_files",
            "List the files of a plugin, theme, or the site root.",
            object_schema(
                {
                    let mut p = asset_props;
                    p.insert("assetType".to_string(), asset_type_schema(true));
                    p
                },
                &["assetType", "assetIdentifier"],
            ),
        ),
        (
            "read_file_content",
            "Read a file inside an asset directory.",
            object_schema(file_properties(), &file_required),
        ),
        (
            "write_file_content",
            "Overwrite or create a file inside an asset directory. The previous content is backed up first.",
            object_schema(
                write_props,
                &["assetType", "assetIdentifier", "relativePath", "content"],
            ),
        ),
        (
            "get_file_history",
            "List backups of a file, newest first.",
            object_schema(file_properties(), &file_required),
        ),
        (
            "restore_file",
            "Restore a file from one of its backups.",
            object_schema(
                restore_props,
                &["assetType", "assetIdentifier", "relativePath", "backupPath"],
            ),
        ),
        (
            "get_db_tables",
            "List the tables of the site database.",
            object_schema(serde_json::Map::new(), &[]),
        ),
        (
            "execute_arbitrary_db_query",
            "Run a read-only SELECT query against the site database.",
            object_schema(query_props, &["query"]),
        ),
    ];

    defs.into_iter()
        .map(|(name, description, schema)| {
            ToolDefinition::validated(name, description, schema)
                .map_err(|e| SandboxError::validation(e.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(v: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
        match v {
            serde_json::Value::Object(m) => m,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn parses_write_with_flattened_file_args() {
        let action = SandboxAction::parse(
            "write_file_content",
            args(json!({
                "assetType": "theme",
                "assetIdentifier": "astra",
                "relativePath": "style.css",
                "content": "body{}"
            })),
        )
        .unwrap();
        let SandboxAction::WriteFileContent(w) = &action else {
            panic!("wrong variant: {action:?}");
        };
        assert_eq!(w.file.asset_type, AssetType::Theme);
        assert_eq!(w.file.relative_path, "style.css");
        assert_eq!(action.name(), "write_file_content");
    }

    #[test]
    fn missing_argument_is_a_validation_error() {
        let err = SandboxAction::parse(
            "delete_asset",
            args(json!({ "assetType": "plugin" })),
        )
        .unwrap_err();
        assert!(matches!(err, SandboxError::Validation(_)));
        assert!(err.to_string().contains("assetIdentifier"));
    }

    #[test]
    fn unknown_action_is_rejected() {
        let err = SandboxAction::parse("drop_everything", serde_json::Map::new()).unwrap_err();
        assert!(err.to_string().contains("unknown action"));
    }

    #[test]
    fn request_envelope_carries_name_and_payload() {
        let action = SandboxAction::ToggleAssetStatus(ToggleAssetArgs {
            asset_type: AssetType::Plugin,
            asset_identifier: "akismet/akismet.php".to_string(),
            new_status: AssetStatus::Inactive,
        });
        let request = action.to_request();
        assert_eq!(request.action, "toggle_asset_status");
        assert_eq!(request.payload["newStatus"], "inactive");
        assert_eq!(request.clone().into_action().unwrap(), action);
    }

    #[test]
    fn response_codes_map_back_to_error_kinds() {
        let validation = SandboxResponse::failure("validation_error", "bad path");
        assert!(matches!(
            validation.into_result(),
            Err(SandboxError::Validation(m)) if m == "bad path"
        ));
        let other = SandboxResponse::failure("unauthorized", "nope");
        assert!(matches!(other.into_result(), Err(SandboxError::Execution(_))));
    }

    #[test]
    fn every_action_has_a_definition() {
        let defs = action_definitions().unwrap();
        let names: Vec<&str> = defs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, ACTION_NAMES);
    }
}
