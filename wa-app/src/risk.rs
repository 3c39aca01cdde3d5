use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskTier {
    High,
    Medium,
    Low,
}

impl RiskTier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }

    /// One-line warning shown next to a pending action.
    pub fn warning(self) -> &'static str {
        match self {
            Self::High => "destructive or irreversible change to the site",
            Self::Medium => "reversible change to site state",
            Self::Low => "read-only",
        }
    }
}

impl std::fmt::Display for RiskTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Total over action names; anything unrecognized is `Low`.
pub fn classify(action_name: &str) -> RiskTier {
    match action_name {
        "write_file_content"
        | "delete_asset"
        | "install_asset"
        | "restore_file"
        | "execute_arbitrary_db_query" => RiskTier::High,
        "toggle_asset_status" => RiskTier::Medium,
        _ => RiskTier::Low,
    }
}
