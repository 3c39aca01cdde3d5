use crate::risk::{RiskTier, classify};
use chrono::{DateTime, Utc};
use wa_llm::ProposedAction;

#[derive(Debug, Clone, PartialEq)]
pub struct PendingAction {
    pub action: ProposedAction,
    pub risk: RiskTier,
    pub created_at: DateTime<Utc>,
}

/// What the gate did with a proposal.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// Held until `confirm` or `cancel`.
    Suspended(RiskTier),
    /// Auto-execute is on; the caller runs it immediately.
    AutoApproved(PendingAction),
    /// Something was already pending; the proposal was dropped.
    Ignored,
}

/// Holds at most one pending action per session.
///
/// With auto-execute on, every proposal is approved on arrival regardless of
/// its risk tier. Turning auto-execute on does not approve an action that is
/// already pending.
#[derive(Debug, Default)]
pub struct ConfirmationGate {
    pending: Option<PendingAction>,
    auto_execute: bool,
}

impl ConfirmationGate {
    pub fn new(auto_execute: bool) -> Self {
        Self {
            pending: None,
            auto_execute,
        }
    }

    pub fn auto_execute(&self) -> bool {
        self.auto_execute
    }

    pub fn set_auto_execute(&mut self, enabled: bool) {
        self.auto_execute = enabled;
    }

    pub fn pending(&self) -> Option<&PendingAction> {
        self.pending.as_ref()
    }

    pub fn propose(&mut self, action: ProposedAction) -> Admission {
        if let Some(existing) = &self.pending {
            tracing::warn!(
                pending = %existing.action.name,
                dropped = %action.name,
                "action proposed while another is pending; dropping it"
            );
            return Admission::Ignored;
        }
        let pending = PendingAction {
            risk: classify(&action.name),
            action,
            created_at: Utc::now(),
        };
        if self.auto_execute {
            tracing::info!(
                action = %pending.action.name,
                risk_tier = %pending.risk,
                "action auto-approved"
            );
            return Admission::AutoApproved(pending);
        }
        let risk = pending.risk;
        tracing::info!(
            action = %pending.action.name,
            risk_tier = %risk,
            "action awaiting confirmation"
        );
        self.pending = Some(pending);
        Admission::Suspended(risk)
    }

    pub fn confirm(&mut self) -> Option<PendingAction> {
        self.pending.take()
    }

    pub fn cancel(&mut self) -> Option<PendingAction> {
        self.pending.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn action(name: &str) -> ProposedAction {
        ProposedAction {
            id: format!("call_{name}"),
            name: name.to_string(),
            args: serde_json::Map::new(),
        }
    }

    #[test]
    fn suspends_until_confirmed() {
        let mut gate = ConfirmationGate::new(false);
        assert_eq!(
            gate.propose(action("delete_asset")),
            Admission::Suspended(RiskTier::High)
        );
        assert!(gate.pending().is_some());

        let approved = gate.confirm().unwrap();
        assert_eq!(approved.action.name, "delete_asset");
        assert!(gate.pending().is_none());
        assert!(gate.confirm().is_none());
    }

    #[test]
    fn second_proposal_is_a_no_op() {
        let mut gate = ConfirmationGate::new(false);
        gate.propose(action("write_file_content"));
        assert_eq!(gate.propose(action("list_assets")), Admission::Ignored);
        assert_eq!(
            gate.pending().map(|p| p.action.name.as_str()),
            Some("write_file_content")
        );
    }

    #[test]
    fn auto_execute_approves_every_tier() {
        let mut gate = ConfirmationGate::new(true);
        for name in ["execute_arbitrary_db_query", "toggle_asset_status", "list_assets"] {
            match gate.propose(action(name)) {
                Admission::AutoApproved(p) => assert_eq!(p.risk, classify(name)),
                other => panic!("{name}: {other:?}"),
            }
            assert!(gate.pending().is_none());
        }
    }

    #[test]
    fn cancel_discards_and_enabling_auto_does_not_approve_pending() {
        let mut gate = ConfirmationGate::new(false);
        gate.propose(action("install_asset"));
        gate.set_auto_execute(true);
        assert!(gate.pending().is_some());

        let cancelled = gate.cancel().unwrap();
        assert_eq!(cancelled.action.name, "install_asset");
        assert!(gate.cancel().is_none());
    }
}
