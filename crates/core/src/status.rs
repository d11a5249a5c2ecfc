//! Deployment status phases and the conditions agents report back.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::DesiredState;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum StatusPhase {
    #[default]
    Preparing,
    Provisioning,
    Ready,
    Failed,
    Stopped,
    Deleting,
    Deleted,
}

impl StatusPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusPhase::Preparing => "preparing",
            StatusPhase::Provisioning => "provisioning",
            StatusPhase::Ready => "ready",
            StatusPhase::Failed => "failed",
            StatusPhase::Stopped => "stopped",
            StatusPhase::Deleting => "deleting",
            StatusPhase::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "preparing" => Some(StatusPhase::Preparing),
            "provisioning" => Some(StatusPhase::Provisioning),
            "ready" => Some(StatusPhase::Ready),
            "failed" => Some(StatusPhase::Failed),
            "stopped" => Some(StatusPhase::Stopped),
            "deleting" => Some(StatusPhase::Deleting),
            "deleted" => Some(StatusPhase::Deleted),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StatusPhase::Deleted)
    }

    /// Staying in the same phase is always allowed.
    pub fn can_transition_to(&self, next: StatusPhase) -> bool {
        if *self == next {
            return true;
        }
        match self {
            StatusPhase::Deleted => false,
            StatusPhase::Deleting => next == StatusPhase::Deleted,
            _ => next != StatusPhase::Preparing,
        }
    }
}

impl std::fmt::Display for StatusPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Condition {
    pub r#type: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Route {
    pub domain: String,
    pub router: String,
}

/// First condition whose type is `Ready`, compared ignoring ASCII case.
pub fn ready_condition(conditions: &[Condition]) -> Option<&Condition> {
    conditions.iter().find(|c| c.r#type.eq_ignore_ascii_case("Ready"))
}

/// Status payload sent by a data-plane agent for one deployed resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AgentStatusReport {
    pub resource_id: String,
    /// Resource version the agent has applied, if it reports one.
    #[serde(default)]
    pub resource_version: Option<i64>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub routes: Vec<Route>,
}

impl AgentStatusReport {
    pub fn ready_condition(&self) -> Option<&Condition> {
        ready_condition(&self.conditions)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DeploymentStatus {
    pub phase: StatusPhase,
    /// Resource version last observed by the agent.
    pub version: i64,
    pub conditions: Vec<Condition>,
    pub routes: Vec<Route>,
    pub upgrade_available: bool,
}

impl DeploymentStatus {
    pub fn ready_condition(&self) -> Option<&Condition> {
        ready_condition(&self.conditions)
    }

    /// Phase implied by a set of conditions; `None` when no Ready condition is present.
    pub fn phase_from_conditions(conditions: &[Condition]) -> Option<StatusPhase> {
        let ready = ready_condition(conditions)?;
        if ready.status.eq_ignore_ascii_case("true") {
            return Some(StatusPhase::Ready);
        }
        let phase = match ready.reason.as_str() {
            "Deleted" => StatusPhase::Deleted,
            "Error" | "Rejected" => StatusPhase::Failed,
            "Stopped" => StatusPhase::Stopped,
            _ => StatusPhase::Provisioning,
        };
        Some(phase)
    }

    /// Merge an agent report. Returns true if the phase changed.
    pub fn fold(&mut self, report: &AgentStatusReport) -> bool {
        self.conditions = report.conditions.clone();
        self.routes = report.routes.clone();
        if let Some(v) = report.resource_version {
            self.version = self.version.max(v);
        }
        match Self::phase_from_conditions(&self.conditions) {
            Some(next) => self.transition(next),
            None => false,
        }
    }

    /// Apply a control-plane desired-state change. Returns true if the phase changed.
    pub fn apply_desired(&mut self, desired: DesiredState) -> bool {
        match desired {
            DesiredState::Deleted if !matches!(self.phase, StatusPhase::Deleting | StatusPhase::Deleted) => {
                self.transition(StatusPhase::Deleting)
            }
            _ => false,
        }
    }

    fn transition(&mut self, next: StatusPhase) -> bool {
        if self.phase == next {
            return false;
        }
        if !self.phase.can_transition_to(next) {
            warn!(from = %self.phase, to = %next, "status: ignoring disallowed phase transition");
            return false;
        }
        self.phase = next;
        true
    }
}
