use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, OnceLock},
};

use chrono::{DateTime, Utc};
use nimbusutils::{LogWriter, RotatingLog};
use tokio::sync::{watch, Mutex};

use crate::{
    gateway::ExecutionGateway,
    ledger::{ReservationToken, Resources},
    network::NetworkPolicy,
    NimbusError, NimbusResult,
};

use super::{SandboxInfo, SandboxState, VolumeAttachment};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The orchestrator's record of one sandbox.
///
/// `status` is the authoritative state and expiry. Readers take cheap snapshots of it; writers
/// only change it while holding `lifecycle`, which serializes every transition of this sandbox.
pub(crate) struct SandboxEntry {
    pub(crate) id: String,
    pub(crate) team: String,
    pub(crate) template_id: String,
    pub(crate) alias: String,
    pub(crate) generation: u32,
    pub(crate) resources: Resources,
    pub(crate) started_at: DateTime<Utc>,
    pub(crate) metadata: HashMap<String, String>,
    pub(crate) network: NetworkPolicy,
    pub(crate) domain: String,
    pub(crate) traffic_token: String,
    pub(crate) log_path: PathBuf,
    pub(crate) log: LogWriter,
    pub(crate) status: watch::Sender<Status>,
    pub(crate) lifecycle: Mutex<Lifecycle>,
    pub(crate) gateway: OnceLock<Arc<ExecutionGateway>>,
}

/// The mutable view of a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Status {
    pub(crate) state: SandboxState,
    pub(crate) expires_at: DateTime<Utc>,
    pub(crate) volume: Option<VolumeAttachment>,
}

/// Resources released exactly once, when the sandbox terminates.
pub(crate) struct Lifecycle {
    pub(crate) reservation: Option<ReservationToken>,
    pub(crate) log: Option<RotatingLog>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SandboxEntry {
    /// The current status.
    pub(crate) fn status(&self) -> Status {
        self.status.borrow().clone()
    }

    /// The current state.
    pub(crate) fn state(&self) -> SandboxState {
        self.status.borrow().state
    }

    /// Moves to `state`, recording it in the sandbox log. Callers hold `lifecycle`.
    pub(crate) fn transition(&self, state: SandboxState) {
        let mut previous = state;
        self.status.send_modify(|status| {
            previous = std::mem::replace(&mut status.state, state);
        });
        if previous != state {
            self.log.line(format!("[{}] {previous} -> {state}", Utc::now().to_rfc3339()));
            tracing::info!(sandbox_id = %self.id, from = %previous, to = %state, "sandbox state changed");
        }
    }

    /// Replaces the expiry. Callers hold `lifecycle`.
    pub(crate) fn set_expiry(&self, expires_at: DateTime<Utc>) {
        self.status.send_modify(|status| status.expires_at = expires_at);
    }

    /// Whether the sandbox has expired at `now`.
    pub(crate) fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let status = self.status.borrow();
        status.state.is_live() && status.expires_at <= now
    }

    /// The gateway of a running sandbox.
    pub(crate) fn gateway(&self, action: &'static str) -> NimbusResult<Arc<ExecutionGateway>> {
        match self.state() {
            SandboxState::Running => self
                .gateway
                .get()
                .cloned()
                .ok_or_else(|| NimbusError::SandboxNotFound(self.id.clone())),
            SandboxState::Terminated => Err(NimbusError::SandboxNotFound(self.id.clone())),
            state => Err(NimbusError::InvalidStateTransition {
                sandbox: self.id.clone(),
                state,
                action,
            }),
        }
    }

    /// A snapshot for callers.
    pub(crate) fn info(&self) -> SandboxInfo {
        let status = self.status();
        SandboxInfo {
            sandbox_id: self.id.clone(),
            team: self.team.clone(),
            template_id: self.template_id.clone(),
            alias: self.alias.clone(),
            generation: self.generation,
            state: status.state,
            resources: self.resources,
            started_at: self.started_at,
            expires_at: status.expires_at,
            metadata: self.metadata.clone(),
            volume: status.volume,
            network: self.network.clone(),
            domain: self.domain.clone(),
        }
    }

    /// Whether every `filter` pair is among the sandbox's metadata.
    pub(crate) fn matches_metadata(&self, filter: &HashMap<String, String>) -> bool {
        filter
            .iter()
            .all(|(key, value)| self.metadata.get(key) == Some(value))
    }
}
