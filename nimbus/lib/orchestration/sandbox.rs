use std::{sync::Arc, time::Duration};

use crate::{gateway::ExecutionGateway, NimbusResult};

use super::{Orchestrator, SandboxEntry, SandboxInfo, SandboxMetrics, SandboxState};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A handle to one sandbox, as returned by [`Orchestrator::create`] and
/// [`Orchestrator::connect`].
///
/// The handle does not keep the sandbox alive. Once it is killed or expires, every call fails
/// with [`NimbusError::SandboxNotFound`](crate::NimbusError::SandboxNotFound).
#[derive(Clone)]
pub struct Sandbox {
    orchestrator: Arc<Orchestrator>,
    entry: Arc<SandboxEntry>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Sandbox {
    pub(super) fn new(orchestrator: Arc<Orchestrator>, entry: Arc<SandboxEntry>) -> Self {
        Self {
            orchestrator,
            entry,
        }
    }

    /// The sandbox id.
    pub fn id(&self) -> &str {
        &self.entry.id
    }

    /// The owning team.
    pub fn team(&self) -> &str {
        &self.entry.team
    }

    /// The current state.
    pub fn state(&self) -> SandboxState {
        self.entry.state()
    }

    /// The token unlocking exposed ports when public traffic is disabled.
    pub fn traffic_token(&self) -> &str {
        &self.entry.traffic_token
    }

    /// A snapshot of the sandbox.
    pub fn info(&self) -> SandboxInfo {
        self.entry.info()
    }

    /// Commands, files and terminals.
    pub fn gateway(&self) -> NimbusResult<Arc<ExecutionGateway>> {
        self.entry.gateway("execute commands")
    }

    /// See [`Orchestrator::set_timeout`].
    pub async fn set_timeout(&self, timeout: Duration) -> NimbusResult<SandboxInfo> {
        self.orchestrator
            .set_timeout(self.team(), self.id(), timeout)
            .await
    }

    /// See [`Orchestrator::pause`].
    pub async fn pause(&self) -> NimbusResult<SandboxInfo> {
        self.orchestrator.pause(self.team(), self.id()).await
    }

    /// See [`Orchestrator::resume`].
    pub async fn resume(&self, timeout: Option<Duration>) -> NimbusResult<SandboxInfo> {
        self.orchestrator.resume(self.team(), self.id(), timeout).await
    }

    /// See [`Orchestrator::kill`].
    pub async fn kill(&self) -> NimbusResult<bool> {
        self.orchestrator.kill(self.team(), self.id()).await
    }

    /// See [`Orchestrator::get_host`].
    pub async fn host(&self, port: u16) -> NimbusResult<String> {
        self.orchestrator.get_host(self.team(), self.id(), port).await
    }

    /// See [`Orchestrator::logs`].
    pub async fn logs(&self, tail: Option<usize>) -> NimbusResult<Vec<String>> {
        self.orchestrator.logs(self.team(), self.id(), tail).await
    }

    /// See [`Orchestrator::metrics`].
    pub async fn metrics(&self) -> NimbusResult<SandboxMetrics> {
        self.orchestrator.metrics(self.team(), self.id()).await
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("id", &self.entry.id)
            .field("state", &self.entry.state())
            .finish()
    }
}
