use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::{
    config::NimbusConfig,
    gateway::ExecutionGateway,
    ledger::ResourceLedger,
    template::TemplateStore,
    vm::VmBackend,
    volume::VolumeStore,
    NimbusError, NimbusResult,
};

use super::SandboxEntry;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// How many terminated sandboxes are remembered. Killing one that has been forgotten fails with
/// not found.
pub const MAX_TOMBSTONES: usize = 4096;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Drives sandboxes through their lifecycle.
///
/// Every public operation takes the calling team. A sandbox owned by another team is reported
/// as not found.
pub struct Orchestrator {
    /// The service configuration.
    pub(super) config: Arc<NimbusConfig>,

    /// Admission control.
    pub(super) ledger: Arc<ResourceLedger>,

    /// Template snapshots.
    pub(super) templates: TemplateStore,

    /// Persistent volumes.
    pub(super) volumes: VolumeStore,

    /// Boots the micro-VMs.
    pub(super) backend: Arc<dyn VmBackend>,

    /// Live sandboxes, including ones still provisioning.
    pub(super) sandboxes: RwLock<HashMap<String, Arc<SandboxEntry>>>,

    /// Owners of sandboxes that have been terminated, so a repeated kill can be told apart from
    /// an unknown id.
    pub(super) terminated: RwLock<Tombstones>,
}

/// Owners of terminated sandboxes, oldest forgotten first once the capacity is reached.
#[derive(Debug)]
pub(super) struct Tombstones {
    owners: HashMap<String, String>,
    order: VecDeque<String>,
    capacity: usize,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Orchestrator {
    /// Creates an orchestrator.
    pub fn new(
        config: Arc<NimbusConfig>,
        ledger: Arc<ResourceLedger>,
        templates: TemplateStore,
        volumes: VolumeStore,
        backend: Arc<dyn VmBackend>,
    ) -> Self {
        Self {
            config,
            ledger,
            templates,
            volumes,
            backend,
            sandboxes: RwLock::new(HashMap::new()),
            terminated: RwLock::new(Tombstones::new(MAX_TOMBSTONES)),
        }
    }

    /// The service configuration.
    pub fn config(&self) -> &NimbusConfig {
        &self.config
    }

    /// The resource ledger.
    pub fn ledger(&self) -> &Arc<ResourceLedger> {
        &self.ledger
    }

    /// The volume store.
    pub fn volumes(&self) -> &VolumeStore {
        &self.volumes
    }

    /// The execution gateway of a running sandbox.
    pub async fn gateway(&self, team: &str, id: &str) -> NimbusResult<Arc<ExecutionGateway>> {
        self.entry(team, id).await?.gateway("execute commands")
    }

    /// Kills every sandbox whose expiry has passed. Returns how many were killed.
    pub async fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let candidates = self
            .sandboxes
            .read()
            .await
            .values()
            .filter(|entry| entry.is_expired(now))
            .cloned()
            .collect::<Vec<_>>();

        let mut killed = 0;
        for entry in candidates {
            match self.expire(&entry).await {
                Ok(true) => killed += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(sandbox_id = %entry.id, error = %e, "failed to expire sandbox")
                }
            }
        }
        killed
    }

    /// Runs [`sweep_expired`](Self::sweep_expired) on the configured interval until `cancel`
    /// fires.
    pub async fn run_sweeper(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(interval = ?self.config.sweep_interval(), "expiry sweeper started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let killed = self.sweep_expired().await;
                    if killed > 0 {
                        tracing::info!(killed, "expired sandboxes");
                    }
                }
            }
        }

        tracing::info!("expiry sweeper stopped");
    }

    /// The requested lifetime, or the configured default, checked against the maximum.
    pub(super) fn validate_timeout(&self, timeout: Option<Duration>) -> NimbusResult<Duration> {
        let timeout = timeout.unwrap_or_else(|| self.config.default_sandbox_timeout());
        let max = self.config.max_sandbox_timeout();
        if timeout.is_zero() || timeout > max {
            return Err(NimbusError::InvalidArgument(format!(
                "timeout must be between 1s and {}s",
                max.as_secs()
            )));
        }
        Ok(timeout)
    }

    /// Finds a live sandbox owned by `team`.
    pub(super) async fn entry(&self, team: &str, id: &str) -> NimbusResult<Arc<SandboxEntry>> {
        self.sandboxes
            .read()
            .await
            .get(id)
            .filter(|entry| entry.team == team && entry.state().is_live())
            .cloned()
            .ok_or_else(|| NimbusError::SandboxNotFound(id.to_string()))
    }
}

impl Tombstones {
    pub(super) fn new(capacity: usize) -> Self {
        Self {
            owners: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    /// The team that owned the terminated sandbox `id`.
    pub(super) fn owner(&self, id: &str) -> Option<&str> {
        self.owners.get(id).map(String::as_str)
    }

    pub(super) fn insert(&mut self, id: String, team: String) {
        if self.owners.insert(id.clone(), team).is_none() {
            self.order.push_back(id);
        }

        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.owners.remove(&oldest);
            }
        }
    }

    pub(super) fn len(&self) -> usize {
        self.owners.len()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

pub(super) fn expiry_after(from: DateTime<Utc>, timeout: Duration) -> NimbusResult<DateTime<Utc>> {
    TimeDelta::from_std(timeout)
        .ok()
        .and_then(|delta| from.checked_add_signed(delta))
        .ok_or_else(|| NimbusError::InvalidArgument(format!("timeout {timeout:?} is out of range")))
}

/// Builds an orchestrator over a local backend rooted at the config's home, with the base
/// template in place.
#[cfg(test)]
pub(crate) async fn test_orchestrator(config: NimbusConfig) -> anyhow::Result<Arc<Orchestrator>> {
    use crate::{
        management::{init_db, CATALOG_DB_MIGRATOR},
        vm::LocalVmBackend,
    };

    let pool = init_db(config.db_path(), &CATALOG_DB_MIGRATOR).await?;
    let templates = TemplateStore::new(pool.clone(), config.templates_dir());
    templates.ensure_base().await?;

    let ledger = ResourceLedger::new(*config.get_default_plan(), config.get_team_plans().clone());
    let backend = LocalVmBackend::new(config.sandboxes_dir(), config.get_users().clone());
    Ok(Arc::new(Orchestrator::new(
        Arc::new(config.clone()),
        Arc::new(ledger),
        templates,
        VolumeStore::new(pool, config.volumes_dir()),
        Arc::new(backend),
    )))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tombstones_forget_the_oldest() {
        let mut tombstones = Tombstones::new(2);
        tombstones.insert("sbx_1".into(), "a".into());
        tombstones.insert("sbx_2".into(), "b".into());
        tombstones.insert("sbx_3".into(), "a".into());

        assert_eq!(tombstones.len(), 2);
        assert_eq!(tombstones.owner("sbx_1"), None);
        assert_eq!(tombstones.owner("sbx_2"), Some("b"));
        assert_eq!(tombstones.owner("sbx_3"), Some("a"));

        // Reinserting does not count twice.
        tombstones.insert("sbx_3".into(), "a".into());
        assert_eq!(tombstones.len(), 2);
        assert_eq!(tombstones.owner("sbx_2"), Some("b"));
    }
}
