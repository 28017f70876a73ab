use std::{sync::Arc, time::Duration};

use chrono::Utc;

use crate::{NimbusError, NimbusResult};

use super::{expiry_after, Lifecycle, Orchestrator, Sandbox, SandboxEntry, SandboxInfo, SandboxState};

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Orchestrator {
    /// Reattaches to a running or paused sandbox. The state and the expiry are left alone.
    pub async fn connect(self: &Arc<Self>, team: &str, id: &str) -> NimbusResult<Sandbox> {
        let entry = self.entry(team, id).await?;
        if entry.state() == SandboxState::Provisioning {
            // Returns once the creating call has settled the sandbox one way or the other.
            drop(entry.lifecycle.lock().await);
        }

        match entry.state() {
            SandboxState::Running | SandboxState::Paused => Ok(Sandbox::new(self.clone(), entry)),
            _ => Err(NimbusError::SandboxNotFound(id.to_string())),
        }
    }

    /// Makes the sandbox expire `timeout` from now, replacing the previous expiry.
    pub async fn set_timeout(&self, team: &str, id: &str, timeout: Duration) -> NimbusResult<SandboxInfo> {
        let timeout = self.validate_timeout(Some(timeout))?;
        let entry = self.entry(team, id).await?;

        let _lifecycle = entry.lifecycle.lock().await;
        if !entry.state().is_live() {
            return Err(NimbusError::SandboxNotFound(id.to_string()));
        }

        let expires_at = expiry_after(Utc::now(), timeout)?;
        entry.set_expiry(expires_at);
        tracing::debug!(sandbox_id = %id, %expires_at, "sandbox timeout changed");
        Ok(entry.info())
    }

    /// Freezes a running sandbox.
    ///
    /// CPU and memory go back to the team's quota while the disk stays reserved. Processes are
    /// suspended on a best-effort basis; whether a long-running process survives a pause
    /// depends on the backend. A paused sandbox still expires.
    pub async fn pause(&self, team: &str, id: &str) -> NimbusResult<SandboxInfo> {
        let entry = self.entry(team, id).await?;
        let lifecycle = entry.lifecycle.lock().await;
        match entry.state() {
            SandboxState::Running => {}
            SandboxState::Paused => return Ok(entry.info()),
            SandboxState::Terminated => return Err(NimbusError::SandboxNotFound(id.to_string())),
            state => {
                return Err(NimbusError::InvalidStateTransition {
                    sandbox: id.to_string(),
                    state,
                    action: "pause",
                })
            }
        }

        self.backend.pause(id).await?;
        if let Some(reservation) = &lifecycle.reservation {
            self.ledger.suspend_compute(reservation).await?;
        }
        entry.transition(SandboxState::Paused);
        Ok(entry.info())
    }

    /// Thaws a paused sandbox, optionally giving it a new timeout.
    ///
    /// CPU and memory are admitted through the ledger again, so resuming fails with
    /// [`NimbusError::QuotaExceeded`] if the team has used the capacity in the meantime. The
    /// sandbox then stays paused.
    pub async fn resume(
        &self,
        team: &str,
        id: &str,
        timeout: Option<Duration>,
    ) -> NimbusResult<SandboxInfo> {
        let timeout = timeout.map(|t| self.validate_timeout(Some(t))).transpose()?;
        let entry = self.entry(team, id).await?;
        let lifecycle = entry.lifecycle.lock().await;
        match entry.state() {
            SandboxState::Paused => {}
            SandboxState::Terminated => return Err(NimbusError::SandboxNotFound(id.to_string())),
            state => {
                return Err(NimbusError::InvalidStateTransition {
                    sandbox: id.to_string(),
                    state,
                    action: "resume",
                })
            }
        }

        if let Some(reservation) = &lifecycle.reservation {
            self.ledger.resume_compute(reservation).await?;
        }
        if let Err(e) = self.backend.resume(id).await {
            if let Some(reservation) = &lifecycle.reservation {
                if let Err(e) = self.ledger.suspend_compute(reservation).await {
                    tracing::warn!(sandbox_id = %id, error = %e, "failed to return compute after a failed resume");
                }
            }
            return Err(e);
        }

        if let Some(timeout) = timeout {
            entry.set_expiry(expiry_after(Utc::now(), timeout)?);
        }
        entry.transition(SandboxState::Running);
        Ok(entry.info())
    }

    /// Terminates a sandbox.
    ///
    /// Returns true if this call terminated it and false if it was already terminated. Ids that
    /// never existed, or belong to another team, fail with [`NimbusError::SandboxNotFound`].
    pub async fn kill(&self, team: &str, id: &str) -> NimbusResult<bool> {
        let entry = self
            .sandboxes
            .read()
            .await
            .get(id)
            .filter(|entry| entry.team == team)
            .cloned();

        let Some(entry) = entry else {
            return match self.terminated.read().await.owner(id) {
                Some(owner) if owner == team => Ok(false),
                _ => Err(NimbusError::SandboxNotFound(id.to_string())),
            };
        };

        let mut lifecycle = entry.lifecycle.lock().await;
        if !entry.state().is_live() {
            return Ok(false);
        }

        self.teardown(&entry, &mut lifecycle).await;
        drop(lifecycle);
        self.forget(&entry).await;
        Ok(true)
    }

    /// Terminates every sandbox. Used when the service shuts down.
    pub async fn shutdown(&self) {
        let entries = self
            .sandboxes
            .read()
            .await
            .values()
            .cloned()
            .collect::<Vec<_>>();

        for entry in entries {
            if let Err(e) = self.kill(&entry.team, &entry.id).await {
                tracing::warn!(sandbox_id = %entry.id, error = %e, "failed to kill sandbox on shutdown");
            }
        }
    }

    /// Kills a sandbox if it is still expired once its lifecycle lock is held, so a timeout
    /// extended in the meantime wins over the sweep.
    pub(super) async fn expire(&self, entry: &Arc<SandboxEntry>) -> NimbusResult<bool> {
        let mut lifecycle = entry.lifecycle.lock().await;
        if !entry.is_expired(Utc::now()) {
            return Ok(false);
        }

        entry.log.line(format!("[{}] timeout reached", Utc::now().to_rfc3339()));
        tracing::info!(sandbox_id = %entry.id, "sandbox expired");
        self.teardown(entry, &mut lifecycle).await;
        drop(lifecycle);
        self.forget(entry).await;
        Ok(true)
    }

    /// Releases everything a sandbox holds. Runs at most once per sandbox, with `lifecycle` held.
    ///
    /// Teardown always runs to the end; failures of individual steps are logged.
    pub(super) async fn teardown(&self, entry: &SandboxEntry, lifecycle: &mut Lifecycle) {
        entry.transition(SandboxState::Terminated);

        if let Some(gateway) = entry.gateway.get() {
            gateway.terminate().await;
        }

        if let Err(e) = self.backend.destroy(&entry.id).await {
            tracing::error!(sandbox_id = %entry.id, error = %e, "failed to destroy vm");
        }

        if let Some(reservation) = lifecycle.reservation.take() {
            self.ledger.release(&reservation).await;
        }

        if let Some(volume) = &entry.status().volume {
            if let Err(e) = self.volumes.refresh_stats(&volume.volume_id).await {
                tracing::warn!(volume_id = %volume.volume_id, error = %e, "failed to refresh volume stats");
            }
        }

        // The entry keeps a writer until it is dropped, so the log is not flushed here.
        drop(lifecycle.log.take());
        if let Err(e) = tokio::fs::remove_file(&entry.log_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(sandbox_id = %entry.id, error = %e, "failed to remove sandbox log");
            }
        }
        if let Err(e) = tokio::fs::remove_file(entry.log_path.with_extension("old")).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(sandbox_id = %entry.id, error = %e, "failed to remove rotated sandbox log");
            }
        }

        tracing::info!(sandbox_id = %entry.id, team = %entry.team, "sandbox terminated");
    }

    async fn forget(&self, entry: &SandboxEntry) {
        self.sandboxes.write().await.remove(&entry.id);
        let mut terminated = self.terminated.write().await;
        terminated.insert(entry.id.clone(), entry.team.clone());
        tracing::trace!(tombstones = terminated.len(), "remembered terminated sandbox");
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, time::Duration};

    use tokio_util::sync::CancellationToken;

    use crate::{
        config::{NimbusConfig, PlanLimits},
        gateway::{CommandOptions, CommandStatus},
        ledger::TeamUsage,
        orchestration::{test_orchestrator, CreateOptions},
    };

    use super::*;

    fn config(home: &std::path::Path) -> NimbusConfig {
        NimbusConfig::builder()
            .home_dir(home)
            .sweep_interval_ms(20)
            .build()
    }

    #[tokio::test]
    async fn test_kill_is_idempotent() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let orchestrator = test_orchestrator(config(tmp.path())).await?;
        let sandbox = orchestrator.create("team", CreateOptions::builder().build()).await?;
        let id = sandbox.id().to_string();

        assert!(orchestrator.kill("team", &id).await?);
        assert!(!orchestrator.kill("team", &id).await?);
        assert!(!sandbox.kill().await?);

        assert_eq!(orchestrator.ledger().usage("team").await, TeamUsage::default());
        assert_eq!(orchestrator.ledger().outstanding().await, 0);
        assert!(!tmp.path().join("sandboxes").join(&id).exists());

        assert!(matches!(
            orchestrator.kill("other", &id).await,
            Err(NimbusError::SandboxNotFound(_))
        ));
        assert!(matches!(
            orchestrator.kill("team", "sbx_unknown").await,
            Err(NimbusError::SandboxNotFound(_))
        ));
        assert!(matches!(
            orchestrator.set_timeout("team", &id, Duration::from_secs(60)).await,
            Err(NimbusError::SandboxNotFound(_))
        ));
        assert!(matches!(
            orchestrator.connect("team", &id).await,
            Err(NimbusError::SandboxNotFound(_))
        ));
        assert!(sandbox.gateway().is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_concurrent_kills_release_once() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let orchestrator = test_orchestrator(config(tmp.path())).await?;
        let sandbox = orchestrator.create("team", CreateOptions::builder().build()).await?;

        let kills = (0..8).map(|_| {
            let orchestrator = orchestrator.clone();
            let id = sandbox.id().to_string();
            tokio::spawn(async move { orchestrator.kill("team", &id).await })
        });
        let mut winners = 0;
        for kill in kills {
            if kill.await?? {
                winners += 1;
            }
        }

        assert_eq!(winners, 1);
        assert_eq!(orchestrator.ledger().usage("team").await, TeamUsage::default());
        Ok(())
    }

    #[tokio::test]
    async fn test_expiry_and_timeout_extension() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let orchestrator = test_orchestrator(config(tmp.path())).await?;
        let sweeper = CancellationToken::new();
        tokio::spawn(orchestrator.clone().run_sweeper(sweeper.clone()));

        let short = orchestrator
            .create(
                "team",
                CreateOptions::builder().timeout(Duration::from_secs(1)).build(),
            )
            .await?;
        let extended = orchestrator
            .create(
                "team",
                CreateOptions::builder().timeout(Duration::from_secs(1)).build(),
            )
            .await?;

        let before = Utc::now();
        let info = extended.set_timeout(Duration::from_secs(30)).await?;
        let expected = before + chrono::TimeDelta::seconds(30);
        assert!((info.expires_at - expected).num_milliseconds().abs() < 1_000);
        assert_eq!(orchestrator.info("team", extended.id()).await?.expires_at, info.expires_at);

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert!(matches!(
            orchestrator.info("team", short.id()).await,
            Err(NimbusError::SandboxNotFound(_))
        ));
        assert!(!short.kill().await?);
        assert_eq!(extended.state(), SandboxState::Running);
        assert_eq!(orchestrator.ledger().usage("team").await.sandboxes, 1);

        sweeper.cancel();
        Ok(())
    }

    #[tokio::test]
    async fn test_sweep_kills_each_sandbox_once() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let orchestrator = test_orchestrator(config(tmp.path())).await?;
        orchestrator
            .create(
                "team",
                CreateOptions::builder().timeout(Duration::from_secs(1)).build(),
            )
            .await?;

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        let (a, b) = tokio::join!(orchestrator.sweep_expired(), orchestrator.sweep_expired());
        assert_eq!(a + b, 1);
        assert_eq!(orchestrator.sweep_expired().await, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_pause_returns_compute_but_keeps_disk() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let orchestrator = test_orchestrator(
            NimbusConfig::builder()
                .home_dir(tmp.path())
                .default_plan(PlanLimits::builder().concurrent_sandboxes(1).build())
                .build(),
        )
        .await?;

        let sandbox = orchestrator.create("team", CreateOptions::builder().build()).await?;
        let gateway = sandbox.gateway()?;
        gateway.write("state.txt", "kept", None).await?;
        let running = orchestrator.ledger().usage("team").await;

        let info = sandbox.pause().await?;
        assert_eq!(info.state, SandboxState::Paused);
        let paused = orchestrator.ledger().usage("team").await;
        assert_eq!(paused.vcpus, 0);
        assert_eq!(paused.sandboxes, 0);
        assert_eq!(paused.disk_mib, running.disk_mib);
        assert!(matches!(
            sandbox.gateway(),
            Err(NimbusError::InvalidStateTransition { .. })
        ));

        // Connecting does not resume.
        let connected = orchestrator.connect("team", sandbox.id()).await?;
        assert_eq!(connected.state(), SandboxState::Paused);

        // The freed compute can be used by another sandbox, which then blocks the resume.
        let other = orchestrator.create("team", CreateOptions::builder().build()).await?;
        assert!(matches!(
            sandbox.resume(None).await,
            Err(NimbusError::QuotaExceeded { .. })
        ));
        assert_eq!(sandbox.state(), SandboxState::Paused);
        other.kill().await?;

        let info = sandbox.resume(Some(Duration::from_secs(120))).await?;
        assert_eq!(info.state, SandboxState::Running);
        assert_eq!(orchestrator.ledger().usage("team").await, running);
        assert_eq!(sandbox.gateway()?.read_text("state.txt", None).await?, "kept");

        assert!(matches!(
            sandbox.resume(None).await,
            Err(NimbusError::InvalidStateTransition { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_command_timeout_leaves_sandbox_running() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let orchestrator = test_orchestrator(config(tmp.path())).await?;
        let sandbox = orchestrator
            .create(
                "team",
                CreateOptions::builder().timeout(Duration::from_secs(5)).build(),
            )
            .await?;

        let outcome = sandbox
            .gateway()?
            .run(
                "sleep 60",
                CommandOptions::builder()
                    .timeout(Duration::from_secs(2))
                    .build(),
            )
            .await;
        assert!(matches!(outcome, Err(NimbusError::CommandTimeout { .. })));
        assert_eq!(
            orchestrator.info("team", sandbox.id()).await?.state,
            SandboxState::Running
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_kill_resolves_background_waits() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let orchestrator = test_orchestrator(config(tmp.path())).await?;
        let sandbox = orchestrator.create("team", CreateOptions::builder().build()).await?;

        let handle = sandbox
            .gateway()?
            .spawn("sleep 600", CommandOptions::default())
            .await?;
        sandbox.kill().await?;

        let result = tokio::time::timeout(Duration::from_secs(5), handle.wait()).await??;
        assert_eq!(result.status, CommandStatus::Terminated);
        Ok(())
    }

    #[tokio::test]
    async fn test_list_filters_by_metadata() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let orchestrator = test_orchestrator(config(tmp.path())).await?;

        for i in 0..5 {
            let parity = if i % 2 == 0 { "even" } else { "odd" };
            orchestrator
                .create(
                    "team",
                    CreateOptions::builder()
                        .metadata(HashMap::from([("parity".to_string(), parity.to_string())]))
                        .build(),
                )
                .await?;
        }
        orchestrator.create("other", CreateOptions::builder().build()).await?;

        let even = HashMap::from([("parity".to_string(), "even".to_string())]);
        let first = orchestrator.list("team", &even, Some(2), None).await?;
        assert_eq!(first.items.len(), 2);
        let rest = orchestrator
            .list("team", &even, Some(2), first.next_token.as_deref())
            .await?;
        assert_eq!(rest.items.len(), 1);
        assert!(rest.next_token.is_none());

        use futures::TryStreamExt;
        let all = orchestrator
            .stream("team", &HashMap::new(), 2)
            .try_collect::<Vec<_>>()
            .await?;
        assert_eq!(all.len(), 5);
        assert!(all.windows(2).all(|w| w[0].started_at <= w[1].started_at));
        Ok(())
    }
}
