use std::{collections::HashMap, path::PathBuf, sync::Arc};

use bytes::Bytes;
use chrono::Utc;
use nimbusutils::{is_under, normalize_path, RotatingLog, SupportedPathType};
use tokio::sync::{watch, Mutex};

use crate::{
    config::{DEFAULT_GUEST_USER, DEFAULT_WORKDIR},
    gateway::{CommandOptions, ExecutionGateway, GatewayDefaults},
    network::new_traffic_token,
    template::{wait_until_ready, ResolvedTemplate, StartCommand},
    utils::{new_id, IdKind},
    vm::VmSpec,
    NimbusError, NimbusResult,
};

use super::{
    expiry_after, CreateOptions, Lifecycle, Orchestrator, Sandbox, SandboxEntry, SandboxState,
    Status, VolumeAttachment,
};

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Orchestrator {
    /// Creates a sandbox and returns once it is running.
    ///
    /// Requests are validated before anything is reserved: an invalid mount path, network
    /// policy or timeout fails without touching the ledger. Once capacity is reserved, any
    /// failure tears the half-built sandbox down and releases the reservation again.
    pub async fn create(self: &Arc<Self>, team: &str, options: CreateOptions) -> NimbusResult<Sandbox> {
        let mount_path = options
            .volume
            .as_ref()
            .map(|volume| self.validate_mount_path(&volume.mount_path))
            .transpose()?;
        let timeout = self.validate_timeout(options.timeout)?;
        options.network.validate()?;
        if let Some(key) = options.envs.keys().find(|k| k.is_empty() || k.contains('=')) {
            return Err(NimbusError::InvalidArgument(format!(
                "invalid environment variable name {key:?}"
            )));
        }

        let attachment = match (&options.volume, mount_path) {
            (Some(mount), Some(mount_path)) => {
                let volume = self.volumes.get(team, &mount.volume).await?;
                Some(VolumeAttachment {
                    volume_id: volume.id,
                    volume_name: volume.name,
                    mount_path,
                })
            }
            _ => None,
        };

        let template = self.templates.resolve(team, &options.template).await?;
        let resources = options
            .resources
            .unwrap_or(*self.config.get_default_resources());
        let reservation = self.ledger.reserve(team, resources).await?;

        let id = new_id(IdKind::Sandbox);
        let log_path = self.log_path(&id);
        let log = match RotatingLog::new(&log_path).await {
            Ok(log) => log,
            Err(e) => {
                self.ledger.release(&reservation).await;
                return Err(e.into());
            }
        };

        let started_at = Utc::now();
        let (status, _) = watch::channel(Status {
            state: SandboxState::Provisioning,
            expires_at: expiry_after(started_at, timeout)?,
            volume: attachment.clone(),
        });
        let entry = Arc::new(SandboxEntry {
            id: id.clone(),
            team: team.to_string(),
            template_id: template.template_id.clone(),
            alias: template.alias.clone(),
            generation: template.generation,
            resources,
            started_at,
            metadata: options.metadata.clone(),
            network: options.network.clone(),
            domain: self.config.get_domain().clone(),
            traffic_token: new_traffic_token(),
            log_path,
            log: log.writer(),
            status,
            lifecycle: Mutex::new(Lifecycle {
                reservation: Some(reservation),
                log: Some(log),
            }),
            gateway: Default::default(),
        });

        // Nothing else can move the sandbox until it has finished provisioning.
        let mut lifecycle = entry.lifecycle.lock().await;
        self.sandboxes.write().await.insert(id.clone(), entry.clone());
        entry.log.line(format!(
            "[{}] provisioning from {}@{}",
            started_at.to_rfc3339(),
            template.alias,
            template.generation
        ));
        tracing::info!(
            sandbox_id = %id,
            team,
            template = %template.alias,
            generation = template.generation,
            ?resources,
            volume = ?attachment.as_ref().map(|a| &a.volume_id),
            "provisioning sandbox"
        );

        let provisioning_timeout = self.config.provisioning_timeout();
        let provisioned = tokio::time::timeout(
            provisioning_timeout,
            self.provision(&entry, &template, attachment.as_ref(), &options.envs),
        )
        .await
        .unwrap_or_else(|_| Err(NimbusError::ProvisioningTimeout(provisioning_timeout)));

        match provisioned.and_then(|()| expiry_after(Utc::now(), timeout)) {
            Ok(expires_at) => {
                entry.set_expiry(expires_at);
                entry.transition(SandboxState::Running);
                drop(lifecycle);
                Ok(Sandbox::new(self.clone(), entry))
            }
            Err(e) => {
                tracing::warn!(sandbox_id = %id, error = %e, "sandbox failed to start");
                entry.log.line(format!("failed to start: {e}"));
                self.teardown(&entry, &mut lifecycle).await;
                drop(lifecycle);
                self.sandboxes.write().await.remove(&id);
                Err(e)
            }
        }
    }

    /// Checks a requested mount path against the allowed prefixes and returns it normalized.
    pub fn validate_mount_path(&self, mount_path: &str) -> NimbusResult<String> {
        let allowed = self.config.get_allowed_mount_prefixes();
        let invalid = || NimbusError::InvalidMountPath {
            path: mount_path.to_string(),
            allowed: allowed.clone(),
        };

        let normalized =
            normalize_path(mount_path, SupportedPathType::Absolute).map_err(|_| invalid())?;
        if allowed.iter().any(|prefix| is_under(&normalized, prefix)) {
            Ok(normalized)
        } else {
            Err(invalid())
        }
    }

    pub(super) fn log_path(&self, id: &str) -> PathBuf {
        self.config.sandboxes_dir().join(format!("{id}.log"))
    }

    async fn provision(
        &self,
        entry: &SandboxEntry,
        template: &ResolvedTemplate,
        attachment: Option<&VolumeAttachment>,
        extra_envs: &HashMap<String, String>,
    ) -> NimbusResult<()> {
        let config = &template.config;
        let workdir = config.workdir.as_deref().unwrap_or(DEFAULT_WORKDIR);
        let user = config.user.as_deref().unwrap_or(DEFAULT_GUEST_USER);

        let mut envs = config.envs.clone();
        envs.extend(extra_envs.clone());

        let mounts = attachment
            .map(|a| vec![(a.mount_path.clone(), self.volumes.data_dir(&a.volume_id))])
            .unwrap_or_default();

        let agent = self
            .backend
            .provision(
                VmSpec::builder()
                    .id(entry.id.as_str())
                    .rootfs_source(&template.rootfs)
                    .resources(entry.resources)
                    .mounts(mounts)
                    .envs(envs)
                    .workdir(workdir)
                    .network(entry.network.clone())
                    .build(),
            )
            .await?;

        let gateway = Arc::new(ExecutionGateway::new(
            entry.id.as_str(),
            agent,
            GatewayDefaults::builder()
                .user(user)
                .cwd(workdir)
                .read_chunk_size(*self.config.get_read_chunk_size())
                .build(),
        ));
        let _ = entry.gateway.set(gateway.clone());

        if let Some(start) = &config.start {
            self.start(entry, &gateway, start, user).await?;
        }
        Ok(())
    }

    /// Starts the template's start command and waits for its readiness check, if it has one.
    async fn start(
        &self,
        entry: &SandboxEntry,
        gateway: &ExecutionGateway,
        start: &StartCommand,
        user: &str,
    ) -> NimbusResult<()> {
        let stdout = entry.log.clone();
        let stderr = entry.log.clone();
        let handle = gateway
            .spawn(
                &start.cmd,
                CommandOptions::builder()
                    .on_stdout(Arc::new(move |data: Bytes| stdout.append(data.to_vec())))
                    .on_stderr(Arc::new(move |data: Bytes| stderr.append(data.to_vec())))
                    .build(),
            )
            .await?;
        entry
            .log
            .line(format!("started `{}` as pid {}", start.cmd, handle.pid()));

        let Some(readiness) = &start.ready else {
            return Ok(());
        };

        let ready = wait_until_ready(
            gateway.agent().as_ref(),
            user,
            readiness,
            self.config.ready_check_interval(),
            self.config.ready_check_timeout(),
        );

        tokio::select! {
            ready = ready => {
                ready?;
                entry.log.line("start command is ready");
                Ok(())
            }
            result = handle.wait() => {
                let result = result?;
                Err(NimbusError::custom(anyhow::anyhow!(
                    "start command `{}` exited with code {} before it was ready",
                    start.cmd,
                    result.exit_code
                )))
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::{
        config::{NimbusConfig, PlanLimits},
        gateway::CommandOptions,
        ledger::{Resources, TeamUsage},
        orchestration::{test_orchestrator, VolumeMount},
        template::{BuildOptions, ReadinessCheck, TemplateBuilder, TemplateSpec},
        vm::LocalVmBackend,
    };

    use super::*;

    fn config(home: &std::path::Path) -> NimbusConfig {
        NimbusConfig::builder()
            .home_dir(home)
            .ready_check_interval_ms(20)
            .ready_check_timeout_ms(5_000)
            .build()
    }

    #[test_log::test(tokio::test)]
    async fn test_create_runs_commands() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let orchestrator = test_orchestrator(config(tmp.path())).await?;

        let sandbox = orchestrator
            .create(
                "team-a",
                CreateOptions::builder()
                    .envs([("GREETING".to_string(), "hello".to_string())].into())
                    .metadata([("purpose".to_string(), "test".to_string())].into())
                    .build(),
            )
            .await?;

        let info = sandbox.info();
        assert_eq!(info.state, SandboxState::Running);
        assert_eq!(info.alias, "base");
        assert!(info.sandbox_id.starts_with("sbx_"));
        assert!(info.expires_at > Utc::now() + chrono::TimeDelta::seconds(290));

        let result = sandbox
            .gateway()?
            .run("echo $GREETING; pwd", CommandOptions::default())
            .await?;
        assert_eq!(result.exit_code, 0);
        assert!(result.stdout.starts_with("hello\n"));

        assert_eq!(orchestrator.ledger().usage("team-a").await.sandboxes, 1);
        assert!(matches!(
            orchestrator.info("team-b", sandbox.id()).await,
            Err(NimbusError::SandboxNotFound(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_mount_prefixes() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let orchestrator = test_orchestrator(config(tmp.path())).await?;

        for prefix in ["/workspace", "/data", "/mnt", "/volumes"] {
            assert_eq!(
                orchestrator.validate_mount_path(&format!("{prefix}/x"))?,
                format!("{prefix}/x")
            );
        }

        for path in ["/etc/data", "/workspacefoo", "/workspace/../etc", "workspace", "/"] {
            assert!(
                matches!(
                    orchestrator.validate_mount_path(path),
                    Err(NimbusError::InvalidMountPath { .. })
                ),
                "{path} should be rejected"
            );
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_requests_reserve_nothing() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let orchestrator = test_orchestrator(config(tmp.path())).await?;

        let bad_mount = CreateOptions::builder()
            .volume(VolumeMount {
                volume: "data".into(),
                mount_path: "/etc/data".into(),
            })
            .build();
        assert!(matches!(
            orchestrator.create("team", bad_mount).await,
            Err(NimbusError::InvalidMountPath { .. })
        ));

        let missing_volume = CreateOptions::builder()
            .volume(VolumeMount {
                volume: "missing".into(),
                mount_path: "/data".into(),
            })
            .build();
        assert!(matches!(
            orchestrator.create("team", missing_volume).await,
            Err(NimbusError::VolumeNotFound(_))
        ));

        let missing_template = CreateOptions::builder().template("nope").build();
        assert!(matches!(
            orchestrator.create("team", missing_template).await,
            Err(NimbusError::TemplateNotFound(_))
        ));

        let too_long = CreateOptions::builder()
            .timeout(Duration::from_secs(7 * 24 * 60 * 60))
            .build();
        assert!(matches!(
            orchestrator.create("team", too_long).await,
            Err(NimbusError::InvalidArgument(_))
        ));

        assert_eq!(orchestrator.ledger().usage("team").await, TeamUsage::default());
        assert_eq!(orchestrator.ledger().outstanding().await, 0);
        assert!(orchestrator
            .list("team", &Default::default(), None, None)
            .await?
            .items
            .is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_quota_is_enforced() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let orchestrator = test_orchestrator(
            NimbusConfig::builder()
                .home_dir(tmp.path())
                .default_plan(PlanLimits::builder().concurrent_sandboxes(1).build())
                .build(),
        )
        .await?;

        let first = orchestrator.create("team", CreateOptions::builder().build()).await?;
        assert!(matches!(
            orchestrator.create("team", CreateOptions::builder().build()).await,
            Err(NimbusError::QuotaExceeded { .. })
        ));

        // Other teams have their own quota.
        orchestrator.create("other", CreateOptions::builder().build()).await?;

        first.kill().await?;
        orchestrator.create("team", CreateOptions::builder().build()).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_start_command_must_become_ready() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let config = config(tmp.path());
        let orchestrator = test_orchestrator(config.clone()).await?;
        let builder = TemplateBuilder::new(
            orchestrator.templates.clone(),
            Arc::new(LocalVmBackend::new(config.builds_dir(), config.get_users().clone())),
            &config,
        );

        let spec = TemplateSpec::new("base").start(
            "if [ -n \"$FAIL_START\" ]; then exit 3; fi; echo booting; sleep 0.2; touch ready.flag; exec sleep 600",
            Some(ReadinessCheck::File {
                path: "/home/user/ready.flag".into(),
            }),
        );
        builder
            .build("team", "server", spec, BuildOptions::builder().build())
            .await?;

        let sandbox = orchestrator
            .create("team", CreateOptions::builder().template("server").build())
            .await?;
        assert!(sandbox.gateway()?.exists("ready.flag", None).await?);

        // The log is written in the background.
        let mut logs = Vec::new();
        for _ in 0..50 {
            logs = sandbox.logs(None).await?;
            let seen = |needle: &str| logs.iter().any(|line| line.contains(needle));
            if seen("booting") && seen("start command is ready") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(logs.iter().any(|line| line.contains("booting")));
        assert!(logs.iter().any(|line| line.contains("start command is ready")));

        let usage = orchestrator.ledger().usage("team").await;
        let failing = CreateOptions::builder()
            .template("server")
            .envs([("FAIL_START".to_string(), "1".to_string())].into())
            .build();
        assert!(orchestrator.create("team", failing).await.is_err());
        assert_eq!(orchestrator.ledger().usage("team").await, usage);

        let listed = orchestrator
            .list("team", &Default::default(), None, None)
            .await?;
        assert_eq!(listed.items.len(), 1);
        assert_eq!(listed.items[0].sandbox_id, sandbox.id());
        Ok(())
    }

    #[test]
    fn test_default_resources_are_used() {
        let config = NimbusConfig::default();
        assert_eq!(*config.get_default_resources(), Resources::default());
    }
}
