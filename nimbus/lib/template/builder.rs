use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::Bytes;
use nimbusutils::{resolve_guest_path, retry_idempotent, Backoff};
use typed_builder::TypedBuilder;

use crate::{
    config::{
        NimbusConfig, BASE_TEMPLATE_ALIAS, DEFAULT_BUILD_MEMORY_MIB, DEFAULT_BUILD_VCPUS,
        DEFAULT_DISK_MIB, DEFAULT_GUEST_USER, DEFAULT_WORKDIR,
    },
    guest::{GuestAgent, GuestSignal, ProcessEvent, ProcessSpec},
    ledger::Resources,
    vm::{VmBackend, VmSpec},
    NimbusError, NimbusResult,
};

use super::{
    validate_alias, wait_until_ready, BuildInfo, BuildLogEntry, BuildStatus, BuildStep,
    ImageConfig, LogLevel, ResolvedTemplate, TemplateInfo, TemplateSpec, TemplateStore,
    BASE_TEMPLATE_ID,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// How many trailing log lines a build failure carries.
const FAILURE_LOG_LINES: usize = 20;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Receives build log entries as they are produced.
pub type BuildLogCallback = Arc<dyn Fn(&BuildLogEntry) + Send + Sync>;

/// Options of a single build.
#[derive(Clone, TypedBuilder)]
pub struct BuildOptions {
    /// Resources of the VM the build runs in.
    #[builder(default = Resources {
        vcpus: DEFAULT_BUILD_VCPUS,
        memory_mib: DEFAULT_BUILD_MEMORY_MIB,
        disk_mib: DEFAULT_DISK_MIB,
    })]
    pub resources: Resources,

    /// Rebuild even if a generation with the same spec exists.
    #[builder(default)]
    pub skip_cache: bool,

    /// Called with every log entry.
    #[builder(default, setter(strip_option))]
    pub on_log: Option<BuildLogCallback>,
}

/// Turns template specs into snapshot generations.
///
/// A build boots a VM from the base template, applies the steps through its guest agent,
/// checks the start command's readiness check and snapshots the resulting disk.
#[derive(Clone)]
pub struct TemplateBuilder {
    store: TemplateStore,
    backend: Arc<dyn VmBackend>,
    ready_check_interval: Duration,
    ready_check_timeout: Duration,
    status_retry: Backoff,
}

struct BuildLog {
    store: TemplateStore,
    build_id: String,
    on_log: Option<BuildLogCallback>,
    tail: Mutex<VecDeque<String>>,
}

/// Splits a byte stream into lines.
#[derive(Default)]
struct LineBuffer {
    pending: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl TemplateBuilder {
    /// Creates a builder running build VMs on `backend`.
    pub fn new(store: TemplateStore, backend: Arc<dyn VmBackend>, config: &NimbusConfig) -> Self {
        Self {
            store,
            backend,
            ready_check_interval: config.ready_check_interval(),
            ready_check_timeout: config.ready_check_timeout(),
            status_retry: Backoff::default(),
        }
    }

    /// The catalog builds are recorded in.
    pub fn store(&self) -> &TemplateStore {
        &self.store
    }

    /// Builds a template and waits for the result.
    pub async fn build(
        &self,
        team: &str,
        alias: &str,
        spec: TemplateSpec,
        options: BuildOptions,
    ) -> NimbusResult<TemplateInfo> {
        let (template_id, build_id) = self.prepare(team, alias, &spec).await?;
        self.run(team, &template_id, &build_id, &spec, &options).await?;
        self.store.get(team, &template_id).await
    }

    /// Starts a build and returns right away. Poll [`build_status`](Self::build_status) for the
    /// outcome.
    pub async fn build_in_background(
        &self,
        team: &str,
        alias: &str,
        spec: TemplateSpec,
        options: BuildOptions,
    ) -> NimbusResult<BuildInfo> {
        let (template_id, build_id) = self.prepare(team, alias, &spec).await?;

        let builder = self.clone();
        let team_owned = team.to_string();
        let build = build_id.clone();
        tokio::spawn(async move {
            if let Err(e) = builder
                .run(&team_owned, &template_id, &build, &spec, &options)
                .await
            {
                tracing::warn!(build_id = %build, error = %e, "background template build failed");
            }
        });

        self.store.build_info(team, &build_id, 0).await
    }

    /// The state of a build with its logs from `logs_offset` on.
    pub async fn build_status(
        &self,
        team: &str,
        build_id: &str,
        logs_offset: usize,
    ) -> NimbusResult<BuildInfo> {
        retry_idempotent(self.status_retry, NimbusError::is_transient, || {
            self.store.build_info(team, build_id, logs_offset)
        })
        .await
    }

    /// Validates everything about the request before recording a build.
    async fn prepare(
        &self,
        team: &str,
        alias: &str,
        spec: &TemplateSpec,
    ) -> NimbusResult<(String, String)> {
        validate_alias(alias)?;
        if alias == BASE_TEMPLATE_ALIAS {
            return Err(NimbusError::InvalidArgument(format!(
                "the {BASE_TEMPLATE_ALIAS} alias is reserved"
            )));
        }
        spec.validate()?;

        let template_id = self.store.register(team, alias, spec).await?;
        let build_id = self.store.create_build(&template_id).await?;
        tracing::info!(team, alias, %template_id, %build_id, "started template build");
        Ok((template_id, build_id))
    }

    async fn run(
        &self,
        team: &str,
        template_id: &str,
        build_id: &str,
        spec: &TemplateSpec,
        options: &BuildOptions,
    ) -> NimbusResult<u32> {
        let log = BuildLog {
            store: self.store.clone(),
            build_id: build_id.to_string(),
            on_log: options.on_log.clone(),
            tail: Mutex::new(VecDeque::new()),
        };

        match self.execute(team, template_id, build_id, spec, options, &log).await {
            Ok(generation) => {
                log.write(LogLevel::Info, format!("build finished: generation {generation}"))
                    .await;
                self.store
                    .finish_build(build_id, BuildStatus::Success, Some(generation), None)
                    .await?;
                tracing::info!(%template_id, %build_id, generation, "template build succeeded");
                Ok(generation)
            }
            Err(e) => {
                let message = match &e {
                    NimbusError::TemplateBuildFailed { message, .. } => message.clone(),
                    other => other.to_string(),
                };
                log.write(LogLevel::Error, format!("build failed: {message}")).await;
                self.store
                    .finish_build(build_id, BuildStatus::Failed, None, Some(&message))
                    .await?;

                let staging = self.store.staging_dir(template_id, build_id);
                if staging.exists() {
                    let _ = tokio::fs::remove_dir_all(&staging).await;
                }

                tracing::warn!(%template_id, %build_id, error = %message, "template build failed");
                Err(NimbusError::TemplateBuildFailed {
                    message,
                    logs: log.tail(),
                })
            }
        }
    }

    async fn execute(
        &self,
        team: &str,
        template_id: &str,
        build_id: &str,
        spec: &TemplateSpec,
        options: &BuildOptions,
        log: &BuildLog,
    ) -> NimbusResult<u32> {
        let spec_hash = spec.cache_key()?;
        if !options.skip_cache {
            if let Some(generation) = self.store.cached_generation(template_id, &spec_hash).await? {
                log.write(
                    LogLevel::Info,
                    format!("spec unchanged, reusing generation {generation}"),
                )
                .await;
                self.store
                    .set_current_generation(template_id, generation)
                    .await?;
                return Ok(generation);
            }
        }

        let base = self.resolve_base(team, &spec.from, log).await?;
        let mut config = base.config.clone();
        let vm = VmSpec::builder()
            .id(build_id)
            .rootfs_source(&base.rootfs)
            .resources(options.resources)
            .envs(config.envs.clone())
            .workdir(config.workdir.clone().unwrap_or_else(|| DEFAULT_WORKDIR.to_string()))
            .build();

        log.write(
            LogLevel::Info,
            format!("booting build VM from {} generation {}", base.alias, base.generation),
        )
        .await;
        let staging = self.store.staging_dir(template_id, build_id);
        let result = async {
            let agent = self.backend.provision(vm).await?;
            self.apply_steps(agent.as_ref(), spec, &mut config, log).await?;
            if let Some(start) = &spec.start {
                config.start = Some(start.clone());
            }
            // Snapshot first so nothing the start command does ends up in the template.
            self.backend.snapshot(build_id, staging.clone()).await?;
            self.check_start(agent.as_ref(), &config, log).await
        }
        .await;

        if let Err(e) = self.backend.destroy(build_id).await {
            tracing::warn!(%build_id, error = %e, "failed to tear down build VM");
        }
        if let Err(e) = result {
            let _ = tokio::fs::remove_dir_all(&staging).await;
            return Err(e);
        }

        self.store
            .add_generation(template_id, &spec_hash, build_id, &config, &staging)
            .await
    }

    async fn resolve_base(
        &self,
        team: &str,
        from: &str,
        log: &BuildLog,
    ) -> NimbusResult<ResolvedTemplate> {
        match self.store.resolve(team, from).await {
            Ok(base) => Ok(base),
            Err(NimbusError::TemplateNotFound(_)) => {
                log.write(
                    LogLevel::Warn,
                    format!("{from} is not a built template, building on {BASE_TEMPLATE_ALIAS}"),
                )
                .await;
                self.store.resolve(team, BASE_TEMPLATE_ID).await
            }
            Err(e) => Err(e),
        }
    }

    async fn apply_steps(
        &self,
        agent: &dyn GuestAgent,
        spec: &TemplateSpec,
        config: &mut ImageConfig,
        log: &BuildLog,
    ) -> NimbusResult<()> {
        let total = spec.steps.len();
        for (index, step) in spec.steps.iter().enumerate() {
            let user = config
                .user
                .clone()
                .unwrap_or_else(|| DEFAULT_GUEST_USER.to_string());
            let workdir = config
                .workdir
                .clone()
                .unwrap_or_else(|| DEFAULT_WORKDIR.to_string());
            log.write(
                LogLevel::Info,
                format!("step {}/{total}: {}", index + 1, describe(step)),
            )
            .await;

            match step {
                BuildStep::Run { cmd } => {
                    self.run_command(agent, cmd, &user, &workdir, config, log)
                        .await?
                }
                BuildStep::Install { manager, packages } => {
                    let cmd = manager.install_command(packages);
                    self.run_command(agent, &cmd, &user, &workdir, config, log)
                        .await?
                }
                BuildStep::Copy { dest, content } => {
                    let dest = resolve_guest_path(dest, &workdir)?;
                    agent
                        .write_file(&user, &dest, Bytes::from(content.clone()))
                        .await?;
                }
                BuildStep::MakeDir { path } => {
                    agent
                        .make_dir(&user, &resolve_guest_path(path, &workdir)?)
                        .await?;
                }
                BuildStep::Env { key, value } => {
                    config.envs.insert(key.clone(), value.clone());
                }
                BuildStep::Workdir { path } => {
                    let path = resolve_guest_path(path, &workdir)?;
                    agent.make_dir(&user, &path).await?;
                    config.workdir = Some(path);
                }
                BuildStep::User { name } => config.user = Some(name.clone()),
            }
        }

        Ok(())
    }

    async fn run_command(
        &self,
        agent: &dyn GuestAgent,
        cmd: &str,
        user: &str,
        workdir: &str,
        config: &ImageConfig,
        log: &BuildLog,
    ) -> NimbusResult<()> {
        let mut process = agent
            .spawn(
                ProcessSpec::builder()
                    .cmd(cmd)
                    .cwd(workdir)
                    .user(user)
                    .envs(config.envs.clone())
                    .build(),
            )
            .await?;

        let mut stdout = LineBuffer::default();
        let mut stderr = LineBuffer::default();
        let mut exit = None;
        while let Some(event) = process.events.recv().await {
            match event {
                ProcessEvent::Stdout(chunk) => {
                    for line in stdout.push(&chunk) {
                        log.write(LogLevel::Info, line).await;
                    }
                }
                ProcessEvent::Stderr(chunk) => {
                    for line in stderr.push(&chunk) {
                        log.write(LogLevel::Warn, line).await;
                    }
                }
                ProcessEvent::Exited(status) => exit = Some(status),
            }
        }
        for line in stdout.finish() {
            log.write(LogLevel::Info, line).await;
        }
        for line in stderr.finish() {
            log.write(LogLevel::Warn, line).await;
        }

        match exit {
            Some(status) if status.success() => Ok(()),
            Some(status) => Err(NimbusError::TemplateBuildFailed {
                message: format!("`{cmd}` exited with code {}", status.exit_code),
                logs: log.tail(),
            }),
            None => Err(NimbusError::TemplateBuildFailed {
                message: format!("lost track of `{cmd}`"),
                logs: log.tail(),
            }),
        }
    }

    /// Starts the start command and waits for its readiness check, if it has one.
    async fn check_start(
        &self,
        agent: &dyn GuestAgent,
        config: &ImageConfig,
        log: &BuildLog,
    ) -> NimbusResult<()> {
        let Some(start) = &config.start else {
            return Ok(());
        };
        let Some(readiness) = &start.ready else {
            return Ok(());
        };

        let user = config.user.as_deref().unwrap_or(DEFAULT_GUEST_USER);
        log.write(LogLevel::Info, format!("checking start command `{}`", start.cmd))
            .await;

        let mut process = agent
            .spawn(
                ProcessSpec::builder()
                    .cmd(start.cmd.as_str())
                    .cwd(config.workdir.as_deref().unwrap_or(DEFAULT_WORKDIR))
                    .user(user)
                    .envs(config.envs.clone())
                    .build(),
            )
            .await?;

        let ready = wait_until_ready(
            agent,
            user,
            readiness,
            self.ready_check_interval,
            self.ready_check_timeout,
        );
        tokio::pin!(ready);

        let outcome = loop {
            tokio::select! {
                result = &mut ready => break result.map_err(|_| NimbusError::TemplateBuildFailed {
                    message: format!("start command was not ready within {:?}", self.ready_check_timeout),
                    logs: log.tail(),
                }),
                event = process.events.recv() => match event {
                    Some(ProcessEvent::Stdout(_)) | Some(ProcessEvent::Stderr(_)) => {}
                    Some(ProcessEvent::Exited(status)) => break Err(NimbusError::TemplateBuildFailed {
                        message: format!("start command exited with code {} before it was ready", status.exit_code),
                        logs: log.tail(),
                    }),
                    None => break Err(NimbusError::TemplateBuildFailed {
                        message: "start command exited before it was ready".into(),
                        logs: log.tail(),
                    }),
                },
            }
        };

        let _ = agent.signal(process.pid, GuestSignal::Kill).await;
        if outcome.is_ok() {
            log.write(LogLevel::Info, "start command is ready").await;
        }
        outcome
    }
}

impl BuildLog {
    async fn write(&self, level: LogLevel, message: impl Into<String>) {
        let entry = BuildLogEntry::new(level, message);
        tracing::debug!(build_id = %self.build_id, level = %entry.level, message = %entry.message, "build log");

        if let Err(e) = self.store.append_build_log(&self.build_id, &entry).await {
            tracing::warn!(build_id = %self.build_id, error = %e, "failed to persist build log entry");
        }
        if let Some(on_log) = &self.on_log {
            on_log(&entry);
        }
        if let Ok(mut tail) = self.tail.lock() {
            if tail.len() == FAILURE_LOG_LINES {
                tail.pop_front();
            }
            tail.push_back(entry.message);
        }
    }

    fn tail(&self) -> Vec<String> {
        self.tail
            .lock()
            .map(|tail| tail.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.push_str(&String::from_utf8_lossy(chunk));
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=pos).collect();
            lines.push(line.trim_end_matches(['\n', '\r']).to_string());
        }
        lines
    }

    fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        (!rest.is_empty()).then_some(rest)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn describe(step: &BuildStep) -> String {
    match step {
        BuildStep::Run { cmd } => format!("RUN {cmd}"),
        BuildStep::Install { manager, packages } => {
            format!("INSTALL ({manager:?}) {}", packages.join(" "))
        }
        BuildStep::Copy { dest, content } => format!("COPY {} bytes to {dest}", content.len()),
        BuildStep::MakeDir { path } => format!("MKDIR {path}"),
        BuildStep::Env { key, .. } => format!("ENV {key}"),
        BuildStep::Workdir { path } => format!("WORKDIR {path}"),
        BuildStep::User { name } => format!("USER {name}"),
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use crate::{
        config::GuestUser,
        management::{init_db, CATALOG_DB_MIGRATOR},
        vm::LocalVmBackend,
    };

    use super::*;

    async fn builder(root: &std::path::Path) -> anyhow::Result<TemplateBuilder> {
        let pool = init_db(root.join("nimbus.db"), &CATALOG_DB_MIGRATOR).await?;
        let store = TemplateStore::new(pool, root.join("templates"));
        store.ensure_base().await?;

        let users = HashMap::from([(
            "user".to_string(),
            GuestUser::builder().home("/home/user").build(),
        )]);
        let backend = Arc::new(LocalVmBackend::new(root.join("builds"), users));
        let config = NimbusConfig::builder().home_dir(root).build();
        Ok(TemplateBuilder::new(store, backend, &config))
    }

    #[tokio::test]
    async fn test_build_records_a_generation() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let builder = builder(tmp.path()).await?;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let options = BuildOptions::builder()
            .on_log(Arc::new(move |entry: &BuildLogEntry| {
                if let Ok(mut seen) = sink.lock() {
                    seen.push(entry.message.clone());
                }
            }))
            .build();

        let spec = TemplateSpec::new("python:3.12")
            .step(BuildStep::Env {
                key: "GREETING".into(),
                value: "hello".into(),
            })
            .step(BuildStep::Workdir {
                path: "/home/user/app".into(),
            })
            .step(BuildStep::Copy {
                dest: "main.txt".into(),
                content: "content".into(),
            })
            .step(BuildStep::Run {
                cmd: "echo \"$GREETING\" > out.txt && echo built".into(),
            })
            .start("sleep 30", None);

        let info = builder.build("team", "app", spec.clone(), options).await?;
        assert_eq!(info.generation, Some(1));

        let resolved = builder.store().resolve("team", "app").await?;
        assert_eq!(
            tokio::fs::read_to_string(resolved.rootfs.join("home/user/app/main.txt")).await?,
            "content"
        );
        assert_eq!(
            tokio::fs::read_to_string(resolved.rootfs.join("home/user/app/out.txt")).await?,
            "hello\n"
        );
        assert_eq!(resolved.config.workdir.as_deref(), Some("/home/user/app"));
        assert_eq!(resolved.config.envs.get("GREETING").map(String::as_str), Some("hello"));
        assert_eq!(resolved.config.start.map(|s| s.cmd), Some("sleep 30".into()));

        let seen = seen.lock().map(|s| s.clone()).unwrap_or_default();
        assert!(seen.iter().any(|line| line == "built"));
        assert!(seen.iter().any(|line| line.contains("not a built template")));

        // Same spec reuses the snapshot, skip_cache forces a new generation.
        let cached = builder
            .build("team", "app", spec.clone(), BuildOptions::builder().build())
            .await?;
        assert_eq!(cached.generation, Some(1));
        let rebuilt = builder
            .build("team", "app", spec, BuildOptions::builder().skip_cache(true).build())
            .await?;
        assert_eq!(rebuilt.generation, Some(2));

        // Generation 1 is still intact for sandboxes pinned to it.
        assert!(builder.store().snapshot_dir(&info.template_id, 1).is_dir());
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_build_carries_logs() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let builder = builder(tmp.path()).await?;

        let spec = TemplateSpec::new("base").step(BuildStep::Run {
            cmd: "echo about to fail; exit 3".into(),
        });
        let result = builder
            .build("team", "broken", spec, BuildOptions::builder().build())
            .await;

        match result {
            Err(NimbusError::TemplateBuildFailed { message, logs }) => {
                assert!(message.contains("exited with code 3"));
                assert!(logs.iter().any(|line| line == "about to fail"));
            }
            other => panic!("expected a build failure, got {other:?}"),
        }

        assert!(matches!(
            builder.store().resolve("team", "broken").await,
            Err(NimbusError::TemplateNotFound(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_background_build_can_be_polled() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let builder = builder(tmp.path()).await?;

        let spec = TemplateSpec::new("base").step(BuildStep::MakeDir {
            path: "/srv/data".into(),
        });
        let started = builder
            .build_in_background("team", "bg", spec, BuildOptions::builder().build())
            .await?;

        let mut status = started.status;
        for _ in 0..100 {
            if status != BuildStatus::Building {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
            status = builder.build_status("team", &started.build_id, 0).await?.status;
        }
        assert_eq!(status, BuildStatus::Success);

        let info = builder.build_status("team", &started.build_id, 0).await?;
        assert!(!info.logs.is_empty());
        assert_eq!(info.generation, Some(1));
        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_specs_never_start_a_build() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let builder = builder(tmp.path()).await?;

        let result = builder
            .build("team", "base", TemplateSpec::new("base"), BuildOptions::builder().build())
            .await;
        assert!(matches!(result, Err(NimbusError::InvalidArgument(_))));

        let result = builder
            .build(
                "team",
                "bad",
                TemplateSpec::new("base").step(BuildStep::Run { cmd: "".into() }),
                BuildOptions::builder().build(),
            )
            .await;
        assert!(matches!(result, Err(NimbusError::InvalidArgument(_))));
        assert!(builder.store().get("team", "bad").await.is_err());
        Ok(())
    }
}
