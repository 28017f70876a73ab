use std::sync::Arc;

use sqlx::{Pool, Sqlite};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    config::NimbusConfig,
    ledger::ResourceLedger,
    management::{init_db, CATALOG_DB_MIGRATOR},
    orchestration::Orchestrator,
    template::{TemplateBuilder, TemplateStore},
    vm::{LocalVmBackend, VmBackend},
    volume::VolumeStore,
    NimbusResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Everything a nimbus service runs on, wired together from one configuration.
///
/// The context is built once and passed to every entry point. There is no process-wide state.
#[derive(Clone)]
pub struct Nimbus {
    config: Arc<NimbusConfig>,
    pool: Pool<Sqlite>,
    orchestrator: Arc<Orchestrator>,
    templates: TemplateStore,
    builder: TemplateBuilder,
    volumes: VolumeStore,
    sweeper: CancellationToken,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Nimbus {
    /// Opens the catalog under the configured home directory and uses the local VM backend.
    pub async fn new(config: NimbusConfig) -> NimbusResult<Self> {
        let backend = Arc::new(LocalVmBackend::new(
            config.sandboxes_dir(),
            config.get_users().clone(),
        ));
        let build_backend = Arc::new(LocalVmBackend::new(
            config.builds_dir(),
            config.get_users().clone(),
        ));
        Self::with_backends(config, backend, build_backend).await
    }

    /// Like [`new`](Self::new), with the backends sandboxes and template builds boot on.
    pub async fn with_backends(
        config: NimbusConfig,
        backend: Arc<dyn VmBackend>,
        build_backend: Arc<dyn VmBackend>,
    ) -> NimbusResult<Self> {
        config.validate()?;
        tokio::fs::create_dir_all(config.sandboxes_dir()).await?;
        tokio::fs::create_dir_all(config.volumes_dir()).await?;

        let pool = init_db(config.db_path(), &CATALOG_DB_MIGRATOR).await?;
        let templates = TemplateStore::new(pool.clone(), config.templates_dir());
        templates.ensure_base().await?;

        let volumes = VolumeStore::new(pool.clone(), config.volumes_dir());
        let builder = TemplateBuilder::new(templates.clone(), build_backend, &config);
        let ledger = Arc::new(ResourceLedger::new(
            *config.get_default_plan(),
            config.get_team_plans().clone(),
        ));

        let config = Arc::new(config);
        let orchestrator = Arc::new(Orchestrator::new(
            config.clone(),
            ledger,
            templates.clone(),
            volumes.clone(),
            backend,
        ));

        tracing::info!(home = %config.get_home_dir().display(), "nimbus initialized");
        Ok(Self {
            config,
            pool,
            orchestrator,
            templates,
            builder,
            volumes,
            sweeper: CancellationToken::new(),
        })
    }

    /// The configuration.
    pub fn config(&self) -> &NimbusConfig {
        &self.config
    }

    /// The sandbox orchestrator.
    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// The template catalog.
    pub fn templates(&self) -> &TemplateStore {
        &self.templates
    }

    /// The template builder.
    pub fn builder(&self) -> &TemplateBuilder {
        &self.builder
    }

    /// The volume store.
    pub fn volumes(&self) -> &VolumeStore {
        &self.volumes
    }

    /// Starts the expiry sweeper. It runs until [`shutdown`](Self::shutdown).
    pub fn start_sweeper(&self) -> JoinHandle<()> {
        tokio::spawn(
            self.orchestrator
                .clone()
                .run_sweeper(self.sweeper.child_token()),
        )
    }

    /// Stops the sweeper, kills every sandbox and closes the catalog.
    pub async fn shutdown(&self) {
        self.sweeper.cancel();
        self.orchestrator.shutdown().await;
        self.pool.close().await;
        tracing::info!("nimbus shut down");
    }
}
