use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{
    config::GuestUser,
    guest::{
        local::{LocalAgent, LocalAgentOptions},
        GuestAgent,
    },
    utils::{copy_dir, ROOTFS_SUBDIR},
    NimbusError, NimbusResult,
};

use super::{VmBackend, VmSpec};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A backend that "boots" a VM by cloning the template snapshot into a directory and serving it
/// with a [`LocalAgent`].
///
/// Network policies are recorded but not enforced.
pub struct LocalVmBackend {
    root: PathBuf,
    users: HashMap<String, GuestUser>,
    vms: Mutex<HashMap<String, Arc<LocalAgent>>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl LocalVmBackend {
    /// Creates a backend keeping VM disks under `root`.
    pub fn new(root: impl Into<PathBuf>, users: HashMap<String, GuestUser>) -> Self {
        Self {
            root: root.into(),
            users,
            vms: Mutex::new(HashMap::new()),
        }
    }

    /// The directory holding the VM's ephemeral state.
    pub fn vm_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    async fn agent(&self, id: &str) -> NimbusResult<Arc<LocalAgent>> {
        self.vms
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| NimbusError::SandboxNotFound(id.to_string()))
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl VmBackend for LocalVmBackend {
    async fn provision(&self, spec: VmSpec) -> NimbusResult<Arc<dyn GuestAgent>> {
        let rootfs = self.vm_dir(spec.get_id()).join(ROOTFS_SUBDIR);
        copy_dir(spec.get_rootfs_source(), &rootfs).await?;

        let disk_limit_bytes = spec.get_resources().disk_mib.saturating_mul(1024 * 1024);
        let agent = LocalAgent::new(
            LocalAgentOptions::builder()
                .sandbox_id(spec.get_id())
                .rootfs(rootfs)
                .users(self.users.clone())
                .envs(spec.get_envs().clone())
                .workdir(spec.get_workdir())
                .disk_limit_bytes(disk_limit_bytes)
                .mounts(spec.get_mounts().clone())
                .build(),
        )
        .await?;

        let agent = Arc::new(agent);
        self.vms
            .lock()
            .await
            .insert(spec.get_id().clone(), agent.clone());

        tracing::info!(vm = %spec.get_id(), resources = ?spec.get_resources(), "provisioned local vm");
        Ok(agent)
    }

    async fn snapshot(&self, id: &str, dest: PathBuf) -> NimbusResult<()> {
        let agent = self.agent(id).await?;
        copy_dir(agent.rootfs(), dest).await
    }

    async fn pause(&self, id: &str) -> NimbusResult<()> {
        self.agent(id).await?.pause().await
    }

    async fn resume(&self, id: &str) -> NimbusResult<()> {
        self.agent(id).await?.resume().await
    }

    async fn destroy(&self, id: &str) -> NimbusResult<()> {
        let agent = self.vms.lock().await.remove(id);
        if let Some(agent) = agent {
            agent.shutdown().await?;
        }

        remove_dir_if_exists(&self.vm_dir(id)).await?;
        tracing::info!(vm = %id, "destroyed local vm");
        Ok(())
    }
}

async fn remove_dir_if_exists(path: &Path) -> NimbusResult<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
