use std::{collections::HashMap, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use getset::Getters;
use typed_builder::TypedBuilder;

use crate::{guest::GuestAgent, ledger::Resources, network::NetworkPolicy, NimbusResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Everything a backend needs to boot one micro-VM.
#[derive(Debug, Clone, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
pub struct VmSpec {
    /// The sandbox or build id the VM belongs to.
    #[builder(setter(into))]
    id: String,

    /// The immutable template snapshot the root filesystem is cloned from.
    #[builder(setter(into))]
    rootfs_source: PathBuf,

    /// The resource allocation.
    resources: Resources,

    /// Persistent storage attached at guest paths.
    #[builder(default)]
    mounts: Vec<(String, PathBuf)>,

    /// Environment every guest process starts with.
    #[builder(default)]
    envs: HashMap<String, String>,

    /// The working directory processes start in by default.
    #[builder(setter(into))]
    workdir: String,

    /// Egress and ingress rules.
    #[builder(default)]
    network: NetworkPolicy,
}

/// Boots and tears down micro-VMs and hands out their guest agents.
#[async_trait]
pub trait VmBackend: Send + Sync {
    /// Boots a VM and returns its agent once the agent answers.
    async fn provision(&self, spec: VmSpec) -> NimbusResult<Arc<dyn GuestAgent>>;

    /// Copies the VM's root filesystem into `dest` as a new immutable snapshot.
    async fn snapshot(&self, id: &str, dest: PathBuf) -> NimbusResult<()>;

    /// Freezes the VM. Guest memory and disk are preserved.
    async fn pause(&self, id: &str) -> NimbusResult<()>;

    /// Thaws a frozen VM.
    async fn resume(&self, id: &str) -> NimbusResult<()>;

    /// Stops the VM and discards its ephemeral disk. Attached storage is left alone. Destroying
    /// an unknown id succeeds.
    async fn destroy(&self, id: &str) -> NimbusResult<()>;
}
