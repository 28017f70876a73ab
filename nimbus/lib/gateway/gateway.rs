use std::{collections::HashMap, sync::Arc, time::Duration};

use getset::Getters;
use nimbusutils::Backoff;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use typed_builder::TypedBuilder;

use crate::{
    config::{DEFAULT_GUEST_USER, DEFAULT_READ_CHUNK_SIZE},
    guest::GuestAgent,
    NimbusError, NimbusResult,
};

use super::CommandHandle;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// How long a finished background command stays addressable by pid.
pub const FINISHED_HANDLE_RETENTION: Duration = Duration::from_secs(60);

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Settings a gateway applies when a request leaves them out.
#[derive(Debug, Clone, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
pub struct GatewayDefaults {
    /// The guest user requests run as.
    #[builder(default = DEFAULT_GUEST_USER.to_string(), setter(into))]
    user: String,

    /// The working directory commands start in. The user's home when unset.
    #[builder(default, setter(strip_option, into))]
    cwd: Option<String>,

    /// The chunk size of streamed file reads.
    #[builder(default = DEFAULT_READ_CHUNK_SIZE)]
    read_chunk_size: usize,
}

/// Routes commands, file operations and terminals into one sandbox's guest agent.
///
/// One gateway exists per running sandbox. Once [`terminate`](Self::terminate) is called every
/// operation fails with [`NimbusError::SandboxNotFound`], background commands resolve with a
/// terminated status and directory watches stop.
pub struct ExecutionGateway {
    pub(super) sandbox_id: String,
    pub(super) agent: Arc<dyn GuestAgent>,
    pub(super) defaults: GatewayDefaults,
    pub(super) handles: Arc<Mutex<HashMap<u32, CommandHandle>>>,
    pub(super) finished_retention: Duration,
    pub(super) terminated: CancellationToken,
    pub(super) read_retry: Backoff,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ExecutionGateway {
    /// Creates a gateway over a sandbox's agent.
    pub fn new(
        sandbox_id: impl Into<String>,
        agent: Arc<dyn GuestAgent>,
        defaults: GatewayDefaults,
    ) -> Self {
        Self {
            sandbox_id: sandbox_id.into(),
            agent,
            defaults,
            handles: Arc::new(Mutex::new(HashMap::new())),
            finished_retention: FINISHED_HANDLE_RETENTION,
            terminated: CancellationToken::new(),
            read_retry: Backoff::default(),
        }
    }

    /// The sandbox this gateway serves.
    pub fn sandbox_id(&self) -> &str {
        &self.sandbox_id
    }

    /// The guest agent behind the gateway.
    pub fn agent(&self) -> &Arc<dyn GuestAgent> {
        &self.agent
    }

    /// Whether the sandbox has been terminated.
    pub fn is_terminated(&self) -> bool {
        self.terminated.is_cancelled()
    }

    /// Marks the sandbox terminated.
    ///
    /// Background handles observe the termination and resolve once their processes are gone.
    /// The caller is expected to shut the agent down, which kills the processes themselves.
    pub async fn terminate(&self) {
        self.terminated.cancel();
        let handles = std::mem::take(&mut *self.handles.lock().await);
        tracing::debug!(
            sandbox_id = %self.sandbox_id,
            background = handles.len(),
            "terminated execution gateway"
        );
    }

    /// Makes `handle` addressable by pid until it is waited on, killed, or has been finished for
    /// longer than the retention period.
    pub(super) async fn track(&self, handle: &CommandHandle) {
        self.handles.lock().await.insert(handle.pid(), handle.clone());

        let handles = Arc::downgrade(&self.handles);
        let finished = handle.clone();
        let retention = self.finished_retention;
        tokio::spawn(async move {
            if finished.wait().await.is_ok() {
                tokio::time::sleep(retention).await;
            }
            let Some(handles) = handles.upgrade() else {
                return;
            };

            // The pid may have been reused by a newer command.
            let mut handles = handles.lock().await;
            if handles
                .get(&finished.pid())
                .is_some_and(|current| current.same_process(&finished))
            {
                handles.remove(&finished.pid());
                tracing::trace!(pid = finished.pid(), "pruned finished command handle");
            }
        });
    }

    pub(super) fn ensure_live(&self) -> NimbusResult<()> {
        if self.is_terminated() {
            Err(NimbusError::SandboxNotFound(self.sandbox_id.clone()))
        } else {
            Ok(())
        }
    }

    pub(super) fn user_or_default<'a>(&'a self, user: Option<&'a str>) -> &'a str {
        user.unwrap_or(&self.defaults.user)
    }
}

/// Creates a gateway over a local agent rooted at `root/rootfs`, with `root/volume` mounted at
/// `/workspace`.
#[cfg(test)]
pub(crate) async fn test_gateway(root: &std::path::Path) -> anyhow::Result<ExecutionGateway> {
    use crate::{
        config::GuestUser,
        guest::local::{LocalAgent, LocalAgentOptions},
    };

    let rootfs = root.join("rootfs");
    tokio::fs::create_dir_all(rootfs.join("home/user")).await?;
    let users = HashMap::from([(
        "user".to_string(),
        GuestUser::builder().home("/home/user").build(),
    )]);

    let agent = LocalAgent::new(
        LocalAgentOptions::builder()
            .sandbox_id("sbx_gateway")
            .rootfs(rootfs)
            .users(users)
            .mounts(vec![("/workspace".to_string(), root.join("volume"))])
            .build(),
    )
    .await?;

    Ok(ExecutionGateway::new(
        "sbx_gateway",
        Arc::new(agent),
        GatewayDefaults::builder().build(),
    ))
}
