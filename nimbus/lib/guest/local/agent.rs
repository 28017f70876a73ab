use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr},
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use nimbusutils::{host_path, is_under, resolve_guest_path, strip_guest_prefix};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use typed_builder::TypedBuilder;

use crate::{
    config::{GuestUser, DEFAULT_WORKDIR},
    guest::{
        EntryInfo, FilesystemEvent, GuestAgent, GuestMetrics, GuestProcess, GuestSignal,
        ProcessInfo, ProcessSpec, PtySize, PtySpec,
    },
    utils::ensure_contained,
    NimbusError, NimbusResult,
};

use super::process::ProcessTable;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Options for a [`LocalAgent`].
#[derive(Debug, Clone, TypedBuilder)]
pub struct LocalAgentOptions {
    /// The sandbox id, exported to processes as `NIMBUS_SANDBOX_ID`.
    #[builder(setter(into))]
    pub sandbox_id: String,

    /// The host directory holding the guest root filesystem.
    #[builder(setter(into))]
    pub rootfs: PathBuf,

    /// Guest users and their host identities.
    pub users: HashMap<String, GuestUser>,

    /// Environment every process starts with.
    #[builder(default)]
    pub envs: HashMap<String, String>,

    /// The working directory used when a process names none and the user has no home.
    #[builder(default = DEFAULT_WORKDIR.to_string(), setter(into))]
    pub workdir: String,

    /// The disk allocation enforced on writes through the agent, in bytes.
    #[builder(default, setter(strip_option))]
    pub disk_limit_bytes: Option<u64>,

    /// Host directories attached at guest paths.
    #[builder(default)]
    pub mounts: Vec<(String, PathBuf)>,
}

/// A guest agent running sandbox processes directly on the host.
pub struct LocalAgent {
    pub(super) options: LocalAgentOptions,
    pub(super) mounts: RwLock<Vec<(String, PathBuf)>>,
    pub(super) processes: Arc<Mutex<ProcessTable>>,
    pub(super) watchers: CancellationToken,
}

/// A guest path mapped onto the host.
#[derive(Debug, Clone)]
pub(super) struct Resolved {
    /// The normalized absolute guest path.
    pub guest: String,

    /// The host path.
    pub host: PathBuf,

    /// The host directory the guest path was mapped into.
    pub root: PathBuf,

    /// Whether the path lives on attached storage rather than the sandbox disk.
    pub mounted: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl LocalAgent {
    /// Creates an agent over an existing root filesystem directory.
    pub async fn new(options: LocalAgentOptions) -> NimbusResult<Self> {
        tokio::fs::create_dir_all(&options.rootfs).await?;

        let mut mounts = options.mounts.clone();
        for (guest_path, host_dir) in &mounts {
            prepare_mount(&options.rootfs, guest_path, host_dir).await?;
        }
        sort_mounts(&mut mounts);

        Ok(Self {
            mounts: RwLock::new(mounts),
            processes: Arc::new(Mutex::new(ProcessTable::default())),
            watchers: CancellationToken::new(),
            options,
        })
    }

    /// The sandbox id this agent serves.
    pub fn sandbox_id(&self) -> &str {
        &self.options.sandbox_id
    }

    /// The host directory holding the guest root filesystem.
    pub fn rootfs(&self) -> &Path {
        &self.options.rootfs
    }

    pub(super) fn user(&self, name: &str) -> NimbusResult<&GuestUser> {
        self.options
            .users
            .get(name)
            .ok_or_else(|| NimbusError::InvalidArgument(format!("unknown user: {name}")))
    }

    pub(super) fn home_of(&self, user: &GuestUser) -> String {
        if user.home.is_empty() {
            self.options.workdir.clone()
        } else {
            user.home.clone()
        }
    }

    /// Maps a guest path, relative paths starting at the user's home, onto the host.
    pub(super) async fn resolve(&self, user: &GuestUser, path: &str) -> NimbusResult<Resolved> {
        let guest = resolve_guest_path(path, &self.home_of(user))?;
        let mounts = self.mounts.read().await;

        let (root, relative, mounted) = match mounts
            .iter()
            .find(|(prefix, _)| is_under(&guest, prefix))
        {
            Some((prefix, host_dir)) => (
                host_dir.clone(),
                strip_guest_prefix(&guest, prefix).unwrap_or_default().to_string(),
                true,
            ),
            None => (
                self.options.rootfs.clone(),
                guest.trim_start_matches('/').to_string(),
                false,
            ),
        };

        let host = host_path(&root, &relative);
        let host = ensure_contained(&root, &host).map_err(|e| match e.kind() {
            std::io::ErrorKind::PermissionDenied => NimbusError::PermissionDenied(guest.clone()),
            _ => NimbusError::Io(e),
        })?;

        Ok(Resolved {
            guest,
            host,
            root,
            mounted,
        })
    }

    /// The guest paths that currently have storage attached.
    pub async fn mount_points(&self) -> Vec<String> {
        self.mounts
            .read()
            .await
            .iter()
            .map(|(guest_path, _)| guest_path.clone())
            .collect()
    }
}

impl Resolved {
    /// Whether this path is the root of the sandbox disk or of a mount.
    pub fn is_root(&self) -> bool {
        self.host == self.root
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Longest prefix first, so nested mounts win over their parents.
fn sort_mounts(mounts: &mut [(String, PathBuf)]) {
    mounts.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));
}

async fn prepare_mount(rootfs: &Path, guest_path: &str, host_dir: &Path) -> NimbusResult<()> {
    tokio::fs::create_dir_all(host_dir).await?;
    // The mount point shows up in listings of its parent.
    tokio::fs::create_dir_all(host_path(rootfs, guest_path.trim_start_matches('/'))).await?;
    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl GuestAgent for LocalAgent {
    fn guest_addr(&self) -> IpAddr {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }

    async fn spawn(&self, spec: ProcessSpec) -> NimbusResult<GuestProcess> {
        self.spawn_process(spec).await
    }

    async fn open_pty(&self, spec: PtySpec) -> NimbusResult<GuestProcess> {
        self.spawn_pty(spec).await
    }

    async fn resize_pty(&self, pid: u32, size: PtySize) -> NimbusResult<()> {
        self.resize_terminal(pid, size).await
    }

    async fn list_processes(&self) -> NimbusResult<Vec<ProcessInfo>> {
        self.process_list().await
    }

    async fn signal(&self, pid: u32, signal: GuestSignal) -> NimbusResult<()> {
        self.send_signal(pid, signal).await
    }

    async fn write_stdin(&self, pid: u32, data: Bytes) -> NimbusResult<()> {
        self.stdin_write(pid, data).await
    }

    async fn close_stdin(&self, pid: u32) -> NimbusResult<()> {
        self.stdin_close(pid).await
    }

    async fn read_file(&self, user: &str, path: &str) -> NimbusResult<Bytes> {
        self.fs_read(user, path).await
    }

    async fn read_file_chunks(
        &self,
        user: &str,
        path: &str,
        chunk_size: usize,
    ) -> NimbusResult<BoxStream<'static, NimbusResult<Bytes>>> {
        self.fs_read_chunks(user, path, chunk_size).await
    }

    async fn write_file(&self, user: &str, path: &str, data: Bytes) -> NimbusResult<EntryInfo> {
        self.fs_write(user, path, data).await
    }

    async fn list_dir(&self, user: &str, path: &str, depth: usize) -> NimbusResult<Vec<EntryInfo>> {
        self.fs_list(user, path, depth).await
    }

    async fn stat(&self, user: &str, path: &str) -> NimbusResult<EntryInfo> {
        self.fs_stat(user, path).await
    }

    async fn remove(&self, user: &str, path: &str) -> NimbusResult<()> {
        self.fs_remove(user, path).await
    }

    async fn rename(&self, user: &str, from: &str, to: &str) -> NimbusResult<EntryInfo> {
        self.fs_rename(user, from, to).await
    }

    async fn make_dir(&self, user: &str, path: &str) -> NimbusResult<bool> {
        self.fs_make_dir(user, path).await
    }

    async fn watch_dir(
        &self,
        user: &str,
        path: &str,
        recursive: bool,
        cancel: CancellationToken,
    ) -> NimbusResult<mpsc::Receiver<FilesystemEvent>> {
        self.start_watch(user, path, recursive, cancel).await
    }

    async fn mount(&self, guest_path: &str, host_dir: PathBuf) -> NimbusResult<()> {
        prepare_mount(&self.options.rootfs, guest_path, &host_dir).await?;

        let mut mounts = self.mounts.write().await;
        mounts.retain(|(existing, _)| existing != guest_path);
        mounts.push((guest_path.to_string(), host_dir));
        sort_mounts(&mut mounts);
        Ok(())
    }

    async fn unmount(&self, guest_path: &str) -> NimbusResult<()> {
        self.mounts
            .write()
            .await
            .retain(|(existing, _)| existing != guest_path);
        Ok(())
    }

    async fn metrics(&self) -> NimbusResult<GuestMetrics> {
        self.sample_metrics().await
    }

    async fn pause(&self) -> NimbusResult<()> {
        self.signal_all(nix::sys::signal::Signal::SIGSTOP).await
    }

    async fn resume(&self) -> NimbusResult<()> {
        self.signal_all(nix::sys::signal::Signal::SIGCONT).await
    }

    async fn shutdown(&self) -> NimbusResult<()> {
        self.watchers.cancel();
        self.signal_all(nix::sys::signal::Signal::SIGKILL).await
    }
}

/// Creates an agent over `root/rootfs` with `root/volume` mounted at `/workspace`.
#[cfg(test)]
pub(super) async fn test_agent(root: &Path) -> anyhow::Result<LocalAgent> {
    let users = HashMap::from([(
        "user".to_string(),
        GuestUser::builder().home("/home/user").build(),
    )]);

    let agent = LocalAgent::new(
        LocalAgentOptions::builder()
            .sandbox_id("sbx_test")
            .rootfs(root.join("rootfs"))
            .users(users)
            .mounts(vec![("/workspace".to_string(), root.join("volume"))])
            .build(),
    )
    .await?;
    tokio::fs::create_dir_all(root.join("rootfs/home/user")).await?;
    Ok(agent)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_prefers_mounts() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let agent = test_agent(tmp.path()).await?;
        let user = agent.user("user")?.clone();

        let resolved = agent.resolve(&user, "/workspace/a/b.txt").await?;
        assert!(resolved.mounted);
        assert_eq!(resolved.host, tmp.path().join("volume/a/b.txt"));

        let resolved = agent.resolve(&user, "notes.txt").await?;
        assert!(!resolved.mounted);
        assert_eq!(resolved.guest, "/home/user/notes.txt");
        assert_eq!(resolved.host, tmp.path().join("rootfs/home/user/notes.txt"));

        let resolved = agent.resolve(&user, "/workspacefoo").await?;
        assert!(!resolved.mounted);

        assert!(agent.resolve(&user, "/../../etc/passwd").await.is_err());
        assert!(agent.user("nobody").is_err());
        Ok(())
    }
}
