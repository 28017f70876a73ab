use std::{net::IpAddr, path::PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::NimbusResult;

use super::{
    EntryInfo, FilesystemEvent, GuestMetrics, GuestProcess, GuestSignal, ProcessInfo, ProcessSpec,
    PtySize, PtySpec,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The agent running inside a sandbox guest.
///
/// Every file operation takes the guest user it is performed as; implementations must check
/// access with that user's real permissions rather than by filtering paths. Paths are absolute
/// guest paths, or relative to the user's home directory.
#[async_trait]
pub trait GuestAgent: Send + Sync {
    /// The address guest services listen on, as reachable from the host.
    fn guest_addr(&self) -> IpAddr;

    /// Starts a process.
    async fn spawn(&self, spec: ProcessSpec) -> NimbusResult<GuestProcess>;

    /// Starts a process attached to a new pseudo-terminal. Terminal output arrives as
    /// [`ProcessEvent::Stdout`](super::ProcessEvent::Stdout) and input goes through
    /// [`write_stdin`](Self::write_stdin).
    async fn open_pty(&self, spec: PtySpec) -> NimbusResult<GuestProcess>;

    /// Changes the geometry of a pseudo-terminal.
    async fn resize_pty(&self, pid: u32, size: PtySize) -> NimbusResult<()>;

    /// Lists processes in the guest, including ones not started through the agent.
    async fn list_processes(&self) -> NimbusResult<Vec<ProcessInfo>>;

    /// Sends a signal to a guest process.
    async fn signal(&self, pid: u32, signal: GuestSignal) -> NimbusResult<()>;

    /// Writes to the stdin of a process started with stdin enabled, or to a terminal.
    async fn write_stdin(&self, pid: u32, data: Bytes) -> NimbusResult<()>;

    /// Closes the stdin of a process.
    async fn close_stdin(&self, pid: u32) -> NimbusResult<()>;

    /// Reads a whole file.
    async fn read_file(&self, user: &str, path: &str) -> NimbusResult<Bytes>;

    /// Reads a file as a stream of chunks of at most `chunk_size` bytes.
    async fn read_file_chunks(
        &self,
        user: &str,
        path: &str,
        chunk_size: usize,
    ) -> NimbusResult<BoxStream<'static, NimbusResult<Bytes>>>;

    /// Writes a file, creating missing parent directories.
    async fn write_file(&self, user: &str, path: &str, data: Bytes) -> NimbusResult<EntryInfo>;

    /// Lists a directory down to `depth` levels (1 lists only direct children).
    async fn list_dir(&self, user: &str, path: &str, depth: usize) -> NimbusResult<Vec<EntryInfo>>;

    /// Returns metadata about an entry.
    async fn stat(&self, user: &str, path: &str) -> NimbusResult<EntryInfo>;

    /// Removes a file or a directory tree.
    async fn remove(&self, user: &str, path: &str) -> NimbusResult<()>;

    /// Renames an entry.
    async fn rename(&self, user: &str, from: &str, to: &str) -> NimbusResult<EntryInfo>;

    /// Creates a directory and its parents. Returns false if it already existed.
    async fn make_dir(&self, user: &str, path: &str) -> NimbusResult<bool>;

    /// Watches a directory until `cancel` fires or the receiver is dropped.
    async fn watch_dir(
        &self,
        user: &str,
        path: &str,
        recursive: bool,
        cancel: CancellationToken,
    ) -> NimbusResult<mpsc::Receiver<FilesystemEvent>>;

    /// Attaches host storage at a guest path.
    async fn mount(&self, guest_path: &str, host_dir: PathBuf) -> NimbusResult<()>;

    /// Detaches the storage at a guest path, if any.
    async fn unmount(&self, guest_path: &str) -> NimbusResult<()>;

    /// Samples resource usage.
    async fn metrics(&self) -> NimbusResult<GuestMetrics>;

    /// Suspends every guest process.
    async fn pause(&self) -> NimbusResult<()>;

    /// Continues every guest process.
    async fn resume(&self) -> NimbusResult<()>;

    /// Kills every guest process and stops every watcher.
    async fn shutdown(&self) -> NimbusResult<()>;
}
