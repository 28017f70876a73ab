use std::collections::HashMap;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use typed_builder::TypedBuilder;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A process to start in the guest.
#[derive(Debug, Clone, TypedBuilder)]
pub struct ProcessSpec {
    /// The shell command line, run with `/bin/sh -c`.
    #[builder(setter(into))]
    pub cmd: String,

    /// The working directory. Defaults to the user's home.
    #[builder(default, setter(strip_option, into))]
    pub cwd: Option<String>,

    /// The guest user to run as.
    #[builder(setter(into))]
    pub user: String,

    /// Extra environment variables.
    #[builder(default)]
    pub envs: HashMap<String, String>,

    /// Whether stdin is kept open for writing.
    #[builder(default)]
    pub stdin: bool,
}

/// A pseudo-terminal session to start in the guest.
#[derive(Debug, Clone, TypedBuilder)]
pub struct PtySpec {
    /// The program to run. Defaults to a login shell.
    #[builder(default = "/bin/sh".to_string(), setter(into))]
    pub cmd: String,

    /// The working directory.
    #[builder(default, setter(strip_option, into))]
    pub cwd: Option<String>,

    /// The guest user to run as.
    #[builder(setter(into))]
    pub user: String,

    /// Extra environment variables.
    #[builder(default)]
    pub envs: HashMap<String, String>,

    /// The initial terminal geometry.
    #[builder(default)]
    pub size: PtySize,
}

/// Terminal geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PtySize {
    /// Rows.
    pub rows: u16,

    /// Columns.
    pub cols: u16,
}

/// A guest process visible to the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    /// The guest pid.
    pub pid: u32,

    /// The command line.
    pub cmd: String,

    /// Whether the process was started through the agent or discovered in the guest.
    pub managed: bool,
}

/// Output or termination of a guest process, in the order the guest produced them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// A chunk of stdout. PTY output arrives here too.
    Stdout(Bytes),

    /// A chunk of stderr.
    Stderr(Bytes),

    /// The process finished. Always the last event.
    Exited(ProcessExit),
}

/// How a guest process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessExit {
    /// The exit code, `128 + signal` when killed by a signal.
    pub exit_code: i32,

    /// The terminating signal, if any.
    pub signal: Option<i32>,
}

/// A started guest process and its event stream.
#[derive(Debug)]
pub struct GuestProcess {
    /// The guest pid.
    pub pid: u32,

    /// Output and exit events.
    pub events: mpsc::UnboundedReceiver<ProcessEvent>,
}

/// Signals the agent can deliver to guest processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuestSignal {
    /// Polite termination.
    Term,

    /// Forced termination.
    Kill,
}

/// The type of a filesystem entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    /// A regular file.
    File,

    /// A directory.
    Dir,

    /// A symbolic link.
    Symlink,
}

/// Metadata about a filesystem entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryInfo {
    /// The final path component.
    pub name: String,

    /// The absolute path.
    pub path: String,

    /// The entry type.
    #[serde(rename = "type")]
    pub kind: EntryKind,

    /// Size in bytes.
    pub size: u64,

    /// Unix permission bits.
    pub mode: u32,

    /// Last modification time.
    pub modified_time: DateTime<Utc>,

    /// Where a symlink points.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub symlink_target: Option<String>,
}

/// What happened to a watched entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilesystemEventKind {
    /// The entry appeared.
    Create,

    /// The entry's content changed.
    Write,

    /// The entry disappeared.
    Remove,

    /// The entry was renamed in place.
    Rename,

    /// The entry's permissions or other metadata changed.
    Chmod,
}

/// A change observed under a watched directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemEvent {
    /// The path relative to the watched directory.
    pub name: String,

    /// What happened.
    #[serde(rename = "type")]
    pub kind: FilesystemEventKind,
}

/// Point-in-time resource usage of a guest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GuestMetrics {
    /// Processes alive in the guest.
    pub process_count: u32,

    /// Summed CPU usage of guest processes, in percent of one core.
    pub cpu_percent: f32,

    /// Summed resident memory of guest processes, in bytes.
    pub memory_bytes: u64,

    /// Bytes used on the sandbox disk, mounts excluded.
    pub disk_used_bytes: u64,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ProcessExit {
    /// Whether the process exited with code zero.
    pub fn success(&self) -> bool {
        self.exit_code == 0 && self.signal.is_none()
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for PtySize {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}
