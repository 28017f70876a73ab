use std::{
    collections::{HashMap, HashSet},
    os::unix::process::ExitStatusExt,
    process::{ExitStatus, Stdio},
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use futures::StreamExt;
use nix::{
    errno::Errno,
    sys::signal::{kill, killpg, Signal},
    unistd::{getpgid, Pid},
};
use sysinfo::{ProcessesToUpdate, System};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    process::{Child, Command},
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tokio_util::io::ReaderStream;

use crate::{
    config::GuestUser,
    guest::{GuestMetrics, GuestProcess, GuestSignal, ProcessEvent, ProcessExit, ProcessInfo, ProcessSpec},
    utils::dir_usage,
    NimbusError, NimbusResult,
};

use super::{agent::Resolved, LocalAgent};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// How long output readers may keep draining after the process itself exited. Background
/// grandchildren can hold the pipes open indefinitely.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(250);

const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

pub(super) type StdinSink = Arc<Mutex<Option<Box<dyn AsyncWrite + Send + Unpin>>>>;

/// Processes started by the agent. Every one of them leads its own process group.
#[derive(Default)]
pub(super) struct ProcessTable {
    pub entries: HashMap<u32, ProcessEntry>,
    pub groups: HashSet<u32>,
}

pub(super) struct ProcessEntry {
    pub cmd: String,
    pub stdin: Option<StdinSink>,
    pub pty: Option<Arc<std::fs::File>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl LocalAgent {
    pub(super) async fn spawn_process(&self, spec: ProcessSpec) -> NimbusResult<GuestProcess> {
        let user = self.user(&spec.user)?.clone();
        let cwd = self.working_dir(&user, spec.cwd.as_deref()).await?;
        let envs = self.process_env(&user, &spec.user, &cwd, &spec.envs).await?;

        let mut command = Command::new("/bin/sh");
        command
            .arg("-c")
            .arg(&spec.cmd)
            .current_dir(&cwd.host)
            .env_clear()
            .envs(envs)
            .stdin(if spec.stdin {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);
        apply_identity(&mut command, &user);

        let mut child = command.spawn()?;
        let pid = child_pid(&child)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let stdin = child.stdin.take().map(|stdin| {
            let writer: Box<dyn AsyncWrite + Send + Unpin> = Box::new(stdin);
            Arc::new(Mutex::new(Some(writer)))
        });
        let readers = [
            spawn_reader(child.stdout.take(), tx.clone(), ProcessEvent::Stdout),
            spawn_reader(child.stderr.take(), tx.clone(), ProcessEvent::Stderr),
        ]
        .into_iter()
        .flatten()
        .collect();

        self.register(
            pid,
            ProcessEntry {
                cmd: spec.cmd.clone(),
                stdin,
                pty: None,
            },
        )
        .await;
        tokio::spawn(wait_for_exit(child, pid, readers, tx, self.processes.clone()));

        tracing::debug!(sandbox_id = %self.sandbox_id(), pid, cmd = %spec.cmd, "spawned guest process");
        Ok(GuestProcess { pid, events: rx })
    }

    pub(super) async fn register(&self, pid: u32, entry: ProcessEntry) {
        let mut table = self.processes.lock().await;
        table.entries.insert(pid, entry);
        table.groups.insert(pid);
    }

    /// Resolves a process working directory, which must exist.
    pub(super) async fn working_dir(
        &self,
        user: &GuestUser,
        cwd: Option<&str>,
    ) -> NimbusResult<Resolved> {
        let home = self.home_of(user);
        let resolved = self.resolve(user, cwd.unwrap_or(&home)).await?;
        match tokio::fs::metadata(&resolved.host).await {
            Ok(meta) if meta.is_dir() => Ok(resolved),
            Ok(_) => Err(NimbusError::InvalidArgument(format!(
                "working directory is not a directory: {}",
                resolved.guest
            ))),
            Err(_) => Err(NimbusError::PathNotFound(resolved.guest)),
        }
    }

    pub(super) async fn process_env(
        &self,
        user: &GuestUser,
        user_name: &str,
        cwd: &Resolved,
        extra: &HashMap<String, String>,
    ) -> NimbusResult<HashMap<String, String>> {
        let home = self.resolve(user, &self.home_of(user)).await?;

        let mut envs = HashMap::from([
            (
                "PATH".to_string(),
                std::env::var("PATH").unwrap_or_else(|_| DEFAULT_PATH.to_string()),
            ),
            ("HOME".to_string(), home.host.display().to_string()),
            ("USER".to_string(), user_name.to_string()),
            ("LOGNAME".to_string(), user_name.to_string()),
            ("PWD".to_string(), cwd.host.display().to_string()),
            (
                "NIMBUS_SANDBOX_ID".to_string(),
                self.sandbox_id().to_string(),
            ),
        ]);
        envs.extend(self.options.envs.clone());
        envs.extend(extra.clone());
        Ok(envs)
    }

    pub(super) async fn send_signal(&self, pid: u32, signal: GuestSignal) -> NimbusResult<()> {
        let sig = match signal {
            GuestSignal::Term => Signal::SIGTERM,
            GuestSignal::Kill => Signal::SIGKILL,
        };

        let table = self.processes.lock().await;
        if table.entries.contains_key(&pid) {
            killpg(Pid::from_raw(pid as i32), sig).map_err(|e| signal_error(e, pid))?;
            if sig == Signal::SIGTERM {
                // A stopped group only sees the SIGTERM once continued.
                let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGCONT);
            }
            return Ok(());
        }

        // Processes the agent did not start are reachable as long as they live in one of the
        // agent's process groups.
        let in_guest = getpgid(Some(Pid::from_raw(pid as i32)))
            .map(|pgid| table.groups.contains(&(pgid.as_raw() as u32)))
            .unwrap_or(false);
        drop(table);

        if !in_guest {
            return Err(NimbusError::ProcessNotFound(pid));
        }

        kill(Pid::from_raw(pid as i32), sig).map_err(|e| signal_error(e, pid))?;
        if sig == Signal::SIGTERM {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGCONT);
        }
        Ok(())
    }

    /// Delivers `signal` to every process group the agent started.
    pub(super) async fn signal_all(&self, signal: Signal) -> NimbusResult<()> {
        let mut table = self.processes.lock().await;
        table.groups.retain(|pgid| {
            match killpg(Pid::from_raw(*pgid as i32), signal) {
                Err(Errno::ESRCH) => false,
                Err(e) => {
                    tracing::warn!(pgid, error = %e, ?signal, "failed to signal process group");
                    true
                }
                Ok(()) => true,
            }
        });

        tracing::debug!(sandbox_id = %self.sandbox_id(), ?signal, groups = table.groups.len(), "signalled guest processes");
        Ok(())
    }

    pub(super) async fn process_list(&self) -> NimbusResult<Vec<ProcessInfo>> {
        let (managed, groups) = {
            let table = self.processes.lock().await;
            let managed = table
                .entries
                .iter()
                .map(|(pid, entry)| (*pid, entry.cmd.clone()))
                .collect::<HashMap<_, _>>();
            (managed, table.groups.clone())
        };

        let mut processes = managed
            .iter()
            .map(|(pid, cmd)| ProcessInfo {
                pid: *pid,
                cmd: cmd.clone(),
                managed: true,
            })
            .collect::<Vec<_>>();

        let discovered = tokio::task::spawn_blocking(move || {
            let mut system = System::new();
            system.refresh_processes(ProcessesToUpdate::All, true);
            system
                .processes()
                .iter()
                .filter_map(|(pid, process)| {
                    let raw = pid.as_u32();
                    if managed.contains_key(&raw) {
                        return None;
                    }

                    let pgid = getpgid(Some(Pid::from_raw(raw as i32))).ok()?;
                    if !groups.contains(&(pgid.as_raw() as u32)) {
                        return None;
                    }

                    let cmd = process
                        .cmd()
                        .iter()
                        .map(|arg| arg.to_string_lossy().into_owned())
                        .collect::<Vec<_>>()
                        .join(" ");
                    Some(ProcessInfo {
                        pid: raw,
                        cmd: if cmd.is_empty() {
                            process.name().to_string_lossy().into_owned()
                        } else {
                            cmd
                        },
                        managed: false,
                    })
                })
                .collect::<Vec<_>>()
        })
        .await?;

        processes.extend(discovered);
        processes.sort_by_key(|p| p.pid);
        Ok(processes)
    }

    pub(super) async fn sample_metrics(&self) -> NimbusResult<GuestMetrics> {
        let groups = self.processes.lock().await.groups.clone();
        let (process_count, cpu_percent, memory_bytes) = tokio::task::spawn_blocking(move || {
            let mut system = System::new();
            system.refresh_processes(ProcessesToUpdate::All, true);
            std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
            system.refresh_processes(ProcessesToUpdate::All, true);

            system
                .processes()
                .iter()
                .filter(|(pid, _)| {
                    getpgid(Some(Pid::from_raw(pid.as_u32() as i32)))
                        .map(|pgid| groups.contains(&(pgid.as_raw() as u32)))
                        .unwrap_or(false)
                })
                .fold((0u32, 0f32, 0u64), |(count, cpu, mem), (_, process)| {
                    (count + 1, cpu + process.cpu_usage(), mem + process.memory())
                })
        })
        .await?;

        let (disk_used_bytes, _) = dir_usage(self.rootfs()).await?;
        Ok(GuestMetrics {
            process_count,
            cpu_percent,
            memory_bytes,
            disk_used_bytes,
        })
    }

    pub(super) async fn stdin_write(&self, pid: u32, data: Bytes) -> NimbusResult<()> {
        let sink = self.stdin_sink(pid).await?;
        let mut sink = sink.lock().await;
        let writer = sink.as_mut().ok_or_else(|| {
            NimbusError::InvalidArgument(format!("stdin of process {pid} is closed"))
        })?;

        writer.write_all(&data).await?;
        writer.flush().await?;
        Ok(())
    }

    pub(super) async fn stdin_close(&self, pid: u32) -> NimbusResult<()> {
        let sink = self.stdin_sink(pid).await?;
        if let Some(mut writer) = sink.lock().await.take() {
            writer.shutdown().await?;
        }
        Ok(())
    }

    async fn stdin_sink(&self, pid: u32) -> NimbusResult<StdinSink> {
        let table = self.processes.lock().await;
        let entry = table
            .entries
            .get(&pid)
            .ok_or(NimbusError::ProcessNotFound(pid))?;
        entry.stdin.clone().ok_or_else(|| {
            NimbusError::InvalidArgument(format!("process {pid} was started without stdin"))
        })
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

pub(super) fn apply_identity(command: &mut Command, user: &GuestUser) {
    if let Some(gid) = user.gid {
        command.gid(gid);
    }
    if let Some(uid) = user.uid {
        command.uid(uid);
    }
}

pub(super) fn child_pid(child: &Child) -> NimbusResult<u32> {
    child
        .id()
        .ok_or_else(|| NimbusError::custom(anyhow::anyhow!("process exited before it was tracked")))
}

/// Forwards everything read from `reader` into the event channel.
pub(super) fn spawn_reader<R>(
    reader: Option<R>,
    tx: mpsc::UnboundedSender<ProcessEvent>,
    wrap: fn(Bytes) -> ProcessEvent,
) -> Option<JoinHandle<()>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let reader = reader?;
    Some(tokio::spawn(async move {
        let mut stream = ReaderStream::new(reader);
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(chunk) => {
                    if tx.send(wrap(chunk)).is_err() {
                        break;
                    }
                }
                // A terminal master reports EIO once the last slave closed.
                Err(_) => break,
            }
        }
    }))
}

/// Waits for the process, lets its output drain, then reports the exit as the final event.
pub(super) async fn wait_for_exit(
    mut child: Child,
    pid: u32,
    readers: Vec<JoinHandle<()>>,
    tx: mpsc::UnboundedSender<ProcessEvent>,
    table: Arc<Mutex<ProcessTable>>,
) {
    let status = child.wait().await;

    for mut reader in readers {
        if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, &mut reader)
            .await
            .is_err()
        {
            reader.abort();
        }
    }

    let exit = match status {
        Ok(status) => exit_of(status),
        Err(e) => {
            tracing::warn!(pid, error = %e, "failed to wait for guest process");
            ProcessExit {
                exit_code: -1,
                signal: None,
            }
        }
    };

    table.lock().await.entries.remove(&pid);
    tracing::debug!(pid, exit_code = exit.exit_code, "guest process exited");
    let _ = tx.send(ProcessEvent::Exited(exit));
}

fn exit_of(status: ExitStatus) -> ProcessExit {
    match (status.code(), status.signal()) {
        (Some(code), _) => ProcessExit {
            exit_code: code,
            signal: None,
        },
        (None, Some(signal)) => ProcessExit {
            exit_code: 128 + signal,
            signal: Some(signal),
        },
        (None, None) => ProcessExit {
            exit_code: -1,
            signal: None,
        },
    }
}

fn signal_error(errno: Errno, pid: u32) -> NimbusError {
    match errno {
        Errno::ESRCH => NimbusError::ProcessNotFound(pid),
        errno => NimbusError::Io(std::io::Error::from(errno)),
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use crate::guest::GuestAgent;

    use super::{super::agent::test_agent, *};

    async fn collect(mut process: GuestProcess) -> (String, String, ProcessExit) {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        while let Some(event) = process.events.recv().await {
            match event {
                ProcessEvent::Stdout(chunk) => stdout.extend_from_slice(&chunk),
                ProcessEvent::Stderr(chunk) => stderr.extend_from_slice(&chunk),
                ProcessEvent::Exited(exit) => {
                    return (
                        String::from_utf8_lossy(&stdout).into_owned(),
                        String::from_utf8_lossy(&stderr).into_owned(),
                        exit,
                    )
                }
            }
        }
        panic!("event stream ended without an exit");
    }

    #[tokio::test]
    async fn test_spawn_captures_output_and_exit_code() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let agent = test_agent(tmp.path()).await?;

        let process = agent
            .spawn(
                ProcessSpec::builder()
                    .cmd("echo hello; echo oops >&2; pwd; exit 3")
                    .user("user")
                    .build(),
            )
            .await?;
        let (stdout, stderr, exit) = collect(process).await;

        assert!(stdout.starts_with("hello\n"));
        assert!(stdout.trim_end().ends_with("rootfs/home/user"));
        assert_eq!(stderr, "oops\n");
        assert_eq!(exit.exit_code, 3);
        assert!(!exit.success());
        Ok(())
    }

    #[tokio::test]
    async fn test_kill_reports_signal() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let agent = test_agent(tmp.path()).await?;

        let process = agent
            .spawn(ProcessSpec::builder().cmd("sleep 30").user("user").build())
            .await?;
        let pid = process.pid;

        let listed = agent.list_processes().await?;
        assert!(listed.iter().any(|p| p.pid == pid && p.managed));

        agent.signal(pid, GuestSignal::Kill).await?;
        let (_, _, exit) = collect(process).await;
        assert_eq!(exit.signal, Some(9));
        assert_eq!(exit.exit_code, 137);

        assert!(matches!(
            agent.signal(pid, GuestSignal::Kill).await,
            Err(NimbusError::ProcessNotFound(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_stdin_round_trip() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let agent = test_agent(tmp.path()).await?;

        let process = agent
            .spawn(
                ProcessSpec::builder()
                    .cmd("cat")
                    .user("user")
                    .stdin(true)
                    .build(),
            )
            .await?;
        agent
            .write_stdin(process.pid, Bytes::from_static(b"ping\n"))
            .await?;
        agent.close_stdin(process.pid).await?;

        let (stdout, _, exit) = collect(process).await;
        assert_eq!(stdout, "ping\n");
        assert!(exit.success());
        Ok(())
    }

    #[tokio::test]
    async fn test_envs_are_passed() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let agent = test_agent(tmp.path()).await?;

        let process = agent
            .spawn(
                ProcessSpec::builder()
                    .cmd("echo $GREETING-$NIMBUS_SANDBOX_ID")
                    .user("user")
                    .envs(HashMap::from([("GREETING".to_string(), "hi".to_string())]))
                    .build(),
            )
            .await?;

        let (stdout, _, _) = collect(process).await;
        assert_eq!(stdout, "hi-sbx_test\n");
        Ok(())
    }
}
