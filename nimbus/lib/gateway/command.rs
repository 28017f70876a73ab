use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use typed_builder::TypedBuilder;

use crate::{
    guest::{GuestAgent, GuestProcess, GuestSignal, ProcessEvent, ProcessExit, ProcessInfo, ProcessSpec},
    NimbusError, NimbusResult,
};

use super::ExecutionGateway;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// How long a handle waits for its process to report an exit after the sandbox was terminated.
const TERMINATION_GRACE: Duration = Duration::from_secs(2);

/// How long a foreground call waits for a killed process to report its exit.
const KILL_GRACE: Duration = Duration::from_secs(2);

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Receives output chunks as the process produces them.
pub type OutputCallback = Arc<dyn Fn(Bytes) + Send + Sync>;

/// How to run a command.
#[derive(Clone, Default, TypedBuilder)]
pub struct CommandOptions {
    /// The working directory.
    #[builder(default, setter(strip_option, into))]
    pub cwd: Option<String>,

    /// The guest user.
    #[builder(default, setter(strip_option, into))]
    pub user: Option<String>,

    /// Extra environment variables.
    #[builder(default)]
    pub envs: HashMap<String, String>,

    /// Foreground calls fail with [`NimbusError::CommandTimeout`] after this long. Background
    /// commands are killed after this long.
    #[builder(default, setter(strip_option))]
    pub timeout: Option<Duration>,

    /// Keep stdin open for [`CommandHandle::send_stdin`].
    #[builder(default)]
    pub stdin: bool,

    /// Live stdout tap.
    #[builder(default, setter(strip_option))]
    pub on_stdout: Option<OutputCallback>,

    /// Live stderr tap.
    #[builder(default, setter(strip_option))]
    pub on_stderr: Option<OutputCallback>,

    /// Cancels a foreground call and kills its process.
    #[builder(default, setter(strip_option))]
    pub cancel: Option<CancellationToken>,
}

/// How a command ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    /// The process exited on its own, successfully or not.
    Exited,

    /// The process was killed through the gateway.
    Killed,

    /// The owning sandbox was terminated.
    Terminated,
}

/// The final outcome of a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    /// The guest pid.
    pub pid: u32,

    /// Everything written to stdout, decoded lossily.
    pub stdout: String,

    /// Everything written to stderr, decoded lossily.
    pub stderr: String,

    /// The exit code. `-1` when the process vanished with the sandbox.
    pub exit_code: i32,

    /// How the command ended.
    pub status: CommandStatus,
}

/// A running or finished command.
///
/// Cloning the handle is cheap; all clones observe the same process.
#[derive(Clone)]
pub struct CommandHandle {
    pid: u32,
    cmd: String,
    pub(super) agent: Arc<dyn GuestAgent>,
    output: Arc<Mutex<Output>>,
    killed: Arc<AtomicBool>,
    done: watch::Receiver<Option<CommandResult>>,
}

/// A chunk fanned out to the live taps.
enum Chunk {
    Stdout(Bytes),
    Stderr(Bytes),
}

#[derive(Default)]
struct Output {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

/// Kills a foreground process if the call is dropped before it finishes.
struct KillOnDrop {
    agent: Arc<dyn GuestAgent>,
    pid: u32,
    armed: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ExecutionGateway {
    /// Runs a command in the foreground and waits for it to finish.
    ///
    /// A non-zero exit is an `Ok` result; call [`CommandResult::check`] to turn it into an
    /// error. Exceeding the command timeout kills the process and fails with
    /// [`NimbusError::CommandTimeout`], leaving the sandbox running.
    pub async fn run(&self, cmd: &str, options: CommandOptions) -> NimbusResult<CommandResult> {
        let timeout = options.timeout;
        let cancel = options.cancel.clone().unwrap_or_default();
        let handle = self.start(cmd, &options).await?;

        let mut guard = KillOnDrop {
            agent: self.agent.clone(),
            pid: handle.pid,
            armed: true,
        };

        let deadline = async {
            match timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending().await,
            }
        };

        let outcome = tokio::select! {
            result = handle.wait() => result,
            _ = deadline => {
                handle.kill().await?;
                let _ = tokio::time::timeout(KILL_GRACE, handle.wait()).await;
                tracing::info!(sandbox_id = %self.sandbox_id, pid = handle.pid, cmd, "command timed out");
                Err(NimbusError::CommandTimeout {
                    command: cmd.to_string(),
                    timeout: timeout.unwrap_or_default(),
                })
            }
            _ = cancel.cancelled() => {
                handle.kill().await?;
                Err(NimbusError::Cancelled)
            }
        };

        guard.armed = false;
        outcome
    }

    /// Starts a command in the background. The handle stays addressable by pid until it is
    /// waited on, killed, the sandbox terminates, or [`FINISHED_HANDLE_RETENTION`] after the
    /// process exits.
    ///
    /// [`FINISHED_HANDLE_RETENTION`]: super::FINISHED_HANDLE_RETENTION
    pub async fn spawn(&self, cmd: &str, options: CommandOptions) -> NimbusResult<CommandHandle> {
        let handle = self.start(cmd, &options).await?;
        self.track(&handle).await;

        if let Some(timeout) = options.timeout {
            let watchdog = handle.clone();
            tokio::spawn(async move {
                if tokio::time::timeout(timeout, watchdog.wait()).await.is_err() {
                    tracing::info!(pid = watchdog.pid, "background command timed out");
                    let _ = watchdog.kill().await;
                }
            });
        }

        Ok(handle)
    }

    /// Reattaches to a background command.
    pub async fn connect(&self, pid: u32) -> NimbusResult<CommandHandle> {
        self.ensure_live()?;
        self.handles
            .lock()
            .await
            .get(&pid)
            .cloned()
            .ok_or(NimbusError::ProcessNotFound(pid))
    }

    /// Waits for a background command and forgets its handle.
    pub async fn wait(&self, pid: u32) -> NimbusResult<CommandResult> {
        let handle = self.connect(pid).await?;
        let result = handle.wait().await?;
        self.handles.lock().await.remove(&pid);
        Ok(result)
    }

    /// Lists guest processes, including ones not started through the gateway.
    pub async fn list_processes(&self) -> NimbusResult<Vec<ProcessInfo>> {
        self.ensure_live()?;
        self.agent.list_processes().await
    }

    /// Kills any guest process by pid.
    pub async fn kill(&self, pid: u32) -> NimbusResult<()> {
        self.ensure_live()?;
        let handle = self.handles.lock().await.remove(&pid);
        match handle {
            Some(handle) => {
                handle.kill().await?;
            }
            None => self.agent.signal(pid, GuestSignal::Kill).await?,
        }
        tracing::info!(sandbox_id = %self.sandbox_id, pid, "killed guest process");
        Ok(())
    }

    /// Writes to the stdin of a process started with stdin enabled.
    pub async fn send_stdin(&self, pid: u32, data: impl Into<Bytes>) -> NimbusResult<()> {
        self.ensure_live()?;
        self.agent.write_stdin(pid, data.into()).await
    }

    /// Closes the stdin of a process.
    pub async fn close_stdin(&self, pid: u32) -> NimbusResult<()> {
        self.ensure_live()?;
        self.agent.close_stdin(pid).await
    }

    async fn start(&self, cmd: &str, options: &CommandOptions) -> NimbusResult<CommandHandle> {
        self.ensure_live()?;
        if cmd.trim().is_empty() {
            return Err(NimbusError::InvalidArgument("command must not be empty".into()));
        }

        let cwd = options
            .cwd
            .clone()
            .or_else(|| self.defaults.get_cwd().clone());
        let spec = ProcessSpec {
            cmd: cmd.to_string(),
            cwd,
            user: self.user_or_default(options.user.as_deref()).to_string(),
            envs: options.envs.clone(),
            stdin: options.stdin,
        };

        let process = self.agent.spawn(spec).await?;
        tracing::debug!(sandbox_id = %self.sandbox_id, pid = process.pid, cmd, "started command");
        Ok(CommandHandle::attach(
            cmd,
            process,
            self.agent.clone(),
            options.on_stdout.clone(),
            options.on_stderr.clone(),
            self.terminated.clone(),
        ))
    }
}

impl CommandHandle {
    /// Starts pumping a process's events.
    ///
    /// One pump task reads the event stream and feeds both the accumulating buffers and, through
    /// an unbounded queue, the live taps. Slow taps never hold the process back and both views
    /// see the bytes in the same order.
    pub(super) fn attach(
        cmd: &str,
        process: GuestProcess,
        agent: Arc<dyn GuestAgent>,
        on_stdout: Option<OutputCallback>,
        on_stderr: Option<OutputCallback>,
        sandbox_gone: CancellationToken,
    ) -> Self {
        let GuestProcess { pid, mut events } = process;
        let output = Arc::new(Mutex::new(Output::default()));
        let killed = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = watch::channel(None);

        let tap = if on_stdout.is_some() || on_stderr.is_some() {
            let (tx, mut rx) = mpsc::unbounded_channel::<Chunk>();
            tokio::spawn(async move {
                while let Some(chunk) = rx.recv().await {
                    match (chunk, &on_stdout, &on_stderr) {
                        (Chunk::Stdout(data), Some(callback), _) => callback(data),
                        (Chunk::Stderr(data), _, Some(callback)) => callback(data),
                        _ => {}
                    }
                }
            });
            Some(tx)
        } else {
            None
        };

        let pump_output = output.clone();
        let pump_killed = killed.clone();
        tokio::spawn(async move {
            let grace = async {
                sandbox_gone.cancelled().await;
                tokio::time::sleep(TERMINATION_GRACE).await;
            };
            tokio::pin!(grace);

            let exit: Option<ProcessExit> = loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(ProcessEvent::Stdout(data)) => {
                            pump_output.lock().await.stdout.extend_from_slice(&data);
                            if let Some(tap) = &tap {
                                let _ = tap.send(Chunk::Stdout(data));
                            }
                        }
                        Some(ProcessEvent::Stderr(data)) => {
                            pump_output.lock().await.stderr.extend_from_slice(&data);
                            if let Some(tap) = &tap {
                                let _ = tap.send(Chunk::Stderr(data));
                            }
                        }
                        Some(ProcessEvent::Exited(exit)) => break Some(exit),
                        None => break None,
                    },
                    _ = &mut grace => break None,
                }
            };

            let status = if sandbox_gone.is_cancelled() || exit.is_none() {
                CommandStatus::Terminated
            } else if pump_killed.load(Ordering::SeqCst) {
                CommandStatus::Killed
            } else {
                CommandStatus::Exited
            };

            let output = pump_output.lock().await;
            let result = CommandResult {
                pid,
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                exit_code: exit.map(|e| e.exit_code).unwrap_or(-1),
                status,
            };
            let _ = done_tx.send(Some(result));
        });

        Self {
            pid,
            cmd: cmd.to_string(),
            agent,
            output,
            killed,
            done: done_rx,
        }
    }

    /// The guest pid.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// The command line.
    pub fn cmd(&self) -> &str {
        &self.cmd
    }

    /// Stdout produced so far.
    pub async fn stdout(&self) -> String {
        String::from_utf8_lossy(&self.output.lock().await.stdout).into_owned()
    }

    /// Stderr produced so far.
    pub async fn stderr(&self) -> String {
        String::from_utf8_lossy(&self.output.lock().await.stderr).into_owned()
    }

    pub(super) fn same_process(&self, other: &CommandHandle) -> bool {
        Arc::ptr_eq(&self.output, &other.output)
    }

    /// The result, if the command has finished.
    pub fn result(&self) -> Option<CommandResult> {
        self.done.borrow().clone()
    }

    /// Waits for the command to finish.
    pub async fn wait(&self) -> NimbusResult<CommandResult> {
        let mut done = self.done.clone();
        let result = done
            .wait_for(|result| result.is_some())
            .await
            .map(|result| result.clone())
            .map_err(|_| NimbusError::custom(anyhow::anyhow!("command pump for pid {} vanished", self.pid)))?;

        result.ok_or_else(|| NimbusError::custom(anyhow::anyhow!("command {} has no result", self.pid)))
    }

    /// Kills the process. Returns false if it had already finished.
    pub async fn kill(&self) -> NimbusResult<bool> {
        if self.result().is_some() {
            return Ok(false);
        }

        self.killed.store(true, Ordering::SeqCst);
        match self.agent.signal(self.pid, GuestSignal::Kill).await {
            Ok(()) => Ok(true),
            // It exited between the check and the signal.
            Err(NimbusError::ProcessNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Writes to the process's stdin.
    pub async fn send_stdin(&self, data: impl Into<Bytes>) -> NimbusResult<()> {
        self.agent.write_stdin(self.pid, data.into()).await
    }

    /// Closes the process's stdin.
    pub async fn close_stdin(&self) -> NimbusResult<()> {
        self.agent.close_stdin(self.pid).await
    }
}

impl CommandResult {
    /// Turns a non-zero exit into [`NimbusError::CommandExit`], keeping the captured output.
    pub fn check(self) -> NimbusResult<Self> {
        if self.exit_code == 0 {
            Ok(self)
        } else {
            Err(NimbusError::CommandExit {
                exit_code: self.exit_code,
                stdout: self.stdout,
                stderr: self.stderr,
            })
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl std::fmt::Debug for CommandHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandHandle")
            .field("pid", &self.pid)
            .field("cmd", &self.cmd)
            .finish()
    }
}

impl Drop for KillOnDrop {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let agent = self.agent.clone();
        let pid = self.pid;
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                tracing::debug!(pid, "foreground call dropped, killing its process");
                let _ = agent.signal(pid, GuestSignal::Kill).await;
            });
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use crate::gateway::test_gateway as gateway;

    use super::*;

    #[tokio::test]
    async fn test_run_captures_output_and_exit_code() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let gateway = gateway(tmp.path()).await?;

        let result = gateway
            .run("echo out; echo err >&2; exit 4", CommandOptions::default())
            .await?;
        assert_eq!(result.stdout, "out\n");
        assert_eq!(result.stderr, "err\n");
        assert_eq!(result.exit_code, 4);
        assert_eq!(result.status, CommandStatus::Exited);

        match result.check() {
            Err(NimbusError::CommandExit {
                exit_code, stdout, ..
            }) => {
                assert_eq!(exit_code, 4);
                assert_eq!(stdout, "out\n");
            }
            other => panic!("expected CommandExit, got {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_tap_sees_the_same_bytes_as_the_buffer() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let gateway = gateway(tmp.path()).await?;

        let streamed = Arc::new(StdMutex::new(Vec::new()));
        let sink = streamed.clone();
        let options = CommandOptions::builder()
            .on_stdout(Arc::new(move |chunk: Bytes| {
                if let Ok(mut streamed) = sink.lock() {
                    streamed.extend_from_slice(&chunk);
                }
            }))
            .build();

        let result = gateway
            .run("for i in 1 2 3 4 5; do echo line-$i; done", options)
            .await?;

        // The tap runs on its own task; give it a moment to drain.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let streamed = streamed.lock().map(|s| s.clone()).unwrap_or_default();
        assert_eq!(String::from_utf8(streamed)?, result.stdout);
        assert_eq!(result.stdout.lines().count(), 5);
        Ok(())
    }

    #[tokio::test]
    async fn test_command_timeout_kills_the_process() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let gateway = gateway(tmp.path()).await?;

        let started = std::time::Instant::now();
        let result = gateway
            .run(
                "sleep 60",
                CommandOptions::builder()
                    .timeout(Duration::from_millis(300))
                    .build(),
            )
            .await;
        assert!(matches!(result, Err(NimbusError::CommandTimeout { .. })));
        assert!(started.elapsed() < Duration::from_secs(10));

        let processes = gateway.list_processes().await?;
        assert!(!processes.iter().any(|p| p.cmd.contains("sleep 60")));
        Ok(())
    }

    #[tokio::test]
    async fn test_cancellation_kills_the_process() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let gateway = gateway(tmp.path()).await?;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let result = gateway
            .run(
                "sleep 60",
                CommandOptions::builder().cancel(cancel).build(),
            )
            .await;
        assert!(matches!(result, Err(NimbusError::Cancelled)));
        Ok(())
    }

    #[tokio::test]
    async fn test_background_handles() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let gateway = gateway(tmp.path()).await?;

        let handle = gateway
            .spawn("read line; echo got-$line", CommandOptions::builder().stdin(true).build())
            .await?;
        assert!(handle.result().is_none());

        gateway.send_stdin(handle.pid(), "hello\n").await?;
        let result = gateway.wait(handle.pid()).await?;
        assert_eq!(result.stdout, "got-hello\n");
        assert!(matches!(
            gateway.connect(handle.pid()).await,
            Err(NimbusError::ProcessNotFound(_))
        ));

        let sleeper = gateway.spawn("sleep 60", CommandOptions::default()).await?;
        assert!(sleeper.kill().await?);
        let result = sleeper.wait().await?;
        assert_eq!(result.status, CommandStatus::Killed);
        assert!(!sleeper.kill().await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_finished_handles_are_pruned_after_retention() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let mut gateway = gateway(tmp.path()).await?;
        gateway.finished_retention = Duration::from_millis(100);

        let handle = gateway.spawn("echo done", CommandOptions::default()).await?;
        handle.wait().await?;

        // Still addressable right after the exit.
        let result = gateway.wait(handle.pid()).await?;
        assert_eq!(result.stdout, "done\n");

        let forgotten = gateway.spawn("true", CommandOptions::default()).await?;
        forgotten.wait().await?;
        assert!(gateway.connect(forgotten.pid()).await.is_ok());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(matches!(
            gateway.connect(forgotten.pid()).await,
            Err(NimbusError::ProcessNotFound(_))
        ));
        assert!(gateway.handles.lock().await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_termination_resolves_background_waits() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let gateway = gateway(tmp.path()).await?;

        let handle = gateway.spawn("sleep 60", CommandOptions::default()).await?;
        gateway.terminate().await;
        gateway.agent().shutdown().await?;

        let result = tokio::time::timeout(Duration::from_secs(5), handle.wait()).await??;
        assert_eq!(result.status, CommandStatus::Terminated);
        assert!(matches!(
            gateway.run("true", CommandOptions::default()).await,
            Err(NimbusError::SandboxNotFound(_))
        ));
        Ok(())
    }
}
