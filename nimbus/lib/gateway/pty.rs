use std::collections::HashMap;

use bytes::Bytes;
use typed_builder::TypedBuilder;

use crate::{
    guest::{PtySize, PtySpec},
    NimbusResult,
};

use super::{CommandHandle, CommandResult, ExecutionGateway, OutputCallback};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// How to open a terminal session.
#[derive(Debug, Clone, TypedBuilder)]
pub struct PtyOptions {
    /// The program to run.
    #[builder(default = "/bin/sh".to_string(), setter(into))]
    pub cmd: String,

    /// The initial geometry.
    #[builder(default)]
    pub size: PtySize,

    /// The guest user. The gateway default when unset.
    #[builder(default, setter(strip_option, into))]
    pub user: Option<String>,

    /// The working directory.
    #[builder(default, setter(strip_option, into))]
    pub cwd: Option<String>,

    /// Extra environment variables.
    #[builder(default)]
    pub envs: HashMap<String, String>,
}

/// An open terminal session.
#[derive(Debug, Clone)]
pub struct PtyHandle {
    command: CommandHandle,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ExecutionGateway {
    /// Opens a terminal session. Terminal output is delivered to `on_data` as it arrives.
    pub async fn create_pty(
        &self,
        options: PtyOptions,
        on_data: OutputCallback,
    ) -> NimbusResult<PtyHandle> {
        self.ensure_live()?;
        let spec = PtySpec {
            cmd: options.cmd,
            cwd: options.cwd.or_else(|| self.defaults.get_cwd().clone()),
            user: self.user_or_default(options.user.as_deref()).to_string(),
            envs: options.envs,
            size: options.size,
        };

        let process = self.agent.open_pty(spec.clone()).await?;
        tracing::debug!(sandbox_id = %self.sandbox_id, pid = process.pid, cmd = %spec.cmd, "opened terminal");

        let command = CommandHandle::attach(
            &spec.cmd,
            process,
            self.agent.clone(),
            Some(on_data),
            None,
            self.terminated.clone(),
        );
        self.track(&command).await;
        Ok(PtyHandle { command })
    }
}

impl PtyHandle {
    /// The pid of the terminal's process.
    pub fn pid(&self) -> u32 {
        self.command.pid()
    }

    /// Sends keystrokes to the terminal.
    pub async fn send_input(&self, data: impl Into<Bytes>) -> NimbusResult<()> {
        self.command.send_stdin(data).await
    }

    /// Changes the terminal geometry.
    pub async fn resize(&self, size: PtySize) -> NimbusResult<()> {
        self.command.agent.resize_pty(self.pid(), size).await
    }

    /// Kills the terminal's process. Returns false if it had already exited.
    pub async fn kill(&self) -> NimbusResult<bool> {
        self.command.kill().await
    }

    /// Waits for the terminal's process to exit. Everything it printed is in the result's stdout.
    pub async fn wait(&self) -> NimbusResult<CommandResult> {
        self.command.wait().await
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use crate::gateway::test_gateway as gateway;

    use super::*;

    #[tokio::test]
    async fn test_pty_echoes_input() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let gateway = gateway(tmp.path()).await?;

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let pty = gateway
            .create_pty(
                PtyOptions::builder()
                    .size(PtySize { rows: 24, cols: 80 })
                    .build(),
                Arc::new(move |data: Bytes| {
                    counter.fetch_add(data.len(), Ordering::SeqCst);
                }),
            )
            .await?;

        pty.resize(PtySize { rows: 40, cols: 120 }).await?;
        pty.send_input("echo pty-$((20 + 22))\nexit\n").await?;

        let result = tokio::time::timeout(Duration::from_secs(10), pty.wait()).await??;
        assert!(result.stdout.contains("pty-42"));

        // The tap drains on its own task; give it a moment to catch up.
        for _ in 0..50 {
            if seen.load(Ordering::SeqCst) >= result.stdout.len() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(seen.load(Ordering::SeqCst), result.stdout.len());
        assert!(!pty.kill().await?);
        Ok(())
    }
}
