use std::{io, os::fd::AsRawFd, sync::Arc};

use nix::pty::{openpty, OpenptyResult, Winsize};
use tokio::{
    io::AsyncWrite,
    process::Command,
    sync::{mpsc, Mutex},
};

use crate::{
    guest::{GuestProcess, ProcessEvent, PtySize, PtySpec},
    NimbusError, NimbusResult,
};

use super::{
    process::{apply_identity, child_pid, spawn_reader, wait_for_exit, ProcessEntry},
    LocalAgent,
};

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl LocalAgent {
    pub(super) async fn spawn_pty(&self, spec: PtySpec) -> NimbusResult<GuestProcess> {
        let user = self.user(&spec.user)?.clone();
        let cwd = self.working_dir(&user, spec.cwd.as_deref()).await?;
        let mut envs = self.process_env(&user, &spec.user, &cwd, &spec.envs).await?;
        envs.entry("TERM".to_string())
            .or_insert_with(|| "xterm-256color".to_string());

        let OpenptyResult { master, slave } =
            openpty(Some(&winsize(spec.size)), None).map_err(io::Error::from)?;

        let child = {
            let mut command = Command::new("/bin/sh");
            command
                .arg("-c")
                .arg(format!("exec {}", spec.cmd))
                .current_dir(&cwd.host)
                .env_clear()
                .envs(envs)
                .stdin(slave.try_clone()?)
                .stdout(slave.try_clone()?)
                .stderr(slave);
            apply_identity(&mut command, &user);

            // SAFETY: only async-signal-safe calls run between fork and exec.
            unsafe {
                command.pre_exec(|| {
                    nix::unistd::setsid().map_err(io::Error::from)?;
                    if libc::ioctl(0, libc::TIOCSCTTY as _, 0) < 0 {
                        return Err(io::Error::last_os_error());
                    }
                    Ok(())
                });
            }

            // The command owns our copies of the slave side. Dropping it here lets the master see
            // EOF once the guest side closes.
            command.spawn()?
        };
        let pid = child_pid(&child)?;

        let master = std::fs::File::from(master);
        let resize = Arc::new(master.try_clone()?);
        let writer: Box<dyn AsyncWrite + Send + Unpin> =
            Box::new(tokio::fs::File::from_std(master.try_clone()?));
        let reader = tokio::fs::File::from_std(master);

        let (tx, rx) = mpsc::unbounded_channel();
        let readers = spawn_reader(Some(reader), tx.clone(), ProcessEvent::Stdout)
            .into_iter()
            .collect();

        self.register(
            pid,
            ProcessEntry {
                cmd: spec.cmd.clone(),
                stdin: Some(Arc::new(Mutex::new(Some(writer)))),
                pty: Some(resize),
            },
        )
        .await;
        tokio::spawn(wait_for_exit(child, pid, readers, tx, self.processes.clone()));

        tracing::debug!(sandbox_id = %self.sandbox_id(), pid, rows = spec.size.rows, cols = spec.size.cols, "opened guest terminal");
        Ok(GuestProcess { pid, events: rx })
    }

    pub(super) async fn resize_terminal(&self, pid: u32, size: PtySize) -> NimbusResult<()> {
        let table = self.processes.lock().await;
        let entry = table
            .entries
            .get(&pid)
            .ok_or(NimbusError::ProcessNotFound(pid))?;
        let master = entry.pty.as_ref().ok_or_else(|| {
            NimbusError::InvalidArgument(format!("process {pid} has no terminal"))
        })?;

        let ws = winsize(size);
        // SAFETY: the fd is a live terminal master owned by `master` and `ws` outlives the call.
        let rc = unsafe { libc::ioctl(master.as_raw_fd(), libc::TIOCSWINSZ as _, &ws) };
        if rc < 0 {
            return Err(io::Error::last_os_error().into());
        }

        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn winsize(size: PtySize) -> Winsize {
    Winsize {
        ws_row: size.rows,
        ws_col: size.cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use crate::guest::GuestAgent;

    use super::{super::agent::test_agent, *};

    #[tokio::test]
    async fn test_pty_echoes_input_and_resizes() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let agent = test_agent(tmp.path()).await?;

        let mut process = agent
            .open_pty(
                PtySpec::builder()
                    .cmd("/bin/sh -c 'read line; echo got:$line'")
                    .user("user")
                    .build(),
            )
            .await?;

        agent
            .resize_pty(process.pid, PtySize { rows: 40, cols: 120 })
            .await?;
        agent
            .write_stdin(process.pid, Bytes::from_static(b"hello\n"))
            .await?;

        let mut output = Vec::new();
        let mut exit = None;
        while let Some(event) = process.events.recv().await {
            match event {
                ProcessEvent::Stdout(chunk) => output.extend_from_slice(&chunk),
                ProcessEvent::Exited(e) => {
                    exit = Some(e);
                    break;
                }
                ProcessEvent::Stderr(_) => {}
            }
        }

        assert!(String::from_utf8_lossy(&output).contains("got:hello"));
        assert_eq!(exit.map(|e| e.exit_code), Some(0));
        Ok(())
    }
}
