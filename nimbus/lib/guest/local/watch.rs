use std::path::Path;

use notify::{
    event::{ModifyKind, RenameMode},
    Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    guest::{FilesystemEvent, FilesystemEventKind},
    NimbusError, NimbusResult,
};

use super::LocalAgent;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const WATCH_CHANNEL_CAPACITY: usize = 256;

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl LocalAgent {
    pub(super) async fn start_watch(
        &self,
        user: &str,
        path: &str,
        recursive: bool,
        cancel: CancellationToken,
    ) -> NimbusResult<mpsc::Receiver<FilesystemEvent>> {
        let (_, resolved) = self.resolve_for(user, path).await?;
        match tokio::fs::metadata(&resolved.host).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(NimbusError::InvalidArgument(format!(
                    "{} is not a directory",
                    resolved.guest
                )))
            }
            Err(_) => return Err(NimbusError::PathNotFound(resolved.guest)),
        }

        // Kernel events carry the path the watch was registered with.
        let root = tokio::fs::canonicalize(&resolved.host).await?;
        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<Event>();
        let mut watcher: RecommendedWatcher =
            notify::recommended_watcher(move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    let _ = raw_tx.send(event);
                }
                Err(e) => tracing::warn!(error = %e, "directory watch error"),
            })?;
        let mode = if recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        watcher.watch(&root, mode)?;

        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let shutdown = self.watchers.clone();
        let sandbox_id = self.sandbox_id().to_string();

        tokio::spawn(async move {
            tracing::debug!(sandbox_id, path = %resolved.guest, recursive, "watch started");
            'watch: loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = shutdown.cancelled() => break,
                    _ = tx.closed() => break,
                    event = raw_rx.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };

                for event in translate(&root, &event) {
                    // Kernel events queue up in the unbounded bridge, so a slow consumer never
                    // holds up the guest.
                    tokio::select! {
                        _ = cancel.cancelled() => break 'watch,
                        _ = shutdown.cancelled() => break 'watch,
                        sent = tx.send(event) => if sent.is_err() { break 'watch },
                    }
                }
            }

            // Dropping the watcher removes the kernel watch.
            drop(watcher);
            tracing::debug!(sandbox_id, path = %resolved.guest, "watch stopped");
        });

        Ok(rx)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn event_kind(kind: &EventKind) -> Option<FilesystemEventKind> {
    match kind {
        EventKind::Create(_) => Some(FilesystemEventKind::Create),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => Some(FilesystemEventKind::Remove),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => Some(FilesystemEventKind::Create),
        EventKind::Modify(ModifyKind::Name(_)) => Some(FilesystemEventKind::Rename),
        EventKind::Modify(ModifyKind::Metadata(_)) => Some(FilesystemEventKind::Chmod),
        EventKind::Modify(_) => Some(FilesystemEventKind::Write),
        EventKind::Remove(_) => Some(FilesystemEventKind::Remove),
        EventKind::Access(_) | EventKind::Any | EventKind::Other => None,
    }
}

/// Turns a kernel event into events named relative to the watched directory.
fn translate(root: &Path, event: &Event) -> Vec<FilesystemEvent> {
    let Some(kind) = event_kind(&event.kind) else {
        return Vec::new();
    };

    event
        .paths
        .iter()
        .filter_map(|path| relative_name(root, path))
        .map(|name| FilesystemEvent { name, kind })
        .collect()
}

fn relative_name(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let name = relative.to_string_lossy().into_owned();
    (!name.is_empty()).then_some(name)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
