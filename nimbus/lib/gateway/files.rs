use bytes::Bytes;
use futures::stream::BoxStream;
use nimbusutils::retry_idempotent;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    guest::{EntryInfo, FilesystemEvent},
    NimbusError, NimbusResult,
};

use super::ExecutionGateway;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// How [`ExecutionGateway::read`] returns file content.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadFormat {
    /// UTF-8 text. Invalid UTF-8 is an error.
    #[default]
    Text,

    /// Raw bytes.
    Bytes,

    /// A stream of chunks, for files too large for one response.
    Stream,
}

/// File content in the requested format.
pub enum FileContent {
    /// UTF-8 text.
    Text(String),

    /// Raw bytes.
    Bytes(Bytes),

    /// Chunks in file order.
    Stream(BoxStream<'static, NimbusResult<Bytes>>),
}

/// One file of a batch write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteEntry {
    /// The guest path.
    pub path: String,

    /// The content.
    pub data: Bytes,
}

/// A live directory watch. Dropping it stops the watch.
pub struct WatchHandle {
    events: mpsc::Receiver<FilesystemEvent>,
    cancel: CancellationToken,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ExecutionGateway {
    /// Reads a file in the requested format.
    pub async fn read(
        &self,
        path: &str,
        format: ReadFormat,
        user: Option<&str>,
    ) -> NimbusResult<FileContent> {
        Ok(match format {
            ReadFormat::Text => FileContent::Text(self.read_text(path, user).await?),
            ReadFormat::Bytes => FileContent::Bytes(self.read_bytes(path, user).await?),
            ReadFormat::Stream => FileContent::Stream(self.read_stream(path, user).await?),
        })
    }

    /// Reads a whole file as text.
    pub async fn read_text(&self, path: &str, user: Option<&str>) -> NimbusResult<String> {
        let data = self.read_bytes(path, user).await?;
        String::from_utf8(data.to_vec()).map_err(|_| {
            NimbusError::InvalidArgument(format!(
                "{path} is not valid UTF-8 text; read it as bytes"
            ))
        })
    }

    /// Reads a whole file as bytes.
    pub async fn read_bytes(&self, path: &str, user: Option<&str>) -> NimbusResult<Bytes> {
        self.ensure_live()?;
        let user = self.user_or_default(user);
        retry_idempotent(self.read_retry, NimbusError::is_transient, || {
            self.agent.read_file(user, path)
        })
        .await
    }

    /// Reads a file as a stream of chunks.
    pub async fn read_stream(
        &self,
        path: &str,
        user: Option<&str>,
    ) -> NimbusResult<BoxStream<'static, NimbusResult<Bytes>>> {
        self.ensure_live()?;
        self.agent
            .read_file_chunks(
                self.user_or_default(user),
                path,
                *self.defaults.get_read_chunk_size(),
            )
            .await
    }

    /// Writes a file, creating missing parent directories.
    pub async fn write(
        &self,
        path: &str,
        data: impl Into<Bytes>,
        user: Option<&str>,
    ) -> NimbusResult<EntryInfo> {
        self.ensure_live()?;
        let data = data.into();
        let size = data.len();
        let entry = self
            .agent
            .write_file(self.user_or_default(user), path, data)
            .await?;
        tracing::debug!(sandbox_id = %self.sandbox_id, path = %entry.path, size, "wrote file");
        Ok(entry)
    }

    /// Writes several files in order, stopping at the first failure.
    pub async fn write_files(
        &self,
        files: Vec<WriteEntry>,
        user: Option<&str>,
    ) -> NimbusResult<Vec<EntryInfo>> {
        let mut written = Vec::with_capacity(files.len());
        for file in files {
            written.push(self.write(&file.path, file.data, user).await?);
        }
        Ok(written)
    }

    /// Lists a directory down to `depth` levels.
    pub async fn list(
        &self,
        path: &str,
        depth: usize,
        user: Option<&str>,
    ) -> NimbusResult<Vec<EntryInfo>> {
        self.ensure_live()?;
        if depth == 0 {
            return Err(NimbusError::InvalidArgument("depth must be at least 1".into()));
        }

        let user = self.user_or_default(user);
        retry_idempotent(self.read_retry, NimbusError::is_transient, || {
            self.agent.list_dir(user, path, depth)
        })
        .await
    }

    /// Whether an entry exists.
    pub async fn exists(&self, path: &str, user: Option<&str>) -> NimbusResult<bool> {
        match self.get_info(path, user).await {
            Ok(_) => Ok(true),
            Err(NimbusError::PathNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Returns metadata about an entry.
    pub async fn get_info(&self, path: &str, user: Option<&str>) -> NimbusResult<EntryInfo> {
        self.ensure_live()?;
        let user = self.user_or_default(user);
        retry_idempotent(self.read_retry, NimbusError::is_transient, || {
            self.agent.stat(user, path)
        })
        .await
    }

    /// Removes a file or directory tree.
    pub async fn remove(&self, path: &str, user: Option<&str>) -> NimbusResult<()> {
        self.ensure_live()?;
        self.agent.remove(self.user_or_default(user), path).await
    }

    /// Renames an entry.
    pub async fn rename(&self, from: &str, to: &str, user: Option<&str>) -> NimbusResult<EntryInfo> {
        self.ensure_live()?;
        self.agent.rename(self.user_or_default(user), from, to).await
    }

    /// Creates a directory and its parents. Returns false if it already existed.
    pub async fn make_dir(&self, path: &str, user: Option<&str>) -> NimbusResult<bool> {
        self.ensure_live()?;
        self.agent.make_dir(self.user_or_default(user), path).await
    }

    /// Watches a directory for changes until the handle is stopped or dropped, or the sandbox
    /// terminates.
    pub async fn watch_dir(
        &self,
        path: &str,
        recursive: bool,
        user: Option<&str>,
    ) -> NimbusResult<WatchHandle> {
        self.ensure_live()?;
        let cancel = self.terminated.child_token();
        let events = self
            .agent
            .watch_dir(self.user_or_default(user), path, recursive, cancel.clone())
            .await?;
        Ok(WatchHandle { events, cancel })
    }
}

impl FileContent {
    /// Collects the content into bytes, draining a stream if needed.
    pub async fn into_bytes(self) -> NimbusResult<Bytes> {
        use futures::TryStreamExt;

        match self {
            FileContent::Text(text) => Ok(Bytes::from(text)),
            FileContent::Bytes(bytes) => Ok(bytes),
            FileContent::Stream(stream) => {
                let chunks = stream.try_collect::<Vec<_>>().await?;
                Ok(Bytes::from(chunks.concat()))
            }
        }
    }
}

impl WatchHandle {
    /// The next change. `None` once the watch has stopped.
    pub async fn next_event(&mut self) -> Option<FilesystemEvent> {
        self.events.recv().await
    }

    /// Stops watching.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for FileContent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileContent::Text(text) => f.debug_tuple("Text").field(&text.len()).finish(),
            FileContent::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            FileContent::Stream(_) => f.write_str("Stream"),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::{gateway::test_gateway as gateway, guest::FilesystemEventKind};

    use super::*;

    #[tokio::test]
    async fn test_binary_round_trip() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let gateway = gateway(tmp.path()).await?;

        for data in [
            Vec::new(),
            vec![0u8, 0, 1, 255, 0],
            (0..=255u8).cycle().take(200_000).collect::<Vec<_>>(),
        ] {
            gateway.write("/tmp/blob.bin", data.clone(), None).await?;
            assert_eq!(gateway.read_bytes("/tmp/blob.bin", None).await?, data);

            let streamed = gateway
                .read("/tmp/blob.bin", ReadFormat::Stream, None)
                .await?
                .into_bytes()
                .await?;
            assert_eq!(streamed, data);
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_text_reads_reject_invalid_utf8() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let gateway = gateway(tmp.path()).await?;

        gateway.write("bad.txt", vec![0xff, 0xfe], None).await?;
        assert!(matches!(
            gateway.read_text("bad.txt", None).await,
            Err(NimbusError::InvalidArgument(_))
        ));

        gateway.write("good.txt", "héllo", None).await?;
        assert_eq!(gateway.read_text("/home/user/good.txt", None).await?, "héllo");
        Ok(())
    }

    #[tokio::test]
    async fn test_file_operations() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let gateway = gateway(tmp.path()).await?;

        let written = gateway
            .write_files(
                vec![
                    WriteEntry {
                        path: "/workspace/a/one.txt".into(),
                        data: Bytes::from("1"),
                    },
                    WriteEntry {
                        path: "/workspace/a/b/two.txt".into(),
                        data: Bytes::from("22"),
                    },
                ],
                None,
            )
            .await?;
        assert_eq!(written.len(), 2);

        let shallow = gateway.list("/workspace/a", 1, None).await?;
        assert_eq!(shallow.len(), 2);
        let deep = gateway.list("/workspace/a", 2, None).await?;
        assert_eq!(deep.len(), 3);
        assert!(gateway.list("/workspace/a", 0, None).await.is_err());

        assert!(gateway.exists("/workspace/a/one.txt", None).await?);
        assert!(!gateway.exists("/workspace/missing", None).await?);
        assert_eq!(gateway.get_info("/workspace/a/b/two.txt", None).await?.size, 2);

        let renamed = gateway
            .rename("/workspace/a/one.txt", "/workspace/a/uno.txt", None)
            .await?;
        assert_eq!(renamed.name, "uno.txt");
        assert!(gateway.make_dir("/workspace/c", None).await?);
        assert!(!gateway.make_dir("/workspace/c", None).await?);

        gateway.remove("/workspace/a", None).await?;
        assert!(!gateway.exists("/workspace/a/uno.txt", None).await?);

        // Written through the mount, so it lands on the volume directory.
        assert!(tmp.path().join("volume/c").is_dir());
        Ok(())
    }

    #[tokio::test]
    async fn test_watch_stops_with_the_sandbox() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let gateway = gateway(tmp.path()).await?;
        gateway.make_dir("/workspace/watched", None).await?;

        let mut watch = gateway.watch_dir("/workspace/watched", false, None).await?;
        gateway.write("/workspace/watched/new.txt", "x", None).await?;

        let event = tokio::time::timeout(Duration::from_secs(5), watch.next_event()).await?;
        assert_eq!(
            event,
            Some(FilesystemEvent {
                name: "new.txt".into(),
                kind: FilesystemEventKind::Create,
            })
        );

        gateway.terminate().await;
        let end = tokio::time::timeout(Duration::from_secs(5), async {
            while watch.next_event().await.is_some() {}
        })
        .await;
        assert!(end.is_ok());
        assert!(gateway.read_bytes("/workspace/watched/new.txt", None).await.is_err());
        Ok(())
    }
}
