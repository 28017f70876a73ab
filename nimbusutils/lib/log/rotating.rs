//! Size-capped log files.
//!
//! A [`RotatingLog`] owns a background task that appends everything sent through its
//! [`LogWriter`]s to a file. When the file would grow beyond the maximum size, it is renamed
//! with an `.old` extension (replacing any previous backup) and a fresh file is started.
//! Writers never block on disk I/O, so they can be used from output pumps that must not stall.

use std::{
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use tokio::{
    fs::{self, File, OpenOptions},
    io::AsyncWriteExt,
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
};

use super::DEFAULT_LOG_MAX_SIZE;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A log file that rotates once it reaches a maximum size.
///
/// ## Example
///
/// ```no_run
/// use nimbusutils::RotatingLog;
///
/// #[tokio::main]
/// async fn main() -> std::io::Result<()> {
///     let log = RotatingLog::new("sandbox.log").await?;
///     log.writer().line("sandbox started");
///     log.close().await;
///     Ok(())
/// }
/// ```
pub struct RotatingLog {
    /// Path to the current log file
    path: PathBuf,

    /// Maximum size in bytes before rotation
    max_size: u64,

    /// Bytes written to the current file
    current_size: Arc<AtomicU64>,

    /// Channel feeding the background writer
    tx: UnboundedSender<Vec<u8>>,

    /// Background writer task
    task: JoinHandle<()>,
}

/// A cheap, cloneable handle that appends to a [`RotatingLog`].
#[derive(Clone)]
pub struct LogWriter {
    tx: UnboundedSender<Vec<u8>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl RotatingLog {
    /// Opens (or creates) a rotating log with the default maximum size.
    pub async fn new(path: impl AsRef<Path>) -> io::Result<Self> {
        Self::with_max_size(path, DEFAULT_LOG_MAX_SIZE).await
    }

    /// Opens (or creates) a rotating log that rotates after `max_size` bytes.
    ///
    /// ## Errors
    ///
    /// Fails if the parent directory cannot be created or the file cannot be opened.
    pub async fn with_max_size(path: impl AsRef<Path>, max_size: u64) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        let current_size = Arc::new(AtomicU64::new(file.metadata().await?.len()));
        let (tx, rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(write_loop(
            rx,
            file,
            path.clone(),
            max_size,
            Arc::clone(&current_size),
        ));

        Ok(Self {
            path,
            max_size,
            current_size,
            tx,
            task,
        })
    }

    /// Returns a writer that appends to this log.
    pub fn writer(&self) -> LogWriter {
        LogWriter {
            tx: self.tx.clone(),
        }
    }

    /// The path of the live log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The rotation threshold in bytes.
    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Bytes written to the live log file since it was last rotated.
    pub fn current_size(&self) -> u64 {
        self.current_size.load(Ordering::Relaxed)
    }

    /// Stops accepting writes from this handle and waits until everything queued so far has been
    /// written. Writers cloned from this log keep the background task alive until they drop.
    pub async fn close(self) {
        drop(self.tx);
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "log writer task failed");
        }
    }
}

impl LogWriter {
    /// Appends raw bytes.
    pub fn append(&self, data: impl Into<Vec<u8>>) {
        // The receiver only disappears once the log is closed; late writes are dropped.
        let _ = self.tx.send(data.into());
    }

    /// Appends a line, adding the trailing newline.
    pub fn line(&self, line: impl AsRef<str>) {
        let mut data = line.as_ref().as_bytes().to_vec();
        data.push(b'\n');
        self.append(data);
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Reads the last `lines` lines of a log file (all lines when `None`).
///
/// A missing file reads as empty.
pub async fn read_log_tail(path: impl AsRef<Path>, lines: Option<usize>) -> io::Result<Vec<String>> {
    let content = match fs::read(path.as_ref()).await {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let all: Vec<String> = String::from_utf8_lossy(&content)
        .lines()
        .map(str::to_string)
        .collect();

    Ok(match lines {
        Some(n) if n < all.len() => all[all.len() - n..].to_vec(),
        _ => all,
    })
}

async fn rotate(file: File, path: &Path) -> io::Result<File> {
    file.sync_all().await?;
    drop(file);

    let backup_path = path.with_extension("old");
    if fs::try_exists(&backup_path).await? {
        fs::remove_file(&backup_path).await?;
    }
    fs::rename(path, &backup_path).await?;

    OpenOptions::new().create(true).append(true).open(path).await
}

async fn write_loop(
    mut rx: UnboundedReceiver<Vec<u8>>,
    mut file: File,
    path: PathBuf,
    max_size: u64,
    current_size: Arc<AtomicU64>,
) {
    while let Some(data) = rx.recv().await {
        let data_len = data.len() as u64;
        let size = current_size.load(Ordering::Relaxed);

        // Oversized single writes still go to a fresh file rather than being split.
        if size > 0 && size + data_len > max_size {
            match file.try_clone().await {
                Ok(handle) => match rotate(handle, &path).await {
                    Ok(new_file) => {
                        file = new_file;
                        current_size.store(0, Ordering::Relaxed);
                    }
                    Err(e) => tracing::error!(error = %e, "failed to rotate log file"),
                },
                Err(e) => tracing::error!(error = %e, "failed to clone log file handle"),
            }
        }

        if let Err(e) = file.write_all(&data).await {
            tracing::error!(error = %e, "failed to write to log file");
            continue;
        }
        current_size.fetch_add(data_len, Ordering::Relaxed);
    }

    if let Err(e) = file.flush().await {
        tracing::error!(error = %e, "failed to flush log file");
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "log is closed"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
