use std::{
    error::Error,
    fmt::{self, Display},
    time::Duration,
};

use nimbusutils::NimbusutilsError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::orchestration::SandboxState;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a nimbus-related operation.
pub type NimbusResult<T> = Result<T, NimbusError>;

/// An error that occurred while orchestrating sandboxes.
#[derive(pretty_error_debug::Debug, Error)]
pub enum NimbusError {
    /// An I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An error that can represent any error.
    #[error(transparent)]
    Custom(#[from] AnyError),

    /// An error from one of the shared utilities.
    #[error(transparent)]
    Utils(#[from] NimbusutilsError),

    /// A database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error.
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A JSON (de)serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A configuration file could not be parsed.
    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),

    /// An HTTP request made on behalf of a readiness check failed.
    #[error("http request error: {0}")]
    HttpRequest(#[from] reqwest::Error),

    /// A directory watch could not be registered.
    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),

    /// A spawned task panicked or was cancelled.
    #[error("join error: {0}")]
    JoinError(#[from] tokio::task::JoinError),

    /// The caller did not present a valid credential.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// The caller is not allowed to access a guest path.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The sandbox does not exist, belongs to another team, or has already terminated.
    #[error("sandbox not found: {0}")]
    SandboxNotFound(String),

    /// The template does not exist or has no successful build.
    #[error("template not found: {0}")]
    TemplateNotFound(String),

    /// The template build does not exist.
    #[error("build not found: {0}")]
    BuildNotFound(String),

    /// The volume does not exist.
    #[error("volume not found: {0}")]
    VolumeNotFound(String),

    /// The process does not exist in the guest.
    #[error("process not found: {0}")]
    ProcessNotFound(u32),

    /// The file or directory does not exist.
    #[error("path not found: {0}")]
    PathNotFound(String),

    /// The file or directory already exists.
    #[error("path already exists: {0}")]
    AlreadyExists(String),

    /// Admission was refused because the team's plan limit would be exceeded.
    #[error("quota exceeded for {resource}: requested {requested}, available {available}")]
    QuotaExceeded {
        /// The limited resource.
        resource: QuotaResource,

        /// The amount requested.
        requested: u64,

        /// The amount still available under the plan.
        available: u64,
    },

    /// A write was refused because the sandbox disk allocation is exhausted.
    #[error("not enough space: need {needed} bytes, {available} bytes available")]
    NotEnoughSpace {
        /// Bytes the write needed.
        needed: u64,

        /// Bytes still free.
        available: u64,
    },

    /// The micro-VM did not become ready in time.
    #[error("provisioning timed out after {0:?}")]
    ProvisioningTimeout(Duration),

    /// A command ran longer than its own timeout and was killed.
    #[error("command timed out after {timeout:?}: {command}")]
    CommandTimeout {
        /// The command that was killed.
        command: String,

        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// A command finished with a non-zero exit code.
    #[error("command exited with code {exit_code}")]
    CommandExit {
        /// The exit code.
        exit_code: i32,

        /// Captured stdout.
        stdout: String,

        /// Captured stderr.
        stderr: String,
    },

    /// A template build failed.
    #[error("template build failed: {message}")]
    TemplateBuildFailed {
        /// What went wrong.
        message: String,

        /// The last build log lines.
        logs: Vec<String>,
    },

    /// A build description declared more than one stage.
    #[error("multi-stage builds are not supported: {0}")]
    MultiStageBuildUnsupported(String),

    /// A Dockerfile could not be parsed.
    #[error("invalid dockerfile at line {line}: {message}")]
    InvalidDockerfile {
        /// 1-based line number.
        line: usize,

        /// What is wrong with it.
        message: String,
    },

    /// The volume mount path is not under one of the allowed prefixes.
    #[error("invalid volume mount path {path}: must be under one of {allowed:?}")]
    InvalidMountPath {
        /// The rejected path.
        path: String,

        /// The allowed prefixes.
        allowed: Vec<String>,
    },

    /// The volume name breaks the naming rules.
    #[error("invalid volume name {0:?}: must start with a lowercase letter, contain only lowercase letters, digits and hyphens, and be at most 63 characters")]
    InvalidVolumeName(String),

    /// A request argument is invalid.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The volume is mounted by running sandboxes.
    #[error("volume {volume} is mounted by running sandboxes: {sandboxes:?}")]
    VolumeInUse {
        /// The volume id.
        volume: String,

        /// The sandboxes that mount it.
        sandboxes: Vec<String>,
    },

    /// The sandbox cannot perform the requested action in its current state.
    #[error("sandbox {sandbox} cannot {action} while {state}")]
    InvalidStateTransition {
        /// The sandbox id.
        sandbox: String,

        /// Its current state.
        state: SandboxState,

        /// The refused action.
        action: &'static str,
    },

    /// The caller is sending requests too quickly.
    #[error("rate limit exceeded, retry after {retry_after_ms} ms")]
    RateLimited {
        /// How long the caller should back off.
        retry_after_ms: u64,
    },

    /// The operation was cancelled by the caller.
    #[error("operation cancelled")]
    Cancelled,
}

/// The stable discriminant of a [`NimbusError`], used at API boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad or missing credential.
    Authentication,

    /// Access to a guest path was denied.
    PermissionDenied,

    /// An id did not resolve, including ids of terminated sandboxes.
    NotFound,

    /// An operation-level timeout elapsed.
    Timeout,

    /// Admission was refused by the resource ledger.
    QuotaExceeded,

    /// A disk allocation is exhausted.
    NotEnoughSpace,

    /// A process ran but exited non-zero.
    CommandExit,

    /// A template build failed.
    TemplateBuild,

    /// The caller must back off.
    RateLimit,

    /// The request was malformed.
    Validation,

    /// The request conflicts with current state.
    Conflict,

    /// The operation was cancelled.
    Cancelled,

    /// Anything else.
    Internal,
}

/// A resource tracked by the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaResource {
    /// Virtual CPUs.
    Vcpus,

    /// Memory in MiB.
    MemoryMib,

    /// Disk in MiB.
    DiskMib,

    /// Concurrently active sandboxes.
    Sandboxes,
}

/// An error that can represent any error.
#[derive(Debug)]
pub struct AnyError {
    error: anyhow::Error,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl NimbusError {
    /// Creates a new `Err` result.
    pub fn custom(error: impl Into<anyhow::Error>) -> NimbusError {
        NimbusError::Custom(AnyError {
            error: error.into(),
        })
    }

    /// Returns the stable discriminant of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            NimbusError::Unauthenticated(_) => ErrorKind::Authentication,
            NimbusError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            NimbusError::SandboxNotFound(_)
            | NimbusError::TemplateNotFound(_)
            | NimbusError::BuildNotFound(_)
            | NimbusError::VolumeNotFound(_)
            | NimbusError::ProcessNotFound(_)
            | NimbusError::PathNotFound(_) => ErrorKind::NotFound,
            NimbusError::ProvisioningTimeout(_) | NimbusError::CommandTimeout { .. } => {
                ErrorKind::Timeout
            }
            NimbusError::QuotaExceeded { .. } => ErrorKind::QuotaExceeded,
            NimbusError::NotEnoughSpace { .. } => ErrorKind::NotEnoughSpace,
            NimbusError::CommandExit { .. } => ErrorKind::CommandExit,
            NimbusError::TemplateBuildFailed { .. } => ErrorKind::TemplateBuild,
            NimbusError::RateLimited { .. } => ErrorKind::RateLimit,
            NimbusError::MultiStageBuildUnsupported(_)
            | NimbusError::InvalidDockerfile { .. }
            | NimbusError::InvalidMountPath { .. }
            | NimbusError::InvalidVolumeName(_)
            | NimbusError::InvalidArgument(_)
            | NimbusError::Utils(NimbusutilsError::PathValidation(_))
            | NimbusError::Config(_) => ErrorKind::Validation,
            NimbusError::AlreadyExists(_)
            | NimbusError::VolumeInUse { .. }
            | NimbusError::InvalidStateTransition { .. } => ErrorKind::Conflict,
            NimbusError::Cancelled => ErrorKind::Cancelled,
            NimbusError::Io(e) if e.kind() == std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            _ => ErrorKind::Internal,
        }
    }

    /// Whether retrying an idempotent read after this error may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            NimbusError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::ConnectionReset
            ),
            NimbusError::Database(sqlx::Error::PoolTimedOut) => true,
            _ => false,
        }
    }
}

impl AnyError {
    /// Downcasts the error to a `T`.
    pub fn downcast<T>(&self) -> Option<&T>
    where
        T: Display + fmt::Debug + Send + Sync + 'static,
    {
        self.error.downcast_ref::<T>()
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl PartialEq for AnyError {
    fn eq(&self, other: &Self) -> bool {
        self.error.to_string() == other.error.to_string()
    }
}

impl Display for AnyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl Error for AnyError {}

impl Display for QuotaResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuotaResource::Vcpus => write!(f, "vcpus"),
            QuotaResource::MemoryMib => write!(f, "memory (MiB)"),
            QuotaResource::DiskMib => write!(f, "disk (MiB)"),
            QuotaResource::Sandboxes => write!(f, "concurrent sandboxes"),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
