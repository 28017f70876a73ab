//! The nimbus service configuration.

use std::{
    collections::HashMap,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use getset::Getters;
use nimbusutils::{normalize_path, SupportedPathType};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{
    ledger::Resources,
    utils::{
        get_nimbus_home_path, BUILDS_SUBDIR, NIMBUS_CONFIG_FILENAME, NIMBUS_DB_FILENAME,
        NIMBUS_DOMAIN_ENV_VAR, NIMBUS_SERVER_KEY_ENV_VAR, SANDBOXES_SUBDIR, TEMPLATES_SUBDIR,
        VOLUMES_SUBDIR,
    },
    NimbusError, NimbusResult,
};

use super::{
    DEFAULT_ALLOWED_MOUNT_PREFIXES, DEFAULT_DOMAIN, DEFAULT_GUEST_USER,
    DEFAULT_MAX_SANDBOX_TIMEOUT_SECS, DEFAULT_PROVISIONING_TIMEOUT_MS, DEFAULT_RATE_LIMIT_PER_SEC,
    DEFAULT_READY_CHECK_INTERVAL_MS, DEFAULT_READY_CHECK_TIMEOUT_MS, DEFAULT_READ_CHUNK_SIZE,
    DEFAULT_SANDBOX_TIMEOUT_SECS, DEFAULT_SERVER_ADDR, DEFAULT_SWEEP_INTERVAL_MS,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The nimbus service configuration.
///
/// Constructed once and handed to [`Nimbus::new`](crate::Nimbus::new); nothing reads
/// configuration from ambient global state after that.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder, Getters, PartialEq)]
#[getset(get = "pub with_prefix")]
#[serde(default)]
pub struct NimbusConfig {
    /// The directory all nimbus state lives under.
    #[builder(default = get_nimbus_home_path(), setter(into))]
    home_dir: PathBuf,

    /// The public domain sandbox hosts are published under.
    #[builder(default = DEFAULT_DOMAIN.to_string(), setter(into))]
    domain: String,

    /// The address the REST server binds to.
    #[builder(default = DEFAULT_SERVER_ADDR)]
    server_addr: SocketAddr,

    /// The HS256 secret bearer tokens are validated with. `None` runs the server in local mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option, into))]
    server_key: Option<String>,

    /// The plan applied to teams without an override.
    #[builder(default)]
    default_plan: PlanLimits,

    /// Per-team plan overrides.
    #[builder(default)]
    team_plans: HashMap<String, PlanLimits>,

    /// The guest path prefixes a volume may be mounted under.
    #[builder(default = DEFAULT_ALLOWED_MOUNT_PREFIXES.iter().map(|p| p.to_string()).collect())]
    allowed_mount_prefixes: Vec<String>,

    /// Resources given to sandboxes whose create request names none.
    #[builder(default)]
    default_resources: Resources,

    /// How often the expiry sweep runs, in milliseconds.
    #[builder(default = DEFAULT_SWEEP_INTERVAL_MS)]
    sweep_interval_ms: u64,

    /// How long provisioning may take, in milliseconds.
    #[builder(default = DEFAULT_PROVISIONING_TIMEOUT_MS)]
    provisioning_timeout_ms: u64,

    /// How often readiness checks are polled, in milliseconds.
    #[builder(default = DEFAULT_READY_CHECK_INTERVAL_MS)]
    ready_check_interval_ms: u64,

    /// How long readiness checks may fail before giving up, in milliseconds.
    #[builder(default = DEFAULT_READY_CHECK_TIMEOUT_MS)]
    ready_check_timeout_ms: u64,

    /// The lifetime of sandboxes created without a timeout, in seconds.
    #[builder(default = DEFAULT_SANDBOX_TIMEOUT_SECS)]
    default_sandbox_timeout_secs: u64,

    /// The longest lifetime a sandbox may be given, in seconds.
    #[builder(default = DEFAULT_MAX_SANDBOX_TIMEOUT_SECS)]
    max_sandbox_timeout_secs: u64,

    /// What deleting a volume that is still mounted does.
    #[builder(default)]
    volume_delete_policy: VolumeDeletePolicy,

    /// Requests per second allowed per team by the REST layer. `0` disables limiting.
    #[builder(default = DEFAULT_RATE_LIMIT_PER_SEC)]
    rate_limit_per_sec: u32,

    /// The chunk size used when streaming file reads.
    #[builder(default = DEFAULT_READ_CHUNK_SIZE)]
    read_chunk_size: usize,

    /// Guest user names and the host identities the local agent runs them as.
    #[builder(default = NimbusConfig::default_users())]
    users: HashMap<String, GuestUser>,
}

/// The resource limits of a team's plan.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, TypedBuilder, PartialEq, Eq)]
pub struct PlanLimits {
    /// Total vCPUs across active sandboxes.
    #[builder(default = 20)]
    pub vcpus: u32,

    /// Total memory in MiB across active sandboxes.
    #[builder(default = 16 * 1024)]
    pub memory_mib: u64,

    /// Total disk in MiB across all non-terminated sandboxes.
    #[builder(default = 64 * 1024)]
    pub disk_mib: u64,

    /// Sandboxes that may be provisioning or running at once.
    #[builder(default = 20)]
    pub concurrent_sandboxes: u32,
}

/// A guest user and the host identity the local agent maps it onto.
///
/// `None` ids mean the agent's own identity, in which case permission checks are left to the
/// host kernel.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder, PartialEq, Eq, Default)]
pub struct GuestUser {
    /// The host uid processes and file operations run as.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option))]
    pub uid: Option<u32>,

    /// The host gid processes and file operations run as.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option))]
    pub gid: Option<u32>,

    /// The user's home directory inside the guest.
    #[serde(default)]
    #[builder(default, setter(into))]
    pub home: String,
}

/// What deleting a volume that is still mounted by a live sandbox does.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum VolumeDeletePolicy {
    /// Refuse the deletion with a conflict error naming the sandboxes.
    #[default]
    Reject,

    /// Unmount the volume from every sandbox, then delete it.
    ForceDetach,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl NimbusConfig {
    /// Loads the configuration.
    ///
    /// `.env` is read first. The file at `path`, or `nimbus.toml` in the home directory when no
    /// path is given, is parsed if it exists. `NIMBUS_DOMAIN` and `NIMBUS_SERVER_KEY` override the
    /// file.
    pub async fn load(path: Option<&Path>) -> NimbusResult<Self> {
        let _ = dotenvy::dotenv();

        let path = match path {
            Some(path) => path.to_path_buf(),
            None => get_nimbus_home_path().join(NIMBUS_CONFIG_FILENAME),
        };

        let mut config = if path.exists() {
            let content = tokio::fs::read_to_string(&path).await?;
            toml::from_str(&content)?
        } else {
            tracing::debug!(path = %path.display(), "no config file found, using defaults");
            NimbusConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Applies the environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(domain) = std::env::var(NIMBUS_DOMAIN_ENV_VAR) {
            if !domain.is_empty() {
                self.domain = domain;
            }
        }

        if let Ok(key) = std::env::var(NIMBUS_SERVER_KEY_ENV_VAR) {
            if !key.is_empty() {
                self.server_key = Some(key);
            }
        }
    }

    /// Replaces the home directory.
    pub fn with_home_dir(mut self, home_dir: impl Into<PathBuf>) -> Self {
        self.home_dir = home_dir.into();
        self
    }

    /// Replaces the server address.
    pub fn with_server_addr(mut self, server_addr: SocketAddr) -> Self {
        self.server_addr = server_addr;
        self
    }

    /// Checks the configuration for values nimbus cannot run with.
    pub fn validate(&self) -> NimbusResult<()> {
        if self.allowed_mount_prefixes.is_empty() {
            return Err(NimbusError::InvalidArgument(
                "allowed_mount_prefixes must not be empty".into(),
            ));
        }

        for prefix in &self.allowed_mount_prefixes {
            let normalized = normalize_path(prefix, SupportedPathType::Absolute)?;
            if normalized != *prefix || normalized == "/" {
                return Err(NimbusError::InvalidArgument(format!(
                    "mount prefix {prefix:?} must be a normalized absolute path other than /"
                )));
            }
        }

        if self.default_sandbox_timeout_secs == 0
            || self.default_sandbox_timeout_secs > self.max_sandbox_timeout_secs
        {
            return Err(NimbusError::InvalidArgument(
                "default_sandbox_timeout_secs must be between 1 and max_sandbox_timeout_secs"
                    .into(),
            ));
        }

        if self.read_chunk_size == 0 {
            return Err(NimbusError::InvalidArgument(
                "read_chunk_size must be positive".into(),
            ));
        }

        Ok(())
    }

    /// The plan limits that apply to `team`.
    pub fn plan_for(&self, team: &str) -> PlanLimits {
        self.team_plans
            .get(team)
            .copied()
            .unwrap_or(self.default_plan)
    }

    /// The directory holding per-sandbox state.
    pub fn sandboxes_dir(&self) -> PathBuf {
        self.home_dir.join(SANDBOXES_SUBDIR)
    }

    /// The directory holding volume data.
    pub fn volumes_dir(&self) -> PathBuf {
        self.home_dir.join(VOLUMES_SUBDIR)
    }

    /// The directory holding template snapshots.
    pub fn templates_dir(&self) -> PathBuf {
        self.home_dir.join(TEMPLATES_SUBDIR)
    }

    /// The directory holding build VM scratch space.
    pub fn builds_dir(&self) -> PathBuf {
        self.home_dir.join(BUILDS_SUBDIR)
    }

    /// The catalog database path.
    pub fn db_path(&self) -> PathBuf {
        self.home_dir.join(NIMBUS_DB_FILENAME)
    }

    /// The sweep interval.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    /// The provisioning timeout.
    pub fn provisioning_timeout(&self) -> Duration {
        Duration::from_millis(self.provisioning_timeout_ms)
    }

    /// The readiness check polling interval.
    pub fn ready_check_interval(&self) -> Duration {
        Duration::from_millis(self.ready_check_interval_ms.max(1))
    }

    /// The overall readiness check timeout.
    pub fn ready_check_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_check_timeout_ms)
    }

    /// The default sandbox lifetime.
    pub fn default_sandbox_timeout(&self) -> Duration {
        Duration::from_secs(self.default_sandbox_timeout_secs)
    }

    /// The longest sandbox lifetime.
    pub fn max_sandbox_timeout(&self) -> Duration {
        Duration::from_secs(self.max_sandbox_timeout_secs)
    }

    /// The default `user` runs as the agent's own uid and gid, so the agent checks its file
    /// operations the way the kernel checks its commands. `root` keeps the agent's identity.
    fn default_users() -> HashMap<String, GuestUser> {
        HashMap::from([
            (
                DEFAULT_GUEST_USER.to_string(),
                GuestUser::builder()
                    .uid(nix::unistd::getuid().as_raw())
                    .gid(nix::unistd::getgid().as_raw())
                    .home("/home/user")
                    .build(),
            ),
            ("root".to_string(), GuestUser::builder().home("/root").build()),
        ])
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for NimbusConfig {
    fn default() -> Self {
        NimbusConfig::builder().build()
    }
}

impl Default for PlanLimits {
    fn default() -> Self {
        PlanLimits::builder().build()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
