use std::{collections::HashMap, fmt, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{config::BASE_TEMPLATE_ALIAS, ledger::Resources, network::NetworkPolicy};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The lifecycle state of a sandbox.
///
/// `Provisioning` moves to `Running`; `Running` and `Paused` move between each other; every
/// state moves to `Terminated` on kill or expiry, and `Terminated` is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    /// The micro-VM is booting or its start command is not ready yet.
    Provisioning,

    /// Accepting commands and file operations.
    Running,

    /// Frozen. Filesystem state is kept; CPU and memory are returned to the team's quota.
    Paused,

    /// Torn down.
    Terminated,
}

/// A volume attached to a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeAttachment {
    /// The volume id.
    pub volume_id: String,

    /// The volume name.
    pub volume_name: String,

    /// Where the volume is mounted in the guest.
    pub mount_path: String,
}

/// A request to attach a volume at creation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    /// The volume id or name.
    pub volume: String,

    /// The guest path to mount it at.
    pub mount_path: String,
}

/// How to create a sandbox.
#[derive(Debug, Clone, TypedBuilder, Serialize, Deserialize)]
pub struct CreateOptions {
    /// Template id or alias.
    #[serde(default = "default_template")]
    #[builder(default = BASE_TEMPLATE_ALIAS.to_string(), setter(into))]
    pub template: String,

    /// The allocation. The configured default when unset.
    #[serde(default)]
    #[builder(default, setter(strip_option))]
    pub resources: Option<Resources>,

    /// The lifetime from the moment the sandbox is running. The configured default when unset.
    #[serde(default, with = "optional_secs")]
    #[builder(default, setter(strip_option))]
    pub timeout: Option<Duration>,

    /// The volume to attach.
    #[serde(default)]
    #[builder(default, setter(strip_option))]
    pub volume: Option<VolumeMount>,

    /// Egress rules and public traffic access.
    #[serde(default)]
    #[builder(default)]
    pub network: NetworkPolicy,

    /// Environment variables every process in the sandbox starts with.
    #[serde(default)]
    #[builder(default)]
    pub envs: HashMap<String, String>,

    /// Free-form tags used to filter listings.
    #[serde(default)]
    #[builder(default)]
    pub metadata: HashMap<String, String>,
}

/// A point-in-time view of a sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxInfo {
    /// The sandbox id.
    pub sandbox_id: String,

    /// The owning team.
    pub team: String,

    /// The template the sandbox booted from.
    pub template_id: String,

    /// The template alias.
    pub alias: String,

    /// The template generation the sandbox is pinned to.
    pub generation: u32,

    /// The current state.
    pub state: SandboxState,

    /// The allocation.
    pub resources: Resources,

    /// When the sandbox was created.
    pub started_at: DateTime<Utc>,

    /// When the sandbox expires.
    pub expires_at: DateTime<Utc>,

    /// Free-form tags.
    pub metadata: HashMap<String, String>,

    /// The attached volume.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<VolumeAttachment>,

    /// The network policy.
    pub network: NetworkPolicy,

    /// The domain exposed ports are published under.
    pub domain: String,
}

/// Resource usage of a sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxMetrics {
    /// When the sample was taken.
    pub timestamp: DateTime<Utc>,

    /// The allocation.
    pub resources: Resources,

    /// Processes running in the guest.
    pub process_count: u32,

    /// CPU usage of guest processes, in percent of one core.
    pub cpu_percent: f32,

    /// Resident memory of guest processes.
    pub memory_bytes: u64,

    /// Bytes used on the sandbox disk.
    pub disk_used_bytes: u64,
}

/// Where a public host routes to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedHost {
    /// The target sandbox.
    pub sandbox_id: String,

    /// The guest port.
    pub port: u16,

    /// The address the guest port is reachable at from the host.
    pub target: std::net::SocketAddr,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SandboxState {
    /// Whether the sandbox can still be reached.
    pub fn is_live(&self) -> bool {
        !matches!(self, SandboxState::Terminated)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn default_template() -> String {
    BASE_TEMPLATE_ALIAS.to_string()
}

/// Durations as whole seconds on the wire.
mod optional_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_secs))
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SandboxState::Provisioning => write!(f, "provisioning"),
            SandboxState::Running => write!(f, "running"),
            SandboxState::Paused => write!(f, "paused"),
            SandboxState::Terminated => write!(f, "terminated"),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_options_from_json() -> anyhow::Result<()> {
        let options: CreateOptions = serde_json::from_str(
            r#"{
                "timeout": 5,
                "volume": {"volume": "data", "mount_path": "/workspace"},
                "metadata": {"owner": "ci"}
            }"#,
        )?;

        assert_eq!(options.template, "base");
        assert_eq!(options.timeout, Some(Duration::from_secs(5)));
        assert_eq!(options.volume.map(|v| v.mount_path).as_deref(), Some("/workspace"));
        assert!(options.network.allow_public_traffic);
        assert_eq!(options.metadata["owner"], "ci");
        Ok(())
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SandboxState::Paused.to_string(), "paused");
        assert!(SandboxState::Running.is_live());
        assert!(!SandboxState::Terminated.is_live());
    }
}
