//! Request and response bodies of the REST API.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{
    gateway::{CommandResult, ReadFormat},
    ledger::Resources,
    orchestration::SandboxInfo,
    template::TemplateSpec,
    ErrorKind, NimbusError, NimbusResult,
};

//--------------------------------------------------------------------------------------------------
// Types: Errors
//--------------------------------------------------------------------------------------------------

/// The body of every error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// HTTP status code
    pub code: u16,

    /// Error message
    pub message: String,

    /// The stable error discriminant
    pub error_type: ErrorKind,

    /// Structured context, such as the output of a failed command
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

//--------------------------------------------------------------------------------------------------
// Types: Sandboxes
//--------------------------------------------------------------------------------------------------

/// Response to a successful create.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatedSandbox {
    /// The sandbox
    #[serde(flatten)]
    pub info: SandboxInfo,

    /// The token required to reach exposed ports when public traffic is disabled
    pub traffic_token: String,
}

/// Query of the sandbox listing.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListSandboxesQuery {
    /// Comma separated `key:value` pairs every listed sandbox must carry
    #[serde(default)]
    pub metadata: Option<String>,

    /// Page size
    #[serde(default)]
    pub limit: Option<usize>,

    /// Continuation token from the previous page
    #[serde(default)]
    pub next: Option<String>,
}

/// Request to change a sandbox's remaining lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutRequest {
    /// Seconds from now
    pub timeout_secs: u64,
}

/// Request to resume a paused sandbox.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResumeRequest {
    /// A new lifetime in seconds from now. The old expiry stays when unset.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Response to a kill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillResponse {
    /// `false` when the sandbox had already terminated
    pub killed: bool,
}

/// Query of the log endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogsQuery {
    /// Only the last `tail` lines
    #[serde(default)]
    pub tail: Option<usize>,
}

/// Response of the log endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogsResponse {
    /// Log lines, oldest first
    pub lines: Vec<String>,
}

/// Response of the host endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostResponse {
    /// The public host name of the port
    pub host: String,
}

//--------------------------------------------------------------------------------------------------
// Types: Commands
//--------------------------------------------------------------------------------------------------

/// Request to run a command.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunCommandRequest {
    /// The shell command line
    pub cmd: String,

    /// Working directory
    #[serde(default)]
    pub cwd: Option<String>,

    /// Guest user
    #[serde(default)]
    pub user: Option<String>,

    /// Extra environment variables
    #[serde(default)]
    pub envs: HashMap<String, String>,

    /// Command timeout in seconds
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Return the pid right away instead of waiting
    #[serde(default)]
    pub background: bool,

    /// Keep stdin open for later writes
    #[serde(default)]
    pub stdin: bool,
}

/// Response to a run request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RunCommandResponse {
    /// A foreground command finished.
    Finished(CommandResult),

    /// A background command started.
    Started {
        /// The guest pid
        pid: u32,
    },
}

/// Request to write to a process's stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StdinRequest {
    /// The text to write
    #[serde(default)]
    pub data: String,

    /// Close stdin after writing
    #[serde(default)]
    pub close: bool,
}

//--------------------------------------------------------------------------------------------------
// Types: Files
//--------------------------------------------------------------------------------------------------

/// Query addressing one guest path.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileQuery {
    /// The guest path
    pub path: String,

    /// How to return file content
    #[serde(default)]
    pub format: ReadFormat,

    /// Guest user
    #[serde(default)]
    pub user: Option<String>,
}

/// Query of a guest directory listing.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListFilesQuery {
    /// The guest directory
    pub path: String,

    /// How many levels to descend
    #[serde(default = "default_depth")]
    pub depth: usize,

    /// Guest user
    #[serde(default)]
    pub user: Option<String>,
}

/// Response of the exists endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExistsResponse {
    /// Whether the path exists
    pub exists: bool,
}

/// Request to rename a guest path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenameRequest {
    /// The current path
    pub from: String,

    /// The new path
    pub to: String,

    /// Guest user
    #[serde(default)]
    pub user: Option<String>,
}

/// Request to create a guest directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MakeDirRequest {
    /// The directory
    pub path: String,

    /// Guest user
    #[serde(default)]
    pub user: Option<String>,
}

/// Response to a make-dir request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MakeDirResponse {
    /// `false` when the directory already existed
    pub created: bool,
}

//--------------------------------------------------------------------------------------------------
// Types: Volumes
//--------------------------------------------------------------------------------------------------

/// Request to create a volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateVolumeRequest {
    /// The volume name
    pub name: String,
}

/// Query of a paginated listing.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PageQuery {
    /// Page size
    #[serde(default)]
    pub limit: Option<usize>,

    /// Continuation token from the previous page
    #[serde(default)]
    pub next: Option<String>,
}

/// Query addressing a path inside a volume.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VolumePathQuery {
    /// The path, relative to the volume root or absolute
    #[serde(default = "default_volume_path")]
    pub path: String,

    /// Delete directories with their content
    #[serde(default)]
    pub recursive: bool,

    /// Page size of listings
    #[serde(default)]
    pub limit: Option<usize>,

    /// Continuation token of listings
    #[serde(default)]
    pub next: Option<String>,
}

//--------------------------------------------------------------------------------------------------
// Types: Templates
//--------------------------------------------------------------------------------------------------

/// Request to build a template, from a spec or from a Dockerfile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildTemplateRequest {
    /// The alias to build under
    pub alias: String,

    /// The build description
    #[serde(default)]
    pub spec: Option<TemplateSpec>,

    /// A single-stage Dockerfile, used when `spec` is absent
    #[serde(default)]
    pub dockerfile: Option<String>,

    /// Content of the files `COPY` and `ADD` refer to
    #[serde(default)]
    pub files: HashMap<String, String>,

    /// Resources of the build VM
    #[serde(default)]
    pub resources: Option<Resources>,

    /// Rebuild even if an identical generation exists
    #[serde(default)]
    pub skip_cache: bool,

    /// Return right away with the build id
    #[serde(default)]
    pub background: bool,
}

/// Request to change a template's visibility.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateTemplateRequest {
    /// Whether other teams may boot the template
    pub public: bool,
}

/// Query of the build status endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BuildStatusQuery {
    /// Skip this many log entries
    #[serde(default)]
    pub logs_offset: usize,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ErrorResponse {
    /// Creates an error response without details.
    pub fn new(code: u16, message: String, error_type: ErrorKind) -> Self {
        Self {
            code,
            message,
            error_type,
            details: None,
        }
    }

    /// Attaches structured details.
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl ListSandboxesQuery {
    /// Parses the metadata filter.
    pub fn metadata_filter(&self) -> NimbusResult<HashMap<String, String>> {
        let Some(raw) = self.metadata.as_deref() else {
            return Ok(HashMap::new());
        };

        raw.split(',')
            .filter(|pair| !pair.is_empty())
            .map(|pair| {
                pair.split_once(':')
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .ok_or_else(|| {
                        NimbusError::InvalidArgument(format!(
                            "metadata filter {pair:?} is not a key:value pair"
                        ))
                    })
            })
            .collect()
    }
}

impl BuildTemplateRequest {
    /// The spec to build, parsing the Dockerfile when no spec was given.
    pub fn template_spec(&self) -> NimbusResult<TemplateSpec> {
        match (&self.spec, &self.dockerfile) {
            (Some(spec), None) => Ok(spec.clone()),
            (None, Some(dockerfile)) => crate::template::parse_dockerfile(dockerfile, &self.files),
            _ => Err(NimbusError::InvalidArgument(
                "exactly one of spec and dockerfile must be given".into(),
            )),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn default_depth() -> usize {
    1
}

fn default_volume_path() -> String {
    "/".to_string()
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_filter_parsing() {
        let query = ListSandboxesQuery {
            metadata: Some("env:prod,owner:ana".into()),
            ..Default::default()
        };
        let filter = query.metadata_filter().unwrap();
        assert_eq!(filter.len(), 2);
        assert_eq!(filter["owner"], "ana");

        let query = ListSandboxesQuery {
            metadata: Some("broken".into()),
            ..Default::default()
        };
        assert!(query.metadata_filter().is_err());
    }

    #[test]
    fn test_build_request_needs_exactly_one_source() {
        let request: BuildTemplateRequest = serde_json::from_value(serde_json::json!({
            "alias": "py",
            "dockerfile": "FROM base\nRUN echo hi\n",
        }))
        .unwrap();
        let spec = request.template_spec().unwrap();
        assert_eq!(spec.from, "base");

        let request: BuildTemplateRequest =
            serde_json::from_value(serde_json::json!({ "alias": "py" })).unwrap();
        assert!(request.template_spec().is_err());
    }

    #[test]
    fn test_run_response_shapes() {
        let started = serde_json::to_value(RunCommandResponse::Started { pid: 7 }).unwrap();
        assert_eq!(started, serde_json::json!({ "pid": 7 }));
    }
}
