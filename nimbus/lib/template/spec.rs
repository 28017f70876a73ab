use std::{collections::HashMap, sync::LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{NimbusError, NimbusResult};

use super::{parse_dockerfile, ReadinessCheck};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

static ALIAS_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9._-]{0,127}$").expect("valid alias pattern"));

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// How to build a template: a base image followed by ordered build steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateSpec {
    /// The base image. Either the alias or id of another template, or an external image
    /// reference such as `python:3.12`.
    pub from: String,

    /// Steps applied on top of the base, in order.
    #[serde(default)]
    pub steps: Vec<BuildStep>,

    /// The command sandboxes start in the background when they boot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<StartCommand>,
}

/// One instruction of a template build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BuildStep {
    /// Runs a shell command.
    Run {
        /// The command line.
        cmd: String,
    },

    /// Installs packages with a package manager.
    Install {
        /// The package manager.
        manager: PackageManager,

        /// The packages.
        packages: Vec<String>,
    },

    /// Places a file in the image.
    Copy {
        /// The guest destination path.
        dest: String,

        /// The file content.
        content: String,
    },

    /// Creates a directory and its parents.
    MakeDir {
        /// The guest path.
        path: String,
    },

    /// Sets an environment variable for later steps and for sandboxes.
    Env {
        /// The variable name.
        key: String,

        /// The value.
        value: String,
    },

    /// Changes the working directory of later steps and of sandboxes.
    Workdir {
        /// The guest path.
        path: String,
    },

    /// Changes the user later steps and sandbox processes run as.
    User {
        /// The guest user name.
        name: String,
    },
}

/// Package managers [`BuildStep::Install`] knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageManager {
    /// Debian packages.
    Apt,

    /// Python packages.
    Pip,

    /// Node packages, installed globally.
    Npm,
}

/// The command a template starts when a sandbox boots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartCommand {
    /// The command line.
    pub cmd: String,

    /// When set, the sandbox only becomes ready once the readiness check passes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready: Option<ReadinessCheck>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl TemplateSpec {
    /// Creates a spec building on `from` with no steps.
    pub fn new(from: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            steps: Vec::new(),
            start: None,
        }
    }

    /// Parses a single-stage Dockerfile. `files` supplies the content of `COPY` sources by path.
    pub fn from_dockerfile(dockerfile: &str, files: &HashMap<String, String>) -> NimbusResult<Self> {
        parse_dockerfile(dockerfile, files)
    }

    /// Adds a step.
    pub fn step(mut self, step: BuildStep) -> Self {
        self.steps.push(step);
        self
    }

    /// Sets the start command.
    pub fn start(mut self, cmd: impl Into<String>, ready: Option<ReadinessCheck>) -> Self {
        self.start = Some(StartCommand {
            cmd: cmd.into(),
            ready,
        });
        self
    }

    /// Checks the spec before any build work starts.
    pub fn validate(&self) -> NimbusResult<()> {
        if self.from.trim().is_empty() {
            return Err(NimbusError::InvalidArgument(
                "template base image must not be empty".into(),
            ));
        }

        for (index, step) in self.steps.iter().enumerate() {
            step.validate()
                .map_err(|message| NimbusError::InvalidArgument(format!("step {}: {message}", index + 1)))?;
        }

        if let Some(start) = &self.start {
            if start.cmd.trim().is_empty() {
                return Err(NimbusError::InvalidArgument(
                    "start command must not be empty".into(),
                ));
            }
            if let Some(readiness) = &start.ready {
                readiness.validate()?;
            }
        }

        Ok(())
    }

    /// A digest of everything that affects the built snapshot. Builds with equal keys on the same
    /// template can reuse each other's snapshot.
    pub fn cache_key(&self) -> NimbusResult<String> {
        let encoded = serde_json::to_vec(self)?;
        Ok(hex::encode(Sha256::digest(&encoded)))
    }
}

impl BuildStep {
    fn validate(&self) -> Result<(), String> {
        match self {
            BuildStep::Run { cmd } if cmd.trim().is_empty() => Err("empty command".into()),
            BuildStep::Install { packages, .. } if packages.is_empty() => {
                Err("no packages to install".into())
            }
            BuildStep::Install { packages, .. } => match packages
                .iter()
                .find(|p| p.is_empty() || p.starts_with('-') || p.contains(char::is_whitespace))
            {
                Some(package) => Err(format!("invalid package name {package:?}")),
                None => Ok(()),
            },
            BuildStep::Copy { dest, .. } | BuildStep::MakeDir { path: dest } | BuildStep::Workdir { path: dest }
                if dest.is_empty() =>
            {
                Err("empty path".into())
            }
            BuildStep::Env { key, .. }
                if key.is_empty() || key.contains('=') || key.contains(char::is_whitespace) =>
            {
                Err(format!("invalid environment variable name {key:?}"))
            }
            BuildStep::User { name } if name.is_empty() => Err("empty user name".into()),
            _ => Ok(()),
        }
    }
}

impl PackageManager {
    /// The command line installing `packages`.
    pub fn install_command(&self, packages: &[String]) -> String {
        let packages = packages.join(" ");
        match self {
            PackageManager::Apt => format!(
                "apt-get update && DEBIAN_FRONTEND=noninteractive apt-get install -y --no-install-recommends {packages}"
            ),
            PackageManager::Pip => format!("pip install --no-cache-dir {packages}"),
            PackageManager::Npm => format!("npm install -g {packages}"),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Checks a template alias: lowercase letters, digits, `.`, `_` and `-`, starting with a letter
/// or digit, at most 128 characters.
pub fn validate_alias(alias: &str) -> NimbusResult<()> {
    if ALIAS_PATTERN.is_match(alias) {
        Ok(())
    } else {
        Err(NimbusError::InvalidArgument(format!(
            "invalid template alias {alias:?}"
        )))
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_tracks_content() -> anyhow::Result<()> {
        let a = TemplateSpec::new("base").step(BuildStep::Run {
            cmd: "echo one".into(),
        });
        let b = TemplateSpec::new("base").step(BuildStep::Run {
            cmd: "echo two".into(),
        });

        assert_eq!(a.cache_key()?, a.clone().cache_key()?);
        assert_ne!(a.cache_key()?, b.cache_key()?);
        assert_eq!(a.cache_key()?.len(), 64);
        Ok(())
    }

    #[test]
    fn test_validate_rejects_bad_steps() {
        assert!(TemplateSpec::new("").validate().is_err());
        assert!(TemplateSpec::new("base")
            .step(BuildStep::Env {
                key: "A B".into(),
                value: "x".into()
            })
            .validate()
            .is_err());
        assert!(TemplateSpec::new("base")
            .step(BuildStep::Install {
                manager: PackageManager::Pip,
                packages: vec!["--index-url=evil".into()]
            })
            .validate()
            .is_err());
        assert!(TemplateSpec::new("base")
            .start("  ", None)
            .validate()
            .is_err());
        assert!(TemplateSpec::new("python:3.12")
            .step(BuildStep::Install {
                manager: PackageManager::Pip,
                packages: vec!["requests".into()]
            })
            .start(
                "python -m http.server 8000",
                Some(ReadinessCheck::Port { port: 8000 })
            )
            .validate()
            .is_ok());
    }

    #[test]
    fn test_alias_rules() {
        assert!(validate_alias("my-template.v2").is_ok());
        assert!(validate_alias("Upper").is_err());
        assert!(validate_alias("-leading").is_err());
        assert!(validate_alias("").is_err());
    }
}
