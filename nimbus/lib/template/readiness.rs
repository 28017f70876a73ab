use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;

use crate::{guest::GuestAgent, NimbusError, NimbusResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// How long a single check attempt may take.
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(2);

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A predicate deciding when a start command has finished initializing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReadinessCheck {
    /// Something accepts TCP connections on the guest port.
    Port {
        /// The guest port.
        port: u16,
    },

    /// An HTTP GET answers. `localhost` in the URL refers to the guest.
    Url {
        /// The URL to fetch.
        url: String,

        /// The status to wait for. Any success status when unset.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<u16>,
    },

    /// A file exists in the guest.
    File {
        /// The guest path.
        path: String,
    },

    /// A guest process whose command line contains `name` is running.
    Process {
        /// The substring to look for.
        name: String,
    },
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ReadinessCheck {
    /// Rejects checks that can never succeed.
    pub fn validate(&self) -> NimbusResult<()> {
        match self {
            ReadinessCheck::Port { port: 0 } => Err(NimbusError::InvalidArgument(
                "readiness check port must not be 0".into(),
            )),
            ReadinessCheck::Url { url, .. } => reqwest::Url::parse(url).map(|_| ()).map_err(|e| {
                NimbusError::InvalidArgument(format!("invalid readiness check url {url}: {e}"))
            }),
            ReadinessCheck::File { path } if path.is_empty() => Err(NimbusError::InvalidArgument(
                "readiness check path must not be empty".into(),
            )),
            ReadinessCheck::Process { name } if name.is_empty() => Err(
                NimbusError::InvalidArgument("readiness check process name must not be empty".into()),
            ),
            _ => Ok(()),
        }
    }

    /// Evaluates the predicate once.
    pub async fn check(&self, agent: &dyn GuestAgent, user: &str) -> bool {
        match self {
            ReadinessCheck::Port { port } => matches!(
                tokio::time::timeout(ATTEMPT_TIMEOUT, TcpStream::connect((agent.guest_addr(), *port)))
                    .await,
                Ok(Ok(_))
            ),
            ReadinessCheck::Url { url, status } => {
                let Ok(mut url) = reqwest::Url::parse(url) else {
                    return false;
                };
                if matches!(url.host_str(), Some("localhost" | "127.0.0.1")) {
                    let _ = url.set_host(Some(&agent.guest_addr().to_string()));
                }

                let response = reqwest::Client::new()
                    .get(url)
                    .timeout(ATTEMPT_TIMEOUT)
                    .send()
                    .await;
                match (response, status) {
                    (Ok(response), Some(status)) => response.status().as_u16() == *status,
                    (Ok(response), None) => response.status().is_success(),
                    (Err(_), _) => false,
                }
            }
            ReadinessCheck::File { path } => agent.stat(user, path).await.is_ok(),
            ReadinessCheck::Process { name } => agent
                .list_processes()
                .await
                .map(|processes| processes.iter().any(|p| p.cmd.contains(name.as_str())))
                .unwrap_or(false),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Polls `readiness` every `interval` until it succeeds, failing with
/// [`NimbusError::ProvisioningTimeout`] once `timeout` has elapsed.
pub async fn wait_until_ready(
    agent: &dyn GuestAgent,
    user: &str,
    readiness: &ReadinessCheck,
    interval: Duration,
    timeout: Duration,
) -> NimbusResult<()> {
    let poll = async {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if readiness.check(agent, user).await {
                return;
            }
        }
    };

    tokio::time::timeout(timeout, poll)
        .await
        .map_err(|_| NimbusError::ProvisioningTimeout(timeout))?;

    tracing::debug!(?readiness, "readiness check succeeded");
    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use bytes::Bytes;
    use tokio::net::TcpListener;

    use crate::{
        config::GuestUser,
        guest::local::{LocalAgent, LocalAgentOptions},
    };

    use super::*;

    async fn agent(root: &std::path::Path) -> anyhow::Result<LocalAgent> {
        let users = HashMap::from([(
            "user".to_string(),
            GuestUser::builder().home("/home/user").build(),
        )]);
        tokio::fs::create_dir_all(root.join("home/user")).await?;
        Ok(LocalAgent::new(
            LocalAgentOptions::builder()
                .sandbox_id("sbx_ready")
                .rootfs(root)
                .users(users)
                .build(),
        )
        .await?)
    }

    #[tokio::test]
    async fn test_file_check_waits_for_the_file() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let agent = agent(tmp.path()).await?;
        let readiness = ReadinessCheck::File {
            path: "/home/user/ready".into(),
        };

        assert!(!readiness.check(&agent, "user").await);
        let result = wait_until_ready(
            &agent,
            "user",
            &readiness,
            Duration::from_millis(10),
            Duration::from_millis(100),
        )
        .await;
        assert!(matches!(result, Err(NimbusError::ProvisioningTimeout(_))));

        agent
            .write_file("user", "/home/user/ready", Bytes::new())
            .await?;
        wait_until_ready(
            &agent,
            "user",
            &readiness,
            Duration::from_millis(10),
            Duration::from_secs(1),
        )
        .await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_port_check() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let agent = agent(tmp.path()).await?;
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();

        assert!(ReadinessCheck::Port { port }.check(&agent, "user").await);
        drop(listener);
        Ok(())
    }

    #[test]
    fn test_validate() {
        assert!(ReadinessCheck::Port { port: 0 }.validate().is_err());
        assert!(ReadinessCheck::Url {
            url: "not a url".into(),
            status: None
        }
        .validate()
        .is_err());
        assert!(ReadinessCheck::Url {
            url: "http://localhost:8080/health".into(),
            status: Some(200)
        }
        .validate()
        .is_ok());
    }
}
