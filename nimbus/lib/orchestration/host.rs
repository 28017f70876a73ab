use crate::{
    network::{host_for, parse_host},
    NimbusError, NimbusResult,
};

use super::{Orchestrator, ResolvedHost, SandboxState};

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Orchestrator {
    /// The public host name of a guest port.
    pub async fn get_host(&self, team: &str, id: &str, port: u16) -> NimbusResult<String> {
        if port == 0 {
            return Err(NimbusError::InvalidArgument("port must be positive".into()));
        }

        let entry = self.entry(team, id).await?;
        Ok(host_for(port, &entry.id, &entry.domain))
    }

    /// Routes a public host name to the guest port behind it.
    ///
    /// Sandboxes created with public traffic disabled also require their traffic access token.
    pub async fn resolve_host(&self, host: &str, token: Option<&str>) -> NimbusResult<ResolvedHost> {
        let (port, sandbox_id) = parse_host(host, self.config.get_domain())
            .ok_or_else(|| NimbusError::SandboxNotFound(host.to_string()))?;

        let entry = self
            .sandboxes
            .read()
            .await
            .get(&sandbox_id)
            .cloned()
            .ok_or_else(|| NimbusError::SandboxNotFound(sandbox_id.clone()))?;

        if !entry.network.allow_public_traffic {
            match token {
                None => {
                    return Err(NimbusError::Unauthenticated(
                        "this sandbox requires a traffic access token".into(),
                    ))
                }
                Some(token) if token != entry.traffic_token => {
                    return Err(NimbusError::PermissionDenied("invalid traffic access token".into()))
                }
                Some(_) => {}
            }
        }

        if entry.state() != SandboxState::Running {
            return Err(NimbusError::InvalidStateTransition {
                sandbox: sandbox_id,
                state: entry.state(),
                action: "serve traffic",
            });
        }

        let agent = entry.gateway("serve traffic")?.agent().clone();
        Ok(ResolvedHost {
            sandbox_id,
            port,
            target: std::net::SocketAddr::new(agent.guest_addr(), port),
        })
    }

    /// The token that unlocks a sandbox's ports when public traffic is disabled.
    pub async fn traffic_token(&self, team: &str, id: &str) -> NimbusResult<String> {
        Ok(self.entry(team, id).await?.traffic_token.clone())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use crate::{
        config::NimbusConfig,
        network::NetworkPolicy,
        orchestration::{test_orchestrator, CreateOptions},
    };

    use super::*;

    #[tokio::test]
    async fn test_hosts_route_to_guest_ports() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let orchestrator = test_orchestrator(
            NimbusConfig::builder()
                .home_dir(tmp.path())
                .domain("sandbox.test")
                .build(),
        )
        .await?;

        let public = orchestrator.create("team", CreateOptions::builder().build()).await?;
        let host = public.host(3000).await?;
        assert_eq!(host, format!("3000-{}.sandbox.test", public.id()));

        let resolved = orchestrator.resolve_host(&host, None).await?;
        assert_eq!(resolved.sandbox_id, public.id());
        assert_eq!(resolved.port, 3000);
        assert_eq!(resolved.target.port(), 3000);

        let private = orchestrator
            .create(
                "team",
                CreateOptions::builder()
                    .network(NetworkPolicy::builder().allow_public_traffic(false).build())
                    .build(),
            )
            .await?;
        let host = private.host(8080).await?;
        assert!(matches!(
            orchestrator.resolve_host(&host, None).await,
            Err(NimbusError::Unauthenticated(_))
        ));
        assert!(matches!(
            orchestrator.resolve_host(&host, Some("wrong")).await,
            Err(NimbusError::PermissionDenied(_))
        ));
        orchestrator
            .resolve_host(&host, Some(private.traffic_token()))
            .await?;

        assert!(public.host(0).await.is_err());
        assert!(orchestrator
            .resolve_host("3000-sbx_1.elsewhere.test", None)
            .await
            .is_err());

        public.kill().await?;
        assert!(matches!(
            orchestrator
                .resolve_host(&format!("3000-{}.sandbox.test", public.id()), None)
                .await,
            Err(NimbusError::SandboxNotFound(_))
        ));
        Ok(())
    }
}
