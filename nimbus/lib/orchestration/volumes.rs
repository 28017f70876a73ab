use crate::{config::VolumeDeletePolicy, NimbusError, NimbusResult};

use super::Orchestrator;

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Orchestrator {
    /// Deletes a volume, honoring the configured policy for volumes that live sandboxes mount.
    ///
    /// With [`VolumeDeletePolicy::Reject`] the call fails with [`NimbusError::VolumeInUse`].
    /// With [`VolumeDeletePolicy::ForceDetach`] the volume is unmounted from every sandbox
    /// first; those sandboxes keep running without it.
    pub async fn delete_volume(&self, team: &str, id_or_name: &str) -> NimbusResult<()> {
        let volume = self.volumes.get(team, id_or_name).await?;

        let users = self
            .sandboxes
            .read()
            .await
            .values()
            .filter(|entry| {
                entry.team == team
                    && entry.state().is_live()
                    && entry
                        .status()
                        .volume
                        .is_some_and(|attachment| attachment.volume_id == volume.id)
            })
            .cloned()
            .collect::<Vec<_>>();

        if !users.is_empty() {
            match self.config.get_volume_delete_policy() {
                VolumeDeletePolicy::Reject => {
                    return Err(NimbusError::VolumeInUse {
                        volume: volume.name,
                        sandboxes: users.iter().map(|entry| entry.id.clone()).collect(),
                    })
                }
                VolumeDeletePolicy::ForceDetach => {
                    for entry in users {
                        let _lifecycle = entry.lifecycle.lock().await;
                        let Some(attachment) = entry.status().volume else {
                            continue;
                        };

                        if let Some(gateway) = entry.gateway.get() {
                            gateway.agent().unmount(&attachment.mount_path).await?;
                        }
                        entry.status.send_modify(|status| status.volume = None);
                        entry.log.line(format!(
                            "volume {} detached from {}",
                            attachment.volume_name, attachment.mount_path
                        ));
                        tracing::info!(
                            sandbox_id = %entry.id,
                            volume_id = %volume.id,
                            "force-detached volume"
                        );
                    }
                }
            }
        }

        self.volumes.delete(team, &volume.id).await
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
