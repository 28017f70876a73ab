use std::{collections::HashMap, path::Path};

use nimbus::{
    config::{NimbusConfig, VolumeDeletePolicy},
    gateway::{CommandOptions, ReadFormat},
    ledger::TeamUsage,
    orchestration::{CreateOptions, SandboxState, VolumeMount},
    ErrorKind, Nimbus, NimbusError,
};

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[test_log::test(tokio::test)]
async fn test_creating_a_volume_twice_returns_the_same_volume() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let nimbus = Nimbus::new(config(tmp.path())).await?;

    let first = nimbus.volumes().create("team-a", "scratch").await?;
    let second = nimbus.volumes().create("team-a", "scratch").await?;
    assert_eq!(first.id, second.id);
    assert_eq!(first.created_at, second.created_at);

    let page = nimbus.volumes().list("team-a", None, None).await?;
    assert_eq!(page.items.len(), 1);

    // Names are scoped per team.
    let other = nimbus.volumes().create("team-b", "scratch").await?;
    assert_ne!(other.id, first.id);

    nimbus.shutdown().await;
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_volume_data_outlives_the_sandbox() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let nimbus = Nimbus::new(config(tmp.path())).await?;
    nimbus.volumes().create("team-a", "project").await?;

    let first = nimbus
        .orchestrator()
        .create("team-a", with_volume("project", "/workspace"))
        .await?;
    first
        .gateway()?
        .write("/workspace/notes/todo.txt", "ship it", None)
        .await?;
    assert!(first.kill().await?);

    // Readable without any sandbox.
    let data = nimbus
        .volumes()
        .download("team-a", "project", "/notes/todo.txt")
        .await?;
    assert_eq!(&data[..], b"ship it");

    // And from a new sandbox mounting it somewhere else.
    let second = nimbus
        .orchestrator()
        .create("team-a", with_volume("project", "/data/project"))
        .await?;
    let content = second
        .gateway()?
        .read("/data/project/notes/todo.txt", ReadFormat::Text, None)
        .await?
        .into_bytes()
        .await?;
    assert_eq!(&content[..], b"ship it");

    let volume = nimbus.volumes().get("team-a", "project").await?;
    assert_eq!(volume.file_count, 1);
    assert_eq!(volume.size_bytes, 7);

    nimbus.shutdown().await;
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_command_output_written_under_the_mount_reaches_the_volume() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let nimbus = Nimbus::new(config(tmp.path())).await?;
    nimbus.volumes().create("team-a", "build").await?;

    let sandbox = nimbus
        .orchestrator()
        .create("team-a", with_volume("build", "/workspace"))
        .await?;
    let result = sandbox
        .gateway()?
        .run(
            "mkdir -p out && printf 'artifact' > out/result.txt",
            CommandOptions::builder().cwd("/workspace").build(),
        )
        .await?;
    assert_eq!(result.exit_code, 0, "{}", result.stderr);
    assert!(sandbox.kill().await?);

    let data = nimbus
        .volumes()
        .download("team-a", "build", "/out/result.txt")
        .await?;
    assert_eq!(&data[..], b"artifact");

    // A new sandbox sees the command's output at its own mount path.
    let second = nimbus
        .orchestrator()
        .create("team-a", with_volume("build", "/data/build"))
        .await?;
    let result = second
        .gateway()?
        .run(
            "cat out/result.txt",
            CommandOptions::builder().cwd("/data/build").build(),
        )
        .await?;
    assert_eq!(result.stdout, "artifact");

    nimbus.shutdown().await;
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_bad_mount_path_reserves_nothing() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let nimbus = Nimbus::new(config(tmp.path())).await?;
    nimbus.volumes().create("team-a", "project").await?;

    for path in ["/etc/project", "/workspace/../etc", "workspace", "/"] {
        let err = nimbus
            .orchestrator()
            .create("team-a", with_volume("project", path))
            .await
            .unwrap_err();
        assert!(
            matches!(err, NimbusError::InvalidMountPath { .. }),
            "{path}: {err}"
        );
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    assert_eq!(
        nimbus.orchestrator().ledger().usage("team-a").await,
        TeamUsage::default()
    );
    let page = nimbus
        .orchestrator()
        .list("team-a", &HashMap::new(), None, None)
        .await?;
    assert!(page.items.is_empty());

    nimbus.shutdown().await;
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_mount_paths_under_allowed_prefixes_are_accepted() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let nimbus = Nimbus::new(config(tmp.path())).await?;
    let orchestrator = nimbus.orchestrator();

    let accepted = [
        ("/workspace", "/workspace"),
        ("/data/a/b", "/data/a/b"),
        ("/mnt/./disk", "/mnt/disk"),
        ("/volumes/x/../y", "/volumes/y"),
        ("/workspace/", "/workspace"),
    ];
    for (path, normalized) in accepted {
        assert_eq!(orchestrator.validate_mount_path(path)?, normalized, "{path}");
    }

    let rejected = ["/work", "/workspaces", "/data/../../etc", "/tmp", "", "data/x"];
    for path in rejected {
        assert!(
            orchestrator.validate_mount_path(path).is_err(),
            "{path} should be rejected"
        );
    }

    nimbus.shutdown().await;
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_deleting_a_mounted_volume_follows_the_policy() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let nimbus = Nimbus::new(config(tmp.path())).await?;
    nimbus.volumes().create("team-a", "shared").await?;

    let sandbox = nimbus
        .orchestrator()
        .create("team-a", with_volume("shared", "/workspace"))
        .await?;

    let err = nimbus
        .orchestrator()
        .delete_volume("team-a", "shared")
        .await
        .unwrap_err();
    match err {
        NimbusError::VolumeInUse { sandboxes, .. } => {
            assert_eq!(sandboxes, vec![sandbox.id().to_string()]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(sandbox.state(), SandboxState::Running);

    sandbox.kill().await?;
    nimbus.orchestrator().delete_volume("team-a", "shared").await?;
    assert!(matches!(
        nimbus.volumes().get("team-a", "shared").await,
        Err(NimbusError::VolumeNotFound(_))
    ));

    nimbus.shutdown().await;
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_force_detach_keeps_the_sandbox_running() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let config = NimbusConfig::builder()
        .home_dir(tmp.path())
        .volume_delete_policy(VolumeDeletePolicy::ForceDetach)
        .build();
    let nimbus = Nimbus::new(config).await?;
    nimbus.volumes().create("team-a", "shared").await?;

    let sandbox = nimbus
        .orchestrator()
        .create("team-a", with_volume("shared", "/workspace"))
        .await?;
    nimbus.orchestrator().delete_volume("team-a", "shared").await?;

    let info = sandbox.info();
    assert_eq!(info.state, SandboxState::Running);
    assert!(info.volume.is_none());

    let result = sandbox
        .gateway()?
        .run("echo still here", Default::default())
        .await?;
    assert_eq!(result.stdout, "still here\n");

    nimbus.shutdown().await;
    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn config(home: &Path) -> NimbusConfig {
    NimbusConfig::builder().home_dir(home).build()
}

fn with_volume(volume: &str, mount_path: &str) -> CreateOptions {
    CreateOptions::builder()
        .volume(VolumeMount {
            volume: volume.to_string(),
            mount_path: mount_path.to_string(),
        })
        .build()
}
