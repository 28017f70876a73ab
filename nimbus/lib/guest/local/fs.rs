use std::{fs::Metadata, io, os::unix::fs::MetadataExt, path::Path};

use bytes::{Bytes, BytesMut};
use futures::stream::BoxStream;
use tokio::io::AsyncReadExt;

use crate::{
    config::GuestUser,
    guest::{entry_info, io_error, EntryInfo, EntryKind},
    utils::dir_usage,
    NimbusError, NimbusResult,
};

use super::{agent::Resolved, LocalAgent};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Read,
    Write,
    Search,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl LocalAgent {
    pub(super) async fn fs_read(&self, user: &str, path: &str) -> NimbusResult<Bytes> {
        let (user, resolved) = self.resolve_for(user, path).await?;
        let meta = entry_metadata(&resolved).await?;
        if meta.is_dir() {
            return Err(NimbusError::InvalidArgument(format!(
                "{} is a directory",
                resolved.guest
            )));
        }
        require(&user, &meta, Access::Read, &resolved.guest)?;

        let data = tokio::fs::read(&resolved.host)
            .await
            .map_err(|e| io_error(e, &resolved.guest))?;
        Ok(Bytes::from(data))
    }

    pub(super) async fn fs_read_chunks(
        &self,
        user: &str,
        path: &str,
        chunk_size: usize,
    ) -> NimbusResult<BoxStream<'static, NimbusResult<Bytes>>> {
        let (user, resolved) = self.resolve_for(user, path).await?;
        let meta = entry_metadata(&resolved).await?;
        if meta.is_dir() {
            return Err(NimbusError::InvalidArgument(format!(
                "{} is a directory",
                resolved.guest
            )));
        }
        require(&user, &meta, Access::Read, &resolved.guest)?;

        let mut file = tokio::fs::File::open(&resolved.host)
            .await
            .map_err(|e| io_error(e, &resolved.guest))?;
        let chunk_size = chunk_size.max(1);

        let stream = async_stream::stream! {
            loop {
                match read_chunk(&mut file, chunk_size).await {
                    Ok(Some(chunk)) => {
                        yield Ok::<Bytes, NimbusError>(chunk);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(NimbusError::from(e));
                        break;
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }

    pub(super) async fn fs_write(
        &self,
        user: &str,
        path: &str,
        data: Bytes,
    ) -> NimbusResult<EntryInfo> {
        let (user, resolved) = self.resolve_for(user, path).await?;
        if resolved.is_root() {
            return Err(NimbusError::InvalidArgument(format!(
                "{} is a directory",
                resolved.guest
            )));
        }

        let existing = match tokio::fs::symlink_metadata(&resolved.host).await {
            Ok(meta) if meta.is_dir() => {
                return Err(NimbusError::InvalidArgument(format!(
                    "{} is a directory",
                    resolved.guest
                )))
            }
            Ok(meta) => {
                require(&user, &meta, Access::Write, &resolved.guest)?;
                Some(meta.len())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(io_error(e, &resolved.guest)),
        };

        if let Some(limit) = self.options.disk_limit_bytes.filter(|_| !resolved.mounted) {
            let (used, _) = dir_usage(self.rootfs()).await?;
            let used = used.saturating_sub(existing.unwrap_or(0));
            let available = limit.saturating_sub(used);
            if data.len() as u64 > available {
                return Err(NimbusError::NotEnoughSpace {
                    needed: data.len() as u64,
                    available,
                });
            }
        }

        if existing.is_none() {
            self.create_parents(&user, &resolved).await?;
        }

        tokio::fs::write(&resolved.host, &data)
            .await
            .map_err(|e| io_error(e, &resolved.guest))?;
        if existing.is_none() {
            assign_owner(&resolved.host, &user);
        }

        tracing::trace!(sandbox_id = %self.sandbox_id(), path = %resolved.guest, bytes = data.len(), "wrote file");
        entry_info(&resolved.guest, &resolved.host).await
    }

    pub(super) async fn fs_list(
        &self,
        user: &str,
        path: &str,
        depth: usize,
    ) -> NimbusResult<Vec<EntryInfo>> {
        let (user, resolved) = self.resolve_for(user, path).await?;
        let depth = depth.max(1);

        let mut entries = Vec::new();
        let mut pending = vec![(resolved, 1usize)];
        while let Some((dir, level)) = pending.pop() {
            let meta = entry_metadata(&dir).await?;
            if !meta.is_dir() {
                if level == 1 {
                    return Err(NimbusError::InvalidArgument(format!(
                        "{} is not a directory",
                        dir.guest
                    )));
                }
                continue;
            }
            require(&user, &meta, Access::Read, &dir.guest)?;
            require(&user, &meta, Access::Search, &dir.guest)?;

            let mut read_dir = tokio::fs::read_dir(&dir.host)
                .await
                .map_err(|e| io_error(e, &dir.guest))?;
            while let Some(child) = read_dir.next_entry().await? {
                let name = child.file_name().to_string_lossy().into_owned();
                let guest = if dir.guest == "/" {
                    format!("/{name}")
                } else {
                    format!("{}/{name}", dir.guest)
                };

                // Re-resolving picks up storage mounted below this directory.
                let child = self.resolve(&user, &guest).await?;
                let info = entry_info(&child.guest, &child.host).await?;
                if info.kind == EntryKind::Dir && level < depth {
                    pending.push((child, level + 1));
                }
                entries.push(info);
            }
        }

        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    pub(super) async fn fs_stat(&self, user: &str, path: &str) -> NimbusResult<EntryInfo> {
        let (_, resolved) = self.resolve_for(user, path).await?;
        entry_info(&resolved.guest, &resolved.host).await
    }

    pub(super) async fn fs_remove(&self, user: &str, path: &str) -> NimbusResult<()> {
        let (user, resolved) = self.resolve_for(user, path).await?;
        if resolved.is_root() {
            return Err(NimbusError::InvalidArgument(format!(
                "cannot remove {}",
                resolved.guest
            )));
        }

        let meta = entry_metadata(&resolved).await?;
        self.require_parent(&user, &resolved, Access::Write).await?;

        if meta.is_dir() {
            tokio::fs::remove_dir_all(&resolved.host).await
        } else {
            tokio::fs::remove_file(&resolved.host).await
        }
        .map_err(|e| io_error(e, &resolved.guest))?;

        tracing::trace!(sandbox_id = %self.sandbox_id(), path = %resolved.guest, "removed entry");
        Ok(())
    }

    pub(super) async fn fs_rename(
        &self,
        user: &str,
        from: &str,
        to: &str,
    ) -> NimbusResult<EntryInfo> {
        let (user, source) = self.resolve_for(user, from).await?;
        let target = self.resolve(&user, to).await?;
        require_traversal(&user, &target).await?;
        if source.is_root() || target.is_root() {
            return Err(NimbusError::InvalidArgument(
                "cannot rename a mount point or the root directory".into(),
            ));
        }

        entry_metadata(&source).await?;
        self.require_parent(&user, &source, Access::Write).await?;
        self.create_parents(&user, &target).await?;

        tokio::fs::rename(&source.host, &target.host)
            .await
            .map_err(|e| io_error(e, &source.guest))?;
        entry_info(&target.guest, &target.host).await
    }

    pub(super) async fn fs_make_dir(&self, user: &str, path: &str) -> NimbusResult<bool> {
        let (user, resolved) = self.resolve_for(user, path).await?;
        match tokio::fs::metadata(&resolved.host).await {
            Ok(meta) if meta.is_dir() => return Ok(false),
            Ok(_) => return Err(NimbusError::AlreadyExists(resolved.guest)),
            Err(_) => {}
        }

        self.create_parents(&user, &resolved).await?;
        tokio::fs::create_dir(&resolved.host)
            .await
            .map_err(|e| io_error(e, &resolved.guest))?;
        assign_owner(&resolved.host, &user);
        Ok(true)
    }

    pub(super) async fn resolve_for(
        &self,
        user: &str,
        path: &str,
    ) -> NimbusResult<(GuestUser, Resolved)> {
        let user = self.user(user)?.clone();
        let resolved = self.resolve(&user, path).await?;
        require_traversal(&user, &resolved).await?;
        Ok((user, resolved))
    }

    /// Creates the missing ancestors of `resolved`, checking write access on the deepest
    /// existing one.
    async fn create_parents(&self, user: &GuestUser, resolved: &Resolved) -> NimbusResult<()> {
        let Some(parent) = resolved.host.parent() else {
            return Ok(());
        };

        let mut missing = Vec::new();
        let mut existing = parent.to_path_buf();
        loop {
            match tokio::fs::metadata(&existing).await {
                Ok(meta) if meta.is_dir() => {
                    require(user, &meta, Access::Write, &resolved.guest)?;
                    break;
                }
                Ok(_) => {
                    return Err(NimbusError::InvalidArgument(format!(
                        "a parent of {} is not a directory",
                        resolved.guest
                    )))
                }
                Err(_) => {
                    missing.push(existing.clone());
                    match existing.parent() {
                        Some(up) if existing.starts_with(&resolved.root) => {
                            existing = up.to_path_buf()
                        }
                        _ => break,
                    }
                }
            }
        }

        for dir in missing.iter().rev() {
            match tokio::fs::create_dir(dir).await {
                Ok(()) => assign_owner(dir, user),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(io_error(e, &resolved.guest)),
            }
        }

        Ok(())
    }

    async fn require_parent(
        &self,
        user: &GuestUser,
        resolved: &Resolved,
        access: Access,
    ) -> NimbusResult<()> {
        if let Some(parent) = resolved.host.parent() {
            let meta = tokio::fs::metadata(parent)
                .await
                .map_err(|e| io_error(e, &resolved.guest))?;
            require(user, &meta, access, &resolved.guest)?;
        }
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Reads up to `chunk_size` bytes, returning `None` at end of file.
async fn read_chunk(file: &mut tokio::fs::File, chunk_size: usize) -> io::Result<Option<Bytes>> {
    let mut buf = BytesMut::zeroed(chunk_size);
    let mut filled = 0;
    while filled < chunk_size {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }

    if filled == 0 {
        return Ok(None);
    }

    buf.truncate(filled);
    Ok(Some(buf.freeze()))
}

async fn entry_metadata(resolved: &Resolved) -> NimbusResult<Metadata> {
    tokio::fs::metadata(&resolved.host)
        .await
        .map_err(|e| io_error(e, &resolved.guest))
}

/// Whether operations of `user` are checked by the agent.
///
/// Users without a mapped uid run as the agent itself and the kernel checks their operations.
/// Root passes every check.
fn restricted(user: &GuestUser) -> Option<u32> {
    user.uid.filter(|uid| *uid != 0)
}

/// Checks search permission on every directory from the storage root down to the parent of
/// `resolved`, the way path lookup does in the kernel.
async fn require_traversal(user: &GuestUser, resolved: &Resolved) -> NimbusResult<()> {
    if restricted(user).is_none() {
        return Ok(());
    }
    let Ok(relative) = resolved.host.strip_prefix(&resolved.root) else {
        return Ok(());
    };

    let components = relative.components().collect::<Vec<_>>();
    let mut dir = resolved.root.clone();
    for (index, component) in components.iter().enumerate() {
        match tokio::fs::metadata(&dir).await {
            Ok(meta) if meta.is_dir() => require(user, &meta, Access::Search, &resolved.guest)?,
            // Whatever comes next reports the missing or mistyped ancestor.
            Ok(_) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(io_error(e, &resolved.guest)),
        }

        if index + 1 < components.len() {
            dir.push(component);
        }
    }

    Ok(())
}

/// Checks `access` against the owner, group and other permission bits for a mapped uid.
fn require(user: &GuestUser, meta: &Metadata, access: Access, guest: &str) -> NimbusResult<()> {
    let Some(uid) = restricted(user) else {
        return Ok(());
    };

    let shift = if meta.uid() == uid {
        6
    } else if user.gid.is_some_and(|gid| gid == meta.gid()) {
        3
    } else {
        0
    };
    let bit = match access {
        Access::Read => 0o4,
        Access::Write => 0o2,
        Access::Search => 0o1,
    };

    if (meta.mode() >> shift) & bit == 0 {
        return Err(NimbusError::PermissionDenied(guest.to_string()));
    }

    Ok(())
}

/// Hands a freshly created entry to the mapped user. Only possible when the agent runs as root.
fn assign_owner(path: &Path, user: &GuestUser) {
    if user.uid.is_none() || !nix::unistd::geteuid().is_root() {
        return;
    }

    let uid = user.uid.map(nix::unistd::Uid::from_raw);
    let gid = user.gid.map(nix::unistd::Gid::from_raw);
    if let Err(e) = nix::unistd::chown(path, uid, gid) {
        tracing::warn!(path = %path.display(), error = %e, "failed to hand entry to guest user");
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use std::os::unix::fs::PermissionsExt;

    use futures::TryStreamExt;

    use crate::guest::{local::LocalAgentOptions, GuestAgent};

    use super::{super::agent::test_agent, *};

    #[tokio::test]
    async fn test_write_read_binary_and_empty() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let agent = test_agent(tmp.path()).await?;

        let binary = Bytes::from_static(&[0, 159, 146, 150, 0, 255, b'\n', 0]);
        agent.write_file("user", "/tmp/deep/dir/blob.bin", binary.clone()).await?;
        assert_eq!(agent.read_file("user", "/tmp/deep/dir/blob.bin").await?, binary);

        agent.write_file("user", "empty.txt", Bytes::new()).await?;
        assert_eq!(agent.read_file("user", "/home/user/empty.txt").await?, Bytes::new());

        assert!(matches!(
            agent.read_file("user", "/missing").await,
            Err(NimbusError::PathNotFound(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_chunked_read() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let agent = test_agent(tmp.path()).await?;

        let data = (0..10_000u32).map(|i| (i % 251) as u8).collect::<Vec<_>>();
        agent.write_file("user", "/data.bin", Bytes::from(data.clone())).await?;

        let chunks = agent
            .read_file_chunks("user", "/data.bin", 4096)
            .await?
            .try_collect::<Vec<_>>()
            .await?;
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.concat(), data);
        Ok(())
    }

    #[tokio::test]
    async fn test_list_stat_rename_remove() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let agent = test_agent(tmp.path()).await?;

        agent.write_file("user", "/workspace/a/one.txt", Bytes::from("1")).await?;
        agent.write_file("user", "/workspace/b.txt", Bytes::from("22")).await?;
        assert!(agent.make_dir("user", "/workspace/c").await?);
        assert!(!agent.make_dir("user", "/workspace/c").await?);

        let shallow = agent.list_dir("user", "/workspace", 1).await?;
        let names = shallow.iter().map(|e| e.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["a", "b.txt", "c"]);

        let deep = agent.list_dir("user", "/workspace", 2).await?;
        assert!(deep.iter().any(|e| e.path == "/workspace/a/one.txt"));

        let info = agent.stat("user", "/workspace/b.txt").await?;
        assert_eq!(info.kind, EntryKind::File);
        assert_eq!(info.size, 2);

        let moved = agent
            .rename("user", "/workspace/b.txt", "/workspace/c/b.txt")
            .await?;
        assert_eq!(moved.path, "/workspace/c/b.txt");
        assert!(agent.stat("user", "/workspace/b.txt").await.is_err());

        agent.remove("user", "/workspace/a").await?;
        assert!(matches!(
            agent.stat("user", "/workspace/a/one.txt").await,
            Err(NimbusError::PathNotFound(_))
        ));
        assert!(agent.remove("user", "/workspace").await.is_err());

        // Mounted content lives in the volume directory, not the sandbox root.
        assert!(tmp.path().join("volume/c/b.txt").exists());
        assert!(!tmp.path().join("rootfs/workspace/c").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_disk_limit_is_enforced_outside_mounts() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let users = HashMap::from([(
            "user".to_string(),
            GuestUser::builder().home("/home/user").build(),
        )]);
        let agent = LocalAgent::new(
            LocalAgentOptions::builder()
                .sandbox_id("sbx_disk")
                .rootfs(tmp.path().join("rootfs"))
                .users(users)
                .disk_limit_bytes(1024)
                .mounts(vec![("/workspace".to_string(), tmp.path().join("volume"))])
                .build(),
        )
        .await?;

        agent.write_file("user", "/a.bin", Bytes::from(vec![1u8; 1000])).await?;
        // Overwriting only counts the difference.
        agent.write_file("user", "/a.bin", Bytes::from(vec![2u8; 1020])).await?;

        let err = agent
            .write_file("user", "/b.bin", Bytes::from(vec![0u8; 100]))
            .await
            .unwrap_err();
        assert!(matches!(err, NimbusError::NotEnoughSpace { needed: 100, available: 4 }));

        agent
            .write_file("user", "/workspace/big.bin", Bytes::from(vec![0u8; 4096]))
            .await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_closed_parent_directory_denies_mapped_users() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let rootfs = tmp.path().join("rootfs");
        std::fs::create_dir_all(rootfs.join("private"))?;
        std::fs::create_dir_all(rootfs.join("home/user"))?;
        std::fs::write(rootfs.join("private/secret.txt"), b"top secret")?;
        std::fs::set_permissions(
            rootfs.join("private/secret.txt"),
            std::fs::Permissions::from_mode(0o644),
        )?;
        std::fs::set_permissions(rootfs.join("private"), std::fs::Permissions::from_mode(0o700))?;
        std::fs::set_permissions(&rootfs, std::fs::Permissions::from_mode(0o755))?;
        let owner = std::fs::metadata(rootfs.join("private"))?;

        let users = HashMap::from([(
            "user".to_string(),
            GuestUser::builder()
                .uid(owner.uid().wrapping_add(4242))
                .gid(owner.gid().wrapping_add(4242))
                .home("/home/user")
                .build(),
        )]);
        let agent = LocalAgent::new(
            LocalAgentOptions::builder()
                .sandbox_id("sbx_perm")
                .rootfs(rootfs.clone())
                .users(users)
                .build(),
        )
        .await?;

        let denied =
            |result: NimbusResult<()>| matches!(result, Err(NimbusError::PermissionDenied(_)));
        assert!(denied(agent.read_file("user", "/private/secret.txt").await.map(|_| ())));
        assert!(denied(agent.stat("user", "/private/secret.txt").await.map(|_| ())));
        assert!(denied(agent.list_dir("user", "/private", 1).await.map(|_| ())));
        assert!(denied(
            agent
                .write_file("user", "/private/other.txt", Bytes::from("x"))
                .await
                .map(|_| ())
        ));
        assert!(denied(
            agent
                .rename("user", "/home/user", "/private/moved")
                .await
                .map(|_| ())
        ));

        // The directory itself can still be looked up from its open parent.
        assert!(agent.stat("user", "/private").await.is_ok());

        // Open directories stay readable.
        std::fs::write(rootfs.join("home/user/open.txt"), b"hello")?;
        std::fs::set_permissions(rootfs.join("home"), std::fs::Permissions::from_mode(0o755))?;
        std::fs::set_permissions(rootfs.join("home/user"), std::fs::Permissions::from_mode(0o755))?;
        std::fs::set_permissions(
            rootfs.join("home/user/open.txt"),
            std::fs::Permissions::from_mode(0o644),
        )?;
        assert_eq!(agent.read_file("user", "open.txt").await?, Bytes::from("hello"));
        Ok(())
    }

    #[test]
    fn test_permission_bits_for_mapped_users() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("secret");
        std::fs::write(&path, b"x")?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
        let meta = std::fs::metadata(&path)?;

        let owner = GuestUser {
            uid: Some(meta.uid()),
            gid: Some(meta.gid()),
            home: String::new(),
        };
        let stranger = GuestUser {
            uid: Some(meta.uid().wrapping_add(4242)),
            gid: Some(meta.gid().wrapping_add(4242)),
            home: String::new(),
        };

        assert!(require(&owner, &meta, Access::Read, "/secret").is_ok());
        assert!(matches!(
            require(&stranger, &meta, Access::Read, "/secret"),
            Err(NimbusError::PermissionDenied(_))
        ));
        assert!(require(&GuestUser::default(), &meta, Access::Write, "/secret").is_ok());
        Ok(())
    }
}
