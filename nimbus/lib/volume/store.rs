use std::path::PathBuf;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::Stream;
use nimbusutils::{normalize_path, SupportedPathType};
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteRow, Pool, Row, Sqlite};

use crate::{
    guest::{entry_info, io_error, EntryInfo},
    utils::{
        db_timestamp, decode_page_token, dir_usage, encode_page_token, ensure_contained, new_id,
        paginate, parse_db_timestamp, IdKind, Page,
    },
    NimbusError, NimbusResult,
};

use super::validate_volume_name;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A persistent volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    /// The volume id.
    pub id: String,

    /// The unique, immutable name within the team.
    pub name: String,

    /// The owning team.
    pub team: String,

    /// Total bytes stored.
    pub size_bytes: u64,

    /// Number of regular files stored.
    pub file_count: u64,

    /// When the volume was created.
    pub created_at: DateTime<Utc>,

    /// When the content last changed through the store.
    pub updated_at: DateTime<Utc>,
}

/// The volume catalog and the directories holding volume data.
///
/// Everything here works without a running sandbox.
#[derive(Debug, Clone)]
pub struct VolumeStore {
    pool: Pool<Sqlite>,
    root: PathBuf,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl VolumeStore {
    /// Creates a store over the catalog `pool`, keeping data under `root/<volume id>`.
    pub fn new(pool: Pool<Sqlite>, root: impl Into<PathBuf>) -> Self {
        Self {
            pool,
            root: root.into(),
        }
    }

    /// The directory holding a volume's data.
    pub fn data_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    /// Creates a volume, or returns the existing one if the team already has a volume with that
    /// name.
    pub async fn create(&self, team: &str, name: &str) -> NimbusResult<Volume> {
        validate_volume_name(name)?;

        let now = db_timestamp(Utc::now());
        let inserted = sqlx::query(
            r#"
            INSERT INTO volumes (id, team, name, size_bytes, file_count, created_at, updated_at)
            VALUES (?, ?, ?, 0, 0, ?, ?)
            ON CONFLICT (team, name) DO NOTHING
            "#,
        )
        .bind(new_id(IdKind::Volume))
        .bind(team)
        .bind(name)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?
        .rows_affected();

        let volume = self.find_by_name(team, name).await?.ok_or_else(|| {
            NimbusError::custom(anyhow::anyhow!("volume {name} vanished after creation"))
        })?;
        tokio::fs::create_dir_all(self.data_dir(&volume.id)).await?;

        if inserted > 0 {
            tracing::info!(team, volume_id = %volume.id, name, "created volume");
        } else {
            tracing::debug!(team, volume_id = %volume.id, name, "volume already exists");
        }
        Ok(volume)
    }

    /// Looks a volume up by id or by name.
    pub async fn get(&self, team: &str, id_or_name: &str) -> NimbusResult<Volume> {
        let found = if IdKind::Volume.matches(id_or_name) {
            let row = sqlx::query("SELECT * FROM volumes WHERE team = ? AND id = ?")
                .bind(team)
                .bind(id_or_name)
                .fetch_optional(&self.pool)
                .await?;
            row.as_ref().map(volume_from_row).transpose()?
        } else {
            self.find_by_name(team, id_or_name).await?
        };

        found.ok_or_else(|| NimbusError::VolumeNotFound(id_or_name.to_string()))
    }

    /// Lists a team's volumes ordered by name.
    pub async fn list(
        &self,
        team: &str,
        limit: Option<usize>,
        page_token: Option<&str>,
    ) -> NimbusResult<Page<Volume>> {
        let after = page_token.map(decode_page_token).transpose()?;
        let fetch = limit.filter(|l| *l > 0).map(|l| l as i64 + 1).unwrap_or(-1);

        let rows = sqlx::query(
            r#"
            SELECT * FROM volumes
            WHERE team = ? AND (? IS NULL OR name > ?)
            ORDER BY name
            LIMIT ?
            "#,
        )
        .bind(team)
        .bind(&after)
        .bind(&after)
        .bind(fetch)
        .fetch_all(&self.pool)
        .await?;

        let mut items = rows
            .iter()
            .map(volume_from_row)
            .collect::<NimbusResult<Vec<_>>>()?;

        let next_token = match limit {
            Some(limit) if limit > 0 && items.len() > limit => {
                items.truncate(limit);
                items.last().map(|v| encode_page_token(&v.name))
            }
            _ => None,
        };

        Ok(Page { items, next_token })
    }

    /// Lazily walks every volume of a team, one page at a time.
    pub fn stream<'a>(
        &'a self,
        team: &'a str,
        page_size: usize,
    ) -> impl Stream<Item = NimbusResult<Volume>> + 'a {
        async_stream::stream! {
            let mut token: Option<String> = None;
            loop {
                let page = match self.list(team, Some(page_size.max(1)), token.as_deref()).await {
                    Ok(page) => page,
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                };

                for volume in page.items {
                    yield Ok(volume);
                }

                match page.next_token {
                    Some(next) => token = Some(next),
                    None => break,
                }
            }
        }
    }

    /// Deletes a volume and all of its data. Irreversible.
    pub async fn delete(&self, team: &str, id: &str) -> NimbusResult<()> {
        let removed = sqlx::query("DELETE FROM volumes WHERE team = ? AND id = ?")
            .bind(team)
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if removed == 0 {
            return Err(NimbusError::VolumeNotFound(id.to_string()));
        }

        match tokio::fs::remove_dir_all(self.data_dir(id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        tracing::info!(team, volume_id = %id, "deleted volume");
        Ok(())
    }

    /// Lists one directory of a volume, ordered by name.
    pub async fn list_files(
        &self,
        team: &str,
        id_or_name: &str,
        path: &str,
        limit: Option<usize>,
        page_token: Option<&str>,
    ) -> NimbusResult<Page<EntryInfo>> {
        let volume = self.get(team, id_or_name).await?;
        let (guest, host) = self.locate(&volume.id, path)?;

        let meta = tokio::fs::metadata(&host)
            .await
            .map_err(|e| io_error(e, &guest))?;
        if !meta.is_dir() {
            return Err(NimbusError::InvalidArgument(format!(
                "{guest} is not a directory"
            )));
        }

        let mut entries = Vec::new();
        let mut read_dir = tokio::fs::read_dir(&host).await?;
        while let Some(child) = read_dir.next_entry().await? {
            let name = child.file_name().to_string_lossy().into_owned();
            let child_guest = if guest == "/" {
                format!("/{name}")
            } else {
                format!("{guest}/{name}")
            };
            entries.push(entry_info(&child_guest, &child.path()).await?);
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        paginate(entries, limit, page_token, |entry| entry.name.clone())
    }

    /// Reads a whole file from a volume.
    pub async fn download(&self, team: &str, id_or_name: &str, path: &str) -> NimbusResult<Bytes> {
        let volume = self.get(team, id_or_name).await?;
        let (guest, host) = self.locate(&volume.id, path)?;

        let meta = tokio::fs::metadata(&host)
            .await
            .map_err(|e| io_error(e, &guest))?;
        if meta.is_dir() {
            return Err(NimbusError::InvalidArgument(format!("{guest} is a directory")));
        }

        let data = tokio::fs::read(&host).await.map_err(|e| io_error(e, &guest))?;
        Ok(Bytes::from(data))
    }

    /// Writes a file into a volume, creating missing directories.
    pub async fn upload(
        &self,
        team: &str,
        id_or_name: &str,
        path: &str,
        data: Bytes,
    ) -> NimbusResult<EntryInfo> {
        let volume = self.get(team, id_or_name).await?;
        let (guest, host) = self.locate(&volume.id, path)?;
        if guest == "/" {
            return Err(NimbusError::InvalidArgument("/ is a directory".into()));
        }

        if let Some(parent) = host.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(e, &guest))?;
        }
        if tokio::fs::metadata(&host).await.is_ok_and(|m| m.is_dir()) {
            return Err(NimbusError::InvalidArgument(format!("{guest} is a directory")));
        }

        tokio::fs::write(&host, &data)
            .await
            .map_err(|e| io_error(e, &guest))?;
        self.refresh_stats(&volume.id).await?;

        tracing::debug!(volume_id = %volume.id, path = %guest, bytes = data.len(), "uploaded file to volume");
        entry_info(&guest, &host).await
    }

    /// Removes a file, or a directory when `recursive` is set or the directory is empty.
    pub async fn delete_path(
        &self,
        team: &str,
        id_or_name: &str,
        path: &str,
        recursive: bool,
    ) -> NimbusResult<()> {
        let volume = self.get(team, id_or_name).await?;
        let (guest, host) = self.locate(&volume.id, path)?;
        if guest == "/" {
            return Err(NimbusError::InvalidArgument(
                "cannot delete the volume root; delete the volume instead".into(),
            ));
        }

        let meta = tokio::fs::symlink_metadata(&host)
            .await
            .map_err(|e| io_error(e, &guest))?;
        let removed = if meta.is_dir() && recursive {
            tokio::fs::remove_dir_all(&host).await
        } else if meta.is_dir() {
            tokio::fs::remove_dir(&host).await
        } else {
            tokio::fs::remove_file(&host).await
        };

        removed.map_err(|e| match e.kind() {
            std::io::ErrorKind::DirectoryNotEmpty => {
                NimbusError::InvalidArgument(format!("{guest} is not empty; delete it recursively"))
            }
            _ => io_error(e, &guest),
        })?;

        self.refresh_stats(&volume.id).await
    }

    /// Recomputes the stored size and file count of a volume from its data.
    pub async fn refresh_stats(&self, id: &str) -> NimbusResult<()> {
        let (size_bytes, file_count) = dir_usage(self.data_dir(id)).await?;
        sqlx::query(
            "UPDATE volumes SET size_bytes = ?, file_count = ?, updated_at = ? WHERE id = ?",
        )
        .bind(size_bytes as i64)
        .bind(file_count as i64)
        .bind(db_timestamp(Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_by_name(&self, team: &str, name: &str) -> NimbusResult<Option<Volume>> {
        let row = sqlx::query("SELECT * FROM volumes WHERE team = ? AND name = ?")
            .bind(team)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(volume_from_row).transpose()
    }

    /// Maps a path inside a volume onto its host location.
    fn locate(&self, id: &str, path: &str) -> NimbusResult<(String, PathBuf)> {
        let guest = normalize_path(&format!("/{path}"), SupportedPathType::Absolute)?;
        let root = self.data_dir(id);
        let host = nimbusutils::host_path(&root, guest.trim_start_matches('/'));
        let host = ensure_contained(&root, &host).map_err(|e| match e.kind() {
            std::io::ErrorKind::PermissionDenied => NimbusError::PermissionDenied(guest.clone()),
            std::io::ErrorKind::NotFound => NimbusError::VolumeNotFound(id.to_string()),
            _ => NimbusError::Io(e),
        })?;
        Ok((guest, host))
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn volume_from_row(row: &SqliteRow) -> NimbusResult<Volume> {
    Ok(Volume {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        team: row.try_get("team")?,
        size_bytes: row.try_get::<i64, _>("size_bytes")?.max(0) as u64,
        file_count: row.try_get::<i64, _>("file_count")?.max(0) as u64,
        created_at: parse_db_timestamp(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_db_timestamp(&row.try_get::<String, _>("updated_at")?)?,
    })
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use futures::TryStreamExt;

    use crate::management::{init_db, CATALOG_DB_MIGRATOR};

    use super::*;

    async fn store(root: &std::path::Path) -> anyhow::Result<VolumeStore> {
        let pool = init_db(root.join("nimbus.db"), &CATALOG_DB_MIGRATOR).await?;
        Ok(VolumeStore::new(pool, root.join("volumes")))
    }

    #[tokio::test]
    async fn test_create_is_idempotent_by_name() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = store(tmp.path()).await?;

        let first = store.create("team", "abc").await?;
        let second = store.create("team", "abc").await?;
        assert_eq!(first.id, second.id);
        assert!(first.id.starts_with("vol_"));

        let page = store.list("team", None, None).await?;
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].name, "abc");

        // Names are scoped to the team.
        let other = store.create("other", "abc").await?;
        assert_ne!(other.id, first.id);

        assert_eq!(store.get("team", "abc").await?.id, first.id);
        assert_eq!(store.get("team", &first.id).await?.name, "abc");
        assert!(matches!(
            store.get("other", &first.id).await,
            Err(NimbusError::VolumeNotFound(_))
        ));
        assert!(matches!(
            store.create("team", "Bad_Name").await,
            Err(NimbusError::InvalidVolumeName(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_concurrent_creates_yield_one_volume() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = store(tmp.path()).await?;

        let results = futures::future::join_all(
            (0..8).map(|_| {
                let store = store.clone();
                async move { store.create("team", "shared").await }
            }),
        )
        .await;

        let ids = results
            .into_iter()
            .map(|r| r.map(|v| v.id))
            .collect::<NimbusResult<std::collections::HashSet<_>>>()?;
        assert_eq!(ids.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_list_pages_and_stream() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = store(tmp.path()).await?;
        for name in ["e", "a", "d", "c", "b"] {
            store.create("team", name).await?;
        }

        let first = store.list("team", Some(2), None).await?;
        assert_eq!(
            first.items.iter().map(|v| v.name.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );
        let second = store
            .list("team", Some(2), first.next_token.as_deref())
            .await?;
        assert_eq!(
            second.items.iter().map(|v| v.name.as_str()).collect::<Vec<_>>(),
            vec!["c", "d"]
        );

        let all = store
            .stream("team", 2)
            .try_collect::<Vec<_>>()
            .await?;
        assert_eq!(all.len(), 5);
        Ok(())
    }

    #[tokio::test]
    async fn test_file_operations_without_a_sandbox() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = store(tmp.path()).await?;
        let volume = store.create("team", "files").await?;

        store
            .upload("team", "files", "/dir/a.bin", Bytes::from_static(&[0, 1, 0]))
            .await?;
        store
            .upload("team", &volume.id, "b.txt", Bytes::from("hello"))
            .await?;

        assert_eq!(
            store.download("team", "files", "dir/a.bin").await?,
            Bytes::from_static(&[0, 1, 0])
        );

        let refreshed = store.get("team", "files").await?;
        assert_eq!(refreshed.file_count, 2);
        assert_eq!(refreshed.size_bytes, 8);

        let page = store.list_files("team", "files", "/", Some(1), None).await?;
        assert_eq!(page.items[0].name, "b.txt");
        let page = store
            .list_files("team", "files", "/", Some(1), page.next_token.as_deref())
            .await?;
        assert_eq!(page.items[0].name, "dir");
        assert!(page.next_token.is_none());

        assert!(store.delete_path("team", "files", "/dir", false).await.is_err());
        store.delete_path("team", "files", "/dir", true).await?;
        assert!(matches!(
            store.download("team", "files", "/dir/a.bin").await,
            Err(NimbusError::PathNotFound(_))
        ));
        assert!(store.download("team", "files", "/../escape").await.is_err());

        store.delete("team", &volume.id).await?;
        assert!(!store.data_dir(&volume.id).exists());
        assert!(matches!(
            store.delete("team", &volume.id).await,
            Err(NimbusError::VolumeNotFound(_))
        ));
        Ok(())
    }
}
