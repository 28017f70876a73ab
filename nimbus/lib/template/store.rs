use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteRow, Pool, Row, Sqlite};
use tokio::sync::Mutex;

use crate::{
    config::{BASE_TEMPLATE_ALIAS, DEFAULT_GUEST_USER, DEFAULT_WORKDIR},
    utils::{db_timestamp, new_id, paginate, parse_db_timestamp, IdKind, Page},
    NimbusError, NimbusResult,
};

use super::{StartCommand, TemplateSpec};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The id of the built-in template every other template ultimately builds on.
pub const BASE_TEMPLATE_ID: &str = "tpl_base";

const BASE_BUILD_ID: &str = "bld_base";

/// Directories the base snapshot starts with.
const BASE_DIRS: &[&str] = &["home/user", "root", "tmp", "etc"];

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The template catalog and the snapshot directories it points at.
///
/// Snapshots live at `<root>/<template id>/<generation>` and are never modified after they are
/// recorded.
#[derive(Debug, Clone)]
pub struct TemplateStore {
    pool: Pool<Sqlite>,
    root: PathBuf,
    generations: Arc<Mutex<()>>,
}

/// A template as listed in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateInfo {
    /// The template id.
    pub template_id: String,

    /// The alias, unique within the team.
    pub alias: String,

    /// The owning team. Empty for built-in templates.
    pub team: String,

    /// Whether other teams may boot it.
    pub public: bool,

    /// The generation new sandboxes boot from. `None` until a build succeeds.
    pub generation: Option<u32>,

    /// The most recently submitted build spec.
    pub spec: TemplateSpec,

    /// When the alias was first registered.
    pub created_at: DateTime<Utc>,

    /// When the template last changed.
    pub updated_at: DateTime<Utc>,
}

/// Runtime settings a build leaves behind for the sandboxes booted from it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    /// The command started when a sandbox boots.
    pub start: Option<StartCommand>,

    /// Environment every sandbox process starts with.
    pub envs: HashMap<String, String>,

    /// The default working directory.
    pub workdir: Option<String>,

    /// The default guest user.
    pub user: Option<String>,
}

/// A template generation ready to boot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTemplate {
    /// The template id.
    pub template_id: String,

    /// The alias.
    pub alias: String,

    /// The pinned generation.
    pub generation: u32,

    /// The immutable snapshot directory.
    pub rootfs: PathBuf,

    /// Runtime settings of the generation.
    pub config: ImageConfig,
}

/// The state of a template build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    /// Still running.
    Building,

    /// Finished and recorded a generation.
    Success,

    /// Finished without a generation.
    Failed,
}

/// Severity of a build log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    /// Progress.
    Info,

    /// Something worth a look.
    Warn,

    /// The reason a build failed.
    Error,
}

/// One structured build log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildLogEntry {
    /// When it was logged.
    pub timestamp: DateTime<Utc>,

    /// The severity.
    pub level: LogLevel,

    /// The message.
    pub message: String,
}

/// The state of a build and its logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildInfo {
    /// The build id.
    pub build_id: String,

    /// The template being built.
    pub template_id: String,

    /// The build state.
    pub status: BuildStatus,

    /// The generation the build produced or reused.
    pub generation: Option<u32>,

    /// Why the build failed.
    pub reason: Option<String>,

    /// Log entries from the requested offset on.
    pub logs: Vec<BuildLogEntry>,

    /// When the build was submitted.
    pub created_at: DateTime<Utc>,

    /// When it finished.
    pub finished_at: Option<DateTime<Utc>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl TemplateStore {
    /// Creates a store over the catalog `pool`, keeping snapshots under `root`.
    pub fn new(pool: Pool<Sqlite>, root: impl Into<PathBuf>) -> Self {
        Self {
            pool,
            root: root.into(),
            generations: Arc::new(Mutex::new(())),
        }
    }

    /// The directory of a recorded generation.
    pub fn snapshot_dir(&self, template_id: &str, generation: u32) -> PathBuf {
        self.root.join(template_id).join(generation.to_string())
    }

    /// Where a build places its snapshot before it is recorded.
    pub fn staging_dir(&self, template_id: &str, build_id: &str) -> PathBuf {
        self.root.join(template_id).join(format!(".staging-{build_id}"))
    }

    /// Registers the built-in `base` template if it is missing.
    ///
    /// Its snapshot is a minimal root filesystem with the default user's home directory.
    pub async fn ensure_base(&self) -> NimbusResult<()> {
        let rootfs = self.snapshot_dir(BASE_TEMPLATE_ID, 1);
        for dir in BASE_DIRS {
            tokio::fs::create_dir_all(rootfs.join(dir)).await?;
        }

        let now = db_timestamp(Utc::now());
        let spec_json = serde_json::to_string(&TemplateSpec::new("scratch"))?;
        let config = ImageConfig {
            workdir: Some(DEFAULT_WORKDIR.to_string()),
            user: Some(DEFAULT_GUEST_USER.to_string()),
            ..Default::default()
        };

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO templates (id, team, alias, public, current_generation, spec_json, created_at, updated_at)
            VALUES (?, '', ?, 1, 1, ?, ?, ?)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(BASE_TEMPLATE_ID)
        .bind(BASE_TEMPLATE_ALIAS)
        .bind(&spec_json)
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO builds (id, template_id, status, generation, created_at, finished_at)
            VALUES (?, ?, 'success', 1, ?, ?)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(BASE_BUILD_ID)
        .bind(BASE_TEMPLATE_ID)
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO template_generations
                (template_id, generation, spec_hash, start_json, envs_json, workdir, user_name, build_id, created_at)
            VALUES (?, 1, '', NULL, '{}', ?, ?, ?, ?)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(BASE_TEMPLATE_ID)
        .bind(&config.workdir)
        .bind(&config.user)
        .bind(BASE_BUILD_ID)
        .bind(&now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(())
    }

    /// Registers `alias` for the team, or updates the spec of the existing template. Returns the
    /// template id, which stays stable across rebuilds.
    pub async fn register(&self, team: &str, alias: &str, spec: &TemplateSpec) -> NimbusResult<String> {
        let now = db_timestamp(Utc::now());
        sqlx::query(
            r#"
            INSERT INTO templates (id, team, alias, public, current_generation, spec_json, created_at, updated_at)
            VALUES (?, ?, ?, 0, NULL, ?, ?, ?)
            ON CONFLICT (team, alias) DO UPDATE SET
                spec_json = excluded.spec_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(new_id(IdKind::Template))
        .bind(team)
        .bind(alias)
        .bind(serde_json::to_string(spec)?)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        let id: String = sqlx::query_scalar("SELECT id FROM templates WHERE team = ? AND alias = ?")
            .bind(team)
            .bind(alias)
            .fetch_one(&self.pool)
            .await?;
        Ok(id)
    }

    /// Looks a template up by id or alias among the team's own templates and public ones. The
    /// team's own template wins when an alias is ambiguous.
    pub async fn get(&self, team: &str, reference: &str) -> NimbusResult<TemplateInfo> {
        let row = sqlx::query(
            r#"
            SELECT * FROM templates
            WHERE (team = ? OR public = 1) AND (id = ? OR alias = ?)
            ORDER BY team = ? DESC
            LIMIT 1
            "#,
        )
        .bind(team)
        .bind(reference)
        .bind(reference)
        .bind(team)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref()
            .map(template_from_row)
            .transpose()?
            .ok_or_else(|| NimbusError::TemplateNotFound(reference.to_string()))
    }

    /// Lists the team's templates and public ones, ordered by alias.
    pub async fn list(
        &self,
        team: &str,
        limit: Option<usize>,
        page_token: Option<&str>,
    ) -> NimbusResult<Page<TemplateInfo>> {
        let rows = sqlx::query(
            "SELECT * FROM templates WHERE team = ? OR public = 1 ORDER BY alias, id",
        )
        .bind(team)
        .fetch_all(&self.pool)
        .await?;

        let templates = rows
            .iter()
            .map(template_from_row)
            .collect::<NimbusResult<Vec<_>>>()?;
        paginate(templates, limit, page_token, |t| {
            format!("{}\u{0}{}", t.alias, t.template_id)
        })
    }

    /// Makes one of the team's templates bootable by other teams, or private again.
    pub async fn set_public(&self, team: &str, reference: &str, public: bool) -> NimbusResult<TemplateInfo> {
        let template = self.owned(team, reference).await?;
        sqlx::query("UPDATE templates SET public = ?, updated_at = ? WHERE id = ?")
            .bind(public)
            .bind(db_timestamp(Utc::now()))
            .bind(&template.template_id)
            .execute(&self.pool)
            .await?;

        tracing::info!(team, template_id = %template.template_id, public, "changed template visibility");
        self.get(team, &template.template_id).await
    }

    /// Deletes one of the team's templates with every generation and build. Sandboxes already
    /// booted from it keep running on their own copy.
    pub async fn delete(&self, team: &str, reference: &str) -> NimbusResult<()> {
        let template = self.owned(team, reference).await?;

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM builds WHERE template_id = ?")
            .bind(&template.template_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM templates WHERE id = ?")
            .bind(&template.template_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        match tokio::fs::remove_dir_all(self.root.join(&template.template_id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        tracing::info!(team, template_id = %template.template_id, alias = %template.alias, "deleted template");
        Ok(())
    }

    /// Resolves a template reference to the generation new sandboxes should boot from.
    pub async fn resolve(&self, team: &str, reference: &str) -> NimbusResult<ResolvedTemplate> {
        let template = self.get(team, reference).await?;
        let generation = template
            .generation
            .ok_or_else(|| NimbusError::TemplateNotFound(format!("{reference} has no successful build")))?;

        let row = sqlx::query(
            "SELECT * FROM template_generations WHERE template_id = ? AND generation = ?",
        )
        .bind(&template.template_id)
        .bind(generation as i64)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| NimbusError::TemplateNotFound(reference.to_string()))?;

        let start_json: Option<String> = row.try_get("start_json")?;
        let envs_json: String = row.try_get("envs_json")?;

        Ok(ResolvedTemplate {
            rootfs: self.snapshot_dir(&template.template_id, generation),
            template_id: template.template_id,
            alias: template.alias,
            generation,
            config: ImageConfig {
                start: start_json.map(|s| serde_json::from_str(&s)).transpose()?,
                envs: serde_json::from_str(&envs_json)?,
                workdir: row.try_get("workdir")?,
                user: row.try_get("user_name")?,
            },
        })
    }

    /// The newest generation of a template built from a spec with `spec_hash`, if its snapshot
    /// is still on disk.
    pub async fn cached_generation(&self, template_id: &str, spec_hash: &str) -> NimbusResult<Option<u32>> {
        let generation: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT MAX(generation) FROM template_generations
            WHERE template_id = ? AND spec_hash = ?
            "#,
        )
        .bind(template_id)
        .bind(spec_hash)
        .fetch_one(&self.pool)
        .await?;

        Ok(generation
            .map(|g| g as u32)
            .filter(|g| self.snapshot_dir(template_id, *g).is_dir()))
    }

    /// Moves a staged snapshot into place as the next generation and makes it current.
    pub async fn add_generation(
        &self,
        template_id: &str,
        spec_hash: &str,
        build_id: &str,
        config: &ImageConfig,
        staged: &Path,
    ) -> NimbusResult<u32> {
        let _guard = self.generations.lock().await;

        let generation: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(generation), 0) + 1 FROM template_generations WHERE template_id = ?",
        )
        .bind(template_id)
        .fetch_one(&self.pool)
        .await?;
        let generation = generation as u32;

        let target = self.snapshot_dir(template_id, generation);
        if target.exists() {
            tokio::fs::remove_dir_all(&target).await?;
        }
        tokio::fs::rename(staged, &target).await?;

        let now = db_timestamp(Utc::now());
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO template_generations
                (template_id, generation, spec_hash, start_json, envs_json, workdir, user_name, build_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(template_id)
        .bind(generation as i64)
        .bind(spec_hash)
        .bind(config.start.as_ref().map(serde_json::to_string).transpose()?)
        .bind(serde_json::to_string(&config.envs)?)
        .bind(&config.workdir)
        .bind(&config.user)
        .bind(build_id)
        .bind(&now)
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE templates SET current_generation = ?, updated_at = ? WHERE id = ?")
            .bind(generation as i64)
            .bind(&now)
            .bind(template_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(generation)
    }

    /// Points new sandboxes at an existing generation.
    pub async fn set_current_generation(&self, template_id: &str, generation: u32) -> NimbusResult<()> {
        sqlx::query("UPDATE templates SET current_generation = ?, updated_at = ? WHERE id = ?")
            .bind(generation as i64)
            .bind(db_timestamp(Utc::now()))
            .bind(template_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Records a new build in the `building` state.
    pub async fn create_build(&self, template_id: &str) -> NimbusResult<String> {
        let build_id = new_id(IdKind::Build);
        sqlx::query(
            "INSERT INTO builds (id, template_id, status, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&build_id)
        .bind(template_id)
        .bind(BuildStatus::Building.to_string())
        .bind(db_timestamp(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(build_id)
    }

    /// Appends a log entry to a build.
    pub async fn append_build_log(&self, build_id: &str, entry: &BuildLogEntry) -> NimbusResult<()> {
        sqlx::query(
            r#"
            INSERT INTO build_logs (build_id, seq, level, message, timestamp)
            SELECT ?, COALESCE(MAX(seq), -1) + 1, ?, ?, ? FROM build_logs WHERE build_id = ?
            "#,
        )
        .bind(build_id)
        .bind(entry.level.to_string())
        .bind(&entry.message)
        .bind(db_timestamp(entry.timestamp))
        .bind(build_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Marks a build finished.
    pub async fn finish_build(
        &self,
        build_id: &str,
        status: BuildStatus,
        generation: Option<u32>,
        reason: Option<&str>,
    ) -> NimbusResult<()> {
        sqlx::query(
            "UPDATE builds SET status = ?, generation = ?, reason = ?, finished_at = ? WHERE id = ?",
        )
        .bind(status.to_string())
        .bind(generation.map(|g| g as i64))
        .bind(reason)
        .bind(db_timestamp(Utc::now()))
        .bind(build_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// The state of a build visible to the team, with log entries from `logs_offset` on.
    pub async fn build_info(&self, team: &str, build_id: &str, logs_offset: usize) -> NimbusResult<BuildInfo> {
        let row = sqlx::query(
            r#"
            SELECT b.* FROM builds b JOIN templates t ON t.id = b.template_id
            WHERE b.id = ? AND (t.team = ? OR t.public = 1)
            "#,
        )
        .bind(build_id)
        .bind(team)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| NimbusError::BuildNotFound(build_id.to_string()))?;

        let logs = sqlx::query(
            "SELECT * FROM build_logs WHERE build_id = ? AND seq >= ? ORDER BY seq",
        )
        .bind(build_id)
        .bind(logs_offset as i64)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|row| -> NimbusResult<BuildLogEntry> {
            Ok(BuildLogEntry {
                timestamp: parse_db_timestamp(&row.try_get::<String, _>("timestamp")?)?,
                level: row.try_get::<String, _>("level")?.parse()?,
                message: row.try_get("message")?,
            })
        })
        .collect::<NimbusResult<Vec<_>>>()?;

        let finished_at: Option<String> = row.try_get("finished_at")?;
        Ok(BuildInfo {
            build_id: row.try_get("id")?,
            template_id: row.try_get("template_id")?,
            status: row.try_get::<String, _>("status")?.parse()?,
            generation: row.try_get::<Option<i64>, _>("generation")?.map(|g| g as u32),
            reason: row.try_get("reason")?,
            logs,
            created_at: parse_db_timestamp(&row.try_get::<String, _>("created_at")?)?,
            finished_at: finished_at.as_deref().map(parse_db_timestamp).transpose()?,
        })
    }

    async fn owned(&self, team: &str, reference: &str) -> NimbusResult<TemplateInfo> {
        let template = self.get(team, reference).await?;
        if template.team != team {
            return Err(NimbusError::TemplateNotFound(reference.to_string()));
        }
        Ok(template)
    }
}

impl BuildLogEntry {
    /// Creates an entry stamped with the current time.
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            message: message.into(),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn template_from_row(row: &SqliteRow) -> NimbusResult<TemplateInfo> {
    Ok(TemplateInfo {
        template_id: row.try_get("id")?,
        alias: row.try_get("alias")?,
        team: row.try_get("team")?,
        public: row.try_get("public")?,
        generation: row
            .try_get::<Option<i64>, _>("current_generation")?
            .map(|g| g as u32),
        spec: serde_json::from_str(&row.try_get::<String, _>("spec_json")?)?,
        created_at: parse_db_timestamp(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_db_timestamp(&row.try_get::<String, _>("updated_at")?)?,
    })
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildStatus::Building => write!(f, "building"),
            BuildStatus::Success => write!(f, "success"),
            BuildStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for BuildStatus {
    type Err = NimbusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "building" => Ok(BuildStatus::Building),
            "success" => Ok(BuildStatus::Success),
            "failed" => Ok(BuildStatus::Failed),
            other => Err(NimbusError::custom(anyhow::anyhow!(
                "unknown build status in catalog: {other}"
            ))),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

impl FromStr for LogLevel {
    type Err = NimbusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(NimbusError::custom(anyhow::anyhow!(
                "unknown log level in catalog: {other}"
            ))),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use crate::management::{init_db, CATALOG_DB_MIGRATOR};

    use super::*;

    async fn store(root: &Path) -> anyhow::Result<TemplateStore> {
        let pool = init_db(root.join("nimbus.db"), &CATALOG_DB_MIGRATOR).await?;
        let store = TemplateStore::new(pool, root.join("templates"));
        store.ensure_base().await?;
        Ok(store)
    }

    #[tokio::test]
    async fn test_base_template_is_public() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = store(tmp.path()).await?;
        // Registering twice is harmless.
        store.ensure_base().await?;

        let base = store.resolve("any-team", BASE_TEMPLATE_ALIAS).await?;
        assert_eq!(base.template_id, BASE_TEMPLATE_ID);
        assert_eq!(base.generation, 1);
        assert!(base.rootfs.join("home/user").is_dir());
        assert_eq!(base.config.workdir.as_deref(), Some(DEFAULT_WORKDIR));

        assert!(matches!(
            store.delete("any-team", BASE_TEMPLATE_ALIAS).await,
            Err(NimbusError::TemplateNotFound(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_generations_and_builds() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = store(tmp.path()).await?;
        let spec = TemplateSpec::new("base");

        let id = store.register("team", "app", &spec).await?;
        assert_eq!(store.register("team", "app", &spec).await?, id);
        assert!(matches!(
            store.resolve("team", "app").await,
            Err(NimbusError::TemplateNotFound(_))
        ));

        let build_id = store.create_build(&id).await?;
        store
            .append_build_log(&build_id, &BuildLogEntry::new(LogLevel::Info, "one"))
            .await?;
        store
            .append_build_log(&build_id, &BuildLogEntry::new(LogLevel::Warn, "two"))
            .await?;

        let staged = store.staging_dir(&id, &build_id);
        tokio::fs::create_dir_all(&staged).await?;
        tokio::fs::write(staged.join("marker"), b"1").await?;
        let config = ImageConfig {
            workdir: Some("/app".into()),
            ..Default::default()
        };
        let generation = store
            .add_generation(&id, "hash-1", &build_id, &config, &staged)
            .await?;
        store
            .finish_build(&build_id, BuildStatus::Success, Some(generation), None)
            .await?;
        assert_eq!(generation, 1);

        let resolved = store.resolve("team", "app").await?;
        assert_eq!(resolved.generation, 1);
        assert_eq!(resolved.config, config);
        assert!(resolved.rootfs.join("marker").exists());
        assert_eq!(store.cached_generation(&id, "hash-1").await?, Some(1));
        assert_eq!(store.cached_generation(&id, "hash-2").await?, None);

        let info = store.build_info("team", &build_id, 1).await?;
        assert_eq!(info.status, BuildStatus::Success);
        assert_eq!(info.logs.len(), 1);
        assert_eq!(info.logs[0].message, "two");
        assert!(matches!(
            store.build_info("other", &build_id, 0).await,
            Err(NimbusError::BuildNotFound(_))
        ));

        // Private templates are invisible to other teams until published.
        assert!(store.get("other", "app").await.is_err());
        store.set_public("team", "app", true).await?;
        assert_eq!(store.get("other", "app").await?.template_id, id);

        let page = store.list("team", None, None).await?;
        assert_eq!(
            page.items.iter().map(|t| t.alias.as_str()).collect::<Vec<_>>(),
            vec!["app", "base"]
        );

        store.delete("team", "app").await?;
        assert!(store.get("team", "app").await.is_err());
        assert!(!store.snapshot_dir(&id, 1).exists());
        Ok(())
    }
}
