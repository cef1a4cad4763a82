//! Transactional repository over SQLite.
//!
//! The only mutator of persistent state. Every multi-statement operation
//! runs inside a single transaction; concurrent writers are serialized by
//! the database. Content hashes are recomputed here and nowhere else.

pub mod migrations;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Transaction};

use crate::error::{Result, ShieldError};
use crate::types::{
    AnalysisStatus, ApprovalState, InstallStatus, Skill, SkillFile, SkillInstallation,
    SkillSource, SkillVersion,
};

/// Input for `create_skill` / skill upsert.
#[derive(Debug, Clone)]
pub struct NewSkill {
    pub slug: String,
    pub name: String,
    pub author: Option<String>,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub source: SkillSource,
    pub remote_id: Option<String>,
    pub is_public: Option<bool>,
}

impl NewSkill {
    pub fn new(slug: impl Into<String>, name: impl Into<String>, source: SkillSource) -> Self {
        Self {
            slug: slug.into(),
            name: name.into(),
            author: None,
            description: None,
            tags: Vec::new(),
            source,
            remote_id: None,
            is_public: None,
        }
    }
}

/// Input for `add_version`.
#[derive(Debug, Clone)]
pub struct NewVersion {
    pub skill_id: String,
    pub version: String,
    pub folder_path: Option<String>,
    /// May be empty; recomputed after `register_files`.
    pub content_hash: String,
    pub approval: ApprovalState,
    pub trusted: bool,
    pub metadata_json: Option<serde_json::Value>,
}

/// One manifest entry for `register_files`.
#[derive(Debug, Clone)]
pub struct NewFile {
    pub relative_path: String,
    pub file_hash: String,
    pub size_bytes: u64,
}

/// Input for `install`.
#[derive(Debug, Clone)]
pub struct NewInstallation {
    pub skill_version_id: String,
    pub status: InstallStatus,
    pub auto_update: bool,
    pub profile_id: Option<String>,
    pub target_id: Option<String>,
    pub user_username: Option<String>,
}

/// Persisted analysis outcome for a version.
#[derive(Debug, Clone)]
pub struct AnalysisUpdate {
    pub status: AnalysisStatus,
    pub json: Option<serde_json::Value>,
    pub analyzed_at: Option<DateTime<Utc>>,
    pub required_bins: Vec<String>,
    pub required_env: Vec<String>,
    pub extracted_commands: Vec<String>,
}

/// Atomic skill-upsert + version + file manifest ingestion, the shared
/// write path of upload, remote install, sync, and drop quarantine.
#[derive(Debug, Clone)]
pub struct VersionIngest {
    pub version: String,
    pub folder_path: Option<String>,
    pub approval: ApprovalState,
    pub trusted: bool,
    pub metadata_json: Option<serde_json::Value>,
    pub files: Vec<NewFile>,
}

pub struct Repository {
    db_path: PathBuf,
}

impl Repository {
    /// Open (creating if needed) the store at `db_path` and apply pending
    /// migrations.
    pub fn new(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let repo = Self { db_path };
        let mut conn = repo.open()?;
        migrations::run(&mut conn)?;
        Ok(repo)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn open(&self) -> rusqlite::Result<Connection> {
        let conn = Connection::open_with_flags(
            &self.db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(conn)
    }

    // ---- skills ----

    pub fn create_skill(&self, input: NewSkill) -> Result<Skill> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let skill = insert_skill(&tx, &input)?;
        tx.commit()?;
        Ok(skill)
    }

    /// Get the skill for `slug`, creating it when absent. Existing rows
    /// keep their identity; display fields are refreshed from the input.
    pub fn upsert_skill(&self, input: NewSkill) -> Result<Skill> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let skill = upsert_skill_tx(&tx, &input)?;
        tx.commit()?;
        Ok(skill)
    }

    pub fn get_by_slug(&self, slug: &str) -> Result<Option<Skill>> {
        let conn = self.open()?;
        load_skill_where(&conn, "slug = ?1", params![slug])
    }

    pub fn get_by_remote_id(&self, remote_id: &str) -> Result<Option<Skill>> {
        let conn = self.open()?;
        load_skill_where(&conn, "remote_id = ?1", params![remote_id])
    }

    pub fn get_by_id(&self, id: &str) -> Result<Option<Skill>> {
        let conn = self.open()?;
        load_skill_where(&conn, "id = ?1", params![id])
    }

    pub fn get_all(&self, source: Option<SkillSource>) -> Result<Vec<Skill>> {
        let conn = self.open()?;
        let mut out = Vec::new();
        match source {
            Some(source) => {
                let mut stmt = conn.prepare(
                    "SELECT * FROM skills WHERE source = ?1 ORDER BY slug",
                )?;
                let rows = stmt.query_map(params![source.as_str()], skill_from_row)?;
                for row in rows {
                    out.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare("SELECT * FROM skills ORDER BY slug")?;
                let rows = stmt.query_map([], skill_from_row)?;
                for row in rows {
                    out.push(row?);
                }
            }
        }
        Ok(out)
    }

    /// Skills managed by a sync source: `source = integration` and
    /// `remote_id` equal to the source id.
    pub fn get_integration_skills(&self, source_id: &str) -> Result<Vec<Skill>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM skills WHERE source = 'integration' AND remote_id = ?1 ORDER BY slug",
        )?;
        let rows = stmt.query_map(params![source_id], skill_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Marketplace-tracked skills, the update-check population.
    pub fn get_remote_tracked(&self) -> Result<Vec<Skill>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM skills WHERE source = 'marketplace' AND remote_id IS NOT NULL ORDER BY slug",
        )?;
        let rows = stmt.query_map([], skill_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Delete a skill; versions, files, and installations cascade.
    pub fn delete_skill(&self, skill_id: &str) -> Result<()> {
        let conn = self.open()?;
        let changed = conn.execute("DELETE FROM skills WHERE id = ?1", params![skill_id])?;
        if changed == 0 {
            return Err(ShieldError::SkillNotFound(skill_id.to_string()));
        }
        Ok(())
    }

    // ---- versions ----

    pub fn add_version(&self, input: NewVersion) -> Result<SkillVersion> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let version = insert_version(&tx, &input)?;
        tx.commit()?;
        Ok(version)
    }

    /// Upsert skill + insert version + register manifest + compute content
    /// hash, atomically. The canonical ingestion write path.
    pub fn ingest_version(
        &self,
        skill: NewSkill,
        ingest: VersionIngest,
    ) -> Result<(Skill, SkillVersion)> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;

        let skill = upsert_skill_tx(&tx, &skill)?;
        let version = insert_version(
            &tx,
            &NewVersion {
                skill_id: skill.id.clone(),
                version: ingest.version,
                folder_path: ingest.folder_path,
                content_hash: String::new(),
                approval: ingest.approval,
                trusted: ingest.trusted,
                metadata_json: ingest.metadata_json,
            },
        )?;
        insert_files(&tx, &version.id, &ingest.files)?;
        recompute_content_hash_tx(&tx, &version.id)?;

        let version = load_version_where(&tx, "id = ?1", params![version.id])?
            .ok_or_else(|| ShieldError::VersionNotFound(version.id.clone()))?;
        tx.commit()?;
        Ok((skill, version))
    }

    pub fn get_versions(&self, skill_id: &str) -> Result<Vec<SkillVersion>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM skill_versions WHERE skill_id = ?1 ORDER BY created_at, rowid",
        )?;
        let rows = stmt.query_map(params![skill_id], version_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn get_version(&self, skill_id: &str, version: &str) -> Result<Option<SkillVersion>> {
        let conn = self.open()?;
        load_version_where(
            &conn,
            "skill_id = ?1 AND version = ?2",
            params![skill_id, version],
        )
    }

    /// Most recently created version. Version strings are opaque; insertion
    /// order is the only ordering the core recognizes.
    pub fn get_latest_version(&self, skill_id: &str) -> Result<Option<SkillVersion>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM skill_versions WHERE skill_id = ?1
             ORDER BY created_at DESC, rowid DESC LIMIT 1",
        )?;
        let mut rows = stmt.query_map(params![skill_id], version_from_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    pub fn get_version_by_id(&self, version_id: &str) -> Result<Option<SkillVersion>> {
        let conn = self.open()?;
        load_version_where(&conn, "id = ?1", params![version_id])
    }

    /// Find a version of `skill_id` whose content hash matches, used for
    /// unknown-drop deduplication.
    pub fn find_version_by_content_hash(
        &self,
        skill_id: &str,
        content_hash: &str,
    ) -> Result<Option<SkillVersion>> {
        let conn = self.open()?;
        load_version_where(
            &conn,
            "skill_id = ?1 AND content_hash = ?2",
            params![skill_id, content_hash],
        )
    }

    /// Delete a version; files and installations cascade. Used to roll
    /// back an ingestion whose backup side effect failed.
    pub fn delete_version(&self, version_id: &str) -> Result<()> {
        let conn = self.open()?;
        let changed = conn.execute(
            "DELETE FROM skill_versions WHERE id = ?1",
            params![version_id],
        )?;
        if changed == 0 {
            return Err(ShieldError::VersionNotFound(version_id.to_string()));
        }
        Ok(())
    }

    pub fn approve_version(&self, version_id: &str) -> Result<()> {
        let conn = self.open()?;
        let changed = conn.execute(
            "UPDATE skill_versions SET approval = 'approved', approved_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), version_id],
        )?;
        if changed == 0 {
            return Err(ShieldError::VersionNotFound(version_id.to_string()));
        }
        Ok(())
    }

    pub fn update_analysis(&self, version_id: &str, update: AnalysisUpdate) -> Result<()> {
        let conn = self.open()?;
        let json = update
            .json
            .as_ref()
            .map(|v| v.to_string());
        let changed = conn.execute(
            "UPDATE skill_versions SET
                analysis_status = ?1,
                analysis_json = ?2,
                analyzed_at = ?3,
                required_bins = ?4,
                required_env = ?5,
                extracted_commands = ?6
             WHERE id = ?7",
            params![
                update.status.as_str(),
                json,
                update.analyzed_at.map(|t| t.to_rfc3339()),
                serde_json::to_string(&update.required_bins).unwrap_or_else(|_| "[]".into()),
                serde_json::to_string(&update.required_env).unwrap_or_else(|_| "[]".into()),
                serde_json::to_string(&update.extracted_commands)
                    .unwrap_or_else(|_| "[]".into()),
                version_id,
            ],
        )?;
        if changed == 0 {
            return Err(ShieldError::VersionNotFound(version_id.to_string()));
        }
        Ok(())
    }

    /// Versions still waiting for analysis.
    pub fn get_pending_analysis(&self) -> Result<Vec<SkillVersion>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM skill_versions WHERE analysis_status = 'pending'
             ORDER BY created_at, rowid",
        )?;
        let rows = stmt.query_map([], version_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn reset_analysis(&self, version_id: &str) -> Result<()> {
        let conn = self.open()?;
        let changed = conn.execute(
            "UPDATE skill_versions SET analysis_status = 'pending', analysis_json = NULL,
             analyzed_at = NULL WHERE id = ?1",
            params![version_id],
        )?;
        if changed == 0 {
            return Err(ShieldError::VersionNotFound(version_id.to_string()));
        }
        Ok(())
    }

    // ---- files ----

    pub fn register_files(&self, version_id: &str, files: &[NewFile]) -> Result<()> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        insert_files(&tx, version_id, files)?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_files(&self, version_id: &str) -> Result<Vec<SkillFile>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM skill_files WHERE skill_version_id = ?1 ORDER BY relative_path",
        )?;
        let rows = stmt.query_map(params![version_id], file_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Reconcile a legitimately rewritten file (adapter stripped env,
    /// injected tags, ...). Callers must follow a batch of these with
    /// `recompute_content_hash`.
    pub fn update_file_hash(&self, file_id: &str, new_hash: &str, size_bytes: u64) -> Result<()> {
        let conn = self.open()?;
        let changed = conn.execute(
            "UPDATE skill_files SET file_hash = ?1, size_bytes = ?2 WHERE id = ?3",
            params![new_hash, size_bytes as i64, file_id],
        )?;
        if changed == 0 {
            return Err(ShieldError::FileNotFound(file_id.to_string()));
        }
        Ok(())
    }

    /// Recompute the canonical content hash from the registered manifest:
    /// sort by relative path (byte-wise), concatenate lowercase-hex file
    /// hashes, SHA-256.
    pub fn recompute_content_hash(&self, version_id: &str) -> Result<String> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let hash = recompute_content_hash_tx(&tx, version_id)?;
        tx.commit()?;
        Ok(hash)
    }

    // ---- installations ----

    pub fn install(&self, input: NewInstallation) -> Result<SkillInstallation> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;

        let version = load_version_where(&tx, "id = ?1", params![input.skill_version_id])?
            .ok_or_else(|| ShieldError::VersionNotFound(input.skill_version_id.clone()))?;
        if input.status == InstallStatus::Active {
            ensure_no_other_active(&tx, &version.skill_id, &input.profile_id, &input.target_id, None)?;
        }

        let now = Utc::now().to_rfc3339();
        let id = uuid::Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO skill_installations
                (id, skill_version_id, profile_id, target_id, user_username, status,
                 auto_update, pinned_version, wrapper_path, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, NULL, ?8, ?8)",
            params![
                id,
                input.skill_version_id,
                input.profile_id,
                input.target_id,
                input.user_username,
                input.status.as_str(),
                input.auto_update as i64,
                now,
            ],
        )?;

        let installation = load_installation_where(&tx, "id = ?1", params![id])?
            .ok_or_else(|| ShieldError::InstallationNotFound(id.clone()))?;
        tx.commit()?;
        Ok(installation)
    }

    pub fn get_installations(
        &self,
        skill_version_id: Option<&str>,
    ) -> Result<Vec<SkillInstallation>> {
        let conn = self.open()?;
        let mut out = Vec::new();
        match skill_version_id {
            Some(version_id) => {
                let mut stmt = conn.prepare(
                    "SELECT * FROM skill_installations WHERE skill_version_id = ?1
                     ORDER BY created_at, rowid",
                )?;
                let rows = stmt.query_map(params![version_id], installation_from_row)?;
                for row in rows {
                    out.push(row?);
                }
            }
            None => {
                let mut stmt = conn
                    .prepare("SELECT * FROM skill_installations ORDER BY created_at, rowid")?;
                let rows = stmt.query_map([], installation_from_row)?;
                for row in rows {
                    out.push(row?);
                }
            }
        }
        Ok(out)
    }

    pub fn get_installation_by_id(&self, id: &str) -> Result<Option<SkillInstallation>> {
        let conn = self.open()?;
        load_installation_where(&conn, "id = ?1", params![id])
    }

    pub fn get_active_installations(&self) -> Result<Vec<SkillInstallation>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM skill_installations WHERE status = 'active' ORDER BY created_at, rowid",
        )?;
        let rows = stmt.query_map([], installation_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// The active installation for a skill, if any version of it has one.
    pub fn get_active_installation_for_skill(
        &self,
        skill_id: &str,
    ) -> Result<Option<SkillInstallation>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT si.* FROM skill_installations si
             JOIN skill_versions sv ON sv.id = si.skill_version_id
             WHERE sv.skill_id = ?1 AND si.status = 'active'
             ORDER BY si.created_at, si.rowid LIMIT 1",
        )?;
        let mut rows = stmt.query_map(params![skill_id], installation_from_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// Installations of any version of `skill_id` that follow updates:
    /// active, auto-update on, not pinned.
    pub fn get_auto_updatable(&self, skill_id: &str) -> Result<Vec<SkillInstallation>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT si.* FROM skill_installations si
             JOIN skill_versions sv ON sv.id = si.skill_version_id
             WHERE sv.skill_id = ?1 AND si.status = 'active'
               AND si.auto_update = 1 AND si.pinned_version IS NULL
             ORDER BY si.created_at, si.rowid",
        )?;
        let rows = stmt.query_map(params![skill_id], installation_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn update_installation_status(&self, id: &str, status: InstallStatus) -> Result<()> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;

        if status == InstallStatus::Active {
            let installation = load_installation_where(&tx, "id = ?1", params![id])?
                .ok_or_else(|| ShieldError::InstallationNotFound(id.to_string()))?;
            let version =
                load_version_where(&tx, "id = ?1", params![installation.skill_version_id])?
                    .ok_or_else(|| {
                        ShieldError::VersionNotFound(installation.skill_version_id.clone())
                    })?;
            ensure_no_other_active(
                &tx,
                &version.skill_id,
                &installation.profile_id,
                &installation.target_id,
                Some(id),
            )?;
        }

        let changed = tx.execute(
            "UPDATE skill_installations SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), Utc::now().to_rfc3339(), id],
        )?;
        if changed == 0 {
            return Err(ShieldError::InstallationNotFound(id.to_string()));
        }
        tx.commit()?;
        Ok(())
    }

    pub fn update_wrapper_path(&self, id: &str, wrapper_path: Option<&str>) -> Result<()> {
        let conn = self.open()?;
        let changed = conn.execute(
            "UPDATE skill_installations SET wrapper_path = ?1, updated_at = ?2 WHERE id = ?3",
            params![wrapper_path, Utc::now().to_rfc3339(), id],
        )?;
        if changed == 0 {
            return Err(ShieldError::InstallationNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Point an installation at a new version (update propagation).
    pub fn update_installation_version(&self, id: &str, new_version_id: &str) -> Result<()> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let exists = load_version_where(&tx, "id = ?1", params![new_version_id])?;
        if exists.is_none() {
            return Err(ShieldError::VersionNotFound(new_version_id.to_string()));
        }
        let changed = tx.execute(
            "UPDATE skill_installations SET skill_version_id = ?1, updated_at = ?2 WHERE id = ?3",
            params![new_version_id, Utc::now().to_rfc3339(), id],
        )?;
        if changed == 0 {
            return Err(ShieldError::InstallationNotFound(id.to_string()));
        }
        tx.commit()?;
        Ok(())
    }

    pub fn set_auto_update(&self, id: &str, auto_update: bool) -> Result<()> {
        let conn = self.open()?;
        let changed = conn.execute(
            "UPDATE skill_installations SET auto_update = ?1, updated_at = ?2 WHERE id = ?3",
            params![auto_update as i64, Utc::now().to_rfc3339(), id],
        )?;
        if changed == 0 {
            return Err(ShieldError::InstallationNotFound(id.to_string()));
        }
        Ok(())
    }

    pub fn pin_version(&self, id: &str, version: &str) -> Result<()> {
        let conn = self.open()?;
        let changed = conn.execute(
            "UPDATE skill_installations SET pinned_version = ?1, updated_at = ?2 WHERE id = ?3",
            params![version, Utc::now().to_rfc3339(), id],
        )?;
        if changed == 0 {
            return Err(ShieldError::InstallationNotFound(id.to_string()));
        }
        Ok(())
    }

    pub fn unpin_version(&self, id: &str) -> Result<()> {
        let conn = self.open()?;
        let changed = conn.execute(
            "UPDATE skill_installations SET pinned_version = NULL, updated_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), id],
        )?;
        if changed == 0 {
            return Err(ShieldError::InstallationNotFound(id.to_string()));
        }
        Ok(())
    }

    pub fn uninstall(&self, id: &str) -> Result<()> {
        let conn = self.open()?;
        let changed =
            conn.execute("DELETE FROM skill_installations WHERE id = ?1", params![id])?;
        if changed == 0 {
            return Err(ShieldError::InstallationNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Resolve an installation to its (skill, version, installation) triple.
    pub fn resolve_installation(
        &self,
        installation_id: &str,
    ) -> Result<(Skill, SkillVersion, SkillInstallation)> {
        let conn = self.open()?;
        let installation = load_installation_where(&conn, "id = ?1", params![installation_id])?
            .ok_or_else(|| ShieldError::InstallationNotFound(installation_id.to_string()))?;
        let version =
            load_version_where(&conn, "id = ?1", params![installation.skill_version_id])?
                .ok_or_else(|| {
                    ShieldError::VersionNotFound(installation.skill_version_id.clone())
                })?;
        let skill = load_skill_where(&conn, "id = ?1", params![version.skill_id])?
            .ok_or_else(|| ShieldError::SkillNotFound(version.skill_id.clone()))?;
        Ok((skill, version, installation))
    }

    // ---- meta KV ----

    pub fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let conn = self.open()?;
        let value = conn
            .query_row("SELECT value FROM meta WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    pub fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }
}

// ---- row mapping ----

fn parse_ts(value: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_opt_ts(value: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match value {
        Some(v) => Ok(Some(parse_ts(v)?)),
        None => Ok(None),
    }
}

fn parse_string_vec(value: String) -> Vec<String> {
    serde_json::from_str(&value).unwrap_or_default()
}

fn parse_opt_json(value: Option<String>) -> Option<serde_json::Value> {
    value.and_then(|v| serde_json::from_str(&v).ok())
}

fn skill_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Skill> {
    Ok(Skill {
        id: row.get("id")?,
        slug: row.get("slug")?,
        name: row.get("name")?,
        author: row.get("author")?,
        description: row.get("description")?,
        tags: parse_string_vec(row.get("tags")?),
        source: SkillSource::parse(&row.get::<_, String>("source")?),
        remote_id: row.get("remote_id")?,
        is_public: row
            .get::<_, Option<i64>>("is_public")?
            .map(|v| v != 0),
        created_at: parse_ts(row.get("created_at")?)?,
        updated_at: parse_ts(row.get("updated_at")?)?,
    })
}

fn version_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SkillVersion> {
    Ok(SkillVersion {
        id: row.get("id")?,
        skill_id: row.get("skill_id")?,
        version: row.get("version")?,
        folder_path: row.get("folder_path")?,
        content_hash: row.get("content_hash")?,
        hash_updated_at: parse_opt_ts(row.get("hash_updated_at")?)?,
        approval: ApprovalState::parse(&row.get::<_, String>("approval")?),
        approved_at: parse_opt_ts(row.get("approved_at")?)?,
        trusted: row.get::<_, i64>("trusted")? != 0,
        analysis_status: AnalysisStatus::parse(&row.get::<_, String>("analysis_status")?),
        analysis_json: parse_opt_json(row.get("analysis_json")?),
        analyzed_at: parse_opt_ts(row.get("analyzed_at")?)?,
        required_bins: parse_string_vec(row.get("required_bins")?),
        required_env: parse_string_vec(row.get("required_env")?),
        extracted_commands: parse_string_vec(row.get("extracted_commands")?),
        metadata_json: parse_opt_json(row.get("metadata_json")?),
    })
}

fn file_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SkillFile> {
    Ok(SkillFile {
        id: row.get("id")?,
        skill_version_id: row.get("skill_version_id")?,
        relative_path: row.get("relative_path")?,
        file_hash: row.get("file_hash")?,
        size_bytes: row.get::<_, i64>("size_bytes")? as u64,
    })
}

fn installation_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SkillInstallation> {
    Ok(SkillInstallation {
        id: row.get("id")?,
        skill_version_id: row.get("skill_version_id")?,
        profile_id: row.get("profile_id")?,
        target_id: row.get("target_id")?,
        user_username: row.get("user_username")?,
        status: InstallStatus::parse(&row.get::<_, String>("status")?),
        auto_update: row.get::<_, i64>("auto_update")? != 0,
        pinned_version: row.get("pinned_version")?,
        wrapper_path: row.get("wrapper_path")?,
        created_at: parse_ts(row.get("created_at")?)?,
        updated_at: parse_ts(row.get("updated_at")?)?,
    })
}

// ---- shared statement helpers (usable inside and outside transactions) ----

fn load_skill_where(
    conn: &Connection,
    predicate: &str,
    params: impl rusqlite::Params,
) -> Result<Option<Skill>> {
    let sql = format!("SELECT * FROM skills WHERE {predicate}");
    let skill = conn.query_row(&sql, params, skill_from_row).optional()?;
    Ok(skill)
}

fn load_version_where(
    conn: &Connection,
    predicate: &str,
    params: impl rusqlite::Params,
) -> Result<Option<SkillVersion>> {
    let sql = format!("SELECT * FROM skill_versions WHERE {predicate}");
    let version = conn.query_row(&sql, params, version_from_row).optional()?;
    Ok(version)
}

fn load_installation_where(
    conn: &Connection,
    predicate: &str,
    params: impl rusqlite::Params,
) -> Result<Option<SkillInstallation>> {
    let sql = format!("SELECT * FROM skill_installations WHERE {predicate}");
    let installation = conn
        .query_row(&sql, params, installation_from_row)
        .optional()?;
    Ok(installation)
}

fn insert_skill(tx: &Transaction<'_>, input: &NewSkill) -> Result<Skill> {
    if load_skill_where(tx, "slug = ?1", params![input.slug])?.is_some() {
        return Err(ShieldError::SlugConflict(input.slug.clone()));
    }

    let id = uuid::Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();
    tx.execute(
        "INSERT INTO skills
            (id, slug, name, author, description, tags, source, remote_id, is_public,
             created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
        params![
            id,
            input.slug,
            input.name,
            input.author,
            input.description,
            serde_json::to_string(&input.tags).unwrap_or_else(|_| "[]".into()),
            input.source.as_str(),
            input.remote_id,
            input.is_public.map(|v| v as i64),
            now,
        ],
    )?;
    load_skill_where(tx, "id = ?1", params![id])?
        .ok_or_else(|| ShieldError::SkillNotFound(id))
}

fn upsert_skill_tx(tx: &Transaction<'_>, input: &NewSkill) -> Result<Skill> {
    match load_skill_where(tx, "slug = ?1", params![input.slug])? {
        Some(existing) => {
            tx.execute(
                "UPDATE skills SET name = ?1, author = COALESCE(?2, author),
                    description = COALESCE(?3, description), updated_at = ?4
                 WHERE id = ?5",
                params![
                    input.name,
                    input.author,
                    input.description,
                    Utc::now().to_rfc3339(),
                    existing.id,
                ],
            )?;
            // A remote-tagged ingest adopts the skill for its source;
            // reconciliation depends on the tag being present.
            if input.remote_id.is_some() {
                tx.execute(
                    "UPDATE skills SET source = ?1, remote_id = ?2 WHERE id = ?3",
                    params![input.source.as_str(), input.remote_id, existing.id],
                )?;
            }
            load_skill_where(tx, "id = ?1", params![existing.id])?
                .ok_or_else(|| ShieldError::SkillNotFound(existing.id.clone()))
        }
        None => insert_skill(tx, input),
    }
}

fn insert_version(tx: &Transaction<'_>, input: &NewVersion) -> Result<SkillVersion> {
    if load_skill_where(tx, "id = ?1", params![input.skill_id])?.is_none() {
        return Err(ShieldError::SkillNotFound(input.skill_id.clone()));
    }
    if load_version_where(
        tx,
        "skill_id = ?1 AND version = ?2",
        params![input.skill_id, input.version],
    )?
    .is_some()
    {
        return Err(ShieldError::VersionConflict {
            skill_id: input.skill_id.clone(),
            version: input.version.clone(),
        });
    }

    let id = uuid::Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();
    tx.execute(
        "INSERT INTO skill_versions
            (id, skill_id, version, folder_path, content_hash, hash_updated_at, approval,
             approved_at, trusted, metadata_json, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6, ?7, ?8, ?9, ?10)",
        params![
            id,
            input.skill_id,
            input.version,
            input.folder_path,
            input.content_hash,
            input.approval.as_str(),
            if input.approval == ApprovalState::Approved {
                Some(now.clone())
            } else {
                None
            },
            input.trusted as i64,
            input.metadata_json.as_ref().map(|v| v.to_string()),
            now,
        ],
    )?;
    load_version_where(tx, "id = ?1", params![id])?
        .ok_or_else(|| ShieldError::VersionNotFound(id))
}

fn insert_files(tx: &Transaction<'_>, version_id: &str, files: &[NewFile]) -> Result<()> {
    for file in files {
        tx.execute(
            "INSERT INTO skill_files (id, skill_version_id, relative_path, file_hash, size_bytes)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(skill_version_id, relative_path) DO UPDATE SET
                file_hash = excluded.file_hash, size_bytes = excluded.size_bytes",
            params![
                uuid::Uuid::new_v4().to_string(),
                version_id,
                file.relative_path,
                file.file_hash,
                file.size_bytes as i64,
            ],
        )?;
    }
    Ok(())
}

fn recompute_content_hash_tx(tx: &Transaction<'_>, version_id: &str) -> Result<String> {
    let mut stmt = tx.prepare(
        "SELECT relative_path, file_hash FROM skill_files WHERE skill_version_id = ?1",
    )?;
    let rows = stmt.query_map(params![version_id], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    let mut entries = Vec::new();
    for row in rows {
        entries.push(row?);
    }
    drop(stmt);

    let hash = crate::fs::content_hash(&entries);
    let changed = tx.execute(
        "UPDATE skill_versions SET content_hash = ?1, hash_updated_at = ?2 WHERE id = ?3",
        params![hash, Utc::now().to_rfc3339(), version_id],
    )?;
    if changed == 0 {
        return Err(ShieldError::VersionNotFound(version_id.to_string()));
    }
    Ok(hash)
}

fn ensure_no_other_active(
    tx: &Transaction<'_>,
    skill_id: &str,
    profile_id: &Option<String>,
    target_id: &Option<String>,
    exclude: Option<&str>,
) -> Result<()> {
    let count: i64 = tx.query_row(
        "SELECT COUNT(*) FROM skill_installations si
         JOIN skill_versions sv ON sv.id = si.skill_version_id
         WHERE sv.skill_id = ?1 AND si.status = 'active'
           AND COALESCE(si.profile_id, '') = COALESCE(?2, '')
           AND COALESCE(si.target_id, '') = COALESCE(?3, '')
           AND si.id != COALESCE(?4, '')",
        params![skill_id, profile_id, target_id, exclude],
        |row| row.get(0),
    )?;
    if count > 0 {
        return Err(ShieldError::Other(anyhow::anyhow!(
            "skill {skill_id} already has an active installation for this target"
        )));
    }
    Ok(())
}
