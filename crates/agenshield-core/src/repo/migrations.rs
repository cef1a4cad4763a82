//! Numbered schema migrations.
//!
//! Each migration runs at most once; applied migrations are recorded as
//! `MIGRATION_<n>` marker rows in the meta table and replayed in fixed
//! numeric order on open.

use rusqlite::Connection;

const MIGRATIONS: &[(u32, &str)] = &[
    (
        1,
        r#"
        CREATE TABLE IF NOT EXISTS skills (
            id TEXT PRIMARY KEY,
            slug TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            author TEXT NULL,
            description TEXT NULL,
            tags TEXT NOT NULL DEFAULT '[]',
            source TEXT NOT NULL DEFAULT 'unknown',
            remote_id TEXT NULL,
            is_public INTEGER NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS skill_versions (
            id TEXT PRIMARY KEY,
            skill_id TEXT NOT NULL,
            version TEXT NOT NULL,
            folder_path TEXT NULL,
            content_hash TEXT NOT NULL DEFAULT '',
            hash_updated_at TEXT NULL,
            approval TEXT NOT NULL DEFAULT 'unknown',
            approved_at TEXT NULL,
            trusted INTEGER NOT NULL DEFAULT 0,
            analysis_status TEXT NOT NULL DEFAULT 'pending',
            analysis_json TEXT NULL,
            analyzed_at TEXT NULL,
            required_bins TEXT NOT NULL DEFAULT '[]',
            required_env TEXT NOT NULL DEFAULT '[]',
            extracted_commands TEXT NOT NULL DEFAULT '[]',
            metadata_json TEXT NULL,
            created_at TEXT NOT NULL,
            UNIQUE(skill_id, version),
            FOREIGN KEY(skill_id) REFERENCES skills(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS skill_files (
            id TEXT PRIMARY KEY,
            skill_version_id TEXT NOT NULL,
            relative_path TEXT NOT NULL,
            file_hash TEXT NOT NULL,
            size_bytes INTEGER NOT NULL,
            UNIQUE(skill_version_id, relative_path),
            FOREIGN KEY(skill_version_id) REFERENCES skill_versions(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS skill_installations (
            id TEXT PRIMARY KEY,
            skill_version_id TEXT NOT NULL,
            profile_id TEXT NULL,
            target_id TEXT NULL,
            user_username TEXT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            auto_update INTEGER NOT NULL DEFAULT 1,
            pinned_version TEXT NULL,
            wrapper_path TEXT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(skill_version_id) REFERENCES skill_versions(id) ON DELETE CASCADE
        );
        "#,
    ),
    (
        2,
        r#"
        CREATE INDEX IF NOT EXISTS idx_skill_versions_skill_id
            ON skill_versions(skill_id);
        CREATE INDEX IF NOT EXISTS idx_skill_files_version_id
            ON skill_files(skill_version_id);
        CREATE INDEX IF NOT EXISTS idx_skill_installations_version_id
            ON skill_installations(skill_version_id);
        CREATE INDEX IF NOT EXISTS idx_skills_remote_id
            ON skills(remote_id);
        "#,
    ),
];

fn marker_key(number: u32) -> String {
    format!("MIGRATION_{:04}", number)
}

/// Apply all unapplied migrations in numeric order.
pub fn run(conn: &mut Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );",
    )?;

    for (number, sql) in MIGRATIONS {
        let key = marker_key(*number);
        let applied: Option<String> = conn
            .query_row("SELECT value FROM meta WHERE key = ?1", [&key], |row| {
                row.get(0)
            })
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        if applied.is_some() {
            continue;
        }

        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.execute(
            "INSERT INTO meta (key, value) VALUES (?1, ?2)",
            rusqlite::params![key, chrono::Utc::now().to_rfc3339()],
        )?;
        tx.commit()?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        run(&mut conn).unwrap();
        run(&mut conn).unwrap();

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM meta WHERE key LIKE 'MIGRATION_%'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count as usize, MIGRATIONS.len());
    }

    #[test]
    fn schema_has_all_tables() {
        let mut conn = Connection::open_in_memory().unwrap();
        run(&mut conn).unwrap();
        for table in [
            "skills",
            "skill_versions",
            "skill_files",
            "skill_installations",
            "meta",
        ] {
            let found: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    [table],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(found, 1, "missing table {table}");
        }
    }
}
