use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{params, Connection};

const MIGRATION_V1_SQL: &str = r#"
CREATE TABLE documents (
    id              TEXT PRIMARY KEY,
    title           TEXT NOT NULL,
    description     TEXT NOT NULL DEFAULT '',
    body            TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    revision        INTEGER NOT NULL
);

CREATE TABLE document_patches (
    document_id     TEXT NOT NULL REFERENCES documents (id) ON DELETE CASCADE,
    version         INTEGER NOT NULL,
    patch           TEXT NOT NULL,
    PRIMARY KEY (document_id, version)
);

CREATE TABLE document_followers (
    document_id     TEXT NOT NULL REFERENCES documents (id) ON DELETE CASCADE,
    user_id         TEXT NOT NULL,
    PRIMARY KEY (document_id, user_id)
);

CREATE TABLE amendments (
    id                      TEXT PRIMARY KEY,
    document_id             TEXT NOT NULL REFERENCES documents (id),
    author_id               TEXT NOT NULL,
    name                    TEXT NOT NULL,
    description             TEXT NOT NULL DEFAULT '',
    base_version            INTEGER NOT NULL,
    patch                   TEXT NOT NULL,
    created_at              TEXT NOT NULL,
    delay_min_sec           INTEGER NOT NULL,
    delay_max_sec           INTEGER NOT NULL,
    closed                  INTEGER NOT NULL DEFAULT 0,
    accepted                INTEGER NOT NULL DEFAULT 0,
    conflicted              INTEGER NOT NULL DEFAULT 0,
    version                 INTEGER NULL,
    up_votes_count          INTEGER NOT NULL DEFAULT 0,
    down_votes_count        INTEGER NOT NULL DEFAULT 0,
    total_eligible_voters   INTEGER NULL,
    closed_at               TEXT NULL,
    revision                INTEGER NOT NULL
);

CREATE INDEX amendments_open_idx
    ON amendments (closed);

CREATE INDEX amendments_document_idx
    ON amendments (document_id, created_at);

CREATE TABLE users (
    id              TEXT PRIMARY KEY,
    name            TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    revision        INTEGER NOT NULL
);

CREATE TABLE user_follows (
    user_id         TEXT NOT NULL REFERENCES users (id) ON DELETE CASCADE,
    document_id     TEXT NOT NULL,
    PRIMARY KEY (user_id, document_id)
);

CREATE TABLE user_votes (
    user_id         TEXT NOT NULL REFERENCES users (id) ON DELETE CASCADE,
    amendment_id    TEXT NOT NULL,
    stance          TEXT NOT NULL CHECK (stance IN ('up', 'down')),
    PRIMARY KEY (user_id, amendment_id)
);
"#;

const MIGRATION_V2_SQL: &str = r#"
CREATE TABLE events (
    seq             INTEGER PRIMARY KEY AUTOINCREMENT,
    id              TEXT NOT NULL UNIQUE,
    kind            TEXT NOT NULL,
    target_id       TEXT NOT NULL,
    created_at      TEXT NOT NULL
);
"#;

const MIGRATIONS: &[(i64, &str)] = &[(1, MIGRATION_V1_SQL), (2, MIGRATION_V2_SQL)];

/// The SQLite file behind [`super::SqliteStore`], migrated on open.
#[derive(Debug)]
pub struct MetaDb {
    conn: Connection,
}

impl MetaDb {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database parent directory `{}`", parent.display())
            })?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database at `{}`", path.display()))?;
        Self::configure(conn)
    }

    /// A private in-memory database with the full schema.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        Self::configure(conn)
    }

    fn configure(mut conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            ",
        )
        .context("failed to configure sqlite pragmas")?;

        ensure_migration_table(&conn)?;
        apply_pending_migrations(&mut conn)?;

        Ok(Self { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    pub fn schema_version(&self) -> Result<i64> {
        current_schema_version(&self.conn)
    }
}

fn ensure_migration_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY,
            applied_at  TEXT NOT NULL
        );
        ",
    )
    .context("failed to ensure schema_migrations table exists")
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| row.get(0))
        .context("failed to read current schema version")
}

fn apply_pending_migrations(conn: &mut Connection) -> Result<()> {
    let current_version = current_schema_version(conn)?;

    for (version, sql) in MIGRATIONS {
        if *version <= current_version {
            continue;
        }

        let tx = conn.transaction().context("failed to start migration transaction")?;
        tx.execute_batch(sql).with_context(|| format!("failed to apply migration v{version}"))?;
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, datetime('now'))",
            params![version],
        )
        .with_context(|| format!("failed to record migration v{version}"))?;
        tx.commit().with_context(|| format!("failed to commit migration v{version}"))?;
        tracing::debug!(version, "applied schema migration");
    }

    Ok(())
}
