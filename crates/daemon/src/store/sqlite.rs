// SQLite-backed store. One connection behind a mutex; every commit is a
// single transaction.
//
// Timestamps are stored as fixed-width RFC 3339 strings so that text order
// is chronological. Patches are stored as JSON.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Context};
use chrono::{DateTime, SecondsFormat, Utc};
use emendare_common::diff::Patch;
use emendare_common::types::{
    Amendment, AmendmentId, Document, DocumentId, Event, EventKind, User, UserId, VoteStance,
};
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Row, Transaction};
use uuid::Uuid;

use super::meta_db::MetaDb;
use super::{check_revision, EntityKind, Store, StoreError, WriteBatch};

const AMENDMENT_COLUMNS: &str = "id, document_id, author_id, name, description, base_version, \
     patch, created_at, delay_min_sec, delay_max_sec, closed, accepted, conflicted, version, \
     up_votes_count, down_votes_count, total_eligible_voters, closed_at, revision";

#[derive(Debug)]
pub struct SqliteStore {
    db: Mutex<MetaDb>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        Ok(Self::from_db(MetaDb::open(path)?))
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        Ok(Self::from_db(MetaDb::open_in_memory()?))
    }

    fn from_db(db: MetaDb) -> Self {
        Self { db: Mutex::new(db) }
    }

    fn db(&self) -> Result<MutexGuard<'_, MetaDb>, StoreError> {
        self.db.lock().map_err(|_| StoreError::Backend(anyhow!("database lock poisoned")))
    }
}

impl Store for SqliteStore {
    fn load_document(&self, id: DocumentId) -> Result<Document, StoreError> {
        let db = self.db()?;
        let conn = db.connection();

        let document = conn
            .query_row(
                "SELECT id, title, description, body, created_at, revision
                 FROM documents WHERE id = ?1",
                params![id.to_string()],
                |row| {
                    Ok(Document {
                        id: uuid_column(row, 0)?,
                        title: row.get(1)?,
                        description: row.get(2)?,
                        body: row.get(3)?,
                        patches: Vec::new(),
                        followers: Default::default(),
                        created_at: time_column(row, 4)?,
                        revision: row.get(5)?,
                    })
                },
            )
            .optional()
            .context("failed to load document")?;
        let mut document = document.ok_or(StoreError::NotFound { kind: EntityKind::Document, id })?;

        let mut stmt = conn
            .prepare(
                "SELECT patch FROM document_patches WHERE document_id = ?1 ORDER BY version ASC",
            )
            .context("failed to prepare patch query")?;
        document.patches = stmt
            .query_map(params![id.to_string()], |row| json_column::<Patch>(row, 0))
            .context("failed to query document patches")?
            .collect::<Result<_, _>>()
            .context("failed to read document patches")?;

        let mut stmt = conn
            .prepare("SELECT user_id FROM document_followers WHERE document_id = ?1")
            .context("failed to prepare follower query")?;
        document.followers = stmt
            .query_map(params![id.to_string()], |row| uuid_column(row, 0))
            .context("failed to query document followers")?
            .collect::<Result<_, _>>()
            .context("failed to read document followers")?;

        Ok(document)
    }

    fn load_amendment(&self, id: AmendmentId) -> Result<Amendment, StoreError> {
        let db = self.db()?;
        db.connection()
            .query_row(
                &format!("SELECT {AMENDMENT_COLUMNS} FROM amendments WHERE id = ?1"),
                params![id.to_string()],
                amendment_from_row,
            )
            .optional()
            .context("failed to load amendment")?
            .ok_or(StoreError::NotFound { kind: EntityKind::Amendment, id })
    }

    fn load_user(&self, id: UserId) -> Result<User, StoreError> {
        let db = self.db()?;
        let conn = db.connection();

        let user = conn
            .query_row(
                "SELECT id, name, created_at, revision FROM users WHERE id = ?1",
                params![id.to_string()],
                |row| {
                    let mut user = User::new(row.get::<_, String>(1)?, time_column(row, 2)?);
                    user.id = uuid_column(row, 0)?;
                    user.revision = row.get(3)?;
                    Ok(user)
                },
            )
            .optional()
            .context("failed to load user")?;
        let mut user = user.ok_or(StoreError::NotFound { kind: EntityKind::User, id })?;

        let mut stmt = conn
            .prepare("SELECT document_id FROM user_follows WHERE user_id = ?1")
            .context("failed to prepare follow query")?;
        user.followed_documents = stmt
            .query_map(params![id.to_string()], |row| uuid_column(row, 0))
            .context("failed to query user follows")?
            .collect::<Result<_, _>>()
            .context("failed to read user follows")?;

        let mut stmt = conn
            .prepare("SELECT amendment_id, stance FROM user_votes WHERE user_id = ?1")
            .context("failed to prepare vote query")?;
        let votes = stmt
            .query_map(params![id.to_string()], |row| {
                Ok((uuid_column(row, 0)?, row.get::<_, String>(1)?))
            })
            .context("failed to query user votes")?
            .collect::<Result<Vec<_>, _>>()
            .context("failed to read user votes")?;
        for (amendment_id, stance) in votes {
            match VoteStance::parse(&stance) {
                Some(VoteStance::Up) => user.up_votes.insert(amendment_id),
                Some(VoteStance::Down) => user.down_votes.insert(amendment_id),
                _ => {
                    return Err(StoreError::Backend(anyhow!(
                        "unexpected vote stance `{stance}` for user {id}"
                    )))
                }
            };
        }

        Ok(user)
    }

    fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut db = self.db()?;
        let tx = db.connection_mut().transaction().context("failed to start transaction")?;

        for document in &batch.documents {
            write_document(&tx, document)?;
        }
        for amendment in &batch.amendments {
            write_amendment(&tx, amendment)?;
        }
        for user in &batch.users {
            write_user(&tx, user)?;
        }
        for (id, revision) in &batch.deleted_users {
            match stored_revision(&tx, "users", *id)? {
                None => return Err(StoreError::NotFound { kind: EntityKind::User, id: *id }),
                Some(stored) if stored != *revision => {
                    return Err(StoreError::Conflict { kind: EntityKind::User, id: *id })
                }
                Some(_) => {}
            }
            tx.execute("DELETE FROM users WHERE id = ?1", params![id.to_string()])
                .context("failed to delete user")?;
        }
        for event in &batch.events {
            tx.execute(
                "INSERT INTO events (id, kind, target_id, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    event.id.to_string(),
                    event.kind.as_str(),
                    event.target_id.to_string(),
                    format_time(event.created_at),
                ],
            )
            .context("failed to insert event")?;
        }

        tx.commit().context("failed to commit transaction")?;
        Ok(())
    }

    fn find_open_amendments(&self) -> Result<Vec<Amendment>, StoreError> {
        let db = self.db()?;
        let mut stmt = db
            .connection()
            .prepare(&format!(
                "SELECT {AMENDMENT_COLUMNS} FROM amendments WHERE closed = 0 ORDER BY created_at, id"
            ))
            .context("failed to prepare open amendment query")?;
        let amendments = stmt
            .query_map([], amendment_from_row)
            .context("failed to query open amendments")?
            .collect::<Result<_, _>>()
            .context("failed to read open amendments")?;
        Ok(amendments)
    }

    fn find_document_amendments(
        &self,
        document_id: DocumentId,
    ) -> Result<Vec<Amendment>, StoreError> {
        let db = self.db()?;
        let mut stmt = db
            .connection()
            .prepare(&format!(
                "SELECT {AMENDMENT_COLUMNS} FROM amendments WHERE document_id = ?1 \
                 ORDER BY created_at, id"
            ))
            .context("failed to prepare document amendment query")?;
        let amendments = stmt
            .query_map(params![document_id.to_string()], amendment_from_row)
            .context("failed to query document amendments")?
            .collect::<Result<_, _>>()
            .context("failed to read document amendments")?;
        Ok(amendments)
    }

    fn list_events(&self, limit: usize) -> Result<Vec<Event>, StoreError> {
        let db = self.db()?;
        let mut stmt = db
            .connection()
            .prepare(
                "SELECT id, kind, target_id, created_at FROM events ORDER BY seq DESC LIMIT ?1",
            )
            .context("failed to prepare event query")?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let events = stmt
            .query_map(params![limit], |row| {
                let kind: String = row.get(1)?;
                let kind = EventKind::parse(&kind).ok_or_else(|| {
                    conversion_error(1, anyhow!("unknown event kind `{kind}`"))
                })?;
                Ok(Event {
                    id: uuid_column(row, 0)?,
                    kind,
                    target_id: uuid_column(row, 2)?,
                    created_at: time_column(row, 3)?,
                })
            })
            .context("failed to query events")?
            .collect::<Result<_, _>>()
            .context("failed to read events")?;
        Ok(events)
    }
}

fn write_document(tx: &Transaction<'_>, document: &Document) -> Result<(), StoreError> {
    let stored = stored_revision(tx, "documents", document.id)?;
    check_revision(EntityKind::Document, document.id, stored, document.revision)?;
    let id = document.id.to_string();

    if document.revision == 0 {
        tx.execute(
            "INSERT INTO documents (id, title, description, body, created_at, revision)
             VALUES (?1, ?2, ?3, ?4, ?5, 1)",
            params![
                id,
                document.title,
                document.description,
                document.body,
                format_time(document.created_at)
            ],
        )
        .context("failed to insert document")?;
    } else {
        tx.execute(
            "UPDATE documents SET title = ?2, description = ?3, body = ?4, revision = revision + 1
             WHERE id = ?1",
            params![id, document.title, document.description, document.body],
        )
        .context("failed to update document")?;
    }

    // History is append-only: only versions past the stored ones are new.
    let stored_versions: usize = tx
        .query_row(
            "SELECT COUNT(*) FROM document_patches WHERE document_id = ?1",
            params![id],
            |row| row.get(0),
        )
        .context("failed to count document patches")?;
    for (version, patch) in document.patches.iter().enumerate().skip(stored_versions) {
        let json = serde_json::to_string(patch).context("failed to encode patch")?;
        tx.execute(
            "INSERT INTO document_patches (document_id, version, patch) VALUES (?1, ?2, ?3)",
            params![id, version, json],
        )
        .context("failed to insert document patch")?;
    }

    tx.execute("DELETE FROM document_followers WHERE document_id = ?1", params![id])
        .context("failed to clear document followers")?;
    for follower in &document.followers {
        tx.execute(
            "INSERT INTO document_followers (document_id, user_id) VALUES (?1, ?2)",
            params![id, follower.to_string()],
        )
        .context("failed to insert document follower")?;
    }
    Ok(())
}

fn write_amendment(tx: &Transaction<'_>, amendment: &Amendment) -> Result<(), StoreError> {
    let stored = stored_revision(tx, "amendments", amendment.id)?;
    check_revision(EntityKind::Amendment, amendment.id, stored, amendment.revision)?;

    let patch = serde_json::to_string(&amendment.patch).context("failed to encode patch")?;
    tx.execute(
        &format!(
            "INSERT OR REPLACE INTO amendments ({AMENDMENT_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)"
        ),
        params![
            amendment.id.to_string(),
            amendment.document_id.to_string(),
            amendment.author_id.to_string(),
            amendment.name,
            amendment.description,
            amendment.base_version,
            patch,
            format_time(amendment.created_at),
            amendment.delay_min_sec,
            amendment.delay_max_sec,
            amendment.closed,
            amendment.accepted,
            amendment.conflicted,
            amendment.version,
            amendment.up_votes_count,
            amendment.down_votes_count,
            amendment.total_eligible_voters,
            amendment.closed_at.map(format_time),
            amendment.revision + 1,
        ],
    )
    .context("failed to write amendment")?;
    Ok(())
}

fn write_user(tx: &Transaction<'_>, user: &User) -> Result<(), StoreError> {
    let stored = stored_revision(tx, "users", user.id)?;
    check_revision(EntityKind::User, user.id, stored, user.revision)?;
    let id = user.id.to_string();

    if user.revision == 0 {
        tx.execute(
            "INSERT INTO users (id, name, created_at, revision) VALUES (?1, ?2, ?3, 1)",
            params![id, user.name, format_time(user.created_at)],
        )
        .context("failed to insert user")?;
    } else {
        tx.execute(
            "UPDATE users SET name = ?2, revision = revision + 1 WHERE id = ?1",
            params![id, user.name],
        )
        .context("failed to update user")?;
    }

    tx.execute("DELETE FROM user_follows WHERE user_id = ?1", params![id])
        .context("failed to clear user follows")?;
    for document_id in &user.followed_documents {
        tx.execute(
            "INSERT INTO user_follows (user_id, document_id) VALUES (?1, ?2)",
            params![id, document_id.to_string()],
        )
        .context("failed to insert user follow")?;
    }

    tx.execute("DELETE FROM user_votes WHERE user_id = ?1", params![id])
        .context("failed to clear user votes")?;
    let votes = user
        .up_votes
        .iter()
        .map(|a| (a, VoteStance::Up))
        .chain(user.down_votes.iter().map(|a| (a, VoteStance::Down)));
    for (amendment_id, stance) in votes {
        tx.execute(
            "INSERT INTO user_votes (user_id, amendment_id, stance) VALUES (?1, ?2, ?3)",
            params![id, amendment_id.to_string(), stance.as_str()],
        )
        .context("failed to insert user vote")?;
    }
    Ok(())
}

fn stored_revision(
    tx: &Transaction<'_>,
    table: &'static str,
    id: Uuid,
) -> Result<Option<u64>, StoreError> {
    let revision = tx
        .query_row(
            &format!("SELECT revision FROM {table} WHERE id = ?1"),
            params![id.to_string()],
            |row| row.get(0),
        )
        .optional()
        .with_context(|| format!("failed to read revision from {table}"))?;
    Ok(revision)
}

fn amendment_from_row(row: &Row<'_>) -> rusqlite::Result<Amendment> {
    Ok(Amendment {
        id: uuid_column(row, 0)?,
        document_id: uuid_column(row, 1)?,
        author_id: uuid_column(row, 2)?,
        name: row.get(3)?,
        description: row.get(4)?,
        base_version: row.get(5)?,
        patch: json_column(row, 6)?,
        created_at: time_column(row, 7)?,
        delay_min_sec: row.get(8)?,
        delay_max_sec: row.get(9)?,
        closed: row.get(10)?,
        accepted: row.get(11)?,
        conflicted: row.get(12)?,
        version: row.get(13)?,
        up_votes_count: row.get(14)?,
        down_votes_count: row.get(15)?,
        total_eligible_voters: row.get(16)?,
        closed_at: row
            .get::<_, Option<String>>(17)?
            .map(|value| parse_time(17, &value))
            .transpose()?,
        revision: row.get(18)?,
    })
}

fn format_time(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_time(idx: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|error| conversion_error(idx, error))
}

fn time_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    parse_time(idx, &row.get::<_, String>(idx)?)
}

fn uuid_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let value: String = row.get(idx)?;
    Uuid::parse_str(&value).map_err(|error| conversion_error(idx, error))
}

fn json_column<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let value: String = row.get(idx)?;
    serde_json::from_str(&value).map_err(|error| conversion_error(idx, error))
}

fn conversion_error(
    idx: usize,
    error: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, error.into())
}
