// Persistence: the `Store` capability and its backends.
//
// Every entity carries a `revision`. A batch is committed all-or-nothing:
// revision 0 inserts a new row, any other revision must match the stored
// one, and the stored copy comes back with `revision + 1`.

pub mod memory;
pub mod meta_db;
pub mod sqlite;

use std::fmt;

use emendare_common::types::{
    Amendment, AmendmentId, Document, DocumentId, Event, User, UserId,
};
use thiserror::Error;
use uuid::Uuid;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Document,
    Amendment,
    User,
}

impl EntityKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Amendment => "amendment",
            Self::User => "user",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {id} not found")]
    NotFound { kind: EntityKind, id: Uuid },
    #[error("{kind} {id} was modified concurrently")]
    Conflict { kind: EntityKind, id: Uuid },
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Entities to persist together.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    pub documents: Vec<Document>,
    pub amendments: Vec<Amendment>,
    pub users: Vec<User>,
    pub events: Vec<Event>,
    /// `(id, expected revision)` of users to remove.
    pub deleted_users: Vec<(UserId, u64)>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn document(mut self, document: &Document) -> Self {
        self.documents.push(document.clone());
        self
    }

    pub fn amendment(mut self, amendment: &Amendment) -> Self {
        self.amendments.push(amendment.clone());
        self
    }

    pub fn user(mut self, user: &User) -> Self {
        self.users.push(user.clone());
        self
    }

    pub fn event(mut self, event: Event) -> Self {
        self.events.push(event);
        self
    }

    pub fn delete_user(mut self, user: &User) -> Self {
        self.deleted_users.push((user.id, user.revision));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
            && self.amendments.is_empty()
            && self.users.is_empty()
            && self.events.is_empty()
            && self.deleted_users.is_empty()
    }
}

/// Entity persistence used by the engine.
///
/// Implementations are synchronous; they are expected to be local and
/// fast (in-process maps or an embedded SQLite file).
pub trait Store: Send + Sync {
    fn load_document(&self, id: DocumentId) -> Result<Document, StoreError>;
    fn load_amendment(&self, id: AmendmentId) -> Result<Amendment, StoreError>;
    fn load_user(&self, id: UserId) -> Result<User, StoreError>;

    /// Persists the batch atomically; nothing is written on error.
    fn commit(&self, batch: WriteBatch) -> Result<(), StoreError>;

    fn find_open_amendments(&self) -> Result<Vec<Amendment>, StoreError>;
    /// Amendments of one document, oldest first.
    fn find_document_amendments(
        &self,
        document_id: DocumentId,
    ) -> Result<Vec<Amendment>, StoreError>;
    /// Most recent events first.
    fn list_events(&self, limit: usize) -> Result<Vec<Event>, StoreError>;
}

/// Checks a write against the stored revision (`None` when absent).
pub(crate) fn check_revision(
    kind: EntityKind,
    id: Uuid,
    stored: Option<u64>,
    expected: u64,
) -> Result<(), StoreError> {
    match (stored, expected) {
        (None, 0) => Ok(()),
        (Some(current), expected) if expected != 0 && current == expected => Ok(()),
        (None, _) => Err(StoreError::NotFound { kind, id }),
        _ => Err(StoreError::Conflict { kind, id }),
    }
}
