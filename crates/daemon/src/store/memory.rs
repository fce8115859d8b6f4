// In-process store used for tests and the `memory` storage backend.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use anyhow::anyhow;
use emendare_common::types::{
    Amendment, AmendmentId, Document, DocumentId, Event, User, UserId,
};

use super::{check_revision, EntityKind, Store, StoreError, WriteBatch};

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    documents: HashMap<DocumentId, Document>,
    amendments: HashMap<AmendmentId, Amendment>,
    users: HashMap<UserId, User>,
    /// Append order.
    events: Vec<Event>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
        self.state.lock().map_err(|_| StoreError::Backend(anyhow!("memory store lock poisoned")))
    }
}

impl Store for MemoryStore {
    fn load_document(&self, id: DocumentId) -> Result<Document, StoreError> {
        self.state()?
            .documents
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound { kind: EntityKind::Document, id })
    }

    fn load_amendment(&self, id: AmendmentId) -> Result<Amendment, StoreError> {
        self.state()?
            .amendments
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound { kind: EntityKind::Amendment, id })
    }

    fn load_user(&self, id: UserId) -> Result<User, StoreError> {
        self.state()?
            .users
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound { kind: EntityKind::User, id })
    }

    fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut state = self.state()?;

        // Validate everything before touching any map.
        for document in &batch.documents {
            let stored = state.documents.get(&document.id).map(|d| d.revision);
            check_revision(EntityKind::Document, document.id, stored, document.revision)?;
        }
        for amendment in &batch.amendments {
            let stored = state.amendments.get(&amendment.id).map(|a| a.revision);
            check_revision(EntityKind::Amendment, amendment.id, stored, amendment.revision)?;
        }
        for user in &batch.users {
            let stored = state.users.get(&user.id).map(|u| u.revision);
            check_revision(EntityKind::User, user.id, stored, user.revision)?;
        }
        for (id, revision) in &batch.deleted_users {
            match state.users.get(id) {
                None => return Err(StoreError::NotFound { kind: EntityKind::User, id: *id }),
                Some(user) if user.revision != *revision => {
                    return Err(StoreError::Conflict { kind: EntityKind::User, id: *id })
                }
                Some(_) => {}
            }
        }

        for mut document in batch.documents {
            document.revision += 1;
            state.documents.insert(document.id, document);
        }
        for mut amendment in batch.amendments {
            amendment.revision += 1;
            state.amendments.insert(amendment.id, amendment);
        }
        for mut user in batch.users {
            user.revision += 1;
            state.users.insert(user.id, user);
        }
        for (id, _) in batch.deleted_users {
            state.users.remove(&id);
        }
        state.events.extend(batch.events);
        Ok(())
    }

    fn find_open_amendments(&self) -> Result<Vec<Amendment>, StoreError> {
        let state = self.state()?;
        let mut open: Vec<Amendment> =
            state.amendments.values().filter(|a| a.is_open()).cloned().collect();
        open.sort_by_key(|a| (a.created_at, a.id));
        Ok(open)
    }

    fn find_document_amendments(
        &self,
        document_id: DocumentId,
    ) -> Result<Vec<Amendment>, StoreError> {
        let state = self.state()?;
        let mut found: Vec<Amendment> = state
            .amendments
            .values()
            .filter(|a| a.document_id == document_id)
            .cloned()
            .collect();
        found.sort_by_key(|a| (a.created_at, a.id));
        Ok(found)
    }

    fn list_events(&self, limit: usize) -> Result<Vec<Event>, StoreError> {
        Ok(self.state()?.events.iter().rev().take(limit).cloned().collect())
    }
}
