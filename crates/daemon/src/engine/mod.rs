// Amendment voting and document versioning.
//
// Every mutation runs as load -> mutate -> commit of one `WriteBatch`.
// Votes and closure hold the amendment lock; merges and follower changes
// hold the document lock. Locks are always taken amendment first.

pub mod error;
pub mod ledger;
pub mod locks;
pub mod merge;
pub mod policy;
pub mod scheduler;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use emendare_common::diff::{self, DiffOp, Patch};
use emendare_common::protocol::topics;
use emendare_common::types::{
    Amendment, AmendmentId, AmendmentStatus, Document, DocumentId, ElectorateMode, Event,
    EventKind, User, UserId, VoteStance,
};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use error::EngineError;

use crate::config::VotingConfig;
use crate::notify::Publisher;
use crate::store::{EntityKind, Store, StoreError, WriteBatch};
use locks::KeyedLocks;
use merge::MergeOutcome;
use policy::{ClosureDecision, PolicyInput};

/// Attempts after a revision conflict before giving up.
pub const MAX_CONFLICT_RETRIES: u32 = 5;
const CONFLICT_BACKOFF_BASE_MICROS: u64 = 500;

/// Defaults applied to new amendments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    pub delay_min_sec: u64,
    pub delay_max_sec: u64,
    pub electorate: ElectorateMode,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from(&VotingConfig::default())
    }
}

impl From<&VotingConfig> for EngineSettings {
    fn from(config: &VotingConfig) -> Self {
        Self {
            delay_min_sec: config.delay_min_sec,
            delay_max_sec: config.delay_max_sec,
            electorate: config.electorate,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAmendment {
    pub document_id: DocumentId,
    pub author_id: UserId,
    pub name: String,
    pub description: String,
    pub base_version: usize,
    pub patch: Patch,
    /// Overrides the configured delays for this amendment only.
    pub delay_min_sec: Option<u64>,
    pub delay_max_sec: Option<u64>,
}

/// The text an amendment would produce against its base version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AmendmentPreview {
    pub amendment_id: AmendmentId,
    pub base_version: usize,
    pub base_body: String,
    pub proposed_body: String,
    /// False when some hunk did not apply to the base version.
    pub clean: bool,
    pub ops: Vec<DiffOp>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ClosureOutcome {
    StillOpen,
    /// Already closed by an earlier evaluation.
    Skipped,
    Accepted { version: usize },
    Rejected,
    Conflicted,
}

#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    store: Arc<dyn Store>,
    publisher: Arc<dyn Publisher>,
    settings: EngineSettings,
    amendment_locks: KeyedLocks<AmendmentId>,
    document_locks: KeyedLocks<DocumentId>,
}

impl Engine {
    pub fn new(
        store: Arc<dyn Store>,
        publisher: Arc<dyn Publisher>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                store,
                publisher,
                settings,
                amendment_locks: KeyedLocks::new(),
                document_locks: KeyedLocks::new(),
            }),
        }
    }

    pub fn settings(&self) -> EngineSettings {
        self.inner.settings
    }

    fn store(&self) -> &dyn Store {
        self.inner.store.as_ref()
    }

    fn publish(&self, topic: &str, payload: Value) {
        self.inner.publisher.publish(topic, payload);
    }

    // ── Users ──────────────────────────────────────────────────────

    pub async fn create_user(&self, name: &str) -> Result<User, EngineError> {
        let name = required("name", name)?;
        let mut user = User::new(name, Utc::now());
        self.store().commit(WriteBatch::new().user(&user))?;
        user.revision += 1;
        info!(user_id = %user.id, "user created");
        Ok(user)
    }

    /// Removes a user after retracting their open votes and follows.
    pub async fn delete_user(&self, user_id: UserId) -> Result<(), EngineError> {
        let mut attempts = 0;
        loop {
            let snapshot = self.store().load_user(user_id)?;
            let voted = snapshot.voted_amendments();
            let followed = snapshot.followed_documents.clone();

            let mut guards = Vec::with_capacity(voted.len() + followed.len());
            for amendment_id in &voted {
                guards.push(self.inner.amendment_locks.lock(*amendment_id).await);
            }
            for document_id in &followed {
                guards.push(self.inner.document_locks.lock(*document_id).await);
            }

            match self.remove_user_locked(user_id, &voted, &followed) {
                Err(error) if error.is_conflict() && attempts < MAX_CONFLICT_RETRIES => {
                    drop(guards);
                    let delay = conflict_backoff(attempts);
                    attempts += 1;
                    debug!(user_id = %user_id, attempts, "user changed during removal, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(error) => {
                    drop(guards);
                    for document_id in &followed {
                        self.release_document(*document_id).await;
                    }
                    return Err(error);
                }
                Ok(changes) => {
                    drop(guards);
                    for document_id in &followed {
                        self.release_document(*document_id).await;
                    }
                    for amendment in &changes.amendments {
                        self.publish(&topics::amendment(amendment.id), tally_payload(amendment));
                    }
                    for document in &changes.documents {
                        self.publish(&topics::document(document.id), followers_payload(document));
                    }
                    info!(
                        user_id = %user_id,
                        retracted = changes.amendments.len(),
                        unfollowed = changes.documents.len(),
                        "user removed"
                    );
                    return Ok(());
                }
            }
        }
    }

    fn remove_user_locked(
        &self,
        user_id: UserId,
        locked_amendments: &BTreeSet<AmendmentId>,
        locked_documents: &BTreeSet<DocumentId>,
    ) -> Result<RemovalChanges, EngineError> {
        let mut user = self.store().load_user(user_id)?;
        if !user.voted_amendments().is_subset(locked_amendments)
            || !user.followed_documents.is_subset(locked_documents)
        {
            // Report as a conflict so the caller re-locks the new sets.
            return Err(EngineError::Storage(StoreError::Conflict {
                kind: EntityKind::User,
                id: user_id,
            }));
        }

        let mut changes = RemovalChanges::default();
        for amendment_id in user.voted_amendments() {
            let mut amendment = match self.store().load_amendment(amendment_id) {
                Ok(amendment) => amendment,
                Err(StoreError::NotFound { .. }) => {
                    warn!(amendment_id = %amendment_id, "vote references a missing amendment");
                    continue;
                }
                Err(error) => return Err(error.into()),
            };
            if !ledger::retract_for_removal(&mut amendment, &mut user).is_noop() {
                changes.amendments.push(amendment);
            }
        }
        for document_id in user.followed_documents.clone() {
            let mut document = self.store().load_document(document_id)?;
            document.followers.remove(&user_id);
            user.followed_documents.remove(&document_id);
            changes.documents.push(document);
        }

        let mut batch = WriteBatch::new().delete_user(&user);
        for amendment in &changes.amendments {
            batch = batch.amendment(amendment);
        }
        for document in &changes.documents {
            batch = batch.document(document);
        }
        self.store().commit(batch)?;
        Ok(changes)
    }

    // ── Documents ──────────────────────────────────────────────────

    pub async fn create_document(
        &self,
        title: &str,
        description: &str,
        body: &str,
    ) -> Result<Document, EngineError> {
        let title = required("title", title)?;
        let now = Utc::now();
        let mut document = Document::new(title, description, body, now);
        let event = Event::new(EventKind::DocumentCreated, document.id, now);

        self.store().commit(WriteBatch::new().document(&document).event(event.clone()))?;
        document.revision += 1;

        info!(document_id = %document.id, version = document.current_version(), "document created");
        self.publish(topics::EVENTS, event_payload(&event));
        Ok(document)
    }

    pub async fn get_document(&self, document_id: DocumentId) -> Result<Document, EngineError> {
        Ok(self.store().load_document(document_id)?)
    }

    /// Body of the document as it was at `version`, replayed from history.
    pub async fn document_at(
        &self,
        document_id: DocumentId,
        version: usize,
    ) -> Result<String, EngineError> {
        let document = self.store().load_document(document_id)?;
        Ok(diff::reconstruct_body(&document.patches, version)?)
    }

    /// Amendments of a document, oldest first.
    pub async fn document_amendments(
        &self,
        document_id: DocumentId,
    ) -> Result<Vec<Amendment>, EngineError> {
        self.store().load_document(document_id)?;
        Ok(self.store().find_document_amendments(document_id)?)
    }

    pub async fn follow(
        &self,
        user_id: UserId,
        document_id: DocumentId,
    ) -> Result<Document, EngineError> {
        self.change_following(user_id, document_id, true).await
    }

    pub async fn unfollow(
        &self,
        user_id: UserId,
        document_id: DocumentId,
    ) -> Result<Document, EngineError> {
        self.change_following(user_id, document_id, false).await
    }

    async fn change_following(
        &self,
        user_id: UserId,
        document_id: DocumentId,
        follow: bool,
    ) -> Result<Document, EngineError> {
        let guard = self.inner.document_locks.lock(document_id).await;

        let result = with_conflict_retry("follow", || {
            let mut document = self.store().load_document(document_id)?;
            let mut user = self.store().load_user(user_id)?;

            match (follow, user.follows(document_id)) {
                (true, true) => return Err(EngineError::AlreadyFollowing { user_id, document_id }),
                (false, false) => return Err(EngineError::NotFollowing { user_id, document_id }),
                (true, false) => {
                    user.followed_documents.insert(document_id);
                    document.followers.insert(user_id);
                }
                (false, true) => {
                    user.followed_documents.remove(&document_id);
                    document.followers.remove(&user_id);
                }
            }

            self.store().commit(WriteBatch::new().document(&document).user(&user))?;
            document.revision += 1;
            Ok(document)
        })
        .await;
        drop(guard);
        self.release_document(document_id).await;
        let document = result?;

        debug!(
            user_id = %user_id,
            document_id = %document_id,
            follow,
            followers = document.followers_count(),
            "followers changed"
        );
        self.publish(&topics::document(document_id), followers_payload(&document));
        Ok(document)
    }

    // ── Amendments ─────────────────────────────────────────────────

    pub async fn propose_amendment(&self, request: NewAmendment) -> Result<Amendment, EngineError> {
        let name = required("name", &request.name)?;
        if request.patch.is_empty() {
            return Err(EngineError::InvalidRequest("patch does not change anything".into()));
        }
        let settings = self.inner.settings;
        let delay_min_sec = request.delay_min_sec.unwrap_or(settings.delay_min_sec);
        let delay_max_sec = request.delay_max_sec.unwrap_or(settings.delay_max_sec);
        if delay_min_sec > delay_max_sec {
            return Err(EngineError::InvalidRequest(format!(
                "delay_min_sec ({delay_min_sec}) exceeds delay_max_sec ({delay_max_sec})"
            )));
        }

        self.store().load_user(request.author_id)?;
        let document = self.store().load_document(request.document_id)?;
        if request.base_version > document.current_version() {
            return Err(EngineError::StaleVersion {
                base_version: request.base_version,
                current_version: document.current_version(),
            });
        }

        let base_body = if request.base_version == document.current_version() {
            document.body.clone()
        } else {
            diff::reconstruct_body(&document.patches, request.base_version)?
        };
        let application = diff::apply(&request.patch, &base_body);
        if !application.success {
            return Err(EngineError::InvalidRequest(format!(
                "patch does not apply to version {} ({} failed hunks)",
                request.base_version,
                application.failed_hunks()
            )));
        }

        let now = Utc::now();
        let total_eligible_voters = match settings.electorate {
            ElectorateMode::Live => None,
            ElectorateMode::Snapshot => Some(document.followers_count()),
        };
        let mut amendment = Amendment {
            id: Uuid::new_v4(),
            document_id: document.id,
            author_id: request.author_id,
            name,
            description: request.description,
            base_version: request.base_version,
            patch: request.patch,
            created_at: now,
            delay_min_sec,
            delay_max_sec,
            closed: false,
            accepted: false,
            conflicted: false,
            version: None,
            up_votes_count: 0,
            down_votes_count: 0,
            total_eligible_voters,
            closed_at: None,
            revision: 0,
        };
        let event = Event::new(EventKind::AmendmentProposed, amendment.id, now);

        self.store().commit(WriteBatch::new().amendment(&amendment).event(event.clone()))?;
        amendment.revision += 1;

        info!(
            amendment_id = %amendment.id,
            document_id = %amendment.document_id,
            base_version = amendment.base_version,
            hunks = amendment.patch.len(),
            "amendment proposed"
        );
        self.publish(topics::EVENTS, event_payload(&event));
        self.publish(
            &topics::document(amendment.document_id),
            json!({ "document_id": amendment.document_id, "amendment_proposed": amendment.id }),
        );
        self.publish(&topics::amendment(amendment.id), tally_payload(&amendment));
        Ok(amendment)
    }

    pub async fn get_amendment(&self, amendment_id: AmendmentId) -> Result<Amendment, EngineError> {
        Ok(self.store().load_amendment(amendment_id)?)
    }

    /// Records `stance` and returns the amendment with its updated counts.
    pub async fn cast_vote(
        &self,
        amendment_id: AmendmentId,
        user_id: UserId,
        stance: VoteStance,
    ) -> Result<Amendment, EngineError> {
        let _guard = self.inner.amendment_locks.lock(amendment_id).await;

        let (amendment, changed) = with_conflict_retry("vote", || {
            let mut amendment = self.store().load_amendment(amendment_id)?;
            let mut user = self.store().load_user(user_id)?;
            let change = ledger::cast(&mut amendment, &mut user, stance)?;
            if change.is_noop() {
                return Ok((amendment, false));
            }

            self.store().commit(WriteBatch::new().amendment(&amendment).user(&user))?;
            amendment.revision += 1;
            Ok((amendment, true))
        })
        .await?;

        if changed {
            debug!(
                amendment_id = %amendment_id,
                user_id = %user_id,
                stance = stance.as_str(),
                up = amendment.up_votes_count,
                down = amendment.down_votes_count,
                "vote recorded"
            );
            self.publish(&topics::amendment(amendment_id), tally_payload(&amendment));
        }
        Ok(amendment)
    }

    pub async fn amendment_preview(
        &self,
        amendment_id: AmendmentId,
    ) -> Result<AmendmentPreview, EngineError> {
        let amendment = self.store().load_amendment(amendment_id)?;
        let document = self.store().load_document(amendment.document_id)?;
        let base_body = diff::reconstruct_body(&document.patches, amendment.base_version)?;
        let application = diff::apply(&amendment.patch, &base_body);
        let ops = diff::diff_ops(&base_body, &application.text);

        Ok(AmendmentPreview {
            amendment_id,
            base_version: amendment.base_version,
            base_body,
            proposed_body: application.text,
            clean: application.success,
            ops,
        })
    }

    pub async fn list_events(&self, limit: usize) -> Result<Vec<Event>, EngineError> {
        Ok(self.store().list_events(limit)?)
    }

    // ── Closure ────────────────────────────────────────────────────

    /// Applies the closure policy to one amendment as of `now`.
    pub async fn evaluate_amendment(
        &self,
        amendment_id: AmendmentId,
        now: DateTime<Utc>,
    ) -> Result<ClosureOutcome, EngineError> {
        let _amendment_guard = self.inner.amendment_locks.lock(amendment_id).await;

        let amendment = self.store().load_amendment(amendment_id)?;
        if amendment.closed {
            return Ok(ClosureOutcome::Skipped);
        }
        let document = self.store().load_document(amendment.document_id)?;
        if self.decide(&amendment, &document, now) == ClosureDecision::StillOpen {
            return Ok(ClosureOutcome::StillOpen);
        }

        let document_id = amendment.document_id;
        let document_guard = self.inner.document_locks.lock(document_id).await;

        // Reload under the document lock: an earlier merge may have moved it.
        let closure = with_conflict_retry("closure", || {
            let mut amendment = self.store().load_amendment(amendment_id)?;
            if amendment.closed {
                return Ok((amendment, None, ClosureOutcome::Skipped));
            }
            let mut document = self.store().load_document(document_id)?;

            let accepted = match self.decide(&amendment, &document, now) {
                ClosureDecision::StillOpen => return Ok((amendment, None, ClosureOutcome::StillOpen)),
                ClosureDecision::Close { accepted, rule } => {
                    debug!(
                        amendment_id = %amendment_id,
                        accepted,
                        rule = rule.as_str(),
                        "closure rule fired"
                    );
                    accepted
                }
            };

            if !accepted {
                merge::reject_amendment(&mut amendment, now);
                self.store().commit(WriteBatch::new().amendment(&amendment))?;
                amendment.revision += 1;
                return Ok((amendment, None, ClosureOutcome::Rejected));
            }

            match merge::merge_amendment(&mut document, &mut amendment, now) {
                MergeOutcome::Merged { version } => {
                    self.store()
                        .commit(WriteBatch::new().document(&document).amendment(&amendment))?;
                    amendment.revision += 1;
                    document.revision += 1;
                    Ok((amendment, Some(document), ClosureOutcome::Accepted { version }))
                }
                MergeOutcome::Conflicted { failed_hunks } => {
                    warn!(
                        amendment_id = %amendment_id,
                        document_id = %document_id,
                        failed_hunks,
                        "accepted amendment does not apply to the current body"
                    );
                    self.store().commit(WriteBatch::new().amendment(&amendment))?;
                    amendment.revision += 1;
                    Ok((amendment, None, ClosureOutcome::Conflicted))
                }
            }
        })
        .await;
        drop(document_guard);
        self.release_document(document_id).await;
        let (amendment, document, outcome) = closure?;

        match outcome {
            ClosureOutcome::StillOpen | ClosureOutcome::Skipped => return Ok(outcome),
            ClosureOutcome::Accepted { version } => {
                info!(amendment_id = %amendment_id, document_id = %document_id, version, "amendment merged");
            }
            ClosureOutcome::Rejected => {
                info!(amendment_id = %amendment_id, "amendment rejected");
            }
            ClosureOutcome::Conflicted => {
                info!(amendment_id = %amendment_id, "amendment closed as conflicted");
            }
        }

        let mut payload = tally_payload(&amendment);
        if outcome == ClosureOutcome::Conflicted {
            let conflict = EngineError::MergeConflict(amendment_id);
            payload["error"] = json!({ "code": conflict.code(), "message": conflict.to_string() });
        }
        self.publish(&topics::amendment(amendment_id), payload);
        if let Some(document) = document {
            self.publish(
                &topics::document(document_id),
                json!({
                    "document_id": document_id,
                    "version": document.current_version(),
                    "merged_amendment": amendment_id,
                }),
            );
        }
        Ok(outcome)
    }

    fn decide(&self, amendment: &Amendment, document: &Document, now: DateTime<Utc>) -> ClosureDecision {
        policy::evaluate(&PolicyInput::for_amendment(amendment, document.followers_count(), now))
    }

    pub(crate) async fn open_amendment_ids(&self) -> Result<Vec<AmendmentId>, EngineError> {
        Ok(self.store().find_open_amendments()?.into_iter().map(|a| a.id).collect())
    }

    /// Drops lock entries for amendments that can no longer change.
    pub(crate) async fn release_amendment(&self, amendment_id: AmendmentId) {
        self.inner.amendment_locks.forget(amendment_id).await;
    }

    async fn release_document(&self, document_id: DocumentId) {
        self.inner.document_locks.forget(document_id).await;
    }
}

#[derive(Debug, Default)]
struct RemovalChanges {
    amendments: Vec<Amendment>,
    documents: Vec<Document>,
}

/// Re-runs `attempt` after a revision conflict, backing off between tries.
async fn with_conflict_retry<T>(
    operation: &'static str,
    mut attempt: impl FnMut() -> Result<T, EngineError>,
) -> Result<T, EngineError> {
    let mut attempts = 0;
    loop {
        match attempt() {
            Err(error) if error.is_conflict() && attempts < MAX_CONFLICT_RETRIES => {
                let delay = conflict_backoff(attempts);
                attempts += 1;
                debug!(operation, attempts, %error, "revision conflict, retrying");
                tokio::time::sleep(delay).await;
            }
            result => return result,
        }
    }
}

/// Exponential backoff with jitter so racing writers do not retry in step.
fn conflict_backoff(attempt: u32) -> Duration {
    let base = CONFLICT_BACKOFF_BASE_MICROS.saturating_mul(1u64 << attempt.min(7));
    let jitter = (Uuid::new_v4().as_u128() % u128::from(base)) as u64;
    Duration::from_micros(base + jitter)
}

fn required(field: &str, value: &str) -> Result<String, EngineError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(EngineError::InvalidRequest(format!("{field} must not be empty")));
    }
    Ok(trimmed.to_string())
}

fn tally_payload(amendment: &Amendment) -> Value {
    let status: AmendmentStatus = amendment.status();
    json!({
        "amendment_id": amendment.id,
        "document_id": amendment.document_id,
        "up": amendment.up_votes_count,
        "down": amendment.down_votes_count,
        "status": status.as_str(),
        "version": amendment.version,
    })
}

fn followers_payload(document: &Document) -> Value {
    json!({
        "document_id": document.id,
        "followers_count": document.followers_count(),
    })
}

fn event_payload(event: &Event) -> Value {
    json!({
        "id": event.id,
        "kind": event.kind.as_str(),
        "target_id": event.target_id,
        "created_at": event.created_at,
    })
}
