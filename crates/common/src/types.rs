// Core domain types shared across all Emendare crates.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::diff::{self, Patch};

pub type DocumentId = Uuid;
pub type AmendmentId = Uuid;
pub type UserId = Uuid;

/// A shared text together with the chain of patches that produced it.
///
/// `patches[v]` turns the body at version `v` into the body at version
/// `v + 1`, so `patches.len()` is the current version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Document {
    pub id: DocumentId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub body: String,
    #[serde(default)]
    pub patches: Vec<Patch>,
    #[serde(default)]
    pub followers: BTreeSet<UserId>,
    pub created_at: DateTime<Utc>,
    /// Optimistic concurrency token; 0 until first stored.
    #[serde(default)]
    pub revision: u64,
}

impl Document {
    /// A new document whose initial body, if any, is recorded as version 1.
    pub fn new(
        title: impl Into<String>,
        description: impl Into<String>,
        body: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let body = body.into();
        let patches = if body.is_empty() { Vec::new() } else { vec![diff::diff("", &body)] };
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            description: description.into(),
            body,
            patches,
            followers: BTreeSet::new(),
            created_at: now,
            revision: 0,
        }
    }

    pub fn current_version(&self) -> usize {
        self.patches.len()
    }

    pub fn followers_count(&self) -> u32 {
        u32::try_from(self.followers.len()).unwrap_or(u32::MAX)
    }

    pub fn is_followed_by(&self, user_id: UserId) -> bool {
        self.followers.contains(&user_id)
    }
}

/// A document without its history, as returned to clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DocumentSummary {
    pub id: DocumentId,
    pub title: String,
    pub description: String,
    pub body: String,
    pub version: usize,
    pub followers_count: u32,
    pub created_at: DateTime<Utc>,
}

impl From<&Document> for DocumentSummary {
    fn from(document: &Document) -> Self {
        Self {
            id: document.id,
            title: document.title.clone(),
            description: document.description.clone(),
            body: document.body.clone(),
            version: document.current_version(),
            followers_count: document.followers_count(),
            created_at: document.created_at,
        }
    }
}

/// Where an amendment's electorate size comes from.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ElectorateMode {
    /// The document's follower count at evaluation time.
    #[default]
    Live,
    /// The follower count recorded when the amendment was proposed.
    Snapshot,
}

/// A proposed change to a document, open for voting until closed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Amendment {
    pub id: AmendmentId,
    pub document_id: DocumentId,
    pub author_id: UserId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Document version the patch was computed against.
    pub base_version: usize,
    pub patch: Patch,
    pub created_at: DateTime<Utc>,
    pub delay_min_sec: u64,
    pub delay_max_sec: u64,
    #[serde(default)]
    pub closed: bool,
    #[serde(default)]
    pub accepted: bool,
    #[serde(default)]
    pub conflicted: bool,
    /// Index of the patch in the document history once merged.
    #[serde(default)]
    pub version: Option<usize>,
    #[serde(default)]
    pub up_votes_count: u32,
    #[serde(default)]
    pub down_votes_count: u32,
    /// Electorate recorded at proposal time, when snapshotting is enabled.
    #[serde(default)]
    pub total_eligible_voters: Option<u32>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub revision: u64,
}

/// Summary status derived from an amendment's closure flags.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AmendmentStatus {
    Open,
    Accepted,
    Rejected,
    Conflicted,
}

impl AmendmentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::Conflicted => "conflicted",
        }
    }
}

impl Amendment {
    pub fn is_open(&self) -> bool {
        !self.closed
    }

    pub fn status(&self) -> AmendmentStatus {
        match (self.closed, self.accepted, self.conflicted) {
            (false, _, _) => AmendmentStatus::Open,
            (true, _, true) => AmendmentStatus::Conflicted,
            (true, true, false) => AmendmentStatus::Accepted,
            (true, false, false) => AmendmentStatus::Rejected,
        }
    }

    /// Time since creation, clamped at zero for clocks that moved backwards.
    pub fn elapsed(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).max(Duration::zero())
    }

    pub fn delay_min(&self) -> Duration {
        seconds(self.delay_min_sec)
    }

    pub fn delay_max(&self) -> Duration {
        seconds(self.delay_max_sec)
    }

    /// Electorate size: the recorded snapshot if any, else the live count.
    pub fn eligible_voters(&self, live_followers: u32) -> u32 {
        self.total_eligible_voters.unwrap_or(live_followers)
    }

    /// When the relative-majority rule will force closure.
    pub fn deadline(&self) -> DateTime<Utc> {
        self.created_at.checked_add_signed(self.delay_max()).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

fn seconds(value: u64) -> Duration {
    i64::try_from(value).ok().and_then(Duration::try_seconds).unwrap_or(Duration::MAX)
}

/// A participant: followed documents and active votes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub followed_documents: BTreeSet<DocumentId>,
    #[serde(default)]
    pub up_votes: BTreeSet<AmendmentId>,
    #[serde(default)]
    pub down_votes: BTreeSet<AmendmentId>,
    #[serde(default)]
    pub revision: u64,
}

impl User {
    pub fn new(name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            created_at: now,
            followed_documents: BTreeSet::new(),
            up_votes: BTreeSet::new(),
            down_votes: BTreeSet::new(),
            revision: 0,
        }
    }

    pub fn follows(&self, document_id: DocumentId) -> bool {
        self.followed_documents.contains(&document_id)
    }

    /// The user's active stance on an amendment, `None` when not voting.
    pub fn stance_on(&self, amendment_id: AmendmentId) -> Option<VoteStance> {
        if self.up_votes.contains(&amendment_id) {
            Some(VoteStance::Up)
        } else if self.down_votes.contains(&amendment_id) {
            Some(VoteStance::Down)
        } else {
            None
        }
    }

    /// Every amendment the user currently holds a vote on.
    pub fn voted_amendments(&self) -> BTreeSet<AmendmentId> {
        self.up_votes.union(&self.down_votes).copied().collect()
    }
}

/// A vote request. `Retract` withdraws whatever vote the user holds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum VoteStance {
    Up,
    Down,
    Retract,
}

impl VoteStance {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
            Self::Retract => "retract",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "up" => Some(Self::Up),
            "down" => Some(Self::Down),
            "retract" | "none" => Some(Self::Retract),
            _ => None,
        }
    }
}

/// Entry in the append-only activity feed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    pub id: Uuid,
    pub kind: EventKind,
    pub target_id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    DocumentCreated,
    AmendmentProposed,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DocumentCreated => "document_created",
            Self::AmendmentProposed => "amendment_proposed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "document_created" => Some(Self::DocumentCreated),
            "amendment_proposed" => Some(Self::AmendmentProposed),
            _ => None,
        }
    }
}

impl Event {
    pub fn new(kind: EventKind, target_id: Uuid, now: DateTime<Utc>) -> Self {
        Self { id: Uuid::new_v4(), kind, target_id, created_at: now }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn amendment(now: DateTime<Utc>) -> Amendment {
        Amendment {
            id: Uuid::new_v4(),
            document_id: Uuid::new_v4(),
            author_id: Uuid::new_v4(),
            name: "tweak".to_string(),
            description: String::new(),
            base_version: 0,
            patch: Patch::default(),
            created_at: now,
            delay_min_sec: 60,
            delay_max_sec: 600,
            closed: false,
            accepted: false,
            conflicted: false,
            version: None,
            up_votes_count: 0,
            down_votes_count: 0,
            total_eligible_voters: None,
            closed_at: None,
            revision: 0,
        }
    }

    #[test]
    fn new_document_records_initial_body_as_first_version() {
        let doc = Document::new("Charter", "", "Article 1.", Utc::now());
        assert_eq!(doc.current_version(), 1);
        assert_eq!(diff::reconstruct_body(&doc.patches, 1).as_deref(), Ok("Article 1."));
    }

    #[test]
    fn new_document_with_empty_body_starts_at_version_zero() {
        let doc = Document::new("Blank", "", "", Utc::now());
        assert_eq!(doc.current_version(), 0);
        assert!(doc.patches.is_empty());
    }

    #[test]
    fn amendment_status_follows_flags() {
        let now = Utc::now();
        let mut a = amendment(now);
        assert_eq!(a.status(), AmendmentStatus::Open);
        a.closed = true;
        assert_eq!(a.status(), AmendmentStatus::Rejected);
        a.accepted = true;
        assert_eq!(a.status(), AmendmentStatus::Accepted);
        a.conflicted = true;
        assert_eq!(a.status(), AmendmentStatus::Conflicted);
    }

    #[test]
    fn elapsed_is_never_negative() {
        let now = Utc::now();
        let a = amendment(now);
        assert_eq!(a.elapsed(now - Duration::seconds(5)), Duration::zero());
        assert_eq!(a.elapsed(now + Duration::seconds(5)), Duration::seconds(5));
    }

    #[test]
    fn eligible_voters_prefers_snapshot() {
        let mut a = amendment(Utc::now());
        assert_eq!(a.eligible_voters(7), 7);
        a.total_eligible_voters = Some(3);
        assert_eq!(a.eligible_voters(7), 3);
    }

    #[test]
    fn stance_on_reads_membership() {
        let mut user = User::new("ada", Utc::now());
        let up = Uuid::new_v4();
        let down = Uuid::new_v4();
        user.up_votes.insert(up);
        user.down_votes.insert(down);
        assert_eq!(user.stance_on(up), Some(VoteStance::Up));
        assert_eq!(user.stance_on(down), Some(VoteStance::Down));
        assert_eq!(user.stance_on(Uuid::new_v4()), None);
        assert_eq!(user.voted_amendments().len(), 2);
    }

    #[test]
    fn vote_stance_parse_round_trips() {
        for stance in [VoteStance::Up, VoteStance::Down, VoteStance::Retract] {
            assert_eq!(VoteStance::parse(stance.as_str()), Some(stance));
        }
        assert_eq!(VoteStance::parse("sideways"), None);
    }

    #[test]
    fn document_serializes_without_revision_field_defaulting() {
        let json = r#"{
            "id": "6f1d1f3a-5c0f-4a55-9d0c-3f8c2f3f6f10",
            "title": "t",
            "body": "",
            "created_at": "2024-01-01T00:00:00Z"
        }"#;
        let doc: Document = serde_json::from_str(json).expect("document should parse");
        assert_eq!(doc.revision, 0);
        assert!(doc.followers.is_empty());
    }
}
