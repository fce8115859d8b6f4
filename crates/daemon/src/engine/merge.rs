// Applies an accepted amendment to its document's current body.
//
// Either the document gains one version and the amendment records it, or
// the document is left untouched and the amendment is marked conflicted.
// Both entities are then committed together by the caller.

use chrono::{DateTime, Utc};
use emendare_common::diff;
use emendare_common::types::{Amendment, Document};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged { version: usize },
    Conflicted { failed_hunks: usize },
}

pub fn merge_amendment(
    document: &mut Document,
    amendment: &mut Amendment,
    now: DateTime<Utc>,
) -> MergeOutcome {
    let application = diff::apply(&amendment.patch, &document.body);

    amendment.closed = true;
    amendment.accepted = true;
    amendment.closed_at = Some(now);

    if !application.success {
        amendment.conflicted = true;
        return MergeOutcome::Conflicted { failed_hunks: application.failed_hunks() };
    }

    let version = document.patches.len();
    document.patches.push(amendment.patch.clone());
    document.body = application.text;
    amendment.version = Some(version);
    MergeOutcome::Merged { version }
}

/// Closes an amendment without touching its document.
pub fn reject_amendment(amendment: &mut Amendment, now: DateTime<Utc>) {
    amendment.closed = true;
    amendment.accepted = false;
    amendment.closed_at = Some(now);
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    fn amendment_against(document: &Document, target: &str) -> Amendment {
        Amendment {
            id: Uuid::new_v4(),
            document_id: document.id,
            author_id: Uuid::new_v4(),
            name: "edit".to_string(),
            description: String::new(),
            base_version: document.current_version(),
            patch: diff::diff(&document.body, target),
            created_at: Utc::now(),
            delay_min_sec: 0,
            delay_max_sec: 0,
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
    fn clean_merge_appends_a_version() {
        let mut document = Document::new("Charter", "", "Members meet monthly.", Utc::now());
        let mut amendment = amendment_against(&document, "Members meet weekly.");

        let outcome = merge_amendment(&mut document, &mut amendment, Utc::now());
        assert_eq!(outcome, MergeOutcome::Merged { version: 1 });
        assert_eq!(document.body, "Members meet weekly.");
        assert_eq!(document.current_version(), 2);
        assert_eq!(amendment.version, Some(1));
        assert!(amendment.closed && amendment.accepted && !amendment.conflicted);
        assert_eq!(
            diff::reconstruct_body(&document.patches, 2).as_deref(),
            Ok("Members meet weekly.")
        );
    }

    #[test]
    fn second_merge_lands_on_top_of_the_first() {
        let mut document =
            Document::new("Charter", "", "Members meet monthly. Dues are ten.", Utc::now());
        let mut first = amendment_against(&document, "Members meet weekly. Dues are ten.");
        let mut second = amendment_against(&document, "Members meet monthly. Dues are five.");

        merge_amendment(&mut document, &mut first, Utc::now());
        let outcome = merge_amendment(&mut document, &mut second, Utc::now());

        assert_eq!(outcome, MergeOutcome::Merged { version: 2 });
        assert_eq!(document.body, "Members meet weekly. Dues are five.");
        assert_eq!(document.current_version(), 3);
    }

    #[test]
    fn conflict_leaves_document_untouched() {
        let mut document = Document::new("Charter", "", "Alpha beta gamma.", Utc::now());
        let mut amendment = amendment_against(&document, "Alpha BETA gamma.");
        document.body = "1234567890".to_string();
        let before = document.clone();

        let outcome = merge_amendment(&mut document, &mut amendment, Utc::now());
        assert!(matches!(outcome, MergeOutcome::Conflicted { .. }));
        assert_eq!(document, before);
        assert!(amendment.closed && amendment.accepted && amendment.conflicted);
        assert_eq!(amendment.version, None);
    }

    #[test]
    fn reject_only_closes() {
        let document = Document::new("Charter", "", "text", Utc::now());
        let mut amendment = amendment_against(&document, "texts");
        reject_amendment(&mut amendment, Utc::now());
        assert!(amendment.closed && !amendment.accepted && !amendment.conflicted);
        assert!(amendment.closed_at.is_some());
    }
}
