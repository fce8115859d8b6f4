// Context-bearing patches built from a Myers diff.
//
// A patch is an ordered list of hunks. Each hunk carries its edit ops plus a
// few chars of unchanged text on both sides, so it can still be located
// when the text it targets has shifted. Hunk offsets are expressed in the
// text produced by applying every earlier hunk of the same patch; applying
// hunks in order therefore needs no coordinate translation beyond the drift
// caused by relocated or failed hunks.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::myers::{char_edits, coalesce, CharEdit, DiffOp};

/// Chars of unchanged text kept on each side of a change.
pub const PATCH_MARGIN: usize = 4;
/// Upper bound on extra context added while making a hunk unique.
pub const MAX_CONTEXT: usize = 64;
/// Distance from the expected offset searched by fuzzy matching.
pub const MATCH_WINDOW: usize = 64;
/// Largest share of a hunk's source text that may differ in a fuzzy match.
pub const MATCH_THRESHOLD: f64 = 0.5;

/// A serializable diff between two bodies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    pub hunks: Vec<Hunk>,
}

/// One located edit together with its surrounding context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hunk {
    /// Char offset of the hunk's source text.
    pub start: usize,
    pub ops: Vec<DiffOp>,
}

/// How a single hunk fared when applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum HunkOutcome {
    Exact { offset: usize },
    Fuzzy { offset: usize, distance: usize },
    Failed,
}

/// Result of applying a patch. `text` keeps the base text wherever a hunk
/// failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchApplication {
    pub text: String,
    pub success: bool,
    pub hunks: Vec<HunkOutcome>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatchError {
    #[error("version {requested} is out of range (document has {available} versions)")]
    VersionOutOfRange { requested: usize, available: usize },
    #[error("patch {version} does not apply cleanly ({failed_hunks} failed hunks)")]
    ReplayConflict { version: usize, failed_hunks: usize },
}

impl Patch {
    /// True when applying the patch cannot change any text.
    pub fn is_empty(&self) -> bool {
        self.hunks.iter().all(Hunk::is_noop)
    }

    pub fn len(&self) -> usize {
        self.hunks.len()
    }
}

impl Hunk {
    /// The text the hunk expects to find: context plus deleted runs.
    pub fn source_text(&self) -> String {
        self.ops
            .iter()
            .filter_map(|op| match op {
                DiffOp::Equal(text) | DiffOp::Delete(text) => Some(text.as_str()),
                DiffOp::Insert(_) => None,
            })
            .collect()
    }

    /// The text the hunk leaves behind: context plus inserted runs.
    pub fn target_text(&self) -> String {
        self.ops
            .iter()
            .filter_map(|op| match op {
                DiffOp::Equal(text) | DiffOp::Insert(text) => Some(text.as_str()),
                DiffOp::Delete(_) => None,
            })
            .collect()
    }

    pub fn is_noop(&self) -> bool {
        self.ops.iter().all(|op| matches!(op, DiffOp::Equal(_)))
    }

    fn source_len(&self) -> usize {
        self.ops.iter().filter(|op| !matches!(op, DiffOp::Insert(_))).map(DiffOp::char_len).sum()
    }
}

impl PatchApplication {
    pub fn failed_hunks(&self) -> usize {
        self.hunks.iter().filter(|outcome| matches!(outcome, HunkOutcome::Failed)).count()
    }
}

/// Computes a patch that turns `base` into `target`.
pub fn diff(base: &str, target: &str) -> Patch {
    if base == target {
        return Patch::default();
    }

    let base_chars: Vec<char> = base.chars().collect();
    let target_chars: Vec<char> = target.chars().collect();
    let ops = coalesce(&char_edits(&base_chars, &target_chars));
    let hunks = split_hunks(&ops);
    Patch { hunks: add_unique_context(&base_chars, hunks) }
}

/// Applies `patch` to `base`, hunk by hunk.
///
/// Hunk offsets come from untrusted patches, so offset arithmetic is done
/// in `i128`, which holds any `usize` difference.
pub fn apply(patch: &Patch, base: &str) -> PatchApplication {
    let mut text: Vec<char> = base.chars().collect();
    let mut drift: i128 = 0;
    let mut outcomes = Vec::with_capacity(patch.hunks.len());

    for hunk in &patch.hunks {
        let source: Vec<char> = hunk.source_text().chars().collect();
        let target: Vec<char> = hunk.target_text().chars().collect();
        let hunk_start = hunk.start as i128;
        let expected = (hunk_start + drift).clamp(0, text.len() as i128) as usize;

        match locate(&text, &source, expected) {
            Some(Located::Exact { start }) => {
                text.splice(start..start + source.len(), target.iter().copied());
                drift = start as i128 - hunk_start;
                outcomes.push(HunkOutcome::Exact { offset: start });
            }
            Some(Located::Fuzzy { start, end, alignment, distance }) => {
                let replacement = rewrite_region(&text[start..end], hunk, &alignment);
                let replacement_len = replacement.len();
                text.splice(start..end, replacement);
                drift = (start + replacement_len) as i128 - (hunk_start + target.len() as i128);
                outcomes.push(HunkOutcome::Fuzzy { offset: start, distance });
            }
            None => {
                drift -= target.len() as i128 - source.len() as i128;
                outcomes.push(HunkOutcome::Failed);
            }
        }
    }

    let success = !outcomes.iter().any(|outcome| matches!(outcome, HunkOutcome::Failed));
    PatchApplication { text: text.into_iter().collect(), success, hunks: outcomes }
}

/// Replays `patches[0..version)` from the empty body.
pub fn reconstruct_body(patches: &[Patch], version: usize) -> Result<String, PatchError> {
    if version > patches.len() {
        return Err(PatchError::VersionOutOfRange { requested: version, available: patches.len() });
    }

    let mut body = String::new();
    for (index, patch) in patches[..version].iter().enumerate() {
        let applied = apply(patch, &body);
        if !applied.success {
            return Err(PatchError::ReplayConflict {
                version: index,
                failed_hunks: applied.failed_hunks(),
            });
        }
        body = applied.text;
    }
    Ok(body)
}

// ── Hunk construction ─────────────────────────────────────────────

fn split_hunks(ops: &[DiffOp]) -> Vec<Hunk> {
    let mut hunks = Vec::new();
    let mut current: Option<Hunk> = None;
    let mut base_pos = 0usize;
    let mut prev_end = 0usize;

    for (index, op) in ops.iter().enumerate() {
        let len = op.char_len();
        match op {
            DiffOp::Equal(text) => {
                if let Some(mut hunk) = current.take() {
                    let has_more = index + 1 < ops.len();
                    if has_more && len <= 2 * PATCH_MARGIN {
                        hunk.ops.push(op.clone());
                        current = Some(hunk);
                    } else {
                        hunk.ops.push(DiffOp::Equal(text.chars().take(PATCH_MARGIN).collect()));
                        prev_end = hunk.start + hunk.source_len();
                        hunks.push(hunk);
                    }
                }
                base_pos += len;
            }
            DiffOp::Delete(_) | DiffOp::Insert(_) => {
                let hunk = current.get_or_insert_with(|| {
                    let start = base_pos.saturating_sub(PATCH_MARGIN).max(prev_end);
                    let mut hunk_ops = Vec::new();
                    if let Some(DiffOp::Equal(prev)) = index.checked_sub(1).map(|i| &ops[i]) {
                        let wanted = base_pos - start;
                        let skip = prev.chars().count().saturating_sub(wanted);
                        if wanted > 0 {
                            hunk_ops.push(DiffOp::Equal(prev.chars().skip(skip).collect()));
                        }
                    }
                    Hunk { start, ops: hunk_ops }
                });
                hunk.ops.push(op.clone());
                if matches!(op, DiffOp::Delete(_)) {
                    base_pos += len;
                }
            }
        }
    }

    if let Some(hunk) = current {
        hunks.push(hunk);
    }
    hunks
}

/// Moves hunk offsets into rolling coordinates and widens each hunk's
/// context until its source text occurs once in the text it will meet.
fn add_unique_context(base: &[char], hunks: Vec<Hunk>) -> Vec<Hunk> {
    let mut rolling = base.to_vec();
    let mut shift: isize = 0;
    let mut placed = Vec::with_capacity(hunks.len());

    for mut hunk in hunks {
        hunk.start = (hunk.start as isize + shift) as usize;
        widen_until_unique(&rolling, &mut hunk);

        let source_len = hunk.source_len();
        let target: Vec<char> = hunk.target_text().chars().collect();
        shift += target.len() as isize - source_len as isize;
        rolling.splice(hunk.start..hunk.start + source_len, target);
        placed.push(hunk);
    }
    placed
}

fn widen_until_unique(text: &[char], hunk: &mut Hunk) {
    let mut source: Vec<char> = hunk.source_text().chars().collect();
    let mut added = 0usize;

    while !source.is_empty() && added < MAX_CONTEXT && count_occurrences(text, &source, 2) > 1 {
        let end = hunk.start + source.len();
        let before = PATCH_MARGIN.min(hunk.start);
        let after = PATCH_MARGIN.min(text.len().saturating_sub(end));
        if before == 0 && after == 0 {
            break;
        }

        let prefix: String = text[hunk.start - before..hunk.start].iter().collect();
        let suffix: String = text[end..end + after].iter().collect();
        prepend_context(&mut hunk.ops, prefix);
        append_context(&mut hunk.ops, suffix);
        hunk.start -= before;
        source = hunk.source_text().chars().collect();
        added += PATCH_MARGIN;
    }
}

fn prepend_context(ops: &mut Vec<DiffOp>, prefix: String) {
    if prefix.is_empty() {
        return;
    }
    match ops.first_mut() {
        Some(DiffOp::Equal(text)) => text.insert_str(0, &prefix),
        _ => ops.insert(0, DiffOp::Equal(prefix)),
    }
}

fn append_context(ops: &mut Vec<DiffOp>, suffix: String) {
    if suffix.is_empty() {
        return;
    }
    match ops.last_mut() {
        Some(DiffOp::Equal(text)) => text.push_str(&suffix),
        _ => ops.push(DiffOp::Equal(suffix)),
    }
}

fn count_occurrences(text: &[char], pattern: &[char], limit: usize) -> usize {
    if pattern.len() > text.len() {
        return 0;
    }
    text.windows(pattern.len()).filter(|window| *window == pattern).take(limit).count()
}

// ── Hunk location ─────────────────────────────────────────────────

enum Located {
    Exact { start: usize },
    Fuzzy { start: usize, end: usize, alignment: Vec<CharEdit>, distance: usize },
}

fn locate(text: &[char], source: &[char], expected: usize) -> Option<Located> {
    if source.is_empty() {
        return Some(Located::Exact { start: expected });
    }
    if let Some(start) = nearest_exact(text, source, expected) {
        return Some(Located::Exact { start });
    }
    fuzzy_match(text, source, expected)
}

fn nearest_exact(text: &[char], source: &[char], expected: usize) -> Option<usize> {
    if source.len() > text.len() {
        return None;
    }
    text.windows(source.len())
        .enumerate()
        .filter(|(_, window)| *window == source)
        .map(|(start, _)| start)
        .min_by_key(|start| start.abs_diff(expected))
}

/// Aligns `source` against a window of `text` around `expected`. Inserted
/// chars before the first and after the last matching char fall outside
/// the matched region; everything else counts towards the distance.
fn fuzzy_match(text: &[char], source: &[char], expected: usize) -> Option<Located> {
    let window_start = expected.saturating_sub(MATCH_WINDOW);
    let window_end = (expected + source.len() + MATCH_WINDOW).min(text.len());
    if window_start >= window_end {
        return None;
    }

    let edits = char_edits(source, &text[window_start..window_end]);
    let is_equal = |edit: &CharEdit| matches!(edit, CharEdit::Equal(_));
    let first_equal = edits.iter().position(is_equal)?;
    let last_equal = edits.iter().rposition(is_equal)?;

    let outside = |index: usize| index < first_equal || index > last_equal;
    let mut lead_inserts = 0usize;
    let mut trail_inserts = 0usize;
    let mut alignment = Vec::with_capacity(edits.len());
    for (index, edit) in edits.iter().enumerate() {
        if matches!(edit, CharEdit::Insert(_)) && outside(index) {
            if index < first_equal {
                lead_inserts += 1;
            } else {
                trail_inserts += 1;
            }
            continue;
        }
        alignment.push(*edit);
    }

    let distance = alignment.iter().filter(|edit| !is_equal(edit)).count();
    if distance as f64 > source.len() as f64 * MATCH_THRESHOLD {
        return None;
    }

    Some(Located::Fuzzy {
        start: window_start + lead_inserts,
        end: window_end - trail_inserts,
        alignment,
        distance,
    })
}

/// Replays the hunk's ops on a fuzzily matched region by mapping every
/// source offset through the alignment.
fn rewrite_region(region: &[char], hunk: &Hunk, alignment: &[CharEdit]) -> Vec<char> {
    let source_len = hunk.source_len();
    let mut index_map = vec![0usize; source_len + 1];
    let mut source_pos = 0usize;
    let mut region_pos = 0usize;
    for edit in alignment {
        match edit {
            CharEdit::Equal(_) => {
                index_map[source_pos] = region_pos;
                source_pos += 1;
                region_pos += 1;
            }
            CharEdit::Delete(_) => {
                index_map[source_pos] = region_pos;
                source_pos += 1;
            }
            CharEdit::Insert(_) => region_pos += 1,
        }
    }
    index_map[source_len] = region_pos;

    let mut splices: Vec<(usize, usize, &str)> = Vec::new();
    let mut pos = 0usize;
    for op in &hunk.ops {
        let len = op.char_len();
        match op {
            DiffOp::Equal(_) => pos += len,
            DiffOp::Delete(_) => {
                splices.push((index_map[pos], index_map[pos + len], ""));
                pos += len;
            }
            DiffOp::Insert(text) => splices.push((index_map[pos], index_map[pos], text)),
        }
    }

    let mut rewritten = region.to_vec();
    for (from, to, text) in splices.into_iter().rev() {
        rewritten.splice(from..to, text.chars());
    }
    rewritten
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn identical_bodies_produce_empty_patch() {
        let patch = diff("same text", "same text");
        assert!(patch.is_empty());
        assert_eq!(apply(&patch, "same text").text, "same text");
    }

    #[test]
    fn hunks_carry_margin_context() {
        let patch = diff("The quick brown fox", "The quick red fox");
        assert_eq!(patch.hunks.len(), 1);
        let hunk = &patch.hunks[0];
        assert_eq!(hunk.source_text(), "ick brown fox");
        assert_eq!(hunk.target_text(), "ick red fox");
        assert_eq!(hunk.start, 6);
    }

    #[test]
    fn distant_changes_split_into_separate_hunks() {
        let base = "alpha beta gamma delta epsilon zeta eta theta";
        let target = "ALPHA beta gamma delta epsilon zeta eta THETA";
        let patch = diff(base, target);
        assert_eq!(patch.hunks.len(), 2);
        let applied = apply(&patch, base);
        assert!(applied.success);
        assert_eq!(applied.text, target);
    }

    #[test]
    fn context_grows_until_unique() {
        let base = "abcabcabcabcabcabc";
        let target = "abcabcabc!abcabcabc";
        let patch = diff(base, target);
        assert_eq!(patch.hunks.len(), 1);

        let source = patch.hunks[0].source_text();
        assert!(source.chars().count() > 2 * PATCH_MARGIN);
        assert_eq!(base.matches(source.as_str()).count(), 1);
        assert_eq!(apply(&patch, base).text, target);
    }

    #[test]
    fn initial_body_patch_rebuilds_from_empty() {
        let patch = diff("", "first draft");
        let applied = apply(&patch, "");
        assert!(applied.success);
        assert_eq!(applied.text, "first draft");
        assert_eq!(applied.hunks, vec![HunkOutcome::Exact { offset: 0 }]);
    }

    #[test]
    fn relocates_hunk_when_text_shifted() {
        let base = "Article 1. Members meet monthly.";
        let target = "Article 1. Members meet weekly.";
        let patch = diff(base, target);

        let shifted = "Preamble added later. Article 1. Members meet monthly.";
        let applied = apply(&patch, shifted);
        assert!(applied.success);
        assert_eq!(applied.text, "Preamble added later. Article 1. Members meet weekly.");
        assert!(matches!(applied.hunks[0], HunkOutcome::Exact { .. }));
    }

    #[test]
    fn fuzzy_match_applies_when_context_drifted() {
        let patch = diff("0123456789", "01234X6789");
        assert_eq!(patch.hunks[0].source_text(), "123456789");

        let applied = apply(&patch, "0123Z56789");
        assert!(applied.success);
        assert_eq!(applied.text, "0123ZX6789");
        assert_eq!(applied.hunks, vec![HunkOutcome::Fuzzy { offset: 1, distance: 2 }]);
    }

    #[test]
    fn unlocatable_hunk_fails_and_leaves_text() {
        let patch = diff("hello world", "hello there world");
        let unrelated = "completely unrelated content";
        let applied = apply(&patch, unrelated);
        assert!(!applied.success);
        assert_eq!(applied.failed_hunks(), 1);
        assert_eq!(applied.text, unrelated);
    }

    #[test]
    fn out_of_range_hunk_offsets_are_clamped() {
        let wild = Patch {
            hunks: vec![
                Hunk {
                    start: usize::MAX,
                    ops: vec![DiffOp::Equal("zzz".into()), DiffOp::Insert("!".into())],
                },
                Hunk {
                    start: 1 << 63,
                    ops: vec![DiffOp::Equal("abc".into()), DiffOp::Insert("x".into())],
                },
            ],
        };
        let applied = apply(&wild, "abc");
        assert!(!applied.success);
        assert_eq!(applied.text, "abcx");
        assert_eq!(applied.hunks, vec![HunkOutcome::Failed, HunkOutcome::Exact { offset: 0 }]);
    }

    #[test]
    fn reconstruct_body_replays_history() {
        let v1 = "Rule one.";
        let v2 = "Rule one. Rule two.";
        let v3 = "Rule one, amended. Rule two.";
        let patches = vec![diff("", v1), diff(v1, v2), diff(v2, v3)];

        assert_eq!(reconstruct_body(&patches, 0).as_deref(), Ok(""));
        assert_eq!(reconstruct_body(&patches, 1).as_deref(), Ok(v1));
        assert_eq!(reconstruct_body(&patches, 2).as_deref(), Ok(v2));
        assert_eq!(reconstruct_body(&patches, 3).as_deref(), Ok(v3));
    }

    #[test]
    fn reconstruct_body_rejects_future_versions() {
        let patches = vec![diff("", "x")];
        assert_eq!(
            reconstruct_body(&patches, 2),
            Err(PatchError::VersionOutOfRange { requested: 2, available: 1 })
        );
    }

    #[test]
    fn reconstruct_body_reports_broken_history() {
        let patches = vec![diff("", "abc"), diff("zzzzzzzz", "zzzzyzzzz")];
        assert!(matches!(
            reconstruct_body(&patches, 2),
            Err(PatchError::ReplayConflict { version: 1, .. })
        ));
    }

    #[test]
    fn patch_serializes_as_json() {
        let patch = diff("a b c", "a B c");
        let json = serde_json::to_string(&patch).expect("serialize");
        let parsed: Patch = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed, patch);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn apply_of_diff_yields_target(base in "[a-d ]{0,40}", target in "[a-d ]{0,40}") {
            let patch = diff(&base, &target);
            let applied = apply(&patch, &base);
            prop_assert!(applied.success);
            prop_assert_eq!(applied.text, target);
        }

        #[test]
        fn diff_is_deterministic(base in "[a-z ]{0,30}", target in "[a-z ]{0,30}") {
            prop_assert_eq!(diff(&base, &target), diff(&base, &target));
        }
    }
}
