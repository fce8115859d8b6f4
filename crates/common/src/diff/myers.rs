use serde::{Deserialize, Serialize};

/// One run of a character diff between a base and a target text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", content = "text", rename_all = "snake_case")]
pub enum DiffOp {
    Equal(String),
    Delete(String),
    Insert(String),
}

impl DiffOp {
    pub fn text(&self) -> &str {
        match self {
            Self::Equal(text) | Self::Delete(text) | Self::Insert(text) => text,
        }
    }

    /// Length in chars, which is the unit every patch offset is expressed in.
    pub fn char_len(&self) -> usize {
        self.text().chars().count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CharEdit {
    Equal(char),
    Insert(char),
    Delete(char),
}

/// Computes the coalesced diff from `base` to `target`.
///
/// Within each changed region the deleted run is emitted before the inserted
/// run, so consecutive ops never alternate between the two kinds.
pub fn diff_ops(base: &str, target: &str) -> Vec<DiffOp> {
    if base == target {
        return if base.is_empty() { Vec::new() } else { vec![DiffOp::Equal(base.to_owned())] };
    }

    let base_chars: Vec<char> = base.chars().collect();
    let target_chars: Vec<char> = target.chars().collect();
    coalesce(&char_edits(&base_chars, &target_chars))
}

pub(crate) fn char_edits(old_chars: &[char], new_chars: &[char]) -> Vec<CharEdit> {
    let prefix = old_chars.iter().zip(new_chars).take_while(|(a, b)| a == b).count();
    let old_rest = &old_chars[prefix..];
    let new_rest = &new_chars[prefix..];
    let suffix =
        old_rest.iter().rev().zip(new_rest.iter().rev()).take_while(|(a, b)| a == b).count();
    let old_mid = &old_rest[..old_rest.len() - suffix];
    let new_mid = &new_rest[..new_rest.len() - suffix];

    let mut edits = Vec::with_capacity(old_chars.len().max(new_chars.len()));
    edits.extend(old_chars[..prefix].iter().copied().map(CharEdit::Equal));
    edits.extend(myers_char_edits(old_mid, new_mid));
    edits.extend(old_rest[old_mid.len()..].iter().copied().map(CharEdit::Equal));
    edits
}

pub(crate) fn coalesce(edits: &[CharEdit]) -> Vec<DiffOp> {
    let mut ops = Vec::new();
    let mut equal = String::new();
    let mut deleted = String::new();
    let mut inserted = String::new();

    for edit in edits {
        match edit {
            CharEdit::Equal(ch) => {
                flush_change(&mut ops, &mut deleted, &mut inserted);
                equal.push(*ch);
            }
            CharEdit::Delete(ch) => {
                flush_equal(&mut ops, &mut equal);
                deleted.push(*ch);
            }
            CharEdit::Insert(ch) => {
                flush_equal(&mut ops, &mut equal);
                inserted.push(*ch);
            }
        }
    }
    flush_change(&mut ops, &mut deleted, &mut inserted);
    flush_equal(&mut ops, &mut equal);
    ops
}

fn flush_equal(ops: &mut Vec<DiffOp>, equal: &mut String) {
    if !equal.is_empty() {
        ops.push(DiffOp::Equal(std::mem::take(equal)));
    }
}

fn flush_change(ops: &mut Vec<DiffOp>, deleted: &mut String, inserted: &mut String) {
    if !deleted.is_empty() {
        ops.push(DiffOp::Delete(std::mem::take(deleted)));
    }
    if !inserted.is_empty() {
        ops.push(DiffOp::Insert(std::mem::take(inserted)));
    }
}

/// Largest edit distance traced by Myers. The trace keeps every round's
/// diagonals, so memory grows with the square of this bound.
pub const MAX_EDIT_DISTANCE: usize = 1_024;

fn myers_char_edits(old_chars: &[char], new_chars: &[char]) -> Vec<CharEdit> {
    let old_len = old_chars.len();
    let new_len = new_chars.len();

    if old_len == 0 {
        return new_chars.iter().copied().map(CharEdit::Insert).collect();
    }
    if new_len == 0 {
        return old_chars.iter().copied().map(CharEdit::Delete).collect();
    }

    let max = old_len + new_len;
    let offset = max as isize;
    let mut v = vec![0isize; 2 * max + 1];
    // trace[d] holds diagonals -d..=d as they stood before round d.
    let mut trace: Vec<Vec<isize>> = Vec::new();
    let mut solved_d = None;

    'outer: for d in 0..=max.min(MAX_EDIT_DISTANCE) {
        let d_isize = d as isize;
        trace.push(v[(offset - d_isize) as usize..=(offset + d_isize) as usize].to_vec());

        let mut k = -d_isize;
        while k <= d_isize {
            let k_idx = (k + offset) as usize;
            let mut x = if k == -d_isize
                || (k != d_isize && v[(k - 1 + offset) as usize] < v[(k + 1 + offset) as usize])
            {
                v[(k + 1 + offset) as usize]
            } else {
                v[(k - 1 + offset) as usize] + 1
            };
            let mut y = x - k;

            while x < old_len as isize
                && y < new_len as isize
                && old_chars[x as usize] == new_chars[y as usize]
            {
                x += 1;
                y += 1;
            }

            v[k_idx] = x;

            if x >= old_len as isize && y >= new_len as isize {
                solved_d = Some(d);
                break 'outer;
            }

            k += 2;
        }
    }

    match solved_d {
        Some(solved_d) => backtrack_char_edits(old_chars, new_chars, &trace, solved_d),
        // Too far apart: replace the whole region.
        None => old_chars
            .iter()
            .copied()
            .map(CharEdit::Delete)
            .chain(new_chars.iter().copied().map(CharEdit::Insert))
            .collect(),
    }
}

fn backtrack_char_edits(
    old_chars: &[char],
    new_chars: &[char],
    trace: &[Vec<isize>],
    solved_d: usize,
) -> Vec<CharEdit> {
    let mut edits = Vec::new();
    let mut x = old_chars.len() as isize;
    let mut y = new_chars.len() as isize;

    for d in (0..=solved_d).rev() {
        let d_isize = d as isize;
        let diagonals = &trace[d];
        let at = |k: isize| diagonals[(k + d_isize) as usize];
        let k = x - y;

        let prev_k = if d == 0 {
            0
        } else if k == -d_isize || (k != d_isize && at(k - 1) < at(k + 1)) {
            k + 1
        } else {
            k - 1
        };
        let prev_x = if d == 0 { 0 } else { at(prev_k) };
        let prev_y = prev_x - prev_k;

        while x > prev_x && y > prev_y {
            edits.push(CharEdit::Equal(old_chars[(x - 1) as usize]));
            x -= 1;
            y -= 1;
        }

        if d == 0 {
            break;
        }

        if x == prev_x {
            edits.push(CharEdit::Insert(new_chars[(y - 1) as usize]));
            y -= 1;
        } else {
            edits.push(CharEdit::Delete(old_chars[(x - 1) as usize]));
            x -= 1;
        }
    }

    edits.reverse();
    edits
}

#[cfg(test)]
mod tests {
    use super::{diff_ops, DiffOp, MAX_EDIT_DISTANCE};

    fn replay(ops: &[DiffOp]) -> (String, String) {
        let mut base = String::new();
        let mut target = String::new();
        for op in ops {
            match op {
                DiffOp::Equal(text) => {
                    base.push_str(text);
                    target.push_str(text);
                }
                DiffOp::Delete(text) => base.push_str(text),
                DiffOp::Insert(text) => target.push_str(text),
            }
        }
        (base, target)
    }

    #[test]
    fn computes_expected_simple_insert_and_delete_ops() {
        assert_eq!(
            diff_ops("abc", "abXYZc"),
            vec![
                DiffOp::Equal("ab".to_owned()),
                DiffOp::Insert("XYZ".to_owned()),
                DiffOp::Equal("c".to_owned()),
            ]
        );
        assert_eq!(
            diff_ops("abXYZc", "abc"),
            vec![
                DiffOp::Equal("ab".to_owned()),
                DiffOp::Delete("XYZ".to_owned()),
                DiffOp::Equal("c".to_owned()),
            ]
        );
    }

    #[test]
    fn identical_and_empty_inputs() {
        assert!(diff_ops("", "").is_empty());
        assert_eq!(diff_ops("same", "same"), vec![DiffOp::Equal("same".to_owned())]);
        assert_eq!(diff_ops("", "new"), vec![DiffOp::Insert("new".to_owned())]);
        assert_eq!(diff_ops("old", ""), vec![DiffOp::Delete("old".to_owned())]);
    }

    #[test]
    fn replacement_emits_delete_before_insert() {
        assert_eq!(
            diff_ops("cat", "dog"),
            vec![DiffOp::Delete("cat".to_owned()), DiffOp::Insert("dog".to_owned())]
        );
    }

    #[test]
    fn ops_replay_to_both_sides_for_various_scenarios() {
        let scenarios = [
            ("hello world", "hello brave new world"),
            ("alpha\nbeta\ngamma\n", "alpha!\nbeta\ndelta\ngamma\nomega\n"),
            ("naïve café", "naive cafe ☕"),
            ("🙂 hello", "🙂 hi"),
            ("abcabba", "cbabac"),
        ];

        for (base, target) in scenarios {
            let ops = diff_ops(base, target);
            assert_eq!(replay(&ops), (base.to_owned(), target.to_owned()), "scenario {base:?}");
        }
    }

    #[test]
    fn distant_texts_fall_back_to_a_full_replacement() {
        let base = "a".repeat(3 * MAX_EDIT_DISTANCE);
        let target = format!("x{}x", "b".repeat(3 * MAX_EDIT_DISTANCE));
        let ops = diff_ops(&base, &target);
        assert_eq!(ops, vec![DiffOp::Delete(base.clone()), DiffOp::Insert(target.clone())]);
        assert_eq!(replay(&ops), (base.clone(), target));

        let near = format!("{}!", "a".repeat(3 * MAX_EDIT_DISTANCE));
        assert_eq!(diff_ops(&base, &near).len(), 2);
    }

    #[test]
    fn char_len_counts_scalar_values() {
        assert_eq!(DiffOp::Insert("☕🙂".to_owned()).char_len(), 2);
    }

    #[test]
    fn serializes_with_op_tag() {
        let json = serde_json::to_value(DiffOp::Insert("x".to_owned())).expect("serialize");
        assert_eq!(json, serde_json::json!({ "op": "insert", "text": "x" }));
    }
}
