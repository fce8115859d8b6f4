// Character-level diffing and the patch format stored in document histories.

mod myers;
pub mod patch;

pub use myers::{diff_ops, DiffOp};
pub use patch::{
    apply, diff, reconstruct_body, Hunk, HunkOutcome, Patch, PatchApplication, PatchError,
};
