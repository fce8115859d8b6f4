// emendare-common: shared types and utilities for the Emendare workspace

pub mod diff;
pub mod protocol;
pub mod types;
