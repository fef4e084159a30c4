//! Top-level workflows: prompt to preview, and edits against a live preview.

pub mod build;
pub mod edit;

pub use build::{BuildOrchestrator, BuildOutcome};
pub use edit::{EditOrchestrator, EditOutcome, EditRequest};
