//! Generated project files: the `FileChange` model, the response parser that
//! produces it, the edit-time file targeter, and zip archiving.

pub mod archive;
pub mod model;
pub mod parser;
pub mod targeter;

pub use archive::{archive_file_name, build_archive, extract_archive};
pub use model::{FileChange, FileOperation, merge_file_sets, sanitize_relative_path};
pub use parser::{ParsedResponse, SkipReason, SkippedBlock, parse_response};
pub use targeter::{TargetSelection, needs_file_context, select_files};
