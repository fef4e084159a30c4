use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::errors::PipelineError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FileOperation {
    Create,
    Edit,
    Delete,
}

impl FileOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Edit => "edit",
            Self::Delete => "delete",
        }
    }
}

/// One generated or edited source file, addressed relative to the project root.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileChange {
    pub path: String,
    pub content: String,
    pub operation: FileOperation,
}

impl FileChange {
    pub fn create(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
            operation: FileOperation::Create,
        }
    }

    /// Files marked for deletion are never uploaded, archived or published.
    pub fn is_materialized(&self) -> bool {
        self.operation != FileOperation::Delete
    }
}

/// Normalize a project-relative path and reject anything that could escape
/// the project root.
///
/// Backslashes become forward slashes, `.` and empty segments are dropped.
/// Absolute paths, drive-prefixed paths and `..` segments are rejected.
pub fn sanitize_relative_path(path: &str) -> Result<String, PipelineError> {
    let normalized = path.trim().replace('\\', "/");
    if normalized.is_empty() {
        return Err(PipelineError::validation("Invalid file path: empty path"));
    }
    if normalized.starts_with('/') || has_drive_prefix(&normalized) {
        return Err(PipelineError::validation(format!(
            "Invalid file path: {} is absolute",
            path
        )));
    }

    let mut segments = Vec::new();
    for segment in normalized.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                return Err(PipelineError::validation(format!(
                    "Invalid file path: {} escapes the project root",
                    path
                )));
            }
            other => segments.push(other),
        }
    }

    if segments.is_empty() {
        return Err(PipelineError::validation(format!(
            "Invalid file path: {}",
            path
        )));
    }
    Ok(segments.join("/"))
}

fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Layer `updates` over `base`: same-path entries are replaced in place, new
/// paths are appended, and `Delete` updates remove the path.
pub fn merge_file_sets(base: &[FileChange], updates: &[FileChange]) -> Vec<FileChange> {
    let mut merged: Vec<FileChange> = base.to_vec();
    let mut positions: HashMap<String, usize> = merged
        .iter()
        .enumerate()
        .map(|(i, f)| (f.path.clone(), i))
        .collect();

    for update in updates {
        match positions.get(&update.path) {
            Some(&i) => merged[i] = update.clone(),
            None => {
                positions.insert(update.path.clone(), merged.len());
                merged.push(update.clone());
            }
        }
    }

    merged.retain(FileChange::is_materialized);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_keeps_plain_relative_path() {
        assert_eq!(
            sanitize_relative_path("src/app/page.tsx").unwrap(),
            "src/app/page.tsx"
        );
    }

    #[test]
    fn test_sanitize_normalizes_dot_and_backslash_segments() {
        assert_eq!(
            sanitize_relative_path("./src\\lib//utils.ts").unwrap(),
            "src/lib/utils.ts"
        );
    }

    #[test]
    fn test_sanitize_rejects_traversal() {
        assert!(sanitize_relative_path("../etc/passwd").is_err());
        assert!(sanitize_relative_path("src/../../secret").is_err());
        assert!(sanitize_relative_path("src/..").is_err());
    }

    #[test]
    fn test_sanitize_rejects_absolute_paths() {
        assert!(sanitize_relative_path("/etc/passwd").is_err());
        assert!(sanitize_relative_path("C:\\Windows\\system32").is_err());
    }

    #[test]
    fn test_sanitize_rejects_empty_paths() {
        assert!(sanitize_relative_path("").is_err());
        assert!(sanitize_relative_path("   ").is_err());
        assert!(sanitize_relative_path("./").is_err());
    }

    #[test]
    fn test_sanitize_allows_dotted_file_names() {
        assert_eq!(sanitize_relative_path(".env.local").unwrap(), ".env.local");
        assert_eq!(
            sanitize_relative_path("src/..hidden/file.ts").unwrap(),
            "src/..hidden/file.ts"
        );
    }

    #[test]
    fn test_file_change_serializes_lowercase_operation() {
        let file = FileChange::create("a.ts", "x");
        let json = serde_json::to_value(&file).unwrap();
        assert_eq!(json["operation"], "create");
        assert_eq!(json["path"], "a.ts");
    }

    #[test]
    fn test_merge_replaces_and_appends() {
        let base = vec![
            FileChange::create("a.ts", "old a"),
            FileChange::create("b.ts", "b"),
        ];
        let updates = vec![
            FileChange {
                path: "a.ts".into(),
                content: "new a".into(),
                operation: FileOperation::Edit,
            },
            FileChange::create("c.ts", "c"),
        ];

        let merged = merge_file_sets(&base, &updates);
        let paths: Vec<&str> = merged.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["a.ts", "b.ts", "c.ts"]);
        assert_eq!(merged[0].content, "new a");
        assert_eq!(merged[0].operation, FileOperation::Edit);
    }

    #[test]
    fn test_merge_drops_deleted_paths() {
        let base = vec![
            FileChange::create("a.ts", "a"),
            FileChange::create("b.ts", "b"),
        ];
        let updates = vec![FileChange {
            path: "a.ts".into(),
            content: String::new(),
            operation: FileOperation::Delete,
        }];

        let merged = merge_file_sets(&base, &updates);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].path, "b.ts");
    }
}
