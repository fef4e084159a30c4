//! Parser for the generation protocol.
//!
//! The generation service is asked to answer in three parts:
//!
//! ~~~text
//! <explanation>
//! What changed and why
//! </explanation>
//!
//! <files>
//! FILE: src/app/page.tsx
//! ```tsx
//! export default function Page() { ... }
//! ```
//!
//! FILE: src/app/globals.css
//! ```css
//! body { margin: 0; }
//! ```
//! </files>
//! ~~~
//!
//! Parsing is best-effort per block: a block without a path, without a
//! fence, with an unterminated fence or with a path that escapes the project
//! root is reported in [`ParsedResponse::skipped`] and the remaining blocks
//! are still returned. A response without a `<files>` region yields no files.

use super::model::{FileChange, sanitize_relative_path};

const FILES_OPEN: &str = "<files>";
const FILES_CLOSE: &str = "</files>";
const FILE_MARKER: &str = "FILE:";
const FENCE: &str = "```";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedResponse {
    pub explanation: Option<String>,
    pub thinking: Option<String>,
    pub files: Vec<FileChange>,
    pub skipped: Vec<SkippedBlock>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    MissingPath,
    MissingFence,
    UnclosedFence,
    UnsafePath,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedBlock {
    pub path: Option<String>,
    pub reason: SkipReason,
}

/// Parse a raw generation response into its explanation and file set.
pub fn parse_response(text: &str) -> ParsedResponse {
    let mut parsed = ParsedResponse {
        explanation: extract_section(text, "explanation"),
        thinking: extract_section(text, "thinking"),
        ..Default::default()
    };

    if let Some(region) = files_region(text) {
        let (files, skipped) = parse_file_blocks(region);
        for block in &skipped {
            tracing::warn!(path = ?block.path, reason = ?block.reason, "Skipping malformed file block");
        }
        parsed.files = files;
        parsed.skipped = skipped;
    }

    parsed
}

/// Text between the first `<tag>` and the next `</tag>`, trimmed.
fn extract_section(text: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = text.find(&open)? + open.len();
    let end = text[start..].find(&close)? + start;
    let section = text[start..end].trim();
    (!section.is_empty()).then(|| section.to_string())
}

/// The outermost files region: first opening tag up to the last closing tag.
/// An unterminated region runs to the end of the text.
fn files_region(text: &str) -> Option<&str> {
    let start = text.find(FILES_OPEN)? + FILES_OPEN.len();
    let rest = &text[start..];
    match rest.rfind(FILES_CLOSE) {
        Some(end) => Some(&rest[..end]),
        None => Some(rest),
    }
}

enum BlockState {
    Seeking,
    Header { path: String },
    InFence { path: String, lines: Vec<String> },
}

struct BlockCollector {
    files: Vec<FileChange>,
    skipped: Vec<SkippedBlock>,
}

impl BlockCollector {
    fn skip(&mut self, path: Option<String>, reason: SkipReason) {
        self.skipped.push(SkippedBlock { path, reason });
    }

    fn finish_block(&mut self, path: String, lines: Vec<String>) {
        match sanitize_relative_path(&path) {
            Ok(clean) => {
                let content = lines.join("\n").trim().to_string();
                // A repeated path keeps its first position and its last content.
                match self.files.iter_mut().find(|f| f.path == clean) {
                    Some(existing) => existing.content = content,
                    None => self.files.push(FileChange::create(clean, content)),
                }
            }
            Err(_) => self.skip(Some(path), SkipReason::UnsafePath),
        }
    }

    /// Close whatever block is open before a new header or the end of input.
    fn abandon(&mut self, state: BlockState) {
        match state {
            BlockState::Seeking => {}
            BlockState::Header { path } => self.skip(Some(path), SkipReason::MissingFence),
            BlockState::InFence { path, .. } => self.skip(Some(path), SkipReason::UnclosedFence),
        }
    }
}

fn parse_file_blocks(region: &str) -> (Vec<FileChange>, Vec<SkippedBlock>) {
    let mut collector = BlockCollector {
        files: Vec::new(),
        skipped: Vec::new(),
    };
    let mut state = BlockState::Seeking;

    for line in region.lines() {
        state = match state {
            BlockState::InFence { path, mut lines } => {
                if is_closing_fence(line) {
                    collector.finish_block(path, lines);
                    BlockState::Seeking
                } else if let Some(header) = line.strip_prefix(FILE_MARKER) {
                    collector.abandon(BlockState::InFence { path, lines });
                    open_block(&mut collector, header)
                } else {
                    lines.push(line.to_string());
                    BlockState::InFence { path, lines }
                }
            }
            BlockState::Seeking => match header_of(line) {
                Some(header) => open_block(&mut collector, header),
                None => BlockState::Seeking,
            },
            BlockState::Header { path } => match header_of(line) {
                Some(header) => {
                    collector.abandon(BlockState::Header { path });
                    open_block(&mut collector, header)
                }
                None if line.trim_start().starts_with(FENCE) => BlockState::InFence {
                    path,
                    lines: Vec::new(),
                },
                None => BlockState::Header { path },
            },
        };
    }

    collector.abandon(state);
    (collector.files, collector.skipped)
}

fn header_of(line: &str) -> Option<&str> {
    line.trim_start().strip_prefix(FILE_MARKER)
}

fn open_block(collector: &mut BlockCollector, header: &str) -> BlockState {
    let path = clean_header_path(header);
    if path.is_empty() {
        collector.skip(None, SkipReason::MissingPath);
        BlockState::Seeking
    } else {
        BlockState::Header { path }
    }
}

/// Header paths are sometimes decorated with backticks or markdown bold.
fn clean_header_path(header: &str) -> String {
    header
        .trim()
        .trim_matches(|c| c == '`' || c == '*' || c == '"' || c == '\'')
        .trim()
        .to_string()
}

fn is_closing_fence(line: &str) -> bool {
    line.trim() == FENCE
}
