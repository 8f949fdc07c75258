//! Rendering and scanning of the human-readable ledger format.
//!
//! Each committed iteration is one Markdown block:
//!
//! ```text
//! ## Iteration 3
//! - timestamp: 2026-01-01T00:00:00+00:00
//! - source: evolve
//! - desires_changed: false
//! - files_changed: ["x/y.txt"]
//! - summary: desires unchanged; wrote 1 file
//! ```
//!
//! followed by a blank line.

use crate::core::types::{AppliedFile, LedgerEntry};

const HEADER_PREFIX: &str = "## Iteration ";

/// Render one ledger block, including its trailing blank line.
///
/// Free-text fields are flattened to a single line and file paths are JSON
/// encoded, so model-controlled text cannot forge extra blocks.
pub fn render_block(entry: &LedgerEntry) -> String {
    let files = serde_json::to_string(&entry.files_changed).unwrap_or_else(|_| "[]".to_string());
    format!(
        "{HEADER_PREFIX}{}\n- timestamp: {}\n- source: {}\n- desires_changed: {}\n- files_changed: {}\n- summary: {}\n\n",
        entry.iteration,
        single_line(&entry.timestamp),
        single_line(&entry.source),
        entry.desires_changed,
        files,
        single_line(&entry.summary),
    )
}

/// One-line summary of an iteration's effect.
pub fn summarize(desires_changed: bool, files: &[AppliedFile]) -> String {
    let desires = if desires_changed {
        "desires updated"
    } else {
        "desires unchanged"
    };
    match files.len() {
        0 => format!("{desires}; no files written"),
        1 => format!("{desires}; wrote 1 file"),
        n => format!("{desires}; wrote {n} files"),
    }
}

/// Number of blocks in a ledger's text.
pub fn count_entries(ledger: &str) -> usize {
    ledger
        .lines()
        .filter(|line| line.starts_with(HEADER_PREFIX))
        .count()
}

/// The last `limit` blocks of a ledger's text, oldest first.
pub fn tail_entries(ledger: &str, limit: usize) -> String {
    if limit == 0 {
        return String::new();
    }
    let starts: Vec<usize> = line_offsets(ledger)
        .filter(|(_, line)| line.starts_with(HEADER_PREFIX))
        .map(|(offset, _)| offset)
        .collect();
    let Some(&start) = starts.iter().rev().take(limit).last() else {
        return String::new();
    };
    ledger[start..].trim_end().to_string()
}

fn line_offsets(text: &str) -> impl Iterator<Item = (usize, &str)> {
    let mut offset = 0;
    text.split_inclusive('\n').map(move |line| {
        let start = offset;
        offset += line.len();
        (start, line)
    })
}

fn single_line(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(iteration: u32, files: &[&str]) -> LedgerEntry {
        LedgerEntry {
            iteration,
            timestamp: "2026-01-01T00:00:00+00:00".to_string(),
            source: "test".to_string(),
            desires_changed: false,
            files_changed: files.iter().map(|f| f.to_string()).collect(),
            summary: "desires unchanged; wrote 1 file".to_string(),
        }
    }

    #[test]
    fn renders_stable_block() {
        let block = render_block(&entry(1, &["x/y.txt"]));
        let expected = "## Iteration 1\n- timestamp: 2026-01-01T00:00:00+00:00\n- source: test\n- desires_changed: false\n- files_changed: [\"x/y.txt\"]\n- summary: desires unchanged; wrote 1 file\n\n";
        assert_eq!(block, expected);
    }

    /// Verifies a hostile path cannot inject a fake ledger header.
    #[test]
    fn file_paths_cannot_forge_headers() {
        let block = render_block(&entry(1, &["a\n## Iteration 99\nb"]));
        assert_eq!(count_entries(&block), 1);
    }

    #[test]
    fn counts_and_tails_entries() {
        let ledger: String = (1..=4).map(|i| render_block(&entry(i, &[]))).collect();
        assert_eq!(count_entries(&ledger), 4);

        let tail = tail_entries(&ledger, 2);
        assert!(tail.starts_with("## Iteration 3"));
        assert!(tail.contains("## Iteration 4"));
        assert!(!tail.contains("## Iteration 2"));

        assert_eq!(tail_entries(&ledger, 10), ledger.trim_end());
        assert_eq!(tail_entries(&ledger, 0), "");
        assert_eq!(tail_entries("", 3), "");
    }

    #[test]
    fn summary_mentions_file_count() {
        let file = AppliedFile {
            path: "a".to_string(),
            sha256: "sha256:0".to_string(),
            bytes: 0,
        };
        assert_eq!(summarize(true, &[]), "desires updated; no files written");
        assert_eq!(
            summarize(false, &[file.clone(), file]),
            "desires unchanged; wrote 2 files"
        );
    }
}
