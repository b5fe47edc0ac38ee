//! Splitting file patches into hunks and computing their content ids.

use std::collections::HashMap;

use sha2::{Digest, Sha256};

/// Header lines that depend on whole-file identity rather than on the edit
const VOLATILE_HEADER_PREFIXES: &[&str] = &["index ", "similarity index ", "dissimilarity index "];

/// A file patch split at its `@@` lines
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SplitPatch {
    pub header: String,
    pub hunks: Vec<String>,
}

/// Split unified-diff text for one file into its header and hunks.
pub(crate) fn split_patch(text: &str) -> SplitPatch {
    let mut header = String::new();
    let mut hunks: Vec<String> = Vec::new();

    for line in text.split_inclusive('\n') {
        if line.starts_with("@@ ") {
            hunks.push(line.to_string());
        } else if let Some(current) = hunks.last_mut() {
            current.push_str(line);
        } else {
            header.push_str(line);
        }
    }

    SplitPatch { header, hunks }
}

/// Normalize patch text for hashing: LF line endings, no whole-file identity lines.
pub(crate) fn normalize(text: &str) -> String {
    let unified = text.replace("\r\n", "\n");
    unified
        .split_inclusive('\n')
        .filter(|line| {
            !VOLATILE_HEADER_PREFIXES
                .iter()
                .any(|prefix| line.starts_with(prefix))
        })
        .collect()
}

fn sha256_hex(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Content id of one hunk within its file header.
///
/// The `@@` line is left out, so the id survives line shifts caused by
/// other hunks of the same file.
pub fn hunk_id(header: &str, hunk: &str) -> String {
    occurrence_id(&normalize(header), &normalize(hunk_body(hunk)), 0)
}

/// Ids for every hunk of one file; identical bodies are told apart by occurrence.
pub(crate) fn hunk_ids(header: &str, hunks: &[String]) -> Vec<String> {
    let header = normalize(header);
    let mut seen: HashMap<String, usize> = HashMap::new();
    hunks
        .iter()
        .map(|hunk| {
            let body = normalize(hunk_body(hunk));
            let occurrence = seen.entry(body.clone()).or_default();
            let id = occurrence_id(&header, &body, *occurrence);
            *occurrence += 1;
            id
        })
        .collect()
}

fn hunk_body(hunk: &str) -> &str {
    hunk.split_once('\n').map_or("", |(_, body)| body)
}

fn occurrence_id(header: &str, body: &str, occurrence: usize) -> String {
    if occurrence == 0 {
        sha256_hex(&["hunk\n", header, body])
    } else {
        sha256_hex(&["hunk\n", header, body, &format!("#{occurrence}\n")])
    }
}

/// Content id of a file-level change (rename, mode change, empty add or delete)
pub fn file_id(header: &str) -> String {
    sha256_hex(&["file\n", &normalize(header)])
}

/// Header without lines naming blob ids, suitable for re-applying a subset of hunks.
pub(crate) fn applicable_header(header: &str) -> String {
    header
        .split_inclusive('\n')
        .filter(|line| !line.starts_with("index "))
        .collect()
}

/// Whether a header alone describes a change (no hunks needed)
pub(crate) fn header_is_change(header: &str) -> bool {
    header.lines().any(|line| {
        line.starts_with("rename from ")
            || line.starts_with("new file mode ")
            || line.starts_with("deleted file mode ")
            || line.starts_with("old mode ")
    })
}

/// Parsed `@@ -a,b +c,d @@ section` line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct HunkRange {
    pub old_start: u32,
    pub old_lines: u32,
    pub new_start: u32,
    pub new_lines: u32,
}

pub(crate) fn parse_hunk_header(line: &str) -> Option<(HunkRange, &str)> {
    let rest = line.strip_prefix("@@ -")?;
    let end = rest.find(" @@")?;
    let ranges = &rest[..end];
    let section = &rest[end + 3..];
    let (old, new) = ranges.split_once(" +")?;
    let (old_start, old_lines) = parse_range(old)?;
    let (new_start, new_lines) = parse_range(new)?;
    Some((
        HunkRange {
            old_start,
            old_lines,
            new_start,
            new_lines,
        },
        section,
    ))
}

fn parse_range(raw: &str) -> Option<(u32, u32)> {
    match raw.split_once(',') {
        Some((start, len)) => Some((start.parse().ok()?, len.parse().ok()?)),
        None => Some((raw.parse().ok()?, 1)),
    }
}
