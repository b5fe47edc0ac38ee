//! Diff decoration: raw libgit2 diffs into content-addressed file diffs and hunks.
//!
//! A [`Decorator`] walks every delta of a tree-to-tree diff, splits each file
//! patch into hunks and hashes them. Filters run in a fixed order:
//!
//! 1. large/binary files are diffed as pointer text
//! 2. the actor's [`Allower`] redacts paths it does not permit
//! 3. an optional id selection keeps only the requested hunks
//!
//! Output is sorted by path, hunks in file order, so the same trees always
//! produce the same ids.

mod hunk;
mod pointer;
pub mod select;

use std::collections::HashSet;
use std::path::Path;

use git2::{Delta, Diff, DiffDelta, FileMode, Oid, Patch, Repository};
use serde::Serialize;

use crate::acl::Allower;
use crate::error::{Error, Result};

pub use hunk::{file_id, hunk_id};
pub use pointer::{pointer_text, POINTER_VERSION};

/// One contiguous region of change
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Hunk {
    pub id: String,
    /// File header followed by this hunk, as unified diff text
    pub patch: String,
}

/// Changes to one file between two trees
#[derive(Debug, Clone, Serialize)]
pub struct FileDiff {
    /// Selects the file-level part of the change (rename, mode, empty add/delete)
    pub id: String,
    pub orig_name: String,
    pub new_name: String,
    pub preferred_name: String,
    pub is_new: bool,
    pub is_deleted: bool,
    pub is_moved: bool,
    pub is_binary: bool,
    pub is_large: bool,
    pub is_hidden: bool,
    pub hunks: Vec<Hunk>,
    #[serde(skip)]
    pub(crate) header: String,
    #[serde(skip)]
    pub(crate) hunk_texts: Vec<String>,
    #[serde(skip)]
    pub(crate) opaque: Option<OpaqueChange>,
}

impl FileDiff {
    /// Every selectable id this file contributes
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.id.as_str()).chain(self.hunks.iter().map(|h| h.id.as_str()))
    }

    fn redact(&mut self) {
        self.is_hidden = true;
        self.hunks.clear();
        self.hunk_texts.clear();
        self.opaque = None;
    }
}

/// Whole-blob replacement for files diffed as pointers
#[derive(Debug, Clone)]
pub(crate) struct OpaqueChange {
    pub old_path: Option<String>,
    pub old_blob: Option<Oid>,
    pub new_path: Option<String>,
    pub new_blob: Option<(Oid, FileMode)>,
}

/// Hunk and file ids chosen by a caller
pub type Selection = HashSet<String>;

/// Configurable diff decoration pipeline
#[derive(Debug, Clone, Default)]
pub struct Decorator<'a> {
    large_file_threshold: Option<u64>,
    allower: Option<&'a Allower>,
    selection: Option<&'a Selection>,
}

impl<'a> Decorator<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Diff files above `threshold` bytes as pointers
    pub fn with_large_files(mut self, threshold: u64) -> Self {
        self.large_file_threshold = Some(threshold);
        self
    }

    pub fn with_allower(mut self, allower: &'a Allower) -> Self {
        self.allower = Some(allower);
        self
    }

    /// Keep only hunks (or file-level changes) whose id is selected
    pub fn with_selection(mut self, selection: &'a Selection) -> Self {
        self.selection = Some(selection);
        self
    }

    pub fn decorate(&self, repo: &Repository, diff: &Diff<'_>) -> Result<Vec<FileDiff>> {
        let mut files = Vec::with_capacity(diff.deltas().len());
        for (idx, delta) in diff.deltas().enumerate() {
            if delta.status() == Delta::Unmodified {
                continue;
            }
            files.push(self.decorate_delta(repo, diff, idx, &delta)?);
        }

        files.sort_by(|a, b| a.preferred_name.cmp(&b.preferred_name));

        if let Some(allower) = self.allower {
            for file in &mut files {
                if !allower.is_allowed(&file.orig_name) || !allower.is_allowed(&file.new_name) {
                    file.redact();
                }
            }
        }

        if let Some(selection) = self.selection {
            files = select_ids(files, selection);
        }

        Ok(files)
    }

    fn decorate_delta(
        &self,
        repo: &Repository,
        diff: &Diff<'_>,
        idx: usize,
        delta: &DiffDelta<'_>,
    ) -> Result<FileDiff> {
        let old_path = delta.old_file().path().map(path_string);
        let new_path = delta.new_file().path().map(path_string);
        let status = delta.status();

        let is_new = matches!(status, Delta::Added | Delta::Untracked);
        let is_deleted = status == Delta::Deleted;
        let is_moved = status == Delta::Renamed;

        let orig_name = old_path
            .clone()
            .or_else(|| new_path.clone())
            .unwrap_or_default();
        let new_name = new_path
            .clone()
            .or_else(|| old_path.clone())
            .unwrap_or_default();
        let preferred_name = if is_deleted {
            orig_name.clone()
        } else {
            new_name.clone()
        };

        let old_id = delta.old_file().id();
        let new_id = delta.new_file().id();

        let is_large = match self.large_file_threshold {
            Some(threshold) => {
                pointer::blob_size(repo, old_id)? > threshold
                    || pointer::blob_size(repo, new_id)? > threshold
            }
            None => false,
        };

        // libgit2 yields no patch for binary content
        let mut patch = Patch::from_diff(diff, idx)?;
        let is_binary = delta.flags().is_binary()
            || match patch.as_ref() {
                Some(p) => p.delta().flags().is_binary(),
                None => true,
            };

        let text_patch = match patch.as_mut() {
            Some(patch) if !is_large && !is_binary => {
                let buf = patch.to_buf()?;
                std::str::from_utf8(&buf).ok().map(|text| text.to_string())
            }
            _ => None,
        };

        let (text, opaque) = match text_patch {
            Some(text) => (text, None),
            None => {
                let text = pointer_patch(repo, old_id, new_id, &orig_name, &new_name)?;
                let opaque = OpaqueChange {
                    old_path: (!is_new).then(|| orig_name.clone()),
                    old_blob: (!old_id.is_zero()).then_some(old_id),
                    new_path: (!is_deleted).then(|| new_name.clone()),
                    new_blob: (!is_deleted).then(|| (new_id, delta.new_file().mode())),
                };
                (header_for(status, &orig_name, &new_name, &text), Some(opaque))
            }
        };

        let split = hunk::split_patch(&text);
        let hunks = hunk::hunk_ids(&split.header, &split.hunks)
            .into_iter()
            .zip(&split.hunks)
            .map(|(id, body)| Hunk {
                id,
                patch: format!("{}{}", split.header, body),
            })
            .collect();

        Ok(FileDiff {
            id: hunk::file_id(&split.header),
            orig_name,
            new_name,
            preferred_name,
            is_new,
            is_deleted,
            is_moved,
            is_binary: is_binary && !is_large,
            is_large,
            is_hidden: false,
            hunks,
            header: split.header,
            hunk_texts: split.hunks,
            opaque,
        })
    }
}

/// Restrict files to the selected ids. Hidden files are never selectable.
pub fn select_ids(files: Vec<FileDiff>, selection: &Selection) -> Vec<FileDiff> {
    files
        .into_iter()
        .filter(|file| !file.is_hidden)
        .filter_map(|mut file| {
            let file_selected = selection.contains(&file.id);
            if file.opaque.is_some() {
                let any_hunk = file.hunks.iter().any(|h| selection.contains(&h.id));
                return (file_selected || any_hunk).then_some(file);
            }

            let (hunks, texts): (Vec<_>, Vec<_>) = file
                .hunks
                .drain(..)
                .zip(file.hunk_texts.drain(..))
                .filter(|(hunk, _)| selection.contains(&hunk.id))
                .unzip();
            file.hunks = hunks;
            file.hunk_texts = texts;

            (file_selected || !file.hunks.is_empty()).then_some(file)
        })
        .collect()
}

/// Requested ids that no visible file or hunk carries
pub fn unknown_ids(files: &[FileDiff], requested: &Selection) -> Vec<String> {
    let known: HashSet<&str> = files
        .iter()
        .filter(|file| !file.is_hidden)
        .flat_map(|file| file.ids())
        .collect();
    let mut unknown: Vec<String> = requested
        .iter()
        .filter(|id| !known.contains(id.as_str()))
        .cloned()
        .collect();
    unknown.sort();
    unknown
}

/// Decorate the diff between two trees (`None` is the empty tree).
pub fn diff_trees(
    repo: &Repository,
    old: Option<Oid>,
    new: Option<Oid>,
    context_lines: u32,
    decorator: &Decorator<'_>,
) -> Result<Vec<FileDiff>> {
    let diff = crate::git::diff_trees(repo, old, new, context_lines)?;
    decorator.decorate(repo, &diff)
}

fn pointer_patch(
    repo: &Repository,
    old_id: Oid,
    new_id: Oid,
    old_name: &str,
    new_name: &str,
) -> Result<String> {
    let old = pointer::blob_pointer(repo, old_id)?;
    let new = pointer::blob_pointer(repo, new_id)?;
    let mut patch = Patch::from_buffers(
        &old,
        Some(Path::new(old_name)),
        &new,
        Some(Path::new(new_name)),
        None,
    )?;
    let buf = patch.to_buf()?;
    String::from_utf8(buf.to_vec())
        .map_err(|err| Error::OperationFailed(format!("pointer patch is not utf-8: {err}")))
}

/// Replace a buffer-patch header with one that states the file-level change.
fn header_for(status: Delta, old_name: &str, new_name: &str, text: &str) -> String {
    let split = hunk::split_patch(text);
    let mut header = format!("diff --git a/{old_name} b/{new_name}\n");
    match status {
        Delta::Added | Delta::Untracked => header.push_str("new file mode 100644\n"),
        Delta::Deleted => header.push_str("deleted file mode 100644\n"),
        Delta::Renamed => {
            header.push_str(&format!("rename from {old_name}\nrename to {new_name}\n"));
        }
        _ => {}
    }
    header.push_str("pointer file\n");
    let mut out = header;
    for body in split.hunks {
        out.push_str(&body);
    }
    out
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
