//! Three-way tree merges against the mainline tip.
//!
//! The three trees are merged into an in-memory index; nothing is checked
//! out and no ref moves. Conflict prediction only reads back the index's
//! conflict entries; `merge_trees` writes the merged tree when there are none.

use std::fmt;

use git2::{ErrorCode, Index, IndexConflict, IndexEntry, MergeOptions, Oid, Repository};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::git;

/// One path that would not merge cleanly onto mainline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeConflict {
    pub path: String,
    pub kind: ConflictKind,
    /// Path on the workspace side when it differs from `path`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_path: Option<String>,
    /// Path on the mainline side when it differs from `path`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mainline_path: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Both sides edited the same lines
    Content,
    /// Both sides created the path with different content
    BothAdded,
    /// One side edited what the other deleted
    EditDelete,
    /// The sides disagree about where the file lives
    Rename,
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConflictKind::Content => "content",
            ConflictKind::BothAdded => "both added",
            ConflictKind::EditDelete => "edit/delete",
            ConflictKind::Rename => "rename",
        })
    }
}

impl fmt::Display for MergeConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.path, self.kind)
    }
}

/// Merge `content` (a tree whose history starts at commit `base`) with the
/// commit `tip`, returning the conflicting paths sorted by path.
///
/// Histories without a common ancestor merge over the empty tree.
pub fn predict_conflicts(
    repo: &Repository,
    base: Oid,
    content: Oid,
    tip: Oid,
) -> Result<Vec<MergeConflict>> {
    let ancestor = match repo.merge_base(base, tip) {
        Ok(commit) => git::commit_tree_id(repo, commit)?,
        Err(err) if err.code() == ErrorCode::NotFound => git::empty_tree(repo)?,
        Err(err) => return Err(err.into()),
    };

    let index = merge_index(repo, ancestor, content, git::commit_tree_id(repo, tip)?)?;
    conflicts_in(&index)
}

/// Merge `ours` and `theirs` over `ancestor` and write the result.
///
/// Fails with `Conflict` naming every path that did not merge cleanly.
pub fn merge_trees(repo: &Repository, ancestor: Oid, ours: Oid, theirs: Oid) -> Result<Oid> {
    let mut index = merge_index(repo, ancestor, ours, theirs)?;
    let conflicts = conflicts_in(&index)?;
    if !conflicts.is_empty() {
        let paths: Vec<String> = conflicts.iter().map(ToString::to_string).collect();
        return Err(Error::Conflict(paths.join(", ")));
    }
    Ok(index.write_tree_to(repo)?)
}

fn merge_index(repo: &Repository, ancestor: Oid, ours: Oid, theirs: Oid) -> Result<Index> {
    let mut options = MergeOptions::new();
    options.find_renames(true);
    Ok(repo.merge_trees(
        &repo.find_tree(ancestor)?,
        &repo.find_tree(ours)?,
        &repo.find_tree(theirs)?,
        Some(&options),
    )?)
}

fn conflicts_in(index: &Index) -> Result<Vec<MergeConflict>> {
    if !index.has_conflicts() {
        return Ok(Vec::new());
    }
    let mut conflicts = index
        .conflicts()?
        .map(|entry| -> Result<MergeConflict> { Ok(classify(entry?)) })
        .collect::<Result<Vec<_>>>()?;
    conflicts.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(conflicts)
}

fn classify(entry: IndexConflict) -> MergeConflict {
    let path = |side: &Option<IndexEntry>| {
        side.as_ref()
            .map(|entry| String::from_utf8_lossy(&entry.path).into_owned())
    };
    let ancestor = path(&entry.ancestor);
    let ours = path(&entry.our);
    let theirs = path(&entry.their);

    let moved = [(&ancestor, &ours), (&ancestor, &theirs), (&ours, &theirs)]
        .iter()
        .any(|(left, right)| matches!((left, right), (Some(l), Some(r)) if l != r));
    let kind = match (&ancestor, &ours, &theirs) {
        _ if moved => ConflictKind::Rename,
        (None, Some(_), Some(_)) => ConflictKind::BothAdded,
        (Some(_), Some(_), Some(_)) => ConflictKind::Content,
        _ => ConflictKind::EditDelete,
    };

    let primary = ours
        .clone()
        .or_else(|| theirs.clone())
        .or_else(|| ancestor.clone())
        .unwrap_or_default();
    MergeConflict {
        workspace_path: ours.filter(|p| *p != primary),
        mainline_path: theirs.filter(|p| *p != primary),
        path: primary,
        kind,
    }
}
