//! libgit2 helpers shared by the executor, snapshot engine and ledger.
//!
//! This module wraps the git2 operations mainline relies on:
//! - Trunk initialization with the root sentinel commit
//! - Branch reads, forced moves and compare-and-swap updates
//! - Capturing a working tree as a tree object
//! - Worktree creation and removal (views)
//! - Commit metadata and message trailers

use std::path::Path;

use chrono::{DateTime, Utc};
use git2::build::CheckoutBuilder;
use git2::{
    Diff, DiffFindOptions, DiffOptions, ErrorCode, IndexAddOption, Oid, Repository,
    RepositoryInitOptions, RepositoryState, ResetType, Signature, WorktreeAddOptions,
    WorktreePruneOptions,
};

use crate::error::{not_found_as, Error, Result};

/// Message of the synthetic commit every trunk starts from
pub const ROOT_COMMIT_MESSAGE: &str = "Root Commit";

/// Name and email used to sign commits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Author {
    pub name: String,
    pub email: String,
}

impl Author {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }

    pub fn signature(&self) -> Result<Signature<'static>> {
        Ok(Signature::now(&self.name, &self.email)?)
    }
}

fn system_author() -> Author {
    Author::new("mainline", "mainline@localhost")
}

// =============================================================================
// Repositories
// =============================================================================

/// Create a trunk repository whose mainline branch holds only the root commit.
pub fn init_trunk(path: &Path, mainline: &str) -> Result<Repository> {
    let mut opts = RepositoryInitOptions::new();
    opts.initial_head(mainline).mkpath(true);
    let repo = Repository::init_opts(path, &opts)?;
    ensure_root_commit(&repo, mainline)?;
    Ok(repo)
}

/// Make sure `mainline` exists, creating the root commit when the branch is unborn.
///
/// Returns true when the root commit had to be created.
pub fn ensure_root_commit(repo: &Repository, mainline: &str) -> Result<bool> {
    let refname = branch_ref(mainline);
    match repo.find_reference(&refname) {
        Ok(_) => Ok(false),
        Err(err) if err.code() == ErrorCode::NotFound => {
            let tree_id = empty_tree(repo)?;
            let tree = repo.find_tree(tree_id)?;
            let sig = system_author().signature()?;
            repo.commit(Some(&refname), &sig, &sig, ROOT_COMMIT_MESSAGE, &tree, &[])?;
            Ok(true)
        }
        Err(err) => Err(Error::Git(err)),
    }
}

/// Open a repository (trunk or view) at an exact path.
pub fn open_repo(path: &Path) -> Result<Repository> {
    Repository::open(path).map_err(|err| {
        not_found_as(err, || {
            Error::ObjectNotFound(format!("repository at {}", path.display()))
        })
    })
}

/// True when the working copy is in the middle of a rebase or `git am`.
pub fn is_rebasing(repo: &Repository) -> bool {
    matches!(
        repo.state(),
        RepositoryState::Rebase
            | RepositoryState::RebaseInteractive
            | RepositoryState::RebaseMerge
            | RepositoryState::ApplyMailbox
            | RepositoryState::ApplyMailboxOrRebase
    )
}

/// Short name of the branch HEAD points at, `None` when detached or unborn.
pub fn head_branch(repo: &Repository) -> Option<String> {
    let head = repo.head().ok()?;
    if !head.is_branch() {
        return None;
    }
    head.shorthand().map(|name| name.to_string())
}

/// Commit HEAD points at.
pub fn head_commit(repo: &Repository) -> Result<Oid> {
    let head = repo.head()?;
    head.target()
        .ok_or_else(|| Error::OperationFailed("HEAD has no target commit".to_string()))
}

// =============================================================================
// Branches
// =============================================================================

pub fn branch_ref(name: &str) -> String {
    format!("refs/heads/{name}")
}

/// Commit a branch points at.
pub fn branch_tip(repo: &Repository, name: &str) -> Result<Oid> {
    let reference = repo
        .find_reference(&branch_ref(name))
        .map_err(|err| not_found_as(err, || Error::ObjectNotFound(format!("branch {name}"))))?;
    reference
        .target()
        .ok_or_else(|| Error::OperationFailed(format!("branch {name} is symbolic")))
}

/// Create or move a branch.
pub fn set_branch(repo: &Repository, name: &str, target: Oid, log: &str) -> Result<()> {
    repo.reference(&branch_ref(name), target, true, log)?;
    Ok(())
}

/// Move a branch only if it still points at `expected`.
pub fn compare_and_swap_branch(
    repo: &Repository,
    name: &str,
    target: Oid,
    expected: Oid,
    log: &str,
) -> Result<()> {
    repo.reference_matching(&branch_ref(name), target, true, expected, log)
        .map_err(|err| match err.code() {
            ErrorCode::Modified | ErrorCode::Locked => {
                Error::MainlineMoved(format!("{name} no longer at {expected}"))
            }
            _ => Error::Git(err),
        })?;
    Ok(())
}

pub fn delete_branch(repo: &Repository, name: &str) -> Result<()> {
    match repo.find_reference(&branch_ref(name)) {
        Ok(mut reference) => Ok(reference.delete()?),
        Err(err) if err.code() == ErrorCode::NotFound => Ok(()),
        Err(err) => Err(Error::Git(err)),
    }
}

/// Whether `descendant` equals or descends from `ancestor`.
pub fn contains_commit(repo: &Repository, descendant: Oid, ancestor: Oid) -> Result<bool> {
    if descendant == ancestor {
        return Ok(true);
    }
    Ok(repo.graph_descendant_of(descendant, ancestor)?)
}

// =============================================================================
// Trees
// =============================================================================

pub fn empty_tree(repo: &Repository) -> Result<Oid> {
    Ok(repo.treebuilder(None)?.write()?)
}

pub fn commit_tree_id(repo: &Repository, commit: Oid) -> Result<Oid> {
    Ok(repo.find_commit(commit)?.tree_id())
}

/// Capture the working tree (tracked and untracked, minus ignored) as a tree object.
///
/// The on-disk index is left untouched.
pub fn workdir_tree(repo: &Repository) -> Result<Oid> {
    let mut index = repo.index()?;
    index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
    index.update_all(["*"].iter(), None)?;
    let tree = index.write_tree()?;
    index.read(true)?;
    Ok(tree)
}

/// Raw diff between two trees with rename detection. `None` is the empty tree.
pub fn diff_trees(
    repo: &Repository,
    old: Option<Oid>,
    new: Option<Oid>,
    context_lines: u32,
) -> Result<Diff<'_>> {
    let old_tree = old.map(|oid| repo.find_tree(oid)).transpose()?;
    let new_tree = new.map(|oid| repo.find_tree(oid)).transpose()?;

    let mut opts = DiffOptions::new();
    opts.context_lines(context_lines)
        .indent_heuristic(true)
        .ignore_submodules(true);

    let mut diff = repo.diff_tree_to_tree(old_tree.as_ref(), new_tree.as_ref(), Some(&mut opts))?;

    let mut find = DiffFindOptions::new();
    find.renames(true);
    diff.find_similar(Some(&mut find))?;

    Ok(diff)
}

/// Write `tree` into the working directory while HEAD and the index stay at HEAD.
///
/// Afterwards the working tree differs from HEAD exactly by `HEAD -> tree`.
pub fn checkout_tree_keep_head(repo: &Repository, tree: Oid) -> Result<()> {
    let tree = repo.find_tree(tree)?;
    let mut opts = CheckoutBuilder::new();
    opts.force().remove_untracked(true);
    repo.checkout_tree(tree.as_object(), Some(&mut opts))?;

    let head_tree = repo.head()?.peel_to_tree()?;
    let mut index = repo.index()?;
    index.read_tree(&head_tree)?;
    index.write()?;
    Ok(())
}

/// Move HEAD (and its branch) to `commit`.
pub fn reset(repo: &Repository, commit: Oid, kind: ResetType) -> Result<()> {
    let object = repo.find_object(commit, None)?;
    let mut opts = CheckoutBuilder::new();
    opts.force();
    let checkout = match kind {
        ResetType::Hard => Some(&mut opts),
        _ => None,
    };
    repo.reset(&object, kind, checkout)?;
    Ok(())
}

// =============================================================================
// Worktrees
// =============================================================================

/// Add a worktree of `repo` at `path`, checking out `branch`.
pub fn add_worktree(repo: &Repository, name: &str, path: &Path, branch: &str) -> Result<()> {
    let reference = repo
        .find_reference(&branch_ref(branch))
        .map_err(|err| not_found_as(err, || Error::ObjectNotFound(format!("branch {branch}"))))?;
    let mut opts = WorktreeAddOptions::new();
    opts.reference(Some(&reference));
    repo.worktree(name, path, Some(&opts))?;
    Ok(())
}

/// Add a worktree of `repo` at `path` with a detached HEAD at `commit`.
///
/// libgit2 needs a branch to create a worktree, so a branch named after the
/// worktree is created for the checkout and deleted again.
pub fn add_detached_worktree(repo: &Repository, name: &str, path: &Path, commit: Oid) -> Result<()> {
    set_branch(repo, name, commit, "worktree")?;
    let added = add_worktree(repo, name, path, name).and_then(|()| {
        let worktree = open_repo(path)?;
        detach_head(&worktree)
    });
    let deleted = delete_branch(repo, name);
    added?;
    deleted
}

/// Point HEAD directly at its current commit.
pub fn detach_head(repo: &Repository) -> Result<()> {
    let commit = head_commit(repo)?;
    repo.set_head_detached(commit)?;
    Ok(())
}

/// Prune a worktree and delete its working directory.
pub fn remove_worktree(repo: &Repository, name: &str) -> Result<()> {
    let worktree = match repo.find_worktree(name) {
        Ok(worktree) => worktree,
        Err(err) if err.code() == ErrorCode::NotFound => return Ok(()),
        Err(err) => return Err(Error::Git(err)),
    };
    let mut opts = WorktreePruneOptions::new();
    opts.valid(true).working_tree(true).locked(true);
    worktree.prune(Some(&mut opts))?;
    Ok(())
}

// =============================================================================
// Commits
// =============================================================================

/// Metadata read from a commit
#[derive(Debug, Clone)]
pub struct CommitInfo {
    pub id: Oid,
    pub parents: Vec<Oid>,
    pub message: String,
    pub author: Author,
    pub time: DateTime<Utc>,
}

impl CommitInfo {
    /// The synthetic commit trunks start from
    pub fn is_root_sentinel(&self) -> bool {
        self.parents.is_empty() && self.message.trim() == ROOT_COMMIT_MESSAGE
    }
}

pub fn commit_info(repo: &Repository, oid: Oid) -> Result<CommitInfo> {
    let commit = repo
        .find_commit(oid)
        .map_err(|err| not_found_as(err, || Error::ObjectNotFound(format!("commit {oid}"))))?;
    let author = commit.author();
    Ok(CommitInfo {
        id: oid,
        parents: commit.parent_ids().collect(),
        message: commit.message().unwrap_or_default().to_string(),
        author: Author::new(
            author.name().unwrap_or_default(),
            author.email().unwrap_or_default(),
        ),
        time: DateTime::from_timestamp(commit.time().seconds(), 0).unwrap_or_else(Utc::now),
    })
}

/// Create a commit object without moving any reference.
pub fn create_commit(
    repo: &Repository,
    tree: Oid,
    parents: &[Oid],
    author: &Author,
    message: &str,
) -> Result<Oid> {
    let tree = repo.find_tree(tree)?;
    let parents = parents
        .iter()
        .map(|oid| repo.find_commit(*oid))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let parent_refs: Vec<&git2::Commit> = parents.iter().collect();
    let sig = author.signature()?;
    Ok(repo.commit(None, &sig, &sig, message, &tree, &parent_refs)?)
}

// =============================================================================
// Trailer Operations
// =============================================================================

/// A parsed trailer from a commit message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trailer {
    pub key: String,
    pub value: String,
}

/// Parse the trailer block at the end of a commit message.
pub fn parse_trailers(message: &str) -> Vec<Trailer> {
    let lines: Vec<&str> = message.lines().collect();
    let start = trailer_block_start(&lines);
    lines[start..]
        .iter()
        .filter_map(|line| parse_trailer_line(line.trim()))
        .collect()
}

/// Commit message with the trailer block removed.
pub fn strip_trailers(message: &str) -> String {
    let lines: Vec<&str> = message.lines().collect();
    let start = trailer_block_start(&lines);
    lines[..start].join("\n").trim_end().to_string()
}

fn trailer_block_start(lines: &[&str]) -> usize {
    let mut end = lines.len();
    while end > 0 && lines[end - 1].trim().is_empty() {
        end -= 1;
    }
    let mut start = end;
    while start > 0 && is_trailer_line(lines[start - 1].trim()) {
        start -= 1;
    }
    // a trailer block is separated from the body by a blank line
    if start == end || start == 0 || !lines[start - 1].trim().is_empty() {
        return lines.len();
    }
    start
}

fn is_trailer_line(line: &str) -> bool {
    if let Some(colon_pos) = line.find(':') {
        let key = &line[..colon_pos];
        !key.is_empty()
            && key.chars().all(|c| c.is_alphanumeric() || c == '-')
            && line.len() > colon_pos + 1
    } else {
        false
    }
}

fn parse_trailer_line(line: &str) -> Option<Trailer> {
    let colon_pos = line.find(':')?;
    let key = line[..colon_pos].trim().to_string();
    let value = line[colon_pos + 1..].trim().to_string();

    if key.is_empty() || value.is_empty() {
        return None;
    }

    Some(Trailer { key, value })
}

/// Find a trailer by key (case-insensitive).
pub fn find_trailer<'a>(trailers: &'a [Trailer], key: &str) -> Option<&'a Trailer> {
    trailers.iter().find(|t| t.key.eq_ignore_ascii_case(key))
}

/// Append a trailer block to a message body.
pub fn with_trailers(body: &str, trailers: &[Trailer]) -> String {
    let body = body.trim_end();
    let block = trailers
        .iter()
        .map(|t| format!("{}: {}", t.key, t.value))
        .collect::<Vec<_>>()
        .join("\n");
    if block.is_empty() {
        return format!("{body}\n");
    }
    format!("{body}\n\n{block}\n")
}
