//! Snapshots: immutable checkpoints of a workspace's tree.
//!
//! A snapshot is a commit whose single parent is the workspace base and
//! whose tree is the workspace content at capture time. The commit is kept
//! reachable by `refs/snapshots/<id>`; the record is appended to
//! `snapshots.jsonl` and never rewritten.
//!
//! Where the tree comes from is chosen with [`SnapshotOptions`], validated
//! into a [`SnapshotMode`] before any repository is touched.

use chrono::{DateTime, Utc};
use git2::Oid;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::acl::Allower;
use crate::diff::{self, select, Decorator, FileDiff, Selection};
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::events::{Event, EventKind, Topic};
use crate::executor::{RepoHandle, TargetKind};
use crate::git;
use crate::ledger::parse_oid;
use crate::storage::Record;
use crate::workspace::Workspace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotAction {
    /// Periodic capture of a live view
    Sync,
    /// Inverse of a change, seeding a revert workspace
    Revert,
    /// Patches copied in from another workspace
    Extract,
    /// Patches removed from the workspace
    UndoPatch,
    /// What was left after a land
    LandBaseline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub codebase_id: String,
    pub workspace_id: String,
    /// View the tree was captured from; unset for temporary checkouts and copies
    pub view_id: Option<String>,
    pub commit_id: String,
    pub previous_snapshot_id: Option<String>,
    pub action: SnapshotAction,
    pub created_at: DateTime<Utc>,
    pub diffs_count: Option<usize>,
    #[serde(default)]
    pub changed_paths: Vec<String>,
}

impl Record for Snapshot {
    fn id(&self) -> &str {
        &self.id
    }
}

pub fn snapshot_ref(id: &str) -> String {
    format!("refs/snapshots/{id}")
}

/// Where and how to capture a snapshot
#[derive(Debug, Default)]
pub struct SnapshotOptions<'h> {
    on_view: Option<String>,
    on_temporary_view: bool,
    on_repo: Option<&'h RepoHandle>,
    on_existing_commit: Option<Oid>,
    revert: Option<(Oid, Option<Oid>)>,
    patch_ids: Option<Selection>,
    mark_as_latest: bool,
    skip_throttle: bool,
}

impl<'h> SnapshotOptions<'h> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Capture the live tree of a durable view
    pub fn on_view(mut self, view_id: impl Into<String>) -> Self {
        self.on_view = Some(view_id.into());
        self
    }

    /// Capture from a temporary checkout of the workspace
    pub fn on_temporary_view(mut self) -> Self {
        self.on_temporary_view = true;
        self
    }

    /// Capture from a repository already open in the caller's chain
    pub fn on_repo(mut self, handle: &'h RepoHandle) -> Self {
        self.on_repo = Some(handle);
        self
    }

    /// Record an existing single-parent commit instead of capturing a tree
    pub fn on_existing_commit(mut self, commit: Oid) -> Self {
        self.on_existing_commit = Some(commit);
        self
    }

    /// Parent `head`, tree of `base` (empty when `None`)
    pub fn revert(mut self, head: Oid, base: Option<Oid>) -> Self {
        self.revert = Some((head, base));
        self
    }

    /// Keep only these hunks
    pub fn patch_ids(mut self, ids: Selection) -> Self {
        self.patch_ids = Some(ids);
        self
    }

    /// Move the workspace pointer even if the view is not authoritative
    pub fn mark_as_latest(mut self) -> Self {
        self.mark_as_latest = true;
        self
    }

    /// Capture even if a recent sync snapshot exists on the view
    pub fn skip_throttle(mut self) -> Self {
        self.skip_throttle = true;
        self
    }

    pub fn validate(&self) -> Result<SnapshotMode<'h>> {
        let invalid = |msg: &str| Err(Error::Validation(msg.to_string()));

        if self.on_view.is_some() && self.on_temporary_view {
            return invalid("on_view and on_temporary_view are exclusive");
        }
        if self.on_existing_commit.is_some() && self.on_repo.is_none() {
            return invalid("on_existing_commit requires on_repo");
        }
        if self.revert.is_some() && !self.on_temporary_view {
            return invalid("revert requires on_temporary_view");
        }
        if self.patch_ids.is_some() && self.on_existing_commit.is_some() {
            return invalid("patch ids cannot filter an existing commit");
        }
        if self.on_repo.is_some() && self.on_temporary_view {
            return invalid("on_repo and on_temporary_view are exclusive");
        }

        if let Some(handle) = self.on_repo {
            if handle.kind() == TargetKind::Trunk {
                return invalid("on_repo needs a view or temporary view");
            }
            let view_id = self
                .on_view
                .clone()
                .or_else(|| handle.view_id().map(String::from));
            return Ok(match self.on_existing_commit {
                Some(commit) => SnapshotMode::ExistingCommit {
                    handle,
                    commit,
                    view_id,
                },
                None => SnapshotMode::Repo { handle, view_id },
            });
        }
        if self.on_temporary_view {
            return Ok(match self.revert {
                Some((head, base)) => SnapshotMode::Revert { head, base },
                None => SnapshotMode::TemporaryView,
            });
        }
        match &self.on_view {
            Some(view_id) => Ok(SnapshotMode::View {
                view_id: view_id.clone(),
            }),
            None => invalid("no snapshot target: use on_view, on_temporary_view or on_repo"),
        }
    }
}

/// Validated capture target
#[derive(Debug)]
pub enum SnapshotMode<'h> {
    View {
        view_id: String,
    },
    TemporaryView,
    Revert {
        head: Oid,
        base: Option<Oid>,
    },
    Repo {
        handle: &'h RepoHandle,
        view_id: Option<String>,
    },
    ExistingCommit {
        handle: &'h RepoHandle,
        commit: Oid,
        view_id: Option<String>,
    },
}

impl SnapshotMode<'_> {
    fn view_id(&self) -> Option<&str> {
        match self {
            SnapshotMode::View { view_id } => Some(view_id),
            SnapshotMode::Repo { view_id, .. } | SnapshotMode::ExistingCommit { view_id, .. } => {
                view_id.as_deref()
            }
            SnapshotMode::TemporaryView | SnapshotMode::Revert { .. } => None,
        }
    }
}

/// Commit ids behind a snapshot
#[derive(Debug, Clone, Copy)]
pub(crate) struct SnapshotTrees {
    pub parent: Oid,
    pub parent_tree: Oid,
    pub tree: Oid,
}

struct Captured {
    commit: Oid,
    diffs_count: usize,
    changed_paths: Vec<String>,
}

pub struct Snapshots<'e> {
    engine: &'e Engine,
}

impl<'e> Snapshots<'e> {
    pub(crate) fn new(engine: &'e Engine) -> Self {
        Self { engine }
    }

    pub fn get(&self, id: &str) -> Result<Snapshot> {
        self.engine.storage().get_snapshot(id)
    }

    pub fn list(&self, workspace_id: &str) -> Result<Vec<Snapshot>> {
        self.engine.storage().list_snapshots(workspace_id)
    }

    /// Take a snapshot of a workspace.
    ///
    /// Returns `Ok(None)` when a sync snapshot was coalesced into a recent one.
    pub fn snapshot(
        &self,
        workspace_id: &str,
        action: SnapshotAction,
        options: SnapshotOptions<'_>,
    ) -> Result<Option<Snapshot>> {
        let mode = options.validate()?;
        let storage = self.engine.storage();
        let workspace = storage.get_workspace(workspace_id)?;
        let view_id = mode.view_id().map(String::from);

        if action == SnapshotAction::Sync && !options.skip_throttle {
            if let Some(view_id) = &view_id {
                if self.throttled(view_id)? {
                    debug!(workspace = %workspace.id, view = %view_id, "sync snapshot throttled");
                    return Ok(None);
                }
            }
        }

        let previous_snapshot_id = match &view_id {
            Some(view_id) => storage.latest_snapshot_in_view(view_id)?.map(|s| s.id),
            None => None,
        }
        .or_else(|| workspace.latest_snapshot_id.clone());

        let id = Uuid::new_v4().to_string();
        let captured = self.capture_mode(&workspace, &id, mode, options.patch_ids.as_ref())?;

        let snapshot = Snapshot {
            id,
            codebase_id: workspace.codebase_id.clone(),
            workspace_id: workspace.id.clone(),
            view_id: view_id.clone(),
            commit_id: captured.commit.to_string(),
            previous_snapshot_id,
            action,
            created_at: Utc::now(),
            diffs_count: Some(captured.diffs_count),
            changed_paths: captured.changed_paths,
        };
        storage.append_snapshot(&snapshot)?;
        info!(
            snapshot = %snapshot.id,
            workspace = %workspace.id,
            action = ?action,
            diffs = captured.diffs_count,
            "snapshot created"
        );

        let authoritative = options.mark_as_latest
            || (view_id.is_some() && workspace.view_id == view_id);
        if authoritative {
            self.make_latest(&workspace, &snapshot)?;
        }
        Ok(Some(snapshot))
    }

    fn throttled(&self, view_id: &str) -> Result<bool> {
        let window = self.engine.config().snapshots.sync_throttle_secs;
        let Some(latest) = self.engine.storage().latest_snapshot_in_view(view_id)? else {
            return Ok(false);
        };
        let age = Utc::now()
            .signed_duration_since(latest.created_at)
            .num_seconds();
        let recent = u64::try_from(age).map_or(true, |age| age < window);
        Ok(latest.action == SnapshotAction::Sync && recent)
    }

    fn capture_mode(
        &self,
        workspace: &Workspace,
        id: &str,
        mode: SnapshotMode<'_>,
        patch_ids: Option<&Selection>,
    ) -> Result<Captured> {
        let executor = self.engine.executor();
        let mut out = None;

        match mode {
            SnapshotMode::View { view_id } => {
                executor
                    .view(&workspace.codebase_id, &view_id, "snapshot view")
                    .assert_branch(&workspace.id)
                    .file_read_git_write(|handle| {
                        let repo = handle.repo();
                        let parent = git::head_commit(repo)?;
                        let tree = git::workdir_tree(repo)?;
                        out = Some(self.capture(handle, workspace, id, parent, tree, patch_ids)?);
                        Ok(())
                    })
                    .exec()
                    .map_err(snapshot_error)?;
            }
            SnapshotMode::TemporaryView => {
                let base = self.engine.workspaces().branch_tip(workspace)?;
                let latest = match &workspace.latest_snapshot_id {
                    Some(latest) => Some(self.trees(&self.get(latest)?)?.tree),
                    None => None,
                };
                executor
                    .temporary_view(&workspace.codebase_id, base, "snapshot workspace")
                    .write(|handle| {
                        let repo = handle.repo();
                        if let Some(tree) = latest {
                            git::checkout_tree_keep_head(repo, tree)?;
                        }
                        let tree = git::workdir_tree(repo)?;
                        out = Some(self.capture(handle, workspace, id, base, tree, patch_ids)?);
                        Ok(())
                    })
                    .exec()?;
            }
            SnapshotMode::Revert { head, base } => {
                executor
                    .temporary_view(&workspace.codebase_id, head, "snapshot revert")
                    .git_write(|handle| {
                        let repo = handle.repo();
                        let tree = match base {
                            Some(base) => git::commit_tree_id(repo, base)?,
                            None => git::empty_tree(repo)?,
                        };
                        out = Some(self.capture(handle, workspace, id, head, tree, patch_ids)?);
                        Ok(())
                    })
                    .exec()?;
            }
            SnapshotMode::Repo { handle, .. } => {
                let repo = handle.repo();
                if git::is_rebasing(repo) {
                    return Err(Error::CantSnapshotRebasing);
                }
                let parent = git::head_commit(repo)?;
                let tree = git::workdir_tree(repo)?;
                out = Some(self.capture(handle, workspace, id, parent, tree, patch_ids)?);
            }
            SnapshotMode::ExistingCommit { handle, commit, .. } => {
                out = Some(self.adopt(handle, id, commit)?);
            }
        }

        out.ok_or_else(|| Error::OperationFailed("snapshot was not captured".to_string()))
    }

    /// Commit `tree` on top of `parent` as the snapshot's commit.
    fn capture(
        &self,
        handle: &RepoHandle,
        workspace: &Workspace,
        id: &str,
        parent: Oid,
        tree: Oid,
        patch_ids: Option<&Selection>,
    ) -> Result<Captured> {
        let repo = handle.repo();
        let config = self.engine.config();
        let parent_tree = git::commit_tree_id(repo, parent)?;

        let tree = match patch_ids {
            Some(ids) => {
                let decorator = Decorator::new()
                    .with_large_files(config.diff.large_file_threshold)
                    .with_selection(ids);
                let files = diff::diff_trees(
                    repo,
                    Some(parent_tree),
                    Some(tree),
                    config.diff.context_lines,
                    &decorator,
                )?;
                select::apply_to_tree(repo, parent_tree, &files)?
            }
            None => tree,
        };

        let author = self.engine.identity().author(&workspace.user_id);
        let commit = git::create_commit(repo, tree, &[parent], &author, &format!("snapshot {id}\n"))?;
        self.adopt(handle, id, commit)
    }

    /// Describe and pin an existing snapshot commit.
    fn adopt(&self, handle: &RepoHandle, id: &str, commit: Oid) -> Result<Captured> {
        let repo = handle.repo();
        let trees = single_parent_trees(repo, commit)?;
        let config = self.engine.config();
        let files = diff::diff_trees(
            repo,
            Some(trees.parent_tree),
            Some(trees.tree),
            config.diff.context_lines,
            &Decorator::new().with_large_files(config.diff.large_file_threshold),
        )?;
        repo.reference(&snapshot_ref(id), commit, true, "snapshot")?;

        Ok(Captured {
            commit,
            diffs_count: files.len(),
            changed_paths: files.into_iter().map(|f| f.preferred_name).collect(),
        })
    }

    fn make_latest(&self, workspace: &Workspace, snapshot: &Snapshot) -> Result<()> {
        let storage = self.engine.storage();
        storage.update_workspace(&workspace.id, |ws| {
            ws.latest_snapshot_id = Some(snapshot.id.clone());
            ws.diffs_count = snapshot.diffs_count;
            ws.updated_at = Utc::now();
            Ok(())
        })?;

        let events = self.engine.events();
        events.send(
            Event::new(EventKind::WorkspaceSnapshotUpdated, None)
                .about(Topic::Workspace(workspace.id.clone()))
                .about(Topic::User(workspace.user_id.clone())),
        );

        // someone else's view moved the owner's workspace
        let Some(view_id) = &snapshot.view_id else {
            return Ok(());
        };
        let view = storage.get_view(view_id)?;
        if view.user_id == workspace.user_id {
            return Ok(());
        }
        for other in storage.list_views(&workspace.codebase_id)? {
            if other.user_id == workspace.user_id && other.id != view.id {
                events.send(
                    Event::new(EventKind::ViewUpdated, Some(view.user_id.clone()))
                        .about(Topic::View(other.id.clone()))
                        .about(Topic::User(workspace.user_id.clone())),
                );
            }
        }
        Ok(())
    }

    /// Replay a snapshot's diff (optionally only some hunks) onto a fresh
    /// checkout of its parent and record the result for `target_workspace_id`.
    pub fn copy(
        &self,
        snapshot_id: &str,
        target_workspace_id: &str,
        patch_ids: Option<&Selection>,
        action: SnapshotAction,
        mark_as_latest: bool,
    ) -> Result<Snapshot> {
        let source = self.get(snapshot_id)?;
        let target = self.engine.storage().get_workspace(target_workspace_id)?;
        if target.codebase_id != source.codebase_id {
            return Err(Error::Validation(format!(
                "snapshot {snapshot_id} belongs to another codebase"
            )));
        }
        let trees = self.trees(&source)?;
        let config = self.engine.config();

        let mut out = None;
        self.engine
            .executor()
            .temporary_view(&source.codebase_id, trees.parent, "copy snapshot")
            .write(|handle| {
                let repo = handle.repo();
                let decorator = Decorator::new().with_large_files(config.diff.large_file_threshold);
                let mut files = diff::diff_trees(
                    repo,
                    Some(trees.parent_tree),
                    Some(trees.tree),
                    config.diff.context_lines,
                    &decorator,
                )?;
                if let Some(ids) = patch_ids {
                    let unknown = diff::unknown_ids(&files, ids);
                    if !unknown.is_empty() {
                        return Err(Error::StaleSelection(unknown));
                    }
                    files = diff::select_ids(files, ids);
                }

                let tree = select::apply_to_tree(repo, trees.parent_tree, &files)?;
                git::checkout_tree_keep_head(repo, tree)?;

                let mut options = SnapshotOptions::new().on_repo(handle);
                if mark_as_latest {
                    options = options.mark_as_latest();
                }
                out = self.snapshot(&target.id, action, options)?;
                Ok(())
            })
            .exec()?;

        out.ok_or_else(|| Error::OperationFailed("snapshot copy was not recorded".to_string()))
    }

    /// Files changed by a snapshot against its parent.
    pub fn diffs(&self, snapshot_id: &str, allower: &Allower) -> Result<Vec<FileDiff>> {
        let snapshot = self.get(snapshot_id)?;
        let trees = self.trees(&snapshot)?;
        self.diff_trees(&snapshot.codebase_id, trees.parent_tree, trees.tree, allower)
    }

    pub(crate) fn diff_trees(
        &self,
        codebase_id: &str,
        old: Oid,
        new: Oid,
        allower: &Allower,
    ) -> Result<Vec<FileDiff>> {
        let config = self.engine.config();
        let mut files = Vec::new();
        self.engine
            .executor()
            .trunk(codebase_id, "diff trees")
            .git_read(|handle| {
                let decorator = Decorator::new()
                    .with_large_files(config.diff.large_file_threshold)
                    .with_allower(allower);
                files = diff::diff_trees(
                    handle.repo(),
                    Some(old),
                    Some(new),
                    config.diff.context_lines,
                    &decorator,
                )?;
                Ok(())
            })
            .exec()?;
        Ok(files)
    }

    pub(crate) fn trees(&self, snapshot: &Snapshot) -> Result<SnapshotTrees> {
        let commit = parse_oid(&snapshot.commit_id)?;
        let mut out = None;
        self.engine
            .executor()
            .trunk(&snapshot.codebase_id, "snapshot trees")
            .git_read(|handle| {
                out = Some(single_parent_trees(handle.repo(), commit)?);
                Ok(())
            })
            .exec()?;
        out.ok_or_else(|| Error::SnapshotNotFound(snapshot.id.clone()))
    }
}

fn single_parent_trees(repo: &git2::Repository, commit: Oid) -> Result<SnapshotTrees> {
    let info = git::commit_info(repo, commit)?;
    let [parent] = info.parents.as_slice() else {
        return Err(Error::OperationFailed(format!(
            "snapshot commit {commit} has {} parents, expected 1",
            info.parents.len()
        )));
    };
    Ok(SnapshotTrees {
        parent: *parent,
        parent_tree: git::commit_tree_id(repo, *parent)?,
        tree: git::commit_tree_id(repo, commit)?,
    })
}

fn snapshot_error(err: Error) -> Error {
    match err {
        Error::Rebasing => Error::CantSnapshotRebasing,
        Error::UnexpectedBranch { actual, .. } => Error::CantSnapshotWrongBranch(actual),
        other => other,
    }
}
