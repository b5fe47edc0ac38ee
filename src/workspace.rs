//! Workspaces: isolated lines of work and the land operation.
//!
//! A workspace is a branch in the trunk (`refs/heads/<workspace_id>`) plus
//! content that lives either in a view (view-backed) or in its latest
//! snapshot (detached). Content is never read from both.
//!
//! Landing applies selected hunks onto the mainline tip as one commit, moves
//! mainline by compare-and-swap and records the change. Everything after the
//! change row is written is best effort: failures are logged, not returned.

use chrono::{DateTime, Utc};
use git2::{Oid, ResetType};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::acl::Allower;
use crate::config::Config;
use crate::diff::{self, select, Decorator, FileDiff, Selection};
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::events::{Event, EventKind, Topic};
use crate::executor::RepoHandle;
use crate::git;
use crate::jobs::Job;
use crate::ledger::{land_message, parse_oid, Change};
use crate::lock::{FileLock, LockKey};
use crate::merge::{self, MergeConflict};
use crate::snapshot::{Snapshot, SnapshotAction, SnapshotOptions};
use crate::storage::Record;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    pub id: String,
    pub codebase_id: String,
    pub user_id: String,
    pub name: String,
    #[serde(default)]
    pub draft_description: String,
    pub view_id: Option<String>,
    pub latest_snapshot_id: Option<String>,
    pub diffs_count: Option<usize>,
    /// Cached, see [`Workspaces::head_change`]
    pub head_change_id: Option<String>,
    #[serde(default)]
    pub head_change_computed: bool,
    /// Cached, see [`Workspaces::is_up_to_date`]
    pub up_to_date_with_mainline: Option<bool>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_landed_at: Option<DateTime<Utc>>,
    pub archived_at: Option<DateTime<Utc>>,
    pub unarchived_at: Option<DateTime<Utc>>,
}

impl Record for Workspace {
    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceState {
    /// Nothing captured or landed yet
    Fresh,
    Editing,
    Detached,
    /// Open in a view with nothing left after a land
    Landed,
    Archived,
}

impl Workspace {
    pub fn state(&self) -> WorkspaceState {
        if self.archived_at.is_some() {
            return WorkspaceState::Archived;
        }
        if self.latest_snapshot_id.is_none() && self.last_landed_at.is_none() {
            return WorkspaceState::Fresh;
        }
        match (&self.view_id, self.last_landed_at, self.diffs_count) {
            (Some(_), Some(_), Some(0)) => WorkspaceState::Landed,
            (Some(_), _, _) => WorkspaceState::Editing,
            (None, _, _) => WorkspaceState::Detached,
        }
    }

    pub fn is_detached(&self) -> bool {
        self.view_id.is_none()
    }
}

/// Code review collaborator
pub trait Reviews: Send + Sync {
    /// Dismiss every open review of a workspace, returning how many were open
    fn dismiss_all(&self, workspace_id: &str) -> Result<usize>;
}

#[derive(Debug, Clone, Default)]
pub struct NoReviews;

impl Reviews for NoReviews {
    fn dismiss_all(&self, _workspace_id: &str) -> Result<usize> {
        Ok(0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub name: Option<String>,
    /// Branch at this change instead of the mainline tip
    pub base_change_id: Option<String>,
    /// Seed the workspace with the inverse of this change
    pub revert_change_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LandRequest {
    pub workspace_id: String,
    pub actor: String,
    pub patch_ids: Selection,
    /// Defaults to the workspace's draft description
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LandOutcome {
    pub change: Change,
    pub workspace: Workspace,
    /// Files still changed in the workspace after the land
    pub remaining: usize,
}

/// Base commit and content tree of a workspace
#[derive(Debug, Clone, Copy)]
struct Content {
    base: Oid,
    base_tree: Oid,
    tree: Oid,
}

#[derive(Debug, Clone, Copy)]
struct Landed {
    tip: Oid,
    commit: Oid,
    /// Landed tree plus the unselected hunks; `None` if those hunks do not
    /// merge onto the landed commit
    remaining_tree: Option<Oid>,
}

pub struct Workspaces<'e> {
    engine: &'e Engine,
}

impl<'e> Workspaces<'e> {
    pub(crate) fn new(engine: &'e Engine) -> Self {
        Self { engine }
    }

    pub fn get(&self, id: &str) -> Result<Workspace> {
        self.engine.storage().get_workspace(id)
    }

    pub fn list(&self, codebase_id: &str) -> Result<Vec<Workspace>> {
        let mut workspaces = self.engine.storage().list_workspaces(codebase_id)?;
        workspaces.sort_by_key(|ws| ws.created_at);
        Ok(workspaces)
    }

    // =========================================================================
    // Creation
    // =========================================================================

    pub fn create(
        &self,
        codebase_id: &str,
        user_id: &str,
        options: &CreateOptions,
    ) -> Result<Workspace> {
        self.engine.storage().get_codebase(codebase_id)?;
        if options.base_change_id.is_some() && options.revert_change_id.is_some() {
            return Err(Error::Validation(
                "base change and revert change are exclusive".to_string(),
            ));
        }

        let ledger = self.engine.ledger();
        let revert = options
            .revert_change_id
            .as_deref()
            .map(|id| ledger.get(id))
            .transpose()?;
        let base_change = options
            .base_change_id
            .as_deref()
            .map(|id| ledger.get(id))
            .transpose()?;
        let from = revert.as_ref().or(base_change.as_ref());
        if let Some(change) = from {
            if change.codebase_id != codebase_id {
                return Err(Error::Validation(format!(
                    "change {} belongs to another codebase",
                    change.id
                )));
            }
        }
        let base = from.map(|change| parse_oid(&change.commit_id)).transpose()?;

        let name = match options.name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => match &revert {
                Some(change) => format!("Revert {}", change.title),
                None => "Untitled".to_string(),
            },
        };
        let draft = revert
            .as_ref()
            .map(|change| format!("Revert \"{}\"", change.title))
            .unwrap_or_default();

        let workspace = self.insert(codebase_id, user_id, name, draft, base)?;

        let Some(change) = revert else {
            return Ok(workspace);
        };
        let head = parse_oid(&change.commit_id)?;
        let parent = ledger
            .parent(&change)?
            .map(|parent| parse_oid(&parent.commit_id))
            .transpose()?;
        self.engine.snapshots().snapshot(
            &workspace.id,
            SnapshotAction::Revert,
            SnapshotOptions::new()
                .on_temporary_view()
                .revert(head, parent)
                .mark_as_latest(),
        )?;
        self.get(&workspace.id)
    }

    /// New workspace branched where `source_id` is, carrying its content.
    pub fn create_from_workspace(
        &self,
        source_id: &str,
        user_id: &str,
        name: Option<&str>,
    ) -> Result<Workspace> {
        let source = self.get(source_id)?;
        self.snapshot_live(&source)?;
        let source = self.get(source_id)?;

        let snapshots = self.engine.snapshots();
        let latest = source
            .latest_snapshot_id
            .as_deref()
            .map(|id| snapshots.get(id))
            .transpose()?;
        let base = match &latest {
            Some(snapshot) => snapshots.trees(snapshot)?.parent,
            None => self.branch_tip(&source)?,
        };

        let name = name
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(String::from)
            .unwrap_or_else(|| format!("{} (copy)", source.name));
        let workspace = self.insert(
            &source.codebase_id,
            user_id,
            name,
            source.draft_description.clone(),
            Some(base),
        )?;

        if let Some(snapshot) = latest {
            snapshots.copy(&snapshot.id, &workspace.id, None, SnapshotAction::Extract, true)?;
        }
        self.get(&workspace.id)
    }

    fn insert(
        &self,
        codebase_id: &str,
        user_id: &str,
        name: String,
        draft_description: String,
        base: Option<Oid>,
    ) -> Result<Workspace> {
        let id = Uuid::new_v4().to_string();
        let mainline = self.engine.config().mainline_branch.clone();
        self.engine
            .executor()
            .trunk(codebase_id, "create workspace")
            .git_write(|handle| {
                let repo = handle.repo();
                let base = match base {
                    Some(base) => base,
                    None => git::branch_tip(repo, &mainline)?,
                };
                git::set_branch(repo, &id, base, "create workspace")
            })
            .exec()?;

        let now = Utc::now();
        let workspace = Workspace {
            id,
            codebase_id: codebase_id.to_string(),
            user_id: user_id.to_string(),
            name,
            draft_description,
            view_id: None,
            latest_snapshot_id: None,
            diffs_count: None,
            head_change_id: None,
            head_change_computed: false,
            up_to_date_with_mainline: None,
            created_at: now,
            updated_at: now,
            last_landed_at: None,
            archived_at: None,
            unarchived_at: None,
        };
        self.engine.storage().insert_workspace(workspace.clone())?;
        info!(workspace = %workspace.id, codebase = %codebase_id, user = %user_id, "workspace created");
        self.notify(&workspace, Some(user_id));
        Ok(workspace)
    }

    // =========================================================================
    // Reading content
    // =========================================================================

    /// Commit the workspace branch points at
    pub(crate) fn branch_tip(&self, workspace: &Workspace) -> Result<Oid> {
        let mut tip = None;
        self.engine
            .executor()
            .trunk(&workspace.codebase_id, "workspace tip")
            .git_read(|handle| {
                tip = Some(git::branch_tip(handle.repo(), &workspace.id)?);
                Ok(())
            })
            .exec()?;
        tip.ok_or_else(|| Error::ObjectNotFound(format!("branch {}", workspace.id)))
    }

    /// Live tree for view-backed workspaces, latest snapshot otherwise.
    fn content(&self, workspace: &Workspace, allow_rebasing: bool) -> Result<Option<Content>> {
        if let Some(view_id) = &workspace.view_id {
            return self.live_content(workspace, view_id, allow_rebasing).map(Some);
        }
        let Some(latest) = &workspace.latest_snapshot_id else {
            return Ok(None);
        };
        let snapshots = self.engine.snapshots();
        let trees = snapshots.trees(&snapshots.get(latest)?)?;
        Ok(Some(Content {
            base: trees.parent,
            base_tree: trees.parent_tree,
            tree: trees.tree,
        }))
    }

    fn live_content(
        &self,
        workspace: &Workspace,
        view_id: &str,
        allow_rebasing: bool,
    ) -> Result<Content> {
        let mut out = None;
        let chain = self
            .engine
            .executor()
            .view(&workspace.codebase_id, view_id, "capture workspace")
            .assert_branch(&workspace.id);
        let chain = if allow_rebasing {
            chain.allow_rebasing()
        } else {
            chain
        };
        chain
            .read(|handle| {
                let repo = handle.repo();
                let base = git::head_commit(repo)?;
                out = Some(Content {
                    base,
                    base_tree: git::commit_tree_id(repo, base)?,
                    tree: git::workdir_tree(repo)?,
                });
                Ok(())
            })
            .exec()?;
        out.ok_or_else(|| Error::OperationFailed("workspace content was not captured".to_string()))
    }

    /// Files changed in the workspace, as `allower` may see them.
    ///
    /// The tree is captured under the view lock; decoration happens after.
    pub fn diffs(&self, workspace_id: &str, allower: &Allower) -> Result<Vec<FileDiff>> {
        let workspace = self.get(workspace_id)?;
        match self.content(&workspace, true)? {
            Some(content) => self.engine.snapshots().diff_trees(
                &workspace.codebase_id,
                content.base_tree,
                content.tree,
                allower,
            ),
            None => Ok(Vec::new()),
        }
    }

    /// Unfiltered and allower-filtered diffs of the same pair of trees.
    fn full_and_visible(
        &self,
        codebase_id: &str,
        old: Oid,
        new: Oid,
        allower: &Allower,
    ) -> Result<(Vec<FileDiff>, Vec<FileDiff>)> {
        let config = self.engine.config();
        let mut out = None;
        self.engine
            .executor()
            .trunk(codebase_id, "selection diff")
            .git_read(|handle| {
                out = Some(full_and_visible(handle.repo(), config, old, new, allower)?);
                Ok(())
            })
            .exec()?;
        out.ok_or_else(|| Error::OperationFailed("selection diff was not computed".to_string()))
    }

    // =========================================================================
    // Landing
    // =========================================================================

    /// Land the selected hunks of a workspace on mainline.
    pub fn land(&self, request: &LandRequest) -> Result<LandOutcome> {
        let storage = self.engine.storage();
        let workspace = self.get(&request.workspace_id)?;
        let codebase_id = workspace.codebase_id.clone();
        let _land_lock = FileLock::acquire(
            storage.lock_file(&codebase_id, &LockKey::Land(workspace.id.clone())),
            storage.lock_timeout_ms(),
        )?;
        let workspace = self.get(&request.workspace_id)?;

        if workspace.archived_at.is_some() {
            return Err(Error::Validation(format!(
                "workspace {} is archived",
                workspace.id
            )));
        }
        if request.patch_ids.is_empty() {
            return Err(Error::Validation("nothing selected to land".to_string()));
        }
        let description = request
            .description
            .clone()
            .unwrap_or_else(|| workspace.draft_description.clone());
        if description.trim().is_empty() {
            return Err(Error::Validation(
                "a description is required to land".to_string(),
            ));
        }

        let Some(content) = self.content(&workspace, false)? else {
            return Err(Error::StaleSelection(sorted(&request.patch_ids)));
        };
        let allower = self.engine.allower_for(&request.actor, &codebase_id)?;
        let (full, visible) =
            self.full_and_visible(&codebase_id, content.base_tree, content.tree, &allower)?;
        let unknown = diff::unknown_ids(&visible, &request.patch_ids);
        if !unknown.is_empty() {
            return Err(Error::StaleSelection(unknown));
        }
        let remaining = select::exclude(&full, &request.patch_ids);
        let selected = diff::select_ids(full, &request.patch_ids);

        let mainline = self.engine.config().mainline_branch.clone();
        let author = self.engine.identity().author(&request.actor);
        let message = land_message(&description, &request.actor, workspace.view_id.as_deref());
        let mut landed = None;
        self.engine
            .executor()
            .trunk(&codebase_id, "land")
            .git_write(|handle| {
                let repo = handle.repo();
                let tip = git::branch_tip(repo, &mainline)?;
                let tip_tree = git::commit_tree_id(repo, tip)?;
                // the selection is a diff against the workspace base, which
                // mainline may have moved past
                let selected_tree = select::apply_to_tree(repo, content.base_tree, &selected)?;
                let tree = merge::merge_trees(repo, content.base_tree, selected_tree, tip_tree)?;
                if tree == tip_tree {
                    return Err(Error::StaleSelection(sorted(&request.patch_ids)));
                }
                let commit = git::create_commit(repo, tree, &[tip], &author, &message)?;
                let remaining_tree =
                    match merge::merge_trees(repo, selected_tree, content.tree, tree) {
                        Ok(tree) => Some(tree),
                        Err(err) => {
                            warn!(
                                workspace = %workspace.id,
                                error = %err,
                                "unselected hunks do not merge onto the landed commit"
                            );
                            None
                        }
                    };
                git::compare_and_swap_branch(repo, &mainline, commit, tip, "land")?;
                landed = Some(Landed {
                    tip,
                    commit,
                    remaining_tree,
                });
                Ok(())
            })
            .exec()?;
        let landed = landed
            .ok_or_else(|| Error::OperationFailed("land produced no commit".to_string()))?;

        let change = self
            .engine
            .ledger()
            .create_with_commit_as_parent(&codebase_id, landed.commit, landed.tip)?;
        info!(
            change = %change.id,
            commit = %landed.commit,
            workspace = %workspace.id,
            actor = %request.actor,
            "change landed"
        );

        if let Err(err) = self.propagate(&workspace, &landed, remaining.len()) {
            warn!(workspace = %workspace.id, error = %err, "failed to update workspace after land");
        }
        if let Err(err) = self.engine.reviews().dismiss_all(&workspace.id) {
            warn!(workspace = %workspace.id, error = %err, "failed to dismiss reviews");
        }
        if let Err(err) = self.invalidate_after_land(&workspace) {
            warn!(workspace = %workspace.id, error = %err, "failed to reset workspace caches");
        }
        self.enqueue_after_land(&workspace, &change);
        self.announce_land(&workspace, &change, &request.actor);

        Ok(LandOutcome {
            change,
            workspace: self.get(&workspace.id)?,
            remaining: remaining.len(),
        })
    }

    /// Move the workspace onto the landed commit, keeping what was not landed.
    fn propagate(&self, workspace: &Workspace, landed: &Landed, remaining: usize) -> Result<()> {
        let storage = self.engine.storage();
        let executor = self.engine.executor();

        if let Some(view_id) = &workspace.view_id {
            executor
                .view(&workspace.codebase_id, view_id, "land propagate")
                .assert_branch(&workspace.id)
                .write(|handle| {
                    let repo = handle.repo();
                    // the working tree is already tip + landed + remaining
                    if git::head_commit(repo)? == landed.tip {
                        return git::reset(repo, landed.commit, ResetType::Mixed);
                    }
                    match landed.remaining_tree {
                        Some(tree) => {
                            git::reset(repo, landed.commit, ResetType::Hard)?;
                            git::checkout_tree_keep_head(repo, tree)
                        }
                        None => {
                            // files stay as left, now diffed against the landed commit
                            warn!(
                                view = %view_id,
                                "unselected hunks kept on disk over the landed commit"
                            );
                            git::reset(repo, landed.commit, ResetType::Mixed)
                        }
                    }
                })
                .exec()?;
            let diffs_count = landed.remaining_tree.map(|_| remaining);
            storage.update_workspace(&workspace.id, |ws| {
                ws.diffs_count = diffs_count;
                Ok(())
            })?;
            return Ok(());
        }

        let remaining_tree = match (remaining, landed.remaining_tree) {
            (0, _) => None,
            (_, Some(tree)) => Some(tree),
            (_, None) => {
                warn!(
                    workspace = %workspace.id,
                    snapshot = ?workspace.latest_snapshot_id,
                    "unselected hunks dropped from the workspace; they stay in the previous snapshot"
                );
                None
            }
        };

        executor
            .trunk(&workspace.codebase_id, "land move workspace")
            .git_write(|handle| git::set_branch(handle.repo(), &workspace.id, landed.commit, "land"))
            .exec()?;

        match remaining_tree {
            Some(tree) => {
                executor
                    .temporary_view(&workspace.codebase_id, landed.commit, "land baseline")
                    .write(|handle| {
                        git::checkout_tree_keep_head(handle.repo(), tree)?;
                        self.engine.snapshots().snapshot(
                            &workspace.id,
                            SnapshotAction::LandBaseline,
                            SnapshotOptions::new().on_repo(handle).mark_as_latest(),
                        )?;
                        Ok(())
                    })
                    .exec()?;
            }
            None => {
                storage.update_workspace(&workspace.id, |ws| {
                    ws.latest_snapshot_id = None;
                    ws.diffs_count = Some(0);
                    Ok(())
                })?;
            }
        }
        Ok(())
    }

    fn invalidate_after_land(&self, workspace: &Workspace) -> Result<()> {
        let storage = self.engine.storage();
        storage.update_codebase_workspaces(&workspace.codebase_id, |ws| {
            ws.up_to_date_with_mainline = None;
        })?;
        storage.update_workspace(&workspace.id, |ws| {
            let now = Utc::now();
            ws.draft_description.clear();
            ws.head_change_id = None;
            ws.head_change_computed = false;
            ws.last_landed_at = Some(now);
            ws.updated_at = now;
            Ok(())
        })?;
        Ok(())
    }

    fn enqueue_after_land(&self, workspace: &Workspace, change: &Change) {
        let jobs = self.engine.jobs();
        if workspace.view_id.is_some() {
            if let Err(err) = jobs.enqueue(Job::SnapshotRefresh {
                codebase_id: workspace.codebase_id.clone(),
                workspace_id: workspace.id.clone(),
            }) {
                warn!(workspace = %workspace.id, error = %err, "failed to enqueue snapshot refresh");
            }
        }
        if let Err(err) = jobs.enqueue(Job::BuildChange {
            codebase_id: workspace.codebase_id.clone(),
            change_id: change.id.clone(),
        }) {
            warn!(change = %change.id, error = %err, "failed to enqueue build");
        }
    }

    fn announce_land(&self, workspace: &Workspace, change: &Change, actor: &str) {
        let events = self.engine.events();
        let landed = Event::new(EventKind::ChangeLanded, Some(actor.to_string()))
            .about(Topic::Codebase(workspace.codebase_id.clone()))
            .about(Topic::Workspace(workspace.id.clone()))
            .with_data(serde_json::json!({
                "change_id": change.id,
                "commit_id": change.commit_id,
            }));
        match landed {
            Ok(event) => events.send(event),
            Err(err) => warn!(change = %change.id, error = %err, "failed to encode land event"),
        }
        self.notify(workspace, Some(actor));
        events.send(
            Event::new(EventKind::CodebaseUpdated, Some(actor.to_string()))
                .about(Topic::Codebase(workspace.codebase_id.clone())),
        );
    }

    // =========================================================================
    // Conflicts and derived state
    // =========================================================================

    /// Conflicts between the workspace content and the mainline tip.
    ///
    /// Empty for a detached workspace without snapshots and for a view in
    /// the middle of a rebase.
    pub fn conflicts(&self, workspace_id: &str) -> Result<Vec<MergeConflict>> {
        let workspace = self.get(workspace_id)?;
        let content = match self.content(&workspace, false) {
            Ok(Some(content)) => content,
            Ok(None) | Err(Error::Rebasing) => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };

        let mainline = self.engine.config().mainline_branch.clone();
        let mut conflicts = Vec::new();
        self.engine
            .executor()
            .trunk(&workspace.codebase_id, "conflicts")
            .git_read(|handle| {
                let repo = handle.repo();
                let tip = git::branch_tip(repo, &mainline)?;
                conflicts = merge::predict_conflicts(repo, content.base, content.tree, tip)?;
                Ok(())
            })
            .exec()?;
        Ok(conflicts)
    }

    pub fn has_conflicts(&self, workspace_id: &str) -> Result<bool> {
        Ok(!self.conflicts(workspace_id)?.is_empty())
    }

    /// Change the workspace is based on, `None` when its base is not on mainline.
    pub fn head_change(&self, workspace_id: &str) -> Result<Option<Change>> {
        let workspace = self.get(workspace_id)?;
        let ledger = self.engine.ledger();
        if workspace.head_change_computed {
            return workspace
                .head_change_id
                .as_deref()
                .map(|id| ledger.get(id))
                .transpose();
        }

        let mainline = self.engine.config().mainline_branch.clone();
        let mut found = None;
        self.engine
            .executor()
            .trunk(&workspace.codebase_id, "head change")
            .git_read(|handle| {
                let repo = handle.repo();
                let base = git::branch_tip(repo, &workspace.id)?;
                let tip = git::branch_tip(repo, &mainline)?;
                found = Some((base, git::contains_commit(repo, tip, base)?));
                Ok(())
            })
            .exec()?;

        let change = match found {
            Some((base, true)) => ledger.lookup_or_import(&workspace.codebase_id, base)?,
            _ => None,
        };
        self.engine.storage().update_workspace(&workspace.id, |ws| {
            ws.head_change_id = change.as_ref().map(|c| c.id.clone());
            ws.head_change_computed = true;
            Ok(())
        })?;
        Ok(change)
    }

    /// Whether the workspace base contains the mainline tip.
    pub fn is_up_to_date(&self, workspace_id: &str) -> Result<bool> {
        let workspace = self.get(workspace_id)?;
        if let Some(cached) = workspace.up_to_date_with_mainline {
            return Ok(cached);
        }

        let mainline = self.engine.config().mainline_branch.clone();
        let mut up_to_date = false;
        self.engine
            .executor()
            .trunk(&workspace.codebase_id, "up to date")
            .git_read(|handle| {
                let repo = handle.repo();
                let base = git::branch_tip(repo, &workspace.id)?;
                let tip = git::branch_tip(repo, &mainline)?;
                up_to_date = git::contains_commit(repo, base, tip)?;
                Ok(())
            })
            .exec()?;

        self.engine.storage().update_workspace(&workspace.id, |ws| {
            ws.up_to_date_with_mainline = Some(up_to_date);
            Ok(())
        })?;
        Ok(up_to_date)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Archive a workspace, detaching it from its view after a last snapshot.
    pub fn archive(&self, workspace_id: &str) -> Result<Workspace> {
        let workspace = self.get(workspace_id)?;
        if workspace.archived_at.is_some() {
            return Ok(workspace);
        }
        if let Some(view_id) = &workspace.view_id {
            let views = self.engine.views();
            views.release(&views.get(view_id)?, workspace_id)?;
        }
        let workspace = self.engine.storage().update_workspace(workspace_id, |ws| {
            let now = Utc::now();
            ws.archived_at = Some(now);
            ws.updated_at = now;
            Ok(())
        })?;
        info!(workspace = %workspace_id, "workspace archived");
        self.notify(&workspace, None);
        Ok(workspace)
    }

    pub fn unarchive(&self, workspace_id: &str) -> Result<Workspace> {
        let workspace = self.get(workspace_id)?;
        if workspace.archived_at.is_none() {
            return Err(Error::Validation(format!(
                "workspace {workspace_id} is not archived"
            )));
        }
        let workspace = self.engine.storage().update_workspace(workspace_id, |ws| {
            let now = Utc::now();
            ws.archived_at = None;
            ws.unarchived_at = Some(now);
            ws.updated_at = now;
            Ok(())
        })?;
        info!(workspace = %workspace_id, "workspace unarchived");
        self.notify(&workspace, None);
        Ok(workspace)
    }

    pub fn set_draft_description(&self, workspace_id: &str, description: &str) -> Result<Workspace> {
        let workspace = self.engine.storage().update_workspace(workspace_id, |ws| {
            ws.draft_description = description.to_string();
            ws.updated_at = Utc::now();
            Ok(())
        })?;
        self.notify(&workspace, None);
        Ok(workspace)
    }

    /// Snapshot the live view of a workspace, ignoring the sync throttle.
    ///
    /// Detached workspaces have nothing live to capture and yield `None`.
    pub fn refresh_snapshot(&self, workspace_id: &str) -> Result<Option<Snapshot>> {
        let workspace = self.get(workspace_id)?;
        self.snapshot_live(&workspace)
    }

    fn snapshot_live(&self, workspace: &Workspace) -> Result<Option<Snapshot>> {
        let Some(view_id) = &workspace.view_id else {
            return Ok(None);
        };
        self.engine.snapshots().snapshot(
            &workspace.id,
            SnapshotAction::Sync,
            SnapshotOptions::new().on_view(view_id).skip_throttle(),
        )
    }

    // =========================================================================
    // Patch surgery
    // =========================================================================

    /// Undo the selected hunks in a workspace.
    pub fn remove_patches(
        &self,
        workspace_id: &str,
        actor: &str,
        patch_ids: &Selection,
    ) -> Result<Option<Snapshot>> {
        let workspace = self.get(workspace_id)?;
        if patch_ids.is_empty() {
            return Err(Error::Validation("nothing selected to remove".to_string()));
        }
        let allower = self.engine.allower_for(actor, &workspace.codebase_id)?;
        let config = self.engine.config();
        let snapshots = self.engine.snapshots();
        let mut out = None;

        let rewrite = |handle: &RepoHandle, base_tree: Oid, tree: Oid| -> Result<()> {
            let repo = handle.repo();
            let (full, visible) = full_and_visible(repo, config, base_tree, tree, &allower)?;
            let unknown = diff::unknown_ids(&visible, patch_ids);
            if !unknown.is_empty() {
                return Err(Error::StaleSelection(unknown));
            }
            let kept = select::apply_to_tree(repo, base_tree, &select::exclude(&full, patch_ids))?;
            git::checkout_tree_keep_head(repo, kept)
        };

        match &workspace.view_id {
            Some(view_id) => {
                self.engine
                    .executor()
                    .view(&workspace.codebase_id, view_id, "remove patches")
                    .assert_branch(&workspace.id)
                    .write(|handle| {
                        let repo = handle.repo();
                        let base_tree = git::commit_tree_id(repo, git::head_commit(repo)?)?;
                        rewrite(handle, base_tree, git::workdir_tree(repo)?)?;
                        out = snapshots.snapshot(
                            &workspace.id,
                            SnapshotAction::UndoPatch,
                            SnapshotOptions::new().on_repo(handle),
                        )?;
                        Ok(())
                    })
                    .exec()?;
            }
            None => {
                let Some(latest) = &workspace.latest_snapshot_id else {
                    return Err(Error::StaleSelection(sorted(patch_ids)));
                };
                let trees = snapshots.trees(&snapshots.get(latest)?)?;
                self.engine
                    .executor()
                    .temporary_view(&workspace.codebase_id, trees.parent, "remove patches")
                    .write(|handle| {
                        rewrite(handle, trees.parent_tree, trees.tree)?;
                        out = snapshots.snapshot(
                            &workspace.id,
                            SnapshotAction::UndoPatch,
                            SnapshotOptions::new().on_repo(handle).mark_as_latest(),
                        )?;
                        Ok(())
                    })
                    .exec()?;
            }
        }
        Ok(out)
    }

    /// Apply hunks of `source_id` to `target_id`.
    pub fn copy_patches(
        &self,
        target_id: &str,
        source_id: &str,
        actor: &str,
        patch_ids: &Selection,
    ) -> Result<Option<Snapshot>> {
        let target = self.get(target_id)?;
        let source = self.get(source_id)?;
        if target.codebase_id != source.codebase_id {
            return Err(Error::Validation(
                "workspaces belong to different codebases".to_string(),
            ));
        }
        if target.archived_at.is_some() {
            return Err(Error::Validation(format!("workspace {target_id} is archived")));
        }
        if patch_ids.is_empty() {
            return Err(Error::Validation("nothing selected to copy".to_string()));
        }

        self.snapshot_live(&source)?;
        let source = self.get(source_id)?;
        let Some(latest) = &source.latest_snapshot_id else {
            return Err(Error::StaleSelection(sorted(patch_ids)));
        };
        let snapshots = self.engine.snapshots();
        let trees = snapshots.trees(&snapshots.get(latest)?)?;

        let allower = self.engine.allower_for(actor, &source.codebase_id)?;
        let (full, visible) =
            self.full_and_visible(&source.codebase_id, trees.parent_tree, trees.tree, &allower)?;
        let unknown = diff::unknown_ids(&visible, patch_ids);
        if !unknown.is_empty() {
            return Err(Error::StaleSelection(unknown));
        }
        let selected = diff::select_ids(full, patch_ids);

        let mut out = None;
        let apply = |handle: &RepoHandle, current: Oid| -> Result<()> {
            let repo = handle.repo();
            let tree = select::apply_to_tree(repo, current, &selected)?;
            git::checkout_tree_keep_head(repo, tree)
        };

        match &target.view_id {
            Some(view_id) => {
                self.engine
                    .executor()
                    .view(&target.codebase_id, view_id, "copy patches")
                    .assert_branch(&target.id)
                    .write(|handle| {
                        apply(handle, git::workdir_tree(handle.repo())?)?;
                        out = snapshots.snapshot(
                            &target.id,
                            SnapshotAction::Extract,
                            SnapshotOptions::new().on_repo(handle),
                        )?;
                        Ok(())
                    })
                    .exec()?;
            }
            None => {
                let (base, current) = match &target.latest_snapshot_id {
                    Some(latest) => {
                        let trees = snapshots.trees(&snapshots.get(latest)?)?;
                        (trees.parent, Some(trees.tree))
                    }
                    None => (self.branch_tip(&target)?, None),
                };
                self.engine
                    .executor()
                    .temporary_view(&target.codebase_id, base, "copy patches")
                    .write(|handle| {
                        let repo = handle.repo();
                        let current = match current {
                            Some(tree) => tree,
                            None => git::commit_tree_id(repo, base)?,
                        };
                        apply(handle, current)?;
                        out = snapshots.snapshot(
                            &target.id,
                            SnapshotAction::Extract,
                            SnapshotOptions::new().on_repo(handle).mark_as_latest(),
                        )?;
                        Ok(())
                    })
                    .exec()?;
            }
        }
        Ok(out)
    }

    fn notify(&self, workspace: &Workspace, actor: Option<&str>) {
        self.engine.events().send(
            Event::new(EventKind::WorkspaceUpdated, actor.map(String::from))
                .about(Topic::Workspace(workspace.id.clone()))
                .about(Topic::User(workspace.user_id.clone()))
                .about(Topic::Codebase(workspace.codebase_id.clone())),
        );
    }
}

fn full_and_visible(
    repo: &git2::Repository,
    config: &Config,
    old: Oid,
    new: Oid,
    allower: &Allower,
) -> Result<(Vec<FileDiff>, Vec<FileDiff>)> {
    let decorator = Decorator::new().with_large_files(config.diff.large_file_threshold);
    let full = diff::diff_trees(
        repo,
        Some(old),
        Some(new),
        config.diff.context_lines,
        &decorator,
    )?;
    let visible = diff::diff_trees(
        repo,
        Some(old),
        Some(new),
        config.diff.context_lines,
        &decorator.with_allower(allower),
    )?;
    Ok((full, visible))
}

fn sorted(ids: &Selection) -> Vec<String> {
    let mut ids: Vec<String> = ids.iter().cloned().collect();
    ids.sort();
    ids
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace() -> Workspace {
        let now = Utc::now();
        Workspace {
            id: "ws".into(),
            codebase_id: "cb".into(),
            user_id: "u1".into(),
            name: "demo".into(),
            draft_description: String::new(),
            view_id: None,
            latest_snapshot_id: None,
            diffs_count: None,
            head_change_id: None,
            head_change_computed: false,
            up_to_date_with_mainline: None,
            created_at: now,
            updated_at: now,
            last_landed_at: None,
            archived_at: None,
            unarchived_at: None,
        }
    }

    #[test]
    fn state_follows_lifecycle() {
        let mut ws = workspace();
        assert_eq!(ws.state(), WorkspaceState::Fresh);

        ws.view_id = Some("v1".into());
        ws.latest_snapshot_id = Some("s1".into());
        ws.diffs_count = Some(2);
        assert_eq!(ws.state(), WorkspaceState::Editing);

        ws.last_landed_at = Some(Utc::now());
        ws.diffs_count = Some(0);
        assert_eq!(ws.state(), WorkspaceState::Landed);

        ws.view_id = None;
        assert_eq!(ws.state(), WorkspaceState::Detached);

        ws.archived_at = Some(Utc::now());
        assert_eq!(ws.state(), WorkspaceState::Archived);
    }

    #[test]
    fn selection_errors_list_ids_sorted() {
        let ids: Selection = ["b", "a"].iter().map(|s| s.to_string()).collect();
        assert_eq!(sorted(&ids), vec!["a".to_string(), "b".to_string()]);
    }
}
