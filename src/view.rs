//! Views: durable per-user checkouts of a codebase.
//!
//! A view is a worktree of the trunk. While a workspace is open in it, HEAD
//! is the workspace branch and the working tree is the workspace content.
//! Otherwise HEAD is detached. git refuses to check out one branch in two
//! worktrees, so a workspace is open in at most one view at a time.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use git2::ResetType;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::events::{Event, EventKind, Topic};
use crate::git;
use crate::snapshot::{SnapshotAction, SnapshotOptions};
use crate::storage::Record;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct View {
    pub id: String,
    pub codebase_id: String,
    pub user_id: String,
    pub workspace_id: Option<String>,
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
}

impl Record for View {
    fn id(&self) -> &str {
        &self.id
    }
}

pub struct Views<'e> {
    engine: &'e Engine,
}

impl<'e> Views<'e> {
    pub(crate) fn new(engine: &'e Engine) -> Self {
        Self { engine }
    }

    pub fn get(&self, id: &str) -> Result<View> {
        self.engine.storage().get_view(id)
    }

    pub fn list(&self, codebase_id: &str) -> Result<Vec<View>> {
        self.engine.storage().list_views(codebase_id)
    }

    /// Create an empty view for `user_id`, detached at the mainline tip.
    pub fn create(&self, codebase_id: &str, user_id: &str) -> Result<View> {
        let storage = self.engine.storage();
        storage.get_codebase(codebase_id)?;

        let id = Uuid::new_v4().to_string();
        let path = storage.view_dir(&id);
        let mainline = self.engine.config().mainline_branch.clone();
        self.engine
            .executor()
            .trunk(codebase_id, "create view")
            .git_write(|handle| {
                let repo = handle.repo();
                let tip = git::branch_tip(repo, &mainline)?;
                git::add_detached_worktree(repo, &id, &path, tip)
            })
            .exec()?;

        let view = View {
            id,
            codebase_id: codebase_id.to_string(),
            user_id: user_id.to_string(),
            workspace_id: None,
            path,
            created_at: Utc::now(),
        };
        storage.insert_view(view.clone())?;
        info!(view = %view.id, codebase = %codebase_id, user = %user_id, "view created");
        self.notify(&view);
        Ok(view)
    }

    /// Open a workspace in a view.
    ///
    /// Whatever the view had open is snapshotted and detached first. If
    /// another view holds the workspace, that view is snapshotted and
    /// detached too. The workspace's latest snapshot is then checked out.
    pub fn open_workspace(&self, view_id: &str, workspace_id: &str) -> Result<View> {
        let storage = self.engine.storage();
        let view = self.get(view_id)?;
        let workspace = storage.get_workspace(workspace_id)?;

        if workspace.codebase_id != view.codebase_id {
            return Err(Error::Validation(format!(
                "workspace {workspace_id} belongs to another codebase"
            )));
        }
        if workspace.archived_at.is_some() {
            return Err(Error::Validation(format!(
                "workspace {workspace_id} is archived"
            )));
        }
        if view.workspace_id.as_deref() == Some(workspace_id) {
            return Ok(view);
        }

        if let Some(previous) = &view.workspace_id {
            self.release(&view, previous)?;
        }
        if let Some(holder) = workspace.view_id.as_deref().filter(|id| *id != view_id) {
            match self.get(holder) {
                Ok(holder) => self.release(&holder, workspace_id)?,
                Err(err) if err.is_not_found() => self.unbind(None, workspace_id)?,
                Err(err) => return Err(err),
            }
        }

        // releasing took a final snapshot
        let workspace = storage.get_workspace(workspace_id)?;
        let latest = match &workspace.latest_snapshot_id {
            Some(id) => {
                let snapshots = self.engine.snapshots();
                Some(snapshots.trees(&snapshots.get(id)?)?)
            }
            None => None,
        };

        self.engine
            .executor()
            .view(&view.codebase_id, view_id, "open workspace")
            .write(|handle| {
                let repo = handle.repo();
                repo.set_head(&git::branch_ref(workspace_id))?;
                let base = git::branch_tip(repo, workspace_id)?;
                git::reset(repo, base, ResetType::Hard)?;
                // also clears files the previous workspace left untracked
                let tree = match latest {
                    Some(trees) => trees.tree,
                    None => git::commit_tree_id(repo, base)?,
                };
                git::checkout_tree_keep_head(repo, tree)
            })
            .exec()?;

        let view = storage.update_view(view_id, |view| {
            view.workspace_id = Some(workspace_id.to_string());
            Ok(())
        })?;
        let workspace = storage.update_workspace(workspace_id, |ws| {
            ws.view_id = Some(view_id.to_string());
            ws.updated_at = Utc::now();
            Ok(())
        })?;

        info!(view = %view_id, workspace = %workspace_id, "workspace opened");
        self.notify(&view);
        self.engine.events().send(
            Event::new(EventKind::WorkspaceUpdated, Some(view.user_id.clone()))
                .about(Topic::Workspace(workspace.id.clone()))
                .about(Topic::User(workspace.user_id.clone())),
        );
        Ok(view)
    }

    /// Snapshot and detach whatever workspace is open in the view.
    pub fn close(&self, view_id: &str) -> Result<View> {
        let view = self.get(view_id)?;
        if let Some(workspace_id) = &view.workspace_id {
            self.release(&view, workspace_id)?;
        }
        let view = self.get(view_id)?;
        self.notify(&view);
        Ok(view)
    }

    /// Take a final snapshot of `workspace_id` on `view`, detach HEAD and
    /// unbind the pair. The workspace becomes detached.
    pub(crate) fn release(&self, view: &View, workspace_id: &str) -> Result<()> {
        let workspace = self.engine.storage().get_workspace(workspace_id)?;
        if workspace.view_id.as_deref() == Some(view.id.as_str()) {
            self.engine.snapshots().snapshot(
                workspace_id,
                SnapshotAction::Sync,
                SnapshotOptions::new().on_view(&view.id).skip_throttle(),
            )?;
        }

        self.engine
            .executor()
            .view(&view.codebase_id, &view.id, "detach view")
            .allow_rebasing()
            .git_write(|handle| git::detach_head(handle.repo()))
            .exec()?;

        self.unbind(Some(&view.id), workspace_id)?;
        info!(view = %view.id, workspace = %workspace_id, "workspace detached");
        self.engine.events().send(
            Event::new(EventKind::WorkspaceUpdated, Some(view.user_id.clone()))
                .about(Topic::Workspace(workspace_id.to_string()))
                .about(Topic::User(workspace.user_id.clone())),
        );
        Ok(())
    }

    fn unbind(&self, view_id: Option<&str>, workspace_id: &str) -> Result<()> {
        let storage = self.engine.storage();
        if let Some(view_id) = view_id {
            storage.update_view(view_id, |view| {
                if view.workspace_id.as_deref() == Some(workspace_id) {
                    view.workspace_id = None;
                }
                Ok(())
            })?;
        }
        storage.update_workspace(workspace_id, |ws| {
            if view_id.is_none() || ws.view_id.as_deref() == view_id {
                ws.view_id = None;
                ws.updated_at = Utc::now();
            }
            Ok(())
        })?;
        Ok(())
    }

    fn notify(&self, view: &View) {
        self.engine.events().send(
            Event::new(EventKind::ViewUpdated, Some(view.user_id.clone()))
                .about(Topic::View(view.id.clone()))
                .about(Topic::User(view.user_id.clone())),
        );
    }
}
