//! The change ledger: landed history as parent-linked changes.
//!
//! Changes are imported lazily from mainline commits. Landing creates them
//! eagerly; anything else (history pushed from outside, a land interrupted
//! between the ref update and the insert) is imported on first lookup.
//!
//! Parent resolution follows the **first parent** only, which models what
//! was on mainline before a commit went in.

use chrono::{DateTime, Utc};
use git2::Oid;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::acl::Allower;
use crate::diff::{self, Decorator, FileDiff};
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::git::{self, CommitInfo, Trailer};
use crate::storage::Record;

/// Trailer naming the user a change was landed by
pub const USER_TRAILER: &str = "Mainline-User";

/// Trailer naming the view a change was landed from
pub const VIEW_TRAILER: &str = "Mainline-View";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub id: String,
    pub codebase_id: String,
    pub commit_id: String,
    #[serde(default)]
    pub parent_change_id: Option<String>,
    pub title: String,
    pub description: String,
    /// `None` when the commit could not be attributed to a known user
    pub user_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub git_created_at: DateTime<Utc>,
    pub git_creator_name: String,
    pub git_creator_email: String,
}

impl Record for Change {
    fn id(&self) -> &str {
        &self.id
    }
}

/// Message for a landed commit: description plus structured trailers.
pub fn land_message(description: &str, user_id: &str, view_id: Option<&str>) -> String {
    let mut trailers = vec![Trailer {
        key: USER_TRAILER.to_string(),
        value: user_id.to_string(),
    }];
    if let Some(view_id) = view_id {
        trailers.push(Trailer {
            key: VIEW_TRAILER.to_string(),
            value: view_id.to_string(),
        });
    }
    git::with_trailers(description, &trailers)
}

pub struct Ledger<'e> {
    engine: &'e Engine,
}

impl<'e> Ledger<'e> {
    pub(crate) fn new(engine: &'e Engine) -> Self {
        Self { engine }
    }

    /// Stored change for a commit, importing it if needed.
    ///
    /// The root commit of a trunk is not a change and yields `None`.
    pub fn lookup_or_import(&self, codebase_id: &str, commit: Oid) -> Result<Option<Change>> {
        let storage = self.engine.storage();
        if let Some(change) = storage.find_change_by_commit(codebase_id, &commit.to_string())? {
            return Ok(Some(change));
        }

        let info = self.commit_info(codebase_id, commit)?;
        if info.is_root_sentinel() {
            return Ok(None);
        }
        self.import(codebase_id, &info, None).map(Some)
    }

    fn commit_info(&self, codebase_id: &str, commit: Oid) -> Result<CommitInfo> {
        let mut info = None;
        self.engine
            .executor()
            .trunk(codebase_id, "read commit")
            .git_read(|handle| {
                info = Some(git::commit_info(handle.repo(), commit)?);
                Ok(())
            })
            .exec()?;
        info.ok_or_else(|| Error::ObjectNotFound(format!("commit {commit}")))
    }

    fn import(
        &self,
        codebase_id: &str,
        info: &CommitInfo,
        parent_change_id: Option<String>,
    ) -> Result<Change> {
        let trailers = git::parse_trailers(&info.message);
        let description = git::strip_trailers(&info.message);
        let title = description.lines().next().unwrap_or_default().trim().to_string();

        let identity = self.engine.identity();
        let user_id = git::find_trailer(&trailers, USER_TRAILER)
            .map(|trailer| trailer.value.clone())
            .filter(|user| identity.knows(user))
            .or_else(|| identity.user_by_email(&info.author.email));

        let change = Change {
            id: Uuid::new_v4().to_string(),
            codebase_id: codebase_id.to_string(),
            commit_id: info.id.to_string(),
            parent_change_id,
            title,
            description,
            user_id,
            created_at: Utc::now(),
            git_created_at: info.time,
            git_creator_name: info.author.name.clone(),
            git_creator_email: info.author.email.clone(),
        };

        let stored = self.engine.storage().insert_change_if_absent(change)?;
        debug!(change = %stored.id, commit = %stored.commit_id, "change imported");
        Ok(stored)
    }

    /// Resolve the parent change, persisting the pointer the first time.
    pub fn parent(&self, change: &Change) -> Result<Option<Change>> {
        let storage = self.engine.storage();
        if let Some(parent_id) = &change.parent_change_id {
            return storage.get_change(parent_id).map(Some);
        }

        let commit = parse_oid(&change.commit_id)?;
        let info = self.commit_info(&change.codebase_id, commit)?;
        let Some(first_parent) = info.parents.first() else {
            return Ok(None);
        };
        let Some(parent) = self.lookup_or_import(&change.codebase_id, *first_parent)? else {
            return Ok(None);
        };

        storage.set_change_parent(&change.id, &parent.id)?;
        Ok(Some(parent))
    }

    /// Change at the mainline tip, `None` on a trunk with only its root commit
    pub fn head(&self, codebase_id: &str) -> Result<Option<Change>> {
        let mainline = self.engine.config().mainline_branch.clone();
        let mut tip = None;
        self.engine
            .executor()
            .trunk(codebase_id, "mainline tip")
            .git_read(|handle| {
                tip = Some(git::branch_tip(handle.repo(), &mainline)?);
                Ok(())
            })
            .exec()?;
        match tip {
            Some(tip) => self.lookup_or_import(codebase_id, tip),
            None => Ok(None),
        }
    }

    /// Newest-first history from the mainline tip, at most `limit` changes.
    pub fn changelog(&self, codebase_id: &str, limit: usize) -> Result<Vec<Change>> {
        let mut out = Vec::new();
        let mut current = self.head(codebase_id)?;
        while let Some(change) = current {
            if out.len() >= limit {
                break;
            }
            current = self.parent(&change)?;
            out.push(change);
        }
        Ok(out)
    }

    /// Record a freshly landed commit whose git parent is `parent_commit`.
    pub fn create_with_commit_as_parent(
        &self,
        codebase_id: &str,
        commit: Oid,
        parent_commit: Oid,
    ) -> Result<Change> {
        let parent = self.lookup_or_import(codebase_id, parent_commit)?;
        self.create_with_change_as_parent(codebase_id, commit, parent.as_ref())
    }

    /// Record a freshly landed commit on top of a known change.
    pub fn create_with_change_as_parent(
        &self,
        codebase_id: &str,
        commit: Oid,
        parent: Option<&Change>,
    ) -> Result<Change> {
        let info = self.commit_info(codebase_id, commit)?;
        if info.is_root_sentinel() {
            return Err(Error::InvalidArgument(format!(
                "{commit} is the root commit"
            )));
        }
        self.import(codebase_id, &info, parent.map(|p| p.id.clone()))
    }

    pub fn get(&self, id: &str) -> Result<Change> {
        self.engine.storage().get_change(id)
    }

    /// Files changed by a change, against its parent or the empty tree.
    pub fn diffs(&self, change: &Change, allower: &Allower) -> Result<Vec<FileDiff>> {
        let parent = self.parent(change)?;
        let commit = parse_oid(&change.commit_id)?;
        let parent_commit = parent.map(|p| parse_oid(&p.commit_id)).transpose()?;
        let config = self.engine.config();

        let mut files = Vec::new();
        self.engine
            .executor()
            .trunk(&change.codebase_id, "change diffs")
            .git_read(|handle| {
                let repo = handle.repo();
                let old = parent_commit
                    .map(|oid| git::commit_tree_id(repo, oid))
                    .transpose()?;
                let new = git::commit_tree_id(repo, commit)?;
                let decorator = Decorator::new()
                    .with_large_files(config.diff.large_file_threshold)
                    .with_allower(allower);
                files = diff::diff_trees(repo, old, Some(new), config.diff.context_lines, &decorator)?;
                Ok(())
            })
            .exec()?;
        Ok(files)
    }
}

pub(crate) fn parse_oid(raw: &str) -> Result<Oid> {
    Oid::from_str(raw).map_err(|_| Error::InvalidArgument(format!("invalid commit id: {raw}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn land_message_carries_trailers() {
        let message = land_message("Add greeting", "u1", Some("v1"));
        let trailers = git::parse_trailers(&message);
        assert_eq!(
            git::find_trailer(&trailers, USER_TRAILER).map(|t| t.value.as_str()),
            Some("u1")
        );
        assert_eq!(
            git::find_trailer(&trailers, VIEW_TRAILER).map(|t| t.value.as_str()),
            Some("v1")
        );
        assert_eq!(git::strip_trailers(&message), "Add greeting");
    }
}
