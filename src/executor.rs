//! Serialized, precondition-checked access to codebase repositories.
//!
//! All repository I/O runs as a chain of stages against one target:
//!
//! - **Trunk**: the shared repository holding mainline and workspace branches.
//!   Metadata only.
//! - **View**: a durable worktree owned by one user.
//! - **Temporary view**: a worktree created for one chain and removed when
//!   the chain ends, whether it succeeds, fails or panics.
//!
//! A chain holds the target's file lock for its whole run. Stages run in
//! order and the first error aborts the rest.
//!
//! ```ignore
//! let mut tree = None;
//! engine
//!     .executor()
//!     .view(&codebase_id, &view_id, "diffs")
//!     .assert_branch(&workspace_id)
//!     .allow_rebasing()
//!     .read(|handle| {
//!         tree = Some(git::workdir_tree(handle.repo())?);
//!         Ok(())
//!     })
//!     .exec()?;
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use git2::{Oid, Repository};
use tempfile::TempDir;
use tracing::{debug, debug_span, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::git;
use crate::lock::{FileLock, LockKey};
use crate::storage::Storage;

/// What a stage does with the repository
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Reads refs and objects
    GitRead,
    /// Reads refs, objects and the working tree
    Read,
    /// Writes the working tree and metadata
    Write,
    /// Reads the working tree, writes metadata
    FileReadGitWrite,
    /// Writes refs and objects
    GitWrite,
}

impl Access {
    fn touches_files(self) -> bool {
        matches!(self, Access::Read | Access::Write | Access::FileReadGitWrite)
    }

    fn writes_git(self) -> bool {
        matches!(
            self,
            Access::Write | Access::FileReadGitWrite | Access::GitWrite
        )
    }
}

/// Kind of repository a chain runs against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Trunk,
    View,
    TemporaryView,
}

/// An open repository handed to each stage
pub struct RepoHandle {
    repo: Repository,
    codebase_id: String,
    view_id: Option<String>,
    kind: TargetKind,
    path: PathBuf,
}

impl RepoHandle {
    pub fn repo(&self) -> &Repository {
        &self.repo
    }

    pub fn codebase_id(&self) -> &str {
        &self.codebase_id
    }

    /// Durable view id; `None` for trunk and temporary views
    pub fn view_id(&self) -> Option<&str> {
        self.view_id.as_deref()
    }

    pub fn kind(&self) -> TargetKind {
        self.kind
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Debug for RepoHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepoHandle")
            .field("codebase_id", &self.codebase_id)
            .field("view_id", &self.view_id)
            .field("kind", &self.kind)
            .field("path", &self.path)
            .finish()
    }
}

type Stage<'a> = Box<dyn FnOnce(&RepoHandle) -> Result<()> + 'a>;

#[derive(Clone)]
enum Target {
    Trunk,
    View(String),
    TemporaryView(Oid),
}

impl Target {
    fn label(&self) -> String {
        match self {
            Target::Trunk => "trunk".to_string(),
            Target::View(id) => format!("view:{id}"),
            Target::TemporaryView(base) => format!("tmp@{base}"),
        }
    }
}

/// Entry point for building chains
#[derive(Debug, Clone, Copy)]
pub struct Executor<'e> {
    storage: &'e Storage,
}

impl<'e> Executor<'e> {
    pub fn new(storage: &'e Storage) -> Self {
        Self { storage }
    }

    /// Chain against the trunk repository
    pub fn trunk<'a>(&self, codebase_id: &str, name: &str) -> Chain<'a>
    where
        'e: 'a,
    {
        Chain::new(self.storage, codebase_id, name, Target::Trunk)
    }

    /// Chain against a durable view
    pub fn view<'a>(&self, codebase_id: &str, view_id: &str, name: &str) -> Chain<'a>
    where
        'e: 'a,
    {
        Chain::new(
            self.storage,
            codebase_id,
            name,
            Target::View(view_id.to_string()),
        )
    }

    /// Chain against a fresh checkout of `base`, removed afterwards
    pub fn temporary_view<'a>(&self, codebase_id: &str, base: Oid, name: &str) -> Chain<'a>
    where
        'e: 'a,
    {
        Chain::new(self.storage, codebase_id, name, Target::TemporaryView(base))
    }
}

/// A staged callback chain. Nothing runs until [`Chain::exec`].
#[must_use = "a chain does nothing until exec() is called"]
pub struct Chain<'a> {
    storage: &'a Storage,
    codebase_id: String,
    name: String,
    target: Target,
    stages: Vec<(Access, Stage<'a>)>,
    expected_branch: Option<String>,
    allow_rebasing: bool,
}

impl<'a> Chain<'a> {
    fn new(storage: &'a Storage, codebase_id: &str, name: &str, target: Target) -> Self {
        Self {
            storage,
            codebase_id: codebase_id.to_string(),
            name: name.to_string(),
            target,
            stages: Vec::new(),
            expected_branch: None,
            allow_rebasing: false,
        }
    }

    fn stage<F>(mut self, access: Access, f: F) -> Self
    where
        F: FnOnce(&RepoHandle) -> Result<()> + 'a,
    {
        self.stages.push((access, Box::new(f)));
        self
    }

    pub fn git_read<F>(self, f: F) -> Self
    where
        F: FnOnce(&RepoHandle) -> Result<()> + 'a,
    {
        self.stage(Access::GitRead, f)
    }

    pub fn read<F>(self, f: F) -> Self
    where
        F: FnOnce(&RepoHandle) -> Result<()> + 'a,
    {
        self.stage(Access::Read, f)
    }

    pub fn write<F>(self, f: F) -> Self
    where
        F: FnOnce(&RepoHandle) -> Result<()> + 'a,
    {
        self.stage(Access::Write, f)
    }

    pub fn file_read_git_write<F>(self, f: F) -> Self
    where
        F: FnOnce(&RepoHandle) -> Result<()> + 'a,
    {
        self.stage(Access::FileReadGitWrite, f)
    }

    pub fn git_write<F>(self, f: F) -> Self
    where
        F: FnOnce(&RepoHandle) -> Result<()> + 'a,
    {
        self.stage(Access::GitWrite, f)
    }

    /// Fail with `UnexpectedBranch` unless HEAD is `branch`
    pub fn assert_branch(mut self, branch: impl Into<String>) -> Self {
        self.expected_branch = Some(branch.into());
        self
    }

    /// Run even while the working copy is mid-rebase
    pub fn allow_rebasing(mut self) -> Self {
        self.allow_rebasing = true;
        self
    }

    pub fn exec(self) -> Result<()> {
        let span = debug_span!(
            "exec",
            chain = %self.name,
            codebase = %self.codebase_id,
            target = %self.target.label()
        );
        let _enter = span.enter();

        match self.target.clone() {
            Target::Trunk => self.exec_trunk(),
            Target::View(view_id) => self.exec_view(&view_id),
            Target::TemporaryView(base) => self.exec_temporary_view(base),
        }
    }

    fn exec_trunk(self) -> Result<()> {
        if let Some((access, _)) = self.stages.iter().find(|(a, _)| a.touches_files()) {
            return Err(Error::Validation(format!(
                "{access:?} stage is not allowed on trunk"
            )));
        }

        let _lock = if self.stages.iter().any(|(access, _)| access.writes_git()) {
            Some(self.lock(LockKey::Trunk)?)
        } else {
            None
        };

        let path = self.storage.trunk_dir(&self.codebase_id);
        if !path.exists() {
            return Err(Error::CodebaseNotFound(self.codebase_id.clone()));
        }
        let handle = RepoHandle {
            repo: git::open_repo(&path)?,
            codebase_id: self.codebase_id.clone(),
            view_id: None,
            kind: TargetKind::Trunk,
            path,
        };
        run_stages(self.stages, &handle)
    }

    fn exec_view(self, view_id: &str) -> Result<()> {
        let view = self.storage.get_view(view_id)?;
        if view.codebase_id != self.codebase_id {
            return Err(Error::ViewNotFound(format!(
                "{view_id} in codebase {}",
                self.codebase_id
            )));
        }

        let _lock = self.lock(LockKey::View(view_id.to_string()))?;
        let handle = RepoHandle {
            repo: git::open_repo(&view.path)?,
            codebase_id: self.codebase_id.clone(),
            view_id: Some(view_id.to_string()),
            kind: TargetKind::View,
            path: view.path,
        };
        self.check_preconditions(&handle)?;
        run_stages(self.stages, &handle)
    }

    fn exec_temporary_view(self, base: Oid) -> Result<()> {
        let temporary = TemporaryView::create(self.storage, &self.codebase_id, base)?;
        let _lock = self.lock(LockKey::View(temporary.name.clone()))?;
        let handle = RepoHandle {
            repo: git::open_repo(&temporary.path)?,
            codebase_id: self.codebase_id.clone(),
            view_id: None,
            kind: TargetKind::TemporaryView,
            path: temporary.path.clone(),
        };
        self.check_preconditions(&handle)?;
        let result = run_stages(self.stages, &handle);
        drop(handle);
        drop(temporary);
        result
    }

    fn lock(&self, key: LockKey) -> Result<FileLock> {
        FileLock::acquire(
            self.storage.lock_file(&self.codebase_id, &key),
            self.storage.lock_timeout_ms(),
        )
    }

    fn check_preconditions(&self, handle: &RepoHandle) -> Result<()> {
        if git::is_rebasing(handle.repo()) {
            if !self.allow_rebasing {
                return Err(Error::Rebasing);
            }
            // HEAD is detached during a rebase
            return Ok(());
        }

        if let Some(expected) = &self.expected_branch {
            let actual = git::head_branch(handle.repo());
            if actual.as_deref() != Some(expected.as_str()) {
                return Err(Error::UnexpectedBranch {
                    expected: expected.clone(),
                    actual: actual.unwrap_or_else(|| "(detached)".to_string()),
                });
            }
        }
        Ok(())
    }
}

fn run_stages(stages: Vec<(Access, Stage<'_>)>, handle: &RepoHandle) -> Result<()> {
    for (idx, (access, stage)) in stages.into_iter().enumerate() {
        debug!(stage = idx, ?access, "running stage");
        stage(handle)?;
    }
    Ok(())
}

/// Worktree of the trunk checked out on its own branch inside a TempDir.
///
/// Dropping it prunes the worktree and deletes the branch; the TempDir
/// removes whatever is left on disk.
struct TemporaryView {
    trunk: Repository,
    name: String,
    path: PathBuf,
    _dir: TempDir,
}

impl TemporaryView {
    fn create(storage: &Storage, codebase_id: &str, base: Oid) -> Result<Self> {
        std::fs::create_dir_all(storage.tmp_dir())?;
        let trunk_path = storage.trunk_dir(codebase_id);
        if !trunk_path.exists() {
            return Err(Error::CodebaseNotFound(codebase_id.to_string()));
        }
        let trunk = git::open_repo(&trunk_path)?;
        let dir = tempfile::Builder::new()
            .prefix("view-")
            .tempdir_in(storage.tmp_dir())?;
        let name = format!("tmp-{}", Uuid::new_v4().simple());
        let path = dir.path().join("checkout");

        git::set_branch(&trunk, &name, base, "temporary view")?;
        let view = Self {
            trunk,
            name,
            path,
            _dir: dir,
        };
        git::add_worktree(&view.trunk, &view.name, &view.path, &view.name)?;
        debug!(name = %view.name, %base, "temporary view created");
        Ok(view)
    }
}

impl Drop for TemporaryView {
    fn drop(&mut self) {
        if let Err(err) = git::remove_worktree(&self.trunk, &self.name) {
            warn!(name = %self.name, error = %err, "failed to prune temporary view");
        }
        if let Err(err) = git::delete_branch(&self.trunk, &self.name) {
            warn!(name = %self.name, error = %err, "failed to delete temporary branch");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Storage, Oid) {
        let temp = TempDir::new().unwrap();
        let storage = Storage::new(temp.path(), 2000);
        storage.init().unwrap();
        let repo = git::init_trunk(&storage.trunk_dir("cb"), "mainline").unwrap();
        let root = git::branch_tip(&repo, "mainline").unwrap();
        (temp, storage, root)
    }

    #[test]
    fn trunk_rejects_file_stages() {
        let (_temp, storage, _) = setup();
        let err = Executor::new(&storage)
            .trunk("cb", "bad")
            .read(|_| Ok(()))
            .exec()
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn stages_run_in_order_and_stop_on_error() {
        let (_temp, storage, _) = setup();
        let mut seen = Vec::new();
        let result = Executor::new(&storage)
            .trunk("cb", "order")
            .git_read(|_| {
                seen.push(1);
                Ok(())
            })
            .git_read(|_| Err(Error::OperationFailed("stop".into())))
            .git_read(|_| {
                unreachable!("chain must abort")
            })
            .exec();
        assert!(result.is_err());
        assert_eq!(seen, vec![1]);
    }

    #[test]
    fn missing_codebase_is_not_found() {
        let (_temp, storage, _) = setup();
        let err = Executor::new(&storage)
            .trunk("nope", "read")
            .git_read(|_| Ok(()))
            .exec()
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn temporary_view_is_removed_after_error() {
        let (_temp, storage, root) = setup();
        let mut seen_path = None;
        let result = Executor::new(&storage)
            .temporary_view("cb", root, "scratch")
            .write(|handle| {
                assert_eq!(handle.kind(), TargetKind::TemporaryView);
                std::fs::write(handle.path().join("a.txt"), "x\n")?;
                seen_path = Some(handle.path().to_path_buf());
                Err(Error::OperationFailed("boom".into()))
            })
            .exec();

        assert!(result.is_err());
        let path = seen_path.unwrap();
        assert!(!path.exists());

        let trunk = git::open_repo(&storage.trunk_dir("cb")).unwrap();
        let leftovers: Vec<_> = trunk
            .branches(None)
            .unwrap()
            .filter_map(|b| b.ok())
            .filter_map(|(b, _)| b.name().ok().flatten().map(String::from))
            .filter(|name| name.starts_with("tmp-"))
            .collect();
        assert!(leftovers.is_empty());
        assert_eq!(trunk.worktrees().unwrap().len(), 0);
    }
}
