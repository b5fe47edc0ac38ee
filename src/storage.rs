//! Storage layer for mainline
//!
//! Owns every path under the data root and the persisted records.
//!
//! # Directory Structure
//!
//! ```text
//! <root>/
//!   mainline.toml                  # Configuration
//!   codebases/<codebase_id>/trunk/ # Trunk repository (mainline + workspace branches)
//!   views/<view_id>/               # Durable views (worktrees of the trunk)
//!   tmp/                           # Temporary views, removed after each use
//!   state/
//!     codebases.json               # Codebase records
//!     views.json                   # View records
//!     workspaces.json              # Workspace records
//!     changes.json                 # Change ledger
//!     snapshots.jsonl              # Snapshots (append-only)
//!     jobs.jsonl                   # Pending background jobs
//!     events.jsonl                 # Optional event log
//!   locks/<codebase_id>/<key>.lock # Executor locks
//! ```

use std::fs::{self, File};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};

use crate::codebase::Codebase;
use crate::error::{Error, Result};
use crate::ledger::Change;
use crate::lock::{self, FileLock, LockKey};
use crate::snapshot::Snapshot;
use crate::view::View;
use crate::workspace::Workspace;

/// A persisted record addressable by id
pub trait Record {
    fn id(&self) -> &str;
}

/// Storage manager for the data root
#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
    lock_timeout_ms: u64,
}

impl Storage {
    pub fn new(root: impl Into<PathBuf>, lock_timeout_ms: u64) -> Self {
        Self {
            root: root.into(),
            lock_timeout_ms,
        }
    }

    // =========================================================================
    // Path accessors
    // =========================================================================

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn lock_timeout_ms(&self) -> u64 {
        self.lock_timeout_ms
    }

    pub fn codebase_dir(&self, codebase_id: &str) -> PathBuf {
        self.root.join("codebases").join(codebase_id)
    }

    /// Path of a codebase's trunk repository
    pub fn trunk_dir(&self, codebase_id: &str) -> PathBuf {
        self.codebase_dir(codebase_id).join("trunk")
    }

    pub fn views_dir(&self) -> PathBuf {
        self.root.join("views")
    }

    pub fn view_dir(&self, view_id: &str) -> PathBuf {
        self.views_dir().join(view_id)
    }

    /// Parent directory for temporary views
    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join("state")
    }

    pub fn codebases_file(&self) -> PathBuf {
        self.state_dir().join("codebases.json")
    }

    pub fn views_file(&self) -> PathBuf {
        self.state_dir().join("views.json")
    }

    pub fn workspaces_file(&self) -> PathBuf {
        self.state_dir().join("workspaces.json")
    }

    pub fn changes_file(&self) -> PathBuf {
        self.state_dir().join("changes.json")
    }

    pub fn snapshots_file(&self) -> PathBuf {
        self.state_dir().join("snapshots.jsonl")
    }

    pub fn jobs_file(&self) -> PathBuf {
        self.state_dir().join("jobs.jsonl")
    }

    pub fn events_file(&self) -> PathBuf {
        self.state_dir().join("events.jsonl")
    }

    /// Lock file for one exclusion key within a codebase
    pub fn lock_file(&self, codebase_id: &str, key: &LockKey) -> PathBuf {
        self.root
            .join("locks")
            .join(codebase_id)
            .join(format!("{key}.lock"))
    }

    // =========================================================================
    // Directory initialization
    // =========================================================================

    /// Create the data root layout
    pub fn init(&self) -> Result<()> {
        fs::create_dir_all(self.root.join("codebases"))?;
        fs::create_dir_all(self.views_dir())?;
        fs::create_dir_all(self.tmp_dir())?;
        fs::create_dir_all(self.state_dir())?;
        fs::create_dir_all(self.root.join("locks"))?;
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.state_dir().exists()
    }

    // =========================================================================
    // File I/O helpers
    // =========================================================================

    pub fn write_json<T: Serialize>(&self, path: &Path, data: &T) -> Result<()> {
        let json = serde_json::to_string_pretty(data)?;
        lock::write_atomic(path, json.as_bytes())
    }

    pub fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Result<T> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Append one record to a JSONL file. Caller holds the file's lock.
    pub fn append_jsonl<T: Serialize>(&self, path: &Path, record: &T) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string(record)?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;

        writeln!(file, "{}", json)?;
        file.sync_all()?;

        Ok(())
    }

    pub fn read_jsonl<T: DeserializeOwned>(&self, path: &Path) -> Result<Vec<T>> {
        if !path.exists() {
            return Ok(Vec::new());
        }

        let reader = BufReader::new(File::open(path)?);
        let mut records = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line)?);
        }

        Ok(records)
    }

    /// Append under the file's lock
    pub fn append_jsonl_locked<T: Serialize>(&self, path: &Path, record: &T) -> Result<()> {
        let _lock = FileLock::acquire(lock::lock_path_for(path), self.lock_timeout_ms)?;
        self.append_jsonl(path, record)
    }

    /// Read and truncate a JSONL file under its lock
    pub fn drain_jsonl<T: DeserializeOwned>(&self, path: &Path) -> Result<Vec<T>> {
        let _lock = FileLock::acquire(lock::lock_path_for(path), self.lock_timeout_ms)?;
        let records = self.read_jsonl(path)?;
        if path.exists() {
            lock::write_atomic(path, b"")?;
        }
        Ok(records)
    }

    fn read_table<T: DeserializeOwned>(&self, path: &Path) -> Result<Vec<T>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        self.read_json(path)
    }

    /// Read-modify-write a table under `<file>.lock`
    fn update_table<T, R, F>(&self, path: &Path, f: F) -> Result<R>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut Vec<T>) -> Result<R>,
    {
        let _lock = FileLock::acquire(lock::lock_path_for(path), self.lock_timeout_ms)?;

        let mut rows: Vec<T> = self.read_table(path)?;
        let result = f(&mut rows)?;
        self.write_json(path, &rows)?;

        Ok(result)
    }

    fn insert_row<T>(&self, path: &Path, row: T) -> Result<()>
    where
        T: Record + Serialize + DeserializeOwned,
    {
        self.update_table(path, |rows: &mut Vec<T>| {
            if rows.iter().any(|existing| existing.id() == row.id()) {
                return Err(Error::InvalidArgument(format!(
                    "duplicate record id: {}",
                    row.id()
                )));
            }
            rows.push(row);
            Ok(())
        })
    }

    fn find_row<T>(&self, path: &Path, id: &str) -> Result<Option<T>>
    where
        T: Record + DeserializeOwned,
    {
        let rows: Vec<T> = self.read_table(path)?;
        Ok(rows.into_iter().find(|row| row.id() == id))
    }

    fn update_row<T, F>(&self, path: &Path, id: &str, missing: Error, mutator: F) -> Result<T>
    where
        T: Record + Clone + Serialize + DeserializeOwned,
        F: FnOnce(&mut T) -> Result<()>,
    {
        self.update_table(path, |rows: &mut Vec<T>| {
            let row = match rows.iter_mut().find(|row| row.id() == id) {
                Some(row) => row,
                None => return Err(missing),
            };
            mutator(row)?;
            Ok(row.clone())
        })
    }

    // =========================================================================
    // Codebases
    // =========================================================================

    pub fn insert_codebase(&self, codebase: Codebase) -> Result<()> {
        self.insert_row(&self.codebases_file(), codebase)
    }

    pub fn get_codebase(&self, id: &str) -> Result<Codebase> {
        self.find_row(&self.codebases_file(), id)?
            .ok_or_else(|| Error::CodebaseNotFound(id.to_string()))
    }

    pub fn update_codebase<F>(&self, id: &str, mutator: F) -> Result<Codebase>
    where
        F: FnOnce(&mut Codebase) -> Result<()>,
    {
        self.update_row(
            &self.codebases_file(),
            id,
            Error::CodebaseNotFound(id.to_string()),
            mutator,
        )
    }

    pub fn list_codebases(&self) -> Result<Vec<Codebase>> {
        self.read_table(&self.codebases_file())
    }

    // =========================================================================
    // Views
    // =========================================================================

    pub fn insert_view(&self, view: View) -> Result<()> {
        self.insert_row(&self.views_file(), view)
    }

    pub fn get_view(&self, id: &str) -> Result<View> {
        self.find_row(&self.views_file(), id)?
            .ok_or_else(|| Error::ViewNotFound(id.to_string()))
    }

    pub fn update_view<F>(&self, id: &str, mutator: F) -> Result<View>
    where
        F: FnOnce(&mut View) -> Result<()>,
    {
        self.update_row(
            &self.views_file(),
            id,
            Error::ViewNotFound(id.to_string()),
            mutator,
        )
    }

    pub fn list_views(&self, codebase_id: &str) -> Result<Vec<View>> {
        let views: Vec<View> = self.read_table(&self.views_file())?;
        Ok(views
            .into_iter()
            .filter(|view| view.codebase_id == codebase_id)
            .collect())
    }

    // =========================================================================
    // Workspaces
    // =========================================================================

    pub fn insert_workspace(&self, workspace: Workspace) -> Result<()> {
        self.insert_row(&self.workspaces_file(), workspace)
    }

    pub fn get_workspace(&self, id: &str) -> Result<Workspace> {
        self.find_row(&self.workspaces_file(), id)?
            .ok_or_else(|| Error::WorkspaceNotFound(id.to_string()))
    }

    pub fn update_workspace<F>(&self, id: &str, mutator: F) -> Result<Workspace>
    where
        F: FnOnce(&mut Workspace) -> Result<()>,
    {
        self.update_row(
            &self.workspaces_file(),
            id,
            Error::WorkspaceNotFound(id.to_string()),
            mutator,
        )
    }

    /// Apply `mutator` to every workspace of a codebase in one locked write
    pub fn update_codebase_workspaces<F>(&self, codebase_id: &str, mut mutator: F) -> Result<usize>
    where
        F: FnMut(&mut Workspace),
    {
        self.update_table(&self.workspaces_file(), |rows: &mut Vec<Workspace>| {
            let mut touched = 0;
            for workspace in rows.iter_mut().filter(|ws| ws.codebase_id == codebase_id) {
                mutator(workspace);
                touched += 1;
            }
            Ok(touched)
        })
    }

    pub fn list_workspaces(&self, codebase_id: &str) -> Result<Vec<Workspace>> {
        let rows: Vec<Workspace> = self.read_table(&self.workspaces_file())?;
        Ok(rows
            .into_iter()
            .filter(|ws| ws.codebase_id == codebase_id)
            .collect())
    }

    // =========================================================================
    // Snapshots (append-only)
    // =========================================================================

    pub fn append_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        self.append_jsonl_locked(&self.snapshots_file(), snapshot)
    }

    pub fn get_snapshot(&self, id: &str) -> Result<Snapshot> {
        let snapshots: Vec<Snapshot> = self.read_jsonl(&self.snapshots_file())?;
        snapshots
            .into_iter()
            .find(|snapshot| snapshot.id == id)
            .ok_or_else(|| Error::SnapshotNotFound(id.to_string()))
    }

    /// Most recent snapshot taken on a view
    pub fn latest_snapshot_in_view(&self, view_id: &str) -> Result<Option<Snapshot>> {
        let snapshots: Vec<Snapshot> = self.read_jsonl(&self.snapshots_file())?;
        Ok(snapshots
            .into_iter()
            .filter(|snapshot| snapshot.view_id.as_deref() == Some(view_id))
            .max_by_key(|snapshot| snapshot.created_at))
    }

    pub fn list_snapshots(&self, workspace_id: &str) -> Result<Vec<Snapshot>> {
        let snapshots: Vec<Snapshot> = self.read_jsonl(&self.snapshots_file())?;
        Ok(snapshots
            .into_iter()
            .filter(|snapshot| snapshot.workspace_id == workspace_id)
            .collect())
    }

    // =========================================================================
    // Changes
    // =========================================================================

    /// Insert a change unless one already exists for its (codebase, commit).
    ///
    /// Returns the stored row, which is the pre-existing one on a race.
    pub fn insert_change_if_absent(&self, change: Change) -> Result<Change> {
        self.update_table(&self.changes_file(), |rows: &mut Vec<Change>| {
            if let Some(existing) = rows
                .iter()
                .find(|row| row.codebase_id == change.codebase_id && row.commit_id == change.commit_id)
            {
                return Ok(existing.clone());
            }
            rows.push(change.clone());
            Ok(change)
        })
    }

    pub fn get_change(&self, id: &str) -> Result<Change> {
        self.find_row(&self.changes_file(), id)?
            .ok_or_else(|| Error::ChangeNotFound(id.to_string()))
    }

    pub fn find_change_by_commit(&self, codebase_id: &str, commit_id: &str) -> Result<Option<Change>> {
        let rows: Vec<Change> = self.read_table(&self.changes_file())?;
        Ok(rows
            .into_iter()
            .find(|row| row.codebase_id == codebase_id && row.commit_id == commit_id))
    }

    /// Fill a change's parent pointer. A pointer that is already set is kept.
    pub fn set_change_parent(&self, id: &str, parent_change_id: &str) -> Result<Change> {
        self.update_row(
            &self.changes_file(),
            id,
            Error::ChangeNotFound(id.to_string()),
            |change: &mut Change| {
                if change.parent_change_id.is_none() {
                    change.parent_change_id = Some(parent_change_id.to_string());
                }
                Ok(())
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    fn change(id: &str, commit: &str) -> Change {
        Change {
            id: id.to_string(),
            codebase_id: "cb".to_string(),
            commit_id: commit.to_string(),
            parent_change_id: None,
            title: "t".to_string(),
            description: "t".to_string(),
            user_id: None,
            created_at: Utc::now(),
            git_created_at: Utc::now(),
            git_creator_name: "n".to_string(),
            git_creator_email: "e@example.com".to_string(),
        }
    }

    #[test]
    fn layout_paths() {
        let temp = TempDir::new().unwrap();
        let storage = Storage::new(temp.path(), 1000);

        assert_eq!(
            storage.trunk_dir("cb1"),
            temp.path().join("codebases/cb1/trunk")
        );
        assert_eq!(storage.view_dir("v1"), temp.path().join("views/v1"));
        assert_eq!(
            storage.lock_file("cb1", &LockKey::Trunk),
            temp.path().join("locks/cb1/trunk.lock")
        );

        storage.init().unwrap();
        assert!(storage.is_initialized());
        assert!(storage.tmp_dir().exists());
    }

    #[test]
    fn jsonl_append_and_drain() {
        let temp = TempDir::new().unwrap();
        let storage = Storage::new(temp.path(), 1000);
        let file = storage.jobs_file();

        storage.append_jsonl_locked(&file, &serde_json::json!({"n": 1})).unwrap();
        storage.append_jsonl_locked(&file, &serde_json::json!({"n": 2})).unwrap();

        let drained: Vec<serde_json::Value> = storage.drain_jsonl(&file).unwrap();
        assert_eq!(drained.len(), 2);
        let again: Vec<serde_json::Value> = storage.read_jsonl(&file).unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn change_insert_is_unique_per_commit() {
        let temp = TempDir::new().unwrap();
        let storage = Storage::new(temp.path(), 1000);

        let first = storage.insert_change_if_absent(change("c1", "abc")).unwrap();
        let second = storage.insert_change_if_absent(change("c2", "abc")).unwrap();
        assert_eq!(first.id, "c1");
        assert_eq!(second.id, "c1");

        let found = storage.find_change_by_commit("cb", "abc").unwrap().unwrap();
        assert_eq!(found.id, "c1");
    }

    #[test]
    fn change_parent_is_set_once() {
        let temp = TempDir::new().unwrap();
        let storage = Storage::new(temp.path(), 1000);
        storage.insert_change_if_absent(change("c1", "abc")).unwrap();

        let updated = storage.set_change_parent("c1", "p1").unwrap();
        assert_eq!(updated.parent_change_id.as_deref(), Some("p1"));

        let kept = storage.set_change_parent("c1", "p2").unwrap();
        assert_eq!(kept.parent_change_id.as_deref(), Some("p1"));
    }

    #[test]
    fn missing_workspace_is_not_found() {
        let temp = TempDir::new().unwrap();
        let storage = Storage::new(temp.path(), 1000);
        let err = storage.get_workspace("nope").unwrap_err();
        assert!(err.is_not_found());
    }
}
