//! Background jobs queued by workspace operations.
//!
//! Jobs are appended to `state/jobs.jsonl` and drained by
//! [`Engine::run_pending_jobs`](crate::engine::Engine::run_pending_jobs).

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::storage::Storage;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "job", rename_all = "snake_case")]
pub enum Job {
    /// Re-snapshot a workspace so its latest snapshot follows the new base
    SnapshotRefresh {
        codebase_id: String,
        workspace_id: String,
    },
    /// Trigger CI for a landed change
    BuildChange {
        codebase_id: String,
        change_id: String,
    },
}

/// Queue port used by the engine
pub trait JobQueue: Send + Sync {
    fn enqueue(&self, job: Job) -> Result<()>;

    /// Remove and return every pending job
    fn drain(&self) -> Result<Vec<Job>>;
}

/// JSONL-backed queue in the data root
#[derive(Debug, Clone)]
pub struct FileQueue {
    storage: Storage,
}

impl FileQueue {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }
}

impl JobQueue for FileQueue {
    fn enqueue(&self, job: Job) -> Result<()> {
        self.storage
            .append_jsonl_locked(&self.storage.jobs_file(), &job)
    }

    fn drain(&self) -> Result<Vec<Job>> {
        self.storage.drain_jsonl(&self.storage.jobs_file())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn enqueue_then_drain_once() {
        let temp = TempDir::new().unwrap();
        let storage = Storage::new(temp.path(), 1000);
        storage.init().unwrap();
        let queue = FileQueue::new(storage);

        let job = Job::BuildChange {
            codebase_id: "cb".into(),
            change_id: "c1".into(),
        };
        queue.enqueue(job.clone()).unwrap();

        assert_eq!(queue.drain().unwrap(), vec![job]);
        assert!(queue.drain().unwrap().is_empty());
    }

    #[test]
    fn jobs_are_tagged() {
        let job = Job::SnapshotRefresh {
            codebase_id: "cb".into(),
            workspace_id: "w".into(),
        };
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["job"], "snapshot_refresh");
    }
}
