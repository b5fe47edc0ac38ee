//! The engine: configuration, storage and collaborators in one handle.
//!
//! Domain operations are reached through short-lived service views
//! (`engine.workspaces().land(..)`) that borrow the engine.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use crate::acl::{Allower, CodebasePolicy, PolicyProvider, Subject};
use crate::actor::{ConfigIdentity, Identity};
use crate::codebase::Codebases;
use crate::config::Config;
use crate::error::Result;
use crate::events::{Broker, EventSender, EventSink};
use crate::executor::Executor;
use crate::jobs::{FileQueue, Job, JobQueue};
use crate::ledger::Ledger;
use crate::snapshot::Snapshots;
use crate::storage::Storage;
use crate::view::Views;
use crate::workspace::{NoReviews, Reviews, Workspaces};

pub struct Engine {
    storage: Storage,
    config: Config,
    events: Arc<dyn EventSender>,
    jobs: Arc<dyn JobQueue>,
    identity: Arc<dyn Identity>,
    reviews: Arc<dyn Reviews>,
    policy: Arc<dyn PolicyProvider>,
}

impl Engine {
    /// Open (and initialize) the data root, reading `mainline.toml` if present.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let config = Config::load_from_root(&root)?;
        Self::with_config(root, config)
    }

    pub fn with_config(root: impl Into<PathBuf>, config: Config) -> Result<Self> {
        let storage = Storage::new(root, config.locks.timeout_ms);
        storage.init()?;

        let mut broker = Broker::new(config.events.channel_capacity);
        if config.events.record {
            broker = broker.with_sink(EventSink::file(&storage.events_file())?);
        }

        Ok(Self {
            events: Arc::new(broker),
            jobs: Arc::new(FileQueue::new(storage.clone())),
            identity: Arc::new(ConfigIdentity::from_config(&config)),
            reviews: Arc::new(NoReviews),
            policy: Arc::new(CodebasePolicy),
            storage,
            config,
        })
    }

    pub fn with_events(mut self, events: Arc<dyn EventSender>) -> Self {
        self.events = events;
        self
    }

    pub fn with_jobs(mut self, jobs: Arc<dyn JobQueue>) -> Self {
        self.jobs = jobs;
        self
    }

    pub fn with_identity(mut self, identity: Arc<dyn Identity>) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_reviews(mut self, reviews: Arc<dyn Reviews>) -> Self {
        self.reviews = reviews;
        self
    }

    pub fn with_policy(mut self, policy: Arc<dyn PolicyProvider>) -> Self {
        self.policy = policy;
        self
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn executor(&self) -> Executor<'_> {
        Executor::new(&self.storage)
    }

    pub fn events(&self) -> &dyn EventSender {
        self.events.as_ref()
    }

    pub fn jobs(&self) -> &dyn JobQueue {
        self.jobs.as_ref()
    }

    pub fn identity(&self) -> &dyn Identity {
        self.identity.as_ref()
    }

    pub fn reviews(&self) -> &dyn Reviews {
        self.reviews.as_ref()
    }

    pub fn codebases(&self) -> Codebases<'_> {
        Codebases::new(self)
    }

    pub fn views(&self) -> Views<'_> {
        Views::new(self)
    }

    pub fn workspaces(&self) -> Workspaces<'_> {
        Workspaces::new(self)
    }

    pub fn snapshots(&self) -> Snapshots<'_> {
        Snapshots::new(self)
    }

    pub fn ledger(&self) -> Ledger<'_> {
        Ledger::new(self)
    }

    /// Paths `user_id` may see in a codebase
    pub fn allower_for(&self, user_id: &str, codebase_id: &str) -> Result<Allower> {
        let codebase = self.storage.get_codebase(codebase_id)?;
        self.policy
            .allower(&Subject::User(user_id.to_string()), &codebase)
    }

    /// Paths an unauthenticated reader may see in a codebase
    pub fn anonymous_allower(&self, codebase_id: &str) -> Result<Allower> {
        let codebase = self.storage.get_codebase(codebase_id)?;
        self.policy.allower(&Subject::Anonymous, &codebase)
    }

    /// Drain the job queue and run every job. Returns how many ran.
    ///
    /// A failing job is logged and does not stop the others.
    pub fn run_pending_jobs(&self) -> Result<usize> {
        let jobs = self.jobs.drain()?;
        let count = jobs.len();
        for job in jobs {
            match &job {
                Job::SnapshotRefresh {
                    codebase_id,
                    workspace_id,
                } => {
                    if let Err(err) = self.workspaces().refresh_snapshot(workspace_id) {
                        warn!(
                            codebase = %codebase_id,
                            workspace = %workspace_id,
                            error = %err,
                            "snapshot refresh failed"
                        );
                    }
                }
                Job::BuildChange {
                    codebase_id,
                    change_id,
                } => {
                    info!(codebase = %codebase_id, change = %change_id, "build triggered");
                }
            }
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn engine_is_send_and_sync() {
        assert_send_sync::<Engine>();
    }

    #[test]
    fn open_creates_layout() {
        let temp = tempfile::TempDir::new().unwrap();
        let engine = Engine::open(temp.path()).unwrap();
        assert!(engine.storage().is_initialized());
        assert_eq!(engine.config().mainline_branch, "mainline");
        assert_eq!(engine.run_pending_jobs().unwrap(), 0);
    }

    #[test]
    fn event_log_is_written_only_when_recording() {
        let temp = tempfile::TempDir::new().unwrap();
        let engine = Engine::open(temp.path()).unwrap();
        assert!(!engine.storage().events_file().exists());

        let recording = tempfile::TempDir::new().unwrap();
        let mut config = Config::default();
        config.events.record = true;
        let engine = Engine::with_config(recording.path(), config).unwrap();
        assert!(engine.storage().events_file().exists());
    }
}
