//! mainline - collaborative version control backend
//!
//! Many users edit one codebase through private workspaces and land selected
//! hunks onto a linear mainline. Git is the storage engine; every repository
//! mutation goes through a locked, precondition-checked executor.
//!
//! # Core Concepts
//!
//! - **Codebase**: a trunk repository whose mainline branch only moves forward
//! - **Workspace**: a branch plus a chain of snapshots of in-progress work
//! - **View**: a worktree where at most one workspace is checked out
//! - **Snapshot**: an immutable commit capturing a workspace's tree
//! - **Change**: a landed mainline commit with attribution
//!
//! # Module Organization
//!
//! - `executor`: locked read/write chains over trunk, views and temporary views
//! - `diff`: diff decoration with stable hunk ids, selection and ACL redaction
//! - `snapshot`: capture, copy and diff of workspace snapshots
//! - `ledger`: mapping from mainline commits to changes, with lazy import
//! - `workspace`: workspace lifecycle and landing
//! - `view`: binding workspaces to worktrees
//! - `engine`: the handle tying storage, config and collaborators together

pub mod acl;
pub mod actor;
pub mod cli;
pub mod codebase;
pub mod config;
pub mod diff;
pub mod engine;
pub mod error;
pub mod events;
pub mod executor;
pub mod git;
pub mod jobs;
pub mod ledger;
pub mod lock;
pub mod merge;
pub mod output;
pub mod snapshot;
pub mod storage;
pub mod view;
pub mod workspace;

pub use engine::Engine;
pub use error::{Error, Result};
