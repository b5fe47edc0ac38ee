//! Command-line interface for mainline
//!
//! This module defines the CLI structure using clap derive macros.
//! Each subcommand group is implemented in its own submodule.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use crate::actor::resolve_actor;
use crate::diff::Selection;
use crate::engine::Engine;
use crate::error::Result;
use crate::events::{Broker, EventDestination};
use crate::output::OutputOptions;

mod changelog;
mod codebase;
mod init;
mod jobs;
mod snapshot;
mod view;
mod workspace;

/// mainline - collaborative workspaces on top of git
///
/// Edit in isolated workspaces, checkpoint them as snapshots and land
/// selected hunks onto a shared mainline as immutable changes.
#[derive(Parser, Debug)]
#[command(name = "mainline")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Data root (defaults to current directory)
    #[arg(long, global = true, env = "MAINLINE_ROOT")]
    pub root: Option<PathBuf>,

    /// Acting user
    #[arg(long, global = true, env = "MAINLINE_ACTOR")]
    pub actor: Option<String>,

    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Also write events as JSON lines to a file, or "-" for stdout
    #[arg(long, global = true)]
    pub events: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a data root
    Init,

    /// Codebase management
    #[command(subcommand)]
    Codebase(CodebaseCommands),

    /// Workspace management and landing
    #[command(subcommand)]
    Workspace(WorkspaceCommands),

    /// View (checkout) management
    #[command(subcommand)]
    View(ViewCommands),

    /// Snapshots of workspaces
    #[command(subcommand)]
    Snapshot(SnapshotCommands),

    /// Show landed changes, newest first
    Changelog {
        /// Codebase id
        #[arg(long)]
        codebase: String,

        /// Maximum number of changes
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Background jobs
    #[command(subcommand)]
    Jobs(JobsCommands),
}

/// Codebase subcommands
#[derive(Subcommand, Debug)]
pub enum CodebaseCommands {
    /// Create a codebase with an empty mainline
    Create {
        /// Codebase name
        name: String,

        /// Let anonymous readers see paths granted to them
        #[arg(long)]
        public: bool,
    },

    /// List codebases
    List,

    /// Replace the path patterns a user may see
    Acl {
        /// Codebase id
        codebase: String,

        /// User id, "*" for every user or "anonymous"
        #[arg(long)]
        user: String,

        /// Glob patterns (a trailing "/" covers a directory)
        #[arg(required = true)]
        patterns: Vec<String>,
    },

    /// Recreate the mainline branch and root commit if missing
    Repair {
        /// Codebase id
        codebase: String,
    },
}

/// Workspace subcommands
#[derive(Subcommand, Debug)]
pub enum WorkspaceCommands {
    /// Create a workspace
    Create {
        /// Codebase id
        #[arg(long, required_unless_present = "from")]
        codebase: Option<String>,

        /// Workspace name
        #[arg(long)]
        name: Option<String>,

        /// Branch at this change instead of the mainline tip
        #[arg(long, conflicts_with_all = ["revert", "from"])]
        base_change: Option<String>,

        /// Start as the revert of this change
        #[arg(long, conflicts_with = "from")]
        revert: Option<String>,

        /// Start from another workspace's content
        #[arg(long)]
        from: Option<String>,
    },

    /// List workspaces of a codebase
    List {
        /// Codebase id
        #[arg(long)]
        codebase: String,

        /// Include archived workspaces
        #[arg(long)]
        all: bool,
    },

    /// Show changed files and hunk ids
    Diff {
        /// Workspace id
        workspace: String,
    },

    /// Land selected hunks on mainline
    Land {
        /// Workspace id
        workspace: String,

        /// Hunk or file id to land (repeatable)
        #[arg(long = "hunk")]
        hunks: Vec<String>,

        /// Land everything visible to the actor
        #[arg(long, conflicts_with = "hunks")]
        all: bool,

        /// Change description (defaults to the draft description)
        #[arg(short, long)]
        message: Option<String>,
    },

    /// Set the draft description
    Describe {
        /// Workspace id
        workspace: String,

        /// Description text
        description: String,
    },

    /// Predict conflicts with the mainline tip
    Conflicts {
        /// Workspace id
        workspace: String,
    },

    /// Undo selected hunks
    Undo {
        /// Workspace id
        workspace: String,

        /// Hunk or file id to undo (repeatable)
        #[arg(long = "hunk", required = true)]
        hunks: Vec<String>,
    },

    /// Copy selected hunks from another workspace
    Take {
        /// Workspace receiving the hunks
        workspace: String,

        /// Workspace the hunks come from
        #[arg(long)]
        from: String,

        /// Hunk or file id to copy (repeatable)
        #[arg(long = "hunk", required = true)]
        hunks: Vec<String>,
    },

    /// Archive a workspace
    Archive {
        /// Workspace id
        workspace: String,
    },

    /// Restore an archived workspace
    Unarchive {
        /// Workspace id
        workspace: String,
    },

    /// Show lifecycle state and derived fields
    State {
        /// Workspace id
        workspace: String,
    },
}

/// View subcommands
#[derive(Subcommand, Debug)]
pub enum ViewCommands {
    /// Create a view for the actor
    Create {
        /// Codebase id
        #[arg(long)]
        codebase: String,
    },

    /// Open a workspace in a view
    Open {
        /// View id
        view: String,

        /// Workspace id
        workspace: String,
    },

    /// Snapshot and detach the open workspace
    Close {
        /// View id
        view: String,
    },

    /// List views of a codebase
    List {
        /// Codebase id
        #[arg(long)]
        codebase: String,
    },
}

/// Snapshot subcommands
#[derive(Subcommand, Debug)]
pub enum SnapshotCommands {
    /// Snapshot a workspace now
    Create {
        /// Workspace id
        workspace: String,
    },

    /// Copy a snapshot (or some of its hunks) into a workspace
    Copy {
        /// Snapshot id
        snapshot: String,

        /// Target workspace id
        #[arg(long)]
        to: String,

        /// Hunk or file id to keep (repeatable, default all)
        #[arg(long = "hunk")]
        hunks: Vec<String>,
    },

    /// Show a snapshot's diff against its parent
    Diff {
        /// Snapshot id
        snapshot: String,
    },

    /// List snapshots of a workspace
    List {
        /// Workspace id
        workspace: String,
    },
}

/// Job subcommands
#[derive(Subcommand, Debug)]
pub enum JobsCommands {
    /// Run every pending job
    Run,
}

/// Engine, actor and output settings shared by every command
pub(crate) struct Context {
    pub engine: Engine,
    pub actor: String,
    pub output: OutputOptions,
}

impl Cli {
    fn context(&self) -> Result<Context> {
        let root = match &self.root {
            Some(root) => root.clone(),
            None => std::env::current_dir()?,
        };
        let mut engine = Engine::open(root)?;
        if let Some(destination) = EventDestination::parse(self.events.as_deref()) {
            let broker = Broker::new(engine.config().events.channel_capacity)
                .with_sink(destination.open()?);
            engine = engine.with_events(Arc::new(broker));
        }
        let actor = resolve_actor(engine.config(), self.actor.as_deref());

        Ok(Context {
            engine,
            actor,
            output: OutputOptions {
                json: self.json,
                quiet: self.quiet,
            },
        })
    }

    /// Execute the CLI command
    pub fn run(self) -> Result<()> {
        let ctx = self.context()?;
        match self.command {
            Commands::Init => init::run(&ctx),
            Commands::Codebase(cmd) => codebase::run(&ctx, cmd),
            Commands::Workspace(cmd) => workspace::run(&ctx, cmd),
            Commands::View(cmd) => view::run(&ctx, cmd),
            Commands::Snapshot(cmd) => snapshot::run(&ctx, cmd),
            Commands::Changelog { codebase, limit } => changelog::run(&ctx, &codebase, limit),
            Commands::Jobs(JobsCommands::Run) => jobs::run(&ctx),
        }
    }
}

fn selection(ids: Vec<String>) -> Selection {
    ids.into_iter().collect()
}

/// One detail line per file and per hunk.
fn push_diffs(human: &mut crate::output::HumanOutput, files: &[crate::diff::FileDiff]) {
    for file in files {
        let mut flags = Vec::new();
        if file.is_new {
            flags.push("new");
        }
        if file.is_deleted {
            flags.push("deleted");
        }
        if file.is_moved {
            flags.push("moved");
        }
        if file.is_large {
            flags.push("large");
        }
        if file.is_binary {
            flags.push("binary");
        }
        if file.is_hidden {
            flags.push("hidden");
        }
        let name = if file.is_moved {
            format!("{} -> {}", file.orig_name, file.new_name)
        } else {
            file.preferred_name.clone()
        };
        if flags.is_empty() {
            human.push_detail(format!("{name}  [{}]", file.id));
        } else {
            human.push_detail(format!("{name} ({})  [{}]", flags.join(", "), file.id));
        }
        for hunk in &file.hunks {
            let header = hunk
                .patch
                .lines()
                .find(|line| line.starts_with("@@"))
                .unwrap_or("@@");
            human.push_detail(format!("  {header}  [{}]", hunk.id));
        }
    }
}
