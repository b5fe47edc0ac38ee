//! Snapshot commands
//!
//! Implements `mainline snapshot create|copy|diff|list`.

use serde::Serialize;

use super::{push_diffs, selection, Context, SnapshotCommands};
use crate::diff::FileDiff;
use crate::error::{Error, Result};
use crate::output::{emit_success, HumanOutput};
use crate::snapshot::{Snapshot, SnapshotAction, SnapshotOptions};

pub fn run(ctx: &Context, cmd: SnapshotCommands) -> Result<()> {
    match cmd {
        SnapshotCommands::Create { workspace } => run_create(ctx, &workspace),
        SnapshotCommands::Copy {
            snapshot,
            to,
            hunks,
        } => run_copy(ctx, &snapshot, &to, hunks),
        SnapshotCommands::Diff { snapshot } => run_diff(ctx, &snapshot),
        SnapshotCommands::List { workspace } => run_list(ctx, &workspace),
    }
}

fn run_create(ctx: &Context, workspace_id: &str) -> Result<()> {
    let workspace = ctx.engine.workspaces().get(workspace_id)?;
    let options = match &workspace.view_id {
        Some(view_id) => SnapshotOptions::new().on_view(view_id).skip_throttle(),
        None => SnapshotOptions::new().on_temporary_view(),
    };
    let snapshot = ctx
        .engine
        .snapshots()
        .snapshot(workspace_id, SnapshotAction::Sync, options)?
        .ok_or_else(|| Error::OperationFailed("snapshot was skipped".to_string()))?;

    let mut human = HumanOutput::new(format!("mainline snapshot create: {}", snapshot.id));
    human.push_summary("commit", snapshot.commit_id.clone());
    human.push_summary(
        "files",
        snapshot.diffs_count.unwrap_or_default().to_string(),
    );
    emit_success(ctx.output, "snapshot create", &snapshot, Some(&human))
}

fn run_copy(ctx: &Context, snapshot_id: &str, target: &str, hunks: Vec<String>) -> Result<()> {
    let ids = (!hunks.is_empty()).then(|| selection(hunks));
    let snapshot = ctx.engine.snapshots().copy(
        snapshot_id,
        target,
        ids.as_ref(),
        SnapshotAction::Extract,
        true,
    )?;

    let mut human = HumanOutput::new(format!("mainline snapshot copy: {}", snapshot.id));
    human.push_summary("workspace", snapshot.workspace_id.clone());
    human.push_summary("from", snapshot_id.to_string());
    emit_success(ctx.output, "snapshot copy", &snapshot, Some(&human))
}

#[derive(Serialize)]
struct DiffReport {
    snapshot_id: String,
    files: Vec<FileDiff>,
}

fn run_diff(ctx: &Context, snapshot_id: &str) -> Result<()> {
    let snapshot = ctx.engine.snapshots().get(snapshot_id)?;
    let allower = ctx.engine.allower_for(&ctx.actor, &snapshot.codebase_id)?;
    let files = ctx.engine.snapshots().diffs(snapshot_id, &allower)?;

    let mut human = HumanOutput::new(format!(
        "mainline snapshot diff: {} file(s)",
        files.len()
    ));
    push_diffs(&mut human, &files);

    emit_success(
        ctx.output,
        "snapshot diff",
        &DiffReport {
            snapshot_id: snapshot_id.to_string(),
            files,
        },
        Some(&human),
    )
}

#[derive(Serialize)]
struct ListReport {
    snapshots: Vec<Snapshot>,
}

fn run_list(ctx: &Context, workspace_id: &str) -> Result<()> {
    let snapshots = ctx.engine.snapshots().list(workspace_id)?;

    let mut human = HumanOutput::new(format!("mainline snapshot list: {}", snapshots.len()));
    for snapshot in &snapshots {
        human.push_detail(format!(
            "{}  {:?}  {}",
            snapshot.id,
            snapshot.action,
            snapshot.created_at.to_rfc3339()
        ));
    }
    emit_success(ctx.output, "snapshot list", &ListReport { snapshots }, Some(&human))
}
