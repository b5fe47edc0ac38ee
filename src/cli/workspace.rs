//! Workspace commands
//!
//! Implements `mainline workspace create|list|diff|land|describe|conflicts|
//! undo|take|archive|unarchive|state`.

use serde::Serialize;

use super::{push_diffs, selection, Context, WorkspaceCommands};
use crate::diff::{FileDiff, Selection};
use crate::error::Result;
use crate::ledger::Change;
use crate::merge::MergeConflict;
use crate::output::{emit_success, HumanOutput};
use crate::snapshot::Snapshot;
use crate::workspace::{CreateOptions, LandRequest, Workspace, WorkspaceState};

pub fn run(ctx: &Context, cmd: WorkspaceCommands) -> Result<()> {
    match cmd {
        WorkspaceCommands::Create {
            codebase,
            name,
            base_change,
            revert,
            from,
        } => run_create(
            ctx,
            CreateArgs {
                codebase,
                from,
                options: CreateOptions {
                    name,
                    base_change_id: base_change,
                    revert_change_id: revert,
                },
            },
        ),
        WorkspaceCommands::List { codebase, all } => run_list(ctx, &codebase, all),
        WorkspaceCommands::Diff { workspace } => run_diff(ctx, &workspace),
        WorkspaceCommands::Land {
            workspace,
            hunks,
            all,
            message,
        } => run_land(ctx, &workspace, hunks, all, message),
        WorkspaceCommands::Describe {
            workspace,
            description,
        } => run_describe(ctx, &workspace, &description),
        WorkspaceCommands::Conflicts { workspace } => run_conflicts(ctx, &workspace),
        WorkspaceCommands::Undo { workspace, hunks } => run_undo(ctx, &workspace, hunks),
        WorkspaceCommands::Take {
            workspace,
            from,
            hunks,
        } => run_take(ctx, &workspace, &from, hunks),
        WorkspaceCommands::Archive { workspace } => run_archive(ctx, &workspace),
        WorkspaceCommands::Unarchive { workspace } => run_unarchive(ctx, &workspace),
        WorkspaceCommands::State { workspace } => run_state(ctx, &workspace),
    }
}

struct CreateArgs {
    codebase: Option<String>,
    from: Option<String>,
    options: CreateOptions,
}

fn run_create(ctx: &Context, args: CreateArgs) -> Result<()> {
    let workspaces = ctx.engine.workspaces();
    let workspace = match (&args.from, &args.codebase) {
        (Some(source), _) => {
            workspaces.create_from_workspace(source, &ctx.actor, args.options.name.as_deref())?
        }
        (None, Some(codebase)) => workspaces.create(codebase, &ctx.actor, &args.options)?,
        (None, None) => {
            return Err(crate::error::Error::InvalidArgument(
                "either --codebase or --from is required".to_string(),
            ))
        }
    };

    let mut human = HumanOutput::new(format!("mainline workspace create: {}", workspace.name));
    human.push_summary("id", workspace.id.clone());
    human.push_summary("user", workspace.user_id.clone());
    if let Some(snapshot) = &workspace.latest_snapshot_id {
        human.push_summary("snapshot", snapshot.clone());
    }
    human.push_next_step(format!("mainline view open <view> {}", workspace.id));

    emit_success(ctx.output, "workspace create", &workspace, Some(&human))
}

#[derive(Serialize)]
struct ListReport {
    workspaces: Vec<Workspace>,
}

fn run_list(ctx: &Context, codebase_id: &str, all: bool) -> Result<()> {
    let workspaces: Vec<Workspace> = ctx
        .engine
        .workspaces()
        .list(codebase_id)?
        .into_iter()
        .filter(|ws| all || ws.archived_at.is_none())
        .collect();

    let mut human = HumanOutput::new(format!("mainline workspace list: {}", workspaces.len()));
    for ws in &workspaces {
        human.push_detail(format!(
            "{}  {}  {:?}  {}",
            ws.id,
            ws.name,
            ws.state(),
            ws.user_id
        ));
    }

    emit_success(ctx.output, "workspace list", &ListReport { workspaces }, Some(&human))
}

#[derive(Serialize)]
struct DiffReport {
    workspace_id: String,
    files: Vec<FileDiff>,
}

fn run_diff(ctx: &Context, workspace_id: &str) -> Result<()> {
    let workspace = ctx.engine.workspaces().get(workspace_id)?;
    let allower = ctx.engine.allower_for(&ctx.actor, &workspace.codebase_id)?;
    let files = ctx.engine.workspaces().diffs(workspace_id, &allower)?;

    let mut human = HumanOutput::new(format!(
        "mainline workspace diff: {} file(s)",
        files.len()
    ));
    push_diffs(&mut human, &files);
    if files.iter().any(|file| file.is_hidden) {
        human.push_warning("some paths are hidden by the codebase ACL");
    }

    emit_success(
        ctx.output,
        "workspace diff",
        &DiffReport {
            workspace_id: workspace_id.to_string(),
            files,
        },
        Some(&human),
    )
}

fn run_land(
    ctx: &Context,
    workspace_id: &str,
    hunks: Vec<String>,
    all: bool,
    message: Option<String>,
) -> Result<()> {
    let workspaces = ctx.engine.workspaces();
    let patch_ids: Selection = if all {
        let workspace = workspaces.get(workspace_id)?;
        let allower = ctx.engine.allower_for(&ctx.actor, &workspace.codebase_id)?;
        workspaces
            .diffs(workspace_id, &allower)?
            .iter()
            .filter(|file| !file.is_hidden)
            .flat_map(|file| file.ids().map(String::from).collect::<Vec<_>>())
            .collect()
    } else {
        selection(hunks)
    };

    let outcome = workspaces.land(&LandRequest {
        workspace_id: workspace_id.to_string(),
        actor: ctx.actor.clone(),
        patch_ids,
        description: message,
    })?;

    let mut human = HumanOutput::new(format!("mainline workspace land: {}", outcome.change.title));
    human.push_summary("change", outcome.change.id.clone());
    human.push_summary("commit", outcome.change.commit_id.clone());
    human.push_summary("remaining", outcome.remaining.to_string());
    human.push_next_step(format!(
        "mainline changelog --codebase {}",
        outcome.change.codebase_id
    ));

    emit_success(ctx.output, "workspace land", &outcome, Some(&human))
}

fn run_describe(ctx: &Context, workspace_id: &str, description: &str) -> Result<()> {
    let workspace = ctx
        .engine
        .workspaces()
        .set_draft_description(workspace_id, description)?;

    let mut human = HumanOutput::new(format!("mainline workspace describe: {}", workspace.name));
    human.push_summary("description", workspace.draft_description.clone());

    emit_success(ctx.output, "workspace describe", &workspace, Some(&human))
}

#[derive(Serialize)]
struct ConflictReport {
    workspace_id: String,
    has_conflicts: bool,
    conflicts: Vec<MergeConflict>,
}

fn run_conflicts(ctx: &Context, workspace_id: &str) -> Result<()> {
    let conflicts = ctx.engine.workspaces().conflicts(workspace_id)?;

    let header = if conflicts.is_empty() {
        "mainline workspace conflicts: none".to_string()
    } else {
        format!("mainline workspace conflicts: {}", conflicts.len())
    };
    let mut human = HumanOutput::new(header);
    for conflict in &conflicts {
        human.push_detail(conflict.to_string());
    }

    emit_success(
        ctx.output,
        "workspace conflicts",
        &ConflictReport {
            workspace_id: workspace_id.to_string(),
            has_conflicts: !conflicts.is_empty(),
            conflicts,
        },
        Some(&human),
    )
}

#[derive(Serialize)]
struct SnapshotReport {
    workspace_id: String,
    snapshot: Option<Snapshot>,
}

fn snapshot_human(header: String, snapshot: Option<&Snapshot>) -> HumanOutput {
    let mut human = HumanOutput::new(header);
    match snapshot {
        Some(snapshot) => {
            human.push_summary("snapshot", snapshot.id.clone());
            human.push_summary(
                "files",
                snapshot.diffs_count.unwrap_or_default().to_string(),
            );
        }
        None => human.push_summary("snapshot", "none"),
    }
    human
}

fn run_undo(ctx: &Context, workspace_id: &str, hunks: Vec<String>) -> Result<()> {
    let snapshot = ctx
        .engine
        .workspaces()
        .remove_patches(workspace_id, &ctx.actor, &selection(hunks))?;

    let human = snapshot_human(
        "mainline workspace undo: hunks removed".to_string(),
        snapshot.as_ref(),
    );
    emit_success(
        ctx.output,
        "workspace undo",
        &SnapshotReport {
            workspace_id: workspace_id.to_string(),
            snapshot,
        },
        Some(&human),
    )
}

fn run_take(ctx: &Context, workspace_id: &str, source_id: &str, hunks: Vec<String>) -> Result<()> {
    let snapshot = ctx.engine.workspaces().copy_patches(
        workspace_id,
        source_id,
        &ctx.actor,
        &selection(hunks),
    )?;

    let human = snapshot_human(
        format!("mainline workspace take: hunks copied from {source_id}"),
        snapshot.as_ref(),
    );
    emit_success(
        ctx.output,
        "workspace take",
        &SnapshotReport {
            workspace_id: workspace_id.to_string(),
            snapshot,
        },
        Some(&human),
    )
}

fn run_archive(ctx: &Context, workspace_id: &str) -> Result<()> {
    let workspace = ctx.engine.workspaces().archive(workspace_id)?;

    let mut human = HumanOutput::new(format!("mainline workspace archive: {}", workspace.name));
    human.push_next_step(format!("mainline workspace unarchive {}", workspace.id));

    emit_success(ctx.output, "workspace archive", &workspace, Some(&human))
}

fn run_unarchive(ctx: &Context, workspace_id: &str) -> Result<()> {
    let workspace = ctx.engine.workspaces().unarchive(workspace_id)?;
    let human = HumanOutput::new(format!("mainline workspace unarchive: {}", workspace.name));
    emit_success(ctx.output, "workspace unarchive", &workspace, Some(&human))
}

#[derive(Serialize)]
struct StateReport {
    workspace: Workspace,
    state: WorkspaceState,
    up_to_date: bool,
    head_change: Option<Change>,
}

fn run_state(ctx: &Context, workspace_id: &str) -> Result<()> {
    let workspaces = ctx.engine.workspaces();
    let up_to_date = workspaces.is_up_to_date(workspace_id)?;
    let head_change = workspaces.head_change(workspace_id)?;
    let workspace = workspaces.get(workspace_id)?;
    let state = workspace.state();

    let mut human = HumanOutput::new(format!("mainline workspace state: {state:?}"));
    human.push_summary("workspace", workspace.id.clone());
    human.push_summary(
        "view",
        workspace.view_id.clone().unwrap_or_else(|| "detached".to_string()),
    );
    human.push_summary("up to date", up_to_date.to_string());
    if let Some(change) = &head_change {
        human.push_summary("based on", format!("{} {}", change.id, change.title));
    }
    if let Some(count) = workspace.diffs_count {
        human.push_summary("files", count.to_string());
    }

    emit_success(
        ctx.output,
        "workspace state",
        &StateReport {
            workspace,
            state,
            up_to_date,
            head_change,
        },
        Some(&human),
    )
}
