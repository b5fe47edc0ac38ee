mod support;

use mainline::acl::AclRule;
use mainline::error::Error;
use mainline::events::{EventKind, Topic};
use mainline::snapshot::SnapshotAction;
use mainline::workspace::{CreateOptions, WorkspaceState};

use support::{all_ids, file, hunk_ids, paths, selection, TestEnv, TestResult};

#[test]
fn workspace_is_open_in_one_view_at_a_time() -> TestResult {
    let env = TestEnv::new()?;
    let (first_view, ws) = env.open_workspace("alice", "moving")?;
    env.write(&first_view, "a.txt", "alpha\n")?;

    let second_view = env.view("alice")?;
    let second_view = env.engine.views().open_workspace(&second_view.id, &ws.id)?;

    let first_view = env.engine.views().get(&first_view.id)?;
    let ws = env.engine.workspaces().get(&ws.id)?;
    assert_eq!(first_view.workspace_id, None);
    assert_eq!(second_view.workspace_id.as_deref(), Some(ws.id.as_str()));
    assert_eq!(ws.view_id.as_deref(), Some(second_view.id.as_str()));

    // the final snapshot of the first view follows the workspace
    assert_eq!(env.read(&second_view, "a.txt").as_deref(), Some("alpha\n"));
    assert_eq!(paths(&env.diffs(&ws.id, "alice")?), vec!["a.txt"]);
    Ok(())
}

#[test]
fn closing_a_view_detaches_onto_the_latest_snapshot() -> TestResult {
    let env = TestEnv::new()?;
    let (view, ws) = env.open_workspace("alice", "closing")?;
    env.write(&view, "a.txt", "alpha\n")?;
    let live = env.diffs(&ws.id, "alice")?;

    let view = env.engine.views().close(&view.id)?;
    assert_eq!(view.workspace_id, None);

    let ws = env.engine.workspaces().get(&ws.id)?;
    assert!(ws.is_detached());
    let latest = env
        .engine
        .snapshots()
        .get(ws.latest_snapshot_id.as_deref().expect("release snapshot"))?;
    assert_eq!(latest.action, SnapshotAction::Sync);
    assert_eq!(hunk_ids(&env.diffs(&ws.id, "alice")?, "a.txt"), hunk_ids(&live, "a.txt"));

    // reopening restores the working tree
    let view = env.engine.views().open_workspace(&view.id, &ws.id)?;
    assert_eq!(env.read(&view, "a.txt").as_deref(), Some("alpha\n"));
    Ok(())
}

#[test]
fn other_users_edits_notify_owner_views() -> TestResult {
    let (env, broker) = TestEnv::with_broker()?;
    let (_alice_view, ws) = env.open_workspace("alice", "shared")?;
    let idle_view = env.view("alice")?;
    let events = broker.subscribe(Topic::View(idle_view.id.clone()));

    let bob_view = env.view("bob")?;
    let bob_view = env.engine.views().open_workspace(&bob_view.id, &ws.id)?;
    env.write(&bob_view, "a.txt", "from bob\n")?;
    env.engine.workspaces().refresh_snapshot(&ws.id)?;

    let received: Vec<_> = events.try_iter().collect();
    assert!(received
        .iter()
        .any(|event| event.event == EventKind::ViewUpdated
            && event.actor.as_deref() == Some("bob")));
    Ok(())
}

#[test]
fn archived_workspace_cannot_be_opened_until_restored() -> TestResult {
    let env = TestEnv::new()?;
    let (view, ws) = env.open_workspace("alice", "archive me")?;
    env.write(&view, "a.txt", "alpha\n")?;

    let ws = env.engine.workspaces().archive(&ws.id)?;
    assert_eq!(ws.state(), WorkspaceState::Archived);
    assert!(ws.view_id.is_none());
    assert!(ws.latest_snapshot_id.is_some());
    assert_eq!(env.engine.views().get(&view.id)?.workspace_id, None);

    let err = env
        .engine
        .views()
        .open_workspace(&view.id, &ws.id)
        .expect_err("archived");
    assert!(matches!(err, Error::Validation(_)));
    let err = env.land_all(&ws.id, "alice", "Archived land").expect_err("archived");
    assert!(err.to_string().contains("archived"));

    let ws = env.engine.workspaces().unarchive(&ws.id)?;
    assert_eq!(ws.state(), WorkspaceState::Detached);
    assert!(ws.unarchived_at.is_some());
    env.engine.views().open_workspace(&view.id, &ws.id)?;
    assert_eq!(env.read(&view, "a.txt").as_deref(), Some("alpha\n"));
    Ok(())
}

#[test]
fn revert_workspace_undoes_a_change() -> TestResult {
    let env = TestEnv::new()?;
    let (view, ws) = env.open_workspace("alice", "feature")?;
    env.write(&view, "f.txt", "feature\n")?;
    let landed = env.land_all(&ws.id, "alice", "Add feature")?;

    let revert = env.engine.workspaces().create(
        &env.codebase.id,
        "bob",
        &CreateOptions {
            revert_change_id: Some(landed.change.id.clone()),
            ..CreateOptions::default()
        },
    )?;
    assert_eq!(revert.name, "Revert Add feature");
    assert_eq!(revert.draft_description, "Revert \"Add feature\"");
    let snapshot = env
        .engine
        .snapshots()
        .get(revert.latest_snapshot_id.as_deref().expect("revert snapshot"))?;
    assert_eq!(snapshot.action, SnapshotAction::Revert);

    let files = env.diffs(&revert.id, "bob")?;
    assert!(file(&files, "f.txt").is_deleted);

    let outcome = env.engine.workspaces().land(&mainline::workspace::LandRequest {
        workspace_id: revert.id.clone(),
        actor: "bob".to_string(),
        patch_ids: selection(&all_ids(&files)),
        description: None,
    })?;
    assert_eq!(outcome.change.title, "Revert \"Add feature\"");
    assert_eq!(env.mainline_file("f.txt")?, None);
    Ok(())
}

#[test]
fn workspace_based_on_older_change_is_not_up_to_date() -> TestResult {
    let env = TestEnv::new()?;
    let (view, ws) = env.open_workspace("alice", "history")?;
    env.write(&view, "a.txt", "alpha\n")?;
    let first = env.land_all(&ws.id, "alice", "First")?.change;
    env.write(&view, "b.txt", "beta\n")?;
    let second = env.land_all(&ws.id, "alice", "Second")?.change;

    let old = env.engine.workspaces().create(
        &env.codebase.id,
        "bob",
        &CreateOptions {
            base_change_id: Some(first.id.clone()),
            ..CreateOptions::default()
        },
    )?;
    let workspaces = env.engine.workspaces();
    assert!(!workspaces.is_up_to_date(&old.id)?);
    assert_eq!(workspaces.head_change(&old.id)?.map(|c| c.id), Some(first.id.clone()));
    assert!(workspaces.get(&old.id)?.head_change_computed);

    let fresh = env.workspace("bob", "fresh")?;
    assert!(workspaces.is_up_to_date(&fresh.id)?);
    assert_eq!(workspaces.head_change(&fresh.id)?.map(|c| c.id), Some(second.id));
    assert_eq!(fresh.name, "fresh");
    assert_eq!(fresh.state(), WorkspaceState::Fresh);
    Ok(())
}

#[test]
fn exclusive_create_options_are_rejected() -> TestResult {
    let env = TestEnv::new()?;
    let err = env
        .engine
        .workspaces()
        .create(
            &env.codebase.id,
            "alice",
            &CreateOptions {
                base_change_id: Some("a".into()),
                revert_change_id: Some("b".into()),
                ..CreateOptions::default()
            },
        )
        .expect_err("exclusive options");
    assert!(matches!(err, Error::Validation(_)));
    assert!(env.engine.workspaces().list(&env.codebase.id)?.is_empty());
    Ok(())
}

#[test]
fn workspace_copy_carries_content() -> TestResult {
    let env = TestEnv::new()?;
    let (view, source) = env.open_workspace("alice", "original")?;
    env.write(&view, "a.txt", "alpha\n")?;
    env.engine
        .workspaces()
        .set_draft_description(&source.id, "Work in progress")?;

    let copy = env
        .engine
        .workspaces()
        .create_from_workspace(&source.id, "bob", None)?;
    assert_eq!(copy.name, "original (copy)");
    assert_eq!(copy.user_id, "bob");
    assert_eq!(copy.draft_description, "Work in progress");
    assert!(copy.is_detached());
    assert_eq!(
        hunk_ids(&env.diffs(&copy.id, "bob")?, "a.txt"),
        hunk_ids(&env.diffs(&source.id, "alice")?, "a.txt")
    );
    Ok(())
}

#[test]
fn patches_move_between_workspaces() -> TestResult {
    let env = TestEnv::new()?;
    let (source_view, source) = env.open_workspace("alice", "source")?;
    env.write(&source_view, "a.txt", "alpha\n")?;
    env.write(&source_view, "b.txt", "beta\n")?;
    let (target_view, target) = env.open_workspace("bob", "target")?;

    let files = env.diffs(&source.id, "alice")?;
    let wanted = selection(&hunk_ids(&files, "a.txt"));
    let snapshot = env
        .engine
        .workspaces()
        .copy_patches(&target.id, &source.id, "bob", &wanted)?
        .expect("extract snapshot");
    assert_eq!(snapshot.action, SnapshotAction::Extract);
    assert_eq!(env.read(&target_view, "a.txt").as_deref(), Some("alpha\n"));
    assert_eq!(env.read(&target_view, "b.txt"), None);
    assert_eq!(paths(&env.diffs(&target.id, "bob")?), vec!["a.txt"]);

    // the source keeps its hunks
    assert_eq!(paths(&env.diffs(&source.id, "alice")?), vec!["a.txt", "b.txt"]);
    Ok(())
}

#[test]
fn removed_patches_leave_the_rest() -> TestResult {
    let env = TestEnv::new()?;
    let (view, ws) = env.open_workspace("alice", "undo")?;
    env.write(&view, "a.txt", "alpha\n")?;
    env.write(&view, "b.txt", "beta\n")?;
    env.write(&view, "c.txt", "gamma\n")?;

    let files = env.diffs(&ws.id, "alice")?;
    let undo = selection(&hunk_ids(&files, "a.txt"));
    let snapshot = env
        .engine
        .workspaces()
        .remove_patches(&ws.id, "alice", &undo)?
        .expect("undo snapshot");
    assert_eq!(snapshot.action, SnapshotAction::UndoPatch);
    assert_eq!(env.read(&view, "a.txt"), None);
    assert_eq!(paths(&env.diffs(&ws.id, "alice")?), vec!["b.txt", "c.txt"]);

    env.engine.views().close(&view.id)?;
    let files = env.diffs(&ws.id, "alice")?;
    let undo = selection(&hunk_ids(&files, "b.txt"));
    env.engine.workspaces().remove_patches(&ws.id, "alice", &undo)?;
    let ws = env.engine.workspaces().get(&ws.id)?;
    let latest = env
        .engine
        .snapshots()
        .get(ws.latest_snapshot_id.as_deref().expect("detached undo"))?;
    assert_eq!(latest.action, SnapshotAction::UndoPatch);
    assert_eq!(paths(&env.diffs(&ws.id, "alice")?), vec!["c.txt"]);
    Ok(())
}

#[test]
fn hidden_paths_are_redacted_and_survive_landing() -> TestResult {
    let env = TestEnv::new()?;
    env.engine.codebases().set_acl(
        &env.codebase.id,
        vec![
            AclRule::new("alice", &["src/"]),
            AclRule::new("bob", &["*"]),
        ],
    )?;
    let (view, ws) = env.open_workspace("alice", "acl")?;
    env.write(&view, "src/lib.txt", "code\n")?;
    env.write(&view, "secret/key.txt", "hunter2\n")?;

    let files = env.diffs(&ws.id, "alice")?;
    assert_eq!(paths(&files), vec!["secret/key.txt", "src/lib.txt"]);
    let hidden = file(&files, "secret/key.txt");
    assert!(hidden.is_hidden);
    assert!(hidden.hunks.is_empty());

    let err = env
        .land(&ws.id, "alice", &[hidden.id.clone()], "Leak")
        .expect_err("hidden file is not selectable");
    assert!(matches!(err, Error::StaleSelection(_)));

    let outcome = env.land_all(&ws.id, "alice", "Add code")?;
    assert_eq!(outcome.remaining, 1);
    assert_eq!(env.mainline_file("src/lib.txt")?.as_deref(), Some("code\n"));
    assert_eq!(env.mainline_file("secret/key.txt")?, None);

    let for_bob = env.diffs(&ws.id, "bob")?;
    assert_eq!(paths(&for_bob), vec!["secret/key.txt"]);
    assert_eq!(for_bob[0].hunks.len(), 1);
    assert!(env.engine.anonymous_allower(&env.codebase.id)?.is_empty());
    Ok(())
}
