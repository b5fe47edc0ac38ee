mod support;

use std::fs;
use std::sync::{Arc, Mutex};

use mainline::error::Error;
use mainline::jobs::{Job, JobQueue};
use mainline::snapshot::SnapshotAction;
use mainline::workspace::{Reviews, WorkspaceState};

use support::{all_ids, file, hunk_ids, paths, TestEnv, TestResult};

#[test]
fn new_file_lands_and_leaves_workspace_clean() -> TestResult {
    let env = TestEnv::new()?;
    let (view, ws) = env.open_workspace("alice", "greeting")?;
    env.engine
        .workspaces()
        .set_draft_description(&ws.id, "Add greeting")?;
    env.write(&view, "a.txt", "hello\n")?;

    let files = env.diffs(&ws.id, "alice")?;
    assert_eq!(files.len(), 1);
    assert!(files[0].is_new);
    assert_eq!(files[0].hunks.len(), 1);

    let outcome = env.engine.workspaces().land(&mainline::workspace::LandRequest {
        workspace_id: ws.id.clone(),
        actor: "alice".to_string(),
        patch_ids: support::selection(&hunk_ids(&files, "a.txt")),
        description: None,
    })?;

    assert_eq!(outcome.change.title, "Add greeting");
    assert_eq!(outcome.change.user_id.as_deref(), Some("alice"));
    assert_eq!(outcome.remaining, 0);
    assert_eq!(env.mainline_file("a.txt")?.as_deref(), Some("hello\n"));
    assert_eq!(outcome.change.commit_id, env.mainline_tip()?.to_string());

    assert!(env.diffs(&ws.id, "alice")?.is_empty());
    let ws = env.engine.workspaces().get(&ws.id)?;
    assert!(ws.draft_description.is_empty());
    assert_eq!(ws.state(), WorkspaceState::Landed);
    Ok(())
}

#[test]
fn pure_rename_lands_without_content_change() -> TestResult {
    let env = TestEnv::new()?;
    let (view, ws) = env.open_workspace("alice", "rename")?;
    env.write(&view, "test.txt", "one\ntwo\nthree\n")?;
    env.land_all(&ws.id, "alice", "Add test file")?;

    fs::rename(view.path.join("test.txt"), view.path.join("test-2.txt"))?;
    let files = env.diffs(&ws.id, "alice")?;
    assert_eq!(files.len(), 1);
    let moved = &files[0];
    assert!(moved.is_moved);
    assert!(moved.hunks.is_empty());
    assert_eq!(moved.orig_name, "test.txt");
    assert_eq!(moved.new_name, "test-2.txt");

    env.land(&ws.id, "alice", &[moved.id.clone()], "Rename test file")?;
    assert_eq!(env.mainline_file("test.txt")?, None);
    assert_eq!(
        env.mainline_file("test-2.txt")?.as_deref(),
        Some("one\ntwo\nthree\n")
    );
    assert!(env.diffs(&ws.id, "alice")?.is_empty());
    Ok(())
}

#[test]
fn competing_edits_conflict_after_first_land() -> TestResult {
    let env = TestEnv::new()?;
    let (seed_view, seed) = env.open_workspace("alice", "seed")?;
    env.write(&seed_view, "shared.txt", "original\n")?;
    env.land_all(&seed.id, "alice", "Seed shared file")?;

    let (first_view, first) = env.open_workspace("alice", "first")?;
    let (second_view, second) = env.open_workspace("bob", "second")?;
    assert_eq!(env.read(&second_view, "shared.txt").as_deref(), Some("original\n"));

    env.write(&first_view, "shared.txt", "first edit\n")?;
    env.write(&second_view, "shared.txt", "second edit\n")?;
    assert!(!env.engine.workspaces().has_conflicts(&second.id)?);

    env.land_all(&first.id, "alice", "First edit")?;

    let ids = all_ids(&env.diffs(&second.id, "bob")?);
    let err = env
        .land(&second.id, "bob", &ids, "Second edit")
        .expect_err("second land must conflict");
    assert!(matches!(err, Error::Conflict(_)), "unexpected error: {err}");
    assert!(env.engine.workspaces().has_conflicts(&second.id)?);

    let conflicts = env.engine.workspaces().conflicts(&second.id)?;
    assert_eq!(conflicts[0].path, "shared.txt");
    assert_eq!(env.mainline_file("shared.txt")?.as_deref(), Some("first edit\n"));
    Ok(())
}

#[test]
fn landed_hunk_is_consumed() -> TestResult {
    let env = TestEnv::new()?;
    let (view, ws) = env.open_workspace("alice", "two files")?;
    env.write(&view, "a.txt", "alpha\n")?;
    env.write(&view, "b.txt", "beta\n")?;

    let files = env.diffs(&ws.id, "alice")?;
    let landed = hunk_ids(&files, "a.txt");
    let kept = hunk_ids(&files, "b.txt");
    let outcome = env.land(&ws.id, "alice", &landed, "Add alpha")?;
    assert_eq!(outcome.remaining, 1);

    let after = env.diffs(&ws.id, "alice")?;
    let ids = all_ids(&after);
    assert!(!ids.contains(&landed[0]));
    assert_eq!(hunk_ids(&after, "b.txt"), kept);
    assert_eq!(env.mainline_file("b.txt")?, None);
    assert_eq!(env.read(&view, "b.txt").as_deref(), Some("beta\n"));

    let err = env
        .land(&ws.id, "alice", &landed, "Again")
        .expect_err("consumed hunk cannot land twice");
    assert!(matches!(err, Error::StaleSelection(ref ids) if *ids == landed));
    Ok(())
}

#[test]
fn land_requires_description_and_selection() -> TestResult {
    let env = TestEnv::new()?;
    let (view, ws) = env.open_workspace("alice", "empty")?;
    env.write(&view, "a.txt", "alpha\n")?;
    let ids = all_ids(&env.diffs(&ws.id, "alice")?);

    let err = env.land(&ws.id, "alice", &ids, "  ").expect_err("blank description");
    assert!(matches!(err, Error::Validation(_)));

    let err = env.land(&ws.id, "alice", &[], "Something").expect_err("no ids");
    assert!(matches!(err, Error::Validation(_)));

    let err = env
        .land(&ws.id, "alice", &["not-a-hunk".to_string()], "Something")
        .expect_err("unknown id");
    assert!(matches!(err, Error::StaleSelection(ref ids) if ids[0] == "not-a-hunk"));
    assert_eq!(env.mainline_file("a.txt")?, None);
    Ok(())
}

#[test]
fn detached_land_records_baseline_snapshot() -> TestResult {
    let env = TestEnv::new()?;
    let (view, ws) = env.open_workspace("alice", "detached")?;
    env.write(&view, "a.txt", "alpha\n")?;
    env.write(&view, "b.txt", "beta\n")?;
    env.engine.views().close(&view.id)?;

    let ws = env.engine.workspaces().get(&ws.id)?;
    assert!(ws.is_detached());
    assert_eq!(ws.state(), WorkspaceState::Detached);

    let files = env.diffs(&ws.id, "alice")?;
    assert_eq!(paths(&files), vec!["a.txt", "b.txt"]);
    env.land(&ws.id, "alice", &hunk_ids(&files, "a.txt"), "Add alpha")?;

    let ws = env.engine.workspaces().get(&ws.id)?;
    let latest = ws.latest_snapshot_id.clone().expect("baseline snapshot");
    let snapshot = env.engine.snapshots().get(&latest)?;
    assert_eq!(snapshot.action, SnapshotAction::LandBaseline);
    assert_eq!(paths(&env.diffs(&ws.id, "alice")?), vec!["b.txt"]);
    assert!(env.engine.workspaces().is_up_to_date(&ws.id)?);

    env.land_all(&ws.id, "alice", "Add beta")?;
    let ws = env.engine.workspaces().get(&ws.id)?;
    assert_eq!(ws.latest_snapshot_id, None);
    assert_eq!(ws.diffs_count, Some(0));
    assert!(env.diffs(&ws.id, "alice")?.is_empty());
    assert_eq!(env.mainline_file("b.txt")?.as_deref(), Some("beta\n"));
    Ok(())
}

#[test]
fn stale_view_is_rebased_onto_landed_commit() -> TestResult {
    let env = TestEnv::new()?;
    let (other_view, other) = env.open_workspace("bob", "other")?;
    let (view, ws) = env.open_workspace("alice", "stale")?;

    env.write(&other_view, "other.txt", "from bob\n")?;
    env.land_all(&other.id, "bob", "Bob's file")?;
    assert!(!env.engine.workspaces().is_up_to_date(&ws.id)?);

    env.write(&view, "a.txt", "alpha\n")?;
    env.write(&view, "b.txt", "beta\n")?;
    let files = env.diffs(&ws.id, "alice")?;
    env.land(&ws.id, "alice", &hunk_ids(&files, "a.txt"), "Add alpha")?;

    // the view now sits on mainline, which includes bob's file
    assert_eq!(env.read(&view, "other.txt").as_deref(), Some("from bob\n"));
    assert_eq!(env.read(&view, "b.txt").as_deref(), Some("beta\n"));
    assert_eq!(paths(&env.diffs(&ws.id, "alice")?), vec!["b.txt"]);
    assert!(env.engine.workspaces().is_up_to_date(&ws.id)?);

    let head = env.engine.workspaces().head_change(&ws.id)?.expect("head change");
    assert_eq!(head.title, "Add alpha");
    Ok(())
}

#[test]
fn land_enqueues_refresh_and_build() -> TestResult {
    let env = TestEnv::new()?;
    let (view, ws) = env.open_workspace("alice", "jobs")?;
    env.write(&view, "a.txt", "alpha\n")?;
    env.write(&view, "b.txt", "beta\n")?;
    let files = env.diffs(&ws.id, "alice")?;
    env.land(&ws.id, "alice", &hunk_ids(&files, "a.txt"), "Add alpha")?;

    assert_eq!(env.engine.run_pending_jobs()?, 2);
    assert_eq!(env.engine.run_pending_jobs()?, 0);

    let ws = env.engine.workspaces().get(&ws.id)?;
    let latest = env
        .engine
        .snapshots()
        .get(ws.latest_snapshot_id.as_deref().expect("refreshed snapshot"))?;
    assert_eq!(latest.changed_paths, vec!["b.txt".to_string()]);
    assert_eq!(file(&env.diffs(&ws.id, "alice")?, "b.txt").hunks.len(), 1);
    Ok(())
}

struct RecordingReviews(Mutex<Vec<String>>);

impl Reviews for RecordingReviews {
    fn dismiss_all(&self, workspace_id: &str) -> mainline::Result<usize> {
        let mut dismissed = self.0.lock().expect("reviews lock");
        dismissed.push(workspace_id.to_string());
        Ok(1)
    }
}

struct BrokenQueue;

impl JobQueue for BrokenQueue {
    fn enqueue(&self, _job: Job) -> mainline::Result<()> {
        Err(Error::OperationFailed("queue offline".to_string()))
    }

    fn drain(&self) -> mainline::Result<Vec<Job>> {
        Ok(Vec::new())
    }
}

#[test]
fn land_dismisses_reviews_and_survives_queue_failure() -> TestResult {
    let mut env = TestEnv::new()?;
    let reviews = Arc::new(RecordingReviews(Mutex::new(Vec::new())));
    env.engine = env
        .engine
        .with_reviews(reviews.clone())
        .with_jobs(Arc::new(BrokenQueue));

    let (view, ws) = env.open_workspace("alice", "reviewed")?;
    env.write(&view, "a.txt", "alpha\n")?;
    let outcome = env.land_all(&ws.id, "alice", "Reviewed change")?;

    assert_eq!(outcome.change.title, "Reviewed change");
    assert_eq!(env.mainline_file("a.txt")?.as_deref(), Some("alpha\n"));
    assert_eq!(*reviews.0.lock().expect("reviews lock"), vec![ws.id.clone()]);
    assert_eq!(env.engine.run_pending_jobs()?, 0);
    Ok(())
}

fn numbered(lines: impl Iterator<Item = usize>) -> String {
    lines.map(|n| format!("line {n}\n")).collect()
}

fn seed_numbered_file(env: &TestEnv) -> TestResult {
    let (view, seed) = env.open_workspace("alice", "seed")?;
    env.write(&view, "f.txt", &numbered(1..=30))?;
    env.land_all(&seed.id, "alice", "Seed f.txt")?;
    Ok(())
}

#[test]
fn workspace_behind_mainline_lands_disjoint_edit() -> TestResult {
    let env = TestEnv::new()?;
    seed_numbered_file(&env)?;
    let (trim_view, trim) = env.open_workspace("alice", "trim")?;
    let (edit_view, edit) = env.open_workspace("bob", "edit")?;

    env.write(&trim_view, "f.txt", &numbered(6..=30))?;
    env.land_all(&trim.id, "alice", "Drop the first lines")?;

    let spelled = |text: String| text.replace("line 25\n", "line twenty-five\n");
    env.write(&edit_view, "f.txt", &spelled(numbered(1..=30)))?;
    assert!(!env.engine.workspaces().has_conflicts(&edit.id)?);

    let outcome = env.land_all(&edit.id, "bob", "Spell out 25")?;
    assert_eq!(outcome.remaining, 0);
    let expected = spelled(numbered(6..=30));
    assert_eq!(env.mainline_file("f.txt")?.as_deref(), Some(expected.as_str()));
    assert_eq!(env.read(&edit_view, "f.txt").as_deref(), Some(expected.as_str()));
    assert!(env.diffs(&edit.id, "bob")?.is_empty());
    Ok(())
}

#[test]
fn detached_partial_land_keeps_only_unlanded_hunk() -> TestResult {
    let env = TestEnv::new()?;
    seed_numbered_file(&env)?;
    let (view, ws) = env.open_workspace("alice", "partial")?;
    let edited = numbered(1..=30)
        .replace("line 2\nline 3\nline 4\n", "")
        .replace("line 25\n", "line twenty-five\n");
    env.write(&view, "f.txt", &edited)?;
    env.engine.views().close(&view.id)?;

    let ids = hunk_ids(&env.diffs(&ws.id, "alice")?, "f.txt");
    assert_eq!(ids.len(), 2);
    let outcome = env.land(&ws.id, "alice", &ids[..1], "Drop lines 2-4")?;
    assert_eq!(outcome.remaining, 1);
    let landed = numbered(1..=30).replace("line 2\nline 3\nline 4\n", "");
    assert_eq!(env.mainline_file("f.txt")?.as_deref(), Some(landed.as_str()));

    let ws = env.engine.workspaces().get(&ws.id)?;
    let baseline = env.engine.snapshots().get(ws.latest_snapshot_id.as_deref().expect("baseline"))?;
    assert_eq!(baseline.action, SnapshotAction::LandBaseline);
    assert_eq!(hunk_ids(&env.diffs(&ws.id, "alice")?, "f.txt"), vec![ids[1].clone()]);

    let err = env
        .land(&ws.id, "alice", &ids[..1], "Again")
        .expect_err("landed hunk is gone from the workspace");
    assert!(matches!(err, Error::StaleSelection(ref stale) if *stale == ids[..1]));

    env.land(&ws.id, "alice", &ids[1..], "Spell out 25")?;
    assert_eq!(env.mainline_file("f.txt")?.as_deref(), Some(edited.as_str()));
    Ok(())
}
