#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use git2::{Oid, Repository, Signature};
use mainline::codebase::Codebase;
use mainline::config::{Config, UserConfig};
use mainline::diff::{FileDiff, Selection};
use mainline::events::Broker;
use mainline::view::View;
use mainline::workspace::{CreateOptions, LandOutcome, LandRequest, Workspace};
use mainline::Engine;
use tempfile::TempDir;

pub type TestResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

pub const MAINLINE_REF: &str = "refs/heads/mainline";

/// A temporary data root with one codebase and two known users.
pub struct TestEnv {
    dir: TempDir,
    pub engine: Engine,
    pub codebase: Codebase,
}

impl TestEnv {
    pub fn new() -> TestResult<Self> {
        Self::with_config(test_config())
    }

    pub fn with_config(config: Config) -> TestResult<Self> {
        let dir = tempfile::tempdir()?;
        let engine = Engine::with_config(dir.path(), config)?;
        let codebase = engine.codebases().create("demo", false)?;
        Ok(Self {
            dir,
            engine,
            codebase,
        })
    }

    /// Environment whose events also reach a broker the test can subscribe to.
    pub fn with_broker() -> TestResult<(Self, Arc<Broker>)> {
        let mut env = Self::new()?;
        let broker = Arc::new(Broker::new(64));
        env.engine = env.engine.with_events(broker.clone());
        Ok((env, broker))
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn trunk(&self) -> TestResult<Repository> {
        let path = self.engine.storage().trunk_dir(&self.codebase.id);
        Ok(Repository::open(path)?)
    }

    pub fn view(&self, user: &str) -> TestResult<View> {
        Ok(self.engine.views().create(&self.codebase.id, user)?)
    }

    pub fn workspace(&self, user: &str, name: &str) -> TestResult<Workspace> {
        let options = CreateOptions {
            name: Some(name.to_string()),
            ..CreateOptions::default()
        };
        Ok(self
            .engine
            .workspaces()
            .create(&self.codebase.id, user, &options)?)
    }

    /// New workspace opened in a new view of the same user.
    pub fn open_workspace(&self, user: &str, name: &str) -> TestResult<(View, Workspace)> {
        let view = self.view(user)?;
        let workspace = self.workspace(user, name)?;
        let view = self.engine.views().open_workspace(&view.id, &workspace.id)?;
        let workspace = self.engine.workspaces().get(&workspace.id)?;
        Ok((view, workspace))
    }

    pub fn write(&self, view: &View, rel_path: &str, contents: &str) -> TestResult<PathBuf> {
        let path = view.path.join(rel_path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, contents)?;
        Ok(path)
    }

    pub fn read(&self, view: &View, rel_path: &str) -> Option<String> {
        fs::read_to_string(view.path.join(rel_path)).ok()
    }

    pub fn diffs(&self, workspace_id: &str, user: &str) -> TestResult<Vec<FileDiff>> {
        let allower = self.engine.allower_for(user, &self.codebase.id)?;
        Ok(self.engine.workspaces().diffs(workspace_id, &allower)?)
    }

    pub fn land(
        &self,
        workspace_id: &str,
        user: &str,
        ids: &[String],
        description: &str,
    ) -> mainline::Result<LandOutcome> {
        self.engine.workspaces().land(&LandRequest {
            workspace_id: workspace_id.to_string(),
            actor: user.to_string(),
            patch_ids: selection(ids),
            description: Some(description.to_string()),
        })
    }

    /// Land every visible id of the workspace.
    pub fn land_all(
        &self,
        workspace_id: &str,
        user: &str,
        description: &str,
    ) -> TestResult<LandOutcome> {
        let ids = all_ids(&self.diffs(workspace_id, user)?);
        Ok(self.land(workspace_id, user, &ids, description)?)
    }

    pub fn mainline_tip(&self) -> TestResult<Oid> {
        let trunk = self.trunk()?;
        let tip = trunk.find_reference(MAINLINE_REF)?.peel_to_commit()?;
        Ok(tip.id())
    }

    /// Content of a file at the mainline tip.
    pub fn mainline_file(&self, rel_path: &str) -> TestResult<Option<String>> {
        let trunk = self.trunk()?;
        let tree = trunk.find_reference(MAINLINE_REF)?.peel_to_tree()?;
        let entry = match tree.get_path(Path::new(rel_path)) {
            Ok(entry) => entry,
            Err(err) if err.code() == git2::ErrorCode::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let blob = trunk.find_blob(entry.id())?;
        Ok(Some(String::from_utf8_lossy(blob.content()).into_owned()))
    }

    /// Commit a top-level file straight onto mainline, bypassing the engine.
    pub fn push_external(
        &self,
        rel_path: &str,
        contents: &str,
        email: &str,
        message: &str,
    ) -> TestResult<Oid> {
        let trunk = self.trunk()?;
        let tip = trunk.find_reference(MAINLINE_REF)?.peel_to_commit()?;
        let blob = trunk.blob(contents.as_bytes())?;
        let mut builder = trunk.treebuilder(Some(&tip.tree()?))?;
        builder.insert(rel_path, blob, 0o100644)?;
        let tree = trunk.find_tree(builder.write()?)?;
        let sig = Signature::now("external", email)?;
        Ok(trunk.commit(Some(MAINLINE_REF), &sig, &sig, message, &tree, &[&tip])?)
    }
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.locks.timeout_ms = 10_000;
    config.users = vec![
        UserConfig {
            id: "alice".to_string(),
            name: "Alice".to_string(),
            email: "alice@example.com".to_string(),
        },
        UserConfig {
            id: "bob".to_string(),
            name: "Bob".to_string(),
            email: "bob@example.com".to_string(),
        },
    ];
    config
}

pub fn selection(ids: &[String]) -> Selection {
    ids.iter().cloned().collect()
}

pub fn file<'a>(files: &'a [FileDiff], path: &str) -> &'a FileDiff {
    files
        .iter()
        .find(|file| file.preferred_name == path)
        .unwrap_or_else(|| panic!("no diff for {path}"))
}

pub fn hunk_ids(files: &[FileDiff], path: &str) -> Vec<String> {
    file(files, path).hunks.iter().map(|h| h.id.clone()).collect()
}

pub fn all_ids(files: &[FileDiff]) -> Vec<String> {
    files
        .iter()
        .filter(|file| !file.is_hidden)
        .flat_map(|file| file.ids().map(String::from).collect::<Vec<_>>())
        .collect()
}

pub fn paths(files: &[FileDiff]) -> Vec<&str> {
    files.iter().map(|file| file.preferred_name.as_str()).collect()
}

pub fn mainline_cmd(root: &Path) -> assert_cmd::Command {
    let mut cmd = assert_cmd::Command::cargo_bin("mainline").expect("mainline binary");
    cmd.env("MAINLINE_ROOT", root)
        .env_remove("MAINLINE_ACTOR")
        .env_remove("RUST_LOG");
    cmd
}
