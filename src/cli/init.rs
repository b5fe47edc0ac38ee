//! mainline init command implementation
//!
//! Creates the data root layout and a default `mainline.toml`.

use std::path::PathBuf;

use serde::Serialize;

use super::Context;
use crate::config::{Config, CONFIG_FILENAME};
use crate::error::Result;
use crate::output::{emit_success, HumanOutput};

#[derive(Serialize)]
struct InitReport {
    root: PathBuf,
    created_config: bool,
    mainline_branch: String,
}

pub fn run(ctx: &Context) -> Result<()> {
    let root = ctx.engine.storage().root().to_path_buf();
    let config_path = root.join(CONFIG_FILENAME);
    let created_config = !config_path.exists();
    if created_config {
        Config::default().save(&config_path)?;
    }

    let report = InitReport {
        root: root.clone(),
        created_config,
        mainline_branch: ctx.engine.config().mainline_branch.clone(),
    };

    let header = if created_config {
        "mainline init: initialized data root"
    } else {
        "mainline init: nothing to do"
    };
    let mut human = HumanOutput::new(header);
    human.push_summary("root", root.display().to_string());
    human.push_summary(
        "config",
        if created_config { "created" } else { "kept" },
    );
    human.push_next_step("mainline codebase create <name>");

    emit_success(ctx.output, "init", &report, Some(&human))
}
