//! mainline changelog command

use serde::Serialize;

use super::Context;
use crate::error::Result;
use crate::ledger::Change;
use crate::output::{emit_success, HumanOutput};

#[derive(Serialize)]
struct ChangelogReport {
    codebase_id: String,
    changes: Vec<Change>,
}

pub fn run(ctx: &Context, codebase_id: &str, limit: usize) -> Result<()> {
    let changes = ctx.engine.ledger().changelog(codebase_id, limit)?;

    let mut human = HumanOutput::new(format!("mainline changelog: {} change(s)", changes.len()));
    for change in &changes {
        let short = change.commit_id.get(..10).unwrap_or(&change.commit_id);
        human.push_detail(format!(
            "{short}  {}  {}",
            change.user_id.as_deref().unwrap_or(&change.git_creator_name),
            change.title
        ));
    }

    emit_success(
        ctx.output,
        "changelog",
        &ChangelogReport {
            codebase_id: codebase_id.to_string(),
            changes,
        },
        Some(&human),
    )
}
