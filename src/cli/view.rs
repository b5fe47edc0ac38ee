//! View commands
//!
//! Implements `mainline view create|open|close|list`.

use serde::Serialize;

use super::{Context, ViewCommands};
use crate::error::Result;
use crate::output::{emit_success, HumanOutput};
use crate::view::View;

pub fn run(ctx: &Context, cmd: ViewCommands) -> Result<()> {
    match cmd {
        ViewCommands::Create { codebase } => {
            let view = ctx.engine.views().create(&codebase, &ctx.actor)?;
            let mut human = HumanOutput::new(format!("mainline view create: {}", view.id));
            human.push_summary("path", view.path.display().to_string());
            human.push_next_step(format!("mainline view open {} <workspace>", view.id));
            emit_success(ctx.output, "view create", &view, Some(&human))
        }
        ViewCommands::Open { view, workspace } => {
            let view = ctx.engine.views().open_workspace(&view, &workspace)?;
            let mut human = HumanOutput::new(format!("mainline view open: {workspace}"));
            human.push_summary("view", view.id.clone());
            human.push_summary("path", view.path.display().to_string());
            emit_success(ctx.output, "view open", &view, Some(&human))
        }
        ViewCommands::Close { view } => {
            let view = ctx.engine.views().close(&view)?;
            let human = HumanOutput::new(format!("mainline view close: {}", view.id));
            emit_success(ctx.output, "view close", &view, Some(&human))
        }
        ViewCommands::List { codebase } => {
            #[derive(Serialize)]
            struct ListReport {
                views: Vec<View>,
            }

            let views = ctx.engine.views().list(&codebase)?;
            let mut human = HumanOutput::new(format!("mainline view list: {}", views.len()));
            for view in &views {
                human.push_detail(format!(
                    "{}  {}  {}",
                    view.id,
                    view.user_id,
                    view.workspace_id.as_deref().unwrap_or("-")
                ));
            }
            emit_success(ctx.output, "view list", &ListReport { views }, Some(&human))
        }
    }
}
