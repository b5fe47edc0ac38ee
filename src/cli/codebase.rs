//! Codebase commands
//!
//! Implements `mainline codebase create|list|acl|repair`.

use serde::Serialize;

use super::{CodebaseCommands, Context};
use crate::acl::AclRule;
use crate::codebase::Codebase;
use crate::error::Result;
use crate::output::{emit_success, HumanOutput};

pub fn run(ctx: &Context, cmd: CodebaseCommands) -> Result<()> {
    match cmd {
        CodebaseCommands::Create { name, public } => run_create(ctx, &name, public),
        CodebaseCommands::List => run_list(ctx),
        CodebaseCommands::Acl {
            codebase,
            user,
            patterns,
        } => run_acl(ctx, &codebase, &user, patterns),
        CodebaseCommands::Repair { codebase } => run_repair(ctx, &codebase),
    }
}

fn run_create(ctx: &Context, name: &str, public: bool) -> Result<()> {
    let codebase = ctx.engine.codebases().create(name, public)?;

    let mut human = HumanOutput::new(format!("mainline codebase create: {}", codebase.name));
    human.push_summary("id", codebase.id.clone());
    human.push_summary("public", codebase.is_public.to_string());
    human.push_next_step(format!(
        "mainline workspace create --codebase {}",
        codebase.id
    ));
    human.push_next_step(format!("mainline view create --codebase {}", codebase.id));

    emit_success(ctx.output, "codebase create", &codebase, Some(&human))
}

#[derive(Serialize)]
struct ListReport {
    codebases: Vec<Codebase>,
}

fn run_list(ctx: &Context) -> Result<()> {
    let codebases = ctx.engine.codebases().list()?;

    let mut human = HumanOutput::new(format!("mainline codebase list: {}", codebases.len()));
    for codebase in &codebases {
        human.push_detail(format!("{}  {}", codebase.id, codebase.name));
    }

    emit_success(ctx.output, "codebase list", &ListReport { codebases }, Some(&human))
}

fn run_acl(ctx: &Context, codebase_id: &str, user: &str, patterns: Vec<String>) -> Result<()> {
    let codebases = ctx.engine.codebases();
    let mut acl: Vec<AclRule> = codebases
        .get(codebase_id)?
        .acl
        .into_iter()
        .filter(|rule| rule.identity != user)
        .collect();
    acl.push(AclRule {
        identity: user.to_string(),
        patterns,
    });
    let codebase = codebases.set_acl(codebase_id, acl)?;

    let mut human = HumanOutput::new(format!("mainline codebase acl: {}", codebase.name));
    for rule in &codebase.acl {
        human.push_detail(format!("{}: {}", rule.identity, rule.patterns.join(" ")));
    }

    emit_success(ctx.output, "codebase acl", &codebase, Some(&human))
}

#[derive(Serialize)]
struct RepairReport {
    codebase_id: String,
    repaired: bool,
}

fn run_repair(ctx: &Context, codebase_id: &str) -> Result<()> {
    let repaired = ctx.engine.codebases().ensure_status(codebase_id)?;

    let header = if repaired {
        "mainline codebase repair: root commit recreated"
    } else {
        "mainline codebase repair: nothing to do"
    };
    let human = HumanOutput::new(header);
    emit_success(
        ctx.output,
        "codebase repair",
        &RepairReport {
            codebase_id: codebase_id.to_string(),
            repaired,
        },
        Some(&human),
    )
}
