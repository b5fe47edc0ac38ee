//! mainline jobs command

use serde::Serialize;

use super::Context;
use crate::error::Result;
use crate::output::{emit_success, HumanOutput};

#[derive(Serialize)]
struct JobsReport {
    ran: usize,
}

pub fn run(ctx: &Context) -> Result<()> {
    let ran = ctx.engine.run_pending_jobs()?;
    let human = HumanOutput::new(format!("mainline jobs run: {ran} job(s)"));
    emit_success(ctx.output, "jobs run", &JobsReport { ran }, Some(&human))
}
