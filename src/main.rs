//! mainline - collaborative version control backend CLI
//!
//! Drives codebases, workspaces, views and snapshots over a local data root.

use clap::Parser;
use mainline::cli::Cli;
use mainline::output::{emit_error, infer_command_name_from_args};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Diagnostics are opt-in through `RUST_LOG` and never touch stdout, which
/// belongs to command output and `--events -`.
fn init_tracing() {
    let filter = std::env::var("RUST_LOG")
        .ok()
        .filter(|raw| !raw.trim().is_empty())
        .and_then(|raw| EnvFilter::try_new(raw.trim()).ok())
        .unwrap_or_else(|| EnvFilter::new("off"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(filter)
        .init();
}

fn main() {
    init_tracing();

    let command = infer_command_name_from_args();
    let cli = Cli::parse();
    // events streamed to stdout would interleave with a JSON envelope
    let json = cli.json && cli.events.as_deref().map(str::trim) != Some("-");

    if let Err(err) = cli.run() {
        let _ = emit_error(&command, &err, json);
        std::process::exit(err.exit_code());
    }
}
