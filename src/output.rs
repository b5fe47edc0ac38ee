//! Human and JSON output shared by mainline commands.
//!
//! With `--json` every command prints exactly one envelope on stdout:
//!
//! ```text
//! {"schema_version": "mainline.v1", "command": "workspace land",
//!  "status": "success", "data": {...}, "warnings": [...], "next_steps": [...]}
//! ```
//!
//! Failures use `"status": "error"` with an `error` object in place of
//! `data`. Human output goes to stdout; human errors go to stderr.

use std::fmt;

use serde::Serialize;

use crate::error::{Error, ErrorKind, Result};

pub const SCHEMA_VERSION: &str = "mainline.v1";

#[derive(Debug, Clone, Copy)]
pub struct OutputOptions {
    pub json: bool,
    pub quiet: bool,
}

/// Text report: a header line followed by optional sections.
#[derive(Debug, Clone, Default)]
pub struct HumanOutput {
    header: String,
    summary: Vec<(String, String)>,
    details: Vec<String>,
    warnings: Vec<String>,
    next_steps: Vec<String>,
}

impl HumanOutput {
    pub fn new(header: impl Into<String>) -> Self {
        Self {
            header: header.into(),
            ..Self::default()
        }
    }

    pub fn push_summary(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.summary.push((key.into(), value.into()));
    }

    pub fn push_detail(&mut self, value: impl Into<String>) {
        self.details.push(value.into());
    }

    pub fn push_warning(&mut self, value: impl Into<String>) {
        self.warnings.push(value.into());
    }

    pub fn push_next_step(&mut self, value: impl Into<String>) {
        self.next_steps.push(value.into());
    }
}

impl fmt::Display for HumanOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.header)?;
        let summary: Vec<String> = self
            .summary
            .iter()
            .map(|(key, value)| match value.as_str() {
                "" => key.clone(),
                _ => format!("{key}: {value}"),
            })
            .collect();
        for (title, items) in [
            ("Summary", &summary),
            ("Details", &self.details),
            ("Warnings", &self.warnings),
            ("Next steps", &self.next_steps),
        ] {
            if items.is_empty() {
                continue;
            }
            write!(f, "\n\n{title}:")?;
            for item in items {
                write!(f, "\n- {item}")?;
            }
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct Envelope<'a, T: Serialize> {
    schema_version: &'static str,
    command: &'a str,
    #[serde(flatten)]
    outcome: Outcome<'a, T>,
    #[serde(skip_serializing_if = "no_items")]
    warnings: &'a [String],
    #[serde(skip_serializing_if = "no_items")]
    next_steps: &'a [String],
}

#[derive(Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum Outcome<'a, T: Serialize> {
    Success { data: &'a T },
    Error { error: ErrorBody },
}

#[derive(Serialize)]
struct ErrorBody {
    message: String,
    code: i32,
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

fn no_items(items: &&[String]) -> bool {
    items.is_empty()
}

fn print_json<T: Serialize>(envelope: &Envelope<'_, T>) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(envelope)?);
    Ok(())
}

/// Print a command's result as a JSON envelope or as human text.
pub fn emit_success<T: Serialize>(
    options: OutputOptions,
    command: &str,
    data: &T,
    human: Option<&HumanOutput>,
) -> Result<()> {
    if options.json {
        let (warnings, next_steps) = match human {
            Some(human) => (human.warnings.as_slice(), human.next_steps.as_slice()),
            None => (&[][..], &[][..]),
        };
        return print_json(&Envelope {
            schema_version: SCHEMA_VERSION,
            command,
            outcome: Outcome::Success { data },
            warnings,
            next_steps,
        });
    }

    match human {
        Some(human) if !options.quiet => println!("{human}"),
        _ => {}
    }
    Ok(())
}

/// Report a failed command. Human errors go to stderr with one hint.
pub fn emit_error(command: &str, err: &Error, json: bool) -> Result<()> {
    let next_steps = error_next_steps(err);
    if json {
        return print_json::<()>(&Envelope {
            schema_version: SCHEMA_VERSION,
            command,
            outcome: Outcome::Error {
                error: ErrorBody {
                    message: err.to_string(),
                    code: err.exit_code(),
                    kind: error_kind(err),
                    details: err.details(),
                },
            },
            warnings: &[],
            next_steps: &next_steps,
        });
    }

    eprintln!("error: {err}");
    if let Some(hint) = next_steps.first() {
        eprintln!("hint: {hint}");
    }
    Ok(())
}

/// Command label for error envelopes, computed before clap parses so that
/// parse failures still carry it.
pub fn infer_command_name_from_args() -> String {
    command_name(std::env::args().skip(1))
}

fn command_name(args: impl IntoIterator<Item = String>) -> String {
    const GROUPS: [&str; 5] = ["codebase", "workspace", "view", "snapshot", "jobs"];

    let mut words = args.into_iter().filter(|arg| !arg.starts_with('-'));
    let Some(command) = words.next() else {
        return "mainline".to_string();
    };
    if !GROUPS.contains(&command.as_str()) {
        return command;
    }
    match words.next() {
        Some(sub) => format!("{command} {sub}"),
        None => command,
    }
}

fn error_kind(err: &Error) -> &'static str {
    match err.kind() {
        ErrorKind::NotFound => "not_found",
        ErrorKind::Validation => "user_error",
        ErrorKind::RepositoryState => "repository_state",
        ErrorKind::Conflict => "conflict",
        ErrorKind::Transient => "operation_failed",
    }
}

fn error_next_steps(err: &Error) -> Vec<String> {
    let step = match err {
        Error::StaleSelection(_) => "mainline workspace diff <workspace>",
        Error::MainlineMoved(_) => "retry the land",
        Error::UnexpectedBranch { .. } | Error::CantSnapshotWrongBranch(_) => {
            "mainline view open <view> <workspace>"
        }
        Error::Rebasing | Error::CantSnapshotRebasing => "finish or abort the rebase in the view",
        Error::CodebaseNotFound(_) => "mainline codebase list",
        Error::InvalidConfig(_) => "fix mainline.toml then retry",
        Error::LockFailed(_) => "retry once the other operation finishes",
        _ => return Vec::new(),
    };
    vec![step.to_string()]
}
