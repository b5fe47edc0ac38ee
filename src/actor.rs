//! Actor identity management.
//!
//! Actor resolution order:
//! 1) CLI --actor (explicit)
//! 2) MAINLINE_ACTOR environment variable
//! 3) Config default (actor.default) or "unknown"

use crate::config::{Config, UserConfig};
use crate::git::Author;

pub const ACTOR_ENV: &str = "MAINLINE_ACTOR";

/// Resolve the current actor using CLI, environment and config.
pub fn resolve_actor(config: &Config, cli_actor: Option<&str>) -> String {
    if let Some(actor) = non_empty(cli_actor) {
        return actor.to_string();
    }

    if let Ok(env_actor) = std::env::var(ACTOR_ENV) {
        if let Some(actor) = non_empty(Some(env_actor.as_str())) {
            return actor.to_string();
        }
    }

    non_empty(Some(config.actor.default.as_str()))
        .unwrap_or("unknown")
        .to_string()
}

/// Maps users to commit identities and back.
pub trait Identity: Send + Sync {
    /// Signature used for commits made on behalf of `user_id`
    fn author(&self, user_id: &str) -> Author;

    fn knows(&self, user_id: &str) -> bool;

    /// User owning a commit email, if any
    fn user_by_email(&self, email: &str) -> Option<String>;
}

/// Identity backed by the `[[users]]` table of the configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfigIdentity {
    users: Vec<UserConfig>,
}

impl ConfigIdentity {
    pub fn new(users: Vec<UserConfig>) -> Self {
        Self { users }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.users.clone())
    }
}

impl Identity for ConfigIdentity {
    fn author(&self, user_id: &str) -> Author {
        match self.users.iter().find(|user| user.id == user_id) {
            Some(user) => Author::new(&user.name, &user.email),
            None => Author::new(user_id, format!("{user_id}@users.mainline")),
        }
    }

    fn knows(&self, user_id: &str) -> bool {
        self.users.iter().any(|user| user.id == user_id)
    }

    fn user_by_email(&self, email: &str) -> Option<String> {
        self.users
            .iter()
            .find(|user| user.email.eq_ignore_ascii_case(email))
            .map(|user| user.id.clone())
    }
}

fn non_empty(input: Option<&str>) -> Option<&str> {
    input.and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed)
        }
    })
}
