//! Path-level access control.
//!
//! An [`Allower`] is computed per request from a codebase's ACL rules and is
//! never persisted. Diffs redact paths it does not permit.

use serde::{Deserialize, Serialize};

use crate::codebase::Codebase;
use crate::error::{Error, Result};

/// Pattern that permits every path
pub const ALL_ALLOWED: &str = "*";

/// Identity that matches any authenticated user in an ACL rule
pub const ANY_USER: &str = "*";

/// Identity that matches unauthenticated readers of public codebases
pub const ANONYMOUS: &str = "anonymous";

/// One ACL entry stored on a codebase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclRule {
    /// User id, `*` for any user, or `anonymous`
    pub identity: String,
    pub patterns: Vec<String>,
}

impl AclRule {
    pub fn new(identity: impl Into<String>, patterns: &[&str]) -> Self {
        Self {
            identity: identity.into(),
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
        }
    }
}

/// Set of path patterns an actor may see and modify
#[derive(Debug, Clone, Default)]
pub struct Allower {
    raw: Vec<String>,
    patterns: Vec<glob::Pattern>,
}

impl Allower {
    pub fn new<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut allower = Allower::default();
        for pattern in patterns {
            allower.push(pattern.as_ref())?;
        }
        Ok(allower)
    }

    /// Permits everything
    pub fn all() -> Self {
        Self::new([ALL_ALLOWED]).unwrap_or_default()
    }

    /// Permits nothing
    pub fn none() -> Self {
        Self::default()
    }

    fn push(&mut self, pattern: &str) -> Result<()> {
        let trimmed = pattern.trim();
        if trimmed.is_empty() {
            return Err(Error::Validation("acl pattern cannot be empty".to_string()));
        }
        // `dir/` covers everything below dir
        let expanded = if trimmed.ends_with('/') {
            format!("{trimmed}**")
        } else {
            trimmed.to_string()
        };
        let matcher = glob::Pattern::new(&expanded).map_err(|err| {
            Error::Validation(format!("invalid acl pattern '{trimmed}': {err}"))
        })?;
        self.raw.push(trimmed.to_string());
        self.patterns.push(matcher);
        Ok(())
    }

    pub fn is_allowed(&self, path: &str) -> bool {
        let normalized = path.replace('\\', "/");
        let normalized = normalized.trim_start_matches("./");
        self.patterns.iter().any(|p| p.matches(normalized))
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn patterns(&self) -> &[String] {
        &self.raw
    }
}

/// Who is asking
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subject {
    User(String),
    Anonymous,
}

/// Computes the Allower for an actor on a codebase
pub trait PolicyProvider: Send + Sync {
    fn allower(&self, subject: &Subject, codebase: &Codebase) -> Result<Allower>;
}

/// Evaluates the rules stored on the codebase record
#[derive(Debug, Clone, Default)]
pub struct CodebasePolicy;

impl PolicyProvider for CodebasePolicy {
    fn allower(&self, subject: &Subject, codebase: &Codebase) -> Result<Allower> {
        let matches = |rule: &AclRule| match subject {
            Subject::User(id) => rule.identity == *id || rule.identity == ANY_USER,
            Subject::Anonymous => rule.identity == ANONYMOUS,
        };

        if *subject == Subject::Anonymous && !codebase.is_public {
            return Ok(Allower::none());
        }

        Allower::new(
            codebase
                .acl
                .iter()
                .filter(|rule| matches(rule))
                .flat_map(|rule| rule.patterns.iter()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn codebase(is_public: bool, acl: Vec<AclRule>) -> Codebase {
        Codebase {
            id: "cb".to_string(),
            name: "demo".to_string(),
            is_public,
            acl,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn star_allows_everything() {
        let allower = Allower::all();
        assert!(allower.is_allowed("a.txt"));
        assert!(allower.is_allowed("deep/nested/file.rs"));
    }

    #[test]
    fn directory_patterns_cover_children() {
        let allower = Allower::new(["docs/", "*.md"]).unwrap();
        assert!(allower.is_allowed("docs/guide/intro.txt"));
        assert!(allower.is_allowed("README.md"));
        assert!(!allower.is_allowed("src/lib.rs"));
    }

    #[test]
    fn invalid_pattern_fails_validation() {
        let err = Allower::new(["src/[a"]).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn anonymous_on_private_codebase_gets_nothing() {
        let cb = codebase(false, vec![AclRule::new(ANONYMOUS, &["*"])]);
        let allower = CodebasePolicy.allower(&Subject::Anonymous, &cb).unwrap();
        assert!(allower.is_empty());
        assert!(!allower.is_allowed("a.txt"));
    }

    #[test]
    fn user_rules_and_wildcard_combine() {
        let cb = codebase(
            true,
            vec![
                AclRule::new(ANY_USER, &["src/"]),
                AclRule::new("u1", &["secrets/"]),
                AclRule::new(ANONYMOUS, &["README.md"]),
            ],
        );

        let u1 = CodebasePolicy
            .allower(&Subject::User("u1".into()), &cb)
            .unwrap();
        assert!(u1.is_allowed("secrets/key"));
        assert!(u1.is_allowed("src/main.rs"));

        let u2 = CodebasePolicy
            .allower(&Subject::User("u2".into()), &cb)
            .unwrap();
        assert!(!u2.is_allowed("secrets/key"));

        let anon = CodebasePolicy.allower(&Subject::Anonymous, &cb).unwrap();
        assert!(anon.is_allowed("README.md"));
        assert!(!anon.is_allowed("src/main.rs"));
    }
}
