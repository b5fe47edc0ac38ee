//! Codebases and their trunk repositories.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::acl::{AclRule, Allower, ALL_ALLOWED, ANY_USER};
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::events::{Event, EventKind, Topic};
use crate::git;
use crate::storage::Record;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Codebase {
    pub id: String,
    pub name: String,
    pub is_public: bool,
    pub acl: Vec<AclRule>,
    pub created_at: DateTime<Utc>,
}

impl Record for Codebase {
    fn id(&self) -> &str {
        &self.id
    }
}

/// Codebase operations
pub struct Codebases<'e> {
    engine: &'e Engine,
}

impl<'e> Codebases<'e> {
    pub(crate) fn new(engine: &'e Engine) -> Self {
        Self { engine }
    }

    /// Create a codebase with an initialized trunk.
    ///
    /// Every user may see every path until the ACL is narrowed.
    pub fn create(&self, name: &str, is_public: bool) -> Result<Codebase> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::InvalidArgument(
                "codebase name cannot be empty".to_string(),
            ));
        }

        let storage = self.engine.storage();
        let codebase = Codebase {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            is_public,
            acl: vec![AclRule::new(ANY_USER, &[ALL_ALLOWED])],
            created_at: Utc::now(),
        };

        git::init_trunk(
            &storage.trunk_dir(&codebase.id),
            &self.engine.config().mainline_branch,
        )?;
        storage.insert_codebase(codebase.clone())?;

        info!(codebase = %codebase.id, name = %codebase.name, "codebase created");
        self.engine.events().send(
            Event::new(EventKind::CodebaseUpdated, None).about(Topic::Codebase(codebase.id.clone())),
        );
        Ok(codebase)
    }

    pub fn get(&self, id: &str) -> Result<Codebase> {
        self.engine.storage().get_codebase(id)
    }

    pub fn list(&self) -> Result<Vec<Codebase>> {
        self.engine.storage().list_codebases()
    }

    /// Replace the ACL rules of a codebase.
    pub fn set_acl(&self, id: &str, acl: Vec<AclRule>) -> Result<Codebase> {
        for rule in &acl {
            Allower::new(rule.patterns.iter())?;
        }
        let codebase = self.engine.storage().update_codebase(id, |codebase| {
            codebase.acl = acl;
            Ok(())
        })?;
        self.engine.events().send(
            Event::new(EventKind::CodebaseUpdated, None).about(Topic::Codebase(codebase.id.clone())),
        );
        Ok(codebase)
    }

    /// Recreate the mainline branch and root commit if they are missing.
    ///
    /// Returns true when something had to be repaired.
    pub fn ensure_status(&self, id: &str) -> Result<bool> {
        self.get(id)?;
        let mainline = self.engine.config().mainline_branch.clone();
        let mut repaired = false;
        self.engine
            .executor()
            .trunk(id, "ensure status")
            .git_write(|handle| {
                repaired = git::ensure_root_commit(handle.repo(), &mainline)?;
                Ok(())
            })
            .exec()?;
        if repaired {
            info!(codebase = %id, "root commit recreated");
        }
        Ok(repaired)
    }
}
