//! Identity resolution: `username → {role, teams}`.
//!
//! The approval core trusts that the caller has already been authenticated;
//! it consumes only this narrow lookup interface. Identity is re-read for
//! every operation — the core never caches an identity beyond a single
//! operation, so role and team changes take effect on the next call.
//!
//! Role strings are canonicalized at this boundary. The account store has
//! historically carried `"TEAM LEADER"` (with a space) alongside
//! `"TEAM_LEADER"`; both parse to [`Role::TeamLeader`] here and the space
//! form never propagates further in.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::{read_json_bounded, StoreError};

/// Size cap for the account document.
const MAX_USERS_DOC_BYTES: u64 = 4 * 1024 * 1024;

/// Errors from identity lookups.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum IdentityError {
    /// No account matches the username.
    #[error("unknown user: {username}")]
    UnknownUser {
        /// The username that failed to resolve.
        username: String,
    },

    /// The account source exists but does not parse.
    #[error("account store corrupt: {detail}")]
    Corrupt {
        /// Parse error detail.
        detail: String,
    },

    /// The account source cannot be read.
    #[error("account store unavailable: {detail}")]
    Unavailable {
        /// Human-readable context.
        detail: String,
    },
}

/// A caller's role in the approval workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    /// Submits and withdraws their own files.
    User,
    /// Triages submissions from their assigned teams.
    TeamLeader,
    /// Renders final decisions on any submission.
    Admin,
}

impl Role {
    /// Parses a role string, accepting the legacy whitespace variant.
    ///
    /// Matching is case-insensitive; `"TEAM LEADER"` is rewritten to the
    /// canonical underscore form. Anything else is `None`.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_uppercase().as_str() {
            "USER" => Some(Self::User),
            "TEAM_LEADER" | "TEAM LEADER" => Some(Self::TeamLeader),
            "ADMIN" => Some(Self::Admin),
            _ => None,
        }
    }

    /// Canonical wire string for this role.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "USER",
            Self::TeamLeader => "TEAM_LEADER",
            Self::Admin => "ADMIN",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resolved identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    /// The username as known to the account store.
    pub username: String,
    /// The caller's role.
    pub role: Role,
    /// Team tags assigned to the user. A submitter's first tag is their
    /// submitting team; a team leader's tags scope their review authority.
    pub teams: Vec<String>,
}

impl UserIdentity {
    /// Returns true if any of the identity's teams equals `team`.
    #[must_use]
    pub fn has_team(&self, team: &str) -> bool {
        self.teams.iter().any(|t| t == team)
    }

    /// The team a submission from this user is attributed to.
    #[must_use]
    pub fn primary_team(&self) -> &str {
        self.teams.first().map_or("DEFAULT", String::as_str)
    }
}

/// Resolves usernames to identities.
pub trait IdentityProvider: Send + Sync {
    /// Looks up one user.
    ///
    /// # Errors
    ///
    /// [`IdentityError::UnknownUser`] when no account matches; source
    /// errors otherwise.
    fn get(&self, username: &str) -> Result<UserIdentity, IdentityError>;

    /// Usernames of every team leader assigned to `team`.
    ///
    /// Used for the submitted-for-review notification fan-out.
    ///
    /// # Errors
    ///
    /// Source errors only; a team with no leaders is an empty list.
    fn team_leaders(&self, team: &str) -> Result<Vec<String>, IdentityError>;
}

/// On-disk account record, keyed by account email in the source document.
#[derive(Debug, Deserialize)]
struct AccountRecord {
    username: String,
    #[serde(default)]
    role: String,
    #[serde(default)]
    team_tags: Vec<String>,
}

/// Identity provider backed by the shared `users.json` account document.
#[derive(Debug, Clone)]
pub struct FileIdentityProvider {
    source: PathBuf,
}

impl FileIdentityProvider {
    /// Builds a provider reading from `source`.
    #[must_use]
    pub const fn new(source: PathBuf) -> Self {
        Self { source }
    }

    fn load(&self) -> Result<std::collections::BTreeMap<String, AccountRecord>, IdentityError> {
        match read_json_bounded(&self.source, MAX_USERS_DOC_BYTES) {
            Ok(Some(accounts)) => Ok(accounts),
            Ok(None) => Ok(std::collections::BTreeMap::new()),
            Err(StoreError::Corrupt { detail, .. }) => Err(IdentityError::Corrupt { detail }),
            Err(e) => Err(IdentityError::Unavailable {
                detail: e.to_string(),
            }),
        }
    }
}

impl IdentityProvider for FileIdentityProvider {
    fn get(&self, username: &str) -> Result<UserIdentity, IdentityError> {
        let accounts = self.load()?;
        for record in accounts.values() {
            if record.username == username {
                let role = Role::parse(&record.role).ok_or_else(|| IdentityError::Corrupt {
                    detail: format!("account {username} has unknown role {:?}", record.role),
                })?;
                return Ok(UserIdentity {
                    username: record.username.clone(),
                    role,
                    teams: record.team_tags.clone(),
                });
            }
        }
        Err(IdentityError::UnknownUser {
            username: username.to_string(),
        })
    }

    fn team_leaders(&self, team: &str) -> Result<Vec<String>, IdentityError> {
        let accounts = self.load()?;
        let mut leaders: Vec<String> = accounts
            .values()
            .filter(|r| Role::parse(&r.role) == Some(Role::TeamLeader))
            .filter(|r| r.team_tags.iter().any(|t| t == team))
            .map(|r| r.username.clone())
            .collect();
        leaders.sort();
        leaders.dedup();
        Ok(leaders)
    }
}

/// In-memory identity provider for tests and embedding panels.
#[derive(Debug, Default, Clone)]
pub struct MemoryIdentityProvider {
    users: Vec<UserIdentity>,
}

impl MemoryIdentityProvider {
    /// Builds an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one identity, replacing any prior entry for the username.
    pub fn insert(&mut self, identity: UserIdentity) {
        self.users.retain(|u| u.username != identity.username);
        self.users.push(identity);
    }

    /// Convenience builder-style insert.
    #[must_use]
    pub fn with_user(mut self, username: &str, role: Role, teams: &[&str]) -> Self {
        self.insert(UserIdentity {
            username: username.to_string(),
            role,
            teams: teams.iter().map(ToString::to_string).collect(),
        });
        self
    }
}

impl IdentityProvider for MemoryIdentityProvider {
    fn get(&self, username: &str) -> Result<UserIdentity, IdentityError> {
        self.users
            .iter()
            .find(|u| u.username == username)
            .cloned()
            .ok_or_else(|| IdentityError::UnknownUser {
                username: username.to_string(),
            })
    }

    fn team_leaders(&self, team: &str) -> Result<Vec<String>, IdentityError> {
        Ok(self
            .users
            .iter()
            .filter(|u| u.role == Role::TeamLeader && u.has_team(team))
            .map(|u| u.username.clone())
            .collect())
    }
}
