//! Roll Store
//!
//! Durable membership lists: administrators, user whitelist and blacklist,
//! group whitelist and blacklist. Every mutation is a serialized
//! read-modify-persist sequence; reads serve an in-memory copy that is
//! refreshed when the file changes underneath us.

use crate::identity::Identity;
use crate::storage::{FileStamp, JsonFile, StorageError};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// The five roll lists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RollKind {
    /// Administrators (matched by user id)
    Admins,
    /// Users allowed regardless of quota
    UserWhitelist,
    /// Users denied service
    UserBlacklist,
    /// Groups with unlimited use
    GroupWhitelist,
    /// Groups denied service
    GroupBlacklist,
}

impl RollKind {
    /// All lists in display order
    pub const ALL: [Self; 5] = [
        Self::Admins,
        Self::UserWhitelist,
        Self::UserBlacklist,
        Self::GroupWhitelist,
        Self::GroupBlacklist,
    ];

    /// List an entry must be absent from before it can be added here
    #[must_use]
    pub const fn opposing(self) -> Option<Self> {
        match self {
            Self::Admins | Self::UserWhitelist => Some(Self::UserBlacklist),
            Self::UserBlacklist => Some(Self::UserWhitelist),
            Self::GroupWhitelist => Some(Self::GroupBlacklist),
            Self::GroupBlacklist => Some(Self::GroupWhitelist),
        }
    }

    /// Whether entries name groups rather than users
    #[must_use]
    pub const fn holds_groups(self) -> bool {
        matches!(self, Self::GroupWhitelist | Self::GroupBlacklist)
    }

    /// Human-readable list name
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Admins => "administrators",
            Self::UserWhitelist => "user whitelist",
            Self::UserBlacklist => "user blacklist",
            Self::GroupWhitelist => "group whitelist",
            Self::GroupBlacklist => "group blacklist",
        }
    }
}

impl fmt::Display for RollKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Errors returned by roll mutations
#[derive(Debug, Error)]
pub enum RollError {
    /// Entry already present in the same list
    #[error("[{token}] is already in the {kind}")]
    Duplicate {
        /// List the add targeted
        kind: RollKind,
        /// Offending token
        token: String,
    },
    /// Entry present in the opposing list
    #[error("[{token}] is in the {opposing}, remove it from there first")]
    Conflict {
        /// List the add targeted
        kind: RollKind,
        /// List that already holds the token
        opposing: RollKind,
        /// Offending token
        token: String,
    },
    /// Positional index outside `1..=len`
    #[error("index {index} does not exist in the {kind} ({len} entries)")]
    IndexOutOfRange {
        /// List the remove targeted
        kind: RollKind,
        /// Index as given (1-based)
        index: usize,
        /// Current list length
        len: usize,
    },
    /// No entry matches the token
    #[error("[{token}] is not in the {kind}")]
    NotFound {
        /// List the remove targeted
        kind: RollKind,
        /// Missing token
        token: String,
    },
    /// Persisting the roll failed
    #[error("roll storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Roster entry: an opaque id plus an optional display name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawEntry")]
pub struct RosterEntry {
    /// User id, user name or group name as given at insertion
    pub id: String,
    /// Display name captured at insertion
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// On-disk shapes a roster entry has been written in
#[derive(Deserialize)]
#[serde(untagged)]
enum RawEntry {
    Token(String),
    Record {
        #[serde(alias = "user_id")]
        id: String,
        #[serde(default, alias = "user_nickname")]
        name: Option<String>,
    },
}

impl From<RawEntry> for RosterEntry {
    fn from(raw: RawEntry) -> Self {
        match raw {
            RawEntry::Token(id) => Self { id, name: None },
            RawEntry::Record { id, name } => Self { id, name },
        }
    }
}

impl RosterEntry {
    /// Plain token entry
    pub fn token(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
        }
    }

    /// Entry with a display name
    pub fn named(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: Some(name.into()),
        }
    }

    /// Whether `token` names this entry by id or display name
    #[must_use]
    pub fn matches(&self, token: &str) -> bool {
        self.id == token || self.name.as_deref() == Some(token)
    }

    /// Name shown in listings
    #[must_use]
    pub fn display(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// The five lists as one document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollSet {
    /// Administrators
    #[serde(default, alias = "mj_admin_users")]
    pub admins: Vec<RosterEntry>,
    /// Whitelisted users
    #[serde(default, alias = "mj_users")]
    pub user_whitelist: Vec<RosterEntry>,
    /// Blacklisted users
    #[serde(default, alias = "mj_busers")]
    pub user_blacklist: Vec<RosterEntry>,
    /// Whitelisted groups
    #[serde(default, alias = "mj_groups")]
    pub group_whitelist: Vec<RosterEntry>,
    /// Blacklisted groups
    #[serde(default, alias = "mj_bgroups")]
    pub group_blacklist: Vec<RosterEntry>,
}

impl RollSet {
    /// Entries of one list in insertion order
    #[must_use]
    pub fn list(&self, kind: RollKind) -> &[RosterEntry] {
        match kind {
            RollKind::Admins => &self.admins,
            RollKind::UserWhitelist => &self.user_whitelist,
            RollKind::UserBlacklist => &self.user_blacklist,
            RollKind::GroupWhitelist => &self.group_whitelist,
            RollKind::GroupBlacklist => &self.group_blacklist,
        }
    }

    fn list_mut(&mut self, kind: RollKind) -> &mut Vec<RosterEntry> {
        match kind {
            RollKind::Admins => &mut self.admins,
            RollKind::UserWhitelist => &mut self.user_whitelist,
            RollKind::UserBlacklist => &mut self.user_blacklist,
            RollKind::GroupWhitelist => &mut self.group_whitelist,
            RollKind::GroupBlacklist => &mut self.group_blacklist,
        }
    }

    fn contains(&self, kind: RollKind, token: &str) -> bool {
        self.list(kind).iter().any(|e| e.matches(token))
    }

    /// Administrators are matched by user id only
    #[must_use]
    pub fn is_admin(&self, user_id: &str) -> bool {
        self.admins.iter().any(|e| e.id == user_id)
    }

    /// Whitelist match on user id or nickname
    #[must_use]
    pub fn is_user_whitelisted(&self, identity: &Identity) -> bool {
        self.contains(RollKind::UserWhitelist, &identity.user_id)
            || self.contains(RollKind::UserWhitelist, &identity.nickname)
    }

    /// Blacklist match on user id or nickname
    #[must_use]
    pub fn is_user_blacklisted(&self, identity: &Identity) -> bool {
        self.contains(RollKind::UserBlacklist, &identity.user_id)
            || self.contains(RollKind::UserBlacklist, &identity.nickname)
    }

    /// Group whitelist match on group name
    #[must_use]
    pub fn is_group_whitelisted(&self, group_name: &str) -> bool {
        self.contains(RollKind::GroupWhitelist, group_name)
    }

    /// Group blacklist match on group name
    #[must_use]
    pub fn is_group_blacklisted(&self, group_name: &str) -> bool {
        self.contains(RollKind::GroupBlacklist, group_name)
    }

    fn try_add(&mut self, kind: RollKind, entry: RosterEntry) -> Result<(), RollError> {
        let clashes = |set: &Self, k: RollKind| {
            set.contains(k, &entry.id) || entry.name.as_deref().is_some_and(|n| set.contains(k, n))
        };
        if clashes(self, kind) {
            return Err(RollError::Duplicate {
                kind,
                token: entry.display().to_string(),
            });
        }
        if let Some(opposing) = kind.opposing() {
            if clashes(self, opposing) {
                return Err(RollError::Conflict {
                    kind,
                    opposing,
                    token: entry.display().to_string(),
                });
            }
        }
        self.list_mut(kind).push(entry);
        Ok(())
    }

    fn try_remove(&mut self, kind: RollKind, selector: &str) -> Result<RosterEntry, RollError> {
        let list = self.list_mut(kind);
        if let Some(pos) = list.iter().position(|e| e.matches(selector)) {
            return Ok(list.remove(pos));
        }
        if let Ok(index) = selector.parse::<usize>() {
            if index == 0 || index > list.len() {
                return Err(RollError::IndexOutOfRange {
                    kind,
                    index,
                    len: list.len(),
                });
            }
            return Ok(list.remove(index - 1));
        }
        Err(RollError::NotFound {
            kind,
            token: selector.to_string(),
        })
    }
}

struct Cached {
    roll: RollSet,
    stamp: Option<FileStamp>,
}

/// Durable roll lists shared by request handlers
pub struct RollStore {
    file: JsonFile,
    state: RwLock<Cached>,
}

impl RollStore {
    /// Opens the store, creating an empty document if none exists.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if an existing document cannot be read or the
    /// initial document cannot be written.
    pub async fn open(file: JsonFile) -> Result<Self, StorageError> {
        let roll = match file.load::<RollSet>().await? {
            Some(roll) => roll,
            None => {
                let roll = RollSet::default();
                file.save(&roll).await?;
                roll
            }
        };
        let stamp = file.stamp().await;
        info!(
            path = %file.path().display(),
            admins = roll.admins.len(),
            "Roll loaded"
        );
        Ok(Self {
            file,
            state: RwLock::new(Cached { roll, stamp }),
        })
    }

    /// Current lists, reloaded first when the file changed on disk.
    ///
    /// A failed reload keeps serving the last good copy.
    pub async fn snapshot(&self) -> RollSet {
        let stamp = self.file.stamp().await;
        {
            let state = self.state.read().await;
            if state.stamp == stamp {
                return state.roll.clone();
            }
        }
        let mut state = self.state.write().await;
        self.refresh(&mut state, stamp).await;
        state.roll.clone()
    }

    /// Entries of one list
    pub async fn list(&self, kind: RollKind) -> Vec<RosterEntry> {
        self.snapshot().await.list(kind).to_vec()
    }

    /// Adds an entry, rejecting duplicates and opposing-list conflicts.
    ///
    /// # Errors
    ///
    /// `Duplicate`, `Conflict` or `Storage`; the lists are unchanged on error.
    pub async fn add(&self, kind: RollKind, entry: RosterEntry) -> Result<RosterEntry, RollError> {
        self.mutate(|roll| {
            roll.try_add(kind, entry.clone())?;
            Ok(entry)
        })
        .await
    }

    /// Removes an entry by exact id/name, or by 1-based position when no
    /// entry matches and the selector is numeric.
    ///
    /// # Errors
    ///
    /// `IndexOutOfRange`, `NotFound` or `Storage`; the lists are unchanged on
    /// error.
    pub async fn remove(&self, kind: RollKind, selector: &str) -> Result<RosterEntry, RollError> {
        self.mutate(|roll| roll.try_remove(kind, selector)).await
    }

    /// Empties a list and returns how many entries it held.
    ///
    /// # Errors
    ///
    /// Returns `Storage` if persisting fails.
    pub async fn clear(&self, kind: RollKind) -> Result<usize, RollError> {
        self.mutate(|roll| {
            let list = roll.list_mut(kind);
            let count = list.len();
            list.clear();
            Ok(count)
        })
        .await
    }

    async fn mutate<T>(
        &self,
        op: impl FnOnce(&mut RollSet) -> Result<T, RollError>,
    ) -> Result<T, RollError> {
        let mut state = self.state.write().await;
        let stamp = self.file.stamp().await;
        if state.stamp != stamp {
            self.refresh(&mut state, stamp).await;
        }

        let mut next = state.roll.clone();
        let out = op(&mut next)?;
        self.file.save(&next).await?;

        state.roll = next;
        state.stamp = self.file.stamp().await;
        Ok(out)
    }

    async fn refresh(&self, state: &mut Cached, stamp: Option<FileStamp>) {
        match self.file.load::<RollSet>().await {
            Ok(Some(roll)) => {
                state.roll = roll;
                state.stamp = stamp;
            }
            Ok(None) => state.stamp = stamp,
            Err(e) => warn!(error = %e, "Roll reload failed, serving cached copy"),
        }
    }
}
