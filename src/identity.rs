//! Identity keys and reply targets
//!
//! An inbound message is reduced to an [`Identity`]: who sent it and, when it
//! came from a group, which group. Quota is scoped by the derived
//! [`IdentityKey`], replies are addressed through a [`ReplyTarget`] that
//! survives the round trip to the rendering service as an opaque state string.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Group label used for direct (one-to-one) conversations
pub const DIRECT_CONTEXT: &str = "direct";

/// Group the message originated in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupContext {
    /// Transport-level group id
    pub id: String,
    /// Display name of the group, used by roll lists and quota keys
    pub name: String,
}

/// Sender of an inbound message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Transport-level user id
    pub user_id: String,
    /// Display name, refreshed on every message
    pub nickname: String,
    /// Set when the message came from a group
    pub group: Option<GroupContext>,
}

impl Identity {
    /// Identity for a direct conversation
    pub fn direct(user_id: impl Into<String>, nickname: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            nickname: nickname.into(),
            group: None,
        }
    }

    /// Identity inside a group
    pub fn in_group(
        user_id: impl Into<String>,
        nickname: impl Into<String>,
        group_id: impl Into<String>,
        group_name: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            nickname: nickname.into(),
            group: Some(GroupContext {
                id: group_id.into(),
                name: group_name.into(),
            }),
        }
    }

    /// Whether the message came from a group
    #[must_use]
    pub const fn is_group(&self) -> bool {
        self.group.is_some()
    }

    /// Group name or the direct-conversation sentinel
    #[must_use]
    pub fn group_name(&self) -> &str {
        self.group.as_ref().map_or(DIRECT_CONTEXT, |g| g.name.as_str())
    }

    /// Composite quota key of this identity
    #[must_use]
    pub fn key(&self) -> IdentityKey {
        IdentityKey::new(&self.user_id, self.group_name())
    }

    /// Where replies to this identity go
    #[must_use]
    pub fn reply_target(&self) -> ReplyTarget {
        match &self.group {
            Some(group) => ReplyTarget::room(&group.id, &self.nickname),
            None => ReplyTarget::direct(&self.user_id, &self.nickname),
        }
    }
}

/// Composite key `(user, conversation context)` scoping a quota record
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityKey(String);

impl IdentityKey {
    /// Builds the key from a user id and a group name (or [`DIRECT_CONTEXT`])
    #[must_use]
    pub fn new(user_id: &str, group_name: &str) -> Self {
        Self(format!("{user_id}_{group_name}"))
    }

    /// Wraps an already formatted key, e.g. one read back from disk
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Key as stored
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of conversation a reply goes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetKind {
    /// One-to-one conversation
    Direct,
    /// Group conversation; replies mention the requester
    Room,
}

/// Addressee of a reply, encoded into the job's state string
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyTarget {
    /// Conversation kind
    pub kind: TargetKind,
    /// Transport-level receiver (user id or group id)
    pub receiver: String,
    /// Display name of the requester
    pub display_name: String,
}

impl ReplyTarget {
    /// Target for a direct conversation
    pub fn direct(receiver: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            kind: TargetKind::Direct,
            receiver: receiver.into(),
            display_name: display_name.into(),
        }
    }

    /// Target for a group conversation
    pub fn room(receiver: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            kind: TargetKind::Room,
            receiver: receiver.into(),
            display_name: display_name.into(),
        }
    }

    /// Encodes the target as `u:<receiver>:<name>` or `r:<receiver>:<name>`
    #[must_use]
    pub fn to_state(&self) -> String {
        let tag = match self.kind {
            TargetKind::Direct => "u",
            TargetKind::Room => "r",
        };
        format!("{tag}:{}:{}", self.receiver, self.display_name)
    }

    /// Decodes a state string.
    ///
    /// Accepts the short `u`/`r` tags and the long `direct`/`room` forms. The
    /// display name may itself contain colons.
    #[must_use]
    pub fn parse(state: &str) -> Option<Self> {
        let mut parts = state.splitn(3, ':');
        let kind = match parts.next()? {
            "u" | "direct" => TargetKind::Direct,
            "r" | "room" => TargetKind::Room,
            _ => return None,
        };
        let receiver = parts.next().filter(|r| !r.is_empty())?;
        let display_name = parts.next().unwrap_or_default();
        Some(Self {
            kind,
            receiver: receiver.to_string(),
            display_name: display_name.to_string(),
        })
    }

    /// `@name ` prefix for group replies
    #[must_use]
    pub fn mention(&self) -> Option<String> {
        match self.kind {
            TargetKind::Room if !self.display_name.is_empty() => {
                Some(format!("@{} ", self.display_name))
            }
            _ => None,
        }
    }
}
