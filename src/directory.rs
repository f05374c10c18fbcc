//! Contact directory collaborator
//!
//! Some transports can check that a user or group name actually exists
//! before it is added to a roll list. The check is optional and only
//! consulted when `validate_roll_names` is set.

use async_trait::async_trait;

/// Resolved contact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    /// Transport-level id
    pub id: String,
    /// Display name
    pub name: String,
}

/// Name lookup against the transport's address book
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContactDirectory: Send + Sync {
    /// Resolves a user name or id, `None` if unknown
    async fn resolve_user(&self, token: &str) -> Option<Contact>;
    /// Whether a group with this name exists
    async fn group_exists(&self, name: &str) -> bool;
}

/// Directory that accepts every token as-is
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenDirectory;

#[async_trait]
impl ContactDirectory for OpenDirectory {
    async fn resolve_user(&self, token: &str) -> Option<Contact> {
        Some(Contact {
            id: token.to_string(),
            name: token.to_string(),
        })
    }

    async fn group_exists(&self, _name: &str) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_directory_accepts_everything() {
        let directory = OpenDirectory;
        assert_eq!(
            directory.resolve_user("alice").await,
            Some(Contact {
                id: "alice".into(),
                name: "alice".into()
            })
        );
        assert!(directory.group_exists("Artists").await);
    }
}
