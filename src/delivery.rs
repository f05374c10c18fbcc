//! Reply delivery collaborator
//!
//! The reconciler pushes finished results to chat users through this trait;
//! the Telegram implementation lives in `bot::transport`.

use crate::identity::ReplyTarget;
use async_trait::async_trait;

/// Payload of one outgoing reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Plain text
    Text(String),
    /// Image fetched by the transport from a remote URL
    ImageUrl(String),
}

/// Sends replies to chat users
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Delivery: Send + Sync {
    /// Delivers `reply` to `target`.
    ///
    /// Implementations prefix text replies to group targets with the
    /// requester's mention.
    ///
    /// # Errors
    ///
    /// Returns an error once the transport has given up.
    async fn deliver(&self, target: &ReplyTarget, reply: Reply) -> anyhow::Result<()>;
}
