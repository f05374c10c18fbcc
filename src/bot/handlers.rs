//! Telegram update handlers
//!
//! Converts Telegram messages into [`InboundMessage`]s, hands them to the
//! gateway and sends the outcome back to the chat the message came from.

use crate::bot::transport::send_text;
use crate::bot::DenialCache;
use crate::gateway::{Gateway, InboundMessage, Outcome};
use crate::identity::Identity;
use anyhow::Result;
use std::sync::Arc;
use teloxide::dispatching::UpdateHandler;
use teloxide::net::Download;
use teloxide::prelude::*;
use tracing::{error, info};

/// Sender identity of a message, `None` for channel posts and service
/// messages without a user
#[must_use]
pub fn identity_from_message(msg: &Message) -> Option<Identity> {
    let user = msg.from.as_ref()?;
    let user_id = user.id.0.to_string();
    let nickname = user
        .username
        .clone()
        .unwrap_or_else(|| user.full_name());
    if msg.chat.is_group() || msg.chat.is_supergroup() {
        let title = msg.chat.title().unwrap_or_default().to_string();
        Some(Identity::in_group(
            user_id,
            nickname,
            msg.chat.id.0.to_string(),
            title,
        ))
    } else {
        Some(Identity::direct(user_id, nickname))
    }
}

/// Largest size of the photo attached to `msg`
async fn download_photo(bot: &Bot, msg: &Message) -> Result<Option<Vec<u8>>> {
    let Some(photo) = msg.photo().and_then(|sizes| sizes.last()) else {
        return Ok(None);
    };
    let buffer = crate::utils::retry_telegram_operation(|| async {
        let file = bot.get_file(photo.file.id.clone()).await?;
        let mut buf = Vec::new();
        bot.download_file(&file.path, &mut buf).await?;
        Ok(buf)
    })
    .await?;
    Ok(Some(buffer))
}

/// Handles one message end to end
///
/// # Errors
///
/// Returns an error if the photo cannot be downloaded or the reply cannot be
/// sent.
pub async fn handle_message(
    bot: &Bot,
    msg: &Message,
    gateway: &Gateway,
    denials: &DenialCache,
) -> Result<()> {
    let Some(identity) = identity_from_message(msg) else {
        return Ok(());
    };
    let text = msg.text().or_else(|| msg.caption()).map(ToString::to_string);
    let image = if msg.photo().is_some()
        && gateway.wants_image(&identity.user_id, text.as_deref()).await
    {
        download_photo(bot, msg).await?
    } else {
        None
    };
    if image.is_none() && text.is_none() {
        return Ok(());
    }

    let key = identity.key();
    let nickname = identity.nickname.clone();
    let outcome = gateway
        .handle(InboundMessage {
            identity,
            text,
            image,
        })
        .await;

    match outcome {
        Outcome::Ignored => Ok(()),
        Outcome::Reply(text) => send_text(bot, msg.chat.id, &text, Some(msg.id)).await,
        Outcome::Denied(verdict) => {
            if !denials.should_send(key.as_str(), &nickname).await {
                return Ok(());
            }
            info!(
                "⛔️ Access denied for {} ({}): {}",
                key,
                nickname,
                verdict.message_key()
            );
            send_text(bot, msg.chat.id, verdict.user_message(), Some(msg.id)).await?;
            denials.mark_sent(key.as_str()).await;
            Ok(())
        }
    }
}

async fn on_message(
    bot: Bot,
    msg: Message,
    gateway: Arc<Gateway>,
    denials: Arc<DenialCache>,
) -> Result<(), teloxide::RequestError> {
    if let Err(e) = handle_message(&bot, &msg, &gateway, &denials).await {
        error!("Message handler error in chat {}: {}", msg.chat.id, e);
    }
    respond(())
}

/// Dispatcher tree: text and photo messages go to the gateway
#[must_use]
pub fn setup_handler() -> UpdateHandler<teloxide::RequestError> {
    dptree::entry().branch(
        Update::filter_message()
            .filter(|msg: Message| msg.text().is_some() || msg.photo().is_some())
            .endpoint(on_message),
    )
}
