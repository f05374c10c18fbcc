//! Telegram implementation of the delivery collaborator

use crate::delivery::{Delivery, Reply};
use crate::identity::ReplyTarget;
use anyhow::{Context, Result};
use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{ChatId, InputFile, MessageId, ReplyParameters};
use tracing::debug;

/// Telegram's message limit with a safety margin
pub const TELEGRAM_MESSAGE_LIMIT: usize = 4000;

/// Splits `text` into chunks of at most `limit` characters, preferring line
/// breaks as cut points
#[must_use]
pub fn split_message(text: &str, limit: usize) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;
    for line in text.split_inclusive('\n') {
        let line_len = line.chars().count();
        if current_len + line_len > limit && !current.is_empty() {
            parts.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if line_len > limit {
            let chars: Vec<char> = line.chars().collect();
            for chunk in chars.chunks(limit) {
                parts.push(chunk.iter().collect());
            }
            continue;
        }
        current.push_str(line);
        current_len += line_len;
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}

/// Sends `text`, split when needed, retrying transient failures.
///
/// # Errors
///
/// Returns the last Telegram error once retries are exhausted.
pub async fn send_text(
    bot: &Bot,
    chat_id: ChatId,
    text: &str,
    reply_to: Option<MessageId>,
) -> Result<()> {
    for part in split_message(text, TELEGRAM_MESSAGE_LIMIT) {
        crate::utils::retry_telegram_operation(|| async {
            let mut request = bot.send_message(chat_id, part.clone());
            if let Some(id) = reply_to {
                request = request.reply_parameters(ReplyParameters::new(id));
            }
            request.await?;
            Ok(())
        })
        .await?;
    }
    Ok(())
}

/// Delivers reconciled results to Telegram chats
#[derive(Clone)]
pub struct TelegramDelivery {
    bot: Bot,
}

impl TelegramDelivery {
    /// Wraps a bot handle
    #[must_use]
    pub const fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl Delivery for TelegramDelivery {
    async fn deliver(&self, target: &ReplyTarget, reply: Reply) -> Result<()> {
        let chat_id = target
            .receiver
            .parse::<i64>()
            .map(ChatId)
            .with_context(|| format!("invalid chat id in reply target: {}", target.receiver))?;
        let mention = target.mention().unwrap_or_default();
        match reply {
            Reply::Text(text) => send_text(&self.bot, chat_id, &format!("{mention}{text}"), None).await,
            Reply::ImageUrl(url) => {
                let url = reqwest::Url::parse(&url).context("invalid image URL")?;
                debug!(chat_id = chat_id.0, "Sending result image");
                crate::utils::retry_telegram_operation(|| async {
                    let mut request = self.bot.send_photo(chat_id, InputFile::url(url.clone()));
                    if !mention.is_empty() {
                        request = request.caption(mention.trim_end().to_string());
                    }
                    request.await?;
                    Ok(())
                })
                .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_message_keeps_short_text() {
        assert_eq!(split_message("hello\nworld", 100), vec!["hello\nworld"]);
    }

    #[test]
    fn test_split_message_cuts_on_lines_and_long_lines() {
        let parts = split_message("aaaa\nbbbb\ncccccccccc", 6);
        assert_eq!(parts, vec!["aaaa\n", "bbbb\n", "cccccc", "cccc"]);
        assert!(parts.iter().all(|p| p.chars().count() <= 6));
    }
}
