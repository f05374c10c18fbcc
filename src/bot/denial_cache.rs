//! Access-denied flood protection
//!
//! A denied identity that keeps sending image commands gets the denial
//! notice once per cooldown period; the rest are dropped silently so the bot
//! does not get rate limited by Telegram.

use moka::future::Cache;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Last time a denial notice went to each identity key
#[derive(Clone)]
pub struct DenialCache {
    /// identity key -> instant the last notice was sent
    cache: Cache<String, Instant>,
    /// Minimum gap between two notices to the same identity
    cooldown: Duration,
    /// Notices suppressed so far
    silenced_count: Arc<AtomicU64>,
}

impl DenialCache {
    /// Creates a cache
    ///
    /// # Arguments
    ///
    /// * `cooldown_secs` - Seconds between two notices to the same identity
    /// * `ttl_secs` - Time-to-live of entries, at least the cooldown
    /// * `max_capacity` - Maximum number of tracked identities
    ///
    /// # Examples
    ///
    /// ```
    /// use imagine_gateway::bot::DenialCache;
    ///
    /// let cache = DenialCache::new(1200, 7200, 10_000);
    /// assert_eq!(cache.cooldown().as_secs(), 1200);
    /// ```
    #[must_use]
    pub fn new(cooldown_secs: u64, ttl_secs: u64, max_capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .time_to_live(Duration::from_secs(ttl_secs.max(cooldown_secs)))
            .build();

        Self {
            cache,
            cooldown: Duration::from_secs(cooldown_secs),
            silenced_count: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Whether a denial notice should be sent to `key`.
    ///
    /// Only every 100th suppressed notice is logged.
    pub async fn should_send(&self, key: &str, user_name: &str) -> bool {
        match self.cache.get(key).await {
            Some(sent_at) if sent_at.elapsed() < self.cooldown => {}
            _ => return true,
        }

        let count = self.silenced_count.fetch_add(1, Ordering::Relaxed) + 1;
        if count.is_multiple_of(100) {
            debug!(
                "⛔️ Silenced {} denial notices (recent: {} - {})",
                count, key, user_name
            );
        }
        false
    }

    /// Starts the cooldown for `key` after a notice was delivered
    pub async fn mark_sent(&self, key: &str) {
        self.cache.insert(key.to_string(), Instant::now()).await;
    }

    /// Number of identities in cooldown
    #[must_use]
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    /// Total number of suppressed notices
    #[must_use]
    pub fn silenced_count(&self) -> u64 {
        self.silenced_count.load(Ordering::Relaxed)
    }

    /// Configured cooldown
    #[must_use]
    pub const fn cooldown(&self) -> Duration {
        self.cooldown
    }
}
