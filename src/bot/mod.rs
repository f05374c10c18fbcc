/// Access-denied flood protection
pub mod denial_cache;
/// Update handlers and dispatcher tree
pub mod handlers;
/// Delivery of replies and results to Telegram chats
pub mod transport;

pub use denial_cache::DenialCache;
pub use transport::TelegramDelivery;
