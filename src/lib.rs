#![deny(missing_docs)]
//! Imagine gateway library.
//!
//! Access control, quota accounting and asynchronous job reconciliation for a
//! chat-driven image-generation service.

/// Access Control Engine.
pub mod access;
/// Administrator credential.
pub mod auth;
/// Telegram transport.
pub mod bot;
/// Action-button label table.
pub mod buttons;
/// Rendering service client.
pub mod client;
/// Command table, parser and help text.
pub mod commands;
/// Configuration management.
pub mod config;
/// Reply delivery collaborator.
pub mod delivery;
/// Contact directory collaborator.
pub mod directory;
/// Error taxonomy surfaced to chat users.
pub mod error;
/// Request handling.
pub mod gateway;
/// Identity keys and reply targets.
pub mod identity;
/// Periodic reconciliation loop.
pub mod poller;
/// Quota Ledger.
pub mod quota;
/// Roll Store (administrators, white- and blacklists).
pub mod roll;
/// JSON file persistence.
pub mod storage;
/// Task Tracker.
pub mod tracker;
/// Utility functions.
pub mod utils;
