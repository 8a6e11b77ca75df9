//! Shared-connection MQTT gateway.
//!
//! Many per-user topic subscriptions are multiplexed over one physical broker
//! connection per `host:port`. Inbound messages fan out to the delivery
//! stream of every config bound to the subscriber, and a background archiver
//! drains those streams into long-term storage.

#[cfg(test)]
#[macro_use]
mod testing;
#[cfg(test)]
mod memory;

pub mod archiver;
pub mod commands;
pub mod config;
pub mod connection;
pub mod db;
pub mod directory;
pub mod error;
pub mod models;
pub mod reaper;
pub mod registry;
pub mod service_utils;
pub mod store;
pub mod subscriptions;
pub mod topic;
pub mod transport;
pub mod watcher;

pub use error::{GatewayError, Result};
