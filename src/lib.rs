//! Change tracking and incremental synchronization of CMS content into Algolia.
//!
//! The crate keeps a set of remote search indices consistent with the posts,
//! taxonomy terms and users of a content store:
//!
//! - [`index`] holds the index abstraction and the per-kind indexable adapters
//! - [`watcher`] turns content events into upserts and deletes
//! - [`registry`] builds indices from configuration and wires watchers
//! - [`client`] is the remote boundary (Algolia REST, or in-memory)
//! - [`outbox`] is the durable queue used in asynchronous mode

pub mod client;
pub mod config;
pub mod content;
pub mod error;
pub mod index;
pub mod outbox;
pub mod registry;
pub mod telemetry;
pub mod utils;
pub mod watcher;
pub mod web;

pub use error::{Result, SyncError};
