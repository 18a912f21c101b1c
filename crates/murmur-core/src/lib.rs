//! # murmur-core
//!
//! Access control, thread materialization and subscription routing for the
//! Murmur realtime engine.
//!
//! This crate provides the engine behind a transport:
//!
//! - **Topic / User / Group** - The records access decisions are made on
//! - **AccessResolver** - Read, write and admin access on a topic
//! - **Materializer** - One-level and nested reply trees
//! - **ConnectionRegistry** - Live connections and their outbound queues
//! - **SubscriptionRouter** - Per-topic subscription tables
//! - **Dispatcher** - Fan-out of write-side events
//! - **Hub** - The facade transports and the write side talk to
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Transport  │────▶│     Hub     │────▶│   Router    │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        ▲                   │                   │
//!        │                   ▼                   ▼
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Registry   │◀────│ Dispatcher  │────▶│ Materializer│
//! └─────────────┘     └─────────────┘     └─────────────┘
//! ```
//!
//! Identities, topics, messages and presences live behind the traits in
//! [`directory`]; [`MemoryStore`] implements all of them in process.

pub mod acl;
pub mod broadcast;
pub mod directory;
pub mod error;
pub mod filter;
pub mod hub;
mod locks;
pub mod memory;
pub mod registry;
pub mod router;
pub mod topic;
pub mod tree;
pub mod user;

pub use acl::{AccessLevel, AccessResolver};
pub use broadcast::{Delivery, Dispatcher};
pub use directory::{
    Directories, MessageRepository, PresenceRepository, StoreError, TopicDirectory, UserDirectory,
};
pub use error::HubError;
pub use filter::{Criterion, MessageFilter};
pub use hub::{Hub, StateSnapshot, ALL_TOPICS};
pub use memory::{Grant, MemoryStore};
pub use registry::{
    outbound_queue, ConnectionInfo, ConnectionRegistry, Instance, Outbound, OutboundReceiver,
    OutboundSender, TransportError, OUTBOUND_CAPACITY,
};
pub use router::{RouterError, RouterSnapshot, RouterStats, SubscriptionEntry, SubscriptionRouter, Table};
pub use topic::{Topic, TopicParameters};
pub use tree::{Materializer, TreeError};
pub use user::{Group, User};
