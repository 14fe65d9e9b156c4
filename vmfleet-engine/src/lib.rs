//! # vmfleet Engine
//!
//! State engine keeping a single control process in sync with many
//! hypervisor endpoints.
//!
//! ```text
//!          UI / CLI
//!             │ fetch, subscribe_events, request_migration
//!             ▼
//! ┌──────────────────────────────────────────────────────┐
//! │                        Engine                        │
//! │                                                      │
//! │  Cache ◄──── invalidate ──── EventDispatcher         │
//! │    │                              ▲                  │
//! │    ▼                              │ subscribe        │
//! │  ConnectionManager ───────────────┘                  │
//! │    ▲                                                 │
//! │    │ handles, endpoint loss                          │
//! │  MigrationOrchestrator        StatsAggregator        │
//! └────────────────────────┬─────────────────────────────┘
//!                          ▼
//!                  Hypervisor endpoints
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use vmfleet_engine::{Engine, EngineConfig, EndpointConfig, Query};
//! use vmfleet_hypervisor::MockCluster;
//!
//! #[tokio::main]
//! async fn main() {
//!     let cluster = Arc::new(MockCluster::new());
//!     cluster.add_host("qemu+ssh://node1/system");
//!
//!     let mut config = EngineConfig::default();
//!     config.endpoints.push(EndpointConfig::new("node1", "qemu+ssh://node1/system"));
//!
//!     let engine = Engine::new(config, cluster).unwrap();
//!     engine.connect("node1").await.unwrap();
//!     let domains = engine.fetch("node1", Query::ListDomains).await.unwrap();
//! }
//! ```

pub mod cache;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod events;
pub mod migration;
pub mod query;
pub mod stats;

pub use cache::{Cache, CachePolicy};
pub use config::{EndpointConfig, EngineConfig};
pub use connection::{ConnectionManager, ConnectionObserver, EndpointInfo, EndpointStatus};
pub use engine::{DomainAction, Engine};
pub use error::{EngineError, Result};
pub use events::{Event, EventKind, EventReceiver, EventStream, SubscriptionState};
pub use migration::{DiskAction, JobId, JobState, MigrationJob, MigrationOrchestrator};
pub use query::{Operation, Query, Value};
pub use stats::{Counters, Outcome, StatsAggregator, StatsReport};
