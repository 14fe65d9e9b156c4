//! # vmfleet Hypervisor
//!
//! Transport layer for hypervisor endpoints.
//!
//! Every endpoint, whatever its backend, is reached through the same
//! [`Hypervisor`] call surface, opened by a [`Connector`]:
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        Connector  →  Hypervisor         │
//! │  (list_domains, domain_info, migrate…)  │
//! └─────────────────────┬───────────────────┘
//!                       │
//!         ┌─────────────┴─────────────┐
//!         ▼                           ▼
//! ┌───────────────────┐     ┌───────────────────┐
//! │ LibvirtConnector  │     │    MockCluster    │
//! │   (via libvirt)   │     │    (in memory)    │
//! └───────────────────┘     └───────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use vmfleet_hypervisor::{Connector, MockCluster};
//!
//! #[tokio::main]
//! async fn main() {
//!     let cluster = MockCluster::new();
//!     cluster.add_host("qemu+ssh://node1/system");
//!
//!     let handle = cluster.open("qemu+ssh://node1/system").await.unwrap();
//!     let domains = handle.list_domains().await.unwrap();
//! }
//! ```

pub mod error;
pub mod libvirt;
pub mod mock;
pub mod traits;
pub mod types;
pub mod uri;
pub mod watch;
pub mod xml;

pub use error::{HypervisorError, Result};
pub use mock::{ConnectBehavior, MockBackend, MockCluster};
pub use traits::{Connector, DomainEventStream, Hypervisor, MigrationTarget};
pub use types::*;

// Re-export libvirt backend when available
#[cfg(feature = "libvirt")]
pub use libvirt::{LibvirtBackend, LibvirtConnector};
