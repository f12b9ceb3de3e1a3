//! Zero-configuration name resolution for a single-node cluster.
//!
//! The node's own name and every route host under the mDNS TLD are answered
//! over multicast DNS. All long-running pieces are started through the
//! dependency-ordered [`servicemanager::ServiceManager`].

pub mod config;
pub mod error;
pub mod mdns;
pub mod servicemanager;
pub mod signal;
pub mod types;
pub mod watch;

pub use config::Config;
pub use error::{MdnsError, ServiceError};
pub use servicemanager::{GenericService, Service, ServiceManager};
pub use signal::Signal;
