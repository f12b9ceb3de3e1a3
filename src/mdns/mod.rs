//! Multicast DNS: name table, responder, and the services that feed it.

pub mod controller;
pub mod interfaces;
pub mod resolver;
pub mod routes;
pub mod server;

pub use controller::{MdnsController, NodeAddresses, MDNS_CONTROLLER_NAME};
pub use resolver::Resolver;
pub use routes::{Backoff, RouteController, ROUTE_CONTROLLER_NAME};
pub use server::{Responder, Server, DEFAULT_MDNS_TLD};
