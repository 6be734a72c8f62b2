//! In-process publish/subscribe transport.
//!
//! Typed topics with keep-last queues, QoS matching on reliability and
//! durability, and request/response services. Everything is keyed by fully
//! resolved names (see [`names::resolve`]).

pub mod bus;
pub mod errors;
pub mod names;
pub mod qos;
pub mod service;

pub use bus::{Bus, Publisher, Subscription};
pub use errors::BridgeError;
pub use qos::{Durability, History, QosProfile, Reliability};
pub use service::{ServiceClient, ServiceRequest, ServiceServer};
