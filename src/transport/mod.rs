//! Transport implementations.
//!
//! Concrete implementations of the domain-level `Transport` trait. Broker
//! client types never leave this module; transports are exposed only through
//! constructor functions.

mod amqp;
mod memory;

#[cfg(feature = "transport_lapin")]
pub use amqp::create_lapin_transport;

pub use memory::{create_memory_transport, create_memory_transport_with_hub, MemoryHub};
