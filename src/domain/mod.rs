//! Domain layer public interface.
//!
//! Broker-independent abstractions shared by the messaging core and the
//! transport implementations. Consumers import symbols via this module, not
//! by referencing individual files directly.

mod transport;

pub use transport::{
    //
    Acknowledge,
    Address,
    Delivery,
    PublishChannel,
    PublisherPtr,
    QueueSpec,
    Transport,
    TransportPtr,
};
