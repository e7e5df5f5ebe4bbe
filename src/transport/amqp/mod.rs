//! AMQP 0-9-1 transport (RabbitMQ) backed by `lapin`.

#[cfg(feature = "transport_lapin")]
mod lapin;

#[cfg(feature = "transport_lapin")]
pub use self::lapin::create_transport as create_lapin_transport;
