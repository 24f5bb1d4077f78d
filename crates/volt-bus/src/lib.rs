//! Broker abstraction and message routing for the Voltgrid runtime.
//!
//! [`BrokerClient`] mediates all publish/subscribe traffic over a pluggable
//! [`Transport`] - a real MQTT broker in production, an in-process
//! [`LocalHub`] in tests. On top of it sit the RPC layer
//! ([`rpc::RpcClient`]) and the error bus ([`errors::ErrorBus`]).

mod client;
pub mod errors;
mod queue;
pub mod rpc;
mod transport;

pub use client::{BrokerClient, BusStats, SubscriptionToken};
pub use queue::{Handler, StopMode};
pub use transport::{BrokerConfig, Frame, LocalHub, LocalTransport, MqttTransport, Qos, Transport};
