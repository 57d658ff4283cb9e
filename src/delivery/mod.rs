//! At-least-once delivery of updates.
//!
//! - `DeliveryCoordinator`: send, await confirmation, retry with backoff
//! - `AckRegistry`: correlation id to single-use completion latch
//! - `Transport` / `ChannelTransport`: the outbound message boundary
//! - `ConfirmationSender`: the consumer side of the acknowledgment channel

mod coordinator;
mod registry;
mod transport;

pub use coordinator::DeliveryCoordinator;
pub use registry::AckRegistry;
pub use transport::{
    ChannelTransport, ConfirmationSender, DeliveryConfirmation, Envelope, SendFuture, Transport,
};
