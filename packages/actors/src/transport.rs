//! Ports to the relay transport and the signing collaborator.
//!
//! The worker never speaks the relay wire protocol or touches key material
//! itself; it drives these traits.

use std::future::Future;
use std::pin::Pin;

use dvm_core::{Event, EventId, EventTemplate, Filter, PublicKey};
use futures_util::stream::BoxStream;

/// Transport errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("no relay reachable: {0}")]
    Unreachable(String),

    #[error("subscription failed: {0}")]
    Subscribe(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("not connected")]
    NotConnected,

    #[error("disconnect failed: {0}")]
    Disconnect(String),
}

/// Signing errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SignerError {
    #[error("signing failed: {0}")]
    Signing(String),
}

/// Future type returned by transport operations.
pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send + 'a>>;

/// Items delivered by a subscription.
#[derive(Debug, Clone)]
pub enum RelayNotification {
    /// An event matching the subscription filter.
    Event {
        relay_url: String,
        subscription_id: String,
        event: Box<Event>,
    },
    /// Any other protocol message (notices, end-of-stored-events, ...).
    Message { relay_url: String, message: String },
}

/// Lazy stream of notifications. Ends only when the transport is lost.
pub type NotificationStream = BoxStream<'static, RelayNotification>;

/// Publish/subscribe access to one or more relays.
pub trait RelayTransport: Send + Sync + 'static {
    /// Connect to the given relays. Fails only if none is reachable.
    fn connect<'a>(&'a self, relays: &'a [String]) -> TransportFuture<'a, ()>;

    /// Subscribe to events matching `filter`.
    fn subscribe<'a>(&'a self, filter: &'a Filter) -> TransportFuture<'a, NotificationStream>;

    /// Publish a signed event and return its id.
    fn publish(&self, event: Event) -> TransportFuture<'_, EventId>;

    /// Close all relay connections.
    fn disconnect(&self) -> TransportFuture<'_, ()>;
}

/// Produces signed events with the worker's identity.
pub trait EventSigner: Send + Sync + 'static {
    fn public_key(&self) -> PublicKey;

    fn sign(&self, template: EventTemplate) -> Result<Event, SignerError>;
}
