//! In-process relay transport and signer.
//!
//! Suitable for local development, demos and tests: events injected into a
//! [`MemoryRelay`] are delivered to its subscribers, and everything the
//! worker publishes is kept for inspection.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use dvm_core::{Event, EventId, EventTemplate, Filter, PublicKey, Timestamp};
use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use ulid::Ulid;

use crate::transport::{
    EventSigner, NotificationStream, RelayNotification, RelayTransport, SignerError,
    TransportError, TransportFuture,
};

const DEFAULT_RELAY_URL: &str = "memory://relay";

struct Subscriber {
    id: String,
    filter: Filter,
    tx: mpsc::UnboundedSender<RelayNotification>,
}

#[derive(Default)]
struct RelayState {
    connected: Vec<String>,
    unreachable: HashSet<String>,
    subscribers: Vec<Subscriber>,
    stored: Vec<Event>,
    published: Vec<Event>,
    publish_failures: usize,
    connect_calls: usize,
    disconnect_calls: usize,
}

impl RelayState {
    fn relay_url(&self) -> String {
        self.connected
            .first()
            .cloned()
            .unwrap_or_else(|| DEFAULT_RELAY_URL.to_string())
    }

    /// Deliver an event to matching subscribers, dropping closed ones.
    fn deliver(&mut self, event: &Event) -> usize {
        let relay_url = self.relay_url();
        let mut delivered = 0;
        self.subscribers.retain(|sub| {
            if !sub.filter.matches(event) {
                return !sub.tx.is_closed();
            }
            let sent = sub
                .tx
                .send(RelayNotification::Event {
                    relay_url: relay_url.clone(),
                    subscription_id: sub.id.clone(),
                    event: Box::new(event.clone()),
                })
                .is_ok();
            if sent {
                delivered += 1;
            }
            sent
        });
        delivered
    }
}

/// In-memory relay shared by cloning.
#[derive(Clone, Default)]
pub struct MemoryRelay {
    inner: Arc<Mutex<RelayState>>,
}

impl MemoryRelay {
    /// Create an empty relay.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, RelayState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make `url` fail to connect.
    pub fn set_unreachable(&self, url: impl Into<String>) {
        self.state().unreachable.insert(url.into());
    }

    /// Make the next `count` publish calls fail.
    pub fn fail_next_publishes(&self, count: usize) {
        self.state().publish_failures = count;
    }

    /// Deliver an inbound event to subscribers. Returns how many received it.
    pub fn inject(&self, event: Event) -> usize {
        let mut state = self.state();
        let delivered = state.deliver(&event);
        state.stored.push(event);
        delivered
    }

    /// Deliver a protocol message to every subscriber.
    pub fn send_message(&self, message: impl Into<String>) {
        let mut state = self.state();
        let relay_url = state.relay_url();
        let message = message.into();
        state.subscribers.retain(|sub| {
            sub.tx
                .send(RelayNotification::Message {
                    relay_url: relay_url.clone(),
                    message: message.clone(),
                })
                .is_ok()
        });
    }

    /// End every subscription stream, as if all relays were lost.
    pub fn close_subscriptions(&self) {
        self.state().subscribers.clear();
    }

    /// Events published through this relay, in publish order.
    pub fn published(&self) -> Vec<Event> {
        self.state().published.clone()
    }

    /// Stored events (injected and published) matching `filter`.
    pub fn query(&self, filter: &Filter) -> Vec<Event> {
        self.state()
            .stored
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect()
    }

    pub fn is_connected(&self) -> bool {
        !self.state().connected.is_empty()
    }

    pub fn connect_count(&self) -> usize {
        self.state().connect_calls
    }

    pub fn disconnect_count(&self) -> usize {
        self.state().disconnect_calls
    }

    pub fn subscription_count(&self) -> usize {
        self.state().subscribers.len()
    }
}

impl RelayTransport for MemoryRelay {
    fn connect<'a>(&'a self, relays: &'a [String]) -> TransportFuture<'a, ()> {
        let result = {
            let mut state = self.state();
            state.connect_calls += 1;
            let reachable: Vec<String> = relays
                .iter()
                .filter(|url| !state.unreachable.contains(*url))
                .cloned()
                .collect();
            if reachable.is_empty() {
                Err(TransportError::Unreachable(relays.join(", ")))
            } else {
                state.connected = reachable;
                Ok(())
            }
        };
        Box::pin(async move { result })
    }

    fn subscribe<'a>(&'a self, filter: &'a Filter) -> TransportFuture<'a, NotificationStream> {
        let result = {
            let mut state = self.state();
            if state.connected.is_empty() {
                Err(TransportError::NotConnected)
            } else {
                let (tx, rx) = mpsc::unbounded_channel();
                state.subscribers.push(Subscriber {
                    id: Ulid::new().to_string(),
                    filter: filter.clone(),
                    tx,
                });
                let stream = futures_util::stream::unfold(rx, |mut rx| async move {
                    rx.recv().await.map(|notification| (notification, rx))
                })
                .boxed();
                Ok(stream)
            }
        };
        Box::pin(async move { result })
    }

    fn publish(&self, event: Event) -> TransportFuture<'_, EventId> {
        let result = {
            let mut state = self.state();
            if state.connected.is_empty() {
                Err(TransportError::NotConnected)
            } else if state.publish_failures > 0 {
                state.publish_failures -= 1;
                Err(TransportError::Publish("relay rejected event".into()))
            } else {
                let id = event.id.clone();
                state.deliver(&event);
                state.stored.push(event.clone());
                state.published.push(event);
                Ok(id)
            }
        };
        Box::pin(async move { result })
    }

    fn disconnect(&self) -> TransportFuture<'_, ()> {
        {
            let mut state = self.state();
            state.disconnect_calls += 1;
            state.connected.clear();
            state.subscribers.clear();
        }
        Box::pin(async { Ok(()) })
    }
}

/// Signer for in-process relays.
///
/// Stamps events with a canonical id and the configured public key but
/// leaves the signature empty; real deployments plug in a key-holding
/// [`EventSigner`].
#[derive(Debug, Clone)]
pub struct MemorySigner {
    public_key: PublicKey,
}

impl MemorySigner {
    pub fn new(public_key: PublicKey) -> Self {
        Self { public_key }
    }

    /// Derive a stable public key from an identity string, or generate one.
    pub fn from_identity(identity: Option<&str>) -> Self {
        let seed = match identity {
            Some(identity) => identity.to_string(),
            None => {
                tracing::warn!("No identity configured, generating an ephemeral one");
                Ulid::new().to_string()
            }
        };
        let digest = Sha256::digest(seed.as_bytes());
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        Self::new(PublicKey::from_bytes(bytes))
    }
}

impl EventSigner for MemorySigner {
    fn public_key(&self) -> PublicKey {
        self.public_key.clone()
    }

    fn sign(&self, template: EventTemplate) -> Result<Event, SignerError> {
        Ok(template.into_event(self.public_key.clone(), Timestamp::now(), String::new()))
    }
}

#[cfg(test)]
mod tests {
    use dvm_core::{Kind, Timestamp};
    use futures_util::StreamExt;

    use super::*;

    fn note(kind: u16, signer: &MemorySigner) -> Event {
        signer.sign(EventTemplate::new(Kind(kind), "hello")).unwrap()
    }

    #[tokio::test]
    async fn delivers_matching_events_to_subscribers() {
        let relay = MemoryRelay::new();
        let signer = MemorySigner::from_identity(Some("test"));
        relay.connect(&["wss://relay.test".to_string()]).await.unwrap();

        let filter = Filter::new().kinds([Kind(5050)]).since(Timestamp(0));
        let mut stream = relay.subscribe(&filter).await.unwrap();

        assert_eq!(relay.inject(note(1, &signer)), 0);
        assert_eq!(relay.inject(note(5050, &signer)), 1);

        match stream.next().await {
            Some(RelayNotification::Event { event, relay_url, .. }) => {
                assert_eq!(event.kind, Kind(5050));
                assert_eq!(relay_url, "wss://relay.test");
            }
            other => panic!("unexpected notification: {:?}", other),
        }

        relay.close_subscriptions();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn connect_fails_when_every_relay_is_unreachable() {
        let relay = MemoryRelay::new();
        relay.set_unreachable("wss://down.test");

        let err = relay.connect(&["wss://down.test".to_string()]).await.unwrap_err();
        assert!(matches!(err, TransportError::Unreachable(_)));

        relay
            .connect(&["wss://down.test".to_string(), "wss://up.test".to_string()])
            .await
            .unwrap();
        assert!(relay.is_connected());
    }

    #[tokio::test]
    async fn forced_publish_failures_are_consumed() {
        let relay = MemoryRelay::new();
        let signer = MemorySigner::from_identity(None);
        relay.connect(&["wss://relay.test".to_string()]).await.unwrap();
        relay.fail_next_publishes(1);

        assert!(relay.publish(note(1, &signer)).await.is_err());
        assert!(relay.publish(note(1, &signer)).await.is_ok());
        assert_eq!(relay.published().len(), 1);
    }

    #[test]
    fn signer_identity_is_stable() {
        let a = MemorySigner::from_identity(Some("same"));
        let b = MemorySigner::from_identity(Some("same"));
        assert_eq!(a.public_key(), b.public_key());

        let event = note(5050, &a);
        assert!(event.has_valid_id());
        assert_eq!(event.pubkey, a.public_key());
    }
}
