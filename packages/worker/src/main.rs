//! `hello-dvm` -- hello world data vending machine.
//!
//! Answers every kind 5050 request with `Hello World!`, free of charge.
//! Runs against an in-process relay and submits one test request from a
//! built-in client, prints the feedback and result events, then exits.
//!
//! # Environment variables
//!
//! | Variable                      | Required | Default                 |
//! |-------------------------------|----------|-------------------------|
//! | `HELLO_DVM_KINDS`             | no       | `5050`                  |
//! | `HELLO_DVM_RELAYS`            | no       | damus and primal relays |
//! | `HELLO_DVM_NSEC`              | no       | generated               |
//! | `HELLO_DVM_POLL_INTERVAL_MS`  | no       | `1000`                  |
//! | `HELLO_DVM_WORK_TIMEOUT_SECS` | no       | none                    |
//! | `TEST_CLIENT_NSEC`            | no       | generated               |

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use dvm_actors::{
    DvmHandler, DvmWorker, EventSigner, EventTemplate, Filter, HookFuture, JobEvent, JobRequest,
    Kind, MemoryRelay, MemorySigner, PaymentHook, PriceHook, WorkFuture,
};
use dvm_core::WorkerConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const CONFIG_PREFIX: &str = "HELLO_DVM";
const DEFAULT_RELAYS: [&str; 2] = ["wss://relay.damus.io", "wss://relay.primal.net"];
const RESULT_WAIT: Duration = Duration::from_secs(10);

struct HelloWorld;

impl DvmHandler for HelloWorld {
    fn do_work(&self, request: &JobRequest) -> WorkFuture {
        tracing::info!(request_id = %request.id, payload = %request.payload, "Saying hello");
        Box::pin(async { Ok("Hello World!".to_string()) })
    }

    fn price_hook(&self) -> Option<&dyn PriceHook> {
        Some(self)
    }

    fn payment_hook(&self) -> Option<&dyn PaymentHook> {
        Some(self)
    }
}

impl PriceHook for HelloWorld {
    fn calculate_price(&self, _request: &JobRequest) -> HookFuture<u64> {
        Box::pin(async { Ok(0) })
    }
}

impl PaymentHook for HelloWorld {
    fn check_paid(&self, _request: &JobRequest) -> HookFuture<bool> {
        Box::pin(async { Ok(true) })
    }
}

fn with_defaults(mut config: WorkerConfig) -> WorkerConfig {
    if config.kinds.is_empty() {
        config = config.with_kinds([5050]);
    }
    if config.relays.is_empty() {
        for relay in DEFAULT_RELAYS {
            config = config.with_relay(relay);
        }
    }
    config
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hello_dvm=info,dvm_actors=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = with_defaults(WorkerConfig::from_env(CONFIG_PREFIX)?);
    let relay = MemoryRelay::new();
    let signer = MemorySigner::from_identity(config.identity.as_deref());
    tracing::info!(pubkey = %signer.public_key(), ephemeral = config.ephemeral, "Worker identity");

    let worker = DvmWorker::new(
        config,
        Arc::new(relay.clone()),
        Arc::new(signer),
        Arc::new(HelloWorld),
    );
    let mut events = worker.subscribe_events();
    worker.start().await?;

    // Test client
    let client_nsec = std::env::var("TEST_CLIENT_NSEC").ok();
    let client = MemorySigner::from_identity(client_nsec.as_deref());
    let request = client.sign(EventTemplate::new(
        Kind(5050),
        "New test from the hello-dvm test client!",
    ))?;
    tracing::info!(request_id = %request.id, "Sending test request");
    relay.inject(request.clone());

    let outcome = tokio::time::timeout(RESULT_WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if event.is_terminal() && event.request_id() == Some(&request.id) => {
                    return Some(event);
                }
                Ok(_) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await;

    match outcome {
        Ok(Some(event)) => tracing::info!(status = ?event.job_status(), "{}", event.description()),
        Ok(None) => tracing::warn!("Worker stopped before answering"),
        Err(_) => tracing::warn!(wait = ?RESULT_WAIT, "No answer to the test request"),
    }

    let filter = Filter::new().kinds([Kind(6050), Kind::JOB_FEEDBACK]);
    for event in relay.query(&filter) {
        println!("{}", event.as_json()?);
    }

    worker.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_kinds_and_relays() {
        let config = with_defaults(WorkerConfig::from_lookup(CONFIG_PREFIX, |_| None).unwrap());
        assert!(config.validate().is_ok());
        assert_eq!(config.relays, DEFAULT_RELAYS);

        let lookup = |key: &str| (key == "HELLO_DVM_RELAYS").then(|| "wss://own.relay".to_string());
        let config = with_defaults(WorkerConfig::from_lookup(CONFIG_PREFIX, lookup).unwrap());
        assert_eq!(config.relays, ["wss://own.relay"]);
    }

    #[tokio::test]
    async fn answers_hello_world_for_free() {
        let request = MemorySigner::from_identity(Some("client"))
            .sign(EventTemplate::new(Kind(5050), "hi"))
            .unwrap();
        let request = JobRequest::from_event(request, None);

        assert_eq!(HelloWorld.do_work(&request).await.unwrap(), "Hello World!");
        assert_eq!(HelloWorld.calculate_price(&request).await.unwrap(), 0);
        assert!(HelloWorld.check_paid(&request).await.unwrap());
    }
}
