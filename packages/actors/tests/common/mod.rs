#![allow(dead_code)]

use std::error::Error;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use dvm_actors::{
    DvmHandler, DvmWorker, Event, EventSigner, EventTemplate, HookFuture, JobEvent, JobRequest,
    Kind, MemoryRelay, MemorySigner, PaymentHook, PriceHook, Tag, WorkError, WorkFuture,
    WorkerConfig,
};
use tokio::sync::broadcast;

pub const RELAY: &str = "wss://relay.test";
pub const WAIT: Duration = Duration::from_secs(5);

pub type TestResult<T = ()> = Result<T, Box<dyn Error>>;

/// Config with short intervals so tests settle quickly.
pub fn config() -> WorkerConfig {
    WorkerConfig::new("test")
        .with_kinds([5050])
        .with_relay(RELAY)
        .with_poll_interval(Duration::from_millis(10))
        .with_publish_retry_delay(Duration::from_millis(10))
        .with_shutdown_timeout(Duration::from_secs(2))
}

/// Handler whose behaviour is picked by the request payload:
/// `ping` → `pong`, `fail` → error, `panic` → panic, `slow` → sleeps,
/// anything else is echoed.
#[derive(Clone, Default)]
pub struct ScriptedHandler {
    pub calls: Arc<AtomicUsize>,
    flaky: Option<(MemoryRelay, usize)>,
}

impl ScriptedHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the relay reject the next `failures` publishes once work finishes.
    pub fn failing_publishes(relay: MemoryRelay, failures: usize) -> Self {
        Self {
            calls: Arc::default(),
            flaky: Some((relay, failures)),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl DvmHandler for ScriptedHandler {
    fn do_work(&self, request: &JobRequest) -> WorkFuture {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let payload = request.payload.clone();
        let flaky = self.flaky.clone();
        Box::pin(async move {
            let output = match payload.as_str() {
                "ping" => "pong".to_string(),
                "fail" => return Err(WorkError::failed("refused to work")),
                "panic" => panic!("handler blew up"),
                "slow" => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    "finally".to_string()
                }
                other => format!("echo: {}", other),
            };
            if let Some((relay, failures)) = flaky {
                relay.fail_next_publishes(failures);
            }
            Ok(output)
        })
    }
}

/// Handler that charges a fixed price and consults a payment flag.
pub struct PaywallHandler {
    pub paid: bool,
    pub price_msats: u64,
    pub calls: Arc<AtomicUsize>,
    check_fails: bool,
}

impl PaywallHandler {
    pub fn new(paid: bool, price_msats: u64) -> Self {
        Self {
            paid,
            price_msats,
            calls: Arc::default(),
            check_fails: false,
        }
    }

    /// A paywall whose payment check always errors.
    pub fn unreachable_wallet(price_msats: u64) -> Self {
        Self {
            check_fails: true,
            ..Self::new(false, price_msats)
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl PriceHook for PaywallHandler {
    fn calculate_price(&self, _request: &JobRequest) -> HookFuture<u64> {
        let price = self.price_msats;
        Box::pin(async move { Ok(price) })
    }
}

impl PaymentHook for PaywallHandler {
    fn check_paid(&self, _request: &JobRequest) -> HookFuture<bool> {
        let paid = self.paid;
        let check_fails = self.check_fails;
        Box::pin(async move {
            if check_fails {
                return Err(WorkError::failed("wallet backend unreachable"));
            }
            Ok(paid)
        })
    }
}

impl DvmHandler for PaywallHandler {
    fn do_work(&self, _request: &JobRequest) -> WorkFuture {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok("premium content".to_string()) })
    }

    fn price_hook(&self) -> Option<&dyn PriceHook> {
        Some(self)
    }

    fn payment_hook(&self) -> Option<&dyn PaymentHook> {
        Some(self)
    }
}

/// A worker wired to a [`MemoryRelay`], plus a customer that submits requests.
pub struct Harness {
    pub relay: MemoryRelay,
    pub worker: DvmWorker,
    pub events: broadcast::Receiver<JobEvent>,
    pub customer: MemorySigner,
}

impl Harness {
    pub fn new(config: WorkerConfig, handler: Arc<dyn DvmHandler>) -> Self {
        Self::with_relay(MemoryRelay::new(), config, handler)
    }

    pub fn with_relay(relay: MemoryRelay, config: WorkerConfig, handler: Arc<dyn DvmHandler>) -> Self {
        let worker = DvmWorker::new(
            config,
            Arc::new(relay.clone()),
            Arc::new(MemorySigner::from_identity(Some("worker"))),
            handler,
        );
        let events = worker.subscribe_events();
        Self {
            relay,
            worker,
            events,
            customer: MemorySigner::from_identity(Some("customer")),
        }
    }

    /// Build and start a harness.
    pub async fn start(config: WorkerConfig, handler: Arc<dyn DvmHandler>) -> TestResult<Self> {
        let harness = Self::new(config, handler);
        harness.worker.start().await?;
        Ok(harness)
    }

    /// A signed kind-5050 request from the customer.
    pub fn request(&self, payload: &str) -> TestResult<Event> {
        let template = EventTemplate::new(Kind(5050), payload)
            .with_tag(Tag::new(["i", payload, "text"]));
        Ok(self.customer.sign(template)?)
    }

    /// Sign a request and deliver it through the relay.
    pub fn submit(&self, payload: &str) -> TestResult<Event> {
        let event = self.request(payload)?;
        self.relay.inject(event.clone());
        Ok(event)
    }

    /// Wait for the next pipeline event matching `pred`.
    pub async fn wait_for<F>(&mut self, pred: F) -> TestResult<JobEvent>
    where
        F: Fn(&JobEvent) -> bool,
    {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            match tokio::time::timeout_at(deadline, self.events.recv()).await {
                Err(_) => return Err("timed out waiting for job event".into()),
                Ok(Ok(event)) if pred(&event) => return Ok(event),
                Ok(Ok(_)) | Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    return Err("job event channel closed".into());
                }
            }
        }
    }

    /// Wait until `request` reached a terminal pipeline event.
    pub async fn wait_done(&mut self, request: &Event) -> TestResult<JobEvent> {
        let id = request.id.clone();
        self.wait_for(move |e| e.is_terminal() && e.request_id() == Some(&id))
            .await
    }

    /// Published result events, in publish order.
    pub fn results(&self) -> Vec<Event> {
        self.published_of_kind(Kind(6050))
    }

    /// Published feedback events, in publish order.
    pub fn feedback(&self) -> Vec<Event> {
        self.published_of_kind(Kind::JOB_FEEDBACK)
    }

    fn published_of_kind(&self, kind: Kind) -> Vec<Event> {
        self.relay
            .published()
            .into_iter()
            .filter(|e| e.kind == kind)
            .collect()
    }
}

/// Events referencing `request` through their `e` tag.
pub fn referencing<'a>(events: &'a [Event], request: &Event) -> Vec<&'a Event> {
    events
        .iter()
        .filter(|e| e.tag_value("e") == Some(request.id.as_str()))
        .collect()
}
