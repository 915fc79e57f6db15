//! Work hook trait and optional pricing/payment capabilities.

use std::future::Future;
use std::pin::Pin;

use dvm_core::JobRequest;

/// Errors returned by work and hook functions.
#[derive(Debug, thiserror::Error)]
pub enum WorkError {
    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Source(#[from] Box<dyn std::error::Error + Send + Sync>),

    #[error("work timed out after {0:?}")]
    TimedOut(std::time::Duration),

    #[error("work panicked: {0}")]
    Panicked(String),
}

impl WorkError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Result type for work functions: the content of the result event.
pub type WorkResult = Result<String, WorkError>;

/// Future type for async work functions.
pub type WorkFuture = Pin<Box<dyn Future<Output = WorkResult> + Send>>;

/// Future type for pricing and payment hooks.
pub type HookFuture<T> = Pin<Box<dyn Future<Output = Result<T, WorkError>> + Send>>;

/// Computes the price of a job in millisats.
pub trait PriceHook: Send + Sync + 'static {
    fn calculate_price(&self, request: &JobRequest) -> HookFuture<u64>;
}

/// Checks whether a job was paid for.
pub trait PaymentHook: Send + Sync + 'static {
    fn check_paid(&self, request: &JobRequest) -> HookFuture<bool>;
}

/// The work a worker performs for each request.
///
/// Only [`do_work`](DvmHandler::do_work) is required. A handler that wants
/// payment enforced exposes a [`PaymentHook`]; the dispatch actor then checks
/// payment after announcing and before any work.
pub trait DvmHandler: Send + Sync + 'static {
    /// Process a request and return the result content.
    ///
    /// The returned future runs on its own task, so it must own what it needs.
    fn do_work(&self, request: &JobRequest) -> WorkFuture;

    /// Optional pricing capability.
    fn price_hook(&self) -> Option<&dyn PriceHook> {
        None
    }

    /// Optional payment capability.
    fn payment_hook(&self) -> Option<&dyn PaymentHook> {
        None
    }
}

/// A simple function-based handler without pricing or payment.
pub struct FnHandler<F>
where
    F: Fn(&JobRequest) -> WorkFuture + Send + Sync + 'static,
{
    work: F,
}

impl<F> FnHandler<F>
where
    F: Fn(&JobRequest) -> WorkFuture + Send + Sync + 'static,
{
    /// Create a new function-based handler.
    pub fn new(work: F) -> Self {
        Self { work }
    }
}

impl<F> DvmHandler for FnHandler<F>
where
    F: Fn(&JobRequest) -> WorkFuture + Send + Sync + 'static,
{
    fn do_work(&self, request: &JobRequest) -> WorkFuture {
        (self.work)(request)
    }
}

/// Helper macro for creating handlers from async blocks.
///
/// ```ignore
/// let handler = dvm_handler!(|request| Ok(format!("echo: {}", request.payload)));
/// ```
#[macro_export]
macro_rules! dvm_handler {
    (|$request:ident| $body:expr) => {
        $crate::FnHandler::new(|$request: &$crate::JobRequest| {
            let $request = $request.clone();
            let fut: $crate::WorkFuture = Box::pin(async move { $body });
            fut
        })
    };
}
