use crate::dispatch::CrawlRequest;
use crate::identity::IdentityId;
use crate::net::FetchResponse;
use anyhow::Error as AnyError;
use core::future::Future;
use core::pin::Pin;

pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>>;

/// Enumerates the execution stages of the [`ResponseHandler`] hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerStage {
    Handle,
    Shutdown,
}

/// Error surfaced by handler hooks. Every instance is considered fatal.
#[derive(Debug)]
pub struct HandlerError {
    stage: HandlerStage,
    source: AnyError,
}

impl HandlerError {
    pub fn new(stage: HandlerStage, source: AnyError) -> Self {
        Self { stage, source }
    }

    pub fn stage(&self) -> HandlerStage {
        self.stage
    }

    pub fn into_source(self) -> AnyError {
        self.source
    }
}

impl core::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:?} handler error: {}", self.stage, self.source)
    }
}

impl std::error::Error for HandlerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

/// A successful fetch handed downstream. Only 2xx/3xx responses that passed
/// every response stage are ever delivered.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub request: CrawlRequest,
    pub response: FetchResponse,
    pub identity: IdentityId,
}

/// Trait implemented by downstream consumers of fetched pages (parsers,
/// extractors). Called concurrently from every worker.
pub trait ResponseHandler: Send + Sync + 'static {
    fn handle<'a>(&'a self, delivery: Delivery) -> HandlerFuture<'a>;

    /// Called once during shutdown to allow graceful cleanup (flush buffers, close sinks, etc.).
    fn shutdown<'a>(&'a self) -> HandlerFuture<'a> {
        Box::pin(async { Ok(()) })
    }
}
