//! Sidekick — transparent Anthropic API proxy with usage analytics.
//!
//! Library crate so integration tests in `tests/` can exercise the
//! components directly.

pub mod bus;
pub mod cli;
pub mod config;
pub mod errors;
pub mod processor;
pub mod proxy;
pub mod sse;
pub mod store;

/// Shared application state passed to the proxy handler.
pub struct AppState {
    pub config: config::Config,
    pub upstream: proxy::upstream::UpstreamClient,
    pub bus: bus::EventBus,
    pub writer: store::writer::WriterHandle<sqlx::PgPool>,
    pub processor: processor::Processor,
}
