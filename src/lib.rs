//! # scholar-throttle
//!
//! Adaptive request throttling for scraping literature databases that push
//! back: rate limits, blocks and CAPTCHA walls.
//!
//! Every request goes through one shared pacing policy, a persistent
//! per-session cookie store and an optional proxy rotation. Responses are
//! classified into outcomes instead of errors, so callers decide what to
//! retry.
//!
//! ## Features
//!
//! - Conservative, balanced and aggressive pacing presets with jitter
//! - CAPTCHA pause windows that every later request sits out
//! - Cookies and session data persisted across runs
//! - Proxy rotation with failure tracking and health probes
//! - Bounded, order-preserving batches with cancellation
//! - Running statistics written to a JSON stats file
//!
//! ## Example
//!
//! ```no_run
//! use scholar_throttle::{RateLimitStrategy, RequestHandler};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let handler = RequestHandler::builder()
//!         .with_strategy(RateLimitStrategy::Balanced)
//!         .build()?;
//!     let result = handler.get("https://scholar.google.com/scholar?q=rust", "scholar").await?;
//!     println!("{} -> {:?}", result.kind(), result.status());
//!     handler.cleanup().await?;
//!     Ok(())
//! }
//! ```

mod batch;
mod handler;

pub mod config;
pub mod modules;
pub mod outcome;
pub mod transport;

pub use crate::batch::{BatchCoordinator, BatchEntry};
pub use crate::handler::{
    FetchOptions,
    FetchResult,
    HandlerError,
    HandlerResult,
    RequestHandler,
    RequestHandlerBuilder,
};

pub use crate::config::{BatchConfig, ConfigError, HandlerConfig, ProbeConfig};

pub use crate::modules::{
    EventDispatcher,
    EventHandler,
    HandlerEvent,
    LoggingHandler,
    PacingConfig,
    ProxyEndpoint,
    ProxyHealthReport,
    ProxyProtocol,
    ProxyRotator,
    RateLimitPolicy,
    RateLimitStrategy,
    RateLimiter,
    SessionCookie,
    SessionHandle,
    SessionStore,
    StatsRecorder,
    StatsSnapshot,
};

pub use crate::outcome::{ClassifierConfig, OutcomeClassifier, OutcomeKind, RequestOutcome};

pub use crate::transport::{
    HttpTransport,
    OutboundRequest,
    ReqwestTransport,
    TimeoutConfig,
    TransportError,
    TransportResponse,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
