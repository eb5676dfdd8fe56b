//! Cross-cutting services module
//!
//! Pacing, sessions, proxy rotation, statistics and lifecycle events shared
//! by every request the handler makes.

pub mod events;
pub mod proxy;
pub mod rate_limit;
pub mod session;
pub mod stats;

// Re-export commonly used types
pub use events::{
    CaptchaPauseEvent, ErrorEvent, EventDispatcher, EventHandler, HandlerEvent, LoggingHandler,
    PostResponseEvent, PreRequestEvent, ProxyRotatedEvent,
};
pub use proxy::{
    ProxyCredentials, ProxyEndpoint, ProxyHealthReport, ProxyParseError, ProxyProbe, ProxyProtocol,
    ProxyRotator, ProxyStats,
};
pub use rate_limit::{
    PacingConfig, RateLimitPolicy, RateLimitSnapshot, RateLimitStrategy, RateLimiter, StrategyParams,
    UnknownStrategy,
};
pub use session::{
    InvalidSessionId, SessionCookie, SessionError, SessionHandle, SessionRecord, SessionStore,
};
pub use stats::{HistoryEntry, StatsError, StatsRecorder, StatsSnapshot};
