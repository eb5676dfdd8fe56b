//! Event hooks around the fetch lifecycle.
//!
//! The executor emits structured events; handlers turn them into logs,
//! dashboards or test assertions.

use chrono::{DateTime, Utc};
use http::Method;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::outcome::OutcomeKind;

/// Emitted after the pacing wait, right before the HTTP call.
#[derive(Debug, Clone)]
pub struct PreRequestEvent {
    pub url: Url,
    pub method: Method,
    pub session_id: String,
    pub proxy: Option<String>,
    pub waited: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PostResponseEvent {
    pub url: Url,
    pub method: Method,
    pub status: Option<u16>,
    pub outcome: OutcomeKind,
    pub latency: Duration,
    pub next_delay: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CaptchaPauseEvent {
    pub url: Url,
    pub indicator: Option<String>,
    pub pause: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ProxyRotatedEvent {
    pub from: String,
    pub to: Option<String>,
    pub reason: OutcomeKind,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub url: Url,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum HandlerEvent {
    PreRequest(PreRequestEvent),
    PostResponse(PostResponseEvent),
    CaptchaPause(CaptchaPauseEvent),
    ProxyRotated(ProxyRotatedEvent),
    Error(ErrorEvent),
}

/// Trait implemented by event handlers.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &HandlerEvent);
}

/// Broadcasts events to registered handlers.
#[derive(Default, Clone)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    pub fn register_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn dispatch(&self, event: HandlerEvent) {
        for handler in &self.handlers {
            handler.handle(&event);
        }
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

/// Logs events using the `log` crate.
#[derive(Debug)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &HandlerEvent) {
        match event {
            HandlerEvent::PreRequest(pre) => {
                log::debug!(
                    "-> {} {} [session {}] via {} after {:.2}s",
                    pre.method,
                    pre.url,
                    pre.session_id,
                    pre.proxy.as_deref().unwrap_or("direct"),
                    pre.waited.as_secs_f64()
                );
            }
            HandlerEvent::PostResponse(post) => {
                log::info!(
                    "<- {} {} -> {} ({}, {:.2}s, delay now {:.1}s)",
                    post.method,
                    post.url,
                    post.status.map_or_else(|| "-".to_string(), |s| s.to_string()),
                    post.outcome,
                    post.latency.as_secs_f64(),
                    post.next_delay
                );
            }
            HandlerEvent::CaptchaPause(captcha) => {
                log::warn!(
                    "captcha detected at {} ({}), pausing {:.0}s",
                    captcha.url,
                    captcha.indicator.as_deref().unwrap_or("unknown indicator"),
                    captcha.pause.as_secs_f64()
                );
            }
            HandlerEvent::ProxyRotated(rotated) => {
                log::info!(
                    "rotating proxy {} -> {} after {}",
                    rotated.from,
                    rotated.to.as_deref().unwrap_or("none available"),
                    rotated.reason
                );
            }
            HandlerEvent::Error(error) => {
                log::warn!("request to {} failed: {}", error.url, error.error);
            }
        }
    }
}
