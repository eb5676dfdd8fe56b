//! Request orchestration.
//!
//! Wires the pacing policy, session store, proxy rotator, classifier and
//! stats recorder around a single HTTP exchange. Network failures and
//! adversarial responses come back as [`RequestOutcome`] values; only caller
//! mistakes surface as [`HandlerError`].

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use http::header::COOKIE;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use thiserror::Error;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::{ConfigError, HandlerConfig};
use crate::modules::events::{
	CaptchaPauseEvent, ErrorEvent, EventDispatcher, EventHandler, HandlerEvent, LoggingHandler,
	PostResponseEvent, PreRequestEvent, ProxyRotatedEvent,
};
use crate::modules::proxy::{ProxyEndpoint, ProxyHealthReport, ProxyProbe, ProxyRotator};
use crate::modules::rate_limit::{PacingConfig, RateLimitStrategy, RateLimiter};
use crate::modules::session::{InvalidSessionId, SessionError, SessionHandle, SessionStore, validate_session_id};
use crate::modules::stats::{StatsError, StatsRecorder, StatsSnapshot};
use crate::outcome::{ClassifierConfig, OutcomeClassifier, OutcomeKind, RequestOutcome};
use crate::transport::{HttpTransport, OutboundRequest, ReqwestTransport, TransportError, TransportResponse};

/// Result alias used across the public API.
pub type HandlerResult<T> = Result<T, HandlerError>;

/// Caller mistakes and persistence failures. Scraping conditions are never
/// reported through this type.
#[derive(Debug, Error)]
pub enum HandlerError {
	#[error("url must not be empty")]
	EmptyUrl,
	#[error("invalid url '{url}': {reason}")]
	InvalidUrl { url: String, reason: String },
	#[error("unsupported http method '{0}'")]
	InvalidMethod(String),
	#[error("invalid header '{0}'")]
	InvalidHeader(String),
	#[error("max_concurrent must be at least 1")]
	InvalidConcurrency,
	#[error(transparent)]
	InvalidSessionId(#[from] InvalidSessionId),
	#[error(transparent)]
	Session(#[from] SessionError),
	#[error(transparent)]
	Config(#[from] ConfigError),
	#[error("transport initialisation failed: {0}")]
	Transport(#[from] TransportError),
	#[error("invalid classifier phrase: {0}")]
	Classifier(#[from] regex::Error),
	#[error(transparent)]
	Stats(#[from] StatsError),
}

/// Per-request overrides.
#[derive(Debug, Clone)]
pub struct FetchOptions {
	pub method: Method,
	/// Applied to this request, and used as the session's header overrides
	/// when the session is first opened.
	pub headers: BTreeMap<String, String>,
	pub params: Vec<(String, String)>,
	pub body: Option<Bytes>,
	pub use_proxy: bool,
}

impl Default for FetchOptions {
	fn default() -> Self {
		Self {
			method: Method::GET,
			headers: BTreeMap::new(),
			params: Vec::new(),
			body: None,
			use_proxy: true,
		}
	}
}

impl FetchOptions {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_method(mut self, method: Method) -> Self {
		self.method = method;
		self
	}

	/// Parses a method name such as `"POST"`.
	pub fn try_with_method(mut self, method: &str) -> HandlerResult<Self> {
		self.method = Method::from_bytes(method.trim().to_ascii_uppercase().as_bytes())
			.map_err(|_| HandlerError::InvalidMethod(method.to_string()))?;
		Ok(self)
	}

	pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
		self.headers.insert(name.into(), value.into());
		self
	}

	pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
		self.params.push((key.into(), value.into()));
		self
	}

	pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
		self.body = Some(body.into());
		self
	}

	pub fn without_proxy(mut self) -> Self {
		self.use_proxy = false;
		self
	}
}

/// What a single fetch produced.
#[derive(Debug, Clone)]
pub struct FetchResult {
	pub outcome: RequestOutcome,
	/// Raw response; `None` when the exchange failed at the network level.
	pub response: Option<TransportResponse>,
}

impl FetchResult {
	pub fn kind(&self) -> OutcomeKind {
		self.outcome.kind
	}

	pub fn status(&self) -> Option<u16> {
		self.outcome.http_status
	}

	pub fn text(&self) -> Option<String> {
		self.response.as_ref().map(TransportResponse::text)
	}
}

/// A request that passed validation and is ready to be paced and sent.
#[derive(Debug, Clone)]
pub(crate) struct PreparedFetch {
	pub(crate) url: Url,
	pub(crate) session_id: String,
	method: Method,
	overrides: BTreeMap<String, String>,
	headers: HeaderMap,
	body: Option<Bytes>,
	use_proxy: bool,
}

pub(crate) fn parse_target(raw: &str) -> HandlerResult<Url> {
	let trimmed = raw.trim();
	if trimmed.is_empty() {
		return Err(HandlerError::EmptyUrl);
	}
	let url = Url::parse(trimmed).map_err(|err| HandlerError::InvalidUrl {
		url: raw.to_string(),
		reason: err.to_string(),
	})?;
	if !matches!(url.scheme(), "http" | "https") {
		return Err(HandlerError::InvalidUrl {
			url: raw.to_string(),
			reason: format!("unsupported scheme '{}'", url.scheme()),
		});
	}
	Ok(url)
}

fn to_header_map(headers: &BTreeMap<String, String>) -> HandlerResult<HeaderMap> {
	let mut map = HeaderMap::new();
	for (name, value) in headers {
		let header_name = HeaderName::from_bytes(name.as_bytes())
			.map_err(|_| HandlerError::InvalidHeader(name.clone()))?;
		let header_value =
			HeaderValue::from_str(value).map_err(|_| HandlerError::InvalidHeader(name.clone()))?;
		map.insert(header_name, header_value);
	}
	Ok(map)
}

impl PreparedFetch {
	pub(crate) fn new(url: &str, session_id: &str, options: &FetchOptions) -> HandlerResult<Self> {
		validate_session_id(session_id)?;
		let mut target = parse_target(url)?;
		if !options.params.is_empty() {
			target.query_pairs_mut().extend_pairs(options.params.iter());
		}
		Ok(Self {
			url: target,
			session_id: session_id.to_string(),
			method: options.method.clone(),
			overrides: options.headers.clone(),
			headers: to_header_map(&options.headers)?,
			body: options.body.clone(),
			use_proxy: options.use_proxy,
		})
	}
}

/// Fluent builder for [`RequestHandler`].
pub struct RequestHandlerBuilder {
	config: HandlerConfig,
	transport: Option<Arc<dyn HttpTransport>>,
	handlers: Vec<Arc<dyn EventHandler>>,
}

impl RequestHandlerBuilder {
	pub fn new() -> Self {
		Self {
			config: HandlerConfig::default(),
			transport: None,
			handlers: Vec::new(),
		}
	}

	pub fn with_config(mut self, config: HandlerConfig) -> Self {
		self.config = config;
		self
	}

	pub fn with_strategy(mut self, strategy: RateLimitStrategy) -> Self {
		self.config.strategy = strategy;
		self
	}

	pub fn with_pacing(mut self, pacing: PacingConfig) -> Self {
		self.config.pacing = pacing;
		self
	}

	pub fn with_proxies<I>(mut self, proxies: I) -> Self
	where
		I: IntoIterator<Item = ProxyEndpoint>,
	{
		self.config.proxies = proxies.into_iter().collect();
		self
	}

	pub fn with_session_dir(mut self, dir: impl AsRef<Path>) -> Self {
		self.config.session_dir = dir.as_ref().to_path_buf();
		self
	}

	pub fn with_stats_path(mut self, path: impl AsRef<Path>) -> Self {
		self.config.stats_path = path.as_ref().to_path_buf();
		self
	}

	pub fn with_classifier_config(mut self, classifier: ClassifierConfig) -> Self {
		self.config.classifier = classifier;
		self
	}

	/// Replaces the reqwest transport, e.g. with an in-memory stub.
	pub fn with_transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
		self.transport = Some(transport);
		self
	}

	pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
		self.handlers.push(handler);
		self
	}

	pub fn build(self) -> HandlerResult<RequestHandler> {
		RequestHandler::with_parts(self.config, self.transport, self.handlers)
	}
}

impl Default for RequestHandlerBuilder {
	fn default() -> Self {
		Self::new()
	}
}

/// Main request orchestrator. Share it behind an `Arc` or borrow it across
/// concurrent fetches; every piece of mutable state is synchronised.
pub struct RequestHandler {
	config: HandlerConfig,
	limiter: RateLimiter,
	pacing_gate: tokio::sync::Mutex<()>,
	sessions: SessionStore,
	proxies: Mutex<ProxyRotator>,
	classifier: OutcomeClassifier,
	stats: StatsRecorder,
	transport: Arc<dyn HttpTransport>,
	probe: ProxyProbe,
	events: Arc<EventDispatcher>,
}

impl RequestHandler {
	/// Construct a handler with default configuration.
	pub fn new() -> HandlerResult<Self> {
		RequestHandler::with_config(HandlerConfig::default())
	}

	pub fn with_config(config: HandlerConfig) -> HandlerResult<Self> {
		RequestHandler::with_parts(config, None, Vec::new())
	}

	/// Obtain a builder to customise the handler instance.
	pub fn builder() -> RequestHandlerBuilder {
		RequestHandlerBuilder::new()
	}

	fn with_parts(
		config: HandlerConfig,
		transport: Option<Arc<dyn HttpTransport>>,
		handlers: Vec<Arc<dyn EventHandler>>,
	) -> HandlerResult<Self> {
		config.validate()?;

		let transport: Arc<dyn HttpTransport> = match transport {
			Some(transport) => transport,
			None => Arc::new(ReqwestTransport::new(config.timeouts, &config.default_headers)?),
		};

		let limiter = RateLimiter::new(config.strategy, config.pacing);
		let stats = StatsRecorder::new(limiter.clone());
		let classifier = OutcomeClassifier::new(&config.classifier)?;
		let probe = ProxyProbe::new(config.proxy_probe.target()?, config.proxy_probe.timeout());

		let mut events = EventDispatcher::new();
		events.register_handler(Arc::new(LoggingHandler));
		for handler in handlers {
			events.register_handler(handler);
		}

		log::info!(
			"request handler ready: strategy={}, proxies={}, sessions in {}",
			config.strategy,
			config.proxies.len(),
			config.session_dir.display()
		);

		Ok(Self {
			limiter,
			pacing_gate: tokio::sync::Mutex::new(()),
			sessions: SessionStore::new(config.session_dir.clone()),
			proxies: Mutex::new(ProxyRotator::new(config.proxies.iter().cloned())),
			classifier,
			stats,
			transport,
			probe,
			events: Arc::new(events),
			config,
		})
	}

	pub fn config(&self) -> &HandlerConfig {
		&self.config
	}

	pub fn limiter(&self) -> &RateLimiter {
		&self.limiter
	}

	pub fn sessions(&self) -> &SessionStore {
		&self.sessions
	}

	pub fn stats(&self) -> StatsSnapshot {
		self.stats.snapshot()
	}

	pub fn stats_recorder(&self) -> &StatsRecorder {
		&self.stats
	}

	fn rotator(&self) -> MutexGuard<'_, ProxyRotator> {
		self.proxies.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
	}

	/// Opens (or reuses) a session without sending anything.
	pub async fn session(&self, session_id: &str) -> HandlerResult<Arc<SessionHandle>> {
		Ok(self.sessions.get_session(session_id, None).await?)
	}

	/// Perform a paced GET request.
	pub async fn get(&self, url: &str, session_id: &str) -> HandlerResult<FetchResult> {
		self.fetch(url, session_id, &FetchOptions::default()).await
	}

	/// Perform a paced request. Only caller mistakes return `Err`; timeouts,
	/// connection failures and adversarial responses are outcome values.
	pub async fn fetch(
		&self,
		url: &str,
		session_id: &str,
		options: &FetchOptions,
	) -> HandlerResult<FetchResult> {
		let prepared = PreparedFetch::new(url, session_id, options)?;
		let waited = self.pace().await;
		self.dispatch(prepared, waited).await
	}

	/// Like [`fetch`](Self::fetch), but gives up during the pacing wait when
	/// `cancel` fires. Returns `Ok(None)` if the request was never sent; once
	/// dispatched, the exchange runs to completion.
	pub async fn fetch_cancellable(
		&self,
		url: &str,
		session_id: &str,
		options: &FetchOptions,
		cancel: &CancellationToken,
	) -> HandlerResult<Option<FetchResult>> {
		let prepared = PreparedFetch::new(url, session_id, options)?;
		let Some(waited) = self.pace_cancellable(cancel).await else {
			log::debug!("cancelled before dispatching {}", prepared.url);
			return Ok(None);
		};
		self.dispatch(prepared, waited).await.map(Some)
	}

	fn announce_delay(&self) -> Duration {
		let delay = self.limiter.next_delay();
		log::info!("rate limiting: waiting {:.1} seconds", delay.as_secs_f64());
		delay
	}

	/// Sits out the pacing delay. Waits are serialised so concurrent callers
	/// are spaced by the policy delay rather than sleeping side by side.
	async fn pace(&self) -> Duration {
		let _turn = self.pacing_gate.lock().await;
		let delay = self.announce_delay();
		sleep(delay).await;
		delay
	}

	pub(crate) async fn pace_cancellable(&self, cancel: &CancellationToken) -> Option<Duration> {
		if cancel.is_cancelled() {
			return None;
		}
		let _turn = tokio::select! {
			biased;
			_ = cancel.cancelled() => return None,
			turn = self.pacing_gate.lock() => turn,
		};
		let delay = self.announce_delay();
		tokio::select! {
			biased;
			_ = cancel.cancelled() => None,
			_ = sleep(delay) => Some(delay),
		}
	}

	pub(crate) async fn dispatch(&self, prepared: PreparedFetch, waited: Duration) -> HandlerResult<FetchResult> {
		let session = self
			.sessions
			.get_session(&prepared.session_id, Some(&prepared.overrides))
			.await?;

		let proxy = if prepared.use_proxy {
			self.rotator().current_proxy()
		} else {
			None
		};

		let request = self.build_request(&prepared, &session)?;

		self.events.dispatch(HandlerEvent::PreRequest(PreRequestEvent {
			url: prepared.url.clone(),
			method: prepared.method.clone(),
			session_id: prepared.session_id.clone(),
			proxy: proxy.as_ref().map(ToString::to_string),
			waited,
			timestamp: Utc::now(),
		}));

		let started = Instant::now();
		let sent = self.transport.send(request, proxy.as_ref()).await;
		let elapsed = started.elapsed();

		let (outcome, response) = match sent {
			Ok(response) => {
				session.absorb_set_cookies(&response.url, &response.set_cookie_headers());
				let text = response.text();
				let kind = self.classifier.classify(response.status, &text);
				let outcome = RequestOutcome::new(kind, elapsed)
					.with_status(response.status)
					.with_body_snippet(&text);
				if kind == OutcomeKind::CaptchaRequired {
					self.events.dispatch(HandlerEvent::CaptchaPause(CaptchaPauseEvent {
						url: prepared.url.clone(),
						indicator: self.classifier.matched_indicator(&text).map(str::to_string),
						pause: Duration::from_secs_f64(self.config.pacing.captcha_pause),
						timestamp: Utc::now(),
					}));
				}
				(outcome, Some(response))
			}
			Err(err) => {
				let kind = if err.is_timeout() {
					OutcomeKind::Timeout
				} else {
					OutcomeKind::NetworkError
				};
				self.events.dispatch(HandlerEvent::Error(ErrorEvent {
					url: prepared.url.clone(),
					error: err.to_string(),
					timestamp: Utc::now(),
				}));
				(RequestOutcome::new(kind, elapsed).with_error_message(err.to_string()), None)
			}
		};

		self.limiter.update(outcome.kind, elapsed);
		self.stats.record(&outcome);

		if let Some(endpoint) = proxy.as_ref() {
			self.settle_proxy(endpoint, outcome.kind);
		}

		if outcome.kind.is_success()
			&& let Err(err) = self.sessions.save_session(&prepared.session_id).await
		{
			log::error!("failed to save session {}: {err}", prepared.session_id);
			self.events.dispatch(HandlerEvent::Error(ErrorEvent {
				url: prepared.url.clone(),
				error: err.to_string(),
				timestamp: Utc::now(),
			}));
		}

		self.events.dispatch(HandlerEvent::PostResponse(PostResponseEvent {
			url: prepared.url,
			method: prepared.method,
			status: outcome.http_status,
			outcome: outcome.kind,
			latency: elapsed,
			next_delay: self.limiter.current_delay(),
			timestamp: Utc::now(),
		}));

		Ok(FetchResult { outcome, response })
	}

	fn build_request(&self, prepared: &PreparedFetch, session: &SessionHandle) -> HandlerResult<OutboundRequest> {
		let mut headers = to_header_map(session.headers())?;
		for (name, value) in prepared.headers.iter() {
			headers.insert(name.clone(), value.clone());
		}
		if !headers.contains_key(COOKIE)
			&& let Some(cookie) = session.cookie_header(&prepared.url)
		{
			match HeaderValue::from_str(&cookie) {
				Ok(value) => {
					headers.insert(COOKIE, value);
				}
				Err(_) => log::warn!(
					"sending {} without cookies: session {} holds an unsendable cookie",
					prepared.url,
					session.id()
				),
			}
		}

		Ok(OutboundRequest::new(prepared.method.clone(), prepared.url.clone())
			.with_headers(headers)
			.with_body(prepared.body.clone()))
	}

	fn settle_proxy(&self, endpoint: &ProxyEndpoint, kind: OutcomeKind) {
		let mut rotator = self.rotator();
		match kind {
			OutcomeKind::Success => rotator.report_success(endpoint),
			kind if kind.is_pushback() => {
				rotator.report_failure(endpoint);
				rotator.rotate();
				let next = rotator.current_proxy().map(|p| p.to_string());
				drop(rotator);
				self.events.dispatch(HandlerEvent::ProxyRotated(ProxyRotatedEvent {
					from: endpoint.to_string(),
					to: next,
					reason: kind,
					timestamp: Utc::now(),
				}));
			}
			_ => rotator.report_failure(endpoint),
		}
	}

	/// Probes `endpoint` against the configured known-good target.
	pub async fn test_proxy(&self, endpoint: &ProxyEndpoint) -> bool {
		self.probe.test_proxy(self.transport.as_ref(), endpoint).await
	}

	/// Adds an endpoint to the rotation, optionally probing it first. Returns
	/// whether it was admitted.
	pub async fn add_proxy(&self, endpoint: ProxyEndpoint, verify: bool) -> bool {
		if verify && !self.test_proxy(&endpoint).await {
			log::warn!("not adding proxy {endpoint}: probe failed");
			return false;
		}
		let added = self.rotator().add_proxy(endpoint.clone());
		if added {
			log::info!("added proxy {endpoint}");
		}
		added
	}

	pub fn mark_proxy_failed(&self, endpoint: &ProxyEndpoint) {
		self.rotator().mark_failed(endpoint);
	}

	pub fn restore_proxy(&self, endpoint: &ProxyEndpoint) -> bool {
		self.rotator().restore(endpoint)
	}

	pub fn current_proxy(&self) -> Option<ProxyEndpoint> {
		self.rotator().current_proxy()
	}

	pub fn proxy_health(&self) -> ProxyHealthReport {
		self.rotator().health_report()
	}

	/// Writes the stats file, to `path` or the configured location.
	pub async fn save_stats(&self, path: Option<&Path>) -> HandlerResult<StatsSnapshot> {
		let path = path.unwrap_or(&self.config.stats_path);
		Ok(self.stats.persist(path).await?)
	}

	/// Closes and saves every session, then writes the stats file.
	pub async fn cleanup(&self) -> HandlerResult<StatsSnapshot> {
		let closed = self.sessions.close_all().await;
		let snapshot = self.save_stats(None).await?;
		closed?;
		log::info!("request handler cleanup completed");
		Ok(snapshot)
	}
}
