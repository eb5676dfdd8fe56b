//! Bounded, order-preserving batch execution.
//!
//! Every URL gets an entry in the result, in input order. One URL failing
//! never fails the batch; cancelling the batch stops new dispatches while
//! letting in-flight exchanges finish.

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::handler::{FetchOptions, FetchResult, HandlerError, HandlerResult, PreparedFetch, RequestHandler};

/// Result slot for one batch URL.
#[derive(Debug, Clone)]
pub struct BatchEntry {
	pub url: String,
	/// `None` when the URL was never dispatched: the batch was cancelled first,
	/// or the request could not be assembled (logged).
	pub result: Option<FetchResult>,
}

impl BatchEntry {
	pub fn was_dispatched(&self) -> bool {
		self.result.is_some()
	}
}

/// Runs a list of URLs through a [`RequestHandler`] with at most
/// `max_concurrent` requests in flight.
pub struct BatchCoordinator<'a> {
	handler: &'a RequestHandler,
	max_concurrent: usize,
	options: FetchOptions,
	cancel: CancellationToken,
}

impl<'a> BatchCoordinator<'a> {
	pub fn new(handler: &'a RequestHandler) -> Self {
		Self {
			handler,
			max_concurrent: handler.config().batch.max_concurrent,
			options: FetchOptions::default(),
			cancel: CancellationToken::new(),
		}
	}

	pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
		self.max_concurrent = max_concurrent;
		self
	}

	pub fn with_options(mut self, options: FetchOptions) -> Self {
		self.options = options;
		self
	}

	pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
		self.cancel = cancel;
		self
	}

	/// Token that cancels this batch when fired.
	pub fn cancellation_token(&self) -> CancellationToken {
		self.cancel.clone()
	}

	/// Validates every input up front, then runs the batch. Only invalid input
	/// returns `Err`, and it does so before anything is sent.
	pub async fn run<S>(&self, urls: &[S], session_id: &str) -> HandlerResult<Vec<BatchEntry>>
	where
		S: AsRef<str>,
	{
		if self.max_concurrent == 0 {
			return Err(HandlerError::InvalidConcurrency);
		}
		let prepared = urls
			.iter()
			.map(|url| PreparedFetch::new(url.as_ref(), session_id, &self.options))
			.collect::<HandlerResult<Vec<_>>>()?;

		log::info!(
			"starting batch of {} requests (session {session_id}, max {} concurrent)",
			prepared.len(),
			self.max_concurrent
		);

		let entries: Vec<BatchEntry> = stream::iter(urls.iter().zip(prepared))
			.map(|(url, prepared)| async move {
				BatchEntry {
					url: url.as_ref().to_string(),
					result: self.dispatch_one(prepared).await,
				}
			})
			.buffered(self.max_concurrent)
			.collect()
			.await;

		let skipped = entries.iter().filter(|entry| !entry.was_dispatched()).count();
		if skipped > 0 {
			log::warn!("batch cancelled: {skipped} of {} requests not dispatched", entries.len());
		}
		Ok(entries)
	}

	async fn dispatch_one(&self, prepared: PreparedFetch) -> Option<FetchResult> {
		let waited = self.handler.pace_cancellable(&self.cancel).await?;
		let url = prepared.url.clone();
		match self.handler.dispatch(prepared, waited).await {
			Ok(result) => Some(result),
			Err(err) => {
				log::error!("batch request to {url} could not be sent: {err}");
				None
			}
		}
	}
}

impl RequestHandler {
	/// Fetches `urls` with bounded concurrency, returning one entry per URL
	/// in input order.
	pub async fn run_batch<S>(
		&self,
		urls: &[S],
		session_id: &str,
		max_concurrent: usize,
		options: &FetchOptions,
		cancel: Option<&CancellationToken>,
	) -> HandlerResult<Vec<BatchEntry>>
	where
		S: AsRef<str>,
	{
		let mut coordinator = BatchCoordinator::new(self)
			.with_max_concurrent(max_concurrent)
			.with_options(options.clone());
		if let Some(cancel) = cancel {
			coordinator = coordinator.with_cancellation(cancel.clone());
		}
		coordinator.run(urls, session_id).await
	}
}
