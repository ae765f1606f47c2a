use std::io::prelude::*;
use std::sync::Arc;
use std::time::Duration;

use flate2::read::GzDecoder;
use rand::Rng;
use reqwest::header::{CONTENT_TYPE, USER_AGENT};
use reqwest::Url;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use crate::config::FetchConfig;
use crate::error::FetchError;
use crate::event::{Event, EventSink, LogSink, Outcome, Stage};
use crate::limiter::RateLimiter;
use crate::resource::{FetchOutcome, RawPayload, ResourceDescriptor, SkipReason};
use crate::store::HintLedger;

/// Retry loop states, bounded by `max_retries`.
#[derive(Debug)]
enum Attempt {
    Attempting(u32),
    Retrying { attempt: u32, error: FetchError },
    Finished(FetchOutcome),
}

/// HTTP retrieval with bounded concurrency, per-host spacing, retries and
/// timeouts.
pub struct Fetcher {
    client: reqwest::Client,
    config: FetchConfig,
    limiter: RateLimiter,
    hints: Option<Arc<HintLedger>>,
    sink: Arc<dyn EventSink>,
    cancel: CancellationToken,
}

impl Fetcher {
    pub fn new(config: FetchConfig) -> reqwest::Result<Self> {
        let client = reqwest::ClientBuilder::new()
            .gzip(true)
            .deflate(true)
            .connect_timeout(config.timeout())
            .build()?;
        let limiter = RateLimiter::new(config.max_concurrency, config.min_interval());

        Ok(Self {
            client,
            config,
            limiter,
            hints: None,
            sink: Arc::new(LogSink),
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_hints(mut self, hints: Arc<HintLedger>) -> Self {
        self.hints = Some(hints);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// Fetches a resource, or skips it when its hint matches the recorded one.
    pub async fn fetch(&self, descriptor: &ResourceDescriptor) -> FetchOutcome {
        if let (Some(hints), Some(hint)) = (&self.hints, &descriptor.last_modified_hint) {
            if hints.is_unchanged(&descriptor.external_id, hint) {
                self.sink.emit(
                    &Event::new(Stage::Fetch, &descriptor.external_id, Outcome::Skipped)
                        .detail(SkipReason::Unchanged),
                );
                return FetchOutcome::Skipped(SkipReason::Unchanged);
            }
        }
        self.fetch_url(&descriptor.external_id, &descriptor.url).await
    }

    /// Fetches `url` without consulting hints.
    pub async fn fetch_url(&self, id: &str, url: &str) -> FetchOutcome {
        let mut state = Attempt::Attempting(1);
        loop {
            state = match state {
                Attempt::Attempting(_) if self.cancel.is_cancelled() => {
                    Attempt::Finished(FetchOutcome::Skipped(SkipReason::Cancelled))
                }
                Attempt::Attempting(attempt) => match self.attempt(url).await {
                    Ok(bytes) => {
                        self.sink.emit(
                            &Event::new(Stage::Fetch, id, Outcome::Success).attempt(attempt),
                        );
                        Attempt::Finished(FetchOutcome::Success(RawPayload::new(bytes, url)))
                    }
                    Err(error) if error.is_retryable() && attempt <= self.config.max_retries => {
                        self.sink.emit(
                            &Event::new(Stage::Fetch, id, Outcome::Retry)
                                .attempt(attempt)
                                .error(error.kind(), &error),
                        );
                        Attempt::Retrying { attempt, error }
                    }
                    Err(error) => {
                        self.sink.emit(
                            &Event::new(Stage::Fetch, id, Outcome::Failed)
                                .attempt(attempt)
                                .error(error.kind(), &error),
                        );
                        Attempt::Finished(FetchOutcome::Failed {
                            error,
                            attempts: attempt,
                        })
                    }
                },
                Attempt::Retrying { attempt, error } => {
                    let delay = self.delay(attempt);
                    log::debug!("Retrying {url} in {delay:?} after: {error}");
                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            Attempt::Finished(FetchOutcome::Skipped(SkipReason::Cancelled))
                        }
                        _ = sleep(delay) => Attempt::Attempting(attempt + 1),
                    }
                }
                Attempt::Finished(outcome) => return outcome,
            };
        }
    }

    fn delay(&self, attempt: u32) -> Duration {
        let delay = self.config.backoff(attempt);
        if !self.config.jitter || delay.is_zero() {
            return delay;
        }
        let millis = delay.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(millis / 2..=millis))
    }

    async fn attempt(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let parsed = Url::parse(url).map_err(|e| FetchError::Url {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        let host = parsed.host_str().unwrap_or_default().to_string();

        let _permit = self
            .limiter
            .acquire(&host)
            .await
            .map_err(|e| FetchError::Connect {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        match timeout(self.config.timeout(), self.download(parsed)).await {
            Ok(res) => res,
            Err(_) => Err(FetchError::Timeout {
                url: url.to_string(),
            }),
        }
    }

    async fn download(&self, url: Url) -> Result<Vec<u8>, FetchError> {
        let url_str = url.to_string();
        let resp = self
            .client
            .get(url)
            .header(USER_AGENT, &self.config.user_agent)
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest(&url_str, e))?;

        let status = resp.status();
        if status.is_server_error() {
            return Err(FetchError::Server {
                url: url_str,
                status,
            });
        }
        if status.is_client_error() {
            return Err(FetchError::Client {
                url: url_str,
                status,
            });
        }
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url_str,
                status,
            });
        }

        let gzipped = matches!(
            resp.headers().get(CONTENT_TYPE),
            Some(c) if c == "application/x-gzip" || c == "application/gzip"
        );
        let body = resp
            .bytes()
            .await
            .map_err(|e| FetchError::from_reqwest(&url_str, e))?;

        if gzipped {
            let mut gz = GzDecoder::new(&body[..]);
            let mut page = Vec::new();
            gz.read_to_end(&mut page).map_err(|e| FetchError::Body {
                url: url_str.clone(),
                reason: e.to_string(),
            })?;
            Ok(page)
        } else {
            Ok(body.to_vec())
        }
    }
}
