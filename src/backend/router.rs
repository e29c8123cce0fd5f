use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use eventsource_stream::Eventsource;
use futures::Stream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use super::dialect::AuthScheme;
use super::BackendTarget;
use crate::error::{ApiErrorKind, ProxyError, Result};
use crate::logging::{JournalEvent, SharedJournal};
use crate::translate::anthropic_types::{MessagesRequest, MessagesResponse, StreamEvent};
use crate::translate::request::{self, BackendPayload};
use crate::translate::response::{self, BackendResponse};
use crate::translate::streaming::{AnthropicRelay, StreamDecoder, StreamTranslator};
use crate::translate::tokens;

/// Anthropic events for one backend call, ending with `message_stop`.
pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Sends Anthropic requests to the configured backend. Cheap to clone.
#[derive(Clone)]
pub struct BackendRouter {
    target: Arc<BackendTarget>,
    client: reqwest::Client,
    journal: SharedJournal,
}

struct Failure {
    error: ProxyError,
    status: u16,
    retry_after: Option<Duration>,
}

impl From<ProxyError> for Failure {
    fn from(error: ProxyError) -> Self {
        Self {
            error,
            status: 0,
            retry_after: None,
        }
    }
}

impl BackendRouter {
    pub fn new(target: BackendTarget, client: reqwest::Client, journal: SharedJournal) -> Self {
        Self {
            target: Arc::new(target),
            client,
            journal,
        }
    }

    pub fn target(&self) -> &BackendTarget {
        &self.target
    }

    /// One complete (non-streaming) backend round-trip.
    pub async fn send_sync(&self, req: &MessagesRequest, request_id: &str) -> Result<MessagesResponse> {
        let (url, payload) = self.prepare(req, false)?;
        let input_estimate = estimate_request(req);

        let response = self.post_with_retry(&url, &payload, request_id).await?;
        let deadline = self.target.request_timeout;
        let body = tokio::time::timeout(deadline, response.text())
            .await
            .map_err(|_| ProxyError::timeout("reading backend response", deadline))??;

        debug!(body_len = body.len(), "Backend response received");

        let parsed = BackendResponse::parse(self.target.dialect, &body)?;
        let message = response::translate(parsed, &req.model, input_estimate);

        info!(
            backend = %self.target.kind,
            input_tokens = message.usage.input_tokens,
            output_tokens = message.usage.output_tokens,
            stop_reason = ?message.stop_reason,
            "Completed"
        );

        Ok(message)
    }

    /// One streaming backend call. Connection and status errors are returned
    /// here; failures after the first byte arrive as events in the stream.
    pub async fn send_stream(&self, req: &MessagesRequest, request_id: &str) -> Result<EventStream> {
        let (url, payload) = self.prepare(req, true)?;
        let input_estimate = estimate_request(req);

        let response = self.post_with_retry(&url, &payload, request_id).await?;

        let decoder: Box<dyn StreamDecoder> = if self.target.dialect.is_native() {
            Box::new(AnthropicRelay::new(&req.model, input_estimate))
        } else {
            Box::new(StreamTranslator::new(&req.model, input_estimate))
        };

        Ok(Box::pin(decode_stream(
            response,
            decoder,
            self.target.stream_idle_timeout,
            self.journal.clone(),
            request_id.to_string(),
        )))
    }

    fn prepare(&self, req: &MessagesRequest, stream: bool) -> Result<(String, BackendPayload)> {
        let dialect = self.target.dialect;
        let target_model = self.target.models.resolve(&req.model);
        let mut payload = request::translate(req, dialect, &target_model, stream)?;

        if let BackendPayload::Anthropic(native) = &mut payload {
            native
                .extra
                .retain(|key, _| !self.target.drop_params.contains(key));
        }

        let url = dialect.endpoint_url(&self.target.base_url, &target_model);
        Ok((url, payload))
    }

    async fn post_with_retry(
        &self,
        url: &str,
        payload: &BackendPayload,
        request_id: &str,
    ) -> Result<reqwest::Response> {
        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            info!(
                backend = %self.target.kind,
                model = payload.model(),
                attempt,
                "POST {}",
                url
            );

            match self.post_once(url, payload).await {
                Ok(response) => {
                    self.record_call(request_id, payload, response.status().as_u16(), started, attempt);
                    return Ok(response);
                }
                Err(failure) if failure.error.is_retryable() && attempt <= self.target.max_retries => {
                    let delay = retry_delay(self.target.initial_backoff, attempt, failure.retry_after);
                    warn!(
                        error = %failure.error,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying backend call"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(failure) => {
                    warn!(error = %failure.error, "Backend call failed");
                    self.record_call(request_id, payload, failure.status, started, attempt);
                    return Err(failure.error);
                }
            }
        }
    }

    async fn post_once(&self, url: &str, payload: &BackendPayload) -> std::result::Result<reqwest::Response, Failure> {
        let dialect = self.target.dialect;
        let mut builder = self.client.post(url).json(payload);

        builder = match dialect.auth {
            AuthScheme::Bearer => builder.bearer_auth(self.target.credential()),
            AuthScheme::XApiKey => builder.header("x-api-key", self.target.credential()),
        };
        for (name, value) in dialect.extra_headers {
            builder = builder.header(*name, *value);
        }

        // Bounds time-to-headers only; stream bodies are bounded by the idle timeout
        let deadline = self.target.request_timeout;
        let response = tokio::time::timeout(deadline, builder.send())
            .await
            .map_err(|_| ProxyError::timeout("backend request", deadline))?
            .map_err(ProxyError::from)?;

        let status = response.status().as_u16();
        if status < 400 {
            return Ok(response);
        }

        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        let body = response.text().await.unwrap_or_default();

        Err(Failure {
            error: dialect.parse_error(status, &body),
            status,
            retry_after,
        })
    }

    fn record_call(&self, request_id: &str, payload: &BackendPayload, status: u16, started: Instant, attempts: u32) {
        self.journal.record(JournalEvent::BackendCall {
            request_id: request_id.to_string(),
            backend: self.target.kind.to_string(),
            model: payload.model().to_string(),
            status,
            duration_ms: started.elapsed().as_millis() as u64,
            attempts,
        });
    }
}

fn estimate_request(req: &MessagesRequest) -> u64 {
    tokens::estimate_input(req.system.as_ref(), &req.messages, req.tools.as_deref())
}

/// Exponential backoff from `initial`, capped; a short enough
/// `Retry-After` wins.
fn retry_delay(initial: Duration, attempt: u32, retry_after: Option<Duration>) -> Duration {
    if let Some(after) = retry_after.filter(|d| *d < MAX_BACKOFF) {
        return after;
    }
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    initial.saturating_mul(factor).min(MAX_BACKOFF)
}

fn parse_retry_after(value: &str) -> Option<Duration> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

/// Drive a decoder over the backend's SSE body.
fn decode_stream(
    response: reqwest::Response,
    mut decoder: Box<dyn StreamDecoder>,
    idle_timeout: Duration,
    journal: SharedJournal,
    request_id: String,
) -> impl Stream<Item = StreamEvent> + Send + 'static {
    async_stream::stream! {
        let events = response.bytes_stream().eventsource().timeout(idle_timeout);
        tokio::pin!(events);

        while let Some(item) = events.next().await {
            let out = match item {
                Ok(Ok(event)) => decoder.decode(&event.event, &event.data),
                Ok(Err(e)) => {
                    warn!(error = %e, "Backend stream failed");
                    decoder.abort(ApiErrorKind::Api, &format!("backend stream failed: {e}"))
                }
                Err(_) => {
                    let err = ProxyError::timeout("backend stream", idle_timeout);
                    warn!(error = %err, "Backend stream stalled");
                    decoder.abort(ApiErrorKind::Api, &err.to_string())
                }
            };

            for event in out {
                if let StreamEvent::Error { ref error } = event {
                    journal.record(JournalEvent::StreamAborted {
                        request_id: request_id.clone(),
                        reason: error.message.clone(),
                    });
                }
                yield event;
            }

            if decoder.is_done() {
                break;
            }
        }

        for event in decoder.finish() {
            if let StreamEvent::Error { ref error } = event {
                journal.record(JournalEvent::StreamAborted {
                    request_id: request_id.clone(),
                    reason: error.message.clone(),
                });
            }
            yield event;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let initial = Duration::from_millis(500);
        assert_eq!(retry_delay(initial, 1, None), Duration::from_millis(500));
        assert_eq!(retry_delay(initial, 3, None), Duration::from_millis(2000));
        assert_eq!(retry_delay(initial, 20, None), MAX_BACKOFF);
    }

    #[test]
    fn test_short_retry_after_wins() {
        let initial = Duration::from_millis(500);
        assert_eq!(
            retry_delay(initial, 1, parse_retry_after("2")),
            Duration::from_secs(2)
        );
        // Too long to wait for; fall back to our own schedule
        assert_eq!(
            retry_delay(initial, 1, parse_retry_after("120")),
            Duration::from_millis(500)
        );
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }
}
