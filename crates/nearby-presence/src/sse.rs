//! HTTP transport: server-sent events down, JSON posts up.
//!
//! Talks to the hub served by `nearby serve`:
//! `GET /topics/{topic}/events?client_id=..` streams enveloped presence
//! events; `POST /topics/{topic}/track` and `/untrack` publish.

use std::time::Duration;

use eventsource_stream::Eventsource;
use futures_util::future::BoxFuture;
use futures_util::{FutureExt, StreamExt};
use nearby_core::{TrackRequest, UntrackRequest, decode_event};
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::transport::{Channel, ChannelEvent, Outbound, Transport};

/// SSE event name carrying presence envelopes.
pub const PRESENCE_EVENT: &str = "presence";

/// How long a subscribe may wait for the hub's response headers, and how
/// long a single publish may take.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct SseTransport {
    base_url: String,
    http: reqwest::Client,
    request_timeout: Duration,
}

impl SseTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("falling back to default HTTP client: {e}");
                reqwest::Client::new()
            });
        Self::with_client(base_url, http)
    }

    pub fn with_client(base_url: impl Into<String>, http: reqwest::Client) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            base_url,
            http,
            request_timeout: REQUEST_TIMEOUT,
        }
    }

    /// Bound the wait for subscribe headers and for each publish. The event
    /// stream itself stays open indefinitely.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn topic_url(&self, topic: &str, action: &str) -> String {
        format!("{}/topics/{topic}/{action}", self.base_url)
    }
}

impl Transport for SseTransport {
    fn subscribe<'a>(
        &'a self,
        topic: &'a str,
        client_id: &'a str,
    ) -> BoxFuture<'a, Result<Channel, TransportError>> {
        async move {
            let request = self
                .http
                .get(self.topic_url(topic, "events"))
                .query(&[("client_id", client_id)])
                .header(reqwest::header::ACCEPT, "text/event-stream")
                .send();
            let response = tokio::time::timeout(self.request_timeout, request)
                .await
                .map_err(|_| {
                    TransportError::Connect(format!(
                        "no response from hub within {:?}",
                        self.request_timeout
                    ))
                })?
                .and_then(reqwest::Response::error_for_status)
                .map_err(|e| TransportError::Connect(e.to_string()))?;

            let (events_tx, events) = mpsc::unbounded_channel();
            let mut stream = response.bytes_stream().eventsource();
            let reader = tokio::spawn(async move {
                let reason = loop {
                    match stream.next().await {
                        Some(Ok(event)) if event.event == PRESENCE_EVENT => {
                            match decode_event(&event.data) {
                                Ok(event) => {
                                    if events_tx.send(ChannelEvent::Presence(event)).is_err() {
                                        return;
                                    }
                                }
                                Err(e) => {
                                    tracing::warn!("skipping malformed presence message: {e}")
                                }
                            }
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => break e.to_string(),
                        None => break "event stream ended".to_string(),
                    }
                };
                let _ = events_tx.send(ChannelEvent::Closed { reason });
            });

            let (outbound, mut outbound_rx) = mpsc::unbounded_channel();
            let http = self.http.clone();
            let track_url = self.topic_url(topic, "track");
            let untrack_url = self.topic_url(topic, "untrack");
            let client_id = client_id.to_string();
            let timeout = self.request_timeout;
            tokio::spawn(async move {
                while let Some(msg) = outbound_rx.recv().await {
                    let sent = match msg {
                        Outbound::Track(record) => {
                            let body = TrackRequest {
                                client_id: client_id.clone(),
                                record,
                            };
                            http.post(&track_url).timeout(timeout).json(&body).send().await
                        }
                        Outbound::Untrack => {
                            let body = UntrackRequest {
                                client_id: client_id.clone(),
                            };
                            http.post(&untrack_url).timeout(timeout).json(&body).send().await
                        }
                    };
                    match sent.and_then(reqwest::Response::error_for_status) {
                        Ok(_) => {}
                        Err(e) => tracing::warn!("presence publish failed: {e}"),
                    }
                }
                // hanging up the event stream is how the hub learns we left
                reader.abort();
            });

            Ok(Channel { events, outbound })
        }
        .boxed()
    }
}
