//! HTTP face of the presence hub.
//!
//! Events go down as SSE (`event: presence`, data is the wire envelope);
//! publishes come up as JSON posts. Membership itself lives in [`LocalHub`].

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream::Stream;
use nearby_core::{PresenceRecord, TrackRequest, UntrackRequest, encode_event};
use nearby_presence::{ChannelEvent, LocalHub, PRESENCE_EVENT};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct HubState {
    hub: LocalHub,
    shutdown: CancellationToken,
}

impl HubState {
    pub fn new(hub: LocalHub, shutdown: CancellationToken) -> Self {
        Self { hub, shutdown }
    }
}

pub fn router(state: HubState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/topics/{topic}/events", get(events))
        .route("/topics/{topic}/track", post(track))
        .route("/topics/{topic}/untrack", post(untrack))
        .route("/topics/{topic}/roster", get(roster))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` fires. Open event streams end first so the
/// graceful drain does not hang on them.
pub async fn serve(
    listener: TcpListener,
    hub: LocalHub,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let app = router(HubState::new(hub, shutdown.clone()));
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
struct EventsParams {
    client_id: Option<String>,
}

/// Detaches the member when the response stream is dropped, which is
/// how a client hang-up reaches the hub.
struct Membership {
    hub: LocalHub,
    topic: String,
    client_id: String,
    conn_id: u64,
}

impl Drop for Membership {
    fn drop(&mut self) {
        self.hub.detach(&self.topic, &self.client_id, self.conn_id);
    }
}

async fn events(
    State(state): State<HubState>,
    Path(topic): Path<String>,
    Query(params): Query<EventsParams>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, (StatusCode, String)> {
    let client_id = params
        .client_id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let (conn_id, mut rx) = state
        .hub
        .attach(&topic, &client_id)
        .map_err(|e| (StatusCode::SERVICE_UNAVAILABLE, e.to_string()))?;
    tracing::info!(topic = %topic, client_id = %client_id, "client subscribed");

    let membership = Membership {
        hub: state.hub.clone(),
        topic,
        client_id,
        conn_id,
    };
    let shutdown = state.shutdown.clone();

    let stream = async_stream::stream! {
        let _membership = membership;
        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = rx.recv() => next,
            };
            match next {
                Some(ChannelEvent::Presence(event)) => match encode_event(&event) {
                    Ok(data) => {
                        let event = Event::default().event(PRESENCE_EVENT).data(data);
                        yield Ok::<_, Infallible>(event);
                    }
                    Err(e) => tracing::warn!("failed to encode presence event: {e}"),
                },
                Some(ChannelEvent::Closed { reason }) => {
                    tracing::debug!("closing event stream: {reason}");
                    break;
                }
                None => break,
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    ))
}

fn check_record(record: &PresenceRecord) -> Result<(), (StatusCode, String)> {
    if record.user_id.is_empty() {
        return Err((StatusCode::UNPROCESSABLE_ENTITY, "user_id must not be empty".into()));
    }
    if let Some(position) = record.display_position {
        position
            .validate()
            .map_err(|e| (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()))?;
    }
    Ok(())
}

async fn track(
    State(state): State<HubState>,
    Path(topic): Path<String>,
    Json(req): Json<TrackRequest>,
) -> Result<StatusCode, (StatusCode, String)> {
    check_record(&req.record)?;
    if state.hub.track(&topic, &req.client_id, req.record) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err((StatusCode::NOT_FOUND, format!("client {} is not subscribed", req.client_id)))
    }
}

async fn untrack(
    State(state): State<HubState>,
    Path(topic): Path<String>,
    Json(req): Json<UntrackRequest>,
) -> Result<StatusCode, (StatusCode, String)> {
    if state.hub.untrack(&topic, &req.client_id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err((StatusCode::NOT_FOUND, format!("client {} is not subscribed", req.client_id)))
    }
}

async fn roster(
    State(state): State<HubState>,
    Path(topic): Path<String>,
) -> Json<Vec<PresenceRecord>> {
    Json(state.hub.roster(&topic))
}
