use std::convert::Infallible;
use std::pin::Pin;
use std::time::Duration;

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::{stream, Stream, StreamExt};

use crate::engine::EngineHandle;

use super::routes::HttpServerError;

pub type EventStream = Sse<Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>>>;

fn with_keepalive(
    stream: impl Stream<Item = Result<Event, Infallible>> + Send + 'static,
    heartbeat: Duration,
) -> EventStream {
    Sse::new(Box::pin(stream) as Pin<Box<_>>)
        .keep_alive(KeepAlive::new().interval(heartbeat).text("heartbeat"))
}

fn heartbeat_of(handle: &EngineHandle) -> Duration {
    Duration::from_secs(handle.config().streaming.heartbeat_secs)
}

/// Server-Sent Events stream of capture log lines.
///
/// Emits `log` events; a subscriber that lags past its buffer receives one
/// terminal `slow-consumer` event and the stream ends.
pub fn logs(handle: &EngineHandle, session_id: u64) -> Result<EventStream, HttpServerError> {
    let lines = handle
        .stream_logs(session_id)
        .ok_or(HttpServerError::NotFound("no active session"))?;

    let stream = lines.map(|item| match item {
        Ok(line) => Ok(Event::default().event("log").data(line)),
        Err(err) => Ok(Event::default()
            .event("slow-consumer")
            .data(err.to_string())),
    });

    Ok(with_keepalive(stream, heartbeat_of(handle)))
}

/// Server-Sent Events stream of packet summary lines.
pub fn packets(handle: &EngineHandle, session_id: u64) -> Result<EventStream, HttpServerError> {
    let lines = handle
        .stream_packets(session_id)
        .ok_or(HttpServerError::NotFound("no active session"))?;

    let stream = lines.map(|item| match item {
        Ok(line) => Ok(Event::default().event("packet").data(line)),
        Err(err) => Ok(Event::default()
            .event("slow-consumer")
            .data(err.to_string())),
    });

    Ok(with_keepalive(stream, heartbeat_of(handle)))
}

/// Server-Sent Events stream of device samples.
///
/// Each sample expands into a `cellular-data` and/or `gps-data` event for
/// whichever halves are present, with the sample timestamp as the event id.
pub fn samples(handle: &EngineHandle, session_id: u64) -> Result<EventStream, HttpServerError> {
    let samples = handle
        .stream_samples(session_id)
        .ok_or(HttpServerError::NotFound("no active session"))?;

    let stream = samples.flat_map(|sample| {
        let id = sample.timestamp.to_string();
        let mut events = Vec::new();
        if let Some(cellular) = &sample.cellular {
            if let Ok(payload) = serde_json::to_string(cellular) {
                events.push(Ok(Event::default()
                    .event("cellular-data")
                    .id(id.clone())
                    .data(payload)));
            }
        }
        if let Some(gps) = &sample.gps {
            if let Ok(payload) = serde_json::to_string(gps) {
                events.push(Ok(Event::default()
                    .event("gps-data")
                    .id(id.clone())
                    .data(payload)));
            }
        }
        stream::iter(events)
    });

    Ok(with_keepalive(stream, heartbeat_of(handle)))
}

/// Server-Sent Events stream of cluster updates.
///
/// Conflating: a slow subscriber resumes to the latest update only. The
/// update id doubles as the SSE event id so clients can drop stale frames.
pub fn cluster_updates(
    handle: &EngineHandle,
    session_id: u64,
    num_clusters: Option<usize>,
    interval: Option<Duration>,
) -> Result<EventStream, HttpServerError> {
    let updates = handle
        .stream_cluster_updates(session_id, num_clusters, interval)
        .ok_or(HttpServerError::NotFound("no active session"))?;

    let stream = updates.filter_map(|update| async move {
        match serde_json::to_string(&update) {
            Ok(payload) => Some(Ok(Event::default()
                .event("cluster-update")
                .id(update.update_id.to_string())
                .data(payload))),
            Err(_) => None,
        }
    });

    Ok(with_keepalive(stream, heartbeat_of(handle)))
}
