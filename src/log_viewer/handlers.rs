//! HTTP request handlers for the log viewer.
//!
//! - `/logs/{channel}` returns the retained history as JSON
//! - `/logs/{channel}/stream` replays the history as Server-Sent Events and
//!   then follows new entries live

use crate::log_viewer::actix_error::ApiError;
use crate::logs::{LogAggregator, LogChannel, LogEntry, SubscriptionId};

use actix_web::{
    HttpResponse,
    web::{Bytes, Data, Path},
};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Live entries queued per stream before a slow client is cut off
pub const STREAM_QUEUE: usize = 256;

fn lookup<'a>(logs: &'a LogAggregator, name: &str) -> Result<&'a LogChannel, ApiError> {
    logs.channel(name)
        .ok_or_else(|| ApiError::UnknownChannel(name.to_string()))
}

/// Format one entry as an SSE `log` event
pub fn sse_frame(entry: &LogEntry) -> Result<Bytes, actix_web::Error> {
    let data = serde_json::to_string(entry).map_err(actix_web::error::ErrorInternalServerError)?;
    Ok(Bytes::from(format!("event: log\ndata: {}\n\n", data)))
}

/// Retained history of one channel, oldest first
pub async fn history(
    logs: Data<Arc<LogAggregator>>,
    channel: Path<String>,
) -> Result<HttpResponse, ApiError> {
    let channel = lookup(&logs, &channel)?;
    let entries = channel.history();
    tracing::debug!(channel = channel.name(), count = entries.len(), "Serving log history");
    Ok(HttpResponse::Ok().json(entries))
}

/// Observer that queues entries for one stream.
///
/// Once the queue is full the sender is dropped, so the stream drains what
/// it already has and ends. The client reconnects and gets the history
/// again instead of the channel buffering without limit.
fn forwarder(
    name: &'static str,
    capacity: usize,
) -> (impl Fn(&LogEntry) + Send + Sync + 'static, mpsc::Receiver<LogEntry>) {
    let (tx, rx) = mpsc::channel(capacity);
    let tx = Mutex::new(Some(tx));
    let observer = move |entry: &LogEntry| {
        let mut slot = tx.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(sender) = slot.as_ref() else {
            return;
        };
        match sender.try_send(entry.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::warn!(channel = name, capacity, "Log stream client is too slow, closing");
                *slot = None;
            }
            Err(TrySendError::Closed(_)) => *slot = None,
        }
    };
    (observer, rx)
}

/// Removes the observer when the client goes away
struct Subscription {
    logs: Arc<LogAggregator>,
    channel: &'static str,
    id: SubscriptionId,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(channel) = self.logs.channel(self.channel) {
            channel.unsubscribe(self.id);
        }
        tracing::debug!(channel = self.channel, "Log stream closed");
    }
}

/// History followed by live entries, as Server-Sent Events
pub async fn stream(
    logs: Data<Arc<LogAggregator>>,
    channel: Path<String>,
) -> Result<HttpResponse, ApiError> {
    let logs: Arc<LogAggregator> = Arc::clone(&logs);
    let channel = lookup(&logs, &channel)?;
    let name = channel.name();

    let (observer, mut rx) = forwarder(name, STREAM_QUEUE);
    let (backlog, id) = channel.subscribe_with_history(observer);
    tracing::info!(channel = name, backlog = backlog.len(), "Log stream opened");

    let subscription = Subscription {
        logs: Arc::clone(&logs),
        channel: name,
        id,
    };

    let events = async_stream::stream! {
        let _subscription = subscription;
        for entry in &backlog {
            yield sse_frame(entry);
        }
        while let Some(entry) = rx.recv().await {
            yield sse_frame(&entry);
        }
    };

    Ok(HttpResponse::Ok()
        .append_header(("Content-Type", "text/event-stream"))
        .append_header(("Cache-Control", "no-cache"))
        .streaming(events))
}
