use std::convert::Infallible;

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::{Stream, StreamExt};

/// The termination marker OpenAI-compatible clients wait for.
pub const SSE_DONE: &str = "[DONE]";

/// Wraps a stream of pre-serialized payloads as `data:` events.
pub fn sse_response<S>(stream: S) -> Sse<impl Stream<Item = Result<Event, Infallible>>>
where
    S: Stream<Item = String> + Send + 'static,
{
    let events = stream.map(|data| Ok(Event::default().data(data)));
    Sse::new(events).keep_alive(KeepAlive::default())
}

/// Serializes one chunk; `None` only if the value cannot be encoded.
pub fn format_sse_data<T: serde::Serialize>(value: &T) -> Option<String> {
    match serde_json::to_string(value) {
        Ok(data) => Some(data),
        Err(err) => {
            tracing::warn!(error = %err, "dropping unserializable stream chunk");
            None
        }
    }
}
