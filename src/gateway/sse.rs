//! Server-sent event framing for relay events.

use axum::response::sse::{Event, Sse};
use futures_util::{Stream, StreamExt};
use std::convert::Infallible;

use crate::relay::RelayEvent;

/// Frame one relay event. Newlines inside chunks become `newline_token` so a
/// chunk always fits on a single `data:` line.
pub fn to_sse_event(event: RelayEvent, newline_token: &str) -> Event {
    match event {
        RelayEvent::Chunk(chunk) => Event::default().data(chunk.replace('\n', newline_token)),
        RelayEvent::End => Event::default().event("end").data(""),
        RelayEvent::Error(message) => Event::default().event("error").data(message.replace('\n', " ")),
        RelayEvent::KeepAlive => Event::default().comment("keep-alive"),
    }
}

pub fn event_stream<S>(events: S, newline_token: String) -> Sse<impl Stream<Item = Result<Event, Infallible>>>
where
    S: Stream<Item = RelayEvent> + Send + 'static,
{
    Sse::new(events.map(move |event| Ok(to_sse_event(event, &newline_token))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::IntoResponse;

    async fn render(events: Vec<RelayEvent>) -> String {
        let response = event_stream(futures_util::stream::iter(events), "<br>".into()).into_response();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(body.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn chunks_end_and_keep_alive_are_framed() {
        let text = render(vec![
            RelayEvent::Chunk("line one\nline two".into()),
            RelayEvent::KeepAlive,
            RelayEvent::End,
        ])
        .await;

        assert!(text.contains("data: line one<br>line two\n\n"));
        assert!(text.contains("keep-alive\n\n"));
        assert!(text.contains("event: end\n"));
    }

    #[tokio::test]
    async fn errors_use_error_event() {
        let text = render(vec![RelayEvent::Error("boom\nagain".into())]).await;
        assert!(text.contains("event: error\ndata: boom again\n\n"));
    }
}
