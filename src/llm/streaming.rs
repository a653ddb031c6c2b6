use super::{ChatResponse, ToolCall};
use anyhow::Result;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::pin::Pin;

pub type ChatStream = Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send + 'static>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    TextDelta { text: String },
    ToolCall(ToolCall),
    Done,
}

pub fn response_to_events(response: ChatResponse) -> Vec<Result<StreamEvent>> {
    let ChatResponse {
        content,
        tool_calls,
    } = response;

    let mut events = Vec::with_capacity(tool_calls.len() + 2);
    if !content.is_empty() {
        events.push(Ok(StreamEvent::TextDelta { text: content }));
    }
    events.extend(tool_calls.into_iter().map(|call| Ok(StreamEvent::ToolCall(call))));
    events.push(Ok(StreamEvent::Done));
    events
}

/// Drain a stream into one response. Stops at `Done` or end of stream.
pub async fn collect_stream(mut stream: ChatStream) -> Result<ChatResponse> {
    let mut response = ChatResponse::default();
    while let Some(event) = stream.next().await {
        match event? {
            StreamEvent::TextDelta { text } => response.content.push_str(&text),
            StreamEvent::ToolCall(call) => response.tool_calls.push(call),
            StreamEvent::Done => break,
        }
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    #[tokio::test]
    async fn collect_joins_deltas_and_stops_at_done() {
        let events: Vec<Result<StreamEvent>> = vec![
            Ok(StreamEvent::TextDelta { text: "Hel".into() }),
            Ok(StreamEvent::TextDelta { text: "lo".into() }),
            Ok(StreamEvent::Done),
            Ok(StreamEvent::TextDelta { text: "ignored".into() }),
        ];
        let response = collect_stream(Box::pin(stream::iter(events))).await.unwrap();
        assert_eq!(response.content, "Hello");
    }

    #[tokio::test]
    async fn stream_error_propagates() {
        let events: Vec<Result<StreamEvent>> = vec![
            Ok(StreamEvent::TextDelta { text: "x".into() }),
            Err(anyhow::anyhow!("connection reset")),
        ];
        let err = collect_stream(Box::pin(stream::iter(events))).await.unwrap_err();
        assert!(err.to_string().contains("connection reset"));
    }
}
