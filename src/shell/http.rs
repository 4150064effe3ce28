//! HTTP chat-shell client.
//!
//! `POST /v1/response` returns `text/event-stream`; frames are mapped to
//! [`StreamEvent`]s. Cancellation goes out-of-band through
//! `POST /v1/response/cancel`.

use super::sse::{SseFrame, SseParser};
use super::{ChatBackend, ChatRequest, EventStream, ShellError, SourceRef, StreamEvent};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use std::collections::VecDeque;
use std::time::Duration;

pub struct HttpChatShell {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpChatShell {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            // Read timeout only; the stream itself may run for minutes.
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into(),
            token,
        }
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

#[async_trait]
impl ChatBackend for HttpChatShell {
    async fn stream(&self, request: ChatRequest) -> Result<EventStream, ShellError> {
        let url = format!("{}/v1/response", self.base_url.trim_end_matches('/'));
        let mut builder = self
            .client
            .post(&url)
            .header("accept", "text/event-stream")
            .json(&request);
        if let Some(trace) = &request.trace_context {
            builder = builder.header("traceparent", trace.to_traceparent());
        }
        let response = self
            .authorized(builder)
            .send()
            .await
            .map_err(|e| ShellError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ShellError::Status {
                status: status.as_u16(),
                message,
            });
        }

        struct State {
            bytes: std::pin::Pin<
                Box<dyn futures::Stream<Item = reqwest::Result<bytes::Bytes>> + Send>,
            >,
            parser: SseParser,
            queue: VecDeque<Result<StreamEvent, ShellError>>,
            exhausted: bool,
        }

        let state = State {
            bytes: Box::pin(response.bytes_stream()),
            parser: SseParser::new(),
            queue: VecDeque::new(),
            exhausted: false,
        };

        let stream = futures::stream::unfold(state, |mut state| async move {
            loop {
                if let Some(item) = state.queue.pop_front() {
                    return Some((item, state));
                }
                if state.exhausted {
                    return None;
                }
                match state.bytes.next().await {
                    Some(Ok(chunk)) => {
                        for frame in state.parser.feed(&chunk) {
                            if let Some(item) = frame_to_event(&frame) {
                                state.queue.push_back(item);
                            }
                        }
                    }
                    Some(Err(e)) => {
                        state.exhausted = true;
                        state
                            .queue
                            .push_back(Err(ShellError::Transport(e.to_string())));
                    }
                    None => state.exhausted = true,
                }
            }
        });

        Ok(Box::pin(stream))
    }

    async fn cancel(&self, request_id: &str) -> Result<(), ShellError> {
        let url = format!(
            "{}/v1/response/cancel",
            self.base_url.trim_end_matches('/')
        );
        let response = self
            .authorized(self.client.post(&url))
            .json(&serde_json::json!({"request_id": request_id}))
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| ShellError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ShellError::Status {
                status: response.status().as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }
}

/// Map one SSE frame to a stream event. Unknown event names are skipped so
/// protocol additions do not break older control planes.
fn frame_to_event(frame: &SseFrame) -> Option<Result<StreamEvent, ShellError>> {
    let name = frame.event.as_deref()?;
    let data: Value = if frame.data.is_empty() {
        Value::Null
    } else {
        match serde_json::from_str(&frame.data) {
            Ok(v) => v,
            Err(e) => {
                return Some(Err(ShellError::Protocol(format!(
                    "bad {name} payload: {e}"
                ))))
            }
        }
    };

    let event = match name {
        "response.start" => StreamEvent::Started {
            request_id: str_field(&data, "request_id").unwrap_or_default(),
        },
        "content.delta" => StreamEvent::ContentDelta {
            text: str_field(&data, "text").unwrap_or_default(),
        },
        "reasoning.delta" => StreamEvent::ReasoningDelta {
            text: str_field(&data, "text").unwrap_or_default(),
        },
        "tool.start" => StreamEvent::ToolStart {
            run_id: str_field(&data, "run_id").unwrap_or_default(),
            tool_name: str_field(&data, "tool_name").unwrap_or_default(),
            title: str_field(&data, "title"),
            input: data.get("input").cloned(),
        },
        "tool.done" => StreamEvent::ToolDone {
            run_id: str_field(&data, "run_id").unwrap_or_default(),
            tool_name: str_field(&data, "tool_name").unwrap_or_default(),
            output: data.get("output").cloned(),
            error: str_field(&data, "error"),
        },
        "response.done" => {
            let sources: Vec<SourceRef> = data
                .get("sources")
                .cloned()
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or_default();
            StreamEvent::Done {
                value: str_field(&data, "value").unwrap_or_default(),
                sources,
                silent_exit: data
                    .get("silent_exit")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
                silent_exit_reason: str_field(&data, "silent_exit_reason"),
            }
        }
        "response.cancelled" => StreamEvent::Cancelled,
        "error" => {
            let message =
                str_field(&data, "message").unwrap_or_else(|| "chat shell error".to_string());
            return Some(Err(ShellError::Upstream(message)));
        }
        _ => return None,
    };
    Some(Ok(event))
}

fn str_field(data: &Value, key: &str) -> Option<String> {
    data.get(key).and_then(Value::as_str).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(event: &str, data: &str) -> SseFrame {
        SseFrame {
            event: Some(event.to_string()),
            data: data.to_string(),
        }
    }

    #[test]
    fn maps_content_delta() {
        let ev = frame_to_event(&frame("content.delta", r#"{"text":"he"}"#))
            .unwrap()
            .unwrap();
        assert_eq!(ev, StreamEvent::ContentDelta { text: "he".into() });
    }

    #[test]
    fn maps_done_with_sources() {
        let ev = frame_to_event(&frame(
            "response.done",
            r#"{"value":"hello","sources":[{"kb_id":1,"title":"doc"}]}"#,
        ))
        .unwrap()
        .unwrap();
        let StreamEvent::Done { value, sources, silent_exit, .. } = ev else {
            panic!("wrong event");
        };
        assert_eq!(value, "hello");
        assert_eq!(sources.len(), 1);
        assert!(!silent_exit);
    }

    #[test]
    fn error_event_becomes_upstream_error() {
        let item = frame_to_event(&frame("error", r#"{"message":"model melted"}"#)).unwrap();
        assert!(matches!(item, Err(ShellError::Upstream(m)) if m == "model melted"));
    }

    #[test]
    fn unknown_events_are_skipped() {
        assert!(frame_to_event(&frame("future.thing", "{}")).is_none());
    }
}
