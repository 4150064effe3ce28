//! Scripted chat backend for tests.

use super::{ChatBackend, ChatRequest, EventStream, ShellError, StreamEvent};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

type Script = Vec<Result<StreamEvent, ShellError>>;

/// Backend that replays pre-programmed event scripts, one per `stream`
/// call, and records everything it was asked to do.
#[derive(Clone, Default)]
pub struct ScriptedBackend {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    scripts: VecDeque<Script>,
    /// Indices (at push time) of scripts that hang after their events.
    hanging: std::collections::HashSet<usize>,
    popped: usize,
    requests: Vec<ChatRequest>,
    cancelled: Vec<String>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the event script for the next `stream` call.
    pub fn push_script(&self, script: Script) {
        self.inner.lock().unwrap().scripts.push_back(script);
    }

    /// Convenience: a script that streams `chunks` then completes with the
    /// concatenated value.
    pub fn push_text_response(&self, chunks: &[&str]) {
        let mut script: Script = chunks
            .iter()
            .map(|c| Ok(StreamEvent::ContentDelta { text: (*c).to_string() }))
            .collect();
        script.push(Ok(StreamEvent::Done {
            value: chunks.concat(),
            sources: vec![],
            silent_exit: false,
            silent_exit_reason: None,
        }));
        self.push_script(script);
    }

    /// A script that emits `chunks` and then hangs until cancelled. The
    /// queued entry is marked so `stream` chains a pending tail.
    pub fn push_hanging_response(&self, chunks: &[&str]) {
        let mut inner = self.inner.lock().unwrap();
        let index = inner.popped + inner.scripts.len();
        inner.hanging.insert(index);
        inner.scripts.push_back(
            chunks
                .iter()
                .map(|c| Ok(StreamEvent::ContentDelta { text: (*c).to_string() }))
                .collect(),
        );
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.inner.lock().unwrap().requests.clone()
    }

    pub fn cancelled_request_ids(&self) -> Vec<String> {
        self.inner.lock().unwrap().cancelled.clone()
    }
}

#[async_trait]
impl ChatBackend for ScriptedBackend {
    async fn stream(&self, request: ChatRequest) -> Result<EventStream, ShellError> {
        let (script, hangs) = {
            let mut inner = self.inner.lock().unwrap();
            inner.requests.push(request);
            let index = inner.popped;
            inner.popped += 1;
            let script = inner
                .scripts
                .pop_front()
                .ok_or_else(|| ShellError::Transport("no script queued".into()))?;
            (script, inner.hanging.contains(&index))
        };
        if hangs {
            Ok(Box::pin(
                futures::stream::iter(script).chain(futures::stream::pending()),
            ))
        } else {
            Ok(Box::pin(futures::stream::iter(script)))
        }
    }

    async fn cancel(&self, request_id: &str) -> Result<(), ShellError> {
        self.inner
            .lock()
            .unwrap()
            .cancelled
            .push(request_id.to_string());
        Ok(())
    }
}
