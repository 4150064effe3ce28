//! Per-stream accumulation state.

use crate::shell::{SourceRef, ToolStatus};
use crate::store::SubtaskResult;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// One thinking step: a tool invocation's lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThinkingStep {
    pub title: String,
    pub run_id: String,
    pub details: ThinkingDetails,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThinkingDetails {
    #[serde(rename = "type")]
    pub step_type: String,
    pub tool_name: String,
    pub status: ToolStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Accumulated state for one assistant stream.
#[derive(Debug)]
pub struct StreamState {
    /// Full assistant text so far.
    pub full_response: String,
    /// Bytes already emitted as chunks.
    pub offset: usize,
    pub thinking: Vec<ThinkingStep>,
    pub sources: Vec<SourceRef>,
}

impl StreamState {
    pub fn new() -> Self {
        Self {
            full_response: String::new(),
            offset: 0,
            thinking: Vec::new(),
            sources: Vec::new(),
        }
    }

    /// Append streamed text. Returns the offset the chunk starts at.
    pub fn append_content(&mut self, text: &str) -> usize {
        let chunk_offset = self.offset;
        self.full_response.push_str(text);
        self.offset += text.len();
        chunk_offset
    }

    /// Record a tool start as a new thinking step.
    pub fn tool_started(
        &mut self,
        run_id: &str,
        tool_name: &str,
        title: Option<String>,
        input: Option<Value>,
    ) {
        self.thinking.push(ThinkingStep {
            title: title.unwrap_or_else(|| tool_name.to_string()),
            run_id: run_id.to_string(),
            details: ThinkingDetails {
                step_type: "tool".to_string(),
                tool_name: tool_name.to_string(),
                status: ToolStatus::Started,
                input,
                output: None,
                error: None,
            },
        });
    }

    /// Resolve a tool step by run id. Unmatched completions append a new
    /// step so nothing the backend reports is dropped.
    pub fn tool_finished(
        &mut self,
        run_id: &str,
        tool_name: &str,
        output: Option<Value>,
        error: Option<String>,
    ) {
        let status = if error.is_some() {
            ToolStatus::Failed
        } else {
            ToolStatus::Completed
        };
        if let Some(step) = self.thinking.iter_mut().find(|s| s.run_id == run_id) {
            step.details.status = status;
            step.details.output = output;
            step.details.error = error;
            return;
        }
        self.thinking.push(ThinkingStep {
            title: tool_name.to_string(),
            run_id: run_id.to_string(),
            details: ThinkingDetails {
                step_type: "tool".to_string(),
                tool_name: tool_name.to_string(),
                status,
                input: None,
                output,
                error,
            },
        });
    }

    /// Merge sources, deduplicated by `(kb_id, title)`.
    pub fn add_sources(&mut self, incoming: Vec<SourceRef>) {
        for source in incoming {
            let seen = self
                .sources
                .iter()
                .any(|s| s.kb_id == source.kb_id && s.title == source.title);
            if !seen {
                self.sources.push(source);
            }
        }
    }

    /// Slim thinking list for chunk payloads: status without the bulky
    /// input/output bodies.
    pub fn slim_thinking(&self) -> Value {
        Value::Array(
            self.thinking
                .iter()
                .map(|step| {
                    json!({
                        "title": step.title,
                        "run_id": step.run_id,
                        "details": {
                            "type": step.details.step_type,
                            "tool_name": step.details.tool_name,
                            "status": step.details.status,
                            "error": step.details.error,
                        }
                    })
                })
                .collect(),
        )
    }

    /// Final persisted result.
    pub fn into_result(self, value: String, shell_type: &str, cancelled: bool) -> SubtaskResult {
        SubtaskResult {
            value,
            thinking: (!self.thinking.is_empty())
                .then(|| serde_json::to_value(&self.thinking).unwrap_or(Value::Null)),
            workbench: None,
            sources: (!self.sources.is_empty())
                .then(|| serde_json::to_value(&self.sources).unwrap_or(Value::Null)),
            cancelled,
            shell_type: Some(shell_type.to_string()),
            silent_exit: false,
            silent_exit_reason: None,
        }
    }
}

impl Default for StreamState {
    fn default() -> Self {
        Self::new()
    }
}
