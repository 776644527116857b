use serde_json::{Value, json};

use super::ChatParseError;
use super::message::{ChatMessage, ToolCall};

/// What changed between two parses of a growing output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatMessageDiff {
    pub reasoning_content_delta: String,
    pub content_delta: String,
    pub tool_call_index: Option<usize>,
    /// For a new call, the whole call. For an existing one, the appended
    /// argument text, plus name and id when the id changed.
    pub tool_call_delta: ToolCall,
}

impl ChatMessageDiff {
    /// OpenAI-compatible streaming `delta` object.
    pub fn to_json_oaicompat(&self) -> Value {
        let mut delta = json!({});
        if !self.reasoning_content_delta.is_empty() {
            delta["reasoning_content"] = json!(self.reasoning_content_delta);
        }
        if !self.content_delta.is_empty() {
            delta["content"] = json!(self.content_delta);
        }
        if let Some(index) = self.tool_call_index {
            let mut call = json!({ "index": index });
            if !self.tool_call_delta.id.is_empty() {
                call["id"] = json!(self.tool_call_delta.id);
                call["type"] = json!("function");
            }
            let mut function = json!({});
            if !self.tool_call_delta.name.is_empty() {
                function["name"] = json!(self.tool_call_delta.name);
            }
            function["arguments"] = json!(self.tool_call_delta.arguments);
            call["function"] = function;
            delta["tool_calls"] = json!([call]);
        }
        delta
    }
}

fn string_diff(last: &str, current: &str, field: &str) -> Result<String, ChatParseError> {
    if let Some(suffix) = current.strip_prefix(last) {
        return Ok(suffix.to_string());
    }
    Err(ChatParseError::InvalidDiff(format!(
        "{} {:?} is not a prefix of {:?}",
        field, last, current
    )))
}

/// Deltas taking `previous` to `current`.
///
/// Only the last call of `previous` may still be growing; calls before it
/// are final. Fails when `current` retracts text or calls.
pub fn compute_diffs(previous: &ChatMessage, current: &ChatMessage) -> Result<Vec<ChatMessageDiff>, ChatParseError> {
    let mut diffs = Vec::new();

    if previous.reasoning_content != current.reasoning_content {
        diffs.push(ChatMessageDiff {
            reasoning_content_delta: string_diff(
                &previous.reasoning_content,
                &current.reasoning_content,
                "reasoning",
            )?,
            ..Default::default()
        });
    }
    if previous.content != current.content {
        diffs.push(ChatMessageDiff {
            content_delta: string_diff(&previous.content, &current.content, "content")?,
            ..Default::default()
        });
    }

    if current.tool_calls.len() < previous.tool_calls.len() {
        return Err(ChatParseError::InvalidDiff(format!(
            "tool calls went from {} to {}",
            previous.tool_calls.len(),
            current.tool_calls.len()
        )));
    }

    if let Some((index, before)) = previous.tool_calls.iter().enumerate().last() {
        let after = &current.tool_calls[index];
        if before.name != after.name {
            return Err(ChatParseError::InvalidDiff(format!(
                "tool call {} renamed from {:?} to {:?}",
                index, before.name, after.name
            )));
        }
        let arguments = string_diff(&before.arguments, &after.arguments, "arguments")?;
        if !arguments.is_empty() || before.id != after.id {
            let mut delta = ToolCall {
                arguments,
                ..Default::default()
            };
            if before.id != after.id {
                delta.id = after.id.clone();
                delta.name = after.name.clone();
            }
            diffs.push(ChatMessageDiff {
                tool_call_index: Some(index),
                tool_call_delta: delta,
                ..Default::default()
            });
        }
    }

    for (index, call) in current.tool_calls.iter().enumerate().skip(previous.tool_calls.len()) {
        diffs.push(ChatMessageDiff {
            tool_call_index: Some(index),
            tool_call_delta: call.clone(),
            ..Default::default()
        });
    }

    Ok(diffs)
}

/// Merge one diff into `message`, the way a streaming client would.
pub fn apply_diff(message: &mut ChatMessage, diff: &ChatMessageDiff) {
    message.reasoning_content.push_str(&diff.reasoning_content_delta);
    message.content.push_str(&diff.content_delta);
    let Some(index) = diff.tool_call_index else {
        return;
    };
    if index >= message.tool_calls.len() {
        message.tool_calls.resize_with(index + 1, ToolCall::default);
        message.tool_calls[index] = diff.tool_call_delta.clone();
        return;
    }
    let call = &mut message.tool_calls[index];
    if !diff.tool_call_delta.name.is_empty() {
        call.name = diff.tool_call_delta.name.clone();
    }
    if !diff.tool_call_delta.id.is_empty() {
        call.id = diff.tool_call_delta.id.clone();
    }
    call.arguments.push_str(&diff.tool_call_delta.arguments);
}
