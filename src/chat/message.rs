use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// One tool call. `arguments` is JSON text, possibly truncated while
/// streaming.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub arguments: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
}

/// A typed piece of multi-part content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content_parts: Vec<ContentPart>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reasoning_content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tool_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tool_call_id: String,
}

impl Default for ChatMessage {
    fn default() -> Self {
        Self::assistant()
    }
}

impl ChatMessage {
    pub fn assistant() -> Self {
        Self {
            role: "assistant".to_string(),
            content: String::new(),
            content_parts: Vec::new(),
            reasoning_content: String::new(),
            tool_calls: Vec::new(),
            tool_name: String::new(),
            tool_call_id: String::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
            && self.content_parts.is_empty()
            && self.reasoning_content.is_empty()
            && self.tool_calls.is_empty()
    }

    /// The message as an OpenAI-compatible assistant message. `content` is
    /// null when the message carries only tool calls.
    pub fn to_json_oaicompat(&self) -> Value {
        let mut message = json!({ "role": "assistant" });
        if !self.reasoning_content.is_empty() {
            message["reasoning_content"] = json!(self.reasoning_content);
        }
        message["content"] = if self.content.is_empty() && !self.tool_calls.is_empty() {
            Value::Null
        } else {
            json!(self.content)
        };
        if !self.tool_calls.is_empty() {
            let calls: Vec<Value> = self
                .tool_calls
                .iter()
                .map(|tc| {
                    json!({
                        "type": "function",
                        "function": { "name": tc.name, "arguments": tc.arguments },
                        "id": tc.id,
                    })
                })
                .collect();
            message["tool_calls"] = Value::Array(calls);
        }
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oaicompat_null_content_with_tool_calls() {
        let mut msg = ChatMessage::assistant();
        msg.tool_calls.push(ToolCall {
            name: "get_weather".into(),
            arguments: r#"{"city":"Paris"}"#.into(),
            id: "call_1".into(),
        });
        let v = msg.to_json_oaicompat();
        assert_eq!(v["content"], Value::Null);
        assert_eq!(v["tool_calls"][0]["function"]["name"], "get_weather");
        assert_eq!(v["tool_calls"][0]["id"], "call_1");
        assert!(v.get("reasoning_content").is_none());
    }

    #[test]
    fn test_oaicompat_plain_content() {
        let mut msg = ChatMessage::assistant();
        msg.content = "hi".into();
        msg.reasoning_content = "thinking".into();
        let v = msg.to_json_oaicompat();
        assert_eq!(v, json!({"role": "assistant", "reasoning_content": "thinking", "content": "hi"}));
    }

    #[test]
    fn test_serde_skips_empty_fields() {
        let mut msg = ChatMessage::assistant();
        msg.content = "x".into();
        let text = serde_json::to_string(&msg).unwrap();
        assert_eq!(text, r#"{"role":"assistant","content":"x"}"#);
        let back: ChatMessage = serde_json::from_str(&text).unwrap();
        assert_eq!(back, msg);
    }
}
