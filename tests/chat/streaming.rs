//! Feeding output in pieces must converge on the complete parse.

use pie_structured::chat::{ChatMessage, StreamingParser, apply_diff};
use pie_structured::dialect::{ChatFormat, ChatInputs, ReasoningFormat, init_chat_params};
use serde_json::json;

/// Push `text` in chunks of `step` characters, checking that tool calls are
/// never retracted. Returns the merged diffs and the final message.
fn stream(mut parser: StreamingParser, text: &str, step: usize) -> (ChatMessage, ChatMessage) {
    let mut merged = ChatMessage::assistant();
    let mut calls = 0;
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    for chunk in chars.chunks(step) {
        let start = chunk[0].0;
        let (last, c) = chunk[chunk.len() - 1];
        for d in parser.push(&text[start..last + c.len_utf8()]) {
            apply_diff(&mut merged, &d);
        }
        let now = parser.message().tool_calls.len();
        assert!(now >= calls, "tool calls dropped from {} to {}", calls, now);
        calls = now;
        assert_eq!(&merged, parser.message());
    }
    let (final_msg, rest) = parser.finish().unwrap();
    rest.iter().for_each(|d| apply_diff(&mut merged, d));
    (merged, final_msg)
}

fn weather_tools() -> Vec<serde_json::Value> {
    vec![
        json!({"type": "function", "function": {
            "name": "get_weather",
            "parameters": {"type": "object", "properties": {"city": {"type": "string"}}, "required": ["city"]}
        }}),
        json!({"type": "function", "function": {
            "name": "get_time",
            "parameters": {"type": "object", "properties": {"zone": {"type": "string"}}}
        }}),
    ]
}

#[test]
fn test_generic_parallel_calls() {
    let inputs = ChatInputs {
        tools: weather_tools(),
        parallel_tool_calls: true,
        ..Default::default()
    };
    let params = init_chat_params(&inputs).unwrap();
    assert_eq!(params.format, ChatFormat::Generic);

    let text = r#"{"tool_calls": [{"name": "get_weather", "arguments": {"city": "Zürich"}, "id": "a1"}, {"name": "get_time", "arguments": {"zone": "CET"}, "id": "a2"}]}"#;
    for step in [1, 3, 7] {
        let (merged, final_msg) = stream(params.streaming_parser(), text, step);
        assert_eq!(final_msg.tool_calls.len(), 2);
        assert_eq!(final_msg.tool_calls[0].arguments, r#"{"city": "Zürich"}"#);
        assert_eq!(final_msg.tool_calls[1].id, "a2");
        assert_eq!(merged, final_msg);
    }
}

#[test]
fn test_content_only_plain_text() {
    let params = init_chat_params(&ChatInputs::default()).unwrap();
    assert_eq!(params.format, ChatFormat::ContentOnly);

    let text = "Bonjour, ça va ? 👋 Très bien.";
    for step in [1, 2, 5] {
        let (merged, final_msg) = stream(params.streaming_parser(), text, step);
        assert_eq!(final_msg.content, text);
        assert_eq!(merged, final_msg);
    }
}

#[test]
fn test_hermes_reasoning_then_call() {
    let inputs = ChatInputs {
        tools: weather_tools(),
        reasoning_format: ReasoningFormat::Deepseek,
        template_source: "<tool_call>".into(),
        ..Default::default()
    };
    let params = init_chat_params(&inputs).unwrap();
    assert_eq!(params.format, ChatFormat::Hermes2Pro);

    let text = concat!(
        "<think>The user wants weather.</think>\n",
        "Checking.\n",
        r#"<function=get_weather>{"city": "Lima"}</function>"#,
        "<|im_end|>"
    );
    for step in [1, 4] {
        let (merged, final_msg) = stream(params.streaming_parser(), text, step);
        assert_eq!(final_msg.reasoning_content, "The user wants weather.");
        assert_eq!(final_msg.content, "Checking.");
        assert_eq!(final_msg.tool_calls.len(), 1);
        assert_eq!(final_msg.tool_calls[0].arguments, r#"{"city": "Lima"}"#);
        assert_eq!(merged, final_msg);
    }
}

#[test]
fn test_generic_tool_name_prefix_of_another() {
    let empty = json!({"type": "object", "properties": {}});
    let inputs = ChatInputs {
        tools: vec![
            json!({"type": "function", "function": {"name": "get", "parameters": empty}}),
            json!({"type": "function", "function": {"name": "get_weather", "parameters": empty}}),
        ],
        ..Default::default()
    };
    let params = init_chat_params(&inputs).unwrap();
    assert_eq!(params.format, ChatFormat::Generic);

    for (text, name) in [
        (r#"{"tool_call": {"name": "get_weather", "arguments": {}}}"#, "get_weather"),
        (r#"{"tool_call": {"name": "get", "arguments": {}}}"#, "get"),
    ] {
        let (merged, final_msg) = stream(params.streaming_parser(), text, 1);
        assert_eq!(final_msg.tool_calls.len(), 1);
        assert_eq!(final_msg.tool_calls[0].name, name);
        assert_eq!(merged, final_msg);
    }
}
