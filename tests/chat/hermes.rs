use pie_structured::chat::{ChatMessage, ChatParseError, apply_diff};
use pie_structured::dialect::{ChatFormat, ChatInputs, ChatParams, ReasoningFormat, ToolChoice, init_chat_params};
use serde_json::json;

const CALL: &str = r#"<tool_call>{"name": "special_function", "arguments": {"arg1": 1}}</tool_call>"#;

const TEMPLATE: &str = "{% for m in messages %}<tool_call>{{ m }}</tool_call>{% endfor %}";

fn special_function_params(choice: ToolChoice) -> ChatParams {
    init_chat_params(&special_function_inputs(choice)).unwrap()
}

fn special_function_inputs(choice: ToolChoice) -> ChatInputs {
    ChatInputs {
        tools: vec![json!({"type": "function", "function": {
            "name": "special_function",
            "description": "I'm special",
            "parameters": {
                "type": "object",
                "properties": {"arg1": {"type": "integer", "description": "The arg."}},
                "required": ["arg1"]
            }
        }})],
        tool_choice: choice,
        template_source: TEMPLATE.into(),
        ..Default::default()
    }
}

/// Push `text` one character at a time. At every prefix the merged diffs
/// equal the reported message and no field shrinks. Returns the merged
/// and the final message.
fn stream_every_prefix(params: &ChatParams, text: &str) -> (ChatMessage, ChatMessage) {
    let mut stream = params.streaming_parser();
    let mut merged = ChatMessage::assistant();
    let mut last = ChatMessage::assistant();
    for (i, c) in text.char_indices() {
        for d in stream.push(&text[i..i + c.len_utf8()]) {
            apply_diff(&mut merged, &d);
        }
        let now = stream.message();
        assert_eq!(&merged, now, "after {:?}", &text[..i + c.len_utf8()]);
        assert!(now.content.starts_with(&last.content), "content shrank at {}", i);
        assert!(now.reasoning_content.starts_with(&last.reasoning_content), "reasoning shrank at {}", i);
        assert!(now.tool_calls.len() >= last.tool_calls.len(), "tool calls dropped at {}", i);
        for (before, after) in last.tool_calls.iter().zip(&now.tool_calls) {
            assert_eq!(before.name, after.name);
            assert!(after.arguments.starts_with(&before.arguments), "arguments shrank at {}", i);
        }
        last = now.clone();
    }
    let (final_msg, rest) = stream.finish().unwrap();
    rest.iter().for_each(|d| apply_diff(&mut merged, d));
    assert_eq!(merged, final_msg);
    (merged, final_msg)
}

#[test]
fn test_special_function_call() {
    let params = special_function_params(ToolChoice::Auto);
    assert_eq!(params.format, ChatFormat::Hermes2Pro);

    let msg = params.parser.parse(CALL, false).unwrap();
    assert_eq!(msg.content, "");
    assert_eq!(msg.reasoning_content, "");
    assert_eq!(msg.tool_calls.len(), 1);
    assert_eq!(msg.tool_calls[0].name, "special_function");
    assert_eq!(msg.tool_calls[0].arguments, r#"{"arg1": 1}"#);
    assert_eq!(msg.tool_calls[0].id, "");
}

#[test]
fn test_parse_is_idempotent() {
    let params = special_function_params(ToolChoice::Auto);
    let text = format!("I will call it.\n{}<|im_end|>", CALL);
    let first = params.parser.parse(&text, false).unwrap();
    let second = params.parser.parse(&text, false).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.content, "I will call it.");
}

#[test]
fn test_required_call_rejects_plain_text() {
    let params = special_function_params(ToolChoice::Required);
    assert!(!params.grammar_lazy);
    assert!(params.parser.parse("No call here.", false).is_err());
    assert_eq!(params.parser.parse(CALL, false).unwrap().tool_calls.len(), 1);
}

#[test]
fn test_wrong_argument_type_is_rejected() {
    let params = special_function_params(ToolChoice::Required);
    let text = r#"<tool_call>{"name": "special_function", "arguments": {"arg1": "one"}}</tool_call>"#;
    assert!(params.parser.parse(text, false).is_err());
}

#[test]
fn test_streamed_call_matches_final() {
    let params = special_function_params(ToolChoice::Auto);
    let text = format!("Calling now.\n{}", CALL);
    let mut stream = params.streaming_parser();
    let mut merged = ChatMessage::assistant();
    for (i, c) in text.char_indices() {
        for d in stream.push(&text[i..i + c.len_utf8()]) {
            apply_diff(&mut merged, &d);
        }
        for call in &stream.message().tool_calls {
            assert_eq!(call.name, "special_function");
        }
    }
    let (final_msg, rest) = stream.finish().unwrap();
    rest.iter().for_each(|d| apply_diff(&mut merged, d));
    assert_eq!(final_msg.content, "Calling now.");
    assert_eq!(final_msg.tool_calls[0].arguments, r#"{"arg1": 1}"#);
    assert_eq!(merged, final_msg);
}

#[test]
fn test_malformed_argument_keeps_last_message() {
    let params = special_function_params(ToolChoice::Auto);
    let mut stream = params.streaming_parser();
    stream.push(r#"<tool_call>{"name": "special_function", "arguments": {"arg1": "#);
    let before = stream.message().clone();
    assert_eq!(before.tool_calls.len(), 1);

    assert!(stream.push(r#""oops"}}</tool_call>"#).is_empty());
    assert_eq!(stream.message(), &before);
    assert!(matches!(
        stream.finish(),
        Err(ChatParseError::Mismatch { .. } | ChatParseError::TrailingText { .. })
    ));
}

#[test]
fn test_call_streamed_from_first_byte() {
    let params = special_function_params(ToolChoice::Auto);
    let (_, final_msg) = stream_every_prefix(&params, CALL);
    assert_eq!(final_msg.content, "");
    assert_eq!(final_msg.tool_calls.len(), 1);
    assert_eq!(final_msg.tool_calls[0].name, "special_function");
    assert_eq!(final_msg.tool_calls[0].arguments, r#"{"arg1": 1}"#);
}

#[test]
fn test_every_prefix_is_monotonic() {
    let mut inputs = special_function_inputs(ToolChoice::Auto);
    inputs.reasoning_format = ReasoningFormat::Deepseek;
    let params = init_chat_params(&inputs).unwrap();
    let texts = [
        CALL.to_string(),
        format!("<think>Need arg1.</think>\n{}", CALL),
        format!("Partial tags <tool> and <fun> stay content.\n{}<|im_end|>", CALL),
        "<b>No call</b>, just <tool> talk.".to_string(),
        r#"<function=special_function>{"arg1": 2}</function>"#.to_string(),
        r#"<tools>{"name": "special_function", "arguments": {"arg1": 3}}</tools>"#.to_string(),
    ];
    for text in &texts {
        let (_, final_msg) = stream_every_prefix(&params, text);
        assert_eq!(final_msg, params.parser.parse(text, false).unwrap(), "{}", text);
    }

    let (_, msg) = stream_every_prefix(&params, &texts[2]);
    assert_eq!(msg.content, "Partial tags <tool> and <fun> stay content.");
    let (_, msg) = stream_every_prefix(&params, &texts[3]);
    assert_eq!(msg.content, "<b>No call</b>, just <tool> talk.");
    assert!(msg.tool_calls.is_empty());
}

#[test]
fn test_tool_name_prefix_of_another() {
    let empty = json!({"type": "object", "properties": {}});
    let inputs = ChatInputs {
        tools: vec![
            json!({"type": "function", "function": {"name": "get", "parameters": empty}}),
            json!({"type": "function", "function": {"name": "get_weather", "parameters": empty}}),
        ],
        template_source: TEMPLATE.into(),
        ..Default::default()
    };
    let params = init_chat_params(&inputs).unwrap();
    for text in [
        r#"Ok. <tool_call>{"name": "get_weather", "arguments": {}}</tool_call>"#,
        r#"Ok. <tool_call>{"name": "get", "arguments": {}}</tool_call>"#,
    ] {
        let (_, final_msg) = stream_every_prefix(&params, text);
        assert_eq!(final_msg.content, "Ok.");
        assert_eq!(final_msg.tool_calls.len(), 1);
    }
    let (_, msg) = stream_every_prefix(&params, r#"<tool_call>{"name": "get_weather", "arguments": {}}</tool_call>"#);
    assert_eq!(msg.tool_calls[0].name, "get_weather");
}
