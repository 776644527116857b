//! The grammar handed to the sampler and the parser reading the output
//! must agree on what a well-formed reply is.

use std::sync::Arc;

use pie_structured::dialect::{ChatFormat, ChatInputs, ChatParams, ToolChoice, init_chat_params, init_format};
use pie_structured::structured::matcher::GrammarMatcher;
use pie_structured::structured::tokenizer::{TokenizerInfo, VocabType};
use serde_json::json;

fn grammar_accepts(params: &ChatParams, text: &str) -> bool {
    let grammar = params.grammar().unwrap().expect("format has a grammar");
    assert!(!grammar.is_lazy());
    let vocab: Vec<String> = vec!["dummy".into()];
    let tok = Arc::new(TokenizerInfo::new(&vocab, VocabType::Raw, None).unwrap());
    let mut m = GrammarMatcher::new(Arc::new(grammar), tok, vec![]).unwrap();
    m.accept_str(text).is_ok() && m.is_complete()
}

fn parser_accepts(params: &ChatParams, text: &str) -> bool {
    params.parser.parse(text, false).is_ok()
}

fn check_agreement(params: &ChatParams, accepted: &[&str], rejected: &[&str]) {
    for text in accepted {
        assert!(grammar_accepts(params, text), "grammar rejected {}", text);
        assert!(parser_accepts(params, text), "parser rejected {}", text);
    }
    for text in rejected {
        assert!(!grammar_accepts(params, text), "grammar accepted {}", text);
        assert!(!parser_accepts(params, text), "parser accepted {}", text);
    }
}

fn weather_tool() -> serde_json::Value {
    json!({"type": "function", "function": {
        "name": "get_weather",
        "parameters": {"type": "object", "properties": {"city": {"type": "string"}}, "required": ["city"]}
    }})
}

#[test]
fn test_generic_required_call() {
    let inputs = ChatInputs {
        tools: vec![weather_tool()],
        tool_choice: ToolChoice::Required,
        ..Default::default()
    };
    let params = init_chat_params(&inputs).unwrap();
    assert_eq!(params.format, ChatFormat::Generic);
    check_agreement(
        &params,
        &[
            r#"{"tool_call": {"name": "get_weather", "arguments": {"city": "Rome"}}}"#,
            r#"{"tool_call":{"name":"get_weather","arguments":{"city":"Rome"},"id":"x9"}}"#,
            "{\"tool_call\": {\"name\": \"get_weather\", \"arguments\": {\"city\": \"Rome\"}}}\n",
        ],
        &[
            r#"{"tool_call": {"name": "get_time", "arguments": {"city": "Rome"}}}"#,
            r#"{"tool_call": {"name": "get_weather"}}"#,
            r#"{"tool_call": {"name": "get_weather", "arguments": {"town": "Rome"}}}"#,
            r#"{"response": "hi"}"#,
            r#"{"tool_call": {"name": "get_weather", "arguments": {"city": "Rome"}}} ok"#,
            r#"{"tool_call": {"name": "get_weather", "arguments": {"city": "Rome"}}"#,
        ],
    );
}

#[test]
fn test_content_only_schema() {
    let inputs = ChatInputs {
        json_schema: Some(json!({
            "type": "object",
            "properties": {"answer": {"type": "integer"}, "note": {"type": "string"}},
            "required": ["answer"]
        })),
        ..Default::default()
    };
    let params = init_chat_params(&inputs).unwrap();
    assert_eq!(params.format, ChatFormat::ContentOnly);
    check_agreement(
        &params,
        &[
            r#"{"answer": 42}"#,
            r#"{"answer": -7, "note": "cold"}"#,
            "{\"answer\": 42}\n",
        ],
        &[
            r#"{"answer": "42"}"#,
            "{}",
            "[1]",
            r#"{"answer": 42} extra"#,
            r#"{"note": "x", "answer": 1}"#,
        ],
    );
}

#[test]
fn test_hermes_call_spellings() {
    let inputs = ChatInputs {
        tools: vec![weather_tool()],
        tool_choice: ToolChoice::Required,
        ..Default::default()
    };
    let params = init_format(ChatFormat::Hermes2Pro, &inputs).unwrap();
    let call = r#"{"name": "get_weather", "arguments": {"city": "Rome"}}"#;
    let accepted = [
        format!("<tool_call>{}</tool_call>", call),
        r#"<function=get_weather>{"city": "Rome"}</function>"#.to_string(),
        r#"<function name="get_weather">{"city": "Rome"}</function>"#.to_string(),
        call.to_string(),
        format!("<tools>\n{}\n</tools>", call),
        format!("<function_call>{}</function_call>", call),
        format!("<response>{}</response>", call),
        format!("<json>{}</json>", call),
        format!("<xml>{}</xml>", call),
        format!("<JSON>{}</JSON>", call),
        format!("```json\n{}\n```", call),
        format!("```\n<tool_call>{}</tool_call>\n```", call),
        format!("```xml\n<tools>{}</tools>```", call),
    ];
    let rejected = [
        r#"<tool_call>{"name": "get_weather", "arguments": {"city": 3}}</tool_call>"#.to_string(),
        r#"{"name": "get_time", "arguments": {"city": "Rome"}}"#.to_string(),
        format!("<tools>{}", call),
        format!("<tools>{}</json>", call),
        format!("```json\n{}", call),
        format!("Sure. {}", call),
    ];
    let accepted: Vec<&str> = accepted.iter().map(String::as_str).collect();
    let rejected: Vec<&str> = rejected.iter().map(String::as_str).collect();
    check_agreement(&params, &accepted, &rejected);
}

#[test]
fn test_hermes_tool_with_local_definitions() {
    let inputs = ChatInputs {
        tools: vec![json!({"type": "function", "function": {
            "name": "plot",
            "parameters": {
                "$defs": {"point": {
                    "type": "object",
                    "properties": {"x": {"type": "integer"}, "y": {"type": "integer"}},
                    "required": ["x", "y"]
                }},
                "type": "object",
                "properties": {"p": {"$ref": "#/$defs/point"}},
                "required": ["p"]
            }
        }})],
        tool_choice: ToolChoice::Required,
        ..Default::default()
    };
    let params = init_format(ChatFormat::Hermes2Pro, &inputs).unwrap();
    check_agreement(
        &params,
        &[
            r#"<tool_call>{"name": "plot", "arguments": {"p": {"x": 1, "y": 2}}}</tool_call>"#,
            r#"<function=plot>{"p": {"x": 1, "y": 2}}</function>"#,
        ],
        &[
            r#"<tool_call>{"name": "plot", "arguments": {"p": {"x": 1}}}</tool_call>"#,
            r#"<function=plot>{"p": {"x": "1", "y": 2}}</function>"#,
        ],
    );
}
