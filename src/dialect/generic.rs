//! JSON envelope format for models without a native tool syntax.
//!
//! The whole reply is one JSON object, one of
//!
//! ```text
//! {"tool_call": {"name": "f", "arguments": {...}}}
//! {"tool_calls": [{"name": "f", "arguments": {...}, "id": "..."}, ...]}
//! {"response": ...}
//! ```
//!
//! `tool_calls` is used when parallel calls are enabled. `response` is
//! offered unless a tool call is required, and follows the response schema
//! when one is given (a string otherwise).

use anyhow::Result;
use serde_json::{Value, json};

use super::{ChatFormat, ChatInputs, ChatParams, FunctionTool, ToolChoice, lowered_grammar};
use crate::chat::{ChatParser, Mapper};
use crate::peg::{ParserId, PegBuilder, Tag};

pub(super) fn init(inputs: &ChatInputs) -> Result<ChatParams> {
    let tools = inputs.function_tools()?;
    let mut p = PegBuilder::new();

    let mut envelopes = Vec::new();
    if !tools.is_empty() && inputs.tool_choice != ToolChoice::None {
        let calls: Vec<ParserId> = tools.iter().map(|t| tool_call(&mut p, t)).collect();
        let call = match calls.len() {
            1 => calls[0],
            _ => p.choice(calls),
        };
        let call = p.rule("tool-call", call);
        let body = if inputs.parallel_tool_calls {
            let list = separated(&mut p, call);
            let open = p.literal("[");
            let close = p.literal("]");
            let value = spaced(&mut p, vec![open, list, close]);
            member(&mut p, "tool_calls", value)
        } else {
            member(&mut p, "tool_call", call)
        };
        envelopes.push(body);
    }
    if inputs.tool_choice != ToolChoice::Required || envelopes.is_empty() {
        let schema = inputs.json_schema.clone().unwrap_or_else(|| json!({"type": "string"}));
        let json = p.json();
        let doc = p.schema(json, "response", &schema);
        let content = p.tag(Tag::Content, doc);
        envelopes.push(member(&mut p, "response", content));
    }

    let body = match envelopes.len() {
        1 => envelopes[0],
        _ => p.choice(envelopes),
    };
    let sp = p.space();
    let root = p.sequence(vec![body, sp]);
    p.set_root(root);
    let arena = p.build()?;

    let (grammar, _) = lowered_grammar(&arena, false)?;
    let mut params = ChatParams::new(
        ChatFormat::Generic,
        inputs.prompt.clone(),
        ChatParser::new(arena, Mapper::Generic),
    );
    params.grammar = Some(grammar);
    Ok(params)
}

/// `children` separated by optional whitespace.
fn spaced(p: &mut PegBuilder, children: Vec<ParserId>) -> ParserId {
    let mut seq = Vec::with_capacity(children.len() * 2);
    for (i, child) in children.into_iter().enumerate() {
        if i > 0 {
            seq.push(p.space());
        }
        seq.push(child);
    }
    p.sequence(seq)
}

/// `{"key": value}`
fn member(p: &mut PegBuilder, key: &str, value: ParserId) -> ParserId {
    let open = p.literal("{");
    let key = p.literal(&Value::String(key.to_string()).to_string());
    let colon = p.literal(":");
    let close = p.literal("}");
    spaced(p, vec![open, key, colon, value, close])
}

/// `item ("," item)*`
fn separated(p: &mut PegBuilder, item: ParserId) -> ParserId {
    let comma = p.literal(",");
    let next = spaced(p, vec![comma, item]);
    let more = p.zero_or_more(next);
    let sp = p.space();
    p.sequence(vec![item, sp, more])
}

/// `{"name": "<name>", "arguments": {...}, "id": "..."}` with the id
/// optional.
fn tool_call(p: &mut PegBuilder, tool: &FunctionTool) -> ParserId {
    let open_brace = p.literal("{");
    let open = p.atomic_tag(Tag::ToolOpen, open_brace);
    let name_key = p.literal(r#""name""#);
    let colon = p.literal(":");
    let quote = p.literal("\"");
    let name = p.terminated_literal_tag(Tag::ToolName, &tool.name, "\"");
    let name_value = p.sequence(vec![quote, name]);
    let comma = p.literal(",");
    let args_key = p.literal(r#""arguments""#);
    let json = p.json();
    let args_doc = p.schema(json, &format!("{}-args", tool.name), &tool.parameters);
    let args = p.tag(Tag::ToolArgs, args_doc);

    let id_key = p.literal(r#""id""#);
    let id_chars = p.chars(r#"[^"\\]"#, 0, None);
    let id_text = p.tag(Tag::ToolId, id_chars);
    let id_value = p.sequence(vec![quote, id_text, quote]);
    let id = spaced(p, vec![comma, id_key, colon, id_value]);
    let id = p.optional(id);

    let close_brace = p.literal("}");
    let close = p.atomic_tag(Tag::ToolClose, close_brace);
    let call = spaced(
        p,
        vec![open, name_key, colon, name_value, comma, args_key, colon, args, id, close],
    );
    p.tag(Tag::Tool, call)
}
