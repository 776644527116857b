//! Hermes 2 Pro and the many models trained on its tool syntax.
//!
//! Calls come in three spellings, optionally after a `<think>` block and
//! some content:
//!
//! ```text
//! <tool_call>{"name": "f", "arguments": {...}}</tool_call>
//! <function=f>{...}</function>
//! <function name="f">{...}</function>
//! ```
//!
//! Models also wrap the JSON spelling (`<tools>`, fenced code blocks, ...);
//! parser and grammar both accept those. The grammar is written by hand
//! and is lazy unless a call is required.

use anyhow::Result;
use serde_json::json;

use super::{ChatFormat, ChatInputs, ChatParams, FunctionTool, ReasoningFormat, ToolChoice};
use crate::chat::{ChatParser, Mapper};
use crate::peg::{ParserId, PegArena, PegBuilder, Tag};
use crate::structured::grammar::GrammarTrigger;
use crate::structured::json_schema::{JsonSchemaOptions, SchemaGrammarBuilder, rebase_refs};
use crate::structured::regex::quote_literal;

/// Tools that may receive raw code between the function tags.
const RAW_CODE_TOOLS: &[&str] = &["python", "code_interpreter"];

const PRESERVED_TOKENS: &[&str] = &[
    "<think>",
    "</think>",
    "<tool_call>",
    "</tool_call>",
    "<function",
    "<tools>",
    "</tools>",
    "<response>",
    "</response>",
    "<function_call>",
    "</function_call>",
    "<json>",
    "</json>",
    "<JSON>",
    "</JSON>",
    "```",
    "```json",
    "```xml",
];

pub(super) fn init(inputs: &ChatInputs) -> Result<ChatParams> {
    let tools = inputs.function_tools()?;

    let mut prompt = inputs.prompt.clone();
    let mut thinking_forced_open = false;
    if prompt.ends_with("<think>\n") {
        if inputs.enable_thinking {
            thinking_forced_open = true;
        } else {
            prompt.push_str("</think>");
        }
    }

    let with_tools = !tools.is_empty() && inputs.tool_choice != ToolChoice::None;
    let arena = build_parser(inputs, &tools, with_tools, thinking_forced_open)?;

    let mut params = ChatParams::new(ChatFormat::Hermes2Pro, prompt, ChatParser::new(arena, Mapper::Native));
    params.thinking_forced_open = thinking_forced_open;
    params.grammar_lazy = inputs.tool_choice != ToolChoice::Required;
    params.preserved_tokens = PRESERVED_TOKENS.iter().map(|t| t.to_string()).collect();
    if with_tools {
        let (grammar, triggers) = build_grammar(&tools, inputs.parallel_tool_calls, thinking_forced_open)?;
        params.grammar = Some(grammar);
        params.grammar_triggers = triggers;
    }
    Ok(params)
}

fn build_parser(
    inputs: &ChatInputs,
    tools: &[FunctionTool],
    with_tools: bool,
    thinking_forced_open: bool,
) -> Result<PegArena> {
    let mut p = PegBuilder::new();

    let reasoning = if inputs.reasoning_format == ReasoningFormat::None {
        p.eps()
    } else {
        let body = p.until("</think>");
        let text = p.tag(Tag::Reasoning, body);
        let close = p.literal("</think>");
        if thinking_forced_open {
            p.sequence(vec![text, close])
        } else {
            let open = p.literal("<think>");
            let block = p.sequence(vec![open, text, close]);
            p.optional(block)
        }
    };
    let sp = p.space();
    let end = message_end(&mut p);

    let root = if with_tools {
        let mut alternatives = Vec::new();
        for tool in tools {
            alternatives.extend(tool_call_rules(&mut p, tool));
        }
        let any_call = p.choice(alternatives);
        let max = if inputs.parallel_tool_calls { None } else { Some(1) };
        let some_calls = p.repeat(any_call, 1, max);
        let some_calls = p.trigger_rule("tool-call-root", some_calls);

        if inputs.tool_choice == ToolChoice::Required {
            p.sequence(vec![reasoning, sp, some_calls, end])
        } else {
            // calls opening the reply may use any spelling; after content
            // only the tagged ones are recognised
            let leading = p.sequence(vec![reasoning, sp, some_calls, end]);
            let calls = p.repeat(any_call, 0, max);
            let prefix = p.until_one_of(&["<tool_call>", "<function"]);
            let content = p.tag(Tag::Content, prefix);
            let content = p.optional(content);
            let after_content = p.sequence(vec![reasoning, sp, content, calls, end]);
            p.choice(vec![leading, after_content])
        }
    } else {
        let body = p.until("<|im_end|>");
        let content = p.tag(Tag::Content, body);
        let block = p.sequence(vec![content, end]);
        let rest = p.rest();
        let everything = p.tag(Tag::Content, rest);
        let nothing = p.eps();
        let reply = p.choice(vec![block, everything, nothing]);
        p.sequence(vec![reasoning, sp, reply])
    };
    p.set_root(root);
    p.build()
}

/// Optional end-of-turn marker and trailing whitespace.
fn message_end(p: &mut PegBuilder) -> ParserId {
    let markers: Vec<ParserId> = ["<|im_end|>", "<|eot_id|>", "<|eom_id|>"]
        .iter()
        .map(|m| p.literal(m))
        .collect();
    let marker = p.choice(markers);
    let marker = p.optional(marker);
    let sp = p.space();
    p.sequence(vec![marker, sp])
}

/// Tags a JSON call may be wrapped in.
const CALL_WRAPPERS: &[&str] = &["tool_call", "function_call", "response", "tools", "json", "xml", "JSON"];

/// Every spelling of a call to one tool: the JSON object bare, wrapped in
/// one of [`CALL_WRAPPERS`] or fenced, and the two `<function` forms.
fn tool_call_rules(p: &mut PegBuilder, tool: &FunctionTool) -> [ParserId; 3] {
    let name = tool.name.as_str();
    let sp = p.space();

    // {"name": "f", "arguments": {...}}
    let brace = p.literal("{");
    let name_key = p.literal(r#""name""#);
    let colon = p.literal(":");
    let quote = p.literal("\"");
    let tool_name = p.terminated_literal_tag(Tag::ToolName, name, "\"");
    let comma = p.literal(",");
    let args_key = p.literal(r#""arguments""#);
    let json = p.json();
    let args_doc = p.schema(json, &format!("tool-{}-args", name), &tool.parameters);
    let args = p.tag(Tag::ToolArgs, args_doc);
    let close_brace = p.literal("}");
    let object = p.sequence(vec![
        brace, sp, name_key, sp, colon, sp, quote, tool_name, sp, comma, sp, args_key, sp, colon, sp, args, sp,
        close_brace,
    ]);
    let object = p.rule(&format!("tool-object-{}", name), object);

    let mut spellings = vec![object];
    for wrapper in CALL_WRAPPERS {
        let open_lit = p.literal(&format!("<{}>", wrapper));
        let open = p.atomic_tag(Tag::ToolOpen, open_lit);
        let close_lit = p.literal(&format!("</{}>", wrapper));
        let close = p.atomic_tag(Tag::ToolClose, close_lit);
        spellings.push(p.sequence(vec![open, sp, object, sp, close]));
    }
    let wrappable = p.choice(spellings);
    let fences: Vec<ParserId> = ["```\n", "```json\n", "```xml\n"].iter().map(|f| p.literal(f)).collect();
    let fence_open = p.choice(fences);
    let fence_close = p.literal("```");
    let fenced = p.sequence(vec![fence_open, sp, wrappable, sp, fence_close]);
    let json_body = p.choice(vec![fenced, wrappable]);
    let json_call = p.tag(Tag::Tool, json_body);
    let json_call = p.sequence(vec![json_call, sp]);
    let json_call = p.rule(&format!("tool-call-{}", name), json_call);

    // <function=f>{...}</function>
    let eq_open_lit = p.literal("<function=");
    let eq_name = p.literal_tag(Tag::ToolName, name);
    let gt = p.literal(">");
    let eq_open_seq = p.sequence(vec![eq_open_lit, eq_name, gt]);
    let eq_open = p.atomic_tag(Tag::ToolOpen, eq_open_seq);
    let eq_args = function_args(p, tool, &format!("func-{}-args", name));
    let eq_close = function_close(p);
    let eq_body = p.sequence(vec![eq_open, sp, eq_args, sp, eq_close]);
    let eq_call = p.tag(Tag::Tool, eq_body);
    let eq_call = p.sequence(vec![eq_call, sp]);
    let eq_call = p.rule(&format!("func-eq-{}", name), eq_call);

    // <function name="f">{...}</function>
    let fn_lit = p.literal("<function");
    let name_attr = p.literal("name=\"");
    let attr_name = p.literal_tag(Tag::ToolName, name);
    let attr_close = p.literal("\">");
    let named_open_seq = p.sequence(vec![fn_lit, sp, name_attr, attr_name, attr_close]);
    let named_open = p.atomic_tag(Tag::ToolOpen, named_open_seq);
    let named_args = function_args(p, tool, &format!("funcn-{}-args", name));
    let named_close = function_close(p);
    let named_body = p.sequence(vec![named_open, sp, named_args, sp, named_close]);
    let named_call = p.tag(Tag::Tool, named_body);
    let named_call = p.sequence(vec![named_call, sp]);
    let named_call = p.rule(&format!("func-name-{}", name), named_call);

    [json_call, eq_call, named_call]
}

/// Arguments between function tags: JSON following the parameters, or for
/// the code tools also raw code up to the closing tag.
fn function_args(p: &mut PegBuilder, tool: &FunctionTool, rule_name: &str) -> ParserId {
    let json = p.json();
    let doc = p.schema(json, rule_name, &tool.parameters);
    let value = if RAW_CODE_TOOLS.contains(&tool.name.as_str()) {
        let raw = p.until("</function>");
        p.choice(vec![doc, raw])
    } else {
        doc
    };
    p.tag(Tag::ToolArgs, value)
}

fn function_close(p: &mut PegBuilder) -> ParserId {
    let lit = p.literal("</function>");
    p.atomic_tag(Tag::ToolClose, lit)
}

/// Grammar accepting any of the call spellings, plus common wrappers.
fn build_grammar(
    tools: &[FunctionTool],
    parallel: bool,
    thinking_forced_open: bool,
) -> Result<(String, Vec<GrammarTrigger>)> {
    let mut builder = SchemaGrammarBuilder::new(JsonSchemaOptions::default());
    let mut triggers = vec![GrammarTrigger::Word("<tool_call>".to_string())];
    let mut tool_rules = Vec::new();
    let mut tool_call_alts = Vec::new();
    let mut escaped_names = Vec::new();

    for tool in tools {
        let name = tool.name.as_str();
        builder.resolve_refs(&tool.parameters)?;
        tool_rules.push(builder.add_schema(
            &format!("{}-call", name),
            &json!({
                "type": "object",
                "properties": {
                    "name": {"const": name},
                    "arguments": rebase_refs(&tool.parameters, "/properties/arguments"),
                },
                "required": ["name", "arguments"],
            }),
        )?);
        let args = builder.add_schema(&format!("{}-args", name), &tool.parameters)?;
        tool_call_alts.push(builder.add_rule(
            &format!("{}-function-tag", name),
            &format!(
                r#""<function" ( {} | {} ) ">" space {} "</function>" space"#,
                quote_literal(&format!("={}", name)),
                quote_literal(&format!(" name=\"{}\"", name)),
                args
            ),
        ));

        triggers.push(GrammarTrigger::Word(format!("<function={}>", name)));
        let escaped = fancy_regex::escape(name).into_owned();
        triggers.push(GrammarTrigger::Pattern(format!(
            r#"<function\s+name\s*=\s*"{}""#,
            escaped
        )));
        escaped_names.push(escaped);
    }

    let any_tool_call = builder.add_rule("any_tool_call", &format!("( {} ) space", tool_rules.join(" | ")));
    let wrapped: Vec<String> = std::iter::once(any_tool_call.clone())
        .chain(
            CALL_WRAPPERS
                .iter()
                .map(|tag| format!(r#""<{tag}>" space {any_tool_call} "</{tag}>""#)),
        )
        .collect();
    let wrappable = builder.add_rule("wrappable_tool_call", &format!("( {} ) space", wrapped.join(" | ")));
    tool_call_alts.push(wrappable.clone());
    tool_call_alts.push(format!(
        r#"( "```\n" | "```json\n" | "```xml\n" ) space {} space "```" space"#,
        wrappable
    ));
    let tool_call = builder.add_rule("tool_call", &tool_call_alts.join(" | "));

    let prefix = if thinking_forced_open { r#"( "</think>" space )? "# } else { "" };
    let calls = if parallel { format!("( {} )+", tool_call) } else { tool_call };
    builder.add_rule("root", &format!("{}{}", prefix, calls));

    let reasoning = if thinking_forced_open {
        r"[\s\S]*?(</think>\s*)"
    } else {
        r"(?:<think>[\s\S]*?</think>\s*)?"
    };
    triggers.push(GrammarTrigger::PatternFull(format!(
        concat!(
            r#"{}\s*((?:<tool_call>|<function|(?:```(?:json|xml)?\n\s*)?(?:<function_call>|<tools>|<xml><json>|<response>)?"#,
            r#"\s*\{{\s*"name"\s*:\s*"(?:{})"))[\s\S]*"#
        ),
        reasoning,
        escaped_names.join("|")
    )));

    Ok((builder.to_ebnf(), triggers))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structured::grammar::Grammar;

    fn weather_inputs() -> ChatInputs {
        ChatInputs {
            tools: vec![json!({"type": "function", "function": {
                "name": "get_weather",
                "parameters": {"type": "object", "properties": {"city": {"type": "string"}}, "required": ["city"]}
            }})],
            ..Default::default()
        }
    }

    #[test]
    fn test_three_call_spellings() {
        let params = init(&weather_inputs()).unwrap();
        for text in [
            r#"<tool_call>{"name": "get_weather", "arguments": {"city": "Rome"}}</tool_call>"#,
            r#"<function=get_weather>{"city": "Rome"}</function>"#,
            r#"<function name="get_weather">{"city": "Rome"}</function>"#,
        ] {
            let msg = params.parser.parse(text, false).unwrap();
            assert_eq!(msg.tool_calls.len(), 1, "{}", text);
            assert_eq!(msg.tool_calls[0].name, "get_weather");
            assert_eq!(msg.tool_calls[0].arguments, r#"{"city": "Rome"}"#);
        }
    }

    #[test]
    fn test_content_before_call() {
        let params = init(&weather_inputs()).unwrap();
        let text = "Let me check.\n<tool_call>{\"name\": \"get_weather\", \"arguments\": {\"city\": \"Rome\"}}</tool_call><|im_end|>";
        let msg = params.parser.parse(text, false).unwrap();
        assert_eq!(msg.content, "Let me check.");
        assert_eq!(msg.tool_calls.len(), 1);
    }

    #[test]
    fn test_reasoning_extraction() {
        let mut inputs = weather_inputs();
        inputs.reasoning_format = ReasoningFormat::Deepseek;
        let params = init(&inputs).unwrap();
        let msg = params.parser.parse("<think>Weather query.</think>\nSure.", false).unwrap();
        assert_eq!(msg.reasoning_content, "Weather query.");
        assert_eq!(msg.content, "Sure.");

        inputs.reasoning_format = ReasoningFormat::None;
        let params = init(&inputs).unwrap();
        let msg = params.parser.parse("<think>x</think>Sure.", false).unwrap();
        assert_eq!(msg.reasoning_content, "");
    }

    #[test]
    fn test_forced_open_thinking() {
        let mut inputs = weather_inputs();
        inputs.reasoning_format = ReasoningFormat::Auto;
        inputs.prompt = "<|im_start|>assistant\n<think>\n".into();
        let params = init(&inputs).unwrap();
        assert!(params.thinking_forced_open);
        let msg = params.parser.parse("planning</think>Done.", false).unwrap();
        assert_eq!(msg.reasoning_content, "planning");
        assert_eq!(msg.content, "Done.");

        inputs.enable_thinking = false;
        let params = init(&inputs).unwrap();
        assert!(!params.thinking_forced_open);
        assert!(params.prompt.ends_with("<think>\n</think>"));
    }

    #[test]
    fn test_raw_python_code() {
        let inputs = ChatInputs {
            tools: vec![json!({"type": "function", "function": {
                "name": "python",
                "parameters": {"type": "object", "properties": {"code": {"type": "string"}}, "required": ["code"]}
            }})],
            ..Default::default()
        };
        let params = init(&inputs).unwrap();
        let msg = params
            .parser
            .parse("<function=python>print(\"hi\")\n</function>", false)
            .unwrap();
        assert_eq!(msg.tool_calls[0].arguments, r#"{"code": "print(\"hi\")"}"#);
    }

    #[test]
    fn test_grammar_and_triggers() {
        let params = init(&weather_inputs()).unwrap();
        assert!(params.grammar_lazy);
        assert!(params.grammar_triggers.contains(&GrammarTrigger::Word("<function=get_weather>".into())));
        assert!(params.grammar_triggers.contains(&GrammarTrigger::Word("<tool_call>".into())));
        let grammar: Grammar = params.grammar().unwrap().unwrap();
        assert!(grammar.is_lazy());

        let mut required = weather_inputs();
        required.tool_choice = ToolChoice::Required;
        assert!(!init(&required).unwrap().grammar_lazy);

        let mut none = weather_inputs();
        none.tool_choice = ToolChoice::None;
        let params = init(&none).unwrap();
        assert!(params.grammar.is_none());
        assert_eq!(params.parser.parse("Just text.", false).unwrap().content, "Just text.");
    }

    #[test]
    fn test_content_only_without_tools() {
        let params = init(&ChatInputs::default()).unwrap();
        assert!(params.grammar.is_none());
        let msg = params.parser.parse("Hello<|im_end|>", false).unwrap();
        assert_eq!(msg.content, "Hello");
        assert_eq!(params.parser.parse("", false).unwrap().content, "");
    }
}
