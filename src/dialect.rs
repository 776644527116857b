//! Per-model chat formats.
//!
//! An adapter turns the options of one turn ([`ChatInputs`]) into
//! everything generation needs ([`ChatParams`]): the prompt, a parser for
//! the output, and optionally a grammar with its lazy triggers. Which
//! adapter runs is decided once per turn by an ordered predicate table.
//!
//! ```rust
//! use pie_structured::dialect::{ChatFormat, ChatInputs, init_chat_params};
//! use serde_json::json;
//!
//! let inputs: ChatInputs = serde_json::from_value(json!({
//!     "tools": [{"type": "function", "function": {
//!         "name": "get_time",
//!         "parameters": {"type": "object", "properties": {}}
//!     }}],
//!     "template_source": "{% for t in tools %}<tool_call>{% endfor %}"
//! })).unwrap();
//!
//! let params = init_chat_params(&inputs).unwrap();
//! assert_eq!(params.format, ChatFormat::Hermes2Pro);
//! assert!(params.grammar_lazy);
//! ```

mod content_only;
mod generic;
mod hermes;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::chat::{ChatParser, StreamingParser};
use crate::peg::PegArena;
use crate::structured::grammar::{Grammar, GrammarTrigger};
use crate::structured::json_schema::JsonSchemaOptions;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolChoice {
    #[default]
    Auto,
    Required,
    None,
}

/// Whether and how reasoning is split out of the content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningFormat {
    #[default]
    None,
    Auto,
    Deepseek,
}

/// Options of one turn.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChatInputs {
    /// OpenAI-style tool definitions.
    pub tools: Vec<Value>,
    pub tool_choice: ToolChoice,
    pub parallel_tool_calls: bool,
    /// Response format for plain replies.
    pub json_schema: Option<Value>,
    pub reasoning_format: ReasoningFormat,
    pub enable_thinking: bool,
    /// The prompt as rendered by the template engine.
    pub prompt: String,
    /// Template text; only inspected to pick the format.
    pub template_source: String,
}

impl Default for ChatInputs {
    fn default() -> Self {
        Self {
            tools: Vec::new(),
            tool_choice: ToolChoice::Auto,
            parallel_tool_calls: false,
            json_schema: None,
            reasoning_format: ReasoningFormat::None,
            enable_thinking: true,
            prompt: String::new(),
            template_source: String::new(),
        }
    }
}

impl ChatInputs {
    pub fn has_tools(&self) -> bool {
        !self.tools.is_empty()
    }

    /// The function tools, in order. Other tool kinds are skipped.
    pub fn function_tools(&self) -> Result<Vec<FunctionTool>> {
        let mut out = Vec::new();
        for tool in &self.tools {
            let kind = tool.get("type").and_then(Value::as_str).unwrap_or("function");
            if kind != "function" {
                tracing::debug!("skipping tool of type `{}`", kind);
                continue;
            }
            let function = tool.get("function").context("function tool without a `function` object")?;
            let parsed: FunctionTool =
                serde_json::from_value(function.clone()).context("malformed function tool")?;
            if parsed.name.is_empty() {
                bail!("function tool with an empty name");
            }
            out.push(parsed);
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FunctionTool {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "empty_parameters")]
    pub parameters: Value,
}

fn empty_parameters() -> Value {
    json!({"type": "object", "properties": {}})
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatFormat {
    ContentOnly,
    Generic,
    Hermes2Pro,
}

impl ChatFormat {
    pub fn name(self) -> &'static str {
        match self {
            ChatFormat::ContentOnly => "Content-only",
            ChatFormat::Generic => "Generic",
            ChatFormat::Hermes2Pro => "Hermes 2 Pro",
        }
    }
}

/// Everything one turn needs to generate and parse.
#[derive(Debug, Clone)]
pub struct ChatParams {
    pub format: ChatFormat,
    pub prompt: String,
    pub parser: ChatParser,
    /// Grammar text rooted at `root`, when output is constrained.
    pub grammar: Option<String>,
    pub grammar_lazy: bool,
    pub grammar_triggers: Vec<GrammarTrigger>,
    /// Special tokens the format relies on; keep them in the output.
    pub preserved_tokens: Vec<String>,
    pub additional_stops: Vec<String>,
    /// The prompt already opened a reasoning block.
    pub thinking_forced_open: bool,
}

impl ChatParams {
    fn new(format: ChatFormat, prompt: String, parser: ChatParser) -> Self {
        Self {
            format,
            prompt,
            parser,
            grammar: None,
            grammar_lazy: false,
            grammar_triggers: Vec::new(),
            preserved_tokens: Vec::new(),
            additional_stops: Vec::new(),
            thinking_forced_open: false,
        }
    }

    /// The grammar with its lazy metadata, ready for a matcher.
    pub fn grammar(&self) -> Result<Option<Grammar>> {
        let Some(text) = &self.grammar else {
            return Ok(None);
        };
        let grammar = Grammar::from_ebnf(text, "root")?;
        Ok(Some(grammar.with_triggers(self.grammar_lazy, self.grammar_triggers.clone())))
    }

    pub fn streaming_parser(&self) -> StreamingParser {
        StreamingParser::new(self.parser.clone())
    }
}

/// Grammar text lowered from `arena`, rooted at `root`.
fn lowered_grammar(arena: &PegArena, lazy: bool) -> Result<(String, Vec<GrammarTrigger>)> {
    let lowered = arena.to_grammar(&JsonSchemaOptions::default(), lazy)?;
    if lowered.root != "root" {
        bail!("lowered grammar is rooted at `{}`", lowered.root);
    }
    Ok((lowered.ebnf, lowered.triggers))
}

type Predicate = fn(&ChatInputs) -> bool;

fn hermes_template(inputs: &ChatInputs) -> bool {
    inputs.template_source.contains("<tool_call>") && inputs.json_schema.is_none()
}

fn tools_with_schema(inputs: &ChatInputs) -> bool {
    inputs.has_tools() && inputs.json_schema.is_some()
}

fn no_tool_calls(inputs: &ChatInputs) -> bool {
    !inputs.has_tools() || inputs.tool_choice == ToolChoice::None
}

fn always(_: &ChatInputs) -> bool {
    true
}

/// First match wins.
const DISPATCH: &[(Predicate, ChatFormat)] = &[
    (hermes_template, ChatFormat::Hermes2Pro),
    (tools_with_schema, ChatFormat::Generic),
    (no_tool_calls, ChatFormat::ContentOnly),
    (always, ChatFormat::Generic),
];

pub fn select_format(inputs: &ChatInputs) -> ChatFormat {
    DISPATCH
        .iter()
        .find(|(applies, _)| applies(inputs))
        .map_or(ChatFormat::Generic, |&(_, format)| format)
}

/// Pick the format for `inputs` and build its parameters.
pub fn init_chat_params(inputs: &ChatInputs) -> Result<ChatParams> {
    let format = select_format(inputs);
    tracing::info!(
        "chat format: {} ({} tools, tool_choice {:?})",
        format.name(),
        inputs.tools.len(),
        inputs.tool_choice
    );
    init_format(format, inputs)
}

/// Build the parameters of a given format.
pub fn init_format(format: ChatFormat, inputs: &ChatInputs) -> Result<ChatParams> {
    match format {
        ChatFormat::ContentOnly => content_only::init(inputs),
        ChatFormat::Generic => generic::init(inputs),
        ChatFormat::Hermes2Pro => hermes::init(inputs),
    }
}
