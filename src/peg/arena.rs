use std::sync::Arc;

use anyhow::{Result, bail};
use rustc_hash::FxHashMap;
use serde::Serialize;
use serde_json::Value;

use crate::structured::compiled_grammar::CompiledGrammar;
use crate::structured::regex::class_char;

/// Index of a node in a [`PegArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParserId(pub u32);

/// Semantic label attached to a parsed span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Tag {
    ReasoningBlock,
    Reasoning,
    Content,
    Tool,
    ToolOpen,
    ToolClose,
    ToolId,
    ToolName,
    ToolArgs,
    ToolArg,
    ToolArgOpen,
    ToolArgClose,
    ToolArgName,
    ToolArgStringValue,
    ToolArgJsonValue,
}

impl Tag {
    pub fn as_str(self) -> &'static str {
        match self {
            Tag::ReasoningBlock => "reasoning-block",
            Tag::Reasoning => "reasoning",
            Tag::Content => "content",
            Tag::Tool => "tool",
            Tag::ToolOpen => "tool-open",
            Tag::ToolClose => "tool-close",
            Tag::ToolId => "tool-id",
            Tag::ToolName => "tool-name",
            Tag::ToolArgs => "tool-args",
            Tag::ToolArg => "tool-arg",
            Tag::ToolArgOpen => "tool-arg-open",
            Tag::ToolArgClose => "tool-arg-close",
            Tag::ToolArgName => "tool-arg-name",
            Tag::ToolArgStringValue => "tool-arg-string-value",
            Tag::ToolArgJsonValue => "tool-arg-json-value",
        }
    }
}

/// A bracketed character class such as `[a-z\-]` or `[^"\\]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharClass {
    negated: bool,
    ranges: Vec<(char, char)>,
}

impl CharClass {
    /// Parse a class. The surrounding brackets are optional; a `-` at
    /// either end is literal.
    pub fn parse(spec: &str) -> Result<Self> {
        let inner = match spec.strip_prefix('[') {
            Some(rest) => match rest.strip_suffix(']') {
                Some(inner) => inner,
                None => bail!("unterminated character class: {}", spec),
            },
            None => spec,
        };
        let (negated, inner) = match inner.strip_prefix('^') {
            Some(rest) => (true, rest),
            None => (false, inner),
        };

        let mut chars = Vec::new();
        let mut it = inner.chars();
        // (char, escaped) so that `\-` never forms a range
        while let Some(c) = it.next() {
            if c != '\\' {
                chars.push((c, false));
                continue;
            }
            let esc = match it.next() {
                Some('n') => '\n',
                Some('t') => '\t',
                Some('r') => '\r',
                Some('x') => hex_char(&mut it, 2, spec)?,
                Some('u') => hex_char(&mut it, 4, spec)?,
                Some(c) => c,
                None => bail!("dangling escape in character class: {}", spec),
            };
            chars.push((esc, true));
        }

        let mut ranges = Vec::new();
        let mut i = 0;
        while i < chars.len() {
            let (lo, _) = chars[i];
            if i + 2 < chars.len() && chars[i + 1] == ('-', false) {
                let (hi, _) = chars[i + 2];
                if hi < lo {
                    bail!("inverted range {}-{} in character class: {}", lo, hi, spec);
                }
                ranges.push((lo, hi));
                i += 3;
            } else {
                ranges.push((lo, lo));
                i += 1;
            }
        }
        if ranges.is_empty() && !negated {
            bail!("empty character class: {}", spec);
        }
        Ok(Self { negated, ranges })
    }

    pub fn matches(&self, c: char) -> bool {
        self.ranges.iter().any(|&(lo, hi)| lo <= c && c <= hi) != self.negated
    }

    pub(crate) fn to_ebnf(&self) -> String {
        let mut out = String::from("[");
        if self.negated {
            out.push('^');
        }
        for &(lo, hi) in &self.ranges {
            out.push_str(&class_char(lo));
            if hi != lo {
                out.push('-');
                out.push_str(&class_char(hi));
            }
        }
        out.push(']');
        out
    }
}

fn hex_char(it: &mut std::str::Chars<'_>, n: usize, spec: &str) -> Result<char> {
    let digits: String = it.take(n).collect();
    match u32::from_str_radix(&digits, 16).ok().and_then(char::from_u32) {
        Some(c) if digits.len() == n => Ok(c),
        _ => bail!("bad hex escape in character class: {}", spec),
    }
}

/// One parser node.
#[derive(Debug, Clone)]
pub enum Node {
    Epsilon,
    /// Plain text.
    Literal(String),
    /// Text emitted as one vocabulary token. When the caller supplies token
    /// spans, the text must come from exactly that token.
    Token { text: String, id: u32 },
    Chars { class: CharClass, min: usize, max: Option<usize> },
    Sequence(Vec<ParserId>),
    /// Ordered choice; the first alternative that does not fail wins.
    Choice(Vec<ParserId>),
    Repeat { child: ParserId, min: usize, max: Option<usize> },
    /// Everything up to the first delimiter, which is not consumed.
    Until(Vec<String>),
    Rest,
    /// Any JSON value.
    Json,
    /// `child` restricted to documents valid under `schema`.
    Schema { child: ParserId, name: String, schema: Value },
    /// Reference to a named rule.
    Ref(String),
    Tag { tag: Tag, child: ParserId },
    /// Either fully matched or absent: no partial captures survive.
    Atomic(ParserId),
    /// Zero or more whitespace characters.
    Space,
}

#[derive(Debug, Clone)]
pub(crate) struct RuleDef {
    pub(crate) name: String,
    pub(crate) body: ParserId,
    pub(crate) trigger: bool,
}

/// An immutable parser program.
#[derive(Debug, Clone)]
pub struct PegArena {
    pub(crate) nodes: Vec<Node>,
    pub(crate) rules: Vec<RuleDef>,
    pub(crate) rule_index: FxHashMap<String, usize>,
    pub(crate) root: ParserId,
    /// Compiled grammars for `Schema` nodes, checked during interpretation.
    pub(crate) schema_grammars: FxHashMap<ParserId, Arc<CompiledGrammar>>,
}

impl PegArena {
    pub fn root(&self) -> ParserId {
        self.root
    }

    pub fn node(&self, id: ParserId) -> &Node {
        &self.nodes[id.0 as usize]
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Body of the named rule.
    pub fn rule(&self, name: &str) -> Option<ParserId> {
        self.rule_index.get(name).map(|&i| self.rules[i].body)
    }

    /// Names of the rules marked as triggers, in definition order.
    pub fn trigger_rules(&self) -> impl Iterator<Item = &str> + '_ {
        self.rules.iter().filter(|r| r.trigger).map(|r| r.name.as_str())
    }
}
