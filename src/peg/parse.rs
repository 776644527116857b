//! Interpreter for parser programs.
//!
//! The interpreter is a recursive walk over the arena with a byte cursor
//! and a `partial` flag. Every node either succeeds, fails without leaving
//! captures behind, or (only in partial mode) reports that the input ran
//! out while it could still match.

use serde_json::Value;

use super::arena::{Node, ParserId, PegArena, Tag};
use crate::structured::matcher::MatchState;

/// Nesting limit for rule references; left-recursive programs stop here.
const MAX_DEPTH: usize = 1024;

/// Where a vocabulary token sits in the input, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenSpan {
    pub id: u32,
    pub start: usize,
    pub end: usize,
}

/// Input for one parse.
#[derive(Debug, Clone, Copy)]
pub struct ParseContext<'a> {
    pub input: &'a str,
    /// The input may be a prefix of the final output.
    pub partial: bool,
    /// Token spans sorted by start. Empty when unknown.
    pub spans: &'a [TokenSpan],
}

impl<'a> ParseContext<'a> {
    pub fn new(input: &'a str, partial: bool) -> Self {
        Self {
            input,
            partial,
            spans: &[],
        }
    }

    pub fn with_spans(mut self, spans: &'a [TokenSpan]) -> Self {
        self.spans = spans;
        self
    }

    fn span_at(&self, pos: usize) -> Option<&TokenSpan> {
        let i = self.spans.partition_point(|s| s.start < pos);
        self.spans.get(i).filter(|s| s.start == pos)
    }

    /// True when `pos` falls strictly inside a token.
    fn inside_token(&self, pos: usize) -> bool {
        let i = self.spans.partition_point(|s| s.start < pos);
        i > 0 && self.spans[i - 1].end > pos
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseResult {
    Success { end: usize },
    Fail,
    /// The input ended while the node could still match; `end` is how far
    /// the match confidently reaches.
    NeedMoreInput { end: usize },
}

impl ParseResult {
    pub fn success(self) -> bool {
        matches!(self, ParseResult::Success { .. })
    }

    pub fn fail(self) -> bool {
        self == ParseResult::Fail
    }

    pub fn need_more_input(self) -> bool {
        matches!(self, ParseResult::NeedMoreInput { .. })
    }

    pub fn end(self) -> Option<usize> {
        match self {
            ParseResult::Success { end } | ParseResult::NeedMoreInput { end } => Some(end),
            ParseResult::Fail => None,
        }
    }
}

/// A tagged span. `complete` is false when the input ran out inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capture {
    pub tag: Tag,
    pub start: usize,
    pub end: usize,
    pub complete: bool,
}

impl Capture {
    pub fn text<'a>(&self, input: &'a str) -> &'a str {
        &input[self.start..self.end]
    }
}

/// Result of a parse and the captures, in pre-order.
#[derive(Debug, Clone)]
pub struct ParseOutput {
    pub result: ParseResult,
    pub captures: Vec<Capture>,
}

impl PegArena {
    pub fn parse(&self, ctx: &ParseContext<'_>) -> ParseOutput {
        let mut interp = Interpreter {
            arena: self,
            ctx,
            captures: Vec::new(),
            depth: 0,
        };
        let result = interp.run(self.root, 0);
        ParseOutput {
            result,
            captures: interp.captures,
        }
    }
}

struct Interpreter<'a> {
    arena: &'a PegArena,
    ctx: &'a ParseContext<'a>,
    captures: Vec<Capture>,
    depth: usize,
}

impl Interpreter<'_> {
    fn run(&mut self, id: ParserId, pos: usize) -> ParseResult {
        if self.depth >= MAX_DEPTH {
            tracing::warn!("parser nesting limit reached at byte {}", pos);
            return ParseResult::Fail;
        }
        self.depth += 1;
        let mark = self.captures.len();
        let result = self.run_node(id, pos);
        if result.fail() {
            self.captures.truncate(mark);
        }
        self.depth -= 1;
        result
    }

    fn run_node(&mut self, id: ParserId, pos: usize) -> ParseResult {
        let input = self.ctx.input;
        let partial = self.ctx.partial;
        let arena = self.arena;

        match arena.node(id) {
            Node::Epsilon => ParseResult::Success { end: pos },
            Node::Literal(text) => self.literal(text, pos),
            Node::Token { text, id } => self.token(text, *id, pos),
            Node::Chars { class, min, max } => {
                let mut end = pos;
                let mut count = 0;
                for c in input[pos..].chars() {
                    if max.is_some_and(|m| count >= m) || !class.matches(c) {
                        break;
                    }
                    end += c.len_utf8();
                    count += 1;
                }
                if count >= *min {
                    ParseResult::Success { end }
                } else if partial && end == input.len() {
                    ParseResult::NeedMoreInput { end }
                } else {
                    ParseResult::Fail
                }
            }
            Node::Sequence(children) => {
                let mut cur = pos;
                for &child in children {
                    match self.run(child, cur) {
                        ParseResult::Success { end } => cur = end,
                        other => return other,
                    }
                }
                ParseResult::Success { end: cur }
            }
            Node::Choice(alternatives) => {
                for &alt in alternatives {
                    let r = self.run(alt, pos);
                    if !r.fail() {
                        return r;
                    }
                }
                ParseResult::Fail
            }
            Node::Repeat { child, min, max } => {
                let mut cur = pos;
                let mut count = 0;
                while max.is_none_or(|m| count < m) {
                    match self.run(*child, cur) {
                        ParseResult::Success { end } => {
                            count += 1;
                            if end == cur {
                                count = count.max(*min);
                                break;
                            }
                            cur = end;
                        }
                        ParseResult::Fail => break,
                        r @ ParseResult::NeedMoreInput { .. } => return r,
                    }
                }
                if count >= *min {
                    ParseResult::Success { end: cur }
                } else if partial && cur == input.len() {
                    ParseResult::NeedMoreInput { end: cur }
                } else {
                    ParseResult::Fail
                }
            }
            Node::Until(delimiters) => self.until(delimiters, pos),
            Node::Rest => {
                if partial {
                    ParseResult::NeedMoreInput { end: input.len() }
                } else {
                    ParseResult::Success { end: input.len() }
                }
            }
            Node::Json => self.json(pos),
            Node::Schema { child, .. } => {
                let r = self.run(*child, pos);
                let end = match r.end() {
                    Some(end) => end,
                    None => return r,
                };
                match arena.schema_grammars.get(&id) {
                    Some(grammar) => {
                        let mut state = MatchState::initial(grammar);
                        let viable = state.advance(grammar, input[pos..end].as_bytes()).is_ok();
                        if !viable || (r.success() && !state.is_complete()) {
                            ParseResult::Fail
                        } else {
                            r
                        }
                    }
                    None => r,
                }
            }
            Node::Ref(name) => match arena.rule(name) {
                Some(body) => self.run(body, pos),
                None => ParseResult::Fail,
            },
            Node::Tag { tag, child } => {
                let idx = self.captures.len();
                self.captures.push(Capture {
                    tag: *tag,
                    start: pos,
                    end: pos,
                    complete: false,
                });
                let r = self.run(*child, pos);
                if let Some(end) = r.end() {
                    let capture = &mut self.captures[idx];
                    capture.end = end.max(pos);
                    capture.complete = r.success();
                }
                r
            }
            Node::Atomic(child) => {
                let mark = self.captures.len();
                let r = self.run(*child, pos);
                if r.need_more_input() {
                    self.captures.truncate(mark);
                    return ParseResult::NeedMoreInput { end: pos };
                }
                r
            }
            Node::Space => {
                let rest = &input[pos..];
                let trimmed = rest.trim_start_matches([' ', '\t', '\n', '\r']);
                ParseResult::Success {
                    end: pos + rest.len() - trimmed.len(),
                }
            }
        }
    }

    fn literal(&self, text: &str, pos: usize) -> ParseResult {
        let rest = &self.ctx.input[pos..];
        if rest.starts_with(text) {
            ParseResult::Success { end: pos + text.len() }
        } else if self.ctx.partial && rest.len() < text.len() && text.starts_with(rest) {
            ParseResult::NeedMoreInput {
                end: self.ctx.input.len(),
            }
        } else {
            ParseResult::Fail
        }
    }

    fn token(&self, text: &str, id: u32, pos: usize) -> ParseResult {
        if self.ctx.spans.is_empty() {
            return self.literal(text, pos);
        }
        match self.ctx.span_at(pos) {
            Some(span) if span.id == id && span.end - span.start == text.len() => self.literal(text, pos),
            Some(_) => ParseResult::Fail,
            None if self.ctx.partial && pos == self.ctx.input.len() => ParseResult::NeedMoreInput { end: pos },
            None => ParseResult::Fail,
        }
    }

    fn until(&self, delimiters: &[String], pos: usize) -> ParseResult {
        let input = self.ctx.input;
        let mut found: Option<usize> = None;
        for delim in delimiters {
            let mut from = pos;
            while let Some(off) = input[from..].find(delim.as_str()) {
                let at = from + off;
                if found.is_some_and(|f| f <= at) {
                    break;
                }
                if !self.ctx.inside_token(at) {
                    found = Some(at);
                    break;
                }
                from = at + delim.len();
            }
        }

        match found {
            Some(at) => ParseResult::Success { end: at },
            None if !self.ctx.partial => ParseResult::Success { end: input.len() },
            None => {
                // hold back a tail that may grow into a delimiter
                let rest = &input[pos..];
                let hold = (1..=rest.len().min(longest(delimiters).saturating_sub(1)))
                    .rev()
                    .find(|&k| {
                        let cut = rest.len() - k;
                        rest.is_char_boundary(cut)
                            && delimiters.iter().any(|d| d.starts_with(&rest[cut..]))
                    })
                    .unwrap_or(0);
                ParseResult::NeedMoreInput {
                    end: input.len() - hold,
                }
            }
        }
    }

    fn json(&self, pos: usize) -> ParseResult {
        let input = self.ctx.input;
        let rest = &input[pos..];
        match rest.chars().next() {
            None if self.ctx.partial => return ParseResult::NeedMoreInput { end: pos },
            None => return ParseResult::Fail,
            Some(c) if c.is_whitespace() => return ParseResult::Fail,
            Some(_) => {}
        }

        let mut stream = serde_json::Deserializer::from_str(rest).into_iter::<Value>();
        match stream.next() {
            Some(Ok(value)) => {
                let end = pos + stream.byte_offset();
                // a number at the very end may still gain digits
                if self.ctx.partial && end == input.len() && value.is_number() {
                    ParseResult::NeedMoreInput { end }
                } else {
                    ParseResult::Success { end }
                }
            }
            Some(Err(e)) if e.is_eof() && self.ctx.partial => ParseResult::NeedMoreInput { end: input.len() },
            _ => ParseResult::Fail,
        }
    }
}

fn longest(delimiters: &[String]) -> usize {
    delimiters.iter().map(String::len).max().unwrap_or(0)
}
