use std::sync::Arc;

use crate::peg::{ParseContext, ParseResult, PegArena};

use super::ChatParseError;
use super::diff::{ChatMessageDiff, compute_diffs};
use super::mapper::Mapper;
use super::message::ChatMessage;

/// A parser program plus the mapper that reads its captures.
#[derive(Debug, Clone)]
pub struct ChatParser {
    arena: Arc<PegArena>,
    mapper: Mapper,
}

impl ChatParser {
    pub fn new(arena: PegArena, mapper: Mapper) -> Self {
        Self {
            arena: Arc::new(arena),
            mapper,
        }
    }

    pub fn arena(&self) -> &PegArena {
        &self.arena
    }

    pub fn mapper(&self) -> Mapper {
        self.mapper
    }

    /// Parse `input`. With `partial`, `input` may be cut anywhere and what
    /// was confidently captured is returned; without it the whole input
    /// must match.
    pub fn parse(&self, input: &str, partial: bool) -> Result<ChatMessage, ChatParseError> {
        self.parse_context(&ParseContext::new(input, partial))
    }

    pub fn parse_context(&self, ctx: &ParseContext<'_>) -> Result<ChatMessage, ChatParseError> {
        let out = self.arena.parse(ctx);
        match out.result {
            ParseResult::Success { end } if end == ctx.input.len() => {}
            ParseResult::NeedMoreInput { .. } if ctx.partial => {}
            ParseResult::Success { end } => return Err(ChatParseError::TrailingText { position: end }),
            other => {
                return Err(ChatParseError::Mismatch {
                    position: other.end().unwrap_or(0),
                });
            }
        }
        Ok(self.mapper.map(ctx.input, &out.captures))
    }
}

/// Incremental parsing of one turn's output.
///
/// Every [`push`](Self::push) reparses the whole buffer in partial mode.
/// A parse that fails, or that would retract something already reported,
/// leaves the last good message in place.
#[derive(Debug, Clone)]
pub struct StreamingParser {
    parser: ChatParser,
    buffer: String,
    message: ChatMessage,
}

impl StreamingParser {
    pub fn new(parser: ChatParser) -> Self {
        Self {
            parser,
            buffer: String::new(),
            message: ChatMessage::assistant(),
        }
    }

    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    /// The last message reported.
    pub fn message(&self) -> &ChatMessage {
        &self.message
    }

    pub fn push(&mut self, delta: &str) -> Vec<ChatMessageDiff> {
        self.buffer.push_str(delta);
        let message = match self.parser.parse(&self.buffer, true) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!("partial parse at {} bytes kept the previous message: {}", self.buffer.len(), e);
                return Vec::new();
            }
        };
        match compute_diffs(&self.message, &message) {
            Ok(diffs) => {
                self.message = message;
                diffs
            }
            Err(e) => {
                tracing::warn!("dropping non-monotonic partial parse: {}", e);
                Vec::new()
            }
        }
    }

    /// Parse the whole output in complete mode. Returns the final message
    /// and the diffs still owed to the client.
    pub fn finish(&mut self) -> Result<(ChatMessage, Vec<ChatMessageDiff>), ChatParseError> {
        let message = self.parser.parse(&self.buffer, false)?;
        let diffs = compute_diffs(&self.message, &message)?;
        self.message = message.clone();
        Ok((message, diffs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::apply_diff;
    use crate::peg::{PegBuilder, Tag};

    /// `<think>` reasoning `</think>` then content.
    fn reasoning_parser() -> ChatParser {
        let mut p = PegBuilder::new();
        let open = p.literal("<think>");
        let body = p.until("</think>");
        let reasoning = p.tag(Tag::Reasoning, body);
        let close = p.literal("</think>");
        let block = p.sequence(vec![open, reasoning, close]);
        let block = p.optional(block);
        let sp = p.space();
        let rest = p.rest();
        let content = p.tag(Tag::Content, rest);
        let root = p.sequence(vec![block, sp, content]);
        p.set_root(root);
        ChatParser::new(p.build().unwrap(), Mapper::Base)
    }

    #[test]
    fn test_complete_parse() {
        let msg = reasoning_parser().parse("<think>hmm</think>\nAnswer.", false).unwrap();
        assert_eq!(msg.reasoning_content, "hmm");
        assert_eq!(msg.content, "Answer.");
    }

    #[test]
    fn test_unclosed_reasoning_is_content() {
        let msg = reasoning_parser().parse("<think>hmm", false).unwrap();
        assert_eq!(msg.reasoning_content, "");
        assert_eq!(msg.content, "<think>hmm");
    }

    #[test]
    fn test_complete_parse_rejects_truncation() {
        let mut p = PegBuilder::new();
        let lit = p.literal("hello");
        p.set_root(lit);
        let parser = ChatParser::new(p.build().unwrap(), Mapper::Base);
        assert!(matches!(parser.parse("hel", false), Err(ChatParseError::Mismatch { .. })));
        assert!(parser.parse("hel", true).is_ok());
    }

    #[test]
    fn test_trailing_text() {
        let mut p = PegBuilder::new();
        let a = p.literal("a");
        p.set_root(a);
        let parser = ChatParser::new(p.build().unwrap(), Mapper::Base);
        assert_eq!(
            parser.parse("ab", false).unwrap_err(),
            ChatParseError::TrailingText { position: 1 }
        );
        assert!(parser.parse("a", true).is_ok());
    }

    #[test]
    fn test_streaming_merges_to_final() {
        let text = "<think>step one</think>The answer is 4.";
        let mut stream = StreamingParser::new(reasoning_parser());
        let mut merged = ChatMessage::assistant();
        for (i, c) in text.char_indices() {
            for d in stream.push(&text[i..i + c.len_utf8()]) {
                apply_diff(&mut merged, &d);
            }
        }
        let (final_msg, rest) = stream.finish().unwrap();
        for d in &rest {
            apply_diff(&mut merged, d);
        }
        assert_eq!(merged, final_msg);
        assert_eq!(final_msg.reasoning_content, "step one");
        assert_eq!(final_msg.content, "The answer is 4.");
    }

    #[test]
    fn test_streaming_keeps_last_good_message() {
        let mut p = PegBuilder::new();
        let lit = p.literal("hello");
        let content = p.tag(Tag::Content, lit);
        p.set_root(content);
        let mut stream = StreamingParser::new(ChatParser::new(p.build().unwrap(), Mapper::Base));

        assert_eq!(stream.push("hel")[0].content_delta, "hel");
        assert_eq!(stream.push("lo")[0].content_delta, "lo");
        assert!(stream.push(" world").is_empty());
        assert_eq!(stream.message().content, "hello");
        assert!(stream.finish().is_err());
    }

    #[test]
    fn test_streaming_never_adopts_shorter_text() {
        // "abc!" is all content; anything else keeps only the "a"
        let mut p = PegBuilder::new();
        let abc = p.literal("abc");
        let long = p.tag(Tag::Content, abc);
        let bang = p.literal("!");
        let first = p.sequence(vec![long, bang]);
        let a = p.literal("a");
        let short = p.tag(Tag::Content, a);
        let rest = p.rest();
        let second = p.sequence(vec![short, rest]);
        let root = p.choice(vec![first, second]);
        p.set_root(root);
        let mut stream = StreamingParser::new(ChatParser::new(p.build().unwrap(), Mapper::Base));

        assert_eq!(stream.push("abc")[0].content_delta, "abc");
        assert!(stream.push("d").is_empty());
        assert_eq!(stream.message().content, "abc");
        assert!(matches!(stream.finish(), Err(ChatParseError::InvalidDiff(_))));
    }
}
