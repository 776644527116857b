//! Structured chat messages recovered from generated text.
//!
//! A [`ChatParser`] runs a parser program over the text generated so far
//! and maps the tagged spans into a [`ChatMessage`]. While streaming, the
//! [`StreamingParser`] reparses the whole buffer after every delta and
//! reports what changed as [`ChatMessageDiff`]s; merging the diffs in order
//! rebuilds the final message.
//!
//! ```rust
//! use pie_structured::chat::{ChatParser, Mapper, StreamingParser};
//! use pie_structured::peg::{PegBuilder, Tag};
//!
//! let mut p = PegBuilder::new();
//! let rest = p.rest();
//! let content = p.tag(Tag::Content, rest);
//! p.set_root(content);
//! let parser = ChatParser::new(p.build().unwrap(), Mapper::Base);
//!
//! let mut stream = StreamingParser::new(parser);
//! let diffs = stream.push("Hello");
//! assert_eq!(diffs[0].content_delta, "Hello");
//! let (message, _) = stream.finish().unwrap();
//! assert_eq!(message.content, "Hello");
//! ```

mod diff;
mod mapper;
mod message;
mod parser;

use thiserror::Error;

pub use diff::{ChatMessageDiff, apply_diff, compute_diffs};
pub use mapper::Mapper;
pub use message::{ChatMessage, ContentPart, ToolCall};
pub use parser::{ChatParser, StreamingParser};

/// Turn-time failures while turning text into messages.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatParseError {
    /// The final text does not follow the dialect.
    #[error("output does not match the expected format at byte {position}")]
    Mismatch { position: usize },
    /// The format matched a prefix; unparsed text follows it.
    #[error("unexpected text after byte {position}")]
    TrailingText { position: usize },
    /// Two successive messages are not monotonic.
    #[error("invalid diff: {0}")]
    InvalidDiff(String),
}
