//! Parser combinators for generated chat output.
//!
//! A program is an arena of nodes built with [`PegBuilder`]. The same
//! program serves two purposes:
//!
//! - **Interpretation** ([`PegArena::parse`]): run against a complete or
//!   truncated buffer, yielding a [`ParseResult`] and the tagged spans
//!   ([`Capture`]) the chat mappers turn into messages.
//! - **Lowering** ([`PegArena::to_grammar`]): emit grammar text that
//!   accepts the same language, plus trigger words for lazy grammars.
//!
//! ```rust
//! use pie_structured::peg::{PegBuilder, ParseContext, Tag};
//!
//! let mut p = PegBuilder::new();
//! let open = p.literal("<think>");
//! let body = p.until("</think>");
//! let reasoning = p.tag(Tag::Reasoning, body);
//! let close = p.literal("</think>");
//! let root = p.sequence(vec![open, reasoning, close]);
//! p.set_root(root);
//! let arena = p.build().unwrap();
//!
//! let out = arena.parse(&ParseContext::new("<think>hmm", true));
//! assert!(out.result.need_more_input());
//! assert_eq!(out.captures[0].text("<think>hmm"), "hmm");
//! ```

mod arena;
mod builder;
mod lower;
mod parse;

pub use arena::{CharClass, Node, ParserId, PegArena, Tag};
pub use builder::PegBuilder;
pub use lower::LoweredGrammar;
pub use parse::{Capture, ParseContext, ParseOutput, ParseResult, TokenSpan};
