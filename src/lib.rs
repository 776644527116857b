//! Structured output for LLM inference.
//!
//! Two halves share one grammar notation:
//!
//! - [`structured`] constrains sampling: grammars (EBNF, JSON Schema, regex)
//!   compiled into a pushdown matcher that filters the vocabulary per token,
//!   optionally activated lazily by trigger words, patterns or token ids.
//! - [`peg`] and [`chat`] recover typed chat messages from generated text,
//!   tolerating truncated output while streaming, and emit monotonic diffs.
//!
//! [`dialect`] ties both together per model family: one parser program and
//! one grammar built from the active tools and options of a turn.

pub mod chat;
pub mod dialect;
pub mod peg;
pub mod structured;
