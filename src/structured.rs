//! Grammar-guided LLM token generation.
//!
//! This constrains language model output to follow formal grammars
//! (EBNF, JSON Schema, regex). A grammar is lowered into a flat rule table and
//! run as a set of pushdown stacks; each sampling step asks the matcher which
//! vocabulary entries keep at least one stack alive.
//!
//! # Usage
//!
//! The typical flow is:
//!
//! 1. **Create a grammar** from EBNF, JSON Schema, or regex
//! 2. **Build a tokenizer** from your LLM's vocabulary
//! 3. **Create a matcher** (compiles the grammar into a rule table)
//! 4. **Loop**: `fill_next_token_bitmask` → mask logits → sample → `accept_token`
//!
//! ```rust
//! use std::sync::Arc;
//! use pie_structured::structured::bitmask;
//! use pie_structured::structured::grammar::Grammar;
//! use pie_structured::structured::matcher::GrammarMatcher;
//! use pie_structured::structured::tokenizer::{TokenizerInfo, VocabType};
//!
//! let grammar = Arc::new(
//!     Grammar::from_ebnf(r#"root ::= "yes" | "no""#, "root").unwrap()
//! );
//!
//! let vocab: Vec<String> = vec!["yes".into(), "no".into(), "maybe".into()];
//! let tokenizer = Arc::new(
//!     TokenizerInfo::new(&vocab, VocabType::Raw, None).unwrap()
//! );
//!
//! let mut matcher = GrammarMatcher::new(grammar, tokenizer, vec![]).unwrap();
//!
//! let mut bm = vec![0u32; bitmask::bitmask_size(3)];
//! matcher.fill_next_token_bitmask(&mut bm).unwrap();
//!
//! assert!(bitmask::get_bit(&bm, 0));  // "yes" allowed
//! assert!(bitmask::get_bit(&bm, 1));  // "no" allowed
//! assert!(!bitmask::get_bit(&bm, 2)); // "maybe" blocked
//!
//! matcher.accept_token(0).unwrap();
//! assert!(matcher.is_complete());
//! ```
//!
//! # Lazy grammars
//!
//! A grammar marked lazy leaves sampling unconstrained until one of its
//! triggers shows up in the generated text. The matched suffix is replayed
//! into the grammar and constraining starts from there.
//!
//! ```rust
//! use std::sync::Arc;
//! use pie_structured::structured::grammar::{Grammar, GrammarTrigger};
//! use pie_structured::structured::matcher::GrammarMatcher;
//! use pie_structured::structured::tokenizer::{TokenizerInfo, VocabType};
//!
//! let grammar = Grammar::from_ebnf(r#"root ::= "<call>" [a-z]+ "</call>""#, "root")
//!     .unwrap()
//!     .with_triggers(true, vec![GrammarTrigger::Word("<call>".into())]);
//! let vocab: Vec<String> = ["hi ", "<call>", "abc", "</call>"].iter().map(|s| s.to_string()).collect();
//! let tokenizer = Arc::new(TokenizerInfo::new(&vocab, VocabType::Raw, None).unwrap());
//!
//! let mut matcher = GrammarMatcher::new(Arc::new(grammar), tokenizer, vec![]).unwrap();
//! matcher.accept_token(0).unwrap();   // unconstrained
//! assert!(matcher.is_awaiting_trigger());
//! matcher.accept_token(1).unwrap();   // trigger fires
//! assert!(!matcher.is_awaiting_trigger());
//! ```
//!
//! # JSON Schema
//!
//! ```rust
//! use pie_structured::structured::json_schema::{json_schema_to_grammar, JsonSchemaOptions};
//!
//! let grammar = json_schema_to_grammar(r#"{
//!     "type": "object",
//!     "properties": {
//!         "name": {"type": "string"},
//!         "age": {"type": "integer"}
//!     },
//!     "required": ["name", "age"]
//! }"#, &JsonSchemaOptions::default()).unwrap();
//! ```
//!
//! # Regex
//!
//! ```rust
//! use pie_structured::structured::regex::regex_to_grammar;
//!
//! let grammar = regex_to_grammar(r"[a-z]+@[a-z]+\.[a-z]{2,4}").unwrap();
//! ```
//!
//! # Modules
//!
//! - [`grammar`] -- Core grammar types and construction (EBNF, builder, triggers)
//! - [`json_schema`] -- JSON Schema to grammar conversion
//! - [`regex`] -- Regex to grammar conversion
//! - [`tokenizer`] -- Tokenizer vocabulary handling
//! - [`compiled_grammar`] -- Flat rule table consumed by the matcher
//! - [`matcher`] -- Runtime matcher (accept tokens, candidate ranges, bitmasks)
//! - [`bitmask`] -- Token bitmask utilities

pub mod bitmask;
pub mod compiled_grammar;
pub mod grammar;
pub mod json_schema;
pub mod matcher;
pub mod regex;
pub mod tokenizer;
