//! Grammar matcher: pushdown stacks + token acceptance + bitmask generation.
//!
//! `GrammarMatcher` is the main runtime entry point. It:
//! - Accepts tokens/strings byte-by-byte, buffering split UTF-8 sequences
//! - Answers which vocabulary entries may come next, as sorted-vocab ranges
//!   memoised per stack
//! - Generates token bitmasks for samplers
//! - Holds lazy grammars back until a trigger shows up in the output

mod ranges;
mod stack;
mod trigger;

use std::sync::Arc;

use anyhow::Result;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use thiserror::Error;

use crate::structured::bitmask::{self, clear_bit, set_bit};
use crate::structured::compiled_grammar::CompiledGrammar;
use crate::structured::grammar::Grammar;
use crate::structured::tokenizer::TokenizerInfo;

pub use ranges::TokenRanges;

use stack::{PartialUtf8, Stack, accept_char, decode_utf8, initial_stacks, partial_viable};
use trigger::TriggerScanner;

/// Turn-time failures of the matcher.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MatcherError {
    /// No stack survives the input. The grammar and the model disagree.
    #[error("grammar exhausted: no stack accepts {at}")]
    Exhausted { at: String },
    #[error("invalid UTF-8 in token stream")]
    InvalidUtf8,
    #[error("token {0} is not in the vocabulary")]
    UnknownToken(u32),
    #[error("input after a stop token")]
    Terminated,
    #[error("stop token before the grammar is complete")]
    PrematureStop,
}

fn describe_codepoint(cp: u32) -> String {
    match char::from_u32(cp) {
        Some(c) => format!("{:?}", c),
        None => format!("U+{:04X}", cp),
    }
}

// ---------------------------------------------------------------------------
// Match state
// ---------------------------------------------------------------------------

/// Live stacks plus the bytes of a codepoint not yet complete.
#[derive(Debug, Clone)]
pub(crate) struct MatchState {
    stacks: Vec<Stack>,
    partial: PartialUtf8,
}

impl MatchState {
    pub(crate) fn initial(compiled: &CompiledGrammar) -> Self {
        Self {
            stacks: initial_stacks(compiled),
            partial: PartialUtf8::default(),
        }
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.partial.n_remain == 0 && self.stacks.iter().any(|s| s.is_empty())
    }

    /// Advance over `bytes`. On error `self` may hold a half-advanced state.
    pub(crate) fn advance(&mut self, compiled: &CompiledGrammar, bytes: &[u8]) -> Result<(), MatcherError> {
        let mut cps: SmallVec<[u32; 8]> = SmallVec::new();
        let partial = decode_utf8(bytes, self.partial, &mut cps)?;
        for cp in cps {
            self.stacks = accept_char(compiled, &self.stacks, cp);
            if self.stacks.is_empty() {
                return Err(MatcherError::Exhausted { at: describe_codepoint(cp) });
            }
        }
        if !partial_viable(compiled, &self.stacks, partial) {
            return Err(MatcherError::Exhausted {
                at: "an incomplete UTF-8 sequence".to_string(),
            });
        }
        self.partial = partial;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Grammar Matcher
// ---------------------------------------------------------------------------

/// Grammar-guided token matcher.
///
/// One matcher serves one generation. Tokens must be accepted exactly once,
/// in generation order.
pub struct GrammarMatcher {
    compiled: Arc<CompiledGrammar>,
    tokenizer_info: Arc<TokenizerInfo>,
    /// Token IDs that signal end of generation.
    stop_token_ids: Vec<u32>,
    triggers: TriggerScanner,
    state: MatchState,
    /// Lazy grammar not triggered yet; output is unconstrained.
    awaiting_trigger: bool,
    /// Output seen while awaiting a trigger.
    trigger_buffer: Vec<u8>,
    /// Whether a stop token has been accepted.
    terminated: bool,
    /// Candidate ranges per (stack, pending bytes).
    range_cache: FxHashMap<(Stack, PartialUtf8), Arc<TokenRanges>>,
}

impl GrammarMatcher {
    /// Create a new grammar matcher.
    pub fn new(
        grammar: Arc<Grammar>,
        tokenizer_info: Arc<TokenizerInfo>,
        stop_token_ids: Vec<u32>,
    ) -> Result<Self> {
        let compiled = Arc::new(CompiledGrammar::new(&grammar)?);
        Self::with_compiled(compiled, tokenizer_info, stop_token_ids)
    }

    /// Create a grammar matcher from a pre-compiled grammar.
    pub fn with_compiled(
        compiled: Arc<CompiledGrammar>,
        tokenizer_info: Arc<TokenizerInfo>,
        stop_token_ids: Vec<u32>,
    ) -> Result<Self> {
        let triggers = TriggerScanner::new(compiled.triggers())?;
        let state = MatchState::initial(&compiled);
        Ok(Self {
            awaiting_trigger: compiled.is_lazy(),
            compiled,
            tokenizer_info,
            stop_token_ids,
            triggers,
            state,
            trigger_buffer: Vec::new(),
            terminated: false,
            range_cache: FxHashMap::default(),
        })
    }

    pub fn compiled(&self) -> &CompiledGrammar {
        &self.compiled
    }

    pub fn is_awaiting_trigger(&self) -> bool {
        self.awaiting_trigger
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Whether generation may stop here. A lazy grammar that never fired
    /// imposes nothing, so it counts as complete.
    pub fn is_complete(&self) -> bool {
        self.awaiting_trigger || self.state.is_complete()
    }

    /// Back to the state right after construction. Cached ranges survive.
    pub fn reset(&mut self) {
        self.state = MatchState::initial(&self.compiled);
        self.awaiting_trigger = self.compiled.is_lazy();
        self.trigger_buffer.clear();
        self.terminated = false;
    }

    /// Accept a token by its ID. A rejected token leaves the matcher as it
    /// was before the call.
    pub fn accept_token(&mut self, token_id: u32) -> Result<(), MatcherError> {
        if self.terminated {
            return Err(MatcherError::Terminated);
        }

        if self.stop_token_ids.contains(&token_id) {
            if !self.is_complete() {
                return Err(MatcherError::PrematureStop);
            }
            self.terminated = true;
            return Ok(());
        }

        if let Some(text) = self.triggers.token_trigger(token_id) {
            if self.awaiting_trigger {
                tracing::debug!("lazy grammar triggered by token {}", token_id);
                let mut state = MatchState::initial(&self.compiled);
                state.advance(&self.compiled, text.as_bytes())?;
                self.state = state;
                self.awaiting_trigger = false;
                self.trigger_buffer.clear();
                return Ok(());
            }
            if self.tokenizer_info.decode_token(token_id).is_some_and(|b| b.is_empty()) {
                let text = text.to_string();
                return self.accept_bytes(text.as_bytes());
            }
        }

        let decoded = self
            .tokenizer_info
            .decode_token(token_id)
            .ok_or(MatcherError::UnknownToken(token_id))?;
        if decoded.is_empty() && !self.awaiting_trigger {
            return Err(MatcherError::Exhausted {
                at: format!("special token {}", token_id),
            });
        }
        let decoded = decoded.to_vec();
        self.accept_bytes(&decoded)
    }

    /// Accept a string as if it had been generated.
    pub fn accept_str(&mut self, s: &str) -> Result<(), MatcherError> {
        if self.terminated {
            return Err(MatcherError::Terminated);
        }
        self.accept_bytes(s.as_bytes())
    }

    fn accept_bytes(&mut self, bytes: &[u8]) -> Result<(), MatcherError> {
        if self.awaiting_trigger {
            return self.scan_for_trigger(bytes);
        }
        let mut state = self.state.clone();
        if let Err(e) = state.advance(&self.compiled, bytes) {
            tracing::warn!(
                "grammar rejected {:?}: {}",
                String::from_utf8_lossy(bytes),
                e
            );
            return Err(e);
        }
        self.state = state;
        Ok(())
    }

    fn scan_for_trigger(&mut self, bytes: &[u8]) -> Result<(), MatcherError> {
        let mut buffer = self.trigger_buffer.clone();
        buffer.extend_from_slice(bytes);

        let valid = match std::str::from_utf8(&buffer) {
            Ok(s) => s,
            Err(e) => {
                // a split codepoint at the end just waits for its tail
                if e.error_len().is_some() {
                    return Err(MatcherError::InvalidUtf8);
                }
                std::str::from_utf8(&buffer[..e.valid_up_to()])
                    .map_err(|_| MatcherError::InvalidUtf8)?
            }
        };

        let Some(start) = self.triggers.scan(valid) else {
            self.trigger_buffer = buffer;
            return Ok(());
        };

        tracing::debug!(
            "lazy grammar triggered at byte {} of {:?}",
            start,
            valid
        );
        let mut state = MatchState::initial(&self.compiled);
        state.advance(&self.compiled, &buffer[start..])?;
        self.state = state;
        self.awaiting_trigger = false;
        self.trigger_buffer.clear();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Candidate tokens
    // -----------------------------------------------------------------------

    /// Indices into [`TokenizerInfo::sorted_vocab`] of every entry that keeps
    /// some stack alive. While awaiting a trigger everything is a candidate.
    pub fn candidate_token_ranges(&mut self) -> TokenRanges {
        let n = self.tokenizer_info.sorted_vocab().len() as u32;
        if self.awaiting_trigger {
            return TokenRanges::from_ranges(vec![0..n]);
        }
        let partial = self.state.partial;
        let per_stack: Vec<Arc<TokenRanges>> = self
            .state
            .stacks
            .clone()
            .into_iter()
            .filter(|s| !s.is_empty())
            .map(|s| self.stack_ranges(s, partial))
            .collect();
        TokenRanges::union(per_stack.iter().map(|r| r.as_ref()))
    }

    fn stack_ranges(&mut self, stack: Stack, partial: PartialUtf8) -> Arc<TokenRanges> {
        let key = (stack, partial);
        if let Some(hit) = self.range_cache.get(&key) {
            return hit.clone();
        }
        let ranges = Arc::new(walk_sorted_vocab(
            &self.compiled,
            &self.tokenizer_info,
            MatchState {
                stacks: vec![key.0.clone()],
                partial,
            },
        ));
        self.range_cache.insert(key, ranges.clone());
        ranges
    }

    /// Fill `bitmask` with the tokens allowed next.
    ///
    /// Returns [`MatcherError::Exhausted`] when the grammar is incomplete and
    /// no token can extend it.
    pub fn fill_next_token_bitmask(&mut self, bitmask: &mut [u32]) -> Result<(), MatcherError> {
        let vocab_size = self.tokenizer_info.vocab_size();
        bitmask::clear_bitmask(bitmask);

        if self.terminated {
            return Ok(());
        }
        if self.awaiting_trigger {
            bitmask::reset_bitmask(bitmask, vocab_size);
            return Ok(());
        }

        let ranges = self.candidate_token_ranges();
        let info = self.tokenizer_info.clone();
        let sorted = info.sorted_vocab();
        let n = sorted.len() as u32;

        if ranges.len() * 2 > sorted.len() {
            bitmask::reset_bitmask(bitmask, vocab_size);
            for idx in ranges.invert(n).iter() {
                clear_bit(bitmask, sorted[idx as usize].0 as usize);
            }
            for &id in info.special_token_ids() {
                clear_bit(bitmask, id as usize);
            }
            for id in info.decoded_vocab().len()..vocab_size {
                clear_bit(bitmask, id);
            }
        } else {
            for idx in ranges.iter() {
                set_bit(bitmask, sorted[idx as usize].0 as usize);
            }
        }

        // special tokens registered as triggers may still be forced in
        let forced: Vec<(u32, String)> = self
            .triggers
            .tokens()
            .filter(|(id, _)| info.decode_token(*id).is_some_and(|b| b.is_empty()))
            .map(|(id, text)| (id, text.to_string()))
            .collect();
        for (id, text) in forced {
            let mut state = self.state.clone();
            if state.advance(&self.compiled, text.as_bytes()).is_ok() {
                set_bit(bitmask, id as usize);
            }
        }

        let complete = self.is_complete();
        for &id in &self.stop_token_ids {
            if (id as usize) < vocab_size {
                if complete {
                    set_bit(bitmask, id as usize);
                } else {
                    clear_bit(bitmask, id as usize);
                }
            }
        }

        if !complete && bitmask.iter().all(|&w| w == 0) {
            tracing::warn!("no token can extend the grammar");
            return Err(MatcherError::Exhausted {
                at: "any token in the vocabulary".to_string(),
            });
        }
        Ok(())
    }
}

/// Walk the sorted vocabulary once from `start`, reusing the state of the
/// longest prefix shared with the previous entry and skipping every entry
/// under a rejected prefix.
fn walk_sorted_vocab(
    compiled: &CompiledGrammar,
    info: &TokenizerInfo,
    start: MatchState,
) -> TokenRanges {
    let sorted = info.sorted_vocab();
    let subtree_end = info.trie_subtree_end();
    let mut out = TokenRanges::new();
    // levels[d] is the state after the first d bytes of `prev`
    let mut levels = vec![start];
    let mut prev: &[u8] = &[];

    let mut i = 0;
    while i < sorted.len() {
        let bytes = sorted[i].1.as_slice();
        let shared = prev.iter().zip(bytes).take_while(|(a, b)| a == b).count();
        levels.truncate(shared + 1);

        let mut failed_at = None;
        for d in shared..bytes.len() {
            let mut next = levels[d].clone();
            if next.advance(compiled, &bytes[d..d + 1]).is_err() {
                failed_at = Some(d);
                break;
            }
            levels.push(next);
        }

        prev = bytes;
        match failed_at {
            None => {
                out.push(i as u32);
                i += 1;
            }
            Some(d) if d + 1 == bytes.len() => i = subtree_end[i].max(i + 1),
            Some(d) => {
                let prefix = &bytes[..=d];
                i += 1 + sorted[i + 1..].partition_point(|(_, b)| b.starts_with(prefix));
            }
        }
    }
    out
}
