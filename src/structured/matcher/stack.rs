//! Pushdown stacks over the compiled rule table.
//!
//! A stack is a list of positions; the top is the element about to be
//! matched, everything below is the continuation to resume once the rule on
//! top finishes. An empty stack means the root rule has been matched.

use rustc_hash::FxHashSet;
use smallvec::SmallVec;

use super::MatcherError;
use crate::structured::compiled_grammar::{CompiledGrammar, Element};

/// A position inside a rule's element vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct Pos {
    pub(crate) rule: u32,
    pub(crate) idx: u32,
}

pub(crate) type Stack = SmallVec<[Pos; 8]>;

#[inline]
fn elem(g: &CompiledGrammar, pos: Pos) -> Element {
    g.rules[pos.rule as usize][pos.idx as usize]
}

#[inline]
fn next(pos: Pos) -> Pos {
    Pos { rule: pos.rule, idx: pos.idx + 1 }
}

/// Initial stacks: one per alternative of the root rule.
pub(crate) fn initial_stacks(g: &CompiledGrammar) -> Vec<Stack> {
    let mut stacks = Vec::new();
    for start in alternative_starts(g, g.root) {
        let mut stack = Stack::new();
        if !elem(g, start).is_end_of_sequence() {
            stack.push(start);
        }
        advance_stack(g, stack, &mut stacks);
    }
    stacks
}

fn alternative_starts(g: &CompiledGrammar, rule: u32) -> impl Iterator<Item = Pos> + '_ {
    let elems = &g.rules[rule as usize];
    std::iter::once(0)
        .chain(
            elems
                .iter()
                .enumerate()
                .filter(|(_, e)| **e == Element::Alt)
                .map(|(i, _)| i + 1),
        )
        .map(move |idx| Pos { rule, idx: idx as u32 })
}

/// Expand rule references at the top of `stack` until every resulting stack
/// is empty or has a terminal on top, and add those to `out`.
///
/// A reference at the end of its sequence does not keep a continuation,
/// so tail recursion does not grow the stack.
pub(crate) fn advance_stack(g: &CompiledGrammar, stack: Stack, out: &mut Vec<Stack>) {
    let mut todo = vec![stack];
    let mut seen: FxHashSet<Stack> = FxHashSet::default();

    while let Some(stack) = todo.pop() {
        if !seen.insert(stack.clone()) {
            continue;
        }
        let Some(&top) = stack.last() else {
            if !out.contains(&stack) {
                out.push(stack);
            }
            continue;
        };
        match elem(g, top) {
            Element::RuleRef(rule) => {
                let cont = next(top);
                for start in alternative_starts(g, rule) {
                    let mut next_stack: Stack = stack[..stack.len() - 1].into();
                    if !elem(g, cont).is_end_of_sequence() {
                        next_stack.push(cont);
                    }
                    if !elem(g, start).is_end_of_sequence() {
                        next_stack.push(start);
                    }
                    todo.push(next_stack);
                }
            }
            e if e.is_char() => {
                if !out.contains(&stack) {
                    out.push(stack);
                }
            }
            // End/Alt never sit on top; range continuations are skipped by match_char
            _ => {}
        }
    }
}

/// Does the class starting at `pos` accept `cp`? Returns the position after
/// the class.
pub(crate) fn match_char(g: &CompiledGrammar, pos: Pos, cp: u32) -> (bool, Pos) {
    let elems = &g.rules[pos.rule as usize];
    let mut i = pos.idx as usize;
    let head = elems[i];
    if head == Element::CharAny {
        return (true, next(pos));
    }
    let positive = matches!(head, Element::Char(_));
    let mut found = false;
    loop {
        if let Element::CharRngUpper(hi) = elems[i + 1] {
            found = found || (elems[i].value() <= cp && cp <= hi);
            i += 2;
        } else {
            found = found || elems[i].value() == cp;
            i += 1;
        }
        if !matches!(elems[i], Element::CharAlt(_)) {
            break;
        }
    }
    (found == positive, Pos { rule: pos.rule, idx: i as u32 })
}

/// Could some codepoint starting with the pending bytes of `partial` be
/// accepted by the class at `pos`?
pub(crate) fn match_partial_char(g: &CompiledGrammar, pos: Pos, partial: PartialUtf8) -> bool {
    let elems = &g.rules[pos.rule as usize];
    let mut i = pos.idx as usize;
    let head = elems[i];
    if head == Element::CharAny {
        return true;
    }
    let positive = matches!(head, Element::Char(_));
    let n_remain = partial.n_remain as u32;
    // a 7-bit char split across 2 bytes is an overlong encoding
    if n_remain == 1 && partial.value < 2 {
        return false;
    }
    let mut low = partial.value << (n_remain * 6);
    let high = low | ((1 << (n_remain * 6)) - 1);
    if low == 0 {
        low = match n_remain {
            2 => 1 << 11,
            3 => 1 << 16,
            _ => low,
        };
    }
    loop {
        if let Element::CharRngUpper(hi) = elems[i + 1] {
            if elems[i].value() <= high && low <= hi {
                return positive;
            }
            i += 2;
        } else {
            let v = elems[i].value();
            if low <= v && v <= high {
                return positive;
            }
            i += 1;
        }
        if !matches!(elems[i], Element::CharAlt(_)) {
            break;
        }
    }
    !positive
}

/// Advance every stack by one codepoint. Stacks that cannot take it drop out.
pub(crate) fn accept_char(g: &CompiledGrammar, stacks: &[Stack], cp: u32) -> Vec<Stack> {
    let mut out = Vec::new();
    for stack in stacks {
        let Some(&top) = stack.last() else { continue };
        let (ok, after) = match_char(g, top, cp);
        if !ok {
            continue;
        }
        let mut next_stack: Stack = stack[..stack.len() - 1].into();
        if !elem(g, after).is_end_of_sequence() {
            next_stack.push(after);
        }
        advance_stack(g, next_stack, &mut out);
    }
    out
}

/// Whether some stack can still consume a codepoint starting with the
/// pending bytes.
pub(crate) fn partial_viable(g: &CompiledGrammar, stacks: &[Stack], partial: PartialUtf8) -> bool {
    partial.n_remain == 0
        || stacks
            .iter()
            .any(|s| s.last().is_some_and(|&top| match_partial_char(g, top, partial)))
}

// ---------------------------------------------------------------------------
// UTF-8 decoding across token boundaries
// ---------------------------------------------------------------------------

/// Decoder state for a codepoint whose bytes straddle tokens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub(crate) struct PartialUtf8 {
    /// Bits accumulated so far.
    pub(crate) value: u32,
    /// Continuation bytes still expected.
    pub(crate) n_remain: u8,
}

/// Decode `src` on top of a pending partial sequence, appending completed
/// codepoints to `out`.
pub(crate) fn decode_utf8(
    src: &[u8],
    partial: PartialUtf8,
    out: &mut SmallVec<[u32; 8]>,
) -> Result<PartialUtf8, MatcherError> {
    let PartialUtf8 { mut value, mut n_remain } = partial;
    for &byte in src {
        if n_remain > 0 {
            if byte & 0xC0 != 0x80 {
                return Err(MatcherError::InvalidUtf8);
            }
            value = (value << 6) | (byte & 0x3F) as u32;
            n_remain -= 1;
        } else {
            let (len, mask) = match byte {
                0x00..=0x7F => (1u8, 0x7Fu8),
                0xC0..=0xDF => (2, 0x1F),
                0xE0..=0xEF => (3, 0x0F),
                0xF0..=0xF7 => (4, 0x07),
                _ => return Err(MatcherError::InvalidUtf8),
            };
            value = (byte & mask) as u32;
            n_remain = len - 1;
        }
        if n_remain == 0 {
            out.push(value);
            value = 0;
        }
    }
    Ok(PartialUtf8 { value, n_remain })
}
