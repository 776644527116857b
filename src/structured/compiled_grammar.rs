//! Flat rule table consumed by the matcher.
//!
//! `CompiledGrammar` lowers the expression arena of a [`Grammar`] into one
//! element vector per rule. Alternatives are separated by `Alt` and the rule
//! is closed by `End`; a character class is a head element (`Char`,
//! `CharNot`) followed by optional `CharRngUpper` / `CharAlt` continuations.
//! Nested choices and repetitions become synthetic rules, so every position
//! the matcher can sit on is a plain `(rule, index)` pair.

use anyhow::{Context, Result, bail};
use rustc_hash::FxHashSet;

use crate::structured::grammar::{Expr, ExprId, Grammar, GrammarTrigger};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Element {
    /// End of the rule definition.
    End,
    /// Start of an alternate definition for the rule.
    Alt,
    /// Non-terminal reference by rule index.
    RuleRef(u32),
    /// Terminal codepoint; may be followed by `CharRngUpper` / `CharAlt`.
    Char(u32),
    /// Inverse class (`[^...]`); same continuations as `Char`.
    CharNot(u32),
    /// Upper bound of a range whose lower bound is the previous element.
    CharRngUpper(u32),
    /// Additional codepoint in a class (`[ab]` is `Char(a) CharAlt(b)`).
    CharAlt(u32),
    /// Any codepoint (`.`).
    CharAny,
}

impl Element {
    pub(crate) fn is_char(self) -> bool {
        matches!(self, Element::Char(_) | Element::CharNot(_) | Element::CharAny)
    }

    pub(crate) fn is_end_of_sequence(self) -> bool {
        matches!(self, Element::End | Element::Alt)
    }

    pub(crate) fn value(self) -> u32 {
        match self {
            Element::RuleRef(v)
            | Element::Char(v)
            | Element::CharNot(v)
            | Element::CharRngUpper(v)
            | Element::CharAlt(v) => v,
            Element::End | Element::Alt | Element::CharAny => 0,
        }
    }
}

/// A grammar ready for matching. Immutable once built; share it via `Arc`
/// between matchers of independent turns.
#[derive(Debug, Clone)]
pub struct CompiledGrammar {
    pub(crate) rules: Vec<Vec<Element>>,
    pub(crate) rule_names: Vec<String>,
    pub(crate) root: u32,
    pub(crate) lazy: bool,
    pub(crate) triggers: Vec<GrammarTrigger>,
}

impl CompiledGrammar {
    pub fn num_rules(&self) -> usize {
        self.rules.len()
    }

    pub fn root(&self) -> u32 {
        self.root
    }

    pub fn rule_name(&self, rule: u32) -> &str {
        &self.rule_names[rule as usize]
    }

    /// Elements of a rule, including the trailing `End`.
    pub fn elements(&self, rule: u32) -> &[Element] {
        &self.rules[rule as usize]
    }

    pub fn find_rule(&self, name: &str) -> Option<u32> {
        self.rule_names.iter().position(|n| n == name).map(|i| i as u32)
    }

    pub fn is_lazy(&self) -> bool {
        self.lazy
    }

    pub fn triggers(&self) -> &[GrammarTrigger] {
        &self.triggers
    }

    /// Alternatives of a rule as slices, without separators.
    pub(crate) fn alternatives(&self, rule: u32) -> impl Iterator<Item = &[Element]> {
        let elems = &self.rules[rule as usize];
        let body = &elems[..elems.len().saturating_sub(1)];
        body.split(|e| *e == Element::Alt)
    }
}

// ---------------------------------------------------------------------------
// Construction
// ---------------------------------------------------------------------------

impl CompiledGrammar {
    /// Lower a grammar into the element table.
    ///
    /// Fails on invalid UTF-8 literals, empty character classes and
    /// left-recursive rules (which would loop the stack expansion).
    pub fn new(grammar: &Grammar) -> Result<Self> {
        let mut lowering = Lowering {
            grammar,
            rules: vec![Vec::new(); grammar.num_rules()],
            names: grammar.rules().iter().map(|r| r.name.clone()).collect(),
            taken: grammar.rules().iter().map(|r| r.name.clone()).collect(),
        };

        for (i, rule) in grammar.rules().iter().enumerate() {
            let alts = lowering
                .alternatives(rule.body, &rule.name)
                .with_context(|| format!("failed to compile rule '{}'", rule.name))?;
            lowering.rules[i] = encode_alternatives(alts);
        }

        let compiled = CompiledGrammar {
            rules: lowering.rules,
            rule_names: lowering.names,
            root: grammar.root_rule().0,
            lazy: grammar.is_lazy(),
            triggers: grammar.triggers().to_vec(),
        };
        compiled.check_left_recursion()?;

        tracing::debug!(
            "compiled grammar: {} source rules, {} total rules",
            grammar.num_rules(),
            compiled.num_rules()
        );
        Ok(compiled)
    }
}

fn encode_alternatives(alts: Vec<Vec<Element>>) -> Vec<Element> {
    let mut out = Vec::new();
    for (i, alt) in alts.into_iter().enumerate() {
        if i > 0 {
            out.push(Element::Alt);
        }
        out.extend(alt);
    }
    out.push(Element::End);
    out
}

struct Lowering<'g> {
    grammar: &'g Grammar,
    rules: Vec<Vec<Element>>,
    names: Vec<String>,
    taken: FxHashSet<String>,
}

impl Lowering<'_> {
    fn synthetic_rule(&mut self, owner: &str) -> u32 {
        let mut n = 1;
        let name = loop {
            let candidate = format!("{}_{}", owner, n);
            if !self.taken.contains(&candidate) {
                break candidate;
            }
            n += 1;
        };
        self.taken.insert(name.clone());
        self.names.push(name);
        self.rules.push(Vec::new());
        (self.rules.len() - 1) as u32
    }

    fn alternatives(&mut self, id: ExprId, owner: &str) -> Result<Vec<Vec<Element>>> {
        match self.grammar.get_expr(id) {
            Expr::Choices(choices) => choices
                .clone()
                .into_iter()
                .map(|c| self.sequence(c, owner))
                .collect(),
            _ => Ok(vec![self.sequence(id, owner)?]),
        }
    }

    fn sequence(&mut self, id: ExprId, owner: &str) -> Result<Vec<Element>> {
        let mut out = Vec::new();
        self.append(id, owner, &mut out)?;
        Ok(out)
    }

    fn append(&mut self, id: ExprId, owner: &str, out: &mut Vec<Element>) -> Result<()> {
        match self.grammar.get_expr(id) {
            Expr::EmptyString => {}
            Expr::ByteString(bytes) => {
                let text = std::str::from_utf8(bytes).context("string literal is not valid UTF-8")?;
                out.extend(text.chars().map(|c| Element::Char(c as u32)));
            }
            Expr::CharacterClass { negated, ranges } => {
                if ranges.is_empty() {
                    if !negated {
                        bail!("empty character class matches nothing");
                    }
                    out.push(Element::CharAny);
                    return Ok(());
                }
                for (i, &(lo, hi)) in ranges.iter().enumerate() {
                    out.push(match (i, negated) {
                        (0, false) => Element::Char(lo),
                        (0, true) => Element::CharNot(lo),
                        _ => Element::CharAlt(lo),
                    });
                    if hi != lo {
                        out.push(Element::CharRngUpper(hi));
                    }
                }
            }
            Expr::RuleRef(rule) => out.push(Element::RuleRef(rule.0)),
            Expr::Sequence(items) => {
                for item in items.clone() {
                    self.append(item, owner, out)?;
                }
            }
            Expr::Choices(choices) if choices.len() == 1 => {
                let only = choices[0];
                self.append(only, owner, out)?;
            }
            Expr::Choices(_) => {
                let alts = self.alternatives(id, owner)?;
                let rule = self.synthetic_rule(owner);
                self.rules[rule as usize] = encode_alternatives(alts);
                out.push(Element::RuleRef(rule));
            }
            &Expr::Repeat { rule, min, max } => {
                let item = Element::RuleRef(rule.0);
                out.extend(std::iter::repeat_n(item, min as usize));
                match max {
                    // item* as a tail-recursive rule: r ::= item r | ""
                    None => {
                        let star = self.synthetic_rule(owner);
                        self.rules[star as usize] =
                            encode_alternatives(vec![vec![item, Element::RuleRef(star)], vec![]]);
                        out.push(Element::RuleRef(star));
                    }
                    // item{0,n} as nested optionals: r_k ::= item r_{k-1} | ""
                    Some(max) if max > min => {
                        let mut inner: Option<u32> = None;
                        for _ in min..max {
                            let opt = self.synthetic_rule(owner);
                            let mut seq = vec![item];
                            seq.extend(inner.map(Element::RuleRef));
                            self.rules[opt as usize] = encode_alternatives(vec![seq, vec![]]);
                            inner = Some(opt);
                        }
                        out.extend(inner.map(Element::RuleRef));
                    }
                    Some(_) => {}
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Left recursion
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq, Eq)]
enum Visit {
    New,
    InProgress,
    Done,
}

impl CompiledGrammar {
    /// Rules that can derive the empty string.
    fn nullable_rules(&self) -> Vec<bool> {
        let mut nullable = vec![false; self.rules.len()];
        let mut changed = true;
        while changed {
            changed = false;
            for rule in 0..self.rules.len() {
                if nullable[rule] {
                    continue;
                }
                let derives_empty = self.alternatives(rule as u32).any(|alt| {
                    alt.iter().all(|e| match e {
                        Element::RuleRef(r) => nullable[*r as usize],
                        _ => false,
                    })
                });
                if derives_empty {
                    nullable[rule] = true;
                    changed = true;
                }
            }
        }
        nullable
    }

    fn check_left_recursion(&self) -> Result<()> {
        let nullable = self.nullable_rules();
        let mut state = vec![Visit::New; self.rules.len()];
        for rule in 0..self.rules.len() as u32 {
            self.visit_left_edges(rule, &nullable, &mut state)?;
        }
        Ok(())
    }

    fn visit_left_edges(&self, rule: u32, nullable: &[bool], state: &mut [Visit]) -> Result<()> {
        match state[rule as usize] {
            Visit::Done => return Ok(()),
            Visit::InProgress => bail!("left recursion detected in rule '{}'", self.rule_name(rule)),
            Visit::New => {}
        }
        state[rule as usize] = Visit::InProgress;
        for alt in self.alternatives(rule) {
            for elem in alt {
                let Element::RuleRef(target) = *elem else { break };
                self.visit_left_edges(target, nullable, state)?;
                if !nullable[target as usize] {
                    break;
                }
            }
        }
        state[rule as usize] = Visit::Done;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
