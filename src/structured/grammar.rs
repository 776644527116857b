pub mod builder;
pub mod ebnf;

use std::fmt;

use serde::{Deserialize, Serialize};

/// Index into the grammar's rule list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RuleId(pub u32);

/// Index into the grammar's expression arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExprId(pub u32);

/// A grammar rule: a named production with a body expression.
#[derive(Debug, Clone)]
pub struct Rule {
    pub name: String,
    pub body: ExprId,
}

/// A grammar expression node.
///
/// Expressions are stored in an arena (`Grammar.exprs`) and referenced by `ExprId`.
#[derive(Debug, Clone)]
pub enum Expr {
    /// The empty string `""`.
    EmptyString,

    /// A literal byte string (UTF-8 encoded).
    ByteString(Vec<u8>),

    /// A character class matching Unicode codepoint ranges, e.g. `[a-z0-9]`.
    /// When `negated` is true, matches any codepoint NOT in the ranges.
    /// A negated class with no ranges is the any-character element `.`.
    CharacterClass {
        negated: bool,
        /// Inclusive ranges of Unicode codepoints: `(lower, upper)`.
        ranges: Vec<(u32, u32)>,
    },

    /// A reference to another rule.
    RuleRef(RuleId),

    /// An ordered sequence of expressions (concatenation).
    Sequence(Vec<ExprId>),

    /// A choice between expressions (alternation / union).
    Choices(Vec<ExprId>),

    /// Bounded repetition of a rule: `rule{min, max}`.
    /// `max = None` means unbounded.
    Repeat {
        rule: RuleId,
        min: u32,
        max: Option<u32>,
    },
}

/// What activates a lazy grammar, and where in the buffered text the grammar
/// starts matching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum GrammarTrigger {
    /// Literal text. Activation starts at the start of the match.
    Word(String),
    /// First match anywhere in the buffered text. Activation starts at the
    /// first capture group, or at the match start when the pattern has none.
    Pattern(String),
    /// The whole buffered text must match. Activation starts at the first
    /// capture group, or at the start of the buffer.
    PatternFull(String),
    /// A token id. Its decoded text is handed to the grammar as-is.
    Token { token: u32, text: String },
}

/// An immutable context-free grammar.
///
/// Constructed via `GrammarBuilder` or `Grammar::from_ebnf()`.
/// Expressions are stored in a flat arena for cache efficiency.
#[derive(Debug, Clone)]
pub struct Grammar {
    pub(crate) rules: Vec<Rule>,
    pub(crate) exprs: Vec<Expr>,
    pub(crate) root_rule: RuleId,
    pub(crate) lazy: bool,
    pub(crate) triggers: Vec<GrammarTrigger>,
}

impl Grammar {
    /// Get the root rule id.
    pub fn root_rule(&self) -> RuleId {
        self.root_rule
    }

    /// Get a rule by id.
    pub fn get_rule(&self, id: RuleId) -> &Rule {
        &self.rules[id.0 as usize]
    }

    /// Get an expression by id.
    pub fn get_expr(&self, id: ExprId) -> &Expr {
        &self.exprs[id.0 as usize]
    }

    /// Number of rules in the grammar.
    pub fn num_rules(&self) -> usize {
        self.rules.len()
    }

    /// Number of expressions in the grammar.
    pub fn num_exprs(&self) -> usize {
        self.exprs.len()
    }

    /// Iterate over all rules.
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Get the root rule.
    pub fn root(&self) -> &Rule {
        self.get_rule(self.root_rule)
    }

    /// Whether sampling stays unconstrained until a trigger fires.
    pub fn is_lazy(&self) -> bool {
        self.lazy
    }

    pub fn triggers(&self) -> &[GrammarTrigger] {
        &self.triggers
    }

    /// Attach lazy-activation metadata.
    pub fn with_triggers(mut self, lazy: bool, triggers: Vec<GrammarTrigger>) -> Self {
        self.lazy = lazy;
        self.triggers = triggers;
        self
    }
}

impl fmt::Display for Grammar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, rule) in self.rules.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{} ::= ", rule.name)?;
            self.fmt_expr(f, rule.body)?;
        }
        Ok(())
    }
}

impl Grammar {
    fn fmt_expr(&self, f: &mut fmt::Formatter<'_>, id: ExprId) -> fmt::Result {
        match self.get_expr(id) {
            Expr::EmptyString => write!(f, "\"\""),
            Expr::ByteString(bytes) => {
                write!(f, "\"")?;
                for c in String::from_utf8_lossy(bytes).chars() {
                    match c {
                        '\\' => write!(f, "\\\\")?,
                        '"' => write!(f, "\\\"")?,
                        '\n' => write!(f, "\\n")?,
                        '\r' => write!(f, "\\r")?,
                        '\t' => write!(f, "\\t")?,
                        c if (c as u32) < 0x20 || c as u32 == 0x7f => {
                            write!(f, "\\x{:02x}", c as u32)?
                        }
                        c => write!(f, "{}", c)?,
                    }
                }
                write!(f, "\"")
            }
            Expr::CharacterClass { negated: true, ranges } if ranges.is_empty() => write!(f, "."),
            Expr::CharacterClass { negated, ranges } => {
                write!(f, "[")?;
                if *negated {
                    write!(f, "^")?;
                }
                for &(lo, hi) in ranges {
                    Self::fmt_char_class_char(f, lo)?;
                    if lo != hi {
                        write!(f, "-")?;
                        Self::fmt_char_class_char(f, hi)?;
                    }
                }
                write!(f, "]")
            }
            Expr::RuleRef(rule_id) => {
                write!(f, "{}", self.rules[rule_id.0 as usize].name)
            }
            Expr::Sequence(exprs) => {
                write!(f, "(")?;
                for (i, &eid) in exprs.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    self.fmt_expr(f, eid)?;
                }
                write!(f, ")")
            }
            Expr::Choices(exprs) => {
                write!(f, "(")?;
                for (i, &eid) in exprs.iter().enumerate() {
                    if i > 0 {
                        write!(f, " | ")?;
                    }
                    self.fmt_expr(f, eid)?;
                }
                write!(f, ")")
            }
            Expr::Repeat { rule, min, max } => {
                let name = &self.rules[rule.0 as usize].name;
                match max {
                    Some(max) => write!(f, "{}{{{},{}}}", name, min, max),
                    None => write!(f, "{}{{{},}}", name, min),
                }
            }
        }
    }

    fn fmt_char_class_char(f: &mut fmt::Formatter<'_>, cp: u32) -> fmt::Result {
        match cp {
            0x5c => write!(f, "\\\\"),
            0x5d => write!(f, "\\]"),
            0x5e => write!(f, "\\^"),
            0x2d => write!(f, "\\-"),
            0x09 => write!(f, "\\t"),
            0x0a => write!(f, "\\n"),
            0x0d => write!(f, "\\r"),
            0x20..=0x7e => match char::from_u32(cp) {
                Some(c) => write!(f, "{}", c),
                None => write!(f, "\\u{:04x}", cp),
            },
            cp if cp <= 0xffff => write!(f, "\\u{:04x}", cp),
            cp => write!(f, "\\U{:08x}", cp),
        }
    }
}
