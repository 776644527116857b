use anyhow::{Result, bail};
use rustc_hash::FxHashMap;

use super::{Expr, ExprId, Grammar, Rule, RuleId};

/// Programmatic grammar construction.
///
/// Rules are declared by name before or after they are referenced and
/// defined exactly once. [`GrammarBuilder::build`] rejects rules that were
/// referenced but never defined.
///
/// # Example
/// ```
/// use pie_structured::structured::grammar::builder::GrammarBuilder;
///
/// let mut b = GrammarBuilder::new();
/// let digit = b.declare("digit");
/// let digits = b.repeat(digit, 1, None);
/// b.rule("root", digits).unwrap();
/// let class = b.class(false, vec![('0' as u32, '9' as u32)]);
/// b.define(digit, class).unwrap();
/// let grammar = b.build("root").unwrap();
/// assert_eq!(grammar.to_string(), "digit ::= [0-9]\nroot ::= digit{1,}");
/// ```
#[derive(Default)]
pub struct GrammarBuilder {
    rules: Vec<Rule>,
    defined: Vec<bool>,
    exprs: Vec<Expr>,
    by_name: FxHashMap<String, RuleId>,
}

impl GrammarBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// The rule called `name`, created without a body on first use.
    pub fn declare(&mut self, name: &str) -> RuleId {
        if let Some(&id) = self.by_name.get(name) {
            return id;
        }
        let id = RuleId(self.rules.len() as u32);
        self.rules.push(Rule {
            name: name.to_string(),
            body: ExprId(u32::MAX),
        });
        self.defined.push(false);
        self.by_name.insert(name.to_string(), id);
        id
    }

    /// A new rule named `{base}_{n}` with the smallest free `n`.
    pub fn fresh(&mut self, base: &str) -> RuleId {
        let mut n = 1;
        loop {
            let name = format!("{}_{}", base, n);
            if !self.by_name.contains_key(&name) {
                return self.declare(&name);
            }
            n += 1;
        }
    }

    pub fn define(&mut self, rule: RuleId, body: ExprId) -> Result<()> {
        let i = rule.0 as usize;
        if self.defined[i] {
            bail!("rule \"{}\" defined multiple times", self.rules[i].name);
        }
        self.rules[i].body = body;
        self.defined[i] = true;
        Ok(())
    }

    /// Declare and define in one step.
    pub fn rule(&mut self, name: &str, body: ExprId) -> Result<RuleId> {
        let id = self.declare(name);
        self.define(id, body)?;
        Ok(id)
    }

    pub fn find_rule(&self, name: &str) -> Option<RuleId> {
        self.by_name.get(name).copied()
    }

    pub fn num_rules(&self) -> usize {
        self.rules.len()
    }

    fn push(&mut self, expr: Expr) -> ExprId {
        let id = ExprId(self.exprs.len() as u32);
        self.exprs.push(expr);
        id
    }

    pub fn empty(&mut self) -> ExprId {
        self.push(Expr::EmptyString)
    }

    /// `""` for empty text.
    pub fn literal(&mut self, text: &str) -> ExprId {
        match text {
            "" => self.empty(),
            _ => self.push(Expr::ByteString(text.as_bytes().to_vec())),
        }
    }

    pub fn class(&mut self, negated: bool, ranges: Vec<(u32, u32)>) -> ExprId {
        self.push(Expr::CharacterClass { negated, ranges })
    }

    /// `.`
    pub fn any(&mut self) -> ExprId {
        self.class(true, Vec::new())
    }

    pub fn reference(&mut self, rule: RuleId) -> ExprId {
        self.push(Expr::RuleRef(rule))
    }

    /// Concatenation. A single item is returned as is.
    pub fn sequence(&mut self, mut items: Vec<ExprId>) -> ExprId {
        match items.len() {
            0 => self.empty(),
            1 => items.remove(0),
            _ => self.push(Expr::Sequence(items)),
        }
    }

    /// Alternation. A single alternative is returned as is.
    pub fn choices(&mut self, mut alternatives: Vec<ExprId>) -> ExprId {
        match alternatives.len() {
            1 => alternatives.remove(0),
            _ => self.push(Expr::Choices(alternatives)),
        }
    }

    pub fn repeat(&mut self, rule: RuleId, min: u32, max: Option<u32>) -> ExprId {
        self.push(Expr::Repeat { rule, min, max })
    }

    pub(crate) fn get_expr(&self, id: ExprId) -> &Expr {
        &self.exprs[id.0 as usize]
    }

    pub fn build(self, root: &str) -> Result<Grammar> {
        let Some(root_rule) = self.find_rule(root) else {
            bail!("root rule \"{}\" not found", root);
        };
        if let Some(i) = self.defined.iter().position(|d| !d) {
            bail!("rule \"{}\" is not defined", self.rules[i].name);
        }
        Ok(Grammar {
            rules: self.rules,
            exprs: self.exprs,
            root_rule,
            lazy: false,
            triggers: Vec::new(),
        })
    }
}
