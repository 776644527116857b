//! Builder for parser programs.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use rustc_hash::FxHashMap;
use serde_json::Value;

use super::arena::{CharClass, Node, ParserId, PegArena, RuleDef, Tag};
use crate::structured::compiled_grammar::CompiledGrammar;
use crate::structured::grammar::Grammar;
use crate::structured::json_schema::{JsonSchemaOptions, json_schema_to_ebnf};

/// Incrementally builds a [`PegArena`].
///
/// Node constructors are infallible and return ids; malformed programs
/// (bad character classes, dangling rule references, schemas that do not
/// compile) are reported by [`PegBuilder::build`].
#[derive(Default)]
pub struct PegBuilder {
    nodes: Vec<Node>,
    rules: Vec<RuleDef>,
    rule_index: FxHashMap<String, usize>,
    root: Option<ParserId>,
    errors: Vec<String>,
}

impl PegBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, node: Node) -> ParserId {
        let id = ParserId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    pub fn eps(&mut self) -> ParserId {
        self.add(Node::Epsilon)
    }

    pub fn literal(&mut self, text: &str) -> ParserId {
        self.add(Node::Literal(text.to_string()))
    }

    /// An atomic literal token. Without token spans it matches as text.
    pub fn token(&mut self, text: &str, id: u32) -> ParserId {
        self.add(Node::Token {
            text: text.to_string(),
            id,
        })
    }

    /// Between `min` and `max` characters of `class` (`None` is unbounded).
    pub fn chars(&mut self, class: &str, min: usize, max: Option<usize>) -> ParserId {
        match CharClass::parse(class) {
            Ok(class) => self.add(Node::Chars { class, min, max }),
            Err(e) => {
                self.errors.push(e.to_string());
                self.add(Node::Epsilon)
            }
        }
    }

    pub fn sequence(&mut self, children: Vec<ParserId>) -> ParserId {
        self.add(Node::Sequence(children))
    }

    pub fn choice(&mut self, alternatives: Vec<ParserId>) -> ParserId {
        self.add(Node::Choice(alternatives))
    }

    pub fn repeat(&mut self, child: ParserId, min: usize, max: Option<usize>) -> ParserId {
        self.add(Node::Repeat { child, min, max })
    }

    pub fn optional(&mut self, child: ParserId) -> ParserId {
        self.repeat(child, 0, Some(1))
    }

    pub fn zero_or_more(&mut self, child: ParserId) -> ParserId {
        self.repeat(child, 0, None)
    }

    pub fn one_or_more(&mut self, child: ParserId) -> ParserId {
        self.repeat(child, 1, None)
    }

    pub fn until(&mut self, delimiter: &str) -> ParserId {
        self.until_one_of(&[delimiter])
    }

    pub fn until_one_of(&mut self, delimiters: &[&str]) -> ParserId {
        if delimiters.iter().any(|d| d.is_empty()) {
            self.errors.push("until: empty delimiter".to_string());
        }
        self.add(Node::Until(delimiters.iter().map(|d| d.to_string()).collect()))
    }

    pub fn rest(&mut self) -> ParserId {
        self.add(Node::Rest)
    }

    pub fn json(&mut self) -> ParserId {
        self.add(Node::Json)
    }

    /// `child` (normally [`Self::json`]) constrained by a JSON schema. The
    /// schema's grammar rule is named after `name`.
    pub fn schema(&mut self, child: ParserId, name: &str, schema: &Value) -> ParserId {
        self.add(Node::Schema {
            child,
            name: name.to_string(),
            schema: schema.clone(),
        })
    }

    pub fn space(&mut self) -> ParserId {
        self.add(Node::Space)
    }

    /// Define rule `name` and return a reference to it.
    pub fn rule(&mut self, name: &str, body: ParserId) -> ParserId {
        self.define(name, body, false);
        self.rule_ref(name)
    }

    /// A rule whose leading literals become grammar trigger words, and
    /// whose union is the root of a lazy grammar.
    pub fn trigger_rule(&mut self, name: &str, body: ParserId) -> ParserId {
        self.define(name, body, true);
        self.rule_ref(name)
    }

    /// Reference a rule that may be defined later.
    pub fn rule_ref(&mut self, name: &str) -> ParserId {
        self.add(Node::Ref(name.to_string()))
    }

    fn define(&mut self, name: &str, body: ParserId, trigger: bool) {
        let def = RuleDef {
            name: name.to_string(),
            body,
            trigger,
        };
        match self.rule_index.get(name) {
            Some(&i) => self.rules[i] = def,
            None => {
                self.rule_index.insert(name.to_string(), self.rules.len());
                self.rules.push(def);
            }
        }
    }

    pub fn tag(&mut self, tag: Tag, child: ParserId) -> ParserId {
        self.add(Node::Tag { tag, child })
    }

    pub fn atomic(&mut self, child: ParserId) -> ParserId {
        self.add(Node::Atomic(child))
    }

    pub fn literal_tag(&mut self, tag: Tag, text: &str) -> ParserId {
        let lit = self.literal(text);
        self.tag(tag, lit)
    }

    pub fn atomic_tag(&mut self, tag: Tag, child: ParserId) -> ParserId {
        let tagged = self.tag(tag, child);
        self.atomic(tagged)
    }

    /// `text` tagged, followed by `terminator`. The capture only appears
    /// once the terminator has matched, so a name that is a prefix of a
    /// longer one is never reported early.
    pub fn terminated_literal_tag(&mut self, tag: Tag, text: &str, terminator: &str) -> ParserId {
        let tagged = self.literal_tag(tag, text);
        let end = self.literal(terminator);
        let seq = self.sequence(vec![tagged, end]);
        self.atomic(seq)
    }

    pub fn set_root(&mut self, root: ParserId) {
        self.root = Some(root);
    }

    pub fn build(self) -> Result<PegArena> {
        if let Some(e) = self.errors.first() {
            bail!("invalid parser: {}", e);
        }
        let root = match self.root {
            Some(root) => root,
            None => bail!("parser has no root"),
        };

        let mut schema_grammars = FxHashMap::default();
        for (i, node) in self.nodes.iter().enumerate() {
            match node {
                Node::Ref(name) if !self.rule_index.contains_key(name) => {
                    bail!("reference to undefined rule `{}`", name)
                }
                Node::Schema { name, schema, .. } => {
                    let ebnf = json_schema_to_ebnf(schema, &JsonSchemaOptions::default())
                        .with_context(|| format!("schema `{}`", name))?;
                    let grammar = Grammar::from_ebnf(&ebnf, "root")?;
                    schema_grammars.insert(ParserId(i as u32), Arc::new(CompiledGrammar::new(&grammar)?));
                }
                _ => {}
            }
        }

        check_left_recursion(&self.nodes, &self.rules, &self.rule_index)?;

        Ok(PegArena {
            nodes: self.nodes,
            rules: self.rules,
            rule_index: self.rule_index,
            root,
            schema_grammars,
        })
    }
}

/// Whether `id` can match without consuming input, given which rules can.
fn nullable(nodes: &[Node], id: ParserId, rule_index: &FxHashMap<String, usize>, rules: &[bool]) -> bool {
    let recurse = |child: ParserId| nullable(nodes, child, rule_index, rules);
    match &nodes[id.0 as usize] {
        Node::Epsilon | Node::Until(_) | Node::Rest | Node::Space => true,
        Node::Literal(text) | Node::Token { text, .. } => text.is_empty(),
        Node::Chars { min, .. } => *min == 0,
        Node::Json => false,
        Node::Sequence(children) => children.iter().all(|&c| recurse(c)),
        Node::Choice(children) => children.iter().any(|&c| recurse(c)),
        Node::Repeat { child, min, .. } => *min == 0 || recurse(*child),
        Node::Schema { child, .. } | Node::Tag { child, .. } | Node::Atomic(child) => recurse(*child),
        Node::Ref(name) => rule_index.get(name).is_some_and(|&i| rules[i]),
    }
}

/// Rules reachable from `id` before any input is consumed.
fn leftmost_rules(
    nodes: &[Node],
    id: ParserId,
    rule_index: &FxHashMap<String, usize>,
    rules: &[bool],
    out: &mut Vec<usize>,
) {
    match &nodes[id.0 as usize] {
        Node::Sequence(children) => {
            for &c in children {
                leftmost_rules(nodes, c, rule_index, rules, out);
                if !nullable(nodes, c, rule_index, rules) {
                    break;
                }
            }
        }
        Node::Choice(children) => {
            for &c in children {
                leftmost_rules(nodes, c, rule_index, rules, out);
            }
        }
        Node::Repeat { child, .. }
        | Node::Schema { child, .. }
        | Node::Tag { child, .. }
        | Node::Atomic(child) => leftmost_rules(nodes, *child, rule_index, rules, out),
        Node::Ref(name) => out.extend(rule_index.get(name)),
        _ => {}
    }
}

/// The interpreter descends into rules without consuming input, so a
/// left-recursive rule would never terminate.
fn check_left_recursion(nodes: &[Node], defs: &[RuleDef], rule_index: &FxHashMap<String, usize>) -> Result<()> {
    let mut rules = vec![false; defs.len()];
    loop {
        let mut changed = false;
        for (i, def) in defs.iter().enumerate() {
            if !rules[i] && nullable(nodes, def.body, rule_index, &rules) {
                rules[i] = true;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    let edges: Vec<Vec<usize>> = defs
        .iter()
        .map(|def| {
            let mut out = Vec::new();
            leftmost_rules(nodes, def.body, rule_index, &rules, &mut out);
            out
        })
        .collect();

    // 0 = unvisited, 1 = on the current path, 2 = done
    let mut state = vec![0u8; defs.len()];
    for start in 0..defs.len() {
        if state[start] != 0 {
            continue;
        }
        let mut stack = vec![(start, 0usize)];
        state[start] = 1;
        while let Some(&(rule, next)) = stack.last() {
            let Some(&target) = edges[rule].get(next) else {
                state[rule] = 2;
                stack.pop();
                continue;
            };
            if let Some(top) = stack.last_mut() {
                top.1 += 1;
            }
            match state[target] {
                0 => {
                    state[target] = 1;
                    stack.push((target, 0));
                }
                1 => bail!("rule `{}` is left-recursive", defs[target].name),
                _ => {}
            }
        }
    }
    Ok(())
}
