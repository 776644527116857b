//! Lowering parser programs into grammar text.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use anyhow::{Result, anyhow, bail};
use rustc_hash::FxHashMap;

use super::arena::{Node, ParserId, PegArena};
use crate::structured::grammar::{Grammar, GrammarTrigger};
use crate::structured::json_schema::{JsonSchemaOptions, SchemaGrammarBuilder, build_repetition};
use crate::structured::regex::{class_char, quote_literal};

/// Grammar text lowered from a program, with its lazy metadata.
#[derive(Debug, Clone)]
pub struct LoweredGrammar {
    pub ebnf: String,
    pub root: String,
    pub lazy: bool,
    pub triggers: Vec<GrammarTrigger>,
}

impl LoweredGrammar {
    pub fn to_grammar(&self) -> Result<Grammar> {
        Ok(Grammar::from_ebnf(&self.ebnf, &self.root)?.with_triggers(self.lazy, self.triggers.clone()))
    }
}

impl PegArena {
    /// Lower into a fresh grammar.
    pub fn to_grammar(&self, options: &JsonSchemaOptions, lazy: bool) -> Result<LoweredGrammar> {
        let mut builder = SchemaGrammarBuilder::new(options.clone());
        let (root, triggers) = self.build_grammar(&mut builder, lazy)?;
        Ok(LoweredGrammar {
            ebnf: builder.to_ebnf(),
            root,
            lazy,
            triggers,
        })
    }

    /// Add this program's rules to `builder`, including a root rule.
    ///
    /// A non-lazy grammar is rooted at the program root. A lazy one is
    /// rooted at the union of the trigger rules, and each trigger rule's
    /// leading literal text becomes a trigger word. Returns the root rule
    /// name and the triggers.
    pub fn build_grammar(
        &self,
        builder: &mut SchemaGrammarBuilder,
        lazy: bool,
    ) -> Result<(String, Vec<GrammarTrigger>)> {
        let mut lowering = Lowering {
            arena: self,
            builder,
            rule_names: FxHashMap::default(),
            until_rules: FxHashMap::default(),
        };

        if !lazy {
            let body = lowering.expr(self.root)?;
            return Ok((lowering.builder.add_rule("root", &body), Vec::new()));
        }

        let mut alternatives = Vec::new();
        let mut triggers = Vec::new();
        for rule in self.rules.iter().filter(|r| r.trigger) {
            alternatives.push(lowering.rule(&rule.name)?);
            let words = self
                .leading_literals(rule.body, 0)
                .filter(|words| words.iter().all(|w| !w.is_empty()))
                .ok_or_else(|| anyhow!("trigger rule `{}` does not start with literal text", rule.name))?;
            for word in words {
                let trigger = GrammarTrigger::Word(word);
                if !triggers.contains(&trigger) {
                    triggers.push(trigger);
                }
            }
        }
        if alternatives.is_empty() {
            bail!("a lazy grammar needs at least one trigger rule");
        }
        let root = lowering.builder.add_rule("root", &alternatives.join(" | "));
        Ok((root, triggers))
    }

    /// Text every match of `id` must start with, one entry per branch.
    fn leading_literals(&self, id: ParserId, depth: usize) -> Option<Vec<String>> {
        if depth > 32 {
            return None;
        }
        match self.node(id) {
            Node::Literal(text) | Node::Token { text, .. } => Some(vec![text.clone()]),
            Node::Tag { child, .. } | Node::Atomic(child) | Node::Repeat { child, .. } => {
                self.leading_literals(*child, depth + 1)
            }
            Node::Ref(name) => self.leading_literals(self.rule(name)?, depth + 1),
            Node::Choice(alternatives) => {
                let mut words = Vec::new();
                for &alt in alternatives {
                    words.extend(self.leading_literals(alt, depth + 1)?);
                }
                Some(words)
            }
            Node::Sequence(children) => {
                let mut rest = children
                    .iter()
                    .skip_while(|&&c| matches!(self.node(c), Node::Space | Node::Epsilon));
                let first = *rest.next()?;
                match self.fixed_text(first) {
                    Some(mut text) => {
                        for &c in rest {
                            match self.fixed_text(c) {
                                Some(t) => text.push_str(&t),
                                None => break,
                            }
                        }
                        Some(vec![text])
                    }
                    None => self.leading_literals(first, depth + 1),
                }
            }
            _ => None,
        }
    }

    /// The only text `id` can match, if it is fixed.
    fn fixed_text(&self, id: ParserId) -> Option<String> {
        match self.node(id) {
            Node::Literal(text) | Node::Token { text, .. } => Some(text.clone()),
            Node::Tag { child, .. } | Node::Atomic(child) => self.fixed_text(*child),
            Node::Sequence(children) => children.iter().map(|&c| self.fixed_text(c)).collect(),
            _ => None,
        }
    }
}

struct Lowering<'a> {
    arena: &'a PegArena,
    builder: &'a mut SchemaGrammarBuilder,
    /// Program rule name -> grammar rule name.
    rule_names: FxHashMap<String, String>,
    until_rules: FxHashMap<Vec<String>, String>,
}

impl Lowering<'_> {
    fn expr(&mut self, id: ParserId) -> Result<String> {
        let arena = self.arena;
        Ok(match arena.node(id) {
            Node::Epsilon => r#""""#.to_string(),
            Node::Literal(text) | Node::Token { text, .. } => quote_literal(text),
            Node::Chars { class, min, max } => non_empty(build_repetition(&class.to_ebnf(), *min, *max, "")),
            Node::Sequence(children) => {
                let parts = children.iter().map(|&c| self.expr(c)).collect::<Result<Vec<_>>>()?;
                match parts.len() {
                    0 => r#""""#.to_string(),
                    1 => parts.into_iter().next().unwrap_or_default(),
                    _ => format!("( {} )", parts.join(" ")),
                }
            }
            Node::Choice(alternatives) => {
                if alternatives.is_empty() {
                    bail!("an empty choice cannot be lowered");
                }
                let parts = alternatives
                    .iter()
                    .map(|&c| self.expr(c))
                    .collect::<Result<Vec<_>>>()?;
                format!("( {} )", parts.join(" | "))
            }
            Node::Repeat { child, min, max } => {
                let inner = self.expr(*child)?;
                non_empty(build_repetition(&format!("( {} )", inner), *min, *max, ""))
            }
            Node::Until(delimiters) => self.until_rule(delimiters),
            Node::Rest => ".*".to_string(),
            Node::Json => self.builder.json_value_rule(),
            Node::Schema { name, schema, .. } => self.builder.add_schema(name, schema)?,
            Node::Ref(name) => self.rule(name)?,
            Node::Tag { child, .. } | Node::Atomic(child) => self.expr(*child)?,
            Node::Space => r"[ \t\n\r]*".to_string(),
        })
    }

    fn rule(&mut self, name: &str) -> Result<String> {
        if let Some(existing) = self.rule_names.get(name) {
            return Ok(existing.clone());
        }
        let body_id = self
            .arena
            .rule(name)
            .ok_or_else(|| anyhow!("reference to undefined rule `{}`", name))?;
        let grammar_name = self.builder.reserve_rule(name);
        self.rule_names.insert(name.to_string(), grammar_name.clone());
        let body = self.expr(body_id)?;
        self.builder.set_rule(&grammar_name, body);
        Ok(grammar_name)
    }

    /// Rules for "any text not containing a delimiter": one rule per state
    /// of the delimiters' Aho-Corasick automaton, with terminal states
    /// left out.
    fn until_rule(&mut self, delimiters: &[String]) -> String {
        if let Some(existing) = self.until_rules.get(delimiters) {
            return existing.clone();
        }
        let automaton = DelimiterAutomaton::new(delimiters);
        let base = self.builder.reserve_rule("until");
        let names: Vec<Option<String>> = (0..automaton.len())
            .map(|s| match s {
                0 => Some(base.clone()),
                _ if automaton.terminal[s] => None,
                _ => Some(self.builder.reserve_rule(&format!("{}-s{}", base, s))),
            })
            .collect();

        for (state, name) in names.iter().enumerate() {
            if let Some(name) = name {
                let body = automaton.rule_body(state, &names);
                self.builder.set_rule(name, body);
            }
        }
        self.until_rules.insert(delimiters.to_vec(), base.clone());
        base
    }
}

fn non_empty(expr: String) -> String {
    if expr.is_empty() { r#""""#.to_string() } else { expr }
}

/// Character-level Aho-Corasick automaton over the delimiters.
struct DelimiterAutomaton {
    goto: Vec<BTreeMap<char, usize>>,
    fail: Vec<usize>,
    /// A delimiter ends at this state.
    terminal: Vec<bool>,
}

impl DelimiterAutomaton {
    fn new(delimiters: &[String]) -> Self {
        let mut goto = vec![BTreeMap::new()];
        let mut terminal = vec![false];
        for delim in delimiters {
            let mut s = 0;
            for c in delim.chars() {
                s = match goto[s].get(&c) {
                    Some(&t) => t,
                    None => {
                        goto.push(BTreeMap::new());
                        terminal.push(false);
                        let t = goto.len() - 1;
                        goto[s].insert(c, t);
                        t
                    }
                };
            }
            terminal[s] = true;
        }

        let mut fail = vec![0; goto.len()];
        let mut queue: VecDeque<usize> = goto[0].values().copied().collect();
        while let Some(s) = queue.pop_front() {
            let edges: Vec<(char, usize)> = goto[s].iter().map(|(&c, &t)| (c, t)).collect();
            for (c, t) in edges {
                let mut f = fail[s];
                while f != 0 && !goto[f].contains_key(&c) {
                    f = fail[f];
                }
                fail[t] = goto[f].get(&c).copied().filter(|&x| x != t).unwrap_or(0);
                terminal[t] |= terminal[fail[t]];
                queue.push_back(t);
            }
        }

        Self { goto, fail, terminal }
    }

    fn len(&self) -> usize {
        self.goto.len()
    }

    fn next(&self, mut s: usize, c: char) -> usize {
        loop {
            if let Some(&t) = self.goto[s].get(&c) {
                return t;
            }
            if s == 0 {
                return 0;
            }
            s = self.fail[s];
        }
    }

    /// Characters with a transition somewhere along the failure chain.
    fn interesting(&self, mut s: usize) -> BTreeSet<char> {
        let mut chars: BTreeSet<char> = self.goto[s].keys().copied().collect();
        while s != 0 {
            s = self.fail[s];
            chars.extend(self.goto[s].keys().copied());
        }
        chars
    }

    fn rule_body(&self, state: usize, names: &[Option<String>]) -> String {
        let chars = self.interesting(state);
        let mut alts = vec![r#""""#.to_string()];
        for &c in &chars {
            if let Some(name) = &names[self.next(state, c)] {
                alts.push(format!("{} {}", quote_literal(c.encode_utf8(&mut [0; 4])), name));
            }
        }
        let others: String = chars.iter().map(|&c| class_char(c)).collect();
        if let Some(root) = &names[0] {
            alts.push(format!("[^{}] {}", others, root));
        }
        alts.join(" | ")
    }
}

#[cfg(test)]
mod tests {
    use super::super::builder::PegBuilder;
    use super::super::parse::ParseContext;
    use super::*;
    use crate::structured::compiled_grammar::CompiledGrammar;
    use crate::structured::matcher::MatchState;
    use serde_json::json;

    fn lower(arena: &PegArena) -> (CompiledGrammar, LoweredGrammar) {
        let lowered = arena.to_grammar(&JsonSchemaOptions::default(), false).unwrap();
        let grammar = lowered.to_grammar().unwrap();
        (CompiledGrammar::new(&grammar).unwrap(), lowered)
    }

    fn grammar_accepts(g: &CompiledGrammar, text: &str) -> bool {
        let mut state = MatchState::initial(g);
        state.advance(g, text.as_bytes()).is_ok() && state.is_complete()
    }

    fn parser_accepts(arena: &PegArena, text: &str) -> bool {
        arena.parse(&ParseContext::new(text, false)).result == crate::peg::ParseResult::Success { end: text.len() }
    }

    #[test]
    fn test_until_lowering_excludes_delimiter() {
        let mut p = PegBuilder::new();
        let body = p.until("ab");
        let end = p.literal("ab");
        let root = p.sequence(vec![body, end]);
        p.set_root(root);
        let arena = p.build().unwrap();
        let (g, _) = lower(&arena);

        for text in ["ab", "xab", "aab", "xaab", "bbab", "xabab", "abx", ""] {
            assert_eq!(grammar_accepts(&g, text), parser_accepts(&arena, text), "{:?}", text);
        }
    }

    #[test]
    fn test_until_lowering_overlapping_delimiters() {
        let mut p = PegBuilder::new();
        let body = p.until_one_of(&["<tool_call>", "<function", "oo"]);
        p.set_root(body);
        let arena = p.build().unwrap();
        let (g, _) = lower(&arena);

        assert!(grammar_accepts(&g, "hello <tool world"));
        assert!(grammar_accepts(&g, "<<func"));
        assert!(!grammar_accepts(&g, "x<function"));
        assert!(!grammar_accepts(&g, "<tool_call>"));
        assert!(!grammar_accepts(&g, "food"));
        assert!(grammar_accepts(&g, "fo od"));
    }

    #[test]
    fn test_lowering_matches_interpretation() {
        let mut p = PegBuilder::new();
        let open = p.literal("<call>");
        let sp = p.space();
        let name = p.chars("[a-z_]", 1, Some(8));
        let j = p.json();
        let args = p.schema(j, "args", &json!({"type": "object", "properties": {"n": {"type": "integer"}}, "required": ["n"]}));
        let close = p.literal("</call>");
        let call = p.sequence(vec![open, sp, name, sp, args, close]);
        let calls = p.repeat(call, 1, Some(2));
        p.set_root(calls);
        let arena = p.build().unwrap();
        let (g, lowered) = lower(&arena);
        assert!(!lowered.lazy);

        for text in [
            r#"<call>get {"n": 1}</call>"#,
            r#"<call> a {"n": 1}</call><call>b{"n":2}</call>"#,
            r#"<call>get {"n": "x"}</call>"#,
            r#"<call>GET {"n": 1}</call>"#,
            r#"<call>get {"n": 1}"#,
        ] {
            assert_eq!(grammar_accepts(&g, text), parser_accepts(&arena, text), "{:?}", text);
        }
    }

    #[test]
    fn test_lazy_lowering_derives_trigger_words() {
        let mut p = PegBuilder::new();
        let content = p.until_one_of(&["<tool_call>", "<function="]);
        let tc_open = p.literal("<tool_call>");
        let body = p.until("</tool_call>");
        let tc_close = p.literal("</tool_call>");
        let tc = p.sequence(vec![tc_open, body, tc_close]);
        let fn_open = p.literal("<function=");
        let fname = p.literal_tag(crate::peg::Tag::ToolName, "get");
        let gt = p.literal(">");
        let fn_call = p.sequence(vec![fn_open, fname, gt]);
        let alts = p.choice(vec![tc, fn_call]);
        let calls = p.trigger_rule("tool-calls", alts);
        let root = p.sequence(vec![content, calls]);
        p.set_root(root);
        let arena = p.build().unwrap();

        let lowered = arena.to_grammar(&JsonSchemaOptions::default(), true).unwrap();
        assert!(lowered.lazy);
        assert_eq!(
            lowered.triggers,
            vec![
                GrammarTrigger::Word("<tool_call>".into()),
                GrammarTrigger::Word("<function=get>".into()),
            ]
        );
        assert!(lowered.ebnf.contains("root ::= tool-calls\n"), "{}", lowered.ebnf);
        lowered.to_grammar().unwrap();
    }

    #[test]
    fn test_lazy_lowering_without_trigger_rules_fails() {
        let mut p = PegBuilder::new();
        let r = p.rest();
        p.set_root(r);
        let arena = p.build().unwrap();
        assert!(arena.to_grammar(&JsonSchemaOptions::default(), true).is_err());
    }
}
