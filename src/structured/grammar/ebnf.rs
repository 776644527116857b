//! Reads grammar text into a [`Grammar`].
//!
//! The notation is the one the schema compiler, the regex converter and
//! the PEG lowering emit:
//!
//! ```text
//! # comment
//! root  ::= "a" item* | [^\n] .{2,3} ( "x" | "" )
//! item  ::= [0-9a-f] "é"
//! ```
//!
//! Literals and classes take `\n \r \t \\ \" \xHH \uHHHH \UHHHHHHHH` and
//! the other C escapes. Quantifiers are `* + ? {m} {m,} {m,n}`. A rule
//! starts at the beginning of a line with `name ::=` and runs until the
//! next rule start; names may contain letters, digits, `_`, `-` and `.`.

use anyhow::{Result, anyhow};

use super::builder::GrammarBuilder;
use super::{Expr, ExprId, Grammar, RuleId};

impl Grammar {
    /// Parse grammar text rooted at `root`.
    ///
    /// # Example
    /// ```
    /// use pie_structured::structured::grammar::Grammar;
    ///
    /// let grammar = Grammar::from_ebnf(r#"root ::= "hello" | "world""#, "root").unwrap();
    /// assert_eq!(grammar.num_rules(), 1);
    /// ```
    pub fn from_ebnf(source: &str, root: &str) -> Result<Grammar> {
        let mut reader = Reader::new(source);
        reader.declare_rules();
        reader.read_rules()?;
        reader.builder.build(root)
    }
}

fn is_name_start(c: char) -> bool {
    c == '_' || c == '-' || c.is_ascii_alphabetic()
}

fn is_name_char(c: char) -> bool {
    is_name_start(c) || c.is_ascii_digit() || c == '.'
}

/// `name ::=` at the start of `line`, ignoring leading blanks.
fn rule_header(line: &str) -> Option<(&str, usize)> {
    let indent = line.len() - line.trim_start_matches([' ', '\t']).len();
    let rest = &line[indent..];
    if !rest.starts_with(is_name_start) {
        return None;
    }
    let name_len = rest.find(|c: char| !is_name_char(c)).unwrap_or(rest.len());
    let after = rest[name_len..].trim_start_matches([' ', '\t']);
    if !after.starts_with("::=") {
        return None;
    }
    let consumed = line.len() - after.len() + 3;
    Some((&rest[..name_len], consumed))
}

/// Extra characters a class may escape besides the C escapes.
const CLASS_ESCAPES: &str = "^$.*+?()[]{}|/-";

struct Reader<'a> {
    src: &'a str,
    pos: usize,
    builder: GrammarBuilder,
    /// Rule being read; auxiliary rules are named after it.
    current: String,
}

impl<'a> Reader<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            pos: 0,
            builder: GrammarBuilder::new(),
            current: String::new(),
        }
    }

    /// Rule ids follow definition order, and references may point forward.
    fn declare_rules(&mut self) {
        for line in self.src.lines() {
            if let Some((name, _)) = rule_header(line) {
                self.builder.declare(name);
            }
        }
    }

    fn error(&self, msg: &str) -> anyhow::Error {
        let before = &self.src[..self.pos];
        let line = before.matches('\n').count() + 1;
        let col = before.len() - before.rfind('\n').map_or(0, |i| i + 1) + 1;
        anyhow!("grammar error at line {}, column {}: {}", line, col, msg)
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn eat(&mut self, c: char) -> bool {
        if self.peek() == Some(c) {
            self.pos += c.len_utf8();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, c: char) -> Result<()> {
        if self.eat(c) {
            Ok(())
        } else {
            Err(self.error(&format!("expected '{}'", c)))
        }
    }

    fn skip_trivia(&mut self) {
        loop {
            let rest = self.rest();
            let trimmed = rest.trim_start();
            self.pos += rest.len() - trimmed.len();
            if !trimmed.starts_with('#') {
                return;
            }
            self.pos += trimmed.find('\n').unwrap_or(trimmed.len());
        }
    }

    fn at_line_start(&self) -> bool {
        let line = &self.src[self.src[..self.pos].rfind('\n').map_or(0, |i| i + 1)..self.pos];
        line.chars().all(|c| c == ' ' || c == '\t')
    }

    /// A rule header begins here, wherever the cursor sits on its line.
    fn at_rule_header(&self) -> bool {
        rule_header(self.rest()).is_some()
    }

    fn read_rules(&mut self) -> Result<()> {
        loop {
            self.skip_trivia();
            if self.peek().is_none() {
                return Ok(());
            }
            let Some((name, consumed)) = rule_header(self.rest()) else {
                return Err(self.error("expected a rule definition"));
            };
            if !self.at_line_start() {
                return Err(self.error(&format!("rule \"{}\" must start on its own line", name)));
            }
            let rule = self.builder.declare(name);
            self.current = name.to_string();
            self.pos += consumed;
            let body = self.choices()?;
            self.builder.define(rule, body).map_err(|e| self.error(&e.to_string()))?;
        }
    }

    fn choices(&mut self) -> Result<ExprId> {
        let mut alternatives = vec![self.sequence()?];
        loop {
            self.skip_trivia();
            if !self.eat('|') {
                return Ok(self.builder.choices(alternatives));
            }
            alternatives.push(self.sequence()?);
        }
    }

    fn sequence(&mut self) -> Result<ExprId> {
        let mut items = Vec::new();
        loop {
            self.skip_trivia();
            match self.peek() {
                None | Some('|' | ')') => break,
                _ if self.at_rule_header() => break,
                _ => items.push(self.quantified()?),
            }
        }
        Ok(self.builder.sequence(items))
    }

    fn quantified(&mut self) -> Result<ExprId> {
        let item = self.element()?;
        self.skip_trivia();
        let (min, max) = match self.peek() {
            Some('*') => (0, None),
            Some('+') => (1, None),
            Some('?') => (0, Some(1)),
            Some('{') => {
                let bounds = self.bounds()?;
                let rule = self.as_rule(item)?;
                return Ok(self.builder.repeat(rule, bounds.0, bounds.1));
            }
            _ => return Ok(item),
        };
        self.bump();
        let rule = self.as_rule(item)?;
        Ok(self.builder.repeat(rule, min, max))
    }

    /// Repetition applies to rules; other items get an auxiliary one.
    fn as_rule(&mut self, item: ExprId) -> Result<RuleId> {
        if let Expr::RuleRef(rule) = self.builder.get_expr(item) {
            return Ok(*rule);
        }
        let current = self.current.clone();
        let aux = self.builder.fresh(&current);
        self.builder.define(aux, item)?;
        Ok(aux)
    }

    fn integer(&mut self) -> Result<u32> {
        self.skip_trivia();
        let digits = self.rest().find(|c: char| !c.is_ascii_digit()).unwrap_or(self.rest().len());
        if digits == 0 {
            return Err(self.error("expected integer"));
        }
        let n = self.rest()[..digits]
            .parse()
            .map_err(|_| self.error("repetition bound out of range"))?;
        self.pos += digits;
        Ok(n)
    }

    fn bounds(&mut self) -> Result<(u32, Option<u32>)> {
        self.expect('{')?;
        let min = self.integer()?;
        self.skip_trivia();
        if self.eat('}') {
            return Ok((min, Some(min)));
        }
        self.expect(',')?;
        self.skip_trivia();
        if self.eat('}') {
            return Ok((min, None));
        }
        let max = self.integer()?;
        if max < min {
            return Err(self.error("lower bound is larger than upper bound"));
        }
        self.skip_trivia();
        self.expect('}')?;
        Ok((min, Some(max)))
    }

    fn element(&mut self) -> Result<ExprId> {
        match self.peek() {
            Some('(') => {
                self.bump();
                self.skip_trivia();
                if self.eat(')') {
                    return Ok(self.builder.empty());
                }
                let inner = self.choices()?;
                self.skip_trivia();
                self.expect(')')?;
                Ok(inner)
            }
            Some('[') => self.class(),
            Some('.') => {
                self.bump();
                Ok(self.builder.any())
            }
            Some('"') => {
                let text = self.string()?;
                Ok(self.builder.literal(&text))
            }
            Some(c) if is_name_start(c) => {
                let len = self.rest().find(|c: char| !is_name_char(c)).unwrap_or(self.rest().len());
                let name = &self.rest()[..len];
                match self.builder.find_rule(name) {
                    Some(rule) => {
                        self.pos += len;
                        Ok(self.builder.reference(rule))
                    }
                    None => Err(self.error(&format!("rule \"{}\" is not defined", name))),
                }
            }
            Some(c) => Err(self.error(&format!("unexpected character '{}'", c))),
            None => Err(self.error("unexpected end of input")),
        }
    }

    fn string(&mut self) -> Result<String> {
        self.expect('"')?;
        let mut out = String::new();
        loop {
            if matches!(self.peek(), None | Some('\n' | '\r')) {
                return Err(self.error("unterminated string literal"));
            }
            match self.bump() {
                Some('"') => return Ok(out),
                Some('\\') => {
                    let cp = self.escape("")?;
                    out.push(char::from_u32(cp).ok_or_else(|| self.error(&format!("invalid codepoint U+{:04X}", cp)))?);
                }
                Some(c) => out.push(c),
                None => return Err(self.error("unexpected end of input")),
            }
        }
    }

    fn class(&mut self) -> Result<ExprId> {
        self.expect('[')?;
        let negated = self.eat('^');
        let mut ranges = Vec::new();
        loop {
            let lo = match self.class_char()? {
                Some(c) => c,
                None => break,
            };
            let rest = self.rest();
            if rest.starts_with('-') && !rest[1..].starts_with(']') && rest.len() > 1 {
                self.bump();
                let hi = self
                    .class_char()?
                    .ok_or_else(|| self.error("unterminated character class"))?;
                if lo > hi {
                    return Err(self.error("character range is out of order"));
                }
                ranges.push((lo, hi));
            } else {
                ranges.push((lo, lo));
            }
        }
        if ranges.is_empty() && !negated {
            return Err(self.error("empty character class"));
        }
        Ok(self.builder.class(negated, ranges))
    }

    /// The next class member, or `None` after the closing `]`.
    fn class_char(&mut self) -> Result<Option<u32>> {
        match self.bump() {
            None => Err(self.error("unterminated character class")),
            Some('\n' | '\r') => Err(self.error("character class should not contain newline")),
            Some(']') => Ok(None),
            Some('\\') => self.escape(CLASS_ESCAPES).map(Some),
            Some(c) => Ok(Some(c as u32)),
        }
    }

    fn hex(&mut self, min: usize, max: usize) -> Result<u32> {
        let len = self
            .rest()
            .char_indices()
            .take(max)
            .take_while(|(_, c)| c.is_ascii_hexdigit())
            .count();
        if len < min {
            return Err(self.error(&format!("expected {} hex digits", min)));
        }
        let value = u32::from_str_radix(&self.rest()[..len], 16).map_err(|e| self.error(&e.to_string()))?;
        self.pos += len;
        Ok(value)
    }

    /// Codepoint of the escape after a consumed `\`.
    fn escape(&mut self, extra: &str) -> Result<u32> {
        let c = self.bump().ok_or_else(|| self.error("unexpected end of input"))?;
        Ok(match c {
            'n' => 0x0A,
            'r' => 0x0D,
            't' => 0x09,
            '0' => 0x00,
            'a' => 0x07,
            'b' => 0x08,
            'f' => 0x0C,
            'v' => 0x0B,
            'e' => 0x1B,
            'x' => self.hex(1, 2)?,
            'u' => self.hex(4, 4)?,
            'U' => self.hex(8, 8)?,
            '\\' | '"' | '\'' | '?' => c as u32,
            c if extra.contains(c) => c as u32,
            c => return Err(self.error(&format!("invalid escape sequence \\{}", c))),
        })
    }
}
