//! Regex-to-grammar converter.
//!
//! Converts a regular expression pattern to a grammar rule body in the
//! notation read by [`Grammar::from_ebnf`]. Follows JavaScript regex
//! semantics, which is what JSON Schema `pattern` uses.
//!
//! # Supported features
//! - Literals (any Unicode), character classes `[a-z]`, negated `[^...]`
//! - Quantifiers: `*`, `+`, `?`, `{n}`, `{n,}`, `{n,m}` (lazy `?` suffix ignored)
//! - Groups: `(...)`, `(?:...)`, `(?<name>...)`
//! - Alternation: `|`
//! - Escapes: `\d`, `\w`, `\s`, `\D`, `\W`, `\S`, `\uXXXX`, `\u{XXXXX}`, `\xHH`
//! - Any char except line terminators: `.`
//! - Anchors: leading `^`, trailing `$` (dropped; the grammar always matches whole)
//!
//! # Unsupported (errors)
//! - Lookahead/lookbehind: `(?=...)`, `(?!...)`, `(?<=...)`, `(?<!...)`
//! - Backreferences: `\1`, `\k<name>`
//! - Unicode properties: `\p{...}`, `\P{...}`
//! - Word boundaries: `\b`, `\B`

use anyhow::{Result, anyhow, bail};

use crate::structured::grammar::Grammar;

/// Convert a regex pattern to a Grammar.
///
/// The resulting grammar has a single root rule matching the pattern.
///
/// # Example
/// ```
/// use pie_structured::structured::regex::regex_to_grammar;
///
/// let grammar = regex_to_grammar("[a-z]+").unwrap();
/// ```
pub fn regex_to_grammar(pattern: &str) -> Result<Grammar> {
    let ebnf = regex_to_ebnf(pattern)?;
    Grammar::from_ebnf(&ebnf, "root")
}

/// Convert a regex pattern to a grammar string.
///
/// Returns a string like `root ::= [a-z]+\n`.
pub fn regex_to_ebnf(pattern: &str) -> Result<String> {
    Ok(format!("root ::= {}\n", regex_to_rule_body(pattern)?))
}

/// Convert a regex pattern to the body of a single rule, for embedding in
/// a larger grammar.
pub fn regex_to_rule_body(pattern: &str) -> Result<String> {
    RegexConverter::new(pattern).convert()
}

struct RegexConverter {
    input: Vec<char>,
    pos: usize,
}

impl RegexConverter {
    fn new(pattern: &str) -> Self {
        Self {
            input: pattern.chars().collect(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<char> {
        self.input.get(self.pos).copied()
    }

    fn peek_at(&self, delta: usize) -> Option<char> {
        self.input.get(self.pos + delta).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.peek();
        if ch.is_some() {
            self.pos += 1;
        }
        ch
    }

    fn expect(&mut self, expected: char) -> Result<()> {
        match self.advance() {
            Some(c) if c == expected => Ok(()),
            Some(c) => bail!("expected '{}' at position {}, found '{}'", expected, self.pos - 1, c),
            None => bail!("expected '{}' at end of pattern", expected),
        }
    }

    fn convert(&mut self) -> Result<String> {
        if self.peek() == Some('^') {
            self.advance();
        }

        let result = self.parse_alternation()?;

        if self.peek() == Some('$') {
            self.advance();
        }

        if let Some(c) = self.peek() {
            bail!("unexpected character at position {}: '{}'", self.pos, c);
        }

        if result.is_empty() {
            Ok("\"\"".to_string())
        } else {
            Ok(result)
        }
    }

    /// `a|b|c`
    fn parse_alternation(&mut self) -> Result<String> {
        let mut alternatives = vec![self.parse_sequence()?];
        while self.peek() == Some('|') {
            self.advance();
            alternatives.push(self.parse_sequence()?);
        }

        if let [single] = alternatives.as_slice() {
            return Ok(single.clone());
        }
        let parts: Vec<String> = alternatives
            .into_iter()
            .map(|a| if a.is_empty() { "\"\"".to_string() } else { a })
            .collect();
        Ok(format!("({})", parts.join(" | ")))
    }

    fn parse_sequence(&mut self) -> Result<String> {
        let mut segments = Vec::new();
        while let Some(c) = self.peek() {
            if matches!(c, '|' | ')') || (c == '$' && self.pos + 1 == self.input.len()) {
                break;
            }
            let atom = self.parse_atom_with_quantifier()?;
            if !atom.is_empty() {
                segments.push(atom);
            }
        }
        Ok(segments.join(" "))
    }

    fn parse_atom_with_quantifier(&mut self) -> Result<String> {
        let atom = self.parse_atom()?;
        if atom.is_empty() {
            return Ok(atom);
        }

        let suffix = match self.peek() {
            Some(q @ ('*' | '+' | '?')) => {
                self.advance();
                q.to_string()
            }
            Some('{') if self.is_repetition_start() => match self.parse_repetition()? {
                (min, Some(max)) if min == max => format!("{{{}}}", min),
                (min, Some(max)) => {
                    if min > max {
                        bail!("invalid repetition {{{},{}}}", min, max);
                    }
                    format!("{{{},{}}}", min, max)
                }
                (min, None) => format!("{{{},}}", min),
            },
            _ => return Ok(atom),
        };

        // lazy modifier
        if self.peek() == Some('?') {
            self.advance();
        }
        if matches!(self.peek(), Some('*' | '+' | '?')) || self.is_repetition_start() {
            bail!("consecutive quantifiers are not supported at position {}", self.pos);
        }
        Ok(format!("{}{}", atom, suffix))
    }

    fn is_repetition_start(&self) -> bool {
        self.peek() == Some('{') && self.peek_at(1).is_some_and(|c| c.is_ascii_digit())
    }

    fn parse_atom(&mut self) -> Result<String> {
        match self.peek() {
            None => Ok(String::new()),
            Some('(') => self.parse_group(),
            Some('[') => self.parse_char_class(),
            Some('.') => {
                self.advance();
                Ok("[^\\n\\r]".to_string())
            }
            Some('\\') => self.parse_escape(),
            Some('^') => {
                self.advance();
                Ok(String::new())
            }
            Some('$') => {
                self.advance();
                Ok(String::new())
            }
            Some(c @ '{') if !self.is_repetition_start() => {
                self.advance();
                Ok(literal(c))
            }
            Some(c @ '}') => {
                self.advance();
                Ok(literal(c))
            }
            Some(c) if is_metachar(c) => {
                bail!("unexpected metacharacter '{}' at position {}", c, self.pos);
            }
            Some(_) => self.parse_literal(),
        }
    }

    fn parse_group(&mut self) -> Result<String> {
        self.expect('(')?;

        if self.peek() == Some('?') {
            self.advance();
            match self.advance() {
                Some(':') => {}
                Some('<') => match self.peek() {
                    Some('=' | '!') => bail!("lookbehind assertions are not supported"),
                    _ => {
                        // named group: the name carries no meaning here
                        while self.peek() != Some('>') {
                            if self.advance().is_none() {
                                bail!("unterminated named group");
                            }
                        }
                        self.advance();
                    }
                },
                Some('=' | '!') => bail!("lookahead assertions are not supported"),
                _ => bail!("unsupported group modifier at position {}", self.pos),
            }
        }

        let inner = self.parse_alternation()?;
        if self.peek() != Some(')') {
            bail!("unmatched '(' at position {}", self.pos);
        }
        self.advance();

        if inner.is_empty() {
            Ok("\"\"".to_string())
        } else {
            Ok(format!("({})", inner))
        }
    }

    fn parse_char_class(&mut self) -> Result<String> {
        self.expect('[')?;
        let mut result = String::from("[");

        if self.peek() == Some('^') {
            self.advance();
            result.push('^');
        }
        let mut empty = true;
        loop {
            match self.peek() {
                None => bail!("unclosed character class"),
                Some(']') => break,
                Some('\\') => {
                    result.push_str(&self.parse_char_class_escape()?);
                }
                Some(ch) => {
                    self.advance();
                    result.push_str(&class_char(ch));
                }
            }
            empty = false;

            // range
            if self.peek() == Some('-') && self.peek_at(1).is_some_and(|c| c != ']') {
                self.advance();
                result.push('-');
                if self.peek() == Some('\\') {
                    result.push_str(&self.parse_char_class_escape()?);
                } else if let Some(end) = self.advance() {
                    result.push_str(&class_char(end));
                }
            }
        }
        self.advance();

        if empty && result == "[" {
            // `[]` matches nothing; no grammar element expresses that
            bail!("empty character class");
        }
        if empty {
            // `[^]` matches anything
            return Ok(".".to_string());
        }
        result.push(']');
        Ok(result)
    }

    fn parse_char_class_escape(&mut self) -> Result<String> {
        self.expect('\\')?;
        let Some(ch) = self.advance() else {
            bail!("truncated escape");
        };
        let s = match ch {
            'd' => "0-9".to_string(),
            'D' => "\\x00-/:-\\U0010ffff".to_string(),
            'w' => "a-zA-Z0-9_".to_string(),
            'W' => "\\x00-/:-@\\[-\\^`\\{-\\U0010ffff".to_string(),
            's' => "\\t\\n\\r \\x0b\\x0c".to_string(),
            'S' => "\\x00-\\x08\\x0e-\\x1f!-\\U0010ffff".to_string(),
            'u' => class_char(self.read_unicode_escape()?),
            'x' => class_char(self.read_hex_escape()?),
            'n' => "\\n".to_string(),
            'r' => "\\r".to_string(),
            't' => "\\t".to_string(),
            'f' => "\\x0c".to_string(),
            'v' => "\\x0b".to_string(),
            '0' => "\\x00".to_string(),
            'b' => "\\x08".to_string(),
            c => class_char(c),
        };
        Ok(s)
    }

    fn parse_escape(&mut self) -> Result<String> {
        self.expect('\\')?;
        let Some(ch) = self.advance() else {
            bail!("truncated escape");
        };
        let s = match ch {
            'd' => "[0-9]".to_string(),
            'D' => "[^0-9]".to_string(),
            'w' => "[a-zA-Z0-9_]".to_string(),
            'W' => "[^a-zA-Z0-9_]".to_string(),
            's' => "[\\t\\n\\r \\x0b\\x0c]".to_string(),
            'S' => "[^\\t\\n\\r \\x0b\\x0c]".to_string(),
            'b' | 'B' => bail!("word boundaries (\\b, \\B) are not supported"),
            'p' | 'P' => bail!("unicode property escapes (\\p, \\P) are not supported"),
            '1'..='9' | 'k' => bail!("backreferences are not supported"),
            'u' => literal(self.read_unicode_escape()?),
            'x' => literal(self.read_hex_escape()?),
            'n' => literal('\n'),
            'r' => literal('\r'),
            't' => literal('\t'),
            'f' => literal('\x0c'),
            'v' => literal('\x0b'),
            '0' => literal('\0'),
            c => literal(c),
        };
        Ok(s)
    }

    /// After `\u`: `XXXX` or `{X...}`.
    fn read_unicode_escape(&mut self) -> Result<char> {
        let hex = if self.peek() == Some('{') {
            self.advance();
            let mut hex = String::new();
            loop {
                match self.advance() {
                    Some('}') => break,
                    Some(c) => hex.push(c),
                    None => bail!("unterminated unicode escape"),
                }
            }
            hex
        } else {
            self.read_hex(4)?
        };
        let cp = u32::from_str_radix(&hex, 16)
            .map_err(|_| anyhow!("invalid unicode escape: \\u{}", hex))?;
        char::from_u32(cp).ok_or_else(|| anyhow!("invalid codepoint in escape: U+{:04X}", cp))
    }

    /// After `\x`: `HH`, a codepoint below U+0100.
    fn read_hex_escape(&mut self) -> Result<char> {
        let hex = self.read_hex(2)?;
        let cp = u32::from_str_radix(&hex, 16)
            .map_err(|_| anyhow!("invalid hex escape: \\x{}", hex))?;
        char::from_u32(cp).ok_or_else(|| anyhow!("invalid hex escape: \\x{}", hex))
    }

    /// Consecutive plain characters become one quoted literal. A quantifier
    /// binds to the last character only, so that one is left for the next atom.
    fn parse_literal(&mut self) -> Result<String> {
        let start = self.pos;
        while let Some(ch) = self.peek() {
            if is_metachar(ch) || matches!(ch, '\\' | '[' | '(' | '.') {
                break;
            }
            self.advance();
            if matches!(self.peek(), Some('*' | '+' | '?')) || self.is_repetition_start() {
                if self.pos - start > 1 {
                    self.pos -= 1;
                }
                break;
            }
        }
        let text: String = self.input[start..self.pos].iter().collect();
        Ok(quote_literal(&text))
    }

    /// `{n}`, `{n,}`, or `{n,m}`.
    fn parse_repetition(&mut self) -> Result<(u32, Option<u32>)> {
        self.expect('{')?;
        let min = self.read_int()?;
        match self.advance() {
            Some('}') => Ok((min, Some(min))),
            Some(',') => {
                if self.peek() == Some('}') {
                    self.advance();
                    return Ok((min, None));
                }
                let max = self.read_int()?;
                self.expect('}')?;
                Ok((min, Some(max)))
            }
            _ => bail!("expected ',' or '}}' in repetition"),
        }
    }

    fn read_int(&mut self) -> Result<u32> {
        let start = self.pos;
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.advance();
        }
        if start == self.pos {
            bail!("expected integer in repetition");
        }
        let digits: String = self.input[start..self.pos].iter().collect();
        digits
            .parse()
            .map_err(|_| anyhow!("repetition count out of range: {}", digits))
    }

    fn read_hex(&mut self, count: usize) -> Result<String> {
        let mut s = String::new();
        for _ in 0..count {
            match self.advance() {
                Some(ch) if ch.is_ascii_hexdigit() => s.push(ch),
                _ => bail!("expected hex digit"),
            }
        }
        Ok(s)
    }
}

fn is_metachar(ch: char) -> bool {
    matches!(ch, '*' | '+' | '?' | '{' | '}' | '|' | ')' | '^' | '$')
}

/// A quoted string literal in grammar notation.
pub(crate) fn quote_literal(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for ch in s.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 || c == '\x7f' => out.push_str(&format!("\\x{:02x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

fn literal(c: char) -> String {
    quote_literal(c.encode_utf8(&mut [0u8; 4]))
}

/// One character inside a bracketed class.
pub(crate) fn class_char(c: char) -> String {
    match c {
        ']' | '[' | '\\' | '^' | '-' => format!("\\{}", c),
        '\n' => "\\n".to_string(),
        '\r' => "\\r".to_string(),
        '\t' => "\\t".to_string(),
        c if (c as u32) < 0x20 || c == '\x7f' => format!("\\x{:02x}", c as u32),
        c if (c as u32) > 0xFFFF => format!("\\U{:08x}", c as u32),
        c => c.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(pattern: &str) -> String {
        regex_to_rule_body(pattern).unwrap()
    }

    #[test]
    fn test_literals_and_quantifiers() {
        assert_eq!(body("abc"), r#""abc""#);
        assert_eq!(body("ab+"), r#""a" "b"+"#);
        assert_eq!(body("a{2,3}"), r#""a"{2,3}"#);
        assert_eq!(body("a{2}?"), r#""a"{2}"#);
        assert_eq!(body("^a|b$"), r#"("a" | "b")"#);
    }

    #[test]
    fn test_non_ascii_literal_stays_whole() {
        assert_eq!(body("héllo"), "\"héllo\"");
        assert_eq!(body("é+"), "\"é\"+");
        assert_eq!(body("[à-ÿ]"), "[à-ÿ]");
    }

    #[test]
    fn test_dot_excludes_line_breaks() {
        assert_eq!(body("a.c"), r#""a" [^\n\r] "c""#);
        let g = regex_to_grammar("a.c").unwrap();
        assert_eq!(g.num_rules(), 1);
    }

    #[test]
    fn test_classes_and_escapes() {
        assert_eq!(body(r"\d{4}"), "[0-9]{4}");
        assert_eq!(body(r"[\w-]"), r"[a-zA-Z0-9_\-]");
        assert_eq!(body(r"[\u{1F600}]"), r"[\U0001f600]");
        assert_eq!(body(r"\."), r#"".""#);
        assert_eq!(body(r#"""#), r#""\"""#);
        assert_eq!(body("[^]"), ".");
    }

    #[test]
    fn test_groups() {
        assert_eq!(body("(?:ab)*"), r#"("ab")*"#);
        assert_eq!(body("(?<year>\\d)"), "([0-9])");
        assert!(regex_to_rule_body("(?=a)").is_err());
        assert!(regex_to_rule_body("(?<!a)").is_err());
        assert!(regex_to_rule_body("(a").is_err());
    }

    #[test]
    fn test_unsupported() {
        assert!(regex_to_rule_body(r"\bword").is_err());
        assert!(regex_to_rule_body(r"(a)\1").is_err());
        assert!(regex_to_rule_body(r"\p{L}").is_err());
        assert!(regex_to_rule_body("a**").is_err());
        assert!(regex_to_rule_body("[]").is_err());
    }

    #[test]
    fn test_every_output_parses() {
        for pattern in [
            r"^\d{4}-(0[1-9]|1[0-2])-(0[1-9]|[1-2]\d|3[01])$",
            r"[a-zA-Z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-z]+",
            r"\s*[^\s]+",
            "x{3,}",
        ] {
            regex_to_grammar(pattern).unwrap();
        }
    }
}
