//! JSON Schema to grammar converter.
//!
//! Converts a JSON Schema into grammar text, then parses it into a
//! `Grammar`. The generated grammar constrains LLM output to valid JSON
//! matching the schema.
//!
//! # Supported features
//! - Types: string, integer, number, boolean, null, array, object, and
//!   arrays of types
//! - Constraints: enum, const, minLength/maxLength, minimum/maximum,
//!   exclusiveMinimum/exclusiveMaximum (integers), pattern, format
//! - Arrays: items, prefixItems, minItems/maxItems
//! - Objects: properties, required, additionalProperties, allOf
//! - Composition: $ref (any `#/...` pointer), anyOf, oneOf
//!
//! [`SchemaGrammarBuilder`] is also the grammar-text builder used by chat
//! dialects, which mix hand-written rules with one or more schemas.

use anyhow::{Context, Result, anyhow, bail};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Deserialize;
use serde_json::Value;

use crate::structured::grammar::Grammar;
use crate::structured::regex::{quote_literal, regex_to_rule_body};

/// Options for JSON schema to grammar conversion.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JsonSchemaOptions {
    /// Allow a little whitespace between JSON tokens. Without it the
    /// output is compact JSON with no whitespace at all.
    pub any_whitespace: bool,
    /// If true, objects with declared properties accept no others unless
    /// `additionalProperties` says so.
    pub strict_mode: bool,
    /// Property names emitted ahead of the rest, in this order.
    pub prop_order: Vec<String>,
}

impl Default for JsonSchemaOptions {
    fn default() -> Self {
        Self {
            any_whitespace: true,
            strict_mode: true,
            prop_order: Vec::new(),
        }
    }
}

/// Convert a JSON Schema string to a Grammar.
pub fn json_schema_to_grammar(schema: &str, options: &JsonSchemaOptions) -> Result<Grammar> {
    let schema_val: Value = serde_json::from_str(schema).context("schema is not valid JSON")?;
    let ebnf = json_schema_to_ebnf(&schema_val, options)?;
    Grammar::from_ebnf(&ebnf, "root")
}

/// Convert a parsed JSON Schema to grammar text with a `root` rule.
pub fn json_schema_to_ebnf(schema: &Value, options: &JsonSchemaOptions) -> Result<String> {
    let mut builder = SchemaGrammarBuilder::new(options.clone());
    builder.add_schema("root", schema)?;
    Ok(builder.to_ebnf())
}

/// Create a grammar for standard JSON (any valid JSON value).
pub fn builtin_json_grammar() -> Result<Grammar> {
    let mut builder = SchemaGrammarBuilder::new(JsonSchemaOptions::default());
    let value = builder.json_value_rule();
    builder.add_rule("root", &value);
    Grammar::from_ebnf(&builder.to_ebnf(), "root")
}

const SPACE_RULE: &str = r#""" | " " | "\n"{1,2} [ \t]{0,20}"#;

/// Shared rules: (name, body, rules the body refers to).
const PRIMITIVE_RULES: &[(&str, &str, &[&str])] = &[
    ("boolean", r#"("true" | "false") space"#, &[]),
    ("decimal-part", "[0-9]{1,16}", &[]),
    ("integral-part", "[0] | [1-9] [0-9]{0,15}", &[]),
    (
        "number",
        r#"("-"? integral-part) ("." decimal-part)? ([eE] [-+]? integral-part)? space"#,
        &["integral-part", "decimal-part"],
    ),
    ("integer", r#"("-"? integral-part) space"#, &["integral-part"]),
    (
        "value",
        "object | array | string | number | boolean | null",
        &["object", "array", "string", "number", "boolean", "null"],
    ),
    (
        "object",
        r#""{" space ( string ":" space value ("," space string ":" space value)* )? "}" space"#,
        &["string", "value"],
    ),
    ("array", r#""[" space ( value ("," space value)* )? "]" space"#, &["value"]),
    ("char", r#"[^"\\\x7F\x00-\x1F] | [\\] (["\\bfnrt] | "u" [0-9a-fA-F]{4})"#, &[]),
    ("string", r#""\"" char* "\"" space"#, &["char"]),
    ("null", r#""null" space"#, &[]),
];

/// Keywords that are accepted but do not constrain the grammar.
const IGNORED_KEYWORDS: &[&str] = &[
    "not",
    "if",
    "then",
    "else",
    "uniqueItems",
    "multipleOf",
    "contains",
    "patternProperties",
    "propertyNames",
    "dependentRequired",
    "dependentSchemas",
    "minProperties",
    "maxProperties",
];

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Accumulates named grammar rules from schemas and hand-written bodies.
pub struct SchemaGrammarBuilder {
    options: JsonSchemaOptions,
    rules: Vec<(String, String)>,
    rule_index: FxHashMap<String, usize>,
    /// Canonical schema text -> rule name.
    schema_rules: FxHashMap<String, String>,
    /// `$ref` -> rule name, registered before the target is visited.
    ref_rules: FxHashMap<String, String>,
    /// Document `#/...` pointers resolve against.
    document: Value,
}

impl SchemaGrammarBuilder {
    pub fn new(options: JsonSchemaOptions) -> Self {
        let space = if options.any_whitespace { SPACE_RULE } else { r#""""# };
        let mut builder = Self {
            options,
            rules: Vec::new(),
            rule_index: FxHashMap::default(),
            schema_rules: FxHashMap::default(),
            ref_rules: FxHashMap::default(),
            document: Value::Null,
        };
        builder.insert_rule("space".to_string(), space.to_string());
        builder
    }

    pub fn options(&self) -> &JsonSchemaOptions {
        &self.options
    }

    /// Add a rule and return the name it was stored under. Names are
    /// sanitised; a name already holding a different body gets a numeric
    /// suffix.
    pub fn add_rule(&mut self, name: &str, body: &str) -> String {
        let esc = sanitize_rule_name(name);
        if self.rule_body(&esc) == Some(body) {
            return esc;
        }
        let key = self.fresh_name(esc);
        self.insert_rule(key.clone(), body.to_string());
        key
    }

    /// Claim a fresh rule name for a body that is not known yet, e.g. one
    /// that refers to itself. Fill it in with [`Self::set_rule`].
    pub(crate) fn reserve_rule(&mut self, name: &str) -> String {
        let key = self.fresh_name(sanitize_rule_name(name));
        self.insert_rule(key.clone(), String::new());
        key
    }

    pub(crate) fn set_rule(&mut self, name: &str, body: String) {
        self.insert_rule(name.to_string(), body);
    }

    fn fresh_name(&self, esc: String) -> String {
        if !self.is_taken(&esc) {
            return esc;
        }
        let mut i = 0;
        loop {
            let candidate = format!("{}{}", esc, i);
            if !self.is_taken(&candidate) {
                return candidate;
            }
            i += 1;
        }
    }

    pub fn rule_body(&self, name: &str) -> Option<&str> {
        self.rule_index.get(name).map(|&i| self.rules[i].1.as_str())
    }

    fn is_taken(&self, name: &str) -> bool {
        self.rule_index.contains_key(name) || PRIMITIVE_RULES.iter().any(|(p, _, _)| *p == name)
    }

    fn insert_rule(&mut self, name: String, body: String) {
        match self.rule_index.get(&name) {
            Some(&i) => self.rules[i].1 = body,
            None => {
                self.rule_index.insert(name.clone(), self.rules.len());
                self.rules.push((name, body));
            }
        }
    }

    /// Rule matching any JSON value.
    pub fn json_value_rule(&mut self) -> String {
        self.primitive("value")
    }

    fn primitive(&mut self, name: &str) -> String {
        if self.rule_index.contains_key(name) {
            return name.to_string();
        }
        if let Some((_, body, deps)) = PRIMITIVE_RULES.iter().find(|(p, _, _)| *p == name) {
            self.insert_rule(name.to_string(), body.to_string());
            for dep in *deps {
                self.primitive(dep);
            }
        }
        name.to_string()
    }

    /// Compile `schema` into a rule named after `name`; returns the rule
    /// name. `#/...` references resolve against `schema` itself.
    pub fn add_schema(&mut self, name: &str, schema: &Value) -> Result<String> {
        self.resolve_refs(schema)?;
        self.document = schema.clone();
        self.schema_rules.clear();
        self.ref_rules.clear();

        let rule = self.reserve_rule(name);
        self.ref_rules.insert("#".to_string(), rule.clone());
        let body = self.visit_body(schema, &rule)?;
        self.insert_rule(rule.clone(), body);
        Ok(rule)
    }

    /// Check that every `$ref` in `schema` points somewhere inside it and
    /// that no chain of bare references loops back on itself.
    pub fn resolve_refs(&self, schema: &Value) -> Result<()> {
        fn walk(root: &Value, node: &Value) -> Result<()> {
            match node {
                Value::Object(map) => {
                    if let Some(r) = map.get("$ref").and_then(Value::as_str) {
                        follow_ref(root, r)?;
                    }
                    map.values().try_for_each(|v| walk(root, v))
                }
                Value::Array(items) => items.iter().try_for_each(|v| walk(root, v)),
                _ => Ok(()),
            }
        }
        walk(schema, schema)
    }

    pub fn to_ebnf(&self) -> String {
        let mut out = String::new();
        for (name, body) in &self.rules {
            out.push_str(&format!("{} ::= {}\n", name, body));
        }
        out
    }

    // -----------------------------------------------------------------------
    // Schema walk
    // -----------------------------------------------------------------------

    fn visit(&mut self, schema: &Value, name: &str) -> Result<String> {
        let key = canonical_json(schema);
        if let Some(rule) = self.schema_rules.get(&key) {
            return Ok(rule.clone());
        }
        let body = self.visit_body(schema, name)?;
        let rule = if is_rule_name(&body) {
            body
        } else {
            self.add_rule(name, &body)
        };
        self.schema_rules.insert(key, rule.clone());
        Ok(rule)
    }

    fn visit_ref(&mut self, reference: &str) -> Result<String> {
        if let Some(rule) = self.ref_rules.get(reference) {
            return Ok(rule.clone());
        }
        let target = follow_ref(&self.document, reference)?.clone();
        let base = reference.rsplit('/').next().unwrap_or(reference);
        let rule = self.reserve_rule(if base.is_empty() { "ref" } else { base });
        self.ref_rules.insert(reference.to_string(), rule.clone());
        let body = self.visit_body(&target, &rule)?;
        self.insert_rule(rule.clone(), body);
        Ok(rule)
    }

    /// Rule body for `schema`. A body that is a bare rule name stands for
    /// that rule.
    fn visit_body(&mut self, schema: &Value, name: &str) -> Result<String> {
        let obj = match schema {
            Value::Bool(true) => return Ok(self.primitive("value")),
            Value::Bool(false) => bail!("schema `false` accepts no value ({})", name),
            Value::Object(obj) => obj,
            _ => bail!("schema must be an object or boolean ({})", name),
        };

        for kw in IGNORED_KEYWORDS {
            if obj.contains_key(*kw) {
                tracing::debug!("schema keyword `{}` in {} is not enforced", kw, name);
            }
        }

        if let Some(r) = obj.get("$ref") {
            let r = r.as_str().ok_or_else(|| anyhow!("$ref must be a string ({})", name))?;
            return self.visit_ref(r);
        }

        if let Some(alts) = obj.get("anyOf").or_else(|| obj.get("oneOf")) {
            let alts = alts
                .as_array()
                .ok_or_else(|| anyhow!("anyOf/oneOf must be an array ({})", name))?;
            let mut rules = Vec::with_capacity(alts.len());
            for (i, alt) in alts.iter().enumerate() {
                rules.push(self.visit(alt, &format!("{}-{}", name, i))?);
            }
            return Ok(rules.join(" | "));
        }

        if let Some(value) = obj.get("const") {
            return Ok(format!("{} space", json_literal(value)));
        }

        if let Some(values) = obj.get("enum") {
            let values = values
                .as_array()
                .ok_or_else(|| anyhow!("enum must be an array ({})", name))?;
            if values.is_empty() {
                bail!("enum with no values ({})", name);
            }
            let alts: Vec<String> = values.iter().map(json_literal).collect();
            return Ok(format!("({}) space", alts.join(" | ")));
        }

        if let Some(Value::Array(types)) = obj.get("type") {
            let mut rules = Vec::with_capacity(types.len());
            for t in types {
                let t = t.as_str().ok_or_else(|| anyhow!("type entries must be strings ({})", name))?;
                let mut single = obj.clone();
                single.insert("type".to_string(), Value::String(t.to_string()));
                rules.push(self.visit(&Value::Object(single), &format!("{}-{}", name, t))?);
            }
            return Ok(rules.join(" | "));
        }

        let ty = match obj.get("type") {
            None => None,
            Some(Value::String(t)) => Some(t.as_str()),
            Some(_) => bail!("type must be a string or an array ({})", name),
        };

        if let Some(all_of) = obj.get("allOf") {
            return self.visit_all_of(obj, all_of, name);
        }

        let has = |k: &str| obj.contains_key(k);
        match ty {
            Some("object") | None if has("properties") || has("additionalProperties") => {
                let required: FxHashSet<String> = obj
                    .get("required")
                    .and_then(Value::as_array)
                    .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                    .unwrap_or_default();
                let props: Vec<(String, Value)> = obj
                    .get("properties")
                    .and_then(Value::as_object)
                    .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                    .unwrap_or_default();
                let additional = match obj.get("additionalProperties") {
                    None if self.options.strict_mode => None,
                    None => Some(Value::Bool(true)),
                    Some(Value::Bool(false)) => None,
                    Some(v) => Some(v.clone()),
                };
                self.build_object(name, props, &required, additional)
            }
            Some("array") | None if has("items") || has("prefixItems") => self.visit_array(obj, name),
            Some("string") | None
                if has("pattern") || has("format") || has("minLength") || has("maxLength") =>
            {
                self.visit_string(obj, name)
            }
            Some("integer")
                if has("minimum")
                    || has("maximum")
                    || has("exclusiveMinimum")
                    || has("exclusiveMaximum") =>
            {
                self.visit_integer(obj, name)
            }
            Some(t @ ("object" | "array" | "string" | "integer" | "number" | "boolean" | "null")) => {
                if t == "number" && (has("minimum") || has("maximum")) {
                    tracing::debug!("numeric bounds on {} are not enforced", name);
                }
                Ok(self.primitive(t))
            }
            None => Ok(self.primitive("value")),
            Some(t) => bail!("unsupported type `{}` ({})", t, name),
        }
    }

    /// `allOf` over object components merges their properties; components
    /// that are themselves `anyOf` contribute optional properties.
    fn visit_all_of(
        &mut self,
        obj: &serde_json::Map<String, Value>,
        all_of: &Value,
        name: &str,
    ) -> Result<String> {
        let parts = all_of
            .as_array()
            .ok_or_else(|| anyhow!("allOf must be an array ({})", name))?;
        let mut props: Vec<(String, Value)> = Vec::new();
        let mut required = FxHashSet::default();

        let mut add_component = |doc: &Value, comp: &Value, is_required: bool| -> Result<()> {
            let comp = match comp.get("$ref").and_then(Value::as_str) {
                Some(r) => follow_ref(doc, r)?,
                None => comp,
            };
            if let Some(p) = comp.get("properties").and_then(Value::as_object) {
                for (k, v) in p {
                    props.push((k.clone(), v.clone()));
                }
            }
            if is_required {
                if let Some(req) = comp.get("required").and_then(Value::as_array) {
                    required.extend(req.iter().filter_map(|v| v.as_str().map(str::to_string)));
                }
            }
            Ok(())
        };

        let doc = self.document.clone();
        for part in parts {
            match part.get("anyOf").and_then(Value::as_array) {
                Some(alts) => {
                    for alt in alts {
                        add_component(&doc, alt, false)?;
                    }
                }
                None => add_component(&doc, part, true)?,
            }
        }

        let additional = match obj.get("additionalProperties") {
            Some(Value::Bool(false)) | None => None,
            Some(v) => Some(v.clone()),
        };
        self.build_object(name, props, &required, additional)
    }

    fn build_object(
        &mut self,
        name: &str,
        mut props: Vec<(String, Value)>,
        required: &FxHashSet<String>,
        additional: Option<Value>,
    ) -> Result<String> {
        let rank = |key: &str| {
            self.options
                .prop_order
                .iter()
                .position(|p| p == key)
                .unwrap_or(self.options.prop_order.len())
        };
        // stable: schema order breaks ties
        props.sort_by_key(|(k, _)| rank(k));

        let mut required_kvs = Vec::new();
        let mut optional_kvs: Vec<(String, String, bool)> = Vec::new();
        for (key, schema) in &props {
            let prop_name = format!("{}-{}", name, key);
            let value_rule = self.visit(schema, &prop_name)?;
            let kv = self.add_rule(
                &format!("{}-kv", prop_name),
                &format!(r#"{} space ":" space {}"#, json_literal(&Value::String(key.clone())), value_rule),
            );
            if required.contains(key) {
                required_kvs.push(kv);
            } else {
                optional_kvs.push((key.clone(), kv, false));
            }
        }

        if let Some(additional) = additional {
            let value_rule = match additional {
                Value::Bool(true) => self.primitive("value"),
                schema => self.visit(&schema, &format!("{}-additional-value", name))?,
            };
            let string = self.primitive("string");
            let kv = self.add_rule(
                &format!("{}-additional-kv", name),
                &format!(r#"{} ":" space {}"#, string, value_rule),
            );
            optional_kvs.push(("additional".to_string(), kv, true));
        }

        let mut body = String::from(r#""{" space "#);
        body.push_str(&required_kvs.join(r#" "," space "#));
        if !optional_kvs.is_empty() {
            body.push_str(" (");
            if !required_kvs.is_empty() {
                body.push_str(r#" "," space ( "#);
            }
            let mut alts = Vec::with_capacity(optional_kvs.len());
            for i in 0..optional_kvs.len() {
                alts.push(self.optional_chain(name, &optional_kvs[i..], false));
            }
            body.push_str(&alts.join(" | "));
            if !required_kvs.is_empty() {
                body.push_str(" )");
            }
            body.push_str(" )?");
        }
        body.push_str(r#" "}" space"#);
        Ok(body)
    }

    /// Optional properties keep their relative order: each may be skipped,
    /// and the tail after it lives in its own `-rest` rule.
    fn optional_chain(&mut self, name: &str, kvs: &[(String, String, bool)], first_optional: bool) -> String {
        let (key, kv, is_additional) = &kvs[0];
        let comma = format!(r#"( "," space {} )"#, kv);
        let mut out = match (first_optional, is_additional) {
            (true, true) => format!("{}*", comma),
            (true, false) => format!("{}?", comma),
            (false, true) => format!("{} {}*", kv, comma),
            (false, false) => kv.clone(),
        };
        if kvs.len() > 1 {
            let rest = self.optional_chain(name, &kvs[1..], true);
            out.push(' ');
            out.push_str(&self.add_rule(&format!("{}-{}-rest", name, key), &rest));
        }
        out
    }

    fn visit_array(&mut self, obj: &serde_json::Map<String, Value>, name: &str) -> Result<String> {
        let tuple = obj
            .get("prefixItems")
            .and_then(Value::as_array)
            .or_else(|| obj.get("items").and_then(Value::as_array));
        if let Some(items) = tuple {
            let mut rules = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                rules.push(self.visit(item, &format!("{}-tuple-{}", name, i))?);
            }
            return Ok(format!(r#""[" space {} "]" space"#, rules.join(r#" "," space "#)));
        }

        let item = match obj.get("items") {
            Some(schema) => self.visit(schema, &format!("{}-item", name))?,
            None => self.primitive("value"),
        };
        let min = obj.get("minItems").and_then(Value::as_u64).unwrap_or(0) as usize;
        let max = obj.get("maxItems").and_then(Value::as_u64).map(|m| m as usize);
        if max.is_some_and(|m| m < min) {
            bail!("maxItems is less than minItems ({})", name);
        }
        let items = build_repetition(&item, min, max, r#""," space"#);
        if items.is_empty() {
            return Ok(r#""[" space "]" space"#.to_string());
        }
        Ok(format!(r#""[" space {} "]" space"#, items))
    }

    fn visit_string(&mut self, obj: &serde_json::Map<String, Value>, name: &str) -> Result<String> {
        if let Some(fmt) = obj.get("format").and_then(Value::as_str) {
            match format_to_regex(fmt) {
                Some(pattern) => {
                    let body = regex_to_rule_body(pattern)?;
                    let rule = self.add_rule(&format!("{}-format", fmt), &body);
                    return Ok(format!(r#""\"" {} "\"" space"#, rule));
                }
                None => tracing::debug!("unknown string format `{}` in {}", fmt, name),
            }
        }

        if let Some(pattern) = obj.get("pattern").and_then(Value::as_str) {
            let body = regex_to_rule_body(pattern)
                .with_context(|| format!("invalid pattern in {}", name))?;
            return Ok(format!(r#""\"" ({}) "\"" space"#, body));
        }

        let min = obj.get("minLength").and_then(Value::as_u64).unwrap_or(0) as usize;
        let max = obj.get("maxLength").and_then(Value::as_u64).map(|m| m as usize);
        if max.is_some_and(|m| m < min) {
            bail!("maxLength is less than minLength ({})", name);
        }
        let ch = self.primitive("char");
        Ok(format!(r#""\"" {} "\"" space"#, build_repetition(&ch, min, max, "")))
    }

    fn visit_integer(&mut self, obj: &serde_json::Map<String, Value>, name: &str) -> Result<String> {
        let bound = |k: &str| obj.get(k).and_then(Value::as_f64);
        let min = match (bound("minimum"), bound("exclusiveMinimum")) {
            (Some(m), _) => Some(m.ceil() as i64),
            (None, Some(m)) => Some(m.floor() as i64 + 1),
            (None, None) => None,
        };
        let max = match (bound("maximum"), bound("exclusiveMaximum")) {
            (Some(m), _) => Some(m.floor() as i64),
            (None, Some(m)) => Some(m.ceil() as i64 - 1),
            (None, None) => None,
        };
        if let (Some(lo), Some(hi)) = (min, max) {
            if lo > hi {
                bail!("minimum {} is greater than maximum {} ({})", lo, hi, name);
            }
        }
        let body = regex_to_rule_body(&integer_range_regex(min, max))?;
        Ok(format!("({}) space", body))
    }
}

/// Follow `reference` inside `root`, through any chain of bare `$ref`s.
fn follow_ref<'a>(root: &'a Value, reference: &str) -> Result<&'a Value> {
    let mut seen = FxHashSet::default();
    let mut current = reference;
    loop {
        if !seen.insert(current.to_string()) {
            bail!("cyclic $ref: {}", reference);
        }
        let pointer = current
            .strip_prefix('#')
            .ok_or_else(|| anyhow!("unsupported $ref (only local `#/...` pointers): {}", current))?;
        let target = root
            .pointer(pointer)
            .ok_or_else(|| anyhow!("unresolved $ref: {}", current))?;
        match target.as_object() {
            Some(map) if map.len() == 1 => match map.get("$ref").and_then(Value::as_str) {
                Some(next) => current = next,
                None => return Ok(target),
            },
            _ => return Ok(target),
        }
    }
}

/// Copy of `schema` with its local `$ref`s rewritten for embedding the
/// schema at `pointer` inside a larger document, e.g. tool parameters
/// placed under `/properties/arguments` of a call object.
pub fn rebase_refs(schema: &Value, pointer: &str) -> Value {
    match schema {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, value)| {
                    let value = match (key.as_str(), value.as_str()) {
                        ("$ref", Some(r)) => match r.strip_prefix('#') {
                            Some(rest) => Value::String(format!("#{}{}", pointer, rest)),
                            None => value.clone(),
                        },
                        _ => rebase_refs(value, pointer),
                    };
                    (key.clone(), value)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(|v| rebase_refs(v, pointer)).collect()),
        other => other.clone(),
    }
}

/// `item` repeated `min..=max` times, with `sep` between occurrences.
pub(crate) fn build_repetition(item: &str, min: usize, max: Option<usize>, sep: &str) -> String {
    if max == Some(0) {
        return String::new();
    }
    if min == 0 && max == Some(1) {
        return format!("{}?", item);
    }
    if sep.is_empty() {
        return match (min, max) {
            (1, None) => format!("{}+", item),
            (0, None) => format!("{}*", item),
            (m, None) => format!("{}{{{},}}", item, m),
            (m, Some(n)) if m == n => format!("{}{{{}}}", item, m),
            (m, Some(n)) => format!("{}{{{},{}}}", item, m, n),
        };
    }
    let rest = build_repetition(
        &format!("( {} {} )", sep, item),
        min.saturating_sub(1),
        max.map(|m| m - 1),
        "",
    );
    let result = format!("{} {}", item, rest).trim_end().to_string();
    if min == 0 {
        format!("( {} )?", result)
    } else {
        result
    }
}

/// A JSON value written out as a grammar literal.
fn json_literal(value: &Value) -> String {
    quote_literal(&value.to_string())
}

/// Serialisation with object keys sorted, so equal schemas share a key.
fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let parts: Vec<String> = entries
                .into_iter()
                .map(|(k, v)| format!("{}:{}", Value::String(k.clone()), canonical_json(v)))
                .collect();
            format!("{{{}}}", parts.join(","))
        }
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", parts.join(","))
        }
        other => other.to_string(),
    }
}

fn sanitize_rule_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() || ch == '-' {
            out.push(ch);
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    match out.chars().next() {
        None => "rule".to_string(),
        Some(c) if c.is_ascii_digit() => format!("r{}", out),
        Some(_) => out,
    }
}

fn is_rule_name(body: &str) -> bool {
    !body.is_empty() && body.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

// ---------------------------------------------------------------------------
// Integer ranges as regexes
// ---------------------------------------------------------------------------

const ANY_NATURAL: &str = "(?:0|[1-9][0-9]*)";

/// Regex matching the decimal integers in `[min, max]`.
fn integer_range_regex(min: Option<i64>, max: Option<i64>) -> String {
    match (min, max) {
        (None, None) => format!("-?{}", ANY_NATURAL),
        (Some(lo), Some(hi)) if lo == hi => lo.to_string(),
        (Some(lo), Some(hi)) if lo >= 0 => natural_range(lo as u64, hi as u64),
        (Some(lo), Some(hi)) if hi < 0 => format!("-{}", natural_range(hi.unsigned_abs(), lo.unsigned_abs())),
        (Some(lo), Some(hi)) => format!(
            "(?:-{}|{})",
            natural_range(1, lo.unsigned_abs()),
            natural_range(0, hi as u64)
        ),
        (Some(lo), None) if lo >= 0 => natural_at_least(lo as u64),
        (Some(lo), None) => format!("(?:-{}|{})", natural_range(1, lo.unsigned_abs()), ANY_NATURAL),
        (None, Some(hi)) if hi < 0 => format!("-{}", natural_at_least(hi.unsigned_abs())),
        (None, Some(hi)) => format!("(?:-[1-9][0-9]*|{})", natural_range(0, hi as u64)),
    }
}

/// Naturals in `[min, max]`.
fn natural_range(min: u64, max: u64) -> String {
    if min == max {
        return min.to_string();
    }
    let (min_s, max_s) = (min.to_string(), max.to_string());
    if min_s.len() == max_s.len() {
        return same_length_range(min_s.as_bytes(), max_s.as_bytes());
    }

    let mut parts = vec![natural_range(min, 10u64.pow(min_s.len() as u32) - 1)];
    for digits in (min_s.len() + 1)..max_s.len() {
        parts.push(format!("[1-9][0-9]{{{}}}", digits - 1));
    }
    parts.push(natural_range(10u64.pow(max_s.len() as u32 - 1), max));
    format!("(?:{})", parts.join("|"))
}

/// Naturals `>= min`.
fn natural_at_least(min: u64) -> String {
    match min {
        0 => ANY_NATURAL.to_string(),
        1 => "[1-9][0-9]*".to_string(),
        _ => {
            let len = min.to_string().len();
            format!(
                "(?:{}|[1-9][0-9]{{{},}})",
                natural_range(min, 10u64.pow(len as u32) - 1),
                len
            )
        }
    }
}

/// Digit strings of equal length between `min` and `max`.
fn same_length_range(min: &[u8], max: &[u8]) -> String {
    let (lo, hi) = (min[0] - b'0', max[0] - b'0');
    if min.len() == 1 {
        return digit_class(lo, hi);
    }
    let rest_len = min.len() - 1;
    if lo == hi {
        return format!("{}{}", lo, same_length_range(&min[1..], &max[1..]));
    }

    let nines = vec![b'9'; rest_len];
    let zeros = vec![b'0'; rest_len];
    let mut parts = vec![format!("{}{}", lo, same_length_range(&min[1..], &nines))];
    if lo + 1 < hi {
        parts.push(format!("{}[0-9]{{{}}}", digit_class(lo + 1, hi - 1), rest_len));
    }
    parts.push(format!("{}{}", hi, same_length_range(&zeros, &max[1..])));
    format!("(?:{})", parts.join("|"))
}

fn digit_class(lo: u8, hi: u8) -> String {
    match hi - lo {
        0 => lo.to_string(),
        1 => format!("[{}{}]", lo, hi),
        _ => format!("[{}-{}]", lo, hi),
    }
}

/// Map a JSON Schema format name to a regex pattern.
/// Returns None for unknown formats (they are ignored per JSON Schema).
fn format_to_regex(format: &str) -> Option<&'static str> {
    match format {
        // RFC 3339 full-date
        "date" => Some(r"\d{4}-(0[1-9]|1[0-2])-(0[1-9]|[1-2]\d|3[01])"),
        // RFC 3339 full-time
        "time" => Some(r"([01]\d|2[0-3]):[0-5]\d:([0-5]\d|60)(\.\d{1,6})?(Z|[+-]([01]\d|2[0-3]):[0-5]\d)"),
        "date-time" => Some(
            r"\d{4}-(0[1-9]|1[0-2])-(0[1-9]|[1-2]\d|3[01])T([01]\d|2[0-3]):[0-5]\d:([0-5]\d|60)(\.\d{1,6})?(Z|[+-]([01]\d|2[0-3]):[0-5]\d)",
        ),
        "email" => Some(
            r"[a-zA-Z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-zA-Z0-9]([a-zA-Z0-9-]*[a-zA-Z0-9])?(\.[a-zA-Z0-9]([a-zA-Z0-9-]*[a-zA-Z0-9])?)*",
        ),
        "uuid" => Some(r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}"),
        "ipv4" => Some(r"((25[0-5]|2[0-4]\d|[01]?\d\d?)\.){3}(25[0-5]|2[0-4]\d|[01]?\d\d?)"),
        "hostname" => Some(
            r"[a-zA-Z0-9]([a-zA-Z0-9-]*[a-zA-Z0-9])?(\.[a-zA-Z0-9]([a-zA-Z0-9-]*[a-zA-Z0-9])?)*",
        ),
        _ => None,
    }
}
