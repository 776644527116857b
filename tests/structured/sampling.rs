//! Generate text by sampling only tokens the matcher allows, then check
//! the text against the schema it was constrained by.

use std::sync::Arc;

use pie_structured::structured::bitmask;
use pie_structured::structured::json_schema::{JsonSchemaOptions, json_schema_to_grammar};
use pie_structured::structured::matcher::GrammarMatcher;
use pie_structured::structured::tokenizer::{TokenizerInfo, VocabType};
use serde_json::{Value, json};

/// Printable ASCII plus newline and tab, one character per token, and a
/// few multi-character tokens.
fn vocab() -> Vec<String> {
    let mut v: Vec<String> = (0x20u8..0x7f).map(|b| (b as char).to_string()).collect();
    v.extend(["\n", "\t", "true", "null", "\": ", ", \""].iter().map(|s| s.to_string()));
    v
}

/// Deterministic linear congruential generator.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self, n: usize) -> usize {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        ((self.0 >> 33) as usize) % n
    }
}

fn generate(schema: &Value, seed: u64) -> String {
    let grammar = json_schema_to_grammar(&schema.to_string(), &JsonSchemaOptions::default()).unwrap();
    let vocab = vocab();
    let tok = Arc::new(TokenizerInfo::new(&vocab, VocabType::Raw, None).unwrap());
    let mut m = GrammarMatcher::new(Arc::new(grammar), tok, vec![]).unwrap();
    let mut rng = Lcg(seed);
    let mut bm = vec![0u32; bitmask::bitmask_size(vocab.len())];
    let mut out = String::new();

    for _ in 0..20_000 {
        if m.is_complete() {
            return out;
        }
        m.fill_next_token_bitmask(&mut bm).unwrap();
        let allowed = bitmask::allowed_tokens(&bm, vocab.len());
        assert!(!allowed.is_empty(), "no legal token after {:?}", out);
        let token = allowed[rng.next(allowed.len())];
        m.accept_token(token).unwrap();
        out.push_str(&vocab[token as usize]);
    }
    panic!("generation did not finish: {:?}", out);
}

/// Enough of JSON Schema for the schemas below.
fn validate(schema: &Value, value: &Value) -> bool {
    if let Some(c) = schema.get("const") {
        return c == value;
    }
    if let Some(options) = schema.get("enum").and_then(Value::as_array) {
        return options.contains(value);
    }
    if let Some(options) = schema.get("anyOf").and_then(Value::as_array) {
        return options.iter().any(|s| validate(s, value));
    }
    match schema.get("type").and_then(Value::as_str) {
        Some("object") => {
            let Some(obj) = value.as_object() else { return false };
            let props = schema.get("properties").and_then(Value::as_object);
            let required = schema.get("required").and_then(Value::as_array).cloned().unwrap_or_default();
            required.iter().all(|r| r.as_str().is_some_and(|k| obj.contains_key(k)))
                && obj.iter().all(|(k, v)| match props.and_then(|p| p.get(k)) {
                    Some(s) => validate(s, v),
                    None => false,
                })
        }
        Some("array") => {
            let Some(items) = value.as_array() else { return false };
            let min = schema.get("minItems").and_then(Value::as_u64).unwrap_or(0) as usize;
            let max = schema.get("maxItems").and_then(Value::as_u64).map_or(usize::MAX, |m| m as usize);
            let item_schema = schema.get("items").cloned().unwrap_or(json!({}));
            items.len() >= min && items.len() <= max && items.iter().all(|i| validate(&item_schema, i))
        }
        Some("string") => value.is_string(),
        Some("integer") => {
            let Some(n) = value.as_i64() else { return false };
            schema.get("minimum").and_then(Value::as_i64).is_none_or(|lo| n >= lo)
                && schema.get("maximum").and_then(Value::as_i64).is_none_or(|hi| n <= hi)
        }
        Some("number") => value.is_number(),
        Some("boolean") => value.is_boolean(),
        Some("null") => value.is_null(),
        _ => true,
    }
}

fn check_generated(schema: Value) {
    for seed in 0..8 {
        let text = generate(&schema, seed);
        let value: Value = serde_json::from_str(&text).unwrap_or_else(|e| panic!("{:?}: {}", text, e));
        assert!(validate(&schema, &value), "{} does not satisfy {}", text, schema);
    }
}

#[test]
fn test_generated_nested_object() {
    check_generated(json!({
        "type": "object",
        "properties": {
            "id": {"type": "integer", "minimum": -5, "maximum": 120},
            "owner": {
                "type": "object",
                "properties": {"name": {"type": "string", "maxLength": 6}, "admin": {"type": "boolean"}},
                "required": ["name", "admin"]
            }
        },
        "required": ["id", "owner"]
    }));
}

#[test]
fn test_generated_arrays_and_enums() {
    check_generated(json!({
        "type": "object",
        "properties": {
            "colors": {"type": "array", "items": {"enum": ["red", "green", "blue"]}, "minItems": 1, "maxItems": 3},
            "mode": {"const": "fast"},
            "level": {"anyOf": [{"type": "integer", "minimum": 0, "maximum": 9}, {"type": "null"}]}
        },
        "required": ["colors", "mode"]
    }));
}
