//! JSON Schema → grammar conversion, checked through the matcher.

use std::sync::Arc;

use pie_structured::structured::grammar::Grammar;
use pie_structured::structured::json_schema::{JsonSchemaOptions, json_schema_to_grammar};
use pie_structured::structured::matcher::{GrammarMatcher, MatcherError};
use pie_structured::structured::tokenizer::{TokenizerInfo, VocabType};

fn accepts(grammar: &Grammar, input: &str) -> bool {
    let vocab: Vec<String> = vec!["dummy".into()];
    let tok = Arc::new(TokenizerInfo::new(&vocab, VocabType::Raw, None).unwrap());
    let mut m = GrammarMatcher::new(Arc::new(grammar.clone()), tok, vec![]).unwrap();
    m.accept_str(input).is_ok() && m.is_complete()
}

fn schema_grammar(schema: &str) -> Grammar {
    json_schema_to_grammar(schema, &JsonSchemaOptions::default()).unwrap()
}

#[test]
fn test_const_true_rejects_false() {
    let g = schema_grammar(
        r#"{"type": "object", "properties": {"ok": {"type": "boolean", "const": true}}, "required": ["ok"]}"#,
    );
    assert!(accepts(&g, r#"{"ok": true}"#));
    assert!(!accepts(&g, r#"{"ok": false}"#));
}

#[test]
fn test_rejection_is_exhaustion() {
    let g = schema_grammar(r#"{"type": "integer"}"#);
    let vocab: Vec<String> = vec!["dummy".into()];
    let tok = Arc::new(TokenizerInfo::new(&vocab, VocabType::Raw, None).unwrap());
    let mut m = GrammarMatcher::new(Arc::new(g), tok, vec![]).unwrap();
    assert!(matches!(m.accept_str("\"1\""), Err(MatcherError::Exhausted { .. })));
}

#[test]
fn test_nested_objects_and_arrays() {
    let g = schema_grammar(
        r#"{
            "type": "object",
            "properties": {
                "user": {
                    "type": "object",
                    "properties": {"name": {"type": "string"}, "tags": {"type": "array", "items": {"type": "string"}, "maxItems": 2}},
                    "required": ["name"]
                },
                "scores": {"type": "array", "items": {"type": "number"}, "minItems": 1}
            },
            "required": ["user", "scores"]
        }"#,
    );
    assert!(accepts(&g, r#"{"user": {"name": "ann"}, "scores": [1.5]}"#));
    assert!(accepts(&g, r#"{"user": {"name": "ann", "tags": ["a", "b"]}, "scores": [1, -2e3]}"#));
    assert!(!accepts(&g, r#"{"user": {"name": "ann", "tags": ["a", "b", "c"]}, "scores": [1]}"#));
    assert!(!accepts(&g, r#"{"user": {"name": "ann"}, "scores": []}"#));
    assert!(!accepts(&g, r#"{"scores": [1], "user": {"name": "ann"}}"#));
}

#[test]
fn test_enum_and_any_of() {
    let g = schema_grammar(
        r#"{"anyOf": [{"enum": ["red", "green", 3]}, {"type": "null"}]}"#,
    );
    assert!(accepts(&g, r#""red""#));
    assert!(accepts(&g, "3"));
    assert!(accepts(&g, "null"));
    assert!(!accepts(&g, r#""blue""#));
}

#[test]
fn test_recursive_definitions() {
    let g = schema_grammar(
        r##"{
            "$defs": {"node": {"type": "object", "properties": {"next": {"anyOf": [{"$ref": "#/$defs/node"}, {"type": "null"}]}}, "required": ["next"]}},
            "$ref": "#/$defs/node"
        }"##,
    );
    assert!(accepts(&g, r#"{"next": null}"#));
    assert!(accepts(&g, r#"{"next": {"next": {"next": null}}}"#));
    assert!(!accepts(&g, r#"{"next": {}}"#));
}

#[test]
fn test_unresolved_ref_fails_at_setup() {
    let err = json_schema_to_grammar(r##"{"$ref": "#/$defs/missing"}"##, &JsonSchemaOptions::default());
    assert!(err.is_err());
}

#[test]
fn test_compact_whitespace() {
    let options = JsonSchemaOptions {
        any_whitespace: false,
        ..JsonSchemaOptions::default()
    };
    let g = json_schema_to_grammar(
        r#"{"type": "object", "properties": {"a": {"type": "integer"}}, "required": ["a"]}"#,
        &options,
    )
    .unwrap();
    assert!(accepts(&g, r#"{"a":1}"#));
    assert!(!accepts(&g, r#"{"a": 1}"#));
}
