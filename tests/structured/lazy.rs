//! Lazy grammars lowered from parser programs, driven token by token.

use std::sync::Arc;

use pie_structured::peg::{PegBuilder, Tag};
use pie_structured::structured::bitmask;
use pie_structured::structured::json_schema::JsonSchemaOptions;
use pie_structured::structured::matcher::GrammarMatcher;
use pie_structured::structured::tokenizer::{TokenizerInfo, VocabType};
use serde_json::json;

const VOCAB: &[&str] = &[
    "Sure", ", ", "calling", " now", "<call>", "{\"", "n", "\": ", "7", "}", "</call>", "x", "\"",
];

fn call_matcher() -> GrammarMatcher {
    let mut p = PegBuilder::new();
    let content = p.until("<call>");
    let content = p.tag(Tag::Content, content);
    let open = p.literal("<call>");
    let json = p.json();
    let args = p.schema(
        json,
        "args",
        &json!({"type": "object", "properties": {"n": {"type": "integer"}}, "required": ["n"]}),
    );
    let args = p.tag(Tag::ToolArgs, args);
    let close = p.literal("</call>");
    let call = p.sequence(vec![open, args, close]);
    let call = p.trigger_rule("call", call);
    let root = p.sequence(vec![content, call]);
    p.set_root(root);
    let arena = p.build().unwrap();

    let lowered = arena.to_grammar(&JsonSchemaOptions::default(), true).unwrap();
    let grammar = lowered.to_grammar().unwrap();
    assert!(grammar.is_lazy());

    let vocab: Vec<String> = VOCAB.iter().map(|s| s.to_string()).collect();
    let tok = Arc::new(TokenizerInfo::new(&vocab, VocabType::Raw, None).unwrap());
    GrammarMatcher::new(Arc::new(grammar), tok, vec![]).unwrap()
}

fn id(token: &str) -> u32 {
    VOCAB.iter().position(|t| *t == token).unwrap() as u32
}

#[test]
fn test_free_text_until_trigger_then_constrained() {
    let mut m = call_matcher();
    let mut bm = vec![0u32; bitmask::bitmask_size(VOCAB.len())];

    for t in ["Sure", ", ", "calling", " now"] {
        m.accept_token(id(t)).unwrap();
        assert!(m.is_awaiting_trigger());
    }
    m.fill_next_token_bitmask(&mut bm).unwrap();
    assert!(bitmask::is_bitmask_all_ones(&bm, VOCAB.len()));

    m.accept_token(id("<call>")).unwrap();
    assert!(!m.is_awaiting_trigger());
    assert!(!m.is_complete());

    m.fill_next_token_bitmask(&mut bm).unwrap();
    assert!(bitmask::get_bit(&bm, id("{\"") as usize));
    assert!(!bitmask::get_bit(&bm, id("x") as usize));
    assert!(!bitmask::get_bit(&bm, id("Sure") as usize));

    for t in ["{\"", "n", "\": ", "7", "}", "</call>"] {
        m.accept_token(id(t)).unwrap();
    }
    assert!(m.is_complete());
}

#[test]
fn test_schema_violation_after_trigger() {
    let mut m = call_matcher();
    for t in ["<call>", "{\"", "n", "\": "] {
        m.accept_token(id(t)).unwrap();
    }
    assert!(m.accept_token(id("\"")).is_err());
    m.accept_token(id("7")).unwrap();
}
