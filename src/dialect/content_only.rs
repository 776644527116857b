use anyhow::Result;

use super::{ChatFormat, ChatInputs, ChatParams, lowered_grammar};
use crate::chat::{ChatParser, Mapper};
use crate::peg::{PegBuilder, Tag};

/// Plain replies: everything is content. A response schema constrains the
/// whole output to one JSON document.
pub(super) fn init(inputs: &ChatInputs) -> Result<ChatParams> {
    let mut p = PegBuilder::new();
    let root = match &inputs.json_schema {
        Some(schema) => {
            let json = p.json();
            let doc = p.schema(json, "response", schema);
            let content = p.tag(Tag::Content, doc);
            let sp = p.space();
            p.sequence(vec![content, sp])
        }
        None => {
            let rest = p.rest();
            p.tag(Tag::Content, rest)
        }
    };
    p.set_root(root);
    let arena = p.build()?;

    let grammar = match inputs.json_schema {
        Some(_) => Some(lowered_grammar(&arena, false)?.0),
        None => None,
    };
    let mut params = ChatParams::new(
        ChatFormat::ContentOnly,
        inputs.prompt.clone(),
        ChatParser::new(arena, Mapper::Base),
    );
    params.grammar = grammar;
    Ok(params)
}
