//! Turning captures into messages.

use crate::peg::{Capture, Tag};

use super::message::{ChatMessage, ToolCall};

/// Tools whose arguments may be raw code instead of a JSON object.
const RAW_CODE_TOOLS: &[&str] = &["python", "code_interpreter"];

/// How tagged spans become message fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mapper {
    /// Reasoning and content only.
    #[default]
    Base,
    /// Tool calls whose arguments are captured as one JSON document.
    Native,
    /// Tool calls whose JSON arguments are assembled from per-argument
    /// name and value captures.
    Constructed,
    /// Like [`Mapper::Native`], with content captured as a JSON string
    /// that is decoded.
    Generic,
}

impl Mapper {
    pub fn map(self, input: &str, captures: &[Capture]) -> ChatMessage {
        let mut state = MapState {
            mapper: self,
            message: ChatMessage::assistant(),
            current: None,
            pending_id: None,
            arg_count: 0,
            needs_closing_quote: false,
        };
        for capture in captures {
            state.visit(capture, input);
        }
        state.message
    }
}

struct MapState {
    mapper: Mapper,
    message: ChatMessage,
    /// Index of the call the following captures belong to.
    current: Option<usize>,
    /// Id seen before the call's name.
    pending_id: Option<String>,
    arg_count: usize,
    needs_closing_quote: bool,
}

impl MapState {
    fn visit(&mut self, capture: &Capture, input: &str) {
        let text = capture.text(input);
        match capture.tag {
            Tag::Reasoning => self.message.reasoning_content = text.trim_end().to_string(),
            Tag::Content => {
                self.message.content = match self.mapper {
                    Mapper::Generic if text.starts_with('"') => decode_json_string_prefix(text),
                    _ => text.trim_end().to_string(),
                }
            }
            _ => match self.mapper {
                Mapper::Base => {}
                Mapper::Native | Mapper::Generic => self.native(capture, text),
                Mapper::Constructed => self.constructed(capture, text),
            },
        }
    }

    /// Start a call once its name is complete so that a streamed name is
    /// never reported half-written.
    fn open_call(&mut self, capture: &Capture, name: &str) {
        if !capture.complete {
            return;
        }
        self.message.tool_calls.push(ToolCall {
            name: name.to_string(),
            arguments: String::new(),
            id: self.pending_id.take().unwrap_or_default(),
        });
        self.current = Some(self.message.tool_calls.len() - 1);
    }

    fn current_call(&mut self) -> Option<&mut ToolCall> {
        self.current.map(|i| &mut self.message.tool_calls[i])
    }

    fn native(&mut self, capture: &Capture, text: &str) {
        match capture.tag {
            Tag::ToolOpen => {
                self.current = None;
                self.pending_id = None;
            }
            Tag::ToolName => self.open_call(capture, text.trim_end()),
            Tag::ToolId => {
                let id = text.trim_end().to_string();
                match self.current_call() {
                    Some(call) => call.id = id,
                    None => self.pending_id = Some(id),
                }
            }
            Tag::ToolArgs => {
                if let Some(call) = self.current_call() {
                    call.arguments = native_arguments(&call.name, text.trim_end(), capture.complete);
                }
            }
            _ => {}
        }
    }

    fn constructed(&mut self, capture: &Capture, text: &str) {
        match capture.tag {
            Tag::ToolOpen => {
                self.current = None;
                self.arg_count = 0;
            }
            Tag::ToolName => {
                self.open_call(capture, text);
                if let Some(call) = self.current_call() {
                    call.arguments.push('{');
                }
            }
            Tag::ToolArgOpen => self.needs_closing_quote = false,
            Tag::ToolArgName => {
                let comma = self.arg_count > 0;
                if let Some(call) = self.current_call() {
                    if comma {
                        call.arguments.push(',');
                    }
                    call.arguments.push_str(&json_quote(text.trim_end()));
                    call.arguments.push(':');
                    self.arg_count += 1;
                }
            }
            Tag::ToolArgStringValue => {
                if let Some(call) = self.current_call() {
                    let quoted = json_quote(text);
                    call.arguments.push_str(&quoted[..quoted.len() - 1]);
                    self.needs_closing_quote = true;
                }
            }
            Tag::ToolArgClose => {
                let quote = self.needs_closing_quote;
                if let Some(call) = self.current_call() {
                    if quote {
                        call.arguments.push('"');
                    }
                }
                self.needs_closing_quote = false;
            }
            Tag::ToolArgJsonValue => {
                if let Some(call) = self.current_call() {
                    call.arguments.push_str(text.trim_end());
                }
            }
            Tag::ToolClose => {
                if let Some(call) = self.current_call() {
                    call.arguments.push('}');
                }
            }
            _ => {}
        }
    }
}

/// Arguments of a native call. Raw code for the code tools is wrapped as
/// `{"code": ...}`, left open until the capture is complete.
fn native_arguments(name: &str, text: &str, complete: bool) -> String {
    if !RAW_CODE_TOOLS.contains(&name) || text.is_empty() || text.starts_with('{') {
        return text.to_string();
    }
    let quoted = json_quote(text);
    let mut out = format!("{{\"code\": {}", &quoted[..quoted.len() - 1]);
    if complete {
        out.push_str("\"}");
    }
    out
}

fn json_quote(text: &str) -> String {
    serde_json::Value::String(text.to_string()).to_string()
}

/// Decode a JSON string literal, tolerating truncation: decoding stops at
/// the closing quote or where the text runs out, and an escape cut short is
/// dropped.
fn decode_json_string_prefix(text: &str) -> String {
    let mut out = String::new();
    let mut chars = text.chars().skip(1);
    while let Some(c) = chars.next() {
        match c {
            '"' => break,
            '\\' => {
                let decoded = match chars.next() {
                    Some('n') => '\n',
                    Some('t') => '\t',
                    Some('r') => '\r',
                    Some('b') => '\u{8}',
                    Some('f') => '\u{c}',
                    Some('u') => {
                        let hex: String = chars.by_ref().take(4).collect();
                        let Some(hi) = u32::from_str_radix(&hex, 16).ok().filter(|_| hex.len() == 4) else {
                            break;
                        };
                        if (0xD800..0xDC00).contains(&hi) {
                            // High surrogate: the low half must follow as \uXXXX.
                            let rest: String = chars.by_ref().take(6).collect();
                            let low = rest
                                .strip_prefix("\\u")
                                .filter(|h| h.len() == 4)
                                .and_then(|h| u32::from_str_radix(h, 16).ok());
                            match low {
                                Some(lo) if (0xDC00..0xE000).contains(&lo) => {
                                    match char::from_u32(0x10000 + ((hi - 0xD800) << 10) + (lo - 0xDC00)) {
                                        Some(c) => c,
                                        None => break,
                                    }
                                }
                                _ => break,
                            }
                        } else {
                            match char::from_u32(hi) {
                                Some(c) => c,
                                None => break,
                            }
                        }
                    }
                    Some(other) => other,
                    None => break,
                };
                out.push(decoded);
            }
            c => out.push(c),
        }
    }
    out
}
