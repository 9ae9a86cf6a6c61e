//! ABOUTME: Wire protocol model for debugger-to-adapter messages
//! ABOUTME: Serde message shapes plus the framed unbuffered writer

use crate::error::{DebugError, Result};
use serde::Serialize;
use std::io::Write;

/// Discriminator carried by every protocol message
pub const PROTOCOL_TAG: &str = "$luaDebug";

/// Token written immediately before each JSON payload
pub const FRAME_START: &str = "@lldbg|";

/// Token written immediately after each JSON payload
pub const FRAME_END: &str = "|lldbg@";

/// Why execution halted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BreakType {
    Step,
    Breakpoint,
    Error,
}

/// Source position translated through a source map
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MappedLocation {
    pub source: String,
    pub line: u32,
    pub column: u32,
}

/// One call-stack frame as shown to the adapter
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    pub source: String,
    pub line: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub func: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mapped_location: Option<MappedLocation>,
}

/// A named value in a variable listing
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Variable {
    pub name: String,
    #[serde(rename = "type")]
    pub value_type: String,
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
}

/// An anonymous value (evaluation results, metatable summaries)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValueInfo {
    #[serde(rename = "type")]
    pub value_type: String,
    pub value: String,
}

/// The `length` slot of a `properties` message
///
/// Plain tables report a number. Values whose `__len` metamethod produces a
/// non-numeric result report it as a typed value; a metamethod that raises
/// reports the error text instead.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum LengthField {
    Count(u64),
    Value {
        #[serde(rename = "type")]
        value_type: String,
        value: String,
    },
    Error {
        #[serde(rename = "type")]
        value_type: String,
        error: String,
    },
}

/// One breakpoint in a `breakpoints` listing
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakpointInfo {
    pub file: String,
    pub line: u32,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

/// One cooperative thread in a `threads` listing
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThreadInfo {
    pub id: u64,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
}

/// Every message the debugger can emit
///
/// The `type` field is the schema discriminator of the framed protocol; the
/// outer `tag` field is added by [`ProtocolWriter`] at serialisation time.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Message {
    Error {
        error: String,
    },
    #[serde(rename_all = "camelCase")]
    DebugBreak {
        message: String,
        break_type: BreakType,
        thread_id: u64,
    },
    Result {
        results: Vec<ValueInfo>,
    },
    Stack {
        frames: Vec<Frame>,
    },
    Variables {
        variables: Vec<Variable>,
    },
    Properties {
        properties: Vec<Variable>,
        #[serde(skip_serializing_if = "Option::is_none")]
        metatable: Option<ValueInfo>,
        #[serde(skip_serializing_if = "Option::is_none")]
        length: Option<LengthField>,
    },
    Breakpoints {
        breakpoints: Vec<BreakpointInfo>,
    },
    Threads {
        threads: Vec<ThreadInfo>,
    },
}

impl Message {
    /// Diagnostic error message shorthand
    #[must_use]
    pub fn error(text: impl Into<String>) -> Self {
        Self::Error { error: text.into() }
    }
}

#[derive(Serialize)]
struct Tagged<'a> {
    tag: &'static str,
    #[serde(flatten)]
    message: &'a Message,
}

/// Framed writer for the newline-free token protocol
///
/// Every message is written as `@lldbg|<json>|lldbg@` with no separator and
/// flushed immediately; there is a single writer, so messages are totally
/// ordered on the wire.
pub struct ProtocolWriter<W: Write> {
    sink: W,
}

impl<W: Write> ProtocolWriter<W> {
    /// Wrap a sink
    pub const fn new(sink: W) -> Self {
        Self { sink }
    }

    /// Serialise and frame one message, then flush
    ///
    /// # Errors
    ///
    /// Returns an error if serialisation fails or the sink rejects the write.
    pub fn send(&mut self, message: &Message) -> Result<()> {
        let tagged = Tagged {
            tag: PROTOCOL_TAG,
            message,
        };
        let json = serde_json::to_string(&tagged)?;
        tracing::trace!(payload = %json, "protocol send");
        self.sink
            .write_all(FRAME_START.as_bytes())
            .and_then(|()| self.sink.write_all(json.as_bytes()))
            .and_then(|()| self.sink.write_all(FRAME_END.as_bytes()))
            .and_then(|()| self.sink.flush())
            .map_err(|e| DebugError::OutputSink {
                message: e.to_string(),
            })
    }

    /// Consume the writer, returning the sink
    pub fn into_inner(self) -> W {
        self.sink
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_to_string(message: &Message) -> String {
        let mut writer = ProtocolWriter::new(Vec::new());
        writer.send(message).unwrap();
        String::from_utf8(writer.into_inner()).unwrap()
    }

    #[test]
    fn test_framing_tokens() {
        let out = frame_to_string(&Message::error("boom"));
        assert!(out.starts_with(FRAME_START));
        assert!(out.ends_with(FRAME_END));
        let inner = &out[FRAME_START.len()..out.len() - FRAME_END.len()];
        let value: serde_json::Value = serde_json::from_str(inner).unwrap();
        assert_eq!(value["tag"], "$luaDebug");
        assert_eq!(value["type"], "error");
        assert_eq!(value["error"], "boom");
    }

    #[test]
    fn test_debug_break_shape() {
        let out = frame_to_string(&Message::DebugBreak {
            message: "breakpoint hit".to_string(),
            break_type: BreakType::Breakpoint,
            thread_id: 1,
        });
        assert!(out.contains("\"type\":\"debugBreak\""));
        assert!(out.contains("\"breakType\":\"breakpoint\""));
        assert!(out.contains("\"threadId\":1"));
    }

    #[test]
    fn test_empty_arrays_are_explicit() {
        let out = frame_to_string(&Message::Stack { frames: vec![] });
        assert!(out.contains("\"frames\":[]"));

        let out = frame_to_string(&Message::Threads { threads: vec![] });
        assert!(out.contains("\"threads\":[]"));
    }

    #[test]
    fn test_string_escaping() {
        let out = frame_to_string(&Message::error("line1\nline2\t\"quoted\"\\"));
        assert!(out.contains(r#"line1\nline2\t\"quoted\"\\"#));
    }

    #[test]
    fn test_optional_fields_omitted() {
        let frame = Frame {
            source: "main.lua".to_string(),
            line: 3,
            func: None,
            active: None,
            mapped_location: None,
        };
        let out = frame_to_string(&Message::Stack {
            frames: vec![frame],
        });
        assert!(!out.contains("func"));
        assert!(!out.contains("mappedLocation"));
        assert!(!out.contains("active"));
    }

    #[test]
    fn test_mapped_location_shape() {
        let frame = Frame {
            source: "out.lua".to_string(),
            line: 17,
            func: Some("handler".to_string()),
            active: Some(true),
            mapped_location: Some(MappedLocation {
                source: "/src/main.ts".to_string(),
                line: 5,
                column: 3,
            }),
        };
        let out = frame_to_string(&Message::Stack {
            frames: vec![frame],
        });
        assert!(out.contains("\"mappedLocation\":{\"source\":\"/src/main.ts\",\"line\":5,\"column\":3}"));
        assert!(out.contains("\"active\":true"));
    }

    #[test]
    fn test_length_field_variants() {
        let numeric = serde_json::to_string(&LengthField::Count(4)).unwrap();
        assert_eq!(numeric, "4");

        let typed = serde_json::to_string(&LengthField::Value {
            value_type: "string".to_string(),
            value: "n/a".to_string(),
        })
        .unwrap();
        assert_eq!(typed, r#"{"type":"string","value":"n/a"}"#);

        let errored = serde_json::to_string(&LengthField::Error {
            value_type: "table".to_string(),
            error: "__len failed".to_string(),
        })
        .unwrap();
        assert_eq!(errored, r#"{"type":"table","error":"__len failed"}"#);
    }

    #[test]
    fn test_breakpoint_condition_omitted_when_absent() {
        let out = frame_to_string(&Message::Breakpoints {
            breakpoints: vec![BreakpointInfo {
                file: "a.lua".to_string(),
                line: 10,
                enabled: true,
                condition: None,
            }],
        });
        assert!(!out.contains("condition"));
    }
}
