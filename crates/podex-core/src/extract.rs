// Inline tool-call extraction
//
// Some backends emit tool calls as JSON inside the assistant text instead
// of using the native tool-call channel. This module finds objects of the
// shape {"name": ..., "arguments"|"input": ...} - bare or inside fenced
// code blocks - turns them into ToolCalls and strips the JSON from the
// reported content. Extraction is a fixed point: running it again on the
// stripped content finds nothing.

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;
use uuid::Uuid;

use crate::tools::ToolCall;

fn fenced_block_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").expect("fenced block regex")
    })
}

/// Result of extracting inline tool calls from assistant content
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedToolCalls {
    /// Content with the tool-call JSON removed
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
}

/// Extract inline JSON tool calls from assistant content
pub fn extract_inline_tool_calls(content: &str) -> ExtractedToolCalls {
    let mut tool_calls = Vec::new();
    let mut remaining = String::with_capacity(content.len());

    // Pass 1: fenced code blocks
    let mut last_end = 0;
    for caps in fenced_block_re().captures_iter(content) {
        let whole = caps.get(0).expect("match");
        let body = caps.get(1).expect("group").as_str();

        if let Some(call) = parse_tool_call(body) {
            remaining.push_str(&content[last_end..whole.start()]);
            last_end = whole.end();
            tool_calls.push(call);
        }
    }
    remaining.push_str(&content[last_end..]);

    // Pass 2: bare top-level objects in the remaining text
    let stripped = strip_bare_objects(&remaining, &mut tool_calls);

    ExtractedToolCalls {
        content: collapse_blank_lines(&stripped),
        tool_calls,
    }
}

/// Parse a candidate JSON object into a tool call if it has the expected shape
fn parse_tool_call(text: &str) -> Option<ToolCall> {
    let value: Value = serde_json::from_str(text).ok()?;
    let obj = value.as_object()?;
    let name = obj.get("name")?.as_str()?.to_string();
    let arguments = obj
        .get("arguments")
        .or_else(|| obj.get("input"))?
        .clone();
    if !arguments.is_object() {
        return None;
    }
    Some(ToolCall {
        id: format!("inline_{}", Uuid::now_v7().simple()),
        name,
        arguments,
    })
}

/// Scan text for balanced top-level {...} spans that parse as tool calls,
/// removing the matched spans. String literals and nesting are respected;
/// anything that does not parse is left untouched.
fn strip_bare_objects(text: &str, tool_calls: &mut Vec<ToolCall>) -> String {
    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'{' {
            // Advance one UTF-8 character
            let ch_len = utf8_len(bytes[i]);
            out.push_str(&text[i..i + ch_len]);
            i += ch_len;
            continue;
        }

        match balanced_object_end(bytes, i) {
            Some(end) => {
                let candidate = &text[i..end];
                if let Some(call) = parse_tool_call(candidate) {
                    tool_calls.push(call);
                    i = end;
                } else {
                    out.push('{');
                    i += 1;
                }
            }
            None => {
                out.push('{');
                i += 1;
            }
        }
    }

    out
}

/// Find the end (exclusive) of a balanced JSON object starting at `start`
fn balanced_object_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(start + offset + 1);
                }
            }
            _ => {}
        }
    }
    None
}

fn utf8_len(first_byte: u8) -> usize {
    match first_byte {
        b if b < 0x80 => 1,
        b if b >= 0xF0 => 4,
        b if b >= 0xE0 => 3,
        _ => 2,
    }
}

/// Collapse runs of blank lines left behind by stripping and trim the ends
fn collapse_blank_lines(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut blank_run = 0;
    for line in text.lines() {
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line);
        out.push('\n');
    }
    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_fenced_json_block() {
        let content = "I'll write the file now.\n```json\n{\"name\": \"write_file\", \"arguments\": {\"path\": \"a.py\", \"content\": \"x = 1\"}}\n```\nDone.";
        let extracted = extract_inline_tool_calls(content);

        assert_eq!(extracted.tool_calls.len(), 1);
        assert_eq!(extracted.tool_calls[0].name, "write_file");
        assert_eq!(extracted.tool_calls[0].arguments["path"], "a.py");
        assert!(!extracted.content.contains("write_file"));
        assert!(extracted.content.contains("I'll write the file now."));
        assert!(extracted.content.contains("Done."));
    }

    #[test]
    fn test_extract_bare_object_with_input_key() {
        let content = "Running it: {\"name\": \"run_command\", \"input\": {\"command\": \"ls\"}} now";
        let extracted = extract_inline_tool_calls(content);

        assert_eq!(extracted.tool_calls.len(), 1);
        assert_eq!(extracted.tool_calls[0].name, "run_command");
        assert_eq!(extracted.tool_calls[0].arguments["command"], "ls");
        assert_eq!(extracted.content, "Running it:  now");
    }

    #[test]
    fn test_non_tool_json_left_alone() {
        let content = "Config looks like {\"debug\": true} here";
        let extracted = extract_inline_tool_calls(content);

        assert!(extracted.tool_calls.is_empty());
        assert_eq!(extracted.content, content);
    }

    #[test]
    fn test_arguments_must_be_object() {
        let content = "{\"name\": \"x\", \"arguments\": \"not an object\"}";
        let extracted = extract_inline_tool_calls(content);
        assert!(extracted.tool_calls.is_empty());
    }

    #[test]
    fn test_nested_braces_and_strings() {
        let content = r#"{"name": "write_file", "arguments": {"path": "b.rs", "content": "fn main() { println!(\"}{\"); }"}}"#;
        let extracted = extract_inline_tool_calls(content);

        assert_eq!(extracted.tool_calls.len(), 1);
        assert_eq!(extracted.tool_calls[0].arguments["path"], "b.rs");
        assert!(extracted.content.is_empty());
    }

    #[test]
    fn test_extraction_is_fixed_point() {
        let content = "before\n```json\n{\"name\": \"grep\", \"arguments\": {\"pattern\": \"todo\"}}\n```\nafter {\"name\": \"read_file\", \"arguments\": {\"path\": \"x\"}}";
        let first = extract_inline_tool_calls(content);
        assert_eq!(first.tool_calls.len(), 2);

        let second = extract_inline_tool_calls(&first.content);
        assert!(second.tool_calls.is_empty());
        assert_eq!(second.content, first.content);
    }

    #[test]
    fn test_multiple_fenced_blocks() {
        let content = "```json\n{\"name\": \"a\", \"arguments\": {}}\n```\nmid\n```json\n{\"name\": \"b\", \"arguments\": {}}\n```";
        let extracted = extract_inline_tool_calls(content);

        let names: Vec<_> = extracted.tool_calls.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(extracted.content, "mid");
    }

    #[test]
    fn test_unbalanced_brace_is_kept() {
        let content = "set { and forget";
        let extracted = extract_inline_tool_calls(content);
        assert!(extracted.tool_calls.is_empty());
        assert_eq!(extracted.content, content);
    }

    #[test]
    fn test_extracted_ids_are_unique() {
        let content = "{\"name\": \"a\", \"arguments\": {}} {\"name\": \"a\", \"arguments\": {}}";
        let extracted = extract_inline_tool_calls(content);
        assert_eq!(extracted.tool_calls.len(), 2);
        assert_ne!(extracted.tool_calls[0].id, extracted.tool_calls[1].id);
    }
}
