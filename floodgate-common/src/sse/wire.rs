//! Server-Sent Events text framing

use crate::events::Event;
use std::fmt::Write as _;

/// Media type of an event stream
pub const EVENT_STREAM_CONTENT_TYPE: &str = "text/event-stream";

/// Request header carrying the client's resume cursor
pub const LAST_EVENT_ID_HEADER: &str = "last-event-id";

/// Response headers of an event stream
pub const SSE_RESPONSE_HEADERS: [(&str, &str); 3] = [
    ("connection", "keep-alive"),
    ("content-type", EVENT_STREAM_CONTENT_TYPE),
    ("cache-control", "no-cache"),
];

/// Encode one event as an SSE frame, blank-line terminated
///
/// With `split_lines` every payload line gets its own `data:` field;
/// otherwise the payload is written as a single field.
pub fn encode_event(event: &Event, split_lines: bool) -> String {
    let mut frame = String::with_capacity(event.data().len() + 32);

    if !event.comment_text().is_empty() {
        for line in event.comment_text().lines() {
            let _ = writeln!(frame, ": {line}");
        }
    }

    if !event.data().is_empty() {
        if let Some(id) = event.id() {
            let _ = writeln!(frame, "id: {id}");
        }
        if split_lines {
            for line in event.data().split('\n') {
                let line = line.strip_suffix('\r').unwrap_or(line);
                let _ = writeln!(frame, "data: {line}");
            }
        } else {
            let _ = writeln!(frame, "data: {}", event.data());
        }
        if !event.event_name().is_empty() {
            let _ = writeln!(frame, "event: {}", event.event_name());
        }
        if let Some(retry) = event.retry() {
            let _ = writeln!(frame, "retry: {retry}");
        }
    }

    frame.push('\n');
    frame
}

/// Parse the `Last-Event-ID` header value; absent or blank means 0
pub fn parse_cursor(value: Option<&str>) -> Result<u64, std::num::ParseIntError> {
    match value.map(str::trim) {
        None | Some("") => Ok(0),
        Some(raw) => raw.parse::<u64>(),
    }
}

/// An event decoded from the wire
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    pub id: Option<String>,
    pub data: String,
    pub event: Option<String>,
    pub retry: Option<String>,
}

impl Frame {
    pub fn has_content(&self) -> bool {
        !self.data.is_empty() || self.event.is_some() || self.retry.is_some()
    }
}

/// Decode complete frames from an event-stream body
///
/// Frames are separated by a blank line (`\n\n`, `\r\n\r\n` or `\r\r`).
/// Comment lines and unknown fields are ignored, a single space after the
/// colon is trimmed, and multiple `data` fields are joined with `\n`.
/// Frames without content (e.g. keep-alive comments) are dropped. Returns
/// the frames and the unconsumed tail of `input`.
pub fn parse_frames(input: &str) -> (Vec<Frame>, &str) {
    let mut frames = Vec::new();
    let mut rest = input;

    while let Some((block, tail)) = split_block(rest) {
        if let Some(frame) = parse_block(block) {
            frames.push(frame);
        }
        rest = tail;
    }
    (frames, rest)
}

fn split_block(input: &str) -> Option<(&str, &str)> {
    ["\r\n\r\n", "\n\n", "\r\r"]
        .iter()
        .filter_map(|sep| input.find(sep).map(|at| (at, sep.len())))
        .min_by_key(|(at, _)| *at)
        .map(|(at, len)| (&input[..at], &input[at + len..]))
}

fn parse_block(block: &str) -> Option<Frame> {
    let mut frame = Frame::default();
    let mut data_lines: Vec<&str> = Vec::new();

    for line in block.split(['\n', '\r']) {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "id" => frame.id = Some(value.to_string()),
            "data" => data_lines.push(value),
            "event" => frame.event = Some(value.to_string()),
            "retry" => frame.retry = Some(value.to_string()),
            _ => {}
        }
    }

    frame.data = data_lines.join("\n");
    frame.has_content().then_some(frame)
}
