//! Purpose: Decode the store's `text/event-stream` change feed.
//! Exports: `SseFrame`, `SseReader`, `StreamItem`, `decode_frame`, `encode_frame`.
//! Role: Wire codec shared by the remote client (decode) and the emulator (encode).
//! Invariants: Frames end at a blank line; `data:` lines are joined with `\n`.
//! Invariants: `keep-alive` frames are skipped; `cancel`/`auth_revoked` end the stream.
use std::io::BufRead;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::error::{ApiResult, Error, ErrorKind};
use crate::core::event::{ChangeEvent, EventKind};

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SseFrame {
    pub event: String,
    pub data: String,
}

pub struct SseReader<R> {
    reader: R,
}

impl<R: BufRead> SseReader<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    pub fn next_frame(&mut self) -> ApiResult<Option<SseFrame>> {
        let mut frame = SseFrame::default();
        let mut data_lines: Vec<String> = Vec::new();
        let mut seen_field = false;
        loop {
            let mut line = String::new();
            let bytes = self.reader.read_line(&mut line).map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("failed to read event stream")
                    .with_source(err)
            })?;
            if bytes == 0 {
                if !seen_field {
                    return Ok(None);
                }
                frame.data = data_lines.join("\n");
                return Ok(Some(frame));
            }
            let line = line.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                if !seen_field {
                    continue;
                }
                frame.data = data_lines.join("\n");
                return Ok(Some(frame));
            }
            if line.starts_with(':') {
                continue;
            }
            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "event" => frame.event = value.to_string(),
                "data" => data_lines.push(value.to_string()),
                _ => continue,
            }
            seen_field = true;
        }
    }
}

#[derive(Deserialize, Serialize)]
struct EventPayload {
    path: String,
    data: Value,
}

#[derive(Debug, PartialEq)]
pub enum StreamItem {
    Event(ChangeEvent),
    KeepAlive,
}

pub fn decode_frame(frame: &SseFrame) -> ApiResult<StreamItem> {
    let kind = match frame.event.as_str() {
        "put" => EventKind::Put,
        "patch" => EventKind::Patch,
        "keep-alive" => return Ok(StreamItem::KeepAlive),
        "cancel" => {
            return Err(Error::new(ErrorKind::Permission)
                .with_message("listener cancelled by the database")
                .with_hint(control_detail(&frame.data)));
        }
        "auth_revoked" => {
            return Err(Error::new(ErrorKind::Permission)
                .with_message("listener credential revoked")
                .with_hint("Supply a fresh auth token and subscribe again."));
        }
        other => {
            return Err(Error::new(ErrorKind::Protocol)
                .with_message(format!("unknown stream event `{other}`")));
        }
    };
    let payload: EventPayload = serde_json::from_str(&frame.data).map_err(|err| {
        Error::new(ErrorKind::Protocol)
            .with_message("invalid stream event json")
            .with_source(err)
    })?;
    Ok(StreamItem::Event(ChangeEvent {
        kind,
        path: payload.path,
        data: payload.data,
    }))
}

pub fn encode_frame(event: &ChangeEvent) -> ApiResult<Vec<u8>> {
    let payload = EventPayload {
        path: event.path.clone(),
        data: event.data.clone(),
    };
    let data = serde_json::to_string(&payload).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to encode stream event")
            .with_source(err)
    })?;
    Ok(format!("event: {}\ndata: {data}\n\n", event.kind).into_bytes())
}

pub const KEEP_ALIVE_FRAME: &[u8] = b"event: keep-alive\ndata: null\n\n";

fn control_detail(data: &str) -> String {
    match serde_json::from_str::<Value>(data) {
        Ok(Value::String(reason)) => reason,
        _ if data.is_empty() || data == "null" => "The database closed the stream.".to_string(),
        _ => data.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::{KEEP_ALIVE_FRAME, SseFrame, SseReader, StreamItem, decode_frame, encode_frame};
    use crate::core::error::ErrorKind;
    use crate::core::event::{ChangeEvent, EventKind};
    use serde_json::json;
    use std::io::Cursor;

    fn frames(raw: &str) -> Vec<SseFrame> {
        let mut reader = SseReader::new(Cursor::new(raw.as_bytes().to_vec()));
        let mut out = Vec::new();
        while let Some(frame) = reader.next_frame().expect("frame") {
            out.push(frame);
        }
        out
    }

    #[test]
    fn reads_put_and_patch_frames() {
        let raw = "event: put\ndata: {\"path\":\"/\",\"data\":{\"a\":1}}\n\n\
                   event: patch\ndata: {\"path\":\"/a\",\"data\":{\"b\":2}}\n\n";
        let decoded: Vec<_> = frames(raw)
            .iter()
            .map(|frame| decode_frame(frame).expect("decode"))
            .collect();
        assert_eq!(
            decoded,
            vec![
                StreamItem::Event(ChangeEvent::put("/", json!({"a": 1}))),
                StreamItem::Event(ChangeEvent::patch("/a", json!({"b": 2}))),
            ]
        );
    }

    #[test]
    fn handles_crlf_comments_and_multiline_data() {
        let raw = ": hello\r\nevent: put\r\ndata: {\"path\":\"/\",\r\ndata: \"data\":null}\r\n\r\n";
        let parsed = frames(raw);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].data, "{\"path\":\"/\",\n\"data\":null}");
        let item = decode_frame(&parsed[0]).expect("decode");
        assert_eq!(item, StreamItem::Event(ChangeEvent::put("/", json!(null))));
    }

    #[test]
    fn trailing_frame_without_blank_line_is_delivered() {
        let parsed = frames("event: keep-alive\ndata: null");
        assert_eq!(parsed.len(), 1);
        assert_eq!(decode_frame(&parsed[0]).expect("decode"), StreamItem::KeepAlive);
    }

    #[test]
    fn control_events_are_errors() {
        let cancel = SseFrame {
            event: "cancel".to_string(),
            data: "\"Permission denied\"".to_string(),
        };
        let err = decode_frame(&cancel).expect_err("cancel");
        assert_eq!(err.kind(), ErrorKind::Permission);
        assert_eq!(err.hint(), Some("Permission denied"));

        let revoked = SseFrame {
            event: "auth_revoked".to_string(),
            data: "null".to_string(),
        };
        assert_eq!(decode_frame(&revoked).expect_err("revoked").kind(), ErrorKind::Permission);
    }

    #[test]
    fn malformed_payload_is_protocol_error() {
        let frame = SseFrame {
            event: "put".to_string(),
            data: "not json".to_string(),
        };
        assert_eq!(decode_frame(&frame).expect_err("bad").kind(), ErrorKind::Protocol);
    }

    #[test]
    fn encoded_frames_decode_back() {
        let event = ChangeEvent::patch("/-Nabc", json!({"users": ["u1"]}));
        let bytes = encode_frame(&event).expect("encode");
        let text = String::from_utf8(bytes).expect("utf8");
        let parsed = frames(&text);
        assert_eq!(parsed[0].event, "patch");
        match decode_frame(&parsed[0]).expect("decode") {
            StreamItem::Event(decoded) => {
                assert_eq!(decoded.kind, EventKind::Patch);
                assert_eq!(decoded, event);
            }
            other => panic!("unexpected item {other:?}"),
        }
        let keep_alive = frames(std::str::from_utf8(KEEP_ALIVE_FRAME).expect("utf8"));
        assert_eq!(decode_frame(&keep_alive[0]).expect("decode"), StreamItem::KeepAlive);
    }
}
