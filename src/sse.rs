//! Decoder for the upstream Server-Sent Events stream.
//!
//! The chat-completion API streams `data: {json}` events and ends with
//! `data: [DONE]`. Network chunks split lines (and multi-byte UTF-8
//! sequences) anywhere, so raw bytes are buffered until a full line exists.

use serde::Deserialize;

pub const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
  Data(String),
  Done,
}

#[derive(Debug, Default)]
pub struct SseDecoder {
  buf: Vec<u8>,
  data_lines: Vec<String>,
}

impl SseDecoder {
  pub fn new() -> Self { Self::default() }

  /// Feed one network chunk; returns every event completed by it.
  pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
    self.buf.extend_from_slice(chunk);
    let mut events = Vec::new();

    while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
      let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
      line.pop();
      if line.last() == Some(&b'\r') {
        line.pop();
      }
      let line = String::from_utf8_lossy(&line).into_owned();
      if let Some(ev) = self.handle_line(&line) {
        events.push(ev);
      }
    }
    events
  }

  /// Flush a trailing event that was not terminated by a blank line.
  pub fn finish(&mut self) -> Option<SseEvent> {
    if !self.buf.is_empty() {
      let rest = std::mem::take(&mut self.buf);
      let line = String::from_utf8_lossy(&rest).trim_end_matches('\r').to_string();
      if let Some(ev) = self.handle_line(&line) {
        return Some(ev);
      }
    }
    self.dispatch()
  }

  fn handle_line(&mut self, line: &str) -> Option<SseEvent> {
    if line.is_empty() {
      return self.dispatch();
    }
    if line.starts_with(':') {
      return None;
    }
    let (field, value) = match line.find(':') {
      Some(i) => {
        let v = &line[i + 1..];
        (&line[..i], v.strip_prefix(' ').unwrap_or(v))
      }
      None => (line, ""),
    };
    if field == "data" {
      self.data_lines.push(value.to_string());
    }
    None
  }

  fn dispatch(&mut self) -> Option<SseEvent> {
    if self.data_lines.is_empty() {
      return None;
    }
    let data = std::mem::take(&mut self.data_lines).join("\n");
    if data.trim() == DONE_SENTINEL {
      Some(SseEvent::Done)
    } else {
      Some(SseEvent::Data(data))
    }
  }
}

#[derive(Deserialize)]
struct ChunkWrap {
  #[serde(default)]
  choices: Vec<ChunkChoice>,
}
#[derive(Deserialize)]
struct ChunkChoice {
  #[serde(default)]
  delta: Option<ChunkDelta>,
}
#[derive(Deserialize)]
struct ChunkDelta {
  #[serde(default)]
  content: Option<String>,
}

/// Pull `choices[0].delta.content` out of a chat-completion chunk.
pub fn delta_content(payload: &str) -> Option<String> {
  let chunk: ChunkWrap = serde_json::from_str(payload).ok()?;
  chunk
    .choices
    .into_iter()
    .next()
    .and_then(|c| c.delta)
    .and_then(|d| d.content)
    .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn events_split_across_chunks() {
    let mut d = SseDecoder::new();
    assert!(d.push(b"data: {\"a\"").is_empty());
    assert!(d.push(b":1}\n").is_empty());
    let evs = d.push(b"\ndata: [DONE]\n\n");
    assert_eq!(evs, vec![SseEvent::Data("{\"a\":1}".into()), SseEvent::Done]);
  }

  #[test]
  fn utf8_split_inside_a_character() {
    let bytes = "data: π≈3.14\n\n".as_bytes();
    let mut d = SseDecoder::new();
    // 'π' is two bytes starting at offset 6
    assert!(d.push(&bytes[..7]).is_empty());
    let evs = d.push(&bytes[7..]);
    assert_eq!(evs, vec![SseEvent::Data("π≈3.14".into())]);
  }

  #[test]
  fn comments_crlf_and_multiline_data() {
    let mut d = SseDecoder::new();
    let evs = d.push(b": keep-alive\r\nevent: message\r\ndata: one\r\ndata:two\r\n\r\n");
    assert_eq!(evs, vec![SseEvent::Data("one\ntwo".into())]);
  }

  #[test]
  fn finish_flushes_unterminated_event() {
    let mut d = SseDecoder::new();
    assert!(d.push(b"data: tail").is_empty());
    assert_eq!(d.finish(), Some(SseEvent::Data("tail".into())));
    assert_eq!(d.finish(), None);
  }

  #[test]
  fn delta_content_extraction() {
    let chunk = r#"{"id":"x","choices":[{"index":0,"delta":{"content":"Hel"},"finish_reason":null}]}"#;
    assert_eq!(delta_content(chunk), Some("Hel".into()));
    let role_only = r#"{"choices":[{"delta":{"role":"assistant"}}]}"#;
    assert_eq!(delta_content(role_only), None);
    assert_eq!(delta_content("not json"), None);
  }
}
