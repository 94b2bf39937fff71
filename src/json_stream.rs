//! Incremental accumulation of a streamed JSON tutor reply.
//!
//! The tutor prompt asks for `{"stepType": "...", "content": "..."}` and the
//! completion arrives token by token. While streaming we re-scan the buffer
//! and expose the decoded prefix of the `content` string so clients can
//! render text before the object closes. When the stream ends `finish`
//! parses the whole thing, repairing truncated JSON where possible and
//! falling back to the raw text when the model ignored the format.

use serde::Deserialize;
use tracing::debug;

use crate::domain::{StepType, TutorReply};
use crate::format::{fix_math_formatting, infer_step_type, strip_code_fences};

const FENCE: &str = "```";
const CONTENT_KEY: &str = "content";
const STEP_KEYS: &[&str] = &["stepType", "step_type"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
  Undecided,
  Json,
  Raw,
}

#[derive(Debug, Clone, PartialEq)]
struct PartialString {
  value: String,
  terminated: bool,
}

#[derive(Debug, Default)]
struct Scan {
  fields: Vec<(String, PartialString)>,
  closed: bool,
}

impl Scan {
  fn get(&self, key: &str) -> Option<&PartialString> {
    self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| v)
  }
}

#[derive(Debug)]
pub struct JsonAccumulator {
  buf: String,
  emitted: usize,
}

impl Default for JsonAccumulator {
  fn default() -> Self { Self::new() }
}

impl JsonAccumulator {
  pub fn new() -> Self {
    Self { buf: String::new(), emitted: 0 }
  }

  pub fn push(&mut self, token: &str) {
    self.buf.push_str(token);
  }

  pub fn raw(&self) -> &str {
    &self.buf
  }

  fn fenced(&self) -> bool {
    self.buf.trim_start().starts_with(FENCE)
  }

  /// Buffer without leading whitespace and without an opening code fence line.
  /// None while the opening fence line is incomplete.
  fn body(&self) -> Option<&str> {
    let t = self.buf.trim_start();
    if t.starts_with(FENCE) {
      let nl = t.find('\n')?;
      return Some(t[nl + 1..].trim_start());
    }
    // "`" or "``" may still grow into a fence.
    if !t.is_empty() && FENCE.starts_with(t) {
      return None;
    }
    Some(t)
  }

  fn mode(&self) -> Mode {
    match self.body() {
      None => Mode::Undecided,
      Some(b) if b.is_empty() => Mode::Undecided,
      Some(b) if b.starts_with('{') => Mode::Json,
      Some(_) => Mode::Raw,
    }
  }

  fn scan(&self) -> Scan {
    match self.body() {
      Some(b) => scan_top_level(b),
      None => Scan::default(),
    }
  }

  /// Decoded value of a top-level string field, possibly still open.
  pub fn partial_string(&self, key: &str) -> Option<String> {
    if self.mode() != Mode::Json {
      return None;
    }
    self.scan().get(key).map(|p| p.value.clone())
  }

  fn current_content(&self) -> String {
    match self.mode() {
      Mode::Undecided => String::new(),
      Mode::Json => self.partial_string(CONTENT_KEY).unwrap_or_default(),
      Mode::Raw => {
        let body = self.body().unwrap_or_default();
        let visible = if self.fenced() { without_closing_fence(body) } else { body };
        visible.to_string()
      }
    }
  }

  /// New content since the last call. Never re-emits or retracts text.
  pub fn take_content_delta(&mut self) -> String {
    let current = self.current_content();
    if current.len() <= self.emitted || !current.is_char_boundary(self.emitted) {
      return String::new();
    }
    let delta = current[self.emitted..].to_string();
    self.emitted = current.len();
    delta
  }

  /// Step type, once its string value has closed.
  pub fn step_type(&self) -> Option<StepType> {
    if self.mode() != Mode::Json {
      return None;
    }
    let scan = self.scan();
    STEP_KEYS
      .iter()
      .filter_map(|k| scan.get(k))
      .find(|p| p.terminated)
      .and_then(|p| StepType::parse_loose(&p.value))
  }

  /// True once the top-level object has closed.
  pub fn is_complete(&self) -> bool {
    self.mode() == Mode::Json && self.scan().closed
  }

  /// Parse the full reply, repairing or falling back as needed.
  pub fn finish(&self) -> TutorReply {
    #[derive(Deserialize)]
    struct RawReply {
      #[serde(default, rename = "stepType", alias = "step_type")]
      step_type: Option<String>,
      #[serde(default, alias = "text", alias = "message")]
      content: Option<String>,
    }

    let text = strip_code_fences(&self.buf);
    let parsed = if text.starts_with('{') {
      serde_json::from_str::<RawReply>(&text).ok().or_else(|| {
        let repaired = repair_truncated(&text);
        debug!(target: "tutor", raw_len = text.len(), "tutor reply is not valid JSON; trying repair");
        serde_json::from_str::<RawReply>(&repaired).ok()
      })
    } else {
      None
    };

    let (content, tag) = match parsed {
      Some(RawReply { content: Some(c), step_type }) => (c, step_type),
      _ => match self.partial_string(CONTENT_KEY).filter(|c| !c.trim().is_empty()) {
        Some(c) => {
          let tag = STEP_KEYS.iter().find_map(|k| self.partial_string(k));
          (c, tag)
        }
        None => {
          debug!(target: "tutor", "falling back to raw text for tutor reply");
          (text.clone(), None)
        }
      },
    };

    let content = fix_math_formatting(&content);
    let step_type = tag
      .as_deref()
      .and_then(StepType::parse_loose)
      .unwrap_or_else(|| infer_step_type(&content));
    TutorReply { content, step_type }
  }
}

/// Walk the top-level object and collect its string fields (open or closed).
/// Raw text minus a trailing line that is, or may become, a closing fence.
fn without_closing_fence(body: &str) -> &str {
  let trimmed = body.trim_end();
  let line_start = trimmed.rfind('\n').map(|i| i + 1).unwrap_or(0);
  let last = &trimmed[line_start..];
  if !last.is_empty() && last.len() <= FENCE.len() && last.chars().all(|c| c == '`') {
    &body[..line_start]
  } else {
    body
  }
}

fn scan_top_level(body: &str) -> Scan {
  let chars: Vec<char> = body.chars().collect();
  let mut scan = Scan::default();
  let mut i = 0usize;

  if chars.first() != Some(&'{') {
    return scan;
  }
  i += 1;

  loop {
    // key
    skip_ws(&chars, &mut i);
    match chars.get(i) {
      Some('}') => {
        scan.closed = true;
        return scan;
      }
      Some(',') => {
        i += 1;
        continue;
      }
      Some('"') => {}
      _ => return scan,
    }
    let key = read_string(&chars, &mut i);
    if !key.terminated {
      return scan;
    }

    skip_ws(&chars, &mut i);
    if chars.get(i) != Some(&':') {
      return scan;
    }
    i += 1;
    skip_ws(&chars, &mut i);

    // value
    match chars.get(i) {
      None => return scan,
      Some('"') => {
        let value = read_string(&chars, &mut i);
        let done = value.terminated;
        scan.fields.push((key.value, value));
        if !done {
          return scan;
        }
      }
      Some('{') | Some('[') => {
        if !skip_nested(&chars, &mut i) {
          return scan;
        }
      }
      Some(_) => {
        while let Some(c) = chars.get(i) {
          if *c == ',' || *c == '}' {
            break;
          }
          i += 1;
        }
      }
    }

    skip_ws(&chars, &mut i);
    match chars.get(i) {
      Some(',') => i += 1,
      Some('}') => {
        scan.closed = true;
        return scan;
      }
      _ => return scan,
    }
  }
}

fn skip_ws(chars: &[char], i: &mut usize) {
  while chars.get(*i).map(|c| c.is_whitespace()).unwrap_or(false) {
    *i += 1;
  }
}

/// Skip a nested object/array starting at `chars[*i]`; false if it never closes.
fn skip_nested(chars: &[char], i: &mut usize) -> bool {
  let mut depth = 0usize;
  while let Some(c) = chars.get(*i) {
    match c {
      '"' => {
        if !read_string(chars, i).terminated {
          return false;
        }
        continue;
      }
      '{' | '[' => depth += 1,
      '}' | ']' => {
        depth -= 1;
        if depth == 0 {
          *i += 1;
          return true;
        }
      }
      _ => {}
    }
    *i += 1;
  }
  false
}

fn hex4(chars: &[char], at: usize) -> Option<u32> {
  if at + 4 > chars.len() {
    return None;
  }
  let s: String = chars[at..at + 4].iter().collect();
  u32::from_str_radix(&s, 16).ok()
}

/// Read a JSON string starting at the opening quote. Stops (unterminated)
/// before an escape sequence that is not complete yet.
fn read_string(chars: &[char], i: &mut usize) -> PartialString {
  let mut value = String::new();
  *i += 1;
  while let Some(&c) = chars.get(*i) {
    match c {
      '"' => {
        *i += 1;
        return PartialString { value, terminated: true };
      }
      '\\' => {
        let Some(&esc) = chars.get(*i + 1) else {
          break;
        };
        match esc {
          'n' => value.push('\n'),
          't' => value.push('\t'),
          'r' => value.push('\r'),
          'b' => value.push('\u{8}'),
          'f' => value.push('\u{c}'),
          '/' => value.push('/'),
          '\\' => value.push('\\'),
          '"' => value.push('"'),
          'u' => {
            let Some(hi) = hex4(chars, *i + 2) else {
              // incomplete or garbage; wait for more input
              break;
            };
            if (0xD800..0xDC00).contains(&hi) {
              let low_at = *i + 6;
              if chars.len() < low_at + 6 {
                break;
              }
              if chars[low_at] == '\\' && chars[low_at + 1] == 'u' {
                if let Some(lo) = hex4(chars, low_at + 2).filter(|lo| (0xDC00..0xE000).contains(lo)) {
                  let cp = 0x10000 + ((hi - 0xD800) << 10) + (lo - 0xDC00);
                  value.push(char::from_u32(cp).unwrap_or('\u{FFFD}'));
                  *i += 12;
                  continue;
                }
              }
              value.push('\u{FFFD}');
            } else {
              value.push(char::from_u32(hi).unwrap_or('\u{FFFD}'));
            }
            *i += 6;
            continue;
          }
          other => value.push(other),
        }
        *i += 2;
      }
      _ => {
        value.push(c);
        *i += 1;
      }
    }
  }
  PartialString { value, terminated: false }
}

/// Close whatever the truncated stream left open so `serde_json` can try again.
fn repair_truncated(text: &str) -> String {
  let mut stack: Vec<char> = Vec::new();
  let mut in_string = false;
  let mut escaped = false;
  for c in text.chars() {
    if in_string {
      if escaped {
        escaped = false;
      } else if c == '\\' {
        escaped = true;
      } else if c == '"' {
        in_string = false;
      }
      continue;
    }
    match c {
      '"' => in_string = true,
      '{' => stack.push('}'),
      '[' => stack.push(']'),
      '}' | ']' => {
        stack.pop();
      }
      _ => {}
    }
  }

  let mut out = text.to_string();
  if in_string {
    if escaped {
      out.pop();
    }
    out.push('"');
  }
  let trimmed_len = out.trim_end().len();
  out.truncate(trimmed_len);
  if out.ends_with(',') {
    out.pop();
  } else if out.ends_with(':') {
    out.push_str("null");
  }
  while let Some(close) = stack.pop() {
    out.push(close);
  }
  out
}

#[cfg(test)]
mod tests {
  use super::*;

  fn feed_chars(acc: &mut JsonAccumulator, text: &str, step: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut streamed = String::new();
    for chunk in chars.chunks(step) {
      acc.push(&chunk.iter().collect::<String>());
      streamed.push_str(&acc.take_content_delta());
    }
    streamed
  }

  #[test]
  fn streams_decoded_content_in_small_pieces() {
    let reply = r#"{"stepType":"hint","content":"What is \"x\"?\nTry 2² first."}"#;
    for step in [1, 2, 3, 7] {
      let mut acc = JsonAccumulator::new();
      let streamed = feed_chars(&mut acc, reply, step);
      assert_eq!(streamed, "What is \"x\"?\nTry 2² first.", "step {step}");
      assert_eq!(acc.step_type(), Some(StepType::Hint));
      assert!(acc.is_complete());
    }
  }

  #[test]
  fn withholds_incomplete_escape() {
    let mut acc = JsonAccumulator::new();
    acc.push(r#"{"content":"a\"#);
    assert_eq!(acc.take_content_delta(), "a");
    acc.push(r#"n b"#);
    assert_eq!(acc.take_content_delta(), "\n b");
    acc.push(r#"\ud83d"#);
    assert_eq!(acc.take_content_delta(), "");
    acc.push(r#"\ude00!"}"#);
    assert_eq!(acc.take_content_delta(), "😀!");
    assert!(acc.is_complete());
  }

  #[test]
  fn step_type_only_after_its_string_closes() {
    let mut acc = JsonAccumulator::new();
    acc.push(r#"{"stepType":"fin"#);
    assert_eq!(acc.step_type(), None);
    acc.push(r#"al","content":""#);
    assert_eq!(acc.step_type(), Some(StepType::Final));
    assert!(!acc.is_complete());
  }

  #[test]
  fn keys_inside_strings_and_nested_values_do_not_match() {
    let mut acc = JsonAccumulator::new();
    acc.push(r#"{"meta":{"content":"no","list":["}"]},"content":"say \"stepType\": \"final\"","stepType":"check"}"#);
    assert_eq!(acc.partial_string("content").as_deref(), Some("say \"stepType\": \"final\""));
    assert_eq!(acc.step_type(), Some(StepType::Check));
    assert!(acc.is_complete());
  }

  #[test]
  fn finish_repairs_truncated_json() {
    let mut acc = JsonAccumulator::new();
    acc.push(r#"{"stepType":"final","content":"The answer is \\(4\\)"#);
    let reply = acc.finish();
    assert_eq!(reply.content, "The answer is $4$");
    assert_eq!(reply.step_type, StepType::Final);
  }

  #[test]
  fn finish_uses_partial_content_when_repair_fails() {
    let mut acc = JsonAccumulator::new();
    acc.push(r#"{"content":"Think about halves.","step"#);
    let reply = acc.finish();
    assert_eq!(reply.content, "Think about halves.");
    assert_eq!(reply.step_type, StepType::Hint);
  }

  #[test]
  fn raw_text_streams_and_infers_step_type() {
    let mut acc = JsonAccumulator::new();
    let streamed = feed_chars(&mut acc, "So the final answer is 9.", 4);
    assert_eq!(streamed, "So the final answer is 9.");
    assert_eq!(acc.step_type(), None);
    let reply = acc.finish();
    assert_eq!(reply.content, "So the final answer is 9.");
    assert_eq!(reply.step_type, StepType::Final);
  }

  #[test]
  fn fenced_json_is_understood() {
    let mut acc = JsonAccumulator::new();
    let streamed = feed_chars(&mut acc, "```json\n{\"stepType\":\"check\",\"content\":\"ok\"}\n```", 5);
    assert_eq!(streamed, "ok");
    let reply = acc.finish();
    assert_eq!(reply, TutorReply { content: "ok".into(), step_type: StepType::Check });
  }

  #[test]
  fn leading_inline_code_is_not_a_fence() {
    let mut acc = JsonAccumulator::new();
    let mut streamed = String::new();
    for token in ["`x` is", " the unknown.", "\nSo try 2."] {
      acc.push(token);
      streamed.push_str(&acc.take_content_delta());
    }
    assert_eq!(streamed, "`x` is the unknown.\nSo try 2.");
    assert_eq!(acc.finish().content, streamed);
  }

  #[test]
  fn fenced_raw_text_withholds_closing_fence() {
    for step in [1, 2, 5] {
      let mut acc = JsonAccumulator::new();
      let streamed = feed_chars(&mut acc, "```\nHalf of 8 is 4.\n```", step);
      assert!(!streamed.contains('`'), "step {step}: {streamed:?}");
      assert_eq!(streamed.trim_end(), "Half of 8 is 4.");
      assert_eq!(acc.finish().content, "Half of 8 is 4.");
    }
  }

  #[test]
  fn repair_closes_brackets_and_dangling_separators() {
    assert_eq!(repair_truncated(r#"{"a":[1,2"#), r#"{"a":[1,2]}"#);
    assert_eq!(repair_truncated(r#"{"a":1,"#), r#"{"a":1}"#);
    assert_eq!(repair_truncated(r#"{"a":"#), r#"{"a":null}"#);
    assert_eq!(repair_truncated(r#"{"a":"x\"#), r#"{"a":"x"}"#);
  }
}
