//! Numeric answer extraction and local grading.
//!
//! Student answers and model explanations arrive as free text ("x = 3/4",
//! "The answer is 1,250.", "\boxed{-2}"). Grading first tries to compare
//! numbers, then normalized text, and only reports `Inconclusive` when
//! neither applies so the caller can ask the model instead.

use serde::Serialize;

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GradeMethod {
  Choice,
  Numeric,
  Text,
  Model,
  Inconclusive,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct GradeOutcome {
  pub correct: bool,
  pub method: GradeMethod,
  /// What we read out of the student's answer, when anything.
  pub extracted: Option<String>,
}

const REL_TOLERANCE: f64 = 1e-6;

/// Parse one number written in any of the usual school notations.
pub fn parse_number(raw: &str) -> Option<f64> {
  let mut s = raw.trim().trim_matches('$').trim().trim_end_matches('.').trim().to_string();
  s = s.replace('−', "-").replace('–', "-");
  if let Some(inner) = frac_args(&s) {
    let (n, d) = inner;
    let n = parse_number(&n)?;
    let d = parse_number(&d)?;
    return if d == 0.0 { None } else { Some(n / d) };
  }
  if let Some(p) = s.strip_suffix('%') {
    return parse_plain(p.trim());
  }
  if let Some((n, d)) = s.split_once('/') {
    let n = parse_plain(n.trim())?;
    let d = parse_plain(d.trim())?;
    return if d == 0.0 { None } else { Some(n / d) };
  }
  parse_plain(&s)
}

fn parse_plain(s: &str) -> Option<f64> {
  let s = s.trim().trim_start_matches('+');
  if s.is_empty() {
    return None;
  }
  let cleaned = if looks_thousands_grouped(s) { s.replace(',', "") } else { s.to_string() };
  if !cleaned.chars().all(|c| c.is_ascii_digit() || c == '.' || c == '-') {
    return None;
  }
  cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// "1,234,567.5" style grouping; a lone "3,5" is not a number we accept.
fn looks_thousands_grouped(s: &str) -> bool {
  if !s.contains(',') {
    return false;
  }
  let int_part = s.trim_start_matches('-').split('.').next().unwrap_or("");
  let groups: Vec<&str> = int_part.split(',').collect();
  groups.len() > 1
    && !groups[0].is_empty()
    && groups[0].len() <= 3
    && groups[1..].iter().all(|g| g.len() == 3 && g.chars().all(|c| c.is_ascii_digit()))
}

/// `\frac{a}{b}` / `\dfrac{a}{b}` / `\tfrac{a}{b}`, optionally negated.
fn frac_args(s: &str) -> Option<(String, String)> {
  let (neg, body) = match s.strip_prefix('-') {
    Some(rest) => (true, rest.trim()),
    None => (false, s),
  };
  let body = body
    .strip_prefix("\\frac")
    .or_else(|| body.strip_prefix("\\dfrac"))
    .or_else(|| body.strip_prefix("\\tfrac"))?;
  let (a, rest) = take_braced(body)?;
  let (b, rest) = take_braced(rest)?;
  if !rest.trim().is_empty() {
    return None;
  }
  let a = if neg { format!("-{}", a) } else { a };
  Some((a, b))
}

fn take_braced(s: &str) -> Option<(String, &str)> {
  let s = s.trim_start();
  if !s.starts_with('{') {
    return None;
  }
  let mut depth = 0usize;
  for (i, c) in s.char_indices() {
    match c {
      '{' => depth += 1,
      '}' => {
        depth -= 1;
        if depth == 0 {
          return Some((s[1..i].to_string(), &s[i + 1..]));
        }
      }
      _ => {}
    }
  }
  None
}

/// Content of the last `\boxed{…}` in the text.
fn last_boxed(text: &str) -> Option<String> {
  let idx = text.rfind("\\boxed")?;
  take_braced(&text[idx + "\\boxed".len()..]).map(|(inner, _)| inner)
}

/// Every number-looking token in the text, in order.
fn number_tokens(text: &str) -> Vec<String> {
  let chars: Vec<char> = text.chars().collect();
  let mut out = Vec::new();
  let mut i = 0;
  while i < chars.len() {
    let c = chars[i];
    let starts_num = c.is_ascii_digit()
      || ((c == '-' || c == '−') && chars.get(i + 1).map(|n| n.is_ascii_digit()).unwrap_or(false));
    if !starts_num {
      i += 1;
      continue;
    }
    let start = i;
    i += 1;
    while i < chars.len() {
      let c = chars[i];
      let next_digit = chars.get(i + 1).map(|n| n.is_ascii_digit()).unwrap_or(false);
      if c.is_ascii_digit() || ((c == '.' || c == ',' || c == '/') && next_digit) {
        i += 1;
      } else if c == '%' {
        i += 1;
        break;
      } else {
        break;
      }
    }
    out.push(chars[start..i].iter().collect());
  }
  out
}

const ANSWER_MARKERS: &[&str] = &["final answer", "answer is", "answer:", "answer =", "result is", "="];

/// Find the number a piece of text commits to as its answer.
pub fn extract_numeric_answer(text: &str) -> Option<f64> {
  extract_numeric_token(text).and_then(|t| parse_number(&t))
}

fn extract_numeric_token(text: &str) -> Option<String> {
  if let Some(boxed) = last_boxed(text) {
    if parse_number(&boxed).is_some() {
      return Some(boxed);
    }
    if let Some(t) = number_tokens(&boxed).into_iter().last() {
      return Some(t);
    }
  }

  let lower = text.to_lowercase();
  for marker in ANSWER_MARKERS {
    if let Some(pos) = lower.rfind(marker) {
      // Numbers and `\frac` survive lowercasing, so slicing `lower` is safe.
      let tail = &lower[pos + marker.len()..];
      if let Some(t) = frac_in(tail).or_else(|| number_tokens(tail).into_iter().next()) {
        return Some(t);
      }
    }
  }

  if let Some(f) = frac_in(text) {
    return Some(f);
  }
  number_tokens(text).into_iter().last()
}

/// First complete `\frac{…}{…}` (or `\dfrac`/`\tfrac`) in the text.
fn frac_in(text: &str) -> Option<String> {
  let start = ["\\frac", "\\dfrac", "\\tfrac"]
    .iter()
    .filter_map(|cmd| text.find(cmd).map(|i| (i, cmd.len())))
    .min_by_key(|(i, _)| *i);
  let (start, cmd_len) = start?;
  let candidate = &text[start..];
  let (_, rest) = take_braced(&candidate[cmd_len..])?;
  let (_, rest) = take_braced(rest)?;
  let frac = &candidate[..candidate.len() - rest.len()];
  let neg = text[..start].trim_end().ends_with('-');
  Some(if neg { format!("-{}", frac) } else { frac.to_string() })
}

/// Lowercase, no whitespace/`$`/trailing period, no leading `x=`.
pub fn normalize_answer(s: &str) -> String {
  let mut n: String = s
    .to_lowercase()
    .chars()
    .filter(|c| !c.is_whitespace() && *c != '$')
    .collect();
  while n.ends_with('.') {
    n.pop();
  }
  let bytes = n.as_bytes();
  if bytes.len() > 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b'=' {
    n = n[2..].to_string();
  }
  n
}

fn numbers_match(expected: f64, given: f64, given_token: &str) -> bool {
  let scale = expected.abs().max(given.abs()).max(1.0);
  if (expected - given).abs() <= REL_TOLERANCE * scale {
    return true;
  }
  // "3.14" for π-like expected values: compare at the student's precision.
  if let Some(dot) = given_token.find('.') {
    let decimals = given_token[dot + 1..].chars().take_while(|c| c.is_ascii_digit()).count();
    if decimals > 0 {
      let factor = 10f64.powi(decimals as i32);
      return (expected * factor).round() == (given * factor).round();
    }
  }
  false
}

/// Map "B", "(b)", "b)" or "b." to the matching choice text.
fn choice_from_letter<'a>(given: &str, choices: &'a [String]) -> Option<&'a str> {
  let g = given.trim().trim_start_matches('(').trim_end_matches(|c| c == ')' || c == '.');
  let mut chars = g.chars();
  let letter = chars.next()?;
  if chars.next().is_some() || !letter.is_ascii_alphabetic() {
    return None;
  }
  let idx = (letter.to_ascii_lowercase() as u8 - b'a') as usize;
  choices.get(idx).map(|s| s.as_str())
}

/// Drop one leading single-variable assignment: "x = 5" -> "5".
fn strip_assignment(s: &str) -> &str {
  let t = s.trim();
  if !t.starts_with(|c: char| c.is_ascii_alphabetic()) {
    return t;
  }
  let rest = t[1..].trim_start();
  match rest.strip_prefix('=') {
    Some(value) if !value.starts_with('=') => value.trim(),
    _ => t,
  }
}

/// A picked choice is right when it is the listed answer. Only when the
/// answer is not among the choices do we fall back to numeric equality.
fn grade_choice(expected: &str, picked: &str, choices: &[String]) -> GradeOutcome {
  let ne = normalize_answer(expected);
  let listed = choices.iter().any(|c| normalize_answer(c) == ne);
  let correct = if listed {
    normalize_answer(picked) == ne
  } else {
    match (parse_number(strip_assignment(expected)), parse_number(picked)) {
      (Some(e), Some(g)) => numbers_match(e, g, picked),
      _ => false,
    }
  };
  GradeOutcome { correct, method: GradeMethod::Choice, extracted: Some(picked.to_string()) }
}

/// Grade a student's answer against the expected one.
///
/// Numbers are compared only when the whole expected answer is a number;
/// expressions, pairs and inequalities go to text comparison and end up
/// `Inconclusive` when that does not match.
pub fn grade(expected: &str, given: &str, choices: &[String]) -> GradeOutcome {
  let given = given.trim();
  if given.is_empty() {
    return GradeOutcome { correct: false, method: GradeMethod::Text, extracted: None };
  }
  if let Some(picked) = choice_from_letter(given, choices) {
    return grade_choice(expected, picked, choices);
  }

  if let Some(e) = parse_number(strip_assignment(expected)) {
    let token = if parse_number(strip_assignment(given)).is_some() {
      Some(strip_assignment(given).to_string())
    } else {
      extract_numeric_token(given)
    };
    return match token.as_deref().and_then(|t| parse_number(t).map(|g| (t, g))) {
      Some((t, g)) => GradeOutcome { correct: numbers_match(e, g, t), method: GradeMethod::Numeric, extracted: Some(t.to_string()) },
      // Expected a number, student wrote none.
      None => GradeOutcome { correct: false, method: GradeMethod::Numeric, extracted: None },
    };
  }

  if normalize_answer(expected) == normalize_answer(given) {
    return GradeOutcome { correct: true, method: GradeMethod::Text, extracted: Some(given.to_string()) };
  }
  GradeOutcome { correct: false, method: GradeMethod::Inconclusive, extracted: None }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_school_notations() {
    assert_eq!(parse_number("42"), Some(42.0));
    assert_eq!(parse_number(" -3.5 "), Some(-3.5));
    assert_eq!(parse_number("1,234"), Some(1234.0));
    assert_eq!(parse_number("3/4"), Some(0.75));
    assert_eq!(parse_number("−2"), Some(-2.0));
    assert_eq!(parse_number("$\\frac{1}{2}$"), Some(0.5));
    assert_eq!(parse_number("-\\dfrac{3}{4}"), Some(-0.75));
    assert_eq!(parse_number("50%"), Some(50.0));
    assert_eq!(parse_number("7."), Some(7.0));
    assert_eq!(parse_number("1/0"), None);
    assert_eq!(parse_number("3,5"), None);
    assert_eq!(parse_number("x"), None);
  }

  #[test]
  fn extraction_prefers_boxed_then_markers_then_last_number() {
    assert_eq!(extract_numeric_answer("First 2 + 3 = 5, so \\boxed{10}"), Some(10.0));
    assert_eq!(extract_numeric_answer("We tried 4 and 6. The answer is 12 apples, not 13"), Some(12.0));
    assert_eq!(extract_numeric_answer("x = -2.5"), Some(-2.5));
    assert_eq!(extract_numeric_answer("I counted 3 then 9"), Some(9.0));
    assert_eq!(extract_numeric_answer("Final answer: \\frac{3}{8}"), Some(0.375));
    assert_eq!(extract_numeric_answer("no digits here"), None);
  }

  #[test]
  fn normalizes_text_answers() {
    assert_eq!(normalize_answer(" X = Blue. "), "blue");
    assert_eq!(normalize_answer("$y=2x+1$"), "2x+1");
  }

  #[test]
  fn grades_numbers_with_tolerance_and_precision() {
    assert!(grade("0.75", "3/4", &[]).correct);
    assert!(grade("3.14159265", "3.14", &[]).correct);
    assert!(!grade("3.14159265", "3.15", &[]).correct);
    let g = grade("12", "I think it's 12.", &[]);
    assert!(g.correct);
    assert_eq!(g.method, GradeMethod::Numeric);
    assert_eq!(g.extracted.as_deref(), Some("12"));
  }

  #[test]
  fn grades_choice_letters() {
    let choices = vec!["2".to_string(), "4".to_string(), "8".to_string()];
    let g = grade("4", "(B)", &choices);
    assert!(g.correct);
    assert_eq!(g.method, GradeMethod::Choice);
    assert!(!grade("4", "c", &choices).correct);
  }

  #[test]
  fn text_and_inconclusive_paths() {
    assert!(grade("isosceles", " Isosceles. ", &[]).correct);
    let g = grade("isosceles", "it has two equal sides", &[]);
    assert!(!g.correct);
    assert_eq!(g.method, GradeMethod::Inconclusive);
    let g = grade("5", "five", &[]);
    assert_eq!(g.method, GradeMethod::Numeric);
    assert!(!g.correct);
    assert!(!grade("5", "   ", &[]).correct);
  }

  #[test]
  fn expressions_are_not_reduced_to_their_last_number() {
    let g = grade("x^2 + 1", "2x + 1", &[]);
    assert!(!g.correct);
    assert_eq!(g.method, GradeMethod::Inconclusive);

    let g = grade("(2, 3)", "(5, 3)", &[]);
    assert!(!g.correct);
    assert_eq!(g.method, GradeMethod::Inconclusive);
    assert!(grade("(2, 3)", "(2,3)", &[]).correct);

    let g = grade("x > 2", "x is greater than two", &[]);
    assert!(!g.correct);
    assert_eq!(g.method, GradeMethod::Inconclusive);
  }

  #[test]
  fn assignment_answers_compare_numerically() {
    let g = grade("x = 5", "5", &[]);
    assert!(g.correct);
    assert_eq!(g.method, GradeMethod::Numeric);
    assert!(grade("-5", "x = -5", &[]).correct);
    assert!(!grade("x = 5", "x = 6", &[]).correct);
  }

  #[test]
  fn equivalent_but_wrong_choice_is_wrong() {
    let choices: Vec<String> = ["2/3", "3/4", "9/12", "6/8"].iter().map(|s| s.to_string()).collect();
    let g = grade("3/4", "C", &choices);
    assert!(!g.correct);
    assert_eq!(g.method, GradeMethod::Choice);
    assert_eq!(g.extracted.as_deref(), Some("9/12"));
    assert!(grade("3/4", "b", &choices).correct);

    // Answer not listed verbatim: fall back to the value of the pick.
    let choices = vec!["0.5".to_string(), "0.75".to_string()];
    assert!(grade("3/4", "B", &choices).correct);
    assert!(!grade("3/4", "A", &choices).correct);
  }
}
