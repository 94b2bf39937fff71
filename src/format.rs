//! Clean-up of model output before it reaches the student.
//!
//! Models mix LaTeX delimiter styles, double-escape newlines when asked for
//! JSON, and wrap replies in code fences. The frontend renders `$…$` and
//! `$$…$$` only.

use crate::domain::StepType;

/// Remove a code fence wrapping the whole text (```json … ```).
pub fn strip_code_fences(text: &str) -> String {
  let t = text.trim();
  if !t.starts_with("```") {
    return t.to_string();
  }
  let after_open = match t.find('\n') {
    Some(i) => &t[i + 1..],
    None => return t.trim_start_matches('`').trim_end_matches('`').trim().to_string(),
  };
  let body = after_open.trim_end();
  let body = body.strip_suffix("```").unwrap_or(body);
  body.trim().to_string()
}

/// Apply every formatting fix, in order.
pub fn fix_math_formatting(text: &str) -> String {
  let s = strip_code_fences(text);
  let s = unescape_literal_whitespace(&s);
  let s = s.replace("\\[", "$$").replace("\\]", "$$");
  let s = s.replace("\\(", "$").replace("\\)", "$");
  let s = tidy_lines(&s);
  let mut s = s.trim().to_string();
  if s.matches("$$").count() % 2 == 1 {
    s.push_str("$$");
  }
  s
}

const LATEX_N_T_COMMANDS: &[&str] = &[
  "ne", "neq", "nabla", "nu", "neg", "not", "notin", "ni", "newline", "nleq", "ngeq", "nmid", "natural",
  "nexists", "nsubseteq", "theta", "times", "tan", "tanh", "text", "textbf", "textit", "textrm", "to", "tau",
  "triangle", "top", "tilde", "tfrac", "therefore", "tt",
];

/// `\n` / `\t` written as two characters become real whitespace, unless the
/// backslash starts a LaTeX command (`\neq`, `\nabla`, `\theta`, `\times`).
fn unescape_literal_whitespace(s: &str) -> String {
  let chars: Vec<char> = s.chars().collect();
  let mut out = String::with_capacity(s.len());
  let mut i = 0;
  while i < chars.len() {
    let c = chars[i];
    if c == '\\' && i + 1 < chars.len() && (chars[i + 1] == 'n' || chars[i + 1] == 't') {
      let word: String = chars[i + 1..].iter().take_while(|c| c.is_ascii_alphabetic()).collect();
      if !LATEX_N_T_COMMANDS.contains(&word.as_str()) {
        out.push(if chars[i + 1] == 'n' { '\n' } else { '\t' });
        i += 2;
        continue;
      }
    }
    out.push(c);
    i += 1;
  }
  out
}

fn tidy_lines(s: &str) -> String {
  let mut out = String::with_capacity(s.len());
  let mut blank_run = 0usize;
  for line in s.split('\n') {
    let line = line.trim_end();
    if line.is_empty() {
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
  out.pop();
  out
}

/// Guess the step type of a reply the model did not tag.
pub fn infer_step_type(content: &str) -> StepType {
  let lower = content.to_lowercase();
  let final_markers = ["final answer", "the answer is", "\\boxed", "therefore the solution"];
  if final_markers.iter().any(|m| lower.contains(m)) {
    return StepType::Final;
  }
  let check_markers = ["let's check", "lets check", "verify", "that's correct", "that is correct", "not quite", "double-check"];
  if check_markers.iter().any(|m| lower.contains(m)) {
    return StepType::Check;
  }
  StepType::Hint
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn converts_latex_delimiters() {
    let out = fix_math_formatting(r"Solve \(2x = 4\), so \[x = 2\]");
    assert_eq!(out, "Solve $2x = 4$, so $$x = 2$$");
  }

  #[test]
  fn unescapes_newlines_but_keeps_latex_commands() {
    let out = fix_math_formatting(r"Step 1\nStep 2\n\n\n\nNote: $a \neq b$ and $\nabla f$");
    assert_eq!(out, "Step 1\nStep 2\n\nNote: $a \\neq b$ and $\\nabla f$");
  }

  #[test]
  fn strips_wrapping_fence() {
    assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
    assert_eq!(strip_code_fences("plain"), "plain");
  }

  #[test]
  fn closes_dangling_display_math() {
    assert_eq!(fix_math_formatting("$$x^2"), "$$x^2$$");
  }

  #[test]
  fn step_type_inference() {
    assert_eq!(infer_step_type("So the final answer is 7."), StepType::Final);
    assert_eq!(infer_step_type("Let's check your second line."), StepType::Check);
    assert_eq!(infer_step_type("What do you get if you subtract 3?"), StepType::Hint);
  }
}
