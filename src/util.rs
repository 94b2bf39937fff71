//! Small utility helpers used across modules.

/// Very small and safe string templating.
/// Replaces occurrences of `{key}` in the template with provided values.
/// This is intentionally simple (no nested/conditional logic).
pub fn fill_template(tpl: &str, pairs: &[(&str, &str)]) -> String {
  let mut out = tpl.to_string();
  for (k, v) in pairs {
    let needle = format!("{{{}}}", k);
    out = out.replace(&needle, v);
  }
  out
}

/// Collapse all whitespace runs to one space and trim.
/// Used when comparing message contents that went through different renderers.
pub fn normalize_ws(s: &str) -> String {
  s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Log-safe truncation for large strings.
/// Avoids spamming logs with huge request/response payloads.
pub fn trunc_for_log(s: &str, max: usize) -> String {
  if s.len() <= max {
    return s.to_string();
  }
  let mut cut = max;
  while !s.is_char_boundary(cut) {
    cut -= 1;
  }
  format!("{}… ({} bytes total)", &s[..cut], s.len())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn fill_template_replaces_every_occurrence() {
    let out = fill_template("{topic} at {level}; again {topic}", &[("topic", "fractions"), ("level", "easy")]);
    assert_eq!(out, "fractions at easy; again fractions");
  }

  #[test]
  fn fill_template_leaves_unknown_keys() {
    assert_eq!(fill_template("{a} {b}", &[("a", "1")]), "1 {b}");
  }

  #[test]
  fn trunc_for_log_respects_char_boundaries() {
    let s = "ππππ";
    let out = trunc_for_log(s, 3);
    assert!(out.starts_with("π…"));
    assert!(out.ends_with("(8 bytes total)"));
    assert_eq!(trunc_for_log("short", 10), "short");
  }

  #[test]
  fn normalize_ws_collapses_runs() {
    assert_eq!(normalize_ws("  x  =\n 2 \t"), "x = 2");
  }
}
