//! Built-in quiz questions so the app is useful without a config file or a
//! model API key.

use crate::domain::{Difficulty, QuestionSource, QuizQuestion};

fn seed(id: &str, topic: &str, difficulty: Difficulty, question: &str, answer: &str, explanation: &str, choices: &[&str]) -> QuizQuestion {
  QuizQuestion {
    id: id.into(),
    topic: topic.into(),
    difficulty,
    question: question.into(),
    answer: answer.into(),
    explanation: explanation.into(),
    choices: choices.iter().map(|c| c.to_string()).collect(),
    source: QuestionSource::Seed,
  }
}

pub fn seed_questions() -> Vec<QuizQuestion> {
  vec![
    seed("q-frac-1", "fractions", Difficulty::Easy, "What is $\\frac{1}{2} + \\frac{1}{4}$?", "3/4",
      "Rewrite $\\frac{1}{2}$ as $\\frac{2}{4}$ and add the numerators.", &[]),
    seed("q-frac-2", "fractions", Difficulty::Medium, "Simplify $\\frac{18}{24}$.", "3/4",
      "Divide numerator and denominator by 6.", &["2/3", "3/4", "4/5", "3/8"]),
    seed("q-lin-1", "linear equations", Difficulty::Easy, "Solve $x + 7 = 12$.", "5",
      "Subtract 7 from both sides.", &[]),
    seed("q-lin-2", "linear equations", Difficulty::Medium, "Solve $3x - 4 = 11$.", "5",
      "Add 4 to both sides, then divide by 3.", &[]),
    seed("q-lin-3", "linear equations", Difficulty::Hard, "Solve $2(x - 3) = 5x + 9$.", "-5",
      "Expand to $2x - 6 = 5x + 9$, then $-3x = 15$.", &[]),
    seed("q-pct-1", "percentages", Difficulty::Easy, "What is 20% of 150?", "30",
      "$0.2 \\times 150 = 30$.", &["15", "30", "20", "45"]),
    seed("q-geo-1", "geometry", Difficulty::Medium, "A triangle has angles $50^\\circ$ and $60^\\circ$. What is the third angle in degrees?", "70",
      "Angles in a triangle add up to $180^\\circ$.", &[]),
    seed("q-geo-2", "geometry", Difficulty::Hard, "What is the area of a circle with radius 3? Round to two decimals.", "28.27",
      "$\\pi r^2 = 9\\pi \\approx 28.27$.", &[]),
  ]
}

/// Absolute last-resort fallback when nothing matches the requested topic.
/// The id is stable per topic and difficulty, so repeats overwrite one entry.
pub fn hard_fallback_question(topic: &str, difficulty: Difficulty) -> QuizQuestion {
  let slug: String = topic
    .chars()
    .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
    .collect();
  QuizQuestion {
    id: format!("fallback-{}-{}", slug, difficulty.as_str()),
    topic: topic.to_string(),
    difficulty,
    question: "What is $6 \\times 7$?".into(),
    answer: "42".into(),
    explanation: "Six groups of seven make 42.".into(),
    choices: vec![],
    source: QuestionSource::Seed,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::answer::parse_number;

  #[test]
  fn seed_answers_are_gradable_numbers() {
    for q in seed_questions() {
      assert!(parse_number(&q.answer).is_some(), "{} has non-numeric answer", q.id);
      if !q.choices.is_empty() {
        assert!(q.choices.contains(&q.answer), "{} answer missing from choices", q.id);
        // No other choice may be worth the same as the answer.
        let value = parse_number(&q.answer);
        let twins = q.choices.iter().filter(|c| parse_number(c) == value).count();
        assert_eq!(twins, 1, "{} has an equivalent wrong choice", q.id);
      }
    }
  }

  #[test]
  fn fallback_id_is_stable() {
    let a = hard_fallback_question("Number Theory", Difficulty::Hard);
    let b = hard_fallback_question("Number Theory", Difficulty::Hard);
    assert_eq!(a.id, b.id);
    assert_eq!(a.id, "fallback-number-theory-hard");
    assert_ne!(a.id, hard_fallback_question("Number Theory", Difficulty::Easy).id);
  }
}
