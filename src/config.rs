//! Loading tutor configuration (prompts + optional quiz bank) from TOML.
//!
//! See `TutorConfig` and `Prompts` for expected schema.

use serde::Deserialize;
use tracing::{error, info};

use crate::domain::Difficulty;

#[derive(Clone, Debug, Deserialize, Default)]
pub struct TutorConfig {
  #[serde(default)]
  pub prompts: Prompts,
  #[serde(default)]
  pub quiz_bank: Vec<QuizQuestionCfg>,
}

/// Quiz entry accepted in TOML configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct QuizQuestionCfg {
  #[serde(default)] pub id: Option<String>,
  pub topic: String,
  #[serde(default)] pub difficulty: Difficulty,
  pub question: String,
  pub answer: String,
  #[serde(default)] pub explanation: Option<String>,
  #[serde(default)] pub choices: Vec<String>,
}

/// Prompts used by the LLM client. Every field can be overridden in TOML;
/// missing fields keep their defaults.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Prompts {
  // Tutor chat
  pub tutor_system: String,
  pub socratic_addendum: String,
  pub direct_addendum: String,
  pub reply_format: String,
  pub image_note: String,
  // Quiz
  pub quiz_system: String,
  pub quiz_user_template: String,
  pub grade_system: String,
  pub grade_user_template: String,
  // Structured generation
  pub structured_system: String,
}

impl Default for Prompts {
  fn default() -> Self {
    Self {
      tutor_system: "You are MathMate, a patient math tutor for school students. Use LaTeX with $...$ for inline math and $$...$$ for display math.".into(),
      socratic_addendum: "Socratic mode is ON: never state the final answer. Ask one guiding question or give one small hint at a time, and check the student's reasoning.".into(),
      direct_addendum: "Socratic mode is OFF: explain the solution step by step and state the final answer clearly.".into(),
      reply_format: "Respond ONLY with a JSON object: {\"stepType\": \"hint\" | \"check\" | \"final\", \"content\": string}. Use \"hint\" for nudges, \"check\" when verifying the student's work, \"final\" when giving or confirming the answer.".into(),
      image_note: "The student attached a photo of their work or of the problem. Read it carefully before answering.".into(),
      quiz_system: "You write short math quiz questions. Respond ONLY with strict JSON.".into(),
      quiz_user_template: "Write one {difficulty} question about '{topic}'. Return JSON with fields: question (string), answer (string, a single number when possible), explanation (string, one or two sentences), choices (array of 4 strings or empty for open answer).".into(),
      grade_system: "You are a fair math grader. Reply as compact JSON.".into(),
      grade_user_template: "Question: {question}\nExpected answer: {expected}\nStudent answer: {given}\nReturn JSON {\"correct\": boolean, \"explanation\": string}. Accept equivalent forms (fractions vs decimals, simplified expressions).".into(),
      structured_system: "You are a helper for a math tutoring app. Respond ONLY with a single JSON object that satisfies the instruction.".into(),
    }
  }
}

/// Parse a TOML document into `TutorConfig`.
pub fn parse_config(s: &str) -> Result<TutorConfig, toml::de::Error> {
  toml::from_str::<TutorConfig>(s)
}

/// Attempt to load `TutorConfig` from MATHMATE_CONFIG_PATH. On any parsing/IO error, returns None.
pub fn load_config_from_env() -> Option<TutorConfig> {
  let path = std::env::var("MATHMATE_CONFIG_PATH").ok()?;
  match std::fs::read_to_string(&path) {
    Ok(s) => match parse_config(&s) {
      Ok(cfg) => {
        info!(target: "mathmate", %path, quiz_bank = cfg.quiz_bank.len(), "Loaded tutor config (TOML)");
        Some(cfg)
      }
      Err(e) => {
        error!(target: "mathmate", %path, error = %e, "Failed to parse TOML config");
        None
      }
    },
    Err(e) => {
      error!(target: "mathmate", %path, error = %e, "Failed to read TOML config file");
      None
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn partial_prompt_override_keeps_defaults() {
    let cfg = parse_config(
      r#"
[prompts]
tutor_system = "You are a terse tutor."

[[quiz_bank]]
topic = "fractions"
difficulty = "easy"
question = "What is 1/2 + 1/4?"
answer = "3/4"
"#,
    )
    .unwrap();
    assert_eq!(cfg.prompts.tutor_system, "You are a terse tutor.");
    assert_eq!(cfg.prompts.reply_format, Prompts::default().reply_format);
    assert_eq!(cfg.quiz_bank.len(), 1);
    assert_eq!(cfg.quiz_bank[0].difficulty, Difficulty::Easy);
    assert!(cfg.quiz_bank[0].choices.is_empty());
  }

  #[test]
  fn empty_document_is_default() {
    let cfg = parse_config("").unwrap();
    assert!(cfg.quiz_bank.is_empty());
    assert!(cfg.prompts.quiz_user_template.contains("{topic}"));
  }

  #[test]
  fn missing_required_field_is_an_error() {
    assert!(parse_config("[[quiz_bank]]\ntopic = \"x\"\n").is_err());
  }
}
