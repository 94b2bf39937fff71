//! Domain models: chat messages and sessions, quiz questions, user settings,
//! and the tutor's pedagogical step tags.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Pedagogical intent of a tutor reply.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum StepType {
  /// Nudge or guiding question; does not reveal the answer.
  Hint,
  /// Verifies the student's work so far.
  Check,
  /// Gives (or confirms) the final answer.
  Final,
}

impl Default for StepType {
  fn default() -> Self { StepType::Hint }
}

impl StepType {
  /// Models are sloppy with enum tags, so accept case variants and a few synonyms.
  pub fn parse_loose(raw: &str) -> Option<Self> {
    let s: String = raw.trim().to_lowercase().chars().filter(|c| c.is_ascii_alphabetic()).collect();
    match s.as_str() {
      "hint" | "question" | "guide" | "nudge" => Some(StepType::Hint),
      "check" | "checking" | "verify" | "verification" => Some(StepType::Check),
      "final" | "answer" | "finalanswer" | "solution" => Some(StepType::Final),
      _ => None,
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      StepType::Hint => "hint",
      StepType::Check => "check",
      StepType::Final => "final",
    }
  }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
  User,
  Assistant,
  System,
}

impl Role {
  pub fn as_str(&self) -> &'static str {
    match self {
      Role::User => "user",
      Role::Assistant => "assistant",
      Role::System => "system",
    }
  }
}

/// One persisted chat message.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
  pub id: String,
  pub session_id: String,
  pub role: Role,
  pub content: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub step_type: Option<StepType>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub image_url: Option<String>,
  pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Session {
  pub id: String,
  pub user_id: String,
  pub title: String,
  #[serde(default)]
  pub topic: Option<String>,
  pub socratic: bool,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
  Easy,
  Medium,
  Hard,
}

impl Default for Difficulty {
  fn default() -> Self { Difficulty::Medium }
}

impl Difficulty {
  pub fn parse_loose(raw: &str) -> Self {
    match raw.trim().to_lowercase().as_str() {
      "easy" | "beginner" | "1" => Difficulty::Easy,
      "hard" | "advanced" | "difficult" | "3" => Difficulty::Hard,
      _ => Difficulty::Medium,
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      Difficulty::Easy => "easy",
      Difficulty::Medium => "medium",
      Difficulty::Hard => "hard",
    }
  }
}

/// Where did we get the question from?
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum QuestionSource {
  LocalBank, // from user-provided TOML bank
  Generated, // generated by the model and kept in memory
  Seed,      // built-in seeds (last resort)
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QuizQuestion {
  pub id: String,
  pub topic: String,
  pub difficulty: Difficulty,
  pub question: String,
  pub answer: String,
  #[serde(default)]
  pub explanation: String,
  /// Empty for open-answer questions.
  #[serde(default)]
  pub choices: Vec<String>,
  pub source: QuestionSource,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserSettings {
  #[serde(default = "default_socratic")]
  pub socratic_mode: bool,
  #[serde(default)]
  pub grade_level: Option<String>,
}

fn default_socratic() -> bool { true }

impl Default for UserSettings {
  fn default() -> Self {
    Self { socratic_mode: true, grade_level: None }
  }
}

/// A complete tutor reply after formatting.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TutorReply {
  pub content: String,
  pub step_type: StepType,
}
