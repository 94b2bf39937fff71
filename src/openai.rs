//! Minimal OpenAI-compatible client for the tutor.
//!
//! We call chat.completions two ways: a single reply (optionally as a strict
//! JSON object) and streamed deltas (SSE). Calls are instrumented and log model names,
//! latencies and response sizes (not contents).
//!
//! NOTE: We never log the API key.

use std::pin::Pin;
use std::time::{Duration, Instant};

use async_stream::stream;
use futures_util::{Stream, StreamExt};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use crate::config::Prompts;
use crate::domain::{Difficulty, QuestionSource, QuizQuestion, TutorReply};
use crate::json_stream::JsonAccumulator;
use crate::sse::{delta_content, SseDecoder, SseEvent};
use crate::util::fill_template;

const USER_AGENT_VALUE: &str = "mathmate-backend/0.1";

#[derive(Debug, Error)]
pub enum LlmError {
  #[error("transport error: {0}")]
  Http(#[from] reqwest::Error),
  #[error("model API returned HTTP {status}: {message}")]
  Status { status: u16, message: String },
  #[error("could not parse model output: {0}")]
  Parse(String),
  #[error("model returned an empty reply")]
  EmptyReply,
}

pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

// --- Chat DTOs ---

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct ChatMessageReq {
  pub role: String,
  pub content: MessageContent,
}

impl ChatMessageReq {
  pub fn text(role: &str, content: impl Into<String>) -> Self {
    Self { role: role.to_string(), content: MessageContent::Text(content.into()) }
  }
}

/// Plain text, or multimodal parts when an image is attached.
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
  Text(String),
  Parts(Vec<ContentPart>),
}

#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
  Text { text: String },
  ImageUrl { image_url: ImageUrl },
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct ImageUrl {
  pub url: String,
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
  model: &'a str,
  messages: &'a [ChatMessageReq],
  temperature: f32,
  #[serde(skip_serializing_if = "Option::is_none")]
  response_format: Option<ResponseFormat>,
  #[serde(skip_serializing_if = "std::ops::Not::not")]
  stream: bool,
}
#[derive(Serialize)]
struct ResponseFormat {
  #[serde(rename = "type")]
  r#type: &'static str,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
  choices: Vec<ChatChoice>,
  #[serde(default)]
  usage: Option<Usage>,
}
#[derive(Deserialize)]
struct ChatChoice {
  message: ChatMessageResp,
}
#[derive(Deserialize)]
struct ChatMessageResp {
  content: Option<String>,
}
#[derive(Deserialize)]
struct Usage {
  #[serde(default)]
  prompt_tokens: Option<u32>,
  #[serde(default)]
  completion_tokens: Option<u32>,
  #[serde(default)]
  total_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct GeneratedQuestion {
  question: String,
  answer: serde_json::Value,
  #[serde(default)]
  explanation: String,
  #[serde(default)]
  choices: Vec<serde_json::Value>,
}

fn value_to_text(v: serde_json::Value) -> String {
  match v {
    serde_json::Value::String(s) => s,
    other => other.to_string(),
  }
}

#[derive(Clone)]
pub struct OpenAI {
  pub client: reqwest::Client,
  pub api_key: String,
  pub base_url: String,
  pub fast_model: String,
  pub strong_model: String,
}

impl OpenAI {
  pub fn new(api_key: &str, base_url: &str, fast_model: &str, strong_model: &str, timeout: Duration) -> Result<Self, LlmError> {
    let client = reqwest::Client::builder().timeout(timeout).build()?;
    Ok(Self {
      client,
      api_key: api_key.to_string(),
      base_url: base_url.trim_end_matches('/').to_string(),
      fast_model: fast_model.to_string(),
      strong_model: strong_model.to_string(),
    })
  }

  /// Construct the client if we find OPENAI_API_KEY; otherwise return None.
  pub fn from_env() -> Option<Self> {
    let api_key = std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.trim().is_empty())?;
    let base_url = std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1".into());
    let fast_model = std::env::var("OPENAI_FAST_MODEL").unwrap_or_else(|_| "gpt-4o-mini".into());
    let strong_model = std::env::var("OPENAI_STRONG_MODEL").unwrap_or_else(|_| "gpt-4o".into());
    // Streams stay open for the whole reply, so this is generous.
    let timeout = std::env::var("OPENAI_TIMEOUT_SECS")
      .ok()
      .and_then(|s| s.parse::<u64>().ok())
      .unwrap_or(60);

    match Self::new(&api_key, &base_url, &fast_model, &strong_model, Duration::from_secs(timeout)) {
      Ok(oa) => Some(oa),
      Err(e) => {
        error!(target: "mathmate", error = %e, "Failed to build HTTP client for the model API");
        None
      }
    }
  }

  async fn post(&self, req: &ChatCompletionRequest<'_>) -> Result<reqwest::Response, LlmError> {
    let url = format!("{}/chat/completions", self.base_url);
    let res = self
      .client
      .post(&url)
      .header(USER_AGENT, USER_AGENT_VALUE)
      .header(CONTENT_TYPE, "application/json")
      .header(AUTHORIZATION, format!("Bearer {}", self.api_key))
      .json(req)
      .send()
      .await?;

    if !res.status().is_success() {
      let status = res.status().as_u16();
      let body = res.text().await.unwrap_or_default();
      let message = extract_openai_error(&body).unwrap_or(body);
      return Err(LlmError::Status { status, message });
    }
    Ok(res)
  }

  async fn complete(&self, model: &str, messages: &[ChatMessageReq], temperature: f32, json: bool) -> Result<String, LlmError> {
    let req = ChatCompletionRequest {
      model,
      messages,
      temperature,
      response_format: if json { Some(ResponseFormat { r#type: "json_object" }) } else { None },
      stream: false,
    };
    let start = Instant::now();
    let body: ChatCompletionResponse = self.post(&req).await?.json().await?;
    if let Some(usage) = &body.usage {
      info!(prompt_tokens = ?usage.prompt_tokens, completion_tokens = ?usage.completion_tokens, total_tokens = ?usage.total_tokens, elapsed = ?start.elapsed(), "model usage");
    }
    let text = body.choices.into_iter().next().and_then(|c| c.message.content).unwrap_or_default();
    if text.trim().is_empty() {
      return Err(LlmError::EmptyReply);
    }
    Ok(text)
  }

  /// JSON-object chat completion. Generic over the target type T.
  #[instrument(level = "info", skip(self, messages), fields(model = %model, turns = messages.len()))]
  pub async fn chat_json<T: for<'a> Deserialize<'a>>(&self, model: &str, messages: &[ChatMessageReq], temperature: f32) -> Result<T, LlmError> {
    let text = self.complete(model, messages, temperature, true).await?;
    let cleaned = crate::format::strip_code_fences(&text);
    serde_json::from_str::<T>(&cleaned).map_err(|e| LlmError::Parse(e.to_string()))
  }

  /// Streamed chat completion; yields content deltas as they arrive.
  #[instrument(level = "info", skip(self, messages), fields(model = %model, turns = messages.len()))]
  pub async fn chat_stream(&self, model: &str, messages: &[ChatMessageReq], temperature: f32, json: bool) -> Result<DeltaStream, LlmError> {
    let req = ChatCompletionRequest {
      model,
      messages,
      temperature,
      response_format: if json { Some(ResponseFormat { r#type: "json_object" }) } else { None },
      stream: true,
    };
    let res = self.post(&req).await?;
    let mut bytes = res.bytes_stream();

    let stream = stream! {
      let mut decoder = SseDecoder::new();
      let mut chunks = 0usize;
      let mut finished = false;
      while let Some(chunk) = bytes.next().await {
        let chunk = match chunk {
          Ok(c) => c,
          Err(e) => {
            error!(target: "tutor", error = %e, "model stream broke off");
            yield Err(LlmError::from(e));
            break;
          }
        };
        for ev in decoder.push(&chunk) {
          match ev {
            SseEvent::Done => {
              finished = true;
              break;
            }
            SseEvent::Data(payload) => {
              if let Some(delta) = delta_content(&payload) {
                chunks += 1;
                yield Ok(delta);
              }
            }
          }
        }
        if finished {
          break;
        }
      }
      if !finished {
        if let Some(SseEvent::Data(payload)) = decoder.finish() {
          if let Some(delta) = delta_content(&payload) {
            chunks += 1;
            yield Ok(delta);
          }
        }
      }
      debug!(target: "tutor", chunks, saw_done = finished, "model stream ended");
    };
    Ok(Box::pin(stream))
  }

  // --- High-level helpers (domain-specialized) ---

  /// One complete tutor turn in JSON mode.
  #[instrument(level = "info", skip(self, messages), fields(model = %self.fast_model))]
  pub async fn tutor_reply(&self, messages: &[ChatMessageReq]) -> Result<TutorReply, LlmError> {
    let text = self.complete(&self.fast_model, messages, 0.4, true).await?;
    let mut acc = JsonAccumulator::new();
    acc.push(&text);
    Ok(acc.finish())
  }

  /// Streamed tutor turn (raw token deltas; the caller accumulates JSON).
  pub async fn tutor_stream(&self, messages: &[ChatMessageReq]) -> Result<DeltaStream, LlmError> {
    self.chat_stream(&self.fast_model, messages, 0.4, true).await
  }

  /// Generate one quiz question for a topic and difficulty.
  #[instrument(level = "info", skip(self, prompts), fields(%topic, difficulty = difficulty.as_str(), model = %self.strong_model))]
  pub async fn generate_question(&self, prompts: &Prompts, topic: &str, difficulty: Difficulty) -> Result<QuizQuestion, LlmError> {
    let user = fill_template(&prompts.quiz_user_template, &[("topic", topic), ("difficulty", difficulty.as_str())]);
    let messages = [ChatMessageReq::text("system", prompts.quiz_system.clone()), ChatMessageReq::text("user", user)];
    let start = Instant::now();
    let gen: GeneratedQuestion = self.chat_json(&self.strong_model, &messages, 0.9).await.map_err(|e| {
      error!(target: "quiz", elapsed = ?start.elapsed(), error = %e, "Model call failed during question generation");
      e
    })?;

    let answer = value_to_text(gen.answer);
    if gen.question.trim().is_empty() || answer.trim().is_empty() {
      return Err(LlmError::Parse("generated question is missing question or answer".into()));
    }
    let q = QuizQuestion {
      id: Uuid::new_v4().to_string(),
      topic: topic.to_string(),
      difficulty,
      question: crate::format::fix_math_formatting(&gen.question),
      answer,
      explanation: crate::format::fix_math_formatting(&gen.explanation),
      choices: gen.choices.into_iter().map(value_to_text).collect(),
      source: QuestionSource::Generated,
    };
    info!(target: "quiz", id = %q.id, elapsed = ?start.elapsed(), preview = %q.question.chars().take(40).collect::<String>(), "Quiz question generated");
    Ok(q)
  }

  /// Ask the model whether an answer is equivalent to the expected one.
  #[instrument(level = "info", skip(self, prompts, question, expected, given), fields(given_len = given.len()))]
  pub async fn grade_with_model(&self, prompts: &Prompts, question: &str, expected: &str, given: &str) -> Result<(bool, String), LlmError> {
    #[derive(Deserialize)]
    struct Verdict {
      correct: bool,
      #[serde(default)]
      explanation: String,
    }
    let user = fill_template(&prompts.grade_user_template, &[("question", question), ("expected", expected), ("given", given)]);
    let messages = [ChatMessageReq::text("system", prompts.grade_system.clone()), ChatMessageReq::text("user", user)];
    let v: Verdict = self.chat_json(&self.strong_model, &messages, 0.0).await?;
    Ok((v.correct, v.explanation))
  }

  /// Free-form structured generation: any JSON object the instruction asks for.
  #[instrument(level = "info", skip(self, prompts, instruction), fields(instr_len = instruction.len()))]
  pub async fn generate_structured(&self, prompts: &Prompts, instruction: &str) -> Result<serde_json::Value, LlmError> {
    let messages = [ChatMessageReq::text("system", prompts.structured_system.clone()), ChatMessageReq::text("user", instruction)];
    let value: serde_json::Value = self.chat_json(&self.fast_model, &messages, 0.3).await?;
    if !value.is_object() {
      return Err(LlmError::Parse("expected a JSON object".into()));
    }
    Ok(value)
  }
}

/// Try to extract a clean error message from an OpenAI error body.
fn extract_openai_error(body: &str) -> Option<String> {
  #[derive(Deserialize)]
  struct EWrap {
    error: EObj,
  }
  #[derive(Deserialize)]
  struct EObj {
    message: String,
  }
  serde_json::from_str::<EWrap>(body).ok().map(|w| w.error.message)
}
