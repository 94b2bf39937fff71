//! Public protocol structs for WebSocket and HTTP endpoints (serde ready).
//! Keep this small and stable to evolve backend and frontend independently.

use serde::{Deserialize, Serialize};

use crate::answer::GradeMethod;
use crate::domain::{Difficulty, QuizQuestion, StepType};
use crate::reconcile::MergedMessage;

/// One SSE frame of a streamed tutor reply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StreamFrame {
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_type: Option<StepType>,
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StreamFrame {
    pub fn delta(content: String, step_type: Option<StepType>) -> Self {
        Self { content, step_type, done: false, error: None }
    }

    pub fn last(content: String, step_type: StepType) -> Self {
        Self { content, step_type: Some(step_type), done: true, error: None }
    }

    pub fn failed(message: String) -> Self {
        Self { content: String::new(), step_type: None, done: true, error: Some(message) }
    }
}

/// Messages the client can send over WebSocket.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientWsMessage {
    Ping,
    Subscribe {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    SendMessage {
        #[serde(rename = "sessionId")]
        session_id: String,
        text: String,
        #[serde(default)]
        socratic: Option<bool>,
    },
}

/// Messages the server sends back over WebSocket.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerWsMessage {
    Pong,
    Messages {
        #[serde(rename = "sessionId")]
        session_id: String,
        messages: Vec<MergedMessage>,
    },
    Stream {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(flatten)]
        frame: StreamFrame,
    },
    Error {
        message: String,
    },
}

//
// HTTP request/response DTOs
//

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatIn {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub message: String,
    /// Overrides the session/user preference when present.
    #[serde(default)]
    pub socratic: Option<bool>,
    /// Prior turns for stateless calls (ignored when a session is given).
    #[serde(default)]
    pub history: Vec<HistoryItem>,
    #[serde(default)]
    pub image_base64: Option<String>,
    #[serde(default)]
    pub image_mime: Option<String>,
    /// Already-hosted image; stored with the message.
    #[serde(default)]
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct HistoryItem {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatOut {
    pub content: String,
    pub step_type: StepType,
}

#[derive(Debug, Deserialize)]
pub struct GenerateIn {
    pub instruction: String,
}
#[derive(Debug, Serialize)]
pub struct GenerateOut {
    pub result: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct QuestionQuery {
    pub topic: Option<String>,
    pub difficulty: Option<String>,
}

/// Question as shown to the student (no answer).
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionOut {
    pub id: String,
    pub topic: String,
    pub difficulty: Difficulty,
    pub question: String,
    pub choices: Vec<String>,
    pub source: crate::domain::QuestionSource,
}

impl From<&QuizQuestion> for QuestionOut {
    fn from(q: &QuizQuestion) -> Self {
        Self {
            id: q.id.clone(),
            topic: q.topic.clone(),
            difficulty: q.difficulty,
            question: q.question.clone(),
            choices: q.choices.clone(),
            source: q.source,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeIn {
    #[serde(default)]
    pub question_id: Option<String>,
    /// Inline grading without a stored question.
    #[serde(default)]
    pub question: Option<String>,
    #[serde(default)]
    pub expected: Option<String>,
    pub answer: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeOut {
    pub correct: bool,
    pub expected: String,
    pub explanation: String,
    pub method: GradeMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extracted: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSessionIn {
    pub user_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub socratic: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionsQuery {
    pub user_id: String,
}

#[derive(Serialize)]
pub struct HealthOut {
    pub ok: bool,
    pub model: bool,
}
