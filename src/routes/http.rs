//! HTTP endpoint handlers. These are thin wrappers that forward to core logic.
//! Each handler is instrumented and logs parameters and basic result info.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
  extract::{Path, Query, State},
  http::StatusCode,
  response::sse::{Event, KeepAlive, Sse},
  response::IntoResponse,
  Json,
};
use futures_util::{stream, Stream, StreamExt};
use tracing::{info, instrument};

use crate::domain::{ChatMessage, Difficulty, Session, UserSettings};
use crate::error::ApiError;
use crate::protocol::*;
use crate::quiz::{grade_answer, next_question};
use crate::sse::DONE_SENTINEL;
use crate::state::AppState;
use crate::tutor::{chat_once, prepare_turn, stream_chat};

#[instrument(level = "info", skip(state))]
pub async fn http_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
  Json(HealthOut { ok: true, model: state.openai.is_some() })
}

#[instrument(level = "info", skip(state, body), fields(session_id = ?body.session_id, text_len = body.message.len()))]
pub async fn http_post_chat(
  State(state): State<Arc<AppState>>,
  Json(body): Json<ChatIn>,
) -> Result<Json<ChatOut>, ApiError> {
  let out = chat_once(&state, &body).await?;
  Ok(Json(out))
}

/// Tutor reply as server-sent events: one JSON frame per event, then `[DONE]`.
#[instrument(level = "info", skip(state, body), fields(session_id = ?body.session_id, text_len = body.message.len()))]
pub async fn http_post_chat_stream(
  State(state): State<Arc<AppState>>,
  Json(body): Json<ChatIn>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
  // Validation errors are answered before the stream starts.
  let turn = prepare_turn(&state, &body).await?;
  info!(target: "tutor", socratic = turn.socratic, "HTTP chat stream started");

  let frames = stream_chat(state, turn).map(|frame| {
    let data = serde_json::to_string(&frame).unwrap_or_else(|e| {
      serde_json::json!({ "content": "", "done": true, "error": format!("serialization error: {}", e) }).to_string()
    });
    Ok(Event::default().data(data))
  });
  let done = stream::once(async { Ok(Event::default().data(DONE_SENTINEL)) });

  Ok(Sse::new(frames.chain(done)).keep_alive(KeepAlive::default()))
}

#[instrument(level = "info", skip(state, body), fields(instr_len = body.instruction.len()))]
pub async fn http_post_generate(
  State(state): State<Arc<AppState>>,
  Json(body): Json<GenerateIn>,
) -> Result<Json<GenerateOut>, ApiError> {
  if body.instruction.trim().is_empty() {
    return Err(ApiError::BadRequest("instruction is empty".into()));
  }
  let oa = state
    .openai
    .as_ref()
    .ok_or_else(|| ApiError::Unavailable("structured generation needs a model API key".into()))?;
  let result = oa.generate_structured(&state.prompts, &body.instruction).await?;
  Ok(Json(GenerateOut { result }))
}

#[instrument(level = "info", skip(state), fields(topic = ?q.topic, difficulty = ?q.difficulty))]
pub async fn http_get_question(
  State(state): State<Arc<AppState>>,
  Query(q): Query<QuestionQuery>,
) -> impl IntoResponse {
  let difficulty = q.difficulty.as_deref().map(Difficulty::parse_loose).unwrap_or_default();
  let question = next_question(&state, q.topic.as_deref(), difficulty).await;
  info!(target: "quiz", id = %question.id, source = ?question.source, "HTTP question served");
  Json(QuestionOut::from(&question))
}

#[instrument(level = "info", skip(state, body), fields(question_id = ?body.question_id))]
pub async fn http_post_grade(
  State(state): State<Arc<AppState>>,
  Json(body): Json<GradeIn>,
) -> Result<Json<GradeOut>, ApiError> {
  Ok(Json(grade_answer(&state, &body).await?))
}

#[instrument(level = "info", skip(state, body), fields(user_id = %body.user_id))]
pub async fn http_post_session(
  State(state): State<Arc<AppState>>,
  Json(body): Json<NewSessionIn>,
) -> Result<(StatusCode, Json<Session>), ApiError> {
  if body.user_id.trim().is_empty() {
    return Err(ApiError::BadRequest("userId is empty".into()));
  }
  let socratic = match body.socratic {
    Some(s) => s,
    None => state.store.get_settings(&body.user_id).await.socratic_mode,
  };
  let title = body.title.as_deref().map(str::trim).filter(|t| !t.is_empty()).unwrap_or("New session");
  let session = state.store.create_session(&body.user_id, title, body.topic.clone(), socratic).await;
  info!(target: "mathmate", id = %session.id, socratic, "Session created");
  Ok((StatusCode::CREATED, Json(session)))
}

#[instrument(level = "info", skip(state), fields(user_id = %q.user_id))]
pub async fn http_list_sessions(
  State(state): State<Arc<AppState>>,
  Query(q): Query<SessionsQuery>,
) -> Json<Vec<Session>> {
  Json(state.store.list_sessions(&q.user_id).await)
}

#[instrument(level = "info", skip(state))]
pub async fn http_get_session(
  State(state): State<Arc<AppState>>,
  Path(id): Path<String>,
) -> Result<Json<Session>, ApiError> {
  state
    .store
    .get_session(&id)
    .await
    .map(Json)
    .ok_or_else(|| ApiError::NotFound(format!("unknown session '{}'", id)))
}

#[instrument(level = "info", skip(state))]
pub async fn http_delete_session(
  State(state): State<Arc<AppState>>,
  Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
  if state.store.delete_session(&id).await {
    info!(target: "mathmate", %id, "Session deleted");
    Ok(StatusCode::NO_CONTENT)
  } else {
    Err(ApiError::NotFound(format!("unknown session '{}'", id)))
  }
}

#[instrument(level = "info", skip(state))]
pub async fn http_list_messages(
  State(state): State<Arc<AppState>>,
  Path(id): Path<String>,
) -> Result<Json<Vec<ChatMessage>>, ApiError> {
  if state.store.get_session(&id).await.is_none() {
    return Err(ApiError::NotFound(format!("unknown session '{}'", id)));
  }
  Ok(Json(state.store.list_messages(&id).await))
}

#[instrument(level = "info", skip(state))]
pub async fn http_get_settings(
  State(state): State<Arc<AppState>>,
  Path(uid): Path<String>,
) -> Json<UserSettings> {
  Json(state.store.get_settings(&uid).await)
}

#[instrument(level = "info", skip(state, body))]
pub async fn http_put_settings(
  State(state): State<Arc<AppState>>,
  Path(uid): Path<String>,
  Json(body): Json<UserSettings>,
) -> Json<UserSettings> {
  info!(target: "mathmate", %uid, socratic = body.socratic_mode, "Settings saved");
  Json(state.store.put_settings(&uid, body).await)
}
