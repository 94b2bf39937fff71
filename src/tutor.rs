//! Tutor turns: request validation, prompt assembly, single and streamed
//! replies, and persistence of both sides of the conversation.
//!
//! Used by the HTTP handlers and by the WebSocket loop.

use std::sync::Arc;

use async_stream::stream;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures_util::{Stream, StreamExt};
use tracing::{debug, error, info, instrument, warn};

use crate::config::Prompts;
use crate::domain::{Role, StepType, TutorReply};
use crate::error::ApiError;
use crate::json_stream::JsonAccumulator;
use crate::openai::{ChatMessageReq, ContentPart, ImageUrl, MessageContent};
use crate::protocol::{ChatIn, ChatOut, StreamFrame};
use crate::state::AppState;
use crate::store::NewMessage;
use crate::util::trunc_for_log;

pub const MAX_HISTORY: usize = 20;
pub const MAX_MESSAGE_CHARS: usize = 4000;
pub const MAX_IMAGE_BYTES: usize = 5 * 1024 * 1024;

const UNAVAILABLE: &str = "The tutor is unavailable right now. Please try again.";

/// A validated turn, ready to send to the model.
#[derive(Debug, Clone)]
pub struct PreparedTurn {
  pub session_id: Option<String>,
  pub text: String,
  pub socratic: bool,
  /// Hosted image URL to persist with the user message.
  pub image_url: Option<String>,
  pub messages: Vec<ChatMessageReq>,
}

/// System prompt + trailing history + the new user message.
pub fn build_messages(prompts: &Prompts, history: &[(Role, String)], text: &str, image: Option<&str>, socratic: bool) -> Vec<ChatMessageReq> {
  let mode = if socratic { &prompts.socratic_addendum } else { &prompts.direct_addendum };
  let mut system = format!("{}\n\n{}\n\n{}", prompts.tutor_system, mode, prompts.reply_format);
  if image.is_some() {
    system.push_str("\n\n");
    system.push_str(&prompts.image_note);
  }

  let mut out = Vec::with_capacity(history.len().min(MAX_HISTORY) + 2);
  out.push(ChatMessageReq::text("system", system));

  let skip = history.len().saturating_sub(MAX_HISTORY);
  for (role, content) in history.iter().skip(skip) {
    if *role == Role::System || content.trim().is_empty() {
      continue;
    }
    out.push(ChatMessageReq::text(role.as_str(), content.clone()));
  }

  let user = match image {
    Some(url) => {
      let mut parts = Vec::with_capacity(2);
      if !text.trim().is_empty() {
        parts.push(ContentPart::Text { text: text.to_string() });
      }
      parts.push(ContentPart::ImageUrl { image_url: ImageUrl { url: url.to_string() } });
      ChatMessageReq { role: "user".into(), content: MessageContent::Parts(parts) }
    }
    None => ChatMessageReq::text("user", text),
  };
  out.push(user);
  out
}

/// Check an inline image and turn it into a data URL.
pub fn image_data_url(b64: &str, mime: Option<&str>) -> Result<String, ApiError> {
  let mime = mime.unwrap_or("image/png").trim();
  if !mime.starts_with("image/") {
    return Err(ApiError::BadRequest(format!("unsupported image type '{}'", mime)));
  }
  // Tolerate clients that send a full data URL.
  let payload = b64.rsplit_once(',').map(|(_, p)| p).unwrap_or(b64).trim();
  if payload.len() / 4 * 3 > MAX_IMAGE_BYTES + 3 {
    return Err(ApiError::BadRequest(format!("image too large; maximum is {} bytes", MAX_IMAGE_BYTES)));
  }
  let bytes = BASE64
    .decode(payload)
    .map_err(|e| ApiError::BadRequest(format!("imageBase64 is not valid base64: {}", e)))?;
  if bytes.is_empty() {
    return Err(ApiError::BadRequest("image is empty".into()));
  }
  if bytes.len() > MAX_IMAGE_BYTES {
    return Err(ApiError::BadRequest(format!("image too large; maximum is {} bytes", MAX_IMAGE_BYTES)));
  }
  Ok(format!("data:{};base64,{}", mime, payload))
}

fn history_role(raw: &str) -> Option<Role> {
  match raw.trim().to_lowercase().as_str() {
    "user" | "student" => Some(Role::User),
    "assistant" | "tutor" | "model" => Some(Role::Assistant),
    _ => None,
  }
}

/// Validate a chat request and assemble the model messages.
#[instrument(level = "debug", skip(state, req), fields(session_id = ?req.session_id, text_len = req.message.len()))]
pub async fn prepare_turn(state: &AppState, req: &ChatIn) -> Result<PreparedTurn, ApiError> {
  let text = req.message.trim().to_string();
  let has_image = req.image_base64.is_some() || req.image_url.is_some();
  if text.is_empty() && !has_image {
    return Err(ApiError::BadRequest("message is empty".into()));
  }
  if text.chars().count() > MAX_MESSAGE_CHARS {
    return Err(ApiError::BadRequest(format!("message too long; maximum is {} characters", MAX_MESSAGE_CHARS)));
  }

  let (model_image, image_url) = match (&req.image_base64, &req.image_url) {
    (Some(b64), _) => (Some(image_data_url(b64, req.image_mime.as_deref())?), None),
    (None, Some(url)) => {
      if !url.starts_with("https://") {
        return Err(ApiError::BadRequest("imageUrl must be an https URL".into()));
      }
      (Some(url.clone()), Some(url.clone()))
    }
    (None, None) => (None, None),
  };

  let (session, history): (_, Vec<(Role, String)>) = match &req.session_id {
    Some(id) => {
      let session = state
        .store
        .get_session(id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("unknown session '{}'", id)))?;
      let history = state.store.list_messages(id).await.into_iter().map(|m| (m.role, m.content)).collect();
      (Some(session), history)
    }
    None => {
      let history = req
        .history
        .iter()
        .filter_map(|h| history_role(&h.role).map(|r| (r, h.content.clone())))
        .collect();
      (None, history)
    }
  };

  let socratic = match (req.socratic, &session, &req.user_id) {
    (Some(s), _, _) => s,
    (None, Some(session), _) => session.socratic,
    (None, None, Some(uid)) => state.store.get_settings(uid).await.socratic_mode,
    (None, None, None) => true,
  };

  let messages = build_messages(&state.prompts, &history, &text, model_image.as_deref(), socratic);
  debug!(target: "tutor", turns = messages.len(), socratic, has_image, "turn prepared");
  Ok(PreparedTurn { session_id: req.session_id.clone(), text, socratic, image_url, messages })
}

async fn persist(state: &AppState, session_id: Option<&str>, msg: NewMessage) {
  if let Some(id) = session_id {
    if state.store.append_message(id, msg).await.is_none() {
      warn!(target: "tutor", %id, "session vanished before the message could be stored");
    }
  }
}

fn user_message(turn: &PreparedTurn) -> NewMessage {
  NewMessage { role: Role::User, content: turn.text.clone(), step_type: None, image_url: turn.image_url.clone() }
}

fn assistant_message(reply: &TutorReply) -> NewMessage {
  NewMessage { role: Role::Assistant, content: reply.content.clone(), step_type: Some(reply.step_type), image_url: None }
}

/// Canned reply used when no model is configured.
pub fn local_reply(text: &str, socratic: bool) -> TutorReply {
  let lower = text.to_lowercase();
  let attempted = ["i got", "my answer", "answer is", "i think it's", "i think it is", "="].iter().any(|m| lower.contains(m));
  if attempted {
    if let Some(n) = crate::answer::extract_numeric_answer(text) {
      return TutorReply {
        content: format!("Let's check your result of {}. Can you walk me through the last step you did to get it?", n),
        step_type: StepType::Check,
      };
    }
  }
  let content = if socratic {
    "Good question! What is the problem asking you to find, and which quantities do you already know?"
  } else {
    "Let's break it down: write down what you know, what you need to find, and the first operation that connects them."
  };
  TutorReply { content: content.into(), step_type: StepType::Hint }
}

/// One complete, non-streamed tutor turn.
#[instrument(level = "info", skip(state, req), fields(session_id = ?req.session_id))]
pub async fn chat_once(state: &AppState, req: &ChatIn) -> Result<ChatOut, ApiError> {
  let turn = prepare_turn(state, req).await?;
  persist(state, turn.session_id.as_deref(), user_message(&turn)).await;

  let reply = match &state.openai {
    Some(oa) => oa.tutor_reply(&turn.messages).await?,
    None => local_reply(&turn.text, turn.socratic),
  };
  persist(state, turn.session_id.as_deref(), assistant_message(&reply)).await;
  info!(target: "tutor", step_type = reply.step_type.as_str(), reply_len = reply.content.len(), "tutor reply served");
  Ok(ChatOut { content: reply.content, step_type: reply.step_type })
}

/// Stream a tutor turn as frames: content deltas, then one final frame.
pub fn stream_chat(state: Arc<AppState>, turn: PreparedTurn) -> impl Stream<Item = StreamFrame> + Send {
  stream! {
    persist(&state, turn.session_id.as_deref(), user_message(&turn)).await;

    let reply = match state.openai.clone() {
      None => {
        let reply = local_reply(&turn.text, turn.socratic);
        let mut first = true;
        for word in reply.content.split_inclusive(' ') {
          let step = if first { Some(reply.step_type) } else { None };
          first = false;
          yield StreamFrame::delta(word.to_string(), step);
        }
        reply
      }
      Some(oa) => {
        let mut deltas = match oa.tutor_stream(&turn.messages).await {
          Ok(s) => s,
          Err(e) => {
            error!(target: "tutor", error = %e, "model stream could not start");
            yield StreamFrame::failed(UNAVAILABLE.into());
            return;
          }
        };

        let mut acc = JsonAccumulator::new();
        let mut step_sent = false;
        let mut broke = false;
        while let Some(item) = deltas.next().await {
          match item {
            Ok(token) => {
              acc.push(&token);
              let delta = acc.take_content_delta();
              let step = if step_sent { None } else { acc.step_type() };
              if step.is_some() {
                step_sent = true;
              }
              if !delta.is_empty() || step.is_some() {
                yield StreamFrame::delta(delta, step);
              }
            }
            Err(e) => {
              error!(target: "tutor", error = %e, received = acc.raw().len(), "model stream failed mid-reply");
              broke = true;
              break;
            }
          }
        }
        if broke || acc.raw().trim().is_empty() {
          if !broke {
            warn!(target: "tutor", "model stream ended without content");
          }
          yield StreamFrame::failed(UNAVAILABLE.into());
          return;
        }
        debug!(target: "tutor", raw = %trunc_for_log(acc.raw(), 120), complete = acc.is_complete(), "model stream accumulated");
        acc.finish()
      }
    };

    persist(&state, turn.session_id.as_deref(), assistant_message(&reply)).await;
    info!(target: "tutor", step_type = reply.step_type.as_str(), reply_len = reply.content.len(), "tutor stream finished");
    yield StreamFrame::last(reply.content, reply.step_type);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::protocol::HistoryItem;

  fn req(message: &str) -> ChatIn {
    ChatIn {
      session_id: None,
      user_id: None,
      message: message.into(),
      socratic: None,
      history: vec![],
      image_base64: None,
      image_mime: None,
      image_url: None,
    }
  }

  fn state() -> AppState {
    AppState::with_parts(None, Prompts::default(), vec![])
  }

  #[test]
  fn build_messages_trims_history_and_picks_mode() {
    let prompts = Prompts::default();
    let history: Vec<(Role, String)> = (0..30).map(|i| (if i % 2 == 0 { Role::User } else { Role::Assistant }, format!("turn {i}"))).collect();
    let msgs = build_messages(&prompts, &history, "next", None, true);
    assert_eq!(msgs.len(), 1 + MAX_HISTORY + 1);
    assert_eq!(msgs[1].content, MessageContent::Text("turn 10".into()));
    match &msgs[0].content {
      MessageContent::Text(s) => {
        assert!(s.contains(&prompts.socratic_addendum));
        assert!(s.contains("stepType"));
      }
      _ => panic!("system prompt should be text"),
    }
    let direct = build_messages(&prompts, &[], "x", None, false);
    assert!(matches!(&direct[0].content, MessageContent::Text(s) if s.contains(&prompts.direct_addendum)));
  }

  #[test]
  fn build_messages_attaches_image_parts() {
    let msgs = build_messages(&Prompts::default(), &[], "what is this?", Some("data:image/png;base64,AAAA"), true);
    let last = msgs.last().unwrap();
    match &last.content {
      MessageContent::Parts(parts) => assert_eq!(parts.len(), 2),
      _ => panic!("expected parts"),
    }
  }

  #[test]
  fn image_validation() {
    let ok = BASE64.encode(b"\x89PNG fake");
    assert!(image_data_url(&ok, Some("image/png")).unwrap().starts_with("data:image/png;base64,"));
    assert!(image_data_url(&format!("data:image/png;base64,{ok}"), None).is_ok());
    assert!(matches!(image_data_url("***", None), Err(ApiError::BadRequest(_))));
    assert!(matches!(image_data_url(&ok, Some("text/plain")), Err(ApiError::BadRequest(_))));
  }

  #[test]
  fn local_reply_checks_numeric_attempts() {
    let r = local_reply("I got x = 4", true);
    assert_eq!(r.step_type, StepType::Check);
    assert!(r.content.contains('4'));
    assert_eq!(local_reply("how do I start?", true).step_type, StepType::Hint);
  }

  #[tokio::test]
  async fn prepare_turn_validates_and_resolves_socratic() {
    let state = state();
    assert!(matches!(prepare_turn(&state, &req("   ")).await, Err(ApiError::BadRequest(_))));
    assert!(matches!(prepare_turn(&state, &req(&"x".repeat(MAX_MESSAGE_CHARS + 1))).await, Err(ApiError::BadRequest(_))));

    let mut r = req("hi");
    r.session_id = Some("missing".into());
    assert!(matches!(prepare_turn(&state, &r).await, Err(ApiError::NotFound(_))));

    let session = state.store.create_session("u1", "t", None, false).await;
    let mut r = req("hi");
    r.session_id = Some(session.id.clone());
    assert!(!prepare_turn(&state, &r).await.unwrap().socratic);
    r.socratic = Some(true);
    assert!(prepare_turn(&state, &r).await.unwrap().socratic);

    let mut r = req("hi");
    r.history = vec![HistoryItem { role: "tutor".into(), content: "hello".into() }, HistoryItem { role: "narrator".into(), content: "skip".into() }];
    let turn = prepare_turn(&state, &r).await.unwrap();
    assert_eq!(turn.messages.len(), 3);
    assert_eq!(turn.messages[1].role, "assistant");
  }

  #[tokio::test]
  async fn local_stream_persists_both_sides() {
    let state = Arc::new(state());
    let session = state.store.create_session("u1", "t", None, true).await;
    let mut r = req("where do I start?");
    r.session_id = Some(session.id.clone());
    let turn = prepare_turn(&state, &r).await.unwrap();

    let frames: Vec<StreamFrame> = stream_chat(state.clone(), turn).collect().await;
    let last = frames.last().unwrap();
    assert!(last.done);
    let streamed: String = frames[..frames.len() - 1].iter().map(|f| f.content.as_str()).collect();
    assert_eq!(streamed, last.content);
    assert_eq!(frames[0].step_type, Some(StepType::Hint));

    let stored = state.store.list_messages(&session.id).await;
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[0].role, Role::User);
    assert_eq!(stored[1].content, last.content);
  }
}
