//! In-memory document store: sessions, messages, quiz questions, settings.
//!
//! Message writes broadcast the session's full snapshot to subscribers,
//! the way a real-time document subscription would.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::domain::{ChatMessage, QuizQuestion, Role, Session, StepType, UserSettings};

const SUBSCRIBER_BUFFER: usize = 32;
/// Served questions kept for grading; the oldest is evicted beyond this.
pub const QUESTION_CAPACITY: usize = 1024;

pub type Snapshot = Arc<Vec<ChatMessage>>;

/// Fields of a new message; id and timestamp are assigned by the store.
#[derive(Clone, Debug)]
pub struct NewMessage {
  pub role: Role,
  pub content: String,
  pub step_type: Option<StepType>,
  pub image_url: Option<String>,
}

/// Questions by id, remembering insertion order for eviction.
#[derive(Default)]
struct QuestionCache {
  by_id: HashMap<String, QuizQuestion>,
  order: VecDeque<String>,
}

impl QuestionCache {
  fn insert(&mut self, q: QuizQuestion, capacity: usize) {
    if self.by_id.insert(q.id.clone(), q.clone()).is_none() {
      self.order.push_back(q.id);
    }
    while self.order.len() > capacity {
      if let Some(old) = self.order.pop_front() {
        self.by_id.remove(&old);
      }
    }
  }
}

#[derive(Clone)]
pub struct Store {
  sessions: Arc<RwLock<HashMap<String, Session>>>,
  messages: Arc<RwLock<HashMap<String, Vec<ChatMessage>>>>,
  questions: Arc<RwLock<QuestionCache>>,
  question_capacity: usize,
  settings: Arc<RwLock<HashMap<String, UserSettings>>>,
  watchers: Arc<RwLock<HashMap<String, broadcast::Sender<Snapshot>>>>,
}

impl Default for Store {
  fn default() -> Self { Self::with_question_capacity(QUESTION_CAPACITY) }
}

impl Store {
  pub fn new() -> Self { Self::default() }

  pub fn with_question_capacity(question_capacity: usize) -> Self {
    Self {
      sessions: Arc::default(),
      messages: Arc::default(),
      questions: Arc::default(),
      question_capacity: question_capacity.max(1),
      settings: Arc::default(),
      watchers: Arc::default(),
    }
  }

  #[instrument(level = "debug", skip(self, title))]
  pub async fn create_session(&self, user_id: &str, title: &str, topic: Option<String>, socratic: bool) -> Session {
    let now = Utc::now();
    let session = Session {
      id: Uuid::new_v4().to_string(),
      user_id: user_id.to_string(),
      title: title.to_string(),
      topic,
      socratic,
      created_at: now,
      updated_at: now,
    };
    self.sessions.write().await.insert(session.id.clone(), session.clone());
    self.messages.write().await.insert(session.id.clone(), Vec::new());
    session
  }

  pub async fn get_session(&self, id: &str) -> Option<Session> {
    self.sessions.read().await.get(id).cloned()
  }

  /// Newest activity first.
  pub async fn list_sessions(&self, user_id: &str) -> Vec<Session> {
    let mut out: Vec<Session> = self.sessions.read().await.values().filter(|s| s.user_id == user_id).cloned().collect();
    out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    out
  }

  /// Remove the session and its messages; subscribers see an empty snapshot.
  #[instrument(level = "debug", skip(self))]
  pub async fn delete_session(&self, id: &str) -> bool {
    let existed = self.sessions.write().await.remove(id).is_some();
    self.messages.write().await.remove(id);
    if let Some(tx) = self.watchers.write().await.remove(id) {
      let _ = tx.send(Arc::new(Vec::new()));
    }
    existed
  }

  /// Append to a session and notify subscribers. None when the session is gone.
  #[instrument(level = "debug", skip(self, msg), fields(role = msg.role.as_str(), content_len = msg.content.len()))]
  pub async fn append_message(&self, session_id: &str, msg: NewMessage) -> Option<ChatMessage> {
    let now = Utc::now();
    {
      let mut sessions = self.sessions.write().await;
      let session = sessions.get_mut(session_id)?;
      session.updated_at = now;
    }
    let stored = ChatMessage {
      id: Uuid::new_v4().to_string(),
      session_id: session_id.to_string(),
      role: msg.role,
      content: msg.content,
      step_type: msg.step_type,
      image_url: msg.image_url,
      created_at: now,
    };
    let snapshot = {
      let mut messages = self.messages.write().await;
      let list = messages.entry(session_id.to_string()).or_default();
      list.push(stored.clone());
      Arc::new(list.clone())
    };
    if let Some(tx) = self.watchers.read().await.get(session_id) {
      // No receivers is fine.
      let receivers = tx.send(snapshot).unwrap_or(0);
      debug!(target: "tutor", %session_id, receivers, "snapshot broadcast");
    }
    Some(stored)
  }

  pub async fn list_messages(&self, session_id: &str) -> Vec<ChatMessage> {
    self.messages.read().await.get(session_id).cloned().unwrap_or_default()
  }

  /// Current snapshot plus a receiver for every later one.
  pub async fn subscribe(&self, session_id: &str) -> Option<(Snapshot, broadcast::Receiver<Snapshot>)> {
    if !self.sessions.read().await.contains_key(session_id) {
      return None;
    }
    let rx = {
      let mut watchers = self.watchers.write().await;
      watchers
        .entry(session_id.to_string())
        .or_insert_with(|| broadcast::channel(SUBSCRIBER_BUFFER).0)
        .subscribe()
    };
    // Taken after subscribing so no append can slip between the two.
    let snapshot = Arc::new(self.list_messages(session_id).await);
    Some((snapshot, rx))
  }

  pub async fn insert_question(&self, q: QuizQuestion) {
    self.questions.write().await.insert(q, self.question_capacity);
  }

  pub async fn get_question(&self, id: &str) -> Option<QuizQuestion> {
    self.questions.read().await.by_id.get(id).cloned()
  }

  pub async fn question_count(&self) -> usize {
    self.questions.read().await.by_id.len()
  }

  pub async fn get_settings(&self, user_id: &str) -> UserSettings {
    self.settings.read().await.get(user_id).cloned().unwrap_or_default()
  }

  pub async fn put_settings(&self, user_id: &str, settings: UserSettings) -> UserSettings {
    self.settings.write().await.insert(user_id.to_string(), settings.clone());
    settings
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::domain::Difficulty;
  use crate::seeds::hard_fallback_question;

  fn user_msg(text: &str) -> NewMessage {
    NewMessage { role: Role::User, content: text.into(), step_type: None, image_url: None }
  }

  #[tokio::test]
  async fn append_broadcasts_full_snapshot() {
    let store = Store::new();
    let s = store.create_session("u1", "Fractions", None, true).await;
    let (initial, mut rx) = store.subscribe(&s.id).await.unwrap();
    assert!(initial.is_empty());

    store.append_message(&s.id, user_msg("hi")).await.unwrap();
    store.append_message(&s.id, user_msg("there")).await.unwrap();

    assert_eq!(rx.recv().await.unwrap().len(), 1);
    let snap = rx.recv().await.unwrap();
    assert_eq!(snap.iter().map(|m| m.content.as_str()).collect::<Vec<_>>(), vec!["hi", "there"]);
  }

  #[tokio::test]
  async fn unknown_session_is_rejected() {
    let store = Store::new();
    assert!(store.append_message("nope", user_msg("x")).await.is_none());
    assert!(store.subscribe("nope").await.is_none());
  }

  #[tokio::test]
  async fn delete_clears_messages_and_notifies() {
    let store = Store::new();
    let s = store.create_session("u1", "t", None, false).await;
    store.append_message(&s.id, user_msg("x")).await;
    let (_, mut rx) = store.subscribe(&s.id).await.unwrap();
    assert!(store.delete_session(&s.id).await);
    assert!(rx.recv().await.unwrap().is_empty());
    assert!(store.list_messages(&s.id).await.is_empty());
    assert!(!store.delete_session(&s.id).await);
  }

  #[tokio::test]
  async fn sessions_listed_newest_activity_first() {
    let store = Store::new();
    let a = store.create_session("u1", "a", None, true).await;
    let b = store.create_session("u1", "b", None, true).await;
    store.create_session("u2", "other", None, true).await;
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    store.append_message(&a.id, user_msg("bump")).await;
    let ids: Vec<String> = store.list_sessions("u1").await.into_iter().map(|s| s.id).collect();
    assert_eq!(ids, vec![a.id, b.id]);
  }

  #[tokio::test]
  async fn question_cache_is_bounded() {
    let store = Store::with_question_capacity(2);
    for i in 0..3 {
      store.insert_question(hard_fallback_question(&format!("topic {i}"), Difficulty::Easy)).await;
    }
    assert_eq!(store.question_count().await, 2);
    assert!(store.get_question("fallback-topic-0-easy").await.is_none());
    assert!(store.get_question("fallback-topic-2-easy").await.is_some());

    // Re-inserting a known id replaces it in place.
    store.insert_question(hard_fallback_question("topic 2", Difficulty::Easy)).await;
    assert_eq!(store.question_count().await, 2);
    assert!(store.get_question("fallback-topic-1-easy").await.is_some());
  }

  #[tokio::test]
  async fn settings_default_then_update() {
    let store = Store::new();
    assert!(store.get_settings("u1").await.socratic_mode);
    store.put_settings("u1", UserSettings { socratic_mode: false, grade_level: Some("7".into()) }).await;
    assert!(!store.get_settings("u1").await.socratic_mode);
  }
}
