//! Merging of locally pending chat messages with the persisted snapshot.
//!
//! A connection shows the student's message the moment it is sent and the
//! tutor reply while it streams. The same messages later come back through
//! the store subscription. Pending entries are dropped only once a remote
//! message confirms them, so the view never blinks empty or shows doubles.
//!
//! Confirmation rules:
//! - same role, and the remote was created no earlier than the pending and
//!   at most `window` after it
//! - normalized content equality, or for a reply still streaming, the
//!   remote content extends the non-empty text streamed so far
//! - one remote message confirms at most one pending message

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::domain::{ChatMessage, Role, StepType};
use crate::util::normalize_ws;

pub const DEFAULT_MATCH_WINDOW_SECS: i64 = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PendingStatus {
  /// Written locally, not yet seen in the store.
  Sending,
  /// Assistant reply receiving tokens.
  Streaming,
  /// Assistant reply finished streaming, not yet seen in the store.
  Complete,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PendingMessage {
  pub local_id: String,
  pub role: Role,
  pub content: String,
  pub step_type: Option<StepType>,
  pub created_at: DateTime<Utc>,
  pub status: PendingStatus,
}

/// One row of the merged view sent to clients.
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MergedMessage {
  pub id: String,
  pub role: Role,
  pub content: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub step_type: Option<StepType>,
  pub created_at: DateTime<Utc>,
  pub pending: bool,
}

#[derive(Debug)]
pub struct MessageMerger {
  pending: Vec<PendingMessage>,
  remote: Vec<ChatMessage>,
  window: Duration,
}

impl Default for MessageMerger {
  fn default() -> Self { Self::new(Duration::seconds(DEFAULT_MATCH_WINDOW_SECS)) }
}

impl MessageMerger {
  pub fn new(window: Duration) -> Self {
    Self { pending: Vec::new(), remote: Vec::new(), window }
  }

  pub fn pending(&self) -> &[PendingMessage] {
    &self.pending
  }

  pub fn add_pending_user(&mut self, content: &str, at: DateTime<Utc>) -> String {
    self.push_pending(Role::User, content.to_string(), PendingStatus::Sending, at)
  }

  pub fn begin_assistant(&mut self, at: DateTime<Utc>) -> String {
    self.push_pending(Role::Assistant, String::new(), PendingStatus::Streaming, at)
  }

  fn push_pending(&mut self, role: Role, content: String, status: PendingStatus, at: DateTime<Utc>) -> String {
    let local_id = format!("local-{}", Uuid::new_v4());
    self.pending.push(PendingMessage {
      local_id: local_id.clone(),
      role,
      content,
      step_type: None,
      created_at: at,
      status,
    });
    local_id
  }

  fn find_mut(&mut self, local_id: &str) -> Option<&mut PendingMessage> {
    self.pending.iter_mut().find(|p| p.local_id == local_id)
  }

  /// Append streamed text. Ignored when the entry is gone (already confirmed).
  pub fn apply_delta(&mut self, local_id: &str, delta: &str, step_type: Option<StepType>) -> bool {
    match self.find_mut(local_id) {
      Some(p) if p.status == PendingStatus::Streaming => {
        p.content.push_str(delta);
        if step_type.is_some() {
          p.step_type = step_type;
        }
        !delta.is_empty() || step_type.is_some()
      }
      _ => false,
    }
  }

  /// The stream ended; the final content replaces what was streamed.
  pub fn complete(&mut self, local_id: &str, content: &str, step_type: StepType) -> bool {
    let confirmed_already = match self.find_mut(local_id) {
      Some(p) => {
        p.content = content.to_string();
        p.step_type = Some(step_type);
        p.status = PendingStatus::Complete;
        false
      }
      None => true,
    };
    if confirmed_already {
      return false;
    }
    // The snapshot may have arrived before the final frame.
    self.confirm_against_remote();
    true
  }

  pub fn fail(&mut self, local_id: &str) -> bool {
    let before = self.pending.len();
    self.pending.retain(|p| p.local_id != local_id);
    before != self.pending.len()
  }

  /// Replace the remote snapshot; returns whether the merged view changed.
  pub fn apply_remote(&mut self, snapshot: Vec<ChatMessage>) -> bool {
    let before = self.view();
    self.remote = snapshot;
    self.confirm_against_remote();
    self.view() != before
  }

  /// Drop completed replies the store never confirmed (e.g. persistence failed).
  pub fn prune_stale(&mut self, now: DateTime<Utc>, ttl: Duration) -> bool {
    let before = self.pending.len();
    self
      .pending
      .retain(|p| !(p.status != PendingStatus::Streaming && now - p.created_at > ttl));
    before != self.pending.len()
  }

  fn confirm_against_remote(&mut self) {
    let mut used: HashSet<&str> = HashSet::new();
    let window = self.window;
    let remote = &self.remote;
    self.pending.retain(|p| {
      let hit = remote.iter().find(|r| !used.contains(r.id.as_str()) && confirms(r, p, window));
      match hit {
        Some(r) => {
          used.insert(r.id.as_str());
          false
        }
        None => true,
      }
    });
  }

  /// Remote rows followed by unconfirmed pendings, ordered by creation time.
  pub fn view(&self) -> Vec<MergedMessage> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut rows: Vec<(u8, MergedMessage)> = Vec::with_capacity(self.remote.len() + self.pending.len());
    for r in &self.remote {
      if !seen.insert(r.id.as_str()) {
        continue;
      }
      rows.push((
        0,
        MergedMessage {
          id: r.id.clone(),
          role: r.role,
          content: r.content.clone(),
          step_type: r.step_type,
          created_at: r.created_at,
          pending: false,
        },
      ));
    }
    for p in &self.pending {
      rows.push((
        1,
        MergedMessage {
          id: p.local_id.clone(),
          role: p.role,
          content: p.content.clone(),
          step_type: p.step_type,
          created_at: p.created_at,
          pending: true,
        },
      ));
    }
    // Stable sort: equal timestamps keep snapshot order, then pending order.
    rows.sort_by(|(ka, a), (kb, b)| a.created_at.cmp(&b.created_at).then(ka.cmp(kb)));
    rows.into_iter().map(|(_, m)| m).collect()
  }
}

fn confirms(remote: &ChatMessage, pending: &PendingMessage, window: Duration) -> bool {
  if remote.role != pending.role {
    return false;
  }
  // The local timestamp is taken before the store write, so a remote message
  // created earlier is some older message with the same text.
  let delta = remote.created_at - pending.created_at;
  if delta < Duration::zero() || delta > window {
    return false;
  }
  let r = normalize_ws(&remote.content);
  let p = normalize_ws(&pending.content);
  match pending.status {
    PendingStatus::Streaming => !p.is_empty() && r.starts_with(&p),
    PendingStatus::Sending | PendingStatus::Complete => r == p,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn t0() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-03-01T10:00:00Z").unwrap().with_timezone(&Utc)
  }

  fn remote(id: &str, role: Role, content: &str, at: DateTime<Utc>) -> ChatMessage {
    ChatMessage {
      id: id.into(),
      session_id: "s".into(),
      role,
      content: content.into(),
      step_type: None,
      image_url: None,
      created_at: at,
    }
  }

  #[test]
  fn pending_user_message_is_confirmed_by_snapshot() {
    let mut m = MessageMerger::default();
    m.add_pending_user("What is 2+2?", t0());
    assert_eq!(m.view().len(), 1);
    assert!(m.view()[0].pending);

    let changed = m.apply_remote(vec![remote("r1", Role::User, "What is  2+2?", t0() + Duration::seconds(1))]);
    assert!(changed);
    let v = m.view();
    assert_eq!(v.len(), 1);
    assert_eq!(v[0].id, "r1");
    assert!(!v[0].pending);
    assert!(m.pending().is_empty());
  }

  #[test]
  fn identical_snapshot_reports_no_change() {
    let mut m = MessageMerger::default();
    let snap = vec![remote("r1", Role::User, "hi", t0())];
    assert!(m.apply_remote(snap.clone()));
    assert!(!m.apply_remote(snap));
  }

  #[test]
  fn outside_window_does_not_confirm() {
    let mut m = MessageMerger::default();
    m.add_pending_user("again", t0());
    m.apply_remote(vec![remote("old", Role::User, "again", t0() - Duration::seconds(60))]);
    let v = m.view();
    assert_eq!(v.len(), 2);
    assert_eq!(v[0].id, "old");
    assert!(v[1].pending);
  }

  #[test]
  fn one_remote_confirms_only_one_pending() {
    let mut m = MessageMerger::default();
    m.add_pending_user("ok", t0());
    m.add_pending_user("ok", t0() + Duration::seconds(2));
    m.apply_remote(vec![remote("r1", Role::User, "ok", t0())]);
    assert_eq!(m.pending().len(), 1);
    assert_eq!(m.view().len(), 2);
  }

  #[test]
  fn repeated_message_is_not_confirmed_by_the_earlier_copy() {
    let mut m = MessageMerger::default();
    m.apply_remote(vec![remote("r1", Role::User, "ok", t0())]);
    m.add_pending_user("ok", t0() + Duration::seconds(2));
    assert_eq!(m.view().len(), 2);

    assert!(!m.apply_remote(vec![remote("r1", Role::User, "ok", t0())]));
    assert_eq!(m.pending().len(), 1);
    assert_eq!(m.view().len(), 2);

    m.apply_remote(vec![
      remote("r1", Role::User, "ok", t0()),
      remote("r2", Role::User, "ok", t0() + Duration::seconds(2)),
    ]);
    assert!(m.pending().is_empty());
    assert_eq!(m.view().len(), 2);
  }

  #[test]
  fn streaming_reply_survives_until_store_catches_up() {
    let mut m = MessageMerger::default();
    let id = m.begin_assistant(t0());
    assert!(m.apply_delta(&id, "Try ", Some(StepType::Hint)));
    assert!(m.apply_delta(&id, "halving", None));

    // Snapshot without the reply: local stream stays visible.
    assert!(!m.apply_remote(vec![]));
    assert_eq!(m.view()[0].content, "Try halving");

    // Store is ahead of the stream (final frame not processed yet).
    m.apply_remote(vec![remote("a1", Role::Assistant, "Try halving both sides.", t0())]);
    assert!(m.pending().is_empty());
    assert!(!m.apply_delta(&id, " both", None));
    assert!(!m.complete(&id, "Try halving both sides.", StepType::Hint));
    assert_eq!(m.view().len(), 1);
  }

  #[test]
  fn completed_reply_waits_for_equal_remote_content() {
    let mut m = MessageMerger::default();
    let id = m.begin_assistant(t0());
    m.apply_delta(&id, "x = \\(2\\)", None);
    assert!(m.complete(&id, "x = $2$", StepType::Final));
    // A stale snapshot with different content must not swallow it.
    m.apply_remote(vec![remote("a0", Role::Assistant, "something else", t0())]);
    assert_eq!(m.pending().len(), 1);
    m.apply_remote(vec![remote("a1", Role::Assistant, "x = $2$", t0())]);
    assert!(m.pending().is_empty());
  }

  #[test]
  fn snapshot_before_final_frame_is_reconciled_on_complete() {
    let mut m = MessageMerger::default();
    let id = m.begin_assistant(t0());
    m.apply_delta(&id, "Raw \\(1\\)", None);
    m.apply_remote(vec![remote("a1", Role::Assistant, "Raw $1$", t0())]);
    assert_eq!(m.pending().len(), 1);
    m.complete(&id, "Raw $1$", StepType::Final);
    assert!(m.pending().is_empty());
    assert_eq!(m.view().len(), 1);
  }

  #[test]
  fn view_orders_by_time_and_dedupes_remote_ids() {
    let mut m = MessageMerger::default();
    m.add_pending_user("later", t0() + Duration::seconds(30));
    m.apply_remote(vec![
      remote("b", Role::Assistant, "second", t0() + Duration::seconds(1)),
      remote("a", Role::User, "first", t0()),
      remote("a", Role::User, "first", t0()),
    ]);
    let contents: Vec<String> = m.view().into_iter().map(|r| r.content).collect();
    assert_eq!(contents, vec!["first", "second", "later"]);
  }

  #[test]
  fn empty_placeholder_is_not_confirmed_by_previous_reply() {
    let mut m = MessageMerger::default();
    let id = m.begin_assistant(t0());
    m.apply_remote(vec![remote("prev", Role::Assistant, "Earlier hint", t0() - Duration::seconds(3))]);
    assert_eq!(m.pending().len(), 1);
    assert!(m.apply_delta(&id, "Earlier", None));
    m.apply_remote(vec![remote("prev", Role::Assistant, "Earlier hint", t0() - Duration::seconds(3))]);
    assert_eq!(m.pending().len(), 1);
  }

  #[test]
  fn fail_and_prune_remove_pendings() {
    let mut m = MessageMerger::default();
    let id = m.begin_assistant(t0());
    assert!(m.fail(&id));
    assert!(!m.fail(&id));

    let id = m.begin_assistant(t0());
    m.complete(&id, "done", StepType::Final);
    let streaming = m.begin_assistant(t0());
    assert!(m.prune_stale(t0() + Duration::seconds(120), Duration::seconds(60)));
    assert_eq!(m.pending().len(), 1);
    assert_eq!(m.pending()[0].local_id, streaming);
  }
}
