//! WebSocket upgrade + per-connection loop.
//!
//! Each connection owns a `MessageMerger` for the session it watches. Three
//! sources feed it through one `select!`: client frames, store snapshots, and
//! tutor stream frames produced by spawned tasks. A merged view is pushed to
//! the client only when it differs from the last one sent.

use std::sync::Arc;

use axum::{
  extract::{
    ws::{Message, WebSocket},
    State, WebSocketUpgrade,
  },
  response::IntoResponse,
};
use chrono::{Duration as ChronoDuration, Utc};
use futures_util::StreamExt;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, instrument, warn};

use crate::protocol::{ChatIn, ClientWsMessage, ServerWsMessage, StreamFrame};
use crate::reconcile::{MergedMessage, MessageMerger};
use crate::state::AppState;
use crate::store::Snapshot;
use crate::tutor::{prepare_turn, stream_chat};

const FRAME_BUFFER: usize = 64;
const PRUNE_EVERY_SECS: u64 = 15;
const PENDING_TTL_SECS: i64 = 60;

/// A tutor frame tagged with where it belongs.
struct Tagged {
  session_id: String,
  local_id: String,
  frame: StreamFrame,
}

struct Subscription {
  session_id: String,
  rx: broadcast::Receiver<Snapshot>,
}

struct Conn {
  state: Arc<AppState>,
  sub: Option<Subscription>,
  merger: MessageMerger,
  last_sent: Option<Vec<MergedMessage>>,
  frames_tx: mpsc::Sender<Tagged>,
}

#[instrument(level = "info", skip(state))]
pub async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
  info!(target: "mathmate", "WebSocket upgrade requested");
  ws.on_upgrade(move |socket| handle_ws(socket, state))
}

async fn next_snapshot(sub: &mut Option<Subscription>) -> Result<Snapshot, broadcast::error::RecvError> {
  match sub {
    Some(s) => s.rx.recv().await,
    None => std::future::pending().await,
  }
}

async fn send(socket: &mut WebSocket, msg: &ServerWsMessage) -> bool {
  let out = serde_json::to_string(msg).unwrap_or_else(|e| {
    serde_json::json!({ "type": "error", "message": format!("Serialization error: {}", e) }).to_string()
  });
  match socket.send(Message::Text(out)).await {
    Ok(()) => true,
    Err(e) => {
      error!(target: "mathmate", error = %e, "WS send error");
      false
    }
  }
}

#[instrument(level = "info", skip(socket, state))]
async fn handle_ws(mut socket: WebSocket, state: Arc<AppState>) {
  info!(target: "mathmate", "WebSocket connected");
  let (frames_tx, mut frames_rx) = mpsc::channel::<Tagged>(FRAME_BUFFER);
  let mut conn = Conn { state, sub: None, merger: MessageMerger::default(), last_sent: None, frames_tx };
  let mut prune = tokio::time::interval(std::time::Duration::from_secs(PRUNE_EVERY_SECS));

  loop {
    let replies: Vec<ServerWsMessage> = tokio::select! {
      incoming = socket.recv() => match incoming {
        Some(Ok(Message::Text(txt))) => match serde_json::from_str::<ClientWsMessage>(&txt) {
          Ok(msg) => {
            debug!(target: "mathmate", ?msg, "WS received");
            conn.on_client(msg).await
          }
          Err(e) => vec![ServerWsMessage::Error { message: format!("Invalid JSON: {}", e) }],
        },
        Some(Ok(Message::Ping(payload))) => {
          if let Err(e) = socket.send(Message::Pong(payload)).await {
            error!(target: "mathmate", error = %e, "WS pong send error");
          }
          vec![]
        }
        Some(Ok(Message::Close(_))) | None => break,
        Some(Ok(_)) => vec![],
        Some(Err(e)) => {
          warn!(target: "mathmate", error = %e, "WS receive error");
          break;
        }
      },
      snap = next_snapshot(&mut conn.sub) => conn.on_snapshot(snap).await,
      Some(tagged) = frames_rx.recv() => conn.on_frame(tagged),
      _ = prune.tick() => {
        if conn.merger.prune_stale(Utc::now(), ChronoDuration::seconds(PENDING_TTL_SECS)) {
          conn.view_if_changed().into_iter().collect()
        } else {
          vec![]
        }
      }
    };

    for msg in &replies {
      if !send(&mut socket, msg).await {
        info!(target: "mathmate", "WebSocket disconnected");
        return;
      }
    }
  }
  info!(target: "mathmate", "WebSocket disconnected");
}

impl Conn {
  fn view_if_changed(&mut self) -> Option<ServerWsMessage> {
    let sub = self.sub.as_ref()?;
    let view = self.merger.view();
    if self.last_sent.as_ref() == Some(&view) {
      return None;
    }
    self.last_sent = Some(view.clone());
    Some(ServerWsMessage::Messages { session_id: sub.session_id.clone(), messages: view })
  }

  /// Watch a session, resetting local state when switching.
  async fn watch(&mut self, session_id: &str) -> Result<(), ServerWsMessage> {
    if self.sub.as_ref().map(|s| s.session_id.as_str()) == Some(session_id) {
      return Ok(());
    }
    let (snapshot, rx) = self
      .state
      .store
      .subscribe(session_id)
      .await
      .ok_or_else(|| ServerWsMessage::Error { message: format!("unknown session '{}'", session_id) })?;
    self.sub = Some(Subscription { session_id: session_id.to_string(), rx });
    self.merger = MessageMerger::default();
    self.last_sent = None;
    self.merger.apply_remote(snapshot.as_ref().clone());
    info!(target: "mathmate", %session_id, messages = snapshot.len(), "WS subscribed");
    Ok(())
  }

  async fn on_client(&mut self, msg: ClientWsMessage) -> Vec<ServerWsMessage> {
    match msg {
      ClientWsMessage::Ping => vec![ServerWsMessage::Pong],

      ClientWsMessage::Subscribe { session_id } => match self.watch(&session_id).await {
        Ok(()) => {
          // Always answer a subscribe with the current view.
          self.last_sent = None;
          self.view_if_changed().into_iter().collect()
        }
        Err(e) => vec![e],
      },

      ClientWsMessage::SendMessage { session_id, text, socratic } => {
        if let Err(e) = self.watch(&session_id).await {
          return vec![e];
        }
        let req = ChatIn {
          session_id: Some(session_id.clone()),
          user_id: None,
          message: text,
          socratic,
          history: vec![],
          image_base64: None,
          image_mime: None,
          image_url: None,
        };
        let turn = match prepare_turn(&self.state, &req).await {
          Ok(t) => t,
          Err(e) => return vec![ServerWsMessage::Error { message: e.public_message() }],
        };

        let now = Utc::now();
        self.merger.add_pending_user(&turn.text, now);
        let local_id = self.merger.begin_assistant(now);

        let state = self.state.clone();
        let tx = self.frames_tx.clone();
        tokio::spawn(async move {
          let frames = stream_chat(state, turn);
          futures_util::pin_mut!(frames);
          let mut detached = false;
          // Keep polling after the socket goes away so the reply is still stored.
          while let Some(frame) = frames.next().await {
            if detached {
              continue;
            }
            let tagged = Tagged { session_id: session_id.clone(), local_id: local_id.clone(), frame };
            if tx.send(tagged).await.is_err() {
              debug!(target: "tutor", "WS closed mid-stream; finishing reply without relaying frames");
              detached = true;
            }
          }
        });

        self.view_if_changed().into_iter().collect()
      }
    }
  }

  async fn on_snapshot(&mut self, snap: Result<Snapshot, broadcast::error::RecvError>) -> Vec<ServerWsMessage> {
    let Some(session_id) = self.sub.as_ref().map(|s| s.session_id.clone()) else {
      return vec![];
    };
    let messages = match snap {
      Ok(s) => s.as_ref().clone(),
      Err(broadcast::error::RecvError::Lagged(skipped)) => {
        warn!(target: "mathmate", %session_id, skipped, "WS subscriber lagged; reloading snapshot");
        self.state.store.list_messages(&session_id).await
      }
      Err(broadcast::error::RecvError::Closed) => {
        info!(target: "mathmate", %session_id, "Session closed; ending subscription");
        self.merger.apply_remote(Vec::new());
        let out = self.view_if_changed();
        self.sub = None;
        return out.into_iter().collect();
      }
    };
    if self.merger.apply_remote(messages) {
      self.view_if_changed().into_iter().collect()
    } else {
      vec![]
    }
  }

  fn on_frame(&mut self, tagged: Tagged) -> Vec<ServerWsMessage> {
    let Tagged { session_id, local_id, frame } = tagged;
    let current = self.sub.as_ref().map(|s| s.session_id == session_id).unwrap_or(false);

    let changed = if !current {
      false
    } else if frame.error.is_some() {
      self.merger.fail(&local_id)
    } else if frame.done {
      self.merger.complete(&local_id, &frame.content, frame.step_type.unwrap_or_default())
    } else {
      self.merger.apply_delta(&local_id, &frame.content, frame.step_type)
    };

    let mut out = vec![ServerWsMessage::Stream { session_id, frame }];
    if changed {
      out.extend(self.view_if_changed());
    }
    out
  }
}
