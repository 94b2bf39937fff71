//! MathMate tutor backend: Socratic math chat with streamed replies, quiz
//! questions with local grading, and per-session message sync.

pub mod answer;
pub mod config;
pub mod domain;
pub mod error;
pub mod format;
pub mod json_stream;
pub mod openai;
pub mod protocol;
pub mod quiz;
pub mod reconcile;
pub mod routes;
pub mod seeds;
pub mod sse;
pub mod state;
pub mod store;
pub mod telemetry;
pub mod tutor;
pub mod util;
