//! Quiz questions and grading.
//!
//! Questions come from the model when one is configured, otherwise from the
//! local bank (TOML entries plus seeds). Grading is local first; the model is
//! only asked when the local grader cannot decide.

use rand::seq::SliceRandom;
use tracing::{debug, error, info, instrument, warn};

use crate::answer::{grade, GradeMethod};
use crate::domain::{Difficulty, QuizQuestion};
use crate::error::ApiError;
use crate::protocol::{GradeIn, GradeOut};
use crate::seeds::hard_fallback_question;
use crate::state::AppState;

fn served_key(topic: Option<&str>, difficulty: Difficulty) -> String {
  format!("{}|{}", topic.unwrap_or("*"), difficulty.as_str())
}

/// Pick a bank question, preferring an exact difficulty match and never
/// repeating `last` when there is another option.
pub fn pick_from_bank<'a>(bank: &'a [QuizQuestion], topic: Option<&str>, difficulty: Difficulty, last: Option<&str>) -> Option<&'a QuizQuestion> {
  let on_topic: Vec<&QuizQuestion> = bank.iter().filter(|q| topic.map_or(true, |t| q.topic == t)).collect();
  let exact: Vec<&QuizQuestion> = on_topic.iter().copied().filter(|q| q.difficulty == difficulty).collect();
  let pool = if exact.is_empty() { on_topic } else { exact };

  let fresh: Vec<&QuizQuestion> = pool.iter().copied().filter(|q| Some(q.id.as_str()) != last).collect();
  let pool = if fresh.is_empty() { pool } else { fresh };

  let mut rng = rand::thread_rng();
  pool.choose(&mut rng).copied()
}

/// Next quiz question for a topic and difficulty. The question is stored so
/// it can be graded by id.
#[instrument(level = "info", skip(state), fields(topic = ?topic, difficulty = difficulty.as_str()))]
pub async fn next_question(state: &AppState, topic: Option<&str>, difficulty: Difficulty) -> QuizQuestion {
  let topic = topic.map(|t| t.trim().to_lowercase()).filter(|t| !t.is_empty());

  if let (Some(oa), Some(t)) = (&state.openai, topic.as_deref()) {
    match oa.generate_question(&state.prompts, t, difficulty).await {
      Ok(q) => {
        state.store.insert_question(q.clone()).await;
        return q;
      }
      Err(e) => error!(target: "quiz", error = %e, "Question generation failed; using local bank."),
    }
  }

  let key = served_key(topic.as_deref(), difficulty);
  let last = state.last_served.read().await.get(&key).cloned();
  let picked = pick_from_bank(&state.quiz_bank, topic.as_deref(), difficulty, last.as_deref()).cloned();

  let q = match picked {
    Some(q) => {
      state.last_served.write().await.insert(key, q.id.clone());
      debug!(target: "quiz", id = %q.id, source = ?q.source, "Served bank question");
      q
    }
    None => {
      warn!(target: "quiz", topic = ?topic, "No local question for topic; serving fallback.");
      hard_fallback_question(topic.as_deref().unwrap_or("arithmetic"), difficulty)
    }
  };
  state.store.insert_question(q.clone()).await;
  q
}

/// Grade a student's answer for a stored question or an inline one.
#[instrument(level = "info", skip(state, req), fields(question_id = ?req.question_id, answer_len = req.answer.len()))]
pub async fn grade_answer(state: &AppState, req: &GradeIn) -> Result<GradeOut, ApiError> {
  let (question, expected, explanation, choices) = match (&req.question_id, &req.expected) {
    (Some(id), _) => {
      let q = state
        .store
        .get_question(id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("unknown question '{}'", id)))?;
      (q.question, q.answer, q.explanation, q.choices)
    }
    (None, Some(expected)) => (req.question.clone().unwrap_or_default(), expected.clone(), String::new(), Vec::new()),
    (None, None) => return Err(ApiError::BadRequest("questionId or expected is required".into())),
  };

  let local = grade(&expected, &req.answer, &choices);
  let mut out = GradeOut {
    correct: local.correct,
    expected: expected.clone(),
    explanation,
    method: local.method,
    extracted: local.extracted,
  };

  if local.method == GradeMethod::Inconclusive {
    if let Some(oa) = &state.openai {
      match oa.grade_with_model(&state.prompts, &question, &expected, &req.answer).await {
        Ok((correct, why)) => {
          out.correct = correct;
          out.method = GradeMethod::Model;
          if !why.trim().is_empty() {
            out.explanation = why;
          }
        }
        Err(e) => error!(target: "quiz", error = %e, "Model grading failed; keeping local verdict."),
      }
    }
  }

  info!(target: "quiz", correct = out.correct, method = ?out.method, "Answer graded");
  Ok(out)
}
