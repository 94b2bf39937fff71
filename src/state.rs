//! Application state: the document store, prompts, the quiz bank, and the
//! optional model client.
//!
//! When OPENAI_API_KEY is absent every feature still works on local
//! fallbacks (canned tutor nudges, seed questions, local grading).

use std::{collections::HashMap, sync::Arc};

use tokio::sync::RwLock;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::{load_config_from_env, Prompts, QuizQuestionCfg};
use crate::domain::{QuestionSource, QuizQuestion};
use crate::openai::OpenAI;
use crate::seeds::seed_questions;
use crate::store::Store;

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub openai: Option<OpenAI>,
    pub prompts: Prompts,
    /// Local questions (TOML bank first, then built-in seeds).
    pub quiz_bank: Arc<Vec<QuizQuestion>>,
    /// Last bank question served per "topic|difficulty", to avoid repeats.
    pub last_served: Arc<RwLock<HashMap<String, String>>>,
}

fn bank_question(cfg: &QuizQuestionCfg) -> QuizQuestion {
    QuizQuestion {
        id: cfg.id.clone().unwrap_or_else(|| Uuid::new_v4().to_string()),
        topic: cfg.topic.trim().to_lowercase(),
        difficulty: cfg.difficulty,
        question: cfg.question.clone(),
        answer: cfg.answer.clone(),
        explanation: cfg.explanation.clone().unwrap_or_default(),
        choices: cfg.choices.clone(),
        source: QuestionSource::LocalBank,
    }
}

impl AppState {
    /// Build state from env: load config, merge the quiz bank, init the model client.
    #[instrument(level = "info", skip_all)]
    pub fn new() -> Self {
        let cfg = load_config_from_env().unwrap_or_default();

        let openai = OpenAI::from_env();
        if let Some(oa) = &openai {
            info!(target: "mathmate", base_url = %oa.base_url, fast_model = %oa.fast_model, strong_model = %oa.strong_model, "Model API enabled.");
        } else {
            warn!(target: "mathmate", "Model API disabled (no OPENAI_API_KEY). Using local fallbacks.");
        }

        let bank: Vec<QuizQuestion> = cfg.quiz_bank.iter().map(bank_question).collect();
        Self::with_parts(openai, cfg.prompts, bank)
    }

    /// Assemble state from explicit parts; seeds are appended after `bank`.
    pub fn with_parts(openai: Option<OpenAI>, prompts: Prompts, bank: Vec<QuizQuestion>) -> Self {
        let mut quiz_bank = bank;
        for seed in seed_questions() {
            if !quiz_bank.iter().any(|q| q.id == seed.id) {
                quiz_bank.push(seed);
            }
        }

        let mut count_by_topic: HashMap<&str, (usize, usize)> = HashMap::new();
        for q in &quiz_bank {
            let entry = count_by_topic.entry(q.topic.as_str()).or_insert((0, 0));
            match q.source {
                QuestionSource::LocalBank => entry.0 += 1,
                _ => entry.1 += 1,
            }
        }
        for (topic, (bank, seed)) in count_by_topic {
            info!(target: "quiz", %topic, local_bank = bank, seed = seed, "Startup quiz inventory");
        }

        Self {
            store: Store::new(),
            openai,
            prompts,
            quiz_bank: Arc::new(quiz_bank),
            last_served: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}
