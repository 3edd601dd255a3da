//! Knowledge Confidence Gate
//!
//! Scores how familiar a task is before running it autonomously: each task
//! is decomposed into atomic UI steps, and every step is looked up in
//! similarity memory. Also hosts the two memory paths the loop uses at run
//! time: recall of a remembered action, and explicit teaching. Memory can
//! also be seeded in bulk from a JSON file of UI scenarios.

use super::action::{parse_strict, Action};
use super::extract::{extract_json, string_list};
use super::perception::PerceptualState;
use crate::memory::{MemoryError, VectorMemory};
use crate::providers::{Embedder, LanguageModel, ProviderError};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Leading enumeration markers: digits, dashes, dots, whitespace
static ENUMERATION: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[\d\-.\s]+").expect("enumeration pattern"));

#[derive(Error, Debug)]
pub enum KnowledgeError {
    #[error("embedding failed: {0}")]
    Embedding(#[from] ProviderError),

    #[error("memory write failed: {0}")]
    Memory(#[from] MemoryError),
}

#[derive(Debug, Clone)]
pub struct KnowledgeConfig {
    pub known_threshold: f32,
    pub recall_threshold: f32,
    pub max_tokens: u32,
    pub temperature: f32,
    /// OCR blocks used to describe a screen for memory
    pub describe_blocks: usize,
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            known_threshold: 0.85,
            recall_threshold: 0.9,
            max_tokens: 512,
            temperature: 0.1,
            describe_blocks: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepConfidence {
    pub step_text: String,
    /// Best memory similarity in [0, 1]; 0 when nothing matched
    pub similarity_score: f32,
    pub is_known: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskAnalysis {
    pub task: String,
    pub steps: Vec<StepConfidence>,
    pub task_known: bool,
}

impl TaskAnalysis {
    pub fn confidence(&self) -> u8 {
        confidence_percent(self.steps.iter().filter(|s| s.is_known).count(), self.steps.len())
    }
}

/// Analysis of every task in a block of text
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KnowledgeReport {
    pub tasks: Vec<TaskAnalysis>,
    /// Known steps over all steps, as a percentage
    pub confidence: u8,
}

impl KnowledgeReport {
    pub fn all_known(&self) -> bool {
        self.tasks.iter().all(|t| t.task_known)
    }
}

/// An action replayed from memory
#[derive(Debug, Clone, PartialEq)]
pub struct Recalled {
    pub score: f32,
    pub action: Action,
}

/// One screen context and the actions known to work on it
#[derive(Debug, Clone, Deserialize)]
pub struct SeedScenario {
    pub description: String,
    #[serde(default)]
    pub prerequisites: Vec<String>,
    #[serde(default)]
    pub actions: Vec<SeedEntry>,
}

impl SeedScenario {
    /// Screen description stored and embedded for every entry
    pub fn context(&self) -> String {
        if self.prerequisites.is_empty() {
            self.description.trim().to_string()
        } else {
            format!("{}\nPrerequisites: {}", self.description.trim(), self.prerequisites.join(", "))
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedEntry {
    pub goal: String,
    /// Validated with the action schema before it is stored
    pub action: Value,
    #[serde(default)]
    pub fact: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SeedReport {
    pub seeded: usize,
    /// Entries whose action failed validation
    pub invalid: usize,
    /// Entries that could not be embedded or written
    pub failed: usize,
}

/// Scenario list from a seed file
pub fn parse_seed_file(text: &str) -> Result<Vec<SeedScenario>, serde_json::Error> {
    serde_json::from_str(text)
}

/// Integer percentage; 100 when there is nothing to know
pub fn confidence_percent(known: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((known as f64 / total as f64) * 100.0).round() as u8
}

/// One candidate task per non-blank line, enumeration markers removed
pub fn split_tasks(raw_text: &str) -> Vec<String> {
    raw_text
        .lines()
        .map(|line| ENUMERATION.replace(line, "").trim().to_string())
        .filter(|line| !line.is_empty())
        .collect()
}

/// Text embedded for a (goal, screen) memory entry
pub fn memory_key(goal: &str, description: &str) -> String {
    format!("Goal: {}. Screen: {}.", goal.trim(), description.trim())
}

pub struct KnowledgeGate {
    model: Arc<dyn LanguageModel>,
    embedder: Arc<dyn Embedder>,
    memory: Arc<dyn VectorMemory>,
    config: KnowledgeConfig,
}

impl KnowledgeGate {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        embedder: Arc<dyn Embedder>,
        memory: Arc<dyn VectorMemory>,
        config: KnowledgeConfig,
    ) -> Self {
        Self {
            model,
            embedder,
            memory,
            config,
        }
    }

    /// Analyze every task line in `raw_text`. Never fails.
    pub async fn analyze_text(&self, raw_text: &str) -> KnowledgeReport {
        let mut tasks = Vec::new();
        for task in split_tasks(raw_text) {
            tasks.push(self.analyze_task(&task).await);
        }
        let total: usize = tasks.iter().map(|t| t.steps.len()).sum();
        let known: usize = tasks
            .iter()
            .map(|t| t.steps.iter().filter(|s| s.is_known).count())
            .sum();
        KnowledgeReport {
            confidence: confidence_percent(known, total),
            tasks,
        }
    }

    pub async fn analyze_task(&self, task: &str) -> TaskAnalysis {
        let steps_text = self.decompose(task).await;
        let mut steps = Vec::with_capacity(steps_text.len());
        for step_text in steps_text {
            let similarity_score = self.score_step(&step_text).await;
            steps.push(StepConfidence {
                is_known: similarity_score > self.config.known_threshold,
                step_text,
                similarity_score,
            });
        }
        let task_known = steps.iter().all(|s| s.is_known);
        debug!(task, steps = steps.len(), task_known, "task analyzed");
        TaskAnalysis {
            task: task.to_string(),
            steps,
            task_known,
        }
    }

    /// Atomic UI steps for a task; the task itself when the model is no help
    pub async fn decompose(&self, task: &str) -> Vec<String> {
        let prompt = format!(
            "Break this computer task into short atomic UI actions (e.g. \"Click Start\", \"Type notepad\").\n\
             Task: {}\n\
             Return only a JSON array of strings.",
            task
        );
        let raw = match self
            .model
            .generate(&prompt, &[], self.config.max_tokens, self.config.temperature)
            .await
        {
            Ok(raw) => raw,
            Err(e) => {
                warn!(task, error = %e, "decomposition unavailable, using whole task");
                return vec![task.to_string()];
            }
        };

        let steps = extract_json(&raw)
            .map(|value| string_list(&value, &["steps", "actions"]))
            .unwrap_or_default();
        if steps.is_empty() {
            warn!(task, "no steps in decomposition, using whole task");
            return vec![task.to_string()];
        }
        steps
    }

    /// Top-1 similarity for one step, clamped to [0, 1]
    async fn score_step(&self, step: &str) -> f32 {
        let vector = match self.embedder.embed(step).await {
            Ok(v) => v,
            Err(e) => {
                warn!(step, error = %e, "embedding failed, step unknown");
                return 0.0;
            }
        };
        match self.memory.search(&vector, 1).await {
            Ok(hits) => hits.first().map(|h| h.score.clamp(0.0, 1.0)).unwrap_or(0.0),
            Err(e) => {
                warn!(step, error = %e, "memory search failed, step unknown");
                0.0
            }
        }
    }

    /// A remembered action for this goal on a screen like this one
    pub async fn recall(&self, goal: &str, state: &PerceptualState) -> Option<Recalled> {
        let key = memory_key(goal, &state.describe(self.config.describe_blocks));
        let vector = self.embedder.embed(&key).await.ok()?;
        let hit = match self.memory.search(&vector, 1).await {
            Ok(hits) => hits.into_iter().next()?,
            Err(e) => {
                warn!(error = %e, "recall search failed");
                return None;
            }
        };
        if hit.score <= self.config.recall_threshold {
            debug!(score = hit.score, "no confident memory");
            return None;
        }
        match remembered_action(&hit.payload) {
            Some(action) => {
                info!(score = hit.score, action = %action, "recalled action");
                Some(Recalled {
                    score: hit.score,
                    action,
                })
            }
            None => {
                warn!(score = hit.score, "remembered action failed validation");
                None
            }
        }
    }

    /// Teach one (goal, screen) -> action mapping
    pub async fn record_learned(
        &self,
        goal: &str,
        action: &Action,
        state_description: &str,
    ) -> Result<(), KnowledgeError> {
        let payload = memory_payload(goal, action, state_description, "user", None);
        self.remember(goal, state_description, payload).await?;
        info!(goal, action = %action, "learned");
        Ok(())
    }

    /// Store every valid entry of every scenario. Bad entries are counted and skipped.
    pub async fn seed(&self, scenarios: &[SeedScenario]) -> SeedReport {
        let mut report = SeedReport::default();
        for scenario in scenarios {
            let context = scenario.context();
            for entry in &scenario.actions {
                let Some(action) = remembered_action(&json!({ "action": entry.action })) else {
                    warn!(goal = %entry.goal, "seed action failed validation");
                    report.invalid += 1;
                    continue;
                };
                let mut payload = memory_payload(&entry.goal, &action, &context, "seed", entry.fact.as_deref());
                payload["prerequisites"] = json!(scenario.prerequisites);

                match self.remember(&entry.goal, &context, payload).await {
                    Ok(()) => report.seeded += 1,
                    Err(e) => {
                        warn!(goal = %entry.goal, error = %e, "seed entry not stored");
                        report.failed += 1;
                    }
                }
            }
        }
        info!(seeded = report.seeded, invalid = report.invalid, failed = report.failed, "memory seeded");
        report
    }

    async fn remember(&self, goal: &str, description: &str, payload: Value) -> Result<(), KnowledgeError> {
        let vector = self.embedder.embed(&memory_key(goal, description)).await?;
        self.memory.upsert(vector, payload).await?;
        Ok(())
    }
}

fn memory_payload(goal: &str, action: &Action, description: &str, source: &str, fact: Option<&str>) -> Value {
    let mut action_payload = action.to_wire();
    if let (Action::Click { target }, Value::Object(map)) = (action, &mut action_payload) {
        map.insert("target_text".into(), Value::String(target.clone()));
    }
    let fact = fact
        .map(str::to_string)
        .unwrap_or_else(|| format!("To {}, {}", goal.trim(), action.summary()));
    json!({
        "goal": goal.trim(),
        "action": action_payload,
        "fact": fact,
        "description": description,
        "source": source,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })
}

/// Stored actions pass the same strict boundary as model output
fn remembered_action(payload: &Value) -> Option<Action> {
    let mut raw = payload.get("action")?.clone();
    if let Value::Object(map) = &mut raw {
        if !map.contains_key("target") {
            if let Some(t) = map.get("target_text").cloned() {
                map.insert("target".into(), t);
            }
        }
    }
    parse_strict(&raw).ok()
}
