//! Guarded Decision Engine
//!
//! Turns (goal, screen, recent actions) into exactly one validated action.
//! The model gets one chance to repair invalid output; after that the
//! failure is surfaced, never coerced.

use super::action::{decode_str, describe_schema, parse_strict, rationale, Action, SchemaViolation};
use super::heuristics::{contains_words, normalize_text};
use super::perception::{OcrBlock, PerceptualState};
use crate::providers::{LanguageModel, ProviderError};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum DecisionError {
    /// Both the first answer and the repair attempt failed validation
    #[error("no valid action after retry: {reason}")]
    Failure { reason: String, raw: String },

    #[error(transparent)]
    Model(#[from] ProviderError),
}

#[derive(Debug, Clone)]
pub struct DecisionConfig {
    /// Largest-area OCR blocks included in the prompt
    pub max_blocks: usize,
    pub max_recent: usize,
    /// Characters of invalid output echoed back on retry
    pub raw_truncate: usize,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            max_blocks: 30,
            max_recent: 5,
            raw_truncate: 1200,
            max_tokens: 512,
            temperature: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecisionResult {
    pub action: Action,
    pub raw_model_output: String,
    pub was_retried: bool,
    /// Optional `why`/`reason` the model attached
    pub rationale: Option<String>,
}

/// An action resolved to screen coordinates
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum GroundedAction {
    Click { x: i32, y: i32, target: String },
    Type { text: String },
    Wait { duration_ms: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroundedDecision {
    pub is_confident: bool,
    pub reasoning: String,
    pub action: Option<GroundedAction>,
    /// Set when the validated action was ABORT
    pub stop_requested: bool,
}

impl GroundedDecision {
    fn confident(reasoning: impl Into<String>, action: Option<GroundedAction>) -> Self {
        Self {
            is_confident: true,
            reasoning: reasoning.into(),
            action,
            stop_requested: false,
        }
    }

    pub fn unconfident(reasoning: impl Into<String>) -> Self {
        Self {
            is_confident: false,
            reasoning: reasoning.into(),
            action: None,
            stop_requested: false,
        }
    }
}

pub struct DecisionEngine {
    model: Arc<dyn LanguageModel>,
    config: DecisionConfig,
}

impl DecisionEngine {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self::with_config(model, DecisionConfig::default())
    }

    pub fn with_config(model: Arc<dyn LanguageModel>, config: DecisionConfig) -> Self {
        Self { model, config }
    }

    pub fn config(&self) -> &DecisionConfig {
        &self.config
    }

    /// One validated action, retrying exactly once on a schema violation.
    ///
    /// Model transport errors are not retried.
    pub async fn decide_next(
        &self,
        goal: &str,
        state: &PerceptualState,
        recent_actions: &[Action],
    ) -> Result<DecisionResult, DecisionError> {
        let prompt = self.build_prompt(goal, state, recent_actions);
        let raw = self.ask(&prompt).await?;

        let violation = match parse_response(&raw) {
            Ok((action, rationale)) => {
                debug!(action = %action, "decision accepted");
                return Ok(DecisionResult {
                    action,
                    raw_model_output: raw,
                    was_retried: false,
                    rationale,
                });
            }
            Err(violation) => violation,
        };

        warn!(reason = %violation.reason, "invalid model output, retrying once");
        let retry_prompt = self.build_retry_prompt(&prompt, &raw, &violation);
        let retry_raw = self.ask(&retry_prompt).await?;

        match parse_response(&retry_raw) {
            Ok((action, rationale)) => {
                info!(action = %action, "decision accepted after retry");
                Ok(DecisionResult {
                    action,
                    raw_model_output: retry_raw,
                    was_retried: true,
                    rationale,
                })
            }
            Err(violation) => Err(DecisionError::Failure {
                reason: violation.reason,
                raw: truncate_chars(&retry_raw, self.config.raw_truncate),
            }),
        }
    }

    /// Decide and ground in one step. Every failure becomes an unconfident decision.
    pub async fn think(
        &self,
        goal: &str,
        state: &PerceptualState,
        recent_actions: &[Action],
    ) -> GroundedDecision {
        match self.decide_next(goal, state, recent_actions).await {
            Ok(result) => ground(&result.action, state, result.rationale.as_deref()),
            Err(DecisionError::Failure { reason, raw }) => {
                warn!(%reason, "decision failure");
                GroundedDecision::unconfident(format!("Decision failed: {} (output: {})", reason, raw))
            }
            Err(DecisionError::Model(e)) => {
                warn!(error = %e, "model call failed");
                GroundedDecision::unconfident(format!("Model unavailable: {}", e))
            }
        }
    }

    pub fn build_prompt(&self, goal: &str, state: &PerceptualState, recent_actions: &[Action]) -> String {
        let blocks = state.largest_blocks(self.config.max_blocks);
        let visible = if blocks.is_empty() {
            "(no text detected)".to_string()
        } else {
            blocks
                .iter()
                .map(|block| {
                    let b = &block.bounding_box;
                    format!(
                        "- \"{}\" at ({:.0},{:.0})-({:.0},{:.0})",
                        block.text.trim(),
                        b.left,
                        b.top,
                        b.right,
                        b.bottom
                    )
                })
                .collect::<Vec<_>>()
                .join("\n")
        };

        let recent = if recent_actions.is_empty() {
            "None".to_string()
        } else {
            recent_actions
                .iter()
                .take(self.config.max_recent)
                .enumerate()
                .map(|(i, action)| format!("{}. {}", i + 1, action.summary()))
                .collect::<Vec<_>>()
                .join("\n")
        };

        let derived = state.derived();
        format!(
            r#"You operate a computer screen. Choose exactly ONE next action.
GOAL: {}

VISIBLE TEXT ({}x{} screen, largest first):
{}

SIGNALS: modal_likely={} error_likely={} modal_keywords=[{}]

RECENT ACTIONS (most recent first):
{}

RULES:
- If uncertain, return NOOP.
- CLICK only when the exact target text appears in VISIBLE TEXT.
- Never invent UI text that is not listed above.
- If a modal or error is likely, prefer a safe dismissal target (OK, Close, Cancel, Retry).

{}
Respond with JSON only, no prose and no code fences."#,
            goal.trim(),
            state.image_width(),
            state.image_height(),
            visible,
            derived.has_modal_candidate,
            derived.has_error_candidate,
            derived.modal_keywords.iter().cloned().collect::<Vec<_>>().join(", "),
            recent,
            describe_schema()
        )
    }

    pub fn build_retry_prompt(&self, original: &str, raw: &str, violation: &SchemaViolation) -> String {
        format!(
            "{}\n\nYour previous output was invalid ({}).\nPrevious output:\n{}\n\nReturn ONLY one JSON object that follows the schema above.",
            original,
            violation.reason,
            truncate_chars(raw, self.config.raw_truncate)
        )
    }

    async fn ask(&self, prompt: &str) -> Result<String, ProviderError> {
        self.model
            .generate(prompt, &[], self.config.max_tokens, self.config.temperature)
            .await
    }
}

fn parse_response(raw: &str) -> Result<(Action, Option<String>), SchemaViolation> {
    let value = decode_str(raw)?;
    let action = parse_strict(&value)?;
    Ok((action, rationale(&value)))
}

/// Resolve a validated action against the screen it was decided on.
pub fn ground(action: &Action, state: &PerceptualState, why: Option<&str>) -> GroundedDecision {
    match action {
        Action::Click { target } => match locate_target(state, target) {
            Some(block) => {
                let (cx, cy) = block.bounding_box.center();
                let (x, y) = (cx.round() as i32, cy.round() as i32);
                let reasoning = why
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("Clicking \"{}\" at ({}, {})", block.text.trim(), x, y));
                GroundedDecision::confident(
                    reasoning,
                    Some(GroundedAction::Click {
                        x,
                        y,
                        target: target.clone(),
                    }),
                )
            }
            None => GroundedDecision::unconfident(format!(
                "Target \"{}\" cannot be found on screen",
                target
            )),
        },
        Action::Type { text } => GroundedDecision::confident(
            why.map(str::to_string).unwrap_or_else(|| format!("Typing \"{}\"", text)),
            Some(GroundedAction::Type { text: text.clone() }),
        ),
        Action::Wait { duration_ms } => GroundedDecision::confident(
            why.map(str::to_string)
                .unwrap_or_else(|| format!("Waiting {}ms", duration_ms)),
            Some(GroundedAction::Wait {
                duration_ms: *duration_ms,
            }),
        ),
        Action::Noop { reason } => GroundedDecision::confident(
            reason.clone().unwrap_or_else(|| "No action needed".into()),
            None,
        ),
        Action::Abort { reason } => GroundedDecision {
            stop_requested: true,
            ..GroundedDecision::confident(
                reason.clone().unwrap_or_else(|| "Aborted by model".into()),
                None,
            )
        },
    }
}

/// Exact normalized match first, else the largest block containing the target as whole words
fn locate_target<'a>(state: &'a PerceptualState, target: &str) -> Option<&'a OcrBlock> {
    let wanted = normalize_text(target);
    if wanted.is_empty() {
        return None;
    }
    let blocks = state.blocks();
    blocks
        .iter()
        .find(|b| b.normalized_text() == wanted)
        .or_else(|| {
            blocks
                .iter()
                .filter(|b| contains_words(&b.normalized_text(), &wanted))
                .max_by(|a, b| a.bounding_box.area().total_cmp(&b.bounding_box.area()))
        })
}

pub(crate) fn truncate_chars(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
