//! Control Loop Orchestrator
//!
//! Owns the see → decide → act loop:
//! - a passive idle timer that looks at the screen when the user is away
//!   and may ask them questions
//! - an explicitly started active cycle that decides and dispatches one
//!   action per iteration until stopped
//!
//! All shared state is owned here. Perceptual state and recent actions are
//! only ever replaced wholesale, so readers never see a half-updated value.

use super::action::Action;
use super::decision::{ground, DecisionEngine, GroundedAction, GroundedDecision};
use super::extract::{extract_json, string_list};
use super::heuristics::normalize_text;
use super::knowledge::{split_tasks, KnowledgeError, KnowledgeGate, KnowledgeReport};
use super::perception::PerceptualState;
use crate::input::{InputError, InputInjector, MouseButton};
use crate::logging::{ChatLog, ChatMessage, Speaker, StatusEntry, StatusLog};
use crate::providers::LanguageModel;
use crate::vision::{CaptureError, ScreenCapture, TextRecognizer};

use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

pub const DEFAULT_GOAL: &str = "Explore and analyze the current screen";

/// Answered questions remembered for filtering
const MAX_ANSWERED: usize = 256;

#[derive(Debug, Error)]
pub enum LoopError {
    #[error("no perceptual state loaded and no capture source configured")]
    NoState,

    #[error("{0} already in flight")]
    Busy(&'static str),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error("no knowledge gate configured")]
    NoKnowledge,

    #[error(transparent)]
    Knowledge(#[from] KnowledgeError),
}

#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub tick: Duration,
    /// Quiet time after user activity before passive analysis may run
    pub idle_threshold: Duration,
    /// Minimum time between passive analyses
    pub cooldown: Duration,
    pub cycle_delay: Duration,
    pub idle_analysis_enabled: bool,
    pub live_capture: bool,
    pub history_cap: usize,
    /// Upper bound on a single WAIT
    pub max_wait: Duration,
    pub passive_max_tokens: u32,
    pub temperature: f32,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(5),
            idle_threshold: Duration::from_secs(10),
            cooldown: Duration::from_secs(30),
            cycle_delay: Duration::from_secs(3),
            idle_analysis_enabled: true,
            live_capture: false,
            history_cap: 5,
            max_wait: Duration::from_secs(10),
            passive_max_tokens: 256,
            temperature: 0.1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LoopState {
    Idle,
    PassiveAnalyzing,
    AwaitingUserResponse,
    ActiveCycle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    ActiveCycle,
    PassiveInFlight,
    CaptureInFlight,
    AwaitingUser,
    UserActive,
    Cooldown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Skipped(SkipReason),
    /// Analysis ran; the questions that survived filtering were surfaced
    Analyzed { questions: Vec<String> },
    /// The user became active while the model was thinking; result dropped
    Stale,
    Failed(String),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Holds an in-flight flag for its lifetime
struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Default)]
struct BusyFlags {
    capturing: AtomicBool,
    ocr: AtomicBool,
    passive: AtomicBool,
}

pub struct LoopController {
    config: LoopConfig,
    engine: DecisionEngine,
    model: Arc<dyn LanguageModel>,
    input: Arc<dyn InputInjector>,
    capture: Option<(Arc<dyn ScreenCapture>, Arc<dyn TextRecognizer>)>,
    knowledge: Option<Arc<KnowledgeGate>>,

    state: Mutex<LoopState>,
    busy: BusyFlags,
    active: AtomicBool,
    cycle_running: AtomicBool,
    last_interaction_at: Mutex<Instant>,
    last_passive_at: Mutex<Option<Instant>>,

    perceptual: RwLock<Option<Arc<PerceptualState>>>,
    recent: RwLock<Arc<Vec<Action>>>,
    task_text: RwLock<String>,
    /// Oldest first, capped at MAX_ANSWERED
    answered: Mutex<VecDeque<String>>,
    outstanding: Mutex<Option<String>>,

    status: StatusLog,
    chat: ChatLog,
    dispatches: AtomicUsize,
    passive_runs: AtomicUsize,
}

impl LoopController {
    pub fn new(
        config: LoopConfig,
        engine: DecisionEngine,
        model: Arc<dyn LanguageModel>,
        input: Arc<dyn InputInjector>,
    ) -> Self {
        Self {
            config,
            engine,
            model,
            input,
            capture: None,
            knowledge: None,
            state: Mutex::new(LoopState::Idle),
            busy: BusyFlags::default(),
            active: AtomicBool::new(false),
            cycle_running: AtomicBool::new(false),
            last_interaction_at: Mutex::new(Instant::now()),
            last_passive_at: Mutex::new(None),
            perceptual: RwLock::new(None),
            recent: RwLock::new(Arc::new(Vec::new())),
            task_text: RwLock::new(String::new()),
            answered: Mutex::new(VecDeque::new()),
            outstanding: Mutex::new(None),
            status: StatusLog::default(),
            chat: ChatLog::default(),
            dispatches: AtomicUsize::new(0),
            passive_runs: AtomicUsize::new(0),
        }
    }

    pub fn with_capture(mut self, capture: Arc<dyn ScreenCapture>, ocr: Arc<dyn TextRecognizer>) -> Self {
        self.capture = Some((capture, ocr));
        self
    }

    pub fn with_knowledge(mut self, gate: Arc<KnowledgeGate>) -> Self {
        self.knowledge = Some(gate);
        self
    }

    // ========== Exposed state ==========

    pub fn loop_state(&self) -> LoopState {
        *lock(&self.state)
    }

    pub fn status_lines(&self) -> Vec<StatusEntry> {
        self.status.snapshot()
    }

    /// Status lines pushed after the first `seen`, and the count to pass next time
    pub fn status_since(&self, seen: usize) -> (Vec<StatusEntry>, usize) {
        self.status.since(seen)
    }

    pub fn chat_messages(&self) -> Vec<ChatMessage> {
        self.chat.snapshot()
    }

    /// Chat messages pushed after the first `seen`, and the count to pass next time
    pub fn chat_since(&self, seen: usize) -> (Vec<ChatMessage>, usize) {
        self.chat.since(seen)
    }

    pub fn current_state(&self) -> Option<Arc<PerceptualState>> {
        self.perceptual
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Most recent first
    pub fn recent_actions(&self) -> Arc<Vec<Action>> {
        self.recent.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn is_cycle_running(&self) -> bool {
        self.cycle_running.load(Ordering::SeqCst)
    }

    pub fn dispatch_count(&self) -> usize {
        self.dispatches.load(Ordering::SeqCst)
    }

    pub fn passive_run_count(&self) -> usize {
        self.passive_runs.load(Ordering::SeqCst)
    }

    // ========== External inputs ==========

    /// Replace the cached screen
    pub fn load_state(&self, state: PerceptualState) {
        self.store_state(Arc::new(state));
    }

    fn store_state(&self, state: Arc<PerceptualState>) {
        *self.perceptual.write().unwrap_or_else(PoisonError::into_inner) = Some(state);
    }

    pub fn set_task(&self, text: &str) {
        *self.task_text.write().unwrap_or_else(PoisonError::into_inner) = text.to_string();
    }

    /// First task line, or the default exploration goal
    pub fn goal(&self) -> String {
        let text = self.task_text.read().unwrap_or_else(PoisonError::into_inner);
        split_tasks(&text)
            .into_iter()
            .next()
            .unwrap_or_else(|| DEFAULT_GOAL.to_string())
    }

    /// Any user action re-arms the idle suppression window
    pub fn note_user_activity(&self) {
        *lock(&self.last_interaction_at) = Instant::now();
    }

    /// A user reply answers the outstanding question and ends the wait
    pub fn send_reply(&self, text: &str) {
        let text = text.trim();
        if !text.is_empty() {
            self.chat.push(Speaker::User, text);
        }
        let resolved = lock(&self.outstanding).take();
        if let Some(question) = resolved {
            let key = normalize_text(&question);
            let mut answered = lock(&self.answered);
            if !answered.contains(&key) {
                answered.push_back(key);
                if answered.len() > MAX_ANSWERED {
                    answered.pop_front();
                }
            }
        }
        self.note_user_activity();
        self.transition(LoopState::AwaitingUserResponse, LoopState::Idle);
    }

    // ========== State machine ==========

    fn set_state(&self, next: LoopState) {
        let mut state = lock(&self.state);
        if *state != next {
            debug!(from = ?*state, to = ?next, "loop state");
            *state = next;
        }
    }

    /// Move to `to` only if still in `from`
    fn transition(&self, from: LoopState, to: LoopState) -> bool {
        let mut state = lock(&self.state);
        if *state == from {
            debug!(from = ?from, to = ?to, "loop state");
            *state = to;
            true
        } else {
            false
        }
    }

    fn since_interaction(&self) -> Duration {
        lock(&self.last_interaction_at).elapsed()
    }

    // ========== Passive idle analysis ==========

    /// Start the periodic idle timer. Each tick runs on its own task so a
    /// slow analysis never delays the next tick; overlapping ticks are skipped.
    pub fn spawn_idle_timer(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(this.config.tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let ticker = Arc::clone(&this);
                tokio::spawn(async move {
                    let outcome = ticker.tick().await;
                    debug!(?outcome, "idle tick");
                });
            }
        })
    }

    /// One idle-timer tick
    pub async fn tick(&self) -> TickOutcome {
        if !self.config.idle_analysis_enabled {
            return TickOutcome::Skipped(SkipReason::Disabled);
        }
        if self.is_active() || self.is_cycle_running() {
            return TickOutcome::Skipped(SkipReason::ActiveCycle);
        }
        let Some(_passive) = BusyGuard::acquire(&self.busy.passive) else {
            return TickOutcome::Skipped(SkipReason::PassiveInFlight);
        };
        if self.busy.capturing.load(Ordering::Acquire) || self.busy.ocr.load(Ordering::Acquire) {
            return TickOutcome::Skipped(SkipReason::CaptureInFlight);
        }
        if self.loop_state() == LoopState::AwaitingUserResponse {
            return TickOutcome::Skipped(SkipReason::AwaitingUser);
        }
        if self.since_interaction() < self.config.idle_threshold {
            return TickOutcome::Skipped(SkipReason::UserActive);
        }
        {
            let mut last = lock(&self.last_passive_at);
            if last.is_some_and(|at| at.elapsed() < self.config.cooldown) {
                return TickOutcome::Skipped(SkipReason::Cooldown);
            }
            // Recorded before the model call so overlapping ticks cannot double-trigger
            *last = Some(Instant::now());
        }

        self.set_state(LoopState::PassiveAnalyzing);
        self.passive_runs.fetch_add(1, Ordering::SeqCst);
        let outcome = self.passive_analysis().await;
        if !matches!(outcome, TickOutcome::Analyzed { ref questions } if !questions.is_empty()) {
            self.transition(LoopState::PassiveAnalyzing, LoopState::Idle);
        }
        outcome
    }

    async fn passive_analysis(&self) -> TickOutcome {
        let state = match self.acquire_state(self.config.live_capture).await {
            Ok(state) => state,
            Err(e) => {
                self.status.warn(format!("Idle analysis skipped: {}", e));
                return TickOutcome::Failed(e.to_string());
            }
        };

        let prompt = passive_prompt(&state);
        let result = self
            .model
            .generate(&prompt, &[], self.config.passive_max_tokens, self.config.temperature)
            .await;

        // The user may have come back while the model was thinking
        if self.since_interaction() < self.config.idle_threshold || self.is_active() {
            info!("discarding stale idle analysis");
            return TickOutcome::Stale;
        }

        let raw = match result {
            Ok(raw) => raw,
            Err(e) => {
                self.status.warn(format!("Idle analysis failed: {}", e));
                return TickOutcome::Failed(e.to_string());
            }
        };

        let questions = self.filter_questions(parse_questions(&raw));
        if let Some(last) = questions.last() {
            *lock(&self.outstanding) = Some(last.clone());
            for question in &questions {
                self.chat.push(Speaker::Robot, question.clone());
            }
            self.transition(LoopState::PassiveAnalyzing, LoopState::AwaitingUserResponse);
            self.status.info(format!("Asked {} question(s)", questions.len()));
        } else {
            self.status.info("Idle analysis: nothing needs attention");
        }
        TickOutcome::Analyzed { questions }
    }

    /// Drop empty, already answered, and repeated questions
    fn filter_questions(&self, raw: Vec<String>) -> Vec<String> {
        let answered = lock(&self.answered);
        let outstanding = lock(&self.outstanding).as_deref().map(normalize_text);
        let mut seen = HashSet::new();

        raw.into_iter()
            .map(|q| q.trim().to_string())
            .filter(|q| !q.is_empty())
            .filter(|q| {
                let key = normalize_text(q);
                !answered.contains(&key) && outstanding.as_ref() != Some(&key) && seen.insert(key)
            })
            .collect()
    }

    // ========== Active cycle ==========

    /// Start the autonomous cycle. Returns false if it was already active.
    pub fn start_active(self: &Arc<Self>) -> bool {
        if self.active.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.set_state(LoopState::ActiveCycle);
        self.status.info(format!("Active mode started: {}", self.goal()));
        self.spawn_cycle();
        true
    }

    /// Cooperative stop; an in-flight decision or action still completes
    pub fn stop_active(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            self.status.info("Active mode stopping");
        }
        self.transition(LoopState::ActiveCycle, LoopState::Idle);
    }

    fn spawn_cycle(self: &Arc<Self>) {
        // A loop that is still winding down picks the restart up itself
        if self
            .cycle_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run_cycles().await });
    }

    async fn run_cycles(self: Arc<Self>) {
        loop {
            while self.is_active() {
                self.cycle_once().await;
                tokio::time::sleep(self.config.cycle_delay).await;
            }
            self.cycle_running.store(false, Ordering::SeqCst);

            // Restarted between the last check and the release above
            let restarted = self.is_active()
                && self
                    .cycle_running
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok();
            if !restarted {
                break;
            }
        }
        debug!("active loop exited");
    }

    /// One observe-decide-act iteration
    pub async fn cycle_once(&self) {
        let state = match self.acquire_state(self.config.live_capture).await {
            Ok(state) => state,
            Err(e) => {
                self.status.warn(format!("No screen to act on: {}", e));
                return;
            }
        };
        let goal = self.goal();
        let recent = self.recent_actions();

        let (chosen, decision) = self.decide(&goal, &state, &recent).await;
        if let Some(action) = chosen {
            self.push_recent(action);
        }

        if decision.stop_requested {
            self.status.warn(format!("Stopping: {}", decision.reasoning));
            self.chat.push(Speaker::Robot, format!("Stopped: {}", decision.reasoning));
            self.stop_active();
            return;
        }

        match (&decision.action, decision.is_confident) {
            (Some(action), true) => {
                self.status.info(decision.reasoning.clone());
                if let Err(e) = self.dispatch(action).await {
                    self.status.error(format!("Dispatch failed: {}", e));
                }
            }
            (None, true) => self.status.info(format!("No action needed: {}", decision.reasoning)),
            (_, false) => self.status.warn(format!("Not confident: {}", decision.reasoning)),
        }
    }

    /// Memory first, then the model
    async fn decide(
        &self,
        goal: &str,
        state: &PerceptualState,
        recent: &[Action],
    ) -> (Option<Action>, GroundedDecision) {
        if let Some(gate) = &self.knowledge {
            if let Some(recalled) = gate.recall(goal, state).await {
                let why = format!("Remembered ({:.2}): {}", recalled.score, recalled.action.summary());
                let decision = ground(&recalled.action, state, Some(&why));
                return (Some(recalled.action), decision);
            }
        }

        match self.engine.decide_next(goal, state, recent).await {
            Ok(result) => {
                if result.was_retried {
                    self.status.warn("Model output was invalid once and repaired");
                }
                let decision = ground(&result.action, state, result.rationale.as_deref());
                (Some(result.action), decision)
            }
            Err(e) => {
                self.status.error(format!("Decision failed: {}", e));
                self.chat.push(Speaker::Robot, format!("I could not decide what to do: {}", e));
                (None, GroundedDecision::unconfident(e.to_string()))
            }
        }
    }

    async fn dispatch(&self, action: &GroundedAction) -> Result<(), InputError> {
        match action {
            GroundedAction::Click { x, y, .. } => {
                self.input.move_cursor(*x, *y)?;
                self.input.click(MouseButton::Left)?;
            }
            GroundedAction::Type { text } => {
                self.input.type_text(&format!("{}\n", text))?;
            }
            GroundedAction::Wait { duration_ms } => {
                let asked = Duration::from_millis(*duration_ms);
                if asked > self.config.max_wait {
                    self.status.warn(format!(
                        "Wait of {}ms clamped to {}ms",
                        duration_ms,
                        self.config.max_wait.as_millis()
                    ));
                }
                tokio::time::sleep(asked.min(self.config.max_wait)).await;
            }
        }
        self.dispatches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn push_recent(&self, action: Action) {
        let mut slot = self.recent.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = Vec::with_capacity(self.config.history_cap);
        next.push(action);
        next.extend(slot.iter().take(self.config.history_cap.saturating_sub(1)).cloned());
        *slot = Arc::new(next);
    }

    // ========== Perception ==========

    /// Cached state unless `fresh`, capturing when nothing is cached
    async fn acquire_state(&self, fresh: bool) -> Result<Arc<PerceptualState>, LoopError> {
        if !fresh {
            if let Some(state) = self.current_state() {
                return Ok(state);
            }
        }
        let Some((capture, ocr)) = &self.capture else {
            return self.current_state().ok_or(LoopError::NoState);
        };

        let image = {
            let _capturing = BusyGuard::acquire(&self.busy.capturing).ok_or(LoopError::Busy("capture"))?;
            capture.capture().await?
        };
        let page = {
            let _ocr = BusyGuard::acquire(&self.busy.ocr).ok_or(LoopError::Busy("OCR"))?;
            ocr.recognize(&image).await?
        };

        let state = Arc::new(page.into_state()?);
        debug!(blocks = state.blocks().len(), "screen captured");
        self.store_state(Arc::clone(&state));
        Ok(state)
    }

    // ========== Knowledge ==========

    pub async fn analyze_task_text(&self, text: &str) -> Result<KnowledgeReport, LoopError> {
        let gate = self.knowledge.as_ref().ok_or(LoopError::NoKnowledge)?;
        let report = gate.analyze_text(text).await;
        self.status.info(format!("Task confidence: {}%", report.confidence));
        Ok(report)
    }

    /// Teach the current goal's action on the current screen
    pub async fn record_learned(&self, action: &Action) -> Result<(), LoopError> {
        let gate = self.knowledge.as_ref().ok_or(LoopError::NoKnowledge)?;
        let state = self.current_state().ok_or(LoopError::NoState)?;
        let goal = self.goal();
        gate.record_learned(&goal, action, &state.describe(10)).await?;
        self.status.info(format!("Learned: {} -> {}", goal, action.summary()));
        Ok(())
    }
}

fn passive_prompt(state: &PerceptualState) -> String {
    format!(
        r#"You are quietly watching a computer screen while the user is away.
{}.
What, if anything, seems to need the user's attention or input?
Reply with a JSON array of short questions for the user, or [] if nothing needs attention."#,
        state.describe(30)
    )
}

/// Questions from a JSON array/object, else lines ending in '?'
fn parse_questions(raw: &str) -> Vec<String> {
    if let Some(value) = extract_json(raw) {
        return string_list(&value, &["questions"]);
    }
    raw.lines()
        .map(|l| l.trim().trim_start_matches(['-', '*', ' ']).trim())
        .filter(|l| l.ends_with('?'))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::{Disconnected, DryRunInjector, InjectedInput};
    use crate::providers::ProviderError;
    use crate::vision::OcrPage;
    use crate::vla::perception::{BoundingBox, OcrBlock};
    use async_trait::async_trait;
    use std::collections::VecDeque;

    /// Scripted model; repeats its last answer once the script runs out
    struct FakeModel {
        script: Mutex<VecDeque<String>>,
        last: Mutex<String>,
        delay: Duration,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl FakeModel {
        fn new(script: &[&str], delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.iter().map(|s| s.to_string()).collect()),
                last: Mutex::new(r#"{"type": "NOOP"}"#.into()),
                delay,
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LanguageModel for FakeModel {
        fn name(&self) -> &str {
            "fake"
        }

        async fn generate(&self, _: &str, _: &[String], _: u32, _: f32) -> Result<String, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let next = lock(&self.script).pop_front();
            let mut last = lock(&self.last);
            if let Some(next) = next {
                *last = next;
            }
            Ok(last.clone())
        }
    }

    fn desktop() -> PerceptualState {
        PerceptualState::new(
            vec![
                OcrBlock::new("Recycle Bin", BoundingBox::new(20.0, 20.0, 120.0, 40.0)),
                OcrBlock::new("Start", BoundingBox::new(50.0, 1000.0, 100.0, 1050.0)),
            ],
            1920,
            1080,
        )
        .unwrap()
    }

    /// Serves `desktop()` after an optional capture delay, counting captures
    struct CountingScreen {
        delay: Duration,
        captures: AtomicUsize,
    }

    impl CountingScreen {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                captures: AtomicUsize::new(0),
            })
        }

        fn captures(&self) -> usize {
            self.captures.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ScreenCapture for CountingScreen {
        async fn capture(&self) -> Result<Vec<u8>, CaptureError> {
            tokio::time::sleep(self.delay).await;
            self.captures.fetch_add(1, Ordering::SeqCst);
            Ok(b"png".to_vec())
        }
    }

    #[async_trait]
    impl TextRecognizer for CountingScreen {
        async fn recognize(&self, _image: &[u8]) -> Result<OcrPage, CaptureError> {
            let state = desktop();
            Ok(OcrPage {
                width: state.image_width(),
                height: state.image_height(),
                blocks: state.blocks().to_vec(),
            })
        }
    }

    fn controller(model: Arc<FakeModel>, input: Arc<DryRunInjector>, config: LoopConfig) -> Arc<LoopController> {
        let engine = DecisionEngine::new(model.clone());
        let ctl = LoopController::new(config, engine, model, input);
        ctl.load_state(desktop());
        Arc::new(ctl)
    }

    fn screened(model: Arc<FakeModel>, config: LoopConfig, screen: Arc<CountingScreen>) -> Arc<LoopController> {
        let engine = DecisionEngine::new(model.clone());
        let ctl = LoopController::new(config, engine, model, Arc::new(DryRunInjector::new()))
            .with_capture(screen.clone(), screen);
        ctl.load_state(desktop());
        Arc::new(ctl)
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_allows_one_analysis() {
        let model = FakeModel::new(&["[]"], Duration::ZERO);
        let ctl = controller(model.clone(), Arc::new(DryRunInjector::new()), LoopConfig::default());

        assert_eq!(ctl.tick().await, TickOutcome::Skipped(SkipReason::UserActive));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(ctl.tick().await, TickOutcome::Analyzed { questions: vec![] });
        assert_eq!(ctl.loop_state(), LoopState::Idle);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(ctl.tick().await, TickOutcome::Skipped(SkipReason::Cooldown));
        assert_eq!(model.calls(), 1);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(matches!(ctl.tick().await, TickOutcome::Analyzed { .. }));
        assert_eq!(model.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_and_active_skip() {
        let config = LoopConfig {
            idle_analysis_enabled: false,
            ..LoopConfig::default()
        };
        let ctl = controller(FakeModel::new(&[], Duration::ZERO), Arc::new(DryRunInjector::new()), config);
        assert_eq!(ctl.tick().await, TickOutcome::Skipped(SkipReason::Disabled));

        let ctl = controller(FakeModel::new(&[], Duration::ZERO), Arc::new(DryRunInjector::new()), LoopConfig::default());
        ctl.active.store(true, Ordering::SeqCst);
        assert_eq!(ctl.tick().await, TickOutcome::Skipped(SkipReason::ActiveCycle));
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_activity_mid_call_discards_result() {
        let model = FakeModel::new(&[r#"["Save your work?"]"#], Duration::from_secs(2));
        let ctl = controller(model.clone(), Arc::new(DryRunInjector::new()), LoopConfig::default());
        tokio::time::advance(Duration::from_secs(11)).await;

        let ticking = {
            let ctl = Arc::clone(&ctl);
            tokio::spawn(async move { ctl.tick().await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(ctl.loop_state(), LoopState::PassiveAnalyzing);
        assert_eq!(ctl.tick().await, TickOutcome::Skipped(SkipReason::PassiveInFlight));
        ctl.note_user_activity();

        assert_eq!(ticking.await.unwrap(), TickOutcome::Stale);
        assert!(ctl.chat_messages().is_empty());
        assert_eq!(ctl.loop_state(), LoopState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_questions_filtered_and_answered() {
        let model = FakeModel::new(
            &[
                r#"["Save changes?", " ", "save  changes?", "Close the dialog?"]"#,
                r#"["Close the dialog?", "Save changes?"]"#,
            ],
            Duration::ZERO,
        );
        let ctl = controller(model.clone(), Arc::new(DryRunInjector::new()), LoopConfig::default());
        tokio::time::advance(Duration::from_secs(11)).await;

        assert_eq!(
            ctl.tick().await,
            TickOutcome::Analyzed {
                questions: vec!["Save changes?".into(), "Close the dialog?".into()]
            }
        );
        assert_eq!(ctl.loop_state(), LoopState::AwaitingUserResponse);

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(ctl.tick().await, TickOutcome::Skipped(SkipReason::AwaitingUser));

        ctl.send_reply("yes, close it");
        assert_eq!(ctl.loop_state(), LoopState::Idle);
        assert_eq!(ctl.tick().await, TickOutcome::Skipped(SkipReason::UserActive));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(
            ctl.tick().await,
            TickOutcome::Analyzed {
                questions: vec!["Save changes?".into()]
            }
        );

        let speakers: Vec<Speaker> = ctl.chat_messages().iter().map(|m| m.speaker).collect();
        assert_eq!(
            speakers,
            vec![Speaker::Robot, Speaker::Robot, Speaker::User, Speaker::Robot]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_cycle_clicks_grounded_target() {
        let model = FakeModel::new(&[r#"{"type": "CLICK", "target": "Start"}"#], Duration::ZERO);
        let input = Arc::new(DryRunInjector::new());
        let ctl = controller(model, input.clone(), LoopConfig::default());
        ctl.set_task("1. Open Start Menu\n2. Launch Notepad");
        assert_eq!(ctl.goal(), "Open Start Menu");

        ctl.cycle_once().await;
        assert_eq!(
            input.sent(),
            vec![
                InjectedInput::Move { x: 75, y: 1025 },
                InjectedInput::Click(MouseButton::Left)
            ]
        );
        assert_eq!(ctl.recent_actions()[0], Action::Click { target: "Start".into() });
    }

    #[tokio::test(start_paused = true)]
    async fn test_type_gets_newline_and_history_is_capped() {
        let model = FakeModel::new(&[r#"{"type": "TYPE", "text": "hello"}"#], Duration::ZERO);
        let input = Arc::new(DryRunInjector::new());
        let config = LoopConfig {
            history_cap: 3,
            ..LoopConfig::default()
        };
        let ctl = controller(model, input.clone(), config);

        for _ in 0..5 {
            ctl.cycle_once().await;
        }
        assert_eq!(input.sent()[0], InjectedInput::Text("hello\n".into()));
        assert_eq!(ctl.recent_actions().len(), 3);
        assert_eq!(ctl.dispatch_count(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unfound_target_not_dispatched() {
        let model = FakeModel::new(&[r#"{"type": "CLICK", "target": "Settings"}"#], Duration::ZERO);
        let input = Arc::new(DryRunInjector::new());
        let ctl = controller(model, input.clone(), LoopConfig::default());

        ctl.cycle_once().await;
        assert!(input.sent().is_empty());
        assert!(ctl
            .status_lines()
            .iter()
            .any(|l| l.message.contains("cannot be found")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_stops_active_mode() {
        let model = FakeModel::new(&[r#"{"type": "ABORT", "reason": "wrong app"}"#], Duration::ZERO);
        let ctl = controller(model.clone(), Arc::new(DryRunInjector::new()), LoopConfig::default());

        assert!(ctl.start_active());
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!ctl.is_active());
        assert!(!ctl.is_cycle_running());
        assert_eq!(model.calls(), 1);
        assert_eq!(ctl.loop_state(), LoopState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_then_start_never_overlaps() {
        let model = FakeModel::new(&[r#"{"type": "CLICK", "target": "Start"}"#], Duration::from_millis(500));
        let input = Arc::new(DryRunInjector::new());
        let ctl = controller(model.clone(), input.clone(), LoopConfig::default());

        assert!(ctl.start_active());
        assert!(!ctl.start_active());
        tokio::time::sleep(Duration::from_secs(8)).await;

        ctl.stop_active();
        assert!(ctl.start_active());
        ctl.stop_active();
        assert!(ctl.start_active());
        tokio::time::sleep(Duration::from_secs(8)).await;
        assert_eq!(model.max_in_flight.load(Ordering::SeqCst), 1);

        ctl.stop_active();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!ctl.is_cycle_running());
        let settled = ctl.dispatch_count();
        assert!(settled > 0);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(ctl.dispatch_count(), settled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_capture_refreshes_each_idle_tick() {
        let model = FakeModel::new(&["[]"], Duration::ZERO);
        let screen = CountingScreen::new(Duration::ZERO);
        let config = LoopConfig {
            live_capture: true,
            ..LoopConfig::default()
        };
        let ctl = screened(model, config, screen.clone());

        for expected in 1..=3 {
            tokio::time::advance(Duration::from_secs(31)).await;
            assert!(matches!(ctl.tick().await, TickOutcome::Analyzed { .. }));
            assert_eq!(screen.captures(), expected);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_state_reused_without_live_capture() {
        let model = FakeModel::new(&["[]"], Duration::ZERO);
        let screen = CountingScreen::new(Duration::ZERO);
        let ctl = screened(model, LoopConfig::default(), screen.clone());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(matches!(ctl.tick().await, TickOutcome::Analyzed { .. }));
        assert_eq!(screen.captures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_skips_while_capturing() {
        let model = FakeModel::new(&[r#"{"type": "NOOP"}"#], Duration::ZERO);
        let screen = CountingScreen::new(Duration::from_secs(2));
        let config = LoopConfig {
            live_capture: true,
            ..LoopConfig::default()
        };
        let ctl = screened(model, config, screen);
        tokio::time::advance(Duration::from_secs(11)).await;

        let cycling = {
            let ctl = Arc::clone(&ctl);
            tokio::spawn(async move { ctl.cycle_once().await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(ctl.tick().await, TickOutcome::Skipped(SkipReason::CaptureInFlight));

        cycling.await.unwrap();
        assert_eq!(ctl.current_state().unwrap().blocks().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_failure_keeps_loop_running() {
        let model = FakeModel::new(&[r#"{"type": "CLICK", "target": "Start"}"#], Duration::ZERO);
        let ctl = Arc::new(LoopController::new(
            LoopConfig::default(),
            DecisionEngine::new(model.clone()),
            model.clone(),
            Arc::new(Disconnected),
        ));
        ctl.load_state(desktop());

        assert!(ctl.start_active());
        tokio::time::sleep(Duration::from_secs(10)).await;

        let failures = ctl
            .status_lines()
            .iter()
            .filter(|l| l.message.contains("Dispatch failed"))
            .count();
        assert!(failures >= 2);
        assert!(ctl.is_active());
        assert_eq!(ctl.loop_state(), LoopState::ActiveCycle);
        assert_eq!(ctl.dispatch_count(), 0);
        assert!(model.calls() >= 2);

        ctl.stop_active();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!ctl.is_cycle_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_wait_is_clamped() {
        let model = FakeModel::new(&[r#"{"type": "WAIT", "ms": 1000000000000}"#], Duration::ZERO);
        let config = LoopConfig {
            max_wait: Duration::from_secs(10),
            ..LoopConfig::default()
        };
        let ctl = controller(model, Arc::new(DryRunInjector::new()), config);

        let started = Instant::now();
        tokio::time::timeout(Duration::from_secs(11), ctl.cycle_once())
            .await
            .expect("wait should be clamped");
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert_eq!(ctl.dispatch_count(), 1);
        assert!(ctl
            .status_lines()
            .iter()
            .any(|l| l.message.contains("clamped to 10000ms")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_answered_questions_are_capped() {
        let model = FakeModel::new(&[], Duration::ZERO);
        let ctl = controller(model, Arc::new(DryRunInjector::new()), LoopConfig::default());

        for i in 0..MAX_ANSWERED + 10 {
            *lock(&ctl.outstanding) = Some(format!("Question {}?", i));
            ctl.send_reply("ok");
        }
        *lock(&ctl.outstanding) = Some(format!("Question {}?", MAX_ANSWERED + 9));
        ctl.send_reply("again");

        let answered = lock(&ctl.answered);
        assert_eq!(answered.len(), MAX_ANSWERED);
        assert!(!answered.contains(&normalize_text("Question 0?")));
        assert_eq!(answered.back(), Some(&normalize_text(&format!("Question {}?", MAX_ANSWERED + 9))));
        drop(answered);

        let (messages, seen) = ctl.chat_since(0);
        assert_eq!(messages.len(), MAX_ANSWERED + 11);
        assert!(ctl.chat_since(seen).0.is_empty());
    }

    #[tokio::test]
    async fn test_no_state_without_capture() {
        let model = FakeModel::new(&[], Duration::ZERO);
        let ctl = LoopController::new(
            LoopConfig::default(),
            DecisionEngine::new(model.clone()),
            model,
            Arc::new(DryRunInjector::new()),
        );
        assert!(matches!(ctl.acquire_state(false).await, Err(LoopError::NoState)));
        assert!(matches!(
            ctl.record_learned(&Action::Noop { reason: None }).await,
            Err(LoopError::NoKnowledge)
        ));
        assert_eq!(ctl.goal(), DEFAULT_GOAL);
    }

    #[test]
    fn test_parse_questions_fallback() {
        assert_eq!(
            parse_questions("- Is this expected?\nJust a note.\n* Retry the upload?"),
            vec!["Is this expected?", "Retry the upload?"]
        );
        assert_eq!(parse_questions(r#"{"questions": ["Why?"]}"#), vec!["Why?"]);
    }
}
