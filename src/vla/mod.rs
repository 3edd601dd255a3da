//! VLA (Vision-Language-Action) Module
//!
//! Closed-loop screen control: perceive → decide → ground → act → repeat
//!
//! - [`perception`] / [`heuristics`]: what is on screen and what it suggests
//! - [`action`]: the closed action vocabulary and its strict parser
//! - [`decision`]: model prompting, one repair retry, and grounding
//! - [`knowledge`]: task confidence and remembered actions
//! - [`loop_controller`]: passive idle analysis and the active cycle

pub mod action;
pub mod decision;
pub mod extract;
pub mod heuristics;
pub mod knowledge;
pub mod loop_controller;
pub mod perception;

pub use action::{parse_strict, parse_strict_str, Action, ActionKind, SchemaViolation};
pub use decision::{ground, DecisionEngine, DecisionError, DecisionResult, GroundedAction, GroundedDecision};
pub use knowledge::{KnowledgeGate, KnowledgeReport, SeedReport, SeedScenario, TaskAnalysis};
pub use loop_controller::{LoopConfig, LoopController, LoopState, TickOutcome};
pub use perception::{BoundingBox, DerivedFlags, OcrBlock, PerceptualState};
