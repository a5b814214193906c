//! Detection and resolution of the challenges an edge service interposes
//! before the actual content.
//!
//! [`ChallengeDetector`] classifies responses, [`ChallengeSolver`] computes
//! answers for the kinds that can be answered without a browser, and
//! [`ChallengeOrchestrator`] drives both with bounded retries.

mod detector;
mod evaluator;
pub mod extract;
pub mod interpreter;
mod orchestrator;
mod patterns;
mod solver;
mod types;

pub use detector::ChallengeDetector;
pub use evaluator::{Bindings, EvaluatorError, JsEvaluator, RestrictedEvaluator};
pub use orchestrator::{ChallengeOrchestrator, OrchestratorConfig, Resolution};
pub use patterns::{DETECTION_THRESHOLD, UNKNOWN_CONFIDENCE};
pub use solver::{ANSWER_FIELD, ChallengeSolver, Solution, SolverConfig, SolverError, prepare_script};
pub use types::{ChallengeInfo, ChallengeResult, ChallengeType, UnsupportedReason};
