use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

use super::interpreter::{self, InterpreterError};

/// String variables a challenge script is seeded with
pub type Bindings = BTreeMap<String, String>;

/// Errors of a [`JsEvaluator`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EvaluatorError {
    /// The script could not be parsed
    #[error("Syntax error: {0}")]
    Syntax(String),

    /// The script failed while running
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// The script did not finish in time
    #[error("Evaluation timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// The evaluator is not available, e.g. its engine failed to start
    #[error("Evaluator unavailable: {0}")]
    Unavailable(String),
}

impl From<InterpreterError> for EvaluatorError {
    fn from(e: InterpreterError) -> Self {
        match e {
            InterpreterError::Syntax { .. }
            | InterpreterError::UnexpectedEnd
            | InterpreterError::TooDeep(_)
            | InterpreterError::TooLarge(_)
            | InterpreterError::Empty => Self::Syntax(e.to_string()),
            _ => Self::Runtime(e.to_string()),
        }
    }
}

/// Evaluates the numeric part of a JavaScript challenge.
///
/// Implementations may embed a real JS engine. They must be deterministic
/// for the same script and bindings, and must return within `timeout`.
#[async_trait]
pub trait JsEvaluator: Send + Sync + std::fmt::Debug {
    /// Evaluate `script` with `bindings` defined as string variables and
    /// return the numeric value of its last statement
    async fn eval(
        &self,
        script: &str,
        bindings: &Bindings,
        timeout: Duration,
    ) -> Result<f64, EvaluatorError>;
}

/// [`JsEvaluator`] backed by the restricted interpreter
#[derive(Debug, Default, Clone, Copy)]
pub struct RestrictedEvaluator;

#[async_trait]
impl JsEvaluator for RestrictedEvaluator {
    async fn eval(
        &self,
        script: &str,
        bindings: &Bindings,
        _timeout: Duration,
    ) -> Result<f64, EvaluatorError> {
        // no loops or calls, so evaluation is bounded by the script size
        Ok(interpreter::evaluate(script, bindings)?)
    }
}
