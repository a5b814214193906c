//! A deliberately small interpreter for challenge arithmetic.
//!
//! Supported: `var`/`let`/`const` declarations, assignment and compound
//! assignment, `+ - * / %`, unary `-` and `+`, parentheses, number and
//! string literals, `.length`, `.charAt()`, `.charCodeAt()` and string
//! indexing. Anything else, such as function definitions, loops,
//! comparisons or objects, is a syntax error.
//!
//! Evaluation is deterministic and has no access to the outside world
//! beyond the string bindings it is seeded with.

mod eval;
mod lexer;
mod parser;

use thiserror::Error;

pub use eval::Value;
pub(crate) use eval::format_number;

use super::evaluator::Bindings;

/// Largest script accepted, in bytes
pub const MAX_SCRIPT_LEN: usize = 64 * 1024;

/// Errors of the restricted interpreter
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InterpreterError {
    /// The script uses syntax outside of the supported subset
    #[error("Syntax error at byte {pos}: {message}")]
    Syntax {
        /// Byte offset of the offending input
        pos: usize,
        /// What went wrong
        message: String,
    },

    /// The script ended in the middle of a construct
    #[error("Unexpected end of script")]
    UnexpectedEnd,

    /// Expressions are nested too deeply
    #[error("Expression nesting exceeds {0} levels")]
    TooDeep(usize),

    /// The script is longer than [`MAX_SCRIPT_LEN`]
    #[error("Script of {0} bytes exceeds the size limit")]
    TooLarge(usize),

    /// The script contains no statement
    #[error("Script is empty")]
    Empty,

    /// A variable was read before being declared
    #[error("`{0}` is not defined")]
    UndefinedVariable(String),

    /// A `const` binding was reassigned
    #[error("Assignment to constant `{0}`")]
    AssignToConst(String),

    /// A property or method outside of the supported set was used
    #[error("Unsupported property `{0}`")]
    UnsupportedMember(String),
}

/// Run `script` with `bindings` predefined as string variables and return
/// the numeric value of its last statement
///
/// # Errors
///
/// Returns an error if the script is outside of the supported subset or
/// fails while running.
pub fn evaluate(script: &str, bindings: &Bindings) -> Result<f64, InterpreterError> {
    Ok(run(script, bindings)?.to_number())
}

/// Like [`evaluate`], returning the raw value of the last statement
///
/// # Errors
///
/// See [`evaluate`].
pub fn run(script: &str, bindings: &Bindings) -> Result<Value, InterpreterError> {
    if script.len() > MAX_SCRIPT_LEN {
        return Err(InterpreterError::TooLarge(script.len()));
    }
    let program = parser::parse(lexer::tokenize(script)?)?;
    if program.is_empty() {
        return Err(InterpreterError::Empty);
    }

    let mut scope = eval::Scope::default();
    for (name, value) in bindings {
        scope.define(name, Value::Str(value.clone()));
    }
    scope.run(&program)
}
