//! The sandboxed condition language used by webhook triggers.
//!
//! Conditions are small boolean expressions over a frozen set of variables
//! (`valueNumber > 55`, `name != previousName`,
//! `geoDistance(value.Latitude, value.Longitude, previousValue.Latitude,
//! previousValue.Longitude) > 1.0`). Programs are compiled once per webhook
//! and cached; evaluation runs under a cost budget with periodic
//! cancellation checks so a pathological condition cannot stall shutdown.
//!
//! Compilation is strict: unknown variables, type mismatches, and
//! non-boolean top-level expressions are rejected up front, so the hot path
//! only ever sees programs that are known to produce a boolean.

mod lexer;
mod parser;
mod program;
mod value;

pub use program::{Bindings, Program, Schema, compile, event_schema, signal_schema};
pub use value::{Location, Value, ValueKind};

use thiserror::Error as ThisError;

/// Default op budget used for the compile-time trial evaluation. Runtime
/// budgets come from configuration.
pub const TRIAL_COST_LIMIT: u64 = 10_000;

/// How often (in ops) evaluation polls the cancellation token.
pub const CANCEL_POLL_INTERVAL: u64 = 1_000;

#[derive(ThisError, Debug, Clone, PartialEq)]
pub enum Error {
    /// The source text is not a well-formed expression
    #[error("parse error at offset {offset}: {message}")]
    Parse { offset: usize, message: String },

    /// The expression is well-formed but violates the variable schema
    #[error("compile error: {0}")]
    Compile(String),

    /// Evaluation exceeded the op budget
    #[error("condition exceeded the {limit}-op cost budget")]
    CostExceeded { limit: u64 },

    /// Evaluation observed a cancelled token
    #[error("condition evaluation was cancelled")]
    Cancelled,

    /// Runtime evaluation failure (should not happen for compiled programs)
    #[error("evaluation error: {0}")]
    Eval(String),
}

pub type Result<T> = std::result::Result<T, Error>;
