//! Error taxonomy for compilation and estimation.
//!
//! "A part produced zero plans for this configuration" is not an error: it is
//! an empty `Vec` the combiner recovers from by trying other cascade roles.
//! Everything in here is fatal to the whole compilation.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CompileError {
    /// The graph of parts is malformed: dangling slot, duplicate connection,
    /// cycle. The front end should never have produced it.
    #[error("invalid graph of parts: {0}")]
    InvalidGraph(String),

    /// No feasible whole-graph combination exists even without cascading.
    /// The front end validated something the combiner cannot realize.
    #[error("no feasible combination: {0}")]
    SearchExhausted(String),

    /// An internal invariant was violated (unreachable buffer-format case,
    /// inconsistent op graph wiring).
    #[error("internal invariant violated: {0}")]
    Invariant(String),
}

pub type Result<T> = std::result::Result<T, CompileError>;
