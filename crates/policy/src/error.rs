//! Policy engine error model.

use std::time::Duration;

use thiserror::Error;

pub type PolicyResult<T> = Result<T, PolicyEngineError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PolicyEngineError {
    /// The request never produced a response (connect/IO failure).
    #[error("policy engine transport error: {0}")]
    Transport(String),

    /// The engine answered with a non-success status.
    #[error("policy engine returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("failed to decode policy engine response: {0}")]
    Decode(String),

    #[error("policy engine call timed out after {0:?}")]
    Timeout(Duration),

    /// No schema has been written yet.
    #[error("policy engine has no schema")]
    NoSchema,

    /// The schema uses a name outside the engine's identifier grammar.
    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    #[error("definition '{0}' is not declared in the current schema")]
    UnknownDefinition(String),

    #[error("relation '{relation}' is not declared on '{definition}'")]
    UnknownRelation { definition: String, relation: String },

    /// Local state could not be read (in-memory engine lock poisoned).
    #[error("policy engine state error: {0}")]
    State(String),
}
