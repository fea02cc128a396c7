use thiserror::Error;

/// Gateway error taxonomy. Every variant is scoped to the connection whose
/// command caused it and is reported there only; none of them is fatal to
/// the connection, let alone the process.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Malformed or empty input, unknown recipient, bad attachment token.
    #[error("{0}")]
    Validation(String),

    /// Group operation without membership.
    #[error("You are not a member of this group.")]
    NotAMember,

    /// Call request to a user with no live connections.
    #[error("That user is not online.")]
    RecipientUnavailable,

    /// The durable message write failed; fan-out was suppressed and the
    /// sender should retry.
    #[error("Message could not be saved. Please try again.")]
    Persistence(#[source] anyhow::Error),

    /// Operation not valid for the session's current state (answering a
    /// non-ringing call, calling a busy pair, ...).
    #[error("{0}")]
    SessionState(String),
}

impl GatewayError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn session(msg: impl Into<String>) -> Self {
        Self::SessionState(msg.into())
    }
}
