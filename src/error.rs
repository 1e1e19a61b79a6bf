//! Error types for the media subsystem.
//!
//! Hardware and transport failures are surfaced as typed errors. The pipelines
//! never propagate them past their own loop: a failure becomes a state
//! transition (usually towards HALT) instead.

/// Failures of the decoder chip bus.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The chip did not acknowledge a bus transaction.
    #[error("bus transaction failed on {channel} channel: {reason}")]
    Transaction {
        /// Logical channel the transaction ran on ("control" or "data").
        channel: &'static str,
        /// What the bus backend reported.
        reason: String,
    },

    /// The ready line did not come up after a reset.
    #[error("decoder chip is unavailable (ready line low)")]
    NotReady,
}

impl BusError {
    pub fn transaction(channel: &'static str, reason: impl Into<String>) -> Self {
        Self::Transaction {
            channel,
            reason: reason.into(),
        }
    }
}

/// Failures of the network collaborators.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// The request could not be sent or the connection dropped.
    #[error("transport error: {0}")]
    Transport(String),

    /// The server answered with a status the caller cannot handle.
    #[error("unexpected HTTP status {0}")]
    Status(u16),

    /// Nothing arrived within the allowed time.
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The pipe feeding a streamed request body was closed.
    #[error("upload stream closed")]
    Closed,
}

impl From<reqwest::Error> for NetError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

/// Failures of a profile poll.
#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    /// The server no longer accepts the device credentials.
    #[error("device is not authorized")]
    Unauthorized,

    /// The profile document is missing a field or is not JSON.
    #[error("malformed profile: {0}")]
    Malformed(String),

    /// The profile could not be fetched.
    #[error(transparent)]
    Transport(#[from] NetError),
}

/// Failures of the microphone peripheral.
#[derive(Debug, thiserror::Error)]
pub enum MicError {
    #[error("microphone read failed: {0}")]
    Read(String),
}
