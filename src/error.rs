//! Main Crate Error

#[derive(thiserror::Error, Debug)]
/// Agora crate error enum.
pub enum Error {
    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),

    /// No port between the requested one and [u16::MAX], nor an ephemeral port, could be bound.
    #[error("Unable to bind to any available port starting from {0}")]
    NoAvailablePort(u16),

    #[error("Failed to encode message: {0}")]
    /// Errors related to encoding DHT messages.
    Encode(#[from] rmp_serde::encode::Error),

    #[error("Failed to decode message: {0}")]
    /// Errors related to parsing DHT messages.
    Decode(#[from] rmp_serde::decode::Error),

    /// A decoded message is missing fields its query requires.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// A well formed request for a method this node does not know.
    #[error("Unknown method {method:?} in transaction {transaction_id}")]
    UnknownMethod { transaction_id: u32, method: String },

    /// Indicates that a node id or key is not 64 hex characters.
    #[error("Invalid id: {0:?}")]
    InvalidId(String),
}
