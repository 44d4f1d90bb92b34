use crate::driver::DriverError;
use thiserror::Error;

/// Daemon-level errors. Library-layer failures are wrapped with enough
/// context to pick the right HTTP status or close frame.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("config: {0}")]
    Config(String),

    #[error("token: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),

    #[error("handshake: {0}")]
    Handshake(String),

    #[error("driver: {0}")]
    Driver(#[from] DriverError),

    #[error("transport: {0}")]
    Transport(#[from] std::io::Error),

    #[error("protocol: {0}")]
    Protocol(#[from] scrye::protocol::ParseError),

    #[error("session is shutting down")]
    SessionClosed,
}
