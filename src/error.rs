//! Crate-wide error types.

pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error for store and delivery operations.
///
/// Infrastructure paths (daemonization, config loading, CLI wiring) use
/// `anyhow::Result` directly; the `Other` arm lets `anyhow::Context` compose
/// at store call sites without a conversion dance.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Gateway(#[from] crate::delivery::gateway::GatewayError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
