use thiserror::Error;

/// Errors that can occur in the node binary.
#[derive(Debug, Error)]
#[allow(clippy::enum_variant_names)]
pub enum NodeError {
    #[error("config error: {reason}")]
    ConfigError { reason: String },

    #[error("network error: {0}")]
    NetworkError(#[from] junction_net::NetworkError),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),
}
