use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),
    #[error("invalid address {0}")]
    InvalidAddress(String),
    #[error("payload is not an omniswap payload")]
    NotOmniswap,
}
