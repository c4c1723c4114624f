use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("join handshake failed: {0}")]
    JoinFailed(String),
    #[error(transparent)]
    Wire(#[from] wire::WireError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
