use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("admission denied: {0}")]
    AdmissionDenied(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
