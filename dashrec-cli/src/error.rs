use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Recording error: {0}")]
    Live(#[from] dashrec_engine::LiveError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}
