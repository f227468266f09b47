//! Conversion error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConvertError {
    #[error("Model error: {0}")]
    Model(#[from] edgelm_model::ModelError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Safetensors error: {0}")]
    Safetensors(String),

    #[error("Invalid export config: {0}")]
    InvalidConfig(String),

    #[error("Invalid bundle {path}: {message}")]
    Bundle { path: String, message: String },
}

impl From<safetensors::SafeTensorError> for ConvertError {
    fn from(e: safetensors::SafeTensorError) -> Self {
        ConvertError::Safetensors(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ConvertError>;
