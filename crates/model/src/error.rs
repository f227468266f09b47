//! Model loading error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Safetensors error: {0}")]
    Safetensors(String),

    #[error("Hub error for {checkpoint}: {message}")]
    Hub { checkpoint: String, message: String },

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Model not found at path: {0}")]
    ModelNotFound(String),

    #[error("Missing tensor: {0}")]
    MissingTensor(String),

    #[error("Invalid tensor shape for {name}: expected {expected:?}, got {got:?}")]
    InvalidShape {
        name: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("Invalid tensor dtype for {name}: expected f32, f16 or bf16, got {got}")]
    InvalidDtype { name: String, got: String },

    #[error("Model config error: {0}")]
    Config(String),

    #[error("Unsupported model type: {0}")]
    UnsupportedModelType(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl From<safetensors::SafeTensorError> for ModelError {
    fn from(e: safetensors::SafeTensorError) -> Self {
        ModelError::Safetensors(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ModelError>;
