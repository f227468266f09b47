//! Harness error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("Model error: {0}")]
    Model(#[from] edgelm_model::ModelError),

    #[error("Shape mismatch in {what}: original {original}, reauthored {reauthored}")]
    ShapeMismatch {
        what: &'static str,
        original: usize,
        reauthored: usize,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, HarnessError>;
