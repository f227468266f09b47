//! Checkpoint resolution
//!
//! A checkpoint is either a local directory (or a file inside one) or a
//! HuggingFace Hub model id. Hub checkpoints are fetched into the local hub
//! cache and resolved to the cache directory holding `config.json`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use hf_hub::api::sync::{Api, ApiBuilder};
use serde::Deserialize;

use crate::config::{CONFIG_NAME, GENERATION_CONFIG_NAME};
use crate::error::{ModelError, Result};
use crate::loader::{WEIGHTS_INDEX_NAME, WEIGHTS_NAME};
use crate::tokenizer::TOKENIZER_NAME;

#[derive(Debug, Deserialize)]
struct WeightsIndex {
    weight_map: std::collections::HashMap<String, String>,
}

/// Local directory if `checkpoint` names one (or a file inside one)
fn local_dir(checkpoint: &str) -> Option<PathBuf> {
    let path = Path::new(checkpoint);
    if path.is_dir() {
        Some(path.to_path_buf())
    } else if path.is_file() {
        path.parent().map(Path::to_path_buf)
    } else {
        None
    }
}

fn hub_api(checkpoint: &str) -> Result<Api> {
    let mut builder = ApiBuilder::new();
    if let Ok(token) = std::env::var("HF_TOKEN") {
        builder = builder.with_token(Some(token));
    }
    builder.build().map_err(|e| ModelError::Hub {
        checkpoint: checkpoint.to_string(),
        message: e.to_string(),
    })
}

fn hub_error(checkpoint: &str, file: &str, e: impl std::fmt::Display) -> ModelError {
    ModelError::Hub {
        checkpoint: checkpoint.to_string(),
        message: format!("{file}: {e}"),
    }
}

/// Resolve a checkpoint to a local directory with config and weights
pub fn resolve_checkpoint(checkpoint: &str) -> Result<PathBuf> {
    if let Some(dir) = local_dir(checkpoint) {
        tracing::info!(checkpoint = %dir.display(), "Using local checkpoint");
        return Ok(dir);
    }

    let api = hub_api(checkpoint)?;
    let repo = api.model(checkpoint.to_string());

    let cached_config_file = repo
        .get(CONFIG_NAME)
        .map_err(|e| hub_error(checkpoint, CONFIG_NAME, e))?;
    tracing::info!(cached_config_file = %cached_config_file.display(), "Fetched config");

    if let Err(e) = repo.get(GENERATION_CONFIG_NAME) {
        tracing::debug!(error = %e, "No generation config on hub");
    }

    match repo.get(WEIGHTS_INDEX_NAME) {
        Ok(index_path) => {
            let content = std::fs::read_to_string(&index_path)?;
            let index: WeightsIndex = serde_json::from_str(&content)?;
            let shards: HashSet<String> = index.weight_map.into_values().collect();
            for shard in shards {
                tracing::info!(shard = %shard, "Fetching weights shard");
                repo.get(&shard).map_err(|e| hub_error(checkpoint, &shard, e))?;
            }
        }
        Err(_) => {
            repo.get(WEIGHTS_NAME)
                .map_err(|e| hub_error(checkpoint, WEIGHTS_NAME, e))?;
        }
    }

    cached_config_file
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| ModelError::ModelNotFound(cached_config_file.display().to_string()))
}

/// Resolve a tokenizer checkpoint to the path of its `tokenizer.json`
pub fn resolve_tokenizer(checkpoint: &str) -> Result<PathBuf> {
    if let Some(dir) = local_dir(checkpoint) {
        return Ok(dir.join(TOKENIZER_NAME));
    }
    let api = hub_api(checkpoint)?;
    api.model(checkpoint.to_string())
        .get(TOKENIZER_NAME)
        .map_err(|e| hub_error(checkpoint, TOKENIZER_NAME, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_directory_resolves_to_itself() {
        let dir = tempfile::tempdir().unwrap();
        let resolved = resolve_checkpoint(dir.path().to_str().unwrap()).unwrap();
        assert_eq!(resolved, dir.path());
    }

    #[test]
    fn test_local_file_resolves_to_parent() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join(CONFIG_NAME);
        std::fs::write(&file, "{}").unwrap();
        let resolved = resolve_checkpoint(file.to_str().unwrap()).unwrap();
        assert_eq!(resolved, dir.path());
        assert_eq!(
            resolve_tokenizer(file.to_str().unwrap()).unwrap(),
            dir.path().join(TOKENIZER_NAME)
        );
    }
}
