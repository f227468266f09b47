//! Tokenizer wrapper around HuggingFace `tokenizers`

use std::path::Path;
use tokenizers::Tokenizer as HFTokenizer;

use crate::error::{ModelError, Result};

/// Tokenizer file name inside a checkpoint directory
pub const TOKENIZER_NAME: &str = "tokenizer.json";

/// Wrapper around HuggingFace tokenizer
pub struct Tokenizer {
    inner: HFTokenizer,
}

impl Tokenizer {
    /// Load tokenizer from a tokenizer.json file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let inner = HFTokenizer::from_file(path)
            .map_err(|e| ModelError::Tokenizer(format!("{}: {}", path.display(), e)))?;
        Ok(Self { inner })
    }

    /// Load tokenizer from a directory containing tokenizer.json
    pub fn from_directory<P: AsRef<Path>>(dir: P) -> Result<Self> {
        Self::from_file(dir.as_ref().join(TOKENIZER_NAME))
    }

    /// Encode text to token IDs
    ///
    /// With `add_special_tokens` the tokenizer's post-processor runs, which
    /// prepends BOS for the Llama and Gemma families.
    pub fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, add_special_tokens)
            .map_err(|e| ModelError::Tokenizer(format!("Encoding error: {}", e)))?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Decode token IDs back to text
    pub fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        self.inner
            .decode(ids, skip_special_tokens)
            .map_err(|e| ModelError::Tokenizer(format!("Decoding error: {}", e)))
    }

    /// Get vocabulary size
    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    pub fn token_to_id(&self, token: &str) -> Option<u32> {
        self.inner.token_to_id(token)
    }

    pub fn id_to_token(&self, id: u32) -> Option<String> {
        self.inner.id_to_token(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;

    #[test]
    fn test_encode_prepends_bos() {
        let dir = tempfile::tempdir().unwrap();
        fixtures::write_tokenizer(dir.path()).unwrap();
        let tokenizer = Tokenizer::from_directory(dir.path()).unwrap();

        let ids = tokenizer.encode("What is the meaning of life?", true).unwrap();
        assert_eq!(ids, vec![1, 3, 4, 5, 6, 7, 8, 9]);

        let plain = tokenizer.encode("What is the meaning of life?", false).unwrap();
        assert_eq!(plain, vec![3, 4, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn test_decode_keeps_special_tokens_when_asked() {
        let dir = tempfile::tempdir().unwrap();
        fixtures::write_tokenizer(dir.path()).unwrap();
        let tokenizer = Tokenizer::from_directory(dir.path()).unwrap();

        let text = tokenizer.decode(&[1, 3, 4], false).unwrap();
        assert!(text.starts_with("<s>"));
        let text = tokenizer.decode(&[1, 3, 4], true).unwrap();
        assert!(!text.contains("<s>"));
        assert!(text.contains("What"));
        assert_eq!(tokenizer.vocab_size(), fixtures::VOCAB_SIZE);
        assert_eq!(tokenizer.token_to_id("</s>"), Some(2));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            Tokenizer::from_directory("/tmp/does-not-exist-edgelm"),
            Err(ModelError::Tokenizer(_))
        ));
    }
}
