//! Comparator and decode-loop properties against deterministic stub models

use edgelm_harness::{generate, verify_model_with_prompts, verify_with_input_ids};
use edgelm_model::families::tiny_llama;
use edgelm_model::fixtures::{self, VOCAB_SIZE};
use edgelm_model::{CausalLm, KvCache, Logits, ModelConfig, ModelOutput, ReferenceLm, Tokenizer};
use proptest::prelude::*;

const KV_CACHE_MAX_LEN: usize = 16;
const NEW_TOKENS: usize = 4;
const PROMPT: &str = "What is the meaning of life?";

/// Prefix-dependent logits; optionally flips the prediction at one length
struct Stub {
    config: ModelConfig,
    diverge_at: Option<usize>,
}

impl Stub {
    fn new(diverge_at: Option<usize>) -> Self {
        Self {
            config: tiny_llama::get_fake_model_config(KV_CACHE_MAX_LEN),
            diverge_at,
        }
    }

    fn row(&self, prefix: &[u32]) -> Vec<f32> {
        let mut best = prefix
            .iter()
            .fold(7usize, |h, &t| (h * 31 + t as usize) % VOCAB_SIZE);
        if self.diverge_at == Some(prefix.len()) {
            best = (best + 1) % VOCAB_SIZE;
        }
        let mut row: Vec<f32> = (0..VOCAB_SIZE).map(|i| (i % 5) as f32 * 0.1).collect();
        row[best] = 10.0;
        row
    }

    fn logits(&self, tokens: &[u32]) -> edgelm_model::Result<Logits> {
        let rows = tokens.len().max(1);
        let data = (0..rows)
            .flat_map(|t| self.row(&tokens[..(t + 1).min(tokens.len())]))
            .collect();
        Logits::new(data, rows, VOCAB_SIZE)
    }
}

impl ReferenceLm for Stub {
    fn vocab_size(&self) -> usize {
        VOCAB_SIZE
    }

    fn forward(&self, tokens: &[u32]) -> edgelm_model::Result<Logits> {
        self.logits(tokens)
    }

    fn generate(&self, prompt: &[u32]) -> edgelm_model::Result<Vec<u32>> {
        let mut tokens = prompt.to_vec();
        while tokens.len() < prompt.len() + NEW_TOKENS {
            let row = self.row(&tokens);
            let next = edgelm_model::argmax(&row).unwrap_or(0);
            tokens.push(next as u32);
        }
        Ok(tokens)
    }
}

impl CausalLm for Stub {
    fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn forward(
        &self,
        tokens: &[u32],
        _input_pos: &[usize],
        kv_cache: KvCache,
    ) -> edgelm_model::Result<ModelOutput> {
        Ok(ModelOutput {
            logits: self.logits(tokens)?,
            kv_cache,
        })
    }
}

/// Same logits everywhere
struct Constant {
    config: ModelConfig,
    row: Vec<f32>,
}

impl Constant {
    fn new(row: Vec<f32>) -> Self {
        let mut config = tiny_llama::get_fake_model_config(KV_CACHE_MAX_LEN);
        config.vocab_size = row.len();
        Self { config, row }
    }
}

impl ReferenceLm for Constant {
    fn vocab_size(&self) -> usize {
        self.row.len()
    }

    fn forward(&self, tokens: &[u32]) -> edgelm_model::Result<Logits> {
        Logits::new(self.row.repeat(tokens.len()), tokens.len(), self.row.len())
    }

    fn generate(&self, prompt: &[u32]) -> edgelm_model::Result<Vec<u32>> {
        Ok(prompt.to_vec())
    }
}

impl CausalLm for Constant {
    fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn forward(
        &self,
        tokens: &[u32],
        _input_pos: &[usize],
        kv_cache: KvCache,
    ) -> edgelm_model::Result<ModelOutput> {
        let rows = tokens.len().max(1);
        Ok(ModelOutput {
            logits: Logits::new(self.row.repeat(rows), rows, self.row.len())?,
            kv_cache,
        })
    }
}

fn tokenizer() -> (tempfile::TempDir, Tokenizer) {
    let dir = tempfile::tempdir().unwrap();
    fixtures::write_tokenizer(dir.path()).unwrap();
    let tokenizer = Tokenizer::from_directory(dir.path()).unwrap();
    (dir, tokenizer)
}

#[test]
fn test_model_matches_itself() {
    let model = Stub::new(None);
    assert!(verify_with_input_ids(&model, &model, &[1, 2, 3, 4], KV_CACHE_MAX_LEN, 0.0).unwrap());

    let (_dir, tokenizer) = tokenizer();
    assert!(verify_model_with_prompts(&model, &model, &tokenizer, PROMPT).unwrap());
}

#[test]
fn test_single_diverging_token_fails_generation_check() {
    let (_dir, tokenizer) = tokenizer();
    let prompt_len = tokenizer.encode(PROMPT, true).unwrap().len();
    let original = Stub::new(None);
    let reauthored = Stub::new(Some(prompt_len));

    assert!(!verify_model_with_prompts(&original, &reauthored, &tokenizer, PROMPT).unwrap());
    // the first prompt positions agree, so the logits check is unaffected
    assert!(verify_with_input_ids(&original, &reauthored, &[1, 2], KV_CACHE_MAX_LEN, 0.0).unwrap());
}

#[test]
fn test_empty_prompt_repeats_fixed_argmax() {
    let mut row = vec![0.0; 10];
    row[6] = 3.0;
    let model = Constant::new(row);
    assert_eq!(generate(&model, &[], 5).unwrap(), vec![6; 5]);
}

proptest! {
    #[test]
    fn test_generate_reaches_target_length(
        prompt in prop::collection::vec(0u32..VOCAB_SIZE as u32, 0..6),
        target in 0usize..12,
    ) {
        let out = generate(&Stub::new(None), &prompt, target).unwrap();
        prop_assert_eq!(out.len(), target.max(prompt.len()));
        prop_assert_eq!(&out[..prompt.len()], &prompt[..]);
    }

    #[test]
    fn test_generate_to_prompt_length_is_identity(
        prompt in prop::collection::vec(0u32..VOCAB_SIZE as u32, 0..8),
    ) {
        prop_assert_eq!(generate(&Stub::new(None), &prompt, prompt.len()).unwrap(), prompt);
    }

    #[test]
    fn test_logits_check_is_reflexive(
        input_ids in prop::collection::vec(0u32..VOCAB_SIZE as u32, 1..=KV_CACHE_MAX_LEN),
    ) {
        let model = Stub::new(None);
        let matched =
            verify_with_input_ids(&model, &model, &input_ids, KV_CACHE_MAX_LEN, 0.0).unwrap();
        prop_assert!(matched);
    }

    #[test]
    fn test_logits_check_monotonic_in_tolerance(
        row in prop::collection::vec(-10.0f32..10.0, 8),
        noise in prop::collection::vec(-0.1f32..0.1, 8),
        a in 0.0f32..0.2,
        b in 0.0f32..0.2,
    ) {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        let perturbed: Vec<f32> = row.iter().zip(&noise).map(|(x, n)| x + n).collect();
        let original = Constant::new(row);
        let reauthored = Constant::new(perturbed);
        let strict =
            verify_with_input_ids(&original, &reauthored, &[1, 2], KV_CACHE_MAX_LEN, lo).unwrap();
        let loose =
            verify_with_input_ids(&original, &reauthored, &[1, 2], KV_CACHE_MAX_LEN, hi).unwrap();
        prop_assert!(!strict || loose);
    }
}
