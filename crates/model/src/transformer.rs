//! Reauthored decoder-only transformer
//!
//! One config-driven implementation serves every supported family. Each
//! block uses a fused qkv projection laid out per key-value group
//! (`[q × heads_per_group, k, v]` for every group), writes keys and values
//! into its cache entry and attends over the whole cache under a causal mask.
//!
//! Parameter names:
//! - `tok_embedding.weight`
//! - `transformer_blocks.{i}.pre_atten_norm.{weight,bias}`
//! - `transformer_blocks.{i}.atten_func.qkv_projection.{weight,bias}`
//! - `transformer_blocks.{i}.atten_func.output_projection.{weight,bias}`
//! - `transformer_blocks.{i}.atten_func.{query,key}_norm.weight`
//! - `transformer_blocks.{i}.post_atten_norm.{weight,bias}`
//! - `transformer_blocks.{i}.ff.{w1,w2,w3}.{weight,bias}`
//! - `final_norm.{weight,bias}`, `lm_head.{weight,bias}`

use rand::Rng;
use rayon::prelude::*;

use crate::error::{ModelError, Result};
use crate::kv_cache::{KvCache, KvCacheEntry};
use crate::model_config::{
    AttentionConfig, FeedForwardConfig, FeedForwardType, ModelConfig, NormalizationConfig,
    NormalizationType, TransformerBlockConfig,
};
use crate::ops;
use crate::rope::{self, RopeFrequencies};
use crate::tensor::{Logits, StateDict, Tensor};

pub const EMBEDDING: &str = "tok_embedding";
pub const FINAL_NORM: &str = "final_norm";
pub const LM_HEAD: &str = "lm_head";

/// Name of a parameter inside transformer block `idx`
pub fn block_param(idx: usize, name: &str) -> String {
    format!("transformer_blocks.{idx}.{name}")
}

/// A causal language model that threads its kv cache by value
pub trait CausalLm {
    fn config(&self) -> &ModelConfig;

    /// Run `tokens` at positions `input_pos`, returning logits for every
    /// position and the updated cache
    fn forward(
        &self,
        tokens: &[u32],
        input_pos: &[usize],
        kv_cache: KvCache,
    ) -> Result<ModelOutput>;
}

#[derive(Debug, Clone)]
pub struct ModelOutput {
    pub logits: Logits,
    pub kv_cache: KvCache,
}

/// Every parameter of a model built from `config`, with its shape
pub fn parameter_shapes(config: &ModelConfig) -> Vec<(String, Vec<usize>)> {
    let dim = config.embedding_dim;
    let mut shapes = vec![(format!("{EMBEDDING}.weight"), vec![config.vocab_size, dim])];

    for (idx, block) in config.block_configs.iter().enumerate() {
        let attn = &block.attn;
        let ff = &block.ff;
        push_norm(&mut shapes, block_param(idx, "pre_atten_norm"), &block.pre_attention_norm, dim);
        push_linear(
            &mut shapes,
            block_param(idx, "atten_func.qkv_projection"),
            attn.qkv_dim(),
            dim,
            attn.qkv_use_bias,
        );
        push_linear(
            &mut shapes,
            block_param(idx, "atten_func.output_projection"),
            dim,
            attn.num_heads * attn.head_dim,
            attn.output_proj_use_bias,
        );
        if let Some(norm) = &attn.query_norm {
            push_norm(&mut shapes, block_param(idx, "atten_func.query_norm"), norm, attn.head_dim);
        }
        if let Some(norm) = &attn.key_norm {
            push_norm(&mut shapes, block_param(idx, "atten_func.key_norm"), norm, attn.head_dim);
        }
        if let Some(norm) = &block.post_attention_norm {
            push_norm(&mut shapes, block_param(idx, "post_atten_norm"), norm, dim);
        }
        push_linear(&mut shapes, block_param(idx, "ff.w1"), ff.intermediate_size, dim, ff.use_bias);
        push_linear(&mut shapes, block_param(idx, "ff.w2"), dim, ff.intermediate_size, ff.use_bias);
        if ff.kind == FeedForwardType::Gated {
            let name = block_param(idx, "ff.w3");
            push_linear(&mut shapes, name, ff.intermediate_size, dim, ff.use_bias);
        }
    }

    push_norm(&mut shapes, FINAL_NORM.to_string(), &config.final_norm, dim);
    if !config.lm_head_share_weight_with_embedding {
        shapes.push((format!("{LM_HEAD}.weight"), vec![config.vocab_size, dim]));
    }
    if config.lm_head_use_bias {
        shapes.push((format!("{LM_HEAD}.bias"), vec![config.vocab_size]));
    }
    shapes
}

fn push_norm(
    shapes: &mut Vec<(String, Vec<usize>)>,
    prefix: String,
    norm: &NormalizationConfig,
    dim: usize,
) {
    shapes.push((format!("{prefix}.weight"), vec![dim]));
    if has_norm_bias(norm) {
        shapes.push((format!("{prefix}.bias"), vec![dim]));
    }
}

fn push_linear(
    shapes: &mut Vec<(String, Vec<usize>)>,
    prefix: String,
    out_features: usize,
    in_features: usize,
    use_bias: bool,
) {
    shapes.push((format!("{prefix}.weight"), vec![out_features, in_features]));
    if use_bias {
        shapes.push((format!("{prefix}.bias"), vec![out_features]));
    }
}

fn has_norm_bias(norm: &NormalizationConfig) -> bool {
    norm.kind == NormalizationType::LayerNorm && norm.use_bias
}

fn take(state_dict: &mut StateDict, name: &str, shape: &[usize]) -> Result<Tensor> {
    let tensor = state_dict
        .remove(name)
        .ok_or_else(|| ModelError::MissingTensor(name.to_string()))?;
    tensor.expect_shape(name, shape)?;
    Ok(tensor)
}

#[derive(Debug, Clone)]
struct Norm {
    config: NormalizationConfig,
    weight: Tensor,
    bias: Option<Tensor>,
}

impl Norm {
    fn load(
        state_dict: &mut StateDict,
        prefix: &str,
        config: NormalizationConfig,
        dim: usize,
    ) -> Result<Self> {
        let weight = take(state_dict, &format!("{prefix}.weight"), &[dim])?;
        let bias = if has_norm_bias(&config) {
            Some(take(state_dict, &format!("{prefix}.bias"), &[dim])?)
        } else {
            None
        };
        Ok(Self { config, weight, bias })
    }

    fn store(&self, prefix: &str, state_dict: &mut StateDict) {
        state_dict.insert(format!("{prefix}.weight"), self.weight.clone());
        if let Some(bias) = &self.bias {
            state_dict.insert(format!("{prefix}.bias"), bias.clone());
        }
    }

    fn forward(&self, x: &[f32], dim: usize) -> Vec<f32> {
        match self.config.kind {
            NormalizationType::RmsNorm => {
                let offset = if self.config.zero_centered { 1.0 } else { 0.0 };
                ops::rms_norm(x, dim, self.weight.data(), self.config.epsilon, offset)
            }
            NormalizationType::LayerNorm => ops::layer_norm(
                x,
                dim,
                self.weight.data(),
                self.bias.as_ref().map(|b| b.data()),
                self.config.epsilon,
            ),
        }
    }
}

#[derive(Debug, Clone)]
struct Linear {
    weight: Tensor,
    bias: Option<Tensor>,
}

impl Linear {
    fn load(
        state_dict: &mut StateDict,
        prefix: &str,
        out_features: usize,
        in_features: usize,
        use_bias: bool,
    ) -> Result<Self> {
        let weight = take(state_dict, &format!("{prefix}.weight"), &[out_features, in_features])?;
        let bias = if use_bias {
            Some(take(state_dict, &format!("{prefix}.bias"), &[out_features])?)
        } else {
            None
        };
        Ok(Self { weight, bias })
    }

    fn store(&self, prefix: &str, state_dict: &mut StateDict) {
        state_dict.insert(format!("{prefix}.weight"), self.weight.clone());
        if let Some(bias) = &self.bias {
            state_dict.insert(format!("{prefix}.bias"), bias.clone());
        }
    }

    fn forward(&self, x: &[f32], n: usize) -> Vec<f32> {
        ops::linear(x, n, &self.weight, self.bias.as_ref())
    }
}

#[derive(Debug, Clone)]
struct Attention {
    config: AttentionConfig,
    qkv_projection: Linear,
    output_projection: Linear,
    query_norm: Option<Norm>,
    key_norm: Option<Norm>,
    rope: RopeFrequencies,
}

impl Attention {
    fn load(
        state_dict: &mut StateDict,
        idx: usize,
        config: &AttentionConfig,
        dim: usize,
        max_len: usize,
    ) -> Result<Self> {
        let qkv_projection = Linear::load(
            state_dict,
            &block_param(idx, "atten_func.qkv_projection"),
            config.qkv_dim(),
            dim,
            config.qkv_use_bias,
        )?;
        let output_projection = Linear::load(
            state_dict,
            &block_param(idx, "atten_func.output_projection"),
            dim,
            config.num_heads * config.head_dim,
            config.output_proj_use_bias,
        )?;
        let query_norm = config
            .query_norm
            .map(|n| {
                let prefix = block_param(idx, "atten_func.query_norm");
                Norm::load(state_dict, &prefix, n, config.head_dim)
            })
            .transpose()?;
        let key_norm = config
            .key_norm
            .map(|n| {
                let prefix = block_param(idx, "atten_func.key_norm");
                Norm::load(state_dict, &prefix, n, config.head_dim)
            })
            .transpose()?;
        let rope = RopeFrequencies::new(config.rotary_dim(), max_len, config.rotary_base);

        Ok(Self {
            config: config.clone(),
            qkv_projection,
            output_projection,
            query_norm,
            key_norm,
            rope,
        })
    }

    fn store(&self, idx: usize, state_dict: &mut StateDict) {
        self.qkv_projection
            .store(&block_param(idx, "atten_func.qkv_projection"), state_dict);
        self.output_projection
            .store(&block_param(idx, "atten_func.output_projection"), state_dict);
        if let Some(norm) = &self.query_norm {
            norm.store(&block_param(idx, "atten_func.query_norm"), state_dict);
        }
        if let Some(norm) = &self.key_norm {
            norm.store(&block_param(idx, "atten_func.key_norm"), state_dict);
        }
    }

    fn forward(
        &self,
        x: &[f32],
        n: usize,
        input_pos: &[usize],
        cache: KvCacheEntry,
    ) -> Result<(Vec<f32>, KvCacheEntry)> {
        let cfg = &self.config;
        let head_dim = cfg.head_dim;
        let heads_per_group = cfg.heads_per_group();
        let groups = cfg.num_query_groups;
        let q_dim = cfg.num_heads * head_dim;
        let kv_dim = groups * head_dim;
        let qkv_dim = cfg.qkv_dim();
        let q_per_group = heads_per_group * head_dim;

        let qkv = self.qkv_projection.forward(x, n);

        // Ungroup [q..., k, v] per group into contiguous q, k and v
        let mut q = vec![0.0f32; n * q_dim];
        let mut k = vec![0.0f32; n * kv_dim];
        let mut v = vec![0.0f32; n * kv_dim];
        for t in 0..n {
            let row = &qkv[t * qkv_dim..(t + 1) * qkv_dim];
            for g in 0..groups {
                let base = g * (q_per_group + 2 * head_dim);
                let q_start = t * q_dim + g * q_per_group;
                let kv_start = t * kv_dim + g * head_dim;
                q[q_start..q_start + q_per_group].copy_from_slice(&row[base..base + q_per_group]);
                let k_src = base + q_per_group;
                k[kv_start..kv_start + head_dim].copy_from_slice(&row[k_src..k_src + head_dim]);
                let v_src = k_src + head_dim;
                v[kv_start..kv_start + head_dim].copy_from_slice(&row[v_src..v_src + head_dim]);
            }
        }

        if let Some(norm) = &self.query_norm {
            q = norm.forward(&q, head_dim);
        }
        if let Some(norm) = &self.key_norm {
            k = norm.forward(&k, head_dim);
        }

        for (t, &pos) in input_pos.iter().enumerate() {
            let q_row = &mut q[t * q_dim..(t + 1) * q_dim];
            rope::apply_rope(q_row, cfg.num_heads, head_dim, pos, &self.rope)?;
            let k_row = &mut k[t * kv_dim..(t + 1) * kv_dim];
            rope::apply_rope(k_row, groups, head_dim, pos, &self.rope)?;
        }

        let cache = cache.update(input_pos, &k, &v)?;

        let scale = 1.0 / (head_dim as f32).sqrt();
        let max_len = cache.max_seq_len();
        let mut attn = vec![0.0f32; n * q_dim];
        attn.par_chunks_mut(q_dim)
            .zip(q.par_chunks(q_dim))
            .zip(input_pos.par_iter())
            .for_each(|((out, q_row), &pos)| {
                let mut scores = vec![0.0f32; max_len];
                for h in 0..cfg.num_heads {
                    let group = h / heads_per_group;
                    let q_head = &q_row[h * head_dim..(h + 1) * head_dim];
                    for (j, score) in scores.iter_mut().enumerate() {
                        *score = if j > pos {
                            f32::NEG_INFINITY
                        } else {
                            ops::dot(q_head, cache.get_k(j, group)) * scale
                        };
                    }
                    ops::softmax_in_place(&mut scores);

                    let out_head = &mut out[h * head_dim..(h + 1) * head_dim];
                    for (j, &weight) in scores.iter().enumerate() {
                        for (o, &value) in out_head.iter_mut().zip(cache.get_v(j, group)) {
                            *o += weight * value;
                        }
                    }
                }
            });

        Ok((self.output_projection.forward(&attn, n), cache))
    }
}

#[derive(Debug, Clone)]
struct FeedForward {
    config: FeedForwardConfig,
    w1: Linear,
    w2: Linear,
    w3: Option<Linear>,
}

impl FeedForward {
    fn load(
        state_dict: &mut StateDict,
        idx: usize,
        config: &FeedForwardConfig,
        dim: usize,
    ) -> Result<Self> {
        let inter = config.intermediate_size;
        let w1 = Linear::load(state_dict, &block_param(idx, "ff.w1"), inter, dim, config.use_bias)?;
        let w2 = Linear::load(state_dict, &block_param(idx, "ff.w2"), dim, inter, config.use_bias)?;
        let w3 = match config.kind {
            FeedForwardType::Gated => Some(Linear::load(
                state_dict,
                &block_param(idx, "ff.w3"),
                inter,
                dim,
                config.use_bias,
            )?),
            FeedForwardType::Sequential => None,
        };
        Ok(Self {
            config: config.clone(),
            w1,
            w2,
            w3,
        })
    }

    fn store(&self, idx: usize, state_dict: &mut StateDict) {
        self.w1.store(&block_param(idx, "ff.w1"), state_dict);
        self.w2.store(&block_param(idx, "ff.w2"), state_dict);
        if let Some(w3) = &self.w3 {
            w3.store(&block_param(idx, "ff.w3"), state_dict);
        }
    }

    fn forward(&self, x: &[f32], n: usize) -> Vec<f32> {
        let activation = self.config.activation;
        let mut hidden = self.w1.forward(x, n);
        match &self.w3 {
            Some(w3) => {
                let up = w3.forward(x, n);
                for (h, u) in hidden.iter_mut().zip(&up) {
                    *h = activation.apply(*h) * u;
                }
            }
            None => {
                for h in hidden.iter_mut() {
                    *h = activation.apply(*h);
                }
            }
        }
        self.w2.forward(&hidden, n)
    }
}

#[derive(Debug, Clone)]
struct TransformerBlock {
    parallel_residual: bool,
    pre_atten_norm: Norm,
    atten_func: Attention,
    post_atten_norm: Option<Norm>,
    ff: FeedForward,
}

impl TransformerBlock {
    fn load(
        state_dict: &mut StateDict,
        idx: usize,
        config: &TransformerBlockConfig,
        dim: usize,
        max_len: usize,
    ) -> Result<Self> {
        let pre_atten_norm = Norm::load(
            state_dict,
            &block_param(idx, "pre_atten_norm"),
            config.pre_attention_norm,
            dim,
        )?;
        let atten_func = Attention::load(state_dict, idx, &config.attn, dim, max_len)?;
        let post_atten_norm = config
            .post_attention_norm
            .map(|n| Norm::load(state_dict, &block_param(idx, "post_atten_norm"), n, dim))
            .transpose()?;
        let ff = FeedForward::load(state_dict, idx, &config.ff, dim)?;
        Ok(Self {
            parallel_residual: config.parallel_residual,
            pre_atten_norm,
            atten_func,
            post_atten_norm,
            ff,
        })
    }

    fn store(&self, idx: usize, state_dict: &mut StateDict) {
        self.pre_atten_norm
            .store(&block_param(idx, "pre_atten_norm"), state_dict);
        self.atten_func.store(idx, state_dict);
        if let Some(norm) = &self.post_atten_norm {
            norm.store(&block_param(idx, "post_atten_norm"), state_dict);
        }
        self.ff.store(idx, state_dict);
    }

    fn forward(
        &self,
        x: &[f32],
        n: usize,
        input_pos: &[usize],
        cache: KvCacheEntry,
    ) -> Result<(Vec<f32>, KvCacheEntry)> {
        let dim = x.len() / n;
        let normed = self.pre_atten_norm.forward(x, dim);
        let (attn_out, cache) = self.atten_func.forward(&normed, n, input_pos, cache)?;

        if self.parallel_residual {
            let ff_out = self.ff.forward(&normed, n);
            let mut out = attn_out;
            ops::add_in_place(&mut out, &ff_out);
            ops::add_in_place(&mut out, x);
            return Ok((out, cache));
        }

        let mut hidden = x.to_vec();
        ops::add_in_place(&mut hidden, &attn_out);
        let ff_in = match &self.post_atten_norm {
            Some(norm) => norm.forward(&hidden, dim),
            None => hidden.clone(),
        };
        let ff_out = self.ff.forward(&ff_in, n);
        ops::add_in_place(&mut hidden, &ff_out);
        Ok((hidden, cache))
    }
}

/// Config-driven decoder-only transformer
#[derive(Debug, Clone)]
pub struct DecoderOnlyModel {
    config: ModelConfig,
    tok_embedding: Tensor,
    transformer_blocks: Vec<TransformerBlock>,
    final_norm: Norm,
    /// `None` when the head shares the embedding table
    lm_head: Option<Tensor>,
    lm_head_bias: Option<Tensor>,
}

impl DecoderOnlyModel {
    /// Build a model from a reauthored state dict
    pub fn from_state_dict(config: ModelConfig, mut state_dict: StateDict) -> Result<Self> {
        config.validate()?;
        let dim = config.embedding_dim;
        let max_len = config.kv_cache_max_len;

        let tok_embedding = take(
            &mut state_dict,
            &format!("{EMBEDDING}.weight"),
            &[config.vocab_size, dim],
        )?;
        let transformer_blocks = config
            .block_configs
            .iter()
            .enumerate()
            .map(|(idx, block)| TransformerBlock::load(&mut state_dict, idx, block, dim, max_len))
            .collect::<Result<Vec<_>>>()?;
        let final_norm = Norm::load(&mut state_dict, FINAL_NORM, config.final_norm, dim)?;
        let lm_head = if config.lm_head_share_weight_with_embedding {
            None
        } else {
            Some(take(&mut state_dict, &format!("{LM_HEAD}.weight"), &[config.vocab_size, dim])?)
        };
        let lm_head_bias = if config.lm_head_use_bias {
            Some(take(&mut state_dict, &format!("{LM_HEAD}.bias"), &[config.vocab_size])?)
        } else {
            None
        };

        if !state_dict.is_empty() {
            tracing::warn!(
                unused = ?state_dict.keys().collect::<Vec<_>>(),
                "Ignoring tensors not used by the model"
            );
        }
        tracing::debug!(
            layers = config.num_layers(),
            kv_cache_max_len = max_len,
            "Built decoder-only model"
        );

        Ok(Self {
            config,
            tok_embedding,
            transformer_blocks,
            final_norm,
            lm_head,
            lm_head_bias,
        })
    }

    /// Random weights (for testing)
    pub fn random<R: Rng>(config: ModelConfig, rng: &mut R) -> Result<Self> {
        let mut state_dict = StateDict::new();
        for (name, shape) in parameter_shapes(&config) {
            let tensor = if name.contains("norm.") && name.ends_with(".weight") {
                Tensor::random(shape, 1.0, 0.1, rng)
            } else if shape.len() == 2 {
                let spread = 1.0 / (shape[1] as f32).sqrt();
                Tensor::random(shape, 0.0, spread, rng)
            } else {
                Tensor::random(shape, 0.0, 0.1, rng)
            };
            state_dict.insert(name, tensor);
        }
        Self::from_state_dict(config, state_dict)
    }

    /// Copy of every parameter under its reauthored name
    pub fn state_dict(&self) -> StateDict {
        let mut state_dict = StateDict::new();
        state_dict.insert(format!("{EMBEDDING}.weight"), self.tok_embedding.clone());
        for (idx, block) in self.transformer_blocks.iter().enumerate() {
            block.store(idx, &mut state_dict);
        }
        self.final_norm.store(FINAL_NORM, &mut state_dict);
        if let Some(lm_head) = &self.lm_head {
            state_dict.insert(format!("{LM_HEAD}.weight"), lm_head.clone());
        }
        if let Some(bias) = &self.lm_head_bias {
            state_dict.insert(format!("{LM_HEAD}.bias"), bias.clone());
        }
        state_dict
    }

    /// Fresh zeroed cache sized for this model
    pub fn new_kv_cache(&self) -> KvCache {
        KvCache::from_model_config(&self.config)
    }
}

impl CausalLm for DecoderOnlyModel {
    fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn forward(
        &self,
        tokens: &[u32],
        input_pos: &[usize],
        kv_cache: KvCache,
    ) -> Result<ModelOutput> {
        let config = &self.config;
        if tokens.is_empty() {
            return Err(ModelError::InvalidInput("empty token sequence".into()));
        }
        if tokens.len() != input_pos.len() {
            return Err(ModelError::InvalidInput(format!(
                "{} tokens but {} positions",
                tokens.len(),
                input_pos.len()
            )));
        }
        if tokens.len() > config.kv_cache_max_len {
            return Err(ModelError::InvalidInput(format!(
                "{} tokens exceed kv cache capacity {}",
                tokens.len(),
                config.kv_cache_max_len
            )));
        }
        if kv_cache.num_layers() != self.transformer_blocks.len()
            || kv_cache.max_seq_len() != config.kv_cache_max_len
        {
            return Err(ModelError::InvalidInput(format!(
                "kv cache with {} layers of length {} does not match model ({} layers, length {})",
                kv_cache.num_layers(),
                kv_cache.max_seq_len(),
                self.transformer_blocks.len(),
                config.kv_cache_max_len
            )));
        }

        let n = tokens.len();
        let dim = config.embedding_dim;
        let mut x = ops::embedding(&self.tok_embedding, tokens)?;
        if let Some(scale) = config.embedding_scale {
            for value in x.iter_mut() {
                *value *= scale;
            }
        }

        let mut entries = Vec::with_capacity(self.transformer_blocks.len());
        for (idx, (block, entry)) in self
            .transformer_blocks
            .iter()
            .zip(kv_cache.into_entries())
            .enumerate()
        {
            let (out, entry) = block.forward(&x, n, input_pos, entry)?;
            tracing::trace!(layer = idx, "block done");
            x = out;
            entries.push(entry);
        }

        let x = self.final_norm.forward(&x, dim);
        let head = self.lm_head.as_ref().unwrap_or(&self.tok_embedding);
        let logits = ops::linear(&x, n, head, self.lm_head_bias.as_ref());

        Ok(ModelOutput {
            logits: Logits::new(logits, n, config.vocab_size)?,
            kv_cache: KvCache::from_entries(entries),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::families::{phi2, tiny_llama};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn model(config: ModelConfig) -> DecoderOnlyModel {
        DecoderOnlyModel::random(config, &mut StdRng::seed_from_u64(7)).unwrap()
    }

    #[test]
    fn test_forward_shapes() {
        let model = model(tiny_llama::get_fake_model_config(16));
        let cache = model.new_kv_cache();
        let out = model.forward(&[1, 2, 3], &[0, 1, 2], cache).unwrap();
        assert_eq!(out.logits.seq_len(), 3);
        assert_eq!(out.logits.vocab_size(), model.config().vocab_size);
        assert_eq!(out.kv_cache.num_layers(), model.config().num_layers());
        assert!(out.logits.data().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_forward_rejects_bad_input() {
        let model = model(tiny_llama::get_fake_model_config(4));
        assert!(matches!(
            model.forward(&[], &[], model.new_kv_cache()),
            Err(ModelError::InvalidInput(_))
        ));
        assert!(matches!(
            model.forward(&[1, 2, 3, 4, 5], &[0, 1, 2, 3, 4], model.new_kv_cache()),
            Err(ModelError::InvalidInput(_))
        ));
        assert!(matches!(
            model.forward(&[1, 2], &[0], model.new_kv_cache()),
            Err(ModelError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_position_past_rope_table_is_an_error() {
        let model = model(tiny_llama::get_fake_model_config(4));
        let err = model.forward(&[1], &[4], model.new_kv_cache()).unwrap_err();
        match err {
            ModelError::InvalidInput(msg) => assert!(msg.contains("rope table"), "{msg}"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_decode_step_matches_prefill() {
        for config in [
            tiny_llama::get_fake_model_config(16),
            phi2::get_fake_model_config(16),
        ] {
            let model = model(config);
            let full = model
                .forward(&[5, 9, 11], &[0, 1, 2], model.new_kv_cache())
                .unwrap();

            let prefill = model
                .forward(&[5, 9], &[0, 1], model.new_kv_cache())
                .unwrap();
            let step = model.forward(&[11], &[2], prefill.kv_cache).unwrap();

            let expected = full.logits.row(2).unwrap();
            let got = step.logits.row(0).unwrap();
            for (a, b) in expected.iter().zip(got) {
                assert!((a - b).abs() < 1e-5, "{a} vs {b}");
            }
        }
    }

    #[test]
    fn test_state_dict_rebuilds_same_model() {
        let model = model(phi2::get_fake_model_config(8));
        let names: Vec<String> = parameter_shapes(model.config())
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        let state_dict = model.state_dict();
        assert_eq!(state_dict.keys().cloned().collect::<Vec<_>>(), {
            let mut sorted = names.clone();
            sorted.sort();
            sorted
        });

        let rebuilt =
            DecoderOnlyModel::from_state_dict(model.config().clone(), state_dict).unwrap();
        let a = model.forward(&[1, 2], &[0, 1], model.new_kv_cache()).unwrap();
        let b = rebuilt.forward(&[1, 2], &[0, 1], rebuilt.new_kv_cache()).unwrap();
        assert_eq!(a.logits, b.logits);
    }

    #[test]
    fn test_missing_tensor() {
        let model = model(tiny_llama::get_fake_model_config(8));
        let mut state_dict = model.state_dict();
        state_dict.remove(&block_param(0, "ff.w3.weight"));
        assert!(matches!(
            DecoderOnlyModel::from_state_dict(model.config().clone(), state_dict),
            Err(ModelError::MissingTensor(_))
        ));
    }
}
