//! Reference implementations of the original HuggingFace models
//!
//! Loads checkpoints under their HuggingFace tensor names and runs them the
//! way `transformers` does: full-sequence causal attention without a cache,
//! and greedy generation that recomputes the whole sequence each step.

use std::path::Path;

use rayon::prelude::*;

use crate::config::{Architecture, GenerationConfig, HfConfig};
use crate::error::{ModelError, Result};
use crate::loader::SafetensorsLoader;
use crate::ops::{self, Activation};
use crate::rope::{self, RopeFrequencies};
use crate::tensor::{argmax, Logits, Tensor};

/// The original model as seen by the verifier
pub trait ReferenceLm {
    fn vocab_size(&self) -> usize;

    /// Logits for every position of `tokens`
    fn forward(&self, tokens: &[u32]) -> Result<Logits>;

    /// Greedy generation using the model's own generation config
    fn generate(&self, prompt: &[u32]) -> Result<Vec<u32>>;
}

enum NormKind {
    Rms { offset: f32 },
    Layer,
}

struct Norm {
    kind: NormKind,
    eps: f32,
    weight: Tensor,
    bias: Option<Tensor>,
}

impl Norm {
    fn rms(loader: &SafetensorsLoader, prefix: &str, eps: f32, offset: f32) -> Result<Self> {
        Ok(Self {
            kind: NormKind::Rms { offset },
            eps,
            weight: loader.load(&format!("{prefix}.weight"))?,
            bias: None,
        })
    }

    fn layer(loader: &SafetensorsLoader, prefix: &str, eps: f32) -> Result<Self> {
        Ok(Self {
            kind: NormKind::Layer,
            eps,
            weight: loader.load(&format!("{prefix}.weight"))?,
            bias: loader.load_optional(&format!("{prefix}.bias"))?,
        })
    }

    fn apply(&self, x: &[f32], dim: usize) -> Vec<f32> {
        match self.kind {
            NormKind::Rms { offset } => ops::rms_norm(x, dim, self.weight.data(), self.eps, offset),
            NormKind::Layer => ops::layer_norm(
                x,
                dim,
                self.weight.data(),
                self.bias.as_ref().map(|b| b.data()),
                self.eps,
            ),
        }
    }
}

struct Linear {
    weight: Tensor,
    bias: Option<Tensor>,
}

impl Linear {
    fn load(loader: &SafetensorsLoader, prefix: &str) -> Result<Self> {
        Ok(Self {
            weight: loader.load(&format!("{prefix}.weight"))?,
            bias: loader.load_optional(&format!("{prefix}.bias"))?,
        })
    }

    fn from_weight(weight: Tensor) -> Self {
        Self { weight, bias: None }
    }

    fn apply(&self, x: &[f32], n: usize) -> Vec<f32> {
        ops::linear(x, n, &self.weight, self.bias.as_ref())
    }
}

enum Mlp {
    /// down(act(gate(x)) * up(x))
    Gated {
        gate: Linear,
        up: Linear,
        down: Linear,
        activation: Activation,
    },
    /// fc2(act(fc1(x)))
    Sequential {
        fc1: Linear,
        fc2: Linear,
        activation: Activation,
    },
}

impl Mlp {
    fn apply(&self, x: &[f32], n: usize) -> Vec<f32> {
        match self {
            Self::Gated {
                gate,
                up,
                down,
                activation,
            } => {
                let mut hidden = gate.apply(x, n);
                let up = up.apply(x, n);
                for (g, u) in hidden.iter_mut().zip(&up) {
                    *g = activation.apply(*g) * u;
                }
                down.apply(&hidden, n)
            }
            Self::Sequential {
                fc1,
                fc2,
                activation,
            } => {
                let mut hidden = fc1.apply(x, n);
                for h in hidden.iter_mut() {
                    *h = activation.apply(*h);
                }
                fc2.apply(&hidden, n)
            }
        }
    }
}

struct Layer {
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    input_norm: Norm,
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    q_norm: Option<Norm>,
    k_norm: Option<Norm>,
    /// `None` for parallel-residual layers
    post_attention_norm: Option<Norm>,
    mlp: Mlp,
}

impl Layer {
    fn attention(&self, x: &[f32], n: usize, rope: &RopeFrequencies) -> Result<Vec<f32>> {
        let head_dim = self.head_dim;
        let q_dim = self.num_heads * head_dim;
        let kv_dim = self.num_kv_heads * head_dim;
        let heads_per_kv = self.num_heads / self.num_kv_heads;

        let mut q = self.q_proj.apply(x, n);
        let mut k = self.k_proj.apply(x, n);
        let v = self.v_proj.apply(x, n);
        if let Some(norm) = &self.q_norm {
            q = norm.apply(&q, head_dim);
        }
        if let Some(norm) = &self.k_norm {
            k = norm.apply(&k, head_dim);
        }
        for t in 0..n {
            let q_row = &mut q[t * q_dim..(t + 1) * q_dim];
            rope::apply_rope(q_row, self.num_heads, head_dim, t, rope)?;
            let k_row = &mut k[t * kv_dim..(t + 1) * kv_dim];
            rope::apply_rope(k_row, self.num_kv_heads, head_dim, t, rope)?;
        }

        let scale = 1.0 / (head_dim as f32).sqrt();
        let mut out = vec![0.0f32; n * q_dim];
        out.par_chunks_mut(q_dim).enumerate().for_each(|(t, out_row)| {
            let mut scores = vec![0.0f32; t + 1];
            for h in 0..self.num_heads {
                let kv_head = h / heads_per_kv;
                let q_head = &q[t * q_dim + h * head_dim..t * q_dim + (h + 1) * head_dim];
                for (j, score) in scores.iter_mut().enumerate() {
                    let k_start = j * kv_dim + kv_head * head_dim;
                    *score = ops::dot(q_head, &k[k_start..k_start + head_dim]) * scale;
                }
                ops::softmax_in_place(&mut scores);

                let out_head = &mut out_row[h * head_dim..(h + 1) * head_dim];
                for (j, &weight) in scores.iter().enumerate() {
                    let v_start = j * kv_dim + kv_head * head_dim;
                    for (o, &value) in out_head.iter_mut().zip(&v[v_start..v_start + head_dim]) {
                        *o += weight * value;
                    }
                }
            }
        });

        Ok(self.o_proj.apply(&out, n))
    }

    fn forward(&self, x: &[f32], n: usize, rope: &RopeFrequencies) -> Result<Vec<f32>> {
        let dim = x.len() / n;
        let normed = self.input_norm.apply(x, dim);
        let attn_out = self.attention(&normed, n, rope)?;

        match &self.post_attention_norm {
            None => {
                let mlp_out = self.mlp.apply(&normed, n);
                let mut out = attn_out;
                ops::add_in_place(&mut out, &mlp_out);
                ops::add_in_place(&mut out, x);
                Ok(out)
            }
            Some(norm) => {
                let mut hidden = x.to_vec();
                ops::add_in_place(&mut hidden, &attn_out);
                let mlp_out = self.mlp.apply(&norm.apply(&hidden, dim), n);
                ops::add_in_place(&mut hidden, &mlp_out);
                Ok(hidden)
            }
        }
    }
}

/// An original model loaded from a HuggingFace checkpoint directory
pub struct ReferenceModel {
    architecture: Architecture,
    config: HfConfig,
    generation_config: GenerationConfig,
    embed_tokens: Tensor,
    embedding_scale: Option<f32>,
    layers: Vec<Layer>,
    final_norm: Norm,
    /// `None` when tied to `embed_tokens`
    lm_head: Option<Linear>,
    rotary_dim: usize,
}

impl ReferenceModel {
    /// Load config, generation config and weights from `dir`
    pub fn from_pretrained<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let config = HfConfig::from_directory(dir)?;
        config.validate()?;
        let architecture = config.architecture()?;
        let generation_config = GenerationConfig::from_directory(dir, &config)?;
        let loader = SafetensorsLoader::from_directory(dir)?;

        tracing::info!(
            checkpoint = %dir.display(),
            model_type = %config.model_type,
            tensors = loader.tensor_names().len(),
            "Loading original model"
        );

        let head_dim = config.head_dim()?;
        let rotary_dim = rope::rotary_dim(head_dim, config.partial_rotary_factor());
        let hidden_size = config.hidden_size()?;

        let (embed_tokens, layers, final_norm, lm_head) = match architecture {
            Architecture::Llama | Architecture::Gemma => {
                load_llama(&loader, &config, architecture)?
            }
            Architecture::Phi => load_phi(&loader, &config)?,
            Architecture::OpenElm => load_openelm(&loader, &config)?,
        };
        let embedding_scale =
            (architecture == Architecture::Gemma).then(|| (hidden_size as f32).sqrt());

        Ok(Self {
            architecture,
            config,
            generation_config,
            embed_tokens,
            embedding_scale,
            layers,
            final_norm,
            lm_head,
            rotary_dim,
        })
    }

    pub fn architecture(&self) -> Architecture {
        self.architecture
    }

    pub fn config(&self) -> &HfConfig {
        &self.config
    }

    pub fn generation_config(&self) -> &GenerationConfig {
        &self.generation_config
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }
}

impl ReferenceLm for ReferenceModel {
    fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    fn forward(&self, tokens: &[u32]) -> Result<Logits> {
        if tokens.is_empty() {
            return Err(ModelError::InvalidInput("empty token sequence".into()));
        }
        let n = tokens.len();
        let dim = self.embed_tokens.row_len();

        let mut x = ops::embedding(&self.embed_tokens, tokens)?;
        if let Some(scale) = self.embedding_scale {
            for value in x.iter_mut() {
                *value *= scale;
            }
        }

        let rope = RopeFrequencies::new(self.rotary_dim, n, self.config.rope_theta());
        for layer in &self.layers {
            x = layer.forward(&x, n, &rope)?;
        }
        let x = self.final_norm.apply(&x, dim);

        let logits = match &self.lm_head {
            Some(head) => head.apply(&x, n),
            None => ops::linear(&x, n, &self.embed_tokens, None),
        };
        Logits::new(logits, n, self.embed_tokens.rows())
    }

    fn generate(&self, prompt: &[u32]) -> Result<Vec<u32>> {
        let target = self.generation_config.target_length(prompt.len());
        let eos = self.generation_config.eos_token_ids();
        let mut tokens = prompt.to_vec();

        while tokens.len() < target {
            let logits = self.forward(&tokens)?;
            let next = logits
                .last_row()
                .and_then(argmax)
                .ok_or_else(|| ModelError::InvalidInput("model returned no logits".into()))?
                as u32;
            tokens.push(next);
            if eos.contains(&next) {
                tracing::debug!(len = tokens.len(), "Stopped at EOS");
                break;
            }
        }
        Ok(tokens)
    }
}

type Loaded = (Tensor, Vec<Layer>, Norm, Option<Linear>);

fn load_llama(
    loader: &SafetensorsLoader,
    config: &HfConfig,
    architecture: Architecture,
) -> Result<Loaded> {
    let gemma = architecture == Architecture::Gemma;
    let eps = config.rms_norm_eps.unwrap_or(1e-6) as f32;
    let offset = if gemma { 1.0 } else { 0.0 };
    let default_act = if gemma { "gelu_pytorch_tanh" } else { "silu" };
    let activation = Activation::from_hf_name(config.activation().unwrap_or(default_act))?;
    let head_dim = config.head_dim()?;

    let mut layers = Vec::new();
    for i in 0..config.num_layers()? {
        let p = format!("model.layers.{i}");
        layers.push(Layer {
            num_heads: config.num_heads(i)?,
            num_kv_heads: config.num_kv_heads(i)?,
            head_dim,
            input_norm: Norm::rms(loader, &format!("{p}.input_layernorm"), eps, offset)?,
            q_proj: Linear::load(loader, &format!("{p}.self_attn.q_proj"))?,
            k_proj: Linear::load(loader, &format!("{p}.self_attn.k_proj"))?,
            v_proj: Linear::load(loader, &format!("{p}.self_attn.v_proj"))?,
            o_proj: Linear::load(loader, &format!("{p}.self_attn.o_proj"))?,
            q_norm: None,
            k_norm: None,
            post_attention_norm: Some(Norm::rms(
                loader,
                &format!("{p}.post_attention_layernorm"),
                eps,
                offset,
            )?),
            mlp: Mlp::Gated {
                gate: Linear::load(loader, &format!("{p}.mlp.gate_proj"))?,
                up: Linear::load(loader, &format!("{p}.mlp.up_proj"))?,
                down: Linear::load(loader, &format!("{p}.mlp.down_proj"))?,
                activation,
            },
        });
    }

    let embed_tokens = loader.load("model.embed_tokens.weight")?;
    let final_norm = Norm::rms(loader, "model.norm", eps, offset)?;
    let lm_head = if config.tie_word_embeddings(gemma) {
        None
    } else {
        Some(Linear::load(loader, "lm_head")?)
    };
    Ok((embed_tokens, layers, final_norm, lm_head))
}

fn load_phi(loader: &SafetensorsLoader, config: &HfConfig) -> Result<Loaded> {
    let eps = config.layer_norm_eps.unwrap_or(1e-5) as f32;
    let activation = Activation::from_hf_name(config.activation().unwrap_or("gelu_new"))?;
    let head_dim = config.head_dim()?;

    let mut layers = Vec::new();
    for i in 0..config.num_layers()? {
        let p = format!("model.layers.{i}");
        layers.push(Layer {
            num_heads: config.num_heads(i)?,
            num_kv_heads: config.num_kv_heads(i)?,
            head_dim,
            input_norm: Norm::layer(loader, &format!("{p}.input_layernorm"), eps)?,
            q_proj: Linear::load(loader, &format!("{p}.self_attn.q_proj"))?,
            k_proj: Linear::load(loader, &format!("{p}.self_attn.k_proj"))?,
            v_proj: Linear::load(loader, &format!("{p}.self_attn.v_proj"))?,
            o_proj: Linear::load(loader, &format!("{p}.self_attn.dense"))?,
            q_norm: None,
            k_norm: None,
            post_attention_norm: None,
            mlp: Mlp::Sequential {
                fc1: Linear::load(loader, &format!("{p}.mlp.fc1"))?,
                fc2: Linear::load(loader, &format!("{p}.mlp.fc2"))?,
                activation,
            },
        });
    }

    let embed_tokens = loader.load("model.embed_tokens.weight")?;
    let final_norm = Norm::layer(loader, "model.final_layernorm", eps)?;
    let lm_head = if config.tie_word_embeddings(false) {
        None
    } else {
        Some(Linear::load(loader, "lm_head")?)
    };
    Ok((embed_tokens, layers, final_norm, lm_head))
}

fn load_openelm(loader: &SafetensorsLoader, config: &HfConfig) -> Result<Loaded> {
    const EPS: f32 = 1e-6;
    let head_dim = config.head_dim()?;
    let qk_norm = config.normalize_qk_projections.unwrap_or(true);

    let mut layers = Vec::new();
    for i in 0..config.num_layers()? {
        let p = format!("transformer.layers.{i}");
        let num_heads = config.num_heads(i)?;
        let num_kv_heads = config.num_kv_heads(i)?;

        let qkv = loader.load(&format!("{p}.attn.qkv_proj.weight"))?;
        let q_rows = num_heads * head_dim;
        let kv_rows = num_kv_heads * head_dim;
        if qkv.rows() != q_rows + 2 * kv_rows {
            return Err(ModelError::InvalidShape {
                name: format!("{p}.attn.qkv_proj.weight"),
                expected: vec![q_rows + 2 * kv_rows, qkv.row_len()],
                got: qkv.shape().to_vec(),
            });
        }

        let proj_1 = loader.load(&format!("{p}.ffn.proj_1.weight"))?;
        let intermediate = proj_1.rows() / 2;

        let (q_norm, k_norm) = if qk_norm {
            (
                Some(Norm::rms(loader, &format!("{p}.attn.q_norm"), EPS, 0.0)?),
                Some(Norm::rms(loader, &format!("{p}.attn.k_norm"), EPS, 0.0)?),
            )
        } else {
            (None, None)
        };

        layers.push(Layer {
            num_heads,
            num_kv_heads,
            head_dim,
            input_norm: Norm::rms(loader, &format!("{p}.attn_norm"), EPS, 0.0)?,
            q_proj: Linear::from_weight(qkv.slice_rows(0, q_rows)),
            k_proj: Linear::from_weight(qkv.slice_rows(q_rows, q_rows + kv_rows)),
            v_proj: Linear::from_weight(qkv.slice_rows(q_rows + kv_rows, q_rows + 2 * kv_rows)),
            o_proj: Linear::load(loader, &format!("{p}.attn.out_proj"))?,
            q_norm,
            k_norm,
            post_attention_norm: Some(Norm::rms(loader, &format!("{p}.ffn_norm"), EPS, 0.0)?),
            mlp: Mlp::Gated {
                gate: Linear::from_weight(proj_1.slice_rows(0, intermediate)),
                up: Linear::from_weight(proj_1.slice_rows(intermediate, 2 * intermediate)),
                down: Linear::load(loader, &format!("{p}.ffn.proj_2"))?,
                activation: Activation::Silu,
            },
        });
    }

    let embed_tokens = loader.load("transformer.token_embeddings.weight")?;
    let final_norm = Norm::rms(loader, "transformer.norm", EPS, 0.0)?;
    let lm_head = if config.tie_word_embeddings(true) {
        None
    } else {
        Some(Linear::load(loader, "lm_head")?)
    };
    Ok((embed_tokens, layers, final_norm, lm_head))
}
