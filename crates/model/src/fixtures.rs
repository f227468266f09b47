//! Tiny on-disk checkpoints for tests
//!
//! Writes a HuggingFace-layout directory (`config.json`,
//! `generation_config.json`, `model.safetensors`, `tokenizer.json`) with
//! random weights for any supported architecture.

use std::path::Path;

use rand::rngs::StdRng;
use rand::SeedableRng;
use safetensors::tensor::TensorView;
use safetensors::Dtype;
use serde_json::json;

use crate::config::{Architecture, HfConfig, CONFIG_NAME, GENERATION_CONFIG_NAME};
use crate::error::{ModelError, Result};
use crate::families::openelm;
use crate::loader::WEIGHTS_NAME;
use crate::tensor::Tensor;
use crate::tokenizer::TOKENIZER_NAME;

pub const VOCAB_SIZE: usize = 64;

/// Total length the fixture generation config stops at
pub const MAX_LENGTH: usize = 12;

pub const BOS_TOKEN_ID: u32 = 1;
pub const EOS_TOKEN_ID: u32 = 2;

pub const ALL_ARCHITECTURES: [Architecture; 4] = [
    Architecture::Llama,
    Architecture::Gemma,
    Architecture::Phi,
    Architecture::OpenElm,
];

const WORDS: [&str; 10] = [
    "[UNK]", "<s>", "</s>", "What", "is", "the", "meaning", "of", "life", "?",
];

/// Word-level tokenizer that prepends `<s>` when special tokens are requested
pub fn write_tokenizer(dir: &Path) -> Result<()> {
    let mut vocab = serde_json::Map::new();
    for (id, word) in WORDS.iter().enumerate() {
        vocab.insert(word.to_string(), json!(id));
    }
    for id in WORDS.len()..VOCAB_SIZE {
        vocab.insert(format!("w{id}"), json!(id));
    }

    let added_tokens: Vec<_> = WORDS[..3]
        .iter()
        .enumerate()
        .map(|(id, word)| {
            json!({
                "id": id,
                "content": word,
                "single_word": false,
                "lstrip": false,
                "rstrip": false,
                "normalized": false,
                "special": true
            })
        })
        .collect();

    let tokenizer = json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": added_tokens,
        "normalizer": null,
        "pre_tokenizer": { "type": "Whitespace" },
        "post_processor": {
            "type": "TemplateProcessing",
            "single": [
                { "SpecialToken": { "id": "<s>", "type_id": 0 } },
                { "Sequence": { "id": "A", "type_id": 0 } }
            ],
            "pair": [
                { "SpecialToken": { "id": "<s>", "type_id": 0 } },
                { "Sequence": { "id": "A", "type_id": 0 } },
                { "Sequence": { "id": "B", "type_id": 1 } }
            ],
            "special_tokens": {
                "<s>": { "id": "<s>", "ids": [BOS_TOKEN_ID], "tokens": ["<s>"] }
            }
        },
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": vocab,
            "unk_token": "[UNK]"
        }
    });
    std::fs::write(dir.join(TOKENIZER_NAME), serde_json::to_string_pretty(&tokenizer)?)?;
    Ok(())
}

/// `config.json` contents of the tiny model of `arch`
pub fn hf_config_json(arch: Architecture) -> serde_json::Value {
    match arch {
        Architecture::Llama => json!({
            "model_type": "llama",
            "vocab_size": VOCAB_SIZE,
            "hidden_size": 32,
            "intermediate_size": 64,
            "num_hidden_layers": 2,
            "num_attention_heads": 4,
            "num_key_value_heads": 2,
            "max_position_embeddings": 128,
            "rms_norm_eps": 1e-5,
            "rope_theta": 10000.0,
            "hidden_act": "silu",
            "tie_word_embeddings": false,
            "bos_token_id": BOS_TOKEN_ID,
            "eos_token_id": EOS_TOKEN_ID
        }),
        Architecture::Gemma => json!({
            "model_type": "gemma",
            "vocab_size": VOCAB_SIZE,
            "hidden_size": 32,
            "intermediate_size": 64,
            "num_hidden_layers": 2,
            "num_attention_heads": 2,
            "num_key_value_heads": 1,
            "head_dim": 16,
            "max_position_embeddings": 128,
            "rms_norm_eps": 1e-6,
            "hidden_act": "gelu",
            "hidden_activation": "gelu_pytorch_tanh",
            "bos_token_id": BOS_TOKEN_ID,
            "eos_token_id": EOS_TOKEN_ID
        }),
        Architecture::Phi => json!({
            "model_type": "phi",
            "vocab_size": VOCAB_SIZE,
            "hidden_size": 32,
            "intermediate_size": 64,
            "num_hidden_layers": 2,
            "num_attention_heads": 4,
            "num_key_value_heads": null,
            "partial_rotary_factor": 0.5,
            "max_position_embeddings": 128,
            "layer_norm_eps": 1e-5,
            "hidden_act": "gelu_new",
            "tie_word_embeddings": false,
            "bos_token_id": BOS_TOKEN_ID,
            "eos_token_id": EOS_TOKEN_ID
        }),
        Architecture::OpenElm => json!({
            "model_type": "openelm",
            "vocab_size": VOCAB_SIZE,
            "model_dim": 32,
            "num_transformer_layers": 2,
            "head_dim": 8,
            "num_query_heads": [2, 4],
            "num_kv_heads": [1, 2],
            "ffn_multipliers": [0.5, 1.0],
            "ffn_dim_divisor": 8,
            "ffn_with_glu": true,
            "normalize_qk_projections": true,
            "share_input_output_layers": true,
            "rope_freq_constant": 10000,
            "rope_max_length": 128,
            "activation_fn_name": "swish",
            "bos_token_id": BOS_TOKEN_ID,
            "eos_token_id": EOS_TOKEN_ID
        }),
    }
}

/// HuggingFace parameter names and shapes of a checkpoint described by `config`
pub fn hf_parameter_shapes(config: &HfConfig) -> Result<Vec<(String, Vec<usize>)>> {
    let arch = config.architecture()?;
    let dim = config.hidden_size()?;
    let head_dim = config.head_dim()?;
    let vocab = config.vocab_size;
    let mut shapes = Vec::new();
    let mut push = |name: String, shape: Vec<usize>| shapes.push((name, shape));

    match arch {
        Architecture::Llama | Architecture::Gemma | Architecture::Phi => {
            let inter = config
                .intermediate_size
                .ok_or_else(|| ModelError::Config("missing intermediate_size".into()))?;
            let phi = arch == Architecture::Phi;
            push("model.embed_tokens.weight".into(), vec![vocab, dim]);
            for i in 0..config.num_layers()? {
                let p = format!("model.layers.{i}");
                let q_rows = config.num_heads(i)? * head_dim;
                let kv_rows = config.num_kv_heads(i)? * head_dim;
                push(format!("{p}.input_layernorm.weight"), vec![dim]);
                push(format!("{p}.self_attn.q_proj.weight"), vec![q_rows, dim]);
                push(format!("{p}.self_attn.k_proj.weight"), vec![kv_rows, dim]);
                push(format!("{p}.self_attn.v_proj.weight"), vec![kv_rows, dim]);
                if phi {
                    push(format!("{p}.input_layernorm.bias"), vec![dim]);
                    push(format!("{p}.self_attn.q_proj.bias"), vec![q_rows]);
                    push(format!("{p}.self_attn.k_proj.bias"), vec![kv_rows]);
                    push(format!("{p}.self_attn.v_proj.bias"), vec![kv_rows]);
                    push(format!("{p}.self_attn.dense.weight"), vec![dim, q_rows]);
                    push(format!("{p}.self_attn.dense.bias"), vec![dim]);
                    push(format!("{p}.mlp.fc1.weight"), vec![inter, dim]);
                    push(format!("{p}.mlp.fc1.bias"), vec![inter]);
                    push(format!("{p}.mlp.fc2.weight"), vec![dim, inter]);
                    push(format!("{p}.mlp.fc2.bias"), vec![dim]);
                } else {
                    push(format!("{p}.self_attn.o_proj.weight"), vec![dim, q_rows]);
                    push(format!("{p}.post_attention_layernorm.weight"), vec![dim]);
                    push(format!("{p}.mlp.gate_proj.weight"), vec![inter, dim]);
                    push(format!("{p}.mlp.up_proj.weight"), vec![inter, dim]);
                    push(format!("{p}.mlp.down_proj.weight"), vec![dim, inter]);
                }
            }
            if phi {
                push("model.final_layernorm.weight".into(), vec![dim]);
                push("model.final_layernorm.bias".into(), vec![dim]);
                push("lm_head.weight".into(), vec![vocab, dim]);
                push("lm_head.bias".into(), vec![vocab]);
            } else {
                push("model.norm.weight".into(), vec![dim]);
                if !config.tie_word_embeddings(arch == Architecture::Gemma) {
                    push("lm_head.weight".into(), vec![vocab, dim]);
                }
            }
        }
        Architecture::OpenElm => {
            push("transformer.token_embeddings.weight".into(), vec![vocab, dim]);
            for i in 0..config.num_layers()? {
                let p = format!("transformer.layers.{i}");
                let q_rows = config.num_heads(i)? * head_dim;
                let kv_rows = config.num_kv_heads(i)? * head_dim;
                let inter = openelm::intermediate_size(config, i)?;
                push(format!("{p}.attn_norm.weight"), vec![dim]);
                push(format!("{p}.attn.qkv_proj.weight"), vec![q_rows + 2 * kv_rows, dim]);
                push(format!("{p}.attn.q_norm.weight"), vec![head_dim]);
                push(format!("{p}.attn.k_norm.weight"), vec![head_dim]);
                push(format!("{p}.attn.out_proj.weight"), vec![dim, q_rows]);
                push(format!("{p}.ffn_norm.weight"), vec![dim]);
                push(format!("{p}.ffn.proj_1.weight"), vec![2 * inter, dim]);
                push(format!("{p}.ffn.proj_2.weight"), vec![dim, inter]);
            }
            push("transformer.norm.weight".into(), vec![dim]);
        }
    }
    Ok(shapes)
}

/// Write a tiny random checkpoint of `arch` into `dir`
pub fn write_tiny_checkpoint(dir: &Path, arch: Architecture, seed: u64) -> Result<()> {
    let config_json = hf_config_json(arch);
    std::fs::write(dir.join(CONFIG_NAME), serde_json::to_string_pretty(&config_json)?)?;
    let generation_config = json!({
        "max_length": MAX_LENGTH,
        "bos_token_id": BOS_TOKEN_ID,
        "eos_token_id": EOS_TOKEN_ID
    });
    std::fs::write(
        dir.join(GENERATION_CONFIG_NAME),
        serde_json::to_string_pretty(&generation_config)?,
    )?;
    write_tokenizer(dir)?;

    let config: HfConfig = serde_json::from_value(config_json)?;
    let zero_centered = arch == Architecture::Gemma;
    let mut rng = StdRng::seed_from_u64(seed);

    let mut tensors = Vec::new();
    for (name, shape) in hf_parameter_shapes(&config)? {
        let tensor = if name.contains("norm.") && name.ends_with(".weight") {
            let center = if zero_centered { 0.0 } else { 1.0 };
            Tensor::random(shape, center, 0.1, &mut rng)
        } else if shape.len() == 2 {
            let spread = 1.0 / (shape[1] as f32).sqrt();
            Tensor::random(shape, 0.0, spread, &mut rng)
        } else {
            Tensor::random(shape, 0.0, 0.1, &mut rng)
        };
        let bytes: Vec<u8> = tensor.data().iter().flat_map(|v| v.to_le_bytes()).collect();
        tensors.push((name, tensor.shape().to_vec(), bytes));
    }

    let views = tensors
        .iter()
        .map(|(name, shape, bytes)| {
            TensorView::new(Dtype::F32, shape.clone(), bytes).map(|view| (name.clone(), view))
        })
        .collect::<std::result::Result<Vec<_>, _>>()?;
    safetensors::serialize_to_file(views, &None, &dir.join(WEIGHTS_NAME))?;

    tracing::debug!(dir = %dir.display(), ?arch, "Wrote tiny checkpoint");
    Ok(())
}
