//! Mapping from HuggingFace checkpoint names to the reauthored state dict
//!
//! Names are module prefixes (without `.weight` / `.bias`); `{}` stands for
//! the layer index.

use crate::error::{ModelError, Result};
use crate::loader::SafetensorsLoader;
use crate::model_config::{
    AttentionConfig, FeedForwardType, ModelConfig, NormalizationConfig, NormalizationType,
};
use crate::tensor::{StateDict, Tensor};
use crate::transformer::{block_param, EMBEDDING, FINAL_NORM, LM_HEAD};

/// Where a checkpoint keeps the attention input projections
#[derive(Debug, Clone, Copy)]
pub enum AttentionNames {
    /// Separate q, k and v projections
    Separate {
        q: &'static str,
        k: &'static str,
        v: &'static str,
    },
    /// One projection with all q heads, then all k heads, then all v heads
    Fused { qkv: &'static str },
}

/// Where a checkpoint keeps the feed-forward input projections
#[derive(Debug, Clone, Copy)]
pub enum FeedForwardNames {
    Gated { gate: &'static str, up: &'static str },
    /// One projection with gate rows followed by up rows
    FusedGated { gate_up: &'static str },
    Sequential { up: &'static str },
}

#[derive(Debug, Clone, Copy)]
pub struct TensorNames {
    pub embedding: &'static str,
    pub attn_norm: &'static str,
    pub attn: AttentionNames,
    pub attn_output: &'static str,
    pub query_norm: Option<&'static str>,
    pub key_norm: Option<&'static str>,
    /// Absent for parallel-residual blocks
    pub ff_norm: Option<&'static str>,
    pub ff: FeedForwardNames,
    pub ff_down: &'static str,
    pub final_norm: &'static str,
    /// Absent when the head is tied to the embedding
    pub lm_head: Option<&'static str>,
}

fn layer(template: &str, idx: usize) -> String {
    template.replace("{}", &idx.to_string())
}

struct Mapper<'a> {
    loader: &'a SafetensorsLoader,
    state_dict: StateDict,
}

impl Mapper<'_> {
    fn copy(&mut self, src: &str, dst: String, shape: &[usize]) -> Result<()> {
        let tensor = self.loader.load_with_shape(src, shape)?;
        self.state_dict.insert(dst, tensor);
        Ok(())
    }

    fn norm(
        &mut self,
        src: &str,
        dst: String,
        config: &NormalizationConfig,
        dim: usize,
    ) -> Result<()> {
        self.copy(&format!("{src}.weight"), format!("{dst}.weight"), &[dim])?;
        if config.kind == NormalizationType::LayerNorm && config.use_bias {
            self.copy(&format!("{src}.bias"), format!("{dst}.bias"), &[dim])?;
        }
        Ok(())
    }

    fn linear(
        &mut self,
        src: &str,
        dst: String,
        out_features: usize,
        in_features: usize,
        use_bias: bool,
    ) -> Result<()> {
        self.copy(&format!("{src}.weight"), format!("{dst}.weight"), &[out_features, in_features])?;
        if use_bias {
            self.copy(&format!("{src}.bias"), format!("{dst}.bias"), &[out_features])?;
        }
        Ok(())
    }
}

/// Interleave separate q, k and v tensors into per-group `[q..., k, v]` order
///
/// Works on weights (`[rows, in]`) and biases (`[rows]`) alike.
pub fn fuse_qkv(attn: &AttentionConfig, q: &Tensor, k: &Tensor, v: &Tensor) -> Result<Tensor> {
    let head_dim = attn.head_dim;
    let q_per_group = attn.heads_per_group() * head_dim;
    let mut parts = Vec::with_capacity(attn.num_query_groups * 3);
    for g in 0..attn.num_query_groups {
        parts.push(q.slice_rows(g * q_per_group, (g + 1) * q_per_group));
        parts.push(k.slice_rows(g * head_dim, (g + 1) * head_dim));
        parts.push(v.slice_rows(g * head_dim, (g + 1) * head_dim));
    }
    let refs: Vec<&Tensor> = parts.iter().collect();
    Tensor::concat_rows(&refs)
}

/// Split a `[q_heads | k_heads | v_heads]` projection into its three parts
fn split_qkv(attn: &AttentionConfig, fused: &Tensor) -> Result<(Tensor, Tensor, Tensor)> {
    let q_rows = attn.num_heads * attn.head_dim;
    let kv_rows = attn.num_query_groups * attn.head_dim;
    if fused.rows() != q_rows + 2 * kv_rows {
        return Err(ModelError::InvalidShape {
            name: "fused qkv".into(),
            expected: vec![q_rows + 2 * kv_rows],
            got: fused.shape().to_vec(),
        });
    }
    Ok((
        fused.slice_rows(0, q_rows),
        fused.slice_rows(q_rows, q_rows + kv_rows),
        fused.slice_rows(q_rows + kv_rows, q_rows + 2 * kv_rows),
    ))
}

/// Load a checkpoint into the reauthored state dict of `config`
pub fn load_state_dict(
    loader: &SafetensorsLoader,
    names: &TensorNames,
    config: &ModelConfig,
) -> Result<StateDict> {
    let dim = config.embedding_dim;
    let mut mapper = Mapper {
        loader,
        state_dict: StateDict::new(),
    };

    mapper.copy(
        &format!("{}.weight", names.embedding),
        format!("{EMBEDDING}.weight"),
        &[config.vocab_size, dim],
    )?;

    for (idx, block) in config.block_configs.iter().enumerate() {
        let attn = &block.attn;
        let ff = &block.ff;

        mapper.norm(
            &layer(names.attn_norm, idx),
            block_param(idx, "pre_atten_norm"),
            &block.pre_attention_norm,
            dim,
        )?;

        let mut suffixes = vec!["weight"];
        if attn.qkv_use_bias {
            suffixes.push("bias");
        }
        for suffix in suffixes {
            let (q, k, v) = match names.attn {
                AttentionNames::Separate { q, k, v } => (
                    loader.load(&format!("{}.{suffix}", layer(q, idx)))?,
                    loader.load(&format!("{}.{suffix}", layer(k, idx)))?,
                    loader.load(&format!("{}.{suffix}", layer(v, idx)))?,
                ),
                AttentionNames::Fused { qkv } => {
                    split_qkv(attn, &loader.load(&format!("{}.{suffix}", layer(qkv, idx)))?)?
                }
            };
            let fused = fuse_qkv(attn, &q, &k, &v)?;
            let name = block_param(idx, &format!("atten_func.qkv_projection.{suffix}"));
            let expected = if suffix == "weight" {
                vec![attn.qkv_dim(), dim]
            } else {
                vec![attn.qkv_dim()]
            };
            fused.expect_shape(&name, &expected)?;
            mapper.state_dict.insert(name, fused);
        }

        mapper.linear(
            &layer(names.attn_output, idx),
            block_param(idx, "atten_func.output_projection"),
            dim,
            attn.num_heads * attn.head_dim,
            attn.output_proj_use_bias,
        )?;

        if let (Some(norm), Some(src)) = (&attn.query_norm, names.query_norm) {
            let dst = block_param(idx, "atten_func.query_norm");
            mapper.norm(&layer(src, idx), dst, norm, attn.head_dim)?;
        }
        if let (Some(norm), Some(src)) = (&attn.key_norm, names.key_norm) {
            let dst = block_param(idx, "atten_func.key_norm");
            mapper.norm(&layer(src, idx), dst, norm, attn.head_dim)?;
        }
        if let (Some(norm), Some(src)) = (&block.post_attention_norm, names.ff_norm) {
            mapper.norm(&layer(src, idx), block_param(idx, "post_atten_norm"), norm, dim)?;
        }

        let inter = ff.intermediate_size;
        match (names.ff, ff.kind) {
            (FeedForwardNames::Gated { gate, up }, FeedForwardType::Gated) => {
                let dst = block_param(idx, "ff.w1");
                mapper.linear(&layer(gate, idx), dst, inter, dim, ff.use_bias)?;
                mapper.linear(&layer(up, idx), block_param(idx, "ff.w3"), inter, dim, ff.use_bias)?;
            }
            (FeedForwardNames::FusedGated { gate_up }, FeedForwardType::Gated) => {
                let fused_name = format!("{}.weight", layer(gate_up, idx));
                let fused = loader.load_with_shape(&fused_name, &[2 * inter, dim])?;
                mapper
                    .state_dict
                    .insert(block_param(idx, "ff.w1.weight"), fused.slice_rows(0, inter));
                mapper
                    .state_dict
                    .insert(block_param(idx, "ff.w3.weight"), fused.slice_rows(inter, 2 * inter));
                if ff.use_bias {
                    let bias_name = format!("{}.bias", layer(gate_up, idx));
                    let bias = loader.load_with_shape(&bias_name, &[2 * inter])?;
                    mapper
                        .state_dict
                        .insert(block_param(idx, "ff.w1.bias"), bias.slice_rows(0, inter));
                    mapper
                        .state_dict
                        .insert(block_param(idx, "ff.w3.bias"), bias.slice_rows(inter, 2 * inter));
                }
            }
            (FeedForwardNames::Sequential { up }, FeedForwardType::Sequential) => {
                mapper.linear(&layer(up, idx), block_param(idx, "ff.w1"), inter, dim, ff.use_bias)?;
            }
            (names, kind) => {
                return Err(ModelError::Config(format!(
                    "feed-forward names {names:?} do not fit a {kind:?} block"
                )))
            }
        }
        let dst = block_param(idx, "ff.w2");
        mapper.linear(&layer(names.ff_down, idx), dst, dim, inter, ff.use_bias)?;
    }

    mapper.norm(names.final_norm, FINAL_NORM.to_string(), &config.final_norm, dim)?;

    if !config.lm_head_share_weight_with_embedding || config.lm_head_use_bias {
        let src = names
            .lm_head
            .ok_or_else(|| ModelError::Config("checkpoint has no lm_head mapping".into()))?;
        if !config.lm_head_share_weight_with_embedding {
            mapper.copy(
                &format!("{src}.weight"),
                format!("{LM_HEAD}.weight"),
                &[config.vocab_size, dim],
            )?;
        }
        if config.lm_head_use_bias {
            mapper.copy(&format!("{src}.bias"), format!("{LM_HEAD}.bias"), &[config.vocab_size])?;
        }
    }

    tracing::debug!(tensors = mapper.state_dict.len(), "Mapped checkpoint to reauthored names");
    Ok(mapper.state_dict)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attn(num_heads: usize, groups: usize, head_dim: usize) -> AttentionConfig {
        AttentionConfig {
            num_heads,
            head_dim,
            num_query_groups: groups,
            rotary_percentage: 1.0,
            rotary_base: 10000.0,
            qkv_use_bias: false,
            output_proj_use_bias: false,
            query_norm: None,
            key_norm: None,
        }
    }

    fn rows(values: &[f32], width: usize) -> Tensor {
        let data: Vec<f32> = values
            .iter()
            .flat_map(|v| std::iter::repeat(*v).take(width))
            .collect();
        Tensor::new(data, vec![values.len(), width]).unwrap()
    }

    #[test]
    fn test_fuse_qkv_groups_queries_with_their_kv_head() {
        // 4 query heads, 2 groups, head_dim 1: q rows 0..4, k rows 10..12, v rows 20..22
        let config = attn(4, 2, 1);
        let q = rows(&[0.0, 1.0, 2.0, 3.0], 2);
        let k = rows(&[10.0, 11.0], 2);
        let v = rows(&[20.0, 21.0], 2);

        let fused = fuse_qkv(&config, &q, &k, &v).unwrap();
        assert_eq!(fused.shape(), &[8, 2]);
        let firsts: Vec<f32> = (0..8).map(|r| fused.row(r)[0]).collect();
        assert_eq!(firsts, vec![0.0, 1.0, 10.0, 20.0, 2.0, 3.0, 11.0, 21.0]);
    }

    #[test]
    fn test_fuse_qkv_bias() {
        let config = attn(2, 2, 2);
        let q = Tensor::new(vec![0.0, 1.0, 2.0, 3.0], vec![4]).unwrap();
        let k = Tensor::new(vec![4.0, 5.0, 6.0, 7.0], vec![4]).unwrap();
        let v = Tensor::new(vec![8.0, 9.0, 10.0, 11.0], vec![4]).unwrap();
        let fused = fuse_qkv(&config, &q, &k, &v).unwrap();
        assert_eq!(fused.shape(), &[12]);
        assert_eq!(
            fused.data(),
            &[0.0, 1.0, 4.0, 5.0, 8.0, 9.0, 2.0, 3.0, 6.0, 7.0, 10.0, 11.0]
        );
    }

    #[test]
    fn test_split_qkv() {
        let config = attn(2, 1, 1);
        let fused = rows(&[0.0, 1.0, 2.0, 3.0], 1);
        let (q, k, v) = split_qkv(&config, &fused).unwrap();
        assert_eq!(q.data(), &[0.0, 1.0]);
        assert_eq!(k.data(), &[2.0]);
        assert_eq!(v.data(), &[3.0]);
        assert!(split_qkv(&attn(4, 1, 1), &fused).is_err());
    }
}
