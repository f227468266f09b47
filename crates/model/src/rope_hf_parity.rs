//! HuggingFace parity tests for RoPE
//!
//! These tests check the tables and rotation against the algorithm used by
//! `transformers.models.llama.modeling_llama.LlamaRotaryEmbedding` and Phi's
//! partial rotary variant.

#[cfg(test)]
mod tests {
    use crate::rope::{apply_rope_head, rotary_dim, RopeFrequencies};

    /// HF computes: inv_freq = 1.0 / (base ** (torch.arange(0, dim, 2) / dim))
    #[test]
    fn test_inverse_frequencies_match_hf() {
        // TinyLlama: head_dim=64, theta=10000.0
        let head_dim = 64;
        let theta = 10000.0f64;
        let freqs = RopeFrequencies::new(head_dim, 128, theta);

        let (cos_pos1, _) = freqs.get(1).unwrap();
        for i in 0..head_dim / 2 {
            let inv_freq = 1.0 / theta.powf((2 * i) as f64 / head_dim as f64);
            let diff = (cos_pos1[i] as f64 - inv_freq.cos()).abs();
            assert!(diff < 1e-7, "Inverse freq mismatch at index {}", i);
        }
    }

    /// HF does:
    ///   rotate_half(x) = cat([-x[half:], x[:half]])
    ///   q_embed = q * cos + rotate_half(q) * sin
    #[test]
    fn test_rope_rotation_matches_hf_pattern() {
        let freqs = RopeFrequencies::new(4, 128, 10000.0);
        let q = vec![1.0f32, 2.0, 3.0, 4.0];
        let (cos, sin) = freqs.get(5).unwrap();

        let mut output = q.clone();
        apply_rope_head(&mut output, cos, sin);

        let half = 2;
        for i in 0..half {
            let hf_out_i = q[i] * cos[i] + (-q[i + half]) * sin[i];
            let hf_out_i_plus_half = q[i + half] * cos[i] + q[i] * sin[i];
            assert!((output[i] - hf_out_i).abs() < 1e-6);
            assert!((output[i + half] - hf_out_i_plus_half).abs() < 1e-6);
        }
    }

    /// Phi-2: head_dim=80, partial_rotary_factor=0.4 -> rotary_ndims=32
    #[test]
    fn test_phi2_partial_rotary_dims() {
        assert_eq!(rotary_dim(80, 0.4), 32);
        assert_eq!(rotary_dim(64, 1.0), 64);
        // Gemma 2B
        assert_eq!(rotary_dim(256, 1.0), 256);
    }

    #[test]
    fn test_unit_circle_across_range() {
        let freqs = RopeFrequencies::new(64, 2048, 10000.0);
        for pos in [0, 1, 10, 100, 1000, 2047] {
            let (cos, sin) = freqs.get(pos).unwrap();
            for i in 0..32 {
                let sum_squares = cos[i] * cos[i] + sin[i] * sin[i];
                assert!(
                    (sum_squares - 1.0).abs() < 1e-6,
                    "cos^2 + sin^2 != 1 at pos={}, i={}",
                    pos,
                    i
                );
            }
        }
    }

    #[test]
    fn test_reference_values() {
        let freqs = RopeFrequencies::new(64, 2048, 10000.0);
        let (cos5, sin5) = freqs.get(5).unwrap();

        // Dimension 0: freq = 1.0, angle = 5.0
        assert!((cos5[0] as f64 - 5.0f64.cos()).abs() < 1e-7);
        assert!((sin5[0] as f64 - 5.0f64.sin()).abs() < 1e-7);

        let inv_freq_1 = 1.0 / 10000.0f64.powf(2.0 / 64.0);
        assert!((cos5[1] as f64 - (5.0 * inv_freq_1).cos()).abs() < 1e-7);
        assert!((sin5[1] as f64 - (5.0 * inv_freq_1).sin()).abs() < 1e-7);
    }

    /// dot(RoPE(q, m), RoPE(k, n)) depends only on m - n
    #[test]
    fn test_relative_position_property() {
        let freqs = RopeFrequencies::new(4, 128, 10000.0);
        let q = vec![1.0f32, 0.5, 0.3, 0.2];
        let k = vec![0.8f32, 0.4, 0.6, 0.1];

        let mut dots = Vec::new();
        for (pos_q, pos_k) in [(5, 3), (10, 8), (20, 18)] {
            let (cos_q, sin_q) = freqs.get(pos_q).unwrap();
            let (cos_k, sin_k) = freqs.get(pos_k).unwrap();
            let mut q_rot = q.clone();
            let mut k_rot = k.clone();
            apply_rope_head(&mut q_rot, cos_q, sin_q);
            apply_rope_head(&mut k_rot, cos_k, sin_k);
            dots.push(q_rot.iter().zip(&k_rot).map(|(a, b)| a * b).sum::<f32>());
        }

        for i in 1..dots.len() {
            assert!(
                (dots[0] - dots[i]).abs() < 1e-5,
                "Relative position property violated: dot[0]={}, dot[{}]={}",
                dots[0],
                i,
                dots[i]
            );
        }
    }
}
