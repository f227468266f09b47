//! Export and reload of tiny checkpoints

use std::path::Path;

use edgelm_convert::{
    convert_to_bundle, export_model, EdgeBundle, ExportConfig, QuantScheme, DECODE_SIGNATURE,
    PREFILL_SIGNATURE,
};
use edgelm_harness::{max_abs_diff, verify_with_input_ids};
use edgelm_model::families::{self, phi2};
use edgelm_model::fixtures::{self, ALL_ARCHITECTURES};
use edgelm_model::{Architecture, CausalLm, ReferenceModel};
use safetensors::{Dtype, SafeTensors};

const KV_CACHE_MAX_LEN: usize = 16;
const PREFILL_SEQ_LEN: usize = 8;

fn export_config(quantize: bool) -> ExportConfig {
    ExportConfig {
        prefill_seq_len: PREFILL_SEQ_LEN,
        kv_cache_max_len: KV_CACHE_MAX_LEN,
        quantize,
    }
}

fn checkpoint(arch: Architecture) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    fixtures::write_tiny_checkpoint(dir.path(), arch, 17).unwrap();
    dir
}

#[test]
fn test_f32_bundle_reproduces_logits_exactly() {
    for arch in ALL_ARCHITECTURES {
        let ckpt = checkpoint(arch);
        let out = tempfile::tempdir().unwrap();
        let model = families::build_model(ckpt.path(), KV_CACHE_MAX_LEN).unwrap();
        let path = export_model(&model, &out.path().join("tiny"), &export_config(false)).unwrap();

        let bundle = EdgeBundle::open(&path).unwrap();
        assert_eq!(bundle.model_config(), model.config());
        let restored = bundle.into_model().unwrap();

        let tokens = [1u32, 5, 9, 2];
        let positions = [0, 1, 2, 3];
        let expected = model.forward(&tokens, &positions, model.new_kv_cache()).unwrap();
        let got = restored.forward(&tokens, &positions, restored.new_kv_cache()).unwrap();
        assert_eq!(expected.logits, got.logits, "{arch:?}");
    }
}

#[test]
fn test_quantized_bundle_stays_close() {
    let ckpt = checkpoint(Architecture::Llama);
    let out = tempfile::tempdir().unwrap();
    let model = families::build_model(ckpt.path(), KV_CACHE_MAX_LEN).unwrap();
    let path = export_model(&model, &out.path().join("tiny"), &export_config(true)).unwrap();

    let restored = EdgeBundle::open(&path).unwrap().into_model().unwrap();
    let tokens = [1u32, 3, 4, 5, 6];
    let positions = [0, 1, 2, 3, 4];
    let expected = model.forward(&tokens, &positions, model.new_kv_cache()).unwrap();
    let got = restored.forward(&tokens, &positions, restored.new_kv_cache()).unwrap();
    let diff = max_abs_diff(expected.logits.data(), got.logits.data());
    assert!(diff < 0.25, "max diff {diff}");
}

#[test]
fn test_quantized_weights_stored_as_int8() {
    let ckpt = checkpoint(Architecture::Phi);
    let out = tempfile::tempdir().unwrap();
    let path = convert_to_bundle(
        ckpt.path().to_str().unwrap(),
        phi2::build_model,
        &out.path().join("phi2"),
        &export_config(true),
    )
    .unwrap();
    assert_eq!(
        path.file_name().unwrap().to_str().unwrap(),
        "phi2_q8_seq8_ekv16.safetensors"
    );

    let bytes = std::fs::read(&path).unwrap();
    let tensors = SafeTensors::deserialize(&bytes).unwrap();
    let embedding = tensors.tensor("tok_embedding.weight").unwrap();
    assert_eq!(embedding.dtype(), Dtype::I8);
    let scales = tensors.tensor("tok_embedding.weight.scale").unwrap();
    assert_eq!(scales.dtype(), Dtype::F32);
    assert_eq!(scales.shape(), &[fixtures::VOCAB_SIZE]);
    let final_norm = tensors.tensor("final_norm.weight").unwrap();
    assert_eq!(final_norm.dtype(), Dtype::F32);

    let bundle = EdgeBundle::open(&path).unwrap();
    assert_eq!(bundle.metadata().quantization, QuantScheme::Int8PerChannel);
    assert_eq!(bundle.metadata().format_version, 1);
}

#[test]
fn test_bundle_signatures_drive_prefill_then_decode() {
    let ckpt = checkpoint(Architecture::OpenElm);
    let out = tempfile::tempdir().unwrap();
    let path = convert_to_bundle(
        ckpt.path().to_str().unwrap(),
        families::build_model,
        &out.path().join("openelm"),
        &export_config(false),
    )
    .unwrap();

    let bundle = EdgeBundle::open(&path).unwrap();
    let names: Vec<&str> = bundle.signatures().iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec![PREFILL_SIGNATURE, DECODE_SIGNATURE]);
    assert_eq!(bundle.signature(PREFILL_SIGNATURE).unwrap().seq_len, PREFILL_SEQ_LEN);
    let model = bundle.into_model().unwrap();

    let prompt = [1u32, 7, 8];
    let mut tokens = vec![0u32; PREFILL_SEQ_LEN];
    tokens[..prompt.len()].copy_from_slice(&prompt);
    let positions: Vec<usize> = (0..PREFILL_SEQ_LEN).collect();
    let prefill = model
        .run_signature(PREFILL_SIGNATURE, &tokens, &positions, model.new_kv_cache())
        .unwrap();

    // overwrite the padding slot right after the prompt
    let step = model
        .run_signature(DECODE_SIGNATURE, &[9], &[prompt.len()], prefill.kv_cache)
        .unwrap();

    let reference = ReferenceModel::from_pretrained(ckpt.path()).unwrap();
    let expected = edgelm_model::ReferenceLm::forward(&reference, &[1, 7, 8, 9]).unwrap();
    let diff = max_abs_diff(expected.row(3).unwrap(), step.logits.row(0).unwrap());
    assert!(diff <= 1e-5, "max diff {diff}");

    assert!(model
        .run_signature(DECODE_SIGNATURE, &[9, 10], &[3, 4], model.new_kv_cache())
        .is_err());
    assert!(model
        .run_signature("missing", &[9], &[3], model.new_kv_cache())
        .is_err());
}

#[test]
fn test_unquantized_bundle_passes_logits_check() {
    let ckpt = checkpoint(Architecture::Gemma);
    let out = tempfile::tempdir().unwrap();
    let path = convert_to_bundle(
        ckpt.path().to_str().unwrap(),
        families::build_model,
        &out.path().join("gemma"),
        &export_config(false),
    )
    .unwrap();
    let original = ReferenceModel::from_pretrained(ckpt.path()).unwrap();
    let bundled = EdgeBundle::open(&path).unwrap().into_model().unwrap();
    let matched =
        verify_with_input_ids(&original, &bundled, &[1, 2, 3, 4], KV_CACHE_MAX_LEN, 1e-5).unwrap();
    assert!(matched);
}

#[test]
fn test_export_rejects_mismatched_lengths() {
    let ckpt = checkpoint(Architecture::Llama);
    let out = tempfile::tempdir().unwrap();
    let model = families::build_model(ckpt.path(), KV_CACHE_MAX_LEN).unwrap();

    let wrong_cache = ExportConfig {
        kv_cache_max_len: 32,
        ..export_config(true)
    };
    assert!(export_model(&model, &out.path().join("a"), &wrong_cache).is_err());

    let long_prefill = ExportConfig {
        prefill_seq_len: 17,
        ..export_config(true)
    };
    assert!(convert_to_bundle(
        ckpt.path().to_str().unwrap(),
        families::build_model,
        Path::new("/nonexistent/prefix"),
        &long_prefill,
    )
    .is_err());
}

#[test]
fn test_open_rejects_plain_checkpoint() {
    let ckpt = checkpoint(Architecture::Llama);
    assert!(EdgeBundle::open(ckpt.path().join("model.safetensors")).is_err());
}
