use std::fs;

use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use kochat_transformers::architectures::BuildArchitecture;
use kochat_transformers::models::gpt2::HFGPT2CausalLMConfig;
use kochat_transformers::models::hf::{HFConfigWithDType, TrainableModel};
use kochat_transformers::models::transformer::{TransformerCausalLM, TransformerCausalLMConfig};
use kochat_transformers::repository::LocalRepo;
use kochat_transformers::tokenizers::{FromRepo, HfTokenizer};
use tempfile::TempDir;

/// Word-level tokenizer with the special pieces of the chat format.
pub const TINY_TOKENIZER_JSON: &str = r#"{
    "version": "1.0",
    "truncation": null,
    "padding": null,
    "added_tokens": [
        {"id": 0, "content": "<unk>", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true},
        {"id": 1, "content": "</s>", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true},
        {"id": 2, "content": "<usr>", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true},
        {"id": 3, "content": "<pad>", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true},
        {"id": 4, "content": "<sys>", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true},
        {"id": 5, "content": "<unused0>", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true},
        {"id": 6, "content": "<unused1>", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true}
    ],
    "normalizer": null,
    "pre_tokenizer": {"type": "Whitespace"},
    "post_processor": null,
    "decoder": null,
    "model": {
        "type": "WordLevel",
        "vocab": {
            "<unk>": 0, "</s>": 1, "<usr>": 2, "<pad>": 3, "<sys>": 4, "<unused0>": 5,
            "<unused1>": 6, "0": 7, "1": 8, "2": 9, "안녕": 10, "하세요": 11,
            "반가워요": 12, "오늘": 13, "날씨": 14, "좋아요": 15, "슬퍼요": 16,
            "괜찮아요": 17
        },
        "unk_token": "<unk>"
    }
}"#;

/// GPT-2 configuration with a vocabulary that covers the tiny tokenizer.
pub const TINY_GPT2_CONFIG: &str = r#"{
    "n_embd": 8,
    "n_head": 2,
    "n_layer": 2,
    "n_positions": 16,
    "vocab_size": 32
}"#;

pub fn tiny_tokenizer() -> (TempDir, HfTokenizer) {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("tokenizer.json"), TINY_TOKENIZER_JSON).unwrap();
    let tokenizer = HfTokenizer::from_repo(&LocalRepo::new(dir.path())).unwrap();
    (dir, tokenizer)
}

pub fn tiny_gpt2_hf_config() -> HFConfigWithDType<HFGPT2CausalLMConfig> {
    serde_json::from_str(TINY_GPT2_CONFIG).unwrap()
}

/// Randomly initialized tiny GPT-2 model with trainable parameters.
pub fn tiny_causal_lm(device: &Device) -> TrainableModel<TransformerCausalLM> {
    let hf_config: HFGPT2CausalLMConfig = serde_json::from_str(TINY_GPT2_CONFIG).unwrap();
    let var_map = VarMap::new();
    let model = TransformerCausalLMConfig::try_from(hf_config)
        .unwrap()
        .build(VarBuilder::from_varmap(&var_map, DType::F32, device))
        .unwrap();
    TrainableModel { model, var_map }
}
