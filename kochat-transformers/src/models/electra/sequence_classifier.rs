use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::BoxedError;
use crate::layers::activation::Activation;
use crate::layers::attention::{AttentionHeads, QkvMode, SDPAConfig, SelfAttentionConfig};
use crate::layers::dropout::DropoutConfig;
use crate::layers::feedforward::PointwiseFeedForwardConfig;
use crate::layers::layer_norm::LayerNormConfig;
use crate::layers::transformer::{TransformerEmbeddingsConfig, TransformerLayerConfig};
use crate::models::hf::FromHF;
use crate::models::transformer::{
    ClassificationHeadConfig, TransformerEncoderConfig, TransformerSequenceClassifier,
    TransformerSequenceClassifierConfig,
};

/// ELECTRA sequence classifier (Clark et al., 2020).
///
/// See [ELECTRA: Pre-training Text Encoders as Discriminators Rather Than Generators](https://arxiv.org/abs/2003.10555).
pub struct ElectraSequenceClassifier;

fn default_id2label() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("0".to_string(), "LABEL_0".to_string()),
        ("1".to_string(), "LABEL_1".to_string()),
    ])
}

fn default_layer_norm_eps() -> f64 {
    1e-12
}

/// HF ELECTRA sequence classifier configuration.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct HFElectraSequenceClassifierConfig {
    attention_probs_dropout_prob: f32,
    #[serde(default)]
    classifier_dropout: Option<f32>,
    embedding_size: usize,
    hidden_act: Activation,
    hidden_dropout_prob: f32,
    hidden_size: usize,
    #[serde(default = "default_id2label")]
    id2label: BTreeMap<String, String>,
    intermediate_size: usize,
    #[serde(default = "default_layer_norm_eps")]
    layer_norm_eps: f64,
    max_position_embeddings: usize,
    num_attention_heads: usize,
    num_hidden_layers: usize,
    type_vocab_size: usize,
    vocab_size: usize,
}

impl TryFrom<HFElectraSequenceClassifierConfig> for TransformerSequenceClassifierConfig {
    type Error = BoxedError;

    fn try_from(hf_config: HFElectraSequenceClassifierConfig) -> Result<Self, Self::Error> {
        let attention_probs_dropout =
            Box::new(DropoutConfig::default().p(hf_config.attention_probs_dropout_prob));
        let hidden_dropout = Box::new(DropoutConfig::default().p(hf_config.hidden_dropout_prob));
        let layer_norm = Box::new(
            LayerNormConfig::default()
                .eps(hf_config.layer_norm_eps)
                .size(hf_config.hidden_size),
        );

        // The embeddings are normalized at the embedding width and then
        // projected to the hidden width.
        let embeddings = TransformerEmbeddingsConfig::default()
            .embedding_dropout(hidden_dropout.clone())
            .embedding_layer_norm(Box::new(
                LayerNormConfig::default()
                    .eps(hf_config.layer_norm_eps)
                    .size(hf_config.embedding_size),
            ))
            .embedding_width(hf_config.embedding_size)
            .hidden_width(hf_config.hidden_size)
            .n_pieces(hf_config.vocab_size)
            .n_positions(Some(hf_config.max_position_embeddings))
            .n_types(Some(hf_config.type_vocab_size));

        let attention = SelfAttentionConfig::default()
            .attention_heads(AttentionHeads {
                n_heads: hf_config.num_attention_heads,
                qkv_mode: QkvMode::Separate,
            })
            .attention_scorer(Box::new(
                SDPAConfig::default().dropout(attention_probs_dropout),
            ))
            .dropout(hidden_dropout.clone())
            .hidden_width(hf_config.hidden_size);

        let feedforward = PointwiseFeedForwardConfig::default()
            .activation(Box::new(hf_config.hidden_act))
            .dropout(hidden_dropout)
            .hidden_width(hf_config.hidden_size)
            .intermediate_width(hf_config.intermediate_size);

        let layer = TransformerLayerConfig::default()
            .attention(attention)
            .attn_residual_layer_norm(layer_norm.clone())
            .feedforward(feedforward)
            .ffn_residual_layer_norm(layer_norm);

        let encoder = TransformerEncoderConfig::default()
            .embeddings(Box::new(embeddings))
            .layer(Box::new(layer))
            .n_hidden_layers(hf_config.num_hidden_layers);

        let classifier_dropout = hf_config
            .classifier_dropout
            .unwrap_or(hf_config.hidden_dropout_prob);
        let head = ClassificationHeadConfig::default()
            .activation(Box::new(Activation::Gelu))
            .dropout(Box::new(DropoutConfig::default().p(classifier_dropout)))
            .hidden_width(hf_config.hidden_size)
            .n_labels(hf_config.id2label.len());

        Ok(Self::default().encoder(Box::new(encoder)).head(head))
    }
}

/// Rename an ELECTRA classifier parameter to its Hugging Face name.
fn rename_parameter(name: &str) -> String {
    if let Some(suffix) = name.strip_prefix("classifier.output") {
        return format!("classifier.out_proj{suffix}");
    }
    if name.starts_with("classifier.") {
        return name.to_string();
    }

    let mut name = format!(
        "electra.{}",
        name.strip_prefix("encoder.").unwrap_or(name)
    );

    // Embeddings
    name = name.replace("embeddings.projection", "embeddings_project");
    name = name.replace("piece_embeddings", "word_embeddings");
    name = name.replace("type_embeddings", "token_type_embeddings");
    name = name.replace("embedding_layer_norm", "LayerNorm");

    // Layers
    static LAYER_RE: OnceLock<Regex> = OnceLock::new();
    let layer_re = LAYER_RE.get_or_init(|| Regex::new(r"layer_(\d+)").expect("Invalid regex"));
    name = layer_re.replace(&name, "encoder.layer.$1").to_string();

    // Attention layer.
    name = name.replace("attention.output", "attention.output.dense");
    name = name.replace("attention.query", "attention.self.query");
    name = name.replace("attention.key", "attention.self.key");
    name = name.replace("attention.value", "attention.self.value");
    name = name.replace("attn_residual_layer_norm", "attention.output.LayerNorm");

    // Feed-forward layer.
    name = name.replace("ffn.intermediate", "intermediate.dense");
    name = name.replace("ffn.output", "output.dense");
    name = name.replace("ffn_residual_layer_norm", "output.LayerNorm");

    name
}

impl FromHF for ElectraSequenceClassifier {
    type Config = TransformerSequenceClassifierConfig;

    type HFConfig = HFElectraSequenceClassifierConfig;

    type Model = TransformerSequenceClassifier;

    fn rename_parameters() -> impl Fn(&str) -> String + Send + Sync + 'static {
        rename_parameter
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use candle_core::{DType, Device, Tensor};
    use candle_nn::{VarBuilder, VarMap};
    use rstest::rstest;
    use snafu::{report, FromString, ResultExt, Whatever};

    use super::rename_parameter;
    use crate::architectures::{BuildArchitecture, SequenceClassifier};
    use crate::layers::attention::AttentionMask;
    use crate::models::electra::ElectraSequenceClassifier;
    use crate::models::hf::{FromHF, FromHFHub, HFConfigWithDType};
    use crate::models::util::tests::TINY_ELECTRA_CONFIG;

    #[rstest]
    #[case(
        "encoder.embeddings.piece_embeddings.weight",
        "electra.embeddings.word_embeddings.weight"
    )]
    #[case(
        "encoder.embeddings.type_embeddings.weight",
        "electra.embeddings.token_type_embeddings.weight"
    )]
    #[case(
        "encoder.embeddings.embedding_layer_norm.bias",
        "electra.embeddings.LayerNorm.bias"
    )]
    #[case(
        "encoder.embeddings.projection.weight",
        "electra.embeddings_project.weight"
    )]
    #[case(
        "encoder.layer_10.attention.query.weight",
        "electra.encoder.layer.10.attention.self.query.weight"
    )]
    #[case(
        "encoder.layer_0.attention.output.bias",
        "electra.encoder.layer.0.attention.output.dense.bias"
    )]
    #[case(
        "encoder.layer_0.attn_residual_layer_norm.weight",
        "electra.encoder.layer.0.attention.output.LayerNorm.weight"
    )]
    #[case(
        "encoder.layer_0.ffn.intermediate.weight",
        "electra.encoder.layer.0.intermediate.dense.weight"
    )]
    #[case(
        "encoder.layer_0.ffn.output.weight",
        "electra.encoder.layer.0.output.dense.weight"
    )]
    #[case(
        "encoder.layer_0.ffn_residual_layer_norm.bias",
        "electra.encoder.layer.0.output.LayerNorm.bias"
    )]
    #[case("classifier.dense.weight", "classifier.dense.weight")]
    #[case("classifier.output.bias", "classifier.out_proj.bias")]
    fn renames_to_hf_parameters(#[case] name: &str, #[case] hf_name: &str) {
        assert_eq!(rename_parameter(name), hf_name);
    }

    #[test]
    #[report]
    fn loads_classifier_with_embedding_projection() -> Result<(), Whatever> {
        let device = Device::Cpu;
        let hf_config: HFConfigWithDType<_> = serde_json::from_str(TINY_ELECTRA_CONFIG)
            .whatever_context("Cannot parse configuration")?;

        // Random parameters under their Hugging Face names.
        let var_map = VarMap::new();
        let rename = ElectraSequenceClassifier::rename_parameters();
        let config = ElectraSequenceClassifier::config(&hf_config)
            .whatever_context("Cannot convert configuration")?;
        config
            .build(VarBuilder::from_varmap(&var_map, DType::F32, &device))
            .map_err(|e| Whatever::with_source(e, "Cannot build model".to_string()))?;
        let checkpoint = var_map
            .data()
            .lock()
            .map_err(|_| Whatever::without_source("Cannot lock variables".to_string()))?
            .iter()
            .map(|(name, var)| (rename(name), var.as_tensor().clone()))
            .collect::<HashMap<_, _>>();
        assert!(checkpoint.contains_key("electra.embeddings_project.weight"));
        assert!(checkpoint.contains_key("classifier.out_proj.weight"));

        let classifier =
            ElectraSequenceClassifier::from_hf(hf_config, Box::new(checkpoint), &device)
                .whatever_context("Cannot load classifier")?;

        let piece_ids = Tensor::new(&[[2u32, 11, 12, 3]], &device)
            .whatever_context("Cannot create piece ids")?;
        let mask = AttentionMask::from_lengths(&[4], 4, &device)
            .whatever_context("Cannot create mask")?;
        let output = classifier
            .forward_t(&piece_ids, &mask, None, None, false)
            .map_err(|e| Whatever::with_source(e, "Cannot classify".to_string()))?;

        assert_eq!(output.logits().dims(), &[1, 7]);

        Ok(())
    }

    #[test]
    #[ignore = "downloads the sentiment classifier from Hugging Face Hub"]
    #[report]
    fn sentiment_classifier_loads_from_hub() -> Result<(), Whatever> {
        let device = Device::Cpu;
        let classifier =
            ElectraSequenceClassifier::from_hf_hub("JasonJeon/KcElectra_sentiment", None, &device)
                .whatever_context("Cannot load classifier")?;

        let piece_ids =
            Tensor::new(&[[2u32, 4027, 3]], &device).whatever_context("Cannot create input")?;
        let mask = AttentionMask::from_lengths(&[3], 3, &device)
            .whatever_context("Cannot create mask")?;
        let output = classifier
            .forward_t(&piece_ids, &mask, None, None, false)
            .map_err(|e| Whatever::with_source(e, "Cannot classify".to_string()))?;

        assert_eq!(output.logits().dims(), &[1, 7]);

        Ok(())
    }
}
