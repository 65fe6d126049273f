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
use crate::models::transformer::{TransformerDecoder, TransformerDecoderConfig};

/// GPT-2 decoder (Radford et al., 2019).
///
/// See: [Language Models are Unsupervised Multitask Learners](https://cdn.openai.com/better-language-models/language_models_are_unsupervised_multitask_learners.pdf)
pub struct GPT2Decoder;

fn default_activation() -> Activation {
    Activation::GeluNew
}

fn default_dropout() -> f32 {
    0.1
}

fn default_layer_norm_epsilon() -> f32 {
    1e-5
}

fn default_tie_word_embeddings() -> bool {
    true
}

/// HF GPT-2 decoder configuration.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct HFGPT2DecoderConfig {
    #[serde(default = "default_activation")]
    pub(crate) activation_function: Activation,
    #[serde(default = "default_dropout")]
    pub(crate) attn_pdrop: f32,
    #[serde(default = "default_dropout")]
    pub(crate) embd_pdrop: f32,
    #[serde(default = "default_layer_norm_epsilon")]
    pub(crate) layer_norm_epsilon: f32,
    pub(crate) n_embd: usize,
    pub(crate) n_head: usize,
    #[serde(default)]
    pub(crate) n_inner: Option<usize>,
    pub(crate) n_layer: usize,
    pub(crate) n_positions: usize,
    #[serde(default = "default_dropout")]
    pub(crate) resid_pdrop: f32,
    #[serde(default = "default_tie_word_embeddings")]
    pub(crate) tie_word_embeddings: bool,
    pub(crate) vocab_size: usize,
}

impl TryFrom<HFGPT2DecoderConfig> for TransformerDecoderConfig {
    type Error = BoxedError;

    fn try_from(hf_config: HFGPT2DecoderConfig) -> Result<Self, Self::Error> {
        let layer_norm = Box::new(
            LayerNormConfig::default()
                .eps(hf_config.layer_norm_epsilon as f64)
                .size(hf_config.n_embd),
        );

        let embeddings = TransformerEmbeddingsConfig::default()
            .embedding_dropout(Box::new(DropoutConfig::default().p(hf_config.embd_pdrop)))
            .embedding_width(hf_config.n_embd)
            .hidden_width(hf_config.n_embd)
            .n_pieces(hf_config.vocab_size)
            .n_positions(Some(hf_config.n_positions));

        let residual_dropout = Box::new(DropoutConfig::default().p(hf_config.resid_pdrop));

        let attention = SelfAttentionConfig::default()
            .attention_heads(AttentionHeads {
                n_heads: hf_config.n_head,
                qkv_mode: QkvMode::MergedSplitAfter,
            })
            .attention_scorer(Box::new(SDPAConfig::default().dropout(Box::new(
                DropoutConfig::default().p(hf_config.attn_pdrop),
            ))))
            .dropout(residual_dropout.clone())
            .hidden_width(hf_config.n_embd)
            .layer_norm(layer_norm.clone());

        let feedforward = PointwiseFeedForwardConfig::default()
            .activation(Box::new(hf_config.activation_function))
            .dropout(residual_dropout)
            .hidden_width(hf_config.n_embd)
            .intermediate_width(hf_config.n_inner.unwrap_or(4 * hf_config.n_embd))
            .layer_norm(layer_norm.clone());

        // GPT-2 normalizes the inputs of the attention and feed-forward
        // blocks, the residual connections are not normalized.
        let layer = TransformerLayerConfig::default()
            .attention(attention)
            .feedforward(feedforward);

        Ok(TransformerDecoderConfig::default()
            .embeddings(embeddings)
            .layer(Box::new(layer))
            .n_hidden_layers(hf_config.n_layer)
            .output_layer_norm(layer_norm))
    }
}

/// Rename a GPT-2 decoder parameter to its Hugging Face name.
pub(crate) fn rename_decoder_parameter(name: &str) -> String {
    let mut name = format!(
        "transformer.{}",
        name.strip_prefix("decoder.").unwrap_or(name)
    );

    // Embeddings.
    name = name.replace("embeddings.piece_embeddings", "wte");
    name = name.replace("embeddings.position_embeddings", "wpe");

    // Attention block.
    name = name.replace("attention.layer_norm", "ln_1");
    name = name.replace("attention.qkv", "attn.c_attn");
    name = name.replace("attention.output", "attn.c_proj");

    // Feed-forward block.
    name = name.replace("ffn.layer_norm", "ln_2");
    name = name.replace("ffn.intermediate", "mlp.c_fc");
    name = name.replace("ffn.output", "mlp.c_proj");

    // Layer norm after all layers.
    name = name.replace("output_layer_norm", "ln_f");

    static LAYER_RE: OnceLock<Regex> = OnceLock::new();
    let layer_re = LAYER_RE.get_or_init(|| Regex::new(r"layer_(\d+)").expect("Invalid regex"));
    layer_re.replace(&name, "h.$1").to_string()
}

/// GPT-2 stores the weights of its affine layers as `(in, out)` matrices.
pub(crate) fn is_conv1d_weight(name: &str) -> bool {
    name.ends_with(".weight")
        && ["attention.qkv", "attention.output", "ffn.intermediate", "ffn.output"]
            .iter()
            .any(|layer| name.contains(layer))
}

impl FromHF for GPT2Decoder {
    type Config = TransformerDecoderConfig;

    type HFConfig = HFGPT2DecoderConfig;

    type Model = TransformerDecoder;

    fn rename_parameters() -> impl Fn(&str) -> String + Send + Sync + 'static {
        rename_decoder_parameter
    }

    fn transpose_parameters() -> impl Fn(&str) -> bool + Send + Sync + 'static {
        is_conv1d_weight
    }
}
