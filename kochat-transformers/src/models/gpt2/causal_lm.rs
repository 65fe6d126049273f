use serde::{Deserialize, Serialize};

use crate::error::BoxedError;
use crate::models::gpt2::decoder::{is_conv1d_weight, rename_decoder_parameter};
use crate::models::gpt2::HFGPT2DecoderConfig;
use crate::models::hf::FromHF;
use crate::models::transformer::{
    TransformerCausalLM, TransformerCausalLMConfig, TransformerDecoderConfig,
};

/// GPT-2 causal language model (Radford et al., 2019).
///
/// The output embeddings are tied to the piece embeddings when the
/// configuration asks for it (the default), the checkpoint's `lm_head`
/// is not used in that case.
///
/// See: [Language Models are Unsupervised Multitask Learners](https://cdn.openai.com/better-language-models/language_models_are_unsupervised_multitask_learners.pdf)
pub struct GPT2CausalLM;

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct HFGPT2CausalLMConfig {
    #[serde(flatten)]
    decoder: HFGPT2DecoderConfig,
}

impl TryFrom<HFGPT2CausalLMConfig> for TransformerCausalLMConfig {
    type Error = BoxedError;

    fn try_from(config: HFGPT2CausalLMConfig) -> Result<Self, Self::Error> {
        Ok(Self::default()
            .hidden_size(config.decoder.n_embd)
            // Input and output vocab sizes are the same.
            .n_pieces(config.decoder.vocab_size)
            .tie_embeddings(config.decoder.tie_word_embeddings)
            .decoder(Box::new(TransformerDecoderConfig::try_from(
                config.decoder,
            )?)))
    }
}

impl FromHF for GPT2CausalLM {
    type Config = TransformerCausalLMConfig;

    type HFConfig = HFGPT2CausalLMConfig;

    type Model = TransformerCausalLM;

    fn rename_parameters() -> impl Fn(&str) -> String + Send + Sync + 'static {
        |name| match name.strip_prefix("output_embeddings") {
            Some(suffix) => format!("lm_head{suffix}"),
            None => rename_decoder_parameter(name),
        }
    }

    fn transpose_parameters() -> impl Fn(&str) -> bool + Send + Sync + 'static {
        is_conv1d_weight
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use candle_core::{DType, Device, Tensor};
    use candle_nn::{VarBuilder, VarMap};
    use snafu::{report, FromString, ResultExt, Whatever};

    use crate::architectures::{BuildArchitecture, CausalLM};
    use crate::kv_cache::KeyValueCache;
    use crate::layers::attention::AttentionMask;
    use crate::models::gpt2::GPT2CausalLM;
    use crate::models::hf::{FromHF, FromHFHub, HFConfigWithDType};
    use crate::models::util::tests::{tiny_causal_lm_config, TINY_GPT2_CONFIG};
    use crate::util::tests::assert_tensor_eq;

    /// Store the parameters of a model in the Hugging Face GPT-2 layout.
    fn to_hf_checkpoint(var_map: &VarMap) -> Result<HashMap<String, Tensor>, Whatever> {
        let rename = GPT2CausalLM::rename_parameters();
        let transpose = GPT2CausalLM::transpose_parameters();
        let vars = var_map
            .data()
            .lock()
            .map_err(|_| Whatever::without_source("Cannot lock variables".to_string()))?;
        vars.iter()
            .map(|(name, var)| {
                let tensor = if transpose(name) {
                    var.as_tensor()
                        .t()
                        .and_then(|xs| xs.contiguous())
                        .whatever_context("Cannot transpose parameter")?
                } else {
                    var.as_tensor().copy().whatever_context("Cannot copy parameter")?
                };
                Ok((rename(name), tensor))
            })
            .collect()
    }

    #[test]
    #[report]
    fn trainable_model_loads_hf_parameters() -> Result<(), Whatever> {
        let device = Device::Cpu;

        // Reference model with random parameters.
        let reference_vars = VarMap::new();
        let reference = tiny_causal_lm_config()
            .tie_embeddings(true)
            .build(VarBuilder::from_varmap(&reference_vars, DType::F32, &device))
            .map_err(|e| Whatever::with_source(e, "Cannot build model".to_string()))?;
        let checkpoint = to_hf_checkpoint(&reference_vars)?;
        assert!(checkpoint.contains_key("transformer.h.1.attn.c_attn.weight"));
        assert!(checkpoint.contains_key("transformer.ln_f.bias"));

        let hf_config: HFConfigWithDType<_> = serde_json::from_str(TINY_GPT2_CONFIG)
            .whatever_context("Cannot parse configuration")?;
        let trainable = GPT2CausalLM::from_hf_trainable(
            hf_config,
            Box::new(checkpoint),
            &device,
        )
        .whatever_context("Cannot load model")?;

        let piece_ids = Tensor::new(&[[3u32, 1, 4, 1, 5]], &device)
            .whatever_context("Cannot create piece ids")?;
        let mask = AttentionMask::from_lengths(&[5], 5, &device)
            .whatever_context("Cannot create mask")?;
        let expected = reference
            .forward_t(&piece_ids, &mask, &mut KeyValueCache::no_cache(), None, false)
            .map_err(|e| Whatever::with_source(e, "Cannot decode input".to_string()))?;
        let output = trainable
            .model
            .forward_t(&piece_ids, &mask, &mut KeyValueCache::no_cache(), None, false)
            .map_err(|e| Whatever::with_source(e, "Cannot decode input".to_string()))?;

        assert_tensor_eq!(
            output.logits().clone(),
            expected.logits().clone(),
            epsilon = 1e-5,
        );

        Ok(())
    }

    #[test]
    #[ignore = "downloads KoGPT-2 from Hugging Face Hub"]
    #[report]
    fn kogpt2_loads_from_hub() -> Result<(), Whatever> {
        let device = Device::Cpu;
        let causal_lm = GPT2CausalLM::from_hf_hub("skt/kogpt2-base-v2", None, &device)
            .whatever_context("Cannot load model")?;

        let piece_ids =
            Tensor::new(&[[0u32, 9080, 7182]], &device).whatever_context("Cannot create input")?;
        let mask = AttentionMask::from_lengths(&[3], 3, &device)
            .whatever_context("Cannot create mask")?;
        let output = causal_lm
            .forward_t(&piece_ids, &mask, &mut KeyValueCache::no_cache(), None, false)
            .map_err(|e| Whatever::with_source(e, "Cannot decode input".to_string()))?;

        assert_eq!(output.logits().dims(), &[1, 3, 51200]);

        Ok(())
    }
}
