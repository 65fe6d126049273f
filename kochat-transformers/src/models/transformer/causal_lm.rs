use candle_core::{Module, Tensor};
use candle_nn::{linear_no_bias, Linear, VarBuilder};
use snafu::{ResultExt, Snafu};

use crate::architectures::BuildArchitecture;
use crate::architectures::{BuildDecoder, CausalLM, CausalLMOutput, Decoder};
use crate::error::BoxedError;
use crate::kv_cache::KeyValueCache;
use crate::layers::attention::AttentionMask;
use crate::models::transformer::{TransformerDecoder, TransformerDecoderConfig};

/// Transformer causal language model configuration.
#[derive(Debug)]
pub struct TransformerCausalLMConfig {
    decoder: Box<dyn BuildDecoder<Decoder = TransformerDecoder>>,
    hidden_size: usize,
    n_pieces: usize,
    tie_embeddings: bool,
}

impl TransformerCausalLMConfig {
    /// Decoder.
    ///
    /// Default: `TransformerDecoderConfig`.
    pub fn decoder(mut self, decoder: Box<dyn BuildDecoder<Decoder = TransformerDecoder>>) -> Self {
        self.decoder = decoder;
        self
    }

    /// Hidden size.
    ///
    /// Default: 768.
    pub fn hidden_size(mut self, hidden_size: usize) -> Self {
        self.hidden_size = hidden_size;
        self
    }

    /// Number of pieces in the output vocabulary.
    ///
    /// Default: 51200.
    pub fn n_pieces(mut self, n_pieces: usize) -> Self {
        self.n_pieces = n_pieces;
        self
    }

    /// Share the output embeddings with the decoder's piece embeddings.
    ///
    /// When enabled, the model has no separate output embedding matrix
    /// and the logits are computed using the transposed piece embeddings.
    ///
    /// Default: false.
    pub fn tie_embeddings(mut self, tie_embeddings: bool) -> Self {
        self.tie_embeddings = tie_embeddings;
        self
    }
}

impl Default for TransformerCausalLMConfig {
    fn default() -> Self {
        Self {
            decoder: Box::<TransformerDecoderConfig>::default(),
            hidden_size: 768,
            n_pieces: 51200,
            tie_embeddings: false,
        }
    }
}

impl BuildArchitecture for TransformerCausalLMConfig {
    type Architecture = TransformerCausalLM;

    fn build(&self, vb: VarBuilder) -> Result<Self::Architecture, BoxedError> {
        let decoder = self
            .decoder
            .build(vb.push_prefix("decoder"))
            .context(BuildDecoderSnafu)?;

        let output_embeddings = if self.tie_embeddings {
            Linear::new(decoder.embeddings().piece_embeddings().clone(), None)
        } else {
            linear_no_bias(
                self.hidden_size,
                self.n_pieces,
                vb.push_prefix("output_embeddings"),
            )
            .context(BuildEmbeddingsSnafu)?
        };

        Ok(TransformerCausalLM {
            decoder,
            output_embeddings,
        })
    }
}

/// `TransformerCausalLM` errors.
#[derive(Debug, Snafu)]
pub enum TransformerCausalLMError {
    #[snafu(display("Cannot build decoder"))]
    BuildDecoder { source: BoxedError },

    #[snafu(display("Cannot build output embeddings"))]
    BuildEmbeddings { source: candle_core::Error },

    #[snafu(display("Nothing to decode, the decoder does not have any layer outputs"))]
    NoLayers,

    #[snafu(display("Cannot compute logits for the output vocabulary"))]
    ComputeLogits { source: candle_core::Error },
}

/// Transformer-based causal language model.
pub struct TransformerCausalLM {
    decoder: TransformerDecoder,
    output_embeddings: Linear,
}

impl TransformerCausalLM {
    /// The decoder of the language model.
    pub fn decoder(&self) -> &TransformerDecoder {
        &self.decoder
    }
}

impl CausalLM for TransformerCausalLM {
    type Cache = KeyValueCache;

    fn forward_t(
        &self,
        piece_ids: &Tensor,
        attention_mask: &AttentionMask,
        cache: &mut Self::Cache,
        positions: Option<&Tensor>,
        train: bool,
    ) -> Result<CausalLMOutput, BoxedError> {
        let decoder_output = self
            .decoder
            .forward_t(piece_ids, attention_mask, cache, positions, train)?;
        let last_layer = decoder_output
            .last_hidden_state()
            .ok_or(TransformerCausalLMError::NoLayers)?;
        let logits = self
            .output_embeddings
            .forward(last_layer)
            .context(ComputeLogitsSnafu)?;

        Ok(CausalLMOutput::new(decoder_output, logits))
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Tensor};
    use candle_nn::{VarBuilder, VarMap};
    use snafu::{report, FromString, ResultExt, Whatever};

    use crate::architectures::{BuildArchitecture, CausalLM};
    use crate::kv_cache::KeyValueCache;
    use crate::layers::attention::AttentionMask;
    use crate::models::util::tests::tiny_causal_lm_config;
    use crate::util::tests::assert_tensor_eq;

    #[test]
    #[report]
    fn tied_causal_lm_has_no_output_embeddings() -> Result<(), Whatever> {
        let device = Device::Cpu;
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &device);
        let causal_lm = tiny_causal_lm_config()
            .tie_embeddings(true)
            .build(vb)
            .map_err(|e| Whatever::with_source(e, "Cannot build model".to_string()))?;

        let names = var_map
            .data()
            .lock()
            .map(|data| data.keys().cloned().collect::<Vec<_>>())
            .map_err(|_| Whatever::without_source("Cannot lock variables".to_string()))?;
        assert!(names.iter().all(|name| !name.starts_with("output_embeddings")));
        assert!(names
            .iter()
            .any(|name| name == "decoder.embeddings.piece_embeddings.weight"));

        let piece_ids = Tensor::new(&[[1u32, 2, 3]], &device)
            .whatever_context("Cannot create piece ids")?;
        let mask = AttentionMask::from_lengths(&[3], 3, &device)
            .whatever_context("Cannot create mask")?;
        let output = causal_lm
            .forward_t(&piece_ids, &mask, &mut KeyValueCache::no_cache(), None, false)
            .map_err(|e| Whatever::with_source(e, "Cannot decode input".to_string()))?;

        assert_eq!(output.logits().dims(), &[1, 3, 32]);
        // Embedding output followed by the output of each layer.
        assert_eq!(output.decoder_output().hidden_states().len(), 3);

        Ok(())
    }

    #[test]
    #[report]
    fn cached_decoding_matches_full_decoding() -> Result<(), Whatever> {
        let device = Device::Cpu;
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &device);
        let causal_lm = tiny_causal_lm_config()
            .build(vb)
            .map_err(|e| Whatever::with_source(e, "Cannot build model".to_string()))?;

        let piece_ids = Tensor::new(&[[5u32, 9, 2, 7, 1]], &device)
            .whatever_context("Cannot create piece ids")?;
        let mask = AttentionMask::from_lengths(&[5], 5, &device)
            .whatever_context("Cannot create mask")?;
        let full = causal_lm
            .forward_t(&piece_ids, &mask, &mut KeyValueCache::no_cache(), None, false)
            .map_err(|e| Whatever::with_source(e, "Cannot decode input".to_string()))?;

        let mut cache = KeyValueCache::cache();
        let prefix_mask = AttentionMask::from_lengths(&[4], 4, &device)
            .whatever_context("Cannot create mask")?;
        causal_lm
            .forward_t(
                &piece_ids.narrow(1, 0, 4).whatever_context("Cannot slice input")?,
                &prefix_mask,
                &mut cache,
                None,
                false,
            )
            .map_err(|e| Whatever::with_source(e, "Cannot decode prefix".to_string()))?;
        let step = causal_lm
            .forward_t(
                &piece_ids.narrow(1, 4, 1).whatever_context("Cannot slice input")?,
                &mask,
                &mut cache,
                None,
                false,
            )
            .map_err(|e| Whatever::with_source(e, "Cannot decode step".to_string()))?;

        assert_eq!(cache.seq_len().whatever_context("Cannot get length")?, 5);
        assert_tensor_eq!(
            step.logits().clone(),
            full.logits()
                .narrow(1, 4, 1)
                .whatever_context("Cannot slice logits")?,
            epsilon = 1e-4,
        );

        Ok(())
    }

    #[test]
    #[report]
    fn decoding_beyond_positions_fails() -> Result<(), Whatever> {
        let device = Device::Cpu;
        let causal_lm = tiny_causal_lm_config()
            .build(VarBuilder::zeros(DType::F32, &device))
            .map_err(|e| Whatever::with_source(e, "Cannot build model".to_string()))?;

        let piece_ids = Tensor::zeros((1, 17), DType::U32, &device)
            .whatever_context("Cannot create piece ids")?;
        let mask = AttentionMask::from_lengths(&[17], 17, &device)
            .whatever_context("Cannot create mask")?;

        assert!(causal_lm
            .forward_t(&piece_ids, &mask, &mut KeyValueCache::no_cache(), None, false)
            .is_err());

        Ok(())
    }
}
