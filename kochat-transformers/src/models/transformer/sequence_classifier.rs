use candle_core::{IndexOp, Module, ModuleT, Tensor};
use candle_nn::{linear, Linear, VarBuilder};
use snafu::{ResultExt, Snafu};

use crate::architectures::{
    BuildArchitecture, BuildEncoder, Encoder, SequenceClassifier, SequenceClassifierOutput,
};
use crate::error::BoxedError;
use crate::layers::activation::Activation;
use crate::layers::attention::AttentionMask;
use crate::layers::build_module::BuildModule;
use crate::layers::identity::Identity;
use crate::models::transformer::{TransformerEncoder, TransformerEncoderConfig};

/// Classification head configuration.
///
/// The head classifies a sequence using the hidden representation of its
/// first piece.
#[derive(Debug)]
pub struct ClassificationHeadConfig {
    activation: Box<dyn BuildModule>,
    dropout: Box<dyn BuildModule>,
    hidden_width: usize,
    n_labels: usize,
}

impl ClassificationHeadConfig {
    /// Activation applied after the dense layer.
    ///
    /// Default: `Activation::Gelu`
    pub fn activation(mut self, activation: Box<dyn BuildModule>) -> Self {
        self.activation = activation;
        self
    }

    /// Dropout applied before the dense and output layers.
    ///
    /// Default: `Identity`
    pub fn dropout(mut self, dropout: Box<dyn BuildModule>) -> Self {
        self.dropout = dropout;
        self
    }

    /// Width of the encoder hidden representations.
    ///
    /// Default: `768`
    pub fn hidden_width(mut self, hidden_width: usize) -> Self {
        self.hidden_width = hidden_width;
        self
    }

    /// Number of labels.
    ///
    /// Default: `2`
    pub fn n_labels(mut self, n_labels: usize) -> Self {
        self.n_labels = n_labels;
        self
    }
}

impl Default for ClassificationHeadConfig {
    fn default() -> Self {
        Self {
            activation: Box::new(Activation::Gelu),
            dropout: Box::new(Identity),
            hidden_width: 768,
            n_labels: 2,
        }
    }
}

/// Transformer sequence classifier configuration.
#[derive(Debug)]
pub struct TransformerSequenceClassifierConfig {
    encoder: Box<dyn BuildEncoder<Encoder = TransformerEncoder>>,
    head: ClassificationHeadConfig,
}

impl TransformerSequenceClassifierConfig {
    /// Encoder.
    ///
    /// Default: `TransformerEncoderConfig::default()`
    pub fn encoder(mut self, encoder: Box<dyn BuildEncoder<Encoder = TransformerEncoder>>) -> Self {
        self.encoder = encoder;
        self
    }

    /// Classification head.
    ///
    /// Default: `ClassificationHeadConfig::default()`
    pub fn head(mut self, head: ClassificationHeadConfig) -> Self {
        self.head = head;
        self
    }
}

impl Default for TransformerSequenceClassifierConfig {
    fn default() -> Self {
        Self {
            encoder: Box::<TransformerEncoderConfig>::default(),
            head: ClassificationHeadConfig::default(),
        }
    }
}

impl BuildArchitecture for TransformerSequenceClassifierConfig {
    type Architecture = TransformerSequenceClassifier;

    fn build(&self, vb: VarBuilder) -> Result<Self::Architecture, BoxedError> {
        let encoder = self
            .encoder
            .build(vb.push_prefix("encoder"))
            .context(BuildEncoderSnafu)?;

        let vb_head = vb.push_prefix("classifier");
        let head = &self.head;

        Ok(TransformerSequenceClassifier {
            activation: head
                .activation
                .build(vb_head.push_prefix("activation"))
                .context(BuildModuleSnafu)?,
            dense: linear(
                head.hidden_width,
                head.hidden_width,
                vb_head.push_prefix("dense"),
            )
            .context(BuildLinearSnafu)?,
            dropout: head
                .dropout
                .build(vb_head.push_prefix("dropout"))
                .context(BuildModuleSnafu)?,
            encoder,
            output: linear(
                head.hidden_width,
                head.n_labels,
                vb_head.push_prefix("output"),
            )
            .context(BuildLinearSnafu)?,
        })
    }
}

/// `TransformerSequenceClassifier` errors.
#[derive(Debug, Snafu)]
pub enum TransformerSequenceClassifierError {
    #[snafu(display("Cannot build encoder"))]
    BuildEncoder { source: BoxedError },

    #[snafu(display("Cannot build classification layer"))]
    BuildLinear { source: candle_core::Error },

    #[snafu(display("Cannot build activation or dropout"))]
    BuildModule { source: BoxedError },

    #[snafu(display("Cannot apply classification head"))]
    ClassificationHead { source: candle_core::Error },

    #[snafu(display("Nothing to classify, the encoder does not have any layer outputs"))]
    NoLayers,
}

/// Transformer-based sequence classifier.
///
/// Classifies sequences from the last hidden representation of the
/// first piece (typically `[CLS]`).
pub struct TransformerSequenceClassifier {
    activation: Box<dyn ModuleT>,
    dense: Linear,
    dropout: Box<dyn ModuleT>,
    encoder: TransformerEncoder,
    output: Linear,
}

impl SequenceClassifier for TransformerSequenceClassifier {
    fn forward_t(
        &self,
        piece_ids: &Tensor,
        attention_mask: &AttentionMask,
        positions: Option<&Tensor>,
        type_ids: Option<&Tensor>,
        train: bool,
    ) -> Result<SequenceClassifierOutput, BoxedError> {
        let encoder_output =
            self.encoder
                .forward_t(piece_ids, attention_mask, positions, type_ids, train)?;
        let last_layer = encoder_output
            .last_hidden_state()
            .ok_or(TransformerSequenceClassifierError::NoLayers)?;

        let logits = last_layer
            .i((.., 0, ..))
            .and_then(|xs| self.dropout.forward_t(&xs, train))
            .and_then(|xs| self.dense.forward(&xs))
            .and_then(|xs| self.activation.forward_t(&xs, train))
            .and_then(|xs| self.dropout.forward_t(&xs, train))
            .and_then(|xs| self.output.forward(&xs))
            .context(ClassificationHeadSnafu)?;

        Ok(SequenceClassifierOutput::new(encoder_output, logits))
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Tensor};
    use candle_nn::{VarBuilder, VarMap};
    use snafu::{report, FromString, ResultExt, Whatever};

    use crate::architectures::{BuildArchitecture, SequenceClassifier};
    use crate::layers::attention::AttentionMask;
    use crate::models::util::tests::tiny_sequence_classifier_config;
    use crate::util::tests::assert_tensor_eq;

    #[test]
    #[report]
    fn classifier_ignores_padding() -> Result<(), Whatever> {
        let device = Device::Cpu;
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &device);
        let classifier = tiny_sequence_classifier_config()
            .build(vb)
            .map_err(|e| Whatever::with_source(e, "Cannot build model".to_string()))?;

        let piece_ids = Tensor::new(&[[2u32, 8, 9, 3]], &device)
            .whatever_context("Cannot create piece ids")?;
        let mask = AttentionMask::from_lengths(&[4], 4, &device)
            .whatever_context("Cannot create mask")?;
        let unpadded = classifier
            .forward_t(&piece_ids, &mask, None, None, false)
            .map_err(|e| Whatever::with_source(e, "Cannot classify".to_string()))?;
        assert_eq!(unpadded.logits().dims(), &[1, 7]);

        let padded_ids = Tensor::new(&[[2u32, 8, 9, 3, 0, 0]], &device)
            .whatever_context("Cannot create piece ids")?;
        let padded_mask = AttentionMask::from_lengths(&[4], 6, &device)
            .whatever_context("Cannot create mask")?;
        let padded = classifier
            .forward_t(&padded_ids, &padded_mask, None, None, false)
            .map_err(|e| Whatever::with_source(e, "Cannot classify".to_string()))?;

        assert_tensor_eq!(
            unpadded.logits().clone(),
            padded.logits().clone(),
            epsilon = 1e-5,
        );

        Ok(())
    }
}
