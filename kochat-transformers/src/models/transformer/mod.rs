//! Generic transformer models that GPT-2 and ELECTRA are configured from.
mod causal_lm;
pub use causal_lm::{TransformerCausalLM, TransformerCausalLMConfig, TransformerCausalLMError};

mod decoder;
pub use decoder::{TransformerDecoder, TransformerDecoderConfig, TransformerDecoderError};

mod encoder;
pub use encoder::{TransformerEncoder, TransformerEncoderConfig, TransformerEncoderError};

mod sequence_classifier;
pub use sequence_classifier::{
    ClassificationHeadConfig, TransformerSequenceClassifier, TransformerSequenceClassifierConfig,
    TransformerSequenceClassifierError,
};
