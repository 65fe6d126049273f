//! Model architectures, independent of a particular checkpoint format.
use candle_nn::VarBuilder;

mod causal_lm;
pub use causal_lm::{CausalLM, CausalLMOutput};

mod decoder;
pub use decoder::{BuildDecoder, BuildDecoderLayer, Decoder, DecoderLayer, DecoderOutput};

mod embeddings;
pub use embeddings::{BuildEmbeddings, Embeddings};

mod encoder;
pub use encoder::{BuildEncoder, BuildEncoderLayer, Encoder, EncoderLayer, EncoderOutput};

mod sequence_classifier;
pub use sequence_classifier::{SequenceClassifier, SequenceClassifierOutput};

use crate::error::BoxedError;

/// Configuration from which a model or one of its parts is built.
pub trait BuildArchitecture {
    type Architecture;

    fn build(&self, vb: VarBuilder) -> Result<Self::Architecture, BoxedError>;
}
