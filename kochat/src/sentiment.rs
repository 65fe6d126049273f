//! Emotion classification of user utterances.
use std::fmt;

use candle_core::{Device, D};
use candle_nn::ops::softmax;
use kochat_transformers::architectures::SequenceClassifier;
use kochat_transformers::error::BoxedError;
use kochat_transformers::models::electra::ElectraSequenceClassifier;
use kochat_transformers::models::hf::{FromHFHub, FromHfHubError};
use kochat_transformers::models::transformer::TransformerSequenceClassifier;
use kochat_transformers::tokenizers::{
    FromHFHub as TokenizerFromHFHub, HfTokenizer, PiecesWithIdsError, TokenizerEncodeInput,
};
use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
pub enum SentimentError {
    #[snafu(display("Cannot load emotion classifier '{name}'"))]
    LoadClassifier {
        name: String,
        source: FromHfHubError,
    },

    #[snafu(display("Cannot load tokenizer '{name}'"))]
    LoadTokenizer { name: String, source: BoxedError },

    #[snafu(display("Cannot tokenize utterance"))]
    Tokenize { source: BoxedError },

    #[snafu(display("Cannot create classifier input"))]
    Input { source: PiecesWithIdsError },

    #[snafu(display("Cannot create type identifiers"))]
    TypeIds { source: candle_core::Error },

    #[snafu(display("Cannot classify utterance"))]
    Classify { source: BoxedError },

    #[snafu(display("Cannot compute emotion probabilities"))]
    Probabilities { source: candle_core::Error },

    #[snafu(display("Classifier predicts {n_labels} labels, expected {}", Emotion::ALL.len()))]
    LabelCount { n_labels: usize },
}

/// Emotions in the label order of the classifier.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Emotion {
    Sadness,
    Neutral,
    Happiness,
    Disgust,
    Anger,
    Fear,
    Surprise,
}

impl Emotion {
    pub const ALL: [Emotion; 7] = [
        Emotion::Sadness,
        Emotion::Neutral,
        Emotion::Happiness,
        Emotion::Disgust,
        Emotion::Anger,
        Emotion::Fear,
        Emotion::Surprise,
    ];

    /// Class index of the emotion.
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Korean label of the emotion.
    pub fn label(self) -> &'static str {
        match self {
            Emotion::Sadness => "슬픔",
            Emotion::Neutral => "중립",
            Emotion::Happiness => "행복",
            Emotion::Disgust => "혐오",
            Emotion::Anger => "분노",
            Emotion::Fear => "공포",
            Emotion::Surprise => "놀람",
        }
    }
}

impl fmt::Display for Emotion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Most likely emotion of an utterance with the probabilities of all
/// emotions.
#[derive(Clone, Debug, PartialEq)]
pub struct EmotionPrediction {
    pub emotion: Emotion,
    /// Probabilities in the order of [`Emotion::ALL`].
    pub probabilities: [f32; 7],
}

/// Classifies utterances into emotions.
pub struct EmotionClassifier {
    device: Device,
    max_len: usize,
    model: TransformerSequenceClassifier,
    tokenizer: HfTokenizer,
}

impl EmotionClassifier {
    pub fn new(
        model: TransformerSequenceClassifier,
        tokenizer: HfTokenizer,
        device: Device,
    ) -> Self {
        EmotionClassifier {
            device,
            max_len: 128,
            model,
            tokenizer,
        }
    }

    /// Load the classifier and its tokenizer from Hugging Face Hub.
    pub fn from_hf_hub(
        classifier_name: &str,
        tokenizer_name: &str,
        device: Device,
    ) -> Result<Self, SentimentError> {
        let model = ElectraSequenceClassifier::from_hf_hub(classifier_name, None, &device)
            .context(LoadClassifierSnafu {
                name: classifier_name,
            })?;
        let tokenizer = <HfTokenizer as TokenizerFromHFHub>::from_hf_hub(tokenizer_name, None)
            .context(LoadTokenizerSnafu {
                name: tokenizer_name,
            })?;
        Ok(Self::new(model, tokenizer, device))
    }

    /// Maximum number of pieces of an utterance, including special pieces.
    ///
    /// Default: `128`
    pub fn max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len;
        self
    }

    /// Predict the emotion of an utterance.
    pub fn predict(&self, utterance: &str) -> Result<EmotionPrediction, SentimentError> {
        let pieces = self
            .tokenizer
            .encode_with(
                [TokenizerEncodeInput::RawString(utterance)],
                true,
                Some(self.max_len),
            )
            .context(TokenizeSnafu)?;
        let piece_ids = pieces
            .padded_tensor(0, false, &self.device)
            .context(InputSnafu)?;
        let type_ids = piece_ids.zeros_like().context(TypeIdsSnafu)?;
        let mask = pieces
            .attention_mask(false, &self.device)
            .context(InputSnafu)?;

        let output = self
            .model
            .forward_t(&piece_ids, &mask, None, Some(&type_ids), false)
            .context(ClassifySnafu)?;
        let probabilities = softmax(output.logits(), D::Minus1)
            .and_then(|probs| probs.squeeze(0))
            .and_then(|probs| probs.to_vec1::<f32>())
            .context(ProbabilitiesSnafu)?;
        let probabilities: [f32; 7] = probabilities.as_slice().try_into().map_err(|_| {
            SentimentError::LabelCount {
                n_labels: probabilities.len(),
            }
        })?;

        let emotion = Emotion::ALL
            .into_iter()
            .zip(probabilities)
            .max_by(|(_, a), (_, b)| a.total_cmp(b))
            .map(|(emotion, _)| emotion)
            .unwrap_or(Emotion::Neutral);

        Ok(EmotionPrediction {
            emotion,
            probabilities,
        })
    }
}
