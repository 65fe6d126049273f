//! Chat turns and their encoding as training samples.
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use kochat_transformers::error::BoxedError;
use kochat_transformers::tokenizers::{HfTokenizer, TokenizerEncodeInput};
use serde::Deserialize;
use snafu::{ensure, ResultExt, Snafu};
use tracing::{info, warn};

use crate::tokens::{context_text, response_text, SpecialPieces, TokensError};

#[derive(Debug, Snafu)]
pub enum DatasetError {
    #[snafu(display("Cannot open dataset: {}", path.to_string_lossy()))]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Cannot read chat turn {index}"))]
    ReadTurn { index: usize, source: csv::Error },

    #[snafu(display("Cannot tokenize chat turn"))]
    Tokenize { source: BoxedError },

    #[snafu(display("Cannot look up special pieces"))]
    SpecialPieces { source: TokensError },

    #[snafu(display("Sample length must be at least 2, was {max_len}"))]
    SampleLength { max_len: usize },
}

/// A question and answer pair with the sentiment of the conversation.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct ChatTurn {
    #[serde(rename = "Q")]
    pub question: String,
    #[serde(rename = "A")]
    pub answer: String,
    pub label: String,
}

/// Read chat turns from a CSV file with a `Q,A,label` header.
pub fn load_turns(path: impl AsRef<Path>) -> Result<Vec<ChatTurn>, DatasetError> {
    let path = path.as_ref();
    let file = File::open(path).context(OpenSnafu { path })?;
    read_turns(file)
}

/// Read chat turns in CSV format.
pub fn read_turns(reader: impl Read) -> Result<Vec<ChatTurn>, DatasetError> {
    csv::Reader::from_reader(reader)
        .deserialize()
        .enumerate()
        .map(|(index, turn)| turn.context(ReadTurnSnafu { index }))
        .collect()
}

/// A chat turn encoded as a fixed-length training sample.
#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    /// Context pieces followed by response pieces and padding.
    pub token_ids: Vec<u32>,
    /// Piece that should be predicted at each position.
    pub labels: Vec<u32>,
    /// `1` for positions that contribute to the loss, `0` otherwise.
    pub loss_mask: Vec<f32>,
    /// Number of pieces before padding.
    pub len: usize,
}

impl Sample {
    /// Number of positions that contribute to the loss.
    pub fn n_trained(&self) -> usize {
        self.loss_mask.iter().filter(|&&mask| mask > 0.).count()
    }
}

/// Context and response pieces of a turn after truncation.
#[derive(Clone, Debug)]
pub struct EncodedTurn {
    pub context_pieces: Vec<String>,
    pub response_pieces: Vec<String>,
    pub label_pieces: Vec<String>,
    pub sample: Sample,
}

/// Encodes chat turns as training samples.
pub struct SampleEncoder<'a> {
    max_len: usize,
    special_pieces: SpecialPieces,
    tokenizer: &'a HfTokenizer,
}

impl<'a> SampleEncoder<'a> {
    /// Create an encoder for samples of `max_len` pieces.
    pub fn new(tokenizer: &'a HfTokenizer, max_len: usize) -> Result<Self, DatasetError> {
        ensure!(max_len >= 2, SampleLengthSnafu { max_len });
        let special_pieces =
            SpecialPieces::from_tokenizer(tokenizer).context(SpecialPiecesSnafu)?;
        Ok(SampleEncoder {
            max_len,
            special_pieces,
            tokenizer,
        })
    }

    fn tokenize(&self, text: String) -> Result<(Vec<u32>, Vec<String>), DatasetError> {
        let mut encoded = self
            .tokenizer
            .encode_with([TokenizerEncodeInput::RawString(text)], false, None)
            .context(TokenizeSnafu)?;
        Ok((
            encoded.ids.pop().unwrap_or_default(),
            encoded.pieces.pop().unwrap_or_default(),
        ))
    }

    /// Encode a chat turn.
    ///
    /// When the turn does not fit, the response is truncated first. If the
    /// context alone does not leave room for the response, only the last
    /// `max_len / 2` context pieces are kept.
    pub fn encode(&self, turn: &ChatTurn) -> Result<EncodedTurn, DatasetError> {
        let (mut context_ids, mut context_pieces) =
            self.tokenize(context_text(&turn.question, &turn.label))?;
        let (mut response_ids, mut response_pieces) =
            self.tokenize(response_text(&turn.answer))?;

        if context_ids.len() + response_ids.len() > self.max_len {
            if context_ids.len() >= self.max_len {
                let keep = self.max_len / 2;
                context_ids.drain(..context_ids.len() - keep);
                context_pieces.drain(..context_pieces.len() - keep);
            }
            let response_len = self.max_len - context_ids.len();
            response_ids.truncate(response_len);
            response_pieces.truncate(response_len);
        }

        let context_len = context_ids.len();
        let response_len = response_ids.len();
        let len = context_len + response_len;
        let pad = |mut ids: Vec<u32>| {
            ids.resize(self.max_len, self.special_pieces.pad);
            ids
        };

        // Position i is trained to predict piece i + 1. The last response
        // position would predict padding and is not trained.
        let n_trained = response_len.saturating_sub(1);
        let mut loss_mask = vec![0f32; self.max_len];
        loss_mask[context_len..context_len + n_trained].fill(1.);

        let labels = std::iter::repeat(self.special_pieces.mask)
            .take(context_len)
            .chain(response_ids.iter().skip(1).copied())
            .collect();

        let mut label_pieces = vec![crate::tokens::MASK.to_string(); context_len];
        label_pieces.extend(response_pieces.iter().skip(1).cloned());

        let token_ids = context_ids.into_iter().chain(response_ids).collect();

        Ok(EncodedTurn {
            context_pieces,
            response_pieces,
            label_pieces,
            sample: Sample {
                token_ids: pad(token_ids),
                labels: pad(labels),
                loss_mask,
                len,
            },
        })
    }

    /// Encode chat turns, logging the first encoded turn.
    ///
    /// Turns whose response is truncated to a single piece have no
    /// trained positions and are skipped.
    pub fn encode_all(&self, turns: &[ChatTurn]) -> Result<Vec<Sample>, DatasetError> {
        let mut samples = Vec::with_capacity(turns.len());
        for (index, turn) in turns.iter().enumerate() {
            let encoded = self.encode(turn)?;
            if index == 0 {
                info!(
                    context = %turn.question,
                    context_pieces = ?encoded.context_pieces,
                    response = %turn.answer,
                    response_pieces = ?encoded.response_pieces,
                    labels = ?encoded.label_pieces,
                    "First training sample"
                );
            }

            if encoded.sample.n_trained() == 0 {
                warn!(
                    index,
                    context_len = encoded.context_pieces.len(),
                    "Skipping chat turn without trained positions"
                );
                continue;
            }

            samples.push(encoded.sample);
        }

        Ok(samples)
    }
}
