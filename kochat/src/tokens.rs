//! Special pieces of the KoGPT-2 chat format.
use kochat_transformers::tokenizers::{HfTokenizer, Tokenizer};
use snafu::{OptionExt, Snafu};

/// Marks the start of a user utterance.
pub const USER: &str = "<usr>";

/// Marks the start of a system response.
pub const SYSTEM: &str = "<sys>";

/// End of a sequence.
pub const EOS: &str = "</s>";

/// Label of context positions that are not trained.
pub const MASK: &str = "<unused0>";

/// Separates an utterance from its sentiment.
pub const SENTIMENT: &str = "<unused1>";

/// Padding piece.
pub const PAD: &str = "<pad>";

/// Marks a word boundary in sentencepiece pieces.
pub const WORD_BOUNDARY: char = '▁';

#[derive(Debug, Snafu)]
pub enum TokensError {
    #[snafu(display("Tokenizer does not have the special piece '{piece}'"))]
    MissingPiece { piece: String },
}

/// Identifiers of the special pieces used during training and generation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SpecialPieces {
    pub eos: u32,
    pub mask: u32,
    pub pad: u32,
    pub sentiment: u32,
    pub user: u32,
}

impl SpecialPieces {
    /// Look up the special pieces in the vocabulary of a tokenizer.
    pub fn from_tokenizer(tokenizer: &HfTokenizer) -> Result<Self, TokensError> {
        let lookup = |piece: &str| {
            tokenizer
                .piece_to_id(piece)
                .context(MissingPieceSnafu { piece })
        };

        Ok(SpecialPieces {
            eos: lookup(EOS)?,
            mask: lookup(MASK)?,
            pad: lookup(PAD)?,
            sentiment: lookup(SENTIMENT)?,
            user: lookup(USER)?,
        })
    }
}

/// Context of a turn: the user utterance followed by its sentiment.
pub fn context_text(utterance: &str, sentiment: &str) -> String {
    format!("{USER}{utterance}{SENTIMENT}{sentiment}")
}

/// Response of a turn, terminated by the end-of-sequence piece.
pub fn response_text(answer: &str) -> String {
    format!("{SYSTEM}{answer}{EOS}")
}

/// Prompt for generating the response to an utterance.
pub fn prompt_text(utterance: &str, sentiment: &str) -> String {
    format!("{}{SYSTEM}", context_text(utterance, sentiment))
}

/// Convert generated pieces to text.
pub fn pieces_to_text<S: AsRef<str>>(pieces: &[S]) -> String {
    pieces
        .iter()
        .map(|piece| piece.as_ref().replace(WORD_BOUNDARY, " "))
        .collect::<String>()
        .trim()
        .to_string()
}
