use snafu::{OptionExt, ResultExt, Snafu};
use tokenizers::tokenizer::Tokenizer as HuggingFaceTokenizer;
use tokenizers::{PostProcessor, TruncationDirection};

use super::hf_hub::FromHFHub;
use super::pieces::PiecesWithIds;
use super::tokenizer::{FromRepo, Tokenizer, TokenizerEncodeInput};
use crate::error::BoxedError;
use crate::repository::Repo;

#[derive(Debug, Snafu)]
pub enum HfTokenizerError {
    #[snafu(display("Cannot encode text into pieces"))]
    Encode { source: tokenizers::Error },

    #[snafu(display("Cannot get 'tokenizer.json' from repository"))]
    GetTokenizerJSON { source: BoxedError },

    #[snafu(display("Repository does not contain 'tokenizer.json'"))]
    MissingTokenizerJSON,

    #[snafu(display("Cannot load tokenizer from 'tokenizer.json'"))]
    LoadTokenizerJSON { source: BoxedError },
}

/// Tokenizer backed by the Hugging Face `tokenizers` crate.
///
/// Loads any tokenizer that is serialized as `tokenizer.json`, such as
/// the byte-level BPE tokenizer of KoGPT-2 and the word piece tokenizers
/// of Korean ELECTRA models.
pub struct HfTokenizer {
    tokenizer: HuggingFaceTokenizer,
}

impl HfTokenizer {
    /// Split texts into pieces.
    ///
    /// With `add_special_pieces`, the pieces that the post-processor of
    /// the tokenizer adds (such as `[CLS]` and `[SEP]`) are included.
    /// `truncation` limits the number of pieces of every sequence,
    /// special pieces included. Texts are cut on the right and special
    /// pieces are always kept.
    pub fn encode_with<V, I>(
        &self,
        input: V,
        add_special_pieces: bool,
        truncation: Option<usize>,
    ) -> Result<PiecesWithIds, BoxedError>
    where
        V: AsRef<[TokenizerEncodeInput<I>]>,
        I: AsRef<str>,
    {
        let n_special_pieces = match self.tokenizer.get_post_processor() {
            Some(processor) if add_special_pieces => processor.added_tokens(false),
            _ => 0,
        };

        let mut pieces = PiecesWithIds::default();
        for text in input.as_ref() {
            let mut encoding = self
                .tokenizer
                .encode(text.as_ref(), false)
                .context(EncodeSnafu)?;
            if let Some(max_len) = truncation {
                encoding.truncate(
                    max_len.saturating_sub(n_special_pieces),
                    0,
                    TruncationDirection::Right,
                );
            }
            let encoding = self
                .tokenizer
                .post_process(encoding, None, add_special_pieces)
                .context(EncodeSnafu)?;

            pieces.ids.push(encoding.get_ids().to_vec());
            pieces.pieces.push(encoding.get_tokens().to_vec());
        }

        Ok(pieces)
    }
}

impl Tokenizer for HfTokenizer {
    fn encode<V, I>(&self, input: V) -> Result<PiecesWithIds, BoxedError>
    where
        V: AsRef<[TokenizerEncodeInput<I>]>,
        I: AsRef<str>,
    {
        self.encode_with(input, true, None)
    }

    fn piece_to_id(&self, piece: impl AsRef<str>) -> Option<u32> {
        self.tokenizer.token_to_id(piece.as_ref())
    }

    fn id_to_piece(&self, id: u32) -> Option<String> {
        self.tokenizer.id_to_token(id)
    }
}

impl FromRepo for HfTokenizer {
    fn from_repo(repo: &impl Repo) -> Result<Self, BoxedError> {
        let path = repo
            .file("tokenizer.json")
            .context(GetTokenizerJSONSnafu)?
            .context(MissingTokenizerJSONSnafu)?;
        let tokenizer = HuggingFaceTokenizer::from_file(path).context(LoadTokenizerJSONSnafu)?;
        Ok(HfTokenizer { tokenizer })
    }
}

impl FromHFHub for HfTokenizer {}
