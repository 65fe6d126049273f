use super::pieces::PiecesWithIds;
use crate::error::BoxedError;
use crate::repository::Repo;

/// Text to split into pieces.
pub enum TokenizerEncodeInput<I>
where
    I: AsRef<str>,
{
    RawString(I),
}

impl From<&str> for TokenizerEncodeInput<String> {
    fn from(s: &str) -> Self {
        TokenizerEncodeInput::RawString(s.to_owned())
    }
}

impl<I> AsRef<str> for TokenizerEncodeInput<I>
where
    I: AsRef<str>,
{
    fn as_ref(&self) -> &str {
        match self {
            TokenizerEncodeInput::RawString(s) => s.as_ref(),
        }
    }
}

/// Maps between texts, pieces and piece identifiers.
pub trait Tokenizer {
    /// Encode a batch of texts, adding the special pieces that the model
    /// expects around every sequence.
    fn encode<V, I>(&self, input: V) -> Result<PiecesWithIds, BoxedError>
    where
        V: AsRef<[TokenizerEncodeInput<I>]>,
        I: AsRef<str>;

    /// Identifier of `piece`, `None` if the piece is not in the vocabulary.
    fn piece_to_id(&self, piece: impl AsRef<str>) -> Option<u32>;

    /// Piece with identifier `id`, `None` if `id` is out of range.
    fn id_to_piece(&self, id: u32) -> Option<String>;
}

/// Tokenizers that are stored in a [`Repo`].
pub trait FromRepo
where
    Self: Sized + Tokenizer,
{
    fn from_repo(repo: &impl Repo) -> Result<Self, BoxedError>;
}
