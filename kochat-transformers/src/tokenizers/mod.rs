//! Tokenizers that split Korean text into model pieces.
mod hf_hub;
pub use hf_hub::FromHFHub;

mod hf_tokenizer;
pub use hf_tokenizer::{HfTokenizer, HfTokenizerError};

mod pieces;
pub use pieces::{PiecesWithIds, PiecesWithIdsError};

mod tokenizer;
pub use tokenizer::{FromRepo, Tokenizer, TokenizerEncodeInput};
