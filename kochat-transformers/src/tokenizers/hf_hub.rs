use super::tokenizer::FromRepo;
use crate::error::BoxedError;
use crate::repository::HfHubRepo;

/// Tokenizers that can be downloaded from the Hugging Face Hub.
pub trait FromHFHub
where
    Self: FromRepo,
{
    /// Load the tokenizer of the model `name`, at `revision` or at the
    /// head of the `main` branch.
    fn from_hf_hub(name: &str, revision: Option<&str>) -> Result<Self, BoxedError> {
        Self::from_repo(&HfHubRepo::new(name, revision)?)
    }
}
