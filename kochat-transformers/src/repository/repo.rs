use std::path::{Path, PathBuf};

use crate::error::BoxedError;

/// Source of model and tokenizer files.
pub trait Repo
where
    Self: Sized,
{
    /// Local path of the file at `path` in the repository, fetching it
    /// first when necessary. `None` if the repository has no such file.
    fn file(&self, path: impl AsRef<Path>) -> Result<Option<PathBuf>, BoxedError>;

    fn exists(&self, path: impl AsRef<Path>) -> bool;
}
