use std::path::{Path, PathBuf};

use super::repo::Repo;
use crate::error::BoxedError;

/// Repository in a local directory.
///
/// The directory has the same layout as a Hugging Face Hub repository,
/// which makes it possible to use models without network access.
pub struct LocalRepo {
    root: PathBuf,
}

impl LocalRepo {
    /// Create a repository backed by a local directory.
    ///
    /// * `root` - Root directory of the repository.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }
}

impl Repo for LocalRepo {
    fn file(&self, path: impl AsRef<Path>) -> Result<Option<PathBuf>, BoxedError> {
        let path = self.root.join(path);
        Ok(path.is_file().then_some(path))
    }

    fn exists(&self, path: impl AsRef<Path>) -> bool {
        self.root.join(path).is_file()
    }
}
