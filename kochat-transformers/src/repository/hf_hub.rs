use std::collections::HashSet;
use std::path::{Path, PathBuf};

use hf_hub::api::sync::{Api, ApiError, ApiRepo};
use hf_hub::{Repo as HuggingFaceRepo, RepoType};
use snafu::{ResultExt, Snafu};

use super::repo::Repo;
use crate::error::BoxedError;

#[derive(Debug, Snafu)]
pub enum HfHubRepoError {
    #[snafu(display("Cannot create Hugging Face Hub client"))]
    CreateClient { source: ApiError },

    #[snafu(display("Cannot list files of '{name}' at revision '{revision}'"))]
    ListFiles {
        name: String,
        revision: String,
        source: ApiError,
    },

    #[snafu(display("Cannot download '{path}'"))]
    Download { path: String, source: ApiError },
}

/// Model repository on the Hugging Face Hub, such as `skt/kogpt2-base-v2`.
///
/// Listing the files happens once, when the repository is opened. A file
/// is downloaded into the Hugging Face cache on first use.
pub struct HfHubRepo {
    api_repo: ApiRepo,
    files: HashSet<String>,
}

impl HfHubRepo {
    /// Open the repository `name` at `revision`, the `main` branch when
    /// no revision is given.
    pub fn new(name: &str, revision: Option<&str>) -> Result<Self, BoxedError> {
        let revision = revision.unwrap_or("main");
        let api_repo = Api::new()
            .context(CreateClientSnafu)?
            .repo(HuggingFaceRepo::with_revision(
                name.to_string(),
                RepoType::Model,
                revision.to_string(),
            ));
        let files = api_repo
            .info()
            .context(ListFilesSnafu { name, revision })?
            .siblings
            .into_iter()
            .map(|sibling| sibling.rfilename)
            .collect();

        Ok(HfHubRepo { api_repo, files })
    }
}

impl Repo for HfHubRepo {
    fn file(&self, path: impl AsRef<Path>) -> Result<Option<PathBuf>, BoxedError> {
        if !self.exists(path.as_ref()) {
            return Ok(None);
        }

        let path = path.as_ref().to_string_lossy();
        let local = self
            .api_repo
            .get(&path)
            .context(DownloadSnafu { path: path.as_ref() })?;
        Ok(Some(local))
    }

    fn exists(&self, path: impl AsRef<Path>) -> bool {
        self.files.contains(path.as_ref().to_string_lossy().as_ref())
    }
}
