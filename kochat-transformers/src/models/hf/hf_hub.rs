use std::fs::File;
use std::path::PathBuf;

use candle_core::Device;
use candle_nn::var_builder::SimpleBackend;
use serde::de::DeserializeOwned;
use snafu::{OptionExt, ResultExt, Snafu};

use crate::error::BoxedError;
use crate::models::hf::checkpoint::LoadHFCheckpoint;
use crate::models::hf::from_hf::{FromHF, FromHFError, TrainableModel};
use crate::models::hf::HFConfigWithDType;
use crate::repository::{HfHubRepo, Repo};

#[derive(Debug, Snafu)]
pub enum FromHfHubError {
    #[snafu(display("Cannot open Hugging Face Hub repository '{name}'"))]
    OpenRepo { name: String, source: BoxedError },

    #[snafu(display("Cannot get 'config.json' from repository"))]
    GetConfig { source: BoxedError },

    #[snafu(display("Repository does not contain 'config.json'"))]
    MissingConfig,

    #[snafu(display("Cannot open model configuration at {path:?}"))]
    OpenConfig {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Cannot parse model configuration at {path:?}"))]
    ParseConfig {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[snafu(display("Cannot load model parameters"))]
    LoadCheckpoint { source: BoxedError },

    #[snafu(display("Cannot build model from Hugging Face checkpoint"))]
    FromHF { source: FromHFError },
}

/// Models that can be downloaded from the Hugging Face Hub.
///
/// `revision` selects a branch, tag or commit of the model repository
/// and defaults to `main`. Downloaded files are kept in the local Hugging
/// Face cache.
pub trait FromHFHub
where
    Self: Sized,
{
    type Model;

    type HFConfig;

    /// Download a model for inference.
    fn from_hf_hub(
        name: &str,
        revision: Option<&str>,
        device: &Device,
    ) -> Result<Self::Model, FromHfHubError>;

    /// Download a model together with its parameters as variables, so
    /// that it can be fine-tuned.
    fn from_hf_hub_trainable(
        name: &str,
        revision: Option<&str>,
        device: &Device,
    ) -> Result<TrainableModel<Self::Model>, FromHfHubError>;

    /// Download only the configuration of a model.
    fn hf_config_from_hub(
        name: &str,
        revision: Option<&str>,
    ) -> Result<HFConfigWithDType<Self::HFConfig>, FromHfHubError>;
}

impl<HF, C, HC> FromHFHub for HF
where
    HF: FromHF<Config = C, HFConfig = HC>,
    HC: DeserializeOwned,
    C: TryFrom<HC, Error = BoxedError>,
{
    type Model = HF::Model;

    type HFConfig = HC;

    fn from_hf_hub(
        name: &str,
        revision: Option<&str>,
        device: &Device,
    ) -> Result<Self::Model, FromHfHubError> {
        let repo = open_repo(name, revision)?;
        let (hf_config, backend) = (read_config(&repo)?, read_parameters(&repo)?);
        Self::from_hf(hf_config, backend, device).context(FromHFSnafu)
    }

    fn from_hf_hub_trainable(
        name: &str,
        revision: Option<&str>,
        device: &Device,
    ) -> Result<TrainableModel<Self::Model>, FromHfHubError> {
        let repo = open_repo(name, revision)?;
        let (hf_config, backend) = (read_config(&repo)?, read_parameters(&repo)?);
        Self::from_hf_trainable(hf_config, backend, device).context(FromHFSnafu)
    }

    fn hf_config_from_hub(
        name: &str,
        revision: Option<&str>,
    ) -> Result<HFConfigWithDType<Self::HFConfig>, FromHfHubError> {
        read_config(&open_repo(name, revision)?)
    }
}

fn open_repo(name: &str, revision: Option<&str>) -> Result<HfHubRepo, FromHfHubError> {
    HfHubRepo::new(name, revision).context(OpenRepoSnafu { name })
}

fn read_config<HC>(repo: &impl Repo) -> Result<HFConfigWithDType<HC>, FromHfHubError>
where
    HC: DeserializeOwned,
{
    let path = repo
        .file("config.json")
        .context(GetConfigSnafu)?
        .context(MissingConfigSnafu)?;
    let file = File::open(&path).context(OpenConfigSnafu { path: &path })?;
    serde_json::from_reader(file).context(ParseConfigSnafu { path })
}

fn read_parameters(repo: &impl Repo) -> Result<Box<dyn SimpleBackend>, FromHfHubError> {
    repo.load_hf_checkpoint().context(LoadCheckpointSnafu)
}
