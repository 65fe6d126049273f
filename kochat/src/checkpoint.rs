//! Fine-tuned checkpoints and their metadata.
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use candle_core::safetensors::MmapedSafetensors;
use candle_core::Device;
use candle_nn::VarMap;
use kochat_transformers::models::gpt2::{GPT2CausalLM, HFGPT2CausalLMConfig};
use kochat_transformers::models::hf::{
    FromHF, FromHFError, FromHFHub, FromHfHubError, HFConfigWithDType,
};
use kochat_transformers::models::transformer::TransformerCausalLM;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use tracing::info;

/// File name of the checkpoint that is overwritten every epoch.
pub const LAST_CHECKPOINT: &str = "model_-last.safetensors";

#[derive(Debug, Snafu)]
pub enum CheckpointError {
    #[snafu(display("Cannot create checkpoint directory: {}", path.to_string_lossy()))]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Cannot save parameters: {}", path.to_string_lossy()))]
    SaveParams {
        path: PathBuf,
        source: candle_core::Error,
    },

    #[snafu(display("Cannot open parameters: {}", path.to_string_lossy()))]
    OpenParams {
        path: PathBuf,
        source: candle_core::Error,
    },

    #[snafu(display("Cannot write checkpoint metadata: {}", path.to_string_lossy()))]
    WriteMetadata {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Cannot serialize checkpoint metadata: {}", path.to_string_lossy()))]
    SerializeMetadata {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[snafu(display("Cannot read checkpoint metadata: {}", path.to_string_lossy()))]
    ReadMetadata {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Cannot parse checkpoint metadata: {}", path.to_string_lossy()))]
    ParseMetadata {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[snafu(display("Cannot fetch configuration of base model '{model_name}'"))]
    BaseModelConfig {
        model_name: String,
        source: FromHfHubError,
    },

    #[snafu(display("Cannot build model from checkpoint"))]
    BuildModel { source: FromHFError },
}

/// Metadata stored next to the parameters of a checkpoint.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct CheckpointMetadata {
    /// Hugging Face Hub name of the model that was fine-tuned.
    pub model_name: String,
    pub model_revision: Option<String>,
    /// Epoch, numbered from zero.
    pub epoch: usize,
    /// Number of optimizer steps taken.
    pub step: usize,
    /// Mean training loss of the epoch.
    pub train_loss: f32,
}

impl CheckpointMetadata {
    /// Path of the metadata file of a checkpoint.
    pub fn path(params: &Path) -> PathBuf {
        params.with_extension("json")
    }

    /// Read the metadata of a checkpoint.
    pub fn read(params: &Path) -> Result<Self, CheckpointError> {
        let path = Self::path(params);
        let file = File::open(&path).context(ReadMetadataSnafu { path: &path })?;
        serde_json::from_reader(BufReader::new(file)).context(ParseMetadataSnafu { path })
    }

    /// Write the metadata of a checkpoint.
    pub fn write(&self, params: &Path) -> Result<(), CheckpointError> {
        let path = Self::path(params);
        let file = File::create(&path).context(WriteMetadataSnafu { path: &path })?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)
            .context(SerializeMetadataSnafu { path })
    }
}

/// Saves a checkpoint after every epoch and tracks the best one.
pub struct CheckpointManager {
    dir: PathBuf,
    best: Option<(f32, PathBuf)>,
}

impl CheckpointManager {
    /// Create a manager that stores checkpoints in `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).context(CreateDirSnafu { path: &dir })?;
        Ok(CheckpointManager { dir, best: None })
    }

    /// Save the parameters of an epoch.
    ///
    /// The parameters are stored twice: under a name with the epoch and
    /// loss, and as the last checkpoint. Returns the path of the first.
    pub fn save(
        &mut self,
        var_map: &VarMap,
        metadata: &CheckpointMetadata,
    ) -> Result<PathBuf, CheckpointError> {
        let path = self.dir.join(format!(
            "model_-{:02}-{:.2}.safetensors",
            metadata.epoch, metadata.train_loss
        ));
        let last = self.dir.join(LAST_CHECKPOINT);
        for params in [&path, &last] {
            var_map
                .save(params)
                .context(SaveParamsSnafu { path: params })?;
            metadata.write(params)?;
        }
        info!(path = %path.display(), train_loss = metadata.train_loss, "Saved checkpoint");

        if self
            .best
            .as_ref()
            .map_or(true, |(loss, _)| metadata.train_loss < *loss)
        {
            self.best = Some((metadata.train_loss, path.clone()));
        }

        Ok(path)
    }

    /// The checkpoint with the lowest loss so far.
    pub fn best(&self) -> Option<&Path> {
        self.best.as_ref().map(|(_, path)| path.as_path())
    }
}

/// Load a fine-tuned causal language model.
///
/// The model configuration is fetched from Hugging Face Hub, using the
/// base model recorded in the checkpoint metadata.
pub fn load_causal_lm(
    params: &Path,
    device: &Device,
) -> Result<TransformerCausalLM, CheckpointError> {
    let metadata = CheckpointMetadata::read(params)?;
    let hf_config = GPT2CausalLM::hf_config_from_hub(
        &metadata.model_name,
        metadata.model_revision.as_deref(),
    )
    .context(BaseModelConfigSnafu {
        model_name: &metadata.model_name,
    })?;
    load_causal_lm_with_config(params, hf_config, device)
}

/// Load a fine-tuned causal language model with the given configuration.
pub fn load_causal_lm_with_config(
    params: &Path,
    hf_config: HFConfigWithDType<HFGPT2CausalLMConfig>,
    device: &Device,
) -> Result<TransformerCausalLM, CheckpointError> {
    let backend =
        unsafe { MmapedSafetensors::new(params) }.context(OpenParamsSnafu { path: params })?;
    GPT2CausalLM::from_backend(hf_config, Box::new(backend), device).context(BuildModelSnafu)
}

#[cfg(test)]
mod tests {
    use candle_core::{Device, Tensor};
    use kochat_transformers::architectures::CausalLM;
    use kochat_transformers::kv_cache::KeyValueCache;
    use kochat_transformers::layers::attention::AttentionMask;
    use kochat_transformers::models::hf::HFConfigWithDType;
    use snafu::{report, FromString, ResultExt, Whatever};

    use super::{
        load_causal_lm_with_config, CheckpointManager, CheckpointMetadata, LAST_CHECKPOINT,
    };
    use crate::util::tests::{tiny_causal_lm, TINY_GPT2_CONFIG};

    fn metadata(epoch: usize, train_loss: f32) -> CheckpointMetadata {
        CheckpointMetadata {
            model_name: "skt/kogpt2-base-v2".to_string(),
            model_revision: None,
            epoch,
            step: epoch * 10,
            train_loss,
        }
    }

    #[test]
    #[report]
    fn saves_epoch_and_last_checkpoints() -> Result<(), Whatever> {
        let dir = tempfile::tempdir().whatever_context("Cannot create directory")?;
        let model = tiny_causal_lm(&Device::Cpu);
        let mut manager = CheckpointManager::new(dir.path().join("model_chp"))
            .whatever_context("Cannot create manager")?;

        let first = manager
            .save(&model.var_map, &metadata(0, 2.5))
            .whatever_context("Cannot save")?;
        let second = manager
            .save(&model.var_map, &metadata(1, 1.234))
            .whatever_context("Cannot save")?;
        manager
            .save(&model.var_map, &metadata(2, 1.5))
            .whatever_context("Cannot save")?;

        assert!(first.ends_with("model_-00-2.50.safetensors"));
        assert!(second.ends_with("model_-01-1.23.safetensors"));
        assert_eq!(manager.best(), Some(second.as_path()));

        let last = dir.path().join("model_chp").join(LAST_CHECKPOINT);
        assert!(last.exists());
        assert_eq!(
            CheckpointMetadata::read(&last).whatever_context("Cannot read metadata")?,
            metadata(2, 1.5)
        );
        assert_eq!(
            CheckpointMetadata::read(&first).whatever_context("Cannot read metadata")?,
            metadata(0, 2.5)
        );

        Ok(())
    }

    #[test]
    #[report]
    fn reloads_saved_parameters() -> Result<(), Whatever> {
        let device = Device::Cpu;
        let dir = tempfile::tempdir().whatever_context("Cannot create directory")?;
        let model = tiny_causal_lm(&device);
        let mut manager = CheckpointManager::new(dir.path()).whatever_context("Cannot create")?;
        let path = manager
            .save(&model.var_map, &metadata(1, 1.))
            .whatever_context("Cannot save")?;

        let hf_config: HFConfigWithDType<_> = serde_json::from_str(TINY_GPT2_CONFIG)
            .whatever_context("Cannot parse configuration")?;
        let reloaded = load_causal_lm_with_config(&path, hf_config, &device)
            .whatever_context("Cannot load checkpoint")?;

        let piece_ids =
            Tensor::new(&[[2u32, 10, 6, 7, 4]], &device).whatever_context("Cannot create input")?;
        let mask =
            AttentionMask::from_lengths(&[5], 5, &device).whatever_context("Cannot create mask")?;
        let logits = |model: &dyn CausalLM<Cache = KeyValueCache>| {
            model
                .forward_t(&piece_ids, &mask, &mut KeyValueCache::no_cache(), None, false)
                .map(|output| output.logits().clone())
                .map_err(|e| Whatever::with_source(e, "Cannot decode input".to_string()))
        };
        let expected = logits(&model.model)?
            .flatten_all()
            .and_then(|logits| logits.to_vec1::<f32>())
            .whatever_context("Cannot convert logits")?;
        let actual = logits(&reloaded)?
            .flatten_all()
            .and_then(|logits| logits.to_vec1::<f32>())
            .whatever_context("Cannot convert logits")?;
        assert_eq!(expected, actual);

        Ok(())
    }

    #[test]
    fn missing_metadata_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(CheckpointMetadata::read(&dir.path().join(LAST_CHECKPOINT)).is_err());
    }
}
