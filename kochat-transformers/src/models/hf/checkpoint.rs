use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::io;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use candle_core::pickle::{read_pth_tensor_info, PthTensors};
use candle_core::safetensors::MmapedSafetensors;
use candle_core::{DType, Device, Shape, Tensor};
use candle_nn::var_builder::SimpleBackend;
use candle_nn::Init;
use serde::Deserialize;
use snafu::{ResultExt, Snafu};

use crate::error::BoxedError;
use crate::repository::Repo;

static PYTORCH_INDEX: &str = "pytorch_model.bin.index.json";
static PYTORCH_SINGLE: &str = "pytorch_model.bin";
static SAFETENSORS_INDEX: &str = "model.safetensors.index.json";
static SAFETENSORS_SINGLE: &str = "model.safetensors";

/// Extension trait for HF transformers checkpoint loading.
///
/// This trait has a single implementation that adds support to `Repo` for
/// loading Hugging Face transformers-style checkpoints from a repository.
/// Safetensors checkpoints are preferred. Repositories that only provide
/// a PyTorch state dict (such as older Korean GPT-2 and ELECTRA uploads)
/// fall back to `pytorch_model.bin`.
pub trait LoadHFCheckpoint {
    /// Load a Hugging Face transformers checkpoint.
    fn load_hf_checkpoint(&self) -> Result<Box<dyn SimpleBackend>, BoxedError>;
}

/// HF transformers checkpoint loading errors.
#[derive(Debug, Snafu)]
pub enum HFCheckpointError {
    #[snafu(display("Cannot download checkpoint: {name}"))]
    Download { source: BoxedError, name: String },

    #[snafu(display("Cannot open or load checkpoint"))]
    LoadCheckpoint { source: candle_core::Error },

    #[snafu(display("Checkpoint does not exist: {name}"))]
    NonExistentCheckpoint { name: String },

    #[snafu(display("Checkpoint index file does not exist: {name}"))]
    NonExistentCheckpointIndex { name: String },

    #[snafu(display("Shard does not exist: {name}"))]
    NonExistentShard { name: String },

    #[snafu(display("Cannot open index file: {}", path.to_string_lossy()))]
    OpenCheckpointIndex { source: io::Error, path: PathBuf },

    #[snafu(display("Cannot parse index file: {}", path.to_string_lossy()))]
    ParseCheckpointIndex {
        source: serde_json::Error,
        path: PathBuf,
    },
}

impl<R> LoadHFCheckpoint for R
where
    R: Repo,
{
    fn load_hf_checkpoint(&self) -> Result<Box<dyn SimpleBackend>, BoxedError> {
        let format = CheckpointFormat::probe(self);
        let paths = format.checkpoint(self).paths(self)?;
        format.open(&paths)
    }
}

/// Serialization format of a checkpoint.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum CheckpointFormat {
    PyTorch,
    SafeTensors,
}

impl CheckpointFormat {
    /// Find the checkpoint format used by a repository.
    fn probe(repo: &impl Repo) -> Self {
        if repo.exists(SAFETENSORS_SINGLE) || repo.exists(SAFETENSORS_INDEX) {
            CheckpointFormat::SafeTensors
        } else {
            CheckpointFormat::PyTorch
        }
    }

    /// Get the single-file or sharded checkpoint in this format.
    fn checkpoint(self, repo: &impl Repo) -> HFCheckpoint {
        let (index, single) = match self {
            CheckpointFormat::PyTorch => (PYTORCH_INDEX, PYTORCH_SINGLE),
            CheckpointFormat::SafeTensors => (SAFETENSORS_INDEX, SAFETENSORS_SINGLE),
        };

        if repo.exists(index) {
            HFCheckpoint::Multiple(index.into())
        } else {
            HFCheckpoint::Single(single.into())
        }
    }

    /// Open checkpoint files as a parameter backend.
    fn open(self, paths: &[PathBuf]) -> Result<Box<dyn SimpleBackend>, BoxedError> {
        Ok(match self {
            CheckpointFormat::PyTorch => {
                Box::new(PyTorchTensors::multi(paths).context(LoadCheckpointSnafu)?)
            }
            CheckpointFormat::SafeTensors => Box::new(unsafe {
                MmapedSafetensors::multi(paths).context(LoadCheckpointSnafu)?
            }),
        })
    }
}

/// PyTorch state dicts as a parameter backend.
struct PyTorchTensors {
    tensors: Vec<PthTensors>,
    routing: HashMap<String, usize>,
}

impl PyTorchTensors {
    fn multi(paths: &[impl AsRef<Path>]) -> Result<Self, candle_core::Error> {
        let mut routing = HashMap::new();
        let mut tensors = Vec::with_capacity(paths.len());

        for (index, path) in paths.iter().enumerate() {
            // PthTensors does not expose the tensor names.
            for info in read_pth_tensor_info(path, false, None)? {
                routing.insert(info.name, index);
            }
            tensors.push(PthTensors::new(path, None)?);
        }

        Ok(Self { tensors, routing })
    }

    fn tensor(&self, name: &str) -> Result<Tensor, candle_core::Error> {
        let not_found = || candle_core::Error::CannotFindTensor {
            path: name.to_string(),
        };
        let index = *self.routing.get(name).ok_or_else(not_found)?;
        self.tensors[index].get(name)?.ok_or_else(not_found)
    }
}

impl SimpleBackend for PyTorchTensors {
    fn get(
        &self,
        s: Shape,
        name: &str,
        _: Init,
        dtype: DType,
        dev: &Device,
    ) -> Result<Tensor, candle_core::Error> {
        let tensor = self.tensor(name)?.to_dtype(dtype)?.to_device(dev)?;
        if tensor.shape() != &s {
            Err(candle_core::Error::UnexpectedShape {
                msg: format!("shape mismatch for {name}"),
                expected: s,
                got: tensor.shape().clone(),
            })?
        }
        Ok(tensor)
    }

    fn contains_tensor(&self, name: &str) -> bool {
        self.routing.contains_key(name)
    }
}

enum HFCheckpoint {
    Single(PathBuf),
    Multiple(PathBuf),
}

impl HFCheckpoint {
    /// Get the local paths of the checkpoint files, downloading them when
    /// necessary.
    fn paths(&self, repo: &impl Repo) -> Result<Vec<PathBuf>, BoxedError> {
        match self {
            HFCheckpoint::Single(checkpoint_path) => {
                let name = checkpoint_path.to_string_lossy().to_string();
                let path = repo
                    .file(checkpoint_path)
                    .context(DownloadSnafu { name: name.clone() })?
                    .ok_or(HFCheckpointError::NonExistentCheckpoint { name })?;
                Ok(vec![path])
            }
            HFCheckpoint::Multiple(index_path) => {
                let name = index_path.to_string_lossy().to_string();
                let path = repo
                    .file(index_path)
                    .context(DownloadSnafu { name: name.clone() })?
                    .ok_or(HFCheckpointError::NonExistentCheckpointIndex { name })?;

                let index_file = BufReader::new(
                    File::open(&path).context(OpenCheckpointIndexSnafu { path: path.clone() })?,
                );
                let index: HFCheckpointIndex = serde_json::from_reader(index_file)
                    .context(ParseCheckpointIndexSnafu { path: path.clone() })?;

                index
                    .shards()
                    .into_iter()
                    .map(|shard_name| -> Result<PathBuf, BoxedError> {
                        Ok(repo
                            .file(&shard_name)
                            .context(DownloadSnafu {
                                name: shard_name.clone(),
                            })?
                            .ok_or(HFCheckpointError::NonExistentShard { name: shard_name })?)
                    })
                    .collect()
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct HFCheckpointIndex {
    weight_map: HashMap<String, String>,
}

impl HFCheckpointIndex {
    /// Get the names of the shards.
    fn shards(&self) -> BTreeSet<String> {
        self.weight_map.values().cloned().collect()
    }
}
