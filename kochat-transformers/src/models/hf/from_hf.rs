use candle_core::{DType, Device};
use candle_nn::var_builder::SimpleBackend;
use candle_nn::{VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::architectures::BuildArchitecture;
use crate::error::BoxedError;
use crate::util::hf_backend::HFBackend;

#[derive(Debug, Snafu)]
pub enum FromHFError {
    #[snafu(display("Cannot build model"))]
    BuildModel { source: BoxedError },

    #[snafu(display("Cannot convert Hugging Face model config"))]
    ConvertConfig { source: BoxedError },

    #[snafu(display("Cannot copy parameter '{name}' into trainable variable"))]
    CopyParameter {
        name: String,
        source: candle_core::Error,
    },

    #[snafu(display("Cannot lock trainable variables"))]
    LockVariables,
}

/// A model with trainable parameters.
///
/// The parameters are stored in `var_map` under the library's parameter
/// names, so the map can be passed to an optimizer and saved as a
/// checkpoint.
pub struct TrainableModel<M> {
    pub model: M,
    pub var_map: VarMap,
}

/// Models that can be loaded from Huggingface transformers checkpoints.
pub trait FromHF {
    /// Model configuration.
    type Config: BuildArchitecture<Architecture = Self::Model>
        + TryFrom<Self::HFConfig, Error = BoxedError>;

    /// HF transformers model configuration.
    type HFConfig: Clone;

    /// The type of model that is constructed.
    ///
    /// Note that this is different from `Self`. `Self` is typically a
    /// unit struct that only implements various loading strategies.
    /// `Model` is a concrete model type such as `TransformerDecoder`.
    type Model;

    /// Construct a model from an HF model configuration and parameter backend.
    ///
    /// The parameters are used as-is (memory-mapped for safetensors) and
    /// cannot be trained.
    ///
    /// * `hf_config` - The Hugging Face transformers model configuration.
    /// * `backend` - The parameter store backend.
    /// * `device` - The device to place the model on.
    fn from_hf(
        hf_config: HFConfigWithDType<Self::HFConfig>,
        backend: Box<dyn SimpleBackend>,
        device: &Device,
    ) -> Result<Self::Model, FromHFError> {
        let config = Self::config(&hf_config)?;
        let vb = VarBuilder::from_backend(
            Self::hf_backend(backend),
            hf_config.dtype(),
            device.clone(),
        );
        config.build(vb).context(BuildModelSnafu)
    }

    /// Construct a trainable model from an HF model configuration and
    /// parameter backend.
    ///
    /// The model is first built with freshly initialized `f32` variables.
    /// Then every variable is overwritten with the corresponding
    /// parameter of the checkpoint.
    ///
    /// * `hf_config` - The Hugging Face transformers model configuration.
    /// * `backend` - The parameter store backend.
    /// * `device` - The device to place the model on.
    fn from_hf_trainable(
        hf_config: HFConfigWithDType<Self::HFConfig>,
        backend: Box<dyn SimpleBackend>,
        device: &Device,
    ) -> Result<TrainableModel<Self::Model>, FromHFError> {
        let config = Self::config(&hf_config)?;

        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, device);
        let model = config.build(vb).context(BuildModelSnafu)?;

        let checkpoint =
            VarBuilder::from_backend(Self::hf_backend(backend), DType::F32, device.clone());
        {
            let vars = var_map.data().lock().map_err(|_| FromHFError::LockVariables)?;
            for (name, var) in vars.iter() {
                checkpoint
                    .get(var.dims(), name)
                    .and_then(|tensor| var.set(&tensor))
                    .context(CopyParameterSnafu { name })?;
            }
        }

        Ok(TrainableModel { model, var_map })
    }

    /// Construct a model from parameters that use the library's own
    /// parameter names, such as a fine-tuned checkpoint saved from a
    /// `VarMap`.
    ///
    /// * `hf_config` - The Hugging Face transformers model configuration.
    /// * `backend` - The parameter store backend.
    /// * `device` - The device to place the model on.
    fn from_backend(
        hf_config: HFConfigWithDType<Self::HFConfig>,
        backend: Box<dyn SimpleBackend>,
        device: &Device,
    ) -> Result<Self::Model, FromHFError> {
        let config = Self::config(&hf_config)?;
        let vb = VarBuilder::from_backend(backend, DType::F32, device.clone());
        config.build(vb).context(BuildModelSnafu)
    }

    /// Convert the HF configuration into a model configuration.
    fn config(hf_config: &HFConfigWithDType<Self::HFConfig>) -> Result<Self::Config, FromHFError> {
        // Ideally we would not clone here, but TryFrom<&...> adds a lot of
        // pesky lifetime annotations everywhere.
        Self::Config::try_from(hf_config.config().clone()).context(ConvertConfigSnafu)
    }

    /// Wrap a backend with HF parameter names, so that it can be read
    /// using the library's parameter names.
    fn hf_backend(backend: Box<dyn SimpleBackend>) -> Box<dyn SimpleBackend> {
        Box::new(HFBackend::new(
            backend,
            Self::rename_parameters(),
            Self::transpose_parameters(),
        ))
    }

    /// Create a parameter renaming function.
    ///
    /// This method should return a function that renames library
    /// parameter names to Hugging Face transformers parameter names.
    fn rename_parameters() -> impl Fn(&str) -> String + Send + Sync + 'static;

    /// Create a predicate for parameters that are stored transposed.
    ///
    /// The predicate receives library parameter names.
    ///
    /// Default: no parameter is transposed.
    fn transpose_parameters() -> impl Fn(&str) -> bool + Send + Sync + 'static {
        |_| false
    }
}

/// Torch dtype
#[non_exhaustive]
#[derive(Debug, Default, Clone, Copy, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
enum TorchDType {
    BFloat16,
    Float16,
    #[default]
    Float32,
}

/// Simple wrapper for a HF config that exposes the dtype.
///
/// Older configurations do not specify `torch_dtype`, these are assumed
/// to be `float32`.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
pub struct HFConfigWithDType<T> {
    #[serde(flatten)]
    config: T,
    #[serde(default)]
    torch_dtype: TorchDType,
}

impl<T> HFConfigWithDType<T> {
    /// Get the configuration.
    pub fn config(&self) -> &T {
        &self.config
    }

    /// Get the dtype.
    pub fn dtype(&self) -> DType {
        match self.torch_dtype {
            TorchDType::BFloat16 => DType::BF16,
            TorchDType::Float16 => DType::F16,
            TorchDType::Float32 => DType::F32,
        }
    }
}
