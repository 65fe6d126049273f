use candle_core::ModuleT;
use candle_nn::{layer_norm, VarBuilder};
use snafu::{ResultExt, Snafu};

use crate::error::BoxedError;
use crate::layers::build_module::BuildModule;

#[derive(Debug, Snafu)]
pub enum LayerNormError {
    #[snafu(display("Cannot build layer norm of size {size}"))]
    BuildLayerNorm {
        size: usize,
        source: candle_core::Error,
    },
}

/// Layer norm with a learned scale and bias.
///
/// GPT-2 normalizes with `eps = 1e-5`, ELECTRA with `eps = 1e-12`.
#[derive(Clone, Debug)]
pub struct LayerNormConfig {
    eps: f64,
    size: usize,
}

impl LayerNormConfig {
    /// Added to the variance for numerical stability.
    ///
    /// Default: `1e-12`
    pub fn eps(mut self, eps: f64) -> Self {
        self.eps = eps;
        self
    }

    /// Width of the normalized representations.
    ///
    /// Default: `768`
    pub fn size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }
}

impl Default for LayerNormConfig {
    fn default() -> Self {
        LayerNormConfig {
            eps: 1e-12,
            size: 768,
        }
    }
}

impl BuildModule for LayerNormConfig {
    fn build(&self, vb: VarBuilder) -> Result<Box<dyn ModuleT>, BoxedError> {
        let norm = layer_norm(self.size, self.eps, vb)
            .context(BuildLayerNormSnafu { size: self.size })?;
        Ok(Box::new(norm))
    }
}
