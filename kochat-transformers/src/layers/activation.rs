use candle_core::ModuleT;
use candle_nn::{Activation as CandleActivation, VarBuilder};
use serde::{Deserialize, Serialize};

use crate::error::BoxedError;
use crate::layers::build_module::BuildModule;

/// Nonlinearity of feed-forward and classification layers.
///
/// Deserializes from the `activation_function` of GPT-2 and the
/// `hidden_act` of ELECTRA configurations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    /// GELU with the exact Gaussian CDF, used by ELECTRA.
    Gelu,

    /// GELU with the tanh approximation, used by GPT-2.
    GeluNew,

    Relu,
}

impl BuildModule for Activation {
    fn build(&self, _vb: VarBuilder) -> Result<Box<dyn ModuleT>, BoxedError> {
        let activation = match self {
            Activation::Gelu => CandleActivation::Gelu,
            Activation::GeluNew => CandleActivation::NewGelu,
            Activation::Relu => CandleActivation::Relu,
        };
        Ok(Box::new(activation))
    }
}
