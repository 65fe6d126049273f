use candle_core::{Module, ModuleT, Tensor};
use candle_nn::VarBuilder;

use crate::error::BoxedError;
use crate::layers::build_module::BuildModule;

/// Returns its input unchanged.
///
/// Fills the slots of optional modules, for instance the dropout of a
/// layer at inference time or a layer norm that GPT-2 does not apply.
#[derive(Clone, Debug)]
pub struct Identity;

impl BuildModule for Identity {
    fn build(&self, _vb: VarBuilder) -> Result<Box<dyn ModuleT>, BoxedError> {
        Ok(Box::new(Identity))
    }
}

impl Module for Identity {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        Ok(xs.clone())
    }
}
