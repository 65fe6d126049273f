use std::fmt::Debug;

use candle_core::ModuleT;
use candle_nn::VarBuilder;

use crate::error::BoxedError;

/// Configuration of an interchangeable module.
///
/// Layer configurations hold their normalization, dropout and activation
/// as `Box<dyn BuildModule>`, so that GPT-2 and ELECTRA can share layers.
pub trait BuildModule: Debug {
    fn build(&self, vb: VarBuilder) -> Result<Box<dyn ModuleT>, BoxedError>;
}
