use candle_core::{DType, Device, Shape, Tensor};
use candle_nn::var_builder::SimpleBackend;
use candle_nn::Init;

/// Reads parameters of a Hugging Face checkpoint under library names.
///
/// Every parameter name is first mapped to its checkpoint name. GPT-2
/// checkpoints store the weights of their `Conv1D` modules as `(in, out)`
/// matrices, while `candle_nn::Linear` expects `(out, in)`. Parameters for
/// which `transpose` holds are read with the swapped shape and transposed.
pub struct HFBackend<R, T>
where
    R: Fn(&str) -> String + Send + Sync,
    T: Fn(&str) -> bool + Send + Sync,
{
    inner: Box<dyn SimpleBackend>,
    rename: R,
    transpose: T,
}

impl<R, T> HFBackend<R, T>
where
    R: Fn(&str) -> String + Send + Sync,
    T: Fn(&str) -> bool + Send + Sync,
{
    /// Wrap `inner`, which holds parameters under checkpoint names.
    ///
    /// `rename` maps library names to checkpoint names and `transpose`
    /// selects parameters by their library name.
    pub fn new(inner: Box<dyn SimpleBackend>, rename: R, transpose: T) -> Self {
        HFBackend {
            inner,
            rename,
            transpose,
        }
    }
}

impl<R, T> SimpleBackend for HFBackend<R, T>
where
    R: Fn(&str) -> String + Send + Sync,
    T: Fn(&str) -> bool + Send + Sync,
{
    fn get(
        &self,
        s: Shape,
        name: &str,
        h: Init,
        dtype: DType,
        dev: &Device,
    ) -> candle_core::Result<Tensor> {
        let hf_name = (self.rename)(name);
        if !(self.transpose)(name) {
            return self.inner.get(s, &hf_name, h, dtype, dev);
        }

        let (rows, cols) = s.dims2()?;
        self.inner
            .get(Shape::from((cols, rows)), &hf_name, h, dtype, dev)?
            .t()?
            .contiguous()
    }

    fn contains_tensor(&self, name: &str) -> bool {
        self.inner.contains_tensor(&(self.rename)(name))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use candle_core::{DType, Device, Tensor, Var};
    use candle_nn::init::ZERO;
    use candle_nn::{VarBuilder, VarMap};
    use snafu::{report, ResultExt, Whatever};

    use super::HFBackend;

    #[test]
    fn renames_parameters() {
        let var_map = VarMap::new();
        let backend = HFBackend::new(
            Box::new(var_map.clone()),
            |name: &str| {
                name.replace("decoder.", "transformer.")
                    .replace("embeddings.piece_embeddings", "wte")
            },
            |_: &str| false,
        );
        let vb = VarBuilder::from_backend(Box::new(backend), DType::F32, Device::Cpu);
        vb.get_with_hints((100, 32), "decoder.embeddings.piece_embeddings.weight", ZERO)
            .unwrap();
        vb.get_with_hints((32,), "decoder.output_layer_norm.bias", ZERO)
            .unwrap();

        let data = var_map.data().lock().unwrap();
        assert_eq!(
            data.keys().cloned().collect::<HashSet<_>>(),
            HashSet::from([
                "transformer.wte.weight".to_string(),
                "transformer.output_layer_norm.bias".to_string()
            ])
        );
    }

    #[test]
    #[report]
    fn transposes_conv1d_weights() -> Result<(), Whatever> {
        let var_map = VarMap::new();
        let stored = Tensor::arange(0f32, 6., &Device::Cpu)
            .and_then(|xs| xs.reshape((2, 3)))
            .whatever_context("Cannot create tensor")?;
        for name in ["h.0.attn.c_attn.weight", "h.0.ln_1.weight"] {
            let var = Var::from_tensor(&stored).whatever_context("Cannot create variable")?;
            var_map.data().lock().unwrap().insert(name.to_string(), var);
        }

        let backend = HFBackend::new(
            Box::new(var_map),
            |name: &str| name.replace("layer_0.", "h.0."),
            |name: &str| name.contains("c_attn"),
        );
        let vb = VarBuilder::from_backend(Box::new(backend), DType::F32, Device::Cpu);

        let transposed = vb
            .get_with_hints((3, 2), "layer_0.attn.c_attn.weight", ZERO)
            .and_then(|weight| weight.to_vec2::<f32>())
            .whatever_context("Cannot get transposed parameter")?;
        assert_eq!(transposed, [[0., 3.], [1., 4.], [2., 5.]]);

        let untouched = vb
            .get_with_hints((2, 3), "layer_0.ln_1.weight", ZERO)
            .whatever_context("Cannot get parameter")?;
        assert_eq!(untouched.dims(), &[2, 3]);

        Ok(())
    }
}
