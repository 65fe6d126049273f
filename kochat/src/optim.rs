//! Optimizer, learning rate schedule and gradient clipping.
use std::f64::consts::PI;

use candle_core::backprop::GradStore;
use candle_core::{DType, Var};
use candle_nn::{Optimizer, ParamsAdamW, VarMap};
use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
pub enum OptimError {
    #[snafu(display("Cannot lock trainable variables"))]
    LockVariables,

    #[snafu(display("Cannot create optimizer"))]
    CreateOptimizer { source: candle_core::Error },

    #[snafu(display("Cannot apply optimizer step"))]
    Step { source: candle_core::Error },

    #[snafu(display("Cannot clip gradients"))]
    ClipGradients { source: candle_core::Error },
}

/// Parameters with and without weight decay.
pub struct ParameterGroups {
    pub decay: Vec<Var>,
    pub no_decay: Vec<Var>,
}

impl ParameterGroups {
    /// Split the variables of a model into parameter groups.
    ///
    /// Biases and layer norm parameters are not decayed.
    pub fn from_var_map(var_map: &VarMap) -> Result<Self, OptimError> {
        let vars = var_map.data().lock().map_err(|_| OptimError::LockVariables)?;
        let mut named = vars.iter().collect::<Vec<_>>();
        named.sort_by(|(a, _), (b, _)| a.cmp(b));

        let (no_decay, decay): (Vec<_>, Vec<_>) = named
            .into_iter()
            .partition(|(name, _)| is_no_decay(name));
        let vars_of = |group: Vec<(&String, &Var)>| {
            group.into_iter().map(|(_, var)| var.clone()).collect()
        };

        Ok(ParameterGroups {
            decay: vars_of(decay),
            no_decay: vars_of(no_decay),
        })
    }

    /// All parameters, decayed parameters first.
    pub fn all(&self) -> Vec<Var> {
        self.decay.iter().chain(&self.no_decay).cloned().collect()
    }
}

fn is_no_decay(name: &str) -> bool {
    name.contains("bias") || name.contains("layer_norm")
}

/// Parameter with its moment estimates.
struct AdamWVar {
    var: Var,
    first_moment: Var,
    second_moment: Var,
}

/// AdamW without bias correction.
///
/// The moment estimates are used as is, early steps are not rescaled
/// by `1 / (1 - beta^t)`.
pub struct UncorrectedAdamW {
    vars: Vec<AdamWVar>,
    params: ParamsAdamW,
}

impl Optimizer for UncorrectedAdamW {
    type Config = ParamsAdamW;

    fn new(vars: Vec<Var>, params: ParamsAdamW) -> candle_core::Result<Self> {
        let vars = vars
            .into_iter()
            .filter(|var| var.dtype().is_float())
            .map(|var| {
                let first_moment = Var::zeros(var.shape(), var.dtype(), var.device())?;
                let second_moment = Var::zeros(var.shape(), var.dtype(), var.device())?;
                Ok(AdamWVar {
                    var,
                    first_moment,
                    second_moment,
                })
            })
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(UncorrectedAdamW { vars, params })
    }

    fn step(&mut self, grads: &GradStore) -> candle_core::Result<()> {
        let params = &self.params;
        for adamw_var in &self.vars {
            let Some(grad) = grads.get(&adamw_var.var) else {
                continue;
            };

            let first_moment = adamw_var
                .first_moment
                .affine(params.beta1, 0.)?
                .add(&grad.affine(1. - params.beta1, 0.)?)?;
            let second_moment = adamw_var
                .second_moment
                .affine(params.beta2, 0.)?
                .add(&grad.sqr()?.affine(1. - params.beta2, 0.)?)?;
            let update = first_moment.div(&second_moment.sqrt()?.affine(1., params.eps)?)?;
            let var = adamw_var
                .var
                .affine(1. - params.lr * params.weight_decay, 0.)?
                .sub(&update.affine(params.lr, 0.)?)?;

            adamw_var.first_moment.set(&first_moment)?;
            adamw_var.second_moment.set(&second_moment)?;
            adamw_var.var.set(&var)?;
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }
}

/// AdamW with separate weight decay per parameter group.
///
/// Both groups share the same learning rate.
pub struct GroupedAdamW {
    decay: UncorrectedAdamW,
    no_decay: UncorrectedAdamW,
}

impl GroupedAdamW {
    /// Create the optimizer.
    ///
    /// * `groups` - Parameters to optimize.
    /// * `lr` - Initial learning rate.
    /// * `weight_decay` - Weight decay of the decayed group.
    pub fn new(groups: &ParameterGroups, lr: f64, weight_decay: f64) -> Result<Self, OptimError> {
        let params = |weight_decay| ParamsAdamW {
            lr,
            eps: 1e-6,
            weight_decay,
            ..ParamsAdamW::default()
        };
        Ok(GroupedAdamW {
            decay: UncorrectedAdamW::new(groups.decay.clone(), params(weight_decay))
                .context(CreateOptimizerSnafu)?,
            no_decay: UncorrectedAdamW::new(groups.no_decay.clone(), params(0.))
                .context(CreateOptimizerSnafu)?,
        })
    }

    pub fn learning_rate(&self) -> f64 {
        self.decay.learning_rate()
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.decay.set_learning_rate(lr);
        self.no_decay.set_learning_rate(lr);
    }

    /// Update the parameters using their gradients.
    pub fn step(&mut self, grads: &GradStore) -> Result<(), OptimError> {
        self.decay.step(grads).context(StepSnafu)?;
        self.no_decay.step(grads).context(StepSnafu)
    }
}

/// Linear warmup followed by a cosine decay to zero.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CosineWithWarmup {
    pub warmup_steps: usize,
    pub total_steps: usize,
}

impl CosineWithWarmup {
    /// Create a schedule where the first `warmup_ratio` of the steps are
    /// warmup steps.
    pub fn with_warmup_ratio(total_steps: usize, warmup_ratio: f64) -> Self {
        CosineWithWarmup {
            warmup_steps: (total_steps as f64 * warmup_ratio).floor() as usize,
            total_steps,
        }
    }

    /// Learning rate multiplier at a step, counted from zero.
    pub fn multiplier(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            return step as f64 / self.warmup_steps.max(1) as f64;
        }

        let decay_steps = self.total_steps.saturating_sub(self.warmup_steps).max(1);
        let progress = (step - self.warmup_steps) as f64 / decay_steps as f64;
        (0.5 * (1. + (PI * progress).cos())).max(0.)
    }
}

/// Rescale gradients when their global L2 norm exceeds `max_norm`.
///
/// Returns the norm before clipping.
pub fn clip_grad_norm(
    grads: &mut GradStore,
    vars: &[Var],
    max_norm: f64,
) -> Result<f64, OptimError> {
    let mut sum_sq = 0f64;
    for var in vars {
        if let Some(grad) = grads.get(var) {
            sum_sq += grad
                .sqr()
                .and_then(|sq| sq.sum_all())
                .and_then(|sum| sum.to_dtype(DType::F64))
                .and_then(|sum| sum.to_scalar::<f64>())
                .context(ClipGradientsSnafu)?;
        }
    }
    let total_norm = sum_sq.sqrt();

    if total_norm > max_norm {
        let scale = max_norm / (total_norm + 1e-6);
        for var in vars {
            if let Some(grad) = grads.get(var) {
                let clipped = grad.affine(scale, 0.).context(ClipGradientsSnafu)?;
                grads.insert(var, clipped);
            }
        }
    }

    Ok(total_norm)
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use candle_core::{DType, Device, Var};
    use candle_nn::{Init, VarMap};
    use rstest::rstest;
    use snafu::{report, ResultExt, Whatever};

    use super::{clip_grad_norm, CosineWithWarmup, GroupedAdamW, ParameterGroups};

    #[rstest]
    #[case(0, 0.)]
    #[case(5, 0.5)]
    #[case(10, 1.)]
    #[case(55, 0.5)]
    #[case(100, 0.)]
    fn cosine_schedule_with_warmup(#[case] step: usize, #[case] multiplier: f64) {
        let schedule = CosineWithWarmup {
            warmup_steps: 10,
            total_steps: 100,
        };
        assert_relative_eq!(schedule.multiplier(step), multiplier, epsilon = 1e-9);
    }

    #[test]
    fn warmup_steps_from_ratio() {
        let schedule = CosineWithWarmup::with_warmup_ratio(123, 0.1);
        assert_eq!(schedule.warmup_steps, 12);
        assert_eq!(schedule.total_steps, 123);

        // No warmup: starts at the full learning rate.
        let schedule = CosineWithWarmup::with_warmup_ratio(10, 0.);
        assert_relative_eq!(schedule.multiplier(0), 1.);
    }

    #[test]
    #[report]
    fn splits_parameter_groups() -> Result<(), Whatever> {
        let var_map = VarMap::new();
        for name in [
            "decoder.layer_0.attention.output.weight",
            "decoder.layer_0.attention.output.bias",
            "decoder.layer_0.attn_input_layer_norm.weight",
            "decoder.embeddings.piece_embeddings.weight",
        ] {
            var_map
                .get((2, 2), name, Init::Const(1.), DType::F32, &Device::Cpu)
                .whatever_context("Cannot create variable")?;
        }

        let groups = ParameterGroups::from_var_map(&var_map).whatever_context("Cannot split")?;
        assert_eq!(groups.decay.len(), 2);
        assert_eq!(groups.no_decay.len(), 2);
        assert_eq!(groups.all().len(), 4);

        Ok(())
    }

    #[test]
    #[report]
    fn clips_global_norm() -> Result<(), Whatever> {
        let device = Device::Cpu;
        let a = Var::new(&[1f32, 2.], &device).whatever_context("Cannot create variable")?;
        let b = Var::new(&[3f32], &device).whatever_context("Cannot create variable")?;
        // Gradients: a = [2, 4], b = [6], so the norm is sqrt(56).
        let loss = a
            .sqr()
            .and_then(|a_sq| a_sq.sum_all())
            .and_then(|a_sq| b.sqr()?.sum_all()?.add(&a_sq))
            .whatever_context("Cannot compute loss")?;
        let mut grads = loss.backward().whatever_context("Cannot backprop")?;

        let vars = [a.clone(), b.clone()];
        let norm = clip_grad_norm(&mut grads, &vars, 1.).whatever_context("Cannot clip")?;
        assert_relative_eq!(norm, 56f64.sqrt(), epsilon = 1e-5);

        let clipped = clip_grad_norm(&mut grads, &vars, 1.).whatever_context("Cannot clip")?;
        assert_relative_eq!(clipped, 1., epsilon = 1e-5);

        // Below the maximum, gradients are untouched.
        let unchanged = clip_grad_norm(&mut grads, &vars, 2.).whatever_context("Cannot clip")?;
        assert_relative_eq!(unchanged, clipped, epsilon = 1e-9);

        Ok(())
    }

    #[test]
    #[report]
    fn decays_only_decay_group() -> Result<(), Whatever> {
        let device = Device::Cpu;
        let var_map = VarMap::new();
        let weight = var_map
            .get((2,), "output.weight", Init::Const(1.), DType::F32, &device)
            .whatever_context("Cannot create variable")?;
        let bias = var_map
            .get((2,), "output.bias", Init::Const(1.), DType::F32, &device)
            .whatever_context("Cannot create variable")?;

        let groups = ParameterGroups::from_var_map(&var_map).whatever_context("Cannot split")?;
        let mut optimizer =
            GroupedAdamW::new(&groups, 0.1, 0.5).whatever_context("Cannot create optimizer")?;

        // Zero gradients: only weight decay changes parameters.
        let loss = weight
            .affine(0., 0.)
            .and_then(|weight| weight.add(&bias.affine(0., 0.)?))
            .and_then(|sum| sum.sum_all())
            .whatever_context("Cannot compute loss")?;
        let grads = loss.backward().whatever_context("Cannot backprop")?;
        optimizer.step(&grads).whatever_context("Cannot step")?;

        let weight = weight.to_vec1::<f32>().whatever_context("Cannot convert")?;
        let bias = bias.to_vec1::<f32>().whatever_context("Cannot convert")?;
        assert_relative_eq!(weight[0], 1. - 0.1 * 0.5, epsilon = 1e-6);
        assert_relative_eq!(bias[0], 1., epsilon = 1e-6);

        optimizer.set_learning_rate(0.01);
        assert_relative_eq!(optimizer.learning_rate(), 0.01);

        Ok(())
    }

    #[test]
    #[report]
    fn moments_are_not_bias_corrected() -> Result<(), Whatever> {
        let device = Device::Cpu;
        let var_map = VarMap::new();
        let weight = var_map
            .get((1,), "output.weight", Init::Const(1.), DType::F32, &device)
            .whatever_context("Cannot create variable")?;

        let groups = ParameterGroups::from_var_map(&var_map).whatever_context("Cannot split")?;
        let mut optimizer =
            GroupedAdamW::new(&groups, 0.1, 0.5).whatever_context("Cannot create optimizer")?;

        // The gradient of the weight is 3.
        let loss = weight
            .affine(3., 0.)
            .and_then(|loss| loss.sum_all())
            .whatever_context("Cannot compute loss")?;
        let grads = loss.backward().whatever_context("Cannot backprop")?;
        optimizer.step(&grads).whatever_context("Cannot step")?;

        let first_moment = (1. - 0.9) * 3.;
        let second_moment = (1. - 0.999) * 9f64;
        let expected = (1. - 0.1 * 0.5) - 0.1 * first_moment / (second_moment.sqrt() + 1e-6);
        let weight = weight.to_vec1::<f32>().whatever_context("Cannot convert")?;
        assert_relative_eq!(weight[0] as f64, expected, epsilon = 1e-5);

        // With bias correction the step would be exactly the learning rate.
        assert!((weight[0] as f64 - (1. - 0.1 * 0.5 - 0.1)).abs() > 0.1);

        Ok(())
    }
}
