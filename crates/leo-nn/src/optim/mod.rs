use crate::module::Module;
use leo_tensor::{PureResult, Tensor, TensorError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Element-wise clamp of a gradient tensor to `[-bound, bound]`.
///
/// Idempotent: clipping an already-clipped tensor is a no-op.
pub fn clip_gradient(gradient: &mut Tensor, bound: f32) -> PureResult<()> {
    if bound <= 0.0 || !bound.is_finite() {
        return Err(TensorError::NonFiniteValue {
            label: "max_grad_norm",
            value: bound,
        });
    }
    gradient.clamp_(-bound, bound)
}

/// Adam hyperparameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AdamConfig {
    pub learning_rate: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub eps: f32,
}

impl AdamConfig {
    /// Standard betas with a caller-supplied learning rate.
    pub fn with_learning_rate(learning_rate: f32) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MomentBuf {
    m: Vec<f32>,
    v: Vec<f32>,
}

impl MomentBuf {
    fn zeros(len: usize) -> Self {
        Self {
            m: vec![0.0; len],
            v: vec![0.0; len],
        }
    }
}

/// Serializable snapshot of an optimizer's moment state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdamState {
    step: u64,
    moments: HashMap<String, MomentBuf>,
}

/// Moment-based adaptive optimizer with per-parameter-name buffers.
///
/// One `step_*` call advances the shared step counter once; bias correction
/// uses that counter, matching the reference Adam recurrence.
#[derive(Debug, Clone)]
pub struct Adam {
    config: AdamConfig,
    step: u64,
    moments: HashMap<String, MomentBuf>,
}

impl Adam {
    pub fn new(config: AdamConfig) -> PureResult<Self> {
        if config.learning_rate <= 0.0 || !config.learning_rate.is_finite() {
            return Err(TensorError::NonPositiveLearningRate {
                rate: config.learning_rate,
            });
        }
        for (value, label) in [
            (config.beta1, "adam_beta1"),
            (config.beta2, "adam_beta2"),
        ] {
            if !(0.0..1.0).contains(&value) {
                return Err(TensorError::NonFiniteValue { label, value });
            }
        }
        Ok(Self {
            config,
            step: 0,
            moments: HashMap::new(),
        })
    }

    /// Returns the configured hyperparameters.
    pub fn config(&self) -> AdamConfig {
        self.config
    }

    /// Number of update steps taken so far.
    pub fn step_count(&self) -> u64 {
        self.step
    }

    /// Advances the shared step counter. Call once per logical update, then
    /// apply [`Adam::update`] to every parameter in the group.
    pub fn begin_step(&mut self) {
        self.step += 1;
    }

    /// Applies one bias-corrected update to a single named tensor using the
    /// current step counter. Pair with [`Adam::begin_step`].
    pub fn update(&mut self, name: &str, value: &mut Tensor, gradient: &Tensor) -> PureResult<()> {
        let (bc1_inv, bc2_inv) = self.bias_corrections();
        self.update_buffer(name, value, gradient, bc1_inv, bc2_inv)
    }

    fn update_buffer(
        &mut self,
        name: &str,
        value: &mut Tensor,
        gradient: &Tensor,
        bc1_inv: f32,
        bc2_inv: f32,
    ) -> PureResult<()> {
        if value.shape() != gradient.shape() {
            return Err(TensorError::ShapeMismatch {
                left: value.shape(),
                right: gradient.shape(),
            });
        }
        let buf = self
            .moments
            .entry(name.to_string())
            .or_insert_with(|| MomentBuf::zeros(value.len()));
        if buf.m.len() != value.len() {
            return Err(TensorError::DataLength {
                expected: value.len(),
                got: buf.m.len(),
            });
        }
        let c = self.config;
        let values = value.data_mut();
        for (i, g) in gradient.data().iter().enumerate() {
            buf.m[i] = c.beta1 * buf.m[i] + (1.0 - c.beta1) * g;
            buf.v[i] = c.beta2 * buf.v[i] + (1.0 - c.beta2) * g * g;
            let m_hat = buf.m[i] * bc1_inv;
            let v_hat = buf.v[i] * bc2_inv;
            values[i] -= c.learning_rate * m_hat / (v_hat.sqrt() + c.eps);
        }
        Ok(())
    }

    fn bias_corrections(&self) -> (f32, f32) {
        let t = self.step as f32;
        (
            1.0 / (1.0 - self.config.beta1.powf(t)),
            1.0 / (1.0 - self.config.beta2.powf(t)),
        )
    }

    /// Applies one update to every parameter of `module` that holds a
    /// gradient. Parameters without a gradient are skipped (zero
    /// contribution). Gradients are consumed by the step.
    pub fn step_module<M: Module>(&mut self, module: &mut M) -> PureResult<()> {
        self.step += 1;
        let (bc1_inv, bc2_inv) = self.bias_corrections();
        module.visit_parameters_mut(&mut |param| {
            let Some(grad) = param.gradient().cloned() else {
                return Ok(());
            };
            let name = param.name().to_string();
            let mut value = param.value().clone();
            self.update_buffer(&name, &mut value, &grad, bc1_inv, bc2_inv)?;
            param.load_value(&value)?;
            param.zero_gradient();
            Ok(())
        })
    }

    /// Applies one update to a free-standing tensor (e.g. the segmentation
    /// meta-weights, which are not a module parameter).
    pub fn step_tensor(
        &mut self,
        name: &str,
        value: &mut Tensor,
        gradient: &Tensor,
    ) -> PureResult<()> {
        self.step += 1;
        let (bc1_inv, bc2_inv) = self.bias_corrections();
        self.update_buffer(name, value, gradient, bc1_inv, bc2_inv)
    }

    /// Exports the moment state for checkpointing.
    pub fn state(&self) -> AdamState {
        AdamState {
            step: self.step,
            moments: self.moments.clone(),
        }
    }

    /// Restores a previously exported moment state.
    pub fn load_state(&mut self, state: AdamState) {
        self.step = state.step;
        self.moments = state.moments;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::conv::Conv2d;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn clipping_is_idempotent() {
        let mut grad = Tensor::from_vec(1, 4, vec![-5.0, -0.2, 0.2, 5.0]).unwrap();
        clip_gradient(&mut grad, 1.0).unwrap();
        let once = grad.clone();
        clip_gradient(&mut grad, 1.0).unwrap();
        assert_eq!(grad, once);
        assert_eq!(grad.data(), &[-1.0, -0.2, 0.2, 1.0]);
    }

    #[test]
    fn clipping_rejects_bad_bounds() {
        let mut grad = Tensor::zeros(1, 1).unwrap();
        assert!(clip_gradient(&mut grad, 0.0).is_err());
        assert!(clip_gradient(&mut grad, f32::NAN).is_err());
    }

    #[test]
    fn constant_gradient_drives_tensor_down() {
        let mut adam = Adam::new(AdamConfig::with_learning_rate(0.01)).unwrap();
        let mut value = Tensor::from_vec(1, 2, vec![1.0, 1.0]).unwrap();
        let grad = Tensor::from_vec(1, 2, vec![1.0, 1.0]).unwrap();
        for _ in 0..50 {
            adam.step_tensor("w", &mut value, &grad).unwrap();
        }
        assert!(value.data().iter().all(|v| *v < 1.0));
        assert_eq!(adam.step_count(), 50);
    }

    #[test]
    fn module_step_consumes_gradients() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut conv = Conv2d::new("c", 1, 1, (1, 1), (1, 1), (0, 0), (2, 2), &mut rng).unwrap();
        let input = Tensor::from_vec(1, 4, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let grad = Tensor::from_vec(1, 4, vec![1.0, 1.0, 1.0, 1.0]).unwrap();
        use crate::module::Module;
        conv.backward(&input, &grad).unwrap();
        let before = conv.state_dict().unwrap();
        let mut adam = Adam::new(AdamConfig::with_learning_rate(0.05)).unwrap();
        adam.step_module(&mut conv).unwrap();
        let after = conv.state_dict().unwrap();
        assert_ne!(before, after);
        conv.visit_parameters(&mut |p| {
            assert!(p.gradient().is_none());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn state_roundtrip_preserves_updates() {
        let grad = Tensor::from_vec(1, 2, vec![0.3, -0.7]).unwrap();
        let mut a = Adam::new(AdamConfig::with_learning_rate(0.01)).unwrap();
        let mut value_a = Tensor::from_vec(1, 2, vec![0.5, 0.5]).unwrap();
        a.step_tensor("w", &mut value_a, &grad).unwrap();

        let mut b = Adam::new(AdamConfig::with_learning_rate(0.01)).unwrap();
        b.load_state(a.state());
        let mut value_b = value_a.clone();
        let mut value_a2 = value_a.clone();
        a.step_tensor("w", &mut value_a2, &grad).unwrap();
        b.step_tensor("w", &mut value_b, &grad).unwrap();
        assert_eq!(value_a2, value_b);
    }
}
