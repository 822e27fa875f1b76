use leo_tensor::{PureResult, TensorError};
use serde::{Deserialize, Serialize};

/// Hyperparameters consumed by the engine.
///
/// There is no process-wide configuration object: the driver constructs one
/// of these and passes it down through constructors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Hyperparameters {
    /// Latent adaptation step size (alpha).
    pub inner_loop_lr: f32,
    /// Segmentation-weight fine-tuning step size (beta).
    pub finetuning_lr: f32,
    /// Number of latent adaptation steps (K).
    pub num_adaptation_steps: usize,
    /// Number of fine-tuning steps (M).
    pub num_finetuning_steps: usize,
    /// Outer Adam learning rate.
    pub outer_loop_lr: f32,
    /// Element-wise bound applied to aggregated meta-gradients (G).
    pub max_grad_norm: f32,
    /// Drop probability inside decoder stages.
    pub dropout_rate: f32,
    /// Channel width of the first encoder stage; deeper stages scale from it.
    pub base_channel_width: usize,
    /// Fixed tiling width used when a gated decode receives a single example.
    pub ensemble_width: usize,
    /// Seed for weight initialization and dropout masks.
    pub seed: u64,
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Self {
            inner_loop_lr: 1e-3,
            finetuning_lr: 1e-3,
            num_adaptation_steps: 4,
            num_finetuning_steps: 4,
            outer_loop_lr: 1e-3,
            max_grad_norm: 1.0,
            dropout_rate: 0.1,
            base_channel_width: 4,
            ensemble_width: 5,
            seed: 42,
        }
    }
}

impl Hyperparameters {
    /// Rejects configurations the engine cannot run with.
    pub fn validate(&self) -> PureResult<()> {
        for (rate, _label) in [
            (self.inner_loop_lr, "inner_loop_lr"),
            (self.finetuning_lr, "finetuning_lr"),
            (self.outer_loop_lr, "outer_loop_lr"),
        ] {
            if rate <= 0.0 || !rate.is_finite() {
                return Err(TensorError::NonPositiveLearningRate { rate });
            }
        }
        if self.max_grad_norm <= 0.0 || !self.max_grad_norm.is_finite() {
            return Err(TensorError::NonFiniteValue {
                label: "max_grad_norm",
                value: self.max_grad_norm,
            });
        }
        if !(0.0..1.0).contains(&self.dropout_rate) {
            return Err(TensorError::InvalidValue {
                label: "dropout_rate",
            });
        }
        if self.num_adaptation_steps == 0 {
            return Err(TensorError::InvalidValue {
                label: "num_adaptation_steps",
            });
        }
        if self.num_finetuning_steps == 0 {
            return Err(TensorError::InvalidValue {
                label: "num_finetuning_steps",
            });
        }
        if self.base_channel_width == 0 {
            return Err(TensorError::InvalidValue {
                label: "base_channel_width",
            });
        }
        if self.ensemble_width == 0 {
            return Err(TensorError::InvalidValue {
                label: "ensemble_width",
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Hyperparameters::default().validate().unwrap();
    }

    #[test]
    fn rejects_zero_steps_and_rates() {
        let mut hyp = Hyperparameters::default();
        hyp.num_adaptation_steps = 0;
        assert!(hyp.validate().is_err());

        let mut hyp = Hyperparameters::default();
        hyp.inner_loop_lr = -1.0;
        assert!(hyp.validate().is_err());

        let mut hyp = Hyperparameters::default();
        hyp.dropout_rate = 1.0;
        assert!(hyp.validate().is_err());
    }

    #[test]
    fn deserializes_with_partial_fields() {
        let hyp: Hyperparameters =
            serde_json::from_str(r#"{"inner_loop_lr": 0.01, "num_adaptation_steps": 2}"#).unwrap();
        assert!((hyp.inner_loop_lr - 0.01).abs() < 1e-9);
        assert_eq!(hyp.num_adaptation_steps, 2);
        assert_eq!(hyp.num_finetuning_steps, 4);
    }
}
