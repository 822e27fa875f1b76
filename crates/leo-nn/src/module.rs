use leo_tensor::{PureResult, Tensor, TensorError};
use std::collections::HashMap;

/// Trainable parameter holding a value tensor and an optional accumulated
/// Euclidean gradient. `None` means "no gradient reported yet"; consumers
/// treat it as a zero contribution.
#[derive(Debug, Clone)]
pub struct Parameter {
    name: String,
    value: Tensor,
    gradient: Option<Tensor>,
}

impl Parameter {
    /// Creates a new parameter with the provided tensor value.
    pub fn new(name: impl Into<String>, value: Tensor) -> Self {
        Self {
            name: name.into(),
            value,
            gradient: None,
        }
    }

    /// Returns the identifier assigned to the parameter.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Provides an immutable view into the underlying tensor value.
    pub fn value(&self) -> &Tensor {
        &self.value
    }

    /// Provides a mutable view into the underlying tensor value.
    pub fn value_mut(&mut self) -> &mut Tensor {
        &mut self.value
    }

    /// Returns the currently accumulated gradient, if any.
    pub fn gradient(&self) -> Option<&Tensor> {
        self.gradient.as_ref()
    }

    fn assert_shape(&self, tensor: &Tensor) -> PureResult<()> {
        if self.value.shape() != tensor.shape() {
            return Err(TensorError::ShapeMismatch {
                left: self.value.shape(),
                right: tensor.shape(),
            });
        }
        Ok(())
    }

    /// Adds `update` into the gradient accumulator.
    pub fn accumulate_euclidean(&mut self, update: &Tensor) -> PureResult<()> {
        self.assert_shape(update)?;
        match self.gradient.as_mut() {
            Some(existing) => existing.add_scaled(update, 1.0)?,
            None => self.gradient = Some(update.clone()),
        }
        Ok(())
    }

    /// Replaces the accumulated gradient wholesale.
    pub fn set_gradient(&mut self, gradient: Tensor) -> PureResult<()> {
        self.assert_shape(&gradient)?;
        self.gradient = Some(gradient);
        Ok(())
    }

    /// Clears the accumulated gradient.
    pub fn zero_gradient(&mut self) {
        self.gradient = None;
    }

    /// Applies one plain gradient-descent step and clears the accumulator.
    pub fn apply_step(&mut self, learning_rate: f32) -> PureResult<()> {
        if learning_rate <= 0.0 || !learning_rate.is_finite() {
            return Err(TensorError::NonPositiveLearningRate {
                rate: learning_rate,
            });
        }
        if let Some(grad) = self.gradient.take() {
            self.value.add_scaled(&grad, -learning_rate)?;
        }
        Ok(())
    }

    /// Replaces the parameter value with the provided tensor.
    pub fn load_value(&mut self, value: &Tensor) -> PureResult<()> {
        self.assert_shape(value)?;
        self.value = value.clone();
        Ok(())
    }
}

/// Layer abstraction with an explicit backward pass.
///
/// `backward` receives the same input the preceding `forward` saw, accumulates
/// parameter gradients into the layer's [`Parameter`]s and returns the
/// gradient with respect to the input.
pub trait Module {
    /// Runs a forward pass.
    fn forward(&self, input: &Tensor) -> PureResult<Tensor>;

    /// Propagates a gradient backwards, accumulating parameter gradients.
    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor>;

    /// Visits immutable parameters.
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()>;

    /// Visits mutable parameters.
    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()>;

    /// Clears gradient accumulators across every parameter.
    fn zero_accumulators(&mut self) -> PureResult<()> {
        self.visit_parameters_mut(&mut |param| {
            param.zero_gradient();
            Ok(())
        })
    }

    /// Applies one plain gradient-descent step to every parameter.
    fn apply_step(&mut self, learning_rate: f32) -> PureResult<()> {
        self.visit_parameters_mut(&mut |param| param.apply_step(learning_rate))
    }

    /// Captures a copy of every parameter tensor keyed by its canonical name.
    fn state_dict(&self) -> PureResult<HashMap<String, Tensor>> {
        let mut state = HashMap::new();
        self.visit_parameters(&mut |param| {
            state.insert(param.name().to_string(), param.value().clone());
            Ok(())
        })?;
        Ok(state)
    }

    /// Restores parameters from a state dictionary produced by [`Module::state_dict`].
    fn load_state_dict(&mut self, state: &HashMap<String, Tensor>) -> PureResult<()> {
        self.visit_parameters_mut(&mut |param| {
            let Some(value) = state.get(param.name()) else {
                return Err(TensorError::MissingParameter {
                    name: param.name().to_string(),
                });
            };
            param.load_value(value)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameter_accumulates_and_steps() {
        let mut param = Parameter::new("w", Tensor::from_vec(1, 2, vec![1.0, -1.0]).unwrap());
        let grad = Tensor::from_vec(1, 2, vec![0.5, 0.5]).unwrap();
        param.accumulate_euclidean(&grad).unwrap();
        param.accumulate_euclidean(&grad).unwrap();
        assert_eq!(param.gradient().unwrap().data(), &[1.0, 1.0]);
        param.apply_step(0.1).unwrap();
        assert_eq!(param.value().data(), &[0.9, -1.1]);
        assert!(param.gradient().is_none());
    }

    #[test]
    fn parameter_rejects_shape_mismatch() {
        let mut param = Parameter::new("w", Tensor::zeros(1, 2).unwrap());
        let bad = Tensor::zeros(2, 2).unwrap();
        assert!(param.accumulate_euclidean(&bad).is_err());
        assert!(param.load_value(&bad).is_err());
    }

    #[test]
    fn parameter_rejects_bad_learning_rate() {
        let mut param = Parameter::new("w", Tensor::zeros(1, 2).unwrap());
        assert!(param.apply_step(0.0).is_err());
        assert!(param.apply_step(f32::NAN).is_err());
    }
}
