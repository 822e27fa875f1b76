use leo_tensor::{PureResult, Tensor, TensorError};

/// Trait implemented by differentiable losses operating on raw logits.
pub trait Loss {
    /// Computes the loss value for the given predictions and targets.
    fn forward(&mut self, prediction: &Tensor, target: &Tensor) -> PureResult<Tensor>;

    /// Returns the gradient of the loss with respect to the predictions.
    fn backward(&mut self, prediction: &Tensor, target: &Tensor) -> PureResult<Tensor>;
}

/// Softmax cross-entropy applied independently at every pixel.
///
/// Predictions are `batch x (classes*h*w)` logits; targets are
/// `batch x (h*w)` integer-valued class labels. The loss is averaged over
/// batch and pixels.
#[derive(Debug, Clone, Copy)]
pub struct PixelCrossEntropy {
    num_classes: usize,
}

impl PixelCrossEntropy {
    pub fn new(num_classes: usize) -> PureResult<Self> {
        if num_classes < 2 {
            return Err(TensorError::InvalidValue {
                label: "num_classes",
            });
        }
        Ok(Self { num_classes })
    }

    /// Number of classes scored per pixel.
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn pixels(&self, prediction: &Tensor, target: &Tensor) -> PureResult<usize> {
        let (batch, cols) = prediction.shape();
        if cols % self.num_classes != 0 {
            return Err(TensorError::ShapeMismatch {
                left: (batch, cols),
                right: (batch, self.num_classes),
            });
        }
        let pixels = cols / self.num_classes;
        if target.shape() != (batch, pixels) {
            return Err(TensorError::ShapeMismatch {
                left: target.shape(),
                right: (batch, pixels),
            });
        }
        Ok(pixels)
    }

    /// Per-pixel softmax of the class logits, laid out like the prediction.
    fn softmax(&self, prediction: &Tensor, pixels: usize) -> PureResult<Tensor> {
        let (batch, cols) = prediction.shape();
        let mut probs = Tensor::zeros(batch, cols)?;
        let pred = prediction.data();
        let out = probs.data_mut();
        for b in 0..batch {
            for px in 0..pixels {
                let mut max = f32::NEG_INFINITY;
                for c in 0..self.num_classes {
                    max = max.max(pred[b * cols + c * pixels + px]);
                }
                let mut denom = 0.0;
                for c in 0..self.num_classes {
                    let e = (pred[b * cols + c * pixels + px] - max).exp();
                    out[b * cols + c * pixels + px] = e;
                    denom += e;
                }
                for c in 0..self.num_classes {
                    out[b * cols + c * pixels + px] /= denom;
                }
            }
        }
        Ok(probs)
    }

    fn label(&self, target: &Tensor, b: usize, px: usize, pixels: usize) -> PureResult<usize> {
        let raw = target.data()[b * pixels + px];
        let label = raw as usize;
        if raw < 0.0 || label >= self.num_classes || (raw - label as f32).abs() > 1e-6 {
            return Err(TensorError::InvalidValue {
                label: "mask_label",
            });
        }
        Ok(label)
    }
}

impl Loss for PixelCrossEntropy {
    fn forward(&mut self, prediction: &Tensor, target: &Tensor) -> PureResult<Tensor> {
        let pixels = self.pixels(prediction, target)?;
        let (batch, _) = prediction.shape();
        let probs = self.softmax(prediction, pixels)?;
        let cols = prediction.shape().1;
        let mut sum = 0.0f32;
        for b in 0..batch {
            for px in 0..pixels {
                let label = self.label(target, b, px, pixels)?;
                let p = probs.data()[b * cols + label * pixels + px].max(1e-12);
                sum -= p.ln();
            }
        }
        Tensor::from_vec(1, 1, vec![sum / (batch * pixels) as f32])
    }

    fn backward(&mut self, prediction: &Tensor, target: &Tensor) -> PureResult<Tensor> {
        let pixels = self.pixels(prediction, target)?;
        let (batch, cols) = prediction.shape();
        let mut grad = self.softmax(prediction, pixels)?;
        let inv = 1.0 / (batch * pixels) as f32;
        for b in 0..batch {
            for px in 0..pixels {
                let label = self.label(target, b, px, pixels)?;
                grad.data_mut()[b * cols + label * pixels + px] -= 1.0;
            }
        }
        for value in grad.data_mut() {
            *value *= inv;
        }
        Ok(grad)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_pixel_matches_manual_cross_entropy() {
        let mut loss = PixelCrossEntropy::new(2).unwrap();
        let prediction = Tensor::from_vec(1, 2, vec![1.0, 3.0]).unwrap();
        let target = Tensor::from_vec(1, 1, vec![1.0]).unwrap();
        let value = loss.forward(&prediction, &target).unwrap();
        let expected = ((1.0f32).exp() + (3.0f32).exp()).ln() - 3.0;
        assert!((value.data()[0] - expected).abs() < 1e-5);
    }

    #[test]
    fn confident_correct_prediction_has_low_loss() {
        let mut loss = PixelCrossEntropy::new(2).unwrap();
        let prediction = Tensor::from_vec(1, 2, vec![-10.0, 10.0]).unwrap();
        let target = Tensor::from_vec(1, 1, vec![1.0]).unwrap();
        let value = loss.forward(&prediction, &target).unwrap();
        assert!(value.data()[0] < 1e-4);
    }

    #[test]
    fn gradient_sums_to_zero_per_pixel() {
        let mut loss = PixelCrossEntropy::new(2).unwrap();
        let prediction = Tensor::from_vec(1, 8, vec![0.3, -0.2, 1.0, 0.5, 0.1, 0.9, -1.0, 0.0])
            .unwrap();
        let target = Tensor::from_vec(1, 4, vec![0.0, 1.0, 1.0, 0.0]).unwrap();
        let grad = loss.backward(&prediction, &target).unwrap();
        for px in 0..4 {
            let total = grad.data()[px] + grad.data()[4 + px];
            assert!(total.abs() < 1e-6, "pixel {px} gradient sum {total}");
        }
    }

    #[test]
    fn gradient_matches_finite_differences() {
        let mut loss = PixelCrossEntropy::new(2).unwrap();
        let prediction = Tensor::from_vec(1, 2, vec![0.4, -0.6]).unwrap();
        let target = Tensor::from_vec(1, 1, vec![0.0]).unwrap();
        let grad = loss.backward(&prediction, &target).unwrap();
        let base = loss.forward(&prediction, &target).unwrap().data()[0];
        let eps = 1e-3;
        for idx in 0..2 {
            let mut bumped = prediction.clone();
            bumped.data_mut()[idx] += eps;
            let value = loss.forward(&bumped, &target).unwrap().data()[0];
            let numeric = (value - base) / eps;
            assert!(
                (numeric - grad.data()[idx]).abs() < 1e-3,
                "idx {idx}: numeric {numeric} vs analytic {}",
                grad.data()[idx]
            );
        }
    }

    #[test]
    fn rejects_out_of_range_labels() {
        let mut loss = PixelCrossEntropy::new(2).unwrap();
        let prediction = Tensor::from_vec(1, 2, vec![0.0, 0.0]).unwrap();
        let target = Tensor::from_vec(1, 1, vec![3.0]).unwrap();
        assert!(loss.forward(&prediction, &target).is_err());
    }
}
