pub mod conv;

use crate::module::{Module, Parameter};
use leo_tensor::{PureResult, Tensor, TensorError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cell::RefCell;

/// Rectified linear activation.
#[derive(Debug, Clone, Copy, Default)]
pub struct Relu;

impl Module for Relu {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let data = input.data().iter().map(|v| v.max(0.0)).collect();
        Tensor::from_vec(input.shape().0, input.shape().1, data)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        if input.shape() != grad_output.shape() {
            return Err(TensorError::ShapeMismatch {
                left: input.shape(),
                right: grad_output.shape(),
            });
        }
        let data = input
            .data()
            .iter()
            .zip(grad_output.data().iter())
            .map(|(x, g)| if *x > 0.0 { *g } else { 0.0 })
            .collect();
        Tensor::from_vec(input.shape().0, input.shape().1, data)
    }

    fn visit_parameters(
        &self,
        _visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        _visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        Ok(())
    }
}

/// Logistic activation, used by the squeeze-conv gate heads.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sigmoid;

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

impl Module for Sigmoid {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let data = input.data().iter().map(|v| sigmoid(*v)).collect();
        Tensor::from_vec(input.shape().0, input.shape().1, data)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        if input.shape() != grad_output.shape() {
            return Err(TensorError::ShapeMismatch {
                left: input.shape(),
                right: grad_output.shape(),
            });
        }
        let data = input
            .data()
            .iter()
            .zip(grad_output.data().iter())
            .map(|(x, g)| {
                let s = sigmoid(*x);
                s * (1.0 - s) * g
            })
            .collect();
        Tensor::from_vec(input.shape().0, input.shape().1, data)
    }

    fn visit_parameters(
        &self,
        _visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        _visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        Ok(())
    }
}

/// Inverted dropout whose mask is sampled once per forward and SHARED across
/// the batch axis. Batch-shared masks keep replicated examples bit-identical,
/// which the single-example tiling path of the decoder relies on.
///
/// `backward` reuses the mask from the most recent `forward`; callers must
/// pair each backward with the forward that preceded it.
#[derive(Debug)]
pub struct Dropout {
    rate: f32,
    rng: RefCell<StdRng>,
    mask: RefCell<Option<Tensor>>,
}

impl Dropout {
    pub fn new(rate: f32, seed: u64) -> PureResult<Self> {
        if !(0.0..1.0).contains(&rate) {
            return Err(TensorError::InvalidValue {
                label: "dropout_rate",
            });
        }
        Ok(Self {
            rate,
            rng: RefCell::new(StdRng::seed_from_u64(seed)),
            mask: RefCell::new(None),
        })
    }

    /// Returns the configured drop probability.
    pub fn rate(&self) -> f32 {
        self.rate
    }
}

impl Module for Dropout {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        if self.rate == 0.0 {
            *self.mask.borrow_mut() = None;
            return Ok(input.clone());
        }
        let (rows, cols) = input.shape();
        let keep = 1.0 - self.rate;
        let mask = {
            let mut rng = self.rng.borrow_mut();
            Tensor::from_fn(1, cols, |_r, _c| {
                if rng.gen::<f32>() < keep {
                    1.0 / keep
                } else {
                    0.0
                }
            })?
        };
        let mut out = input.clone();
        {
            let mask_data = mask.data();
            let out_data = out.data_mut();
            for r in 0..rows {
                for c in 0..cols {
                    out_data[r * cols + c] *= mask_data[c];
                }
            }
        }
        *self.mask.borrow_mut() = Some(mask);
        Ok(out)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        if input.shape() != grad_output.shape() {
            return Err(TensorError::ShapeMismatch {
                left: input.shape(),
                right: grad_output.shape(),
            });
        }
        let mask = self.mask.borrow();
        let Some(mask) = mask.as_ref() else {
            return Ok(grad_output.clone());
        };
        let (rows, cols) = grad_output.shape();
        let mut out = grad_output.clone();
        let mask_data = mask.data();
        let out_data = out.data_mut();
        for r in 0..rows {
            for c in 0..cols {
                out_data[r * cols + c] *= mask_data[c];
            }
        }
        Ok(out)
    }

    fn visit_parameters(
        &self,
        _visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        _visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        Ok(())
    }
}

/// Bilinear resize between two fixed spatial sizes, applied per channel.
#[derive(Debug, Clone)]
pub struct Bilinear2d {
    channels: usize,
    input_hw: (usize, usize),
    output_hw: (usize, usize),
}

impl Bilinear2d {
    pub fn new(channels: usize, input_hw: (usize, usize), output_hw: (usize, usize)) -> PureResult<Self> {
        for (value, label) in [
            (channels, "channels"),
            (input_hw.0, "input_height"),
            (input_hw.1, "input_width"),
            (output_hw.0, "output_height"),
            (output_hw.1, "output_width"),
        ] {
            if value == 0 {
                return Err(TensorError::InvalidValue { label });
            }
        }
        Ok(Self {
            channels,
            input_hw,
            output_hw,
        })
    }

    /// Source coordinate and lerp weight for one destination index.
    fn source(dst: usize, src_len: usize, dst_len: usize) -> (usize, usize, f32) {
        if src_len == dst_len {
            return (dst, dst, 0.0);
        }
        let scale = src_len as f32 / dst_len as f32;
        let pos = ((dst as f32 + 0.5) * scale - 0.5).clamp(0.0, (src_len - 1) as f32);
        let lo = pos.floor() as usize;
        let hi = (lo + 1).min(src_len - 1);
        (lo, hi, pos - lo as f32)
    }
}

impl Module for Bilinear2d {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let (batch, cols) = input.shape();
        let (ih, iw) = self.input_hw;
        let (oh, ow) = self.output_hw;
        if cols != self.channels * ih * iw {
            return Err(TensorError::ShapeMismatch {
                left: (batch, cols),
                right: (batch, self.channels * ih * iw),
            });
        }
        let mut out = Tensor::zeros(batch, self.channels * oh * ow)?;
        let input_data = input.data();
        let out_data = out.data_mut();
        for b in 0..batch {
            for c in 0..self.channels {
                let src_offset = b * cols + c * ih * iw;
                let src = &input_data[src_offset..src_offset + ih * iw];
                let dst_offset = b * self.channels * oh * ow + c * oh * ow;
                for oy in 0..oh {
                    let (y0, y1, fy) = Self::source(oy, ih, oh);
                    for ox in 0..ow {
                        let (x0, x1, fx) = Self::source(ox, iw, ow);
                        let v00 = src[y0 * iw + x0];
                        let v01 = src[y0 * iw + x1];
                        let v10 = src[y1 * iw + x0];
                        let v11 = src[y1 * iw + x1];
                        let top = v00 + (v01 - v00) * fx;
                        let bottom = v10 + (v11 - v10) * fx;
                        out_data[dst_offset + oy * ow + ox] = top + (bottom - top) * fy;
                    }
                }
            }
        }
        Ok(out)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let (batch, cols) = input.shape();
        let (ih, iw) = self.input_hw;
        let (oh, ow) = self.output_hw;
        if grad_output.shape() != (batch, self.channels * oh * ow) {
            return Err(TensorError::ShapeMismatch {
                left: grad_output.shape(),
                right: (batch, self.channels * oh * ow),
            });
        }
        let mut grad_input = Tensor::zeros(batch, cols)?;
        let grad_data = grad_output.data();
        let grad_in = grad_input.data_mut();
        for b in 0..batch {
            for c in 0..self.channels {
                let src_offset = b * cols + c * ih * iw;
                let dst_offset = b * self.channels * oh * ow + c * oh * ow;
                for oy in 0..oh {
                    let (y0, y1, fy) = Self::source(oy, ih, oh);
                    for ox in 0..ow {
                        let (x0, x1, fx) = Self::source(ox, iw, ow);
                        let g = grad_data[dst_offset + oy * ow + ox];
                        grad_in[src_offset + y0 * iw + x0] += g * (1.0 - fx) * (1.0 - fy);
                        grad_in[src_offset + y0 * iw + x1] += g * fx * (1.0 - fy);
                        grad_in[src_offset + y1 * iw + x0] += g * (1.0 - fx) * fy;
                        grad_in[src_offset + y1 * iw + x1] += g * fx * fy;
                    }
                }
            }
        }
        Ok(grad_input)
    }

    fn visit_parameters(
        &self,
        _visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        _visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relu_zeroes_negative_gradients() {
        let mut relu = Relu;
        let input = Tensor::from_vec(1, 4, vec![-1.0, 2.0, -3.0, 4.0]).unwrap();
        let out = relu.forward(&input).unwrap();
        assert_eq!(out.data(), &[0.0, 2.0, 0.0, 4.0]);
        let grad = Tensor::from_vec(1, 4, vec![1.0, 1.0, 1.0, 1.0]).unwrap();
        let back = relu.backward(&input, &grad).unwrap();
        assert_eq!(back.data(), &[0.0, 1.0, 0.0, 1.0]);
    }

    #[test]
    fn sigmoid_saturates_toward_unit_interval() {
        let s = Sigmoid;
        let input = Tensor::from_vec(1, 3, vec![-10.0, 0.0, 10.0]).unwrap();
        let out = s.forward(&input).unwrap();
        assert!(out.data()[0] < 1e-4);
        assert!((out.data()[1] - 0.5).abs() < 1e-6);
        assert!(out.data()[2] > 1.0 - 1e-4);
    }

    #[test]
    fn dropout_mask_is_shared_across_batch() {
        let dropout = Dropout::new(0.5, 3).unwrap();
        let input = Tensor::from_fn(4, 8, |_r, _c| 1.0).unwrap();
        let out = dropout.forward(&input).unwrap();
        let (rows, cols) = out.shape();
        for c in 0..cols {
            let first = out.data()[c];
            for r in 1..rows {
                assert_eq!(out.data()[r * cols + c], first);
            }
        }
    }

    #[test]
    fn zero_rate_dropout_is_identity() {
        let dropout = Dropout::new(0.0, 3).unwrap();
        let input = Tensor::from_vec(2, 2, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(dropout.forward(&input).unwrap(), input);
    }

    #[test]
    fn bilinear_identity_when_sizes_match() {
        let resize = Bilinear2d::new(2, (3, 3), (3, 3)).unwrap();
        let input = Tensor::from_fn(1, 18, |_r, c| c as f32).unwrap();
        assert_eq!(resize.forward(&input).unwrap(), input);
    }

    #[test]
    fn bilinear_upsample_interpolates_between_corners() {
        let resize = Bilinear2d::new(1, (2, 2), (4, 4)).unwrap();
        let input = Tensor::from_vec(1, 4, vec![0.0, 1.0, 2.0, 3.0]).unwrap();
        let out = resize.forward(&input).unwrap();
        // Corners keep the source extremes; the interior stays inside them.
        assert!((out.data()[0] - 0.0).abs() < 1e-6);
        assert!((out.data()[15] - 3.0).abs() < 1e-6);
        assert!(out.data().iter().all(|v| (0.0..=3.0).contains(v)));
    }

    #[test]
    fn bilinear_backward_conserves_mass() {
        let mut resize = Bilinear2d::new(1, (2, 2), (4, 4)).unwrap();
        let input = Tensor::zeros(1, 4).unwrap();
        let grad = Tensor::from_fn(1, 16, |_r, _c| 1.0).unwrap();
        let back = resize.backward(&input, &grad).unwrap();
        let total: f32 = back.data().iter().sum();
        assert!((total - 16.0).abs() < 1e-4);
    }
}
