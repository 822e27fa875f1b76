use crate::module::{Module, Parameter};
use leo_tensor::{PureResult, Tensor, TensorError};
use rand::rngs::StdRng;

fn validate_positive(value: usize, label: &'static str) -> PureResult<()> {
    if value == 0 {
        return Err(TensorError::InvalidValue { label });
    }
    Ok(())
}

/// Fixed convolution geometry shared by the [`Conv2d`] module and the
/// weight-free functional entry points below.
///
/// The spatial size is part of the geometry; feeding an input whose column
/// count disagrees with it is a shape error. That construction-time lock is
/// what lets a shape-discovered decoder reject drifting feature shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvGeometry {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel: (usize, usize),
    pub stride: (usize, usize),
    pub padding: (usize, usize),
    pub input_hw: (usize, usize),
}

impl ConvGeometry {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel: (usize, usize),
        stride: (usize, usize),
        padding: (usize, usize),
        input_hw: (usize, usize),
    ) -> PureResult<Self> {
        validate_positive(in_channels, "in_channels")?;
        validate_positive(out_channels, "out_channels")?;
        validate_positive(kernel.0, "kernel_h")?;
        validate_positive(kernel.1, "kernel_w")?;
        validate_positive(stride.0, "stride_h")?;
        validate_positive(stride.1, "stride_w")?;
        validate_positive(input_hw.0, "input_height")?;
        validate_positive(input_hw.1, "input_width")?;
        let geometry = Self {
            in_channels,
            out_channels,
            kernel,
            stride,
            padding,
            input_hw,
        };
        geometry.output_hw()?;
        Ok(geometry)
    }

    /// Number of weight columns per output channel.
    pub fn span(&self) -> usize {
        self.in_channels * self.kernel.0 * self.kernel.1
    }

    /// Spatial size of the output plane.
    pub fn output_hw(&self) -> PureResult<(usize, usize)> {
        let (h, w) = self.input_hw;
        let (kh, kw) = self.kernel;
        let (ph, pw) = self.padding;
        let (sh, sw) = self.stride;
        if h + 2 * ph < kh || w + 2 * pw < kw {
            return Err(TensorError::InvalidDimensions {
                rows: h + 2 * ph,
                cols: kh.max(kw),
            });
        }
        Ok(((h + 2 * ph - kh) / sh + 1, (w + 2 * pw - kw) / sw + 1))
    }

    fn check_input(&self, input: &Tensor) -> PureResult<usize> {
        let (batch, cols) = input.shape();
        let expected = self.in_channels * self.input_hw.0 * self.input_hw.1;
        if cols != expected {
            return Err(TensorError::ShapeMismatch {
                left: (batch, cols),
                right: (batch, expected),
            });
        }
        Ok(batch)
    }

    fn check_weight(&self, weight: &Tensor) -> PureResult<()> {
        if weight.shape() != (self.out_channels, self.span()) {
            return Err(TensorError::ShapeMismatch {
                left: weight.shape(),
                right: (self.out_channels, self.span()),
            });
        }
        Ok(())
    }

    /// Unfolds the input into `(batch*oh*ow) x span` patch rows.
    fn im2col(&self, input: &Tensor, batch: usize, oh: usize, ow: usize) -> PureResult<Tensor> {
        let (h, w) = self.input_hw;
        let (kh, kw) = self.kernel;
        let (sh, sw) = self.stride;
        let (ph, pw) = (self.padding.0 as isize, self.padding.1 as isize);
        let span = self.span();
        let cols_per_row = input.shape().1;
        let mut columns = Tensor::zeros(batch * oh * ow, span)?;
        let input_data = input.data();
        let column_data = columns.data_mut();
        for b in 0..batch {
            let row = &input_data[b * cols_per_row..(b + 1) * cols_per_row];
            for oy in 0..oh {
                for ox in 0..ow {
                    let offset = (b * oh * ow + oy * ow + ox) * span;
                    let mut col_idx = 0;
                    for ic in 0..self.in_channels {
                        let channel_offset = ic * h * w;
                        for ky in 0..kh {
                            for kx in 0..kw {
                                let iy = (oy * sh + ky) as isize - ph;
                                let ix = (ox * sw + kx) as isize - pw;
                                if iy >= 0 && (iy as usize) < h && ix >= 0 && (ix as usize) < w {
                                    column_data[offset + col_idx] =
                                        row[channel_offset + iy as usize * w + ix as usize];
                                }
                                col_idx += 1;
                            }
                        }
                    }
                }
            }
        }
        Ok(columns)
    }
}

/// Gradients produced by [`conv2d_backward`].
#[derive(Debug, Clone)]
pub struct ConvGrads {
    pub weight: Tensor,
    pub bias: Tensor,
    pub input: Tensor,
}

/// Functional convolution with a caller-supplied weight tensor.
pub fn conv2d(
    geometry: &ConvGeometry,
    input: &Tensor,
    weight: &Tensor,
    bias: Option<&Tensor>,
) -> PureResult<Tensor> {
    let batch = geometry.check_input(input)?;
    geometry.check_weight(weight)?;
    let (oh, ow) = geometry.output_hw()?;
    let columns = geometry.im2col(input, batch, oh, ow)?;
    let product = columns.matmul(&weight.transpose())?;
    let out_c = geometry.out_channels;
    let mut out = Tensor::zeros(batch, out_c * oh * ow)?;
    let out_data = out.data_mut();
    let product_data = product.data();
    for b in 0..batch {
        for idx in 0..oh * ow {
            let src = (b * oh * ow + idx) * out_c;
            for oc in 0..out_c {
                out_data[b * out_c * oh * ow + oc * oh * ow + idx] = product_data[src + oc];
            }
        }
    }
    if let Some(bias) = bias {
        if bias.shape() != (1, out_c) {
            return Err(TensorError::ShapeMismatch {
                left: bias.shape(),
                right: (1, out_c),
            });
        }
        let bias_data = bias.data().to_vec();
        let out_data = out.data_mut();
        for b in 0..batch {
            for oc in 0..out_c {
                for idx in 0..oh * ow {
                    out_data[b * out_c * oh * ow + oc * oh * ow + idx] += bias_data[oc];
                }
            }
        }
    }
    Ok(out)
}

/// Backward pass of [`conv2d`], producing weight, bias and input gradients.
pub fn conv2d_backward(
    geometry: &ConvGeometry,
    input: &Tensor,
    weight: &Tensor,
    grad_output: &Tensor,
) -> PureResult<ConvGrads> {
    let batch = geometry.check_input(input)?;
    geometry.check_weight(weight)?;
    let (oh, ow) = geometry.output_hw()?;
    let out_c = geometry.out_channels;
    if grad_output.shape() != (batch, out_c * oh * ow) {
        return Err(TensorError::ShapeMismatch {
            left: grad_output.shape(),
            right: (batch, out_c * oh * ow),
        });
    }
    // Re-layout the gradient as (batch*oh*ow, out_c) patch rows.
    let mut grad_mat = Tensor::zeros(batch * oh * ow, out_c)?;
    {
        let grad_data = grad_output.data();
        let mat = grad_mat.data_mut();
        for b in 0..batch {
            for oc in 0..out_c {
                for idx in 0..oh * ow {
                    mat[(b * oh * ow + idx) * out_c + oc] =
                        grad_data[b * out_c * oh * ow + oc * oh * ow + idx];
                }
            }
        }
    }
    let columns = geometry.im2col(input, batch, oh, ow)?;
    let grad_weight = grad_mat.transpose().matmul(&columns)?;
    let mut grad_bias = Tensor::zeros(1, out_c)?;
    {
        let mat = grad_mat.data();
        let bias = grad_bias.data_mut();
        for row in 0..batch * oh * ow {
            for oc in 0..out_c {
                bias[oc] += mat[row * out_c + oc];
            }
        }
    }
    // Fold the patch gradients back onto the input plane.
    let grad_columns = grad_mat.matmul(weight)?;
    let (h, w) = geometry.input_hw;
    let (kh, kw) = geometry.kernel;
    let (sh, sw) = geometry.stride;
    let (ph, pw) = (geometry.padding.0 as isize, geometry.padding.1 as isize);
    let span = geometry.span();
    let mut grad_input = Tensor::zeros(batch, input.shape().1)?;
    {
        let grad_col_data = grad_columns.data();
        let grad_in = grad_input.data_mut();
        let in_cols = input.shape().1;
        for b in 0..batch {
            for oy in 0..oh {
                for ox in 0..ow {
                    let offset = (b * oh * ow + oy * ow + ox) * span;
                    let mut col_idx = 0;
                    for ic in 0..geometry.in_channels {
                        let channel_offset = ic * h * w;
                        for ky in 0..kh {
                            for kx in 0..kw {
                                let iy = (oy * sh + ky) as isize - ph;
                                let ix = (ox * sw + kx) as isize - pw;
                                if iy >= 0 && (iy as usize) < h && ix >= 0 && (ix as usize) < w {
                                    grad_in[b * in_cols
                                        + channel_offset
                                        + iy as usize * w
                                        + ix as usize] += grad_col_data[offset + col_idx];
                                }
                                col_idx += 1;
                            }
                        }
                    }
                }
            }
        }
    }
    Ok(ConvGrads {
        weight: grad_weight,
        bias: grad_bias,
        input: grad_input,
    })
}

/// Two-dimensional convolution layer owning its weight and bias parameters.
#[derive(Debug, Clone)]
pub struct Conv2d {
    geometry: ConvGeometry,
    weight: Parameter,
    bias: Parameter,
}

impl Conv2d {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        in_channels: usize,
        out_channels: usize,
        kernel: (usize, usize),
        stride: (usize, usize),
        padding: (usize, usize),
        input_hw: (usize, usize),
        rng: &mut StdRng,
    ) -> PureResult<Self> {
        let geometry = ConvGeometry::new(in_channels, out_channels, kernel, stride, padding, input_hw)?;
        let name = name.into();
        let span = geometry.span();
        let bound = 1.0 / (span as f32).sqrt();
        let weight = Tensor::random_uniform(rng, out_channels, span, -bound, bound)?;
        let bias = Tensor::zeros(1, out_channels)?;
        Ok(Self {
            geometry,
            weight: Parameter::new(format!("{name}::weight"), weight),
            bias: Parameter::new(format!("{name}::bias"), bias),
        })
    }

    /// Returns the fixed geometry of the layer.
    pub fn geometry(&self) -> &ConvGeometry {
        &self.geometry
    }

    /// Spatial size of the output plane.
    pub fn output_hw(&self) -> PureResult<(usize, usize)> {
        self.geometry.output_hw()
    }

    /// Number of output channels.
    pub fn out_channels(&self) -> usize {
        self.geometry.out_channels
    }
}

impl Module for Conv2d {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        conv2d(
            &self.geometry,
            input,
            self.weight.value(),
            Some(self.bias.value()),
        )
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let grads = conv2d_backward(&self.geometry, input, self.weight.value(), grad_output)?;
        self.weight.accumulate_euclidean(&grads.weight)?;
        self.bias.accumulate_euclidean(&grads.bias)?;
        Ok(grads.input)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&self.weight)?;
        visitor(&self.bias)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&mut self.weight)?;
        visitor(&mut self.bias)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(11)
    }

    #[test]
    fn identity_kernel_passes_input_through() {
        let mut conv = Conv2d::new("id", 1, 1, (1, 1), (1, 1), (0, 0), (2, 2), &mut rng()).unwrap();
        conv.visit_parameters_mut(&mut |p| {
            if p.name().ends_with("::weight") {
                p.load_value(&Tensor::from_vec(1, 1, vec![1.0]).unwrap())?;
            }
            Ok(())
        })
        .unwrap();
        let input = Tensor::from_vec(1, 4, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let out = conv.forward(&input).unwrap();
        assert_eq!(out.data(), input.data());
    }

    #[test]
    fn same_padding_preserves_plane_size() {
        let conv = Conv2d::new("p", 2, 3, (3, 3), (1, 1), (1, 1), (4, 4), &mut rng()).unwrap();
        assert_eq!(conv.output_hw().unwrap(), (4, 4));
        let input = Tensor::zeros(2, 2 * 16).unwrap();
        let out = conv.forward(&input).unwrap();
        assert_eq!(out.shape(), (2, 3 * 16));
    }

    #[test]
    fn strided_conv_halves_plane() {
        let conv = Conv2d::new("s", 1, 2, (3, 3), (2, 2), (1, 1), (4, 4), &mut rng()).unwrap();
        assert_eq!(conv.output_hw().unwrap(), (2, 2));
    }

    #[test]
    fn input_gradient_matches_finite_differences() {
        let mut conv = Conv2d::new("fd", 1, 1, (3, 3), (1, 1), (1, 1), (3, 3), &mut rng()).unwrap();
        let input = Tensor::from_vec(
            1,
            9,
            vec![0.3, -0.1, 0.5, 0.2, 0.9, -0.4, 0.0, 0.7, -0.2],
        )
        .unwrap();
        // Loss = sum(out); its gradient w.r.t. out is all ones.
        let ones = Tensor::from_fn(1, 9, |_r, _c| 1.0).unwrap();
        let grad_input = conv.backward(&input, &ones).unwrap();

        let eps = 1e-3;
        let base: f32 = conv.forward(&input).unwrap().data().iter().sum();
        for idx in [0usize, 4, 8] {
            let mut bumped = input.clone();
            bumped.data_mut()[idx] += eps;
            let bumped_sum: f32 = conv.forward(&bumped).unwrap().data().iter().sum();
            let numeric = (bumped_sum - base) / eps;
            assert!(
                (numeric - grad_input.data()[idx]).abs() < 1e-2,
                "idx {idx}: numeric {numeric} vs analytic {}",
                grad_input.data()[idx]
            );
        }
    }

    #[test]
    fn weight_gradient_matches_finite_differences() {
        let geometry = ConvGeometry::new(1, 1, (3, 3), (1, 1), (1, 1), (3, 3)).unwrap();
        let mut rng = rng();
        let bound = 1.0 / 3.0;
        let weight = Tensor::random_uniform(&mut rng, 1, 9, -bound, bound).unwrap();
        let input = Tensor::from_vec(
            1,
            9,
            vec![0.3, -0.1, 0.5, 0.2, 0.9, -0.4, 0.0, 0.7, -0.2],
        )
        .unwrap();
        let ones = Tensor::from_fn(1, 9, |_r, _c| 1.0).unwrap();
        let grads = conv2d_backward(&geometry, &input, &weight, &ones).unwrap();

        let base: f32 = conv2d(&geometry, &input, &weight, None)
            .unwrap()
            .data()
            .iter()
            .sum();
        let eps = 1e-3;
        for idx in [0usize, 4, 8] {
            let mut bumped = weight.clone();
            bumped.data_mut()[idx] += eps;
            let bumped_sum: f32 = conv2d(&geometry, &input, &bumped, None)
                .unwrap()
                .data()
                .iter()
                .sum();
            let numeric = (bumped_sum - base) / eps;
            assert!(
                (numeric - grads.weight.data()[idx]).abs() < 1e-2,
                "idx {idx}: numeric {numeric} vs analytic {}",
                grads.weight.data()[idx]
            );
        }
    }

    #[test]
    fn functional_conv_rejects_bad_weight_shape() {
        let geometry = ConvGeometry::new(1, 2, (3, 3), (1, 1), (1, 1), (4, 4)).unwrap();
        let input = Tensor::zeros(1, 16).unwrap();
        let weight = Tensor::zeros(2, 8).unwrap();
        assert!(conv2d(&geometry, &input, &weight, None).is_err());
    }
}
