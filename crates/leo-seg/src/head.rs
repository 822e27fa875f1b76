use leo_nn::{conv2d, conv2d_backward, ConvGeometry};
use leo_tensor::{PureResult, Tensor, TensorError};
use rand::rngs::StdRng;

/// Foreground/background segmentation.
pub const NUM_CLASSES: usize = 2;

/// Functional segmentation head: a single convolution over the decoded
/// features concatenated with the input image.
///
/// The head owns no weights. The meta-weights live in the engine and are
/// updated only by the outer optimizer; per-task adapted copies are derived
/// from them by the fine-tuning loop and never written back. Both flow
/// through the same forward/backward entry points here.
#[derive(Debug, Clone)]
pub struct SegmentationHead {
    geometry: ConvGeometry,
    feature_channels: usize,
    image_channels: usize,
    pixels: usize,
}

impl SegmentationHead {
    pub fn new(
        feature_channels: usize,
        image_channels: usize,
        image_hw: (usize, usize),
    ) -> PureResult<Self> {
        let geometry = ConvGeometry::new(
            feature_channels + image_channels,
            NUM_CLASSES,
            (3, 3),
            (1, 1),
            (1, 1),
            image_hw,
        )?;
        Ok(Self {
            geometry,
            feature_channels,
            image_channels,
            pixels: image_hw.0 * image_hw.1,
        })
    }

    /// Shape of the segmentation kernel tensor.
    pub fn weight_shape(&self) -> (usize, usize) {
        (NUM_CLASSES, self.geometry.span())
    }

    /// Samples fresh meta-weights.
    pub fn init_weight(&self, rng: &mut StdRng) -> PureResult<Tensor> {
        let (classes, span) = self.weight_shape();
        let std_dev = 1.0 / (span as f32).sqrt();
        Tensor::random_normal(rng, classes, span, 0.0, std_dev)
    }

    fn cat_inputs(&self, features: &Tensor, images: &Tensor) -> PureResult<Tensor> {
        let (rows, feat_cols) = features.shape();
        let img_cols = self.image_channels * self.pixels;
        if feat_cols != self.feature_channels * self.pixels
            || images.shape() != (rows, img_cols)
        {
            return Err(TensorError::ShapeMismatch {
                left: features.shape(),
                right: images.shape(),
            });
        }
        let mut out = Tensor::zeros(rows, feat_cols + img_cols)?;
        let out_cols = out.shape().1;
        let out_data = out.data_mut();
        for r in 0..rows {
            out_data[r * out_cols..r * out_cols + feat_cols]
                .copy_from_slice(&features.data()[r * feat_cols..(r + 1) * feat_cols]);
            out_data[r * out_cols + feat_cols..(r + 1) * out_cols]
                .copy_from_slice(&images.data()[r * img_cols..(r + 1) * img_cols]);
        }
        Ok(out)
    }

    /// Produces per-pixel class logits `batch x (classes*h*w)`.
    pub fn forward(
        &self,
        features: &Tensor,
        images: &Tensor,
        weight: &Tensor,
    ) -> PureResult<Tensor> {
        let joined = self.cat_inputs(features, images)?;
        conv2d(&self.geometry, &joined, weight, None)
    }

    /// Backward pass producing the weight gradient and the feature gradient.
    /// The image half of the input gradient is discarded: images are data,
    /// not parameters.
    pub fn backward(
        &self,
        features: &Tensor,
        images: &Tensor,
        weight: &Tensor,
        grad_logits: &Tensor,
    ) -> PureResult<(Tensor, Tensor)> {
        let joined = self.cat_inputs(features, images)?;
        let grads = conv2d_backward(&self.geometry, &joined, weight, grad_logits)?;
        let (rows, _) = features.shape();
        let feat_cols = self.feature_channels * self.pixels;
        let joined_cols = joined.shape().1;
        let mut grad_features = Tensor::zeros(rows, feat_cols)?;
        for r in 0..rows {
            grad_features.data_mut()[r * feat_cols..(r + 1) * feat_cols]
                .copy_from_slice(&grads.input.data()[r * joined_cols..r * joined_cols + feat_cols]);
        }
        Ok((grads.weight, grad_features))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn head() -> SegmentationHead {
        SegmentationHead::new(2, 1, (4, 4)).unwrap()
    }

    #[test]
    fn logits_have_one_plane_per_class() {
        let head = head();
        let mut rng = StdRng::seed_from_u64(3);
        let weight = head.init_weight(&mut rng).unwrap();
        let features = Tensor::from_fn(2, 32, |_r, c| c as f32 * 0.01).unwrap();
        let images = Tensor::from_fn(2, 16, |_r, c| c as f32 * 0.02).unwrap();
        let logits = head.forward(&features, &images, &weight).unwrap();
        assert_eq!(logits.shape(), (2, NUM_CLASSES * 16));
    }

    #[test]
    fn weight_gradient_matches_finite_differences() {
        let head = head();
        let mut rng = StdRng::seed_from_u64(4);
        let weight = head.init_weight(&mut rng).unwrap();
        let features = Tensor::from_fn(1, 32, |_r, c| (c as f32 * 0.3).sin()).unwrap();
        let images = Tensor::from_fn(1, 16, |_r, c| (c as f32 * 0.2).cos()).unwrap();
        let ones = Tensor::from_fn(1, 32, |_r, _c| 1.0).unwrap();
        let (grad_weight, grad_features) =
            head.backward(&features, &images, &weight, &ones).unwrap();
        assert_eq!(grad_weight.shape(), weight.shape());
        assert_eq!(grad_features.shape(), features.shape());

        let base: f32 = head
            .forward(&features, &images, &weight)
            .unwrap()
            .data()
            .iter()
            .sum();
        let eps = 1e-3;
        for idx in [0usize, 7, 20] {
            let mut bumped = weight.clone();
            bumped.data_mut()[idx] += eps;
            let sum: f32 = head
                .forward(&features, &images, &bumped)
                .unwrap()
                .data()
                .iter()
                .sum();
            let numeric = (sum - base) / eps;
            assert!(
                (numeric - grad_weight.data()[idx]).abs() < 1e-2,
                "idx {idx}: numeric {numeric} vs analytic {}",
                grad_weight.data()[idx]
            );
        }
    }

    #[test]
    fn rejects_mismatched_feature_plane() {
        let head = head();
        let mut rng = StdRng::seed_from_u64(5);
        let weight = head.init_weight(&mut rng).unwrap();
        let features = Tensor::zeros(1, 30).unwrap();
        let images = Tensor::zeros(1, 16).unwrap();
        assert!(head.forward(&features, &images, &weight).is_err());
    }
}
