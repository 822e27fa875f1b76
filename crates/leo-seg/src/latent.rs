use crate::head::SegmentationHead;
use crate::pipeline::{FeaturePipeline, GateMaps};
use leo_nn::{Loss, PixelCrossEntropy};
use leo_tensor::{PureResult, Tensor, TensorError};

/// Result of one task's latent adaptation.
#[derive(Debug)]
pub struct AdaptOutcome {
    /// Gradient of the final training loss w.r.t. the segmentation
    /// meta-weights; seeds the fine-tuning loop.
    pub seed_weight_grad: Tensor,
    /// Decoded features at the final latent, held fixed during fine-tuning.
    pub features: Tensor,
    /// Gate maps from the discovery pass, fixed for the rest of the task.
    pub gates: GateMaps,
    /// Training loss before the first latent update.
    pub initial_train_loss: f32,
    /// Training loss after the last latent update.
    pub final_train_loss: f32,
}

/// Drives the latent inner loop: `K` gradient steps on the latent code with
/// every other parameter held fixed.
///
/// Each step extracts the latent gradient from a consumed decode trace, so
/// no graph survives the extraction and nothing differentiates through the
/// update rule itself (first-order by construction).
#[derive(Debug, Clone, Copy)]
pub struct LatentOptimizer {
    inner_lr: f32,
    steps: usize,
}

impl LatentOptimizer {
    pub fn new(inner_lr: f32, steps: usize) -> PureResult<Self> {
        if inner_lr <= 0.0 || !inner_lr.is_finite() {
            return Err(TensorError::NonPositiveLearningRate { rate: inner_lr });
        }
        if steps == 0 {
            return Err(TensorError::InvalidValue {
                label: "num_adaptation_steps",
            });
        }
        Ok(Self { inner_lr, steps })
    }

    /// Adapts a fresh latent code against the task's support set.
    pub fn adapt<P: FeaturePipeline>(
        &self,
        pipeline: &mut P,
        head: &SegmentationHead,
        loss: &mut PixelCrossEntropy,
        seg_weight: &Tensor,
        images: &Tensor,
        masks: &Tensor,
    ) -> PureResult<AdaptOutcome> {
        let (skips, mut latents, encoder_gates) = pipeline.encode_discover(images)?;
        let (mut features, mut trace, decoder_gates) = pipeline.decode_discover(&skips, &latents)?;
        let gates = GateMaps {
            encoder: encoder_gates,
            decoder: decoder_gates,
        };
        let mut logits = head.forward(&features, images, seg_weight)?;
        let initial_train_loss = loss.forward(&logits, masks)?.data()[0];
        let mut final_train_loss = initial_train_loss;
        for _step in 0..self.steps {
            let grad_logits = loss.backward(&logits, masks)?;
            let (_grad_weight, grad_features) =
                head.backward(&features, images, seg_weight, &grad_logits)?;
            let grad_latents = pipeline.decode_backward(trace, &grad_features, false)?;
            latents.add_scaled(&grad_latents, -self.inner_lr)?;
            let (next_features, next_trace) = pipeline.decode(&skips, &latents, None)?;
            features = next_features;
            trace = next_trace;
            logits = head.forward(&features, images, seg_weight)?;
            final_train_loss = loss.forward(&logits, masks)?.data()[0];
        }
        let grad_logits = loss.backward(&logits, masks)?;
        let (seed_weight_grad, _grad_features) =
            head.backward(&features, images, seg_weight, &grad_logits)?;
        // The last trace dies here; fine-tuning sees only the fixed features.
        drop(trace);
        Ok(AdaptOutcome {
            seed_weight_grad,
            features,
            gates,
            initial_train_loss,
            final_train_loss,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Hyperparameters;
    use crate::head::SegmentationHead;
    use crate::skipnet::SkipNetPipeline;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn setup() -> (SkipNetPipeline, SegmentationHead, Tensor, Tensor, Tensor) {
        let hyp = Hyperparameters {
            base_channel_width: 2,
            dropout_rate: 0.0,
            seed: 17,
            ..Hyperparameters::default()
        };
        let images = Tensor::from_fn(2, 16, |r, c| ((r * 16 + c) as f32 * 0.21).sin()).unwrap();
        let masks = Tensor::from_fn(2, 16, |_r, c| if c % 3 == 0 { 1.0 } else { 0.0 }).unwrap();
        let mut pipeline = SkipNetPipeline::new(1, (4, 4), &hyp).unwrap();
        pipeline.prepare(&images).unwrap();
        let head = SegmentationHead::new(
            pipeline.feature_channels(),
            pipeline.image_channels(),
            pipeline.image_hw(),
        )
        .unwrap();
        let mut rng = StdRng::seed_from_u64(17);
        let weight = head.init_weight(&mut rng).unwrap();
        (pipeline, head, weight, images, masks)
    }

    #[test]
    fn latent_descent_reduces_training_loss() {
        let (mut pipeline, head, weight, images, masks) = setup();
        let mut loss = PixelCrossEntropy::new(2).unwrap();
        let optimizer = LatentOptimizer::new(1e-2, 3).unwrap();
        let outcome = optimizer
            .adapt(&mut pipeline, &head, &mut loss, &weight, &images, &masks)
            .unwrap();
        assert!(
            outcome.final_train_loss <= outcome.initial_train_loss + 1e-6,
            "final {} vs initial {}",
            outcome.final_train_loss,
            outcome.initial_train_loss
        );
        assert!(outcome.final_train_loss.is_finite());
        assert_eq!(outcome.seed_weight_grad.shape(), weight.shape());
    }

    #[test]
    fn adapt_produces_one_gate_set() {
        let (mut pipeline, head, weight, images, masks) = setup();
        let mut loss = PixelCrossEntropy::new(2).unwrap();
        let optimizer = LatentOptimizer::new(1e-3, 1).unwrap();
        let outcome = optimizer
            .adapt(&mut pipeline, &head, &mut loss, &weight, &images, &masks)
            .unwrap();
        assert_eq!(outcome.gates.encoder.len(), 2);
        assert_eq!(outcome.gates.decoder.len(), 4);
    }

    #[test]
    fn rejects_degenerate_configuration() {
        assert!(LatentOptimizer::new(0.0, 3).is_err());
        assert!(LatentOptimizer::new(1e-3, 0).is_err());
    }
}
