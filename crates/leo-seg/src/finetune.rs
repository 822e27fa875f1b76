use crate::head::SegmentationHead;
use crate::latent::AdaptOutcome;
use crate::metrics::mean_iou;
use crate::pipeline::FeaturePipeline;
use crate::task::{Mode, Task};
use leo_nn::{Loss, PixelCrossEntropy};
use leo_tensor::{PureResult, Tensor, TensorError};
use std::collections::HashMap;

/// Per-task gradient with respect to the shared meta-parameters.
#[derive(Debug)]
pub struct TaskMetaGrad {
    /// Gradient w.r.t. the segmentation meta-weights.
    pub seg_weight: Tensor,
    /// Gradients w.r.t. decoder parameters, keyed by canonical name. A
    /// parameter off the task's computation path is simply absent.
    pub decoder: HashMap<String, Tensor>,
}

/// Result of one task's fine-tuning tail.
#[derive(Debug)]
pub struct FineTuneOutcome {
    pub val_loss: f32,
    pub mean_iou: f32,
    /// Present only in meta-train mode.
    pub meta_grad: Option<TaskMetaGrad>,
    /// Training loss under the first adapted weights, for descent checks.
    pub adapted_train_loss: f32,
}

/// MAML-style fine-tuning of the segmentation weights on fixed decoded
/// features, followed by the mode-dependent validation tail.
///
/// Every inner gradient here is detached, so the Jacobian of the adaptation
/// chain `w_M(w_0)` is the identity: the validation gradient at `w_M` IS the
/// meta-gradient w.r.t. `w_0`, and the decoder meta-gradient flows through
/// the validation decode alone.
#[derive(Debug, Clone, Copy)]
pub struct WeightFineTuner {
    finetuning_lr: f32,
    steps: usize,
}

impl WeightFineTuner {
    pub fn new(finetuning_lr: f32, steps: usize) -> PureResult<Self> {
        if finetuning_lr <= 0.0 || !finetuning_lr.is_finite() {
            return Err(TensorError::NonPositiveLearningRate {
                rate: finetuning_lr,
            });
        }
        if steps == 0 {
            return Err(TensorError::InvalidValue {
                label: "num_finetuning_steps",
            });
        }
        Ok(Self {
            finetuning_lr,
            steps,
        })
    }

    /// Adapts the weights and evaluates the held-out set per the mode.
    pub fn run<P: FeaturePipeline>(
        &self,
        pipeline: &mut P,
        head: &SegmentationHead,
        loss: &mut PixelCrossEntropy,
        seg_weight: &Tensor,
        task: &Task,
        adapt: &AdaptOutcome,
        mode: Mode,
    ) -> PureResult<FineTuneOutcome> {
        let mut weight = seg_weight.clone();
        weight.add_scaled(&adapt.seed_weight_grad, -self.finetuning_lr)?;
        for _step in 1..self.steps {
            let logits = head.forward(&adapt.features, task.train_images(), &weight)?;
            let grad_logits = loss.backward(&logits, task.train_masks())?;
            let (grad_weight, _grad_features) =
                head.backward(&adapt.features, task.train_images(), &weight, &grad_logits)?;
            weight.add_scaled(&grad_weight, -self.finetuning_lr)?;
        }
        let adapted_train_loss = {
            let logits = head.forward(&adapt.features, task.train_images(), &weight)?;
            loss.forward(&logits, task.train_masks())?.data()[0]
        };

        match mode {
            Mode::MetaTrain => {
                let (val_skips, val_latents) =
                    pipeline.encode(task.val_images(), Some(&adapt.gates))?;
                let (val_features, val_trace) =
                    pipeline.decode(&val_skips, &val_latents, Some(&adapt.gates))?;
                let logits = head.forward(&val_features, task.val_images(), &weight)?;
                let val_loss = loss.forward(&logits, task.val_masks())?.data()[0];
                let grad_logits = loss.backward(&logits, task.val_masks())?;
                let (seg_grad, grad_features) =
                    head.backward(&val_features, task.val_images(), &weight, &grad_logits)?;
                pipeline.zero_decoder_gradients()?;
                let _grad_latents = pipeline.decode_backward(val_trace, &grad_features, true)?;
                let decoder = pipeline.take_decoder_gradients()?;
                let iou = mean_iou(&logits, task.val_masks())?;
                Ok(FineTuneOutcome {
                    val_loss,
                    mean_iou: iou,
                    meta_grad: Some(TaskMetaGrad {
                        seg_weight: seg_grad,
                        decoder,
                    }),
                    adapted_train_loss,
                })
            }
            Mode::MetaVal | Mode::MetaTest => {
                // Evaluation only: walk the held-out examples one at a time.
                let batch = task.val_images().shape().0;
                let mut loss_sum = 0.0f32;
                let mut iou_sum = 0.0f32;
                for i in 0..batch {
                    let image = task.val_images().rows_slice(i, i + 1)?;
                    let mask = task.val_masks().rows_slice(i, i + 1)?;
                    let (skips, latents) = pipeline.encode(&image, Some(&adapt.gates))?;
                    let (features, trace) = pipeline.decode(&skips, &latents, Some(&adapt.gates))?;
                    drop(trace);
                    let logits = head.forward(&features, &image, &weight)?;
                    loss_sum += loss.forward(&logits, &mask)?.data()[0];
                    iou_sum += mean_iou(&logits, &mask)?;
                }
                Ok(FineTuneOutcome {
                    val_loss: loss_sum / batch as f32,
                    mean_iou: iou_sum / batch as f32,
                    meta_grad: None,
                    adapted_train_loss,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Hyperparameters;
    use crate::latent::LatentOptimizer;
    use crate::skipnet::SkipNetPipeline;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn setup() -> (SkipNetPipeline, SegmentationHead, Tensor, Task) {
        let hyp = Hyperparameters {
            base_channel_width: 2,
            dropout_rate: 0.0,
            seed: 23,
            ..Hyperparameters::default()
        };
        let train_images =
            Tensor::from_fn(2, 16, |r, c| ((r * 16 + c) as f32 * 0.17).sin()).unwrap();
        let train_masks =
            Tensor::from_fn(2, 16, |_r, c| if c < 8 { 1.0 } else { 0.0 }).unwrap();
        let val_images =
            Tensor::from_fn(2, 16, |r, c| ((r * 16 + c) as f32 * 0.29).cos()).unwrap();
        let val_masks = train_masks.clone();
        let task = Task::new(train_images.clone(), train_masks, val_images, val_masks, "cat")
            .unwrap();
        let mut pipeline = SkipNetPipeline::new(1, (4, 4), &hyp).unwrap();
        pipeline.prepare(&train_images).unwrap();
        let head = SegmentationHead::new(
            pipeline.feature_channels(),
            pipeline.image_channels(),
            pipeline.image_hw(),
        )
        .unwrap();
        let mut rng = StdRng::seed_from_u64(23);
        let weight = head.init_weight(&mut rng).unwrap();
        (pipeline, head, weight, task)
    }

    fn adapt(
        pipeline: &mut SkipNetPipeline,
        head: &SegmentationHead,
        weight: &Tensor,
        task: &Task,
    ) -> AdaptOutcome {
        let mut loss = PixelCrossEntropy::new(2).unwrap();
        LatentOptimizer::new(1e-3, 1)
            .unwrap()
            .adapt(
                pipeline,
                head,
                &mut loss,
                weight,
                task.train_images(),
                task.train_masks(),
            )
            .unwrap()
    }

    #[test]
    fn finetuning_reduces_training_loss() {
        let (mut pipeline, head, weight, task) = setup();
        let outcome = adapt(&mut pipeline, &head, &weight, &task);
        let mut loss = PixelCrossEntropy::new(2).unwrap();
        let tuner = WeightFineTuner::new(1e-2, 5).unwrap();
        let result = tuner
            .run(
                &mut pipeline,
                &head,
                &mut loss,
                &weight,
                &task,
                &outcome,
                Mode::MetaTrain,
            )
            .unwrap();
        // Loss under the adapted weights must not exceed the pre-adaptation
        // training loss for a small step size.
        assert!(
            result.adapted_train_loss <= outcome.final_train_loss + 1e-6,
            "adapted {} vs base {}",
            result.adapted_train_loss,
            outcome.final_train_loss
        );
    }

    #[test]
    fn meta_train_produces_meta_gradients() {
        let (mut pipeline, head, weight, task) = setup();
        let outcome = adapt(&mut pipeline, &head, &weight, &task);
        let mut loss = PixelCrossEntropy::new(2).unwrap();
        let tuner = WeightFineTuner::new(1e-3, 2).unwrap();
        let result = tuner
            .run(
                &mut pipeline,
                &head,
                &mut loss,
                &weight,
                &task,
                &outcome,
                Mode::MetaTrain,
            )
            .unwrap();
        let meta = result.meta_grad.unwrap();
        assert_eq!(meta.seg_weight.shape(), weight.shape());
        // Conv stages sit on the validation path and must report gradients.
        assert!(meta.decoder.keys().any(|k| k.contains("conv_a")));
        // Gate squeeze heads are off-path once gates are fixed constants.
        assert!(!meta.decoder.keys().any(|k| k.contains("squeeze")));
        assert!(result.val_loss.is_finite() && result.val_loss >= 0.0);
    }

    #[test]
    fn eval_modes_report_no_gradients_and_leave_decoder_clean() {
        let (mut pipeline, head, weight, task) = setup();
        let outcome = adapt(&mut pipeline, &head, &weight, &task);
        let mut loss = PixelCrossEntropy::new(2).unwrap();
        let tuner = WeightFineTuner::new(1e-3, 2).unwrap();
        let result = tuner
            .run(
                &mut pipeline,
                &head,
                &mut loss,
                &weight,
                &task,
                &outcome,
                Mode::MetaVal,
            )
            .unwrap();
        assert!(result.meta_grad.is_none());
        assert!(result.val_loss.is_finite());
        pipeline
            .visit_decoder_parameters(&mut |p| {
                assert!(p.gradient().is_none());
                Ok(())
            })
            .unwrap();
    }
}
