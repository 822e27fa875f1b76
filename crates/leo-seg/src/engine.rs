use crate::aggregate::{GradientAccumulator, OuterOptimizer};
use crate::checkpoint::Checkpoint;
use crate::config::Hyperparameters;
use crate::finetune::WeightFineTuner;
use crate::head::{SegmentationHead, NUM_CLASSES};
use crate::latent::LatentOptimizer;
use crate::pipeline::FeaturePipeline;
use crate::stats::{EpisodeStats, TrainingStats};
use crate::task::{Episode, Mode, Task};
use leo_nn::io::{restore_state, store_state, StoredTensor};
use leo_nn::PixelCrossEntropy;
use leo_tensor::{PureResult, Tensor, TensorError};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info};

/// Result of one `compute_episode` call.
#[derive(Debug, Clone)]
pub struct EpisodeOutcome {
    pub mean_validation_loss: f32,
    /// Mean IoU keyed by each task's class label, in task order.
    pub per_class_iou: Vec<(String, f32)>,
}

/// The nested-optimization engine.
///
/// Owns the feature pipeline, the segmentation meta-weights and the outer
/// optimizer. The decoder-facing pieces are built lazily: the first episode
/// ever processed triggers exactly one shape-discovery pass against its
/// first task, once per process lifetime. Tasks within an episode run
/// strictly sequentially; meta-parameters are read-only during task
/// processing and mutated exactly once afterwards, in meta-train mode only.
#[derive(Debug)]
pub struct LeoEngine<P: FeaturePipeline> {
    pipeline: P,
    hyp: Hyperparameters,
    loss: PixelCrossEntropy,
    latent: LatentOptimizer,
    finetuner: WeightFineTuner,
    head: Option<SegmentationHead>,
    seg_weight: Option<Tensor>,
    outer: Option<OuterOptimizer>,
    accumulator: GradientAccumulator,
    stats: TrainingStats,
}

impl<P: FeaturePipeline> LeoEngine<P> {
    pub fn new(pipeline: P, hyp: Hyperparameters) -> PureResult<Self> {
        hyp.validate()?;
        Ok(Self {
            pipeline,
            loss: PixelCrossEntropy::new(NUM_CLASSES)?,
            latent: LatentOptimizer::new(hyp.inner_loop_lr, hyp.num_adaptation_steps)?,
            finetuner: WeightFineTuner::new(hyp.finetuning_lr, hyp.num_finetuning_steps)?,
            head: None,
            seg_weight: None,
            outer: None,
            accumulator: GradientAccumulator::new(),
            stats: TrainingStats::new(),
            hyp,
        })
    }

    /// One-time shape discovery against a sample task. Safe to call again;
    /// later calls are no-ops.
    pub fn discover(&mut self, task: &Task) -> PureResult<()> {
        if self.head.is_some() && self.pipeline.is_prepared() {
            return Ok(());
        }
        self.pipeline.prepare(task.train_images())?;
        let head = SegmentationHead::new(
            self.pipeline.feature_channels(),
            self.pipeline.image_channels(),
            self.pipeline.image_hw(),
        )?;
        let mut rng = StdRng::seed_from_u64(self.hyp.seed.wrapping_add(0x1ea));
        self.seg_weight = Some(head.init_weight(&mut rng)?);
        self.head = Some(head);
        self.outer = Some(OuterOptimizer::new(self.hyp.outer_loop_lr)?);
        debug!("decoder, segmentation head and outer optimizer initialized");
        Ok(())
    }

    /// Single entry point the driver calls once per episode.
    pub fn compute_episode(&mut self, episode: &Episode) -> PureResult<EpisodeOutcome> {
        self.discover(&episode.tasks()[0])?;
        let num_tasks = episode.tasks().len();
        let scale = 1.0 / num_tasks as f32;
        let mut total_loss = 0.0f32;
        let mut per_class_iou = Vec::with_capacity(num_tasks);

        for task in episode.tasks() {
            let head = self.head.as_ref().ok_or(TensorError::InvalidValue {
                label: "engine_uninitialized",
            })?;
            let seg_weight = self.seg_weight.as_ref().ok_or(TensorError::InvalidValue {
                label: "engine_uninitialized",
            })?;
            let adapt = self.latent.adapt(
                &mut self.pipeline,
                head,
                &mut self.loss,
                seg_weight,
                task.train_images(),
                task.train_masks(),
            )?;
            let outcome = self.finetuner.run(
                &mut self.pipeline,
                head,
                &mut self.loss,
                seg_weight,
                task,
                &adapt,
                episode.mode(),
            )?;
            if episode.mode() == Mode::MetaTrain {
                let meta_grad = outcome.meta_grad.ok_or(TensorError::InvalidValue {
                    label: "missing_meta_gradient",
                })?;
                self.accumulator.accumulate(&meta_grad, scale)?;
            }
            total_loss += outcome.val_loss;
            per_class_iou.push((task.class_label().to_string(), outcome.mean_iou));
            debug!(
                class = task.class_label(),
                val_loss = outcome.val_loss,
                mean_iou = outcome.mean_iou,
                "task complete"
            );
        }

        if episode.mode() == Mode::MetaTrain {
            let grads = self.accumulator.finish(self.hyp.max_grad_norm)?;
            let seg_weight = self.seg_weight.as_mut().ok_or(TensorError::InvalidValue {
                label: "engine_uninitialized",
            })?;
            let outer = self.outer.as_mut().ok_or(TensorError::InvalidValue {
                label: "engine_uninitialized",
            })?;
            outer.apply(&mut self.pipeline, seg_weight, grads)?;
        }

        let mean_validation_loss = total_loss / num_tasks as f32;
        self.stats.record(EpisodeStats {
            episode: episode.index(),
            mode: episode.mode(),
            mean_validation_loss,
            per_class_iou: per_class_iou.clone(),
        });
        info!(
            episode = episode.index(),
            mode = %episode.mode(),
            mean_validation_loss,
            "episode complete"
        );
        Ok(EpisodeOutcome {
            mean_validation_loss,
            per_class_iou,
        })
    }

    /// Recorded statistics across every processed episode.
    pub fn stats(&self) -> &TrainingStats {
        &self.stats
    }

    /// The segmentation meta-weights, once discovered.
    pub fn seg_weight(&self) -> Option<&Tensor> {
        self.seg_weight.as_ref()
    }

    /// The owned feature pipeline.
    pub fn pipeline(&self) -> &P {
        &self.pipeline
    }

    /// Number of outer steps taken so far (decoder optimizer).
    pub fn outer_steps(&self) -> u64 {
        self.outer.as_ref().map_or(0, |o| o.decoder_steps())
    }

    /// True when no per-task gradient is pending aggregation.
    pub fn accumulator_is_empty(&self) -> bool {
        self.accumulator.is_empty()
    }

    /// Captures the full meta-state for persistence.
    pub fn snapshot(&self) -> PureResult<Checkpoint> {
        let seg_weight = self.seg_weight.as_ref().ok_or(TensorError::InvalidValue {
            label: "engine_uninitialized",
        })?;
        let outer = self.outer.as_ref().ok_or(TensorError::InvalidValue {
            label: "engine_uninitialized",
        })?;
        let (decoder_opt, seg_opt) = outer.state();
        Ok(Checkpoint {
            episode: self.stats.latest().map_or(0, |s| s.episode),
            decoder: store_state(&self.pipeline.decoder_state_dict()?),
            seg_weight: StoredTensor::from_tensor(seg_weight),
            decoder_opt,
            seg_opt,
            stats: self.stats.clone(),
        })
    }

    /// Restores meta-state from a checkpoint. The sample task drives shape
    /// discovery when the engine has not yet been initialized this process.
    pub fn restore(&mut self, checkpoint: Checkpoint, sample_task: &Task) -> PureResult<()> {
        self.discover(sample_task)?;
        self.pipeline
            .load_decoder_state_dict(&restore_state(checkpoint.decoder)?)?;
        self.seg_weight = Some(checkpoint.seg_weight.into_tensor()?);
        let outer = self.outer.as_mut().ok_or(TensorError::InvalidValue {
            label: "engine_uninitialized",
        })?;
        outer.load_state(checkpoint.decoder_opt, checkpoint.seg_opt);
        self.stats = checkpoint.stats;
        self.accumulator.reset();
        Ok(())
    }
}
