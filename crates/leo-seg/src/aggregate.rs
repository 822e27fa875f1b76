use crate::finetune::TaskMetaGrad;
use crate::pipeline::FeaturePipeline;
use leo_nn::{clip_gradient, Adam, AdamConfig, AdamState};
use leo_tensor::{PureResult, Tensor};
use std::collections::HashMap;

/// Accumulator key for the segmentation meta-weight gradient.
pub const SEG_WEIGHT_KEY: &str = "segmentation::weight";

/// Running sums of per-task meta-gradients keyed by meta-parameter identity.
///
/// Each task's contribution is pre-scaled by `1/num_tasks` before summing;
/// the element-wise clamp runs once, in `finish`, after all tasks have
/// accumulated. Clipping after the sum keeps aggregation commutative: a
/// permuted task list yields the same result up to float summation order.
#[derive(Debug, Default)]
pub struct GradientAccumulator {
    sums: HashMap<String, Tensor>,
    tasks: usize,
}

impl GradientAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when no task has reported a gradient since the last
    /// `finish`/`reset`.
    pub fn is_empty(&self) -> bool {
        self.sums.is_empty() && self.tasks == 0
    }

    /// Number of tasks accumulated so far.
    pub fn task_count(&self) -> usize {
        self.tasks
    }

    /// Adds one task's meta-gradient, scaled by `scale` (`1/num_tasks`).
    /// Decoder parameters absent from the task's computation path simply
    /// contribute nothing.
    pub fn accumulate(&mut self, meta_grad: &TaskMetaGrad, scale: f32) -> PureResult<()> {
        self.add_entry(SEG_WEIGHT_KEY, &meta_grad.seg_weight, scale)?;
        for (name, grad) in &meta_grad.decoder {
            self.add_entry(name, grad, scale)?;
        }
        self.tasks += 1;
        Ok(())
    }

    fn add_entry(&mut self, name: &str, grad: &Tensor, scale: f32) -> PureResult<()> {
        match self.sums.get_mut(name) {
            Some(sum) => sum.add_scaled(grad, scale)?,
            None => {
                self.sums.insert(name.to_string(), grad.scale(scale)?);
            }
        }
        Ok(())
    }

    /// Clamps every accumulated component to `[-bound, bound]` and drains
    /// the accumulator, leaving it empty for the next episode.
    pub fn finish(&mut self, bound: f32) -> PureResult<HashMap<String, Tensor>> {
        let mut sums = std::mem::take(&mut self.sums);
        self.tasks = 0;
        for grad in sums.values_mut() {
            clip_gradient(grad, bound)?;
        }
        Ok(sums)
    }

    /// Discards any accumulated state.
    pub fn reset(&mut self) {
        self.sums.clear();
        self.tasks = 0;
    }
}

/// Applies one outer update per episode: two independent Adam states, one for
/// the decoder parameters and one for the segmentation meta-weights.
#[derive(Debug)]
pub struct OuterOptimizer {
    decoder: Adam,
    seg: Adam,
}

impl OuterOptimizer {
    pub fn new(outer_loop_lr: f32) -> PureResult<Self> {
        Ok(Self {
            decoder: Adam::new(AdamConfig::with_learning_rate(outer_loop_lr))?,
            seg: Adam::new(AdamConfig::with_learning_rate(outer_loop_lr))?,
        })
    }

    /// Installs the aggregated gradients and performs exactly one step of
    /// each optimizer. Parameters without an aggregated entry are untouched.
    pub fn apply<P: FeaturePipeline>(
        &mut self,
        pipeline: &mut P,
        seg_weight: &mut Tensor,
        mut grads: HashMap<String, Tensor>,
    ) -> PureResult<()> {
        if let Some(seg_grad) = grads.remove(SEG_WEIGHT_KEY) {
            self.seg.step_tensor(SEG_WEIGHT_KEY, seg_weight, &seg_grad)?;
        }
        self.decoder.begin_step();
        let decoder = &mut self.decoder;
        pipeline.visit_decoder_parameters_mut(&mut |param| {
            // Install the aggregated value into the gradient slot, then step.
            if let Some(grad) = grads.get(param.name()) {
                param.set_gradient(grad.clone())?;
            }
            if let Some(grad) = param.gradient().cloned() {
                let name = param.name().to_string();
                let mut value = param.value().clone();
                decoder.update(&name, &mut value, &grad)?;
                param.load_value(&value)?;
            }
            param.zero_gradient();
            Ok(())
        })
    }

    /// Number of outer steps the decoder optimizer has taken.
    pub fn decoder_steps(&self) -> u64 {
        self.decoder.step_count()
    }

    /// Number of outer steps the segmentation optimizer has taken.
    pub fn seg_steps(&self) -> u64 {
        self.seg.step_count()
    }

    /// Exports both moment states for checkpointing.
    pub fn state(&self) -> (AdamState, AdamState) {
        (self.decoder.state(), self.seg.state())
    }

    /// Restores both moment states.
    pub fn load_state(&mut self, decoder: AdamState, seg: AdamState) {
        self.decoder.load_state(decoder);
        self.seg.load_state(seg);
    }
}
