//! Few-shot image segmentation via Latent Embedding Optimization.
//!
//! The engine adapts a compact latent code and a small set of segmentation
//! kernels per task (two nested inner loops), aggregates clipped per-task
//! meta-gradients across an episode, and applies one outer Adam step to the
//! shared decoder parameters and segmentation meta-weights. Episodes run in
//! one of three modes; only `meta_train` mutates meta-parameters.

pub mod aggregate;
pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod finetune;
pub mod head;
pub mod latent;
pub mod metrics;
pub mod pipeline;
pub mod skipnet;
pub mod stats;
pub mod task;

pub use aggregate::{GradientAccumulator, OuterOptimizer};
pub use checkpoint::{load_checkpoint, save_checkpoint, Checkpoint};
pub use config::Hyperparameters;
pub use engine::{EpisodeOutcome, LeoEngine};
pub use finetune::{FineTuneOutcome, TaskMetaGrad, WeightFineTuner};
pub use head::SegmentationHead;
pub use latent::{AdaptOutcome, LatentOptimizer};
pub use metrics::mean_iou;
pub use pipeline::{FeaturePipeline, GateMaps};
pub use skipnet::SkipNetPipeline;
pub use stats::{EpisodeStats, TrainingStats};
pub use task::{Episode, Mode, Task};

pub use leo_tensor::{PureResult, Tensor, TensorError};
