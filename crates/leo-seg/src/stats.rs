use crate::task::Mode;
use serde::{Deserialize, Serialize};

/// Summary of one completed episode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodeStats {
    pub episode: u64,
    pub mode: Mode,
    pub mean_validation_loss: f32,
    /// Mean IoU keyed by each task's class label, in task order.
    pub per_class_iou: Vec<(String, f32)>,
}

/// Append-only record of episode statistics across all modes. Part of the
/// checkpoint state so a resumed run keeps its history.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingStats {
    records: Vec<EpisodeStats>,
}

impl TrainingStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one episode's statistics.
    pub fn record(&mut self, stats: EpisodeStats) {
        self.records.push(stats);
    }

    /// Number of recorded episodes.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Most recently recorded episode, if any.
    pub fn latest(&self) -> Option<&EpisodeStats> {
        self.records.last()
    }

    /// All records for one mode, in recording order.
    pub fn episodes_for(&self, mode: Mode) -> impl Iterator<Item = &EpisodeStats> {
        self.records.iter().filter(move |r| r.mode == mode)
    }

    /// Mean validation loss across every episode of a mode.
    pub fn mean_loss_for(&self, mode: Mode) -> Option<f32> {
        let mut sum = 0.0f32;
        let mut count = 0usize;
        for record in self.episodes_for(mode) {
            sum += record.mean_validation_loss;
            count += 1;
        }
        if count == 0 {
            None
        } else {
            Some(sum / count as f32)
        }
    }
}
