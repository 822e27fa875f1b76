use crate::stats::TrainingStats;
use leo_nn::io::StoredTensor;
use leo_nn::AdamState;
use leo_tensor::{PureResult, TensorError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// Everything a resumed run needs: meta-parameters, both optimizer moment
/// states, and the cumulative episode statistics. Cadence and file layout
/// belong to the driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Index of the last recorded episode.
    pub episode: u64,
    /// Decoder parameters keyed by canonical name.
    pub decoder: HashMap<String, StoredTensor>,
    /// Segmentation meta-weights.
    pub seg_weight: StoredTensor,
    /// Moment state of the decoder optimizer.
    pub decoder_opt: AdamState,
    /// Moment state of the segmentation-weight optimizer.
    pub seg_opt: AdamState,
    /// Cumulative per-episode statistics.
    pub stats: TrainingStats,
}

fn io_error(err: std::io::Error) -> TensorError {
    TensorError::IoError {
        message: err.to_string(),
    }
}

fn serde_error(err: impl ToString) -> TensorError {
    TensorError::SerializationError {
        message: err.to_string(),
    }
}

/// Writes a checkpoint in the compact bincode format.
pub fn save_checkpoint<P: AsRef<Path>>(checkpoint: &Checkpoint, path: P) -> PureResult<()> {
    let file = File::create(path.as_ref()).map_err(io_error)?;
    let writer = BufWriter::new(file);
    bincode::serialize_into(writer, checkpoint).map_err(serde_error)?;
    Ok(())
}

/// Reads a checkpoint written by [`save_checkpoint`].
pub fn load_checkpoint<P: AsRef<Path>>(path: P) -> PureResult<Checkpoint> {
    let file = File::open(path.as_ref()).map_err(io_error)?;
    let reader = BufReader::new(file);
    bincode::deserialize_from(reader).map_err(serde_error)
}
