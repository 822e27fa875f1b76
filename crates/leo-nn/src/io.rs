use crate::module::Module;
use leo_tensor::{PureResult, Tensor, TensorError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// Serializable tensor snapshot used by state dicts and checkpoints.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredTensor {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl StoredTensor {
    pub fn from_tensor(tensor: &Tensor) -> StoredTensor {
        StoredTensor {
            rows: tensor.shape().0,
            cols: tensor.shape().1,
            data: tensor.data().to_vec(),
        }
    }

    pub fn into_tensor(self) -> PureResult<Tensor> {
        Tensor::from_vec(self.rows, self.cols, self.data)
    }
}

/// Converts a state dict into its serializable form.
pub fn store_state(state: &HashMap<String, Tensor>) -> HashMap<String, StoredTensor> {
    state
        .iter()
        .map(|(name, tensor)| (name.clone(), StoredTensor::from_tensor(tensor)))
        .collect()
}

/// Rehydrates a serialized state dict.
pub fn restore_state(
    stored: HashMap<String, StoredTensor>,
) -> PureResult<HashMap<String, Tensor>> {
    let mut state = HashMap::new();
    for (name, tensor) in stored {
        state.insert(name, tensor.into_tensor()?);
    }
    Ok(state)
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct ModuleSnapshot {
    parameters: HashMap<String, StoredTensor>,
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

/// Persists a module's parameters as pretty-printed JSON.
pub fn save_json<M: Module + ?Sized, P: AsRef<Path>>(module: &M, path: P) -> PureResult<()> {
    let snapshot = ModuleSnapshot {
        parameters: store_state(&module.state_dict()?),
    };
    let file = File::create(path.as_ref()).map_err(io_error)?;
    let writer = BufWriter::new(file);
    serde_json::to_writer_pretty(writer, &snapshot).map_err(serde_error)?;
    Ok(())
}

/// Restores a module's parameters from a JSON snapshot.
pub fn load_json<M: Module + ?Sized, P: AsRef<Path>>(module: &mut M, path: P) -> PureResult<()> {
    let file = File::open(path.as_ref()).map_err(io_error)?;
    let reader = BufReader::new(file);
    let snapshot: ModuleSnapshot = serde_json::from_reader(reader).map_err(serde_error)?;
    let state = restore_state(snapshot.parameters)?;
    module.load_state_dict(&state)
}

/// Persists a module's parameters in the compact bincode format.
pub fn save_bincode<M: Module + ?Sized, P: AsRef<Path>>(module: &M, path: P) -> PureResult<()> {
    let snapshot = ModuleSnapshot {
        parameters: store_state(&module.state_dict()?),
    };
    let file = File::create(path.as_ref()).map_err(io_error)?;
    let writer = BufWriter::new(file);
    bincode::serialize_into(writer, &snapshot).map_err(serde_error)?;
    Ok(())
}

/// Restores a module's parameters from a bincode snapshot.
pub fn load_bincode<M: Module + ?Sized, P: AsRef<Path>>(
    module: &mut M,
    path: P,
) -> PureResult<()> {
    let file = File::open(path.as_ref()).map_err(io_error)?;
    let reader = BufReader::new(file);
    let snapshot: ModuleSnapshot = bincode::deserialize_from(reader).map_err(serde_error)?;
    let state = restore_state(snapshot.parameters)?;
    module.load_state_dict(&state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::conv::Conv2d;
    use crate::module::Module;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tempfile::tempdir;

    fn conv() -> Conv2d {
        let mut rng = StdRng::seed_from_u64(21);
        Conv2d::new("io", 1, 2, (3, 3), (1, 1), (1, 1), (4, 4), &mut rng).unwrap()
    }

    #[test]
    fn save_and_load_roundtrip_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("conv.json");
        let mut layer = conv();
        let before = layer.state_dict().unwrap();
        save_json(&layer, &path).unwrap();
        // Perturb, then restore.
        let input = Tensor::zeros(1, 16).unwrap();
        let grad = Tensor::from_fn(1, 32, |_r, _c| 1.0).unwrap();
        layer.backward(&input, &grad).unwrap();
        layer.apply_step(0.1).unwrap();
        load_json(&mut layer, &path).unwrap();
        assert_eq!(layer.state_dict().unwrap(), before);
    }

    #[test]
    fn save_and_load_roundtrip_bincode() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("conv.bin");
        let mut layer = conv();
        let before = layer.state_dict().unwrap();
        save_bincode(&layer, &path).unwrap();
        let input = Tensor::from_fn(1, 16, |_r, c| c as f32 * 0.1).unwrap();
        let grad = Tensor::from_fn(1, 32, |_r, _c| 0.5).unwrap();
        layer.backward(&input, &grad).unwrap();
        layer.apply_step(0.1).unwrap();
        load_bincode(&mut layer, &path).unwrap();
        assert_eq!(layer.state_dict().unwrap(), before);
    }

    #[test]
    fn missing_parameter_is_reported() {
        let mut layer = conv();
        let empty = HashMap::new();
        assert!(matches!(
            layer.load_state_dict(&empty),
            Err(TensorError::MissingParameter { .. })
        ));
    }
}
