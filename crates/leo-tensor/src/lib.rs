//! Dense CPU tensor primitives shared by every crate in the workspace.
//!
//! A [`Tensor`] is a row-major `rows x cols` block of `f32`. Image batches are
//! stored one example per row with `channels * height * width` flattened into
//! the column axis; the layers that consume them carry the spatial geometry
//! explicitly, so the tensor itself stays rank-2.

use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::{Distribution, Normal};
use thiserror::Error;

/// Result alias used across the workspace.
pub type PureResult<T> = Result<T, TensorError>;

/// Errors surfaced by tensor constructors and operators.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TensorError {
    /// A tensor constructor received an invalid shape.
    #[error("invalid tensor dimensions ({rows} x {cols}); both axes must be non-zero")]
    InvalidDimensions { rows: usize, cols: usize },
    /// Data provided to a constructor does not match the tensor shape.
    #[error("data length mismatch: expected {expected}, got {got}")]
    DataLength { expected: usize, got: usize },
    /// An operator was asked to combine tensors of incompatible shapes.
    #[error("shape mismatch: left={left:?}, right={right:?} cannot be combined")]
    ShapeMismatch {
        left: (usize, usize),
        right: (usize, usize),
    },
    /// Learning rates must stay positive and finite.
    #[error("learning rate must be positive and finite, got {rate}")]
    NonPositiveLearningRate { rate: f32 },
    /// Numeric guard tripped on a value that would propagate NaNs.
    #[error("non-finite value for {label}: {value}")]
    NonFiniteValue { label: &'static str, value: f32 },
    /// Computation received an empty input which would otherwise panic.
    #[error("empty input: {0}")]
    EmptyInput(&'static str),
    /// Attempted to load or update a parameter missing from a state dict.
    #[error("missing parameter in state dict: {name}")]
    MissingParameter { name: String },
    /// Generic configuration violation.
    #[error("invalid value for {label}")]
    InvalidValue { label: &'static str },
    /// Wrapper around I/O failures when persisting or restoring state.
    #[error("io failure: {message}")]
    IoError { message: String },
    /// Wrapper around serde failures.
    #[error("serialization failure: {message}")]
    SerializationError { message: String },
}

/// Row-major dense matrix of `f32` values.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    data: Vec<f32>,
    rows: usize,
    cols: usize,
}

impl Tensor {
    /// Creates a tensor filled with zeros.
    pub fn zeros(rows: usize, cols: usize) -> PureResult<Self> {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        Ok(Self {
            data: vec![0.0; rows * cols],
            rows,
            cols,
        })
    }

    /// Builds a tensor from an owning vector, validating the length.
    pub fn from_vec(rows: usize, cols: usize, data: Vec<f32>) -> PureResult<Self> {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        if data.len() != rows * cols {
            return Err(TensorError::DataLength {
                expected: rows * cols,
                got: data.len(),
            });
        }
        Ok(Self { data, rows, cols })
    }

    /// Builds a tensor by evaluating `f(row, col)` for every element.
    pub fn from_fn<F>(rows: usize, cols: usize, mut f: F) -> PureResult<Self>
    where
        F: FnMut(usize, usize) -> f32,
    {
        let mut tensor = Self::zeros(rows, cols)?;
        for r in 0..rows {
            for c in 0..cols {
                tensor.data[r * cols + c] = f(r, c);
            }
        }
        Ok(tensor)
    }

    /// Samples every element uniformly from `[lo, hi)` using the caller's RNG.
    pub fn random_uniform(
        rng: &mut StdRng,
        rows: usize,
        cols: usize,
        lo: f32,
        hi: f32,
    ) -> PureResult<Self> {
        if !(lo.is_finite() && hi.is_finite()) || lo >= hi {
            return Err(TensorError::InvalidValue {
                label: "uniform_range",
            });
        }
        Self::from_fn(rows, cols, |_r, _c| rng.gen_range(lo..hi))
    }

    /// Samples every element from a normal distribution.
    pub fn random_normal(
        rng: &mut StdRng,
        rows: usize,
        cols: usize,
        mean: f32,
        std_dev: f32,
    ) -> PureResult<Self> {
        if !(mean.is_finite() && std_dev.is_finite()) || std_dev <= 0.0 {
            return Err(TensorError::InvalidValue {
                label: "normal_params",
            });
        }
        let normal = Normal::new(mean, std_dev).map_err(|_| TensorError::InvalidValue {
            label: "normal_params",
        })?;
        Self::from_fn(rows, cols, |_r, _c| normal.sample(rng))
    }

    /// Returns the `(rows, cols)` shape.
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Number of stored elements.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` when the tensor holds no elements.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Immutable view of the backing storage.
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Mutable view of the backing storage.
    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    fn check_same_shape(&self, other: &Tensor) -> PureResult<()> {
        if self.shape() != other.shape() {
            return Err(TensorError::ShapeMismatch {
                left: self.shape(),
                right: other.shape(),
            });
        }
        Ok(())
    }

    /// Element-wise sum.
    pub fn add(&self, other: &Tensor) -> PureResult<Tensor> {
        self.check_same_shape(other)?;
        let data = self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| a + b)
            .collect();
        Tensor::from_vec(self.rows, self.cols, data)
    }

    /// Element-wise difference.
    pub fn sub(&self, other: &Tensor) -> PureResult<Tensor> {
        self.check_same_shape(other)?;
        let data = self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| a - b)
            .collect();
        Tensor::from_vec(self.rows, self.cols, data)
    }

    /// Multiplies every element by `value`.
    pub fn scale(&self, value: f32) -> PureResult<Tensor> {
        let data = self.data.iter().map(|a| a * value).collect();
        Tensor::from_vec(self.rows, self.cols, data)
    }

    /// Element-wise product.
    pub fn hadamard(&self, other: &Tensor) -> PureResult<Tensor> {
        self.check_same_shape(other)?;
        let data = self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| a * b)
            .collect();
        Tensor::from_vec(self.rows, self.cols, data)
    }

    /// In-place `self += other * scale`.
    pub fn add_scaled(&mut self, other: &Tensor, scale: f32) -> PureResult<()> {
        self.check_same_shape(other)?;
        for (a, b) in self.data.iter_mut().zip(other.data.iter()) {
            *a += b * scale;
        }
        Ok(())
    }

    /// In-place element-wise clamp to `[lo, hi]`.
    pub fn clamp_(&mut self, lo: f32, hi: f32) -> PureResult<()> {
        if !(lo.is_finite() && hi.is_finite()) || lo > hi {
            return Err(TensorError::InvalidValue {
                label: "clamp_range",
            });
        }
        for value in &mut self.data {
            *value = value.clamp(lo, hi);
        }
        Ok(())
    }

    /// Naive row-major matrix product.
    pub fn matmul(&self, other: &Tensor) -> PureResult<Tensor> {
        if self.cols != other.rows {
            return Err(TensorError::ShapeMismatch {
                left: self.shape(),
                right: other.shape(),
            });
        }
        let mut out = Tensor::zeros(self.rows, other.cols)?;
        for r in 0..self.rows {
            for k in 0..self.cols {
                let lhs = self.data[r * self.cols + k];
                if lhs == 0.0 {
                    continue;
                }
                let rhs_row = &other.data[k * other.cols..(k + 1) * other.cols];
                let out_row = &mut out.data[r * other.cols..(r + 1) * other.cols];
                for (o, b) in out_row.iter_mut().zip(rhs_row.iter()) {
                    *o += lhs * b;
                }
            }
        }
        Ok(out)
    }

    /// Returns the transposed tensor.
    pub fn transpose(&self) -> Tensor {
        let mut data = vec![0.0; self.data.len()];
        for r in 0..self.rows {
            for c in 0..self.cols {
                data[c * self.rows + r] = self.data[r * self.cols + c];
            }
        }
        Tensor {
            data,
            rows: self.cols,
            cols: self.rows,
        }
    }

    /// Concatenates tensors along the row axis; all must share a column count.
    pub fn cat_rows(tensors: &[Tensor]) -> PureResult<Tensor> {
        let first = tensors.first().ok_or(TensorError::EmptyInput("cat_rows"))?;
        let cols = first.cols;
        let mut data = Vec::new();
        let mut rows = 0;
        for tensor in tensors {
            if tensor.cols != cols {
                return Err(TensorError::ShapeMismatch {
                    left: (tensor.rows, tensor.cols),
                    right: (first.rows, cols),
                });
            }
            data.extend_from_slice(&tensor.data);
            rows += tensor.rows;
        }
        Tensor::from_vec(rows, cols, data)
    }

    /// Extracts a half-open row range as a new tensor.
    pub fn rows_slice(&self, start: usize, end: usize) -> PureResult<Tensor> {
        if start >= end || end > self.rows {
            return Err(TensorError::InvalidDimensions {
                rows: end - start.min(end),
                cols: self.cols,
            });
        }
        Tensor::from_vec(
            end - start,
            self.cols,
            self.data[start * self.cols..end * self.cols].to_vec(),
        )
    }

    /// Stacks `copies` repetitions of the tensor along the row axis.
    pub fn repeat_rows(&self, copies: usize) -> PureResult<Tensor> {
        if copies == 0 {
            return Err(TensorError::InvalidValue {
                label: "repeat_rows_copies",
            });
        }
        let mut data = Vec::with_capacity(self.data.len() * copies);
        for _ in 0..copies {
            data.extend_from_slice(&self.data);
        }
        Tensor::from_vec(self.rows * copies, self.cols, data)
    }

    /// Averages across the row axis, producing a `1 x cols` tensor.
    pub fn mean_rows(&self) -> PureResult<Tensor> {
        let inv = 1.0 / self.rows as f32;
        let mut out = Tensor::zeros(1, self.cols)?;
        for r in 0..self.rows {
            for c in 0..self.cols {
                out.data[c] += self.data[r * self.cols + c] * inv;
            }
        }
        Ok(out)
    }

    /// Mean over every element.
    pub fn mean(&self) -> f32 {
        self.data.iter().sum::<f32>() / self.data.len() as f32
    }

    /// Squared L2 norm over every element.
    pub fn squared_l2_norm(&self) -> f32 {
        self.data.iter().map(|v| v * v).sum()
    }
}
