//! Neural building blocks for the LEO segmentation engine.
//!
//! Every layer exposes an explicit `forward`/`backward` pair instead of a
//! recorded autograd graph; the nested-optimization engine in `leo-seg`
//! composes these passes by hand, which keeps the first-order/second-order
//! boundary of the meta-gradient visible in the code.

pub mod io;
pub mod layers;
pub mod loss;
pub mod module;
pub mod optim;

pub use io::{
    load_bincode, load_json, restore_state, save_bincode, save_json, store_state, StoredTensor,
};
pub use layers::conv::{conv2d, conv2d_backward, Conv2d, ConvGeometry, ConvGrads};
pub use layers::{Bilinear2d, Dropout, Relu, Sigmoid};
pub use loss::{Loss, PixelCrossEntropy};
pub use module::{Module, Parameter};
pub use optim::{clip_gradient, Adam, AdamConfig, AdamState};

pub use leo_tensor::{PureResult, Tensor, TensorError};
