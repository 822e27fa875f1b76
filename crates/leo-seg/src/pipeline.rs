use leo_nn::Parameter;
use leo_tensor::{PureResult, Tensor, TensorError};
use std::collections::HashMap;

/// Per-layer importance maps computed once per task during the discovery
/// forward pass and held fixed for the remainder of that task's inner loops.
///
/// Each map is `1 x (h*w)` and is broadcast multiplicatively across batch and
/// channels. Recomputing gates mid-task would invalidate the gradient
/// accounting, so the engine threads one immutable value per task instead of
/// the mutable list arguments the gating side channel would otherwise need.
#[derive(Debug, Clone)]
pub struct GateMaps {
    /// One map per encoder skip tap, in tap order.
    pub encoder: Vec<Tensor>,
    /// Latent map, one map per decoder stage output, then the final map.
    pub decoder: Vec<Tensor>,
}

/// Multiplies a `1 x (h*w)` gate into every row and channel of `x`.
pub(crate) fn apply_gate(x: &Tensor, gate: &Tensor, channels: usize) -> PureResult<Tensor> {
    let (rows, cols) = x.shape();
    let pixels = gate.shape().1;
    if gate.shape().0 != 1 || channels * pixels != cols {
        return Err(TensorError::ShapeMismatch {
            left: gate.shape(),
            right: (1, cols / channels.max(1)),
        });
    }
    let mut out = x.clone();
    let gate_data = gate.data();
    let out_data = out.data_mut();
    for r in 0..rows {
        for c in 0..channels {
            let offset = r * cols + c * pixels;
            for p in 0..pixels {
                out_data[offset + p] *= gate_data[p];
            }
        }
    }
    Ok(out)
}

/// Contract between the engine and the feature pipeline (encoder + decoder).
///
/// `encode` must produce the same ordered skip-feature shapes for a given
/// image shape, so a segmentation head sized against the first task stays
/// valid for every later task. The latents it returns are the leaf the latent
/// inner loop differentiates against; the (frozen) encoder itself is never
/// differentiated.
///
/// `decode` returns the decoded features together with an opaque trace of the
/// intermediates its backward pass needs. The trace is consumed by
/// `decode_backward`; dropping it releases the graph, so per-task graphs
/// never outlive the gradient extraction.
pub trait FeaturePipeline {
    /// Saved intermediates of one decode pass.
    type Trace;

    /// One-time shape discovery: records skip/latent shapes and builds the
    /// decoder stages against them. Idempotent once prepared; later calls
    /// with a different image shape fail with a shape error.
    fn prepare(&mut self, images: &Tensor) -> PureResult<()>;

    /// Returns `true` once `prepare` has built the decoder.
    fn is_prepared(&self) -> bool;

    /// Encodes an image batch into ordered skip features plus latents,
    /// applying encoder gates mid-stream when provided.
    fn encode(&self, images: &Tensor, gates: Option<&GateMaps>) -> PureResult<(Vec<Tensor>, Tensor)>;

    /// Gate-producing variant of `encode`: taps stay ungated and one gate map
    /// per tap is returned alongside.
    fn encode_discover(&self, images: &Tensor) -> PureResult<(Vec<Tensor>, Tensor, Vec<Tensor>)>;

    /// Decodes latents against the skip features, applying decoder gates when
    /// provided. A gated decode of a single-example batch tiles the inputs to
    /// the configured ensemble width and mean-reduces the output back.
    fn decode(
        &self,
        skips: &[Tensor],
        latents: &Tensor,
        gates: Option<&GateMaps>,
    ) -> PureResult<(Tensor, Self::Trace)>;

    /// Gate-producing variant of `decode`: runs ungated and returns the
    /// decoder gate maps computed from its own intermediates.
    fn decode_discover(
        &self,
        skips: &[Tensor],
        latents: &Tensor,
    ) -> PureResult<(Tensor, Self::Trace, Vec<Tensor>)>;

    /// Backward pass through the decode recorded by `trace`. Always returns
    /// the gradient with respect to the latents; accumulates decoder
    /// parameter gradients only when `accumulate` is set.
    fn decode_backward(
        &mut self,
        trace: Self::Trace,
        grad_features: &Tensor,
        accumulate: bool,
    ) -> PureResult<Tensor>;

    /// Channel count of the decoded feature maps.
    fn feature_channels(&self) -> usize;

    /// Channel count of the input images.
    fn image_channels(&self) -> usize;

    /// Spatial size of the input images (and of the decoded features).
    fn image_hw(&self) -> (usize, usize);

    /// Visits the decoder's trainable parameters.
    fn visit_decoder_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()>;

    /// Visits the decoder's trainable parameters mutably.
    fn visit_decoder_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()>;

    /// Clears every decoder gradient accumulator.
    fn zero_decoder_gradients(&mut self) -> PureResult<()> {
        self.visit_decoder_parameters_mut(&mut |param| {
            param.zero_gradient();
            Ok(())
        })
    }

    /// Drains accumulated decoder gradients into a name-keyed map.
    fn take_decoder_gradients(&mut self) -> PureResult<HashMap<String, Tensor>> {
        let mut grads = HashMap::new();
        self.visit_decoder_parameters_mut(&mut |param| {
            if let Some(grad) = param.gradient() {
                grads.insert(param.name().to_string(), grad.clone());
            }
            param.zero_gradient();
            Ok(())
        })?;
        Ok(grads)
    }

    /// Captures the decoder parameters keyed by canonical name.
    fn decoder_state_dict(&self) -> PureResult<HashMap<String, Tensor>> {
        let mut state = HashMap::new();
        self.visit_decoder_parameters(&mut |param| {
            state.insert(param.name().to_string(), param.value().clone());
            Ok(())
        })?;
        Ok(state)
    }

    /// Restores decoder parameters from a state dict.
    fn load_decoder_state_dict(&mut self, state: &HashMap<String, Tensor>) -> PureResult<()> {
        self.visit_decoder_parameters_mut(&mut |param| {
            let Some(value) = state.get(param.name()) else {
                return Err(TensorError::MissingParameter {
                    name: param.name().to_string(),
                });
            };
            param.load_value(value)
        })
    }
}
