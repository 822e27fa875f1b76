use crate::config::Hyperparameters;
use crate::pipeline::{apply_gate, FeaturePipeline, GateMaps};
use leo_nn::{Bilinear2d, Conv2d, Dropout, Module, Parameter, Relu, Sigmoid};
use leo_tensor::{PureResult, Tensor, TensorError};
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Number of encoder skip taps (and decoder fusion stages).
const TAPS: usize = 2;

/// Concatenates two feature maps along the channel axis.
fn cat_channels(
    a: &Tensor,
    b: &Tensor,
    a_channels: usize,
    b_channels: usize,
    pixels: usize,
) -> PureResult<Tensor> {
    let (rows, a_cols) = a.shape();
    if a_cols != a_channels * pixels || b.shape() != (rows, b_channels * pixels) {
        return Err(TensorError::ShapeMismatch {
            left: a.shape(),
            right: b.shape(),
        });
    }
    let mut out = Tensor::zeros(rows, (a_channels + b_channels) * pixels)?;
    let out_cols = out.shape().1;
    let out_data = out.data_mut();
    for r in 0..rows {
        out_data[r * out_cols..r * out_cols + a_cols]
            .copy_from_slice(&a.data()[r * a_cols..(r + 1) * a_cols]);
        out_data[r * out_cols + a_cols..(r + 1) * out_cols]
            .copy_from_slice(&b.data()[r * (b_channels * pixels)..(r + 1) * (b_channels * pixels)]);
    }
    Ok(out)
}

/// Splits a channel-concatenated map back into its two halves.
fn split_channels(
    x: &Tensor,
    a_channels: usize,
    b_channels: usize,
    pixels: usize,
) -> PureResult<(Tensor, Tensor)> {
    let (rows, cols) = x.shape();
    if cols != (a_channels + b_channels) * pixels {
        return Err(TensorError::ShapeMismatch {
            left: x.shape(),
            right: (rows, (a_channels + b_channels) * pixels),
        });
    }
    let a_cols = a_channels * pixels;
    let b_cols = b_channels * pixels;
    let mut a = Tensor::zeros(rows, a_cols)?;
    let mut b = Tensor::zeros(rows, b_cols)?;
    for r in 0..rows {
        a.data_mut()[r * a_cols..(r + 1) * a_cols]
            .copy_from_slice(&x.data()[r * cols..r * cols + a_cols]);
        b.data_mut()[r * b_cols..(r + 1) * b_cols]
            .copy_from_slice(&x.data()[r * cols + a_cols..(r + 1) * cols]);
    }
    Ok((a, b))
}

/// Sums across the row axis, the transpose of row tiling.
fn sum_rows(x: &Tensor) -> PureResult<Tensor> {
    let rows = x.shape().0;
    x.mean_rows()?.scale(rows as f32)
}

/// Squeeze-conv gate head: sigmoid of a 1x1 conv, mean-reduced over the batch
/// so the map broadcasts across any later batch size.
fn gate_from(squeeze: &Conv2d, activations: &Tensor) -> PureResult<Tensor> {
    Sigmoid.forward(&squeeze.forward(activations)?)?.mean_rows()
}

/// One skip-fusion stage of the decoder: resize the running output to the
/// skip's plane, concatenate along channels, then a small conv block.
#[derive(Debug)]
struct DecoderStage {
    resize: Bilinear2d,
    conv_a: Conv2d,
    dropout: Dropout,
    conv_b: Conv2d,
    squeeze: Conv2d,
    skip_channels: usize,
    run_channels: usize,
    out_channels: usize,
    pixels: usize,
}

/// Saved intermediates of one stage forward.
#[derive(Debug)]
struct StageTrace {
    running_in: Tensor,
    cat: Tensor,
    a_pre: Tensor,
    a_relu: Tensor,
    a_drop: Tensor,
    b_pre: Tensor,
}

impl DecoderStage {
    fn forward(&self, skip: &Tensor, running: &Tensor) -> PureResult<(Tensor, StageTrace)> {
        let resized = self.resize.forward(running)?;
        let cat = cat_channels(skip, &resized, self.skip_channels, self.run_channels, self.pixels)?;
        let a_pre = self.conv_a.forward(&cat)?;
        let a_relu = Relu.forward(&a_pre)?;
        let a_drop = self.dropout.forward(&a_relu)?;
        let b_pre = self.conv_b.forward(&a_drop)?;
        let out = Relu.forward(&b_pre)?;
        Ok((
            out,
            StageTrace {
                running_in: running.clone(),
                cat,
                a_pre,
                a_relu,
                a_drop,
                b_pre,
            },
        ))
    }

    /// Returns the gradient with respect to the running input. The skip
    /// gradient is discarded: skips come from the frozen encoder.
    fn backward(&mut self, trace: StageTrace, grad_out: &Tensor) -> PureResult<Tensor> {
        let mut relu = Relu;
        let mut dropout_grad = relu.backward(&trace.b_pre, grad_out)?;
        dropout_grad = self.conv_b.backward(&trace.a_drop, &dropout_grad)?;
        dropout_grad = self.dropout.backward(&trace.a_relu, &dropout_grad)?;
        dropout_grad = relu.backward(&trace.a_pre, &dropout_grad)?;
        let grad_cat = self.conv_a.backward(&trace.cat, &dropout_grad)?;
        let (_grad_skip, grad_resized) =
            split_channels(&grad_cat, self.skip_channels, self.run_channels, self.pixels)?;
        self.resize.backward(&trace.running_in, &grad_resized)
    }

    fn visit(&self, visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>) -> PureResult<()> {
        self.conv_a.visit_parameters(visitor)?;
        self.conv_b.visit_parameters(visitor)?;
        self.squeeze.visit_parameters(visitor)
    }

    fn visit_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.conv_a.visit_parameters_mut(visitor)?;
        self.conv_b.visit_parameters_mut(visitor)?;
        self.squeeze.visit_parameters_mut(visitor)
    }
}

#[derive(Debug)]
struct Decoder {
    latent_squeeze: Conv2d,
    stages: Vec<DecoderStage>,
    final_conv: Conv2d,
    final_squeeze: Conv2d,
    latent_channels: usize,
    latent_pixels: usize,
}

/// Saved intermediates of one decode pass. Dropping a trace releases the
/// graph; nothing decode-related survives the gradient extraction.
#[derive(Debug)]
pub struct DecodeTrace {
    stage_traces: Vec<StageTrace>,
    final_in: Tensor,
    gates: Option<Vec<Tensor>>,
    tiled: usize,
}

/// Frozen convolutional encoder with squeeze-conv gate heads plus a
/// shape-discovered decoder of ordered skip-fusion stages.
#[derive(Debug)]
pub struct SkipNetPipeline {
    image_channels: usize,
    image_hw: (usize, usize),
    base_width: usize,
    dropout_rate: f32,
    ensemble_width: usize,
    seed: u64,
    enc_convs: Vec<Conv2d>,
    enc_squeezes: Vec<Conv2d>,
    tap_channels: Vec<usize>,
    tap_hw: Vec<(usize, usize)>,
    decoder: Option<Decoder>,
}

impl SkipNetPipeline {
    pub fn new(
        image_channels: usize,
        image_hw: (usize, usize),
        hyp: &Hyperparameters,
    ) -> PureResult<Self> {
        hyp.validate()?;
        if image_channels == 0 {
            return Err(TensorError::InvalidValue {
                label: "image_channels",
            });
        }
        let w = hyp.base_channel_width;
        let mut rng = StdRng::seed_from_u64(hyp.seed);
        let conv0 = Conv2d::new(
            "encoder::stage0",
            image_channels,
            w,
            (3, 3),
            (1, 1),
            (1, 1),
            image_hw,
            &mut rng,
        )?;
        let hw0 = conv0.output_hw()?;
        let conv1 = Conv2d::new(
            "encoder::stage1",
            w,
            2 * w,
            (3, 3),
            (2, 2),
            (1, 1),
            hw0,
            &mut rng,
        )?;
        let hw1 = conv1.output_hw()?;
        let conv2 = Conv2d::new(
            "encoder::bottleneck",
            2 * w,
            4 * w,
            (3, 3),
            (2, 2),
            (1, 1),
            hw1,
            &mut rng,
        )?;
        let squeeze0 = Conv2d::new(
            "encoder::squeeze0",
            w,
            1,
            (1, 1),
            (1, 1),
            (0, 0),
            hw0,
            &mut rng,
        )?;
        let squeeze1 = Conv2d::new(
            "encoder::squeeze1",
            2 * w,
            1,
            (1, 1),
            (1, 1),
            (0, 0),
            hw1,
            &mut rng,
        )?;
        Ok(Self {
            image_channels,
            image_hw,
            base_width: w,
            dropout_rate: hyp.dropout_rate,
            ensemble_width: hyp.ensemble_width,
            seed: hyp.seed,
            enc_convs: vec![conv0, conv1, conv2],
            enc_squeezes: vec![squeeze0, squeeze1],
            tap_channels: vec![w, 2 * w],
            tap_hw: vec![hw0, hw1],
            decoder: None,
        })
    }

    fn check_images(&self, images: &Tensor) -> PureResult<()> {
        let expected = self.image_channels * self.image_hw.0 * self.image_hw.1;
        if images.shape().1 != expected {
            return Err(TensorError::ShapeMismatch {
                left: images.shape(),
                right: (images.shape().0, expected),
            });
        }
        Ok(())
    }

    fn decoder_ref(&self) -> PureResult<&Decoder> {
        self.decoder.as_ref().ok_or(TensorError::InvalidValue {
            label: "decoder_not_prepared",
        })
    }

    fn check_skips(&self, skips: &[Tensor], latents: &Tensor) -> PureResult<usize> {
        let decoder = self.decoder_ref()?;
        if skips.len() != TAPS {
            return Err(TensorError::InvalidValue { label: "skip_count" });
        }
        let batch = latents.shape().0;
        for (i, skip) in skips.iter().enumerate() {
            let expected = self.tap_channels[i] * self.tap_hw[i].0 * self.tap_hw[i].1;
            if skip.shape() != (batch, expected) {
                return Err(TensorError::ShapeMismatch {
                    left: skip.shape(),
                    right: (batch, expected),
                });
            }
        }
        let expected = decoder.latent_channels * decoder.latent_pixels;
        if latents.shape().1 != expected {
            return Err(TensorError::ShapeMismatch {
                left: latents.shape(),
                right: (batch, expected),
            });
        }
        Ok(batch)
    }

    fn run_encode(
        &self,
        images: &Tensor,
        gates: Option<&GateMaps>,
        discover: bool,
    ) -> PureResult<(Vec<Tensor>, Tensor, Vec<Tensor>)> {
        self.check_images(images)?;
        if let Some(gates) = gates {
            if gates.encoder.len() != TAPS {
                return Err(TensorError::InvalidValue {
                    label: "encoder_gate_count",
                });
            }
        }
        let mut x = images.clone();
        let mut skips = Vec::with_capacity(TAPS);
        let mut discovered = Vec::new();
        for i in 0..TAPS {
            x = Relu.forward(&self.enc_convs[i].forward(&x)?)?;
            if discover {
                discovered.push(gate_from(&self.enc_squeezes[i], &x)?);
            } else if let Some(gates) = gates {
                x = apply_gate(&x, &gates.encoder[i], self.tap_channels[i])?;
            }
            skips.push(x.clone());
        }
        let latents = Relu.forward(&self.enc_convs[TAPS].forward(&x)?)?;
        Ok((skips, latents, discovered))
    }

    fn run_decode(
        &self,
        skips: &[Tensor],
        latents: &Tensor,
        gates: Option<&GateMaps>,
        discover: bool,
    ) -> PureResult<(Tensor, DecodeTrace, Vec<Tensor>)> {
        let batch = self.check_skips(skips, latents)?;
        let decoder = self.decoder_ref()?;
        let dec_gates = match gates {
            Some(gates) => {
                if gates.decoder.len() != decoder.stages.len() + 2 {
                    return Err(TensorError::InvalidValue {
                        label: "decoder_gate_count",
                    });
                }
                Some(&gates.decoder)
            }
            None => None,
        };

        // A gated decode of a single example tiles to the ensemble width and
        // mean-reduces afterwards; a pure shape-compatibility device.
        let tile = if dec_gates.is_some() && batch == 1 && self.ensemble_width > 1 {
            self.ensemble_width
        } else {
            1
        };
        let owned_skips: Vec<Tensor>;
        let owned_latents: Tensor;
        let (skips_t, latents_t): (&[Tensor], &Tensor) = if tile > 1 {
            owned_skips = skips
                .iter()
                .map(|s| s.repeat_rows(tile))
                .collect::<PureResult<_>>()?;
            owned_latents = latents.repeat_rows(tile)?;
            (&owned_skips, &owned_latents)
        } else {
            (skips, latents)
        };

        let mut discovered = Vec::new();
        if discover {
            discovered.push(gate_from(&decoder.latent_squeeze, latents_t)?);
        }
        let mut running = match dec_gates {
            Some(g) => apply_gate(latents_t, &g[0], decoder.latent_channels)?,
            None => latents_t.clone(),
        };
        let mut stage_traces = Vec::with_capacity(decoder.stages.len());
        for (i, stage) in decoder.stages.iter().enumerate() {
            let skip = &skips_t[TAPS - 1 - i];
            let (mut out, trace) = stage.forward(skip, &running)?;
            if discover {
                discovered.push(gate_from(&stage.squeeze, &out)?);
            }
            if let Some(g) = dec_gates {
                out = apply_gate(&out, &g[i + 1], stage.out_channels)?;
            }
            stage_traces.push(trace);
            running = out;
        }
        let final_in = running;
        let mut features = decoder.final_conv.forward(&final_in)?;
        if discover {
            discovered.push(gate_from(&decoder.final_squeeze, &features)?);
        }
        if let Some(g) = dec_gates {
            features = apply_gate(&features, &g[decoder.stages.len() + 1], self.base_width)?;
        }
        if tile > 1 {
            features = features.mean_rows()?;
        }
        let trace = DecodeTrace {
            stage_traces,
            final_in,
            gates: dec_gates.map(|g| g.clone()),
            tiled: tile,
        };
        Ok((features, trace, discovered))
    }
}

impl FeaturePipeline for SkipNetPipeline {
    type Trace = DecodeTrace;

    fn prepare(&mut self, images: &Tensor) -> PureResult<()> {
        self.check_images(images)?;
        if self.decoder.is_some() {
            return Ok(());
        }
        // Discovery pass: observe the emitted shapes once, then lock them in.
        let (_skips, latents, _) = self.run_encode(images, None, false)?;
        let latent_hw = self.enc_convs[TAPS].output_hw()?;
        let latent_channels = self.enc_convs[TAPS].out_channels();
        let latent_pixels = latent_hw.0 * latent_hw.1;
        debug_assert_eq!(
            latents.shape().1,
            latent_channels * latent_pixels,
            "encoder emitted unexpected latent shape"
        );
        let w = self.base_width;
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(0x5eed));
        let mut stages = Vec::with_capacity(TAPS);
        let mut run_channels = latent_channels;
        let mut run_hw = latent_hw;
        for (i, tap) in (0..TAPS).rev().enumerate() {
            let skip_channels = self.tap_channels[tap];
            let skip_hw = self.tap_hw[tap];
            let out_channels = skip_channels;
            let pixels = skip_hw.0 * skip_hw.1;
            let name = format!("decoder::stage{i}");
            let stage = DecoderStage {
                resize: Bilinear2d::new(run_channels, run_hw, skip_hw)?,
                conv_a: Conv2d::new(
                    format!("{name}::conv_a"),
                    skip_channels + run_channels,
                    out_channels,
                    (3, 3),
                    (1, 1),
                    (1, 1),
                    skip_hw,
                    &mut rng,
                )?,
                dropout: Dropout::new(self.dropout_rate, self.seed.wrapping_add(i as u64))?,
                conv_b: Conv2d::new(
                    format!("{name}::conv_b"),
                    out_channels,
                    out_channels,
                    (3, 3),
                    (1, 1),
                    (1, 1),
                    skip_hw,
                    &mut rng,
                )?,
                squeeze: Conv2d::new(
                    format!("{name}::squeeze"),
                    out_channels,
                    1,
                    (1, 1),
                    (1, 1),
                    (0, 0),
                    skip_hw,
                    &mut rng,
                )?,
                skip_channels,
                run_channels,
                out_channels,
                pixels,
            };
            run_channels = out_channels;
            run_hw = skip_hw;
            stages.push(stage);
        }
        let decoder = Decoder {
            latent_squeeze: Conv2d::new(
                "decoder::latent_squeeze",
                latent_channels,
                1,
                (1, 1),
                (1, 1),
                (0, 0),
                latent_hw,
                &mut rng,
            )?,
            stages,
            final_conv: Conv2d::new(
                "decoder::final",
                run_channels,
                w,
                (3, 3),
                (1, 1),
                (1, 1),
                run_hw,
                &mut rng,
            )?,
            final_squeeze: Conv2d::new(
                "decoder::final_squeeze",
                w,
                1,
                (1, 1),
                (1, 1),
                (0, 0),
                run_hw,
                &mut rng,
            )?,
            latent_channels,
            latent_pixels,
        };
        self.decoder = Some(decoder);
        Ok(())
    }

    fn is_prepared(&self) -> bool {
        self.decoder.is_some()
    }

    fn encode(
        &self,
        images: &Tensor,
        gates: Option<&GateMaps>,
    ) -> PureResult<(Vec<Tensor>, Tensor)> {
        let (skips, latents, _) = self.run_encode(images, gates, false)?;
        Ok((skips, latents))
    }

    fn encode_discover(&self, images: &Tensor) -> PureResult<(Vec<Tensor>, Tensor, Vec<Tensor>)> {
        self.run_encode(images, None, true)
    }

    fn decode(
        &self,
        skips: &[Tensor],
        latents: &Tensor,
        gates: Option<&GateMaps>,
    ) -> PureResult<(Tensor, Self::Trace)> {
        let (features, trace, _) = self.run_decode(skips, latents, gates, false)?;
        Ok((features, trace))
    }

    fn decode_discover(
        &self,
        skips: &[Tensor],
        latents: &Tensor,
    ) -> PureResult<(Tensor, Self::Trace, Vec<Tensor>)> {
        self.run_decode(skips, latents, None, true)
    }

    fn decode_backward(
        &mut self,
        trace: DecodeTrace,
        grad_features: &Tensor,
        accumulate: bool,
    ) -> PureResult<Tensor> {
        let base_width = self.base_width;
        let decoder = self.decoder.as_mut().ok_or(TensorError::InvalidValue {
            label: "decoder_not_prepared",
        })?;
        if trace.stage_traces.len() != decoder.stages.len() {
            return Err(TensorError::InvalidValue {
                label: "decode_trace_stages",
            });
        }
        let mut grad = grad_features.clone();
        if trace.tiled > 1 {
            // Transpose of the mean reduction over the tiled copies.
            grad = grad.scale(1.0 / trace.tiled as f32)?.repeat_rows(trace.tiled)?;
        }
        let num_stages = decoder.stages.len();
        if let Some(gates) = &trace.gates {
            grad = apply_gate(&grad, &gates[num_stages + 1], base_width)?;
        }
        grad = decoder.final_conv.backward(&trace.final_in, &grad)?;
        let stage_traces = trace.stage_traces;
        for (i, (stage, stage_trace)) in decoder
            .stages
            .iter_mut()
            .zip(stage_traces.into_iter())
            .enumerate()
            .rev()
        {
            if let Some(gates) = &trace.gates {
                grad = apply_gate(&grad, &gates[i + 1], stage.out_channels)?;
            }
            grad = stage.backward(stage_trace, &grad)?;
        }
        if let Some(gates) = &trace.gates {
            grad = apply_gate(&grad, &gates[0], decoder.latent_channels)?;
        }
        if trace.tiled > 1 {
            grad = sum_rows(&grad)?;
        }
        if !accumulate {
            self.zero_decoder_gradients()?;
        }
        Ok(grad)
    }

    fn feature_channels(&self) -> usize {
        self.base_width
    }

    fn image_channels(&self) -> usize {
        self.image_channels
    }

    fn image_hw(&self) -> (usize, usize) {
        self.image_hw
    }

    fn visit_decoder_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        let decoder = self.decoder_ref()?;
        decoder.latent_squeeze.visit_parameters(visitor)?;
        for stage in &decoder.stages {
            stage.visit(visitor)?;
        }
        decoder.final_conv.visit_parameters(visitor)?;
        decoder.final_squeeze.visit_parameters(visitor)
    }

    fn visit_decoder_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        let decoder = self.decoder.as_mut().ok_or(TensorError::InvalidValue {
            label: "decoder_not_prepared",
        })?;
        decoder.latent_squeeze.visit_parameters_mut(visitor)?;
        for stage in &mut decoder.stages {
            stage.visit_mut(visitor)?;
        }
        decoder.final_conv.visit_parameters_mut(visitor)?;
        decoder.final_squeeze.visit_parameters_mut(visitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::FeaturePipeline;

    fn hyp() -> Hyperparameters {
        Hyperparameters {
            base_channel_width: 2,
            dropout_rate: 0.0,
            seed: 9,
            ..Hyperparameters::default()
        }
    }

    fn pipeline() -> SkipNetPipeline {
        let mut p = SkipNetPipeline::new(1, (4, 4), &hyp()).unwrap();
        let images = Tensor::from_fn(2, 16, |r, c| (r * 16 + c) as f32 * 0.05).unwrap();
        p.prepare(&images).unwrap();
        p
    }

    #[test]
    fn encode_emits_locked_shapes() {
        let p = pipeline();
        let images = Tensor::from_fn(3, 16, |_r, c| c as f32 * 0.1).unwrap();
        let (skips, latents) = p.encode(&images, None).unwrap();
        assert_eq!(skips.len(), 2);
        assert_eq!(skips[0].shape(), (3, 2 * 16));
        assert_eq!(skips[1].shape(), (3, 4 * 4));
        assert_eq!(latents.shape(), (3, 8 * 1));
    }

    #[test]
    fn prepare_is_idempotent() {
        let mut p = pipeline();
        let state_before = p.decoder_state_dict().unwrap();
        let images = Tensor::zeros(1, 16).unwrap();
        p.prepare(&images).unwrap();
        assert_eq!(p.decoder_state_dict().unwrap(), state_before);
    }

    #[test]
    fn decode_rejects_drifted_shapes() {
        let p = pipeline();
        let images = Tensor::from_fn(1, 16, |_r, c| c as f32 * 0.1).unwrap();
        let (mut skips, latents) = p.encode(&images, None).unwrap();
        skips[0] = Tensor::zeros(1, 5).unwrap();
        assert!(p.decode(&skips, &latents, None).is_err());
    }

    #[test]
    fn decode_backward_matches_finite_differences_on_latents() {
        let mut p = pipeline();
        let images = Tensor::from_fn(1, 16, |_r, c| (c as f32 * 0.07).sin()).unwrap();
        let (skips, latents) = p.encode(&images, None).unwrap();
        let (features, trace) = p.decode(&skips, &latents, None).unwrap();
        // Loss = sum(features).
        let ones = Tensor::from_fn(features.shape().0, features.shape().1, |_r, _c| 1.0).unwrap();
        let grad_latents = p.decode_backward(trace, &ones, false).unwrap();
        let base: f32 = features.data().iter().sum();
        let eps = 1e-2;
        for idx in [0usize, 3, 7] {
            let mut bumped = latents.clone();
            bumped.data_mut()[idx] += eps;
            let (bumped_features, _trace) = p.decode(&skips, &bumped, None).unwrap();
            let numeric = (bumped_features.data().iter().sum::<f32>() - base) / eps;
            assert!(
                (numeric - grad_latents.data()[idx]).abs() < 0.05,
                "idx {idx}: numeric {numeric} vs analytic {}",
                grad_latents.data()[idx]
            );
        }
    }

    #[test]
    fn discovery_gates_stay_in_unit_interval() {
        let p = pipeline();
        let images = Tensor::from_fn(2, 16, |r, c| ((r + c) as f32).cos()).unwrap();
        let (skips, latents, enc_gates) = p.encode_discover(&images).unwrap();
        let (_features, _trace, dec_gates) = p.decode_discover(&skips, &latents).unwrap();
        assert_eq!(enc_gates.len(), 2);
        assert_eq!(dec_gates.len(), 4);
        for gate in enc_gates.iter().chain(dec_gates.iter()) {
            assert_eq!(gate.shape().0, 1);
            assert!(gate.data().iter().all(|v| (0.0..=1.0).contains(v)));
        }
    }

    #[test]
    fn gated_single_example_decode_matches_untiled() {
        // ensemble_width 1 vs 5 must agree exactly: tiling is a pure
        // shape-compatibility device and must not alter the mathematics.
        let images = Tensor::from_fn(1, 16, |_r, c| (c as f32 * 0.11).sin()).unwrap();
        let build = |ensemble_width: usize| {
            let mut h = hyp();
            h.ensemble_width = ensemble_width;
            let mut p = SkipNetPipeline::new(1, (4, 4), &h).unwrap();
            p.prepare(&images).unwrap();
            p
        };
        let p1 = build(1);
        let p5 = build(5);
        let (skips, latents, enc_gates) = p1.encode_discover(&images).unwrap();
        let (_f, _t, dec_gates) = p1.decode_discover(&skips, &latents).unwrap();
        let gates = GateMaps {
            encoder: enc_gates,
            decoder: dec_gates,
        };
        let (f1, _t1) = p1.decode(&skips, &latents, Some(&gates)).unwrap();
        let (f5, _t5) = p5.decode(&skips, &latents, Some(&gates)).unwrap();
        assert_eq!(f1.shape(), f5.shape());
        for (a, b) in f1.data().iter().zip(f5.data().iter()) {
            assert!((a - b).abs() < 1e-5, "{a} vs {b}");
        }
    }

    #[test]
    fn gated_tiling_gradient_matches_untiled() {
        let images = Tensor::from_fn(1, 16, |_r, c| (c as f32 * 0.13).cos()).unwrap();
        let build = |ensemble_width: usize| {
            let mut h = hyp();
            h.ensemble_width = ensemble_width;
            let mut p = SkipNetPipeline::new(1, (4, 4), &h).unwrap();
            p.prepare(&images).unwrap();
            p
        };
        let mut p1 = build(1);
        let mut p5 = build(5);
        let (skips, latents, enc_gates) = p1.encode_discover(&images).unwrap();
        let (_f, _t, dec_gates) = p1.decode_discover(&skips, &latents).unwrap();
        let gates = GateMaps {
            encoder: enc_gates,
            decoder: dec_gates,
        };
        let (f1, t1) = p1.decode(&skips, &latents, Some(&gates)).unwrap();
        let (_f5, t5) = p5.decode(&skips, &latents, Some(&gates)).unwrap();
        let ones = Tensor::from_fn(f1.shape().0, f1.shape().1, |_r, _c| 1.0).unwrap();
        let g1 = p1.decode_backward(t1, &ones, false).unwrap();
        let g5 = p5.decode_backward(t5, &ones, false).unwrap();
        assert_eq!(g1.shape(), g5.shape());
        for (a, b) in g1.data().iter().zip(g5.data().iter()) {
            assert!((a - b).abs() < 1e-4, "{a} vs {b}");
        }
    }
}
