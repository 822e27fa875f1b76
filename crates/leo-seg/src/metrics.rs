use leo_tensor::{PureResult, Tensor, TensorError};

/// Mean intersection-over-union of the argmax prediction against the target
/// foreground, averaged over the batch.
///
/// Degenerate examples (prediction and target both empty, union = 0) are
/// excluded from the mean; a batch with only degenerate examples reports 0.0.
pub fn mean_iou(logits: &Tensor, masks: &Tensor) -> PureResult<f32> {
    let (batch, cols) = logits.shape();
    let (mask_batch, pixels) = masks.shape();
    if batch != mask_batch || pixels == 0 || cols % pixels != 0 {
        return Err(TensorError::ShapeMismatch {
            left: logits.shape(),
            right: masks.shape(),
        });
    }
    let classes = cols / pixels;
    if classes < 2 {
        return Err(TensorError::InvalidValue {
            label: "iou_classes",
        });
    }
    let logits_data = logits.data();
    let mask_data = masks.data();
    let mut sum = 0.0f32;
    let mut counted = 0usize;
    for b in 0..batch {
        let mut intersection = 0usize;
        let mut union = 0usize;
        for px in 0..pixels {
            let mut best_class = 0usize;
            let mut best = logits_data[b * cols + px];
            for c in 1..classes {
                let value = logits_data[b * cols + c * pixels + px];
                if value > best {
                    best = value;
                    best_class = c;
                }
            }
            let predicted = best_class != 0;
            let target = mask_data[b * pixels + px] != 0.0;
            if predicted && target {
                intersection += 1;
            }
            if predicted || target {
                union += 1;
            }
        }
        if union > 0 {
            sum += intersection as f32 / union as f32;
            counted += 1;
        }
    }
    if counted == 0 {
        return Ok(0.0);
    }
    Ok(sum / counted as f32)
}
