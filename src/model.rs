use std::sync::Arc;

use infer_bus::backend::{InferRequest, ModelOutput, Target, Tensor};
use infer_bus::error::BackendError;
use infer_bus::local_backend::ModelFn;

/// Luma level above which a pixel counts as part of the bright spot.
const BRIGHT_LEVEL: u8 = 200;

/// Toy detector: one `[label, score, x, y, w, h]` row around the bright
/// pixels of the luma plane, or no rows when there are none.
pub fn bright_spot_detector() -> ModelFn {
    Arc::new(|request: &InferRequest, target: &Target| -> Result<ModelOutput, BackendError> {
        let input = request
            .input
            .as_ref()
            .ok_or_else(|| BackendError::Inference("request has no video input".to_string()))?;
        let luma = input
            .planes
            .first()
            .ok_or_else(|| BackendError::Inference("video input has no planes".to_string()))?;
        let (w, h, stride) = (input.width as usize, input.height as usize, luma.stride as usize);
        let (x0, y0, x1, y1) = match target.roi {
            Some(roi) => (
                (roi.x * w as f32) as usize,
                (roi.y * h as f32) as usize,
                ((roi.x + roi.w) * w as f32).ceil() as usize,
                ((roi.y + roi.h) * h as f32).ceil() as usize,
            ),
            None => (0, 0, w, h),
        };

        let found = luma.buffer.with_host(|bytes| {
            let mut bounds: Option<(usize, usize, usize, usize)> = None;
            for y in y0..y1.min(h) {
                for x in x0..x1.min(w) {
                    if bytes.get(y * stride + x).is_some_and(|&v| v > BRIGHT_LEVEL) {
                        bounds = Some(match bounds {
                            None => (x, y, x, y),
                            Some((l, t, r, b)) => (l.min(x), t.min(y), r.max(x), b.max(y)),
                        });
                    }
                }
            }
            bounds
        });

        let values = match found {
            Some((l, t, r, b)) => vec![
                0.0,
                0.9,
                l as f32 / w as f32,
                t as f32 / h as f32,
                (r + 1 - l) as f32 / w as f32,
                (b + 1 - t) as f32 / h as f32,
            ],
            None => Vec::new(),
        };
        Ok(ModelOutput {
            tensors: vec![Tensor::from_f32(vec![values.len() / 6, 6], &values)],
        })
    })
}
