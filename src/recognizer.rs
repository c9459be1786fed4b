use std::path::Path;
use std::sync::Mutex;

use anyhow::Context;
use image::GenericImageView;
use ort::session::Session;
use tracing::{debug, info};

/// Gap bounding box in background pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct GapBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// A pretrained capability that points at the gap.
///
/// Implementations are shared by every concurrent request and must serialise
/// internally if the underlying engine is not reentrant.
pub trait GapRecognizer: Send + Sync {
    fn infer(&self, background: &[u8], slider: &[u8]) -> anyhow::Result<GapBox>;

    /// Backend name for status reporting.
    fn name(&self) -> &'static str;

    /// Short identifier of the loaded weights, for status reporting.
    fn fingerprint(&self) -> Option<String> {
        None
    }
}

/// Built-in recogniser: canny edges of the whole slider correlated against the
/// background's, with the best window's box as the answer. Needs no model file.
///
/// With `crop_to_opaque` set the slider is first cut down to the bounding box
/// of its non-transparent pixels.
#[derive(Debug, Clone, Copy, Default)]
pub struct SlideMatchRecognizer {
    crop_to_opaque: bool,
}

impl SlideMatchRecognizer {
    pub fn new(crop_to_opaque: bool) -> Self {
        Self { crop_to_opaque }
    }
}

impl GapRecognizer for SlideMatchRecognizer {
    fn infer(&self, background: &[u8], slider: &[u8]) -> anyhow::Result<GapBox> {
        let bg = image::load_from_memory(background).context("decoding background")?;
        let target = image::load_from_memory(slider).context("decoding slider")?.to_rgba8();
        anyhow::ensure!(
            bg.width() >= target.width() && bg.height() >= target.height(),
            "background {}x{} is smaller than slider {}x{}",
            bg.width(),
            bg.height(),
            target.width(),
            target.height()
        );

        let target = if self.crop_to_opaque {
            crop_to_opaque(target)
        } else {
            target
        };

        let t_edge = imageproc::edges::canny(&image::imageops::grayscale(&target), 100.0, 200.0);
        anyhow::ensure!(t_edge.pixels().any(|p| p[0] > 0), "slider has no edges to match");
        let b_edge = imageproc::edges::canny(&bg.to_luma8(), 100.0, 200.0);
        let scores = imageproc::template_matching::match_template(
            &b_edge,
            &t_edge,
            imageproc::template_matching::MatchTemplateMethod::CrossCorrelationNormalized,
        );
        let extremes = imageproc::template_matching::find_extremes(&scores);
        // NaN compares false, so windows with no edge energy land here too.
        anyhow::ensure!(extremes.max_value > 0.0, "slider and background share no edges");

        let (x, y) = extremes.max_value_location;
        debug!(x, y, score = extremes.max_value, "slide match");
        Ok(GapBox { x, y, width: t_edge.width(), height: t_edge.height() })
    }

    fn name(&self) -> &'static str {
        "slide_match"
    }
}

/// Smallest box holding every pixel with non-zero alpha; fully transparent
/// images come back unchanged.
fn crop_to_opaque(target: image::RgbaImage) -> image::RgbaImage {
    let (w, h) = target.dimensions();
    let (mut min_x, mut min_y, mut max_x, mut max_y) = (w, h, 0, 0);
    for (x, y, p) in target.enumerate_pixels() {
        if p[3] != 0 {
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
        }
    }
    if min_x > max_x {
        return target;
    }
    image::imageops::crop_imm(&target, min_x, min_y, max_x - min_x + 1, max_y - min_y + 1).to_image()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct ScoredBox {
    pub score: f32,
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl ScoredBox {
    fn area(&self) -> f32 {
        (self.x2 - self.x1 + 1.0) * (self.y2 - self.y1 + 1.0)
    }

    fn iou(&self, other: &ScoredBox) -> f32 {
        let w = (self.x2.min(other.x2) - self.x1.max(other.x1) + 1.0).max(0.0);
        let h = (self.y2.min(other.y2) - self.y1.max(other.y1) + 1.0).max(0.0);
        let inter = w * h;
        inter / (self.area() + other.area() - inter)
    }
}

const NMS_THR: f32 = 0.45;
const SCORE_THR: f32 = 0.1;
const MODEL_WIDTH: u32 = 416;
const MODEL_HEIGHT: u32 = 416;
const STRIDES: [u32; 3] = [8, 16, 32];
const PAD_VALUE: u8 = 114;

lazy_static::lazy_static! {
    /// `(grid_x, grid_y, stride)` for every anchor the model emits, in output order.
    static ref ANCHORS: Vec<(u32, u32, u32)> = {
        let mut anchors = Vec::new();
        for stride in STRIDES {
            let (hsize, wsize) = (MODEL_HEIGHT / stride, MODEL_WIDTH / stride);
            for gy in 0..hsize {
                for gx in 0..wsize {
                    anchors.push((gx, gy, stride));
                }
            }
        }
        anchors
    };
}

/// YOLOX-style ONNX detector run over the background; an optional override of
/// [`SlideMatchRecognizer`] for deployments that ship trained gap weights.
pub struct OnnxGapRecognizer {
    session: Mutex<Session>,
    digest: String,
}

impl OnnxGapRecognizer {
    pub fn from_memory<MODEL>(model: MODEL) -> anyhow::Result<Self>
    where
        MODEL: AsRef<[u8]>,
    {
        let digest = sha256::digest(model.as_ref());
        let session = Session::builder()?.commit_from_memory(model.as_ref())?;
        Ok(Self { session: Mutex::new(session), digest })
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let model = std::fs::read(path).with_context(|| format!("reading gap model {}", path.display()))?;
        let recognizer = Self::from_memory(model)?;
        info!(path = %path.display(), digest = %recognizer.digest, "gap model loaded");
        Ok(recognizer)
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Every box above the score threshold after NMS, best first, in image pixels.
    pub(crate) fn detect_boxes(&self, image: &[u8]) -> anyhow::Result<Vec<ScoredBox>> {
        let original = image::load_from_memory(image).context("decoding background for inference")?;
        let (orig_w, orig_h) = original.dimensions();
        let gain = letterbox_gain(orig_w, orig_h);
        let resize_w = ((orig_w as f32 * gain) as u32).max(1);
        let resize_h = ((orig_h as f32 * gain) as u32).max(1);

        let resized = original
            .resize_exact(resize_w, resize_h, image::imageops::FilterType::Triangle)
            .to_rgb8();
        let mut canvas = image::RgbImage::from_pixel(MODEL_WIDTH, MODEL_HEIGHT, image::Rgb([PAD_VALUE; 3]));
        image::imageops::overlay(&mut canvas, &resized, 0, 0);

        let mut input = ndarray::Array4::<f32>::zeros((1, 3, MODEL_HEIGHT as usize, MODEL_WIDTH as usize));
        for (x, y, p) in canvas.enumerate_pixels() {
            for c in 0..3 {
                input[[0, c, y as usize, x as usize]] = p[c] as f32;
            }
        }

        let shape = input.shape().to_vec();
        let data = input.into_raw_vec_and_offset().0;
        let input_value = ort::value::Value::from_array((shape, data))?;
        let mut session = self
            .session
            .lock()
            .map_err(|_| anyhow::anyhow!("gap model session lock poisoned"))?;
        let outputs = session.run(ort::inputs![input_value])?;
        let (shape, data) = outputs[0].try_extract_tensor::<f32>()?;
        let shape: Vec<usize> = shape.iter().map(|&v| v as usize).collect();
        let output = ndarray::ArrayView::from_shape(shape, data)?;
        anyhow::ensure!(output.ndim() == 3 && output.shape()[2] >= 6, "unexpected model output shape {:?}", output.shape());

        let rows = output.shape()[1].min(ANCHORS.len());
        let mut boxes = Vec::new();
        for i in 0..rows {
            let score = output[[0, i, 4]] * output[[0, i, 5]];
            if score < SCORE_THR {
                continue;
            }
            let (gx, gy, stride) = ANCHORS[i];
            let stride = stride as f32;
            let cx = (output[[0, i, 0]] + gx as f32) * stride;
            let cy = (output[[0, i, 1]] + gy as f32) * stride;
            let w = output[[0, i, 2]].exp() * stride;
            let h = output[[0, i, 3]].exp() * stride;
            boxes.push(ScoredBox {
                score,
                x1: ((cx - w / 2.0) / gain).clamp(0.0, orig_w as f32 - 1.0),
                y1: ((cy - h / 2.0) / gain).clamp(0.0, orig_h as f32 - 1.0),
                x2: ((cx + w / 2.0) / gain).clamp(0.0, orig_w as f32 - 1.0),
                y2: ((cy + h / 2.0) / gain).clamp(0.0, orig_h as f32 - 1.0),
            });
        }

        let kept = non_max_suppression(boxes, NMS_THR);
        debug!(candidates = kept.len(), "gap model boxes");
        Ok(kept)
    }
}

impl GapRecognizer for OnnxGapRecognizer {
    fn infer(&self, background: &[u8], slider: &[u8]) -> anyhow::Result<GapBox> {
        let slider_width = image::load_from_memory(slider).context("decoding slider for inference")?.width();
        let boxes = self.detect_boxes(background)?;
        let chosen = select_gap(&boxes, slider_width).context("model found no gap")?;
        Ok(to_gap_box(&chosen))
    }

    fn name(&self) -> &'static str {
        "onnx"
    }

    fn fingerprint(&self) -> Option<String> {
        Some(self.digest.clone())
    }
}

fn letterbox_gain(width: u32, height: u32) -> f32 {
    let x_scale = MODEL_WIDTH as f32 / width as f32;
    let y_scale = MODEL_HEIGHT as f32 / height as f32;
    x_scale.min(y_scale)
}

pub(crate) fn non_max_suppression(mut boxes: Vec<ScoredBox>, iou_threshold: f32) -> Vec<ScoredBox> {
    boxes.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut kept: Vec<ScoredBox> = Vec::new();
    for candidate in boxes {
        if kept.iter().all(|k| k.iou(&candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}

/// Best-scoring box about as wide as the slider (0.5x to 1.5x); failing that,
/// the best-scoring box. `boxes` must already be sorted by score.
pub(crate) fn select_gap(boxes: &[ScoredBox], slider_width: u32) -> Option<ScoredBox> {
    let lo = slider_width as f32 * 0.5;
    let hi = slider_width as f32 * 1.5;
    boxes
        .iter()
        .find(|b| {
            let w = b.x2 - b.x1 + 1.0;
            w >= lo && w <= hi
        })
        .or_else(|| boxes.first())
        .copied()
}

fn to_gap_box(b: &ScoredBox) -> GapBox {
    GapBox {
        x: b.x1.max(0.0) as u32,
        y: b.y1.max(0.0) as u32,
        width: (b.x2 - b.x1 + 1.0).max(0.0) as u32,
        height: (b.y2 - b.y1 + 1.0).max(0.0) as u32,
    }
}
