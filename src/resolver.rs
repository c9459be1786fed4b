//! Load → Normalize → Detect → Rescale → Correct.
//!
//! Any stage failure ends the request with that stage's error; nothing partial
//! is returned.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::config::{EdgeMatchParams, ResolverConfig};
use crate::edge_match::EdgeMatchDetector;
use crate::error::{SliderError, SliderResult};
use crate::loader::{ImageLoader, ImageReference};
use crate::model_inference::ModelInferenceDetector;
use crate::raster::{normalize, DecodedImage};
use crate::recognizer::{GapRecognizer, SlideMatchRecognizer};

/// Shared contract of both gap detectors: the raw x of the gap in the
/// coordinate space of the background actually passed in.
pub trait Detect: Send + Sync {
    fn detect(&self, background: &DecodedImage, slider: &DecodedImage) -> SliderResult<u32>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    EdgeMatch,
    ModelInference,
}

impl DetectionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionMethod::EdgeMatch => "edge_match",
            DetectionMethod::ModelInference => "model_inference",
        }
    }
}

impl std::fmt::Display for DetectionMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DetectionMethod {
    type Err = String;

    /// Also accepts the legacy wire names `opencv` and `ocr`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "opencv" | "edge_match" | "edge-match" | "edge" => Ok(DetectionMethod::EdgeMatch),
            "ocr" | "model" | "model_inference" | "model-inference" => Ok(DetectionMethod::ModelInference),
            other => Err(format!("unknown detection method: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SliderCalcRequest {
    pub background: String,
    pub slider: String,
    pub method: DetectionMethod,
    /// Subtracted from the rescaled distance; any sign.
    pub offset: i64,
    pub bg_width: Option<i64>,
    pub slider_width: Option<i64>,
    /// Overrides the configured fetch timeout.
    pub timeout: Option<Duration>,
}

impl SliderCalcRequest {
    pub fn new(background: impl Into<String>, slider: impl Into<String>, method: DetectionMethod) -> Self {
        Self {
            background: background.into(),
            slider: slider.into(),
            method,
            offset: 0,
            bg_width: None,
            slider_width: None,
            timeout: None,
        }
    }

    pub fn with_offset(mut self, offset: i64) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_widths(mut self, bg_width: Option<i64>, slider_width: Option<i64>) -> Self {
        self.bg_width = bg_width;
        self.slider_width = slider_width;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Every intermediate number of one resolution, for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Resolution {
    pub raw_x: u32,
    pub bg_scale: f64,
    pub original_x: i64,
    pub distance: i64,
}

/// Maps a raw x from normalized background space back to the original.
pub fn rescale(raw_x: u32, bg_scale: f64) -> i64 {
    (f64::from(raw_x) / bg_scale).round() as i64
}

/// No clamping: out-of-range results are surfaced as computed.
pub fn correct(original_x: i64, offset: i64) -> i64 {
    original_x.saturating_sub(offset)
}

/// The CPU half of a resolution: normalize both images, detect, rescale, correct.
pub fn resolve_images(
    detector: &dyn Detect,
    background: DecodedImage,
    slider: DecodedImage,
    bg_width: Option<i64>,
    slider_width: Option<i64>,
    offset: i64,
) -> SliderResult<Resolution> {
    let bg = normalize(background, bg_width)?;
    let slider = normalize(slider, slider_width)?;

    let raw_x = detector.detect(&bg.image, &slider.image)?;
    let original_x = rescale(raw_x, bg.scale);
    let distance = correct(original_x, offset);
    Ok(Resolution { raw_x, bg_scale: bg.scale, original_x, distance })
}

fn check_width(width: Option<i64>) -> SliderResult<()> {
    match width {
        Some(w) if w <= 0 => Err(SliderError::InvalidDimension(w)),
        _ => Ok(()),
    }
}

pub struct Resolver {
    config: ResolverConfig,
    loader: ImageLoader,
    edge: Arc<EdgeMatchDetector>,
    model: Arc<ModelInferenceDetector>,
}

impl Resolver {
    pub fn new(config: ResolverConfig) -> SliderResult<Self> {
        let loader = ImageLoader::new(&config)?;
        let edge = Arc::new(EdgeMatchDetector::new(config.edge_match));
        let model = Arc::new(ModelInferenceDetector::new(Arc::new(SlideMatchRecognizer::default())));
        Ok(Self { config, loader, edge, model })
    }

    /// Replaces the built-in [`SlideMatchRecognizer`] behind
    /// [`DetectionMethod::ModelInference`].
    pub fn with_recognizer(mut self, recognizer: Arc<dyn GapRecognizer>) -> Self {
        self.model = Arc::new(ModelInferenceDetector::new(recognizer));
        self
    }

    pub fn edge_params(&self) -> &EdgeMatchParams {
        self.edge.params()
    }

    pub fn recognizer_name(&self) -> &'static str {
        self.model.recognizer().name()
    }

    pub fn model_fingerprint(&self) -> Option<String> {
        self.model.recognizer().fingerprint()
    }

    pub fn detector(&self, method: DetectionMethod) -> Arc<dyn Detect> {
        match method {
            DetectionMethod::EdgeMatch => self.edge.clone() as Arc<dyn Detect>,
            DetectionMethod::ModelInference => self.model.clone() as Arc<dyn Detect>,
        }
    }

    pub async fn resolve(&self, request: &SliderCalcRequest) -> SliderResult<i64> {
        self.resolve_detailed(request).await.map(|r| r.distance)
    }

    pub async fn resolve_detailed(&self, request: &SliderCalcRequest) -> SliderResult<Resolution> {
        let bg_width = request.bg_width.or(self.config.default_bg_width.map(i64::from));
        let slider_width = request.slider_width.or(self.config.default_slider_width.map(i64::from));
        check_width(bg_width)?;
        check_width(slider_width)?;
        let detector = self.detector(request.method);

        let timeout = request.timeout.unwrap_or(self.config.fetch_timeout);
        let bg_ref = ImageReference::parse(&request.background);
        let slider_ref = ImageReference::parse(&request.slider);
        info!(
            method = %request.method,
            background = bg_ref.kind(),
            slider = slider_ref.kind(),
            offset = request.offset,
            "resolving slider distance"
        );

        let (background, slider) = tokio::try_join!(
            self.loader.load(&bg_ref, timeout),
            self.loader.load(&slider_ref, timeout)
        )?;

        let offset = request.offset;
        let resolution = tokio::task::spawn_blocking(move || {
            resolve_images(detector.as_ref(), background, slider, bg_width, slider_width, offset)
        })
        .await
        .map_err(|e| SliderError::Internal(format!("detection task failed: {e}")))??;

        info!(
            raw_x = resolution.raw_x,
            scale = resolution.bg_scale,
            original_x = resolution.original_x,
            offset,
            distance = resolution.distance,
            "slider distance resolved"
        );
        Ok(resolution)
    }
}
