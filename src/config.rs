use std::time::Duration;

pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_IMAGE_BYTES: u64 = 10 * 1024 * 1024;
pub const RECOMMENDED_BG_WIDTH: u32 = 340;
pub const RECOMMENDED_SLIDER_WIDTH: u32 = 68;

/// Tuning for the edge-match detector.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct EdgeMatchParams {
    pub canny_low: f32,
    pub canny_high: f32,
    /// Pixels zeroed around the slider's edge map so its frame never matches.
    pub template_margin: u32,
    /// Best correlation below this is reported as ambiguous.
    pub min_score: f32,
    /// Smallest width or height either image may have.
    pub min_side: u32,
}

impl Default for EdgeMatchParams {
    fn default() -> Self {
        Self {
            canny_low: 100.0,
            canny_high: 200.0,
            template_margin: 2,
            min_score: 0.1,
            min_side: 8,
        }
    }
}

/// Process-wide settings handed to the resolver once at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolverConfig {
    pub default_bg_width: Option<u32>,
    pub default_slider_width: Option<u32>,
    pub fetch_timeout: Duration,
    pub max_image_bytes: u64,
    /// Paint fully transparent pixels white before dropping alpha.
    pub png_fix: bool,
    pub edge_match: EdgeMatchParams,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            default_bg_width: None,
            default_slider_width: None,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            max_image_bytes: DEFAULT_MAX_IMAGE_BYTES,
            png_fix: false,
            edge_match: EdgeMatchParams::default(),
        }
    }
}
