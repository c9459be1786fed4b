//! Gap localisation by edge-template correlation.
//!
//! Both images go to grey, then through canny so that the notch outline in the
//! background and the piece silhouette in the slider look alike regardless of
//! texture. The slider's edge map (minus a thin frame) is slid over the
//! background's edge map with normalized cross-correlation; the best window's
//! left edge is the raw x.
//!
//! Ties resolve to the smallest x, then the smallest y. Windows whose score is
//! not finite (no edges at all under them) never win. A best score under
//! [`EdgeMatchParams::min_score`] is reported as [`SliderError::DetectionAmbiguous`].

use image::{GrayImage, ImageBuffer, Luma};
use imageproc::template_matching::{match_template, MatchTemplateMethod};
use tracing::debug;

use crate::config::EdgeMatchParams;
use crate::error::{SliderError, SliderResult};
use crate::raster::DecodedImage;
use crate::resolver::Detect;

/// Where the slider template fits best, in background pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EdgeMatch {
    pub x: u32,
    pub y: u32,
    pub score: f32,
}

#[derive(Debug, Clone, Default)]
pub struct EdgeMatchDetector {
    params: EdgeMatchParams,
}

impl EdgeMatchDetector {
    pub fn new(params: EdgeMatchParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &EdgeMatchParams {
        &self.params
    }

    pub fn locate(&self, background: &DecodedImage, slider: &DecodedImage) -> SliderResult<EdgeMatch> {
        self.check_dimensions(background, slider)?;

        let bg_edges = edge_map(&background.to_luma8(), &self.params);
        let mut template = edge_map(&slider.to_luma8(), &self.params);
        erase_margin(&mut template, self.params.template_margin);

        if template.pixels().all(|p| p[0] == 0) {
            return Err(SliderError::DetectionAmbiguous { score: 0.0, floor: self.params.min_score });
        }

        let scores = match_template(&bg_edges, &template, MatchTemplateMethod::CrossCorrelationNormalized);
        let found = best_match(&scores).ok_or(SliderError::DetectionAmbiguous {
            score: 0.0,
            floor: self.params.min_score,
        })?;
        debug!(x = found.x, y = found.y, score = found.score, "edge match");

        if found.score < self.params.min_score {
            return Err(SliderError::DetectionAmbiguous { score: found.score, floor: self.params.min_score });
        }
        Ok(found)
    }

    fn check_dimensions(&self, background: &DecodedImage, slider: &DecodedImage) -> SliderResult<()> {
        let min = self.params.min_side;
        for (name, image) in [("background", background), ("slider", slider)] {
            let (w, h) = image.dimensions();
            if w < min || h < min {
                return Err(SliderError::ImageTooSmall(format!(
                    "{name} is {w}x{h}, edge filtering needs at least {min}x{min}"
                )));
            }
        }
        let (bw, bh) = background.dimensions();
        let (sw, sh) = slider.dimensions();
        if sw > bw || sh > bh {
            return Err(SliderError::ImageTooSmall(format!(
                "background {bw}x{bh} cannot contain slider {sw}x{sh}"
            )));
        }
        Ok(())
    }
}

impl Detect for EdgeMatchDetector {
    fn detect(&self, background: &DecodedImage, slider: &DecodedImage) -> SliderResult<u32> {
        self.locate(background, slider).map(|m| m.x)
    }
}

fn edge_map(gray: &GrayImage, params: &EdgeMatchParams) -> GrayImage {
    imageproc::edges::canny(gray, params.canny_low, params.canny_high)
}

/// Zeroes a `margin`-wide frame around `edges`.
fn erase_margin(edges: &mut GrayImage, margin: u32) {
    if margin == 0 {
        return;
    }
    let (width, height) = edges.dimensions();
    for (x, y, p) in edges.enumerate_pixels_mut() {
        if x < margin || y < margin || x + margin >= width || y + margin >= height {
            p[0] = 0;
        }
    }
}

/// Column-major scan so that equal scores keep the leftmost window.
fn best_match(scores: &ImageBuffer<Luma<f32>, Vec<f32>>) -> Option<EdgeMatch> {
    let (width, height) = scores.dimensions();
    let mut best: Option<EdgeMatch> = None;
    for x in 0..width {
        for y in 0..height {
            let score = scores.get_pixel(x, y)[0];
            if !score.is_finite() {
                continue;
            }
            if best.map_or(true, |b| score > b.score) {
                best = Some(EdgeMatch { x, y, score });
            }
        }
    }
    best
}
