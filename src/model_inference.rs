use std::sync::Arc;

use tracing::debug;

use crate::error::{SliderError, SliderResult};
use crate::raster::DecodedImage;
use crate::recognizer::{GapBox, GapRecognizer};
use crate::resolver::Detect;

/// Hands both images to a [`GapRecognizer`] and reports the left edge of the
/// box it returns.
#[derive(Clone)]
pub struct ModelInferenceDetector {
    recognizer: Arc<dyn GapRecognizer>,
}

impl ModelInferenceDetector {
    pub fn new(recognizer: Arc<dyn GapRecognizer>) -> Self {
        Self { recognizer }
    }

    pub fn recognizer(&self) -> &Arc<dyn GapRecognizer> {
        &self.recognizer
    }

    pub fn locate(&self, background: &DecodedImage, slider: &DecodedImage) -> SliderResult<GapBox> {
        let bg_bytes = background.encode_png()?;
        let slider_bytes = slider.encode_png()?;

        let found = self
            .recognizer
            .infer(&bg_bytes, &slider_bytes)
            .map_err(|e| SliderError::Inference(format!("{e:#}")))?;
        debug!(?found, "gap model box");

        if found.width == 0 || found.height == 0 {
            return Err(SliderError::Inference(format!("empty box {found:?}")));
        }
        if found.x >= background.width() || found.y >= background.height() {
            return Err(SliderError::Inference(format!(
                "box {found:?} lies outside the {}x{} background",
                background.width(),
                background.height()
            )));
        }
        Ok(found)
    }
}

impl Detect for ModelInferenceDetector {
    fn detect(&self, background: &DecodedImage, slider: &DecodedImage) -> SliderResult<u32> {
        self.locate(background, slider).map(|b| b.x)
    }
}
