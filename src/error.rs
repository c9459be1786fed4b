use std::time::Duration;

/// Every way a distance calculation can fail.
///
/// All variants are terminal for the request that produced them; nothing in the
/// crate substitutes a default distance.
#[derive(Debug, thiserror::Error)]
pub enum SliderError {
    #[error("failed to fetch image from {url}: {reason}")]
    Fetch { url: String, reason: String },

    #[error("timed out after {timeout:?} fetching image from {url}")]
    FetchTimeout { url: String, timeout: Duration },

    #[error("invalid base64 image payload: {0}")]
    Decode(String),

    #[error("unsupported or corrupt image data: {0}")]
    ImageFormat(String),

    #[error("target width must be a positive integer, got {0}")]
    InvalidDimension(i64),

    #[error("image too small for edge matching: {0}")]
    ImageTooSmall(String),

    #[error("gap model inference failed: {0}")]
    Inference(String),

    #[error("no confident gap match (best score {score:.3} below floor {floor:.3})")]
    DetectionAmbiguous { score: f32, floor: f32 },

    #[error("internal error: {0}")]
    Internal(String),
}

impl SliderError {
    /// The reference could not be turned into bytes (bad Base64, unreachable or
    /// non-2xx URL, fetch timeout).
    pub fn is_reference_resolution(&self) -> bool {
        matches!(
            self,
            SliderError::Fetch { .. } | SliderError::FetchTimeout { .. } | SliderError::Decode(_)
        )
    }

    /// HTTP status the transport layer reports for this failure.
    pub fn status_code(&self) -> u16 {
        match self {
            SliderError::Fetch { .. }
            | SliderError::FetchTimeout { .. }
            | SliderError::Decode(_)
            | SliderError::ImageFormat(_)
            | SliderError::InvalidDimension(_)
            | SliderError::ImageTooSmall(_) => 400,
            SliderError::DetectionAmbiguous { .. } => 422,
            SliderError::Inference(_) | SliderError::Internal(_) => 500,
        }
    }
}

pub type SliderResult<T> = Result<T, SliderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_resolution_groups_fetch_and_decode() {
        let fetch = SliderError::Fetch { url: "http://a/b.png".into(), reason: "HTTP 404".into() };
        let timeout = SliderError::FetchTimeout {
            url: "http://a/b.png".into(),
            timeout: Duration::from_secs(2),
        };
        assert!(fetch.is_reference_resolution());
        assert!(timeout.is_reference_resolution());
        assert!(SliderError::Decode("bad".into()).is_reference_resolution());
        assert!(!SliderError::ImageFormat("bad".into()).is_reference_resolution());
        assert!(!SliderError::Inference("none".into()).is_reference_resolution());
    }

    #[test]
    fn status_codes_separate_client_and_server_failures() {
        assert_eq!(SliderError::InvalidDimension(0).status_code(), 400);
        assert_eq!(SliderError::ImageTooSmall("x".into()).status_code(), 400);
        assert_eq!(SliderError::DetectionAmbiguous { score: 0.0, floor: 0.1 }.status_code(), 422);
        assert_eq!(SliderError::Inference("x".into()).status_code(), 500);
    }
}
