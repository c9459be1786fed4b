pub mod config;
pub mod edge_match;
pub mod error;
pub mod loader;
pub mod model_inference;
pub mod raster;
pub mod recognizer;
pub mod resolver;

// Re-export the pieces the server binary and integration tests need
pub use self::config::{EdgeMatchParams, ResolverConfig, RECOMMENDED_BG_WIDTH, RECOMMENDED_SLIDER_WIDTH};
pub use self::edge_match::{EdgeMatch, EdgeMatchDetector};
pub use self::error::{SliderError, SliderResult};
pub use self::loader::{ImageLoader, ImageReference};
pub use self::model_inference::ModelInferenceDetector;
pub use self::raster::{normalize, DecodedImage, NormalizationResult};
pub use self::recognizer::{GapBox, GapRecognizer, OnnxGapRecognizer, SlideMatchRecognizer};
pub use self::resolver::{
    correct, rescale, resolve_images, Detect, DetectionMethod, Resolution, Resolver, SliderCalcRequest,
};
