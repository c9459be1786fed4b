use std::net::TcpListener;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine as _;
use image::{Rgb, RgbImage};
use slidecalc::*;

const GAP_X: i64 = 125;

/// 340x150 background with a dark square notch 8px inside the window at `gap_x`,
/// and a lighter decoy bar near the left edge.
fn background_png(gap_x: u32) -> Vec<u8> {
    let img = RgbImage::from_fn(340, 150, |x, y| {
        if (gap_x + 8..gap_x + 60).contains(&x) && (45..105).contains(&y) {
            Rgb([60, 60, 60])
        } else if (20..36).contains(&x) && (30..120).contains(&y) {
            Rgb([90, 90, 90])
        } else {
            Rgb([200, 200, 200])
        }
    });
    png(&img)
}

fn slider_png() -> Vec<u8> {
    let img = RgbImage::from_fn(68, 150, |x, y| {
        if (8..60).contains(&x) && (45..105).contains(&y) {
            Rgb([60, 60, 60])
        } else {
            Rgb([200, 200, 200])
        }
    });
    png(&img)
}

fn png(img: &RgbImage) -> Vec<u8> {
    let mut buf = std::io::Cursor::new(Vec::new());
    img.write_to(&mut buf, image::ImageFormat::Png).unwrap();
    buf.into_inner()
}

fn b64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn data_uri(bytes: &[u8]) -> String {
    format!("data:image/png;base64,{}", b64(bytes))
}

fn resolver() -> Resolver {
    Resolver::new(ResolverConfig::default()).unwrap()
}

fn edge_request() -> SliderCalcRequest {
    SliderCalcRequest::new(data_uri(&background_png(GAP_X as u32)), b64(&slider_png()), DetectionMethod::EdgeMatch)
}

#[tokio::test]
async fn scenario_edge_match_finds_hand_placed_gap() {
    let distance = resolver().resolve(&edge_request()).await.unwrap();
    assert!((0..=272).contains(&distance));
    assert!((distance - GAP_X).abs() <= 3, "distance {distance}");
}

#[tokio::test]
async fn scenario_offset_is_subtracted() {
    let resolver = resolver();
    let base = resolver.resolve(&edge_request()).await.unwrap();
    let shifted = resolver.resolve(&edge_request().with_offset(10)).await.unwrap();
    assert_eq!(shifted, base - 10);
}

#[tokio::test]
async fn scenario_half_width_detection_is_rescaled() {
    let resolver = resolver();
    let full = resolver.resolve(&edge_request()).await.unwrap();
    let half = resolver
        .resolve_detailed(&edge_request().with_widths(Some(170), Some(34)))
        .await
        .unwrap();

    assert_eq!(half.bg_scale, 0.5);
    assert!((61..=64).contains(&half.raw_x), "raw {}", half.raw_x);
    assert!((half.distance - GAP_X).abs() <= 3, "distance {}", half.distance);
    // One normalized pixel is two original pixels at this scale.
    assert!((half.distance - full).abs() <= 3, "half {} full {full}", half.distance);
}

#[tokio::test]
async fn scenario_malformed_base64_background_is_rejected() {
    let request = SliderCalcRequest::new("not*base64*at*all", b64(&slider_png()), DetectionMethod::EdgeMatch);
    let err = resolver().resolve(&request).await.unwrap_err();
    assert!(matches!(err, SliderError::Decode(_)), "{err:?}");
    assert!(err.is_reference_resolution());
}

#[tokio::test]
async fn scenario_slider_wider_than_background_is_too_small() {
    let wide_slider = png(&RgbImage::from_pixel(400, 150, Rgb([60, 60, 60])));
    let request = SliderCalcRequest::new(b64(&background_png(GAP_X as u32)), b64(&wide_slider), DetectionMethod::EdgeMatch);
    let err = resolver().resolve(&request).await.unwrap_err();
    assert!(matches!(err, SliderError::ImageTooSmall(_)), "{err:?}");
}

#[tokio::test]
async fn scenario_silent_server_times_out_after_configured_limit() {
    // Bound but never accepted: the connection sits in the backlog and no reply ever comes.
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("http://127.0.0.1:{}/bg.png", listener.local_addr().unwrap().port());

    let request = SliderCalcRequest::new(url, b64(&slider_png()), DetectionMethod::EdgeMatch)
        .with_timeout(Duration::from_secs(2));
    let started = Instant::now();
    let err = resolver().resolve(&request).await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, SliderError::FetchTimeout { .. }), "{err:?}");
    assert!(elapsed >= Duration::from_millis(1900), "gave up after {elapsed:?}");
    assert!(elapsed < Duration::from_secs(5), "took {elapsed:?}");
    drop(listener);
}

#[tokio::test]
async fn default_model_method_finds_hand_placed_gap() {
    let request = SliderCalcRequest::new(data_uri(&background_png(GAP_X as u32)), b64(&slider_png()), DetectionMethod::ModelInference);
    let distance = resolver().resolve(&request).await.unwrap();
    assert!((distance - GAP_X).abs() <= 3, "distance {distance}");
}

#[tokio::test]
async fn repeated_resolution_is_idempotent() {
    let resolver = resolver();
    let first = resolver.resolve_detailed(&edge_request()).await.unwrap();
    for _ in 0..3 {
        assert_eq!(resolver.resolve_detailed(&edge_request()).await.unwrap(), first);
    }
}

#[tokio::test]
async fn offset_linearity_holds_for_any_sign() {
    let resolver = resolver();
    let base = resolver.resolve(&edge_request()).await.unwrap();
    for k in [-50, -1, 1, 272, 1000] {
        assert_eq!(resolver.resolve(&edge_request().with_offset(k)).await.unwrap(), base - k);
    }
}

#[tokio::test]
async fn background_narrower_than_filter_is_too_small() {
    let narrow = png(&RgbImage::from_pixel(6, 150, Rgb([200, 200, 200])));
    let slider = png(&RgbImage::from_pixel(4, 20, Rgb([60, 60, 60])));
    let request = SliderCalcRequest::new(b64(&narrow), b64(&slider), DetectionMethod::EdgeMatch);
    let err = resolver().resolve(&request).await.unwrap_err();
    assert!(matches!(err, SliderError::ImageTooSmall(_)), "{err:?}");
}

#[tokio::test]
async fn data_uri_and_bare_base64_decode_to_identical_pixels() {
    let loader = ImageLoader::new(&ResolverConfig::default()).unwrap();
    let bytes = background_png(GAP_X as u32);
    let timeout = Duration::from_secs(1);

    let with_prefix = loader.load(&ImageReference::parse(&data_uri(&bytes)), timeout).await.unwrap();
    let bare = loader.load(&ImageReference::parse(&b64(&bytes)), timeout).await.unwrap();
    assert_eq!(with_prefix.pixels(), bare.pixels());
}

#[tokio::test]
async fn model_method_uses_injected_capability() {
    struct HalfWay;

    impl GapRecognizer for HalfWay {
        fn infer(&self, background: &[u8], _slider: &[u8]) -> anyhow::Result<GapBox> {
            let bg = image::load_from_memory(background)?;
            Ok(GapBox { x: bg.width() / 2, y: 10, width: 40, height: 40 })
        }

        fn name(&self) -> &'static str {
            "halfway"
        }

        fn fingerprint(&self) -> Option<String> {
            Some("halfway".into())
        }
    }

    let resolver = resolver().with_recognizer(Arc::new(HalfWay));
    assert_eq!(resolver.recognizer_name(), "halfway");
    assert_eq!(resolver.model_fingerprint().as_deref(), Some("halfway"));

    let request = SliderCalcRequest::new(b64(&background_png(GAP_X as u32)), b64(&slider_png()), DetectionMethod::ModelInference)
        .with_widths(Some(170), None)
        .with_offset(5);
    let resolution = resolver.resolve_detailed(&request).await.unwrap();
    assert_eq!(resolution.raw_x, 85);
    assert_eq!(resolution.original_x, 170);
    assert_eq!(resolution.distance, 165);
}
