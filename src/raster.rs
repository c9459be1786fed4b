use image::{DynamicImage, GenericImageView, ImageFormat, RgbImage};
use tracing::debug;

use crate::error::{SliderError, SliderResult};

/// A 3-channel raster owned by one pipeline stage. Transforms return new values.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedImage {
    pixels: RgbImage,
}

impl DecodedImage {
    pub fn new(pixels: RgbImage) -> Self {
        Self { pixels }
    }

    /// Decodes PNG/JPEG/BMP/WebP/GIF bytes.
    ///
    /// With `png_fix` set, fully transparent pixels are painted white before the
    /// alpha channel is dropped; otherwise their stored colour is kept.
    pub fn from_bytes(bytes: &[u8], png_fix: bool) -> SliderResult<Self> {
        if bytes.is_empty() {
            return Err(SliderError::ImageFormat("image payload is empty".into()));
        }
        let format = image::guess_format(bytes)
            .map_err(|e| SliderError::ImageFormat(format!("unrecognised image signature: {e}")))?;
        let decoded = image::load_from_memory_with_format(bytes, format)
            .map_err(|e| SliderError::ImageFormat(format!("{format:?} decode failed: {e}")))?;

        let pixels = if png_fix && decoded.color().has_alpha() {
            transparent_to_white(&decoded)
        } else {
            decoded.to_rgb8()
        };
        debug!(?format, width = pixels.width(), height = pixels.height(), "decoded image");
        Ok(Self { pixels })
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.pixels.dimensions()
    }

    pub fn pixels(&self) -> &RgbImage {
        &self.pixels
    }

    pub fn to_luma8(&self) -> image::GrayImage {
        image::imageops::grayscale(&self.pixels)
    }

    /// Lossless PNG encoding, used when handing pixels to an external capability.
    pub fn encode_png(&self) -> SliderResult<Vec<u8>> {
        let mut out = std::io::Cursor::new(Vec::new());
        self.pixels
            .write_to(&mut out, ImageFormat::Png)
            .map_err(|e| SliderError::Internal(format!("png encode failed: {e}")))?;
        Ok(out.into_inner())
    }
}

fn transparent_to_white(image: &DynamicImage) -> RgbImage {
    let (width, height) = image.dimensions();
    RgbImage::from_fn(width, height, |x, y| {
        let p = image.get_pixel(x, y);
        if p[3] == 0 {
            image::Rgb([255, 255, 255])
        } else {
            image::Rgb([p[0], p[1], p[2]])
        }
    })
}

/// A normalized image and the factor (`new_width / original_width`) used to make it.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizationResult {
    pub image: DecodedImage,
    pub scale: f64,
}

/// Proportionally resizes `image` to `target_width`.
///
/// `None` or a width equal to the current one returns the image untouched with
/// scale `1.0`. Height follows the same factor, truncated, and never drops below 1.
pub fn normalize(image: DecodedImage, target_width: Option<i64>) -> SliderResult<NormalizationResult> {
    let Some(target) = target_width else {
        return Ok(NormalizationResult { image, scale: 1.0 });
    };
    if target <= 0 {
        return Err(SliderError::InvalidDimension(target));
    }
    let target = u32::try_from(target).map_err(|_| SliderError::InvalidDimension(target))?;

    let (width, height) = image.dimensions();
    if target == width {
        return Ok(NormalizationResult { image, scale: 1.0 });
    }

    let scale = f64::from(target) / f64::from(width);
    let new_height = ((f64::from(height) * scale) as u32).max(1);
    let resized = image::imageops::resize(
        image.pixels(),
        target,
        new_height,
        image::imageops::FilterType::Lanczos3,
    );
    debug!(from = ?(width, height), to = ?(target, new_height), scale, "normalized image");

    Ok(NormalizationResult { image: DecodedImage::new(resized), scale })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(width: u32, height: u32, value: u8) -> DecodedImage {
        DecodedImage::new(RgbImage::from_pixel(width, height, image::Rgb([value; 3])))
    }

    #[test]
    fn absent_target_keeps_image_and_unit_scale() {
        let img = solid(340, 150, 10);
        let result = normalize(img.clone(), None).unwrap();
        assert_eq!(result.scale, 1.0);
        assert_eq!(result.image, img);
    }

    #[test]
    fn equal_target_is_a_no_op() {
        let img = solid(68, 150, 10);
        let result = normalize(img.clone(), Some(68)).unwrap();
        assert_eq!(result.scale, 1.0);
        assert_eq!(result.image, img);
    }

    #[test]
    fn downscale_preserves_aspect_ratio() {
        let result = normalize(solid(340, 150, 10), Some(170)).unwrap();
        assert_eq!(result.scale, 0.5);
        assert_eq!(result.image.dimensions(), (170, 75));
    }

    #[test]
    fn upscale_records_factor() {
        let result = normalize(solid(100, 40, 10), Some(250)).unwrap();
        assert_eq!(result.scale, 2.5);
        assert_eq!(result.image.dimensions(), (250, 100));
    }

    #[test]
    fn non_positive_target_is_rejected() {
        assert!(matches!(
            normalize(solid(10, 10, 0), Some(0)),
            Err(SliderError::InvalidDimension(0))
        ));
        assert!(matches!(
            normalize(solid(10, 10, 0), Some(-5)),
            Err(SliderError::InvalidDimension(-5))
        ));
    }

    #[test]
    fn garbage_bytes_are_an_image_format_error() {
        assert!(matches!(
            DecodedImage::from_bytes(b"<html>nope</html>", false),
            Err(SliderError::ImageFormat(_))
        ));
        assert!(matches!(DecodedImage::from_bytes(&[], false), Err(SliderError::ImageFormat(_))));
    }

    #[test]
    fn png_round_trip_preserves_pixels() {
        let img = DecodedImage::new(RgbImage::from_fn(12, 9, |x, y| {
            image::Rgb([(x * 20) as u8, (y * 25) as u8, 7])
        }));
        let bytes = img.encode_png().unwrap();
        assert_eq!(DecodedImage::from_bytes(&bytes, false).unwrap(), img);
    }

    #[test]
    fn png_fix_whitens_transparent_pixels_only() {
        let rgba = image::RgbaImage::from_fn(4, 1, |x, _| {
            if x < 2 { image::Rgba([0, 0, 0, 0]) } else { image::Rgba([10, 20, 30, 255]) }
        });
        let mut buf = std::io::Cursor::new(Vec::new());
        rgba.write_to(&mut buf, ImageFormat::Png).unwrap();
        let bytes = buf.into_inner();

        let fixed = DecodedImage::from_bytes(&bytes, true).unwrap();
        assert_eq!(fixed.pixels().get_pixel(0, 0), &image::Rgb([255, 255, 255]));
        assert_eq!(fixed.pixels().get_pixel(3, 0), &image::Rgb([10, 20, 30]));

        let raw = DecodedImage::from_bytes(&bytes, false).unwrap();
        assert_eq!(raw.pixels().get_pixel(0, 0), &image::Rgb([0, 0, 0]));
    }
}
