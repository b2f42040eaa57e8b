/// Image transcoder
///
/// Decodes an upload and renders every (size, format) variant. JPEG is
/// always produced. WebP is written lossless and ignores the quality table,
/// so a WebP variant can outweigh its JPEG sibling. AVIF needs the `avif`
/// feature, on by default.
use crate::error::{AppError, AppResult};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::webp::WebPEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ExtendedColorType, ImageFormat};
use std::borrow::Cow;
use std::collections::BTreeMap;

/// Size bucket of a variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VariantSize {
    Thumb,
    Medium,
    Large,
}

impl VariantSize {
    pub const ALL: [VariantSize; 3] = [VariantSize::Thumb, VariantSize::Medium, VariantSize::Large];

    pub fn name(self) -> &'static str {
        match self {
            VariantSize::Thumb => "thumb",
            VariantSize::Medium => "medium",
            VariantSize::Large => "large",
        }
    }

    /// Bounding box edge in pixels
    pub fn max_dimension(self) -> u32 {
        match self {
            VariantSize::Thumb => 400,
            VariantSize::Medium => 1024,
            VariantSize::Large => 2048,
        }
    }

    pub fn jpeg_quality(self) -> u8 {
        match self {
            VariantSize::Thumb => 75,
            VariantSize::Medium => 85,
            VariantSize::Large => 90,
        }
    }
}

/// Output encoding of a variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VariantFormat {
    Jpeg,
    Webp,
    Avif,
}

impl VariantFormat {
    pub fn name(self) -> &'static str {
        match self {
            VariantFormat::Jpeg => "jpeg",
            VariantFormat::Webp => "webp",
            VariantFormat::Avif => "avif",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            VariantFormat::Jpeg => ".jpg",
            VariantFormat::Webp => ".webp",
            VariantFormat::Avif => ".avif",
        }
    }

    /// Formats this build can encode
    pub fn available() -> &'static [VariantFormat] {
        if cfg!(feature = "avif") {
            &[VariantFormat::Jpeg, VariantFormat::Webp, VariantFormat::Avif]
        } else {
            &[VariantFormat::Jpeg, VariantFormat::Webp]
        }
    }
}

/// Map key of a variant, `<size>_<format>`
pub fn variant_key(size: VariantSize, format: VariantFormat) -> String {
    format!("{}_{}", size.name(), format.name())
}

/// Result of transcoding one image
#[derive(Debug, Default)]
pub struct Transcoded {
    /// Primary rendition (large jpeg) dimensions
    pub width: u32,
    pub height: u32,
    pub variants: BTreeMap<String, Vec<u8>>,
}

impl Transcoded {
    pub fn variant(&self, size: VariantSize, format: VariantFormat) -> Option<&[u8]> {
        self.variants
            .get(&variant_key(size, format))
            .map(|v| v.as_slice())
    }
}

/// Fit (w, h) into a `max` x `max` box, keeping aspect ratio. Images that
/// already fit keep their dimensions.
pub fn fit_within(width: u32, height: u32, max: u32) -> (u32, u32) {
    if width <= max && height <= max {
        return (width, height);
    }

    let ratio = f64::min(max as f64 / width as f64, max as f64 / height as f64);
    let w = ((width as f64 * ratio).round() as u32).clamp(1, max);
    let h = ((height as f64 * ratio).round() as u32).clamp(1, max);
    (w, h)
}

/// Decode the upload, trusting the declared type first and sniffing second
pub fn decode(data: &[u8], mime_type: &str) -> AppResult<DynamicImage> {
    if let Some(format) = ImageFormat::from_mime_type(mime_type) {
        if let Ok(img) = image::load_from_memory_with_format(data, format) {
            return Ok(img);
        }
    }

    image::load_from_memory(data).map_err(|e| AppError::Decode(e.to_string()))
}

/// Render every variant of an image
pub fn transcode(data: &[u8], mime_type: &str) -> AppResult<Transcoded> {
    let source = decode(data, mime_type)?;
    let mut out = Transcoded::default();

    for size in VariantSize::ALL {
        let (w, h) = fit_within(source.width(), source.height(), size.max_dimension());
        let resized = if (w, h) == (source.width(), source.height()) {
            Cow::Borrowed(&source)
        } else {
            Cow::Owned(source.resize_exact(w, h, FilterType::CatmullRom))
        };

        for &format in VariantFormat::available() {
            match encode(&resized, format, size.jpeg_quality()) {
                Ok(bytes) => {
                    if size == VariantSize::Large && format == VariantFormat::Jpeg {
                        out.width = w;
                        out.height = h;
                    }
                    out.variants.insert(variant_key(size, format), bytes);
                }
                Err(e) if size == VariantSize::Large && format == VariantFormat::Jpeg => {
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(
                        variant = %variant_key(size, format),
                        error = %e,
                        "Skipping variant that failed to encode"
                    );
                }
            }
        }
    }

    Ok(out)
}

fn encode(img: &DynamicImage, format: VariantFormat, quality: u8) -> AppResult<Vec<u8>> {
    let mut buf = Vec::new();

    match format {
        VariantFormat::Jpeg => {
            let rgb = img.to_rgb8();
            JpegEncoder::new_with_quality(&mut buf, quality)
                .encode_image(&rgb)
                .map_err(|e| AppError::Encode(format!("jpeg: {}", e)))?;
        }
        VariantFormat::Webp => {
            let rgba = img.to_rgba8();
            WebPEncoder::new_lossless(&mut buf)
                .encode(rgba.as_raw(), rgba.width(), rgba.height(), ExtendedColorType::Rgba8)
                .map_err(|e| AppError::Encode(format!("webp: {}", e)))?;
        }
        VariantFormat::Avif => encode_avif(img, quality, &mut buf)?,
    }

    if buf.is_empty() {
        return Err(AppError::Encode(format!("{}: empty output", format.name())));
    }
    Ok(buf)
}

#[cfg(feature = "avif")]
fn encode_avif(img: &DynamicImage, quality: u8, buf: &mut Vec<u8>) -> AppResult<()> {
    use image::codecs::avif::AvifEncoder;
    use image::ImageEncoder;

    let rgba = img.to_rgba8();
    AvifEncoder::new_with_speed_quality(buf, 8, quality)
        .write_image(rgba.as_raw(), rgba.width(), rgba.height(), ExtendedColorType::Rgba8)
        .map_err(|e| AppError::Encode(format!("avif: {}", e)))
}

#[cfg(not(feature = "avif"))]
fn encode_avif(_img: &DynamicImage, _quality: u8, _buf: &mut Vec<u8>) -> AppResult<()> {
    Err(AppError::Encode("avif: built without the avif feature".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use std::io::Cursor;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb([200, 120, 40]));
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    #[test]
    fn test_fit_within() {
        assert_eq!(fit_within(1600, 1200, 2048), (1600, 1200));
        assert_eq!(fit_within(1600, 1200, 1024), (1024, 768));
        assert_eq!(fit_within(1600, 1200, 400), (400, 300));
        assert_eq!(fit_within(1200, 1600, 400), (300, 400));
        assert_eq!(fit_within(5000, 3, 400), (400, 1));
    }

    #[test]
    fn test_transcode_produces_every_variant() {
        let out = transcode(&png_bytes(1600, 1200), "image/png").unwrap();

        assert_eq!((out.width, out.height), (1600, 1200));
        for size in VariantSize::ALL {
            for &format in VariantFormat::available() {
                assert!(
                    out.variant(size, format).is_some(),
                    "missing {}",
                    variant_key(size, format)
                );
            }
        }

        let thumb = image::load_from_memory(out.variant(VariantSize::Thumb, VariantFormat::Jpeg).unwrap())
            .unwrap();
        assert_eq!((thumb.width(), thumb.height()), (400, 300));
    }

    #[test]
    fn test_wrong_declared_type_still_decodes() {
        let out = transcode(&png_bytes(32, 16), "image/jpeg").unwrap();
        assert_eq!((out.width, out.height), (32, 16));
    }

    #[test]
    fn test_garbage_is_decode_error() {
        let err = transcode(b"not an image", "image/jpeg").unwrap_err();
        assert!(matches!(err, AppError::Decode(_)));
    }

    #[test]
    fn test_variant_keys() {
        assert_eq!(variant_key(VariantSize::Large, VariantFormat::Jpeg), "large_jpeg");
        assert_eq!(variant_key(VariantSize::Thumb, VariantFormat::Webp), "thumb_webp");
    }

    #[test]
    fn test_webp_variant_is_lossless() {
        let out = transcode(&png_bytes(64, 48), "image/png").unwrap();
        let webp = image::load_from_memory_with_format(
            out.variant(VariantSize::Thumb, VariantFormat::Webp).unwrap(),
            ImageFormat::WebP,
        )
        .unwrap();

        assert_eq!(webp.to_rgb8(), decode(&png_bytes(64, 48), "image/png").unwrap().to_rgb8());
    }
}
