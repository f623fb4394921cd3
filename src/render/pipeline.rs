//! The render pipeline: validate, parameterize, render, post-process,
//! composite, encode.

use std::io::Cursor;
use std::time::SystemTime;

use ab_glyph::{Font as _, FontArc, PxScale, ScaleFont as _};
use image::{imageops, ExtendedColorType, ImageEncoder as _, Rgba, RgbaImage};

use crate::error::{RenderServerError, Result};
use crate::projection;
use crate::render::native::Camera;
use crate::render::{ImageFormat, RenderMode};
use crate::styles::StyleBinding;

/// Hard latitude limit accepted by the renderer.
const LAT_LIMIT: f64 = 85.06;

/// Server-wide rendering knobs, resolved from the configuration.
#[derive(Clone)]
pub struct RenderSettings {
    /// Upper bound for `max(width, height) * scale`.
    pub max_size: u32,
    /// Extra border rendered around interactive tiles, in logical pixels.
    pub tile_margin: u32,
    pub jpeg_quality: u8,
    pub webp_quality: u8,
    /// Sans face for watermark and attribution strips; text overlays are
    /// skipped when absent.
    pub sans_font: Option<FontArc>,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            max_size: 2048,
            tile_margin: 0,
            jpeg_quality: 80,
            webp_quality: 90,
            sans_font: None,
        }
    }
}

/// Load the sans face used for text strips: the configured path first,
/// then well-known system locations.
pub fn load_sans_font(explicit: Option<&std::path::Path>) -> Option<FontArc> {
    const SYSTEM_FACES: [&str; 5] = [
        "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
        "/usr/share/fonts/TTF/DejaVuSans.ttf",
        "/usr/share/fonts/dejavu/DejaVuSans.ttf",
        "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
        "/Library/Fonts/Arial Unicode.ttf",
    ];

    let candidates: Vec<std::path::PathBuf> = match explicit {
        Some(path) => vec![path.to_path_buf()],
        None => SYSTEM_FACES.iter().map(std::path::PathBuf::from).collect(),
    };

    for path in candidates {
        if let Ok(bytes) = std::fs::read(&path) {
            match FontArc::try_from_vec(bytes) {
                Ok(font) => {
                    tracing::debug!("Loaded sans face from {}", path.display());
                    return Some(font);
                }
                Err(e) => tracing::warn!("Unusable font {}: {e}", path.display()),
            }
        }
    }
    None
}

/// One fully resolved render request.
pub struct RenderImageRequest {
    pub z: f64,
    pub lon: f64,
    pub lat: f64,
    pub bearing: f64,
    pub pitch: f64,
    /// Logical output size; the encoded image is `width * scale` wide.
    pub width: u32,
    pub height: u32,
    pub scale: u8,
    pub format: ImageFormat,
    pub mode: RenderMode,
    /// Pre-rasterized overlay, already at output pixel dimensions.
    pub overlay: Option<RgbaImage>,
    /// Attribution strip for static renders.
    pub attribution: Option<String>,
}

pub struct RenderOutput {
    pub data: Vec<u8>,
    pub format: ImageFormat,
    pub last_modified: SystemTime,
}

/// Render a tile or static image through the binding's pools.
pub async fn respond_image(
    binding: &StyleBinding,
    settings: &RenderSettings,
    req: RenderImageRequest,
) -> Result<RenderOutput> {
    validate(settings, &req)?;

    let pool = binding.pool(req.scale, req.mode, settings.tile_margin);

    // The renderer works on 512px tiles; zoom is offset by one relative to
    // the 256px tile addressing used at the surface.
    let mlgl_z = (req.z - 1.0).max(0.0);

    let mut render_w = req.width;
    let mut render_h = req.height;
    if req.z == 0.0 {
        // A zoom-0 render covers only half a world tile; render double and
        // downscale afterwards so the tile stays 256-equivalent.
        render_w *= 2;
        render_h *= 2;
    }
    let margin = if req.z > 2.0 && settings.tile_margin > 0 {
        settings.tile_margin
    } else {
        0
    };
    render_w += 2 * margin;
    render_h += 2 * margin;

    let camera = Camera {
        lon: req.lon,
        lat: req.lat,
        zoom: mlgl_z,
        bearing: req.bearing,
        pitch: req.pitch,
    };

    let lease = pool.acquire().await?;
    let raw = tokio::task::spawn_blocking(move || {
        let mut lease = lease;
        lease.render(camera, render_w, render_h)
    })
    .await
    .map_err(|e| RenderServerError::Render(format!("render task failed: {e}")))??;

    let mut data = raw.data;
    unpremultiply(&mut data);

    let mut img = RgbaImage::from_raw(raw.width, raw.height, data)
        .ok_or_else(|| RenderServerError::Render("renderer returned a short buffer".into()))?;

    let scale = u32::from(req.scale);
    if margin > 0 {
        img = extract_margin(img, &req, margin, scale);
    }
    if req.z == 0.0 {
        img = imageops::resize(
            &img,
            req.width * scale,
            req.height * scale,
            imageops::FilterType::Lanczos3,
        );
    }

    if let Some(overlay) = &req.overlay {
        blend_over(&mut img, overlay);
    }
    if let Some(watermark) = &binding.watermark {
        if let Some(font) = &settings.sans_font {
            draw_watermark(&mut img, watermark, font, req.scale);
        }
    }
    if req.mode == RenderMode::Static {
        if let Some(text) = &req.attribution {
            if let Some(font) = &settings.sans_font {
                draw_attribution(&mut img, text, font, req.scale);
            }
        }
    }

    let data = encode(&img, req.format, settings)?;
    Ok(RenderOutput {
        data,
        format: req.format,
        last_modified: binding.last_modified,
    })
}

fn validate(settings: &RenderSettings, req: &RenderImageRequest) -> Result<()> {
    if req.lon.is_nan() || req.lat.is_nan() || req.lon.abs() > 180.0 || req.lat.abs() > LAT_LIMIT
    {
        return Err(RenderServerError::bad_request(format!(
            "invalid center {},{}",
            req.lon, req.lat
        )));
    }
    if req.width.min(req.height) == 0 {
        return Err(RenderServerError::bad_request("invalid size"));
    }
    let largest = u64::from(req.width.max(req.height)) * u64::from(req.scale.max(1));
    if largest > u64::from(settings.max_size) {
        return Err(RenderServerError::bad_request(format!(
            "size exceeds limit of {}",
            settings.max_size
        )));
    }
    Ok(())
}

/// Straighten premultiplied RGBA in place.
///
/// Idempotent on already-straight buffers with opaque pixels: division by
/// 255/255 leaves channels unchanged.
pub fn unpremultiply(data: &mut [u8]) {
    for pixel in data.chunks_exact_mut(4) {
        let alpha = pixel[3];
        if alpha == 0 {
            pixel[0] = 0;
            pixel[1] = 0;
            pixel[2] = 0;
        } else if alpha != 255 {
            let a = u32::from(alpha);
            for channel in pixel.iter_mut().take(3) {
                *channel = ((u32::from(*channel) * 255 + a / 2) / a).min(255) as u8;
            }
        }
    }
}

/// Cut the requested window out of a margin-padded render. The vertical
/// offset compensates for the camera clamping near the poles so the crop
/// never samples outside the world.
fn extract_margin(
    img: RgbaImage,
    req: &RenderImageRequest,
    margin: u32,
    scale: u32,
) -> RgbaImage {
    let center_y = projection::px((req.lon, req.lat), req.z).1;
    let half_h = f64::from(req.height) / 2.0;
    let world = projection::world_size(req.z);
    let m = f64::from(margin);

    let yoffset = f64::max(
        f64::min(0.0, center_y - half_h - m),
        center_y + half_h + m - world,
    );

    let left = margin * scale;
    let top_f = (m + yoffset) * f64::from(scale);
    let max_top = img.height().saturating_sub(req.height * scale);
    let top = top_f.round().clamp(0.0, f64::from(max_top)) as u32;

    imageops::crop_imm(&img, left, top, req.width * scale, req.height * scale).to_image()
}

/// Source-over composite of a straight-alpha overlay onto the base image.
fn blend_over(base: &mut RgbaImage, overlay: &RgbaImage) {
    for (bp, op) in base.pixels_mut().zip(overlay.pixels()) {
        let oa = f32::from(op.0[3]) / 255.0;
        if oa <= 0.0 {
            continue;
        }
        let ba = f32::from(bp.0[3]) / 255.0;
        let out_a = oa + ba * (1.0 - oa);
        if out_a <= 0.0 {
            continue;
        }
        for c in 0..3 {
            let oc = f32::from(op.0[c]);
            let bc = f32::from(bp.0[c]);
            bp.0[c] = ((oc * oa + bc * ba * (1.0 - oa)) / out_a).round() as u8;
        }
        bp.0[3] = (out_a * 255.0).round() as u8;
    }
}

fn blend_pixel(img: &mut RgbaImage, x: i64, y: i64, color: Rgba<u8>, coverage: f32) {
    if x < 0 || y < 0 || x >= i64::from(img.width()) || y >= i64::from(img.height()) {
        return;
    }
    let alpha = f32::from(color.0[3]) / 255.0 * coverage.clamp(0.0, 1.0);
    if alpha <= 0.0 {
        return;
    }
    let existing = img.get_pixel_mut(x as u32, y as u32);
    for c in 0..3 {
        let fg = f32::from(color.0[c]);
        let bg = f32::from(existing.0[c]);
        existing.0[c] = (fg * alpha + bg * (1.0 - alpha)).round() as u8;
    }
    let bg_a = f32::from(existing.0[3]) / 255.0;
    existing.0[3] = ((alpha + bg_a * (1.0 - alpha)) * 255.0).round() as u8;
}

fn draw_text(
    img: &mut RgbaImage,
    text: &str,
    font: &FontArc,
    px_size: f32,
    origin: (f32, f32),
    color: Rgba<u8>,
) {
    let scaled = font.as_scaled(PxScale::from(px_size));
    let mut caret = origin.0;
    let baseline = origin.1;
    let mut previous: Option<ab_glyph::GlyphId> = None;

    for ch in text.chars() {
        let glyph_id = scaled.glyph_id(ch);
        if let Some(prev) = previous {
            caret += scaled.kern(prev, glyph_id);
        }
        let glyph = glyph_id.with_scale_and_position(px_size, ab_glyph::point(caret, baseline));
        caret += scaled.h_advance(glyph_id);
        previous = Some(glyph_id);

        if let Some(outline) = scaled.outline_glyph(glyph) {
            let bounds = outline.px_bounds();
            outline.draw(|gx, gy, coverage| {
                blend_pixel(
                    img,
                    i64::from(bounds.min.x as i32) + i64::from(gx),
                    i64::from(bounds.min.y as i32) + i64::from(gy),
                    color,
                    coverage,
                );
            });
        }
    }
}

fn text_width(text: &str, font: &FontArc, px_size: f32) -> f32 {
    let scaled = font.as_scaled(PxScale::from(px_size));
    let mut width = 0.0;
    let mut previous: Option<ab_glyph::GlyphId> = None;
    for ch in text.chars() {
        let glyph_id = scaled.glyph_id(ch);
        if let Some(prev) = previous {
            width += scaled.kern(prev, glyph_id);
        }
        width += scaled.h_advance(glyph_id);
        previous = Some(glyph_id);
    }
    width
}

/// 10px sans-serif at `(5, H-5)`: a white translucent halo under a black
/// translucent fill.
fn draw_watermark(img: &mut RgbaImage, text: &str, font: &FontArc, scale: u8) {
    let s = f32::from(scale.max(1));
    let size = 10.0 * s;
    let x = 5.0 * s;
    let y = img.height() as f32 - 5.0 * s;

    let halo = Rgba([255, 255, 255, 102]);
    for (dx, dy) in [(-1.0, 0.0), (1.0, 0.0), (0.0, -1.0), (0.0, 1.0)] {
        draw_text(img, text, font, size, (x + dx * s, y + dy * s), halo);
    }
    draw_text(img, text, font, size, (x, y), Rgba([0, 0, 0, 77]));
}

/// Black 10px sans-serif on a white 80%-opacity box, right-aligned 6px from
/// the right and bottom edges.
fn draw_attribution(img: &mut RgbaImage, text: &str, font: &FontArc, scale: u8) {
    let s = f32::from(scale.max(1));
    let size = 10.0 * s;
    let scaled = font.as_scaled(PxScale::from(size));
    let ascent = scaled.ascent();
    let text_h = ascent - scaled.descent();
    let text_w = text_width(text, font, size);

    let pad = 2.0 * s;
    let box_w = text_w + 2.0 * pad;
    let box_h = text_h + 2.0 * pad;
    let box_x = img.width() as f32 - 6.0 * s - box_w;
    let box_y = img.height() as f32 - 6.0 * s - box_h;

    let background = Rgba([255, 255, 255, 204]);
    for y in box_y.max(0.0) as u32..((box_y + box_h) as u32).min(img.height()) {
        for x in box_x.max(0.0) as u32..((box_x + box_w) as u32).min(img.width()) {
            blend_pixel(img, i64::from(x), i64::from(y), background, 1.0);
        }
    }

    draw_text(
        img,
        text,
        font,
        size,
        (box_x + pad, box_y + pad + ascent),
        Rgba([0, 0, 0, 255]),
    );
}

fn encode(img: &RgbaImage, format: ImageFormat, settings: &RenderSettings) -> Result<Vec<u8>> {
    let (width, height) = img.dimensions();
    let mut cursor = Cursor::new(Vec::new());

    match format {
        ImageFormat::Png => {
            use image::codecs::png::{CompressionType, FilterType, PngEncoder};
            // Adaptive filtering off.
            PngEncoder::new_with_quality(&mut cursor, CompressionType::Default, FilterType::NoFilter)
                .write_image(img.as_raw(), width, height, ExtendedColorType::Rgba8)
                .map_err(|e| RenderServerError::Render(format!("PNG encoding failed: {e}")))?;
        }
        ImageFormat::Jpeg => {
            use image::codecs::jpeg::JpegEncoder;
            let mut rgb = Vec::with_capacity((width * height * 3) as usize);
            for pixel in img.pixels() {
                rgb.extend_from_slice(&pixel.0[..3]);
            }
            JpegEncoder::new_with_quality(&mut cursor, settings.jpeg_quality)
                .write_image(&rgb, width, height, ExtendedColorType::Rgb8)
                .map_err(|e| RenderServerError::Render(format!("JPEG encoding failed: {e}")))?;
        }
        ImageFormat::Webp => {
            use image::codecs::webp::WebPEncoder;
            WebPEncoder::new_lossless(&mut cursor)
                .write_image(img.as_raw(), width, height, ExtendedColorType::Rgba8)
                .map_err(|e| RenderServerError::Render(format!("WebP encoding failed: {e}")))?;
        }
    }

    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unpremultiply_zeroes_fully_transparent_pixels() {
        let mut data = vec![40, 30, 20, 0];
        unpremultiply(&mut data);
        assert_eq!(data, vec![0, 0, 0, 0]);
    }

    #[test]
    fn unpremultiply_scales_by_alpha() {
        let mut data = vec![64, 32, 16, 128];
        unpremultiply(&mut data);
        assert_eq!(data[3], 128);
        assert_eq!(data[0], 128);
        assert_eq!(data[1], 64);
        assert_eq!(data[2], 32);
    }

    #[test]
    fn unpremultiply_is_idempotent_on_opaque_pixels() {
        let mut data = vec![210, 120, 33, 255, 0, 0, 0, 255];
        let original = data.clone();
        unpremultiply(&mut data);
        assert_eq!(data, original);
        unpremultiply(&mut data);
        assert_eq!(data, original);
    }

    #[test]
    fn validation_rejects_bad_geometry() {
        let settings = RenderSettings::default();
        let mut req = request(256, 256, 1);

        req.lat = 86.0;
        assert!(validate(&settings, &req).is_err());
        req.lat = f64::NAN;
        assert!(validate(&settings, &req).is_err());
        req.lat = 0.0;
        req.lon = 181.0;
        assert!(validate(&settings, &req).is_err());
    }

    #[test]
    fn validation_rejects_bad_sizes() {
        let settings = RenderSettings::default();

        let req = request(0, 256, 1);
        assert!(validate(&settings, &req).is_err());

        let req = request(1025, 256, 2);
        assert!(validate(&settings, &req).is_err());

        let req = request(1024, 256, 2);
        assert!(validate(&settings, &req).is_ok());
    }

    #[test]
    fn blend_over_prefers_opaque_overlay() {
        let mut base = RgbaImage::from_pixel(2, 1, Rgba([10, 10, 10, 255]));
        let mut overlay = RgbaImage::from_pixel(2, 1, Rgba([0, 0, 0, 0]));
        overlay.put_pixel(1, 0, Rgba([200, 0, 0, 255]));

        blend_over(&mut base, &overlay);
        assert_eq!(base.get_pixel(0, 0).0, [10, 10, 10, 255]);
        assert_eq!(base.get_pixel(1, 0).0, [200, 0, 0, 255]);
    }

    #[test]
    fn blend_over_mixes_translucent_overlay() {
        let mut base = RgbaImage::from_pixel(1, 1, Rgba([0, 0, 0, 255]));
        let overlay = RgbaImage::from_pixel(1, 1, Rgba([255, 255, 255, 128]));
        blend_over(&mut base, &overlay);
        let px = base.get_pixel(0, 0).0;
        assert!(px[0] > 100 && px[0] < 160);
        assert_eq!(px[3], 255);
    }

    #[test]
    fn encoded_formats_decode_back() {
        let img = RgbaImage::from_pixel(8, 8, Rgba([12, 200, 120, 255]));
        let settings = RenderSettings::default();

        for format in [ImageFormat::Png, ImageFormat::Jpeg, ImageFormat::Webp] {
            let data = encode(&img, format, &settings).unwrap();
            let decoded = image::load_from_memory(&data).unwrap();
            assert_eq!(decoded.width(), 8, "{format:?}");
            assert_eq!(decoded.height(), 8, "{format:?}");
        }
    }

    fn request(width: u32, height: u32, scale: u8) -> RenderImageRequest {
        RenderImageRequest {
            z: 2.0,
            lon: 0.0,
            lat: 0.0,
            bearing: 0.0,
            pitch: 0.0,
            width,
            height,
            scale,
            format: ImageFormat::Png,
            mode: RenderMode::Tile,
            overlay: None,
            attribution: None,
        }
    }
}
