//! Marker icon loading.
//!
//! Icon fetches are issued up front and joined before the canvas pass, so
//! the overlay is fully materialized before a renderer is taken from the
//! pool. A marker whose icon cannot be loaded is skipped with a warning
//! rather than failing the whole request.

use std::collections::BTreeSet;
use std::path::PathBuf;

use base64::Engine as _;
use tiny_skia::Pixmap;

use crate::error::{RenderServerError, Result};
use crate::render::overlay::MarkerSpec;

/// Width of the generated default pin in SVG user units.
const DEFAULT_PIN_WIDTH: u32 = 30;
/// Height of the generated default pin in SVG user units.
const DEFAULT_PIN_HEIGHT: u32 = 45;
const DEFAULT_PIN_COLOR: &str = "#d9534f";

/// Policy and lookup context for marker icon resolution.
pub struct IconPolicy {
    pub allow_inline: bool,
    pub allow_remote: bool,
    pub icons_dir: Option<PathBuf>,
    /// File names found under `icons_dir` at startup.
    pub available_icons: BTreeSet<String>,
}

impl Default for IconPolicy {
    fn default() -> Self {
        Self {
            allow_inline: true,
            allow_remote: false,
            icons_dir: None,
            available_icons: BTreeSet::new(),
        }
    }
}

/// A marker with its icon decoded and ready to draw.
pub struct LoadedMarker {
    pub location: (f64, f64),
    pub pixmap: Pixmap,
    /// Scale applied when drawing the pixmap onto the overlay canvas.
    pub draw_scale: f32,
    /// The marker's own scale, used for offset math.
    pub marker_scale: f32,
    pub offset_x: f32,
    pub offset_y: f32,
}

/// Fetch and decode every marker icon; unresolvable markers are dropped.
pub async fn load_marker_icons(
    markers: &[MarkerSpec],
    policy: &IconPolicy,
    http: &reqwest::Client,
    canvas_scale: u8,
) -> Result<Vec<LoadedMarker>> {
    let futures = markers
        .iter()
        .map(|marker| load_one(marker, policy, http, canvas_scale));
    let loaded = futures::future::join_all(futures).await;

    Ok(loaded
        .into_iter()
        .zip(markers)
        .filter_map(|(result, marker)| match result {
            Ok(loaded) => Some(loaded),
            Err(e) => {
                tracing::warn!("skipping marker at {:?}: {e}", marker.location);
                None
            }
        })
        .collect())
}

async fn load_one(
    marker: &MarkerSpec,
    policy: &IconPolicy,
    http: &reqwest::Client,
    canvas_scale: u8,
) -> Result<LoadedMarker> {
    let marker_scale = marker.scale.unwrap_or(1.0).max(0.0) as f32;

    let (pixmap, draw_scale) = if is_default_icon(&marker.icon) {
        let svg = default_pin_svg(marker.color.as_deref().unwrap_or(DEFAULT_PIN_COLOR));
        let pixmap = rasterize_svg(&svg)?;
        // The canvas pre-applies the pixel ratio; compensate so the
        // generated pin keeps its nominal size.
        (pixmap, marker_scale / canvas_scale.max(1) as f32)
    } else if let Some(data_url) = marker.icon.strip_prefix("data:") {
        if !policy.allow_inline {
            return Err(RenderServerError::bad_request(
                "inline marker images are disabled",
            ));
        }
        (decode_data_url(data_url)?, marker_scale)
    } else if marker.icon.starts_with("http://") || marker.icon.starts_with("https://") {
        if !policy.allow_remote {
            return Err(RenderServerError::bad_request(
                "remote marker icons are disabled",
            ));
        }
        (fetch_remote_icon(http, &marker.icon).await?, marker_scale)
    } else {
        (load_local_icon(policy, &marker.icon).await?, marker_scale)
    };

    Ok(LoadedMarker {
        location: marker.location,
        pixmap,
        draw_scale,
        marker_scale,
        offset_x: marker.offset_x as f32,
        offset_y: marker.offset_y as f32,
    })
}

fn is_default_icon(icon: &str) -> bool {
    icon.is_empty() || icon == "default"
}

/// The canonical pin: a 30x45 teardrop with a translucent well.
fn default_pin_svg(color: &str) -> String {
    format!(
        r##"<svg xmlns="http://www.w3.org/2000/svg" width="{w}" height="{h}" viewBox="0 0 {w} {h}">
  <path fill="{color}" stroke="#404040" stroke-width="1" d="M15 1 C7.3 1 1 7.3 1 15 C1 25.6 15 44 15 44 C15 44 29 25.6 29 15 C29 7.3 22.7 1 15 1 Z"/>
  <circle cx="15" cy="15" r="5.5" fill="#ffffff" fill-opacity="0.85"/>
</svg>"##,
        w = DEFAULT_PIN_WIDTH,
        h = DEFAULT_PIN_HEIGHT,
        color = color,
    )
}

fn rasterize_svg(svg: &str) -> Result<Pixmap> {
    let options = usvg::Options::default();
    let tree = usvg::Tree::from_str(svg, &options)
        .map_err(|e| RenderServerError::bad_request(format!("invalid SVG icon: {e}")))?;

    let size = tree.size();
    let width = size.width().ceil() as u32;
    let height = size.height().ceil() as u32;
    let mut pixmap = Pixmap::new(width.max(1), height.max(1))
        .ok_or_else(|| RenderServerError::Render("icon pixmap allocation failed".into()))?;
    resvg::render(&tree, tiny_skia::Transform::identity(), &mut pixmap.as_mut());
    Ok(pixmap)
}

fn decode_raster(data: &[u8]) -> Result<Pixmap> {
    let img = image::load_from_memory(data)
        .map_err(|e| RenderServerError::bad_request(format!("undecodable marker icon: {e}")))?
        .to_rgba8();
    rgba_to_pixmap(&img)
}

fn decode_icon_bytes(data: &[u8], looks_like_svg: bool) -> Result<Pixmap> {
    if looks_like_svg {
        let text = std::str::from_utf8(data)
            .map_err(|_| RenderServerError::bad_request("SVG icon is not UTF-8"))?;
        rasterize_svg(text)
    } else {
        decode_raster(data)
    }
}

fn decode_data_url(rest: &str) -> Result<Pixmap> {
    // data:[<mediatype>][;base64],<payload>
    let (meta, payload) = rest
        .split_once(',')
        .ok_or_else(|| RenderServerError::bad_request("malformed data URL"))?;

    let bytes = if meta.ends_with(";base64") {
        base64::engine::general_purpose::STANDARD
            .decode(payload)
            .map_err(|e| RenderServerError::bad_request(format!("invalid base64 icon: {e}")))?
    } else {
        urlencoding::decode_binary(payload.as_bytes()).into_owned()
    };

    decode_icon_bytes(&bytes, meta.contains("svg"))
}

async fn fetch_remote_icon(http: &reqwest::Client, url: &str) -> Result<Pixmap> {
    let response = http
        .get(url)
        .send()
        .await
        .map_err(|e| RenderServerError::Upstream(format!("icon fetch failed: {e}")))?;
    if !response.status().is_success() {
        return Err(RenderServerError::Upstream(format!(
            "icon fetch returned {}",
            response.status()
        )));
    }

    let svg = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.contains("svg"))
        .unwrap_or_else(|| url.split('?').next().unwrap_or(url).ends_with(".svg"));
    let bytes = response
        .bytes()
        .await
        .map_err(|e| RenderServerError::Upstream(format!("icon body read failed: {e}")))?;

    decode_icon_bytes(&bytes, svg)
}

async fn load_local_icon(policy: &IconPolicy, icon: &str) -> Result<Pixmap> {
    let dir = policy
        .icons_dir
        .as_ref()
        .ok_or_else(|| RenderServerError::bad_request("local marker icons are disabled"))?;

    let sanitized = icon.replace('\\', "/");
    let sanitized = sanitized.trim_start_matches('/');
    if sanitized.contains("..") || !policy.available_icons.contains(sanitized) {
        return Err(RenderServerError::bad_request(format!(
            "unknown marker icon {icon:?}"
        )));
    }

    let path = dir.join(sanitized);
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|e| RenderServerError::NotFound(format!("icon {}: {e}", path.display())))?;
    decode_icon_bytes(&bytes, sanitized.ends_with(".svg"))
}

/// Straight-alpha RGBA into a premultiplied pixmap.
pub(crate) fn rgba_to_pixmap(img: &image::RgbaImage) -> Result<Pixmap> {
    let (width, height) = img.dimensions();
    let mut data = Vec::with_capacity((width * height * 4) as usize);
    for pixel in img.pixels() {
        let [r, g, b, a] = pixel.0;
        let premultiply = |v: u8| ((u16::from(v) * u16::from(a)) / 255) as u8;
        data.extend_from_slice(&[premultiply(r), premultiply(g), premultiply(b), a]);
    }
    let size = tiny_skia::IntSize::from_wh(width, height)
        .ok_or_else(|| RenderServerError::Render("zero-size icon".into()))?;
    Pixmap::from_vec(data, size)
        .ok_or_else(|| RenderServerError::Render("icon pixmap allocation failed".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;

    #[test]
    fn default_pin_rasterizes_at_nominal_size() {
        let pixmap = rasterize_svg(&default_pin_svg(DEFAULT_PIN_COLOR)).unwrap();
        assert_eq!(pixmap.width(), DEFAULT_PIN_WIDTH);
        assert_eq!(pixmap.height(), DEFAULT_PIN_HEIGHT);
        // The pin body must contain the requested color somewhere.
        assert!(pixmap.pixels().iter().any(|p| p.alpha() > 0));
    }

    #[test]
    fn default_pin_color_is_applied() {
        let red = rasterize_svg(&default_pin_svg("#ff0000")).unwrap();
        let center = red.pixel(15, 30).unwrap().demultiply();
        assert!(center.red() > 180);
        assert!(center.green() < 80);
    }

    #[tokio::test]
    async fn inline_icons_respect_policy() {
        let png = {
            let img = image::RgbaImage::from_pixel(2, 2, image::Rgba([0, 255, 0, 255]));
            let mut cursor = std::io::Cursor::new(Vec::new());
            image::DynamicImage::ImageRgba8(img)
                .write_to(&mut cursor, image::ImageFormat::Png)
                .unwrap();
            cursor.into_inner()
        };
        let data_url = format!(
            "data:image/png;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(&png)
        );

        let marker = MarkerSpec {
            location: (0.0, 0.0),
            icon: data_url,
            scale: None,
            offset_x: 0.0,
            offset_y: 0.0,
            color: None,
        };

        let http = reqwest::Client::new();
        let allowing = IconPolicy::default();
        let loaded = load_marker_icons(std::slice::from_ref(&marker), &allowing, &http, 1)
            .await
            .unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].pixmap.width(), 2);

        let denying = IconPolicy {
            allow_inline: false,
            ..IconPolicy::default()
        };
        let loaded = load_marker_icons(std::slice::from_ref(&marker), &denying, &http, 1)
            .await
            .unwrap();
        assert!(loaded.is_empty());
    }

    #[tokio::test]
    async fn local_icons_must_be_listed() {
        let dir = tempfile::tempdir().unwrap();
        let img = image::RgbaImage::from_pixel(4, 4, image::Rgba([0, 0, 255, 255]));
        img.save(dir.path().join("pin.png")).unwrap();

        let policy = IconPolicy {
            icons_dir: Some(dir.path().to_path_buf()),
            available_icons: ["pin.png".to_string()].into(),
            ..IconPolicy::default()
        };

        assert!(load_local_icon(&policy, "pin.png").await.is_ok());
        assert!(load_local_icon(&policy, "other.png").await.is_err());
        assert!(load_local_icon(&policy, "../pin.png").await.is_err());
    }

    #[test]
    fn default_scale_compensates_for_canvas_ratio() {
        let marker = MarkerSpec {
            location: (0.0, 0.0),
            icon: String::new(),
            scale: Some(2.0),
            offset_x: 0.0,
            offset_y: 0.0,
            color: None,
        };
        let policy = IconPolicy::default();
        let http = reqwest::Client::new();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let loaded = runtime
            .block_on(load_marker_icons(std::slice::from_ref(&marker), &policy, &http, 2))
            .unwrap();
        assert_eq!(loaded[0].draw_scale, 1.0);
        assert_eq!(loaded[0].marker_scale, 2.0);
    }
}
