//! Overlay parsing and rasterization.
//!
//! Paths and markers arrive as query parameters, are projected into canvas
//! pixel space at the resolved zoom, and are drawn into an RGBA buffer that
//! the pipeline composites over the base render.

use image::RgbaImage;
use tiny_skia::{
    FillRule, LineCap, LineJoin, Paint, PathBuilder, Pixmap, PixmapPaint, Stroke, Transform,
};

use crate::error::{RenderServerError, Result};
use crate::projection;
use crate::render::markers::LoadedMarker;

/// Stroke color applied when neither the path nor the query set one.
const DEFAULT_STROKE: [u8; 4] = [0, 64, 255, 179];

/// An overlay path with optional per-path style overrides.
#[derive(Debug, Clone, PartialEq)]
pub struct PathSpec {
    pub points: Vec<(f64, f64)>,
    pub fill: Option<String>,
    pub stroke: Option<String>,
    pub width: Option<f32>,
}

impl PathSpec {
    /// Explicitly closed: first and last coordinates are equal.
    pub fn is_closed(&self) -> bool {
        self.points.len() >= 3 && self.points.first() == self.points.last()
    }
}

/// An overlay marker before icon resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct MarkerSpec {
    pub location: (f64, f64),
    pub icon: String,
    pub scale: Option<f64>,
    pub offset_x: f64,
    pub offset_y: f64,
    pub color: Option<String>,
}

/// Overlay-related query parameters shared by the static endpoints.
#[derive(Debug, Clone, Default)]
pub struct OverlayQuery {
    pub paths: Vec<PathSpec>,
    pub markers: Vec<MarkerSpec>,
    pub fill: Option<String>,
    pub stroke: Option<String>,
    pub width: Option<f32>,
    pub border: Option<String>,
    pub border_width: Option<f32>,
    pub line_cap: LineCap,
    pub line_join: LineJoin,
    pub padding: Option<f64>,
    pub maxzoom: Option<f64>,
    pub latlng: bool,
    pub attribution_text: Option<String>,
}

impl OverlayQuery {
    pub fn has_overlays(&self) -> bool {
        !self.paths.is_empty() || !self.markers.is_empty()
    }

    /// Every coordinate referenced by the overlay, for auto-fit.
    pub fn all_coordinates(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.paths
            .iter()
            .flat_map(|p| p.points.iter().copied())
            .chain(self.markers.iter().map(|m| m.location))
    }

    /// Parse repeatable overlay parameters from decoded query pairs.
    ///
    /// `latlng` is resolved first since it changes how later coordinate
    /// lists are read.
    pub fn from_pairs(pairs: &[(String, String)]) -> Result<Self> {
        let mut query = Self {
            latlng: pairs.iter().any(|(k, v)| {
                k == "latlng" && (v == "1" || v.eq_ignore_ascii_case("true"))
            }),
            ..Self::default()
        };

        for (key, value) in pairs {
            match key.as_str() {
                "path" => {
                    if let Some(path) = parse_path_spec(value, query.latlng) {
                        query.paths.push(path);
                    }
                }
                "marker" => {
                    if let Some(marker) = parse_marker_spec(value, query.latlng) {
                        query.markers.push(marker);
                    }
                }
                "fill" => query.fill = Some(value.clone()),
                "stroke" => query.stroke = Some(value.clone()),
                "width" => {
                    query.width = Some(value.parse().map_err(|_| {
                        RenderServerError::bad_request(format!("invalid width {value:?}"))
                    })?)
                }
                "border" => query.border = Some(value.clone()),
                "borderwidth" => {
                    query.border_width = Some(value.parse().map_err(|_| {
                        RenderServerError::bad_request(format!("invalid borderwidth {value:?}"))
                    })?)
                }
                "linecap" => query.line_cap = parse_line_cap(value)?,
                "linejoin" => query.line_join = parse_line_join(value)?,
                "padding" => {
                    query.padding = Some(value.parse().map_err(|_| {
                        RenderServerError::bad_request(format!("invalid padding {value:?}"))
                    })?)
                }
                "maxzoom" => {
                    query.maxzoom = Some(value.parse().map_err(|_| {
                        RenderServerError::bad_request(format!("invalid maxzoom {value:?}"))
                    })?)
                }
                "attributionText" | "attributiontext" => {
                    query.attribution_text = Some(value.clone())
                }
                _ => {}
            }
        }

        Ok(query)
    }
}

fn parse_line_cap(value: &str) -> Result<LineCap> {
    match value {
        "butt" => Ok(LineCap::Butt),
        "round" => Ok(LineCap::Round),
        "square" => Ok(LineCap::Square),
        _ => Err(RenderServerError::bad_request(format!(
            "invalid linecap {value:?}"
        ))),
    }
}

fn parse_line_join(value: &str) -> Result<LineJoin> {
    match value {
        "miter" => Ok(LineJoin::Miter),
        "round" => Ok(LineJoin::Round),
        "bevel" => Ok(LineJoin::Bevel),
        _ => Err(RenderServerError::bad_request(format!(
            "invalid linejoin {value:?}"
        ))),
    }
}

/// Parse one coordinate pair. Input order is `lng,lat` unless `latlng`.
pub fn parse_coordinate_pair(raw: &str, latlng: bool) -> Option<(f64, f64)> {
    let (first, second) = raw.split_once(',')?;
    let first: f64 = first.trim().parse().ok()?;
    let second: f64 = second.trim().parse().ok()?;
    if latlng {
        Some((second, first))
    } else {
        Some((first, second))
    }
}

/// Parse one `path=` value: optional `fill:`/`stroke:`/`width:` tokens
/// followed by either `enc:<polyline>` or a `lng,lat|lng,lat|…` list.
pub fn parse_path_spec(raw: &str, latlng: bool) -> Option<PathSpec> {
    let mut spec = PathSpec {
        points: Vec::new(),
        fill: None,
        stroke: None,
        width: None,
    };

    let mut offset = 0;
    for token in raw.split('|') {
        if let Some(color) = token.strip_prefix("fill:") {
            spec.fill = Some(color.to_string());
        } else if let Some(color) = token.strip_prefix("stroke:") {
            spec.stroke = Some(color.to_string());
        } else if let Some(width) = token.strip_prefix("width:") {
            spec.width = width.parse().ok();
        } else if token.starts_with("enc:") {
            // A polyline may itself contain '|'; decode from here to the end.
            let tail_start = offset + "enc:".len();
            spec.points = decode_polyline(&raw[tail_start..]);
            break;
        } else if let Some(point) = parse_coordinate_pair(token, latlng) {
            spec.points.push(point);
        }
        offset += token.len() + 1;
    }

    if spec.points.len() >= 2 {
        Some(spec)
    } else {
        None
    }
}

/// Parse one `marker=` value: `<lng,lat>|<icon>[|scale:N][|offset:X[,Y]][|color:C]`.
pub fn parse_marker_spec(raw: &str, latlng: bool) -> Option<MarkerSpec> {
    let mut tokens = raw.split('|');
    let location = parse_coordinate_pair(tokens.next()?, latlng)?;

    let mut spec = MarkerSpec {
        location,
        icon: String::new(),
        scale: None,
        offset_x: 0.0,
        offset_y: 0.0,
        color: None,
    };

    for (index, token) in tokens.enumerate() {
        if let Some(scale) = token.strip_prefix("scale:") {
            spec.scale = scale.parse::<f64>().ok().filter(|s| *s >= 0.0);
        } else if let Some(offset) = token.strip_prefix("offset:") {
            let (x, y) = match offset.split_once(',') {
                Some((x, y)) => (x, Some(y)),
                None => (offset, None),
            };
            spec.offset_x = x.parse().unwrap_or(0.0);
            spec.offset_y = y.and_then(|y| y.parse().ok()).unwrap_or(0.0);
        } else if let Some(color) = token.strip_prefix("color:") {
            spec.color = Some(color.to_string());
        } else if index == 0 {
            spec.icon = token.to_string();
        }
    }

    if spec.icon == "default" {
        spec.icon.clear();
    }

    Some(spec)
}

/// Decode a Google encoded polyline into `(lng, lat)` pairs.
pub fn decode_polyline(encoded: &str) -> Vec<(f64, f64)> {
    let bytes = encoded.as_bytes();
    let mut points = Vec::new();
    let mut index = 0;
    let mut lat = 0i64;
    let mut lng = 0i64;

    let mut next_value = |index: &mut usize| -> Option<i64> {
        let mut shift = 0;
        let mut result = 0i64;
        loop {
            if *index >= bytes.len() {
                return None;
            }
            let b = i64::from(bytes[*index]) - 63;
            *index += 1;
            result |= (b & 0x1f) << shift;
            shift += 5;
            if b < 0x20 {
                break;
            }
        }
        Some(if (result & 1) != 0 {
            !(result >> 1)
        } else {
            result >> 1
        })
    };

    while index < bytes.len() {
        let Some(dlat) = next_value(&mut index) else {
            break;
        };
        let Some(dlng) = next_value(&mut index) else {
            break;
        };
        lat += dlat;
        lng += dlng;
        points.push((lng as f64 / 1e5, lat as f64 / 1e5));
    }

    points
}

fn parse_color(raw: &str) -> Option<tiny_skia::Color> {
    let c = csscolorparser::parse(raw).ok()?.to_rgba8();
    Some(tiny_skia::Color::from_rgba8(c[0], c[1], c[2], c[3]))
}

/// Geometry and drawing context for one overlay pass.
pub struct OverlayContext<'a> {
    pub query: &'a OverlayQuery,
    pub center: (f64, f64),
    pub zoom: f64,
    pub bearing: f64,
    /// Logical canvas size; the pixel buffer is scaled by `scale`.
    pub width: u32,
    pub height: u32,
    pub scale: u8,
    pub markers: Vec<LoadedMarker>,
}

/// Rasterize paths and markers into a straight-alpha RGBA buffer, or `None`
/// when there is nothing to draw.
pub fn rasterize_overlay(ctx: OverlayContext<'_>) -> Result<Option<RgbaImage>> {
    if ctx.query.paths.is_empty() && ctx.markers.is_empty() {
        return Ok(None);
    }

    let scale = u32::from(ctx.scale.max(1));
    let mut pixmap = Pixmap::new(ctx.width * scale, ctx.height * scale)
        .ok_or_else(|| RenderServerError::Render("overlay canvas allocation failed".into()))?;

    let transform = canvas_transform(&ctx);

    draw_paths(&mut pixmap, &ctx, transform);
    draw_markers(&mut pixmap, &ctx.markers, ctx.zoom, transform);

    Ok(Some(demultiply(&pixmap)))
}

fn canvas_transform(ctx: &OverlayContext<'_>) -> Transform {
    let mut center_px = projection::px(ctx.center, ctx.zoom);

    // Keep the overlay aligned with the base render's camera clamping when
    // the window reaches past the poles.
    let world = projection::world_size(ctx.zoom);
    let half_h = f64::from(ctx.height) / 2.0;
    if center_px.1 - half_h < 0.0 {
        center_px.1 = half_h;
    }
    if center_px.1 + half_h > world {
        center_px.1 = world - half_h;
    }

    let scale = ctx.scale.max(1) as f32;
    let w = ctx.width as f32;
    let h = ctx.height as f32;
    let cx = center_px.0 as f32;
    let cy = center_px.1 as f32;

    let transform = Transform::from_scale(scale, scale);
    if ctx.bearing != 0.0 {
        transform
            .pre_translate(w / 2.0, h / 2.0)
            .pre_concat(Transform::from_rotate(-(ctx.bearing as f32)))
            .pre_translate(-cx, -cy)
    } else {
        transform.pre_translate(-cx + w / 2.0, -cy + h / 2.0)
    }
}

fn draw_paths(pixmap: &mut Pixmap, ctx: &OverlayContext<'_>, transform: Transform) {
    let query = ctx.query;

    for path in &query.paths {
        if path.points.len() < 2 {
            continue;
        }

        let mut builder = PathBuilder::new();
        let mut points = path.points.iter();
        let first = projection::precise_px(*points.next().expect("len checked"), ctx.zoom);
        builder.move_to(first.0 as f32, first.1 as f32);
        for point in points {
            let px = projection::precise_px(*point, ctx.zoom);
            builder.line_to(px.0 as f32, px.1 as f32);
        }
        if path.is_closed() {
            builder.close();
        }
        let Some(sk_path) = builder.finish() else {
            continue;
        };

        let mut paint = Paint::default();
        paint.anti_alias = true;

        if let Some(fill) = path.fill.as_deref().or(query.fill.as_deref()) {
            if let Some(color) = parse_color(fill) {
                paint.set_color(color);
                pixmap.fill_path(&sk_path, &paint, FillRule::Winding, transform, None);
            }
        }

        let line_width = path.width.or(query.width).unwrap_or(1.0);
        if line_width <= 0.0 {
            continue;
        }

        let stroke_color = path
            .stroke
            .as_deref()
            .or(query.stroke.as_deref())
            .and_then(parse_color)
            .unwrap_or_else(|| {
                tiny_skia::Color::from_rgba8(
                    DEFAULT_STROKE[0],
                    DEFAULT_STROKE[1],
                    DEFAULT_STROKE[2],
                    DEFAULT_STROKE[3],
                )
            });

        let stroke = Stroke {
            width: line_width,
            line_cap: query.line_cap,
            line_join: query.line_join,
            ..Stroke::default()
        };

        // An outlined path is stroked twice: border first, then the line.
        if let Some(border) = query.border.as_deref().and_then(parse_color) {
            let border_width = query.border_width.unwrap_or(line_width * 0.1);
            if border_width > 0.0 {
                paint.set_color(border);
                let border_stroke = Stroke {
                    width: line_width + 2.0 * border_width,
                    ..stroke.clone()
                };
                pixmap.stroke_path(&sk_path, &paint, &border_stroke, transform, None);
            }
        }

        paint.set_color(stroke_color);
        pixmap.stroke_path(&sk_path, &paint, &stroke, transform, None);
    }
}

fn draw_markers(
    pixmap: &mut Pixmap,
    markers: &[LoadedMarker],
    zoom: f64,
    transform: Transform,
) {
    for marker in markers {
        let px = projection::precise_px(marker.location, zoom);
        let width = marker.pixmap.width() as f32 * marker.draw_scale;
        let height = marker.pixmap.height() as f32 * marker.draw_scale;

        // Anchored center-bottom on the location.
        let x = px.0 as f32 - width / 2.0 + marker.offset_x * marker.marker_scale;
        let y = px.1 as f32 - height + marker.offset_y * marker.marker_scale;

        let placement = transform
            .pre_translate(x, y)
            .pre_scale(marker.draw_scale, marker.draw_scale);
        pixmap.draw_pixmap(
            0,
            0,
            marker.pixmap.as_ref(),
            &PixmapPaint::default(),
            placement,
            None,
        );
    }
}

fn demultiply(pixmap: &Pixmap) -> RgbaImage {
    let mut img = RgbaImage::new(pixmap.width(), pixmap.height());
    for (pixel, out) in pixmap.pixels().iter().zip(img.pixels_mut()) {
        let c = pixel.demultiply();
        out.0 = [c.red(), c.green(), c.blue(), c.alpha()];
    }
    img
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(entries: &[(&str, &str)]) -> Vec<(String, String)> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn coordinate_pair_order_and_swap() {
        assert_eq!(parse_coordinate_pair("8.5,47.3", false), Some((8.5, 47.3)));
        assert_eq!(parse_coordinate_pair("47.3,8.5", true), Some((8.5, 47.3)));
        assert_eq!(parse_coordinate_pair("nope", false), None);
        assert_eq!(parse_coordinate_pair("1,bad", false), None);
    }

    #[test]
    fn swapping_twice_is_identity() {
        let raw = "11.25,-3.5";
        let once = parse_coordinate_pair(raw, true).unwrap();
        let back = parse_coordinate_pair(&format!("{},{}", once.1, once.0), true).unwrap();
        assert_eq!(parse_coordinate_pair(raw, false), Some(back));
    }

    #[test]
    fn path_with_style_tokens() {
        let path =
            parse_path_spec("stroke:red|width:3|fill:rgba(0,0,0,0.2)|0,0|10,10|20,0", false)
                .unwrap();
        assert_eq!(path.points.len(), 3);
        assert_eq!(path.stroke.as_deref(), Some("red"));
        assert_eq!(path.fill.as_deref(), Some("rgba(0,0,0,0.2)"));
        assert_eq!(path.width, Some(3.0));
    }

    #[test]
    fn path_needs_two_points() {
        assert!(parse_path_spec("0,0", false).is_none());
        assert!(parse_path_spec("stroke:red", false).is_none());
        assert!(parse_path_spec("", false).is_none());
    }

    #[test]
    fn closed_path_detection() {
        let closed = parse_path_spec("0,0|5,0|5,5|0,0", false).unwrap();
        assert!(closed.is_closed());
        let open = parse_path_spec("0,0|5,0|5,5", false).unwrap();
        assert!(!open.is_closed());
    }

    #[test]
    fn polyline_decodes_the_reference_example() {
        let points = decode_polyline("_p~iF~ps|U_ulLnnqC_mqNvxq`@");
        assert_eq!(points.len(), 3);
        assert!((points[0].1 - 38.5).abs() < 1e-3);
        assert!((points[0].0 + 120.2).abs() < 1e-3);
        assert!((points[2].1 - 43.252).abs() < 1e-3);
        assert!((points[2].0 + 126.453).abs() < 1e-3);
    }

    #[test]
    fn enc_path_consumes_pipes() {
        // The reference polyline contains a '|'; everything after enc: is
        // the polyline.
        let path = parse_path_spec("width:2|enc:_p~iF~ps|U_ulLnnqC_mqNvxq`@", false).unwrap();
        assert_eq!(path.points.len(), 3);
        assert_eq!(path.width, Some(2.0));
    }

    #[test]
    fn marker_parsing_with_options() {
        let marker = parse_marker_spec(
            "8.5,47.3|default|scale:2|offset:4,-6|color:#ff0000",
            false,
        )
        .unwrap();
        assert_eq!(marker.location, (8.5, 47.3));
        assert!(marker.icon.is_empty());
        assert_eq!(marker.scale, Some(2.0));
        assert_eq!((marker.offset_x, marker.offset_y), (4.0, -6.0));
        assert_eq!(marker.color.as_deref(), Some("#ff0000"));
    }

    #[test]
    fn marker_without_icon_uses_default() {
        let marker = parse_marker_spec("0,10", true).unwrap();
        assert_eq!(marker.location, (10.0, 0.0));
        assert!(marker.icon.is_empty());
        assert_eq!(marker.scale, None);
    }

    #[test]
    fn negative_marker_scale_is_ignored() {
        let marker = parse_marker_spec("0,0|default|scale:-2", false).unwrap();
        assert_eq!(marker.scale, None);
    }

    #[test]
    fn query_collects_repeated_params() {
        let query = OverlayQuery::from_pairs(&pairs(&[
            ("path", "0,0|1,1"),
            ("path", "2,2|3,3"),
            ("marker", "0,0"),
            ("stroke", "#ff0000"),
            ("width", "4"),
            ("linecap", "round"),
            ("linejoin", "bevel"),
        ]))
        .unwrap();
        assert_eq!(query.paths.len(), 2);
        assert_eq!(query.markers.len(), 1);
        assert_eq!(query.stroke.as_deref(), Some("#ff0000"));
        assert_eq!(query.width, Some(4.0));
        assert_eq!(query.line_cap, LineCap::Round);
        assert_eq!(query.line_join, LineJoin::Bevel);
    }

    #[test]
    fn latlng_applies_regardless_of_parameter_order() {
        let query = OverlayQuery::from_pairs(&pairs(&[
            ("path", "10,20|30,40"),
            ("latlng", "1"),
        ]))
        .unwrap();
        assert_eq!(query.paths[0].points, vec![(20.0, 10.0), (40.0, 30.0)]);
    }

    #[test]
    fn invalid_numeric_params_are_rejected() {
        assert!(OverlayQuery::from_pairs(&pairs(&[("width", "wide")])).is_err());
        assert!(OverlayQuery::from_pairs(&pairs(&[("padding", "x")])).is_err());
        assert!(OverlayQuery::from_pairs(&pairs(&[("linecap", "fancy")])).is_err());
    }

    #[test]
    fn empty_overlay_rasterizes_to_none() {
        let query = OverlayQuery::default();
        let result = rasterize_overlay(OverlayContext {
            query: &query,
            center: (0.0, 0.0),
            zoom: 1.0,
            bearing: 0.0,
            width: 64,
            height: 64,
            scale: 1,
            markers: Vec::new(),
        })
        .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn diagonal_path_marks_the_canvas_center() {
        let query = OverlayQuery::from_pairs(&pairs(&[
            ("path", "-10,-10|10,10"),
            ("stroke", "#ff0000"),
            ("width", "4"),
        ]))
        .unwrap();

        let img = rasterize_overlay(OverlayContext {
            query: &query,
            center: (0.0, 0.0),
            zoom: 2.0,
            bearing: 0.0,
            width: 128,
            height: 128,
            scale: 1,
            markers: Vec::new(),
        })
        .unwrap()
        .unwrap();

        assert_eq!(img.dimensions(), (128, 128));
        let center = img.get_pixel(64, 64);
        assert!(center.0[3] > 0, "path must cross the projection center");
        assert!(center.0[0] > 128, "stroke should be red");
    }

    #[test]
    fn scale_doubles_the_buffer() {
        let query = OverlayQuery::from_pairs(&pairs(&[("path", "-10,0|10,0")])).unwrap();
        let img = rasterize_overlay(OverlayContext {
            query: &query,
            center: (0.0, 0.0),
            zoom: 1.0,
            bearing: 0.0,
            width: 100,
            height: 50,
            scale: 3,
            markers: Vec::new(),
        })
        .unwrap()
        .unwrap();
        assert_eq!(img.dimensions(), (300, 150));
    }

    #[test]
    fn default_stroke_color_applies() {
        let query = OverlayQuery::from_pairs(&pairs(&[("path", "-20,0|20,0"), ("width", "6")]))
            .unwrap();
        let img = rasterize_overlay(OverlayContext {
            query: &query,
            center: (0.0, 0.0),
            zoom: 1.0,
            bearing: 0.0,
            width: 64,
            height: 64,
            scale: 1,
            markers: Vec::new(),
        })
        .unwrap()
        .unwrap();

        let px = img.get_pixel(32, 32).0;
        assert!(px[2] > 200, "default stroke is strongly blue, got {px:?}");
        assert!(px[3] > 100 && px[3] < 220, "default stroke is translucent");
    }
}
